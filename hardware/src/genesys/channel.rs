//! Half-duplex byte channel shared by every supply on the bus.

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use serialport::SerialPort;
use tracing::{debug, info};

use super::errors::{GenesysError, GenesysResult};

/// Request/reply transport carrying carriage-return terminated ASCII lines.
pub trait SerialChannel: Send {
    /// Send one request; the terminator is appended by the channel.
    fn write_line(&mut self, line: &str) -> GenesysResult<()>;

    /// Read one reply up to the terminator, trimmed.
    ///
    /// `Ok(None)` means nothing arrived before the read timeout.
    fn read_line(&mut self) -> GenesysResult<Option<String>>;
}

impl<T: SerialChannel + ?Sized> SerialChannel for Box<T> {
    fn write_line(&mut self, line: &str) -> GenesysResult<()> {
        (**self).write_line(line)
    }

    fn read_line(&mut self) -> GenesysResult<Option<String>> {
        (**self).read_line()
    }
}

/// RS-232/485 port opened through the `serialport` crate.
pub struct SerialPortChannel {
    port: Box<dyn SerialPort>,
}

impl SerialPortChannel {
    /// Open `path` at 8N1 with the given baud rate and read timeout.
    pub fn open(path: &str, baud_rate: u32, timeout: Duration) -> GenesysResult<Self> {
        info!("Opening serial port: {path} at {baud_rate} bps");
        let port = serialport::new(path, baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(timeout)
            .open()
            .map_err(|e| GenesysError::Io(format!("failed to open {path}: {e}")))?;
        Ok(Self { port })
    }

    pub fn from_port(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }
}

impl SerialChannel for SerialPortChannel {
    fn write_line(&mut self, line: &str) -> GenesysResult<()> {
        debug!("-> {line}");
        self.port.write_all(line.as_bytes())?;
        self.port.write_all(b"\r")?;
        self.port.flush()?;
        Ok(())
    }

    fn read_line(&mut self) -> GenesysResult<Option<String>> {
        let mut buffer = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match self.port.read(&mut byte) {
                Ok(0) => break,
                Ok(_) if byte[0] == b'\r' => break,
                Ok(_) => buffer.push(byte[0]),
                Err(e) if e.kind() == ErrorKind::TimedOut => break,
                Err(e) => return Err(e.into()),
            }
        }

        let reply = String::from_utf8_lossy(&buffer).trim().to_string();
        debug!("<- {reply}");
        Ok((!reply.is_empty()).then_some(reply))
    }
}
