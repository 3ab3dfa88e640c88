//! TDK-Lambda Genesys power supply driver
//!
//! Several Genesys supplies can share one RS-485 line. Each has a numeric bus
//! address and only the supply most recently selected with `ADR n` listens to
//! requests. [`GenesysBus`] owns the channel and a cache of the selected
//! address, so a request to the already-selected supply goes out directly and
//! a request to the other supply is preceded by an address select.
//!
//! # Protocol
//!
//! Requests are ASCII terminated by `\r`. Every request is answered by exactly
//! one `\r`-terminated reply: `OK` for setters, the value for queries.
//!
//! # Address select
//!
//! `ADR n` must be acknowledged with `OK`. A missing or wrong reply is retried
//! up to [`ADDRESS_SELECT_RETRIES`] times; after that the call fails with
//! [`GenesysError::AddressSelectFailed`] and the cache is cleared, since the
//! state of the bus is no longer known.

mod channel;
mod errors;
pub mod mock;
mod status;

pub use channel::{SerialChannel, SerialPortChannel};
pub use errors::{GenesysError, GenesysResult};
pub use status::PsStatus;

use std::fmt;
use std::time::Duration;

use tracing::{debug, error, warn};

/// Retries after the first unacknowledged address select.
pub const ADDRESS_SELECT_RETRIES: u32 = 3;

/// Pause between sending `ADR n` and reading its acknowledgement.
pub const DEFAULT_SELECT_SETTLE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteMode {
    Local,
    Remote,
    LocalLockout,
}

impl RemoteMode {
    fn as_str(&self) -> &'static str {
        match self {
            RemoteMode::Local => "LOC",
            RemoteMode::Remote => "REM",
            RemoteMode::LocalLockout => "LLO",
        }
    }
}

/// One request in the Genesys command set.
#[derive(Debug, Clone, PartialEq)]
pub enum GenesysCommand {
    Identity,
    SerialNumber,
    RemoteMode,
    SetRemoteMode(RemoteMode),
    OutputStatus,
    SetOutput(bool),
    OperationMode,
    SetVoltage(f64),
    ProgrammedVoltage,
    MeasuredVoltage,
    SetCurrent(f64),
    ProgrammedCurrent,
    MeasuredCurrent,
    Status,
    VoltageAndCurrent,
    Setting,
}

impl GenesysCommand {
    /// Request text without the terminator.
    pub fn wire(&self) -> String {
        match self {
            GenesysCommand::Identity => "IDN?".into(),
            GenesysCommand::SerialNumber => "SN?".into(),
            GenesysCommand::RemoteMode => "RMT?".into(),
            GenesysCommand::SetRemoteMode(mode) => format!("RMT {}", mode.as_str()),
            GenesysCommand::OutputStatus => "OUT?".into(),
            GenesysCommand::SetOutput(on) => format!("OUT {}", if *on { "ON" } else { "OFF" }),
            GenesysCommand::OperationMode => "MODE?".into(),
            GenesysCommand::SetVoltage(volts) => format!("PV {volts:.3}"),
            GenesysCommand::ProgrammedVoltage => "PV?".into(),
            GenesysCommand::MeasuredVoltage => "MV?".into(),
            GenesysCommand::SetCurrent(amps) => format!("PC {amps:.3}"),
            GenesysCommand::ProgrammedCurrent => "PC?".into(),
            GenesysCommand::MeasuredCurrent => "MC?".into(),
            GenesysCommand::Status => "STT?".into(),
            GenesysCommand::VoltageAndCurrent => "DVC?".into(),
            GenesysCommand::Setting => "MS?".into(),
        }
    }

    /// Setters are acknowledged with `OK`.
    pub fn is_setter(&self) -> bool {
        matches!(
            self,
            GenesysCommand::SetRemoteMode(_)
                | GenesysCommand::SetOutput(_)
                | GenesysCommand::SetVoltage(_)
                | GenesysCommand::SetCurrent(_)
        )
    }
}

impl fmt::Display for GenesysCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.wire())
    }
}

/// The shared line plus the cache of which address is listening.
pub struct GenesysBus {
    channel: Box<dyn SerialChannel>,
    selected: Option<u8>,
    select_settle: Duration,
}

impl GenesysBus {
    pub fn new(channel: Box<dyn SerialChannel>) -> Self {
        Self {
            channel,
            selected: None,
            select_settle: DEFAULT_SELECT_SETTLE,
        }
    }

    /// Override the pause before reading an address acknowledgement.
    pub fn with_select_settle(mut self, settle: Duration) -> Self {
        self.select_settle = settle;
        self
    }

    /// Address that last acknowledged a select, if known.
    pub fn selected_address(&self) -> Option<u8> {
        self.selected
    }

    /// Make `address` the listening supply unless it already is.
    pub fn select(&mut self, address: u8) -> GenesysResult<()> {
        if self.selected == Some(address) {
            return Ok(());
        }

        let request = format!("ADR {address}");
        let attempts = ADDRESS_SELECT_RETRIES + 1;
        for attempt in 1..=attempts {
            self.channel.write_line(&request)?;
            if !self.select_settle.is_zero() {
                std::thread::sleep(self.select_settle);
            }

            match self.channel.read_line()? {
                Some(reply) if reply == "OK" => {
                    debug!(address, "address selected");
                    self.selected = Some(address);
                    return Ok(());
                }
                reply => {
                    if attempt < attempts {
                        warn!(address, attempt, ?reply, "supply did not acknowledge select, retrying");
                    }
                }
            }
        }

        error!(address, "failed to select supply");
        self.selected = None;
        Err(GenesysError::AddressSelectFailed { address, attempts })
    }

    /// Send one command to the supply at `address` and return its reply.
    pub fn execute(&mut self, address: u8, command: &GenesysCommand) -> GenesysResult<String> {
        self.select(address)?;

        let request = command.wire();
        self.channel.write_line(&request)?;
        let reply = self
            .channel
            .read_line()?
            .ok_or_else(|| GenesysError::NoReply {
                command: request.clone(),
            })?;

        if command.is_setter() && reply != "OK" {
            return Err(GenesysError::UnexpectedReply {
                command: request,
                reply,
            });
        }
        Ok(reply)
    }
}
