//! In-memory Genesys bus for tests and simulation.
//!
//! Emulates any number of supplies sharing one line: address select, the
//! query/setter command set and the `STT?` status format. Handles are cheap
//! clones of the same bus, so a test can keep one to inspect traffic and
//! programmed values while another is owned by the driver.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::channel::SerialChannel;
use super::errors::GenesysResult;

#[derive(Debug, Clone, Copy, Default)]
struct SupplyState {
    output: bool,
    remote: bool,
    programmed_voltage: f64,
    programmed_current: f64,
    responsive: bool,
}

#[derive(Debug, Default)]
struct BusState {
    supplies: HashMap<u8, SupplyState>,
    listening: Option<u8>,
    pending: Option<String>,
    written: Vec<String>,
    drop_replies: usize,
    reply_delay: Duration,
}

#[derive(Clone, Default)]
pub struct MockGenesysBus {
    state: Arc<Mutex<BusState>>,
}

impl MockGenesysBus {
    /// Bus with one responsive supply at each address.
    pub fn new(addresses: &[u8]) -> Self {
        let supplies = addresses
            .iter()
            .map(|&address| {
                (
                    address,
                    SupplyState {
                        responsive: true,
                        programmed_voltage: 10.0,
                        ..Default::default()
                    },
                )
            })
            .collect();
        Self {
            state: Arc::new(Mutex::new(BusState {
                supplies,
                ..Default::default()
            })),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make a supply stop answering (or answer again).
    pub fn set_responsive(&self, address: u8, responsive: bool) {
        if let Some(supply) = self.state().supplies.get_mut(&address) {
            supply.responsive = responsive;
        }
    }

    /// Swallow the next `n` replies regardless of the request.
    pub fn drop_next_replies(&self, n: usize) {
        self.state().drop_replies = n;
    }

    /// Delay every reply, emulating a slow line.
    pub fn set_reply_delay(&self, delay: Duration) {
        self.state().reply_delay = delay;
    }

    /// Every request written so far, without terminators.
    pub fn written(&self) -> Vec<String> {
        self.state().written.clone()
    }

    pub fn clear_written(&self) {
        self.state().written.clear();
    }

    /// Number of `ADR` requests sent for `address`.
    pub fn select_count(&self, address: u8) -> usize {
        let request = format!("ADR {address}");
        self.state()
            .written
            .iter()
            .filter(|line| **line == request)
            .count()
    }

    pub fn programmed_current(&self, address: u8) -> Option<f64> {
        self.state()
            .supplies
            .get(&address)
            .map(|s| s.programmed_current)
    }

    pub fn output_on(&self, address: u8) -> Option<bool> {
        self.state().supplies.get(&address).map(|s| s.output)
    }
}

fn respond(supply: &mut SupplyState, address: u8, line: &str) -> String {
    let (name, argument) = match line.split_once(' ') {
        Some((name, argument)) => (name, Some(argument.trim())),
        None => (line, None),
    };
    let measured_voltage = if supply.output {
        supply.programmed_voltage
    } else {
        0.0
    };
    let measured_current = if supply.output {
        supply.programmed_current
    } else {
        0.0
    };
    let ok = || "OK".to_string();
    let parse = |arg: Option<&str>| arg.and_then(|a| a.parse::<f64>().ok());

    match (name, argument) {
        ("IDN?", None) => format!("LAMBDA,GEN8-90,SIM-{address},REV:2U:4.0"),
        ("SN?", None) => format!("SIM{address:05}"),
        ("RMT?", None) => if supply.remote { "REM" } else { "LOC" }.to_string(),
        ("RMT", Some("LOC")) => {
            supply.remote = false;
            ok()
        }
        ("RMT", Some("REM" | "LLO")) => {
            supply.remote = true;
            ok()
        }
        ("OUT?", None) => if supply.output { "ON" } else { "OFF" }.to_string(),
        ("OUT", Some("ON" | "1")) => {
            supply.output = true;
            ok()
        }
        ("OUT", Some("OFF" | "0")) => {
            supply.output = false;
            ok()
        }
        ("MODE?", None) => if supply.output { "CC" } else { "OFF" }.to_string(),
        ("PV", arg) => match parse(arg) {
            Some(v) => {
                supply.programmed_voltage = v;
                ok()
            }
            None => "E01".to_string(),
        },
        ("PV?", None) => format!("{:.3}", supply.programmed_voltage),
        ("MV?", None) => format!("{measured_voltage:.3}"),
        ("PC", arg) => match parse(arg) {
            Some(v) => {
                supply.programmed_current = v;
                ok()
            }
            None => "E01".to_string(),
        },
        ("PC?", None) => format!("{:.3}", supply.programmed_current),
        ("MC?", None) => format!("{measured_current:.3}"),
        ("STT?", None) => format!(
            "MV({measured_voltage:.3}),PV({:.3}),MC({measured_current:.3}),PC({:.3}),SR(30),FR(00)",
            supply.programmed_voltage, supply.programmed_current
        ),
        ("DVC?", None) => format!(
            "{measured_voltage:.3},{:.3},{measured_current:.3},{:.3},0.000,0.000",
            supply.programmed_voltage, supply.programmed_current
        ),
        ("MS?", None) => "0".to_string(),
        _ => "C03".to_string(),
    }
}

impl SerialChannel for MockGenesysBus {
    fn write_line(&mut self, line: &str) -> GenesysResult<()> {
        let mut guard = self.state();
        let state = &mut *guard;
        state.written.push(line.to_string());

        if let Some(address) = line
            .strip_prefix("ADR ")
            .and_then(|a| a.trim().parse::<u8>().ok())
        {
            let responsive = state
                .supplies
                .get(&address)
                .is_some_and(|supply| supply.responsive);
            state.listening = responsive.then_some(address);
            state.pending = responsive.then(|| "OK".to_string());
            return Ok(());
        }

        state.pending = match state.listening {
            Some(address) => state
                .supplies
                .get_mut(&address)
                .filter(|supply| supply.responsive)
                .map(|supply| respond(supply, address, line)),
            None => None,
        };
        Ok(())
    }

    fn read_line(&mut self) -> GenesysResult<Option<String>> {
        let delay = self.state().reply_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let mut state = self.state();
        let reply = state.pending.take();
        if state.drop_replies > 0 {
            state.drop_replies -= 1;
            return Ok(None);
        }
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_selected_supply_answers() {
        let mut bus = MockGenesysBus::new(&[6, 7]);

        bus.write_line("IDN?").unwrap();
        assert_eq!(bus.read_line().unwrap(), None);

        bus.write_line("ADR 7").unwrap();
        assert_eq!(bus.read_line().unwrap().as_deref(), Some("OK"));
        bus.write_line("PC 3.250").unwrap();
        assert_eq!(bus.read_line().unwrap().as_deref(), Some("OK"));
        assert_eq!(bus.programmed_current(7), Some(3.25));
        assert_eq!(bus.programmed_current(6), Some(0.0));
    }

    #[test]
    fn test_status_reflects_output() {
        let mut bus = MockGenesysBus::new(&[6]);
        bus.write_line("ADR 6").unwrap();
        bus.read_line().unwrap();
        bus.write_line("PC 1.5").unwrap();
        bus.read_line().unwrap();

        bus.write_line("STT?").unwrap();
        let off = bus.read_line().unwrap().unwrap();
        assert!(off.starts_with("MV(0.000),PV(10.000),MC(0.000),PC(1.500)"));

        bus.write_line("OUT ON").unwrap();
        bus.read_line().unwrap();
        bus.write_line("MC?").unwrap();
        assert_eq!(bus.read_line().unwrap().as_deref(), Some("1.500"));
    }

    #[test]
    fn test_unresponsive_supply_ignores_select() {
        let mut bus = MockGenesysBus::new(&[6]);
        bus.set_responsive(6, false);
        bus.write_line("ADR 6").unwrap();
        assert_eq!(bus.read_line().unwrap(), None);
    }
}
