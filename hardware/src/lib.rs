//! Hardware interfaces for the beam focusing bench.
//!
//! - [`genesys`]: TDK-Lambda Genesys supplies sharing one serial line
//! - [`ps_controller`]: serialized command queue and status refresh for the
//!   two quadrupole supplies

pub mod genesys;
pub mod ps_controller;

pub use genesys::{GenesysBus, GenesysCommand, GenesysError, PsStatus, SerialPortChannel};
pub use ps_controller::{PowerSupplyControl, PsController, PsError, PsSnapshot, Supply};
