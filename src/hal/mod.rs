// src/hal/mod.rs
//! Hardware Abstraction Layer for amplifier devices

pub mod simulator;
pub mod traits;
pub mod types;

pub use simulator::{AmplifierSimulator, FaultPlan, SimulatorConfig, SimulatorStats, TransferFault, Waveform};
pub use traits::*;
pub use types::*;
