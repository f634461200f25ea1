//! AmpSync-Core: synchronized multi-amplifier data acquisition
//!
//! Several amplifiers wired in a master/slave chain are opened, configured and started
//! slaves first. A dedicated thread keeps a fixed number of reads in flight per device,
//! merges the completed transfers into one scan-ordered float stream and publishes it
//! into a bounded window buffer that consumers drain at their own pace.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use ampsync_core::acquisition::AcquisitionEngine;
//! use ampsync_core::config::{AcquisitionSettings, DeviceConfigSet};
//! use ampsync_core::hal::{AmplifierSimulator, SimulatorConfig};
//! use std::sync::Arc;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let driver = Arc::new(AmplifierSimulator::new(SimulatorConfig::default()));
//!     let engine = AcquisitionEngine::new(driver, AcquisitionSettings::default());
//!
//!     engine.start_acquisition(&DeviceConfigSet::with_defaults(&["UB-2008.07.01"]))?;
//!     let samples = engine.read_data(512 * engine.total_channels());
//!     println!("read {} samples", samples.len());
//!     engine.stop_acquisition();
//!
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]

pub mod acquisition;
pub mod config;
pub mod error;
pub mod hal;

// Re-export commonly used types for convenience
pub use acquisition::{AcquisitionEngine, AcquisitionStats, EngineState, WindowedBuffer};
pub use config::{AcquisitionSettings, ConfigLoader, DeviceConfig, DeviceConfigSet, SystemConfig};
pub use error::{AcquisitionError, AcquisitionResult, BufferError, ConfigValidationError};
pub use hal::{AmplifierDriver, AmplifierSimulator, DriverError, SimulatorConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Get library information
pub fn version_info() -> VersionInfo {
    VersionInfo {
        name: NAME.to_string(),
        version: VERSION.to_string(),
        description: "Synchronized multi-amplifier data acquisition core".to_string(),
        features: vec![
            "Master/slave device sessions".to_string(),
            "Pipelined asynchronous transfers".to_string(),
            "Scan-ordered reassembly".to_string(),
            "Windowed ring buffer".to_string(),
            "Simulated amplifier driver".to_string(),
        ],
    }
}

/// Library version information
#[derive(Debug, Clone)]
pub struct VersionInfo {
    /// Library name
    pub name: String,
    /// Version string
    pub version: String,
    /// Description
    pub description: String,
    /// List of features
    pub features: Vec<String>,
}
