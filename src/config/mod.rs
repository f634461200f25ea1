// src/config/mod.rs
//! Configuration management for acquisition runs

pub mod constants;
pub mod device_config;
pub mod loader;

pub use constants::*;
pub use device_config::*;
pub use loader::{ConfigError, ConfigLoader};

use crate::error::ConfigValidationError;
use crate::hal::SimulatorConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Scheduling priority requested for the acquisition thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadPriority {
    Normal,
    High,
    #[serde(rename = "realtime")]
    RealTime,
}

/// Engine-wide acquisition settings
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct AcquisitionSettings {
    /// Ring buffer window, in seconds of data for all channels
    #[serde(default = "defaults::buffer_seconds")]
    pub buffer_seconds: u32,

    /// Transfers kept in flight per device
    #[serde(default = "defaults::queue_depth")]
    pub queue_depth: usize,

    #[serde(default = "defaults::transfer_timeout_ms")]
    pub transfer_timeout_ms: u64,

    #[serde(default = "defaults::thread_priority")]
    pub thread_priority: ThreadPriority,

    #[serde(default = "defaults::thread_name")]
    pub thread_name: String,
}

/// Complete configuration of an acquisition run
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct SystemConfig {
    #[serde(default)]
    pub acquisition: AcquisitionSettings,

    #[serde(default)]
    pub devices: DeviceConfigSet,

    pub simulator: Option<SimulatorConfig>,
}

/// Default value providers using constants
mod defaults {
    use super::ThreadPriority;
    use crate::config::constants::acquisition::*;

    pub fn buffer_seconds() -> u32 { DEFAULT_BUFFER_SECONDS }
    pub fn queue_depth() -> usize { DEFAULT_QUEUE_DEPTH }
    pub fn transfer_timeout_ms() -> u64 { DEFAULT_TRANSFER_TIMEOUT_MS }
    pub fn thread_priority() -> ThreadPriority { ThreadPriority::RealTime }
    pub fn thread_name() -> String { DEFAULT_THREAD_NAME.to_string() }
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            buffer_seconds: defaults::buffer_seconds(),
            queue_depth: defaults::queue_depth(),
            transfer_timeout_ms: defaults::transfer_timeout_ms(),
            thread_priority: defaults::thread_priority(),
            thread_name: defaults::thread_name(),
        }
    }
}

impl AcquisitionSettings {
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        let invalid = |field: &'static str, reason: String| ConfigValidationError::InvalidParameter {
            scope: "acquisition".to_string(),
            field,
            reason,
        };

        if self.queue_depth == 0 || self.queue_depth > acquisition::MAX_QUEUE_DEPTH {
            return Err(invalid(
                "queue_depth",
                format!("must be within 1..={}", acquisition::MAX_QUEUE_DEPTH),
            ));
        }
        if self.transfer_timeout_ms == 0 {
            return Err(invalid("transfer_timeout_ms", "must be greater than 0".to_string()));
        }
        if self.buffer_seconds == 0 {
            return Err(invalid("buffer_seconds", "must be greater than 0".to_string()));
        }
        Ok(())
    }
}

impl SystemConfig {
    /// Validate settings and every device entry on its own
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        self.acquisition.validate()?;
        for (serial, device) in self.devices.iter() {
            device.validate(serial)?;
        }
        Ok(())
    }

    /// Configuration summary for display/logging
    pub fn summary(&self) -> ConfigSummary {
        ConfigSummary {
            device_count: self.devices.len(),
            total_channels: self.devices.total_channel_count(),
            queue_depth: self.acquisition.queue_depth,
            buffer_seconds: self.acquisition.buffer_seconds,
            simulated: self.simulator.is_some(),
        }
    }
}

/// Configuration summary for display/logging
#[derive(Debug, Clone, Serialize)]
pub struct ConfigSummary {
    pub device_count: usize,
    pub total_channels: usize,
    pub queue_depth: usize,
    pub buffer_seconds: u32,
    pub simulated: bool,
}
