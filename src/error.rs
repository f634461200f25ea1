// src/error.rs
//! Unified error handling for the acquisition core
//!
//! Errors fall into four groups: configuration validation (rejected before any device
//! is touched), device errors surfaced by the amplifier driver, fatal steady-state
//! transfer errors that tear the pipeline down, and local contract violations of the
//! windowed buffer API.

use crate::hal::DriverError;
use thiserror::Error;

/// Configuration set rejected before any device was opened
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigValidationError {
    #[error("no devices have been configured")]
    NoDevices,

    #[error("no device has been configured as master")]
    NoMasterConfigured,

    #[error("couldn't configure device {serial} as master: {existing} is already configured as master")]
    MultipleMastersConfigured { serial: String, existing: String },

    #[error("invalid sample rate for device {serial}: {actual} Hz, all devices must run at {expected} Hz")]
    SampleRateMismatch {
        serial: String,
        expected: u16,
        actual: u16,
    },

    #[error("invalid number of scans for device {serial}: {actual}, all devices must transfer {expected} scans")]
    ScanCountMismatch {
        serial: String,
        expected: u16,
        actual: u16,
    },

    #[error("device {serial} has no channels selected")]
    NoChannelsSelected { serial: String },

    #[error("device {serial}: channel {channel} is outside 1..={max}")]
    InvalidChannel { serial: String, channel: u8, max: u8 },

    #[error("device {serial}: channel {channel} is selected more than once")]
    DuplicateChannel { serial: String, channel: u8 },

    #[error("device {serial}: filter assigned to channel {channel} outside 1..={max}")]
    InvalidFilterChannel { serial: String, channel: u8, max: u8 },

    #[error("invalid {field} for {scope}: {reason}")]
    InvalidParameter {
        scope: String,
        field: &'static str,
        reason: String,
    },
}

/// Contract violations on the windowed buffer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("the buffer is empty")]
    Empty,

    #[error("index {index} is out of range for a buffer holding {count} elements")]
    IndexOutOfRange { index: usize, count: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("buffer overflow: {incoming} elements incoming, {available} of {capacity} free")]
    Overflow {
        capacity: usize,
        available: usize,
        incoming: usize,
    },
}

/// Top level error for everything the acquisition engine does
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AcquisitionError {
    #[error("invalid device configuration: {0}")]
    ConfigValidation(#[from] ConfigValidationError),

    #[error("device {serial} failed during {operation}: {source}")]
    Device {
        serial: String,
        operation: &'static str,
        #[source]
        source: DriverError,
    },

    #[error("error on data transfer from device {serial} (slot {slot}): no completion within {timeout_ms} ms")]
    TransferTimeout {
        serial: String,
        slot: usize,
        timeout_ms: u64,
    },

    #[error("error on data transfer from device {serial}: samples lost ({received} of {expected} bytes received)")]
    DataLoss {
        serial: String,
        expected: usize,
        received: usize,
    },

    #[error("error on writing data to buffer: {incoming} samples incoming but only {available} of {capacity} free")]
    BufferOverflow {
        capacity: usize,
        available: usize,
        incoming: usize,
    },

    #[error(transparent)]
    Buffer(BufferError),

    #[error("data acquisition is already running")]
    AlreadyRunning,

    #[error("couldn't spawn acquisition thread: {0}")]
    Spawn(String),
}

impl AcquisitionError {
    /// Wrap a driver failure with the device and operation it happened on
    pub fn device(serial: impl Into<String>, operation: &'static str, source: DriverError) -> Self {
        AcquisitionError::Device {
            serial: serial.into(),
            operation,
            source,
        }
    }

    /// Errors that end a running acquisition and force a full teardown
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AcquisitionError::Device { .. }
                | AcquisitionError::TransferTimeout { .. }
                | AcquisitionError::DataLoss { .. }
                | AcquisitionError::BufferOverflow { .. }
        )
    }

    /// Underlying driver error code, if the failure came from the device
    pub fn driver_code(&self) -> Option<u16> {
        match self {
            AcquisitionError::Device { source, .. } => Some(source.code),
            _ => None,
        }
    }
}

impl From<BufferError> for AcquisitionError {
    fn from(err: BufferError) -> Self {
        match err {
            BufferError::Overflow {
                capacity,
                available,
                incoming,
            } => AcquisitionError::BufferOverflow {
                capacity,
                available,
                incoming,
            },
            other => AcquisitionError::Buffer(other),
        }
    }
}

/// Result type alias for acquisition operations
pub type AcquisitionResult<T> = Result<T, AcquisitionError>;
