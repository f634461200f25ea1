// src/hal/types.rs
//! Core types shared between the acquisition core and amplifier drivers

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Error code and message reported by the amplifier driver
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (error code {code})")]
pub struct DriverError {
    pub code: u16,
    pub message: String,
}

impl DriverError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Opaque handle to an opened amplifier
///
/// Deliberately neither `Clone` nor `Copy`: the handle is owned by exactly one
/// session and is consumed by [`AmplifierDriver::close`](crate::hal::AmplifierDriver::close).
#[derive(Debug, PartialEq, Eq)]
pub struct DeviceHandle {
    id: u64,
    serial: String,
}

impl DeviceHandle {
    /// Create a handle; intended for driver implementations only
    pub fn new(id: u64, serial: impl Into<String>) -> Self {
        Self {
            id,
            serial: serial.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.serial, self.id)
    }
}

/// Operation modes of the amplifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationMode {
    /// Acquire data from the input channels
    #[default]
    Normal,
    /// Measure electrode impedance
    Impedance,
    /// Apply the calibration signal onto all input channels
    Calibrate,
    /// Counter on the last channel; requires `Normal` to be set first
    Counter,
}

impl OperationMode {
    /// Common reference and ground groups only apply to these modes
    pub fn uses_reference_groups(self) -> bool {
        matches!(self, OperationMode::Normal | OperationMode::Counter)
    }
}

/// Common ground group connections (groups A-D)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonGround {
    pub groups: [bool; 4],
}

/// Common reference group connections (groups A-D)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonReference {
    pub groups: [bool; 4],
}

/// Bipolar derivation partner for each channel, 0 meaning none
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BipolarSettings {
    pub partners: [u8; 16],
}

/// Channels connected to the driven right leg circuit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrlChannels {
    pub channels: [bool; 16],
}

/// Wave shapes of the internal signal generator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaveShape {
    Square,
    Sawtooth,
    Sine,
    Drl,
    Noise,
}

/// Internal signal generator (DAC) settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalogOut {
    pub wave_shape: WaveShape,
    pub amplitude: u16,
    pub frequency_hz: u16,
    pub offset: u16,
}

impl Default for AnalogOut {
    fn default() -> Self {
        Self {
            wave_shape: WaveShape::Sine,
            amplitude: 2000,
            frequency_hz: 10,
            offset: 2047,
        }
    }
}

/// Result of waiting on a transfer completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Completed,
    TimedOut,
}

/// Manual-reset completion event
///
/// Stays signalled after `set` until `reset` is called.
#[derive(Debug, Default)]
pub struct CompletionEvent {
    signalled: Mutex<bool>,
    cond: Condvar,
}

impl CompletionEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        let mut signalled = self.signalled.lock();
        *signalled = true;
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        *self.signalled.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.signalled.lock()
    }

    /// Block until signalled or until `timeout` elapses; returns whether it was signalled
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut signalled = self.signalled.lock();
        while !*signalled {
            if self.cond.wait_until(&mut signalled, deadline).timed_out() {
                return *signalled;
            }
        }
        true
    }
}

/// One asynchronous read request: receive buffer, completion event and byte count
///
/// The buffer and the event live and die together; drivers keep an `Arc` to the
/// request while the transfer is in flight.
#[derive(Debug)]
pub struct TransferRequest {
    buffer: Mutex<Vec<u8>>,
    completion: CompletionEvent,
    transferred: AtomicUsize,
}

impl TransferRequest {
    /// Allocate a zeroed receive buffer of `len` bytes
    pub fn new(len: usize) -> Self {
        Self {
            buffer: Mutex::new(vec![0u8; len]),
            completion: CompletionEvent::new(),
            transferred: AtomicUsize::new(0),
        }
    }

    /// Size of the receive buffer in bytes
    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Driver side: fill the buffer in place, record the byte count and signal completion
    pub fn complete_with<F>(&self, fill: F)
    where
        F: FnOnce(&mut [u8]) -> usize,
    {
        {
            let mut buffer = self.buffer.lock();
            let written = fill(&mut buffer[..]).min(buffer.len());
            self.transferred.store(written, Ordering::Release);
        }
        self.completion.set();
    }

    /// Driver side: copy `data` into the buffer and signal completion
    pub fn complete(&self, data: &[u8]) {
        self.complete_with(|buffer| {
            let n = data.len().min(buffer.len());
            buffer[..n].copy_from_slice(&data[..n]);
            n
        });
    }

    /// Bytes transferred by the last completion
    pub fn transferred(&self) -> usize {
        self.transferred.load(Ordering::Acquire)
    }

    pub fn is_completed(&self) -> bool {
        self.completion.is_set()
    }

    pub fn wait(&self, timeout: Duration) -> bool {
        self.completion.wait_timeout(timeout)
    }

    /// Clear the completion state before the request is submitted again
    pub fn rearm(&self) {
        self.transferred.store(0, Ordering::Release);
        self.completion.reset();
    }

    /// Locked view of the receive buffer
    pub fn payload(&self) -> MutexGuard<'_, Vec<u8>> {
        self.buffer.lock()
    }
}
