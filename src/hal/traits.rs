// src/hal/traits.rs
//! Device-control contract the acquisition core depends on

use crate::config::constants::device::HEADER_SIZE_BYTES;
use crate::hal::types::{
    AnalogOut, BipolarSettings, CommonGround, CommonReference, DeviceHandle, DriverError,
    DriverResult, DrlChannels, OperationMode, TransferRequest, WaitOutcome,
};
use std::sync::Arc;
use std::time::Duration;

/// Low-level control surface of one amplifier model
///
/// All calls are synchronous except [`submit_read`](Self::submit_read), which returns
/// immediately and signals completion through the request's event.
pub trait AmplifierDriver: Send + Sync {
    /// Open the device with the given serial number
    fn open(&self, serial: &str) -> DriverResult<DeviceHandle>;

    /// Release the device; consumes the handle
    fn close(&self, handle: DeviceHandle) -> DriverResult<()>;

    fn set_channels(&self, handle: &DeviceHandle, channels: &[u8]) -> DriverResult<()>;

    fn set_sample_rate(&self, handle: &DeviceHandle, sample_rate_hz: u16) -> DriverResult<()>;

    fn enable_trigger_line(&self, handle: &DeviceHandle, enabled: bool) -> DriverResult<()>;

    /// Number of scans delivered per transfer
    fn set_buffer_size(&self, handle: &DeviceHandle, scans: u16) -> DriverResult<()>;

    /// `None` removes any bandpass filter from the channel
    fn set_bandpass(&self, handle: &DeviceHandle, channel: u8, filter: Option<u16>) -> DriverResult<()>;

    /// `None` removes any notch filter from the channel
    fn set_notch(&self, handle: &DeviceHandle, channel: u8, filter: Option<u16>) -> DriverResult<()>;

    fn set_slave(&self, handle: &DeviceHandle, is_slave: bool) -> DriverResult<()>;

    fn enable_short_cut(&self, handle: &DeviceHandle, enabled: bool) -> DriverResult<()>;

    fn set_bipolar(&self, handle: &DeviceHandle, settings: &BipolarSettings) -> DriverResult<()>;

    fn set_mode(&self, handle: &DeviceHandle, mode: OperationMode) -> DriverResult<()>;

    fn set_reference(&self, handle: &DeviceHandle, reference: &CommonReference) -> DriverResult<()>;

    fn set_ground(&self, handle: &DeviceHandle, ground: &CommonGround) -> DriverResult<()>;

    fn set_analog_out(&self, handle: &DeviceHandle, settings: &AnalogOut) -> DriverResult<()>;

    fn set_drl_channels(&self, handle: &DeviceHandle, channels: &DrlChannels) -> DriverResult<()>;

    fn start(&self, handle: &DeviceHandle) -> DriverResult<()>;

    fn stop(&self, handle: &DeviceHandle) -> DriverResult<()>;

    /// Discard all pending transfers of the device
    fn reset_transfer(&self, handle: &DeviceHandle) -> DriverResult<()>;

    /// Queue an asynchronous read filling `request`; never blocks
    fn submit_read(&self, handle: &DeviceHandle, request: &Arc<TransferRequest>) -> DriverResult<()>;

    fn wait_for_completion(&self, request: &TransferRequest, timeout: Duration) -> WaitOutcome {
        if request.wait(timeout) {
            WaitOutcome::Completed
        } else {
            WaitOutcome::TimedOut
        }
    }

    fn completed_byte_count(&self, _handle: &DeviceHandle, request: &TransferRequest) -> DriverResult<usize> {
        Ok(request.transferred())
    }

    /// Last error the driver recorded for this device, if any
    fn last_error(&self, _handle: &DeviceHandle) -> Option<DriverError> {
        None
    }

    /// Bytes preceding the scan data in every transfer
    fn header_size(&self) -> usize {
        HEADER_SIZE_BYTES
    }
}
