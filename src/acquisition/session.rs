// src/acquisition/session.rs
//! Device session manager: validation, master-last call order, open/configure/close

use crate::config::constants::device::MAX_CHANNELS;
use crate::config::{DeviceConfig, DeviceConfigSet};
use crate::error::{AcquisitionError, AcquisitionResult, ConfigValidationError};
use crate::hal::{AmplifierDriver, DeviceHandle, DriverError, DriverResult, OperationMode, TransferRequest};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// An opened device bound to its configuration
///
/// The handle is owned exclusively and released exactly once, by [`close`](Self::close).
#[derive(Debug)]
pub struct DeviceSession {
    serial: String,
    handle: Option<DeviceHandle>,
    config: DeviceConfig,
}

impl DeviceSession {
    fn new(serial: &str, handle: DeviceHandle, config: &DeviceConfig) -> Self {
        Self {
            serial: serial.to_string(),
            handle: Some(handle),
            config: config.clone(),
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Values per scan, trigger line included
    pub fn channel_count(&self) -> usize {
        self.config.channel_count()
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    pub fn handle(&self) -> Option<&DeviceHandle> {
        self.handle.as_ref()
    }

    fn open_handle(&self, operation: &'static str) -> AcquisitionResult<&DeviceHandle> {
        self.handle.as_ref().ok_or_else(|| {
            AcquisitionError::device(
                &self.serial,
                operation,
                DriverError::new(0, "device session already closed"),
            )
        })
    }

    /// Wrap a driver call on this session's handle
    fn call<D, T, F>(&self, driver: &D, operation: &'static str, f: F) -> AcquisitionResult<T>
    where
        D: AmplifierDriver + ?Sized,
        F: FnOnce(&D, &DeviceHandle) -> DriverResult<T>,
    {
        let handle = self.open_handle(operation)?;
        f(driver, handle).map_err(|e| AcquisitionError::device(&self.serial, operation, e))
    }

    /// Apply the whole configuration in the order the amplifier requires
    fn configure<D: AmplifierDriver + ?Sized>(&self, driver: &D) -> AcquisitionResult<()> {
        let config = &self.config;

        self.call(driver, "set_channels", |d, h| d.set_channels(h, &config.selected_channels))?;
        self.call(driver, "set_sample_rate", |d, h| d.set_sample_rate(h, config.sample_rate_hz))?;
        self.call(driver, "enable_trigger_line", |d, h| {
            d.enable_trigger_line(h, config.trigger_line_enabled)
        })?;
        self.call(driver, "set_buffer_size", |d, h| d.set_buffer_size(h, config.scans_per_transfer))?;

        // every channel gets a filter setting, absent ones are reset
        for channel in 1..=MAX_CHANNELS {
            let bandpass = config.bandpass_filters.get(&channel).copied();
            let notch = config.notch_filters.get(&channel).copied();
            self.call(driver, "set_bandpass", |d, h| d.set_bandpass(h, channel, bandpass))?;
            self.call(driver, "set_notch", |d, h| d.set_notch(h, channel, notch))?;
        }

        self.call(driver, "set_slave", |d, h| d.set_slave(h, config.is_slave))?;
        self.call(driver, "enable_short_cut", |d, h| d.enable_short_cut(h, config.short_cut_enabled))?;
        self.call(driver, "set_bipolar", |d, h| d.set_bipolar(h, &config.bipolar))?;

        if config.mode == OperationMode::Counter {
            self.call(driver, "set_mode", |d, h| d.set_mode(h, OperationMode::Normal))?;
        }
        self.call(driver, "set_mode", |d, h| d.set_mode(h, config.mode))?;

        if config.mode.uses_reference_groups() {
            self.call(driver, "set_reference", |d, h| d.set_reference(h, &config.common_reference))?;
            self.call(driver, "set_ground", |d, h| d.set_ground(h, &config.common_ground))?;
        }

        self.call(driver, "set_analog_out", |d, h| d.set_analog_out(h, &config.analog_out))?;
        self.call(driver, "set_drl_channels", |d, h| d.set_drl_channels(h, &config.drl))?;
        Ok(())
    }

    pub fn start<D: AmplifierDriver + ?Sized>(&self, driver: &D) -> AcquisitionResult<()> {
        self.call(driver, "start", |d, h| d.start(h))
    }

    pub fn stop<D: AmplifierDriver + ?Sized>(&self, driver: &D) -> AcquisitionResult<()> {
        self.call(driver, "stop", |d, h| d.stop(h))
    }

    pub fn reset_transfer<D: AmplifierDriver + ?Sized>(&self, driver: &D) -> AcquisitionResult<()> {
        self.call(driver, "reset_transfer", |d, h| d.reset_transfer(h))
    }

    pub fn submit_read<D: AmplifierDriver + ?Sized>(
        &self,
        driver: &D,
        request: &Arc<TransferRequest>,
    ) -> AcquisitionResult<()> {
        self.call(driver, "submit_read", |d, h| d.submit_read(h, request))
    }

    /// Bytes delivered into `request` by its last completion
    pub fn completed_bytes<D: AmplifierDriver + ?Sized>(
        &self,
        driver: &D,
        request: &TransferRequest,
    ) -> AcquisitionResult<usize> {
        self.call(driver, "completed_byte_count", |d, h| d.completed_byte_count(h, request))
    }

    /// Last error the driver recorded for this device; `None` once closed
    pub fn last_driver_error<D: AmplifierDriver + ?Sized>(&self, driver: &D) -> Option<DriverError> {
        self.handle.as_ref().and_then(|h| driver.last_error(h))
    }

    /// Release the handle; later calls are no-ops
    pub fn close<D: AmplifierDriver + ?Sized>(&mut self, driver: &D) -> AcquisitionResult<()> {
        match self.handle.take() {
            Some(handle) => {
                debug!(serial = %self.serial, "closing device");
                driver
                    .close(handle)
                    .map_err(|e| AcquisitionError::device(&self.serial, "close", e))
            }
            None => Ok(()),
        }
    }
}

/// Opened sessions in call order: slaves first, master last
#[derive(Debug, Default)]
pub struct CallSequence {
    sessions: Vec<DeviceSession>,
}

impl CallSequence {
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&DeviceSession> {
        self.sessions.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut DeviceSession> {
        self.sessions.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceSession> {
        self.sessions.iter()
    }

    /// The last session, which is the master
    pub fn master(&self) -> Option<&DeviceSession> {
        self.sessions.last()
    }

    pub fn serials(&self) -> Vec<String> {
        self.sessions.iter().map(|s| s.serial.clone()).collect()
    }

    pub fn channel_counts(&self) -> Vec<usize> {
        self.sessions.iter().map(DeviceSession::channel_count).collect()
    }

    pub fn total_channels(&self) -> usize {
        self.sessions.iter().map(DeviceSession::channel_count).sum()
    }

    /// Scans per transfer shared by every device
    pub fn scans_per_transfer(&self) -> usize {
        self.master().map_or(0, |s| usize::from(s.config.scans_per_transfer))
    }

    /// Close every session still open; failures are logged and the first one returned
    pub fn close_all<D: AmplifierDriver + ?Sized>(&mut self, driver: &D) -> AcquisitionResult<()> {
        let mut first_error = None;
        for session in &mut self.sessions {
            if let Err(e) = session.close(driver) {
                warn!(serial = %session.serial, error = %e, "failed to close device");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Validate the set and order it: slaves in set order, then the master
pub fn plan_call_sequence(
    configs: &DeviceConfigSet,
) -> Result<Vec<(&str, &DeviceConfig)>, ConfigValidationError> {
    let Some((_, first)) = configs.iter().next() else {
        return Err(ConfigValidationError::NoDevices);
    };
    let (sample_rate, scans) = (first.sample_rate_hz, first.scans_per_transfer);

    let mut sequence = Vec::with_capacity(configs.len());
    let mut master: Option<(&str, &DeviceConfig)> = None;

    for (serial, config) in configs.iter() {
        config.validate(serial)?;

        if config.sample_rate_hz != sample_rate {
            return Err(ConfigValidationError::SampleRateMismatch {
                serial: serial.to_string(),
                expected: sample_rate,
                actual: config.sample_rate_hz,
            });
        }
        if config.scans_per_transfer != scans {
            return Err(ConfigValidationError::ScanCountMismatch {
                serial: serial.to_string(),
                expected: scans,
                actual: config.scans_per_transfer,
            });
        }

        if config.is_slave {
            sequence.push((serial, config));
        } else if let Some((existing, _)) = master {
            return Err(ConfigValidationError::MultipleMastersConfigured {
                serial: serial.to_string(),
                existing: existing.to_string(),
            });
        } else {
            master = Some((serial, config));
        }
    }

    let master = master.ok_or(ConfigValidationError::NoMasterConfigured)?;
    sequence.push(master);
    Ok(sequence)
}

/// Open and configure every device in call order
///
/// Any failure closes all devices opened so far before the error is returned.
pub fn open_and_init<D: AmplifierDriver + ?Sized>(
    driver: &D,
    configs: &DeviceConfigSet,
) -> AcquisitionResult<CallSequence> {
    let plan = plan_call_sequence(configs)?;
    let mut opened = CallSequence {
        sessions: Vec::with_capacity(plan.len()),
    };

    for (position, (serial, config)) in plan.into_iter().enumerate() {
        let result = driver
            .open(serial)
            .map_err(|e| AcquisitionError::device(serial, "open", e))
            .and_then(|handle| {
                let session = DeviceSession::new(serial, handle, config);
                let configured = session.configure(driver);
                opened.sessions.push(session);
                configured
            });

        if let Err(e) = result {
            warn!(serial, error = %e, opened = opened.len(), "device initialisation failed, closing opened devices");
            if let Err(close_error) = opened.close_all(driver) {
                debug!(error = %close_error, "rollback close failed");
            }
            return Err(e);
        }

        info!(
            serial,
            role = if config.is_slave { "slave" } else { "master" },
            position = position + 1,
            "device initialised"
        );
    }

    Ok(opened)
}
