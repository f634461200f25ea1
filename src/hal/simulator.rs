// src/hal/simulator.rs
//! Simulated amplifier driver
//!
//! Every started device owns a worker thread that completes submitted transfers in
//! FIFO order, optionally paced at the configured sample rate. A [`FaultPlan`] injects
//! open/configure failures, stalled transfers and short transfers per serial.

use crate::config::constants::{device, simulation};
use crate::hal::traits::AmplifierDriver;
use crate::hal::types::{
    AnalogOut, BipolarSettings, CommonGround, CommonReference, DeviceHandle, DriverError,
    DriverResult, DrlChannels, OperationMode, TransferRequest,
};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Driver error codes reported by the simulator
pub mod codes {
    pub const DEVICE_NOT_FOUND: u16 = 1;
    pub const ALREADY_OPEN: u16 = 2;
    pub const INVALID_HANDLE: u16 = 3;
    pub const INVALID_PARAMETER: u16 = 4;
    pub const NOT_STARTED: u16 = 5;
    pub const ALREADY_STARTED: u16 = 6;
    pub const INJECTED_FAULT: u16 = 7;
    pub const WORKER_FAILED: u16 = 8;
}

/// Longest single sleep of a paced worker, so stop requests are noticed quickly
const PACING_SLICE: Duration = Duration::from_millis(5);

/// Signal produced on every analog channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Waveform {
    /// Sine wave plus uniform noise
    #[default]
    Sine,
    /// `handle_id * 1000 + channel` on each channel, scan counter on the trigger line
    Marker,
}

/// A fault that hits one device once it has completed `after_transfers` transfers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferFault {
    pub serial: String,
    #[serde(default)]
    pub after_transfers: u64,
}

/// Injected failures
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultPlan {
    /// Serials whose `open` fails
    #[serde(default)]
    pub fail_open: Vec<String>,

    /// Serials whose channel selection fails
    #[serde(default)]
    pub fail_configure: Vec<String>,

    /// Transfers are accepted but never completed
    #[serde(default)]
    pub stall: Option<TransferFault>,

    /// Transfers complete one scan short
    #[serde(default)]
    pub short_transfer: Option<TransferFault>,
}

impl FaultPlan {
    fn fails_open(&self, serial: &str) -> bool {
        self.fail_open.iter().any(|s| s == serial)
    }

    fn fails_configure(&self, serial: &str) -> bool {
        self.fail_configure.iter().any(|s| s == serial)
    }

    fn trips(fault: &Option<TransferFault>, serial: &str, transfer: u64) -> bool {
        matches!(fault, Some(f) if f.serial == serial && transfer >= f.after_transfers)
    }
}

/// Simulator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Deliver transfers at the device sample rate instead of as fast as possible
    #[serde(default = "defaults::paced")]
    pub paced: bool,

    #[serde(default)]
    pub waveform: Waveform,

    #[serde(default = "defaults::signal_amplitude")]
    pub signal_amplitude: f32,

    #[serde(default = "defaults::noise_level")]
    pub noise_level: f32,

    #[serde(default = "defaults::signal_frequency_hz")]
    pub signal_frequency_hz: f32,

    #[serde(default)]
    pub faults: FaultPlan,
}

mod defaults {
    use crate::config::constants::simulation::*;

    pub fn paced() -> bool { cfg!(feature = "simulation") }
    pub fn signal_amplitude() -> f32 { DEFAULT_SIGNAL_AMPLITUDE_UV }
    pub fn noise_level() -> f32 { DEFAULT_NOISE_LEVEL_UV }
    pub fn signal_frequency_hz() -> f32 { DEFAULT_SIGNAL_FREQUENCY_HZ }
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            paced: defaults::paced(),
            waveform: Waveform::default(),
            signal_amplitude: defaults::signal_amplitude(),
            noise_level: defaults::noise_level(),
            signal_frequency_hz: defaults::signal_frequency_hz(),
            faults: FaultPlan::default(),
        }
    }
}

impl SimulatorConfig {
    /// Unpaced marker waveform, the usual setup for ordering checks
    pub fn marker() -> Self {
        Self {
            paced: false,
            waveform: Waveform::Marker,
            ..Self::default()
        }
    }

    pub fn with_faults(mut self, faults: FaultPlan) -> Self {
        self.faults = faults;
        self
    }
}

/// One successful control call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriverCall {
    pub serial: String,
    pub operation: &'static str,
}

/// Call log and transfer counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimulatorStats {
    pub calls: Vec<DriverCall>,
    pub submitted: u64,
    pub completed: u64,
}

impl SimulatorStats {
    /// Number of successful calls of `operation`
    pub fn count(&self, operation: &str) -> usize {
        self.calls.iter().filter(|c| c.operation == operation).count()
    }

    /// Serials `operation` was applied to, in call order
    pub fn serials_for(&self, operation: &str) -> Vec<&str> {
        self.calls
            .iter()
            .filter(|c| c.operation == operation)
            .map(|c| c.serial.as_str())
            .collect()
    }

    /// Operations applied to `serial`, in call order
    pub fn operations_for(&self, serial: &str) -> Vec<&'static str> {
        self.calls
            .iter()
            .filter(|c| c.serial == serial)
            .map(|c| c.operation)
            .collect()
    }
}

struct PendingTransfer {
    request: Arc<TransferRequest>,
    generation: u64,
    index: u64,
}

struct DeviceWorker {
    sender: Sender<PendingTransfer>,
    thread: JoinHandle<()>,
}

struct SimulatedDevice {
    serial: String,
    channels: Vec<u8>,
    sample_rate_hz: u16,
    trigger_line: bool,
    scans_per_transfer: u16,
    mode: OperationMode,
    generation: Arc<AtomicU64>,
    submitted: u64,
    worker: Option<DeviceWorker>,
}

impl SimulatedDevice {
    fn new(serial: &str) -> Self {
        Self {
            serial: serial.to_string(),
            channels: Vec::new(),
            sample_rate_hz: device::DEFAULT_SAMPLE_RATE_HZ,
            trigger_line: false,
            scans_per_transfer: device::DEFAULT_SCANS_PER_TRANSFER,
            mode: OperationMode::Normal,
            generation: Arc::new(AtomicU64::new(0)),
            submitted: 0,
            worker: None,
        }
    }

    /// Invalidate queued transfers and hand back the worker for joining
    fn halt(&mut self) -> Option<DeviceWorker> {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.worker.take()
    }
}

/// Simulated amplifier bank
pub struct AmplifierSimulator {
    config: SimulatorConfig,
    next_handle: AtomicU64,
    devices: Mutex<HashMap<u64, SimulatedDevice>>,
    stats: Arc<Mutex<SimulatorStats>>,
    last_errors: Mutex<HashMap<String, DriverError>>,
}

impl Default for AmplifierSimulator {
    fn default() -> Self {
        Self::new(SimulatorConfig::default())
    }
}

impl AmplifierSimulator {
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            config,
            next_handle: AtomicU64::new(1),
            devices: Mutex::new(HashMap::new()),
            stats: Arc::new(Mutex::new(SimulatorStats::default())),
            last_errors: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    /// Snapshot of the call log and transfer counters
    pub fn stats(&self) -> SimulatorStats {
        self.stats.lock().clone()
    }

    /// Devices currently open
    pub fn open_device_count(&self) -> usize {
        self.devices.lock().len()
    }

    /// Devices currently running a worker
    pub fn running_device_count(&self) -> usize {
        self.devices.lock().values().filter(|d| d.worker.is_some()).count()
    }

    fn record_call(&self, serial: &str, operation: &'static str) {
        trace!(serial, operation, "simulator call");
        self.stats.lock().calls.push(DriverCall {
            serial: serial.to_string(),
            operation,
        });
    }

    /// Record the failure as the device's last error and return it
    fn fail<T>(&self, serial: &str, code: u16, message: String) -> DriverResult<T> {
        let error = DriverError::new(code, message);
        self.last_errors.lock().insert(serial.to_string(), error.clone());
        Err(error)
    }

    /// Run `f` against the device behind `handle` and log the call on success
    fn with_device<R>(
        &self,
        handle: &DeviceHandle,
        operation: &'static str,
        f: impl FnOnce(&mut SimulatedDevice) -> Result<R, (u16, String)>,
    ) -> DriverResult<R> {
        let outcome = {
            let mut devices = self.devices.lock();
            match devices.get_mut(&handle.id()) {
                Some(device) => f(device),
                None => Err((codes::INVALID_HANDLE, format!("unknown device handle {}", handle))),
            }
        };
        match outcome {
            Ok(value) => {
                self.record_call(handle.serial(), operation);
                Ok(value)
            }
            Err((code, message)) => self.fail(handle.serial(), code, format!("{}: {}", operation, message)),
        }
    }

    fn spawn_worker(&self, id: u64, device: &SimulatedDevice) -> DriverResult<DeviceWorker> {
        let (sender, receiver) = channel::unbounded();
        let source = SignalSource::new(id, device, &self.config);
        let context = WorkerContext {
            serial: device.serial.clone(),
            generation: Arc::clone(&device.generation),
            stats: Arc::clone(&self.stats),
            faults: self.config.faults.clone(),
            paced: self.config.paced,
            transfer_period: Duration::from_secs_f64(
                f64::from(device.scans_per_transfer) / f64::from(device.sample_rate_hz.max(1)),
            ),
        };

        let thread = thread::Builder::new()
            .name(format!("sim-{}", device.serial))
            .spawn(move || context.run(receiver, source))
            .or_else(|e| self.fail(&device.serial, codes::WORKER_FAILED, format!("failed to spawn worker: {}", e)))?;

        Ok(DeviceWorker { sender, thread })
    }

    fn join_worker(serial: &str, worker: DeviceWorker) {
        let DeviceWorker { sender, thread } = worker;
        drop(sender);
        if thread.join().is_err() {
            warn!(serial, "simulator worker panicked");
        }
    }
}

impl AmplifierDriver for AmplifierSimulator {
    fn open(&self, serial: &str) -> DriverResult<DeviceHandle> {
        if serial.is_empty() {
            return self.fail(serial, codes::DEVICE_NOT_FOUND, "empty serial number".to_string());
        }
        if self.config.faults.fails_open(serial) {
            return self.fail(serial, codes::INJECTED_FAULT, format!("open {} failed (injected)", serial));
        }

        let id = {
            let mut devices = self.devices.lock();
            if devices.values().any(|d| d.serial == serial) {
                drop(devices);
                return self.fail(serial, codes::ALREADY_OPEN, format!("device {} is already open", serial));
            }
            let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
            devices.insert(id, SimulatedDevice::new(serial));
            id
        };

        self.record_call(serial, "open");
        debug!(serial, id, "simulated device opened");
        Ok(DeviceHandle::new(id, serial))
    }

    fn close(&self, handle: DeviceHandle) -> DriverResult<()> {
        let removed = self.devices.lock().remove(&handle.id());
        let Some(mut device) = removed else {
            return self.fail(handle.serial(), codes::INVALID_HANDLE, format!("close: unknown device handle {}", handle));
        };
        if let Some(worker) = device.halt() {
            Self::join_worker(&device.serial, worker);
        }
        self.record_call(handle.serial(), "close");
        debug!(serial = handle.serial(), "simulated device closed");
        Ok(())
    }

    fn set_channels(&self, handle: &DeviceHandle, channels: &[u8]) -> DriverResult<()> {
        let injected = self.config.faults.fails_configure(handle.serial());
        self.with_device(handle, "set_channels", |device| {
            if injected {
                return Err((codes::INJECTED_FAULT, "channel selection failed (injected)".to_string()));
            }
            if channels.is_empty() {
                return Err((codes::INVALID_PARAMETER, "no channels selected".to_string()));
            }
            if let Some(bad) = channels.iter().find(|&&c| c == 0 || c > device::MAX_CHANNELS) {
                return Err((codes::INVALID_PARAMETER, format!("invalid channel {}", bad)));
            }
            device.channels = channels.to_vec();
            Ok(())
        })
    }

    fn set_sample_rate(&self, handle: &DeviceHandle, sample_rate_hz: u16) -> DriverResult<()> {
        self.with_device(handle, "set_sample_rate", |device| {
            if sample_rate_hz == 0 {
                return Err((codes::INVALID_PARAMETER, "sample rate must be positive".to_string()));
            }
            device.sample_rate_hz = sample_rate_hz;
            Ok(())
        })
    }

    fn enable_trigger_line(&self, handle: &DeviceHandle, enabled: bool) -> DriverResult<()> {
        self.with_device(handle, "enable_trigger_line", |device| {
            device.trigger_line = enabled;
            Ok(())
        })
    }

    fn set_buffer_size(&self, handle: &DeviceHandle, scans: u16) -> DriverResult<()> {
        self.with_device(handle, "set_buffer_size", |device| {
            if scans == 0 {
                return Err((codes::INVALID_PARAMETER, "buffer size must be positive".to_string()));
            }
            device.scans_per_transfer = scans;
            Ok(())
        })
    }

    fn set_bandpass(&self, handle: &DeviceHandle, channel: u8, _filter: Option<u16>) -> DriverResult<()> {
        self.with_device(handle, "set_bandpass", |_| check_filter_channel(channel))
    }

    fn set_notch(&self, handle: &DeviceHandle, channel: u8, _filter: Option<u16>) -> DriverResult<()> {
        self.with_device(handle, "set_notch", |_| check_filter_channel(channel))
    }

    fn set_slave(&self, handle: &DeviceHandle, is_slave: bool) -> DriverResult<()> {
        trace!(serial = handle.serial(), is_slave, "simulated sync role");
        self.with_device(handle, "set_slave", |_| Ok(()))
    }

    fn enable_short_cut(&self, handle: &DeviceHandle, _enabled: bool) -> DriverResult<()> {
        self.with_device(handle, "enable_short_cut", |_| Ok(()))
    }

    fn set_bipolar(&self, handle: &DeviceHandle, settings: &BipolarSettings) -> DriverResult<()> {
        self.with_device(handle, "set_bipolar", |_| {
            match settings.partners.iter().find(|&&p| p > device::MAX_CHANNELS) {
                Some(bad) => Err((codes::INVALID_PARAMETER, format!("invalid bipolar partner {}", bad))),
                None => Ok(()),
            }
        })
    }

    fn set_mode(&self, handle: &DeviceHandle, mode: OperationMode) -> DriverResult<()> {
        self.with_device(handle, "set_mode", |device| {
            if mode == OperationMode::Counter && device.mode != OperationMode::Normal {
                return Err((codes::INVALID_PARAMETER, "counter mode requires normal mode first".to_string()));
            }
            device.mode = mode;
            Ok(())
        })
    }

    fn set_reference(&self, handle: &DeviceHandle, _reference: &CommonReference) -> DriverResult<()> {
        self.with_device(handle, "set_reference", |_| Ok(()))
    }

    fn set_ground(&self, handle: &DeviceHandle, _ground: &CommonGround) -> DriverResult<()> {
        self.with_device(handle, "set_ground", |_| Ok(()))
    }

    fn set_analog_out(&self, handle: &DeviceHandle, _settings: &AnalogOut) -> DriverResult<()> {
        self.with_device(handle, "set_analog_out", |_| Ok(()))
    }

    fn set_drl_channels(&self, handle: &DeviceHandle, _channels: &DrlChannels) -> DriverResult<()> {
        self.with_device(handle, "set_drl_channels", |_| Ok(()))
    }

    fn start(&self, handle: &DeviceHandle) -> DriverResult<()> {
        let prepared = {
            let devices = self.devices.lock();
            match devices.get(&handle.id()) {
                None => Err((codes::INVALID_HANDLE, format!("unknown device handle {}", handle))),
                Some(device) if device.worker.is_some() => {
                    Err((codes::ALREADY_STARTED, "device already started".to_string()))
                }
                Some(device) if device.channels.is_empty() => {
                    Err((codes::INVALID_PARAMETER, "no channels selected".to_string()))
                }
                Some(device) => self.spawn_worker(handle.id(), device).map_err(|e| (e.code, e.message)),
            }
        };

        let worker = match prepared {
            Ok(worker) => worker,
            Err((code, message)) => return self.fail(handle.serial(), code, format!("start: {}", message)),
        };

        let leftover = {
            let mut devices = self.devices.lock();
            match devices.get_mut(&handle.id()) {
                Some(device) => {
                    device.submitted = 0;
                    device.worker = Some(worker);
                    None
                }
                None => Some(worker),
            }
        };
        if let Some(worker) = leftover {
            Self::join_worker(handle.serial(), worker);
            return self.fail(handle.serial(), codes::INVALID_HANDLE, format!("start: device {} closed concurrently", handle));
        }

        self.record_call(handle.serial(), "start");
        debug!(serial = handle.serial(), "simulated device started");
        Ok(())
    }

    fn stop(&self, handle: &DeviceHandle) -> DriverResult<()> {
        let worker = self.with_device(handle, "stop", |device| Ok(device.halt()))?;
        if let Some(worker) = worker {
            Self::join_worker(handle.serial(), worker);
        }
        Ok(())
    }

    fn reset_transfer(&self, handle: &DeviceHandle) -> DriverResult<()> {
        self.with_device(handle, "reset_transfer", |device| {
            device.generation.fetch_add(1, Ordering::AcqRel);
            Ok(())
        })
    }

    fn submit_read(&self, handle: &DeviceHandle, request: &Arc<TransferRequest>) -> DriverResult<()> {
        let outcome = {
            let mut devices = self.devices.lock();
            match devices.get_mut(&handle.id()) {
                None => Err((codes::INVALID_HANDLE, format!("unknown device handle {}", handle))),
                Some(device) => match &device.worker {
                    None => Err((codes::NOT_STARTED, "device not started".to_string())),
                    Some(worker) => {
                        let pending = PendingTransfer {
                            request: Arc::clone(request),
                            generation: device.generation.load(Ordering::Acquire),
                            index: device.submitted,
                        };
                        match worker.sender.send(pending) {
                            Ok(()) => {
                                device.submitted += 1;
                                Ok(())
                            }
                            Err(_) => Err((codes::WORKER_FAILED, "worker disconnected".to_string())),
                        }
                    }
                },
            }
        };

        match outcome {
            Ok(()) => {
                self.stats.lock().submitted += 1;
                Ok(())
            }
            Err((code, message)) => self.fail(handle.serial(), code, format!("submit_read: {}", message)),
        }
    }

    fn last_error(&self, handle: &DeviceHandle) -> Option<DriverError> {
        self.last_errors.lock().get(handle.serial()).cloned()
    }
}

impl Drop for AmplifierSimulator {
    fn drop(&mut self) {
        let workers: Vec<(String, DeviceWorker)> = self
            .devices
            .get_mut()
            .values_mut()
            .filter_map(|d| d.halt().map(|w| (d.serial.clone(), w)))
            .collect();
        for (serial, worker) in workers {
            Self::join_worker(&serial, worker);
        }
    }
}

fn check_filter_channel(channel: u8) -> Result<(), (u16, String)> {
    if channel == 0 || channel > device::MAX_CHANNELS {
        Err((codes::INVALID_PARAMETER, format!("invalid filter channel {}", channel)))
    } else {
        Ok(())
    }
}

/// Sample generator for one started device
struct SignalSource {
    id: u64,
    channels: Vec<u8>,
    trigger_line: bool,
    scans_per_transfer: usize,
    sample_rate_hz: f32,
    waveform: Waveform,
    amplitude: f32,
    noise_level: f32,
    frequency_hz: f32,
    scan: u64,
    rng: StdRng,
}

impl SignalSource {
    fn new(id: u64, device: &SimulatedDevice, config: &SimulatorConfig) -> Self {
        Self {
            id,
            channels: device.channels.clone(),
            trigger_line: device.trigger_line,
            scans_per_transfer: usize::from(device.scans_per_transfer),
            sample_rate_hz: f32::from(device.sample_rate_hz.max(1)),
            waveform: config.waveform,
            amplitude: config.signal_amplitude,
            noise_level: config.noise_level,
            frequency_hz: config.signal_frequency_hz,
            scan: 0,
            rng: StdRng::seed_from_u64(id),
        }
    }

    fn channel_count(&self) -> usize {
        self.channels.len() + usize::from(self.trigger_line)
    }

    /// Write one transfer into `buffer`; returns the bytes written
    fn fill(&mut self, buffer: &mut [u8]) -> usize {
        let header = device::HEADER_SIZE_BYTES.min(buffer.len());
        buffer[..header].fill(0);

        let mut offset = header;
        for _ in 0..self.scans_per_transfer {
            for i in 0..self.channels.len() {
                let value = self.channel_value(self.channels[i]);
                offset = write_sample(buffer, offset, value);
            }
            if self.trigger_line {
                let marker = (self.scan % simulation::MARKER_SCAN_MODULUS) as f32;
                offset = write_sample(buffer, offset, marker);
            }
            self.scan += 1;
        }
        offset
    }

    fn channel_value(&mut self, channel: u8) -> f32 {
        match self.waveform {
            Waveform::Marker => self.id as f32 * simulation::MARKER_DEVICE_STRIDE + f32::from(channel),
            Waveform::Sine => {
                let t = self.scan as f32 / self.sample_rate_hz;
                let phase = 2.0 * std::f32::consts::PI * self.frequency_hz * t;
                let noise = if self.noise_level > 0.0 {
                    self.rng.gen_range(-self.noise_level..self.noise_level)
                } else {
                    0.0
                };
                self.amplitude * phase.sin() + noise
            }
        }
    }
}

fn write_sample(buffer: &mut [u8], offset: usize, value: f32) -> usize {
    let end = offset + device::BYTES_PER_SAMPLE;
    if end <= buffer.len() {
        buffer[offset..end].copy_from_slice(&value.to_ne_bytes());
    }
    end.min(buffer.len())
}

struct WorkerContext {
    serial: String,
    generation: Arc<AtomicU64>,
    stats: Arc<Mutex<SimulatorStats>>,
    faults: FaultPlan,
    paced: bool,
    transfer_period: Duration,
}

impl WorkerContext {
    fn run(self, receiver: Receiver<PendingTransfer>, mut source: SignalSource) {
        let started = Instant::now();
        let mut delivered: u32 = 0;

        for pending in receiver.iter() {
            if pending.generation != self.generation.load(Ordering::Acquire) {
                continue;
            }
            if FaultPlan::trips(&self.faults.stall, &self.serial, pending.index) {
                trace!(serial = %self.serial, transfer = pending.index, "stalling transfer");
                continue;
            }

            if self.paced {
                let due = started + self.transfer_period * (delivered + 1);
                if !self.sleep_until(due, pending.generation) {
                    continue;
                }
            }

            let short = FaultPlan::trips(&self.faults.short_transfer, &self.serial, pending.index);
            let scan_bytes = source.channel_count() * device::BYTES_PER_SAMPLE;
            pending.request.complete_with(|buffer| {
                let written = source.fill(buffer);
                if short {
                    written.saturating_sub(scan_bytes)
                } else {
                    written
                }
            });
            delivered = delivered.saturating_add(1);
            self.stats.lock().completed += 1;
        }

        trace!(serial = %self.serial, delivered, "simulator worker exiting");
    }

    /// Sleep in short slices; false if the transfer was invalidated meanwhile
    fn sleep_until(&self, due: Instant, generation: u64) -> bool {
        loop {
            if self.generation.load(Ordering::Acquire) != generation {
                return false;
            }
            let now = Instant::now();
            if now >= due {
                return true;
            }
            thread::sleep((due - now).min(PACING_SLICE));
        }
    }
}
