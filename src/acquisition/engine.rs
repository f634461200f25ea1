// src/acquisition/engine.rs
//! Acquisition engine: lifecycle state machine and the dedicated acquisition loop
//!
//! `start_acquisition` validates the device set, sizes the window buffer and opens and
//! configures every device before the acquisition thread is spawned. The thread
//! starts the devices slaves first, keeps `queue_depth` reads in flight per device
//! and publishes one reassembled block per pipeline index. Any fatal error, or a stop
//! request observed between full passes, ends in a teardown that stops, resets and
//! closes every device and releases every transfer slot exactly once.

use crate::acquisition::reassembler::{ScanLayout, ScanReassembler};
use crate::acquisition::session::{open_and_init, plan_call_sequence, CallSequence};
use crate::acquisition::transfer::{DevicePipeline, SlotCursor, SweepStep};
use crate::acquisition::windowed_buffer::WindowedBuffer;
use crate::config::constants::acquisition::HIGH_PRIORITY_VALUE;
use crate::config::{AcquisitionSettings, DeviceConfigSet, ThreadPriority};
use crate::error::{AcquisitionError, AcquisitionResult, BufferError};
use crate::hal::{AmplifierDriver, WaitOutcome};
use crossbeam::channel;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thread_priority::{set_current_thread_priority, ThreadPriority as OsPriority, ThreadPriorityValue};
use tracing::{debug, error, info, warn};

/// Lifecycle of the acquisition engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Idle,
    Starting,
    Running,
    Stopping,
}

/// Counters of the current (or last) acquisition run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcquisitionStats {
    pub state: EngineState,
    pub transfers_completed: u64,
    pub blocks_published: u64,
    pub samples_published: u64,
    pub samples_read: u64,
    pub buffered: usize,
    pub capacity: usize,
}

/// Position of one device's channels in the output stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamSegment {
    pub serial: String,
    pub channels: usize,
}

#[derive(Debug, Default)]
struct Counters {
    transfers_completed: AtomicU64,
    blocks_published: AtomicU64,
    samples_published: AtomicU64,
    samples_read: AtomicU64,
}

impl Counters {
    fn reset(&self) {
        self.transfers_completed.store(0, Ordering::Relaxed);
        self.blocks_published.store(0, Ordering::Relaxed);
        self.samples_published.store(0, Ordering::Relaxed);
        self.samples_read.store(0, Ordering::Relaxed);
    }
}

/// State shared between the engine handle and its acquisition thread
#[derive(Debug)]
struct Shared {
    state: Mutex<EngineState>,
    stop_requested: AtomicBool,
    last_error: Mutex<Option<AcquisitionError>>,
    counters: Counters,
}

impl Shared {
    fn set_state(&self, state: EngineState) {
        let mut current = self.state.lock();
        debug!(from = ?*current, to = ?state, "engine state change");
        *current = state;
    }
}

/// Synchronized multi-device acquisition engine
pub struct AcquisitionEngine<D: AmplifierDriver + ?Sized + 'static> {
    driver: Arc<D>,
    settings: AcquisitionSettings,
    shared: Arc<Shared>,
    buffer: RwLock<Arc<WindowedBuffer<f32>>>,
    segments: RwLock<Vec<StreamSegment>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<D: AmplifierDriver + ?Sized + 'static> AcquisitionEngine<D> {
    pub fn new(driver: Arc<D>, settings: AcquisitionSettings) -> Self {
        Self {
            driver,
            settings,
            shared: Arc::new(Shared {
                state: Mutex::new(EngineState::Idle),
                stop_requested: AtomicBool::new(false),
                last_error: Mutex::new(None),
                counters: Counters::default(),
            }),
            buffer: RwLock::new(Arc::new(WindowedBuffer::unbounded())),
            segments: RwLock::new(Vec::new()),
            worker: Mutex::new(None),
        }
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    pub fn settings(&self) -> &AcquisitionSettings {
        &self.settings
    }

    pub fn state(&self) -> EngineState {
        *self.shared.state.lock()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Starting | EngineState::Running)
    }

    /// Fatal error that ended the last run, if any
    pub fn last_error(&self) -> Option<AcquisitionError> {
        self.shared.last_error.lock().clone()
    }

    /// Open and configure all devices, then start the acquisition thread
    pub fn start_acquisition(&self, configs: &DeviceConfigSet) -> AcquisitionResult<()> {
        let mut worker = self.worker.lock();

        {
            let mut state = self.shared.state.lock();
            if *state != EngineState::Idle {
                return Err(AcquisitionError::AlreadyRunning);
            }
            *state = EngineState::Starting;
        }

        if let Some(finished) = worker.take() {
            if finished.join().is_err() {
                warn!("previous acquisition thread panicked");
            }
        }

        match self.launch(configs) {
            Ok(handle) => {
                *worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "failed to start acquisition");
                self.shared.set_state(EngineState::Idle);
                Err(e)
            }
        }
    }

    fn launch(&self, configs: &DeviceConfigSet) -> AcquisitionResult<JoinHandle<()>> {
        self.settings.validate()?;
        let plan = plan_call_sequence(configs)?;

        let total_channels: usize = plan.iter().map(|(_, c)| c.channel_count()).sum();
        let sample_rate = plan.last().map_or(0, |(_, c)| c.sample_rate_hz);
        let buffer = Arc::new(WindowedBuffer::for_window(
            self.settings.buffer_seconds,
            sample_rate,
            total_channels,
        )?);

        info!(devices = plan.len(), total_channels, capacity = buffer.capacity(), "opening devices");
        let mut sessions = open_and_init(self.driver.as_ref(), configs)?;

        let layout = ScanLayout::new(
            &sessions.channel_counts(),
            sessions.scans_per_transfer(),
            self.driver.header_size(),
        );
        *self.segments.write() = layout
            .interleave_order()
            .into_iter()
            .filter_map(|device| sessions.get(device))
            .map(|s| StreamSegment {
                serial: s.serial().to_string(),
                channels: s.channel_count(),
            })
            .collect();
        *self.buffer.write() = Arc::clone(&buffer);
        *self.shared.last_error.lock() = None;
        self.shared.stop_requested.store(false, Ordering::Release);
        self.shared.counters.reset();

        let (handoff, inbox) = channel::bounded::<CallSequence>(1);
        let driver = Arc::clone(&self.driver);
        let shared = Arc::clone(&self.shared);
        let queue_depth = self.settings.queue_depth;
        let timeout = self.settings.transfer_timeout();
        let priority = self.settings.thread_priority;

        debug!(thread = %self.settings.thread_name, ?priority, "spawning acquisition thread");
        let spawned = thread::Builder::new()
            .name(self.settings.thread_name.clone())
            .spawn(move || {
                raise_priority(priority);
                let Ok(sessions) = inbox.recv() else {
                    shared.set_state(EngineState::Idle);
                    return;
                };
                AcquisitionLoop::new(driver, sessions, layout, queue_depth, timeout, buffer, shared).run();
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                if let Err(close_error) = sessions.close_all(self.driver.as_ref()) {
                    warn!(error = %close_error, "failed to close devices after spawn failure");
                }
                return Err(AcquisitionError::Spawn(e.to_string()));
            }
        };

        self.shared.set_state(EngineState::Running);
        if let Err(channel::SendError(mut sessions)) = handoff.send(sessions) {
            if let Err(close_error) = sessions.close_all(self.driver.as_ref()) {
                warn!(error = %close_error, "failed to close devices after handoff failure");
            }
            let _ = handle.join();
            return Err(AcquisitionError::Spawn("acquisition thread exited before start".to_string()));
        }

        info!("acquisition started");
        Ok(handle)
    }

    /// Request a stop and block until the acquisition thread has torn everything down
    ///
    /// Idempotent; the window buffer is cleared.
    pub fn stop_acquisition(&self) {
        let mut worker = self.worker.lock();
        let Some(handle) = worker.take() else {
            return;
        };

        {
            let mut state = self.shared.state.lock();
            if *state == EngineState::Running {
                *state = EngineState::Stopping;
            }
        }
        self.shared.stop_requested.store(true, Ordering::Release);

        if handle.join().is_err() {
            error!("acquisition thread panicked");
        }
        self.shared.set_state(EngineState::Idle);
        self.buffer.read().clear();
        info!("acquisition stopped");
    }

    /// Up to `max_elements` oldest samples; never blocks
    pub fn read_data(&self, max_elements: usize) -> Vec<f32> {
        let data = self.buffer.read().dequeue_many(max_elements);
        self.shared
            .counters
            .samples_read
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        data
    }

    /// Samples waiting to be read
    pub fn buffered_len(&self) -> usize {
        self.buffer.read().len()
    }

    /// Devices in the order their channels appear within each scan
    pub fn interleave_order(&self) -> Vec<StreamSegment> {
        self.segments.read().clone()
    }

    /// Values per scan across all devices
    pub fn total_channels(&self) -> usize {
        self.segments.read().iter().map(|s| s.channels).sum()
    }

    pub fn stats(&self) -> AcquisitionStats {
        let counters = &self.shared.counters;
        let buffer = self.buffer.read();
        AcquisitionStats {
            state: self.state(),
            transfers_completed: counters.transfers_completed.load(Ordering::Relaxed),
            blocks_published: counters.blocks_published.load(Ordering::Relaxed),
            samples_published: counters.samples_published.load(Ordering::Relaxed),
            samples_read: counters.samples_read.load(Ordering::Relaxed),
            buffered: buffer.len(),
            capacity: buffer.capacity(),
        }
    }
}

impl<D: AmplifierDriver + ?Sized + 'static> Drop for AcquisitionEngine<D> {
    fn drop(&mut self) {
        self.stop_acquisition();
    }
}

/// Everything the acquisition thread owns
///
/// Dropping it runs the teardown, so devices are released even if the loop panics.
struct AcquisitionLoop<D: AmplifierDriver + ?Sized> {
    driver: Arc<D>,
    sessions: CallSequence,
    pipelines: Vec<DevicePipeline>,
    reassembler: ScanReassembler,
    cursor: SlotCursor,
    timeout: Duration,
    buffer: Arc<WindowedBuffer<f32>>,
    shared: Arc<Shared>,
}

impl<D: AmplifierDriver + ?Sized> AcquisitionLoop<D> {
    fn new(
        driver: Arc<D>,
        sessions: CallSequence,
        layout: ScanLayout,
        queue_depth: usize,
        timeout: Duration,
        buffer: Arc<WindowedBuffer<f32>>,
        shared: Arc<Shared>,
    ) -> Self {
        let pipelines = (0..sessions.len())
            .map(|device| DevicePipeline::new(queue_depth, layout.transfer_bytes(device)))
            .collect();
        Self {
            driver,
            cursor: SlotCursor::new(sessions.len(), queue_depth),
            sessions,
            pipelines,
            reassembler: ScanReassembler::new(layout),
            timeout,
            buffer,
            shared,
        }
    }

    fn run(mut self) {
        let result = self.start_devices().and_then(|()| self.stream());
        if let Err(e) = result {
            error!(
                error = %e,
                device = self.cursor.device(),
                slot = self.cursor.slot(),
                "acquisition aborted"
            );
            *self.shared.last_error.lock() = Some(e);
        }
        self.shared.set_state(EngineState::Stopping);
    }

    /// Start every device in call order, each followed by its initial reads
    fn start_devices(&mut self) -> AcquisitionResult<()> {
        for device in 0..self.sessions.len() {
            self.cursor.seek(device, 0);
            let session = self.sessions.get(device).ok_or_else(|| missing(device, self.sessions.len()))?;
            session.start(self.driver.as_ref())?;
            debug!(serial = session.serial(), "device started");

            for slot in 0..self.pipelines.get(device).map_or(0, DevicePipeline::depth) {
                self.cursor.seek(device, slot);
                self.submit(device, slot)?;
            }
        }
        self.cursor.seek(0, 0);
        info!(devices = self.sessions.len(), "receiving data");
        Ok(())
    }

    /// Steady state; the stop flag is checked once per full device × slot pass
    fn stream(&mut self) -> AcquisitionResult<()> {
        let last_device = self.sessions.len().saturating_sub(1);
        while !self.shared.stop_requested.load(Ordering::Acquire) {
            loop {
                let (device, slot) = (self.cursor.device(), self.cursor.slot());
                self.service(device, slot)?;
                if device == last_device {
                    self.publish()?;
                }
                if self.cursor.advance() {
                    break;
                }
            }
        }
        debug!("stop requested");
        Ok(())
    }

    fn submit(&mut self, device: usize, slot: usize) -> AcquisitionResult<()> {
        let request = {
            let transfer = self
                .pipelines
                .get_mut(device)
                .and_then(|p| p.slot_mut(slot))
                .ok_or_else(|| missing(device, self.sessions.len()))?;
            transfer.rearm();
            transfer.request().cloned().ok_or_else(|| missing(device, self.sessions.len()))?
        };
        let session = self.sessions.get(device).ok_or_else(|| missing(device, self.sessions.len()))?;
        session.submit_read(self.driver.as_ref(), &request)
    }

    /// Wait for one completion, check it, place it, and resubmit the same slot
    fn service(&mut self, device: usize, slot: usize) -> AcquisitionResult<()> {
        let devices = self.sessions.len();
        let session = self.sessions.get(device).ok_or_else(|| missing(device, devices))?;
        let pipeline = self.pipelines.get_mut(device).ok_or_else(|| missing(device, devices))?;
        let expected = pipeline.transfer_bytes();
        let transfer = pipeline.slot_mut(slot).ok_or_else(|| missing(device, devices))?;
        let request = transfer.request().cloned().ok_or_else(|| missing(device, devices))?;

        if self.driver.wait_for_completion(&request, self.timeout) == WaitOutcome::TimedOut {
            if let Some(cause) = session.last_driver_error(self.driver.as_ref()) {
                warn!(serial = session.serial(), error = %cause, "driver error on stalled transfer");
            }
            return Err(AcquisitionError::TransferTimeout {
                serial: session.serial().to_string(),
                slot,
                timeout_ms: self.timeout.as_millis() as u64,
            });
        }
        transfer.mark_completed();

        let received = session.completed_bytes(self.driver.as_ref(), &request)?;
        if received != expected {
            return Err(AcquisitionError::DataLoss {
                serial: session.serial().to_string(),
                expected,
                received,
            });
        }

        self.reassembler.place(device, &request.payload())?;

        transfer.rearm();
        session.submit_read(self.driver.as_ref(), &request)?;
        self.shared.counters.transfers_completed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Append the reassembled block; a block that does not fit is fatal
    fn publish(&mut self) -> AcquisitionResult<()> {
        let block = self.reassembler.block();
        self.buffer.try_enqueue_slice(block)?;

        let counters = &self.shared.counters;
        counters.blocks_published.fetch_add(1, Ordering::Relaxed);
        counters.samples_published.fetch_add(block.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Stop, reset and close every device and recycle every slot, exactly once each
    fn teardown(&mut self) {
        let steps: Vec<SweepStep> = self.cursor.sweep().collect();
        let mut released = 0usize;

        for step in steps {
            if step.first_visit {
                if let Some(session) = self.sessions.get_mut(step.device) {
                    if session.is_open() {
                        let driver = self.driver.as_ref();
                        if let Err(e) = session.stop(driver) {
                            warn!(error = %e, "failed to stop device");
                        }
                        if let Err(e) = session.reset_transfer(driver) {
                            warn!(error = %e, "failed to reset device transfer");
                        }
                        if let Err(e) = session.close(driver) {
                            warn!(error = %e, "failed to close device");
                        }
                    }
                }
            }

            if let Some(slot) = self.pipelines.get_mut(step.device).and_then(|p| p.slot_mut(step.slot)) {
                if slot.recycle() {
                    released += 1;
                }
            }
        }

        // sessions without slots (nothing was allocated) still have to be closed
        if let Err(e) = self.sessions.close_all(self.driver.as_ref()) {
            warn!(error = %e, "failed to close device");
        }

        if released > 0 {
            debug!(released, "transfer slots released");
        }
        let live: usize = self.pipelines.iter().map(DevicePipeline::live_slots).sum();
        if live > 0 {
            warn!(live, "transfer slots still held after teardown");
        }
    }
}

impl<D: AmplifierDriver + ?Sized> Drop for AcquisitionLoop<D> {
    fn drop(&mut self) {
        info!("stopping devices and cleaning up");
        self.teardown();
        self.shared.set_state(EngineState::Idle);
    }
}

/// OS priority requested for a setting; `None` leaves the thread's priority untouched
fn os_priority(priority: ThreadPriority) -> Option<OsPriority> {
    match priority {
        ThreadPriority::Normal => None,
        ThreadPriority::High => Some(
            ThreadPriorityValue::try_from(HIGH_PRIORITY_VALUE)
                .map(OsPriority::Crossplatform)
                .unwrap_or(OsPriority::Max),
        ),
        ThreadPriority::RealTime => Some(OsPriority::Max),
    }
}

/// Applied on the acquisition thread itself; a refusal by the OS is not fatal
fn raise_priority(priority: ThreadPriority) {
    let Some(requested) = os_priority(priority) else {
        return;
    };
    match set_current_thread_priority(requested) {
        Ok(()) => debug!(?priority, "acquisition thread priority raised"),
        Err(e) => warn!(?priority, error = ?e, "couldn't raise acquisition thread priority"),
    }
}

fn missing(index: usize, count: usize) -> AcquisitionError {
    AcquisitionError::Buffer(BufferError::IndexOutOfRange { index, count })
}
