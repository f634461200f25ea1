// tests/engine_integration.rs
//! Engine behaviour against the simulated amplifier bank
//!
//! Covers call ordering, stream interleaving, fatal-error teardown (overflow, timeout,
//! data loss), startup rollback and restart after failure.

use ampsync_core::acquisition::{AcquisitionEngine, EngineState, StreamSegment};
use ampsync_core::config::{AcquisitionSettings, DeviceConfig, DeviceConfigSet};
use ampsync_core::error::{AcquisitionError, ConfigValidationError};
use ampsync_core::hal::{
    AmplifierDriver, AmplifierSimulator, AnalogOut, BipolarSettings, CommonGround, CommonReference, DeviceHandle,
    DriverError, DriverResult, DrlChannels, FaultPlan, OperationMode, SimulatorConfig, TransferFault,
    TransferRequest, WaitOutcome,
};
use crossbeam::channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn settings(timeout_ms: u64) -> AcquisitionSettings {
    AcquisitionSettings {
        transfer_timeout_ms: timeout_ms,
        ..AcquisitionSettings::default()
    }
}

fn paced_marker() -> SimulatorConfig {
    SimulatorConfig {
        paced: true,
        ..SimulatorConfig::marker()
    }
}

fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}

/// Simulator whose first `stop` call blocks until the test releases it
struct GatedStop {
    inner: AmplifierSimulator,
    gated: AtomicBool,
    entered: Sender<()>,
    release: Receiver<()>,
}

impl AmplifierDriver for GatedStop {
    fn open(&self, serial: &str) -> DriverResult<DeviceHandle> {
        self.inner.open(serial)
    }
    fn close(&self, handle: DeviceHandle) -> DriverResult<()> {
        self.inner.close(handle)
    }
    fn set_channels(&self, handle: &DeviceHandle, channels: &[u8]) -> DriverResult<()> {
        self.inner.set_channels(handle, channels)
    }
    fn set_sample_rate(&self, handle: &DeviceHandle, sample_rate_hz: u16) -> DriverResult<()> {
        self.inner.set_sample_rate(handle, sample_rate_hz)
    }
    fn enable_trigger_line(&self, handle: &DeviceHandle, enabled: bool) -> DriverResult<()> {
        self.inner.enable_trigger_line(handle, enabled)
    }
    fn set_buffer_size(&self, handle: &DeviceHandle, scans: u16) -> DriverResult<()> {
        self.inner.set_buffer_size(handle, scans)
    }
    fn set_bandpass(&self, handle: &DeviceHandle, channel: u8, filter: Option<u16>) -> DriverResult<()> {
        self.inner.set_bandpass(handle, channel, filter)
    }
    fn set_notch(&self, handle: &DeviceHandle, channel: u8, filter: Option<u16>) -> DriverResult<()> {
        self.inner.set_notch(handle, channel, filter)
    }
    fn set_slave(&self, handle: &DeviceHandle, is_slave: bool) -> DriverResult<()> {
        self.inner.set_slave(handle, is_slave)
    }
    fn enable_short_cut(&self, handle: &DeviceHandle, enabled: bool) -> DriverResult<()> {
        self.inner.enable_short_cut(handle, enabled)
    }
    fn set_bipolar(&self, handle: &DeviceHandle, settings: &BipolarSettings) -> DriverResult<()> {
        self.inner.set_bipolar(handle, settings)
    }
    fn set_mode(&self, handle: &DeviceHandle, mode: OperationMode) -> DriverResult<()> {
        self.inner.set_mode(handle, mode)
    }
    fn set_reference(&self, handle: &DeviceHandle, reference: &CommonReference) -> DriverResult<()> {
        self.inner.set_reference(handle, reference)
    }
    fn set_ground(&self, handle: &DeviceHandle, ground: &CommonGround) -> DriverResult<()> {
        self.inner.set_ground(handle, ground)
    }
    fn set_analog_out(&self, handle: &DeviceHandle, settings: &AnalogOut) -> DriverResult<()> {
        self.inner.set_analog_out(handle, settings)
    }
    fn set_drl_channels(&self, handle: &DeviceHandle, channels: &DrlChannels) -> DriverResult<()> {
        self.inner.set_drl_channels(handle, channels)
    }
    fn start(&self, handle: &DeviceHandle) -> DriverResult<()> {
        self.inner.start(handle)
    }
    fn stop(&self, handle: &DeviceHandle) -> DriverResult<()> {
        if !self.gated.swap(true, Ordering::SeqCst) {
            let _ = self.entered.send(());
            let _ = self.release.recv_timeout(Duration::from_secs(5));
        }
        self.inner.stop(handle)
    }
    fn reset_transfer(&self, handle: &DeviceHandle) -> DriverResult<()> {
        self.inner.reset_transfer(handle)
    }
    fn submit_read(&self, handle: &DeviceHandle, request: &Arc<TransferRequest>) -> DriverResult<()> {
        self.inner.submit_read(handle, request)
    }
    fn wait_for_completion(&self, request: &TransferRequest, timeout: Duration) -> WaitOutcome {
        self.inner.wait_for_completion(request, timeout)
    }
    fn completed_byte_count(&self, handle: &DeviceHandle, request: &TransferRequest) -> DriverResult<usize> {
        self.inner.completed_byte_count(handle, request)
    }
    fn last_error(&self, handle: &DeviceHandle) -> Option<DriverError> {
        self.inner.last_error(handle)
    }
    fn header_size(&self) -> usize {
        self.inner.header_size()
    }
}

fn three_device_set() -> DeviceConfigSet {
    let mut master = DeviceConfig::master(&[1, 2]);
    master.trigger_line_enabled = true;

    [
        ("M", master),
        ("S1", DeviceConfig::slave(&[3])),
        ("S2", DeviceConfig::slave(&[4, 5, 6])),
    ]
    .into_iter()
    .collect()
}

#[test]
fn test_slaves_start_before_master_and_stream_is_interleaved() {
    let engine = AcquisitionEngine::new(Arc::new(AmplifierSimulator::new(paced_marker())), settings(1000));
    engine
        .start_acquisition(&three_device_set())
        .expect("Failed to start acquisition");

    // devices are started on the acquisition thread
    assert!(wait_until(|| engine.driver().stats().count("start") == 3));
    let stats = engine.driver().stats();
    assert_eq!(stats.serials_for("open"), vec!["S1", "S2", "M"]);
    assert_eq!(stats.serials_for("start"), vec!["S1", "S2", "M"]);

    assert_eq!(
        engine.interleave_order(),
        vec![
            StreamSegment { serial: "M".to_string(), channels: 3 },
            StreamSegment { serial: "S2".to_string(), channels: 3 },
            StreamSegment { serial: "S1".to_string(), channels: 1 },
        ]
    );
    assert_eq!(engine.total_channels(), 7);

    assert!(wait_until(|| engine.buffered_len() >= 14));
    let data = engine.read_data(14);
    engine.stop_acquisition();

    // handles are assigned in call order: S1 = 1, S2 = 2, M = 3
    assert_eq!(
        data,
        vec![
            3001.0, 3002.0, 0.0, 2004.0, 2005.0, 2006.0, 1003.0,
            3001.0, 3002.0, 1.0, 2004.0, 2005.0, 2006.0, 1003.0,
        ]
    );
    assert!(engine.last_error().is_none());
}

#[test]
fn test_scans_stay_continuous_across_blocks() {
    let mut master = DeviceConfig::master(&[1]);
    master.trigger_line_enabled = true;
    master.scans_per_transfer = 4;
    let configs: DeviceConfigSet = [("M", master)].into_iter().collect();

    let engine = AcquisitionEngine::new(Arc::new(AmplifierSimulator::new(paced_marker())), settings(1000));
    engine.start_acquisition(&configs).expect("Failed to start acquisition");

    assert!(wait_until(|| engine.buffered_len() >= 2 * 40));
    let data = engine.read_data(2 * 40);
    engine.stop_acquisition();

    let triggers: Vec<f32> = data.chunks_exact(2).map(|scan| scan[1]).collect();
    let expected: Vec<f32> = (0..40).map(|i| i as f32).collect();
    assert_eq!(triggers, expected);
}

#[test]
fn test_overflow_tears_down_every_device() {
    let engine = AcquisitionEngine::new(
        Arc::new(AmplifierSimulator::new(SimulatorConfig::marker())),
        AcquisitionSettings {
            buffer_seconds: 1,
            ..settings(1000)
        },
    );
    let configs = DeviceConfigSet::with_defaults(&["M", "S1"]);
    engine.start_acquisition(&configs).expect("Failed to start acquisition");

    assert!(wait_until(|| engine.state() == EngineState::Idle));

    match engine.last_error() {
        Some(AcquisitionError::BufferOverflow { capacity, incoming, .. }) => {
            assert_eq!(capacity, 512 * 32);
            assert_eq!(incoming, 16 * 32);
        }
        other => panic!("Expected buffer overflow, got {:?}", other),
    }

    // a full window is kept for the consumer to drain
    assert_eq!(engine.buffered_len(), 512 * 32);

    let stats = engine.driver().stats();
    assert_eq!(stats.count("open"), 2);
    assert_eq!(stats.count("close"), stats.count("open"));
    assert_eq!(stats.count("stop"), 2);
    assert_eq!(stats.count("reset_transfer"), 2);
    assert_eq!(engine.driver().open_device_count(), 0);
    assert_eq!(engine.driver().running_device_count(), 0);

    engine.stop_acquisition();
    assert_eq!(engine.buffered_len(), 0);
    assert_eq!(engine.driver().stats().count("close"), 2);
}

#[test]
fn test_timeout_triggers_single_teardown() {
    let faults = FaultPlan {
        stall: Some(TransferFault {
            serial: "S1".to_string(),
            after_transfers: 3,
        }),
        ..FaultPlan::default()
    };
    let engine = AcquisitionEngine::new(
        Arc::new(AmplifierSimulator::new(SimulatorConfig::marker().with_faults(faults))),
        settings(100),
    );
    engine
        .start_acquisition(&DeviceConfigSet::with_defaults(&["M", "S1"]))
        .expect("Failed to start acquisition");

    assert!(wait_until(|| engine.state() == EngineState::Idle));
    assert_eq!(
        engine.last_error(),
        Some(AcquisitionError::TransferTimeout {
            serial: "S1".to_string(),
            slot: 3,
            timeout_ms: 100,
        })
    );

    engine.stop_acquisition();
    engine.stop_acquisition();

    let stats = engine.driver().stats();
    assert_eq!(stats.count("stop"), 2);
    assert_eq!(stats.count("close"), 2);
    assert_eq!(engine.driver().open_device_count(), 0);
}

#[test]
fn test_fatal_error_reports_stopping_during_teardown() {
    let faults = FaultPlan {
        stall: Some(TransferFault {
            serial: "M".to_string(),
            after_transfers: 2,
        }),
        ..FaultPlan::default()
    };
    let (entered_tx, entered_rx) = bounded(1);
    let (release_tx, release_rx) = bounded(1);
    let driver = GatedStop {
        inner: AmplifierSimulator::new(SimulatorConfig::marker().with_faults(faults)),
        gated: AtomicBool::new(false),
        entered: entered_tx,
        release: release_rx,
    };
    let engine = AcquisitionEngine::new(Arc::new(driver), settings(50));
    engine
        .start_acquisition(&DeviceConfigSet::with_defaults(&["M"]))
        .expect("Failed to start acquisition");

    entered_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("Failed to reach device stop");
    assert_eq!(engine.state(), EngineState::Stopping);
    assert!(!engine.is_running());
    assert!(matches!(
        engine.last_error(),
        Some(AcquisitionError::TransferTimeout { ref serial, .. }) if serial == "M"
    ));

    release_tx.send(()).expect("Failed to release device stop");
    assert!(wait_until(|| engine.state() == EngineState::Idle));
    assert_eq!(engine.driver().inner.open_device_count(), 0);
    assert_eq!(engine.driver().inner.stats().count("close"), 1);
}

#[test]
fn test_short_transfer_is_data_loss() {
    let faults = FaultPlan {
        short_transfer: Some(TransferFault {
            serial: "M".to_string(),
            after_transfers: 0,
        }),
        ..FaultPlan::default()
    };
    let engine = AcquisitionEngine::new(
        Arc::new(AmplifierSimulator::new(SimulatorConfig::marker().with_faults(faults))),
        settings(1000),
    );
    engine
        .start_acquisition(&DeviceConfigSet::with_defaults(&["M"]))
        .expect("Failed to start acquisition");

    assert!(wait_until(|| engine.state() == EngineState::Idle));

    let expected = 38 + 16 * 16 * 4;
    assert_eq!(
        engine.last_error(),
        Some(AcquisitionError::DataLoss {
            serial: "M".to_string(),
            expected,
            received: expected - 16 * 4,
        })
    );
    assert_eq!(engine.buffered_len(), 0);
    assert_eq!(engine.driver().open_device_count(), 0);
}

#[test]
fn test_open_failure_rolls_back_opened_devices() {
    let faults = FaultPlan {
        fail_open: vec!["S2".to_string()],
        ..FaultPlan::default()
    };
    let engine = AcquisitionEngine::new(
        Arc::new(AmplifierSimulator::new(SimulatorConfig::marker().with_faults(faults))),
        settings(1000),
    );

    let err = engine.start_acquisition(&three_device_set()).unwrap_err();
    assert!(matches!(
        &err,
        AcquisitionError::Device { serial, operation: "open", .. } if serial == "S2"
    ));
    assert_eq!(err.driver_code(), Some(ampsync_core::hal::simulator::codes::INJECTED_FAULT));

    let stats = engine.driver().stats();
    assert_eq!(stats.serials_for("open"), vec!["S1"]);
    assert_eq!(stats.serials_for("close"), vec!["S1"]);
    assert_eq!(stats.count("start"), 0);
    assert_eq!(engine.state(), EngineState::Idle);
}

#[test]
fn test_invalid_master_count_rejected_before_any_open() {
    let engine = AcquisitionEngine::new(Arc::new(AmplifierSimulator::new(SimulatorConfig::marker())), settings(1000));

    let no_master: DeviceConfigSet = [("S1", DeviceConfig::slave(&[1])), ("S2", DeviceConfig::slave(&[1]))]
        .into_iter()
        .collect();
    assert_eq!(
        engine.start_acquisition(&no_master),
        Err(AcquisitionError::ConfigValidation(ConfigValidationError::NoMasterConfigured))
    );

    let two_masters: DeviceConfigSet = [("A", DeviceConfig::master(&[1])), ("B", DeviceConfig::master(&[1]))]
        .into_iter()
        .collect();
    assert!(matches!(
        engine.start_acquisition(&two_masters),
        Err(AcquisitionError::ConfigValidation(
            ConfigValidationError::MultipleMastersConfigured { .. }
        ))
    ));

    assert_eq!(engine.driver().stats().count("open"), 0);
    assert!(!engine.is_running());
}

#[test]
fn test_restart_after_fatal_error() {
    let engine = AcquisitionEngine::new(
        Arc::new(AmplifierSimulator::new(SimulatorConfig::marker())),
        AcquisitionSettings {
            buffer_seconds: 1,
            ..settings(1000)
        },
    );
    let configs = DeviceConfigSet::with_defaults(&["M"]);

    engine.start_acquisition(&configs).expect("Failed to start acquisition");
    assert!(wait_until(|| engine.state() == EngineState::Idle));
    assert!(engine.last_error().is_some());

    engine.start_acquisition(&configs).expect("Failed to restart acquisition");
    assert_eq!(engine.stats().capacity, 512 * 16);
    engine.stop_acquisition();
    assert_eq!(engine.state(), EngineState::Idle);

    let stats = engine.driver().stats();
    assert_eq!(stats.count("open"), 2);
    assert_eq!(stats.count("close"), 2);
}

#[test]
fn test_trait_object_driver_and_prompt_stop() {
    let simulator = Arc::new(AmplifierSimulator::new(paced_marker()));
    let driver: Arc<dyn AmplifierDriver> = simulator.clone();
    let engine = AcquisitionEngine::new(driver, settings(1000));

    engine
        .start_acquisition(&DeviceConfigSet::with_defaults(&["M", "S1", "S2"]))
        .expect("Failed to start acquisition");
    assert_eq!(
        engine.start_acquisition(&DeviceConfigSet::with_defaults(&["X"])),
        Err(AcquisitionError::AlreadyRunning)
    );
    assert!(wait_until(|| engine.stats().blocks_published >= 2));

    let stopping = Instant::now();
    engine.stop_acquisition();
    assert!(stopping.elapsed() < Duration::from_secs(2));

    assert_eq!(engine.state(), EngineState::Idle);
    assert_eq!(simulator.open_device_count(), 0);
    assert_eq!(simulator.stats().count("close"), 3);
}
