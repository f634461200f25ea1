// tests/hal_integration.rs
//! Integration tests for the simulated amplifier driver

use ampsync_core::config::constants::device::{BYTES_PER_SAMPLE, HEADER_SIZE_BYTES};
use ampsync_core::config::ConfigLoader;
use ampsync_core::hal::simulator::codes;
use ampsync_core::hal::{
    AmplifierDriver, AmplifierSimulator, DeviceHandle, SimulatorConfig, TransferRequest, WaitOutcome,
};
use ampsync_core::AcquisitionEngine;
use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn decode(request: &TransferRequest) -> Vec<f32> {
    let payload = request.payload();
    payload[HEADER_SIZE_BYTES..request.transferred()]
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

fn started(driver: &dyn AmplifierDriver, serial: &str, channels: &[u8], scans: u16) -> DeviceHandle {
    let handle = driver.open(serial).expect("Failed to open device");
    driver.set_channels(&handle, channels).expect("Failed to set channels");
    driver.set_buffer_size(&handle, scans).expect("Failed to set buffer size");
    driver.start(&handle).expect("Failed to start device");
    handle
}

#[test]
fn test_sine_transfer_through_trait_object() {
    let config = SimulatorConfig {
        paced: false,
        ..SimulatorConfig::default()
    };
    let amplitude = config.signal_amplitude + config.noise_level;
    let driver: Arc<dyn AmplifierDriver> = Arc::new(AmplifierSimulator::new(config));

    let handle = started(driver.as_ref(), "UB-SIM-1", &[1, 2, 3, 4], 32);
    let request = Arc::new(TransferRequest::new(HEADER_SIZE_BYTES + 32 * 4 * BYTES_PER_SAMPLE));
    driver.submit_read(&handle, &request).expect("Failed to submit read");

    assert_eq!(
        driver.wait_for_completion(&request, Duration::from_secs(2)),
        WaitOutcome::Completed
    );
    assert_eq!(
        driver.completed_byte_count(&handle, &request).expect("Failed to get byte count"),
        request.len()
    );

    let samples = decode(&request);
    assert_eq!(samples.len(), 32 * 4);
    assert!(samples.iter().any(|&v| v != 0.0));
    assert!(samples.iter().all(|v| v.abs() <= amplitude));

    driver.stop(&handle).expect("Failed to stop device");
    driver.close(handle).expect("Failed to close device");
}

#[test]
fn test_paced_transfers_follow_sample_rate() {
    let simulator = AmplifierSimulator::new(SimulatorConfig {
        paced: true,
        ..SimulatorConfig::marker()
    });

    let began = Instant::now();
    // 64 scans at 512 Hz: one transfer every 125 ms
    let handle = started(&simulator, "UB-SIM-1", &[1], 64);
    let first = Arc::new(TransferRequest::new(HEADER_SIZE_BYTES + 64 * BYTES_PER_SAMPLE));
    let second = Arc::new(TransferRequest::new(HEADER_SIZE_BYTES + 64 * BYTES_PER_SAMPLE));
    simulator.submit_read(&handle, &first).expect("Failed to submit read");
    simulator.submit_read(&handle, &second).expect("Failed to submit read");

    assert!(second.wait(Duration::from_secs(2)));
    assert!(first.is_completed());
    assert!(began.elapsed() >= Duration::from_millis(200));
    assert_eq!(simulator.stats().completed, 2);

    simulator.close(handle).expect("Failed to close device");
    assert_eq!(simulator.running_device_count(), 0);
}

#[test]
fn test_driver_errors_are_recorded_per_device() {
    let simulator = AmplifierSimulator::new(SimulatorConfig::marker());
    let first = simulator.open("UB-SIM-1").expect("Failed to open device");
    let second = simulator.open("UB-SIM-2").expect("Failed to open device");
    assert!(simulator.last_error(&first).is_none());

    let err = simulator.set_channels(&first, &[]).unwrap_err();
    assert_eq!(err.code, codes::INVALID_PARAMETER);
    assert_eq!(simulator.last_error(&first), Some(err));
    assert!(simulator.last_error(&second).is_none());

    let err = simulator.set_sample_rate(&second, 0).unwrap_err();
    assert_eq!(err.code, codes::INVALID_PARAMETER);
    assert_eq!(simulator.last_error(&second), Some(err));

    let ghost = DeviceHandle::new(999, "UB-GHOST");
    let err = simulator.start(&ghost).unwrap_err();
    assert_eq!(err.code, codes::INVALID_HANDLE);
    assert_eq!(simulator.last_error(&ghost).map(|e| e.code), Some(codes::INVALID_HANDLE));
    assert_eq!(
        simulator.last_error(&first).map(|e| e.code),
        Some(codes::INVALID_PARAMETER)
    );

    // failed calls never show up in the call log
    assert_eq!(simulator.stats().operations_for("UB-SIM-1"), vec!["open"]);
    simulator.close(first).expect("Failed to close device");
    simulator.close(second).expect("Failed to close device");
}

#[test]
fn test_engine_from_config_file() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("ampsync.toml");
    fs::write(
        &path,
        r#"
        [acquisition]
        queue_depth = 2
        buffer_seconds = 2

        [simulator]
        paced = true
        waveform = "marker"

        [[devices]]
        serial = "UB-SIM-S"
        [devices.config]
        selected_channels = [5]
        is_slave = true

        [[devices]]
        serial = "UB-SIM-M"
        [devices.config]
        selected_channels = [1, 2]
        "#,
    )
    .expect("Failed to write config file");

    let config = ConfigLoader::with_paths(vec![path])
        .with_env_prefix("AMPSYNC_HAL_IT_")
        .load_system_config()
        .expect("Failed to load config");
    let simulator = Arc::new(AmplifierSimulator::new(config.simulator.clone().unwrap_or_default()));
    let engine = AcquisitionEngine::new(Arc::clone(&simulator), config.acquisition.clone());

    engine.start_acquisition(&config.devices).expect("Failed to start acquisition");
    assert_eq!(engine.stats().capacity, 2 * 512 * 3);

    let deadline = Instant::now() + Duration::from_secs(5);
    while engine.buffered_len() < 3 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    let scan = engine.read_data(3);
    engine.stop_acquisition();

    // slave opened first gets handle 1, master handle 2
    assert_eq!(scan, vec![2001.0, 2002.0, 1005.0]);
    assert_eq!(simulator.open_device_count(), 0);
}
