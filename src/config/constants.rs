// src/config/constants.rs
//! System-wide configuration constants

/// Amplifier hardware constants
pub mod device {
    /// Maximum number of analog channels one device provides
    pub const MAX_CHANNELS: u8 = 16;
    /// Bytes preceding the scan data in every transfer
    pub const HEADER_SIZE_BYTES: usize = 38;
    /// Every sample is delivered as an IEEE-754 float32
    pub const BYTES_PER_SAMPLE: usize = 4;
    /// Recommended upper bound for scans per transfer
    pub const MAX_SCANS_PER_TRANSFER: u16 = 512;

    pub const DEFAULT_SAMPLE_RATE_HZ: u16 = 512;
    pub const DEFAULT_SCANS_PER_TRANSFER: u16 = 16;
}

/// Acquisition loop constants
pub mod acquisition {
    /// Transfers kept in flight per device
    pub const DEFAULT_QUEUE_DEPTH: usize = 4;
    pub const MAX_QUEUE_DEPTH: usize = 64;
    /// Ring buffer window in seconds of data
    pub const DEFAULT_BUFFER_SECONDS: u32 = 5;
    pub const DEFAULT_TRANSFER_TIMEOUT_MS: u64 = 1000;
    pub const DEFAULT_THREAD_NAME: &str = "ampsync-acquisition";
    /// Cross-platform priority (0..=99) used for `ThreadPriority::High`
    pub const HIGH_PRIORITY_VALUE: u8 = 75;
}

/// Simulated amplifier constants
pub mod simulation {
    pub const DEFAULT_SIGNAL_AMPLITUDE_UV: f32 = 100.0;
    pub const DEFAULT_NOISE_LEVEL_UV: f32 = 5.0;
    pub const DEFAULT_SIGNAL_FREQUENCY_HZ: f32 = 10.0;
    /// Marker waveform value offset per device id
    pub const MARKER_DEVICE_STRIDE: f32 = 1000.0;
    /// Marker waveform trigger line counter wraps here
    pub const MARKER_SCAN_MODULUS: u64 = 1000;
}

/// Configuration file locations and environment overrides
pub mod paths {
    pub const DEFAULT_CONFIG_FILE: &str = "ampsync.toml";
    pub const USER_CONFIG_DIR: &str = ".config/ampsync";
    pub const SYSTEM_CONFIG_FILE: &str = "/etc/ampsync/ampsync.toml";
    pub const ENV_PREFIX: &str = "AMPSYNC_";
    /// Separates nested keys in environment overrides
    pub const ENV_KEY_SEPARATOR: &str = "__";
}
