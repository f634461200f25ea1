// src/config/device_config.rs
//! Per-device acquisition parameters and the ordered device set

use crate::config::constants::device::{
    DEFAULT_SAMPLE_RATE_HZ, DEFAULT_SCANS_PER_TRANSFER, MAX_CHANNELS, MAX_SCANS_PER_TRANSFER,
};
use crate::error::ConfigValidationError;
use crate::hal::{AnalogOut, BipolarSettings, CommonGround, CommonReference, DrlChannels, OperationMode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Channel number (1-based) to filter index; at most one filter per channel
pub type FilterMap = BTreeMap<u8, u16>;

/// Immutable acquisition parameters for one amplifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Channels to acquire, 1-based, in acquisition order
    pub selected_channels: Vec<u8>,

    #[serde(default = "defaults::sample_rate_hz")]
    pub sample_rate_hz: u16,

    /// Also acquire the digital trigger lines as an extra channel
    #[serde(default)]
    pub trigger_line_enabled: bool,

    #[serde(default = "defaults::scans_per_transfer")]
    pub scans_per_transfer: u16,

    #[serde(default, with = "channel_keyed")]
    pub bandpass_filters: FilterMap,

    #[serde(default, with = "channel_keyed")]
    pub notch_filters: FilterMap,

    #[serde(default)]
    pub short_cut_enabled: bool,

    #[serde(default)]
    pub bipolar: BipolarSettings,

    #[serde(default)]
    pub common_reference: CommonReference,

    #[serde(default)]
    pub common_ground: CommonGround,

    #[serde(default)]
    pub is_slave: bool,

    #[serde(default)]
    pub mode: OperationMode,

    #[serde(default)]
    pub analog_out: AnalogOut,

    #[serde(default)]
    pub drl: DrlChannels,
}

mod defaults {
    use super::{DEFAULT_SAMPLE_RATE_HZ, DEFAULT_SCANS_PER_TRANSFER};

    pub fn sample_rate_hz() -> u16 { DEFAULT_SAMPLE_RATE_HZ }
    pub fn scans_per_transfer() -> u16 { DEFAULT_SCANS_PER_TRANSFER }
}

/// TOML tables only have string keys, so filter maps are keyed by the channel's text form
mod channel_keyed {
    use super::FilterMap;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(map: &FilterMap, serializer: S) -> Result<S::Ok, S::Error> {
        map.iter()
            .map(|(channel, filter)| (channel.to_string(), *filter))
            .collect::<BTreeMap<String, u16>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<FilterMap, D::Error> {
        BTreeMap::<String, u16>::deserialize(deserializer)?
            .into_iter()
            .map(|(key, filter)| {
                key.trim()
                    .parse::<u8>()
                    .map(|channel| (channel, filter))
                    .map_err(|_| D::Error::custom(format!("invalid channel number '{}'", key)))
            })
            .collect()
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            selected_channels: (1..=MAX_CHANNELS).collect(),
            sample_rate_hz: DEFAULT_SAMPLE_RATE_HZ,
            trigger_line_enabled: false,
            scans_per_transfer: DEFAULT_SCANS_PER_TRANSFER,
            bandpass_filters: FilterMap::new(),
            notch_filters: FilterMap::new(),
            short_cut_enabled: false,
            bipolar: BipolarSettings::default(),
            common_reference: CommonReference::default(),
            common_ground: CommonGround::default(),
            is_slave: false,
            mode: OperationMode::Normal,
            analog_out: AnalogOut::default(),
            drl: DrlChannels::default(),
        }
    }
}

impl DeviceConfig {
    /// Master configuration acquiring `channels`
    pub fn master(channels: &[u8]) -> Self {
        Self {
            selected_channels: channels.to_vec(),
            ..Self::default()
        }
    }

    /// Slave configuration acquiring `channels`
    pub fn slave(channels: &[u8]) -> Self {
        Self {
            selected_channels: channels.to_vec(),
            is_slave: true,
            ..Self::default()
        }
    }

    /// Values delivered per scan: selected channels plus the trigger line
    pub fn channel_count(&self) -> usize {
        self.selected_channels.len() + usize::from(self.trigger_line_enabled)
    }

    pub fn is_master(&self) -> bool {
        !self.is_slave
    }

    /// Per-device checks; cross-device rules live in the session planner
    pub fn validate(&self, serial: &str) -> Result<(), ConfigValidationError> {
        if self.selected_channels.is_empty() {
            return Err(ConfigValidationError::NoChannelsSelected {
                serial: serial.to_string(),
            });
        }

        let mut seen = HashSet::with_capacity(self.selected_channels.len());
        for &channel in &self.selected_channels {
            if !(1..=MAX_CHANNELS).contains(&channel) {
                return Err(ConfigValidationError::InvalidChannel {
                    serial: serial.to_string(),
                    channel,
                    max: MAX_CHANNELS,
                });
            }
            if !seen.insert(channel) {
                return Err(ConfigValidationError::DuplicateChannel {
                    serial: serial.to_string(),
                    channel,
                });
            }
        }

        for &channel in self.bandpass_filters.keys().chain(self.notch_filters.keys()) {
            if !(1..=MAX_CHANNELS).contains(&channel) {
                return Err(ConfigValidationError::InvalidFilterChannel {
                    serial: serial.to_string(),
                    channel,
                    max: MAX_CHANNELS,
                });
            }
        }

        if self.sample_rate_hz == 0 {
            return Err(ConfigValidationError::InvalidParameter {
                scope: serial.to_string(),
                field: "sample_rate_hz",
                reason: "must be greater than 0".to_string(),
            });
        }

        if self.scans_per_transfer == 0 || self.scans_per_transfer > MAX_SCANS_PER_TRANSFER {
            return Err(ConfigValidationError::InvalidParameter {
                scope: serial.to_string(),
                field: "scans_per_transfer",
                reason: format!("must be within 1..={}", MAX_SCANS_PER_TRANSFER),
            });
        }

        Ok(())
    }
}

/// One serial/config pair of a [`DeviceConfigSet`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub serial: String,
    pub config: DeviceConfig,
}

/// Insertion-ordered map from device serial to configuration
///
/// Iteration order is insertion order; it decides the order of the slaves in the
/// call sequence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceConfigSet {
    entries: Vec<DeviceEntry>,
}

impl DeviceConfigSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The demo set: first serial is the master, all others are slaves
    pub fn with_defaults<S: AsRef<str>>(serials: &[S]) -> Self {
        serials
            .iter()
            .enumerate()
            .map(|(i, serial)| {
                let config = DeviceConfig {
                    is_slave: i > 0,
                    ..DeviceConfig::default()
                };
                (serial.as_ref().to_string(), config)
            })
            .collect()
    }

    /// Insert or replace; a replaced entry keeps its position
    pub fn insert(&mut self, serial: impl Into<String>, config: DeviceConfig) -> Option<DeviceConfig> {
        let serial = serial.into();
        match self.entries.iter_mut().find(|entry| entry.serial == serial) {
            Some(entry) => Some(std::mem::replace(&mut entry.config, config)),
            None => {
                self.entries.push(DeviceEntry { serial, config });
                None
            }
        }
    }

    pub fn get(&self, serial: &str) -> Option<&DeviceConfig> {
        self.entries
            .iter()
            .find(|entry| entry.serial == serial)
            .map(|entry| &entry.config)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DeviceConfig)> {
        self.entries
            .iter()
            .map(|entry| (entry.serial.as_str(), &entry.config))
    }

    pub fn serials(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.serial.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of per-scan values over all devices
    pub fn total_channel_count(&self) -> usize {
        self.entries.iter().map(|entry| entry.config.channel_count()).sum()
    }
}

impl<S: Into<String>> FromIterator<(S, DeviceConfig)> for DeviceConfigSet {
    fn from_iter<I: IntoIterator<Item = (S, DeviceConfig)>>(iter: I) -> Self {
        let mut set = DeviceConfigSet::new();
        for (serial, config) in iter {
            set.insert(serial, config);
        }
        set
    }
}
