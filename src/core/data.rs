//! Domain data model for particle counter measurements.
//!
//! All datasets carry exactly eight size channels in fixed order; the
//! channel number inside [`ChannelData`] is always `index + 1`. Timestamps
//! are UTC. The packed output-format register layout lives here so encoders
//! and decoders cannot drift apart.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Operator-facing timestamp format, also used in the live key map.
pub const TIMESTAMP_FORMAT: &str = "%Y.%m.%d-%H:%M:%S%.3f";

/// Acquisition state of a single size channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    /// Channel is not configured on the instrument.
    #[default]
    Off,
    /// Channel is measuring, counts below warning limit.
    Ok,
    /// Channel count exceeded the warning limit.
    Warning,
    /// Channel count exceeded the alarm limit.
    Alarm,
}

impl ChannelStatus {
    /// Decode the raw register value. Unknown values map to `Off`.
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            1 => Self::Ok,
            2 => Self::Warning,
            3 => Self::Alarm,
            _ => Self::Off,
        }
    }
}

/// One size channel of a measurement dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelData {
    /// Channel number, 1..=8.
    pub channel: u16,
    /// Acquisition state.
    pub status: ChannelStatus,
    /// Particle count, reassembled from two 16-bit registers (low word
    /// first, then `count |= high << 16`).
    pub count: u32,
}

/// Fixed array of the eight channels, numbered 1..=8.
pub fn empty_channels() -> [ChannelData; 8] {
    std::array::from_fn(|i| ChannelData {
        channel: i as u16 + 1,
        status: ChannelStatus::Off,
        count: 0,
    })
}

/// How the instrument reports counts per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputDataFormat {
    /// Counts per channel exclude the larger channels.
    Distributive,
    /// Counts per channel include all larger channels.
    #[default]
    Cumulative,
}

impl OutputDataFormat {
    /// Decode from the raw format bit.
    pub fn from_raw(raw: u16) -> Self {
        if raw & 0x01 == 1 {
            Self::Cumulative
        } else {
            Self::Distributive
        }
    }

    /// The raw format bit.
    pub const fn raw(self) -> u16 {
        match self {
            Self::Distributive => 0,
            Self::Cumulative => 1,
        }
    }
}

/// Pack output format and addup count into the H0002 register layout:
/// `(addup_count << 2) | format`.
pub fn pack_output_format(format: OutputDataFormat, addup_count: u16) -> u16 {
    ((addup_count << 2) & 0xff) | format.raw()
}

/// Split the H0002 register layout back into format and addup count.
pub fn unpack_output_format(raw: u16) -> (OutputDataFormat, u16) {
    (OutputDataFormat::from_raw(raw), (raw >> 2) & 0x3f)
}

/// Live measurement state of an instrument, including the mirrored
/// liveness fields the operator surface reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActualData {
    /// Instrument reachable on the bus.
    pub online: bool,
    /// Telegrams lost since startup.
    pub lost_telegrams: u64,
    /// Time of the most recent successfully parsed response.
    pub last_seen: Option<DateTime<Utc>>,
    /// Persisted counter of lost clock settings.
    pub clock_setting_lost_count: u32,
    /// `healthy` or `problem` once the error-state register has been read.
    pub status_string: String,
    /// The eight size channels.
    pub channel_data: [ChannelData; 8],
    /// Timestamp of the live dataset as reported by the instrument.
    pub timestamp: Option<DateTime<Utc>>,
}

impl Default for ActualData {
    fn default() -> Self {
        Self {
            online: false,
            lost_telegrams: 0,
            last_seen: None,
            clock_setting_lost_count: 0,
            status_string: String::new(),
            channel_data: empty_channels(),
            timestamp: None,
        }
    }
}

impl ActualData {
    /// The live keys in the order the control surface advertises them.
    pub fn keys() -> Vec<String> {
        let mut keys = vec![
            "online".to_string(),
            "lostTelegrams".to_string(),
            "lastSeen".to_string(),
            "clockSettingLostCount".to_string(),
            "statusString".to_string(),
        ];
        for ch in 1..=8 {
            keys.push(format!("countChannel_{}", ch));
        }
        keys.push("timestamp".to_string());
        keys
    }

    /// Render the live key map shared by the `get --actual` path and the
    /// live-subscriber fan-out.
    pub fn key_values(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("online".to_string(), (self.online as u8).to_string());
        map.insert("lostTelegrams".to_string(), self.lost_telegrams.to_string());
        map.insert("lastSeen".to_string(), format_timestamp(self.last_seen));
        map.insert(
            "clockSettingLostCount".to_string(),
            self.clock_setting_lost_count.to_string(),
        );
        map.insert("statusString".to_string(), self.status_string.clone());
        for data in &self.channel_data {
            map.insert(
                format!("countChannel_{}", data.channel),
                data.count.to_string(),
            );
        }
        map.insert("timestamp".to_string(), format_timestamp(self.timestamp));
        map
    }
}

/// One stored historical measurement block read from the instrument
/// archive. Emitted only when the instrument reported an actual record
/// (channel 1 count is not the 0xFFFFFFFF sentinel).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveDataset {
    /// Timestamp of the archived measurement.
    pub timestamp: Option<DateTime<Utc>>,
    /// Sampling time the record was acquired with.
    pub sampling_time_s: u16,
    /// Output format the record was acquired with.
    pub output_format: OutputDataFormat,
    /// Addup count the record was acquired with.
    pub addup_count: u16,
    /// The eight size channels.
    pub channel_data: [ChannelData; 8],
}

impl Default for ArchiveDataset {
    fn default() -> Self {
        Self {
            timestamp: None,
            sampling_time_s: 0,
            output_format: OutputDataFormat::default(),
            addup_count: 0,
            channel_data: empty_channels(),
        }
    }
}

/// Identification data reported by the instrument.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Free-form device info string (48 registers).
    pub info: String,
    /// Device id string (16 registers).
    pub id: String,
    /// Register set version, `major.minor`.
    pub registerset_version: String,
}

/// Acquisition configuration of an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigData {
    /// Count reporting mode.
    pub output_format: OutputDataFormat,
    /// Number of sampling periods added up per reported dataset.
    pub addup_count: u16,
    /// Rinsing time before the first sample of a sequence, seconds.
    pub first_rinsing_s: u16,
    /// Rinsing time between samples, seconds. Must be >= 1 for the
    /// instrument's internal loop check.
    pub subsequent_rinsing_s: u16,
    /// Sampling time, seconds.
    pub sampling_s: u16,
    /// False until the configuration has been confirmed from the device.
    pub valid: bool,
}

impl Default for ConfigData {
    fn default() -> Self {
        Self {
            output_format: OutputDataFormat::Cumulative,
            addup_count: 1,
            first_rinsing_s: 60,
            subsequent_rinsing_s: 30,
            sampling_s: 59,
            valid: true,
        }
    }
}

/// Decoded status register (input 0089).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRegister {
    /// Device is active.
    pub device_active: bool,
    /// A sample acquisition is running.
    pub currently_sampling: bool,
    /// A rinsing phase is running.
    pub currently_rinsing: bool,
    /// A finished dataset is ready to read.
    pub data_ready: bool,
}

impl StatusRegister {
    /// Decode the raw register value.
    pub fn from_raw(raw: u16) -> Self {
        Self {
            device_active: raw & (1 << 0) != 0,
            currently_sampling: raw & (1 << 1) != 0,
            currently_rinsing: raw & (1 << 2) != 0,
            data_ready: raw & (1 << 3) != 0,
        }
    }
}

/// Decoded error-state register (input 0096).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorstateRegister {
    /// Internal temperature out of range.
    pub temperature: bool,
    /// SD card failure.
    pub sd_card: bool,
    /// Counter settings implausible.
    pub counter_settings: bool,
    /// Acquisition settings implausible.
    pub acquisition_settings: bool,
    /// Remote settings implausible.
    pub remote_settings: bool,
    /// Filter settings implausible.
    pub filter_settings: bool,
    /// Detector loop failure.
    pub detector_loop: bool,
    /// Laser failure.
    pub laser: bool,
    /// Air flow out of range.
    pub flow: bool,
}

impl ErrorstateRegister {
    /// Decode the raw register value. Bit 8 is unused by the instrument.
    pub fn from_raw(raw: u16) -> Self {
        Self {
            temperature: raw & (1 << 0) != 0,
            sd_card: raw & (1 << 1) != 0,
            counter_settings: raw & (1 << 2) != 0,
            acquisition_settings: raw & (1 << 3) != 0,
            remote_settings: raw & (1 << 4) != 0,
            filter_settings: raw & (1 << 5) != 0,
            detector_loop: raw & (1 << 6) != 0,
            laser: raw & (1 << 7) != 0,
            flow: raw & (1 << 9) != 0,
        }
    }

    /// Render the operator error string: `error_<flag>=1_` per raised flag,
    /// `noError` when clean.
    pub fn error_string(&self) -> String {
        let mut s = String::new();
        let flags = [
            (self.temperature, "temperatureError"),
            (self.sd_card, "sdCardError"),
            (self.counter_settings, "counterSettings"),
            (self.acquisition_settings, "acquisitionSettings"),
            (self.remote_settings, "remoteSettings"),
            (self.filter_settings, "filterSettings"),
            (self.detector_loop, "detectorLoop"),
            (self.laser, "laserError"),
            (self.flow, "flowError"),
        ];
        for (raised, name) in flags {
            if raised {
                s.push_str("error_");
                s.push_str(name);
                s.push_str("=1_");
            }
        }
        if s.is_empty() {
            s.push_str("noError");
        }
        s
    }
}

/// Render a timestamp in the operator format, empty string when unset.
pub fn format_timestamp(ts: Option<DateTime<Utc>>) -> String {
    match ts {
        Some(ts) => ts.format(TIMESTAMP_FORMAT).to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_output_format_pack_roundtrip() {
        for addup in 0..=63u16 {
            for format in [OutputDataFormat::Distributive, OutputDataFormat::Cumulative] {
                let raw = pack_output_format(format, addup);
                assert_eq!(raw, (addup << 2) | format.raw());
                let (f, a) = unpack_output_format(raw);
                assert_eq!(f, format);
                assert_eq!(a, addup);
            }
        }
    }

    #[test]
    fn test_channel_status_from_raw() {
        assert_eq!(ChannelStatus::from_raw(0), ChannelStatus::Off);
        assert_eq!(ChannelStatus::from_raw(1), ChannelStatus::Ok);
        assert_eq!(ChannelStatus::from_raw(2), ChannelStatus::Warning);
        assert_eq!(ChannelStatus::from_raw(3), ChannelStatus::Alarm);
        // Out-of-range register content must not panic
        assert_eq!(ChannelStatus::from_raw(999), ChannelStatus::Off);
    }

    #[test]
    fn test_empty_channels_are_numbered() {
        let channels = empty_channels();
        for (i, ch) in channels.iter().enumerate() {
            assert_eq!(ch.channel, i as u16 + 1);
            assert_eq!(ch.status, ChannelStatus::Off);
            assert_eq!(ch.count, 0);
        }
    }

    #[test]
    fn test_status_register_bits() {
        let status = StatusRegister::from_raw(0b1011);
        assert!(status.device_active);
        assert!(status.currently_sampling);
        assert!(!status.currently_rinsing);
        assert!(status.data_ready);
    }

    #[test]
    fn test_errorstate_register_bit9() {
        let errors = ErrorstateRegister::from_raw(1 << 9);
        assert!(errors.flow);
        assert!(!errors.laser);
        // Bit 8 is not mapped to anything
        let errors = ErrorstateRegister::from_raw(1 << 8);
        assert_eq!(errors, ErrorstateRegister::default());
    }

    #[test]
    fn test_error_string() {
        assert_eq!(ErrorstateRegister::default().error_string(), "noError");

        let errors = ErrorstateRegister::from_raw((1 << 0) | (1 << 7));
        assert_eq!(
            errors.error_string(),
            "error_temperatureError=1_error_laserError=1_"
        );
    }

    #[test]
    fn test_actual_data_key_values() {
        let mut actual = ActualData::default();
        actual.online = true;
        actual.lost_telegrams = 3;
        actual.channel_data[1].count = 1500;
        actual.timestamp = Some(Utc.with_ymd_and_hms(2024, 3, 1, 10, 15, 30).unwrap());

        let map = actual.key_values();
        assert_eq!(map.get("online").unwrap(), "1");
        assert_eq!(map.get("lostTelegrams").unwrap(), "3");
        assert_eq!(map.get("countChannel_2").unwrap(), "1500");
        assert_eq!(map.get("lastSeen").unwrap(), "");
        assert_eq!(map.get("timestamp").unwrap(), "2024.03.01-10:15:30.000");
        assert_eq!(map.len(), ActualData::keys().len());
    }
}
