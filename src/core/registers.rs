//! Register map of the particle counter Modbus register set.
//!
//! Offsets are the raw protocol data addresses (the documented register
//! number minus one). Holding registers carry configuration and the command
//! register; input registers are read-only live/archive data.

/// Holding register offsets (read/write).
pub mod holding {
    /// Alarm enable flags (unused by this daemon).
    pub const ALARM_ENABLE: u16 = 0;
    /// Output data format (bit 0) packed with the addup count (bits 2..7).
    pub const OUTPUT_DATA_FORMAT: u16 = 1;
    /// First rinsing time in seconds.
    pub const FIRST_RINSING_TIME: u16 = 2;
    /// Subsequent rinsing time in seconds. Must be >= 1 for the instrument's
    /// internal loop check.
    pub const SUBSEQUENT_RINSING_TIME: u16 = 3;
    /// Sampling time in seconds.
    pub const SAMPLING_TIME: u16 = 4;

    /// Real-time clock: seconds.
    pub const RTC_SECONDS: u16 = 16;
    /// Real-time clock: minutes.
    pub const RTC_MINUTES: u16 = 17;
    /// Real-time clock: hours.
    pub const RTC_HOURS: u16 = 18;
    /// Real-time clock: day of month.
    pub const RTC_DAYS: u16 = 19;
    /// Real-time clock: month.
    pub const RTC_MONTHS: u16 = 20;
    /// Real-time clock: years since 2000.
    pub const RTC_YEARS: u16 = 21;

    /// Command register, see [`Command`](super::Command).
    pub const COMMAND: u16 = 99;
}

/// Input register offsets (read-only).
pub mod input {
    /// Device info string, one character per word.
    pub const DEVICE_INFO: u16 = 0;
    /// Length of the device info string in words.
    pub const DEVICE_INFO_LEN: u16 = 48;

    /// Device id string, one character per word.
    pub const DEVICE_ID: u16 = 64;
    /// Length of the device id string in words.
    pub const DEVICE_ID_LEN: u16 = 16;

    /// Modbus register set version, rendered as `major.minor` from
    /// `raw / 100` and `raw % 100`.
    pub const REGISTERSET_VERSION: u16 = 81;

    /// Status register, bits 0..3: active, sampling, rinsing, data ready.
    pub const STATUS: u16 = 88;
    /// Error state register, bits 0..7 and 9.
    pub const ERRORSTATE: u16 = 95;

    /// Physical unit string, one character per word.
    pub const PHYSICAL_UNIT: u16 = 96;
    /// Length of the physical unit string in words.
    pub const PHYSICAL_UNIT_LEN: u16 = 16;

    /// Live counts block: timestamp seconds (first register of the block).
    pub const LIVE_TIMESTAMP_SECONDS: u16 = 256;
    /// Live counts block: timestamp minutes.
    pub const LIVE_TIMESTAMP_MINUTES: u16 = 257;
    /// Live counts block: timestamp hours.
    pub const LIVE_TIMESTAMP_HOURS: u16 = 258;
    /// Live counts block: timestamp day of month.
    pub const LIVE_TIMESTAMP_DAYS: u16 = 259;
    /// Live counts block: timestamp month.
    pub const LIVE_TIMESTAMP_MONTHS: u16 = 260;
    /// Live counts block: timestamp years since 2000.
    pub const LIVE_TIMESTAMP_YEARS: u16 = 261;
    /// Live counts: first channel status register. Each channel occupies
    /// three registers: status, count low word, count high word.
    pub const LIVE_CHANNEL_BASE: u16 = 262;
    /// Live counts: last register of the block (channel 8 count high word).
    pub const LIVE_CHANNEL_END: u16 = 285;

    /// Archive dataset block: timestamp seconds (first register).
    pub const ARCHIVE_TIMESTAMP_SECONDS: u16 = 512;
    /// Archive dataset block: timestamp minutes.
    pub const ARCHIVE_TIMESTAMP_MINUTES: u16 = 513;
    /// Archive dataset block: timestamp hours.
    pub const ARCHIVE_TIMESTAMP_HOURS: u16 = 514;
    /// Archive dataset block: timestamp day of month.
    pub const ARCHIVE_TIMESTAMP_DAYS: u16 = 515;
    /// Archive dataset block: timestamp month.
    pub const ARCHIVE_TIMESTAMP_MONTHS: u16 = 516;
    /// Archive dataset block: timestamp years since 2000.
    pub const ARCHIVE_TIMESTAMP_YEARS: u16 = 517;
    /// Archive dataset: sampling time in seconds.
    pub const ARCHIVE_SAMPLING_TIME: u16 = 518;
    /// Archive dataset: output format / addup count, packed like H0002.
    pub const ARCHIVE_OUTPUT_FORMAT: u16 = 519;
    /// Archive dataset: first channel status register (three per channel).
    pub const ARCHIVE_CHANNEL_BASE: u16 = 520;
    /// Archive dataset: last register of the block (channel 8 high word).
    pub const ARCHIVE_CHANNEL_END: u16 = 543;

    /// Total length of the archive dataset block in words.
    pub const ARCHIVE_BLOCK_LEN: u16 = ARCHIVE_CHANNEL_END + 1 - ARCHIVE_TIMESTAMP_SECONDS;
    /// Total length of the live counts block in words.
    pub const LIVE_BLOCK_LEN: u16 = LIVE_CHANNEL_END + 1 - LIVE_TIMESTAMP_SECONDS;
}

/// Values accepted by the command holding register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Command {
    /// Latch the RTC registers into the device clock.
    SetClock = 1,
    /// Save the alarm registers to non-volatile memory.
    SaveAlarmsToFlash = 8,
    /// Save the acquisition registers to non-volatile memory.
    SaveAcquisitionToFlash = 9,
    /// Stop particle acquisition.
    StopAcquisition = 16,
    /// Start particle acquisition.
    StartAcquisition = 17,
    /// Advance the archive read pointer to the next stored dataset.
    LoadNextArchiveDataset = 99,
}

impl Command {
    /// The raw register value for this command.
    #[inline]
    pub const fn value(self) -> u16 {
        self as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_lengths() {
        assert_eq!(input::LIVE_BLOCK_LEN, 30);
        assert_eq!(input::ARCHIVE_BLOCK_LEN, 32);
    }

    #[test]
    fn test_channel_blocks_cover_eight_channels() {
        assert_eq!(input::LIVE_CHANNEL_END + 1 - input::LIVE_CHANNEL_BASE, 24);
        assert_eq!(
            input::ARCHIVE_CHANNEL_END + 1 - input::ARCHIVE_CHANNEL_BASE,
            24
        );
    }

    #[test]
    fn test_command_values() {
        assert_eq!(Command::SetClock.value(), 1);
        assert_eq!(Command::SaveAcquisitionToFlash.value(), 9);
        assert_eq!(Command::StopAcquisition.value(), 16);
        assert_eq!(Command::StartAcquisition.value(), 17);
        assert_eq!(Command::LoadNextArchiveDataset.value(), 99);
    }
}
