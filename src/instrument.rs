//! The per-instrument protocol state machine.
//!
//! A [`ParticleCounter`] translates high-level intents (init, poll,
//! archive, clock) into register telegrams, reassembles the fragmented
//! multi-register replies into domain values, and tracks liveness through
//! the pending-transaction set. It never sees the registry that owns it:
//! it is wired with a [`BusRouter`] for submitting telegrams, a [`LogBook`]
//! for operator conditions and a typed event sender for assembled datasets.
//!
//! Replies must be processed in increasing register order; string registers
//! accumulate one character per word, timestamps complete when the years
//! register is consumed, and 32-bit counts assemble low word first.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use tokio::sync::mpsc;

use crate::bus::{BusManager, BusRouter};
use crate::core::data::{
    pack_output_format, unpack_output_format, ActualData, ArchiveDataset, ChannelStatus,
    ConfigData, DeviceInfo, ErrorstateRegister, OutputDataFormat, StatusRegister,
};
use crate::core::error::Result;
use crate::core::logging::{LogBook, Severity};
use crate::core::registers::{holding, input, Command};

/// Channel-1 count value marking "no archive record present".
pub const ARCHIVE_EMPTY_SENTINEL: u32 = 0xffff_ffff;

/// Assembled dataset emitted by an instrument, consumed by the measurement
/// sink and the live-subscriber fan-out.
#[derive(Debug, Clone)]
pub enum MeasurementEvent {
    /// A complete live dataset was received.
    Actual {
        /// Emitting instrument.
        id: u32,
        /// Snapshot of the live data.
        data: ActualData,
    },
    /// A complete, non-empty archive dataset was received.
    Archive {
        /// Emitting instrument.
        id: u32,
        /// The archived measurement block.
        data: ArchiveDataset,
    },
}

/// Sender half for instrument measurement events.
pub type MeasurementSender = mpsc::UnboundedSender<MeasurementEvent>;

/// Partial wall-time accumulated while walking a register response.
#[derive(Debug, Default)]
struct TimestampParts {
    seconds: u16,
    minutes: u16,
    hours: u16,
    days: u16,
    months: u16,
}

impl TimestampParts {
    /// Complete the timestamp with the (absolute) year. Implausible field
    /// combinations yield `None` and leave the previous value in place.
    fn complete(&self, year: i32) -> Option<DateTime<Utc>> {
        let date = NaiveDate::from_ymd_opt(year, self.months as u32, self.days as u32)?;
        let time = date.and_hms_opt(
            self.hours as u32,
            self.minutes as u32,
            self.seconds as u32,
        )?;
        Utc.from_utc_datetime(&time).into()
    }
}

/// One cleanroom particle counter on a field bus.
pub struct ParticleCounter {
    id: u32,
    bus_index: Option<usize>,
    unit_address: Option<u8>,

    actual_data: ActualData,
    config_data: ConfigData,
    device_info: DeviceInfo,
    status_register: StatusRegister,
    errorstate_register: ErrorstateRegister,
    physical_unit: String,
    device_clock: Option<DateTime<Utc>>,
    sampling_enabled: bool,

    pending_transactions: HashSet<u64>,
    dirty: bool,
    autosave: bool,
    file_dir: PathBuf,

    buses: BusRouter,
    log: LogBook,
    events: MeasurementSender,
}

impl ParticleCounter {
    /// Create an unconfigured instrument. Identity is set afterwards via
    /// [`set_id`](Self::set_id)/[`set_data`](Self::set_data) or
    /// [`load`](Self::load).
    pub fn new(
        buses: BusRouter,
        log: LogBook,
        events: MeasurementSender,
        file_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: 0,
            bus_index: None,
            unit_address: None,
            actual_data: ActualData::default(),
            config_data: ConfigData::default(),
            device_info: DeviceInfo::default(),
            status_register: StatusRegister::default(),
            errorstate_register: ErrorstateRegister::default(),
            physical_unit: String::new(),
            device_clock: None,
            sampling_enabled: false,
            pending_transactions: HashSet::new(),
            dirty: false,
            autosave: false,
            file_dir: file_dir.into(),
            buses,
            log,
            events,
        }
    }

    // ========================================================================
    // Identity
    // ========================================================================

    /// Central instrument id, unique within the registry.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Set the instrument id.
    pub fn set_id(&mut self, id: u32) {
        if self.id != id {
            self.id = id;
            self.mark_changed();
        }
    }

    /// Index of the serial line the instrument is connected to.
    pub fn bus_index(&self) -> Option<usize> {
        self.bus_index
    }

    /// Set the bus index.
    pub fn set_bus_index(&mut self, bus_index: Option<usize>) {
        if self.bus_index != bus_index {
            self.bus_index = bus_index;
            self.mark_changed();
        }
    }

    /// Unit address on the bus segment.
    pub fn unit_address(&self) -> Option<u8> {
        self.unit_address
    }

    /// Set the unit address.
    pub fn set_unit_address(&mut self, unit_address: Option<u8>) {
        if self.unit_address != unit_address {
            self.unit_address = unit_address;
            self.mark_changed();
        }
    }

    /// Whether both bus index and unit address are set.
    pub fn is_configured(&self) -> bool {
        self.bus_index.is_some() && self.unit_address.is_some()
    }

    fn log_source(&self) -> String {
        format!("Particle Counter id={}", self.id)
    }

    // ========================================================================
    // High-level operations (idempotent, enqueue-only)
    // ========================================================================

    /// Full initialisation after registration: set the clock, write the
    /// current configuration, request device info, enable sampling, save
    /// the settings to instrument flash and request status.
    pub fn init(&mut self) {
        self.set_clock();
        self.set_config_data(self.config_data);
        self.request_device_info();
        self.set_sampling_enabled(true);
        self.store_settings_to_flash();
        self.request_status();
    }

    /// Latch the desired acquisition state. The matching start/stop command
    /// is transmitted with every status request, because the instruments
    /// occasionally forget their acquisition state.
    pub fn set_sampling_enabled(&mut self, on: bool) {
        if self.bus(true).is_none() {
            return;
        }
        if !self.config_data.valid {
            self.request_config();
        }
        self.sampling_enabled = on;
    }

    /// Whether sampling is currently latched on.
    pub fn is_sampling(&self) -> bool {
        self.sampling_enabled
    }

    /// Command the instrument to store its acquisition registers to
    /// non-volatile memory.
    pub fn store_settings_to_flash(&mut self) {
        let Some((bus, unit)) = self.bus(true) else {
            return;
        };
        if !self.config_data.valid {
            self.request_config();
        }
        self.track(bus.write_single(
            unit,
            holding::COMMAND,
            Command::SaveAcquisitionToFlash.value(),
        ));
    }

    /// Request the device info string, device id string and register set
    /// version.
    pub fn request_device_info(&mut self) {
        let Some((bus, unit)) = self.bus(true) else {
            return;
        };
        self.track(bus.read_input(unit, input::DEVICE_INFO, input::DEVICE_INFO_LEN));
        self.track(bus.read_input(unit, input::DEVICE_ID, input::DEVICE_ID_LEN));
        self.track(bus.read_input(unit, input::REGISTERSET_VERSION, 1));
    }

    /// Re-assert the acquisition state and request status, error state and
    /// physical unit.
    pub fn request_status(&mut self) {
        let Some((bus, unit)) = self.bus(true) else {
            return;
        };
        if !self.config_data.valid {
            self.request_config();
        }

        let command = if self.sampling_enabled {
            Command::StartAcquisition
        } else {
            Command::StopAcquisition
        };
        self.track(bus.write_single(unit, holding::COMMAND, command.value()));

        self.track(bus.read_input(unit, input::STATUS, 1));
        self.track(bus.read_input(unit, input::ERRORSTATE, 1));
        self.track(bus.read_input(unit, input::PHYSICAL_UNIT, input::PHYSICAL_UNIT_LEN));
    }

    /// Read the complete archive dataset block.
    pub fn request_archive_dataset(&mut self) {
        let Some((bus, unit)) = self.bus(true) else {
            return;
        };
        if !self.config_data.valid {
            self.request_config();
        }
        self.track(bus.read_input(
            unit,
            input::ARCHIVE_TIMESTAMP_SECONDS,
            input::ARCHIVE_BLOCK_LEN,
        ));
    }

    /// Advance the instrument's archive read pointer to the next dataset.
    pub fn request_next_archive(&mut self) {
        let Some((bus, unit)) = self.bus(true) else {
            return;
        };
        if !self.config_data.valid {
            self.request_config();
        }
        self.track(bus.write_single(
            unit,
            holding::COMMAND,
            Command::LoadNextArchiveDataset.value(),
        ));
    }

    /// Read the acquisition configuration registers.
    pub fn request_config(&mut self) {
        let Some((bus, unit)) = self.bus(false) else {
            return;
        };
        self.track(bus.read_holding(unit, holding::OUTPUT_DATA_FORMAT, 1));
        self.track(bus.read_holding(unit, holding::FIRST_RINSING_TIME, 1));
        self.track(bus.read_holding(unit, holding::SUBSEQUENT_RINSING_TIME, 1));
        self.track(bus.read_holding(unit, holding::SAMPLING_TIME, 1));
    }

    /// Write an acquisition configuration to the instrument.
    pub fn set_config_data(&mut self, data: ConfigData) {
        let Some((bus, unit)) = self.bus(false) else {
            return;
        };
        self.track(bus.write_single(
            unit,
            holding::OUTPUT_DATA_FORMAT,
            pack_output_format(data.output_format, data.addup_count),
        ));
        self.track(bus.write_single(unit, holding::FIRST_RINSING_TIME, data.first_rinsing_s));
        self.track(bus.write_single(
            unit,
            holding::SUBSEQUENT_RINSING_TIME,
            data.subsequent_rinsing_s,
        ));
        self.track(bus.write_single(unit, holding::SAMPLING_TIME, data.sampling_s));
    }

    /// Read the instrument's real-time clock.
    pub fn request_clock(&mut self) {
        let Some((bus, unit)) = self.bus(false) else {
            return;
        };
        self.track(bus.read_holding(
            unit,
            holding::RTC_SECONDS,
            holding::RTC_YEARS - holding::RTC_SECONDS + 1,
        ));
    }

    /// Set the instrument's real-time clock from the current UTC wall time.
    pub fn set_clock(&mut self) {
        let Some((bus, unit)) = self.bus(false) else {
            return;
        };
        let now = Utc::now();
        use chrono::{Datelike, Timelike};
        self.track(bus.write_single(unit, holding::RTC_SECONDS, now.second() as u16));
        self.track(bus.write_single(unit, holding::RTC_MINUTES, now.minute() as u16));
        self.track(bus.write_single(unit, holding::RTC_HOURS, now.hour() as u16));
        self.track(bus.write_single(unit, holding::RTC_DAYS, now.day() as u16));
        self.track(bus.write_single(unit, holding::RTC_MONTHS, now.month() as u16));
        self.track(bus.write_single(
            unit,
            holding::RTC_YEARS,
            (now.year() - 2000).max(0) as u16,
        ));
        self.track(bus.write_single(unit, holding::COMMAND, Command::SetClock.value()));
    }

    /// Resolve the configured bus, logging configuration errors when asked.
    fn bus(&self, log_errors: bool) -> Option<(BusManager, u8)> {
        let (Some(bus_index), Some(unit)) = (self.bus_index, self.unit_address) else {
            if log_errors {
                self.log
                    .new_entry(Severity::Error, &self.log_source(), "Not configured.");
            }
            return None;
        };
        match self.buses.bus(bus_index) {
            Some(bus) => Some((bus.clone(), unit)),
            None => {
                if log_errors {
                    self.log.new_entry(
                        Severity::Error,
                        &self.log_source(),
                        &format!("Bus id {} not found.", bus_index),
                    );
                }
                None
            }
        }
    }

    fn track(&mut self, tx_id: u64) {
        self.pending_transactions.insert(tx_id);
    }

    // ========================================================================
    // String-typed data surface
    // ========================================================================

    /// The keys expanded by the `actual` sentinel.
    pub fn actual_keys() -> Vec<String> {
        ActualData::keys()
    }

    /// Snapshot of the live data.
    pub fn actual_data(&self) -> &ActualData {
        &self.actual_data
    }

    /// Read any value by name. Unknown keys return the compatibility error
    /// string verbatim.
    pub fn get_data(&self, key: &str) -> String {
        match key {
            "id" => self.id.to_string(),
            "busID" => self.bus_index.map_or(-1, |b| b as i64).to_string(),
            "unit" => self.unit_address.map_or(-1, |u| u as i64).to_string(),
            "deviceInfo" => format!("\"{}\"", self.device_info.info),
            "deviceID" => format!("\"{}\"", self.device_info.id),
            "modbusRegistersetVersion" => {
                format!("\"{}\"", self.device_info.registerset_version)
            }
            "errorstring" => self.errorstate_register.error_string(),
            _ => match self.actual_data.key_values().get(key) {
                Some(value) => value.clone(),
                None => format!("Error[Particle Counter]: Key {} not available", key),
            },
        }
    }

    /// Set a value by name. Only the identity keys are settable; everything
    /// else is silently ignored.
    pub fn set_data(&mut self, key: &str, value: &str) {
        match key {
            "busID" => {
                let parsed = value.parse::<i64>().ok().filter(|v| *v >= 0);
                self.set_bus_index(parsed.map(|v| v as usize));
            }
            "unit" => {
                let parsed = value
                    .parse::<i64>()
                    .ok()
                    .filter(|v| (0..=255).contains(v));
                self.set_unit_address(parsed.map(|v| v as u8));
            }
            _ => {}
        }
    }

    // ========================================================================
    // Bus response handling
    // ========================================================================

    /// Check whether a transaction id belongs to this instrument and,
    /// by default, consume it.
    pub fn claim_transaction(&mut self, tx_id: u64, remove: bool) -> bool {
        if remove {
            self.pending_transactions.remove(&tx_id)
        } else {
            self.pending_transactions.contains(&tx_id)
        }
    }

    /// Number of transactions currently in flight for this instrument.
    pub fn pending_transaction_count(&self) -> usize {
        self.pending_transactions.len()
    }

    /// A telegram of this instrument was lost. One lost telegram is enough
    /// to declare the instrument offline.
    pub fn handle_transaction_lost(&mut self, _tx_id: u64) {
        self.actual_data.lost_telegrams += 1;
        if self.actual_data.online {
            self.log
                .new_entry(Severity::Error, &self.log_source(), "Not online.");
            self.actual_data.online = false;
        }
    }

    /// A telegram is about to be parsed for this instrument, so it is
    /// reachable again.
    fn mark_online(&mut self) {
        if !self.actual_data.online {
            self.log
                .entry_gone(Severity::Error, &self.log_source(), "Not online.");
            self.actual_data.online = true;
        }
        self.actual_data.last_seen = Some(Utc::now());
    }

    /// Process a holding-register read, in increasing register order.
    pub fn handle_holding_registers(&mut self, unit: u8, start: u16, words: &[u16]) {
        if Some(unit) != self.unit_address {
            return;
        }
        self.mark_online();

        let mut clock = TimestampParts::default();

        let mut reg = start;
        for &raw in words {
            match reg {
                holding::OUTPUT_DATA_FORMAT => {
                    let (format, addup_count) = unpack_output_format(raw);
                    self.config_data.output_format = format;
                    self.config_data.addup_count = addup_count;
                }
                // Written plain, read plain. Older firmware documentation
                // decoded this like the packed format register; the
                // register carries a plain seconds value.
                holding::FIRST_RINSING_TIME => self.config_data.first_rinsing_s = raw,
                holding::SUBSEQUENT_RINSING_TIME => {
                    self.config_data.subsequent_rinsing_s = raw;
                }
                holding::SAMPLING_TIME => {
                    self.config_data.sampling_s = raw;
                    self.config_data.valid = true;
                }
                holding::RTC_SECONDS => clock.seconds = raw,
                holding::RTC_MINUTES => clock.minutes = raw,
                holding::RTC_HOURS => clock.hours = raw,
                holding::RTC_DAYS => clock.days = raw,
                holding::RTC_MONTHS => clock.months = raw,
                holding::RTC_YEARS => {
                    if let Some(ts) = clock.complete(raw as i32 + 2000) {
                        self.device_clock = Some(ts);
                    }
                }
                _ => {}
            }
            reg += 1;
        }
    }

    /// Process an input-register read, in increasing register order.
    pub fn handle_input_registers(&mut self, unit: u8, start: u16, words: &[u16]) {
        if Some(unit) != self.unit_address {
            return;
        }
        self.mark_online();

        const DEVICE_INFO_LAST: u16 = input::DEVICE_INFO + input::DEVICE_INFO_LEN - 1;
        const DEVICE_ID_LAST: u16 = input::DEVICE_ID + input::DEVICE_ID_LEN - 1;
        const PHYSICAL_UNIT_LAST: u16 = input::PHYSICAL_UNIT + input::PHYSICAL_UNIT_LEN - 1;

        let mut clock = TimestampParts::default();
        let mut archive = ArchiveDataset::default();

        let mut reg = start;
        for &raw in words {
            // Strings are cleared on the first word of their range; the
            // remaining words of the same response complete them.
            if reg == input::DEVICE_INFO {
                self.device_info.info.clear();
            }
            if reg == input::DEVICE_ID {
                self.device_info.id.clear();
            }
            if reg == input::PHYSICAL_UNIT {
                self.physical_unit.clear();
            }

            match reg {
                input::DEVICE_INFO..=DEVICE_INFO_LAST => {
                    if let Some(c) = char::from_u32(raw as u32) {
                        self.device_info.info.push(c);
                    }
                }
                input::DEVICE_ID..=DEVICE_ID_LAST => {
                    if let Some(c) = char::from_u32(raw as u32) {
                        self.device_info.id.push(c);
                    }
                }
                input::REGISTERSET_VERSION => {
                    self.device_info.registerset_version =
                        format!("{}.{}", raw / 100, raw % 100);
                }
                input::STATUS => {
                    self.status_register = StatusRegister::from_raw(raw);
                }
                input::ERRORSTATE => {
                    self.errorstate_register = ErrorstateRegister::from_raw(raw);
                    if raw == 0 {
                        self.actual_data.status_string = "healthy".to_string();
                        self.log.entry_gone(
                            Severity::Error,
                            &self.log_source(),
                            "Status error present.",
                        );
                    } else {
                        self.actual_data.status_string = "problem".to_string();
                        self.log.new_entry(
                            Severity::Error,
                            &self.log_source(),
                            "Status error present.",
                        );
                    }
                }
                input::PHYSICAL_UNIT..=PHYSICAL_UNIT_LAST => {
                    if let Some(c) = char::from_u32(raw as u32) {
                        self.physical_unit.push(c);
                    }
                }
                input::LIVE_TIMESTAMP_SECONDS => clock.seconds = raw,
                input::LIVE_TIMESTAMP_MINUTES => clock.minutes = raw,
                input::LIVE_TIMESTAMP_HOURS => clock.hours = raw,
                input::LIVE_TIMESTAMP_DAYS => clock.days = raw,
                input::LIVE_TIMESTAMP_MONTHS => clock.months = raw,
                input::LIVE_TIMESTAMP_YEARS => {
                    if let Some(ts) = clock.complete(raw as i32 + 2000) {
                        self.actual_data.timestamp = Some(ts);
                    }
                }
                input::LIVE_CHANNEL_BASE..=input::LIVE_CHANNEL_END => {
                    let offset = (reg - input::LIVE_CHANNEL_BASE) as usize;
                    let channel = &mut self.actual_data.channel_data[offset / 3];
                    match offset % 3 {
                        0 => channel.status = ChannelStatus::from_raw(raw),
                        1 => channel.count = raw as u32,
                        _ => {
                            channel.count |= (raw as u32) << 16;
                            if offset / 3 == 7 {
                                // Channel 8 high word is the last register of
                                // the automatic live query
                                let _ = self.events.send(MeasurementEvent::Actual {
                                    id: self.id,
                                    data: self.actual_data.clone(),
                                });
                            }
                        }
                    }
                }
                input::ARCHIVE_TIMESTAMP_SECONDS => clock.seconds = raw,
                input::ARCHIVE_TIMESTAMP_MINUTES => clock.minutes = raw,
                input::ARCHIVE_TIMESTAMP_HOURS => clock.hours = raw,
                input::ARCHIVE_TIMESTAMP_DAYS => clock.days = raw,
                input::ARCHIVE_TIMESTAMP_MONTHS => clock.months = raw,
                input::ARCHIVE_TIMESTAMP_YEARS => {
                    archive.timestamp = clock.complete(raw as i32 + 2000);
                }
                input::ARCHIVE_SAMPLING_TIME => archive.sampling_time_s = raw,
                input::ARCHIVE_OUTPUT_FORMAT => {
                    let (format, addup_count) = unpack_output_format(raw);
                    archive.output_format = format;
                    archive.addup_count = addup_count;
                }
                input::ARCHIVE_CHANNEL_BASE..=input::ARCHIVE_CHANNEL_END => {
                    let offset = (reg - input::ARCHIVE_CHANNEL_BASE) as usize;
                    let channel = &mut archive.channel_data[offset / 3];
                    match offset % 3 {
                        0 => channel.status = ChannelStatus::from_raw(raw),
                        1 => channel.count = raw as u32,
                        _ => {
                            channel.count |= (raw as u32) << 16;
                            if offset / 3 == 7
                                && archive.channel_data[0].count != ARCHIVE_EMPTY_SENTINEL
                            {
                                let _ = self.events.send(MeasurementEvent::Archive {
                                    id: self.id,
                                    data: archive.clone(),
                                });
                            }
                        }
                    }
                }
                _ => {}
            }
            reg += 1;
        }
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Path of this instrument's persistence file.
    pub fn filename(&self) -> PathBuf {
        self.file_dir
            .join(format!("particlecounter-{:06}.csv", self.id))
    }

    /// Enable or disable automatic saving on identity changes.
    pub fn set_autosave(&mut self, on: bool) {
        self.autosave = on;
    }

    fn mark_changed(&mut self) {
        self.dirty = true;
        if self.autosave {
            if let Err(e) = self.save() {
                tracing::error!(id = self.id, error = %e, "autosave failed");
            }
        }
    }

    /// Persist the instrument as a single line of space-separated
    /// `key=value` pairs. A no-op while nothing changed. The file is
    /// replaced atomically via write-then-rename.
    pub fn save(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        let line = format!(
            "id={} bus={} modbusAddress={} clockSettingLostCount={} \
             outputDataFormat={} addupCount={} firstRinsingTimeInSeconds={} \
             subsequentRinsingTimeInSeconds={} samplingTimeInSeconds={} samplingEnabled={}\n",
            self.id,
            self.bus_index.map_or(-1, |b| b as i64),
            self.unit_address.map_or(-1, |u| u as i64),
            self.actual_data.clock_setting_lost_count,
            self.config_data.output_format.raw(),
            self.config_data.addup_count,
            self.config_data.first_rinsing_s,
            self.config_data.subsequent_rinsing_s,
            self.config_data.sampling_s,
            self.sampling_enabled as u8,
        );

        std::fs::create_dir_all(&self.file_dir)?;
        let path = self.filename();
        let tmp = path.with_extension("csv.tmp");
        std::fs::write(&tmp, line)?;
        std::fs::rename(&tmp, &path)?;
        self.dirty = false;
        Ok(())
    }

    /// Load the instrument from a persisted file. Unknown keys are ignored
    /// and missing keys keep their defaults.
    pub fn load(&mut self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path)?;
        let line = content.lines().next().unwrap_or_default();

        for pair in line.split_whitespace() {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            match key {
                "id" => {
                    if let Ok(id) = value.parse() {
                        self.id = id;
                    }
                }
                "bus" => {
                    self.bus_index = value
                        .parse::<i64>()
                        .ok()
                        .filter(|v| *v >= 0)
                        .map(|v| v as usize);
                }
                "modbusAddress" => {
                    self.unit_address = value
                        .parse::<i64>()
                        .ok()
                        .filter(|v| (0..=255).contains(v))
                        .map(|v| v as u8);
                }
                "clockSettingLostCount" => {
                    if let Ok(count) = value.parse() {
                        self.actual_data.clock_setting_lost_count = count;
                    }
                }
                "outputDataFormat" => {
                    if let Ok(raw) = value.parse::<u16>() {
                        self.config_data.output_format = OutputDataFormat::from_raw(raw);
                    }
                }
                "addupCount" => {
                    if let Ok(count) = value.parse() {
                        self.config_data.addup_count = count;
                    }
                }
                "firstRinsingTimeInSeconds" => {
                    if let Ok(secs) = value.parse() {
                        self.config_data.first_rinsing_s = secs;
                    }
                }
                "subsequentRinsingTimeInSeconds" => {
                    if let Ok(secs) = value.parse() {
                        self.config_data.subsequent_rinsing_s = secs;
                    }
                }
                "samplingTimeInSeconds" => {
                    if let Ok(secs) = value.parse() {
                        self.config_data.sampling_s = secs;
                    }
                }
                "samplingEnabled" => {
                    self.sampling_enabled = value.parse::<u8>().map(|v| v != 0).unwrap_or(false);
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Remove the instrument's persistence file, if any.
    pub fn delete_file(&self) {
        if let Err(e) = std::fs::remove_file(self.filename()) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(id = self.id, error = %e, "could not remove instrument file");
            }
        }
    }

    /// Tell the operator log that this instrument's conditions are gone.
    /// Used when the instrument is deleted.
    pub fn delete_all_errors(&self) {
        let source = self.log_source();
        self.log.entry_gone(Severity::Error, &source, "Not online.");
        self.log
            .entry_gone(Severity::Warning, &source, "Warnings present.");
    }

    /// Decoded status register from the last status poll.
    pub fn status_register(&self) -> StatusRegister {
        self.status_register
    }

    /// Decoded error-state register from the last status poll.
    pub fn errorstate_register(&self) -> ErrorstateRegister {
        self.errorstate_register
    }

    /// Physical unit reported by the instrument.
    pub fn physical_unit(&self) -> &str {
        &self.physical_unit
    }

    /// Device RTC value from the last clock read.
    pub fn device_clock(&self) -> Option<DateTime<Utc>> {
        self.device_clock
    }

    /// Acquisition configuration as currently known.
    pub fn config_data(&self) -> ConfigData {
        self.config_data
    }

    #[cfg(test)]
    pub(crate) fn pending_transactions_for_test(&self) -> &HashSet<u64> {
        &self.pending_transactions
    }
}
