//! Time-series measurement sink.
//!
//! Assembled datasets are rendered to InfluxDB line protocol, one point
//! per channel whose status is not OFF, and posted fire-and-forget to
//! `POST /write?db=<name>`. Posting runs on its own task behind an
//! unbounded channel, so the instrument that emitted the dataset never
//! waits for the database. Failures are logged and not retried.

use tokio::sync::mpsc;

use crate::config::InfluxConfig;
use crate::core::data::{ActualData, ArchiveDataset, ChannelData, ChannelStatus};
use crate::core::logging::{LogBook, Severity};
use crate::instrument::MeasurementEvent;

const LOG_SOURCE: &str = "InfluxDB";

/// Render one line-protocol point.
///
/// `tag_room` is only emitted when a room is configured; without it the tag
/// list keeps its historical trailing comma:
/// `particles,tag_id=7,tag_channel=2, id=7i,channel=2i,counts=15i <ns>`.
pub fn format_point(
    measurement: &str,
    room: &str,
    id: u32,
    channel: &ChannelData,
    timestamp_ns: i64,
) -> String {
    let mut line = format!(
        "{},tag_id={},tag_channel={},",
        measurement, id, channel.channel
    );
    if !room.is_empty() {
        line.push_str(&format!("tag_room={}", room));
    }
    line.push_str(&format!(
        " id={}i,channel={}i,counts={}i {}",
        id, channel.channel, channel.count, timestamp_ns
    ));
    line
}

fn channel_lines(
    measurement: &str,
    room: &str,
    id: u32,
    channels: &[ChannelData; 8],
    timestamp_ns: Option<i64>,
) -> Vec<String> {
    let Some(timestamp_ns) = timestamp_ns else {
        return Vec::new();
    };
    channels
        .iter()
        .filter(|ch| ch.status != ChannelStatus::Off)
        .map(|ch| format_point(measurement, room, id, ch, timestamp_ns))
        .collect()
}

/// One point per active channel of an archive dataset, timestamped in
/// nanoseconds since the Unix epoch.
pub fn archive_lines(
    measurement: &str,
    room: &str,
    id: u32,
    archive: &ArchiveDataset,
) -> Vec<String> {
    let ns = archive.timestamp.and_then(|ts| ts.timestamp_nanos_opt());
    channel_lines(measurement, room, id, &archive.channel_data, ns)
}

/// One point per active channel of a live dataset, mirroring the archive
/// path.
pub fn actual_lines(measurement: &str, room: &str, id: u32, actual: &ActualData) -> Vec<String> {
    let ns = actual.timestamp.and_then(|ts| ts.timestamp_nanos_opt());
    channel_lines(measurement, room, id, &actual.channel_data, ns)
}

/// Handle for submitting datasets to the sink. Cheap to clone.
#[derive(Clone)]
pub struct MeasurementSink {
    measurement: String,
    room: String,
    lines: mpsc::UnboundedSender<String>,
}

impl MeasurementSink {
    /// Create the sink and spawn its posting task.
    pub fn spawn(config: &InfluxConfig, log: LogBook) -> Self {
        let (lines_tx, lines_rx) = mpsc::unbounded_channel();
        let poster = InfluxPoster::new(config, log);
        tokio::spawn(poster.run(lines_rx));

        Self {
            measurement: config.measurement_name.clone(),
            room: config.room.clone(),
            lines: lines_tx,
        }
    }

    /// Route one instrument measurement event into the sink.
    pub fn handle_event(&self, event: &MeasurementEvent) {
        match event {
            MeasurementEvent::Actual { id, data } => self.on_actual_data(*id, data),
            MeasurementEvent::Archive { id, data } => self.on_archive_data(*id, data),
        }
    }

    /// Submit a live dataset.
    pub fn on_actual_data(&self, id: u32, actual: &ActualData) {
        for line in actual_lines(&self.measurement, &self.room, id, actual) {
            let _ = self.lines.send(line);
        }
    }

    /// Submit an archive dataset.
    pub fn on_archive_data(&self, id: u32, archive: &ArchiveDataset) {
        for line in archive_lines(&self.measurement, &self.room, id, archive) {
            let _ = self.lines.send(line);
        }
    }
}

/// The posting worker: owns the HTTP client and the write endpoint.
struct InfluxPoster {
    client: reqwest::Client,
    url: String,
    database: String,
    username: String,
    password: String,
    log: LogBook,
}

impl InfluxPoster {
    fn new(config: &InfluxConfig, log: LogBook) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: format!("http://{}:{}/write", config.hostname, config.port),
            database: config.database.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            log,
        }
    }

    async fn run(self, mut lines: mpsc::UnboundedReceiver<String>) {
        while let Some(line) = lines.recv().await {
            self.post(line).await;
        }
    }

    async fn post(&self, line: String) {
        let mut request = self
            .client
            .post(&self.url)
            .query(&[("db", self.database.as_str())]);
        if !self.username.is_empty() && !self.password.is_empty() {
            request = request.basic_auth(&self.username, Some(&self.password));
        }

        match request.body(line).send().await {
            Ok(response) if !response.status().is_success() => {
                let status = response.status();
                tracing::warn!(%status, "time-series write rejected");
                self.log.new_entry(
                    Severity::Error,
                    LOG_SOURCE,
                    &format!("Write rejected with status {}.", status),
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "time-series write failed");
                self.log
                    .new_entry(Severity::Error, LOG_SOURCE, "Write failed.");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::empty_channels;
    use chrono::TimeZone;
    use chrono::Utc;

    fn archive_with_channel2() -> ArchiveDataset {
        let mut archive = ArchiveDataset::default();
        archive.timestamp = Utc.timestamp_opt(1_678_388_136, 783_721_259).single();
        archive.channel_data[1].status = ChannelStatus::Ok;
        archive.channel_data[1].count = 15;
        archive
    }

    #[test]
    fn test_archive_line_wire_format() {
        let lines = archive_lines("particles", "", 7, &archive_with_channel2());

        assert_eq!(lines.len(), 1);
        assert_eq!(
            lines[0],
            "particles,tag_id=7,tag_channel=2, id=7i,channel=2i,counts=15i 1678388136783721259"
        );
    }

    #[test]
    fn test_room_tag_when_configured() {
        let lines = archive_lines("particles", "iso5", 7, &archive_with_channel2());
        assert_eq!(
            lines[0],
            "particles,tag_id=7,tag_channel=2,tag_room=iso5 id=7i,channel=2i,counts=15i 1678388136783721259"
        );
    }

    #[test]
    fn test_one_line_per_active_channel() {
        let mut archive = archive_with_channel2();
        archive.channel_data[0].status = ChannelStatus::Warning;
        archive.channel_data[0].count = 99;
        archive.channel_data[7].status = ChannelStatus::Alarm;

        let lines = archive_lines("particles", "", 3, &archive);
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("tag_channel=1,"));
        assert!(lines[1].contains("tag_channel=2,"));
        assert!(lines[2].contains("tag_channel=8,"));
    }

    #[test]
    fn test_live_path_mirrors_archive_path() {
        let mut actual = ActualData::default();
        actual.timestamp = Utc.timestamp_opt(1_678_388_136, 0).single();
        actual.channel_data[1].status = ChannelStatus::Ok;
        actual.channel_data[1].count = 15;

        let lines = actual_lines("particles", "", 7, &actual);
        assert_eq!(
            lines,
            vec![
                "particles,tag_id=7,tag_channel=2, id=7i,channel=2i,counts=15i 1678388136000000000"
                    .to_string()
            ]
        );
    }

    #[test]
    fn test_all_channels_off_emits_nothing() {
        let mut actual = ActualData::default();
        actual.timestamp = Utc.timestamp_opt(1_678_388_136, 0).single();
        actual.channel_data = empty_channels();

        assert!(actual_lines("particles", "", 7, &actual).is_empty());
    }

    #[test]
    fn test_missing_timestamp_emits_nothing() {
        let mut archive = archive_with_channel2();
        archive.timestamp = None;

        assert!(archive_lines("particles", "", 7, &archive).is_empty());
    }
}
