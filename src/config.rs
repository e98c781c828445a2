//! Daemon configuration.
//!
//! The configuration file is the historical INI file at
//! `/etc/openffucontrol/particleserver/config.ini`. It is loaded exactly
//! once at startup into an immutable [`DaemonConfig`] that is passed
//! explicitly to every component that needs it.

use ini::Ini;

use crate::core::error::{Result, ServerError};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/openffucontrol/particleserver/config.ini";

/// Default directory for persisted instrument files.
pub const DEFAULT_DATA_DIR: &str = "/var/openffucontrol/particlecounters/";

/// Default inter-telegram transmit delay in milliseconds.
pub const DEFAULT_TX_DELAY_MS: u64 = 200;

/// Time-series sink target, `[influxDB]` section.
#[derive(Debug, Clone)]
pub struct InfluxConfig {
    /// Database host.
    pub hostname: String,
    /// Database HTTP port.
    pub port: u16,
    /// Basic-auth user, empty to disable authentication.
    pub username: String,
    /// Basic-auth password.
    pub password: String,
    /// Database name for the `/write?db=` query.
    pub database: String,
    /// Line-protocol measurement name.
    pub measurement_name: String,
    /// Optional room tag added to every point.
    pub room: String,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            port: 8086,
            username: String::new(),
            password: String::new(),
            database: String::new(),
            measurement_name: String::new(),
            room: String::new(),
        }
    }
}

/// One serial line of the particle counter field bus,
/// `[interfacesParticleCounterModBus]` section.
#[derive(Debug, Clone)]
pub struct BusInterfaceConfig {
    /// Device path of the serial line, e.g. `/dev/ttyUSB0`.
    pub device: String,
    /// Second device path of a redundant bus pair. Accepted in the
    /// configuration but not implemented; only `device` is opened.
    pub redundant_device: Option<String>,
}

/// Complete, immutable daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Time-series sink target.
    pub influx: InfluxConfig,
    /// Serial lines, indexed by bus number 0..N-1.
    pub buses: Vec<BusInterfaceConfig>,
    /// Inter-telegram transmit delay in milliseconds.
    pub tx_delay_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            influx: InfluxConfig::default(),
            buses: Vec::new(),
            tx_delay_ms: DEFAULT_TX_DELAY_MS,
        }
    }
}

impl DaemonConfig {
    /// Load the configuration from an INI file.
    pub fn load(path: &str) -> Result<Self> {
        let ini = Ini::load_from_file(path)
            .map_err(|e| ServerError::Config(format!("{}: {}", path, e)))?;
        Ok(Self::from_ini(&ini))
    }

    /// Build the configuration from parsed INI data. Missing sections and
    /// keys fall back to defaults.
    pub fn from_ini(ini: &Ini) -> Self {
        let mut config = Self::default();

        if let Some(section) = ini.section(Some("influxDB")) {
            let get = |key: &str| section.get(key).unwrap_or_default().to_string();
            config.influx.hostname = section.get("hostname").unwrap_or("localhost").to_string();
            config.influx.port = section
                .get("port")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8086);
            config.influx.username = get("username");
            config.influx.password = get("password");
            config.influx.database = get("database");
            config.influx.measurement_name = get("measurementName");
            config.influx.room = get("room");
        }

        if let Some(section) = ini.section(Some("interfacesParticleCounterModBus")) {
            // Bus index is the position in the key-sorted pcmodbusN list
            let mut entries: Vec<(&str, &str)> = section
                .iter()
                .filter(|(key, _)| key.starts_with("pcmodbus"))
                .collect();
            entries.sort_by_key(|(key, _)| *key);

            for (_, value) in entries {
                let mut interfaces = value.split(',').map(str::trim).filter(|s| !s.is_empty());
                let Some(first) = interfaces.next() else {
                    continue;
                };
                config.buses.push(BusInterfaceConfig {
                    device: format!("/dev/{}", first),
                    redundant_device: interfaces.next().map(|i| format!("/dev/{}", i)),
                });
            }

            if let Some(delay) = section.get("txDelay").and_then(|v| v.parse().ok()) {
                config.tx_delay_ms = delay;
            }
        }

        config
    }
}
