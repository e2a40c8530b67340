use std::path::{Path, PathBuf};
use serde::Deserialize;
use anyhow::{Context, Result};

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Tuning for source selection, the Apple fast filter, and the
/// unavailable-tracking sweep.
#[derive(Debug, Clone, Deserialize)]
pub struct ManagerConfig {
    /// Assumed advertising interval when nothing has been measured yet.
    #[serde(default = "default_stale_seconds")]
    pub default_stale_seconds: f64,
    /// Minimum RSSI gain (dBm) for a different source to take over an
    /// address before it goes stale.
    #[serde(default = "default_rssi_switch_threshold")]
    pub rssi_switch_threshold: i16,
    /// Leeway added on top of the measured interval; scanners buffer
    /// packets so advertisements arrive slightly late.
    #[serde(default = "default_tracker_wobble_seconds")]
    pub tracker_wobble_seconds: f64,
    /// Apple (0x004C) manufacturer-data first bytes that are worth
    /// dispatching to subscribers.
    #[serde(default = "default_apple_allowed_first_bytes")]
    pub apple_allowed_first_bytes: Vec<u8>,
    /// Cadence of the unavailable-tracking sweep.
    #[serde(default = "default_unavailable_track_seconds")]
    pub unavailable_track_seconds: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScannerConfig {
    /// Seconds before a remote scanner forgets a device it stopped hearing.
    #[serde(default = "default_expire_seconds")]
    pub expire_seconds: f64,
    /// Cadence of the local-scanner watchdog.
    #[serde(default = "default_watchdog_interval")]
    pub watchdog_interval: f64,
    /// Silence threshold after which a local scanner is restarted.
    #[serde(default = "default_watchdog_timeout")]
    pub watchdog_timeout: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_history_path")]
    pub history_path: PathBuf,
}

fn default_stale_seconds() -> f64 {
    60.0
}

fn default_rssi_switch_threshold() -> i16 {
    16
}

fn default_tracker_wobble_seconds() -> f64 {
    3.0
}

fn default_apple_allowed_first_bytes() -> Vec<u8> {
    // iBeacon, AirDrop/HomeKit, HomeKit notify, Device-ID, FindMy.
    vec![0x02, 0x05, 0x06, 0x10, 0x12]
}

fn default_unavailable_track_seconds() -> f64 {
    30.0
}

fn default_expire_seconds() -> f64 {
    195.0
}

fn default_watchdog_interval() -> f64 {
    30.0
}

fn default_watchdog_timeout() -> f64 {
    90.0
}

fn default_history_path() -> PathBuf {
    PathBuf::from("/var/lib/ble-centrald/history.json")
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            default_stale_seconds: default_stale_seconds(),
            rssi_switch_threshold: default_rssi_switch_threshold(),
            tracker_wobble_seconds: default_tracker_wobble_seconds(),
            apple_allowed_first_bytes: default_apple_allowed_first_bytes(),
            unavailable_track_seconds: default_unavailable_track_seconds(),
        }
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            expire_seconds: default_expire_seconds(),
            watchdog_interval: default_watchdog_interval(),
            watchdog_timeout: default_watchdog_timeout(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            history_path: default_history_path(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }
}

impl ManagerConfig {
    pub fn with_rssi_switch_threshold(mut self, dbm: i16) -> Self {
        self.rssi_switch_threshold = dbm;
        self
    }

    pub fn with_default_stale_seconds(mut self, seconds: f64) -> Self {
        self.default_stale_seconds = seconds;
        self
    }

    pub fn with_tracker_wobble_seconds(mut self, seconds: f64) -> Self {
        self.tracker_wobble_seconds = seconds;
        self
    }

    pub fn with_apple_allowed_first_bytes(mut self, bytes: Vec<u8>) -> Self {
        self.apple_allowed_first_bytes = bytes;
        self
    }
}

impl ScannerConfig {
    pub fn with_expire_seconds(mut self, seconds: f64) -> Self {
        self.expire_seconds = seconds;
        self
    }

    pub fn with_watchdog(mut self, interval: f64, timeout: f64) -> Self {
        self.watchdog_interval = interval;
        self.watchdog_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_constants() {
        let config = Config::default();
        assert_eq!(config.manager.rssi_switch_threshold, 16);
        assert_eq!(config.manager.default_stale_seconds, 60.0);
        assert_eq!(config.manager.tracker_wobble_seconds, 3.0);
        assert_eq!(config.scanner.watchdog_interval, 30.0);
        assert_eq!(config.scanner.watchdog_timeout, 90.0);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [manager]
            rssi_switch_threshold = 8

            [scanner]
            expire_seconds = 120.0
            "#,
        )
        .unwrap();
        assert_eq!(config.manager.rssi_switch_threshold, 8);
        assert_eq!(config.manager.tracker_wobble_seconds, 3.0);
        assert_eq!(config.scanner.expire_seconds, 120.0);
        assert_eq!(config.scanner.watchdog_timeout, 90.0);
    }
}
