//! Device configuration management

use crate::monitor::MonitorTimings;
use crate::stream::StreamSettings;
use common::{Error, Result};
use protocol::{MAX_CHANNEL, Speed};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Tuning knobs for one capture device
///
/// Every field has a working default; an empty config file is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Requested receive speed; clamped to the device maximum at open
    #[serde(default = "DeviceConfig::default_speed")]
    pub speed: Speed,
    /// Output plug the isochronous connection is made on
    #[serde(default)]
    pub plug_number: u32,
    /// Retry bound for plug register compare-swap updates
    #[serde(default = "DeviceConfig::default_plug_retry_count")]
    pub plug_retry_count: u32,
    /// Retry bound for command/response exchanges
    #[serde(default = "DeviceConfig::default_command_retry_count")]
    pub command_retry_count: u32,
    /// Silence interval before the receiver reports no data, in ms
    #[serde(default = "DeviceConfig::default_no_data_timeout_ms")]
    pub no_data_timeout_ms: u64,
    /// Continuous silence that escalates to a bus reset, in ms
    #[serde(default = "DeviceConfig::default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
    /// Bus event poll interval on the monitor thread, in ms
    #[serde(default = "DeviceConfig::default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long a monitor start may take before it fails, in ms
    #[serde(default = "DeviceConfig::default_monitor_start_timeout_ms")]
    pub monitor_start_timeout_ms: u64,
    /// How long a monitor stop may take before it fails, in ms
    #[serde(default = "DeviceConfig::default_monitor_stop_timeout_ms")]
    pub monitor_stop_timeout_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            speed: Self::default_speed(),
            plug_number: 0,
            plug_retry_count: Self::default_plug_retry_count(),
            command_retry_count: Self::default_command_retry_count(),
            no_data_timeout_ms: Self::default_no_data_timeout_ms(),
            reset_timeout_ms: Self::default_reset_timeout_ms(),
            poll_interval_ms: Self::default_poll_interval_ms(),
            monitor_start_timeout_ms: Self::default_monitor_start_timeout_ms(),
            monitor_stop_timeout_ms: Self::default_monitor_stop_timeout_ms(),
        }
    }
}

impl DeviceConfig {
    fn default_speed() -> Speed {
        Speed::S100
    }

    fn default_plug_retry_count() -> u32 {
        4
    }

    fn default_command_retry_count() -> u32 {
        3
    }

    fn default_no_data_timeout_ms() -> u64 {
        300
    }

    fn default_reset_timeout_ms() -> u64 {
        1500
    }

    fn default_poll_interval_ms() -> u64 {
        100
    }

    fn default_monitor_start_timeout_ms() -> u64 {
        5_000
    }

    fn default_monitor_stop_timeout_ms() -> u64 {
        10_000
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: DeviceConfig = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;

        tracing::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.plug_number > MAX_CHANNEL as u32 {
            return Err(Error::Config(format!(
                "plug_number {} out of range (0-{})",
                self.plug_number, MAX_CHANNEL
            )));
        }
        if self.no_data_timeout_ms == 0 {
            return Err(Error::Config(
                "no_data_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.reset_timeout_ms < self.no_data_timeout_ms {
            return Err(Error::Config(format!(
                "reset_timeout_ms {} is below no_data_timeout_ms {}",
                self.reset_timeout_ms, self.no_data_timeout_ms
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::Config(
                "poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn no_data_timeout(&self) -> Duration {
        Duration::from_millis(self.no_data_timeout_ms)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    /// Monitor thread timings derived from this config
    pub fn monitor_timings(&self) -> MonitorTimings {
        MonitorTimings {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            start_timeout: Duration::from_millis(self.monitor_start_timeout_ms),
            stop_timeout: Duration::from_millis(self.monitor_stop_timeout_ms),
        }
    }

    /// Streaming parameters derived from this config
    pub fn stream_settings(&self) -> StreamSettings {
        StreamSettings {
            requested_speed: self.speed,
            plug_number: self.plug_number,
            plug_retry_count: self.plug_retry_count,
            no_data_timeout: self.no_data_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = DeviceConfig::default();
        assert_eq!(config.speed, Speed::S100);
        assert_eq!(config.no_data_timeout_ms, 300);
        assert_eq!(config.reset_timeout_ms, 1500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "speed = \"S400\"\nplug_retry_count = 8").unwrap();

        let config = DeviceConfig::load(file.path()).unwrap();
        assert_eq!(config.speed, Speed::S400);
        assert_eq!(config.plug_retry_count, 8);
        assert_eq!(config.no_data_timeout_ms, 300);
    }

    #[test]
    fn test_load_rejects_bad_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "no_data_timeout_ms = 2000\nreset_timeout_ms = 500").unwrap();
        assert!(DeviceConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        assert!(DeviceConfig::load(Path::new("/nonexistent/capture.toml")).is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = DeviceConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: DeviceConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.speed, config.speed);
        assert_eq!(parsed.no_data_timeout_ms, config.no_data_timeout_ms);
    }

    #[test]
    fn test_validate_plug_number_bounds() {
        let config = DeviceConfig {
            plug_number: 64,
            ..DeviceConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
