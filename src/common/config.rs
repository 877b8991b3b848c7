// src/common/config.rs

use super::address::BusAddr;
use super::crc::{Crc16Arc, FrameChecksum};
use super::error::{AbcdError, Result};
use super::timing::{DEFAULT_RESYNC_WINDOW, DEFAULT_STALENESS};
use super::frame::{MAX_FRAME_LEN, MIN_FRAME_LEN};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Checksum schemes the validator can be configured with.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum ChecksumScheme {
    #[default]
    #[serde(rename = "crc16-arc")]
    Crc16Arc,
}

impl ChecksumScheme {
    pub fn build(&self) -> Arc<dyn FrameChecksum> {
        match self {
            ChecksumScheme::Crc16Arc => Arc::new(Crc16Arc),
        }
    }
}

/// Static settings for one bus monitor. Read-only once the monitor starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Listener label, used in log lines.
    pub name: String,
    /// Transport, e.g. `telnet://bridge.local:23` or `/dev/ttyUSB0`.
    pub uri: String,
    /// Fields older than this many seconds are left out of metrics.
    pub staleness_secs: u64,
    /// Bytes discarded without finding a frame before the stream counts as desynchronized.
    pub resync_window: usize,
    /// Capacity of the archive side channel.
    pub archive_queue: usize,
    /// Devices of interest. Empty means every device.
    pub addresses: Vec<BusAddr>,
    /// Reject frames whose device class is not a known bus participant.
    pub strict_addresses: bool,
    /// Decode table version.
    pub decode_table: String,
    pub checksum: ChecksumScheme,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            name: "abcd".to_string(),
            uri: String::new(),
            staleness_secs: DEFAULT_STALENESS.as_secs(),
            resync_window: DEFAULT_RESYNC_WINDOW,
            archive_queue: 1024,
            addresses: Vec::new(),
            strict_addresses: true,
            decode_table: "v1".to_string(),
            checksum: ChecksumScheme::default(),
        }
    }
}

impl MonitorConfig {
    /// Parses and validates a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: MonitorConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a YAML file. A missing file is an error; absent keys take defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading monitor config from {}", path.display());
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_yaml_str(&content)?;
        debug!(?config, "Monitor config loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.resync_window < MIN_FRAME_LEN {
            return Err(AbcdError::Config(format!(
                "resync_window must be at least {} bytes, got {}",
                MIN_FRAME_LEN, self.resync_window
            )));
        }
        if self.resync_window > 16 * MAX_FRAME_LEN {
            return Err(AbcdError::Config(format!(
                "resync_window must be at most {} bytes, got {}",
                16 * MAX_FRAME_LEN,
                self.resync_window
            )));
        }
        if self.staleness_secs == 0 {
            return Err(AbcdError::Config("staleness_secs must be greater than 0".to_string()));
        }
        if self.archive_queue == 0 {
            return Err(AbcdError::Config("archive_queue must be greater than 0".to_string()));
        }
        if self.decode_table.trim().is_empty() {
            return Err(AbcdError::Config("decode_table must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn staleness(&self) -> Duration {
        Duration::from_secs(self.staleness_secs)
    }

    /// Whether frames from `addr` should reach the aggregator.
    pub fn is_of_interest(&self, addr: BusAddr) -> bool {
        self.addresses.is_empty() || self.addresses.contains(&addr)
    }
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = MonitorConfig::default();
        assert_eq!(config.staleness_secs, 300);
        assert_eq!(config.resync_window, MAX_FRAME_LEN);
        assert_eq!(config.decode_table, "v1");
        assert!(config.strict_addresses);
        assert!(config.validate().is_ok());
        assert!(config.is_of_interest(BusAddr::THERMOSTAT));
    }

    #[test]
    fn test_from_yaml_partial() {
        let yaml = r#"
name: basement
uri: telnet://bridge.local:2323
staleness_secs: 60
addresses: ["2001", "4001"]
checksum: crc16-arc
"#;
        let config = MonitorConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.name, "basement");
        assert_eq!(config.staleness(), Duration::from_secs(60));
        assert_eq!(config.addresses, vec![BusAddr::THERMOSTAT, BusAddr::new(0x40, 0x01)]);
        assert_eq!(config.archive_queue, 1024);
        assert!(config.is_of_interest(BusAddr::new(0x40, 0x01)));
        assert!(!config.is_of_interest(BusAddr::new(0x50, 0x01)));
        assert_eq!(config.checksum.build().name(), "crc16-arc");
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            MonitorConfig::from_yaml_str("resync_window: 4"),
            Err(AbcdError::Config(_))
        ));
        assert!(matches!(
            MonitorConfig::from_yaml_str("staleness_secs: 0"),
            Err(AbcdError::Config(_))
        ));
        assert!(matches!(
            MonitorConfig::from_yaml_str("addresses: [\"20\"]"),
            Err(AbcdError::Yaml(_))
        ));
        assert!(matches!(
            MonitorConfig::from_yaml_str("checksum: additive"),
            Err(AbcdError::Yaml(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "uri: /dev/ttyUSB0\nstrict_addresses: false").unwrap();
        let config = MonitorConfig::load(file.path()).unwrap();
        assert_eq!(config.uri, "/dev/ttyUSB0");
        assert!(!config.strict_addresses);

        assert!(matches!(
            MonitorConfig::load("/nonexistent/abcd.yaml"),
            Err(AbcdError::Io(_))
        ));
    }
}
