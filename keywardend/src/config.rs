use keywarden_common::tracing;
use keywarden_common::{DEFAULT_KEYS_DIR, DEFAULT_SOCKET_PATH};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/keywardend/config.yaml";

/// Daemon configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub daemon: DaemonSettings,
    pub devices: DeviceSettings,
    pub uinput: UinputSettings,
    pub peer: PeerSettings,
}

/// Daemon-specific settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSettings {
    pub socket_path: String,
    pub keys_dir: String,
    pub log_level: String,
}

/// Input device selection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Explicit `/dev/input/event*` paths to grab. When empty, every
    /// device advertising keyboard capability is grabbed.
    pub paths: Vec<String>,
}

/// Synthetic output device settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UinputSettings {
    /// Delay between written events in microseconds.
    pub event_delay_us: u64,
}

/// Macro daemon socket settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSettings {
    /// How long to wait for one response record before declaring the
    /// macro daemon dead.
    pub recv_timeout_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            daemon: DaemonSettings {
                socket_path: DEFAULT_SOCKET_PATH.to_string(),
                keys_dir: DEFAULT_KEYS_DIR.to_string(),
                log_level: "info".to_string(),
            },
            devices: DeviceSettings { paths: Vec::new() },
            uinput: UinputSettings {
                event_delay_us: 3800,
            },
            peer: PeerSettings {
                recv_timeout_ms: 1000,
            },
        }
    }
}

impl DaemonConfig {
    /// Load configuration from disk
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = fs::read_to_string(path.as_ref())?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from disk, falling back to defaults when the
    /// file does not exist.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if path.exists() {
            match Self::load(path) {
                Ok(config) => {
                    info!("Loaded configuration from {}", path.display());
                    return config;
                }
                Err(e) => {
                    warn!(
                        "Failed to parse configuration {}: {}, using defaults",
                        path.display(),
                        e
                    );
                }
            }
        } else {
            warn!(
                "Configuration file {} not found, using defaults",
                path.display()
            );
        }
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.daemon.socket_path, DEFAULT_SOCKET_PATH);
        assert_eq!(config.uinput.event_delay_us, 3800);
        assert!(config.devices.paths.is_empty());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = DaemonConfig::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: DaemonConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.daemon.keys_dir, config.daemon.keys_dir);
        assert_eq!(parsed.peer.recv_timeout_ms, config.peer.recv_timeout_ms);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "daemon:\n  socket_path: /tmp/test.sock\n  keys_dir: /tmp/keys\n  log_level: debug\ndevices:\n  paths: [/dev/input/event3]\nuinput:\n  event_delay_us: 100\npeer:\n  recv_timeout_ms: 250\n"
        )
        .unwrap();

        let config = DaemonConfig::load(file.path()).unwrap();
        assert_eq!(config.daemon.socket_path, "/tmp/test.sock");
        assert_eq!(config.devices.paths, vec!["/dev/input/event3"]);
        assert_eq!(config.uinput.event_delay_us, 100);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = DaemonConfig::load_or_default("/nonexistent/config.yaml");
        assert_eq!(config.daemon.log_level, "info");
    }
}
