//! Configuration file support for c2flash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (C2FLASH_*)
//! 3. Local config file (./c2flash.toml)
//! 4. Global config file (~/.config/c2flash/config.toml)
//!
//! ```toml
//! [connection]
//! serial = "/dev/ttyACM0"
//! baud = 1000000
//! timeout_ms = 1000
//! settle_ms = 2000
//!
//! [bridge]
//! board = "uno"
//! image_dir = "/usr/share/c2flash/bins"
//! bauds = [115200, 57600]
//! deadline_ms = 5000
//!
//! [read]
//! start = 0
//! size = 0x37FF
//! chunk = 16
//! ```

use c2flash::{Board, ClientConfig, InstallConfig, ReadPlan};
use directories::ProjectDirs;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the local configuration file.
pub const LOCAL_CONFIG: &str = "c2flash.toml";

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyACM0" or "COM3").
    pub serial: Option<String>,
    /// Protocol baud rate.
    pub baud: Option<u32>,
    /// Reply timeout of one exchange, in milliseconds.
    pub timeout_ms: Option<u64>,
    /// Wait after opening the port, in milliseconds.
    pub settle_ms: Option<u64>,
}

/// Bridge installation configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Default board.
    pub board: Option<Board>,
    /// Directory holding the bridge firmware images.
    pub image_dir: Option<PathBuf>,
    /// Baud rates to try, in order.
    pub bauds: Option<Vec<u32>>,
    /// Deadline of one attempt, in milliseconds.
    pub deadline_ms: Option<u64>,
}

/// Memory read configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadConfig {
    /// First address.
    pub start: Option<u32>,
    /// End address (exclusive).
    pub size: Option<u32>,
    /// Bytes per request.
    pub chunk: Option<usize>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// Connection configuration.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Bridge installation configuration.
    #[serde(default)]
    pub bridge: BridgeConfig,
    /// Memory read configuration.
    #[serde(default)]
    pub read: ReadConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "c2flash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        let Self {
            connection,
            bridge,
            read,
        } = other;

        // Connection config
        if connection.serial.is_some() {
            self.connection.serial = connection.serial;
        }
        if connection.baud.is_some() {
            self.connection.baud = connection.baud;
        }
        if connection.timeout_ms.is_some() {
            self.connection.timeout_ms = connection.timeout_ms;
        }
        if connection.settle_ms.is_some() {
            self.connection.settle_ms = connection.settle_ms;
        }

        // Bridge config
        if bridge.board.is_some() {
            self.bridge.board = bridge.board;
        }
        if bridge.image_dir.is_some() {
            self.bridge.image_dir = bridge.image_dir;
        }
        if bridge.bauds.is_some() {
            self.bridge.bauds = bridge.bauds;
        }
        if bridge.deadline_ms.is_some() {
            self.bridge.deadline_ms = bridge.deadline_ms;
        }

        // Read config
        if read.start.is_some() {
            self.read.start = read.start;
        }
        if read.size.is_some() {
            self.read.size = read.size;
        }
        if read.chunk.is_some() {
            self.read.chunk = read.chunk;
        }
    }

    /// Protocol settings, with `baud` from the command line taking priority.
    pub fn client_config(&self, baud: Option<u32>) -> ClientConfig {
        let defaults = ClientConfig::default();
        ClientConfig {
            baud_rate: baud
                .or(self.connection.baud)
                .unwrap_or(defaults.baud_rate),
            timeout: self
                .connection
                .timeout_ms
                .map_or(defaults.timeout, Duration::from_millis),
            settle: self
                .connection
                .settle_ms
                .map_or(defaults.settle, Duration::from_millis),
        }
    }

    /// Bridge installation settings for `board`.
    pub fn install_config(&self, board: Option<Board>) -> InstallConfig {
        let defaults = InstallConfig::default();
        InstallConfig {
            bauds: self
                .bridge
                .bauds
                .clone()
                .filter(|b| !b.is_empty())
                .unwrap_or(defaults.bauds),
            deadline: self
                .bridge
                .deadline_ms
                .map_or(defaults.deadline, Duration::from_millis),
            board: board
                .or(self.bridge.board)
                .unwrap_or(defaults.board),
            ..defaults
        }
    }

    /// Read plan, with command-line values taking priority.
    pub fn read_plan(&self, start: Option<u32>, size: Option<u32>, chunk: Option<usize>) -> ReadPlan {
        let defaults = ReadPlan::default();
        ReadPlan {
            start: start
                .or(self.read.start)
                .unwrap_or(defaults.start),
            size: size
                .or(self.read.size)
                .unwrap_or(defaults.size),
            chunk: chunk
                .or(self.read.chunk)
                .unwrap_or(defaults.chunk),
        }
    }

    /// Remember the serial port in the local configuration file.
    pub fn save_port(&mut self, serial: &str) -> anyhow::Result<()> {
        let path = Path::new(LOCAL_CONFIG);
        let mut local = Self::load_from_file(path).unwrap_or_default();
        local.connection.serial = Some(serial.to_string());

        let content = toml::to_string_pretty(&local)?;
        fs::write(path, content)?;
        self.connection.serial = Some(serial.to_string());
        info!("Saved port configuration to {}", path.display());

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.connection.serial.is_none());
        assert!(config.connection.baud.is_none());
        assert!(config.bridge.board.is_none());
        assert!(config.read.chunk.is_none());
    }

    #[test]
    fn test_defaults_resolve_to_library_defaults() {
        let config = Config::default();
        assert_eq!(config.client_config(None), ClientConfig::default());
        assert_eq!(config.install_config(None), InstallConfig::default());
        assert_eq!(config.read_plan(None, None, None), ReadPlan::default());
    }

    #[test]
    fn test_cli_values_override_file() {
        let mut config = Config::default();
        config.connection.baud = Some(500_000);
        config.read.chunk = Some(0x20);
        config.bridge.board = Some(Board::Nano);

        assert_eq!(config.client_config(None).baud_rate, 500_000);
        assert_eq!(config.client_config(Some(1_000_000)).baud_rate, 1_000_000);
        assert_eq!(config.read_plan(None, None, None).chunk, 0x20);
        assert_eq!(config.read_plan(None, None, Some(8)).chunk, 8);
        assert_eq!(config.install_config(None).board, Board::Nano);
        assert_eq!(config.install_config(Some(Board::Uno)).board, Board::Uno);
    }

    #[test]
    fn test_empty_baud_list_falls_back() {
        let mut config = Config::default();
        config.bridge.bauds = Some(Vec::new());
        assert_eq!(config.install_config(None).bauds, vec![115_200, 57_600]);
    }

    #[test]
    fn test_config_merge() {
        let mut base = Config::default();
        base.connection.serial = Some("/dev/ttyUSB0".to_string());
        base.read.size = Some(0x100);

        let mut other = Config::default();
        other.connection.serial = Some("/dev/ttyACM0".to_string());
        other.bridge.deadline_ms = Some(8000);

        base.merge(other);
        assert_eq!(base.connection.serial.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(base.bridge.deadline_ms, Some(8000));
        // Untouched fields survive
        assert_eq!(base.read.size, Some(0x100));
    }

    #[test]
    fn test_parse_toml() {
        let content = r#"
            [connection]
            serial = "COM3"
            timeout_ms = 250

            [bridge]
            board = "nano"
            bauds = [57600]

            [read]
            start = 256
            size = 512
        "#;
        let config: Config = toml::from_str(content).unwrap();
        assert_eq!(config.connection.serial.as_deref(), Some("COM3"));
        assert_eq!(config.client_config(None).timeout, Duration::from_millis(250));
        assert_eq!(config.bridge.board, Some(Board::Nano));
        assert_eq!(config.install_config(None).bauds, vec![57_600]);
        assert_eq!(config.read_plan(None, None, None).start, 256);
    }

    #[test]
    fn test_load_from_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.toml");

        let mut config = Config::default();
        config.connection.serial = Some("/dev/ttyACM1".into());
        config.bridge.image_dir = Some(PathBuf::from("/opt/bins"));
        fs::write(&path, toml::to_string_pretty(&config).unwrap()).unwrap();

        let loaded = Config::load_from_path(&path);
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_from_path_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "this is not [valid toml").unwrap();

        assert_eq!(Config::load_from_path(&path), Config::default());
    }

    #[test]
    fn test_load_from_path_missing_file() {
        let config = Config::load_from_path(Path::new("/nonexistent/c2flash.toml"));
        assert_eq!(config, Config::default());
    }
}
