//! Configuration structs with sensible defaults and RON persistence.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// File name of the persisted server configuration.
pub const CONFIG_FILE_NAME: &str = "ServerConfig.ron";

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Identity, capacity and world settings.
    pub general: GeneralConfig,
    /// Player admission and session quota settings.
    pub auth: AuthConfig,
    /// Wire protocol compatibility and timing.
    pub protocol: ProtocolConfig,
    /// Log output settings.
    pub logging: LoggingConfig,
}

/// General server settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeneralConfig {
    /// Server name shown in the server browser.
    pub name: String,
    /// Free-form server description.
    pub description: String,
    /// Comma separated browser tags.
    pub tags: String,
    /// TCP and UDP port to listen on.
    pub port: u16,
    /// Maximum number of concurrently reserved player slots.
    pub max_players: u32,
    /// Maximum number of vehicles per player.
    pub max_cars: u32,
    /// Path of the map the clients are told to load.
    pub map: String,
    /// Server password. Empty disables the password step.
    pub password: String,
    /// Folder client/server resources are loaded from.
    pub resource_folder: String,
    /// Hide the server from the public browser.
    pub private: bool,
}

/// A time limit that can be switched off.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QuotaConfig {
    /// Whether the limit applies at all.
    pub enable: bool,
    /// Length of the limit in seconds.
    pub seconds: u64,
}

impl QuotaConfig {
    /// The limit as a duration, or `None` when disabled.
    pub fn duration(&self) -> Option<Duration> {
        self.enable.then(|| Duration::from_secs(self.seconds))
    }
}

/// Authentication and session quota settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    /// How long a loading player may stay idle before its slot is reclaimed.
    pub idle: QuotaConfig,
    /// How long a player may stay online before its slot is reclaimed.
    pub online: QuotaConfig,
    /// Longest authentication key accepted from a client, in bytes.
    pub max_key_length: usize,
    /// Base URL of the account verification API.
    pub api_url: String,
}

/// Wire protocol compatibility and timing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Oldest accepted client protocol version (inclusive).
    pub min_client_version: String,
    /// First rejected client protocol version (exclusive).
    pub max_client_version: String,
    /// Deadline for a single read during the handshake and gameplay, in seconds.
    pub read_timeout_secs: u64,
    /// How long the mod sync phase tolerates silence, in seconds.
    pub mod_sync_grace_secs: u64,
}

impl ProtocolConfig {
    /// Per-read deadline.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Mod sync silence tolerance.
    pub fn mod_sync_grace(&self) -> Duration {
        Duration::from_secs(self.mod_sync_grace_secs)
    }
}

/// Log output configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, e.g. "info" or "info,netbeams_net=debug".
    pub level: String,
    /// Directory for the JSON log file. Empty disables file output.
    pub log_dir: String,
}

// --- Default implementations ---

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: "NetBeams Server".to_string(),
            description: "A BeamMP server written in Rust".to_string(),
            tags: "Freeroam, NetBeams".to_string(),
            port: 30814,
            max_players: 10,
            max_cars: 2,
            map: "/levels/gridmap_v2/info.json".to_string(),
            password: String::new(),
            resource_folder: "Resources".to_string(),
            private: true,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            idle: QuotaConfig {
                enable: true,
                seconds: 600,
            },
            online: QuotaConfig {
                enable: false,
                seconds: 7200,
            },
            max_key_length: 50,
            api_url: "https://auth.beammp.com".to_string(),
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            min_client_version: "2.0.0".to_string(),
            max_client_version: "3.0.0".to_string(),
            read_timeout_secs: 5,
            mod_sync_grace_secs: 5,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: String::new(),
        }
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE_NAME);

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::warn!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join(CONFIG_FILE_NAME);
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Re-read the file: `Some(new_config)` if it changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE_NAME);
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}
