//! The single structured configuration file shared by all three processes.

use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("couldn't read config file `{path}`")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("couldn't parse config file `{path}`")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub ipc: IpcConfig,
    pub channel: ChannelConfig,
    pub identity: IdentityConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }
}

/// The two named sockets of the split IPC channel.
#[derive(Debug, Clone, Deserialize)]
pub struct IpcConfig {
    pub command_socket: PathBuf,
    pub callback_socket: PathBuf,
}

/// Where the realtime channel listens.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    /// Base URL of the identity collaborator, e.g. `http://127.0.0.1:3124`.
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub root: PathBuf,
}

impl StorageConfig {
    pub fn projects_dir(&self) -> PathBuf {
        self.root.join("projects")
    }

    pub fn current_project_dir(&self) -> PathBuf {
        self.projects_dir().join("current")
    }

    pub fn default_project_dir(&self) -> PathBuf {
        self.projects_dir().join("default")
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct EncryptionConfig {
    #[serde(default)]
    pub enabled: bool,
    pub passphrase: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_level")]
    pub console_level: String,
    #[serde(default = "default_level")]
    pub file_level: String,
    /// Rotate a log file once it grows past this many MiB.
    #[serde(default = "default_rotation_mb")]
    pub rotation_mb: u64,
    /// How many rotated backups to keep per stream.
    #[serde(default = "default_backup_count")]
    pub backup_count: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
            console_level: default_level(),
            file_level: default_level(),
            rotation_mb: default_rotation_mb(),
            backup_count: default_backup_count(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_owned()
}

fn default_port() -> u16 {
    8000
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("./storage/logs")
}

fn default_level() -> String {
    "info".to_owned()
}

fn default_rotation_mb() -> u64 {
    10
}

fn default_backup_count() -> usize {
    3
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
        [ipc]
        command_socket = "/run/robolink/command.sock"
        callback_socket = "/run/robolink/callback.sock"

        [channel]
        host = "127.0.0.1"
        port = 9000

        [identity]
        url = "http://127.0.0.1:3124"

        [storage]
        root = "./storage"

        [encryption]
        enabled = true
        passphrase = "ROBOT_CONTROL_SYSTEM"

        [log]
        dir = "./storage/logs"
        console_level = "info"
        file_level = "debug"
        rotation_mb = 5
        backup_count = 2
    "#;

    const MINIMAL: &str = r#"
        [ipc]
        command_socket = "/tmp/command.sock"
        callback_socket = "/tmp/callback.sock"

        [channel]

        [identity]
        url = "http://127.0.0.1:3124"

        [storage]
        root = "./storage"
    "#;

    #[test]
    fn parses_full_config() {
        let config: Config = toml::from_str(FULL).unwrap();

        assert_eq!(config.channel.port, 9000);
        assert!(config.encryption.enabled);
        assert_eq!(
            config.encryption.passphrase.as_deref(),
            Some("ROBOT_CONTROL_SYSTEM")
        );
        assert_eq!(config.log.rotation_mb, 5);
        assert_eq!(config.log.backup_count, 2);
    }

    #[test]
    fn minimal_config_fills_defaults() {
        let config: Config = toml::from_str(MINIMAL).unwrap();

        assert_eq!(config.channel.host, "0.0.0.0");
        assert_eq!(config.channel.port, 8000);
        assert!(!config.encryption.enabled);
        assert_eq!(config.log.console_level, "info");
        assert_eq!(config.log.backup_count, 3);
    }

    #[test]
    fn storage_layout() {
        let config: Config = toml::from_str(MINIMAL).unwrap();

        assert_eq!(
            config.storage.current_project_dir(),
            PathBuf::from("./storage/projects/current")
        );
        assert_eq!(
            config.storage.default_project_dir(),
            PathBuf::from("./storage/projects/default")
        );
    }
}
