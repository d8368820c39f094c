use std::time::Duration;
use std::{env, fmt, fs, io, path};

use serde::{Deserialize, Serialize};
use sitewatch::{ConcurrencyGate, MonitorConfig, OverlapPolicy, StoreLimits};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    ReadFailed { path: path::PathBuf, source: io::Error },

    #[error("failed to write {path}: {source}")]
    WriteFailed { path: path::PathBuf, source: io::Error },

    #[error("failed to parse config: {0}")]
    ParseFailed(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    SerializeFailed(#[from] toml::ser::Error),

    #[error("no config directory, set XDG_CONFIG_HOME or HOME")]
    ConfigPathUnavailable,

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: Server,
    pub storage: Storage,
    pub monitor: Monitor,
    pub limits: Limits,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Server {
    pub bind: String,
    pub port: u16,
    pub log_level: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    #[default]
    Memory,
    Libsql,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Storage {
    pub backend: Backend,
    /// Database file, only used by the libsql backend
    pub path: path::PathBuf,
    pub pool_size: usize,
    pub deadline_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Monitor {
    pub interval_secs: u64,
    pub ping_timeout_secs: u64,
    pub max_concurrent_probes: usize,
    pub overlap: OverlapPolicy,
    pub heartbeat_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_endpoints: u64,
    pub max_read_only_keys: u64,
}

impl Default for Server {
    fn default() -> Self {
        Self { bind: "0.0.0.0".into(), port: 8080, log_level: "info".into() }
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self { backend: Backend::Memory, path: "sitewatch.db".into(), pool_size: 8, deadline_secs: 5 }
    }
}

impl Default for Monitor {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            ping_timeout_secs: 5,
            max_concurrent_probes: 3,
            overlap: OverlapPolicy::Allow,
            heartbeat_secs: 5,
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        let limits = StoreLimits::default();
        Self { max_endpoints: limits.max_endpoints, max_read_only_keys: limits.max_read_only_keys }
    }
}

impl Storage {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

impl Monitor {
    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            interval: Duration::from_secs(self.interval_secs),
            ping_timeout: Duration::from_secs(self.ping_timeout_secs),
            max_concurrent_probes: self.max_concurrent_probes,
            overlap: self.overlap,
        }
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

impl Limits {
    pub fn store_limits(&self) -> StoreLimits {
        StoreLimits { max_endpoints: self.max_endpoints, max_read_only_keys: self.max_read_only_keys }
    }
}

/// Used to ensure we are actually reading a toml file
fn normalize_toml_path(path: &path::Path) -> path::PathBuf {
    let mut path = path.to_path_buf();
    if path.extension().map(|ext| ext != "toml").unwrap_or(true) {
        path.set_extension("toml");
    }
    path
}

/// Get default config path ($XDG_CONFIG_HOME/sitewatch/config.toml or
/// $HOME/.config/...)
fn default_config_path() -> Result<path::PathBuf, ConfigError> {
    let path = if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
        path::PathBuf::from(config_home)
    } else if let Some(home_dir) = env::home_dir() {
        home_dir.join(".config")
    } else {
        return Err(ConfigError::ConfigPathUnavailable);
    };

    Ok(path.join("sitewatch/config.toml"))
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let write_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str, value: &dyn fmt::Display| {
                writeln!(f, "  {:indent$}{}: {}", "", label, value, indent = level * 2)
            }
        };
        let write_title_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str| {
                writeln!(f, "{:indent$}{}", "", label, indent = level * 2)
            }
        };

        let write_title_1 = write_title_indented(1);
        let write_1 = write_indented(1);

        writeln!(f, "Current Internal Configuration State:")?;
        write_title_1(f, "Server")?;
        write_1(f, "Bind Address", &self.server.bind)?;
        write_1(f, "Port", &self.server.port)?;
        write_1(f, "Log Level", &self.server.log_level)?;

        write_title_1(f, "Storage")?;
        write_1(f, "Backend", &format!("{:?}", self.storage.backend))?;
        write_1(f, "Path", &self.storage.path.display())?;
        write_1(f, "Pool Size", &self.storage.pool_size)?;
        write_1(f, "Deadline (s)", &self.storage.deadline_secs)?;

        write_title_1(f, "Monitor")?;
        write_1(f, "Interval (s)", &self.monitor.interval_secs)?;
        write_1(f, "Ping Timeout (s)", &self.monitor.ping_timeout_secs)?;
        write_1(f, "Max Concurrent Probes", &self.monitor.max_concurrent_probes)?;
        write_1(f, "Overlap", &format!("{:?}", self.monitor.overlap))?;
        write_1(f, "Heartbeat (s)", &self.monitor.heartbeat_secs)?;

        write_title_1(f, "Limits")?;
        write_1(f, "Max Endpoints", &self.limits.max_endpoints)?;
        write_1(f, "Max Read-only Keys", &self.limits.max_read_only_keys)?;

        Ok(())
    }
}

impl Config {
    /// Generate Config structure from file
    ///
    /// Creates a default config in ~/.config/sitewatch/config.toml
    ///  or the specified path, with the name config.toml if one does not exist
    pub fn from_config(optional_path: Option<impl AsRef<path::Path>>) -> Result<Self, ConfigError> {
        let config_path: path::PathBuf = if let Some(path) = optional_path {
            normalize_toml_path(path.as_ref())
        } else {
            default_config_path()?
        };

        let config = if config_path.exists() {
            let raw_string = fs::read_to_string(&config_path)
                .map_err(|source| ConfigError::ReadFailed { path: config_path.clone(), source })?;
            toml::from_str(raw_string.as_str())?
        } else {
            let config = Self::default();
            config.write_config(&config_path)?;
            config
        };

        config.validate()?;
        Ok(config)
    }

    /// Serialize and write a config to a file
    pub fn write_config(&self, path: &path::Path) -> Result<(), ConfigError> {
        let config_str: String = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|source| ConfigError::WriteFailed { path: parent.to_path_buf(), source })?;
        }

        fs::write(path, config_str).map_err(|source| ConfigError::WriteFailed { path: path.to_path_buf(), source })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("monitor.interval_secs", self.monitor.interval_secs),
            ("monitor.ping_timeout_secs", self.monitor.ping_timeout_secs),
            ("monitor.heartbeat_secs", self.monitor.heartbeat_secs),
            ("monitor.max_concurrent_probes", self.monitor.max_concurrent_probes as u64),
            ("storage.deadline_secs", self.storage.deadline_secs),
            ("storage.pool_size", self.storage.pool_size as u64),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
        }
        if self.monitor.max_concurrent_probes > ConcurrencyGate::MAX_CAPACITY {
            return Err(ConfigError::Invalid(format!(
                "monitor.max_concurrent_probes must be at most {}",
                ConcurrencyGate::MAX_CAPACITY
            )));
        }
        Ok(())
    }
}
