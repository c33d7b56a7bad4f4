use std::{env, fmt, fs, io, path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::monitoring::{ProbeSettings, SchedulerSettings};
use crate::orchestrator::RetentionPolicy;

const SECS_PER_HOUR: u64 = 3600;
const SECS_PER_DAY: u64 = 24 * SECS_PER_HOUR;
/// Upper bound for day-valued retention settings
const MAX_RETENTION_DAYS: u64 = 36_500;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read {path}: {source}")]
    ReadFailed { path: path::PathBuf, source: io::Error },
    #[error("failed to write {path}: {source}")]
    WriteFailed { path: path::PathBuf, source: io::Error },
    #[error("failed to parse config: {0}")]
    ParseFailed(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    SerializeFailed(#[from] toml::ser::Error),
    #[error("invalid value {value:?} for {name}")]
    InvalidOverride { name: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("no config directory available (set XDG_CONFIG_HOME or HOME)")]
    ConfigPathUnavailable,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub monitoring: MonitoringConfig,
    pub retention: RetentionConfig,
    pub isp: IspConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: path::PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub ping_timeout_ms: u64,
    pub ping_count: u16,
    /// Use raw ICMP sockets instead of unprivileged datagram sockets
    pub privileged: bool,
    pub cycle_interval_seconds: u64,
    pub max_workers: usize,
    pub trace_max_hops: u8,
    pub trace_hop_timeout_ms: u64,
    /// Fraction of down endpoints above which an ISP is in outage
    pub outage_threshold: f64,
    pub history_retention_days: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub expire_days: u64,
    pub cleanup_interval_hours: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IspConfig {
    /// JSON document mapping ASN → display name and allowed flag
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rules_path: Option<path::PathBuf>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: path::PathBuf::from("ccc.db") }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            ping_timeout_ms: 5000,
            ping_count: 3,
            privileged: false,
            cycle_interval_seconds: 60,
            max_workers: 50,
            trace_max_hops: 30,
            trace_hop_timeout_ms: 2000,
            outage_threshold: 0.5,
            history_retention_days: 7,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { expire_days: 3, cleanup_interval_hours: 24 }
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

/// Get default config path ($XDG_CONFIG_HOME/ccc/config.toml or
/// $HOME/.config/...)
fn default_config_path() -> Result<path::PathBuf, Error> {
    let path = if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
        path::PathBuf::from(config_home)
    } else if let Some(home_dir) = env::home_dir() {
        home_dir.join(".config")
    } else {
        return Err(Error::ConfigPathUnavailable);
    };

    Ok(path.join("ccc/config.toml"))
}

fn parse_override<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, Error> {
    value.trim().parse().map_err(|_| Error::InvalidOverride { name, value: value.to_string() })
}

fn parse_flag(name: &'static str, value: &str) -> Result<bool, Error> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(Error::InvalidOverride { name, value: value.to_string() }),
    }
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
        write_title_1(f, "Database")?;
        write_1(f, "Path", &self.database.path.display())?;

        let m = &self.monitoring;
        write_title_1(f, "Monitoring")?;
        write_1(f, "Cycle Interval (s)", &m.cycle_interval_seconds)?;
        write_1(f, "Ping Timeout (ms)", &m.ping_timeout_ms)?;
        write_1(f, "Ping Count", &m.ping_count)?;
        write_1(f, "Privileged", &m.privileged)?;
        write_1(f, "Max Workers", &m.max_workers)?;
        write_1(f, "Traceroute Max Hops", &m.trace_max_hops)?;
        write_1(f, "Traceroute Hop Timeout (ms)", &m.trace_hop_timeout_ms)?;
        write_1(f, "Outage Threshold", &m.outage_threshold)?;
        write_1(f, "History Retention (days)", &m.history_retention_days)?;

        write_title_1(f, "Retention")?;
        write_1(f, "Expire After (days)", &self.retention.expire_days)?;
        write_1(f, "Cleanup Interval (h)", &self.retention.cleanup_interval_hours)?;

        write_title_1(f, "ISP")?;
        match &self.isp.rules_path {
            Some(path) => write_1(f, "Rules", &path.display())?,
            None => write_1(f, "Rules", &"(none)")?,
        }

        Ok(())
    }
}

impl Config {
    /// Generate Config structure from file
    ///
    /// Creates a default config in ~/.config/ccc/config.toml
    ///  or the specified path, with the name config.toml if one does not exist
    ///
    /// ```rust,no_run
    /// # use std::path;
    /// let cfg = ccc_service::config::Config::from_config(None::<&path::Path>)?;
    /// println!("{}", cfg);
    /// # Ok::<(), ccc_service::config::Error>(())
    /// ```
    pub fn from_config(optional_path: Option<impl AsRef<path::Path>>) -> Result<Self, Error> {
        let config_path: path::PathBuf = if let Some(path) = optional_path {
            normalize_toml_path(path.as_ref())
        } else {
            default_config_path()?
        };

        if config_path.exists() {
            let raw_string = fs::read_to_string(&config_path)
                .map_err(|source| Error::ReadFailed { path: config_path.clone(), source })?;
            Ok(toml::from_str(raw_string.as_str())?)
        } else {
            let config = Self::default();
            config.write_config(&config_path)?;
            Ok(config)
        }
    }

    /// Serialize and write a config to a file
    pub fn write_config(&self, path: &path::Path) -> Result<(), Error> {
        let config_str: String = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|source| Error::WriteFailed { path: parent.to_path_buf(), source })?;
        }

        fs::write(path, config_str)
            .map_err(|source| Error::WriteFailed { path: path.to_path_buf(), source })
    }

    /// Apply `CCC_*` environment variables on top of the file values
    pub fn apply_env_overrides(&mut self) -> Result<(), Error> {
        self.apply_overrides(|name| env::var(name).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), Error> {
        if let Some(value) = lookup("CCC_DB_PATH") {
            self.database.path = path::PathBuf::from(value);
        }
        if let Some(value) = lookup("CCC_PING_INTERVAL") {
            self.monitoring.cycle_interval_seconds = parse_override("CCC_PING_INTERVAL", &value)?;
        }
        if let Some(value) = lookup("CCC_EXPIRE_DAYS") {
            self.retention.expire_days = parse_override("CCC_EXPIRE_DAYS", &value)?;
        }
        if let Some(value) = lookup("CCC_PRIVILEGED") {
            self.monitoring.privileged = parse_flag("CCC_PRIVILEGED", &value)?;
        }
        if let Some(value) = lookup("CCC_ISP_CONFIG") {
            self.isp.rules_path = Some(path::PathBuf::from(value));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), Error> {
        let m = &self.monitoring;
        if !(0.0..=1.0).contains(&m.outage_threshold) {
            return Err(Error::Invalid(format!(
                "outage_threshold must be between 0 and 1, got {}",
                m.outage_threshold
            )));
        }
        if m.cycle_interval_seconds == 0 {
            return Err(Error::Invalid("cycle_interval_seconds must be positive".into()));
        }
        if m.ping_count == 0 || m.ping_timeout_ms == 0 {
            return Err(Error::Invalid("ping_count and ping_timeout_ms must be positive".into()));
        }
        if m.max_workers == 0 {
            return Err(Error::Invalid("max_workers must be at least 1".into()));
        }
        if m.trace_max_hops == 0 {
            return Err(Error::Invalid("trace_max_hops must be at least 1".into()));
        }
        if self.retention.cleanup_interval_hours == 0 {
            return Err(Error::Invalid("cleanup_interval_hours must be positive".into()));
        }
        if self.retention.cleanup_interval_hours > MAX_RETENTION_DAYS * 24 {
            return Err(Error::Invalid(format!(
                "cleanup_interval_hours must be at most {}",
                MAX_RETENTION_DAYS * 24
            )));
        }
        if self.retention.expire_days > MAX_RETENTION_DAYS
            || m.history_retention_days > MAX_RETENTION_DAYS
        {
            return Err(Error::Invalid(format!(
                "expire_days and history_retention_days must be at most {}",
                MAX_RETENTION_DAYS
            )));
        }
        Ok(())
    }

    pub fn probe_settings(&self) -> ProbeSettings {
        let m = &self.monitoring;
        ProbeSettings {
            ping_timeout: Duration::from_millis(m.ping_timeout_ms),
            ping_count: m.ping_count,
            privileged: m.privileged,
            trace_max_hops: m.trace_max_hops,
            trace_hop_timeout: Duration::from_millis(m.trace_hop_timeout_ms),
        }
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        let m = &self.monitoring;
        SchedulerSettings {
            cycle_interval: Duration::from_secs(m.cycle_interval_seconds),
            max_workers: m.max_workers,
            outage_threshold: m.outage_threshold,
            history_retention: Duration::from_secs(
                m.history_retention_days.saturating_mul(SECS_PER_DAY),
            ),
        }
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            expire_days: self.retention.expire_days,
            cleanup_interval: Duration::from_secs(
                self.retention.cleanup_interval_hours.saturating_mul(SECS_PER_HOUR),
            ),
        }
    }
}
