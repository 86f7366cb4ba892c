//! Agent configuration
//!
//! Loaded in three layers, later layers winning:
//! 1. defaults
//! 2. TOML config file (`AGENT_CONFIG_FILE`, else `/etc/proxysql-agent/config.toml`,
//!    else `./config.toml`; a missing file is not an error)
//! 3. `AGENT_*` environment variables, nested keys joined with `_`
//!    (e.g. `AGENT_PROXYSQL_ADDRESS` for `proxysql.address`)

use crate::membership::MemberSelector;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_CONFIG_PATHS: [&str; 2] = ["/etc/proxysql-agent/config.toml", "config.toml"];

/// Error type for configuration loading
#[derive(Debug)]
pub enum ConfigError {
    /// Config file could not be read
    Io { path: PathBuf, source: std::io::Error },
    /// Config file is not valid TOML for this schema
    Parse { path: PathBuf, message: String },
    /// An environment override could not be parsed
    Env { key: String, value: String },
    /// Admin address has no `:port`
    MissingPort(String),
    /// A value is out of range
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "error reading config file {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, message } => {
                write!(f, "error parsing config file {}: {}", path.display(), message)
            }
            ConfigError::Env { key, value } => write!(f, "invalid value for {}: {:?}", key, value),
            ConfigError::MissingPort(address) => write!(f, "missing port in address: {}", address),
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Primary member: registers itself and reconciles the core topology
    Core,
    /// Secondary member: accepts topology pushed by the cores
    Satellite,
}

impl FromStr for RunMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "core" => Ok(RunMode::Core),
            "satellite" => Ok(RunMode::Satellite),
            _ => Err(ConfigError::Invalid(
                "run_mode must be either 'core' or 'satellite'".to_string(),
            )),
        }
    }
}

/// How a core learns about membership changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoreMode {
    /// Event-driven pod feed
    #[default]
    Watch,
    /// Periodic full listing diffed against a checksum watermark
    Poll,
}

impl FromStr for CoreMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "watch" => Ok(CoreMode::Watch),
            "poll" => Ok(CoreMode::Poll),
            _ => Err(ConfigError::Invalid(
                "core.mode must be either 'watch' or 'poll'".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "plain" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(ConfigError::Invalid(format!("unknown log format {:?}", s))),
        }
    }
}

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub run_mode: Option<RunMode>,
    /// Seconds to wait before connecting; gives the proxy container time to boot
    pub start_delay: u64,
    /// This member's display name; defaults to the host name
    pub identity: Option<String>,
    pub proxysql: AdminConfig,
    pub log: LogConfig,
    pub core: CoreConfig,
    pub satellite: SatelliteConfig,
    pub api: ApiConfig,
    pub shutdown: ShutdownConfig,
}

/// ProxySQL admin interface credentials
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub address: String,
    pub username: String,
    pub password: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        AdminConfig {
            address: "127.0.0.1:6032".to_string(),
            username: "radmin".to_string(),
            password: String::new(),
        }
    }
}

impl std::fmt::Debug for AdminConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminConfig")
            .field("address", &self.address)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

impl AdminConfig {
    pub fn host_and_port(&self) -> Result<(String, u16), ConfigError> {
        let (host, port) = self
            .address
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::MissingPort(self.address.clone()))?;
        let port = port
            .parse()
            .map_err(|_| ConfigError::MissingPort(self.address.clone()))?;
        Ok((host.to_string(), port))
    }

    /// Admin port; also the port cluster peers use to reach each other
    pub fn cluster_port(&self) -> Result<u16, ConfigError> {
        self.host_and_port().map(|(_, port)| port)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// DEBUG, INFO, WARN or ERROR
    pub level: String,
    pub format: LogFormat,
    /// Include file and line in log lines
    pub source: bool,
    /// Log every probe result at debug level
    pub probes: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "INFO".to_string(),
            format: LogFormat::Text,
            source: false,
            probes: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    pub mode: CoreMode,
    pub podselector: MemberSelector,
    /// Upper bound on the initial feed synchronization
    #[serde(with = "duration_secs")]
    pub sync_timeout: Duration,
    pub watermark_file: PathBuf,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            interval: Duration::from_secs(10),
            mode: CoreMode::Watch,
            podselector: MemberSelector::default(),
            sync_timeout: Duration::from_secs(30),
            watermark_file: PathBuf::from("/tmp/pods-cs.txt"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SatelliteConfig {
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    /// A core whose last health check is older than this counts as missing
    #[serde(with = "duration_millis")]
    pub heartbeat_threshold: Duration,
}

impl Default for SatelliteConfig {
    fn default() -> Self {
        SatelliteConfig {
            interval: Duration::from_secs(10),
            heartbeat_threshold: Duration::from_millis(30_000),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig { port: 8080 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Sentinel file whose presence means "draining"
    pub draining_file: PathBuf,
    #[serde(with = "duration_secs")]
    pub drain_timeout: Duration,
    /// Overall deadline for the whole shutdown sequence
    #[serde(with = "duration_secs")]
    pub shutdown_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub drain_poll_interval: Duration,
    /// Budget for stopping the HTTP transport, separate from `shutdown_timeout`
    #[serde(with = "duration_secs")]
    pub transport_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        ShutdownConfig {
            draining_file: PathBuf::from("/var/lib/proxysql/draining"),
            drain_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(60),
            drain_poll_interval: Duration::from_millis(2_000),
            transport_timeout: Duration::from_secs(10),
        }
    }
}

impl AgentConfig {
    /// Load configuration from file and environment, then validate
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match Self::config_path() {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn config_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("AGENT_CONFIG_FILE") {
            return Some(PathBuf::from(path));
        }
        DEFAULT_CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Apply `AGENT_*` overrides using `lookup` to read variables
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("AGENT_RUN_MODE") {
            self.run_mode = Some(v.parse()?);
        }
        if let Some(v) = lookup("AGENT_START_DELAY") {
            self.start_delay = parse_env("AGENT_START_DELAY", &v)?;
        }
        if let Some(v) = lookup("AGENT_IDENTITY") {
            self.identity = Some(v);
        }

        if let Some(v) = lookup("AGENT_PROXYSQL_ADDRESS") {
            self.proxysql.address = v;
        }
        if let Some(v) = lookup("AGENT_PROXYSQL_USERNAME") {
            self.proxysql.username = v;
        }
        if let Some(v) = lookup("AGENT_PROXYSQL_PASSWORD") {
            self.proxysql.password = v;
        }

        if let Some(v) = lookup("AGENT_LOG_LEVEL") {
            self.log.level = v.to_ascii_uppercase();
        }
        if let Some(v) = lookup("AGENT_LOG_FORMAT") {
            self.log.format = v.parse()?;
        }
        if let Some(v) = lookup("AGENT_LOG_SOURCE") {
            self.log.source = parse_env("AGENT_LOG_SOURCE", &v)?;
        }
        if let Some(v) = lookup("AGENT_LOG_PROBES") {
            self.log.probes = parse_env("AGENT_LOG_PROBES", &v)?;
        }

        if let Some(v) = lookup("AGENT_CORE_INTERVAL") {
            self.core.interval = Duration::from_secs(parse_env("AGENT_CORE_INTERVAL", &v)?);
        }
        if let Some(v) = lookup("AGENT_CORE_MODE") {
            self.core.mode = v.parse()?;
        }
        if let Some(v) = lookup("AGENT_CORE_PODSELECTOR_NAMESPACE") {
            self.core.podselector.namespace = v;
        }
        if let Some(v) = lookup("AGENT_CORE_PODSELECTOR_APP") {
            self.core.podselector.app = v;
        }
        if let Some(v) = lookup("AGENT_CORE_PODSELECTOR_COMPONENT") {
            self.core.podselector.component = v;
        }
        if let Some(v) = lookup("AGENT_CORE_SYNC_TIMEOUT") {
            self.core.sync_timeout =
                Duration::from_secs(parse_env("AGENT_CORE_SYNC_TIMEOUT", &v)?);
        }
        if let Some(v) = lookup("AGENT_CORE_WATERMARK_FILE") {
            self.core.watermark_file = PathBuf::from(v);
        }

        if let Some(v) = lookup("AGENT_SATELLITE_INTERVAL") {
            self.satellite.interval =
                Duration::from_secs(parse_env("AGENT_SATELLITE_INTERVAL", &v)?);
        }
        if let Some(v) = lookup("AGENT_SATELLITE_HEARTBEAT_THRESHOLD") {
            self.satellite.heartbeat_threshold =
                Duration::from_millis(parse_env("AGENT_SATELLITE_HEARTBEAT_THRESHOLD", &v)?);
        }

        if let Some(v) = lookup("AGENT_API_PORT") {
            self.api.port = parse_env("AGENT_API_PORT", &v)?;
        }

        if let Some(v) = lookup("AGENT_SHUTDOWN_DRAINING_FILE") {
            self.shutdown.draining_file = PathBuf::from(v);
        }
        if let Some(v) = lookup("AGENT_SHUTDOWN_DRAIN_TIMEOUT") {
            self.shutdown.drain_timeout =
                Duration::from_secs(parse_env("AGENT_SHUTDOWN_DRAIN_TIMEOUT", &v)?);
        }
        if let Some(v) = lookup("AGENT_SHUTDOWN_SHUTDOWN_TIMEOUT") {
            self.shutdown.shutdown_timeout =
                Duration::from_secs(parse_env("AGENT_SHUTDOWN_SHUTDOWN_TIMEOUT", &v)?);
        }
        if let Some(v) = lookup("AGENT_SHUTDOWN_DRAIN_POLL_INTERVAL") {
            self.shutdown.drain_poll_interval =
                Duration::from_millis(parse_env("AGENT_SHUTDOWN_DRAIN_POLL_INTERVAL", &v)?);
        }
        if let Some(v) = lookup("AGENT_SHUTDOWN_TRANSPORT_TIMEOUT") {
            self.shutdown.transport_timeout =
                Duration::from_secs(parse_env("AGENT_SHUTDOWN_TRANSPORT_TIMEOUT", &v)?);
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.proxysql.cluster_port()?;

        if self.core.interval.is_zero() {
            return Err(ConfigError::Invalid("core.interval must be > 0".to_string()));
        }
        if self.satellite.interval.is_zero() {
            return Err(ConfigError::Invalid("satellite.interval must be > 0".to_string()));
        }
        if self.shutdown.drain_poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "shutdown.drain_poll_interval must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// This member's display name: configured identity, else the host name
    pub fn identity(&self) -> Option<String> {
        self.identity
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .or_else(|| {
                std::fs::read_to_string("/etc/hostname")
                    .ok()
                    .map(|s| s.trim().to_string())
            })
            .filter(|s| !s.is_empty())
    }
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env {
        key: key.to_string(),
        value: value.to_string(),
    })
}

mod duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
