//! Session configuration.
//!
//! Connection parameters (address, message VPN, credentials) come from the
//! command line. Tuning knobs come from `Settings`, which can be overridden
//! from a YAML file or environment variables.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

/// Default configuration file name (without extension).
pub const DEFAULT_CONFIG_FILE: &str = "flowrelay";
/// Environment variable for an explicit configuration file path.
pub const CONFIG_ENV_VAR: &str = "FLOWRELAY_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "FLOWRELAY";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "FLOWRELAY_LOG";

/// Default AMQP port when the address omits one.
pub const DEFAULT_PORT: u16 = 5672;

/// Errors raised while building configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid broker address '{0}'")]
    InvalidAddress(String),

    #[error("No broker address given")]
    NoHosts,

    #[error(transparent)]
    Load(#[from] ::config::ConfigError),
}

/// Tuning knobs shared by both programs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Reconnect attempts after an established connection drops.
    pub reconnect_retries: usize,
    /// Connect attempts per host before moving on to the next host.
    pub connect_retries_per_host: usize,
    /// Delay between reconnect attempts.
    pub reconnect_interval_ms: u64,
    /// Unacknowledged messages the broker may have in flight per flow.
    pub ack_window: u16,
    /// Period of the throughput report.
    pub report_interval_ms: u64,
    /// Exchange that carries direct topic traffic.
    pub topic_exchange: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            reconnect_retries: 20,
            connect_retries_per_host: 5,
            reconnect_interval_ms: 3000,
            ack_window: 255,
            report_interval_ms: 1000,
            topic_exchange: "amq.topic".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from file and environment.
    ///
    /// Sources (later overrides earlier):
    /// 1. `flowrelay.yaml` in the current directory (if it exists)
    /// 2. File given by `path` (if provided)
    /// 3. File named by `CONFIG_ENV_VAR` (if set)
    /// 4. Environment variables `FLOWRELAY__<KEY>`
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }
}

/// One `host:port` entry of the broker address list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

impl FromStr for BrokerAddress {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let without_scheme = trimmed
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(trimmed);

        let invalid = || ConfigError::InvalidAddress(s.to_string());

        // Bracketed IPv6: [::1]:5672
        if let Some(rest) = without_scheme.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
            let port = match tail.strip_prefix(':') {
                Some(p) => p.parse().map_err(|_| invalid())?,
                None if tail.is_empty() => DEFAULT_PORT,
                None => return Err(invalid()),
            };
            if host.is_empty() {
                return Err(invalid());
            }
            return Ok(Self {
                host: host.to_string(),
                port,
            });
        }

        let (host, port) = match without_scheme.rsplit_once(':') {
            Some((host, port)) => (host, port.parse().map_err(|_| invalid())?),
            None => (without_scheme, DEFAULT_PORT),
        };

        if host.is_empty() || host.contains(':') {
            return Err(invalid());
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Everything needed to open a session.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Hosts tried in order on initial connect and on reconnect.
    pub hosts: Vec<BrokerAddress>,
    /// Message VPN (AMQP virtual host).
    pub vpn: String,
    pub username: String,
    pub password: Option<String>,
    /// Re-bind started flows after a reconnect.
    pub reapply_subscriptions: bool,
    pub reconnect_retries: usize,
    pub connect_retries_per_host: usize,
    pub reconnect_interval: Duration,
    pub ack_window: u16,
    pub topic_exchange: String,
}

impl SessionConfig {
    /// Build a session config from the command-line connection parameters.
    ///
    /// `hosts` is a comma-separated list of `host[:port]` entries.
    pub fn new(
        hosts: &str,
        vpn: impl Into<String>,
        username: impl Into<String>,
        password: Option<String>,
        settings: &Settings,
    ) -> Result<Self, ConfigError> {
        let hosts = hosts
            .split(',')
            .filter(|h| !h.trim().is_empty())
            .map(BrokerAddress::from_str)
            .collect::<Result<Vec<_>, _>>()?;

        if hosts.is_empty() {
            return Err(ConfigError::NoHosts);
        }

        Ok(Self {
            hosts,
            vpn: vpn.into(),
            username: username.into(),
            password,
            reapply_subscriptions: true,
            reconnect_retries: settings.reconnect_retries,
            connect_retries_per_host: settings.connect_retries_per_host,
            reconnect_interval: Duration::from_millis(settings.reconnect_interval_ms),
            ack_window: settings.ack_window,
            topic_exchange: settings.topic_exchange.clone(),
        })
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("hosts", &self.hosts)
            .field("vpn", &self.vpn)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("reapply_subscriptions", &self.reapply_subscriptions)
            .field("reconnect_retries", &self.reconnect_retries)
            .field("connect_retries_per_host", &self.connect_retries_per_host)
            .field("reconnect_interval", &self.reconnect_interval)
            .field("ack_window", &self.ack_window)
            .field("topic_exchange", &self.topic_exchange)
            .finish()
    }
}
