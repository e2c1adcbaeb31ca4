//! Configuration for the MQTT session client
//!
//! Two sources are supported: the six environment variables used by the
//! command-line driver (`CLIENT_NAME`, `BROKER_HOST`, `PORT`, `USER_NAME`,
//! `PASSWORD`, `CERT_PATH`) and a TOML file. Credentials are never stored in
//! the file; it names the environment variables that hold them.

use crate::protocol::topics::validate_client_id;
use crate::transport::mqtt::ReconnectPolicy;
use crate::transport::TlsSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Default port for MQTT over TLS
pub const DEFAULT_TLS_PORT: u16 = 8883;

/// Main client configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    pub client: ClientSection,
    pub broker: BrokerSection,
    pub tls: TlsSection,
    #[serde(default)]
    pub session: SessionSection,
}

/// Client identity section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientSection {
    /// Prefix of the client id; the machine id is appended
    pub name: String,
    /// File caching the generated machine id
    #[serde(default = "default_machine_id_file")]
    pub machine_id_file: PathBuf,
}

fn default_machine_id_file() -> PathBuf {
    PathBuf::from("machine_id.txt")
}

/// Broker section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// Broker URL, `mqtts://host[:port]`
    pub url: String,
    /// Environment variable containing username
    #[serde(default = "default_username_env")]
    pub username_env: String,
    /// Environment variable containing password
    #[serde(default = "default_password_env")]
    pub password_env: String,
}

fn default_username_env() -> String {
    "USER_NAME".to_string()
}

fn default_password_env() -> String {
    "PASSWORD".to_string()
}

/// TLS section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TlsSection {
    /// PEM trust bundle for the broker certificate
    pub ca_cert: PathBuf,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

fn default_handshake_timeout_ms() -> u64 {
    5000
}

/// Session timing section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSection {
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    #[serde(default = "default_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub operation_timeout_ms: u64,
    #[serde(default = "default_reconnect_min_delay_secs")]
    pub reconnect_min_delay_secs: u64,
    #[serde(default = "default_reconnect_max_delay_secs")]
    pub reconnect_max_delay_secs: u64,
}

fn default_keepalive_secs() -> u64 {
    60
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_reconnect_min_delay_secs() -> u64 {
    1
}

fn default_reconnect_max_delay_secs() -> u64 {
    60
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            keepalive_secs: default_keepalive_secs(),
            connect_timeout_ms: default_timeout_ms(),
            operation_timeout_ms: default_timeout_ms(),
            reconnect_min_delay_secs: default_reconnect_min_delay_secs(),
            reconnect_max_delay_secs: default_reconnect_max_delay_secs(),
        }
    }
}

impl SessionSection {
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            Duration::from_secs(self.reconnect_min_delay_secs),
            Duration::from_secs(self.reconnect_max_delay_secs),
        )
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keepalive_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "session.keepalive_secs must be greater than 0".to_string(),
            ));
        }
        if self.connect_timeout_ms == 0 || self.operation_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "session timeouts must be greater than 0".to_string(),
            ));
        }
        self.reconnect_policy()
            .validate()
            .map_err(|e| ConfigError::InvalidConfig(format!("session reconnect policy: {e}")))
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid client name: {0}")]
    InvalidClientName(String),
    #[error("Invalid broker URL '{url}': {reason}")]
    InvalidBrokerUrl { url: String, reason: String },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ClientConfig {
    /// Load configuration from TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ClientConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Build configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from any key lookup (environment, `.env` map, tests)
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let require = |key: &str| {
            lookup(key)
                .filter(|value| !value.is_empty())
                .ok_or_else(|| ConfigError::EnvVarNotFound(key.to_string()))
        };

        let name = require("CLIENT_NAME")?;
        let host = require("BROKER_HOST")?;
        let port_raw = require("PORT")?;
        let port: u16 = port_raw.parse().map_err(|_| {
            ConfigError::InvalidConfig(format!("PORT must be a TCP port number, got '{port_raw}'"))
        })?;
        let ca_cert = require("CERT_PATH")?;

        // Credentials stay in the environment; only check they are present
        require("USER_NAME")?;
        require("PASSWORD")?;

        let config = ClientConfig {
            client: ClientSection {
                name,
                machine_id_file: default_machine_id_file(),
            },
            broker: BrokerSection {
                url: format!("mqtts://{host}:{port}"),
                username_env: default_username_env(),
                password_env: default_password_env(),
            },
            tls: TlsSection {
                ca_cert: PathBuf::from(ca_cert),
                handshake_timeout_ms: default_handshake_timeout_ms(),
            },
            session: SessionSection::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_client_name(&self.client.name)?;
        self.broker_endpoint()?;
        if self.tls.handshake_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "tls.handshake_timeout_ms must be greater than 0".to_string(),
            ));
        }
        self.session.validate()
    }

    /// Host and port parsed from `broker.url`
    pub fn broker_endpoint(&self) -> Result<(String, u16), ConfigError> {
        parse_broker_url(&self.broker.url)
    }

    /// Resolve username and password from the configured environment variables
    pub fn credentials(&self) -> Result<(String, String), ConfigError> {
        self.credentials_from(|key| std::env::var(key).ok())
    }

    pub fn credentials_from<F>(&self, lookup: F) -> Result<(String, String), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let username = lookup(&self.broker.username_env)
            .ok_or_else(|| ConfigError::EnvVarNotFound(self.broker.username_env.clone()))?;
        let password = lookup(&self.broker.password_env)
            .ok_or_else(|| ConfigError::EnvVarNotFound(self.broker.password_env.clone()))?;
        Ok((username, password))
    }

    /// Strict TLS settings for the transport
    pub fn tls_settings(&self) -> TlsSettings {
        let mut tls = TlsSettings::strict(&self.tls.ca_cert);
        tls.handshake_timeout = Duration::from_millis(self.tls.handshake_timeout_ms);
        tls
    }
}

/// Parse `mqtts://host[:port]`; plain `mqtt://` is refused
pub fn parse_broker_url(raw: &str) -> Result<(String, u16), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidBrokerUrl {
        url: raw.to_string(),
        reason: reason.to_string(),
    };

    let url = Url::parse(raw).map_err(|e| invalid(&e.to_string()))?;
    match url.scheme() {
        "mqtts" | "ssl" => {}
        "mqtt" | "tcp" => return Err(invalid("unencrypted transport is not supported")),
        _ => return Err(invalid("scheme must be mqtts")),
    }

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| invalid("missing host"))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();

    Ok((host, url.port().unwrap_or(DEFAULT_TLS_PORT)))
}

/// Validate client name prefix; the machine id is appended later
fn validate_client_name(name: &str) -> Result<(), ConfigError> {
    validate_client_id(name).map_err(|e| ConfigError::InvalidClientName(format!("'{name}': {e}")))
}
