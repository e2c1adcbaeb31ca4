//! Session controller for a TLS MQTT connection
//!
//! The session turns the transport's asynchronous acknowledgements into
//! awaitable calls with timeouts:
//!
//! - [`signals`] - level signals and shared state written by callbacks
//! - [`callbacks`] - the [`TransportCallbacks`](crate::transport::TransportCallbacks) sink
//! - [`controller`] - [`Session`] with connect, publish, subscribe and disconnect
//!
//! # Usage
//!
//! ```rust,no_run
//! use mqtt_session::session::{ClientIdentity, Session, DEFAULT_KEEPALIVE, DEFAULT_TIMEOUT};
//! use mqtt_session::transport::MqttTransport;
//!
//! # tokio_test::block_on(async {
//! let identity = ClientIdentity::new(
//!     "sensor-01",
//!     "broker.example.com",
//!     8883,
//!     "device",
//!     "secret",
//!     "/etc/ssl/broker-ca.pem",
//! );
//! let transport = MqttTransport::new(&identity.client_id);
//! let session = Session::new(identity, transport)?;
//!
//! session.connect(DEFAULT_KEEPALIVE, DEFAULT_TIMEOUT).await?;
//! session.subscribe("teste/status", 1, DEFAULT_TIMEOUT).await?;
//! let outcome = session
//!     .publish("teste/status", "Hello World!", 1, true, DEFAULT_TIMEOUT)
//!     .await?;
//! println!("{outcome:?}");
//! session.disconnect().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod callbacks;
pub mod controller;
pub mod signals;

use crate::config::{ClientConfig, ConfigError};
use crate::transport::{TlsSettings, DEFAULT_TLS_HANDSHAKE_TIMEOUT};
use rumqttc::QoS;
use std::path::PathBuf;
use std::time::Duration;

pub use callbacks::SessionCallbacks;
pub use controller::Session;
pub use signals::{EventSynchronizer, PendingAck, PendingOperations, RequestTracker, Signal};

/// Default keepalive interval
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(60);

/// Default timeout for connect, publish and subscribe waits
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Who the session connects as and where to
#[derive(Clone, PartialEq)]
pub struct ClientIdentity {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    password: String,
    /// PEM trust bundle for the broker certificate
    pub ca_cert: PathBuf,
    pub handshake_timeout: Duration,
}

impl ClientIdentity {
    pub fn new(
        client_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
        ca_cert: impl Into<PathBuf>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
            ca_cert: ca_cert.into(),
            handshake_timeout: DEFAULT_TLS_HANDSHAKE_TIMEOUT,
        }
    }

    /// Build from configuration; credentials come from the environment
    pub fn from_config(config: &ClientConfig, machine_id: &str) -> Result<Self, ConfigError> {
        let (host, port) = config.broker_endpoint()?;
        let (username, password) = config.credentials()?;
        let tls = config.tls_settings();

        Ok(Self {
            client_id: crate::identity::client_id(&config.client.name, machine_id),
            host,
            port,
            username,
            password,
            ca_cert: tls.ca_cert,
            handshake_timeout: tls.handshake_timeout,
        })
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// Strict TLS settings: certificate and hostname verification always on
    pub fn tls_settings(&self) -> TlsSettings {
        let mut tls = TlsSettings::strict(&self.ca_cert);
        tls.handshake_timeout = self.handshake_timeout;
        tls
    }
}

impl std::fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("client_id", &self.client_id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("ca_cert", &self.ca_cert)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish()
    }
}

/// Result of a publish that passed validation
#[derive(Debug, Clone, PartialEq)]
pub enum PublishOutcome {
    /// Completion callback observed (written for QoS 0, PUBACK/PUBCOMP otherwise)
    Acknowledged { mid: u16 },
    /// Session was not connected; nothing was sent
    NotConnected,
    /// No completion within the timeout; the message may still be delivered
    Timeout,
    /// Transport refused the request locally
    SendFailed(String),
}

impl PublishOutcome {
    pub fn is_acknowledged(&self) -> bool {
        matches!(self, PublishOutcome::Acknowledged { .. })
    }

    pub fn mid(&self) -> Option<u16> {
        match self {
            PublishOutcome::Acknowledged { mid } => Some(*mid),
            _ => None,
        }
    }
}

/// SUBACK contents for a successful subscribe
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeAck {
    pub mid: u16,
    /// Granted QoS per filter; `None` marks a refused filter
    pub granted: Vec<Option<QoS>>,
}

impl SubscribeAck {
    /// QoS granted for the (single) requested filter
    pub fn granted_qos(&self) -> Option<QoS> {
        self.granted.first().copied().flatten()
    }
}
