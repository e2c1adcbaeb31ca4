//! Transport layer for the MQTT session
//!
//! This module provides the transport abstraction consumed by the session
//! controller and the rumqttc-backed implementation in [`mqtt`].
//!
//! The contract is callback shaped: requests are handed to the
//! transport and return as soon as they are queued locally, while completion
//! (CONNACK, PUBACK/PUBCOMP, SUBACK) and inbound deliveries are reported later
//! through [`TransportCallbacks`], invoked from the transport's background loop.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use rumqttc::QoS;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod mqtt;

/// Default TLS handshake timeout, distinct from the session connect timeout
pub const DEFAULT_TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors reported synchronously by a transport adapter
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to read CA certificate {path}: {source}")]
    CertificateRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid CA certificate {path}: {reason}")]
    InvalidCertificate { path: PathBuf, reason: String },
    #[error("Insecure TLS configuration rejected: {0}")]
    InsecureTls(String),
    #[error("Transport not configured: {0}")]
    NotConfigured(String),
    #[error("Transport not connected")]
    NotConnected,
    #[error("Background loop already running")]
    LoopAlreadyRunning,
    #[error("Request rejected by transport: {0}")]
    RequestFailed(String),
}

/// TLS parameters handed to the transport
///
/// Certificate validation and hostname verification are part of the type so
/// that a caller asking for an insecure connection gets an explicit error
/// instead of a silently degraded session.
#[derive(Debug, Clone, PartialEq)]
pub struct TlsSettings {
    /// PEM trust bundle used to validate the broker certificate
    pub ca_cert: PathBuf,
    pub require_valid_cert: bool,
    pub verify_hostname: bool,
    pub handshake_timeout: Duration,
}

impl TlsSettings {
    /// Strict settings: validation and hostname checks on, 5s handshake timeout
    pub fn strict(ca_cert: impl Into<PathBuf>) -> Self {
        Self {
            ca_cert: ca_cert.into(),
            require_valid_cert: true,
            verify_hostname: true,
            handshake_timeout: DEFAULT_TLS_HANDSHAKE_TIMEOUT,
        }
    }

    /// Reject anything weaker than full certificate and hostname verification
    pub fn ensure_secure(&self) -> Result<(), TransportError> {
        if !self.require_valid_cert {
            return Err(TransportError::InsecureTls(
                "certificate validation cannot be disabled".to_string(),
            ));
        }
        if !self.verify_hostname {
            return Err(TransportError::InsecureTls(
                "hostname verification cannot be disabled".to_string(),
            ));
        }
        Ok(())
    }
}

/// Result of a connection handshake as reported by `on_connect`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectResult {
    /// CONNACK with return code 0
    Accepted { session_present: bool },
    /// Broker answered with a non-zero return code
    Refused { code: u8, reason: String },
}

impl ConnectResult {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ConnectResult::Accepted { .. })
    }
}

/// Why the link went down, as reported by `on_disconnect`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Broker sent DISCONNECT
    ByBroker,
    /// Network or protocol failure; the transport will try to reconnect
    Unexpected(String),
}

/// A message delivered on a subscribed topic
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
            received_at: Utc::now(),
        }
    }

    /// Payload decoded as UTF-8, lossy
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Notifications emitted by the transport's background loop
///
/// Implementations must not block: they run on the task that reads the
/// network, so anything slow here stalls every other acknowledgement.
pub trait TransportCallbacks: Send + Sync {
    fn on_connect(&self, result: ConnectResult);
    fn on_disconnect(&self, reason: DisconnectReason);
    /// A caller's publish was written with packet id `mid` (0 for QoS 0)
    ///
    /// Requests are written in the order they were handed to the adapter.
    fn on_publish_sent(&self, mid: u16);
    fn on_publish(&self, mid: u16);
    /// A caller's subscribe was written with packet id `mid`
    fn on_subscribe_sent(&self, mid: u16);
    /// `granted` holds one entry per filter; `None` marks a refused filter
    fn on_subscribe(&self, mid: u16, granted: Vec<Option<QoS>>);
    fn on_message(&self, message: InboundMessage);
}

/// Transport adapter consumed by the session controller
///
/// `publish` and `subscribe` only report local failures (for instance the
/// request queue is gone); the packet id and the delivery confirmation always
/// arrive through the registered callbacks.
///
/// Only `Send` is required: the session keeps the adapter behind an async
/// mutex and calls every method with exclusive access.
#[async_trait::async_trait]
pub trait TransportAdapter: Send {
    /// Register the callback sink; must be called before `start_background_loop`
    fn set_callbacks(&mut self, callbacks: Arc<dyn TransportCallbacks>);

    fn configure_auth(&mut self, username: &str, password: &str);

    /// Validate and install TLS parameters. Fails fast on a missing or
    /// unreadable CA bundle and on any insecure setting.
    fn configure_tls(&mut self, tls: TlsSettings) -> Result<(), TransportError>;

    /// Prepare a connection; the handshake itself runs on the background loop
    /// and completes through `on_connect`
    async fn connect_async(
        &mut self,
        host: &str,
        port: u16,
        keepalive: Duration,
    ) -> Result<(), TransportError>;

    fn start_background_loop(&mut self) -> Result<(), TransportError>;

    /// Stop the background loop; returns once no further callback can fire
    async fn stop_background_loop(&mut self);

    /// Send DISCONNECT and release the connection. No-op when never connected.
    async fn disconnect(&mut self) -> Result<(), TransportError>;

    async fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError>;

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError>;
}

/// Type alias for the rumqttc-backed transport
pub type MqttTransport = mqtt::MqttClient;
