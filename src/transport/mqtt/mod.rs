//! rumqttc-backed transport adapter (MQTT 3.1.1 over TLS)
//!
//! This module provides a decomposed MQTT transport that separates pure
//! functions from I/O operations.
//!
//! # Architecture
//!
//! - [`connection`] - Connection state, backoff policy and option construction
//! - [`message_handler`] - Pure routing of rumqttc events
//! - [`health_monitor`] - State transitions, reconnection decisions and health metrics
//! - [`client`] - The adapter itself: background loop, callbacks and teardown
//!
//! # Usage
//!
//! ```rust,no_run
//! use mqtt_session::transport::mqtt::MqttClient;
//! use mqtt_session::transport::{TlsSettings, TransportAdapter};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let mut client = MqttClient::new("sensor-01");
//! client.configure_auth("user", "secret");
//! client.configure_tls(TlsSettings::strict("/etc/ssl/broker-ca.pem"))?;
//! client.connect_async("broker.local", 8883, Duration::from_secs(60)).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

// Re-export public types for convenience
pub use client::MqttClient;
pub use connection::{Backoff, ConnectionState, ReconnectPolicy};
pub use health_monitor::{
    ConnectionEvent, ConnectionQuality, HealthMetrics, HealthMonitor, ReconnectionDecision,
};
pub use message_handler::{EventRoute, MessageForwarder, MessageHandler};
