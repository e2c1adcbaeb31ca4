//! MQTT Session - TLS MQTT client with awaitable acknowledgements
//!
//! The MQTT transport reports connection, publish and subscribe completions
//! through callbacks on a background task. This crate wraps it in a
//! [`Session`] whose operations wait for those acknowledgements with explicit
//! timeouts, and keeps the connection alive with exponential-backoff
//! reconnection.
//!
//! # Overview
//!
//! - [`session`] - connect, publish, subscribe and disconnect with timeouts
//! - [`transport`] - the transport adapter trait and the rumqttc-backed client
//! - [`protocol`] - topic, QoS and client id validation
//! - [`config`] - environment and TOML configuration
//! - [`identity`] - persistent machine id used to build the client id
//! - [`observability`] - structured logging
//! - [`testing`] - in-memory transport for tests
//!
//! # Quick Start
//!
//! ```rust
//! use mqtt_session::session::{ClientIdentity, Session};
//! use mqtt_session::testing::MockTransport;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let identity = ClientIdentity::new("doc-client", "broker.local", 8883, "u", "p", "/ca.pem");
//! let session = Session::new(identity, MockTransport::new()).unwrap();
//!
//! session.connect(Duration::from_secs(60), Duration::from_secs(1)).await.unwrap();
//! session.subscribe("teste/status", 1, Duration::from_secs(1)).await.unwrap();
//! let outcome = session
//!     .publish("teste/status", "Hello World!", 1, false, Duration::from_secs(1))
//!     .await
//!     .unwrap();
//! assert!(outcome.is_acknowledged());
//!
//! let message = session.wait_for_message(Duration::from_secs(1)).await.unwrap();
//! assert_eq!(message.payload_str(), "Hello World!");
//! session.disconnect().await.unwrap();
//! # });
//! ```

pub mod config;
pub mod error;
pub mod identity;
pub mod observability;
pub mod protocol;
pub mod session;
pub mod testing;
pub mod transport;

pub use config::{ClientConfig, ConfigError};
pub use error::{SessionError, SessionResult};
pub use session::{ClientIdentity, PublishOutcome, Session, SubscribeAck};
pub use transport::mqtt::{ConnectionState, MqttClient, ReconnectPolicy};
pub use transport::{InboundMessage, TransportAdapter};
