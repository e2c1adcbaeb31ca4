//! MQTT protocol rules applied before requests reach the transport

pub mod topics;

pub use topics::*;
