//! Pure connection state management for the MQTT client
//!
//! This module contains pure functions for connection state, reconnection
//! backoff, CA bundle loading and rumqttc option construction.

use crate::transport::{TlsSettings, TransportError};
use rumqttc::{MqttOptions, TlsConfiguration, Transport as RumqttcTransport};
use std::time::Duration;

/// Smallest keepalive rumqttc accepts without complaint
pub const MIN_KEEPALIVE: Duration = Duration::from_secs(5);

/// Connection state for the MQTT session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and no background loop
    Disconnected,
    /// Handshake requested, waiting for CONNACK
    Connecting,
    /// CONNACK accepted; publish and subscribe are allowed
    Connected,
    /// Explicit disconnect in progress
    Disconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Reconnection backoff policy
///
/// Delay for attempt `n` (1-based) is `min_delay * multiplier^(n-1)`, capped
/// at `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl ReconnectPolicy {
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            min_delay,
            max_delay,
            ..Default::default()
        }
    }

    /// Calculate the delay before reconnection attempt `attempt` (1-based)
    pub fn calculate_backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let scaled = self.min_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(scaled)
        }
    }

    /// Validate policy parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.min_delay.is_zero() {
            return Err("min_delay must be greater than 0".to_string());
        }
        if self.max_delay < self.min_delay {
            return Err("max_delay must be greater than or equal to min_delay".to_string());
        }
        if self.multiplier < 1.0 {
            return Err("multiplier must be at least 1.0".to_string());
        }
        Ok(())
    }
}

/// Mutable backoff state driven by the background loop
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Advance to the next attempt and return its delay
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.policy.calculate_backoff_delay(self.attempt)
    }

    /// Back to the minimum delay after a successful reconnection
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Read the PEM trust bundle and check it holds at least one certificate
pub fn load_ca_certificate(tls: &TlsSettings) -> Result<Vec<u8>, TransportError> {
    let ca = std::fs::read(&tls.ca_cert).map_err(|source| TransportError::CertificateRead {
        path: tls.ca_cert.clone(),
        source,
    })?;

    let text = String::from_utf8_lossy(&ca);
    if !text.contains("-----BEGIN CERTIFICATE-----") {
        return Err(TransportError::InvalidCertificate {
            path: tls.ca_cert.clone(),
            reason: "no PEM certificate block found".to_string(),
        });
    }

    Ok(ca)
}

/// Connection parameters collected by the adapter before the handshake
#[derive(Debug, Clone, Default)]
pub struct ConnectionParams {
    pub client_id: String,
    pub credentials: Option<(String, String)>,
    /// CA bundle contents, loaded and checked by `configure_tls`
    pub ca_certificate: Option<Vec<u8>>,
    pub handshake_timeout: Option<Duration>,
}

/// Pure function to build rumqttc options for a TLS connection
///
/// TLS is mandatory: without a loaded CA bundle this fails instead of
/// falling back to plain TCP.
pub fn configure_mqtt_options(
    params: &ConnectionParams,
    host: &str,
    port: u16,
    keepalive: Duration,
) -> Result<MqttOptions, TransportError> {
    let ca = params.ca_certificate.clone().ok_or_else(|| {
        TransportError::NotConfigured("TLS must be configured before connecting".to_string())
    })?;

    let mut mqtt_options = MqttOptions::new(params.client_id.clone(), host, port);

    // rustls verifies the chain against `ca` and the broker name against `host`
    mqtt_options.set_transport(RumqttcTransport::Tls(TlsConfiguration::Simple {
        ca,
        alpn: None,
        client_auth: None,
    }));

    if let Some((username, password)) = &params.credentials {
        mqtt_options.set_credentials(username, password);
    }

    mqtt_options.set_keep_alive(keepalive.max(MIN_KEEPALIVE));
    mqtt_options.set_clean_session(true);

    Ok(mqtt_options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const TEST_PEM: &str = "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";

    fn params_with_ca() -> ConnectionParams {
        ConnectionParams {
            client_id: "test-client".to_string(),
            credentials: Some(("user".to_string(), "pass".to_string())),
            ca_certificate: Some(TEST_PEM.as_bytes().to_vec()),
            handshake_timeout: Some(Duration::from_secs(5)),
        }
    }

    #[test]
    fn test_reconnect_policy_default() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.min_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
        assert_eq!(policy.multiplier, 2.0);
    }

    #[test]
    fn test_calculate_backoff_delay() {
        let policy = ReconnectPolicy::default();

        // 1s, 2s, 4s, 8s, 16s, 32s, then capped at 60s
        assert_eq!(policy.calculate_backoff_delay(1), Duration::from_secs(1));
        assert_eq!(policy.calculate_backoff_delay(2), Duration::from_secs(2));
        assert_eq!(policy.calculate_backoff_delay(3), Duration::from_secs(4));
        assert_eq!(policy.calculate_backoff_delay(6), Duration::from_secs(32));
        assert_eq!(policy.calculate_backoff_delay(7), Duration::from_secs(60));
        assert_eq!(policy.calculate_backoff_delay(1000), Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_resets_to_minimum() {
        let mut backoff = Backoff::new(ReconnectPolicy::default());
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.attempt(), 3);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_reconnect_policy_validation() {
        assert!(ReconnectPolicy::default().validate().is_ok());

        let zero_min = ReconnectPolicy::new(Duration::ZERO, Duration::from_secs(60));
        assert!(zero_min.validate().is_err());

        let inverted = ReconnectPolicy::new(Duration::from_secs(10), Duration::from_secs(1));
        assert!(inverted.validate().is_err());

        let shrinking = ReconnectPolicy {
            multiplier: 0.5,
            ..Default::default()
        };
        assert!(shrinking.validate().is_err());
    }

    #[test]
    fn test_load_ca_certificate() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(TEST_PEM.as_bytes()).unwrap();

        let tls = TlsSettings::strict(file.path());
        let ca = load_ca_certificate(&tls).unwrap();
        assert_eq!(ca, TEST_PEM.as_bytes());
    }

    #[test]
    fn test_load_ca_certificate_missing_file() {
        let tls = TlsSettings::strict("/nonexistent/ca.pem");
        assert!(matches!(
            load_ca_certificate(&tls),
            Err(TransportError::CertificateRead { .. })
        ));
    }

    #[test]
    fn test_load_ca_certificate_not_pem() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"definitely not a certificate").unwrap();

        let tls = TlsSettings::strict(file.path());
        assert!(matches!(
            load_ca_certificate(&tls),
            Err(TransportError::InvalidCertificate { .. })
        ));
    }

    #[test]
    fn test_configure_mqtt_options() {
        let options =
            configure_mqtt_options(&params_with_ca(), "broker.local", 8883, Duration::from_secs(60))
                .unwrap();
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 8883));
        assert_eq!(options.keep_alive(), Duration::from_secs(60));
        assert_eq!(options.client_id(), "test-client");
    }

    #[test]
    fn test_configure_mqtt_options_clamps_keepalive() {
        let options =
            configure_mqtt_options(&params_with_ca(), "broker.local", 8883, Duration::from_secs(1))
                .unwrap();
        assert_eq!(options.keep_alive(), MIN_KEEPALIVE);
    }

    #[test]
    fn test_configure_mqtt_options_requires_tls() {
        let params = ConnectionParams {
            ca_certificate: None,
            ..params_with_ca()
        };
        let result = configure_mqtt_options(&params, "broker.local", 8883, Duration::from_secs(60));
        assert!(matches!(result, Err(TransportError::NotConfigured(_))));
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Disconnecting.to_string(), "disconnecting");
    }
}
