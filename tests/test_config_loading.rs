//! Configuration loading and identity resolution tests
//!
//! Tests focus on observable outcomes: what a file or environment produces,
//! and which errors come back when something is wrong.

use mqtt_session::config::{ClientConfig, ConfigError};
use mqtt_session::identity;
use mqtt_session::session::ClientIdentity;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let temp_file = write_config(
        r#"
[client]
name = "greenhouse-"

[broker]
url = "mqtts://broker.example.com:8884"

[tls]
ca_cert = "/etc/ssl/broker-ca.pem"

[session]
keepalive_secs = 30
operation_timeout_ms = 2500
"#,
    );

    let config = ClientConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.client.name, "greenhouse-");
    assert_eq!(
        config.broker_endpoint().unwrap(),
        ("broker.example.com".to_string(), 8884)
    );
    assert_eq!(config.session.keepalive(), Duration::from_secs(30));
    assert_eq!(config.session.operation_timeout(), Duration::from_millis(2500));
    assert_eq!(config.session.connect_timeout(), Duration::from_secs(5));
    assert_eq!(config.broker.username_env, "USER_NAME");
}

#[test]
fn test_config_rejects_plain_tcp_broker() {
    let temp_file = write_config(
        r#"
[client]
name = "greenhouse-"

[broker]
url = "mqtt://broker.example.com:1883"

[tls]
ca_cert = "/etc/ssl/broker-ca.pem"
"#,
    );

    let result = ClientConfig::load_from_file(temp_file.path());

    assert!(matches!(result, Err(ConfigError::InvalidBrokerUrl { .. })));
}

#[test]
fn test_config_rejects_inverted_reconnect_delays() {
    let temp_file = write_config(
        r#"
[client]
name = "greenhouse-"

[broker]
url = "mqtts://broker.example.com"

[tls]
ca_cert = "/etc/ssl/broker-ca.pem"

[session]
reconnect_min_delay_secs = 30
reconnect_max_delay_secs = 5
"#,
    );

    let result = ClientConfig::load_from_file(temp_file.path());

    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_config_missing_file() {
    let result = ClientConfig::load_from_file(std::path::Path::new("/nonexistent/client.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_config_malformed_toml() {
    let temp_file = write_config("[client\nname = ");
    let result = ClientConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_identity_from_config_and_machine_id() {
    // Arrange: Credentials live in uniquely named variables
    std::env::set_var("MQTT_SESSION_IT_USER", "device-7");
    std::env::set_var("MQTT_SESSION_IT_PASS", "hunter2");
    let dir = tempfile::tempdir().unwrap();
    let machine_id_path = dir.path().join("machine_id.txt");
    let temp_file = write_config(&format!(
        r#"
[client]
name = "greenhouse-"
machine_id_file = "{}"

[broker]
url = "ssl://broker.example.com"
username_env = "MQTT_SESSION_IT_USER"
password_env = "MQTT_SESSION_IT_PASS"

[tls]
ca_cert = "/etc/ssl/broker-ca.pem"
handshake_timeout_ms = 1500
"#,
        machine_id_path.display()
    ));

    // Act
    let config = ClientConfig::load_from_file(temp_file.path()).unwrap();
    let machine_id = identity::load_or_create(&config.client.machine_id_file).unwrap();
    let client = ClientIdentity::from_config(&config, &machine_id).unwrap();

    // Assert
    assert_eq!(client.client_id, format!("greenhouse-{machine_id}"));
    assert_eq!(client.host, "broker.example.com");
    assert_eq!(client.port, 8883);
    assert_eq!(client.username, "device-7");
    assert_eq!(client.password(), "hunter2");
    assert_eq!(client.handshake_timeout, Duration::from_millis(1500));
    assert!(!format!("{client:?}").contains("hunter2"));

    // The same machine id is reused on the next start
    assert_eq!(
        identity::load_or_create(&machine_id_path).unwrap(),
        machine_id
    );
}

#[test]
fn test_identity_requires_credentials() {
    let temp_file = write_config(
        r#"
[client]
name = "greenhouse-"

[broker]
url = "mqtts://broker.example.com"
username_env = "MQTT_SESSION_IT_MISSING_USER"
password_env = "MQTT_SESSION_IT_MISSING_PASS"

[tls]
ca_cert = "/etc/ssl/broker-ca.pem"
"#,
    );

    let config = ClientConfig::load_from_file(temp_file.path()).unwrap();
    let result = ClientIdentity::from_config(&config, "abc");

    assert!(matches!(result, Err(ConfigError::EnvVarNotFound(var)) if var == "MQTT_SESSION_IT_MISSING_USER"));
}
