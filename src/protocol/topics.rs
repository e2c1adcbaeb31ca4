//! Topic, QoS and client identifier validation
//!
//! MQTT 3.1.1 rules checked locally before a request reaches the transport,
//! so malformed input fails fast instead of surfacing as a broker disconnect.

use rumqttc::QoS;
use thiserror::Error;

/// Maximum encoded length of a topic name or filter
pub const MAX_TOPIC_LEN: usize = 65_535;

/// Maximum client identifier length accepted by this client
pub const MAX_CLIENT_ID_LEN: usize = 128;

/// Validation errors for topics, QoS levels and client identifiers
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Topic cannot be empty")]
    EmptyTopic,
    #[error("Topic exceeds {MAX_TOPIC_LEN} bytes")]
    TopicTooLong,
    #[error("Topic contains a NUL character")]
    NulInTopic,
    #[error("Publish topic cannot contain wildcards: '{0}'")]
    WildcardInPublishTopic(String),
    #[error("Invalid wildcard placement in filter: '{0}'")]
    InvalidWildcard(String),
    #[error("QoS must be 0, 1 or 2, got {0}")]
    InvalidQos(u8),
    #[error("Client ID cannot be empty")]
    EmptyClientId,
    #[error("Client ID exceeds {MAX_CLIENT_ID_LEN} characters")]
    ClientIdTooLong,
    #[error("Client ID contains invalid character: '{0}'")]
    InvalidClientIdChar(char),
}

fn check_common(topic: &str) -> Result<(), ValidationError> {
    if topic.is_empty() {
        return Err(ValidationError::EmptyTopic);
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(ValidationError::TopicTooLong);
    }
    if topic.contains('\0') {
        return Err(ValidationError::NulInTopic);
    }
    Ok(())
}

/// Validate a topic name used for PUBLISH (no wildcards allowed)
pub fn validate_publish_topic(topic: &str) -> Result<(), ValidationError> {
    check_common(topic)?;
    if topic.contains('+') || topic.contains('#') {
        return Err(ValidationError::WildcardInPublishTopic(topic.to_string()));
    }
    Ok(())
}

/// Validate a topic filter used for SUBSCRIBE
///
/// `+` must occupy a whole level; `#` must occupy a whole level and be last.
pub fn validate_topic_filter(filter: &str) -> Result<(), ValidationError> {
    check_common(filter)?;

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    for (i, level) in levels.iter().enumerate() {
        let has_plus = level.contains('+');
        let has_hash = level.contains('#');
        if (has_plus || has_hash) && level.len() != 1 {
            return Err(ValidationError::InvalidWildcard(filter.to_string()));
        }
        if has_hash && i != last {
            return Err(ValidationError::InvalidWildcard(filter.to_string()));
        }
    }
    Ok(())
}

/// Whether `topic` matches the subscription `filter`
///
/// Wildcards at the first level never match topics starting with `$`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Convert a numeric QoS level into the rumqttc type
pub fn parse_qos(level: u8) -> Result<QoS, ValidationError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(ValidationError::InvalidQos(other)),
    }
}

/// Numeric level for a QoS value
pub fn qos_level(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}

/// Validate a client identifier: `[a-zA-Z0-9._-]+`, at most 128 characters
pub fn validate_client_id(client_id: &str) -> Result<(), ValidationError> {
    if client_id.is_empty() {
        return Err(ValidationError::EmptyClientId);
    }
    if client_id.chars().count() > MAX_CLIENT_ID_LEN {
        return Err(ValidationError::ClientIdTooLong);
    }
    for ch in client_id.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '.' && ch != '_' && ch != '-' {
            return Err(ValidationError::InvalidClientIdChar(ch));
        }
    }
    Ok(())
}
