//! Pure health monitoring and reconnection logic for the MQTT session
//!
//! This module contains pure functions for state transitions, reconnection
//! decision making and connection health assessment.

use super::connection::{Backoff, ConnectionState};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Pure health monitoring and state transition logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Decide whether the background loop should try again (pure function)
    pub fn should_attempt_reconnection(
        backoff: &mut Backoff,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        let delay = backoff.next_delay();
        ReconnectionDecision::Proceed {
            attempt: backoff.attempt(),
            delay,
        }
    }

    /// Determine next state after a connection event (pure function)
    ///
    /// Broker and network events observed while an explicit disconnect is in
    /// progress do not move the state: teardown owns the final transition.
    pub fn determine_next_state(
        current_state: ConnectionState,
        event: &ConnectionEvent,
    ) -> ConnectionState {
        match event {
            ConnectionEvent::ConnectRequested => ConnectionState::Connecting,
            ConnectionEvent::DisconnectRequested => ConnectionState::Disconnecting,
            ConnectionEvent::DisconnectCompleted => ConnectionState::Disconnected,
            _ if current_state == ConnectionState::Disconnecting => current_state,
            ConnectionEvent::ConnAckReceived => ConnectionState::Connected,
            ConnectionEvent::ConnectRefused(_) => ConnectionState::Disconnected,
            ConnectionEvent::DisconnectedByBroker => ConnectionState::Disconnected,
            ConnectionEvent::NetworkError(_) => ConnectionState::Disconnected,
        }
    }

    /// Check if connection state allows publishing (pure function)
    pub fn can_publish(state: ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    /// Check if connection state allows subscribing (pure function)
    pub fn can_subscribe(state: ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    /// Calculate health metrics for connection (pure function)
    pub fn calculate_health_metrics(
        connect_time: Option<Instant>,
        last_message_time: Option<Instant>,
        reconnect_count: u32,
    ) -> HealthMetrics {
        let now = Instant::now();

        let uptime = connect_time.map(|t| now.duration_since(t));
        let time_since_last_message = last_message_time.map(|t| now.duration_since(t));

        HealthMetrics {
            uptime,
            time_since_last_message,
            reconnect_count,
            is_healthy: Self::determine_health_status(uptime, time_since_last_message),
        }
    }

    /// Determine overall health status (pure function)
    fn determine_health_status(
        uptime: Option<Duration>,
        time_since_last_message: Option<Duration>,
    ) -> bool {
        // Connected, and either silent so far or heard from within 5 minutes
        match (uptime, time_since_last_message) {
            (Some(_), None) => true,
            (Some(_), Some(last_msg)) => last_msg < Duration::from_secs(300),
            _ => false,
        }
    }

    /// Log connection state transition
    pub fn log_state_transition(client_id: &str, from: ConnectionState, to: ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!(client_id, "MQTT connection established");
            }
            (ConnectionState::Disconnected, ConnectionState::Connected) => {
                info!(client_id, "MQTT reconnection successful");
            }
            (ConnectionState::Connected, ConnectionState::Disconnected) => {
                warn!(client_id, "MQTT connection lost");
            }
            (ConnectionState::Connecting, ConnectionState::Disconnected) => {
                error!(client_id, "MQTT connection attempt refused");
            }
            (from, to) if from == to => {}
            (from, to) => {
                info!(client_id, %from, %to, "MQTT connection state changed");
            }
        }
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Sleep `delay`, then poll the event loop again
    Proceed { attempt: u32, delay: Duration },
    /// Abort reconnection - shutdown requested
    AbortShutdownRequested,
}

/// Connection events that trigger state transitions
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// `connect()` called
    ConnectRequested,
    /// CONNACK with return code 0
    ConnAckReceived,
    /// CONNACK with a non-zero return code
    ConnectRefused(String),
    /// Broker initiated disconnect
    DisconnectedByBroker,
    /// Network or protocol error
    NetworkError(String),
    /// `disconnect()` called
    DisconnectRequested,
    /// Background loop stopped and DISCONNECT sent
    DisconnectCompleted,
}

/// Health metrics for connection monitoring
#[derive(Debug, Clone, PartialEq)]
pub struct HealthMetrics {
    /// Time since the current connection was established
    pub uptime: Option<Duration>,
    /// Time since last message received
    pub time_since_last_message: Option<Duration>,
    /// Number of successful reconnections after a lost link
    pub reconnect_count: u32,
    /// Overall health status
    pub is_healthy: bool,
}

/// Connection quality assessment
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionQuality {
    /// Stable for over an hour, no reconnections
    Excellent,
    Good,
    Fair,
    Poor,
    /// Not connected or silent for too long
    Critical,
}

impl HealthMonitor {
    /// Assess connection quality based on metrics (pure function)
    pub fn assess_connection_quality(metrics: &HealthMetrics) -> ConnectionQuality {
        if !metrics.is_healthy {
            return ConnectionQuality::Critical;
        }

        match (metrics.reconnect_count, metrics.uptime) {
            (0, Some(uptime)) if uptime > Duration::from_secs(3600) => ConnectionQuality::Excellent,
            (0, Some(_)) => ConnectionQuality::Good,
            (1..=2, Some(uptime)) if uptime > Duration::from_secs(1800) => ConnectionQuality::Good,
            (1..=2, Some(_)) => ConnectionQuality::Fair,
            (3..=5, _) => ConnectionQuality::Fair,
            (6..=10, _) => ConnectionQuality::Poor,
            _ => ConnectionQuality::Critical,
        }
    }
}
