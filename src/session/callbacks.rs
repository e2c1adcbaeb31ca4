//! Transport callbacks that feed the event synchronizer

use super::signals::EventSynchronizer;
use crate::protocol::topics::qos_level;
use crate::transport::mqtt::{ConnectionEvent, HealthMonitor, MessageForwarder};
use crate::transport::{ConnectResult, DisconnectReason, InboundMessage, TransportCallbacks};
use rumqttc::QoS;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Callback sink registered with the transport by the session
///
/// Every method is short and non-blocking: it runs on the transport's
/// background loop.
pub struct SessionCallbacks {
    client_id: String,
    sync: Arc<EventSynchronizer>,
    forwarder: Arc<Mutex<MessageForwarder>>,
}

impl SessionCallbacks {
    pub fn new(
        client_id: impl Into<String>,
        sync: Arc<EventSynchronizer>,
        forwarder: Arc<Mutex<MessageForwarder>>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            sync,
            forwarder,
        }
    }

    fn transition(&self, event: ConnectionEvent) {
        let (from, to) = self.sync.apply(&event);
        HealthMonitor::log_state_transition(&self.client_id, from, to);
    }
}

impl TransportCallbacks for SessionCallbacks {
    fn on_connect(&self, result: ConnectResult) {
        match &result {
            ConnectResult::Accepted { session_present } => {
                info!(client_id = %self.client_id, session_present, "Connected to broker");
                self.transition(ConnectionEvent::ConnAckReceived);
            }
            ConnectResult::Refused { code, reason } => {
                warn!(client_id = %self.client_id, code, %reason, "Connection refused");
                self.transition(ConnectionEvent::ConnectRefused(reason.clone()));
            }
        }
        // Refusals raise the same signal; the caller inspects the result
        self.sync.record_connect(result);
    }

    fn on_disconnect(&self, reason: DisconnectReason) {
        match reason {
            DisconnectReason::ByBroker => {
                self.transition(ConnectionEvent::DisconnectedByBroker);
            }
            DisconnectReason::Unexpected(cause) => {
                warn!(client_id = %self.client_id, %cause, "Link lost, transport will reconnect");
                self.transition(ConnectionEvent::NetworkError(cause));
            }
        }
        self.sync.connected.reset();
    }

    fn on_publish_sent(&self, mid: u16) {
        if self.sync.publish_sent(mid) {
            debug!(client_id = %self.client_id, mid, "Publish written");
        }
    }

    fn on_publish(&self, mid: u16) {
        if self.sync.complete_publish(mid) {
            debug!(client_id = %self.client_id, mid, "Publish acknowledged");
        } else {
            debug!(client_id = %self.client_id, mid, "Acknowledgement for no waiting publish, ignored");
        }
    }

    fn on_subscribe_sent(&self, mid: u16) {
        if self.sync.subscribe_sent(mid) {
            debug!(client_id = %self.client_id, mid, "Subscribe written");
        }
    }

    fn on_subscribe(&self, mid: u16, granted: Vec<Option<QoS>>) {
        let levels: Vec<Option<u8>> = granted.iter().map(|q| q.map(qos_level)).collect();
        if self.sync.complete_subscribe(mid, granted) {
            info!(client_id = %self.client_id, mid, granted = ?levels, "Subscribed");
        } else {
            debug!(client_id = %self.client_id, mid, "SUBACK for no waiting subscribe, ignored");
        }
    }

    fn on_message(&self, message: InboundMessage) {
        info!(
            client_id = %self.client_id,
            topic = %message.topic,
            retain = message.retain,
            payload = %message.payload_str(),
            "Message received"
        );

        if let Ok(forwarder) = self.forwarder.lock() {
            forwarder.forward_message(message.clone());
        }
        self.sync.record_message(message);
    }
}
