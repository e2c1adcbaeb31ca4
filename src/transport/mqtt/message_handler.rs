//! Pure routing of rumqttc events for the MQTT transport
//!
//! This module turns raw event loop output into [`EventRoute`] decisions and
//! forwards inbound messages to an optional application channel.

use crate::transport::{ConnectResult, InboundMessage};
use rumqttc::{ConnectReturnCode, Event, Outgoing, Packet, QoS, SubscribeReasonCode};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(connack) => match Self::connect_result(connack.code) {
                    ConnectResult::Accepted { .. } => EventRoute::ConnectionAcknowledged {
                        session_present: connack.session_present,
                    },
                    refused => EventRoute::ConnectionRefused(refused),
                },
                Packet::Publish(publish) => EventRoute::MessageReceived(InboundMessage::new(
                    publish.topic.clone(),
                    publish.payload.clone(),
                    publish.qos,
                    publish.retain,
                )),
                Packet::PubAck(puback) => EventRoute::PublishCompleted { mid: puback.pkid },
                Packet::PubComp(pubcomp) => EventRoute::PublishCompleted { mid: pubcomp.pkid },
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    mid: suback.pkid,
                    granted: Self::granted_qos(&suback.return_codes),
                },
                Packet::Disconnect => EventRoute::Disconnected,
                other => EventRoute::Infrastructure(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Publish(pkid)) => EventRoute::OutgoingPublish { pkid: *pkid },
            Event::Outgoing(Outgoing::Subscribe(pkid)) => {
                EventRoute::OutgoingSubscribe { pkid: *pkid }
            }
            Event::Outgoing(Outgoing::Disconnect) => EventRoute::OutgoingDisconnect,
            Event::Outgoing(other) => EventRoute::Infrastructure(format!("{other:?}")),
        }
    }

    /// Map a CONNACK return code to a connect result (pure function)
    pub fn connect_result(code: ConnectReturnCode) -> ConnectResult {
        let (code, reason) = match code {
            ConnectReturnCode::Success => {
                return ConnectResult::Accepted {
                    session_present: false,
                }
            }
            ConnectReturnCode::RefusedProtocolVersion => (1, "unacceptable protocol version"),
            ConnectReturnCode::BadClientId => (2, "identifier rejected"),
            ConnectReturnCode::ServiceUnavailable => (3, "server unavailable"),
            ConnectReturnCode::BadUserNamePassword => (4, "bad user name or password"),
            ConnectReturnCode::NotAuthorized => (5, "not authorized"),
        };
        ConnectResult::Refused {
            code,
            reason: reason.to_string(),
        }
    }

    /// Granted QoS per filter; `None` for a refused filter (pure function)
    pub fn granted_qos(return_codes: &[SubscribeReasonCode]) -> Vec<Option<QoS>> {
        return_codes
            .iter()
            .map(|code| match code {
                SubscribeReasonCode::Success(qos) => Some(*qos),
                SubscribeReasonCode::Failure => None,
            })
            .collect()
    }

    /// QoS 0 publishes carry packet id 0 and complete once written
    pub fn completes_on_send(pkid: u16) -> bool {
        pkid == 0
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// CONNACK with return code 0
    ConnectionAcknowledged { session_present: bool },
    /// CONNACK with a non-zero return code
    ConnectionRefused(ConnectResult),
    /// PUBACK (QoS 1) or PUBCOMP (QoS 2)
    PublishCompleted { mid: u16 },
    /// SUBACK with the granted QoS per filter
    SubscriptionConfirmed { mid: u16, granted: Vec<Option<QoS>> },
    /// PUBLISH received on a subscribed topic
    MessageReceived(InboundMessage),
    /// Broker sent DISCONNECT
    Disconnected,
    /// PUBLISH written to the network; pkid is 0 for QoS 0
    OutgoingPublish { pkid: u16 },
    /// SUBSCRIBE written to the network
    OutgoingSubscribe { pkid: u16 },
    /// Our DISCONNECT written to the network
    OutgoingDisconnect,
    /// Pings, PUBREC/PUBREL and other protocol bookkeeping
    Infrastructure(String),
}

/// Message forwarding operations (impure I/O)
///
/// Runs on the event loop task, so forwarding never waits: a full channel
/// drops the message with a warning.
pub struct MessageForwarder {
    message_sender: Option<mpsc::Sender<InboundMessage>>,
}

impl MessageForwarder {
    pub fn new() -> Self {
        Self {
            message_sender: None,
        }
    }

    pub fn set_message_sender(&mut self, sender: mpsc::Sender<InboundMessage>) {
        self.message_sender = Some(sender);
    }

    /// Forward an inbound message to the application channel, if any
    ///
    /// Returns whether the channel took the message; a full or closed
    /// channel drops it with a warning.
    pub fn forward_message(&self, message: InboundMessage) -> bool {
        let Some(sender) = &self.message_sender else {
            return false;
        };

        debug!(topic = %message.topic, "Forwarding inbound message");
        match sender.try_send(message) {
            Ok(()) => true,
            Err(e) => {
                warn!("Inbound message dropped: {}", e);
                false
            }
        }
    }
}

impl Default for MessageForwarder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rumqttc::{ConnAck, PubAck, PubComp, Publish, SubAck};

    #[test]
    fn test_route_connack() {
        let connack = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: true,
            code: ConnectReturnCode::Success,
        }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&connack),
            EventRoute::ConnectionAcknowledged {
                session_present: true
            }
        );

        let refused = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::NotAuthorized,
        }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&refused),
            EventRoute::ConnectionRefused(ConnectResult::Refused {
                code: 5,
                reason: "not authorized".to_string()
            })
        );
    }

    #[test]
    fn test_connect_result_codes() {
        let codes = [
            (ConnectReturnCode::RefusedProtocolVersion, 1),
            (ConnectReturnCode::BadClientId, 2),
            (ConnectReturnCode::ServiceUnavailable, 3),
            (ConnectReturnCode::BadUserNamePassword, 4),
            (ConnectReturnCode::NotAuthorized, 5),
        ];
        for (rc, expected) in codes {
            match MessageHandler::connect_result(rc) {
                ConnectResult::Refused { code, .. } => assert_eq!(code, expected),
                other => panic!("Expected refusal, got {other:?}"),
            }
        }
        assert!(MessageHandler::connect_result(ConnectReturnCode::Success).is_accepted());
    }

    #[test]
    fn test_route_publish() {
        let mut publish = Publish::new("teste/status", QoS::AtLeastOnce, "Hello World!");
        publish.retain = true;
        let event = Event::Incoming(Packet::Publish(publish));

        match MessageHandler::route_mqtt_event(&event) {
            EventRoute::MessageReceived(message) => {
                assert_eq!(message.topic, "teste/status");
                assert_eq!(message.payload, Bytes::from("Hello World!"));
                assert_eq!(message.qos, QoS::AtLeastOnce);
                assert!(message.retain);
            }
            other => panic!("Expected MessageReceived route, got {other:?}"),
        }
    }

    #[test]
    fn test_route_publish_acknowledgements() {
        let puback = Event::Incoming(Packet::PubAck(PubAck { pkid: 7 }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&puback),
            EventRoute::PublishCompleted { mid: 7 }
        );

        let pubcomp = Event::Incoming(Packet::PubComp(PubComp { pkid: 9 }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&pubcomp),
            EventRoute::PublishCompleted { mid: 9 }
        );

        let outgoing = Event::Outgoing(Outgoing::Publish(0));
        assert_eq!(
            MessageHandler::route_mqtt_event(&outgoing),
            EventRoute::OutgoingPublish { pkid: 0 }
        );

        let subscribe = Event::Outgoing(Outgoing::Subscribe(4));
        assert_eq!(
            MessageHandler::route_mqtt_event(&subscribe),
            EventRoute::OutgoingSubscribe { pkid: 4 }
        );
    }

    #[test]
    fn test_route_suback() {
        let suback = Event::Incoming(Packet::SubAck(SubAck {
            pkid: 3,
            return_codes: vec![
                SubscribeReasonCode::Success(QoS::AtLeastOnce),
                SubscribeReasonCode::Failure,
            ],
        }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&suback),
            EventRoute::SubscriptionConfirmed {
                mid: 3,
                granted: vec![Some(QoS::AtLeastOnce), None],
            }
        );
    }

    #[test]
    fn test_route_disconnect_and_pings() {
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Incoming(Packet::Disconnect)),
            EventRoute::Disconnected
        );
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::Disconnect)),
            EventRoute::OutgoingDisconnect
        );
        assert!(matches!(
            MessageHandler::route_mqtt_event(&Event::Incoming(Packet::PingResp)),
            EventRoute::Infrastructure(_)
        ));
    }

    #[test]
    fn test_completes_on_send() {
        assert!(MessageHandler::completes_on_send(0));
        // QoS 1 and 2 wait for PUBACK / PUBCOMP
        assert!(!MessageHandler::completes_on_send(1));
        assert!(!MessageHandler::completes_on_send(42));
    }

    #[tokio::test]
    async fn test_message_forwarder() {
        let mut forwarder = MessageForwarder::new();
        let message = InboundMessage::new("teste/status", "ping", QoS::AtMostOnce, false);

        // Without a channel the message is simply not forwarded
        assert!(!forwarder.forward_message(message.clone()));

        let (tx, mut rx) = mpsc::channel(1);
        forwarder.set_message_sender(tx);
        assert!(forwarder.forward_message(message.clone()));

        // Channel full
        assert!(!forwarder.forward_message(message.clone()));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.topic, "teste/status");
    }
}
