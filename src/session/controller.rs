//! Session controller: connection lifecycle and acknowledged requests
//!
//! Every operation resets its signal and opens its pending record, hands the
//! request to the transport and then waits on the signal with an explicit
//! timeout. The transport mutex is held for the hand-off only, which also
//! keeps records in the order requests enter the transport's queue; waits
//! never hold it.

use super::callbacks::SessionCallbacks;
use super::signals::{EventSynchronizer, PendingAck};
use super::{ClientIdentity, PublishOutcome, SubscribeAck};
use crate::error::{SessionError, SessionResult};
use crate::protocol::topics::{
    parse_qos, validate_client_id, validate_publish_topic, validate_topic_filter,
};
use crate::session_span;
use crate::transport::mqtt::{
    ConnectionEvent, ConnectionQuality, ConnectionState, HealthMetrics, HealthMonitor,
    MessageForwarder,
};
use crate::transport::{ConnectResult, InboundMessage, TransportAdapter, TransportError};
use bytes::Bytes;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn, Instrument};

/// A single client session over a transport adapter
pub struct Session<T: TransportAdapter> {
    identity: ClientIdentity,
    transport: Mutex<T>,
    sync: Arc<EventSynchronizer>,
    forwarder: Arc<StdMutex<MessageForwarder>>,
}

impl<T: TransportAdapter> Session<T> {
    /// Create a session and register its callbacks with the transport
    pub fn new(identity: ClientIdentity, mut transport: T) -> SessionResult<Self> {
        validate_client_id(&identity.client_id).map_err(SessionError::InvalidClientId)?;

        let sync = Arc::new(EventSynchronizer::new());
        let forwarder = Arc::new(StdMutex::new(MessageForwarder::new()));
        transport.set_callbacks(Arc::new(SessionCallbacks::new(
            identity.client_id.clone(),
            sync.clone(),
            forwarder.clone(),
        )));

        Ok(Self {
            identity,
            transport: Mutex::new(transport),
            sync,
            forwarder,
        })
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub fn state(&self) -> ConnectionState {
        self.sync.state()
    }

    pub fn is_connected(&self) -> bool {
        self.sync.state() == ConnectionState::Connected
    }

    /// Receiver notified on every connection state change
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.sync.watch_state()
    }

    /// Result of the most recent handshake, if any
    pub fn last_connect_result(&self) -> Option<ConnectResult> {
        self.sync.connect_result()
    }

    /// Forward every inbound message to `sender` (non-blocking, drops when full)
    pub fn set_message_sender(&self, sender: mpsc::Sender<InboundMessage>) {
        if let Ok(mut forwarder) = self.forwarder.lock() {
            forwarder.set_message_sender(sender);
        }
    }

    pub fn health_metrics(&self) -> HealthMetrics {
        let (connect_time, last_message_time, reconnect_count) = self.sync.link_history();
        HealthMonitor::calculate_health_metrics(connect_time, last_message_time, reconnect_count)
    }

    pub fn connection_quality(&self) -> ConnectionQuality {
        HealthMonitor::assess_connection_quality(&self.health_metrics())
    }

    fn transition(&self, event: ConnectionEvent) {
        let (from, to) = self.sync.apply(&event);
        HealthMonitor::log_state_transition(&self.identity.client_id, from, to);
    }

    /// Connect and wait for the broker's CONNACK
    ///
    /// Returns immediately when already connected. On timeout the state stays
    /// `Connecting` and the transport keeps retrying in the background until
    /// [`disconnect`](Self::disconnect).
    pub async fn connect(&self, keepalive: Duration, timeout: Duration) -> SessionResult<()> {
        let span = session_span!("connect", client_id = %self.identity.client_id);
        async move {
            if self.is_connected() {
                debug!("Already connected");
                return Ok(());
            }

            info!(host = %self.identity.host, port = self.identity.port, "Connecting to broker");
            {
                let mut transport = self.transport.lock().await;
                // A loop left over from a timed-out attempt must not report into this one
                transport.stop_background_loop().await;

                self.sync.begin_connect();
                self.transition(ConnectionEvent::ConnectRequested);

                if let Err(e) = self.start_transport(&mut *transport, keepalive).await {
                    self.transition(ConnectionEvent::ConnectRefused(e.to_string()));
                    return Err(SessionError::Transport(e));
                }
            }

            if !self.sync.connected.wait(timeout).await {
                warn!(?timeout, "No CONNACK within timeout");
                return Err(SessionError::ConnectTimeout { timeout });
            }

            match self.sync.connect_result() {
                Some(ConnectResult::Accepted { .. }) => Ok(()),
                Some(ConnectResult::Refused { code, reason }) => {
                    // Broker said no: stop retrying with the same credentials
                    self.transport.lock().await.stop_background_loop().await;
                    Err(SessionError::ConnectRejected { code, reason })
                }
                None => Err(SessionError::ConnectTimeout { timeout }),
            }
        }
        .instrument(span)
        .await
    }

    async fn start_transport(&self, transport: &mut T, keepalive: Duration) -> Result<(), TransportError> {
        transport.configure_auth(&self.identity.username, self.identity.password());
        transport.configure_tls(self.identity.tls_settings())?;
        transport
            .connect_async(&self.identity.host, self.identity.port, keepalive)
            .await?;
        transport.start_background_loop()
    }

    /// Stop the background loop, send DISCONNECT and release the connection
    ///
    /// Idempotent: calling it while disconnected is a no-op that succeeds.
    pub async fn disconnect(&self) -> SessionResult<()> {
        let span = session_span!("disconnect", client_id = %self.identity.client_id);
        async move {
            self.transition(ConnectionEvent::DisconnectRequested);

            {
                let mut transport = self.transport.lock().await;
                transport.stop_background_loop().await;
                if let Err(e) = transport.disconnect().await {
                    warn!("Transport disconnect failed: {}", e);
                }
            }

            self.sync.connected.reset();
            self.transition(ConnectionEvent::DisconnectCompleted);
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Publish and wait for the completion callback
    ///
    /// Invalid topics and QoS levels are errors; everything that can happen
    /// to a valid request is a [`PublishOutcome`].
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: u8,
        retain: bool,
        timeout: Duration,
    ) -> SessionResult<PublishOutcome> {
        validate_publish_topic(topic)?;
        let qos = parse_qos(qos)?;
        let payload = payload.into();

        let span = session_span!("publish", client_id = %self.identity.client_id, topic, ?qos, retain);
        async move {
            let state = self.state();
            if !HealthMonitor::can_publish(state) {
                warn!(%state, "Publish refused while not connected");
                return Ok(PublishOutcome::NotConnected);
            }

            let token = {
                let mut transport = self.transport.lock().await;
                let token = self.sync.begin_publish();
                if let Err(e) = transport.publish(topic, payload, qos, retain).await {
                    self.sync.abandon_publish(token);
                    warn!("Publish send failed: {}", e);
                    return Ok(PublishOutcome::SendFailed(e.to_string()));
                }
                token
            };

            self.sync.published.wait(timeout).await;
            match self.sync.finish_publish(token) {
                Some(PendingAck {
                    completed: true,
                    mid: Some(mid),
                    ..
                }) => {
                    info!(mid, "Published");
                    Ok(PublishOutcome::Acknowledged { mid })
                }
                _ => {
                    warn!(?timeout, "No publish acknowledgement within timeout");
                    Ok(PublishOutcome::Timeout)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Subscribe and wait for the SUBACK
    pub async fn subscribe(
        &self,
        topic: &str,
        qos: u8,
        timeout: Duration,
    ) -> SessionResult<SubscribeAck> {
        validate_topic_filter(topic)?;
        let qos = parse_qos(qos)?;

        let span = session_span!("subscribe", client_id = %self.identity.client_id, topic, ?qos);
        async move {
            let state = self.state();
            if !HealthMonitor::can_subscribe(state) {
                return Err(SessionError::not_connected(state));
            }

            let token = {
                let mut transport = self.transport.lock().await;
                let token = self.sync.begin_subscribe();
                if let Err(e) = transport.subscribe(topic, qos).await {
                    self.sync.abandon_subscribe(token);
                    return Err(SessionError::TransportSendFailure(e));
                }
                token
            };

            self.sync.subscribed.wait(timeout).await;
            let (mid, granted) = match self.sync.finish_subscribe(token) {
                Some(PendingAck {
                    completed: true,
                    mid: Some(mid),
                    granted,
                    ..
                }) => (mid, granted),
                _ => {
                    return Err(SessionError::SubscribeTimeout {
                        topic: topic.to_string(),
                        timeout,
                    })
                }
            };

            if !granted.is_empty() && granted.iter().all(Option::is_none) {
                return Err(SessionError::SubscribeRejected {
                    topic: topic.to_string(),
                });
            }

            Ok(SubscribeAck { mid, granted })
        }
        .instrument(span)
        .await
    }

    /// Latest inbound message since the last publish or subscribe
    ///
    /// Waits up to `timeout` for one to arrive. The observation is not
    /// consumed: calling again returns the same message until the next
    /// publish or subscribe resets it.
    pub async fn wait_for_message(&self, timeout: Duration) -> Option<InboundMessage> {
        if self.sync.message.wait(timeout).await {
            self.sync.last_message()
        } else {
            None
        }
    }
}
