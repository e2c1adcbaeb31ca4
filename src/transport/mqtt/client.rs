//! Impure I/O operations for the MQTT transport
//!
//! This module owns the rumqttc `AsyncClient` and `EventLoop`, drives the
//! event loop on a background task and reports protocol events through the
//! registered [`TransportCallbacks`].

use super::connection::{
    configure_mqtt_options, load_ca_certificate, Backoff, ConnectionParams, ReconnectPolicy,
};
use super::health_monitor::{HealthMonitor, ReconnectionDecision};
use super::message_handler::{EventRoute, MessageHandler};
use crate::transport_span;
use crate::transport::{
    ConnectResult, DisconnectReason, TlsSettings, TransportAdapter, TransportCallbacks,
    TransportError,
};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, NetworkOptions, Outgoing, QoS};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Capacity of the rumqttc request channel
const REQUEST_CHANNEL_CAPACITY: usize = 10;

/// How long `stop_background_loop` waits before aborting the task
const LOOP_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Upper bound for writing DISCONNECT during teardown
const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

type Subscriptions = Arc<StdMutex<Vec<(String, QoS)>>>;

/// Who queued a SUBSCRIBE, in request channel order
#[derive(Debug, Clone, Copy, PartialEq)]
enum SubscribeOrigin {
    Caller,
    Resubscribe,
}

type SubscribeOrigins = Arc<StdMutex<VecDeque<SubscribeOrigin>>>;

/// Queue a SUBSCRIBE and remember who asked for it
///
/// The origin is recorded under the same lock as the enqueue so the origin
/// queue and the request channel cannot disagree on order.
fn queue_subscribe(
    client: &AsyncClient,
    origins: &SubscribeOrigins,
    origin: SubscribeOrigin,
    topic: &str,
    qos: QoS,
) -> Result<(), rumqttc::ClientError> {
    let mut origins = origins.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    client.try_subscribe(topic, qos)?;
    origins.push_back(origin);
    Ok(())
}

/// rumqttc-backed transport adapter (MQTT 3.1.1 over TLS)
pub struct MqttClient {
    params: ConnectionParams,
    client: Option<AsyncClient>,
    /// Parked here whenever the background loop is not running
    event_loop: Option<EventLoop>,
    event_loop_handle: Option<JoinHandle<EventLoop>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    callbacks: Option<Arc<dyn TransportCallbacks>>,
    reconnect_policy: ReconnectPolicy,
    subscribed_topics: Subscriptions, // Track subscriptions for re-subscription
    subscribe_origins: SubscribeOrigins,
    link_up: Arc<AtomicBool>,
}

impl MqttClient {
    pub fn new(client_id: &str) -> Self {
        Self {
            params: ConnectionParams {
                client_id: client_id.to_string(),
                ..Default::default()
            },
            client: None,
            event_loop: None,
            event_loop_handle: None,
            shutdown_tx: None,
            callbacks: None,
            reconnect_policy: ReconnectPolicy::default(),
            subscribed_topics: Arc::new(StdMutex::new(Vec::new())),
            subscribe_origins: Arc::new(StdMutex::new(VecDeque::new())),
            link_up: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Override the reconnection backoff (default 1s to 60s, doubling)
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect_policy = policy;
        self
    }

    pub fn client_id(&self) -> &str {
        &self.params.client_id
    }

    /// Whether the background loop task is currently running
    pub fn is_loop_running(&self) -> bool {
        self.event_loop_handle.is_some()
    }

    /// Topic filters re-issued after a reconnect
    pub fn tracked_subscriptions(&self) -> Vec<(String, QoS)> {
        self.subscribed_topics
            .lock()
            .map(|topics| topics.clone())
            .unwrap_or_default()
    }

    fn track_subscription(&self, topic: &str, qos: QoS) {
        if let Ok(mut topics) = self.subscribed_topics.lock() {
            match topics.iter_mut().find(|(t, _)| t == topic) {
                Some(entry) => entry.1 = qos,
                None => topics.push((topic.to_string(), qos)),
            }
        }
    }

    fn clear_subscriptions(&self) {
        if let Ok(mut topics) = self.subscribed_topics.lock() {
            topics.clear();
        }
    }

    /// Perform interruptible sleep with shutdown monitoring
    /// Returns true if sleep completed, false if shutdown requested
    async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay: Duration) -> bool {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Shutdown signal received during reconnection delay, stopping");
                    return false;
                }
                true
            }
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Background loop: poll rumqttc until shutdown, then hand the event loop back
    async fn run_event_loop(
        mut event_loop: EventLoop,
        mut ctx: EventLoopContext,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> EventLoop {
        info!(client_id = %ctx.client_id, "Starting MQTT event loop");

        loop {
            tokio::select! {
                biased;

                // Check for shutdown signal first (higher priority)
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!(client_id = %ctx.client_id, "Shutdown signal received, stopping event loop");
                        break;
                    }
                }

                event_result = event_loop.poll() => {
                    match event_result {
                        Ok(event) => {
                            let route = MessageHandler::route_mqtt_event(&event);
                            ctx.process_event_route(route);
                        }
                        Err(e) => {
                            ctx.handle_connection_error(e);

                            let decision = HealthMonitor::should_attempt_reconnection(
                                &mut ctx.backoff,
                                *shutdown_rx.borrow(),
                            );
                            match decision {
                                ReconnectionDecision::Proceed { attempt, delay } => {
                                    info!(
                                        client_id = %ctx.client_id,
                                        attempt,
                                        delay_ms = delay.as_millis() as u64,
                                        "Attempting reconnection after delay"
                                    );
                                    if !Self::interruptible_sleep(shutdown_rx.clone(), delay).await {
                                        break;
                                    }
                                }
                                ReconnectionDecision::AbortShutdownRequested => {
                                    info!("Shutdown signal received, stopping reconnection");
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        }

        info!(client_id = %ctx.client_id, "MQTT event loop stopped");
        event_loop
    }

    /// Poll a parked event loop until our DISCONNECT has been written
    async fn flush_disconnect(event_loop: &mut EventLoop) {
        let flushed = tokio::time::timeout(DISCONNECT_FLUSH_TIMEOUT, async {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => return,
                    Ok(event) => debug!(target: "mqtt_transport", "Draining event before disconnect: {:?}", event),
                    Err(e) => {
                        debug!(target: "mqtt_transport", "Connection closed while disconnecting: {}", e);
                        return;
                    }
                }
            }
        })
        .await;

        if flushed.is_err() {
            warn!("DISCONNECT not written within {:?}", DISCONNECT_FLUSH_TIMEOUT);
        }
    }
}

/// State moved into the background loop task
struct EventLoopContext {
    client_id: String,
    client: AsyncClient,
    callbacks: Arc<dyn TransportCallbacks>,
    backoff: Backoff,
    subscribed_topics: Subscriptions,
    subscribe_origins: SubscribeOrigins,
    /// Packet ids of re-subscriptions, whose SUBACKs nobody waits for
    resubscribe_mids: HashSet<u16>,
    link_up: Arc<AtomicBool>,
}

impl EventLoopContext {
    /// Dispatch one routed event to the callbacks
    fn process_event_route(&mut self, route: EventRoute) {
        match route {
            EventRoute::ConnectionAcknowledged { session_present } => {
                self.link_up.store(true, Ordering::SeqCst);
                self.backoff.reset();
                info!(client_id = %self.client_id, session_present, "CONNACK received");
                self.callbacks
                    .on_connect(ConnectResult::Accepted { session_present });
                if !session_present {
                    self.resubscribe_to_topics();
                }
            }
            EventRoute::ConnectionRefused(result) => {
                warn!(client_id = %self.client_id, ?result, "Connection refused by broker");
                self.callbacks.on_connect(result);
            }
            EventRoute::PublishCompleted { mid } => {
                debug!(target: "mqtt_transport", mid, "Publish acknowledged");
                self.callbacks.on_publish(mid);
            }
            EventRoute::OutgoingPublish { pkid } => {
                self.callbacks.on_publish_sent(pkid);
                if MessageHandler::completes_on_send(pkid) {
                    self.callbacks.on_publish(pkid);
                }
            }
            EventRoute::OutgoingSubscribe { pkid } => match self.next_subscribe_origin() {
                SubscribeOrigin::Caller => self.callbacks.on_subscribe_sent(pkid),
                SubscribeOrigin::Resubscribe => {
                    self.resubscribe_mids.insert(pkid);
                }
            },
            EventRoute::SubscriptionConfirmed { mid, granted } => {
                if self.resubscribe_mids.remove(&mid) {
                    debug!(target: "mqtt_transport", mid, ?granted, "Re-subscription confirmed");
                } else {
                    debug!(target: "mqtt_transport", mid, ?granted, "Subscription confirmed");
                    self.callbacks.on_subscribe(mid, granted);
                }
            }
            EventRoute::MessageReceived(message) => {
                debug!(target: "mqtt_transport", topic = %message.topic, retain = message.retain, "Received MQTT message");
                self.callbacks.on_message(message);
            }
            EventRoute::Disconnected => {
                warn!(client_id = %self.client_id, "Disconnected by broker");
                if self.link_up.swap(false, Ordering::SeqCst) {
                    self.callbacks.on_disconnect(DisconnectReason::ByBroker);
                }
            }
            EventRoute::OutgoingDisconnect => {
                debug!(target: "mqtt_transport", "DISCONNECT sent");
            }
            EventRoute::Infrastructure(event_str) => {
                tracing::trace!(target: "mqtt_transport", "MQTT event: {}", event_str);
            }
        }
    }

    /// Classify a poll error and notify the session at most once per lost link
    fn handle_connection_error(&mut self, err: ConnectionError) {
        match err {
            ConnectionError::ConnectionRefused(code) => {
                self.link_up.store(false, Ordering::SeqCst);
                let result = MessageHandler::connect_result(code);
                warn!(client_id = %self.client_id, ?result, "Connection refused by broker");
                self.callbacks.on_connect(result);
            }
            other => {
                if self.link_up.swap(false, Ordering::SeqCst) {
                    error!(client_id = %self.client_id, "MQTT connection lost: {}", other);
                    self.callbacks
                        .on_disconnect(DisconnectReason::Unexpected(other.to_string()));
                } else {
                    debug!(client_id = %self.client_id, "Connection attempt failed: {}", other);
                }
            }
        }
    }

    fn next_subscribe_origin(&self) -> SubscribeOrigin {
        self.subscribe_origins
            .lock()
            .ok()
            .and_then(|mut origins| origins.pop_front())
            .unwrap_or(SubscribeOrigin::Caller)
    }

    /// Re-issue tracked subscriptions after a clean-session reconnect
    fn resubscribe_to_topics(&self) {
        let topics = self
            .subscribed_topics
            .lock()
            .map(|topics| topics.clone())
            .unwrap_or_default();

        for (topic, qos) in topics {
            // try_subscribe: this task is the one draining the request channel
            if let Err(e) = queue_subscribe(
                &self.client,
                &self.subscribe_origins,
                SubscribeOrigin::Resubscribe,
                &topic,
                qos,
            ) {
                error!("Failed to re-subscribe to {}: {}", topic, e);
            } else {
                debug!(target: "mqtt_transport", "Re-subscribed to: {}", topic);
            }
        }
    }
}

#[async_trait]
impl TransportAdapter for MqttClient {
    fn set_callbacks(&mut self, callbacks: Arc<dyn TransportCallbacks>) {
        self.callbacks = Some(callbacks);
    }

    fn configure_auth(&mut self, username: &str, password: &str) {
        self.params.credentials = Some((username.to_string(), password.to_string()));
    }

    fn configure_tls(&mut self, tls: TlsSettings) -> Result<(), TransportError> {
        tls.ensure_secure()?;
        let ca = load_ca_certificate(&tls)?;

        info!(ca_cert = %tls.ca_cert.display(), "TLS configured");
        self.params.ca_certificate = Some(ca);
        self.params.handshake_timeout = Some(tls.handshake_timeout);
        Ok(())
    }

    async fn connect_async(
        &mut self,
        host: &str,
        port: u16,
        keepalive: Duration,
    ) -> Result<(), TransportError> {
        if self.event_loop_handle.is_some() {
            return Err(TransportError::LoopAlreadyRunning);
        }

        let mqtt_options = configure_mqtt_options(&self.params, host, port, keepalive)?;
        let (client, mut event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);

        if let Some(timeout) = self.params.handshake_timeout {
            let mut network_options = NetworkOptions::new();
            network_options.set_connection_timeout(timeout.as_secs().max(1));
            event_loop.set_network_options(network_options);
        }

        info!(client_id = %self.params.client_id, host, port, "Prepared MQTT connection");
        if let Ok(mut origins) = self.subscribe_origins.lock() {
            origins.clear();
        }
        self.client = Some(client);
        self.event_loop = Some(event_loop);
        self.link_up.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn start_background_loop(&mut self) -> Result<(), TransportError> {
        if self.event_loop_handle.is_some() {
            return Err(TransportError::LoopAlreadyRunning);
        }
        let callbacks = self.callbacks.clone().ok_or_else(|| {
            TransportError::NotConfigured("callbacks must be set before starting".to_string())
        })?;
        let client = self.client.clone().ok_or(TransportError::NotConnected)?;
        let event_loop = self.event_loop.take().ok_or(TransportError::NotConnected)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = EventLoopContext {
            client_id: self.params.client_id.clone(),
            client,
            callbacks,
            backoff: Backoff::new(self.reconnect_policy.clone()),
            subscribed_topics: self.subscribed_topics.clone(),
            subscribe_origins: self.subscribe_origins.clone(),
            resubscribe_mids: HashSet::new(),
            link_up: self.link_up.clone(),
        };

        let span = transport_span!(client_id = %self.params.client_id);
        self.shutdown_tx = Some(shutdown_tx);
        self.event_loop_handle = Some(tokio::spawn(
            Self::run_event_loop(event_loop, ctx, shutdown_rx).instrument(span),
        ));
        Ok(())
    }

    async fn stop_background_loop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }

        let Some(mut handle) = self.event_loop_handle.take() else {
            return;
        };

        // Give the loop time to observe shutdown and hand back the event loop
        match tokio::time::timeout(LOOP_SHUTDOWN_GRACE, &mut handle).await {
            Ok(Ok(event_loop)) => {
                info!("Event loop task shut down gracefully");
                self.event_loop = Some(event_loop);
            }
            Ok(Err(e)) => {
                warn!("Event loop task ended with error: {}", e);
            }
            Err(_) => {
                warn!("Event loop task didn't shut down gracefully, forcing abort");
                handle.abort();
            }
        }
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.stop_background_loop().await;

        let Some(client) = self.client.take() else {
            debug!("Disconnect requested without an active connection");
            return Ok(());
        };
        let event_loop = self.event_loop.take();
        self.clear_subscriptions();

        if !self.link_up.swap(false, Ordering::SeqCst) {
            // Never reached CONNACK: nothing to say goodbye to
            return Ok(());
        }

        client
            .try_disconnect()
            .map_err(|e| TransportError::RequestFailed(e.to_string()))?;

        if let Some(mut event_loop) = event_loop {
            Self::flush_disconnect(&mut event_loop).await;
        }

        info!(client_id = %self.params.client_id, "MQTT client disconnected");
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        let client = self.client.as_ref().ok_or(TransportError::NotConnected)?;

        client
            .try_publish(topic, qos, retain, payload.to_vec())
            .map_err(|e| TransportError::RequestFailed(e.to_string()))?;

        debug!(target: "mqtt_transport", topic, ?qos, retain, "Publish queued");
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        let client = self.client.as_ref().ok_or(TransportError::NotConnected)?;

        queue_subscribe(
            client,
            &self.subscribe_origins,
            SubscribeOrigin::Caller,
            topic,
            qos,
        )
        .map_err(|e| TransportError::RequestFailed(e.to_string()))?;

        self.track_subscription(topic, qos);
        debug!(target: "mqtt_transport", topic, ?qos, "Subscribe queued");
        Ok(())
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        // Signal shutdown to the background task if it's still running
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }

        // Abort the event loop task if it's still running
        if let Some(handle) = self.event_loop_handle.take() {
            handle.abort();
        }

        // No async work in Drop: callers should disconnect() explicitly
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InboundMessage;
    use std::io::Write;
    use std::sync::Mutex;

    const TEST_PEM: &str = "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";

    #[derive(Default)]
    struct RecordingCallbacks {
        events: Mutex<Vec<String>>,
    }

    impl TransportCallbacks for RecordingCallbacks {
        fn on_connect(&self, result: ConnectResult) {
            self.events.lock().unwrap().push(format!("connect {result:?}"));
        }
        fn on_disconnect(&self, reason: DisconnectReason) {
            self.events
                .lock()
                .unwrap()
                .push(format!("disconnect {reason:?}"));
        }
        fn on_publish_sent(&self, mid: u16) {
            self.events.lock().unwrap().push(format!("publish sent {mid}"));
        }
        fn on_publish(&self, mid: u16) {
            self.events.lock().unwrap().push(format!("publish {mid}"));
        }
        fn on_subscribe_sent(&self, mid: u16) {
            self.events
                .lock()
                .unwrap()
                .push(format!("subscribe sent {mid}"));
        }
        fn on_subscribe(&self, mid: u16, _granted: Vec<Option<QoS>>) {
            self.events.lock().unwrap().push(format!("subscribe {mid}"));
        }
        fn on_message(&self, message: InboundMessage) {
            self.events
                .lock()
                .unwrap()
                .push(format!("message {}", message.topic));
        }
    }

    fn ca_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(TEST_PEM.as_bytes()).unwrap();
        file
    }

    /// The event loop is returned so the request channel stays open
    fn test_context(callbacks: Arc<RecordingCallbacks>) -> (EventLoopContext, EventLoop) {
        let options = rumqttc::MqttOptions::new("ctx-test", "localhost", 8883);
        let (client, event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        let ctx = EventLoopContext {
            client_id: "ctx-test".to_string(),
            client,
            callbacks,
            backoff: Backoff::new(ReconnectPolicy::default()),
            subscribed_topics: Arc::new(StdMutex::new(Vec::new())),
            subscribe_origins: Arc::new(StdMutex::new(VecDeque::new())),
            resubscribe_mids: HashSet::new(),
            link_up: Arc::new(AtomicBool::new(false)),
        };
        (ctx, event_loop)
    }

    #[tokio::test]
    async fn test_interruptible_sleep_completes() {
        // Arrange: Create shutdown channel
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        // Act: Sleep without interruption
        let result = MqttClient::interruptible_sleep(shutdown_rx, Duration::from_millis(10)).await;

        // Assert: Should complete normally
        assert!(result, "Sleep should complete without interruption");
    }

    #[tokio::test]
    async fn test_interruptible_sleep_interrupted() {
        // Arrange: Create shutdown channel and signal shutdown
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = shutdown_tx.send(true);
        });

        // Act: Sleep with interruption
        let result = MqttClient::interruptible_sleep(shutdown_rx, Duration::from_secs(10)).await;

        // Assert: Should be interrupted
        assert!(!result, "Sleep should be interrupted by shutdown signal");
    }

    #[test]
    fn test_configure_tls_rejects_insecure_settings() {
        let file = ca_file();
        let mut client = MqttClient::new("tls-test");

        let mut tls = TlsSettings::strict(file.path());
        tls.verify_hostname = false;

        assert!(matches!(
            client.configure_tls(tls),
            Err(TransportError::InsecureTls(_))
        ));
        assert!(client.params.ca_certificate.is_none());
    }

    #[test]
    fn test_configure_tls_missing_ca() {
        let mut client = MqttClient::new("tls-test");
        let result = client.configure_tls(TlsSettings::strict("/nonexistent/ca.pem"));
        assert!(matches!(result, Err(TransportError::CertificateRead { .. })));
    }

    #[tokio::test]
    async fn test_connect_requires_tls() {
        let mut client = MqttClient::new("no-tls");
        let result = client
            .connect_async("localhost", 8883, Duration::from_secs(60))
            .await;
        assert!(matches!(result, Err(TransportError::NotConfigured(_))));
    }

    #[test]
    fn test_client_can_back_a_shared_session() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<crate::session::Session<MqttClient>>();
    }

    #[tokio::test]
    async fn test_operations_fail_without_connection() {
        // Arrange: Create client without connecting
        let mut client = MqttClient::new("not-connected");

        // Act & Assert: Requests fail locally
        assert!(matches!(
            client
                .publish("teste/status", Bytes::from("x"), QoS::AtLeastOnce, false)
                .await,
            Err(TransportError::NotConnected)
        ));
        assert!(matches!(
            client.subscribe("teste/status", QoS::AtLeastOnce).await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_without_connection() {
        // Arrange: Create client that was never connected
        let mut client = MqttClient::new("never-connected");

        // Act: Disconnect twice
        let first = client.disconnect().await;
        let second = client.disconnect().await;

        // Assert: Both are no-ops
        assert!(first.is_ok());
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_start_loop_requires_callbacks_and_connection() {
        let file = ca_file();
        let mut client = MqttClient::new("loop-test");

        assert!(matches!(
            client.start_background_loop(),
            Err(TransportError::NotConfigured(_))
        ));

        client.set_callbacks(Arc::new(RecordingCallbacks::default()));
        assert!(matches!(
            client.start_background_loop(),
            Err(TransportError::NotConnected)
        ));

        client.configure_tls(TlsSettings::strict(file.path())).unwrap();
        client
            .connect_async("127.0.0.1", 1, Duration::from_secs(60))
            .await
            .unwrap();
        client.start_background_loop().unwrap();
        assert!(matches!(
            client.start_background_loop(),
            Err(TransportError::LoopAlreadyRunning)
        ));

        client.stop_background_loop().await;
    }

    #[tokio::test]
    async fn test_unreachable_broker_reports_nothing_and_stops_cleanly() {
        // Arrange: Nothing listens on port 1
        let file = ca_file();
        let callbacks = Arc::new(RecordingCallbacks::default());
        let mut client = MqttClient::new("unreachable");
        client.set_callbacks(callbacks.clone());
        client.configure_tls(TlsSettings::strict(file.path())).unwrap();
        client
            .connect_async("127.0.0.1", 1, Duration::from_secs(60))
            .await
            .unwrap();

        // Act: Run the loop briefly, then stop it mid-backoff
        client.start_background_loop().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        client.stop_background_loop().await;

        // Assert: Failed attempts are not reported and the event loop is parked
        assert!(callbacks.events.lock().unwrap().is_empty());
        assert!(!client.is_loop_running());
        assert!(client.event_loop.is_some());
        assert!(client.disconnect().await.is_ok());
    }

    #[tokio::test]
    async fn test_subscribe_tracks_topics() {
        let file = ca_file();
        let mut client = MqttClient::new("track-test");
        client.configure_tls(TlsSettings::strict(file.path())).unwrap();
        client
            .connect_async("127.0.0.1", 1, Duration::from_secs(60))
            .await
            .unwrap();

        client.subscribe("teste/status", QoS::AtMostOnce).await.unwrap();
        client.subscribe("teste/status", QoS::AtLeastOnce).await.unwrap();
        client.subscribe("teste/other", QoS::ExactlyOnce).await.unwrap();

        assert_eq!(
            client.tracked_subscriptions(),
            vec![
                ("teste/status".to_string(), QoS::AtLeastOnce),
                ("teste/other".to_string(), QoS::ExactlyOnce),
            ]
        );

        // Disconnect forgets them
        client.disconnect().await.unwrap();
        assert!(client.tracked_subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_connack_and_lost_link_callbacks() {
        let callbacks = Arc::new(RecordingCallbacks::default());
        let (mut ctx, _event_loop) = test_context(callbacks.clone());

        ctx.process_event_route(EventRoute::ConnectionAcknowledged {
            session_present: false,
        });
        ctx.process_event_route(EventRoute::OutgoingPublish { pkid: 0 });
        ctx.process_event_route(EventRoute::OutgoingPublish { pkid: 4 });
        ctx.process_event_route(EventRoute::PublishCompleted { mid: 4 });
        ctx.handle_connection_error(ConnectionError::NetworkTimeout);
        // Second failure on the same lost link is not reported again
        ctx.handle_connection_error(ConnectionError::NetworkTimeout);

        let events = callbacks.events.lock().unwrap().clone();
        assert_eq!(events.len(), 6);
        assert!(events[0].starts_with("connect Accepted"));
        assert_eq!(events[1], "publish sent 0");
        assert_eq!(events[2], "publish 0");
        assert_eq!(events[3], "publish sent 4");
        assert_eq!(events[4], "publish 4");
        assert!(events[5].starts_with("disconnect Unexpected"));
    }

    #[tokio::test]
    async fn test_resubscribe_acks_are_not_reported_to_callers() {
        // Arrange: One tracked filter, re-issued on CONNACK
        let callbacks = Arc::new(RecordingCallbacks::default());
        let (mut ctx, _event_loop) = test_context(callbacks.clone());
        ctx.subscribed_topics
            .lock()
            .unwrap()
            .push(("teste/status".to_string(), QoS::AtLeastOnce));
        ctx.process_event_route(EventRoute::ConnectionAcknowledged {
            session_present: false,
        });
        // A caller subscribe queued after the re-subscription
        queue_subscribe(
            &ctx.client,
            &ctx.subscribe_origins,
            SubscribeOrigin::Caller,
            "teste/other",
            QoS::AtMostOnce,
        )
        .unwrap();

        // Act: Both are written and acknowledged in order
        ctx.process_event_route(EventRoute::OutgoingSubscribe { pkid: 1 });
        ctx.process_event_route(EventRoute::OutgoingSubscribe { pkid: 2 });
        ctx.process_event_route(EventRoute::SubscriptionConfirmed {
            mid: 1,
            granted: vec![Some(QoS::AtLeastOnce)],
        });
        ctx.process_event_route(EventRoute::SubscriptionConfirmed {
            mid: 2,
            granted: vec![Some(QoS::AtMostOnce)],
        });

        // Assert: Only the caller's subscribe surfaces
        let events = callbacks.events.lock().unwrap().clone();
        assert_eq!(events.len(), 3);
        assert!(events[0].starts_with("connect Accepted"));
        assert_eq!(events[1], "subscribe sent 2");
        assert_eq!(events[2], "subscribe 2");
    }

    #[tokio::test]
    async fn test_connection_refused_reported_as_connect_result() {
        let callbacks = Arc::new(RecordingCallbacks::default());
        let (mut ctx, _event_loop) = test_context(callbacks.clone());

        ctx.handle_connection_error(ConnectionError::ConnectionRefused(
            rumqttc::ConnectReturnCode::BadUserNamePassword,
        ));

        let events = callbacks.events.lock().unwrap().clone();
        assert_eq!(events.len(), 1);
        assert!(events[0].contains("code: 4"));
    }

    #[tokio::test]
    async fn test_backoff_resets_on_connack() {
        let callbacks = Arc::new(RecordingCallbacks::default());
        let (mut ctx, _event_loop) = test_context(callbacks);

        ctx.backoff.next_delay();
        ctx.backoff.next_delay();
        ctx.process_event_route(EventRoute::ConnectionAcknowledged {
            session_present: false,
        });

        assert_eq!(ctx.backoff.attempt(), 0);
    }
}
