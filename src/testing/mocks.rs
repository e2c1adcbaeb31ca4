//! Mock transport for testing
//!
//! Behaves like a small in-memory broker: publishes are acknowledged,
//! delivered to matching subscriptions and kept when retained. Each failure
//! mode the session has to handle can be switched on with a builder method.
//! A [`MockProbe`] stays with the test after the transport is moved into a
//! session, for inspection and for injecting broker-side events.

use crate::protocol::topics::topic_matches;
use crate::transport::{
    ConnectResult, DisconnectReason, InboundMessage, TlsSettings, TransportAdapter,
    TransportCallbacks, TransportError,
};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::QoS;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// How the mock answers CONNECT
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ConnectBehavior {
    #[default]
    Accept,
    Refuse { code: u8, reason: String },
    /// Never answer, as if the broker were unreachable
    Silent,
}

#[derive(Debug, Clone, Default)]
pub struct MockBehavior {
    pub connect: ConnectBehavior,
    pub fail_tls: bool,
    pub fail_sends: bool,
    pub drop_acks: bool,
    pub refuse_subscriptions: bool,
    /// `None` fires callbacks inside the call; `Some` fires them from a task,
    /// in the order they were raised
    pub callback_delay: Option<Duration>,
}

type Delivery = Box<dyn FnOnce(&dyn TransportCallbacks) + Send>;

/// A publish as seen by the mock broker
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Default)]
struct MockState {
    callbacks: Option<Arc<dyn TransportCallbacks>>,
    username: Option<String>,
    tls: Option<TlsSettings>,
    endpoint: Option<(String, u16, Duration)>,
    connect_attempts: usize,
    loop_running: bool,
    link_up: bool,
    next_mid: u16,
    published: Vec<PublishedMessage>,
    subscriptions: Vec<(String, QoS)>,
    retained: HashMap<String, InboundMessage>,
    tasks: Vec<JoinHandle<()>>,
    courier: Option<mpsc::UnboundedSender<(Instant, Delivery)>>,
    disconnects_sent: usize,
}

impl MockState {
    fn allocate_mid(&mut self) -> u16 {
        self.next_mid = self.next_mid.checked_add(1).unwrap_or(1);
        self.next_mid
    }
}

struct Shared {
    behavior: MockBehavior,
    state: Mutex<MockState>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `event` against the registered callbacks, inline or from a task
    fn dispatch<F>(self: &Arc<Self>, event: F)
    where
        F: FnOnce(&dyn TransportCallbacks) + Send + 'static,
    {
        match self.behavior.callback_delay {
            None => {
                let callbacks = self.state().callbacks.clone();
                if let Some(callbacks) = callbacks {
                    event(callbacks.as_ref());
                }
            }
            Some(delay) => {
                let delivery: Delivery = Box::new(event);
                let _ = self.courier().send((Instant::now() + delay, delivery));
            }
        }
    }

    /// Single delivery task, so delayed callbacks keep their order
    fn courier(self: &Arc<Self>) -> mpsc::UnboundedSender<(Instant, Delivery)> {
        let mut state = self.state();
        if let Some(courier) = &state.courier {
            return courier.clone();
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<(Instant, Delivery)>();
        let shared = self.clone();
        let handle = tokio::spawn(async move {
            while let Some((deliver_at, event)) = rx.recv().await {
                tokio::time::sleep_until(deliver_at).await;
                let callbacks = {
                    let state = shared.state();
                    if !state.loop_running {
                        continue;
                    }
                    state.callbacks.clone()
                };
                if let Some(callbacks) = callbacks {
                    event(callbacks.as_ref());
                }
            }
        });
        state.tasks.push(handle);
        state.courier = Some(tx.clone());
        tx
    }
}

/// In-memory [`TransportAdapter`]
pub struct MockTransport {
    shared: Arc<Shared>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::with_behavior(MockBehavior::default())
    }

    pub fn with_behavior(behavior: MockBehavior) -> Self {
        Self {
            shared: Arc::new(Shared {
                behavior,
                state: Mutex::new(MockState::default()),
            }),
        }
    }

    fn map_behavior(self, f: impl FnOnce(&mut MockBehavior)) -> Self {
        let mut behavior = self.shared.behavior.clone();
        f(&mut behavior);
        Self::with_behavior(behavior)
    }

    pub fn refuse_connect(self, code: u8, reason: &str) -> Self {
        let reason = reason.to_string();
        self.map_behavior(|b| b.connect = ConnectBehavior::Refuse { code, reason })
    }

    pub fn silent(self) -> Self {
        self.map_behavior(|b| b.connect = ConnectBehavior::Silent)
    }

    pub fn fail_tls(self) -> Self {
        self.map_behavior(|b| b.fail_tls = true)
    }

    pub fn fail_sends(self) -> Self {
        self.map_behavior(|b| b.fail_sends = true)
    }

    pub fn drop_acks(self) -> Self {
        self.map_behavior(|b| b.drop_acks = true)
    }

    pub fn refuse_subscriptions(self) -> Self {
        self.map_behavior(|b| b.refuse_subscriptions = true)
    }

    pub fn with_callback_delay(self, delay: Duration) -> Self {
        self.map_behavior(|b| b.callback_delay = Some(delay))
    }

    /// Handle for inspecting the transport after it moves into a session
    pub fn probe(&self) -> MockProbe {
        MockProbe {
            shared: self.shared.clone(),
        }
    }

    fn ensure_linked(&self) -> Result<(), TransportError> {
        if self.shared.behavior.fail_sends {
            return Err(TransportError::RequestFailed(
                "mock request queue closed".to_string(),
            ));
        }
        let state = self.shared.state();
        if state.loop_running && state.link_up {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportAdapter for MockTransport {
    fn set_callbacks(&mut self, callbacks: Arc<dyn TransportCallbacks>) {
        self.shared.state().callbacks = Some(callbacks);
    }

    fn configure_auth(&mut self, username: &str, _password: &str) {
        self.shared.state().username = Some(username.to_string());
    }

    fn configure_tls(&mut self, tls: TlsSettings) -> Result<(), TransportError> {
        tls.ensure_secure()?;
        if self.shared.behavior.fail_tls {
            return Err(TransportError::InvalidCertificate {
                path: tls.ca_cert,
                reason: "mock rejects this bundle".to_string(),
            });
        }
        self.shared.state().tls = Some(tls);
        Ok(())
    }

    async fn connect_async(
        &mut self,
        host: &str,
        port: u16,
        keepalive: Duration,
    ) -> Result<(), TransportError> {
        let mut state = self.shared.state();
        if state.loop_running {
            return Err(TransportError::LoopAlreadyRunning);
        }
        state.connect_attempts += 1;
        state.endpoint = Some((host.to_string(), port, keepalive));
        Ok(())
    }

    fn start_background_loop(&mut self) -> Result<(), TransportError> {
        {
            let mut state = self.shared.state();
            if state.callbacks.is_none() {
                return Err(TransportError::NotConfigured(
                    "callbacks must be set before starting".to_string(),
                ));
            }
            if state.endpoint.is_none() {
                return Err(TransportError::NotConnected);
            }
            state.loop_running = true;
        }

        let result = match &self.shared.behavior.connect {
            ConnectBehavior::Silent => return Ok(()),
            ConnectBehavior::Accept => ConnectResult::Accepted {
                session_present: false,
            },
            ConnectBehavior::Refuse { code, reason } => ConnectResult::Refused {
                code: *code,
                reason: reason.clone(),
            },
        };

        self.shared.state().link_up = result.is_accepted();
        self.shared.dispatch(move |cb| cb.on_connect(result));
        Ok(())
    }

    async fn stop_background_loop(&mut self) {
        let tasks = {
            let mut state = self.shared.state();
            state.loop_running = false;
            state.courier = None;
            std::mem::take(&mut state.tasks)
        };
        for task in tasks {
            task.abort();
        }
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.stop_background_loop().await;
        let mut state = self.shared.state();
        if state.link_up {
            state.disconnects_sent += 1;
        }
        state.link_up = false;
        state.subscriptions.clear();
        state.endpoint = None;
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        self.ensure_linked()?;

        let message = InboundMessage::new(topic, payload.clone(), qos, false);
        let (mid, deliveries) = {
            let mut state = self.shared.state();
            let mid = if qos == QoS::AtMostOnce {
                0
            } else {
                state.allocate_mid()
            };
            state.published.push(PublishedMessage {
                topic: topic.to_string(),
                payload: payload.clone(),
                qos,
                retain,
            });
            if retain {
                if payload.is_empty() {
                    state.retained.remove(topic);
                } else {
                    let mut stored = message.clone();
                    stored.retain = true;
                    state.retained.insert(topic.to_string(), stored);
                }
            }
            let deliveries = state
                .subscriptions
                .iter()
                .filter(|(filter, _)| topic_matches(filter, topic))
                .count();
            (mid, deliveries)
        };

        self.shared.dispatch(move |cb| cb.on_publish_sent(mid));
        if !self.shared.behavior.drop_acks {
            self.shared.dispatch(move |cb| cb.on_publish(mid));
        }
        for _ in 0..deliveries {
            let message = message.clone();
            self.shared.dispatch(move |cb| cb.on_message(message));
        }
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        self.ensure_linked()?;

        let (mid, retained) = {
            let mut state = self.shared.state();
            let mid = state.allocate_mid();
            if self.shared.behavior.refuse_subscriptions {
                (mid, Vec::new())
            } else {
                state.subscriptions.push((topic.to_string(), qos));
                let retained: Vec<InboundMessage> = state
                    .retained
                    .iter()
                    .filter(|(name, _)| topic_matches(topic, name))
                    .map(|(_, message)| message.clone())
                    .collect();
                (mid, retained)
            }
        };

        self.shared.dispatch(move |cb| cb.on_subscribe_sent(mid));
        if !self.shared.behavior.drop_acks {
            let granted = if self.shared.behavior.refuse_subscriptions {
                vec![None]
            } else {
                vec![Some(qos)]
            };
            self.shared.dispatch(move |cb| cb.on_subscribe(mid, granted));
        }
        for message in retained {
            self.shared.dispatch(move |cb| cb.on_message(message));
        }
        Ok(())
    }
}

/// Test-side view of a [`MockTransport`]
#[derive(Clone)]
pub struct MockProbe {
    shared: Arc<Shared>,
}

impl MockProbe {
    pub fn connect_attempts(&self) -> usize {
        self.shared.state().connect_attempts
    }

    pub fn loop_running(&self) -> bool {
        self.shared.state().loop_running
    }

    pub fn link_up(&self) -> bool {
        self.shared.state().link_up
    }

    pub fn username(&self) -> Option<String> {
        self.shared.state().username.clone()
    }

    pub fn tls(&self) -> Option<TlsSettings> {
        self.shared.state().tls.clone()
    }

    /// `(host, port, keepalive)` of the last connect
    pub fn endpoint(&self) -> Option<(String, u16, Duration)> {
        self.shared.state().endpoint.clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.shared.state().published.clone()
    }

    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        self.shared.state().subscriptions.clone()
    }

    pub fn disconnects_sent(&self) -> usize {
        self.shared.state().disconnects_sent
    }

    /// Store a retained message as if another client had published it
    pub fn retain(&self, topic: &str, payload: &str) {
        let message = InboundMessage::new(topic, payload.to_string(), QoS::AtLeastOnce, true);
        self.shared
            .state()
            .retained
            .insert(topic.to_string(), message);
    }

    /// Deliver a message from the broker to the session
    pub fn inject(&self, message: InboundMessage) {
        self.shared.dispatch(move |cb| cb.on_message(message));
    }

    /// Fire a publish completion nobody asked for
    pub fn stray_publish_ack(&self, mid: u16) {
        self.shared.dispatch(move |cb| cb.on_publish(mid));
    }

    /// Lose the network link; the loop keeps running as if retrying
    pub fn drop_link(&self, cause: &str) {
        self.shared.state().link_up = false;
        let cause = cause.to_string();
        self.shared
            .dispatch(move |cb| cb.on_disconnect(DisconnectReason::Unexpected(cause)));
    }

    /// Broker closes the connection
    pub fn broker_disconnect(&self) {
        self.shared.state().link_up = false;
        self.shared
            .dispatch(|cb| cb.on_disconnect(DisconnectReason::ByBroker));
    }

    /// Complete a reconnect after [`drop_link`](Self::drop_link)
    pub fn restore_link(&self) {
        self.shared.state().link_up = true;
        self.shared.dispatch(|cb| {
            cb.on_connect(ConnectResult::Accepted {
                session_present: false,
            })
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counting {
        connects: Mutex<Vec<ConnectResult>>,
        written: Mutex<Vec<u16>>,
        publishes: Mutex<Vec<u16>>,
        messages: Mutex<Vec<InboundMessage>>,
    }

    impl TransportCallbacks for Counting {
        fn on_connect(&self, result: ConnectResult) {
            self.connects.lock().unwrap().push(result);
        }
        fn on_disconnect(&self, _reason: DisconnectReason) {}
        fn on_publish_sent(&self, mid: u16) {
            self.written.lock().unwrap().push(mid);
        }
        fn on_publish(&self, mid: u16) {
            self.publishes.lock().unwrap().push(mid);
        }
        fn on_subscribe_sent(&self, mid: u16) {
            self.written.lock().unwrap().push(mid);
        }
        fn on_subscribe(&self, _mid: u16, _granted: Vec<Option<QoS>>) {}
        fn on_message(&self, message: InboundMessage) {
            self.messages.lock().unwrap().push(message);
        }
    }

    async fn started(transport: &mut MockTransport) -> Arc<Counting> {
        let callbacks = Arc::new(Counting::default());
        transport.set_callbacks(callbacks.clone());
        transport
            .connect_async("broker.local", 8883, Duration::from_secs(60))
            .await
            .unwrap();
        transport.start_background_loop().unwrap();
        callbacks
    }

    #[tokio::test]
    async fn test_mock_accepts_and_acknowledges() {
        // Arrange
        let mut transport = MockTransport::new();
        let callbacks = started(&mut transport).await;

        // Act
        transport
            .publish("teste/status", Bytes::from("hi"), QoS::AtLeastOnce, false)
            .await
            .unwrap();

        // Assert
        assert_eq!(callbacks.connects.lock().unwrap().len(), 1);
        assert_eq!(*callbacks.written.lock().unwrap(), vec![1]);
        assert_eq!(*callbacks.publishes.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_mock_delayed_callbacks_keep_order() {
        let mut transport = MockTransport::new().with_callback_delay(Duration::from_millis(5));
        let callbacks = started(&mut transport).await;

        for _ in 0..3 {
            transport
                .publish("teste/status", Bytes::from("x"), QoS::AtLeastOnce, false)
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(*callbacks.written.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(*callbacks.publishes.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_mock_loopback_and_retained() {
        let mut transport = MockTransport::new();
        let callbacks = started(&mut transport).await;

        transport
            .publish("teste/status", Bytes::from("kept"), QoS::AtMostOnce, true)
            .await
            .unwrap();
        transport
            .subscribe("teste/#", QoS::AtLeastOnce)
            .await
            .unwrap();

        let messages = callbacks.messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].retain);
        assert_eq!(messages[0].payload_str(), "kept");
    }

    #[tokio::test]
    async fn test_mock_refuses_sends_before_connack() {
        let mut transport = MockTransport::new().silent();
        started(&mut transport).await;

        let result = transport
            .publish("teste/status", Bytes::new(), QoS::AtMostOnce, false)
            .await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn test_mock_stop_cancels_delayed_callbacks() {
        let mut transport = MockTransport::new().with_callback_delay(Duration::from_millis(50));
        let callbacks = started(&mut transport).await;

        transport.stop_background_loop().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(callbacks.connects.lock().unwrap().is_empty());
    }
}
