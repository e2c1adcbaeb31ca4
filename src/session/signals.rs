//! Level-triggered signals bridging transport callbacks to awaiting callers
//!
//! Callbacks run on the transport's background task and may fire at any time,
//! including before the caller starts waiting or while the caller is still
//! inside the send. A [`Signal`] is a level: once set it stays set until the
//! session resets it, so a set that lands first is still observed by the wait.

use crate::transport::mqtt::{ConnectionEvent, ConnectionState, HealthMonitor};
use crate::transport::{ConnectResult, InboundMessage};
use rumqttc::QoS;
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Lock a mutex, recovering the data if a callback panicked while holding it
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A resettable level signal with a timed wait
///
/// `set` and `reset` never block and may be called from any thread. Repeated
/// sets coalesce.
#[derive(Debug)]
pub struct Signal {
    level: watch::Sender<bool>,
}

impl Signal {
    pub fn new() -> Self {
        let (level, _) = watch::channel(false);
        Self { level }
    }

    /// Raise the level and wake every waiter
    pub fn set(&self) {
        self.level.send_replace(true);
    }

    pub fn reset(&self) {
        self.level.send_replace(false);
    }

    pub fn is_set(&self) -> bool {
        *self.level.borrow()
    }

    /// Wait until the level is set; `false` on timeout
    ///
    /// Returns immediately when the level is already set.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let mut rx = self.level.subscribe();
        // The borrowed value must be released before `rx` goes out of scope
        let observed = tokio::time::timeout(timeout, rx.wait_for(|set| *set))
            .await
            .is_ok_and(|changed| changed.is_ok());
        observed
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

/// Completion record for an in-flight publish or subscribe
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingAck {
    /// Packet id the request was written to the network with
    pub mid: Option<u16>,
    /// Granted QoS per filter (subscribe only)
    pub granted: Vec<Option<QoS>>,
    /// The broker's completion for `mid` arrived
    pub completed: bool,
    token: u64,
    /// Earlier requests still queued ahead of this one
    ahead: usize,
}

/// Pairs network writes and completions with the waiting request
///
/// The transport writes requests in the order they were handed over, so the
/// request waiting here is the first write after every request queued before
/// it. Only a completion carrying that write's packet id completes it; any
/// other completion belongs to an abandoned request and is ignored.
#[derive(Debug, Default)]
pub struct RequestTracker {
    pending: Option<PendingAck>,
    next_token: u64,
    /// Handed to the transport but not yet written
    queued: usize,
    /// Retransmitted after a reconnect with their original packet id
    retransmitted: bool,
    /// Written and not yet completed
    in_flight: HashSet<u16>,
}

impl RequestTracker {
    /// Tracker for requests the transport replays after a reconnect (publishes)
    pub fn retransmitting() -> Self {
        Self {
            retransmitted: true,
            ..Self::default()
        }
    }

    /// Open a record for the next request; returns its token
    pub fn begin(&mut self) -> u64 {
        self.next_token += 1;
        self.pending = Some(PendingAck {
            token: self.next_token,
            ahead: self.queued,
            ..PendingAck::default()
        });
        self.queued += 1;
        self.next_token
    }

    /// The request never made it into the transport's queue
    pub fn abandon_unsent(&mut self, token: u64) {
        self.queued = self.queued.saturating_sub(1);
        self.finish(token);
    }

    /// A request was written with packet id `mid`; `true` if it is the pending one
    pub fn sent(&mut self, mid: u16) -> bool {
        // Packet id 0 (QoS 0) is never acknowledged, so never repeated
        if self.retransmitted && mid != 0 && !self.in_flight.insert(mid) {
            return false;
        }
        self.queued = self.queued.saturating_sub(1);

        match self.pending.as_mut() {
            Some(ack) if ack.mid.is_none() => {
                if ack.ahead == 0 {
                    ack.mid = Some(mid);
                    true
                } else {
                    ack.ahead -= 1;
                    false
                }
            }
            _ => false,
        }
    }

    /// Completion for `mid`; `true` if it completed the pending request
    pub fn complete(&mut self, mid: u16, granted: Vec<Option<QoS>>) -> bool {
        self.in_flight.remove(&mid);
        match self.pending.as_mut() {
            Some(ack) if ack.mid == Some(mid) && !ack.completed => {
                ack.completed = true;
                ack.granted = granted;
                true
            }
            _ => false,
        }
    }

    /// Take the record opened under `token`, unless a later request replaced it
    pub fn finish(&mut self, token: u64) -> Option<PendingAck> {
        if self.pending.as_ref().is_some_and(|ack| ack.token == token) {
            self.pending.take()
        } else {
            None
        }
    }

    /// Forget every request; used when a fresh connection replaces the queue
    pub fn clear(&mut self) {
        self.pending = None;
        self.queued = 0;
        self.in_flight.clear();
    }
}

/// At most one publish and one subscribe in flight
#[derive(Debug)]
pub struct PendingOperations {
    pub publish: RequestTracker,
    pub subscribe: RequestTracker,
}

impl Default for PendingOperations {
    fn default() -> Self {
        Self {
            publish: RequestTracker::retransmitting(),
            subscribe: RequestTracker::default(),
        }
    }
}

/// Timestamps behind the session's health metrics
#[derive(Debug, Default)]
struct LinkHistory {
    connect_time: Option<Instant>,
    last_message_time: Option<Instant>,
    reconnect_count: u32,
    ever_connected: bool,
}

/// Shared state written by callbacks and read by the session
#[derive(Debug)]
pub struct EventSynchronizer {
    pub connected: Signal,
    pub subscribed: Signal,
    pub published: Signal,
    pub message: Signal,
    state: watch::Sender<ConnectionState>,
    connect_result: Mutex<Option<ConnectResult>>,
    pending: Mutex<PendingOperations>,
    last_message: Mutex<Option<InboundMessage>>,
    history: Mutex<LinkHistory>,
}

impl EventSynchronizer {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connected: Signal::new(),
            subscribed: Signal::new(),
            published: Signal::new(),
            message: Signal::new(),
            state,
            connect_result: Mutex::new(None),
            pending: Mutex::new(PendingOperations::default()),
            last_message: Mutex::new(None),
            history: Mutex::new(LinkHistory::default()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Apply a connection event atomically; returns `(from, to)`
    pub fn apply(&self, event: &ConnectionEvent) -> (ConnectionState, ConnectionState) {
        let mut transition = (ConnectionState::Disconnected, ConnectionState::Disconnected);
        self.state.send_modify(|state| {
            let next = HealthMonitor::determine_next_state(*state, event);
            transition = (*state, next);
            *state = next;
        });

        let (from, to) = transition;
        let mut history = lock(&self.history);
        if to == ConnectionState::Connected && from != ConnectionState::Connected {
            if history.ever_connected && from == ConnectionState::Disconnected {
                history.reconnect_count += 1;
            }
            history.ever_connected = true;
            history.connect_time = Some(Instant::now());
        } else if to != ConnectionState::Connected {
            history.connect_time = None;
        }
        transition
    }

    // Connect

    /// Forget the previous handshake and its requests before a new one
    pub fn begin_connect(&self) {
        self.connected.reset();
        *lock(&self.connect_result) = None;
        let mut pending = lock(&self.pending);
        pending.publish.clear();
        pending.subscribe.clear();
    }

    /// Store the handshake result, then raise `connected`
    pub fn record_connect(&self, result: ConnectResult) {
        *lock(&self.connect_result) = Some(result);
        self.connected.set();
    }

    pub fn connect_result(&self) -> Option<ConnectResult> {
        lock(&self.connect_result).clone()
    }

    // Publish

    /// Reset `published` and `message` and open a pending publish record
    pub fn begin_publish(&self) -> u64 {
        self.published.reset();
        self.message.reset();
        lock(&self.pending).publish.begin()
    }

    pub fn abandon_publish(&self, token: u64) {
        lock(&self.pending).publish.abandon_unsent(token);
    }

    /// A publish was written with packet id `mid`
    pub fn publish_sent(&self, mid: u16) -> bool {
        lock(&self.pending).publish.sent(mid)
    }

    /// Record a publish completion; raises `published` only for the pending publish
    pub fn complete_publish(&self, mid: u16) -> bool {
        let matched = lock(&self.pending).publish.complete(mid, Vec::new());
        if matched {
            self.published.set();
        }
        matched
    }

    /// Consume the pending publish record opened under `token`
    pub fn finish_publish(&self, token: u64) -> Option<PendingAck> {
        lock(&self.pending).publish.finish(token)
    }

    // Subscribe

    /// Reset `subscribed` and `message` and open a pending subscribe record
    pub fn begin_subscribe(&self) -> u64 {
        self.subscribed.reset();
        self.message.reset();
        lock(&self.pending).subscribe.begin()
    }

    pub fn abandon_subscribe(&self, token: u64) {
        lock(&self.pending).subscribe.abandon_unsent(token);
    }

    pub fn subscribe_sent(&self, mid: u16) -> bool {
        lock(&self.pending).subscribe.sent(mid)
    }

    /// Record a SUBACK; raises `subscribed` only for the pending subscribe
    pub fn complete_subscribe(&self, mid: u16, granted: Vec<Option<QoS>>) -> bool {
        let matched = lock(&self.pending).subscribe.complete(mid, granted);
        if matched {
            self.subscribed.set();
        }
        matched
    }

    pub fn finish_subscribe(&self, token: u64) -> Option<PendingAck> {
        lock(&self.pending).subscribe.finish(token)
    }

    // Inbound messages

    /// Overwrite the last observed message, then raise `message`
    pub fn record_message(&self, message: InboundMessage) {
        lock(&self.history).last_message_time = Some(Instant::now());
        *lock(&self.last_message) = Some(message);
        self.message.set();
    }

    pub fn last_message(&self) -> Option<InboundMessage> {
        lock(&self.last_message).clone()
    }

    /// `(connect_time, last_message_time, reconnect_count)`
    pub fn link_history(&self) -> (Option<Instant>, Option<Instant>, u32) {
        let history = lock(&self.history);
        (
            history.connect_time,
            history.last_message_time,
            history.reconnect_count,
        )
    }
}

impl Default for EventSynchronizer {
    fn default() -> Self {
        Self::new()
    }
}
