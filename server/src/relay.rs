//! Relay core: session registry, state mutation and broadcast-to-others.
//!
//! DESIGN
//! ======
//! `Relay` owns the `StateStore` and the live session set. Its handlers are
//! synchronous `&mut self` methods, and a single task (`spawn_relay`) drains
//! one queue of `RelayEvent`s pushed by the per-socket websocket tasks. Every
//! mutation is therefore applied in queue order without any lock: the last
//! `parameter_change` the relay processes for a key is the one that sticks.
//!
//! Message handlers return an `Outcome`; the dispatch layer owns delivery
//! (reply to sender, or broadcast to every other session).
//!
//! LIFECYCLE
//! =========
//! 1. `Connected` → register session, queue a full `state_sync` snapshot
//! 2. `Inbound` → decode → handler → apply `Outcome`
//! 3. `Disconnected` → deregister; state is left as the session wrote it
//!
//! ERROR HANDLING
//! ==============
//! Undecodable or unknown messages are logged and dropped; the sender gets no
//! reply and stays connected. Delivery never blocks: a peer whose outbound
//! channel is full or closed is evicted, which makes its socket task close the
//! connection. The evicted client reconnects and starts over from a snapshot.

use std::collections::HashMap;

use protocol::{ClientMessage, ClockChange, ProtocolError, ServerMessage};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::StateStore;

/// Opaque per-connection identifier. Never sent on the wire.
pub type SessionId = Uuid;

/// Capacity of each session's outbound queue.
pub const SESSION_CHANNEL_CAPACITY: usize = 256;

/// Capacity of the relay's inbound event queue.
pub const RELAY_QUEUE_CAPACITY: usize = 1024;

// =============================================================================
// EVENTS
// =============================================================================

/// Everything the relay task reacts to.
#[derive(Debug)]
pub enum RelayEvent {
    Connected { session: SessionId, outbound: mpsc::Sender<String> },
    Inbound { session: SessionId, text: String },
    Disconnected { session: SessionId },
}

// =============================================================================
// OUTCOME
// =============================================================================

/// Result of a message handler. Handlers never send directly.
#[derive(Debug)]
enum Outcome {
    /// Send to the originating session only.
    Reply(ServerMessage),
    /// Send to every session except the originator.
    BroadcastExcludeSender(ServerMessage),
}

// =============================================================================
// RELAY
// =============================================================================

pub struct Relay {
    store: StateStore,
    sessions: HashMap<SessionId, mpsc::Sender<String>>,
}

impl Relay {
    #[must_use]
    pub fn new(store: StateStore) -> Self {
        Self { store, sessions: HashMap::new() }
    }

    #[must_use]
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn has_session(&self, session: SessionId) -> bool {
        self.sessions.contains_key(&session)
    }

    pub fn handle(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Connected { session, outbound } => self.on_connect(session, outbound),
            RelayEvent::Inbound { session, text } => self.on_message(session, &text),
            RelayEvent::Disconnected { session } => self.on_disconnect(session),
        }
    }

    /// Register a session and queue its initial snapshot.
    ///
    /// The snapshot is the first item in the session's channel, so it is
    /// always the first message the session receives.
    pub fn on_connect(&mut self, session: SessionId, outbound: mpsc::Sender<String>) {
        self.sessions.insert(session, outbound);
        info!(%session, clients = self.sessions.len(), "relay: session connected");

        let snapshot = ServerMessage::StateSync(self.store.snapshot());
        self.send_to(session, &snapshot);
    }

    pub fn on_disconnect(&mut self, session: SessionId) {
        if self.sessions.remove(&session).is_some() {
            info!(%session, clients = self.sessions.len(), "relay: session disconnected");
        }
    }

    /// Decode and apply one inbound text message.
    pub fn on_message(&mut self, session: SessionId, text: &str) {
        if !self.sessions.contains_key(&session) {
            debug!(%session, "relay: dropping message from unregistered session");
            return;
        }

        let msg = match ClientMessage::decode(text) {
            Ok(msg) => msg,
            Err(ProtocolError::UnknownType(kind)) => {
                warn!(%session, %kind, "relay: ignoring unknown message type");
                return;
            }
            Err(e) => {
                warn!(%session, error = %e, "relay: dropping malformed message");
                return;
            }
        };

        match self.apply(msg) {
            Outcome::Reply(reply) => self.send_to(session, &reply),
            Outcome::BroadcastExcludeSender(msg) => self.broadcast_except(session, &msg),
        }
    }

    fn apply(&mut self, msg: ClientMessage) -> Outcome {
        match msg {
            ClientMessage::GetState => Outcome::Reply(ServerMessage::StateSync(self.store.snapshot())),
            ClientMessage::ClockChange(ClockChange { widget_index }) => {
                self.store.set_active_widget(widget_index);
                info!(widget = widget_index, "relay: clock changed");
                Outcome::BroadcastExcludeSender(ServerMessage::ClockChange(ClockChange { widget_index }))
            }
            ClientMessage::ParameterChange(change) => {
                self.store
                    .set_parameter(change.widget_index, change.parameter.clone(), change.value.clone());
                info!(
                    widget = change.widget_index,
                    parameter = %change.parameter,
                    value = %change.value,
                    "relay: parameter changed"
                );
                Outcome::BroadcastExcludeSender(ServerMessage::ParameterChange(change))
            }
        }
    }

    // =========================================================================
    // DELIVERY
    // =========================================================================

    fn send_to(&mut self, session: SessionId, msg: &ServerMessage) {
        let Some(text) = encode(msg) else {
            return;
        };
        let Some(tx) = self.sessions.get(&session) else {
            return;
        };
        if let Err(e) = tx.try_send(text) {
            self.evict(session, &e);
        }
    }

    fn broadcast_except(&mut self, sender: SessionId, msg: &ServerMessage) {
        let Some(text) = encode(msg) else {
            return;
        };

        let mut failed = Vec::new();
        for (session, tx) in &self.sessions {
            if *session == sender {
                continue;
            }
            if let Err(e) = tx.try_send(text.clone()) {
                failed.push((*session, e));
            }
        }
        for (session, e) in failed {
            self.evict(session, &e);
        }
    }

    fn evict(&mut self, session: SessionId, err: &TrySendError<String>) {
        let reason = match err {
            TrySendError::Full(_) => "outbound queue full",
            TrySendError::Closed(_) => "outbound queue closed",
        };
        self.sessions.remove(&session);
        warn!(%session, reason, clients = self.sessions.len(), "relay: evicting session");
    }
}

fn encode(msg: &ServerMessage) -> Option<String> {
    match msg.encode() {
        Ok(text) => Some(text),
        Err(e) => {
            warn!(kind = msg.kind(), error = %e, "relay: failed to encode message");
            None
        }
    }
}

// =============================================================================
// TASK
// =============================================================================

/// Cheap handle the websocket tasks use to feed the relay.
#[derive(Clone)]
pub struct RelayHandle {
    tx: mpsc::Sender<RelayEvent>,
}

impl RelayHandle {
    /// Returns `false` if the relay task has stopped.
    pub async fn connect(&self, session: SessionId, outbound: mpsc::Sender<String>) -> bool {
        self.tx.send(RelayEvent::Connected { session, outbound }).await.is_ok()
    }

    /// Returns `false` if the relay task has stopped.
    pub async fn inbound(&self, session: SessionId, text: String) -> bool {
        self.tx.send(RelayEvent::Inbound { session, text }).await.is_ok()
    }

    pub async fn disconnect(&self, session: SessionId) {
        if self.tx.send(RelayEvent::Disconnected { session }).await.is_err() {
            debug!(%session, "relay: task stopped before disconnect");
        }
    }
}

/// Run `relay` on its own task. The task ends once every handle is dropped
/// and hands the relay back, which lets tests inspect the final state.
#[must_use]
pub fn spawn_relay(mut relay: Relay) -> (RelayHandle, JoinHandle<Relay>) {
    let (tx, mut rx) = mpsc::channel(RELAY_QUEUE_CAPACITY);
    let task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            relay.handle(event);
        }
        relay
    });
    (RelayHandle { tx }, task)
}

#[cfg(test)]
#[path = "relay_test.rs"]
mod tests;
