//! Sync session: one display instance's link to the relay.
//!
//! DESIGN
//! ======
//! A `SyncSession` owns a small state machine and the background tasks that
//! drive it:
//! - a connection task per attempt (websocket connect, then a `select!` loop
//!   over outbound text and inbound frames)
//! - at most one reconnect timer, armed whenever a live run loses its socket
//!
//! All mutable run state lives behind one mutex that is never held across an
//! `.await`. Each `connect()`/`disconnect()` bumps a run epoch; tasks carry the
//! epoch they were started under and become no-ops once it is stale.
//!
//! LIFECYCLE
//! =========
//! 1. `connect()` → `Connecting`
//! 2. Socket open → `Connected`, `get_state` is the first frame written
//! 3. Close, error or failed connect → `Disconnected`, reconnect timer armed
//! 4. Timer fires → back to step 2 with a new attempt
//! 5. `disconnect()` (or drop) → `Disconnected`, timer cancelled, socket
//!    closed, nothing reconnects until `connect()` is called again
//!
//! ERROR HANDLING
//! ==============
//! Transport failures never surface as errors. They show up as phase
//! transitions, a connection-change callback and a log line. Undecodable
//! inbound text is logged and dropped. Outbound messages are never queued:
//! `send` returns `false` unless the socket is open.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::{SinkExt, StreamExt};
use protocol::{ClientMessage, ClockChange, GlobalState, ParameterChange, ProtocolError, ServerMessage, WidgetIndex};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionPhase {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Visual connectivity cue (a status dot, a terminal line, ...).
///
/// Told the new state on every phase transition.
pub trait StatusIndicator: Send + Sync {
    fn set_connected(&self, connected: bool);
}

type ClockChangeCallback = Arc<dyn Fn(WidgetIndex) + Send + Sync>;
type ParameterChangeCallback = Arc<dyn Fn(&ParameterChange) + Send + Sync>;
type StateSyncCallback = Arc<dyn Fn(&GlobalState) + Send + Sync>;
type ConnectionChangeCallback = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Default, Clone)]
struct Callbacks {
    clock_change: Option<ClockChangeCallback>,
    parameter_change: Option<ParameterChangeCallback>,
    state_sync: Option<StateSyncCallback>,
    connection_change: Option<ConnectionChangeCallback>,
}

enum Outbound {
    Text(String),
    Close,
}

/// A phase change waiting to be told to the indicator and callback.
#[derive(Debug, Clone, Copy)]
struct Notice {
    connected: bool,
    notify_callback: bool,
}

#[derive(Default)]
struct RunState {
    /// `connect()` was called and `disconnect()` has not been since.
    active: bool,
    epoch: u64,
    /// Present only while the socket is open.
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    connection: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
    /// Queued in the same critical section as the phase change they describe.
    notices: VecDeque<Notice>,
    /// Some thread is delivering `notices`.
    flushing: bool,
}

impl RunState {
    fn is_current(&self, epoch: u64) -> bool {
        self.active && self.epoch == epoch
    }

    fn notify(&mut self, connected: bool, notify_callback: bool) {
        self.notices.push_back(Notice { connected, notify_callback });
    }
}

struct Inner {
    config: SyncConfig,
    run: Mutex<RunState>,
    callbacks: Mutex<Callbacks>,
    indicator: Mutex<Option<Arc<dyn StatusIndicator>>>,
    phase: watch::Sender<ConnectionPhase>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Releases the delivery slot if an indicator or callback panics.
struct FlushGuard<'a>(&'a Inner);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            lock(&self.0.run).flushing = false;
        }
    }
}

// =============================================================================
// SESSION
// =============================================================================

/// Reconnecting sync link to the relay.
///
/// Must be used from within a Tokio runtime. Dropping the session disconnects
/// it.
pub struct SyncSession {
    inner: Arc<Inner>,
}

impl SyncSession {
    #[must_use]
    pub fn new(config: SyncConfig) -> Self {
        let (phase, _) = watch::channel(ConnectionPhase::Disconnected);
        Self {
            inner: Arc::new(Inner {
                config,
                run: Mutex::new(RunState::default()),
                callbacks: Mutex::new(Callbacks::default()),
                indicator: Mutex::new(None),
                phase,
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Start connecting. No-op if the session is already running.
    pub fn connect(&self) {
        {
            let mut run = lock(&self.inner.run);
            if run.active {
                debug!("sync: connect ignored, session already running");
                return;
            }
            run.active = true;
            run.epoch += 1;
            let epoch = run.epoch;
            self.inner.start_attempt(&mut run, epoch);
        }
        info!(url = %self.inner.config.server_url, "sync: connecting");
        self.inner.flush_notices();
    }

    /// Stop syncing: cancel any pending reconnect and close the socket.
    pub fn disconnect(&self) {
        {
            let mut run = lock(&self.inner.run);
            if !run.active {
                return;
            }
            run.active = false;
            run.epoch += 1;
            if let Some(timer) = run.reconnect_timer.take() {
                timer.abort();
            }

            let connection = run.connection.take();
            let outbound = run.outbound.take();
            let was_connected = outbound.is_some();
            // An open socket gets a close frame; an attempt still in flight is cancelled.
            let closing = outbound.is_some_and(|tx| tx.send(Outbound::Close).is_ok());
            if !closing {
                if let Some(connection) = connection {
                    connection.abort();
                }
            }

            self.inner.phase.send_replace(ConnectionPhase::Disconnected);
            run.notify(false, was_connected);
        }
        info!("sync: disconnected");
        self.inner.flush_notices();
    }

    #[must_use]
    pub fn phase(&self) -> ConnectionPhase {
        *self.inner.phase.borrow()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.phase() == ConnectionPhase::Connected
    }

    /// Receiver that observes every phase change from now on.
    #[must_use]
    pub fn watch_phase(&self) -> watch::Receiver<ConnectionPhase> {
        self.inner.phase.subscribe()
    }

    /// Attach a connectivity indicator. It is told the current state at once.
    pub fn set_indicator(&self, indicator: Arc<dyn StatusIndicator>) {
        *lock(&self.inner.indicator) = Some(indicator);
        {
            let mut run = lock(&self.inner.run);
            let connected = *self.inner.phase.borrow() == ConnectionPhase::Connected;
            run.notify(connected, false);
        }
        self.inner.flush_notices();
    }

    // =========================================================================
    // OUTBOUND
    // =========================================================================

    /// Transmit `msg` if the socket is open.
    ///
    /// `true` means the message was handed to the connection task of an open
    /// socket; a message still in flight when the socket fails is lost. Returns
    /// `false` (and drops the message) once the socket is closed or was never
    /// open. Nothing is queued for a later connection.
    pub fn send(&self, msg: &ClientMessage) -> bool {
        let text = match msg.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!(kind = msg.kind(), error = %e, "sync: failed to encode message");
                return false;
            }
        };

        let run = lock(&self.inner.run);
        match &run.outbound {
            Some(tx) => tx.send(Outbound::Text(text)).is_ok(),
            None => {
                debug!(kind = msg.kind(), "sync: not connected, dropping message");
                false
            }
        }
    }

    pub fn broadcast_clock_change(&self, widget_index: WidgetIndex) -> bool {
        self.send(&ClientMessage::ClockChange(ClockChange { widget_index }))
    }

    pub fn broadcast_parameter_change(
        &self,
        widget_index: WidgetIndex,
        parameter: impl Into<String>,
        value: Value,
    ) -> bool {
        self.send(&ClientMessage::ParameterChange(ParameterChange::new(widget_index, parameter, value)))
    }

    // =========================================================================
    // CALLBACKS
    // =========================================================================
    // One slot per event: registering replaces the previous callback.

    pub fn on_clock_change(&self, callback: impl Fn(WidgetIndex) + Send + Sync + 'static) {
        lock(&self.inner.callbacks).clock_change = Some(Arc::new(callback));
    }

    pub fn on_parameter_change(&self, callback: impl Fn(&ParameterChange) + Send + Sync + 'static) {
        lock(&self.inner.callbacks).parameter_change = Some(Arc::new(callback));
    }

    pub fn on_state_sync(&self, callback: impl Fn(&GlobalState) + Send + Sync + 'static) {
        lock(&self.inner.callbacks).state_sync = Some(Arc::new(callback));
    }

    /// Called with `true` when the socket opens and `false` when an attempt
    /// fails or an open socket goes away.
    pub fn on_connection_change(&self, callback: impl Fn(bool) + Send + Sync + 'static) {
        lock(&self.inner.callbacks).connection_change = Some(Arc::new(callback));
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

// =============================================================================
// STATE MACHINE
// =============================================================================

impl Inner {
    fn start_attempt(self: &Arc<Self>, run: &mut RunState, epoch: u64) {
        self.phase.send_replace(ConnectionPhase::Connecting);
        run.notify(false, false);
        run.connection = Some(tokio::spawn(run_connection(Arc::clone(self), epoch)));
    }

    fn mark_connected(&self, epoch: u64, outbound: mpsc::UnboundedSender<Outbound>) -> bool {
        {
            let mut run = lock(&self.run);
            if !run.is_current(epoch) {
                debug!("sync: dropping connection from a stale run");
                return false;
            }
            match ClientMessage::GetState.encode() {
                Ok(text) => {
                    let _ = outbound.send(Outbound::Text(text));
                }
                Err(e) => warn!(error = %e, "sync: failed to encode get_state"),
            }
            run.outbound = Some(outbound);
            self.phase.send_replace(ConnectionPhase::Connected);
            run.notify(true, true);
        }
        info!(url = %self.config.server_url, "sync: connected");
        self.flush_notices();
        true
    }

    fn connection_lost(self: &Arc<Self>, epoch: u64) {
        {
            let mut run = lock(&self.run);
            if !run.is_current(epoch) {
                return;
            }
            run.outbound = None;
            run.connection = None;
            self.phase.send_replace(ConnectionPhase::Disconnected);
            run.notify(false, true);
            self.schedule_reconnect(&mut run, epoch);
        }
        info!(retry_in = ?self.config.reconnect_interval, "sync: connection lost, reconnect scheduled");
        self.flush_notices();
    }

    fn schedule_reconnect(self: &Arc<Self>, run: &mut RunState, epoch: u64) {
        if let Some(timer) = run.reconnect_timer.take() {
            timer.abort();
        }
        let inner = Arc::clone(self);
        let delay = self.config.reconnect_interval;
        run.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.reconnect(epoch);
        }));
    }

    fn reconnect(self: &Arc<Self>, epoch: u64) {
        {
            let mut run = lock(&self.run);
            if !run.is_current(epoch) {
                return;
            }
            run.reconnect_timer = None;
            self.start_attempt(&mut run, epoch);
        }
        info!(url = %self.config.server_url, "sync: reconnecting");
        self.flush_notices();
    }

    /// Deliver queued notices in the order the phase changes happened.
    ///
    /// Only one thread delivers at a time; a caller that finds delivery in
    /// progress leaves its notice for that thread. Never called with `run`
    /// held, so the indicator and callback may call back into the session.
    fn flush_notices(&self) {
        {
            let mut run = lock(&self.run);
            if run.flushing {
                return;
            }
            run.flushing = true;
        }
        let _guard = FlushGuard(self);
        loop {
            let notice = {
                let mut run = lock(&self.run);
                let Some(notice) = run.notices.pop_front() else {
                    run.flushing = false;
                    return;
                };
                notice
            };
            self.deliver(notice);
        }
    }

    fn deliver(&self, notice: Notice) {
        let indicator = lock(&self.indicator).clone();
        if let Some(indicator) = indicator {
            indicator.set_connected(notice.connected);
        }
        if notice.notify_callback {
            let callback = lock(&self.callbacks).connection_change.clone();
            if let Some(callback) = callback {
                callback(notice.connected);
            }
        }
    }

    fn dispatch(&self, text: &str) {
        let msg = match ServerMessage::decode(text) {
            Ok(msg) => msg,
            Err(ProtocolError::UnknownType(kind)) => {
                warn!(%kind, "sync: ignoring unknown message type");
                return;
            }
            Err(e) => {
                warn!(error = %e, "sync: dropping malformed message");
                return;
            }
        };

        let callbacks = lock(&self.callbacks).clone();
        match msg {
            ServerMessage::StateSync(state) => {
                debug!(widget = state.active_widget_index, "sync: state snapshot received");
                if let Some(callback) = callbacks.state_sync {
                    callback(&state);
                }
            }
            ServerMessage::ClockChange(ClockChange { widget_index }) => {
                if let Some(callback) = callbacks.clock_change {
                    callback(widget_index);
                }
            }
            ServerMessage::ParameterChange(change) => {
                if let Some(callback) = callbacks.parameter_change {
                    callback(&change);
                }
            }
        }
    }
}

// =============================================================================
// CONNECTION TASK
// =============================================================================

async fn run_connection(inner: Arc<Inner>, epoch: u64) {
    let url = inner.config.server_url.clone();
    let stream = match connect_async(url.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            warn!(%url, error = %e, "sync: connect failed");
            inner.connection_lost(epoch);
            return;
        }
    };

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    if !inner.mark_connected(epoch, outbound_tx) {
        return;
    }

    let (mut write, mut read) = stream.split();
    let closed_locally = loop {
        tokio::select! {
            outbound = outbound_rx.recv() => match outbound {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        warn!(error = %e, "sync: send failed");
                        break false;
                    }
                }
                Some(Outbound::Close) | None => {
                    if let Err(e) = write.send(Message::Close(None)).await {
                        debug!(error = %e, "sync: close frame not delivered");
                    }
                    break true;
                }
            },
            inbound = read.next() => match inbound {
                Some(Ok(Message::Text(text))) => inner.dispatch(text.as_str()),
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => inner.dispatch(text),
                    Err(_) => warn!(len = bytes.len(), "sync: dropping non-utf8 binary message"),
                },
                Some(Ok(Message::Close(_))) | None => break false,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "sync: transport error");
                    break false;
                }
            },
        }
    };

    if !closed_locally {
        // From here `send` reports failure even before the run state catches up.
        outbound_rx.close();
        inner.connection_lost(epoch);
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
