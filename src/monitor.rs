#![expect(
    clippy::module_name_repetitions,
    reason = "Monitor types expose their domain in the name for clarity"
)]

//! Connection-state monitor.
//!
//! Ingests low-level transport lifecycle signals and derives the small
//! set of user-facing [`ConnectionState`] values. State mutation is
//! serialized internally, and every change is delivered to subscribers
//! exactly once, in the order the triggering signals occurred.
//!
//! Entering [`ConnectionState::ConnectionDisrupted`] is the single
//! trigger the transport uses to fan out reconnection. A deliberate
//! teardown (signalled via [`ConnectionStateMonitor::closing`] before
//! [`ConnectionStateMonitor::closed`]) lands in
//! [`ConnectionState::Disconnected`] instead and never reconnects.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Broadcast capacity for state-change delivery.
const STATE_CHANGE_CAPACITY: usize = 64;

/// How long a missed keepalive may go unrecovered before the connection
/// is considered disrupted.
pub const DEFAULT_DISRUPTION_WINDOW: Duration = Duration::from_secs(5);

/// High-level connection state exposed to callers.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum ConnectionState {
    /// A connection attempt (handshake) is in flight
    Connecting,
    /// The connection is established and serving subscriptions
    Connected,
    /// The connection was lost unexpectedly; reconnection is warranted
    ConnectionDisrupted,
    /// No connection, and none is being attempted
    Disconnected,
}

struct MonitorState {
    current: ConnectionState,
    /// A deliberate teardown is in progress; the next `closed()` is clean
    closing: bool,
    /// Pending alert-to-disruption window after a missed keepalive
    keepalive_watch: Option<JoinHandle<()>>,
}

struct MonitorShared {
    state: Mutex<MonitorState>,
    changes_tx: broadcast::Sender<ConnectionState>,
    current_tx: watch::Sender<ConnectionState>,
    disruption_window: Duration,
}

/// Event-driven state machine deriving [`ConnectionState`] from
/// transport lifecycle signals.
#[derive(Clone)]
pub struct ConnectionStateMonitor {
    inner: Arc<MonitorShared>,
}

impl Default for ConnectionStateMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateMonitor {
    #[must_use]
    pub fn new() -> Self {
        Self::with_disruption_window(DEFAULT_DISRUPTION_WINDOW)
    }

    /// Create a monitor with a custom alert-to-disruption window.
    #[must_use]
    pub fn with_disruption_window(disruption_window: Duration) -> Self {
        let (changes_tx, _) = broadcast::channel(STATE_CHANGE_CAPACITY);
        let (current_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(MonitorShared {
                state: Mutex::new(MonitorState {
                    current: ConnectionState::Disconnected,
                    closing: false,
                    keepalive_watch: None,
                }),
                changes_tx,
                current_tx,
                disruption_window,
            }),
        }
    }

    /// The current connection state.
    #[must_use]
    pub fn current(&self) -> ConnectionState {
        self.lock().current
    }

    /// Subscribe to state changes. Every change is delivered once, in
    /// order, to each receiver that keeps up with the channel.
    #[must_use]
    pub fn changes(&self) -> broadcast::Receiver<ConnectionState> {
        self.inner.changes_tx.subscribe()
    }

    /// Watch the current state without consuming individual changes.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.inner.current_tx.subscribe()
    }

    /// A connection attempt is starting.
    pub fn opening_connection(&self) {
        let mut state = self.lock();
        state.closing = false;
        Self::cancel_keepalive_watch(&mut state);
        Self::transition(&self.inner, &mut state, ConnectionState::Connecting);
    }

    /// The handshake completed and a subscription was acknowledged.
    pub fn connection_established(&self) {
        let mut state = self.lock();
        Self::transition(&self.inner, &mut state, ConnectionState::Connected);
    }

    /// A keepalive frame arrived; any pending missed-keepalive watch is
    /// cleared.
    pub fn keep_alive(&self) {
        let mut state = self.lock();
        Self::cancel_keepalive_watch(&mut state);
    }

    /// A keepalive frame is overdue. If no keepalive arrives within the
    /// disruption window, the state becomes
    /// [`ConnectionState::ConnectionDisrupted`].
    pub fn keep_alive_missed(&self) {
        let mut state = self.lock();
        if state
            .keepalive_watch
            .as_ref()
            .is_some_and(|watch| !watch.is_finished())
        {
            return;
        }
        tracing::debug!("keepalive missed, watching for recovery");
        let monitor = self.clone();
        state.keepalive_watch = Some(tokio::spawn(async move {
            sleep(monitor.inner.disruption_window).await;
            let mut state = monitor.lock();
            state.keepalive_watch = None;
            Self::transition(
                &monitor.inner,
                &mut state,
                ConnectionState::ConnectionDisrupted,
            );
        }));
    }

    /// A deliberate teardown is beginning. Transitional: the public
    /// state does not change until [`Self::closed`].
    pub fn closing(&self) {
        self.lock().closing = true;
    }

    /// The socket closed. A close that follows [`Self::closing`] is
    /// clean and lands in [`ConnectionState::Disconnected`]; an
    /// unexpected close while serving lands in
    /// [`ConnectionState::ConnectionDisrupted`] so the transport
    /// reconnects.
    pub fn closed(&self) {
        let mut state = self.lock();
        Self::cancel_keepalive_watch(&mut state);
        let next = if state.closing {
            state.closing = false;
            ConnectionState::Disconnected
        } else if state.current == ConnectionState::Disconnected {
            return;
        } else {
            ConnectionState::ConnectionDisrupted
        };
        Self::transition(&self.inner, &mut state, next);
    }

    /// A handshake never completed.
    pub fn connection_failed(&self) {
        let mut state = self.lock();
        state.closing = false;
        Self::cancel_keepalive_watch(&mut state);
        Self::transition(&self.inner, &mut state, ConnectionState::Disconnected);
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        // Recoverable: MonitorState has no inconsistent intermediate state.
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel_keepalive_watch(state: &mut MonitorState) {
        if let Some(watch) = state.keepalive_watch.take() {
            watch.abort();
        }
    }

    fn transition(shared: &MonitorShared, state: &mut MonitorState, next: ConnectionState) {
        if state.current == next {
            return;
        }
        tracing::debug!(from = %state.current, to = %next, "connection state change");
        state.current = next;
        _ = shared.current_tx.send(next);
        _ = shared.changes_tx.send(next);
    }
}
