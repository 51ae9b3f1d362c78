use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::config::Config;
use super::connection::{Command, ConnectionTask};
use super::error::RealtimeError;
use super::protocol::SubscriptionId;
use crate::Result;
use crate::auth::AuthConfig;
use crate::error::Error;
use crate::monitor::{ConnectionState, ConnectionStateMonitor};

/// Broadcast capacity for transport events.
const EVENT_CAPACITY: usize = 256;

/// One logical subscription request.
#[non_exhaustive]
#[derive(Clone, Debug, bon::Builder)]
pub struct SubscribeRequest {
    /// GraphQL subscription document
    #[builder(into)]
    pub query: String,
    /// Operation variables, re-sent verbatim on every (re)connection
    pub variables: Option<Value>,
    /// Extra headers merged over the strategy-derived authorization
    /// headers; an explicit `Authorization` entry enables custom (Lambda)
    /// authorizers
    #[builder(default)]
    pub additional_headers: BTreeMap<String, String>,
    /// Per-subscription auth override; the client default applies when
    /// unset
    pub auth: Option<AuthConfig>,
}

/// Events published to external observers. Informational; not required
/// for correctness.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The monitor derived a new connection state
    ConnectionStateChange(ConnectionState),
    /// The gateway acknowledged a subscription start
    SubscriptionAck {
        /// The acknowledged subscription
        id: SubscriptionId,
    },
    /// A subscription terminated with an error
    SubscriptionError {
        /// The failed subscription
        id: SubscriptionId,
    },
}

struct ClientInner {
    commands: mpsc::UnboundedSender<Command>,
    monitor: ConnectionStateMonitor,
    events_tx: broadcast::Sender<TransportEvent>,
    cancel: CancellationToken,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Realtime subscription client.
///
/// Owns one multiplexed WebSocket connection to the configured gateway.
/// Cloning is cheap and clones share the connection; the connection task
/// shuts down when the last clone is dropped.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Create a client and spawn its connection task. No socket is
    /// opened until the first subscription.
    pub fn new(config: Config) -> Result<Self> {
        let endpoint = Url::parse(&config.endpoint)?;
        if endpoint.host_str().is_none() {
            return Err(url::ParseError::EmptyHost.into());
        }

        let monitor = ConnectionStateMonitor::with_disruption_window(config.disruption_window);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let task = ConnectionTask::new(
            config,
            endpoint,
            commands_rx,
            monitor.clone(),
            events_tx.clone(),
            cancel.clone(),
        );
        tokio::spawn(task.run());

        Ok(Self {
            inner: Arc::new(ClientInner {
                commands: commands_tx,
                monitor,
                events_tx,
                cancel,
            }),
        })
    }

    /// Register a logical subscription and return its payload stream.
    ///
    /// Performs the connection handshake if no socket is live; concurrent
    /// calls share one handshake attempt. Resolves once the start frame
    /// is on the wire; acknowledgement and payloads arrive on the
    /// returned stream, which yields a single terminal `Err` if the
    /// subscription fails.
    pub async fn subscribe(&self, request: SubscribeRequest) -> Result<Subscription> {
        let id = SubscriptionId::new_v4();
        let (sink_tx, sink_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();

        self.inner
            .commands
            .send(Command::Subscribe {
                id,
                request,
                sink: sink_tx,
                done: done_tx,
            })
            .map_err(|_| Error::from(RealtimeError::TransportClosed))?;
        done_rx
            .await
            .map_err(|_| Error::from(RealtimeError::TransportClosed))??;

        Ok(Subscription { id, events: sink_rx })
    }

    /// Tear down one logical subscription.
    ///
    /// A subscription whose start is still pending is removed once that
    /// start resolves, without racing it; a connected one gets exactly
    /// one stop frame. After the last subscription is removed the socket
    /// closes once the configured grace period passes without a new one.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.inner
            .commands
            .send(Command::Unsubscribe { id, done: done_tx })
            .map_err(|_| Error::from(RealtimeError::TransportClosed))?;
        done_rx
            .await
            .map_err(|_| Error::from(RealtimeError::TransportClosed))?
    }

    /// The current connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.monitor.current()
    }

    /// Subscribe to the stream of connection-state changes.
    #[must_use]
    pub fn connection_states(&self) -> broadcast::Receiver<ConnectionState> {
        self.inner.monitor.changes()
    }

    /// Subscribe to transport events (state changes, subscription acks
    /// and errors).
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events_tx.subscribe()
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("connection_state", &self.inner.monitor.current())
            .finish_non_exhaustive()
    }
}

/// Handle to one logical subscription.
///
/// Yields subscription payloads; a failed subscription yields a single
/// terminal `Err` and then ends. Dropping the handle does not
/// unsubscribe; call [`Client::unsubscribe`] with [`Subscription::id`].
pub struct Subscription {
    id: SubscriptionId,
    events: mpsc::UnboundedReceiver<Result<Value>>,
}

impl Subscription {
    /// The subscription's id, stable across reconnects.
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

impl Stream for Subscription {
    type Item = Result<Value>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish_non_exhaustive()
    }
}
