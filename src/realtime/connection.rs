//! Connection task owning the shared socket and the subscription
//! registry.
//!
//! All mutation of socket state, registry entries, and timers happens on
//! one task. Callers talk to it through a command channel, which also
//! serializes concurrent subscribe/unsubscribe calls against the
//! in-flight handshake: commands queued behind a handshake are processed
//! once it resolves and find the socket ready instead of opening a
//! second one.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use futures::{SinkExt as _, StreamExt as _};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, sleep_until, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::client::{SubscribeRequest, TransportEvent};
use super::config::Config;
use super::error::RealtimeError;
use super::protocol::{
    ClientMessage, ServerMessage, StartExtensions, StartPayload, SubscriptionId, USER_AGENT,
    USER_AGENT_HEADER, WEBSOCKET_SUBPROTOCOL, realtime_endpoint, with_connection_params,
};
use crate::auth::{AuthConfig, authorization_headers};
use crate::monitor::{ConnectionState, ConnectionStateMonitor};
use crate::retry::{self, RetryOptions, RetryResult, jittered_exponential_delay};
use crate::{Result, error::Error};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Whether a send is safe and whether a new handshake is needed.
/// Internal to the transport, distinct from the public
/// [`ConnectionState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketStatus {
    Closed,
    Connecting,
    Ready,
}

/// Lifecycle of one logical subscription. Transitions are strictly
/// ordered and never regress: `Pending` to `Connected` to removal, or
/// `Pending` to `Failed` to removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubscriptionStatus {
    Pending,
    Connected,
    Failed,
}

/// Registry entry for one logical subscription.
struct SubscriptionEntry {
    query: String,
    variables: Value,
    auth: Option<AuthConfig>,
    additional_headers: BTreeMap<String, String>,
    status: SubscriptionStatus,
    sink: mpsc::UnboundedSender<Result<Value>>,
    /// Armed while a start frame awaits its ack
    ack_deadline: Option<Instant>,
    /// An unsubscribe arrived while the start was still pending; resolved
    /// once the start is acked or fails
    pending_unsubscribe: Option<oneshot::Sender<Result<()>>>,
}

/// Caller requests, serialized through the connection task.
pub(crate) enum Command {
    Subscribe {
        id: SubscriptionId,
        request: SubscribeRequest,
        sink: mpsc::UnboundedSender<Result<Value>>,
        done: oneshot::Sender<Result<()>>,
    },
    Unsubscribe {
        id: SubscriptionId,
        done: oneshot::Sender<Result<()>>,
    },
}

enum Wake {
    Shutdown,
    Command(Command),
    Socket(Option<std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>),
    StateChange(Option<ConnectionState>),
    AckTimeout(SubscriptionId),
    KeepAliveAlert,
    KeepAliveTimeout,
    CloseGrace,
}

/// Successful handshake: an open, acked socket and the keepalive timeout
/// the gateway advertised.
struct HandshakeOutcome {
    socket: WsStream,
    keep_alive_timeout: Duration,
}

pub(crate) struct ConnectionTask {
    config: Config,
    endpoint: Url,
    commands: mpsc::UnboundedReceiver<Command>,
    monitor: ConnectionStateMonitor,
    events_tx: broadcast::Sender<TransportEvent>,
    cancel: CancellationToken,
    socket: Option<WsStream>,
    socket_status: SocketStatus,
    entries: HashMap<SubscriptionId, SubscriptionEntry>,
    /// Effective keepalive timeout, overridden by the gateway on ack
    keep_alive_timeout: Duration,
    keep_alive_deadline: Option<Instant>,
    keep_alive_alert_deadline: Option<Instant>,
    close_grace_deadline: Option<Instant>,
}

impl ConnectionTask {
    pub(crate) fn new(
        config: Config,
        endpoint: Url,
        commands: mpsc::UnboundedReceiver<Command>,
        monitor: ConnectionStateMonitor,
        events_tx: broadcast::Sender<TransportEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let keep_alive_timeout = config.keep_alive_timeout;
        Self {
            config,
            endpoint,
            commands,
            monitor,
            events_tx,
            cancel,
            socket: None,
            socket_status: SocketStatus::Closed,
            entries: HashMap::new(),
            keep_alive_timeout,
            keep_alive_deadline: None,
            keep_alive_alert_deadline: None,
            close_grace_deadline: None,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut state_changes = self.monitor.changes();
        loop {
            let next_ack = self.next_ack_deadline();
            let wake = tokio::select! {
                () = self.cancel.cancelled() => Wake::Shutdown,
                command = self.commands.recv() => match command {
                    Some(command) => Wake::Command(command),
                    None => Wake::Shutdown,
                },
                frame = next_socket_frame(&mut self.socket) => Wake::Socket(frame),
                state = state_changes.recv() => Wake::StateChange(state.ok()),
                () = sleep_opt(next_ack.map(|(_, when)| when)) => {
                    match next_ack {
                        Some((id, _)) => Wake::AckTimeout(id),
                        None => continue,
                    }
                }
                () = sleep_opt(self.keep_alive_alert_deadline) => Wake::KeepAliveAlert,
                () = sleep_opt(self.keep_alive_deadline) => Wake::KeepAliveTimeout,
                () = sleep_opt(self.close_grace_deadline) => Wake::CloseGrace,
            };

            match wake {
                Wake::Shutdown => {
                    self.shutdown().await;
                    break;
                }
                Wake::Command(command) => self.handle_command(command).await,
                Wake::Socket(frame) => self.handle_socket_frame(frame).await,
                Wake::StateChange(Some(state)) => self.handle_state_change(state).await,
                Wake::StateChange(None) => {}
                Wake::AckTimeout(id) => self.handle_ack_timeout(id),
                Wake::KeepAliveAlert => {
                    self.keep_alive_alert_deadline = None;
                    self.monitor.keep_alive_missed();
                }
                Wake::KeepAliveTimeout => self.handle_keep_alive_timeout().await,
                Wake::CloseGrace => {
                    self.close_grace_deadline = None;
                    self.close_socket_if_required().await;
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Subscribe {
                id,
                request,
                sink,
                done,
            } => {
                // A resubscribe during the close grace window keeps the socket
                self.close_grace_deadline = None;
                self.entries.insert(
                    id,
                    SubscriptionEntry {
                        query: request.query,
                        variables: request
                            .variables
                            .unwrap_or_else(|| Value::Object(serde_json::Map::new())),
                        auth: request.auth,
                        additional_headers: request.additional_headers,
                        status: SubscriptionStatus::Pending,
                        sink,
                        ack_deadline: None,
                        pending_unsubscribe: None,
                    },
                );
                let result = self.start_subscription(id).await;
                if let Err(error) = &result {
                    tracing::debug!(%id, %error, "subscription start failed");
                    self.entries.remove(&id);
                    self.schedule_close_if_idle();
                }
                _ = done.send(result);
            }
            Command::Unsubscribe { id, done } => self.handle_unsubscribe(id, done).await,
        }
    }

    /// Send the start frame for a registered entry, performing the
    /// handshake first if no socket is ready.
    async fn start_subscription(&mut self, id: SubscriptionId) -> Result<()> {
        let Some(entry) = self.entries.get(&id) else {
            return Err(RealtimeError::SubscriptionNeverConnected { id }.into());
        };
        let auth = entry.auth.clone().unwrap_or_else(|| self.config.auth.clone());
        let additional_headers = entry.additional_headers.clone();
        let data = serde_json::to_string(&serde_json::json!({
            "query": entry.query,
            "variables": entry.variables,
        }))?;

        self.ensure_socket_ready(&auth, &additional_headers).await?;

        let mut authorization =
            authorization_headers(&auth, &self.endpoint, "", &data, &additional_headers).await?;
        // Caller-supplied headers win over strategy-derived ones
        for (name, value) in &additional_headers {
            authorization.insert(name.clone(), value.clone());
        }
        authorization.insert(USER_AGENT_HEADER.to_owned(), USER_AGENT.to_owned());

        let frame = ClientMessage::Start {
            id,
            payload: StartPayload {
                data,
                extensions: StartExtensions { authorization },
            },
        };
        self.send_frame(&frame).await?;

        if let Some(entry) = self.entries.get_mut(&id) {
            entry.status = SubscriptionStatus::Pending;
            entry.ack_deadline = Some(Instant::now() + self.config.start_ack_timeout);
        }
        tracing::debug!(%id, "start frame sent");
        Ok(())
    }

    /// Establish the shared socket if it is not ready, driving the
    /// handshake through the retry executor.
    async fn ensure_socket_ready(
        &mut self,
        auth: &AuthConfig,
        additional_headers: &BTreeMap<String, String>,
    ) -> Result<()> {
        if self.socket_status == SocketStatus::Ready && self.socket.is_some() {
            return Ok(());
        }

        self.socket_status = SocketStatus::Connecting;
        self.monitor.opening_connection();

        let headers =
            authorization_headers(auth, &self.endpoint, "/connect", "{}", additional_headers)
                .await?;
        let header_json = serde_json::to_string(&headers)?;
        let url = realtime_endpoint(&self.endpoint, !self.config.dangerously_connect_insecurely)?;
        let url = with_connection_params(&url, &header_json, "{}");

        let options: RetryOptions<HandshakeOutcome, RealtimeError> = RetryOptions::new(
            |_, error: Option<&RealtimeError>| {
                error.is_some_and(RealtimeError::is_retryable_handshake)
            },
            jittered_exponential_delay(self.config.retry.max_delay),
        )
        .with_max_attempts(self.config.retry.max_attempts)
        .with_cancellation(self.cancel.clone());

        let monitor = self.monitor.clone();
        let init_timeout = self.config.connection_init_timeout;
        let default_keep_alive = self.config.keep_alive_timeout;
        let outcome = retry::execute(
            || handshake(url.clone(), init_timeout, default_keep_alive, monitor.clone()),
            &options,
        )
        .await;

        match outcome {
            Ok(RetryResult { value, attempts }) => {
                tracing::debug!(attempts, "handshake complete");
                self.socket = Some(value.socket);
                self.keep_alive_timeout = value.keep_alive_timeout;
                self.socket_status = SocketStatus::Ready;
                self.arm_keep_alive();
                Ok(())
            }
            Err(error) => {
                self.socket = None;
                self.socket_status = SocketStatus::Closed;
                self.monitor.connection_failed();
                Err(error.into())
            }
        }
    }

    async fn handle_unsubscribe(&mut self, id: SubscriptionId, done: oneshot::Sender<Result<()>>) {
        let Some(entry) = self.entries.get_mut(&id) else {
            _ = done.send(Ok(()));
            return;
        };
        if entry.status == SubscriptionStatus::Pending {
            // Do not race the in-flight start frame; the ack, error, or
            // timeout handler completes the removal.
            tracing::debug!(%id, "unsubscribe waiting for pending start to resolve");
            entry.pending_unsubscribe = Some(done);
            return;
        }
        self.finish_unsubscribe(id, Some(done)).await;
    }

    /// Stop a connected subscription and drop it from the registry.
    async fn finish_unsubscribe(
        &mut self,
        id: SubscriptionId,
        done: Option<oneshot::Sender<Result<()>>>,
    ) {
        self.send_stop(id).await;
        self.entries.remove(&id);
        self.schedule_close_if_idle();
        if let Some(done) = done {
            _ = done.send(Ok(()));
        }
    }

    async fn send_stop(&mut self, id: SubscriptionId) {
        if self.socket_status != SocketStatus::Ready {
            return;
        }
        if let Err(error) = self.send_frame(&ClientMessage::Stop { id }).await {
            // Nothing the client can do if the stop frame cannot be delivered
            tracing::debug!(%id, %error, "failed to send stop frame");
        }
    }

    async fn handle_socket_frame(
        &mut self,
        frame: Option<std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>,
    ) {
        match frame {
            Some(Ok(Message::Text(text))) => self.dispatch_frame(text.as_str()).await,
            Some(Ok(Message::Close(_))) | None => self.handle_socket_lost("connection closed"),
            Some(Err(error)) => {
                tracing::debug!(%error, "socket error");
                self.handle_socket_lost("socket error");
            }
            Some(Ok(_)) => {} // binary frames and transport-level ping/pong
        }
    }

    async fn dispatch_frame(&mut self, text: &str) {
        let message: ServerMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(error) => {
                tracing::warn!(%error, "failed to parse gateway frame");
                return;
            }
        };

        match message {
            ServerMessage::Ka => {
                self.monitor.keep_alive();
                self.arm_keep_alive();
            }
            ServerMessage::StartAck { id } => self.handle_start_ack(id).await,
            ServerMessage::Data { id, payload } => {
                if let Some(entry) = self.entries.get(&id) {
                    _ = entry.sink.send(Ok(payload));
                } else {
                    tracing::debug!(%id, "no subscription for data frame");
                }
            }
            ServerMessage::Error { id: Some(id), payload } => {
                self.fail_subscription(id, RealtimeError::SubscriptionServerError { id, payload }.into());
            }
            ServerMessage::Error { id: None, payload } => {
                tracing::debug!(?payload, "error frame without subscription id");
            }
            ServerMessage::Complete { id } => {
                tracing::debug!(%id, "subscription complete");
            }
            ServerMessage::ConnectionAck { .. } | ServerMessage::ConnectionError { .. } => {
                tracing::debug!("unexpected connection frame in steady state");
            }
        }
    }

    async fn handle_start_ack(&mut self, id: SubscriptionId) {
        let Some(entry) = self.entries.get_mut(&id) else {
            tracing::debug!(%id, "no subscription for start ack");
            return;
        };
        entry.ack_deadline = None;
        entry.status = SubscriptionStatus::Connected;
        let parked_unsubscribe = entry.pending_unsubscribe.take();
        tracing::debug!(%id, "subscription acknowledged");

        self.monitor.connection_established();
        _ = self.events_tx.send(TransportEvent::SubscriptionAck { id });

        if parked_unsubscribe.is_some() {
            self.finish_unsubscribe(id, parked_unsubscribe).await;
        }
    }

    /// Terminal failure of one subscription: notify its sink once, drop
    /// the entry, leave the shared socket alone.
    fn fail_subscription(&mut self, id: SubscriptionId, error: Error) {
        let Some(mut entry) = self.entries.remove(&id) else {
            return;
        };
        entry.status = SubscriptionStatus::Failed;
        entry.ack_deadline = None;
        tracing::debug!(%id, %error, "subscription failed");

        _ = self.events_tx.send(TransportEvent::SubscriptionError { id });
        _ = entry.sink.send(Err(error));
        if let Some(done) = entry.pending_unsubscribe {
            _ = done.send(Err(RealtimeError::SubscriptionNeverConnected { id }.into()));
        }
        self.schedule_close_if_idle();
    }

    fn handle_ack_timeout(&mut self, id: SubscriptionId) {
        self.fail_subscription(id, RealtimeError::SubscriptionTimeout { id }.into());
    }

    async fn handle_state_change(&mut self, state: ConnectionState) {
        _ = self
            .events_tx
            .send(TransportEvent::ConnectionStateChange(state));
        if state == ConnectionState::ConnectionDisrupted {
            self.reconnect_all().await;
        }
    }

    /// Re-establish every registered subscription over a fresh socket,
    /// keeping ids and query/variables.
    async fn reconnect_all(&mut self) {
        if self.entries.is_empty() {
            return;
        }
        tracing::debug!(count = self.entries.len(), "connection disrupted, resubscribing");

        if let Some(mut socket) = self.socket.take() {
            _ = socket.close(None).await;
        }
        self.socket_status = SocketStatus::Closed;
        self.keep_alive_deadline = None;
        self.keep_alive_alert_deadline = None;

        let ids: Vec<_> = self.entries.keys().copied().collect();
        for id in ids {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.status = SubscriptionStatus::Pending;
                entry.ack_deadline = None;
            }
            if let Err(error) = self.start_subscription(id).await {
                tracing::warn!(%id, %error, "resubscription failed");
                self.fail_subscription(id, error);
            }
        }
    }

    fn handle_socket_lost(&mut self, reason: &str) {
        tracing::debug!(reason, "socket lost");
        self.socket = None;
        self.socket_status = SocketStatus::Closed;
        self.keep_alive_deadline = None;
        self.keep_alive_alert_deadline = None;
        // An unexpected close counts as a disruption and triggers
        // resubscription through the monitor
        self.monitor.closed();
    }

    async fn handle_keep_alive_timeout(&mut self) {
        tracing::warn!("keepalive timeout, closing socket");
        self.keep_alive_deadline = None;
        self.keep_alive_alert_deadline = None;
        if let Some(mut socket) = self.socket.take() {
            _ = socket.close(None).await;
        }
        self.socket_status = SocketStatus::Closed;
        self.monitor.closed();
    }

    /// Close the socket once no subscriptions remain and the grace
    /// period elapsed without a new one arriving.
    async fn close_socket_if_required(&mut self) {
        if !self.entries.is_empty() {
            return;
        }
        let Some(mut socket) = self.socket.take() else {
            self.socket_status = SocketStatus::Closed;
            return;
        };

        self.monitor.closing();
        tracing::debug!("closing idle socket");
        _ = socket.flush().await;
        _ = socket.close(None).await;
        self.socket_status = SocketStatus::Closed;
        self.keep_alive_deadline = None;
        self.keep_alive_alert_deadline = None;
        self.monitor.closed();
    }

    async fn send_frame(&mut self, frame: &ClientMessage) -> Result<()> {
        let text = serde_json::to_string(frame).map_err(RealtimeError::Serialize)?;
        let Some(socket) = self.socket.as_mut() else {
            return Err(RealtimeError::SocketClosed.into());
        };
        socket
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| Error::from(RealtimeError::Socket(e)))
    }

    fn arm_keep_alive(&mut self) {
        let now = Instant::now();
        self.keep_alive_deadline = Some(now + self.keep_alive_timeout);
        self.keep_alive_alert_deadline = Some(now + self.config.keep_alive_alert_timeout);
    }

    fn schedule_close_if_idle(&mut self) {
        if self.entries.is_empty() {
            self.close_grace_deadline = Some(Instant::now() + self.config.close_grace_period);
        }
    }

    fn next_ack_deadline(&self) -> Option<(SubscriptionId, Instant)> {
        self.entries
            .iter()
            .filter_map(|(id, entry)| entry.ack_deadline.map(|when| (*id, when)))
            .min_by_key(|(_, when)| *when)
    }

    async fn shutdown(&mut self) {
        tracing::debug!("transport shutting down");
        for (_, entry) in self.entries.drain() {
            if let Some(done) = entry.pending_unsubscribe {
                _ = done.send(Ok(()));
            }
        }
        if let Some(mut socket) = self.socket.take() {
            self.monitor.closing();
            _ = socket.close(None).await;
            self.monitor.closed();
        }
        self.socket_status = SocketStatus::Closed;
    }
}

/// One handshake attempt: open the socket, send `connection_init`, and
/// wait for the gateway's `connection_ack` within the init timeout.
async fn handshake(
    url: Url,
    init_timeout: Duration,
    default_keep_alive: Duration,
    monitor: ConnectionStateMonitor,
) -> std::result::Result<HandshakeOutcome, RealtimeError> {
    let mut request = url.as_str().into_client_request().map_err(RealtimeError::Socket)?;
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static(WEBSOCKET_SUBPROTOCOL),
    );

    let (mut socket, _response) = match connect_async(request).await {
        Ok(pair) => pair,
        Err(error) => {
            tracing::debug!(%error, "websocket connect failed");
            monitor.connection_failed();
            return Err(RealtimeError::Socket(error));
        }
    };

    let init = serde_json::to_string(&ClientMessage::ConnectionInit)
        .map_err(RealtimeError::Serialize)?;
    socket
        .send(Message::Text(init.into()))
        .await
        .map_err(RealtimeError::Socket)?;

    let ack = timeout(init_timeout, async {
        loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerMessage>(&text)
                {
                    Ok(ServerMessage::ConnectionAck { payload }) => return Ok(payload),
                    Ok(ServerMessage::ConnectionError { payload }) => {
                        let (error_type, error_code) = payload
                            .and_then(|p| p.errors.into_iter().next())
                            .map(|e| (e.error_type, e.error_code))
                            .unwrap_or_default();
                        return Err(RealtimeError::HandshakeRejected {
                            error_type,
                            error_code,
                        });
                    }
                    Ok(_) | Err(_) => {} // keepalives or noise ahead of the ack
                },
                Some(Ok(_)) => {}
                Some(Err(error)) => return Err(RealtimeError::Socket(error)),
                None => return Err(RealtimeError::SocketClosed),
            }
        }
    })
    .await;

    match ack {
        Ok(Ok(payload)) => {
            let keep_alive_timeout = payload
                .map_or(default_keep_alive, |p| {
                    Duration::from_millis(p.connection_timeout_ms)
                });
            Ok(HandshakeOutcome {
                socket,
                keep_alive_timeout,
            })
        }
        Ok(Err(error)) => {
            if matches!(error, RealtimeError::SocketClosed | RealtimeError::Socket(_)) {
                monitor.connection_failed();
            }
            Err(error)
        }
        Err(_elapsed) => {
            monitor.connection_failed();
            Err(RealtimeError::HandshakeTimeout {
                waited: init_timeout,
            })
        }
    }
}

async fn next_socket_frame(
    socket: &mut Option<WsStream>,
) -> Option<std::result::Result<Message, tokio_tungstenite::tungstenite::Error>> {
    match socket {
        Some(socket) => socket.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
