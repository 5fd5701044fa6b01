//! Session supervisor for the market-data channel.
//!
//! One supervisor task owns the socket while a session is live. It drives the
//! heartbeat, drains the outbound queue, decodes inbound frames onto the
//! [`EventBus`] and, when the connection drops without being asked to, runs
//! the bounded reconnect loop. Callers talk to it through [`ConnectionManager`].

use crate::error::FeedError;
use crate::market::codec::{decode_transport_message, to_transport_message, DecodedFrame};
use crate::market::correlator::{self, RequestKind, RequestSpec};
use crate::market::events::{EventBus, LifecycleEvent};
use crate::market::now_unix_ms;
use crate::market::subscriptions::{replay_subscriptions, SubscriptionRegistry};
use crate::market::transport::{
    close_details, connect_market_stream, normal_close_frame, FeedStream, ABNORMAL_CLOSURE_CODE,
    NORMAL_CLOSURE_CODE,
};
use crate::market::types::{
    ConnectionState, MarketData, MessageType, SessionConfig, SessionStatusSnapshot,
    SubscriptionKey, WireMessage, MAX_RECONNECT_DELAY_MS,
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const CLIENT_CLOSE_REASON: &str = "client disconnect";

/// Delay before reconnect attempt `attempt` (1-based): the base doubles per
/// attempt and is capped at [`MAX_RECONNECT_DELAY_MS`].
pub fn reconnect_delay_ms(base_ms: u64, attempt: u32) -> u64 {
    let exponent = attempt.saturating_sub(1).min(31);
    base_ms
        .saturating_mul(1_u64 << exponent)
        .min(MAX_RECONNECT_DELAY_MS)
}

#[derive(Debug, Default)]
struct HeartbeatTelemetry {
    has_last_ping: AtomicBool,
    last_ping_ms: AtomicI64,
    has_latency_ms: AtomicBool,
    latency_ms: AtomicI64,
    last_pong_ms: AtomicI64,
}

impl HeartbeatTelemetry {
    fn reset(&self, now_ms: i64) {
        self.has_last_ping.store(false, Ordering::Relaxed);
        self.last_pong_ms.store(now_ms, Ordering::Relaxed);
    }

    fn record_ping(&self, now_ms: i64) {
        self.last_ping_ms.store(now_ms, Ordering::Relaxed);
        self.has_last_ping.store(true, Ordering::Relaxed);
    }

    fn record_pong(&self, now_ms: i64) -> Option<i64> {
        self.last_pong_ms.store(now_ms, Ordering::Relaxed);
        if !self.has_last_ping.load(Ordering::Relaxed) {
            return None;
        }
        let latency_ms = now_ms
            .saturating_sub(self.last_ping_ms.load(Ordering::Relaxed))
            .max(0);
        self.latency_ms.store(latency_ms, Ordering::Relaxed);
        self.has_latency_ms.store(true, Ordering::Relaxed);
        Some(latency_ms)
    }

    fn latency_ms(&self) -> Option<i64> {
        self.has_latency_ms
            .load(Ordering::Relaxed)
            .then(|| self.latency_ms.load(Ordering::Relaxed))
    }

    fn silent_for_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.last_pong_ms.load(Ordering::Relaxed))
    }
}

#[derive(Debug)]
struct StatusCell {
    state: ConnectionState,
    reason: Option<String>,
}

struct LiveConnection {
    stream: FeedStream,
    outbound_rx: mpsc::UnboundedReceiver<Message>,
    heartbeat: Interval,
}

enum SessionExit {
    Cancelled,
    Closed { code: u16, reason: String },
}

/// Clears the in-flight connect flag on every exit path.
struct ConnectingGuard<'a>(&'a AtomicBool);

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Forgets the abort token of the initial handshake once `connect` returns.
struct PendingConnectGuard<'a>(&'a Mutex<Option<CancellationToken>>);

impl Drop for PendingConnectGuard<'_> {
    fn drop(&mut self) {
        self.0.lock().take();
    }
}

pub(crate) struct SessionInner {
    pub(crate) config: SessionConfig,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) registry: SubscriptionRegistry,
    status: RwLock<StatusCell>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    session_token: Mutex<Option<CancellationToken>>,
    request_token: Mutex<CancellationToken>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    pending_connect: Mutex<Option<CancellationToken>>,
    transitions: tokio::sync::Mutex<()>,
    connecting: AtomicBool,
    destroyed: AtomicBool,
    reconnect_attempt: AtomicU32,
    heartbeat: HeartbeatTelemetry,
    client_id: Mutex<Option<String>>,
}

impl SessionInner {
    fn state(&self) -> ConnectionState {
        self.status.read().state
    }

    fn set_state(&self, state: ConnectionState, reason: Option<String>) -> ConnectionState {
        let mut status = self.status.write();
        let previous = status.state;
        status.state = state;
        status.reason = reason;
        previous
    }

    pub(crate) fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.config.request_timeout_ms)
    }

    fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.config.connect_timeout_ms)
    }

    pub(crate) fn request_token(&self) -> CancellationToken {
        self.request_token.lock().clone()
    }

    /// Rejects every request waiting on the current connection.
    fn cancel_pending_requests(&self) {
        let previous = std::mem::replace(&mut *self.request_token.lock(), CancellationToken::new());
        previous.cancel();
    }

    fn attach(&self, stream: FeedStream) -> LiveConnection {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        *self.outbound.lock() = Some(outbound_tx);
        self.heartbeat.reset(now_unix_ms());

        let period = Duration::from_millis(self.config.heartbeat_interval_ms);
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        LiveConnection {
            stream,
            outbound_rx,
            heartbeat,
        }
    }

    fn detach(&self) {
        *self.outbound.lock() = None;
        self.cancel_pending_requests();
    }

    pub(crate) fn send(&self, frame: &WireMessage) -> Result<(), FeedError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(FeedError::Destroyed);
        }
        let message = to_transport_message(frame)?;
        match self.outbound.lock().as_ref() {
            Some(outbound) => outbound
                .send(message)
                .map_err(|_| FeedError::NotConnected),
            None => Err(FeedError::NotConnected),
        }
    }

    fn handle_message(&self, message: Message) {
        let frame = match decode_transport_message(message) {
            Ok(Some(DecodedFrame::Frame(frame))) => frame,
            Ok(Some(DecodedFrame::Unknown(tag))) => {
                debug!(%tag, "ignoring frame with unknown type");
                return;
            }
            Ok(None) => return,
            Err(error) => {
                warn!(%error, "dropping malformed frame");
                return;
            }
        };

        match frame.message_type {
            MessageType::Pong => {
                if let Some(latency_ms) = self.heartbeat.record_pong(now_unix_ms()) {
                    debug!(latency_ms, "heartbeat acknowledged");
                }
            }
            MessageType::Ping => {
                let pong = WireMessage::new(MessageType::Pong).with_timestamp(now_unix_ms());
                if let Err(error) = self.send(&pong) {
                    debug!(%error, "could not answer server ping");
                }
            }
            MessageType::ConnectionEstablished => {
                if let Some(client_id) = &frame.client_id {
                    info!(client_id = %client_id, "server assigned client id");
                    *self.client_id.lock() = Some(client_id.clone());
                }
            }
            _ => {}
        }

        self.bus.emit_frame(frame);
    }

    async fn shutdown_session(&self) {
        let token = self.session_token.lock().take();
        if let Some(token) = token {
            token.cancel();
        }

        let supervisor = self.supervisor.lock().take();
        if let Some(handle) = supervisor {
            if let Err(error) = handle.await {
                warn!(%error, "session supervisor ended abnormally");
            }
        }

        self.detach();
        let previous = self.set_state(
            ConnectionState::Disconnected,
            Some("disconnected by client".to_string()),
        );
        if previous != ConnectionState::Disconnected {
            info!(url = %self.config.url, "market feed disconnected");
            self.bus.emit_lifecycle(LifecycleEvent::Disconnected {
                code: NORMAL_CLOSURE_CODE,
                reason: CLIENT_CLOSE_REASON.to_string(),
            });
        }
    }
}

/// Handle to one logical market-data session. Cloning shares the session.
#[derive(Clone)]
pub struct ConnectionManager {
    pub(crate) inner: Arc<SessionInner>,
}

impl ConnectionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                config,
                bus: EventBus::new(),
                registry: SubscriptionRegistry::default(),
                status: RwLock::new(StatusCell {
                    state: ConnectionState::Disconnected,
                    reason: Some("session idle".to_string()),
                }),
                outbound: Mutex::new(None),
                session_token: Mutex::new(None),
                request_token: Mutex::new(CancellationToken::new()),
                supervisor: Mutex::new(None),
                pending_connect: Mutex::new(None),
                transitions: tokio::sync::Mutex::new(()),
                connecting: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
                reconnect_attempt: AtomicU32::new(0),
                heartbeat: HeartbeatTelemetry::default(),
                client_id: Mutex::new(None),
            }),
        }
    }

    /// Opens the channel. Succeeds immediately when already connected; a
    /// failure here is reported to the caller and never starts the reconnect
    /// loop. A concurrent [`Self::disconnect`] aborts the handshake.
    pub async fn connect(&self) -> Result<(), FeedError> {
        let inner = &self.inner;
        if inner.destroyed.load(Ordering::SeqCst) {
            return Err(FeedError::Destroyed);
        }
        if inner
            .connecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(FeedError::AlreadyConnecting);
        }
        let _connecting = ConnectingGuard(&inner.connecting);
        let abort = CancellationToken::new();
        *inner.pending_connect.lock() = Some(abort.clone());
        let _pending = PendingConnectGuard(&inner.pending_connect);
        let _transition = inner.transitions.lock().await;

        match inner.state() {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Reconnecting => return Err(FeedError::AlreadyConnecting),
            ConnectionState::Disconnected | ConnectionState::Connecting => {}
        }

        // A supervisor that exhausted its reconnect budget has already returned.
        let finished = inner.supervisor.lock().take();
        if let Some(handle) = finished {
            let _ = handle.await;
        }

        inner.set_state(
            ConnectionState::Connecting,
            Some("opening websocket stream".to_string()),
        );
        let opening = connect_market_stream(&inner.config.url, inner.connect_timeout());
        let handshake = tokio::select! {
            biased;
            _ = abort.cancelled() => None,
            result = opening => Some(result),
        };
        let Some(handshake) = handshake else {
            info!(url = %inner.config.url, "market feed connect aborted by disconnect");
            inner.set_state(
                ConnectionState::Disconnected,
                Some("connect aborted by disconnect".to_string()),
            );
            return Err(FeedError::ConnectFailed("aborted by disconnect".to_string()));
        };
        let stream = match handshake {
            Ok(stream) => stream,
            Err(error) => {
                let error = match error {
                    FeedError::ConnectFailed(_) => error,
                    other => FeedError::ConnectFailed(other.to_string()),
                };
                warn!(url = %inner.config.url, %error, "market feed connect failed");
                inner.set_state(ConnectionState::Disconnected, Some(error.to_string()));
                inner.bus.emit_lifecycle(LifecycleEvent::Error {
                    message: error.to_string(),
                    fatal: false,
                });
                return Err(error);
            }
        };

        let token = CancellationToken::new();
        *inner.session_token.lock() = Some(token.clone());
        let connection = inner.attach(stream);
        inner.reconnect_attempt.store(0, Ordering::SeqCst);
        inner.set_state(
            ConnectionState::Connected,
            Some("websocket connected".to_string()),
        );
        info!(url = %inner.config.url, "market feed connected");
        inner.bus.emit_lifecycle(LifecycleEvent::Connected);

        let supervisor = tokio::spawn(run_session(Arc::clone(inner), connection, token));
        *inner.supervisor.lock() = Some(supervisor);
        Ok(())
    }

    /// Closes the channel with a normal close and stops the heartbeat and any
    /// pending reconnect. Outstanding requests are rejected.
    pub async fn disconnect(&self) {
        if let Some(abort) = self.inner.pending_connect.lock().take() {
            abort.cancel();
        }
        let _transition = self.inner.transitions.lock().await;
        self.inner.shutdown_session().await;
    }

    /// Disconnects, drops every listener and subscription, and refuses all
    /// further operations.
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.disconnect().await;
        self.inner.registry.clear();
        self.inner.bus.clear();
        info!("market feed session destroyed");
    }

    pub fn send(&self, frame: &WireMessage) -> Result<(), FeedError> {
        self.inner.send(frame)
    }

    /// Registers the response listeners, sends `frame`, then waits for the
    /// correlated response.
    pub(crate) async fn request(
        &self,
        frame: WireMessage,
        spec: RequestSpec,
    ) -> Result<WireMessage, FeedError> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(FeedError::Destroyed);
        }
        let pending = correlator::register(&self.inner.bus, spec, self.inner.request_token());
        self.inner.send(&frame)?;
        pending.wait().await
    }

    pub async fn get_market_data(&self, market_id: &str) -> Result<MarketData, FeedError> {
        if market_id.trim().is_empty() {
            return Err(FeedError::InvalidArgument(
                "market id must not be empty".to_string(),
            ));
        }

        let expected = market_id.to_string();
        let spec = RequestSpec {
            kind: RequestKind::Query {
                request: format!("get_market_data({market_id})"),
            },
            response: MessageType::MarketData,
            matcher: Box::new(move |frame: &WireMessage| {
                frame.market_id.as_deref() == Some(expected.as_str())
            }),
            error_matcher: RequestSpec::market_error_matcher(market_id),
            timeout: self.inner.request_timeout(),
        };
        let frame = WireMessage::new(MessageType::GetMarketData)
            .with_market(market_id)
            .with_timestamp(now_unix_ms());

        let response = self.request(frame, spec).await?;
        let Some(payload) = response.data else {
            return Err(FeedError::MalformedFrame(format!(
                "market_data for {market_id} carried no payload"
            )));
        };
        let mut market: MarketData = serde_json::from_value(payload)?;
        if market.market_id.is_empty() {
            market.market_id = market_id.to_string();
        }
        Ok(market)
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn status(&self) -> SessionStatusSnapshot {
        let status = self.inner.status.read();
        SessionStatusSnapshot {
            state: status.state,
            url: self.inner.config.url.clone(),
            client_id: self.client_id(),
            latency_ms: self.latency_ms(),
            reconnect_attempt: self.inner.reconnect_attempt.load(Ordering::SeqCst),
            subscriptions: self.inner.registry.len(),
            reason: status.reason.clone(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.inner.bus)
    }

    pub fn lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.bus.lifecycle()
    }

    pub fn latency_ms(&self) -> Option<i64> {
        self.inner.heartbeat.latency_ms()
    }

    pub fn client_id(&self) -> Option<String> {
        self.inner.client_id.lock().clone()
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionKey> {
        self.inner.registry.keys()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }
}

async fn send_frame(stream: &mut FeedStream, frame: &WireMessage) -> Result<(), FeedError> {
    stream.send(to_transport_message(frame)?).await?;
    Ok(())
}

async fn run_session(
    inner: Arc<SessionInner>,
    mut connection: LiveConnection,
    token: CancellationToken,
) {
    loop {
        let exit = drive_connection(&inner, &mut connection, &token).await;
        inner.detach();

        let SessionExit::Closed { code, reason } = exit else {
            return;
        };
        warn!(code, %reason, "market feed connection lost");
        inner
            .bus
            .emit_lifecycle(LifecycleEvent::Disconnected { code, reason });

        match reconnect(&inner, &token).await {
            Some(next) => connection = next,
            None => return,
        }
    }
}

async fn drive_connection(
    inner: &SessionInner,
    connection: &mut LiveConnection,
    token: &CancellationToken,
) -> SessionExit {
    let pong_timeout_ms = inner
        .config
        .pong_timeout_ms
        .map(|timeout| i64::try_from(timeout).unwrap_or(i64::MAX));

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                if let Err(error) = connection
                    .stream
                    .close(Some(normal_close_frame(CLIENT_CLOSE_REASON)))
                    .await
                {
                    debug!(%error, "close handshake did not complete");
                }
                return SessionExit::Cancelled;
            }
            _ = connection.heartbeat.tick() => {
                let now_ms = now_unix_ms();
                if let Some(limit_ms) = pong_timeout_ms {
                    let silent_ms = inner.heartbeat.silent_for_ms(now_ms);
                    if silent_ms > limit_ms {
                        return SessionExit::Closed {
                            code: ABNORMAL_CLOSURE_CODE,
                            reason: format!("no pong received for {silent_ms}ms"),
                        };
                    }
                }

                inner.heartbeat.record_ping(now_ms);
                let ping = WireMessage::new(MessageType::Ping).with_timestamp(now_ms);
                if let Err(error) = send_frame(&mut connection.stream, &ping).await {
                    return SessionExit::Closed {
                        code: ABNORMAL_CLOSURE_CODE,
                        reason: format!("heartbeat send failed: {error}"),
                    };
                }
            }
            Some(message) = connection.outbound_rx.recv() => {
                if let Err(error) = connection.stream.send(message).await {
                    return SessionExit::Closed {
                        code: ABNORMAL_CLOSURE_CODE,
                        reason: format!("websocket send failed: {error}"),
                    };
                }
            }
            inbound = connection.stream.next() => match inbound {
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = close_details(frame.as_ref());
                    return SessionExit::Closed { code, reason };
                }
                Some(Ok(message)) => inner.handle_message(message),
                Some(Err(error)) => {
                    return SessionExit::Closed {
                        code: ABNORMAL_CLOSURE_CODE,
                        reason: format!("websocket frame error: {error}"),
                    };
                }
                None => {
                    return SessionExit::Closed {
                        code: ABNORMAL_CLOSURE_CODE,
                        reason: "websocket stream ended".to_string(),
                    };
                }
            }
        }
    }
}

async fn reconnect(inner: &Arc<SessionInner>, token: &CancellationToken) -> Option<LiveConnection> {
    let max_attempts = inner.config.max_reconnect_attempts;

    loop {
        let attempt = inner.reconnect_attempt.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > max_attempts {
            let exhausted = FeedError::ReconnectExhausted {
                attempts: max_attempts,
            };
            error!(url = %inner.config.url, %exhausted, "giving up on market feed");
            inner.set_state(ConnectionState::Disconnected, Some(exhausted.to_string()));
            inner.bus.emit_lifecycle(LifecycleEvent::Error {
                message: exhausted.to_string(),
                fatal: true,
            });
            return None;
        }

        let delay_ms = reconnect_delay_ms(inner.config.reconnect_base_ms, attempt);
        inner.set_state(
            ConnectionState::Reconnecting,
            Some(format!("reconnect attempt {attempt}")),
        );
        info!(attempt, delay_ms, "scheduling market feed reconnect");
        inner
            .bus
            .emit_lifecycle(LifecycleEvent::Reconnecting { attempt, delay_ms });

        tokio::select! {
            _ = token.cancelled() => return None,
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
        }

        let opened = tokio::select! {
            _ = token.cancelled() => return None,
            opened = connect_market_stream(&inner.config.url, inner.connect_timeout()) => opened,
        };
        let stream = match opened {
            Ok(stream) => stream,
            Err(error) => {
                warn!(attempt, %error, "market feed reconnect attempt failed");
                inner.bus.emit_lifecycle(LifecycleEvent::Error {
                    message: format!("reconnect attempt {attempt} failed: {error}"),
                    fatal: false,
                });
                continue;
            }
        };

        let mut connection = inner.attach(stream);
        inner.set_state(
            ConnectionState::Connected,
            Some("websocket reconnected".to_string()),
        );
        inner.bus.emit_lifecycle(LifecycleEvent::Connected);

        match replay_subscriptions(inner, &mut connection.stream).await {
            Ok(replayed) => {
                inner.reconnect_attempt.store(0, Ordering::SeqCst);
                info!(attempt, replayed, "market feed reconnected");
                inner
                    .bus
                    .emit_lifecycle(LifecycleEvent::Reconnected { attempt });
                return Some(connection);
            }
            Err(error) => {
                warn!(attempt, %error, "subscription replay failed");
                inner.detach();
                inner.bus.emit_lifecycle(LifecycleEvent::Disconnected {
                    code: ABNORMAL_CLOSURE_CODE,
                    reason: format!("subscription replay failed: {error}"),
                });
            }
        }
    }
}
