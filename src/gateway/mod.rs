//! The gateway session: connecting, identifying or resuming, heartbeating and reconnecting.

pub mod codec;
pub mod config;
pub mod decoder;
pub mod opcode;
pub mod payload;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

pub use codec::{Codec, Frame, JsonCodec, MsgPackCodec};
pub use config::GatewayConfig;
pub use decoder::FrameDecoder;
pub use opcode::{CloseKind, GatewayCloseCode, Opcode, NORMAL_CLOSE_CODE, ZOMBIED_CLOSE_CODE};
pub use payload::{
    Activity, ConnectionProperties, GatewayPayload, Presence, RequestGuildMembers,
    VoiceStateUpdate,
};

use crate::emitter::Emitter;
use crate::error::ClientError;
use payload::{Identify, Resume};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// Dispatches waiting for the listeners, in the order they arrived.
type DispatchQueue = mpsc::UnboundedSender<(String, Value)>;

/// Used when HELLO forgets to say how often to beat.
const DEFAULT_HEARTBEAT_INTERVAL: u64 = 41_250;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionStatus {
    #[default]
    Disconnected,
    Connecting,
    AwaitingHello,
    Identifying,
    Resuming,
    Ready,
}

/// What the heartbeat task should do on a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Beat {
    Send(Option<u64>),
    Zombied,
}

/// Everything the session remembers between frames and across reconnects.
#[derive(Debug, Default)]
pub(crate) struct SessionState {
    pub(crate) status: SessionStatus,
    pub(crate) session_id: Option<String>,
    pub(crate) sequence: Option<u64>,
    pub(crate) heartbeat_interval: Option<Duration>,
    pub(crate) heartbeat_acked: bool,
    pub(crate) last_sent: Option<Instant>,
    pub(crate) last_ack: Option<Instant>,
    pub(crate) latency: Option<Duration>,
}

impl SessionState {
    fn hello(&mut self, interval: Duration) {
        self.heartbeat_interval = Some(interval);
        self.heartbeat_acked = true;
    }

    /// A timer tick. An unacknowledged previous beat means the connection is dead.
    fn beat(&mut self, now: Instant) -> Beat {
        if !self.heartbeat_acked {
            return Beat::Zombied;
        }
        self.heartbeat_acked = false;
        self.last_sent = Some(now);
        Beat::Send(self.sequence)
    }

    /// The server asked for a beat. Doesn't count against the ack bookkeeping.
    fn requested_beat(&mut self, now: Instant) -> Option<u64> {
        self.last_sent = Some(now);
        self.sequence
    }

    fn ack(&mut self, now: Instant) {
        self.last_ack = Some(now);
        if let Some(sent) = self.last_sent {
            self.latency = Some(now.saturating_duration_since(sent));
        }
        self.heartbeat_acked = true;
    }

    /// RESUME when there is a session to pick up, IDENTIFY otherwise.
    fn handshake(
        &mut self,
        token: &str,
        config: &GatewayConfig,
    ) -> Result<(Opcode, Value), ClientError> {
        if let (Some(session_id), Some(seq)) = (&self.session_id, self.sequence) {
            let resume = Resume {
                token: token.to_string(),
                session_id: session_id.clone(),
                seq,
            };
            self.status = SessionStatus::Resuming;
            return Ok((Opcode::Resume, serde_json::to_value(resume)?));
        }

        let identify = Identify {
            token: token.to_string(),
            properties: config.properties.clone(),
            compress: config.payload_compression,
            large_threshold: config.large_threshold,
            shard: config.shard,
            presence: config.presence.clone(),
            guild_subscriptions: config.guild_subscriptions,
        };
        self.status = SessionStatus::Identifying;
        Ok((Opcode::Identify, serde_json::to_value(identify)?))
    }

    /// Validates READY against what we asked for and keeps the session id.
    fn ready(&mut self, data: &Value, config: &GatewayConfig) -> Result<(), ClientError> {
        let version = data.get("v").and_then(Value::as_u64);
        if version != Some(u64::from(config.version)) {
            return Err(ClientError::VersionMismatch {
                expected: config.version,
                received: version.unwrap_or_default(),
            });
        }

        if let Some(shard) = data.get("shard").filter(|shard| !shard.is_null()) {
            if *shard != json!(config.shard) {
                return Err(ClientError::ShardMismatch {
                    expected: config.shard,
                    received: shard.clone(),
                });
            }
        }

        self.session_id = data
            .get("session_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        self.status = SessionStatus::Ready;
        Ok(())
    }

    fn invalidate(&mut self) {
        self.session_id = None;
        self.sequence = None;
    }

    fn apply_closure(&mut self, code: Option<u16>) -> CloseKind {
        let kind = CloseKind::classify(code);
        if kind == CloseKind::Reidentify {
            self.session_id = None;
            self.sequence = None;
            self.heartbeat_interval = None;
        }
        self.status = SessionStatus::Disconnected;
        self.heartbeat_acked = false;
        kind
    }
}

/// The write half of one websocket connection.
struct Connection {
    sink: tokio::sync::Mutex<WsSink>,
    codec: Arc<dyn Codec>,
    closed: CancellationToken,
    close_code: OnceLock<u16>,
}

impl Connection {
    fn new(sink: WsSink, codec: Arc<dyn Codec>) -> Self {
        Self {
            sink: tokio::sync::Mutex::new(sink),
            codec,
            closed: CancellationToken::new(),
            close_code: OnceLock::new(),
        }
    }

    async fn send(&self, op: Opcode, data: Value) -> Result<(), ClientError> {
        let frame = self
            .codec
            .encode(&json!({ "op": op as u8, "d": data }))
            .map_err(ClientError::Encode)?;

        let mut sink = self.sink.lock().await;
        if self.closed.is_cancelled() {
            return Err(ClientError::ConnectionClosed);
        }
        log::trace!("sending {op}");
        sink.send(frame.into()).await?;
        Ok(())
    }

    /// Sends a close frame and wakes everything waiting on this connection. Only the first
    /// call does anything.
    async fn close(&self, code: u16, reason: &str) {
        let mut sink = self.sink.lock().await;
        if self.closed.is_cancelled() {
            return;
        }
        self.record_close(code);

        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        if let Err(e) = sink.send(WsMessage::Close(Some(frame))).await {
            log::debug!("failed to send close frame: {e}");
        }
        self.closed.cancel();
    }

    fn record_close(&self, code: u16) {
        let _ = self.close_code.set(code);
    }

    fn close_code(&self) -> Option<u16> {
        self.close_code.get().copied()
    }
}

struct ShardInner {
    token: String,
    config: GatewayConfig,
    gateway_url: Mutex<String>,
    state: Mutex<SessionState>,
    connection: Mutex<Option<Arc<Connection>>>,
    emitter: Arc<Emitter>,
    should_reconnect: AtomicBool,
    shutdown: CancellationToken,
}

/// One gateway session. Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct Shard {
    inner: Arc<ShardInner>,
}

/// A handle that doesn't keep the session alive. Listeners stored in the shard's own emitter
/// should hold one of these instead of a [`Shard`].
#[derive(Clone)]
pub struct WeakShard(Weak<ShardInner>);

impl WeakShard {
    pub fn upgrade(&self) -> Option<Shard> {
        self.0.upgrade().map(|inner| Shard { inner })
    }
}

impl Shard {
    pub fn new(token: impl Into<String>, config: GatewayConfig) -> Self {
        Self::with_emitter(token, config, Arc::new(Emitter::new()))
    }

    pub fn with_emitter(
        token: impl Into<String>,
        config: GatewayConfig,
        emitter: Arc<Emitter>,
    ) -> Self {
        Self {
            inner: Arc::new(ShardInner {
                token: token.into(),
                gateway_url: Mutex::new(config.url.clone()),
                config,
                state: Mutex::new(SessionState::default()),
                connection: Mutex::new(None),
                emitter,
                should_reconnect: AtomicBool::new(true),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakShard {
        WeakShard(Arc::downgrade(&self.inner))
    }

    pub fn emitter(&self) -> &Arc<Emitter> {
        &self.inner.emitter
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    pub fn status(&self) -> SessionStatus {
        self.state().status
    }

    pub fn session_id(&self) -> Option<String> {
        self.state().session_id.clone()
    }

    pub fn sequence(&self) -> Option<u64> {
        self.state().sequence
    }

    /// Round trip of the last acknowledged heartbeat.
    pub fn latency(&self) -> Option<Duration> {
        self.state().latency
    }

    /// Overrides the base URL from the config, e.g. with the one from `GET /gateway`.
    pub fn set_gateway_url(&self, url: impl Into<String>) {
        *lock(&self.inner.gateway_url) = url.into();
    }

    pub fn gateway_url(&self) -> Result<Url, ClientError> {
        let base = lock(&self.inner.gateway_url).clone();
        self.inner.config.gateway_url_for(&base)
    }

    /// Sends a raw payload over the current connection.
    pub async fn send(&self, op: Opcode, data: Value) -> Result<(), ClientError> {
        let connection = lock(&self.inner.connection)
            .clone()
            .ok_or(ClientError::ConnectionClosed)?;
        connection.send(op, data).await
    }

    pub async fn update_presence(&self, presence: &Presence) -> Result<(), ClientError> {
        self.send(Opcode::StatusUpdate, serde_json::to_value(presence)?)
            .await
    }

    pub async fn update_voice_state(&self, update: &VoiceStateUpdate) -> Result<(), ClientError> {
        self.send(Opcode::VoiceStateUpdate, serde_json::to_value(update)?)
            .await
    }

    pub async fn request_guild_members(
        &self,
        request: &RequestGuildMembers,
    ) -> Result<(), ClientError> {
        self.send(Opcode::RequestGuildMembers, serde_json::to_value(request)?)
            .await
    }

    /// Stops the session for good. [`start`](Self::start) closes the connection with a normal
    /// code and returns `Ok(())` instead of reconnecting.
    pub fn close(&self) {
        self.inner.should_reconnect.store(false, Ordering::SeqCst);
        self.inner.shutdown.cancel();
    }

    /// Runs the session until [`close`](Self::close) is called or READY turns out to be for a
    /// different protocol version or shard. Dropped connections are reconnected after a random
    /// delay from [`GatewayConfig::reconnect_delay`].
    pub async fn start(&self) -> Result<(), ClientError> {
        let config = &self.inner.config;
        let mut decoder = FrameDecoder::new(config.codec.clone(), config.transport_compression);
        let dispatch = self.spawn_dispatcher();

        while !self.inner.shutdown.is_cancelled() {
            let result = self.run_connection(&mut decoder, &dispatch).await;
            decoder.reset();

            match result {
                Err(e) if e.is_fatal() => {
                    log::error!("gateway session stopped: {e}");
                    self.inner.should_reconnect.store(false, Ordering::SeqCst);
                    return Err(e);
                }
                Err(e) => log::warn!("gateway connection failed: {e}"),
                Ok(()) => {}
            }

            if !self.inner.should_reconnect.load(Ordering::SeqCst) {
                break;
            }

            let delay = config.reconnect_backoff();
            log::info!("reconnecting to the gateway in {delay:?}");
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.state().status = SessionStatus::Disconnected;
        Ok(())
    }

    async fn run_connection(
        &self,
        decoder: &mut FrameDecoder,
        dispatch: &DispatchQueue,
    ) -> Result<(), ClientError> {
        let url = self.gateway_url()?;
        self.state().status = SessionStatus::Connecting;
        log::info!("connecting to {url}");

        let (socket, _) = tokio::select! {
            _ = self.inner.shutdown.cancelled() => return Ok(()),
            socket = connect_async(url.as_str()) => socket?,
        };
        let (sink, mut stream) = socket.split();

        let connection = Arc::new(Connection::new(sink, self.inner.config.codec.clone()));
        *lock(&self.inner.connection) = Some(connection.clone());
        self.state().status = SessionStatus::AwaitingHello;

        let mut heartbeat = None;
        let result = loop {
            let message = tokio::select! {
                _ = self.inner.shutdown.cancelled() => {
                    connection.close(NORMAL_CLOSE_CODE, "closing").await;
                    break Ok(());
                }
                _ = connection.closed.cancelled() => break Ok(()),
                message = stream.next() => message,
            };

            let decoded = match message {
                Some(Ok(WsMessage::Text(text))) => decoder.feed(text.as_str().as_bytes()),
                Some(Ok(WsMessage::Binary(data))) => decoder.feed(&data),
                Some(Ok(WsMessage::Close(frame))) => {
                    if let Some(frame) = frame {
                        connection.record_close(u16::from(frame.code));
                    }
                    break Ok(());
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => break Err(e.into()),
                None => break Ok(()),
            };

            let value = match decoded {
                Ok(Some(value)) => value,
                Ok(None) => continue,
                Err(e) => {
                    log::error!("dropping gateway frame: {e}");
                    continue;
                }
            };

            let payload = match serde_json::from_value::<GatewayPayload>(value) {
                Ok(payload) => payload,
                Err(e) => {
                    log::error!("dropping gateway frame without an opcode: {e}");
                    continue;
                }
            };

            let handled = self
                .handle(&connection, payload, &mut heartbeat, dispatch)
                .await;
            if let Err(e) = handled {
                if e.is_fatal() {
                    connection.close(NORMAL_CLOSE_CODE, "closing").await;
                    break Err(e);
                }
                log::warn!("error while handling gateway payload: {e}");
            }
        };

        connection.closed.cancel();
        if let Some(task) = heartbeat.take() {
            stop_heartbeat(task).await;
        }
        *lock(&self.inner.connection) = None;

        let code = connection.close_code();
        let kind = self.state().apply_closure(code);
        log::info!("gateway connection closed with code {code:?} ({kind:?})");

        result
    }

    async fn handle(
        &self,
        connection: &Arc<Connection>,
        payload: GatewayPayload,
        heartbeat: &mut Option<JoinHandle<()>>,
        dispatch: &DispatchQueue,
    ) -> Result<(), ClientError> {
        if let Some(seq) = payload.s {
            self.state().sequence = Some(seq);
        }

        let op = match payload.opcode() {
            Ok(op) => op,
            Err(raw) => {
                log::warn!("unknown gateway opcode {raw}");
                return Ok(());
            }
        };

        match op {
            Opcode::Dispatch => {
                let event = payload.t.unwrap_or_default().to_uppercase();
                match event.as_str() {
                    "READY" => self.state().ready(&payload.d, &self.inner.config)?,
                    "RESUMED" => self.state().status = SessionStatus::Ready,
                    _ => {}
                }
                log::debug!("dispatching {event}");
                if dispatch.send((event, payload.d)).is_err() {
                    log::debug!("dispatch task is gone, dropping the event");
                }
            }
            Opcode::Heartbeat => {
                let seq = self.state().requested_beat(Instant::now());
                connection.send(Opcode::Heartbeat, json!(seq)).await?;
            }
            Opcode::Reconnect => {
                log::info!("gateway asked us to reconnect");
                self.state().invalidate();
                connection.close(NORMAL_CLOSE_CODE, "reconnect requested").await;
            }
            Opcode::InvalidSession => {
                log::info!("gateway invalidated the session");
                self.state().invalidate();
                connection.close(NORMAL_CLOSE_CODE, "session invalidated").await;
            }
            Opcode::Hello => {
                let interval = Duration::from_millis(
                    payload.d["heartbeat_interval"]
                        .as_u64()
                        .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL),
                );
                self.state().hello(interval);
                let task = self.spawn_heartbeat(connection.clone(), interval);
                if let Some(old) = heartbeat.replace(task) {
                    stop_heartbeat(old).await;
                }

                let (op, data) = self.state().handshake(&self.inner.token, &self.inner.config)?;
                connection.send(op, data).await?;
            }
            Opcode::HeartbeatAck => self.state().ack(Instant::now()),
            other => log::debug!("ignoring {other} from the gateway"),
        }

        Ok(())
    }

    fn spawn_heartbeat(&self, connection: Arc<Connection>, interval: Duration) -> JoinHandle<()> {
        let shard = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = connection.closed.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let beat = shard.state().beat(Instant::now());
                match beat {
                    Beat::Send(seq) => {
                        if let Err(e) = connection.send(Opcode::Heartbeat, json!(seq)).await {
                            log::debug!("heartbeat failed: {e}");
                            break;
                        }
                    }
                    Beat::Zombied => {
                        log::error!("last heartbeat was never acked, dropping the connection");
                        connection.close(ZOMBIED_CLOSE_CODE, "zombied connection").await;
                        break;
                    }
                }
            }
        })
    }

    /// Runs listeners off the read loop so a slow one can't hold up heartbeat acks. Events
    /// still reach the emitter one at a time, in order. The task ends once the queue is
    /// dropped and drained, or right away on [`close`](Self::close).
    fn spawn_dispatcher(&self) -> DispatchQueue {
        let (tx, mut rx) = mpsc::unbounded_channel::<(String, Value)>();
        let emitter = self.inner.emitter.clone();
        let shutdown = self.inner.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let (event, data) = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(next) => next,
                        None => break,
                    },
                };
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = emitter.emit(&event, data) => {}
                }
            }
        });
        tx
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        lock(&self.inner.state)
    }
}

async fn stop_heartbeat(task: JoinHandle<()>) {
    task.abort();
    if let Err(e) = task.await {
        if e.is_panic() {
            log::error!("heartbeat task panicked: {e}");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
