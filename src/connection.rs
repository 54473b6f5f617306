use crate::compression::ZlibStreamDecoder;
use crate::config::{ConnectionConfig, GatewayConfig};
use crate::consumer::RawEventConsumer;
use crate::error::{CloseReason, Error};
use crate::health::ConnectionHealth;
use crate::metrics::Metrics;
use crate::protocol::{
    encode_outbound, gateway_url, CloseCode, ConnectionProperties, GatewayPayload,
    GuildMembersRequest, Identify, Opcode, Presence, Resume, VoiceStateUpdate,
};
use crate::ratelimit::SendRateLimiter;
use crate::transport::{open_websocket, WsStream};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

type WsSink = SplitSink<WsStream, Message>;

/// Close code used when the client shuts a connection down
pub const NORMAL_CLOSURE: u16 = 1000;

/// Who a shard is within the fleet.
#[derive(Clone)]
pub struct ShardIdentity {
    pub shard_id: u32,
    pub shard_count: u32,
    token: String,
}

impl ShardIdentity {
    pub fn new(shard_id: u32, shard_count: u32, token: impl Into<String>) -> Self {
        Self {
            shard_id,
            shard_count,
            token: token.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl std::fmt::Debug for ShardIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardIdentity")
            .field("shard_id", &self.shard_id)
            .field("shard_count", &self.shard_count)
            .field("token", &"***")
            .finish()
    }
}

/// What is needed to RESUME instead of IDENTIFY.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    pub session_id: Option<String>,
    pub sequence: Option<u64>,
}

impl SessionState {
    pub fn can_resume(&self) -> bool {
        self.session_id.is_some() && self.sequence.is_some()
    }

    pub fn clear(&mut self) {
        self.session_id = None;
        self.sequence = None;
    }
}

/// Handshake progress of the current socket, observed by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    /// HELLO received, heartbeating has begun
    Hello,
    /// IDENTIFY or RESUME has been sent
    Identified { resume: bool },
    /// READY dispatched
    Ready,
    /// RESUMED dispatched
    Resumed,
}

impl ConnectionPhase {
    /// IDENTIFY or RESUME went out, so other gateway commands are accepted.
    pub fn is_identified(self) -> bool {
        matches!(
            self,
            ConnectionPhase::Identified { .. } | ConnectionPhase::Ready | ConnectionPhase::Resumed
        )
    }
}

/// Result of one [`ShardConnection::connect`] call.
#[derive(Debug)]
pub struct ConnectionExit {
    pub reason: CloseReason,
    /// Session to hand to the next attempt
    pub session: SessionState,
}

struct FrameReader {
    stream: SplitStream<WsStream>,
    decoder: ZlibStreamDecoder,
}

/// One gateway socket for one shard.
///
/// `connect` drives a socket from handshake to close and returns why it
/// ended. The same instance may be connected again afterwards; a supervisor
/// reuses it across reconnect attempts until [`close`](Self::close) is
/// called, which is permanent.
pub struct ShardConnection<C: RawEventConsumer> {
    identity: ShardIdentity,
    url: String,
    config: ConnectionConfig,
    consumer: Arc<C>,
    metrics: Arc<Metrics>,
    limiter: SendRateLimiter,
    writer: Mutex<Option<WsSink>>,
    health: parking_lot::Mutex<ConnectionHealth>,
    session: parking_lot::Mutex<SessionState>,
    connected: AtomicBool,
    disconnect_count: AtomicU64,
    closing: watch::Sender<bool>,
    phase: watch::Sender<ConnectionPhase>,
    /// Latest presence intent, read when IDENTIFY is built and after RESUMED
    presence: watch::Sender<Option<Presence>>,
}

impl<C: RawEventConsumer> ShardConnection<C> {
    pub fn new(
        identity: ShardIdentity,
        url: &str,
        config: &GatewayConfig,
        consumer: Arc<C>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, Error> {
        let url = gateway_url(url, config.version, config.connection.compression)?;
        let limiter = SendRateLimiter::new(
            format!("shard {} sends", identity.shard_id),
            config.connection.send_rate_limit,
            config.connection.send_rate_window,
        );

        Ok(Self {
            identity,
            url,
            config: config.connection.clone(),
            consumer,
            metrics,
            limiter,
            writer: Mutex::new(None),
            health: parking_lot::Mutex::new(ConnectionHealth::new()),
            session: parking_lot::Mutex::new(SessionState::default()),
            connected: AtomicBool::new(false),
            disconnect_count: AtomicU64::new(0),
            closing: watch::channel(false).0,
            phase: watch::channel(ConnectionPhase::Disconnected).0,
            presence: watch::channel(None).0,
        })
    }

    fn shard_id(&self) -> u32 {
        self.identity.shard_id
    }

    /// Connect, handshake and run until the socket ends.
    ///
    /// Fails only if this connection is already live; every other outcome is
    /// reported through [`ConnectionExit::reason`].
    pub async fn connect(&self, session: SessionState) -> Result<ConnectionExit, Error> {
        if self.connected.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyConnected {
                shard_id: self.shard_id(),
            });
        }

        *self.session.lock() = session;
        let reason = self.run().await;

        // Tear down whatever is left of the socket
        let sink = self.writer.lock().await.take();
        if let Some(mut sink) = sink {
            if timeout(self.config.close_timeout, sink.close()).await.is_err() {
                debug!("[SHARD-{}] Socket close timed out, dropping it", self.shard_id());
            }
        }

        self.health.lock().reset();
        self.metrics.record_disconnection(self.shard_id());
        self.disconnect_count.fetch_add(1, Ordering::AcqRel);
        self.connected.store(false, Ordering::Release);
        self.phase.send_replace(ConnectionPhase::Disconnected);

        debug!("[SHARD-{}] Connection ended: {}", self.shard_id(), reason);
        self.consumer
            .process_raw_event(self.shard_id(), "DISCONNECTED", json!({}));

        Ok(ConnectionExit {
            reason,
            session: self.session.lock().clone(),
        })
    }

    async fn run(&self) -> CloseReason {
        let mut closing = self.closing.subscribe();
        let mut presence = self.presence.subscribe();
        if *closing.borrow() {
            return CloseReason::ClientClosed;
        }

        self.phase.send_replace(ConnectionPhase::Connecting);
        debug!("[SHARD-{}] Connecting to {}", self.shard_id(), self.url);

        let opened = tokio::select! {
            opened = timeout(
                self.config.connect_timeout,
                open_websocket(&self.url, self.shard_id(), &self.config),
            ) => opened,
            _ = closing.wait_for(|closing| *closing) => return CloseReason::ClientClosed,
        };

        let stream = match opened {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return CloseReason::Transport(e.to_string()),
            Err(_) => {
                return CloseReason::Transport(format!(
                    "connect timed out after {:?}",
                    self.config.connect_timeout
                ))
            }
        };

        self.metrics.record_connection(self.shard_id());
        let (sink, stream) = stream.split();
        *self.writer.lock().await = Some(sink);

        let mut reader = FrameReader {
            stream,
            decoder: ZlibStreamDecoder::new(),
        };

        tokio::select! {
            reason = self.handshake_and_run(&mut reader, &mut presence) => reason,
            _ = closing.wait_for(|closing| *closing) => CloseReason::ClientClosed,
        }
    }

    async fn handshake_and_run(
        &self,
        reader: &mut FrameReader,
        presence: &mut watch::Receiver<Option<Presence>>,
    ) -> CloseReason {
        let hello = match self.receive(reader).await {
            Ok(payload) => payload,
            Err(reason) => return reason,
        };

        if hello.opcode() != Some(Opcode::Hello) {
            return CloseReason::Protocol(format!(
                "expected HELLO as the first payload, got op {}",
                hello.op
            ));
        }

        let interval = match hello.d.get("heartbeat_interval").and_then(Value::as_u64) {
            Some(ms) if ms > 0 => Duration::from_millis(ms),
            _ => return CloseReason::Protocol("HELLO without a valid heartbeat_interval".to_string()),
        };

        self.health.lock().record_hello(interval, Instant::now());
        self.phase.send_replace(ConnectionPhase::Hello);
        info!(
            "[SHARD-{}] Received HELLO, heartbeat interval {:?}",
            self.shard_id(),
            interval
        );
        self.consumer
            .process_raw_event(self.shard_id(), "CONNECTED", json!({}));

        // Whichever side finishes first decides how the connection ends
        tokio::select! {
            reason = self.heartbeat_keep_alive(interval) => reason,
            reason = self.identify_or_resume_then_poll(reader, presence) => reason,
        }
    }

    async fn heartbeat_keep_alive(&self, interval: Duration) -> CloseReason {
        loop {
            if self.health.lock().is_zombie() {
                warn!(
                    "[SHARD-{}] Nothing received since the last heartbeat, connection is a zombie",
                    self.shard_id()
                );
                self.metrics.record_zombie();
                return CloseReason::Zombied;
            }

            let seq = self.session.lock().sequence;
            debug!("[SHARD-{}] Sending HEARTBEAT (s: {:?})", self.shard_id(), seq);

            let started = Instant::now();
            if let Err(e) = self.send_payload(Opcode::Heartbeat, &seq).await {
                return e.into();
            }
            let sent_at = Instant::now();
            self.health.lock().record_heartbeat_sent(sent_at);
            self.metrics.record_heartbeat();

            let took = sent_at - started;
            if took > interval.mul_f64(0.15) {
                warn!(
                    "[SHARD-{}] Heartbeat took {:?} to send, over 15% of the {:?} interval",
                    self.shard_id(),
                    took,
                    interval
                );
            }

            tokio::time::sleep(interval).await;
        }
    }

    async fn identify_or_resume_then_poll(
        &self,
        reader: &mut FrameReader,
        presence: &mut watch::Receiver<Option<Presence>>,
    ) -> CloseReason {
        let resume = {
            let session = self.session.lock();
            match (&session.session_id, session.sequence) {
                (Some(session_id), Some(seq)) => Some(encode_outbound(
                    Opcode::Resume,
                    &Resume {
                        token: self.identity.token(),
                        session_id,
                        seq,
                    },
                )),
                _ => None,
            }
        };
        let resuming = resume.is_some();

        let frame = match resume {
            Some(frame) => frame,
            None => encode_outbound(
                Opcode::Identify,
                &Identify {
                    token: self.identity.token(),
                    compress: false,
                    large_threshold: self.config.large_threshold,
                    properties: ConnectionProperties::default(),
                    shard: [self.identity.shard_id, self.identity.shard_count],
                    intents: self.config.intents,
                    presence: presence.borrow_and_update().as_ref().map(Presence::to_payload),
                },
            ),
        };

        let op = if resuming { Opcode::Resume } else { Opcode::Identify };
        let sent = match frame {
            Ok(text) => self.send_text(op, text).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            return e.into();
        }

        if resuming {
            self.metrics.record_resume();
            info!("[SHARD-{}] Sent RESUME, waiting for RESUMED", self.shard_id());
        } else {
            self.metrics.record_identify();
            info!("[SHARD-{}] Sent IDENTIFY, waiting for READY", self.shard_id());
        }
        self.phase
            .send_replace(ConnectionPhase::Identified { resume: resuming });

        // An update stored while IDENTIFY was in flight saw no identified phase
        if !resuming && presence.has_changed().unwrap_or(false) {
            let latest = presence.borrow_and_update().clone();
            if let Some(latest) = latest {
                if let Err(e) = self.update_presence(&latest).await {
                    return e.into();
                }
            }
        }

        loop {
            let payload = match self.receive(reader).await {
                Ok(payload) => payload,
                Err(reason) => return reason,
            };
            if let Err(reason) = self.handle_payload(payload, presence).await {
                return reason;
            }
        }
    }

    async fn handle_payload(
        &self,
        payload: GatewayPayload,
        presence: &mut watch::Receiver<Option<Presence>>,
    ) -> Result<(), CloseReason> {
        match payload.opcode() {
            Some(Opcode::Dispatch) => {
                let name = payload.t.ok_or_else(|| {
                    CloseReason::Protocol("DISPATCH without an event name".to_string())
                })?;

                {
                    let mut session = self.session.lock();
                    if let Some(seq) = payload.s {
                        session.sequence = Some(seq);
                    }
                    if name == "READY" {
                        session.session_id = payload
                            .d
                            .get("session_id")
                            .and_then(Value::as_str)
                            .map(str::to_owned);
                    }
                }

                match name.as_str() {
                    "READY" => {
                        info!(
                            "[SHARD-{}] Connection is READY (session: {:?})",
                            self.shard_id(),
                            self.session.lock().session_id
                        );
                        self.phase.send_replace(ConnectionPhase::Ready);
                    }
                    "RESUMED" => {
                        info!(
                            "[SHARD-{}] Connection has RESUMED (s: {:?})",
                            self.shard_id(),
                            self.session.lock().sequence
                        );
                        self.phase.send_replace(ConnectionPhase::Resumed);
                    }
                    _ => {}
                }

                self.metrics.record_event(self.shard_id());
                let resumed = name == "RESUMED";
                self.consumer
                    .process_raw_event(self.shard_id(), &name, payload.d);

                // RESUME carries no presence, so restore it explicitly
                if resumed {
                    let latest = presence.borrow_and_update().clone();
                    if let Some(latest) = latest {
                        self.update_presence(&latest).await?;
                    }
                }
            }
            Some(Opcode::Heartbeat) => {
                debug!("[SHARD-{}] Gateway requested a HEARTBEAT", self.shard_id());
                let seq = self.session.lock().sequence;
                self.send_payload(Opcode::Heartbeat, &seq).await?;
            }
            Some(Opcode::Reconnect) => {
                info!("[SHARD-{}] Gateway requested a reconnect", self.shard_id());
                return Err(CloseReason::MustReconnect);
            }
            Some(Opcode::InvalidSession) => {
                let resumable = payload.d.as_bool().unwrap_or(false);
                info!(
                    "[SHARD-{}] Gateway invalidated the session (resumable: {})",
                    self.shard_id(),
                    resumable
                );
                self.metrics.record_invalid_session();
                return Err(CloseReason::InvalidSession { resumable });
            }
            Some(Opcode::HeartbeatAck) => {
                let latency = {
                    let mut health = self.health.lock();
                    health.record_heartbeat_ack(Instant::now());
                    health.latency()
                };
                self.metrics.record_heartbeat_ack(self.shard_id(), latency);
                debug!(
                    "[SHARD-{}] Received HEARTBEAT_ACK (latency: {:?})",
                    self.shard_id(),
                    latency
                );
            }
            _ => {
                debug!(
                    "[SHARD-{}] Ignoring payload with op {}",
                    self.shard_id(),
                    payload.op
                );
            }
        }

        Ok(())
    }

    /// Read frames until one complete payload is available.
    async fn receive(&self, reader: &mut FrameReader) -> Result<GatewayPayload, CloseReason> {
        loop {
            let message = match reader.stream.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => return Err(self.transport_failure(e.to_string())),
                None => return Err(self.transport_failure("socket ended without a close frame".to_string())),
            };
            self.health.lock().record_message_received(Instant::now());

            let bytes = match message {
                Message::Text(text) => {
                    if reader.decoder.is_buffering() {
                        return Err(CloseReason::Protocol(
                            "expected a binary continuation frame, got text".to_string(),
                        ));
                    }
                    text.into_bytes()
                }
                Message::Binary(data) => match reader.decoder.push(&data) {
                    Ok(Some(inflated)) => inflated,
                    Ok(None) => continue,
                    Err(e) => return Err(e.into()),
                },
                Message::Close(frame) => return Err(self.close_reason(frame)),
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            };

            let payload = GatewayPayload::from_slice(&bytes).map_err(CloseReason::from)?;
            trace!(
                "[SHARD-{}] Received payload (op: {}, t: {:?}, s: {:?}, size: {})",
                self.shard_id(),
                payload.op,
                payload.t,
                payload.s,
                bytes.len()
            );
            return Ok(payload);
        }
    }

    fn is_closing(&self) -> bool {
        *self.closing.borrow()
    }

    fn transport_failure(&self, reason: String) -> CloseReason {
        if self.is_closing() {
            CloseReason::ClientClosed
        } else {
            CloseReason::Transport(reason)
        }
    }

    fn close_reason(&self, frame: Option<CloseFrame<'_>>) -> CloseReason {
        if self.is_closing() {
            return CloseReason::ClientClosed;
        }

        let (code, reason) = frame
            .map(|f| (u16::from(f.code), f.reason.into_owned()))
            .unwrap_or((1005, String::new()));
        debug!(
            "[SHARD-{}] Gateway closed the connection with code {} ({:?})",
            self.shard_id(),
            code,
            reason
        );

        match CloseCode::from_u16(code) {
            Some(known) if known.invalidates_session() => CloseReason::InvalidSession { resumable: false },
            _ => CloseReason::ServerClosed { code, reason },
        }
    }

    async fn send_payload<T: Serialize>(&self, op: Opcode, d: &T) -> Result<(), Error> {
        let text = encode_outbound(op, d)?;
        self.send_text(op, text).await
    }

    async fn send_text(&self, op: Opcode, text: String) -> Result<(), Error> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(Error::NotConnected {
                shard_id: self.shard_id(),
            });
        }

        self.limiter.acquire().await;

        let size = text.len();
        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(Error::NotConnected {
            shard_id: self.shard_id(),
        })?;
        sink.send(Message::Text(text)).await?;
        drop(writer);

        self.metrics.record_payload_sent();
        debug!(
            "[SHARD-{}] Sent payload (op: {:?}, size: {})",
            self.shard_id(),
            op,
            size
        );
        Ok(())
    }

    /// Store the presence used by the next IDENTIFY and restored after RESUMED.
    ///
    /// Nothing is sent; see [`update_presence`](Self::update_presence).
    pub fn set_presence(&self, presence: Option<Presence>) {
        self.presence.send_replace(presence);
    }

    pub fn presence(&self) -> Option<Presence> {
        self.presence.borrow().clone()
    }

    /// Send PRESENCE_UPDATE on the live socket.
    pub async fn update_presence(&self, presence: &Presence) -> Result<(), Error> {
        debug!("[SHARD-{}] Updating presence to {:?}", self.shard_id(), presence);
        self.send_payload(Opcode::PresenceUpdate, &presence.to_payload())
            .await
    }

    /// Send REQUEST_GUILD_MEMBERS; results arrive as GUILD_MEMBERS_CHUNK dispatches.
    pub async fn request_guild_members(&self, request: &GuildMembersRequest) -> Result<(), Error> {
        request.validate()?;
        debug!(
            "[SHARD-{}] Requesting members for guilds {:?}",
            self.shard_id(),
            request.guild_ids
        );
        self.send_payload(Opcode::RequestGuildMembers, request).await
    }

    /// Send VOICE_STATE_UPDATE to join, move or leave a voice channel.
    pub async fn update_voice_state(&self, update: &VoiceStateUpdate) -> Result<(), Error> {
        self.send_payload(Opcode::VoiceStateUpdate, update).await
    }

    /// Request shutdown and attempt a graceful close.
    ///
    /// The close frame gets `close_timeout` to go out; after that the socket
    /// is dropped regardless. Once closed, this connection cannot connect again.
    pub async fn close(&self, code: u16) {
        if self.closing.send_replace(true) {
            return;
        }
        debug!("[SHARD-{}] Closing connection with code {}", self.shard_id(), code);

        let frame = CloseFrame {
            code: WsCloseCode::from(code),
            reason: "".into(),
        };
        let graceful = async {
            let mut writer = self.writer.lock().await;
            match writer.as_mut() {
                Some(sink) => sink.send(Message::Close(Some(frame))).await,
                None => Ok(()),
            }
        };

        match timeout(self.config.close_timeout, graceful).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("[SHARD-{}] Close frame not sent: {}", self.shard_id(), e),
            Err(_) => warn!(
                "[SHARD-{}] Graceful close timed out after {:?}",
                self.shard_id(),
                self.config.close_timeout
            ),
        }
    }

    pub fn identity(&self) -> &ShardIdentity {
        &self.identity
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn heartbeat_latency(&self) -> Option<Duration> {
        self.health.lock().latency()
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.health.lock().heartbeat_interval()
    }

    /// Time since HELLO on the current socket
    pub fn uptime(&self) -> Duration {
        self.health.lock().uptime()
    }

    /// Reconnections made by this connection so far.
    pub fn reconnect_count(&self) -> u64 {
        let disconnects = self.disconnect_count.load(Ordering::Acquire);
        let offline = u64::from(!self.is_connected());
        disconnects.saturating_sub(offline)
    }

    /// Current session bookkeeping
    pub fn session(&self) -> SessionState {
        self.session.lock().clone()
    }

    pub fn phase(&self) -> ConnectionPhase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<ConnectionPhase> {
        self.phase.subscribe()
    }
}
