use crate::backoff::ReconnectGate;
use crate::config::GatewayConfig;
use crate::connection::{
    ConnectionExit, ConnectionPhase, SessionState, ShardConnection, ShardIdentity, NORMAL_CLOSURE,
};
use crate::consumer::{LifecycleEvent, RawEventConsumer};
use crate::error::{CloseReason, Error};
use crate::metrics::Metrics;
use crate::protocol::{CloseCode, GuildMembersRequest, Presence, PresenceUpdate, VoiceStateUpdate};
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Lifecycle of a shard supervisor.
///
/// ```text
/// NotRunning -> Connecting -> WaitingForReady | Resuming -> Ready
///                  ^                                          |
///                  +------------------ retry -----------------+
/// any running state -> Stopping -> Stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShardState {
    NotRunning,
    Connecting,
    WaitingForReady,
    Resuming,
    Ready,
    Stopping,
    Stopped,
}

impl ShardState {
    /// Whether a supervising task is active and not shutting down.
    pub fn is_running(self) -> bool {
        matches!(
            self,
            ShardState::Connecting
                | ShardState::WaitingForReady
                | ShardState::Resuming
                | ShardState::Ready
        )
    }

    pub fn can_start(self) -> bool {
        matches!(self, ShardState::NotRunning | ShardState::Stopped)
    }

    pub fn can_transition_to(self, next: ShardState) -> bool {
        use ShardState::*;

        match (self, next) {
            // The task always ends in Stopped, however it ends
            (_, Stopped) => true,
            (NotRunning | Stopped, Connecting) => true,
            (Connecting, Connecting | WaitingForReady | Resuming) => true,
            (WaitingForReady | Resuming, Ready) => true,
            (WaitingForReady | Resuming | Ready, Connecting) => true,
            (from, Stopping) => from.is_running(),
            _ => false,
        }
    }
}

/// Supervises one shard: keeps its connection alive across failures.
///
/// Cloning is cheap; clones control the same shard.
pub struct ShardClient<C: RawEventConsumer> {
    inner: Arc<ShardInner<C>>,
}

impl<C: RawEventConsumer> Clone for ShardClient<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct ShardInner<C: RawEventConsumer> {
    identity: ShardIdentity,
    url: String,
    config: Arc<GatewayConfig>,
    consumer: Arc<C>,
    metrics: Arc<Metrics>,
    state: watch::Sender<ShardState>,
    presence: RwLock<Option<Presence>>,
    /// Live while the supervising task runs
    connection: RwLock<Option<Arc<ShardConnection<C>>>>,
    /// Session as of the last finished attempt
    session: Mutex<SessionState>,
    reconnects: AtomicU64,
    task: Mutex<Option<JoinHandle<Result<(), Error>>>>,
    /// Serializes `start` calls. A tokio mutex so it can be held across awaits.
    lifecycle_lock: tokio::sync::Mutex<()>,
}

impl<C: RawEventConsumer> ShardClient<C> {
    pub fn new(
        shard_id: u32,
        shard_count: u32,
        url: impl Into<String>,
        config: Arc<GatewayConfig>,
        consumer: Arc<C>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let identity = ShardIdentity::new(shard_id, shard_count, config.token.clone());
        metrics.record_state(shard_id, ShardState::NotRunning);

        Self {
            inner: Arc::new(ShardInner {
                identity,
                url: url.into(),
                config,
                consumer,
                metrics,
                state: watch::channel(ShardState::NotRunning).0,
                presence: RwLock::new(None),
                connection: RwLock::new(None),
                session: Mutex::new(SessionState::default()),
                reconnects: AtomicU64::new(0),
                task: Mutex::new(None),
                lifecycle_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Presence sent with IDENTIFY and restored after RESUME.
    pub fn with_presence(self, presence: Presence) -> Self {
        *self.inner.presence.write() = Some(presence);
        self
    }

    /// Start supervising and wait until the shard is READY.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStarted`] if the shard is running, leaving it
    /// untouched. If the supervisor stops before the first READY, its error
    /// is returned, or [`Error::ShuttingDown`] if it was closed.
    pub async fn start(&self) -> Result<(), Error> {
        let _lifecycle_guard = self.inner.lifecycle_lock.lock().await;
        let shard_id = self.shard_id();

        let current = self.state();
        if !current.can_start() {
            return Err(Error::AlreadyStarted {
                shard_id,
                state: current,
            });
        }

        let connection = Arc::new(ShardConnection::new(
            self.inner.identity.clone(),
            &self.inner.url,
            &self.inner.config,
            self.inner.consumer.clone(),
            self.inner.metrics.clone(),
        )?);

        *self.inner.session.lock() = SessionState::default();
        self.inner.reconnects.store(0, Ordering::Release);
        {
            // Updates land either in this snapshot or on the stored connection
            let presence = self.inner.presence.read();
            connection.set_presence(presence.clone());
            *self.inner.connection.write() = Some(connection.clone());
        }

        let mut state_rx = self.inner.state.subscribe();
        self.inner.transition(ShardState::Connecting);

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move { inner.run_with_recovery(connection).await });
        *self.inner.task.lock() = Some(handle);

        let reached = state_rx
            .wait_for(|s| matches!(s, ShardState::Ready | ShardState::Stopped))
            .await
            .map(|s| *s);

        if let Ok(ShardState::Ready) = reached {
            return Ok(());
        }

        // Stopped before READY: surface the task's outcome
        let handle = self.inner.task.lock().take();
        match handle {
            Some(handle) => match handle.await {
                Ok(Ok(())) => Err(Error::ShuttingDown),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(Error::TaskFailed(e.to_string())),
            },
            None => Err(Error::ShuttingDown),
        }
    }

    /// Wait for the supervising task to finish.
    pub async fn join(&self) -> Result<(), Error> {
        let handle = self.inner.task.lock().take();
        match handle {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(e) => Err(Error::TaskFailed(e.to_string())),
            },
            None => {
                // Another caller holds the handle; wait for the state instead
                let mut state_rx = self.inner.state.subscribe();
                let _ = state_rx
                    .wait_for(|s| matches!(s, ShardState::NotRunning | ShardState::Stopped))
                    .await;
                Ok(())
            }
        }
    }

    /// Stop the shard and wait for its task. Safe to call repeatedly.
    pub async fn close(&self) {
        let shard_id = self.shard_id();
        let began = self.inner.state.send_if_modified(|state| {
            if state.is_running() {
                *state = ShardState::Stopping;
                true
            } else {
                false
            }
        });

        if began {
            info!("[SHARD-{}] Closing shard", shard_id);
            self.inner.metrics.record_state(shard_id, ShardState::Stopping);
            self.inner
                .consumer
                .on_lifecycle(LifecycleEvent::ShardStopping { shard_id });

            let connection = self.inner.connection.read().clone();
            if let Some(connection) = connection {
                connection.close(NORMAL_CLOSURE).await;
            }
        }

        if let Err(e) = self.join().await {
            debug!("[SHARD-{}] Shard task ended with error during close: {}", shard_id, e);
        }
    }

    /// Abort the supervising task without a graceful close.
    pub(crate) fn abort(&self) {
        if let Some(handle) = self.inner.task.lock().take() {
            handle.abort();
        }
    }

    /// Merge `update` into the presence and send it if the socket accepts commands.
    ///
    /// The presence is kept even when no connection is live. An update made
    /// before IDENTIFY or RESUME goes out is carried by that IDENTIFY, or
    /// restored once RESUMED arrives.
    pub async fn update_presence(&self, update: PresenceUpdate) -> Result<(), Error> {
        let (presence, connection) = {
            let mut slot = self.inner.presence.write();
            let next = update.apply_to(&slot.clone().unwrap_or_default());
            *slot = Some(next.clone());
            let connection = self.inner.connection.read().clone();
            if let Some(connection) = &connection {
                connection.set_presence(Some(next.clone()));
            }
            (next, connection)
        };

        match connection {
            Some(connection) if connection.phase().is_identified() => {
                connection.update_presence(&presence).await
            }
            _ => {
                debug!(
                    "[SHARD-{}] Presence stored, no identified connection to send it on",
                    self.shard_id()
                );
                Ok(())
            }
        }
    }

    pub async fn request_guild_members(&self, request: &GuildMembersRequest) -> Result<(), Error> {
        self.live_connection()?.request_guild_members(request).await
    }

    pub async fn update_voice_state(&self, update: &VoiceStateUpdate) -> Result<(), Error> {
        self.live_connection()?.update_voice_state(update).await
    }

    fn live_connection(&self) -> Result<Arc<ShardConnection<C>>, Error> {
        self.inner
            .connection
            .read()
            .clone()
            .filter(|c| c.is_connected())
            .ok_or(Error::NotConnected {
                shard_id: self.shard_id(),
            })
    }

    pub fn shard_id(&self) -> u32 {
        self.inner.identity.shard_id
    }

    pub fn shard_count(&self) -> u32 {
        self.inner.identity.shard_count
    }

    pub fn state(&self) -> ShardState {
        *self.inner.state.borrow()
    }

    /// Watch state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ShardState> {
        self.inner.state.subscribe()
    }

    /// Last heartbeat round trip in seconds, NaN until the first ack.
    pub fn latency(&self) -> f64 {
        self.inner
            .connection
            .read()
            .as_ref()
            .and_then(|c| c.heartbeat_latency())
            .map_or(f64::NAN, |d| d.as_secs_f64())
    }

    /// Heartbeat interval in seconds, NaN before HELLO.
    pub fn heartbeat_interval(&self) -> f64 {
        self.inner
            .connection
            .read()
            .as_ref()
            .and_then(|c| c.heartbeat_interval())
            .map_or(f64::NAN, |d| d.as_secs_f64())
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .connection
            .read()
            .as_ref()
            .is_some_and(|c| c.is_connected())
    }

    /// Time since the current socket completed HELLO
    pub fn uptime(&self) -> Duration {
        self.inner
            .connection
            .read()
            .as_ref()
            .map_or(Duration::ZERO, |c| c.uptime())
    }

    /// Reconnect attempts since the last `start`
    pub fn reconnect_count(&self) -> u64 {
        self.inner.reconnects.load(Ordering::Acquire)
    }

    pub fn session_id(&self) -> Option<String> {
        self.session().session_id
    }

    pub fn sequence(&self) -> Option<u64> {
        self.session().sequence
    }

    fn session(&self) -> SessionState {
        let connection = self.inner.connection.read().clone();
        match connection {
            Some(connection) if connection.is_connected() => connection.session(),
            _ => self.inner.session.lock().clone(),
        }
    }

    pub fn presence(&self) -> Option<Presence> {
        self.inner.presence.read().clone()
    }
}

impl<C: RawEventConsumer> ShardInner<C> {
    fn shard_id(&self) -> u32 {
        self.identity.shard_id
    }

    /// Move to `next`. Returns false when nothing changed.
    ///
    /// Panics on a transition the state machine does not allow. A pending
    /// `Stopping` is never overwritten except by `Stopped`.
    fn transition(&self, next: ShardState) -> bool {
        let mut illegal = None;
        let changed = self.state.send_if_modified(|state| {
            if *state == next || (*state == ShardState::Stopping && next != ShardState::Stopped) {
                return false;
            }
            if !state.can_transition_to(next) {
                illegal = Some(*state);
                return false;
            }
            *state = next;
            true
        });

        if let Some(from) = illegal {
            panic!(
                "[SHARD-{}] illegal state transition {:?} -> {:?}",
                self.shard_id(),
                from,
                next
            );
        }

        if changed {
            debug!("[SHARD-{}] State is now {:?}", self.shard_id(), next);
            self.metrics.record_state(self.shard_id(), next);
        }
        changed
    }

    fn is_stopping(&self) -> bool {
        !self.state.borrow().is_running()
    }

    async fn run_with_recovery(self: Arc<Self>, connection: Arc<ShardConnection<C>>) -> Result<(), Error> {
        let shard_id = self.shard_id();

        let result = match AssertUnwindSafe(self.keep_alive(&connection)).catch_unwind().await {
            Ok(result) => result,
            Err(panic_err) => {
                let panic_msg = if let Some(s) = panic_err.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_err.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic".to_string()
                };
                error!("[SHARD-{}] Supervisor PANICKED: {}", shard_id, panic_msg);
                Err(Error::TaskFailed(panic_msg))
            }
        };

        if let Err(e) = &result {
            self.metrics.record_error();
            error!("[SHARD-{}] Shard stopped with error: {}", shard_id, e);
        } else {
            info!("[SHARD-{}] Shard stopped", shard_id);
        }

        self.connection.write().take();
        self.transition(ShardState::Stopped);
        self.consumer
            .on_lifecycle(LifecycleEvent::ShardStopped { shard_id });

        result
    }

    async fn keep_alive(&self, connection: &ShardConnection<C>) -> Result<(), Error> {
        let shard_id = self.shard_id();
        let sharding = &self.config.sharding;

        info!(
            "[SHARD-{}] Starting shard ({} of {})",
            shard_id,
            shard_id + 1,
            self.identity.shard_count
        );
        self.consumer
            .on_lifecycle(LifecycleEvent::ShardStarting { shard_id });

        let mut gate = ReconnectGate::new(self.config.backoff.clone(), sharding.backoff_window);
        let mut session = SessionState::default();
        let mut fixed_delay: Option<Duration> = None;
        let mut announced = false;
        let mut first_attempt = true;

        loop {
            if self.is_stopping() {
                return Ok(());
            }

            let backoff = gate.delay_before_attempt(Instant::now());
            if let Some(delay) = fixed_delay.take().or(backoff) {
                info!("[SHARD-{}] Reconnecting in {:?}", shard_id, delay);
                if !self.sleep_unless_stopping(delay).await {
                    return Ok(());
                }
            }

            gate.record_start(Instant::now());
            if !first_attempt {
                self.reconnects.fetch_add(1, Ordering::AcqRel);
                self.metrics.record_reconnection(shard_id);
            }
            first_attempt = false;
            self.transition(ShardState::Connecting);

            let exit = self.run_attempt(connection, session, &mut announced).await?;
            session = exit.session;

            match exit.reason {
                CloseReason::ClientClosed => {
                    debug!("[SHARD-{}] Connection closed by client", shard_id);
                    *self.session.lock() = session;
                    return Ok(());
                }
                CloseReason::Transport(e) => {
                    warn!("[SHARD-{}] Connection lost: {}", shard_id, e);
                }
                CloseReason::Zombied => {
                    warn!("[SHARD-{}] Connection zombied, reconnecting", shard_id);
                }
                CloseReason::InvalidSession { resumable } => {
                    if !resumable {
                        session.clear();
                    }
                    gate.skip_next();
                    fixed_delay = Some(sharding.fast_retry_delay);
                }
                CloseReason::MustReconnect => {
                    gate.skip_next();
                    fixed_delay = Some(sharding.fast_retry_delay);
                }
                CloseReason::ServerClosed { code, reason } => {
                    if sharding.is_fatal(code) {
                        error!(
                            "[SHARD-{}] Gateway closed the connection with fatal code {}: {}",
                            shard_id, code, reason
                        );
                        *self.session.lock() = session;
                        return Err(Error::ServerClosed { code, reason });
                    }

                    match CloseCode::from_u16(code) {
                        Some(known) => info!(
                            "[SHARD-{}] Gateway closed the connection with {:?} ({}), reconnecting",
                            shard_id, known, code
                        ),
                        None => warn!(
                            "[SHARD-{}] Gateway closed the connection with unexpected code {}: {}, reconnecting",
                            shard_id, code, reason
                        ),
                    }
                }
                CloseReason::Protocol(e) => {
                    *self.session.lock() = session;
                    return Err(Error::Protocol(e));
                }
            }

            *self.session.lock() = session.clone();
        }
    }

    /// Run one connection while mirroring its handshake progress into the shard state.
    async fn run_attempt(
        &self,
        connection: &ShardConnection<C>,
        session: SessionState,
        announced: &mut bool,
    ) -> Result<ConnectionExit, Error> {
        let mut phases = connection.subscribe_phase();

        let connect = connection.connect(session);
        tokio::pin!(connect);

        loop {
            tokio::select! {
                exit = &mut connect => return exit,
                changed = phases.changed() => {
                    if changed.is_err() {
                        return (&mut connect).await;
                    }
                    let phase = *phases.borrow_and_update();
                    self.apply_phase(phase, announced);
                }
            }
        }
    }

    fn apply_phase(&self, phase: ConnectionPhase, announced: &mut bool) {
        let shard_id = self.shard_id();

        match phase {
            ConnectionPhase::Identified { resume: false } => {
                self.transition(ShardState::WaitingForReady);
            }
            ConnectionPhase::Identified { resume: true } => {
                self.transition(ShardState::Resuming);
            }
            ConnectionPhase::Ready | ConnectionPhase::Resumed => {
                // The Identified phase may have been coalesced away
                if *self.state.borrow() == ShardState::Connecting {
                    self.transition(if phase == ConnectionPhase::Ready {
                        ShardState::WaitingForReady
                    } else {
                        ShardState::Resuming
                    });
                }

                // Announce before Ready is observable to `start`
                if !*announced && !self.is_stopping() {
                    *announced = true;
                    info!("[SHARD-{}] Shard is ready", shard_id);
                    self.consumer
                        .on_lifecycle(LifecycleEvent::ShardStarted { shard_id });
                }
                self.transition(ShardState::Ready);
            }
            ConnectionPhase::Disconnected | ConnectionPhase::Connecting | ConnectionPhase::Hello => {}
        }
    }

    /// Sleep for `delay`; false if the shard began stopping meanwhile.
    async fn sleep_unless_stopping(&self, delay: Duration) -> bool {
        let mut state_rx = self.state.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = state_rx.wait_for(|s| !s.is_running()) => false,
        }
    }
}
