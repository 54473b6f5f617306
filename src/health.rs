use tokio::time::{Duration, Instant};

/// Heartbeat bookkeeping for a single gateway connection.
///
/// Shared between the heartbeat loop and the receive loop; everything here
/// is reset when the socket closes.
#[derive(Debug, Default, Clone)]
pub struct ConnectionHealth {
    /// Interval announced in HELLO
    heartbeat_interval: Option<Duration>,

    /// Time of last heartbeat sent
    last_heartbeat_sent: Option<Instant>,

    /// Time of last packet received, of any kind
    last_message_received: Option<Instant>,

    /// Round trip of the most recent acknowledged heartbeat
    heartbeat_latency: Option<Duration>,

    /// When HELLO arrived on the current socket
    connected_at: Option<Instant>,
}

impl ConnectionHealth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the HELLO handshake.
    pub fn record_hello(&mut self, interval: Duration, now: Instant) {
        self.heartbeat_interval = Some(interval);
        self.connected_at = Some(now);
    }

    pub fn record_heartbeat_sent(&mut self, now: Instant) {
        self.last_heartbeat_sent = Some(now);
    }

    pub fn record_message_received(&mut self, now: Instant) {
        self.last_message_received = Some(now);
    }

    /// Record a HEARTBEAT_ACK and update latency.
    pub fn record_heartbeat_ack(&mut self, now: Instant) {
        if let Some(sent) = self.last_heartbeat_sent {
            self.heartbeat_latency = Some(now.saturating_duration_since(sent));
        }
    }

    /// Nothing has arrived since the last heartbeat went out.
    ///
    /// Checked right before the next heartbeat, so a connection is a zombie
    /// once a full interval passes in silence.
    pub fn is_zombie(&self) -> bool {
        match (self.last_heartbeat_sent, self.last_message_received) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(sent), Some(received)) => received < sent,
        }
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval
    }

    pub fn latency(&self) -> Option<Duration> {
        self.heartbeat_latency
    }

    pub fn last_heartbeat_sent(&self) -> Option<Instant> {
        self.last_heartbeat_sent
    }

    pub fn last_message_received(&self) -> Option<Instant> {
        self.last_message_received
    }

    /// Time since HELLO, zero when not connected
    pub fn uptime(&self) -> Duration {
        self.connected_at
            .map(|at| at.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    /// Forget everything about the closed socket.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
