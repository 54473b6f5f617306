use crate::shard::ShardState;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Metrics for observability
///
/// Shared by every shard of a [`GatewayManager`](crate::GatewayManager).
/// Use `snapshot()` to get a point-in-time view of all metrics, or use
/// individual getter methods for specific values.
///
/// # Example
/// ```ignore
/// let metrics = manager.metrics();
///
/// println!("Events received: {}", metrics.events_received());
///
/// let snapshot = metrics.snapshot();
/// ```
#[derive(Debug, Default)]
pub struct Metrics {
    connections_total: AtomicU64,
    reconnections_total: AtomicU64,
    events_received_total: AtomicU64,
    payloads_sent_total: AtomicU64,
    heartbeats_sent_total: AtomicU64,
    heartbeat_acks_total: AtomicU64,
    identifies_total: AtomicU64,
    resumes_total: AtomicU64,
    invalid_sessions_total: AtomicU64,
    zombies_total: AtomicU64,
    errors_total: AtomicU64,

    /// Per-shard metrics keyed by shard id
    shard_metrics: RwLock<BTreeMap<u32, ShardMetrics>>,
}

/// Metrics for a single shard
#[derive(Debug, Clone)]
pub struct ShardMetrics {
    /// Shard identifier
    pub shard_id: u32,
    /// Last observed supervisor state
    pub state: ShardState,
    /// Whether a socket is currently open
    pub is_connected: bool,
    /// Duration since the socket was opened (None if never connected)
    pub time_since_connected: Option<Duration>,
    /// Duration since the last dispatch (None if no events yet)
    pub time_since_last_event: Option<Duration>,
    /// Reconnections since the shard was started
    pub reconnect_count: u64,
    /// Most recent heartbeat round trip
    pub latency: Option<Duration>,
    /// Total connected time for this shard
    pub total_uptime: Duration,
    #[doc(hidden)]
    pub(crate) last_connected_at: Option<Instant>,
    #[doc(hidden)]
    pub(crate) last_event_at: Option<Instant>,
}

impl ShardMetrics {
    fn new(shard_id: u32) -> Self {
        Self {
            shard_id,
            state: ShardState::NotRunning,
            is_connected: false,
            time_since_connected: None,
            time_since_last_event: None,
            reconnect_count: 0,
            latency: None,
            total_uptime: Duration::ZERO,
            last_connected_at: None,
            last_event_at: None,
        }
    }

    fn snapshot(&self) -> ShardMetrics {
        ShardMetrics {
            time_since_connected: self.last_connected_at.map(|t| t.elapsed()),
            time_since_last_event: self.last_event_at.map(|t| t.elapsed()),
            ..self.clone()
        }
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    // ========== Getters ==========

    /// Get total sockets opened
    pub fn connections(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    /// Get total reconnections
    pub fn reconnections(&self) -> u64 {
        self.reconnections_total.load(Ordering::Relaxed)
    }

    /// Get total DISPATCH events received
    pub fn events_received(&self) -> u64 {
        self.events_received_total.load(Ordering::Relaxed)
    }

    /// Get total frames sent
    pub fn payloads_sent(&self) -> u64 {
        self.payloads_sent_total.load(Ordering::Relaxed)
    }

    pub fn heartbeats_sent(&self) -> u64 {
        self.heartbeats_sent_total.load(Ordering::Relaxed)
    }

    pub fn heartbeat_acks(&self) -> u64 {
        self.heartbeat_acks_total.load(Ordering::Relaxed)
    }

    pub fn identifies(&self) -> u64 {
        self.identifies_total.load(Ordering::Relaxed)
    }

    pub fn resumes(&self) -> u64 {
        self.resumes_total.load(Ordering::Relaxed)
    }

    pub fn invalid_sessions(&self) -> u64 {
        self.invalid_sessions_total.load(Ordering::Relaxed)
    }

    /// Get total connections dropped for missing heartbeat acks
    pub fn zombies(&self) -> u64 {
        self.zombies_total.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors_total.load(Ordering::Relaxed)
    }

    // ========== Recording methods (called internally) ==========

    pub(crate) fn record_connection(&self, shard_id: u32) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.update_shard(shard_id, |s| {
            s.is_connected = true;
            s.last_connected_at = Some(Instant::now());
        });
    }

    pub(crate) fn record_disconnection(&self, shard_id: u32) {
        self.update_shard(shard_id, |s| {
            if s.is_connected {
                if let Some(at) = s.last_connected_at {
                    s.total_uptime += at.elapsed();
                }
            }
            s.is_connected = false;
            s.latency = None;
        });
    }

    pub(crate) fn record_reconnection(&self, shard_id: u32) {
        self.reconnections_total.fetch_add(1, Ordering::Relaxed);
        self.update_shard(shard_id, |s| s.reconnect_count += 1);
    }

    pub(crate) fn record_event(&self, shard_id: u32) {
        self.events_received_total.fetch_add(1, Ordering::Relaxed);
        self.update_shard(shard_id, |s| s.last_event_at = Some(Instant::now()));
    }

    pub(crate) fn record_payload_sent(&self) {
        self.payloads_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_heartbeat(&self) {
        self.heartbeats_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_heartbeat_ack(&self, shard_id: u32, latency: Option<Duration>) {
        self.heartbeat_acks_total.fetch_add(1, Ordering::Relaxed);
        self.update_shard(shard_id, |s| s.latency = latency);
    }

    pub(crate) fn record_identify(&self) {
        self.identifies_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_resume(&self) {
        self.resumes_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_invalid_session(&self) {
        self.invalid_sessions_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_zombie(&self) {
        self.zombies_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_state(&self, shard_id: u32, state: ShardState) {
        self.update_shard(shard_id, |s| s.state = state);
    }

    /// Update metrics for a specific shard, creating its entry on first use
    pub(crate) fn update_shard(&self, shard_id: u32, update_fn: impl FnOnce(&mut ShardMetrics)) {
        let mut shards = self.shard_metrics.write();
        let entry = shards
            .entry(shard_id)
            .or_insert_with(|| ShardMetrics::new(shard_id));
        update_fn(entry);
    }

    /// Get a snapshot of all shard metrics with computed durations
    pub fn shard_metrics(&self) -> Vec<ShardMetrics> {
        self.shard_metrics.read().values().map(ShardMetrics::snapshot).collect()
    }

    /// Get current open socket count
    pub fn active_connections(&self) -> usize {
        self.shard_metrics
            .read()
            .values()
            .filter(|s| s.is_connected)
            .count()
    }

    /// Get a point-in-time snapshot of all metrics for export
    pub fn snapshot(&self) -> MetricsSnapshot {
        // Take the shard lock once to ensure consistency
        let shards = self.shard_metrics.read();
        let shard_snapshots: Vec<ShardMetrics> = shards.values().map(ShardMetrics::snapshot).collect();

        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Acquire),
            reconnections_total: self.reconnections_total.load(Ordering::Acquire),
            events_received_total: self.events_received_total.load(Ordering::Acquire),
            payloads_sent_total: self.payloads_sent_total.load(Ordering::Acquire),
            heartbeats_sent_total: self.heartbeats_sent_total.load(Ordering::Acquire),
            heartbeat_acks_total: self.heartbeat_acks_total.load(Ordering::Acquire),
            identifies_total: self.identifies_total.load(Ordering::Acquire),
            resumes_total: self.resumes_total.load(Ordering::Acquire),
            invalid_sessions_total: self.invalid_sessions_total.load(Ordering::Acquire),
            zombies_total: self.zombies_total.load(Ordering::Acquire),
            errors_total: self.errors_total.load(Ordering::Acquire),
            active_connections: shard_snapshots.iter().filter(|s| s.is_connected).count(),
            shards: shard_snapshots,
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub reconnections_total: u64,
    pub events_received_total: u64,
    pub payloads_sent_total: u64,
    pub heartbeats_sent_total: u64,
    pub heartbeat_acks_total: u64,
    pub identifies_total: u64,
    pub resumes_total: u64,
    pub invalid_sessions_total: u64,
    pub zombies_total: u64,
    pub errors_total: u64,
    pub active_connections: usize,
    pub shards: Vec<ShardMetrics>,
}
