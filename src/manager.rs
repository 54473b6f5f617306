use crate::config::{ConfigError, GatewayConfig};
use crate::consumer::{LifecycleEvent, RawEventConsumer};
use crate::error::Error;
use crate::metrics::Metrics;
use crate::protocol::PresenceUpdate;
use crate::shard::{ShardClient, ShardState};
use futures_util::future::join_all;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Runs a fixed set of shards over one gateway.
///
/// # Thread Safety
///
/// `GatewayManager` is `Send + Sync` and all methods can be called from
/// multiple tasks concurrently.
pub struct GatewayManager<C: RawEventConsumer> {
    consumer: Arc<C>,
    config: Arc<GatewayConfig>,
    metrics: Arc<Metrics>,
    shard_count: u32,
    /// Shards keyed by id; iteration order is start order
    shards: BTreeMap<u32, ShardClient<C>>,
    running: AtomicBool,
    /// Serializes `start` calls. A tokio mutex so it can be held across awaits.
    lifecycle_lock: Mutex<()>,
}

impl<C: RawEventConsumer> GatewayManager<C> {
    /// Create a manager for `shard_ids` out of `shard_count` total shards.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if no ids are given or any id is not
    /// below `shard_count`.
    pub fn new(
        url: impl Into<String>,
        shard_ids: impl IntoIterator<Item = u32>,
        shard_count: u32,
        config: GatewayConfig,
        consumer: C,
    ) -> Result<Self, Error> {
        let url = url.into();
        let config = Arc::new(config);
        let consumer = Arc::new(consumer);
        let metrics = Arc::new(Metrics::new());

        let mut shards = BTreeMap::new();
        for shard_id in shard_ids {
            if shard_id >= shard_count {
                return Err(ConfigError::InvalidSharding(format!(
                    "shard id {} is out of range for {} shards",
                    shard_id, shard_count
                ))
                .into());
            }
            shards.entry(shard_id).or_insert_with(|| {
                ShardClient::new(
                    shard_id,
                    shard_count,
                    url.clone(),
                    config.clone(),
                    consumer.clone(),
                    metrics.clone(),
                )
            });
        }

        if shards.is_empty() {
            return Err(ConfigError::InvalidSharding("at least one shard id is required".to_string()).into());
        }

        Ok(Self {
            consumer,
            config,
            metrics,
            shard_count,
            shards,
            running: AtomicBool::new(false),
            lifecycle_lock: Mutex::new(()),
        })
    }

    /// Create a manager running every shard of `shard_count`.
    pub fn all_shards(
        url: impl Into<String>,
        shard_count: u32,
        config: GatewayConfig,
        consumer: C,
    ) -> Result<Self, Error> {
        Self::new(url, 0..shard_count, shard_count, config, consumer)
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn consumer(&self) -> &Arc<C> {
        &self.consumer
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    pub fn shard_ids(&self) -> Vec<u32> {
        self.shards.keys().copied().collect()
    }

    pub fn shard(&self, shard_id: u32) -> Option<&ShardClient<C>> {
        self.shards.get(&shard_id)
    }

    pub fn shards(&self) -> impl Iterator<Item = &ShardClient<C>> {
        self.shards.values()
    }

    /// Start every shard in ascending id order, one at a time.
    ///
    /// Each shard must reach READY before the next begins, and every start
    /// after the first waits `start_stagger`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyRunning`] if the manager is running. If a
    /// shard fails to start, its error is returned and the shards already
    /// started keep running; call [`close`](Self::close) to stop them.
    pub async fn start(&self) -> Result<(), Error> {
        let _lifecycle_guard = self.lifecycle_lock.lock().await;

        if self.running.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyRunning);
        }

        info!(
            "Starting GatewayManager with {} of {} shards",
            self.shards.len(),
            self.shard_count
        );
        self.consumer.on_lifecycle(LifecycleEvent::GatewayStarting);

        let stagger = self.config.sharding.start_stagger;
        for (index, shard) in self.shards.values().enumerate() {
            if index > 0 {
                debug!(
                    "[SHARD-{}] Waiting {:?} before starting",
                    shard.shard_id(),
                    stagger
                );
                tokio::time::sleep(stagger).await;
            }

            if !self.is_running() {
                warn!("GatewayManager closed during start");
                return Err(Error::ShuttingDown);
            }

            if let Err(e) = shard.start().await {
                error!("[SHARD-{}] Failed to start: {}", shard.shard_id(), e);
                return Err(e);
            }
        }

        self.consumer.on_lifecycle(LifecycleEvent::GatewayStarted);
        info!("GatewayManager started");
        Ok(())
    }

    /// Wait for every shard's supervising task to finish.
    ///
    /// All shards are awaited; the first error (by shard id) is returned.
    pub async fn join(&self) -> Result<(), Error> {
        let results = join_all(self.shards.values().map(|shard| shard.join())).await;
        results.into_iter().collect()
    }

    /// Close every shard concurrently and wait for them. No-op unless running.
    pub async fn close(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let shards: Vec<_> = self.shards.values().cloned().collect();
        close_shards(shards, self.consumer.clone()).await;
    }

    /// Begin closing in the background and return the task doing it.
    pub fn close_without_waiting(&self) -> JoinHandle<()> {
        let was_running = self.running.swap(false, Ordering::AcqRel);
        let shards: Vec<_> = self.shards.values().cloned().collect();
        let consumer = self.consumer.clone();

        tokio::spawn(async move {
            if was_running {
                close_shards(shards, consumer).await;
            }
        })
    }

    /// Mean heartbeat latency in seconds over shards that are identified.
    ///
    /// NaN when no such shard has a measurement yet.
    pub fn latency(&self) -> f64 {
        mean_latency(
            self.shards
                .values()
                .map(|shard| (shard.state(), shard.latency())),
        )
    }

    /// Apply `update` on every shard that is waiting for or past READY.
    ///
    /// Every eligible shard is attempted; the first error is returned.
    pub async fn update_presence(&self, update: PresenceUpdate) -> Result<(), Error> {
        let eligible: Vec<_> = self
            .shards
            .values()
            .filter(|shard| accepts_presence(shard.state()))
            .collect();

        debug!("Updating presence on {} shards", eligible.len());

        let results = join_all(
            eligible
                .into_iter()
                .map(|shard| shard.update_presence(update.clone())),
        )
        .await;
        results.into_iter().collect()
    }
}

async fn close_shards<C: RawEventConsumer>(shards: Vec<ShardClient<C>>, consumer: Arc<C>) {
    info!("Stopping GatewayManager");
    consumer.on_lifecycle(LifecycleEvent::GatewayStopping);

    join_all(shards.iter().map(|shard| shard.close())).await;

    consumer.on_lifecycle(LifecycleEvent::GatewayStopped);
    info!("GatewayManager stopped");
}

fn accepts_presence(state: ShardState) -> bool {
    matches!(state, ShardState::WaitingForReady | ShardState::Ready)
}

pub(crate) fn mean_latency(samples: impl IntoIterator<Item = (ShardState, f64)>) -> f64 {
    let (sum, count) = samples
        .into_iter()
        .filter(|(state, latency)| accepts_presence(*state) && !latency.is_nan())
        .fold((0.0, 0u32), |(sum, count), (_, latency)| (sum + latency, count + 1));

    if count == 0 {
        f64::NAN
    } else {
        sum / f64::from(count)
    }
}

impl<C: RawEventConsumer> Drop for GatewayManager<C> {
    fn drop(&mut self) {
        // Abort shard tasks to prevent orphaned connections
        for shard in self.shards.values() {
            shard.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShardingConfig;
    use parking_lot::Mutex as SyncMutex;
    use serde_json::Value;
    use tokio::time::Duration;

    #[derive(Default)]
    struct LifecycleRecorder {
        events: SyncMutex<Vec<LifecycleEvent>>,
    }

    impl RawEventConsumer for LifecycleRecorder {
        fn process_raw_event(&self, _shard_id: u32, _event_name: &str, _payload: Value) {}

        fn on_lifecycle(&self, event: LifecycleEvent) {
            self.events.lock().push(event);
        }
    }

    fn config() -> GatewayConfig {
        GatewayConfig::builder().token("token").build().unwrap()
    }

    #[test]
    fn test_new_rejects_bad_shard_ids() {
        let err = GatewayManager::new("ws://localhost", [0, 4], 4, config(), LifecycleRecorder::default())
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(ConfigError::InvalidSharding(_))));

        let err = GatewayManager::new("ws://localhost", [], 4, config(), LifecycleRecorder::default())
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(ConfigError::InvalidSharding(_))));
    }

    #[test]
    fn test_shards_are_ordered_and_deduplicated() {
        let manager =
            GatewayManager::new("ws://localhost", [5, 1, 3, 1], 8, config(), LifecycleRecorder::default())
                .unwrap();

        assert_eq!(manager.shard_ids(), vec![1, 3, 5]);
        assert_eq!(manager.shard(3).unwrap().shard_count(), 8);
        assert!(manager.shard(2).is_none());
        assert!(manager.latency().is_nan());
    }

    #[test]
    fn test_mean_latency() {
        use ShardState::*;

        assert!(mean_latency([]).is_nan());
        assert!(mean_latency([(Ready, f64::NAN)]).is_nan());

        // Shards that are not identified do not count
        let latency = mean_latency([
            (Ready, 0.1),
            (WaitingForReady, 0.3),
            (Connecting, 5.0),
            (Resuming, 5.0),
            (Ready, f64::NAN),
        ]);
        assert!((latency - 0.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_close_when_not_running_is_noop() {
        let manager =
            GatewayManager::all_shards("ws://localhost", 2, config(), LifecycleRecorder::default()).unwrap();

        manager.close().await;
        manager.close_without_waiting().await.unwrap();

        assert!(manager.consumer().events.lock().is_empty());
        assert!(manager.join().await.is_ok());
    }

    #[tokio::test]
    async fn test_update_presence_skips_idle_shards() {
        let manager =
            GatewayManager::all_shards("ws://localhost", 2, config(), LifecycleRecorder::default()).unwrap();

        manager
            .update_presence(PresenceUpdate::default().afk(true))
            .await
            .unwrap();

        assert!(manager.shards().all(|shard| shard.presence().is_none()));
    }

    #[tokio::test]
    async fn test_failed_start_reports_error() {
        let config = GatewayConfig::builder()
            .token("token")
            .sharding(ShardingConfig {
                start_stagger: Duration::from_millis(1),
                ..Default::default()
            })
            .build()
            .unwrap();
        let manager = GatewayManager::new("not a url", [0], 1, config, LifecycleRecorder::default()).unwrap();

        assert!(manager.start().await.is_err());
        assert!(matches!(manager.start().await, Err(Error::AlreadyRunning)));

        manager.close().await;
        assert!(!manager.is_running());
        assert_eq!(
            *manager.consumer().events.lock(),
            vec![
                LifecycleEvent::GatewayStarting,
                LifecycleEvent::GatewayStopping,
                LifecycleEvent::GatewayStopped,
            ]
        );
    }
}
