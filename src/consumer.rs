use serde_json::Value;

/// Lifecycle notifications for shards and the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The manager is about to start its first shard
    GatewayStarting,
    /// Every shard has reached READY
    GatewayStarted,
    /// The manager is closing all shards
    GatewayStopping,
    /// Every shard has stopped
    GatewayStopped,
    /// A shard's supervising task started
    ShardStarting { shard_id: u32 },
    /// A shard reached READY for the first time since it was started
    ShardStarted { shard_id: u32 },
    /// A shard was asked to stop
    ShardStopping { shard_id: u32 },
    /// A shard's supervising task finished
    ShardStopped { shard_id: u32 },
}

/// Trait that users implement to receive gateway events.
///
/// Every DISPATCH payload is forwarded untouched, in socket order per shard,
/// along with the synthetic `CONNECTED` and `DISCONNECTED` events emitted
/// around each socket. Calls happen synchronously on the shard's task and
/// may come from many shards at once, so implementations must be cheap and
/// must not block; hand work off to a channel if it is not.
///
/// # Example
///
/// ```ignore
/// use ws_gateway_client::RawEventConsumer;
/// use serde_json::Value;
/// use tokio::sync::mpsc;
///
/// struct Forwarder(mpsc::UnboundedSender<(u32, String, Value)>);
///
/// impl RawEventConsumer for Forwarder {
///     fn process_raw_event(&self, shard_id: u32, event_name: &str, payload: Value) {
///         let _ = self.0.send((shard_id, event_name.to_string(), payload));
///     }
/// }
/// ```
pub trait RawEventConsumer: Send + Sync + 'static {
    /// Called for every dispatched event.
    fn process_raw_event(&self, shard_id: u32, event_name: &str, payload: Value);

    /// Called on shard and manager lifecycle changes.
    fn on_lifecycle(&self, _event: LifecycleEvent) {}
}

impl<T: RawEventConsumer + ?Sized> RawEventConsumer for std::sync::Arc<T> {
    fn process_raw_event(&self, shard_id: u32, event_name: &str, payload: Value) {
        (**self).process_raw_event(shard_id, event_name, payload)
    }

    fn on_lifecycle(&self, event: LifecycleEvent) {
        (**self).on_lifecycle(event)
    }
}
