//! # ws-gateway-client
//!
//! A sharded client for a real-time WebSocket gateway that heartbeats,
//! resumes and reconnects on its own.
//!
//! ## Features
//!
//! - **Session resume** after drops, with IDENTIFY fallback on invalid sessions
//! - **Heartbeating** with zombie-connection detection and latency tracking
//! - **zlib-stream** transport compression with one inflate context per socket
//! - **Send rate limiting** per connection, shared by heartbeats and commands
//! - **Sharding** with staggered, ordered start-up
//! - **Auto-reconnection** with exponential backoff and jitter
//! - **Metrics** for observability
//!
//! ## Example
//!
//! ```ignore
//! use ws_gateway_client::{GatewayConfig, GatewayManager, Intents, RawEventConsumer};
//! use serde_json::Value;
//!
//! struct Printer;
//!
//! impl RawEventConsumer for Printer {
//!     fn process_raw_event(&self, shard_id: u32, event_name: &str, payload: Value) {
//!         println!("[{}] {} {}", shard_id, event_name, payload);
//!     }
//! }
//!
//! let config = GatewayConfig::builder()
//!     .token(std::env::var("GATEWAY_TOKEN")?)
//!     .intents(Intents::GUILDS | Intents::GUILD_MESSAGES)
//!     .build()?;
//!
//! let manager = GatewayManager::all_shards("wss://gateway.example.com", 2, config, Printer)?;
//! manager.start().await?;
//! manager.join().await?;
//! ```

mod backoff;
mod compression;
mod config;
mod connection;
mod consumer;
mod error;
mod health;
mod manager;
mod metrics;
mod protocol;
mod ratelimit;
mod shard;
mod transport;

pub use backoff::ExponentialBackoff;
pub use compression::ZlibStreamDecoder;
pub use config::{
    BackoffConfig, ConfigError, ConnectionConfig, GatewayConfig, GatewayConfigBuilder,
    ShardingConfig, DEFAULT_GATEWAY_VERSION,
};
pub use connection::{
    ConnectionExit, ConnectionPhase, SessionState, ShardConnection, ShardIdentity, NORMAL_CLOSURE,
};
pub use consumer::{LifecycleEvent, RawEventConsumer};
pub use error::{CloseReason, Error, ErrorKind};
pub use health::ConnectionHealth;
pub use manager::GatewayManager;
pub use metrics::{Metrics, MetricsSnapshot, ShardMetrics};
pub use protocol::{
    encode_outbound, gateway_url, Activity, CloseCode, ConnectionProperties, GatewayPayload,
    GuildMembersRequest, Intents, MemberFilter, Opcode, Presence, PresenceUpdate, Status,
    VoiceStateUpdate, MAX_PAYLOAD_SIZE,
};
pub use ratelimit::SendRateLimiter;
pub use shard::{ShardClient, ShardState};

// Re-export http types for ConnectionConfig::headers
pub use http::{HeaderName, HeaderValue};

/// Result type for ws-gateway-client operations
pub type Result<T> = std::result::Result<T, Error>;
