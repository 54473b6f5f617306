//! Example: connect a set of shards and log what the gateway sends.
//!
//! Run with:
//! GATEWAY_TOKEN=... cargo run --example gateway_probe -- --shards 2

use clap::Parser;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use ws_gateway_client::{
    GatewayConfig, GatewayManager, Intents, LifecycleEvent, PresenceUpdate, RawEventConsumer,
    Status,
};

/// Connect to a gateway and print a summary of its traffic
#[derive(Parser, Debug)]
#[command(about, long_about = None)]
struct Args {
    /// Bot token
    #[arg(long, env = "GATEWAY_TOKEN", hide_env_values = true)]
    token: String,

    /// Gateway base URL
    #[arg(long, default_value = "wss://gateway.discord.gg")]
    url: String,

    /// Total number of shards
    #[arg(long, default_value_t = 1)]
    shards: u32,

    /// Disable zlib-stream transport compression
    #[arg(long)]
    no_compression: bool,

    /// Intents bitfield
    #[arg(long)]
    intents: Option<u64>,

    /// Seconds to stay connected
    #[arg(long, default_value_t = 60)]
    duration: u64,
}

/// Logs dispatches and counts them
#[derive(Default)]
struct Probe {
    events: AtomicU64,
}

impl RawEventConsumer for Probe {
    fn process_raw_event(&self, shard_id: u32, event_name: &str, payload: Value) {
        self.events.fetch_add(1, Ordering::Relaxed);
        match event_name {
            "READY" => info!(
                "[SHARD-{}] READY as {}",
                shard_id,
                payload["user"]["username"].as_str().unwrap_or("?")
            ),
            "GUILD_CREATE" => info!(
                "[SHARD-{}] Guild available: {}",
                shard_id,
                payload["name"].as_str().unwrap_or("?")
            ),
            _ => info!("[SHARD-{}] {}", shard_id, event_name),
        }
    }

    fn on_lifecycle(&self, event: LifecycleEvent) {
        info!("Lifecycle: {:?}", event);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,ws_gateway_client=debug")),
        )
        .init();

    let args = Args::parse();

    let mut builder = GatewayConfig::builder()
        .token(args.token)
        .compression(!args.no_compression);
    if let Some(bits) = args.intents {
        builder = builder.intents(Intents::from_bits(bits));
    }
    let config = builder.build()?;

    let manager = GatewayManager::all_shards(args.url, args.shards, config, Probe::default())?;

    info!("Starting {} shard(s)", args.shards);
    manager.start().await?;

    manager
        .update_presence(PresenceUpdate::default().status(Status::Idle))
        .await?;

    tokio::select! {
        _ = tokio::time::sleep(std::time::Duration::from_secs(args.duration)) => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        result = manager.join() => {
            if let Err(e) = result {
                warn!("A shard stopped: {}", e);
            }
        }
    }

    let snapshot = manager.metrics().snapshot();
    info!("Final metrics:");
    info!("  Connections: {}", snapshot.connections_total);
    info!("  Reconnections: {}", snapshot.reconnections_total);
    info!("  Events received: {}", snapshot.events_received_total);
    info!("  Mean latency: {:.3}s", manager.latency());
    info!("  Dispatches seen by consumer: {}", manager.consumer().events.load(Ordering::Relaxed));

    manager.close().await;
    info!("Manager stopped");

    Ok(())
}
