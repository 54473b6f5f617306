use crate::protocol::{CloseCode, Intents};
use http::{HeaderName, HeaderValue};
use std::collections::BTreeSet;
use std::time::Duration;

/// Default gateway protocol version
pub const DEFAULT_GATEWAY_VERSION: u8 = 6;

/// Configuration shared by every shard of a gateway client
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Bot token sent in IDENTIFY and RESUME
    pub token: String,
    /// Gateway protocol version (`v=` query parameter)
    pub version: u8,
    /// Connection-related settings
    pub connection: ConnectionConfig,
    /// Backoff settings for reconnection
    pub backoff: BackoffConfig,
    /// Shard supervision and start-up pacing
    pub sharding: ShardingConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            version: DEFAULT_GATEWAY_VERSION,
            connection: ConnectionConfig::default(),
            backoff: BackoffConfig::default(),
            sharding: ShardingConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Create a new builder for configuration
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::default()
    }
}

/// Builder for GatewayConfig
#[derive(Debug, Clone, Default)]
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl GatewayConfigBuilder {
    /// Set the bot token
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.config.token = token.into();
        self
    }

    /// Set the gateway protocol version
    pub fn version(mut self, version: u8) -> Self {
        self.config.version = version;
        self
    }

    /// Set connection configuration
    pub fn connection(mut self, config: ConnectionConfig) -> Self {
        self.config.connection = config;
        self
    }

    /// Set backoff configuration
    pub fn backoff(mut self, config: BackoffConfig) -> Self {
        self.config.backoff = config;
        self
    }

    /// Set sharding configuration
    pub fn sharding(mut self, config: ShardingConfig) -> Self {
        self.config.sharding = config;
        self
    }

    /// Enable or disable zlib-stream transport compression
    pub fn compression(mut self, enabled: bool) -> Self {
        self.config.connection.compression = enabled;
        self
    }

    /// Set the gateway intents sent in IDENTIFY
    pub fn intents(mut self, intents: Intents) -> Self {
        self.config.connection.intents = Some(intents);
        self
    }

    /// Set the member count above which guilds are sent without offline members
    pub fn large_threshold(mut self, threshold: u32) -> Self {
        self.config.connection.large_threshold = threshold;
        self
    }

    /// Route connections through a SOCKS5 or HTTP CONNECT proxy
    pub fn proxy(mut self, proxy: impl Into<String>) -> Self {
        self.config.connection.proxy = Some(proxy.into());
        self
    }

    /// Build the configuration with validation.
    pub fn build(self) -> Result<GatewayConfig, ConfigError> {
        let config = self.config;

        if config.token.trim().is_empty() {
            return Err(ConfigError::MissingToken);
        }

        config.backoff.validate()?;

        if !(50..=250).contains(&config.connection.large_threshold) {
            return Err(ConfigError::InvalidConnection(format!(
                "large_threshold must be between 50 and 250, got {}",
                config.connection.large_threshold
            )));
        }

        if config.connection.send_rate_limit == 0 || config.connection.send_rate_window.is_zero() {
            return Err(ConfigError::InvalidConnection(
                "send rate limit and window must be non-zero".to_string(),
            ));
        }

        if config.connection.connect_timeout.is_zero() {
            return Err(ConfigError::InvalidConnection(
                "connect_timeout must be non-zero".to_string(),
            ));
        }

        if config.sharding.backoff_window.is_zero() {
            return Err(ConfigError::InvalidSharding(
                "backoff_window must be non-zero".to_string(),
            ));
        }

        Ok(config)
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// No token was provided
    #[error("A gateway token is required")]
    MissingToken,
    /// Invalid backoff configuration
    #[error("Invalid backoff configuration: {0}")]
    InvalidBackoff(String),
    /// Invalid connection configuration
    #[error("Invalid connection configuration: {0}")]
    InvalidConnection(String),
    /// Invalid sharding configuration
    #[error("Invalid sharding configuration: {0}")]
    InvalidSharding(String),
}

/// Connection-related configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Request zlib-stream transport compression
    pub compression: bool,
    /// Member count above which offline guild members are omitted
    pub large_threshold: u32,
    /// Gateway intents; omitted from IDENTIFY when `None`
    pub intents: Option<Intents>,
    /// Timeout for establishing the socket and WebSocket handshake
    pub connect_timeout: Duration,
    /// How long a graceful close may take before the socket is dropped
    pub close_timeout: Duration,
    /// Frames allowed per `send_rate_window`
    pub send_rate_limit: u32,
    /// Rolling window for `send_rate_limit`
    pub send_rate_window: Duration,
    /// Optional proxy URL (socks5://host:port or http://host:port)
    pub proxy: Option<String>,
    /// Source IPs to bind outgoing connections to, assigned round-robin by shard id
    pub source_ips: Vec<String>,
    /// Verify the gateway's TLS certificate
    pub verify_tls: bool,
    /// Extra headers sent with the WebSocket upgrade request
    pub headers: Vec<(HeaderName, HeaderValue)>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            compression: true,
            large_threshold: 250,
            intents: None,
            connect_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(2),
            send_rate_limit: 120,
            send_rate_window: Duration::from_secs(60),
            proxy: None,
            source_ips: Vec::new(),
            verify_tls: true,
            headers: Vec::new(),
        }
    }
}

impl ConnectionConfig {
    /// Source IP for a shard, if any are configured
    pub fn source_ip_for_shard(&self, shard_id: u32) -> Option<&str> {
        if self.source_ips.is_empty() {
            return None;
        }
        let index = shard_id as usize % self.source_ips.len();
        self.source_ips.get(index).map(String::as_str)
    }
}

/// Backoff configuration for reconnection
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay for the first backoff
    pub initial_delay: Duration,
    /// Upper bound for any single delay; `None` grows until [`BackoffConfig::HARD_LIMIT`]
    pub max_delay: Option<Duration>,
    /// Multiplier for exponential backoff (typically 2.0)
    pub multiplier: f64,
    /// Relative jitter in `[0, 1)`; a delay `d` becomes `d * (1 ± jitter)`
    pub jitter: f64,
    /// Smallest delay ever returned
    pub floor: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Some(Duration::from_secs(64)),
            multiplier: 2.0,
            jitter: 0.25,
            floor: Duration::from_millis(100),
        }
    }
}

impl BackoffConfig {
    /// Ceiling applied when `max_delay` is `None`, so delays stay representable.
    pub const HARD_LIMIT: Duration = Duration::from_secs(24 * 60 * 60);

    /// Calculate the delay for a given attempt number (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.delay_with_sample(attempt, rand::random::<f64>())
    }

    /// Delay for `attempt` given a uniform sample in `[0, 1)`.
    pub(crate) fn delay_with_sample(&self, attempt: u32, sample: f64) -> Duration {
        let ceiling = self.max_delay.unwrap_or(Self::HARD_LIMIT).min(Self::HARD_LIMIT);
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);

        // A sample of 0.5 lands exactly on the unjittered value
        let factor = 1.0 + self.jitter * (2.0 * sample - 1.0);
        let jittered = base * factor;

        let secs = if jittered.is_finite() {
            jittered.min(ceiling.as_secs_f64())
        } else {
            ceiling.as_secs_f64()
        };

        Duration::from_secs_f64(secs.max(0.0)).max(self.floor)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.floor.is_zero() {
            return Err(ConfigError::InvalidBackoff("floor must be > 0".to_string()));
        }

        if let Some(max) = self.max_delay {
            if max < self.initial_delay {
                return Err(ConfigError::InvalidBackoff(
                    "max_delay must be >= initial_delay".to_string(),
                ));
            }
        }

        if !(self.multiplier >= 1.0) {
            return Err(ConfigError::InvalidBackoff(
                "multiplier must be >= 1".to_string(),
            ));
        }

        if !(0.0..1.0).contains(&self.jitter) {
            return Err(ConfigError::InvalidBackoff(
                "jitter must be in [0, 1)".to_string(),
            ));
        }

        Ok(())
    }
}

/// Shard supervision and start-up pacing
#[derive(Debug, Clone)]
pub struct ShardingConfig {
    /// Pause between consecutive shard starts
    pub start_stagger: Duration,
    /// Fixed delay after INVALID_SESSION or RECONNECT
    pub fast_retry_delay: Duration,
    /// A restart within this long of the previous one backs off
    pub backoff_window: Duration,
    /// Server close codes that stop the shard instead of reconnecting
    pub fatal_close_codes: BTreeSet<u16>,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            start_stagger: Duration::from_secs(5),
            fast_retry_delay: Duration::from_secs(5),
            backoff_window: Duration::from_secs(30),
            fatal_close_codes: CloseCode::DEFAULT_FATAL
                .iter()
                .map(|code| *code as u16)
                .collect(),
        }
    }
}

impl ShardingConfig {
    /// Whether a server close code should stop the shard
    pub fn is_fatal(&self, code: u16) -> bool {
        self.fatal_close_codes.contains(&code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_backoff() -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Some(Duration::from_secs(30)),
            multiplier: 2.0,
            jitter: 0.0,
            floor: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_backoff_delay_calculation() {
        let config = fixed_backoff();

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(800));

        // Should cap at max_delay
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_with_jitter_bounds() {
        let config = BackoffConfig {
            jitter: 0.5,
            ..fixed_backoff()
        };

        assert_eq!(config.delay_with_sample(2, 0.0), Duration::from_millis(200));
        assert_eq!(config.delay_with_sample(2, 0.5), Duration::from_millis(400));
        assert!(config.delay_with_sample(2, 0.999) < Duration::from_millis(600));
    }

    #[test]
    fn test_unbounded_backoff_does_not_overflow() {
        let config = BackoffConfig {
            max_delay: None,
            ..fixed_backoff()
        };

        assert_eq!(config.delay_for_attempt(5_000), BackoffConfig::HARD_LIMIT);
    }

    #[test]
    fn test_source_ip_round_robin() {
        let config = ConnectionConfig {
            source_ips: vec!["10.0.0.1".into(), "10.0.0.2".into()],
            ..Default::default()
        };

        assert_eq!(config.source_ip_for_shard(0), Some("10.0.0.1"));
        assert_eq!(config.source_ip_for_shard(3), Some("10.0.0.2"));
        assert_eq!(ConnectionConfig::default().source_ip_for_shard(3), None);
    }

    #[test]
    fn test_config_builder() {
        let config = GatewayConfig::builder()
            .token("abc")
            .compression(false)
            .large_threshold(100)
            .build()
            .expect("valid config");

        assert_eq!(config.token, "abc");
        assert!(!config.connection.compression);
        assert_eq!(config.connection.large_threshold, 100);
        assert_eq!(config.connection.send_rate_limit, 120); // default
    }

    #[test]
    fn test_config_builder_rejects_missing_token() {
        let result = GatewayConfig::builder().build();
        assert!(matches!(result, Err(ConfigError::MissingToken)));
    }

    #[test]
    fn test_config_builder_rejects_bad_backoff() {
        let result = GatewayConfig::builder()
            .token("abc")
            .backoff(BackoffConfig {
                floor: Duration::ZERO,
                ..Default::default()
            })
            .build();
        assert!(matches!(result, Err(ConfigError::InvalidBackoff(_))));

        let result = GatewayConfig::builder()
            .token("abc")
            .backoff(BackoffConfig {
                jitter: 1.5,
                ..Default::default()
            })
            .build();
        assert!(matches!(result, Err(ConfigError::InvalidBackoff(_))));
    }

    #[test]
    fn test_default_fatal_close_codes() {
        let sharding = ShardingConfig::default();

        assert!(sharding.is_fatal(4004));
        assert!(sharding.is_fatal(4014));
        // Retryable codes
        assert!(!sharding.is_fatal(4000));
        assert!(!sharding.is_fatal(4008));
        assert!(!sharding.is_fatal(1000));
    }
}
