use crate::config::BackoffConfig;
use std::time::Duration;
use tokio::time::Instant;

/// Exponential backoff generator with relative jitter and a cap.
///
/// Each call to [`next_delay`](Self::next_delay) advances the attempt counter;
/// [`reset`](Self::reset) starts the sequence over.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay for the current attempt, then advance.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.config.delay_for_attempt(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of delays handed out since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        Some(self.next_delay())
    }
}

/// Decides how long a shard waits before its next connection attempt.
///
/// A restart that follows the previous start within `window` backs off;
/// an attempt that survived longer resets the sequence. A single attempt
/// can be exempted with [`skip_next`](Self::skip_next), used after the
/// gateway explicitly asks for a reconnect.
#[derive(Debug)]
pub(crate) struct ReconnectGate {
    backoff: ExponentialBackoff,
    window: Duration,
    last_start: Option<Instant>,
    skip_next: bool,
}

impl ReconnectGate {
    pub(crate) fn new(config: BackoffConfig, window: Duration) -> Self {
        Self {
            backoff: ExponentialBackoff::new(config),
            window,
            last_start: None,
            skip_next: false,
        }
    }

    /// Delay to sleep before the attempt starting at `now`, if any.
    pub(crate) fn delay_before_attempt(&mut self, now: Instant) -> Option<Duration> {
        let skip = std::mem::take(&mut self.skip_next);
        match self.last_start {
            Some(last) if !skip && now.saturating_duration_since(last) < self.window => {
                Some(self.backoff.next_delay())
            }
            _ => {
                self.backoff.reset();
                None
            }
        }
    }

    pub(crate) fn record_start(&mut self, now: Instant) {
        self.last_start = Some(now);
    }

    pub(crate) fn skip_next(&mut self) {
        self.skip_next = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn no_jitter() -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Some(Duration::from_secs(64)),
            multiplier: 2.0,
            jitter: 0.0,
            floor: Duration::from_millis(100),
        }
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut backoff = ExponentialBackoff::new(no_jitter());
        let first = backoff.next_delay();
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempt(), 3);

        backoff.reset();
        assert_eq!(backoff.next_delay(), first);
    }

    #[test]
    fn test_iterator_is_endless_and_capped() {
        let delays: Vec<Duration> = ExponentialBackoff::new(no_jitter()).take(10).collect();
        assert_eq!(delays[0], Duration::from_secs(1));
        assert_eq!(delays[6], Duration::from_secs(64));
        assert_eq!(delays[9], Duration::from_secs(64));
    }

    #[test]
    fn test_gate_first_attempt_is_immediate() {
        let mut gate = ReconnectGate::new(no_jitter(), Duration::from_secs(30));
        assert_eq!(gate.delay_before_attempt(Instant::now()), None);
    }

    #[test]
    fn test_gate_backs_off_on_rapid_failures() {
        let mut gate = ReconnectGate::new(no_jitter(), Duration::from_secs(30));
        let mut now = Instant::now();
        gate.delay_before_attempt(now);
        gate.record_start(now);

        // Each attempt dies five seconds after it started
        let mut previous = Duration::ZERO;
        for _ in 0..5 {
            now += Duration::from_secs(5);
            let delay = gate.delay_before_attempt(now).expect("should back off");
            assert!(delay > previous);
            previous = delay;
            now += delay;
            gate.record_start(now);
        }
    }

    #[test]
    fn test_gate_resets_after_long_lived_attempt() {
        let mut gate = ReconnectGate::new(no_jitter(), Duration::from_secs(30));
        let mut now = Instant::now();
        gate.record_start(now);

        for _ in 0..3 {
            now += Duration::from_secs(1);
            gate.delay_before_attempt(now);
            gate.record_start(now);
        }

        // Survived past the window: no delay, and the sequence starts over
        now += Duration::from_secs(31);
        assert_eq!(gate.delay_before_attempt(now), None);
        gate.record_start(now);

        now += Duration::from_secs(1);
        assert_eq!(gate.delay_before_attempt(now), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_gate_skip_next() {
        let mut gate = ReconnectGate::new(no_jitter(), Duration::from_secs(30));
        let now = Instant::now();
        gate.record_start(now);

        gate.skip_next();
        assert_eq!(gate.delay_before_attempt(now + Duration::from_secs(1)), None);
        // Only one attempt is exempt
        assert!(gate.delay_before_attempt(now + Duration::from_secs(2)).is_some());
    }

    proptest! {
        #[test]
        fn prop_delay_never_below_floor(
            attempt in 0u32..200,
            jitter in 0.0f64..0.99,
            initial_ms in 0u64..5_000,
        ) {
            let config = BackoffConfig {
                initial_delay: Duration::from_millis(initial_ms),
                jitter,
                ..no_jitter()
            };
            let delay = config.delay_for_attempt(attempt);
            prop_assert!(delay >= config.floor);
            prop_assert!(delay <= Duration::from_secs(64).max(config.floor));
        }

        #[test]
        fn prop_non_decreasing_without_jitter(multiplier in 1.0f64..4.0, steps in 1usize..80) {
            let config = BackoffConfig { multiplier, ..no_jitter() };
            let mut backoff = ExponentialBackoff::new(config);
            let mut previous = backoff.next_delay();
            for _ in 0..steps {
                let next = backoff.next_delay();
                prop_assert!(next >= previous);
                previous = next;
            }
        }
    }
}
