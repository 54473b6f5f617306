use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

/// Bounds the number of frames sent within any rolling window.
///
/// `acquire` waits until a slot is free and consumes it. Waiters are served
/// in arrival order: the window lock is a FIFO-fair `tokio::sync::Mutex` and
/// is held while the head waiter sleeps.
#[derive(Debug)]
pub struct SendRateLimiter {
    name: String,
    limit: u32,
    period: Duration,
    sent: Mutex<VecDeque<Instant>>,
}

impl SendRateLimiter {
    pub fn new(name: impl Into<String>, limit: u32, period: Duration) -> Self {
        let limit = limit.max(1);
        Self {
            name: name.into(),
            limit,
            period,
            sent: Mutex::new(VecDeque::with_capacity(limit as usize)),
        }
    }

    /// Wait for a free slot and consume it.
    pub async fn acquire(&self) {
        let mut sent = self.sent.lock().await;

        loop {
            let now = Instant::now();
            while sent
                .front()
                .is_some_and(|oldest| *oldest + self.period <= now)
            {
                sent.pop_front();
            }

            if sent.len() < self.limit as usize {
                sent.push_back(now);
                return;
            }

            if let Some(oldest) = sent.front().copied() {
                let free_at = oldest + self.period;
                debug!(
                    "{}: send rate limit of {} per {:?} reached, waiting {:?}",
                    self.name,
                    self.limit,
                    self.period,
                    free_at - now
                );
                sleep_until(free_at).await;
            }
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}
