//! Bounded fixed-backoff retry policies.

use std::time::Duration;

/// Try an operation `attempts` times, sleeping `backoff` after each failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, backoff: Duration) -> Self {
        Self { attempts, backoff }
    }

    /// Lock poll on the receiver: 3 looks, 3 seconds apart.
    pub const fn lock_poll() -> Self {
        Self::new(3, Duration::from_secs(3))
    }

    /// Reconnect to the remote: 3 attempts, 10 seconds apart.
    pub const fn reconnect() -> Self {
        Self::new(3, Duration::from_secs(10))
    }

    /// Database reachability on receiver startup.
    pub const fn database() -> Self {
        Self::new(3, Duration::from_secs(10))
    }

    /// Total time spent sleeping when every attempt fails.
    pub fn window(&self) -> Duration {
        self.backoff * self.attempts
    }
}
