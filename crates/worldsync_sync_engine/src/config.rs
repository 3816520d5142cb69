//! Configuration for the sync engine.

use rand::Rng;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Blob transfers allowed in flight at once, across all jobs.
    pub max_concurrent_transfers: usize,
    /// Upper bound on a single remote call.
    pub attempt_timeout: Duration,
    /// Minimum percent increase before a progress update is published.
    pub progress_step: u8,
    /// How many times settling may go back to scanning after a head moved.
    pub settle_retries: u32,
    /// Retry configuration for remote calls.
    pub retry: RetryConfig,
    /// Directory for the commit log and blob cache. `None` keeps
    /// everything in memory.
    pub state_dir: Option<PathBuf>,
}

impl EngineConfig {
    /// Creates a configuration with defaults.
    pub fn new() -> Self {
        Self {
            max_concurrent_transfers: 4,
            attempt_timeout: Duration::from_secs(30),
            progress_step: 1,
            settle_retries: 3,
            retry: RetryConfig::default(),
            state_dir: None,
        }
    }

    /// Sets the transfer concurrency.
    pub fn with_max_concurrent_transfers(mut self, n: usize) -> Self {
        self.max_concurrent_transfers = n.max(1);
        self
    }

    /// Sets the per-attempt timeout.
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Sets the progress coalescing step, in percent.
    pub fn with_progress_step(mut self, step: u8) -> Self {
        self.progress_step = step.clamp(1, 100);
        self
    }

    /// Sets the settle retry bound.
    pub fn with_settle_retries(mut self, retries: u32) -> Self {
        self.settle_retries = retries;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the state directory.
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// How the wait between attempts of one blob grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// The same wait before every retry.
    Fixed(Duration),
    /// Starts at `first` and doubles on each retry, never exceeding `cap`.
    Doubling {
        /// Wait before the first retry.
        first: Duration,
        /// Longest wait.
        cap: Duration,
    },
}

impl Backoff {
    fn base(&self, retry: u32) -> Duration {
        match *self {
            Backoff::Fixed(wait) => wait,
            Backoff::Doubling { first, cap } => {
                let factor = 1u32.checked_shl(retry - 1).unwrap_or(u32::MAX);
                first.saturating_mul(factor).min(cap)
            }
        }
    }
}

/// Randomization of each wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Jitter {
    /// Waits are exactly the backoff.
    None,
    /// Waits are uniform between half the backoff and the full backoff.
    Equal,
}

/// Retry policy for a single remote call.
///
/// The defaults suit blob transfers against a consumer cloud drive: five
/// attempts, half a second doubling to eight seconds, with equal jitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Attempts including the first.
    pub max_attempts: u32,
    /// Growth of the wait between attempts.
    pub backoff: Backoff,
    /// Randomization of each wait.
    pub jitter: Jitter,
}

/// Attempts per call by default.
pub const DEFAULT_ATTEMPTS: u32 = 5;
/// Default first wait.
pub const DEFAULT_FIRST_WAIT: Duration = Duration::from_millis(500);
/// Default longest wait.
pub const DEFAULT_WAIT_CAP: Duration = Duration::from_secs(8);

impl RetryConfig {
    /// `max_attempts` attempts with the default doubling backoff.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Doubling {
                first: DEFAULT_FIRST_WAIT,
                cap: DEFAULT_WAIT_CAP,
            },
            jitter: Jitter::Equal,
        }
    }

    /// A single attempt.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::Fixed(Duration::ZERO),
            jitter: Jitter::None,
        }
    }

    /// Sets the backoff.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the jitter.
    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Wait before attempt `attempt` (0 is the first attempt and never
    /// waits).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let base = self.backoff.base(attempt);
        match self.jitter {
            Jitter::None => base,
            Jitter::Equal => {
                let half = base / 2;
                let span = u64::try_from(half.as_nanos()).unwrap_or(u64::MAX);
                half + Duration::from_nanos(rand::thread_rng().gen_range(0..=span))
            }
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(DEFAULT_ATTEMPTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_config_builder() {
        let config = EngineConfig::new()
            .with_max_concurrent_transfers(8)
            .with_attempt_timeout(Duration::from_secs(5))
            .with_progress_step(10)
            .with_settle_retries(1)
            .with_state_dir("/tmp/ws");

        assert_eq!(config.max_concurrent_transfers, 8);
        assert_eq!(config.attempt_timeout, Duration::from_secs(5));
        assert_eq!(config.progress_step, 10);
        assert_eq!(config.settle_retries, 1);
        assert_eq!(config.state_dir, Some(PathBuf::from("/tmp/ws")));
    }

    #[test]
    fn zero_values_are_clamped() {
        let config = EngineConfig::new()
            .with_max_concurrent_transfers(0)
            .with_progress_step(0);
        assert_eq!(config.max_concurrent_transfers, 1);
        assert_eq!(config.progress_step, 1);
        assert_eq!(RetryConfig::new(0).max_attempts, 1);
    }

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.settle_retries, 3);
        assert_eq!(config.retry.max_attempts, DEFAULT_ATTEMPTS);
        assert_eq!(config.retry.jitter, Jitter::Equal);
        assert!(config.state_dir.is_none());
    }

    #[test]
    fn doubling_stops_at_the_cap() {
        let config = RetryConfig::new(10)
            .with_backoff(Backoff::Doubling {
                first: Duration::from_millis(100),
                cap: Duration::from_millis(450),
            })
            .with_jitter(Jitter::None);

        let waits: Vec<_> = (0..6).map(|a| config.delay_for_attempt(a)).collect();
        assert_eq!(
            waits,
            [0, 100, 200, 400, 450, 450].map(Duration::from_millis)
        );
        assert_eq!(config.delay_for_attempt(200), Duration::from_millis(450));
    }

    #[test]
    fn equal_jitter_stays_in_upper_half() {
        let config = RetryConfig::new(5).with_backoff(Backoff::Fixed(Duration::from_millis(200)));
        for _ in 0..50 {
            let wait = config.delay_for_attempt(3);
            assert!(wait >= Duration::from_millis(100), "{wait:?}");
            assert!(wait <= Duration::from_millis(200), "{wait:?}");
        }
    }

    #[test]
    fn single_attempt_never_waits() {
        let once = RetryConfig::once();
        assert_eq!(once.max_attempts, 1);
        assert_eq!(once.delay_for_attempt(1), Duration::ZERO);
    }
}
