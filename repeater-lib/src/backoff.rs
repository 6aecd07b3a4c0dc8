//! Bounded retry with exponential backoff and full jitter.
//!
//! The caller decides which failures are worth retrying through a predicate;
//! everything else is returned on the first attempt.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

/// Connection-level error codes treated as transient.
pub const TRANSIENT_ERROR_CODES: &[&str] = &[
    "ECONNRESET",
    "ENETDOWN",
    "ENETUNREACH",
    "ETIMEDOUT",
    "ECONNREFUSED",
    "ENOTFOUND",
    "EAI_AGAIN",
    "ESOCKETTIMEDOUT",
];

/// Returns true if `code` is one of [`TRANSIENT_ERROR_CODES`].
pub fn is_transient_code(code: &str) -> bool {
    TRANSIENT_ERROR_CODES.contains(&code)
}

const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct Backoff<P> {
    max_attempts: u32,
    is_transient: P,
    base_delay: Duration,
    max_delay: Duration,
}

impl<P> Backoff<P> {
    /// `max_attempts` counts the first call; zero is treated as one.
    pub fn new(max_attempts: u32, is_transient: P) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            is_transient,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }

    pub fn with_delays(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay.max(base_delay);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Upper bound of the sleep before retry number `attempt` (1-based).
    fn delay_cap(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `operation` until it succeeds, fails with a non-transient error,
    /// or `max_attempts` calls have been made. The last error is returned.
    pub async fn execute<T, E, F, Fut>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt >= self.max_attempts || !(self.is_transient)(&err) {
                        return Err(err);
                    }

                    let cap = self.delay_cap(attempt);
                    let delay = if cap.is_zero() {
                        cap
                    } else {
                        rand::rng().random_range(Duration::ZERO..=cap)
                    };
                    debug!(
                        "Attempt {}/{} failed, retrying in {:?}",
                        attempt, self.max_attempts, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
