//! Bounded fixed-delay retry, used only while the engine process warms up.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Fixed attempt count and fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero is treated as one.
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    /// Six attempts, 500 ms apart.
    pub const ENGINE_STARTUP: Self = Self {
        attempts: 6,
        delay: Duration::from_millis(500),
    };
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::ENGINE_STARTUP
    }
}

/// The last error after every attempt failed.
#[derive(Debug)]
pub struct RetryExhausted<E> {
    pub attempts: u32,
    pub last: E,
}

/// Runs `op` until it succeeds or `policy.attempts` attempts have failed.
///
/// `op` receives the 1-based attempt number. The delay is only slept between
/// attempts, never after the last one.
pub async fn retry_fixed<T, E, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, RetryExhausted<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                debug!(attempt, attempts, error = %e, "Attempt failed, retrying");
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
            Err(last) => return Err(RetryExhausted { attempts: attempt, last }),
        }
    }
}
