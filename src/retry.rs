//! Fixed-delay retry for fallible async operations

use crate::{Error, Result};
use log::error;
use std::future::Future;
use std::time::Duration;

/// Default number of attempts before giving up
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default pause between attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1000);

/// How often and how patiently an operation is retried.
///
/// The delay is constant between attempts; there is no backoff or jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Run `operation` until it succeeds or `policy.max_attempts` attempts failed.
///
/// Each failure is logged. After the last failure the result is
/// [`Error::RetriesExhausted`] carrying the final attempt's error. A policy with
/// zero attempts is rejected without calling `operation`.
///
/// Cleaning up after a failed attempt is the operation's own job.
pub async fn execute<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if policy.max_attempts == 0 {
        return Err(Error::ConfigError(
            "retry policy needs at least one attempt".to_string(),
        ));
    }

    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                error!("Attempt {} failed: {}", attempt, err);
                if attempt >= policy.max_attempts {
                    return Err(Error::RetriesExhausted {
                        attempts: attempt,
                        last: Box::new(err),
                    });
                }
                tokio::time::sleep(policy.delay).await;
            }
        }
    }
}
