//! Bounded reconnect with a constant inter-attempt delay.

use crate::error::{InstrumentError, InstrumentResult};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::sleep;

/// Defines a policy for retrying an operation.
///
/// Specifies how many times to try a failed operation and how long to wait
/// between attempts. The transport uses it to reopen a closed serial link
/// before each read or write.
///
/// # Example
///
/// ```rust
/// use labctl_core::error_recovery::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy {
///     max_attempts: 5,
///     backoff_delay: Duration::from_millis(200),
/// };
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// The maximum number of attempts. Zero disables reconnecting entirely.
    pub max_attempts: u32,

    /// The delay between attempts.
    ///
    /// Uses a constant backoff strategy; the adaptive poll interval lives in
    /// [`crate::polling::PollingState`].
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    /// Three attempts, one second apart.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(1000),
        }
    }
}

/// An asynchronous operation that can be retried.
///
/// Implemented by [`crate::transport::Transport`] to reopen its port.
#[async_trait]
pub trait Recoverable<E> {
    /// Attempts to recover from a failure.
    ///
    /// Returns `Ok(())` if recovery succeeds, or `Err(E)` if it fails.
    async fn recover(&mut self) -> Result<(), E>;
}

/// Retries `recoverable` according to `policy`.
///
/// Sleeps `backoff_delay` between attempts, never after the last one. The
/// error of the final attempt is returned when every attempt fails.
pub async fn handle_recoverable_error<T>(
    recoverable: &mut T,
    policy: &RetryPolicy,
) -> InstrumentResult<()>
where
    T: Recoverable<InstrumentError> + Send,
{
    let mut last_error = None;
    for attempt in 1..=policy.max_attempts {
        match recoverable.recover().await {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::debug!(attempt, max_attempts = policy.max_attempts, error = %e, "recovery attempt failed");
                last_error = Some(e);
            }
        }
        if attempt < policy.max_attempts {
            sleep(policy.backoff_delay).await;
        }
    }
    Err(last_error.unwrap_or_else(|| {
        InstrumentError::LinkClosed("reconnect disabled by retry policy".to_string())
    }))
}
