//! Generic bounded/unbounded retry-with-delay loop.
//!
//! The orchestrator waits on three external conditions: shell reachability,
//! post-provision initialisation, and build completion. Rather than
//! duplicating loop-with-sleep logic per use site, each wait is expressed as a
//! [`RetryPolicy`] consumed by [`poll_until`].

use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;

/// Describes how often and how long to retry an observation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Delay between attempts.
    pub interval: Duration,
    /// Maximum number of attempts; `None` retries until the probe succeeds or
    /// errors.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Policy that gives up after `max_attempts` probes.
    #[must_use]
    pub const fn bounded(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts: Some(max_attempts),
        }
    }

    /// Policy that retries until the probe succeeds or errors.
    #[must_use]
    pub const fn unbounded(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
        }
    }
}

/// Errors surfaced by [`poll_until`].
#[derive(Debug, Error)]
pub enum PollError<E>
where
    E: std::error::Error + 'static,
{
    /// Raised when a bounded policy is exhausted without success.
    #[error("condition not met after {attempts} attempts")]
    Timeout {
        /// Number of probes made before giving up.
        attempts: u32,
    },
    /// Raised when the probe itself fails; retries only observe, they never
    /// paper over probe errors.
    #[error("readiness probe failed: {0}")]
    Probe(#[source] E),
}

/// Repeatedly evaluates `probe`, sleeping `policy.interval` between attempts,
/// until it reports `true`.
///
/// # Errors
///
/// Returns [`PollError::Timeout`] when a bounded policy is exhausted, or
/// [`PollError::Probe`] when the probe returns an error.
pub async fn poll_until<E, F>(policy: RetryPolicy, mut probe: F) -> Result<(), PollError<E>>
where
    E: std::error::Error + 'static,
    F: FnMut() -> Result<bool, E>,
{
    let mut attempts: u32 = 0;
    loop {
        if probe().map_err(PollError::Probe)? {
            return Ok(());
        }

        attempts = attempts.saturating_add(1);
        if let Some(max) = policy.max_attempts
            && attempts >= max
        {
            return Err(PollError::Timeout { attempts });
        }

        sleep(policy.interval).await;
    }
}
