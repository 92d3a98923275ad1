//! Backoff for lookups at the external key authority.
//!
//! Only [`ProviderError::Transient`] failures are retried. A revoked key or a
//! malformed answer comes back from the first attempt, since asking again
//! cannot change it.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::provider::ProviderError;
use crate::types::KeyId;

/// Each delay is this many times the previous one.
const GROWTH: u32 = 2;

/// Delays are spread over `delay * (1 ± JITTER)`.
const JITTER: f64 = 0.1;

/// How often and how patiently a key lookup is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    /// Retries after the first failed lookup (0 = look up once).
    pub retries: u32,
    /// Delay before the first retry.
    pub initial: Duration,
    /// Upper bound on any single delay.
    pub max: Duration,
}

impl Backoff {
    /// Create a backoff policy.
    #[must_use]
    pub const fn new(retries: u32, initial: Duration, max: Duration) -> Self {
        Self {
            retries,
            initial,
            max,
        }
    }

    /// Look up once, never retry.
    #[must_use]
    pub const fn none() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }

    /// Delay before retry number `retry` (1-based), without jitter.
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = GROWTH.saturating_pow(retry.saturating_sub(1));
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// [`delay`](Self::delay) spread by jitter; `random` is clamped to
    /// `0.0..=1.0`.
    #[must_use]
    pub fn jittered(&self, retry: u32, random: f64) -> Duration {
        let base = self.delay(retry);
        let factor = 1.0 - JITTER + 2.0 * JITTER * random.clamp(0.0, 1.0);
        Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(base)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500), Duration::from_secs(30))
    }
}

/// Run `lookup` for `key_id`, retrying transient failures per `backoff`.
///
/// # Errors
///
/// Returns the first non-transient [`ProviderError`], or the last transient
/// one once the retries are used up.
pub async fn lookup_with_backoff<T, F, Fut>(
    backoff: &Backoff,
    key_id: KeyId,
    mut lookup: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut retry: u32 = 0;
    loop {
        match lookup().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_retryable() && retry < backoff.retries => {
                retry = retry.saturating_add(1);
                let delay = backoff.jittered(retry, rand::random::<f64>());
                tracing::debug!(%key_id, retry, ?delay, %error, "retrying key lookup");
                tokio::time::sleep(delay).await;
            },
            Err(error) => return Err(error),
        }
    }
}
