//! Fixed-window rate limiter
//!
//! Windows are wall-clock aligned: window `i` of length `w` covers `[i*w, (i+1)*w)` in Unix
//! milliseconds, and every process computes the same index for the same instant. Each
//! attempt increments `{rate_prefix}:{scope}:{i}`; it is granted iff the count after the
//! increment is within the limit. Denied attempts still count, so the counter reflects
//! demand, not admissions.
//!
//! Fixed windows admit up to twice the limit in a short span around a boundary (a full
//! quota at the end of one window, another at the start of the next). That burst bias is
//! accepted here; a sliding log or token bucket would be the stricter alternative.

use super::{remaining, AdmissionState};
use crate::error::{ToolkitError, ToolkitResult};
use crate::logging::log_admission_operation;
use crate::store::{RateDecision, SharedStore, StoreProvider};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// A granted rate-window increment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateGrant {
    /// Position of this call within its window, starting at 1
    pub count: u64,
    pub waited: Duration,
}

/// Grants calls against fixed-window counters
#[derive(Debug, Clone)]
pub struct RateLimiter {
    store: Arc<StoreProvider>,
    prefix: String,
}

impl RateLimiter {
    pub fn new(store: Arc<StoreProvider>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    /// Wait for a slot in the current (or a later) window
    ///
    /// A denied caller sleeps until the window it was denied in ends. If that is past the
    /// timeout it fails straight away instead of sleeping into a certain timeout.
    pub async fn acquire(
        &self,
        scope_key: &str,
        limit: u64,
        window: Duration,
        timeout: Option<Duration>,
    ) -> ToolkitResult<RateGrant> {
        let key = format!("{}:{}", self.prefix, scope_key);
        let started = Instant::now();
        let mut denials: u32 = 0;

        loop {
            match self.store.try_acquire_rate(&key, limit, window).await? {
                RateDecision::Allowed { count } => {
                    let waited = started.elapsed();
                    if waited.is_zero() {
                        debug!(key = %key, count = count, limit = limit, "Rate window admitted");
                    } else {
                        log_admission_operation(
                            "rate",
                            &key,
                            AdmissionState::Admitted.as_str(),
                            Some(waited),
                            None,
                        );
                    }
                    return Ok(RateGrant { count, waited });
                }
                RateDecision::Denied { count, retry_after } => {
                    if let Some(left) = remaining(started, timeout) {
                        if retry_after > left {
                            let waited = started.elapsed();
                            warn!(
                                key = %key,
                                count = count,
                                limit = limit,
                                retry_after_ms = retry_after.as_millis() as u64,
                                "Rate limit admission timed out"
                            );
                            log_admission_operation(
                                "rate",
                                &key,
                                AdmissionState::TimedOut.as_str(),
                                Some(waited),
                                None,
                            );
                            return Err(ToolkitError::AdmissionTimeout { key, waited });
                        }
                    }
                    if denials == 0 {
                        let details = format!("{count} of {limit} in window");
                        log_admission_operation(
                            "rate",
                            &key,
                            AdmissionState::Waiting.as_str(),
                            None,
                            Some(&details),
                        );
                    }
                    denials += 1;
                    debug!(
                        key = %key,
                        count = count,
                        limit = limit,
                        retry_after_ms = retry_after.as_millis() as u64,
                        "Rate limit reached, waiting for next window"
                    );
                    tokio::time::sleep(retry_after).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn limiter_at(start_ms: u64) -> (RateLimiter, ManualClock) {
        let clock = ManualClock::new(start_ms);
        let store = StoreProvider::memory_with_clock(Arc::new(clock.clone()));
        (RateLimiter::new(Arc::new(store), "rate_limit"), clock)
    }

    #[tokio::test]
    async fn test_admits_limit_then_denies_until_next_window() {
        let (limiter, clock) = limiter_at(1_700_000_040_000);
        let window = Duration::from_secs(60);
        let no_wait = Some(Duration::ZERO);

        for expected in 1..=5 {
            let grant = limiter.acquire("site", 5, window, no_wait).await.unwrap();
            assert_eq!(grant.count, expected);
        }
        assert!(matches!(
            limiter.acquire("site", 5, window, no_wait).await,
            Err(ToolkitError::AdmissionTimeout { .. })
        ));

        // Still the same window
        clock.advance(Duration::from_secs(19));
        assert!(limiter.acquire("site", 5, window, no_wait).await.is_err());

        // 1_700_000_040_000 is the start of a 60s window; step into the next one
        clock.advance(Duration::from_secs(41));
        assert_eq!(
            limiter.acquire("site", 5, window, no_wait).await.unwrap().count,
            1
        );
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (limiter, _clock) = limiter_at(0);
        let window = Duration::from_secs(60);
        limiter.acquire("a", 1, window, None).await.unwrap();
        limiter.acquire("b", 1, window, None).await.unwrap();
        assert!(limiter
            .acquire("a", 1, window, Some(Duration::ZERO))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_waits_for_next_window_with_system_clock() {
        let limiter = RateLimiter::new(Arc::new(StoreProvider::from(MemoryStore::new())), "rate_limit");
        let window = Duration::from_millis(50);

        limiter.acquire("site", 1, window, None).await.unwrap();
        let grant = limiter
            .acquire("site", 1, window, Some(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(grant.count, 1);
        assert!(grant.waited > Duration::ZERO);
    }
}
