//! Concurrency limiter
//!
//! Each admitted call holds one leased slot in a sorted set at
//! `{concurrency_prefix}:{scope}`. The ticket returned by [`ConcurrencyLimiter::acquire`]
//! must be released on every exit path; if it is dropped unreleased (a panic or a cancelled
//! future) the release is spawned onto the current runtime, and failing that the lease
//! bounds how long the slot stays counted.

use super::{remaining, AdmissionState};
use crate::error::{ToolkitError, ToolkitResult};
use crate::logging::{log_admission_operation, log_error};
use crate::store::{SharedStore, SlotToken, StoreProvider};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Grants and releases concurrency slots
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    store: Arc<StoreProvider>,
    prefix: String,
    lease: Duration,
    poll_interval: Duration,
}

impl ConcurrencyLimiter {
    pub fn new(
        store: Arc<StoreProvider>,
        prefix: impl Into<String>,
        lease: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            lease,
            poll_interval,
        }
    }

    fn slot_key(&self, scope_key: &str) -> String {
        format!("{}:{}", self.prefix, scope_key)
    }

    /// Wait for one of `limit` slots under `scope_key`
    ///
    /// `timeout = None` waits indefinitely; `Some(Duration::ZERO)` tries exactly once.
    pub async fn acquire(
        &self,
        scope_key: &str,
        limit: u32,
        timeout: Option<Duration>,
    ) -> ToolkitResult<AdmissionTicket> {
        let key = self.slot_key(scope_key);
        let started = Instant::now();
        let mut polls: u32 = 0;

        loop {
            if let Some(token) = self.store.try_acquire_slot(&key, limit, self.lease).await? {
                let waited = started.elapsed();
                if polls > 0 {
                    log_admission_operation(
                        "concurrency",
                        &key,
                        AdmissionState::Admitted.as_str(),
                        Some(waited),
                        None,
                    );
                } else {
                    debug!(key = %key, limit = limit, "Concurrency slot acquired");
                }
                return Ok(AdmissionTicket {
                    store: Arc::clone(&self.store),
                    key,
                    token: Some(token),
                    state: AdmissionState::Admitted,
                });
            }

            let pause = match remaining(started, timeout) {
                Some(left) if left.is_zero() => {
                    let waited = started.elapsed();
                    let details = format!("limit {limit} reached after {polls} polls");
                    log_admission_operation(
                        "concurrency",
                        &key,
                        AdmissionState::TimedOut.as_str(),
                        Some(waited),
                        Some(&details),
                    );
                    return Err(ToolkitError::AdmissionTimeout { key, waited });
                }
                Some(left) => left.min(self.poll_interval),
                None => self.poll_interval,
            };

            if polls == 0 {
                let details = format!("limit {limit} reached");
                log_admission_operation(
                    "concurrency",
                    &key,
                    AdmissionState::Waiting.as_str(),
                    None,
                    Some(&details),
                );
            }
            polls += 1;
            debug!(key = %key, limit = limit, polls = polls, "Concurrency limit reached, waiting");
            tokio::time::sleep(pause).await;
        }
    }
}

/// One reserved concurrency slot
#[derive(Debug)]
pub struct AdmissionTicket {
    store: Arc<StoreProvider>,
    key: String,
    token: Option<SlotToken>,
    state: AdmissionState,
}

impl AdmissionTicket {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> AdmissionState {
        self.state
    }

    /// Give the slot back
    ///
    /// Returns false if the lease had already run out. A store failure is returned to the
    /// caller and the ticket's drop retries the release in the background. The token stays
    /// with the ticket until the store confirms, so cancelling this future mid-release
    /// leaves the same background release in charge.
    pub async fn release(mut self) -> ToolkitResult<bool> {
        let Some(token) = self.token.clone() else {
            return Ok(false);
        };
        let released = self.store.release_slot(&self.key, &token).await?;
        self.token = None;
        self.state = AdmissionState::Released;
        if !released {
            warn!(key = %self.key, "Concurrency slot lease expired before release");
        }
        Ok(released)
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };

        let store = Arc::clone(&self.store);
        let key = std::mem::take(&mut self.key);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(key = %key, "Admission ticket dropped without release, releasing in background");
                handle.spawn(async move {
                    if let Err(e) = store.release_slot(&key, &token).await {
                        log_error(
                            "concurrency",
                            "release_slot",
                            &e.to_string(),
                            Some(&format!("background release of {key}")),
                        );
                    }
                });
            }
            Err(_) => {
                warn!(key = %key, "Admission ticket dropped outside a runtime, slot held until its lease expires");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn limiter_with(store: MemoryStore) -> ConcurrencyLimiter {
        ConcurrencyLimiter::new(
            Arc::new(StoreProvider::from(store)),
            "concurrency_limit",
            Duration::from_secs(60),
            Duration::from_millis(5),
        )
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let store = MemoryStore::new();
        let limiter = limiter_with(store.clone());

        let ticket = limiter.acquire("site", 1, None).await.unwrap();
        assert_eq!(ticket.key(), "concurrency_limit:site");
        assert_eq!(ticket.state(), AdmissionState::Admitted);

        let denied = limiter.acquire("site", 1, Some(Duration::ZERO)).await;
        assert!(matches!(denied, Err(ToolkitError::AdmissionTimeout { .. })));

        assert!(ticket.release().await.unwrap());
        assert_eq!(store.live_entries(), 0);
        limiter.acquire("site", 1, Some(Duration::ZERO)).await.unwrap().release().await.unwrap();
    }

    #[tokio::test]
    async fn test_times_out_when_full() {
        let limiter = limiter_with(MemoryStore::new());
        let _held = limiter.acquire("site", 1, None).await.unwrap();

        let started = std::time::Instant::now();
        let result = limiter.acquire("site", 1, Some(Duration::from_millis(40))).await;
        match result {
            Err(ToolkitError::AdmissionTimeout { key, waited }) => {
                assert_eq!(key, "concurrency_limit:site");
                assert!(waited >= Duration::from_millis(40));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_waiter_admitted_after_release() {
        let limiter = limiter_with(MemoryStore::new());
        let held = limiter.acquire("site", 1, None).await.unwrap();

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire("site", 1, Some(Duration::from_secs(5))).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        held.release().await.unwrap();
        let ticket = waiter.await.unwrap().unwrap();
        ticket.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_ticket_is_released() {
        let store = MemoryStore::new();
        let limiter = limiter_with(store.clone());

        drop(limiter.acquire("site", 1, None).await.unwrap());

        let ticket = limiter
            .acquire("site", 1, Some(Duration::from_secs(1)))
            .await
            .unwrap();
        ticket.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_release_is_retried_in_background() {
        let store = MemoryStore::new();
        let limiter = limiter_with(store.clone());

        let ticket = limiter.acquire("site", 1, None).await.unwrap();
        store.fail_next("release_slot");
        assert!(matches!(
            ticket.release().await,
            Err(ToolkitError::StoreUnavailable(_))
        ));

        // The ticket kept its token, so dropping it spawned a second release
        let ticket = limiter
            .acquire("site", 1, Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(ticket.state(), AdmissionState::Admitted);
        ticket.release().await.unwrap();
        assert_eq!(store.live_entries(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_release_still_frees_the_slot() {
        let store = MemoryStore::new();
        let limiter = limiter_with(store.clone());

        let ticket = limiter.acquire("site", 1, None).await.unwrap();
        // Dropped before the store confirmed the release
        let release = ticket.release();
        drop(release);

        let ticket = limiter
            .acquire("site", 1, Some(Duration::from_secs(1)))
            .await
            .unwrap();
        ticket.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_abandoned_slot_counts_until_lease_expires() {
        let clock = ManualClock::new(0);
        let store = MemoryStore::with_clock(Arc::new(clock.clone()));
        let limiter = limiter_with(store);

        // Simulates a holder that crashed: the slot is never handed back
        let ticket = limiter.acquire("site", 1, None).await.unwrap();
        std::mem::forget(ticket);

        assert!(limiter.acquire("site", 1, Some(Duration::ZERO)).await.is_err());
        clock.advance(Duration::from_secs(60));
        assert!(limiter.acquire("site", 1, Some(Duration::ZERO)).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_never_more_than_limit_in_flight() {
        let limiter = limiter_with(MemoryStore::new());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let limiter = limiter.clone();
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let ticket = limiter.acquire("site", 3, None).await.unwrap();
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                ticket.release().await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(in_flight.load(Ordering::SeqCst), 0);
    }
}
