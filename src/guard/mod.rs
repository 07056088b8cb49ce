//! # Call Guard
//!
//! Wraps a call site with caching, admission control and classified retries, in that
//! order:
//!
//! ```text
//! cache lookup ── hit ──────────────────────────────────────────▶ Outcome::Cached
//!      │ miss
//!      ▼
//! ┌─▶ rate window ─▶ concurrency slot ─▶ call ─▶ release slot ─▶ classify
//! │                                                               │
//! └──────────────────────── Retry { delay } ◀─────────────────────┤
//!                                                                 ├─ Accept ─▶ cache store ─▶ Outcome::Fresh
//!                                                                 ├─ Ignore ─▶ Outcome::Ignored
//!                                                                 └─ Fail ───▶ CallError::RetryExhausted
//! ```
//!
//! Each retry re-enters admission, so successive attempts of one call never overlap and
//! each consumes its own rate budget. Every behavior is optional; a [`GuardConfig`] with
//! nothing set just runs the call.
//!
//! [`CallGuard::call`] is the suspendable entry point; [`BlockingCallGuard`] offers the same
//! semantics to synchronous code.

mod blocking;

pub use blocking::BlockingCallGuard;

use crate::admission::{remaining, AdmissionScope, ConcurrencyLimiter, RateLimiter};
use crate::cache::{CacheCoordinator, CacheTtl};
use crate::classifier::{Decision, HasStatus, IgnorePolicy, OutcomeClassifier, RetryPolicy};
use crate::config::{
    validate_key_prefixes, AdmissionConfig, CacheConfig, ConfigurationError, SiteConfig,
    ToolkitConfig,
};
use crate::error::{CallError, ToolkitError, ToolkitResult};
use crate::fingerprint::{CallSignature, FingerprintBuilder, SignatureField};
use crate::logging::log_retry_operation;
use crate::store::{SharedStore, StoreProvider};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Result of a guarded call that did not fail
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T, E> {
    /// The call ran and its result was accepted
    Fresh(T),
    /// Served from the cache without running the call
    Cached(T),
    /// The call ran and matched the ignore policy; returned as-is, never cached
    Ignored(Result<T, E>),
}

impl<T, E> Outcome<T, E> {
    pub fn is_cached(&self) -> bool {
        matches!(self, Self::Cached(_))
    }

    pub fn is_ignored(&self) -> bool {
        matches!(self, Self::Ignored(_))
    }

    /// The produced value, if there is one
    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Fresh(value) | Self::Cached(value) | Self::Ignored(Ok(value)) => Some(value),
            Self::Ignored(Err(_)) => None,
        }
    }

    pub fn into_result(self) -> Result<T, E> {
        match self {
            Self::Fresh(value) | Self::Cached(value) => Ok(value),
            Self::Ignored(result) => result,
        }
    }
}

/// Configuration of one guarded site
#[derive(Debug, Clone, PartialEq)]
pub struct GuardConfig {
    namespace: String,
    ttl: Option<CacheTtl>,
    concurrency_limit: Option<u32>,
    rate_limit: Option<(u64, Duration)>,
    retry: Option<RetryPolicy>,
    ignore: Option<IgnorePolicy>,
    scope: AdmissionScope,
    acquire_timeout: Option<Duration>,
}

impl GuardConfig {
    /// Start a configuration for the site `namespace` with every behavior disabled
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ttl: None,
            concurrency_limit: None,
            rate_limit: None,
            retry: None,
            ignore: None,
            scope: AdmissionScope::default(),
            acquire_timeout: None,
        }
    }

    /// Build from a configured site; the site name becomes the namespace
    pub fn from_site(name: &str, site: &SiteConfig, admission: &AdmissionConfig) -> Self {
        Self {
            namespace: name.to_string(),
            ttl: site.ttl,
            concurrency_limit: site.concurrency_limit,
            rate_limit: site
                .rate_limit
                .as_ref()
                .map(|r| (r.count, Duration::from_secs(r.window_seconds))),
            retry: site.retry.as_ref().map(RetryPolicy::from),
            ignore: site.ignore.as_ref().map(IgnorePolicy::from),
            scope: site.scope,
            acquire_timeout: site
                .acquire_timeout_ms
                .map(Duration::from_millis)
                .or_else(|| admission.acquire_timeout()),
        }
    }

    pub fn ttl(mut self, ttl: CacheTtl) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn concurrency_limit(mut self, limit: u32) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    pub fn rate_limit(mut self, count: u64, window: Duration) -> Self {
        self.rate_limit = Some((count, window));
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn ignore(mut self, policy: IgnorePolicy) -> Self {
        self.ignore = Some(policy);
        self
    }

    pub fn scope(mut self, scope: AdmissionScope) -> Self {
        self.scope = scope;
        self
    }

    /// Longest wait for admission per attempt; unset waits indefinitely
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn validate(&self) -> ToolkitResult<()> {
        let invalid = |field: &str, reason: &str| {
            ToolkitError::Configuration(ConfigurationError::invalid_value(
                format!("{}.{}", self.namespace, field),
                "0",
                reason,
            ))
        };
        if self.concurrency_limit == Some(0) {
            return Err(invalid(
                "concurrency_limit",
                "concurrency limit must be greater than 0",
            ));
        }
        if let Some((count, window)) = self.rate_limit {
            if count == 0 {
                return Err(invalid("rate_limit.count", "rate limit count must be greater than 0"));
            }
            if window.is_zero() {
                return Err(invalid("rate_limit.window", "rate window must be greater than 0"));
            }
        }
        Ok(())
    }
}

/// A configured call site bound to a shared store
#[derive(Debug, Clone)]
pub struct CallGuard {
    config: GuardConfig,
    fingerprints: FingerprintBuilder,
    classifier: OutcomeClassifier,
    cache: CacheCoordinator,
    concurrency: ConcurrencyLimiter,
    rate: RateLimiter,
}

impl CallGuard {
    /// Bind `config` to `store` with default key prefixes and polling
    pub fn new(config: GuardConfig, store: Arc<StoreProvider>) -> ToolkitResult<Self> {
        Self::with_settings(
            config,
            store,
            &AdmissionConfig::default(),
            &CacheConfig::default(),
        )
    }

    pub fn with_settings(
        config: GuardConfig,
        store: Arc<StoreProvider>,
        admission: &AdmissionConfig,
        cache: &CacheConfig,
    ) -> ToolkitResult<Self> {
        let fingerprints = FingerprintBuilder::new(config.namespace.clone())?;
        config.validate()?;
        validate_key_prefixes(admission, cache)?;

        info!(
            namespace = %config.namespace,
            ttl = ?config.ttl,
            concurrency_limit = ?config.concurrency_limit,
            rate_limit = ?config.rate_limit,
            store = store.provider_name(),
            "Call guard configured"
        );

        Ok(Self {
            classifier: OutcomeClassifier::new(config.retry.clone(), config.ignore.clone()),
            cache: CacheCoordinator::new(Arc::clone(&store), cache.prefix.clone()),
            concurrency: ConcurrencyLimiter::new(
                Arc::clone(&store),
                admission.concurrency_prefix.clone(),
                admission.slot_lease(),
                admission.poll_interval(),
            ),
            rate: RateLimiter::new(store, admission.rate_prefix.clone()),
            fingerprints,
            config,
        })
    }

    /// Guard for the site `name` of a loaded configuration
    pub fn for_site(
        name: &str,
        toolkit: &ToolkitConfig,
        store: Arc<StoreProvider>,
    ) -> ToolkitResult<Self> {
        let site = toolkit.site(name).ok_or_else(|| {
            ToolkitError::Configuration(ConfigurationError::missing_required_field(
                format!("sites.{name}"),
                "call guard site",
            ))
        })?;
        Self::with_settings(
            GuardConfig::from_site(name, site, &toolkit.admission),
            store,
            &toolkit.admission,
            &toolkit.cache,
        )
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Run `call` under this guard
    ///
    /// `call` is invoked once per attempt. Store and admission failures end the call
    /// immediately and are never retried here.
    pub async fn call<T, E, F, Fut>(
        &self,
        signature: &CallSignature,
        mut call: F,
    ) -> Result<Outcome<T, E>, CallError<T, E>>
    where
        T: HasStatus + Serialize + DeserializeOwned,
        E: 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let fingerprint = self.fingerprints.build(signature);

        if self.config.ttl.is_some() {
            if let Some(entry) = self.cache.lookup::<T>(&fingerprint).await? {
                return Ok(Outcome::Cached(entry.payload));
            }
        }

        let scope_key = self
            .config
            .scope
            .scope_key(&self.fingerprints, signature);
        let max_attempts = self.classifier.max_attempts();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let outcome = self.run_admitted(&scope_key, &mut call).await?;

            match self.classifier.classify(&outcome, attempt) {
                Decision::Accept => {
                    let value = outcome.map_err(CallError::Call)?;
                    if let Some(ttl) = self.config.ttl {
                        if value.status().map_or(true, |status| status < 400) {
                            self.cache.store(&fingerprint, &value, ttl).await?;
                        } else {
                            debug!(
                                fingerprint = %fingerprint,
                                status = ?value.status(),
                                "Not caching error status"
                            );
                        }
                    }
                    return Ok(Outcome::Fresh(value));
                }
                Decision::Ignore => {
                    debug!(fingerprint = %fingerprint, attempt = attempt, "Outcome ignored");
                    return Ok(Outcome::Ignored(outcome));
                }
                Decision::Retry { delay } => {
                    let status = outcome.as_ref().ok().and_then(HasStatus::status);
                    log_retry_operation(&self.config.namespace, attempt, max_attempts, status, delay);
                    tokio::time::sleep(delay).await;
                }
                Decision::Fail => {
                    let last_status = outcome.as_ref().ok().and_then(HasStatus::status);
                    warn!(
                        namespace = %self.config.namespace,
                        attempts = attempt,
                        last_status = ?last_status,
                        "Retries exhausted"
                    );
                    return Err(CallError::RetryExhausted {
                        attempts: attempt,
                        last_status,
                        last: outcome,
                    });
                }
            }
        }
    }

    /// One attempt: pass the rate window, hold a slot while the call runs
    async fn run_admitted<T, E, F, Fut>(
        &self,
        scope_key: &str,
        call: &mut F,
    ) -> ToolkitResult<Result<T, E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let timeout = self.config.acquire_timeout;

        if let Some((count, window)) = self.config.rate_limit {
            self.rate.acquire(scope_key, count, window, timeout).await?;
        }

        let ticket = match self.config.concurrency_limit {
            Some(limit) => Some(
                self.concurrency
                    .acquire(scope_key, limit, remaining(started, timeout))
                    .await?,
            ),
            None => None,
        };

        let outcome = call().await;

        if let Some(ticket) = ticket {
            ticket.release().await?;
        }
        Ok(outcome)
    }

    /// Drop the cached entry for `signature`, returning the number of keys removed
    pub async fn invalidate(&self, signature: &CallSignature) -> ToolkitResult<u64> {
        self.cache
            .invalidate(&self.fingerprints.build(signature))
            .await
    }

    /// Drop every cached entry that agrees with `sample` on `fields`
    ///
    /// ```rust,no_run
    /// # use api_toolkit::{CallGuard, CallSignature, SignatureField};
    /// # async fn example(guard: &CallGuard) -> api_toolkit::ToolkitResult<()> {
    /// // Every cached GET /repos response, whatever its query or body
    /// let sample = CallSignature::new("GET", "/repos");
    /// guard
    ///     .invalidate_matching(&sample, &[SignatureField::Method, SignatureField::Target])
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn invalidate_matching(
        &self,
        sample: &CallSignature,
        fields: &[SignatureField],
    ) -> ToolkitResult<u64> {
        self.cache
            .invalidate_matching(&self.fingerprints.build(sample), fields)
            .await
    }

    /// Drop every cached entry of this site, returning the number of keys removed
    pub async fn clear_prefix(&self) -> ToolkitResult<u64> {
        self.cache.clear_prefix(&self.config.namespace).await
    }
}
