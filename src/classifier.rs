//! # Outcome Classification
//!
//! Decides what happens to the outcome of one attempt of a guarded call.
//!
//! ## Overview
//!
//! Every attempt ends in exactly one [`Decision`]:
//!
//! ```text
//! EXECUTED ──▶ matches ignore policy ───────────────────────▶ Ignore
//!          ──▶ matches retry policy, attempt < max_count ────▶ Retry { delay }
//!          ──▶ matches retry policy, attempt == max_count ───▶ Fail
//!          ──▶ anything else ────────────────────────────────▶ Accept
//! ```
//!
//! The ignore policy is checked strictly first, so an outcome matching both policies is
//! ignored and never consumes retry budget. Attempts are numbered from 1 and `max_count`
//! counts total attempts.
//!
//! ## Usage
//!
//! ```rust
//! use api_toolkit::classifier::{Decision, IgnorePolicy, OutcomeClassifier, RetryPolicy};
//! use std::time::Duration;
//!
//! let classifier = OutcomeClassifier::new(
//!     Some(RetryPolicy::on_statuses([500], 3, Duration::from_millis(100))),
//!     Some(IgnorePolicy::on_statuses([404])),
//! );
//!
//! let server_error: Result<u16, String> = Ok(500);
//! assert_eq!(
//!     classifier.classify(&server_error, 1),
//!     Decision::Retry { delay: Duration::from_millis(100) }
//! );
//! assert_eq!(classifier.classify(&server_error, 3), Decision::Fail);
//! assert_eq!(classifier.classify(&Ok::<u16, String>(404), 1), Decision::Ignore);
//! ```

use crate::config::{IgnoreSetting, RetrySetting};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Status inspection for call results
///
/// Implement this for the response type of a guarded call so policies can match on it.
/// A `None` status never matches a status predicate.
pub trait HasStatus {
    fn status(&self) -> Option<u16>;
}

impl HasStatus for u16 {
    fn status(&self) -> Option<u16> {
        Some(*self)
    }
}

impl<T: HasStatus> HasStatus for Option<T> {
    fn status(&self) -> Option<u16> {
        self.as_ref().and_then(HasStatus::status)
    }
}

impl<T: HasStatus + ?Sized> HasStatus for &T {
    fn status(&self) -> Option<u16> {
        (**self).status()
    }
}

/// A status code with a payload; the simplest cacheable call result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse<B> {
    pub status: u16,
    pub body: B,
}

impl<B> ApiResponse<B> {
    pub fn new(status: u16, body: B) -> Self {
        Self { status, body }
    }
}

impl<B> HasStatus for ApiResponse<B> {
    fn status(&self) -> Option<u16> {
        Some(self.status)
    }
}

type ErrorPredicate = Arc<dyn Fn(&dyn Any) -> bool + Send + Sync>;

/// Predicate shared by the retry and ignore policies
#[derive(Clone, Default)]
struct Matcher {
    statuses: BTreeSet<u16>,
    on_error: bool,
    /// Each checks errors of one concrete type; an error of any other type never matches
    error_predicates: Vec<ErrorPredicate>,
}

impl Matcher {
    fn on_statuses(statuses: impl IntoIterator<Item = u16>) -> Self {
        Self {
            statuses: statuses.into_iter().collect(),
            ..Default::default()
        }
    }

    fn add_error_predicate<E, P>(&mut self, predicate: P)
    where
        E: 'static,
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.error_predicates.push(Arc::new(move |error: &dyn Any| {
            error.downcast_ref::<E>().is_some_and(&predicate)
        }));
    }

    fn matches<T: HasStatus, E: 'static>(&self, outcome: &Result<T, E>) -> bool {
        match outcome {
            Ok(value) => value
                .status()
                .is_some_and(|status| self.statuses.contains(&status)),
            Err(error) => {
                self.on_error
                    || self
                        .error_predicates
                        .iter()
                        .any(|predicate| predicate(error as &dyn Any))
            }
        }
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Matcher")
            .field("statuses", &self.statuses)
            .field("on_error", &self.on_error)
            .field("error_predicates", &self.error_predicates.len())
            .finish()
    }
}

impl PartialEq for Matcher {
    fn eq(&self, other: &Self) -> bool {
        self.statuses == other.statuses
            && self.on_error == other.on_error
            && self.error_predicates.len() == other.error_predicates.len()
            && self
                .error_predicates
                .iter()
                .zip(&other.error_predicates)
                .all(|(a, b)| Arc::ptr_eq(a, b))
    }
}

impl Eq for Matcher {}

/// When and how often to try a call again
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    matcher: Matcher,
    max_count: u32,
    delay: Duration,
}

impl RetryPolicy {
    /// Retry results whose status is in `statuses`, up to `max_count` total attempts
    pub fn on_statuses(
        statuses: impl IntoIterator<Item = u16>,
        max_count: u32,
        delay: Duration,
    ) -> Self {
        Self {
            matcher: Matcher::on_statuses(statuses),
            max_count: max_count.max(1),
            delay,
        }
    }

    /// Also retry when the call returns an error
    pub fn and_errors(mut self) -> Self {
        self.matcher.on_error = true;
        self
    }

    /// Also retry errors of type `E` for which `predicate` holds
    ///
    /// ```rust
    /// use api_toolkit::classifier::{Decision, OutcomeClassifier, RetryPolicy};
    /// use std::io;
    /// use std::time::Duration;
    ///
    /// let retry = RetryPolicy::on_statuses([503], 3, Duration::ZERO)
    ///     .and_errors_where(|e: &io::Error| e.kind() == io::ErrorKind::TimedOut);
    /// let classifier = OutcomeClassifier::new(Some(retry), None);
    ///
    /// let timed_out: Result<u16, io::Error> = Err(io::ErrorKind::TimedOut.into());
    /// let refused: Result<u16, io::Error> = Err(io::ErrorKind::ConnectionRefused.into());
    /// assert_eq!(classifier.classify(&timed_out, 1), Decision::Retry { delay: Duration::ZERO });
    /// assert_eq!(classifier.classify(&refused, 1), Decision::Accept);
    /// ```
    pub fn and_errors_where<E, P>(mut self, predicate: P) -> Self
    where
        E: 'static,
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.matcher.add_error_predicate(predicate);
        self
    }

    pub fn max_count(&self) -> u32 {
        self.max_count
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl From<&RetrySetting> for RetryPolicy {
    fn from(setting: &RetrySetting) -> Self {
        let policy = Self::on_statuses(
            setting.statuses.iter().copied(),
            setting.max_count,
            Duration::from_millis(setting.delay_ms),
        );
        if setting.on_error {
            policy.and_errors()
        } else {
            policy
        }
    }
}

/// Outcomes that are returned as-is, without retrying or caching
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgnorePolicy {
    matcher: Matcher,
}

impl IgnorePolicy {
    pub fn on_statuses(statuses: impl IntoIterator<Item = u16>) -> Self {
        Self {
            matcher: Matcher::on_statuses(statuses),
        }
    }

    /// Also ignore errors returned by the call
    pub fn and_errors(mut self) -> Self {
        self.matcher.on_error = true;
        self
    }

    /// Also ignore errors of type `E` for which `predicate` holds
    pub fn and_errors_where<E, P>(mut self, predicate: P) -> Self
    where
        E: 'static,
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.matcher.add_error_predicate(predicate);
        self
    }
}

impl From<&IgnoreSetting> for IgnorePolicy {
    fn from(setting: &IgnoreSetting) -> Self {
        let policy = Self::on_statuses(setting.statuses.iter().copied());
        if setting.on_error {
            policy.and_errors()
        } else {
            policy
        }
    }
}

/// What to do with the outcome of one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Return the outcome; an `Ok` result is eligible for caching
    Accept,
    /// Return the outcome tagged as ignored
    Ignore,
    /// Wait `delay`, then make another attempt
    Retry { delay: Duration },
    /// A retryable outcome persisted through the last allowed attempt
    Fail,
}

/// Applies the ignore and retry policies of one site
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutcomeClassifier {
    retry: Option<RetryPolicy>,
    ignore: Option<IgnorePolicy>,
}

impl OutcomeClassifier {
    pub fn new(retry: Option<RetryPolicy>, ignore: Option<IgnorePolicy>) -> Self {
        Self { retry, ignore }
    }

    /// Total attempts allowed for one call
    pub fn max_attempts(&self) -> u32 {
        self.retry.as_ref().map_or(1, RetryPolicy::max_count)
    }

    /// Classify the outcome of attempt number `attempt` (starting at 1)
    ///
    /// Error predicates match on the concrete error type, hence `E: 'static`.
    pub fn classify<T: HasStatus, E: 'static>(
        &self,
        outcome: &Result<T, E>,
        attempt: u32,
    ) -> Decision {
        if self
            .ignore
            .as_ref()
            .is_some_and(|policy| policy.matcher.matches(outcome))
        {
            return Decision::Ignore;
        }

        match &self.retry {
            Some(policy) if policy.matcher.matches(outcome) => {
                if attempt < policy.max_count {
                    Decision::Retry {
                        delay: policy.delay,
                    }
                } else {
                    Decision::Fail
                }
            }
            _ => Decision::Accept,
        }
    }
}
