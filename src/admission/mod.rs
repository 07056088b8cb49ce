//! # Admission Coordinators
//!
//! Global admit/deny decisions made against the shared store, so a limit configured for a
//! key holds across every process using that key.
//!
//! - [`ConcurrencyLimiter`] bounds in-flight calls with leased slots
//! - [`RateLimiter`] bounds calls per fixed, wall-clock aligned window
//!
//! Both poll the store at a bounded interval while waiting and give up with
//! [`ToolkitError::AdmissionTimeout`](crate::error::ToolkitError::AdmissionTimeout) once the
//! configured timeout passes. Store failures propagate immediately; they never count as a
//! denial.

pub mod concurrency;
pub mod rate;

pub use concurrency::{AdmissionTicket, ConcurrencyLimiter};
pub use rate::{RateGrant, RateLimiter};

use crate::fingerprint::{CallSignature, FingerprintBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// What a limit is shared by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionScope {
    /// One limit for every call through the site
    #[default]
    Site,
    /// One limit per request type: method, target, headers and cookies
    Target,
}

impl AdmissionScope {
    /// Key segment identifying the limit a call counts against
    pub fn scope_key(&self, fingerprints: &FingerprintBuilder, signature: &CallSignature) -> String {
        match self {
            Self::Site => fingerprints.namespace().to_string(),
            Self::Target => fingerprints.build(&signature.request_type()).to_string(),
        }
    }
}

/// Lifecycle of one admission request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionState {
    Waiting,
    Admitted,
    Released,
    TimedOut,
}

impl AdmissionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Admitted => "admitted",
            Self::Released => "released",
            Self::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for AdmissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time left before `timeout` runs out, `None` meaning unbounded
pub(crate) fn remaining(started: tokio::time::Instant, timeout: Option<Duration>) -> Option<Duration> {
    timeout.map(|t| t.saturating_sub(started.elapsed()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_site_scope_uses_namespace() {
        let fingerprints = FingerprintBuilder::new("github").unwrap();
        let a = CallSignature::new("GET", "/repos").query_param("page", "1");
        assert_eq!(AdmissionScope::Site.scope_key(&fingerprints, &a), "github");
    }

    #[test]
    fn test_target_scope_ignores_query_and_body() {
        let fingerprints = FingerprintBuilder::new("github").unwrap();
        let a = CallSignature::new("GET", "/repos").query_param("page", "1");
        let b = CallSignature::new("GET", "/repos").query_param("page", "2");
        let c = CallSignature::new("GET", "/users");

        let key_a = AdmissionScope::Target.scope_key(&fingerprints, &a);
        assert_eq!(key_a, AdmissionScope::Target.scope_key(&fingerprints, &b));
        assert_ne!(key_a, AdmissionScope::Target.scope_key(&fingerprints, &c));
        assert!(key_a.starts_with("github:"));
    }

    #[test]
    fn test_admission_state_names() {
        assert_eq!(AdmissionState::Waiting.to_string(), "waiting");
        assert_eq!(AdmissionState::Admitted.as_str(), "admitted");
        assert_eq!(AdmissionState::Released.as_str(), "released");
        assert_eq!(AdmissionState::TimedOut.to_string(), "timed_out");
    }

    #[test]
    fn test_scope_deserializes_lowercase() {
        let scope: AdmissionScope = serde_json::from_str("\"target\"").unwrap();
        assert_eq!(scope, AdmissionScope::Target);
        assert_eq!(AdmissionScope::default(), AdmissionScope::Site);
    }
}
