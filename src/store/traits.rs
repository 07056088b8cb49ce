//! Shared store contract

use super::errors::StoreResult;
use std::fmt;
use std::time::Duration;

/// Proof of one reserved concurrency slot; must be handed back to `release_slot` exactly once
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlotToken(String);

impl SlotToken {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SlotToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of one test-and-increment against a rate window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// The counter after increment is within the limit
    Allowed { count: u64 },
    /// Over the limit; the window ends after `retry_after`
    Denied { count: u64, retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

/// Glob over store keys whose only metacharacter is a `*` wildcard
///
/// Built from literal text and wildcards; literal text is matched verbatim, whatever
/// characters it contains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPattern {
    /// Literal runs; a wildcard sits between each consecutive pair
    literals: Vec<String>,
}

impl KeyPattern {
    pub fn literal(text: impl Into<String>) -> Self {
        Self {
            literals: vec![text.into()],
        }
    }

    /// Every key starting with `prefix`
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self::literal(prefix).wildcard()
    }

    /// Append literal text
    pub fn then(mut self, text: impl AsRef<str>) -> Self {
        if let Some(last) = self.literals.last_mut() {
            last.push_str(text.as_ref());
        }
        self
    }

    /// Append a wildcard matching any run of characters
    pub fn wildcard(mut self) -> Self {
        self.literals.push(String::new());
        self
    }

    pub fn matches(&self, key: &str) -> bool {
        let Some((first, rest)) = self.literals.split_first() else {
            return key.is_empty();
        };
        let Some(mut tail) = key.strip_prefix(first.as_str()) else {
            return false;
        };
        let Some((last, middle)) = rest.split_last() else {
            return tail.is_empty();
        };
        // Leftmost match of each middle literal is always safe with `*`-only globs
        for literal in middle {
            match tail.find(literal.as_str()) {
                Some(at) => tail = &tail[at + literal.len()..],
                None => return false,
            }
        }
        tail.ends_with(last.as_str())
    }

    /// Redis `MATCH` syntax, with glob metacharacters in literal text escaped
    pub fn to_glob(&self) -> String {
        let mut glob = String::new();
        for (i, literal) in self.literals.iter().enumerate() {
            if i > 0 {
                glob.push('*');
            }
            for c in literal.chars() {
                if matches!(c, '*' | '?' | '[' | ']' | '\\') {
                    glob.push('\\');
                }
                glob.push(c);
            }
        }
        glob
    }
}

/// Operations every shared store backend provides
///
/// Counter operations are atomic on the backend: two callers can never both be admitted
/// past a limit, whichever process they run in. All keys are used verbatim; callers own
/// the prefixing.
pub trait SharedStore: Send + Sync {
    /// Get a value; `Ok(None)` when absent or expired
    fn get(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = StoreResult<Option<Vec<u8>>>> + Send;

    /// Set a value; `ttl = None` means never expire
    fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> impl std::future::Future<Output = StoreResult<()>> + Send;

    /// Delete one key, returning whether it existed
    fn delete(&self, key: &str) -> impl std::future::Future<Output = StoreResult<bool>> + Send;

    /// Delete every key starting with `prefix`, returning how many were removed
    ///
    /// Not atomic across keys, but never touches a key outside the prefix.
    fn delete_prefix(
        &self,
        prefix: &str,
    ) -> impl std::future::Future<Output = StoreResult<u64>> + Send;

    /// Delete every key matched by `pattern`, returning how many were removed
    ///
    /// Same guarantees as [`delete_prefix`](Self::delete_prefix): not atomic, never touches
    /// a key the pattern does not match.
    fn delete_matching(
        &self,
        pattern: &KeyPattern,
    ) -> impl std::future::Future<Output = StoreResult<u64>> + Send;

    /// Reserve one slot if fewer than `max_concurrent` unexpired slots are held
    ///
    /// Each slot carries a `lease`; a holder that never releases stops counting once the
    /// lease passes.
    fn try_acquire_slot(
        &self,
        key: &str,
        max_concurrent: u32,
        lease: Duration,
    ) -> impl std::future::Future<Output = StoreResult<Option<SlotToken>>> + Send;

    /// Give a slot back; returns false if it had already expired or been released
    fn release_slot(
        &self,
        key: &str,
        token: &SlotToken,
    ) -> impl std::future::Future<Output = StoreResult<bool>> + Send;

    /// Increment the counter of the current fixed window and test it against `limit`
    fn try_acquire_rate(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> impl std::future::Future<Output = StoreResult<RateDecision>> + Send;

    /// Check if the backend is reachable
    fn health_check(&self) -> impl std::future::Future<Output = StoreResult<bool>> + Send;

    /// Get the name of the store provider
    fn provider_name(&self) -> &'static str;

    /// Whether state is shared with other processes
    fn is_distributed(&self) -> bool;
}

/// Fixed-window bookkeeping shared by all backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WindowSlot {
    pub index: u64,
    /// Time left until the window ends, at least 1ms
    pub remaining: Duration,
}

impl WindowSlot {
    /// Locate `now_ms` in wall-clock aligned windows of length `window`
    pub fn locate(now_ms: u64, window: Duration) -> Self {
        let window_ms = (window.as_millis() as u64).max(1);
        let index = now_ms / window_ms;
        let end_ms = (index + 1) * window_ms;
        Self {
            index,
            remaining: Duration::from_millis((end_ms - now_ms).max(1)),
        }
    }

    pub fn counter_key(&self, key: &str) -> String {
        format!("{}:{}", key, self.index)
    }
}
