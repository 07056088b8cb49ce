//! In-process shared store
//!
//! Implements the full store contract against a mutex-guarded map, with expiry driven by an
//! injectable [`Clock`]. State is visible to every clone of the store but not to other
//! processes, so limits enforced through it are process-wide rather than fleet-wide.

use crate::clock::{Clock, SystemClock};
use crate::store::errors::StoreResult;
use crate::store::traits::{KeyPattern, RateDecision, SharedStore, SlotToken, WindowSlot};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug)]
struct StoredValue {
    bytes: Vec<u8>,
    expires_at_ms: Option<u64>,
}

impl StoredValue {
    fn is_live(&self, now_ms: u64) -> bool {
        self.expires_at_ms.map_or(true, |at| now_ms < at)
    }
}

#[derive(Debug)]
struct WindowCounter {
    count: u64,
    expires_at_ms: u64,
}

#[derive(Debug, Default)]
struct MemoryState {
    values: HashMap<String, StoredValue>,
    /// slot key -> token -> lease deadline
    slots: HashMap<String, HashMap<String, u64>>,
    /// window counter key -> counter
    windows: HashMap<String, WindowCounter>,
}

impl MemoryState {
    fn prune(&mut self, now_ms: u64) {
        self.values.retain(|_, v| v.is_live(now_ms));
        self.windows.retain(|_, w| now_ms < w.expires_at_ms);
        for holders in self.slots.values_mut() {
            holders.retain(|_, deadline| now_ms < *deadline);
        }
        self.slots.retain(|_, holders| !holders.is_empty());
    }

    fn entry_count(&self) -> usize {
        self.values.len() + self.windows.len() + self.slots.len()
    }

    /// Drop every key `keep` rejects, returning how many went
    fn remove_keys(&mut self, keep: impl Fn(&str) -> bool) -> u64 {
        let before = self.entry_count();
        self.values.retain(|k, _| keep(k));
        self.windows.retain(|k, _| keep(k));
        self.slots.retain(|k, _| keep(k));
        (before - self.entry_count()) as u64
    }
}

/// Single-process implementation of [`SharedStore`]
#[derive(Debug, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    clock: Arc<dyn Clock>,
    /// Operations scheduled to fail once, in order
    #[cfg(test)]
    faults: Arc<Mutex<Vec<&'static str>>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            clock,
            #[cfg(test)]
            faults: Arc::default(),
        }
    }

    /// Make the next call of `operation` (a `SharedStore` method name) fail as if the
    /// backend were unreachable
    #[cfg(test)]
    pub(crate) fn fail_next(&self, operation: &'static str) {
        self.faults.lock().push(operation);
    }

    #[cfg(test)]
    fn injected_fault(&self, operation: &'static str) -> StoreResult<()> {
        let mut faults = self.faults.lock();
        match faults.iter().position(|op| *op == operation) {
            Some(at) => {
                faults.remove(at);
                Err(crate::store::StoreError::ConnectionError(format!(
                    "{operation}: connection reset"
                )))
            }
            None => Ok(()),
        }
    }

    #[cfg(not(test))]
    #[inline]
    fn injected_fault(&self, _operation: &'static str) -> StoreResult<()> {
        Ok(())
    }

    /// Number of live entries of every kind; used by tests to check nothing leaks
    pub fn live_entries(&self) -> usize {
        let now_ms = self.clock.now_ms();
        let mut state = self.state.lock();
        state.prune(now_ms);
        state.values.len() + state.windows.len() + state.slots.values().map(HashMap::len).sum::<usize>()
    }
}

impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.injected_fault("get")?;
        let now_ms = self.clock.now_ms();
        let mut state = self.state.lock();
        let live = state.values.get(key).map(|value| value.is_live(now_ms));
        match live {
            Some(true) => Ok(state.values.get(key).map(|value| value.bytes.clone())),
            Some(false) => {
                state.values.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StoreResult<()> {
        self.injected_fault("set")?;
        let now_ms = self.clock.now_ms();
        let expires_at_ms = ttl.map(|ttl| now_ms + ttl.as_millis() as u64);
        let mut state = self.state.lock();
        state.prune(now_ms);
        state.values.insert(
            key.to_string(),
            StoredValue {
                bytes: value.to_vec(),
                expires_at_ms,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.injected_fault("delete")?;
        let now_ms = self.clock.now_ms();
        let removed = self.state.lock().values.remove(key);
        Ok(removed.is_some_and(|v| v.is_live(now_ms)))
    }

    async fn delete_prefix(&self, prefix: &str) -> StoreResult<u64> {
        self.injected_fault("delete_prefix")?;
        let now_ms = self.clock.now_ms();
        let mut state = self.state.lock();
        state.prune(now_ms);

        let deleted = state.remove_keys(|k| !k.starts_with(prefix));
        debug!(prefix = prefix, deleted = deleted, "Memory store prefix DEL");
        Ok(deleted)
    }

    async fn delete_matching(&self, pattern: &KeyPattern) -> StoreResult<u64> {
        self.injected_fault("delete_matching")?;
        let now_ms = self.clock.now_ms();
        let mut state = self.state.lock();
        state.prune(now_ms);

        let deleted = state.remove_keys(|k| !pattern.matches(k));
        debug!(pattern = %pattern.to_glob(), deleted = deleted, "Memory store pattern DEL");
        Ok(deleted)
    }

    async fn try_acquire_slot(
        &self,
        key: &str,
        max_concurrent: u32,
        lease: Duration,
    ) -> StoreResult<Option<SlotToken>> {
        self.injected_fault("try_acquire_slot")?;
        let now_ms = self.clock.now_ms();
        let mut state = self.state.lock();
        let holders = state.slots.entry(key.to_string()).or_default();
        holders.retain(|_, deadline| now_ms < *deadline);

        if holders.len() >= max_concurrent as usize {
            return Ok(None);
        }

        let token = SlotToken::generate();
        holders.insert(
            token.as_str().to_string(),
            now_ms + lease.as_millis() as u64,
        );
        Ok(Some(token))
    }

    async fn release_slot(&self, key: &str, token: &SlotToken) -> StoreResult<bool> {
        self.injected_fault("release_slot")?;
        let now_ms = self.clock.now_ms();
        let mut state = self.state.lock();
        let Some(holders) = state.slots.get_mut(key) else {
            return Ok(false);
        };
        let released = holders
            .remove(token.as_str())
            .is_some_and(|deadline| now_ms < deadline);
        if holders.is_empty() {
            state.slots.remove(key);
        }
        Ok(released)
    }

    async fn try_acquire_rate(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> StoreResult<RateDecision> {
        self.injected_fault("try_acquire_rate")?;
        let now_ms = self.clock.now_ms();
        let slot = WindowSlot::locate(now_ms, window);
        let mut state = self.state.lock();
        state.windows.retain(|_, w| now_ms < w.expires_at_ms);

        let counter = state
            .windows
            .entry(slot.counter_key(key))
            .or_insert(WindowCounter {
                count: 0,
                expires_at_ms: now_ms + slot.remaining.as_millis() as u64,
            });
        counter.count += 1;

        if counter.count <= limit {
            Ok(RateDecision::Allowed {
                count: counter.count,
            })
        } else {
            Ok(RateDecision::Denied {
                count: counter.count,
                retry_after: slot.remaining,
            })
        }
    }

    async fn health_check(&self) -> StoreResult<bool> {
        self.injected_fault("health_check")?;
        Ok(true)
    }

    fn provider_name(&self) -> &'static str {
        "memory"
    }

    fn is_distributed(&self) -> bool {
        false
    }
}
