//! Store provider
//!
//! Uses enum dispatch for zero-cost abstraction over the configured backend. Unlike a
//! cache that can quietly degrade, coordination state has no safe fallback: an unreachable
//! Redis is reported to the caller rather than replaced with a process-local store.

use super::errors::StoreResult;
use super::providers::{MemoryStore, RedisStore};
use super::traits::{KeyPattern, RateDecision, SharedStore, SlotToken};
use crate::clock::Clock;
use crate::config::{StoreBackend, StoreConfig};
use crate::error::ToolkitResult;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// The configured shared store backend
#[derive(Debug, Clone)]
pub enum StoreProvider {
    /// Redis store (boxed to reduce enum size)
    Redis(Box<RedisStore>),
    /// In-process store
    Memory(MemoryStore),
}

impl StoreProvider {
    /// Create the backend named by the configuration, connecting if it is remote
    pub async fn from_config(config: &StoreConfig) -> ToolkitResult<Self> {
        let provider = match config.backend {
            StoreBackend::Redis => {
                Self::Redis(Box::new(RedisStore::from_config(&config.redis).await?))
            }
            StoreBackend::Memory => Self::Memory(MemoryStore::new()),
        };

        info!(
            provider = provider.provider_name(),
            distributed = provider.is_distributed(),
            "Shared store initialized"
        );
        Ok(provider)
    }

    /// In-process store on the system clock
    pub fn memory() -> Self {
        Self::Memory(MemoryStore::new())
    }

    /// In-process store on the given clock
    pub fn memory_with_clock(clock: Arc<dyn Clock>) -> Self {
        Self::Memory(MemoryStore::with_clock(clock))
    }
}

impl From<RedisStore> for StoreProvider {
    fn from(store: RedisStore) -> Self {
        Self::Redis(Box::new(store))
    }
}

impl From<MemoryStore> for StoreProvider {
    fn from(store: MemoryStore) -> Self {
        Self::Memory(store)
    }
}

impl SharedStore for StoreProvider {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        match self {
            Self::Redis(s) => s.get(key).await,
            Self::Memory(s) => s.get(key).await,
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StoreResult<()> {
        match self {
            Self::Redis(s) => s.set(key, value, ttl).await,
            Self::Memory(s) => s.set(key, value, ttl).await,
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        match self {
            Self::Redis(s) => s.delete(key).await,
            Self::Memory(s) => s.delete(key).await,
        }
    }

    async fn delete_prefix(&self, prefix: &str) -> StoreResult<u64> {
        match self {
            Self::Redis(s) => s.delete_prefix(prefix).await,
            Self::Memory(s) => s.delete_prefix(prefix).await,
        }
    }

    async fn delete_matching(&self, pattern: &KeyPattern) -> StoreResult<u64> {
        match self {
            Self::Redis(s) => s.delete_matching(pattern).await,
            Self::Memory(s) => s.delete_matching(pattern).await,
        }
    }

    async fn try_acquire_slot(
        &self,
        key: &str,
        max_concurrent: u32,
        lease: Duration,
    ) -> StoreResult<Option<SlotToken>> {
        match self {
            Self::Redis(s) => s.try_acquire_slot(key, max_concurrent, lease).await,
            Self::Memory(s) => s.try_acquire_slot(key, max_concurrent, lease).await,
        }
    }

    async fn release_slot(&self, key: &str, token: &SlotToken) -> StoreResult<bool> {
        match self {
            Self::Redis(s) => s.release_slot(key, token).await,
            Self::Memory(s) => s.release_slot(key, token).await,
        }
    }

    async fn try_acquire_rate(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> StoreResult<RateDecision> {
        match self {
            Self::Redis(s) => s.try_acquire_rate(key, limit, window).await,
            Self::Memory(s) => s.try_acquire_rate(key, limit, window).await,
        }
    }

    async fn health_check(&self) -> StoreResult<bool> {
        match self {
            Self::Redis(s) => s.health_check().await,
            Self::Memory(s) => s.health_check().await,
        }
    }

    fn provider_name(&self) -> &'static str {
        match self {
            Self::Redis(s) => s.provider_name(),
            Self::Memory(s) => s.provider_name(),
        }
    }

    fn is_distributed(&self) -> bool {
        match self {
            Self::Redis(s) => s.is_distributed(),
            Self::Memory(s) => s.is_distributed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RedisConfig;
    use crate::error::ToolkitError;

    #[tokio::test]
    async fn test_memory_backend_from_config() {
        let config = StoreConfig {
            backend: StoreBackend::Memory,
            ..Default::default()
        };
        let provider = StoreProvider::from_config(&config).await.unwrap();
        assert_eq!(provider.provider_name(), "memory");
        assert!(!provider.is_distributed());
        assert!(provider.health_check().await.unwrap());
    }

    #[tokio::test]
    async fn test_unreachable_redis_is_an_error() {
        let config = StoreConfig {
            backend: StoreBackend::Redis,
            redis: RedisConfig {
                url: Some("redis://127.0.0.1:1/0".to_string()),
                connection_timeout_ms: 500,
                ..Default::default()
            },
        };
        let result = StoreProvider::from_config(&config).await;
        assert!(matches!(result, Err(ToolkitError::StoreUnavailable(_))));
    }

    #[tokio::test]
    async fn test_dispatch_reaches_backend() {
        let provider = StoreProvider::from(MemoryStore::new());
        provider.set("k", b"v", None).await.unwrap();
        assert_eq!(provider.get("k").await.unwrap(), Some(b"v".to_vec()));
    }
}
