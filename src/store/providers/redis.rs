//! Redis shared store
//!
//! Uses `redis::aio::ConnectionManager` for async multiplexed connections with automatic
//! reconnection. Slot and rate-window updates run as Lua scripts so the test and the
//! increment happen in one step on the server.
//!
//! Window and lease arithmetic uses the caller's clock, so hosts sharing a store are
//! expected to keep their clocks synchronized.

use crate::clock::{Clock, SystemClock};
use crate::config::{redact_url, RedisConfig};
use crate::store::errors::{StoreError, StoreResult};
use crate::store::traits::{KeyPattern, RateDecision, SharedStore, SlotToken, WindowSlot};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Prune expired holders, test the count, then add a holder with a fresh lease.
/// KEYS[1] slot set; ARGV: now_ms, lease_ms, limit, token
const ACQUIRE_SLOT_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local lease = tonumber(ARGV[2])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now)
if redis.call('ZCARD', KEYS[1]) >= tonumber(ARGV[3]) then
  return 0
end
redis.call('ZADD', KEYS[1], now + lease, ARGV[4])
redis.call('PEXPIRE', KEYS[1], lease)
return 1
"#;

/// KEYS[1] slot set; ARGV: now_ms, token
const RELEASE_SLOT_SCRIPT: &str = r#"
local deadline = redis.call('ZSCORE', KEYS[1], ARGV[2])
redis.call('ZREM', KEYS[1], ARGV[2])
if deadline and tonumber(deadline) > tonumber(ARGV[1]) then
  return 1
end
return 0
"#;

/// KEYS[1] window counter; ARGV: remaining_ms
const INCR_WINDOW_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

/// Redis-backed implementation of [`SharedStore`]
#[derive(Clone)]
pub struct RedisStore {
    connection_manager: redis::aio::ConnectionManager,
    clock: Arc<dyn Clock>,
    operation_retries: u32,
    operation_retry_delay: Duration,
    acquire_slot: Arc<redis::Script>,
    release_slot: Arc<redis::Script>,
    incr_window: Arc<redis::Script>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("connection_manager", &"ConnectionManager")
            .field("operation_retries", &self.operation_retries)
            .field("operation_retry_delay", &self.operation_retry_delay)
            .finish()
    }
}

impl RedisStore {
    /// Connect using the system clock
    pub async fn from_config(config: &RedisConfig) -> StoreResult<Self> {
        Self::from_config_with_clock(config, Arc::new(SystemClock)).await
    }

    pub async fn from_config_with_clock(
        config: &RedisConfig,
        clock: Arc<dyn Clock>,
    ) -> StoreResult<Self> {
        let url = config.connection_url();
        let client = redis::Client::open(url.as_str()).map_err(|e| {
            StoreError::ConnectionError(format!(
                "Failed to create Redis client for {}: {}",
                redact_url(&url),
                e
            ))
        })?;
        Self::from_client_with_clock(client, config, clock).await
    }

    /// Connect through a caller-built client
    ///
    /// Connection parameters come from `client`; `config` supplies only the connect timeout
    /// and the command retry settings.
    pub async fn from_client(client: redis::Client, config: &RedisConfig) -> StoreResult<Self> {
        Self::from_client_with_clock(client, config, Arc::new(SystemClock)).await
    }

    pub async fn from_client_with_clock(
        client: redis::Client,
        config: &RedisConfig,
        clock: Arc<dyn Clock>,
    ) -> StoreResult<Self> {
        let endpoint = client.get_connection_info().addr.to_string();
        let connection_manager = tokio::time::timeout(
            config.connection_timeout(),
            redis::aio::ConnectionManager::new(client),
        )
        .await
        .map_err(|_| {
            StoreError::ConnectionError(format!(
                "Timed out connecting to Redis at {} after {:?}",
                endpoint,
                config.connection_timeout()
            ))
        })?
        .map_err(|e| {
            StoreError::ConnectionError(format!("Failed to connect to Redis at {}: {}", endpoint, e))
        })?;

        debug!(endpoint = %endpoint, "Redis shared store connected");

        Ok(Self::from_connection_manager(connection_manager, clock)
            .with_operation_retries(config.operation_retries, config.operation_retry_delay()))
    }

    /// Wrap an established connection manager
    ///
    /// Commands are retried with the default [`RedisConfig`] settings unless
    /// [`with_operation_retries`](Self::with_operation_retries) says otherwise.
    pub fn from_connection_manager(
        connection_manager: redis::aio::ConnectionManager,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let defaults = RedisConfig::default();
        Self {
            connection_manager,
            clock,
            operation_retries: defaults.operation_retries,
            operation_retry_delay: defaults.operation_retry_delay(),
            acquire_slot: Arc::new(redis::Script::new(ACQUIRE_SLOT_SCRIPT)),
            release_slot: Arc::new(redis::Script::new(RELEASE_SLOT_SCRIPT)),
            incr_window: Arc::new(redis::Script::new(INCR_WINDOW_SCRIPT)),
        }
    }

    pub fn with_operation_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.operation_retries = retries;
        self.operation_retry_delay = delay;
        self
    }

    /// SCAN for `pattern` and delete the matches in batches
    async fn scan_delete(&self, pattern: &KeyPattern) -> StoreResult<u64> {
        let glob = pattern.to_glob();
        let mut deleted: u64 = 0;
        let mut cursor: u64 = 0;

        // Use SCAN to iterate without blocking the server
        loop {
            let (next_cursor, keys): (u64, Vec<String>) = self
                .run("SCAN", |mut conn| {
                    let glob = glob.clone();
                    async move {
                        redis::cmd("SCAN")
                            .arg(cursor)
                            .arg("MATCH")
                            .arg(glob)
                            .arg("COUNT")
                            .arg(100)
                            .query_async(&mut conn)
                            .await
                    }
                })
                .await?;

            let keys: Vec<String> = keys.into_iter().filter(|k| pattern.matches(k)).collect();
            if !keys.is_empty() {
                let count: u64 = self
                    .run("DEL (batch)", |mut conn| {
                        let keys = keys.clone();
                        async move { redis::cmd("DEL").arg(keys).query_async(&mut conn).await }
                    })
                    .await?;
                deleted += count;
            }

            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        Ok(deleted)
    }

    /// Run one command, retrying transport failures before giving up
    ///
    /// A retried write may already have been applied once; for rate counters that can only
    /// over-count, never admit extra calls.
    async fn run<T, F, Fut>(&self, operation: &'static str, mut command: F) -> StoreResult<T>
    where
        F: FnMut(redis::aio::ConnectionManager) -> Fut,
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match command(self.connection_manager.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) if is_transient(&e) && attempt < self.operation_retries => {
                    attempt += 1;
                    warn!(
                        operation = operation,
                        attempt = attempt,
                        error = %e,
                        "Redis command failed, retrying"
                    );
                    tokio::time::sleep(self.operation_retry_delay).await;
                }
                Err(e) if is_transient(&e) => {
                    return Err(StoreError::ConnectionError(format!(
                        "Redis {} failed after {} attempts: {}",
                        operation,
                        attempt + 1,
                        e
                    )));
                }
                Err(e) => {
                    return Err(StoreError::BackendError(format!(
                        "Redis {} failed: {}",
                        operation, e
                    )));
                }
            }
        }
    }
}

fn is_transient(error: &redis::RedisError) -> bool {
    error.is_io_error()
        || error.is_timeout()
        || error.is_connection_dropped()
        || error.is_connection_refusal()
}

impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let result: Option<Vec<u8>> = self
            .run("GET", |mut conn| async move {
                redis::cmd("GET").arg(key).query_async(&mut conn).await
            })
            .await?;

        if result.is_some() {
            debug!(key = key, "Store HIT");
        } else {
            debug!(key = key, "Store MISS");
        }

        Ok(result)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StoreResult<()> {
        let ttl_ms = ttl.map(|ttl| (ttl.as_millis() as u64).max(1));

        self.run("SET", |mut conn| async move {
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(value);
            if let Some(ms) = ttl_ms {
                cmd.arg("PX").arg(ms);
            }
            cmd.query_async::<()>(&mut conn).await
        })
        .await?;

        debug!(key = key, ttl_ms = ?ttl_ms, "Store SET");
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let removed: u64 = self
            .run("DEL", |mut conn| async move {
                redis::cmd("DEL").arg(key).query_async(&mut conn).await
            })
            .await?;

        debug!(key = key, removed = removed, "Store DEL");
        Ok(removed > 0)
    }

    async fn delete_prefix(&self, prefix: &str) -> StoreResult<u64> {
        let deleted = self.scan_delete(&KeyPattern::prefix(prefix)).await?;
        debug!(prefix = prefix, deleted = deleted, "Store prefix DEL");
        Ok(deleted)
    }

    async fn delete_matching(&self, pattern: &KeyPattern) -> StoreResult<u64> {
        let deleted = self.scan_delete(pattern).await?;
        debug!(pattern = %pattern.to_glob(), deleted = deleted, "Store pattern DEL");
        Ok(deleted)
    }

    async fn try_acquire_slot(
        &self,
        key: &str,
        max_concurrent: u32,
        lease: Duration,
    ) -> StoreResult<Option<SlotToken>> {
        let token = SlotToken::generate();
        let now_ms = self.clock.now_ms();
        let lease_ms = (lease.as_millis() as u64).max(1);

        let acquired: i64 = self
            .run("acquire slot", |mut conn| {
                let script = Arc::clone(&self.acquire_slot);
                let token = token.as_str().to_string();
                async move {
                    script
                        .key(key)
                        .arg(now_ms)
                        .arg(lease_ms)
                        .arg(max_concurrent)
                        .arg(token)
                        .invoke_async(&mut conn)
                        .await
                }
            })
            .await?;

        Ok((acquired == 1).then_some(token))
    }

    async fn release_slot(&self, key: &str, token: &SlotToken) -> StoreResult<bool> {
        let now_ms = self.clock.now_ms();

        let released: i64 = self
            .run("release slot", |mut conn| {
                let script = Arc::clone(&self.release_slot);
                async move {
                    script
                        .key(key)
                        .arg(now_ms)
                        .arg(token.as_str())
                        .invoke_async(&mut conn)
                        .await
                }
            })
            .await?;

        Ok(released == 1)
    }

    async fn try_acquire_rate(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> StoreResult<RateDecision> {
        let slot = WindowSlot::locate(self.clock.now_ms(), window);
        let counter_key = slot.counter_key(key);
        let remaining_ms = slot.remaining.as_millis() as u64;

        let count: u64 = self
            .run("incr window", |mut conn| {
                let script = Arc::clone(&self.incr_window);
                let counter_key = counter_key.clone();
                async move {
                    script
                        .key(counter_key)
                        .arg(remaining_ms)
                        .invoke_async(&mut conn)
                        .await
                }
            })
            .await?;

        if count <= limit {
            Ok(RateDecision::Allowed { count })
        } else {
            Ok(RateDecision::Denied {
                count,
                retry_after: slot.remaining,
            })
        }
    }

    async fn health_check(&self) -> StoreResult<bool> {
        let pong: String = self
            .run("PING", |mut conn| async move {
                redis::cmd("PING").query_async(&mut conn).await
            })
            .await?;

        Ok(pong == "PONG")
    }

    fn provider_name(&self) -> &'static str {
        "redis"
    }

    fn is_distributed(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_from_client_unreachable_is_connection_error() {
        let client = redis::Client::open("redis://127.0.0.1:1/0").unwrap();
        let config = RedisConfig {
            connection_timeout_ms: 300,
            ..Default::default()
        };

        match RedisStore::from_client(client, &config).await {
            Err(StoreError::ConnectionError(message)) => {
                assert!(message.contains("127.0.0.1:1"), "{message}");
            }
            other => panic!("expected connection error, got {other:?}"),
        }
    }

    // Integration tests require a running Redis instance (behind test-services feature)
    #[cfg(feature = "test-services")]
    mod integration {
        use super::*;
        use crate::clock::ManualClock;

        fn test_redis_config() -> RedisConfig {
            RedisConfig {
                url: Some(
                    std::env::var("REDIS_URL")
                        .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
                ),
                ..Default::default()
            }
        }

        async fn connect(clock: Arc<dyn Clock>) -> Option<RedisStore> {
            match RedisStore::from_config_with_clock(&test_redis_config(), clock).await {
                Ok(store) => Some(store),
                Err(e) => {
                    warn!("Skipping Redis test (not available): {}", e);
                    None
                }
            }
        }

        fn unique(label: &str) -> String {
            format!("test:{}:{}", label, uuid::Uuid::new_v4().simple())
        }

        #[tokio::test]
        async fn test_redis_crud_operations() {
            let Some(store) = connect(Arc::new(SystemClock)).await else {
                return;
            };
            let key = unique("crud");

            store
                .set(&key, br#"{"ok":true}"#, Some(Duration::from_secs(60)))
                .await
                .unwrap();
            assert_eq!(
                store.get(&key).await.unwrap(),
                Some(br#"{"ok":true}"#.to_vec())
            );
            assert!(store.delete(&key).await.unwrap());
            assert_eq!(store.get(&key).await.unwrap(), None);
            assert!(store.health_check().await.unwrap());
        }

        #[tokio::test]
        async fn test_redis_delete_prefix() {
            let Some(store) = connect(Arc::new(SystemClock)).await else {
                return;
            };
            let prefix = format!("{}:", unique("prefix"));

            for i in 0..5 {
                store
                    .set(&format!("{prefix}{i}"), b"x", Some(Duration::from_secs(60)))
                    .await
                    .unwrap();
            }
            let neighbour = format!("{}x:0", prefix.trim_end_matches(':'));
            store
                .set(&neighbour, b"x", Some(Duration::from_secs(60)))
                .await
                .unwrap();

            assert_eq!(store.delete_prefix(&prefix).await.unwrap(), 5);
            assert!(store.get(&neighbour).await.unwrap().is_some());
            store.delete(&neighbour).await.unwrap();
        }

        #[tokio::test]
        async fn test_redis_from_prebuilt_client() {
            let url = test_redis_config().connection_url();
            let client = redis::Client::open(url.as_str()).unwrap();
            let store = match RedisStore::from_client(client.clone(), &RedisConfig::default()).await {
                Ok(store) => store,
                Err(e) => {
                    warn!("Skipping Redis test (not available): {}", e);
                    return;
                }
            };
            assert!(store.health_check().await.unwrap());

            let manager = redis::aio::ConnectionManager::new(client).await.unwrap();
            let shared = RedisStore::from_connection_manager(manager, Arc::new(SystemClock))
                .with_operation_retries(0, Duration::ZERO);
            let key = unique("prebuilt");
            store.set(&key, b"v", Some(Duration::from_secs(30))).await.unwrap();
            assert_eq!(shared.get(&key).await.unwrap(), Some(b"v".to_vec()));
            shared.delete(&key).await.unwrap();
        }

        #[tokio::test]
        async fn test_redis_delete_matching() {
            let Some(store) = connect(Arc::new(SystemClock)).await else {
                return;
            };
            let base = unique("match");
            for key in ["m=1:u=a", "m=2:u=a", "m=1:u=b"] {
                store
                    .set(&format!("{base}:{key}"), b"x", Some(Duration::from_secs(60)))
                    .await
                    .unwrap();
            }

            let pattern = KeyPattern::literal(format!("{base}:m="))
                .wildcard()
                .then(":u=a");
            assert_eq!(store.delete_matching(&pattern).await.unwrap(), 2);
            assert!(store.get(&format!("{base}:m=1:u=b")).await.unwrap().is_some());
            store.delete_prefix(&base).await.unwrap();
        }

        #[tokio::test]
        async fn test_redis_slots() {
            let Some(store) = connect(Arc::new(SystemClock)).await else {
                return;
            };
            let key = unique("slots");
            let lease = Duration::from_secs(30);

            let a = store.try_acquire_slot(&key, 2, lease).await.unwrap().unwrap();
            let b = store.try_acquire_slot(&key, 2, lease).await.unwrap().unwrap();
            assert!(store.try_acquire_slot(&key, 2, lease).await.unwrap().is_none());

            assert!(store.release_slot(&key, &a).await.unwrap());
            assert!(!store.release_slot(&key, &a).await.unwrap());
            assert!(store.try_acquire_slot(&key, 2, lease).await.unwrap().is_some());
            store.release_slot(&key, &b).await.unwrap();
            store.delete(&key).await.unwrap();
        }

        #[tokio::test]
        async fn test_redis_rate_window() {
            let clock = ManualClock::new(1_700_000_000_000);
            let Some(store) = connect(Arc::new(clock.clone())).await else {
                return;
            };
            let key = unique("rate");
            let window = Duration::from_secs(60);

            for _ in 0..3 {
                assert!(store.try_acquire_rate(&key, 3, window).await.unwrap().is_allowed());
            }
            assert!(!store.try_acquire_rate(&key, 3, window).await.unwrap().is_allowed());

            clock.advance(window);
            assert!(store.try_acquire_rate(&key, 3, window).await.unwrap().is_allowed());
            store.delete_prefix(&key).await.unwrap();
        }
    }
}
