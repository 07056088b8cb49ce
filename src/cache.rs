//! # Cache Coordinator
//!
//! Serves, populates and invalidates cached call results in the shared store. Entries are
//! stored under the fingerprint's segmented key (see [`Fingerprint::key`]) as a small JSON
//! envelope around the serialized result, and their lifetime is owned by the store's TTL
//! from then on. The per-field segments let [`CacheCoordinator::invalidate_matching`] drop
//! every entry that agrees with a sample call on a chosen set of fields.
//!
//! A cache hit bypasses admission and classification entirely; the value was accepted once
//! already.

use crate::error::{ToolkitError, ToolkitResult};
use crate::fingerprint::{validate_namespace, Fingerprint, SignatureField};
use crate::logging::log_cache_operation;
use crate::store::{SharedStore, StoreProvider};
use chrono::{DateTime, Utc};
use serde::de::{self, DeserializeOwned, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Lifetime of a cache entry
///
/// In configuration files a TTL is a number of seconds or the string `infinite`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTtl {
    /// Kept until explicitly invalidated
    Infinite,
    /// Expires after the duration; a zero duration disables storing
    Expires(Duration),
}

impl CacheTtl {
    pub fn seconds(secs: u64) -> Self {
        Self::Expires(Duration::from_secs(secs))
    }

    /// TTL handed to the store; `None` means never expire
    pub fn as_store_ttl(&self) -> Option<Duration> {
        match self {
            Self::Infinite => None,
            Self::Expires(ttl) => Some(*ttl),
        }
    }

    pub fn is_storable(&self) -> bool {
        !matches!(self, Self::Expires(ttl) if ttl.is_zero())
    }
}

impl fmt::Display for CacheTtl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Infinite => f.write_str("infinite"),
            Self::Expires(ttl) => write!(f, "{}s", ttl.as_secs_f64()),
        }
    }
}

impl Serialize for CacheTtl {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Infinite => serializer.serialize_str("infinite"),
            Self::Expires(ttl) if ttl.subsec_nanos() == 0 => serializer.serialize_u64(ttl.as_secs()),
            Self::Expires(ttl) => serializer.serialize_f64(ttl.as_secs_f64()),
        }
    }
}

struct CacheTtlVisitor;

impl<'de> Visitor<'de> for CacheTtlVisitor {
    type Value = CacheTtl;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a number of seconds or \"infinite\"")
    }

    fn visit_u64<E: de::Error>(self, secs: u64) -> Result<CacheTtl, E> {
        Ok(CacheTtl::seconds(secs))
    }

    fn visit_i64<E: de::Error>(self, secs: i64) -> Result<CacheTtl, E> {
        u64::try_from(secs)
            .map(CacheTtl::seconds)
            .map_err(|_| E::custom(format!("ttl must not be negative, got {secs}")))
    }

    fn visit_f64<E: de::Error>(self, secs: f64) -> Result<CacheTtl, E> {
        Duration::try_from_secs_f64(secs)
            .map(CacheTtl::Expires)
            .map_err(|_| E::custom(format!("invalid ttl {secs}")))
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<CacheTtl, E> {
        let value = value.trim();
        if value.eq_ignore_ascii_case("infinite") || value.eq_ignore_ascii_case("inf") {
            return Ok(CacheTtl::Infinite);
        }
        if let Ok(secs) = value.parse::<u64>() {
            return Ok(CacheTtl::seconds(secs));
        }
        match value.parse::<f64>() {
            Ok(secs) => self.visit_f64(secs),
            Err(_) => Err(E::invalid_value(de::Unexpected::Str(value), &self)),
        }
    }
}

impl<'de> Deserialize<'de> for CacheTtl {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(CacheTtlVisitor)
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope<P> {
    ttl: CacheTtl,
    stored_at: DateTime<Utc>,
    payload: P,
}

/// A cached result together with how it was stored
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    pub fingerprint: Fingerprint,
    pub payload: T,
    pub ttl: CacheTtl,
    pub stored_at: DateTime<Utc>,
}

/// Reads and writes cached results in the shared store
#[derive(Debug, Clone)]
pub struct CacheCoordinator {
    store: Arc<StoreProvider>,
    prefix: String,
}

impl CacheCoordinator {
    pub fn new(store: Arc<StoreProvider>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Fetch the entry for `fingerprint`; `Ok(None)` is a miss
    ///
    /// A store failure is an error, never a miss.
    pub async fn lookup<T: DeserializeOwned>(
        &self,
        fingerprint: &Fingerprint,
    ) -> ToolkitResult<Option<CacheEntry<T>>> {
        let key = fingerprint.key(&self.prefix);
        let Some(bytes) = self.store.get(&key).await? else {
            debug!(key = %key, "Cache MISS");
            return Ok(None);
        };

        let envelope: Envelope<T> = serde_json::from_slice(&bytes).map_err(|e| {
            ToolkitError::Serialization(format!("cached entry '{key}' is unreadable: {e}"))
        })?;

        debug!(key = %key, "Cache HIT");
        Ok(Some(CacheEntry {
            fingerprint: fingerprint.clone(),
            payload: envelope.payload,
            ttl: envelope.ttl,
            stored_at: envelope.stored_at,
        }))
    }

    /// Store `payload` for `fingerprint`; returns false when the TTL disables storing
    pub async fn store<T: Serialize>(
        &self,
        fingerprint: &Fingerprint,
        payload: &T,
        ttl: CacheTtl,
    ) -> ToolkitResult<bool> {
        if !ttl.is_storable() {
            return Ok(false);
        }

        let key = fingerprint.key(&self.prefix);
        let envelope = Envelope {
            ttl,
            stored_at: Utc::now(),
            payload,
        };
        let bytes = serde_json::to_vec(&envelope)?;
        self.store.set(&key, &bytes, ttl.as_store_ttl()).await?;

        debug!(key = %key, ttl = %ttl, "Cache SET");
        Ok(true)
    }

    /// Remove exactly the entry for `fingerprint`, returning the number of keys removed
    pub async fn invalidate(&self, fingerprint: &Fingerprint) -> ToolkitResult<u64> {
        let removed = self.store.delete(&fingerprint.key(&self.prefix)).await?;
        let removed = u64::from(removed);
        log_cache_operation(
            "invalidate",
            fingerprint.namespace(),
            Some(fingerprint.digest()),
            if removed > 0 { "removed" } else { "absent" },
            None,
        );
        Ok(removed)
    }

    /// Remove every entry of the sample's namespace that agrees with it on `fields`
    ///
    /// With no fields this clears the namespace; with every field it is [`Self::invalidate`].
    pub async fn invalidate_matching(
        &self,
        sample: &Fingerprint,
        fields: &[SignatureField],
    ) -> ToolkitResult<u64> {
        let pattern = sample.key_pattern(&self.prefix, fields);
        let removed = self.store.delete_matching(&pattern).await?;
        let details = format!("{removed} entries removed matching {:?}", fields);
        log_cache_operation(
            "invalidate_matching",
            sample.namespace(),
            None,
            "cleared",
            Some(&details),
        );
        Ok(removed)
    }

    /// Remove every entry of `namespace`, returning the number of keys removed
    pub async fn clear_prefix(&self, namespace: &str) -> ToolkitResult<u64> {
        validate_namespace(namespace)?;
        let removed = self
            .store
            .delete_prefix(&format!("{}:{}:", self.prefix, namespace))
            .await?;
        let details = format!("{removed} entries removed");
        log_cache_operation("clear_prefix", namespace, None, "cleared", Some(&details));
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::fingerprint::{CallSignature, FingerprintBuilder};
    use serde_json::json;

    fn coordinator() -> (CacheCoordinator, ManualClock) {
        let clock = ManualClock::new(1_000_000);
        let store = Arc::new(StoreProvider::memory_with_clock(Arc::new(clock.clone())));
        (CacheCoordinator::new(store, "cache"), clock)
    }

    fn fingerprint(ns: &str, target: &str) -> Fingerprint {
        FingerprintBuilder::new(ns)
            .unwrap()
            .build(&CallSignature::new("GET", target))
    }

    #[test]
    fn test_ttl_parsing() {
        let ttl: CacheTtl = serde_json::from_value(json!(60)).unwrap();
        assert_eq!(ttl, CacheTtl::seconds(60));
        let ttl: CacheTtl = serde_json::from_value(json!("infinite")).unwrap();
        assert_eq!(ttl, CacheTtl::Infinite);
        let ttl: CacheTtl = serde_json::from_value(json!("90")).unwrap();
        assert_eq!(ttl, CacheTtl::seconds(90));
        let ttl: CacheTtl = serde_json::from_value(json!(0.5)).unwrap();
        assert_eq!(ttl, CacheTtl::Expires(Duration::from_millis(500)));

        assert!(serde_json::from_value::<CacheTtl>(json!(-1)).is_err());
        assert!(serde_json::from_value::<CacheTtl>(json!("forever-ish")).is_err());
    }

    #[test]
    fn test_ttl_serializes_back_to_config_form() {
        assert_eq!(serde_json::to_value(CacheTtl::Infinite).unwrap(), json!("infinite"));
        assert_eq!(serde_json::to_value(CacheTtl::seconds(30)).unwrap(), json!(30));
    }

    #[tokio::test]
    async fn test_store_then_lookup() {
        let (cache, _clock) = coordinator();
        let fp = fingerprint("users", "/users/1");

        assert!(cache.lookup::<serde_json::Value>(&fp).await.unwrap().is_none());
        assert!(cache
            .store(&fp, &json!({"id": 1}), CacheTtl::seconds(60))
            .await
            .unwrap());

        let entry = cache.lookup::<serde_json::Value>(&fp).await.unwrap().unwrap();
        assert_eq!(entry.payload, json!({"id": 1}));
        assert_eq!(entry.ttl, CacheTtl::seconds(60));
        assert_eq!(entry.fingerprint, fp);
    }

    #[tokio::test]
    async fn test_entries_expire_after_ttl() {
        let (cache, clock) = coordinator();
        let fp = fingerprint("users", "/users/1");
        cache.store(&fp, &"P", CacheTtl::seconds(60)).await.unwrap();

        clock.advance(Duration::from_secs(30));
        assert!(cache.lookup::<String>(&fp).await.unwrap().is_some());

        clock.advance(Duration::from_secs(31));
        assert!(cache.lookup::<String>(&fp).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_infinite_ttl_survives_until_invalidated() {
        let (cache, clock) = coordinator();
        let fp = fingerprint("rates", "/rates");
        cache.store(&fp, &42u32, CacheTtl::Infinite).await.unwrap();

        clock.advance(Duration::from_secs(10 * 365 * 24 * 3600));
        assert_eq!(cache.lookup::<u32>(&fp).await.unwrap().unwrap().payload, 42);

        assert_eq!(cache.invalidate(&fp).await.unwrap(), 1);
        assert_eq!(cache.invalidate(&fp).await.unwrap(), 0);
        assert!(cache.lookup::<u32>(&fp).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_zero_ttl_is_not_stored() {
        let (cache, _clock) = coordinator();
        let fp = fingerprint("users", "/users/1");
        assert!(!cache.store(&fp, &1u8, CacheTtl::seconds(0)).await.unwrap());
        assert!(cache.lookup::<u8>(&fp).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_prefix_leaves_other_namespaces() {
        let (cache, _clock) = coordinator();
        for i in 0..3 {
            let fp = fingerprint("users", &format!("/users/{i}"));
            cache.store(&fp, &i, CacheTtl::Infinite).await.unwrap();
        }
        let other = fingerprint("users2", "/users/0");
        cache.store(&other, &0, CacheTtl::Infinite).await.unwrap();

        assert_eq!(cache.clear_prefix("users").await.unwrap(), 3);
        assert!(cache.lookup::<i32>(&other).await.unwrap().is_some());
        assert!(cache.clear_prefix("bad*ns").await.is_err());
    }

    #[tokio::test]
    async fn test_invalidate_matching_by_field() {
        let (cache, _clock) = coordinator();
        let builder = FingerprintBuilder::new("shop").unwrap();
        let page = |target: &str, n: &str| {
            builder.build(&CallSignature::new("GET", target).query_param("page", n))
        };
        let entries = [
            page("/orders", "1"),
            page("/orders", "2"),
            page("/users", "1"),
            builder.build(&CallSignature::new("DELETE", "/orders").query_param("page", "1")),
        ];
        for fp in &entries {
            cache.store(fp, &json!({"ok": true}), CacheTtl::Infinite).await.unwrap();
        }

        // Every GET /orders regardless of query
        let removed = cache
            .invalidate_matching(&entries[0], &[SignatureField::Method, SignatureField::Target])
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert!(cache.lookup::<serde_json::Value>(&entries[1]).await.unwrap().is_none());
        assert!(cache.lookup::<serde_json::Value>(&entries[2]).await.unwrap().is_some());
        assert!(cache.lookup::<serde_json::Value>(&entries[3]).await.unwrap().is_some());

        // Page 1 of anything
        let removed = cache
            .invalidate_matching(&entries[2], &[SignatureField::Query])
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(cache.invalidate_matching(&entries[0], &[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unreadable_entry_is_a_serialization_error() {
        let (cache, _clock) = coordinator();
        let fp = fingerprint("users", "/users/1");
        cache.store(&fp, &"text", CacheTtl::Infinite).await.unwrap();

        let result = cache.lookup::<u64>(&fp).await;
        assert!(matches!(result, Err(ToolkitError::Serialization(_))));
    }
}
