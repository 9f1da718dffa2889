//! Ephemeral key/value store with per-key TTL and expiration notifications.
//!
//! Every piece of cross-connection state (sessions, presence, typing flags,
//! holds) lives behind [`EphemeralStore`]. Single-key operations are atomic;
//! there is no multi-key transaction.

pub mod error;
pub mod keys;
pub mod memory;
pub mod redis_store;

pub use error::CacheError;
pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Infinite stream of expired key names. Not restartable: subscribe again
/// to get a fresh one.
pub type ExpiredKeys = BoxStream<'static, String>;

#[async_trait]
pub trait EphemeralStore: Send + Sync {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Returns whether a live key was removed.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Reset the TTL of a live key. Returns false if the key is absent.
    async fn touch(&self, key: &str, ttl: Duration) -> Result<bool, CacheError>;

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, CacheError>;

    /// Keys under `prefix` that lapse by TTL. Explicit deletes are not reported.
    async fn subscribe_expired(&self, prefix: &str) -> Result<ExpiredKeys, CacheError>;
}

/// Serialize `value` as JSON and store it under `key`.
pub async fn put_json<T: Serialize + Sync>(
    store: &dyn EphemeralStore,
    key: &str,
    value: &T,
    ttl: Duration,
) -> Result<(), CacheError> {
    let raw = serde_json::to_string(value)?;
    store.set(key, &raw, ttl).await
}

/// Fetch and decode a JSON value.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn EphemeralStore,
    key: &str,
) -> Result<Option<T>, CacheError> {
    match store.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Redis rejects `EX 0`; sub-second TTLs round up to one second.
pub(crate) fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, serde::Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[tokio::test]
    async fn json_helpers_roundtrip_through_store() {
        let store = MemoryStore::new();
        let sample = Sample {
            name: "truck".into(),
            count: 3,
        };
        put_json(&store, "sample:1", &sample, Duration::from_secs(5))
            .await
            .unwrap();
        let back: Option<Sample> = get_json(&store, "sample:1").await.unwrap();
        assert_eq!(back, Some(sample));
    }

    #[tokio::test]
    async fn get_json_reports_codec_errors() {
        let store = MemoryStore::new();
        store.set("sample:1", "not json", Duration::from_secs(5)).await.unwrap();
        let result: Result<Option<Sample>, _> = get_json(&store, "sample:1").await;
        assert!(matches!(result, Err(CacheError::Codec(_))));
    }

    #[test]
    fn ttl_rounds_up() {
        assert_eq!(ttl_secs(Duration::from_millis(200)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(900)), 900);
    }
}
