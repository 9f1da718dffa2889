use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;

use crate::{CacheError, EphemeralStore, ExpiredKeys};

const EXPIRY_CHANNEL_CAPACITY: usize = 1024;

struct Entry {
    value: String,
    deadline: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.deadline > now
    }
}

/// In-process store for single-node deployments and tests.
///
/// Deadlines use the tokio clock, so tests can drive expiry with paused
/// time. Expired keys are reported once, either when a reader trips over
/// them or when [`MemoryStore::purge_expired`] sweeps.
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    expired_tx: broadcast::Sender<String>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (expired_tx, _) = broadcast::channel(EXPIRY_CHANNEL_CAPACITY);
        Self {
            entries: DashMap::new(),
            expired_tx,
        }
    }

    /// Remove every lapsed key and publish it to expiry subscribers.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let lapsed: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| !entry.value().is_live(now))
            .map(|entry| entry.key().clone())
            .collect();

        lapsed
            .into_iter()
            .filter(|key| self.expire_key(key, now))
            .count()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.value().is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expire_key(&self, key: &str, now: Instant) -> bool {
        let removed = self
            .entries
            .remove_if(key, |_, entry| !entry.is_live(now))
            .is_some();
        if removed {
            // No subscribers is fine.
            let _ = self.expired_tx.send(key.to_string());
        }
        removed
    }
}

/// Periodically sweep lapsed keys. Stops once the store is dropped.
pub fn spawn_reaper(store: &Arc<MemoryStore>, every: Duration) -> tokio::task::JoinHandle<()> {
    let store = Arc::downgrade(store);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let Some(store) = store.upgrade() else {
                break;
            };
            let purged = store.purge_expired();
            if purged > 0 {
                tracing::debug!(purged, "expired ephemeral keys");
            }
        }
    })
}

#[async_trait]
impl EphemeralStore for MemoryStore {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                deadline: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = Instant::now();
        {
            let Some(entry) = self.entries.get(key) else {
                return Ok(None);
            };
            if entry.is_live(now) {
                return Ok(Some(entry.value.clone()));
            }
        }
        self.expire_key(key, now);
        Ok(None)
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let now = Instant::now();
        match self.entries.remove(key) {
            Some((_, entry)) if entry.is_live(now) => Ok(true),
            Some(_) => {
                // Lapsed before the delete arrived: it expired, report it so.
                let _ = self.expired_tx.send(key.to_string());
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn touch(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let now = Instant::now();
        {
            let Some(mut entry) = self.entries.get_mut(key) else {
                return Ok(false);
            };
            if entry.is_live(now) {
                entry.deadline = now + ttl;
                return Ok(true);
            }
        }
        self.expire_key(key, now);
        Ok(false)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, CacheError> {
        let now = Instant::now();
        let mut live = Vec::new();
        let mut lapsed = Vec::new();
        for entry in self.entries.iter().filter(|e| e.key().starts_with(prefix)) {
            if entry.value().is_live(now) {
                live.push((entry.key().clone(), entry.value().value.clone()));
            } else {
                lapsed.push(entry.key().clone());
            }
        }
        for key in lapsed {
            self.expire_key(&key, now);
        }
        live.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(live)
    }

    async fn subscribe_expired(&self, prefix: &str) -> Result<ExpiredKeys, CacheError> {
        let prefix = prefix.to_string();
        let stream = BroadcastStream::new(self.expired_tx.subscribe()).filter_map(move |item| {
            let key = match item {
                Ok(key) if key.starts_with(&prefix) => Some(key),
                Ok(_) => None,
                Err(err) => {
                    tracing::warn!(error = %err, "expiry subscriber lagged, notifications dropped");
                    None
                }
            };
            futures::future::ready(key)
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_delete() {
        let store = MemoryStore::new();
        store.set("k", "v", Duration::from_secs(10)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_overwrites() {
        let store = MemoryStore::new();
        store.set("k", "one", Duration::from_secs(10)).await.unwrap();
        store.set("k", "two", Duration::from_secs(10)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("two"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_lapse_after_ttl() {
        let store = MemoryStore::new();
        store.set("k", "v", Duration::from_secs(10)).await.unwrap();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(store.get("k").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn touch_extends_deadline() {
        let store = MemoryStore::new();
        store.set("k", "v", Duration::from_secs(10)).await.unwrap();

        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(store.touch("k", Duration::from_secs(10)).await.unwrap());

        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(store.get("k").await.unwrap().is_some());

        assert!(!store.touch("missing", Duration::from_secs(10)).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn scan_prefix_skips_lapsed_and_foreign_keys() {
        let store = MemoryStore::new();
        store.set("hold:2", "b", Duration::from_secs(100)).await.unwrap();
        store.set("hold:1", "a", Duration::from_secs(100)).await.unwrap();
        store.set("hold:3", "c", Duration::from_secs(5)).await.unwrap();
        store.set("session:1", "s", Duration::from_secs(100)).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;

        let found = store.scan_prefix("hold:").await.unwrap();
        assert_eq!(
            found,
            vec![
                ("hold:1".to_string(), "a".to_string()),
                ("hold:2".to_string(), "b".to_string()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn purge_publishes_expired_keys_by_prefix() {
        let store = MemoryStore::new();
        let mut expired = store.subscribe_expired("hold:").await.unwrap();

        store.set("hold:5", "x", Duration::from_secs(1)).await.unwrap();
        store.set("typing:r:1", "1", Duration::from_secs(1)).await.unwrap();
        store.set("hold:6", "y", Duration::from_secs(60)).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.purge_expired(), 2);

        assert_eq!(expired.next().await.as_deref(), Some("hold:5"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn explicit_delete_is_not_an_expiry() {
        let store = MemoryStore::new();
        let mut expired = store.subscribe_expired("").await.unwrap();

        store.set("hold:5", "x", Duration::from_secs(60)).await.unwrap();
        assert!(store.delete("hold:5").await.unwrap());

        let next = tokio::time::timeout(Duration::from_millis(20), expired.next()).await;
        assert!(next.is_err(), "delete must not publish an expiry");
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_sweeps_in_background() {
        let store = Arc::new(MemoryStore::new());
        let mut expired = store.subscribe_expired("hold:").await.unwrap();
        let reaper = spawn_reaper(&store, Duration::from_secs(1));

        store.set("hold:9", "x", Duration::from_secs(3)).await.unwrap();

        let key = tokio::time::timeout(Duration::from_secs(10), expired.next())
            .await
            .unwrap();
        assert_eq!(key.as_deref(), Some("hold:9"));
        reaper.abort();
    }
}
