use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{info, warn};

use crate::{ttl_secs, CacheError, EphemeralStore, ExpiredKeys};

const EXPIRED_EVENTS_PATTERN: &str = "__keyevent@*__:expired";
const SCAN_BATCH: usize = 200;

/// Redis-backed store shared by every gateway node.
///
/// Expirations arrive through keyspace notifications, which the server
/// must have enabled (`notify-keyspace-events` containing `Ex`). `connect`
/// tries to enable them and only logs when it cannot.
pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client =
            redis::Client::open(url).map_err(|e| CacheError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))?;

        let store = Self { client, conn };
        store.enable_expiry_events().await;
        info!("redis ephemeral store connected");
        Ok(store)
    }

    async fn enable_expiry_events(&self) {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg("Ex")
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            // Managed Redis often forbids CONFIG; the operator must set it.
            warn!(error = %e, "could not enable keyspace expiry notifications");
        }
    }
}

/// Escape glob metacharacters so a prefix matches literally in `SCAN MATCH`.
fn glob_escape(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[async_trait]
impl EphemeralStore for RedisStore {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl_secs(ttl)).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let removed: usize = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn touch(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let secs = i64::try_from(ttl_secs(ttl)).unwrap_or(i64::MAX);
        let refreshed: bool = conn.expire(key, secs).await?;
        Ok(refreshed)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, CacheError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", glob_escape(prefix));

        let mut keys: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        if keys.is_empty() {
            return Ok(Vec::new());
        }
        keys.sort();
        keys.dedup();

        let values: Vec<Option<String>> = redis::cmd("MGET").arg(&keys).query_async(&mut conn).await?;

        // A key may lapse between SCAN and MGET; it is simply gone.
        Ok(keys
            .into_iter()
            .zip(values)
            .filter_map(|(key, value)| value.map(|v| (key, v)))
            .collect())
    }

    async fn subscribe_expired(&self, prefix: &str) -> Result<ExpiredKeys, CacheError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))?;
        pubsub.psubscribe(EXPIRED_EVENTS_PATTERN).await?;

        let prefix = prefix.to_string();
        let stream = pubsub.into_on_message().filter_map(move |msg| {
            let key = msg
                .get_payload::<String>()
                .ok()
                .filter(|key| key.starts_with(&prefix));
            futures::future::ready(key)
        });
        Ok(Box::pin(stream))
    }
}
