use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use haul_cache::{keys, EphemeralStore};
use haul_core::models::SessionRecord;
use haul_core::RelayError;
use tracing::{info, instrument, warn};

use crate::best_effort::attempt;
use crate::presence::PresenceTracker;
use crate::Caller;

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub ttl: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
        }
    }
}

/// Session records plus the presence side effects of connecting,
/// disconnecting and heartbeating.
pub struct SessionRegistry {
    store: Arc<dyn EphemeralStore>,
    presence: Arc<PresenceTracker>,
    config: SessionConfig,
}

impl SessionRegistry {
    pub fn new(
        store: Arc<dyn EphemeralStore>,
        presence: Arc<PresenceTracker>,
        config: SessionConfig,
    ) -> Self {
        Self {
            store,
            presence,
            config,
        }
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    /// Persist the session. Failing to do so refuses the connection;
    /// presence is updated afterwards on a best-effort basis.
    #[instrument(skip_all, fields(connection_id = %caller.connection_id))]
    pub async fn on_connect(&self, caller: &Caller) -> Result<SessionRecord, RelayError> {
        let record = SessionRecord::new(caller.connection_id.clone(), &caller.identity);
        haul_cache::put_json(
            self.store.as_ref(),
            &keys::session(&caller.connection_id),
            &record,
            self.config.ttl,
        )
        .await?;

        match caller.identity.user_id {
            Some(user_id) => {
                attempt(
                    "presence.set_online",
                    self.presence
                        .set_online(caller.identity.user_type, user_id, &caller.connection_id),
                )
                .await;
            }
            None => warn!("identity has no user id, presence not tracked"),
        }

        info!(
            user_id = ?caller.identity.user_id,
            user_type = %caller.identity.user_type,
            "session opened"
        );
        Ok(record)
    }

    /// Mark the user offline and drop the session. Both run concurrently
    /// and neither failure is reported.
    #[instrument(skip_all, fields(connection_id = %caller.connection_id))]
    pub async fn on_disconnect(&self, caller: &Caller) {
        let key = keys::session(&caller.connection_id);
        let offline = async {
            if let Some(user_id) = caller.identity.user_id {
                attempt(
                    "presence.set_offline",
                    self.presence.set_offline(caller.identity.user_type, user_id),
                )
                .await;
            }
        };
        let remove = attempt("session.delete", self.store.delete(&key));

        tokio::join!(offline, remove);
        info!("session closed");
    }

    /// Extend the session and presence TTLs; returns the server timestamp
    /// for the acknowledgement.
    pub async fn heartbeat(&self, caller: &Caller) -> DateTime<Utc> {
        let key = keys::session(&caller.connection_id);
        let refreshed = attempt("session.touch", self.store.touch(&key, self.config.ttl)).await;
        if refreshed == Some(false) {
            // Lapsed while the socket stayed up; write it back.
            let record = SessionRecord::new(caller.connection_id.clone(), &caller.identity);
            attempt(
                "session.rewrite",
                haul_cache::put_json(self.store.as_ref(), &key, &record, self.config.ttl),
            )
            .await;
        }

        if let Some(user_id) = caller.identity.user_id {
            attempt(
                "presence.refresh",
                self.presence
                    .refresh(caller.identity.user_type, user_id, &caller.connection_id),
            )
            .await;
        }
        Utc::now()
    }

    pub async fn get(&self, caller: &Caller) -> Result<Option<SessionRecord>, RelayError> {
        Ok(haul_cache::get_json(self.store.as_ref(), &keys::session(&caller.connection_id)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::PresenceConfig;
    use crate::testing::driver;
    use async_trait::async_trait;
    use haul_cache::{CacheError, ExpiredKeys, MemoryStore};
    use haul_core::models::PresenceStatus;

    fn registry(store: Arc<dyn EphemeralStore>) -> SessionRegistry {
        let presence = Arc::new(PresenceTracker::new(store.clone(), PresenceConfig::default()));
        SessionRegistry::new(store, presence, SessionConfig::default())
    }

    #[tokio::test]
    async fn connect_writes_session_and_presence() {
        let store = Arc::new(MemoryStore::new());
        let sessions = registry(store.clone());
        let caller = driver(42);

        let record = sessions.on_connect(&caller).await.unwrap();
        assert_eq!(record.user_id, Some(42));
        assert_eq!(sessions.get(&caller).await.unwrap(), Some(record));

        let presence = sessions.presence().lookup(caller.identity.user_type, 42).await.unwrap().unwrap();
        assert!(presence.is_online());
        assert_eq!(presence.connection_id, Some(caller.connection_id.clone()));
    }

    #[tokio::test]
    async fn disconnect_writes_offline_and_removes_session() {
        let store = Arc::new(MemoryStore::new());
        let sessions = registry(store.clone());
        let caller = driver(42);
        sessions.on_connect(&caller).await.unwrap();

        sessions.on_disconnect(&caller).await;

        assert!(sessions.get(&caller).await.unwrap().is_none());
        let presence = sessions.presence().lookup(caller.identity.user_type, 42).await.unwrap().unwrap();
        assert_eq!(presence.status, PresenceStatus::Offline);
    }

    #[tokio::test]
    async fn connect_without_user_id_still_opens_session() {
        let store = Arc::new(MemoryStore::new());
        let sessions = registry(store.clone());
        let mut caller = driver(1);
        caller.identity.user_id = None;

        sessions.on_connect(&caller).await.unwrap();
        assert!(sessions.get(&caller).await.unwrap().is_some());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_refreshes_ttls() {
        let store = Arc::new(MemoryStore::new());
        let sessions = registry(store.clone());
        let caller = driver(42);
        sessions.on_connect(&caller).await.unwrap();

        tokio::time::advance(Duration::from_secs(3500)).await;
        sessions.heartbeat(&caller).await;

        tokio::time::advance(Duration::from_secs(3500)).await;
        assert!(sessions.get(&caller).await.unwrap().is_some());
        assert!(sessions
            .presence()
            .reachable_connection(caller.identity.user_type, 42)
            .await
            .is_some());
    }

    /// Store that refuses every write.
    struct DownStore;

    #[async_trait]
    impl EphemeralStore for DownStore {
        async fn set(&self, _: &str, _: &str, _: Duration) -> Result<(), CacheError> {
            Err(CacheError::Connection("down".into()))
        }
        async fn get(&self, _: &str) -> Result<Option<String>, CacheError> {
            Err(CacheError::Connection("down".into()))
        }
        async fn delete(&self, _: &str) -> Result<bool, CacheError> {
            Err(CacheError::Connection("down".into()))
        }
        async fn touch(&self, _: &str, _: Duration) -> Result<bool, CacheError> {
            Err(CacheError::Connection("down".into()))
        }
        async fn scan_prefix(&self, _: &str) -> Result<Vec<(String, String)>, CacheError> {
            Err(CacheError::Connection("down".into()))
        }
        async fn subscribe_expired(&self, _: &str) -> Result<ExpiredKeys, CacheError> {
            Err(CacheError::Connection("down".into()))
        }
    }

    #[tokio::test]
    async fn connect_fails_when_session_cannot_be_written() {
        let sessions = registry(Arc::new(DownStore));
        let err = sessions.on_connect(&driver(42)).await.unwrap_err();
        assert_eq!(err.code(), "STORE_ERROR");
    }

    #[tokio::test]
    async fn disconnect_and_heartbeat_swallow_store_failures() {
        let sessions = registry(Arc::new(DownStore));
        let caller = driver(42);
        sessions.on_disconnect(&caller).await;
        sessions.heartbeat(&caller).await;
    }
}
