use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use haul_cache::{keys, CacheError, EphemeralStore};
use haul_core::ids::ConnectionId;
use haul_core::models::{PresenceRecord, PresenceStatus, UserType};
use tracing::{debug, warn};

#[derive(Clone, Debug)]
pub struct PresenceConfig {
    pub online_ttl: Duration,
    pub offline_ttl: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            online_ttl: Duration::from_secs(3600),
            offline_ttl: Duration::from_secs(86_400),
        }
    }
}

/// Online/offline status per (user type, user id). Writes are
/// unconditional overwrites, so with several devices the last one to
/// connect or disconnect decides.
pub struct PresenceTracker {
    store: Arc<dyn EphemeralStore>,
    config: PresenceConfig,
}

impl PresenceTracker {
    pub fn new(store: Arc<dyn EphemeralStore>, config: PresenceConfig) -> Self {
        Self { store, config }
    }

    pub async fn set_online(
        &self,
        user_type: UserType,
        user_id: i64,
        connection_id: &ConnectionId,
    ) -> Result<(), CacheError> {
        let record = PresenceRecord {
            connection_id: Some(connection_id.clone()),
            status: PresenceStatus::Online,
            last_seen: Utc::now(),
        };
        haul_cache::put_json(
            self.store.as_ref(),
            &keys::presence(user_type, user_id),
            &record,
            self.config.online_ttl,
        )
        .await?;
        debug!(%user_type, user_id, connection_id = %connection_id, "presence online");
        Ok(())
    }

    pub async fn set_offline(&self, user_type: UserType, user_id: i64) -> Result<(), CacheError> {
        let record = PresenceRecord {
            connection_id: None,
            status: PresenceStatus::Offline,
            last_seen: Utc::now(),
        };
        haul_cache::put_json(
            self.store.as_ref(),
            &keys::presence(user_type, user_id),
            &record,
            self.config.offline_ttl,
        )
        .await?;
        debug!(%user_type, user_id, "presence offline");
        Ok(())
    }

    /// Extend the online window. A record that lapsed, or that another
    /// device flipped to offline, is rewritten as online.
    pub async fn refresh(
        &self,
        user_type: UserType,
        user_id: i64,
        connection_id: &ConnectionId,
    ) -> Result<(), CacheError> {
        let key = keys::presence(user_type, user_id);
        let online = self.lookup(user_type, user_id).await?.is_some_and(|r| r.is_online());
        if online && self.store.touch(&key, self.config.online_ttl).await? {
            return Ok(());
        }
        self.set_online(user_type, user_id, connection_id).await
    }

    pub async fn lookup(
        &self,
        user_type: UserType,
        user_id: i64,
    ) -> Result<Option<PresenceRecord>, CacheError> {
        haul_cache::get_json(self.store.as_ref(), &keys::presence(user_type, user_id)).await
    }

    /// Connection to push to, if the user is online. Lookup failures count
    /// as unreachable.
    pub async fn reachable_connection(&self, user_type: UserType, user_id: i64) -> Option<ConnectionId> {
        match self.lookup(user_type, user_id).await {
            Ok(Some(record)) if record.is_online() => record.connection_id,
            Ok(_) => None,
            Err(e) => {
                warn!(%user_type, user_id, error = %e, "presence lookup failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use haul_cache::MemoryStore;

    fn tracker() -> (Arc<MemoryStore>, PresenceTracker) {
        let store = Arc::new(MemoryStore::new());
        let tracker = PresenceTracker::new(store.clone(), PresenceConfig::default());
        (store, tracker)
    }

    #[tokio::test]
    async fn online_then_offline() {
        let (_store, tracker) = tracker();
        let conn = ConnectionId::new();

        tracker.set_online(UserType::Driver, 42, &conn).await.unwrap();
        let record = tracker.lookup(UserType::Driver, 42).await.unwrap().unwrap();
        assert!(record.is_online());
        assert_eq!(tracker.reachable_connection(UserType::Driver, 42).await, Some(conn));

        tracker.set_offline(UserType::Driver, 42).await.unwrap();
        let record = tracker.lookup(UserType::Driver, 42).await.unwrap().unwrap();
        assert_eq!(record.status, PresenceStatus::Offline);
        assert!(tracker.reachable_connection(UserType::Driver, 42).await.is_none());
    }

    #[tokio::test]
    async fn user_types_do_not_collide() {
        let (_store, tracker) = tracker();
        tracker.set_online(UserType::Dispatcher, 42, &ConnectionId::new()).await.unwrap();
        assert!(tracker.lookup(UserType::Driver, 42).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn last_writer_wins() {
        let (_store, tracker) = tracker();
        let phone = ConnectionId::new();
        let tablet = ConnectionId::new();

        tracker.set_online(UserType::Driver, 42, &phone).await.unwrap();
        tracker.set_online(UserType::Driver, 42, &tablet).await.unwrap();
        assert_eq!(tracker.reachable_connection(UserType::Driver, 42).await, Some(tablet));

        // The phone disconnecting marks the user offline even though the tablet is live.
        tracker.set_offline(UserType::Driver, 42).await.unwrap();
        assert!(tracker.reachable_connection(UserType::Driver, 42).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn online_record_lapses_without_refresh() {
        let (_store, tracker) = tracker();
        let conn = ConnectionId::new();
        tracker.set_online(UserType::Driver, 7, &conn).await.unwrap();

        tokio::time::advance(Duration::from_secs(3000)).await;
        tracker.refresh(UserType::Driver, 7, &conn).await.unwrap();

        tokio::time::advance(Duration::from_secs(3000)).await;
        assert!(tracker.lookup(UserType::Driver, 7).await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(700)).await;
        assert!(tracker.lookup(UserType::Driver, 7).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn refresh_revives_offline_record() {
        let (_store, tracker) = tracker();
        let tablet = ConnectionId::new();
        tracker.set_online(UserType::Driver, 42, &tablet).await.unwrap();
        tracker.set_offline(UserType::Driver, 42).await.unwrap();

        tracker.refresh(UserType::Driver, 42, &tablet).await.unwrap();
        assert_eq!(tracker.reachable_connection(UserType::Driver, 42).await, Some(tablet));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_rewrites_lapsed_record() {
        let (_store, tracker) = tracker();
        let conn = ConnectionId::new();
        tracker.set_online(UserType::Driver, 7, &conn).await.unwrap();
        tokio::time::advance(Duration::from_secs(3601)).await;

        tracker.refresh(UserType::Driver, 7, &conn).await.unwrap();
        assert_eq!(tracker.reachable_connection(UserType::Driver, 7).await, Some(conn));
    }
}
