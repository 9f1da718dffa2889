use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use haul_cache::{keys, EphemeralStore};
use haul_core::models::HoldRecord;
use haul_core::{RelayError, ServerEvent};
use secrecy::SecretString;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::authority::{AuthorityError, HoldAuthority};
use crate::best_effort::attempt;
use crate::outbox::Outbox;

#[derive(Clone, Debug)]
pub struct HoldConfig {
    /// Fixed lifetime of a hold. There is no renewal.
    pub ttl: Duration,
    pub authority_timeout: Duration,
}

impl Default for HoldConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(900),
            authority_timeout: Duration::from_secs(5),
        }
    }
}

/// A hold announced by the authority itself rather than placed here.
#[derive(Clone, Debug)]
pub struct ExternalHold {
    pub truck_id: i64,
    pub dispatcher_id: i64,
    pub dispatcher_name: String,
    pub started_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Exclusive, time-bounded truck reservations mirrored from the
/// authority. The authority decides; the local copy under `hold:<truckId>`
/// is written only after it agrees and is never updated in place.
pub struct HoldManager {
    store: Arc<dyn EphemeralStore>,
    authority: Arc<dyn HoldAuthority>,
    outbox: Outbox,
    config: HoldConfig,
}

impl HoldManager {
    pub fn new(
        store: Arc<dyn EphemeralStore>,
        authority: Arc<dyn HoldAuthority>,
        outbox: Outbox,
        config: HoldConfig,
    ) -> Self {
        Self {
            store,
            authority,
            outbox,
            config,
        }
    }

    async fn current(&self, truck_id: i64) -> Result<Option<HoldRecord>, RelayError> {
        Ok(haul_cache::get_json(self.store.as_ref(), &keys::hold(truck_id)).await?)
    }

    async fn call_authority<F>(&self, call: F) -> Result<(), AuthorityError>
    where
        F: Future<Output = Result<(), AuthorityError>>,
    {
        match tokio::time::timeout(self.config.authority_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(AuthorityError::Timeout(self.config.authority_timeout)),
        }
    }

    #[instrument(skip(self, dispatcher_name, token))]
    pub async fn place(
        &self,
        truck_id: i64,
        dispatcher_id: i64,
        dispatcher_name: &str,
        token: Option<&SecretString>,
    ) -> Result<HoldRecord, RelayError> {
        if truck_id <= 0 {
            return Err(RelayError::InvalidRequest("truckId is required".into()));
        }
        if dispatcher_name.trim().is_empty() {
            return Err(RelayError::InvalidRequest("dispatcherName is required".into()));
        }

        // Local fast path only; two dispatchers can both get past this and
        // the authority picks the winner.
        if let Some(existing) = self.current(truck_id).await? {
            return Err(RelayError::AlreadyHeld {
                truck_id,
                holder: existing.dispatcher_name,
            });
        }

        self.call_authority(
            self.authority
                .place_hold(truck_id, dispatcher_id, dispatcher_name, token),
        )
        .await
        .map_err(|e| {
            warn!(error = %e, "authority refused hold");
            RelayError::SyncFailed(e.to_string())
        })?;

        let record = HoldRecord::new(truck_id, dispatcher_id, dispatcher_name, Utc::now(), self.config.ttl);
        if let Err(e) = haul_cache::put_json(
            self.store.as_ref(),
            &keys::hold(truck_id),
            &record,
            self.config.ttl,
        )
        .await
        {
            // The authority holds a truck nobody here knows about; hand it back.
            attempt(
                "authority.release_hold",
                self.call_authority(self.authority.release_hold(truck_id, dispatcher_id, token)),
            )
            .await;
            return Err(e.into());
        }

        info!(expires_at = %record.expires_at, "hold placed");
        self.outbox.broadcast(&ServerEvent::HoldPlaced(record.clone()));
        Ok(record)
    }

    #[instrument(skip(self, token))]
    pub async fn release(
        &self,
        truck_id: i64,
        dispatcher_id: i64,
        token: Option<&SecretString>,
    ) -> Result<(), RelayError> {
        let Some(existing) = self.current(truck_id).await? else {
            return Err(RelayError::NotFound(format!("no hold on truck {truck_id}")));
        };
        if !existing.is_held_by(dispatcher_id) {
            return Err(RelayError::Forbidden(format!(
                "truck {truck_id} is held by {}",
                existing.dispatcher_name
            )));
        }

        self.call_authority(self.authority.release_hold(truck_id, dispatcher_id, token))
            .await
            .map_err(|e| {
                warn!(error = %e, "authority refused release");
                RelayError::SyncFailed(e.to_string())
            })?;

        self.store.delete(&keys::hold(truck_id)).await?;
        info!("hold released");
        self.outbox.broadcast(&ServerEvent::HoldRemoved {
            truck_id,
            dispatcher_id: Some(dispatcher_id),
        });
        Ok(())
    }

    /// Live holds ordered by truck id. Unreadable entries are skipped.
    pub async fn list_active(&self) -> Result<Vec<HoldRecord>, RelayError> {
        let entries = self.store.scan_prefix(keys::HOLD_PREFIX).await?;
        let mut holds: Vec<HoldRecord> = entries
            .into_iter()
            .filter_map(|(key, raw)| match serde_json::from_str::<HoldRecord>(&raw) {
                Ok(hold) => Some(hold),
                Err(e) => {
                    warn!(key = %key, error = %e, "skipping corrupt hold entry");
                    None
                }
            })
            .collect();
        holds.sort_by_key(|h| h.truck_id);
        Ok(holds)
    }

    /// Mirror a hold the authority reports. Returns `None` when it has
    /// already lapsed.
    #[instrument(skip_all, fields(truck_id = hold.truck_id))]
    pub async fn cache_external_hold(&self, hold: ExternalHold) -> Result<Option<HoldRecord>, RelayError> {
        let now = Utc::now();
        let started_at = hold.started_at.unwrap_or(now);
        let mut record = HoldRecord::new(
            hold.truck_id,
            hold.dispatcher_id,
            hold.dispatcher_name,
            started_at,
            self.config.ttl,
        );
        if let Some(expires_at) = hold.expires_at {
            record.expires_at = expires_at;
        }

        let Some(remaining) = record.remaining(now) else {
            info!("external hold already expired, ignoring");
            return Ok(None);
        };

        // A lapsed predecessor the reaper has not swept yet expires on read,
        // so its hold_expired still goes out before it is overwritten.
        let key = keys::hold(record.truck_id);
        self.store.get(&key).await?;

        haul_cache::put_json(self.store.as_ref(), &key, &record, remaining).await?;
        self.outbox.broadcast(&ServerEvent::HoldPlaced(record.clone()));
        Ok(Some(record))
    }

    pub async fn evict_external_hold(&self, truck_id: i64, dispatcher_id: Option<i64>) -> Result<(), RelayError> {
        self.store.delete(&keys::hold(truck_id)).await?;
        info!(truck_id, "external hold evicted");
        self.outbox.broadcast(&ServerEvent::HoldRemoved {
            truck_id,
            dispatcher_id,
        });
        Ok(())
    }

    /// Follow hold expirations until cancelled: tell the authority, then
    /// everyone connected. The subscription is live when this returns.
    pub async fn spawn_expiry_listener(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>, RelayError> {
        let mut expired = self.store.subscribe_expired(keys::HOLD_PREFIX).await?;
        let manager = Arc::clone(self);

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    key = expired.next() => match key {
                        Some(key) => manager.on_expired(&key).await,
                        None => {
                            warn!("hold expiry stream ended");
                            break;
                        }
                    },
                }
            }
        }))
    }

    async fn on_expired(&self, key: &str) {
        let Some(truck_id) = keys::truck_from_hold_key(key) else {
            warn!(key, "expired key is not a hold");
            return;
        };
        let expired_at = Utc::now();
        attempt(
            "authority.expire_hold",
            self.call_authority(self.authority.expire_hold(truck_id, expired_at)),
        )
        .await;

        info!(truck_id, "hold expired");
        self.outbox
            .broadcast(&ServerEvent::HoldExpired { truck_id, expired_at });
    }
}
