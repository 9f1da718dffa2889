use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// An offer as announced by the offer-management backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferRecord {
    pub id: i64,
    pub driver_id: Option<i64>,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalRecord {
    pub id: i64,
    pub offer_id: i64,
    pub driver_id: i64,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct OfferRepo {
    db: Database,
}

impl OfferRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or refresh an offer. A re-announced offer keeps its original
    /// `created_at`.
    #[instrument(skip(self, payload))]
    pub fn record(
        &self,
        offer_id: i64,
        driver_id: Option<i64>,
        payload: &Value,
    ) -> Result<OfferRecord, StoreError> {
        let now = row_helpers::format_timestamp(&Utc::now());
        let raw = serde_json::to_string(payload)?;

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO offers (id, driver_id, payload, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                    driver_id = excluded.driver_id,
                    payload = excluded.payload,
                    updated_at = excluded.updated_at",
                rusqlite::params![offer_id, driver_id, raw, now],
            )?;
            Ok(())
        })?;
        self.get(offer_id)
    }

    pub fn get(&self, offer_id: i64) -> Result<OfferRecord, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, driver_id, payload, created_at, updated_at FROM offers WHERE id = ?1",
            )?;
            let mut rows = stmt.query([offer_id])?;
            let Some(row) = rows.next()? else {
                return Err(StoreError::NotFound(format!("offer {offer_id}")));
            };

            let payload: String = row_helpers::get(row, 2, "offers", "payload")?;
            let created_at: String = row_helpers::get(row, 3, "offers", "created_at")?;
            let updated_at: String = row_helpers::get(row, 4, "offers", "updated_at")?;
            Ok(OfferRecord {
                id: row_helpers::get(row, 0, "offers", "id")?,
                driver_id: row_helpers::get(row, 1, "offers", "driver_id")?,
                payload: row_helpers::parse_json(&payload, "offers", "payload")?,
                created_at: row_helpers::parse_timestamp(&created_at, "offers", "created_at")?,
                updated_at: row_helpers::parse_timestamp(&updated_at, "offers", "updated_at")?,
            })
        })
    }
}

#[derive(Clone)]
pub struct ProposalRepo {
    db: Database,
}

impl ProposalRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, payload))]
    pub fn create(
        &self,
        offer_id: i64,
        driver_id: i64,
        payload: &Value,
    ) -> Result<ProposalRecord, StoreError> {
        let now = Utc::now();
        let created_at = row_helpers::format_timestamp(&now);
        let raw = serde_json::to_string(payload)?;

        let id = self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO proposals (offer_id, driver_id, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![offer_id, driver_id, raw, created_at],
            )?;
            Ok(conn.last_insert_rowid())
        })?;

        Ok(ProposalRecord {
            id,
            offer_id,
            driver_id,
            payload: payload.clone(),
            created_at: row_helpers::parse_timestamp(&created_at, "proposals", "created_at")?,
        })
    }

    /// Proposals for an offer in submission order.
    pub fn list_for_offer(&self, offer_id: i64) -> Result<Vec<ProposalRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, offer_id, driver_id, payload, created_at FROM proposals
                 WHERE offer_id = ?1 ORDER BY id ASC",
            )?;
            let mut rows = stmt.query([offer_id])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                let payload: String = row_helpers::get(row, 3, "proposals", "payload")?;
                let created_at: String = row_helpers::get(row, 4, "proposals", "created_at")?;
                results.push(ProposalRecord {
                    id: row_helpers::get(row, 0, "proposals", "id")?,
                    offer_id: row_helpers::get(row, 1, "proposals", "offer_id")?,
                    driver_id: row_helpers::get(row, 2, "proposals", "driver_id")?,
                    payload: row_helpers::parse_json(&payload, "proposals", "payload")?,
                    created_at: row_helpers::parse_timestamp(&created_at, "proposals", "created_at")?,
                });
            }
            Ok(results)
        })
    }
}
