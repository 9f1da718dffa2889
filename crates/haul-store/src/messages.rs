use chrono::Utc;
use tracing::instrument;

use haul_core::models::{ChatMessage, MessageType, UserType};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const COLUMNS: &str =
    "id, offer_id, driver_id, sender_type, sender_id, message, message_type, is_read, created_at";

/// Fields supplied by the caller; id, read flag and timestamp are assigned here.
#[derive(Clone, Debug)]
pub struct NewMessage {
    pub offer_id: i64,
    pub driver_id: i64,
    pub sender_type: UserType,
    pub sender_id: i64,
    pub message: String,
    pub message_type: MessageType,
}

/// Append-only chat log. The read flag is the only column ever updated.
#[derive(Clone)]
pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, new), fields(offer_id = new.offer_id, driver_id = new.driver_id))]
    pub fn insert(&self, new: NewMessage) -> Result<ChatMessage, StoreError> {
        let now = Utc::now();
        let created_at = row_helpers::format_timestamp(&now);

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (offer_id, driver_id, sender_type, sender_id, message, message_type, is_read, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
                rusqlite::params![
                    new.offer_id,
                    new.driver_id,
                    new.sender_type.as_str(),
                    new.sender_id,
                    new.message,
                    new.message_type.as_str(),
                    created_at,
                ],
            )?;
            let id = conn.last_insert_rowid();

            Ok(ChatMessage {
                id,
                offer_id: new.offer_id,
                driver_id: new.driver_id,
                sender_type: new.sender_type,
                sender_id: new.sender_id,
                message: new.message,
                message_type: new.message_type,
                is_read: false,
                created_at: row_helpers::parse_timestamp(&created_at, "messages", "created_at")?,
            })
        })
    }

    #[instrument(skip(self))]
    pub fn get(&self, id: i64) -> Result<ChatMessage, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM messages WHERE id = ?1"))?;
            let mut rows = stmt.query([id])?;
            let Some(row) = rows.next()? else {
                return Err(StoreError::NotFound(format!("message {id}")));
            };
            let message = row_to_message(row)?;
            Ok(message)
        })
    }

    /// Most recent messages of a room, newest first.
    #[instrument(skip(self))]
    pub fn list_recent(
        &self,
        offer_id: i64,
        driver_id: i64,
        limit: u32,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM messages
                 WHERE offer_id = ?1 AND driver_id = ?2
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?3"
            ))?;
            let mut rows = stmt.query(rusqlite::params![offer_id, driver_id, limit])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_message(row)?);
            }
            Ok(results)
        })
    }

    /// Flip the read flag. Marking an already-read message succeeds.
    #[instrument(skip(self))]
    pub fn mark_read(&self, id: i64) -> Result<ChatMessage, StoreError> {
        let changed = self.db.with_conn(|conn| {
            Ok(conn.execute("UPDATE messages SET is_read = 1 WHERE id = ?1", [id])?)
        })?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("message {id}")));
        }
        self.get(id)
    }

}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<ChatMessage, StoreError> {
    let sender_type: String = row_helpers::get(row, 3, "messages", "sender_type")?;
    let message_type: String = row_helpers::get(row, 6, "messages", "message_type")?;
    let is_read: i64 = row_helpers::get(row, 7, "messages", "is_read")?;
    let created_at: String = row_helpers::get(row, 8, "messages", "created_at")?;

    Ok(ChatMessage {
        id: row_helpers::get(row, 0, "messages", "id")?,
        offer_id: row_helpers::get(row, 1, "messages", "offer_id")?,
        driver_id: row_helpers::get(row, 2, "messages", "driver_id")?,
        sender_type: row_helpers::parse_enum(&sender_type, "messages", "sender_type")?,
        sender_id: row_helpers::get(row, 4, "messages", "sender_id")?,
        message: row_helpers::get(row, 5, "messages", "message")?,
        message_type: row_helpers::parse_enum(&message_type, "messages", "message_type")?,
        is_read: is_read != 0,
        created_at: row_helpers::parse_timestamp(&created_at, "messages", "created_at")?,
    })
}
