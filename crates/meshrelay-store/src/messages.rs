use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use meshrelay_shared::types::{DeliveryMethod, DeliveryStatus, MessageId, PeerKey};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::StoredMessage;

const MESSAGE_COLUMNS: &str = "id, sender_key, recipient_key, timestamp, ciphertext, plaintext,
     status, method, media_ref, is_read, archived";

impl Database {
    /// Insert a message. Returns `false` if the id was already stored.
    pub fn insert_message(&self, message: &StoredMessage) -> Result<bool> {
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO messages
                (id, sender_key, recipient_key, timestamp, ciphertext, plaintext,
                 status, method, media_ref, is_read, archived)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                message.id.to_string(),
                message.sender.to_hex(),
                message.recipient.to_hex(),
                format_timestamp(&message.timestamp),
                message.ciphertext,
                message.plaintext,
                message.status.as_str(),
                message.method.as_str(),
                message.media_ref,
                message.is_read,
                message.archived,
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn get_message(&self, id: MessageId) -> Result<StoredMessage> {
        self.conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id.to_string()],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    pub fn message_exists(&self, id: MessageId) -> Result<bool> {
        let found = self
            .conn()
            .query_row(
                "SELECT 1 FROM messages WHERE id = ?1",
                params![id.to_string()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Every stored id, active and archived.
    pub fn message_ids(&self) -> Result<Vec<MessageId>> {
        let mut stmt = self.conn().prepare("SELECT id FROM messages")?;
        let rows = stmt.query_map([], |row| {
            let raw: String = row.get(0)?;
            parse_id(0, &raw)
        })?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    /// Active (non-archived) messages, oldest first.
    pub fn active_messages(&self) -> Result<Vec<StoredMessage>> {
        self.query_messages(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE archived = 0
                 ORDER BY timestamp ASC, rowid ASC"
            ),
            params![],
        )
    }

    /// Archived messages, newest first.
    pub fn archived_messages(&self, limit: u32, offset: u32) -> Result<Vec<StoredMessage>> {
        self.query_messages(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE archived = 1
                 ORDER BY timestamp DESC, rowid DESC
                 LIMIT ?1 OFFSET ?2"
            ),
            params![limit, offset],
        )
    }

    /// All messages exchanged with `peer`, oldest first.
    pub fn messages_with_peer(&self, peer: &PeerKey) -> Result<Vec<StoredMessage>> {
        let hex = peer.to_hex();
        self.query_messages(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE sender_key = ?1 OR recipient_key = ?1
                 ORDER BY timestamp ASC, rowid ASC"
            ),
            params![hex],
        )
    }

    pub fn update_delivery(
        &self,
        id: MessageId,
        status: DeliveryStatus,
        method: DeliveryMethod,
    ) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE messages SET status = ?2, method = ?3 WHERE id = ?1",
            params![id.to_string(), status.as_str(), method.as_str()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn mark_read(&self, id: MessageId) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE messages SET is_read = 1 WHERE id = ?1 AND is_read = 0",
            params![id.to_string()],
        )?;
        Ok(affected > 0)
    }

    /// Move messages out of the active set.
    pub fn archive_messages(&mut self, ids: &[MessageId]) -> Result<usize> {
        let tx = self.conn_mut().transaction()?;
        let mut archived = 0;
        {
            let mut stmt = tx.prepare("UPDATE messages SET archived = 1 WHERE id = ?1")?;
            for id in ids {
                archived += stmt.execute(params![id.to_string()])?;
            }
        }
        tx.commit()?;
        Ok(archived)
    }

    pub fn delete_message(&self, id: MessageId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM messages WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(affected > 0)
    }

    fn query_messages(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<StoredMessage>> {
        let mut stmt = self.conn().prepare(sql)?;
        let rows = stmt.query_map(params, row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

#[derive(Debug)]
struct UnknownValue(String);

impl std::fmt::Display for UnknownValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown value {:?}", self.0)
    }
}

impl std::error::Error for UnknownValue {}

/// Fixed-width RFC-3339 so that text ordering matches time ordering.
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_id(idx: usize, raw: &str) -> rusqlite::Result<MessageId> {
    Uuid::parse_str(raw)
        .map(MessageId)
        .map_err(|e| conversion_error(idx, e))
}

pub(crate) fn parse_key(idx: usize, raw: &str) -> rusqlite::Result<PeerKey> {
    PeerKey::from_hex(raw).map_err(|e| conversion_error(idx, e))
}

pub(crate) fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

pub(crate) fn parse_method(idx: usize, raw: &str) -> rusqlite::Result<DeliveryMethod> {
    DeliveryMethod::parse(raw).ok_or_else(|| conversion_error(idx, UnknownValue(raw.into())))
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let id: String = row.get(0)?;
    let sender: String = row.get(1)?;
    let recipient: String = row.get(2)?;
    let timestamp: String = row.get(3)?;
    let status: String = row.get(6)?;
    let method: String = row.get(7)?;

    Ok(StoredMessage {
        id: parse_id(0, &id)?,
        sender: parse_key(1, &sender)?,
        recipient: parse_key(2, &recipient)?,
        timestamp: parse_timestamp(3, &timestamp)?,
        ciphertext: row.get(4)?,
        plaintext: row.get(5)?,
        status: DeliveryStatus::parse(&status)
            .ok_or_else(|| conversion_error(6, UnknownValue(status.clone())))?,
        method: parse_method(7, &method)?,
        media_ref: row.get(8)?,
        is_read: row.get(9)?,
        archived: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn message(sender: u8, recipient: u8, minutes: i64) -> StoredMessage {
        StoredMessage {
            id: MessageId::new(),
            sender: PeerKey([sender; 32]),
            recipient: PeerKey([recipient; 32]),
            timestamp: Utc::now() + Duration::minutes(minutes),
            ciphertext: vec![1, 2, 3],
            plaintext: Some("hi".into()),
            status: DeliveryStatus::Pending,
            method: DeliveryMethod::Pending,
            media_ref: None,
            is_read: false,
            archived: false,
        }
    }

    #[test]
    fn insert_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let msg = message(1, 2, 0);

        assert!(db.insert_message(&msg).unwrap());
        assert!(!db.insert_message(&msg).unwrap());
        assert_eq!(db.message_ids().unwrap(), vec![msg.id]);
        assert_eq!(db.get_message(msg.id).unwrap(), msg);
    }

    #[test]
    fn update_delivery_and_read() {
        let db = Database::open_in_memory().unwrap();
        let msg = message(1, 2, 0);
        db.insert_message(&msg).unwrap();

        db.update_delivery(msg.id, DeliveryStatus::Sent, DeliveryMethod::Cloud)
            .unwrap();
        assert!(db.mark_read(msg.id).unwrap());
        assert!(!db.mark_read(msg.id).unwrap());

        let stored = db.get_message(msg.id).unwrap();
        assert_eq!(stored.status, DeliveryStatus::Sent);
        assert_eq!(stored.method, DeliveryMethod::Cloud);
        assert!(stored.is_read);
    }

    #[test]
    fn update_unknown_message() {
        let db = Database::open_in_memory().unwrap();
        let err = db
            .update_delivery(MessageId::new(), DeliveryStatus::Sent, DeliveryMethod::Mesh)
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[test]
    fn archive_splits_active_set() {
        let mut db = Database::open_in_memory().unwrap();
        let old = message(1, 2, -10);
        let new = message(2, 1, 0);
        db.insert_message(&new).unwrap();
        db.insert_message(&old).unwrap();

        let active: Vec<MessageId> = db.active_messages().unwrap().iter().map(|m| m.id).collect();
        assert_eq!(active, vec![old.id, new.id]);

        assert_eq!(db.archive_messages(&[old.id]).unwrap(), 1);
        assert_eq!(db.active_messages().unwrap().len(), 1);
        let archived = db.archived_messages(10, 0).unwrap();
        assert_eq!(archived.len(), 1);
        assert!(archived[0].archived);

        // Archived ids still count as known
        assert!(db.message_exists(old.id).unwrap());
    }

    #[test]
    fn delete_and_peer_history() {
        let db = Database::open_in_memory().unwrap();
        let a = message(1, 2, 0);
        let b = message(3, 1, 1);
        db.insert_message(&a).unwrap();
        db.insert_message(&b).unwrap();

        assert_eq!(db.messages_with_peer(&PeerKey([2; 32])).unwrap().len(), 1);
        assert_eq!(db.messages_with_peer(&PeerKey([1; 32])).unwrap().len(), 2);

        assert!(db.delete_message(a.id).unwrap());
        assert!(!db.delete_message(a.id).unwrap());
        assert!(matches!(db.get_message(a.id), Err(StoreError::NotFound)));
    }
}
