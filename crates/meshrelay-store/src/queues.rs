//! Durable backing for the pending-mesh-retry and pending-decryption queues.
//!
//! Both tables keep insertion order in an autoincrement `seq` column; the
//! in-memory queues in the engine mirror them and are reloaded on start.

use rusqlite::params;

use meshrelay_shared::protocol::ChatMessage;
use meshrelay_shared::types::{MessageId, PeerAddress, PeerKey};

use crate::database::Database;
use crate::error::Result;
use crate::messages::{format_timestamp, parse_id, parse_key, parse_method, parse_timestamp};
use crate::models::{PendingDecryption, RetryEntry};

impl Database {
    // -----------------------------------------------------------------------
    // Mesh retry
    // -----------------------------------------------------------------------

    /// Queue a message for mesh retry. The message itself must already be
    /// in the ledger. Re-queueing an id keeps its original position.
    pub fn enqueue_retry(&self, entry: &RetryEntry) -> Result<bool> {
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO mesh_retry (message_id, recipient_address, enqueued_at)
             VALUES (?1, ?2, ?3)",
            params![
                entry.message.id.to_string(),
                entry.recipient_address.0,
                format_timestamp(&entry.enqueued_at),
            ],
        )?;
        Ok(inserted > 0)
    }

    /// Retry entries, oldest first.
    pub fn retry_entries(&self) -> Result<Vec<RetryEntry>> {
        let mut stmt = self.conn().prepare(
            "SELECT m.id, m.sender_key, m.recipient_key, m.timestamp, m.ciphertext, m.media_ref,
                    r.recipient_address, r.enqueued_at
             FROM mesh_retry r
             JOIN messages m ON m.id = r.message_id
             ORDER BY r.seq ASC",
        )?;

        let rows = stmt.query_map([], |row| {
            let message = row_to_chat(row)?;
            let address: String = row.get(6)?;
            let enqueued: String = row.get(7)?;
            Ok(RetryEntry {
                message,
                recipient_address: PeerAddress(address),
                enqueued_at: parse_timestamp(7, &enqueued)?,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    pub fn remove_retry(&self, id: MessageId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM mesh_retry WHERE message_id = ?1",
            params![id.to_string()],
        )?;
        Ok(affected > 0)
    }

    pub fn retry_count(&self) -> Result<usize> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM mesh_retry", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    // -----------------------------------------------------------------------
    // Pending decryption
    // -----------------------------------------------------------------------

    pub fn enqueue_pending_decrypt(&self, entry: &PendingDecryption) -> Result<bool> {
        let message = &entry.message;
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO pending_decrypt
                (message_id, sender_key, recipient_key, timestamp, ciphertext, media_ref,
                 method, enqueued_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                message.id.to_string(),
                message.sender.to_hex(),
                message.recipient.to_hex(),
                format_timestamp(&message.timestamp),
                message.ciphertext,
                message.media_ref,
                entry.method.as_str(),
                format_timestamp(&entry.enqueued_at),
            ],
        )?;
        Ok(inserted > 0)
    }

    /// Every buffered message, in arrival order.
    pub fn pending_decrypts(&self) -> Result<Vec<PendingDecryption>> {
        self.query_pending(
            "SELECT message_id, sender_key, recipient_key, timestamp, ciphertext, media_ref,
                    method, enqueued_at
             FROM pending_decrypt
             ORDER BY seq ASC",
            params![],
        )
    }

    /// Buffered messages of one sender, in arrival order.
    pub fn pending_decrypts_for(&self, sender: &PeerKey) -> Result<Vec<PendingDecryption>> {
        self.query_pending(
            "SELECT message_id, sender_key, recipient_key, timestamp, ciphertext, media_ref,
                    method, enqueued_at
             FROM pending_decrypt
             WHERE sender_key = ?1
             ORDER BY seq ASC",
            params![sender.to_hex()],
        )
    }

    pub fn remove_pending_decrypt(&self, id: MessageId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM pending_decrypt WHERE message_id = ?1",
            params![id.to_string()],
        )?;
        Ok(affected > 0)
    }

    fn query_pending(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<PendingDecryption>> {
        let mut stmt = self.conn().prepare(sql)?;
        let rows = stmt.query_map(params, |row| {
            let message = row_to_chat(row)?;
            let method: String = row.get(6)?;
            let enqueued: String = row.get(7)?;
            Ok(PendingDecryption {
                message,
                method: parse_method(6, &method)?,
                enqueued_at: parse_timestamp(7, &enqueued)?,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }
}

/// Columns 0..=5: id, sender, recipient, timestamp, ciphertext, media_ref.
fn row_to_chat(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessage> {
    let id: String = row.get(0)?;
    let sender: String = row.get(1)?;
    let recipient: String = row.get(2)?;
    let timestamp: String = row.get(3)?;

    Ok(ChatMessage {
        id: parse_id(0, &id)?,
        sender: parse_key(1, &sender)?,
        recipient: parse_key(2, &recipient)?,
        timestamp: parse_timestamp(3, &timestamp)?,
        ciphertext: row.get(4)?,
        media_ref: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Utc;
    use meshrelay_shared::types::{DeliveryMethod, DeliveryStatus};

    use crate::models::StoredMessage;

    fn chat(sender: u8) -> ChatMessage {
        ChatMessage {
            id: MessageId::new(),
            sender: PeerKey([sender; 32]),
            recipient: PeerKey([9; 32]),
            timestamp: Utc::now(),
            ciphertext: vec![sender, 1, 2],
            media_ref: None,
        }
    }

    fn retry_entry(db: &Database) -> RetryEntry {
        let message = chat(1);
        let stored = StoredMessage::from_chat(
            &message,
            Some("hello".into()),
            DeliveryStatus::Sent,
            DeliveryMethod::Cloud,
        );
        db.insert_message(&stored).unwrap();
        RetryEntry {
            recipient_address: message.recipient.address(),
            message,
            enqueued_at: Utc::now(),
        }
    }

    #[test]
    fn retry_queue_keeps_order() {
        let db = Database::open_in_memory().unwrap();
        let first = retry_entry(&db);
        let second = retry_entry(&db);

        assert!(db.enqueue_retry(&first).unwrap());
        assert!(db.enqueue_retry(&second).unwrap());
        assert!(!db.enqueue_retry(&first).unwrap());

        let entries = db.retry_entries().unwrap();
        assert_eq!(entries, vec![first.clone(), second]);
        assert_eq!(db.retry_count().unwrap(), 2);

        assert!(db.remove_retry(first.message.id).unwrap());
        assert_eq!(db.retry_count().unwrap(), 1);
    }

    #[test]
    fn deleting_message_drops_retry_entry() {
        let db = Database::open_in_memory().unwrap();
        let entry = retry_entry(&db);
        db.enqueue_retry(&entry).unwrap();

        db.delete_message(entry.message.id).unwrap();
        assert_eq!(db.retry_count().unwrap(), 0);
    }

    #[test]
    fn pending_decrypts_per_sender() {
        let db = Database::open_in_memory().unwrap();
        let a1 = PendingDecryption {
            message: chat(1),
            method: DeliveryMethod::Mesh,
            enqueued_at: Utc::now(),
        };
        let b1 = PendingDecryption {
            message: chat(2),
            method: DeliveryMethod::Cloud,
            enqueued_at: Utc::now(),
        };
        let a2 = PendingDecryption {
            message: chat(1),
            method: DeliveryMethod::Mesh,
            enqueued_at: Utc::now(),
        };

        for entry in [&a1, &b1, &a2] {
            assert!(db.enqueue_pending_decrypt(entry).unwrap());
        }
        assert!(!db.enqueue_pending_decrypt(&a1).unwrap());

        assert_eq!(db.pending_decrypts().unwrap().len(), 3);
        let from_a = db.pending_decrypts_for(&PeerKey([1; 32])).unwrap();
        assert_eq!(from_a, vec![a1.clone(), a2]);

        assert!(db.remove_pending_decrypt(a1.message.id).unwrap());
        assert_eq!(db.pending_decrypts_for(&PeerKey([1; 32])).unwrap().len(), 1);
    }
}
