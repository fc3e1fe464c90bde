//! v001 -- Initial schema creation.
//!
//! Creates the message ledger (active and archived rows share one table)
//! and the two delivery queues: `mesh_retry` and `pending_decrypt`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id             TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    sender_key     TEXT NOT NULL,              -- hex-encoded X25519 pubkey
    recipient_key  TEXT NOT NULL,              -- hex-encoded X25519 pubkey
    timestamp      TEXT NOT NULL,              -- RFC-3339
    ciphertext     BLOB NOT NULL,              -- ratchet ciphertext, as sent
    plaintext      TEXT,                       -- cached after encrypt/decrypt
    status         TEXT NOT NULL,              -- pending | sent | delivered | failed
    method         TEXT NOT NULL,              -- mesh | cloud | pending
    media_ref      TEXT,
    is_read        INTEGER NOT NULL DEFAULT 0, -- boolean 0/1
    archived       INTEGER NOT NULL DEFAULT 0  -- boolean 0/1
);

CREATE INDEX IF NOT EXISTS idx_messages_archived_ts
    ON messages(archived, timestamp);

-- ----------------------------------------------------------------
-- Pending mesh retry (sent via cloud, mesh still wanted)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS mesh_retry (
    seq               INTEGER PRIMARY KEY AUTOINCREMENT,
    message_id        TEXT NOT NULL UNIQUE,
    recipient_address TEXT NOT NULL,
    enqueued_at       TEXT NOT NULL,

    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Pending decryption (ratchet could not open the message yet)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS pending_decrypt (
    seq           INTEGER PRIMARY KEY AUTOINCREMENT,
    message_id    TEXT NOT NULL UNIQUE,
    sender_key    TEXT NOT NULL,
    recipient_key TEXT NOT NULL,
    timestamp     TEXT NOT NULL,
    ciphertext    BLOB NOT NULL,
    media_ref     TEXT,
    method        TEXT NOT NULL,
    enqueued_at   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pending_decrypt_sender
    ON pending_decrypt(sender_key, seq);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
