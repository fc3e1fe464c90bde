use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("no platform data directory for meshrelay")]
    NoDataDir,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// No row with the requested message id.
    #[error("record not found")]
    NotFound,

    #[error("schema migration to v{version} failed: {reason}")]
    Migration { version: u32, reason: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;
