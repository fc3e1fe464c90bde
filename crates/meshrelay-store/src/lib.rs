//! # meshrelay-store
//!
//! Local durable storage for a meshrelay node, backed by SQLite.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed CRUD helpers for the message
//! ledger and both delivery queues. Everything survives a restart.

pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod queues;

mod error;

pub use database::{default_data_dir, Database};
pub use error::{Result, StoreError};
pub use models::*;
