//! Persistence collaborator
//!
//! The pipeline only needs four things from storage: save a correction,
//! list the document types a user may choose from, record a classification,
//! and append an audit event. [`sqlite::SqliteStorage`] is the shipped
//! implementation.

pub mod sqlite;

use crate::types::{DocumentRef, FeedbackRecord, PredictionResult};
use async_trait::async_trait;
use serde_json::Value;
use scanflow_common::config::DatabaseConfig;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

pub use sqlite::SqliteStorage;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Insert or replace the correction for `record.file_path`
    async fn save_feedback(&self, record: &FeedbackRecord) -> Result<(), StorageError>;

    /// Known document types, sorted
    async fn get_valid_doc_types(&self) -> Result<Vec<String>, StorageError>;

    /// Remember a document type as selectable
    async fn add_document_types(&self, types: &[String]) -> Result<(), StorageError>;

    /// Persist the classification of a document
    async fn save_document_type(
        &self,
        document: &DocumentRef,
        result: &PredictionResult,
    ) -> Result<(), StorageError>;

    /// Append an audit event
    async fn record_event(&self, event_type: &str, payload: &Value) -> Result<(), StorageError>;
}

/// Open (creating if needed) the SQLite database at `db_path`
///
/// Every pooled connection runs in WAL mode with a busy timeout, so writes
/// from several consume loops wait for the lock instead of failing.
pub async fn init_database_pool(
    db_path: &Path,
    config: &DatabaseConfig,
) -> Result<SqlitePool, StorageError> {
    let newly_created = !db_path.exists();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // mode=rwc: read, write, create
    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    tracing::debug!("Connecting to database: {}", db_url);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(
            SqliteConnectOptions::from_str(&db_url)?
                .busy_timeout(config.busy_timeout())
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal)
                .create_if_missing(true),
        )
        .await?;

    if newly_created {
        tracing::info!("Initialized new database: {}", db_path.display());
    } else {
        tracing::info!("Opened existing database: {}", db_path.display());
    }
    tracing::debug!(
        max_connections = config.max_connections,
        busy_timeout_ms = config.busy_timeout_ms,
        "Database pool ready"
    );
    Ok(pool)
}
