//! SQLite-backed storage

use super::{Storage, StorageError};
use crate::types::{DocumentRef, FeedbackRecord, PredictionResult};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::SqlitePool;

#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Wrap a pool, creating the pipeline tables if they don't exist
    pub async fn new(pool: SqlitePool) -> Result<Self, StorageError> {
        init_tables(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Stored document type for a file, if classified
    pub async fn document_type(&self, file_path: &str) -> Result<Option<String>, StorageError> {
        let row = sqlx::query_scalar::<_, String>(
            "SELECT document_type FROM documents WHERE file_path = ?",
        )
        .bind(file_path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Stored OCR text for a file
    pub async fn extracted_text(&self, file_path: &str) -> Result<Option<String>, StorageError> {
        let row = sqlx::query_scalar::<_, Option<String>>(
            "SELECT extracted_text FROM documents WHERE file_path = ?",
        )
        .bind(file_path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.flatten())
    }

    /// Stored correction for a file
    pub async fn feedback_for(&self, file_path: &str) -> Result<Option<String>, StorageError> {
        let row = sqlx::query_scalar::<_, String>("SELECT doc_type FROM feedback WHERE file_path = ?")
            .bind(file_path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Payloads of recorded events of one type, oldest first
    pub async fn events_of_type(&self, event_type: &str) -> Result<Vec<Value>, StorageError> {
        let rows = sqlx::query_scalar::<_, String>(
            "SELECT payload FROM pipeline_events WHERE event_type = ? ORDER BY id",
        )
        .bind(event_type)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|raw| serde_json::from_str(raw).map_err(StorageError::from))
            .collect()
    }
}

async fn init_tables(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            file_path TEXT PRIMARY KEY,
            document_type TEXT NOT NULL,
            extracted_text TEXT,
            is_rule_based INTEGER NOT NULL,
            confidence REAL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS feedback (
            file_path TEXT PRIMARY KEY,
            doc_type TEXT NOT NULL,
            timestamp TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS document_types (
            name TEXT PRIMARY KEY
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pipeline_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    tracing::info!("Database tables initialized (documents, feedback, document_types, pipeline_events)");
    Ok(())
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn save_feedback(&self, record: &FeedbackRecord) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO feedback (file_path, doc_type, timestamp)
            VALUES (?, ?, ?)
            ON CONFLICT(file_path) DO UPDATE SET
                doc_type = excluded.doc_type,
                timestamp = excluded.timestamp
            "#,
        )
        .bind(&record.file_path)
        .bind(&record.doc_type)
        .bind(record.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_valid_doc_types(&self) -> Result<Vec<String>, StorageError> {
        let types = sqlx::query_scalar::<_, String>(
            "SELECT name FROM document_types UNION SELECT doc_type FROM feedback ORDER BY 1",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(types)
    }

    async fn add_document_types(&self, types: &[String]) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        for name in types {
            sqlx::query("INSERT OR IGNORE INTO document_types (name) VALUES (?)")
                .bind(name)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn save_document_type(
        &self,
        document: &DocumentRef,
        result: &PredictionResult,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO documents (file_path, document_type, extracted_text, is_rule_based, confidence, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(file_path) DO UPDATE SET
                document_type = excluded.document_type,
                extracted_text = COALESCE(excluded.extracted_text, documents.extracted_text),
                is_rule_based = excluded.is_rule_based,
                confidence = excluded.confidence,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&document.file_path)
        .bind(&result.document_type)
        .bind(&document.extracted_text)
        .bind(result.is_rule_based)
        .bind(result.confidence.map(f64::from))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_event(&self, event_type: &str, payload: &Value) -> Result<(), StorageError> {
        sqlx::query("INSERT INTO pipeline_events (event_type, payload, created_at) VALUES (?, ?, ?)")
            .bind(event_type)
            .bind(payload.to_string())
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn storage() -> SqliteStorage {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        SqliteStorage::new(pool).await.unwrap()
    }

    #[tokio::test]
    async fn test_feedback_upsert() {
        let storage = storage().await;

        for doc_type in ["Invoice", "Report"] {
            storage
                .save_feedback(&FeedbackRecord {
                    file_path: "/scans/a.pdf".to_string(),
                    doc_type: doc_type.to_string(),
                    timestamp: Utc::now(),
                })
                .await
                .unwrap();
        }

        assert_eq!(
            storage.feedback_for("/scans/a.pdf").await.unwrap().as_deref(),
            Some("Report")
        );
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM feedback")
            .fetch_one(storage.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_valid_types_include_feedback() {
        let storage = storage().await;
        storage
            .add_document_types(&["Report".to_string(), "Invoice".to_string(), "Invoice".to_string()])
            .await
            .unwrap();
        storage
            .save_feedback(&FeedbackRecord {
                file_path: "b.pdf".to_string(),
                doc_type: "Contract".to_string(),
                timestamp: Utc::now(),
            })
            .await
            .unwrap();

        assert_eq!(
            storage.get_valid_doc_types().await.unwrap(),
            vec!["Contract", "Invoice", "Report"]
        );
    }

    #[tokio::test]
    async fn test_document_type_and_events() {
        let storage = storage().await;
        let document = DocumentRef::new("c.pdf");

        storage
            .save_document_type(
                &document.clone().with_text("Invoice 001"),
                &PredictionResult::rule_based("Invoice"),
            )
            .await
            .unwrap();
        // A later save without text keeps the stored text
        storage
            .save_document_type(&document, &PredictionResult::from_model("Report", 0.8))
            .await
            .unwrap();
        assert_eq!(
            storage.document_type("c.pdf").await.unwrap().as_deref(),
            Some("Report")
        );
        assert_eq!(
            storage.extracted_text("c.pdf").await.unwrap().as_deref(),
            Some("Invoice 001")
        );
        assert_eq!(storage.extracted_text("missing.pdf").await.unwrap(), None);

        storage
            .record_event("PREDICTION_COMPLETED", &json!({"file_path": "c.pdf"}))
            .await
            .unwrap();
        assert_eq!(
            storage.events_of_type("PREDICTION_COMPLETED").await.unwrap(),
            vec![json!({"file_path": "c.pdf"})]
        );
    }
}
