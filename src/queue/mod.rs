//! Change queue
//!
//! Row mutations on catalog tables are appended to `search_sync_events` by
//! database triggers. The consumer reads pending events in id order and
//! marks them processed once applied; events are never deleted.

mod triggers;

pub use triggers::*;

use crate::catalog::TableKey;
use crate::error::{Error, Result};
use crate::relational::quote_ident;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;
use std::str::FromStr;
use tracing::{debug, info};

/// Queue table name
pub const QUEUE_TABLE: &str = "search_sync_events";

/// Longest error message stored on an event
pub const MAX_ERROR_LENGTH: usize = 2000;

/// Row mutation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Insert => write!(f, "insert"),
            Operation::Update => write!(f, "update"),
            Operation::Delete => write!(f, "delete"),
        }
    }
}

impl FromStr for Operation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "insert" => Ok(Operation::Insert),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            _ => Err(Error::Other(format!("Unknown queue operation: {}", s))),
        }
    }
}

/// One queued row mutation
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub id: i64,
    pub schema_name: String,
    pub table_name: String,
    pub primary_key: String,
    pub primary_value: String,
    pub operation: String,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub processed_at: Option<String>,
}

impl ChangeEvent {
    pub fn get_operation(&self) -> Result<Operation> {
        self.operation.parse()
    }

    pub fn table_key(&self) -> TableKey {
        TableKey::new(&self.schema_name, &self.table_name)
    }

    pub fn is_pending(&self) -> bool {
        self.processed_at.is_none()
    }
}

/// Consumer side of the change queue
#[async_trait]
pub trait ChangeQueue: Send + Sync {
    /// Unprocessed events in ascending id order
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<ChangeEvent>>;

    async fn mark_processed(&self, id: i64) -> Result<()>;

    /// Bump `attempts` and store the failure; the event stays pending
    async fn record_error(&self, id: i64, message: &str) -> Result<()>;

    async fn pending_count(&self) -> Result<u64>;
}

/// Change queue stored in a SQLite schema
#[derive(Clone)]
pub struct SqliteQueue {
    pool: SqlitePool,
    schema: String,
}

fn truncate_message(message: &str) -> String {
    message.chars().take(MAX_ERROR_LENGTH).collect()
}

impl SqliteQueue {
    pub fn new(pool: SqlitePool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    fn table(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), QUEUE_TABLE)
    }

    /// Create the queue table and its pending-scan index
    pub async fn init_schema(&self) -> Result<()> {
        info!(schema = %self.schema, "Initializing change queue schema");
        let sql = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                schema_name TEXT NOT NULL,
                table_name TEXT NOT NULL,
                primary_key TEXT NOT NULL,
                primary_value TEXT NOT NULL DEFAULT '',
                operation TEXT NOT NULL CHECK (operation IN ('insert', 'update', 'delete')),
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                processed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS {schema}.idx_search_sync_events_pending
                ON {queue} (processed_at, id);
            "#,
            table = self.table(),
            schema = quote_ident(&self.schema),
            queue = QUEUE_TABLE,
        );
        sqlx::raw_sql(&sql).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn is_initialized(&self) -> Result<bool> {
        let sql = format!(
            "SELECT 1 FROM {}.sqlite_master WHERE type = 'table' AND name = ?1",
            quote_ident(&self.schema)
        );
        let found: Option<(i64,)> = sqlx::query_as(&sql)
            .bind(QUEUE_TABLE)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    /// Fetch any event by id, processed or not
    pub async fn get_event(&self, id: i64) -> Result<Option<ChangeEvent>> {
        let sql = format!("SELECT * FROM {} WHERE id = ?1", self.table());
        let event = sqlx::query_as::<_, ChangeEvent>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(event)
    }

    #[cfg(test)]
    pub async fn enqueue(
        &self,
        table: &TableKey,
        primary_key: &str,
        primary_value: &str,
        operation: Operation,
    ) -> Result<i64> {
        let sql = format!(
            "INSERT INTO {} (schema_name, table_name, primary_key, primary_value, operation) VALUES (?1, ?2, ?3, ?4, ?5)",
            self.table()
        );
        let result = sqlx::query(&sql)
            .bind(&table.schema)
            .bind(&table.table)
            .bind(primary_key)
            .bind(primary_value)
            .bind(operation.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }
}

#[async_trait]
impl ChangeQueue for SqliteQueue {
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<ChangeEvent>> {
        let sql = format!(
            "SELECT * FROM {} WHERE processed_at IS NULL ORDER BY id ASC LIMIT ?1",
            self.table()
        );
        let events = sqlx::query_as::<_, ChangeEvent>(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        debug!(count = events.len(), "Fetched pending change events");
        Ok(events)
    }

    async fn mark_processed(&self, id: i64) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let sql = format!(
            "UPDATE {} SET processed_at = ?1, updated_at = ?1, last_error = NULL WHERE id = ?2",
            self.table()
        );
        sqlx::query(&sql)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_error(&self, id: i64, message: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let sql = format!(
            "UPDATE {} SET attempts = attempts + 1, last_error = ?1, updated_at = ?2 WHERE id = ?3",
            self.table()
        );
        sqlx::query(&sql)
            .bind(truncate_message(message))
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn pending_count(&self) -> Result<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE processed_at IS NULL",
            self.table()
        );
        let (count,): (i64,) = sqlx::query_as(&sql).fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relational::sqlite::test_support::setup_store;

    #[tokio::test]
    async fn test_fifo_and_processing_state() {
        let (store, _tmp) = setup_store().await;
        let queue = SqliteQueue::new(store.pool().clone(), "main");
        assert!(!queue.is_initialized().await.unwrap());
        queue.init_schema().await.unwrap();
        queue.init_schema().await.unwrap();
        assert!(queue.is_initialized().await.unwrap());

        let people = TableKey::new("main", "people");
        let a = queue.enqueue(&people, "id", "1", Operation::Insert).await.unwrap();
        let b = queue.enqueue(&people, "id", "2", Operation::Update).await.unwrap();
        let c = queue.enqueue(&people, "id", "1", Operation::Delete).await.unwrap();

        let pending = queue.fetch_pending(10).await.unwrap();
        assert_eq!(pending.iter().map(|e| e.id).collect::<Vec<_>>(), vec![a, b, c]);
        assert_eq!(pending[2].get_operation().unwrap(), Operation::Delete);
        assert_eq!(queue.fetch_pending(2).await.unwrap().len(), 2);

        queue.mark_processed(a).await.unwrap();
        queue.record_error(b, &"x".repeat(MAX_ERROR_LENGTH + 50)).await.unwrap();

        let pending = queue.fetch_pending(10).await.unwrap();
        assert_eq!(pending.iter().map(|e| e.id).collect::<Vec<_>>(), vec![b, c]);
        assert_eq!(pending[0].attempts, 1);
        assert_eq!(pending[0].last_error.as_ref().unwrap().len(), MAX_ERROR_LENGTH);
        assert_eq!(queue.pending_count().await.unwrap(), 2);

        let processed = queue.get_event(a).await.unwrap().unwrap();
        assert!(!processed.is_pending());
    }

    #[test]
    fn test_operation_parse() {
        assert_eq!("UPDATE".parse::<Operation>().unwrap(), Operation::Update);
        assert!("upsert".parse::<Operation>().is_err());
    }
}
