//! Relational store access
//!
//! The replication pipeline reads tables through the [`RelationalStore`]
//! trait: keyset pages for full resync, single rows for incremental sync,
//! schema introspection for primary keys and secondary indexes, and basic
//! filtered lookups for the structured search engine.

pub(crate) mod sqlite;

pub use sqlite::*;

use crate::catalog::TableKey;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One relational row, keyed by column name
pub type Record = serde_json::Map<String, Value>;

/// Introspected column metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    /// Declared type, lower-cased without the length suffix (`varchar`)
    pub data_type: String,
    pub nullable: bool,
    /// Declared length for sized types (`varchar(64)` -> 64)
    pub max_length: Option<u32>,
    /// Position in the primary key, 0 when not part of it
    pub primary_key_position: u32,
}

/// One column of an existing secondary index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexColumn {
    pub index_name: String,
    pub column: String,
    /// Position within the index, 0 for the leading column
    pub position: u32,
}

/// Filtered lookup against one table
#[derive(Debug, Clone, Default)]
pub struct TableQuery {
    /// Substring matched against `match_columns`
    pub text: Option<String>,
    pub match_columns: Vec<String>,
    /// Exact-match column filters
    pub filters: Vec<(String, Value)>,
    pub order_by: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

/// Result of a [`TableQuery`]
#[derive(Debug, Clone, Default)]
pub struct TablePage {
    pub total: u64,
    pub rows: Vec<Record>,
}

/// Relational source of truth
#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// Column metadata in declaration order
    async fn columns(&self, table: &TableKey) -> Result<Vec<ColumnInfo>>;

    /// Primary key constraint column, if any
    async fn primary_key(&self, table: &TableKey) -> Result<Option<String>>;

    /// Columns of every secondary index on the table
    async fn index_columns(&self, table: &TableKey) -> Result<Vec<IndexColumn>>;

    async fn index_exists(&self, table: &TableKey, index_name: &str) -> Result<bool>;

    /// Create a single-column secondary index. `prefix_length` is honoured
    /// by engines with index key length limits.
    async fn create_index(
        &self,
        table: &TableKey,
        index_name: &str,
        column: &str,
        prefix_length: Option<u32>,
    ) -> Result<()>;

    /// Rows with `primary_key > after` in ascending key order
    async fn fetch_page(
        &self,
        table: &TableKey,
        primary_key: &str,
        after: Option<&Value>,
        limit: usize,
    ) -> Result<Vec<Record>>;

    /// Current row for a primary key value
    async fn fetch_row(
        &self,
        table: &TableKey,
        primary_key: &str,
        value: &Value,
    ) -> Result<Option<Record>>;

    async fn count_rows(&self, table: &TableKey) -> Result<u64>;

    async fn search_table(&self, table: &TableKey, query: &TableQuery) -> Result<TablePage>;
}

/// Render a scalar as the string stored in the change queue and hashed into
/// document ids. `None` for null or structured values.
pub fn value_to_key_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
        _ => None,
    }
}

/// Inverse of [`value_to_key_string`] for queue payloads: integers become
/// numbers, everything else stays text.
pub fn key_string_to_value(raw: &str) -> Value {
    match raw.parse::<i64>() {
        Ok(n) if n.to_string() == raw => Value::from(n),
        _ => Value::String(raw.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_string_conversions() {
        assert_eq!(value_to_key_string(&json!(42)).as_deref(), Some("42"));
        assert_eq!(value_to_key_string(&json!("A-7")).as_deref(), Some("A-7"));
        assert_eq!(value_to_key_string(&Value::Null), None);
        assert_eq!(value_to_key_string(&json!({"a": 1})), None);

        assert_eq!(key_string_to_value("42"), json!(42));
        assert_eq!(key_string_to_value("007"), json!("007"));
        assert_eq!(key_string_to_value("A-7"), json!("A-7"));
    }
}
