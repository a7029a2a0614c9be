//! SQLite relational store
//!
//! Catalog schemas map to attached databases; `main` is the primary file.

use super::{ColumnInfo, IndexColumn, Record, RelationalStore, TablePage, TableQuery};
use crate::catalog::TableKey;
use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow, SqliteSynchronous,
};
use sqlx::{Column, Row, Sqlite, TypeInfo, ValueRef};
use std::str::FromStr;
use tracing::{debug, info};

/// Quote an identifier, doubling embedded quotes
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `"schema"."table"`
pub fn qualified_table(table: &TableKey) -> String {
    format!("{}.{}", quote_ident(&table.schema), quote_ident(&table.table))
}

pub(crate) fn bind_json<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64()),
        },
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(other.to_string()),
    }
}

/// Decode a row into a JSON map using each value's storage class
pub(crate) fn decode_row(row: &SqliteRow) -> Record {
    let mut record = Record::new();

    for column in row.columns() {
        let idx = column.ordinal();
        let storage = match row.try_get_raw(idx) {
            Ok(raw) if !raw.is_null() => Some(raw.type_info().name().to_uppercase()),
            _ => None,
        };

        let value = match storage.as_deref() {
            None => Value::Null,
            Some("INTEGER") => row
                .try_get::<i64, _>(idx)
                .map(Value::from)
                .unwrap_or(Value::Null),
            Some("REAL") => row
                .try_get::<f64, _>(idx)
                .map(Value::from)
                .unwrap_or(Value::Null),
            Some("BLOB") => row
                .try_get::<Vec<u8>, _>(idx)
                .map(|bytes| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
                .unwrap_or(Value::Null),
            Some(_) => row
                .try_get::<String, _>(idx)
                .map(Value::String)
                .unwrap_or(Value::Null),
        };

        record.insert(column.name().to_string(), value);
    }

    record
}

/// Split a declared type like `VARCHAR(64)` into (`varchar`, Some(64))
fn parse_declared_type(declared: &str) -> (String, Option<u32>) {
    let declared = declared.trim().to_lowercase();
    match declared.split_once('(') {
        Some((base, rest)) => {
            let length = rest
                .trim_end_matches(')')
                .split(',')
                .next()
                .and_then(|n| n.trim().parse().ok());
            (base.trim().to_string(), length)
        }
        None => (declared, None),
    }
}

fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len() + 2);
    escaped.push('%');
    for ch in text.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}

/// SQLite-backed [`RelationalStore`]
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect and attach the configured schemas on every pooled connection
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| Error::Config(format!("Invalid database URL: {}", e)))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        debug!("Connecting to SQLite database at {}", config.url);

        let attach: Vec<(String, String)> = config
            .attach
            .iter()
            .map(|(schema, path)| (schema.clone(), path.clone()))
            .collect();

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .after_connect(move |conn, _meta| {
                let attach = attach.clone();
                Box::pin(async move {
                    for (schema, path) in attach {
                        sqlx::query(&format!("ATTACH DATABASE ? AS {}", quote_ident(&schema)))
                            .bind(path)
                            .execute(&mut *conn)
                            .await?;
                    }
                    Ok(())
                })
            })
            .connect_with(options)
            .await?;

        if !config.attach.is_empty() {
            info!("Attached schemas: {:?}", config.attach.keys().collect::<Vec<_>>());
        }

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run a multi-statement SQL script
    pub async fn execute_script(&self, sql: &str) -> Result<()> {
        sqlx::raw_sql(sql).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl RelationalStore for SqliteStore {
    async fn columns(&self, table: &TableKey) -> Result<Vec<ColumnInfo>> {
        let rows: Vec<(String, String, i64, i64)> = sqlx::query_as(
            r#"SELECT name, "type", "notnull", pk FROM pragma_table_info(?1, ?2) ORDER BY cid"#,
        )
        .bind(&table.table)
        .bind(&table.schema)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(name, declared, not_null, pk)| {
                let (data_type, max_length) = parse_declared_type(&declared);
                ColumnInfo {
                    name,
                    data_type,
                    nullable: not_null == 0,
                    max_length,
                    primary_key_position: pk.max(0) as u32,
                }
            })
            .collect())
    }

    async fn primary_key(&self, table: &TableKey) -> Result<Option<String>> {
        let mut columns: Vec<ColumnInfo> = self
            .columns(table)
            .await?
            .into_iter()
            .filter(|column| column.primary_key_position > 0)
            .collect();
        columns.sort_by_key(|column| column.primary_key_position);
        Ok(columns.into_iter().next().map(|column| column.name))
    }

    async fn index_columns(&self, table: &TableKey) -> Result<Vec<IndexColumn>> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            r#"
            SELECT il.name, ii.name, ii.seqno
            FROM pragma_index_list(?1, ?2) AS il
            JOIN pragma_index_info(il.name, ?2) AS ii
            WHERE ii.name IS NOT NULL
            ORDER BY il.name, ii.seqno
            "#,
        )
        .bind(&table.table)
        .bind(&table.schema)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(index_name, column, seqno)| IndexColumn {
                index_name,
                column,
                position: seqno.max(0) as u32,
            })
            .collect())
    }

    async fn index_exists(&self, table: &TableKey, index_name: &str) -> Result<bool> {
        let sql = format!(
            "SELECT 1 FROM {}.sqlite_master WHERE type = 'index' AND name = ?1",
            quote_ident(&table.schema)
        );
        let found: Option<(i64,)> = sqlx::query_as(&sql)
            .bind(index_name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    async fn create_index(
        &self,
        table: &TableKey,
        index_name: &str,
        column: &str,
        _prefix_length: Option<u32>,
    ) -> Result<()> {
        // SQLite has no index key length limit, so prefixes are not needed.
        let sql = format!(
            "CREATE INDEX IF NOT EXISTS {}.{} ON {} ({})",
            quote_ident(&table.schema),
            quote_ident(index_name),
            quote_ident(&table.table),
            quote_ident(column)
        );
        debug!("{}", sql);
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn fetch_page(
        &self,
        table: &TableKey,
        primary_key: &str,
        after: Option<&Value>,
        limit: usize,
    ) -> Result<Vec<Record>> {
        let pk = quote_ident(primary_key);
        let from = qualified_table(table);

        let rows = match after {
            Some(cursor) => {
                let sql = format!(
                    "SELECT * FROM {} WHERE {} > ?1 ORDER BY {} ASC LIMIT ?2",
                    from, pk, pk
                );
                bind_json(sqlx::query(&sql), cursor)
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!("SELECT * FROM {} ORDER BY {} ASC LIMIT ?1", from, pk);
                sqlx::query(&sql)
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        Ok(rows.iter().map(decode_row).collect())
    }

    async fn fetch_row(
        &self,
        table: &TableKey,
        primary_key: &str,
        value: &Value,
    ) -> Result<Option<Record>> {
        let sql = format!(
            "SELECT * FROM {} WHERE {} = ?1 LIMIT 1",
            qualified_table(table),
            quote_ident(primary_key)
        );
        let row = bind_json(sqlx::query(&sql), value)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(decode_row))
    }

    async fn count_rows(&self, table: &TableKey) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", qualified_table(table));
        let (count,): (i64,) = sqlx::query_as(&sql).fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }

    async fn search_table(&self, table: &TableKey, query: &TableQuery) -> Result<TablePage> {
        let mut clauses = Vec::new();
        let mut params: Vec<Value> = Vec::new();

        if let Some(text) = query.text.as_deref().filter(|t| !t.trim().is_empty()) {
            if !query.match_columns.is_empty() {
                params.push(Value::String(escape_like(text.trim())));
                let slot = params.len();
                let ors: Vec<String> = query
                    .match_columns
                    .iter()
                    .map(|column| format!("{} LIKE ?{} ESCAPE '\\'", quote_ident(column), slot))
                    .collect();
                clauses.push(format!("({})", ors.join(" OR ")));
            }
        }

        for (column, value) in &query.filters {
            match value {
                Value::Array(items) if !items.is_empty() => {
                    let slots: Vec<String> = items
                        .iter()
                        .map(|item| {
                            params.push(item.clone());
                            format!("?{}", params.len())
                        })
                        .collect();
                    clauses.push(format!("{} IN ({})", quote_ident(column), slots.join(", ")));
                }
                _ => {
                    params.push(value.clone());
                    clauses.push(format!("{} = ?{}", quote_ident(column), params.len()));
                }
            }
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let from = qualified_table(table);

        let count_sql = format!("SELECT COUNT(*) FROM {}{}", from, where_sql);
        let mut count_query = sqlx::query(&count_sql);
        for param in &params {
            count_query = bind_json(count_query, param);
        }
        let total: i64 = count_query.fetch_one(&self.pool).await?.try_get(0)?;

        if total == 0 || query.limit == 0 {
            return Ok(TablePage {
                total: total.max(0) as u64,
                rows: Vec::new(),
            });
        }

        let order_sql = query
            .order_by
            .as_deref()
            .map(|column| format!(" ORDER BY {} ASC", quote_ident(column)))
            .unwrap_or_default();
        let select_sql = format!(
            "SELECT * FROM {}{}{} LIMIT ?{} OFFSET ?{}",
            from,
            where_sql,
            order_sql,
            params.len() + 1,
            params.len() + 2
        );
        let mut select_query = sqlx::query(&select_sql);
        for param in &params {
            select_query = bind_json(select_query, param);
        }
        let rows = select_query
            .bind(query.limit as i64)
            .bind(query.offset as i64)
            .fetch_all(&self.pool)
            .await?;

        Ok(TablePage {
            total: total as u64,
            rows: rows.iter().map(decode_row).collect(),
        })
    }
}
