//! Automatic secondary indexes
//!
//! Creates one relational index per searchable column so the structured
//! search engine does not scan whole tables. Re-running is a no-op once every
//! column is backed.

use crate::catalog::{normalize_key, Catalog, CatalogAccessor, CatalogEntry, TableKey};
use crate::config::IndexingConfig;
use crate::error::{Error, Result};
use crate::queue::{sanitize_identifier, QUEUE_TABLE};
use crate::relational::{ColumnInfo, RelationalStore};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Tables never indexed automatically
pub const DEFAULT_EXCLUSIONS: &[&str] = &[
    "blacklist",
    "divisions",
    "profiles",
    "profile_attachments",
    "profile_shares",
    "structuresanctions",
    QUEUE_TABLE,
    "upload_history",
    "users",
    "users_log",
    "user_sessions",
    "search_logs",
];

/// Longest generated index name
pub const MAX_INDEX_NAME_LENGTH: usize = 63;

const TEXT_TYPES: &[&str] = &[
    "char", "varchar", "nchar", "nvarchar", "character", "varying character", "text",
    "tinytext", "mediumtext", "longtext", "clob",
];
const UNSUPPORTED_TYPES: &[&str] = &["json", "blob", "tinyblob", "mediumblob", "longblob"];

/// `idx_{schema}_{table}_{column}`, sanitized and capped
pub fn index_name(table: &TableKey, column: &str) -> String {
    sanitize_identifier(
        &format!("idx_{}_{}_{}", table.schema, table.table, column),
        MAX_INDEX_NAME_LENGTH,
    )
}

/// An index that was, or in a dry run would be, created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedIndex {
    pub table: String,
    pub column: String,
    pub index: String,
    pub prefix_length: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexingError {
    pub table: String,
    pub column: Option<String>,
    pub index: Option<String>,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexingSummary {
    pub tables_processed: usize,
    pub columns_evaluated: usize,
    pub indexes_created: usize,
    pub indexes_skipped: usize,
    pub errors: Vec<IndexingError>,
    pub planned: Vec<PlannedIndex>,
}

/// Why a column gets no new index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SkipReason {
    UnsupportedType,
    PrimaryKey,
    AlreadyIndexed,
    NameTaken,
}

pub struct IndexingService {
    catalog: Arc<CatalogAccessor>,
    store: Arc<dyn RelationalStore>,
    config: IndexingConfig,
    exclusions: HashSet<String>,
}

impl IndexingService {
    pub fn new(
        catalog: Arc<CatalogAccessor>,
        store: Arc<dyn RelationalStore>,
        config: IndexingConfig,
    ) -> Self {
        let exclusions = DEFAULT_EXCLUSIONS
            .iter()
            .map(|name| name.to_string())
            .chain(config.exclusions.iter().cloned())
            .map(|name| name.to_lowercase())
            .collect();
        Self {
            catalog,
            store,
            config,
            exclusions,
        }
    }

    pub fn is_excluded(&self, table: &TableKey) -> bool {
        let table_name = table.table.to_lowercase();
        let qualified = table.qualified().to_lowercase();
        self.exclusions.contains(&table_name) || self.exclusions.contains(&qualified)
    }

    /// Catalog tables plus configured extras that are not in the catalog.
    /// Extras have no searchable list, so all their columns are evaluated.
    fn targets(&self, catalog: &Catalog) -> Vec<CatalogEntry> {
        let mut targets: Vec<CatalogEntry> = catalog.entries().cloned().collect();
        for extra in &self.config.extra_tables {
            match normalize_key(extra) {
                Ok(key) if catalog.get(&key).is_none() => targets.push(CatalogEntry::new(key)),
                Ok(_) => {}
                Err(e) => warn!(table = %extra, error = %e, "Ignoring extra indexing table"),
            }
        }
        targets
    }

    fn prefix_length(&self, column: &ColumnInfo) -> Option<u32> {
        if !TEXT_TYPES.contains(&column.data_type.as_str()) {
            return None;
        }
        let max = self.config.max_prefix_length;
        Some(column.max_length.map_or(max, |length| length.min(max)))
    }

    /// Create the missing secondary indexes. With `dry_run` nothing is
    /// executed and the would-be indexes are listed in `planned`.
    pub async fn ensure_indexes(&self, dry_run: bool) -> Result<IndexingSummary> {
        let catalog = self.catalog.reload()?;
        let mut summary = IndexingSummary::default();

        for entry in self.targets(&catalog) {
            let key = &entry.key;
            if self.is_excluded(key) {
                debug!(table = %key, "Table excluded from automatic indexing");
                continue;
            }
            self.ensure_table(&entry, dry_run, &mut summary).await;
        }

        info!(
            tables = summary.tables_processed,
            created = summary.indexes_created,
            skipped = summary.indexes_skipped,
            errors = summary.errors.len(),
            dry_run,
            "Secondary index pass finished"
        );
        Ok(summary)
    }

    async fn ensure_table(&self, entry: &CatalogEntry, dry_run: bool, summary: &mut IndexingSummary) {
        let key = &entry.key;
        let introspected = async {
            let columns = self.store.columns(key).await?;
            let indexes = self.store.index_columns(key).await?;
            Ok::<_, Error>((columns, indexes))
        };
        let (columns, indexes) = match introspected.await {
            Ok(found) => found,
            Err(e) => {
                warn!(table = %key, error = %e, "Could not introspect table");
                summary.errors.push(IndexingError {
                    table: key.to_string(),
                    column: None,
                    index: None,
                    error: e.to_string(),
                });
                return;
            }
        };

        if columns.is_empty() {
            debug!(table = %key, "No columns found, nothing to index");
            return;
        }
        summary.tables_processed += 1;

        let leading: BTreeSet<&str> = indexes
            .iter()
            .filter(|column| column.position == 0)
            .map(|column| column.column.as_str())
            .collect();

        let wanted: Vec<&ColumnInfo> = if entry.searchable.is_empty() {
            columns.iter().collect()
        } else {
            columns
                .iter()
                .filter(|column| entry.searchable.iter().any(|s| s == &column.name))
                .collect()
        };

        for column in wanted {
            summary.columns_evaluated += 1;
            let name = index_name(key, &column.name);

            let skip = if UNSUPPORTED_TYPES.contains(&column.data_type.as_str()) {
                Some(SkipReason::UnsupportedType)
            } else if column.primary_key_position > 0 {
                Some(SkipReason::PrimaryKey)
            } else if leading.contains(column.name.as_str()) {
                Some(SkipReason::AlreadyIndexed)
            } else {
                match self.store.index_exists(key, &name).await {
                    Ok(true) => Some(SkipReason::NameTaken),
                    Ok(false) => None,
                    Err(e) => {
                        summary.errors.push(IndexingError {
                            table: key.to_string(),
                            column: Some(column.name.clone()),
                            index: Some(name),
                            error: e.to_string(),
                        });
                        continue;
                    }
                }
            };

            if let Some(reason) = skip {
                debug!(table = %key, column = %column.name, ?reason, "Column skipped");
                summary.indexes_skipped += 1;
                continue;
            }

            let planned = PlannedIndex {
                table: key.to_string(),
                column: column.name.clone(),
                index: name,
                prefix_length: self.prefix_length(column),
            };

            if !dry_run {
                if let Err(e) = self
                    .store
                    .create_index(key, &planned.index, &planned.column, planned.prefix_length)
                    .await
                {
                    warn!(table = %key, index = %planned.index, error = %e, "Index creation failed");
                    summary.errors.push(IndexingError {
                        table: key.to_string(),
                        column: Some(planned.column),
                        index: Some(planned.index),
                        error: e.to_string(),
                    });
                    continue;
                }
                info!(table = %key, index = %planned.index, "Created secondary index");
            }

            summary.indexes_created += 1;
            summary.planned.push(planned);
        }
    }
}
