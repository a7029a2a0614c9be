//! Full resync
//!
//! Walks catalog tables in primary key order and bulk-loads every row into
//! the search index. The first table that targets an index may purge and
//! recreate it; later tables sharing that index never purge it again.

use crate::catalog::{CatalogAccessor, CatalogEntry, PrimaryKeyResolver};
use crate::config::SyncConfig;
use crate::document::DocumentShape;
use crate::error::{Error, Result};
use crate::index::{IndexClient, IndexOptions};
use crate::relational::{value_to_key_string, RelationalStore};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Most per-document errors kept on a report
const MAX_REPORTED_ERRORS: usize = 50;

/// Resync status of one table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncStatus::Running => write!(f, "running"),
            SyncStatus::Completed => write!(f, "completed"),
            SyncStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Progress of one table resync
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncProgressReport {
    pub table: String,
    pub index: String,
    pub status: SyncStatus,
    pub fetched: u64,
    pub indexed: u64,
    /// Rows without a usable primary key value
    pub skipped: u64,
    pub batches: u64,
    /// Per-document bulk failures, capped
    pub errors: Vec<String>,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub error: Option<String>,
}

impl SyncProgressReport {
    fn start(table: String, index: String) -> Self {
        Self {
            table,
            index,
            status: SyncStatus::Running,
            fetched: 0,
            indexed: 0,
            skipped: 0,
            batches: 0,
            errors: Vec::new(),
            started_at: Utc::now().to_rfc3339(),
            completed_at: None,
            error: None,
        }
    }

    fn finish(&mut self, error: Option<String>) {
        self.status = if error.is_some() {
            SyncStatus::Failed
        } else {
            SyncStatus::Completed
        };
        self.error = error;
        self.completed_at = Some(Utc::now().to_rfc3339());
    }
}

/// Receives resync lifecycle events
pub trait SyncObserver: Send + Sync {
    fn on_start(&self, _report: &SyncProgressReport) {}
    fn on_batch(&self, _report: &SyncProgressReport) {}
    fn on_complete(&self, _report: &SyncProgressReport) {}
    fn on_error(&self, _report: &SyncProgressReport) {}
}

/// Observer that ignores every event
pub struct NoopObserver;

impl SyncObserver for NoopObserver {}

/// Full-resync service
pub struct ResyncService {
    catalog: Arc<CatalogAccessor>,
    store: Arc<dyn RelationalStore>,
    index: Arc<IndexClient>,
    resolver: Arc<PrimaryKeyResolver>,
    config: SyncConfig,
    observer: Arc<dyn SyncObserver>,
    /// Indexes already claimed (and possibly purged) by this instance
    purged: Mutex<HashSet<String>>,
}

impl ResyncService {
    pub fn new(
        catalog: Arc<CatalogAccessor>,
        store: Arc<dyn RelationalStore>,
        index: Arc<IndexClient>,
        resolver: Arc<PrimaryKeyResolver>,
        config: SyncConfig,
    ) -> Self {
        Self {
            catalog,
            store,
            index,
            resolver,
            config,
            observer: Arc::new(NoopObserver),
            purged: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn SyncObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Resync every sync-enabled table of a freshly reloaded catalog, one
    /// after the other. A failing table does not stop the run.
    pub async fn sync_all_tables(&self) -> Result<Vec<SyncProgressReport>> {
        let catalog = self.catalog.reload()?;
        self.resolver.clear();
        let mut reports = Vec::new();

        for entry in catalog.sync_enabled() {
            if let Some(report) = self.sync_table(entry).await {
                reports.push(report);
            }
        }

        let failed = reports
            .iter()
            .filter(|r| r.status == SyncStatus::Failed)
            .count();
        info!(tables = reports.len(), failed, "Full resync finished");
        Ok(reports)
    }

    /// Resync one table by catalog key
    pub async fn sync_table_by_name(&self, name: &str) -> Result<Option<SyncProgressReport>> {
        let catalog = self.catalog.snapshot();
        let entry = catalog
            .lookup(name)
            .ok_or_else(|| Error::TableNotFound(name.to_string()))?;
        Ok(self.sync_table(entry).await)
    }

    /// Resync one table. `None` when its sync policy is disabled.
    pub async fn sync_table(&self, entry: &CatalogEntry) -> Option<SyncProgressReport> {
        if !entry.sync.enabled {
            debug!(table = %entry.key, "Sync disabled, skipping");
            return None;
        }

        let index = entry.sync.index_name(self.index.default_index()).to_string();
        let mut report = SyncProgressReport::start(entry.key.to_string(), index.clone());
        info!(table = %entry.key, index = %index, "Starting table resync");
        self.observer.on_start(&report);

        match self.run_table(entry, &index, &mut report).await {
            Ok(()) => {
                report.finish(None);
                info!(
                    table = %entry.key,
                    fetched = report.fetched,
                    indexed = report.indexed,
                    "Table resync completed"
                );
                self.observer.on_complete(&report);
            }
            Err(e) => {
                report.finish(Some(e.to_string()));
                error!(table = %entry.key, error = %e, "Table resync failed");
                self.observer.on_error(&report);
            }
        }

        Some(report)
    }

    async fn run_table(
        &self,
        entry: &CatalogEntry,
        index: &str,
        report: &mut SyncProgressReport,
    ) -> Result<()> {
        if !self.index.is_configured() {
            return Err(Error::IndexUnavailable(
                "search index disabled by configuration".to_string(),
            ));
        }

        let primary_key = self.resolver.resolve(entry).await?;
        self.claim_index(entry, index).await;

        let batch_size = self.config.resolve_batch_size(entry.sync.batch_size);
        let options = IndexOptions {
            index: Some(index),
            shape: DocumentShape::for_entry(entry),
            primary_key: &primary_key,
            refresh: false,
        };

        let mut cursor: Option<Value> = None;
        loop {
            // One extra row tells whether another page exists.
            let mut rows = self
                .store
                .fetch_page(&entry.key, &primary_key, cursor.as_ref(), batch_size + 1)
                .await?;
            let has_more = rows.len() > batch_size;
            rows.truncate(batch_size);

            if rows.is_empty() {
                break;
            }

            let last = rows
                .last()
                .and_then(|row| row.get(&primary_key))
                .filter(|value| value_to_key_string(value).is_some())
                .cloned();

            report.fetched += rows.len() as u64;
            report.batches += 1;

            let outcome = self.index.index_documents(&rows, options).await?;
            if outcome.unavailable {
                return Err(Error::IndexUnavailable(format!(
                    "search index unavailable after {} rows",
                    report.indexed
                )));
            }

            report.indexed += outcome.indexed as u64;
            report.skipped += outcome.skipped as u64;
            for item in outcome.errors {
                if report.errors.len() < MAX_REPORTED_ERRORS {
                    report.errors.push(format!("{}: {}", item.id, item.reason));
                }
            }
            self.observer.on_batch(report);

            if !has_more {
                break;
            }
            match last {
                Some(value) => cursor = Some(value),
                None => {
                    return Err(Error::Other(format!(
                        "{} has rows without a '{}' value, cannot page past them",
                        entry.key, primary_key
                    )))
                }
            }
        }

        Ok(())
    }

    /// Purge the target index once per instance. The claim is held across
    /// the reset so concurrent tables sharing an index wait for it.
    async fn claim_index(&self, entry: &CatalogEntry, index: &str) {
        let mut purged = self.purged.lock().await;
        if purged.contains(index) {
            return;
        }

        if entry.sync.purge_before_index {
            match self.index.reset_index(Some(index), true).await {
                Ok(outcome) if outcome.unavailable => {
                    warn!(index, "Search index unavailable, purge skipped");
                }
                Ok(_) => info!(index, "Purged search index before resync"),
                Err(e) => error!(index, error = %e, "Failed to purge search index"),
            }
        }
        purged.insert(index.to_string());
    }
}
