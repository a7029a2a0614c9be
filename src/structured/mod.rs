//! Relational search engine
//!
//! Runs a request directly against the catalog tables: a substring match on
//! searchable columns plus exact matches on declared filter columns. Results
//! are paged across tables in catalog order.

use crate::catalog::{CatalogAccessor, CatalogEntry, PrimaryKeyResolver};
use crate::document::{build_document, DocumentShape};
use crate::error::Result;
use crate::index::SearchHit;
use crate::relational::{RelationalStore, TableQuery};
use crate::router::{is_filter_value_active, EngineKind, EngineResult, SearchBackend, SearchRequest};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

pub struct RelationalEngine {
    catalog: Arc<CatalogAccessor>,
    store: Arc<dyn RelationalStore>,
    resolver: Arc<PrimaryKeyResolver>,
}

/// Exact-match filters for one table, or `None` when the table does not
/// declare every active filter
fn table_filters(entry: &CatalogEntry, request: &SearchRequest) -> Option<Vec<(String, Value)>> {
    let mut filters = Vec::new();
    for (name, value) in &request.filters {
        if !is_filter_value_active(value) {
            continue;
        }
        if !entry.filters.contains_key(name) {
            return None;
        }
        let value = match value {
            Value::Array(items) => {
                let scalars: Vec<Value> = items
                    .iter()
                    .filter(|item| !item.is_array() && !item.is_object())
                    .filter(|item| is_filter_value_active(item))
                    .map(trim_scalar)
                    .collect();
                if scalars.is_empty() {
                    debug!(filter = %name, "Ignoring filter without scalar values");
                    continue;
                }
                Value::Array(scalars)
            }
            Value::Object(_) => {
                debug!(filter = %name, "Ignoring object filter value");
                continue;
            }
            other => trim_scalar(other),
        };
        filters.push((name.clone(), value));
    }
    Some(filters)
}

fn trim_scalar(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.trim().to_string()),
        other => other.clone(),
    }
}

impl RelationalEngine {
    pub fn new(
        catalog: Arc<CatalogAccessor>,
        store: Arc<dyn RelationalStore>,
        resolver: Arc<PrimaryKeyResolver>,
    ) -> Self {
        Self {
            catalog,
            store,
            resolver,
        }
    }

    /// Search every catalog table. Tables that fail are logged and skipped.
    pub async fn run(&self, request: &SearchRequest) -> Result<EngineResult> {
        let started = Instant::now();
        let catalog = self.catalog.snapshot();
        let text = request.query.trim();
        let limit = request.limit.max(1);

        if request.follow_links {
            debug!("Link following is not supported by the relational engine, searching direct matches");
        }

        let mut result = EngineResult::default();
        let mut skip = request.offset() as u64;
        let mut remaining = limit;

        for entry in catalog.entries() {
            let Some(filters) = table_filters(entry, request) else {
                continue;
            };
            if entry.searchable.is_empty() || (text.is_empty() && filters.is_empty()) {
                continue;
            }

            let primary_key = match self.resolver.resolve(entry).await {
                Ok(pk) => pk,
                Err(e) => {
                    warn!(table = %entry.key, error = %e, "Skipping table without primary key");
                    continue;
                }
            };

            let query = TableQuery {
                text: (!text.is_empty()).then(|| text.to_string()),
                match_columns: entry.searchable.clone(),
                filters,
                order_by: Some(primary_key.clone()),
                limit: remaining,
                offset: skip as usize,
            };

            let page = match self.store.search_table(&entry.key, &query).await {
                Ok(page) => page,
                Err(e) => {
                    warn!(table = %entry.key, error = %e, "Relational search failed for table");
                    continue;
                }
            };

            result.tables_searched.push(entry.key.qualified());
            result.total += page.total;
            skip = skip.saturating_sub(page.total);

            let shape = DocumentShape::for_entry(entry);
            for row in &page.rows {
                if let Some(doc) = build_document(row, shape, &primary_key) {
                    result
                        .hits
                        .push(SearchHit::from_document(doc.id().to_string(), None, doc));
                }
            }
            remaining = remaining.saturating_sub(page.rows.len());
        }

        result.elapsed_ms = started.elapsed().as_millis() as u64;
        debug!(
            total = result.total,
            tables = result.tables_searched.len(),
            "Relational search finished"
        );
        Ok(result)
    }
}

#[async_trait]
impl SearchBackend for RelationalEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Relational
    }

    async fn search(&self, request: &SearchRequest) -> Result<Option<EngineResult>> {
        self.run(request).await.map(Some)
    }
}
