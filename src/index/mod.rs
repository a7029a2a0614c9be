//! Search index client
//!
//! This module wraps every call to the external document index and provides:
//! - A shared health probe and connection breaker
//! - Bulk upsert / delete by id
//! - Cached free-text search
//! - Index reset and per-table document counts
//!
//! Connectivity failures never escape: they disable the client and the call
//! returns its empty form. Any other failure is returned to the caller.

mod breaker;
mod cache;
mod wire;

pub use breaker::*;
pub use cache::*;
pub use wire::*;

use crate::config::{IndexConfig, IndexMode};
use crate::document::{build_document, document_id, DocumentShape};
use crate::error::{Error, Result};
use crate::relational::Record;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use reqwest::{Response, StatusCode};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use url::Url;

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Options for [`IndexClient::index_documents`]
#[derive(Debug, Clone, Copy)]
pub struct IndexOptions<'a> {
    /// Target index; the client default when `None`
    pub index: Option<&'a str>,
    pub shape: DocumentShape<'a>,
    pub primary_key: &'a str,
    /// Make the documents searchable before returning
    pub refresh: bool,
}

/// A search request against the index
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexQuery {
    pub query: String,
    pub page: usize,
    pub limit: usize,
    /// Indexes to search; the client default when empty
    pub indexes: Vec<String>,
}

type ProbeFuture = Shared<BoxFuture<'static, bool>>;

/// Circuit-broken client for an Elasticsearch-compatible index
pub struct IndexClient {
    http: reqwest::Client,
    base: Url,
    default_index: String,
    health_timeout: Duration,
    breaker: Arc<Breaker>,
    probe: Mutex<Option<ProbeFuture>>,
    cache: TtlCache<IndexQuery, SearchResult>,
}

impl IndexClient {
    pub fn new(config: &IndexConfig) -> Result<Self> {
        let mut base = Url::parse(&config.url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        let breaker = Breaker::new(
            config.mode != IndexMode::Disabled,
            config.mode == IndexMode::Forced,
            config.auto_reconnect,
            config.retry_delay(),
        );

        debug!(url = %base, mode = %config.mode, "Created search index client");

        Ok(Self {
            http,
            base,
            default_index: config.default_index.clone(),
            health_timeout: config.health_timeout(),
            breaker: Arc::new(breaker),
            probe: Mutex::new(None),
            cache: TtlCache::new(config.cache_capacity, config.cache_ttl()),
        })
    }

    pub fn default_index(&self) -> &str {
        &self.default_index
    }

    /// False when the index was disabled by configuration
    pub fn is_configured(&self) -> bool {
        self.breaker.initially_enabled()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.breaker.snapshot(now())
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base.join(path)?)
    }

    /// True when the index is verified reachable. Runs at most one health
    /// probe at a time; concurrent callers await the same probe.
    pub async fn ensure_operational(&self) -> bool {
        match self.breaker.admit(now()) {
            Admission::Verified => true,
            Admission::Rejected => false,
            Admission::NeedsProbe => self.shared_probe().await,
        }
    }

    fn shared_probe(&self) -> ProbeFuture {
        let mut slot = self.probe.lock();
        if let Some(probe) = slot.as_ref() {
            if probe.peek().is_none() {
                return probe.clone();
            }
        }

        let http = self.http.clone();
        let url = self.base.clone();
        let timeout = self.health_timeout;
        let breaker = self.breaker.clone();

        let probe = async move {
            let ok = match http.get(url).timeout(timeout).send().await {
                Ok(response) if response.status().is_success() => true,
                Ok(response) => {
                    debug!(status = %response.status(), "Search index health check rejected");
                    false
                }
                Err(e) => {
                    debug!(error = %e, "Search index health check failed");
                    false
                }
            };
            breaker.record_probe(ok, now());
            if ok {
                info!("Search index connection verified");
            }
            ok
        }
        .boxed()
        .shared();

        *slot = Some(probe.clone());
        probe
    }

    /// Route an error: connectivity trips the breaker and yields `None`,
    /// anything else propagates.
    fn absorb<T>(&self, op: &str, result: Result<T>) -> Result<Option<T>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_connectivity() => {
                warn!(operation = op, error = %e, "Search index call failed");
                self.breaker.trip(&e.to_string(), now());
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Build documents for `records` and upsert them in one bulk call
    pub async fn index_documents(
        &self,
        records: &[Record],
        options: IndexOptions<'_>,
    ) -> Result<BulkOutcome> {
        let docs: Vec<_> = records
            .iter()
            .filter_map(|row| build_document(row, options.shape, options.primary_key))
            .collect();
        let skipped = records.len() - docs.len();

        if docs.is_empty() {
            return Ok(BulkOutcome {
                skipped,
                ..Default::default()
            });
        }

        if !self.ensure_operational().await {
            return Ok(BulkOutcome::unavailable(skipped));
        }

        let index = options.index.unwrap_or(&self.default_index);
        let result = self.send_bulk(index, &docs, options.refresh, skipped).await;
        let outcome = self
            .absorb("bulk", result)?
            .unwrap_or_else(|| BulkOutcome::unavailable(skipped));

        if !outcome.unavailable {
            self.cache.clear();
            debug!(
                index,
                indexed = outcome.indexed,
                errors = outcome.errors.len(),
                "Bulk upsert complete"
            );
        }
        Ok(outcome)
    }

    async fn send_bulk(
        &self,
        index: &str,
        docs: &[crate::document::IndexDocument],
        refresh: bool,
        skipped: usize,
    ) -> Result<BulkOutcome> {
        let mut url = self.endpoint("_bulk")?;
        if refresh {
            url.query_pairs_mut().append_pair("refresh", "true");
        }

        let response = self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(bulk_body(index, docs)?)
            .send()
            .await?;
        let response: BulkResponse = check_status(response).await?.json().await?;
        Ok(response.into_outcome(docs.len(), skipped))
    }

    /// Delete the document for one row; a missing document counts as success
    pub async fn delete_document(
        &self,
        index: Option<&str>,
        table_name: &str,
        primary_value: &str,
    ) -> Result<DeleteOutcome> {
        if !self.ensure_operational().await {
            return Ok(DeleteOutcome::Unavailable);
        }

        let index = index.unwrap_or(&self.default_index);
        let result = self.send_delete(index, table_name, primary_value).await;
        let outcome = self
            .absorb("delete", result)?
            .unwrap_or(DeleteOutcome::Unavailable);
        if outcome != DeleteOutcome::Unavailable {
            self.cache.clear();
        }
        Ok(outcome)
    }

    async fn send_delete(
        &self,
        index: &str,
        table_name: &str,
        primary_value: &str,
    ) -> Result<DeleteOutcome> {
        let id = document_id(table_name, primary_value);
        let url = self.endpoint(&format!("{}/_doc/{}", index, id))?;
        let response = self.http.delete(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(DeleteOutcome::NotFound);
        }
        check_status(response).await?;
        Ok(DeleteOutcome::Deleted)
    }

    /// Free-text search. Returns an empty result without any network call
    /// while the client is disabled.
    pub async fn search(&self, query: &IndexQuery) -> Result<SearchResult> {
        if self.breaker.admit(now()) == Admission::Rejected {
            return Ok(SearchResult::empty());
        }

        let mut key = query.clone();
        key.page = key.page.max(1);
        key.limit = key.limit.max(1);
        if key.indexes.is_empty() {
            key.indexes.push(self.default_index.clone());
        }

        if let Some(cached) = self.cache.get(&key, now()) {
            debug!(query = %key.query, "Search served from cache");
            return Ok(cached);
        }

        if !self.ensure_operational().await {
            return Ok(SearchResult::empty());
        }

        let result = self.send_search(&key).await;
        match self.absorb("search", result)? {
            Some(result) => {
                self.cache.insert(key, result.clone(), now());
                Ok(result)
            }
            None => Ok(SearchResult::empty()),
        }
    }

    async fn send_search(&self, query: &IndexQuery) -> Result<SearchResult> {
        let mut url = self.endpoint(&format!("{}/_search", query.indexes.join(",")))?;
        url.query_pairs_mut().append_pair("ignore_unavailable", "true");

        let from = query.page.saturating_sub(1).saturating_mul(query.limit);
        let response = self
            .http
            .post(url)
            .json(&search_body(&query.query, from, query.limit))
            .send()
            .await?;
        let response: SearchResponse = check_status(response).await?.json().await?;
        Ok(response.into_result())
    }

    /// Number of documents for one table, `None` when unreachable
    pub async fn count_documents(&self, index: Option<&str>, table_name: &str) -> Result<Option<u64>> {
        if !self.ensure_operational().await {
            return Ok(None);
        }

        let index = index.unwrap_or(&self.default_index);
        let result = self.send_count(index, table_name).await;
        self.absorb("count", result)
    }

    async fn send_count(&self, index: &str, table_name: &str) -> Result<u64> {
        let url = self.endpoint(&format!("{}/_count", index))?;
        let response = self.http.post(url).json(&count_body(table_name)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(0);
        }
        let response: CountResponse = check_status(response).await?.json().await?;
        Ok(response.count)
    }

    /// Delete an index (a missing one is fine) and optionally recreate it
    pub async fn reset_index(&self, index: Option<&str>, recreate: bool) -> Result<ResetOutcome> {
        let index = index.unwrap_or(&self.default_index).to_string();

        if !self.ensure_operational().await {
            return Ok(ResetOutcome {
                index,
                unavailable: true,
                ..Default::default()
            });
        }

        let result = self.send_reset(&index, recreate).await;

        self.cache.clear();
        match self.absorb("reset", result)? {
            Some((deleted, created)) => {
                info!(index = %index, deleted, created, "Search index reset");
                Ok(ResetOutcome {
                    index,
                    deleted,
                    created,
                    unavailable: false,
                })
            }
            None => Ok(ResetOutcome {
                index,
                unavailable: true,
                ..Default::default()
            }),
        }
    }

    async fn send_reset(&self, index: &str, recreate: bool) -> Result<(bool, bool)> {
        let url = self.endpoint(index)?;
        let response = self.http.delete(url.clone()).send().await?;
        let deleted = response.status() != StatusCode::NOT_FOUND;
        if deleted {
            check_status(response).await?;
        }

        if recreate {
            let response = self.http.put(url).json(&index_mappings()).send().await?;
            check_status(response).await?;
        }

        Ok((deleted, recreate))
    }
}

/// Map a non-success status to an error. Gateway failures and 503 mean the
/// cluster is unreachable; other statuses are request errors.
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = format!("{}: {}", status, body.chars().take(500).collect::<String>());
    match status {
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            Err(Error::IndexUnavailable(message))
        }
        _ => Err(Error::Index(message)),
    }
}
