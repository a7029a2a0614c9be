//! Unified query router
//!
//! One search entry point over two engines: the search index and the
//! relational store. Filtered or link-following requests only go to the
//! relational engine. Anything else races the preferred engine against the
//! other one: the secondary starts after a short delay unless the primary
//! already answered, and the first answer with hits wins.

mod filters;

pub use filters::*;

use crate::catalog::CatalogAccessor;
use crate::config::RouterConfig;
use crate::error::Result;
use crate::index::{IndexClient, IndexQuery, SearchHit};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Search engine behind the router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Index,
    Relational,
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineKind::Index => write!(f, "index"),
            EngineKind::Relational => write!(f, "relational"),
        }
    }
}

/// Role of an engine in one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineRole {
    Primary,
    Secondary,
    Solo,
}

/// A user search
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub filters: Map<String, Value>,
    /// 1-based; 0 means the first page
    #[serde(default)]
    pub page: usize,
    /// 0 means the configured default
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub follow_links: bool,
    #[serde(default)]
    pub depth: u32,
    /// Overrides the configured engine preference
    #[serde(default)]
    pub prefer_index_engine: Option<bool>,
    #[serde(default)]
    pub diagnostics: bool,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    /// Pagination offset of the first hit
    pub fn offset(&self) -> usize {
        self.page.saturating_sub(1).saturating_mul(self.limit)
    }

    pub fn requires_relational(&self) -> bool {
        self.follow_links || has_active_filters(&self.filters)
    }
}

/// One engine's answer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineResult {
    pub total: u64,
    pub hits: Vec<SearchHit>,
    pub elapsed_ms: u64,
    pub tables_searched: Vec<String>,
}

impl EngineResult {
    pub fn has_hits(&self) -> bool {
        !self.hits.is_empty()
    }
}

#[async_trait]
pub trait SearchBackend: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// `Ok(None)` when the engine cannot serve the request right now
    async fn search(&self, request: &SearchRequest) -> Result<Option<EngineResult>>;
}

/// Search index engine. An unreachable index yields `None`.
pub struct IndexBackend {
    client: Arc<IndexClient>,
    catalog: Arc<CatalogAccessor>,
}

impl IndexBackend {
    pub fn new(client: Arc<IndexClient>, catalog: Arc<CatalogAccessor>) -> Self {
        Self { client, catalog }
    }

    fn indexes(&self) -> Vec<String> {
        let catalog = self.catalog.snapshot();
        let default = self.client.default_index();
        let names: BTreeSet<String> = catalog
            .sync_enabled()
            .map(|entry| entry.sync.index_name(default).to_string())
            .collect();
        names.into_iter().collect()
    }
}

#[async_trait]
impl SearchBackend for IndexBackend {
    fn kind(&self) -> EngineKind {
        EngineKind::Index
    }

    async fn search(&self, request: &SearchRequest) -> Result<Option<EngineResult>> {
        if !self.client.ensure_operational().await {
            return Ok(None);
        }
        let result = self
            .client
            .search(&IndexQuery {
                query: request.query.clone(),
                page: request.page,
                limit: request.limit,
                indexes: self.indexes(),
            })
            .await?;
        Ok(Some(EngineResult {
            total: result.total,
            hits: result.hits,
            elapsed_ms: result.elapsed_ms,
            tables_searched: result.tables_searched,
        }))
    }
}

/// Timing of one engine attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineAttempt {
    pub engine: EngineKind,
    pub role: EngineRole,
    /// Start time relative to the request
    pub started_after_ms: u64,
    pub duration_ms: u64,
    pub hits: usize,
    pub ok: bool,
    pub error: Option<String>,
}

/// Normalized router answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub total: u64,
    pub page: usize,
    pub limit: usize,
    pub pages: u64,
    pub elapsed_ms: u64,
    pub hits: Vec<SearchHit>,
    pub tables_searched: Vec<String>,
    pub engine: EngineKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<Vec<EngineAttempt>>,
}

struct Attempt {
    info: EngineAttempt,
    result: Option<EngineResult>,
}

async fn run_attempt(
    backend: Arc<dyn SearchBackend>,
    request: Arc<SearchRequest>,
    role: EngineRole,
    origin: Instant,
) -> Attempt {
    let started = Instant::now();
    let outcome = backend.search(&request).await;
    let duration = started.elapsed();

    let (result, error) = match outcome {
        Ok(result) => (result, None),
        Err(e) => {
            warn!(engine = %backend.kind(), error = %e, "Search engine failed");
            (None, Some(e.to_string()))
        }
    };

    Attempt {
        info: EngineAttempt {
            engine: backend.kind(),
            role,
            started_after_ms: started.duration_since(origin).as_millis() as u64,
            duration_ms: duration.as_millis() as u64,
            hits: result.as_ref().map_or(0, |r| r.hits.len()),
            ok: error.is_none(),
            error,
        },
        result,
    }
}

fn merge_tables(first: &[String], second: &[String]) -> Vec<String> {
    let mut tables = first.to_vec();
    for table in second {
        if !tables.contains(table) {
            tables.push(table.clone());
        }
    }
    tables
}

pub struct QueryRouter {
    index: Arc<dyn SearchBackend>,
    relational: Arc<dyn SearchBackend>,
    config: RouterConfig,
}

impl QueryRouter {
    pub fn new(
        index: Arc<dyn SearchBackend>,
        relational: Arc<dyn SearchBackend>,
        config: RouterConfig,
    ) -> Self {
        Self {
            index,
            relational,
            config,
        }
    }

    fn normalize(&self, mut request: SearchRequest) -> SearchRequest {
        request.query = request.query.trim().to_string();
        request.page = request.page.max(1);
        if request.limit == 0 {
            request.limit = self.config.default_limit;
        }
        request.limit = request.limit.clamp(1, self.config.max_limit.max(1));
        request
    }

    pub async fn search(&self, request: SearchRequest) -> QueryResponse {
        let origin = Instant::now();
        let request = Arc::new(self.normalize(request));

        let (winner, attempts) = if request.requires_relational() {
            debug!(query = %request.query, "Structured-only search");
            let attempt =
                run_attempt(self.relational.clone(), request.clone(), EngineRole::Solo, origin).await;
            let engine = attempt.info.engine;
            (attempt.result.map(|r| (engine, r)), vec![attempt.info])
        } else {
            self.race(request.clone(), origin).await
        };

        let (engine, result) = match winner {
            Some((engine, result)) => (engine, result),
            None => (EngineKind::Relational, EngineResult::default()),
        };

        let limit = request.limit as u64;
        QueryResponse {
            total: result.total,
            page: request.page,
            limit: request.limit,
            pages: result.total.div_ceil(limit),
            elapsed_ms: origin.elapsed().as_millis() as u64,
            hits: result.hits,
            tables_searched: result.tables_searched,
            engine,
            diagnostics: request.diagnostics.then_some(attempts),
        }
    }

    async fn race(
        &self,
        request: Arc<SearchRequest>,
        origin: Instant,
    ) -> (Option<(EngineKind, EngineResult)>, Vec<EngineAttempt>) {
        let prefer_index = request
            .prefer_index_engine
            .unwrap_or(self.config.prefer_index_engine);
        let (primary, secondary) = if prefer_index {
            (self.index.clone(), self.relational.clone())
        } else {
            (self.relational.clone(), self.index.clone())
        };

        let spawn_secondary = || -> JoinHandle<Attempt> {
            tokio::spawn(run_attempt(
                secondary.clone(),
                request.clone(),
                EngineRole::Secondary,
                origin,
            ))
        };

        let primary_run = run_attempt(primary.clone(), request.clone(), EngineRole::Primary, origin);
        tokio::pin!(primary_run);
        let delay = tokio::time::sleep(self.config.race_delay());
        tokio::pin!(delay);

        let mut pending_secondary: Option<JoinHandle<Attempt>> = None;
        let primary_attempt = loop {
            tokio::select! {
                biased;
                attempt = &mut primary_run => break attempt,
                _ = &mut delay, if pending_secondary.is_none() => {
                    debug!(engine = %secondary.kind(), "Race delay elapsed, starting secondary engine");
                    pending_secondary = Some(spawn_secondary());
                }
            }
        };

        let primary_kind = primary_attempt.info.engine;
        let mut attempts = vec![primary_attempt.info];

        if let Some(result) = primary_attempt.result.as_ref().filter(|r| r.has_hits()) {
            // The secondary, if started, runs to completion detached.
            return (Some((primary_kind, result.clone())), attempts);
        }

        let handle = pending_secondary.unwrap_or_else(spawn_secondary);
        let secondary_attempt = match handle.await {
            Ok(attempt) => attempt,
            Err(e) => Attempt {
                info: EngineAttempt {
                    engine: secondary.kind(),
                    role: EngineRole::Secondary,
                    started_after_ms: 0,
                    duration_ms: 0,
                    hits: 0,
                    ok: false,
                    error: Some(e.to_string()),
                },
                result: None,
            },
        };
        let secondary_kind = secondary_attempt.info.engine;
        attempts.push(secondary_attempt.info);

        let winner = match (primary_attempt.result, secondary_attempt.result) {
            (primary, Some(mut second)) if second.has_hits() => {
                if let Some(first) = primary {
                    second.tables_searched = merge_tables(&first.tables_searched, &second.tables_searched);
                }
                Some((secondary_kind, second))
            }
            (Some(mut first), Some(second)) => {
                first.tables_searched = merge_tables(&first.tables_searched, &second.tables_searched);
                Some((primary_kind, first))
            }
            (Some(first), None) => Some((primary_kind, first)),
            (None, Some(second)) => Some((secondary_kind, second)),
            (None, None) => None,
        };
        (winner, attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn hit(table: &str, id: usize) -> SearchHit {
        SearchHit {
            id: id.to_string(),
            score: None,
            table: table.to_string(),
            table_name: format!("main.{}", table),
            database_name: "main".to_string(),
            display_name: table.to_string(),
            primary_key: "id".to_string(),
            primary_value: id.to_string(),
            preview: BTreeMap::new(),
        }
    }

    fn result(table: &str, hits: usize) -> EngineResult {
        EngineResult {
            total: hits as u64,
            hits: (1..=hits).map(|i| hit(table, i)).collect(),
            elapsed_ms: 1,
            tables_searched: vec![format!("main.{}", table)],
        }
    }

    enum Reply {
        Result(EngineResult),
        Unavailable,
        Fail,
    }

    struct FakeEngine {
        kind: EngineKind,
        delay: Duration,
        reply: Reply,
        calls: AtomicUsize,
    }

    impl FakeEngine {
        fn new(kind: EngineKind, delay_ms: u64, reply: Reply) -> Arc<Self> {
            Arc::new(Self {
                kind,
                delay: Duration::from_millis(delay_ms),
                reply,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SearchBackend for FakeEngine {
        fn kind(&self) -> EngineKind {
            self.kind
        }

        async fn search(&self, _request: &SearchRequest) -> Result<Option<EngineResult>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            match &self.reply {
                Reply::Result(result) => Ok(Some(result.clone())),
                Reply::Unavailable => Ok(None),
                Reply::Fail => Err(Error::Index("bad query".to_string())),
            }
        }
    }

    fn router(index: Arc<FakeEngine>, relational: Arc<FakeEngine>) -> QueryRouter {
        QueryRouter::new(index, relational, RouterConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_hits_before_delay_never_start_secondary() {
        let index = FakeEngine::new(EngineKind::Index, 20, Reply::Result(result("people", 2)));
        let relational = FakeEngine::new(EngineKind::Relational, 5, Reply::Result(result("cars", 1)));
        let router = router(index.clone(), relational.clone());

        let response = router.search(SearchRequest::new("Dupont")).await;
        assert_eq!(response.engine, EngineKind::Index);
        assert_eq!(response.hits.len(), 2);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(index.calls(), 1);
        assert_eq!(relational.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_primary_races_secondary() {
        let index = FakeEngine::new(EngineKind::Index, 300, Reply::Result(result("people", 0)));
        let relational = FakeEngine::new(EngineKind::Relational, 40, Reply::Result(result("cars", 3)));
        let router = router(index.clone(), relational.clone());

        let mut request = SearchRequest::new("Dupont");
        request.diagnostics = true;
        let response = router.search(request).await;

        assert_eq!(response.engine, EngineKind::Relational);
        assert_eq!(response.hits.len(), 3);
        assert_eq!(response.tables_searched, vec!["main.people", "main.cars"]);
        let diagnostics = response.diagnostics.unwrap();
        assert_eq!(diagnostics[0].role, EngineRole::Primary);
        assert_eq!(diagnostics[1].role, EngineRole::Secondary);
        assert_eq!(diagnostics[1].started_after_ms, 75);
        assert_eq!(diagnostics[1].duration_ms, 40);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_index_falls_back_to_relational_hits() {
        let index = FakeEngine::new(EngineKind::Index, 10, Reply::Result(result("people", 0)));
        let relational = FakeEngine::new(EngineKind::Relational, 40, Reply::Result(result("people", 3)));
        let router = router(index.clone(), relational.clone());

        let response = router.search(SearchRequest::new("Dupont")).await;
        assert_eq!(response.engine, EngineKind::Relational);
        assert_eq!(response.hits.len(), 3);
        assert_eq!(response.total, 3);
        assert_eq!(response.elapsed_ms, 50);
        assert_eq!(relational.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_filters_bypass_index_engine() {
        let index = FakeEngine::new(EngineKind::Index, 1, Reply::Result(result("people", 5)));
        let relational = FakeEngine::new(EngineKind::Relational, 1, Reply::Result(result("people", 1)));
        let router = router(index.clone(), relational.clone());

        let mut request = SearchRequest::new("Dupont");
        request.prefer_index_engine = Some(true);
        request.filters.insert("city".to_string(), Value::String("Lyon".to_string()));
        let response = router.search(request).await;

        assert_eq!(response.engine, EngineKind::Relational);
        assert_eq!(index.calls(), 0);

        let mut request = SearchRequest::new("Dupont");
        request.follow_links = true;
        router.search(request).await;
        assert_eq!(index.calls(), 0);
        assert_eq!(relational.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_or_failing_index_counts_as_no_hits() {
        for reply in [Reply::Unavailable, Reply::Fail] {
            let index = FakeEngine::new(EngineKind::Index, 1, reply);
            let relational = FakeEngine::new(EngineKind::Relational, 1, Reply::Result(result("people", 2)));
            let router = router(index, relational);

            let mut request = SearchRequest::new("Dupont");
            request.diagnostics = true;
            let response = router.search(request).await;
            assert_eq!(response.engine, EngineKind::Relational);
            assert_eq!(response.hits.len(), 2);
            assert_eq!(response.diagnostics.unwrap()[0].hits, 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_hits_anywhere_prefers_primary() {
        let index = FakeEngine::new(EngineKind::Index, 1, Reply::Result(result("people", 0)));
        let relational = FakeEngine::new(EngineKind::Relational, 1, Reply::Result(result("cars", 0)));
        let response = router(index, relational)
            .search(SearchRequest::new("nobody"))
            .await;
        assert_eq!(response.engine, EngineKind::Index);
        assert_eq!(response.total, 0);
        assert_eq!(response.pages, 0);
        assert_eq!(response.tables_searched, vec!["main.people", "main.cars"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relational_preference_and_paging() {
        let index = FakeEngine::new(EngineKind::Index, 1, Reply::Result(result("people", 1)));
        let mut many = result("people", 20);
        many.total = 45;
        let relational = FakeEngine::new(EngineKind::Relational, 1, Reply::Result(many));
        let router = router(index.clone(), relational);

        let mut request = SearchRequest::new("  Dupont ");
        request.prefer_index_engine = Some(false);
        request.page = 0;
        request.limit = 1000;
        let response = router.search(request).await;
        assert_eq!(response.engine, EngineKind::Relational);
        assert_eq!(response.page, 1);
        assert_eq!(response.limit, 100);
        assert_eq!(response.pages, 1);
        assert_eq!(index.calls(), 0);
    }

    #[test]
    fn test_offset_saturates_on_huge_pages() {
        let mut request = SearchRequest::new("x");
        request.page = 3;
        request.limit = 20;
        assert_eq!(request.offset(), 40);

        request.page = usize::MAX / 2;
        assert_eq!(request.offset(), usize::MAX);

        request.page = 0;
        assert_eq!(request.offset(), 0);
    }
}
