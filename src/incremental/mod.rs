//! Incremental sync
//!
//! Drains the change queue in id order and applies each event to the search
//! index. Events are resolved against the *current* row, never a stored
//! payload, so replaying an old event always writes the latest state. A
//! failing event is recorded and left pending; the rest of the batch goes on.

use crate::catalog::{CatalogAccessor, PrimaryKeyResolver};
use crate::document::DocumentShape;
use crate::error::{Error, Result};
use crate::index::{DeleteOutcome, IndexClient, IndexOptions};
use crate::queue::{ChangeEvent, ChangeQueue, Operation};
use crate::relational::{key_string_to_value, RelationalStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// What applying one event did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    Upserted,
    Deleted,
    /// Nothing to replicate (table not covered, sync off, index disabled)
    Ignored,
}

/// Result of one `process_batch` call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub fetched: usize,
    pub processed: usize,
    pub failed: usize,
    /// The index was unreachable, so no event was touched
    pub index_unavailable: bool,
}

/// Change queue consumer
pub struct IncrementalSync {
    catalog: Arc<CatalogAccessor>,
    store: Arc<dyn RelationalStore>,
    queue: Arc<dyn ChangeQueue>,
    index: Arc<IndexClient>,
    resolver: Arc<PrimaryKeyResolver>,
    batch_size: usize,
    poll_interval: Duration,
}

impl IncrementalSync {
    pub fn new(
        catalog: Arc<CatalogAccessor>,
        store: Arc<dyn RelationalStore>,
        queue: Arc<dyn ChangeQueue>,
        index: Arc<IndexClient>,
        resolver: Arc<PrimaryKeyResolver>,
    ) -> Self {
        Self {
            catalog,
            store,
            queue,
            index,
            resolver,
            batch_size: 200,
            poll_interval: Duration::from_secs(15),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Pending events in ascending id order
    pub async fn fetch_pending_events(&self, limit: Option<usize>) -> Result<Vec<ChangeEvent>> {
        self.queue
            .fetch_pending(limit.unwrap_or(self.batch_size))
            .await
    }

    /// Apply one event to the index
    pub async fn process_event(&self, event: &ChangeEvent) -> Result<EventOutcome> {
        let catalog = self.catalog.snapshot();
        let key = event.table_key();
        let entry = match catalog.get(&key) {
            Some(entry) if entry.sync.enabled => entry,
            _ => {
                debug!(table = %key, event = event.id, "Table not replicated, ignoring event");
                return Ok(EventOutcome::Ignored);
            }
        };

        if !self.index.is_configured() || event.primary_value.is_empty() {
            return Ok(EventOutcome::Ignored);
        }

        let index = entry.sync.index_name(self.index.default_index());
        let table_name = key.qualified();

        let row = match event.get_operation()? {
            Operation::Delete => None,
            Operation::Insert | Operation::Update => {
                let primary_key = self.resolver.resolve(entry).await?;
                let value = key_string_to_value(&event.primary_value);
                self.store
                    .fetch_row(&key, &primary_key, &value)
                    .await?
                    .map(|row| (primary_key, row))
            }
        };

        match row {
            Some((primary_key, row)) => {
                let outcome = self
                    .index
                    .index_documents(
                        std::slice::from_ref(&row),
                        IndexOptions {
                            index: Some(index),
                            shape: DocumentShape::for_entry(entry),
                            primary_key: &primary_key,
                            refresh: false,
                        },
                    )
                    .await?;

                if outcome.unavailable {
                    return Err(Error::IndexUnavailable("search index unavailable".to_string()));
                }
                if let Some(item) = outcome.errors.first() {
                    return Err(Error::Index(item.reason.clone()));
                }
                Ok(EventOutcome::Upserted)
            }
            None => {
                let outcome = self
                    .index
                    .delete_document(Some(index), &table_name, &event.primary_value)
                    .await?;
                if outcome == DeleteOutcome::Unavailable {
                    return Err(Error::IndexUnavailable("search index unavailable".to_string()));
                }
                Ok(EventOutcome::Deleted)
            }
        }
    }

    /// Drain up to `limit` pending events (the configured batch size when
    /// `None`). Per-event failures are recorded on the event and do not stop
    /// the batch.
    pub async fn process_batch(&self, limit: Option<usize>) -> Result<BatchSummary> {
        if self.index.is_configured() && !self.index.ensure_operational().await {
            debug!("Search index unavailable, leaving change events pending");
            return Ok(BatchSummary {
                index_unavailable: true,
                ..Default::default()
            });
        }

        let events = self.fetch_pending_events(limit).await?;
        let mut summary = BatchSummary {
            fetched: events.len(),
            ..Default::default()
        };

        for event in &events {
            let applied = match self.process_event(event).await {
                Ok(outcome) => self.queue.mark_processed(event.id).await.map(|()| outcome),
                Err(e) => Err(e),
            };

            match applied {
                Ok(outcome) => {
                    summary.processed += 1;
                    debug!(event = event.id, ?outcome, "Change event applied");
                }
                Err(e) => {
                    warn!(
                        event = event.id,
                        table = %event.table_key(),
                        attempts = event.attempts + 1,
                        error = %e,
                        "Change event failed"
                    );
                    summary.failed += 1;
                    if let Err(record) = self.queue.record_error(event.id, &e.to_string()).await {
                        error!(event = event.id, error = %record, "Failed to record change event error");
                    }
                }
            }
        }

        if summary.fetched > 0 {
            info!(
                processed = summary.processed,
                failed = summary.failed,
                "Processed change batch"
            );
        }
        Ok(summary)
    }

    /// Poll the queue every `poll_interval` until the worker is stopped.
    /// The first poll happens one interval after start.
    pub fn start(self: &Arc<Self>) -> SyncWorker {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let this = Arc::clone(self);
        let period = this.poll_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = period.as_millis() as u64, "Incremental sync started");

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = this.process_batch(None).await {
                            error!(error = %e, "Incremental sync batch failed");
                        }
                    }
                }
            }

            info!("Incremental sync stopped");
        });

        SyncWorker {
            shutdown: shutdown_tx,
            handle,
        }
    }
}

/// Handle to a running poll loop
pub struct SyncWorker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SyncWorker {
    /// Signal the loop and wait for the in-flight batch to finish
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            error!(error = %e, "Incremental sync worker panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, CatalogEntry, TableKey};
    use crate::config::{IndexConfig, IndexMode};
    use crate::document::document_id;
    use crate::queue::{install_triggers, SqliteQueue};
    use crate::relational::sqlite::test_support::{seed_people, setup_store};
    use crate::relational::SqliteStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn people_entry() -> CatalogEntry {
        let mut entry = CatalogEntry::new(TableKey::new("main", "people"));
        entry.searchable = vec!["first_name".into(), "last_name".into()];
        entry.sync.index = Some("people_search".to_string());
        entry
    }

    fn index_config(url: &str, mode: IndexMode) -> IndexConfig {
        IndexConfig {
            url: url.to_string(),
            mode,
            retry_delay_ms: 60_000,
            ..IndexConfig::default()
        }
    }

    async fn index_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/_bulk"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"errors": false, "items": []})))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path_regex(r"^/people_search/_doc/.+$"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        server
    }

    struct Setup {
        sync: Arc<IncrementalSync>,
        store: SqliteStore,
        queue: Arc<SqliteQueue>,
        _tmp: tempfile::TempDir,
    }

    async fn setup(server_url: &str, mode: IndexMode, entries: Vec<CatalogEntry>) -> Setup {
        let (store, tmp) = setup_store().await;
        seed_people(&store, 0).await;
        let queue = Arc::new(SqliteQueue::new(store.pool().clone(), "main"));
        queue.init_schema().await.unwrap();

        let catalog = Catalog::new(entries);
        let shared: Arc<dyn RelationalStore> = Arc::new(store.clone());
        let resolver = Arc::new(PrimaryKeyResolver::new(shared.clone()));
        install_triggers(store.pool(), "main", &catalog, &resolver).await;

        let index = Arc::new(IndexClient::new(&index_config(server_url, mode)).unwrap());
        let sync = IncrementalSync::new(
            Arc::new(CatalogAccessor::from_catalog(catalog)),
            shared,
            queue.clone(),
            index,
            resolver,
        );
        Setup {
            sync: Arc::new(sync),
            store,
            queue,
            _tmp: tmp,
        }
    }

    fn bulk_bodies(requests: &[wiremock::Request]) -> Vec<String> {
        requests
            .iter()
            .filter(|r| r.url.path() == "/_bulk")
            .map(|r| String::from_utf8_lossy(&r.body).into_owned())
            .collect()
    }

    #[tokio::test]
    async fn test_replay_reflects_current_row() {
        let server = index_server().await;
        let s = setup(&server.uri(), IndexMode::Enabled, vec![people_entry()]).await;

        s.store
            .execute_script(
                "INSERT INTO people (id, first_name, last_name) VALUES (1, 'Anne', 'Dupont');
                 UPDATE people SET last_name = 'Durand' WHERE id = 1;",
            )
            .await
            .unwrap();

        let summary = s.sync.process_batch(None).await.unwrap();
        assert_eq!(summary.fetched, 2);
        assert_eq!(summary.processed, 2);
        assert_eq!(s.queue.pending_count().await.unwrap(), 0);

        let bodies = bulk_bodies(&server.received_requests().await.unwrap());
        assert_eq!(bodies.len(), 2);
        for body in &bodies {
            assert!(body.contains("Durand"));
            assert!(!body.contains("Dupont"));
        }
    }

    #[tokio::test]
    async fn test_deleted_row_becomes_delete() {
        let server = index_server().await;
        let s = setup(&server.uri(), IndexMode::Enabled, vec![people_entry()]).await;

        s.store
            .execute_script(
                "INSERT INTO people (id, last_name) VALUES (4, 'Martin');
                 DELETE FROM people WHERE id = 4;",
            )
            .await
            .unwrap();

        let events = s.sync.fetch_pending_events(None).await.unwrap();
        assert_eq!(s.sync.process_event(&events[0]).await.unwrap(), EventOutcome::Deleted);
        assert_eq!(s.sync.process_event(&events[1]).await.unwrap(), EventOutcome::Deleted);

        let expected = format!("/people_search/_doc/{}", document_id("main.people", "4"));
        let deletes = server
            .received_requests()
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.method.as_str() == "DELETE")
            .collect::<Vec<_>>();
        assert_eq!(deletes.len(), 2);
        assert!(deletes.iter().all(|r| r.url.path() == expected));
    }

    #[tokio::test]
    async fn test_failing_event_does_not_block_batch() {
        let server = index_server().await;
        let mut broken = CatalogEntry::new(TableKey::new("main", "vanished"));
        broken.primary_key = Some("id".to_string());
        let s = setup(&server.uri(), IndexMode::Enabled, vec![people_entry(), broken]).await;

        s.store
            .execute_script("INSERT INTO people (id, last_name) VALUES (1, 'A'), (2, 'B');")
            .await
            .unwrap();
        let bad = s
            .queue
            .enqueue(&TableKey::new("main", "vanished"), "id", "9", Operation::Update)
            .await
            .unwrap();
        s.store
            .execute_script("INSERT INTO people (id, last_name) VALUES (3, 'C');")
            .await
            .unwrap();

        let summary = s.sync.process_batch(None).await.unwrap();
        assert_eq!(summary.fetched, 4);
        assert_eq!(summary.processed, 3);
        assert_eq!(summary.failed, 1);

        let pending = s.queue.fetch_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, bad);
        assert_eq!(pending[0].attempts, 1);
        assert!(pending[0].last_error.is_some());
    }

    #[tokio::test]
    async fn test_uncovered_tables_are_marked_processed() {
        let server = MockServer::start().await;
        let s = setup(&server.uri(), IndexMode::Disabled, vec![people_entry()]).await;
        s.queue
            .enqueue(&TableKey::new("main", "unknown"), "id", "1", Operation::Insert)
            .await
            .unwrap();
        s.store
            .execute_script("INSERT INTO people (id, last_name) VALUES (1, 'A');")
            .await
            .unwrap();

        let summary = s.sync.process_batch(None).await.unwrap();
        assert_eq!(summary.processed, 2);
        assert_eq!(s.queue.pending_count().await.unwrap(), 0);
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_index_leaves_events_pending() {
        let s = setup("http://127.0.0.1:9", IndexMode::Enabled, vec![people_entry()]).await;
        s.store
            .execute_script("INSERT INTO people (id, last_name) VALUES (1, 'A');")
            .await
            .unwrap();

        let summary = s.sync.process_batch(None).await.unwrap();
        assert!(summary.index_unavailable);
        let pending = s.queue.fetch_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 0);
    }

    /// Queue holding three uncovered events whose first acknowledgement fails
    #[derive(Default)]
    struct FlakyQueue {
        marked: parking_lot::Mutex<Vec<i64>>,
        errors: parking_lot::Mutex<Vec<i64>>,
    }

    fn uncovered_event(id: i64) -> ChangeEvent {
        ChangeEvent {
            id,
            schema_name: "main".to_string(),
            table_name: "unknown".to_string(),
            primary_key: "id".to_string(),
            primary_value: id.to_string(),
            operation: "update".to_string(),
            attempts: 0,
            last_error: None,
            created_at: String::new(),
            updated_at: String::new(),
            processed_at: None,
        }
    }

    #[async_trait]
    impl ChangeQueue for FlakyQueue {
        async fn fetch_pending(&self, _limit: usize) -> Result<Vec<ChangeEvent>> {
            Ok((1..=3).map(uncovered_event).collect())
        }
        async fn mark_processed(&self, id: i64) -> Result<()> {
            if id == 1 {
                return Err(Error::Other("database is locked".to_string()));
            }
            self.marked.lock().push(id);
            Ok(())
        }
        async fn record_error(&self, id: i64, _message: &str) -> Result<()> {
            self.errors.lock().push(id);
            Ok(())
        }
        async fn pending_count(&self) -> Result<u64> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_acknowledgement_failure_does_not_stop_batch() {
        let (store, _tmp) = setup_store().await;
        let queue = Arc::new(FlakyQueue::default());
        let shared: Arc<dyn RelationalStore> = Arc::new(store);
        let index = Arc::new(
            IndexClient::new(&index_config("http://127.0.0.1:9", IndexMode::Disabled)).unwrap(),
        );
        let sync = IncrementalSync::new(
            Arc::new(CatalogAccessor::from_catalog(Catalog::new(vec![people_entry()]))),
            shared.clone(),
            queue.clone(),
            index,
            Arc::new(PrimaryKeyResolver::new(shared)),
        );

        let summary = sync.process_batch(None).await.unwrap();
        assert_eq!(summary.fetched, 3);
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(*queue.marked.lock(), vec![2, 3]);
        assert_eq!(*queue.errors.lock(), vec![1]);
    }

    /// Queue that only counts polls
    #[derive(Default)]
    struct CountingQueue {
        polls: AtomicUsize,
    }

    #[async_trait]
    impl ChangeQueue for CountingQueue {
        async fn fetch_pending(&self, _limit: usize) -> Result<Vec<ChangeEvent>> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }
        async fn mark_processed(&self, _id: i64) -> Result<()> {
            Ok(())
        }
        async fn record_error(&self, _id: i64, _message: &str) -> Result<()> {
            Ok(())
        }
        async fn pending_count(&self) -> Result<u64> {
            Ok(0)
        }
    }

    /// Let the paused clock drive any due timers
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test]
    async fn test_worker_polls_on_interval_and_stops() {
        let (store, _tmp) = setup_store().await;
        tokio::time::pause();

        let queue = Arc::new(CountingQueue::default());
        let shared: Arc<dyn RelationalStore> = Arc::new(store);
        let index = Arc::new(
            IndexClient::new(&index_config("http://127.0.0.1:9", IndexMode::Disabled)).unwrap(),
        );
        let sync = Arc::new(
            IncrementalSync::new(
                Arc::new(CatalogAccessor::from_catalog(Catalog::default())),
                shared.clone(),
                queue.clone(),
                index,
                Arc::new(PrimaryKeyResolver::new(shared)),
            )
            .with_poll_interval(Duration::from_secs(15)),
        );

        let worker = sync.start();
        settle().await;
        assert_eq!(queue.polls.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(15)).await;
        settle().await;
        assert_eq!(queue.polls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(30)).await;
        settle().await;
        assert!(queue.polls.load(Ordering::SeqCst) >= 2);

        worker.stop().await;
        let after_stop = queue.polls.load(Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(queue.polls.load(Ordering::SeqCst), after_stop);
    }
}
