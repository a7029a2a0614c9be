//! Long-lived service wiring shared by the CLI commands

use crate::catalog::{CatalogAccessor, FileCatalog, PrimaryKeyResolver};
use crate::config::Config;
use crate::error::Result;
use crate::incremental::IncrementalSync;
use crate::index::IndexClient;
use crate::indexing::IndexingService;
use crate::queue::SqliteQueue;
use crate::relational::{RelationalStore, SqliteStore};
use crate::resync::ResyncService;
use crate::router::{IndexBackend, QueryRouter};
use crate::structured::RelationalEngine;
use std::sync::Arc;

/// Every collaborator the services need, built once per process
pub struct AppContext {
    pub config: Config,
    pub catalog: Arc<CatalogAccessor>,
    pub store: SqliteStore,
    pub relational: Arc<dyn RelationalStore>,
    pub resolver: Arc<PrimaryKeyResolver>,
    pub index: Arc<IndexClient>,
    pub queue: Arc<SqliteQueue>,
}

impl AppContext {
    pub async fn connect(config: Config) -> Result<Self> {
        let catalog = Arc::new(CatalogAccessor::new(FileCatalog::new(
            &config.paths.catalog_file,
        ))?);
        let store = SqliteStore::connect(&config.database).await?;
        let relational: Arc<dyn RelationalStore> = Arc::new(store.clone());
        let resolver = Arc::new(PrimaryKeyResolver::new(relational.clone()));
        let index = Arc::new(IndexClient::new(&config.index)?);
        let queue = Arc::new(SqliteQueue::new(store.pool().clone(), &config.queue.schema));

        Ok(Self {
            config,
            catalog,
            store,
            relational,
            resolver,
            index,
            queue,
        })
    }

    pub fn resync_service(&self) -> ResyncService {
        ResyncService::new(
            self.catalog.clone(),
            self.relational.clone(),
            self.index.clone(),
            self.resolver.clone(),
            self.config.sync.clone(),
        )
    }

    pub fn incremental_sync(&self) -> IncrementalSync {
        IncrementalSync::new(
            self.catalog.clone(),
            self.relational.clone(),
            self.queue.clone(),
            self.index.clone(),
            self.resolver.clone(),
        )
        .with_batch_size(self.config.queue.batch_size)
        .with_poll_interval(self.config.queue.poll_interval())
    }

    pub fn indexing_service(&self) -> IndexingService {
        IndexingService::new(
            self.catalog.clone(),
            self.relational.clone(),
            self.config.indexing.clone(),
        )
    }

    pub fn query_router(&self) -> QueryRouter {
        QueryRouter::new(
            Arc::new(IndexBackend::new(self.index.clone(), self.catalog.clone())),
            Arc::new(RelationalEngine::new(
                self.catalog.clone(),
                self.relational.clone(),
                self.resolver.clone(),
            )),
            self.config.router.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexMode;
    use crate::router::{EngineKind, SearchRequest};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_context_wires_a_working_router() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("catalog.toml"),
            r#"
[tables."main.people"]
searchable = ["last_name"]
"#,
        )
        .unwrap();

        let mut config = Config::init(tmp.path());
        config.database.url = format!(
            "sqlite://{}?mode=rwc",
            tmp.path().join("source.db").display()
        );
        config.index.mode = IndexMode::Disabled;

        let ctx = AppContext::connect(config).await.unwrap();
        ctx.store
            .execute_script(
                "CREATE TABLE people (id INTEGER PRIMARY KEY, last_name TEXT);
                 INSERT INTO people (last_name) VALUES ('Dupont'), ('Martin');",
            )
            .await
            .unwrap();
        ctx.queue.init_schema().await.unwrap();

        let response = ctx.query_router().search(SearchRequest::new("dupont")).await;
        assert_eq!(response.engine, EngineKind::Relational);
        assert_eq!(response.total, 1);

        let summary = ctx.incremental_sync().process_batch(None).await.unwrap();
        assert_eq!(summary.fetched, 0);
    }
}
