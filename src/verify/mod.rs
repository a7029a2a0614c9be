//! Row count vs. document count check for replicated tables

use crate::catalog::CatalogAccessor;
use crate::error::Result;
use crate::index::IndexClient;
use crate::relational::RelationalStore;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableVerification {
    pub table: String,
    pub index: String,
    pub db_count: Option<u64>,
    /// `None` when the index could not be reached
    pub index_count: Option<u64>,
    /// `index_count - db_count` when both are known
    pub delta: Option<i64>,
    pub error: Option<String>,
}

impl TableVerification {
    pub fn is_consistent(&self) -> bool {
        self.delta == Some(0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub tables: Vec<TableVerification>,
    pub index_reachable: bool,
    pub mismatch: bool,
}

/// Compare every sync-enabled table with its documents in the index
pub async fn verify_sync(
    catalog: &CatalogAccessor,
    store: &dyn RelationalStore,
    index: &IndexClient,
) -> Result<VerificationReport> {
    let catalog = catalog.snapshot();
    let index_reachable = index.ensure_operational().await;
    let mut report = VerificationReport {
        index_reachable,
        ..Default::default()
    };

    for entry in catalog.sync_enabled() {
        let index_name = entry.sync.index_name(index.default_index()).to_string();
        let table_name = entry.key.qualified();
        let mut row = TableVerification {
            table: table_name.clone(),
            index: index_name.clone(),
            db_count: None,
            index_count: None,
            delta: None,
            error: None,
        };

        match store.count_rows(&entry.key).await {
            Ok(count) => row.db_count = Some(count),
            Err(e) => {
                warn!(table = %entry.key, error = %e, "Could not count table rows");
                row.error = Some(e.to_string());
            }
        }

        if index_reachable {
            match index.count_documents(Some(&index_name), &table_name).await {
                Ok(count) => row.index_count = count,
                Err(e) => {
                    warn!(table = %entry.key, index = %index_name, error = %e, "Could not count documents");
                    row.error.get_or_insert_with(|| e.to_string());
                }
            }
        }

        if let (Some(db), Some(docs)) = (row.db_count, row.index_count) {
            row.delta = Some(docs as i64 - db as i64);
        }
        report.mismatch |= !row.is_consistent();
        report.tables.push(row);
    }

    info!(
        tables = report.tables.len(),
        mismatch = report.mismatch,
        "Sync verification finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, CatalogEntry, TableKey};
    use crate::config::{IndexConfig, IndexMode};
    use crate::relational::sqlite::test_support::{seed_people, setup_store};
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn catalog() -> CatalogAccessor {
        let mut people = CatalogEntry::new(TableKey::new("main", "people"));
        people.searchable = vec!["last_name".into()];
        let mut cars = CatalogEntry::new(TableKey::new("main", "cars"));
        cars.searchable = vec!["plate".into()];
        cars.sync.index = Some("vehicles".into());
        CatalogAccessor::from_catalog(Catalog::new(vec![people, cars]))
    }

    #[tokio::test]
    async fn test_reports_deltas_per_table() {
        let (store, _tmp) = setup_store().await;
        seed_people(&store, 12).await;
        store
            .execute_script("CREATE TABLE cars (plate TEXT PRIMARY KEY); INSERT INTO cars VALUES ('A'), ('B');")
            .await
            .unwrap();

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/global_search/_count"))
            .and(body_partial_json(serde_json::json!({"query": {"term": {"table_name": "main.people"}}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"count": 10})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/vehicles/_count"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"count": 2})))
            .mount(&server)
            .await;

        let index = IndexClient::new(&IndexConfig {
            url: server.uri(),
            mode: IndexMode::Enabled,
            ..IndexConfig::default()
        })
        .unwrap();

        let report = verify_sync(&catalog(), &store, &index).await.unwrap();
        assert!(report.index_reachable);
        assert!(report.mismatch);

        let cars = &report.tables[0];
        assert_eq!(cars.table, "main.cars");
        assert_eq!(cars.index, "vehicles");
        assert!(cars.is_consistent());

        let people = &report.tables[1];
        assert_eq!(people.db_count, Some(12));
        assert_eq!(people.index_count, Some(10));
        assert_eq!(people.delta, Some(-2));
    }

    #[tokio::test]
    async fn test_unreachable_index_leaves_counts_unknown() {
        let (store, _tmp) = setup_store().await;
        seed_people(&store, 3).await;
        store.execute_script("CREATE TABLE cars (plate TEXT PRIMARY KEY);").await.unwrap();

        let index = IndexClient::new(&IndexConfig {
            url: "http://127.0.0.1:9".to_string(),
            mode: IndexMode::Enabled,
            ..IndexConfig::default()
        })
        .unwrap();

        let report = verify_sync(&catalog(), &store, &index).await.unwrap();
        assert!(!report.index_reachable);
        assert!(report.mismatch);
        assert!(report.tables.iter().all(|t| t.index_count.is_none() && t.delta.is_none()));
        assert_eq!(report.tables[1].db_count, Some(3));
    }
}
