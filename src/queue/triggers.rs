//! Triggers that feed the change queue

use super::QUEUE_TABLE;
use crate::catalog::{Catalog, PrimaryKeyResolver, TableKey};
use crate::relational::quote_ident;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use tracing::{info, warn};

const TRIGGER_BASE_MAX: usize = 48;

/// Make an identifier safe: non-alphanumerics become `_`, runs collapse,
/// edges are trimmed and the result is capped at `max` characters.
pub fn sanitize_identifier(value: &str, max: usize) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        let ch = if ch.is_ascii_alphanumeric() { ch } else { '_' };
        if ch == '_' && out.ends_with('_') {
            continue;
        }
        out.push(ch);
    }
    out.trim_matches('_').chars().take(max).collect()
}

/// `{schema}_{table}_search_sync_{suffix}`
pub fn trigger_name(table: &TableKey, suffix: &str) -> String {
    let base = sanitize_identifier(
        &format!("{}_{}_search_sync", table.schema, table.table),
        TRIGGER_BASE_MAX,
    );
    format!("{}_{}", base, suffix)
}

fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Failure to install triggers for one table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerError {
    pub table: String,
    pub trigger: Option<String>,
    pub error: String,
}

/// Result of [`install_triggers`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerReport {
    pub installed: Vec<String>,
    pub errors: Vec<TriggerError>,
}

/// Drop and recreate the insert/update/delete triggers of every
/// sync-enabled catalog table. SQLite triggers can only write to tables of
/// their own schema, so tables outside the queue schema are reported.
pub async fn install_triggers(
    pool: &SqlitePool,
    queue_schema: &str,
    catalog: &Catalog,
    resolver: &PrimaryKeyResolver,
) -> TriggerReport {
    let mut report = TriggerReport::default();

    for entry in catalog.sync_enabled() {
        let key = &entry.key;

        if key.schema != queue_schema {
            report.errors.push(TriggerError {
                table: key.to_string(),
                trigger: None,
                error: format!(
                    "table schema '{}' differs from queue schema '{}'",
                    key.schema, queue_schema
                ),
            });
            continue;
        }

        let primary_key = match resolver.resolve(entry).await {
            Ok(pk) => pk,
            Err(e) => {
                report.errors.push(TriggerError {
                    table: key.to_string(),
                    trigger: None,
                    error: e.to_string(),
                });
                continue;
            }
        };

        let triggers = [
            ("ai", "INSERT", "NEW", "insert"),
            ("au", "UPDATE", "NEW", "update"),
            ("ad", "DELETE", "OLD", "delete"),
        ];

        for (suffix, event, row_ref, operation) in triggers {
            let name = trigger_name(key, suffix);
            let sql = format!(
                r#"
                DROP TRIGGER IF EXISTS {schema}.{trigger};
                CREATE TRIGGER {schema}.{trigger} AFTER {event} ON {table}
                FOR EACH ROW
                BEGIN
                    INSERT INTO {queue} (schema_name, table_name, primary_key, primary_value, operation)
                    VALUES ({schema_lit}, {table_lit}, {pk_lit}, COALESCE(CAST({row_ref}.{pk} AS TEXT), ''), '{operation}');
                END;
                "#,
                schema = quote_ident(&key.schema),
                trigger = quote_ident(&name),
                table = quote_ident(&key.table),
                queue = QUEUE_TABLE,
                schema_lit = sql_literal(&key.schema),
                table_lit = sql_literal(&key.table),
                pk_lit = sql_literal(&primary_key),
                pk = quote_ident(&primary_key),
            );

            match sqlx::raw_sql(&sql).execute(pool).await {
                Ok(_) => {
                    info!(table = %key, trigger = %name, "Installed change trigger");
                    report.installed.push(name);
                }
                Err(e) => {
                    warn!(table = %key, trigger = %name, error = %e, "Failed to install trigger");
                    report.errors.push(TriggerError {
                        table: key.to_string(),
                        trigger: Some(name),
                        error: e.to_string(),
                    });
                }
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogEntry;
    use crate::queue::{ChangeQueue, Operation, SqliteQueue};
    use crate::relational::sqlite::test_support::{seed_people, setup_store};
    use std::sync::Arc;

    #[test]
    fn test_trigger_names() {
        assert_eq!(
            trigger_name(&TableKey::new("main", "people"), "ai"),
            "main_people_search_sync_ai"
        );
        assert_eq!(sanitize_identifier("__a--b..c__", 48), "a_b_c");
        let long = trigger_name(&TableKey::new("main", &"t".repeat(80)), "ad");
        assert_eq!(long.len(), TRIGGER_BASE_MAX + 3);
    }

    #[tokio::test]
    async fn test_triggers_record_mutations() {
        let (store, _tmp) = setup_store().await;
        seed_people(&store, 0).await;
        let queue = SqliteQueue::new(store.pool().clone(), "main");
        queue.init_schema().await.unwrap();

        let mut people = CatalogEntry::new(TableKey::new("main", "people"));
        people.searchable = vec!["last_name".to_string()];
        let mut elsewhere = CatalogEntry::new(TableKey::new("other", "cars"));
        elsewhere.searchable = vec!["plate".to_string()];
        let catalog = Catalog::new(vec![people, elsewhere]);
        let resolver = PrimaryKeyResolver::new(Arc::new(store.clone()));

        let report = install_triggers(store.pool(), "main", &catalog, &resolver).await;
        assert_eq!(report.installed.len(), 3);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].table, "other.cars");

        // Reinstalling is idempotent.
        let again = install_triggers(store.pool(), "main", &catalog, &resolver).await;
        assert_eq!(again.installed.len(), 3);

        store
            .execute_script(
                "INSERT INTO people (id, last_name) VALUES (1, 'Dupont');
                 UPDATE people SET last_name = 'Durand' WHERE id = 1;
                 DELETE FROM people WHERE id = 1;",
            )
            .await
            .unwrap();

        let events = queue.fetch_pending(10).await.unwrap();
        let ops: Vec<Operation> = events.iter().map(|e| e.get_operation().unwrap()).collect();
        assert_eq!(ops, vec![Operation::Insert, Operation::Update, Operation::Delete]);
        assert!(events.iter().all(|e| e.primary_value == "1" && e.primary_key == "id"));
        assert_eq!(events[0].table_key(), TableKey::new("main", "people"));
    }
}
