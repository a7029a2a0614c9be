//! Primary key resolution with a per-table cache

use super::{CatalogEntry, TableKey};
use crate::error::{Error, Result};
use crate::relational::RelationalStore;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Resolves and caches the primary key column of catalog tables.
///
/// Order: catalog `primary_key`, then the introspected constraint, then an
/// `id` column. Tables with none of these are rejected.
pub struct PrimaryKeyResolver {
    store: Arc<dyn RelationalStore>,
    cache: RwLock<HashMap<TableKey, String>>,
}

impl PrimaryKeyResolver {
    pub fn new(store: Arc<dyn RelationalStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn resolve(&self, entry: &CatalogEntry) -> Result<String> {
        if let Some(pk) = entry.primary_key.as_deref().filter(|pk| !pk.is_empty()) {
            return Ok(pk.to_string());
        }

        let cached = self.cache.read().get(&entry.key).cloned();
        if let Some(pk) = cached {
            return Ok(pk);
        }

        let resolved = match self.store.primary_key(&entry.key).await? {
            Some(pk) => pk,
            None => {
                let columns = self.store.columns(&entry.key).await?;
                if columns.iter().any(|column| column.name == "id") {
                    "id".to_string()
                } else {
                    return Err(Error::MissingPrimaryKey(entry.key.to_string()));
                }
            }
        };

        debug!(table = %entry.key, primary_key = %resolved, "Resolved primary key");
        self.cache.write().insert(entry.key.clone(), resolved.clone());
        Ok(resolved)
    }

    /// Forget cached keys, e.g. after a catalog reload
    pub fn clear(&self) {
        self.cache.write().clear();
    }
}
