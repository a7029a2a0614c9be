//! Table catalog
//!
//! The catalog maps relational tables to the columns that are searchable or
//! shown in previews, the primary key, and the per-table sync policy. It is
//! read from a TOML file and held as an immutable snapshot that is swapped
//! on explicit reload.

mod resolver;

pub use resolver::*;

use crate::error::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Identity of a catalog table
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableKey {
    pub schema: String,
    pub table: String,
}

impl TableKey {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// `schema.table`
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

impl std::fmt::Display for TableKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

impl FromStr for TableKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        normalize_key(s)
    }
}

/// Parse a catalog key.
///
/// `schema.table` splits at the first dot. The legacy `schema_table` form
/// splits at the first underscore.
pub fn normalize_key(key: &str) -> Result<TableKey> {
    let key = key.trim();
    let (schema, table) = match key.split_once('.') {
        Some(parts) => parts,
        None => key.split_once('_').unwrap_or((key, "")),
    };

    if schema.is_empty() || table.is_empty() {
        return Err(Error::Catalog(format!("Invalid table key: '{}'", key)));
    }

    Ok(TableKey::new(schema, table))
}

/// Shape of the documents built for a table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    #[default]
    Generic,
    Profile,
}

impl std::fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocumentKind::Generic => write!(f, "generic"),
            DocumentKind::Profile => write!(f, "profile"),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Per-table replication policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Target index; the configured default index when unset
    #[serde(default)]
    pub index: Option<String>,

    #[serde(default)]
    pub batch_size: Option<usize>,

    /// Drop and recreate the target index before the first table that uses it
    #[serde(default = "default_true")]
    pub purge_before_index: bool,

    #[serde(default)]
    pub kind: DocumentKind,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            index: None,
            batch_size: None,
            purge_before_index: true,
            kind: DocumentKind::Generic,
        }
    }
}

impl SyncPolicy {
    pub fn index_name<'a>(&'a self, default_index: &'a str) -> &'a str {
        self.index.as_deref().unwrap_or(default_index)
    }
}

/// Metadata for one catalog table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    #[serde(skip)]
    pub key: TableKey,

    #[serde(default)]
    pub display: Option<String>,

    #[serde(default)]
    pub theme: Option<String>,

    /// Logical database name reported in documents; the schema when unset
    #[serde(default)]
    pub database: Option<String>,

    #[serde(default)]
    pub primary_key: Option<String>,

    #[serde(default)]
    pub searchable: Vec<String>,

    #[serde(default)]
    pub preview: Vec<String>,

    /// Filterable columns and their UI type (`string`, `select`, `date`, ...)
    #[serde(default)]
    pub filters: BTreeMap<String, String>,

    #[serde(default)]
    pub sync: SyncPolicy,
}

impl CatalogEntry {
    pub fn new(key: TableKey) -> Self {
        Self {
            key,
            ..Default::default()
        }
    }

    pub fn database_name(&self) -> &str {
        self.database.as_deref().unwrap_or(&self.key.schema)
    }

    pub fn display_name(&self) -> &str {
        self.display.as_deref().unwrap_or(&self.key.table)
    }

    /// Searchable columns followed by preview-only columns, without duplicates
    pub fn document_fields(&self) -> Vec<&str> {
        let mut fields: Vec<&str> = Vec::with_capacity(self.searchable.len() + self.preview.len());
        for field in self.searchable.iter().chain(self.preview.iter()) {
            if !fields.contains(&field.as_str()) {
                fields.push(field);
            }
        }
        fields
    }

    fn dedupe(&mut self) {
        dedupe_in_place(&mut self.searchable);
        dedupe_in_place(&mut self.preview);
    }
}

fn dedupe_in_place(values: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    values.retain(|value| seen.insert(value.clone()));
}

#[derive(Debug, Default, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    tables: BTreeMap<String, CatalogEntry>,
}

/// An immutable catalog snapshot
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: BTreeMap<TableKey, CatalogEntry>,
}

impl Catalog {
    pub fn new(entries: impl IntoIterator<Item = CatalogEntry>) -> Self {
        let entries = entries
            .into_iter()
            .map(|mut entry| {
                entry.dedupe();
                (entry.key.clone(), entry)
            })
            .collect();
        Self { entries }
    }

    /// Parse a TOML catalog document
    pub fn from_toml(content: &str) -> Result<Self> {
        let file: CatalogFile = toml::from_str(content)?;
        let mut entries = Vec::with_capacity(file.tables.len());

        for (raw_key, mut entry) in file.tables {
            let key = match normalize_key(&raw_key) {
                Ok(key) => key,
                Err(e) => {
                    warn!("Skipping catalog entry: {}", e);
                    continue;
                }
            };
            entry.key = key;
            entries.push(entry);
        }

        Ok(Self::new(entries))
    }

    pub fn get(&self, key: &TableKey) -> Option<&CatalogEntry> {
        self.entries.get(key)
    }

    /// Look up by any accepted key spelling
    pub fn lookup(&self, key: &str) -> Option<&CatalogEntry> {
        normalize_key(key).ok().and_then(|key| self.entries.get(&key))
    }

    pub fn entries(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.entries.values()
    }

    /// Entries whose sync policy is enabled, in key order
    pub fn sync_enabled(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.entries.values().filter(|entry| entry.sync.enabled)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Supplies catalog snapshots
pub trait CatalogSource: Send + Sync {
    fn load(&self) -> Result<Catalog>;
}

/// Catalog read from a TOML file on every load
pub struct FileCatalog {
    path: PathBuf,
}

impl FileCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CatalogSource for FileCatalog {
    fn load(&self) -> Result<Catalog> {
        if !self.path.exists() {
            return Err(Error::Catalog(format!(
                "Catalog file not found: {}",
                self.path.display()
            )));
        }

        debug!("Loading catalog from {:?}", self.path);
        let content = std::fs::read_to_string(&self.path)?;
        Catalog::from_toml(&content)
    }
}

/// Fixed in-memory catalog
pub struct StaticCatalog(pub Catalog);

impl CatalogSource for StaticCatalog {
    fn load(&self) -> Result<Catalog> {
        Ok(self.0.clone())
    }
}

/// Read-only, reloadable view over a catalog source
pub struct CatalogAccessor {
    source: Box<dyn CatalogSource>,
    current: RwLock<Arc<Catalog>>,
}

impl CatalogAccessor {
    /// Load the first snapshot from `source`
    pub fn new(source: impl CatalogSource + 'static) -> Result<Self> {
        let catalog = source.load()?;
        info!("Loaded catalog with {} tables", catalog.len());
        Ok(Self {
            source: Box::new(source),
            current: RwLock::new(Arc::new(catalog)),
        })
    }

    pub fn from_catalog(catalog: Catalog) -> Self {
        Self {
            current: RwLock::new(Arc::new(catalog.clone())),
            source: Box::new(StaticCatalog(catalog)),
        }
    }

    /// Current snapshot; stays valid across reloads
    pub fn snapshot(&self) -> Arc<Catalog> {
        self.current.read().clone()
    }

    /// Re-read the source and swap the snapshot
    pub fn reload(&self) -> Result<Arc<Catalog>> {
        let catalog = Arc::new(self.source.load()?);
        debug!("Reloaded catalog with {} tables", catalog.len());
        *self.current.write() = catalog.clone();
        Ok(catalog)
    }
}
