//! Init command implementation

use crate::config::Config;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

/// Starter catalog written next to a fresh config
pub const CATALOG_TEMPLATE: &str = r#"# Tables replicated into the search index and searched by the relational engine.
#
# [tables."main.people"]
# display = "People"
# primary_key = "id"
# searchable = ["first_name", "last_name", "phone"]
# preview = ["first_name", "last_name", "city"]
# filters = { city = "string" }
# sync = { index = "people", batch_size = 500, purge_before_index = true, kind = "generic" }
"#;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitReport {
    pub config_path: PathBuf,
    pub catalog_path: PathBuf,
    pub catalog_created: bool,
}

/// Write a default config, plus a starter catalog when none exists
pub async fn cmd_init(base_dir: Option<PathBuf>, force: bool) -> Result<InitReport> {
    let base_dir = base_dir.unwrap_or_else(Config::default_base_dir);
    let config = Config::init(&base_dir);

    if config.paths.config_file.exists() && !force {
        return Err(Error::Config(format!(
            "Config already exists at {}. Use --force to overwrite.",
            config.paths.config_file.display()
        )));
    }

    info!("Initializing replisearch in {:?}", base_dir);
    config.save()?;

    let catalog_created = !config.paths.catalog_file.exists();
    if catalog_created {
        std::fs::write(&config.paths.catalog_file, CATALOG_TEMPLATE)?;
    }

    Ok(InitReport {
        config_path: config.paths.config_file,
        catalog_path: config.paths.catalog_file,
        catalog_created,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_init_writes_loadable_files() {
        let tmp = TempDir::new().unwrap();
        let report = cmd_init(Some(tmp.path().to_path_buf()), false).await.unwrap();
        assert!(report.catalog_created);

        let config = Config::load(&report.config_path).unwrap();
        assert_eq!(config.paths.catalog_file, report.catalog_path);
        let catalog = Catalog::from_toml(CATALOG_TEMPLATE).unwrap();
        assert!(catalog.is_empty());

        assert!(cmd_init(Some(tmp.path().to_path_buf()), false).await.is_err());
        let again = cmd_init(Some(tmp.path().to_path_buf()), true).await.unwrap();
        assert!(!again.catalog_created);
    }
}
