//! Status command implementation

use crate::context::AppContext;
use crate::error::Result;
use crate::index::ConnectionState;
use crate::queue::ChangeQueue;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Status information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusInfo {
    pub config_path: String,
    pub catalog_path: String,
    pub database_url: String,
    pub catalog_tables: usize,
    pub sync_enabled_tables: usize,
    pub index_url: String,
    pub index_mode: String,
    pub index_reachable: bool,
    pub connection: ConnectionState,
    pub queue_schema: String,
    pub queue_initialized: bool,
    pub pending_events: Option<u64>,
}

/// Get system status
pub async fn cmd_status(ctx: &AppContext) -> Result<StatusInfo> {
    info!("Getting status");

    let catalog = ctx.catalog.snapshot();
    let index_reachable = ctx.index.ensure_operational().await;

    let queue_initialized = ctx.queue.is_initialized().await?;
    let pending_events = if queue_initialized {
        match ctx.queue.pending_count().await {
            Ok(count) => Some(count),
            Err(e) => {
                debug!("Queue count error: {:?}", e);
                None
            }
        }
    } else {
        None
    };

    Ok(StatusInfo {
        config_path: ctx.config.paths.config_file.display().to_string(),
        catalog_path: ctx.config.paths.catalog_file.display().to_string(),
        database_url: ctx.config.database.url.clone(),
        catalog_tables: catalog.len(),
        sync_enabled_tables: catalog.sync_enabled().count(),
        index_url: ctx.config.index.url.clone(),
        index_mode: ctx.config.index.mode.to_string(),
        index_reachable,
        connection: ctx.index.connection_state(),
        queue_schema: ctx.queue.schema().to_string(),
        queue_initialized,
        pending_events,
    })
}

/// Print status to console
pub fn print_status(status: &StatusInfo) {
    println!("\n📊 replisearch Status\n");
    println!("Configuration: {}", status.config_path);
    println!("Catalog: {}", status.catalog_path);
    println!(
        "  Tables: {} ({} replicated)",
        status.catalog_tables, status.sync_enabled_tables
    );
    println!("Database: {}", status.database_url);

    println!("\nSearch index:");
    println!("  URL: {}", status.index_url);
    println!("  Mode: {}", status.index_mode);
    let connection_status = if status.index_reachable {
        "✓ Connected"
    } else if !status.connection.enabled {
        "✗ Disabled"
    } else {
        "✗ Not reachable"
    };
    println!("  Status: {}", connection_status);
    if let Some(ms) = status.connection.reconnect_in_ms {
        println!("  Next reconnect attempt in {} ms", ms);
    }

    println!("\nChange queue ({}):", status.queue_schema);
    if status.queue_initialized {
        match status.pending_events {
            Some(count) => println!("  Pending events: {}", count),
            None => println!("  Pending events: unknown"),
        }
    } else {
        println!("  ⚠ Not installed (run 'replisearch queue install-triggers')");
    }
}
