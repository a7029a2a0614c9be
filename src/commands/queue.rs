//! Change queue commands

use crate::context::AppContext;
use crate::error::Result;
use crate::incremental::BatchSummary;
use crate::queue::{install_triggers, TriggerReport};
use std::sync::Arc;
use tracing::info;

/// Drain one batch of pending change events
pub async fn cmd_queue_process(ctx: &AppContext, limit: Option<usize>) -> Result<BatchSummary> {
    ctx.queue.init_schema().await?;
    ctx.incremental_sync().process_batch(limit).await
}

/// Poll the queue until interrupted
pub async fn cmd_queue_watch(ctx: &AppContext) -> Result<()> {
    ctx.queue.init_schema().await?;
    let sync = Arc::new(ctx.incremental_sync());
    let worker = sync.start();

    info!(
        interval_ms = ctx.config.queue.poll_interval_ms,
        "Watching change queue, press Ctrl-C to stop"
    );
    tokio::signal::ctrl_c().await?;

    worker.stop().await;
    Ok(())
}

/// Create the queue table and (re)install the change triggers
pub async fn cmd_install_triggers(ctx: &AppContext) -> Result<TriggerReport> {
    ctx.queue.init_schema().await?;
    let catalog = ctx.catalog.snapshot();
    Ok(install_triggers(ctx.store.pool(), ctx.queue.schema(), &catalog, &ctx.resolver).await)
}

pub fn print_batch_summary(summary: &BatchSummary) {
    if summary.index_unavailable {
        println!("⚠ Search index unavailable; events left pending.");
        return;
    }
    println!(
        "✓ Processed {} of {} events ({} failed)",
        summary.processed, summary.fetched, summary.failed
    );
}

pub fn print_trigger_report(report: &TriggerReport) {
    println!("\n⚙️  Change Triggers\n");
    for name in &report.installed {
        println!("✓ {}", name);
    }
    for error in &report.errors {
        match &error.trigger {
            Some(trigger) => println!("✗ {} ({}): {}", error.table, trigger, error.error),
            None => println!("✗ {}: {}", error.table, error.error),
        }
    }
    println!(
        "\nInstalled: {}, Errors: {}",
        report.installed.len(),
        report.errors.len()
    );
}
