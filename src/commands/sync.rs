//! Full resync and verification commands

use crate::context::AppContext;
use crate::error::{Error, Result};
use crate::progress::ProgressObserver;
use crate::resync::{SyncProgressReport, SyncStatus};
use crate::verify::{verify_sync, VerificationReport};
use std::sync::Arc;
use tracing::info;

/// Resync one table, or every replicated table when `table` is `None`
pub async fn cmd_sync(
    ctx: &AppContext,
    table: Option<&str>,
    show_progress: bool,
) -> Result<Vec<SyncProgressReport>> {
    let mut service = ctx.resync_service();
    if show_progress {
        service = service.with_observer(Arc::new(ProgressObserver::new()));
    }

    match table {
        Some(name) => {
            info!("Resyncing table {}", name);
            let report = service.sync_table_by_name(name).await?;
            report.map(|r| vec![r]).ok_or_else(|| {
                Error::Config(format!("Replication is disabled for table '{}'", name))
            })
        }
        None => {
            info!("Resyncing all tables");
            service.sync_all_tables().await
        }
    }
}

pub fn print_sync_reports(reports: &[SyncProgressReport]) {
    println!("\n🔄 Resync Complete\n");

    if reports.is_empty() {
        println!("No replicated tables in the catalog.");
        return;
    }

    for report in reports {
        let mark = match report.status {
            SyncStatus::Completed => "✓",
            SyncStatus::Failed => "✗",
            SyncStatus::Running => "…",
        };
        println!("{} {} -> {}", mark, report.table, report.index);
        println!(
            "  Fetched: {}, Indexed: {}, Skipped: {}, Batches: {}",
            report.fetched, report.indexed, report.skipped, report.batches
        );
        if let Some(error) = &report.error {
            println!("  Error: {}", error);
        }
        for error in report.errors.iter().take(5) {
            println!("  ⚠ {}", error);
        }
    }

    let failed = reports
        .iter()
        .filter(|r| r.status == SyncStatus::Failed)
        .count();
    let indexed: u64 = reports.iter().map(|r| r.indexed).sum();
    println!(
        "\nTables: {} ({} failed), documents indexed: {}",
        reports.len(),
        failed,
        indexed
    );
}

pub async fn cmd_verify(ctx: &AppContext) -> Result<VerificationReport> {
    verify_sync(&ctx.catalog, ctx.relational.as_ref(), &ctx.index).await
}

pub fn print_verification(report: &VerificationReport) {
    println!("\n🔍 Sync Verification\n");

    if !report.index_reachable {
        println!("⚠ Search index not reachable; document counts unavailable.\n");
    }

    for table in &report.tables {
        let count = |value: Option<u64>| value.map_or("?".to_string(), |v| v.to_string());
        let mark = if table.is_consistent() { "✓" } else { "✗" };
        print!(
            "{} {} [{}]: rows {}, documents {}",
            mark,
            table.table,
            table.index,
            count(table.db_count),
            count(table.index_count)
        );
        match table.delta {
            Some(delta) if delta != 0 => println!(" (delta {:+})", delta),
            _ => println!(),
        }
        if let Some(error) = &table.error {
            println!("  Error: {}", error);
        }
    }

    if report.mismatch {
        println!("\nIndex is out of sync. Run 'replisearch sync' to rebuild it.");
    } else {
        println!("\nAll tables in sync.");
    }
}
