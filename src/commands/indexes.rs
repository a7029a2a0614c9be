//! Secondary index and search index maintenance commands

use crate::context::AppContext;
use crate::error::Result;
use crate::index::ResetOutcome;
use crate::indexing::IndexingSummary;

pub async fn cmd_ensure_indexes(ctx: &AppContext, dry_run: bool) -> Result<IndexingSummary> {
    ctx.indexing_service().ensure_indexes(dry_run).await
}

pub fn print_indexing_summary(summary: &IndexingSummary, dry_run: bool) {
    if dry_run {
        println!("\n🔍 Secondary Indexes (dry run)\n");
    } else {
        println!("\n🗂  Secondary Indexes\n");
    }

    for planned in &summary.planned {
        let prefix = planned
            .prefix_length
            .map(|len| format!(" (prefix {})", len))
            .unwrap_or_default();
        let verb = if dry_run { "would create" } else { "created" };
        println!(
            "• {} {} on {}.{}{}",
            verb, planned.index, planned.table, planned.column, prefix
        );
    }

    for error in &summary.errors {
        let column = error.column.as_deref().unwrap_or("-");
        println!("✗ {} [{}]: {}", error.table, column, error.error);
    }

    println!("\nTables processed: {}", summary.tables_processed);
    println!("Columns evaluated: {}", summary.columns_evaluated);
    println!("Indexes created: {}", summary.indexes_created);
    println!("Indexes skipped: {}", summary.indexes_skipped);
    println!("Errors: {}", summary.errors.len());
}

/// Delete and optionally recreate a search index
pub async fn cmd_index_reset(
    ctx: &AppContext,
    index: Option<&str>,
    recreate: bool,
) -> Result<ResetOutcome> {
    ctx.index.reset_index(index, recreate).await
}

pub fn print_reset_outcome(outcome: &ResetOutcome) {
    if outcome.unavailable {
        println!("⚠ Search index unavailable; '{}' was not reset.", outcome.index);
        return;
    }
    match (outcome.deleted, outcome.created) {
        (_, true) => println!("✓ Index '{}' reset (deleted and recreated)", outcome.index),
        (true, false) => println!("✓ Index '{}' deleted", outcome.index),
        (false, false) => println!("Index '{}' did not exist", outcome.index),
    }
}
