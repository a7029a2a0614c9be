//! Default values for configuration

use super::IndexMode;

/// Default relational database URL (SQLite file next to the config)
pub fn default_database_url() -> String {
    std::env::var("REPLISEARCH_DATABASE_URL")
        .unwrap_or_else(|_| "sqlite://replisearch.db?mode=rwc".to_string())
}

/// Default catalog file name, resolved relative to the config directory
pub fn default_catalog_path() -> String {
    "catalog.toml".to_string()
}

/// Default search index URL
pub fn default_index_url() -> String {
    std::env::var("SEARCH_INDEX_URL").unwrap_or_else(|_| "http://127.0.0.1:9200".to_string())
}

/// Default index mode; honours `SEARCH_INDEX_MODE` (true/false/force/1/0)
pub fn default_index_mode() -> IndexMode {
    std::env::var("SEARCH_INDEX_MODE")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(IndexMode::Enabled)
}

/// Re-enable a tripped index client after the cooldown
pub fn default_index_auto_reconnect() -> bool {
    match std::env::var("SEARCH_INDEX_AUTO_RECONNECT") {
        Ok(value) => !matches!(value.trim().to_lowercase().as_str(), "false" | "0" | "no" | "off"),
        Err(_) => true,
    }
}

/// Cooldown before a tripped client probes again
pub fn default_index_retry_delay_ms() -> u64 {
    15_000
}

/// Health probe timeout
pub fn default_index_health_timeout_ms() -> u64 {
    5_000
}

/// Per-request timeout for index calls
pub fn default_index_request_timeout_ms() -> u64 {
    3_000
}

/// Index used when a catalog entry does not name one
pub fn default_index_name() -> String {
    "global_search".to_string()
}

/// Lifetime of a cached search result
pub fn default_index_cache_ttl_ms() -> u64 {
    5_000
}

/// Maximum cached search results
pub fn default_index_cache_capacity() -> usize {
    256
}

/// Global batch size override for full resync (`SYNC_BATCH_SIZE`)
pub fn default_sync_batch_size_override() -> Option<usize> {
    std::env::var("SYNC_BATCH_SIZE")
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .filter(|size: &usize| *size > 0)
}

/// Batch size used when neither the override nor the catalog sets one
pub fn default_sync_batch_size() -> usize {
    500
}

/// Schema holding the change queue table
pub fn default_queue_schema() -> String {
    "main".to_string()
}

/// Events drained per incremental batch
pub fn default_queue_batch_size() -> usize {
    std::env::var("SYNC_INCREMENTAL_BATCH_SIZE")
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .filter(|size: &usize| *size > 0)
        .unwrap_or(200)
}

/// Interval between incremental polls
pub fn default_queue_poll_interval_ms() -> u64 {
    std::env::var("SYNC_INCREMENTAL_POLL_MS")
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .filter(|ms: &u64| *ms > 0)
        .unwrap_or(15_000)
}

/// Delay before the secondary engine joins the race
pub fn default_router_race_delay_ms() -> u64 {
    75
}

/// Prefer the search index as primary engine
pub fn default_router_prefer_index_engine() -> bool {
    true
}

/// Default page size
pub fn default_router_default_limit() -> usize {
    20
}

/// Largest page size a caller may request
pub fn default_router_max_limit() -> usize {
    100
}

/// Longest index prefix for variable-length text columns
pub fn default_indexing_max_prefix_length() -> u32 {
    255
}
