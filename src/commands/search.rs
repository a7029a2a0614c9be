//! Search command implementation

use crate::context::AppContext;
use crate::error::{Error, Result};
use crate::router::{EngineKind, QueryResponse, SearchRequest};
use serde_json::{Map, Value};

/// Search options
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub page: usize,
    pub limit: usize,
    /// `column=value` pairs
    pub filters: Vec<String>,
    pub follow_links: bool,
    pub depth: u32,
    /// Force the engine raced first
    pub prefer: Option<EngineKind>,
    pub diagnostics: bool,
}

/// Parse `column=value` filters. Numeric and boolean values keep their type.
pub fn parse_filters(pairs: &[String]) -> Result<Map<String, Value>> {
    let mut filters = Map::new();
    for pair in pairs {
        let (name, value) = pair
            .split_once('=')
            .ok_or_else(|| Error::Config(format!("Invalid filter '{}', expected column=value", pair)))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Config(format!("Invalid filter '{}': empty column", pair)));
        }
        let value = value.trim();
        let value = match value {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => value
                .parse::<i64>()
                .map(Value::from)
                .unwrap_or_else(|_| Value::String(value.to_string())),
        };
        filters.insert(name.to_string(), value);
    }
    Ok(filters)
}

pub async fn cmd_search(ctx: &AppContext, query: &str, options: SearchOptions) -> Result<QueryResponse> {
    let request = SearchRequest {
        query: query.to_string(),
        filters: parse_filters(&options.filters)?,
        page: options.page,
        limit: options.limit,
        follow_links: options.follow_links,
        depth: options.depth,
        prefer_index_engine: options.prefer.map(|engine| engine == EngineKind::Index),
        diagnostics: options.diagnostics,
    };
    Ok(ctx.query_router().search(request).await)
}

pub fn print_search_results(response: &QueryResponse) {
    println!(
        "\n🔎 {} result(s) via {} engine in {} ms (page {}/{})\n",
        response.total,
        response.engine,
        response.elapsed_ms,
        response.page,
        response.pages.max(1)
    );

    if response.hits.is_empty() {
        println!("No matches.");
    }

    for hit in &response.hits {
        println!(
            "• {} [{}] {}={}",
            hit.display_name, hit.table_name, hit.primary_key, hit.primary_value
        );
        for (field, value) in &hit.preview {
            println!("    {}: {}", field, value);
        }
    }

    if !response.tables_searched.is_empty() {
        println!("\nTables searched: {}", response.tables_searched.join(", "));
    }

    if let Some(attempts) = &response.diagnostics {
        println!("\nEngine attempts:");
        for attempt in attempts {
            let outcome = match &attempt.error {
                Some(error) => format!("error: {}", error),
                None => format!("{} hit(s)", attempt.hits),
            };
            println!(
                "  {} ({:?}) +{} ms, {} ms, {}",
                attempt.engine, attempt.role, attempt.started_after_ms, attempt.duration_ms, outcome
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_filters() {
        let filters = parse_filters(&[
            "city = Lyon".to_string(),
            "age=42".to_string(),
            "verified=true".to_string(),
        ])
        .unwrap();
        assert_eq!(filters["city"], Value::String("Lyon".into()));
        assert_eq!(filters["age"], Value::from(42));
        assert_eq!(filters["verified"], Value::Bool(true));

        assert!(parse_filters(&["novalue".to_string()]).is_err());
        assert!(parse_filters(&["=x".to_string()]).is_err());
    }
}
