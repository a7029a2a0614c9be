//! Request and response bodies for the search index REST API

use crate::document::IndexDocument;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};

/// Normalized search result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub total: u64,
    pub hits: Vec<SearchHit>,
    pub elapsed_ms: u64,
    pub tables_searched: Vec<String>,
}

impl SearchResult {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// One matching document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub score: Option<f64>,
    pub table: String,
    pub table_name: String,
    pub database_name: String,
    pub display_name: String,
    pub primary_key: String,
    pub primary_value: String,
    pub preview: BTreeMap<String, String>,
}

impl SearchHit {
    pub fn from_document(id: String, score: Option<f64>, doc: IndexDocument) -> Self {
        Self {
            id,
            score,
            table: doc.table,
            table_name: doc.table_name,
            database_name: doc.database_name,
            display_name: doc.display_name,
            primary_key: doc.primary_key,
            primary_value: doc.primary_value,
            preview: doc.preview,
        }
    }
}

/// Per-document bulk failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkItemError {
    pub id: String,
    pub status: u16,
    pub reason: String,
}

/// Outcome of one bulk upsert
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkOutcome {
    pub indexed: usize,
    /// Rows dropped before sending (no primary key value)
    pub skipped: usize,
    pub errors: Vec<BulkItemError>,
    /// The index was not reachable; nothing was sent
    pub unavailable: bool,
}

impl BulkOutcome {
    pub fn unavailable(skipped: usize) -> Self {
        Self {
            skipped,
            unavailable: true,
            ..Default::default()
        }
    }
}

/// Outcome of a delete by id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
    Unavailable,
}

/// Outcome of an index reset
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResetOutcome {
    pub index: String,
    pub deleted: bool,
    pub created: bool,
    pub unavailable: bool,
}

/// NDJSON body for `_bulk`
pub fn bulk_body(index: &str, docs: &[IndexDocument]) -> serde_json::Result<String> {
    let mut body = String::new();
    for doc in docs {
        let action = json!({ "index": { "_index": index, "_id": doc.id().to_string() } });
        body.push_str(&serde_json::to_string(&action)?);
        body.push('\n');
        body.push_str(&serde_json::to_string(doc)?);
        body.push('\n');
    }
    Ok(body)
}

#[derive(Debug, Deserialize)]
pub struct BulkResponse {
    #[serde(default)]
    pub errors: bool,
    #[serde(default)]
    pub items: Vec<HashMap<String, BulkResponseItem>>,
}

#[derive(Debug, Deserialize)]
pub struct BulkResponseItem {
    #[serde(rename = "_id", default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: u16,
    #[serde(default)]
    pub error: Option<Value>,
}

impl BulkResponse {
    /// Count successes and collect per-item failures
    pub fn into_outcome(self, sent: usize, skipped: usize) -> BulkOutcome {
        if self.items.is_empty() && !self.errors {
            return BulkOutcome {
                indexed: sent,
                skipped,
                ..Default::default()
            };
        }

        let mut outcome = BulkOutcome {
            skipped,
            ..Default::default()
        };
        for item in self.items.into_iter().flat_map(|item| item.into_values()) {
            if (200..300).contains(&item.status) && item.error.is_none() {
                outcome.indexed += 1;
            } else {
                let reason = item
                    .error
                    .as_ref()
                    .and_then(|e| e.get("reason").and_then(Value::as_str).map(str::to_string))
                    .or_else(|| item.error.as_ref().map(Value::to_string))
                    .unwrap_or_else(|| format!("status {}", item.status));
                outcome.errors.push(BulkItemError {
                    id: item.id.unwrap_or_default(),
                    status: item.status,
                    reason,
                });
            }
        }
        outcome
    }
}

/// Free-text query over tokens and full text, with a per-table aggregation
pub fn search_body(query: &str, from: usize, size: usize) -> Value {
    let lower = query.trim().to_lowercase();
    let compact: String = lower.chars().filter(|c| !c.is_whitespace()).collect();
    let mut terms = vec![lower.clone()];
    if compact != lower {
        terms.push(compact);
    }

    json!({
        "from": from,
        "size": size,
        "track_total_hits": true,
        "query": {
            "bool": {
                "should": [
                    { "terms": { "search_tokens": terms, "boost": 3.0 } },
                    {
                        "multi_match": {
                            "query": query.trim(),
                            "fields": ["full_text", "raw_values"],
                            "operator": "and"
                        }
                    }
                ],
                "minimum_should_match": 1
            }
        },
        "aggs": {
            "tables": { "terms": { "field": "table_name", "size": 200 } }
        }
    })
}

pub fn count_body(table_name: &str) -> Value {
    json!({ "query": { "term": { "table_name": table_name } } })
}

/// Index mappings used when (re)creating an index
pub fn index_mappings() -> Value {
    json!({
        "mappings": {
            "properties": {
                "table": { "type": "keyword" },
                "table_name": { "type": "keyword" },
                "database_name": { "type": "keyword" },
                "display_name": { "type": "keyword" },
                "primary_key": { "type": "keyword" },
                "primary_value": { "type": "keyword" },
                "primary_keys": { "type": "object", "enabled": false },
                "preview": { "type": "object", "enabled": false },
                "raw_values": { "type": "text" },
                "search_tokens": { "type": "keyword" },
                "full_text": { "type": "text" }
            }
        }
    })
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum TotalHits {
    Count(u64),
    Object { value: u64 },
}

#[derive(Debug, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub took: u64,
    pub hits: SearchResponseHits,
    #[serde(default)]
    pub aggregations: Option<SearchAggregations>,
}

#[derive(Debug, Deserialize)]
pub struct SearchResponseHits {
    pub total: Option<TotalHits>,
    #[serde(default)]
    pub hits: Vec<SearchResponseHit>,
}

#[derive(Debug, Deserialize)]
pub struct SearchResponseHit {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_score", default)]
    pub score: Option<f64>,
    #[serde(rename = "_source")]
    pub source: IndexDocument,
}

#[derive(Debug, Deserialize)]
pub struct SearchAggregations {
    pub tables: Option<TermsAggregation>,
}

#[derive(Debug, Deserialize)]
pub struct TermsAggregation {
    #[serde(default)]
    pub buckets: Vec<TermsBucket>,
}

#[derive(Debug, Deserialize)]
pub struct TermsBucket {
    pub key: String,
}

impl SearchResponse {
    pub fn into_result(self) -> SearchResult {
        let hits: Vec<SearchHit> = self
            .hits
            .hits
            .into_iter()
            .map(|hit| SearchHit::from_document(hit.id, hit.score, hit.source))
            .collect();
        let total = match self.hits.total {
            Some(TotalHits::Count(n)) | Some(TotalHits::Object { value: n }) => n,
            None => hits.len() as u64,
        };
        let tables_searched = self
            .aggregations
            .and_then(|aggs| aggs.tables)
            .map(|tables| tables.buckets.into_iter().map(|b| b.key).collect())
            .unwrap_or_default();

        SearchResult {
            total,
            hits,
            elapsed_ms: self.took,
            tables_searched,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CountResponse {
    pub count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bulk_outcome_with_item_errors() {
        let response: BulkResponse = serde_json::from_value(json!({
            "errors": true,
            "items": [
                { "index": { "_id": "a", "status": 201 } },
                { "index": { "_id": "b", "status": 400, "error": { "type": "mapper_parsing_exception", "reason": "bad field" } } }
            ]
        }))
        .unwrap();

        let outcome = response.into_outcome(2, 1);
        assert_eq!(outcome.indexed, 1);
        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].reason, "bad field");
    }

    #[test]
    fn test_search_body_terms() {
        let body = search_body(" Jean Luc ", 20, 10);
        assert_eq!(body["from"], 20);
        assert_eq!(
            body["query"]["bool"]["should"][0]["terms"]["search_tokens"],
            json!(["jean luc", "jeanluc"])
        );
    }

    #[test]
    fn test_total_hits_shapes() {
        let legacy: SearchResponseHits =
            serde_json::from_value(json!({ "total": 4, "hits": [] })).unwrap();
        assert!(matches!(legacy.total, Some(TotalHits::Count(4))));
        let modern: SearchResponseHits =
            serde_json::from_value(json!({ "total": { "value": 7, "relation": "eq" }, "hits": [] }))
                .unwrap();
        assert!(matches!(modern.total, Some(TotalHits::Object { value: 7 })));
    }
}
