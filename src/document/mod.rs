//! Document shaping
//!
//! Turns a relational row plus its catalog entry into the flattened document
//! stored in the search index. Everything here is pure: malformed input
//! yields a smaller document or `None`, never an error.

use crate::catalog::{CatalogEntry, DocumentKind};
use crate::relational::{value_to_key_string, Record};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use unicode_segmentation::UnicodeSegmentation;
use uuid::Uuid;

/// Longest profile comment kept in previews, in graphemes
pub const PROFILE_COMMENT_PREVIEW: usize = 160;

/// Search index representation of one row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDocument {
    pub table: String,
    /// `schema.table`
    pub table_name: String,
    pub database_name: String,
    pub display_name: String,
    pub primary_key: String,
    pub primary_value: String,
    pub primary_keys: BTreeMap<String, Value>,
    pub preview: BTreeMap<String, String>,
    pub raw_values: Vec<String>,
    pub search_tokens: Vec<String>,
    pub full_text: Option<String>,
}

impl IndexDocument {
    pub fn id(&self) -> Uuid {
        document_id(&self.table_name, &self.primary_value)
    }
}

/// Stable document id for a row
pub fn document_id(table_name: &str, primary_value: &str) -> Uuid {
    Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{}:{}", table_name, primary_value).as_bytes(),
    )
}

/// How a row is shaped, chosen from the catalog sync policy
#[derive(Debug, Clone, Copy)]
pub enum DocumentShape<'a> {
    Generic(&'a CatalogEntry),
    Profile(&'a CatalogEntry),
}

impl<'a> DocumentShape<'a> {
    pub fn for_entry(entry: &'a CatalogEntry) -> Self {
        match entry.sync.kind {
            DocumentKind::Generic => DocumentShape::Generic(entry),
            DocumentKind::Profile => DocumentShape::Profile(entry),
        }
    }
}

pub fn build_document(
    row: &Record,
    shape: DocumentShape<'_>,
    primary_key: &str,
) -> Option<IndexDocument> {
    match shape {
        DocumentShape::Generic(entry) => build_generic(row, entry, primary_key),
        DocumentShape::Profile(entry) => build_profile(row, entry, primary_key),
    }
}

/// Flatten a value into trimmed, non-empty strings
pub fn normalize(value: &Value) -> Vec<String> {
    let mut out = Vec::new();
    flatten_into(value, &mut out);
    out
}

fn flatten_into(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Null => {}
        Value::String(s) => {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                out.push(trimmed.to_string());
            }
        }
        Value::Number(n) => out.push(n.to_string()),
        Value::Bool(b) => out.push(b.to_string()),
        Value::Array(items) => items.iter().for_each(|item| flatten_into(item, out)),
        Value::Object(map) => map.values().for_each(|item| flatten_into(item, out)),
    }
}

/// Lower-cased values plus their whitespace-free variants, deduplicated
pub fn tokens<'a>(values: impl IntoIterator<Item = &'a String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();

    for value in values {
        let lower = value.to_lowercase();
        if lower.is_empty() {
            continue;
        }
        let compact: String = lower.chars().filter(|c| !c.is_whitespace()).collect();
        for token in [lower, compact] {
            if !token.is_empty() && seen.insert(token.clone()) {
                out.push(token);
            }
        }
    }

    out
}

fn primary_parts(row: &Record, primary_key: &str) -> Option<(String, BTreeMap<String, Value>)> {
    let raw = row.get(primary_key)?;
    let primary_value = value_to_key_string(raw)?;
    if primary_value.trim().is_empty() {
        return None;
    }
    let mut keys = BTreeMap::new();
    keys.insert(primary_key.to_string(), raw.clone());
    Some((primary_value, keys))
}

fn skeleton(
    entry: &CatalogEntry,
    primary_key: &str,
    primary_value: String,
    primary_keys: BTreeMap<String, Value>,
) -> IndexDocument {
    IndexDocument {
        table: entry.key.table.clone(),
        table_name: entry.key.qualified(),
        database_name: entry.database_name().to_string(),
        display_name: entry.display_name().to_string(),
        primary_key: primary_key.to_string(),
        primary_value,
        primary_keys,
        preview: BTreeMap::new(),
        raw_values: Vec::new(),
        search_tokens: Vec::new(),
        full_text: None,
    }
}

fn finish(mut doc: IndexDocument) -> IndexDocument {
    doc.search_tokens = tokens(&doc.raw_values);
    doc.full_text = if doc.raw_values.is_empty() {
        None
    } else {
        Some(doc.raw_values.join(" "))
    };
    doc
}

/// Generic shape: searchable and preview columns, flattened
pub fn build_generic(row: &Record, entry: &CatalogEntry, primary_key: &str) -> Option<IndexDocument> {
    let (primary_value, primary_keys) = primary_parts(row, primary_key)?;
    let mut doc = skeleton(entry, primary_key, primary_value, primary_keys);

    for field in entry.document_fields() {
        let values = row.get(field).map(normalize).unwrap_or_default();
        if values.is_empty() {
            continue;
        }
        if entry.preview.iter().any(|p| p == field) {
            doc.preview.insert(field.to_string(), values.join(" "));
        }
        doc.raw_values.extend(values);
    }

    Some(finish(doc))
}

fn text_field(row: &Record, names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|name| row.get(*name))
        .map(|value| normalize(value).join(" "))
        .find(|value| !value.is_empty())
}

fn truncate_graphemes(text: &str, max: usize) -> String {
    let mut graphemes = text.graphemes(true);
    let head: String = graphemes.by_ref().take(max).collect();
    if graphemes.next().is_some() {
        format!("{}…", head.trim_end())
    } else {
        head
    }
}

/// Profile shape: full name, phone, email and a truncated comment
pub fn build_profile(row: &Record, entry: &CatalogEntry, primary_key: &str) -> Option<IndexDocument> {
    let (primary_value, primary_keys) = primary_parts(row, primary_key)?;
    let mut doc = skeleton(entry, primary_key, primary_value, primary_keys);

    let first = text_field(row, &["first_name", "firstname"]);
    let last = text_field(row, &["last_name", "lastname"]);
    let full_name = [first.as_deref(), last.as_deref()]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ");

    let fields = [
        ("full_name", Some(full_name).filter(|n| !n.is_empty())),
        ("phone", text_field(row, &["phone", "phone_number"])),
        ("email", text_field(row, &["email"])),
        (
            "comment",
            text_field(row, &["comment"]).map(|c| truncate_graphemes(&c, PROFILE_COMMENT_PREVIEW)),
        ),
    ];

    for (name, value) in fields {
        if let Some(value) = value {
            doc.raw_values.push(value.clone());
            doc.preview.insert(name.to_string(), value);
        }
    }

    Some(finish(doc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TableKey;
    use serde_json::json;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn people_entry() -> CatalogEntry {
        let mut entry = CatalogEntry::new(TableKey::new("main", "people"));
        entry.searchable = vec!["first_name".into(), "last_name".into(), "aliases".into()];
        entry.preview = vec!["last_name".into(), "city".into()];
        entry
    }

    #[test]
    fn test_generic_document() {
        let row = record(json!({
            "id": 12,
            "first_name": "  Jean Luc ",
            "last_name": "Dupont",
            "aliases": ["JL", "", {"nick": "Picard"}],
            "city": "Paris",
            "secret": "not indexed"
        }));
        let doc = build_generic(&row, &people_entry(), "id").unwrap();

        assert_eq!(doc.table_name, "main.people");
        assert_eq!(doc.primary_value, "12");
        assert_eq!(doc.primary_keys.get("id"), Some(&json!(12)));
        assert_eq!(doc.raw_values, vec!["Jean Luc", "Dupont", "JL", "Picard", "Paris"]);
        assert_eq!(doc.preview.get("last_name").map(String::as_str), Some("Dupont"));
        assert_eq!(doc.preview.get("city").map(String::as_str), Some("Paris"));
        assert!(doc.search_tokens.contains(&"jean luc".to_string()));
        assert!(doc.search_tokens.contains(&"jeanluc".to_string()));
        assert!(!doc.raw_values.contains(&"not indexed".to_string()));
        assert_eq!(doc.full_text.as_deref(), Some("Jean Luc Dupont JL Picard Paris"));
    }

    #[test]
    fn test_null_primary_key_is_skipped() {
        let entry = people_entry();
        assert!(build_generic(&record(json!({"id": null, "last_name": "X"})), &entry, "id").is_none());
        assert!(build_generic(&record(json!({"last_name": "X"})), &entry, "id").is_none());
    }

    #[test]
    fn test_same_row_same_id() {
        let entry = people_entry();
        let row = record(json!({"id": 5, "last_name": "Martin"}));
        let a = build_generic(&row, &entry, "id").unwrap();
        let b = build_generic(&row, &entry, "id").unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(a.id(), document_id("main.people", "5"));
        assert_ne!(a.id(), document_id("main.cars", "5"));
    }

    #[test]
    fn test_profile_document() {
        let mut entry = CatalogEntry::new(TableKey::new("autres", "profiles"));
        entry.sync.kind = DocumentKind::Profile;
        let comment = "é".repeat(PROFILE_COMMENT_PREVIEW + 10);
        let row = record(json!({
            "id": 3,
            "first_name": "Marie",
            "last_name": "Curie",
            "phone": "+33 1 23",
            "comment": comment
        }));

        let doc = build_document(&row, DocumentShape::for_entry(&entry), "id").unwrap();
        assert_eq!(doc.preview.get("full_name").map(String::as_str), Some("Marie Curie"));
        assert!(!doc.preview.contains_key("email"));
        let truncated = doc.preview.get("comment").unwrap();
        assert!(truncated.ends_with('…'));
        assert_eq!(truncated.graphemes(true).count(), PROFILE_COMMENT_PREVIEW + 1);
        assert!(doc.search_tokens.contains(&"+33123".to_string()));
    }

    #[test]
    fn test_tokens_dedupe() {
        let values = vec!["ABC".to_string(), "abc".to_string(), "a b".to_string()];
        assert_eq!(tokens(&values), vec!["abc", "a b", "ab"]);
    }
}
