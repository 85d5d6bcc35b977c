//! Canonical forms for every string that ends up in a natural key.
//!
//! Paths, keyword slugs and free text are normalized here and nowhere else,
//! so the conversation path and the batch path always agree on a key.

use memory_graph_schemas::{RecordMetadata, StructuredRecord};
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::OnceLock;

use crate::error::{IngestError, Result};

pub const DEFAULT_PROJECT_ID: &str = "default_project";
pub const DEFAULT_CONVERSATION_ID: &str = "default_conversation";

/// Trimmed text, or `None` when nothing is left.
pub fn clean_text(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Forward slashes, no `./` prefix, no doubled separators.
pub fn normalize_path(raw: &str) -> Option<String> {
    let unified = raw.trim().replace('\\', "/");
    let mut path = String::with_capacity(unified.len());
    let mut prev_slash = false;
    for ch in unified.chars() {
        if ch == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        path.push(ch);
    }

    let mut path = path.as_str();
    while let Some(rest) = path.strip_prefix("./") {
        path = rest;
    }
    if path.len() > 1 {
        path = path.trim_end_matches('/');
    }

    if path.is_empty() || path == "." {
        None
    } else {
        Some(path.to_string())
    }
}

fn slug_separator() -> &'static Regex {
    static SEPARATOR: OnceLock<Regex> = OnceLock::new();
    SEPARATOR.get_or_init(|| Regex::new(r"[^\p{L}\p{N}]+").expect("valid slug regex"))
}

/// Case-folded, whitespace-collapsed, punctuation-free keyword slug.
///
/// `"Auth Service"`, `"auth   service"` and `"AUTH-SERVICE"` all become
/// `auth-service`.
pub fn slugify(raw: &str) -> Option<String> {
    let folded = raw.trim().to_lowercase().replace(['\'', '\u{2019}'], "");
    let slug = slug_separator().replace_all(&folded, "-");
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        None
    } else {
        Some(slug.to_string())
    }
}

/// A keyword after canonicalization. `label` keeps the first spelling seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyword {
    pub slug: String,
    pub label: String,
}

/// Deduplicates keywords by slug, preserving first-seen order.
pub fn canonical_keywords<'a>(raw: impl IntoIterator<Item = &'a String>) -> Vec<Keyword> {
    let mut seen = HashSet::new();
    let mut keywords = Vec::new();
    for word in raw {
        if let Some(slug) = slugify(word) {
            if seen.insert(slug.clone()) {
                keywords.push(Keyword {
                    slug,
                    label: word.trim().to_string(),
                });
            }
        }
    }
    keywords
}

/// Short, stable sha256 digest of `parts` joined by `|`.
pub fn stable_hash(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parts.join("|").as_bytes());
    hex::encode(hasher.finalize())
}

/// A record with every key already in canonical form.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    pub id: String,
    pub project_id: String,
    pub conversation_id: String,
    pub role: Option<String>,
    pub content: Option<String>,
    pub timestamp: Option<String>,
    pub file_path: Option<String>,
    pub function_name: Option<String>,
    pub line_start: Option<u32>,
    pub line_end: Option<u32>,
    pub lines_added: Option<u32>,
    pub lines_removed: Option<u32>,
    pub diff_summary: Option<String>,
    pub intent: Option<String>,
    pub keywords: Vec<Keyword>,
    pub embedding: Option<Vec<f32>>,
    pub code_changes: Option<String>,
    pub file_analysis: Option<String>,
}

impl NormalizedRecord {
    /// Whether the record describes a code change worth its own node.
    pub fn has_change(&self) -> bool {
        self.line_start.is_some()
            || self.line_end.is_some()
            || self.lines_added.is_some()
            || self.lines_removed.is_some()
            || self.diff_summary.is_some()
            || self.code_changes.is_some()
    }
}

/// Nested `metadata` wins over flat fields.
pub fn normalize_record(record: &StructuredRecord) -> NormalizedRecord {
    let nested: Option<&RecordMetadata> = record.metadata.as_ref();
    let flat = &record.flat;

    macro_rules! field {
        ($name:ident) => {
            nested
                .and_then(|m| m.$name.clone())
                .or_else(|| flat.$name.clone())
        };
    }

    let project_id = clean_text(field!(project_id).as_deref())
        .unwrap_or_else(|| DEFAULT_PROJECT_ID.to_string());
    let conversation_id = clean_text(field!(conversation_id).as_deref())
        .unwrap_or_else(|| DEFAULT_CONVERSATION_ID.to_string());
    let role = clean_text(record.role.as_deref());
    let content = clean_text(record.content.as_deref());
    let timestamp = clean_text(record.timestamp.as_deref());

    let id = clean_text(record.id.as_deref()).unwrap_or_else(|| {
        let digest = stable_hash(&[
            &project_id,
            &conversation_id,
            timestamp.as_deref().unwrap_or(""),
            role.as_deref().unwrap_or(""),
            content.as_deref().unwrap_or(""),
        ]);
        format!("stm_{}", &digest[..16])
    });

    let keywords = field!(keywords).unwrap_or_default();

    NormalizedRecord {
        id,
        project_id,
        conversation_id,
        role,
        content,
        timestamp,
        file_path: field!(file_path).as_deref().and_then(normalize_path),
        function_name: clean_text(field!(function_name).as_deref()),
        line_start: field!(line_start),
        line_end: field!(line_end),
        lines_added: field!(lines_added),
        lines_removed: field!(lines_removed),
        diff_summary: clean_text(field!(diff_summary).as_deref()),
        intent: clean_text(field!(intent).as_deref()),
        keywords: canonical_keywords(keywords.iter()),
        embedding: record.embedding.clone().filter(|e| !e.is_empty()),
        code_changes: field!(code_changes).and_then(json_blob),
        file_analysis: field!(file_analysis).and_then(json_blob),
    }
}

fn json_blob(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Object(ref map) if map.is_empty() => None,
        other => Some(other.to_string()),
    }
}

/// Records pulled out of an export, plus the entries that could not be read.
#[derive(Debug, Default)]
pub struct RecordBatch {
    pub records: Vec<StructuredRecord>,
    pub rejected: Vec<(usize, String)>,
}

/// Accepts a bare JSON array or an object wrapping one under `messages`,
/// `records` or `results`.
pub fn parse_record_batch(raw: &str) -> Result<RecordBatch> {
    let value: Value = serde_json::from_str(raw)?;
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => ["messages", "records", "results"]
            .iter()
            .find_map(|key| match map.remove(*key) {
                Some(Value::Array(items)) => Some(items),
                _ => None,
            })
            .ok_or_else(|| {
                IngestError::InvalidRecord(
                    "expected a list or an object with messages, records or results".to_string(),
                )
            })?,
        _ => {
            return Err(IngestError::InvalidRecord(
                "record export must be a JSON list or object".to_string(),
            ))
        }
    };

    let mut batch = RecordBatch::default();
    for (index, item) in items.into_iter().enumerate() {
        match serde_json::from_value::<StructuredRecord>(item) {
            Ok(record) => batch.records.push(record),
            Err(e) => batch.rejected.push((index, e.to_string())),
        }
    }
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify_collapses_case_whitespace_and_punctuation() {
        assert_eq!(slugify("Auth Service").as_deref(), Some("auth-service"));
        assert_eq!(slugify("auth   service").as_deref(), Some("auth-service"));
        assert_eq!(slugify("AUTH-SERVICE").as_deref(), Some("auth-service"));
        assert_eq!(slugify("  user's cache!  ").as_deref(), Some("users-cache"));
        assert_eq!(slugify("--").as_deref(), None);
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(".\\src\\auth.py").as_deref(), Some("src/auth.py"));
        assert_eq!(normalize_path("src//lib/").as_deref(), Some("src/lib"));
        assert_eq!(normalize_path("/abs/path.rs").as_deref(), Some("/abs/path.rs"));
        assert_eq!(normalize_path("   ").as_deref(), None);
    }

    #[test]
    fn test_canonical_keywords_dedupes_by_slug() {
        let raw = vec![
            "Auth Service".to_string(),
            "auth   service".to_string(),
            "AUTH-SERVICE".to_string(),
            "tokens".to_string(),
        ];
        let keywords = canonical_keywords(raw.iter());

        assert_eq!(keywords.len(), 2);
        assert_eq!(keywords[0].slug, "auth-service");
        assert_eq!(keywords[0].label, "Auth Service");
    }

    #[test]
    fn test_nested_metadata_wins_and_defaults_apply() {
        let record: StructuredRecord = serde_json::from_str(
            r#"{
                "content": "  fix login  ",
                "file_path": "flat.py",
                "metadata": {"file_path": "src\\nested.py", "code_changes": {"kind": "edit"}}
            }"#,
        )
        .unwrap();

        let normalized = normalize_record(&record);
        assert_eq!(normalized.project_id, DEFAULT_PROJECT_ID);
        assert_eq!(normalized.conversation_id, DEFAULT_CONVERSATION_ID);
        assert_eq!(normalized.file_path.as_deref(), Some("src/nested.py"));
        assert_eq!(normalized.content.as_deref(), Some("fix login"));
        assert_eq!(normalized.code_changes.as_deref(), Some(r#"{"kind":"edit"}"#));
        assert!(normalized.has_change());
    }

    #[test]
    fn test_missing_id_is_derived_deterministically() {
        let record: StructuredRecord =
            serde_json::from_str(r#"{"role": "user", "content": "hello", "timestamp": "t1"}"#)
                .unwrap();

        let a = normalize_record(&record);
        let b = normalize_record(&record);
        assert!(a.id.starts_with("stm_"));
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn test_parse_record_batch_wrappers() {
        let bare = parse_record_batch(r#"[{"id": "a"}, {"id": "b"}]"#).unwrap();
        assert_eq!(bare.records.len(), 2);

        let wrapped = parse_record_batch(r#"{"results": [{"id": "a"}]}"#).unwrap();
        assert_eq!(wrapped.records.len(), 1);

        let with_bad = parse_record_batch(r#"{"messages": [{"id": "a"}, {"line_start": "x"}]}"#)
            .unwrap();
        assert_eq!(with_bad.records.len(), 1);
        assert_eq!(with_bad.rejected[0].0, 1);

        assert!(parse_record_batch(r#"{"other": []}"#).is_err());
        assert!(parse_record_batch("42").is_err());
    }
}
