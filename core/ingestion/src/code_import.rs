use chrono::{DateTime, Utc};
use ignore::WalkBuilder;
use memory_graph_schemas::{IngestStatus, NodeId, ParsedSymbol, SymbolKind};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::error::{IngestError, Result};
use crate::graph::{keys, EdgeMerge, GraphStore, NodeMerge};
use crate::normalize::{clean_text, normalize_path, DEFAULT_PROJECT_ID};
use crate::symbols::try_parse_python_symbols;

pub const CODE_FILE_LABEL: &str = "CodeFile";
pub const CODE_SYMBOL_LABEL: &str = "CodeSymbol";

/// Per-run totals for a code import.
#[derive(Debug, Clone, Default)]
pub struct CodeImportSummary {
    pub files: usize,
    pub symbols: usize,
    pub calls: usize,
    pub key_collisions: usize,
    /// Files that could not be read.
    pub skipped: Vec<String>,
    /// Files whose symbols were skipped because they did not parse.
    pub parse_failures: Vec<String>,
    /// Files whose merge failed part way; other files still import.
    pub failed: Vec<String>,
}

impl CodeImportSummary {
    pub fn status(&self) -> IngestStatus {
        IngestStatus::from_failures(
            self.skipped.len() + self.parse_failures.len() + self.failed.len(),
        )
    }

    fn absorb(&mut self, file: FileImport) {
        self.files += 1;
        self.symbols += file.symbols;
        self.calls += file.calls;
        self.key_collisions += file.key_collisions;
        if let Some(path) = file.parse_failure {
            self.parse_failures.push(path);
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileImport {
    pub file_id: NodeId,
    pub symbols: usize,
    pub calls: usize,
    pub key_collisions: usize,
    pub parse_failure: Option<String>,
}

pub fn detect_language(path: &str) -> String {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase());
    match ext.as_deref() {
        Some("py") => "python".to_string(),
        Some("ts") | Some("tsx") => "typescript".to_string(),
        Some("js") | Some("jsx") => "javascript".to_string(),
        Some("java") => "java".to_string(),
        Some(other) if !other.is_empty() => other.to_string(),
        _ => "text".to_string(),
    }
}

/// First path segment, used as the repository name when none is given.
pub fn infer_repo(path: &str) -> Option<String> {
    path.trim_start_matches('/')
        .split('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
}

pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Merges one source file, its symbols and its same-file call graph.
pub fn import_source_file(
    store: &dyn GraphStore,
    group_id: &str,
    raw_path: &str,
    content: &str,
    repo: Option<&str>,
    last_modified: Option<DateTime<Utc>>,
) -> Result<FileImport> {
    let path = normalize_path(raw_path)
        .ok_or_else(|| IngestError::InvalidRecord(format!("empty file path '{}'", raw_path)))?;
    let language = detect_language(&path);
    let repo = repo.map(str::to_string).or_else(|| infer_repo(&path));

    let file = store.merge_node(
        &NodeMerge::new(CODE_FILE_LABEL, keys::code_file(group_id, &path))
            .group(group_id)
            .name(path.clone())
            .properties(json!({
                "path": path,
                "repo": repo,
                "language": language,
                "hash": content_hash(content),
                "lines": content.lines().count(),
                "last_modified": last_modified.map(|t| t.to_rfc3339()),
            })),
    )?;

    let mut result = FileImport {
        file_id: file.id.clone(),
        symbols: 0,
        calls: 0,
        key_collisions: usize::from(file.collision.is_some()),
        parse_failure: None,
    };

    if language != "python" {
        return Ok(result);
    }

    let symbols = match try_parse_python_symbols(&path, content) {
        Ok(symbols) => symbols,
        Err(e) => {
            warn!("{}", e);
            result.parse_failure = Some(path);
            return Ok(result);
        }
    };

    let mut by_name: HashMap<&str, Vec<NodeId>> = HashMap::new();
    let mut symbol_ids = Vec::with_capacity(symbols.len());
    for symbol in &symbols {
        let outcome = merge_symbol(store, group_id, &path, symbol)?;
        if outcome.1 {
            result.key_collisions += 1;
        }
        store.merge_edge(&EdgeMerge::new(&file.id, &outcome.0, "CONTAINS"))?;
        by_name
            .entry(symbol.name.as_str())
            .or_default()
            .push(outcome.0.clone());
        symbol_ids.push(outcome.0);
        result.symbols += 1;
    }

    // Calls only resolve against definitions in this file and group.
    for (symbol, caller) in symbols.iter().zip(&symbol_ids) {
        for callee_name in &symbol.calls {
            let Some(targets) = by_name.get(callee_name.as_str()) else {
                continue;
            };
            for target in targets {
                store.merge_edge(&EdgeMerge::new(caller, target, "CALLS"))?;
                result.calls += 1;
            }
        }
    }

    debug!(
        "Imported {} ({} symbols, {} calls)",
        path, result.symbols, result.calls
    );
    Ok(result)
}

fn merge_symbol(
    store: &dyn GraphStore,
    group_id: &str,
    path: &str,
    symbol: &ParsedSymbol,
) -> Result<(NodeId, bool)> {
    let outcome = store.merge_node(
        &NodeMerge::new(
            CODE_SYMBOL_LABEL,
            keys::code_symbol(group_id, path, symbol.kind, &symbol.name),
        )
        .group(group_id)
        .name(symbol.name.clone())
        .properties(json!({
            "file_path": path,
            "name": symbol.name,
            "kind": symbol.kind.as_str(),
            "start_line": symbol.start_line,
            "end_line": symbol.end_line,
            "signature": symbol.signature,
        })),
    )?;
    Ok((outcome.id, outcome.collision.is_some()))
}

/// Walks `root` (honoring ignore files) and imports every file whose
/// extension is in `extensions`. Paths are stored relative to `root`.
pub fn import_directory(
    store: &dyn GraphStore,
    root: &Path,
    group_id: &str,
    repo: Option<&str>,
    extensions: &[String],
) -> Result<CodeImportSummary> {
    let wanted: Vec<String> = extensions
        .iter()
        .map(|e| e.trim_start_matches('.').to_lowercase())
        .collect();
    let mut summary = CodeImportSummary::default();

    for entry in WalkBuilder::new(root).build() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Walk error under {}: {}", root.display(), e);
                continue;
            }
        };
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }

        let path = entry.path();
        let matches = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| wanted.iter().any(|w| w.eq_ignore_ascii_case(e)))
            .unwrap_or(false);
        if !matches {
            continue;
        }

        let relative = path.strip_prefix(root).unwrap_or(path);
        let relative = relative.to_string_lossy();

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                warn!("Skipping unreadable {}: {}", relative, e);
                summary.skipped.push(relative.to_string());
                continue;
            }
        };
        let modified = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .map(DateTime::<Utc>::from);

        match import_source_file(store, group_id, &relative, &content, repo, modified) {
            Ok(file) => summary.absorb(file),
            Err(e) => {
                warn!("Import of {} failed: {}", relative, e);
                summary.failed.push(relative.to_string());
            }
        }
    }

    info!(
        "Imported {} files, {} symbols, {} calls from {}",
        summary.files,
        summary.symbols,
        summary.calls,
        root.display()
    );
    Ok(summary)
}

// ============================================================================
// Code-file metadata import
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SymbolEntry {
    Name(String),
    Detailed {
        name: String,
        #[serde(default)]
        kind: Option<String>,
        #[serde(default, alias = "line_start")]
        start_line: Option<u32>,
        #[serde(default, alias = "line_end")]
        end_line: Option<u32>,
        #[serde(default)]
        signature: Option<String>,
    },
}

/// Code-file description exported by an indexer that already did the parsing.
#[derive(Debug, Clone, Deserialize)]
pub struct CodeFileRecord {
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(alias = "path")]
    pub file_path: String,
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default, alias = "hash")]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub lines: Option<u32>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub symbols: Vec<SymbolEntry>,
}

/// Accepts `{"code_files": [...]}`, a bare list, or a single object.
pub fn import_code_json(store: &dyn GraphStore, raw: &str) -> Result<CodeImportSummary> {
    let value: Value = serde_json::from_str(raw)?;
    let items = match value {
        Value::Object(mut map) if map.contains_key("code_files") => {
            match map.remove("code_files") {
                Some(Value::Array(items)) => items,
                _ => {
                    return Err(IngestError::InvalidRecord(
                        "code_files must be a list".to_string(),
                    ))
                }
            }
        }
        Value::Array(items) => items,
        object @ Value::Object(_) => vec![object],
        _ => {
            return Err(IngestError::InvalidRecord(
                "code file export must be a JSON list or object".to_string(),
            ))
        }
    };

    let mut summary = CodeImportSummary::default();
    for (index, item) in items.into_iter().enumerate() {
        let record: CodeFileRecord = match serde_json::from_value(item) {
            Ok(record) => record,
            Err(e) => {
                warn!("Skipping code file entry {}: {}", index, e);
                summary.skipped.push(format!("#{}", index));
                continue;
            }
        };
        match import_code_record(store, &record) {
            Ok(file) => summary.absorb(file),
            Err(e) => {
                warn!("Import of {} failed: {}", record.file_path, e);
                summary.failed.push(record.file_path.clone());
            }
        }
    }
    Ok(summary)
}

fn import_code_record(store: &dyn GraphStore, record: &CodeFileRecord) -> Result<FileImport> {
    let group_id = clean_text(record.group_id.as_deref())
        .unwrap_or_else(|| DEFAULT_PROJECT_ID.to_string());
    let path = normalize_path(&record.file_path).ok_or_else(|| {
        IngestError::InvalidRecord(format!("empty file path '{}'", record.file_path))
    })?;

    let file = store.merge_node(
        &NodeMerge::new(CODE_FILE_LABEL, keys::code_file(&group_id, &path))
            .group(group_id.clone())
            .name(path.clone())
            .summary(clean_text(record.summary.as_deref()))
            .properties(json!({
                "path": path,
                "repo": record.repo.clone().or_else(|| infer_repo(&path)),
                "language": record.language.clone().unwrap_or_else(|| detect_language(&path)),
                "hash": record.content_hash,
                "lines": record.lines,
            })),
    )?;

    let mut result = FileImport {
        file_id: file.id.clone(),
        symbols: 0,
        calls: 0,
        key_collisions: usize::from(file.collision.is_some()),
        parse_failure: None,
    };

    for entry in &record.symbols {
        let symbol = match entry {
            SymbolEntry::Name(name) => ParsedSymbol {
                name: name.trim().to_string(),
                kind: SymbolKind::Function,
                start_line: 0,
                end_line: 0,
                signature: String::new(),
                calls: Vec::new(),
            },
            SymbolEntry::Detailed {
                name,
                kind,
                start_line,
                end_line,
                signature,
            } => {
                let kind = kind
                    .as_deref()
                    .and_then(SymbolKind::parse)
                    .unwrap_or(SymbolKind::Function);
                ParsedSymbol {
                    name: name.trim().to_string(),
                    kind,
                    start_line: start_line.unwrap_or(0),
                    end_line: end_line.or(*start_line).unwrap_or(0),
                    signature: signature.clone().unwrap_or_default(),
                    calls: Vec::new(),
                }
            }
        };
        if symbol.name.is_empty() {
            continue;
        }

        let (symbol_id, collided) = merge_symbol(store, &group_id, &path, &symbol)?;
        store.merge_edge(&EdgeMerge::new(&file.id, &symbol_id, "CONTAINS"))?;
        result.symbols += 1;
        if collided {
            result.key_collisions += 1;
        }
    }

    Ok(result)
}
