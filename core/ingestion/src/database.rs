use chrono::{DateTime, SecondsFormat, Utc};
use memory_graph_schemas::{generate_edge_id, generate_node_id, EdgeId, NodeId};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::builder::{CONTEXT_FILE_LABEL, REQUEST_LABEL, TOOL_CALL_LABEL};
use crate::error::{IngestError, Result};
use crate::graph::{
    EdgeMerge, EdgeOutcome, GraphEdge, GraphNode, GraphStore, KeyCollision, MergeOutcome,
    NodeAnnotation, NodeMerge, Properties,
};
use crate::queries::{
    ContextFileStats, ConversationFlow, FlowMessage, RequestSummary, TimeWindow, ToolStats,
};

/// Primary label of nodes materialized by the extraction service.
pub const ENTITY_LABEL: &str = "Entity";

const NODE_COLUMNS: &str =
    "id, label, node_key, group_id, name, summary, properties, created_at, expires_at";

/// SQLite-backed property graph.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the graph file and make sure the schema exists
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;

        let db = Self { conn };
        db.init_schema()?;

        info!("Graph database initialized");
        Ok(db)
    }

    pub fn in_memory() -> Result<Self> {
        let db = Self {
            conn: Connection::open_in_memory()?,
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Create all tables and indexes
    fn init_schema(&self) -> Result<()> {
        // One row per node, unique on its natural key
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS nodes (
                id TEXT PRIMARY KEY,
                label TEXT NOT NULL,
                node_key TEXT NOT NULL,
                group_id TEXT,
                name TEXT,
                summary TEXT,
                properties TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                expires_at TEXT,
                updated_at TEXT NOT NULL,
                UNIQUE(label, node_key)
            )",
            [],
        )?;

        // Every label a node carries, the primary one included
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS node_labels (
                node_id TEXT NOT NULL,
                label TEXT NOT NULL,
                PRIMARY KEY (node_id, label),
                FOREIGN KEY (node_id) REFERENCES nodes(id) ON DELETE CASCADE
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS edges (
                id TEXT PRIMARY KEY,
                source_id TEXT NOT NULL,
                target_id TEXT NOT NULL,
                rel_type TEXT NOT NULL,
                properties TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(source_id, target_id, rel_type),
                FOREIGN KEY (source_id) REFERENCES nodes(id) ON DELETE CASCADE,
                FOREIGN KEY (target_id) REFERENCES nodes(id) ON DELETE CASCADE
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_nodes_group_created ON nodes(group_id, created_at DESC)",
            [],
        )?;
        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_node_labels_label ON node_labels(label)",
            [],
        )?;
        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_edges_source ON edges(source_id, rel_type)",
            [],
        )?;
        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(target_id, rel_type)",
            [],
        )?;

        Ok(())
    }

    fn node_exists(&self, id: &NodeId) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row("SELECT 1 FROM nodes WHERE id = ?1", params![id.0], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(found.is_some())
    }

    fn labels_for(&self, id: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT label FROM node_labels WHERE node_id = ?1 ORDER BY label")?;
        let labels = stmt
            .query_map(params![id], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(labels)
    }

    fn add_labels<'a>(&self, id: &str, labels: impl IntoIterator<Item = &'a String>) -> Result<()> {
        for label in labels {
            self.conn.execute(
                "INSERT OR IGNORE INTO node_labels (node_id, label) VALUES (?1, ?2)",
                params![id, label],
            )?;
        }
        Ok(())
    }

    fn with_labels(&self, node: Option<GraphNode>) -> Result<Option<GraphNode>> {
        match node {
            Some(mut node) => {
                node.labels = self.labels_for(&node.id.0)?;
                Ok(Some(node))
            }
            None => Ok(None),
        }
    }

    /// Properties of the nodes `root` points at through `rel_type`, in
    /// insertion order.
    fn child_properties(&self, root: &NodeId, rel_type: &str) -> Result<Vec<Properties>> {
        let mut stmt = self.conn.prepare(
            "SELECT c.properties FROM edges e
             JOIN nodes c ON c.id = e.target_id
             WHERE e.source_id = ?1 AND e.rel_type = ?2
             ORDER BY c.rowid",
        )?;
        let children = stmt
            .query_map(params![root.0, rel_type], |row| {
                let raw: String = row.get(0)?;
                parse_properties(0, &raw)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(children)
    }

    fn query_edges(&self, sql: &str, id: &NodeId, rel_type: Option<&str>) -> Result<Vec<GraphEdge>> {
        let mut stmt = self.conn.prepare(sql)?;
        let edges = stmt
            .query_map(params![id.0, rel_type], row_to_edge)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(edges)
    }
}

impl GraphStore for Database {
    fn get_node(&self, id: &NodeId) -> Result<Option<GraphNode>> {
        let node = self
            .conn
            .query_row(
                &format!("SELECT {} FROM nodes WHERE id = ?1", NODE_COLUMNS),
                params![id.0],
                row_to_node,
            )
            .optional()?;
        self.with_labels(node)
    }

    fn find_node(&self, label: &str, key: &str) -> Result<Option<GraphNode>> {
        let node = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM nodes WHERE label = ?1 AND node_key = ?2",
                    NODE_COLUMNS
                ),
                params![label, key],
                row_to_node,
            )
            .optional()?;
        self.with_labels(node)
    }

    fn find_by_property(
        &self,
        group_id: &str,
        label: &str,
        property: &str,
        value: &str,
    ) -> Result<Option<GraphNode>> {
        let node = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM nodes n
                     WHERE n.group_id = ?1
                       AND EXISTS (SELECT 1 FROM node_labels l WHERE l.node_id = n.id AND l.label = ?2)
                       AND json_extract(n.properties, '$.' || ?3) = ?4
                     ORDER BY n.created_at DESC
                     LIMIT 1",
                    NODE_COLUMNS
                ),
                params![group_id, label, property, value],
                row_to_node,
            )
            .optional()?;
        self.with_labels(node)
    }

    fn recent_entities(
        &self,
        group_id: &str,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<GraphNode>> {
        let since = since.as_ref().map(format_ts);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM nodes
             WHERE label = ?1 AND group_id = ?2 AND (?3 IS NULL OR created_at >= ?3)
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?4",
            NODE_COLUMNS
        ))?;
        let nodes = stmt
            .query_map(
                params![ENTITY_LABEL, group_id, since, limit as i64],
                row_to_node,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut result = Vec::with_capacity(nodes.len());
        for node in nodes {
            if let Some(node) = self.with_labels(Some(node))? {
                result.push(node);
            }
        }
        Ok(result)
    }

    fn merge_node(&self, merge: &NodeMerge) -> Result<MergeOutcome> {
        let now = format_ts(&Utc::now());
        let properties = serde_json::to_string(&merge.properties)?;
        let expires_at = merge.expires_at.as_ref().map(format_ts);

        let existing: Option<(String, Option<String>)> = self
            .conn
            .query_row(
                "SELECT id, group_id FROM nodes WHERE label = ?1 AND node_key = ?2",
                params![merge.label, merge.key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let outcome = match existing {
            Some((id, existing_group)) => {
                let collision = match (existing_group, merge.group_id.as_ref()) {
                    (Some(existing), Some(incoming)) if &existing != incoming => {
                        let collision = KeyCollision {
                            label: merge.label.clone(),
                            key: merge.key.clone(),
                            existing_group: existing,
                            incoming_group: incoming.clone(),
                        };
                        warn!("{}", IngestError::from(collision.clone()));
                        Some(collision)
                    }
                    _ => None,
                };

                self.conn.execute(
                    "UPDATE nodes SET
                        group_id = COALESCE(?2, group_id),
                        name = COALESCE(?3, name),
                        summary = COALESCE(?4, summary),
                        properties = json_patch(properties, ?5),
                        expires_at = CASE
                            WHEN ?6 IS NULL THEN expires_at
                            WHEN expires_at IS NULL OR expires_at < ?6 THEN ?6
                            ELSE expires_at
                        END,
                        updated_at = ?7
                     WHERE id = ?1",
                    params![
                        id,
                        merge.group_id,
                        merge.name,
                        merge.summary,
                        properties,
                        expires_at,
                        now
                    ],
                )?;
                debug!("Merged {} {} into {}", merge.label, merge.key, id);

                MergeOutcome {
                    id: NodeId(id),
                    created: false,
                    collision,
                }
            }
            None => {
                let id = merge.id.clone().unwrap_or_else(generate_node_id);
                let created_at = merge
                    .created_at
                    .as_ref()
                    .map(format_ts)
                    .unwrap_or_else(|| now.clone());

                self.conn.execute(
                    "INSERT INTO nodes (id, label, node_key, group_id, name, summary, properties, created_at, expires_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        id.0,
                        merge.label,
                        merge.key,
                        merge.group_id,
                        merge.name,
                        merge.summary,
                        properties,
                        created_at,
                        expires_at,
                        now
                    ],
                )?;
                debug!("Created {} {} as {}", merge.label, merge.key, id);

                MergeOutcome {
                    id,
                    created: true,
                    collision: None,
                }
            }
        };

        self.add_labels(
            &outcome.id.0,
            std::iter::once(&merge.label).chain(merge.extra_labels.iter()),
        )?;

        Ok(outcome)
    }

    fn annotate_node(&self, id: &NodeId, annotation: &NodeAnnotation) -> Result<()> {
        let properties = serde_json::to_string(&annotation.properties)?;
        let expires_at = annotation.expires_at.as_ref().map(format_ts);

        let updated = self.conn.execute(
            "UPDATE nodes SET
                name = COALESCE(?2, name),
                summary = COALESCE(?3, summary),
                properties = json_patch(properties, ?4),
                expires_at = CASE
                    WHEN ?5 IS NULL THEN expires_at
                    WHEN expires_at IS NULL OR expires_at < ?5 THEN ?5
                    ELSE expires_at
                END,
                updated_at = ?6
             WHERE id = ?1",
            params![
                id.0,
                annotation.name,
                annotation.summary,
                properties,
                expires_at,
                format_ts(&Utc::now())
            ],
        )?;

        if updated == 0 {
            return Err(IngestError::MissingNode(id.0.clone()));
        }

        self.add_labels(&id.0, annotation.labels.iter())
    }

    fn merge_edge(&self, merge: &EdgeMerge) -> Result<EdgeOutcome> {
        for endpoint in [&merge.source, &merge.target] {
            if !self.node_exists(endpoint)? {
                return Err(IngestError::MissingNode(endpoint.0.clone()));
            }
        }

        let now = format_ts(&Utc::now());
        let properties = serde_json::to_string(&merge.properties)?;

        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT id FROM edges WHERE source_id = ?1 AND target_id = ?2 AND rel_type = ?3",
                params![merge.source.0, merge.target.0, merge.rel_type],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(id) => {
                self.conn.execute(
                    "UPDATE edges SET properties = json_patch(properties, ?2), updated_at = ?3
                     WHERE id = ?1",
                    params![id, properties, now],
                )?;
                Ok(EdgeOutcome {
                    id: EdgeId(id),
                    created: false,
                })
            }
            None => {
                let id = generate_edge_id();
                self.conn.execute(
                    "INSERT INTO edges (id, source_id, target_id, rel_type, properties, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                    params![
                        id.0,
                        merge.source.0,
                        merge.target.0,
                        merge.rel_type,
                        properties,
                        now
                    ],
                )?;
                debug!(
                    "Created edge {} -[{}]-> {}",
                    merge.source, merge.rel_type, merge.target
                );
                Ok(EdgeOutcome { id, created: true })
            }
        }
    }

    fn edges_from(&self, id: &NodeId, rel_type: Option<&str>) -> Result<Vec<GraphEdge>> {
        self.query_edges(
            "SELECT id, source_id, target_id, rel_type, properties, created_at FROM edges
             WHERE source_id = ?1 AND (?2 IS NULL OR rel_type = ?2)
             ORDER BY created_at, rowid",
            id,
            rel_type,
        )
    }

    fn edges_to(&self, id: &NodeId, rel_type: Option<&str>) -> Result<Vec<GraphEdge>> {
        self.query_edges(
            "SELECT id, source_id, target_id, rel_type, properties, created_at FROM edges
             WHERE target_id = ?1 AND (?2 IS NULL OR rel_type = ?2)
             ORDER BY created_at, rowid",
            id,
            rel_type,
        )
    }

    fn count_nodes(&self, label: Option<&str>) -> Result<usize> {
        let count: i64 = match label {
            Some(label) => self.conn.query_row(
                "SELECT COUNT(DISTINCT node_id) FROM node_labels WHERE label = ?1",
                params![label],
                |row| row.get(0),
            )?,
            None => self
                .conn
                .query_row("SELECT COUNT(*) FROM nodes", [], |row| row.get(0))?,
        };
        Ok(count as usize)
    }

    fn count_edges(&self, rel_type: Option<&str>) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM edges WHERE (?1 IS NULL OR rel_type = ?1)",
            params![rel_type],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn label_counts(&self) -> Result<Vec<(String, usize)>> {
        let mut stmt = self.conn.prepare(
            "SELECT label, COUNT(*) AS c FROM node_labels GROUP BY label ORDER BY c DESC, label",
        )?;
        let counts = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(counts)
    }

    fn edge_type_counts(&self) -> Result<Vec<(String, usize)>> {
        let mut stmt = self.conn.prepare(
            "SELECT rel_type, COUNT(*) AS c FROM edges GROUP BY rel_type ORDER BY c DESC, rel_type",
        )?;
        let counts = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(counts)
    }

    fn search_requests(
        &self,
        group_id: &str,
        chat_id: Option<&str>,
        window: &TimeWindow,
    ) -> Result<Vec<RequestSummary>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM nodes n
             WHERE n.group_id = ?1
               AND EXISTS (SELECT 1 FROM node_labels l WHERE l.node_id = n.id AND l.label = ?2)
               AND n.created_at >= ?3
               AND (n.expires_at IS NULL OR n.expires_at > ?4)
               AND (?5 IS NULL OR json_extract(n.properties, '$.chat_id') = ?5)
             ORDER BY n.created_at DESC, n.rowid DESC",
            NODE_COLUMNS
        ))?;
        let nodes = stmt
            .query_map(
                params![
                    group_id,
                    REQUEST_LABEL,
                    format_ts(&window.since),
                    format_ts(&window.now),
                    chat_id
                ],
                row_to_node,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(nodes.iter().map(RequestSummary::from_node).collect())
    }

    fn conversation_flow(&self, request_id: &str) -> Result<Option<ConversationFlow>> {
        let root = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM nodes n
                     WHERE EXISTS (SELECT 1 FROM node_labels l WHERE l.node_id = n.id AND l.label = ?1)
                       AND json_extract(n.properties, '$.request_id') = ?2
                     ORDER BY n.created_at DESC
                     LIMIT 1",
                    NODE_COLUMNS
                ),
                params![REQUEST_LABEL, request_id],
                row_to_node,
            )
            .optional()?;
        let Some(root) = root else {
            return Ok(None);
        };

        // Messages come back in insertion order; the flow is by sequence
        let mut messages: Vec<FlowMessage> = self
            .child_properties(&root.id, "CONTAINS_MESSAGE")?
            .iter()
            .map(|props| FlowMessage {
                sequence: props.get("sequence").and_then(Value::as_i64).unwrap_or(0),
                role: text(props, "role").unwrap_or_else(|| "unknown".to_string()),
                content_summary: text(props, "content_summary"),
            })
            .collect();
        messages.sort_by_key(|m| m.sequence);

        let context_files = self
            .child_properties(&root.id, "USES_CONTEXT")?
            .iter()
            .filter_map(|props| text(props, "file_path"))
            .collect();
        let tools = self
            .child_properties(&root.id, "INVOKES_TOOL")?
            .iter()
            .filter_map(|props| text(props, "tool_name"))
            .collect();

        let count = |key: &str| root.property_i64(key).unwrap_or(0).max(0) as usize;
        Ok(Some(ConversationFlow {
            request: RequestSummary::from_node(&root),
            summary: root.summary.clone(),
            message_count: count("message_count"),
            context_file_count: count("context_file_count"),
            tool_call_count: count("tool_call_count"),
            messages,
            context_files,
            tools,
        }))
    }

    fn context_file_stats(
        &self,
        group_id: &str,
        window: &TimeWindow,
        limit: usize,
    ) -> Result<Vec<ContextFileStats>> {
        let mut stmt = self.conn.prepare(
            "SELECT properties FROM nodes
             WHERE label = ?1 AND group_id = ?2 AND created_at >= ?3
               AND (expires_at IS NULL OR expires_at > ?4)",
        )?;
        let rows = stmt
            .query_map(
                params![
                    CONTEXT_FILE_LABEL,
                    group_id,
                    format_ts(&window.since),
                    format_ts(&window.now)
                ],
                |row| {
                    let raw: String = row.get(0)?;
                    parse_properties(0, &raw)
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        // One ContextFile node per request, so usage is a node count
        let mut usage: HashMap<(String, String), (usize, f64, BTreeSet<String>)> = HashMap::new();
        for props in &rows {
            let Some(path) = text(props, "file_path") else {
                continue;
            };
            let source = text(props, "source").unwrap_or_else(|| "unknown".to_string());
            let entry = usage.entry((path, source)).or_default();
            entry.0 += 1;
            entry.1 += props.get("usefulness").and_then(Value::as_f64).unwrap_or(0.0);
            if let Some(Value::Array(symbols)) = props.get("symbols") {
                entry
                    .2
                    .extend(symbols.iter().filter_map(Value::as_str).map(str::to_string));
            }
        }

        let mut stats: Vec<ContextFileStats> = usage
            .into_iter()
            .map(|((file_path, source), (count, total, symbols))| ContextFileStats {
                file_path,
                source,
                usage_count: count,
                avg_usefulness: total / count as f64,
                symbols: symbols.into_iter().collect(),
            })
            .collect();
        stats.sort_by(|a, b| {
            b.usage_count
                .cmp(&a.usage_count)
                .then(b.avg_usefulness.total_cmp(&a.avg_usefulness))
                .then_with(|| a.file_path.cmp(&b.file_path))
        });
        stats.truncate(limit);
        Ok(stats)
    }

    fn tool_statistics(&self, group_id: Option<&str>, window: &TimeWindow) -> Result<Vec<ToolStats>> {
        let mut stmt = self.conn.prepare(
            "SELECT COALESCE(json_extract(properties, '$.tool_name'), 'unknown') AS tool,
                    COUNT(*) AS total,
                    SUM(CASE WHEN json_extract(properties, '$.status') = 'success' THEN 1 ELSE 0 END),
                    AVG(json_extract(properties, '$.execution_time_ms'))
             FROM nodes
             WHERE label = ?1 AND (?2 IS NULL OR group_id = ?2) AND created_at >= ?3
               AND (expires_at IS NULL OR expires_at > ?4)
             GROUP BY tool
             ORDER BY total DESC, tool",
        )?;
        let stats = stmt
            .query_map(
                params![
                    TOOL_CALL_LABEL,
                    group_id,
                    format_ts(&window.since),
                    format_ts(&window.now)
                ],
                |row| {
                    let total: i64 = row.get(1)?;
                    let successful: i64 = row.get(2)?;
                    Ok(ToolStats {
                        tool_name: row.get(0)?,
                        total_calls: total as usize,
                        successful_calls: successful as usize,
                        success_rate: successful as f64 * 100.0 / total as f64,
                        avg_execution_time_ms: row.get(3)?,
                    })
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(stats)
    }
}

fn text(props: &Properties, key: &str) -> Option<String> {
    props.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Fixed-width RFC 3339 so lexical order in SQLite equals time order.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_properties(idx: usize, raw: &str) -> rusqlite::Result<Properties> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_node(row: &Row) -> rusqlite::Result<GraphNode> {
    let properties: String = row.get(6)?;
    let created_at: String = row.get(7)?;
    let expires_at: Option<String> = row.get(8)?;

    Ok(GraphNode {
        id: NodeId(row.get(0)?),
        label: row.get(1)?,
        labels: Vec::new(),
        key: row.get(2)?,
        group_id: row.get(3)?,
        name: row.get(4)?,
        summary: row.get(5)?,
        properties: parse_properties(6, &properties)?,
        created_at: parse_ts(7, &created_at)?,
        expires_at: expires_at.map(|raw| parse_ts(8, &raw)).transpose()?,
    })
}

fn row_to_edge(row: &Row) -> rusqlite::Result<GraphEdge> {
    let properties: String = row.get(4)?;
    let created_at: String = row.get(5)?;

    Ok(GraphEdge {
        id: EdgeId(row.get(0)?),
        source: NodeId(row.get(1)?),
        target: NodeId(row.get(2)?),
        rel_type: row.get(3)?,
        properties: parse_properties(4, &properties)?,
        created_at: parse_ts(5, &created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use tempfile::NamedTempFile;

    fn entity(db: &Database, uuid: &str, group: &str, created_at: DateTime<Utc>) -> NodeId {
        db.merge_node(
            &NodeMerge::new(ENTITY_LABEL, uuid)
                .with_id(NodeId(uuid.to_string()))
                .group(group)
                .name(format!("entity {}", uuid))
                .stamped(created_at, None),
        )
        .unwrap()
        .id
    }

    #[test]
    fn test_database_creation() {
        let temp = NamedTempFile::new().unwrap();
        let db = Database::new(temp.path()).unwrap();

        assert_eq!(db.count_nodes(None).unwrap(), 0);
        assert_eq!(db.count_edges(None).unwrap(), 0);
    }

    #[test]
    fn test_merge_node_is_idempotent_and_keeps_latest_values() {
        let db = Database::in_memory().unwrap();

        let first = db
            .merge_node(
                &NodeMerge::new("File", "src/a.py")
                    .group("g")
                    .properties(json!({"language": "python", "lines": 10})),
            )
            .unwrap();
        let second = db
            .merge_node(
                &NodeMerge::new("File", "src/a.py")
                    .group("g")
                    .properties(json!({"lines": 12})),
            )
            .unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.id, second.id);
        assert_eq!(db.count_nodes(Some("File")).unwrap(), 1);

        let node = db.get_node(&first.id).unwrap().unwrap();
        assert_eq!(node.property_i64("lines"), Some(12));
        assert_eq!(node.property_str("language"), Some("python"));
    }

    #[test]
    fn test_merge_node_reports_cross_group_collision() {
        let db = Database::in_memory().unwrap();

        db.merge_node(&NodeMerge::new("Concept", "auth").group("a"))
            .unwrap();
        let outcome = db
            .merge_node(&NodeMerge::new("Concept", "auth").group("b"))
            .unwrap();

        let collision = outcome.collision.unwrap();
        assert_eq!(collision.existing_group, "a");
        assert_eq!(collision.incoming_group, "b");

        // last write wins
        let node = db.get_node(&outcome.id).unwrap().unwrap();
        assert_eq!(node.group_id.as_deref(), Some("b"));
    }

    #[test]
    fn test_expires_at_never_moves_backwards() {
        let db = Database::in_memory().unwrap();
        let now = Utc::now();

        let id = db
            .merge_node(&NodeMerge::new("Message", "m").stamped(now, Some(now + Duration::hours(48))))
            .unwrap()
            .id;
        db.merge_node(&NodeMerge::new("Message", "m").stamped(now, Some(now + Duration::hours(1))))
            .unwrap();

        let node = db.get_node(&id).unwrap().unwrap();
        assert_eq!(
            format_ts(&node.expires_at.unwrap()),
            format_ts(&(now + Duration::hours(48)))
        );
        assert_eq!(format_ts(&node.created_at), format_ts(&now));
    }

    #[test]
    fn test_merge_edge_deduplicates_and_patches() {
        let db = Database::in_memory().unwrap();
        let a = db.merge_node(&NodeMerge::new("A", "a")).unwrap().id;
        let b = db.merge_node(&NodeMerge::new("B", "b")).unwrap().id;

        let first = db
            .merge_edge(&EdgeMerge::new(&a, &b, "LINKS").properties(json!({"score": 0.5})))
            .unwrap();
        let second = db
            .merge_edge(&EdgeMerge::new(&a, &b, "LINKS").properties(json!({"score": 0.9})))
            .unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(db.count_edges(Some("LINKS")).unwrap(), 1);

        let edges = db.edges_from(&a, Some("LINKS")).unwrap();
        assert_eq!(edges[0].property_f64("score"), Some(0.9));
        assert_eq!(db.edges_to(&b, None).unwrap().len(), 1);
    }

    #[test]
    fn test_merge_edge_requires_both_endpoints() {
        let db = Database::in_memory().unwrap();
        let a = db.merge_node(&NodeMerge::new("A", "a")).unwrap().id;

        let err = db
            .merge_edge(&EdgeMerge::new(&a, &NodeId("ghost".into()), "LINKS"))
            .unwrap_err();
        assert!(matches!(err, IngestError::MissingNode(id) if id == "ghost"));
    }

    #[test]
    fn test_recent_entities_window_and_order() {
        let db = Database::in_memory().unwrap();
        let now = Utc::now();

        entity(&db, "old", "g", now - Duration::minutes(10));
        entity(&db, "newer", "g", now - Duration::seconds(5));
        entity(&db, "newest", "g", now);
        entity(&db, "elsewhere", "other", now);
        // typed children written by the engine are never candidates
        db.merge_node(&NodeMerge::new("Message", "g/r/message/0").group("g").stamped(now, None))
            .unwrap();

        let windowed = db
            .recent_entities("g", Some(now - Duration::seconds(30)), 10)
            .unwrap();
        let ids: Vec<&str> = windowed.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["newest", "newer"]);

        let all = db.recent_entities("g", None, 1).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id.as_str(), "newest");
    }

    #[test]
    fn test_annotate_adds_labels_and_lookup_by_property() {
        let db = Database::in_memory().unwrap();
        let id = entity(&db, "e1", "g", Utc::now());

        let mut annotation = NodeAnnotation {
            labels: vec!["Request".into()],
            name: Some("Conversation c1".into()),
            ..Default::default()
        };
        annotation
            .properties
            .insert("request_id".into(), json!("req-1"));
        db.annotate_node(&id, &annotation).unwrap();

        let found = db
            .find_by_property("g", "Request", "request_id", "req-1")
            .unwrap()
            .unwrap();
        assert_eq!(found.id, id);
        assert!(found.has_label("Request"));
        assert!(found.has_label(ENTITY_LABEL));
        assert_eq!(found.name.as_deref(), Some("Conversation c1"));

        assert!(db
            .find_by_property("other", "Request", "request_id", "req-1")
            .unwrap()
            .is_none());
        assert!(db
            .annotate_node(&NodeId("missing".into()), &annotation)
            .is_err());
    }

    #[test]
    fn test_label_and_edge_type_counts() {
        let db = Database::in_memory().unwrap();
        let a = db.merge_node(&NodeMerge::new("File", "a")).unwrap().id;
        let b = db.merge_node(&NodeMerge::new("File", "b")).unwrap().id;
        db.merge_edge(&EdgeMerge::new(&a, &b, "IMPORTS")).unwrap();

        assert_eq!(db.label_counts().unwrap(), vec![("File".to_string(), 2)]);
        assert_eq!(
            db.edge_type_counts().unwrap(),
            vec![("IMPORTS".to_string(), 1)]
        );
    }
}
