use chrono::{DateTime, Utc};
use memory_graph_schemas::{EdgeId, NodeId};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{IngestError, Result};
use crate::queries::{ContextFileStats, ConversationFlow, RequestSummary, TimeWindow, ToolStats};

pub type Properties = Map<String, Value>;

/// Graph store shared by the correlator, builder and merger. Lock it per
/// logical operation and never across a sleep.
pub type SharedGraph = Arc<Mutex<dyn GraphStore>>;

pub fn shared<S: GraphStore + 'static>(store: S) -> SharedGraph {
    Arc::new(Mutex::new(store))
}

/// Property-graph operations the engine relies on. Every write is a merge:
/// nodes by `(label, key)`, edges by `(source, target, rel_type)`.
pub trait GraphStore: Send {
    fn get_node(&self, id: &NodeId) -> Result<Option<GraphNode>>;

    fn find_node(&self, label: &str, key: &str) -> Result<Option<GraphNode>>;

    /// First node in `group_id` carrying `label` whose string property equals `value`.
    fn find_by_property(
        &self,
        group_id: &str,
        label: &str,
        property: &str,
        value: &str,
    ) -> Result<Option<GraphNode>>;

    /// Extraction-owned entities in a group, newest first.
    fn recent_entities(
        &self,
        group_id: &str,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<GraphNode>>;

    fn merge_node(&self, merge: &NodeMerge) -> Result<MergeOutcome>;

    fn annotate_node(&self, id: &NodeId, annotation: &NodeAnnotation) -> Result<()>;

    fn merge_edge(&self, merge: &EdgeMerge) -> Result<EdgeOutcome>;

    fn edges_from(&self, id: &NodeId, rel_type: Option<&str>) -> Result<Vec<GraphEdge>>;

    fn edges_to(&self, id: &NodeId, rel_type: Option<&str>) -> Result<Vec<GraphEdge>>;

    fn count_nodes(&self, label: Option<&str>) -> Result<usize>;

    fn count_edges(&self, rel_type: Option<&str>) -> Result<usize>;

    /// `(label, count)` pairs, largest first.
    fn label_counts(&self) -> Result<Vec<(String, usize)>>;

    /// `(rel_type, count)` pairs, largest first.
    fn edge_type_counts(&self) -> Result<Vec<(String, usize)>>;

    /// Live requests of a group created inside `window`, newest first.
    fn search_requests(
        &self,
        group_id: &str,
        chat_id: Option<&str>,
        window: &TimeWindow,
    ) -> Result<Vec<RequestSummary>>;

    fn conversation_flow(&self, request_id: &str) -> Result<Option<ConversationFlow>>;

    /// Most used context files first, ties broken by average usefulness.
    fn context_file_stats(
        &self,
        group_id: &str,
        window: &TimeWindow,
        limit: usize,
    ) -> Result<Vec<ContextFileStats>>;

    /// Per-tool call counts across all groups unless `group_id` is given.
    fn tool_statistics(&self, group_id: Option<&str>, window: &TimeWindow) -> Result<Vec<ToolStats>>;
}

#[derive(Debug, Clone)]
pub struct GraphNode {
    pub id: NodeId,
    pub label: String,
    pub labels: Vec<String>,
    pub key: String,
    pub group_id: Option<String>,
    pub name: Option<String>,
    pub summary: Option<String>,
    pub properties: Properties,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl GraphNode {
    pub fn has_label(&self, label: &str) -> bool {
        self.label == label || self.labels.iter().any(|l| l == label)
    }

    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }

    pub fn property_i64(&self, key: &str) -> Option<i64> {
        self.properties.get(key).and_then(Value::as_i64)
    }

    pub fn property_f64(&self, key: &str) -> Option<f64> {
        self.properties.get(key).and_then(Value::as_f64)
    }
}

#[derive(Debug, Clone)]
pub struct GraphEdge {
    pub id: EdgeId,
    pub source: NodeId,
    pub target: NodeId,
    pub rel_type: String,
    pub properties: Properties,
    pub created_at: DateTime<Utc>,
}

impl GraphEdge {
    pub fn property_f64(&self, key: &str) -> Option<f64> {
        self.properties.get(key).and_then(Value::as_f64)
    }
}

/// Upsert of one node by natural key. `created_at` only applies on create;
/// `expires_at` never moves backwards.
#[derive(Debug, Clone, Default)]
pub struct NodeMerge {
    pub label: String,
    pub key: String,
    pub id: Option<NodeId>,
    pub group_id: Option<String>,
    pub name: Option<String>,
    pub summary: Option<String>,
    pub properties: Properties,
    pub created_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub extra_labels: Vec<String>,
}

impl NodeMerge {
    pub fn new(label: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            key: key.into(),
            ..Default::default()
        }
    }

    pub fn group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn summary(mut self, summary: Option<String>) -> Self {
        self.summary = summary;
        self
    }

    pub fn properties(mut self, value: Value) -> Self {
        self.properties = props(value);
        self
    }

    pub fn stamped(mut self, created_at: DateTime<Utc>, expires_at: Option<DateTime<Utc>>) -> Self {
        self.created_at = Some(created_at);
        self.expires_at = expires_at;
        self
    }

    pub fn with_id(mut self, id: NodeId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn also_labelled(mut self, label: impl Into<String>) -> Self {
        self.extra_labels.push(label.into());
        self
    }
}

/// Enrichment of an existing node: extra labels and patched properties.
#[derive(Debug, Clone, Default)]
pub struct NodeAnnotation {
    pub labels: Vec<String>,
    pub name: Option<String>,
    pub summary: Option<String>,
    pub properties: Properties,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct EdgeMerge {
    pub source: NodeId,
    pub target: NodeId,
    pub rel_type: String,
    pub properties: Properties,
}

impl EdgeMerge {
    pub fn new(source: &NodeId, target: &NodeId, rel_type: impl Into<String>) -> Self {
        Self {
            source: source.clone(),
            target: target.clone(),
            rel_type: rel_type.into(),
            properties: Properties::new(),
        }
    }

    pub fn properties(mut self, value: Value) -> Self {
        self.properties = props(value);
        self
    }
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub id: NodeId,
    pub created: bool,
    pub collision: Option<KeyCollision>,
}

/// A natural key that was already owned by another group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCollision {
    pub label: String,
    pub key: String,
    pub existing_group: String,
    pub incoming_group: String,
}

impl From<KeyCollision> for IngestError {
    fn from(c: KeyCollision) -> Self {
        IngestError::MergeKeyCollision {
            label: c.label,
            key: c.key,
            existing: c.existing_group,
            incoming: c.incoming_group,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EdgeOutcome {
    pub id: EdgeId,
    pub created: bool,
}

/// Turns a `json!({...})` object into a property map, dropping nulls so
/// unset optional fields never reach the store.
pub fn props(value: Value) -> Properties {
    match value {
        Value::Object(map) => map.into_iter().filter(|(_, v)| !v.is_null()).collect(),
        _ => Properties::new(),
    }
}

/// Natural keys shared by every ingestion path.
pub mod keys {
    use memory_graph_schemas::SymbolKind;

    pub fn message(group: &str, request_id: &str, sequence: u32) -> String {
        format!("{}/{}/message/{}", group, request_id, sequence)
    }

    pub fn context_file(
        group: &str,
        request_id: &str,
        path: &str,
        line_start: Option<u32>,
        line_end: Option<u32>,
    ) -> String {
        match (line_start, line_end) {
            (None, None) => format!("{}/{}/context/{}", group, request_id, path),
            (start, end) => format!(
                "{}/{}/context/{}:{}-{}",
                group,
                request_id,
                path,
                start.map(|v| v.to_string()).unwrap_or_default(),
                end.map(|v| v.to_string()).unwrap_or_default()
            ),
        }
    }

    pub fn tool_call(group: &str, request_id: &str, tool_call_id: &str) -> String {
        format!("{}/{}/tool/{}", group, request_id, tool_call_id)
    }

    pub fn checkpoint(group: &str, request_id: &str, checkpoint_id: &str) -> String {
        format!("{}/{}/checkpoint/{}", group, request_id, checkpoint_id)
    }

    pub fn request_change(group: &str, request_id: &str, ordinal: usize, path: &str) -> String {
        format!("{}/{}/change/{}/{}", group, request_id, ordinal, path)
    }

    pub fn code_file(group: &str, path: &str) -> String {
        format!("{}/{}", group, path)
    }

    pub fn code_symbol(group: &str, path: &str, kind: SymbolKind, name: &str) -> String {
        format!("{}/{}#{}:{}", group, path, kind.as_str(), name)
    }

    pub fn function(name: &str, path: &str) -> String {
        format!("{}@{}", name, path)
    }

    pub fn record_change(
        message_id: &str,
        path: &str,
        line_start: Option<u32>,
        line_end: Option<u32>,
    ) -> String {
        format!(
            "{}/{}/{}/{}",
            message_id,
            path,
            line_start.map(|v| v.to_string()).unwrap_or_default(),
            line_end.map(|v| v.to_string()).unwrap_or_default()
        )
    }
}
