use chrono::{DateTime, Utc};
use memory_graph_ingestion::graph::{EdgeOutcome, MergeOutcome};
use memory_graph_ingestion::{
    ContextFileStats, ConversationFlow, Database, EdgeMerge, GraphEdge, GraphNode, GraphStore,
    IngestError, NodeAnnotation, NodeMerge, RequestSummary, Result, TimeWindow, ToolStats,
};
use memory_graph_schemas::NodeId;

/// Delegates to a real database but fails one relationship type on write
/// or one label on lookup.
#[allow(dead_code)]
pub struct FaultyStore {
    inner: Database,
    reject_edge: Option<&'static str>,
    fail_lookup: Option<&'static str>,
}

#[allow(dead_code)]
impl FaultyStore {
    pub fn rejecting(inner: Database, rel_type: &'static str) -> Self {
        Self {
            inner,
            reject_edge: Some(rel_type),
            fail_lookup: None,
        }
    }

    pub fn failing_lookups(inner: Database, label: &'static str) -> Self {
        Self {
            inner,
            reject_edge: None,
            fail_lookup: Some(label),
        }
    }
}

impl GraphStore for FaultyStore {
    fn get_node(&self, id: &NodeId) -> Result<Option<GraphNode>> {
        self.inner.get_node(id)
    }

    fn find_node(&self, label: &str, key: &str) -> Result<Option<GraphNode>> {
        if self.fail_lookup == Some(label) {
            return Err(IngestError::InvalidRecord(format!("{} lookup failed", label)));
        }
        self.inner.find_node(label, key)
    }

    fn find_by_property(
        &self,
        group_id: &str,
        label: &str,
        property: &str,
        value: &str,
    ) -> Result<Option<GraphNode>> {
        self.inner.find_by_property(group_id, label, property, value)
    }

    fn recent_entities(
        &self,
        group_id: &str,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<GraphNode>> {
        self.inner.recent_entities(group_id, since, limit)
    }

    fn merge_node(&self, merge: &NodeMerge) -> Result<MergeOutcome> {
        self.inner.merge_node(merge)
    }

    fn annotate_node(
        &self,
        id: &NodeId,
        annotation: &NodeAnnotation,
    ) -> Result<()> {
        self.inner.annotate_node(id, annotation)
    }

    fn merge_edge(&self, merge: &EdgeMerge) -> Result<EdgeOutcome> {
        if self.reject_edge == Some(merge.rel_type.as_str()) {
            return Err(IngestError::InvalidRecord(format!(
                "{} rejected by store",
                merge.rel_type
            )));
        }
        self.inner.merge_edge(merge)
    }

    fn edges_from(
        &self,
        id: &NodeId,
        rel_type: Option<&str>,
    ) -> Result<Vec<GraphEdge>> {
        self.inner.edges_from(id, rel_type)
    }

    fn edges_to(
        &self,
        id: &NodeId,
        rel_type: Option<&str>,
    ) -> Result<Vec<GraphEdge>> {
        self.inner.edges_to(id, rel_type)
    }

    fn count_nodes(&self, label: Option<&str>) -> Result<usize> {
        self.inner.count_nodes(label)
    }

    fn count_edges(&self, rel_type: Option<&str>) -> Result<usize> {
        self.inner.count_edges(rel_type)
    }

    fn label_counts(&self) -> Result<Vec<(String, usize)>> {
        self.inner.label_counts()
    }

    fn edge_type_counts(&self) -> Result<Vec<(String, usize)>> {
        self.inner.edge_type_counts()
    }

    fn search_requests(
        &self,
        group_id: &str,
        chat_id: Option<&str>,
        window: &TimeWindow,
    ) -> Result<Vec<RequestSummary>> {
        self.inner.search_requests(group_id, chat_id, window)
    }

    fn conversation_flow(&self, request_id: &str) -> Result<Option<ConversationFlow>> {
        self.inner.conversation_flow(request_id)
    }

    fn context_file_stats(
        &self,
        group_id: &str,
        window: &TimeWindow,
        limit: usize,
    ) -> Result<Vec<ContextFileStats>> {
        self.inner.context_file_stats(group_id, window, limit)
    }

    fn tool_statistics(&self, group_id: Option<&str>, window: &TimeWindow) -> Result<Vec<ToolStats>> {
        self.inner.tool_statistics(group_id, window)
    }
}

