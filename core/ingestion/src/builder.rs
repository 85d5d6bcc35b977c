use chrono::{DateTime, Utc};
use memory_graph_schemas::{
    CheckpointPayload, CodeChangePayload, ContextFilePayload, ConversationContext, IngestStatus,
    MessagePayload, NodeId, ToolCallPayload,
};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::code_import::{detect_language, infer_repo, CODE_FILE_LABEL};
use crate::config::TtlPolicy;
use crate::error::{IngestError, Result};
use crate::extraction::conversation_summary;
use crate::graph::{keys, props, EdgeMerge, GraphStore, NodeAnnotation, NodeMerge};
use crate::normalize::{clean_text, normalize_path};

pub const REQUEST_LABEL: &str = "Request";
pub const MESSAGE_LABEL: &str = "Message";
pub const CONTEXT_FILE_LABEL: &str = "ContextFile";
pub const TOOL_CALL_LABEL: &str = "ToolCall";

/// One typed child of a request. Each variant carries its own field schema
/// and maps to its own label and root relationship.
#[derive(Debug, Clone, Copy)]
pub enum ChildEntity<'a> {
    Message(&'a MessagePayload),
    ContextFile(&'a ContextFilePayload),
    ToolCall(&'a ToolCallPayload),
    Checkpoint(&'a CheckpointPayload),
    CodeChange {
        ordinal: usize,
        change: &'a CodeChangePayload,
    },
}

impl<'a> ChildEntity<'a> {
    /// Children in build order. Tool calls precede code changes so
    /// `GENERATED_DIFF` can resolve them.
    pub fn from_context(ctx: &'a ConversationContext) -> Vec<ChildEntity<'a>> {
        let mut children = Vec::new();
        children.extend(ctx.messages.iter().map(ChildEntity::Message));
        children.extend(ctx.context_files.iter().map(ChildEntity::ContextFile));
        children.extend(ctx.tool_calls.iter().map(ChildEntity::ToolCall));
        children.extend(ctx.checkpoints.iter().map(ChildEntity::Checkpoint));
        children.extend(
            ctx.code_changes
                .iter()
                .enumerate()
                .map(|(ordinal, change)| ChildEntity::CodeChange { ordinal, change }),
        );
        children
    }

    pub fn label(&self) -> &'static str {
        match self {
            ChildEntity::Message(_) => MESSAGE_LABEL,
            ChildEntity::ContextFile(_) => CONTEXT_FILE_LABEL,
            ChildEntity::ToolCall(_) => TOOL_CALL_LABEL,
            ChildEntity::Checkpoint(_) => "Checkpoint",
            ChildEntity::CodeChange { .. } => "CodeChange",
        }
    }

    pub fn root_relationship(&self) -> &'static str {
        match self {
            ChildEntity::Message(_) => "CONTAINS_MESSAGE",
            ChildEntity::ContextFile(_) => "USES_CONTEXT",
            ChildEntity::ToolCall(_) => "INVOKES_TOOL",
            ChildEntity::Checkpoint(_) => "HAS_CHECKPOINT",
            ChildEntity::CodeChange { .. } => "APPLIED_CODE_CHANGE",
        }
    }

    pub fn natural_key(&self, group: &str, request_id: &str) -> String {
        match self {
            ChildEntity::Message(m) => keys::message(group, request_id, m.sequence),
            ChildEntity::ContextFile(f) => keys::context_file(
                group,
                request_id,
                &path_or_raw(&f.file_path),
                f.line_start,
                f.line_end,
            ),
            ChildEntity::ToolCall(t) => keys::tool_call(group, request_id, t.tool_call_id.trim()),
            ChildEntity::Checkpoint(c) => {
                keys::checkpoint(group, request_id, c.checkpoint_id.trim())
            }
            ChildEntity::CodeChange { ordinal, change } => keys::request_change(
                group,
                request_id,
                *ordinal,
                &change
                    .file_path
                    .as_deref()
                    .and_then(normalize_path)
                    .unwrap_or_default(),
            ),
        }
    }

    fn node(&self, key: String, group: &str, request_id: &str) -> NodeMerge {
        let merge = NodeMerge::new(self.label(), key).group(group);
        match self {
            ChildEntity::Message(m) => merge
                .name(format!("{} message {}", m.role, m.sequence))
                .summary(clean_text(m.content_summary.as_deref()))
                .properties(json!({
                    "request_id": request_id,
                    "role": m.role,
                    "sequence": m.sequence,
                    "content_summary": m.content_summary,
                    "content_hash": m.content_hash,
                    "prompt_tokens": m.prompt_tokens,
                    "completion_tokens": m.completion_tokens,
                    "total_tokens": m.total_tokens,
                })),
            ChildEntity::ContextFile(f) => {
                let path = path_or_raw(&f.file_path);
                merge.name(path.clone()).properties(json!({
                    "request_id": request_id,
                    "file_path": path,
                    "line_start": f.line_start,
                    "line_end": f.line_end,
                    "usefulness": f.usefulness,
                    "source": f.source,
                    "symbols": (!f.symbols.is_empty()).then_some(&f.symbols),
                    "content_hash": f.content_hash,
                    "language": f.language,
                }))
            }
            ChildEntity::ToolCall(t) => merge.name(t.tool_name.clone()).properties(json!({
                "request_id": request_id,
                "tool_call_id": t.tool_call_id.trim(),
                "tool_name": t.tool_name,
                "arguments_hash": t.arguments_hash,
                "status": t.status,
                "execution_time_ms": t.execution_time_ms,
                "diff_chunk_id": t.diff_chunk_id,
            })),
            ChildEntity::Checkpoint(c) => merge
                .name(format!("checkpoint {}", c.checkpoint_id.trim()))
                .properties(json!({
                    "request_id": request_id,
                    "checkpoint_id": c.checkpoint_id.trim(),
                    "parent_checkpoint": c.parent_checkpoint,
                    "workspace_dir": c.workspace_dir.as_deref().and_then(normalize_path),
                    "git_hash": c.git_hash,
                })),
            ChildEntity::CodeChange { change, .. } => {
                let path = change.file_path.as_deref().and_then(normalize_path);
                merge
                    .name(
                        change
                            .name
                            .clone()
                            .or_else(|| path.clone())
                            .unwrap_or_else(|| "code change".to_string()),
                    )
                    .summary(clean_text(change.change_summary.as_deref()))
                    .properties(json!({
                        "request_id": request_id,
                        "file_path": path,
                        "name": change.name,
                        "change_type": change.change_type,
                        "change_summary": change.change_summary,
                        "severity": change.severity,
                        "code_before_hash": change.code_before_hash,
                        "code_after_hash": change.code_after_hash,
                        "lines_added": change.lines_added,
                        "lines_removed": change.lines_removed,
                        "diff_summary": change.diff_summary,
                        "language": change.language,
                        "imports": (!change.imports.is_empty()).then_some(&change.imports),
                        "tool_call_id": change.tool_call_id,
                        "diff_chunk_id": change.diff_chunk_id,
                        "timestamp": change.timestamp.map(|t| t.to_rfc3339()),
                    }))
            }
        }
    }

    /// Salient properties copied onto the root relationship.
    fn root_edge_properties(&self) -> serde_json::Value {
        match self {
            ChildEntity::Message(m) => json!({"sequence": m.sequence, "role": m.role}),
            ChildEntity::ContextFile(f) => json!({"usefulness": f.usefulness, "source": f.source}),
            ChildEntity::ToolCall(t) => {
                json!({"status": t.status, "execution_time_ms": t.execution_time_ms})
            }
            ChildEntity::Checkpoint(c) => json!({"parent_checkpoint": c.parent_checkpoint}),
            ChildEntity::CodeChange { change, .. } => {
                json!({"change_type": change.change_type, "severity": change.severity})
            }
        }
    }
}

fn path_or_raw(path: &str) -> String {
    normalize_path(path).unwrap_or_else(|| path.trim().to_string())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChildFailure {
    pub kind: &'static str,
    pub key: String,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct BuildReport {
    pub status: IngestStatus,
    pub root: NodeId,
    pub children: usize,
    pub relationships: usize,
    pub expires_at: DateTime<Utc>,
    pub partial_failures: Vec<ChildFailure>,
}

/// Builds the typed provenance graph around a correlated root entity.
pub struct RequestGraphBuilder {
    ttl: TtlPolicy,
}

impl RequestGraphBuilder {
    pub fn new(ttl: TtlPolicy) -> Self {
        Self { ttl }
    }

    pub fn expires_at(&self, ctx: &ConversationContext) -> DateTime<Utc> {
        ctx.timestamp + self.ttl.ttl_for(&ctx.project_id)
    }

    /// Labels the root as a `Request` and stores the request metadata on it.
    pub fn annotate_root(
        &self,
        store: &dyn GraphStore,
        root: &NodeId,
        ctx: &ConversationContext,
    ) -> Result<()> {
        let total_tokens = ctx
            .messages
            .iter()
            .max_by_key(|m| m.sequence)
            .and_then(|m| m.total_tokens)
            .unwrap_or(0);
        let expires_at = self.expires_at(ctx);

        let annotation = NodeAnnotation {
            labels: vec![REQUEST_LABEL.to_string()],
            name: Some(format!("Conversation {}", ctx.chat_meta.chat_id)),
            summary: Some(conversation_summary(ctx)),
            properties: props(json!({
                "request_id": ctx.request_id,
                "project_id": ctx.project_id,
                "chat_id": ctx.chat_meta.chat_id,
                "base_chat_id": ctx.chat_meta.base_chat_id,
                "request_attempt_id": ctx.chat_meta.request_attempt_id,
                "chat_mode": ctx.chat_meta.chat_mode,
                "model": ctx.model.as_deref().unwrap_or("unknown"),
                "total_tokens": total_tokens,
                "message_count": ctx.messages.len(),
                "context_file_count": ctx.context_files.len(),
                "tool_call_count": ctx.tool_calls.len(),
                "timestamp": ctx.timestamp.to_rfc3339(),
            })),
            expires_at: Some(expires_at),
        };

        store.annotate_node(root, &annotation)
    }

    /// Annotates the root, then merges every child with its relationships.
    /// A failing child is recorded and its siblings still run; a failing
    /// root annotation aborts the build.
    pub fn build(
        &self,
        store: &dyn GraphStore,
        root: &NodeId,
        ctx: &ConversationContext,
    ) -> Result<BuildReport> {
        // A failed root annotation aborts before any child is written
        self.annotate_root(store, root, ctx)?;

        let group = ctx.project_id.as_str();
        let request_id = ctx.request_id.as_str();
        let expires_at = self.expires_at(ctx);
        let mut tool_nodes: HashMap<String, NodeId> = HashMap::new();

        let mut report = BuildReport {
            status: IngestStatus::Success,
            root: root.clone(),
            children: 0,
            relationships: 0,
            expires_at,
            partial_failures: Vec::new(),
        };

        // Each child succeeds or fails on its own
        for child in ChildEntity::from_context(ctx) {
            let key = child.natural_key(group, request_id);
            match self.build_child(store, root, ctx, &child, key.clone(), &mut tool_nodes) {
                Ok(relationships) => {
                    report.children += 1;
                    report.relationships += relationships;
                }
                Err(e) => {
                    let failure = IngestError::ChildEntity {
                        kind: child.label(),
                        key: key.clone(),
                        reason: e.to_string(),
                    };
                    warn!("{}", failure);
                    report.partial_failures.push(ChildFailure {
                        kind: child.label(),
                        key,
                        error: e.to_string(),
                    });
                }
            }
        }

        report.status = IngestStatus::from_failures(report.partial_failures.len());
        info!(
            "Built request {} in group {}: {} children, {} relationships, status {}",
            request_id, group, report.children, report.relationships, report.status
        );
        Ok(report)
    }

    fn build_child(
        &self,
        store: &dyn GraphStore,
        root: &NodeId,
        ctx: &ConversationContext,
        child: &ChildEntity,
        key: String,
        tool_nodes: &mut HashMap<String, NodeId>,
    ) -> Result<usize> {
        let group = ctx.project_id.as_str();
        let expires_at = self.expires_at(ctx);

        // Child node plus its edge from the root
        let node = store.merge_node(
            &child
                .node(key, group, &ctx.request_id)
                .stamped(ctx.timestamp, Some(expires_at)),
        )?;
        store.merge_edge(
            &EdgeMerge::new(root, &node.id, child.root_relationship())
                .properties(child.root_edge_properties()),
        )?;
        let mut relationships = 1;

        match child {
            // Later code changes in this run resolve their tool from here
            ChildEntity::ToolCall(tool) => {
                tool_nodes.insert(tool.tool_call_id.trim().to_string(), node.id.clone());
                if let Some(chunk) = clean_text(tool.diff_chunk_id.as_deref()) {
                    tool_nodes.insert(format!("diff:{}", chunk), node.id.clone());
                }
            }
            ChildEntity::CodeChange { change, .. } => {
                relationships += self.link_code_change(store, ctx, change, &node.id, tool_nodes)?;
            }
            _ => {}
        }

        Ok(relationships)
    }

    fn link_code_change(
        &self,
        store: &dyn GraphStore,
        ctx: &ConversationContext,
        change: &CodeChangePayload,
        change_id: &NodeId,
        tool_nodes: &HashMap<String, NodeId>,
    ) -> Result<usize> {
        let group = ctx.project_id.as_str();
        let timestamp = change.timestamp.unwrap_or(ctx.timestamp).to_rfc3339();
        let mut relationships = 0;

        // The changed file is shared with code import, so it is not request scoped
        if let Some(path) = change.file_path.as_deref().and_then(normalize_path) {
            let file = store.merge_node(
                &NodeMerge::new(CODE_FILE_LABEL, keys::code_file(group, &path))
                    .group(group)
                    .name(path.clone())
                    .properties(json!({
                        "path": path,
                        "repo": infer_repo(&path),
                        "language": change.language.clone().unwrap_or_else(|| detect_language(&path)),
                    })),
            )?;
            let lines_changed =
                change.lines_added.unwrap_or(0) + change.lines_removed.unwrap_or(0);
            store.merge_edge(
                &EdgeMerge::new(&file.id, change_id, "MODIFIED_IN").properties(json!({
                    "lines_changed": lines_changed,
                    "timestamp": timestamp,
                })),
            )?;
            relationships += 1;
        }

        // Tool call id first, diff chunk as the fallback
        let mut tool = None;
        if let Some(id) = clean_text(change.tool_call_id.as_deref()) {
            tool = self.find_tool(store, ctx, tool_nodes, &id, false)?;
        }
        if tool.is_none() {
            if let Some(chunk) = clean_text(change.diff_chunk_id.as_deref()) {
                tool = self.find_tool(store, ctx, tool_nodes, &chunk, true)?;
            }
        }
        match tool {
            Some(tool_id) => {
                store.merge_edge(
                    &EdgeMerge::new(&tool_id, change_id, "GENERATED_DIFF")
                        .properties(json!({"timestamp": timestamp})),
                )?;
                relationships += 1;
            }
            None if change.tool_call_id.is_some() || change.diff_chunk_id.is_some() => {
                debug!(
                    "No tool call in request {} matches change {}",
                    ctx.request_id, change_id
                );
            }
            None => {}
        }

        Ok(relationships)
    }

    /// Tool call from this request, either built in this run or left by an
    /// earlier run of the same request.
    fn find_tool(
        &self,
        store: &dyn GraphStore,
        ctx: &ConversationContext,
        tool_nodes: &HashMap<String, NodeId>,
        id: &str,
        by_diff_chunk: bool,
    ) -> Result<Option<NodeId>> {
        let lookup = if by_diff_chunk {
            format!("diff:{}", id)
        } else {
            id.to_string()
        };
        if let Some(found) = tool_nodes.get(&lookup) {
            return Ok(Some(found.clone()));
        }
        // Diff chunks are only indexed for tools built in this run
        if by_diff_chunk {
            return Ok(None);
        }
        let found = store.find_node(
            TOOL_CALL_LABEL,
            &keys::tool_call(&ctx.project_id, &ctx.request_id, id),
        )?;
        Ok(found.map(|node| node.id))
    }
}
