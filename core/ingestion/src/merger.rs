use memory_graph_schemas::{IngestStatus, NodeId, StructuredRecord};
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info, warn};

use crate::code_import::detect_language;
use crate::config::SimilarityConfig;
use crate::error::Result;
use crate::graph::{keys, EdgeMerge, GraphStore, MergeOutcome, NodeMerge};
use crate::normalize::{normalize_record, NormalizedRecord};

pub const PROJECT_LABEL: &str = "Project";
pub const CONVERSATION_LABEL: &str = "Conversation";
pub const STM_MESSAGE_LABEL: &str = "STMMessage";
pub const FILE_LABEL: &str = "File";
pub const FUNCTION_LABEL: &str = "Function";
pub const CONCEPT_LABEL: &str = "Concept";
pub const CODE_CHANGE_LABEL: &str = "CodeChange";

#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    /// Link similar messages with scored `RELATES_TO` edges.
    pub enrich_similarity: bool,
    pub similarity: SimilarityConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordFailure {
    pub record_id: String,
    pub error: String,
}

/// Totals for one merge run. Counters count merge operations, so a re-run
/// reports the same numbers while leaving the graph unchanged.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MergeSummary {
    pub records: usize,
    pub merged: usize,
    pub messages: usize,
    pub files: usize,
    pub functions: usize,
    pub concepts: usize,
    pub follows: usize,
    pub code_changes: usize,
    pub relates_to: usize,
    pub comparisons: usize,
    pub key_collisions: usize,
    pub rejected: usize,
    pub failures: Vec<RecordFailure>,
}

impl MergeSummary {
    pub fn status(&self) -> IngestStatus {
        IngestStatus::from_failures(self.failures.len() + self.rejected)
    }

    pub fn absorb(&mut self, other: MergeSummary) {
        self.records += other.records;
        self.merged += other.merged;
        self.messages += other.messages;
        self.files += other.files;
        self.functions += other.functions;
        self.concepts += other.concepts;
        self.follows += other.follows;
        self.code_changes += other.code_changes;
        self.relates_to += other.relates_to;
        self.comparisons += other.comparisons;
        self.key_collisions += other.key_collisions;
        self.rejected += other.rejected;
        self.failures.extend(other.failures);
    }

    fn track(&mut self, outcome: &MergeOutcome) {
        if outcome.collision.is_some() {
            self.key_collisions += 1;
        }
    }
}

/// Mutable state of one conversation during a merge run.
#[derive(Debug)]
struct ConversationState {
    last_message: Option<NodeId>,
    recent: VecDeque<(NodeId, Vec<f32>)>,
}

/// Arena of per-conversation state, indexed by conversation id. A context
/// belongs to one worker; conversations are never shared between contexts
/// that run at the same time.
#[derive(Debug, Default)]
pub struct MergeContext {
    states: Vec<ConversationState>,
    index: HashMap<String, usize>,
}

impl MergeContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn state_mut(&mut self, conversation_id: &str) -> &mut ConversationState {
        let slot = match self.index.get(conversation_id) {
            Some(&slot) => slot,
            None => {
                self.states.push(ConversationState {
                    last_message: None,
                    recent: VecDeque::new(),
                });
                let slot = self.states.len() - 1;
                self.index.insert(conversation_id.to_string(), slot);
                slot
            }
        };
        &mut self.states[slot]
    }

    pub fn conversations(&self) -> usize {
        self.states.len()
    }

    pub fn last_message(&self, conversation_id: &str) -> Option<&NodeId> {
        self.index
            .get(conversation_id)
            .and_then(|&slot| self.states[slot].last_message.as_ref())
    }
}

/// Idempotent merge of structured records into the graph.
pub struct BatchMerger {
    options: MergeOptions,
}

impl BatchMerger {
    pub fn new(options: MergeOptions) -> Self {
        Self { options }
    }

    /// Merges records in input order with a fresh context. A failing record
    /// is reported and the rest still merge.
    pub fn merge_records(&self, store: &dyn GraphStore, records: &[StructuredRecord]) -> MergeSummary {
        let mut context = MergeContext::new();
        let mut summary = MergeSummary::default();

        for record in records {
            let normalized = normalize_record(record);
            self.merge_isolated(store, &mut context, &normalized, &mut summary);
        }

        info!(
            "Merged {}/{} records across {} conversations ({} failures)",
            summary.merged,
            summary.records,
            context.conversations(),
            summary.failures.len()
        );
        summary
    }

    /// Merges one record, recording rather than returning its failure.
    pub fn merge_isolated(
        &self,
        store: &dyn GraphStore,
        context: &mut MergeContext,
        record: &NormalizedRecord,
        summary: &mut MergeSummary,
    ) {
        summary.records += 1;
        match self.merge_record(store, context, record, summary) {
            Ok(()) => summary.merged += 1,
            Err(e) => {
                warn!("Record {} not merged: {}", record.id, e);
                summary.failures.push(RecordFailure {
                    record_id: record.id.clone(),
                    error: e.to_string(),
                });
            }
        }
    }

    pub fn merge_record(
        &self,
        store: &dyn GraphStore,
        context: &mut MergeContext,
        record: &NormalizedRecord,
        summary: &mut MergeSummary,
    ) -> Result<()> {
        let group = record.project_id.as_str();

        // Project and conversation are shared by every record in them
        let project = store.merge_node(
            &NodeMerge::new(PROJECT_LABEL, group)
                .group(group)
                .name(group)
                .properties(json!({"id": group})),
        )?;
        summary.track(&project);

        let conversation = store.merge_node(
            &NodeMerge::new(CONVERSATION_LABEL, record.conversation_id.clone())
                .group(group)
                .name(record.conversation_id.clone())
                .properties(json!({"id": record.conversation_id, "project_id": group})),
        )?;
        summary.track(&conversation);
        store.merge_edge(&EdgeMerge::new(&project.id, &conversation.id, "HAS_CONVERSATION"))?;

        // The message itself, keyed by record id
        let message = store.merge_node(
            &NodeMerge::new(STM_MESSAGE_LABEL, record.id.clone())
                .group(group)
                .name(record.role.clone().unwrap_or_else(|| "message".to_string()))
                .summary(record.content.clone())
                .properties(json!({
                    "id": record.id,
                    "role": record.role,
                    "content": record.content,
                    "timestamp": record.timestamp,
                    "project_id": group,
                    "conversation_id": record.conversation_id,
                    "file_path": record.file_path,
                    "function_name": record.function_name,
                    "line_start": record.line_start,
                    "line_end": record.line_end,
                    "lines_added": record.lines_added,
                    "lines_removed": record.lines_removed,
                    "diff_summary": record.diff_summary,
                    "intent": record.intent,
                    "keywords": (!record.keywords.is_empty())
                        .then(|| record.keywords.iter().map(|k| k.slug.clone()).collect::<Vec<_>>()),
                    "code_changes": record.code_changes,
                    "file_analysis": record.file_analysis,
                })),
        )?;
        summary.track(&message);
        summary.messages += 1;
        let message_id = message.id;

        // Reachable from both the project and its conversation
        store.merge_edge(&EdgeMerge::new(&project.id, &message_id, "HAS_MESSAGE"))?;
        store.merge_edge(&EdgeMerge::new(&conversation.id, &message_id, "HAS_MESSAGE"))?;

        self.link_sequence(store, context, record, &message_id, summary)?;

        let file_id = match record.file_path.as_deref() {
            Some(path) => {
                let file = store.merge_node(
                    &NodeMerge::new(FILE_LABEL, path)
                        .group(group)
                        .name(path)
                        .properties(json!({"path": path, "language": detect_language(path)})),
                )?;
                summary.track(&file);
                summary.files += 1;
                store.merge_edge(&EdgeMerge::new(&file.id, &message_id, "MENTIONED_IN"))?;
                Some(file.id)
            }
            None => None,
        };

        if let Some(name) = record.function_name.as_deref() {
            // Same function name in two files is two nodes
            let path = record.file_path.as_deref().unwrap_or("");
            let function = store.merge_node(
                &NodeMerge::new(FUNCTION_LABEL, keys::function(name, path))
                    .group(group)
                    .name(name)
                    .properties(json!({"name": name, "file_path": record.file_path})),
            )?;
            summary.track(&function);
            summary.functions += 1;
            store.merge_edge(&EdgeMerge::new(&function.id, &message_id, "MENTIONED_IN"))?;
        }

        // Concepts are shared vocabulary across projects.
        for keyword in &record.keywords {
            let concept = store.merge_node(
                &NodeMerge::new(CONCEPT_LABEL, keyword.slug.clone())
                    .name(keyword.label.clone())
                    .properties(json!({"slug": keyword.slug})),
            )?;
            summary.concepts += 1;
            store.merge_edge(&EdgeMerge::new(&message_id, &concept.id, "MENTIONS"))?;
        }

        // Line ranges, counts or a diff summary make a CodeChange
        if record.has_change() {
            let path = record.file_path.as_deref().unwrap_or("");
            let change = store.merge_node(
                &NodeMerge::new(
                    CODE_CHANGE_LABEL,
                    keys::record_change(&record.id, path, record.line_start, record.line_end),
                )
                .group(group)
                .name(format!("change in {}", if path.is_empty() { "unknown file" } else { path }))
                .summary(record.diff_summary.clone())
                .properties(json!({
                    "message_id": record.id,
                    "file_path": record.file_path,
                    "line_start": record.line_start,
                    "line_end": record.line_end,
                    "lines_added": record.lines_added,
                    "lines_removed": record.lines_removed,
                    "diff_summary": record.diff_summary,
                    "metadata": record.code_changes,
                })),
            )?;
            summary.track(&change);
            summary.code_changes += 1;
            store.merge_edge(&EdgeMerge::new(&message_id, &change.id, "CHANGED"))?;
            if let Some(file_id) = &file_id {
                store.merge_edge(&EdgeMerge::new(&change.id, file_id, "APPLIES_TO"))?;
            }
        }

        if self.options.enrich_similarity {
            if let Some(embedding) = record.embedding.as_ref() {
                self.link_similar(store, context, record, &message_id, embedding, summary)?;
            }
        }

        Ok(())
    }

    /// One `FOLLOWS` edge from the previous message of the conversation, in
    /// input order.
    fn link_sequence(
        &self,
        store: &dyn GraphStore,
        context: &mut MergeContext,
        record: &NormalizedRecord,
        message_id: &NodeId,
        summary: &mut MergeSummary,
    ) -> Result<()> {
        let state = context.state_mut(&record.conversation_id);
        if let Some(previous) = state.last_message.as_ref() {
            if previous != message_id {
                store.merge_edge(
                    &EdgeMerge::new(previous, message_id, "FOLLOWS")
                        .properties(json!({"conversation_id": record.conversation_id})),
                )?;
                summary.follows += 1;
            }
        }
        state.last_message = Some(message_id.clone());
        Ok(())
    }

    /// Compares against the last `window` embeddings of the same
    /// conversation and keeps the best `max_links` above the threshold.
    fn link_similar(
        &self,
        store: &dyn GraphStore,
        context: &mut MergeContext,
        record: &NormalizedRecord,
        message_id: &NodeId,
        embedding: &[f32],
        summary: &mut MergeSummary,
    ) -> Result<()> {
        let config = &self.options.similarity;
        let state = context.state_mut(&record.conversation_id);

        let mut scored: Vec<(f64, &NodeId)> = Vec::new();
        for (other_id, other) in state.recent.iter() {
            if other_id == message_id {
                continue;
            }
            summary.comparisons += 1;
            if let Some(score) = cosine_similarity(embedding, other) {
                if score >= config.threshold {
                    scored.push((score, other_id));
                }
            }
        }
        // Best first, then keep the top max_links
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored.truncate(config.max_links);

        for (score, other_id) in &scored {
            store.merge_edge(
                &EdgeMerge::new(message_id, other_id, "RELATES_TO")
                    .properties(json!({"score": score})),
            )?;
            summary.relates_to += 1;
        }
        if !scored.is_empty() {
            debug!("Linked {} to {} similar messages", record.id, scored.len());
        }

        // Slide the window; a re-merged message moves to the back
        state.recent.retain(|(id, _)| id != message_id);
        state.recent.push_back((message_id.clone(), embedding.to_vec()));
        while state.recent.len() > config.window {
            state.recent.pop_front();
        }
        Ok(())
    }
}

/// `None` for empty, mismatched or zero-norm vectors. Accumulates in `f64`
/// so the score compared against the threshold is the score stored.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.is_empty() || a.len() != b.len() {
        return None;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    let score = dot / (norm_a.sqrt() * norm_b.sqrt());
    score.is_finite().then_some(score)
}

/// Groups normalized records by conversation, keeping input order inside
/// each group and first-seen order between groups.
pub fn partition_by_conversation(records: Vec<NormalizedRecord>) -> Vec<(String, Vec<NormalizedRecord>)> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut partitions: Vec<(String, Vec<NormalizedRecord>)> = Vec::new();
    for record in records {
        let slot = *index
            .entry(record.conversation_id.clone())
            .or_insert_with(|| {
                partitions.push((record.conversation_id.clone(), Vec::new()));
                partitions.len() - 1
            });
        partitions[slot].1.push(record);
    }
    partitions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    fn record(id: &str, conversation: &str) -> StructuredRecord {
        serde_json::from_value(json!({
            "id": id,
            "role": "user",
            "content": format!("content {}", id),
            "conversation_id": conversation,
            "project_id": "proj",
        }))
        .unwrap()
    }

    #[test]
    fn test_cosine_similarity() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]), Some(1.0));
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), Some(0.0));
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), None);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), None);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[3.0, 4.0]), Some(0.6));
    }

    fn embedded(id: &str, embedding: [f32; 2]) -> StructuredRecord {
        serde_json::from_value(json!({"id": id, "conversation_id": "c", "embedding": embedding}))
            .unwrap()
    }

    #[test]
    fn test_score_at_threshold_is_stored_unchanged() {
        let db = Database::in_memory().unwrap();
        let merger = BatchMerger::new(MergeOptions {
            enrich_similarity: true,
            similarity: SimilarityConfig {
                threshold: 0.6,
                ..SimilarityConfig::default()
            },
        });

        let summary =
            merger.merge_records(&db, &[embedded("a", [1.0, 0.0]), embedded("b", [3.0, 4.0])]);
        assert_eq!(summary.relates_to, 1);

        let b = db.find_node(STM_MESSAGE_LABEL, "b").unwrap().unwrap();
        let links = db.edges_from(&b.id, Some("RELATES_TO")).unwrap();
        assert_eq!(links[0].property_f64("score"), Some(0.6));
    }

    #[test]
    fn test_stored_scores_never_fall_below_default_threshold() {
        let db = Database::in_memory().unwrap();
        let merger = BatchMerger::new(MergeOptions {
            enrich_similarity: true,
            ..MergeOptions::default()
        });
        let edge = (1.0f32 - 0.49).sqrt();

        merger.merge_records(&db, &[embedded("a", [1.0, 0.0]), embedded("b", [0.7, edge])]);

        let b = db.find_node(STM_MESSAGE_LABEL, "b").unwrap().unwrap();
        for link in db.edges_from(&b.id, Some("RELATES_TO")).unwrap() {
            assert!(link.property_f64("score").unwrap() >= 0.7);
        }
    }

    #[test]
    fn test_context_tracks_last_message_per_conversation() {
        let db = Database::in_memory().unwrap();
        let merger = BatchMerger::new(MergeOptions::default());
        let mut context = MergeContext::new();
        let mut summary = MergeSummary::default();

        for (id, conv) in [("a", "c1"), ("b", "c2"), ("c", "c1")] {
            let normalized = normalize_record(&record(id, conv));
            merger.merge_isolated(&db, &mut context, &normalized, &mut summary);
        }

        assert_eq!(context.conversations(), 2);
        assert_eq!(summary.follows, 1);
        let last = context.last_message("c1").unwrap();
        let node = db.get_node(last).unwrap().unwrap();
        assert_eq!(node.key, "c");
    }

    #[test]
    fn test_repeated_record_does_not_follow_itself() {
        let db = Database::in_memory().unwrap();
        let merger = BatchMerger::new(MergeOptions::default());

        let summary = merger.merge_records(&db, &[record("a", "c1"), record("a", "c1")]);

        assert_eq!(summary.follows, 0);
        assert_eq!(db.count_edges(Some("FOLLOWS")).unwrap(), 0);
        assert_eq!(db.count_nodes(Some(STM_MESSAGE_LABEL)).unwrap(), 1);
    }

    #[test]
    fn test_partition_preserves_order() {
        let records: Vec<NormalizedRecord> = [("1", "x"), ("2", "y"), ("3", "x")]
            .iter()
            .map(|(id, conv)| normalize_record(&record(id, conv)))
            .collect();

        let partitions = partition_by_conversation(records);
        assert_eq!(partitions.len(), 2);
        assert_eq!(partitions[0].0, "x");
        let ids: Vec<&str> = partitions[0].1.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3"]);
    }
}
