mod common;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use common::FaultyStore;
use memory_graph_ingestion::{
    shared, CacheInvalidation, ConversationIngestor, CorrelatorConfig, Database, EpisodeSubmitter,
    ExtractionService, GraphNode, GraphStore, IngestError, IngestionWorker, NodeMerge,
    NoopInvalidation, SharedGraph, TtlPolicy, ENTITY_LABEL, REQUEST_LABEL,
};
use memory_graph_schemas::{
    ChatMeta, CodeChangePayload, ContextFilePayload, ConversationContext, Episode, IngestStatus, MessagePayload,
    NodeId, ToolCallPayload,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Stands in for the extraction service: every submission materializes one
/// entity in the shared graph, the way the real service eventually does.
struct FakeExtraction {
    graph: SharedGraph,
    submissions: AtomicUsize,
    materialize: bool,
}

impl FakeExtraction {
    fn new(graph: SharedGraph) -> Arc<Self> {
        Arc::new(Self {
            graph,
            submissions: AtomicUsize::new(0),
            materialize: true,
        })
    }

    fn silent(graph: SharedGraph) -> Arc<Self> {
        Arc::new(Self {
            graph,
            submissions: AtomicUsize::new(0),
            materialize: false,
        })
    }
}

#[async_trait]
impl ExtractionService for FakeExtraction {
    async fn submit(&self, episode: &Episode) -> memory_graph_ingestion::Result<()> {
        let n = self.submissions.fetch_add(1, Ordering::SeqCst);
        if !self.materialize {
            return Ok(());
        }
        let uuid = format!("entity-{}-{}", episode.group_id, n);
        let created_at = episode.reference_time.unwrap_or_else(Utc::now);
        let graph = self.graph.lock().await;
        graph.merge_node(
            &NodeMerge::new(ENTITY_LABEL, uuid.clone())
                .with_id(NodeId(uuid))
                .group(episode.group_id.as_str())
                .name(episode.name.clone())
                .stamped(created_at, None),
        )?;
        Ok(())
    }
}

struct DownExtraction;

#[async_trait]
impl ExtractionService for DownExtraction {
    async fn submit(&self, _episode: &Episode) -> memory_graph_ingestion::Result<()> {
        Err(IngestError::ExtractionSubmission("connection refused".into()))
    }
}

fn message(sequence: u32, role: &str, text: &str) -> MessagePayload {
    MessagePayload {
        role: role.into(),
        sequence,
        content_summary: Some(text.into()),
        content_hash: None,
        prompt_tokens: None,
        completion_tokens: None,
        total_tokens: None,
    }
}

fn scenario_context() -> ConversationContext {
    ConversationContext {
        request_id: "req-42".into(),
        project_id: "acme".into(),
        timestamp: Utc::now(),
        chat_meta: ChatMeta {
            chat_id: "chat-7".into(),
            ..Default::default()
        },
        model: Some("assistant-large".into()),
        messages: vec![
            message(0, "user", "Why does login time out?"),
            message(1, "assistant", "The session cache TTL is too short."),
        ],
        context_files: vec![ContextFilePayload {
            file_path: "a.py".into(),
            line_start: None,
            line_end: None,
            usefulness: 0.9,
            source: "open_tab".into(),
            symbols: vec![],
            content_hash: None,
            language: None,
        }],
        tool_calls: vec![ToolCallPayload {
            tool_call_id: "call-1".into(),
            tool_name: "read_file".into(),
            arguments_hash: None,
            status: "success".into(),
            execution_time_ms: Some(40),
            diff_chunk_id: None,
        }],
        checkpoints: vec![],
        code_changes: vec![],
    }
}

fn ingestor(graph: &SharedGraph, service: Arc<dyn ExtractionService>) -> ConversationIngestor {
    ConversationIngestor::new(
        graph.clone(),
        EpisodeSubmitter::new(service),
        CorrelatorConfig::default(),
        TtlPolicy::default(),
        Box::new(NoopInvalidation),
    )
}

async fn request_node(graph: &SharedGraph, group: &str, request_id: &str) -> Result<GraphNode> {
    let store = graph.lock().await;
    store
        .find_by_property(group, REQUEST_LABEL, "request_id", request_id)?
        .ok_or_else(|| anyhow::anyhow!("request {} missing", request_id))
}

#[tokio::test(start_paused = true)]
async fn test_request_graph_scenario() -> Result<()> {
    let graph = shared(Database::in_memory()?);
    let service = FakeExtraction::new(graph.clone());
    let ingestor = ingestor(&graph, service.clone());

    let report = ingestor.ingest(&scenario_context()).await?;
    assert_eq!(report.status, IngestStatus::Success);
    assert!(!report.reused);
    assert!(report.partial_failures.is_empty());

    let root = request_node(&graph, "acme", "req-42").await?;
    assert_eq!(root.name.as_deref(), Some("Conversation chat-7"));

    let store = graph.lock().await;
    assert_eq!(store.count_nodes(Some(REQUEST_LABEL))?, 1);

    let messages = store.edges_from(&root.id, Some("CONTAINS_MESSAGE"))?;
    assert_eq!(messages.len(), 2);
    let mut sequences: Vec<i64> = messages
        .iter()
        .filter_map(|e| e.properties.get("sequence").and_then(|v| v.as_i64()))
        .collect();
    sequences.sort();
    assert_eq!(sequences, vec![0, 1]);

    let context = store.edges_from(&root.id, Some("USES_CONTEXT"))?;
    assert_eq!(context.len(), 1);
    assert_eq!(context[0].property_f64("usefulness"), Some(0.9));

    let tools = store.edges_from(&root.id, Some("INVOKES_TOOL"))?;
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].properties["status"], "success");

    assert_eq!(store.edges_from(&root.id, None)?.len(), 4);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_rerun_reuses_request_and_keeps_counts() -> Result<()> {
    let graph = shared(Database::in_memory()?);
    let service = FakeExtraction::new(graph.clone());
    let ingestor = ingestor(&graph, service.clone());
    let ctx = scenario_context();

    ingestor.ingest(&ctx).await?;
    let (nodes, edges) = {
        let store = graph.lock().await;
        (store.count_nodes(None)?, store.count_edges(None)?)
    };

    let again = ingestor.ingest(&ctx).await?;
    assert!(again.reused);
    assert_eq!(again.status, IngestStatus::Success);
    assert_eq!(service.submissions.load(Ordering::SeqCst), 1);

    let store = graph.lock().await;
    assert_eq!(store.count_nodes(None)?, nodes);
    assert_eq!(store.count_edges(None)?, edges);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_failed_tool_link_leaves_siblings_intact() -> Result<()> {
    let graph = shared(FaultyStore::rejecting(Database::in_memory()?, "INVOKES_TOOL"));
    let ingestor = ingestor(&graph, FakeExtraction::new(graph.clone()));

    let report = ingestor.ingest(&scenario_context()).await?;
    assert_eq!(report.status, IngestStatus::Partial);
    assert_eq!(report.partial_failures.len(), 1);
    assert_eq!(report.partial_failures[0].kind, "ToolCall");

    let root = request_node(&graph, "acme", "req-42").await?;
    let store = graph.lock().await;
    assert_eq!(store.edges_from(&root.id, Some("CONTAINS_MESSAGE"))?.len(), 2);
    assert_eq!(store.edges_from(&root.id, Some("USES_CONTEXT"))?.len(), 1);
    assert_eq!(store.count_nodes(Some("Message"))?, 2);
    assert_eq!(store.count_nodes(Some("ContextFile"))?, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_tool_lookup_error_fails_only_its_code_change() -> Result<()> {
    let graph = shared(FaultyStore::failing_lookups(Database::in_memory()?, "ToolCall"));
    let ingestor = ingestor(&graph, FakeExtraction::new(graph.clone()));

    // call-1 is built in this run; call-9 needs a store lookup
    let mut ctx = scenario_context();
    ctx.code_changes = vec![
        CodeChangePayload {
            file_path: Some("a.py".into()),
            tool_call_id: Some("call-1".into()),
            lines_added: Some(3),
            ..Default::default()
        },
        CodeChangePayload {
            file_path: Some("a.py".into()),
            tool_call_id: Some("call-9".into()),
            lines_added: Some(1),
            ..Default::default()
        },
    ];

    let report = ingestor.ingest(&ctx).await?;
    assert_eq!(report.status, IngestStatus::Partial);
    assert_eq!(report.partial_failures.len(), 1);
    assert_eq!(report.partial_failures[0].kind, "CodeChange");
    assert!(report.partial_failures[0].error.contains("lookup failed"));

    let store = graph.lock().await;
    assert_eq!(store.count_edges(Some("GENERATED_DIFF"))?, 1);
    assert_eq!(store.count_nodes(Some("Message"))?, 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_correlation_failure_is_reported_as_failed() -> Result<()> {
    let graph = shared(Database::in_memory()?);
    let (tx, mut rx) = mpsc::unbounded_channel::<CacheInvalidation>();
    let ingestor = ConversationIngestor::new(
        graph.clone(),
        EpisodeSubmitter::new(FakeExtraction::silent(graph.clone())),
        CorrelatorConfig::default(),
        TtlPolicy::default(),
        Box::new(tx),
    );

    let report = ingestor.ingest(&scenario_context()).await?;
    assert_eq!(report.status, IngestStatus::Failed);
    assert!(report.request_node.is_none());
    assert!(report.error.is_some());

    let store = graph.lock().await;
    assert_eq!(store.count_nodes(None)?, 0);
    assert!(rx.try_recv().is_err());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_invalidation_emitted_once_per_build() -> Result<()> {
    let graph = shared(Database::in_memory()?);
    let (tx, mut rx) = mpsc::unbounded_channel::<CacheInvalidation>();
    let ingestor = ConversationIngestor::new(
        graph.clone(),
        EpisodeSubmitter::new(FakeExtraction::new(graph.clone())),
        CorrelatorConfig::default(),
        TtlPolicy::default(),
        Box::new(tx),
    );

    ingestor.ingest(&scenario_context()).await?;

    let signal = rx.try_recv()?;
    assert_eq!(signal.group_id, "acme");
    assert_eq!(signal.request_id, "req-42");
    assert!(rx.try_recv().is_err());
    Ok(())
}

#[tokio::test]
async fn test_submission_failure_is_retryable_error() -> Result<()> {
    let graph = shared(Database::in_memory()?);
    let ingestor = ingestor(&graph, Arc::new(DownExtraction));

    let err = ingestor.ingest(&scenario_context()).await.unwrap_err();
    assert!(err.is_retryable());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_worker_processes_queued_requests() -> Result<()> {
    let graph = shared(Database::in_memory()?);
    let ingestor = Arc::new(ingestor(&graph, FakeExtraction::new(graph.clone())));

    let (tx, rx) = mpsc::unbounded_channel();
    let (report_tx, mut report_rx) = mpsc::unbounded_channel();
    let worker = IngestionWorker::new(ingestor, rx).with_reports(report_tx);
    let handle = tokio::spawn(worker.run());

    let mut first = scenario_context();
    first.project_id = "alpha".into();
    let mut second = scenario_context();
    second.project_id = "beta".into();
    tx.send(first)?;
    tx.send(second)?;
    drop(tx);

    handle.await?;

    let mut groups = Vec::new();
    while let Ok(report) = report_rx.try_recv() {
        assert_eq!(report.status, IngestStatus::Success);
        groups.push(report.group_id);
    }
    groups.sort();
    assert_eq!(groups, vec!["alpha".to_string(), "beta".to_string()]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_worker_keeps_going_after_report_receiver_drops() -> Result<()> {
    let graph = shared(Database::in_memory()?);
    let ingestor = Arc::new(ingestor(&graph, FakeExtraction::new(graph.clone())));

    let (tx, rx) = mpsc::unbounded_channel();
    let (report_tx, report_rx) = mpsc::unbounded_channel();
    drop(report_rx);
    let handle = tokio::spawn(IngestionWorker::new(ingestor, rx).with_reports(report_tx).run());

    let mut first = scenario_context();
    first.project_id = "alpha".into();
    let mut second = scenario_context();
    second.project_id = "beta".into();
    tx.send(first)?;
    tx.send(second)?;
    drop(tx);

    handle.await?;

    request_node(&graph, "alpha", "req-42").await?;
    request_node(&graph, "beta", "req-42").await?;
    Ok(())
}
