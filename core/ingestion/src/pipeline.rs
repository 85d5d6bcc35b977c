use async_trait::async_trait;
use chrono::{DateTime, Utc};
use memory_graph_schemas::{ConversationContext, GroupId, IngestStatus, NodeId};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::builder::{ChildFailure, RequestGraphBuilder, REQUEST_LABEL};
use crate::config::{CorrelatorConfig, TtlPolicy};
use crate::correlator::EntityCorrelator;
use crate::error::{IngestError, Result};
use crate::extraction::{conversation_episode, EpisodeSubmitter};
use crate::graph::SharedGraph;

/// Emitted once per builder run so downstream caches drop stale entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheInvalidation {
    pub group_id: String,
    pub request_id: String,
}

#[async_trait]
pub trait InvalidationSink: Send + Sync {
    async fn invalidate(&self, signal: CacheInvalidation);
}

#[async_trait]
impl InvalidationSink for mpsc::UnboundedSender<CacheInvalidation> {
    async fn invalidate(&self, signal: CacheInvalidation) {
        if self.send(signal).is_err() {
            debug!("Cache invalidation receiver dropped");
        }
    }
}

/// Sink for callers with no cache to invalidate.
pub struct NoopInvalidation;

#[async_trait]
impl InvalidationSink for NoopInvalidation {
    async fn invalidate(&self, _signal: CacheInvalidation) {}
}

/// Outcome of ingesting one request.
#[derive(Debug, Clone, Serialize)]
pub struct IngestionReport {
    pub status: IngestStatus,
    pub request_id: String,
    pub group_id: String,
    pub request_node: Option<String>,
    /// Whether an existing `Request` node was reused instead of submitting.
    pub reused: bool,
    pub children: usize,
    pub relationships: usize,
    pub expires_at: Option<DateTime<Utc>>,
    pub partial_failures: Vec<ChildFailure>,
    pub error: Option<String>,
}

impl IngestionReport {
    fn failed(ctx: &ConversationContext, error: &IngestError) -> Self {
        Self {
            status: IngestStatus::Failed,
            request_id: ctx.request_id.clone(),
            group_id: ctx.project_id.clone(),
            request_node: None,
            reused: false,
            children: 0,
            relationships: 0,
            expires_at: None,
            partial_failures: Vec::new(),
            error: Some(error.to_string()),
        }
    }
}

/// Submit, correlate, build, invalidate: one request end to end.
pub struct ConversationIngestor {
    graph: SharedGraph,
    submitter: EpisodeSubmitter,
    correlator: EntityCorrelator,
    builder: RequestGraphBuilder,
    invalidation: Box<dyn InvalidationSink>,
}

impl ConversationIngestor {
    pub fn new(
        graph: SharedGraph,
        submitter: EpisodeSubmitter,
        correlator_config: CorrelatorConfig,
        ttl: TtlPolicy,
        invalidation: Box<dyn InvalidationSink>,
    ) -> Self {
        Self {
            correlator: EntityCorrelator::new(graph.clone(), correlator_config),
            builder: RequestGraphBuilder::new(ttl),
            graph,
            submitter,
            invalidation,
        }
    }

    /// Submission failures come back as `Err` (retryable); a correlation
    /// that never resolves comes back as a `failed` report.
    pub async fn ingest(&self, ctx: &ConversationContext) -> Result<IngestionReport> {
        let group = ctx.group_id();
        info!(
            "Ingesting request {} for group {}",
            ctx.request_id, ctx.project_id
        );

        let (root, reused) = match self.existing_request(&group, &ctx.request_id).await? {
            Some(root) => {
                debug!("Reusing request node {} for {}", root, ctx.request_id);
                (root, true)
            }
            None => {
                let echo = self.submitter.submit(conversation_episode(ctx)).await?;
                match self
                    .correlator
                    .correlate(&group, echo.reference_time)
                    .await
                {
                    Ok(correlation) => (correlation.entity_id, false),
                    Err(e @ IngestError::CorrelationFailure { .. }) => {
                        warn!("Request {} not ingested: {}", ctx.request_id, e);
                        return Ok(IngestionReport::failed(ctx, &e));
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        let build = {
            let graph = self.graph.lock().await;
            self.builder.build(&*graph, &root, ctx)?
        };

        self.invalidation
            .invalidate(CacheInvalidation {
                group_id: ctx.project_id.clone(),
                request_id: ctx.request_id.clone(),
            })
            .await;

        Ok(IngestionReport {
            status: build.status,
            request_id: ctx.request_id.clone(),
            group_id: ctx.project_id.clone(),
            request_node: Some(build.root.to_string()),
            reused,
            children: build.children,
            relationships: build.relationships,
            expires_at: Some(build.expires_at),
            partial_failures: build.partial_failures,
            error: None,
        })
    }

    async fn existing_request(&self, group: &GroupId, request_id: &str) -> Result<Option<NodeId>> {
        let graph = self.graph.lock().await;
        let found = graph.find_by_property(group.as_str(), REQUEST_LABEL, "request_id", request_id)?;
        Ok(found.map(|node| node.id))
    }
}
