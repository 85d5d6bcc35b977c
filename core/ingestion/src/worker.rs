use memory_graph_schemas::{ConversationContext, StructuredRecord};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::graph::SharedGraph;
use crate::merger::{partition_by_conversation, BatchMerger, MergeContext, MergeSummary};
use crate::normalize::normalize_record;
use crate::pipeline::{ConversationIngestor, IngestionReport};

/// Background worker that ingests conversation contexts asynchronously
pub struct IngestionWorker {
    ingestor: Arc<ConversationIngestor>,
    receiver: mpsc::UnboundedReceiver<ConversationContext>,
    reports: Option<mpsc::UnboundedSender<IngestionReport>>,
}

impl IngestionWorker {
    pub fn new(
        ingestor: Arc<ConversationIngestor>,
        receiver: mpsc::UnboundedReceiver<ConversationContext>,
    ) -> Self {
        Self {
            ingestor,
            receiver,
            reports: None,
        }
    }

    /// Forward every report to `reports` as well as logging it.
    pub fn with_reports(mut self, reports: mpsc::UnboundedSender<IngestionReport>) -> Self {
        self.reports = Some(reports);
        self
    }

    /// Start the worker loop. Runs until the channel is closed.
    pub async fn run(mut self) {
        info!("Ingestion worker started");

        while let Some(ctx) = self.receiver.recv().await {
            match self.ingestor.ingest(&ctx).await {
                Ok(report) => {
                    info!(
                        "Request {} ingested with status {}",
                        report.request_id, report.status
                    );
                    if let Some(reports) = &self.reports {
                        if reports.send(report).is_err() {
                            debug!("Report receiver dropped");
                        }
                    }
                }
                Err(e) => {
                    // One failed request must not stop the worker
                    error!("Failed to ingest request {}: {}", ctx.request_id, e);
                }
            }
        }

        warn!("Ingestion worker stopped - channel closed");
    }
}

/// Merges records with one task per conversation. Each task owns its
/// conversation's state and takes the graph lock per record, so different
/// conversations interleave while each keeps its input order.
pub async fn merge_partitioned(
    graph: SharedGraph,
    merger: Arc<BatchMerger>,
    records: Vec<StructuredRecord>,
) -> MergeSummary {
    let normalized = records.iter().map(normalize_record).collect();
    let partitions = partition_by_conversation(normalized);
    info!("Merging {} conversations in parallel", partitions.len());

    let mut tasks = Vec::with_capacity(partitions.len());
    for (conversation_id, records) in partitions {
        let graph = graph.clone();
        let merger = merger.clone();
        tasks.push((
            conversation_id,
            tokio::spawn(async move {
                let mut context = MergeContext::new();
                let mut summary = MergeSummary::default();
                for record in &records {
                    let store = graph.lock().await;
                    merger.merge_isolated(&*store, &mut context, record, &mut summary);
                }
                summary
            }),
        ));
    }

    let mut total = MergeSummary::default();
    for (conversation_id, task) in tasks {
        match task.await {
            Ok(summary) => total.absorb(summary),
            Err(e) => error!("Merge task for conversation {} panicked: {}", conversation_id, e),
        }
    }
    total
}
