use chrono::{DateTime, Utc};
use memory_graph_schemas::{GroupId, NodeId};
use tracing::{debug, info, warn};

use crate::builder::REQUEST_LABEL;
use crate::config::CorrelatorConfig;
use crate::error::{IngestError, Result};
use crate::graph::{GraphNode, SharedGraph};

/// How many candidates one poll looks at.
const CANDIDATE_LIMIT: usize = 10;

/// Correlation progress. Every path ends in a resolved entity or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationState {
    /// Time-windowed query, 1-based attempt number.
    Polling { attempt: u32 },
    /// One unfiltered query for the group's newest entity.
    WidenWindow,
    Failed,
}

#[derive(Debug, Clone)]
pub struct Correlation {
    pub entity_id: NodeId,
    /// Other entities seen in the same window, newest first.
    pub candidates: Vec<NodeId>,
    pub resolved_in: CorrelationState,
    /// Request id already stored on the chosen entity, if another request
    /// claimed it first.
    pub claimed_by: Option<String>,
}

/// Finds the entity the extraction service created for a submission.
pub struct EntityCorrelator {
    graph: SharedGraph,
    config: CorrelatorConfig,
}

impl EntityCorrelator {
    pub fn new(graph: SharedGraph, config: CorrelatorConfig) -> Self {
        Self { graph, config }
    }

    /// Polls for the newest entity in `group_id` created after
    /// `reference_time` (less clock skew). Sleeps at most
    /// `max_attempts * poll_delay`.
    pub async fn correlate(
        &self,
        group_id: &GroupId,
        reference_time: DateTime<Utc>,
    ) -> Result<Correlation> {
        let since = reference_time - self.config.clock_skew;
        let mut state = if self.config.max_attempts == 0 {
            CorrelationState::WidenWindow
        } else {
            CorrelationState::Polling { attempt: 1 }
        };

        loop {
            state = match state {
                CorrelationState::Polling { attempt } => {
                    tokio::time::sleep(self.config.poll_delay).await;
                    let found = self.query(group_id, Some(since)).await?;
                    if let Some(correlation) = resolve(found, state) {
                        return Ok(correlation);
                    }
                    debug!(
                        "No entity yet for group {} (attempt {}/{})",
                        group_id, attempt, self.config.max_attempts
                    );
                    if attempt < self.config.max_attempts {
                        CorrelationState::Polling {
                            attempt: attempt + 1,
                        }
                    } else {
                        CorrelationState::WidenWindow
                    }
                }
                CorrelationState::WidenWindow => {
                    let found = self.query(group_id, None).await?;
                    match resolve(found, state) {
                        Some(correlation) => {
                            warn!(
                                "Correlated group {} to {} outside the time window",
                                group_id, correlation.entity_id
                            );
                            return Ok(correlation);
                        }
                        None => CorrelationState::Failed,
                    }
                }
                CorrelationState::Failed => {
                    warn!(
                        "Correlation failed for group {} after {} polls",
                        group_id, self.config.max_attempts
                    );
                    return Err(IngestError::CorrelationFailure {
                        group_id: group_id.to_string(),
                        attempts: self.config.max_attempts,
                    });
                }
            };
        }
    }

    async fn query(
        &self,
        group_id: &GroupId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<GraphNode>> {
        let graph = self.graph.lock().await;
        graph.recent_entities(group_id.as_str(), since, CANDIDATE_LIMIT)
    }
}

fn resolve(found: Vec<GraphNode>, state: CorrelationState) -> Option<Correlation> {
    let mut found = found.into_iter();
    let chosen = found.next()?;
    let candidates: Vec<NodeId> = found.map(|node| node.id).collect();

    let claimed_by = chosen
        .has_label(REQUEST_LABEL)
        .then(|| chosen.property_str("request_id").unwrap_or_default().to_string());
    if let Some(owner) = &claimed_by {
        warn!(
            "Entity {} is already the root of request {}",
            chosen.id, owner
        );
    }
    let entity_id = chosen.id;

    if candidates.is_empty() {
        debug!("Correlated entity {} in {:?}", entity_id, state);
    } else {
        info!(
            "Correlated entity {} in {:?}; {} other candidates: {}",
            entity_id,
            state,
            candidates.len(),
            candidates
                .iter()
                .map(|c| c.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    Some(Correlation {
        entity_id,
        candidates,
        resolved_in: state,
        claimed_by,
    })
}
