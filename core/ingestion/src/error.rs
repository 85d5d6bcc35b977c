use thiserror::Error;

/// Errors raised while building or merging the memory graph.
#[derive(Error, Debug)]
pub enum IngestError {
    /// Transport or service failure while handing an episode to the
    /// extraction service. Safe to retry.
    #[error("extraction submission failed: {0}")]
    ExtractionSubmission(String),

    #[error("no entity materialized for group {group_id} after {attempts} polls")]
    CorrelationFailure { group_id: String, attempts: u32 },

    #[error("{kind} child {key} failed: {reason}")]
    ChildEntity {
        kind: &'static str,
        key: String,
        reason: String,
    },

    #[error("could not parse {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("{label} key {key} already belongs to group {existing}, incoming {incoming}")]
    MergeKeyCollision {
        label: String,
        key: String,
        existing: String,
        incoming: String,
    },

    #[error("node not found: {0}")]
    MissingNode(String),

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, IngestError>;

impl IngestError {
    /// Whether the caller may retry the same call unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IngestError::ExtractionSubmission(_) | IngestError::Http(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(IngestError::ExtractionSubmission("timeout".into()).is_retryable());
        assert!(!IngestError::CorrelationFailure {
            group_id: "g".into(),
            attempts: 3
        }
        .is_retryable());
    }

    #[test]
    fn test_child_error_message_names_kind_and_key() {
        let err = IngestError::ChildEntity {
            kind: "ToolCall",
            key: "g/req/tool/t1".into(),
            reason: "edge rejected".into(),
        };
        assert_eq!(
            err.to_string(),
            "ToolCall child g/req/tool/t1 failed: edge rejected"
        );
    }
}
