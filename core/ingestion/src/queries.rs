use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::graph::GraphNode;

/// Creation-time window for read queries. Nodes whose `expires_at` is at or
/// before `now` are left out.
#[derive(Debug, Clone, Copy)]
pub struct TimeWindow {
    pub since: DateTime<Utc>,
    pub now: DateTime<Utc>,
}

impl TimeWindow {
    pub fn last_days(days: i64) -> Self {
        let now = Utc::now();
        Self {
            since: now - Duration::days(days),
            now,
        }
    }
}

/// One live request as listed by a search.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestSummary {
    pub node_id: String,
    pub request_id: String,
    pub chat_id: Option<String>,
    pub chat_mode: Option<String>,
    pub model: Option<String>,
    pub total_tokens: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl RequestSummary {
    pub fn from_node(node: &GraphNode) -> Self {
        let text = |key: &str| node.property_str(key).map(str::to_string);
        Self {
            node_id: node.id.to_string(),
            request_id: text("request_id").unwrap_or_default(),
            chat_id: text("chat_id"),
            chat_mode: text("chat_mode"),
            model: text("model"),
            total_tokens: node.property_i64("total_tokens"),
            created_at: node.created_at,
            expires_at: node.expires_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowMessage {
    pub sequence: i64,
    pub role: String,
    pub content_summary: Option<String>,
}

/// A request with its messages in sequence order and the files and tools
/// it touched.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationFlow {
    pub request: RequestSummary,
    pub summary: Option<String>,
    pub message_count: usize,
    pub context_file_count: usize,
    pub tool_call_count: usize,
    pub messages: Vec<FlowMessage>,
    pub context_files: Vec<String>,
    pub tools: Vec<String>,
}

/// How often a file was handed to the assistant as context.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextFileStats {
    pub file_path: String,
    pub source: String,
    pub usage_count: usize,
    pub avg_usefulness: f64,
    pub symbols: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolStats {
    pub tool_name: String,
    pub total_calls: usize,
    pub successful_calls: usize,
    /// Percentage, 0 to 100.
    pub success_rate: f64,
    pub avg_execution_time_ms: Option<f64>,
}
