use async_trait::async_trait;
use chrono::Utc;
use memory_graph_schemas::{ConversationContext, Episode, GroupId, SourceKind, SubmissionEcho};
use reqwest::Client;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::ExtractionConfig;
use crate::error::{IngestError, Result};

/// The external service that turns episodes into graph entities. It
/// acknowledges a submission but never says which entity it will create.
#[async_trait]
pub trait ExtractionService: Send + Sync {
    async fn submit(&self, episode: &Episode) -> Result<()>;
}

/// HTTP client for the extraction service
pub struct HttpExtractionClient {
    config: ExtractionConfig,
    client: Client,
}

impl HttpExtractionClient {
    pub fn new(config: ExtractionConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self { config, client })
    }
}

#[async_trait]
impl ExtractionService for HttpExtractionClient {
    async fn submit(&self, episode: &Episode) -> Result<()> {
        let url = format!("{}/episodes", self.config.base_url.trim_end_matches('/'));
        let body = json!({
            "name": episode.name,
            "episode_body": episode.body,
            "source": episode.source_kind.as_str(),
            "source_description": episode.source_description,
            "reference_time": episode.reference_time.map(|t| t.to_rfc3339()),
            "group_id": episode.group_id.as_str(),
        });

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| IngestError::ExtractionSubmission(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(IngestError::ExtractionSubmission(format!(
                "{} from {}: {}",
                status, url, error_text
            )));
        }

        debug!("Extraction service accepted episode {}", episode.name);
        Ok(())
    }
}

/// Hands episodes to the extraction service, filling in the reference time.
#[derive(Clone)]
pub struct EpisodeSubmitter {
    service: Arc<dyn ExtractionService>,
}

impl EpisodeSubmitter {
    pub fn new(service: Arc<dyn ExtractionService>) -> Self {
        Self { service }
    }

    /// Returns only an echo of the submission. The entity id is unknown
    /// until correlation finds it.
    pub async fn submit(&self, mut episode: Episode) -> Result<SubmissionEcho> {
        let reference_time = *episode.reference_time.get_or_insert_with(Utc::now);

        if let Err(e) = self.service.submit(&episode).await {
            warn!("Episode {} not accepted: {}", episode.name, e);
            return Err(match e {
                IngestError::ExtractionSubmission(_) => e,
                other => IngestError::ExtractionSubmission(other.to_string()),
            });
        }

        info!(
            "Submitted episode {} for group {}",
            episode.name, episode.group_id
        );
        Ok(SubmissionEcho {
            name: episode.name,
            group_id: episode.group_id,
            reference_time,
        })
    }
}

// ============================================================================
// Conversation episodes
// ============================================================================

const SNIPPET_CHARS: usize = 160;

/// Builds the episode describing one captured request.
pub fn conversation_episode(ctx: &ConversationContext) -> Episode {
    Episode {
        name: format!("Request {}", ctx.request_id),
        body: conversation_episode_body(ctx),
        source_kind: SourceKind::Message,
        source_description: "coding assistant conversation".to_string(),
        reference_time: Some(ctx.timestamp),
        group_id: GroupId(ctx.project_id.clone()),
    }
}

pub fn conversation_episode_body(ctx: &ConversationContext) -> String {
    let mut lines = vec![
        format!("=== CODING CONVERSATION: {} ===", ctx.chat_meta.chat_id),
        format!(
            "Mode: {} | Project: {}",
            ctx.chat_meta.chat_mode.as_deref().unwrap_or("unknown"),
            ctx.project_id
        ),
        String::new(),
        "=== CONVERSATION ===".to_string(),
    ];

    let mut messages: Vec<_> = ctx.messages.iter().collect();
    messages.sort_by_key(|m| m.sequence);
    for message in messages {
        lines.push(format!("[{}]", message.role.to_uppercase()));
        lines.push(
            message
                .content_summary
                .as_deref()
                .unwrap_or("(no content)")
                .to_string(),
        );
        lines.push(String::new());
    }

    if !ctx.context_files.is_empty() {
        lines.push("=== CONTEXT FILES ===".to_string());
        for file in &ctx.context_files {
            lines.push(format!(
                "- {} (relevance: {:.2})",
                file.file_path, file.usefulness
            ));
        }
        lines.push(String::new());
    }

    if !ctx.tool_calls.is_empty() {
        lines.push("=== TOOLS USED ===".to_string());
        let tools: BTreeSet<&str> = ctx.tool_calls.iter().map(|t| t.tool_name.as_str()).collect();
        lines.push(format!("Tools: {}", tools.into_iter().collect::<Vec<_>>().join(", ")));
        lines.push(format!("Total calls: {}", ctx.tool_calls.len()));
    }

    lines.join("\n").trim_end().to_string()
}

/// One-line description of a request: leading messages, files, tools.
pub fn conversation_summary(ctx: &ConversationContext) -> String {
    let mut parts = Vec::new();

    let mut messages: Vec<_> = ctx.messages.iter().collect();
    messages.sort_by_key(|m| m.sequence);
    for message in messages.into_iter().take(2) {
        if let Some(content) = message.content_summary.as_deref() {
            parts.push(format!(
                "{}: {}",
                message.role.to_uppercase(),
                truncate(content, SNIPPET_CHARS)
            ));
        }
    }

    if !ctx.context_files.is_empty() {
        let files: Vec<&str> = ctx
            .context_files
            .iter()
            .take(3)
            .map(|f| f.file_path.as_str())
            .collect();
        parts.push(format!("FILES: {}", files.join(", ")));
    }

    if !ctx.tool_calls.is_empty() {
        let tools: BTreeSet<&str> = ctx.tool_calls.iter().map(|t| t.tool_name.as_str()).collect();
        parts.push(format!(
            "TOOLS: {}",
            tools.into_iter().collect::<Vec<_>>().join(", ")
        ));
    }

    if parts.is_empty() {
        format!("Conversation {}", ctx.chat_meta.chat_id)
    } else {
        parts.join(" | ")
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(max_chars).collect();
    format!("{}...", cut.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use memory_graph_schemas::{ChatMeta, ContextFilePayload, MessagePayload, ToolCallPayload};
    use std::sync::Mutex;

    fn context() -> ConversationContext {
        ConversationContext {
            request_id: "req-1".into(),
            project_id: "proj".into(),
            timestamp: Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap(),
            chat_meta: ChatMeta {
                chat_id: "chat-9".into(),
                chat_mode: Some("agent".into()),
                ..Default::default()
            },
            model: None,
            messages: vec![
                MessagePayload {
                    role: "assistant".into(),
                    sequence: 1,
                    content_summary: Some("Use a token bucket".into()),
                    content_hash: None,
                    prompt_tokens: None,
                    completion_tokens: None,
                    total_tokens: None,
                },
                MessagePayload {
                    role: "user".into(),
                    sequence: 0,
                    content_summary: Some("How do I rate limit?".into()),
                    content_hash: None,
                    prompt_tokens: None,
                    completion_tokens: None,
                    total_tokens: None,
                },
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
                tool_call_id: "t1".into(),
                tool_name: "read_file".into(),
                arguments_hash: None,
                status: "success".into(),
                execution_time_ms: Some(12),
                diff_chunk_id: None,
            }],
            checkpoints: vec![],
            code_changes: vec![],
        }
    }

    struct RecordingService {
        seen: Mutex<Vec<Episode>>,
        fail: bool,
    }

    #[async_trait]
    impl ExtractionService for RecordingService {
        async fn submit(&self, episode: &Episode) -> Result<()> {
            if self.fail {
                return Err(IngestError::Config("service down".into()));
            }
            self.seen.lock().unwrap().push(episode.clone());
            Ok(())
        }
    }

    #[test]
    fn test_episode_body_sections() {
        let body = conversation_episode_body(&context());

        assert!(body.starts_with("=== CODING CONVERSATION: chat-9 ==="));
        assert!(body.contains("Mode: agent | Project: proj"));
        let user = body.find("[USER]").unwrap();
        let assistant = body.find("[ASSISTANT]").unwrap();
        assert!(user < assistant);
        assert!(body.contains("- a.py (relevance: 0.90)"));
        assert!(body.ends_with("Total calls: 1"));
    }

    #[test]
    fn test_summary_lists_messages_files_and_tools() {
        let summary = conversation_summary(&context());
        assert_eq!(
            summary,
            "USER: How do I rate limit? | ASSISTANT: Use a token bucket | FILES: a.py | TOOLS: read_file"
        );
    }

    #[test]
    fn test_truncate_marks_cut() {
        assert_eq!(truncate("abcdef", 3), "abc...");
        assert_eq!(truncate("  abc ", 3), "abc");
    }

    #[tokio::test]
    async fn test_submitter_fills_reference_time() {
        let service = Arc::new(RecordingService {
            seen: Mutex::new(Vec::new()),
            fail: false,
        });
        let submitter = EpisodeSubmitter::new(service.clone());

        let mut episode = conversation_episode(&context());
        episode.reference_time = None;
        let before = Utc::now();
        let echo = submitter.submit(episode).await.unwrap();

        assert_eq!(echo.name, "Request req-1");
        assert!(echo.reference_time >= before);
        let seen = service.seen.lock().unwrap();
        assert_eq!(seen[0].reference_time, Some(echo.reference_time));
    }

    #[tokio::test]
    async fn test_submitter_surfaces_retryable_error() {
        let submitter = EpisodeSubmitter::new(Arc::new(RecordingService {
            seen: Mutex::new(Vec::new()),
            fail: true,
        }));

        let err = submitter
            .submit(conversation_episode(&context()))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::ExtractionSubmission(_)));
        assert!(err.is_retryable());
    }
}
