//! Dify adapter.
//!
//! Implements [`AiProvider`] against the Dify chat-messages API: the
//! history rides in `inputs.history` as a JSON string, the new user turn
//! is the `query`, and the response arrives as a newline-delimited SSE
//! stream. A per-user conversation handle keeps server-side threading
//! alive across turns.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use cf_domain::config::Config;
use cf_domain::error::{Error, Result};
use cf_domain::message::Message;

use crate::conversation::{spawn_sweeper, ConversationCache};
use crate::emit::EmitBuffer;
use crate::event::{parse_data_line, StreamEvent};
use crate::provider::AiProvider;
use crate::sse::{drain_data_lines, flush_remainder};
use crate::util::from_reqwest;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Constants
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const DEFAULT_USER_ID: &str = "feishu-bot";
const RETRY_INTERVAL: Duration = Duration::from_secs(1);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const STALE_CONVERSATION_MARKER: &str = "Conversation Not Exists";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct DifyProvider {
    api_url: String,
    api_key: String,
    max_retries: u32,
    emit_thoughts: bool,
    client: reqwest::Client,
    conversations: Arc<ConversationCache>,
    sweeper_shutdown: CancellationToken,
}

impl DifyProvider {
    /// Build the adapter from config. Must be called inside a Tokio
    /// runtime (the conversation sweeper is spawned here).
    pub fn from_config(cfg: &Config) -> Result<Self> {
        if cfg.ai_api_url.is_empty() {
            return Err(Error::Config("ai_api_url is not set".into()));
        }

        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(cfg.ai_timeout())
            .pool_max_idle_per_host(100)
            .pool_idle_timeout(Duration::from_secs(90))
            // Compressed bodies defeat incremental SSE delivery.
            .no_gzip()
            .build()
            .map_err(from_reqwest)?;

        let conversations = Arc::new(ConversationCache::new());
        let sweeper_shutdown = CancellationToken::new();
        spawn_sweeper(conversations.clone(), sweeper_shutdown.clone());

        Ok(Self {
            api_url: cfg.ai_api_url.trim_end_matches('/').to_string(),
            api_key: cfg.ai_api_key.clone(),
            max_retries: cfg.ai_max_retries,
            emit_thoughts: cfg.emit_thoughts,
            client,
            conversations,
            sweeper_shutdown,
        })
    }

    pub fn conversations(&self) -> &ConversationCache {
        &self.conversations
    }

    // ── Internal helpers ───────────────────────────────────────────

    async fn do_stream_request(
        &self,
        body: &Value,
        user_id: &str,
        sent_conversation_id: &str,
        out: &mpsc::Sender<String>,
    ) -> Result<()> {
        let url = format!("{}/v1/chat-messages", self.api_url);
        tracing::debug!(url = %url, user = %user_id, "upstream stream request");

        let resp = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .header("Cache-Control", "no-cache")
            .header("Connection", "keep-alive")
            .header("Authorization", bearer_value(&self.api_key))
            .json(body)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }

        let mut resp = resp;
        let mut buffer = String::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut emit = EmitBuffer::new(out.clone());
        let mut current_conversation = sent_conversation_id.to_string();

        loop {
            match resp.chunk().await {
                Ok(Some(bytes)) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                    for data in drain_data_lines(&mut buffer) {
                        if self.handle_payload(
                            &data,
                            user_id,
                            &mut current_conversation,
                            &mut seen,
                            &mut emit,
                        )? {
                            emit.flush()?;
                            return Ok(());
                        }
                    }
                }
                Ok(None) => {
                    // Body closed without an end event -- process any
                    // trailing partial line and finish normally.
                    for data in flush_remainder(&mut buffer) {
                        if self.handle_payload(
                            &data,
                            user_id,
                            &mut current_conversation,
                            &mut seen,
                            &mut emit,
                        )? {
                            break;
                        }
                    }
                    emit.flush()?;
                    return Ok(());
                }
                Err(e) => return Err(from_reqwest(e)),
            }
        }
    }

    /// Dispatch one parsed payload. Returns `Ok(true)` when the stream
    /// ended normally.
    fn handle_payload(
        &self,
        data: &str,
        user_id: &str,
        current_conversation: &mut String,
        seen: &mut HashSet<String>,
        emit: &mut EmitBuffer,
    ) -> Result<bool> {
        let Some(parsed) = parse_data_line(data) else {
            tracing::debug!(payload = %data, "skipping unparseable stream payload");
            return Ok(false);
        };

        if let Some(cid) = parsed.conversation_id {
            if cid != *current_conversation {
                tracing::debug!(user = %user_id, conversation = %cid, "storing conversation id");
                self.conversations.store(user_id, &cid);
                *current_conversation = cid;
            }
        }

        match parsed.event {
            StreamEvent::Content { text } => {
                if seen.insert(text.clone()) {
                    emit.push(&text)?;
                }
            }
            StreamEvent::Thought { text } => {
                if self.emit_thoughts && seen.insert(text.clone()) {
                    emit.push(&text)?;
                }
            }
            StreamEvent::Error { code, message } => {
                let detail = if code.is_empty() {
                    format!("stream error: {message}")
                } else {
                    format!("stream error: [{code}] {message}")
                };
                return Err(Error::InvalidResponse(detail));
            }
            StreamEvent::End => return Ok(true),
            StreamEvent::Ping => {}
            StreamEvent::Unknown { event } => {
                tracing::debug!(event = %event, "unknown stream event");
            }
        }
        Ok(false)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request building
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn build_request_body(
    history: &[Message],
    query: &str,
    conversation_id: &str,
    user_id: &str,
) -> Result<Value> {
    // The upstream takes the history as a JSON *string* inside inputs.
    let history_json = if history.is_empty() {
        "[]".to_string()
    } else {
        let turns: Vec<Value> = history
            .iter()
            .map(|m| json!({ "role": m.role, "content": m.content }))
            .collect();
        serde_json::to_string(&turns)?
    };

    Ok(json!({
        "inputs": { "history": history_json },
        "query": query,
        "response_mode": "streaming",
        "conversation_id": conversation_id,
        "user": user_id,
    }))
}

fn resolve_user_id(last: &Message) -> String {
    last.metadata
        .get("user_id")
        .filter(|id| !id.is_empty())
        .cloned()
        .unwrap_or_else(|| DEFAULT_USER_ID.to_string())
}

fn bearer_value(api_key: &str) -> String {
    if api_key.starts_with("Bearer ") {
        api_key.to_owned()
    } else {
        format!("Bearer {api_key}")
    }
}

fn classify_status(status: reqwest::StatusCode, body: &str) -> Error {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        Error::RateLimited(format!("status {status}: {body}"))
    } else if status.is_server_error() {
        Error::ConnectionFailed(format!("status {status}: {body}"))
    } else {
        Error::InvalidResponse(format!("unexpected status {status}: {body}"))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl AiProvider for DifyProvider {
    async fn stream_chat(&self, messages: &[Message], out: mpsc::Sender<String>) -> Result<()> {
        let Some((last, history)) = messages.split_last() else {
            return Err(Error::InvalidMessage("messages cannot be empty".into()));
        };
        for msg in messages {
            msg.validate()?;
        }
        let user_id = resolve_user_id(last);
        let mut conversation_id = self.conversations.get(&user_id).unwrap_or_default();

        let mut reissued_without_conversation = false;
        let mut last_error: Option<Error> = None;
        let mut attempt: u32 = 0;

        while attempt <= self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(RETRY_INTERVAL * attempt).await;
                tracing::debug!(attempt, max = self.max_retries, "retrying upstream request");
            }

            let body = build_request_body(history, &last.content, &conversation_id, &user_id)?;
            match self
                .do_stream_request(&body, &user_id, &conversation_id, &out)
                .await
            {
                Ok(()) => return Ok(()),
                Err(err) => {
                    // The upstream forgot the conversation we referenced:
                    // drop the handle and reissue once without it. Does
                    // not consume the retry budget.
                    if !conversation_id.is_empty()
                        && !reissued_without_conversation
                        && err.to_string().contains(STALE_CONVERSATION_MARKER)
                    {
                        tracing::info!(user = %user_id, "stale conversation id, reissuing without it");
                        self.conversations.clear(&user_id);
                        conversation_id.clear();
                        reissued_without_conversation = true;
                        continue;
                    }
                    if !err.is_temporary() {
                        return Err(err);
                    }
                    tracing::warn!(attempt, error = %err, "upstream request failed");
                    last_error = Some(err);
                }
            }
            attempt += 1;
        }

        Err(Error::ConnectionFailed(format!(
            "max retries exceeded: {}",
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    fn conversation_id(&self, user_id: &str) -> Option<String> {
        self.conversations.get(user_id)
    }

    fn shutdown(&self) {
        self.sweeper_shutdown.cancel();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
