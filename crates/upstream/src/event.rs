//! Parsing of upstream stream events.
//!
//! Each `data:` payload is JSON with an `event` discriminator, an optional
//! `conversation_id` (top-level or inside `data`), and content fields whose
//! location varies by event type.

use serde_json::Value;

/// One parsed upstream event.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StreamEvent {
    /// `message` / `agent_message` content.
    Content { text: String },
    /// `agent_thought` content (shown or suppressed per config).
    Thought { text: String },
    /// Upstream-reported error; permanently fails the stream.
    Error { code: String, message: String },
    /// `message_end`, `done`, or the `[DONE]` sentinel.
    End,
    /// Heartbeat.
    Ping,
    /// Anything else; logged and skipped.
    Unknown { event: String },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ParsedEvent {
    pub event: StreamEvent,
    pub conversation_id: Option<String>,
}

/// Parse one `data:` payload.
///
/// Returns `None` for payloads that are not JSON and not the `[DONE]`
/// sentinel — those are logged by the caller and skipped rather than
/// failing the stream.
pub(crate) fn parse_data_line(data: &str) -> Option<ParsedEvent> {
    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(_) => {
            if data.contains("[DONE]") {
                return Some(ParsedEvent {
                    event: StreamEvent::End,
                    conversation_id: None,
                });
            }
            return None;
        }
    };

    let event_name = v.get("event").and_then(Value::as_str).unwrap_or("");
    let conversation_id = extract_conversation_id(&v);

    let event = match event_name {
        "message" | "agent_message" => {
            match extract_content(&v, event_name == "agent_message") {
                Some(text) => StreamEvent::Content { text },
                None => StreamEvent::Unknown {
                    event: format!("{event_name} without content"),
                },
            }
        }
        "agent_thought" => {
            let text = v
                .get("thought")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if text.is_empty() {
                StreamEvent::Unknown {
                    event: "agent_thought without content".into(),
                }
            } else {
                StreamEvent::Thought { text }
            }
        }
        "error" => StreamEvent::Error {
            code: field(&v, "error_code"),
            message: {
                let msg = field(&v, "error");
                if msg.is_empty() { field(&v, "message") } else { msg }
            },
        },
        "message_end" | "done" => StreamEvent::End,
        "ping" => StreamEvent::Ping,
        other => StreamEvent::Unknown {
            event: other.to_string(),
        },
    };

    Some(ParsedEvent {
        event,
        conversation_id,
    })
}

/// First-non-empty content rule: top-level `answer` (agent_message only),
/// then `data.text`, `data.answer`, `data.message`.
fn extract_content(v: &Value, is_agent_message: bool) -> Option<String> {
    if is_agent_message {
        if let Some(answer) = v.get("answer").and_then(Value::as_str) {
            if !answer.is_empty() {
                return Some(answer.to_string());
            }
        }
    }
    let data = v.get("data")?;
    for key in ["text", "answer", "message"] {
        if let Some(text) = data.get(key).and_then(Value::as_str) {
            if !text.is_empty() {
                return Some(text.to_string());
            }
        }
    }
    None
}

fn extract_conversation_id(v: &Value) -> Option<String> {
    let top = v.get("conversation_id").and_then(Value::as_str);
    let nested = v
        .get("data")
        .and_then(|d| d.get("conversation_id"))
        .and_then(Value::as_str);
    top.or(nested)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

/// Read a string field from the top level or the `data` subobject.
fn field(v: &Value, key: &str) -> String {
    v.get(key)
        .and_then(Value::as_str)
        .or_else(|| v.get("data").and_then(|d| d.get(key)).and_then(Value::as_str))
        .unwrap_or_default()
        .to_string()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
