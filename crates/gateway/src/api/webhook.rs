//! Webhook endpoints.
//!
//! `/webhook/event` receives the platform's event deliveries: the one-time
//! URL-verification handshake (echo the challenge) and message events,
//! which are normalized into [`MsgInfo`] and processed on their own task
//! so the webhook can acknowledge immediately — slow replies trigger
//! platform-side redelivery.
//!
//! `/webhook/card` receives card-action callbacks.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::actions::{self, CardActionValue};
use crate::runtime::{HandlerType, MsgInfo};
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
struct EventEnvelope {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    challenge: Option<String>,
    #[serde(default)]
    header: Option<EventHeader>,
    #[serde(default)]
    event: Option<MessageEvent>,
}

#[derive(Debug, Deserialize)]
struct EventHeader {
    #[serde(default)]
    event_type: String,
}

#[derive(Debug, Deserialize)]
struct MessageEvent {
    #[serde(default)]
    sender: Option<EventSender>,
    #[serde(default)]
    message: Option<InboundMessage>,
}

#[derive(Debug, Deserialize)]
struct EventSender {
    #[serde(default)]
    sender_id: Option<SenderId>,
}

#[derive(Debug, Deserialize)]
struct SenderId {
    #[serde(default)]
    user_id: String,
    #[serde(default)]
    open_id: String,
}

#[derive(Debug, Deserialize)]
struct InboundMessage {
    #[serde(default)]
    message_id: String,
    #[serde(default)]
    chat_id: String,
    #[serde(default)]
    chat_type: String,
    #[serde(default)]
    message_type: String,
    /// JSON string, e.g. `{"text":"hello @_user_1"}`.
    #[serde(default)]
    content: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handlers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn event(State(state): State<AppState>, Json(body): Json<Value>) -> Json<Value> {
    let envelope: EventEnvelope = match serde_json::from_value(body) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(error = %e, "unparseable event envelope");
            return Json(json!({}));
        }
    };

    // URL-verification handshake: echo the challenge back.
    if envelope.kind.as_deref() == Some("url_verification") {
        let challenge = envelope.challenge.unwrap_or_default();
        return Json(json!({ "challenge": challenge }));
    }

    let event_type = envelope
        .header
        .as_ref()
        .map(|h| h.event_type.as_str())
        .unwrap_or("");
    if event_type != "im.message.receive_v1" {
        tracing::debug!(event_type, "ignoring event");
        return Json(json!({}));
    }

    match envelope.event.and_then(build_msg_info) {
        Some(info) => {
            let engine = state.engine.clone();
            tokio::spawn(async move { engine.process(info).await });
        }
        None => tracing::debug!("message event not processable"),
    }

    Json(json!({}))
}

pub async fn card(State(state): State<AppState>, Json(body): Json<Value>) -> Json<Value> {
    // Card callbacks can also carry the verification handshake.
    if body.get("type").and_then(Value::as_str) == Some("url_verification") {
        let challenge = body.get("challenge").cloned().unwrap_or(Value::Null);
        return Json(json!({ "challenge": challenge }));
    }

    let value = body
        .get("action")
        .and_then(|a| a.get("value"))
        .cloned()
        .unwrap_or(Value::Null);
    match serde_json::from_value::<CardActionValue>(value) {
        Ok(action) => {
            let response = actions::handle_card_action(&state.sessions, action);
            Json(response.unwrap_or_else(|| json!({})))
        }
        Err(e) => {
            tracing::warn!(error = %e, "unparseable card action");
            Json(json!({}))
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Normalization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn build_msg_info(event: MessageEvent) -> Option<MsgInfo> {
    let message = event.message?;
    if message.message_type != "text" {
        tracing::debug!(message_type = %message.message_type, "non-text message ignored");
        return None;
    }

    let sender = event.sender.and_then(|s| s.sender_id).unwrap_or(SenderId {
        user_id: String::new(),
        open_id: String::new(),
    });
    let user_id = if sender.user_id.is_empty() {
        sender.open_id
    } else {
        sender.user_id
    };

    let text = parse_text_content(&message.content)?;
    if text.is_empty() {
        return None;
    }

    let handler_type = match message.chat_type.as_str() {
        "group" => HandlerType::Group,
        "p2p" => HandlerType::Private,
        _ => HandlerType::Other,
    };

    Some(MsgInfo {
        session_id: format!("{}:{}", message.chat_id, user_id),
        user_id,
        msg_id: message.message_id,
        chat_id: message.chat_id,
        handler_type,
        msg_type: message.message_type,
        text,
    })
}

/// Extract `text` from the message content JSON, stripping mention
/// placeholders (`@_user_N`) and trimming whitespace.
fn parse_text_content(content: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct TextContent {
        #[serde(default)]
        text: String,
    }
    let parsed: TextContent = serde_json::from_str(content).ok()?;
    Some(strip_mentions(&parsed.text))
}

fn strip_mentions(text: &str) -> String {
    const MARKER: &str = "@_user_";
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find(MARKER) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos + MARKER.len()..];
        let digits = tail.chars().take_while(char::is_ascii_digit).count();
        rest = &tail[digits..];
    }
    out.push_str(rest);
    out.trim().to_string()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
