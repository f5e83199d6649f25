//! Card-action callbacks.
//!
//! Interactive cards post back a JSON `value` identifying the action kind
//! and the session it belongs to. Dispatch is a flat match on the kind —
//! every kind maps to one handler, no chains.

use serde::Deserialize;
use serde_json::Value;

use cf_domain::message::SessionMode;
use cf_sessions::SessionCache;

/// What an interactive card element asks for when clicked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardKind {
    Clear,
    PicModeChange,
    PicResolution,
    PicTextMore,
    RoleTagsChoose,
    RoleChoose,
}

/// The `value` object carried by a card action callback.
#[derive(Debug, Deserialize)]
pub struct CardActionValue {
    pub kind: CardKind,
    #[serde(rename = "sessionId", default)]
    pub session_id: String,
    #[serde(rename = "messageId", alias = "msgId", default)]
    pub message_id: String,
    #[serde(default)]
    pub value: Value,
}

/// Handle one card action. Returns an optional response payload for the
/// callback reply (the platform replaces the card with it when present).
pub fn handle_card_action(sessions: &SessionCache, action: CardActionValue) -> Option<Value> {
    match action.kind {
        CardKind::Clear => {
            // "1" confirms, anything else cancels the double-check card.
            if action.value.as_str() == Some("1") {
                sessions.clear(&action.session_id);
                tracing::info!(session_id = %action.session_id, "session cleared via card");
            }
            None
        }
        CardKind::PicModeChange => {
            let mode = match action.value.as_str() {
                Some("pic_vary") => SessionMode::PicVary,
                _ => SessionMode::PicCreate,
            };
            sessions.set_mode(&action.session_id, mode);
            None
        }
        CardKind::PicResolution => {
            if let Some(resolution) = action.value.as_str() {
                sessions.set_pic_resolution(&action.session_id, resolution);
            }
            None
        }
        // Image regeneration and role browsing are owned by collaborator
        // services; acknowledge without acting.
        CardKind::PicTextMore | CardKind::RoleTagsChoose | CardKind::RoleChoose => {
            tracing::debug!(kind = ?action.kind, "card action acknowledged");
            None
        }
    }
}
