//! Static card payload builders.
//!
//! Cards use the platform's card JSON 2.0 schema. The streaming card has a
//! single markdown element whose `element_id` is the fixed target of all
//! incremental content updates.

use serde_json::{json, Value};

/// The element that streaming updates target.
pub const ELEMENT_ID: &str = "content_block";

/// Card body shown while the reply is being generated.
pub const PROCESSING_TEXT: &str = "Thinking, one moment...";

/// Build the streaming card entity payload: streaming mode on, typewriter
/// pacing configured per client platform, one markdown content element.
pub fn streaming_card(content: &str) -> Value {
    json!({
        "schema": "2.0",
        "header": {
            "title": { "content": "AI reply", "tag": "plain_text" },
        },
        "config": {
            "streaming_mode": true,
            "summary": { "content": "[generating]" },
            "streaming_config": {
                "print_frequency_ms": { "default": 30, "android": 25, "ios": 40, "pc": 50 },
                "print_step": { "default": 2, "android": 3, "ios": 4, "pc": 5 },
                "print_strategy": "fast",
            },
        },
        "body": {
            "elements": [
                { "tag": "markdown", "content": content, "element_id": ELEMENT_ID },
            ],
        },
    })
}

/// Minimal streaming card used when the pool is unavailable and the card
/// has to be created inline on the request path.
pub fn simple_streaming_card(content: &str) -> Value {
    json!({
        "schema": "2.0",
        "config": { "streaming_mode": true, "update_multi": true },
        "body": {
            "elements": [
                { "tag": "markdown", "content": content, "element_id": ELEMENT_ID },
            ],
        },
    })
}

/// The interactive-message content that attaches a card entity to a chat
/// message.
pub fn card_attachment(card_id: &str) -> Value {
    json!({
        "type": "card",
        "data": { "card_id": card_id },
    })
}
