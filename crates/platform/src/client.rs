//! The platform HTTP client: card entity lifecycle, streaming element
//! updates, and plain message sending.
//!
//! Element updates carry a process-wide monotonic `sequence` plus a fresh
//! uuid per request. The card service orders updates by sequence and
//! discards anything out of order, so sequences are never reused or
//! decremented.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use cf_domain::error::{Error, Result};

use crate::auth::TokenCache;
use crate::cards;
use crate::util::from_reqwest;

pub use crate::cards::ELEMENT_ID;

/// Per-update deadline for one element-content PUT.
const CARD_PUT_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle to a card that has been attached to a chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardInfo {
    pub card_entity_id: String,
    pub message_id: String,
    pub element_id: String,
}

impl CardInfo {
    pub fn new(card_entity_id: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            card_entity_id: card_entity_id.into(),
            message_id: message_id.into(),
            element_id: ELEMENT_ID.to_owned(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Capability trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The card-platform surface the orchestrator drives.
#[async_trait::async_trait]
pub trait CardSurface: Send + Sync {
    /// Create a card entity; returns the card id.
    async fn create_card(&self, content: &str) -> Result<String>;

    /// Send an interactive message attaching a card entity to a chat;
    /// returns the message id.
    async fn send_interactive_card(&self, chat_id: &str, card_id: &str) -> Result<String>;

    /// Send a plain text message to a chat.
    async fn send_text(&self, chat_id: &str, text: &str) -> Result<()>;

    /// Fallback for an unavailable pool: create a minimal streaming card
    /// inline and post it to the chat in one go.
    async fn post_inline_card(&self, chat_id: &str) -> Result<CardInfo>;

    /// PUT the current text prefix to a card's content element.
    async fn update_card_text(&self, card: &CardInfo, text: &str) -> Result<()>;

    /// Turn off the card's typewriter animation. Best-effort.
    async fn close_streaming_mode(&self, card_entity_id: &str) -> Result<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Deserialize)]
struct ApiResponse<T> {
    code: i64,
    #[serde(default)]
    msg: String,
    data: Option<T>,
}

#[derive(Deserialize)]
struct CreatedCard {
    card_id: String,
}

#[derive(Deserialize)]
struct SentMessage {
    message_id: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// PlatformClient
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct PlatformClient {
    base_url: String,
    tokens: Arc<TokenCache>,
    client: reqwest::Client,
    sequence: AtomicI64,
}

impl PlatformClient {
    pub fn new(base_url: &str, tokens: Arc<TokenCache>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(from_reqwest)?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
            client,
            sequence: AtomicI64::new(0),
        })
    }

    /// Next value of the process-wide update sequence.
    pub fn next_sequence(&self) -> i64 {
        self.sequence.fetch_add(1, Ordering::AcqRel) + 1
    }

    async fn authed(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder> {
        let token = self.tokens.get_token().await?;
        Ok(builder.header("Authorization", format!("Bearer {token}")))
    }

    /// Send a request and unwrap the `{code, msg, data}` envelope.
    async fn execute<T: serde::de::DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<T> {
        let resp = self
            .authed(builder)
            .await?
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::InvalidResponse(format!(
                "platform status {status}: {body}"
            )));
        }

        let parsed: ApiResponse<T> = resp.json().await.map_err(from_reqwest)?;
        if parsed.code != 0 {
            return Err(Error::Platform {
                code: parsed.code,
                message: parsed.msg,
            });
        }
        parsed
            .data
            .ok_or_else(|| Error::InvalidResponse("platform response missing data".into()))
    }

    /// Like [`Self::execute`] for endpoints whose success response carries
    /// no interesting `data`.
    async fn execute_unit(&self, builder: reqwest::RequestBuilder) -> Result<()> {
        let resp = self
            .authed(builder)
            .await?
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::InvalidResponse(format!(
                "platform status {status}: {body}"
            )));
        }

        let parsed: ApiResponse<serde_json::Value> = resp.json().await.map_err(from_reqwest)?;
        if parsed.code != 0 {
            return Err(Error::Platform {
                code: parsed.code,
                message: parsed.msg,
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl CardSurface for PlatformClient {
    async fn create_card(&self, content: &str) -> Result<String> {
        let card_json = serde_json::to_string(&cards::streaming_card(content))?;
        let url = format!("{}/cardkit/v1/cards/", self.base_url);
        let created: CreatedCard = self
            .execute(self.client.post(&url).json(&json!({
                "type": "card_json",
                "data": card_json,
            })))
            .await?;
        tracing::debug!(card_id = %created.card_id, "card entity created");
        Ok(created.card_id)
    }

    async fn send_interactive_card(&self, chat_id: &str, card_id: &str) -> Result<String> {
        let content = serde_json::to_string(&cards::card_attachment(card_id))?;
        let url = format!(
            "{}/im/v1/messages?receive_id_type=chat_id",
            self.base_url
        );
        let sent: SentMessage = self
            .execute(self.client.post(&url).json(&json!({
                "receive_id": chat_id,
                "msg_type": "interactive",
                "content": content,
                "uuid": uuid::Uuid::new_v4().to_string(),
            })))
            .await?;
        Ok(sent.message_id)
    }

    async fn send_text(&self, chat_id: &str, text: &str) -> Result<()> {
        let content = serde_json::to_string(&json!({ "text": text }))?;
        let url = format!(
            "{}/im/v1/messages?receive_id_type=chat_id",
            self.base_url
        );
        self.execute_unit(self.client.post(&url).json(&json!({
            "receive_id": chat_id,
            "msg_type": "text",
            "content": content,
            "uuid": uuid::Uuid::new_v4().to_string(),
        })))
        .await
    }

    async fn post_inline_card(&self, chat_id: &str) -> Result<CardInfo> {
        let card_json = serde_json::to_string(&cards::simple_streaming_card(cards::PROCESSING_TEXT))?;
        let url = format!("{}/cardkit/v1/cards/", self.base_url);
        let created: CreatedCard = self
            .execute(self.client.post(&url).json(&json!({
                "type": "card_json",
                "data": card_json,
            })))
            .await?;
        let message_id = self
            .send_interactive_card(chat_id, &created.card_id)
            .await?;
        Ok(CardInfo::new(created.card_id, message_id))
    }

    async fn update_card_text(&self, card: &CardInfo, text: &str) -> Result<()> {
        let sequence = self.next_sequence();
        let url = format!(
            "{}/cardkit/v1/cards/{}/elements/{}/content",
            self.base_url, card.card_entity_id, card.element_id
        );
        self.execute_unit(
            self.client
                .put(&url)
                .timeout(CARD_PUT_TIMEOUT)
                .json(&json!({
                    "content": text,
                    "sequence": sequence,
                    "uuid": uuid::Uuid::new_v4().to_string(),
                })),
        )
        .await
    }

    async fn close_streaming_mode(&self, card_entity_id: &str) -> Result<()> {
        let url = format!(
            "{}/cardkit/v1/cards/{}/config",
            self.base_url, card_entity_id
        );
        self.execute_unit(self.client.put(&url).json(&json!({
            "config": { "streaming_mode": false },
        })))
        .await
    }
}

/// Pool-facing creation: a fresh streaming card with the default
/// processing text.
#[async_trait::async_trait]
impl crate::pool::CardCreator for PlatformClient {
    async fn create_card(&self) -> Result<String> {
        CardSurface::create_card(self, cards::PROCESSING_TEXT).await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
