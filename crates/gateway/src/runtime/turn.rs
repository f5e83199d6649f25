//! Turn orchestration: one inbound chat message end to end.
//!
//! The engine single-flights per session, attaches a pooled card to the
//! chat, drives the streaming adapter on a bounded channel, renders the
//! growing answer prefix into the card, and persists the turn on success.
//! Three timers bound the work: an overall deadline, a stream-processing
//! deadline, and a no-new-content watchdog that resets on every token.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use cf_domain::error::{Error, Result};
use cf_domain::message::{Message, Role};
use cf_platform::{CardInfo, CardPool, CardSurface};
use cf_sessions::SessionCache;
use cf_upstream::AiProvider;

use super::access::AccessControl;
use super::gate::SessionGate;
use super::processed::ProcessedCache;
use super::MsgInfo;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// User-visible final texts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub const BUSY_TEXT: &str = "Your previous message is still being processed, please wait.";
pub const RATE_LIMITED_TEXT: &str = "You have reached the maximum message count for today.";
pub const NO_CONTENT_TEXT: &str = "Request timed out, no response received.";
pub const STREAM_TIMEOUT_TEXT: &str = "Processing timed out, please retry.";
pub const OVERALL_TIMEOUT_TEXT: &str = "Request timed out.";
pub const EMPTY_ANSWER_TEXT: &str = "Sorry, no valid reply was produced.";
pub const CLEARED_TEXT: &str = "Conversation context cleared. The next message starts fresh.";
pub const HELP_TEXT: &str = "I stream AI replies into this chat.\n\
    Reply `/clear` to drop the conversation context, `/help` to see this again.";

const TOKEN_CHANNEL_CAPACITY: usize = 10;
const CARD_UPDATE_ATTEMPTS: u32 = 3;
const CARD_UPDATE_BACKOFF: Duration = Duration::from_millis(100);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Timeouts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The turn's three-layer timeout tree.
#[derive(Debug, Clone, Copy)]
pub struct TurnTimeouts {
    /// Hard deadline for the whole turn.
    pub overall: Duration,
    /// Deadline for stream processing specifically.
    pub stream: Duration,
    /// Watchdog: fires when no new token arrives for this long.
    pub idle: Duration,
}

impl Default for TurnTimeouts {
    fn default() -> Self {
        Self {
            overall: Duration::from_secs(60),
            stream: Duration::from_secs(55),
            idle: Duration::from_secs(10),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TurnEngine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct TurnEngine {
    sessions: Arc<SessionCache>,
    pool: CardPool,
    surface: Arc<dyn CardSurface>,
    provider: Arc<dyn AiProvider>,
    gate: SessionGate,
    processed: ProcessedCache,
    access: AccessControl,
    timeouts: TurnTimeouts,
}

enum Outcome {
    Finished,
    StreamError(Error),
    IdleTimeout,
    StreamTimeout,
    OverallTimeout,
}

impl TurnEngine {
    pub fn new(
        sessions: Arc<SessionCache>,
        pool: CardPool,
        surface: Arc<dyn CardSurface>,
        provider: Arc<dyn AiProvider>,
        access: AccessControl,
        timeouts: TurnTimeouts,
    ) -> Self {
        Self {
            sessions,
            pool,
            surface,
            provider,
            gate: SessionGate::new(),
            processed: ProcessedCache::default(),
            access,
            timeouts,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionCache> {
        &self.sessions
    }

    /// Entry point for one inbound message: idempotency, access control,
    /// command short-circuits, then the streaming pipeline.
    pub async fn process(&self, info: MsgInfo) {
        if self.processed.check_and_insert(&info.msg_id) {
            tracing::debug!(msg_id = %info.msg_id, "event already processed");
            return;
        }

        if !self.access.allow_and_increment(&info.user_id) {
            tracing::info!(user_id = %info.user_id, "daily message limit reached");
            let _ = self.surface.send_text(&info.chat_id, RATE_LIMITED_TEXT).await;
            return;
        }

        match info.text.trim() {
            "/clear" | "clear" => {
                self.sessions.clear(&info.session_id);
                let _ = self.surface.send_text(&info.chat_id, CLEARED_TEXT).await;
            }
            "/help" | "help" => {
                let _ = self.surface.send_text(&info.chat_id, HELP_TEXT).await;
            }
            _ => {
                if let Err(e) = self.handle_chat(info).await {
                    tracing::error!(error = %e, "turn failed before card creation");
                }
            }
        }
    }

    /// The streaming pipeline proper.
    async fn handle_chat(&self, info: MsgInfo) -> Result<()> {
        let Some(_claim) = self.gate.try_acquire(&info.session_id) else {
            tracing::info!(session_id = %info.session_id, "session busy, rejecting");
            let _ = self.surface.send_text(&info.chat_id, BUSY_TEXT).await;
            return Ok(());
        };

        // Duplicate inbound: drop silently, no card, no upstream call.
        if self.sessions.is_duplicate_message(&info.user_id, &info.msg_id) {
            tracing::info!(msg_id = %info.msg_id, "duplicate inbound message dropped");
            return Ok(());
        }

        let overall_deadline = tokio::time::Instant::now() + self.timeouts.overall;

        let mut messages = self.sessions.get_messages(&info.session_id);
        messages.push(
            Message::new(Role::User, info.text.clone())
                .with_meta("session_id", &info.session_id)
                .with_meta("user_id", &info.user_id),
        );

        let card = self.acquire_card(&info).await?;

        // The engine owns the channel pair; the adapter task owns the
        // Sender and closes it by dropping it on return.
        let (tx, mut rx) = mpsc::channel::<String>(TOKEN_CHANNEL_CAPACITY);
        let provider = self.provider.clone();
        let request = messages.clone();
        let mut stream_task =
            tokio::spawn(async move { provider.stream_chat(&request, tx).await });

        let mut answer = String::new();

        let stream_timer =
            tokio::time::sleep_until(tokio::time::Instant::now() + self.timeouts.stream);
        let overall_timer = tokio::time::sleep_until(overall_deadline);
        let idle_timer = tokio::time::sleep(self.timeouts.idle);
        tokio::pin!(stream_timer, overall_timer, idle_timer);

        let outcome = loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Some(token) => {
                        answer.push_str(&token);
                        self.update_with_retry(&card, &answer).await;
                        idle_timer
                            .as_mut()
                            .reset(tokio::time::Instant::now() + self.timeouts.idle);
                    }
                    None => {
                        break match (&mut stream_task).await {
                            Ok(Ok(())) => Outcome::Finished,
                            Ok(Err(e)) => Outcome::StreamError(e),
                            Err(join) => Outcome::StreamError(Error::Other(join.to_string())),
                        };
                    }
                },
                _ = idle_timer.as_mut() => break Outcome::IdleTimeout,
                _ = stream_timer.as_mut() => break Outcome::StreamTimeout,
                _ = overall_timer.as_mut() => break Outcome::OverallTimeout,
            }
        };

        match outcome {
            Outcome::Finished => {
                if answer.is_empty() {
                    self.finish_card(&card, EMPTY_ANSWER_TEXT).await;
                    return Ok(());
                }
                self.finish_card(&card, &answer).await;
                self.persist_turn(&info, &card, messages, &answer);
            }
            Outcome::StreamError(e) => {
                tracing::error!(error = %e, session_id = %info.session_id, "stream failed");
                self.finish_card(&card, &format!("Chat failed: {e}")).await;
            }
            Outcome::IdleTimeout => {
                stream_task.abort();
                self.finish_card(&card, NO_CONTENT_TEXT).await;
            }
            Outcome::StreamTimeout => {
                stream_task.abort();
                self.finish_card(&card, STREAM_TIMEOUT_TEXT).await;
            }
            Outcome::OverallTimeout => {
                stream_task.abort();
                self.finish_card(&card, OVERALL_TIMEOUT_TEXT).await;
            }
        }
        Ok(())
    }

    /// Get a pooled card and attach it to the chat; when the pool fails,
    /// fall back to creating a minimal card inline. Either way the reply
    /// message id completes the [`CardInfo`].
    async fn acquire_card(&self, info: &MsgInfo) -> Result<CardInfo> {
        match self.pool.get_card().await {
            Ok(card_id) => {
                let message_id = self
                    .surface
                    .send_interactive_card(&info.chat_id, &card_id)
                    .await?;
                Ok(CardInfo::new(card_id, message_id))
            }
            Err(e) => {
                tracing::warn!(error = %e, "card pool unavailable, creating card inline");
                self.surface.post_inline_card(&info.chat_id).await
            }
        }
    }

    /// PUT the current text with bounded retry; failures are logged and
    /// swallowed so streaming continues.
    async fn update_with_retry(&self, card: &CardInfo, text: &str) {
        for attempt in 1..=CARD_UPDATE_ATTEMPTS {
            match self.surface.update_card_text(card, text).await {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!(
                        attempt,
                        card_id = %card.card_entity_id,
                        error = %e,
                        "card update failed"
                    );
                    if attempt < CARD_UPDATE_ATTEMPTS {
                        tokio::time::sleep(CARD_UPDATE_BACKOFF * attempt).await;
                    }
                }
            }
        }
    }

    /// Final text plus best-effort streaming-mode shutdown.
    async fn finish_card(&self, card: &CardInfo, text: &str) {
        self.update_with_retry(card, text).await;
        if let Err(e) = self.surface.close_streaming_mode(&card.card_entity_id).await {
            tracing::warn!(card_id = %card.card_entity_id, error = %e, "close streaming mode failed");
        }
    }

    /// Append the assistant turn and write the history back. Failures are
    /// logged, never surfaced to the user.
    fn persist_turn(&self, info: &MsgInfo, card: &CardInfo, mut messages: Vec<Message>, answer: &str) {
        messages.push(Message::new(Role::Assistant, answer));

        let conversation_id = self
            .provider
            .conversation_id(&info.user_id)
            .or_else(|| {
                self.sessions
                    .get_session_meta(&info.session_id)
                    .map(|m| m.conversation_id)
            })
            .unwrap_or_default();

        if let Err(e) = self.sessions.set_messages(
            &info.session_id,
            &info.user_id,
            messages,
            &card.card_entity_id,
            &info.msg_id,
            &conversation_id,
            "",
        ) {
            tracing::error!(error = %e, session_id = %info.session_id, "failed to persist turn");
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests live in tests/turn_scenarios.rs (they exercise the engine with
// mock provider and card-surface implementations).
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
