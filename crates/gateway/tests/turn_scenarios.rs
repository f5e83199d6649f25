//! End-to-end turn scenarios against mock provider and card-surface
//! implementations, with shrunk timeouts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use cf_domain::error::{Error, Result};
use cf_domain::message::{Message, Role};
use cf_gateway::runtime::access::AccessControl;
use cf_gateway::runtime::turn::{
    BUSY_TEXT, CLEARED_TEXT, EMPTY_ANSWER_TEXT, NO_CONTENT_TEXT, RATE_LIMITED_TEXT,
    STREAM_TIMEOUT_TEXT,
};
use cf_gateway::runtime::{HandlerType, MsgInfo, TurnEngine, TurnTimeouts};
use cf_platform::{CardCreator, CardInfo, CardPool, CardSurface};
use cf_sessions::SessionCache;
use cf_upstream::AiProvider;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Mocks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct MockSurface {
    /// Every text PUT against a card element, in order.
    updates: Mutex<Vec<String>>,
    /// Plain text messages sent to chats.
    texts: Mutex<Vec<String>>,
    cards_posted: AtomicUsize,
    inline_posted: AtomicUsize,
    closed: AtomicUsize,
}

#[async_trait::async_trait]
impl CardSurface for MockSurface {
    async fn create_card(&self, _content: &str) -> Result<String> {
        Ok("created-card".into())
    }

    async fn send_interactive_card(&self, _chat_id: &str, _card_id: &str) -> Result<String> {
        self.cards_posted.fetch_add(1, Ordering::AcqRel);
        Ok("reply-msg".into())
    }

    async fn send_text(&self, _chat_id: &str, text: &str) -> Result<()> {
        self.texts.lock().push(text.to_owned());
        Ok(())
    }

    async fn post_inline_card(&self, _chat_id: &str) -> Result<CardInfo> {
        self.cards_posted.fetch_add(1, Ordering::AcqRel);
        self.inline_posted.fetch_add(1, Ordering::AcqRel);
        Ok(CardInfo::new("inline-card", "inline-msg"))
    }

    async fn update_card_text(&self, _card: &CardInfo, text: &str) -> Result<()> {
        self.updates.lock().push(text.to_owned());
        Ok(())
    }

    async fn close_streaming_mode(&self, _card_entity_id: &str) -> Result<()> {
        self.closed.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

struct PoolCreator {
    created: AtomicUsize,
}

impl PoolCreator {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            created: AtomicUsize::new(0),
        })
    }
}

#[async_trait::async_trait]
impl CardCreator for PoolCreator {
    async fn create_card(&self) -> Result<String> {
        let n = self.created.fetch_add(1, Ordering::AcqRel) + 1;
        Ok(format!("pool-card-{n}"))
    }
}

struct FailingCreator;

#[async_trait::async_trait]
impl CardCreator for FailingCreator {
    async fn create_card(&self) -> Result<String> {
        Err(Error::ConnectionFailed("creator offline".into()))
    }
}

/// Emits a fixed token script with per-token delays, then finishes.
struct ScriptedProvider {
    tokens: Vec<(u64, String)>,
    /// Sleep this long after the last token before returning.
    tail_delay: Duration,
    fail_message: Option<String>,
    conversation: Option<String>,
}

impl ScriptedProvider {
    fn ok(tokens: &[(u64, &str)], conversation: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            tokens: tokens
                .iter()
                .map(|(d, t)| (*d, (*t).to_owned()))
                .collect(),
            tail_delay: Duration::ZERO,
            fail_message: None,
            conversation: conversation.map(str::to_owned),
        })
    }

    fn silent(tail_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            tokens: Vec::new(),
            tail_delay,
            fail_message: None,
            conversation: None,
        })
    }

    fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            tokens: Vec::new(),
            tail_delay: Duration::ZERO,
            fail_message: Some(message.to_owned()),
            conversation: None,
        })
    }
}

#[async_trait::async_trait]
impl AiProvider for ScriptedProvider {
    async fn stream_chat(&self, _messages: &[Message], out: mpsc::Sender<String>) -> Result<()> {
        for (delay, token) in &self.tokens {
            tokio::time::sleep(Duration::from_millis(*delay)).await;
            if out.send(token.clone()).await.is_err() {
                return Ok(());
            }
        }
        tokio::time::sleep(self.tail_delay).await;
        match &self.fail_message {
            Some(message) => Err(Error::InvalidResponse(message.clone())),
            None => Ok(()),
        }
    }

    fn conversation_id(&self, _user_id: &str) -> Option<String> {
        self.conversation.clone()
    }

    fn shutdown(&self) {}
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Harness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn quick_timeouts() -> TurnTimeouts {
    TurnTimeouts {
        overall: Duration::from_secs(5),
        stream: Duration::from_secs(4),
        idle: Duration::from_secs(2),
    }
}

async fn build_engine(
    provider: Arc<dyn AiProvider>,
    timeouts: TurnTimeouts,
    access: AccessControl,
) -> (Arc<TurnEngine>, Arc<MockSurface>, Arc<SessionCache>) {
    let sessions = Arc::new(SessionCache::new());
    let pool = CardPool::with_capacity(PoolCreator::new(), 2).await.unwrap();
    let surface = Arc::new(MockSurface::default());
    let engine = Arc::new(TurnEngine::new(
        sessions.clone(),
        pool,
        surface.clone(),
        provider,
        access,
        timeouts,
    ));
    (engine, surface, sessions)
}

fn msg(session_id: &str, user_id: &str, msg_id: &str, text: &str) -> MsgInfo {
    MsgInfo {
        session_id: session_id.to_owned(),
        user_id: user_id.to_owned(),
        msg_id: msg_id.to_owned(),
        chat_id: "chat-1".to_owned(),
        handler_type: HandlerType::Private,
        msg_type: "text".to_owned(),
        text: text.to_owned(),
    }
}

fn open_access() -> AccessControl {
    AccessControl::new(false, 0)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenarios
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn happy_path_streams_and_persists() {
    let provider = ScriptedProvider::ok(&[(10, "Hi"), (30, " there")], Some("C1"));
    let (engine, surface, sessions) = build_engine(provider, quick_timeouts(), open_access()).await;

    engine.process(msg("S1", "U1", "M1", "hello")).await;

    // Two incremental prefixes plus the identical final write.
    let updates = surface.updates.lock().clone();
    assert_eq!(updates, vec!["Hi", "Hi there", "Hi there"]);
    assert_eq!(surface.closed.load(Ordering::Acquire), 1);
    assert_eq!(surface.cards_posted.load(Ordering::Acquire), 1);

    let history = sessions.get_messages("S1");
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[0].content, "hello");
    assert_eq!(history[1].role, Role::Assistant);
    assert_eq!(history[1].content, "Hi there");

    let meta = sessions.get_session_meta("S1").unwrap();
    assert_eq!(meta.conversation_id, "C1");
    assert_eq!(meta.card_id, "pool-card-1");
    assert_eq!(meta.message_id, "M1");
}

#[tokio::test]
async fn single_flight_rejects_concurrent_turn() {
    let provider = ScriptedProvider::ok(&[(300, "slow answer")], None);
    let (engine, surface, _) = build_engine(provider, quick_timeouts(), open_access()).await;

    let first = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.process(msg("S1", "U1", "M1", "first")).await })
    };
    tokio::time::sleep(Duration::from_millis(80)).await;
    engine.process(msg("S1", "U1", "M2", "second")).await;
    first.await.unwrap();

    assert_eq!(surface.texts.lock().as_slice(), [BUSY_TEXT]);
    // Only the first turn created a card.
    assert_eq!(surface.cards_posted.load(Ordering::Acquire), 1);
}

#[tokio::test]
async fn redelivered_event_is_dropped_silently() {
    let provider = ScriptedProvider::ok(&[(5, "answer")], None);
    let (engine, surface, _) = build_engine(provider, quick_timeouts(), open_access()).await;

    engine.process(msg("S1", "U1", "M1", "hello")).await;
    let updates_after_first = surface.updates.lock().len();

    // The platform redelivers the same event id.
    engine.process(msg("S1", "U1", "M1", "hello")).await;

    assert_eq!(surface.cards_posted.load(Ordering::Acquire), 1);
    assert_eq!(surface.updates.lock().len(), updates_after_first);
    assert!(surface.texts.lock().is_empty());
}

#[tokio::test]
async fn no_content_timeout_writes_final_state() {
    let provider = ScriptedProvider::silent(Duration::from_secs(30));
    let timeouts = TurnTimeouts {
        overall: Duration::from_secs(5),
        stream: Duration::from_secs(4),
        idle: Duration::from_millis(100),
    };
    let (engine, surface, sessions) = build_engine(provider, timeouts, open_access()).await;

    engine.process(msg("S1", "U1", "M1", "hello")).await;

    let updates = surface.updates.lock().clone();
    assert_eq!(updates.last().map(String::as_str), Some(NO_CONTENT_TEXT));
    assert_eq!(surface.closed.load(Ordering::Acquire), 1);
    // Nothing persisted on the timeout path.
    assert!(sessions.get_messages("S1").is_empty());
}

#[tokio::test]
async fn stream_timeout_cuts_a_dripping_stream() {
    let script: Vec<(u64, &str)> = (0..60).map(|_| (80u64, "x")).collect();
    let provider = ScriptedProvider::ok(&script, None);
    let timeouts = TurnTimeouts {
        overall: Duration::from_secs(5),
        stream: Duration::from_millis(350),
        idle: Duration::from_millis(500),
    };
    let (engine, surface, _) = build_engine(provider, timeouts, open_access()).await;

    engine.process(msg("S1", "U1", "M1", "hello")).await;

    let updates = surface.updates.lock().clone();
    assert_eq!(updates.last().map(String::as_str), Some(STREAM_TIMEOUT_TEXT));
}

#[tokio::test]
async fn empty_answer_writes_fallback_and_skips_persist() {
    let provider = ScriptedProvider::ok(&[], None);
    let (engine, surface, sessions) = build_engine(provider, quick_timeouts(), open_access()).await;

    engine.process(msg("S1", "U1", "M1", "hello")).await;

    let updates = surface.updates.lock().clone();
    assert_eq!(updates, vec![EMPTY_ANSWER_TEXT]);
    assert!(sessions.get_messages("S1").is_empty());
}

#[tokio::test]
async fn stream_error_surfaces_in_card() {
    let provider = ScriptedProvider::failing("upstream exploded");
    let (engine, surface, sessions) = build_engine(provider, quick_timeouts(), open_access()).await;

    engine.process(msg("S1", "U1", "M1", "hello")).await;

    let updates = surface.updates.lock().clone();
    let last = updates.last().unwrap();
    assert!(last.starts_with("Chat failed:"), "got {last:?}");
    assert!(last.contains("upstream exploded"));
    assert!(sessions.get_messages("S1").is_empty());
}

#[tokio::test(start_paused = true)]
async fn pool_failure_falls_back_to_inline_card() {
    let sessions = Arc::new(SessionCache::new());
    let pool = CardPool::with_capacity(Arc::new(FailingCreator), 0)
        .await
        .unwrap();
    let surface = Arc::new(MockSurface::default());
    let provider = ScriptedProvider::ok(&[(0, "answer")], None);
    let engine = TurnEngine::new(
        sessions,
        pool,
        surface.clone(),
        provider,
        open_access(),
        quick_timeouts(),
    );

    engine.process(msg("S1", "U1", "M1", "hello")).await;

    assert_eq!(surface.inline_posted.load(Ordering::Acquire), 1);
    let updates = surface.updates.lock().clone();
    assert_eq!(updates.last().map(String::as_str), Some("answer"));
}

#[tokio::test]
async fn rate_limit_surfaces_short_message() {
    let provider = ScriptedProvider::ok(&[(5, "hi")], None);
    let access = AccessControl::new(true, 1);
    let (engine, surface, _) = build_engine(provider, quick_timeouts(), access).await;

    engine.process(msg("S1", "U1", "M1", "first")).await;
    engine.process(msg("S1", "U1", "M2", "second")).await;

    assert_eq!(surface.texts.lock().as_slice(), [RATE_LIMITED_TEXT]);
    assert_eq!(surface.cards_posted.load(Ordering::Acquire), 1);
}

#[tokio::test]
async fn clear_command_resets_session() {
    let provider = ScriptedProvider::ok(&[(5, "remembered")], None);
    let (engine, surface, sessions) = build_engine(provider, quick_timeouts(), open_access()).await;

    engine.process(msg("S1", "U1", "M1", "hello")).await;
    assert_eq!(sessions.get_messages("S1").len(), 2);

    engine.process(msg("S1", "U1", "M2", "/clear")).await;
    assert!(sessions.get_messages("S1").is_empty());
    assert!(surface
        .texts
        .lock()
        .iter()
        .any(|t| t == CLEARED_TEXT));
}
