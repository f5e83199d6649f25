//! The provider capability interface consumed by the orchestrator, plus
//! the config-driven factory.

use std::sync::Arc;

use tokio::sync::mpsc;

use cf_domain::config::Config;
use cf_domain::error::{Error, Result};
use cf_domain::message::Message;

use crate::dify::DifyProvider;

/// An upstream conversational-AI backend.
///
/// `stream_chat` sends the full history (last element = the new user turn)
/// and delivers assistant tokens on `out` in upstream reception order. The
/// adapter owns the `Sender`; dropping it on return closes the channel, so
/// the consumer observes end-of-stream as channel closure.
#[async_trait::async_trait]
pub trait AiProvider: Send + Sync {
    async fn stream_chat(&self, messages: &[Message], out: mpsc::Sender<String>) -> Result<()>;

    /// The upstream conversation handle currently cached for a user, if
    /// any. Callers persist this alongside the session history.
    fn conversation_id(&self, user_id: &str) -> Option<String> {
        let _ = user_id;
        None
    }

    /// Stop background work (conversation sweeper). Idle HTTP connections
    /// are released when the provider is dropped.
    fn shutdown(&self);
}

/// Build the provider named by `ai_provider_type`.
pub fn create_provider(config: &Config) -> Result<Arc<dyn AiProvider>> {
    match config.ai_provider_type.as_str() {
        "dify" => Ok(Arc::new(DifyProvider::from_config(config)?)),
        other => Err(Error::Config(format!("unknown ai provider type: {other}"))),
    }
}
