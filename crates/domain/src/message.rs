use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Maximum length of a single message's content, in bytes of UTF-8.
pub const MAX_MESSAGE_LEN: usize = 4096;

/// Who authored a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One turn of a conversation, as stored in the session cache and sent to
/// the upstream AI.
///
/// `metadata` carries correlation keys (`session_id`, `user_id`) that the
/// streaming adapter reads off the final message of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            metadata: HashMap::new(),
        }
    }

    /// Attach a metadata key, builder-style.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Check the message against the storage rules: content must be
    /// non-empty and no longer than [`MAX_MESSAGE_LEN`].
    pub fn validate(&self) -> Result<()> {
        if self.content.is_empty() {
            return Err(Error::InvalidMessage("content cannot be empty".into()));
        }
        if self.content.len() > MAX_MESSAGE_LEN {
            return Err(Error::MessageTooLong {
                len: self.content.len(),
                max: MAX_MESSAGE_LEN,
            });
        }
        Ok(())
    }
}

/// What the session is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    #[default]
    Chat,
    PicCreate,
    PicVary,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_message_passes() {
        let msg = Message::new(Role::User, "hello");
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn empty_content_rejected() {
        let msg = Message::new(Role::User, "");
        assert!(matches!(msg.validate(), Err(Error::InvalidMessage(_))));
    }

    #[test]
    fn content_at_limit_accepted() {
        let msg = Message::new(Role::Assistant, "x".repeat(MAX_MESSAGE_LEN));
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn content_over_limit_rejected() {
        let msg = Message::new(Role::Assistant, "x".repeat(MAX_MESSAGE_LEN + 1));
        assert!(matches!(
            msg.validate(),
            Err(Error::MessageTooLong { len, max })
                if len == MAX_MESSAGE_LEN + 1 && max == MAX_MESSAGE_LEN
        ));
    }

    #[test]
    fn role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Assistant).unwrap(), "\"assistant\"");
        assert_eq!(serde_json::to_string(&Role::System).unwrap(), "\"system\"");
    }

    #[test]
    fn mode_default_is_chat() {
        assert_eq!(SessionMode::default(), SessionMode::Chat);
        assert_eq!(
            serde_json::to_string(&SessionMode::PicCreate).unwrap(),
            "\"pic_create\""
        );
    }

    #[test]
    fn metadata_roundtrips() {
        let msg = Message::new(Role::User, "hi").with_meta("session_id", "S1");
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.metadata.get("session_id").map(String::as_str), Some("S1"));
    }

    #[test]
    fn empty_metadata_omitted_from_json() {
        let msg = Message::new(Role::User, "hi");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("metadata"));
    }
}
