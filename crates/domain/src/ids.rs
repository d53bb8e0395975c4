//! Stable identity types shared across the core.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable string identity for a bot, e.g. `bot_1`. Assigned at config
/// creation time and never reassigned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BotId(pub String);

impl BotId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BotId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for BotId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Opaque identifier issued by the agent engine's session service.
/// Persisted externally keyed by `(app_name, ConversationKey)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// A throwaway id for a single turn, used when the agent engine's
    /// session service can't be reached. Never cached or reused — the
    /// next turn tries the session service again.
    pub fn ephemeral(key: &ConversationKey) -> Self {
        Self(format!("ephemeral:{}:{}", key.as_key_string(), uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Routing identity used to serialize messages: per-user for direct
/// messages, per-channel for server messages. Exactly one session and
/// one per-channel queue exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConversationKey {
    Dm(String),
    Channel(String),
}

impl ConversationKey {
    pub fn dm(user_id: impl Into<String>) -> Self {
        Self::Dm(user_id.into())
    }

    pub fn channel(channel_id: impl Into<String>) -> Self {
        Self::Channel(channel_id.into())
    }

    /// Canonical string form, e.g. `dm:1234` or `ch:5678`, used as the
    /// store/router map key and in session-id derivation.
    pub fn as_key_string(&self) -> String {
        match self {
            Self::Dm(id) => format!("dm:{id}"),
            Self::Channel(id) => format!("ch:{id}"),
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_key_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_key_string_form() {
        assert_eq!(ConversationKey::dm("42").as_key_string(), "dm:42");
        assert_eq!(ConversationKey::channel("99").as_key_string(), "ch:99");
    }

    #[test]
    fn conversation_key_distinguishes_dm_and_channel_with_same_id() {
        let dm = ConversationKey::dm("1");
        let ch = ConversationKey::channel("1");
        assert_ne!(dm, ch);
        assert_ne!(dm.as_key_string(), ch.as_key_string());
    }

    #[test]
    fn ephemeral_session_ids_are_unique_per_call() {
        let key = ConversationKey::dm("1");
        let a = SessionId::ephemeral(&key);
        let b = SessionId::ephemeral(&key);
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("ephemeral:dm:1:"));
    }
}
