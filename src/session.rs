//! Session identity: the composite key that scopes history, usage, and
//! storage records to a single conversation.

use serde::{Deserialize, Serialize};

/// Composite key identifying a single conversation.
///
/// Immutable once built. `key()` derives a stable string usable by storage
/// backends that only understand flat string keys (file paths, KV store
/// keys, etc).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub agent_name: String,
    pub chat_name: Option<String>,
    pub user_id: Option<String>,
    pub group: Option<String>,
}

impl SessionIdentity {
    pub fn new(agent_name: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            chat_name: None,
            user_id: None,
            group: None,
        }
    }

    pub fn with_chat_name(mut self, chat_name: impl Into<String>) -> Self {
        self.chat_name = Some(chat_name.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Derived string key, stable for a given set of fields.
    pub fn key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.agent_name,
            self.chat_name.as_deref().unwrap_or("-"),
            self.user_id.as_deref().unwrap_or("-"),
            self.group.as_deref().unwrap_or("-"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_stable_and_distinguishes_fields() {
        let a = SessionIdentity::new("bot").with_user_id("u1");
        let b = SessionIdentity::new("bot").with_user_id("u2");
        assert_ne!(a.key(), b.key());
        assert_eq!(a.key(), SessionIdentity::new("bot").with_user_id("u1").key());
    }

    #[test]
    fn different_identities_are_independent() {
        let a = SessionIdentity::new("bot");
        let b = SessionIdentity::new("bot").with_chat_name("c1");
        assert_ne!(a.key(), b.key());
    }
}
