//! Message and conversation primitives.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// User message
    User,
    /// Assistant response
    Assistant,
    /// System message (instructions)
    System,
}

impl Role {
    /// All roles a stored message may carry.
    pub const ALL: [Role; 3] = [Role::User, Role::Assistant, Role::System];

    /// Lowercase wire name of the role.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown role name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid role '{0}' (expected user, assistant or system)")]
pub struct ParseRoleError(pub String);

impl FromStr for Role {
    type Err = ParseRoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(ParseRoleError(other.to_string())),
        }
    }
}

/// A message in a session.
///
/// Persisted messages are immutable except for `archived`, which flips to
/// `true` once the message has been folded into a summary. `is_summary` is
/// only ever set on synthetic messages built from a summary for display and
/// is never written to storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Store-assigned message ID (0 until appended)
    pub id: i64,
    /// Owning session
    pub session_id: String,
    /// Message role
    pub role: Role,
    /// Message text
    pub content: String,
    /// Timestamp
    pub created_at: DateTime<Utc>,
    /// Folded into a summary
    #[serde(default)]
    pub archived: bool,
    /// Synthetic summary view
    #[serde(default, skip_serializing)]
    pub is_summary: bool,
}

impl Message {
    /// Create a new, not yet persisted message.
    pub fn new(session_id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: 0,
            session_id: session_id.into(),
            role,
            content: content.into(),
            created_at: Utc::now(),
            archived: false,
            is_summary: false,
        }
    }

    /// Create a new user message.
    pub fn user(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(session_id, Role::User, content)
    }

    /// Create a new assistant message.
    pub fn assistant(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(session_id, Role::Assistant, content)
    }

    /// Create a new system message.
    pub fn system(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(session_id, Role::System, content)
    }

    /// Override the creation timestamp.
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Set the archived flag.
    pub fn with_archived(mut self, archived: bool) -> Self {
        self.archived = archived;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trips_through_str() {
        for role in Role::ALL {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
    }

    #[test]
    fn test_invalid_role_is_rejected() {
        let err = "invalid".parse::<Role>().unwrap_err();
        assert!(err.to_string().contains("invalid"));
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_string(&Role::Assistant).unwrap();
        assert_eq!(json, "\"assistant\"");
    }

    #[test]
    fn test_is_summary_is_never_serialized() {
        let mut msg = Message::assistant("s1", "summary");
        msg.is_summary = true;
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("is_summary"));
    }
}
