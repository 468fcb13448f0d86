//! Session, summary and context records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Free-form session metadata.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// A named, timestamped conversation container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Unique session ID
    pub id: String,
    /// Human name, unique within `project_path`
    pub name: String,
    /// Project scope the session belongs to
    pub project_path: String,
    /// Model label
    pub model: String,
    /// Provider label
    pub provider: String,
    /// Agent label (may be empty)
    #[serde(default)]
    pub agent: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: Metadata,
    /// Number of stored messages (derived, not persisted)
    #[serde(default)]
    pub message_count: usize,
}

impl Session {
    /// Create a new session with a fresh ID and current timestamps.
    pub fn new(
        name: impl Into<String>,
        project_path: impl Into<String>,
        model: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            project_path: project_path.into(),
            model: model.into(),
            provider: provider.into(),
            agent: String::new(),
            created_at: now,
            updated_at: now,
            metadata: Metadata::new(),
            message_count: 0,
        }
    }

    /// Set the agent label.
    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = agent.into();
        self
    }

    /// Replace the metadata map.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Bump `updated_at` to now.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// A generated replacement for a contiguous block of oldest messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    /// Unique summary ID
    pub id: String,
    /// Owning session
    pub session_id: String,
    /// IDs of the archived messages, in stored order
    pub original_message_ids: Vec<i64>,
    /// Human-readable range, e.g. "Messages 1-20"
    pub message_range: String,
    /// Summary text
    pub content: String,
    /// Estimated token count of `content`
    pub token_count: usize,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Summary {
    /// Create a summary covering `original_message_ids`.
    pub fn new(
        session_id: impl Into<String>,
        original_message_ids: Vec<i64>,
        content: impl Into<String>,
        token_count: usize,
    ) -> Self {
        let message_range = Self::range_label(&original_message_ids);
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            original_message_ids,
            message_range,
            content: content.into(),
            token_count,
            created_at: Utc::now(),
        }
    }

    /// Format the range label for a list of message IDs.
    pub fn range_label(ids: &[i64]) -> String {
        match (ids.first(), ids.last()) {
            (Some(first), Some(last)) => format!("Messages {}-{}", first, last),
            _ => "Messages (none)".to_string(),
        }
    }

    /// Position of the summary in stored order (its first original ID).
    pub fn position(&self) -> i64 {
        self.original_message_ids.first().copied().unwrap_or(0)
    }
}

/// Well-known context item types.
pub mod context_type {
    /// A file referenced during the session.
    pub const FILE: &str = "file";
    /// A setting captured for the session.
    pub const SETTING: &str = "setting";
}

/// Typed key/value attachment on a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextItem {
    /// Owning session
    pub session_id: String,
    /// Item type, e.g. "file" or "setting"
    pub context_type: String,
    /// Item key
    pub key: String,
    /// Item value
    pub value: String,
}

impl ContextItem {
    /// Create a new context item.
    pub fn new(
        session_id: impl Into<String>,
        context_type: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            context_type: context_type.into(),
            key: key.into(),
            value: value.into(),
        }
    }
}
