//! History compaction and summarization.
//!
//! Decides when a session's active history has outgrown its bound, folds the
//! oldest slice into a summary (AI-backed with a deterministic fallback) and
//! commits the archival through the store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chatvault_core::{CompactConfig, Message, Role, Summary};

use crate::store::{SessionStore, StoreError};

/// Average characters per token (for estimation).
pub const CHARS_PER_TOKEN: usize = 4;

/// Messages longer than this are cut in the deterministic summary.
const SIMPLE_SUMMARY_MAX_CHARS: usize = 200;

/// Messages longer than this are cut in the summarization prompt.
const PROMPT_MESSAGE_MAX_CHARS: usize = 2000;

/// Errors that can occur while compacting.
#[derive(Error, Debug)]
pub enum CompactError {
    #[error("Compaction plan is empty")]
    EmptyPlan,

    #[error("Compaction cancelled")]
    Cancelled,

    #[error("Failed to apply compaction: {0}")]
    Store(#[from] StoreError),
}

/// A decision to compact part of a session's history. Never persisted.
#[derive(Debug, Clone)]
pub struct CompactPlan {
    /// Session being compacted.
    pub session_id: String,
    /// Active messages considered.
    pub total_messages: usize,
    /// Oldest messages to fold into a summary.
    pub to_compact: Vec<Message>,
    /// Most recent messages that stay active.
    pub to_keep: Vec<Message>,
    /// Why compaction triggered.
    pub reason: String,
    /// Estimated tokens removed from the active history.
    pub estimated_tokens_saved: usize,
}

impl CompactPlan {
    /// IDs of the messages to compact, in stored order.
    pub fn message_ids(&self) -> Vec<i64> {
        self.to_compact.iter().map(|m| m.id).collect()
    }
}

/// Result of a successful compaction.
#[derive(Debug, Clone)]
pub struct CompactOutcome {
    /// ID of the stored summary.
    pub summary_id: String,
    /// Summary text.
    pub content: String,
    /// Estimated tokens in the summary.
    pub token_count: usize,
    /// Number of messages archived.
    pub messages_compacted: usize,
    /// Whether the AI summarizer produced the text.
    pub ai_generated: bool,
}

/// Options passed to the summarizer.
#[derive(Debug, Clone, Default)]
pub struct SummaryOptions {
    /// Provider override.
    pub provider: Option<String>,
    /// Model override.
    pub model: Option<String>,
    /// Maximum tokens for the summary.
    pub max_tokens: usize,
}

/// Text-completion capability used for AI summaries. May fail at any time.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Summarize the given prompt.
    async fn summarize(&self, prompt: &str, options: &SummaryOptions) -> anyhow::Result<String>;
}

/// Observer for compaction progress.
pub trait CompactionObserver: Send + Sync {
    /// Called before a compaction runs.
    fn on_compaction_starting(&self, _plan: &CompactPlan) {}

    /// Called after a compaction has been committed.
    fn on_compaction_completed(&self, _plan: &CompactPlan, _outcome: &CompactOutcome) {}

    /// Called when a compaction fails.
    fn on_compaction_failed(&self, _plan: &CompactPlan, _error: &CompactError) {}
}

/// Observer that ignores all events.
pub struct NoOpObserver;

impl CompactionObserver for NoOpObserver {}

/// Estimate the token count of a text.
pub fn estimate_tokens(text: &str) -> usize {
    text.len() / CHARS_PER_TOKEN
}

/// Cut `text` to at most `max_chars` characters, appending "..." when cut.
fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Decide whether `messages` (the active history) should be compacted.
///
/// Returns a plan folding the oldest messages when the history reached
/// `max_messages × trigger_threshold`, never touching the most recent
/// `preserve_recent` messages.
pub fn should_compact(
    messages: &[Message],
    max_messages: usize,
    config: &CompactConfig,
) -> Option<CompactPlan> {
    if !config.enabled || max_messages == 0 {
        return None;
    }

    if !(config.trigger_threshold > 0.0 && config.trigger_threshold <= 1.0)
        || !(config.compact_ratio > 0.0 && config.compact_ratio < 1.0)
    {
        warn!(
            trigger_threshold = config.trigger_threshold,
            compact_ratio = config.compact_ratio,
            "Compaction policy out of range, skipping"
        );
        return None;
    }

    let total = messages.len();
    let threshold = max_messages as f64 * config.trigger_threshold;
    if (total as f64) < threshold {
        return None;
    }

    let mut to_compact = ((total as f64 * config.compact_ratio).floor() as usize).min(total);
    if total - to_compact < config.preserve_recent {
        to_compact = total.saturating_sub(config.preserve_recent);
    }
    if to_compact == 0 {
        return None;
    }

    let (compact, keep) = messages.split_at(to_compact);
    let estimated_tokens_saved = compact.iter().map(|m| m.content.len()).sum::<usize>() / CHARS_PER_TOKEN;

    Some(CompactPlan {
        session_id: messages[0].session_id.clone(),
        total_messages: total,
        to_compact: compact.to_vec(),
        to_keep: keep.to_vec(),
        reason: format!(
            "{} messages reached the compaction threshold of {:.0} ({:.0}% of {})",
            total,
            threshold,
            config.trigger_threshold * 100.0,
            max_messages
        ),
        estimated_tokens_saved,
    })
}

/// Build the prompt for AI summary generation.
pub fn build_summary_prompt(messages: &[Message]) -> String {
    let mut prompt = String::from(
        "You are summarizing the earlier part of a working session between a user and an AI \
assistant. The summary replaces these messages in the conversation history, so it must \
carry forward everything needed to continue the work.

PRESERVE:
- Decisions that were made and the reasons given
- Configuration facts: names, identifiers, versions, paths, addresses and values
- Security decisions: permissions, access rules, credentials handling policies
- Open questions, pending tasks and agreed next steps
- Errors encountered and how they were resolved

DO NOT include:
- Greetings, thanks and other conversational filler
- Repeated explanations or restated questions
- Exploratory ideas that were rejected, unless the rejection matters later

Write the summary in 150-400 words as plain prose or short bullet points.

CONVERSATION TO SUMMARIZE:
",
    );

    for (i, msg) in messages.iter().enumerate() {
        let role = match msg.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::System => "System",
        };
        prompt.push_str(&format!(
            "\n[Message {}] {}: {}\n",
            i + 1,
            role,
            truncate_chars(&msg.content, PROMPT_MESSAGE_MAX_CHARS)
        ));
    }

    prompt.push_str("\nSUMMARY:\n");
    prompt
}

/// Deterministic summary: one truncated line per message.
pub fn simple_summary(messages: &[Message]) -> String {
    let mut lines = Vec::with_capacity(messages.len() + 2);
    lines.push("=== SUMMARY OF EARLIER CONVERSATION ===".to_string());

    for msg in messages {
        let content = truncate_chars(msg.content.trim(), SIMPLE_SUMMARY_MAX_CHARS);
        lines.push(format!("[{}]: {}", msg.role, content.replace('\n', " ")));
    }

    lines.push(format!("=== Summarized {} messages ===", messages.len()));
    lines.join("\n")
}

/// Compactor for session history.
pub struct Compactor {
    store: Arc<dyn SessionStore>,
    summarizer: Option<Arc<dyn Summarizer>>,
}

impl Compactor {
    /// Create a compactor without an AI summarizer.
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            summarizer: None,
        }
    }

    /// Attach an AI summarizer.
    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// Whether an AI summarizer is attached.
    pub fn has_summarizer(&self) -> bool {
        self.summarizer.is_some()
    }

    /// Execute a compaction plan.
    ///
    /// Summarizer failures fall back to [`simple_summary`]; only an empty
    /// plan, cancellation, or a store failure is an error.
    pub async fn compact(
        &self,
        cancel: &CancellationToken,
        plan: &CompactPlan,
        config: &CompactConfig,
    ) -> Result<CompactOutcome, CompactError> {
        if plan.to_compact.is_empty() {
            return Err(CompactError::EmptyPlan);
        }
        if cancel.is_cancelled() {
            return Err(CompactError::Cancelled);
        }

        info!(
            session_id = %plan.session_id,
            messages = plan.to_compact.len(),
            reason = %plan.reason,
            "Compacting session history"
        );

        let (content, ai_generated) = match self.ai_summary(cancel, plan, config).await? {
            Some(text) => (text, true),
            None => (simple_summary(&plan.to_compact), false),
        };
        let token_count = estimate_tokens(&content);

        if cancel.is_cancelled() {
            return Err(CompactError::Cancelled);
        }

        let summary = Summary::new(&plan.session_id, plan.message_ids(), content, token_count);
        self.store.apply_compaction(&summary).await?;

        info!(
            session_id = %plan.session_id,
            messages = plan.to_compact.len(),
            tokens = token_count,
            range = %summary.message_range,
            "Compaction complete"
        );

        Ok(CompactOutcome {
            summary_id: summary.id,
            content: summary.content,
            token_count,
            messages_compacted: plan.to_compact.len(),
            ai_generated,
        })
    }

    /// Try the AI summarizer. `Ok(None)` means "use the fallback".
    async fn ai_summary(
        &self,
        cancel: &CancellationToken,
        plan: &CompactPlan,
        config: &CompactConfig,
    ) -> Result<Option<String>, CompactError> {
        let summarizer = match (&self.summarizer, config.ai_summary_enabled()) {
            (Some(summarizer), true) => summarizer,
            _ => return Ok(None),
        };

        let prompt = build_summary_prompt(&plan.to_compact);
        let options = SummaryOptions {
            provider: config.summary_provider.clone(),
            model: config.summary_model.clone(),
            max_tokens: config.summary_max_tokens,
        };
        let timeout = Duration::from_secs(config.summary_timeout_secs);

        debug!(session_id = %plan.session_id, prompt_len = prompt.len(), "Requesting AI summary");

        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(CompactError::Cancelled),
            result = tokio::time::timeout(timeout, summarizer.summarize(&prompt, &options)) => result,
        };

        match result {
            Ok(Ok(text)) if !text.trim().is_empty() => Ok(Some(truncate_chars(
                text.trim(),
                config.summary_max_tokens * CHARS_PER_TOKEN,
            ))),
            Ok(Ok(_)) => {
                warn!(session_id = %plan.session_id, "AI summary was empty, using simple summary");
                Ok(None)
            }
            Ok(Err(e)) => {
                let err = chatvault_core::Error::Dependency(format!("summarizer: {:#}", e));
                warn!(session_id = %plan.session_id, error = %err, "AI summary failed, using simple summary");
                Ok(None)
            }
            Err(_) => {
                let err = chatvault_core::Error::Dependency(format!(
                    "summarizer timed out after {}s",
                    config.summary_timeout_secs
                ));
                warn!(session_id = %plan.session_id, error = %err, "AI summary failed, using simple summary");
                Ok(None)
            }
        }
    }
}
