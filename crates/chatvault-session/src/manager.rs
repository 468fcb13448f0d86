//! Session lifecycle management.
//!
//! [`SessionManager`] is the entry point used by the CLI: it owns the store,
//! the compactor and the compaction observer, and scopes session names to a
//! project path.

use std::sync::Arc;

use chrono::{Duration, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chatvault_core::{CompactConfig, Config, ContextItem, Message, Role, Session, Summary};

use crate::checkpoint::{ContextSource, ValidationError};
use crate::compaction::{
    should_compact, CompactError, CompactOutcome, CompactPlan, CompactionObserver, Compactor,
    NoOpObserver, Summarizer,
};
use crate::store::{SessionStore, StoreError};

/// Errors surfaced by the session manager and checkpoint codec.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session already exists: {0}")]
    AlreadyExists(String),

    #[error("Checkpoint validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Unsupported checkpoint format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid retention period: {0}")]
    InvalidRetention(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Compaction failed: {0}")]
    Compaction(CompactError),

    #[error("Storage error: {0}")]
    Store(StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl From<StoreError> for SessionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => SessionError::NotFound(what),
            other => SessionError::Store(other),
        }
    }
}

impl From<CompactError> for SessionError {
    fn from(err: CompactError) -> Self {
        match err {
            CompactError::Cancelled => SessionError::Cancelled,
            CompactError::Store(e) => SessionError::from(e),
            other => SessionError::Compaction(other),
        }
    }
}

impl From<SessionError> for chatvault_core::Error {
    fn from(err: SessionError) -> Self {
        use chatvault_core::Error;
        match err {
            SessionError::NotFound(what) => Error::NotFound(what),
            SessionError::AlreadyExists(what) => Error::AlreadyExists(what),
            SessionError::Validation(e) => Error::Validation(e.to_string()),
            SessionError::UnsupportedFormat(f) => {
                Error::Validation(format!("unsupported checkpoint format: {}", f))
            }
            SessionError::InvalidRetention(what) => Error::InvalidConfiguration(what),
            SessionError::Cancelled => Error::Cancelled,
            SessionError::Compaction(e) => Error::Internal(e.to_string()),
            SessionError::Store(e) => Error::Database(e.to_string()),
            SessionError::Io(e) => Error::Io(e),
            SessionError::Json(e) => Error::Json(e),
            SessionError::Yaml(e) => Error::Validation(format!("invalid YAML: {}", e)),
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Settings the manager needs from the wider configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Project scope for session names.
    pub project_path: String,
    /// Maximum active messages per session (0 = unlimited).
    pub max_history_messages: usize,
    /// Compaction policy.
    pub compact: CompactConfig,
}

impl ManagerConfig {
    pub fn new(project_path: impl Into<String>) -> Self {
        Self {
            project_path: project_path.into(),
            max_history_messages: 0,
            compact: CompactConfig::default(),
        }
    }

    /// Take history and compaction settings from a loaded [`Config`].
    pub fn from_config(config: &Config, project_path: impl Into<String>) -> Self {
        Self {
            project_path: project_path.into(),
            max_history_messages: config.history.max_messages,
            compact: config.compaction.clone(),
        }
    }
}

/// Manages sessions, messages and compaction-aware reads.
pub struct SessionManager {
    pub(crate) store: Arc<dyn SessionStore>,
    compactor: Compactor,
    pub(crate) config: ManagerConfig,
    observer: Arc<dyn CompactionObserver>,
    pub(crate) context_source: Option<Arc<dyn ContextSource>>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>, config: ManagerConfig) -> Self {
        Self {
            compactor: Compactor::new(store.clone()),
            store,
            config,
            observer: Arc::new(NoOpObserver),
            context_source: None,
        }
    }

    /// Use an AI summarizer for compaction.
    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.compactor = Compactor::new(self.store.clone()).with_summarizer(summarizer);
        self
    }

    /// Report compaction progress to `observer`.
    pub fn with_observer(mut self, observer: Arc<dyn CompactionObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Collaborator that supplies the context block of exports.
    pub fn with_context_source(mut self, source: Arc<dyn ContextSource>) -> Self {
        self.context_source = Some(source);
        self
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn project_path(&self) -> &str {
        &self.config.project_path
    }

    // -- Sessions --------------------------------------------------------

    /// Create a session in the manager's project scope.
    pub async fn create_session(&self, name: &str, model: &str, provider: &str) -> Result<Session> {
        let session = Session::new(name, self.project_path(), model, provider);
        self.insert_session(session).await
    }

    /// Persist a fully built session, rejecting name collisions in its scope.
    pub async fn insert_session(&self, session: Session) -> Result<Session> {
        match self
            .store
            .get_session_by_name(&session.project_path, &session.name)
            .await
        {
            Ok(_) => return Err(SessionError::AlreadyExists(format!("session '{}'", session.name))),
            Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        match self.store.create_session(&session).await {
            Ok(()) => {}
            Err(StoreError::Constraint(_)) => {
                return Err(SessionError::AlreadyExists(format!("session '{}'", session.name)))
            }
            Err(e) => return Err(e.into()),
        }

        info!(session_id = %session.id, name = %session.name, "Created session");
        Ok(session)
    }

    pub async fn get_session(&self, id: &str) -> Result<Session> {
        Ok(self.store.get_session(id).await?)
    }

    /// Find a session by name in the manager's project scope.
    pub async fn get_session_by_name(&self, name: &str) -> Result<Session> {
        Ok(self
            .store
            .get_session_by_name(self.project_path(), name)
            .await?)
    }

    /// List sessions in scope, most recently updated first (0 = all).
    pub async fn list_sessions(&self, limit: usize) -> Result<Vec<Session>> {
        Ok(self.store.list_sessions(self.project_path(), limit).await?)
    }

    /// Save changes to a session, bumping `updated_at`.
    pub async fn update_session(&self, session: &mut Session) -> Result<()> {
        session.touch();
        self.store.update_session(session).await?;
        Ok(())
    }

    /// Delete a session with its messages, summaries and context.
    pub async fn delete_session(&self, id: &str) -> Result<()> {
        self.store.delete_session(id).await?;
        info!(session_id = %id, "Deleted session");
        Ok(())
    }

    /// Delete sessions not updated within `older_than`. Returns the count.
    pub async fn clean_old_sessions(&self, older_than: Duration) -> Result<usize> {
        let cutoff = Utc::now().checked_sub_signed(older_than).ok_or_else(|| {
            SessionError::InvalidRetention(format!("{} days is out of range", older_than.num_days()))
        })?;
        let deleted = self.store.delete_sessions_older_than(cutoff).await?;
        info!(deleted, cutoff = %cutoff, "Cleaned old sessions");
        Ok(deleted)
    }

    /// Look up a session by name and run a compaction pass if configured to.
    ///
    /// A failed compaction is logged and does not prevent the resume.
    pub async fn resume_session(&self, cancel: &CancellationToken, name: &str) -> Result<Session> {
        let session = self.get_session_by_name(name).await?;

        if self.config.compact.compact_on_resume {
            match self.compact_session(cancel, &session.id, false).await {
                Ok(_) => {}
                Err(SessionError::Cancelled) => return Err(SessionError::Cancelled),
                Err(e) => warn!(session_id = %session.id, error = %e, "Compaction on resume failed"),
            }
            return self.get_session(&session.id).await;
        }

        Ok(session)
    }

    // -- Messages --------------------------------------------------------

    /// Append a message to an existing session and bump its `updated_at`.
    pub async fn add_message(&self, session_id: &str, role: Role, content: &str) -> Result<Message> {
        let mut session = self.store.get_session(session_id).await?;

        let mut message = Message::new(session_id, role, content);
        message.id = self.store.add_message(&message).await?;

        session.touch();
        self.store.update_session(&session).await?;

        debug!(session_id = %session_id, message_id = message.id, role = %role, "Added message");
        Ok(message)
    }

    /// First `limit` stored messages, archived ones included (0 = all).
    pub async fn get_messages(&self, session_id: &str, limit: usize) -> Result<Vec<Message>> {
        self.store.get_session(session_id).await?;
        Ok(self.store.get_messages(session_id, limit).await?)
    }

    /// The conversation view: summaries in place of archived messages,
    /// followed by active messages, truncated to the most recent `limit`.
    ///
    /// Runs a compaction pass first when the active history is over its
    /// bound. A failed pass is reported to the observer and logged, and the
    /// pre-compaction view is served.
    pub async fn get_messages_with_compaction(
        &self,
        cancel: &CancellationToken,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>> {
        self.store.get_session(session_id).await?;
        let mut active = self.store.get_active_messages(session_id).await?;

        if let Some(plan) = should_compact(
            &active,
            self.config.max_history_messages,
            &self.config.compact,
        ) {
            match self.run_compaction(cancel, &plan, &self.config.compact).await {
                Ok(_) => active = self.store.get_active_messages(session_id).await?,
                Err(CompactError::Cancelled) => return Err(SessionError::Cancelled),
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Compaction failed, serving uncompacted history")
                }
            }
        }

        let summaries = self.store.get_summaries(session_id).await?;
        Ok(combine_history(
            &summaries,
            active,
            self.config.compact.show_summary_markers,
            limit,
        ))
    }

    /// Run one compaction pass on a session.
    ///
    /// With `force`, the pass runs even when compaction is disabled in the
    /// configuration. Returns `None` when nothing qualifies.
    pub async fn compact_session(
        &self,
        cancel: &CancellationToken,
        session_id: &str,
        force: bool,
    ) -> Result<Option<CompactOutcome>> {
        self.store.get_session(session_id).await?;
        let active = self.store.get_active_messages(session_id).await?;

        let mut config = self.config.compact.clone();
        if force {
            config.enabled = true;
        }

        let Some(plan) = should_compact(&active, self.config.max_history_messages, &config) else {
            debug!(session_id = %session_id, messages = active.len(), "Nothing to compact");
            return Ok(None);
        };

        Ok(Some(self.run_compaction(cancel, &plan, &config).await?))
    }

    async fn run_compaction(
        &self,
        cancel: &CancellationToken,
        plan: &CompactPlan,
        config: &CompactConfig,
    ) -> std::result::Result<CompactOutcome, CompactError> {
        self.observer.on_compaction_starting(plan);
        match self.compactor.compact(cancel, plan, config).await {
            Ok(outcome) => {
                self.observer.on_compaction_completed(plan, &outcome);
                Ok(outcome)
            }
            Err(e) => {
                self.observer.on_compaction_failed(plan, &e);
                Err(e)
            }
        }
    }

    // -- Context ---------------------------------------------------------

    /// Attach a context item to a session.
    pub async fn add_context(
        &self,
        session_id: &str,
        context_type: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        self.store.get_session(session_id).await?;
        self.store
            .add_context(&ContextItem::new(session_id, context_type, key, value))
            .await?;
        Ok(())
    }

    pub async fn get_context(&self, session_id: &str) -> Result<Vec<ContextItem>> {
        Ok(self.store.get_context(session_id).await?)
    }

    /// Remove all context items of a session. Returns the count.
    pub async fn clear_context(&self, session_id: &str) -> Result<usize> {
        Ok(self.store.delete_context(session_id).await?)
    }
}

/// Render a summary as a synthetic assistant message.
///
/// The message takes the ID of the first message it replaces so it sorts
/// into stored order.
pub fn summary_message(summary: &Summary, show_markers: bool) -> Message {
    let content = if show_markers {
        format!(
            "[SUMMARY: {}]\n{}\n[END SUMMARY]",
            summary.message_range, summary.content
        )
    } else {
        summary.content.clone()
    };

    Message {
        id: summary.position(),
        session_id: summary.session_id.clone(),
        role: Role::Assistant,
        content,
        created_at: summary.created_at,
        archived: false,
        is_summary: true,
    }
}

/// Merge summaries and active messages in stored order, keeping the most
/// recent `limit` entries (0 = all).
pub fn combine_history(
    summaries: &[Summary],
    active: Vec<Message>,
    show_markers: bool,
    limit: usize,
) -> Vec<Message> {
    let mut combined: Vec<Message> = summaries
        .iter()
        .map(|s| summary_message(s, show_markers))
        .chain(active)
        .collect();
    combined.sort_by_key(|m| m.id);

    if limit > 0 && combined.len() > limit {
        combined.drain(..combined.len() - limit);
    }
    combined
}
