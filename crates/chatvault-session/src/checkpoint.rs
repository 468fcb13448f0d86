//! Portable session checkpoints.
//!
//! A checkpoint is a versioned snapshot of one session (metadata, every
//! message including archived ones, optional context, statistics) that can
//! be written as JSON, YAML or a Markdown report, and imported back from
//! JSON or YAML.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chatvault_core::session::{context_type, Metadata};
use chatvault_core::{ContextItem, Message, Role, Session, Summary};

use crate::compaction::{estimate_tokens, simple_summary};
use crate::manager::{Result, SessionError, SessionManager};
use crate::store::StoreError;

/// Checkpoint format version written and accepted.
pub const CHECKPOINT_VERSION: &str = "1.0";

fn is_false(value: &bool) -> bool {
    !*value
}

/// A versioned export of one session.
///
/// Every field decodes with a default so that incomplete files reach
/// [`validate_checkpoint`] and fail on a named rule. Missing timestamps
/// decode as the current time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default)]
    pub version: String,
    #[serde(default = "Utc::now")]
    pub exported_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exported_by: Option<String>,
    #[serde(default)]
    pub session: CheckpointSession,
    #[serde(default)]
    pub messages: Vec<CheckpointMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<CheckpointContext>,
    #[serde(default)]
    pub statistics: CheckpointStatistics,
}

/// Session metadata inside a checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSession {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent: String,
    #[serde(default)]
    pub project_path: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

/// One message inside a checkpoint.
///
/// The role stays a plain string so unknown roles reach validation instead
/// of failing the parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub archived: bool,
}

/// Optional environment captured at export time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_memory: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_accessed: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
}

impl CheckpointContext {
    fn is_empty(&self) -> bool {
        self.project_memory.is_none()
            && self.files_accessed.is_empty()
            && self.working_directory.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointStatistics {
    #[serde(default)]
    pub message_count: usize,
    #[serde(default)]
    pub user_messages: usize,
    #[serde(default)]
    pub assistant_messages: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<u64>,
}

/// A violated checkpoint rule.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("checkpoint version is missing")]
    MissingVersion,

    #[error("unsupported checkpoint version '{0}' (supported: {supported})", supported = CHECKPOINT_VERSION)]
    UnsupportedVersion(String),

    #[error("session name is required")]
    MissingName,

    #[error("session provider is required")]
    MissingProvider,

    #[error("session model is required")]
    MissingModel,

    #[error("checkpoint contains no messages")]
    NoMessages,

    #[error("message {index} has invalid role '{role}'")]
    InvalidRole { index: usize, role: String },

    #[error("statistics.message_count is {declared} but the checkpoint has {actual} messages")]
    MessageCountMismatch { declared: usize, actual: usize },
}

/// Check a checkpoint before anything is written from it.
pub fn validate_checkpoint(checkpoint: &Checkpoint) -> std::result::Result<(), ValidationError> {
    if checkpoint.version.is_empty() {
        return Err(ValidationError::MissingVersion);
    }
    if checkpoint.version != CHECKPOINT_VERSION {
        return Err(ValidationError::UnsupportedVersion(checkpoint.version.clone()));
    }

    let session = &checkpoint.session;
    if session.name.trim().is_empty() {
        return Err(ValidationError::MissingName);
    }
    if session.provider.trim().is_empty() {
        return Err(ValidationError::MissingProvider);
    }
    if session.model.trim().is_empty() {
        return Err(ValidationError::MissingModel);
    }

    if checkpoint.messages.is_empty() {
        return Err(ValidationError::NoMessages);
    }
    for (index, msg) in checkpoint.messages.iter().enumerate() {
        if msg.role.parse::<Role>().is_err() {
            return Err(ValidationError::InvalidRole {
                index,
                role: msg.role.clone(),
            });
        }
    }

    if checkpoint.statistics.message_count != checkpoint.messages.len() {
        return Err(ValidationError::MessageCountMismatch {
            declared: checkpoint.statistics.message_count,
            actual: checkpoint.messages.len(),
        });
    }

    Ok(())
}

/// Checkpoint encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointFormat {
    Json,
    Yaml,
    /// Human-readable report. Export only.
    Markdown,
}

impl CheckpointFormat {
    /// Detect the format from a file extension; unknown or missing → JSON.
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());

        match ext.as_deref() {
            Some("yaml") | Some("yml") => CheckpointFormat::Yaml,
            Some("md") | Some("markdown") => CheckpointFormat::Markdown,
            _ => CheckpointFormat::Json,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointFormat::Json => "json",
            CheckpointFormat::Yaml => "yaml",
            CheckpointFormat::Markdown => "markdown",
        }
    }
}

impl fmt::Display for CheckpointFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckpointFormat {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(CheckpointFormat::Json),
            "yaml" | "yml" => Ok(CheckpointFormat::Yaml),
            "markdown" | "md" => Ok(CheckpointFormat::Markdown),
            other => Err(SessionError::UnsupportedFormat(format!(
                "unsupported export format '{}' (expected json, yaml or markdown)",
                other
            ))),
        }
    }
}

/// Export settings.
#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    /// Encoding; `None` picks one from the output path.
    pub format: Option<CheckpointFormat>,
    /// Include the session metadata map.
    pub include_metadata: bool,
    /// Include the context block.
    pub include_context: bool,
    /// Exporter identity.
    pub exported_by: Option<String>,
}

/// Import settings.
#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    /// Name override.
    pub name: Option<String>,
    /// Project scope override (defaults to the manager's scope).
    pub project_path: Option<String>,
    /// Replace an existing session with the same name.
    pub overwrite: bool,
    /// Restore the context block as context items.
    pub include_context: bool,
}

/// Supplies the environment part of an export's context block.
pub trait ContextSource: Send + Sync {
    /// Working directory of the exporting tool.
    fn working_directory(&self) -> Option<String>;

    /// Persistent project memory text.
    fn project_memory(&self) -> Option<String>;
}

/// Context from a project directory and its memory file.
pub struct WorkspaceContext {
    root: PathBuf,
    memory_file: String,
}

impl WorkspaceContext {
    pub fn new(root: impl Into<PathBuf>, memory_file: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            memory_file: memory_file.into(),
        }
    }
}

impl ContextSource for WorkspaceContext {
    fn working_directory(&self) -> Option<String> {
        Some(self.root.display().to_string())
    }

    fn project_memory(&self) -> Option<String> {
        if self.memory_file.is_empty() {
            return None;
        }
        let path = self.root.join(&self.memory_file);
        match fs::read_to_string(&path) {
            Ok(text) if !text.trim().is_empty() => Some(text),
            Ok(_) => None,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "No project memory");
                None
            }
        }
    }
}

/// Assemble a checkpoint from stored records.
pub fn build_checkpoint(
    session: &Session,
    messages: &[Message],
    context_items: &[ContextItem],
    source: Option<&dyn ContextSource>,
    options: &ExportOptions,
) -> Checkpoint {
    let checkpoint_messages: Vec<CheckpointMessage> = messages
        .iter()
        .map(|m| CheckpointMessage {
            role: m.role.to_string(),
            content: m.content.clone(),
            created_at: m.created_at,
            archived: m.archived,
        })
        .collect();

    let statistics = CheckpointStatistics {
        message_count: messages.len(),
        user_messages: messages.iter().filter(|m| m.role == Role::User).count(),
        assistant_messages: messages
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .count(),
        total_tokens: Some(messages.iter().map(|m| estimate_tokens(&m.content) as u64).sum()),
        tool_calls: None,
    };

    let context = if options.include_context {
        let ctx = CheckpointContext {
            project_memory: source.and_then(|s| s.project_memory()),
            files_accessed: context_items
                .iter()
                .filter(|c| c.context_type == context_type::FILE)
                .map(|c| c.key.clone())
                .collect(),
            working_directory: source.and_then(|s| s.working_directory()),
        };
        (!ctx.is_empty()).then_some(ctx)
    } else {
        None
    };

    Checkpoint {
        version: CHECKPOINT_VERSION.to_string(),
        exported_at: Utc::now(),
        exported_by: options.exported_by.clone().filter(|s| !s.is_empty()),
        session: CheckpointSession {
            name: session.name.clone(),
            provider: session.provider.clone(),
            model: session.model.clone(),
            agent: session.agent.clone(),
            project_path: session.project_path.clone(),
            created_at: session.created_at,
            updated_at: session.updated_at,
            metadata: if options.include_metadata && !session.metadata.is_empty() {
                Some(session.metadata.clone())
            } else {
                None
            },
        },
        messages: checkpoint_messages,
        context,
        statistics,
    }
}

/// Render a checkpoint as a Markdown report.
pub fn render_markdown(checkpoint: &Checkpoint) -> String {
    let session = &checkpoint.session;
    let stats = &checkpoint.statistics;
    let mut out = String::new();

    out.push_str(&format!("# Chat Session: {}\n\n", session.name));
    out.push_str(&format!("**Provider:** {}\n", session.provider));
    out.push_str(&format!("**Model:** {}\n", session.model));
    if !session.agent.is_empty() {
        out.push_str(&format!("**Agent:** {}\n", session.agent));
    }
    if !session.project_path.is_empty() {
        out.push_str(&format!("**Project:** `{}`\n", session.project_path));
    }
    out.push_str(&format!(
        "**Created:** {}\n",
        session.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    out.push_str(&format!(
        "**Exported:** {}\n",
        checkpoint.exported_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    if let Some(by) = &checkpoint.exported_by {
        out.push_str(&format!("**Exported By:** {}\n", by));
    }

    out.push_str("\n## Statistics\n\n");
    out.push_str(&format!("- Total Messages: {}\n", stats.message_count));
    out.push_str(&format!("- User Messages: {}\n", stats.user_messages));
    out.push_str(&format!("- Assistant Messages: {}\n", stats.assistant_messages));
    if let Some(tokens) = stats.total_tokens {
        out.push_str(&format!("- Total Tokens: {}\n", tokens));
    }
    if let Some(calls) = stats.tool_calls {
        out.push_str(&format!("- Tool Calls: {}\n", calls));
    }

    if let Some(ctx) = &checkpoint.context {
        out.push_str("\n## Context\n\n");
        if let Some(dir) = &ctx.working_directory {
            out.push_str(&format!("**Working Directory:** `{}`\n", dir));
        }
        if let Some(memory) = &ctx.project_memory {
            out.push_str("\n### Project Memory\n\n");
            out.push_str(memory.trim_end());
            out.push('\n');
        }
        if !ctx.files_accessed.is_empty() {
            out.push_str("\n### Files Accessed\n\n");
            for file in &ctx.files_accessed {
                out.push_str(&format!("- `{}`\n", file));
            }
        }
    }

    out.push_str("\n## Conversation\n");
    for msg in &checkpoint.messages {
        let mut heading = msg.role.to_uppercase();
        if msg.archived {
            heading.push_str(" (COMPACTED)");
        }
        out.push_str(&format!(
            "\n### {}\n*{}*\n\n{}\n\n---\n",
            heading,
            msg.created_at.format("%Y-%m-%d %H:%M:%S"),
            msg.content.trim_end()
        ));
    }

    out
}

/// Encode a checkpoint.
pub fn encode_checkpoint(checkpoint: &Checkpoint, format: CheckpointFormat) -> Result<String> {
    Ok(match format {
        CheckpointFormat::Json => serde_json::to_string_pretty(checkpoint)?,
        CheckpointFormat::Yaml => serde_yaml::to_string(checkpoint)?,
        CheckpointFormat::Markdown => render_markdown(checkpoint),
    })
}

/// Decode a checkpoint. Markdown reports cannot be decoded.
pub fn decode_checkpoint(text: &str, format: CheckpointFormat) -> Result<Checkpoint> {
    match format {
        CheckpointFormat::Json => Ok(serde_json::from_str(text)?),
        CheckpointFormat::Yaml => Ok(serde_yaml::from_str(text)?),
        CheckpointFormat::Markdown => Err(SessionError::UnsupportedFormat(
            "markdown checkpoints are export-only and cannot be imported".to_string(),
        )),
    }
}

/// Write a checkpoint to `path`. The parent directory must exist.
pub fn write_checkpoint(checkpoint: &Checkpoint, path: &Path, format: CheckpointFormat) -> Result<()> {
    let text = encode_checkpoint(checkpoint, format)?;
    fs::write(path, text)?;
    Ok(())
}

/// Read a checkpoint, detecting the format from the extension.
pub fn read_checkpoint(path: &Path) -> Result<Checkpoint> {
    let format = CheckpointFormat::from_path(path);
    if format == CheckpointFormat::Markdown {
        return decode_checkpoint("", format);
    }
    let text = fs::read_to_string(path)?;
    decode_checkpoint(&text, format)
}

/// Read and validate a checkpoint file without importing it.
pub fn validate_checkpoint_file(path: &Path) -> Result<Checkpoint> {
    let checkpoint = read_checkpoint(path)?;
    validate_checkpoint(&checkpoint)?;
    Ok(checkpoint)
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(SessionError::Cancelled);
    }
    Ok(())
}

impl SessionManager {
    /// Export a session to `path`. Returns the written checkpoint.
    pub async fn export_session(
        &self,
        session_id: &str,
        path: &Path,
        options: &ExportOptions,
    ) -> Result<Checkpoint> {
        let session = self.store.get_session(session_id).await?;
        let messages = self.store.get_messages(session_id, 0).await?;
        let context_items = if options.include_context {
            self.store.get_context(session_id).await?
        } else {
            Vec::new()
        };

        let checkpoint = build_checkpoint(
            &session,
            &messages,
            &context_items,
            self.context_source.as_deref(),
            options,
        );

        let format = options
            .format
            .unwrap_or_else(|| CheckpointFormat::from_path(path));
        write_checkpoint(&checkpoint, path, format)?;

        info!(
            session_id = %session_id,
            messages = checkpoint.messages.len(),
            format = %format,
            path = %path.display(),
            "Exported session"
        );
        Ok(checkpoint)
    }

    /// Export a session found by name in the manager's scope.
    pub async fn export_session_by_name(
        &self,
        name: &str,
        path: &Path,
        options: &ExportOptions,
    ) -> Result<Checkpoint> {
        let session = self.get_session_by_name(name).await?;
        self.export_session(&session.id, path, options).await
    }

    /// Import a checkpoint file.
    pub async fn import_session(
        &self,
        cancel: &CancellationToken,
        path: &Path,
        options: &ImportOptions,
    ) -> Result<Session> {
        let checkpoint = read_checkpoint(path)?;
        self.import_checkpoint(cancel, &checkpoint, options).await
    }

    /// Import a parsed checkpoint as a new session.
    ///
    /// Validation and the cancellation check run before any write. If
    /// anything fails after the session row is created, the partial session
    /// is deleted again. With `overwrite`, the existing session is deleted
    /// before the new one is written, so a later failure or cancellation
    /// leaves neither.
    pub async fn import_checkpoint(
        &self,
        cancel: &CancellationToken,
        checkpoint: &Checkpoint,
        options: &ImportOptions,
    ) -> Result<Session> {
        validate_checkpoint(checkpoint)?;
        check_cancelled(cancel)?;

        let name = options
            .name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| checkpoint.session.name.clone());
        let project_path = options
            .project_path
            .clone()
            .unwrap_or_else(|| self.project_path().to_string());

        match self.store.get_session_by_name(&project_path, &name).await {
            Ok(existing) if options.overwrite => {
                self.store.delete_session(&existing.id).await?;
                info!(session_id = %existing.id, name = %name, "Replaced existing session");
            }
            Ok(_) => return Err(SessionError::AlreadyExists(format!("session '{}'", name))),
            Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let session = Session::new(
            &name,
            &project_path,
            &checkpoint.session.model,
            &checkpoint.session.provider,
        )
        .with_agent(checkpoint.session.agent.clone())
        .with_metadata(checkpoint.session.metadata.clone().unwrap_or_default());

        match self.store.create_session(&session).await {
            Ok(()) => {}
            Err(StoreError::Constraint(_)) => {
                return Err(SessionError::AlreadyExists(format!("session '{}'", name)))
            }
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = self.populate_import(cancel, &session, checkpoint, options).await {
            if let Err(cleanup) = self.store.delete_session(&session.id).await {
                warn!(session_id = %session.id, error = %cleanup, "Failed to remove partial import");
            }
            return Err(e);
        }

        let imported = self.store.get_session(&session.id).await?;
        info!(
            session_id = %imported.id,
            name = %imported.name,
            messages = imported.message_count,
            "Imported session"
        );
        Ok(imported)
    }

    async fn populate_import(
        &self,
        cancel: &CancellationToken,
        session: &Session,
        checkpoint: &Checkpoint,
        options: &ImportOptions,
    ) -> Result<()> {
        let mut archived = Vec::new();

        for (index, cm) in checkpoint.messages.iter().enumerate() {
            check_cancelled(cancel)?;
            let role: Role = cm.role.parse().map_err(|_| ValidationError::InvalidRole {
                index,
                role: cm.role.clone(),
            })?;
            let mut message = Message::new(&session.id, role, cm.content.clone())
                .with_created_at(cm.created_at)
                .with_archived(cm.archived);
            message.id = self.store.add_message(&message).await?;
            if message.archived {
                archived.push(message);
            }
        }

        // Archived messages arrive without their summaries; rebuild one.
        if !archived.is_empty() {
            check_cancelled(cancel)?;
            let content = simple_summary(&archived);
            let tokens = estimate_tokens(&content);
            let ids = archived.iter().map(|m| m.id).collect();
            self.store
                .store_summary(&Summary::new(&session.id, ids, content, tokens))
                .await?;
        }

        if options.include_context {
            if let Some(ctx) = &checkpoint.context {
                for file in &ctx.files_accessed {
                    check_cancelled(cancel)?;
                    self.store
                        .add_context(&ContextItem::new(&session.id, context_type::FILE, file, file))
                        .await?;
                }
                if let Some(dir) = &ctx.working_directory {
                    check_cancelled(cancel)?;
                    self.store
                        .add_context(&ContextItem::new(
                            &session.id,
                            context_type::SETTING,
                            "working_directory",
                            dir,
                        ))
                        .await?;
                }
            }
        }

        Ok(())
    }
}
