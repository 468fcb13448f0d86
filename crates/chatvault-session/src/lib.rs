//! # chatvault-session
//!
//! Session persistence, compaction and checkpoints for chatvault.
//!
//! This crate provides:
//! - The [`store::SessionStore`] contract with SQLite and in-memory backends
//! - History compaction with AI summaries and a deterministic fallback
//! - Session lifecycle management with compaction-aware reads
//! - Portable checkpoints (JSON, YAML, Markdown report)
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use chatvault_core::{Config, Role};
//! use chatvault_session::{ManagerConfig, SessionManager, SqliteSessionStore};
//! use tokio_util::sync::CancellationToken;
//!
//! let store = Arc::new(SqliteSessionStore::new(Config::default().database_path())?);
//! let manager = SessionManager::new(store, ManagerConfig::new("/path/to/project"));
//!
//! let session = manager.create_session("vpc-design", "gpt-4", "openai").await?;
//! manager.add_message(&session.id, Role::User, "Which CIDR should we use?").await?;
//!
//! let history = manager
//!     .get_messages_with_compaction(&CancellationToken::new(), &session.id, 50)
//!     .await?;
//! ```
//!
//! ## Storage Architecture
//!
//! Sessions are stored in `~/.local/share/chatvault/sessions.db` unless
//! `storage.database_path` says otherwise. Messages are never rewritten:
//! compaction stores a summary and flips the `archived` flag on the
//! messages it replaces.

pub mod checkpoint;
pub mod compaction;
pub mod manager;
pub mod memory;
pub mod store;

// Re-export commonly used types
pub use checkpoint::{
    validate_checkpoint, validate_checkpoint_file, Checkpoint, CheckpointFormat, ContextSource,
    ExportOptions, ImportOptions, ValidationError, WorkspaceContext, CHECKPOINT_VERSION,
};
pub use compaction::{
    should_compact, CompactError, CompactOutcome, CompactPlan, CompactionObserver, Compactor,
    NoOpObserver, Summarizer, SummaryOptions,
};
pub use manager::{ManagerConfig, SessionError, SessionManager};
pub use memory::MemorySessionStore;
pub use store::{SessionStore, SqliteSessionStore, StoreError};
