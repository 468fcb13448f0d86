//! Session storage implementation.
//!
//! Provides the [`SessionStore`] contract and its SQLite-backed
//! implementation. Sessions own their messages, summaries and context items;
//! deleting a session removes all of them in one statement through
//! `ON DELETE CASCADE`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use thiserror::Error;
use tracing::debug;

use chatvault_core::{ContextItem, Message, Role, Session, Summary};

/// Errors that can occur during session storage operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Store lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Session storage trait for abstraction over storage backends.
///
/// Message lists are always ordered oldest to newest (by assigned ID).
/// A `limit` of 0 means "no limit".
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create a new session.
    async fn create_session(&self, session: &Session) -> Result<()>;

    /// Get a session by ID.
    async fn get_session(&self, id: &str) -> Result<Session>;

    /// Get a session by name within a project scope.
    async fn get_session_by_name(&self, project_path: &str, name: &str) -> Result<Session>;

    /// List sessions in a project scope, most recently updated first.
    async fn list_sessions(&self, project_path: &str, limit: usize) -> Result<Vec<Session>>;

    /// Update a session's mutable fields.
    async fn update_session(&self, session: &Session) -> Result<()>;

    /// Delete a session and everything attached to it.
    async fn delete_session(&self, id: &str) -> Result<()>;

    /// Delete sessions whose `updated_at` is before `cutoff`. Returns the count.
    async fn delete_sessions_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    /// Append a message. Returns the assigned ID.
    async fn add_message(&self, message: &Message) -> Result<i64>;

    /// Get the first `limit` messages of a session, archived ones included.
    async fn get_messages(&self, session_id: &str, limit: usize) -> Result<Vec<Message>>;

    /// Get the messages that have not been archived.
    async fn get_active_messages(&self, session_id: &str) -> Result<Vec<Message>>;

    /// Count all messages of a session.
    async fn message_count(&self, session_id: &str) -> Result<usize>;

    /// Mark messages as archived. Returns the number of rows changed.
    async fn archive_messages(&self, session_id: &str, ids: &[i64]) -> Result<usize>;

    /// Persist a summary.
    async fn store_summary(&self, summary: &Summary) -> Result<()>;

    /// Get all summaries of a session, ordered by position.
    async fn get_summaries(&self, session_id: &str) -> Result<Vec<Summary>>;

    /// Attach a context item.
    async fn add_context(&self, item: &ContextItem) -> Result<()>;

    /// Get all context items of a session.
    async fn get_context(&self, session_id: &str) -> Result<Vec<ContextItem>>;

    /// Delete all context items of a session. Returns the count.
    async fn delete_context(&self, session_id: &str) -> Result<usize>;

    /// Store a summary and archive the messages it replaces.
    async fn apply_compaction(&self, summary: &Summary) -> Result<()> {
        self.store_summary(summary).await?;
        self.archive_messages(&summary.session_id, &summary.original_message_ids)
            .await?;
        Ok(())
    }
}

/// Schema migrations, applied in order.
const MIGRATIONS: &[(i32, &str)] = &[
    (1, include_str!("../migrations/001_initial.sql")),
    (2, include_str!("../migrations/002_compaction.sql")),
];

const SESSION_COLUMNS: &str = "s.id, s.name, s.project_path, s.model, s.provider, s.agent, \
     s.created_at, s.updated_at, s.metadata, \
     (SELECT COUNT(*) FROM messages m WHERE m.session_id = s.id)";

const MESSAGE_COLUMNS: &str = "id, session_id, role, content, created_at, archived";

/// SQLite-backed session storage.
pub struct SqliteSessionStore {
    /// Database connection (wrapped in mutex for thread safety).
    conn: Mutex<Connection>,
    /// Database file location.
    path: PathBuf,
}

impl SqliteSessionStore {
    /// Open (or create) a SQLite session store at `db_path`.
    ///
    /// Creates the parent directory and runs migrations if needed.
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&path)?;

        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        conn.busy_timeout(Duration::from_millis(5000))?;

        let store = Self {
            conn: Mutex::new(conn),
            path,
        };

        store.run_migrations()?;
        debug!(path = %store.path.display(), "Opened session store");

        Ok(store)
    }

    /// Database file location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Run database migrations.
    fn run_migrations(&self) -> Result<()> {
        let mut conn = self.conn()?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        for (version, sql) in MIGRATIONS {
            if *version <= current_version {
                continue;
            }
            let tx = conn.transaction()?;
            tx.execute_batch(sql)?;
            tx.commit()?;
            debug!(version, "Applied schema migration");
        }

        Ok(())
    }

    fn insert_summary(conn: &Connection, summary: &Summary) -> Result<()> {
        let ids_json = serde_json::to_string(&summary.original_message_ids)?;
        conn.execute(
            r#"
            INSERT INTO summaries (
                id, session_id, original_message_ids, first_message_id,
                message_range, content, token_count, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                summary.id,
                summary.session_id,
                ids_json,
                summary.position(),
                summary.message_range,
                summary.content,
                summary.token_count as i64,
                format_datetime(&summary.created_at),
            ],
        )
        .map_err(map_constraint)?;
        Ok(())
    }

    fn query_messages(
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Message>> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, message_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

/// Format datetime for SQLite. Fixed width so text comparison orders correctly.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse datetime from a SQLite column.
fn parse_datetime(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn map_constraint(err: rusqlite::Error) -> StoreError {
    match err {
        rusqlite::Error::SqliteFailure(e, msg) if e.code == ErrorCode::ConstraintViolation => {
            StoreError::Constraint(msg.unwrap_or_else(|| e.to_string()))
        }
        other => StoreError::Database(other),
    }
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    let metadata_json: String = row.get(8)?;
    let metadata = serde_json::from_str(&metadata_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(8, Type::Text, Box::new(e)))?;

    Ok(Session {
        id: row.get(0)?,
        name: row.get(1)?,
        project_path: row.get(2)?,
        model: row.get(3)?,
        provider: row.get(4)?,
        agent: row.get(5)?,
        created_at: parse_datetime(6, &row.get::<_, String>(6)?)?,
        updated_at: parse_datetime(7, &row.get::<_, String>(7)?)?,
        metadata,
        message_count: row.get::<_, i64>(9)? as usize,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let role: Role = row
        .get::<_, String>(2)?
        .parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;

    Ok(Message {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role,
        content: row.get(3)?,
        created_at: parse_datetime(4, &row.get::<_, String>(4)?)?,
        archived: row.get(5)?,
        is_summary: false,
    })
}

fn summary_from_row(row: &Row<'_>) -> rusqlite::Result<Summary> {
    let ids_json: String = row.get(2)?;
    let original_message_ids = serde_json::from_str(&ids_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;

    Ok(Summary {
        id: row.get(0)?,
        session_id: row.get(1)?,
        original_message_ids,
        message_range: row.get(3)?,
        content: row.get(4)?,
        token_count: row.get::<_, i64>(5)? as usize,
        created_at: parse_datetime(6, &row.get::<_, String>(6)?)?,
    })
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn create_session(&self, session: &Session) -> Result<()> {
        let conn = self.conn()?;
        let metadata_json = serde_json::to_string(&session.metadata)?;

        conn.execute(
            r#"
            INSERT INTO sessions (
                id, name, project_path, model, provider, agent,
                created_at, updated_at, metadata
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                session.id,
                session.name,
                session.project_path,
                session.model,
                session.provider,
                session.agent,
                format_datetime(&session.created_at),
                format_datetime(&session.updated_at),
                metadata_json,
            ],
        )
        .map_err(map_constraint)?;

        debug!(session_id = %session.id, name = %session.name, "Created session");
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Session> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM sessions s WHERE s.id = ?1", SESSION_COLUMNS),
            params![id],
            session_from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("session {}", id)))
    }

    async fn get_session_by_name(&self, project_path: &str, name: &str) -> Result<Session> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM sessions s WHERE s.project_path = ?1 AND s.name = ?2",
                SESSION_COLUMNS
            ),
            params![project_path, name],
            session_from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("session '{}'", name)))
    }

    async fn list_sessions(&self, project_path: &str, limit: usize) -> Result<Vec<Session>> {
        let conn = self.conn()?;
        let limit = if limit == 0 { -1 } else { limit as i64 };

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sessions s WHERE s.project_path = ?1 \
             ORDER BY s.updated_at DESC LIMIT ?2",
            SESSION_COLUMNS
        ))?;
        let rows = stmt.query_map(params![project_path, limit], session_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn update_session(&self, session: &Session) -> Result<()> {
        let conn = self.conn()?;
        let metadata_json = serde_json::to_string(&session.metadata)?;

        let rows = conn
            .execute(
                r#"
                UPDATE sessions SET
                    name = ?2, project_path = ?3, model = ?4, provider = ?5,
                    agent = ?6, updated_at = ?7, metadata = ?8
                WHERE id = ?1
                "#,
                params![
                    session.id,
                    session.name,
                    session.project_path,
                    session.model,
                    session.provider,
                    session.agent,
                    format_datetime(&session.updated_at),
                    metadata_json,
                ],
            )
            .map_err(map_constraint)?;

        if rows == 0 {
            return Err(StoreError::NotFound(format!("session {}", session.id)));
        }
        Ok(())
    }

    async fn delete_session(&self, id: &str) -> Result<()> {
        let conn = self.conn()?;
        let rows = conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;

        if rows == 0 {
            return Err(StoreError::NotFound(format!("session {}", id)));
        }
        debug!(session_id = %id, "Deleted session");
        Ok(())
    }

    async fn delete_sessions_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn()?;
        let rows = conn.execute(
            "DELETE FROM sessions WHERE updated_at < ?1",
            params![format_datetime(&cutoff)],
        )?;
        debug!(deleted = rows, cutoff = %cutoff, "Deleted old sessions");
        Ok(rows)
    }

    async fn add_message(&self, message: &Message) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO messages (session_id, role, content, created_at, archived)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                message.session_id,
                message.role.as_str(),
                message.content,
                format_datetime(&message.created_at),
                message.archived,
            ],
        )
        .map_err(map_constraint)?;
        Ok(conn.last_insert_rowid())
    }

    async fn get_messages(&self, session_id: &str, limit: usize) -> Result<Vec<Message>> {
        let conn = self.conn()?;
        let limit = if limit == 0 { -1 } else { limit as i64 };
        Self::query_messages(
            &conn,
            &format!(
                "SELECT {} FROM messages WHERE session_id = ?1 ORDER BY id ASC LIMIT ?2",
                MESSAGE_COLUMNS
            ),
            params![session_id, limit],
        )
    }

    async fn get_active_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let conn = self.conn()?;
        Self::query_messages(
            &conn,
            &format!(
                "SELECT {} FROM messages WHERE session_id = ?1 AND archived = 0 ORDER BY id ASC",
                MESSAGE_COLUMNS
            ),
            params![session_id],
        )
    }

    async fn message_count(&self, session_id: &str) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    async fn archive_messages(&self, session_id: &str, ids: &[i64]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut changed = 0;
        {
            let mut stmt =
                tx.prepare("UPDATE messages SET archived = 1 WHERE id = ?1 AND session_id = ?2")?;
            for id in ids {
                changed += stmt.execute(params![id, session_id])?;
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    async fn store_summary(&self, summary: &Summary) -> Result<()> {
        let conn = self.conn()?;
        Self::insert_summary(&conn, summary)
    }

    async fn get_summaries(&self, session_id: &str) -> Result<Vec<Summary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, session_id, original_message_ids, message_range,
                   content, token_count, created_at
            FROM summaries
            WHERE session_id = ?1
            ORDER BY first_message_id ASC, created_at ASC
            "#,
        )?;
        let rows = stmt.query_map(params![session_id], summary_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn add_context(&self, item: &ContextItem) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO session_context (session_id, context_type, context_key, context_value)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![item.session_id, item.context_type, item.key, item.value],
        )
        .map_err(map_constraint)?;
        Ok(())
    }

    async fn get_context(&self, session_id: &str) -> Result<Vec<ContextItem>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT session_id, context_type, context_key, context_value
            FROM session_context
            WHERE session_id = ?1
            ORDER BY id ASC
            "#,
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok(ContextItem {
                session_id: row.get(0)?,
                context_type: row.get(1)?,
                key: row.get(2)?,
                value: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn delete_context(&self, session_id: &str) -> Result<usize> {
        let conn = self.conn()?;
        let rows = conn.execute(
            "DELETE FROM session_context WHERE session_id = ?1",
            params![session_id],
        )?;
        Ok(rows)
    }

    /// Stores the summary and archives its messages in one transaction.
    ///
    /// Fails without changes if any ID is unknown, already archived, or
    /// belongs to another session.
    async fn apply_compaction(&self, summary: &Summary) -> Result<()> {
        if summary.original_message_ids.is_empty() {
            return Err(StoreError::InvalidState(
                "summary covers no messages".to_string(),
            ));
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        Self::insert_summary(&tx, summary)?;

        let mut archived = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE messages SET archived = 1 \
                 WHERE id = ?1 AND session_id = ?2 AND archived = 0",
            )?;
            for id in &summary.original_message_ids {
                archived += stmt.execute(params![id, summary.session_id])?;
            }
        }

        if archived != summary.original_message_ids.len() {
            // Dropping the transaction rolls it back.
            return Err(StoreError::InvalidState(format!(
                "only {} of {} messages could be archived for session {}",
                archived,
                summary.original_message_ids.len(),
                summary.session_id
            )));
        }

        tx.commit()?;
        debug!(
            session_id = %summary.session_id,
            messages = archived,
            range = %summary.message_range,
            "Applied compaction"
        );
        Ok(())
    }
}
