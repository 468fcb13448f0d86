//! Integration tests for checkpoint export and import against SQLite.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use chatvault_core::session::context_type;
use chatvault_core::{CompactConfig, ContextItem, Message, Role, Session, Summary};
use chatvault_session::checkpoint::{read_checkpoint, write_checkpoint};
use chatvault_session::store::Result as StoreResult;
use chatvault_session::{
    validate_checkpoint_file, CheckpointFormat, ExportOptions, ImportOptions, ManagerConfig,
    SessionError, SessionManager, SessionStore, SqliteSessionStore, WorkspaceContext,
};

fn sqlite_manager(dir: &TempDir) -> SessionManager {
    let store = Arc::new(SqliteSessionStore::new(dir.path().join("sessions.db")).unwrap());
    SessionManager::new(store, ManagerConfig::new("/projects/infra"))
}

async fn seeded_session(manager: &SessionManager, name: &str) -> Session {
    let session = manager.create_session(name, "gpt-4", "openai").await.unwrap();
    manager
        .add_message(&session.id, Role::User, "What is the capital of France?")
        .await
        .unwrap();
    manager
        .add_message(&session.id, Role::Assistant, "The capital of France is Paris.")
        .await
        .unwrap();
    manager
        .add_message(&session.id, Role::User, "And of Spain?")
        .await
        .unwrap();
    session
}

#[tokio::test]
async fn test_json_roundtrip_preserves_messages() {
    let dir = TempDir::new().unwrap();
    let manager = sqlite_manager(&dir);
    let session = seeded_session(&manager, "roundtrip").await;

    let path = dir.path().join("roundtrip.json");
    let exported = manager
        .export_session(&session.id, &path, &ExportOptions::default())
        .await
        .unwrap();
    assert_eq!(exported.statistics.message_count, 3);
    assert_eq!(exported.statistics.user_messages, 2);

    let options = ImportOptions {
        name: Some("roundtrip-imported".to_string()),
        ..Default::default()
    };
    let imported = manager
        .import_session(&CancellationToken::new(), &path, &options)
        .await
        .unwrap();

    assert_eq!(imported.name, "roundtrip-imported");
    assert_eq!(imported.model, "gpt-4");
    assert_eq!(imported.provider, "openai");
    assert_eq!(imported.message_count, 3);
    assert_ne!(imported.id, session.id);

    let original = manager.get_messages(&session.id, 0).await.unwrap();
    let copied = manager.get_messages(&imported.id, 0).await.unwrap();
    assert_eq!(
        original.iter().map(|m| (m.role, m.content.as_str())).collect::<Vec<_>>(),
        copied.iter().map(|m| (m.role, m.content.as_str())).collect::<Vec<_>>()
    );
    assert_eq!(
        original[0].created_at.timestamp_micros(),
        copied[0].created_at.timestamp_micros()
    );
}

#[tokio::test]
async fn test_yaml_roundtrip_with_metadata() {
    let dir = TempDir::new().unwrap();
    let manager = sqlite_manager(&dir);
    let mut session = seeded_session(&manager, "yaml").await;
    session
        .metadata
        .insert("ticket".to_string(), serde_json::json!("OPS-42"));
    manager.update_session(&mut session).await.unwrap();

    let path = dir.path().join("session.yml");
    let options = ExportOptions {
        include_metadata: true,
        exported_by: Some("tester".to_string()),
        ..Default::default()
    };
    manager.export_session(&session.id, &path, &options).await.unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("version: '1.0'") || text.contains("version: \"1.0\""));
    assert!(text.contains("exported_by: tester"));

    let checkpoint = read_checkpoint(&path).unwrap();
    assert_eq!(checkpoint.session.metadata.unwrap()["ticket"], "OPS-42");

    let imported = manager
        .import_session(
            &CancellationToken::new(),
            &path,
            &ImportOptions {
                name: Some("yaml-copy".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(imported.metadata["ticket"], "OPS-42");
}

#[tokio::test]
async fn test_reimport_requires_overwrite() {
    let dir = TempDir::new().unwrap();
    let manager = sqlite_manager(&dir);
    let session = seeded_session(&manager, "dup").await;
    let path = dir.path().join("dup.json");
    manager
        .export_session(&session.id, &path, &ExportOptions::default())
        .await
        .unwrap();
    manager
        .add_message(&session.id, Role::Assistant, "Madrid.")
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let result = manager
        .import_session(&cancel, &path, &ImportOptions::default())
        .await;
    assert!(matches!(result, Err(SessionError::AlreadyExists(_))));

    let replaced = manager
        .import_session(
            &cancel,
            &path,
            &ImportOptions {
                overwrite: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(replaced.name, "dup");
    assert_eq!(replaced.message_count, 3);
    assert!(matches!(
        manager.get_session(&session.id).await,
        Err(SessionError::NotFound(_))
    ));
    assert_eq!(manager.list_sessions(0).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_archived_messages_import_with_summary() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteSessionStore::new(dir.path().join("sessions.db")).unwrap());
    let config = ManagerConfig {
        project_path: "/projects/infra".to_string(),
        max_history_messages: 20,
        compact: CompactConfig {
            enabled: true,
            ..Default::default()
        },
    };
    let manager = SessionManager::new(store, config);

    let session = manager.create_session("long", "gpt-4", "openai").await.unwrap();
    for i in 0..20 {
        manager
            .add_message(&session.id, Role::User, &format!("Step {}", i))
            .await
            .unwrap();
    }
    let outcome = manager
        .compact_session(&CancellationToken::new(), &session.id, false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.messages_compacted, 8);

    let path = dir.path().join("long.json");
    let checkpoint = manager
        .export_session(&session.id, &path, &ExportOptions::default())
        .await
        .unwrap();
    assert_eq!(checkpoint.messages.len(), 20);
    assert_eq!(checkpoint.messages.iter().filter(|m| m.archived).count(), 8);

    let imported = manager
        .import_session(
            &CancellationToken::new(),
            &path,
            &ImportOptions {
                name: Some("long-copy".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let messages = manager.store().get_messages(&imported.id, 0).await.unwrap();
    let archived: HashSet<i64> = messages.iter().filter(|m| m.archived).map(|m| m.id).collect();
    let summaries = manager.store().get_summaries(&imported.id).await.unwrap();
    assert_eq!(summaries.len(), 1);
    let summarized: HashSet<i64> = summaries[0].original_message_ids.iter().copied().collect();
    assert_eq!(archived, summarized);
    assert_eq!(archived.len(), 8);
}

#[tokio::test]
async fn test_context_export_and_import() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("CHATVAULT.md"), "Use us-east-1 for everything.").unwrap();
    let store = Arc::new(SqliteSessionStore::new(dir.path().join("sessions.db")).unwrap());
    let manager = SessionManager::new(store, ManagerConfig::new("/projects/infra"))
        .with_context_source(Arc::new(WorkspaceContext::new(dir.path(), "CHATVAULT.md")));

    let session = seeded_session(&manager, "ctx").await;
    manager
        .add_context(&session.id, context_type::FILE, "main.tf", "main.tf")
        .await
        .unwrap();

    let path = dir.path().join("ctx.md");
    manager
        .export_session(
            &session.id,
            &path,
            &ExportOptions {
                include_context: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let report = std::fs::read_to_string(&path).unwrap();
    assert!(report.contains("# Chat Session: ctx"));
    assert!(report.contains("### Project Memory"));
    assert!(report.contains("Use us-east-1"));
    assert!(report.contains("- `main.tf`"));

    // Markdown is export-only.
    let result = manager
        .import_session(&CancellationToken::new(), &path, &ImportOptions::default())
        .await;
    assert!(matches!(result, Err(SessionError::UnsupportedFormat(_))));

    let json_path = dir.path().join("ctx.json");
    manager
        .export_session(
            &session.id,
            &json_path,
            &ExportOptions {
                include_context: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let imported = manager
        .import_session(
            &CancellationToken::new(),
            &json_path,
            &ImportOptions {
                name: Some("ctx-copy".to_string()),
                include_context: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let items = manager.get_context(&imported.id).await.unwrap();
    assert!(items
        .iter()
        .any(|c| c.context_type == context_type::FILE && c.key == "main.tf"));
    assert!(items
        .iter()
        .any(|c| c.context_type == context_type::SETTING && c.key == "working_directory"));
}

#[tokio::test]
async fn test_export_errors() {
    let dir = TempDir::new().unwrap();
    let manager = sqlite_manager(&dir);

    let result = manager
        .export_session("non-existent-id", &dir.path().join("x.json"), &ExportOptions::default())
        .await;
    assert!(matches!(result, Err(SessionError::NotFound(_))));

    let session = seeded_session(&manager, "err").await;
    let missing_dir = dir.path().join("nonexistent").join("subdir").join("x.json");
    let result = manager
        .export_session(&session.id, &missing_dir, &ExportOptions::default())
        .await;
    assert!(matches!(result, Err(SessionError::Io(_))));

    let result = manager
        .export_session_by_name("missing", &dir.path().join("y.json"), &ExportOptions::default())
        .await;
    assert!(matches!(result, Err(SessionError::NotFound(_))));
}

#[tokio::test]
async fn test_validate_checkpoint_file() {
    let dir = TempDir::new().unwrap();
    let manager = sqlite_manager(&dir);
    let session = seeded_session(&manager, "valid").await;

    let good = dir.path().join("good.json");
    let mut checkpoint = manager
        .export_session(&session.id, &good, &ExportOptions::default())
        .await
        .unwrap();
    assert!(validate_checkpoint_file(&good).is_ok());

    checkpoint.statistics.message_count = 99;
    let bad = dir.path().join("bad.json");
    write_checkpoint(&checkpoint, &bad, CheckpointFormat::Json).unwrap();
    let err = validate_checkpoint_file(&bad).unwrap_err();
    assert!(matches!(err, SessionError::Validation(_)));
    assert!(err.to_string().contains("message_count"));

    let garbage = dir.path().join("garbage.json");
    std::fs::write(&garbage, "{ not json").unwrap();
    assert!(matches!(
        validate_checkpoint_file(&garbage),
        Err(SessionError::Json(_))
    ));

    // Nothing was written to the store by validation.
    assert_eq!(manager.list_sessions(0).await.unwrap().len(), 1);
}

/// Store wrapper that cancels a token after a number of appended messages.
struct CancellingStore {
    inner: SqliteSessionStore,
    cancel: CancellationToken,
    cancel_after: usize,
    appended: AtomicUsize,
}

#[async_trait]
impl SessionStore for CancellingStore {
    async fn create_session(&self, session: &Session) -> StoreResult<()> {
        self.inner.create_session(session).await
    }
    async fn get_session(&self, id: &str) -> StoreResult<Session> {
        self.inner.get_session(id).await
    }
    async fn get_session_by_name(&self, project_path: &str, name: &str) -> StoreResult<Session> {
        self.inner.get_session_by_name(project_path, name).await
    }
    async fn list_sessions(&self, project_path: &str, limit: usize) -> StoreResult<Vec<Session>> {
        self.inner.list_sessions(project_path, limit).await
    }
    async fn update_session(&self, session: &Session) -> StoreResult<()> {
        self.inner.update_session(session).await
    }
    async fn delete_session(&self, id: &str) -> StoreResult<()> {
        self.inner.delete_session(id).await
    }
    async fn delete_sessions_older_than(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        self.inner.delete_sessions_older_than(cutoff).await
    }
    async fn add_message(&self, message: &Message) -> StoreResult<i64> {
        let id = self.inner.add_message(message).await?;
        if self.appended.fetch_add(1, Ordering::SeqCst) + 1 >= self.cancel_after {
            self.cancel.cancel();
        }
        Ok(id)
    }
    async fn get_messages(&self, session_id: &str, limit: usize) -> StoreResult<Vec<Message>> {
        self.inner.get_messages(session_id, limit).await
    }
    async fn get_active_messages(&self, session_id: &str) -> StoreResult<Vec<Message>> {
        self.inner.get_active_messages(session_id).await
    }
    async fn message_count(&self, session_id: &str) -> StoreResult<usize> {
        self.inner.message_count(session_id).await
    }
    async fn archive_messages(&self, session_id: &str, ids: &[i64]) -> StoreResult<usize> {
        self.inner.archive_messages(session_id, ids).await
    }
    async fn store_summary(&self, summary: &Summary) -> StoreResult<()> {
        self.inner.store_summary(summary).await
    }
    async fn get_summaries(&self, session_id: &str) -> StoreResult<Vec<Summary>> {
        self.inner.get_summaries(session_id).await
    }
    async fn add_context(&self, item: &ContextItem) -> StoreResult<()> {
        self.inner.add_context(item).await
    }
    async fn get_context(&self, session_id: &str) -> StoreResult<Vec<ContextItem>> {
        self.inner.get_context(session_id).await
    }
    async fn delete_context(&self, session_id: &str) -> StoreResult<usize> {
        self.inner.delete_context(session_id).await
    }
}

#[tokio::test]
async fn test_cancelled_import_leaves_nothing_behind() {
    let dir = TempDir::new().unwrap();
    let source = sqlite_manager(&dir);
    let session = seeded_session(&source, "cancel-me").await;
    let path = dir.path().join("cancel.json");
    source
        .export_session(&session.id, &path, &ExportOptions::default())
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let store = Arc::new(CancellingStore {
        inner: SqliteSessionStore::new(dir.path().join("target.db")).unwrap(),
        cancel: cancel.clone(),
        cancel_after: 2,
        appended: AtomicUsize::new(0),
    });
    let target = SessionManager::new(store.clone(), ManagerConfig::new("/projects/infra"));

    let result = target
        .import_session(&cancel, &path, &ImportOptions::default())
        .await;
    assert!(matches!(result, Err(SessionError::Cancelled)));

    assert!(target.list_sessions(0).await.unwrap().is_empty());
    assert!(matches!(
        target.get_session_by_name("cancel-me").await,
        Err(SessionError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_pre_cancelled_import_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let manager = sqlite_manager(&dir);
    let session = seeded_session(&manager, "early").await;
    let path = dir.path().join("early.json");
    manager
        .export_session(&session.id, &path, &ExportOptions::default())
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = manager
        .import_session(
            &cancel,
            &path,
            &ImportOptions {
                name: Some("early-copy".to_string()),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(result, Err(SessionError::Cancelled)));
    assert_eq!(manager.list_sessions(0).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_pre_cancelled_overwrite_keeps_existing_session() {
    let dir = TempDir::new().unwrap();
    let manager = sqlite_manager(&dir);
    let session = seeded_session(&manager, "keep").await;
    let path = dir.path().join("keep.json");
    manager
        .export_session(&session.id, &path, &ExportOptions::default())
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = manager
        .import_session(
            &cancel,
            &path,
            &ImportOptions {
                overwrite: true,
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(result, Err(SessionError::Cancelled)));

    let existing = manager.get_session_by_name("keep").await.unwrap();
    assert_eq!(existing.id, session.id);
    assert_eq!(manager.get_messages(&session.id, 0).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_import_without_message_timestamps() {
    let dir = TempDir::new().unwrap();
    let manager = sqlite_manager(&dir);
    let path = dir.path().join("bare.json");
    std::fs::write(
        &path,
        r#"{"version":"1.0",
            "session":{"name":"bare","provider":"openai","model":"gpt-4"},
            "messages":[{"role":"user","content":"hello"},{"role":"assistant","content":"hi"}],
            "statistics":{"message_count":2}}"#,
    )
    .unwrap();

    let before = Utc::now();
    let session = manager
        .import_session(&CancellationToken::new(), &path, &ImportOptions::default())
        .await
        .unwrap();

    let messages = manager.get_messages(&session.id, 0).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert!(messages.iter().all(|m| m.created_at >= before - chrono::Duration::seconds(1)));
}

#[tokio::test]
async fn test_checkpoint_without_session_block_names_the_rule() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nosession.json");
    std::fs::write(
        &path,
        r#"{"version":"1.0","messages":[{"role":"user","content":"hi"}],"statistics":{"message_count":1}}"#,
    )
    .unwrap();

    let err = validate_checkpoint_file(&path).unwrap_err();
    assert!(matches!(err, SessionError::Validation(_)));
    assert!(err.to_string().contains("session name is required"));
}
