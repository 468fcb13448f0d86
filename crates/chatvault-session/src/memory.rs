//! In-memory session storage.
//!
//! Same contract as [`SqliteSessionStore`](crate::store::SqliteSessionStore),
//! cascades and constraint checks included, without touching disk. Useful
//! for tests and throwaway sessions.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use chatvault_core::{ContextItem, Message, Session, Summary};

use crate::store::{Result, SessionStore, StoreError};

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Session>,
    messages: Vec<Message>,
    summaries: Vec<Summary>,
    context: Vec<ContextItem>,
    next_message_id: i64,
}

impl Inner {
    fn with_counts(&self, mut session: Session) -> Session {
        session.message_count = self
            .messages
            .iter()
            .filter(|m| m.session_id == session.id)
            .count();
        session
    }
}

/// HashMap-backed session storage.
#[derive(Default)]
pub struct MemorySessionStore {
    inner: Mutex<Inner>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create_session(&self, session: &Session) -> Result<()> {
        let mut inner = self.lock()?;

        if inner.sessions.contains_key(&session.id) {
            return Err(StoreError::Constraint(format!(
                "session id {} already exists",
                session.id
            )));
        }
        if inner
            .sessions
            .values()
            .any(|s| s.project_path == session.project_path && s.name == session.name)
        {
            return Err(StoreError::Constraint(format!(
                "session name '{}' already exists in {}",
                session.name, session.project_path
            )));
        }

        let mut stored = session.clone();
        stored.message_count = 0;
        inner.sessions.insert(stored.id.clone(), stored);
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Session> {
        let inner = self.lock()?;
        let session = inner
            .sessions
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("session {}", id)))?;
        Ok(inner.with_counts(session))
    }

    async fn get_session_by_name(&self, project_path: &str, name: &str) -> Result<Session> {
        let inner = self.lock()?;
        let session = inner
            .sessions
            .values()
            .find(|s| s.project_path == project_path && s.name == name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("session '{}'", name)))?;
        Ok(inner.with_counts(session))
    }

    async fn list_sessions(&self, project_path: &str, limit: usize) -> Result<Vec<Session>> {
        let inner = self.lock()?;
        let mut sessions: Vec<Session> = inner
            .sessions
            .values()
            .filter(|s| s.project_path == project_path)
            .cloned()
            .map(|s| inner.with_counts(s))
            .collect();

        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        if limit > 0 {
            sessions.truncate(limit);
        }
        Ok(sessions)
    }

    async fn update_session(&self, session: &Session) -> Result<()> {
        let mut inner = self.lock()?;

        if !inner.sessions.contains_key(&session.id) {
            return Err(StoreError::NotFound(format!("session {}", session.id)));
        }
        if inner.sessions.values().any(|s| {
            s.id != session.id && s.project_path == session.project_path && s.name == session.name
        }) {
            return Err(StoreError::Constraint(format!(
                "session name '{}' already exists in {}",
                session.name, session.project_path
            )));
        }

        if let Some(stored) = inner.sessions.get_mut(&session.id) {
            stored.name = session.name.clone();
            stored.project_path = session.project_path.clone();
            stored.model = session.model.clone();
            stored.provider = session.provider.clone();
            stored.agent = session.agent.clone();
            stored.updated_at = session.updated_at;
            stored.metadata = session.metadata.clone();
        }
        Ok(())
    }

    async fn delete_session(&self, id: &str) -> Result<()> {
        let mut inner = self.lock()?;

        if inner.sessions.remove(id).is_none() {
            return Err(StoreError::NotFound(format!("session {}", id)));
        }
        inner.messages.retain(|m| m.session_id != id);
        inner.summaries.retain(|s| s.session_id != id);
        inner.context.retain(|c| c.session_id != id);
        Ok(())
    }

    async fn delete_sessions_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let stale: Vec<String> = {
            let inner = self.lock()?;
            inner
                .sessions
                .values()
                .filter(|s| s.updated_at < cutoff)
                .map(|s| s.id.clone())
                .collect()
        };

        for id in &stale {
            self.delete_session(id).await?;
        }
        Ok(stale.len())
    }

    async fn add_message(&self, message: &Message) -> Result<i64> {
        let mut inner = self.lock()?;

        if !inner.sessions.contains_key(&message.session_id) {
            return Err(StoreError::Constraint(format!(
                "message references unknown session {}",
                message.session_id
            )));
        }

        inner.next_message_id += 1;
        let id = inner.next_message_id;

        let mut stored = message.clone();
        stored.id = id;
        stored.is_summary = false;
        inner.messages.push(stored);
        Ok(id)
    }

    async fn get_messages(&self, session_id: &str, limit: usize) -> Result<Vec<Message>> {
        let inner = self.lock()?;
        let iter = inner
            .messages
            .iter()
            .filter(|m| m.session_id == session_id)
            .cloned();

        Ok(if limit > 0 {
            iter.take(limit).collect()
        } else {
            iter.collect()
        })
    }

    async fn get_active_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let inner = self.lock()?;
        Ok(inner
            .messages
            .iter()
            .filter(|m| m.session_id == session_id && !m.archived)
            .cloned()
            .collect())
    }

    async fn message_count(&self, session_id: &str) -> Result<usize> {
        let inner = self.lock()?;
        Ok(inner
            .messages
            .iter()
            .filter(|m| m.session_id == session_id)
            .count())
    }

    async fn archive_messages(&self, session_id: &str, ids: &[i64]) -> Result<usize> {
        let mut inner = self.lock()?;
        let mut changed = 0;
        for msg in inner
            .messages
            .iter_mut()
            .filter(|m| m.session_id == session_id && ids.contains(&m.id))
        {
            msg.archived = true;
            changed += 1;
        }
        Ok(changed)
    }

    async fn store_summary(&self, summary: &Summary) -> Result<()> {
        let mut inner = self.lock()?;

        if !inner.sessions.contains_key(&summary.session_id) {
            return Err(StoreError::Constraint(format!(
                "summary references unknown session {}",
                summary.session_id
            )));
        }
        if inner.summaries.iter().any(|s| s.id == summary.id) {
            return Err(StoreError::Constraint(format!(
                "summary id {} already exists",
                summary.id
            )));
        }

        inner.summaries.push(summary.clone());
        Ok(())
    }

    async fn get_summaries(&self, session_id: &str) -> Result<Vec<Summary>> {
        let inner = self.lock()?;
        let mut summaries: Vec<Summary> = inner
            .summaries
            .iter()
            .filter(|s| s.session_id == session_id)
            .cloned()
            .collect();
        summaries.sort_by_key(|s| (s.position(), s.created_at));
        Ok(summaries)
    }

    async fn add_context(&self, item: &ContextItem) -> Result<()> {
        let mut inner = self.lock()?;

        if !inner.sessions.contains_key(&item.session_id) {
            return Err(StoreError::Constraint(format!(
                "context item references unknown session {}",
                item.session_id
            )));
        }

        inner.context.push(item.clone());
        Ok(())
    }

    async fn get_context(&self, session_id: &str) -> Result<Vec<ContextItem>> {
        let inner = self.lock()?;
        Ok(inner
            .context
            .iter()
            .filter(|c| c.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn delete_context(&self, session_id: &str) -> Result<usize> {
        let mut inner = self.lock()?;
        let before = inner.context.len();
        inner.context.retain(|c| c.session_id != session_id);
        Ok(before - inner.context.len())
    }

    /// Checks every ID before changing anything, then applies both writes
    /// under one lock.
    async fn apply_compaction(&self, summary: &Summary) -> Result<()> {
        let mut inner = self.lock()?;

        if summary.original_message_ids.is_empty() {
            return Err(StoreError::InvalidState(
                "summary covers no messages".to_string(),
            ));
        }
        if !inner.sessions.contains_key(&summary.session_id) {
            return Err(StoreError::Constraint(format!(
                "summary references unknown session {}",
                summary.session_id
            )));
        }

        let mut seen = Vec::with_capacity(summary.original_message_ids.len());
        for id in &summary.original_message_ids {
            let archivable = !seen.contains(id)
                && inner
                    .messages
                    .iter()
                    .any(|m| m.id == *id && m.session_id == summary.session_id && !m.archived);
            if !archivable {
                return Err(StoreError::InvalidState(format!(
                    "message {} cannot be archived for session {}",
                    id, summary.session_id
                )));
            }
            seen.push(*id);
        }

        for msg in inner
            .messages
            .iter_mut()
            .filter(|m| summary.original_message_ids.contains(&m.id))
        {
            msg.archived = true;
        }
        inner.summaries.push(summary.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatvault_core::session::context_type;

    #[tokio::test]
    async fn test_message_ids_are_monotonic_across_sessions() {
        let store = MemorySessionStore::new();
        let a = Session::new("a", "/proj", "m", "p");
        let b = Session::new("b", "/proj", "m", "p");
        store.create_session(&a).await.unwrap();
        store.create_session(&b).await.unwrap();

        let first = store.add_message(&Message::user(&a.id, "hi")).await.unwrap();
        let second = store.add_message(&Message::user(&b.id, "hi")).await.unwrap();
        let third = store.add_message(&Message::user(&a.id, "again")).await.unwrap();
        assert!(first < second && second < third);

        let msgs = store.get_messages(&a.id, 0).await.unwrap();
        assert_eq!(msgs.iter().map(|m| m.id).collect::<Vec<_>>(), vec![first, third]);
        assert_eq!(store.get_session(&a.id).await.unwrap().message_count, 2);
    }

    #[tokio::test]
    async fn test_message_for_unknown_session_is_rejected() {
        let store = MemorySessionStore::new();
        let result = store.add_message(&Message::user("ghost", "hi")).await;
        assert!(matches!(result, Err(StoreError::Constraint(_))));
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let store = MemorySessionStore::new();
        let session = Session::new("s", "/proj", "m", "p");
        store.create_session(&session).await.unwrap();

        for i in 0..3 {
            store
                .add_message(&Message::user(&session.id, format!("m{}", i)))
                .await
                .unwrap();
        }
        store
            .add_context(&ContextItem::new(&session.id, context_type::FILE, "a", "a"))
            .await
            .unwrap();
        store
            .add_context(&ContextItem::new(&session.id, context_type::FILE, "b", "b"))
            .await
            .unwrap();

        store.delete_session(&session.id).await.unwrap();

        assert_eq!(store.message_count(&session.id).await.unwrap(), 0);
        assert!(store.get_context(&session.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_apply_compaction_is_all_or_nothing() {
        let store = MemorySessionStore::new();
        let session = Session::new("s", "/proj", "m", "p");
        store.create_session(&session).await.unwrap();
        let mut ids = Vec::new();
        for i in 0..4 {
            ids.push(
                store
                    .add_message(&Message::user(&session.id, format!("m{}", i)))
                    .await
                    .unwrap(),
            );
        }

        let bad = Summary::new(&session.id, vec![ids[0], 999], "bad", 1);
        assert!(matches!(
            store.apply_compaction(&bad).await,
            Err(StoreError::InvalidState(_))
        ));
        assert_eq!(store.get_active_messages(&session.id).await.unwrap().len(), 4);
        assert!(store.get_summaries(&session.id).await.unwrap().is_empty());

        let good = Summary::new(&session.id, ids[..2].to_vec(), "good", 1);
        store.apply_compaction(&good).await.unwrap();
        assert_eq!(store.get_active_messages(&session.id).await.unwrap().len(), 2);
    }
}
