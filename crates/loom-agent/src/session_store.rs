//! Session persistence (SPEC_FULL.md §6): one index file mapping
//! `session_id -> {created_at, last_active}`, plus one append-only JSONL
//! file per session holding its message history. Lets a restarted process
//! resume a conversation instead of starting every session from empty
//! history — the same atomic temp+rename discipline the Registry and Trace
//! Sink use for their own durable state.

use dashmap::DashMap;
use loom_core::types::{Message, SessionKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionMeta {
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_active: chrono::DateTime<chrono::Utc>,
}

pub struct SessionStore {
    data_dir: PathBuf,
    index: Mutex<HashMap<String, SessionMeta>>,
    write_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SessionStore {
    pub async fn load(data_dir: impl Into<PathBuf>) -> loom_core::Result<Arc<Self>> {
        let data_dir = data_dir.into();
        tokio::fs::create_dir_all(data_dir.join("sessions")).await?;
        let index_path = data_dir.join("sessions_index.json");
        let index = match tokio::fs::read_to_string(&index_path).await {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => HashMap::new(),
        };
        Ok(Arc::new(Self {
            data_dir,
            index: Mutex::new(index),
            write_locks: DashMap::new(),
        }))
    }

    fn messages_path(&self, session_id: &str) -> PathBuf {
        self.data_dir.join("sessions").join(format!("{session_id}.jsonl"))
    }

    fn lock_for(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.write_locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn persist_index(&self, index: &HashMap<String, SessionMeta>) -> loom_core::Result<()> {
        let path = self.data_dir.join("sessions_index.json");
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(index)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Creates or refreshes a session's metadata entry.
    pub async fn touch(&self, session_id: &SessionKey) -> loom_core::Result<()> {
        let mut index = self.index.lock().await;
        let now = chrono::Utc::now();
        index
            .entry(session_id.as_str().to_string())
            .and_modify(|m| m.last_active = now)
            .or_insert_with(|| SessionMeta {
                created_at: now,
                last_active: now,
            });
        self.persist_index(&index).await
    }

    /// Appends one message to a session's durable history.
    pub async fn append_message(&self, session_id: &SessionKey, message: &Message) -> loom_core::Result<()> {
        let lock = self.lock_for(session_id.as_str());
        let _guard = lock.lock().await;
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.messages_path(session_id.as_str()))
            .await?;
        file.write_all(&line).await?;
        Ok(())
    }

    /// Loads a session's persisted history. Returns an empty vec for a
    /// session that has never been touched, and skips (rather than aborts
    /// on) any line that fails to parse.
    pub async fn load_history(&self, session_id: &SessionKey) -> Vec<Message> {
        let content = match tokio::fs::read_to_string(self.messages_path(session_id.as_str())).await {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };
        let mut history = Vec::new();
        for line in content.lines() {
            match serde_json::from_str(line) {
                Ok(message) => history.push(message),
                Err(e) => warn!(session = session_id.as_str(), error = %e, "skipping malformed persisted message"),
            }
        }
        history
    }

    /// Deletes a session's persisted message history (spec `session.clear`).
    pub async fn clear(&self, session_id: &SessionKey) -> loom_core::Result<()> {
        let lock = self.lock_for(session_id.as_str());
        let _guard = lock.lock().await;
        let path = self.messages_path(session_id.as_str());
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }

    pub async fn list(&self) -> Vec<String> {
        self.index.lock().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn touch_then_list_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::load(dir.path()).await.unwrap();
        store.touch(&SessionKey::new("s1")).await.unwrap();
        assert_eq!(store.list().await, vec!["s1".to_string()]);
    }

    #[tokio::test]
    async fn append_then_load_history_roundtrips_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::load(dir.path()).await.unwrap();
        let key = SessionKey::new("s1");
        store.append_message(&key, &Message::user("hi")).await.unwrap();
        store.append_message(&key, &Message::assistant("hello")).await.unwrap();
        let history = store.load_history(&key).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "hi");
        assert_eq!(history[1].content, "hello");
    }

    #[tokio::test]
    async fn clear_removes_persisted_history() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::load(dir.path()).await.unwrap();
        let key = SessionKey::new("s1");
        store.append_message(&key, &Message::user("hi")).await.unwrap();
        store.clear(&key).await.unwrap();
        assert!(store.load_history(&key).await.is_empty());
    }

    #[tokio::test]
    async fn untouched_session_has_empty_history() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::load(dir.path()).await.unwrap();
        assert!(store.load_history(&SessionKey::new("ghost")).await.is_empty());
    }
}
