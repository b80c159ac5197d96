//! History store collaborators: a JSON-file store per session for the
//! binary, and an in-memory store for dev and tests.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use relay_core::{HistoryStore, SessionKey, StoredMessage};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Default, Serialize, Deserialize)]
struct HistoryFile {
    messages: Vec<StoredMessage>,
    last_active: i64,
}

pub struct FileHistoryStore {
    data_dir: PathBuf,
    ttl: Duration,
    max_messages: usize,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl FileHistoryStore {
    pub fn new(data_dir: PathBuf, ttl: Duration, max_messages: usize) -> Self {
        Self {
            data_dir,
            ttl,
            max_messages: max_messages.max(1),
            locks: DashMap::new(),
        }
    }

    fn file_path(&self, key: &SessionKey) -> PathBuf {
        let safe: String = key
            .as_str()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.data_dir.join(format!("{safe}.json"))
    }

    fn lock_for(&self, key: &SessionKey) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.as_str().to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn read_live(&self, key: &SessionKey) -> Result<Option<HistoryFile>> {
        let path = self.file_path(key);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let file: HistoryFile = match serde_json::from_str(&contents) {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!(%e, path = %path.display(), "discarding unreadable history file");
                return Ok(None);
            }
        };
        let age = Utc::now().timestamp().saturating_sub(file.last_active);
        if age > self.ttl.as_secs() as i64 {
            let _ = tokio::fs::remove_file(&path).await;
            return Ok(None);
        }
        Ok(Some(file))
    }

    async fn write(&self, key: &SessionKey, file: &HistoryFile) -> Result<()> {
        tokio::fs::create_dir_all(&self.data_dir).await?;
        let path = self.file_path(key);
        let contents = serde_json::to_string(file)?;
        tokio::fs::write(&path, contents).await?;
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for FileHistoryStore {
    async fn get(&self, key: &SessionKey, limit: usize) -> Result<Vec<StoredMessage>> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;
        let Some(file) = self.read_live(key).await? else {
            return Ok(Vec::new());
        };
        let messages = file.messages;
        let start = messages.len().saturating_sub(limit);
        Ok(messages[start..].to_vec())
    }

    async fn append(
        &self,
        key: &SessionKey,
        role: &str,
        content: &str,
        sender_label: Option<&str>,
        origin_label: Option<&str>,
    ) -> Result<()> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;
        let mut file = self.read_live(key).await?.unwrap_or_default();
        file.messages.push(StoredMessage {
            role: role.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
            sender_label: sender_label.map(str::to_string),
            origin_label: origin_label.map(str::to_string),
        });
        if file.messages.len() > self.max_messages {
            let excess = file.messages.len() - self.max_messages;
            file.messages.drain(..excess);
        }
        file.last_active = Utc::now().timestamp();
        self.write(key, &file).await
    }

    async fn clear(&self, key: &SessionKey) -> Result<()> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;
        let path = self.file_path(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Default)]
pub struct MemoryHistoryStore {
    sessions: DashMap<String, Vec<StoredMessage>>,
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn get(&self, key: &SessionKey, limit: usize) -> Result<Vec<StoredMessage>> {
        let Some(messages) = self.sessions.get(key.as_str()) else {
            return Ok(Vec::new());
        };
        let start = messages.len().saturating_sub(limit);
        Ok(messages[start..].to_vec())
    }

    async fn append(
        &self,
        key: &SessionKey,
        role: &str,
        content: &str,
        sender_label: Option<&str>,
        origin_label: Option<&str>,
    ) -> Result<()> {
        self.sessions
            .entry(key.as_str().to_string())
            .or_default()
            .push(StoredMessage {
                role: role.to_string(),
                content: content.to_string(),
                timestamp: Utc::now(),
                sender_label: sender_label.map(str::to_string),
                origin_label: origin_label.map(str::to_string),
            });
        Ok(())
    }

    async fn clear(&self, key: &SessionKey) -> Result<()> {
        self.sessions.remove(key.as_str());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &std::path::Path, ttl: Duration) -> FileHistoryStore {
        FileHistoryStore::new(dir.to_path_buf(), ttl, 5)
    }

    #[tokio::test]
    async fn appends_and_reads_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path(), Duration::from_secs(3600));
        let key = SessionKey::new("conv-1");

        store
            .append(&key, "user", "hello", Some("Ada"), None)
            .await
            .expect("append user");
        store
            .append(&key, "assistant", "hi there", None, Some("sse"))
            .await
            .expect("append assistant");

        let messages = store.get(&key, 10).await.expect("get");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[0].content, "hello");
        assert_eq!(messages[0].sender_label.as_deref(), Some("Ada"));
        assert_eq!(messages[1].role, "assistant");
        assert_eq!(messages[1].origin_label.as_deref(), Some("sse"));
    }

    #[tokio::test]
    async fn get_returns_only_the_most_recent_messages() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path(), Duration::from_secs(3600));
        let key = SessionKey::new("conv-1");

        for i in 0..4 {
            store
                .append(&key, "user", &format!("m{i}"), None, None)
                .await
                .expect("append");
        }
        let messages = store.get(&key, 2).await.expect("get");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "m2");
        assert_eq!(messages[1].content, "m3");
    }

    #[tokio::test]
    async fn storage_cap_drops_oldest_messages() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path(), Duration::from_secs(3600));
        let key = SessionKey::new("conv-1");

        for i in 0..8 {
            store
                .append(&key, "user", &format!("m{i}"), None, None)
                .await
                .expect("append");
        }
        let messages = store.get(&key, 100).await.expect("get");
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[0].content, "m3");
    }

    #[tokio::test]
    async fn expired_history_reads_as_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path(), Duration::ZERO);
        let key = SessionKey::new("conv-1");

        store
            .append(&key, "user", "stale", None, None)
            .await
            .expect("append");
        tokio::time::sleep(Duration::from_millis(1100)).await;
        let messages = store.get(&key, 10).await.expect("get");
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn clear_removes_the_session() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path(), Duration::from_secs(3600));
        let key = SessionKey::new("conv-1");

        store
            .append(&key, "user", "hello", None, None)
            .await
            .expect("append");
        store.clear(&key).await.expect("clear");
        assert!(store.get(&key, 10).await.expect("get").is_empty());
        // Clearing an absent session is a no-op.
        store.clear(&key).await.expect("clear again");
    }
}
