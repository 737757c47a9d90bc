//! Session records and per-execution-key serialisation.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use gateway_primitives::ExecutionKey;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

/// What the gateway remembers about one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRecord {
    execution_key: ExecutionKey,
    backend_session_id: Option<String>,
    last_used_at: DateTime<Utc>,
}

impl SessionRecord {
    fn new(execution_key: ExecutionKey) -> Self {
        Self {
            execution_key,
            backend_session_id: None,
            last_used_at: Utc::now(),
        }
    }

    /// Returns the conversation key.
    #[must_use]
    pub const fn execution_key(&self) -> &ExecutionKey {
        &self.execution_key
    }

    /// Returns the backend session to resume, once known.
    #[must_use]
    pub fn backend_session_id(&self) -> Option<&str> {
        self.backend_session_id.as_deref()
    }

    /// Returns when the conversation last ran.
    #[must_use]
    pub const fn last_used_at(&self) -> DateTime<Utc> {
        self.last_used_at
    }
}

type KeyLocks = Arc<Mutex<HashMap<ExecutionKey, Arc<AsyncMutex<()>>>>>;

/// Exclusive hold on one execution key. Released on drop.
#[derive(Debug)]
pub struct ExecutionLock {
    key: ExecutionKey,
    locks: KeyLocks,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ExecutionLock {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();
        // Map entry plus the guard's own handle: nobody else holds or waits.
        let idle = locks
            .get(&self.key)
            .is_some_and(|mutex| Arc::strong_count(mutex) <= 2);
        self.guard.take();
        if idle {
            locks.remove(&self.key);
        }
    }
}

/// Session records plus the locks that serialise calls sharing a key.
#[derive(Debug, Default)]
pub struct SessionStore {
    records: Mutex<HashMap<ExecutionKey, SessionRecord>>,
    locks: KeyLocks,
}

impl SessionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until no other call holds `key`, then holds it.
    pub async fn lock(&self, key: &ExecutionKey) -> ExecutionLock {
        let mutex = {
            let mut locks = self.locks.lock();
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        let guard = mutex.lock_owned().await;
        ExecutionLock {
            key: key.clone(),
            locks: Arc::clone(&self.locks),
            guard: Some(guard),
        }
    }

    /// Returns the backend session id to resume for `key`.
    #[must_use]
    pub fn resume_id(&self, key: &ExecutionKey) -> Option<String> {
        self.records
            .lock()
            .get(key)
            .and_then(|record| record.backend_session_id.clone())
    }

    /// Stamps `last_used_at` on an existing record.
    pub fn touch(&self, key: &ExecutionKey) {
        if let Some(record) = self.records.lock().get_mut(key) {
            record.last_used_at = Utc::now();
        }
    }

    /// Records the backend session id announced for `key`.
    pub fn record_session_id(&self, key: &ExecutionKey, session_id: &str) {
        let mut records = self.records.lock();
        let record = records
            .entry(key.clone())
            .or_insert_with(|| SessionRecord::new(key.clone()));
        if record.backend_session_id.as_deref() != Some(session_id) {
            debug!(execution_key = %key, session_id, "backend session recorded");
            record.backend_session_id = Some(session_id.to_owned());
        }
        record.last_used_at = Utc::now();
    }

    /// Ensures a record exists after a successful execution.
    pub fn record_success(&self, key: &ExecutionKey) {
        let mut records = self.records.lock();
        records
            .entry(key.clone())
            .or_insert_with(|| SessionRecord::new(key.clone()))
            .last_used_at = Utc::now();
    }

    /// Returns a copy of the record for `key`.
    #[must_use]
    pub fn get(&self, key: &ExecutionKey) -> Option<SessionRecord> {
        self.records.lock().get(key).cloned()
    }

    /// Removes the record for `key`.
    pub fn remove(&self, key: &ExecutionKey) -> Option<SessionRecord> {
        self.records.lock().remove(key)
    }

    /// Returns the number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Returns `true` when no record exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every record.
    pub fn clear(&self) {
        self.records.lock().clear();
    }

    #[cfg(test)]
    fn lock_entries(&self) -> usize {
        self.locks.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn key(raw: &str) -> ExecutionKey {
        ExecutionKey::new(raw).unwrap()
    }

    #[test]
    fn records_track_session_ids() {
        let store = SessionStore::new();
        let chat = key("chat-1");
        assert!(store.resume_id(&chat).is_none());

        store.record_session_id(&chat, "sess-1");
        assert_eq!(store.resume_id(&chat).as_deref(), Some("sess-1"));

        let before = store.get(&chat).unwrap().last_used_at();
        store.touch(&chat);
        assert!(store.get(&chat).unwrap().last_used_at() >= before);

        assert!(store.remove(&chat).is_some());
        assert!(store.is_empty());
    }

    #[test]
    fn success_without_session_id_creates_record() {
        let store = SessionStore::new();
        store.record_success(&key("chat-2"));
        assert_eq!(store.get(&key("chat-2")).unwrap().backend_session_id(), None);
    }

    #[tokio::test]
    async fn same_key_is_serialised() {
        let store = Arc::new(SessionStore::new());
        let chat = key("chat-3");
        let held = store.lock(&chat).await;

        let contender = {
            let store = Arc::clone(&store);
            let chat = chat.clone();
            tokio::spawn(async move {
                let _lock = store.lock(&chat).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(held);
        contender.await.unwrap();
        assert_eq!(store.lock_entries(), 0);
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let store = SessionStore::new();
        let _a = store.lock(&key("a")).await;
        let _b = tokio::time::timeout(Duration::from_millis(50), store.lock(&key("b")))
            .await
            .expect("independent key should lock immediately");
        assert_eq!(store.lock_entries(), 2);
    }
}
