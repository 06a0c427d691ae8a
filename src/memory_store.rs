use crate::session::{SessionExpiry, SessionId};
use crate::session_store::{SessionRecord, SessionStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// # in-memory session store
/// Because there is no external
/// persistence, this session store is ephemeral and will be cleared
/// on server restart.
///
/// Clones of a memory store share the same sessions.
///
/// # ***READ THIS BEFORE USING IN A PRODUCTION DEPLOYMENT***
///
/// Storing sessions only in memory brings the following problems:
///
/// 1. All sessions must fit in available memory (important for high load services)
/// 2. Expired sessions are removed only if [MemoryStore::cleanup] is called.
///    If sessions are not cleaned up properly it might result in OOM
/// 3. All sessions will be lost on shutdown
/// 4. If the service is clustered particular session will be stored only on a single instance.
///    This might be solved by using load balancers with sticky sessions.
///    Unfortunately, this solution brings additional complexity especially if the connection is
///    using secure transport since the load balancer has to perform SSL termination to understand
///    where should it forward packets to
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<MemoryStoreInner>>,
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    session_map: HashMap<SessionId, SessionRecord>,
    operations: Option<Vec<Operation>>,
}

/// An operation performed on a [`MemoryStore`], as recorded by [`MemoryStore::new_with_logger`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Operation {
    /// A session was read.
    Get {
        /// The id of the session.
        id: SessionId,
    },
    /// A session was written.
    Set {
        /// The id of the session.
        id: SessionId,
        /// The written record.
        record: SessionRecord,
    },
    /// A session was deleted.
    Destroy {
        /// The id of the session.
        id: SessionId,
    },
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get(&self, id: &SessionId) -> anyhow::Result<Option<SessionRecord>> {
        let mut inner = self.inner.write();
        inner.log(|| Operation::Get { id: id.clone() });
        Ok(inner.session_map.get(id).cloned())
    }

    async fn set(&self, id: &SessionId, record: &SessionRecord) -> anyhow::Result<()> {
        let mut inner = self.inner.write();
        inner.log(|| Operation::Set {
            id: id.clone(),
            record: record.clone(),
        });
        inner.session_map.insert(id.clone(), record.clone());
        Ok(())
    }

    async fn destroy(&self, id: &SessionId) -> anyhow::Result<()> {
        let mut inner = self.inner.write();
        inner.log(|| Operation::Destroy { id: id.clone() });
        inner.session_map.remove(id);
        Ok(())
    }
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Default::default()
    }

    /// Create a new empty memory store that records every operation performed on it.
    /// The recorded operations are returned by [`MemoryStore::operations`].
    pub fn new_with_logger() -> Self {
        let store = Self::new();
        store.inner.write().operations = Some(Vec::new());
        store
    }

    /// Returns the operations recorded so far.
    /// Returns an empty list if this store was not created with [`MemoryStore::new_with_logger`].
    pub fn operations(&self) -> Vec<Operation> {
        self.inner.read().operations.clone().unwrap_or_default()
    }

    /// Returns the record of the session with the given id, without recording an operation.
    pub fn peek(&self, id: &SessionId) -> Option<SessionRecord> {
        self.inner.read().session_map.get(id).cloned()
    }

    /// Returns the number of sessions in the memory store.
    pub fn len(&self) -> usize {
        self.inner.read().session_map.len()
    }

    /// Returns true if the memory store is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.read().session_map.is_empty()
    }

    /// Deletes all sessions.
    pub fn clear(&self) {
        self.inner.write().session_map.clear();
    }

    /// Performs session cleanup, deleting all sessions that expired before `now`.
    /// This should be run on an intermittent basis if this store is run for long enough that
    /// memory accumulation is a concern.
    pub fn cleanup(&self, now: DateTime<Utc>) {
        log::trace!("Cleaning up memory store...");
        let mut inner = self.inner.write();
        let initial_len = inner.session_map.len();
        inner.session_map.retain(|_, record| match record.expiry {
            SessionExpiry::DateTime(expiry) => expiry >= now,
            SessionExpiry::Never => true,
        });
        log::trace!(
            "Deleted {} expired sessions",
            initial_len - inner.session_map.len()
        );
    }
}

impl MemoryStoreInner {
    fn log(&mut self, operation: impl FnOnce() -> Operation) {
        if let Some(operations) = &mut self.operations {
            operations.push(operation());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SessionData;
    use chrono::Duration;

    fn record(expiry: SessionExpiry) -> SessionRecord {
        SessionRecord {
            data: SessionData::new(),
            expiry,
        }
    }

    #[async_std::test]
    async fn crud() {
        let store = MemoryStore::new();
        let id = SessionId::from("a".to_string());
        assert_eq!(store.get(&id).await.unwrap(), None);

        store.set(&id, &record(SessionExpiry::Never)).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.get(&id).await.unwrap(),
            Some(record(SessionExpiry::Never))
        );

        store.destroy(&id).await.unwrap();
        store.destroy(&id).await.unwrap();
        assert!(store.is_empty());
        assert!(store.operations().is_empty());
    }

    #[async_std::test]
    async fn clones_share_sessions() {
        let store = MemoryStore::new();
        let clone = store.clone();
        let id = SessionId::from("a".to_string());
        clone.set(&id, &record(SessionExpiry::Never)).await.unwrap();
        assert_eq!(store.peek(&id), Some(record(SessionExpiry::Never)));
        store.clear();
        assert!(clone.is_empty());
    }

    #[async_std::test]
    async fn logger_records_operations() {
        let store = MemoryStore::new_with_logger();
        let id = SessionId::from("a".to_string());
        store.get(&id).await.unwrap();
        store.set(&id, &record(SessionExpiry::Never)).await.unwrap();
        store.destroy(&id).await.unwrap();
        assert_eq!(
            store.operations(),
            [
                Operation::Get { id: id.clone() },
                Operation::Set {
                    id: id.clone(),
                    record: record(SessionExpiry::Never),
                },
                Operation::Destroy { id },
            ]
        );
    }

    #[async_std::test]
    async fn cleanup_removes_expired_sessions() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let expired = SessionId::from("expired".to_string());
        let alive = SessionId::from("alive".to_string());
        let eternal = SessionId::from("eternal".to_string());
        store
            .set(&expired, &record(SessionExpiry::DateTime(now - Duration::seconds(1))))
            .await
            .unwrap();
        store
            .set(&alive, &record(SessionExpiry::DateTime(now + Duration::seconds(1))))
            .await
            .unwrap();
        store
            .set(&eternal, &record(SessionExpiry::Never))
            .await
            .unwrap();

        store.cleanup(now);
        assert_eq!(store.len(), 2);
        assert_eq!(store.peek(&expired), None);
    }
}
