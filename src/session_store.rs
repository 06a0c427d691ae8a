use crate::session::{SessionData, SessionExpiry, SessionId};
use async_trait::async_trait;
use std::fmt::Debug;

/// The backend-facing interface for server-side session persistence.
///
/// When a session store is configured, the session cookie carries only the sealed session id,
/// and the data lives in the store.
/// The session id is expected to be the primary key, uniquely identifying a session.
///
/// All methods may suspend, e.g. while talking to a database.
/// Concurrent requests for the same session are not serialized: the last write wins.
/// Errors are reported with [`anyhow::Error`] and surface as
/// [`Error::StoreUnavailable`](crate::Error::StoreUnavailable).
#[async_trait]
pub trait SessionStore: Debug + Send + Sync {
    /// Read the session with the given `id`.
    /// Returns `Ok(None)` if there is no such session.
    async fn get(&self, id: &SessionId) -> anyhow::Result<Option<SessionRecord>>;

    /// Create or replace the session with the given `id`.
    /// The store may use the expiry of the record to drop it once it has expired.
    async fn set(&self, id: &SessionId, record: &SessionRecord) -> anyhow::Result<()>;

    /// Delete the session with the given `id`. Deleting a missing session is not an error.
    async fn destroy(&self, id: &SessionId) -> anyhow::Result<()>;
}

/// A session as written to and read from a [`SessionStore`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SessionRecord {
    /// The data of the session.
    pub data: SessionData,
    /// The expiry of the session.
    pub expiry: SessionExpiry,
}

/// Indicates how the client's session cookie should be updated after handling a request.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SessionCookieCommand {
    /// Set the session cookie.
    Set {
        /// The value of the session cookie.
        cookie_value: String,
        /// The expiry of the session, from which the transport layer derives the cookie's `Max-Age`.
        expiry: SessionExpiry,
    },
    /// Delete the session cookie.
    Delete,
    /// Leave the session cookie as it is.
    DoNothing,
}
