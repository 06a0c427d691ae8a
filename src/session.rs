use crate::{Error, Result, SessionConfig, TokenError};
use chrono::{DateTime, Duration, Utc};
use rand::distributions::{Alphanumeric, DistString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{Display, Formatter};

/// The data associated with a session: a JSON object.
pub type SessionData = serde_json::Map<String, Value>;

/// The default length of a session id, in characters.
pub const DEFAULT_SESSION_ID_LENGTH: usize = 32;

/// A session with a client.
///
/// This type tracks every change made while handling a request, so that the
/// [`SessionManager`](crate::SessionManager) can decide whether the client needs a new cookie.
/// It is marked `#[must_use]`, as dropping it will neither update the client nor the session store.
/// Instead, it should be passed to [`SessionManager::save_session`](crate::SessionManager::save_session).
#[derive(Debug, Clone)]
#[must_use]
pub struct Session {
    id: SessionId,
    data: SessionData,
    expiry: SessionExpiry,
    ttl: Option<Duration>,
    pub(crate) state: SessionState,
    pub(crate) changes: Changes,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) enum SessionState {
    /// The session was created for this request.
    New,
    /// The session was loaded from a valid, unexpired cookie.
    /// `persisted_id` is the id under which the client and the store currently know this session.
    Loaded { persisted_id: SessionId },
    /// The session was marked for deletion.
    /// `persisted_id` is set if the session was known to the client or the store before.
    Destroyed { persisted_id: Option<SessionId> },
}

/// Reasons why a session has to be communicated to the client again.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub(crate) struct Changes {
    pub(crate) data: bool,
    pub(crate) touched: bool,
    pub(crate) regenerated: bool,
    pub(crate) rotated: bool,
}

/// The expiry of a session.
/// Either a given date and time, or never.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum SessionExpiry {
    /// The session expires at the given date and time.
    DateTime(DateTime<Utc>),
    /// The session never expires, unless it is explicitly destroyed.
    Never,
}

/// A session id.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

/// The content of a stateless session cookie.
#[derive(Serialize, Deserialize)]
struct CookiePayload {
    id: SessionId,
    data: SessionData,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    expiry: Option<DateTime<Utc>>,
}

impl Session {
    /// Create a new session with empty data.
    ///
    /// `ttl` is the length of the expiry window: the session expires `ttl` after `now`,
    /// and every [`touch`](Session::touch) moves the expiry to `ttl` after the time of the touch.
    /// Without a `ttl`, the session never expires.
    ///
    /// # Example
    ///
    /// ```rust
    /// # use keyed_session::{Session, SessionExpiry, SessionId};
    /// let session = Session::new(SessionId::random(), None, chrono::Utc::now());
    /// assert_eq!(&SessionExpiry::Never, session.expiry());
    /// assert!(session.is_new());
    /// assert!(session.data().is_empty());
    /// ```
    pub fn new(id: SessionId, ttl: Option<Duration>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            data: SessionData::new(),
            expiry: expiry_after(now, ttl),
            ttl,
            state: SessionState::New,
            changes: Changes::default(),
        }
    }

    /// **This method should only be called by a session store or the session manager!**
    ///
    /// Create a session instance from parts that were read from a cookie or a session store.
    /// The session counts as loaded and unchanged.
    pub fn new_loaded(
        id: SessionId,
        data: SessionData,
        expiry: SessionExpiry,
        ttl: Option<Duration>,
    ) -> Self {
        Self {
            id: id.clone(),
            data,
            expiry,
            ttl,
            state: SessionState::Loaded { persisted_id: id },
            changes: Changes::default(),
        }
    }

    /// Decode a stateless session cookie, reporting why it was rejected.
    ///
    /// The cookie is unsealed with the key ring and protection of `config`.
    /// If it was sealed with a retired key, the returned session is flagged as rotated
    /// and will be sent to the client again, sealed with the active key.
    pub fn decode(
        token: &str,
        config: &SessionConfig,
        now: DateTime<Utc>,
    ) -> Result<Self, TokenError> {
        let unsealed = config.protection().unseal(token, config.key_ring())?;
        let payload: CookiePayload =
            serde_json::from_slice(&unsealed.payload).map_err(|_| TokenError::InvalidPayload)?;

        let expiry = payload
            .expiry
            .map_or(SessionExpiry::Never, SessionExpiry::DateTime);
        let mut session = Self::new_loaded(payload.id, payload.data, expiry, config.expiry());
        if session.is_expired(now) {
            return Err(TokenError::Expired);
        }
        session.changes.rotated = unsealed.rotated;
        Ok(session)
    }

    /// Decode a stateless session cookie.
    ///
    /// Returns `None` if the cookie is malformed, not authentic, or carries an expired session.
    /// In that case, the caller should create a fresh session.
    pub fn from_cookie(token: &str, config: &SessionConfig, now: DateTime<Utc>) -> Option<Self> {
        match Self::decode(token, config, now) {
            Ok(session) => Some(session),
            Err(error) => {
                log::debug!("Rejected session cookie: {error}");
                None
            }
        }
    }

    /// Encode this session into a stateless cookie value carrying its id, data and expiry.
    ///
    /// The value is encrypted or signed with the active key, depending on `config`.
    /// A destroyed session encodes to an empty value.
    pub fn to_cookie(&self, config: &SessionConfig) -> Result<String> {
        if self.is_destroyed() {
            return Ok(String::new());
        }

        let payload = serde_json::to_vec(&CookiePayload {
            id: self.id.clone(),
            data: self.data.clone(),
            expiry: match self.expiry {
                SessionExpiry::DateTime(expiry) => Some(expiry),
                SessionExpiry::Never => None,
            },
        })?;
        config.protection().seal(&payload, config.key_ring())
    }

    /// Encode only the id of this session into a cookie value, for use with a session store.
    /// A destroyed session encodes to an empty value.
    pub fn to_id_cookie(&self, config: &SessionConfig) -> Result<String> {
        if self.is_destroyed() {
            return Ok(String::new());
        }

        config
            .protection()
            .seal(self.id.as_str().as_bytes(), config.key_ring())
    }

    /// Returns the id of this session.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the data associated with this session.
    /// This does not mark the session as changed.
    pub fn data(&self) -> &SessionData {
        &self.data
    }

    /// Returns the value stored under `key`, if any.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Returns the value stored under `key`, deserialized into `T`.
    /// Returns `None` if there is no such value or if it does not deserialize into `T`.
    ///
    /// # Example
    ///
    /// ```rust
    /// # use keyed_session::{Session, SessionId};
    /// # fn main() -> keyed_session::Result {
    /// let mut session = Session::new(SessionId::random(), None, chrono::Utc::now());
    /// session.set("visits", 3)?;
    /// assert_eq!(session.get_as::<u32>("visits"), Some(3));
    /// assert_eq!(session.get_as::<String>("visits"), None);
    /// # Ok(()) }
    /// ```
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.data
            .get(key)
            .and_then(|value| T::deserialize(value).ok())
    }

    /// Stores `value` under `key`, and marks the session as changed.
    ///
    /// Fails if `value` cannot be represented as JSON, e.g. a map with non-string keys.
    /// Changes to a destroyed session are ignored.
    pub fn set(&mut self, key: impl Into<String>, value: impl Serialize) -> Result {
        let value = serde_json::to_value(value).map_err(Error::Serialization)?;
        if self.ignore_destroyed("set") {
            return Ok(());
        }

        self.data.insert(key.into(), value);
        self.changes.data = true;
        Ok(())
    }

    /// Removes the value stored under `key` and returns it.
    /// The session is marked as changed only if there was such a value.
    pub fn delete(&mut self, key: &str) -> Option<Value> {
        if self.ignore_destroyed("delete") {
            return None;
        }

        let removed = self.data.remove(key);
        if removed.is_some() {
            self.changes.data = true;
        }
        removed
    }

    /// Removes all values. The session is marked as changed only if it had any values.
    pub fn clear(&mut self) {
        if self.ignore_destroyed("clear") || self.data.is_empty() {
            return;
        }

        self.data.clear();
        self.changes.data = true;
    }

    /// Extends the expiry of this session to its expiry window after `now`,
    /// and forces the cookie to be sent again.
    /// This does not mark the data as changed.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if self.ignore_destroyed("touch") {
            return;
        }

        self.expiry = expiry_after(now, self.ttl);
        self.changes.touched = true;
    }

    /// Returns the expiry of this session.
    pub fn expiry(&self) -> &SessionExpiry {
        &self.expiry
    }

    /// Sets the expiry of this session, and forces the cookie to be sent again.
    pub fn set_expiry(&mut self, expiry: DateTime<Utc>) {
        if self.ignore_destroyed("set the expiry of") {
            return;
        }

        self.expiry = SessionExpiry::DateTime(expiry);
        self.changes.touched = true;
    }

    /// Sets this session to never expire, and forces the cookie to be sent again.
    pub fn do_not_expire(&mut self) {
        if self.ignore_destroyed("change the expiry of") {
            return;
        }

        self.expiry = SessionExpiry::Never;
        self.changes.touched = true;
    }

    /// Return true if the session is expired.
    /// The session is expired if it has an expiry timestamp that lies before `now`.
    ///
    /// # Example
    ///
    /// ```rust
    /// # use keyed_session::{Session, SessionId};
    /// # use chrono::{Duration, Utc};
    /// let now = Utc::now();
    /// let session = Session::new(SessionId::random(), Some(Duration::seconds(10)), now);
    /// assert!(!session.is_expired(now));
    /// assert!(!session.is_expired(now + Duration::seconds(10)));
    /// assert!(session.is_expired(now + Duration::seconds(11)));
    /// ```
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expiry {
            SessionExpiry::DateTime(expiry) => expiry < now,
            SessionExpiry::Never => false,
        }
    }

    /// Returns the duration from `now` to the expiry time of this session.
    /// Returns `None` if it is expired or never expires.
    pub fn expires_in(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        self.expiry.expires_in(now)
    }

    /// Assigns a new random id to this session and forces the cookie to be sent again.
    /// The data is kept.
    ///
    /// Call this whenever the privilege level of the session changes, e.g. on login,
    /// so that an id planted by an attacker becomes useless.
    /// [`SessionManager::regenerate_session`](crate::SessionManager::regenerate_session)
    /// does the same with the id generator of the manager.
    pub fn regenerate(&mut self) {
        self.regenerate_with(SessionId::random());
    }

    /// Assigns the given id to this session and forces the cookie to be sent again.
    pub fn regenerate_with(&mut self, id: SessionId) {
        if self.ignore_destroyed("regenerate") {
            return;
        }

        self.id = id;
        self.changes.regenerated = true;
    }

    /// Marks this session for destruction.
    /// The client is told to drop its cookie, and the session is removed from the session store.
    /// Further changes to this session are ignored.
    ///
    /// # Example
    ///
    /// ```rust
    /// # use keyed_session::{Session, SessionId};
    /// # fn main() -> keyed_session::Result {
    /// let mut session = Session::new(SessionId::random(), None, chrono::Utc::now());
    /// session.destroy();
    /// assert!(session.is_destroyed());
    /// session.set("user", "alice")?;
    /// assert!(session.get("user").is_none());
    /// # Ok(()) }
    /// ```
    pub fn destroy(&mut self) {
        let persisted_id = match &self.state {
            SessionState::New => None,
            SessionState::Loaded { persisted_id } => Some(persisted_id.clone()),
            SessionState::Destroyed { .. } => return,
        };
        self.state = SessionState::Destroyed { persisted_id };
        self.changes = Changes::default();
    }

    /// Returns true if this session was created for the current request.
    pub fn is_new(&self) -> bool {
        self.state == SessionState::New
    }

    /// Returns true if this session is marked for destruction.
    pub fn is_destroyed(&self) -> bool {
        matches!(self.state, SessionState::Destroyed { .. })
    }

    /// Returns true if the data of this session was changed.
    pub fn is_changed(&self) -> bool {
        self.changes.data
    }

    /// Returns true if this session was touched or its expiry was changed.
    pub fn is_touched(&self) -> bool {
        self.changes.touched
    }

    /// Returns true if this session was assigned a new id.
    pub fn is_regenerated(&self) -> bool {
        self.changes.regenerated
    }

    /// Returns true if this session was loaded from a cookie sealed with a retired key.
    pub fn is_rotated(&self) -> bool {
        self.changes.rotated
    }

    pub(crate) fn mark_rotated(&mut self) {
        self.changes.rotated = true;
    }

    /// Returns the id under which the client and the store knew this session before this request.
    pub(crate) fn persisted_id(&self) -> Option<&SessionId> {
        match &self.state {
            SessionState::New => None,
            SessionState::Loaded { persisted_id } => Some(persisted_id),
            SessionState::Destroyed { persisted_id } => persisted_id.as_ref(),
        }
    }

    fn ignore_destroyed(&self, action: &str) -> bool {
        let destroyed = self.is_destroyed();
        if destroyed {
            log::warn!("Attempted to {action} a destroyed session, ignoring");
        }
        destroyed
    }
}

impl SessionExpiry {
    /// Returns the duration from `now` to this expiry.
    /// Returns `None` if it lies in the past or if there is no expiry.
    pub fn expires_in(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        match self {
            SessionExpiry::DateTime(date_time) => {
                let duration = date_time.signed_duration_since(now);
                if duration > Duration::zero() {
                    duration.to_std().ok()
                } else {
                    None
                }
            }
            SessionExpiry::Never => None,
        }
    }
}

fn expiry_after(now: DateTime<Utc>, ttl: Option<Duration>) -> SessionExpiry {
    match ttl.and_then(|ttl| now.checked_add_signed(ttl)) {
        Some(expiry) => SessionExpiry::DateTime(expiry),
        None => SessionExpiry::Never,
    }
}

impl SessionId {
    /// Generate a random alphanumeric id of [`DEFAULT_SESSION_ID_LENGTH`] characters
    /// using the thread-local cryptographically secure random generator.
    pub fn random() -> Self {
        Self(Alphanumeric.sample_string(&mut rand::thread_rng(), DEFAULT_SESSION_ID_LENGTH))
    }

    /// Returns the id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KeyRing;
    use serde_json::json;

    fn config() -> SessionConfig {
        SessionConfig::builder(KeyRing::from_secrets([[1; 32]]).unwrap())
            .build()
            .unwrap()
    }

    fn session(now: DateTime<Utc>) -> Session {
        Session::new(SessionId::random(), Some(Duration::hours(1)), now)
    }

    #[test]
    fn new_session_is_unchanged() {
        let now = Utc::now();
        let session = session(now);
        assert!(session.is_new());
        assert!(!session.is_changed());
        assert!(!session.is_touched());
        assert_eq!(
            session.expiry(),
            &SessionExpiry::DateTime(now + Duration::hours(1))
        );
    }

    #[test]
    fn set_and_delete_mark_data_changed() {
        let mut session = session(Utc::now());
        assert_eq!(session.delete("missing"), None);
        assert!(!session.is_changed());

        session.set("user", json!({"name": "alice", "roles": ["admin"]})).unwrap();
        assert!(session.is_changed());
        assert_eq!(session.get("user").unwrap()["roles"][0], "admin");

        let mut loaded = Session::new_loaded(
            session.id().clone(),
            session.data().clone(),
            *session.expiry(),
            None,
        );
        assert!(!loaded.is_changed());
        assert!(loaded.delete("user").is_some());
        assert!(loaded.is_changed());
    }

    #[test]
    fn clear_marks_changed_only_when_not_empty() {
        let mut session = session(Utc::now());
        session.clear();
        assert!(!session.is_changed());
        session.set("a", 1).unwrap();
        session.clear();
        assert!(session.data().is_empty());
        assert!(session.is_changed());
    }

    #[test]
    fn touch_extends_expiry_without_changing_data() {
        let now = Utc::now();
        let mut session = session(now);
        session.touch(now + Duration::minutes(5));
        session.touch(now + Duration::minutes(10));
        assert!(session.is_touched());
        assert!(!session.is_changed());
        assert_eq!(
            session.expiry(),
            &SessionExpiry::DateTime(now + Duration::minutes(70))
        );
    }

    #[test]
    fn regenerate_keeps_data_and_remembers_persisted_id() {
        let mut session = Session::new_loaded(
            SessionId::from("old".to_string()),
            SessionData::new(),
            SessionExpiry::Never,
            None,
        );
        session.set("a", 1).unwrap();
        session.regenerate();
        assert!(session.is_regenerated());
        assert_ne!(session.id().as_str(), "old");
        assert_eq!(session.id().as_str().len(), DEFAULT_SESSION_ID_LENGTH);
        assert_eq!(session.persisted_id().unwrap().as_str(), "old");
        assert_eq!(session.get_as::<i32>("a"), Some(1));
    }

    #[test]
    fn destroyed_session_ignores_changes() {
        let mut session = session(Utc::now());
        session.set("a", 1).unwrap();
        session.destroy();
        assert!(session.is_destroyed());
        assert!(!session.is_changed());

        session.set("b", 2).unwrap();
        session.touch(Utc::now());
        session.regenerate();
        assert!(session.get("b").is_none());
        assert!(!session.is_touched());
        assert!(!session.is_regenerated());
        assert_eq!(session.to_cookie(&config()).unwrap(), "");
    }

    #[test]
    fn cookie_round_trip_preserves_types() {
        let config = config();
        let now = Utc::now();
        let mut session = session(now);
        let value = json!({
            "string": "text",
            "integer": 42,
            "float": 1.5,
            "bool": true,
            "null": null,
            "array": [1, "two", [3]],
            "nested": {"deeper": {"deepest": false}},
        });
        session.set("value", value.clone()).unwrap();

        let cookie = session.to_cookie(&config).unwrap();
        let loaded = Session::from_cookie(&cookie, &config, now).unwrap();
        assert_eq!(loaded.id(), session.id());
        assert_eq!(loaded.get("value"), Some(&value));
        assert_eq!(
            loaded.expiry(),
            &SessionExpiry::DateTime(
                DateTime::from_timestamp_millis((now + Duration::hours(1)).timestamp_millis())
                    .unwrap()
            )
        );
        assert!(!loaded.is_new());
        assert!(!loaded.is_changed());
        assert!(!loaded.is_rotated());
    }

    #[test]
    fn expired_cookie_is_rejected() {
        let config = config();
        let now = Utc::now();
        let session = session(now - Duration::hours(2));
        let cookie = session.to_cookie(&config).unwrap();
        assert_eq!(
            Session::decode(&cookie, &config, now).unwrap_err(),
            TokenError::Expired
        );
        assert!(Session::from_cookie(&cookie, &config, now).is_none());
    }

    #[test]
    fn authentic_non_session_payload_is_rejected() {
        let config = config();
        let token = crate::codec::encrypt(b"[1,2,3]", config.key_ring().active()).unwrap();
        assert_eq!(
            Session::decode(&token, &config, Utc::now()).unwrap_err(),
            TokenError::InvalidPayload
        );
    }

    #[test]
    fn never_expiring_session_round_trips() {
        let config = config();
        let session = Session::new(SessionId::random(), None, Utc::now());
        let cookie = session.to_cookie(&config).unwrap();
        let loaded = Session::from_cookie(&cookie, &config, Utc::now()).unwrap();
        assert_eq!(loaded.expiry(), &SessionExpiry::Never);
    }

    #[test]
    fn expires_in_is_none_when_expired() {
        let now = Utc::now();
        let session = session(now);
        let remaining = session.expires_in(now).unwrap();
        assert_eq!(remaining.as_secs(), 3600);
        assert_eq!(session.expires_in(now + Duration::hours(2)), None);
    }
}
