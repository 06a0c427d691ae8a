use crate::id_generator::{DefaultSessionIdGenerator, SessionIdGenerator};
use crate::session::{SessionExpiry, SessionId, SessionState};
use crate::session_store::{SessionCookieCommand, SessionRecord, SessionStore};
use crate::{Error, Result, Session, SessionConfig};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Per-request session orchestration.
///
/// On request start, [`load_session`](SessionManager::load_session) turns the inbound cookie value
/// into a [`Session`], falling back to a fresh session whenever the cookie is missing, invalid or expired.
/// On request end, [`save_session`](SessionManager::save_session) decides whether the client needs
/// a new cookie and updates the session store, if there is one.
///
/// Without a session store, the whole session travels inside the cookie.
/// With a session store, the cookie carries only the sealed session id.
///
/// A session manager is meant to be shared by all concurrently handled requests.
#[derive(Debug)]
pub struct SessionManager {
    config: SessionConfig,
    store: Option<Arc<dyn SessionStore>>,
    id_generator: Box<dyn SessionIdGenerator>,
}

impl SessionManager {
    /// Create a session manager that keeps sessions in cookies only.
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            store: None,
            id_generator: Box::<DefaultSessionIdGenerator>::default(),
        }
    }

    /// Persist session data in the given store, and let cookies carry only the session id.
    #[must_use]
    pub fn with_store(mut self, store: impl SessionStore + 'static) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    /// Generate ids of new sessions with the given generator.
    #[must_use]
    pub fn with_id_generator(mut self, id_generator: impl SessionIdGenerator + 'static) -> Self {
        self.id_generator = Box::new(id_generator);
        self
    }

    /// Returns the configuration of this session manager.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Create a fresh session expiring one expiry window after `now`.
    pub fn create_session(&self, now: DateTime<Utc>) -> Session {
        Session::new(self.id_generator.generate_id(), self.config.expiry(), now)
    }

    /// Assign a new id from this manager's id generator to the session.
    /// The data is kept, and the next save sends a new cookie.
    ///
    /// Call this whenever the privilege level of the session changes, e.g. on login.
    pub fn regenerate_session(&self, session: &mut Session) {
        session.regenerate_with(self.id_generator.generate_id());
    }

    /// Load the session identified by the given cookie value, or create a fresh one.
    ///
    /// A missing, malformed, unauthentic or expired cookie results in a fresh session, never in an error.
    /// The only error is [`Error::StoreUnavailable`], if the session store cannot be read.
    ///
    /// If the manager is configured as rolling, a loaded session is touched.
    pub async fn load_session(
        &self,
        cookie_value: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Session> {
        let loaded = match cookie_value {
            Some(cookie_value) if !cookie_value.is_empty() => match &self.store {
                None => Session::from_cookie(cookie_value, &self.config, now),
                Some(store) => self.load_from_store(store.as_ref(), cookie_value, now).await?,
            },
            _ => None,
        };

        Ok(match loaded {
            Some(mut session) => {
                if self.config.rolling() {
                    session.touch(now);
                }
                session
            }
            None => self.create_session(now),
        })
    }

    async fn load_from_store(
        &self,
        store: &dyn SessionStore,
        cookie_value: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>> {
        let unsealed = match self
            .config
            .protection()
            .unseal(cookie_value, self.config.key_ring())
        {
            Ok(unsealed) => unsealed,
            Err(error) => {
                log::debug!("Rejected session cookie: {error}");
                return Ok(None);
            }
        };
        let Ok(id) = String::from_utf8(unsealed.payload).map(SessionId::from) else {
            log::debug!("Rejected session cookie: the session id is not valid UTF-8");
            return Ok(None);
        };

        let Some(record) = store.get(&id).await.map_err(Error::StoreUnavailable)? else {
            log::debug!("Session cookie refers to an unknown session");
            return Ok(None);
        };

        let mut session = Session::new_loaded(id, record.data, record.expiry, self.config.expiry());
        if session.is_expired(now) {
            log::debug!("Session cookie refers to an expired session");
            return Ok(None);
        }
        if unsealed.rotated {
            session.mark_rotated();
        }
        Ok(Some(session))
    }

    /// Communicate the session to the client and the session store, if necessary.
    ///
    /// * A destroyed session is deleted from the store, and the client is told to delete its cookie.
    /// * A session that is new, changed, touched, regenerated or was sealed with a retired key
    ///   is written to the store, and the client gets a new cookie.
    ///   New sessions that were left alone are skipped if `save_uninitialized` is disabled.
    /// * A regenerated session is written under its new id before its old id is destroyed.
    /// * Otherwise, nothing happens.
    ///
    /// The session is consumed, so that it is emitted at most once.
    /// Failures of the session store are returned as [`Error::StoreUnavailable`].
    pub async fn save_session(&self, session: Session) -> Result<SessionCookieCommand> {
        if let SessionState::Destroyed { persisted_id } = &session.state {
            if let (Some(store), Some(persisted_id)) = (&self.store, persisted_id) {
                store
                    .destroy(persisted_id)
                    .await
                    .map_err(Error::StoreUnavailable)?;
            }
            return Ok(SessionCookieCommand::Delete);
        }

        let changes = session.changes;
        let needs_cookie = (session.is_new() && self.config.save_uninitialized())
            || changes.data
            || changes.touched
            || changes.regenerated
            || changes.rotated;
        if !needs_cookie {
            return Ok(SessionCookieCommand::DoNothing);
        }

        let cookie_value = match &self.store {
            None => session.to_cookie(&self.config)?,
            Some(store) => {
                if session.is_new() || changes.data || changes.touched || changes.regenerated {
                    let record = SessionRecord {
                        data: session.data().clone(),
                        expiry: *session.expiry(),
                    };
                    store
                        .set(session.id(), &record)
                        .await
                        .map_err(Error::StoreUnavailable)?;
                }
                // The old record is only dropped once the new one is in place.
                if let Some(persisted_id) = session.persisted_id() {
                    if persisted_id != session.id() {
                        store
                            .destroy(persisted_id)
                            .await
                            .map_err(Error::StoreUnavailable)?;
                    }
                }
                session.to_id_cookie(&self.config)?
            }
        };

        Ok(SessionCookieCommand::Set {
            cookie_value,
            expiry: *session.expiry(),
        })
    }

    /// Encode the session into a token, e.g. to hand it to a client over another channel.
    ///
    /// The token is equivalent to the cookie value [`save_session`](SessionManager::save_session)
    /// would produce: with a session store it carries only the id, so it is usable only once the
    /// session has been saved. The token has no one-time-use semantics and expires with the session.
    pub fn encode_session(&self, session: &Session) -> Result<String> {
        match self.store {
            None => session.to_cookie(&self.config),
            Some(_) => session.to_id_cookie(&self.config),
        }
    }

    /// Render the value of a `Set-Cookie` header for the given command,
    /// using the cookie name and attributes of the configuration.
    /// Returns `None` for [`SessionCookieCommand::DoNothing`].
    pub fn set_cookie_header(
        &self,
        command: &SessionCookieCommand,
        now: DateTime<Utc>,
    ) -> Option<String> {
        let (value, max_age) = match command {
            SessionCookieCommand::Set {
                cookie_value,
                expiry,
            } => (
                cookie_value.as_str(),
                match expiry {
                    SessionExpiry::DateTime(_) => {
                        Some(expiry.expires_in(now).map_or(0, |ttl| ttl.as_secs()))
                    }
                    SessionExpiry::Never => None,
                },
            ),
            SessionCookieCommand::Delete => ("", Some(0)),
            SessionCookieCommand::DoNothing => return None,
        };

        let options = self.config.cookie();
        let mut header = format!("{}={value}", self.config.cookie_name());
        if let Some(path) = &options.path {
            header.push_str(&format!("; Path={path}"));
        }
        if let Some(domain) = &options.domain {
            header.push_str(&format!("; Domain={domain}"));
        }
        if let Some(max_age) = max_age {
            header.push_str(&format!("; Max-Age={max_age}"));
        }
        if options.http_only {
            header.push_str("; HttpOnly");
        }
        if options.secure {
            header.push_str("; Secure");
        }
        if let Some(same_site) = options.same_site {
            header.push_str("; SameSite=");
            header.push_str(same_site.as_str());
        }
        Some(header)
    }
}
