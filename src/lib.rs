//! Cookie sessions with signed or encrypted tokens and key rotation.
//!
//! This crate assigns each client a session, keeps its key/value data across requests,
//! and protects the session cookie against tampering and, optionally, disclosure.
//! It is independent of any HTTP framework: the transport layer hands in the inbound cookie value
//! and receives a [`SessionCookieCommand`] describing how to update the cookie.
//!
//! # Change tracking
//!
//! Changes are tracked automatically.
//! Writing to the data of a session marks it as changed, touching it or regenerating its id
//! forces a new cookie, and loading it from a cookie sealed with a retired key does so as well.
//! A session that was loaded and left alone produces no new cookie at all.
//!
//! # Security
//!
//! Cookies are sealed with the active key of a [`KeyRing`], either signed with HMAC-SHA256 or
//! encrypted with AES-256-GCM under a per-token key.
//! Cookies sealed with a retired key of the ring are still accepted and transparently resealed
//! with the active key, so keys can be rotated without logging anybody out.
//! Anything a client can send, like a tampered, expired or malformed cookie, results in a fresh
//! session rather than an error.
//!
//! Without a [`SessionStore`], the whole session travels inside the cookie.
//! With a session store, the cookie carries only the sealed session id.
//!
//! # Example
//!
//! ```
//! use keyed_session::{KeyRing, SessionConfig, SessionCookieCommand, SessionManager};
//!
//! # fn main() -> keyed_session::Result {
//! # async_std::task::block_on(async {
//! let key_ring = KeyRing::from_secrets([b"an example secret of thirty-two bytes".as_slice()])?;
//! let manager = SessionManager::new(SessionConfig::builder(key_ring).build()?);
//! let now = chrono::Utc::now();
//!
//! // A request without a cookie gets a fresh session.
//! let mut session = manager.load_session(None, now).await?;
//! session.set("user", "alice")?;
//! let SessionCookieCommand::Set { cookie_value, .. } = manager.save_session(session).await? else {
//!     unreachable!("changed sessions always set the cookie")
//! };
//!
//! // The next request presents the cookie and gets the session back.
//! let session = manager.load_session(Some(&cookie_value), now).await?;
//! assert_eq!(session.get_as::<String>("user").as_deref(), Some("alice"));
//! assert_eq!(manager.save_session(session).await?, SessionCookieCommand::DoNothing);
//! #
//! # Ok::<(), keyed_session::Error>(()) }) }
//! ```

#![forbid(unsafe_code)]
#![deny(
    future_incompatible,
    missing_debug_implementations,
    nonstandard_style,
    missing_docs,
    unreachable_pub,
    missing_copy_implementations,
    unused_qualifications
)]

mod config;
mod error;
mod id_generator;
mod key_ring;
mod manager;
mod memory_store;
mod session;
mod session_store;

pub mod codec;

pub use codec::{Protection, Unsealed};
pub use config::{
    CookieOptions, SameSite, SessionConfig, SessionConfigBuilder, DEFAULT_COOKIE_NAME,
    DEFAULT_EXPIRY,
};
pub use error::{Error, TokenError};
pub use id_generator::{DebugSessionIdGenerator, DefaultSessionIdGenerator, SessionIdGenerator};
pub use key_ring::{KeyRing, SecretKey, RECOMMENDED_KEY_LENGTH};
pub use manager::SessionManager;
pub use memory_store::{MemoryStore, Operation};
pub use session::{Session, SessionData, SessionExpiry, SessionId, DEFAULT_SESSION_ID_LENGTH};
pub use session_store::{SessionCookieCommand, SessionRecord, SessionStore};

/// A result with this crate's [`Error`] and a default return type of `()`.
pub type Result<T = (), E = Error> = std::result::Result<T, E>;
