/// All errors that can surface from this crate to a caller.
///
/// Problems caused by the client, like a tampered or expired cookie, never show up here.
/// They are reported as [`TokenError`] internally and degrade to a fresh session.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The configuration cannot be used, e.g. the key ring is empty.
    /// This is only returned while building the configuration, never while handling a request.
    #[error("invalid session configuration: {0}")]
    InvalidConfiguration(String),

    /// The session store failed to read, write or delete a session.
    /// The transport layer decides how to report this, typically with a 5xx response.
    #[error("the session store is unavailable")]
    StoreUnavailable(#[source] anyhow::Error),

    /// The session could not be serialized.
    #[error("failed to serialize the session: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The authenticated cipher refused to encrypt the payload.
    #[error("failed to encrypt the session token")]
    Encryption,
}

/// The reason why an inbound token was rejected.
///
/// Every variant is treated as "no session" by the [`SessionManager`](crate::SessionManager).
#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum TokenError {
    /// The token does not consist of two non-empty base64url parts joined by a single `;`.
    #[error("malformed session token")]
    Malformed,

    /// No key of the key ring authenticates the token.
    #[error("session token failed authentication against every key")]
    AuthenticationFailure,

    /// The token is authentic, but its payload is not a session.
    #[error("session token carries an invalid payload")]
    InvalidPayload,

    /// The token is authentic, but the session it carries has expired.
    #[error("session token has expired")]
    Expired,
}

mod expect_impl_error {
    trait ExpectImplError: std::error::Error {}

    impl ExpectImplError for super::Error {}
    impl ExpectImplError for super::TokenError {}
}
