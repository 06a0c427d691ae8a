use crate::codec::Protection;
use crate::{Error, KeyRing, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};

/// The default name of the session cookie.
pub const DEFAULT_COOKIE_NAME: &str = "Session";
/// The default expiry window of a session: one day.
pub const DEFAULT_EXPIRY: std::time::Duration = std::time::Duration::from_secs(24 * 60 * 60);

/// The configuration of a [`SessionManager`](crate::SessionManager).
///
/// Build it with [`SessionConfig::builder`].
/// All values are validated when building, so that a bad configuration fails at startup
/// rather than while handling a request.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    key_ring: KeyRing,
    cookie_name: String,
    expiry: Option<Duration>,
    protection: Protection,
    rolling: bool,
    save_uninitialized: bool,
    cookie: CookieOptions,
}

/// A builder for [`SessionConfig`].
#[derive(Debug, Clone)]
#[must_use]
pub struct SessionConfigBuilder {
    key_ring: KeyRing,
    cookie_name: String,
    expiry: Option<std::time::Duration>,
    confidential: bool,
    rolling: bool,
    save_uninitialized: bool,
    cookie: CookieOptions,
}

/// Attributes of the session cookie, passed through to the transport layer.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CookieOptions {
    /// The `Path` attribute.
    pub path: Option<String>,
    /// The `Domain` attribute.
    pub domain: Option<String>,
    /// Whether to set the `Secure` attribute.
    pub secure: bool,
    /// Whether to set the `HttpOnly` attribute.
    pub http_only: bool,
    /// The `SameSite` attribute.
    pub same_site: Option<SameSite>,
}

/// The value of the `SameSite` cookie attribute.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum SameSite {
    /// `SameSite=Strict`
    Strict,
    /// `SameSite=Lax`
    Lax,
    /// `SameSite=None`
    None,
}

impl SessionConfig {
    /// Start building a configuration that seals tokens with the given key ring.
    pub fn builder(key_ring: KeyRing) -> SessionConfigBuilder {
        SessionConfigBuilder {
            key_ring,
            cookie_name: DEFAULT_COOKIE_NAME.to_string(),
            expiry: Some(DEFAULT_EXPIRY),
            confidential: true,
            rolling: false,
            save_uninitialized: true,
            cookie: CookieOptions::default(),
        }
    }

    /// The keys used to seal and unseal tokens.
    pub fn key_ring(&self) -> &KeyRing {
        &self.key_ring
    }

    /// The name of the session cookie.
    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    /// The expiry window of sessions, or `None` if sessions never expire.
    pub fn expiry(&self) -> Option<Duration> {
        self.expiry
    }

    /// Whether tokens are encrypted or only signed.
    pub fn protection(&self) -> Protection {
        self.protection
    }

    /// Whether every loaded session is touched, extending its expiry on every request.
    pub fn rolling(&self) -> bool {
        self.rolling
    }

    /// Whether new sessions are sent to the client even if they were never changed.
    pub fn save_uninitialized(&self) -> bool {
        self.save_uninitialized
    }

    /// The attributes of the session cookie.
    pub fn cookie(&self) -> &CookieOptions {
        &self.cookie
    }
}

impl SessionConfigBuilder {
    /// Sets the name of the session cookie. Defaults to [`DEFAULT_COOKIE_NAME`].
    pub fn cookie_name(mut self, cookie_name: impl Into<String>) -> Self {
        self.cookie_name = cookie_name.into();
        self
    }

    /// Sets the expiry window of sessions. Defaults to [`DEFAULT_EXPIRY`].
    pub fn expiry(mut self, expiry: std::time::Duration) -> Self {
        self.expiry = Some(expiry);
        self
    }

    /// Lets sessions live until they are destroyed explicitly.
    pub fn never_expire(mut self) -> Self {
        self.expiry = None;
        self
    }

    /// If true, tokens are encrypted, otherwise they are only signed. Defaults to true.
    pub fn confidential(mut self, confidential: bool) -> Self {
        self.confidential = confidential;
        self
    }

    /// If true, every loaded session is touched. Defaults to false.
    pub fn rolling(mut self, rolling: bool) -> Self {
        self.rolling = rolling;
        self
    }

    /// If true, new sessions are sent to the client even if they were never changed. Defaults to true.
    pub fn save_uninitialized(mut self, save_uninitialized: bool) -> Self {
        self.save_uninitialized = save_uninitialized;
        self
    }

    /// Sets the attributes of the session cookie.
    pub fn cookie(mut self, cookie: CookieOptions) -> Self {
        self.cookie = cookie;
        self
    }

    /// Validate the configuration.
    pub fn build(self) -> Result<SessionConfig> {
        if self.cookie_name.is_empty() || !self.cookie_name.chars().all(is_cookie_name_char) {
            return Err(Error::InvalidConfiguration(format!(
                "{:?} is not a valid cookie name",
                self.cookie_name
            )));
        }

        let expiry = match self.expiry {
            Some(expiry) if expiry.is_zero() => {
                return Err(Error::InvalidConfiguration(
                    "the session expiry must not be zero".to_string(),
                ))
            }
            Some(expiry) => Some(Duration::from_std(expiry).map_err(|_| {
                Error::InvalidConfiguration(format!("the session expiry {expiry:?} is too large"))
            })?),
            None => None,
        };

        if self.cookie.same_site == Some(SameSite::None) && !self.cookie.secure {
            return Err(Error::InvalidConfiguration(
                "cookies with SameSite=None must be secure".to_string(),
            ));
        }

        Ok(SessionConfig {
            key_ring: self.key_ring,
            cookie_name: self.cookie_name,
            expiry,
            protection: if self.confidential {
                Protection::Encrypted
            } else {
                Protection::Signed
            },
            rolling: self.rolling,
            save_uninitialized: self.save_uninitialized,
            cookie: self.cookie,
        })
    }
}

/// A cookie name is an RFC 7230 token.
fn is_cookie_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c)
}

impl Default for CookieOptions {
    fn default() -> Self {
        Self {
            path: Some("/".to_string()),
            domain: None,
            secure: true,
            http_only: true,
            same_site: Some(SameSite::Lax),
        }
    }
}

impl SameSite {
    /// The attribute value as written in a `Set-Cookie` header.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "Strict",
            Self::Lax => "Lax",
            Self::None => "None",
        }
    }
}
