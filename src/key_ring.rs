use crate::{Error, Result};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use rand::RngCore;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

/// The recommended minimum length of a secret key, in bytes.
pub const RECOMMENDED_KEY_LENGTH: usize = 32;

/// A secret key used to sign or encrypt session tokens.
///
/// The key material is never printed by the [`Debug`] implementation.
#[derive(Clone, Eq, PartialEq)]
pub struct SecretKey(Box<[u8]>);

impl SecretKey {
    /// Wrap the given bytes as a secret key.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into().into_boxed_slice())
    }

    /// Generate a random key of [`RECOMMENDED_KEY_LENGTH`] bytes using the thread-local
    /// cryptographically secure random generator.
    pub fn generate() -> Self {
        let mut bytes = vec![0; RECOMMENDED_KEY_LENGTH];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::new(bytes)
    }

    /// Returns the raw key material.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the length of the key in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the key has no bytes.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Debug for SecretKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretKey({} bytes)", self.0.len())
    }
}

/// An ordered, non-empty list of secret keys.
///
/// The first key is the active key, which is used to seal every new token.
/// All further keys are retired: tokens sealed with them are still accepted, but flagged as rotated
/// so that they get resealed with the active key.
///
/// A key ring is immutable. To rotate keys, build a new ring with the new key in front,
/// e.g. with [`KeyRing::with_active_key`], and keep the old key around for a grace period.
/// Cloning is cheap, as the keys are shared.
#[derive(Debug, Clone)]
pub struct KeyRing {
    keys: Arc<[SecretKey]>,
}

impl KeyRing {
    /// Create a key ring from the given keys, the first one being the active key.
    ///
    /// Fails if there are no keys or if any key is empty.
    /// Keys shorter than [`RECOMMENDED_KEY_LENGTH`] are accepted, but logged as a warning.
    pub fn new(keys: impl IntoIterator<Item = SecretKey>) -> Result<Self> {
        let keys: Arc<[SecretKey]> = keys.into_iter().collect();
        if keys.is_empty() {
            return Err(Error::InvalidConfiguration(
                "the key ring must contain at least one key".to_string(),
            ));
        }

        for (index, key) in keys.iter().enumerate() {
            if key.is_empty() {
                return Err(Error::InvalidConfiguration(format!(
                    "key {index} of the key ring is empty"
                )));
            }
            if key.len() < RECOMMENDED_KEY_LENGTH {
                log::warn!(
                    "Key {index} of the key ring has only {} bytes, at least {RECOMMENDED_KEY_LENGTH} are recommended",
                    key.len()
                );
            }
        }

        Ok(Self { keys })
    }

    /// Create a key ring from raw secrets, the first one being the active key.
    pub fn from_secrets<Secret: AsRef<[u8]>>(
        secrets: impl IntoIterator<Item = Secret>,
    ) -> Result<Self> {
        Self::new(
            secrets
                .into_iter()
                .map(|secret| SecretKey::new(secret.as_ref())),
        )
    }

    /// Create a key ring from base64url encoded secrets, as they would appear in a configuration file.
    pub fn from_base64<Secret: AsRef<str>>(
        secrets: impl IntoIterator<Item = Secret>,
    ) -> Result<Self> {
        let keys = secrets
            .into_iter()
            .enumerate()
            .map(|(index, secret)| {
                URL_SAFE
                    .decode(secret.as_ref().trim())
                    .map(SecretKey::new)
                    .map_err(|error| {
                        Error::InvalidConfiguration(format!(
                            "key {index} of the key ring is not valid base64url: {error}"
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(keys)
    }

    /// Returns a new key ring with `key` as the active key, retiring all keys of this ring.
    pub fn with_active_key(&self, key: SecretKey) -> Result<Self> {
        Self::new(std::iter::once(key).chain(self.keys.iter().cloned()))
    }

    /// Returns the active key.
    pub fn active(&self) -> &SecretKey {
        &self.keys[0]
    }

    /// Returns all keys, the active key first.
    pub fn keys(&self) -> &[SecretKey] {
        &self.keys
    }

    /// Returns the number of keys, which is never zero.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Always false, a key ring is never empty.
    pub fn is_empty(&self) -> bool {
        false
    }
}
