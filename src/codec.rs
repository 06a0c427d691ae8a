//! The session token codec.
//!
//! A token consists of two base64url parts joined by a single `;`.
//! Signed tokens carry the payload and an HMAC-SHA256 tag over it.
//! Encrypted tokens carry a random initialization vector and the AES-256-GCM ciphertext of the payload.
//! The AES key of an encrypted token is derived from the secret key and the initialization vector,
//! so every token is encrypted under its own key.
//!
//! Unsealing tries the keys of a [`KeyRing`] in order, the active key first.
//! A token that only a retired key can open is reported as [`rotated`](Unsealed::rotated),
//! which tells the caller to reseal the payload with the active key.
//!
//! All decoding is fail-closed: invalid input results in a [`TokenError`], never in a panic.

use crate::key_ring::{KeyRing, SecretKey};
use crate::{Error, TokenError};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// The separator between the two parts of a token.
pub const SEPARATOR: char = ';';
/// The length of the initialization vector of an encrypted token, in bytes.
pub const IV_LENGTH: usize = 24;
/// The length of the authentication tag appended to the ciphertext of an encrypted token, in bytes.
pub const AEAD_TAG_LENGTH: usize = 16;

const NONCE_LENGTH: usize = 12;
const KEY_DERIVATION_CONTEXT: &str = "keyed-session 2024-01-01 cookie token encryption key";

/// The result of successfully opening a token.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Unsealed {
    /// The authenticated payload.
    pub payload: Vec<u8>,
    /// True if the token was sealed with a retired key and should be resealed with the active key.
    pub rotated: bool,
}

/// How session tokens are protected.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protection {
    /// The payload is readable by the client, but cannot be modified.
    Signed,
    /// The payload can neither be read nor modified by the client.
    Encrypted,
}

impl Protection {
    /// Seal `payload` with the active key of `key_ring`.
    pub fn seal(self, payload: &[u8], key_ring: &KeyRing) -> Result<String, Error> {
        match self {
            Self::Signed => Ok(sign(payload, key_ring.active())),
            Self::Encrypted => encrypt(payload, key_ring.active()),
        }
    }

    /// Open a token sealed with any key of `key_ring`.
    pub fn unseal(self, token: &str, key_ring: &KeyRing) -> Result<Unsealed, TokenError> {
        match self {
            Self::Signed => verify(token, key_ring),
            Self::Encrypted => decrypt(token, key_ring),
        }
    }
}

/// Sign `payload` with `key`, producing `base64url(payload);base64url(tag)`.
pub fn sign(payload: &[u8], key: &SecretKey) -> String {
    let tag = compute_tag(payload, key);
    join(payload, &tag)
}

/// Verify a signed token against every key of `key_ring`, active key first.
pub fn verify(token: &str, key_ring: &KeyRing) -> Result<Unsealed, TokenError> {
    let (payload, tag) = split(token)?;

    for (index, key) in key_ring.keys().iter().enumerate() {
        let expected = compute_tag(&payload, key);
        if bool::from(expected.as_slice().ct_eq(tag.as_slice())) {
            return Ok(Unsealed {
                payload,
                rotated: index > 0,
            });
        }
    }

    Err(TokenError::AuthenticationFailure)
}

/// Encrypt `payload` with `key` under a fresh random initialization vector,
/// producing `base64url(iv);base64url(ciphertext)`.
pub fn encrypt(payload: &[u8], key: &SecretKey) -> Result<String, Error> {
    let mut iv = [0; IV_LENGTH];
    rand::thread_rng().fill_bytes(&mut iv);
    encrypt_with_iv(payload, key, &iv)
}

/// Encrypt `payload` with `key` under the given initialization vector.
///
/// An initialization vector must never be used twice with the same key.
/// Use [`encrypt`] unless reproducible tokens are needed, e.g. for interoperability fixtures.
pub fn encrypt_with_iv(
    payload: &[u8],
    key: &SecretKey,
    iv: &[u8; IV_LENGTH],
) -> Result<String, Error> {
    let ciphertext = cipher(key, iv)
        .encrypt(
            Nonce::from_slice(&iv[..NONCE_LENGTH]),
            Payload {
                msg: payload,
                aad: iv,
            },
        )
        .map_err(|_| Error::Encryption)?;
    Ok(join(iv, &ciphertext))
}

/// Decrypt an encrypted token with every key of `key_ring`, active key first.
pub fn decrypt(token: &str, key_ring: &KeyRing) -> Result<Unsealed, TokenError> {
    let (iv, ciphertext) = split(token)?;
    let iv: [u8; IV_LENGTH] = iv.try_into().map_err(|_| TokenError::Malformed)?;
    if ciphertext.len() < AEAD_TAG_LENGTH {
        return Err(TokenError::Malformed);
    }

    for (index, key) in key_ring.keys().iter().enumerate() {
        let decrypted = cipher(key, &iv).decrypt(
            Nonce::from_slice(&iv[..NONCE_LENGTH]),
            Payload {
                msg: &ciphertext,
                aad: &iv,
            },
        );
        if let Ok(payload) = decrypted {
            return Ok(Unsealed {
                payload,
                rotated: index > 0,
            });
        }
    }

    Err(TokenError::AuthenticationFailure)
}

fn compute_tag(payload: &[u8], key: &SecretKey) -> Vec<u8> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

fn cipher(key: &SecretKey, iv: &[u8; IV_LENGTH]) -> Aes256Gcm {
    let mut hasher = blake3::Hasher::new_derive_key(KEY_DERIVATION_CONTEXT);
    hasher.update(key.as_bytes());
    hasher.update(iv);
    let derived: [u8; 32] = hasher.finalize().into();
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&derived))
}

fn join(first: &[u8], second: &[u8]) -> String {
    format!(
        "{}{SEPARATOR}{}",
        URL_SAFE.encode(first),
        URL_SAFE.encode(second)
    )
}

fn split(token: &str) -> Result<(Vec<u8>, Vec<u8>), TokenError> {
    let (first, second) = token.split_once(SEPARATOR).ok_or(TokenError::Malformed)?;
    if first.is_empty() || second.is_empty() || second.contains(SEPARATOR) {
        return Err(TokenError::Malformed);
    }

    let first = URL_SAFE.decode(first).map_err(|_| TokenError::Malformed)?;
    let second = URL_SAFE.decode(second).map_err(|_| TokenError::Malformed)?;
    Ok((first, second))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO_WORLD: &[u8] = br#"{"hello":"world"}"#;

    fn key(byte: u8) -> SecretKey {
        SecretKey::new(vec![byte; 32])
    }

    fn ring(keys: &[u8]) -> KeyRing {
        KeyRing::new(keys.iter().copied().map(key)).unwrap()
    }

    /// Flips one bit of the decoded part `part` of `token` and encodes it again.
    fn flip_bit(token: &str, part: usize, bit: usize) -> String {
        let mut parts: Vec<Vec<u8>> = token
            .split(SEPARATOR)
            .map(|part| URL_SAFE.decode(part).unwrap())
            .collect();
        parts[part][bit / 8] ^= 1 << (bit % 8);
        join(&parts[0], &parts[1])
    }

    #[test]
    fn signed_token_has_two_parts() {
        let token = sign(HELLO_WORLD, &key(1));
        assert_eq!(token.split(SEPARATOR).count(), 2);
        assert_eq!(token.len(), 69);
    }

    #[test]
    fn encrypted_token_has_two_parts() {
        let token = encrypt(HELLO_WORLD, &key(1)).unwrap();
        assert_eq!(token.split(SEPARATOR).count(), 2);
        assert_eq!(token.len(), 77);
    }

    #[test]
    fn signed_payload_is_readable() {
        let token = sign(HELLO_WORLD, &key(1));
        let (payload, _) = token.split_once(SEPARATOR).unwrap();
        assert_eq!(URL_SAFE.decode(payload).unwrap(), HELLO_WORLD);
    }

    #[test]
    fn encrypted_payload_is_not_readable() {
        let token = encrypt(HELLO_WORLD, &key(1)).unwrap();
        assert!(!token.contains(&URL_SAFE.encode(b"hello")));
        assert_ne!(
            encrypt(HELLO_WORLD, &key(1)).unwrap(),
            token,
            "every token uses a fresh initialization vector"
        );
    }

    #[test]
    fn encryption_with_fixed_iv_is_reproducible() {
        let iv = [9; IV_LENGTH];
        let a = encrypt_with_iv(HELLO_WORLD, &key(1), &iv).unwrap();
        let b = encrypt_with_iv(HELLO_WORLD, &key(1), &iv).unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with(&URL_SAFE.encode(iv)));
    }

    #[test]
    fn round_trip_with_active_key() {
        for protection in [Protection::Signed, Protection::Encrypted] {
            let ring = ring(&[1, 2]);
            let token = protection.seal(HELLO_WORLD, &ring).unwrap();
            assert_eq!(
                protection.unseal(&token, &ring),
                Ok(Unsealed {
                    payload: HELLO_WORLD.to_vec(),
                    rotated: false,
                })
            );
        }
    }

    #[test]
    fn empty_payload_round_trips_when_encrypted() {
        let token = encrypt(b"", &key(1)).unwrap();
        assert_eq!(decrypt(&token, &ring(&[1])).unwrap().payload, b"");
    }

    #[test]
    fn retired_key_is_reported_as_rotated() {
        let token = sign(HELLO_WORLD, &key(1));
        assert!(!verify(&token, &ring(&[1])).unwrap().rotated);

        let unsealed = verify(&token, &ring(&[2, 1])).unwrap();
        assert_eq!(unsealed.payload, HELLO_WORLD);
        assert!(unsealed.rotated);

        assert_eq!(
            verify(&token, &ring(&[2])),
            Err(TokenError::AuthenticationFailure)
        );
    }

    #[test]
    fn resealing_after_rotation_clears_the_flag() {
        for protection in [Protection::Signed, Protection::Encrypted] {
            let old = ring(&[1]);
            let new = ring(&[2, 1]);
            let token = protection.seal(HELLO_WORLD, &old).unwrap();

            let unsealed = protection.unseal(&token, &new).unwrap();
            assert!(unsealed.rotated);

            let resealed = protection.seal(&unsealed.payload, &new).unwrap();
            let unsealed = protection.unseal(&resealed, &new).unwrap();
            assert!(!unsealed.rotated);
            assert_eq!(unsealed.payload, HELLO_WORLD);
        }
    }

    #[test]
    fn encrypted_token_with_unknown_key_is_rejected() {
        let token = encrypt(HELLO_WORLD, &key(1)).unwrap();
        assert!(decrypt(&token, &ring(&[2, 1])).unwrap().rotated);
        assert_eq!(
            decrypt(&token, &ring(&[2, 3])),
            Err(TokenError::AuthenticationFailure)
        );
    }

    #[test]
    fn tampered_signed_token_is_rejected() {
        let ring = ring(&[1, 2]);
        let token = sign(HELLO_WORLD, &key(2));
        for part in 0..2 {
            let bits = if part == 0 { HELLO_WORLD.len() * 8 } else { 32 * 8 };
            for bit in 0..bits {
                assert_eq!(
                    verify(&flip_bit(&token, part, bit), &ring),
                    Err(TokenError::AuthenticationFailure),
                    "bit {bit} of part {part}"
                );
            }
        }
    }

    #[test]
    fn tampered_encrypted_token_is_rejected() {
        let ring = ring(&[1, 2]);
        let token = encrypt(HELLO_WORLD, &key(2)).unwrap();
        for part in 0..2 {
            let bits = if part == 0 {
                IV_LENGTH * 8
            } else {
                (HELLO_WORLD.len() + AEAD_TAG_LENGTH) * 8
            };
            for bit in 0..bits {
                assert_eq!(
                    decrypt(&flip_bit(&token, part, bit), &ring),
                    Err(TokenError::AuthenticationFailure),
                    "bit {bit} of part {part}"
                );
            }
        }
    }

    #[test]
    fn malformed_tokens_fail_closed() {
        let ring = ring(&[1]);
        let signed = sign(HELLO_WORLD, &key(1));
        let encrypted = encrypt(HELLO_WORLD, &key(1)).unwrap();
        let malformed = [
            String::new(),
            ";".to_string(),
            "abc".to_string(),
            "abc;".to_string(),
            ";abc".to_string(),
            format!("{signed};"),
            format!("{signed};{signed}"),
            signed.replace(SEPARATOR, ""),
            "%%%%;%%%%".to_string(),
            "aGVsbG8;aGVsbG8".to_string(),
        ];

        for token in &malformed {
            assert_eq!(verify(token, &ring), Err(TokenError::Malformed), "{token:?}");
            assert_eq!(decrypt(token, &ring), Err(TokenError::Malformed), "{token:?}");
        }
        assert_eq!(
            decrypt(&format!("{encrypted};"), &ring),
            Err(TokenError::Malformed)
        );
    }

    #[test]
    fn encrypted_token_with_wrong_iv_length_is_malformed() {
        let token = join(&[0; 12], &[0; 32]);
        assert_eq!(decrypt(&token, &ring(&[1])), Err(TokenError::Malformed));
    }

    #[test]
    fn encrypted_token_with_truncated_ciphertext_is_malformed() {
        let token = join(&[0; IV_LENGTH], &[0; AEAD_TAG_LENGTH - 1]);
        assert_eq!(decrypt(&token, &ring(&[1])), Err(TokenError::Malformed));
    }

    #[test]
    fn signed_token_does_not_open_as_encrypted() {
        let token = sign(HELLO_WORLD, &key(1));
        assert!(decrypt(&token, &ring(&[1])).is_err());
    }
}
