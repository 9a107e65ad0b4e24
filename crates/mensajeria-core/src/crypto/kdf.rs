//! Password-based key derivation (PBKDF2-HMAC-SHA256).
//!
//! The iteration count and salt length are fixed constants. Callers cannot
//! lower them per call.

use super::aead::KEY_SIZE;
use crate::error::{Error, Result};
use hmac::Hmac;
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::Zeroizing;

/// PBKDF2 iteration count.
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Salt length in bytes, fresh per encryption.
pub const SALT_SIZE: usize = 16;

/// Symmetric key material derived from a password.
///
/// Lives on the call stack only and is zeroized on drop.
pub struct DerivedKey(Zeroizing<[u8; KEY_SIZE]>);

impl DerivedKey {
    /// Get the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DerivedKey([REDACTED])")
    }
}

/// Derive a 256-bit key from `password` and `salt`.
pub fn derive_key(password: &str, salt: &[u8]) -> Result<DerivedKey> {
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    pbkdf2::pbkdf2::<Hmac<Sha256>>(password.as_bytes(), salt, PBKDF2_ITERATIONS, key.as_mut())
        .map_err(|_| Error::Crypto("key derivation failed".into()))?;
    Ok(DerivedKey(key))
}

/// Deterministic per-chat key: the salt is SHA-256 of the chat id.
///
/// Useful for hosts that need a stable chat-scoped secret (for example to
/// key a local index). Message encryption never uses it; every envelope
/// derives its own key from a fresh salt.
pub fn derive_chat_key(chat_id: &str, password: &str) -> Result<DerivedKey> {
    let salt = Sha256::digest(chat_id.as_bytes());
    derive_key(password, &salt)
}
