//! Authenticated encryption: AES-256-GCM and ChaCha20-Poly1305.
//!
//! Both ciphers take a 32-byte key and a 96-bit nonce and produce a
//! detached 128-bit tag. The associated data binds the algorithm id to the
//! ciphertext so an envelope cannot be replayed under the other cipher.

use crate::error::{Error, Result};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305,
};
use rand::RngCore;
use zeroize::Zeroizing;

/// Size of encryption key in bytes (256 bits).
pub const KEY_SIZE: usize = 32;

/// Size of nonce in bytes (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Size of authentication tag in bytes (128 bits).
pub const TAG_SIZE: usize = 16;

/// A nonce for AEAD encryption.
///
/// Always random: every envelope also carries a fresh salt, so the key
/// differs per message and a random nonce never repeats under one key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Create a new random nonce.
    pub fn random() -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Parse from a slice, rejecting wrong lengths.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }
}

/// AEAD cipher selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Cipher {
    Aes256Gcm,
    ChaCha20Poly1305,
}

/// Ciphertext with its detached tag.
pub(crate) struct Sealed {
    pub(crate) ciphertext: Vec<u8>,
    pub(crate) tag: [u8; TAG_SIZE],
}

/// Encrypt `plaintext`, returning ciphertext and detached tag.
pub(crate) fn seal(
    cipher: Cipher,
    key: &[u8; KEY_SIZE],
    nonce: &Nonce,
    plaintext: &[u8],
    associated_data: &[u8],
) -> Result<Sealed> {
    let payload = Payload {
        msg: plaintext,
        aad: associated_data,
    };
    let mut combined = match cipher {
        Cipher::Aes256Gcm => Aes256Gcm::new(key.into()).encrypt(nonce.as_bytes().into(), payload),
        Cipher::ChaCha20Poly1305 => {
            ChaCha20Poly1305::new(key.into()).encrypt(nonce.as_bytes().into(), payload)
        }
    }
    .map_err(|_| Error::Crypto("encryption failed".into()))?;

    // Both crates append the tag to the ciphertext.
    let split = combined
        .len()
        .checked_sub(TAG_SIZE)
        .ok_or_else(|| Error::Crypto("ciphertext shorter than tag".into()))?;
    let mut tag = [0u8; TAG_SIZE];
    tag.copy_from_slice(&combined[split..]);
    combined.truncate(split);

    Ok(Sealed {
        ciphertext: combined,
        tag,
    })
}

/// Decrypt and authenticate.
///
/// Returns `DecryptionFailed` on any failure; the cause is never reported.
pub(crate) fn open(
    cipher: Cipher,
    key: &[u8; KEY_SIZE],
    nonce: &Nonce,
    ciphertext: &[u8],
    tag: &[u8; TAG_SIZE],
    associated_data: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    let mut combined = Vec::with_capacity(ciphertext.len() + TAG_SIZE);
    combined.extend_from_slice(ciphertext);
    combined.extend_from_slice(tag);

    let payload = Payload {
        msg: &combined,
        aad: associated_data,
    };
    let plaintext = match cipher {
        Cipher::Aes256Gcm => Aes256Gcm::new(key.into()).decrypt(nonce.as_bytes().into(), payload),
        Cipher::ChaCha20Poly1305 => {
            ChaCha20Poly1305::new(key.into()).decrypt(nonce.as_bytes().into(), payload)
        }
    }
    .map_err(|_| Error::DecryptionFailed)?;

    Ok(Zeroizing::new(plaintext))
}
