//! Encryption envelopes: algorithm dispatch and canonical encoding.
//!
//! Every call to [`encrypt`] draws a fresh salt, derives a fresh key and,
//! for the AEAD ciphers, a fresh nonce. The algorithm set is closed; all
//! dispatch happens in the two `match` statements below.

use super::aead::{self, Cipher, Nonce, NONCE_SIZE, TAG_SIZE};
use super::kdf::{derive_key, DerivedKey, SALT_SIZE};
use super::keys::{ChatKeyPair, ChatPublicKey};
use super::random_bytes;
use crate::codec::{Reader, Writer};
use crate::error::{Error, Result};
use crate::logging::RedactedBytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroizing;

/// Largest plaintext accepted by the AEAD ciphers.
///
/// Leaves room for the envelope header and the protocol framing inside a
/// 64 KiB wire payload.
pub const MAX_PLAINTEXT_SIZE: usize = 60 * 1024;

/// Largest ciphertext accepted when decoding.
const MAX_CIPHERTEXT_SIZE: usize = crate::MAX_MESSAGE_SIZE;

/// Encryption algorithm identifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum AlgorithmId {
    /// AES-256 in Galois/Counter Mode.
    #[default]
    Aes256Gcm = 0x01,
    /// ChaCha20 stream cipher with Poly1305 MAC.
    ChaCha20Poly1305 = 0x02,
    /// RSA-2048 with OAEP-SHA256 padding.
    RsaOaep = 0x03,
}

impl AlgorithmId {
    /// Parse from wire byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Aes256Gcm),
            0x02 => Some(Self::ChaCha20Poly1305),
            0x03 => Some(Self::RsaOaep),
            _ => None,
        }
    }

    /// Convert to wire byte.
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Aes256Gcm => "aes-256-gcm",
            Self::ChaCha20Poly1305 => "chacha20-poly1305",
            Self::RsaOaep => "rsa-oaep",
        }
    }

    /// Whether decrypting requires the chat's key pair.
    pub fn is_asymmetric(self) -> bool {
        matches!(self, Self::RsaOaep)
    }

    fn cipher(self) -> Option<Cipher> {
        match self {
            Self::Aes256Gcm => Some(Cipher::Aes256Gcm),
            Self::ChaCha20Poly1305 => Some(Cipher::ChaCha20Poly1305),
            Self::RsaOaep => None,
        }
    }
}

impl fmt::Display for AlgorithmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlgorithmId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "aes-256-gcm" | "aes256gcm" => Ok(Self::Aes256Gcm),
            "chacha20-poly1305" | "chacha20poly1305" => Ok(Self::ChaCha20Poly1305),
            "rsa-oaep" | "rsa" => Ok(Self::RsaOaep),
            _ => Err(Error::UnsupportedAlgorithm),
        }
    }
}

/// Ciphertext plus everything needed to decrypt it except the password.
///
/// Immutable once produced. For RSA-OAEP the nonce and tag are empty.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionEnvelope {
    algorithm: AlgorithmId,
    salt: [u8; SALT_SIZE],
    nonce: Vec<u8>,
    ciphertext: Vec<u8>,
    auth_tag: Vec<u8>,
}

impl EncryptionEnvelope {
    /// Algorithm that produced this envelope.
    pub fn algorithm(&self) -> AlgorithmId {
        self.algorithm
    }

    /// Key-derivation salt.
    pub fn salt(&self) -> &[u8; SALT_SIZE] {
        &self.salt
    }

    /// Nonce (empty for RSA-OAEP).
    pub fn nonce(&self) -> &[u8] {
        &self.nonce
    }

    /// Ciphertext bytes.
    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    /// Authentication tag (empty for RSA-OAEP).
    pub fn auth_tag(&self) -> &[u8] {
        &self.auth_tag
    }

    /// Canonical encoding:
    /// `algorithm(1) | salt(1+16) | nonce(1+n) | tag(1+t) | ciphertext(4+c)`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(
            1 + 3 + SALT_SIZE + self.nonce.len() + self.auth_tag.len() + 4 + self.ciphertext.len(),
        );
        w.u8(self.algorithm.as_byte())
            .short_bytes(&self.salt)
            .short_bytes(&self.nonce)
            .short_bytes(&self.auth_tag)
            .long_bytes(&self.ciphertext);
        w.finish()
    }

    /// Parse the canonical encoding.
    ///
    /// An unknown algorithm byte is `UnsupportedAlgorithm`; every other
    /// defect is `DecryptionFailed`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let algorithm = r.u8().ok_or(Error::DecryptionFailed)?;
        let algorithm = AlgorithmId::from_byte(algorithm).ok_or(Error::UnsupportedAlgorithm)?;

        let parsed = (|| {
            let salt: [u8; SALT_SIZE] = r.short_bytes()?.try_into().ok()?;
            let nonce = r.short_bytes()?.to_vec();
            let auth_tag = r.short_bytes()?.to_vec();
            let ciphertext = r.long_bytes(MAX_CIPHERTEXT_SIZE)?.to_vec();
            r.is_empty().then_some((salt, nonce, auth_tag, ciphertext))
        })();
        let (salt, nonce, auth_tag, ciphertext) = parsed.ok_or(Error::DecryptionFailed)?;

        let (nonce_len, tag_len) = match algorithm.cipher() {
            Some(_) => (NONCE_SIZE, TAG_SIZE),
            None => (0, 0),
        };
        if nonce.len() != nonce_len || auth_tag.len() != tag_len {
            return Err(Error::DecryptionFailed);
        }

        Ok(Self {
            algorithm,
            salt,
            nonce,
            ciphertext,
            auth_tag,
        })
    }
}

impl fmt::Debug for EncryptionEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionEnvelope")
            .field("algorithm", &self.algorithm)
            .field("ciphertext", &RedactedBytes(&self.ciphertext))
            .finish_non_exhaustive()
    }
}

/// OAEP label bound to the password-derived key.
///
/// A wrong password yields a different label and OAEP decoding fails.
fn oaep_label(key: &DerivedKey) -> Zeroizing<String> {
    Zeroizing::new(hex::encode(Sha256::digest(key.as_bytes())))
}

/// Encrypt `plaintext` under `password`.
///
/// RSA-OAEP additionally needs the chat's public key; without one the call
/// fails with `InvalidKey`.
pub fn encrypt(
    plaintext: &[u8],
    password: &str,
    algorithm: AlgorithmId,
    recipient: Option<&ChatPublicKey>,
) -> Result<EncryptionEnvelope> {
    match algorithm.cipher() {
        Some(cipher) => {
            if plaintext.len() > MAX_PLAINTEXT_SIZE {
                return Err(Error::PayloadTooLarge);
            }
            let salt: [u8; SALT_SIZE] = random_bytes();
            let key = derive_key(password, &salt)?;
            let nonce = Nonce::random();
            let aad = [algorithm.as_byte()];
            let sealed = aead::seal(cipher, key.as_bytes(), &nonce, plaintext, &aad)?;

            Ok(EncryptionEnvelope {
                algorithm,
                salt,
                nonce: nonce.as_bytes().to_vec(),
                ciphertext: sealed.ciphertext,
                auth_tag: sealed.tag.to_vec(),
            })
        }
        None => {
            let recipient =
                recipient.ok_or_else(|| Error::InvalidKey("RSA-OAEP needs a public key".into()))?;
            if plaintext.len() > recipient.max_plaintext_len() {
                return Err(Error::PayloadTooLarge);
            }
            let salt: [u8; SALT_SIZE] = random_bytes();
            let key = derive_key(password, &salt)?;
            let ciphertext = recipient.encrypt_oaep(plaintext, &oaep_label(&key))?;

            Ok(EncryptionEnvelope {
                algorithm,
                salt,
                nonce: Vec::new(),
                ciphertext,
                auth_tag: Vec::new(),
            })
        }
    }
}

/// Decrypt and authenticate an envelope.
///
/// Wrong password, tampering and corruption all fail with
/// `DecryptionFailed`. Partial plaintext is never returned.
pub fn decrypt(
    envelope: &EncryptionEnvelope,
    password: &str,
    keypair: Option<&ChatKeyPair>,
) -> Result<Zeroizing<Vec<u8>>> {
    match envelope.algorithm.cipher() {
        Some(cipher) => {
            let nonce = Nonce::from_slice(&envelope.nonce).ok_or(Error::DecryptionFailed)?;
            let tag: [u8; TAG_SIZE] = envelope
                .auth_tag
                .as_slice()
                .try_into()
                .map_err(|_| Error::DecryptionFailed)?;
            let key = derive_key(password, &envelope.salt)?;
            aead::open(
                cipher,
                key.as_bytes(),
                &nonce,
                &envelope.ciphertext,
                &tag,
                &[envelope.algorithm.as_byte()],
            )
        }
        None => {
            let keypair = keypair
                .ok_or_else(|| Error::InvalidKey("RSA-OAEP needs the chat key pair".into()))?;
            let key = derive_key(password, &envelope.salt)?;
            keypair.decrypt_oaep(&envelope.ciphertext, &oaep_label(&key))
        }
    }
}

/// Generate a key pair for a chat switching to RSA-OAEP.
pub fn generate_chat_keypair() -> Result<ChatKeyPair> {
    ChatKeyPair::generate()
}
