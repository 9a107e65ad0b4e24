//! Per-chat RSA key pairs.
//!
//! A chat configured for RSA-OAEP owns exactly one key pair, generated the
//! first time it is needed. The pair is persisted only in sealed form: the
//! public half as SPKI DER, the private half as PKCS#8 DER encrypted with
//! AES-256-GCM under a password-derived key.

use super::envelope::{self, AlgorithmId, EncryptionEnvelope};
use crate::codec::{Reader, Writer};
use crate::error::{Error, Result};
use crate::logging::ShortHex;
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::fmt;
use zeroize::Zeroizing;

/// RSA modulus size in bits.
pub const RSA_KEY_BITS: usize = 2048;

/// OAEP overhead with SHA-256: two digests plus two bytes.
const OAEP_OVERHEAD: usize = 2 * 32 + 2;

/// Upper bound on encoded key material we are willing to parse.
const MAX_KEY_DER: usize = 16 * 1024;

/// Public half of a chat key pair.
#[derive(Clone, PartialEq, Eq)]
pub struct ChatPublicKey(RsaPublicKey);

impl ChatPublicKey {
    /// Parse from SPKI DER.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        RsaPublicKey::from_public_key_der(der)
            .map(Self)
            .map_err(|_| Error::InvalidKey("unparsable public key".into()))
    }

    /// Encode as SPKI DER.
    pub fn to_der(&self) -> Result<Vec<u8>> {
        self.0
            .to_public_key_der()
            .map(|doc| doc.as_bytes().to_vec())
            .map_err(|_| Error::Crypto("public key encoding failed".into()))
    }

    /// Largest plaintext this key can carry under OAEP-SHA256.
    pub fn max_plaintext_len(&self) -> usize {
        self.0.size().saturating_sub(OAEP_OVERHEAD)
    }

    pub(crate) fn encrypt_oaep(&self, plaintext: &[u8], label: &str) -> Result<Vec<u8>> {
        if plaintext.len() > self.max_plaintext_len() {
            return Err(Error::PayloadTooLarge);
        }
        self.0
            .encrypt(&mut OsRng, Oaep::new_with_label::<Sha256, _>(label), plaintext)
            .map_err(|_| Error::Crypto("RSA-OAEP encryption failed".into()))
    }
}

impl fmt::Debug for ChatPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let der = self.to_der().unwrap_or_default();
        write!(f, "ChatPublicKey({})", ShortHex(&der))
    }
}

/// An RSA key pair scoped to one chat.
///
/// The private key never leaves this type except through [`ChatKeyPair::seal`].
pub struct ChatKeyPair {
    private: RsaPrivateKey,
    public: ChatPublicKey,
}

impl ChatKeyPair {
    /// Generate a fresh 2048-bit pair.
    pub fn generate() -> Result<Self> {
        let private = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
            .map_err(|_| Error::Crypto("RSA key generation failed".into()))?;
        let public = ChatPublicKey(RsaPublicKey::from(&private));
        Ok(Self { private, public })
    }

    /// Get the public key.
    pub fn public_key(&self) -> &ChatPublicKey {
        &self.public
    }

    /// Encrypt the private half under `password` for persistence.
    pub fn seal(&self, password: &str) -> Result<SealedKeyPair> {
        let private_der = self
            .private
            .to_pkcs8_der()
            .map_err(|_| Error::Crypto("private key encoding failed".into()))?;
        let sealed_private =
            envelope::encrypt(private_der.as_bytes(), password, AlgorithmId::Aes256Gcm, None)?;

        Ok(SealedKeyPair {
            public_der: self.public.to_der()?,
            sealed_private,
        })
    }

    pub(crate) fn decrypt_oaep(
        &self,
        ciphertext: &[u8],
        label: &str,
    ) -> Result<Zeroizing<Vec<u8>>> {
        self.private
            .decrypt(Oaep::new_with_label::<Sha256, _>(label), ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| Error::DecryptionFailed)
    }
}

impl fmt::Debug for ChatKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatKeyPair")
            .field("public", &self.public)
            .field("private", &"[REDACTED]")
            .finish()
    }
}

/// Persisted form of a [`ChatKeyPair`].
#[derive(Clone, PartialEq, Eq)]
pub struct SealedKeyPair {
    public_der: Vec<u8>,
    sealed_private: EncryptionEnvelope,
}

impl SealedKeyPair {
    /// Parse the public half. Needs no password.
    pub fn public_key(&self) -> Result<ChatPublicKey> {
        ChatPublicKey::from_der(&self.public_der)
    }

    /// Recover the full pair.
    ///
    /// A wrong password fails with `DecryptionFailed`; key material that
    /// decrypts but does not parse, or whose halves disagree, is `InvalidKey`.
    pub fn open(&self, password: &str) -> Result<ChatKeyPair> {
        let private_der = envelope::decrypt(&self.sealed_private, password, None)?;
        let private = RsaPrivateKey::from_pkcs8_der(&private_der)
            .map_err(|_| Error::InvalidKey("unparsable private key".into()))?;
        let public = ChatPublicKey(RsaPublicKey::from(&private));

        if public != self.public_key()? {
            return Err(Error::InvalidKey("key pair halves do not match".into()));
        }
        Ok(ChatKeyPair { private, public })
    }

    /// Canonical bytes for storage.
    pub fn to_bytes(&self) -> Vec<u8> {
        let sealed = self.sealed_private.to_bytes();
        let mut w = Writer::with_capacity(8 + self.public_der.len() + sealed.len());
        w.long_bytes(&self.public_der).long_bytes(&sealed);
        w.finish()
    }

    /// Parse storage bytes produced by [`SealedKeyPair::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let invalid = || Error::InvalidKey("corrupted sealed key pair".into());
        let mut r = Reader::new(bytes);
        let public_der = r.long_bytes(MAX_KEY_DER).ok_or_else(invalid)?.to_vec();
        let sealed = r.long_bytes(MAX_KEY_DER).ok_or_else(invalid)?;
        if !r.is_empty() {
            return Err(invalid());
        }
        let sealed_private = EncryptionEnvelope::from_bytes(sealed).map_err(|_| invalid())?;
        Ok(Self {
            public_der,
            sealed_private,
        })
    }
}

impl fmt::Debug for SealedKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealedKeyPair")
            .field("public", &ShortHex(&self.public_der))
            .field("sealed_private", &"[REDACTED]")
            .finish()
    }
}
