//! Crypto envelope manager.
//!
//! Stateless per call. Turns plaintext plus a password into an
//! [`EncryptionEnvelope`] and back:
//!
//! - **PBKDF2-HMAC-SHA256**: password key derivation, 100,000 iterations
//! - **AES-256-GCM** / **ChaCha20-Poly1305**: authenticated encryption
//! - **RSA-2048 OAEP-SHA256**: per-chat asymmetric encryption
//!
//! ## Security Properties
//!
//! - Fresh salt and nonce for every envelope
//! - Fail-closed decryption with a single error for every cause
//! - Derived keys and plaintext zeroized on drop
//!
//! Iteration count and salt/nonce sizes are constants; nothing here lets a
//! caller weaken them.

mod aead;
mod envelope;
mod kdf;
mod keys;

pub use aead::{Nonce, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
pub use envelope::{
    decrypt, encrypt, generate_chat_keypair, AlgorithmId, EncryptionEnvelope, MAX_PLAINTEXT_SIZE,
};
pub use kdf::{derive_chat_key, derive_key, DerivedKey, PBKDF2_ITERATIONS, SALT_SIZE};
pub use keys::{ChatKeyPair, ChatPublicKey, SealedKeyPair, RSA_KEY_BITS};

/// Generate cryptographically secure random bytes.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes() {
        let a: [u8; 32] = random_bytes();
        let b: [u8; 32] = random_bytes();
        assert_ne!(a, b);
    }

    #[test]
    fn test_fixed_parameters() {
        assert_eq!(PBKDF2_ITERATIONS, 100_000);
        assert!(SALT_SIZE >= 16);
        assert_eq!(NONCE_SIZE, 12);
        assert_eq!(RSA_KEY_BITS, 2048);
    }
}
