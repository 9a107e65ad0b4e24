//! Error types for the messaging core.
//!
//! Error messages are intentionally generic. Cryptographic and protocol
//! failures never say *why* they failed, so callers cannot be used as an
//! oracle for wrong passwords, tampered ciphertext or forged signatures.

use thiserror::Error;

/// Core error type.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The envelope names an algorithm this build does not implement.
    #[error("unsupported algorithm")]
    UnsupportedAlgorithm,

    /// Plaintext exceeds what the selected algorithm can carry.
    #[error("payload too large")]
    PayloadTooLarge,

    /// Wrong password, tampered ciphertext or corrupted envelope.
    /// The three causes are deliberately indistinguishable.
    #[error("decryption failed")]
    DecryptionFailed,

    /// Protocol envelope failed to parse, verify or validate.
    #[error("malformed envelope")]
    MalformedEnvelope,

    /// The persistence gateway failed or is unreachable.
    #[error("storage unavailable")]
    StorageUnavailable(String),

    /// Chat or message does not exist.
    #[error("not found")]
    NotFound(String),

    /// Key material supplied by the caller is missing or unusable.
    #[error("invalid key material")]
    InvalidKey(String),

    /// Encryption-side cryptographic failure (RNG, key generation).
    #[error("cryptographic operation failed")]
    Crypto(String),

    /// Configuration rejected.
    #[error("invalid configuration")]
    InvalidConfig(String),

    /// Encoding/decoding error.
    #[error("encoding error")]
    Encoding(String),
}

/// Result type alias using the core's Error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether a caller-side retry can succeed. The core never retries itself.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::StorageUnavailable(_))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::StorageUnavailable(e.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Crypto(format!("worker task failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_do_not_leak_detail() {
        let err = Error::StorageUnavailable("disk /var/lib/chat.db is full".into());
        assert_eq!(err.to_string(), "storage unavailable");

        let err = Error::InvalidKey("rsa modulus 17 bits".into());
        assert_eq!(err.to_string(), "invalid key material");
    }

    #[test]
    fn test_only_storage_is_retryable() {
        assert!(Error::StorageUnavailable(String::new()).is_retryable());
        assert!(!Error::DecryptionFailed.is_retryable());
        assert!(!Error::MalformedEnvelope.is_retryable());
        assert!(!Error::NotFound("chat".into()).is_retryable());
    }
}
