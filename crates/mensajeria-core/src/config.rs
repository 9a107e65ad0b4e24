//! Engine and per-chat configuration.

use crate::crypto::{random_bytes, AlgorithmId};
use crate::error::{Error, Result};
use crate::logging::Redacted;
use std::fmt;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Environment variable prefix.
const ENV_PREFIX: &str = "MENSAJERIA_";

/// Shared secret for protocol envelope signatures.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SigningSecret(Vec<u8>);

impl SigningSecret {
    /// Wrap raw secret bytes. Empty secrets are rejected.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(Error::InvalidConfig("signing secret is empty".into()));
        }
        Ok(Self(bytes))
    }

    /// Parse a hex-encoded secret.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())
            .map_err(|_| Error::InvalidConfig("signing secret is not hex".into()))?;
        Self::new(bytes)
    }

    /// Generate a random 32-byte secret.
    pub fn random() -> Self {
        Self(random_bytes::<32>().to_vec())
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SigningSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SigningSecret({})", Redacted(&self.0))
    }
}

/// When appended messages reach the persistence gateway.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WritePolicy {
    /// `send_message` returns only after the gateway committed the append.
    #[default]
    WriteThrough,
    /// Appends stay dirty in the cache until a flush, an eviction, shutdown
    /// or the background sweeper persists them.
    WriteBack,
}

impl FromStr for WritePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "write-through" | "writethrough" => Ok(Self::WriteThrough),
            "write-back" | "writeback" => Ok(Self::WriteBack),
            other => Err(Error::InvalidConfig(format!("unknown write policy: {}", other))),
        }
    }
}

/// Chat engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of resident chats.
    pub cache_capacity: NonZeroUsize,
    /// Newest messages kept in memory per chat.
    pub message_window: usize,
    /// Persistence timing for appended messages.
    pub write_policy: WritePolicy,
    /// Period of the background flush and expiry sweep.
    pub cleanup_interval: Duration,
    /// Secret for signing and verifying protocol envelopes.
    pub signing_secret: SigningSecret,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_capacity: NonZeroUsize::new(50).unwrap_or(NonZeroUsize::MIN),
            message_window: 100,
            write_policy: WritePolicy::default(),
            cleanup_interval: Duration::from_secs(60),
            signing_secret: SigningSecret::random(),
        }
    }
}

impl EngineConfig {
    /// Build a configuration from `MENSAJERIA_*` environment variables.
    ///
    /// Unset variables keep their defaults. Without
    /// `MENSAJERIA_SIGNING_SECRET` a random secret is generated, which only
    /// verifies envelopes signed by this process.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(format!("{}{}", ENV_PREFIX, name)).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = lookup("CACHE_CAPACITY") {
            let n: usize = parse_number("CACHE_CAPACITY", &v)?;
            config.cache_capacity = NonZeroUsize::new(n)
                .ok_or_else(|| Error::InvalidConfig("cache capacity must be positive".into()))?;
        }
        if let Some(v) = lookup("MESSAGE_WINDOW") {
            config.message_window = parse_number("MESSAGE_WINDOW", &v)?;
        }
        if let Some(v) = lookup("WRITE_POLICY") {
            config.write_policy = v.parse()?;
        }
        if let Some(v) = lookup("CLEANUP_INTERVAL_SECS") {
            let secs: u64 = parse_number("CLEANUP_INTERVAL_SECS", &v)?;
            if secs == 0 {
                return Err(Error::InvalidConfig("cleanup interval must be positive".into()));
            }
            config.cleanup_interval = Duration::from_secs(secs);
        }
        match lookup("SIGNING_SECRET") {
            Some(v) => config.signing_secret = SigningSecret::from_hex(&v)?,
            None => warn!("no signing secret configured, using a random one"),
        }

        Ok(config)
    }
}

fn parse_number<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("{}{} is not a number", ENV_PREFIX, name)))
}

/// Per-chat settings, persisted with the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChatConfig {
    /// Algorithm for every message in the chat.
    pub encryption_type: AlgorithmId,
    /// Auto-delete window in hours; 0 disables expiry.
    pub auto_delete_hours: u32,
}

impl ChatConfig {
    /// Time-to-live for new messages, if expiry is enabled.
    pub fn ttl(&self) -> Option<chrono::Duration> {
        ttl_from_hours(self.auto_delete_hours)
    }
}

pub(crate) fn ttl_from_hours(hours: u32) -> Option<chrono::Duration> {
    (hours > 0).then(|| chrono::Duration::hours(i64::from(hours)))
}
