//! # Mensajeria Core
//!
//! End-to-end encrypted messaging core: password-derived envelope
//! encryption, a signed wire protocol, and a cache/sync engine that sits
//! between callers and durable storage.
//!
//! ## Security Model
//!
//! - Message bodies are encrypted before they reach the cache or storage
//! - Keys are derived per message from the caller's password and a fresh salt
//! - Every inbound envelope is untrusted until its HMAC verifies
//! - Crypto and protocol failures are deliberately uninformative
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Host (transport, UI, auth)       │
//! ├─────────────────────────────────────────┤
//! │      messaging (ChatEngine, sweeper)    │
//! ├───────────────┬─────────────┬───────────┤
//! │    crypto     │  protocol   │  storage  │
//! └───────────────┴─────────────┴───────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mensajeria_core::config::{ChatConfig, EngineConfig};
//! use mensajeria_core::messaging::{ChatEngine, MessageRange, UserId};
//! use mensajeria_core::storage::MemoryStore;
//!
//! # async fn run() -> mensajeria_core::Result<()> {
//! let engine = ChatEngine::new(Arc::new(MemoryStore::new()), EngineConfig::default());
//! let chat = engine.create_chat(&[UserId(1), UserId(2)], ChatConfig::default()).await?;
//! engine.send_message(chat.chat_id, UserId(1), b"hola", "secret123").await?;
//! let page = engine.get_messages(chat.chat_id, "secret123", MessageRange::default()).await?;
//! assert_eq!(page[0].text(), Some("hola"));
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub(crate) mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod protocol;
pub mod storage;

pub use config::{ChatConfig, EngineConfig, SigningSecret, WritePolicy};
pub use crypto::{AlgorithmId, EncryptionEnvelope};
pub use error::{Error, Result};
pub use messaging::{ChatEngine, ChatId, MessageRecord, UserId};
pub use protocol::{ProtocolEnvelope, VerifiedEnvelope};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum size of an encoded envelope payload.
pub const MAX_MESSAGE_SIZE: usize = 65536;
