//! xelvra-core: the secure messaging core of a peer-to-peer messenger.
//!
//! This crate owns three things end to end: the X3DH handshake and
//! AES-256-GCM payload protection (`crypto`), the signed-envelope wire
//! format (`message`, `codec`), and the engine that routes or queues those
//! envelopes and drives chunked file transfer (`engine`, `offline`,
//! `file_transfer`). Everything below the transport — peer discovery,
//! connection establishment, NAT traversal — is an external collaborator
//! reached only through the `Transport` trait in `transport`.
//!
//! Logging goes through the `log` facade; embedders pick the backend
//! (`env_logger` in this crate's own tests and examples). Errors are
//! `XelvraError` (see `error`), never `anyhow`, since this is a library.

pub mod codec;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod file_transfer;
pub mod identity;
pub mod message;
pub mod offline;
pub mod transport;

#[doc(hidden)]
pub mod testing;

pub use config::Config;
pub use engine::{MessageEngine, MessageHandler};
pub use error::{Result, XelvraError};
pub use identity::{Ed25519Identity, Identity, InMemoryKeyDirectory, KeyDirectory};
pub use message::{Message, MessageKind};
pub use offline::OfflineStore;
pub use transport::{BoxedStream, Connectedness, Stream, StreamHandler, Transport};
