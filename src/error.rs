//! Crate-wide error type.
//!
//! Every fallible public function in `xelvra-core` returns `Result<T, XelvraError>`.
//! Variants map onto the error kinds enumerated in the messaging-core spec:
//! cryptographic failures are fatal to the affected operation and never
//! retried, wire-validation failures cause the frame to be dropped and the
//! stream closed, transport failures degrade outbound sends to offline
//! queueing, and file-transfer failures mark the transfer `Failed`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum XelvraError {
    // --- cryptographic ---
    #[error("random source unavailable")]
    RandomSourceUnavailable,

    #[error("invalid key size: expected 32 bytes, got {0}")]
    InvalidKeySize(usize),

    #[error("invalid curve point")]
    InvalidPoint,

    #[error("X3DH handshake failed at step {step}")]
    HandshakeFailed { step: u8 },

    #[error("AEAD decryption failed")]
    DecryptFailed,

    #[error("nonce replay detected")]
    NonceReplay,

    // --- wire validation ---
    #[error("frame too large: {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: u32, max: u32 },

    #[error("malformed JSON payload: {0}")]
    MalformedJson(#[from] serde_json::Error),

    #[error("missing or invalid frame magic number")]
    BadMagic,

    #[error("signature verification failed")]
    SignatureInvalid,

    // --- engine lifecycle / backpressure ---
    #[error("outgoing queue is full")]
    QueueFull,

    #[error("engine is stopped")]
    Stopped,

    // --- transport ---
    #[error("peer is not connected")]
    TransportDisconnected,

    #[error("failed to open stream: {0}")]
    StreamOpenFailed(String),

    #[error("stream I/O error: {0}")]
    StreamIoError(#[from] std::io::Error),

    // --- file transfer ---
    #[error("file transfer aborted")]
    TransferAborted,

    #[error("file transfer expired")]
    TransferExpired,

    #[error("file integrity check failed")]
    IntegrityMismatch,

    // --- offline store ---
    #[error("persistence error: {0}")]
    PersistenceError(String),
}

pub type Result<T> = std::result::Result<T, XelvraError>;
