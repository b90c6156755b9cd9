//! Transport: the peer-addressed bidirectional stream abstraction the
//! engine is built on (spec §6). The core does not implement a transport —
//! connect-by-identifier, discovery, and NAT traversal are external
//! collaborators — it only consumes this trait.

use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// A bidirectional, ordered, reliable byte stream to a single remote peer
/// on a single protocol. Implementors are expected to be backed by
/// something like a QUIC or libp2p stream.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

pub type BoxedStream = Box<dyn Stream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectedness {
    Connected,
    NotConnected,
}

/// Invoked by the transport for every inbound stream opened on a protocol
/// this handler was registered for. Implementations own the stream and
/// must close it on every exit path (spec §4.4).
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn handle(&self, peer: &str, stream: BoxedStream) -> Result<()>;
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connectedness(&self, peer: &str) -> Connectedness;

    /// Open a new outbound stream to `peer` on `protocol`.
    async fn open_stream(&self, peer: &str, protocol: &str) -> Result<BoxedStream>;

    /// Register (or replace) the handler invoked for inbound streams on
    /// `protocol`. Transports are expected to support exactly one handler
    /// per protocol at a time.
    async fn set_handler(&self, protocol: &str, handler: Arc<dyn StreamHandler>);
}
