//! An in-memory `Transport` double used by this crate's own integration
//! tests. Not `#[cfg(test)]`-gated so the external test binary under
//! `tests/` can build against it too.

use crate::error::{Result, XelvraError};
use crate::transport::{BoxedStream, Connectedness, Stream, StreamHandler, Transport};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Once, Weak};
use tokio::sync::RwLock;

static LOG_INIT: Once = Once::new();

/// Every test that spins up an `InMemoryNetwork` gets a logger for free, so
/// `warn!`/`error!` output from the engine and offline store is visible when
/// a test fails (`RUST_LOG=xelvra_core=debug cargo test` for more detail).
fn init_test_logging() {
    LOG_INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

struct NetworkInner {
    peers: HashMap<String, Weak<InMemoryTransport>>,
    /// Explicit connectivity overrides. Absent entries default to connected
    /// as long as both peers are registered.
    links: HashMap<(String, String), bool>,
}

/// A hub every `InMemoryTransport` in a test routes through. Peers reach
/// each other by name; `set_connected` simulates a peer going offline.
pub struct InMemoryNetwork {
    inner: RwLock<NetworkInner>,
}

impl InMemoryNetwork {
    pub fn new() -> Arc<Self> {
        init_test_logging();
        Arc::new(InMemoryNetwork { inner: RwLock::new(NetworkInner { peers: HashMap::new(), links: HashMap::new() }) })
    }

    /// Register a new peer and return its `Transport` handle.
    pub async fn register(self: &Arc<Self>, name: impl Into<String>) -> Arc<InMemoryTransport> {
        let name = name.into();
        let transport = Arc::new(InMemoryTransport {
            name: name.clone(),
            network: Arc::downgrade(self),
            handlers: RwLock::new(HashMap::new()),
        });
        self.inner.write().await.peers.insert(name, Arc::downgrade(&transport));
        transport
    }

    /// Force the link between `a` and `b` to report connected/disconnected,
    /// overriding the registration-implies-connected default.
    pub async fn set_connected(&self, a: &str, b: &str, connected: bool) {
        let mut inner = self.inner.write().await;
        inner.links.insert(link_key(a, b), connected);
    }

    async fn connectedness(&self, from: &str, to: &str) -> Connectedness {
        let inner = self.inner.read().await;
        if !inner.peers.contains_key(to) {
            return Connectedness::NotConnected;
        }
        match inner.links.get(&link_key(from, to)) {
            Some(false) => Connectedness::NotConnected,
            _ => Connectedness::Connected,
        }
    }

    async fn handler_for(&self, peer: &str, protocol: &str) -> Option<Arc<dyn StreamHandler>> {
        let target = {
            let inner = self.inner.read().await;
            inner.peers.get(peer)?.upgrade()?
        };
        target.handlers.read().await.get(protocol).cloned()
    }
}

fn link_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

pub struct InMemoryTransport {
    name: String,
    network: Weak<InMemoryNetwork>,
    handlers: RwLock<HashMap<String, Arc<dyn StreamHandler>>>,
}

impl InMemoryTransport {
    fn network(&self) -> Result<Arc<InMemoryNetwork>> {
        self.network.upgrade().ok_or_else(|| XelvraError::StreamOpenFailed("network hub dropped".into()))
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn connectedness(&self, peer: &str) -> Connectedness {
        match self.network() {
            Ok(net) => net.connectedness(&self.name, peer).await,
            Err(_) => Connectedness::NotConnected,
        }
    }

    async fn open_stream(&self, peer: &str, protocol: &str) -> Result<BoxedStream> {
        let net = self.network()?;
        if net.connectedness(&self.name, peer).await != Connectedness::Connected {
            return Err(XelvraError::TransportDisconnected);
        }
        let handler = net
            .handler_for(peer, protocol)
            .await
            .ok_or_else(|| XelvraError::StreamOpenFailed(format!("{peer} has no handler for {protocol}")))?;

        let (local, remote) = tokio::io::duplex(64 * 1024);
        let from = self.name.clone();
        tokio::spawn(async move {
            let remote: BoxedStream = Box::new(remote);
            if let Err(err) = handler.handle(&from, remote).await {
                log::warn!("in-memory stream handler for {protocol} failed: {err}");
            }
        });
        let local: BoxedStream = Box::new(local);
        Ok(local)
    }

    async fn set_handler(&self, protocol: &str, handler: Arc<dyn StreamHandler>) {
        self.handlers.write().await.insert(protocol.to_string(), handler);
    }
}

// `tokio::io::DuplexStream` already satisfies `Stream`'s blanket impl.
const _: fn() = || {
    fn assert_stream<T: Stream>() {}
    assert_stream::<tokio::io::DuplexStream>();
};
