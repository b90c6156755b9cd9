//! MessageEngine (spec §4.4): wires identity, transport, offline queue and
//! per-kind handlers into the `Start`/`Stop`/`Send`/`RegisterHandler` surface.

use crate::codec;
use crate::error::{Result, XelvraError};
use crate::file_transfer::{FileControlFrame, FileMetadata, FileTransferManager, FrameType};
use crate::identity::{Identity, KeyDirectory};
use crate::message::{Message, MessageKind};
use crate::offline::OfflineStore;
use crate::transport::{BoxedStream, Connectedness, StreamHandler, Transport};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

/// Protocol identifiers (spec §6). Group messaging is a reserved identifier
/// only — no handler is ever registered for it (spec Non-goals).
pub const MESSAGE_PROTOCOL: &str = "/xelvra/message/1.0.0";
pub const FILE_PROTOCOL: &str = "/xelvra/file/1.0.0";
pub const GROUP_PROTOCOL: &str = "/xelvra/group/1.0.0";

const OUTBOUND_CHANNEL_CAPACITY: usize = 100;
/// Per-message send timeout (spec §5): a stalled stream degrades to the
/// offline store rather than blocking the outbound dispatcher indefinitely.
const MESSAGE_SEND_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);
/// Per-file-transfer stream timeout (spec §5), matching
/// `file_transfer::TRANSFER_TIMEOUT`.
const FILE_TRANSFER_TIMEOUT: std::time::Duration = crate::file_transfer::TRANSFER_TIMEOUT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// Delivered to whatever handler is registered for an inbound message's kind.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> Result<()>;
}

/// The running engine's state machine and background workers (spec §4.4,
/// §5): an inbound stream handler registered with the transport, an
/// outbound dispatcher draining a bounded channel, and an offline sweeper on
/// a fixed cadence. Each worker's `JoinHandle` is kept so `stop` can detect
/// and report a panic rather than silently losing the task.
pub struct MessageEngine {
    identity: Arc<dyn Identity>,
    transport: Arc<dyn Transport>,
    key_directory: Arc<dyn KeyDirectory>,
    offline: Arc<OfflineStore>,
    file_transfer: Arc<FileTransferManager>,
    handlers: Arc<RwLock<HashMap<MessageKind, Arc<dyn MessageHandler>>>>,
    state: RwLock<EngineState>,
    outbound_tx: RwLock<Option<mpsc::Sender<Message>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl MessageEngine {
    pub fn new(
        identity: Arc<dyn Identity>,
        transport: Arc<dyn Transport>,
        key_directory: Arc<dyn KeyDirectory>,
        offline: Arc<OfflineStore>,
        file_transfer: Arc<FileTransferManager>,
    ) -> Self {
        MessageEngine {
            identity,
            transport,
            key_directory,
            offline,
            file_transfer,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            state: RwLock::new(EngineState::Idle),
            outbound_tx: RwLock::new(None),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub async fn register_handler(&self, kind: MessageKind, handler: Arc<dyn MessageHandler>) {
        self.handlers.write().await.insert(kind, handler);
    }

    /// `Idle -> Running`: registers the inbound stream handlers (text and
    /// file protocols) and spawns the outbound dispatcher and offline
    /// sweeper. Only valid from `Idle`.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != EngineState::Idle {
                return Err(XelvraError::Stopped);
            }
            *state = EngineState::Running;
        }

        let inbound = Arc::new(InboundMessageHandler {
            key_directory: self.key_directory.clone(),
            handlers: self.handlers.clone(),
        });
        self.transport.set_handler(MESSAGE_PROTOCOL, inbound).await;

        let file_inbound = Arc::new(InboundFileHandler { file_transfer: self.file_transfer.clone() });
        self.transport.set_handler(FILE_PROTOCOL, file_inbound).await;

        let (tx, rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        *self.outbound_tx.write().await = Some(tx);

        let outbound = {
            let engine = self.clone();
            tokio::spawn(async move { engine.run_outbound_dispatcher(rx).await })
        };
        let sweeper = {
            let engine = self.clone();
            tokio::spawn(async move { engine.run_offline_sweeper().await })
        };

        let mut workers = self.workers.lock().await;
        workers.push(outbound);
        workers.push(sweeper);
        Ok(())
    }

    /// `Running -> Stopping -> Stopped`: closes the outbound channel so the
    /// dispatcher drains and exits, aborts the sweeper (it only ever idles
    /// between ticks), and joins every worker. A worker that panicked is
    /// logged, not propagated — `stop` always completes.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != EngineState::Running {
                return Err(XelvraError::Stopped);
            }
            *state = EngineState::Stopping;
        }

        self.outbound_tx.write().await.take();

        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock().await);
        for worker in workers {
            worker.abort();
            match worker.await {
                Ok(()) => {}
                Err(join_err) if join_err.is_cancelled() => {}
                Err(join_err) if join_err.is_panic() => {
                    log::error!("message engine worker panicked: {join_err}");
                }
                Err(join_err) => log::error!("message engine worker join error: {join_err}"),
            }
        }

        *self.state.write().await = EngineState::Stopped;
        Ok(())
    }

    /// `Send`: sign the message and hand it to the outbound channel. A full
    /// channel reports `QueueFull` rather than blocking the caller; a
    /// non-`Running` engine reports `Stopped`.
    pub async fn send(&self, to: &str, kind: MessageKind, content: Vec<u8>) -> Result<()> {
        if *self.state.read().await != EngineState::Running {
            return Err(XelvraError::Stopped);
        }
        let mut message = Message::new(self.identity.did(), to, kind, content);
        codec::sign(self.identity.as_ref(), &mut message).await;

        let guard = self.outbound_tx.read().await;
        let tx = guard.as_ref().ok_or(XelvraError::Stopped)?;
        tx.try_send(message).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => XelvraError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => XelvraError::Stopped,
        })
    }

    /// Initiator side of the file-transfer sub-protocol (spec §4.6): opens a
    /// stream on `FILE_PROTOCOL`, writes `request`, waits for `accept`/
    /// `reject` on the same stream, and on acceptance streams every chunk
    /// followed by `complete`. The whole exchange is bounded by
    /// `FILE_TRANSFER_TIMEOUT`, mirroring `deliver_now`'s per-message bound.
    pub async fn send_file(&self, peer: &str, source_path: PathBuf, metadata: FileMetadata) -> Result<()> {
        if *self.state.read().await != EngineState::Running {
            return Err(XelvraError::Stopped);
        }
        match tokio::time::timeout(FILE_TRANSFER_TIMEOUT, self.send_file_inner(peer, source_path, metadata)).await {
            Ok(result) => result,
            Err(_) => Err(XelvraError::TransferExpired),
        }
    }

    async fn send_file_inner(&self, peer: &str, source_path: PathBuf, metadata: FileMetadata) -> Result<()> {
        let request = self.file_transfer.initiate_send(peer, source_path, metadata.clone()).await?;
        let mut stream = self.transport.open_stream(peer, FILE_PROTOCOL).await?;
        write_file_frame(&mut stream, &request).await?;

        let reply = read_file_frame(&mut stream).await?;
        match reply.frame_type {
            FrameType::Accept => self.file_transfer.handle_accept(metadata.id).await?,
            FrameType::Reject => {
                self.file_transfer.handle_reject(metadata.id, reply.reason.clone()).await?;
                return Err(XelvraError::TransferAborted);
            }
            _ => return Err(XelvraError::TransferAborted),
        }

        while let Some((chunk_id, data)) = self.file_transfer.read_next_chunk(metadata.id).await? {
            write_file_frame(&mut stream, &FileControlFrame::chunk(chunk_id, data)).await?;
        }
        write_file_frame(&mut stream, &FileControlFrame::complete()).await?;
        stream.shutdown().await.ok();
        Ok(())
    }

    async fn run_outbound_dispatcher(self: Arc<Self>, mut rx: mpsc::Receiver<Message>) {
        while let Some(message) = rx.recv().await {
            if let Err(err) = self.route_or_queue(message).await {
                log::warn!("failed to route or queue outbound message: {err}");
            }
        }
    }

    /// Route-or-queue (spec §4.4): send immediately if the recipient is
    /// connected, otherwise fall back to the offline store. A mid-send
    /// transport failure also falls back rather than dropping the message.
    async fn route_or_queue(&self, message: Message) -> Result<()> {
        if self.transport.connectedness(&message.to).await == Connectedness::Connected {
            if self.deliver_now(&message).await.is_ok() {
                return Ok(());
            }
        }
        self.offline.store(message).await
    }

    async fn deliver_now(&self, message: &Message) -> Result<()> {
        match tokio::time::timeout(MESSAGE_SEND_TIMEOUT, self.deliver_now_inner(message)).await {
            Ok(result) => result,
            Err(_) => Err(XelvraError::TransportDisconnected),
        }
    }

    async fn deliver_now_inner(&self, message: &Message) -> Result<()> {
        let mut stream = self.transport.open_stream(&message.to, MESSAGE_PROTOCOL).await?;
        let payload = codec::encode_message(message)?;
        codec::write_frame(&mut stream, &payload, codec::TEXT_FRAME_MAX).await?;
        stream.shutdown().await.ok();
        Ok(())
    }

    async fn run_offline_sweeper(self: Arc<Self>) {
        let mut interval = tokio::time::interval(crate::offline::SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            let result = self
                .offline
                .sweep(
                    |recipient| {
                        let transport = self.transport.clone();
                        let recipient = recipient.to_string();
                        async move { transport.connectedness(&recipient).await == Connectedness::Connected }
                    },
                    |message| {
                        let engine = self.clone();
                        let message = message.clone();
                        async move { engine.deliver_now(&message).await.is_ok() }
                    },
                )
                .await;
            if let Err(err) = result {
                log::error!("offline sweep failed: {err}");
            }
        }
    }
}

/// Registered for `MESSAGE_PROTOCOL`: reads exactly one frame per inbound
/// stream (mirroring the outbound dispatcher's one-frame-per-stream
/// convention), verifies the signature, and routes by kind. An unsigned or
/// unverifiable envelope is dropped without failing the stream; a kind with
/// no registered handler is dropped with a warning (spec §4.4).
struct InboundMessageHandler {
    key_directory: Arc<dyn KeyDirectory>,
    handlers: Arc<RwLock<HashMap<MessageKind, Arc<dyn MessageHandler>>>>,
}

#[async_trait]
impl StreamHandler for InboundMessageHandler {
    async fn handle(&self, peer: &str, mut stream: BoxedStream) -> Result<()> {
        let payload = codec::read_frame(&mut stream, codec::TEXT_FRAME_MAX).await?;
        let message = match codec::decode_message(&payload) {
            Ok(m) => m,
            Err(err) => {
                log::warn!("dropping malformed message from {peer}: {err}");
                return Ok(());
            }
        };
        if let Err(err) = codec::verify(&message, self.key_directory.as_ref()) {
            log::warn!("dropping unverifiable message {} from {peer}: {err}", message.id);
            return Ok(());
        }

        let handler = self.handlers.read().await.get(&message.kind).cloned();
        match handler {
            Some(handler) => {
                if let Err(err) = handler.handle(message).await {
                    log::warn!("message handler returned an error: {err}");
                }
            }
            None => log::warn!("no handler registered for message kind, dropping"),
        }
        Ok(())
    }
}

/// Write one `FileControlFrame` as wire JSON through `codec::write_frame`.
/// `chunk` frames carry base64-encoded file data and need the larger
/// `FILE_CHUNK_FRAME_MAX`; every other frame type fits comfortably under
/// `FILE_CONTROL_FRAME_MAX` and is written with that tighter limit.
async fn write_file_frame<S: tokio::io::AsyncWrite + Unpin>(stream: &mut S, frame: &FileControlFrame) -> Result<()> {
    let payload = serde_json::to_vec(frame)?;
    let max = if frame.frame_type == FrameType::Chunk { codec::FILE_CHUNK_FRAME_MAX } else { codec::FILE_CONTROL_FRAME_MAX };
    codec::write_frame(stream, &payload, max).await
}

/// Read one `FileControlFrame`, always against the chunk-capable limit (the
/// frame's type isn't known until after the payload is decoded). Non-chunk
/// frames are then re-checked against the tighter `FILE_CONTROL_FRAME_MAX`,
/// so a control frame that somehow ballooned past its own cap is still
/// rejected rather than silently accepted at the chunk ceiling.
async fn read_file_frame<S: tokio::io::AsyncRead + Unpin>(stream: &mut S) -> Result<FileControlFrame> {
    let payload = codec::read_frame(stream, codec::FILE_CHUNK_FRAME_MAX).await?;
    let frame: FileControlFrame = serde_json::from_slice(&payload)?;
    frame.validate_magic()?;
    if frame.frame_type != FrameType::Chunk && payload.len() as u32 >= codec::FILE_CONTROL_FRAME_MAX {
        return Err(XelvraError::FrameTooLarge { len: payload.len() as u32, max: codec::FILE_CONTROL_FRAME_MAX });
    }
    Ok(frame)
}

/// Registered for `FILE_PROTOCOL`: receiver side of the chunked file-transfer
/// sub-protocol (spec §4.6). One inbound stream carries a whole transfer —
/// `request` (replied to with `accept`/`reject`), then every `chunk`, then
/// `complete`. Any frame-level or transfer error ends the stream; the
/// transfer itself is left in whatever state `FileTransferManager` recorded
/// (typically `Failed`, via its own `fail_transfer`/`handle_complete` paths).
struct InboundFileHandler {
    file_transfer: Arc<FileTransferManager>,
}

#[async_trait]
impl StreamHandler for InboundFileHandler {
    async fn handle(&self, peer: &str, mut stream: BoxedStream) -> Result<()> {
        let request = read_file_frame(&mut stream).await?;
        let metadata = match request.frame_type {
            FrameType::Request => match request.metadata.clone() {
                Some(metadata) => metadata,
                None => {
                    log::warn!("dropping file request from {peer} with no metadata");
                    return Ok(());
                }
            },
            other => {
                log::warn!("expected a file `request` frame from {peer}, got {other:?}");
                return Ok(());
            }
        };

        let reply = self.file_transfer.handle_request(peer, metadata.clone()).await?;
        let accepted = reply.frame_type == FrameType::Accept;
        write_file_frame(&mut stream, &reply).await?;
        if !accepted {
            return Ok(());
        }

        loop {
            let frame = match read_file_frame(&mut stream).await {
                Ok(frame) => frame,
                Err(err) => {
                    log::warn!("file stream from {peer} for transfer {} ended early: {err}", metadata.id);
                    return Ok(());
                }
            };
            match frame.frame_type {
                FrameType::Chunk => {
                    let chunk_id = frame.chunk_id.ok_or(XelvraError::BadMagic)?;
                    let data = frame.data.unwrap_or_default();
                    if let Err(err) = self.file_transfer.handle_chunk(metadata.id, chunk_id, &data).await {
                        log::warn!("failed to write chunk {chunk_id} for transfer {}: {err}", metadata.id);
                        return Ok(());
                    }
                }
                FrameType::Complete => {
                    if let Err(err) = self.file_transfer.handle_complete(metadata.id).await {
                        log::warn!("file transfer {} from {peer} failed to finalize: {err}", metadata.id);
                    }
                    return Ok(());
                }
                other => {
                    log::warn!("unexpected file frame {other:?} from {peer} mid-transfer, dropping stream");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Ed25519Identity, InMemoryKeyDirectory};
    use crate::testing::InMemoryNetwork;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;

    struct CountingHandler {
        count: StdArc<AtomicUsize>,
    }

    #[async_trait]
    impl MessageHandler for CountingHandler {
        async fn handle(&self, _message: Message) -> Result<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn connected_peer_receives_message_immediately() {
        let network = InMemoryNetwork::new();
        let directory = StdArc::new(InMemoryKeyDirectory::new());
        let cfg_a = tempfile::tempdir().unwrap();
        let cfg_b = tempfile::tempdir().unwrap();

        let alice_identity = Ed25519Identity::generate("did:xelvra:alice");
        directory.register("did:xelvra:alice", alice_identity.verifying_key());
        let alice_transport = network.register("did:xelvra:alice").await;
        let alice_offline = StdArc::new(OfflineStore::load(crate::config::Config::new(cfg_a.path())).await.unwrap());
        let alice_files = StdArc::new(crate::file_transfer::FileTransferManager::new(crate::config::Config::new(cfg_a.path())));
        let alice = StdArc::new(MessageEngine::new(StdArc::new(alice_identity), alice_transport, directory.clone(), alice_offline, alice_files));

        let bob_identity = Ed25519Identity::generate("did:xelvra:bob");
        directory.register("did:xelvra:bob", bob_identity.verifying_key());
        let bob_transport = network.register("did:xelvra:bob").await;
        let bob_offline = StdArc::new(OfflineStore::load(crate::config::Config::new(cfg_b.path())).await.unwrap());
        let bob_files = StdArc::new(crate::file_transfer::FileTransferManager::new(crate::config::Config::new(cfg_b.path())));
        let bob = StdArc::new(MessageEngine::new(StdArc::new(bob_identity), bob_transport, directory.clone(), bob_offline, bob_files));

        let received = StdArc::new(AtomicUsize::new(0));
        bob.register_handler(MessageKind::Text, StdArc::new(CountingHandler { count: received.clone() })).await;

        alice.start().await.unwrap();
        bob.start().await.unwrap();

        alice.send("did:xelvra:bob", MessageKind::Text, b"hello bob".to_vec()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(received.load(Ordering::SeqCst), 1);
        assert!(bob.offline.is_empty().await);

        alice.stop().await.unwrap();
        bob.stop().await.unwrap();
    }

    #[tokio::test]
    async fn disconnected_peer_gets_queued_offline() {
        let network = InMemoryNetwork::new();
        let directory = StdArc::new(InMemoryKeyDirectory::new());
        let cfg_a = tempfile::tempdir().unwrap();

        let alice_identity = Ed25519Identity::generate("did:xelvra:alice");
        directory.register("did:xelvra:alice", alice_identity.verifying_key());
        let alice_transport = network.register("did:xelvra:alice").await;
        let alice_offline = StdArc::new(OfflineStore::load(crate::config::Config::new(cfg_a.path())).await.unwrap());
        let alice_files = StdArc::new(crate::file_transfer::FileTransferManager::new(crate::config::Config::new(cfg_a.path())));
        let alice = StdArc::new(MessageEngine::new(StdArc::new(alice_identity), alice_transport, directory.clone(), alice_offline.clone(), alice_files));

        alice.start().await.unwrap();
        alice.send("did:xelvra:ghost", MessageKind::Text, b"nobody home".to_vec()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert_eq!(alice_offline.pending_for("did:xelvra:ghost").await.len(), 1);
        alice.stop().await.unwrap();
    }

    #[tokio::test]
    async fn send_file_delivers_and_materializes_the_destination() {
        use crate::file_transfer::{FileMetadata, FileTransferManager, TransferStatus};
        use sha2::{Digest, Sha256};

        let network = InMemoryNetwork::new();
        let directory = StdArc::new(InMemoryKeyDirectory::new());
        let cfg_a = tempfile::tempdir().unwrap();
        let cfg_b = tempfile::tempdir().unwrap();
        let src_dir = tempfile::tempdir().unwrap();

        let alice_identity = Ed25519Identity::generate("did:xelvra:alice");
        directory.register("did:xelvra:alice", alice_identity.verifying_key());
        let alice_transport = network.register("did:xelvra:alice").await;
        let alice_offline = StdArc::new(OfflineStore::load(crate::config::Config::new(cfg_a.path())).await.unwrap());
        let alice_files = StdArc::new(FileTransferManager::new(crate::config::Config::new(cfg_a.path())));
        let alice = StdArc::new(MessageEngine::new(StdArc::new(alice_identity), alice_transport, directory.clone(), alice_offline, alice_files));

        let bob_identity = Ed25519Identity::generate("did:xelvra:bob");
        directory.register("did:xelvra:bob", bob_identity.verifying_key());
        let bob_transport = network.register("did:xelvra:bob").await;
        let bob_offline = StdArc::new(OfflineStore::load(crate::config::Config::new(cfg_b.path())).await.unwrap());
        let bob_config = crate::config::Config::new(cfg_b.path());
        let bob_files = StdArc::new(FileTransferManager::new(bob_config.clone()));
        let bob = StdArc::new(MessageEngine::new(StdArc::new(bob_identity), bob_transport, directory.clone(), bob_offline, bob_files));

        alice.start().await.unwrap();
        bob.start().await.unwrap();

        let payload: Vec<u8> = (0..200 * 1024usize).map(|i| (i % 251) as u8).collect();
        let src_path = src_dir.path().join("report.bin");
        tokio::fs::write(&src_path, &payload).await.unwrap();
        let mut hasher = Sha256::new();
        hasher.update(&payload);
        let sha256 = hex::encode(hasher.finalize());

        let metadata = FileMetadata {
            id: uuid::Uuid::new_v4(),
            name: "report.bin".into(),
            size: payload.len() as u64,
            mime: "application/octet-stream".into(),
            sha256,
            chunk_size: 64 * 1024,
        };

        alice.send_file("did:xelvra:bob", src_path, metadata.clone()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        assert!(matches!(bob.file_transfer.status(metadata.id).await, Some(TransferStatus::Completed)));
        let written = tokio::fs::read(bob_config.downloads_dir().join("report.bin")).await.unwrap();
        assert_eq!(written, payload);

        alice.stop().await.unwrap();
        bob.stop().await.unwrap();
    }
}
