//! FileTransfer (spec §4.6): the chunked request/accept/chunk/complete
//! sub-protocol, per-transfer session state, and destination materialization.

use crate::error::{Result, XelvraError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::Config;

/// Fixed magic number every control frame must carry; absence or mismatch
/// is fatal to the frame (spec §4.6, §7 `BadMagic`).
pub const MAGIC: u32 = 0x5845_4C56; // b"XELV" read as a big-endian u32

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
pub const MAX_CHUNK_SIZE: usize = 64 * 1024;
pub const MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Per-transfer stream timeout (spec §5). This module manages transfer
/// state only; whatever wires a session's frames to a live `Transport`
/// stream is expected to bound its reads/writes by this constant, the same
/// way `engine::MESSAGE_SEND_TIMEOUT` bounds a single message send.
pub const TRANSFER_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5 * 60);

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    pub id: Uuid,
    pub name: String,
    pub size: u64,
    pub mime: String,
    pub sha256: String,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl FileMetadata {
    pub fn total_chunks(&self) -> u64 {
        if self.size == 0 {
            return 0;
        }
        (self.size + self.chunk_size as u64 - 1) / self.chunk_size as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameType {
    Request,
    Accept,
    Reject,
    Chunk,
    Complete,
}

mod opt_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => serializer.serialize_str(&STANDARD.encode(b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        let opt = Option::<String>::deserialize(deserializer)?;
        opt.map(|s| STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)).transpose()
    }
}

/// The wire schema for every file-control frame (spec §6): one JSON object,
/// `type`-tagged, carrying whichever fields that type needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileControlFrame {
    pub magic: u32,
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub chunk_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default, with = "opt_base64")]
    pub data: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub metadata: Option<FileMetadata>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reason: Option<String>,
}

impl FileControlFrame {
    pub fn request(metadata: FileMetadata) -> Self {
        FileControlFrame { magic: MAGIC, frame_type: FrameType::Request, chunk_id: None, data: None, metadata: Some(metadata), reason: None }
    }

    pub fn accept() -> Self {
        FileControlFrame { magic: MAGIC, frame_type: FrameType::Accept, chunk_id: None, data: None, metadata: None, reason: None }
    }

    pub fn reject(reason: Option<String>) -> Self {
        FileControlFrame { magic: MAGIC, frame_type: FrameType::Reject, chunk_id: None, data: None, metadata: None, reason }
    }

    pub fn chunk(chunk_id: u64, data: Vec<u8>) -> Self {
        FileControlFrame { magic: MAGIC, frame_type: FrameType::Chunk, chunk_id: Some(chunk_id), data: Some(data), metadata: None, reason: None }
    }

    pub fn complete() -> Self {
        FileControlFrame { magic: MAGIC, frame_type: FrameType::Complete, chunk_id: None, data: None, metadata: None, reason: None }
    }

    pub fn validate_magic(&self) -> Result<()> {
        if self.magic != MAGIC {
            Err(XelvraError::BadMagic)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// The five statuses named in spec §3. The receiver/initiator state
/// machines in spec §4.6 describe an intermediate "Offered" step between
/// `Pending` and `Active` — since the current policy auto-accepts every
/// transfer (spec §4.6, §9), that step resolves to `Active` immediately and
/// is never independently observable, so it is not a sixth status here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    Active,
    Completed,
    Failed,
    Cancelled,
}

/// Per-transfer session state (spec §3). Reaches `Completed` only when
/// `bytes_done == metadata.size` and every chunk id is present in
/// `chunks_acked` — enforced in `FileTransferManager::handle_complete`.
pub struct FileTransferSession {
    pub id: Uuid,
    pub peer: String,
    pub metadata: FileMetadata,
    pub direction: Direction,
    pub status: TransferStatus,
    pub chunks_acked: HashSet<u64>,
    pub bytes_done: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    local_path: PathBuf,
}

impl FileTransferSession {
    pub fn is_complete(&self) -> bool {
        self.bytes_done == self.metadata.size && self.chunks_acked.len() as u64 == self.metadata.total_chunks()
    }

    pub fn progress(&self) -> f64 {
        if self.metadata.size == 0 {
            return 1.0;
        }
        self.bytes_done as f64 / self.metadata.size as f64
    }
}

/// Decides whether an inbound transfer offer is accepted. The current core
/// ships only the accept-all policy spec §4.6/§9 name as today's behavior;
/// the trait seam is where a future prompt/allowlist hook attaches.
pub trait TransferPolicy: Send + Sync {
    fn accept(&self, peer: &str, metadata: &FileMetadata) -> bool;
}

pub struct AcceptAll;
impl TransferPolicy for AcceptAll {
    fn accept(&self, _peer: &str, _metadata: &FileMetadata) -> bool {
        true
    }
}

/// The file-transfer registry: transfer id -> session, guarded by a
/// reader/writer lock (spec §5).
pub struct FileTransferManager {
    config: Config,
    policy: Arc<dyn TransferPolicy>,
    transfers: RwLock<HashMap<Uuid, FileTransferSession>>,
}

impl FileTransferManager {
    pub fn new(config: Config) -> Self {
        Self::with_policy(config, Arc::new(AcceptAll))
    }

    pub fn with_policy(config: Config, policy: Arc<dyn TransferPolicy>) -> Self {
        FileTransferManager { config, policy, transfers: RwLock::new(HashMap::new()) }
    }

    /// Initiator side: register a new outbound transfer and build the
    /// `request` frame to send.
    pub async fn initiate_send(&self, peer: &str, source_path: PathBuf, metadata: FileMetadata) -> Result<FileControlFrame> {
        if metadata.size > MAX_FILE_SIZE {
            return Err(XelvraError::TransferAborted);
        }
        if metadata.chunk_size > MAX_CHUNK_SIZE {
            return Err(XelvraError::TransferAborted);
        }
        let session = FileTransferSession {
            id: metadata.id,
            peer: peer.to_string(),
            metadata: metadata.clone(),
            direction: Direction::Out,
            status: TransferStatus::Pending,
            chunks_acked: HashSet::new(),
            bytes_done: 0,
            started_at: Utc::now(),
            ended_at: None,
            error: None,
            local_path: source_path,
        };
        self.transfers.write().await.insert(session.id, session);
        Ok(FileControlFrame::request(metadata))
    }

    /// Receiver side: handle an inbound `request` frame. Validates limits,
    /// consults `policy`, and on acceptance materializes the destination
    /// file under `<config_dir>/downloads/<name>` (spec §4.6).
    pub async fn handle_request(&self, peer: &str, metadata: FileMetadata) -> Result<FileControlFrame> {
        if metadata.size > MAX_FILE_SIZE || metadata.chunk_size > MAX_CHUNK_SIZE {
            return Ok(FileControlFrame::reject(Some("transfer exceeds size limits".into())));
        }
        if !self.policy.accept(peer, &metadata) {
            return Ok(FileControlFrame::reject(Some("rejected by policy".into())));
        }

        let downloads_dir = self.config.downloads_dir();
        tokio::fs::create_dir_all(&downloads_dir).await?;
        let dest = unique_destination(&downloads_dir, &metadata.name).await;
        let file = tokio::fs::File::create(&dest).await?;
        file.set_len(metadata.size).await?;

        let session = FileTransferSession {
            id: metadata.id,
            peer: peer.to_string(),
            metadata: metadata.clone(),
            direction: Direction::In,
            status: TransferStatus::Active,
            chunks_acked: HashSet::new(),
            bytes_done: 0,
            started_at: Utc::now(),
            ended_at: None,
            error: None,
            local_path: dest,
        };
        self.transfers.write().await.insert(session.id, session);
        Ok(FileControlFrame::accept())
    }

    /// Initiator side: remote accepted, transition to `Active`.
    pub async fn handle_accept(&self, transfer_id: Uuid) -> Result<()> {
        let mut transfers = self.transfers.write().await;
        let session = transfers.get_mut(&transfer_id).ok_or(XelvraError::TransferAborted)?;
        session.status = TransferStatus::Active;
        Ok(())
    }

    /// Initiator side: remote rejected, transition to `Failed`.
    pub async fn handle_reject(&self, transfer_id: Uuid, reason: Option<String>) -> Result<()> {
        let mut transfers = self.transfers.write().await;
        let session = transfers.get_mut(&transfer_id).ok_or(XelvraError::TransferAborted)?;
        session.status = TransferStatus::Failed;
        session.ended_at = Some(Utc::now());
        session.error = Some(reason.unwrap_or_else(|| "rejected by peer".into()));
        Ok(())
    }

    /// Initiator side: read the next `chunk_size` slab for `transfer_id`.
    /// Returns `None` once every chunk has been read.
    pub async fn read_next_chunk(&self, transfer_id: Uuid) -> Result<Option<(u64, Vec<u8>)>> {
        let (path, chunk_size, total_chunks, next_id) = {
            let transfers = self.transfers.read().await;
            let session = transfers.get(&transfer_id).ok_or(XelvraError::TransferAborted)?;
            (session.local_path.clone(), session.metadata.chunk_size, session.metadata.total_chunks(), session.chunks_acked.len() as u64)
        };
        if next_id >= total_chunks {
            return Ok(None);
        }
        let mut file = tokio::fs::File::open(&path).await?;
        file.seek(std::io::SeekFrom::Start(next_id * chunk_size as u64)).await?;
        let mut buf = vec![0u8; chunk_size];
        let n = file.read(&mut buf).await?;
        buf.truncate(n);
        {
            let mut transfers = self.transfers.write().await;
            if let Some(session) = transfers.get_mut(&transfer_id) {
                session.chunks_acked.insert(next_id);
                session.bytes_done += n as u64;
            }
        }
        Ok(Some((next_id, buf)))
    }

    /// Receiver side: write an inbound `chunk` frame to the destination file.
    pub async fn handle_chunk(&self, transfer_id: Uuid, chunk_id: u64, data: &[u8]) -> Result<()> {
        let (path, chunk_size) = {
            let transfers = self.transfers.read().await;
            let session = transfers.get(&transfer_id).ok_or(XelvraError::TransferAborted)?;
            (session.local_path.clone(), session.metadata.chunk_size)
        };
        let mut file = tokio::fs::OpenOptions::new().write(true).open(&path).await?;
        file.seek(std::io::SeekFrom::Start(chunk_id * chunk_size as u64)).await?;
        file.write_all(data).await?;
        file.flush().await?;

        let mut transfers = self.transfers.write().await;
        if let Some(session) = transfers.get_mut(&transfer_id) {
            session.chunks_acked.insert(chunk_id);
            session.bytes_done += data.len() as u64;
        }
        Ok(())
    }

    /// Receiver side: the initiator sent `complete`. SHA-256 the destination
    /// file and compare to `metadata.sha256` (spec §4.6 REQUIRES this; the
    /// teacher's own source leaves it as a TODO, which this crate does not
    /// repeat). Mismatch deletes the partial file and fails the transfer.
    pub async fn handle_complete(&self, transfer_id: Uuid) -> Result<()> {
        let (path, expected_sha256, bytes_done, acked, total_chunks) = {
            let transfers = self.transfers.read().await;
            let session = transfers.get(&transfer_id).ok_or(XelvraError::TransferAborted)?;
            (session.local_path.clone(), session.metadata.sha256.clone(), session.bytes_done, session.chunks_acked.len() as u64, session.metadata.total_chunks())
        };

        if bytes_done != {
            let transfers = self.transfers.read().await;
            transfers.get(&transfer_id).ok_or(XelvraError::TransferAborted)?.metadata.size
        } || acked != total_chunks
        {
            return self.fail_transfer(transfer_id, &path, "transfer incomplete at finalize").await;
        }

        let actual_sha256 = sha256_file(&path).await?;
        if actual_sha256 != expected_sha256 {
            self.fail_transfer(transfer_id, &path, "integrity check failed").await?;
            return Err(XelvraError::IntegrityMismatch);
        }

        let mut transfers = self.transfers.write().await;
        if let Some(session) = transfers.get_mut(&transfer_id) {
            session.status = TransferStatus::Completed;
            session.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn fail_transfer(&self, transfer_id: Uuid, path: &Path, reason: &str) -> Result<()> {
        tokio::fs::remove_file(path).await.ok();
        let mut transfers = self.transfers.write().await;
        if let Some(session) = transfers.get_mut(&transfer_id) {
            session.status = TransferStatus::Failed;
            session.ended_at = Some(Utc::now());
            session.error = Some(reason.to_string());
        }
        Ok(())
    }

    pub async fn cancel(&self, transfer_id: Uuid) -> Result<()> {
        let mut transfers = self.transfers.write().await;
        if let Some(session) = transfers.get_mut(&transfer_id) {
            if session.direction == Direction::In && session.status != TransferStatus::Completed {
                tokio::fs::remove_file(&session.local_path).await.ok();
            }
            session.status = TransferStatus::Cancelled;
            session.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    pub async fn progress(&self, transfer_id: Uuid) -> Option<f64> {
        self.transfers.read().await.get(&transfer_id).map(|s| s.progress())
    }

    pub async fn status(&self, transfer_id: Uuid) -> Option<TransferStatus> {
        self.transfers.read().await.get(&transfer_id).map(|s| s.status)
    }
}

async fn unique_destination(dir: &Path, file_name: &str) -> PathBuf {
    let mut candidate = dir.join(file_name);
    let mut counter = 1u32;
    let stem = Path::new(file_name).file_stem().and_then(|s| s.to_str()).unwrap_or("file").to_string();
    let ext = Path::new(file_name).extension().and_then(|e| e.to_str()).map(|s| s.to_string());
    while tokio::fs::metadata(&candidate).await.is_ok() {
        candidate = match &ext {
            Some(ext) => dir.join(format!("{stem} ({counter}).{ext}")),
            None => dir.join(format!("{stem} ({counter})")),
        };
        counter += 1;
    }
    candidate
}

async fn sha256_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
