//! OfflineStore (spec §4.5): durable per-recipient queue of undelivered
//! messages with attempt counters, expiry, and atomic JSON persistence.

use crate::config::Config;
use crate::error::{Result, XelvraError};
use crate::message::Message;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;

/// An entry is dropped after this many failed delivery attempts (spec §3).
pub const MAX_ATTEMPTS: u32 = 5;
/// Entries expire 7 days after creation (spec §3).
pub const ENTRY_TTL_DAYS: i64 = 7;
/// The sweep worker runs on this cadence (spec §4.5).
pub const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineEntry {
    pub message: Message,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl OfflineEntry {
    pub fn new(message: Message) -> Self {
        let created_at = Utc::now();
        OfflineEntry {
            message,
            attempts: 0,
            created_at,
            expires_at: created_at + ChronoDuration::days(ENTRY_TTL_DAYS),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Map from recipient identifier to their ordered queue of undelivered
/// messages, guarded by a single reader/writer lock (spec §5). Persisted to
/// `<config_dir>/offline_messages/messages.json`, rewritten atomically on
/// every mutation.
pub struct OfflineStore {
    config: Config,
    entries: RwLock<HashMap<String, Vec<OfflineEntry>>>,
    max_per_recipient: usize,
}

impl OfflineStore {
    /// Spec §4.5 flags the lack of a per-recipient cap as a gap implementers
    /// should close; this is that cap.
    pub const MAX_PER_RECIPIENT: usize = 1000;

    /// Load from disk, or start empty if the file doesn't exist yet. Does
    /// NOT reset `attempts` on recovered entries (spec §4.5 crash recovery).
    pub async fn load(config: Config) -> Result<Self> {
        let path = config.offline_store_path();
        let entries: HashMap<String, Vec<OfflineEntry>> = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| XelvraError::PersistenceError(e.to_string()))?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(XelvraError::PersistenceError(e.to_string())),
        };
        Ok(OfflineStore { config, entries: RwLock::new(entries), max_per_recipient: Self::MAX_PER_RECIPIENT })
    }

    /// `Store(message)`: append with `attempts=0`, persist under the write lock.
    pub async fn store(&self, message: Message) -> Result<()> {
        let recipient = message.to.clone();
        {
            let mut entries = self.entries.write().await;
            let list = entries.entry(recipient.clone()).or_default();
            if list.len() >= self.max_per_recipient {
                return Err(XelvraError::PersistenceError(format!(
                    "offline queue for {recipient} is at capacity ({})",
                    self.max_per_recipient
                )));
            }
            list.push(OfflineEntry::new(message));
        }
        self.persist().await
    }

    pub async fn pending_for(&self, recipient: &str) -> Vec<OfflineEntry> {
        self.entries.read().await.get(recipient).cloned().unwrap_or_default()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.values().all(|list| list.is_empty())
    }

    /// One sweep pass (spec §4.5): for every recipient `is_connected` reports
    /// reachable, attempt delivery of each entry in order via `deliver`.
    /// Delivered entries are removed; failures increment `attempts` and drop
    /// at `MAX_ATTEMPTS`; expired entries are dropped regardless of
    /// connectedness. Rewrites the persisted file once at the end.
    pub async fn sweep<C, CFut, F, Fut>(&self, is_connected: C, mut deliver: F) -> Result<()>
    where
        C: Fn(&str) -> CFut,
        CFut: std::future::Future<Output = bool>,
        F: FnMut(&Message) -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        {
            let mut entries = self.entries.write().await;
            let now = Utc::now();
            for (recipient, list) in entries.iter_mut() {
                if !is_connected(recipient).await {
                    list.retain(|entry| !entry.is_expired(now));
                    continue;
                }
                let mut remaining = Vec::with_capacity(list.len());
                for mut entry in list.drain(..) {
                    if entry.is_expired(now) {
                        log::warn!("offline entry {} to {} expired before delivery", entry.message.id, recipient);
                        continue;
                    }
                    if deliver(&entry.message).await {
                        continue;
                    }
                    entry.attempts += 1;
                    if entry.attempts >= MAX_ATTEMPTS {
                        log::warn!(
                            "dropping offline message {} to {} after {} failed attempts",
                            entry.message.id,
                            recipient,
                            entry.attempts
                        );
                        continue;
                    }
                    remaining.push(entry);
                }
                *list = remaining;
            }
            entries.retain(|_, list| !list.is_empty());
        }
        self.persist().await
    }

    async fn persist(&self) -> Result<()> {
        let json = {
            let entries = self.entries.read().await;
            serde_json::to_vec_pretty(&*entries).map_err(|e| XelvraError::PersistenceError(e.to_string()))?
        };
        let dir = self.config.offline_store_dir();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| XelvraError::PersistenceError(e.to_string()))?;
        let path = self.config.offline_store_path();
        write_atomic(&dir, &path, json).await
    }
}

/// Write-to-temp-then-rename, the same mechanism the pack's own
/// `qsfs-core::seal`/`unseal` use for atomic output (spec §9). Runs on a
/// blocking pool since `tempfile`'s API is synchronous.
async fn write_atomic(dir: &Path, path: &Path, bytes: Vec<u8>) -> Result<()> {
    let dir = dir.to_path_buf();
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<()> {
        use std::io::Write;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| XelvraError::PersistenceError(e.to_string()))?;
        tmp.write_all(&bytes).map_err(|e| XelvraError::PersistenceError(e.to_string()))?;
        tmp.as_file_mut().sync_all().map_err(|e| XelvraError::PersistenceError(e.to_string()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o600))
                .map_err(|e| XelvraError::PersistenceError(e.to_string()))?;
        }
        tmp.persist(&path).map_err(|e| XelvraError::PersistenceError(e.error.to_string()))?;
        Ok(())
    })
    .await
    .map_err(|e| XelvraError::PersistenceError(e.to_string()))??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn msg(to: &str) -> Message {
        Message::new("did:xelvra:alice", to, MessageKind::Text, b"hi".to_vec())
    }

    #[tokio::test]
    async fn store_then_sweep_delivers_in_order_and_empties_the_queue() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path());
        let store = OfflineStore::load(config).await.unwrap();

        store.store(msg("did:xelvra:bob")).await.unwrap();
        store.store(msg("did:xelvra:bob")).await.unwrap();
        assert_eq!(store.pending_for("did:xelvra:bob").await.len(), 2);

        let delivered_order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let order = delivered_order.clone();
        store
            .sweep(|_| async { true }, move |m| {
                order.lock().unwrap().push(m.id);
                async { true }
            })
            .await
            .unwrap();

        assert!(store.is_empty().await);
        assert_eq!(delivered_order.lock().unwrap().len(), 2);

        let persisted = tokio::fs::read_to_string(dir.path().join("offline_messages/messages.json"))
            .await
            .unwrap();
        let parsed: HashMap<String, Vec<OfflineEntry>> = serde_json::from_str(&persisted).unwrap();
        assert!(parsed.values().all(|v| v.is_empty()) || parsed.is_empty());
    }

    #[tokio::test]
    async fn failed_deliveries_increment_attempts_and_drop_after_max() {
        let dir = tempfile::tempdir().unwrap();
        let store = OfflineStore::load(Config::new(dir.path())).await.unwrap();
        store.store(msg("did:xelvra:bob")).await.unwrap();

        let attempts = Arc::new(AtomicUsize::new(0));
        for _ in 0..MAX_ATTEMPTS {
            let counter = attempts.clone();
            store
                .sweep(|_| async { true }, move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { false }
                })
                .await
                .unwrap();
        }

        assert_eq!(attempts.load(Ordering::SeqCst), MAX_ATTEMPTS as usize);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn disconnected_recipient_is_left_queued() {
        let dir = tempfile::tempdir().unwrap();
        let store = OfflineStore::load(Config::new(dir.path())).await.unwrap();
        store.store(msg("did:xelvra:bob")).await.unwrap();

        store.sweep(|_| async { false }, |_| async { true }).await.unwrap();
        assert_eq!(store.pending_for("did:xelvra:bob").await.len(), 1);
    }

    #[tokio::test]
    async fn per_recipient_cap_rejects_further_enqueues() {
        let dir = tempfile::tempdir().unwrap();
        let store = OfflineStore::load(Config::new(dir.path())).await.unwrap();
        for _ in 0..OfflineStore::MAX_PER_RECIPIENT {
            store.store(msg("did:xelvra:bob")).await.unwrap();
        }
        assert!(store.store(msg("did:xelvra:bob")).await.is_err());
    }
}
