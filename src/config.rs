//! Filesystem layout for the files this crate is allowed to own.
//!
//! Per the spec, the core owns exactly two persisted paths: the offline
//! message queue and the downloads directory for completed file transfers.
//! Everything else (status files, logs, discovery caches) belongs to the
//! external collaborators that embed this crate.

use std::path::{Path, PathBuf};

/// Default top-level directory name when the caller doesn't override it.
const DEFAULT_DIR_NAME: &str = ".xelvra";

#[derive(Debug, Clone)]
pub struct Config {
    config_dir: PathBuf,
}

impl Config {
    /// Build a config rooted at an explicit directory.
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Config { config_dir: config_dir.into() }
    }

    /// Resolve the default per-user config directory (`~/.xelvra`).
    ///
    /// Falls back to `./.xelvra` if the platform home directory can't be
    /// determined, mirroring the teacher's own fallback-to-`.` convention
    /// for its downloads/storage directories.
    pub fn default_dir() -> Self {
        let base = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Config { config_dir: base.join(DEFAULT_DIR_NAME) }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn offline_store_dir(&self) -> PathBuf {
        self.config_dir.join("offline_messages")
    }

    pub fn offline_store_path(&self) -> PathBuf {
        self.offline_store_dir().join("messages.json")
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.config_dir.join("downloads")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_dir()
    }
}
