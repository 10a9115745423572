//! A single file transfer session.

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::identity::AppInfo;

/// Files offered by one application to whoever presents the key.
///
/// Held in an `Arc`: the manager's table holds one reference and every
/// in-flight operation holds another, so a stopped transfer is released
/// only after its last operation completes.
#[derive(Debug)]
pub struct FileTransfer {
    key: String,
    sender: String,
    app_info: AppInfo,
    writable: bool,
    autostop: bool,
    files: Mutex<Vec<PathBuf>>,
}

impl FileTransfer {
    pub(super) fn new(
        key: String,
        sender: String,
        app_info: AppInfo,
        writable: bool,
        autostop: bool,
    ) -> Self {
        Self {
            key,
            sender,
            app_info,
            writable,
            autostop,
            files: Mutex::new(Vec::new()),
        }
    }

    /// Opaque key identifying the transfer.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Unique name of the connection that started the transfer.
    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Identity of the owner.
    pub fn app_info(&self) -> &AppInfo {
        &self.app_info
    }

    /// Whether recipients get write access.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Whether the transfer ends after the first retrieval.
    pub fn is_autostop(&self) -> bool {
        self.autostop
    }

    /// Snapshot of the files added so far, in insertion order.
    pub fn files(&self) -> Vec<PathBuf> {
        self.lock_files().clone()
    }

    /// Number of files added so far.
    pub fn len(&self) -> usize {
        self.lock_files().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_files().is_empty()
    }

    pub(super) fn append(&self, paths: Vec<PathBuf>) -> usize {
        let mut files = self.lock_files();
        files.extend(paths);
        files.len()
    }

    fn lock_files(&self) -> MutexGuard<'_, Vec<PathBuf>> {
        self.files.lock().unwrap_or_else(|poisoned| {
            warn!(key = %self.key, "Transfer lock poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

impl Drop for FileTransfer {
    fn drop(&mut self) {
        debug!(key = %self.key, sender = %self.sender, "Released transfer");
    }
}
