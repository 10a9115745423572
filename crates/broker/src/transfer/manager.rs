//! Registry of live transfers keyed by transfer key.

use std::fs::OpenOptions;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use super::session::FileTransfer;
use super::TransferError;
use crate::backend::{BackendError, DocumentAddFlags, DocumentPermissions, DocumentStore};
use crate::identity::AppInfo;

/// Source of candidate transfer keys.
pub type KeySource = Box<dyn Fn() -> u32 + Send + Sync>;

/// Default number of attempts at finding an unused key.
pub const DEFAULT_MAX_KEY_ATTEMPTS: u32 = 16;

/// Thread-safe transfer registry.
///
/// The table lock guards membership only; the file list of each transfer
/// has its own lock, taken after the table guard is released.
pub struct TransferManager {
    transfers: DashMap<String, Arc<FileTransfer>>,
    documents: Arc<dyn DocumentStore>,
    key_source: KeySource,
    max_key_attempts: u32,
}

impl std::fmt::Debug for TransferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferManager")
            .field("transfers", &self.transfers.len())
            .field("max_key_attempts", &self.max_key_attempts)
            .finish_non_exhaustive()
    }
}

impl TransferManager {
    /// Creates a manager with random keys.
    pub fn new(documents: Arc<dyn DocumentStore>, max_key_attempts: u32) -> Self {
        Self {
            transfers: DashMap::new(),
            documents,
            key_source: Box::new(rand::random::<u32>),
            max_key_attempts: max_key_attempts.max(1),
        }
    }

    /// Replace the key source.
    pub fn with_key_source(mut self, key_source: KeySource) -> Self {
        self.key_source = key_source;
        self
    }

    /// Number of live transfers.
    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    /// The live transfer with `key`.
    pub fn lookup(&self, key: &str) -> Option<Arc<FileTransfer>> {
        self.transfers.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Start a transfer owned by `sender` and return its key.
    ///
    /// Keys are random 32-bit values; a key still in use is re-rolled.
    pub fn start(
        &self,
        app_info: &AppInfo,
        sender: &str,
        writable: bool,
        autostop: bool,
    ) -> Result<String, TransferError> {
        for attempt in 1..=self.max_key_attempts {
            let key = (self.key_source)().to_string();
            match self.transfers.entry(key.clone()) {
                Entry::Occupied(_) => {
                    warn!(key = %key, attempt, "Transfer key in use, re-rolling");
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(Arc::new(FileTransfer::new(
                        key.clone(),
                        sender.to_string(),
                        app_info.clone(),
                        writable,
                        autostop,
                    )));
                    info!(
                        key = %key,
                        sender,
                        app_id = app_info.id(),
                        writable,
                        autostop,
                        "Started transfer"
                    );
                    return Ok(key);
                }
            }
        }
        Err(TransferError::KeyExhausted(self.max_key_attempts))
    }

    /// The live transfer with `key`, provided `sender` started it.
    pub fn authorize(&self, key: &str, sender: &str) -> Result<Arc<FileTransfer>, TransferError> {
        let transfer = self.lookup(key).ok_or(TransferError::InvalidTransfer)?;
        if transfer.sender() != sender {
            debug!(key, sender, owner = transfer.sender(), "Rejected add from non-owner");
            return Err(TransferError::InvalidTransfer);
        }
        Ok(transfer)
    }

    /// Add the files behind `fds` to the transfer.
    ///
    /// Only the starting connection may add. Either every descriptor is
    /// accepted or none is. Returns the new file count.
    pub fn add_files(
        &self,
        key: &str,
        sender: &str,
        app_info: &AppInfo,
        fds: &[BorrowedFd<'_>],
    ) -> Result<usize, TransferError> {
        let transfer = self.authorize(key, sender)?;

        let mut paths = Vec::with_capacity(fds.len());
        for fd in fds {
            let resolved = app_info.resolve_fd_path(*fd)?;
            if transfer.is_writable() && !resolved.writable {
                return Err(TransferError::NotAllowed(format!(
                    "{} is not writable",
                    resolved.path.display()
                )));
            }
            paths.push(resolved.path);
        }

        let added = paths.len();
        let total = transfer.append(paths);
        debug!(key, added, total, "Added files to transfer");
        Ok(total)
    }

    /// Retrieve the files of a transfer on behalf of `recipient`.
    ///
    /// The host gets the stored paths. A sandboxed recipient gets paths
    /// inside the document store, or the host path where the store reports
    /// the file is already visible. An autostop transfer ends with its
    /// first retrieval, successful or not.
    pub async fn retrieve(
        &self,
        key: &str,
        recipient: &AppInfo,
    ) -> Result<Vec<PathBuf>, TransferError> {
        let transfer = self.lookup(key).ok_or(TransferError::InvalidTransfer)?;

        let result = self.export_files(&transfer, recipient).await;

        if transfer.is_autostop() {
            self.remove(&transfer);
        }
        result
    }

    async fn export_files(
        &self,
        transfer: &FileTransfer,
        recipient: &AppInfo,
    ) -> Result<Vec<PathBuf>, TransferError> {
        let files = transfer.files();
        debug!(
            key = transfer.key(),
            count = files.len(),
            recipient = recipient.id(),
            "Retrieving transfer"
        );

        if recipient.is_host() {
            return Ok(files);
        }

        let mut handles: Vec<OwnedFd> = Vec::with_capacity(files.len());
        for file in &files {
            let handle = OpenOptions::new()
                .read(true)
                .custom_flags(nix::libc::O_PATH | nix::libc::O_CLOEXEC)
                .open(file)
                .map_err(|source| TransferError::Open {
                    path: file.clone(),
                    source,
                })?;
            handles.push(handle.into());
        }

        let flags = DocumentAddFlags::REUSE_EXISTING | DocumentAddFlags::AS_NEEDED_BY_APP;
        let mut permissions = DocumentPermissions::READ;
        if transfer.is_writable() {
            permissions |= DocumentPermissions::WRITE;
        }

        let ids = self
            .documents
            .batch_add(
                &handles,
                flags,
                transfer.app_info(),
                recipient.id(),
                permissions,
            )
            .await;
        drop(handles);
        let ids = ids?;

        if ids.len() != files.len() {
            return Err(TransferError::Documents(BackendError::Malformed(format!(
                "expected {} document ids, got {}",
                files.len(),
                ids.len()
            ))));
        }

        let mount_point = self.documents.mount_point();
        Ok(files
            .into_iter()
            .zip(ids)
            .map(|(file, id)| {
                if id.is_empty() {
                    file
                } else {
                    let name = file.file_name().map(PathBuf::from).unwrap_or_default();
                    mount_point.join(id).join(name)
                }
            })
            .collect())
    }

    /// Stop a transfer. Any holder of the key may stop it.
    ///
    /// The key is unusable as soon as this returns; operations already in
    /// flight complete against their own reference.
    pub fn stop(&self, key: &str, sender: &str) -> Result<(), TransferError> {
        match self.transfers.remove(key) {
            Some((key, _)) => {
                info!(key = %key, sender, "Stopped transfer");
                Ok(())
            }
            None => Err(TransferError::InvalidTransfer),
        }
    }

    fn remove(&self, transfer: &Arc<FileTransfer>) {
        let removed = self
            .transfers
            .remove_if(transfer.key(), |_, entry| Arc::ptr_eq(entry, transfer));
        if removed.is_some() {
            info!(key = transfer.key(), "Auto-stopped transfer");
        }
    }
}
