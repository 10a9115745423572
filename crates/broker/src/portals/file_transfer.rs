//! File transfer portal: the wire-facing side of the transfer manager.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::PathBuf;
use std::sync::Arc;

use portal_protocol::TransferOptions;

use super::PortalError;
use crate::bus::Connection;
use crate::identity::AppInfo;
use crate::transfer::TransferManager;

/// Portal calls for file transfers.
#[derive(Debug, Clone)]
pub struct FileTransferPortal {
    transfers: Arc<TransferManager>,
}

impl FileTransferPortal {
    pub fn new(transfers: Arc<TransferManager>) -> Self {
        Self { transfers }
    }

    /// The underlying transfer manager.
    pub fn transfers(&self) -> &Arc<TransferManager> {
        &self.transfers
    }

    /// Start a transfer. `writable` defaults to false, `autostop` to true.
    pub fn start_transfer(
        &self,
        connection: &Connection,
        app_info: &AppInfo,
        options: &TransferOptions,
    ) -> Result<String, PortalError> {
        let writable = options.writable.unwrap_or(false);
        let autostop = options.autostop.unwrap_or(true);
        Ok(self
            .transfers
            .start(app_info, connection.unique_name(), writable, autostop)?)
    }

    /// Add the descriptors selected by `indices` from those sent with the call.
    ///
    /// The key and its owner are checked before any index is looked at.
    pub fn add_files(
        &self,
        connection: &Connection,
        app_info: &AppInfo,
        key: &str,
        indices: &[u32],
        fds: &[OwnedFd],
    ) -> Result<(), PortalError> {
        self.transfers.authorize(key, connection.unique_name())?;

        let selected = indices
            .iter()
            .map(|&index| {
                fds.get(index as usize)
                    .map(AsFd::as_fd)
                    .ok_or_else(|| {
                        PortalError::InvalidArgument(format!(
                            "Bad file descriptor index {} of {}",
                            index,
                            fds.len()
                        ))
                    })
            })
            .collect::<Result<Vec<BorrowedFd<'_>>, _>>()?;

        self.transfers
            .add_files(key, connection.unique_name(), app_info, &selected)?;
        Ok(())
    }

    /// Retrieve the files of a transfer for the caller.
    pub async fn retrieve_files(
        &self,
        app_info: &AppInfo,
        key: &str,
    ) -> Result<Vec<String>, PortalError> {
        let files = self.transfers.retrieve(key, app_info).await?;
        Ok(files.into_iter().map(path_to_string).collect())
    }

    /// Stop a transfer.
    pub fn stop_transfer(&self, connection: &Connection, key: &str) -> Result<(), PortalError> {
        self.transfers.stop(key, connection.unique_name())?;
        Ok(())
    }
}

fn path_to_string(path: PathBuf) -> String {
    path.into_os_string()
        .into_string()
        .unwrap_or_else(|raw| raw.to_string_lossy().into_owned())
}
