//! File transfer sessions between applications.
//!
//! An application starts a transfer, adds files by descriptor and hands
//! the key to another application, which retrieves paths it can open.

pub mod manager;
pub mod session;

use std::path::PathBuf;

use thiserror::Error;

use crate::backend::BackendError;
use crate::identity::IdentityError;

pub use manager::TransferManager;
pub use session::FileTransfer;

/// Transfer errors.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Unknown key, or the caller does not own the transfer.
    #[error("Invalid transfer")]
    InvalidTransfer,

    /// A descriptor cannot be exported under the transfer's terms.
    #[error("Can't export file: {0}")]
    NotAllowed(String),

    /// A descriptor could not be resolved to a file.
    #[error("Can't export file: {0}")]
    Resolve(#[from] IdentityError),

    /// A stored path could not be reopened for retrieval.
    #[error("failed to open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The document store failed.
    #[error("document store failed: {0}")]
    Documents(#[from] BackendError),

    /// No free key was found.
    #[error("no free transfer key after {0} attempts")]
    KeyExhausted(u32),
}
