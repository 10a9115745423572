//! Feature portals built on the request, transfer and consent core.

pub mod actions;
pub mod file_transfer;
pub mod notification;

use portal_protocol::{ErrorCode, ErrorReply};
use thiserror::Error;

use crate::identity::IdentityError;
use crate::request::RequestError;
use crate::transfer::TransferError;

pub use actions::{ActionsPortal, ActivateAction};
pub use file_transfer::FileTransferPortal;
pub use notification::NotificationPortal;

/// Errors returned synchronously to a caller.
#[derive(Debug, Error)]
pub enum PortalError {
    /// Malformed structured input.
    #[error("{0}")]
    InvalidArgument(String),

    /// Nothing is exported at the addressed path for this caller.
    #[error("{0}")]
    UnknownObject(String),

    /// The caller's identity could not be established.
    #[error("failed to resolve caller identity: {0}")]
    Identity(#[source] IdentityError),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

impl PortalError {
    /// Wire error code of this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            PortalError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            PortalError::UnknownObject(_) => ErrorCode::UnknownObject,
            PortalError::Identity(_) => ErrorCode::AccessDenied,
            PortalError::Request(RequestError::InvalidToken(_)) => ErrorCode::InvalidArgument,
            PortalError::Request(_) => ErrorCode::Failed,
            PortalError::Transfer(err) => match err {
                TransferError::InvalidTransfer => ErrorCode::AccessDenied,
                TransferError::NotAllowed(_) | TransferError::Resolve(_) => ErrorCode::NotAllowed,
                TransferError::Open { .. }
                | TransferError::Documents(_)
                | TransferError::KeyExhausted(_) => ErrorCode::Failed,
            },
        }
    }

    /// Error reply sent to the caller.
    pub fn to_error_reply(&self) -> ErrorReply {
        ErrorReply::new(self.code(), self.to_string())
    }
}
