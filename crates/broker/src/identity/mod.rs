//! Caller identity: who is behind a connection and what a passed
//! descriptor refers to.

pub mod app_info;
pub mod desktop;
pub mod resolver;

use std::path::PathBuf;

use thiserror::Error;

pub use app_info::{AppInfo, ResolvedPath};
pub use resolver::{IdentityResolver, ProcIdentityResolver};

/// Errors raised while resolving identities and descriptors.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// The peer's process could not be determined.
    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    /// The sandbox metadata of the peer is malformed.
    #[error("malformed sandbox metadata: {0}")]
    Malformed(String),

    /// The descriptor is not valid in this process.
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    /// The descriptor does not refer to a regular file.
    #[error("not a regular file: {}", .0.display())]
    NotRegularFile(PathBuf),

    /// The file behind the descriptor has been unlinked.
    #[error("file was deleted: {}", .0.display())]
    Deleted(PathBuf),

    /// I/O failure while inspecting the peer or descriptor.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
