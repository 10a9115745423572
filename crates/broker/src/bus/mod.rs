//! Local message bus between sandboxed clients and the broker.
//!
//! Clients connect over a Unix domain socket and exchange length-prefixed
//! frames (see [`portal_protocol::framing`]). File descriptors ride along
//! as `SCM_RIGHTS` ancillary data, which is why the bus talks to the socket
//! through `sendmsg`/`recvmsg` instead of a plain byte stream.
//!
//! ## Socket Path
//!
//! - Primary: `$XDG_RUNTIME_DIR/portal-broker/bus.sock`
//! - Fallback: `/tmp/portal-broker-$UID/bus.sock`
//!
//! ## Example
//!
//! ```rust,no_run
//! use broker::bus::{get_socket_path, BusClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = BusClient::connect(&get_socket_path()).await?;
//!     let key = client.start_transfer(Default::default()).await?;
//!     println!("transfer {} started as {}", key, client.unique_name());
//!     Ok(())
//! }
//! ```

mod client;
mod connection;
mod fdpass;
mod server;

pub use client::BusClient;
pub use connection::Connection;
pub use server::BusServer;

use std::io;
use std::path::PathBuf;

use portal_protocol::{ErrorCode, ProtocolError};
use thiserror::Error;

/// Errors raised by the bus transport.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A frame announced more descriptors than arrived with it.
    #[error("frame announced {announced} descriptors, {received} available")]
    MissingDescriptors { announced: usize, received: usize },

    /// More descriptors queued than a single pending frame may carry.
    #[error("{queued} descriptors queued without a frame to claim them")]
    TooManyDescriptors { queued: usize },

    /// The broker answered a call with an error.
    #[error("{}: {message}", code.name())]
    Remote { code: ErrorCode, message: String },

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("timed out waiting for the broker")]
    Timeout,

    #[error("connection closed")]
    Closed,
}

impl BusError {
    /// Wire error code, when the broker returned one.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            BusError::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Get the socket path the broker listens on.
///
/// 1. If `$XDG_RUNTIME_DIR` is set: `$XDG_RUNTIME_DIR/portal-broker/bus.sock`
/// 2. Otherwise: `/tmp/portal-broker-$UID/bus.sock`
pub fn get_socket_path() -> PathBuf {
    use std::os::unix::fs::MetadataExt;

    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir)
            .join("portal-broker")
            .join("bus.sock")
    } else {
        let uid = std::fs::metadata("/proc/self")
            .map(|m| m.uid())
            .unwrap_or(0);

        PathBuf::from(format!("/tmp/portal-broker-{}", uid)).join("bus.sock")
    }
}
