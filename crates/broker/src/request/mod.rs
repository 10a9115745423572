//! Per-call request objects and their registry.
//!
//! A request represents one pending asynchronous interaction (usually a
//! consent dialog) on behalf of one client. It is exported at a unique path,
//! can be closed by its owner, and delivers exactly one terminal response
//! unless closed first.

pub mod lifecycle;
pub mod registry;

use thiserror::Error;

pub use lifecycle::Request;
pub use registry::{escape_sender, RequestRegistry};

/// Request lifecycle errors.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The request was already exported, or has already finished.
    #[error("request {0} was already exported")]
    AlreadyExported(String),

    /// Another live request is exported at the same path.
    #[error("a request is already exported at {0}")]
    DuplicateId(String),

    /// The client-supplied handle token is not a valid path element.
    #[error("invalid handle token: {0:?}")]
    InvalidToken(String),
}
