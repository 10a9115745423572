//! Protocol message definitions for the portal broker.
//!
//! Clients send [`ClientMessage`]s carrying a [`Call`]; the broker answers
//! each call with exactly one [`ServerMessage::Reply`] and additionally
//! pushes [`ServerMessage::Signal`]s, such as the terminal response of a
//! request. All messages are JSON inside a [`Frame`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtocolError, Result};
use crate::framing::Frame;

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Object path prefix under which requests are exported.
pub const REQUEST_PATH_PREFIX: &str = "/org/freedesktop/portal/desktop/request";

/// Free-form options bag (`a{sv}` in portal terms).
pub type Options = serde_json::Map<String, Value>;

/// Terminal response code of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum ResponseCode {
    /// The operation completed.
    Success,
    /// The user cancelled or denied the operation.
    Cancelled,
    /// The operation ended some other way.
    Other,
}

impl From<ResponseCode> for u32 {
    fn from(code: ResponseCode) -> Self {
        match code {
            ResponseCode::Success => 0,
            ResponseCode::Cancelled => 1,
            ResponseCode::Other => 2,
        }
    }
}

impl TryFrom<u32> for ResponseCode {
    type Error = String;

    fn try_from(value: u32) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(ResponseCode::Success),
            1 => Ok(ResponseCode::Cancelled),
            2 => Ok(ResponseCode::Other),
            other => Err(format!("unknown response code {}", other)),
        }
    }
}

/// Error codes returned in place of a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Unknown or foreign transfer key, or an identity that cannot be resolved.
    AccessDenied,
    /// The caller lacks a required grant.
    NotAllowed,
    /// Malformed structured input.
    InvalidArgument,
    /// No object is exported at the addressed path for this caller.
    UnknownObject,
    /// Any other failure.
    Failed,
}

impl ErrorCode {
    /// Returns the portal error name for this code.
    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::AccessDenied => "org.freedesktop.DBus.Error.AccessDenied",
            ErrorCode::NotAllowed => "org.freedesktop.portal.Error.NotAllowed",
            ErrorCode::InvalidArgument => "org.freedesktop.portal.Error.InvalidArgument",
            ErrorCode::UnknownObject => "org.freedesktop.DBus.Error.UnknownObject",
            ErrorCode::Failed => "org.freedesktop.portal.Error.Failed",
        }
    }
}

/// Options accepted by `StartTransfer`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOptions {
    /// Whether recipients get write access (default false).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub writable: Option<bool>,
    /// Whether the transfer ends after the first retrieval (default true).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autostop: Option<bool>,
}

/// A method call sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "args")]
pub enum Call {
    /// First call of every connection; returns the unique sender name.
    Hello,
    /// Broker statistics.
    Status,
    /// Close (cancel) a request exported at `handle`.
    CloseRequest { handle: String },
    /// Start a file transfer session.
    StartTransfer {
        #[serde(default)]
        options: TransferOptions,
    },
    /// Add files to a transfer. `fds` index into the descriptors sent with the frame.
    AddFiles {
        key: String,
        fds: Vec<u32>,
        #[serde(default)]
        options: Options,
    },
    /// Retrieve the files of a transfer.
    RetrieveFiles {
        key: String,
        #[serde(default)]
        options: Options,
    },
    /// Stop a transfer.
    StopTransfer { key: String },
    /// Show or replace a notification.
    AddNotification { id: String, notification: Options },
    /// Withdraw a notification.
    RemoveNotification { id: String },
    /// Activate an action of another application after user consent.
    ActivateAction {
        parent_window: String,
        application: String,
        action: String,
        #[serde(default)]
        parameters: Vec<Value>,
        #[serde(default)]
        options: Options,
    },
}

impl Call {
    /// Method name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Call::Hello => "Hello",
            Call::Status => "Status",
            Call::CloseRequest { .. } => "CloseRequest",
            Call::StartTransfer { .. } => "StartTransfer",
            Call::AddFiles { .. } => "AddFiles",
            Call::RetrieveFiles { .. } => "RetrieveFiles",
            Call::StopTransfer { .. } => "StopTransfer",
            Call::AddNotification { .. } => "AddNotification",
            Call::RemoveNotification { .. } => "RemoveNotification",
            Call::ActivateAction { .. } => "ActivateAction",
        }
    }
}

/// Broker statistics returned by `Status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerStatus {
    /// Seconds since the broker started.
    pub uptime_secs: u64,
    /// Connected clients.
    pub connections: usize,
    /// Currently exported requests.
    pub requests: usize,
    /// Live transfer sessions.
    pub transfers: usize,
    /// Notifications currently shown.
    pub notifications: usize,
}

/// Successful reply bodies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Reply {
    /// Reply to `Hello`.
    Hello { unique_name: String },
    /// Reply to `Status`.
    Status(BrokerStatus),
    /// A request was created and exported at `handle`.
    Handle { handle: String },
    /// Reply to `StartTransfer`.
    TransferKey { key: String },
    /// Reply to `RetrieveFiles`.
    Files { files: Vec<String> },
    /// Calls without a return value.
    Empty,
}

/// Error reply body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    /// Error classification.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

impl ErrorReply {
    /// Create an error reply.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Signals pushed by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal")]
pub enum Signal {
    /// Terminal response of the request exported at `handle`.
    Response {
        handle: String,
        response: ResponseCode,
        #[serde(default)]
        results: Options,
    },
    /// The user activated `action` on the caller's notification `id`.
    ActionInvoked {
        id: String,
        action: String,
        #[serde(default)]
        parameter: Vec<Value>,
    },
}

/// Message sent from a client to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
    /// Protocol version for compatibility checking.
    #[serde(default = "default_version")]
    pub version: u8,
    /// Client-chosen serial echoed in the reply.
    pub serial: u32,
    /// The call.
    pub call: Call,
}

fn default_version() -> u8 {
    PROTOCOL_VERSION
}

impl ClientMessage {
    /// Create a message with the current protocol version.
    pub fn new(serial: u32, call: Call) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            serial,
            call,
        }
    }

    /// Serialize into a frame announcing `fd_count` attached descriptors.
    pub fn to_frame(&self, fd_count: usize) -> Result<Frame> {
        let payload = serde_json::to_vec(self)?;
        Frame::with_fds(payload, fd_count)
    }

    /// Parse from a frame payload.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let message: Self = serde_json::from_slice(&frame.payload)?;
        if message.version != PROTOCOL_VERSION {
            return Err(ProtocolError::Deserialization(format!(
                "unsupported protocol version {}",
                message.version
            )));
        }
        Ok(message)
    }
}

/// Message sent from the broker to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Answer to the call with the same serial.
    Reply {
        serial: u32,
        result: std::result::Result<Reply, ErrorReply>,
    },
    /// Unsolicited signal.
    Signal(Signal),
}

impl ServerMessage {
    /// Serialize into a frame.
    pub fn to_frame(&self) -> Result<Frame> {
        Ok(Frame::new(serde_json::to_vec(self)?))
    }

    /// Parse from a frame payload.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        Ok(serde_json::from_slice(&frame.payload)?)
    }
}
