//! # Portal Broker Protocol Library
//!
//! Wire definitions shared by the portal broker and its clients.
//!
//! ## Overview
//!
//! - **Message Definitions**: calls, replies, error codes and signals
//! - **Frame Codec**: length-prefixed framing that accounts for file
//!   descriptors passed alongside a frame
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │      Calls / Replies / Signals          │  JSON-encoded
//! ├─────────────────────────────────────────┤
//! │              Framing                    │  Length-prefixed, fd count
//! ├─────────────────────────────────────────┤
//! │   Unix domain socket (+ SCM_RIGHTS)     │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use portal_protocol::{Call, ClientMessage, FrameCodec};
//!
//! let message = ClientMessage::new(1, Call::Hello);
//! let frame = message.to_frame(0).unwrap();
//! let bytes = FrameCodec::new().encode(&frame).unwrap();
//! assert_eq!(&bytes[..4], b"XDPB");
//! ```

pub mod error;
pub mod framing;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use framing::{
    Frame, FrameCodec, FrameDecoder, FRAME_HEADER_SIZE, FRAME_MAGIC, MAX_FDS_PER_FRAME,
    MAX_FRAME_SIZE,
};
pub use messages::{
    BrokerStatus, Call, ClientMessage, ErrorCode, ErrorReply, Options, Reply, ResponseCode,
    ServerMessage, Signal, TransferOptions, PROTOCOL_VERSION, REQUEST_PATH_PREFIX,
};
