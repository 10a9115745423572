//! Frame codec for length-prefixed framing with descriptor accounting.
//!
//! # Frame Format
//!
//! Each frame consists of:
//! - 4 bytes: magic bytes "XDPB"
//! - 4 bytes: payload length (big-endian, includes the descriptor count byte)
//! - 1 byte: number of file descriptors attached to this frame
//! - N bytes: payload (JSON)
//!
//! # Descriptors
//!
//! Descriptors travel as `SCM_RIGHTS` ancillary data on the `sendmsg` call
//! that carries the frame. The receiver keeps a queue of received
//! descriptors and hands exactly `fd_count` of them to each decoded frame,
//! in arrival order.

use crate::error::{ProtocolError, Result};

/// Magic bytes identifying a broker frame.
pub const FRAME_MAGIC: [u8; 4] = *b"XDPB";

/// Maximum frame size (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame header size: 4 (magic) + 4 (length) + 1 (descriptor count) = 9 bytes.
pub const FRAME_HEADER_SIZE: usize = 9;

/// Maximum descriptors per frame, the kernel's `SCM_MAX_FD`.
pub const MAX_FDS_PER_FRAME: usize = 253;

/// A frame containing a payload and the number of descriptors sent with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Number of descriptors attached to the frame.
    pub fd_count: u8,
    /// The payload data.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a new frame with the given payload and no descriptors.
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            fd_count: 0,
            payload,
        }
    }

    /// Create a new frame announcing `fd_count` attached descriptors.
    pub fn with_fds(payload: Vec<u8>, fd_count: usize) -> Result<Self> {
        if fd_count > MAX_FDS_PER_FRAME {
            return Err(ProtocolError::TooManyDescriptors {
                count: fd_count,
                max: MAX_FDS_PER_FRAME,
            });
        }
        Ok(Self {
            fd_count: fd_count as u8,
            payload,
        })
    }
}

/// Encoder and decoder for frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a new frame codec.
    pub fn new() -> Self {
        Self
    }

    /// Encode a frame into bytes.
    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>> {
        let payload = &frame.payload;

        let total_size = FRAME_HEADER_SIZE + payload.len();
        if total_size > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: total_size,
                max: MAX_FRAME_SIZE,
            });
        }

        let content_len = 1 + payload.len();
        let mut output = Vec::with_capacity(total_size);
        output.extend_from_slice(&FRAME_MAGIC);
        output.extend_from_slice(&(content_len as u32).to_be_bytes());
        output.push(frame.fd_count);
        output.extend_from_slice(payload);

        Ok(output)
    }

    /// Try to decode a frame from bytes, returning None if there isn't enough data.
    ///
    /// On success returns the frame and the number of bytes consumed.
    pub fn try_decode(&self, data: &[u8]) -> Result<Option<(Frame, usize)>> {
        if data.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let magic = [data[0], data[1], data[2], data[3]];
        if magic != FRAME_MAGIC {
            return Err(ProtocolError::InvalidFrameMagic {
                expected: u32::from_be_bytes(FRAME_MAGIC),
                got: u32::from_be_bytes(magic),
            });
        }

        let content_len = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;
        if content_len < 1 {
            return Err(ProtocolError::Deserialization(
                "invalid frame: content length must include the descriptor count".to_string(),
            ));
        }

        let total_frame_size = 8 + content_len;
        if total_frame_size > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: total_frame_size,
                max: MAX_FRAME_SIZE,
            });
        }

        if data.len() < total_frame_size {
            return Ok(None);
        }

        let fd_count = data[8];
        if fd_count as usize > MAX_FDS_PER_FRAME {
            return Err(ProtocolError::TooManyDescriptors {
                count: fd_count as usize,
                max: MAX_FDS_PER_FRAME,
            });
        }

        let frame = Frame {
            fd_count,
            payload: data[FRAME_HEADER_SIZE..total_frame_size].to_vec(),
        };
        Ok(Some((frame, total_frame_size)))
    }
}

/// Accumulates stream bytes and yields complete frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    codec: FrameCodec,
    buffer: Vec<u8>,
}

impl FrameDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Pop the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        match self.codec.try_decode(&self.buffer)? {
            Some((frame, consumed)) => {
                self.buffer.drain(..consumed);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }

    /// Number of buffered bytes not yet forming a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
