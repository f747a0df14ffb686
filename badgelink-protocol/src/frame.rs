//! Binary frame format.
//!
//! Frame layout (20 bytes header + payload), all fields little-endian:
//!
//! ```text
//! +---------+------------+---------+-------------+------------+
//! |  magic  | identifier | command | payload_len | payload_crc|
//! | 4 bytes |  4 bytes   | 4 bytes |   4 bytes   |  4 bytes   |
//! +---------+------------+---------+-------------+------------+
//! | payload                                                   |
//! | payload_len bytes                                         |
//! +-----------------------------------------------------------+
//! ```
//!
//! `payload_crc` is CRC-32/IEEE over the payload, or 0 when the payload is
//! empty.

use crate::command::Command;
use crate::error::ProtocolError;
use crate::MAX_PAYLOAD_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic sentinel opening every frame.
pub const MAGIC: u32 = 0xFEED_F00D;

/// Size of the fixed frame header in bytes (5 x u32).
pub const FRAME_HEADER_SIZE: usize = 20;

/// Offset of the payload length field inside the header.
pub const PAYLOAD_LEN_OFFSET: usize = 12;

/// Computes the payload checksum (CRC-32/IEEE).
pub fn checksum(payload: &[u8]) -> u32 {
    if payload.is_empty() {
        return 0;
    }
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

/// A parsed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Transaction identifier, echoed by the device.
    pub identifier: u32,
    /// Command code (request) or response code (reply).
    pub command: Command,
    /// Frame payload.
    pub payload: Bytes,
}

impl Frame {
    /// Creates a new frame.
    pub fn new(identifier: u32, command: Command, payload: impl Into<Bytes>) -> Self {
        Self {
            identifier,
            command,
            payload: payload.into(),
        }
    }

    /// Creates a frame with an empty payload.
    pub fn empty(identifier: u32, command: Command) -> Self {
        Self::new(identifier, command, Bytes::new())
    }

    /// Encodes the frame into bytes.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: self.payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        buf.put_u32_le(MAGIC);
        buf.put_u32_le(self.identifier);
        buf.put_u32_le(self.command.code());
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_u32_le(checksum(&self.payload));
        buf.put_slice(&self.payload);

        Ok(buf)
    }

    /// Decodes exactly one frame (`20 + payload_len` bytes).
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        Self::decode_bytes(Bytes::copy_from_slice(buf))
    }

    /// Decodes exactly one frame, reusing the buffer for the payload.
    pub fn decode_bytes(mut buf: Bytes) -> Result<Self, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(ProtocolError::MalformedFrame(
                "fewer than 20 header bytes",
            ));
        }

        let total_len = buf.len();
        let magic = buf.get_u32_le();
        if magic != MAGIC {
            return Err(ProtocolError::BadMagic {
                expected: MAGIC,
                actual: magic,
            });
        }

        let identifier = buf.get_u32_le();
        let command = Command::from_code(buf.get_u32_le());
        let payload_len = buf.get_u32_le() as usize;
        let crc_expected = buf.get_u32_le();

        if total_len != FRAME_HEADER_SIZE + payload_len {
            return Err(ProtocolError::MalformedFrame(
                "buffer length does not match declared payload length",
            ));
        }

        let payload = buf;
        if !payload.is_empty() {
            let crc_actual = checksum(&payload);
            if crc_actual != crc_expected {
                return Err(ProtocolError::ChecksumMismatch {
                    identifier,
                    command,
                    expected: crc_expected,
                    actual: crc_actual,
                });
            }
        }

        Ok(Self {
            identifier,
            command,
            payload,
        })
    }

    /// Total encoded length of this frame.
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }
}
