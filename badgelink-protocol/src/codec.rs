//! Encoder and stream reassembler for frames.

use crate::command::Command;
use crate::error::ProtocolError;
use crate::frame::{Frame, FRAME_HEADER_SIZE, MAGIC, PAYLOAD_LEN_OFFSET};
use crate::MAX_PAYLOAD_SIZE;
use bytes::{Bytes, BytesMut};

/// Encodes requests into frames.
pub struct Encoder;

impl Encoder {
    /// Encodes a request with the given identifier, command and payload.
    pub fn encode_request(
        identifier: u32,
        command: Command,
        payload: &Bytes,
    ) -> Result<BytesMut, ProtocolError> {
        Frame::new(identifier, command, payload.clone()).encode()
    }
}

/// Reassembles frames from a stream of transport reads.
///
/// The stream may contain noise and may split frames at arbitrary
/// boundaries. Whenever the buffer does not start with the magic
/// sentinel, exactly one byte is dropped and the scan repeats.
pub struct Decoder {
    buffer: BytesMut,
    discarded: u64,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            discarded: 0,
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next frame from the buffer.
    ///
    /// Returns `Ok(None)` when more data is needed. A frame whose checksum
    /// does not match is consumed and returned as
    /// [`ProtocolError::ChecksumMismatch`], so decoding can continue with the
    /// following bytes.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        while self.buffer.len() >= FRAME_HEADER_SIZE {
            if read_u32_le(&self.buffer, 0) != MAGIC {
                self.skip_byte();
                continue;
            }

            let payload_len = read_u32_le(&self.buffer, PAYLOAD_LEN_OFFSET) as usize;
            if payload_len > MAX_PAYLOAD_SIZE {
                tracing::warn!(
                    payload_len,
                    "declared payload length out of range, treating header as noise"
                );
                self.skip_byte();
                continue;
            }

            let total_len = FRAME_HEADER_SIZE + payload_len;
            if self.buffer.len() < total_len {
                return Ok(None);
            }

            let raw = self.buffer.split_to(total_len).freeze();
            return Frame::decode_bytes(raw).map(Some);
        }
        Ok(None)
    }

    fn skip_byte(&mut self) {
        let _ = self.buffer.split_to(1);
        self.discarded += 1;
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the number of noise bytes dropped so far.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

fn read_u32_le(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}
