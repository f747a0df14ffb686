//! Protocol error types.

use crate::command::Command;
use thiserror::Error;

/// Protocol-level errors that can occur during framing or payload decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    #[error("invalid magic: expected {expected:#010x}, got {actual:#010x}")]
    BadMagic { expected: u32, actual: u32 },

    #[error(
        "checksum mismatch on frame {identifier} ({command}): expected {expected:#010x}, got {actual:#010x}"
    )]
    ChecksumMismatch {
        identifier: u32,
        command: Command,
        expected: u32,
        actual: u32,
    },

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("truncated payload: needed {needed} bytes, {available} available")]
    TruncatedPayload { needed: usize, available: usize },

    #[error("invalid UTF-8 in payload")]
    InvalidUtf8,

    #[error("invalid configuration type: {0:#04x}")]
    InvalidConfigurationType(u8),

    #[error("invalid value: {0}")]
    InvalidValue(String),
}

impl ProtocolError {
    pub(crate) fn truncated(needed: usize, available: usize) -> Self {
        ProtocolError::TruncatedPayload { needed, available }
    }
}
