//! Client error types.

use crate::transport::TransportError;
use badgelink_protocol::{Command, ProtocolError};
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not connected")]
    NotConnected,

    #[error("already connected")]
    AlreadyConnected,

    #[error("protocol version {version} not supported (need {minimum} or later)")]
    UnsupportedProtocol { version: u16, minimum: u16 },

    #[error("{command} timed out")]
    Timeout { command: Command },

    #[error("checksum error in {command} response")]
    ChecksumError { command: Command },

    #[error("device reports error {response} for {request}")]
    DeviceError { request: Command, response: Command },

    #[error("device accepted no data at offset {position}")]
    WriteFailed { position: usize },

    #[error("failed to open '{0}' on the device")]
    OpenFailed(String),

    #[error("invalid configuration type: {0:#04x}")]
    InvalidConfigurationType(u8),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no sync after {attempts} attempts")]
    SyncFailed { attempts: u32 },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("protocol error: {0}")]
    Protocol(ProtocolError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl From<ProtocolError> for ClientError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::InvalidConfigurationType(tag) => ClientError::InvalidConfigurationType(tag),
            ProtocolError::ChecksumMismatch { command, .. } => ClientError::ChecksumError { command },
            other => ClientError::Protocol(other),
        }
    }
}

impl ClientError {
    /// Returns whether the operation may succeed if issued again.
    ///
    /// Timeouts and checksum errors drop the link out of sync; the next
    /// operation resynchronizes first.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Timeout { .. }
                | ClientError::ChecksumError { .. }
                | ClientError::SyncFailed { .. }
        )
    }
}
