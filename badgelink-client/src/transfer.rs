//! Chunked transfer sub-protocol.
//!
//! Once a file or app has been opened, its contents move through repeated
//! `CHNK` transactions. Reads ask for a size and stop at the first empty
//! chunk; writes send raw data and advance by the count the device accepted.
//! Closing the handle is left to the caller.

use crate::connection::Connection;
use crate::error::ClientError;
use crate::transport::UsbTransport;
use badgelink_protocol::message::{decode_u32, encode_chunk_request};
use badgelink_protocol::Command;
use bytes::{Bytes, BytesMut};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Phase of a transfer, reported with progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStage {
    Creating,
    Allocating,
    Writing,
    Closing,
}

impl TransferStage {
    pub fn label(&self) -> &'static str {
        match self {
            TransferStage::Creating => "Creating...",
            TransferStage::Allocating => "Allocating...",
            TransferStage::Writing => "Writing...",
            TransferStage::Closing => "Closing...",
        }
    }
}

impl fmt::Display for TransferStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransferProgress {
    pub stage: TransferStage,
    pub percent: u8,
}

impl TransferProgress {
    pub fn new(stage: TransferStage, percent: u8) -> Self {
        Self { stage, percent }
    }
}

/// `round(position * 100 / total)`, halves rounding up.
fn percent(position: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    let (position, total) = (position as u64, total as u64);
    ((position * 200 + total) / (total * 2)).min(100) as u8
}

/// Reads chunks of `request_size` until the device returns an empty one.
pub async fn read_chunks<T: UsbTransport>(
    connection: &Connection<T>,
    request_size: u32,
    timeout: Duration,
) -> Result<Bytes, ClientError> {
    let request = encode_chunk_request(request_size);
    let mut data = BytesMut::new();
    loop {
        let chunk = connection
            .transact(Command::TRANSFER_CHUNK, request.clone(), timeout)
            .await?;
        if chunk.is_empty() {
            break;
        }
        tracing::debug!(len = chunk.len(), total = data.len() + chunk.len(), "chunk received");
        data.extend_from_slice(&chunk);
    }
    Ok(data.freeze())
}

/// Writes `data` in chunks of at most `chunk_size` bytes.
///
/// Reports `Writing` before every chunk and `Closing` at 100 after the last.
/// Returns the number of bytes the device accepted.
pub async fn write_chunks<T, F>(
    connection: &Connection<T>,
    data: &[u8],
    chunk_size: usize,
    timeout: Duration,
    progress: &mut F,
) -> Result<usize, ClientError>
where
    T: UsbTransport,
    F: FnMut(TransferProgress) + Send,
{
    if chunk_size == 0 {
        return Err(ClientError::InvalidArgument(
            "chunk size must be greater than zero".to_string(),
        ));
    }

    let total = data.len();
    let mut position = 0;
    while position < total {
        progress(TransferProgress::new(
            TransferStage::Writing,
            percent(position, total),
        ));

        let end = (position + chunk_size).min(total);
        let chunk = Bytes::copy_from_slice(&data[position..end]);
        let response = connection
            .transact(Command::TRANSFER_CHUNK, chunk, timeout)
            .await?;
        let accepted = decode_u32(&response)? as usize;
        if accepted == 0 {
            return Err(ClientError::WriteFailed { position });
        }
        // A device cannot accept more than it was sent.
        position += accepted.min(end - position);
    }

    progress(TransferProgress::new(TransferStage::Closing, 100));
    Ok(position)
}
