//! # badgelink-protocol
//!
//! Wire protocol spoken between the host and the badge over the WebUSB
//! vendor interface.
//!
//! This crate provides:
//! - Binary framing with magic sentinel and CRC-32 payload validation
//! - Stream reassembly that resynchronizes on line noise
//! - Command mnemonics
//! - Request payload builders and response record decoders
//! - The typed configuration (NVS) value codec

pub mod codec;
pub mod command;
pub mod error;
pub mod frame;
pub mod message;
pub mod value;

pub use codec::{Decoder, Encoder};
pub use command::Command;
pub use error::ProtocolError;
pub use frame::{checksum, Frame, FRAME_HEADER_SIZE, MAGIC};
pub use message::{
    ConfigEntryDescriptor, DirectoryEntry, EntryKind, FileStat, FilesystemState,
    PackageDescriptor, StorageUsage,
};
pub use value::{ConfigType, ConfigValue};

/// Lowest protocol version this implementation talks to.
pub const MIN_PROTOCOL_VERSION: u16 = 2;

/// Largest payload accepted from or sent to the device (1 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;
