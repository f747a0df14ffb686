//! Command mnemonics.
//!
//! Every command is a 4-character ASCII mnemonic carried on the wire as a
//! little-endian `u32`, so the first character lands in the lowest byte.
//! The device answers with the same code on success and with a different
//! code (e.g. `PING`) when it rejects a request.

use std::fmt;

/// A wire command code.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Command(u32);

impl Command {
    /// Resynchronize the stream and query the protocol version.
    pub const SYNC: Command = Command::from_mnemonic(*b"SYNC");
    /// Echo request.
    pub const PING: Command = Command::from_mnemonic(*b"PING");

    pub const FILESYSTEM_LIST: Command = Command::from_mnemonic(*b"FSLS");
    pub const FILESYSTEM_EXISTS: Command = Command::from_mnemonic(*b"FSEX");
    pub const FILESYSTEM_CREATE_DIRECTORY: Command = Command::from_mnemonic(*b"FSMD");
    pub const FILESYSTEM_REMOVE: Command = Command::from_mnemonic(*b"FSRM");
    pub const FILESYSTEM_STATE: Command = Command::from_mnemonic(*b"FSST");
    pub const FILESYSTEM_FILE_WRITE: Command = Command::from_mnemonic(*b"FSFW");
    pub const FILESYSTEM_FILE_READ: Command = Command::from_mnemonic(*b"FSFR");
    pub const FILESYSTEM_FILE_CLOSE: Command = Command::from_mnemonic(*b"FSFC");

    /// One chunk of an open read or write stream.
    pub const TRANSFER_CHUNK: Command = Command::from_mnemonic(*b"CHNK");

    pub const APP_LIST: Command = Command::from_mnemonic(*b"APPL");
    pub const APP_READ: Command = Command::from_mnemonic(*b"APPR");
    pub const APP_WRITE: Command = Command::from_mnemonic(*b"APPW");
    pub const APP_REMOVE: Command = Command::from_mnemonic(*b"APPD");
    pub const APP_RUN: Command = Command::from_mnemonic(*b"APPX");

    pub const CONFIGURATION_LIST: Command = Command::from_mnemonic(*b"NVSL");
    pub const CONFIGURATION_READ: Command = Command::from_mnemonic(*b"NVSR");
    pub const CONFIGURATION_WRITE: Command = Command::from_mnemonic(*b"NVSW");
    pub const CONFIGURATION_REMOVE: Command = Command::from_mnemonic(*b"NVSD");

    /// Builds a command from its 4-byte mnemonic.
    pub const fn from_mnemonic(mnemonic: [u8; 4]) -> Self {
        Self(u32::from_le_bytes(mnemonic))
    }

    /// Wraps a raw wire code.
    pub const fn from_code(code: u32) -> Self {
        Self(code)
    }

    /// Returns the raw wire code.
    pub const fn code(&self) -> u32 {
        self.0
    }

    /// Returns the mnemonic bytes in wire order.
    pub const fn mnemonic(&self) -> [u8; 4] {
        self.0.to_le_bytes()
    }
}

impl From<u32> for Command {
    fn from(code: u32) -> Self {
        Self(code)
    }
}

impl From<Command> for u32 {
    fn from(command: Command) -> Self {
        command.0
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.mnemonic() {
            if byte.is_ascii_graphic() || byte == b' ' {
                write!(f, "{}", byte as char)?;
            } else {
                write!(f, "\\x{:02x}", byte)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Command({})", self)
    }
}
