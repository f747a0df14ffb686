//! Typed configuration (NVS) values.
//!
//! Every value carries a one-byte type tag on the wire. Integers are
//! fixed-width little-endian; strings are UTF-8 and blobs are raw bytes,
//! both taking the whole value payload.

use crate::error::ProtocolError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Configuration value type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    String,
    Blob,
}

impl ConfigType {
    pub const ALL: [ConfigType; 10] = [
        ConfigType::U8,
        ConfigType::I8,
        ConfigType::U16,
        ConfigType::I16,
        ConfigType::U32,
        ConfigType::I32,
        ConfigType::U64,
        ConfigType::I64,
        ConfigType::String,
        ConfigType::Blob,
    ];

    /// Returns the wire tag.
    pub fn tag(&self) -> u8 {
        match self {
            ConfigType::U8 => 0x01,
            ConfigType::I8 => 0x11,
            ConfigType::U16 => 0x02,
            ConfigType::I16 => 0x12,
            ConfigType::U32 => 0x04,
            ConfigType::I32 => 0x14,
            ConfigType::U64 => 0x08,
            ConfigType::I64 => 0x18,
            ConfigType::String => 0x21,
            ConfigType::Blob => 0x42,
        }
    }

    /// Encoded width for fixed-size types, `None` for string and blob.
    pub fn width(&self) -> Option<usize> {
        match self {
            ConfigType::U8 | ConfigType::I8 => Some(1),
            ConfigType::U16 | ConfigType::I16 => Some(2),
            ConfigType::U32 | ConfigType::I32 => Some(4),
            ConfigType::U64 | ConfigType::I64 => Some(8),
            ConfigType::String | ConfigType::Blob => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ConfigType::U8 => "u8",
            ConfigType::I8 => "i8",
            ConfigType::U16 => "u16",
            ConfigType::I16 => "i16",
            ConfigType::U32 => "u32",
            ConfigType::I32 => "i32",
            ConfigType::U64 => "u64",
            ConfigType::I64 => "i64",
            ConfigType::String => "string",
            ConfigType::Blob => "blob",
        }
    }
}

impl TryFrom<u8> for ConfigType {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        ConfigType::ALL
            .into_iter()
            .find(|t| t.tag() == tag)
            .ok_or(ProtocolError::InvalidConfigurationType(tag))
    }
}

impl fmt::Display for ConfigType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ConfigType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConfigType::ALL
            .into_iter()
            .find(|t| t.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| ProtocolError::InvalidValue(format!("unknown configuration type '{}'", s)))
    }
}

/// A typed configuration value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    String(String),
    Blob(Bytes),
}

impl ConfigValue {
    /// Returns the type tag of this value.
    pub fn config_type(&self) -> ConfigType {
        match self {
            ConfigValue::U8(_) => ConfigType::U8,
            ConfigValue::I8(_) => ConfigType::I8,
            ConfigValue::U16(_) => ConfigType::U16,
            ConfigValue::I16(_) => ConfigType::I16,
            ConfigValue::U32(_) => ConfigType::U32,
            ConfigValue::I32(_) => ConfigType::I32,
            ConfigValue::U64(_) => ConfigType::U64,
            ConfigValue::I64(_) => ConfigType::I64,
            ConfigValue::String(_) => ConfigType::String,
            ConfigValue::Blob(_) => ConfigType::Blob,
        }
    }

    /// Encodes the value payload (without the type tag).
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ConfigValue::U8(v) => v.to_le_bytes().to_vec(),
            ConfigValue::I8(v) => v.to_le_bytes().to_vec(),
            ConfigValue::U16(v) => v.to_le_bytes().to_vec(),
            ConfigValue::I16(v) => v.to_le_bytes().to_vec(),
            ConfigValue::U32(v) => v.to_le_bytes().to_vec(),
            ConfigValue::I32(v) => v.to_le_bytes().to_vec(),
            ConfigValue::U64(v) => v.to_le_bytes().to_vec(),
            ConfigValue::I64(v) => v.to_le_bytes().to_vec(),
            ConfigValue::String(v) => v.as_bytes().to_vec(),
            ConfigValue::Blob(v) => v.to_vec(),
        }
    }

    /// Decodes a value payload of the given type.
    pub fn decode(config_type: ConfigType, data: &[u8]) -> Result<Self, ProtocolError> {
        if let Some(width) = config_type.width() {
            if data.len() != width {
                return Err(ProtocolError::TruncatedPayload {
                    needed: width,
                    available: data.len(),
                });
            }
        }

        let value = match config_type {
            ConfigType::U8 => ConfigValue::U8(data[0]),
            ConfigType::I8 => ConfigValue::I8(data[0] as i8),
            ConfigType::U16 => ConfigValue::U16(u16::from_le_bytes(fixed(data))),
            ConfigType::I16 => ConfigValue::I16(i16::from_le_bytes(fixed(data))),
            ConfigType::U32 => ConfigValue::U32(u32::from_le_bytes(fixed(data))),
            ConfigType::I32 => ConfigValue::I32(i32::from_le_bytes(fixed(data))),
            ConfigType::U64 => ConfigValue::U64(u64::from_le_bytes(fixed(data))),
            ConfigType::I64 => ConfigValue::I64(i64::from_le_bytes(fixed(data))),
            ConfigType::String => ConfigValue::String(
                String::from_utf8(data.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)?,
            ),
            ConfigType::Blob => ConfigValue::Blob(Bytes::copy_from_slice(data)),
        };
        Ok(value)
    }

    /// Decodes a value payload given a raw wire tag.
    pub fn decode_tagged(tag: u8, data: &[u8]) -> Result<Self, ProtocolError> {
        Self::decode(ConfigType::try_from(tag)?, data)
    }

    /// Parses a textual value of the given type. Blobs are hex.
    pub fn parse(config_type: ConfigType, text: &str) -> Result<Self, ProtocolError> {
        fn num<T: FromStr>(text: &str, config_type: ConfigType) -> Result<T, ProtocolError> {
            text.trim().parse().map_err(|_| {
                ProtocolError::InvalidValue(format!("'{}' is not a valid {}", text, config_type))
            })
        }

        Ok(match config_type {
            ConfigType::U8 => ConfigValue::U8(num(text, config_type)?),
            ConfigType::I8 => ConfigValue::I8(num(text, config_type)?),
            ConfigType::U16 => ConfigValue::U16(num(text, config_type)?),
            ConfigType::I16 => ConfigValue::I16(num(text, config_type)?),
            ConfigType::U32 => ConfigValue::U32(num(text, config_type)?),
            ConfigType::I32 => ConfigValue::I32(num(text, config_type)?),
            ConfigType::U64 => ConfigValue::U64(num(text, config_type)?),
            ConfigType::I64 => ConfigValue::I64(num(text, config_type)?),
            ConfigType::String => ConfigValue::String(text.to_string()),
            ConfigType::Blob => ConfigValue::Blob(Bytes::from(parse_hex(text)?)),
        })
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::U8(v) => write!(f, "{}", v),
            ConfigValue::I8(v) => write!(f, "{}", v),
            ConfigValue::U16(v) => write!(f, "{}", v),
            ConfigValue::I16(v) => write!(f, "{}", v),
            ConfigValue::U32(v) => write!(f, "{}", v),
            ConfigValue::I32(v) => write!(f, "{}", v),
            ConfigValue::U64(v) => write!(f, "{}", v),
            ConfigValue::I64(v) => write!(f, "{}", v),
            ConfigValue::String(v) => f.write_str(v),
            ConfigValue::Blob(v) => f.write_str(&hex::encode(v)),
        }
    }
}

fn fixed<const N: usize>(data: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&data[..N]);
    out
}

fn parse_hex(text: &str) -> Result<Vec<u8>, ProtocolError> {
    let digits: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    let digits = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
        .unwrap_or(&digits);
    hex::decode(digits)
        .map_err(|e| ProtocolError::InvalidValue(format!("invalid hex '{}': {}", text, e)))
}
