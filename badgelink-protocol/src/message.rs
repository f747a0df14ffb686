//! Request payload builders and response records.
//!
//! Listing responses are a stream of records consumed until the payload is
//! exhausted. A record cut short fails the whole listing with
//! [`ProtocolError::TruncatedPayload`].

use crate::error::ProtocolError;
use crate::value::{ConfigType, ConfigValue};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// `kind` byte the device uses for directories in a listing.
const KIND_DIRECTORY: u8 = 2;

/// Kind of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Directory,
}

/// Size and modification time of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub size: u32,
    pub modified: u64,
}

/// One entry of a filesystem listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub kind: EntryKind,
    pub name: String,
    /// Absent when the device could not stat the entry.
    pub stat: Option<FileStat>,
}

/// An installed application package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageDescriptor {
    pub name: String,
    pub title: String,
    pub version: u16,
    pub size: u32,
}

/// One stored configuration entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigEntryDescriptor {
    pub namespace: String,
    pub key: String,
    #[serde(rename = "type")]
    pub type_tag: u8,
    pub size: u32,
}

impl ConfigEntryDescriptor {
    /// Returns the typed tag, if the device reported a known one.
    pub fn config_type(&self) -> Option<ConfigType> {
        ConfigType::try_from(self.type_tag).ok()
    }
}

/// Capacity of one storage area.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageUsage {
    pub size: u64,
    pub free: u64,
}

/// Capacity of the device's storage areas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemState {
    pub internal: StorageUsage,
    pub sd: StorageUsage,
    pub app: StorageUsage,
}

/// Bounds-checked little-endian reader over a response payload.
struct PayloadReader<'a> {
    buf: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        if self.buf.len() < len {
            return Err(ProtocolError::truncated(len, self.buf.len()));
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, ProtocolError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn text(&mut self, len: usize) -> Result<String, ProtocolError> {
        Ok(String::from_utf8_lossy(self.take(len)?).into_owned())
    }
}

/// Decodes an `FSLS` response.
///
/// Record: `kind:1, name_len:4, name, stat_result:i32, size:4, modified:8`.
pub fn decode_directory_listing(payload: &[u8]) -> Result<Vec<DirectoryEntry>, ProtocolError> {
    let mut reader = PayloadReader::new(payload);
    let mut entries = Vec::new();
    while !reader.is_empty() {
        let kind = match reader.u8()? {
            KIND_DIRECTORY => EntryKind::Directory,
            _ => EntryKind::File,
        };
        let name_len = reader.u32()? as usize;
        let name = reader.text(name_len)?;
        let stat_result = reader.i32()?;
        let size = reader.u32()?;
        let modified = reader.u64()?;
        entries.push(DirectoryEntry {
            kind,
            name,
            stat: (stat_result == 0).then_some(FileStat { size, modified }),
        });
    }
    Ok(entries)
}

/// Decodes an `APPL` response.
///
/// Record: `name_len:2, name, title_len:2, title, version:2, size:4`.
pub fn decode_package_listing(payload: &[u8]) -> Result<Vec<PackageDescriptor>, ProtocolError> {
    let mut reader = PayloadReader::new(payload);
    let mut packages = Vec::new();
    while !reader.is_empty() {
        let name_len = reader.u16()? as usize;
        let name = reader.text(name_len)?;
        let title_len = reader.u16()? as usize;
        let title = reader.text(title_len)?;
        let version = reader.u16()?;
        let size = reader.u32()?;
        packages.push(PackageDescriptor {
            name,
            title,
            version,
            size,
        });
    }
    Ok(packages)
}

/// Decodes an `NVSL` response.
///
/// Record: `namespace_len:2, namespace, key_len:2, key, type:1, size:4`.
pub fn decode_configuration_listing(
    payload: &[u8],
) -> Result<Vec<ConfigEntryDescriptor>, ProtocolError> {
    let mut reader = PayloadReader::new(payload);
    let mut entries = Vec::new();
    while !reader.is_empty() {
        let namespace_len = reader.u16()? as usize;
        let namespace = reader.text(namespace_len)?;
        let key_len = reader.u16()? as usize;
        let key = reader.text(key_len)?;
        let type_tag = reader.u8()?;
        let size = reader.u32()?;
        entries.push(ConfigEntryDescriptor {
            namespace,
            key,
            type_tag,
            size,
        });
    }
    Ok(entries)
}

/// Decodes an `FSST` response (six little-endian `u64`s).
pub fn decode_filesystem_state(payload: &[u8]) -> Result<FilesystemState, ProtocolError> {
    let mut reader = PayloadReader::new(payload);
    let mut usage = || -> Result<StorageUsage, ProtocolError> {
        Ok(StorageUsage {
            size: reader.u64()?,
            free: reader.u64()?,
        })
    };
    Ok(FilesystemState {
        internal: usage()?,
        sd: usage()?,
        app: usage()?,
    })
}

/// Decodes a one-byte status response (`1` = success).
pub fn decode_status(payload: &[u8]) -> Result<bool, ProtocolError> {
    Ok(PayloadReader::new(payload).u8()? == 1)
}

/// Decodes a little-endian `u32` response, e.g. the bytes accepted by a chunk.
pub fn decode_u32(payload: &[u8]) -> Result<u32, ProtocolError> {
    PayloadReader::new(payload).u32()
}

/// Decodes the protocol version carried by a `SYNC` response.
pub fn decode_protocol_version(payload: &[u8]) -> Result<u16, ProtocolError> {
    PayloadReader::new(payload).u16()
}

/// Builds the payload of a read-side `CHNK` request.
pub fn encode_chunk_request(requested_size: u32) -> Bytes {
    Bytes::copy_from_slice(&requested_size.to_le_bytes())
}

fn put_short_str(buf: &mut BytesMut, field: &str, value: &str) -> Result<(), ProtocolError> {
    let len = u8::try_from(value.len()).map_err(|_| {
        ProtocolError::InvalidValue(format!("{} is longer than 255 bytes", field))
    })?;
    buf.put_u8(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

/// Builds the `[ns_len:1][ns][key_len:1][key]` header shared by NVS requests.
pub fn encode_config_key(namespace: &str, key: &str) -> Result<BytesMut, ProtocolError> {
    let mut buf = BytesMut::with_capacity(2 + namespace.len() + key.len());
    put_short_str(&mut buf, "namespace", namespace)?;
    put_short_str(&mut buf, "key", key)?;
    Ok(buf)
}

/// Builds an `NVSR` request.
pub fn encode_config_read(
    namespace: &str,
    key: &str,
    config_type: ConfigType,
) -> Result<Bytes, ProtocolError> {
    let mut buf = encode_config_key(namespace, key)?;
    buf.put_u8(config_type.tag());
    Ok(buf.freeze())
}

/// Builds an `NVSW` request.
pub fn encode_config_write(
    namespace: &str,
    key: &str,
    value: &ConfigValue,
) -> Result<Bytes, ProtocolError> {
    let mut buf = encode_config_key(namespace, key)?;
    buf.put_u8(value.config_type().tag());
    buf.put_slice(&value.encode());
    Ok(buf.freeze())
}

/// Builds an `APPW` allocation request.
///
/// Layout: `name_len:1, name, title_len:1, title, size:4, version:2`.
pub fn encode_app_allocation(
    name: &str,
    title: &str,
    size: u32,
    version: u16,
) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::with_capacity(8 + name.len() + title.len());
    put_short_str(&mut buf, "name", name)?;
    put_short_str(&mut buf, "title", title)?;
    buf.put_u32_le(size);
    buf.put_u16_le(version);
    Ok(buf.freeze())
}
