//! USB transport abstraction.
//!
//! The client never touches a USB stack directly. It drives a device through
//! [`UsbTransport`]: bulk endpoints carry frames, class control requests on
//! the vendor interface switch modes and configure the bridge.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::future::Future;
use thiserror::Error;

/// Strings reported by the device when it is opened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no device {vendor_id:04x}:{product_id:04x} found")]
    DeviceNotFound { vendor_id: u16, product_id: u16 },

    #[error("device has no vendor-class interface")]
    NoVendorInterface,

    #[error("device is not open")]
    NotOpen,

    #[error("interface {interface} has no bulk {direction} endpoint")]
    EndpointMissing {
        interface: u8,
        direction: &'static str,
    },

    #[error("device disconnected")]
    Disconnected,

    #[error("USB error: {0}")]
    Usb(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Raw access to the badge over USB.
///
/// All methods take `&self`: the reader task keeps a bulk read in flight
/// while requests are written from other tasks.
pub trait UsbTransport: Send + Sync + 'static {
    /// Opens the device and returns its descriptor strings.
    fn open(&self) -> impl Future<Output = Result<DeviceInfo, TransportError>> + Send;

    fn select_configuration(
        &self,
        configuration: u8,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Returns the index of the first vendor-class interface.
    fn find_vendor_interface(&self) -> impl Future<Output = Result<u8, TransportError>> + Send;

    /// Claims the interface and locates its bulk in/out endpoints.
    fn claim_interface(
        &self,
        interface: u8,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn release_interface(
        &self,
        interface: u8,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Class request to the claimed interface, no data stage.
    fn control_write(
        &self,
        request: u8,
        value: u16,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Class request from the claimed interface.
    fn control_read(
        &self,
        request: u8,
        length: u16,
    ) -> impl Future<Output = Result<Bytes, TransportError>> + Send;

    fn bulk_write(&self, data: Bytes) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Reads at most `max_length` bytes. Blocks until data arrives.
    fn bulk_read(
        &self,
        max_length: usize,
    ) -> impl Future<Output = Result<Bytes, TransportError>> + Send;

    fn close(&self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::DeviceNotFound {
            vendor_id: 0x16d0,
            product_id: 0x0f9a,
        };
        assert_eq!(err.to_string(), "no device 16d0:0f9a found");

        let err = TransportError::EndpointMissing {
            interface: 4,
            direction: "in",
        };
        assert!(err.to_string().contains("bulk in"));
    }
}
