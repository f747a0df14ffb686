//! # badgelink-client
//!
//! Client library for talking to a badge over USB.
//!
//! This crate provides:
//! - A transport trait over bulk and control transfers, with a scripted
//!   mock (feature `mock`) and an optional `nusb` implementation (feature `usb`)
//! - The control-channel bootstrap into protocol mode
//! - Transaction management with out-of-order response matching and
//!   resynchronization
//! - Chunked file and app transfers with progress reporting
//! - High-level filesystem, app and configuration operations

pub mod bootstrap;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod transfer;
pub mod transport;
#[cfg(feature = "usb")]
pub mod usb;

pub use bootstrap::{BootMode, ControlRequest};
pub use client::Client;
pub use config::{ClientConfig, ConfigError};
pub use connection::Connection;
pub use error::ClientError;
pub use events::{ConnectionEvent, ConnectionState};
pub use transfer::{TransferProgress, TransferStage};
pub use transport::{DeviceInfo, TransportError, UsbTransport};
#[cfg(feature = "usb")]
pub use usb::NusbTransport;
