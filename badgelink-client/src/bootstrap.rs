//! Out-of-band control channel and the link bootstrap sequence.
//!
//! Before frames can flow, the USB bridge is told to assert its state line,
//! set the UART baud rate and boot the badge firmware into protocol mode.
//! Disconnecting reverses the sequence.

use crate::config::UsbConfig;
use crate::error::ClientError;
use crate::transport::{DeviceInfo, TransportError, UsbTransport};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Class control requests understood by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlRequest {
    State = 0x22,
    Reset = 0x23,
    BaudRate = 0x24,
    Mode = 0x25,
    ModeGet = 0x26,
    FirmwareVersionGet = 0x27,
}

impl ControlRequest {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for ControlRequest {
    type Error = u8;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0x22 => Ok(ControlRequest::State),
            0x23 => Ok(ControlRequest::Reset),
            0x24 => Ok(ControlRequest::BaudRate),
            0x25 => Ok(ControlRequest::Mode),
            0x26 => Ok(ControlRequest::ModeGet),
            0x27 => Ok(ControlRequest::FirmwareVersionGet),
            other => Err(other),
        }
    }
}

/// Firmware boot modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum BootMode {
    Normal = 0,
    WebUsbLegacy = 1,
    FpgaDownload = 2,
    WebUsb = 3,
}

impl BootMode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(BootMode::Normal),
            1 => Some(BootMode::WebUsbLegacy),
            2 => Some(BootMode::FpgaDownload),
            3 => Some(BootMode::WebUsb),
            _ => None,
        }
    }
}

impl fmt::Display for BootMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BootMode::Normal => "normal",
            BootMode::WebUsbLegacy => "webusb (legacy)",
            BootMode::FpgaDownload => "fpga download",
            BootMode::WebUsb => "webusb",
        };
        f.write_str(name)
    }
}

/// Typed wrapper over the control requests of a transport.
pub struct Control<'a, T> {
    transport: &'a T,
}

impl<'a, T: UsbTransport> Control<'a, T> {
    pub fn new(transport: &'a T) -> Self {
        Self { transport }
    }

    pub async fn set_state(&self, enabled: bool) -> Result<(), TransportError> {
        self.write(ControlRequest::State, enabled as u16).await
    }

    /// Resets the badge; `bootloader` selects the ROM bootloader.
    pub async fn reset(&self, bootloader: bool) -> Result<(), TransportError> {
        self.write(ControlRequest::Reset, bootloader as u16).await
    }

    /// The bridge takes the baud rate in units of 100.
    pub async fn set_baud_rate(&self, baud_rate: u32) -> Result<(), TransportError> {
        let value = u16::try_from(baud_rate / 100)
            .map_err(|_| TransportError::Usb(format!("baud rate {} out of range", baud_rate)))?;
        self.write(ControlRequest::BaudRate, value).await
    }

    pub async fn set_mode(&self, mode: BootMode) -> Result<(), TransportError> {
        self.write(ControlRequest::Mode, mode as u16).await
    }

    /// Reads the raw boot mode byte.
    pub async fn mode(&self) -> Result<u8, TransportError> {
        self.read_u8(ControlRequest::ModeGet).await
    }

    pub async fn firmware_version(&self) -> Result<u8, TransportError> {
        self.read_u8(ControlRequest::FirmwareVersionGet).await
    }

    async fn write(&self, request: ControlRequest, value: u16) -> Result<(), TransportError> {
        tracing::debug!(?request, value, "control write");
        self.transport.control_write(request.code(), value).await
    }

    async fn read_u8(&self, request: ControlRequest) -> Result<u8, TransportError> {
        let data = self.transport.control_read(request.code(), 1).await?;
        data.first().copied().ok_or_else(|| {
            TransportError::Usb(format!("empty response to control request {:?}", request))
        })
    }
}

/// Opens the device and boots it into protocol mode.
///
/// Returns the device strings and the claimed interface index.
pub async fn enter_protocol_mode<T: UsbTransport>(
    transport: &T,
    config: &UsbConfig,
) -> Result<(DeviceInfo, u8), ClientError> {
    let info = transport.open().await?;
    tracing::debug!(
        manufacturer = ?info.manufacturer,
        product = ?info.product,
        "device opened"
    );

    transport.select_configuration(config.configuration).await?;
    let interface = match config.interface {
        Some(index) => index,
        None => transport.find_vendor_interface().await?,
    };
    transport.claim_interface(interface).await?;
    tracing::debug!(interface, "interface claimed");

    let control = Control::new(transport);
    control.set_state(true).await?;
    control.set_baud_rate(config.baud_rate).await?;

    let mode = control.mode().await?;
    if mode != BootMode::WebUsb as u8 {
        tracing::debug!(current = mode, "switching firmware to webusb mode");
        control.set_mode(BootMode::WebUsb).await?;
        control.reset(false).await?;
    }

    Ok((info, interface))
}

/// Returns the badge to normal firmware and releases the device.
///
/// Every step is attempted; failures are logged and swallowed.
pub async fn leave_protocol_mode<T: UsbTransport>(transport: &T, interface: u8, reset: bool) {
    let control = Control::new(transport);
    if let Err(e) = control.set_mode(BootMode::Normal).await {
        tracing::debug!("teardown: set mode failed: {}", e);
    }
    if reset {
        if let Err(e) = control.reset(false).await {
            tracing::debug!("teardown: reset failed: {}", e);
        }
    }
    if let Err(e) = control.set_state(false).await {
        tracing::debug!("teardown: clear state failed: {}", e);
    }
    if let Err(e) = transport.release_interface(interface).await {
        tracing::debug!("teardown: release interface failed: {}", e);
    }
    if let Err(e) = transport.close().await {
        tracing::debug!("teardown: close failed: {}", e);
    }
}
