//! Real USB transport backed by `nusb`.

use crate::transport::{DeviceInfo, TransportError, UsbTransport};
use bytes::Bytes;
use nusb::transfer::{
    ControlIn, ControlOut, ControlType, Direction, EndpointType, Recipient, RequestBuffer,
    TransferError,
};
use parking_lot::Mutex;

/// USB class code of vendor-specific interfaces.
const USB_CLASS_VENDOR: u8 = 0xFF;

#[derive(Clone)]
struct Claimed {
    interface: nusb::Interface,
    number: u8,
    endpoint_in: u8,
    endpoint_out: u8,
}

struct Opened {
    device: nusb::Device,
    claimed: Option<Claimed>,
}

/// Transport for a badge selected by vendor and product id.
pub struct NusbTransport {
    vendor_id: u16,
    product_id: u16,
    state: Mutex<Option<Opened>>,
}

impl NusbTransport {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            state: Mutex::new(None),
        }
    }

    fn device(&self) -> Result<nusb::Device, TransportError> {
        self.state
            .lock()
            .as_ref()
            .map(|opened| opened.device.clone())
            .ok_or(TransportError::NotOpen)
    }

    fn claimed(&self) -> Result<Claimed, TransportError> {
        self.state
            .lock()
            .as_ref()
            .ok_or(TransportError::NotOpen)?
            .claimed
            .clone()
            .ok_or_else(|| TransportError::Usb("no interface claimed".to_string()))
    }
}

fn usb_error(err: impl std::fmt::Display) -> TransportError {
    TransportError::Usb(err.to_string())
}

fn transfer_error(err: TransferError) -> TransportError {
    match err {
        TransferError::Disconnected => TransportError::Disconnected,
        other => TransportError::Usb(other.to_string()),
    }
}

impl UsbTransport for NusbTransport {
    async fn open(&self) -> Result<DeviceInfo, TransportError> {
        let found = nusb::list_devices()?
            .find(|d| d.vendor_id() == self.vendor_id && d.product_id() == self.product_id)
            .ok_or(TransportError::DeviceNotFound {
                vendor_id: self.vendor_id,
                product_id: self.product_id,
            })?;

        let device = found.open()?;
        let info = DeviceInfo {
            vendor_id: found.vendor_id(),
            product_id: found.product_id(),
            manufacturer: found.manufacturer_string().map(str::to_string),
            product: found.product_string().map(str::to_string),
            serial_number: found.serial_number().map(str::to_string),
        };
        tracing::debug!(
            bus = found.bus_number(),
            address = found.device_address(),
            "opened {:04x}:{:04x}",
            info.vendor_id,
            info.product_id
        );

        *self.state.lock() = Some(Opened {
            device,
            claimed: None,
        });
        Ok(info)
    }

    async fn select_configuration(&self, configuration: u8) -> Result<(), TransportError> {
        let device = self.device()?;
        let active = device
            .active_configuration()
            .map(|c| c.configuration_value())
            .ok();
        if active == Some(configuration) {
            return Ok(());
        }
        device.set_configuration(configuration).map_err(usb_error)
    }

    async fn find_vendor_interface(&self) -> Result<u8, TransportError> {
        let device = self.device()?;
        let config = device.active_configuration().map_err(usb_error)?;
        config
            .interface_alt_settings()
            .filter(|alt| alt.class() == USB_CLASS_VENDOR)
            .map(|alt| alt.interface_number())
            .min()
            .ok_or(TransportError::NoVendorInterface)
    }

    async fn claim_interface(&self, number: u8) -> Result<(), TransportError> {
        let device = self.device()?;
        let config = device.active_configuration().map_err(usb_error)?;

        let mut endpoint_in = None;
        let mut endpoint_out = None;
        for alt in config
            .interface_alt_settings()
            .filter(|alt| alt.interface_number() == number && alt.alternate_setting() == 0)
        {
            for endpoint in alt.endpoints() {
                if endpoint.transfer_type() != EndpointType::Bulk {
                    continue;
                }
                match endpoint.direction() {
                    Direction::In => endpoint_in = Some(endpoint.address()),
                    Direction::Out => endpoint_out = Some(endpoint.address()),
                }
            }
        }
        let endpoint_in = endpoint_in.ok_or(TransportError::EndpointMissing {
            interface: number,
            direction: "in",
        })?;
        let endpoint_out = endpoint_out.ok_or(TransportError::EndpointMissing {
            interface: number,
            direction: "out",
        })?;

        let interface = device.claim_interface(number)?;
        tracing::debug!(number, endpoint_in, endpoint_out, "interface claimed");

        if let Some(opened) = self.state.lock().as_mut() {
            opened.claimed = Some(Claimed {
                interface,
                number,
                endpoint_in,
                endpoint_out,
            });
        }
        Ok(())
    }

    async fn release_interface(&self, number: u8) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let opened = state.as_mut().ok_or(TransportError::NotOpen)?;
        match opened.claimed.take() {
            // Dropping the last handle releases the interface.
            Some(claimed) if claimed.number == number => Ok(()),
            other => {
                opened.claimed = other;
                Err(TransportError::Usb(format!("interface {} not claimed", number)))
            }
        }
    }

    async fn control_write(&self, request: u8, value: u16) -> Result<(), TransportError> {
        let claimed = self.claimed()?;
        claimed
            .interface
            .control_out(ControlOut {
                control_type: ControlType::Class,
                recipient: Recipient::Interface,
                request,
                value,
                index: claimed.number as u16,
                data: &[],
            })
            .await
            .into_result()
            .map(|_| ())
            .map_err(transfer_error)
    }

    async fn control_read(&self, request: u8, length: u16) -> Result<Bytes, TransportError> {
        let claimed = self.claimed()?;
        claimed
            .interface
            .control_in(ControlIn {
                control_type: ControlType::Class,
                recipient: Recipient::Interface,
                request,
                value: 0,
                index: claimed.number as u16,
                length,
            })
            .await
            .into_result()
            .map(Bytes::from)
            .map_err(transfer_error)
    }

    async fn bulk_write(&self, data: Bytes) -> Result<(), TransportError> {
        let claimed = self.claimed()?;
        claimed
            .interface
            .bulk_out(claimed.endpoint_out, data.to_vec())
            .await
            .into_result()
            .map(|_| ())
            .map_err(transfer_error)
    }

    async fn bulk_read(&self, max_length: usize) -> Result<Bytes, TransportError> {
        let claimed = self.claimed()?;
        claimed
            .interface
            .bulk_in(claimed.endpoint_in, RequestBuffer::new(max_length))
            .await
            .into_result()
            .map(Bytes::from)
            .map_err(transfer_error)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.state
            .lock()
            .take()
            .map(|_| ())
            .ok_or(TransportError::NotOpen)
    }
}
