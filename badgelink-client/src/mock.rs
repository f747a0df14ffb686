//! In-memory scripted badge for tests.
//!
//! `MockTransport` decodes every bulk write into a [`Frame`], records it and
//! hands it to an optional responder closure. Whatever bytes the responder
//! returns are queued for the next bulk read. Tests can also inject raw
//! bytes, inspect control requests and sever the link.

use crate::bootstrap::{BootMode, ControlRequest};
use crate::transport::{DeviceInfo, TransportError, UsbTransport};
use badgelink_protocol::{Command, Frame};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

/// Produces the device's reply bytes for a request frame.
pub type Responder = Box<dyn FnMut(&Frame) -> Option<Bytes> + Send>;

/// A recorded control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCall {
    Write { request: u8, value: u16 },
    Read { request: u8, length: u16 },
}

struct MockState {
    info: DeviceInfo,
    open: bool,
    severed: bool,
    configuration: Option<u8>,
    vendor_interface: Option<u8>,
    claimed: Option<u8>,
    mode: u8,
    firmware_version: u8,
    inbound: BytesMut,
    responder: Option<Responder>,
    frames: Vec<Frame>,
    controls: Vec<ControlCall>,
}

pub struct MockTransport {
    state: Mutex<MockState>,
    inbound_ready: Notify,
    written_tx: mpsc::UnboundedSender<Frame>,
    written_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>,
}

impl MockTransport {
    pub fn new() -> Self {
        let (written_tx, written_rx) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(MockState {
                info: DeviceInfo {
                    vendor_id: 0x16d0,
                    product_id: 0x0f9a,
                    manufacturer: Some("Badge.team".to_string()),
                    product: Some("MCH2022 badge".to_string()),
                    serial_number: Some("0000000001".to_string()),
                },
                open: false,
                severed: false,
                configuration: None,
                vendor_interface: Some(4),
                claimed: None,
                mode: BootMode::Normal as u8,
                firmware_version: 1,
                inbound: BytesMut::new(),
                responder: None,
                frames: Vec::new(),
                controls: Vec::new(),
            }),
            inbound_ready: Notify::new(),
            written_tx,
            written_rx: tokio::sync::Mutex::new(written_rx),
        }
    }

    pub fn with_responder<F>(self, responder: F) -> Self
    where
        F: FnMut(&Frame) -> Option<Bytes> + Send + 'static,
    {
        self.set_responder(responder);
        self
    }

    pub fn with_mode(self, mode: BootMode) -> Self {
        self.state.lock().mode = mode as u8;
        self
    }

    pub fn with_vendor_interface(self, interface: Option<u8>) -> Self {
        self.state.lock().vendor_interface = interface;
        self
    }

    pub fn with_firmware_version(self, version: u8) -> Self {
        self.state.lock().firmware_version = version;
        self
    }

    /// Replaces the responder.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&Frame) -> Option<Bytes> + Send + 'static,
    {
        self.state.lock().responder = Some(Box::new(responder));
    }

    /// Queues raw bytes for the reader.
    pub fn inject(&self, data: &[u8]) {
        self.state.lock().inbound.extend_from_slice(data);
        self.inbound_ready.notify_one();
    }

    /// Makes every further transfer fail as if the cable was pulled.
    pub fn sever(&self) {
        self.state.lock().severed = true;
        self.inbound_ready.notify_one();
    }

    /// Frames written so far, in order.
    pub fn written_frames(&self) -> Vec<Frame> {
        self.state.lock().frames.clone()
    }

    /// Waits for the next frame written after the previous call.
    pub async fn next_write(&self) -> Option<Frame> {
        self.written_rx.lock().await.recv().await
    }

    pub fn controls(&self) -> Vec<ControlCall> {
        self.state.lock().controls.clone()
    }

    pub fn clear_controls(&self) {
        self.state.lock().controls.clear();
    }

    /// Raw boot mode byte last written through the control channel.
    pub fn mode(&self) -> u8 {
        self.state.lock().mode
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    pub fn configuration(&self) -> Option<u8> {
        self.state.lock().configuration
    }

    pub fn claimed_interface(&self) -> Option<u8> {
        self.state.lock().claimed
    }

    fn check_link(state: &MockState) -> Result<(), TransportError> {
        if state.severed {
            return Err(TransportError::Disconnected);
        }
        if !state.open {
            return Err(TransportError::NotOpen);
        }
        Ok(())
    }

    fn check_claimed(state: &MockState) -> Result<u8, TransportError> {
        Self::check_link(state)?;
        state
            .claimed
            .ok_or_else(|| TransportError::Usb("no interface claimed".to_string()))
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Encodes a successful reply echoing the request's identifier and command.
pub fn reply(request: &Frame, payload: impl Into<Bytes>) -> Bytes {
    reply_with(request, request.command, payload)
}

/// Encodes a reply carrying a different response command.
pub fn reply_with(request: &Frame, command: Command, payload: impl Into<Bytes>) -> Bytes {
    encode(&Frame::new(request.identifier, command, payload))
}

/// Encodes a frame, flipping the last payload byte so its checksum fails.
pub fn corrupted(frame: &Frame) -> Bytes {
    let mut data = BytesMut::from(encode(frame).as_ref());
    if let Some(last) = data.last_mut() {
        *last ^= 0xFF;
    }
    data.freeze()
}

/// Encodes a frame into bytes.
pub fn encode(frame: &Frame) -> Bytes {
    frame
        .encode()
        .map(BytesMut::freeze)
        .unwrap_or_default()
}

impl UsbTransport for MockTransport {
    async fn open(&self) -> Result<DeviceInfo, TransportError> {
        let mut state = self.state.lock();
        if state.severed {
            return Err(TransportError::Disconnected);
        }
        state.open = true;
        Ok(state.info.clone())
    }

    async fn select_configuration(&self, configuration: u8) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        Self::check_link(&state)?;
        state.configuration = Some(configuration);
        Ok(())
    }

    async fn find_vendor_interface(&self) -> Result<u8, TransportError> {
        let state = self.state.lock();
        Self::check_link(&state)?;
        state.vendor_interface.ok_or(TransportError::NoVendorInterface)
    }

    async fn claim_interface(&self, interface: u8) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        Self::check_link(&state)?;
        state.claimed = Some(interface);
        Ok(())
    }

    async fn release_interface(&self, interface: u8) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        Self::check_link(&state)?;
        if state.claimed != Some(interface) {
            return Err(TransportError::Usb(format!("interface {} not claimed", interface)));
        }
        state.claimed = None;
        Ok(())
    }

    async fn control_write(&self, request: u8, value: u16) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        Self::check_claimed(&state)?;
        state.controls.push(ControlCall::Write { request, value });
        if let Ok(ControlRequest::Mode) = ControlRequest::try_from(request) {
            state.mode = value as u8;
        }
        Ok(())
    }

    async fn control_read(&self, request: u8, length: u16) -> Result<Bytes, TransportError> {
        let mut state = self.state.lock();
        Self::check_claimed(&state)?;
        state.controls.push(ControlCall::Read { request, length });
        match ControlRequest::try_from(request) {
            Ok(ControlRequest::ModeGet) => Ok(Bytes::copy_from_slice(&[state.mode])),
            Ok(ControlRequest::FirmwareVersionGet) => {
                Ok(Bytes::copy_from_slice(&[state.firmware_version]))
            }
            _ => Err(TransportError::Usb(format!(
                "control request {:#04x} stalled",
                request
            ))),
        }
    }

    async fn bulk_write(&self, data: Bytes) -> Result<(), TransportError> {
        let reply = {
            let mut state = self.state.lock();
            Self::check_claimed(&state)?;
            let frame = Frame::decode(&data)
                .map_err(|e| TransportError::Usb(format!("mock received bad frame: {}", e)))?;
            state.frames.push(frame.clone());
            let _ = self.written_tx.send(frame.clone());
            let reply = state.responder.as_mut().and_then(|respond| respond(&frame));
            if let Some(bytes) = &reply {
                state.inbound.extend_from_slice(bytes);
            }
            reply
        };
        if reply.is_some() {
            self.inbound_ready.notify_one();
        }
        Ok(())
    }

    async fn bulk_read(&self, max_length: usize) -> Result<Bytes, TransportError> {
        loop {
            {
                let mut state = self.state.lock();
                Self::check_link(&state)?;
                if !state.inbound.is_empty() {
                    let n = max_length.min(state.inbound.len());
                    return Ok(state.inbound.split_to(n).freeze());
                }
            }
            self.inbound_ready.notified().await;
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock();
            Self::check_link(&state)?;
            state.open = false;
            state.claimed = None;
            state.inbound.clear();
        }
        self.inbound_ready.notify_one();
        Ok(())
    }
}
