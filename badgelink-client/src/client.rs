//! High-level client API.

use crate::bootstrap::{self, Control};
use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::ClientError;
use crate::events::{ConnectionEvent, ConnectionState};
use crate::transfer::{self, TransferProgress, TransferStage};
use crate::transport::{DeviceInfo, UsbTransport};
use badgelink_protocol::message::{
    decode_configuration_listing, decode_directory_listing, decode_filesystem_state,
    decode_package_listing, decode_status, encode_app_allocation, encode_config_key,
    encode_config_read, encode_config_write,
};
use badgelink_protocol::{
    Command, ConfigEntryDescriptor, ConfigType, ConfigValue, DirectoryEntry, FilesystemState,
    PackageDescriptor,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Longest namespace or key the device stores.
pub const MAX_KEY_LEN: usize = 16;

/// State of an established link.
#[derive(Debug, Clone)]
struct Link {
    info: DeviceInfo,
    interface: u8,
    protocol_version: u16,
}

/// High-level client for a badge.
pub struct Client<T: UsbTransport> {
    config: ClientConfig,
    connection: Arc<Connection<T>>,
    link: Mutex<Option<Link>>,
    phase: Mutex<ConnectionState>,
    /// Serializes connect and disconnect.
    lifecycle: tokio::sync::Mutex<()>,
}

impl<T: UsbTransport> Client<T> {
    /// Creates a new client (not yet connected).
    pub fn new(transport: Arc<T>, config: ClientConfig) -> Self {
        let connection = Connection::new(transport, config.usb.read_size, config.protocol.clone());
        Self {
            config,
            connection: Arc::new(connection),
            link: Mutex::new(None),
            phase: Mutex::new(ConnectionState::Disconnected),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Returns the underlying connection.
    pub fn connection(&self) -> Arc<Connection<T>> {
        self.connection.clone()
    }

    /// Subscribes to connection lifecycle events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connection.subscribe()
    }

    /// Opens the device, boots it into protocol mode and synchronizes.
    ///
    /// Returns the device's protocol version.
    pub async fn connect(&self) -> Result<u16, ClientError> {
        let _guard = self.lifecycle.lock().await;
        if self.link.lock().is_some() {
            return Err(ClientError::AlreadyConnected);
        }

        self.set_phase(ConnectionState::BootstrappingControl);
        let transport = self.connection.transport().as_ref();
        let (info, interface) = match bootstrap::enter_protocol_mode(transport, &self.config.usb).await
        {
            Ok(link) => link,
            Err(e) => {
                tracing::debug!("bootstrap failed: {}", e);
                if let Err(close_err) = transport.close().await {
                    tracing::debug!("close after failed bootstrap: {}", close_err);
                }
                self.set_phase(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        self.set_phase(ConnectionState::AwaitingSync);
        self.connection.shutdown();
        self.connection.spawn_read_loop();

        let version = match self.connection.resync().await {
            Ok(version) => version,
            Err(e) => {
                self.teardown(interface, self.config.usb.reset_on_disconnect)
                    .await;
                return Err(e);
            }
        };

        let minimum = self.config.protocol.min_version;
        if version < minimum {
            tracing::error!(version, minimum, "protocol version not supported");
            self.teardown(interface, self.config.usb.reset_on_disconnect)
                .await;
            return Err(ClientError::UnsupportedProtocol { version, minimum });
        }

        tracing::info!(
            version,
            product = info.product.as_deref().unwrap_or("unknown"),
            "connected"
        );
        *self.link.lock() = Some(Link {
            info,
            interface,
            protocol_version: version,
        });
        self.set_phase(ConnectionState::Synchronized);
        self.connection.emit(ConnectionEvent::Connected {
            protocol_version: version,
        });
        Ok(version)
    }

    /// Returns the badge to normal firmware and closes the device.
    ///
    /// Teardown failures are logged, not returned. `reset` reboots the badge.
    pub async fn disconnect(&self, reset: bool) -> Result<(), ClientError> {
        let _guard = self.lifecycle.lock().await;
        let link = self.link.lock().take().ok_or(ClientError::NotConnected)?;
        self.teardown(link.interface, reset).await;
        tracing::info!("disconnected");
        self.connection.emit(ConnectionEvent::Disconnected);
        Ok(())
    }

    async fn teardown(&self, interface: u8, reset: bool) {
        self.connection.stop_listening().await;
        bootstrap::leave_protocol_mode(self.connection.transport().as_ref(), interface, reset).await;
        self.connection.shutdown();
        self.set_phase(ConnectionState::Disconnected);
    }

    /// Returns whether the link is up and its reader is running.
    pub fn is_connected(&self) -> bool {
        self.link.lock().is_some() && self.connection.is_listening()
    }

    pub fn state(&self) -> ConnectionState {
        match *self.phase.lock() {
            ConnectionState::Disconnected => ConnectionState::Disconnected,
            ConnectionState::BootstrappingControl => ConnectionState::BootstrappingControl,
            // The reader died underneath an established link.
            _ if !self.connection.is_listening() => ConnectionState::Disconnected,
            _ if self.connection.is_synchronized() => ConnectionState::Synchronized,
            _ => ConnectionState::AwaitingSync,
        }
    }

    /// Manufacturer, product and serial strings of the connected device.
    pub fn device_info(&self) -> Option<DeviceInfo> {
        self.live_link().map(|link| link.info)
    }

    /// Protocol version reported by the first sync.
    pub fn protocol_version(&self) -> Option<u16> {
        self.live_link().map(|link| link.protocol_version)
    }

    /// The established link, unless its reader has stopped.
    fn live_link(&self) -> Option<Link> {
        if !self.connection.is_listening() {
            return None;
        }
        self.link.lock().clone()
    }

    /// Reads the firmware version over the control channel.
    pub async fn control_firmware_version(&self) -> Result<u8, ClientError> {
        self.ensure_connected()?;
        let control = Control::new(self.connection.transport().as_ref());
        Ok(control.firmware_version().await?)
    }

    fn set_phase(&self, state: ConnectionState) {
        *self.phase.lock() = state;
    }

    // =========================================================================
    // Helper methods
    // =========================================================================

    fn ensure_connected(&self) -> Result<(), ClientError> {
        if self.link.lock().is_none() {
            return Err(ClientError::NotConnected);
        }
        Ok(())
    }

    fn request_timeout(&self) -> Duration {
        self.config.protocol.request_timeout()
    }

    async fn request(
        &self,
        command: Command,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, ClientError> {
        self.ensure_connected()?;
        self.connection.sync_if_needed().await?;
        self.connection.transact(command, payload, timeout).await
    }

    async fn request_status(&self, command: Command, payload: Bytes) -> Result<bool, ClientError> {
        let response = self.request(command, payload, self.request_timeout()).await?;
        Ok(decode_status(&response)?)
    }

    /// Closes the open handle, keeping the transfer's error if it failed.
    async fn finish_transfer<R>(
        &self,
        outcome: Result<R, ClientError>,
    ) -> Result<R, ClientError> {
        let closed = self.filesystem_close().await;
        let value = outcome?;
        if !closed? {
            tracing::warn!("device reported failure closing the transfer handle");
        }
        Ok(value)
    }

    // =========================================================================
    // System operations
    // =========================================================================

    /// Sends data and returns what the device echoed.
    pub async fn ping(&self, data: &[u8]) -> Result<Bytes, ClientError> {
        self.request(
            Command::PING,
            Bytes::copy_from_slice(data),
            self.request_timeout(),
        )
        .await
    }

    // =========================================================================
    // Filesystem operations
    // =========================================================================

    pub async fn filesystem_list(&self, path: &str) -> Result<Vec<DirectoryEntry>, ClientError> {
        let response = self
            .request(Command::FILESYSTEM_LIST, path_payload(path), self.request_timeout())
            .await?;
        Ok(decode_directory_listing(&response)?)
    }

    pub async fn filesystem_exists(&self, path: &str) -> Result<bool, ClientError> {
        self.request_status(Command::FILESYSTEM_EXISTS, path_payload(path))
            .await
    }

    pub async fn filesystem_create_directory(&self, path: &str) -> Result<bool, ClientError> {
        self.request_status(Command::FILESYSTEM_CREATE_DIRECTORY, path_payload(path))
            .await
    }

    pub async fn filesystem_remove(&self, path: &str) -> Result<bool, ClientError> {
        self.request_status(Command::FILESYSTEM_REMOVE, path_payload(path))
            .await
    }

    /// Size and free space of the internal flash, SD card and app partition.
    pub async fn filesystem_state(&self) -> Result<FilesystemState, ClientError> {
        let response = self
            .request(Command::FILESYSTEM_STATE, Bytes::new(), self.request_timeout())
            .await?;
        Ok(decode_filesystem_state(&response)?)
    }

    /// Reads a whole file. Returns `None` if the device cannot open it.
    pub async fn filesystem_read(&self, path: &str) -> Result<Option<Bytes>, ClientError> {
        let opened = self
            .request_status(Command::FILESYSTEM_FILE_READ, path_payload(path))
            .await?;
        if !opened {
            return Ok(None);
        }

        let outcome = transfer::read_chunks(
            &self.connection,
            self.config.transfer.fs_read_chunk,
            self.request_timeout(),
        )
        .await;
        self.finish_transfer(outcome).await.map(Some)
    }

    /// Writes a whole file. Returns whether every byte was accepted.
    pub async fn filesystem_write<F>(
        &self,
        path: &str,
        data: &[u8],
        mut progress: F,
    ) -> Result<bool, ClientError>
    where
        F: FnMut(TransferProgress) + Send,
    {
        self.ensure_connected()?;
        self.connection.sync_if_needed().await?;
        progress(TransferProgress::new(TransferStage::Creating, 0));

        let opened = self
            .request_status(Command::FILESYSTEM_FILE_WRITE, path_payload(path))
            .await?;
        if !opened {
            return Err(ClientError::OpenFailed(path.to_string()));
        }

        let outcome = transfer::write_chunks(
            &self.connection,
            data,
            self.config.transfer.fs_write_chunk,
            self.request_timeout(),
            &mut progress,
        )
        .await;
        let position = self.finish_transfer(outcome).await?;
        Ok(position == data.len())
    }

    /// Closes the file or app handle opened by a read or write.
    pub async fn filesystem_close(&self) -> Result<bool, ClientError> {
        self.request_status(Command::FILESYSTEM_FILE_CLOSE, Bytes::new())
            .await
    }

    // =========================================================================
    // App operations
    // =========================================================================

    pub async fn app_list(&self) -> Result<Vec<PackageDescriptor>, ClientError> {
        let response = self
            .request(Command::APP_LIST, Bytes::new(), self.request_timeout())
            .await?;
        Ok(decode_package_listing(&response)?)
    }

    /// Reads an installed app. Returns `None` if it does not exist.
    pub async fn app_read(&self, name: &str) -> Result<Option<Bytes>, ClientError> {
        let opened = self
            .request_status(Command::APP_READ, path_payload(name))
            .await?;
        if !opened {
            return Ok(None);
        }

        let outcome = transfer::read_chunks(
            &self.connection,
            self.config.transfer.app_read_chunk,
            self.request_timeout(),
        )
        .await;
        self.finish_transfer(outcome).await.map(Some)
    }

    /// Allocates and writes an app. Returns whether every byte was accepted.
    pub async fn app_write<F>(
        &self,
        name: &str,
        title: &str,
        version: u16,
        data: &[u8],
        mut progress: F,
    ) -> Result<bool, ClientError>
    where
        F: FnMut(TransferProgress) + Send,
    {
        let size = u32::try_from(data.len()).map_err(|_| {
            ClientError::InvalidArgument(format!("app of {} bytes is too large", data.len()))
        })?;
        let request = encode_app_allocation(name, title, size, version)
            .map_err(|e| ClientError::InvalidArgument(e.to_string()))?;

        progress(TransferProgress::new(TransferStage::Allocating, 0));
        let response = self
            .request(
                Command::APP_WRITE,
                request,
                self.config.protocol.allocate_timeout(),
            )
            .await?;
        if !decode_status(&response)? {
            return Err(ClientError::OpenFailed(name.to_string()));
        }

        let outcome = transfer::write_chunks(
            &self.connection,
            data,
            self.config.transfer.app_write_chunk,
            self.request_timeout(),
            &mut progress,
        )
        .await;
        let position = self.finish_transfer(outcome).await?;
        Ok(position == data.len())
    }

    pub async fn app_remove(&self, name: &str) -> Result<bool, ClientError> {
        self.request_status(Command::APP_REMOVE, path_payload(name))
            .await
    }

    /// Starts an app. On success the badge reboots into it, so the link is
    /// torn down without a reset.
    pub async fn app_run(&self, name: &str) -> Result<bool, ClientError> {
        let started = self
            .request_status(Command::APP_RUN, path_payload(name))
            .await?;
        if started {
            if let Err(e) = self.disconnect(false).await {
                tracing::debug!("disconnect after app start: {}", e);
            }
        }
        Ok(started)
    }

    // =========================================================================
    // Configuration operations
    // =========================================================================

    /// Lists stored entries, optionally restricted to one namespace.
    pub async fn configuration_list(
        &self,
        namespace: &str,
    ) -> Result<Vec<ConfigEntryDescriptor>, ClientError> {
        validate_key_field("namespace", namespace, 0)?;
        let response = self
            .request(
                Command::CONFIGURATION_LIST,
                path_payload(namespace),
                self.request_timeout(),
            )
            .await?;
        Ok(decode_configuration_listing(&response)?)
    }

    /// Reads a value. Returns `None` if the entry does not exist.
    pub async fn configuration_read(
        &self,
        namespace: &str,
        key: &str,
        config_type: ConfigType,
    ) -> Result<Option<ConfigValue>, ClientError> {
        validate_key_field("namespace", namespace, 1)?;
        validate_key_field("key", key, 1)?;
        let request = encode_config_read(namespace, key, config_type)?;
        let response = self
            .request(Command::CONFIGURATION_READ, request, self.request_timeout())
            .await?;
        if response.is_empty() {
            return Ok(None);
        }
        Ok(Some(ConfigValue::decode(config_type, &response)?))
    }

    pub async fn configuration_write(
        &self,
        namespace: &str,
        key: &str,
        value: &ConfigValue,
    ) -> Result<bool, ClientError> {
        validate_key_field("namespace", namespace, 1)?;
        validate_key_field("key", key, 1)?;
        let request = encode_config_write(namespace, key, value)?;
        self.request_status(Command::CONFIGURATION_WRITE, request)
            .await
    }

    pub async fn configuration_remove(&self, namespace: &str, key: &str) -> Result<bool, ClientError> {
        validate_key_field("namespace", namespace, 1)?;
        validate_key_field("key", key, 1)?;
        let request = encode_config_key(namespace, key)?.freeze();
        self.request_status(Command::CONFIGURATION_REMOVE, request)
            .await
    }
}

fn path_payload(path: &str) -> Bytes {
    Bytes::copy_from_slice(path.as_bytes())
}

fn validate_key_field(field: &str, value: &str, min: usize) -> Result<(), ClientError> {
    let len = value.len();
    if len < min || len > MAX_KEY_LEN {
        return Err(ClientError::InvalidArgument(format!(
            "{} must be {} to {} bytes long, got {}",
            field, min, MAX_KEY_LEN, len
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::BootMode;
    use crate::mock::{reply, reply_with, ControlCall, MockTransport};
    use badgelink_protocol::{EntryKind, Frame};
    use bytes::{Buf, BufMut, BytesMut};
    use std::collections::BTreeMap;

    const MODIFIED: u64 = 1_700_000_000;

    enum Handle {
        Read(Vec<u8>),
        WriteFile(String, Vec<u8>),
        WriteApp(String, String, u16, Vec<u8>),
    }

    /// A badge with an in-memory filesystem, app store and NVS.
    struct FakeBadge {
        version: u16,
        files: BTreeMap<String, Vec<u8>>,
        dirs: Vec<String>,
        apps: BTreeMap<String, (String, u16, Vec<u8>)>,
        nvs: BTreeMap<(String, String), (u8, Vec<u8>)>,
        handle: Option<Handle>,
        max_accept: usize,
    }

    impl FakeBadge {
        fn new() -> Self {
            Self {
                version: 2,
                files: BTreeMap::new(),
                dirs: vec!["/internal".to_string()],
                apps: BTreeMap::new(),
                nvs: BTreeMap::new(),
                handle: None,
                max_accept: usize::MAX,
            }
        }

        fn status(ok: bool) -> Vec<u8> {
            vec![ok as u8]
        }

        fn text(payload: &[u8]) -> String {
            String::from_utf8_lossy(payload).into_owned()
        }

        fn short_str(buf: &mut Bytes) -> String {
            let len = buf.get_u8() as usize;
            let s = String::from_utf8_lossy(&buf[..len]).into_owned();
            buf.advance(len);
            s
        }

        fn respond(&mut self, frame: &Frame) -> Vec<u8> {
            let payload = frame.payload.clone();
            match frame.command {
                Command::SYNC => self.version.to_le_bytes().to_vec(),
                Command::PING => payload.to_vec(),
                Command::FILESYSTEM_LIST => {
                    let dir = Self::text(&payload);
                    let mut out = BytesMut::new();
                    let prefix = format!("{}/", dir.trim_end_matches('/'));
                    let children = self
                        .dirs
                        .iter()
                        .filter_map(|d| d.strip_prefix(&prefix).map(|n| (2u8, n.to_string(), 0u32)))
                        .chain(self.files.iter().filter_map(|(f, data)| {
                            f.strip_prefix(&prefix).map(|n| (1u8, n.to_string(), data.len() as u32))
                        }));
                    for (kind, name, size) in children {
                        out.put_u8(kind);
                        out.put_u32_le(name.len() as u32);
                        out.put_slice(name.as_bytes());
                        out.put_i32_le(0);
                        out.put_u32_le(size);
                        out.put_u64_le(MODIFIED);
                    }
                    out.to_vec()
                }
                Command::FILESYSTEM_EXISTS => {
                    let path = Self::text(&payload);
                    Self::status(self.files.contains_key(&path) || self.dirs.contains(&path))
                }
                Command::FILESYSTEM_CREATE_DIRECTORY => {
                    self.dirs.push(Self::text(&payload));
                    Self::status(true)
                }
                Command::FILESYSTEM_REMOVE => {
                    Self::status(self.files.remove(&Self::text(&payload)).is_some())
                }
                Command::FILESYSTEM_STATE => {
                    let mut out = BytesMut::new();
                    for value in [1000u64, 400, 0, 0, 2000, 1500] {
                        out.put_u64_le(value);
                    }
                    out.to_vec()
                }
                Command::FILESYSTEM_FILE_READ => match self.files.get(&Self::text(&payload)) {
                    Some(data) => {
                        self.handle = Some(Handle::Read(data.clone()));
                        Self::status(true)
                    }
                    None => Self::status(false),
                },
                Command::FILESYSTEM_FILE_WRITE => {
                    let path = Self::text(&payload);
                    let writable = !path.starts_with("/readonly");
                    if writable {
                        self.handle = Some(Handle::WriteFile(path, Vec::new()));
                    }
                    Self::status(writable)
                }
                Command::TRANSFER_CHUNK => match self.handle.as_mut() {
                    Some(Handle::Read(data)) => {
                        let requested = (&payload[..]).get_u32_le() as usize;
                        let n = requested.min(data.len());
                        data.drain(..n).collect()
                    }
                    Some(Handle::WriteFile(_, data)) | Some(Handle::WriteApp(_, _, _, data)) => {
                        let n = payload.len().min(self.max_accept);
                        data.extend_from_slice(&payload[..n]);
                        (n as u32).to_le_bytes().to_vec()
                    }
                    None => 0u32.to_le_bytes().to_vec(),
                },
                Command::FILESYSTEM_FILE_CLOSE => match self.handle.take() {
                    Some(Handle::WriteFile(path, data)) => {
                        self.files.insert(path, data);
                        Self::status(true)
                    }
                    Some(Handle::WriteApp(name, title, version, data)) => {
                        self.apps.insert(name, (title, version, data));
                        Self::status(true)
                    }
                    Some(Handle::Read(_)) => Self::status(true),
                    None => Self::status(false),
                },
                Command::APP_LIST => {
                    let mut out = BytesMut::new();
                    for (name, (title, version, data)) in &self.apps {
                        out.put_u16_le(name.len() as u16);
                        out.put_slice(name.as_bytes());
                        out.put_u16_le(title.len() as u16);
                        out.put_slice(title.as_bytes());
                        out.put_u16_le(*version);
                        out.put_u32_le(data.len() as u32);
                    }
                    out.to_vec()
                }
                Command::APP_READ => match self.apps.get(&Self::text(&payload)) {
                    Some((_, _, data)) => {
                        self.handle = Some(Handle::Read(data.clone()));
                        Self::status(true)
                    }
                    None => Self::status(false),
                },
                Command::APP_WRITE => {
                    let mut buf = payload;
                    let name = Self::short_str(&mut buf);
                    let title = Self::short_str(&mut buf);
                    let _size = buf.get_u32_le();
                    let version = buf.get_u16_le();
                    assert!(buf.is_empty(), "allocation header has trailing bytes");
                    self.handle = Some(Handle::WriteApp(name, title, version, Vec::new()));
                    Self::status(true)
                }
                Command::APP_REMOVE => {
                    Self::status(self.apps.remove(&Self::text(&payload)).is_some())
                }
                Command::APP_RUN => Self::status(self.apps.contains_key(&Self::text(&payload))),
                Command::CONFIGURATION_LIST => {
                    let namespace = Self::text(&payload);
                    let mut out = BytesMut::new();
                    for ((ns, key), (tag, value)) in &self.nvs {
                        if !namespace.is_empty() && *ns != namespace {
                            continue;
                        }
                        out.put_u16_le(ns.len() as u16);
                        out.put_slice(ns.as_bytes());
                        out.put_u16_le(key.len() as u16);
                        out.put_slice(key.as_bytes());
                        out.put_u8(*tag);
                        out.put_u32_le(value.len() as u32);
                    }
                    out.to_vec()
                }
                Command::CONFIGURATION_READ => {
                    let mut buf = payload;
                    let ns = Self::short_str(&mut buf);
                    let key = Self::short_str(&mut buf);
                    let tag = buf.get_u8();
                    match self.nvs.get(&(ns, key)) {
                        Some((stored, value)) if *stored == tag => value.clone(),
                        _ => Vec::new(),
                    }
                }
                Command::CONFIGURATION_WRITE => {
                    let mut buf = payload;
                    let ns = Self::short_str(&mut buf);
                    let key = Self::short_str(&mut buf);
                    let tag = buf.get_u8();
                    self.nvs.insert((ns, key), (tag, buf.to_vec()));
                    Self::status(true)
                }
                Command::CONFIGURATION_REMOVE => {
                    let mut buf = payload;
                    let ns = Self::short_str(&mut buf);
                    let key = Self::short_str(&mut buf);
                    Self::status(self.nvs.remove(&(ns, key)).is_some())
                }
                _ => Vec::new(),
            }
        }
    }

    fn badge_transport(mut badge: FakeBadge) -> Arc<MockTransport> {
        Arc::new(MockTransport::new().with_responder(move |frame| {
            let response = badge.respond(frame);
            Some(reply(frame, response))
        }))
    }

    async fn connected(badge: FakeBadge) -> (Arc<MockTransport>, Client<MockTransport>) {
        let mock = badge_transport(badge);
        let client = Client::new(mock.clone(), ClientConfig::default());
        client.connect().await.unwrap();
        (mock, client)
    }

    #[tokio::test]
    async fn test_connect_bootstraps_and_syncs() {
        let mock = badge_transport(FakeBadge::new());
        let client = Client::new(mock.clone(), ClientConfig::default());
        let mut events = client.subscribe_events();
        assert_eq!(client.state(), ConnectionState::Disconnected);

        let version = client.connect().await.unwrap();
        assert_eq!(version, 2);
        assert!(client.is_connected());
        assert_eq!(client.state(), ConnectionState::Synchronized);
        assert_eq!(client.protocol_version(), Some(2));
        assert_eq!(
            client.device_info().unwrap().product.as_deref(),
            Some("MCH2022 badge")
        );
        assert_eq!(mock.configuration(), Some(1));
        assert_eq!(mock.mode(), BootMode::WebUsb as u8);
        assert_eq!(
            events.recv().await.unwrap(),
            ConnectionEvent::Connected { protocol_version: 2 }
        );

        let frames = mock.written_frames();
        assert_eq!(frames[0].command, Command::SYNC);
        assert_eq!(frames[0].identifier, 0);

        assert!(matches!(
            client.connect().await,
            Err(ClientError::AlreadyConnected)
        ));
    }

    #[tokio::test]
    async fn test_unsupported_protocol_tears_down() {
        let badge = FakeBadge {
            version: 1,
            ..FakeBadge::new()
        };
        let mock = badge_transport(badge);
        let client = Client::new(mock.clone(), ClientConfig::default());

        let result = client.connect().await;
        assert!(matches!(
            result,
            Err(ClientError::UnsupportedProtocol { version: 1, minimum: 2 })
        ));
        assert!(!client.is_connected());
        assert!(!mock.is_open());
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_fails_when_device_missing_interface() {
        let mock = Arc::new(MockTransport::new().with_vendor_interface(None));
        let config = ClientConfig::default().with_interface(None);
        let client = Client::new(mock.clone(), config);

        assert!(client.connect().await.is_err());
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(!mock.is_open());
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let client = Client::new(badge_transport(FakeBadge::new()), ClientConfig::default());
        assert!(matches!(
            client.filesystem_list("/internal").await,
            Err(ClientError::NotConnected)
        ));
        assert!(matches!(
            client.disconnect(true).await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_sequence() {
        let (mock, client) = connected(FakeBadge::new()).await;
        let mut events = client.subscribe_events();
        mock.clear_controls();

        client.disconnect(true).await.unwrap();
        assert!(!client.is_connected());
        assert!(!mock.is_open());
        assert_eq!(
            mock.controls(),
            vec![
                ControlCall::Write { request: 0x25, value: 0 },
                ControlCall::Write { request: 0x23, value: 0 },
                ControlCall::Write { request: 0x22, value: 0 },
            ]
        );
        let last = mock.written_frames().pop().unwrap();
        assert_eq!(last, Frame::empty(0, Command::SYNC));
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Disconnected);

        // Identifiers restart after reconnecting.
        client.connect().await.unwrap();
        assert_eq!(mock.written_frames().last().unwrap().identifier, 0);
    }

    #[tokio::test]
    async fn test_ping_and_state() {
        let (_mock, client) = connected(FakeBadge::new()).await;
        assert_eq!(client.ping(b"hello").await.unwrap().as_ref(), b"hello");

        let state = client.filesystem_state().await.unwrap();
        assert_eq!(state.internal.size, 1000);
        assert_eq!(state.internal.free, 400);
        assert_eq!(state.app.free, 1500);
    }

    #[tokio::test]
    async fn test_filesystem_roundtrip() {
        let (mock, client) = connected(FakeBadge::new()).await;

        let data: Vec<u8> = (0..1300u32).map(|i| (i % 251) as u8).collect();
        let mut reports = Vec::new();
        let complete = client
            .filesystem_write("/internal/data.bin", &data, |p| reports.push(p))
            .await
            .unwrap();
        assert!(complete);
        assert_eq!(reports.first().unwrap().stage, TransferStage::Creating);
        assert_eq!(reports.last().unwrap().stage, TransferStage::Closing);

        let chunk_sizes: Vec<usize> = mock
            .written_frames()
            .iter()
            .filter(|f| f.command == Command::TRANSFER_CHUNK)
            .map(|f| f.payload.len())
            .collect();
        assert_eq!(chunk_sizes, vec![512, 512, 276]);
        assert_eq!(
            mock.written_frames().last().unwrap().command,
            Command::FILESYSTEM_FILE_CLOSE
        );

        assert!(client.filesystem_exists("/internal/data.bin").await.unwrap());
        let read = client.filesystem_read("/internal/data.bin").await.unwrap();
        assert_eq!(read.unwrap().as_ref(), data.as_slice());

        let entries = client.filesystem_list("/internal").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, EntryKind::File);
        assert_eq!(entries[0].name, "data.bin");
        assert_eq!(entries[0].stat.unwrap().size, 1300);
        assert_eq!(entries[0].stat.unwrap().modified, MODIFIED);

        assert!(client.filesystem_remove("/internal/data.bin").await.unwrap());
        assert!(!client.filesystem_exists("/internal/data.bin").await.unwrap());
    }

    #[tokio::test]
    async fn test_filesystem_read_missing_file() {
        let (mock, client) = connected(FakeBadge::new()).await;
        assert_eq!(client.filesystem_read("/internal/nope").await.unwrap(), None);
        // No chunk or close transactions follow a failed open.
        assert_eq!(
            mock.written_frames().last().unwrap().command,
            Command::FILESYSTEM_FILE_READ
        );
    }

    #[tokio::test]
    async fn test_filesystem_write_open_failure() {
        let (_mock, client) = connected(FakeBadge::new()).await;
        let result = client
            .filesystem_write("/readonly/x", b"data", |_| {})
            .await;
        assert!(matches!(result, Err(ClientError::OpenFailed(path)) if path == "/readonly/x"));
    }

    #[tokio::test]
    async fn test_filesystem_directories() {
        let (_mock, client) = connected(FakeBadge::new()).await;
        assert!(client.filesystem_create_directory("/internal/apps").await.unwrap());
        let entries = client.filesystem_list("/internal").await.unwrap();
        assert_eq!(entries[0].kind, EntryKind::Directory);
        assert_eq!(entries[0].name, "apps");
    }

    #[tokio::test]
    async fn test_write_failure_still_closes() {
        let badge = FakeBadge {
            max_accept: 0,
            ..FakeBadge::new()
        };
        let (mock, client) = connected(badge).await;

        let result = client
            .filesystem_write("/internal/x", b"data", |_| {})
            .await;
        assert!(matches!(result, Err(ClientError::WriteFailed { position: 0 })));
        assert_eq!(
            mock.written_frames().last().unwrap().command,
            Command::FILESYSTEM_FILE_CLOSE
        );
    }

    #[tokio::test]
    async fn test_app_lifecycle() {
        let (mock, client) = connected(FakeBadge::new()).await;

        let binary = vec![0xE9u8; 2500];
        let mut stages = Vec::new();
        let complete = client
            .app_write("snake", "Snake", 3, &binary, |p| stages.push(p.stage))
            .await
            .unwrap();
        assert!(complete);
        assert_eq!(stages.first(), Some(&TransferStage::Allocating));

        let allocation = mock
            .written_frames()
            .into_iter()
            .find(|f| f.command == Command::APP_WRITE)
            .unwrap();
        assert_eq!(allocation.payload.len(), 1 + 5 + 1 + 5 + 4 + 2);

        let apps = client.app_list().await.unwrap();
        assert_eq!(
            apps,
            vec![PackageDescriptor {
                name: "snake".to_string(),
                title: "Snake".to_string(),
                version: 3,
                size: 2500,
            }]
        );

        let read = client.app_read("snake").await.unwrap().unwrap();
        assert_eq!(read.len(), 2500);
        let reads = mock
            .written_frames()
            .iter()
            .filter(|f| f.command == Command::TRANSFER_CHUNK && f.payload.as_ref() == 64u32.to_le_bytes())
            .count();
        // 40 chunks of up to 64 bytes, plus the terminating empty one
        assert_eq!(reads, 41);

        assert_eq!(client.app_read("missing").await.unwrap(), None);
        assert!(client.app_remove("snake").await.unwrap());
        assert!(client.app_list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_app_run_disconnects() {
        let (_mock, client) = connected(FakeBadge::new()).await;
        client
            .app_write("game", "Game", 1, b"bin", |_| {})
            .await
            .unwrap();
        let mut events = client.subscribe_events();

        assert!(client.app_run("game").await.unwrap());
        assert!(!client.is_connected());
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Disconnected);
    }

    #[tokio::test]
    async fn test_app_run_failure_keeps_link() {
        let (_mock, client) = connected(FakeBadge::new()).await;
        assert!(!client.app_run("missing").await.unwrap());
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_app_write_rejects_long_name() {
        let (_mock, client) = connected(FakeBadge::new()).await;
        let name = "n".repeat(256);
        let result = client.app_write(&name, "t", 1, b"x", |_| {}).await;
        assert!(matches!(result, Err(ClientError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_configuration_roundtrip() {
        let (_mock, client) = connected(FakeBadge::new()).await;

        let values = [
            ("volume", ConfigValue::U8(200)),
            ("offset", ConfigValue::I32(-5)),
            ("nickname", ConfigValue::String("hacker".to_string())),
            ("key", ConfigValue::Blob(Bytes::from_static(&[0x00, 0xFF]))),
        ];
        for (key, value) in &values {
            assert!(client.configuration_write("owner", key, value).await.unwrap());
        }
        for (key, value) in &values {
            let read = client
                .configuration_read("owner", key, value.config_type())
                .await
                .unwrap();
            assert_eq!(read.as_ref(), Some(value));
        }

        let entries = client.configuration_list("owner").await.unwrap();
        assert_eq!(entries.len(), 4);
        let nickname = entries.iter().find(|e| e.key == "nickname").unwrap();
        assert_eq!(nickname.config_type(), Some(ConfigType::String));
        assert_eq!(nickname.size, 6);
        assert_eq!(client.configuration_list("").await.unwrap().len(), 4);

        assert!(client.configuration_remove("owner", "volume").await.unwrap());
        assert_eq!(
            client
                .configuration_read("owner", "volume", ConfigType::U8)
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_configuration_argument_validation() {
        let (mock, client) = connected(FakeBadge::new()).await;
        let before = mock.written_frames().len();

        let long = "k".repeat(17);
        assert!(matches!(
            client.configuration_read("", "key", ConfigType::U8).await,
            Err(ClientError::InvalidArgument(_))
        ));
        assert!(matches!(
            client.configuration_remove("owner", &long).await,
            Err(ClientError::InvalidArgument(_))
        ));
        assert!(matches!(
            client.configuration_list(&long).await,
            Err(ClientError::InvalidArgument(_))
        ));
        assert_eq!(mock.written_frames().len(), before);
    }

    #[tokio::test]
    async fn test_connection_loss_event() {
        let (mock, client) = connected(FakeBadge::new()).await;
        let mut events = client.subscribe_events();

        mock.sever();
        assert!(matches!(
            events.recv().await.unwrap(),
            ConnectionEvent::ConnectionLost { .. }
        ));
        assert!(!client.is_connected());
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.device_info(), None);
        assert_eq!(client.protocol_version(), None);
        assert!(matches!(
            client.filesystem_exists("/internal").await,
            Err(ClientError::NotConnected)
        ));

        // Teardown errors are swallowed.
        client.disconnect(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_firmware_version() {
        let mock = Arc::new(MockTransport::new().with_firmware_version(9).with_responder(|frame| {
            Some(reply(frame, 2u16.to_le_bytes().to_vec()))
        }));
        let client = Client::new(mock, ClientConfig::default());
        assert!(matches!(
            client.control_firmware_version().await,
            Err(ClientError::NotConnected)
        ));
        client.connect().await.unwrap();
        assert_eq!(client.control_firmware_version().await.unwrap(), 9);
    }

    #[tokio::test]
    async fn test_mismatched_response_command_is_device_error() {
        let mock = Arc::new(MockTransport::new().with_responder(|frame| match frame.command {
            Command::SYNC => Some(reply(frame, 2u16.to_le_bytes().to_vec())),
            Command::FILESYSTEM_LIST => Some(reply_with(frame, Command::PING, Bytes::new())),
            _ => None,
        }));
        let client = Client::new(mock, ClientConfig::default());
        client.connect().await.unwrap();

        match client.filesystem_list("/internal").await {
            Err(ClientError::DeviceError { request, response }) => {
                assert_eq!(request, Command::FILESYSTEM_LIST);
                assert_eq!(response.to_string(), "PING");
            }
            other => panic!("expected device error, got {:?}", other),
        }
        // A device error does not drop the link out of sync.
        assert!(client.is_connected());
        assert_eq!(client.state(), ConnectionState::Synchronized);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_then_resync() {
        let mock = Arc::new(MockTransport::new().with_responder(|frame| match frame.command {
            Command::SYNC => Some(reply(frame, 2u16.to_le_bytes().to_vec())),
            _ => None,
        }));
        let config = ClientConfig::default().with_request_timeout(Duration::from_millis(250));
        assert_eq!(config.protocol.request_timeout(), Duration::from_millis(250));
        let client = Client::new(mock.clone(), config);
        client.connect().await.unwrap();

        assert!(matches!(
            client.filesystem_list("/internal").await,
            Err(ClientError::Timeout { command }) if command == Command::FILESYSTEM_LIST
        ));
        assert_eq!(client.state(), ConnectionState::AwaitingSync);

        // The next operation syncs before sending.
        let _ = client.filesystem_exists("/internal").await;
        let commands: Vec<Command> = mock.written_frames().iter().map(|f| f.command).collect();
        assert_eq!(
            commands,
            vec![
                Command::SYNC,
                Command::FILESYSTEM_LIST,
                Command::SYNC,
                Command::FILESYSTEM_EXISTS
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_gives_up_after_sync_budget() {
        let mock = Arc::new(MockTransport::new());
        let config = ClientConfig::default().with_sync_policy(2, Duration::from_millis(10));
        assert_eq!(config.protocol.max_sync_attempts, 2);
        assert_eq!(config.protocol.sync_retry_delay(), Duration::from_millis(10));
        let client = Client::new(mock.clone(), config);

        assert!(matches!(
            client.connect().await,
            Err(ClientError::SyncFailed { attempts: 2 })
        ));
        assert!(!client.is_connected());
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(!mock.is_open());
    }
}
