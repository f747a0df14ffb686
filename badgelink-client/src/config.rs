//! Client configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via BADGELINK_CONFIG or --config)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Client configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// USB device selection and link setup.
    pub usb: UsbConfig,
    /// Transaction timeouts and synchronization policy.
    pub protocol: ProtocolConfig,
    /// Chunk sizes for streamed transfers.
    pub transfer: TransferConfig,
}

impl ClientConfig {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("BADGELINK_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: ClientConfig = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Applies environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.usb.apply_env_overrides();
        self.protocol.apply_env_overrides();
        self.transfer.apply_env_overrides();
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }

    /// Rejects values the client cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.usb.read_size == 0 {
            return Err(ConfigError::ValidationError(
                "usb.read_size must be greater than zero".to_string(),
            ));
        }
        if self.usb.baud_rate / 100 > u16::MAX as u32 {
            return Err(ConfigError::ValidationError(format!(
                "usb.baud_rate {} does not fit the control request",
                self.usb.baud_rate
            )));
        }
        let chunks = [
            ("transfer.fs_read_chunk", self.transfer.fs_read_chunk as u64),
            ("transfer.fs_write_chunk", self.transfer.fs_write_chunk as u64),
            ("transfer.app_read_chunk", self.transfer.app_read_chunk as u64),
            ("transfer.app_write_chunk", self.transfer.app_write_chunk as u64),
        ];
        for (name, size) in chunks {
            if size == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn with_device(mut self, vendor_id: u16, product_id: u16) -> Self {
        self.usb.vendor_id = vendor_id;
        self.usb.product_id = product_id;
        self
    }

    /// Sets the interface index; `None` picks the first vendor-class interface.
    pub fn with_interface(mut self, interface: Option<u8>) -> Self {
        self.usb.interface = interface;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.protocol.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_sync_policy(mut self, max_attempts: u32, retry_delay: Duration) -> Self {
        self.protocol.max_sync_attempts = max_attempts;
        self.protocol.sync_retry_delay_ms = retry_delay.as_millis() as u64;
        self
    }
}

/// USB device selection and link setup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsbConfig {
    #[serde(with = "usb_id_serde")]
    pub vendor_id: u16,
    #[serde(with = "usb_id_serde")]
    pub product_id: u16,
    /// Configuration value selected after opening.
    pub configuration: u8,
    /// Vendor interface index. `None` selects the first vendor-class interface.
    pub interface: Option<u8>,
    /// UART baud rate requested from the bridge.
    pub baud_rate: u32,
    /// Maximum bytes requested per bulk read.
    pub read_size: usize,
    /// Reset the device back to normal firmware on disconnect.
    pub reset_on_disconnect: bool,
}

impl Default for UsbConfig {
    fn default() -> Self {
        Self {
            vendor_id: 0x16d0,
            product_id: 0x0f9a,
            configuration: 1,
            interface: Some(4),
            baud_rate: 921_600,
            read_size: 64,
            reset_on_disconnect: true,
        }
    }
}

impl UsbConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(id) = env_parsed("BADGELINK_VENDOR_ID", parse_usb_id) {
            self.vendor_id = id;
        }
        if let Some(id) = env_parsed("BADGELINK_PRODUCT_ID", parse_usb_id) {
            self.product_id = id;
        }
        if let Ok(interface) = std::env::var("BADGELINK_INTERFACE") {
            if interface.eq_ignore_ascii_case("auto") {
                self.interface = None;
            } else if let Ok(index) = interface.parse() {
                self.interface = Some(index);
            }
        }
        if let Some(baud) = env_parsed("BADGELINK_BAUD_RATE", |s| s.parse().ok()) {
            self.baud_rate = baud;
        }
        if let Some(size) = env_parsed("BADGELINK_READ_SIZE", |s| s.parse().ok()) {
            self.read_size = size;
        }
        if let Ok(reset) = std::env::var("BADGELINK_RESET_ON_DISCONNECT") {
            self.reset_on_disconnect = reset == "1" || reset.to_lowercase() == "true";
        }
    }
}

/// Transaction timeouts and synchronization policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub sync_timeout_ms: u64,
    pub request_timeout_ms: u64,
    /// Timeout of the app allocation request, which erases flash.
    pub allocate_timeout_ms: u64,
    /// Lowest protocol version accepted after the first sync.
    pub min_version: u16,
    /// Sync attempts before giving up (0 = unlimited).
    pub max_sync_attempts: u32,
    pub sync_retry_delay_ms: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            sync_timeout_ms: 100,
            request_timeout_ms: 4000,
            allocate_timeout_ms: 10_000,
            min_version: badgelink_protocol::MIN_PROTOCOL_VERSION,
            max_sync_attempts: 0,
            sync_retry_delay_ms: 0,
        }
    }
}

impl ProtocolConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(ms) = env_parsed("BADGELINK_SYNC_TIMEOUT_MS", |s| s.parse().ok()) {
            self.sync_timeout_ms = ms;
        }
        if let Some(ms) = env_parsed("BADGELINK_REQUEST_TIMEOUT_MS", |s| s.parse().ok()) {
            self.request_timeout_ms = ms;
        }
        if let Some(ms) = env_parsed("BADGELINK_ALLOCATE_TIMEOUT_MS", |s| s.parse().ok()) {
            self.allocate_timeout_ms = ms;
        }
        if let Some(n) = env_parsed("BADGELINK_MAX_SYNC_ATTEMPTS", |s| s.parse().ok()) {
            self.max_sync_attempts = n;
        }
        if let Some(ms) = env_parsed("BADGELINK_SYNC_RETRY_DELAY_MS", |s| s.parse().ok()) {
            self.sync_retry_delay_ms = ms;
        }
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn allocate_timeout(&self) -> Duration {
        Duration::from_millis(self.allocate_timeout_ms)
    }

    pub fn sync_retry_delay(&self) -> Duration {
        Duration::from_millis(self.sync_retry_delay_ms)
    }
}

/// Chunk sizes for streamed transfers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub fs_read_chunk: u32,
    pub fs_write_chunk: usize,
    pub app_read_chunk: u32,
    pub app_write_chunk: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            fs_read_chunk: 512,
            fs_write_chunk: 512,
            app_read_chunk: 64,
            app_write_chunk: 1024,
        }
    }
}

impl TransferConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(n) = env_parsed("BADGELINK_FS_READ_CHUNK", |s| s.parse().ok()) {
            self.fs_read_chunk = n;
        }
        if let Some(n) = env_parsed("BADGELINK_FS_WRITE_CHUNK", |s| s.parse().ok()) {
            self.fs_write_chunk = n;
        }
        if let Some(n) = env_parsed("BADGELINK_APP_READ_CHUNK", |s| s.parse().ok()) {
            self.app_read_chunk = n;
        }
        if let Some(n) = env_parsed("BADGELINK_APP_WRITE_CHUNK", |s| s.parse().ok()) {
            self.app_write_chunk = n;
        }
    }
}

fn env_parsed<T>(name: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    let parsed = parse(raw.trim());
    if parsed.is_none() {
        tracing::warn!(variable = name, value = %raw, "ignoring unparsable environment override");
    }
    parsed
}

/// Parses a USB vendor or product id, either hex (`0x16d0`) or decimal.
pub fn parse_usb_id(s: &str) -> Option<u16> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// USB ids as `0x`-prefixed hex strings in YAML.
mod usb_id_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(id: &u16, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{:#06x}", id))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u16, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u16),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(n),
            Raw::Text(s) => super::parse_usb_id(&s)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid USB id '{}'", s))),
        }
    }
}
