//! Bridge configuration and the parameter store interface.
//!
//! Runtime settings live in a numbered parameter store owned by an external
//! collaborator (NVS on the device, memory in tests). The bridge reads host,
//! port and serial once per connection attempt; anything missing or invalid
//! is logged and replaced with the built-in default.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, warn};

use crate::error::ConfigError;

/// Default cloud endpoint.
pub const DEFAULT_HOST: &str = "dongle_ssl.solarcloudsystem.com";
pub const DEFAULT_PORT: u16 = 4348;
/// Serial used for key derivation when none is stored.
pub const DEFAULT_SERIAL: &str = "default";
pub const DEFAULT_PSK_IDENTITY: &str = "psk_identity_dongle";
pub const DEFAULT_POLL_PERIOD_MS: u32 = 5000;

/// Parameter identifiers understood by the parameter store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u16)]
pub enum ParamId {
    WifiSsid = 2,
    WifiPassword = 3,
    ServerHost = 5,
    ServerPort = 6,
    DeviceSerial = 7,
    QueryPeriod = 8,
    DeviceName = 9,
    FactoryTest = 10,
    IpConfig = 14,
}

impl ParamId {
    pub const ALL: [ParamId; 9] = [
        Self::WifiSsid,
        Self::WifiPassword,
        Self::ServerHost,
        Self::ServerPort,
        Self::DeviceSerial,
        Self::QueryPeriod,
        Self::DeviceName,
        Self::FactoryTest,
        Self::IpConfig,
    ];

    pub fn from_u16(value: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|id| id.code() == value)
    }

    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn spec(self) -> &'static ParamSpec {
        let idx = Self::ALL.iter().position(|&id| id == self).unwrap_or(0);
        &PARAM_SPECS[idx]
    }
}

impl std::fmt::Display for ParamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.code(), self.spec().key)
    }
}

/// Value type and limits of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Text { max_len: usize, default: &'static str },
    Int { min: i32, max: i32, default: i32 },
}

/// Storage key and value kind of one parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamSpec {
    pub id: u16,
    /// Key under which the value is persisted.
    pub key: &'static str,
    pub kind: ParamKind,
}

/// Ordered like [`ParamId::ALL`].
pub static PARAM_SPECS: [ParamSpec; 9] = [
    ParamSpec { id: 2, key: "wifi_ssid", kind: ParamKind::Text { max_len: 64, default: "LuxPower" } },
    ParamSpec { id: 3, key: "wifi_password", kind: ParamKind::Text { max_len: 64, default: "" } },
    ParamSpec { id: 5, key: "server_host", kind: ParamKind::Text { max_len: 128, default: DEFAULT_HOST } },
    ParamSpec { id: 6, key: "server_port", kind: ParamKind::Int { min: 1, max: 65535, default: DEFAULT_PORT as i32 } },
    ParamSpec { id: 7, key: "device_sn", kind: ParamKind::Text { max_len: 64, default: DEFAULT_SERIAL } },
    ParamSpec { id: 8, key: "query_period", kind: ParamKind::Int { min: 1000, max: 60000, default: DEFAULT_POLL_PERIOD_MS as i32 } },
    ParamSpec { id: 9, key: "device_id", kind: ParamKind::Text { max_len: 64, default: "LuxWiFiDongle" } },
    ParamSpec { id: 10, key: "factory_test", kind: ParamKind::Int { min: 0, max: 1, default: 0 } },
    ParamSpec { id: 14, key: "ip_config", kind: ParamKind::Int { min: 0, max: 1, default: 0 } },
];

impl ParamSpec {
    /// Checks a text value against this parameter's limits.
    pub fn validate_text(&self, value: &str) -> Result<(), ConfigError> {
        match self.kind {
            ParamKind::Text { max_len, .. } if value.len() <= max_len => Ok(()),
            _ => Err(ConfigError::Invalid { id: self.id, value: value.to_string() }),
        }
    }

    /// Checks an integer value against this parameter's range.
    pub fn validate_int(&self, value: i32) -> Result<(), ConfigError> {
        match self.kind {
            ParamKind::Int { min, max, .. } if (min..=max).contains(&value) => Ok(()),
            _ => Err(ConfigError::Invalid { id: self.id, value: value.to_string() }),
        }
    }
}

/// Read access to the parameter store.
pub trait ConfigSource: Send + Sync {
    fn get_string(&self, id: ParamId) -> Result<String, ConfigError>;
    fn get_int(&self, id: ParamId) -> Result<i32, ConfigError>;
}

/// Read/write access to the parameter store.
pub trait ParamStore: ConfigSource {
    fn set_string(&self, id: ParamId, value: &str) -> Result<(), ConfigError>;
    fn set_int(&self, id: ParamId, value: i32) -> Result<(), ConfigError>;
}

/// Stored value of one parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Text(String),
    Int(i32),
}

/// In-memory parameter store.
#[derive(Debug, Default)]
pub struct MemoryParams {
    values: Mutex<HashMap<ParamId, ParamValue>>,
}

impl MemoryParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, id: ParamId, value: ParamValue) -> Self {
        if let Ok(mut values) = self.values.lock() {
            values.insert(id, value);
        }
        self
    }

    fn get(&self, id: ParamId) -> Option<ParamValue> {
        self.values.lock().ok()?.get(&id).cloned()
    }

    fn put(&self, id: ParamId, value: ParamValue) {
        if let Ok(mut values) = self.values.lock() {
            values.insert(id, value);
        }
    }
}

impl ConfigSource for MemoryParams {
    fn get_string(&self, id: ParamId) -> Result<String, ConfigError> {
        match self.get(id) {
            Some(ParamValue::Text(s)) => Ok(s),
            Some(ParamValue::Int(v)) => Ok(v.to_string()),
            None => Err(ConfigError::Missing(id.code())),
        }
    }

    fn get_int(&self, id: ParamId) -> Result<i32, ConfigError> {
        match self.get(id) {
            Some(ParamValue::Int(v)) => Ok(v),
            Some(ParamValue::Text(s)) => s
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { id: id.code(), value: s }),
            None => Err(ConfigError::Missing(id.code())),
        }
    }
}

impl ParamStore for MemoryParams {
    fn set_string(&self, id: ParamId, value: &str) -> Result<(), ConfigError> {
        id.spec().validate_text(value)?;
        self.put(id, ParamValue::Text(value.to_string()));
        Ok(())
    }

    fn set_int(&self, id: ParamId, value: i32) -> Result<(), ConfigError> {
        id.spec().validate_int(value)?;
        self.put(id, ParamValue::Int(value));
        Ok(())
    }
}

/// Where and as whom the cloud session connects.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CloudTarget {
    pub host: String,
    pub port: u16,
    pub serial: String,
    pub identity: String,
}

impl Default for CloudTarget {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            serial: DEFAULT_SERIAL.to_string(),
            identity: DEFAULT_PSK_IDENTITY.to_string(),
        }
    }
}

impl CloudTarget {
    /// Reads host, port and serial, falling back to defaults for anything
    /// missing or unusable.
    pub fn resolve(source: &dyn ConfigSource) -> Self {
        let defaults = Self::default();

        let host = non_empty(ParamId::ServerHost, source.get_string(ParamId::ServerHost))
            .unwrap_or_else(|e| fallback(ParamId::ServerHost, e, defaults.host));

        let port = source
            .get_int(ParamId::ServerPort)
            .and_then(|p| {
                u16::try_from(p)
                    .ok()
                    .filter(|&p| p > 0)
                    .ok_or(ConfigError::Invalid { id: ParamId::ServerPort.code(), value: p.to_string() })
            })
            .unwrap_or_else(|e| fallback(ParamId::ServerPort, e, defaults.port));

        let serial = non_empty(ParamId::DeviceSerial, source.get_string(ParamId::DeviceSerial))
            .unwrap_or_else(|e| fallback(ParamId::DeviceSerial, e, defaults.serial));

        debug!("Cloud target resolved: {}:{} (serial {})", host, port, serial);
        Self { host, port, serial, identity: defaults.identity }
    }
}

fn non_empty(id: ParamId, value: Result<String, ConfigError>) -> Result<String, ConfigError> {
    value.and_then(|s| {
        if s.trim().is_empty() {
            Err(ConfigError::Invalid { id: id.code(), value: s })
        } else {
            Ok(s)
        }
    })
}

fn fallback<T: std::fmt::Debug>(id: ParamId, err: ConfigError, default: T) -> T {
    match err {
        ConfigError::Missing(_) => warn!("Parameter {} not configured, using default {:?}", id, default),
        e => warn!("Parameter {} unusable ({}), using default {:?}", id, e, default),
    }
    default
}

/// Serial parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Parity {
    None,
    Even,
    Odd,
}

/// RS485 link parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SerialSettings {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: u8,
    /// Longest wait for the first byte of a frame before the receive loop
    /// goes round again.
    pub read_timeout: Duration,
    /// Line silence that ends a frame once its first bytes have arrived.
    pub inter_frame_gap: Duration,
    /// Upper bound on waiting for the transmitter to drain.
    pub tx_timeout: Duration,
    /// UART receive FIFO timeout, in symbol times.
    pub rx_fifo_timeout: u8,
    pub rx_buffer_size: usize,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: 8,
            parity: Parity::Even,
            stop_bits: 1,
            read_timeout: Duration::from_millis(500),
            inter_frame_gap: Duration::from_millis(20),
            tx_timeout: Duration::from_millis(1000),
            rx_fifo_timeout: 5,
            rx_buffer_size: 512,
        }
    }
}

/// Cloud session timing.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionSettings {
    pub connect_timeout: Duration,
    pub reconnect_delay: Duration,
    pub heartbeat_interval: Duration,
    /// Bound on a single read while the session is ready.
    pub read_timeout: Duration,
    /// Pause after a read that returned no data.
    pub idle_delay: Duration,
    pub rx_buffer_size: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(10_000),
            reconnect_delay: Duration::from_millis(5_000),
            heartbeat_interval: Duration::from_millis(10_000),
            read_timeout: Duration::from_millis(100),
            idle_delay: Duration::from_millis(10),
            rx_buffer_size: 2048,
        }
    }
}

/// Local client server, plain TCP on the LAN side.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ServerSettings {
    pub enabled: bool,
    pub port: u16,
    /// Clients served at once; further connections are closed on accept.
    pub max_clients: usize,
    /// Bound on a single client read, so replies are never blocked for long.
    pub read_timeout: Duration,
    /// Pause after an accept error.
    pub accept_retry: Duration,
    pub rx_buffer_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8080,
            max_clients: 4,
            read_timeout: Duration::from_millis(100),
            accept_retry: Duration::from_millis(1000),
            rx_buffer_size: 2048,
        }
    }
}

/// Everything the bridge needs at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BridgeConfig {
    pub serial: SerialSettings,
    pub session: SessionSettings,
    pub server: ServerSettings,
    pub poll_period: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            serial: SerialSettings::default(),
            session: SessionSettings::default(),
            server: ServerSettings::default(),
            poll_period: Duration::from_millis(DEFAULT_POLL_PERIOD_MS as u64),
        }
    }
}

impl BridgeConfig {
    /// Startup configuration. Link timing is fixed; the poll period comes
    /// from the parameter store.
    pub fn load(source: &dyn ConfigSource) -> Self {
        let spec = ParamId::QueryPeriod.spec();
        let period_ms = source
            .get_int(ParamId::QueryPeriod)
            .and_then(|ms| spec.validate_int(ms).map(|_| ms))
            .unwrap_or_else(|e| fallback(ParamId::QueryPeriod, e, DEFAULT_POLL_PERIOD_MS as i32));

        Self {
            poll_period: Duration::from_millis(period_ms as u64),
            ..Self::default()
        }
    }
}
