//! # modbus-cloud-bridge
//!
//! Protocol core of an RS485 Modbus RTU to cloud bridge.
//!
//! The bridge listens on a half-duplex RS485 bus, validates every Modbus RTU
//! frame it hears, and forwards the payload to a cloud server over a TLS
//! connection authenticated with a pre-shared key derived from the device
//! serial. Data frames from the cloud travel the other way as Modbus requests.
//!
//! ## Layout
//!
//! - [`modbus`]: RTU framing and CRC-16
//! - [`frame`]: cloud application frame codec and sequence numbers
//! - [`psk`]: PSK derivation and handshake parameters
//! - [`session`]: connection state machine with heartbeat and reconnect
//! - [`rs485`]: serial link traits, frame acceptance and the receive loop
//! - [`channel`]: the two data channels (cloud and RS485)
//! - [`bridge`]: routing between the channels
//! - [`server`]: plain TCP server for local clients
//! - [`gateway`]: wiring and worker threads
//!
//! Hardware and TLS live behind traits ([`rs485::SerialRx`],
//! [`rs485::SerialTx`], [`transport::CloudConnector`]) so the whole bridge
//! runs on a host with mock transports.
//!
//! ## Example
//!
//! ```
//! use modbus_cloud_bridge::frame::{parse, AppFrame, FrameEncoder, SequenceCounter};
//!
//! let seq = SequenceCounter::new();
//! let mut buf = [0u8; 64];
//! let len = FrameEncoder::new(&seq).data(&mut buf, &[0x01, 0x02]).unwrap();
//!
//! match parse(&buf[..len]).unwrap() {
//!     AppFrame::Data(frame) => assert_eq!(frame.payload, &[0x01, 0x02]),
//!     other => panic!("unexpected frame {:?}", other),
//! }
//! ```

pub mod bridge;
pub mod channel;
pub mod clock;
pub mod config;
pub mod error;
pub mod frame;
pub mod gateway;
pub mod modbus;
pub mod psk;
pub mod rs485;
pub mod server;
pub mod session;
pub mod transport;

pub use bridge::{BridgeRouter, RouterStats};
pub use channel::{CloudChannel, DataChannel, Rs485Channel};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BridgeConfig, CloudTarget, ConfigSource, MemoryParams, ParamId, ParamStore};
pub use error::{ChannelError, ConfigError, FrameError, ResourceError, TransportError};
pub use frame::{AppFrame, AppFunction, FrameEncoder, SequenceCounter};
pub use gateway::{Gateway, GatewayMonitor, GatewayStats};
pub use psk::{PreSharedKey, TlsPskParams};
pub use server::{ClientListener, LocalServer, ServerMonitor, ServerStats, TcpClientListener};
pub use session::{CloudSession, SessionHandle, SessionState, SessionStats};
pub use transport::{CloudConnector, CloudStream};

/// Crate version, logged at startup.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
