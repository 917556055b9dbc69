//! Error types for the bridge core.
//!
//! Every failure the bridge can observe falls into one of four buckets:
//! malformed frames (dropped and counted), transport failures (session
//! teardown and reconnect), missing configuration (logged, defaults used) and
//! resource exhaustion at startup (hard initialization failure).

use std::io;

use thiserror::Error;

/// A frame that failed validation. Never fatal; the frame is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame too short: {len} bytes, need at least {min}")]
    TooShort { len: usize, min: usize },

    #[error("bad magic: {0:02X?}")]
    BadMagic([u8; 2]),

    #[error("CRC mismatch: expected {expected:#06X}, received {received:#06X}")]
    CrcMismatch { expected: u16, received: u16 },

    #[error("length mismatch: header implies {expected} bytes, buffer has {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("unexpected function code {found:#04X} (expected {expected:#04X})")]
    UnexpectedFunction { expected: u8, found: u8 },

    #[error("unknown function code {0:#04X}")]
    UnknownFunction(u8),

    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("output buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },
}

/// Failures on the serial bus or the cloud link.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("could not resolve {host}:{port}")]
    Resolve { host: String, port: u16 },

    #[error("TCP connect failed: {0}")]
    Connect(#[source] io::Error),

    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("connection closed by peer")]
    Closed,

    #[error("cloud session not ready")]
    NotReady,

    #[error("transmit did not complete within {0} ms")]
    TxTimeout(u64),
}

/// Errors returned by [`crate::channel::DataChannel::send`].
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A configuration value the collaborator could not supply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("parameter {0} not configured")]
    Missing(u16),

    #[error("parameter {id} has invalid value {value:?}")]
    Invalid { id: u16, value: String },

    #[error("parameter {id} storage failure: {reason}")]
    Storage { id: u16, reason: String },
}

/// A buffer could not be allocated during startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to allocate {bytes} bytes for {what}")]
pub struct ResourceError {
    pub what: &'static str,
    pub bytes: usize,
}

/// Allocates a zeroed buffer of `len` bytes without aborting on failure.
pub fn alloc_buffer(what: &'static str, len: usize) -> Result<Vec<u8>, ResourceError> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| ResourceError { what, bytes: len })?;
    buf.resize(len, 0);
    Ok(buf)
}
