//! RS485 link handling.
//!
//! The bus is half duplex and Modbus RTU frames carry no length field, so a
//! frame is whatever accumulates in the receive buffer until the line has been
//! quiet for the configured silence window. Every frame is CRC checked before
//! anything looks at its contents; bad frames are dropped without a reply.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, trace, warn};

use crate::channel::DataChannel;
use crate::config::SerialSettings;
use crate::error::{alloc_buffer, FrameError, ResourceError, TransportError};
use crate::modbus::RtuFrame;

/// Receive side of a serial port.
pub trait SerialRx: Send {
    /// Waits up to `timeout` for the first byte, then keeps reading until the
    /// line has been idle for the port's inter-frame gap. Returns the number
    /// of bytes read; `Ok(0)` when nothing arrived in time.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;
}

/// Collects one silence-delimited frame from a chunked byte source.
///
/// `read_chunk(buf, wait)` returns whatever arrived within `wait`, `Ok(0)` if
/// nothing did. The first call waits `first_byte`, every later call waits
/// `gap`, and the frame ends at the first empty read or when `buf` is full.
pub fn read_frame<F>(buf: &mut [u8], first_byte: Duration, gap: Duration, mut read_chunk: F) -> io::Result<usize>
where
    F: FnMut(&mut [u8], Duration) -> io::Result<usize>,
{
    let mut len = read_chunk(buf, first_byte)?;
    if len == 0 {
        return Ok(0);
    }

    while len < buf.len() {
        let more = read_chunk(&mut buf[len..], gap)?;
        if more == 0 {
            break;
        }
        len += more;
    }
    Ok(len)
}

/// Transmit side of a serial port.
pub trait SerialTx: Send {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Blocks until the last byte has left the transmitter.
    fn wait_tx_done(&mut self, timeout: Duration) -> Result<(), TransportError>;
}

/// Snapshot of serial link counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LinkStats {
    pub rx_frames: u64,
    pub tx_frames: u64,
    pub crc_errors: u64,
    pub short_frames: u64,
    pub unsupported_functions: u64,
    pub tx_errors: u64,
}

/// Live counters behind [`LinkStats`].
#[derive(Debug, Default)]
pub struct LinkCounters {
    rx_frames: AtomicU64,
    tx_frames: AtomicU64,
    crc_errors: AtomicU64,
    short_frames: AtomicU64,
    unsupported_functions: AtomicU64,
    tx_errors: AtomicU64,
}

impl LinkCounters {
    pub fn snapshot(&self) -> LinkStats {
        let get = |a: &AtomicU64| a.load(Ordering::Relaxed);
        LinkStats {
            rx_frames: get(&self.rx_frames),
            tx_frames: get(&self.tx_frames),
            crc_errors: get(&self.crc_errors),
            short_frames: get(&self.short_frames),
            unsupported_functions: get(&self.unsupported_functions),
            tx_errors: get(&self.tx_errors),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.rx_frames,
            &self.tx_frames,
            &self.crc_errors,
            &self.short_frames,
            &self.unsupported_functions,
            &self.tx_errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub(crate) fn tx_ok(&self) {
        self.tx_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn tx_failed(&self) {
        self.tx_errors.fetch_add(1, Ordering::Relaxed);
    }
}

/// Validates one silence-delimited frame from the bus.
///
/// Returns the frame only if it is long enough, its CRC matches, and its
/// function code is on the allow-list. Each rejection is counted.
pub fn accept_frame<'a>(bytes: &'a [u8], counters: &LinkCounters) -> Option<RtuFrame<'a>> {
    let frame = match RtuFrame::parse(bytes) {
        Ok(frame) => frame,
        Err(FrameError::TooShort { len, .. }) => {
            counters.short_frames.fetch_add(1, Ordering::Relaxed);
            debug!("RS485 frame too short ({} bytes), dropped", len);
            return None;
        }
        Err(e) => {
            counters.crc_errors.fetch_add(1, Ordering::Relaxed);
            warn!("RS485 {}, frame dropped", e);
            return None;
        }
    };

    if frame.known_function().is_none() {
        counters.unsupported_functions.fetch_add(1, Ordering::Relaxed);
        warn!("Unsupported Modbus function code 0x{:02X}, frame dropped", frame.function());
        return None;
    }

    counters.rx_frames.fetch_add(1, Ordering::Relaxed);
    Some(frame)
}

/// Receive loop of the RS485 worker.
pub struct Rs485Receiver<R: SerialRx> {
    port: R,
    channel: Arc<dyn DataChannel>,
    read_timeout: Duration,
    buf: Vec<u8>,
    read_errors: u64,
}

impl<R: SerialRx> Rs485Receiver<R> {
    /// Allocates the receive buffer up front.
    pub fn new(port: R, channel: Arc<dyn DataChannel>, settings: &SerialSettings) -> Result<Self, ResourceError> {
        Ok(Self {
            port,
            channel,
            read_timeout: settings.read_timeout,
            buf: alloc_buffer("RS485 receive buffer", settings.rx_buffer_size)?,
            read_errors: 0,
        })
    }

    /// Reads one frame (or times out) and hands it to the channel.
    ///
    /// Returns the number of bytes received.
    pub fn poll(&mut self) -> usize {
        let len = match self.port.read(&mut self.buf, self.read_timeout) {
            Ok(len) => len,
            Err(e) => {
                self.read_errors += 1;
                warn!("RS485 read error: {}", e);
                return 0;
            }
        };

        if len == 0 {
            trace!("RS485 receive timeout");
            return 0;
        }

        trace!("RS485 RX {} bytes: {:02X?}", len, &self.buf[..len]);
        self.channel.receive(&self.buf[..len]);
        len
    }

    pub fn read_errors(&self) -> u64 {
        self.read_errors
    }

    pub fn run(&mut self) -> ! {
        info!("RS485 receive worker started");
        loop {
            self.poll();
        }
    }
}
