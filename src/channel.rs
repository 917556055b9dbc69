//! Transport-agnostic data channels.
//!
//! A channel pairs the send path of one transport with the receive path that
//! feeds decoded frames to whoever is attached. Application frames travel in a
//! [`CloudChannel`], either over the TLS session or over a local client
//! connection; Modbus frames travel in the [`Rs485Channel`] over the serial
//! bus. Creating a channel is construction, destroying it is `Drop`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use log::{debug, trace, warn};

use crate::bridge::DOWNLINK_ADDRESS;
use crate::error::{alloc_buffer, ChannelError, FrameError, ResourceError, TransportError};
use crate::frame::{
    self, AppFrame, AppFunction, FrameEncoder, FrameSplitter, ReservedHeader, SequenceCounter, MAX_FRAME_LEN,
    RESERVED_LEN,
};
use crate::modbus::{self, RtuFrame};
use crate::rs485::{accept_frame, LinkCounters, LinkStats, SerialTx};
use crate::session::SessionHandle;

/// Largest Modbus frame sent to the bus.
pub const MAX_SERIAL_TX_LEN: usize = 512;

/// Send and receive halves of one bridged transport.
pub trait DataChannel: Send + Sync {
    /// Encodes `payload` for `function` and writes it to the transport.
    fn send(&self, function: u8, payload: &[u8]) -> Result<(), ChannelError>;

    /// Feeds raw bytes read from the transport into the channel.
    fn receive(&self, bytes: &[u8]);

    /// Whether `send` can currently succeed.
    fn is_open(&self) -> bool;

    /// Drops partially received input. Called when the transport underneath
    /// is torn down.
    fn reset(&self) {}
}

/// Where a [`CloudChannel`] writes its encoded frames.
pub trait FrameSink: Send + Sync {
    /// Writes one complete frame.
    fn send_frame(&self, frame: &[u8]) -> Result<(), TransportError>;

    /// Whether `send_frame` can currently succeed.
    fn is_ready(&self) -> bool;
}

/// Callback target of a channel's receive path.
pub enum ReceiveHandler<F> {
    Detached,
    Attached(F),
}

impl<F> ReceiveHandler<F> {
    pub fn is_attached(&self) -> bool {
        matches!(self, Self::Attached(_))
    }
}

impl<F> Default for ReceiveHandler<F> {
    fn default() -> Self {
        Self::Detached
    }
}

impl<F> std::fmt::Debug for ReceiveHandler<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Detached => f.write_str("Detached"),
            Self::Attached(_) => f.write_str("Attached"),
        }
    }
}

pub type CloudHandler = Box<dyn Fn(AppFrame<'_>) + Send + Sync>;
pub type SerialHandler = Box<dyn Fn(RtuFrame<'_>) + Send + Sync>;

// ---------------------------------------------------------------------------
// Cloud
// ---------------------------------------------------------------------------

/// Room for one incomplete frame plus a full read behind it.
pub const REASSEMBLY_LEN: usize = 2 * MAX_FRAME_LEN;

/// Bytes read from the cloud that do not yet form a whole frame.
struct Reassembly {
    buf: Vec<u8>,
    len: usize,
}

/// Application frames over the cloud session or a local client link.
///
/// TLS records do not line up with application frames, so received bytes are
/// collected until a frame is complete. The tail of an incomplete frame is
/// carried into the next [`receive`](DataChannel::receive) and dropped on
/// [`reset`](DataChannel::reset).
pub struct CloudChannel {
    link: Arc<dyn FrameSink>,
    seq: Arc<SequenceCounter>,
    reserved: ReservedHeader,
    tx_buf: Mutex<Vec<u8>>,
    rx: Mutex<Reassembly>,
    handler: RwLock<ReceiveHandler<CloudHandler>>,
    malformed: AtomicU64,
}

impl CloudChannel {
    /// Channel over the cloud session.
    pub fn new(session: Arc<SessionHandle>, seq: Arc<SequenceCounter>) -> Result<Self, ResourceError> {
        Self::over(session, seq)
    }

    /// Channel over any frame link.
    pub fn over(link: Arc<dyn FrameSink>, seq: Arc<SequenceCounter>) -> Result<Self, ResourceError> {
        Ok(Self {
            link,
            seq,
            reserved: [0; RESERVED_LEN],
            tx_buf: Mutex::new(alloc_buffer("cloud transmit buffer", MAX_FRAME_LEN)?),
            rx: Mutex::new(Reassembly {
                buf: alloc_buffer("cloud reassembly buffer", REASSEMBLY_LEN)?,
                len: 0,
            }),
            handler: RwLock::new(ReceiveHandler::Detached),
            malformed: AtomicU64::new(0),
        })
    }

    /// Contents of the reserved header block in outgoing frames.
    pub fn with_reserved(mut self, reserved: ReservedHeader) -> Self {
        self.reserved = reserved;
        self
    }

    pub fn attach(&self, handler: CloudHandler) {
        if let Ok(mut slot) = self.handler.write() {
            *slot = ReceiveHandler::Attached(handler);
        }
    }

    pub fn detach(&self) {
        if let Ok(mut slot) = self.handler.write() {
            *slot = ReceiveHandler::Detached;
        }
    }

    /// Frames received from the cloud that failed validation.
    pub fn malformed_frames(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn pending_bytes(&self) -> usize {
        self.rx.lock().map(|rx| rx.len).unwrap_or(0)
    }

    /// Dispatches every complete frame in the buffer and moves the
    /// incomplete tail to the front. Anything after a framing error is
    /// discarded since the stream position is lost.
    fn drain(&self, rx: &mut Reassembly) {
        let mut frames = FrameSplitter::new(&rx.buf[..rx.len]);
        for chunk in frames.by_ref() {
            match chunk.and_then(frame::parse) {
                Ok(frame) => self.dispatch(frame),
                Err(e) => {
                    self.malformed.fetch_add(1, Ordering::Relaxed);
                    warn!("Dropping malformed cloud frame: {}", e);
                }
            }
        }

        let kept = frames.remainder().len();
        let start = rx.len - kept;
        rx.buf.copy_within(start..rx.len, 0);
        rx.len = kept;
        if kept > 0 {
            trace!("Holding {} bytes of an incomplete cloud frame", kept);
        }
    }

    fn encode(&self, buf: &mut [u8], function: AppFunction, payload: &[u8]) -> Result<usize, FrameError> {
        let encoder = FrameEncoder::new(&self.seq).with_reserved(self.reserved);
        match function {
            AppFunction::Heartbeat => encoder.heartbeat(buf),
            AppFunction::DataTransmission => encoder.data(buf, payload),
            AppFunction::GetParam => match payload {
                [a, b, c, d, extra @ ..] => {
                    encoder.get_param(buf, u16::from_le_bytes([*a, *b]), u16::from_le_bytes([*c, *d]), extra)
                }
                _ => Err(FrameError::TooShort { len: payload.len(), min: 4 }),
            },
            AppFunction::SetParam => match payload {
                [a, b, value @ ..] => encoder.set_param(buf, u16::from_le_bytes([*a, *b]), value),
                _ => Err(FrameError::TooShort { len: payload.len(), min: 2 }),
            },
        }
    }

    fn dispatch(&self, frame: AppFrame<'_>) {
        match self.handler.read() {
            Ok(slot) => match &*slot {
                ReceiveHandler::Attached(handler) => handler(frame),
                ReceiveHandler::Detached => {
                    debug!("No handler attached, dropping {} frame", frame.function().name())
                }
            },
            Err(_) => warn!("Cloud channel handler lock poisoned"),
        }
    }
}

impl DataChannel for CloudChannel {
    /// GetParam payloads are `param_id:u16 end_param:u16 extra...`, SetParam
    /// payloads are `param_id:u16 value...`.
    fn send(&self, function: u8, payload: &[u8]) -> Result<(), ChannelError> {
        let function = AppFunction::try_from(function)?;
        if !self.link.is_ready() {
            return Err(TransportError::NotReady.into());
        }

        let mut buf = self.tx_buf.lock().map_err(|_| TransportError::NotReady)?;
        let len = self.encode(&mut buf, function, payload)?;
        self.link.send_frame(&buf[..len])?;

        debug!("Sent {} frame ({} bytes)", function.name(), len);
        Ok(())
    }

    fn receive(&self, bytes: &[u8]) {
        let Ok(mut rx) = self.rx.lock() else {
            warn!("Cloud reassembly lock poisoned");
            return;
        };

        // The held tail is always shorter than one frame, so every pass
        // makes room for more input.
        let mut input = bytes;
        while !input.is_empty() {
            let start = rx.len;
            let take = input.len().min(rx.buf.len() - start);
            rx.buf[start..start + take].copy_from_slice(&input[..take]);
            rx.len += take;
            input = &input[take..];
            self.drain(&mut rx);
        }
    }

    fn is_open(&self) -> bool {
        self.link.is_ready()
    }

    fn reset(&self) {
        if let Ok(mut rx) = self.rx.lock() {
            if rx.len > 0 {
                debug!("Discarding {} bytes of an incomplete cloud frame", rx.len);
            }
            rx.len = 0;
        }
    }
}

// ---------------------------------------------------------------------------
// RS485
// ---------------------------------------------------------------------------

/// Modbus RTU frames over the serial bus.
pub struct Rs485Channel<T: SerialTx> {
    tx: Mutex<T>,
    tx_timeout: Duration,
    counters: LinkCounters,
    handler: RwLock<ReceiveHandler<SerialHandler>>,
}

impl<T: SerialTx> Rs485Channel<T> {
    pub fn new(tx: T, tx_timeout: Duration) -> Self {
        Self {
            tx: Mutex::new(tx),
            tx_timeout,
            counters: LinkCounters::default(),
            handler: RwLock::new(ReceiveHandler::Detached),
        }
    }

    pub fn attach(&self, handler: SerialHandler) {
        if let Ok(mut slot) = self.handler.write() {
            *slot = ReceiveHandler::Attached(handler);
        }
    }

    pub fn detach(&self) {
        if let Ok(mut slot) = self.handler.write() {
            *slot = ReceiveHandler::Detached;
        }
    }

    pub fn stats(&self) -> LinkStats {
        self.counters.snapshot()
    }

    pub fn reset_stats(&self) {
        self.counters.reset();
    }

    /// Writes an already framed message and waits for the line to drain.
    pub fn send_raw(&self, frame: &[u8]) -> Result<(), TransportError> {
        let mut tx = self.tx.lock().map_err(|_| TransportError::NotReady)?;

        let result = tx
            .write(frame)
            .map_err(TransportError::Io)
            .and_then(|_| tx.wait_tx_done(self.tx_timeout));

        match &result {
            Ok(()) => {
                self.counters.tx_ok();
                debug!("RS485 TX {} bytes: {:02X?}", frame.len(), frame);
            }
            Err(e) => {
                self.counters.tx_failed();
                warn!("RS485 send failed: {}", e);
            }
        }
        result
    }
}

impl<T: SerialTx> DataChannel for Rs485Channel<T> {
    /// Every request goes to the single unit at [`DOWNLINK_ADDRESS`].
    fn send(&self, function: u8, payload: &[u8]) -> Result<(), ChannelError> {
        let mut buf = [0u8; MAX_SERIAL_TX_LEN];
        let len = modbus::build_frame(&mut buf, DOWNLINK_ADDRESS, function, payload)?;
        self.send_raw(&buf[..len])?;
        Ok(())
    }

    fn receive(&self, bytes: &[u8]) {
        let Some(frame) = accept_frame(bytes, &self.counters) else {
            return;
        };

        match self.handler.read() {
            Ok(slot) => match &*slot {
                ReceiveHandler::Attached(handler) => handler(frame),
                ReceiveHandler::Detached => debug!("No handler attached, dropping RS485 frame"),
            },
            Err(_) => warn!("RS485 channel handler lock poisoned"),
        }
    }

    fn is_open(&self) -> bool {
        true
    }
}
