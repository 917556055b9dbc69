//! Cloud application frame codec.
//!
//! Every frame exchanged with the cloud endpoint shares an 18 byte header:
//!
//! ```text
//! offset  size  field
//!      0     2  magic A1 1A
//!      2     2  sequence number, little endian
//!      4     3  version bytes 00 00 01
//!      7     1  function code
//!      8    10  reserved header block
//!     18     …  body (function specific)
//!  end-2     2  CRC-16 (Modbus), little endian, over everything before it
//! ```
//!
//! Bodies:
//!
//! - **Heartbeat**: one marker byte (`6`), 21 bytes total
//! - **Data**: `len:u16` + `len` payload bytes
//! - **GetParam**: `param_id:u16` + `end_param:u16` + optional extra bytes
//! - **SetParam**: `param_id:u16` + `len:u8` + `len` value bytes
//!
//! Encoding writes into a caller supplied buffer. Parsing never allocates and
//! hands out views into the input buffer once magic, function code, length and
//! CRC have all been checked.

use std::sync::atomic::{AtomicU16, Ordering};

use crate::error::FrameError;
use crate::modbus;

pub const MAGIC: [u8; 2] = [0xA1, 0x1A];
pub const VERSION: [u8; 3] = [0x00, 0x00, 0x01];
pub const RESERVED_LEN: usize = 10;
pub const HEADER_LEN: usize = 18;
pub const CRC_LEN: usize = 2;

/// Heartbeat frames carry a single length marker with this value.
pub const HEARTBEAT_MARKER: u8 = 6;
pub const HEARTBEAT_LEN: usize = HEADER_LEN + 1 + CRC_LEN;

/// Smallest buffer that can hold any frame.
pub const MIN_FRAME_LEN: usize = HEARTBEAT_LEN;

/// Largest frame accepted from or sent to the cloud.
pub const MAX_FRAME_LEN: usize = 2048;

const DATA_BODY_OFFSET: usize = HEADER_LEN + 2;
const SET_PARAM_BODY_OFFSET: usize = HEADER_LEN + 3;
const GET_PARAM_SHORT_LEN: usize = HEADER_LEN + 2 + CRC_LEN;
const GET_PARAM_EXTRA_OFFSET: usize = HEADER_LEN + 4;

/// Largest data payload that fits in [`MAX_FRAME_LEN`].
pub const MAX_DATA_PAYLOAD: usize = MAX_FRAME_LEN - DATA_BODY_OFFSET - CRC_LEN;

/// Reserved header block contents.
pub type ReservedHeader = [u8; RESERVED_LEN];

/// Application layer function codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum AppFunction {
    Heartbeat = 193,
    DataTransmission = 194,
    GetParam = 195,
    SetParam = 196,
}

impl AppFunction {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            193 => Some(Self::Heartbeat),
            194 => Some(Self::DataTransmission),
            195 => Some(Self::GetParam),
            196 => Some(Self::SetParam),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Heartbeat => "Heartbeat",
            Self::DataTransmission => "DataTransmission",
            Self::GetParam => "GetParam",
            Self::SetParam => "SetParam",
        }
    }
}

impl TryFrom<u8> for AppFunction {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_u8(value).ok_or(FrameError::UnknownFunction(value))
    }
}

/// Sequence number source shared by everything that emits frames on one link.
///
/// Starts at 1 and wraps from `0xFFFF` back to `1`; zero is never handed out.
#[derive(Debug)]
pub struct SequenceCounter {
    next: AtomicU16,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Counter whose next value is `start` (0 is bumped to 1).
    pub fn starting_at(start: u16) -> Self {
        Self { next: AtomicU16::new(start.max(1)) }
    }

    /// Allocates the next sequence number.
    pub fn next(&self) -> u16 {
        let step = |cur: u16| Some(if cur == u16::MAX { 1 } else { cur + 1 });
        match self.next.fetch_update(Ordering::AcqRel, Ordering::Acquire, step) {
            Ok(prev) | Err(prev) => prev,
        }
    }

    /// Value the next call to [`next`](Self::next) will return.
    pub fn peek(&self) -> u16 {
        self.next.load(Ordering::Acquire)
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Writes application frames using a shared sequence counter.
#[derive(Debug, Clone, Copy)]
pub struct FrameEncoder<'a> {
    seq: &'a SequenceCounter,
    reserved: ReservedHeader,
}

impl<'a> FrameEncoder<'a> {
    pub fn new(seq: &'a SequenceCounter) -> Self {
        Self { seq, reserved: [0; RESERVED_LEN] }
    }

    /// Fills the reserved header block instead of zeroing it.
    pub fn with_reserved(mut self, reserved: ReservedHeader) -> Self {
        self.reserved = reserved;
        self
    }

    pub fn heartbeat(&self, buf: &mut [u8]) -> Result<usize, FrameError> {
        ensure_capacity(buf, HEARTBEAT_LEN)?;
        self.write_header(buf, AppFunction::Heartbeat);
        buf[HEADER_LEN] = HEARTBEAT_MARKER;
        modbus::append_crc(buf, HEADER_LEN + 1)
    }

    pub fn data(&self, buf: &mut [u8], payload: &[u8]) -> Result<usize, FrameError> {
        if payload.len() > MAX_DATA_PAYLOAD {
            return Err(FrameError::PayloadTooLarge { len: payload.len(), max: MAX_DATA_PAYLOAD });
        }
        let body_end = DATA_BODY_OFFSET + payload.len();
        ensure_capacity(buf, body_end + CRC_LEN)?;

        self.write_header(buf, AppFunction::DataTransmission);
        buf[HEADER_LEN..DATA_BODY_OFFSET].copy_from_slice(&(payload.len() as u16).to_le_bytes());
        buf[DATA_BODY_OFFSET..body_end].copy_from_slice(payload);
        modbus::append_crc(buf, body_end)
    }

    pub fn get_param(
        &self,
        buf: &mut [u8],
        param_id: u16,
        end_param: u16,
        extra: &[u8],
    ) -> Result<usize, FrameError> {
        let body_end = GET_PARAM_EXTRA_OFFSET + extra.len();
        if body_end + CRC_LEN > MAX_FRAME_LEN {
            return Err(FrameError::PayloadTooLarge {
                len: extra.len(),
                max: MAX_FRAME_LEN - GET_PARAM_EXTRA_OFFSET - CRC_LEN,
            });
        }
        ensure_capacity(buf, body_end + CRC_LEN)?;

        self.write_header(buf, AppFunction::GetParam);
        buf[18..20].copy_from_slice(&param_id.to_le_bytes());
        buf[20..22].copy_from_slice(&end_param.to_le_bytes());
        buf[GET_PARAM_EXTRA_OFFSET..body_end].copy_from_slice(extra);
        modbus::append_crc(buf, body_end)
    }

    pub fn set_param(&self, buf: &mut [u8], param_id: u16, value: &[u8]) -> Result<usize, FrameError> {
        if value.len() > u8::MAX as usize {
            return Err(FrameError::PayloadTooLarge { len: value.len(), max: u8::MAX as usize });
        }
        let body_end = SET_PARAM_BODY_OFFSET + value.len();
        ensure_capacity(buf, body_end + CRC_LEN)?;

        self.write_header(buf, AppFunction::SetParam);
        buf[18..20].copy_from_slice(&param_id.to_le_bytes());
        buf[20] = value.len() as u8;
        buf[SET_PARAM_BODY_OFFSET..body_end].copy_from_slice(value);
        modbus::append_crc(buf, body_end)
    }

    /// Sequence numbers are only drawn once the buffer is known to be big enough.
    fn write_header(&self, buf: &mut [u8], function: AppFunction) {
        buf[0..2].copy_from_slice(&MAGIC);
        buf[2..4].copy_from_slice(&self.seq.next().to_le_bytes());
        buf[4..7].copy_from_slice(&VERSION);
        buf[7] = function.code();
        buf[8..HEADER_LEN].copy_from_slice(&self.reserved);
    }
}

fn ensure_capacity(buf: &[u8], needed: usize) -> Result<(), FrameError> {
    if buf.len() < needed {
        return Err(FrameError::BufferTooSmall { needed, available: buf.len() });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Header fields common to every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader<'a> {
    raw: &'a [u8],
}

impl<'a> FrameHeader<'a> {
    pub fn sequence(&self) -> u16 {
        u16::from_le_bytes([self.raw[2], self.raw[3]])
    }

    pub fn function_code(&self) -> u8 {
        self.raw[7]
    }

    pub fn reserved(&self) -> &'a [u8] {
        &self.raw[8..HEADER_LEN]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataFrame<'a> {
    pub header: FrameHeader<'a>,
    pub payload: &'a [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetParamFrame<'a> {
    pub header: FrameHeader<'a>,
    pub param_id: u16,
    pub end_param: u16,
    pub extra: &'a [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetParamFrame<'a> {
    pub header: FrameHeader<'a>,
    pub param_id: u16,
    pub value: &'a [u8],
}

/// A validated frame of any kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppFrame<'a> {
    Heartbeat(FrameHeader<'a>),
    Data(DataFrame<'a>),
    GetParam(GetParamFrame<'a>),
    SetParam(SetParamFrame<'a>),
}

impl<'a> AppFrame<'a> {
    pub fn function(&self) -> AppFunction {
        match self {
            Self::Heartbeat(_) => AppFunction::Heartbeat,
            Self::Data(_) => AppFunction::DataTransmission,
            Self::GetParam(_) => AppFunction::GetParam,
            Self::SetParam(_) => AppFunction::SetParam,
        }
    }

    pub fn header(&self) -> FrameHeader<'a> {
        match self {
            Self::Heartbeat(h) => *h,
            Self::Data(f) => f.header,
            Self::GetParam(f) => f.header,
            Self::SetParam(f) => f.header,
        }
    }
}

/// Checks magic and minimum size, then returns the frame's function code.
pub fn peek_function(buf: &[u8]) -> Result<AppFunction, FrameError> {
    check_magic(buf)?;
    if buf.len() < MIN_FRAME_LEN {
        return Err(FrameError::TooShort { len: buf.len(), min: MIN_FRAME_LEN });
    }
    AppFunction::try_from(buf[7])
}

/// Parses any frame, dispatching on its function code.
pub fn parse(buf: &[u8]) -> Result<AppFrame<'_>, FrameError> {
    match peek_function(buf)? {
        AppFunction::Heartbeat => parse_heartbeat(buf).map(AppFrame::Heartbeat),
        AppFunction::DataTransmission => parse_data(buf).map(AppFrame::Data),
        AppFunction::GetParam => parse_get_param(buf).map(AppFrame::GetParam),
        AppFunction::SetParam => parse_set_param(buf).map(AppFrame::SetParam),
    }
}

/// The marker byte is not checked; the fixed length is.
pub fn parse_heartbeat(buf: &[u8]) -> Result<FrameHeader<'_>, FrameError> {
    let header = check_prefix(buf, AppFunction::Heartbeat, HEARTBEAT_LEN)?;
    check_length(HEARTBEAT_LEN, buf.len())?;
    modbus::check_crc(buf)?;
    Ok(header)
}

pub fn parse_data(buf: &[u8]) -> Result<DataFrame<'_>, FrameError> {
    let header = check_prefix(buf, AppFunction::DataTransmission, DATA_BODY_OFFSET + CRC_LEN)?;
    let len = u16::from_le_bytes([buf[18], buf[19]]) as usize;
    check_length(DATA_BODY_OFFSET + len + CRC_LEN, buf.len())?;
    modbus::check_crc(buf)?;

    Ok(DataFrame {
        header,
        payload: &buf[DATA_BODY_OFFSET..DATA_BODY_OFFSET + len],
    })
}

pub fn parse_set_param(buf: &[u8]) -> Result<SetParamFrame<'_>, FrameError> {
    let header = check_prefix(buf, AppFunction::SetParam, SET_PARAM_BODY_OFFSET + CRC_LEN)?;
    let len = buf[20] as usize;
    check_length(SET_PARAM_BODY_OFFSET + len + CRC_LEN, buf.len())?;
    modbus::check_crc(buf)?;

    Ok(SetParamFrame {
        header,
        param_id: u16::from_le_bytes([buf[18], buf[19]]),
        value: &buf[SET_PARAM_BODY_OFFSET..SET_PARAM_BODY_OFFSET + len],
    })
}

/// GetParam has no length field. A 22 byte frame carries only the parameter
/// id (the end parameter then equals it); anything from 24 bytes up carries
/// both ids followed by extra bytes.
pub fn parse_get_param(buf: &[u8]) -> Result<GetParamFrame<'_>, FrameError> {
    let header = check_prefix(buf, AppFunction::GetParam, GET_PARAM_SHORT_LEN)?;
    if buf.len() == GET_PARAM_SHORT_LEN + 1 {
        return Err(FrameError::LengthMismatch {
            expected: GET_PARAM_EXTRA_OFFSET + CRC_LEN,
            actual: buf.len(),
        });
    }
    modbus::check_crc(buf)?;

    let param_id = u16::from_le_bytes([buf[18], buf[19]]);
    if buf.len() == GET_PARAM_SHORT_LEN {
        return Ok(GetParamFrame { header, param_id, end_param: param_id, extra: &[] });
    }

    Ok(GetParamFrame {
        header,
        param_id,
        end_param: u16::from_le_bytes([buf[20], buf[21]]),
        extra: &buf[GET_PARAM_EXTRA_OFFSET..buf.len() - CRC_LEN],
    })
}

fn check_magic(buf: &[u8]) -> Result<(), FrameError> {
    match buf {
        [a, b, ..] if [*a, *b] == MAGIC => Ok(()),
        [a, b, ..] => Err(FrameError::BadMagic([*a, *b])),
        [a] => Err(FrameError::BadMagic([*a, 0])),
        [] => Err(FrameError::TooShort { len: 0, min: MIN_FRAME_LEN }),
    }
}

fn check_prefix(buf: &[u8], function: AppFunction, min: usize) -> Result<FrameHeader<'_>, FrameError> {
    check_magic(buf)?;
    if buf.len() < min {
        return Err(FrameError::TooShort { len: buf.len(), min });
    }
    if buf[7] != function.code() {
        return Err(FrameError::UnexpectedFunction { expected: function.code(), found: buf[7] });
    }
    Ok(FrameHeader { raw: &buf[..HEADER_LEN] })
}

fn check_length(expected: usize, actual: usize) -> Result<(), FrameError> {
    if expected != actual {
        return Err(FrameError::LengthMismatch { expected, actual });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Stream splitting
// ---------------------------------------------------------------------------

/// Wire length of the frame at the start of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed to tell. GetParam frames have
/// no length field and are taken to extend to the end of the buffer once the
/// short form fits. A header announcing more than [`MAX_FRAME_LEN`] bytes is an
/// error rather than a reason to keep waiting.
pub fn frame_len(buf: &[u8]) -> Result<Option<usize>, FrameError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    check_magic(buf)?;
    if buf.len() < HEADER_LEN + 1 {
        return Ok(None);
    }

    let len = match AppFunction::try_from(buf[7])? {
        AppFunction::Heartbeat => HEARTBEAT_LEN,
        AppFunction::GetParam => {
            if buf.len() < GET_PARAM_SHORT_LEN {
                return Ok(None);
            }
            buf.len()
        }
        AppFunction::DataTransmission => {
            if buf.len() < DATA_BODY_OFFSET {
                return Ok(None);
            }
            DATA_BODY_OFFSET + u16::from_le_bytes([buf[18], buf[19]]) as usize + CRC_LEN
        }
        AppFunction::SetParam => {
            if buf.len() < SET_PARAM_BODY_OFFSET {
                return Ok(None);
            }
            SET_PARAM_BODY_OFFSET + buf[20] as usize + CRC_LEN
        }
    };

    if len > MAX_FRAME_LEN {
        return Err(FrameError::PayloadTooLarge { len, max: MAX_FRAME_LEN });
    }
    Ok(if len <= buf.len() { Some(len) } else { None })
}

/// Iterates over back-to-back frames held in a receive buffer.
///
/// Yields each complete frame's bytes. Iteration stops quietly in front of an
/// incomplete trailing frame, which stays available through
/// [`remainder`](Self::remainder). Bytes that stop looking like a frame yield
/// one error and end the iteration.
#[derive(Debug)]
pub struct FrameSplitter<'a> {
    rest: &'a [u8],
}

impl<'a> FrameSplitter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { rest: buf }
    }

    /// Bytes not yet yielded: an incomplete frame after iteration ends
    /// normally, empty after an error.
    pub fn remainder(&self) -> &'a [u8] {
        self.rest
    }
}

impl<'a> Iterator for FrameSplitter<'a> {
    type Item = Result<&'a [u8], FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }

        let rest = self.rest;
        match frame_len(rest) {
            Ok(Some(len)) => {
                self.rest = &rest[len..];
                Some(Ok(&rest[..len]))
            }
            Ok(None) => None,
            Err(e) => {
                self.rest = &[];
                Some(Err(e))
            }
        }
    }
}
