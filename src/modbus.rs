//! Modbus RTU framing and CRC-16.
//!
//! An RTU frame on the wire is `address | function | data... | crc_lo | crc_hi`.
//! The CRC covers every byte before it and uses the reflected polynomial
//! `0xA001` with an initial register of `0xFFFF`.

use crate::error::FrameError;

/// Smallest valid RTU frame: address, function code and the two CRC bytes.
pub const MIN_FRAME_LEN: usize = 4;

/// Bytes of an RTU frame that are not payload.
pub const FRAME_OVERHEAD: usize = 4;

/// Largest frame the serial link handles.
pub const MAX_FRAME_LEN: usize = 256;

const CRC_POLY: u16 = 0xA001;
const CRC_INIT: u16 = 0xFFFF;

/// Function codes the bridge accepts from the serial bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum ModbusFunction {
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    /// Vendor: inverter event report.
    EventReport = 0x21,
    /// Vendor: extended register block.
    ExtendedRead = 0x22,
    /// Vendor: dongle management.
    DongleCommand = 0x88,
    /// Vendor: device identification.
    DeviceInfo = 0xFE,
}

impl ModbusFunction {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x03 => Some(Self::ReadHoldingRegisters),
            0x04 => Some(Self::ReadInputRegisters),
            0x21 => Some(Self::EventReport),
            0x22 => Some(Self::ExtendedRead),
            0x88 => Some(Self::DongleCommand),
            0xFE => Some(Self::DeviceInfo),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Computes the Modbus RTU CRC-16 of `data`.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = CRC_INIT;

    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ CRC_POLY;
            } else {
                crc >>= 1;
            }
        }
    }

    crc
}

/// Reads the little-endian CRC stored in the last two bytes of `frame`.
pub fn trailing_crc(frame: &[u8]) -> Option<u16> {
    let n = frame.len();
    if n < 2 {
        return None;
    }
    Some(u16::from_le_bytes([frame[n - 2], frame[n - 1]]))
}

/// Checks the trailing CRC of a complete frame.
pub fn verify(frame: &[u8]) -> bool {
    match trailing_crc(frame) {
        Some(received) => crc16(&frame[..frame.len() - 2]) == received,
        None => false,
    }
}

/// Like [`verify`], but reports what was expected and what arrived.
pub fn check_crc(frame: &[u8]) -> Result<(), FrameError> {
    let received = trailing_crc(frame).ok_or(FrameError::TooShort { len: frame.len(), min: 2 })?;
    let expected = crc16(&frame[..frame.len() - 2]);
    if expected != received {
        return Err(FrameError::CrcMismatch { expected, received });
    }
    Ok(())
}

/// Appends the CRC of `buf[..len]` at `buf[len..len + 2]` and returns the new length.
pub fn append_crc(buf: &mut [u8], len: usize) -> Result<usize, FrameError> {
    let needed = len + 2;
    if buf.len() < needed {
        return Err(FrameError::BufferTooSmall { needed, available: buf.len() });
    }
    let crc = crc16(&buf[..len]);
    buf[len..needed].copy_from_slice(&crc.to_le_bytes());
    Ok(needed)
}

/// Writes a complete RTU frame into `buf` and returns its length.
pub fn build_frame(buf: &mut [u8], address: u8, function: u8, data: &[u8]) -> Result<usize, FrameError> {
    let needed = data.len() + FRAME_OVERHEAD;
    if buf.len() < needed {
        return Err(FrameError::BufferTooSmall { needed, available: buf.len() });
    }

    buf[0] = address;
    buf[1] = function;
    buf[2..2 + data.len()].copy_from_slice(data);
    append_crc(buf, 2 + data.len())
}

/// A CRC-checked view of an RTU frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtuFrame<'a> {
    raw: &'a [u8],
}

impl<'a> RtuFrame<'a> {
    /// Validates length and CRC. The function code is not checked here.
    pub fn parse(raw: &'a [u8]) -> Result<Self, FrameError> {
        if raw.len() < MIN_FRAME_LEN {
            return Err(FrameError::TooShort { len: raw.len(), min: MIN_FRAME_LEN });
        }
        check_crc(raw)?;
        Ok(Self { raw })
    }

    pub fn address(&self) -> u8 {
        self.raw[0]
    }

    pub fn function(&self) -> u8 {
        self.raw[1]
    }

    /// Known function code, if it is on the allow-list.
    pub fn known_function(&self) -> Option<ModbusFunction> {
        ModbusFunction::from_u8(self.function())
    }

    /// Bytes between the function code and the CRC.
    pub fn data(&self) -> &'a [u8] {
        &self.raw[2..self.raw.len() - 2]
    }

    pub fn crc(&self) -> u16 {
        let n = self.raw.len();
        u16::from_le_bytes([self.raw[n - 2], self.raw[n - 1]])
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.raw
    }
}
