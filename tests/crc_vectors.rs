//! CRC-16/MODBUS verification
//! Cross-checks the bridge CRC against the `crc` crate's catalogue algorithm

use crc::{Crc, CRC_16_MODBUS};
use modbus_cloud_bridge::frame::{self, FrameEncoder, SequenceCounter};
use modbus_cloud_bridge::modbus::{build_frame, crc16, verify, RtuFrame};
use proptest::prelude::*;

const REFERENCE: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

#[test]
fn test_catalogue_check_value() {
    // CRC catalogue check value for "123456789"
    assert_eq!(crc16(b"123456789"), REFERENCE.checksum(b"123456789"));
    assert_eq!(crc16(b"123456789"), 0x4B37);
}

#[test]
fn test_known_modbus_requests() {
    let vectors: &[(&[u8], u16)] = &[
        (&[0x01, 0x03, 0x00, 0x00, 0x00, 0x0A], 0xCDC5),
        (&[0x11, 0x03, 0x00, 0x6B, 0x00, 0x03], 0x8776),
        (&[0x05, 0x04, 0x01, 0x02], 0x78C1),
        (&[0x01, 0x03, 0xAA, 0xBB], 0x0BCF),
    ];

    for (data, expected) in vectors {
        assert_eq!(crc16(data), *expected, "data {:02X?}", data);
        assert_eq!(REFERENCE.checksum(data), *expected);
    }
}

#[test]
fn test_crc_is_sent_low_byte_first() {
    let mut buf = [0u8; 8];
    let len = build_frame(&mut buf, 0x01, 0x03, &[0xAA, 0xBB]).unwrap();
    assert_eq!(&buf[..len], &[0x01, 0x03, 0xAA, 0xBB, 0xCF, 0x0B]);
}

fn flip(frame: &[u8], bits: &[usize]) -> Vec<u8> {
    let mut out = frame.to_vec();
    for bit in bits {
        out[bit / 8] ^= 1 << (bit % 8);
    }
    out
}

#[test]
fn test_every_single_bit_flip_in_modbus_frame() {
    let frames: [&[u8]; 2] = [
        &[0x05, 0x04, 0x01, 0x02, 0xC1, 0x78],
        &[0x11, 0x03, 0x00, 0x6B, 0x00, 0x03, 0x76, 0x87],
    ];

    for frame in frames {
        assert!(verify(frame));
        for bit in 0..frame.len() * 8 {
            assert!(!verify(&flip(frame, &[bit])), "frame {:02X?} bit {}", frame, bit);
        }
    }
}

#[test]
fn test_every_double_bit_flip_in_modbus_frame() {
    let frame = [0x05, 0x04, 0x01, 0x02, 0xC1, 0x78];
    let bits = frame.len() * 8;

    for a in 0..bits {
        for b in a + 1..bits {
            assert!(!verify(&flip(&frame, &[a, b])), "bits {} and {}", a, b);
        }
    }
}

#[test]
fn test_every_single_bit_flip_in_application_frames() {
    let seq = SequenceCounter::starting_at(0x1234);
    let enc = FrameEncoder::new(&seq).with_reserved(*b"BA12345678");
    let mut frames = Vec::new();
    let mut buf = [0u8; 128];

    let n = enc.heartbeat(&mut buf).unwrap();
    frames.push(buf[..n].to_vec());
    let n = enc.data(&mut buf, &[0x05, 0x04, 0x01, 0x02]).unwrap();
    frames.push(buf[..n].to_vec());
    let n = enc.get_param(&mut buf, 5, 8, &[]).unwrap();
    frames.push(buf[..n].to_vec());
    let n = enc.set_param(&mut buf, 6, b"4348").unwrap();
    frames.push(buf[..n].to_vec());

    for original in &frames {
        assert!(frame::parse(original).is_ok());
        for bit in 0..original.len() * 8 {
            let corrupted = flip(original, &[bit]);
            assert!(
                frame::parse(&corrupted).is_err(),
                "function {:#04X} bit {} flip accepted",
                original[7],
                bit
            );
        }
    }
}

proptest! {
    #[test]
    fn prop_matches_reference(data in proptest::collection::vec(any::<u8>(), 0..512)) {
        prop_assert_eq!(crc16(&data), REFERENCE.checksum(&data));
    }

    #[test]
    fn prop_built_frames_verify(
        address in any::<u8>(),
        function in any::<u8>(),
        data in proptest::collection::vec(any::<u8>(), 0..252),
    ) {
        let mut buf = [0u8; 256];
        let len = build_frame(&mut buf, address, function, &data).unwrap();
        prop_assert!(verify(&buf[..len]));

        let frame = RtuFrame::parse(&buf[..len]).unwrap();
        prop_assert_eq!(frame.address(), address);
        prop_assert_eq!(frame.function(), function);
        prop_assert_eq!(frame.data(), &data[..]);
    }

    #[test]
    fn prop_single_bit_flip_detected(
        data in proptest::collection::vec(any::<u8>(), 1..64),
        bit in any::<prop::sample::Index>(),
    ) {
        let mut buf = [0u8; 72];
        let len = build_frame(&mut buf, 0x01, 0x03, &data).unwrap();
        let bit = bit.index(len * 8);
        buf[bit / 8] ^= 1 << (bit % 8);
        prop_assert!(!verify(&buf[..len]));
    }
}
