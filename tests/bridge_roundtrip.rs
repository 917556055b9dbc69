//! End-to-end bridge tests
//! A full gateway wired to in-memory serial and cloud transports.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use modbus_cloud_bridge::clock::ManualClock;
use modbus_cloud_bridge::config::{BridgeConfig, ConfigSource, MemoryParams, ParamId};
use modbus_cloud_bridge::error::TransportError;
use modbus_cloud_bridge::frame::{self, AppFrame, FrameEncoder, SequenceCounter};
use modbus_cloud_bridge::gateway::Gateway;
use modbus_cloud_bridge::psk::TlsPskParams;
use modbus_cloud_bridge::rs485::{SerialRx, SerialTx};
use modbus_cloud_bridge::session::SessionState;
use modbus_cloud_bridge::transport::{CloudConnector, CloudStream};
use proptest::prelude::*;

#[derive(Default)]
struct Wire {
    serial_in: VecDeque<Vec<u8>>,
    serial_out: Vec<Vec<u8>>,
    cloud_in: VecDeque<Vec<u8>>,
    cloud_out: Vec<Vec<u8>>,
}

type SharedWire = Arc<Mutex<Wire>>;

struct MockRx(SharedWire);

impl SerialRx for MockRx {
    fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
        match self.0.lock().unwrap().serial_in.pop_front() {
            Some(bytes) => {
                buf[..bytes.len()].copy_from_slice(&bytes);
                Ok(bytes.len())
            }
            None => Ok(0),
        }
    }
}

struct MockTx(SharedWire);

impl SerialTx for MockTx {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.0.lock().unwrap().serial_out.push(bytes.to_vec());
        Ok(())
    }

    fn wait_tx_done(&mut self, _timeout: Duration) -> Result<(), TransportError> {
        Ok(())
    }
}

struct MockStream(SharedWire);

impl CloudStream for MockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.0.lock().unwrap().cloud_in.pop_front() {
            Some(bytes) => {
                buf[..bytes.len()].copy_from_slice(&bytes);
                Ok(bytes.len())
            }
            None => Err(io::Error::new(io::ErrorKind::TimedOut, "idle")),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.0.lock().unwrap().cloud_out.push(buf.to_vec());
        Ok(())
    }

    fn shutdown(&mut self) {}
}

struct MockConnector(SharedWire);

impl CloudConnector for MockConnector {
    type Tcp = ();
    type Stream = MockStream;

    fn connect(&mut self, _host: &str, _port: u16, _timeout: Duration) -> Result<(), TransportError> {
        Ok(())
    }

    fn handshake(&mut self, _tcp: (), _host: &str, _params: &TlsPskParams) -> Result<MockStream, TransportError> {
        Ok(MockStream(Arc::clone(&self.0)))
    }
}

type TestGateway = Gateway<MockConnector, MockRx, MockTx>;

fn gateway() -> (TestGateway, SharedWire, Arc<MemoryParams>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let wire = SharedWire::default();
    let params = Arc::new(MemoryParams::new());
    let gateway = Gateway::new(
        &BridgeConfig::default(),
        Arc::clone(&params),
        Arc::new(ManualClock::new()),
        MockConnector(Arc::clone(&wire)),
        MockRx(Arc::clone(&wire)),
        MockTx(Arc::clone(&wire)),
    )
    .unwrap();
    (gateway, wire, params)
}

fn connect(gateway: &mut TestGateway) {
    for _ in 0..4 {
        gateway.session_mut().step();
    }
    assert_eq!(gateway.monitor().state(), SessionState::Ready);
}

fn cloud_data_frame(seq: u16, payload: &[u8]) -> Vec<u8> {
    let counter = SequenceCounter::starting_at(seq);
    let mut buf = [0u8; frame::MAX_FRAME_LEN];
    let len = FrameEncoder::new(&counter).data(&mut buf, payload).unwrap();
    buf[..len].to_vec()
}

#[test]
fn test_rs485_frame_forwarded_to_cloud() {
    let (mut gw, wire, _) = gateway();
    connect(&mut gw);

    wire.lock().unwrap().serial_in.push_back(vec![0x05, 0x04, 0x01, 0x02, 0xC1, 0x78]);
    assert_eq!(gw.receiver_mut().poll(), 6);

    let wire = wire.lock().unwrap();
    assert_eq!(wire.cloud_out.len(), 1);
    let sent = &wire.cloud_out[0];
    assert_eq!(sent.len(), 24);
    assert_eq!(&sent[22..], &[0xA6, 0x77]);
    match frame::parse(sent).unwrap() {
        AppFrame::Data(data) => {
            assert_eq!(data.payload, &[0x01, 0x02]);
            assert_eq!(data.header.sequence(), 1);
        }
        other => panic!("expected data frame, got {:?}", other),
    }
}

#[test]
fn test_cloud_frame_forwarded_to_rs485() {
    let (mut gw, wire, _) = gateway();
    connect(&mut gw);

    wire.lock().unwrap().cloud_in.push_back(cloud_data_frame(7, &[0xAA, 0xBB]));
    gw.session_mut().step();

    assert_eq!(wire.lock().unwrap().serial_out, vec![vec![0x01, 0x03, 0xAA, 0xBB, 0xCF, 0x0B]]);
    assert_eq!(gw.monitor().stats().router.downlink_frames, 1);
}

#[test]
fn test_nothing_forwarded_before_ready() {
    let (mut gw, wire, _) = gateway();

    wire.lock().unwrap().serial_in.push_back(vec![0x05, 0x04, 0x01, 0x02, 0xC1, 0x78]);
    gw.receiver_mut().poll();

    let stats = gw.monitor().stats();
    assert!(wire.lock().unwrap().cloud_out.is_empty());
    assert_eq!(stats.router.dropped_not_ready, 1);
    assert_eq!(stats.link.rx_frames, 1);
}

#[test]
fn test_corrupt_serial_frame_dropped() {
    let (mut gw, wire, _) = gateway();
    connect(&mut gw);

    wire.lock().unwrap().serial_in.push_back(vec![0x05, 0x04, 0x01, 0x02, 0x78, 0xC1]);
    gw.receiver_mut().poll();

    assert!(wire.lock().unwrap().cloud_out.is_empty());
    assert_eq!(gw.monitor().stats().link.crc_errors, 1);
}

#[test]
fn test_set_param_from_cloud() {
    let (mut gw, wire, params) = gateway();
    connect(&mut gw);

    let counter = SequenceCounter::new();
    let mut buf = [0u8; 64];
    let len = FrameEncoder::new(&counter).set_param(&mut buf, 7, b"BA12345678").unwrap();
    wire.lock().unwrap().cloud_in.push_back(buf[..len].to_vec());
    gw.session_mut().step();

    assert_eq!(params.get_string(ParamId::DeviceSerial).unwrap(), "BA12345678");
    let wire = wire.lock().unwrap();
    assert!(matches!(frame::parse(&wire.cloud_out[0]), Ok(AppFrame::SetParam(p)) if p.param_id == 7));
}

#[test]
fn test_back_to_back_cloud_frames() {
    let (mut gw, wire, _) = gateway();
    connect(&mut gw);

    let mut chunk = cloud_data_frame(1, &[0x10]);
    chunk.extend(cloud_data_frame(2, &[0x20, 0x21]));
    wire.lock().unwrap().cloud_in.push_back(chunk);
    gw.session_mut().step();

    let wire = wire.lock().unwrap();
    assert_eq!(wire.serial_out.len(), 2);
    assert_eq!(&wire.serial_out[1][2..4], &[0x20, 0x21]);
}

#[test]
fn test_cloud_frame_split_across_reads() {
    let (mut gw, wire, _) = gateway();
    connect(&mut gw);

    let frame = cloud_data_frame(3, &[0x01, 0x02]);
    assert_eq!(frame.len(), 24);
    wire.lock().unwrap().cloud_in.push_back(frame[..10].to_vec());
    wire.lock().unwrap().cloud_in.push_back(frame[10..].to_vec());

    gw.session_mut().step();
    assert!(wire.lock().unwrap().serial_out.is_empty());
    gw.session_mut().step();

    assert_eq!(wire.lock().unwrap().serial_out, vec![vec![0x01, 0x03, 0x01, 0x02, 0x71, 0x89]]);
    let stats = gw.monitor().stats();
    assert_eq!(stats.malformed_cloud_frames, 0);
    assert_eq!(stats.router.downlink_frames, 1);
}

#[test]
fn test_cloud_frame_split_at_every_offset() {
    let frame = cloud_data_frame(9, &[0x00, 0x6B, 0x00, 0x03]);

    for cut in 1..frame.len() {
        let (mut gw, wire, _) = gateway();
        connect(&mut gw);
        wire.lock().unwrap().cloud_in.push_back(frame[..cut].to_vec());
        wire.lock().unwrap().cloud_in.push_back(frame[cut..].to_vec());
        gw.session_mut().step();
        gw.session_mut().step();

        let wire = wire.lock().unwrap();
        assert_eq!(wire.serial_out.len(), 1, "split at {}", cut);
        assert_eq!(&wire.serial_out[0][..6], &[0x01, 0x03, 0x00, 0x6B, 0x00, 0x03], "split at {}", cut);
        assert_eq!(gw.monitor().stats().malformed_cloud_frames, 0, "split at {}", cut);
    }
}

#[test]
fn test_every_bit_flip_never_reaches_rs485() {
    let frame = cloud_data_frame(1, &[0x00, 0x6B, 0x00, 0x03]);

    for bit in 0..frame.len() * 8 {
        let (mut gw, wire, _) = gateway();
        connect(&mut gw);

        let mut bytes = frame.clone();
        bytes[bit / 8] ^= 1 << (bit % 8);
        wire.lock().unwrap().cloud_in.push_back(bytes);
        gw.session_mut().step();

        assert!(wire.lock().unwrap().serial_out.is_empty(), "bit {} flip forwarded", bit);
    }
}

proptest! {
    #[test]
    fn prop_downlink_frames_target_unit_one(payload in proptest::collection::vec(any::<u8>(), 1..200)) {
        let (mut gw, wire, _) = gateway();
        connect(&mut gw);

        wire.lock().unwrap().cloud_in.push_back(cloud_data_frame(1, &payload));
        gw.session_mut().step();

        let wire = wire.lock().unwrap();
        prop_assert_eq!(wire.serial_out.len(), 1);
        let sent = &wire.serial_out[0];
        prop_assert_eq!(&sent[..2], &[0x01, 0x03]);
        prop_assert_eq!(&sent[2..sent.len() - 2], &payload[..]);
        prop_assert!(modbus_cloud_bridge::modbus::verify(sent));
    }

    #[test]
    fn prop_uplink_sequence_numbers_increase(count in 1usize..20) {
        let (mut gw, wire, _) = gateway();
        connect(&mut gw);

        for _ in 0..count {
            wire.lock().unwrap().serial_in.push_back(vec![0x05, 0x04, 0x01, 0x02, 0xC1, 0x78]);
            gw.receiver_mut().poll();
        }

        let wire = wire.lock().unwrap();
        let seqs: Vec<u16> = wire.cloud_out.iter().map(|f| u16::from_le_bytes([f[2], f[3]])).collect();
        let expected: Vec<u16> = (1..=count as u16).collect();
        prop_assert_eq!(seqs, expected);
    }

    #[test]
    fn prop_bad_magic_never_reaches_rs485(first in any::<u8>(), payload in proptest::collection::vec(any::<u8>(), 1..64)) {
        prop_assume!(first != 0xA1);
        let (mut gw, wire, _) = gateway();
        connect(&mut gw);

        let mut bytes = cloud_data_frame(1, &payload);
        bytes[0] = first;
        wire.lock().unwrap().cloud_in.push_back(bytes);
        gw.session_mut().step();

        prop_assert!(wire.lock().unwrap().serial_out.is_empty());
        prop_assert_eq!(gw.monitor().stats().malformed_cloud_frames, 1);
    }

    #[test]
    fn prop_bit_flip_in_payload_rejected(
        payload in proptest::collection::vec(any::<u8>(), 1..64),
        bit in any::<prop::sample::Index>(),
    ) {
        let (mut gw, wire, _) = gateway();
        connect(&mut gw);

        let mut bytes = cloud_data_frame(1, &payload);
        // Flip a bit in the payload or CRC; header corruption is covered above
        let body_bits = (bytes.len() - 20) * 8;
        let bit = 20 * 8 + bit.index(body_bits);
        bytes[bit / 8] ^= 1 << (bit % 8);
        wire.lock().unwrap().cloud_in.push_back(bytes);
        gw.session_mut().step();

        prop_assert!(wire.lock().unwrap().serial_out.is_empty());
    }
}
