//! Local client server tests
//! Clients arrive through an in-memory listener; one test uses real loopback TCP.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use modbus_cloud_bridge::channel::{DataChannel, Rs485Channel};
use modbus_cloud_bridge::clock::ManualClock;
use modbus_cloud_bridge::config::{ConfigSource, MemoryParams, ParamId, ServerSettings};
use modbus_cloud_bridge::error::TransportError;
use modbus_cloud_bridge::frame::{self, AppFrame, FrameEncoder, SequenceCounter};
use modbus_cloud_bridge::rs485::SerialTx;
use modbus_cloud_bridge::server::{ClientListener, LocalServer, TcpClientListener};
use modbus_cloud_bridge::transport::CloudStream;

#[derive(Default)]
struct ClientWire {
    inbound: VecDeque<Vec<u8>>,
    outbound: Vec<Vec<u8>>,
    hung_up: bool,
    shut_down: bool,
}

type SharedClient = Arc<Mutex<ClientWire>>;

struct MockClient(SharedClient);

impl CloudStream for MockClient {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut wire = self.0.lock().unwrap();
        match wire.inbound.pop_front() {
            Some(bytes) => {
                buf[..bytes.len()].copy_from_slice(&bytes);
                Ok(bytes.len())
            }
            None if wire.hung_up => Ok(0),
            None => Err(io::Error::new(io::ErrorKind::TimedOut, "idle")),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.0.lock().unwrap().outbound.push(buf.to_vec());
        Ok(())
    }

    fn shutdown(&mut self) {
        self.0.lock().unwrap().shut_down = true;
    }
}

#[derive(Default)]
struct MockListener {
    pending: Arc<Mutex<VecDeque<SharedClient>>>,
}

impl MockListener {
    fn connect(&self) -> SharedClient {
        let client = SharedClient::default();
        self.pending.lock().unwrap().push_back(Arc::clone(&client));
        client
    }
}

impl ClientListener for MockListener {
    type Stream = MockClient;

    fn accept(&mut self) -> io::Result<(MockClient, String)> {
        match self.pending.lock().unwrap().pop_front() {
            Some(client) => Ok((MockClient(client), "192.168.4.2:50000".into())),
            None => Err(io::ErrorKind::WouldBlock.into()),
        }
    }
}

#[derive(Clone, Default)]
struct BusLog(Arc<Mutex<Vec<Vec<u8>>>>);

impl SerialTx for BusLog {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.0.lock().unwrap().push(bytes.to_vec());
        Ok(())
    }

    fn wait_tx_done(&mut self, _timeout: Duration) -> Result<(), TransportError> {
        Ok(())
    }
}

fn server<L: ClientListener + 'static>(listener: L) -> (LocalServer<L>, BusLog, Arc<MemoryParams>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let bus = BusLog::default();
    let serial: Arc<dyn DataChannel> = Arc::new(Rs485Channel::new(bus.clone(), Duration::from_millis(100)));
    let params = Arc::new(MemoryParams::new());
    let server = LocalServer::new(listener, serial, Arc::new(ManualClock::new()), ServerSettings::default())
        .with_params(params.clone());
    (server, bus, params)
}

fn encode(build: impl FnOnce(&FrameEncoder, &mut [u8]) -> usize) -> Vec<u8> {
    let seq = SequenceCounter::starting_at(1);
    let mut buf = [0u8; frame::MAX_FRAME_LEN];
    let len = build(&FrameEncoder::new(&seq), &mut buf);
    buf[..len].to_vec()
}

#[test]
fn test_set_param_acknowledged_to_client() {
    let listener = MockListener::default();
    let client = listener.connect();
    let (mut server, bus, params) = server(listener);

    let mut session = server.accept().unwrap().expect("slot available");
    client.lock().unwrap().inbound.push_back(encode(|enc, buf| enc.set_param(buf, 8, b"2500").unwrap()));
    assert!(session.poll());

    assert_eq!(params.get_int(ParamId::QueryPeriod), Ok(2500));
    assert!(bus.0.lock().unwrap().is_empty());
    let client = client.lock().unwrap();
    assert_eq!(client.outbound.len(), 1);
    match frame::parse(&client.outbound[0]).unwrap() {
        AppFrame::SetParam(ack) => {
            assert_eq!(ack.param_id, 8);
            assert_eq!(ack.header.sequence(), 1);
        }
        other => panic!("expected SetParam ack, got {:?}", other),
    }
}

#[test]
fn test_client_data_frame_reaches_bus() {
    let listener = MockListener::default();
    let client = listener.connect();
    let (mut server, bus, _) = server(listener);
    let mut session = server.accept().unwrap().unwrap();

    let bytes = encode(|enc, buf| enc.data(buf, &[0x00, 0x6B, 0x00, 0x03]).unwrap());
    client.lock().unwrap().inbound.push_back(bytes[..7].to_vec());
    client.lock().unwrap().inbound.push_back(bytes[7..].to_vec());
    assert!(session.poll());
    assert!(bus.0.lock().unwrap().is_empty());
    assert!(session.poll());

    let bus = bus.0.lock().unwrap();
    assert_eq!(bus.len(), 1);
    assert_eq!(&bus[0][..6], &[0x01, 0x03, 0x00, 0x6B, 0x00, 0x03]);
    assert_eq!(session.router_stats().downlink_frames, 1);
    assert_eq!(session.malformed_frames(), 0);
}

#[test]
fn test_clients_are_isolated() {
    let listener = MockListener::default();
    let first = listener.connect();
    let second = listener.connect();
    let (mut server, _, _) = server(listener);
    let mut a = server.accept().unwrap().unwrap();
    let b = server.accept().unwrap().unwrap();
    assert_ne!(a.name(), b.name());

    first.lock().unwrap().inbound.push_back(encode(|enc, buf| enc.set_param(buf, 8, b"1500").unwrap()));
    a.poll();

    assert_eq!(first.lock().unwrap().outbound.len(), 1);
    assert!(second.lock().unwrap().outbound.is_empty());
}

#[test]
fn test_fifth_client_rejected_until_slot_frees() {
    let listener = MockListener::default();
    let pending = Arc::clone(&listener.pending);
    let (mut server, _, _) = server(listener);
    let monitor = server.monitor();

    let mut sessions = Vec::new();
    for _ in 0..4 {
        pending.lock().unwrap().push_back(SharedClient::default());
        sessions.push(server.accept().unwrap().unwrap());
    }
    assert_eq!(monitor.stats().active, 4);

    let extra = SharedClient::default();
    pending.lock().unwrap().push_back(Arc::clone(&extra));
    assert!(server.accept().unwrap().is_none());
    assert!(extra.lock().unwrap().shut_down);
    assert_eq!(monitor.stats().rejected, 1);

    drop(sessions.pop());
    assert_eq!(monitor.stats().active, 3);

    pending.lock().unwrap().push_back(SharedClient::default());
    let _replacement = server.accept().unwrap().expect("freed slot reused");
    let stats = monitor.stats();
    assert_eq!(stats.accepted, 5);
    assert_eq!(stats.active, 4);
}

#[test]
fn test_hang_up_ends_session() {
    let listener = MockListener::default();
    let client = listener.connect();
    let (mut server, _, _) = server(listener);
    let monitor = server.monitor();

    let mut session = server.accept().unwrap().unwrap();
    assert!(session.poll());
    client.lock().unwrap().hung_up = true;
    assert!(!session.poll());

    session.run();
    assert!(client.lock().unwrap().shut_down);
    assert_eq!(monitor.stats().active, 0);
}

#[test]
fn test_accept_error_passed_to_caller() {
    let (mut server, _, _) = server(MockListener::default());
    assert!(server.accept().is_err());
    assert_eq!(server.monitor().stats().accepted, 0);
}

#[test]
fn test_loopback_client_changes_parameter() {
    let listener = TcpClientListener::bind(0, Duration::from_millis(100)).unwrap();
    let port = listener.local_addr().unwrap().port();
    let (mut server, _, params) = server(listener);

    let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut session = server.accept().unwrap().unwrap();

    Write::write_all(&mut client, &encode(|enc, buf| enc.set_param(buf, 8, b"3000").unwrap())).unwrap();
    for _ in 0..20 {
        assert!(session.poll());
        if params.get_int(ParamId::QueryPeriod) == Ok(3000) {
            break;
        }
    }
    assert_eq!(params.get_int(ParamId::QueryPeriod), Ok(3000));

    let mut ack = [0u8; 64];
    let n = Read::read(&mut client, &mut ack).unwrap();
    assert!(matches!(frame::parse(&ack[..n]), Ok(AppFrame::SetParam(p)) if p.param_id == 8));

    drop(client);
    let mut closed = false;
    for _ in 0..20 {
        if !session.poll() {
            closed = true;
            break;
        }
    }
    assert!(closed);
}
