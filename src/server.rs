//! Local client server.
//!
//! Devices on the LAN side may connect over plain TCP and speak the same
//! application frames as the cloud. Each client gets its own frame channel,
//! sequence counter and router onto the shared RS485 channel, so it can drive
//! the bus and read or change parameters. Uplink traffic from the bus still
//! goes to the cloud only.
//!
//! At most `max_clients` connections are served; any further connection is
//! closed as soon as it has been accepted.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, trace, warn};

use crate::bridge::{self, BridgeRouter, RouterStats};
use crate::channel::{CloudChannel, DataChannel, FrameSink};
use crate::clock::Clock;
use crate::config::{ParamStore, ServerSettings};
use crate::error::{alloc_buffer, ResourceError, TransportError};
use crate::frame::SequenceCounter;
use crate::transport::{is_idle, CloudStream};

/// Source of client connections.
pub trait ClientListener: Send {
    type Stream: CloudStream + 'static;

    /// Blocks until a client connects. Returns the stream and a printable
    /// peer address.
    fn accept(&mut self) -> io::Result<(Self::Stream, String)>;
}

/// Listening TCP socket on all interfaces.
#[derive(Debug)]
pub struct TcpClientListener {
    listener: TcpListener,
    read_timeout: Duration,
}

impl TcpClientListener {
    /// Port 0 picks a free port, see [`local_addr`](Self::local_addr).
    pub fn bind(port: u16, read_timeout: Duration) -> io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        info!("TCP server listening on port {}", listener.local_addr()?.port());
        Ok(Self { listener, read_timeout })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl ClientListener for TcpClientListener {
    type Stream = TcpStream;

    fn accept(&mut self) -> io::Result<(TcpStream, String)> {
        let (stream, peer) = self.listener.accept()?;
        stream.set_read_timeout(Some(self.read_timeout))?;
        stream.set_nodelay(true)?;
        Ok((stream, peer.to_string()))
    }
}

/// Plain TCP, as used by local clients.
impl CloudStream for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        Write::write_all(self, buf)
    }

    fn shutdown(&mut self) {
        let _ = TcpStream::shutdown(self, Shutdown::Both);
    }
}

/// Snapshot of server counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ServerStats {
    pub accepted: u64,
    pub rejected: u64,
    pub accept_errors: u64,
    pub active: usize,
}

#[derive(Debug, Default)]
struct Shared {
    active: AtomicUsize,
    accepted: AtomicU64,
    rejected: AtomicU64,
    accept_errors: AtomicU64,
}

impl Shared {
    fn snapshot(&self) -> ServerStats {
        ServerStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            accept_errors: self.accept_errors.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Acquire),
        }
    }
}

/// Thread-safe view of a running server.
#[derive(Debug, Clone)]
pub struct ServerMonitor {
    shared: Arc<Shared>,
}

impl ServerMonitor {
    pub fn stats(&self) -> ServerStats {
        self.shared.snapshot()
    }
}

/// Stream of one client, shared by its reader and the channel's send path.
struct ClientLink {
    stream: Mutex<Option<Box<dyn CloudStream>>>,
    open: AtomicBool,
}

impl ClientLink {
    fn new() -> Self {
        Self { stream: Mutex::new(None), open: AtomicBool::new(false) }
    }

    fn install(&self, stream: Box<dyn CloudStream>) {
        if let Ok(mut guard) = self.stream.lock() {
            *guard = Some(stream);
            self.open.store(true, Ordering::Release);
        }
    }

    /// The lock is held only for the read itself, so replies sent while the
    /// received bytes are processed do not wait on it.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut guard = self.stream.lock().map_err(|_| io::Error::other("client stream lock poisoned"))?;
        match guard.as_mut() {
            Some(stream) => stream.read(buf),
            None => Ok(0),
        }
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
        if let Some(mut stream) = self.stream.lock().ok().and_then(|mut s| s.take()) {
            stream.shutdown();
        }
    }
}

impl FrameSink for ClientLink {
    fn send_frame(&self, frame: &[u8]) -> Result<(), TransportError> {
        if !self.is_ready() {
            return Err(TransportError::NotReady);
        }
        let mut guard = self.stream.lock().map_err(|_| TransportError::NotReady)?;
        let stream = guard.as_mut().ok_or(TransportError::NotReady)?;

        stream.write_all(frame).map_err(|e| {
            self.open.store(false, Ordering::Release);
            TransportError::Io(e)
        })
    }

    fn is_ready(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

/// One connected client and its receive loop.
///
/// Dropping it closes the connection and frees the slot.
pub struct ClientSession {
    name: String,
    link: Arc<ClientLink>,
    channel: Arc<CloudChannel>,
    router: Arc<BridgeRouter>,
    rx_buf: Vec<u8>,
    shared: Arc<Shared>,
}

impl ClientSession {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn router_stats(&self) -> RouterStats {
        self.router.stats()
    }

    pub fn malformed_frames(&self) -> u64 {
        self.channel.malformed_frames()
    }

    /// Reads once and processes what arrived. Returns `false` once the client
    /// is gone.
    pub fn poll(&mut self) -> bool {
        if !self.link.is_ready() {
            return false;
        }

        match self.link.read(&mut self.rx_buf) {
            Ok(0) => {
                info!("[{}] Connection closed by client", self.name);
                false
            }
            Ok(n) => {
                trace!("[{}] RX {} bytes: {:02X?}", self.name, n, &self.rx_buf[..n]);
                self.channel.receive(&self.rx_buf[..n]);
                true
            }
            Err(e) if is_idle(&e) => true,
            Err(e) => {
                warn!("[{}] Receive error: {}", self.name, e);
                false
            }
        }
    }

    /// Serves the client until it disconnects.
    pub fn run(mut self) {
        info!("[{}] Client receive task started", self.name);
        while self.poll() {}
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.link.close();
        self.channel.detach();
        self.channel.reset();
        self.shared.active.fetch_sub(1, Ordering::AcqRel);
        info!("[{}] Client receive task ended", self.name);
    }
}

/// Accept loop of the local server.
pub struct LocalServer<L: ClientListener> {
    listener: L,
    serial: Arc<dyn DataChannel>,
    params: Option<Arc<dyn ParamStore>>,
    clock: Arc<dyn Clock>,
    settings: ServerSettings,
    shared: Arc<Shared>,
    next_id: usize,
}

impl<L: ClientListener + 'static> LocalServer<L> {
    pub fn new(listener: L, serial: Arc<dyn DataChannel>, clock: Arc<dyn Clock>, settings: ServerSettings) -> Self {
        Self {
            listener,
            serial,
            params: None,
            clock,
            settings,
            shared: Arc::new(Shared::default()),
            next_id: 0,
        }
    }

    /// Store that answers client GetParam and SetParam requests.
    pub fn with_params(mut self, params: Arc<dyn ParamStore>) -> Self {
        self.params = Some(params);
        self
    }

    pub fn monitor(&self) -> ServerMonitor {
        ServerMonitor { shared: Arc::clone(&self.shared) }
    }

    /// Waits for one connection.
    ///
    /// Returns `Ok(None)` when the connection was accepted and immediately
    /// closed, either because every slot is taken or because its buffers
    /// could not be allocated.
    pub fn accept(&mut self) -> io::Result<Option<ClientSession>> {
        let (mut stream, peer) = self.listener.accept()?;
        info!("New client connected from {}", peer);

        if self.shared.active.load(Ordering::Acquire) >= self.settings.max_clients {
            self.shared.rejected.fetch_add(1, Ordering::Relaxed);
            warn!("No available client slots, closing connection from {}", peer);
            stream.shutdown();
            return Ok(None);
        }

        let name = format!("client.{}", self.next_id);
        self.next_id += 1;

        let link = Arc::new(ClientLink::new());
        match self.open_session(name, Arc::clone(&link)) {
            Ok(session) => {
                link.install(Box::new(stream));
                self.shared.accepted.fetch_add(1, Ordering::Relaxed);
                Ok(Some(session))
            }
            Err(e) => {
                error!("Dropping client {}: {}", peer, e);
                stream.shutdown();
                Ok(None)
            }
        }
    }

    /// Builds everything a client needs before its stream is handed over.
    fn open_session(&mut self, name: String, link: Arc<ClientLink>) -> Result<ClientSession, ResourceError> {
        let rx_buf = alloc_buffer("client receive buffer", self.settings.rx_buffer_size)?;
        let channel = Arc::new(CloudChannel::over(link.clone(), Arc::new(SequenceCounter::new()))?);

        let frames: Arc<dyn DataChannel> = channel.clone();
        let mut router = BridgeRouter::new(frames, Arc::clone(&self.serial));
        if let Some(params) = &self.params {
            router = router.with_params(Arc::clone(params));
        }
        let router = Arc::new(router);
        bridge::wire_frames(&router, &channel);

        self.shared.active.fetch_add(1, Ordering::AcqRel);
        debug!("[{}] Slot taken, {} active", name, self.shared.active.load(Ordering::Acquire));

        Ok(ClientSession { name, link, channel, router, rx_buf, shared: Arc::clone(&self.shared) })
    }

    /// Accepts clients forever, one receive thread each.
    pub fn run(&mut self, stack_size: usize) -> ! {
        info!("TCP server task started");
        loop {
            match self.accept() {
                Ok(Some(client)) => {
                    let spawned = thread::Builder::new()
                        .name(client.name().to_string())
                        .stack_size(stack_size)
                        .spawn(move || client.run());
                    if let Err(e) = spawned {
                        error!("Failed to create client receive task: {}", e);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    self.shared.accept_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("Failed to accept connection: {}", e);
                    self.clock.sleep(self.settings.accept_retry);
                }
            }
        }
    }

    /// Moves the accept loop onto its own thread.
    pub fn spawn(mut self, stack_size: usize) -> io::Result<(ServerMonitor, JoinHandle<()>)> {
        let monitor = self.monitor();
        let handle = thread::Builder::new()
            .name("tcp_server".into())
            .stack_size(stack_size)
            .spawn(move || {
                self.run(stack_size);
            })?;
        Ok((monitor, handle))
    }
}
