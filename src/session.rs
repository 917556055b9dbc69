//! Cloud session: TCP + TLS-PSK client with reconnect and heartbeat.
//!
//! The session walks a strict chain of states:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> TlsHandshake -> Ready
//!       ^______________________________________________________|
//!                   (any state, on any failure)
//! ```
//!
//! [`CloudSession::step`] performs exactly one transition (or one unit of work
//! in `Ready`) so the machine can be driven deterministically in tests;
//! [`CloudSession::run`] loops it forever on the cloud worker thread.
//!
//! The [`SessionHandle`] half is shared with the other worker so it can send
//! frames while the session owns the read side.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};

use crate::channel::{DataChannel, FrameSink};
use crate::clock::Clock;
use crate::config::{CloudTarget, ConfigSource, SessionSettings};
use crate::error::{alloc_buffer, ResourceError, TransportError};
use crate::frame::{FrameEncoder, SequenceCounter, HEARTBEAT_LEN};
use crate::psk::TlsPskParams;
use crate::transport::{is_idle, CloudConnector, CloudStream};

/// Connection state of the cloud link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum SessionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    TlsHandshake = 3,
    Ready = 4,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::TlsHandshake,
            4 => Self::Ready,
            _ => Self::Disconnected,
        }
    }

    /// Next state on the success path.
    pub fn successor(self) -> Option<Self> {
        match self {
            Self::Disconnected => Some(Self::Connecting),
            Self::Connecting => Some(Self::Connected),
            Self::Connected => Some(Self::TlsHandshake),
            Self::TlsHandshake => Some(Self::Ready),
            Self::Ready => None,
        }
    }

    /// Every state may fall back to `Disconnected`; otherwise only the
    /// success-path edge is legal.
    pub fn can_transition_to(self, next: Self) -> bool {
        next == Self::Disconnected || self.successor() == Some(next)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::TlsHandshake => "TlsHandshake",
            Self::Ready => "Ready",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Snapshot of session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionStats {
    pub connect_attempts: u64,
    pub connect_failures: u64,
    pub handshake_failures: u64,
    pub sessions_established: u64,
    pub teardowns: u64,
    pub heartbeats_sent: u64,
    pub frames_sent: u64,
    pub send_failures: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[derive(Debug, Default)]
struct Counters {
    connect_attempts: AtomicU64,
    connect_failures: AtomicU64,
    handshake_failures: AtomicU64,
    sessions_established: AtomicU64,
    teardowns: AtomicU64,
    heartbeats_sent: AtomicU64,
    frames_sent: AtomicU64,
    send_failures: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

/// Shared half of the session: state, stream and send path.
pub struct SessionHandle {
    state: AtomicU8,
    stream: Mutex<Option<Box<dyn CloudStream>>>,
    last_send: Mutex<Option<Instant>>,
    /// Set when a send fails; the session worker tears down on its next step.
    fault: AtomicBool,
    clock: Arc<dyn Clock>,
    counters: Counters,
}

impl SessionHandle {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: AtomicU8::new(SessionState::Disconnected as u8),
            stream: Mutex::new(None),
            last_send: Mutex::new(None),
            fault: AtomicBool::new(false),
            clock,
            counters: Counters::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// Writes one complete frame to the cloud.
    ///
    /// Any successful send counts as link activity and pushes the heartbeat
    /// deadline out. A failed write marks the session faulty.
    pub fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        if !self.is_ready() {
            return Err(TransportError::NotReady);
        }

        let mut guard = self.stream.lock().map_err(|_| TransportError::NotReady)?;
        let stream = guard.as_mut().ok_or(TransportError::NotReady)?;

        if let Err(e) = stream.write_all(frame) {
            bump(&self.counters.send_failures, 1);
            self.fault.store(true, Ordering::Release);
            return Err(TransportError::Io(e));
        }
        drop(guard);

        trace!("Cloud TX {} bytes: {:02X?}", frame.len(), frame);
        bump(&self.counters.frames_sent, 1);
        bump(&self.counters.bytes_sent, frame.len() as u64);
        self.mark_sent();
        Ok(())
    }

    /// Time since the last successful send, if any.
    pub fn since_last_send(&self) -> Option<Duration> {
        let last = (*self.last_send.lock().ok()?)?;
        Some(self.clock.now().saturating_duration_since(last))
    }

    pub fn stats(&self) -> SessionStats {
        let c = &self.counters;
        let get = |a: &AtomicU64| a.load(Ordering::Relaxed);
        SessionStats {
            connect_attempts: get(&c.connect_attempts),
            connect_failures: get(&c.connect_failures),
            handshake_failures: get(&c.handshake_failures),
            sessions_established: get(&c.sessions_established),
            teardowns: get(&c.teardowns),
            heartbeats_sent: get(&c.heartbeats_sent),
            frames_sent: get(&c.frames_sent),
            send_failures: get(&c.send_failures),
            bytes_sent: get(&c.bytes_sent),
            bytes_received: get(&c.bytes_received),
        }
    }

    pub fn reset_stats(&self) {
        let c = &self.counters;
        for counter in [
            &c.connect_attempts,
            &c.connect_failures,
            &c.handshake_failures,
            &c.sessions_established,
            &c.teardowns,
            &c.heartbeats_sent,
            &c.frames_sent,
            &c.send_failures,
            &c.bytes_sent,
            &c.bytes_received,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    fn mark_sent(&self) {
        if let Ok(mut last) = self.last_send.lock() {
            *last = Some(self.clock.now());
        }
    }

    /// Moves to `next` if the edge is legal. Illegal edges are refused.
    fn set_state(&self, next: SessionState) -> bool {
        let current = self.state();
        if current == next {
            return true;
        }
        if !current.can_transition_to(next) {
            error!("Refusing illegal session transition {} -> {}", current, next);
            return false;
        }
        self.state.store(next as u8, Ordering::Release);
        debug!("Cloud session: {} -> {}", current, next);
        true
    }

    fn install(&self, stream: Box<dyn CloudStream>) {
        if let Ok(mut guard) = self.stream.lock() {
            *guard = Some(stream);
        }
        self.fault.store(false, Ordering::Release);
        self.mark_sent();
    }

    fn take_stream(&self) -> Option<Box<dyn CloudStream>> {
        self.stream.lock().ok()?.take()
    }

    fn faulted(&self) -> bool {
        self.fault.load(Ordering::Acquire)
    }
}

impl FrameSink for SessionHandle {
    fn send_frame(&self, frame: &[u8]) -> Result<(), TransportError> {
        self.send(frame)
    }

    fn is_ready(&self) -> bool {
        SessionHandle::is_ready(self)
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("state", &self.state())
            .field("fault", &self.faulted())
            .finish()
    }
}

/// Outcome of reading the stream once.
enum ReadOutcome {
    Data(usize),
    Idle,
    Closed,
    Failed(TransportError),
}

/// Owner of the connection lifecycle, run on the cloud worker.
pub struct CloudSession<C: CloudConnector> {
    connector: C,
    handle: Arc<SessionHandle>,
    config: Arc<dyn ConfigSource>,
    seq: Arc<SequenceCounter>,
    clock: Arc<dyn Clock>,
    settings: SessionSettings,
    inbound: Option<Arc<dyn DataChannel>>,

    target: Option<CloudTarget>,
    tcp: Option<C::Tcp>,
    psk: Option<TlsPskParams>,
    retry_at: Option<Instant>,
    rx_buf: Vec<u8>,
}

impl<C: CloudConnector> CloudSession<C> {
    pub fn new(
        connector: C,
        handle: Arc<SessionHandle>,
        config: Arc<dyn ConfigSource>,
        seq: Arc<SequenceCounter>,
        clock: Arc<dyn Clock>,
        settings: SessionSettings,
    ) -> Result<Self, ResourceError> {
        let rx_buf = alloc_buffer("cloud receive buffer", settings.rx_buffer_size)?;
        Ok(Self {
            connector,
            handle,
            config,
            seq,
            clock,
            settings,
            inbound: None,
            target: None,
            tcp: None,
            psk: None,
            retry_at: None,
            rx_buf,
        })
    }

    /// Channel that receives every chunk read from the cloud. It is reset
    /// whenever an established session is torn down.
    pub fn set_inbound(&mut self, channel: Arc<dyn DataChannel>) {
        self.inbound = Some(channel);
    }

    pub fn handle(&self) -> &Arc<SessionHandle> {
        &self.handle
    }

    pub fn state(&self) -> SessionState {
        self.handle.state()
    }

    /// Target used by the current connection attempt.
    pub fn target(&self) -> Option<&CloudTarget> {
        self.target.as_ref()
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Runs the state machine forever.
    pub fn run(&mut self) -> ! {
        info!("Cloud session worker started");
        loop {
            self.step();
        }
    }

    /// Performs one transition or one unit of `Ready` work, returning the
    /// resulting state.
    pub fn step(&mut self) -> SessionState {
        match self.handle.state() {
            SessionState::Disconnected => self.begin_attempt(),
            SessionState::Connecting => self.open_tcp(),
            SessionState::Connected => self.prepare_tls(),
            SessionState::TlsHandshake => self.handshake(),
            SessionState::Ready => self.service(),
        }
        self.handle.state()
    }

    fn begin_attempt(&mut self) {
        if let Some(at) = self.retry_at.take() {
            let now = self.clock.now();
            if at > now {
                debug!("Reconnecting in {} ms", (at - now).as_millis());
                self.clock.sleep(at - now);
            }
        }

        self.target = Some(CloudTarget::resolve(self.config.as_ref()));
        self.handle.set_state(SessionState::Connecting);
    }

    fn open_tcp(&mut self) {
        let Some(target) = self.target.as_ref() else {
            self.fail("no target resolved");
            return;
        };

        bump(&self.handle.counters.connect_attempts, 1);
        info!("Connecting to {}:{}", target.host, target.port);

        match self.connector.connect(&target.host, target.port, self.settings.connect_timeout) {
            Ok(tcp) => {
                info!("Connected to server");
                self.tcp = Some(tcp);
                self.handle.set_state(SessionState::Connected);
            }
            Err(e) => {
                bump(&self.handle.counters.connect_failures, 1);
                warn!("Failed to connect: {}", e);
                self.fail("connect failed");
            }
        }
    }

    fn prepare_tls(&mut self) {
        let Some(target) = self.target.as_ref() else {
            self.fail("no target resolved");
            return;
        };

        let timeout_ms = self.settings.connect_timeout.as_millis().min(u32::MAX as u128) as u32;
        self.psk = Some(TlsPskParams::new(&target.identity, &target.serial, timeout_ms));
        debug!("Derived PSK for device serial {}", target.serial);
        self.handle.set_state(SessionState::TlsHandshake);
    }

    fn handshake(&mut self) {
        let (Some(tcp), Some(psk)) = (self.tcp.take(), self.psk.take()) else {
            self.fail("handshake without connection");
            return;
        };
        let Some(target) = self.target.as_ref() else {
            self.fail("no target resolved");
            return;
        };

        match self.connector.handshake(tcp, &target.host, &psk) {
            Ok(stream) => {
                self.handle.install(Box::new(stream));
                self.handle.set_state(SessionState::Ready);
                bump(&self.handle.counters.sessions_established, 1);
                info!("TLS connection established");
            }
            Err(e) => {
                bump(&self.handle.counters.handshake_failures, 1);
                warn!("TLS handshake failed: {}", e);
                self.fail("handshake failed");
            }
        }
    }

    fn service(&mut self) {
        if self.handle.faulted() {
            self.teardown("send failure");
            return;
        }

        if let Err(e) = self.heartbeat_if_due() {
            warn!("Heartbeat send failed: {}", e);
            self.teardown("heartbeat failure");
            return;
        }

        match self.read_once() {
            ReadOutcome::Data(n) => {
                bump(&self.handle.counters.bytes_received, n as u64);
                trace!("Cloud RX {} bytes: {:02X?}", n, &self.rx_buf[..n]);
                match &self.inbound {
                    Some(channel) => channel.receive(&self.rx_buf[..n]),
                    None => debug!("Dropping {} bytes from cloud, no inbound channel", n),
                }
            }
            ReadOutcome::Idle => self.clock.sleep(self.settings.idle_delay),
            ReadOutcome::Closed => {
                info!("Connection closed by server");
                self.teardown("closed by peer");
            }
            ReadOutcome::Failed(e) => {
                warn!("Receive failed: {}", e);
                self.teardown("receive error");
            }
        }
    }

    fn heartbeat_if_due(&mut self) -> Result<(), TransportError> {
        let due = match self.handle.since_last_send() {
            Some(elapsed) => elapsed >= self.settings.heartbeat_interval,
            None => true,
        };
        if !due {
            return Ok(());
        }

        let mut frame = [0u8; HEARTBEAT_LEN];
        let len = match FrameEncoder::new(&self.seq).heartbeat(&mut frame) {
            Ok(len) => len,
            Err(e) => {
                error!("Failed to build heartbeat frame: {}", e);
                return Ok(());
            }
        };
        self.handle.send(&frame[..len])?;
        bump(&self.handle.counters.heartbeats_sent, 1);
        debug!("Heartbeat sent");
        Ok(())
    }

    /// The stream lock is held only for the read itself.
    fn read_once(&mut self) -> ReadOutcome {
        let result = match self.handle.stream.lock() {
            Ok(mut guard) => match guard.as_mut() {
                Some(stream) => stream.read(&mut self.rx_buf),
                None => return ReadOutcome::Failed(TransportError::NotReady),
            },
            Err(_) => return ReadOutcome::Failed(TransportError::NotReady),
        };

        match result {
            Ok(0) => ReadOutcome::Closed,
            Ok(n) => ReadOutcome::Data(n),
            Err(e) if is_idle(&e) => ReadOutcome::Idle,
            Err(e) => ReadOutcome::Failed(TransportError::Io(e)),
        }
    }

    /// Abandons a connection attempt that never reached `Ready`.
    fn fail(&mut self, reason: &str) {
        debug!("Connection attempt abandoned: {}", reason);
        self.tcp = None;
        self.psk = None;
        self.handle.set_state(SessionState::Disconnected);
        self.schedule_retry();
    }

    /// Closes an established session.
    fn teardown(&mut self, reason: &str) {
        info!("Tearing down cloud session ({})", reason);
        self.handle.set_state(SessionState::Disconnected);
        if let Some(mut stream) = self.handle.take_stream() {
            stream.shutdown();
        }
        if let Some(channel) = &self.inbound {
            channel.reset();
        }
        bump(&self.handle.counters.teardowns, 1);
        self.schedule_retry();
    }

    fn schedule_retry(&mut self) {
        self.retry_at = Some(self.clock.now() + self.settings.reconnect_delay);
    }
}
