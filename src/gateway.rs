//! Assembly of the bridge: one cloud worker, one RS485 worker.
//!
//! [`Gateway::new`] wires every component together; [`Gateway::spawn`] moves
//! the two blocking loops onto their own threads and hands back a
//! [`GatewayMonitor`] for statistics. Tests can skip `spawn` and drive the
//! workers step by step through [`Gateway::session_mut`] and
//! [`Gateway::receiver_mut`].
//!
//! [`Gateway::local_server`] builds the optional LAN server on top of the
//! same RS485 channel and parameter store.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::info;

use crate::bridge::{self, BridgeRouter, RouterStats};
use crate::channel::{CloudChannel, DataChannel, Rs485Channel};
use crate::clock::Clock;
use crate::config::{BridgeConfig, ConfigSource, ParamStore, ServerSettings};
use crate::error::ResourceError;
use crate::frame::SequenceCounter;
use crate::server::{ClientListener, LocalServer};
use crate::rs485::{LinkStats, Rs485Receiver, SerialRx, SerialTx};
use crate::session::{CloudSession, SessionHandle, SessionState, SessionStats};
use crate::transport::CloudConnector;

/// Stack size of each worker thread.
pub const WORKER_STACK_SIZE: usize = 8192;

/// Combined counters of every component.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GatewayStats {
    pub session: SessionStats,
    pub link: LinkStats,
    pub router: RouterStats,
    pub malformed_cloud_frames: u64,
}

/// Shared, thread-safe view of a gateway.
pub struct GatewayMonitor<T: SerialTx> {
    session: Arc<SessionHandle>,
    cloud: Arc<CloudChannel>,
    serial: Arc<Rs485Channel<T>>,
    router: Arc<BridgeRouter>,
}

impl<T: SerialTx> Clone for GatewayMonitor<T> {
    fn clone(&self) -> Self {
        Self {
            session: Arc::clone(&self.session),
            cloud: Arc::clone(&self.cloud),
            serial: Arc::clone(&self.serial),
            router: Arc::clone(&self.router),
        }
    }
}

impl<T: SerialTx> GatewayMonitor<T> {
    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            session: self.session.stats(),
            link: self.serial.stats(),
            router: self.router.stats(),
            malformed_cloud_frames: self.cloud.malformed_frames(),
        }
    }

    pub fn reset_stats(&self) {
        self.session.reset_stats();
        self.serial.reset_stats();
    }

    pub fn cloud_channel(&self) -> &Arc<CloudChannel> {
        &self.cloud
    }

    pub fn serial_channel(&self) -> &Arc<Rs485Channel<T>> {
        &self.serial
    }
}

/// Join handles of the two workers. Neither thread returns in normal operation.
#[derive(Debug)]
pub struct Workers {
    pub cloud: JoinHandle<()>,
    pub rs485: JoinHandle<()>,
}

/// A fully wired bridge that has not started yet.
pub struct Gateway<C: CloudConnector, R: SerialRx, T: SerialTx> {
    session: CloudSession<C>,
    receiver: Rs485Receiver<R>,
    monitor: GatewayMonitor<T>,
    params: Arc<dyn ParamStore>,
    clock: Arc<dyn Clock>,
    server: ServerSettings,
    stack_size: usize,
}

impl<C, R, T> Gateway<C, R, T>
where
    C: CloudConnector + 'static,
    R: SerialRx + 'static,
    T: SerialTx + 'static,
{
    /// Builds the sequence counter, session, both channels and the router.
    ///
    /// `params` supplies the cloud target on every connection attempt and
    /// serves GetParam/SetParam requests from the cloud.
    pub fn new<P>(
        config: &BridgeConfig,
        params: Arc<P>,
        clock: Arc<dyn Clock>,
        connector: C,
        serial_rx: R,
        serial_tx: T,
    ) -> Result<Self, ResourceError>
    where
        P: ParamStore + 'static,
    {
        let seq = Arc::new(SequenceCounter::new());
        let handle = Arc::new(SessionHandle::new(Arc::clone(&clock)));

        let cloud = Arc::new(CloudChannel::new(Arc::clone(&handle), Arc::clone(&seq))?);
        let serial = Arc::new(Rs485Channel::new(serial_tx, config.serial.tx_timeout));

        let cloud_dyn: Arc<dyn DataChannel> = cloud.clone();
        let serial_dyn: Arc<dyn DataChannel> = serial.clone();
        let store: Arc<dyn ParamStore> = params.clone();
        let router = Arc::new(
            BridgeRouter::new(Arc::clone(&cloud_dyn), Arc::clone(&serial_dyn)).with_params(Arc::clone(&store)),
        );
        bridge::wire(&router, &cloud, &serial);

        let source: Arc<dyn ConfigSource> = params;
        let mut session =
            CloudSession::new(connector, Arc::clone(&handle), source, seq, Arc::clone(&clock), config.session.clone())?;
        session.set_inbound(cloud_dyn);

        let receiver = Rs485Receiver::new(serial_rx, serial_dyn, &config.serial)?;

        Ok(Self {
            session,
            receiver,
            monitor: GatewayMonitor { session: handle, cloud, serial, router },
            params: store,
            clock,
            server: config.server.clone(),
            stack_size: WORKER_STACK_SIZE,
        })
    }

    /// Overrides [`WORKER_STACK_SIZE`].
    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn monitor(&self) -> GatewayMonitor<T> {
        self.monitor.clone()
    }

    pub fn session_mut(&mut self) -> &mut CloudSession<C> {
        &mut self.session
    }

    pub fn receiver_mut(&mut self) -> &mut Rs485Receiver<R> {
        &mut self.receiver
    }

    /// Local client server sharing this gateway's RS485 channel and
    /// parameter store. Must be built before [`spawn`](Self::spawn).
    pub fn local_server<L: ClientListener + 'static>(&self, listener: L) -> LocalServer<L> {
        let serial: Arc<dyn DataChannel> = self.monitor.serial.clone();
        LocalServer::new(listener, serial, Arc::clone(&self.clock), self.server.clone())
            .with_params(Arc::clone(&self.params))
    }

    /// Starts both workers.
    pub fn spawn(self) -> io::Result<(GatewayMonitor<T>, Workers)> {
        let Self { mut session, mut receiver, monitor, stack_size, .. } = self;

        let cloud = thread::Builder::new()
            .name("cloud".into())
            .stack_size(stack_size)
            .spawn(move || {
                session.run();
            })?;

        let rs485 = thread::Builder::new()
            .name("rs485".into())
            .stack_size(stack_size)
            .spawn(move || {
                receiver.run();
            })?;

        info!("Gateway workers started");
        Ok((monitor, Workers { cloud, rs485 }))
    }
}
