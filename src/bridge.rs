//! Bridge router: translation between RS485 frames and cloud frames.
//!
//! Uplink (RS485 -> cloud): the Modbus address, function code and CRC are
//! stripped and the remaining bytes travel as a DataTransmission payload.
//!
//! Downlink (cloud -> RS485): a DataTransmission payload is framed as a
//! Modbus request to unit 0x01 with function 0x03. The application frame
//! does not carry the original Modbus address or function code, so the fixed
//! pair is used for every downlink frame.
//!
//! Nothing is queued: while the cloud session is not ready, frames in either
//! direction are dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, info, warn};

use crate::channel::{CloudChannel, DataChannel, Rs485Channel};
use crate::config::{ConfigSource, ParamId, ParamKind, ParamStore};
use crate::error::ConfigError;
use crate::frame::{AppFrame, AppFunction, GetParamFrame, SetParamFrame};
use crate::modbus::{ModbusFunction, RtuFrame};
use crate::rs485::SerialTx;

/// Largest uplink payload forwarded to the cloud.
pub const MAX_UPLINK_PAYLOAD: usize = 499;

/// Unit address of every downlink Modbus frame.
pub const DOWNLINK_ADDRESS: u8 = 0x01;

/// Function code used for every downlink Modbus frame.
pub const DOWNLINK_FUNCTION: ModbusFunction = ModbusFunction::ReadHoldingRegisters;

/// Most parameters answered for a single GetParam range.
const MAX_PARAMS_PER_REQUEST: u16 = 16;

/// Snapshot of router counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RouterStats {
    pub uplink_frames: u64,
    pub uplink_bytes: u64,
    pub downlink_frames: u64,
    pub downlink_bytes: u64,
    pub dropped_not_ready: u64,
    pub dropped_bad_size: u64,
    pub send_errors: u64,
    pub heartbeats_received: u64,
    pub param_requests: u64,
    pub param_errors: u64,
}

#[derive(Debug, Default)]
struct RouterCounters {
    uplink_frames: AtomicU64,
    uplink_bytes: AtomicU64,
    downlink_frames: AtomicU64,
    downlink_bytes: AtomicU64,
    dropped_not_ready: AtomicU64,
    dropped_bad_size: AtomicU64,
    send_errors: AtomicU64,
    heartbeats_received: AtomicU64,
    param_requests: AtomicU64,
    param_errors: AtomicU64,
}

fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn add(counter: &AtomicU64, n: usize) {
    counter.fetch_add(n as u64, Ordering::Relaxed);
}

/// Routes frames between the cloud and serial channels.
pub struct BridgeRouter {
    cloud: Arc<dyn DataChannel>,
    serial: Arc<dyn DataChannel>,
    params: Option<Arc<dyn ParamStore>>,
    counters: RouterCounters,
}

impl BridgeRouter {
    pub fn new(cloud: Arc<dyn DataChannel>, serial: Arc<dyn DataChannel>) -> Self {
        Self {
            cloud,
            serial,
            params: None,
            counters: RouterCounters::default(),
        }
    }

    /// Store that answers GetParam and applies SetParam requests.
    pub fn with_params(mut self, params: Arc<dyn ParamStore>) -> Self {
        self.params = Some(params);
        self
    }

    pub fn stats(&self) -> RouterStats {
        let c = &self.counters;
        let get = |a: &AtomicU64| a.load(Ordering::Relaxed);
        RouterStats {
            uplink_frames: get(&c.uplink_frames),
            uplink_bytes: get(&c.uplink_bytes),
            downlink_frames: get(&c.downlink_frames),
            downlink_bytes: get(&c.downlink_bytes),
            dropped_not_ready: get(&c.dropped_not_ready),
            dropped_bad_size: get(&c.dropped_bad_size),
            send_errors: get(&c.send_errors),
            heartbeats_received: get(&c.heartbeats_received),
            param_requests: get(&c.param_requests),
            param_errors: get(&c.param_errors),
        }
    }

    /// RS485 -> cloud.
    pub fn on_serial_frame(&self, frame: RtuFrame<'_>) {
        if !self.cloud.is_open() {
            inc(&self.counters.dropped_not_ready);
            debug!("Cloud not ready, dropping RS485 frame (fc 0x{:02X})", frame.function());
            return;
        }

        let payload = frame.data();
        if payload.is_empty() || payload.len() > MAX_UPLINK_PAYLOAD {
            inc(&self.counters.dropped_bad_size);
            warn!("RS485 payload of {} bytes not forwarded", payload.len());
            return;
        }

        match self.cloud.send(AppFunction::DataTransmission.code(), payload) {
            Ok(()) => {
                inc(&self.counters.uplink_frames);
                add(&self.counters.uplink_bytes, payload.len());
                debug!("Forwarded {} bytes from RS485 to cloud", payload.len());
            }
            Err(e) => {
                inc(&self.counters.send_errors);
                warn!("Failed to forward RS485 frame to cloud: {}", e);
            }
        }
    }

    /// Cloud -> RS485 (and parameter requests).
    pub fn on_cloud_frame(&self, frame: AppFrame<'_>) {
        if !self.cloud.is_open() {
            inc(&self.counters.dropped_not_ready);
            debug!("Cloud not ready, dropping {} frame", frame.function().name());
            return;
        }

        match frame {
            AppFrame::Data(data) => self.forward_downlink(data.payload),
            AppFrame::Heartbeat(header) => {
                inc(&self.counters.heartbeats_received);
                debug!("Heartbeat from server (seq {})", header.sequence());
            }
            AppFrame::GetParam(request) => self.answer_get_param(&request),
            AppFrame::SetParam(request) => self.apply_set_param(&request),
        }
    }

    fn forward_downlink(&self, payload: &[u8]) {
        if payload.is_empty() {
            inc(&self.counters.dropped_bad_size);
            debug!("Empty data frame from cloud, nothing to forward");
            return;
        }

        match self.serial.send(DOWNLINK_FUNCTION.code(), payload) {
            Ok(()) => {
                inc(&self.counters.downlink_frames);
                add(&self.counters.downlink_bytes, payload.len());
                debug!("Forwarded {} bytes from cloud to RS485", payload.len());
            }
            Err(e) => {
                inc(&self.counters.send_errors);
                warn!("Failed to send frame to RS485: {}", e);
            }
        }
    }

    fn answer_get_param(&self, request: &GetParamFrame<'_>) {
        inc(&self.counters.param_requests);
        let Some(store) = &self.params else {
            debug!("No parameter store, ignoring GetParam {}", request.param_id);
            return;
        };

        let first = request.param_id;
        let last = request.end_param.max(first).min(first.saturating_add(MAX_PARAMS_PER_REQUEST - 1));

        for raw_id in first..=last {
            let Some(id) = ParamId::from_u16(raw_id) else {
                debug!("GetParam for unknown parameter {}", raw_id);
                continue;
            };

            let value = read_param(store.as_ref(), id);
            let mut payload = Vec::with_capacity(4 + value.len());
            payload.extend_from_slice(&raw_id.to_le_bytes());
            payload.extend_from_slice(&raw_id.to_le_bytes());
            payload.extend_from_slice(value.as_bytes());

            if let Err(e) = self.cloud.send(AppFunction::GetParam.code(), &payload) {
                inc(&self.counters.send_errors);
                warn!("Failed to answer GetParam {}: {}", id, e);
            }
        }
    }

    fn apply_set_param(&self, request: &SetParamFrame<'_>) {
        inc(&self.counters.param_requests);
        let Some(store) = &self.params else {
            debug!("No parameter store, ignoring SetParam {}", request.param_id);
            return;
        };

        let result = ParamId::from_u16(request.param_id)
            .ok_or(ConfigError::Missing(request.param_id))
            .and_then(|id| write_param(store.as_ref(), id, request.value).map(|_| id));

        match result {
            Ok(id) => {
                info!("Parameter {} updated by server", id);
                let mut ack = Vec::with_capacity(2 + request.value.len());
                ack.extend_from_slice(&request.param_id.to_le_bytes());
                ack.extend_from_slice(request.value);
                if let Err(e) = self.cloud.send(AppFunction::SetParam.code(), &ack) {
                    inc(&self.counters.send_errors);
                    warn!("Failed to acknowledge SetParam: {}", e);
                }
            }
            Err(e) => {
                inc(&self.counters.param_errors);
                warn!("Rejected SetParam {}: {}", request.param_id, e);
            }
        }
    }
}

/// Current value as text, or the parameter's default when unset.
fn read_param(store: &dyn ParamStore, id: ParamId) -> String {
    match store.get_string(id) {
        Ok(value) => value,
        Err(_) => match id.spec().kind {
            ParamKind::Text { default, .. } => default.to_string(),
            ParamKind::Int { default, .. } => default.to_string(),
        },
    }
}

/// Values arrive as text; trailing NULs are ignored.
fn write_param(store: &dyn ParamStore, id: ParamId, raw: &[u8]) -> Result<(), ConfigError> {
    let invalid = || ConfigError::Invalid { id: id.code(), value: String::from_utf8_lossy(raw).into_owned() };
    let text = std::str::from_utf8(raw).map_err(|_| invalid())?.trim_end_matches('\0');

    match id.spec().kind {
        ParamKind::Text { .. } => store.set_string(id, text),
        ParamKind::Int { .. } => {
            let value = text.trim().parse::<i32>().map_err(|_| invalid())?;
            store.set_int(id, value)
        }
    }
}

/// Attaches `router` as the receive handler of both channels.
///
/// Handlers hold only a weak reference, so dropping the router detaches it.
pub fn wire<T: SerialTx + 'static>(router: &Arc<BridgeRouter>, cloud: &CloudChannel, serial: &Rs485Channel<T>) {
    wire_frames(router, cloud);

    let weak: Weak<BridgeRouter> = Arc::downgrade(router);
    serial.attach(Box::new(move |frame| {
        if let Some(router) = weak.upgrade() {
            router.on_serial_frame(frame);
        }
    }));
}

/// Attaches `router` to an application frame channel only. Local clients
/// are wired this way: they reach the bus but never receive its uplink.
pub fn wire_frames(router: &Arc<BridgeRouter>, channel: &CloudChannel) {
    let weak: Weak<BridgeRouter> = Arc::downgrade(router);
    channel.attach(Box::new(move |frame| {
        if let Some(router) = weak.upgrade() {
            router.on_cloud_frame(frame);
        }
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryParams;
    use crate::error::ChannelError;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockChannel {
        open: AtomicBool,
        sent: Mutex<Vec<(u8, Vec<u8>)>>,
    }

    impl MockChannel {
        fn open() -> Arc<Self> {
            let ch = Self::default();
            ch.open.store(true, Ordering::SeqCst);
            Arc::new(ch)
        }

        fn sent(&self) -> Vec<(u8, Vec<u8>)> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl DataChannel for MockChannel {
        fn send(&self, function: u8, payload: &[u8]) -> Result<(), ChannelError> {
            self.sent.lock().unwrap().push((function, payload.to_vec()));
            Ok(())
        }

        fn receive(&self, _bytes: &[u8]) {}

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
    }

    fn frame_from(seq: &crate::frame::SequenceCounter, build: impl Fn(&crate::frame::FrameEncoder<'_>, &mut [u8]) -> usize) -> Vec<u8> {
        let mut buf = [0u8; 128];
        let n = build(&crate::frame::FrameEncoder::new(seq), &mut buf);
        buf[..n].to_vec()
    }

    #[test]
    fn test_uplink_strips_modbus_envelope() {
        let cloud = MockChannel::open();
        let serial = MockChannel::open();
        let router = BridgeRouter::new(cloud.clone(), serial.clone());

        let raw = [0x05, 0x04, 0x01, 0x02, 0xC1, 0x78];
        router.on_serial_frame(RtuFrame::parse(&raw).unwrap());

        assert_eq!(cloud.sent(), vec![(0xC2, vec![0x01, 0x02])]);
        assert_eq!(router.stats().uplink_frames, 1);
        assert_eq!(router.stats().uplink_bytes, 2);
    }

    #[test]
    fn test_uplink_size_limits() {
        let cloud = MockChannel::open();
        let router = BridgeRouter::new(cloud.clone(), MockChannel::open());

        let mut buf = [0u8; 512];
        let n = crate::modbus::build_frame(&mut buf, 0x01, 0x03, &[]).unwrap();
        router.on_serial_frame(RtuFrame::parse(&buf[..n]).unwrap());

        let n = crate::modbus::build_frame(&mut buf, 0x01, 0x03, &[0x11; 500]).unwrap();
        router.on_serial_frame(RtuFrame::parse(&buf[..n]).unwrap());

        let n = crate::modbus::build_frame(&mut buf, 0x01, 0x03, &[0x11; 499]).unwrap();
        router.on_serial_frame(RtuFrame::parse(&buf[..n]).unwrap());

        assert_eq!(cloud.sent().len(), 1);
        assert_eq!(router.stats().dropped_bad_size, 2);
    }

    #[test]
    fn test_downlink_uses_fixed_function() {
        let cloud = MockChannel::open();
        let serial = MockChannel::open();
        let router = BridgeRouter::new(cloud.clone(), serial.clone());

        let seq = crate::frame::SequenceCounter::new();
        let bytes = frame_from(&seq, |enc, buf| enc.data(buf, &[0xAA, 0xBB]).unwrap());
        router.on_cloud_frame(crate::frame::parse(&bytes).unwrap());

        assert_eq!(serial.sent(), vec![(0x03, vec![0xAA, 0xBB])]);
        assert!(cloud.sent().is_empty());
    }

    #[test]
    fn test_not_ready_drops_both_directions() {
        let cloud = Arc::new(MockChannel::default());
        let serial = MockChannel::open();
        let router = BridgeRouter::new(cloud.clone(), serial.clone());

        let raw = [0x05, 0x04, 0x01, 0x02, 0xC1, 0x78];
        router.on_serial_frame(RtuFrame::parse(&raw).unwrap());

        let seq = crate::frame::SequenceCounter::new();
        let bytes = frame_from(&seq, |enc, buf| enc.data(buf, &[0xAA]).unwrap());
        router.on_cloud_frame(crate::frame::parse(&bytes).unwrap());

        assert!(cloud.sent().is_empty());
        assert!(serial.sent().is_empty());
        assert_eq!(router.stats().dropped_not_ready, 2);
    }

    #[test]
    fn test_set_param_updates_store_and_acks() {
        let cloud = MockChannel::open();
        let params = Arc::new(MemoryParams::new());
        let router = BridgeRouter::new(cloud.clone(), MockChannel::open()).with_params(params.clone());

        let seq = crate::frame::SequenceCounter::new();
        let bytes = frame_from(&seq, |enc, buf| enc.set_param(buf, 8, b"2500").unwrap());
        router.on_cloud_frame(crate::frame::parse(&bytes).unwrap());

        assert_eq!(params.get_int(ParamId::QueryPeriod), Ok(2500));
        assert_eq!(cloud.sent(), vec![(0xC4, vec![0x08, 0x00, b'2', b'5', b'0', b'0'])]);
    }

    #[test]
    fn test_set_param_rejects_invalid() {
        let cloud = MockChannel::open();
        let params = Arc::new(MemoryParams::new());
        let router = BridgeRouter::new(cloud.clone(), MockChannel::open()).with_params(params.clone());

        let seq = crate::frame::SequenceCounter::new();
        for (id, value) in [(8u16, &b"abc"[..]), (8, &b"5"[..]), (4, &b"1"[..])] {
            let bytes = frame_from(&seq, |enc, buf| enc.set_param(buf, id, value).unwrap());
            router.on_cloud_frame(crate::frame::parse(&bytes).unwrap());
        }

        assert!(cloud.sent().is_empty());
        assert_eq!(router.stats().param_errors, 3);
        assert!(params.get_int(ParamId::QueryPeriod).is_err());
    }

    #[test]
    fn test_get_param_range() {
        let cloud = MockChannel::open();
        let params = Arc::new(MemoryParams::new());
        params.set_string(ParamId::ServerHost, "cloud.example.net").unwrap();
        let router = BridgeRouter::new(cloud.clone(), MockChannel::open()).with_params(params);

        let seq = crate::frame::SequenceCounter::new();
        let bytes = frame_from(&seq, |enc, buf| enc.get_param(buf, 5, 6, &[]).unwrap());
        router.on_cloud_frame(crate::frame::parse(&bytes).unwrap());

        let sent = cloud.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, 0xC3);
        assert_eq!(&sent[0].1[..4], &[0x05, 0x00, 0x05, 0x00]);
        assert_eq!(&sent[0].1[4..], b"cloud.example.net");
        assert_eq!(&sent[1].1[4..], b"4348");
    }

    #[test]
    fn test_heartbeat_from_server_is_counted() {
        let cloud = MockChannel::open();
        let serial = MockChannel::open();
        let router = BridgeRouter::new(cloud.clone(), serial.clone());

        let seq = crate::frame::SequenceCounter::new();
        let bytes = frame_from(&seq, |enc, buf| enc.heartbeat(buf).unwrap());
        router.on_cloud_frame(crate::frame::parse(&bytes).unwrap());

        assert_eq!(router.stats().heartbeats_received, 1);
        assert!(cloud.sent().is_empty());
        assert!(serial.sent().is_empty());
    }
}
