//! RS485 Modbus to Cloud Gateway for ESP32
//!
//! This firmware listens on an RS485 Modbus RTU bus and forwards every valid
//! frame to the cloud over a TLS-PSK connection. Data sent down by the cloud
//! is written back to the bus.
//!
//! ## Production Features
//! - NVS-based parameter persistence
//! - WiFi rejoin whenever the station link drops
//! - Cloud session with heartbeat and fixed-backoff reconnect
//! - Plain TCP server for up to four local clients
//! - Panic handler with automatic restart

use esp_idf_svc::{eventloop::EspSystemEventLoop, hal::prelude::*, nvs::EspDefaultNvsPartition};
use log::{error, info, warn};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use modbus_cloud_bridge::config::{BridgeConfig, ConfigSource, ParamId};
use modbus_cloud_bridge::gateway::WORKER_STACK_SIZE;
use modbus_cloud_bridge::{Gateway, SystemClock, TcpClientListener};

mod config;
mod tls;
mod uart;
mod wifi;

use config::NvsParams;
use tls::PskTlsConnector;
use wifi::StationLink;

fn main() -> anyhow::Result<()> {
    // Initialize ESP-IDF
    esp_idf_svc::sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();

    // Set up panic handler for automatic restart
    std::panic::set_hook(Box::new(|panic_info| {
        error!("PANIC: {}", panic_info);
        error!("Restarting in 3 seconds...");
        thread::sleep(Duration::from_secs(3));
        unsafe { esp_idf_svc::sys::esp_restart(); }
    }));

    info!("RS485 Modbus to Cloud Gateway v{}", modbus_cloud_bridge::VERSION);

    // Get peripherals
    let peripherals = Peripherals::take()?;
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;

    // Parameter store (falls back to defaults for anything not configured)
    let params = Arc::new(NvsParams::open(nvs.clone())?);
    info!("Parameters:");
    params.dump();

    let config = BridgeConfig::load(params.as_ref());
    info!("  Poll period: {} ms", config.poll_period.as_millis());

    let ssid = params.get_string(ParamId::WifiSsid).unwrap_or_default();
    let password = params.get_string(ParamId::WifiPassword).unwrap_or_default();
    let mut link = StationLink::start(peripherals.modem, sys_loop, nvs, &ssid, &password)?;
    link.maintain();

    // RS-485 transceiver: TX=GPIO17, RX=GPIO16, DE/RE driven by RTS on GPIO4
    info!("Initializing RS-485 UART...");
    let (serial_rx, serial_tx) = uart::open(
        peripherals.uart2,
        peripherals.pins.gpio17,
        peripherals.pins.gpio16,
        peripherals.pins.gpio4,
        &config.serial,
    )?;

    let gateway = Gateway::new(
        &config,
        Arc::clone(&params),
        Arc::new(SystemClock),
        PskTlsConnector::new(config.session.read_timeout),
        serial_rx,
        serial_tx,
    )?;

    // Local clients are optional: a busy port must not keep the bridge down
    let server = if config.server.enabled {
        match TcpClientListener::bind(config.server.port, config.server.read_timeout) {
            Ok(listener) => Some(gateway.local_server(listener).spawn(WORKER_STACK_SIZE)?.0),
            Err(e) => {
                warn!("Local server disabled: {}", e);
                None
            }
        }
    } else {
        None
    };

    let (monitor, _workers) = gateway.spawn()?;
    info!("Gateway running!");

    loop {
        thread::sleep(config.poll_period);
        link.maintain();

        let stats = monitor.stats();
        info!(
            "WiFi {} | Cloud {} | RS485 rx {} tx {} crc {} | up {} down {} dropped {} | heartbeats {}",
            if link.is_up() { "up" } else { "down" },
            monitor.state(),
            stats.link.rx_frames,
            stats.link.tx_frames,
            stats.link.crc_errors,
            stats.router.uplink_frames,
            stats.router.downlink_frames,
            stats.router.dropped_not_ready,
            stats.session.heartbeats_sent,
        );
        if let Some(server) = &server {
            let s = server.stats();
            info!("Local clients {} | accepted {} rejected {}", s.active, s.accepted, s.rejected);
        }
    }
}
