//! Station-mode WiFi link
//!
//! The gateway does not wait for the network: the cloud session already
//! retries its own connection, so this link only has to keep rejoining the
//! access point whenever it drops.

use std::time::{Duration, Instant};

use anyhow::anyhow;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::hal::modem::Modem;
use esp_idf_svc::hal::peripheral::Peripheral;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::wifi::{AuthMethod, BlockingWifi, ClientConfiguration, Configuration, EspWifi};
use log::{info, warn};

/// Pause between join attempts while the access point is unreachable
pub const REJOIN_INTERVAL: Duration = Duration::from_secs(3);

pub struct StationLink {
    wifi: BlockingWifi<EspWifi<'static>>,
    ssid: String,
    up: bool,
    last_attempt: Option<Instant>,
}

impl StationLink {
    /// Configures the station and starts the radio without joining yet.
    pub fn start(
        modem: impl Peripheral<P = Modem> + 'static,
        sys_loop: EspSystemEventLoop,
        nvs: EspDefaultNvsPartition,
        ssid: &str,
        password: &str,
    ) -> anyhow::Result<Self> {
        let mut wifi = BlockingWifi::wrap(EspWifi::new(modem, sys_loop.clone(), Some(nvs))?, sys_loop)?;

        let auth_method = if password.is_empty() { AuthMethod::None } else { AuthMethod::WPA2Personal };
        wifi.set_configuration(&Configuration::Client(ClientConfiguration {
            ssid: ssid.try_into().map_err(|_| anyhow!("SSID '{}' is too long", ssid))?,
            password: password.try_into().map_err(|_| anyhow!("WiFi password is too long"))?,
            auth_method,
            ..Default::default()
        }))?;
        wifi.start()?;

        Ok(Self { wifi, ssid: ssid.to_string(), up: false, last_attempt: None })
    }

    pub fn is_up(&self) -> bool {
        self.up
    }

    /// Rejoins the access point if the link is down, at most once per
    /// [`REJOIN_INTERVAL`]. Returns whether the link is up afterwards.
    pub fn maintain(&mut self) -> bool {
        if self.wifi.is_connected().unwrap_or(false) {
            if !self.up {
                self.up = true;
                self.log_address();
            }
            return true;
        }

        if self.up {
            warn!("WiFi link to '{}' lost", self.ssid);
            self.up = false;
        }

        if self.last_attempt.is_some_and(|at| at.elapsed() < REJOIN_INTERVAL) {
            return false;
        }
        self.last_attempt = Some(Instant::now());

        info!("Joining '{}'", self.ssid);
        match self.wifi.connect().and_then(|_| self.wifi.wait_netif_up()) {
            Ok(()) => {
                self.up = true;
                self.log_address();
            }
            Err(e) => {
                warn!("WiFi join failed: {}", e);
                let _ = self.wifi.disconnect();
            }
        }
        self.up
    }

    fn log_address(&self) {
        match self.wifi.wifi().sta_netif().get_ip_info() {
            Ok(ip) => info!("WiFi up: {} via {}", ip.ip, ip.subnet.gateway),
            Err(e) => info!("WiFi up (address unavailable: {})", e),
        }
    }
}
