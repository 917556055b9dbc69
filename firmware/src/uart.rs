//! RS485 port on the ESP32 UART
//!
//! The transceiver direction is driven by the UART's RTS line in hardware
//! half-duplex mode, so writes need no manual direction switching.

use std::io;
use std::time::Duration;

use esp_idf_svc::hal::delay::TickType;
use esp_idf_svc::hal::gpio::{AnyIOPin, InputPin, OutputPin};
use esp_idf_svc::hal::peripheral::Peripheral;
use esp_idf_svc::hal::uart::{self, config::Config as UartConfig, Uart, UartDriver, UartRxDriver, UartTxDriver};
use esp_idf_svc::hal::units::Hertz;
use esp_idf_svc::sys::{self, esp, EspError};
use log::info;
use modbus_cloud_bridge::config::{Parity, SerialSettings};
use modbus_cloud_bridge::error::TransportError;
use modbus_cloud_bridge::rs485::{read_frame, SerialRx, SerialTx};

fn uart_config(settings: &SerialSettings) -> UartConfig {
    let config = UartConfig::default()
        .baudrate(Hertz(settings.baud_rate))
        .data_bits(match settings.data_bits {
            7 => uart::config::DataBits::DataBits7,
            _ => uart::config::DataBits::DataBits8,
        })
        .stop_bits(match settings.stop_bits {
            2 => uart::config::StopBits::STOP2,
            _ => uart::config::StopBits::STOP1,
        });

    match settings.parity {
        Parity::None => config.parity_none(),
        Parity::Even => config.parity_even(),
        Parity::Odd => config.parity_odd(),
    }
}

/// Opens the UART in RS485 half-duplex mode and splits it into halves.
pub fn open<'d, U: Uart>(
    uart: impl Peripheral<P = U> + 'd,
    tx: impl Peripheral<P = impl OutputPin> + 'd,
    rx: impl Peripheral<P = impl InputPin> + 'd,
    rts: impl Peripheral<P = impl OutputPin> + 'd,
    settings: &SerialSettings,
) -> Result<(UartRx<'d>, UartTx<'d>), EspError> {
    let driver = UartDriver::new(
        uart,
        tx,
        rx,
        Option::<AnyIOPin>::None, // CTS (not used)
        Some(rts),                // RTS drives DE/RE
        &uart_config(settings),
    )?;

    let port = driver.port();
    esp!(unsafe { sys::uart_set_mode(port, sys::uart_mode_t_UART_MODE_RS485_HALF_DUPLEX) })?;
    esp!(unsafe { sys::uart_set_rx_timeout(port, settings.rx_fifo_timeout) })?;

    info!(
        "RS-485 UART initialized at {} baud ({}{:?}{})",
        settings.baud_rate, settings.data_bits, settings.parity, settings.stop_bits
    );

    let (tx, rx) = driver.into_split();
    Ok((UartRx { rx, gap: settings.inter_frame_gap }, UartTx { tx }))
}

fn ticks(timeout: Duration) -> u32 {
    TickType::from(timeout).ticks()
}

/// Receive half.
pub struct UartRx<'d> {
    rx: UartRxDriver<'d>,
    gap: Duration,
}

impl SerialRx for UartRx<'static> {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let gap = self.gap;
        let rx = &mut self.rx;
        read_frame(buf, timeout, gap, |chunk, wait| {
            rx.read(chunk, ticks(wait)).map_err(io::Error::other)
        })
    }
}

/// Transmit half.
pub struct UartTx<'d> {
    tx: UartTxDriver<'d>,
}

impl SerialTx for UartTx<'static> {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut written = 0;
        while written < bytes.len() {
            written += self.tx.write(&bytes[written..]).map_err(io::Error::other)?;
        }
        Ok(())
    }

    fn wait_tx_done(&mut self, timeout: Duration) -> Result<(), TransportError> {
        self.tx
            .wait_done(ticks(timeout))
            .map_err(|_| TransportError::TxTimeout(timeout.as_millis() as u64))
    }
}
