//! Waveshare 7.5" V2 (800x480, black/white) over spidev + gpio-cdev.
//!
//! The controller protocol is handled by `epd-waveshare`; this module only
//! wires the Linux devices and maps the driver onto [`Panel`]. The V2
//! driver has no partial-refresh window support, so the capability flags
//! stay at their defaults and every update is a full refresh.

use super::{Panel, PanelError};
use crate::bitmap::Bitmap;
use crate::config::HardwareConfig;
use epd_waveshare::{epd7in5_v2::Epd7in5, prelude::*};
use linux_embedded_hal::{
    gpio_cdev::{Chip, LineRequestFlags},
    spidev::{SpiModeFlags, SpidevOptions},
    CdevPin, Delay, SpidevDevice,
};
use log::{debug, info};

type Driver = Epd7in5<SpidevDevice, CdevPin, CdevPin, CdevPin, Delay>;

pub struct WaveshareV2Panel {
    spi: SpidevDevice,
    delay: Delay,
    epd: Driver,
}

fn hw<E: std::fmt::Debug>(context: &'static str) -> impl Fn(E) -> PanelError {
    move |e| PanelError::Hardware(format!("{context}: {e:?}"))
}

impl WaveshareV2Panel {
    /// Open the SPI device and GPIO lines and run the controller's power-on sequence
    pub fn open(config: &HardwareConfig) -> Result<Self, PanelError> {
        info!(
            "Opening {} (DC={}, RST={}, BUSY={})",
            config.spi_device, config.dc_pin, config.rst_pin, config.busy_pin
        );

        let mut spi = SpidevDevice::open(&config.spi_device).map_err(hw("open spidev"))?;
        let options = SpidevOptions::new()
            .bits_per_word(8)
            .max_speed_hz(config.spi_speed_hz)
            .mode(SpiModeFlags::SPI_MODE_0)
            .build();
        spi.0.configure(&options)?;

        let mut chip = Chip::new(&config.gpio_chip).map_err(hw("open gpiochip"))?;
        let busy = chip
            .get_line(config.busy_pin)
            .and_then(|line| line.request(LineRequestFlags::INPUT, 0, "transit-frame-busy"))
            .map_err(hw("request BUSY"))?;
        let dc = chip
            .get_line(config.dc_pin)
            .and_then(|line| line.request(LineRequestFlags::OUTPUT, 0, "transit-frame-dc"))
            .map_err(hw("request DC"))?;
        let rst = chip
            .get_line(config.rst_pin)
            .and_then(|line| line.request(LineRequestFlags::OUTPUT, 1, "transit-frame-rst"))
            .map_err(hw("request RST"))?;

        let busy = CdevPin::new(busy).map_err(hw("BUSY pin"))?;
        let dc = CdevPin::new(dc).map_err(hw("DC pin"))?;
        let rst = CdevPin::new(rst).map_err(hw("RST pin"))?;

        let mut delay = Delay {};
        let epd = Epd7in5::new(&mut spi, busy, dc, rst, &mut delay, None).map_err(hw("init"))?;

        Ok(Self { spi, delay, epd })
    }
}

impl Panel for WaveshareV2Panel {
    fn width(&self) -> u32 {
        self.epd.width()
    }

    fn height(&self) -> u32 {
        self.epd.height()
    }

    fn init(&mut self) -> Result<(), PanelError> {
        debug!("EPD wake/init");
        self.epd
            .wake_up(&mut self.spi, &mut self.delay)
            .map_err(hw("wake_up"))
    }

    fn clear(&mut self) -> Result<(), PanelError> {
        self.epd
            .clear_frame(&mut self.spi, &mut self.delay)
            .map_err(hw("clear_frame"))?;
        self.epd
            .display_frame(&mut self.spi, &mut self.delay)
            .map_err(hw("display_frame"))
    }

    fn display_full(&mut self, frame: &Bitmap) -> Result<(), PanelError> {
        let buffer = self.buffer_for(frame);
        self.epd
            .update_and_display_frame(&mut self.spi, &buffer, &mut self.delay)
            .map_err(hw("update_and_display_frame"))
    }

    fn sleep(&mut self) -> Result<(), PanelError> {
        self.epd
            .sleep(&mut self.spi, &mut self.delay)
            .map_err(hw("sleep"))
    }

    fn release(&mut self) -> Result<(), PanelError> {
        // GPIO lines and the spidev handle are released on drop
        self.sleep()
    }
}
