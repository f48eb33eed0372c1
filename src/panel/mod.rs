//! Hardware capability seam
//!
//! [`Panel`] enumerates exactly what the kiosk needs from an e-paper driver.
//! Optional operations are advertised through `supports_*` flags; a driver
//! that lacks one keeps the default method, which reports
//! [`PanelError::Unsupported`] instead of failing in some driver-specific way.

use crate::bitmap::Bitmap;
use thiserror::Error;

pub mod simulated;
#[cfg(all(target_os = "linux", feature = "hardware"))]
pub mod waveshare;

pub use simulated::SimulatedPanel;

/// Width of the 7.5" V2 panel used by the kiosk
pub const PANEL_WIDTH: u32 = 800;
/// Height of the 7.5" V2 panel used by the kiosk
pub const PANEL_HEIGHT: u32 = 480;

/// Errors raised by panel operations
#[derive(Error, Debug)]
pub enum PanelError {
    /// The driver has no such operation
    #[error("{0} not supported by this panel")]
    Unsupported(&'static str),

    /// The controller reported a failure (SPI, GPIO, busy timeout)
    #[error("hardware error: {0}")]
    Hardware(String),

    /// Device node or snapshot file I/O failed
    #[error("panel IO: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of the best-effort partial-baseline operation
#[derive(Debug)]
pub enum BaseOutcome {
    /// The driver stored the image as the partial-refresh reference
    Established,
    /// The driver has no separate baseline step
    Unsupported,
    /// The driver tried and failed
    Failed(PanelError),
}

impl From<Result<(), PanelError>> for BaseOutcome {
    fn from(result: Result<(), PanelError>) -> Self {
        match result {
            Ok(()) => BaseOutcome::Established,
            Err(PanelError::Unsupported(_)) => BaseOutcome::Unsupported,
            Err(e) => BaseOutcome::Failed(e),
        }
    }
}

/// An e-paper panel as seen by the refresh controller.
///
/// All calls are synchronous and run to completion once issued.
pub trait Panel {
    /// Panel width in pixels
    fn width(&self) -> u32;

    /// Panel height in pixels
    fn height(&self) -> u32;

    /// Power up and (re)initialise the controller
    fn init(&mut self) -> Result<(), PanelError>;

    /// Blank the panel to white with a full refresh
    fn clear(&mut self) -> Result<(), PanelError>;

    /// Draw a complete frame with a full refresh
    fn display_full(&mut self, frame: &Bitmap) -> Result<(), PanelError>;

    /// Whether [`Panel::display_partial`] is implemented
    fn supports_partial(&self) -> bool {
        false
    }

    /// Draw a frame relative to the current baseline
    fn display_partial(&mut self, _frame: &Bitmap) -> Result<(), PanelError> {
        Err(PanelError::Unsupported("partial refresh"))
    }

    /// Whether [`Panel::establish_partial_base`] is implemented
    fn supports_partial_base(&self) -> bool {
        false
    }

    /// Store `frame` as the reference image for later partial refreshes
    fn establish_partial_base(&mut self, _frame: &Bitmap) -> Result<(), PanelError> {
        Err(PanelError::Unsupported("partial baseline"))
    }

    /// Enter deep sleep; [`Panel::init`] is required before the next draw
    fn sleep(&mut self) -> Result<(), PanelError>;

    /// Give the device back to the system at process exit
    fn release(&mut self) -> Result<(), PanelError> {
        Ok(())
    }

    /// Controller-native framebuffer for a bitmap
    fn buffer_for<'a>(&self, frame: &'a Bitmap) -> std::borrow::Cow<'a, [u8]> {
        std::borrow::Cow::Borrowed(frame.as_bytes())
    }
}
