//! Development panel
//!
//! Stands in for the e-paper hardware on machines without SPI: every
//! primitive is logged, and the last presented frame can be written to a
//! PBM file for inspection.

use super::{Panel, PanelError};
use crate::bitmap::Bitmap;
use log::{debug, info};
use std::fs;
use std::path::PathBuf;

pub struct SimulatedPanel {
    width: u32,
    height: u32,
    snapshot: Option<PathBuf>,
    awake: bool,
    refreshes: u32,
}

impl SimulatedPanel {
    pub fn new(width: u32, height: u32, snapshot: Option<PathBuf>) -> Self {
        Self {
            width,
            height,
            snapshot,
            awake: false,
            refreshes: 0,
        }
    }

    /// Total full and partial refreshes performed so far
    pub fn refreshes(&self) -> u32 {
        self.refreshes
    }

    fn draw(&mut self, kind: &str, frame: &Bitmap) -> Result<(), PanelError> {
        if !self.awake {
            return Err(PanelError::Hardware(format!("{kind} while asleep")));
        }
        if frame.width() != self.width || frame.height() != self.height {
            return Err(PanelError::Hardware(format!(
                "{kind}: frame is {}x{}, panel is {}x{}",
                frame.width(),
                frame.height(),
                self.width,
                self.height
            )));
        }
        self.refreshes += 1;
        debug!(
            "[sim] {kind} refresh #{} ({} ink pixels)",
            self.refreshes,
            frame.ink_count()
        );
        if let Some(path) = &self.snapshot {
            fs::write(path, frame.to_pbm())?;
        }
        Ok(())
    }
}

impl Panel for SimulatedPanel {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn init(&mut self) -> Result<(), PanelError> {
        info!("[sim] init {}x{}", self.width, self.height);
        self.awake = true;
        Ok(())
    }

    fn clear(&mut self) -> Result<(), PanelError> {
        let blank = Bitmap::new(self.width, self.height);
        self.draw("clear", &blank)
    }

    fn display_full(&mut self, frame: &Bitmap) -> Result<(), PanelError> {
        self.draw("full", frame)
    }

    fn supports_partial(&self) -> bool {
        true
    }

    fn display_partial(&mut self, frame: &Bitmap) -> Result<(), PanelError> {
        self.draw("partial", frame)
    }

    fn supports_partial_base(&self) -> bool {
        true
    }

    fn establish_partial_base(&mut self, _frame: &Bitmap) -> Result<(), PanelError> {
        debug!("[sim] partial baseline stored");
        Ok(())
    }

    fn sleep(&mut self) -> Result<(), PanelError> {
        debug!("[sim] deep sleep");
        self.awake = false;
        Ok(())
    }
}
