//! # Screen Rendering
//!
//! Turns content into panel-sized 1-bit [`Bitmap`]s. The scheduler only talks
//! to the [`ScreenRenderer`] trait; [`EinkRenderer`] is the implementation
//! used on the device and in simulation.
//!
//! ## Transit screen layout
//! Three equal columns, one per configured stop slot. Each non-empty column
//! has the stop name in an inverted pill, then up to two services, each with
//! a round badge holding the service number and up to three ETA lines.

use crate::bitmap::{Bitmap, Color};
use crate::StopResult;
use embedded_graphics::{
    mono_font::{
        ascii::{FONT_10X20, FONT_9X15, FONT_9X18_BOLD},
        MonoFont, MonoTextStyle,
    },
    pixelcolor::BinaryColor,
    prelude::*,
    primitives::{Circle, PrimitiveStyle, Rectangle, RoundedRectangle},
    text::{Alignment, Baseline, Text, TextStyleBuilder},
};
use log::debug;
use std::path::Path;
use thiserror::Error;

/// Shown in place of an ETA that the feed did not provide
pub const MISSING_ETA: &str = "—";

/// Number of stop columns on the transit screen
pub const COLUMNS: usize = 3;
/// Services drawn per column
pub const SERVICES_PER_COLUMN: usize = 2;

/// Errors raised while loading a pre-rendered image
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("image decode: {0}")]
    Image(#[from] image::ImageError),

    #[error("image is {}x{}, panel is {}x{}", .actual.0, .actual.1, .expected.0, .expected.1)]
    Size {
        expected: (u32, u32),
        actual: (u32, u32),
    },

    #[error("image IO: {0}")]
    Io(#[from] std::io::Error),
}

/// Produces panel-sized bitmaps for the scheduler
pub trait ScreenRenderer {
    /// Load a pre-rendered, display-ready image
    fn load_image(&self, path: &Path, width: u32, height: u32) -> Result<Bitmap, RenderError>;

    /// Draw the transit screen. `stops` holds one entry per column slot,
    /// empty entries render as empty columns.
    fn render_transit(&self, stops: &[StopResult], width: u32, height: u32) -> Bitmap;
}

/// Format one ETA the way the first line shows it
pub fn format_eta(minutes: Option<u32>) -> String {
    match minutes {
        None => MISSING_ETA.to_string(),
        Some(0) => "Arriving".to_string(),
        Some(1) => "1 min".to_string(),
        Some(n) => format!("{n} mins"),
    }
}

/// Text for the three ETA lines of a service. Lines two and three are
/// zero-padded to two digits so the column stays aligned.
pub fn format_etas(etas: &[u32]) -> [String; 3] {
    let padded = |v: Option<u32>| match v {
        Some(n) if n >= 1 => {
            let unit = if n == 1 { "min" } else { "mins" };
            format!("{n:02} {unit}")
        }
        other => format_eta(other),
    };
    [
        format_eta(etas.first().copied()),
        padded(etas.get(1).copied()),
        padded(etas.get(2).copied()),
    ]
}

/// Layout metrics for the transit screen, in pixels
#[derive(Clone, Copy, Debug)]
struct Layout {
    col_margin: u32,
    col_gap: u32,
    top_y: i32,
    pill_height: u32,
    pill_max_width: u32,
    pill_radius: u32,
    badge_diameter: u32,
    eta_gap: i32,
    row_advance: i32,
    line2_offset: i32,
    line3_offset: i32,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            col_margin: 24,
            col_gap: 18,
            top_y: 64,
            pill_height: 48,
            pill_max_width: 300,
            pill_radius: 12,
            badge_diameter: 64,
            eta_gap: 24,
            row_advance: 140,
            line2_offset: 36,
            line3_offset: 64,
        }
    }
}

/// Renderer backed by `embedded-graphics` and the `image` crate
#[derive(Clone, Debug, Default)]
pub struct EinkRenderer {
    layout: Layout,
}

impl EinkRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    fn column_width(&self, width: u32) -> u32 {
        let l = &self.layout;
        width.saturating_sub(2 * l.col_margin + 2 * l.col_gap) / COLUMNS as u32
    }

    fn draw_column(&self, bitmap: &mut Bitmap, stop: &StopResult, x0: i32, col_w: u32) {
        if stop.is_empty() {
            return;
        }
        let l = &self.layout;
        let centered = TextStyleBuilder::new()
            .alignment(Alignment::Center)
            .baseline(Baseline::Middle)
            .build();

        // Stop-name pill
        let pill_w = col_w.saturating_sub(12).min(l.pill_max_width);
        let pill_x = x0 + (col_w as i32 - pill_w as i32) / 2;
        let pill = Rectangle::new(Point::new(pill_x, l.top_y), Size::new(pill_w, l.pill_height));
        let _ = RoundedRectangle::with_equal_corners(pill, Size::new(l.pill_radius, l.pill_radius))
            .into_styled(PrimitiveStyle::with_fill(BinaryColor::On))
            .draw(bitmap);
        let title = fit_text(&stop.stop_name, pill_w, &FONT_10X20);
        let _ = Text::with_text_style(
            &title,
            pill.center(),
            MonoTextStyle::new(&FONT_10X20, BinaryColor::Off),
            centered,
        )
        .draw(bitmap);

        let badge_style = MonoTextStyle::new(&FONT_9X18_BOLD, BinaryColor::Off);
        let big = MonoTextStyle::new(&FONT_10X20, BinaryColor::On);
        let small = MonoTextStyle::new(&FONT_9X15, BinaryColor::On);

        let mut y = l.top_y + l.pill_height as i32 + 48;
        for service in stop.services.iter().take(SERVICES_PER_COLUMN) {
            let d = l.badge_diameter;
            let center = Point::new(x0 + 8 + d as i32 / 2, y + d as i32 / 2);
            let _ = Circle::with_center(center, d)
                .into_styled(PrimitiveStyle::with_fill(BinaryColor::On))
                .draw(bitmap);
            let label = fit_text(&service.service_id, d, &FONT_9X18_BOLD);
            let _ = Text::with_text_style(&label, center, badge_style, centered).draw(bitmap);

            let text_x = x0 + 8 + d as i32 + l.eta_gap;
            let [l1, l2, l3] = format_etas(&service.eta_minutes);
            let _ = Text::with_baseline(&l1, Point::new(text_x, y), big, Baseline::Top).draw(bitmap);
            for (line, offset) in [(l2, l.line2_offset), (l3, l.line3_offset)] {
                if line != MISSING_ETA {
                    let at = Point::new(text_x + 4, y + offset);
                    let _ = Text::with_baseline(&line, at, small, Baseline::Top).draw(bitmap);
                }
            }
            y += l.row_advance;
        }
    }
}

impl ScreenRenderer for EinkRenderer {
    fn load_image(&self, path: &Path, width: u32, height: u32) -> Result<Bitmap, RenderError> {
        let img = image::open(path)?;
        let actual = (img.width(), img.height());
        if actual != (width, height) {
            return Err(RenderError::Size {
                expected: (width, height),
                actual,
            });
        }

        let luma = img.to_luma8();
        let mut bitmap = Bitmap::new(width, height);
        for (x, y, px) in luma.enumerate_pixels() {
            if px.0[0] < 128 {
                bitmap.set_pixel(x, y, Color::Black);
            }
        }
        debug!("Loaded {} ({} ink pixels)", path.display(), bitmap.ink_count());
        Ok(bitmap)
    }

    fn render_transit(&self, stops: &[StopResult], width: u32, height: u32) -> Bitmap {
        let mut bitmap = Bitmap::new(width, height);
        let col_w = self.column_width(width);
        for (i, stop) in stops.iter().take(COLUMNS).enumerate() {
            let x0 = (self.layout.col_margin + i as u32 * (col_w + self.layout.col_gap)) as i32;
            self.draw_column(&mut bitmap, stop, x0, col_w);
        }
        bitmap
    }
}

/// Truncate `text` to the characters that fit in `max_width` pixels
fn fit_text(text: &str, max_width: u32, font: &MonoFont) -> String {
    let advance = font.character_size.width + font.character_spacing;
    let max_chars = (max_width / advance.max(1)) as usize;
    text.chars().take(max_chars).collect()
}
