//! 1-bit display bitmap
//!
//! Rows of packed bytes, MSB first, one bit per pixel: `1` is white (paper),
//! `0` is black (ink). This matches what Waveshare B/W controllers expect,
//! so a panel can usually send [`Bitmap::as_bytes`] straight to RAM.

use embedded_graphics::{pixelcolor::BinaryColor, prelude::*};

/// Pixel colours on a monochrome panel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Color {
    White,
    Black,
}

/// Packed 1-bit image sized to the panel
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bitmap {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Bitmap {
    /// A white bitmap of the given size
    pub fn new(width: u32, height: u32) -> Self {
        // Each row has (width+7)/8 bytes
        let bytes_per_row = width.div_ceil(8);
        let buffer_size = (bytes_per_row * height) as usize;
        Self {
            width,
            height,
            data: vec![0xFF; buffer_size],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn clear(&mut self, color: Color) {
        match color {
            Color::White => self.data.fill(0xFF),
            Color::Black => self.data.fill(0x00),
        }
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, color: Color) {
        if x >= self.width || y >= self.height {
            return;
        }

        let (byte_index, bit_mask) = self.locate(x, y);
        match color {
            Color::White => self.data[byte_index] |= bit_mask,
            Color::Black => self.data[byte_index] &= !bit_mask,
        }
    }

    /// Colour at `(x, y)`; out-of-bounds reads as white
    pub fn pixel(&self, x: u32, y: u32) -> Color {
        if x >= self.width || y >= self.height {
            return Color::White;
        }
        let (byte_index, bit_mask) = self.locate(x, y);
        if self.data[byte_index] & bit_mask == 0 {
            Color::Black
        } else {
            Color::White
        }
    }

    /// Number of black pixels, used in debug logging
    pub fn ink_count(&self) -> u32 {
        let bytes_per_row = self.width.div_ceil(8) as usize;
        if bytes_per_row == 0 {
            return 0;
        }
        // Padding bits at the end of each row don't count
        let used = self.width % 8;
        let tail_mask = if used == 0 { 0xFF } else { !(0xFFu8 >> used) };
        self.data
            .chunks(bytes_per_row)
            .filter_map(|row| row.split_last())
            .map(|(last, body)| {
                body.iter().map(|b| b.count_zeros()).sum::<u32>() + (!last & tail_mask).count_ones()
            })
            .sum()
    }

    /// Serialise as a binary PBM (P4). PBM uses 1 for black, so bits are inverted.
    pub fn to_pbm(&self) -> Vec<u8> {
        let mut out = format!("P4\n{} {}\n", self.width, self.height).into_bytes();
        out.extend(self.data.iter().map(|b| !b));
        out
    }

    fn locate(&self, x: u32, y: u32) -> (usize, u8) {
        let bytes_per_row = self.width.div_ceil(8);
        let byte_index = (y * bytes_per_row + x / 8) as usize;
        (byte_index, 0x80 >> (x % 8))
    }
}

impl OriginDimensions for Bitmap {
    fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }
}

impl DrawTarget for Bitmap {
    type Color = BinaryColor;
    type Error = core::convert::Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        for Pixel(point, color) in pixels {
            if point.x < 0 || point.y < 0 {
                continue;
            }
            // BinaryColor::On is ink
            let color = match color {
                BinaryColor::On => Color::Black,
                BinaryColor::Off => Color::White,
            };
            self.set_pixel(point.x as u32, point.y as u32, color);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_bitmap_is_white() {
        let bmp = Bitmap::new(800, 480);
        assert_eq!(bmp.as_bytes().len(), 100 * 480);
        assert!(bmp.as_bytes().iter().all(|&b| b == 0xFF));
        assert_eq!(bmp.ink_count(), 0);
    }

    #[test]
    fn set_pixel_is_msb_first() {
        let mut bmp = Bitmap::new(16, 2);
        bmp.set_pixel(0, 0, Color::Black);
        bmp.set_pixel(9, 1, Color::Black);
        assert_eq!(bmp.as_bytes(), &[0x7F, 0xFF, 0xFF, 0xBF]);
        assert_eq!(bmp.pixel(9, 1), Color::Black);
        assert_eq!(bmp.pixel(8, 1), Color::White);
        assert_eq!(bmp.ink_count(), 2);

        bmp.set_pixel(0, 0, Color::White);
        assert_eq!(bmp.pixel(0, 0), Color::White);
    }

    #[test]
    fn out_of_bounds_writes_are_ignored() {
        let mut bmp = Bitmap::new(10, 10);
        bmp.set_pixel(10, 0, Color::Black);
        bmp.set_pixel(0, 10, Color::Black);
        assert_eq!(bmp.ink_count(), 0);
        assert_eq!(bmp.pixel(50, 50), Color::White);
    }

    #[test]
    fn ink_count_ignores_row_padding() {
        let mut bmp = Bitmap::new(10, 2);
        bmp.clear(Color::Black);
        assert_eq!(bmp.ink_count(), 20);
    }

    #[test]
    fn pbm_header_and_inversion() {
        let mut bmp = Bitmap::new(8, 1);
        bmp.set_pixel(7, 0, Color::Black);
        let pbm = bmp.to_pbm();
        assert!(pbm.starts_with(b"P4\n8 1\n"));
        assert_eq!(*pbm.last().unwrap(), 0x01);
    }

    #[test]
    fn draws_through_embedded_graphics() {
        use embedded_graphics::primitives::{PrimitiveStyle, Rectangle};

        let mut bmp = Bitmap::new(16, 16);
        Rectangle::new(Point::new(2, 2), Size::new(4, 4))
            .into_styled(PrimitiveStyle::with_fill(BinaryColor::On))
            .draw(&mut bmp)
            .unwrap();
        assert_eq!(bmp.ink_count(), 16);
        assert_eq!(bmp.pixel(2, 2), Color::Black);
        assert_eq!(bmp.pixel(6, 6), Color::White);
    }
}
