//! Moving pixels between host surfaces and guest memory

pub mod color;
pub mod depth;
pub mod upload;

use crate::depth::DepthBufferList;
use crate::host::{Host, Rect, VideoState};
use crate::registry::BufferRegistry;
use vbuf_common::{GuestMemory, PixelSize};
use vbuf_config::FrameBufferConfig;

/// Size of the staging surfaces used for readback and upload, in guest pixels.
pub const STAGING_WIDTH: u32 = 640;
pub const STAGING_HEIGHT: u32 = 580;

/// Bytes written by a single chunk copy.
pub const CHUNK_LEN: u32 = 0x1000;

pub(crate) const TRANSFER_BUFFER_LEN: usize = (STAGING_WIDTH * STAGING_HEIGHT * 4) as usize;

/// Number of `stride`-byte rows, up to `height`, that fit in guest memory starting at `address`.
#[must_use]
pub fn cut_height(address: u32, height: u32, stride: u32, limit: u32) -> u32 {
    if address > limit || stride == 0 {
        return 0;
    }

    let available = u64::from(limit) + 1 - u64::from(address);
    if u64::from(stride) * u64::from(height) > available {
        (available / u64::from(stride)) as u32
    } else {
        height
    }
}

/// Everything a sync engine needs besides its own state.
pub(crate) struct SyncContext<'a, G, T> {
    pub host: &'a mut Host<G, T>,
    pub registry: &'a mut BufferRegistry,
    pub depth_buffers: &'a mut DepthBufferList,
    pub memory: &'a mut GuestMemory,
    pub video: &'a VideoState,
    pub config: &'a FrameBufferConfig,
}

/// Placement of a host readback within a guest image.
///
/// The image occupies `surface_rows` rows of its host surface with guest row `r` stored at
/// surface row `surface_rows - 1 - r`. A window covers guest rows `first_row..end_row`, of
/// which the first may be partial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReadWindow {
    base_address: u32,
    width: u32,
    bytes_per_pixel: u32,
    first_row: u32,
    end_row: u32,
    first_column: u32,
    pixels: u32,
    surface_rows: u32,
}

impl ReadWindow {
    /// Window covering guest bytes `[start, end)` of an image at `base_address`, of which
    /// `available_rows` rows may be written.
    pub(crate) fn new(
        base_address: u32,
        width: u32,
        pixel_size: PixelSize,
        surface_rows: u32,
        available_rows: u32,
        start: u32,
        end: u32,
    ) -> Option<Self> {
        let bytes_per_pixel = pixel_size.bytes_per_pixel();
        let stride = pixel_size.bytes_for(width);
        if bytes_per_pixel == 0 || stride == 0 || start < base_address || end <= start {
            return None;
        }

        let rows = available_rows.min(surface_rows);
        let image_end = base_address.saturating_add(rows.saturating_mul(stride));
        let end = end.min(image_end);
        if end <= start {
            return None;
        }

        let first_row = (start - base_address) / stride;
        let end_row = (end - base_address).div_ceil(stride).min(rows);
        if first_row >= end_row {
            return None;
        }

        let mut first_column = (start - base_address) % stride / bytes_per_pixel;
        let mut pixels = (end - start) / bytes_per_pixel;
        // Start on an even pixel so 16-bit pixel pairs sharing a word are written together
        if first_column % 2 == 1 {
            first_column -= 1;
            pixels += 1;
        }

        Some(Self {
            base_address,
            width,
            bytes_per_pixel,
            first_row,
            end_row,
            first_column,
            pixels,
            surface_rows,
        })
    }

    /// Surface rectangle, in guest pixels, that holds the window's rows.
    pub(crate) fn rect(&self) -> Rect {
        Rect::new(
            0,
            self.surface_rows - self.end_row,
            self.width,
            self.end_row - self.first_row,
        )
    }

    /// Guest address of every pixel in the window, paired with the index of its source pixel in
    /// data read back from [`rect`](Self::rect).
    pub(crate) fn placements(&self) -> impl Iterator<Item = (u32, usize)> + '_ {
        let stride = self.width * self.bytes_per_pixel;
        (self.first_row..self.end_row)
            .flat_map(move |row| {
                let first_column = if row == self.first_row { self.first_column } else { 0 };
                let data_row = (self.end_row - 1 - row) as usize;
                (first_column..self.width).map(move |column| {
                    let address = self.base_address + row * stride + column * self.bytes_per_pixel;
                    (address, data_row * self.width as usize + column as usize)
                })
            })
            .take(self.pixels as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn cut_height_clips_to_memory() {
        assert_eq!(cut_height(0x100, 10, 0x40, 0xFFF), 10);
        assert_eq!(cut_height(0xF00, 10, 0x40, 0xFFF), 4);
        assert_eq!(cut_height(0xFFF, 10, 0x40, 0xFFF), 0);
        assert_eq!(cut_height(0x1000, 10, 0x40, 0xFFF), 0);
        assert_eq!(cut_height(0x100, 10, 0, 0xFFF), 0);
    }

    #[test]
    fn cut_height_never_exceeds_memory() {
        let limit = 0x7FFF;
        for address in (0..=limit + 1).step_by(0x123) {
            for stride in [2, 4, 0x140, 0x500, 0x8000] {
                for height in [0, 1, 7, 240, 1000] {
                    let rows = cut_height(address, height, stride, limit);
                    assert!(rows <= height);
                    assert!(
                        u64::from(address) + u64::from(stride) * u64::from(rows)
                            <= u64::from(limit) + 1
                    );
                }
            }
        }
    }

    #[test]
    fn full_window_covers_every_row() {
        let window = ReadWindow::new(0x1000, 4, PixelSize::Bits16, 3, 3, 0x1000, 0x1000 + 24)
            .unwrap();
        assert_eq!(window.rect(), Rect::new(0, 0, 4, 3));

        let placements: Vec<_> = window.placements().collect();
        assert_eq!(placements.len(), 12);
        // Guest row 0 comes from the top row of the readback
        assert_eq!(placements[0], (0x1000, 8));
        assert_eq!(placements[11], (0x1000 + 22, 3));
    }

    #[test]
    fn chunk_window_starts_on_even_pixel() {
        // Pixel 3 of row 1 through pixel 0 of row 2
        let window = ReadWindow::new(0x1000, 4, PixelSize::Bits16, 3, 3, 0x1000 + 14, 0x1000 + 18)
            .unwrap();
        assert_eq!(window.rect(), Rect::new(0, 0, 4, 2));

        let placements: Vec<_> = window.placements().collect();
        assert_eq!(placements, vec![(0x1000 + 12, 6), (0x1000 + 14, 7), (0x1000 + 16, 0)]);
    }

    #[test]
    fn window_is_clipped_to_available_rows() {
        let window =
            ReadWindow::new(0x1000, 4, PixelSize::Bits32, 4, 2, 0x1000, 0x1000 + 64).unwrap();
        assert_eq!(window.rect(), Rect::new(0, 2, 4, 2));
        assert_eq!(window.placements().count(), 8);
        assert!(window.placements().all(|(address, _)| address < 0x1000 + 32));

        let window = ReadWindow::new(0x1000, 4, PixelSize::Bits32, 4, 2, 0x1000 + 32, 0x1000 + 64);
        assert_eq!(window, None);
        assert_eq!(ReadWindow::new(0x1000, 4, PixelSize::Bits4, 4, 4, 0x1000, 0x1000 + 8), None);
    }
}
