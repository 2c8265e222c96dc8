//! Pushing pixels the guest CPU wrote directly into guest memory onto the host surface

use crate::buffer::{BufferId, RenderTarget, VirtualBuffer};
use crate::host::{
    BlendMode, Extent, GraphicsApi, GraphicsError, Host, Rect, SurfaceFormat, TextureCache,
};
use crate::registry::BufferRegistry;
use crate::sync::{STAGING_HEIGHT, STAGING_WIDTH, SyncContext, cut_height};
use crate::transcode;
use std::collections::BTreeSet;
use vbuf_common::{Color, GuestMemory, ImageFormat, PixelSize};

#[derive(Debug)]
pub struct GuestUpload {
    staging: RenderTarget,
    buffer: Option<BufferId>,
    addresses: BTreeSet<u32>,
}

impl GuestUpload {
    /// # Errors
    ///
    /// Propagates host allocation failures.
    pub fn new<G: GraphicsApi, T: TextureCache>(
        host: &mut Host<G, T>,
    ) -> Result<Self, GraphicsError> {
        let staging = RenderTarget::create(
            host,
            0,
            Extent::new(STAGING_WIDTH, STAGING_HEIGHT),
            ImageFormat::Rgba,
            PixelSize::Bits32,
            SurfaceFormat::Rgba8,
            1,
        )?;

        Ok(Self { staging, buffer: None, addresses: BTreeSet::new() })
    }

    pub fn destroy<G: GraphicsApi, T: TextureCache>(self, host: &mut Host<G, T>) {
        self.staging.destroy(host);
    }

    /// Number of written addresses waiting to be pushed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.addresses.len()
    }

    /// Record a guest CPU write of `size` bytes at `address`. Writes narrower than a pixel that
    /// do not start on a pixel boundary are ignored.
    pub(crate) fn add_address(&mut self, registry: &mut BufferRegistry, address: u32, size: u32) {
        let buffer = match self.buffer.and_then(|id| registry.get(id)) {
            Some(buffer) => buffer,
            None => {
                let Some(buffer) = registry.find_by_address(address) else { return };
                self.buffer = Some(buffer.id());
                buffer
            }
        };

        let bytes_per_pixel = buffer.pixel_size().bytes_per_pixel();
        if bytes_per_pixel == 0 || (size != bytes_per_pixel && address % bytes_per_pixel != 0) {
            return;
        }

        self.addresses.insert(address);
        registry.set_color_image_changed(true);
    }

    /// Push guest memory into the buffer containing `address`: only the recorded writes if there
    /// are any, otherwise the whole buffer. `opaque` marks a known-opaque full-buffer refresh.
    ///
    /// The recorded writes and the target buffer are reset on every return.
    pub(crate) fn copy_from_guest<G: GraphicsApi, T: TextureCache>(
        &mut self,
        ctx: &mut SyncContext<'_, G, T>,
        address: u32,
        opaque: bool,
        frame_buffer_info_supported: bool,
    ) -> bool {
        let copied = self.push(ctx, address, opaque, frame_buffer_info_supported);
        self.buffer = None;
        self.addresses.clear();
        copied
    }

    fn push<G: GraphicsApi, T: TextureCache>(
        &mut self,
        ctx: &mut SyncContext<'_, G, T>,
        address: u32,
        opaque: bool,
        frame_buffer_info_supported: bool,
    ) -> bool {
        if self.buffer.is_none() {
            if opaque || (ctx.config.copy_from_guest && !frame_buffer_info_supported) {
                self.buffer = ctx.registry.find_by_address(address).map(VirtualBuffer::id);
            }
        } else if self.addresses.is_empty() {
            return false;
        }

        let color_image_changed = ctx.registry.color_image_changed();
        let Some(buffer) = self.buffer.and_then(|id| ctx.registry.get_mut(id)) else {
            return false;
        };
        if buffer.pixel_size < PixelSize::Bits16 {
            return false;
        }
        if buffer.start_address == address && color_image_changed {
            log::debug!("Not pushing {address:06X}: the host has rendered to it");
            return false;
        }

        let base = buffer.start_address;
        let width = buffer.width;
        let rows = if base == address { ctx.video.real_height } else { buffer.height };
        let height = cut_height(base, rows, buffer.stride(), ctx.memory.limit());
        if height == 0 {
            return false;
        }
        if width > STAGING_WIDTH || height > STAGING_HEIGHT {
            log::debug!("{width}x{height} push to {base:06X} does not fit in the staging surface");
            return false;
        }

        let use_alpha = !opaque && buffer.sync.changed;
        let decoded = if self.addresses.is_empty() {
            decode_buffer(ctx.memory, base, width, height, buffer.pixel_size, opaque)
        } else {
            let pixel_size = buffer.pixel_size;
            decode_pixels(ctx.memory, &self.addresses, base, width, height, pixel_size, opaque)
        };

        if use_alpha {
            let len = buffer.pixel_size.bytes_for(width * height);
            let len = len.min(ctx.memory.limit() + 1 - base);
            if let Err(err) = ctx.memory.fill(base, len as usize, 0) {
                log::debug!("Unable to clear pushed pixels at {base:06X}: {err}");
            }
        }

        let Some(pixels) = decoded else { return false };

        let rect = Rect::new(0, 0, width, height);
        ctx.host.gfx.upload(self.staging.surface, rect, bytemuck::cast_slice(&pixels));

        // Guest row 0 is the top row of the buffer's surface
        let (scale_x, scale_y) = buffer.scale;
        let dst_rect = Rect::new(
            0,
            (buffer.height.saturating_sub(height) as f32 * scale_y) as u32,
            (width as f32 * scale_x) as u32,
            (height as f32 * scale_y) as u32,
        );
        ctx.host.gfx.draw_textured_rect(
            self.staging.surface,
            rect,
            buffer.surface(),
            dst_rect,
            BlendMode::SourceOver,
        );
        buffer.mark_rendered();

        log::trace!(
            "Pushed {width}x{height} pixels from {base:06X} ({} recorded writes)",
            self.addresses.len()
        );

        true
    }
}

fn read_pixel(memory: &GuestMemory, address: u32, pixel_size: PixelSize) -> Option<u32> {
    match pixel_size {
        PixelSize::Bits16 => memory.read_u16(address).ok().map(u32::from),
        PixelSize::Bits32 => memory.read_u32(address).ok(),
        PixelSize::Bits4 | PixelSize::Bits8 => None,
    }
}

fn decode(value: u32, pixel_size: PixelSize, opaque: bool) -> Color {
    match pixel_size {
        PixelSize::Bits32 => transcode::guest32_to_rgba(value, opaque),
        _ => transcode::guest16_to_rgba(value as u16, opaque),
    }
}

/// Decode every pixel of a `width`x`height` image, bottom row first. Returns `None` if every
/// guest pixel is zero.
fn decode_buffer(
    memory: &GuestMemory,
    base: u32,
    width: u32,
    height: u32,
    pixel_size: PixelSize,
    opaque: bool,
) -> Option<Vec<Color>> {
    let bytes_per_pixel = pixel_size.bytes_per_pixel();
    let mut pixels = vec![Color::TRANSPARENT; (width * height) as usize];
    let mut any_set = false;

    for y in 0..height {
        let row = height - 1 - y;
        for x in 0..width {
            let address = base + (row * width + x) * bytes_per_pixel;
            let Some(value) = read_pixel(memory, address, pixel_size) else { break };
            any_set |= value != 0;
            pixels[(y * width + x) as usize] = decode(value, pixel_size, opaque);
        }
    }

    any_set.then_some(pixels)
}

/// Decode only the pixels at the given addresses. Returns `None` if an address lies outside the
/// image or every written pixel is zero.
fn decode_pixels(
    memory: &GuestMemory,
    addresses: &BTreeSet<u32>,
    base: u32,
    width: u32,
    height: u32,
    pixel_size: PixelSize,
    opaque: bool,
) -> Option<Vec<Color>> {
    let bytes_per_pixel = pixel_size.bytes_per_pixel();
    let mut pixels = vec![Color::TRANSPARENT; (width * height) as usize];
    let mut any_set = false;

    for &address in addresses {
        if address < base {
            return None;
        }

        let index = (address - base) / bytes_per_pixel;
        let (x, row) = (index % width, index / width);
        if row >= height {
            return None;
        }

        let value = read_pixel(memory, base + index * bytes_per_pixel, pixel_size)?;
        any_set |= value != 0;
        pixels[((height - 1 - row) * width + x) as usize] = decode(value, pixel_size, opaque);
    }

    any_set.then_some(pixels)
}
