//! Writing host-rendered color buffers back to guest memory

use crate::buffer::{BufferId, RenderTarget, VirtualBuffer};
use crate::host::{
    BlitAspect, BlitFilter, Extent, GraphicsApi, GraphicsError, Host, Rect, SurfaceFormat,
    SurfaceId, TextureCache, TransferBufferId, VideoState,
};
use crate::sync::{
    CHUNK_LEN, ReadWindow, STAGING_HEIGHT, STAGING_WIDTH, SyncContext, TRANSFER_BUFFER_LEN,
    cut_height,
};
use crate::transcode;
use vbuf_common::{Color, GuestMemory, ImageFormat, PixelSize};

/// Transfer buffer slot used for reads that must complete within the call.
const SYNC_SLOT: usize = 2;

#[derive(Debug, Clone, Copy)]
struct Prepared {
    frame: u32,
    buffer: BufferId,
    start_address: u32,
    source: SurfaceId,
    source_format: SurfaceFormat,
}

#[derive(Debug)]
pub struct ColorReadback {
    staging: RenderTarget,
    transfer_buffers: [TransferBufferId; 3],
    current_slot: usize,
    prepared: Option<Prepared>,
}

impl ColorReadback {
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

        let mut transfer_buffers = Vec::with_capacity(3);
        for _ in 0..3 {
            match host.gfx.create_transfer_buffer(TRANSFER_BUFFER_LEN) {
                Ok(buffer) => transfer_buffers.push(buffer),
                Err(err) => {
                    for buffer in transfer_buffers {
                        host.gfx.destroy_transfer_buffer(buffer);
                    }
                    staging.destroy(host);
                    return Err(err);
                }
            }
        }

        Ok(Self {
            staging,
            transfer_buffers: [transfer_buffers[0], transfer_buffers[1], transfer_buffers[2]],
            current_slot: 0,
            prepared: None,
        })
    }

    pub fn destroy<G: GraphicsApi, T: TextureCache>(self, host: &mut Host<G, T>) {
        for buffer in self.transfer_buffers {
            host.gfx.destroy_transfer_buffer(buffer);
        }
        self.staging.destroy(host);
    }

    /// Write the whole buffer containing `address` to guest memory. With `sync` unset the
    /// data written is the readback requested by the previous call.
    pub(crate) fn copy_to_guest<G: GraphicsApi, T: TextureCache>(
        &mut self,
        ctx: &mut SyncContext<'_, G, T>,
        address: u32,
        sync: bool,
    ) -> bool {
        let Some(prepared) = self.prepare(ctx, address) else { return false };
        let Some(buffer) = ctx.registry.get(prepared.buffer) else { return false };

        let start = buffer.start_address;
        let bytes = buffer.pixel_size.bytes_for(buffer.width.saturating_mul(buffer.height));
        let end = start.saturating_add(bytes);
        self.copy(ctx, prepared, start, end, sync)
    }

    /// Write one chunk of guest memory starting at `address`, reading synchronously.
    pub(crate) fn copy_chunk_to_guest<G: GraphicsApi, T: TextureCache>(
        &mut self,
        ctx: &mut SyncContext<'_, G, T>,
        address: u32,
    ) -> bool {
        let Some(prepared) = self.prepare(ctx, address) else { return false };
        self.copy(ctx, prepared, address, address.saturating_add(CHUNK_LEN), true)
    }

    fn prepare<G: GraphicsApi, T: TextureCache>(
        &mut self,
        ctx: &mut SyncContext<'_, G, T>,
        address: u32,
    ) -> Option<Prepared> {
        let frame = ctx.video.swap_count;
        let found = ctx.registry.find_by_address(address).map(VirtualBuffer::id);

        // Further chunks of a buffer prepared this frame reuse the readback source
        if let Some(prepared) = self.prepared {
            if prepared.frame == frame
                && Some(prepared.buffer) == found
                && prepared.start_address != address
            {
                return Some(prepared);
            }
        }

        if !ctx.video.is_configured() || ctx.registry.current().is_none() {
            return None;
        }

        let buffer = ctx.registry.get_mut(found?)?;
        if buffer.capture.captured_offscreen || buffer.width == 0 || buffer.height == 0 {
            return None;
        }
        if buffer.pixel_size == PixelSize::Bits4 {
            log::debug!("Not copying 4bpp buffer at {:06X} to guest memory", buffer.start_address);
            return None;
        }

        if buffer.guest_range(ctx.memory).len == 0 {
            log::debug!("Buffer at {:06X} lies past the end of guest memory", buffer.start_address);
            return None;
        }

        if ctx.config.hacks.subscreen
            && buffer.width == ctx.video.width
            && buffer.height == ctx.video.height
        {
            copy_white_to_guest(buffer, ctx.memory, ctx.video, ctx.config.copy_auxiliary_to_guest);
            return None;
        }

        let mut source = buffer.sampling_surface(&mut ctx.host.gfx, false);
        let mut source_format = SurfaceFormat::for_pixel_size(buffer.pixel_size);
        let extent = buffer.extent();
        if extent != Extent::new(buffer.width, buffer.height) {
            if buffer.width > STAGING_WIDTH || buffer.height > STAGING_HEIGHT {
                log::debug!(
                    "{}x{} buffer at {:06X} does not fit in the staging surface",
                    buffer.width,
                    buffer.height,
                    buffer.start_address
                );
                return None;
            }

            let src_rect = match ctx.video.adjust_scale {
                Some(adjust) if ctx.config.native_resolution_factor == 0 => {
                    let width = (extent.width as f32 * adjust) as u32;
                    Rect::new(extent.width.saturating_sub(width) / 2, 0, width, extent.height)
                }
                _ => Rect::from_extent(extent),
            };
            ctx.host.gfx.blit(
                source,
                src_rect,
                self.staging.surface,
                Rect::new(0, 0, buffer.width, buffer.height),
                BlitAspect::Color,
                BlitFilter::Linear,
            );
            source = self.staging.surface;
            source_format = SurfaceFormat::Rgba8;
        }

        let prepared =
            Prepared { frame, buffer: buffer.id, start_address: address, source, source_format };
        self.prepared = Some(prepared);
        Some(prepared)
    }

    fn copy<G: GraphicsApi, T: TextureCache>(
        &mut self,
        ctx: &mut SyncContext<'_, G, T>,
        prepared: Prepared,
        start: u32,
        end: u32,
        sync: bool,
    ) -> bool {
        let Some(buffer) = ctx.registry.get(prepared.buffer) else { return false };
        let (base_address, width, height, pixel_size) =
            (buffer.start_address, buffer.width, buffer.height, buffer.pixel_size);

        let stride = pixel_size.bytes_for(width);
        let available_rows = cut_height(base_address, height, stride, ctx.memory.limit());
        let Some(window) =
            ReadWindow::new(base_address, width, pixel_size, height, available_rows, start, end)
        else {
            return false;
        };

        let rect = window.rect();
        let host_bytes_per_pixel = prepared.source_format.bytes_per_pixel();
        let len = rect.pixels() * host_bytes_per_pixel;
        if len > TRANSFER_BUFFER_LEN {
            log::debug!(
                "Readback of {rect:?} from {base_address:06X} exceeds transfer buffer size"
            );
            return false;
        }

        let (read_slot, map_slot) = if sync {
            (SYNC_SLOT, SYNC_SLOT)
        } else {
            self.current_slot ^= 1;
            (self.current_slot, self.current_slot ^ 1)
        };

        let gfx = &mut ctx.host.gfx;
        gfx.read_pixels(prepared.source, rect, BlitAspect::Color, self.transfer_buffers[read_slot]);
        let Some(data) = gfx.map_transfer_buffer(self.transfer_buffers[map_slot], len) else {
            log::warn!("Unable to map transfer buffer for readback of {base_address:06X}");
            return false;
        };

        let written = write_pixels(ctx.memory, &window, data, host_bytes_per_pixel, pixel_size);
        log::trace!(
            "Copied {written} pixels of buffer {base_address:06X} to {start:06X}-{end:06X}"
        );

        if let Some(buffer) = ctx.registry.get_mut(prepared.buffer) {
            buffer.sync.copied_to_guest = true;
            buffer.validity.mark_drawn();
            buffer.capture_validity(ctx.memory, ctx.video, ctx.config.copy_auxiliary_to_guest);
        }

        true
    }
}

fn host_color(data: &[u8], index: usize, bytes_per_pixel: usize) -> Option<Color> {
    let bytes = data.get(index * bytes_per_pixel..(index + 1) * bytes_per_pixel)?;
    Some(match *bytes {
        [r, g, b, a] => Color::rgba(r, g, b, a),
        [r] => Color::rgba(r, r, r, r),
        _ => return None,
    })
}

/// Transcode readback data into guest memory. Zero pixels are left untouched so that guest
/// pixels under transparent host pixels survive.
fn write_pixels(
    memory: &mut GuestMemory,
    window: &ReadWindow,
    data: &[u8],
    host_bytes_per_pixel: usize,
    pixel_size: PixelSize,
) -> usize {
    let mut written = 0;
    for (address, index) in window.placements() {
        let Some(color) = host_color(data, index, host_bytes_per_pixel) else { break };
        if color == Color::TRANSPARENT {
            continue;
        }

        let result = match pixel_size {
            PixelSize::Bits32 => memory.write_u32(address, transcode::rgba_to_guest32(color)),
            PixelSize::Bits16 => memory.write_u16(address, transcode::rgba_to_guest16(color)),
            PixelSize::Bits8 => memory.write_u8(address, color.r),
            PixelSize::Bits4 => return written,
        };
        if let Err(err) = result {
            log::debug!("Stopping readback: {err}");
            break;
        }
        written += 1;
    }

    written
}

/// Fill a displayed buffer's guest memory with white instead of reading it back.
fn copy_white_to_guest(
    buffer: &mut VirtualBuffer,
    memory: &mut GuestMemory,
    video: &VideoState,
    copy_auxiliary: bool,
) {
    let len = buffer.pixel_size.bytes_for(video.width.saturating_mul(video.height)) as usize;
    let available = (memory.len() as u64).saturating_sub(u64::from(buffer.start_address));
    let len = len.min(available as usize);
    if let Err(err) = memory.fill(buffer.start_address, len, 0xFF) {
        log::debug!("Unable to fill {:06X} with white: {err}", buffer.start_address);
        return;
    }

    log::trace!("Filled {len} bytes at {:06X} with white", buffer.start_address);

    buffer.sync.copied_to_guest = true;
    buffer.validity.mark_drawn();
    buffer.capture_validity(memory, video, copy_auxiliary);
}
