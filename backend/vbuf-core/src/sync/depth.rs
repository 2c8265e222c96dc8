//! Writing host depth buffers back to guest memory as 16-bit depth codes

use crate::buffer::RenderTarget;
use crate::depth::DepthBufferId;
use crate::host::{
    BlitAspect, BlitFilter, Extent, GraphicsApi, GraphicsError, Host, Rect, SurfaceFormat,
    TextureCache, TransferBufferId,
};
use crate::sync::{
    CHUNK_LEN, ReadWindow, STAGING_HEIGHT, STAGING_WIDTH, SyncContext, TRANSFER_BUFFER_LEN,
    cut_height,
};
use vbuf_common::{ImageFormat, PixelSize};

#[derive(Debug, Clone, Copy)]
struct Prepared {
    frame: u32,
    depth: DepthBufferId,
    /// Rows of the staging surface occupied by the depth image
    surface_rows: u32,
}

#[derive(Debug)]
pub struct DepthReadback {
    staging: RenderTarget,
    transfer_buffer: TransferBufferId,
    prepared: Option<Prepared>,
}

impl DepthReadback {
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
            ImageFormat::Intensity,
            PixelSize::Bits16,
            SurfaceFormat::Depth32F,
            1,
        )?;

        let transfer_buffer = match host.gfx.create_transfer_buffer(TRANSFER_BUFFER_LEN) {
            Ok(buffer) => buffer,
            Err(err) => {
                staging.destroy(host);
                return Err(err);
            }
        };

        Ok(Self { staging, transfer_buffer, prepared: None })
    }

    pub fn destroy<G: GraphicsApi, T: TextureCache>(self, host: &mut Host<G, T>) {
        host.gfx.destroy_transfer_buffer(self.transfer_buffer);
        self.staging.destroy(host);
    }

    /// Write the depth partner of the buffer containing `address` to guest memory.
    pub(crate) fn copy_to_guest<G: GraphicsApi, T: TextureCache>(
        &mut self,
        ctx: &mut SyncContext<'_, G, T>,
        address: u32,
    ) -> bool {
        let Some(prepared) = self.prepare(ctx, address, false) else { return false };
        let Some(depth) = ctx.depth_buffers.get(prepared.depth) else { return false };

        let start = depth.address();
        let bytes = ctx.video.height.min(depth.lry()).saturating_mul(depth.width() * 2);
        let end = start.saturating_add(bytes);
        self.copy(ctx, prepared, start, end)
    }

    pub(crate) fn copy_chunk_to_guest<G: GraphicsApi, T: TextureCache>(
        &mut self,
        ctx: &mut SyncContext<'_, G, T>,
        address: u32,
    ) -> bool {
        let Some(prepared) = self.prepare(ctx, address, true) else { return false };
        self.copy(ctx, prepared, address, address.saturating_add(CHUNK_LEN))
    }

    fn prepare<G: GraphicsApi, T: TextureCache>(
        &mut self,
        ctx: &mut SyncContext<'_, G, T>,
        address: u32,
        chunk: bool,
    ) -> Option<Prepared> {
        let frame = ctx.video.swap_count;
        if chunk {
            if let Some(prepared) = self.prepared.filter(|prepared| prepared.frame == frame) {
                return Some(prepared);
            }
        }

        let pixels = ctx.video.width.saturating_mul(ctx.video.height);
        if pixels == 0 {
            return None;
        }

        let buffer = ctx.registry.find_by_address(address)?;
        if buffer.is_auxiliary(ctx.video) {
            return None;
        }
        let (buffer_width, buffer_height) = (buffer.width(), buffer.height());
        let source_extent = buffer.extent();

        let id = buffer.depth_partner()?;
        let depth = ctx.depth_buffers.get(id)?;
        if !depth.is_cleared() {
            log::debug!("Depth buffer at {:06X} was not cleared this frame", depth.address());
            return None;
        }

        let depth_address = depth.address();
        if u64::from(depth_address) + u64::from(pixels) * 2 > u64::from(ctx.memory.limit()) {
            return None;
        }

        let rows = ctx.video.height.min(depth.lry());
        if cut_height(depth_address, rows, buffer_width * 2, ctx.memory.limit()) == 0 {
            return None;
        }

        if buffer_width > STAGING_WIDTH || buffer_height > STAGING_HEIGHT {
            log::debug!(
                "{buffer_width}x{buffer_height} depth buffer does not fit in the staging surface"
            );
            return None;
        }

        let source = ctx.depth_buffers.resolve(&mut ctx.host.gfx, id)?;
        ctx.host.gfx.blit(
            source,
            Rect::from_extent(source_extent),
            self.staging.surface,
            Rect::new(0, 0, buffer_width, buffer_height),
            BlitAspect::Depth,
            BlitFilter::Nearest,
        );

        let prepared = Prepared { frame, depth: id, surface_rows: buffer_height };
        self.prepared = Some(prepared);
        Some(prepared)
    }

    fn copy<G: GraphicsApi, T: TextureCache>(
        &mut self,
        ctx: &mut SyncContext<'_, G, T>,
        prepared: Prepared,
        start: u32,
        end: u32,
    ) -> bool {
        let Some(depth) = ctx.depth_buffers.get(prepared.depth) else { return false };
        let (base_address, width) = (depth.address(), depth.width());

        let rows = ctx.video.height.min(depth.lry());
        let available_rows = cut_height(base_address, rows, width * 2, ctx.memory.limit());
        let Some(window) = ReadWindow::new(
            base_address,
            width,
            PixelSize::Bits16,
            prepared.surface_rows,
            available_rows,
            start,
            end,
        ) else {
            return false;
        };

        let rect = window.rect();
        let len = rect.pixels() * 4;
        if len > TRANSFER_BUFFER_LEN {
            return false;
        }

        let gfx = &mut ctx.host.gfx;
        gfx.read_pixels(self.staging.surface, rect, BlitAspect::Depth, self.transfer_buffer);
        let Some(data) = gfx.map_transfer_buffer(self.transfer_buffer, len) else {
            log::warn!("Unable to map transfer buffer for depth readback of {base_address:06X}");
            return false;
        };

        let lut = ctx.depth_buffers.lut();
        let mut written = 0;
        for (address, index) in window.placements() {
            let Some(bytes) = data.get(index * 4..index * 4 + 4) else { break };
            let z = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            if ctx.memory.write_u16(address, lut.encode(z)).is_err() {
                break;
            }
            written += 1;
        }

        log::trace!("Copied {written} depth values to {start:06X}-{end:06X}");

        if let Some(depth) = ctx.depth_buffers.get_mut(prepared.depth) {
            depth.clear_cleared();
        }
        if let Some(buffer) = ctx.registry.find_by_address_mut(base_address) {
            buffer.validity.mark_drawn();
        }

        true
    }
}
