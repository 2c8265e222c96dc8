//! Depth buffers paired with color buffers, and the depth encoding used when writing them back
//! to guest memory

use crate::buffer::RenderTarget;
use crate::host::{
    BlitAspect, BlitFilter, Extent, GraphicsApi, GraphicsError, Host, Rect, SurfaceFormat,
    SurfaceId, TextureCache,
};
use vbuf_common::{ImageFormat, PixelSize};

const LUT_LEN: usize = 0x40000;
const MAX_INDEX: u32 = LUT_LEN as u32 - 1;

/// Maps normalized depth values onto the console's 14-bit floating point depth format
/// (3-bit exponent, 11-bit mantissa), pre-shifted into the upper 14 bits of a 16-bit word.
#[derive(Debug, Clone)]
pub struct DepthLut(Box<[u16]>);

impl DepthLut {
    #[must_use]
    pub fn new() -> Self {
        let table = (0..LUT_LEN as u32)
            .map(|i| {
                let exponent = (i << 14).leading_ones().min(7);
                let mantissa = (i >> (6 - exponent.min(6))) & 0x7FF;
                (((exponent << 11) | mantissa) << 2) as u16
            })
            .collect();

        Self(table)
    }

    #[inline]
    #[must_use]
    pub fn get(&self, index: u32) -> u16 {
        self.0[(index as usize).min(LUT_LEN - 1)]
    }

    /// Encode a depth value in `[0, 1]`. Values outside the range clamp to the ends of the table.
    #[inline]
    #[must_use]
    pub fn encode(&self, z: f32) -> u16 {
        if z.is_nan() {
            return self.get(MAX_INDEX);
        }

        // Float to int casts saturate
        let index = ((z * LUT_LEN as f32 + 0.5).floor() as u32).min(MAX_INDEX);
        self.get(index)
    }
}

impl Default for DepthLut {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DepthBufferId(u32);

#[derive(Debug)]
pub struct DepthBuffer {
    id: DepthBufferId,
    address: u32,
    width: u32,
    lry: u32,
    cleared: bool,
    target: Option<RenderTarget>,
    resolve: Option<RenderTarget>,
    resolved: bool,
}

impl DepthBuffer {
    #[must_use]
    pub fn id(&self) -> DepthBufferId {
        self.id
    }

    #[must_use]
    pub fn address(&self) -> u32 {
        self.address
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Lowest row covered by the last clear of this depth image.
    #[must_use]
    pub fn lry(&self) -> u32 {
        self.lry
    }

    /// Whether the depth image has been cleared since it was last written back to guest memory.
    #[must_use]
    pub fn is_cleared(&self) -> bool {
        self.cleared
    }

    #[must_use]
    pub fn surface(&self) -> Option<SurfaceId> {
        self.target.map(|target| target.surface)
    }

    #[must_use]
    pub fn extent(&self) -> Option<Extent> {
        self.target.map(|target| target.extent)
    }

    pub(crate) fn clear_cleared(&mut self) {
        self.cleared = false;
    }

    fn destroy<G: GraphicsApi, T: TextureCache>(self, host: &mut Host<G, T>) {
        if let Some(target) = self.target {
            target.destroy(host);
        }
        if let Some(resolve) = self.resolve {
            resolve.destroy(host);
        }
    }
}

/// Depth images the guest has pointed the renderer at, most recent first.
#[derive(Debug)]
pub struct DepthBufferList {
    buffers: Vec<DepthBuffer>,
    current: Option<DepthBufferId>,
    next_id: u32,
    lut: DepthLut,
}

impl DepthBufferList {
    #[must_use]
    pub fn new() -> Self {
        Self { buffers: Vec::new(), current: None, next_id: 0, lut: DepthLut::new() }
    }

    #[must_use]
    pub fn lut(&self) -> &DepthLut {
        &self.lut
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    #[must_use]
    pub fn current(&self) -> Option<DepthBufferId> {
        self.current
    }

    #[must_use]
    pub fn get(&self, id: DepthBufferId) -> Option<&DepthBuffer> {
        self.buffers.iter().find(|buffer| buffer.id == id)
    }

    pub fn get_mut(&mut self, id: DepthBufferId) -> Option<&mut DepthBuffer> {
        self.buffers.iter_mut().find(|buffer| buffer.id == id)
    }

    #[must_use]
    pub fn find(&self, address: u32) -> Option<&DepthBuffer> {
        self.buffers.iter().find(|buffer| buffer.address == address)
    }

    /// Make the depth image at `address` current, creating a record for it if needed. A record
    /// with a different width is replaced; its id is returned alongside the current one so that
    /// color buffers paired with it can be unlinked.
    pub(crate) fn save_buffer<G: GraphicsApi, T: TextureCache>(
        &mut self,
        host: &mut Host<G, T>,
        address: u32,
        width: u32,
    ) -> (DepthBufferId, Option<DepthBufferId>) {
        let mut replaced = None;
        if let Some(existing) = self.find(address) {
            if existing.width == width {
                let id = existing.id;
                self.current = Some(id);
                return (id, None);
            }

            log::debug!(
                "Depth image at {address:06X} changed width from {} to {width}",
                existing.width
            );
            replaced = self.remove(host, address);
        }

        let id = DepthBufferId(self.next_id);
        self.next_id += 1;
        self.buffers.insert(
            0,
            DepthBuffer {
                id,
                address,
                width,
                lry: 0,
                cleared: false,
                target: None,
                resolve: None,
                resolved: false,
            },
        );
        self.current = Some(id);

        log::trace!("Created depth buffer {id:?} at {address:06X}, width {width}");

        (id, replaced)
    }

    /// Record a clear of the depth image at `address` down to row `lry`.
    pub fn mark_cleared(&mut self, address: u32, lry: u32) -> bool {
        match self.buffers.iter_mut().find(|buffer| buffer.address == address) {
            Some(buffer) => {
                buffer.cleared = true;
                buffer.lry = lry;
                true
            }
            None => false,
        }
    }

    /// Allocate host storage for a depth buffer the first time it is attached. Returns the
    /// extent of the depth surface.
    pub(crate) fn prepare_for<G: GraphicsApi, T: TextureCache>(
        &mut self,
        host: &mut Host<G, T>,
        id: DepthBufferId,
        color_extent: Extent,
        samples: u32,
    ) -> Result<Option<Extent>, GraphicsError> {
        let Some(buffer) = self.get_mut(id) else { return Ok(None) };

        buffer.resolved = false;
        if let Some(target) = buffer.target {
            return Ok(Some(target.extent));
        }

        let target = RenderTarget::create(
            host,
            buffer.address,
            color_extent,
            ImageFormat::Intensity,
            PixelSize::Bits16,
            SurfaceFormat::Depth32F,
            samples.max(1),
        )?;

        if samples > 1 {
            match RenderTarget::create(
                host,
                buffer.address,
                color_extent,
                ImageFormat::Intensity,
                PixelSize::Bits16,
                SurfaceFormat::Depth32F,
                1,
            ) {
                Ok(resolve) => buffer.resolve = Some(resolve),
                Err(err) => {
                    target.destroy(host);
                    return Err(err);
                }
            }
        }

        buffer.target = Some(target);
        Ok(Some(target.extent))
    }

    /// Single-sampled surface holding the depth buffer's contents, resolving it if needed.
    pub(crate) fn resolve<G: GraphicsApi>(
        &mut self,
        gfx: &mut G,
        id: DepthBufferId,
    ) -> Option<SurfaceId> {
        let buffer = self.get_mut(id)?;
        let target = buffer.target?;
        let Some(resolve) = buffer.resolve else { return Some(target.surface) };

        if !buffer.resolved {
            let rect = Rect::from_extent(target.extent);
            gfx.blit(
                target.surface,
                rect,
                resolve.surface,
                rect,
                BlitAspect::Depth,
                BlitFilter::Nearest,
            );
            buffer.resolved = true;
        }

        Some(resolve.surface)
    }

    pub(crate) fn remove<G: GraphicsApi, T: TextureCache>(
        &mut self,
        host: &mut Host<G, T>,
        address: u32,
    ) -> Option<DepthBufferId> {
        let index = self.buffers.iter().position(|buffer| buffer.address == address)?;
        let buffer = self.buffers.remove(index);
        let id = buffer.id;
        if self.current == Some(id) {
            self.current = None;
        }
        buffer.destroy(host);

        log::debug!("Removed depth buffer {id:?} at {address:06X}");

        Some(id)
    }

    pub(crate) fn destroy<G: GraphicsApi, T: TextureCache>(&mut self, host: &mut Host<G, T>) {
        for buffer in self.buffers.drain(..) {
            buffer.destroy(host);
        }
        self.current = None;
    }
}

impl Default for DepthBufferList {
    fn default() -> Self {
        Self::new()
    }
}
