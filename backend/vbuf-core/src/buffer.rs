//! Virtual frame buffers: host surfaces standing in for guest images

use crate::depth::DepthBufferId;
use crate::host::{
    BlitAspect, BlitFilter, Extent, FrameBufferTexture, GraphicsApi, GraphicsError, Host, Rect,
    SurfaceDescriptor, SurfaceFormat, SurfaceId, TextureCache, TextureHandle, VideoState,
};
use crate::sync;
use crate::validity::{GuestRange, ValidityOracle};
use vbuf_common::{Color, GuestMemory, ImageFormat, PixelSize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub(crate) u64);

/// A host surface registered with the texture cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderTarget {
    pub surface: SurfaceId,
    pub texture: TextureHandle,
    pub extent: Extent,
    pub bytes: usize,
}

impl RenderTarget {
    pub(crate) fn create<G: GraphicsApi, T: TextureCache>(
        host: &mut Host<G, T>,
        address: u32,
        extent: Extent,
        format: ImageFormat,
        pixel_size: PixelSize,
        surface_format: SurfaceFormat,
        samples: u32,
    ) -> Result<Self, GraphicsError> {
        let bytes = extent.pixels() * surface_format.bytes_per_pixel();
        let texture = host.textures.add_frame_buffer_texture(&FrameBufferTexture {
            address,
            extent,
            format,
            pixel_size,
            bytes,
        });

        let descriptor = SurfaceDescriptor { extent, format: surface_format, samples };
        match host.gfx.create_surface(texture, &descriptor) {
            Ok(surface) => Ok(Self { surface, texture, extent, bytes }),
            Err(err) => {
                host.textures.remove_frame_buffer_texture(texture, bytes);
                Err(err)
            }
        }
    }

    pub(crate) fn destroy<G: GraphicsApi, T: TextureCache>(self, host: &mut Host<G, T>) {
        host.gfx.destroy_surface(self.surface);
        host.textures.remove_frame_buffer_texture(self.texture, self.bytes);
    }
}

/// Guest-memory synchronization state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncState {
    /// Contents have been written back to guest memory at least once
    pub copied_to_guest: bool,
    /// Rendered to since the last frame-wide reset
    pub changed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaptureFlags {
    /// The buffer is a guest-drawn image that was pushed to the host
    pub from_guest: bool,
    pub captured_offscreen: bool,
    pub pause_screen: bool,
    /// Frame in which post-processing was last applied; 0 if never
    pub post_processed: u32,
}

/// Geometry of a buffer to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRequest {
    pub address: u32,
    pub format: ImageFormat,
    pub pixel_size: PixelSize,
    pub width: u32,
    pub height: u32,
    pub from_guest: bool,
}

impl BufferRequest {
    /// Last guest byte covered by the requested image.
    #[must_use]
    pub fn end_address(&self) -> u32 {
        end_address(self.address, self.pixel_size, self.width, self.height)
    }
}

/// Last byte of a `width`x`height` image at `address`, clamped to the top of the address space.
pub(crate) fn end_address(address: u32, pixel_size: PixelSize, width: u32, height: u32) -> u32 {
    let bytes = pixel_size.bytes_for(width.saturating_mul(height));
    address.saturating_add(bytes.saturating_sub(1))
}

#[derive(Debug)]
pub struct VirtualBuffer {
    pub(crate) id: BufferId,
    pub(crate) start_address: u32,
    pub(crate) end_address: u32,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) pixel_size: PixelSize,
    pub(crate) format: ImageFormat,
    pub(crate) scale: (f32, f32),
    pub(crate) validity: ValidityOracle,
    pub(crate) sync: SyncState,
    pub(crate) capture: CaptureFlags,
    pub(crate) is_depth_buffer: bool,
    pub(crate) needs_height_correction: bool,
    pub(crate) depth_partner: Option<DepthBufferId>,
    primary: RenderTarget,
    resolve: Option<RenderTarget>,
    resolved: bool,
    samples: u32,
}

impl VirtualBuffer {
    pub(crate) fn create<G: GraphicsApi, T: TextureCache>(
        host: &mut Host<G, T>,
        id: BufferId,
        request: &BufferRequest,
        scale: (f32, f32),
        samples: u32,
        video: &VideoState,
    ) -> Result<Self, GraphicsError> {
        let (primary, resolve) = allocate_targets(
            host,
            request.address,
            request.format,
            request.pixel_size,
            Extent::scaled(request.width, request.height, scale),
            samples,
        )?;
        host.gfx.clear_color(primary.surface, Color::TRANSPARENT);

        log::trace!(
            "Created {}x{} {} buffer at {:06X} with scale {scale:?}",
            request.width,
            request.height,
            request.pixel_size,
            request.address
        );

        Ok(Self {
            id,
            start_address: request.address,
            end_address: request.end_address(),
            width: request.width,
            height: request.height,
            pixel_size: request.pixel_size,
            format: request.format,
            scale,
            validity: ValidityOracle::default(),
            sync: SyncState::default(),
            capture: CaptureFlags { from_guest: request.from_guest, ..CaptureFlags::default() },
            is_depth_buffer: false,
            needs_height_correction: request.width != video.width
                && request.width != video.width_register,
            depth_partner: None,
            primary,
            resolve,
            resolved: false,
            samples,
        })
    }

    /// Reallocate host storage for a new height, keeping address, width and format.
    pub(crate) fn reinit<G: GraphicsApi, T: TextureCache>(
        &mut self,
        host: &mut Host<G, T>,
        height: u32,
    ) -> Result<(), GraphicsError> {
        let (primary, resolve) = allocate_targets(
            host,
            self.start_address,
            self.format,
            self.pixel_size,
            Extent::scaled(self.width, height, self.scale),
            self.samples,
        )?;
        host.gfx.clear_color(primary.surface, Color::TRANSPARENT);

        self.release_targets(host);
        self.primary = primary;
        self.resolve = resolve;
        self.resolved = false;
        self.height = height;
        self.end_address = end_address(self.start_address, self.pixel_size, self.width, height);

        Ok(())
    }

    pub(crate) fn destroy<G: GraphicsApi, T: TextureCache>(self, host: &mut Host<G, T>) {
        log::trace!("Destroying buffer {:?} at {:06X}", self.id, self.start_address);
        self.release_targets(host);
    }

    fn release_targets<G: GraphicsApi, T: TextureCache>(&self, host: &mut Host<G, T>) {
        self.primary.destroy(host);
        if let Some(resolve) = self.resolve {
            resolve.destroy(host);
        }
    }

    #[must_use]
    pub fn id(&self) -> BufferId {
        self.id
    }

    #[must_use]
    pub fn start_address(&self) -> u32 {
        self.start_address
    }

    #[must_use]
    pub fn end_address(&self) -> u32 {
        self.end_address
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[must_use]
    pub fn pixel_size(&self) -> PixelSize {
        self.pixel_size
    }

    #[must_use]
    pub fn format(&self) -> ImageFormat {
        self.format
    }

    #[must_use]
    pub fn scale(&self) -> (f32, f32) {
        self.scale
    }

    #[must_use]
    pub fn validity(&self) -> &ValidityOracle {
        &self.validity
    }

    #[must_use]
    pub fn sync_state(&self) -> SyncState {
        self.sync
    }

    #[must_use]
    pub fn capture_flags(&self) -> CaptureFlags {
        self.capture
    }

    #[must_use]
    pub fn is_depth_buffer(&self) -> bool {
        self.is_depth_buffer
    }

    #[must_use]
    pub fn depth_partner(&self) -> Option<DepthBufferId> {
        self.depth_partner
    }

    /// Surface that guest draws render into.
    #[must_use]
    pub fn surface(&self) -> SurfaceId {
        self.primary.surface
    }

    #[must_use]
    pub fn extent(&self) -> Extent {
        self.primary.extent
    }

    #[must_use]
    pub fn is_multisampled(&self) -> bool {
        self.resolve.is_some()
    }

    /// Guest bytes per row.
    #[must_use]
    pub fn stride(&self) -> u32 {
        self.pixel_size.bytes_for(self.width)
    }

    #[must_use]
    pub fn contains(&self, address: u32) -> bool {
        (self.start_address..=self.end_address).contains(&address)
    }

    /// Whether this buffer is an off-screen image rather than a displayable frame.
    #[must_use]
    pub fn is_auxiliary(&self, video: &VideoState) -> bool {
        self.width != video.width
    }

    /// Guest byte range backing this buffer, clipped to the end of guest memory.
    #[must_use]
    pub fn guest_range(&self, memory: &GuestMemory) -> GuestRange {
        let stride = self.stride();
        let rows = sync::cut_height(self.start_address, self.height, stride, memory.limit());
        GuestRange { start: self.start_address, len: stride * rows }
    }

    pub(crate) fn mark_rendered(&mut self) {
        self.resolved = false;
    }

    /// Copy the multisampled surface into the single-sampled one. Does nothing for buffers that
    /// are not multisampled, or that are already resolved unless `force` is set.
    pub(crate) fn resolve_multisample<G: GraphicsApi>(&mut self, gfx: &mut G, force: bool) {
        let Some(resolve) = self.resolve else { return };
        if self.resolved && !force {
            return;
        }

        let rect = Rect::from_extent(self.primary.extent);
        gfx.blit(
            self.primary.surface,
            rect,
            resolve.surface,
            rect,
            BlitAspect::Color,
            BlitFilter::Nearest,
        );
        self.resolved = true;
    }

    /// Single-sampled surface holding the buffer's current contents.
    pub(crate) fn sampling_surface<G: GraphicsApi>(
        &mut self,
        gfx: &mut G,
        force: bool,
    ) -> SurfaceId {
        self.resolve_multisample(gfx, force);
        self.resolve.map_or(self.primary.surface, |resolve| resolve.surface)
    }

    /// Record the buffer's guest contents for later validity checks. Auxiliary buffers that are
    /// never copied to guest memory are fingerprinted instead.
    pub(crate) fn capture_validity(
        &mut self,
        memory: &mut GuestMemory,
        video: &VideoState,
        copy_auxiliary: bool,
    ) {
        let range = self.guest_range(memory);
        if range.len == 0 {
            return;
        }

        let fingerprint = self.is_auxiliary(video) && !copy_auxiliary;
        self.validity.capture(range, fingerprint, memory);
    }

    pub(crate) fn set_format<T: TextureCache>(&mut self, textures: &mut T, format: ImageFormat) {
        self.format = format;
        textures.update_frame_buffer_texture(self.primary.texture, format, self.pixel_size);
    }
}

fn allocate_targets<G: GraphicsApi, T: TextureCache>(
    host: &mut Host<G, T>,
    address: u32,
    format: ImageFormat,
    pixel_size: PixelSize,
    extent: Extent,
    samples: u32,
) -> Result<(RenderTarget, Option<RenderTarget>), GraphicsError> {
    let surface_format = SurfaceFormat::for_pixel_size(pixel_size);
    let primary = RenderTarget::create(
        host,
        address,
        extent,
        format,
        pixel_size,
        surface_format,
        samples.max(1),
    )?;

    if samples <= 1 {
        return Ok((primary, None));
    }

    match RenderTarget::create(host, address, extent, format, pixel_size, surface_format, 1) {
        Ok(resolve) => Ok((primary, Some(resolve))),
        Err(err) => {
            primary.destroy(host);
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::software::{CountingTextureCache, SoftwareGraphics};
    use test_log::test;

    fn video() -> VideoState {
        VideoState {
            width: 320,
            height: 240,
            real_height: 240,
            width_register: 320,
            scale_x: 2.0,
            scale_y: 2.0,
            ..VideoState::default()
        }
    }

    fn request(width: u32, height: u32) -> BufferRequest {
        BufferRequest {
            address: 0x10_0000,
            format: ImageFormat::Rgba,
            pixel_size: PixelSize::Bits16,
            width,
            height,
            from_guest: false,
        }
    }

    #[test]
    fn geometry() {
        let mut host = Host::new(SoftwareGraphics::new(), CountingTextureCache::new());
        let buffer =
            VirtualBuffer::create(&mut host, BufferId(0), &request(320, 240), (2.0, 2.0), 0, &video())
                .unwrap();

        assert_eq!(buffer.end_address(), 0x10_0000 + 320 * 240 * 2 - 1);
        assert_eq!(buffer.stride(), 640);
        assert_eq!(buffer.extent(), Extent::new(640, 480));
        assert!(!buffer.is_auxiliary(&video()));
        assert!(!buffer.needs_height_correction);
        assert!(buffer.contains(0x10_0000 + 1000));
        assert!(!buffer.contains(0x10_0000 + 320 * 240 * 2));
    }

    #[test]
    fn multisampled_buffer_resolves_lazily() {
        let mut host = Host::new(SoftwareGraphics::new(), CountingTextureCache::new());
        let mut buffer =
            VirtualBuffer::create(&mut host, BufferId(0), &request(16, 16), (1.0, 1.0), 4, &video())
                .unwrap();

        assert!(buffer.is_multisampled());
        assert_eq!(host.gfx.samples(buffer.surface()), Some(4));

        let red = Color::rgba(255, 0, 0, 255);
        host.gfx.set_pixel(buffer.surface(), 3, 3, red);
        let resolved = buffer.sampling_surface(&mut host.gfx, false);
        assert_ne!(resolved, buffer.surface());
        assert_eq!(host.gfx.pixel(resolved, 3, 3), Some(red));

        // Already resolved: later draws are not picked up until the buffer is rendered to again
        host.gfx.set_pixel(buffer.surface(), 4, 4, red);
        buffer.sampling_surface(&mut host.gfx, false);
        assert_eq!(host.gfx.pixel(resolved, 4, 4), Some(Color::TRANSPARENT));

        buffer.mark_rendered();
        buffer.sampling_surface(&mut host.gfx, false);
        assert_eq!(host.gfx.pixel(resolved, 4, 4), Some(red));
    }

    #[test]
    fn reinit_returns_previous_storage() {
        let mut host = Host::new(SoftwareGraphics::new(), CountingTextureCache::new());
        let mut buffer =
            VirtualBuffer::create(&mut host, BufferId(0), &request(64, 32), (1.0, 1.0), 0, &video())
                .unwrap();
        let bytes_before = host.textures.bytes_in_use();

        buffer.reinit(&mut host, 64).unwrap();
        assert_eq!(buffer.height(), 64);
        assert_eq!(buffer.end_address(), 0x10_0000 + 64 * 64 * 2 - 1);
        assert_eq!(host.textures.bytes_in_use(), bytes_before * 2);
        assert_eq!(host.gfx.live_surfaces(), 1);

        buffer.destroy(&mut host);
        assert_eq!(host.textures.bytes_in_use(), 0);
        assert_eq!(host.gfx.live_surfaces(), 0);
    }

    #[test]
    fn failed_allocation_releases_texture() {
        let gfx = SoftwareGraphics::new().with_surface_limit(0);
        let mut host = Host::new(gfx, CountingTextureCache::new());
        let result =
            VirtualBuffer::create(&mut host, BufferId(0), &request(8, 8), (1.0, 1.0), 4, &video());

        assert!(result.is_err());
        assert_eq!(host.textures.live_textures(), 0);
        assert_eq!(host.gfx.live_surfaces(), 0);
    }
}
