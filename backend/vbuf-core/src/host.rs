//! Collaborators the frame buffer cache consumes: the host graphics API, the texture cache, and
//! the per-frame video/render state supplied by the rest of the emulator

pub mod software;

use bincode::{Decode, Encode};
use thiserror::Error;
use vbuf_common::{Color, ImageFormat, PixelSize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferBufferId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Extent {
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Host extent of a `width`x`height` guest image rendered with the given oversampling.
    #[must_use]
    pub fn scaled(width: u32, height: u32, (scale_x, scale_y): (f32, f32)) -> Self {
        Self {
            width: (width as f32 * scale_x).round() as u32,
            height: (height as f32 * scale_y).round() as u32,
        }
    }

    #[inline]
    #[must_use]
    pub fn pixels(self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Rectangle in host surface coordinates. The origin is the bottom-left corner and `y` grows
/// upwards, so row 0 holds the last guest scanline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    #[must_use]
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    #[must_use]
    pub const fn from_extent(extent: Extent) -> Self {
        Self::new(0, 0, extent.width, extent.height)
    }

    #[inline]
    #[must_use]
    pub fn pixels(self) -> usize {
        self.width as usize * self.height as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SurfaceFormat {
    Rgba8,
    R8,
    Depth32F,
}

impl SurfaceFormat {
    /// Surface format used to store a guest image of the given pixel size.
    #[must_use]
    pub fn for_pixel_size(pixel_size: PixelSize) -> Self {
        if pixel_size > PixelSize::Bits8 { Self::Rgba8 } else { Self::R8 }
    }

    #[must_use]
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgba8 | Self::Depth32F => 4,
            Self::R8 => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceDescriptor {
    pub extent: Extent,
    pub format: SurfaceFormat,
    /// 1 for single-sampled surfaces
    pub samples: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlitAspect {
    Color,
    Depth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlitFilter {
    Nearest,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendMode {
    Replace,
    SourceOver,
}

#[derive(Debug, Error)]
pub enum GraphicsError {
    #[error("Failed to allocate {width}x{height} {format:?} surface with {samples} sample(s)")]
    SurfaceAllocation { width: u32, height: u32, format: SurfaceFormat, samples: u32 },
    #[error("Failed to allocate {size}-byte transfer buffer")]
    TransferBufferAllocation { size: usize },
}

/// Host GPU operations needed by the cache.
///
/// Surfaces use a bottom-left origin. Transfer buffers are filled asynchronously by
/// [`read_pixels`](GraphicsApi::read_pixels); a mapping stays valid for as long as the returned
/// slice is borrowed and is released when the borrow ends.
pub trait GraphicsApi {
    /// Allocate a render-target surface backing the given texture.
    ///
    /// # Errors
    ///
    /// Propagates host allocation failures.
    fn create_surface(
        &mut self,
        texture: TextureHandle,
        descriptor: &SurfaceDescriptor,
    ) -> Result<SurfaceId, GraphicsError>;

    fn destroy_surface(&mut self, surface: SurfaceId);

    /// Attach (or detach, with `None`) a depth surface to a color surface.
    fn attach_depth(&mut self, color: SurfaceId, depth: Option<SurfaceId>);

    /// Bind the surface that subsequent guest draws render into, or the default target.
    fn bind_render_target(&mut self, surface: Option<SurfaceId>);

    fn clear_color(&mut self, surface: SurfaceId, color: Color);

    fn blit(
        &mut self,
        src: SurfaceId,
        src_rect: Rect,
        dst: SurfaceId,
        dst_rect: Rect,
        aspect: BlitAspect,
        filter: BlitFilter,
    );

    /// # Errors
    ///
    /// Propagates host allocation failures.
    fn create_transfer_buffer(&mut self, size: usize) -> Result<TransferBufferId, GraphicsError>;

    fn destroy_transfer_buffer(&mut self, buffer: TransferBufferId);

    /// Schedule a read of `rect` into the transfer buffer. Data is packed row by row starting
    /// from the bottom row of `rect`, in the source surface's native format.
    fn read_pixels(
        &mut self,
        src: SurfaceId,
        rect: Rect,
        aspect: BlitAspect,
        dst: TransferBufferId,
    );

    /// Map the first `len` bytes of a transfer buffer for reading. Returns `None` if the host
    /// cannot map the buffer.
    fn map_transfer_buffer(&mut self, buffer: TransferBufferId, len: usize) -> Option<&[u8]>;

    /// Upload tightly packed RGBA8 pixels into `rect`, bottom row first.
    fn upload(&mut self, dst: SurfaceId, rect: Rect, rgba: &[u8]);

    fn draw_textured_rect(
        &mut self,
        src: SurfaceId,
        src_rect: Rect,
        dst: SurfaceId,
        dst_rect: Rect,
        blend: BlendMode,
    );
}

/// Metadata registered with the texture cache for every surface the cache allocates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameBufferTexture {
    pub address: u32,
    pub extent: Extent,
    pub format: ImageFormat,
    pub pixel_size: PixelSize,
    pub bytes: usize,
}

pub trait TextureCache {
    fn add_frame_buffer_texture(&mut self, texture: &FrameBufferTexture) -> TextureHandle;

    fn remove_frame_buffer_texture(&mut self, handle: TextureHandle, bytes: usize);

    /// Called when a buffer changes color format in place.
    fn update_frame_buffer_texture(
        &mut self,
        _handle: TextureHandle,
        _format: ImageFormat,
        _pixel_size: PixelSize,
    ) {
    }
}

/// The host collaborators, bundled so they can be passed around as one borrow.
#[derive(Debug)]
pub struct Host<G, T> {
    pub gfx: G,
    pub textures: T,
}

impl<G: GraphicsApi, T: TextureCache> Host<G, T> {
    pub fn new(gfx: G, textures: T) -> Self {
        Self { gfx, textures }
    }
}

/// Video interface state for the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Default, Encode, Decode)]
pub struct VideoState {
    /// Displayed width in guest pixels; 0 if the video interface is not configured yet
    pub width: u32,
    pub height: u32,
    /// Height including lines the video interface does not display
    pub real_height: u32,
    /// Value of the video interface width register
    pub width_register: u32,
    /// Host pixels per guest pixel
    pub scale_x: f32,
    pub scale_y: f32,
    /// Horizontal scale applied when the output is letterboxed for widescreen
    pub adjust_scale: Option<f32>,
    pub pal: bool,
    pub swap_count: u32,
}

impl VideoState {
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.width != 0
    }

    #[must_use]
    pub fn display_scale(&self) -> (f32, f32) {
        (self.scale_x, self.scale_y)
    }
}

/// Renderer state the cache reads when a color image is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
pub struct RenderState {
    /// Height of the current color image as far as the renderer knows; 0 if unknown
    pub color_image_height: u32,
    pub depth_image_address: u32,
    pub fill_color: u32,
}

/// Host color for a guest fill color. 16-bit fill colors hold two copies of the same pixel.
#[must_use]
pub fn fill_color_to_host(fill_color: u32, pixel_size: PixelSize) -> Color {
    match pixel_size {
        PixelSize::Bits32 => Color::from_rgba8888(fill_color),
        PixelSize::Bits16 => Color::from_rgba5551((fill_color >> 16) as u16),
        PixelSize::Bits4 | PixelSize::Bits8 => {
            let intensity = (fill_color >> 24) as u8;
            Color::rgba(intensity, intensity, intensity, intensity)
        }
    }
}
