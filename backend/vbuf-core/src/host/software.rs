//! CPU implementation of the host collaborators, used for headless runs and tests

use crate::host::{
    BlendMode, BlitAspect, BlitFilter, Extent, FrameBufferTexture, GraphicsApi, GraphicsError,
    Rect, SurfaceDescriptor, SurfaceFormat, SurfaceId, TextureCache, TextureHandle,
    TransferBufferId,
};
use rustc_hash::FxHashMap;
use vbuf_common::{Color, ImageFormat, PixelSize};

#[derive(Debug, Clone)]
struct SoftSurface {
    extent: Extent,
    format: SurfaceFormat,
    samples: u32,
    color: Vec<Color>,
    depth: Vec<f32>,
    depth_attachment: Option<SurfaceId>,
}

impl SoftSurface {
    fn index(&self, x: u32, y: u32) -> Option<usize> {
        (x < self.extent.width && y < self.extent.height)
            .then(|| (y * self.extent.width + x) as usize)
    }

    /// Bilinear sample of `rect` at pixel `(dx, dy)` of a destination span of size `dst`.
    /// Texel centers sit at half-integer coordinates and edges clamp to `rect`.
    fn sample_linear(&self, rect: Rect, (dx, dy): (u32, u32), dst: Extent) -> Color {
        let (x0, x1, fx) = linear_taps(dx, dst.width, rect.width);
        let (y0, y1, fy) = linear_taps(dy, dst.height, rect.height);
        let texel = |x: u32, y: u32| {
            self.index(rect.x + x, rect.y + y)
                .and_then(|i| self.color.get(i).copied())
                .unwrap_or_default()
        };
        let (c00, c10, c01, c11) = (texel(x0, y0), texel(x1, y0), texel(x0, y1), texel(x1, y1));

        let channel = |f: fn(Color) -> u8| {
            let bottom = lerp(f(c00), f(c10), fx);
            let top = lerp(f(c01), f(c11), fx);
            (bottom + (top - bottom) * fy).round() as u8
        };
        Color::rgba(channel(|c| c.r), channel(|c| c.g), channel(|c| c.b), channel(|c| c.a))
    }
}

/// Source texels on either side of destination coordinate `d`, and the weight of the second.
fn linear_taps(d: u32, dst_len: u32, src_len: u32) -> (u32, u32, f32) {
    let last = src_len.saturating_sub(1);
    let u = ((d as f32 + 0.5) * src_len as f32 / dst_len.max(1) as f32 - 0.5).max(0.0);
    let i0 = (u.floor() as u32).min(last);
    let i1 = (i0 + 1).min(last);
    (i0, i1, u - u.floor())
}

fn lerp(a: u8, b: u8, t: f32) -> f32 {
    f32::from(a) + (f32::from(b) - f32::from(a)) * t
}

/// Maps destination coordinate `d` in a span of `dst_len` onto a span of `src_len`.
fn nearest(d: u32, dst_len: u32, src_len: u32) -> u32 {
    ((u64::from(d) * u64::from(src_len)) / u64::from(dst_len.max(1))) as u32
}

fn blend_channel(src: u8, dst: u8, alpha: u8) -> u8 {
    let (s, d, a) = (u32::from(src), u32::from(dst), u32::from(alpha));
    ((s * a + d * (255 - a) + 127) / 255) as u8
}

fn source_over(src: Color, dst: Color) -> Color {
    Color::rgba(
        blend_channel(src.r, dst.r, src.a),
        blend_channel(src.g, dst.g, src.a),
        blend_channel(src.b, dst.b, src.a),
        blend_channel(src.a, dst.a, src.a),
    )
}

/// Surfaces are plain arrays with row 0 at the bottom. Pixel reads complete immediately, so a
/// transfer buffer can be mapped as soon as it has been written. Linear filtering applies to color
/// blits only; depth blits and textured draws always sample the nearest texel.
#[derive(Debug, Default)]
pub struct SoftwareGraphics {
    surfaces: FxHashMap<SurfaceId, SoftSurface>,
    transfer_buffers: FxHashMap<TransferBufferId, Vec<u8>>,
    next_surface: u32,
    next_transfer_buffer: u32,
    bound: Option<SurfaceId>,
    max_surface_pixels: Option<usize>,
    mapping_fails: bool,
}

impl SoftwareGraphics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every surface allocation larger than `pixels`.
    #[must_use]
    pub fn with_surface_limit(mut self, pixels: usize) -> Self {
        self.max_surface_pixels = Some(pixels);
        self
    }

    pub fn set_mapping_fails(&mut self, mapping_fails: bool) {
        self.mapping_fails = mapping_fails;
    }

    #[must_use]
    pub fn bound_target(&self) -> Option<SurfaceId> {
        self.bound
    }

    #[must_use]
    pub fn live_surfaces(&self) -> usize {
        self.surfaces.len()
    }

    #[must_use]
    pub fn live_transfer_buffers(&self) -> usize {
        self.transfer_buffers.len()
    }

    #[must_use]
    pub fn extent(&self, surface: SurfaceId) -> Option<Extent> {
        self.surfaces.get(&surface).map(|surface| surface.extent)
    }

    #[must_use]
    pub fn samples(&self, surface: SurfaceId) -> Option<u32> {
        self.surfaces.get(&surface).map(|surface| surface.samples)
    }

    #[must_use]
    pub fn depth_attachment(&self, surface: SurfaceId) -> Option<SurfaceId> {
        self.surfaces.get(&surface).and_then(|surface| surface.depth_attachment)
    }

    /// Color at `(x, y)`, with `y` counted from the bottom row.
    #[must_use]
    pub fn pixel(&self, surface: SurfaceId, x: u32, y: u32) -> Option<Color> {
        let surface = self.surfaces.get(&surface)?;
        surface.index(x, y).and_then(|i| surface.color.get(i).copied())
    }

    pub fn set_pixel(&mut self, surface: SurfaceId, x: u32, y: u32, color: Color) {
        let Some(surface) = self.surfaces.get_mut(&surface) else { return };
        if let Some(pixel) = surface.index(x, y).and_then(|i| surface.color.get_mut(i)) {
            *pixel = color;
        }
    }

    pub fn fill_depth(&mut self, surface: SurfaceId, mut f: impl FnMut(u32, u32) -> f32) {
        let Some(surface) = self.surfaces.get_mut(&surface) else { return };
        let width = surface.extent.width;
        for (i, depth) in surface.depth.iter_mut().enumerate() {
            let i = i as u32;
            *depth = f(i % width, i / width);
        }
    }

    fn copy_rect(
        &mut self,
        (src, src_rect): (SurfaceId, Rect),
        (dst, dst_rect): (SurfaceId, Rect),
        aspect: BlitAspect,
        filter: BlitFilter,
        blend: BlendMode,
    ) {
        // Snapshot the source so that src == dst does not alias
        let Some(source) = self.surfaces.get(&src).cloned() else { return };
        let Some(target) = self.surfaces.get_mut(&dst) else { return };

        for dy in 0..dst_rect.height {
            let sy = src_rect.y + nearest(dy, dst_rect.height, src_rect.height);
            for dx in 0..dst_rect.width {
                let sx = src_rect.x + nearest(dx, dst_rect.width, src_rect.width);
                let (Some(si), Some(di)) =
                    (source.index(sx, sy), target.index(dst_rect.x + dx, dst_rect.y + dy))
                else {
                    continue;
                };

                match aspect {
                    BlitAspect::Color => {
                        let s = match filter {
                            BlitFilter::Nearest => source.color.get(si).copied(),
                            BlitFilter::Linear => {
                                let dst_extent = Extent::new(dst_rect.width, dst_rect.height);
                                Some(source.sample_linear(src_rect, (dx, dy), dst_extent))
                            }
                        };
                        let (Some(s), Some(d)) = (s, target.color.get_mut(di)) else {
                            continue;
                        };
                        *d = match blend {
                            BlendMode::Replace => s,
                            BlendMode::SourceOver => source_over(s, *d),
                        };
                    }
                    BlitAspect::Depth => {
                        if let (Some(&s), Some(d)) = (source.depth.get(si), target.depth.get_mut(di))
                        {
                            *d = s;
                        }
                    }
                }
            }
        }
    }
}

impl GraphicsApi for SoftwareGraphics {
    fn create_surface(
        &mut self,
        _texture: TextureHandle,
        descriptor: &SurfaceDescriptor,
    ) -> Result<SurfaceId, GraphicsError> {
        let pixels = descriptor.extent.pixels();
        if pixels == 0 || self.max_surface_pixels.is_some_and(|max| pixels > max) {
            return Err(GraphicsError::SurfaceAllocation {
                width: descriptor.extent.width,
                height: descriptor.extent.height,
                format: descriptor.format,
                samples: descriptor.samples,
            });
        }

        let (color, depth) = match descriptor.format {
            SurfaceFormat::Rgba8 | SurfaceFormat::R8 => (vec![Color::TRANSPARENT; pixels], vec![]),
            SurfaceFormat::Depth32F => (vec![], vec![1.0; pixels]),
        };

        let id = SurfaceId(self.next_surface);
        self.next_surface += 1;
        self.surfaces.insert(
            id,
            SoftSurface {
                extent: descriptor.extent,
                format: descriptor.format,
                samples: descriptor.samples,
                color,
                depth,
                depth_attachment: None,
            },
        );

        Ok(id)
    }

    fn destroy_surface(&mut self, surface: SurfaceId) {
        self.surfaces.remove(&surface);
        if self.bound == Some(surface) {
            self.bound = None;
        }
    }

    fn attach_depth(&mut self, color: SurfaceId, depth: Option<SurfaceId>) {
        if let Some(surface) = self.surfaces.get_mut(&color) {
            surface.depth_attachment = depth;
        }
    }

    fn bind_render_target(&mut self, surface: Option<SurfaceId>) {
        self.bound = surface;
    }

    fn clear_color(&mut self, surface: SurfaceId, color: Color) {
        if let Some(surface) = self.surfaces.get_mut(&surface) {
            surface.color.fill(color);
        }
    }

    fn blit(
        &mut self,
        src: SurfaceId,
        src_rect: Rect,
        dst: SurfaceId,
        dst_rect: Rect,
        aspect: BlitAspect,
        filter: BlitFilter,
    ) {
        self.copy_rect((src, src_rect), (dst, dst_rect), aspect, filter, BlendMode::Replace);
    }

    fn create_transfer_buffer(&mut self, size: usize) -> Result<TransferBufferId, GraphicsError> {
        if size == 0 {
            return Err(GraphicsError::TransferBufferAllocation { size });
        }

        let id = TransferBufferId(self.next_transfer_buffer);
        self.next_transfer_buffer += 1;
        self.transfer_buffers.insert(id, vec![0; size]);

        Ok(id)
    }

    fn destroy_transfer_buffer(&mut self, buffer: TransferBufferId) {
        self.transfer_buffers.remove(&buffer);
    }

    fn read_pixels(
        &mut self,
        src: SurfaceId,
        rect: Rect,
        aspect: BlitAspect,
        dst: TransferBufferId,
    ) {
        let (Some(source), Some(buffer)) =
            (self.surfaces.get(&src), self.transfer_buffers.get_mut(&dst))
        else {
            return;
        };

        let bytes_per_pixel = match aspect {
            BlitAspect::Color => source.format.bytes_per_pixel(),
            BlitAspect::Depth => 4,
        };

        let pixels = (0..rect.height)
            .flat_map(|y| (0..rect.width).map(move |x| (rect.x + x, rect.y + y)));
        for ((x, y), out) in pixels.zip(buffer.chunks_exact_mut(bytes_per_pixel)) {
            let index = source.index(x, y);
            match aspect {
                BlitAspect::Color => {
                    let color =
                        index.and_then(|i| source.color.get(i).copied()).unwrap_or_default();
                    if bytes_per_pixel == 1 {
                        out[0] = color.r;
                    } else {
                        out.copy_from_slice(&[color.r, color.g, color.b, color.a]);
                    }
                }
                BlitAspect::Depth => {
                    let depth = index.and_then(|i| source.depth.get(i).copied()).unwrap_or(0.0);
                    out.copy_from_slice(&depth.to_le_bytes());
                }
            }
        }
    }

    fn map_transfer_buffer(&mut self, buffer: TransferBufferId, len: usize) -> Option<&[u8]> {
        if self.mapping_fails {
            return None;
        }

        self.transfer_buffers.get(&buffer).and_then(|buffer| buffer.get(..len))
    }

    fn upload(&mut self, dst: SurfaceId, rect: Rect, rgba: &[u8]) {
        let Some(surface) = self.surfaces.get_mut(&dst) else { return };

        let pixels = (0..rect.height)
            .flat_map(|y| (0..rect.width).map(move |x| (rect.x + x, rect.y + y)));
        for ((x, y), bytes) in pixels.zip(rgba.chunks_exact(4)) {
            if let Some(pixel) = surface.index(x, y).and_then(|i| surface.color.get_mut(i)) {
                *pixel = Color::rgba(bytes[0], bytes[1], bytes[2], bytes[3]);
            }
        }
    }

    fn draw_textured_rect(
        &mut self,
        src: SurfaceId,
        src_rect: Rect,
        dst: SurfaceId,
        dst_rect: Rect,
        blend: BlendMode,
    ) {
        let (aspect, filter) = (BlitAspect::Color, BlitFilter::Nearest);
        self.copy_rect((src, src_rect), (dst, dst_rect), aspect, filter, blend);
    }
}

/// Texture cache that only tracks handles and the memory budget they occupy.
#[derive(Debug, Default)]
pub struct CountingTextureCache {
    next_handle: u32,
    live: FxHashMap<TextureHandle, (FrameBufferTexture, usize)>,
    bytes_in_use: usize,
}

impl CountingTextureCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn live_textures(&self) -> usize {
        self.live.len()
    }

    #[must_use]
    pub fn bytes_in_use(&self) -> usize {
        self.bytes_in_use
    }

    #[must_use]
    pub fn texture(&self, handle: TextureHandle) -> Option<&FrameBufferTexture> {
        self.live.get(&handle).map(|(texture, _)| texture)
    }
}

impl TextureCache for CountingTextureCache {
    fn add_frame_buffer_texture(&mut self, texture: &FrameBufferTexture) -> TextureHandle {
        let handle = TextureHandle(self.next_handle);
        self.next_handle += 1;
        self.live.insert(handle, (*texture, texture.bytes));
        self.bytes_in_use += texture.bytes;
        handle
    }

    fn remove_frame_buffer_texture(&mut self, handle: TextureHandle, bytes: usize) {
        if self.live.remove(&handle).is_some() {
            self.bytes_in_use = self.bytes_in_use.saturating_sub(bytes);
        }
    }

    fn update_frame_buffer_texture(
        &mut self,
        handle: TextureHandle,
        format: ImageFormat,
        pixel_size: PixelSize,
    ) {
        if let Some((texture, _)) = self.live.get_mut(&handle) {
            texture.format = format;
            texture.pixel_size = pixel_size;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn descriptor(width: u32, height: u32) -> SurfaceDescriptor {
        SurfaceDescriptor {
            extent: Extent::new(width, height),
            format: SurfaceFormat::Rgba8,
            samples: 1,
        }
    }

    #[test]
    fn blit_scales_nearest() {
        let mut gfx = SoftwareGraphics::new();
        let src = gfx.create_surface(TextureHandle(0), &descriptor(2, 2)).unwrap();
        let dst = gfx.create_surface(TextureHandle(1), &descriptor(4, 4)).unwrap();

        let red = Color::rgba(255, 0, 0, 255);
        gfx.set_pixel(src, 1, 1, red);
        gfx.blit(
            src,
            Rect::new(0, 0, 2, 2),
            dst,
            Rect::new(0, 0, 4, 4),
            BlitAspect::Color,
            BlitFilter::Nearest,
        );

        assert_eq!(gfx.pixel(dst, 3, 3), Some(red));
        assert_eq!(gfx.pixel(dst, 2, 2), Some(red));
        assert_eq!(gfx.pixel(dst, 1, 1), Some(Color::TRANSPARENT));
    }

    #[test]
    fn linear_blit_averages_neighbouring_texels() {
        let mut gfx = SoftwareGraphics::new();
        let src = gfx.create_surface(TextureHandle(0), &descriptor(2, 1)).unwrap();
        let dst = gfx.create_surface(TextureHandle(1), &descriptor(1, 1)).unwrap();
        let point = gfx.create_surface(TextureHandle(2), &descriptor(1, 1)).unwrap();

        gfx.clear_color(src, Color::rgba(0, 0, 0, 255));
        gfx.set_pixel(src, 1, 0, Color::WHITE);
        for (target, filter) in [(dst, BlitFilter::Linear), (point, BlitFilter::Nearest)] {
            gfx.blit(
                src,
                Rect::new(0, 0, 2, 1),
                target,
                Rect::new(0, 0, 1, 1),
                BlitAspect::Color,
                filter,
            );
        }

        assert_eq!(gfx.pixel(dst, 0, 0), Some(Color::rgba(128, 128, 128, 255)));
        assert_eq!(gfx.pixel(point, 0, 0), Some(Color::rgba(0, 0, 0, 255)));
    }

    #[test]
    fn linear_blit_at_same_size_is_exact() {
        let mut gfx = SoftwareGraphics::new();
        let src = gfx.create_surface(TextureHandle(0), &descriptor(3, 2)).unwrap();
        let dst = gfx.create_surface(TextureHandle(1), &descriptor(3, 2)).unwrap();

        let colors = [Color::rgba(10, 20, 30, 255), Color::rgba(200, 100, 50, 128), Color::WHITE];
        for (x, &color) in (0..).zip(&colors) {
            gfx.set_pixel(src, x, 1, color);
        }
        gfx.blit(
            src,
            Rect::new(0, 0, 3, 2),
            dst,
            Rect::new(0, 0, 3, 2),
            BlitAspect::Color,
            BlitFilter::Linear,
        );

        for (x, &color) in (0..).zip(&colors) {
            assert_eq!(gfx.pixel(dst, x, 1), Some(color));
            assert_eq!(gfx.pixel(dst, x, 0), Some(Color::TRANSPARENT));
        }
    }

    #[test]
    fn source_over_keeps_destination_under_transparent_pixels() {
        let mut gfx = SoftwareGraphics::new();
        let src = gfx.create_surface(TextureHandle(0), &descriptor(2, 1)).unwrap();
        let dst = gfx.create_surface(TextureHandle(1), &descriptor(2, 1)).unwrap();

        let blue = Color::rgba(0, 0, 255, 255);
        gfx.clear_color(dst, blue);
        gfx.set_pixel(src, 1, 0, Color::WHITE);
        gfx.draw_textured_rect(
            src,
            Rect::new(0, 0, 2, 1),
            dst,
            Rect::new(0, 0, 2, 1),
            BlendMode::SourceOver,
        );

        assert_eq!(gfx.pixel(dst, 0, 0), Some(blue));
        assert_eq!(gfx.pixel(dst, 1, 0), Some(Color::WHITE));
    }

    #[test]
    fn read_pixels_packs_bottom_row_first() {
        let mut gfx = SoftwareGraphics::new();
        let src = gfx.create_surface(TextureHandle(0), &descriptor(1, 2)).unwrap();
        gfx.set_pixel(src, 0, 0, Color::rgba(1, 2, 3, 4));
        gfx.set_pixel(src, 0, 1, Color::rgba(5, 6, 7, 8));

        let transfer = gfx.create_transfer_buffer(8).unwrap();
        gfx.read_pixels(src, Rect::new(0, 0, 1, 2), BlitAspect::Color, transfer);

        assert_eq!(gfx.map_transfer_buffer(transfer, 8), Some(&[1, 2, 3, 4, 5, 6, 7, 8][..]));

        gfx.set_mapping_fails(true);
        assert_eq!(gfx.map_transfer_buffer(transfer, 8), None);
    }

    #[test]
    fn texture_budget_is_returned() {
        let mut textures = CountingTextureCache::new();
        let texture = FrameBufferTexture {
            address: 0x100,
            extent: Extent::new(4, 4),
            format: ImageFormat::Rgba,
            pixel_size: PixelSize::Bits16,
            bytes: 64,
        };

        let handle = textures.add_frame_buffer_texture(&texture);
        assert_eq!(textures.bytes_in_use(), 64);

        textures.remove_frame_buffer_texture(handle, 64);
        assert_eq!(textures.bytes_in_use(), 0);
        assert_eq!(textures.live_textures(), 0);
    }
}
