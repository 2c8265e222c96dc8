//! Frame buffer session: the public interface the renderer drives


use crate::buffer::{self, BufferId, BufferRequest, VirtualBuffer};
use crate::depth::{DepthBuffer, DepthBufferId, DepthBufferList};
use crate::host::{
    self, GraphicsApi, GraphicsError, Host, RenderState, SurfaceId, TextureCache, VideoState,
};
use crate::registry::{BufferRegistry, FrameBufferInfo};
use crate::sync::SyncContext;
use crate::sync::color::ColorReadback;
use crate::sync::depth::DepthReadback;
use crate::sync::upload::GuestUpload;
use thiserror::Error;
use vbuf_common::GuestMemory;
use vbuf_config::{CopyToGuestMode, FrameBufferConfig, GameHacks};

#[derive(Debug, Error)]
pub enum FrameBufferError {
    #[error("Host graphics error: {0}")]
    Graphics(#[from] GraphicsError),
}

pub type FrameBufferResult<T> = Result<T, FrameBufferError>;

/// Score overlay buffer addresses (PAL, NTSC, Japan), two per region.
const SCOREBOARD_PAL: [u32; 2] = [0x13B480, 0x26A530];
const SCOREBOARD_NTSC: [u32; 2] = [0x13BA50, 0x264430];
const SCOREBOARD_JAPAN: [u32; 2] = [0x134080, 0x1332F8];

/// Offset into the score overlay buffer at which guest pixels are pushed after it is created.
const SCOREBOARD_PUSH_OFFSET: u32 = 4;

fn is_scoreboard(hacks: GameHacks, video: &VideoState, address: u32) -> bool {
    if hacks.scoreboard {
        let addresses = if video.pal { SCOREBOARD_PAL } else { SCOREBOARD_NTSC };
        return addresses.contains(&address);
    }

    hacks.scoreboard_japan && SCOREBOARD_JAPAN.contains(&address)
}

#[derive(Debug)]
struct SyncEngines {
    color: ColorReadback,
    depth: DepthReadback,
    upload: GuestUpload,
}

impl SyncEngines {
    fn new<G: GraphicsApi, T: TextureCache>(host: &mut Host<G, T>) -> Result<Self, GraphicsError> {
        let color = ColorReadback::new(host)?;
        let depth = match DepthReadback::new(host) {
            Ok(depth) => depth,
            Err(err) => {
                color.destroy(host);
                return Err(err);
            }
        };
        let upload = match GuestUpload::new(host) {
            Ok(upload) => upload,
            Err(err) => {
                color.destroy(host);
                depth.destroy(host);
                return Err(err);
            }
        };

        Ok(Self { color, depth, upload })
    }

    fn destroy<G: GraphicsApi, T: TextureCache>(self, host: &mut Host<G, T>) {
        self.color.destroy(host);
        self.depth.destroy(host);
        self.upload.destroy(host);
    }
}

/// Owns every cached buffer and the resources used to keep them in sync with guest memory.
///
/// Guest memory is passed into each call that reads or writes it rather than held by the
/// session, so the CPU core remains its owner.
#[derive(Debug)]
pub struct FrameBufferSession<G, T> {
    config: FrameBufferConfig,
    host: Host<G, T>,
    registry: BufferRegistry,
    depth_buffers: DepthBufferList,
    engines: Option<SyncEngines>,
    video: VideoState,
    render: RenderState,
    frame_buffer_info_supported: bool,
}

impl<G: GraphicsApi, T: TextureCache> FrameBufferSession<G, T> {
    /// # Errors
    ///
    /// Returns an error if the host cannot allocate the staging surfaces or transfer buffers.
    pub fn new(config: FrameBufferConfig, mut host: Host<G, T>) -> FrameBufferResult<Self> {
        let engines = if config.enabled { Some(SyncEngines::new(&mut host)?) } else { None };

        log::info!(
            "Initialized frame buffer session (emulation {}, copy to guest: {})",
            if config.enabled { "enabled" } else { "disabled" },
            config.copy_to_guest
        );

        Ok(Self {
            config,
            host,
            registry: BufferRegistry::new(),
            depth_buffers: DepthBufferList::new(),
            engines,
            video: VideoState::default(),
            render: RenderState::default(),
            frame_buffer_info_supported: false,
        })
    }

    /// Apply new settings. Sync resources are allocated or released when emulation is toggled;
    /// buffers created under a different scale are recreated on their next use.
    ///
    /// # Errors
    ///
    /// Returns an error if enabling emulation fails to allocate sync resources.
    pub fn reload_config(&mut self, config: FrameBufferConfig) -> FrameBufferResult<()> {
        match (config.enabled, self.engines.take()) {
            (true, Some(engines)) => self.engines = Some(engines),
            (true, None) => self.engines = Some(SyncEngines::new(&mut self.host)?),
            (false, Some(engines)) => engines.destroy(&mut self.host),
            (false, None) => {}
        }

        self.config = config;
        log::info!("Reloaded frame buffer config: {config:?}");

        Ok(())
    }

    #[must_use]
    pub fn config(&self) -> &FrameBufferConfig {
        &self.config
    }

    #[must_use]
    pub fn host(&self) -> &Host<G, T> {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut Host<G, T> {
        &mut self.host
    }

    #[must_use]
    pub fn registry(&self) -> &BufferRegistry {
        &self.registry
    }

    #[must_use]
    pub fn depth_buffers(&self) -> &DepthBufferList {
        &self.depth_buffers
    }

    #[must_use]
    pub fn video(&self) -> &VideoState {
        &self.video
    }

    pub fn set_video_state(&mut self, video: VideoState) {
        self.video = video;
    }

    #[must_use]
    pub fn render_state(&self) -> &RenderState {
        &self.render
    }

    pub fn set_render_state(&mut self, render: RenderState) {
        self.render = render;
    }

    fn sync_parts<'a>(
        &'a mut self,
        memory: &'a mut GuestMemory,
    ) -> Option<(&'a mut SyncEngines, SyncContext<'a, G, T>)> {
        let engines = self.engines.as_mut()?;
        let ctx = SyncContext {
            host: &mut self.host,
            registry: &mut self.registry,
            depth_buffers: &mut self.depth_buffers,
            memory,
            video: &self.video,
            config: &self.config,
        };
        Some((engines, ctx))
    }

    /// The guest pointed the renderer at a new color image. Finds or creates the buffer backing
    /// it and binds it as the render target. Returns `None` if there is nothing to render into
    /// yet.
    ///
    /// # Errors
    ///
    /// Returns an error if a new buffer's host surfaces cannot be allocated. The registry is
    /// left without a bound buffer in that case.
    pub fn save_buffer(
        &mut self,
        memory: &mut GuestMemory,
        request: &BufferRequest,
    ) -> FrameBufferResult<Option<BufferId>> {
        self.flush_auxiliary(memory);

        if !self.video.is_configured() || request.width == 0 || request.height == 0 {
            log::debug!(
                "Unbinding: {}x{} image at {:06X} with display width {}",
                request.width,
                request.height,
                request.address,
                self.video.width
            );
            self.registry.unbind(&mut self.host);
            return Ok(None);
        }

        self.retire_current(memory);

        let scale = self
            .config
            .buffer_scale(request.width != self.video.width, self.video.display_scale());
        let id = match self.find_reusable(request, scale) {
            Some(id) => {
                self.reuse(memory, id, request);
                id
            }
            None => self.create(memory, request, scale)?,
        };

        self.attach_depth(id, request)?;

        if let Some(buffer) = self.registry.get_mut(id) {
            buffer.is_depth_buffer = request.address == self.render.depth_image_address;
            buffer.capture.captured_offscreen = false;
            buffer.capture.pause_screen = false;
            buffer.capture.post_processed = 0;
        }

        Ok(Some(id))
    }

    /// Write the bound buffer to guest memory and drop it if it is an auxiliary image that the
    /// config wants preserved in guest memory.
    fn flush_auxiliary(&mut self, memory: &mut GuestMemory) {
        if !self.config.copy_auxiliary_to_guest {
            return;
        }

        let Some(current) = self.registry.current_buffer() else { return };
        if !current.is_auxiliary(&self.video) {
            return;
        }

        let address = current.start_address;
        log::debug!("Flushing auxiliary buffer at {address:06X} before switching buffers");
        if let Some((engines, mut ctx)) = self.sync_parts(memory) {
            engines.color.copy_to_guest(&mut ctx, address, true);
        }
        self.registry.remove_buffer(&mut self.host, address);
    }

    /// Settle the bound buffer's final extent before switching away from it.
    fn retire_current(&mut self, memory: &mut GuestMemory) {
        let Some(current) = self.registry.current_buffer() else { return };
        let auxiliary = current.is_auxiliary(&self.video);
        let needs_height_correction = current.needs_height_correction;

        let reported = self.render.color_image_height;
        let height = if auxiliary {
            reported
        } else {
            self.registry.effective_color_image_height(reported, &self.video)
        };

        let hacks = self.config.hacks;
        let copy_auxiliary = self.config.copy_auxiliary_to_guest;
        let limit = memory.limit();
        let Some(current) = self.registry.current_buffer_mut() else { return };

        if height != 0 && (!auxiliary || needs_height_correction) {
            let (start, pixel_size, width) =
                (current.start_address, current.pixel_size, current.width);
            let end = buffer::end_address(start, pixel_size, width, height);
            current.end_address = end.min(limit).max(current.start_address);
        }

        let eligible = !is_scoreboard(hacks, &self.video, current.start_address)
            && !current.is_depth_buffer
            && !current.sync.copied_to_guest
            && !current.capture.from_guest
            && !current.validity.is_cleared()
            && !current.validity.has_snapshot()
            && height > 1;
        if eligible {
            current.capture_validity(memory, &self.video, copy_auxiliary);
        }

        let (start, end, width) = (current.start_address, current.end_address, current.width);
        if self.registry.find_or_resolve(&mut self.host, start, end, width).is_none() {
            self.registry.unbind(&mut self.host);
        }
    }

    /// Existing buffer that can back `request`, evicting one that contains the address but
    /// cannot be reused.
    fn find_reusable(&mut self, request: &BufferRequest, scale: (f32, f32)) -> Option<BufferId> {
        let candidate = match self.registry.current_buffer() {
            Some(current)
                if current.start_address == request.address && current.width == request.width =>
            {
                current
            }
            _ => self.registry.find_by_address(request.address)?,
        };

        if candidate.start_address == request.address
            && candidate.width == request.width
            && candidate.scale == scale
            && candidate.pixel_size == request.pixel_size
        {
            return Some(candidate.id);
        }

        log::debug!(
            "Buffer at {:06X} ({}x{} {}, scale {:?}) cannot back {}x{} {} image at {:06X}",
            candidate.start_address,
            candidate.width,
            candidate.height,
            candidate.pixel_size,
            candidate.scale,
            request.width,
            request.height,
            request.pixel_size,
            request.address
        );
        let address = candidate.start_address;
        self.registry.remove_buffer(&mut self.host, address);
        None
    }

    fn reuse(&mut self, memory: &mut GuestMemory, id: BufferId, request: &BufferRequest) {
        self.registry.bind(&mut self.host, id);

        let fill_color = self.render.fill_color;
        let copy_auxiliary = self.config.copy_auxiliary_to_guest;
        let Some(buffer) = self.registry.get_mut(id) else { return };
        buffer.mark_rendered();

        if buffer.format != request.format {
            log::debug!(
                "Buffer at {:06X} changed format from {:?} to {:?}",
                buffer.start_address,
                buffer.format,
                request.format
            );
            let color = host::fill_color_to_host(fill_color, buffer.pixel_size);
            self.host.gfx.clear_color(buffer.surface(), color);
            buffer.set_format(&mut self.host.textures, request.format);
            if buffer.sync.copied_to_guest {
                buffer.capture_validity(memory, &self.video, copy_auxiliary);
            }
        }

        log::trace!("Reusing buffer {id:?} at {:06X}", request.address);
    }

    fn create(
        &mut self,
        memory: &mut GuestMemory,
        request: &BufferRequest,
        scale: (f32, f32),
    ) -> FrameBufferResult<BufferId> {
        self.registry.evict_overlapping(&mut self.host, request.address, request.end_address());

        let id = self.registry.next_id();
        let buffer = match VirtualBuffer::create(
            &mut self.host,
            id,
            request,
            scale,
            self.config.multisampling,
            &self.video,
        ) {
            Ok(buffer) => buffer,
            Err(err) => {
                log::warn!(
                    "Unable to allocate {}x{} buffer at {:06X}: {err}",
                    request.width,
                    request.height,
                    request.address
                );
                self.registry.unbind(&mut self.host);
                return Err(err.into());
            }
        };

        log::debug!(
            "Created {}x{} {} buffer at {:06X}-{:06X}",
            request.width,
            request.height,
            request.pixel_size,
            request.address,
            request.end_address()
        );

        self.registry.push_front(buffer);
        self.registry.bind(&mut self.host, id);

        if is_scoreboard(self.config.hacks, &self.video, request.address) {
            let address = request.address.saturating_add(SCOREBOARD_PUSH_OFFSET);
            self.push_from_guest(memory, address, false);
        }

        Ok(id)
    }

    /// Link the bound buffer with the current depth image, or register a new depth image if the
    /// buffer is itself the depth image.
    fn attach_depth(&mut self, id: BufferId, request: &BufferRequest) -> FrameBufferResult<()> {
        if request.address == self.render.depth_image_address {
            let (_, replaced) =
                self.depth_buffers.save_buffer(&mut self.host, request.address, request.width);
            if let Some(replaced) = replaced {
                self.unlink_depth(replaced);
            }
            if let Some(buffer) = self.registry.get_mut(id) {
                buffer.depth_partner = None;
                let surface = buffer.surface();
                self.host.gfx.attach_depth(surface, None);
            }
            return Ok(());
        }

        let Some(buffer) = self.registry.get(id) else { return Ok(()) };
        let (surface, extent) = (buffer.surface(), buffer.extent());

        let mut partner = None;
        if let Some(depth_id) = self.depth_buffers.current() {
            let depth_extent = self.depth_buffers.prepare_for(
                &mut self.host,
                depth_id,
                extent,
                self.config.multisampling,
            )?;
            if depth_extent.is_some_and(|depth_extent| depth_extent.width >= extent.width) {
                partner = Some(depth_id);
            }
        }

        let depth_surface = partner
            .and_then(|depth_id| self.depth_buffers.get(depth_id))
            .and_then(DepthBuffer::surface);
        self.host.gfx.attach_depth(surface, depth_surface);
        if let Some(buffer) = self.registry.get_mut(id) {
            buffer.depth_partner = partner;
        }

        Ok(())
    }

    /// Per-frame write-back of the buffer containing `address`, as configured.
    pub fn copy_frame_to_guest(&mut self, memory: &mut GuestMemory, address: u32) -> bool {
        let mut copied = match self.config.copy_to_guest {
            CopyToGuestMode::Disabled => false,
            CopyToGuestMode::Sync => self.copy_to_guest(memory, address, true),
            CopyToGuestMode::DoubleBuffered => self.copy_to_guest(memory, address, false),
        };

        if self.config.copy_depth_to_guest {
            copied |= self.copy_depth_buffer_to_guest(memory, address);
        }

        copied
    }

    /// Write the buffer containing `address` to guest memory. Without `sync` the pixels written
    /// are those requested by the previous unsynchronized call.
    pub fn copy_to_guest(&mut self, memory: &mut GuestMemory, address: u32, sync: bool) -> bool {
        let Some((engines, mut ctx)) = self.sync_parts(memory) else { return false };
        engines.color.copy_to_guest(&mut ctx, address, sync)
    }

    pub fn copy_chunk_to_guest(&mut self, memory: &mut GuestMemory, address: u32) -> bool {
        let Some((engines, mut ctx)) = self.sync_parts(memory) else { return false };
        engines.color.copy_chunk_to_guest(&mut ctx, address)
    }

    /// Write the depth image paired with the buffer containing `address` to guest memory. A
    /// designated copy buffer takes precedence: its colors are written instead and the
    /// designation is cleared.
    pub fn copy_depth_buffer_to_guest(&mut self, memory: &mut GuestMemory, address: u32) -> bool {
        let Some((engines, mut ctx)) = self.sync_parts(memory) else { return false };

        let copy_buffer = ctx.registry.copy_buffer().and_then(|id| ctx.registry.get(id));
        let Some(copy_start) = copy_buffer.map(VirtualBuffer::start_address) else {
            return engines.depth.copy_to_guest(&mut ctx, address);
        };

        log::debug!("Writing copy buffer at {copy_start:06X} in place of depth");
        engines.color.copy_to_guest(&mut ctx, copy_start, true);
        // The guest may keep changing this memory, so stop comparing against it
        if let Some(buffer) = ctx.registry.find_by_address_mut(copy_start) {
            buffer.validity.discard();
        }
        ctx.registry.set_copy_buffer(None);

        true
    }

    pub fn copy_depth_chunk_to_guest(&mut self, memory: &mut GuestMemory, address: u32) -> bool {
        let Some((engines, mut ctx)) = self.sync_parts(memory) else { return false };
        engines.depth.copy_chunk_to_guest(&mut ctx, address)
    }

    /// Flush every buffer that matches neither display dimension to guest memory.
    pub fn copy_auxiliary(&mut self, memory: &mut GuestMemory) -> usize {
        let (width, height) = (self.video.width, self.video.height);
        let addresses: Vec<_> = self
            .registry
            .iter()
            .filter(|buffer| buffer.width != width && buffer.height != height)
            .map(VirtualBuffer::start_address)
            .collect();

        let Some((engines, mut ctx)) = self.sync_parts(memory) else { return 0 };
        addresses
            .into_iter()
            .filter(|&address| engines.color.copy_to_guest(&mut ctx, address, true))
            .count()
    }

    /// Record a guest CPU write of `size` bytes to a buffer's memory.
    pub fn add_address(&mut self, address: u32, size: u32) {
        if let Some(engines) = &mut self.engines {
            engines.upload.add_address(&mut self.registry, address, size);
        }
    }

    /// Push guest pixels into the buffer containing `address`. See [`Self::add_address`].
    ///
    /// Pixels are drawn over the buffer with source-over blending, so translucent guest pixels mix
    /// with what the host rendered. Set `opaque` for a refresh that must replace the color values
    /// exactly; it forces every pushed pixel to full alpha.
    pub fn copy_from_guest(
        &mut self,
        memory: &mut GuestMemory,
        address: u32,
        opaque: bool,
    ) -> bool {
        self.push_from_guest(memory, address, opaque)
    }

    fn push_from_guest(&mut self, memory: &mut GuestMemory, address: u32, opaque: bool) -> bool {
        let frame_buffer_info_supported = self.frame_buffer_info_supported;
        let Some((engines, mut ctx)) = self.sync_parts(memory) else { return false };
        engines.upload.copy_from_guest(&mut ctx, address, opaque, frame_buffer_info_supported)
    }

    pub fn remove_buffer(&mut self, address: u32) -> bool {
        self.registry.remove_buffer(&mut self.host, address)
    }

    pub fn remove_buffers(&mut self, width: u32) -> usize {
        self.registry.remove_buffers(&mut self.host, width)
    }

    pub fn remove_auxiliary(&mut self) -> usize {
        self.registry.remove_auxiliary(&mut self.host, &self.video)
    }

    /// Resize a bound buffer whose height was guessed at creation, once the guest sets a scissor
    /// that reveals its real height. Buffers already drawn to keep their height.
    ///
    /// # Errors
    ///
    /// Returns an error if the resized surfaces cannot be allocated.
    pub fn correct_height(
        &mut self,
        memory: &mut GuestMemory,
        scissor_lrx: u32,
        scissor_lry: u32,
    ) -> FrameBufferResult<()> {
        let Some(buffer) = self.registry.current_buffer_mut() else { return Ok(()) };
        if buffer.sync.changed {
            buffer.needs_height_correction = false;
            return Ok(());
        }
        if !buffer.needs_height_correction || buffer.width != scissor_lrx {
            return Ok(());
        }

        buffer.needs_height_correction = false;
        if buffer.height == scissor_lry {
            return Ok(());
        }

        log::debug!(
            "Correcting height of buffer at {:06X} from {} to {scissor_lry}",
            buffer.start_address,
            buffer.height
        );
        buffer.reinit(&mut self.host, scissor_lry)?;

        let (id, start, end, width) =
            (buffer.id, buffer.start_address, buffer.end_address, buffer.width);
        self.registry.find_or_resolve(&mut self.host, start, end, width);
        self.registry.bind(&mut self.host, id);

        if is_scoreboard(self.config.hacks, &self.video, start) {
            let address = start.saturating_add(SCOREBOARD_PUSH_OFFSET);
            self.push_from_guest(memory, address, false);
        }

        Ok(())
    }

    /// The bound buffer has been rendered to.
    pub fn set_buffer_changed(&mut self) {
        self.registry.set_buffer_changed();
    }

    /// Start of a frame displaying the image at `origin`.
    pub fn clear_buffers_changed(&mut self, origin: u32) {
        self.registry.clear_buffers_changed(origin);
    }

    /// Describe up to `max` displayable buffers. Frontends that use this take over pushing guest
    /// writes, so implicit pushes are disabled from then on.
    pub fn frame_buffer_info(&mut self, max: usize) -> Vec<FrameBufferInfo> {
        self.frame_buffer_info_supported = true;
        self.registry.frame_buffer_info(&self.video, max)
    }

    /// Whether guest memory under the buffer containing `address` still matches the cached
    /// buffer, so that the buffer can be sampled in place of guest memory.
    pub fn is_buffer_valid(&mut self, memory: &GuestMemory, address: u32) -> bool {
        let frame = self.video.swap_count;
        let Some(buffer) = self.registry.find_by_address_mut(address) else { return false };
        let (start, end) = (buffer.start_address, buffer.end_address);
        buffer.validity.check(start, end, memory, frame)
    }

    /// Single-sampled surface to sample the buffer containing `address` from. Multisampled
    /// buffers are resolved if they were rendered to since the last resolve, or always with
    /// `force`.
    pub fn buffer_texture(&mut self, address: u32, force: bool) -> Option<SurfaceId> {
        let buffer = self.registry.find_by_address_mut(address)?;
        Some(buffer.sampling_surface(&mut self.host.gfx, force))
    }

    /// Designate the bound buffer to be written to guest memory by the next depth copy.
    pub fn set_copy_buffer(&mut self) -> bool {
        let current = self.registry.current();
        self.registry.set_copy_buffer(current);
        current.is_some()
    }

    /// The guest pointed the renderer at a new depth image.
    pub fn set_depth_image(&mut self, address: u32) {
        self.render.depth_image_address = address;

        let width = self.registry.current_buffer().map_or(self.video.width, VirtualBuffer::width);
        if width == 0 {
            return;
        }

        let (_, replaced) = self.depth_buffers.save_buffer(&mut self.host, address, width);
        if let Some(replaced) = replaced {
            self.unlink_depth(replaced);
        }
    }

    /// Destroy the depth image at `address`, unlinking every buffer paired with it.
    pub fn remove_depth_buffer(&mut self, address: u32) -> bool {
        let Some(id) = self.depth_buffers.remove(&mut self.host, address) else { return false };
        self.unlink_depth(id);
        true
    }

    /// Detach a destroyed depth image from every buffer paired with it.
    fn unlink_depth(&mut self, id: DepthBufferId) {
        let paired: Vec<_> = self
            .registry
            .iter()
            .filter(|buffer| buffer.depth_partner == Some(id))
            .map(VirtualBuffer::surface)
            .collect();
        for surface in paired {
            self.host.gfx.attach_depth(surface, None);
        }
        self.registry.clear_depth_partner(id);
    }

    /// The bound buffer was filled with a solid color.
    pub fn mark_cleared(&mut self, fill_color: u32) {
        if let Some(buffer) = self.registry.current_buffer_mut() {
            buffer.validity.mark_cleared(fill_color);
        }
    }

    /// The bound buffer was drawn to with something other than a solid fill.
    pub fn mark_drawn(&mut self) {
        if let Some(buffer) = self.registry.current_buffer_mut() {
            buffer.validity.mark_drawn();
        }
    }

    /// The depth image at `address` was cleared down to row `lry`.
    pub fn mark_depth_cleared(&mut self, address: u32, lry: u32) -> bool {
        self.depth_buffers.mark_cleared(address, lry)
    }

    /// Release every host resource the session holds and hand the host collaborators back.
    pub fn destroy(mut self) -> Host<G, T> {
        self.registry.destroy(&mut self.host);
        self.depth_buffers.destroy(&mut self.host);
        if let Some(engines) = self.engines.take() {
            engines.destroy(&mut self.host);
        }

        log::info!("Destroyed frame buffer session");

        self.host
    }
}
