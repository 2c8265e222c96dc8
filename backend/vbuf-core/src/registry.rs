//! The set of live virtual buffers, most recently created first

#[cfg(test)]
mod tests;

use crate::buffer::{BufferId, VirtualBuffer};
use crate::depth::DepthBufferId;
use crate::host::{GraphicsApi, Host, TextureCache, VideoState};
use std::collections::VecDeque;
use vbuf_common::PixelSize;

/// Color image heights above this are remembered for frames that do not report one.
const MIN_REMEMBERED_HEIGHT: u32 = 200;

/// Buffer description handed to frontends that query the cache directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameBufferInfo {
    pub address: u32,
    pub width: u32,
    pub height: u32,
    pub pixel_size: PixelSize,
}

#[derive(Debug, Default)]
pub struct BufferRegistry {
    buffers: VecDeque<VirtualBuffer>,
    current: Option<BufferId>,
    copy_buffer: Option<BufferId>,
    next_id: u64,
    prev_color_image_height: u32,
    color_image_changed: bool,
}

impl BufferRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VirtualBuffer> {
        self.buffers.iter()
    }

    #[must_use]
    pub fn get(&self, id: BufferId) -> Option<&VirtualBuffer> {
        self.buffers.iter().find(|buffer| buffer.id == id)
    }

    pub fn get_mut(&mut self, id: BufferId) -> Option<&mut VirtualBuffer> {
        self.buffers.iter_mut().find(|buffer| buffer.id == id)
    }

    /// The buffer guest draws currently render into.
    #[must_use]
    pub fn current(&self) -> Option<BufferId> {
        self.current
    }

    #[must_use]
    pub fn current_buffer(&self) -> Option<&VirtualBuffer> {
        self.current.and_then(|id| self.get(id))
    }

    pub fn current_buffer_mut(&mut self) -> Option<&mut VirtualBuffer> {
        let id = self.current?;
        self.get_mut(id)
    }

    #[must_use]
    pub fn copy_buffer(&self) -> Option<BufferId> {
        self.copy_buffer
    }

    pub(crate) fn set_copy_buffer(&mut self, id: Option<BufferId>) {
        self.copy_buffer = id;
    }

    #[must_use]
    pub fn color_image_changed(&self) -> bool {
        self.color_image_changed
    }

    pub(crate) fn set_color_image_changed(&mut self, changed: bool) {
        self.color_image_changed = changed;
    }

    /// First buffer whose guest range contains `address`.
    #[must_use]
    pub fn find_by_address(&self, address: u32) -> Option<&VirtualBuffer> {
        self.buffers.iter().find(|buffer| buffer.contains(address))
    }

    pub fn find_by_address_mut(&mut self, address: u32) -> Option<&mut VirtualBuffer> {
        self.buffers.iter_mut().find(|buffer| buffer.contains(address))
    }

    /// First buffer whose guest range does not contain `address`, usable as scratch space while
    /// the buffer at `address` is read.
    #[must_use]
    pub fn find_temporary(&self, address: u32) -> Option<&VirtualBuffer> {
        self.buffers.iter().find(|buffer| !buffer.contains(address))
    }

    pub(crate) fn next_id(&mut self) -> BufferId {
        let id = BufferId(self.next_id);
        self.next_id += 1;
        id
    }

    pub(crate) fn push_front(&mut self, buffer: VirtualBuffer) -> BufferId {
        let id = buffer.id;
        self.buffers.push_front(buffer);
        id
    }

    /// Resolve `[start, end]` against the live buffers. Every buffer whose range overlaps the
    /// query is evicted unless it starts at `start` with the same `width`, in which case it is
    /// returned as a match.
    pub(crate) fn find_or_resolve<G: GraphicsApi, T: TextureCache>(
        &mut self,
        host: &mut Host<G, T>,
        start: u32,
        end: u32,
        width: u32,
    ) -> Option<BufferId> {
        let mut matched = None;
        let mut index = 0;
        while index < self.buffers.len() {
            let buffer = &self.buffers[index];
            let conflicts = buffer.contains(start)
                || (start <= buffer.start_address && end >= buffer.start_address);
            if !conflicts {
                index += 1;
                continue;
            }

            if matched.is_none() && buffer.start_address == start && buffer.width == width {
                matched = Some(buffer.id);
                index += 1;
            } else {
                log::debug!(
                    "Evicting buffer at {:06X}-{:06X} (width {}) overlapping {start:06X}-{end:06X} (width {width})",
                    buffer.start_address,
                    buffer.end_address,
                    buffer.width
                );
                self.evict_at(host, index);
            }
        }

        matched
    }

    /// Evict every buffer overlapping `[start, end]`.
    pub(crate) fn evict_overlapping<G: GraphicsApi, T: TextureCache>(
        &mut self,
        host: &mut Host<G, T>,
        start: u32,
        end: u32,
    ) {
        while let Some(index) = self.buffers.iter().position(|buffer| {
            buffer.contains(start) || (start <= buffer.start_address && end >= buffer.start_address)
        }) {
            self.evict_at(host, index);
        }
    }

    /// Remove the buffer starting at `address`. Returns whether one was found.
    pub fn remove_buffer<G: GraphicsApi, T: TextureCache>(
        &mut self,
        host: &mut Host<G, T>,
        address: u32,
    ) -> bool {
        match self.buffers.iter().position(|buffer| buffer.start_address == address) {
            Some(index) => {
                self.evict_at(host, index);
                true
            }
            None => false,
        }
    }

    /// Remove every buffer of the given width. Also releases the current buffer binding.
    pub fn remove_buffers<G: GraphicsApi, T: TextureCache>(
        &mut self,
        host: &mut Host<G, T>,
        width: u32,
    ) -> usize {
        self.current = None;
        self.remove_where(host, |buffer| buffer.width == width)
    }

    /// Remove every buffer matching neither the display width nor the display height.
    pub fn remove_auxiliary<G: GraphicsApi, T: TextureCache>(
        &mut self,
        host: &mut Host<G, T>,
        video: &VideoState,
    ) -> usize {
        self.remove_where(host, |buffer| {
            buffer.width != video.width && buffer.height != video.height
        })
    }

    fn remove_where<G: GraphicsApi, T: TextureCache>(
        &mut self,
        host: &mut Host<G, T>,
        predicate: impl Fn(&VirtualBuffer) -> bool,
    ) -> usize {
        let mut removed = 0;
        while let Some(index) = self.buffers.iter().position(&predicate) {
            self.evict_at(host, index);
            removed += 1;
        }
        removed
    }

    fn evict_at<G: GraphicsApi, T: TextureCache>(&mut self, host: &mut Host<G, T>, index: usize) {
        let Some(buffer) = self.buffers.remove(index) else { return };

        if self.current == Some(buffer.id) {
            self.unbind(host);
        }
        if self.copy_buffer == Some(buffer.id) {
            self.copy_buffer = None;
        }

        buffer.destroy(host);
    }

    pub(crate) fn bind<G: GraphicsApi, T: TextureCache>(
        &mut self,
        host: &mut Host<G, T>,
        id: BufferId,
    ) {
        let Some(surface) = self.get(id).map(VirtualBuffer::surface) else { return };
        host.gfx.bind_render_target(Some(surface));
        self.current = Some(id);
    }

    pub(crate) fn unbind<G: GraphicsApi, T: TextureCache>(&mut self, host: &mut Host<G, T>) {
        host.gfx.bind_render_target(None);
        self.current = None;
    }

    /// Color image height to use for the current buffer, substituting the last large height for
    /// frames that report 0.
    pub(crate) fn effective_color_image_height(
        &mut self,
        reported: u32,
        video: &VideoState,
    ) -> u32 {
        let height = if reported > MIN_REMEMBERED_HEIGHT {
            self.prev_color_image_height = reported;
            reported
        } else if reported == 0 {
            self.prev_color_image_height
        } else {
            reported
        };

        height.min(video.height)
    }

    /// Drop every link to a depth buffer that no longer exists.
    pub(crate) fn clear_depth_partner(&mut self, depth: DepthBufferId) {
        for buffer in &mut self.buffers {
            if buffer.depth_partner == Some(depth) {
                buffer.depth_partner = None;
            }
        }
    }

    /// Mark the current buffer as rendered to since its contents were last synced.
    pub fn set_buffer_changed(&mut self) {
        self.color_image_changed = true;
        if let Some(buffer) = self.current_buffer_mut() {
            buffer.sync.changed = true;
            buffer.sync.copied_to_guest = false;
            buffer.mark_rendered();
        }
    }

    /// Start of frame: nothing has been rendered to the displayed buffer at `origin` yet.
    pub fn clear_buffers_changed(&mut self, origin: u32) {
        self.color_image_changed = false;
        if let Some(buffer) = self.find_by_address_mut(origin) {
            buffer.sync.changed = false;
        }
    }

    /// Displayable buffers that were rendered by the host, at most `max` of them.
    #[must_use]
    pub fn frame_buffer_info(&self, video: &VideoState, max: usize) -> Vec<FrameBufferInfo> {
        self.buffers
            .iter()
            .filter(|buffer| {
                buffer.width == video.width && !buffer.capture.from_guest && !buffer.is_depth_buffer
            })
            .take(max)
            .map(|buffer| FrameBufferInfo {
                address: buffer.start_address,
                width: buffer.width,
                height: buffer.height,
                pixel_size: buffer.pixel_size,
            })
            .collect()
    }

    pub(crate) fn destroy<G: GraphicsApi, T: TextureCache>(&mut self, host: &mut Host<G, T>) {
        self.unbind(host);
        self.copy_buffer = None;
        for buffer in self.buffers.drain(..) {
            buffer.destroy(host);
        }
    }
}
