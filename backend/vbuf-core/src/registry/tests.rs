use super::*;
use crate::buffer::BufferRequest;
use crate::host::software::{CountingTextureCache, SoftwareGraphics};
use test_log::test;
use vbuf_common::ImageFormat;

type TestHost = Host<SoftwareGraphics, CountingTextureCache>;

fn new_host() -> TestHost {
    Host::new(SoftwareGraphics::new(), CountingTextureCache::new())
}

fn video() -> VideoState {
    VideoState {
        width: 100,
        height: 1,
        real_height: 1,
        width_register: 100,
        scale_x: 1.0,
        scale_y: 1.0,
        ..VideoState::default()
    }
}

fn insert(
    registry: &mut BufferRegistry,
    host: &mut TestHost,
    address: u32,
    width: u32,
    height: u32,
) -> BufferId {
    let request = BufferRequest {
        address,
        format: ImageFormat::Rgba,
        pixel_size: PixelSize::Bits8,
        width,
        height,
        from_guest: false,
    };
    let id = registry.next_id();
    let buffer = VirtualBuffer::create(host, id, &request, (1.0, 1.0), 0, &video()).unwrap();
    registry.push_front(buffer)
}

#[test]
fn find_by_address_prefers_newest() {
    let mut host = new_host();
    let mut registry = BufferRegistry::new();
    let old = insert(&mut registry, &mut host, 0x1000, 100, 1);
    let new = insert(&mut registry, &mut host, 0x2000, 100, 1);

    assert_eq!(registry.find_by_address(0x1063).map(VirtualBuffer::id), Some(old));
    assert_eq!(registry.find_by_address(0x2000).map(VirtualBuffer::id), Some(new));
    assert!(registry.find_by_address(0x1064).is_none());
    assert_eq!(registry.iter().next().map(VirtualBuffer::id), Some(new));
}

#[test]
fn exact_match_is_returned_without_eviction() {
    let mut host = new_host();
    let mut registry = BufferRegistry::new();
    let id = insert(&mut registry, &mut host, 0x1000, 100, 1);

    assert_eq!(registry.find_or_resolve(&mut host, 0x1000, 0x1063, 100), Some(id));
    assert_eq!(registry.len(), 1);
}

#[test]
fn conflicting_width_is_evicted() {
    let mut host = new_host();
    let mut registry = BufferRegistry::new();
    insert(&mut registry, &mut host, 0x1000, 100, 1);

    assert_eq!(registry.find_or_resolve(&mut host, 0x1000, 0x1031, 50), None);
    assert!(registry.is_empty());
    assert_eq!(host.gfx.live_surfaces(), 0);
    assert_eq!(host.textures.bytes_in_use(), 0);
}

#[test]
fn query_range_covering_buffer_start_evicts_it() {
    let mut host = new_host();
    let mut registry = BufferRegistry::new();
    insert(&mut registry, &mut host, 0x1050, 16, 1);
    let unrelated = insert(&mut registry, &mut host, 0x3000, 16, 1);

    assert_eq!(registry.find_or_resolve(&mut host, 0x1000, 0x10FF, 256), None);
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.iter().next().map(VirtualBuffer::id), Some(unrelated));
}

#[test]
fn every_conflict_is_evicted_in_one_call() {
    let mut host = new_host();
    let mut registry = BufferRegistry::new();
    for address in (0x1000..0x1100).step_by(0x20) {
        insert(&mut registry, &mut host, address, 0x10, 1);
    }
    let keep = insert(&mut registry, &mut host, 0x1200, 0x10, 1);

    registry.find_or_resolve(&mut host, 0x1000, 0x11FF, 0x200);
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.iter().next().map(VirtualBuffer::id), Some(keep));
}

#[test]
fn evicting_current_buffer_unbinds() {
    let mut host = new_host();
    let mut registry = BufferRegistry::new();
    let id = insert(&mut registry, &mut host, 0x1000, 100, 1);
    registry.bind(&mut host, id);
    registry.set_copy_buffer(Some(id));
    assert_eq!(host.gfx.bound_target(), registry.current_buffer().map(VirtualBuffer::surface));

    assert!(registry.remove_buffer(&mut host, 0x1000));
    assert_eq!(registry.current(), None);
    assert_eq!(registry.copy_buffer(), None);
    assert_eq!(host.gfx.bound_target(), None);
    assert!(!registry.remove_buffer(&mut host, 0x1000));
}

#[test]
fn remove_by_width_and_auxiliary() {
    let mut host = new_host();
    let mut registry = BufferRegistry::new();
    insert(&mut registry, &mut host, 0x1000, 100, 1);
    insert(&mut registry, &mut host, 0x2000, 64, 1);
    insert(&mut registry, &mut host, 0x3000, 64, 2);
    insert(&mut registry, &mut host, 0x4000, 32, 4);

    // Height 1 matches the display, so only the last two are auxiliary
    assert_eq!(registry.remove_auxiliary(&mut host, &video()), 2);
    assert_eq!(registry.remove_buffers(&mut host, 64), 1);
    assert_eq!(registry.len(), 1);
}

#[test]
fn find_temporary_skips_buffer_being_read() {
    let mut host = new_host();
    let mut registry = BufferRegistry::new();
    let other = insert(&mut registry, &mut host, 0x1000, 100, 1);
    insert(&mut registry, &mut host, 0x2000, 100, 1);

    assert_eq!(registry.find_temporary(0x2010).map(VirtualBuffer::id), Some(other));
}

#[test]
fn color_image_height_falls_back_to_last_large_height() {
    let mut registry = BufferRegistry::new();
    let video = VideoState { height: 240, ..video() };

    assert_eq!(registry.effective_color_image_height(0, &video), 0);
    assert_eq!(registry.effective_color_image_height(480, &video), 240);
    assert_eq!(registry.effective_color_image_height(0, &video), 240);
    assert_eq!(registry.effective_color_image_height(16, &video), 16);
}

#[test]
fn changed_flags() {
    let mut host = new_host();
    let mut registry = BufferRegistry::new();
    let id = insert(&mut registry, &mut host, 0x1000, 100, 1);
    registry.bind(&mut host, id);

    registry.set_buffer_changed();
    assert!(registry.color_image_changed());
    assert!(registry.get(id).unwrap().sync_state().changed);

    registry.clear_buffers_changed(0x1000);
    assert!(!registry.color_image_changed());
    assert!(!registry.get(id).unwrap().sync_state().changed);
}

#[test]
fn frame_buffer_info_lists_display_buffers() {
    let mut host = new_host();
    let mut registry = BufferRegistry::new();
    insert(&mut registry, &mut host, 0x1000, 100, 1);
    insert(&mut registry, &mut host, 0x2000, 64, 1);
    insert(&mut registry, &mut host, 0x3000, 100, 1);

    let info = registry.frame_buffer_info(&video(), 8);
    assert_eq!(info.len(), 2);
    assert_eq!(info[0].address, 0x3000);

    assert_eq!(registry.frame_buffer_info(&video(), 1).len(), 1);
}
