// Squall tests
//
// Everything here runs against the CPU-side machinery. The GPU paths
// are exercised by a compositor with a live device; these checks pin
// down the bookkeeping and the public API's contracts.

use crate as sq;

use std::fs::File;
use std::os::unix::io::OwnedFd;

fn null_fd() -> OwnedFd {
    File::open("/dev/null").unwrap().into()
}

#[test]
fn push_constant_block_fits_the_guaranteed_budget() {
    // 128 bytes of push constant space is the Vulkan minimum, the
    // vertex block plus the fragment block must fit inside it
    assert!(crate::renderer::VERT_PUSH_SIZE + crate::renderer::FRAG_PUSH_SIZE <= 128);
}

#[test]
fn target_buffers_compare_by_identity() {
    let attribs = sq::DmabufAttributes::new(64, 64, sq::DRM_FORMAT_ARGB8888, 0);

    let a = sq::TargetBuffer::new(7, attribs.clone());
    let b = sq::TargetBuffer::new(7, attribs.clone());
    let c = sq::TargetBuffer::new(8, attribs);

    assert_eq!(a, b);
    assert_eq!(a, a.clone());
    assert_ne!(a, c);
    assert_eq!(a.id(), 7);
}

#[test]
fn target_buffer_reports_its_description() {
    let mut attribs = sq::DmabufAttributes::new(640, 480, sq::DRM_FORMAT_XRGB8888, 0);
    attribs.add_plane(sq::DmabufPlane::new(null_fd(), 0, 640 * 4));

    let buf = sq::TargetBuffer::new(1, attribs);
    assert_eq!(buf.width(), 640);
    assert_eq!(buf.height(), 480);
    assert_eq!(buf.format(), sq::DRM_FORMAT_XRGB8888);
}

#[test]
fn dmabuf_attributes_accumulate_planes() {
    let mut attribs = sq::DmabufAttributes::new(256, 128, sq::DRM_FORMAT_ABGR8888, 0);
    assert!(attribs.da_planes.is_empty());

    attribs.add_plane(sq::DmabufPlane::new(null_fd(), 0, 1024));
    attribs.add_plane(sq::DmabufPlane::new(null_fd(), 1024 * 128, 1024));

    assert_eq!(attribs.da_planes.len(), 2);
    assert_eq!(attribs.da_planes[1].dp_offset, 1024 * 128);
    assert_eq!(attribs.extent().width, 256);

    // clones dup the fds rather than sharing them
    let copy = attribs.clone();
    assert_eq!(copy.da_planes.len(), 2);
}
