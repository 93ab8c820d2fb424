//! # The Squall compositing renderer.
//!
//! Squall is a Vulkan library for compositing client window contents
//! into offscreen dmabuf-backed targets. A hosting compositor binds one
//! of its buffers as the render target, records a frame of textured or
//! solid quads, and gets the composited buffer back for presentation
//! through its own display path.
//!
//! ## Drawing API
//!
//! The general flow of a squall client is as follows:
//! * Create a renderer for the compositor's DRM node (`Renderer::new`)
//! * Import client buffers as textures (`create_texture_from_dmabuf`,
//!   `create_texture_from_pixels`)
//! * Bind a destination buffer (`bind_target`)
//! * Record one frame: `begin`, any number of `draw_texture` /
//!   `draw_quad` / `clear` / `set_scissor` calls, then `end`
//! * Optionally read the result back with `read_pixels`
//!
//! `end` blocks until the GPU has finished the frame. There is no
//! frame pipelining: correctness of the shared-buffer handoff is
//! preferred over throughput here.
//!
//! ## Requirements
//!
//! Squall requires Vulkan 1.2 and the following device extensions:
//! * VK_KHR_external_memory_fd
//! * VK_EXT_external_memory_dma_buf
//! * VK_EXT_image_drm_format_modifier
//! * VK_EXT_queue_family_foreign

#[macro_use]
extern crate bitflags;

mod descpool;
mod device;
mod dmabuf;
mod format;
mod instance;
mod renderer;
mod setup;
mod stage;
mod target;
mod texture;

#[cfg(test)]
mod tests;

pub use dmabuf::{DmabufAttributes, DmabufPlane};
pub use format::{
    FormatEntry, DRM_FORMAT_ABGR8888, DRM_FORMAT_ARGB8888, DRM_FORMAT_XBGR8888,
    DRM_FORMAT_XRGB8888,
};
pub use renderer::Renderer;
pub use target::TargetBuffer;
pub use texture::Texture;

use cgmath::Matrix3;
use std::os::unix::io::RawFd;
use thiserror::Error;

/// Errors returned by the public renderer operations.
///
/// Programming-contract violations (ending a frame with no bound
/// target, forgetting the currently bound buffer, drawing outside of a
/// frame) are not errors, they are asserts. Everything here is a
/// runtime condition the caller is expected to handle by abandoning
/// the current operation.
#[allow(non_camel_case_types)]
#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
pub enum SquallError {
    #[error("Could not find a suitable GPU")]
    NO_DEVICE,
    #[error("Could not find a suitable memory type")]
    NO_MEMORY_TYPE,
    #[error("Creating a Vulkan object failed")]
    ALLOCATION_FAILED,
    #[error("Unsupported pixel format")]
    INVALID_FORMAT,
    #[error("No conversion path between source and destination formats")]
    NO_CONVERSION_PATH,
    #[error("Invalid dmabuf attributes")]
    INVALID_DMABUF,
    #[error("Could not duplicate file descriptor")]
    INVALID_FD,
    #[error("Buffer stride does not match its dimensions")]
    INVALID_STRIDE,
    #[error("Queue submission failed")]
    SUBMIT_FAILED,
    #[error("Waiting on the frame fence failed")]
    WAIT_FAILED,
    #[error("No render target is bound")]
    NO_TARGET_BOUND,
}

pub type Result<T> = std::result::Result<T, SquallError>;

/// An integer rectangle in target pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// A sub-rectangle of a texture, in texel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl FRect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

bitflags! {
    /// The kinds of destination buffers this renderer can draw into.
    pub struct BufferCaps: u32 {
        /// GPU-resident dmabuf targets. Host memory targets are not
        /// supported.
        const DMABUF = 1;
    }
}

/// The renderer surface consumed by the hosting compositor.
///
/// One frame is the sequence bind_target -> begin -> draw operations
/// -> end. The draw operations are only valid between begin and end,
/// and end blocks until the GPU has finished consuming every resource
/// the frame referenced.
pub trait RenderBackend {
    /// Bind `target` as the destination of subsequent frames.
    ///
    /// Rebinding the buffer that is already bound is a no-op. Passing
    /// None releases the current binding.
    fn bind_target(&mut self, target: Option<&TargetBuffer>) -> Result<()>;

    /// Start recording a frame over the given render area.
    fn begin(&mut self, width: u32, height: u32) -> Result<()>;

    /// Finish the frame: insert ownership-transfer barriers, submit,
    /// and wait for completion.
    fn end(&mut self) -> Result<()>;

    /// Fill the current scissor rectangle with `color`. The color is
    /// sRGB-encoded; a zero-area scissor makes this a no-op.
    fn clear(&mut self, color: [f32; 4]);

    /// Restrict subsequent draws to `rect`, clamped to the render
    /// area. None resets to the full area.
    fn set_scissor(&mut self, rect: Option<Rect>);

    /// Draw the `src` region of `texture`, transformed by `transform`
    /// (unit square to target pixels), with the given opacity.
    fn draw_texture(
        &mut self,
        texture: &Texture,
        src: FRect,
        transform: Matrix3<f32>,
        alpha: f32,
    ) -> Result<()>;

    /// Draw a solid quad. The color is sRGB-encoded with premultiplied
    /// alpha.
    fn draw_quad(&mut self, color: [f32; 4], transform: Matrix3<f32>) -> Result<()>;

    /// DRM fourcc codes accepted by `create_texture_from_pixels`.
    fn shm_formats(&self) -> &[u32];

    /// DRM fourcc codes accepted by `create_texture_from_dmabuf`.
    fn dmabuf_texture_formats(&self) -> &[u32];

    /// DRM fourcc codes accepted as render target formats.
    fn render_formats(&self) -> &[u32];

    /// The fourcc a caller should prefer when reading back the
    /// currently bound target.
    fn preferred_read_format(&self) -> Result<u32>;

    /// Synchronously copy a region of the bound target into `data`.
    #[allow(clippy::too_many_arguments)]
    fn read_pixels(
        &mut self,
        drm_format: u32,
        stride: u32,
        width: u32,
        height: u32,
        src_x: u32,
        src_y: u32,
        dst_x: u32,
        dst_y: u32,
        data: &mut [u8],
    ) -> Result<()>;

    /// The DRM render node backing this renderer.
    fn drm_fd(&self) -> RawFd;

    /// What kinds of destination buffers `bind_target` accepts.
    fn buffer_caps(&self) -> BufferCaps;
}
