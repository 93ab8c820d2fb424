// The frame controller
//
// This sequences one frame of composition: bind a destination buffer,
// begin recording, draw, end. Ending a frame is where the interesting
// work happens: ownership-transfer barriers for every externally-owned
// image the frame touched are batched into a single pipeline barrier
// per direction, the staging and render command streams are submitted
// together, and the CPU blocks on the frame fence before any of the
// frame's resources are reclaimed. One frame is in flight at a time;
// the handoff protocol for shared buffers stays simple because the
// fence proves the GPU is done before anything is reused.

use ash::vk;
use cgmath::Matrix3;
use serde::Serialize;

use crate::descpool::DescriptorSystem;
use crate::device::Device;
use crate::format;
use crate::instance::Instance;
use crate::setup::{SetupCache, StaticRenderData};
use crate::stage::StagePool;
use crate::target::{TargetBuffer, TargetRegistry};
use crate::texture::Texture;
use crate::{BufferCaps, FRect, Rect, RenderBackend, Result, SquallError};

use std::os::unix::io::RawFd;
use std::sync::Arc;

/// Vertex shader push constant range data
///
/// Layout must match the push_constant block in quad.vert: the
/// transform matrix is column major, followed by the source rectangle
/// in normalized texture coordinates.
#[repr(C)]
#[derive(Clone, Copy, Serialize)]
pub(crate) struct VertPushData {
    pub mat: [[f32; 4]; 4],
    pub uv_off: [f32; 2],
    pub uv_size: [f32; 2],
}

pub(crate) const VERT_PUSH_SIZE: u32 = std::mem::size_of::<VertPushData>() as u32;
/// alpha or color, whichever fragment shader is bound
pub(crate) const FRAG_PUSH_SIZE: u32 = (std::mem::size_of::<f32>() * 4) as u32;

// https://www.w3.org/Graphics/Color/srgb
fn color_to_linear(non_linear: f32) -> f32 {
    if non_linear > 0.04045 {
        ((non_linear + 0.055) / 1.055).powf(2.4)
    } else {
        non_linear / 12.92
    }
}

/// Convert an sRGB-encoded color to the linear values the pipeline
/// blends with. Alpha is coverage, not color, and is never converted.
fn linearize_color(color: [f32; 4]) -> [f32; 4] {
    [
        color_to_linear(color[0]),
        color_to_linear(color[1]),
        color_to_linear(color[2]),
        color[3],
    ]
}

/// Embed a 2D homogeneous transform into the mat4 the vertex shader
/// consumes, column major. The perspective row is dropped; everything
/// we draw with is affine.
pub(crate) fn mat3_to_mat4(mat: &Matrix3<f32>) -> [[f32; 4]; 4] {
    [
        [mat.x.x, mat.x.y, 0.0, 0.0],
        [mat.y.x, mat.y.y, 0.0, 0.0],
        [0.0, 0.0, 1.0, 0.0],
        [mat.z.x, mat.z.y, 0.0, 1.0],
    ]
}

/// Target pixel coordinates to Vulkan's y-down normalized device
/// coordinates.
fn projection(width: u32, height: u32) -> Matrix3<f32> {
    Matrix3::new(
        2.0 / width as f32,
        0.0,
        0.0,
        0.0,
        2.0 / height as f32,
        0.0,
        -1.0,
        -1.0,
        1.0,
    )
}

/// Clamp a requested scissor against the render area. Degenerate
/// intersections come back as a zero rect.
fn clamp_scissor(rect: &Rect, width: u32, height: u32) -> vk::Rect2D {
    let x0 = rect.x.max(0);
    let y0 = rect.y.max(0);
    let x1 = rect.x.saturating_add(rect.width).min(width as i32);
    let y1 = rect.y.saturating_add(rect.height).min(height as i32);

    if x1 <= x0 || y1 <= y0 {
        return vk::Rect2D::default();
    }

    vk::Rect2D {
        offset: vk::Offset2D { x: x0, y: y0 },
        extent: vk::Extent2D {
            width: (x1 - x0) as u32,
            height: (y1 - y0) as u32,
        },
    }
}

/// Copy readback rows from the GPU's reported row pitch into the
/// caller's stride. The whole block goes over in one copy when the
/// pitches line up and no horizontal offset was requested.
#[allow(clippy::too_many_arguments)]
fn copy_rows(
    dst: &mut [u8],
    src: &[u8],
    height: usize,
    row_bytes: usize,
    dst_stride: usize,
    src_pitch: usize,
    dst_x_bytes: usize,
    dst_y: usize,
) {
    if dst_stride == src_pitch && dst_x_bytes == 0 {
        let start = dst_y * dst_stride;
        let len = height * dst_stride;
        dst[start..start + len].copy_from_slice(&src[..len]);
        return;
    }

    for row in 0..height {
        let d = (dst_y + row) * dst_stride + dst_x_bytes;
        let s = row * src_pitch;
        dst[d..d + row_bytes].copy_from_slice(&src[s..s + row_bytes]);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    Idle,
    Recording,
}

/// The destination image cache for read_pixels. Repeated full-frame
/// reads of the same format and size reuse one linear image.
struct ReadPixelsCache {
    rp_drm_format: u32,
    rp_width: u32,
    rp_height: u32,
    rp_image: vk::Image,
    rp_memory: vk::DeviceMemory,
}

pub struct Renderer {
    /// The GPU this renderer draws with. Also keeps the Instance it
    /// was created from alive.
    pub(crate) r_dev: Arc<Device>,

    /// sampler, layouts and shader modules shared by all pipelines
    pub(crate) r_statics: StaticRenderData,
    /// allocator for per-texture binding sets
    pub(crate) r_desc_system: DescriptorSystem,
    /// transient upload memory and the staging command stream
    pub(crate) r_stage: StagePool,
    r_setups: SetupCache,
    r_targets: TargetRegistry,
    /// Holding this clone keeps the bound buffer locked for us
    r_current_target: Option<TargetBuffer>,

    r_cmd_pool: vk::CommandPool,
    /// the render command stream, one frame at a time
    r_cb: vk::CommandBuffer,
    /// Reusable fence backing every submission. Signaled when the
    /// frame's GPU work completes, reset before the next one.
    r_fence: vk::Fence,

    r_state: FrameState,
    /// Monotonic count of completed frames. Stamps texture use for
    /// deferred destruction.
    pub(crate) r_frame: u64,
    r_render_width: u32,
    r_render_height: u32,
    r_scissor: vk::Rect2D,
    r_projection: Matrix3<f32>,
    /// the pipeline bound by the last draw, so consecutive draws with
    /// the same pipeline skip the rebind
    r_bound_pipe: vk::Pipeline,
    /// Externally-owned textures sampled this frame. Their ownership
    /// handoff barriers are issued in one batch at end().
    r_foreign_textures: Vec<Texture>,
    /// Textures whose destruction waits for the frame fence
    pub(crate) r_destroy_textures: Vec<Texture>,

    r_read_cache: Option<ReadPixelsCache>,
}

impl Renderer {
    /// Create a renderer for the GPU driving `drm_fd`.
    pub fn new(drm_fd: RawFd) -> Result<Self> {
        let inst = Arc::new(Instance::new());
        let dev = Arc::new(Device::new(inst, drm_fd)?);

        let statics = StaticRenderData::new(dev.clone())?;
        let cmd_pool = dev.create_command_pool()?;

        let cbufs = match dev.create_command_buffers(cmd_pool, 2) {
            Ok(c) => c,
            Err(e) => {
                unsafe { dev.dev.destroy_command_pool(cmd_pool, None) };
                return Err(e);
            }
        };

        let fence = match unsafe {
            dev.dev
                .create_fence(&vk::FenceCreateInfo::builder(), None)
        } {
            Ok(f) => f,
            Err(_) => {
                unsafe { dev.dev.destroy_command_pool(cmd_pool, None) };
                return Err(SquallError::ALLOCATION_FAILED);
            }
        };

        Ok(Self {
            r_desc_system: DescriptorSystem::new(dev.clone()),
            r_stage: StagePool::new(dev.clone(), cbufs[1]),
            r_setups: SetupCache::new(dev.clone()),
            r_targets: TargetRegistry::new(dev.clone()),
            r_current_target: None,
            r_statics: statics,
            r_cmd_pool: cmd_pool,
            r_cb: cbufs[0],
            r_fence: fence,
            r_state: FrameState::Idle,
            r_frame: 0,
            r_render_width: 0,
            r_render_height: 0,
            r_scissor: vk::Rect2D::default(),
            r_projection: projection(1, 1),
            r_bound_pipe: vk::Pipeline::null(),
            r_foreign_textures: Vec::new(),
            r_destroy_textures: Vec::new(),
            r_read_cache: None,
            r_dev: dev,
        })
    }

    /// The hosting compositor's teardown notification for one of its
    /// buffers. Any wrapping render target is destroyed. Forgetting
    /// the currently bound buffer is a caller bug.
    pub fn forget_buffer(&mut self, buffer: &TargetBuffer) {
        assert!(
            self.r_current_target.as_ref() != Some(buffer),
            "cannot destroy the currently bound render target"
        );
        self.r_targets.remove(buffer);
    }

    /// Expose the bound target's image and format for collaborators
    /// sharing this Vulkan context, e.g. a separate presentation path.
    pub fn current_target_attribs(&self) -> Result<(vk::Image, vk::Format)> {
        let buffer = self
            .r_current_target
            .as_ref()
            .ok_or(SquallError::NO_TARGET_BOUND)?;
        let target = self.r_targets.get(buffer.id()).unwrap();
        Ok((target.rt_image, target.rt_setup.rs_format))
    }

    fn bind_pipeline(&mut self, pipe: vk::Pipeline) {
        if pipe != self.r_bound_pipe {
            unsafe {
                self.r_dev.dev.cmd_bind_pipeline(
                    self.r_cb,
                    vk::PipelineBindPoint::GRAPHICS,
                    pipe,
                );
            }
            self.r_bound_pipe = pipe;
        }
    }

    fn push_vert_data(&self, transform: &Matrix3<f32>, uv_off: [f32; 2], uv_size: [f32; 2]) {
        let push = VertPushData {
            mat: mat3_to_mat4(&(self.r_projection * *transform)),
            uv_off,
            uv_size,
        };

        unsafe {
            self.r_dev.dev.cmd_push_constants(
                self.r_cb,
                self.r_statics.srd_pipe_layout,
                vk::ShaderStageFlags::VERTEX,
                0,
                bincode::serialize(&push).unwrap().as_slice(),
            );
        }
    }

    fn push_frag_data<T: Serialize>(&self, data: &T) {
        unsafe {
            self.r_dev.dev.cmd_push_constants(
                self.r_cb,
                self.r_statics.srd_pipe_layout,
                vk::ShaderStageFlags::FRAGMENT,
                VERT_PUSH_SIZE,
                bincode::serialize(data).unwrap().as_slice(),
            );
        }
    }

    /// Build the acquire/release barrier pair moving `image` between
    /// the external producer's queue family and ours.
    fn ownership_barriers(
        &self,
        image: vk::Image,
        src_layout: vk::ImageLayout,
        acquired_layout: vk::ImageLayout,
        released_layout: vk::ImageLayout,
        access: vk::AccessFlags,
    ) -> (vk::ImageMemoryBarrier, vk::ImageMemoryBarrier) {
        let range = vk::ImageSubresourceRange::builder()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .layer_count(1)
            .level_count(1)
            .build();

        let acquire = vk::ImageMemoryBarrier::builder()
            .src_queue_family_index(vk::QUEUE_FAMILY_FOREIGN_EXT)
            .dst_queue_family_index(self.r_dev.queue_family)
            .image(image)
            .old_layout(src_layout)
            .new_layout(acquired_layout)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(access)
            .subresource_range(range)
            .build();

        let release = vk::ImageMemoryBarrier::builder()
            .src_queue_family_index(self.r_dev.queue_family)
            .dst_queue_family_index(vk::QUEUE_FAMILY_FOREIGN_EXT)
            .image(image)
            .old_layout(acquired_layout)
            .new_layout(released_layout)
            .src_access_mask(access)
            .dst_access_mask(vk::AccessFlags::empty())
            .subresource_range(range)
            .build();

        (acquire, release)
    }

    /// Wait for the frame fence, then reclaim everything the frame
    /// pinned: staging spans, textures queued for destruction, and
    /// the fence itself.
    fn wait_and_reclaim(&mut self) -> Result<()> {
        unsafe {
            self.r_dev
                .dev
                .wait_for_fences(&[self.r_fence], true, u64::MAX)
                .map_err(|_| {
                    log::error!("Waiting for the frame fence failed");
                    SquallError::WAIT_FAILED
                })?;
        }

        self.r_frame += 1;
        // The fence proved completion, the spans are safe to reuse now
        self.r_stage.release_all();
        self.r_destroy_textures.clear();

        unsafe {
            self.r_dev.dev.reset_fences(&[self.r_fence]).map_err(|_| {
                log::error!("Resetting the frame fence failed");
                SquallError::WAIT_FAILED
            })?;
        }

        Ok(())
    }

    /// Submit the staging command stream alone and wait for it.
    ///
    /// Used by the synchronous copy paths outside of frames. Staging
    /// allocations are deliberately not released here: spans may
    /// still back reads until the next frame completes.
    fn submit_stage_wait(&mut self) -> Result<()> {
        let cb = match self.r_stage.finish_recording() {
            Some(cb) => cb,
            None => return Err(SquallError::SUBMIT_FAILED),
        };

        let cbufs = [cb];
        let submits = [vk::SubmitInfo::builder().command_buffers(&cbufs).build()];
        unsafe {
            self.r_dev
                .dev
                .queue_submit(self.r_dev.queue, &submits, self.r_fence)
                .map_err(|_| {
                    log::error!("Staging queue submission failed");
                    SquallError::SUBMIT_FAILED
                })?;

            self.r_dev
                .dev
                .wait_for_fences(&[self.r_fence], true, u64::MAX)
                .map_err(|_| {
                    log::error!("Waiting for the staging fence failed");
                    SquallError::WAIT_FAILED
                })?;

            self.r_dev.dev.reset_fences(&[self.r_fence]).map_err(|_| {
                log::error!("Resetting the staging fence failed");
                SquallError::WAIT_FAILED
            })?;
        }

        Ok(())
    }

    /// Get or create the cached readback destination image for this
    /// format and size.
    fn readback_image(
        &mut self,
        drm_format: u32,
        vk_format: vk::Format,
        width: u32,
        height: u32,
    ) -> Result<(vk::Image, vk::DeviceMemory)> {
        if let Some(cache) = self.r_read_cache.as_ref() {
            if cache.rp_drm_format == drm_format
                && cache.rp_width == width
                && cache.rp_height == height
            {
                return Ok((cache.rp_image, cache.rp_memory));
            }
        }

        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(vk_format)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .array_layers(1)
            .mip_levels(1)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::LINEAR)
            .usage(vk::ImageUsageFlags::TRANSFER_DST)
            .build();

        unsafe {
            let image = self
                .r_dev
                .dev
                .create_image(&image_info, None)
                .map_err(|_| SquallError::ALLOCATION_FAILED)?;

            let mem_reqs = self.r_dev.dev.get_image_memory_requirements(image);
            let mem_type = match self.r_dev.find_memory_type_index(
                &mem_reqs,
                vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT
                    | vk::MemoryPropertyFlags::HOST_CACHED,
            ) {
                Ok(t) => t,
                Err(e) => {
                    self.r_dev.dev.destroy_image(image, None);
                    return Err(e);
                }
            };

            let alloc_info = vk::MemoryAllocateInfo::builder()
                .allocation_size(mem_reqs.size)
                .memory_type_index(mem_type)
                .build();
            let memory = match self.r_dev.dev.allocate_memory(&alloc_info, None) {
                Ok(m) => m,
                Err(_) => {
                    self.r_dev.dev.destroy_image(image, None);
                    return Err(SquallError::ALLOCATION_FAILED);
                }
            };

            if self.r_dev.dev.bind_image_memory(image, memory, 0).is_err() {
                self.r_dev.dev.free_memory(memory, None);
                self.r_dev.dev.destroy_image(image, None);
                return Err(SquallError::ALLOCATION_FAILED);
            }

            // The new destination is good, retire the old one
            if let Some(old) = self.r_read_cache.take() {
                self.r_dev.dev.free_memory(old.rp_memory, None);
                self.r_dev.dev.destroy_image(old.rp_image, None);
            }
            self.r_read_cache = Some(ReadPixelsCache {
                rp_drm_format: drm_format,
                rp_width: width,
                rp_height: height,
                rp_image: image,
                rp_memory: memory,
            });

            Ok((image, memory))
        }
    }
}

impl RenderBackend for Renderer {
    fn bind_target(&mut self, target: Option<&TargetBuffer>) -> Result<()> {
        assert!(
            self.r_state == FrameState::Idle,
            "cannot rebind the render target mid-frame"
        );

        let buffer = match target {
            Some(b) => b,
            None => {
                // drops our lock on the old binding
                self.r_current_target = None;
                return Ok(());
            }
        };

        if self.r_current_target.as_ref() == Some(buffer) {
            return Ok(());
        }

        self.r_targets
            .get_or_create(&self.r_statics, &mut self.r_setups, buffer)?;
        self.r_current_target = Some(buffer.clone());
        Ok(())
    }

    fn begin(&mut self, width: u32, height: u32) -> Result<()> {
        assert!(self.r_state == FrameState::Idle, "frame already recording");
        let buffer = self
            .r_current_target
            .as_ref()
            .expect("no render target bound");

        let (render_pass, framebuffer) = {
            let target = self.r_targets.get(buffer.id()).unwrap();
            (target.rt_setup.rs_render_pass, target.rt_framebuffer)
        };

        let cb = self.r_cb;
        let rect = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D { width, height },
        };

        unsafe {
            self.r_dev
                .dev
                .begin_command_buffer(cb, &vk::CommandBufferBeginInfo::builder())
                .map_err(|_| SquallError::SUBMIT_FAILED)?;

            // No clear values: the pass loads the existing contents so
            // partial redraws composite over what is already there
            let rp_info = vk::RenderPassBeginInfo::builder()
                .render_pass(render_pass)
                .framebuffer(framebuffer)
                .render_area(rect)
                .build();
            self.r_dev
                .dev
                .cmd_begin_render_pass(cb, &rp_info, vk::SubpassContents::INLINE);

            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: width as f32,
                height: height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            self.r_dev.dev.cmd_set_viewport(cb, 0, &[viewport]);
            self.r_dev.dev.cmd_set_scissor(cb, 0, &[rect]);
        }

        self.r_scissor = rect;
        self.r_projection = projection(width, height);
        self.r_render_width = width;
        self.r_render_height = height;
        // first draw always rebinds
        self.r_bound_pipe = vk::Pipeline::null();
        self.r_state = FrameState::Recording;

        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        assert!(
            self.r_state == FrameState::Recording,
            "no frame is being recorded"
        );
        let buffer = self
            .r_current_target
            .as_ref()
            .expect("no render target bound")
            .clone();

        let render_cb = self.r_cb;
        unsafe {
            self.r_dev.dev.cmd_end_render_pass(render_cb);
        }

        self.r_render_width = 0;
        self.r_render_height = 0;
        self.r_bound_pipe = vk::Pipeline::null();

        // One acquire and one release barrier per foreign image the
        // frame sampled, plus the pair for the render target itself.
        let foreign = std::mem::take(&mut self.r_foreign_textures);
        let mut acquire_barriers = Vec::with_capacity(foreign.len() + 1);
        let mut release_barriers = Vec::with_capacity(foreign.len() + 1);

        for tex in foreign.iter() {
            let mut internal = tex.t_internal.write().unwrap();

            let src_layout = if internal.tx_transitioned {
                vk::ImageLayout::GENERAL
            } else {
                internal.tx_transitioned = true;
                vk::ImageLayout::UNDEFINED
            };

            let (acquire, release) = self.ownership_barriers(
                internal.tx_image,
                src_layout,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::ImageLayout::GENERAL,
                vk::AccessFlags::SHADER_READ,
            );
            acquire_barriers.push(acquire);
            release_barriers.push(release);

            // handed back to the producer once the release executes
            internal.tx_owned = false;
        }

        {
            let target = self.r_targets.get_mut(buffer.id()).unwrap();
            let src_layout = if target.rt_transitioned {
                vk::ImageLayout::GENERAL
            } else {
                target.rt_transitioned = true;
                vk::ImageLayout::PREINITIALIZED
            };
            let image = target.rt_image;

            let (acquire, release) = self.ownership_barriers(
                image,
                src_layout,
                vk::ImageLayout::GENERAL,
                vk::ImageLayout::GENERAL,
                vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            );
            acquire_barriers.push(acquire);
            release_barriers.push(release);
        }

        // Acquires go on the staging stream so they execute before any
        // render command; releases follow the render pass.
        let pre_cb = self.r_stage.record();
        unsafe {
            self.r_dev.dev.cmd_pipeline_barrier(
                pre_cb,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::FRAGMENT_SHADER
                    | vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                acquire_barriers.as_slice(),
            );

            self.r_dev.dev.cmd_pipeline_barrier(
                render_cb,
                vk::PipelineStageFlags::ALL_GRAPHICS,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                release_barriers.as_slice(),
            );

            self.r_dev
                .dev
                .end_command_buffer(render_cb)
                .map_err(|_| SquallError::SUBMIT_FAILED)?;
        }

        self.r_state = FrameState::Idle;

        // No semaphore between the two submissions: they share a
        // queue and the render pass dependency orders the staging
        // writes before the render reads.
        let stage_cbufs = self.r_stage.finish_recording().map(|cb| [cb]);
        let render_cbufs = [render_cb];

        let mut submits = Vec::with_capacity(2);
        if let Some(cbufs) = stage_cbufs.as_ref() {
            submits.push(vk::SubmitInfo::builder().command_buffers(cbufs).build());
        }
        submits.push(
            vk::SubmitInfo::builder()
                .command_buffers(&render_cbufs)
                .build(),
        );

        unsafe {
            self.r_dev
                .dev
                .queue_submit(self.r_dev.queue, submits.as_slice(), self.r_fence)
                .map_err(|_| {
                    log::error!("Frame queue submission failed");
                    SquallError::SUBMIT_FAILED
                })?;
        }

        self.wait_and_reclaim()
    }

    fn clear(&mut self, color: [f32; 4]) {
        assert!(self.r_state == FrameState::Recording, "not recording");

        if self.r_scissor.extent.width == 0 || self.r_scissor.extent.height == 0 {
            return;
        }

        let att = vk::ClearAttachment {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            color_attachment: 0,
            clear_value: vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: linearize_color(color),
                },
            },
        };
        let rect = vk::ClearRect {
            rect: self.r_scissor,
            base_array_layer: 0,
            layer_count: 1,
        };

        unsafe {
            self.r_dev.dev.cmd_clear_attachments(self.r_cb, &[att], &[rect]);
        }
    }

    fn set_scissor(&mut self, rect: Option<Rect>) {
        assert!(self.r_state == FrameState::Recording, "not recording");

        let vk_rect = match rect {
            Some(r) => clamp_scissor(&r, self.r_render_width, self.r_render_height),
            None => vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D {
                    width: self.r_render_width,
                    height: self.r_render_height,
                },
            },
        };

        self.r_scissor = vk_rect;
        unsafe {
            self.r_dev.dev.cmd_set_scissor(self.r_cb, 0, &[vk_rect]);
        }
    }

    fn draw_texture(
        &mut self,
        texture: &Texture,
        src: FRect,
        transform: Matrix3<f32>,
        alpha: f32,
    ) -> Result<()> {
        assert!(self.r_state == FrameState::Recording, "not recording");
        let buffer_id = self
            .r_current_target
            .as_ref()
            .expect("no render target bound")
            .id();

        let (tex_width, tex_height) = {
            let mut internal = texture.t_internal.write().unwrap();

            // Externally-owned images need an ownership acquire before
            // this draw's sampling executes. We don't issue it here:
            // barriers inside a render pass are costly and one texture
            // is commonly drawn several times per frame, so the frame
            // controller batches one barrier pair per image at the
            // frame boundaries instead.
            if internal.tx_dmabuf_imported && !internal.tx_owned {
                internal.tx_owned = true;
                self.r_foreign_textures.push(texture.clone());
            }
            internal.tx_last_used = self.r_frame;

            (internal.tx_width as f32, internal.tx_height as f32)
        };

        let pipe = self.r_targets.get(buffer_id).unwrap().rt_setup.rs_tex_pipe;
        self.bind_pipeline(pipe);

        unsafe {
            let internal = texture.t_internal.read().unwrap();
            self.r_dev.dev.cmd_bind_descriptor_sets(
                self.r_cb,
                vk::PipelineBindPoint::GRAPHICS,
                self.r_statics.srd_pipe_layout,
                0,
                &[internal.tx_desc.d_set],
                &[],
            );
        }

        self.push_vert_data(
            &transform,
            [src.x / tex_width, src.y / tex_height],
            [src.width / tex_width, src.height / tex_height],
        );
        self.push_frag_data(&alpha);

        unsafe {
            self.r_dev.dev.cmd_draw(self.r_cb, 4, 1, 0, 0);
        }

        Ok(())
    }

    fn draw_quad(&mut self, color: [f32; 4], transform: Matrix3<f32>) -> Result<()> {
        assert!(self.r_state == FrameState::Recording, "not recording");
        let buffer_id = self
            .r_current_target
            .as_ref()
            .expect("no render target bound")
            .id();

        let pipe = self
            .r_targets
            .get(buffer_id)
            .unwrap()
            .rt_setup
            .rs_quad_pipe;
        self.bind_pipeline(pipe);

        self.push_vert_data(&transform, [0.0, 0.0], [1.0, 1.0]);
        // The shader blends in linear space and the sRGB target
        // converts on store, so the encoded input goes linear here
        self.push_frag_data(&linearize_color(color));

        unsafe {
            self.r_dev.dev.cmd_draw(self.r_cb, 4, 1, 0, 0);
        }

        Ok(())
    }

    fn shm_formats(&self) -> &[u32] {
        self.r_dev.shm_formats()
    }

    fn dmabuf_texture_formats(&self) -> &[u32] {
        self.r_dev.texture_formats()
    }

    fn render_formats(&self) -> &[u32] {
        self.r_dev.render_formats()
    }

    fn preferred_read_format(&self) -> Result<u32> {
        self.r_current_target
            .as_ref()
            .map(|b| b.format())
            .ok_or(SquallError::NO_TARGET_BOUND)
    }

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
    ) -> Result<()> {
        assert!(
            self.r_state == FrameState::Idle,
            "cannot read pixels while a frame is recording"
        );
        let buffer = self
            .r_current_target
            .as_ref()
            .expect("no render target bound");

        let entry = format::format_from_drm(drm_format).ok_or_else(|| {
            log::error!(
                "read_pixels: no format entry for {}",
                format::drm_format_name(drm_format)
            );
            SquallError::INVALID_FORMAT
        })?;
        let (src_image, src_format) = {
            let target = self.r_targets.get(buffer.id()).unwrap();
            (target.rt_image, target.rt_setup.rs_format)
        };
        let dst_format = entry.vk_format;

        // Reject before any GPU work if the caller's buffer can't
        // hold the result
        if height == 0 || width == 0 {
            return Err(SquallError::INVALID_STRIDE);
        }
        let row_bytes = (width * entry.bytes_per_pixel()) as usize;
        let needed = (dst_y as usize + height as usize - 1) * stride as usize
            + dst_x as usize * entry.bytes_per_pixel() as usize
            + row_bytes;
        if data.len() < needed {
            return Err(SquallError::INVALID_STRIDE);
        }

        let src_props = unsafe {
            self.r_dev
                .inst
                .inst
                .get_physical_device_format_properties(self.r_dev.pdev, src_format)
        };
        let dst_props = unsafe {
            self.r_dev
                .inst
                .inst
                .get_physical_device_format_properties(self.r_dev.pdev, dst_format)
        };

        let blit_supported = src_props
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::BLIT_SRC)
            && dst_props
                .linear_tiling_features
                .contains(vk::FormatFeatureFlags::BLIT_DST);
        if !blit_supported && src_format != dst_format {
            log::error!("read_pixels: blit unsupported and formats differ");
            return Err(SquallError::NO_CONVERSION_PATH);
        }

        let (dst_image, dst_memory) = self.readback_image(drm_format, dst_format, width, height)?;

        let cb = self.r_stage.record();
        unsafe {
            self.r_dev.change_image_layout(
                cb,
                dst_image,
                vk::ImageLayout::UNDEFINED,
                vk::PipelineStageFlags::TRANSFER,
                vk::AccessFlags::empty(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::PipelineStageFlags::TRANSFER,
                vk::AccessFlags::TRANSFER_WRITE,
            );
            self.r_dev.change_image_layout(
                cb,
                src_image,
                vk::ImageLayout::GENERAL,
                vk::PipelineStageFlags::TRANSFER,
                vk::AccessFlags::MEMORY_READ,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::PipelineStageFlags::TRANSFER,
                vk::AccessFlags::TRANSFER_READ,
            );

            if blit_supported {
                let region = vk::ImageBlit {
                    src_subresource: vk::ImageSubresourceLayers {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: 0,
                        base_array_layer: 0,
                        layer_count: 1,
                    },
                    src_offsets: [
                        vk::Offset3D {
                            x: src_x as i32,
                            y: src_y as i32,
                            z: 0,
                        },
                        vk::Offset3D {
                            x: (src_x + width) as i32,
                            y: (src_y + height) as i32,
                            z: 1,
                        },
                    ],
                    dst_subresource: vk::ImageSubresourceLayers {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: 0,
                        base_array_layer: 0,
                        layer_count: 1,
                    },
                    dst_offsets: [
                        vk::Offset3D { x: 0, y: 0, z: 0 },
                        vk::Offset3D {
                            x: width as i32,
                            y: height as i32,
                            z: 1,
                        },
                    ],
                };
                self.r_dev.dev.cmd_blit_image(
                    cb,
                    src_image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    dst_image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                    vk::Filter::NEAREST,
                );
            } else {
                log::debug!("read_pixels: blit unsupported, falling back to image copy");
                let region = vk::ImageCopy {
                    src_subresource: vk::ImageSubresourceLayers {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: 0,
                        base_array_layer: 0,
                        layer_count: 1,
                    },
                    src_offset: vk::Offset3D {
                        x: src_x as i32,
                        y: src_y as i32,
                        z: 0,
                    },
                    dst_subresource: vk::ImageSubresourceLayers {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: 0,
                        base_array_layer: 0,
                        layer_count: 1,
                    },
                    dst_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
                    extent: vk::Extent3D {
                        width,
                        height,
                        depth: 1,
                    },
                };
                self.r_dev.dev.cmd_copy_image(
                    cb,
                    src_image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    dst_image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }

            self.r_dev.change_image_layout(
                cb,
                dst_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::PipelineStageFlags::TRANSFER,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::ImageLayout::GENERAL,
                vk::PipelineStageFlags::TRANSFER,
                vk::AccessFlags::empty(),
            );
            self.r_dev.change_image_layout(
                cb,
                src_image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::PipelineStageFlags::TRANSFER,
                vk::AccessFlags::TRANSFER_READ,
                vk::ImageLayout::GENERAL,
                vk::PipelineStageFlags::TRANSFER,
                vk::AccessFlags::MEMORY_READ,
            );
        }

        self.submit_stage_wait()?;

        let sub_res = vk::ImageSubresource {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            array_layer: 0,
        };
        let layout = unsafe {
            self.r_dev
                .dev
                .get_image_subresource_layout(dst_image, sub_res)
        };

        unsafe {
            let ptr = self
                .r_dev
                .dev
                .map_memory(dst_memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                .map_err(|_| SquallError::ALLOCATION_FAILED)?;

            let src_pitch = layout.row_pitch as usize;
            let src = std::slice::from_raw_parts(
                (ptr as *const u8).add(layout.offset as usize),
                src_pitch * height as usize,
            );

            copy_rows(
                data,
                src,
                height as usize,
                row_bytes,
                stride as usize,
                src_pitch,
                (dst_x * entry.bytes_per_pixel()) as usize,
                dst_y as usize,
            );

            self.r_dev.dev.unmap_memory(dst_memory);
        }

        Ok(())
    }

    fn drm_fd(&self) -> RawFd {
        self.r_dev.drm_fd()
    }

    fn buffer_caps(&self) -> BufferCaps {
        BufferCaps::DMABUF
    }
}

// Clean up after ourselves when the renderer gets destroyed.
//
// Roughly the reverse order of creation. The members with their own
// Drop impls (stage pool, descriptor system, setups, targets, static
// render data) tear themselves down after this body runs; the device
// itself goes away with the last Arc.
impl Drop for Renderer {
    fn drop(&mut self) {
        unsafe {
            let _ = self.r_dev.dev.device_wait_idle();

            self.r_current_target = None;
            self.r_destroy_textures.clear();

            if let Some(cache) = self.r_read_cache.take() {
                self.r_dev.dev.free_memory(cache.rp_memory, None);
                self.r_dev.dev.destroy_image(cache.rp_image, None);
            }

            self.r_dev.dev.destroy_fence(self.r_fence, None);
            self.r_dev.dev.destroy_command_pool(self.r_cmd_pool, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::{Matrix3, Vector3};

    #[test]
    fn linearization_endpoints_are_exact() {
        assert_eq!(color_to_linear(0.0), 0.0);
        assert_eq!(color_to_linear(1.0), 1.0);
    }

    #[test]
    fn linearization_is_monotonic() {
        let mut prev = color_to_linear(0.0);
        for i in 1..=100 {
            let next = color_to_linear(i as f32 / 100.0);
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn alpha_is_never_converted() {
        let out = linearize_color([0.5, 0.5, 0.5, 0.5]);
        assert_eq!(out[3], 0.5);
        assert!(out[0] < 0.5);
    }

    #[test]
    fn mat4_embedding_preserves_affine_transforms() {
        // translate by (3, 4) then check the embedded columns
        let m = Matrix3::new(1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 3.0, 4.0, 1.0);
        let out = mat3_to_mat4(&m);

        assert_eq!(out[0], [1.0, 0.0, 0.0, 0.0]);
        assert_eq!(out[1], [0.0, 1.0, 0.0, 0.0]);
        assert_eq!(out[2], [0.0, 0.0, 1.0, 0.0]);
        assert_eq!(out[3], [3.0, 4.0, 0.0, 1.0]);
    }

    #[test]
    fn projection_maps_target_corners_to_ndc() {
        // power of two dimensions keep the arithmetic exact
        let proj = projection(128, 256);

        let origin = proj * Vector3::new(0.0, 0.0, 1.0);
        assert_eq!((origin.x, origin.y), (-1.0, -1.0));

        let extent = proj * Vector3::new(128.0, 256.0, 1.0);
        assert_eq!((extent.x, extent.y), (1.0, 1.0));

        let center = proj * Vector3::new(64.0, 128.0, 1.0);
        assert_eq!((center.x, center.y), (0.0, 0.0));
    }

    #[test]
    fn vert_push_block_is_80_bytes() {
        assert_eq!(VERT_PUSH_SIZE, 80);

        let push = VertPushData {
            mat: mat3_to_mat4(&Matrix3::new(1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0)),
            uv_off: [0.0, 0.0],
            uv_size: [1.0, 1.0],
        };
        // bincode writes the fields back to back, matching the
        // repr(C) layout the shader block expects
        assert_eq!(bincode::serialize(&push).unwrap().len(), 80);
    }

    #[test]
    fn scissors_clamp_to_the_render_area() {
        let full = clamp_scissor(&Rect::new(-10, -10, 200, 200), 100, 100);
        assert_eq!(full.offset, vk::Offset2D { x: 0, y: 0 });
        assert_eq!(
            full.extent,
            vk::Extent2D {
                width: 100,
                height: 100
            }
        );

        let partial = clamp_scissor(&Rect::new(50, 60, 100, 100), 100, 100);
        assert_eq!(partial.offset, vk::Offset2D { x: 50, y: 60 });
        assert_eq!(
            partial.extent,
            vk::Extent2D {
                width: 50,
                height: 40
            }
        );

        let empty = clamp_scissor(&Rect::new(200, 200, 10, 10), 100, 100);
        assert_eq!(empty.extent.width, 0);
        assert_eq!(empty.extent.height, 0);
    }

    #[test]
    fn row_copies_honor_both_strides() {
        // 2x2 image, 4bpp, source pitch 12, destination stride 10,
        // placed at (dst_x, dst_y) = (1, 1)
        let src = [
            1u8, 1, 1, 1, 2, 2, 2, 2, 0, 0, 0, 0, // row 0 + pad
            3, 3, 3, 3, 4, 4, 4, 4, 0, 0, 0, 0, // row 1 + pad
        ];
        let mut dst = [0u8; 40];

        copy_rows(&mut dst, &src, 2, 8, 10, 12, 4, 1);

        assert_eq!(&dst[..10], &[0; 10]);
        assert_eq!(&dst[14..22], &[1, 1, 1, 1, 2, 2, 2, 2]);
        assert_eq!(&dst[24..32], &[3, 3, 3, 3, 4, 4, 4, 4]);
    }

    #[test]
    fn row_copy_fast_path_moves_the_whole_block() {
        let src: Vec<u8> = (0..32).collect();
        let mut dst = [0u8; 64];

        // pitches match and no x offset: one block copy at dst_y
        copy_rows(&mut dst, &src, 4, 8, 8, 8, 0, 2);

        assert_eq!(&dst[..16], &[0; 16]);
        assert_eq!(&dst[16..48], src.as_slice());
    }
}
