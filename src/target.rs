// Render targets
//
// The hosting compositor owns the destination buffers; we get handed
// one to draw into. A RenderTarget wraps such a buffer with the
// objects needed to render into it: the imported image, a view, a
// framebuffer, and the format setup they were built against. Targets
// are cached by buffer identity so rebinding the same buffer costs
// nothing, and are torn down when the compositor says the buffer is
// going away.

use ash::vk;

use crate::device::Device;
use crate::dmabuf::DmabufAttributes;
use crate::setup::{RenderFormatSetup, SetupCache, StaticRenderData};
use crate::{Result, SquallError};

use std::collections::HashMap;
use std::sync::Arc;

/// A destination buffer owned by the hosting compositor.
///
/// The id is the buffer's identity for caching; the compositor must
/// keep it stable for the buffer's lifetime and unique among live
/// buffers. Clones share the underlying description, so the renderer
/// holding a clone of the bound buffer acts as its lock.
#[derive(Clone, Debug)]
pub struct TargetBuffer {
    tb_internal: Arc<TargetBufferInternal>,
}

#[derive(Debug)]
struct TargetBufferInternal {
    tb_id: u64,
    tb_attribs: DmabufAttributes,
}

impl TargetBuffer {
    pub fn new(id: u64, attribs: DmabufAttributes) -> Self {
        Self {
            tb_internal: Arc::new(TargetBufferInternal {
                tb_id: id,
                tb_attribs: attribs,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.tb_internal.tb_id
    }

    pub fn width(&self) -> i32 {
        self.tb_internal.tb_attribs.da_width
    }

    pub fn height(&self) -> i32 {
        self.tb_internal.tb_attribs.da_height
    }

    /// DRM fourcc of the underlying buffer
    pub fn format(&self) -> u32 {
        self.tb_internal.tb_attribs.da_format
    }

    pub(crate) fn attribs(&self) -> &DmabufAttributes {
        &self.tb_internal.tb_attribs
    }
}

impl PartialEq for TargetBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.tb_internal.tb_id == other.tb_internal.tb_id
    }
}
impl Eq for TargetBuffer {}

/// One externally-owned buffer wrapped for rendering
pub(crate) struct RenderTarget {
    rt_dev: Arc<Device>,
    /// our lock on the external buffer
    pub(crate) rt_buffer: TargetBuffer,
    pub(crate) rt_image: vk::Image,
    rt_view: vk::ImageView,
    pub(crate) rt_framebuffer: vk::Framebuffer,
    rt_memories: Vec<vk::DeviceMemory>,
    pub(crate) rt_setup: Arc<RenderFormatSetup>,
    /// false until the first frame acquires this target. Governs
    /// whether the first ownership acquire may treat the contents as
    /// preinitialized-but-untouched.
    pub(crate) rt_transitioned: bool,
}

impl RenderTarget {
    fn create(
        dev: Arc<Device>,
        statics: &StaticRenderData,
        setups: &mut SetupCache,
        buffer: &TargetBuffer,
    ) -> Result<Self> {
        let attribs = buffer.attribs();
        log::debug!(
            "creating render target: {} {}x{}",
            crate::format::drm_format_name(attribs.da_format),
            attribs.da_width,
            attribs.da_height
        );

        let entry = dev.usable_format(attribs.da_format, true)?;
        let (image, memories) = dev.import_dmabuf(attribs, true)?;

        // roll back everything built so far on any failure
        let release = |image: vk::Image, view: vk::ImageView, mems: &[vk::DeviceMemory]| unsafe {
            if view != vk::ImageView::null() {
                dev.dev.destroy_image_view(view, None);
            }
            dev.dev.destroy_image(image, None);
            for mem in mems.iter() {
                dev.dev.free_memory(*mem, None);
            }
        };

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(entry.vk_format)
            .subresource_range(
                vk::ImageSubresourceRange::builder()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .level_count(1)
                    .layer_count(1)
                    .build(),
            )
            .build();
        let view = match unsafe { dev.dev.create_image_view(&view_info, None) } {
            Ok(v) => v,
            Err(_) => {
                log::error!("Could not create render target image view");
                release(image, vk::ImageView::null(), &memories);
                return Err(SquallError::ALLOCATION_FAILED);
            }
        };

        let setup = match setups.get_or_create(statics, entry.vk_format) {
            Ok(s) => s,
            Err(e) => {
                release(image, view, &memories);
                return Err(e);
            }
        };

        let attachments = [view];
        let fb_info = vk::FramebufferCreateInfo::builder()
            .render_pass(setup.rs_render_pass)
            .attachments(&attachments)
            .width(attribs.da_width as u32)
            .height(attribs.da_height as u32)
            .layers(1)
            .build();
        let framebuffer = match unsafe { dev.dev.create_framebuffer(&fb_info, None) } {
            Ok(f) => f,
            Err(_) => {
                log::error!("Could not create render target framebuffer");
                release(image, view, &memories);
                return Err(SquallError::ALLOCATION_FAILED);
            }
        };

        Ok(Self {
            rt_dev: dev,
            rt_buffer: buffer.clone(),
            rt_image: image,
            rt_view: view,
            rt_framebuffer: framebuffer,
            rt_memories: memories,
            rt_setup: setup,
            rt_transitioned: false,
        })
    }
}

impl Drop for RenderTarget {
    fn drop(&mut self) {
        log::debug!("destroying render target for buffer {}", self.rt_buffer.id());
        unsafe {
            self.rt_dev.dev.destroy_framebuffer(self.rt_framebuffer, None);
            self.rt_dev.dev.destroy_image_view(self.rt_view, None);
            self.rt_dev.dev.destroy_image(self.rt_image, None);
            for mem in self.rt_memories.iter() {
                self.rt_dev.dev.free_memory(*mem, None);
            }
        }
    }
}

/// The set of render targets known to the renderer, keyed by the
/// external buffer's identity.
pub(crate) struct TargetRegistry {
    tr_dev: Arc<Device>,
    tr_targets: HashMap<u64, RenderTarget>,
}

impl TargetRegistry {
    pub fn new(dev: Arc<Device>) -> Self {
        Self {
            tr_dev: dev,
            tr_targets: HashMap::new(),
        }
    }

    /// Get the RenderTarget wrapping `buffer`, importing it on first
    /// use. Binding the same buffer repeatedly reuses the cached
    /// target without creating any GPU objects.
    pub fn get_or_create(
        &mut self,
        statics: &StaticRenderData,
        setups: &mut SetupCache,
        buffer: &TargetBuffer,
    ) -> Result<&mut RenderTarget> {
        if !self.tr_targets.contains_key(&buffer.id()) {
            let target = RenderTarget::create(self.tr_dev.clone(), statics, setups, buffer)?;
            self.tr_targets.insert(buffer.id(), target);
        }

        Ok(self.tr_targets.get_mut(&buffer.id()).unwrap())
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut RenderTarget> {
        self.tr_targets.get_mut(&id)
    }

    pub fn get(&self, id: u64) -> Option<&RenderTarget> {
        self.tr_targets.get(&id)
    }

    /// Drop the target wrapping `buffer`, if any. Called from the
    /// external buffer's own teardown notification.
    pub fn remove(&mut self, buffer: &TargetBuffer) {
        self.tr_targets.remove(&buffer.id());
    }
}
