// Textures represent the pixel sources composited into the target:
// either a client's GPU buffer imported zero-copy, or shm contents
// staged through host-visible memory and copied up.
//
// Dmabuf textures stay owned by their producer between frames. The
// frame controller tracks which of them were sampled during the
// current frame and batches the ownership handoff barriers at frame
// boundaries, so all this module records per draw is the flags that
// protocol needs.

use ash::vk;

use crate::descpool::Descriptor;
use crate::device::Device;
use crate::dmabuf::DmabufAttributes;
use crate::renderer::Renderer;
use crate::{Result, SquallError};

use std::sync::{Arc, RwLock};

/// A pixel source for draw_texture.
///
/// Clones share the same underlying image. GPU resources are freed
/// when the last clone drops; during a frame, hand the texture to
/// `Renderer::destroy_texture` instead of dropping it so teardown can
/// be deferred until the GPU is provably done with it.
#[derive(Clone)]
pub struct Texture {
    pub(crate) t_internal: Arc<RwLock<TextureInternal>>,
}

pub(crate) struct TextureInternal {
    tx_dev: Arc<Device>,
    pub(crate) tx_image: vk::Image,
    pub(crate) tx_view: vk::ImageView,
    tx_memories: Vec<vk::DeviceMemory>,
    pub(crate) tx_width: u32,
    pub(crate) tx_height: u32,
    /// bytes per pixel of the texture's format
    tx_pixel_size: u32,
    /// Is this texture backed by externally owned dmabuf memory
    pub(crate) tx_dmabuf_imported: bool,
    /// Whether this renderer currently holds ownership of the image.
    /// Only meaningful for dmabuf textures; set while the texture sits
    /// on the frame controller's foreign worklist.
    pub(crate) tx_owned: bool,
    /// Flips to true on the first layout transition ever performed on
    /// this image and never reverts. Before the flip the old layout
    /// is UNDEFINED, after it the image is in a known layout.
    pub(crate) tx_transitioned: bool,
    /// Frame counter stamp of the last draw sampling this texture,
    /// used to defer destruction while the frame is in flight.
    pub(crate) tx_last_used: u64,
    pub(crate) tx_desc: Descriptor,
}

impl Drop for TextureInternal {
    fn drop(&mut self) {
        log::debug!("Deleting texture image view {:?}", self.tx_view);
        unsafe {
            self.tx_dev.dev.destroy_image_view(self.tx_view, None);
            self.tx_dev.dev.destroy_image(self.tx_image, None);
            for mem in self.tx_memories.iter() {
                self.tx_dev.dev.free_memory(*mem, None);
            }
        }
    }
}

impl Texture {
    pub fn size(&self) -> (u32, u32) {
        let internal = self.t_internal.read().unwrap();
        (internal.tx_width, internal.tx_height)
    }
}

impl PartialEq for Texture {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.t_internal, &other.t_internal)
    }
}

/// Point the texture's combined image sampler binding at `view`. The
/// sampler itself is immutable in the layout.
fn write_texture_descriptor(dev: &Device, set: vk::DescriptorSet, view: vk::ImageView) {
    let info = [vk::DescriptorImageInfo::builder()
        .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
        .image_view(view)
        .build()];
    let write_info = [vk::WriteDescriptorSet::builder()
        .dst_set(set)
        .dst_binding(0)
        .dst_array_element(0)
        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
        .image_info(&info)
        .build()];

    unsafe {
        dev.dev.update_descriptor_sets(&write_info, &[]);
    }
}

/// Validate an upload's stride against its dimensions and data
/// length, returning the stride in bytes with the tightly-packed
/// default applied.
fn checked_stride(
    stride: u32,
    width: u32,
    height: u32,
    pixel_size: u32,
    data_len: usize,
) -> Result<u32> {
    let stride = match stride {
        0 => width * pixel_size,
        s => s,
    };

    if stride % pixel_size != 0 || stride < width * pixel_size {
        return Err(SquallError::INVALID_STRIDE);
    }
    if (stride as usize) * (height as usize) > data_len {
        return Err(SquallError::INVALID_STRIDE);
    }

    Ok(stride)
}

impl Renderer {
    /// Create a texture and fill it from raw pixel data.
    ///
    /// A stride of zero implies tightly packed rows. The upload is
    /// staged through transient host-visible memory and executes on
    /// the GPU before the next frame's render commands.
    pub fn create_texture_from_pixels(
        &mut self,
        drm_format: u32,
        data: &[u8],
        width: u32,
        height: u32,
        stride: u32,
    ) -> Result<Texture> {
        let entry = self.r_dev.usable_format(drm_format, false)?;
        let pixel_size = entry.bytes_per_pixel();
        let stride = checked_stride(stride, width, height, pixel_size, data.len())?;

        log::debug!("create_texture_from_pixels: {}x{}", width, height);

        let (image, view, memory) = self.r_dev.create_image(
            vk::Extent2D { width, height },
            entry.vk_format,
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::ImageTiling::OPTIMAL,
        )?;

        let release = |dev: &Arc<Device>| unsafe {
            dev.dev.destroy_image_view(view, None);
            dev.dev.destroy_image(image, None);
            dev.dev.free_memory(memory, None);
        };

        let desc = match self
            .r_desc_system
            .alloc_descriptor(self.r_statics.srd_ds_layout)
        {
            Ok(d) => d,
            Err(e) => {
                release(&self.r_dev);
                return Err(e);
            }
        };
        write_texture_descriptor(&self.r_dev, desc.d_set, view);

        if let Err(e) = self.stage_texture_upload(
            image,
            data,
            width,
            height,
            stride,
            pixel_size,
            // brand new image, contents undefined
            false,
        ) {
            release(&self.r_dev);
            return Err(e);
        }

        Ok(Texture {
            t_internal: Arc::new(RwLock::new(TextureInternal {
                tx_dev: self.r_dev.clone(),
                tx_image: image,
                tx_view: view,
                tx_memories: vec![memory],
                tx_width: width,
                tx_height: height,
                tx_pixel_size: pixel_size,
                tx_dmabuf_imported: false,
                tx_owned: false,
                tx_transitioned: true,
                tx_last_used: 0,
                tx_desc: desc,
            })),
        })
    }

    /// Replace the full contents of a shm texture.
    ///
    /// The new data must match the texture's dimensions.
    pub fn update_texture_from_pixels(
        &mut self,
        texture: &Texture,
        data: &[u8],
        stride: u32,
    ) -> Result<()> {
        let internal = texture.t_internal.read().unwrap();
        assert!(
            !internal.tx_dmabuf_imported,
            "dmabuf texture contents belong to their producer"
        );

        let stride = checked_stride(
            stride,
            internal.tx_width,
            internal.tx_height,
            internal.tx_pixel_size,
            data.len(),
        )?;

        self.stage_texture_upload(
            internal.tx_image,
            data,
            internal.tx_width,
            internal.tx_height,
            stride,
            internal.tx_pixel_size,
            true,
        )
    }

    /// Import a client's GPU buffer as a texture, without copying.
    ///
    /// The producer keeps ownership of the image contents between
    /// frames; sampling it during a frame triggers the acquire and
    /// release barriers at the frame boundaries.
    pub fn create_texture_from_dmabuf(&mut self, attribs: &DmabufAttributes) -> Result<Texture> {
        log::debug!("importing texture dmabuf {:?}", attribs);

        let entry = self.r_dev.usable_format(attribs.da_format, false)?;
        let (image, memories) = self.r_dev.import_dmabuf(attribs, false)?;

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
        let view = match unsafe { self.r_dev.dev.create_image_view(&view_info, None) } {
            Ok(v) => v,
            Err(_) => {
                unsafe {
                    self.r_dev.dev.destroy_image(image, None);
                    for mem in memories.iter() {
                        self.r_dev.dev.free_memory(*mem, None);
                    }
                }
                return Err(SquallError::ALLOCATION_FAILED);
            }
        };

        let desc = match self
            .r_desc_system
            .alloc_descriptor(self.r_statics.srd_ds_layout)
        {
            Ok(d) => d,
            Err(e) => {
                unsafe {
                    self.r_dev.dev.destroy_image_view(view, None);
                    self.r_dev.dev.destroy_image(image, None);
                    for mem in memories.iter() {
                        self.r_dev.dev.free_memory(*mem, None);
                    }
                }
                return Err(e);
            }
        };
        write_texture_descriptor(&self.r_dev, desc.d_set, view);

        Ok(Texture {
            t_internal: Arc::new(RwLock::new(TextureInternal {
                tx_dev: self.r_dev.clone(),
                tx_image: image,
                tx_view: view,
                tx_memories: memories,
                tx_width: attribs.da_width as u32,
                tx_height: attribs.da_height as u32,
                tx_pixel_size: entry.bytes_per_pixel(),
                tx_dmabuf_imported: true,
                tx_owned: false,
                tx_transitioned: false,
                tx_last_used: 0,
                tx_desc: desc,
            })),
        })
    }

    /// Release a texture.
    ///
    /// If the texture was sampled during the frame currently being
    /// recorded its resources may still be referenced by the GPU, so
    /// teardown is queued until the frame fence has signaled.
    pub fn destroy_texture(&mut self, texture: Texture) {
        let last_used = texture.t_internal.read().unwrap().tx_last_used;
        if last_used == self.r_frame {
            self.r_destroy_textures.push(texture);
            return;
        }

        // Not referenced by any in-flight work, drops now
        drop(texture);
    }

    /// Record a staged pixel upload into `image`.
    ///
    /// The pixel data lands in a staging span immediately; the copy
    /// itself is recorded on the staging command stream and runs when
    /// that stream is next submitted.
    #[allow(clippy::too_many_arguments)]
    fn stage_texture_upload(
        &mut self,
        image: vk::Image,
        data: &[u8],
        width: u32,
        height: u32,
        stride: u32,
        pixel_size: u32,
        in_shader_layout: bool,
    ) -> Result<()> {
        let len = (stride * height) as vk::DeviceSize;
        let span = self.r_stage.acquire(len)?;
        self.r_stage.upload(&span, &data[..len as usize]);

        let cbuf = self.r_stage.record();
        let old_layout = if in_shader_layout {
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        } else {
            vk::ImageLayout::UNDEFINED
        };

        unsafe {
            self.r_dev.change_image_layout(
                cbuf,
                image,
                old_layout,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::AccessFlags::empty(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::PipelineStageFlags::TRANSFER,
                vk::AccessFlags::TRANSFER_WRITE,
            );

            let region = vk::BufferImageCopy::builder()
                .buffer_offset(span.ss_offset)
                // row length is measured in texels
                .buffer_row_length(stride / pixel_size)
                .buffer_image_height(0)
                .image_subresource(
                    vk::ImageSubresourceLayers::builder()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .mip_level(0)
                        .base_array_layer(0)
                        .layer_count(1)
                        .build(),
                )
                .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
                .image_extent(vk::Extent3D {
                    width,
                    height,
                    depth: 1,
                })
                .build();
            self.r_dev.dev.cmd_copy_buffer_to_image(
                cbuf,
                span.ss_buffer,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );

            self.r_dev.change_image_layout(
                cbuf,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::PipelineStageFlags::TRANSFER,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::AccessFlags::SHADER_READ,
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stride_defaults_to_tightly_packed() {
        let stride = checked_stride(0, 64, 64, 4, 64 * 64 * 4).unwrap();
        assert_eq!(stride, 256);
    }

    #[test]
    fn stride_must_cover_the_row() {
        // stride smaller than a row of pixels
        assert_eq!(
            checked_stride(100, 64, 64, 4, 1 << 20),
            Err(SquallError::INVALID_STRIDE)
        );
        // stride not a whole number of pixels
        assert_eq!(
            checked_stride(258, 64, 64, 4, 1 << 20),
            Err(SquallError::INVALID_STRIDE)
        );
    }

    #[test]
    fn data_must_cover_the_image() {
        assert_eq!(
            checked_stride(256, 64, 64, 4, 256 * 63),
            Err(SquallError::INVALID_STRIDE)
        );
        assert!(checked_stride(256, 64, 64, 4, 256 * 64).is_ok());
    }
}
