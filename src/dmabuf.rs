// Dmabuf import
//
// Client buffers and destination buffers both arrive as dmabufs: sets
// of fds pointing at GPU memory some other driver allocated. We import
// that memory and wrap it in a vkImage so the rest of the renderer can
// treat it like any other image. The memory stays owned by the
// producer; ownership of the *contents* is what the queue family
// transfer barriers in the frame controller negotiate.

use ash::vk;

use crate::device::Device;
use crate::{Result, SquallError};

use nix::fcntl::{fcntl, FcntlArg};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};

/// The most planes any format we support can carry
const MAX_DMABUF_PLANES: usize = 4;

/// One plane of a dmabuf
///
/// Represents a single fd/offset/stride triple the producer handed
/// over. Single-plane formats have exactly one of these.
#[derive(Debug)]
pub struct DmabufPlane {
    pub dp_fd: OwnedFd,
    pub dp_offset: u32,
    pub dp_stride: u32,
}

impl Clone for DmabufPlane {
    fn clone(&self) -> Self {
        Self {
            dp_fd: self.dp_fd.try_clone().expect("Could not dup fd"),
            dp_offset: self.dp_offset,
            dp_stride: self.dp_stride,
        }
    }
}

impl DmabufPlane {
    pub fn new(fd: OwnedFd, offset: u32, stride: u32) -> Self {
        Self {
            dp_fd: fd,
            dp_offset: offset,
            dp_stride: stride,
        }
    }
}

/// The full description of one dmabuf
#[derive(Debug, Clone)]
pub struct DmabufAttributes {
    pub da_width: i32,
    pub da_height: i32,
    /// DRM fourcc code of the pixel data
    pub da_format: u32,
    /// DRM format modifier, shared by all planes
    pub da_modifier: u64,
    pub da_planes: Vec<DmabufPlane>,
}

impl DmabufAttributes {
    pub fn new(width: i32, height: i32, format: u32, modifier: u64) -> Self {
        Self {
            da_width: width,
            da_height: height,
            da_format: format,
            da_modifier: modifier,
            da_planes: Vec::with_capacity(1),
        }
    }

    pub fn add_plane(&mut self, plane: DmabufPlane) {
        self.da_planes.push(plane);
    }

    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.da_width as u32,
            height: self.da_height as u32,
        }
    }
}

fn memory_plane_aspect(idx: usize) -> vk::ImageAspectFlags {
    match idx {
        0 => vk::ImageAspectFlags::MEMORY_PLANE_0_EXT,
        1 => vk::ImageAspectFlags::MEMORY_PLANE_1_EXT,
        2 => vk::ImageAspectFlags::MEMORY_PLANE_2_EXT,
        _ => vk::ImageAspectFlags::MEMORY_PLANE_3_EXT,
    }
}

impl Device {
    /// returns the index of a memory type both the image and the
    /// dmabuf can live in
    ///
    /// Don't require DEVICE_LOCAL here, since the dmabuf may be a
    /// sysmem buffer.
    fn find_memtype_for_dmabuf(dmabuf_type_bits: u32, reqs: &vk::MemoryRequirements) -> Result<u32> {
        for i in 0..32 {
            if (dmabuf_type_bits >> i) & 1 == 1 && (reqs.memory_type_bits >> i) & 1 == 1 {
                return Ok(i);
            }
        }

        log::error!("Could not find a memory type for the dmabuf");
        Err(SquallError::NO_MEMORY_TYPE)
    }

    /// Import a dmabuf as a vkImage plus its backing memories.
    ///
    /// `for_render` selects attachment usage for destination buffers;
    /// otherwise the image is imported for sampling. One memory import
    /// is performed per plane, bound disjointly when the buffer has
    /// more than one plane.
    pub(crate) fn import_dmabuf(
        &self,
        attribs: &DmabufAttributes,
        for_render: bool,
    ) -> Result<(vk::Image, Vec<vk::DeviceMemory>)> {
        if attribs.da_planes.is_empty()
            || attribs.da_planes.len() > MAX_DMABUF_PLANES
            || attribs.da_width <= 0
            || attribs.da_height <= 0
        {
            return Err(SquallError::INVALID_DMABUF);
        }

        let entry = self.usable_format(attribs.da_format, for_render)?;
        let disjoint = attribs.da_planes.len() > 1;

        let plane_layouts: Vec<vk::SubresourceLayout> = attribs
            .da_planes
            .iter()
            .map(|plane| {
                vk::SubresourceLayout::builder()
                    .offset(plane.dp_offset as u64)
                    .row_pitch(plane.dp_stride as u64)
                    .size(0)
                    .build()
            })
            .collect();

        let mut drm_create_info = vk::ImageDrmFormatModifierExplicitCreateInfoEXT::builder()
            .drm_format_modifier(attribs.da_modifier)
            .plane_layouts(plane_layouts.as_slice())
            .build();
        let mut ext_mem_info = vk::ExternalMemoryImageCreateInfo::builder()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT)
            .build();

        let usage = if for_render {
            vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST
        } else {
            vk::ImageUsageFlags::SAMPLED
        };
        let mut flags = vk::ImageCreateFlags::empty();
        if disjoint {
            flags |= vk::ImageCreateFlags::DISJOINT;
        }

        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(entry.vk_format)
            .extent(vk::Extent3D {
                width: attribs.da_width as u32,
                height: attribs.da_height as u32,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .flags(flags)
            .push_next(&mut ext_mem_info)
            .push_next(&mut drm_create_info)
            .build();

        let image = unsafe {
            self.dev
                .create_image(&image_info, None)
                .map_err(|_| SquallError::INVALID_DMABUF)?
        };

        match self.import_dmabuf_memories(attribs, image, disjoint) {
            Ok(memories) => Ok((image, memories)),
            Err(e) => {
                unsafe { self.dev.destroy_image(image, None) };
                Err(e)
            }
        }
    }

    /// Import and bind the per-plane memory of a freshly created
    /// dmabuf image. On failure everything imported so far is freed
    /// and the image is left for the caller to destroy.
    fn import_dmabuf_memories(
        &self,
        attribs: &DmabufAttributes,
        image: vk::Image,
        disjoint: bool,
    ) -> Result<Vec<vk::DeviceMemory>> {
        let mut memories = Vec::with_capacity(attribs.da_planes.len());
        let mut bind_infos = Vec::with_capacity(attribs.da_planes.len());
        let mut plane_infos = Vec::with_capacity(attribs.da_planes.len());

        let release = |dev: &ash::Device, mems: &[vk::DeviceMemory]| {
            for mem in mems.iter() {
                unsafe { dev.free_memory(*mem, None) };
            }
        };

        for (idx, plane) in attribs.da_planes.iter().enumerate() {
            // supported memory types we can import this fd as
            let dmabuf_type_bits = unsafe {
                match self.external_mem_fd_loader.get_memory_fd_properties(
                    vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT,
                    plane.dp_fd.as_raw_fd(),
                ) {
                    Ok(props) => props.memory_type_bits,
                    Err(_) => {
                        release(&self.dev, &memories);
                        return Err(SquallError::INVALID_DMABUF);
                    }
                }
            };

            let mem_reqs = if disjoint {
                let mut plane_req_info = vk::ImagePlaneMemoryRequirementsInfo::builder()
                    .plane_aspect(memory_plane_aspect(idx))
                    .build();
                let req_info = vk::ImageMemoryRequirementsInfo2::builder()
                    .image(image)
                    .push_next(&mut plane_req_info)
                    .build();
                let mut reqs = vk::MemoryRequirements2::builder().build();
                unsafe { self.dev.get_image_memory_requirements2(&req_info, &mut reqs) };
                reqs.memory_requirements
            } else {
                unsafe { self.dev.get_image_memory_requirements(image) }
            };

            let memtype_index = match Self::find_memtype_for_dmabuf(dmabuf_type_bits, &mem_reqs) {
                Ok(i) => i,
                Err(e) => {
                    release(&self.dev, &memories);
                    return Err(e);
                }
            };

            // The import consumes the fd, so hand vulkan its own copy.
            // It is possible the fd went bad because the client that
            // owns it died; don't treat that as fatal to the renderer.
            let fd = match fcntl(plane.dp_fd.as_raw_fd(), FcntlArg::F_DUPFD_CLOEXEC(0)) {
                Ok(f) => unsafe { OwnedFd::from_raw_fd(f) },
                Err(_e) => {
                    log::debug!("could not dup dmabuf fd: {:?}", _e);
                    release(&self.dev, &memories);
                    return Err(SquallError::INVALID_FD);
                }
            };

            let mut import_fd_info = vk::ImportMemoryFdInfoKHR::builder()
                .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT)
                .fd(fd.as_raw_fd())
                .build();
            let mut dedicated_alloc_info =
                vk::MemoryDedicatedAllocateInfo::builder().image(image).build();

            let mut alloc_info = vk::MemoryAllocateInfo::builder()
                .allocation_size(mem_reqs.size)
                .memory_type_index(memtype_index)
                .push_next(&mut import_fd_info);
            if !disjoint {
                alloc_info = alloc_info.push_next(&mut dedicated_alloc_info);
            }
            let alloc_info = alloc_info.build();

            let memory = match unsafe { self.dev.allocate_memory(&alloc_info, None) } {
                Ok(m) => m,
                Err(_) => {
                    release(&self.dev, &memories);
                    return Err(SquallError::ALLOCATION_FAILED);
                }
            };
            // vulkan owns the dup now
            let _ = fd.into_raw_fd();
            memories.push(memory);

            if disjoint {
                plane_infos.push(
                    vk::BindImagePlaneMemoryInfo::builder()
                        .plane_aspect(memory_plane_aspect(idx))
                        .build(),
                );
                bind_infos.push(
                    vk::BindImageMemoryInfo::builder()
                        .image(image)
                        .memory(memory)
                        .memory_offset(0)
                        .build(),
                );
            }
        }

        let bound = if disjoint {
            for (bind, plane) in bind_infos.iter_mut().zip(plane_infos.iter_mut()) {
                bind.p_next = plane as *mut _ as *const std::ffi::c_void;
            }
            unsafe { self.dev.bind_image_memory2(bind_infos.as_slice()).is_ok() }
        } else {
            unsafe { self.dev.bind_image_memory(image, memories[0], 0).is_ok() }
        };

        if !bound {
            release(&self.dev, &memories);
            return Err(SquallError::INVALID_DMABUF);
        }

        Ok(memories)
    }
}
