// Vulkan device representation
//
// This stores per-GPU state: the logical device, the graphics queue
// the whole renderer runs on, and helpers for the memory and command
// buffer plumbing every other module needs.

use ash::extensions::khr;
use ash::vk;

use crate::format::{self, FormatEntry};
use crate::instance::Instance;
use crate::{Result, SquallError};

use nix::fcntl::{fcntl, FcntlArg};
use nix::sys::stat::{fstat, major, minor};
use std::ffi::CStr;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

/// Squall Device
///
/// This holds all of the Vulkan logic for one GPU. Everything runs on
/// a single graphics queue; transfer work is ordered against render
/// work by render pass dependencies instead of extra queues.
pub struct Device {
    pub(crate) inst: Arc<Instance>,
    /// the logical device we are using
    pub(crate) dev: ash::Device,
    /// the physical device selected by DRM node
    pub(crate) pdev: vk::PhysicalDevice,
    pub(crate) mem_props: vk::PhysicalDeviceMemoryProperties,
    /// The graphics queue family everything is recorded against.
    /// Ownership-transfer barriers move images between this family
    /// and QUEUE_FAMILY_FOREIGN_EXT.
    pub(crate) queue_family: u32,
    pub(crate) queue: vk::Queue,
    /// needed for VkGetMemoryFdPropertiesKHR
    pub(crate) external_mem_fd_loader: khr::ExternalMemoryFd,
    /// Our duplicate of the DRM render node fd this device was
    /// created for
    drm_fd: OwnedFd,

    /// Formats that passed the device feature probe, by use
    d_shm_formats: Vec<u32>,
    d_texture_formats: Vec<u32>,
    d_render_formats: Vec<u32>,
}

impl Device {
    /// The device extensions we cannot run without
    fn required_extensions() -> Vec<&'static CStr> {
        vec![
            khr::ExternalMemoryFd::name(),
            vk::ExtExternalMemoryDmaBufFn::name(),
            vk::ExtImageDrmFormatModifierFn::name(),
            vk::ExtQueueFamilyForeignFn::name(),
        ]
    }

    fn supports_extensions(inst: &ash::Instance, pdev: vk::PhysicalDevice) -> bool {
        let avail = match unsafe { inst.enumerate_device_extension_properties(pdev) } {
            Ok(props) => props,
            Err(_) => return false,
        };

        Self::required_extensions().iter().all(|needed| {
            avail.iter().any(|prop| {
                let name = unsafe { CStr::from_ptr(prop.extension_name.as_ptr()) };
                name == *needed
            })
        })
    }

    /// Get the DRM major/minor pair of a physical device
    ///
    /// This uses VK_EXT_physical_device_drm. Returns the primary and
    /// render node numbers as ((major, minor), (major, minor)).
    fn get_drm_dev(
        inst: &ash::Instance,
        pdev: vk::PhysicalDevice,
    ) -> Option<((i64, i64), (i64, i64))> {
        let mut drm_info = vk::PhysicalDeviceDrmPropertiesEXT::builder().build();
        let mut info = vk::PhysicalDeviceProperties2::builder().build();
        info.p_next = &mut drm_info as *mut _ as *mut std::ffi::c_void;

        unsafe { inst.get_physical_device_properties2(pdev, &mut info) };

        if drm_info.has_primary == 0 && drm_info.has_render == 0 {
            return None;
        }

        Some((
            (drm_info.primary_major, drm_info.primary_minor),
            (drm_info.render_major, drm_info.render_minor),
        ))
    }

    /// Choose the physical device matching the DRM node `drm_fd`
    /// refers to.
    ///
    /// We rather fail here than do some guesswork about which GPU the
    /// compositor meant.
    fn select_pdev(inst: &ash::Instance, drm_fd: RawFd) -> Result<vk::PhysicalDevice> {
        let stat = fstat(drm_fd).map_err(|_| SquallError::INVALID_FD)?;
        let dev_major = major(stat.st_rdev) as i64;
        let dev_minor = minor(stat.st_rdev) as i64;

        let pdevices = unsafe {
            inst.enumerate_physical_devices()
                .map_err(|_| SquallError::NO_DEVICE)?
        };

        for pdev in pdevices.iter() {
            if !Self::supports_extensions(inst, *pdev) {
                continue;
            }

            if let Some((primary, render)) = Self::get_drm_dev(inst, *pdev) {
                if primary == (dev_major, dev_minor) || render == (dev_major, dev_minor) {
                    return Ok(*pdev);
                }
            }
        }

        log::error!("Could not match the DRM fd against any Vulkan physical device");
        Err(SquallError::NO_DEVICE)
    }

    /// Choose a queue family
    ///
    /// returns an index into the array of queue types.
    fn select_queue_family(
        inst: &ash::Instance,
        pdev: vk::PhysicalDevice,
        flags: vk::QueueFlags,
    ) -> Result<u32> {
        unsafe { inst.get_physical_device_queue_family_properties(pdev) }
            .iter()
            .enumerate()
            .find(|(_, info)| info.queue_flags.contains(flags))
            .map(|(index, _)| index as u32)
            .ok_or(SquallError::NO_DEVICE)
    }

    /// Create a logical device for interfacing with the physical
    /// device. A single queue is created in the graphics family.
    fn create_device(
        inst: &ash::Instance,
        pdev: vk::PhysicalDevice,
        queue_family: u32,
    ) -> Result<ash::Device> {
        let dev_extension_names: Vec<*const i8> = Self::required_extensions()
            .iter()
            .map(|name| name.as_ptr())
            .collect();

        let priorities = [1.0];
        let queue_infos = [vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family)
            .queue_priorities(&priorities)
            .build()];

        let features = vk::PhysicalDeviceFeatures::builder().build();
        let dev_create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(dev_extension_names.as_slice())
            .enabled_features(&features)
            .build();

        unsafe {
            inst.create_device(pdev, &dev_create_info, None)
                .map_err(|_| SquallError::NO_DEVICE)
        }
    }

    /// Probe which of our known formats this device can actually use,
    /// split by role.
    fn probe_formats(inst: &ash::Instance, pdev: vk::PhysicalDevice) -> (Vec<u32>, Vec<u32>, Vec<u32>) {
        let mut shm = Vec::new();
        let mut tex = Vec::new();
        let mut render = Vec::new();

        for entry in format::FORMATS.iter() {
            let props =
                unsafe { inst.get_physical_device_format_properties(pdev, entry.vk_format) };

            if props
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::SAMPLED_IMAGE)
            {
                shm.push(entry.drm_format);
                tex.push(entry.drm_format);
            }
            if props
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::COLOR_ATTACHMENT_BLEND)
            {
                render.push(entry.drm_format);
            }
        }

        (shm, tex, render)
    }

    /// Create a new Device for the GPU driving `drm_fd`.
    ///
    /// The fd is duplicated; the caller keeps ownership of its copy.
    pub fn new(instance: Arc<Instance>, drm_fd: RawFd) -> Result<Self> {
        let dup = fcntl(drm_fd, FcntlArg::F_DUPFD_CLOEXEC(0)).map_err(|_| {
            log::error!("Could not dup the DRM fd");
            SquallError::INVALID_FD
        })?;
        let drm_fd = unsafe { OwnedFd::from_raw_fd(dup) };

        let pdev = Self::select_pdev(&instance.inst, drm_fd.as_raw_fd())?;
        let queue_family =
            Self::select_queue_family(&instance.inst, pdev, vk::QueueFlags::GRAPHICS)?;
        let mem_props = unsafe { instance.inst.get_physical_device_memory_properties(pdev) };

        let dev = Self::create_device(&instance.inst, pdev, queue_family)?;
        let queue = unsafe { dev.get_device_queue(queue_family, 0) };
        let ext_mem_loader = khr::ExternalMemoryFd::new(&instance.inst, &dev);

        let (shm, tex, render) = Self::probe_formats(&instance.inst, pdev);

        Ok(Self {
            inst: instance,
            dev,
            pdev,
            mem_props,
            queue_family,
            queue,
            external_mem_fd_loader: ext_mem_loader,
            drm_fd,
            d_shm_formats: shm,
            d_texture_formats: tex,
            d_render_formats: render,
        })
    }

    pub fn drm_fd(&self) -> RawFd {
        self.drm_fd.as_raw_fd()
    }

    pub fn shm_formats(&self) -> &[u32] {
        self.d_shm_formats.as_slice()
    }

    pub fn texture_formats(&self) -> &[u32] {
        self.d_texture_formats.as_slice()
    }

    pub fn render_formats(&self) -> &[u32] {
        self.d_render_formats.as_slice()
    }

    /// Look up a format entry, requiring render support for it when
    /// `for_render` is set.
    pub(crate) fn usable_format(&self, drm_format: u32, for_render: bool) -> Result<&'static FormatEntry> {
        let entry = format::format_from_drm(drm_format).ok_or_else(|| {
            log::error!(
                "Unsupported pixel format {:#x} ({})",
                drm_format,
                format::drm_format_name(drm_format)
            );
            SquallError::INVALID_FORMAT
        })?;

        let known = if for_render {
            self.d_render_formats.contains(&drm_format)
        } else {
            self.d_texture_formats.contains(&drm_format)
        };
        if !known {
            log::error!(
                "Format {} not supported by this device",
                format::drm_format_name(drm_format)
            );
            return Err(SquallError::INVALID_FORMAT);
        }

        Ok(entry)
    }

    /// Returns an index into the array of memory types for the memory
    /// properties
    ///
    /// Memory types specify the location and accessability of memory.
    /// Device local memory is resident on the GPU, while host visible
    /// memory can be read from the system side.
    pub(crate) fn find_memory_type_index(
        &self,
        reqs: &vk::MemoryRequirements,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<u32> {
        for (i, mem_type) in self.mem_props.memory_types.iter().enumerate() {
            // Bit i of memoryTypeBits is set if the resource supports
            // the ith memory type in props.
            if (reqs.memory_type_bits >> i) & 1 == 1 && mem_type.property_flags.contains(flags) {
                return Ok(i as u32);
            }
        }

        log::error!("Could not find memory type with flags {:?}", flags);
        Err(SquallError::NO_MEMORY_TYPE)
    }

    /// returns a new vkCommandPool for our queue family
    ///
    /// Command buffers are allocated from command pools. That's about
    /// all they do. They just manage memory.
    pub(crate) fn create_command_pool(&self) -> Result<vk::CommandPool> {
        let pool_create_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(self.queue_family);

        unsafe {
            self.dev
                .create_command_pool(&pool_create_info, None)
                .map_err(|_| SquallError::ALLOCATION_FAILED)
        }
    }

    /// Allocate a vec of vkCommandBuffers
    ///
    /// Command buffer is shortened to `cbuf` in many areas of the
    /// code.
    pub(crate) fn create_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let cbuf_allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_buffer_count(count)
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY);

        unsafe {
            self.dev
                .allocate_command_buffers(&cbuf_allocate_info)
                .map_err(|_| SquallError::ALLOCATION_FAILED)
        }
    }

    /// Allocates a buffer/memory pair of size `size`.
    ///
    /// There are two components to a memory backed resource in vulkan:
    /// vkBuffer which is the handle itself, and vkDeviceMemory which
    /// represents a region of allocated memory to hold the buffer
    /// contents. Both are returned, as both need to be destroyed when
    /// they are done. The buffer comes back bound to its memory.
    pub(crate) fn create_buffer_with_size(
        &self,
        usage: vk::BufferUsageFlags,
        flags: vk::MemoryPropertyFlags,
        size: vk::DeviceSize,
    ) -> Result<(vk::Buffer, vk::DeviceMemory)> {
        let create_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .build();

        unsafe {
            let buffer = self
                .dev
                .create_buffer(&create_info, None)
                .map_err(|_| SquallError::ALLOCATION_FAILED)?;

            let req = self.dev.get_buffer_memory_requirements(buffer);
            let index = match self.find_memory_type_index(&req, flags) {
                Ok(i) => i,
                Err(e) => {
                    self.dev.destroy_buffer(buffer, None);
                    return Err(e);
                }
            };

            let alloc_info = vk::MemoryAllocateInfo {
                allocation_size: req.size,
                memory_type_index: index,
                ..Default::default()
            };
            let memory = match self.dev.allocate_memory(&alloc_info, None) {
                Ok(m) => m,
                Err(_) => {
                    self.dev.destroy_buffer(buffer, None);
                    return Err(SquallError::ALLOCATION_FAILED);
                }
            };

            if self.dev.bind_buffer_memory(buffer, memory, 0).is_err() {
                self.dev.destroy_buffer(buffer, None);
                self.dev.free_memory(memory, None);
                return Err(SquallError::ALLOCATION_FAILED);
            }

            Ok((buffer, memory))
        }
    }

    /// Writes `data` to `memory` at `offset`
    ///
    /// This is a helper method for mapping and updating the value
    /// stored in device memory. Memory needs to be host visible and
    /// coherent. This does not flush after writing.
    pub(crate) fn update_memory<T: Copy>(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        data: &[T],
    ) {
        if data.is_empty() {
            return;
        }

        let data_size = std::mem::size_of_val(data) as u64;
        unsafe {
            let ptr = self
                .dev
                .map_memory(memory, offset, data_size, vk::MemoryMapFlags::empty())
                .expect("Could not map device memory");

            // rust doesn't have a raw memcpy, so we need to transform
            // the void ptr to a slice. This is unsafe as the length
            // needs to be correct
            let dst = std::slice::from_raw_parts_mut(ptr as *mut T, data.len());
            dst.copy_from_slice(data);

            self.dev.unmap_memory(memory);
        }
    }

    /// Create a vkImage and the resources needed to use it
    ///   (vkImageView and vkDeviceMemory)
    ///
    /// Images are accessed through image views, which specify how the
    /// image will be modified or read. In vulkan memory management is
    /// more hands on, so we also allocate the device memory backing
    /// the image.
    pub(crate) fn create_image(
        &self,
        resolution: vk::Extent2D,
        vk_format: vk::Format,
        usage: vk::ImageUsageFlags,
        flags: vk::MemoryPropertyFlags,
        tiling: vk::ImageTiling,
    ) -> Result<(vk::Image, vk::ImageView, vk::DeviceMemory)> {
        let create_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(vk_format)
            .extent(vk::Extent3D {
                width: resolution.width,
                height: resolution.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(tiling)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .build();

        unsafe {
            let image = self
                .dev
                .create_image(&create_info, None)
                .map_err(|_| SquallError::ALLOCATION_FAILED)?;

            let mem_reqs = self.dev.get_image_memory_requirements(image);
            let memtype_index = match self.find_memory_type_index(&mem_reqs, flags) {
                Ok(i) => i,
                Err(e) => {
                    self.dev.destroy_image(image, None);
                    return Err(e);
                }
            };

            let alloc_info = vk::MemoryAllocateInfo::builder()
                .allocation_size(mem_reqs.size)
                .memory_type_index(memtype_index)
                .build();
            let image_memory = match self.dev.allocate_memory(&alloc_info, None) {
                Ok(m) => m,
                Err(_) => {
                    self.dev.destroy_image(image, None);
                    return Err(SquallError::ALLOCATION_FAILED);
                }
            };

            if self.dev.bind_image_memory(image, image_memory, 0).is_err() {
                self.dev.destroy_image(image, None);
                self.dev.free_memory(image_memory, None);
                return Err(SquallError::ALLOCATION_FAILED);
            }

            let view_info = vk::ImageViewCreateInfo::builder()
                .subresource_range(
                    vk::ImageSubresourceRange::builder()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .level_count(1)
                        .layer_count(1)
                        .build(),
                )
                .image(image)
                .format(vk_format)
                .view_type(vk::ImageViewType::TYPE_2D)
                .build();

            let view = match self.dev.create_image_view(&view_info, None) {
                Ok(v) => v,
                Err(_) => {
                    self.dev.destroy_image(image, None);
                    self.dev.free_memory(image_memory, None);
                    return Err(SquallError::ALLOCATION_FAILED);
                }
            };

            Ok((image, view, image_memory))
        }
    }

    /// Record an image layout transition into `cbuf`
    ///
    /// This is the single-image barrier used by the copy paths. The
    /// ownership-transfer barriers at frame boundaries are built
    /// separately since they carry queue family indices.
    #[allow(clippy::too_many_arguments)]
    pub(crate) unsafe fn change_image_layout(
        &self,
        cbuf: vk::CommandBuffer,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        src_stage: vk::PipelineStageFlags,
        src_access: vk::AccessFlags,
        new_layout: vk::ImageLayout,
        dst_stage: vk::PipelineStageFlags,
        dst_access: vk::AccessFlags,
    ) {
        let barrier = vk::ImageMemoryBarrier::builder()
            .image(image)
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .subresource_range(
                vk::ImageSubresourceRange::builder()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .layer_count(1)
                    .level_count(1)
                    .build(),
            )
            .build();

        self.dev.cmd_pipeline_barrier(
            cbuf,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            // let outstanding work drain before the handles go away
            let _ = self.dev.device_wait_idle();
            self.dev.destroy_device(None);
        }
    }
}
