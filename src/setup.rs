// Per-format render target setup
//
// Rendering into a target needs a render pass and pipelines compiled
// against that target's format. Those are expensive to build, so one
// setup is cached per pixel format and shared by every target of that
// format. The render pass loads and stores the existing attachment
// contents so partial redraws composite correctly, and keeps the
// image in the GENERAL layout the ownership-transfer protocol expects.

use ash::util;
use ash::vk;

use crate::device::Device;
use crate::renderer::{VERT_PUSH_SIZE, FRAG_PUSH_SIZE};
use crate::{Result, SquallError};

use std::io::Cursor;
use std::sync::Arc;

/// Render data shared by every format setup
///
/// The sampler is baked into the descriptor layout as an immutable
/// sampler, so one of these serves every texture binding the renderer
/// ever makes.
pub(crate) struct StaticRenderData {
    srd_dev: Arc<Device>,
    pub(crate) srd_sampler: vk::Sampler,
    pub(crate) srd_ds_layout: vk::DescriptorSetLayout,
    pub(crate) srd_pipe_layout: vk::PipelineLayout,
    srd_vert_module: vk::ShaderModule,
    srd_tex_frag_module: vk::ShaderModule,
    srd_quad_frag_module: vk::ShaderModule,
}

impl StaticRenderData {
    fn create_shader_module(dev: &Device, code: &[u8]) -> Result<vk::ShaderModule> {
        let words = util::read_spv(&mut Cursor::new(code)).expect("Could not parse spv");
        let info = vk::ShaderModuleCreateInfo::builder().code(&words);

        unsafe {
            dev.dev
                .create_shader_module(&info, None)
                .map_err(|_| SquallError::ALLOCATION_FAILED)
        }
    }

    pub fn new(dev: Arc<Device>) -> Result<Self> {
        // default sampler (non ycbcr)
        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .max_anisotropy(1.0)
            .min_lod(0.0)
            .max_lod(0.25)
            .border_color(vk::BorderColor::FLOAT_TRANSPARENT_BLACK);

        let sampler = unsafe {
            dev.dev
                .create_sampler(&sampler_info, None)
                .map_err(|_| SquallError::ALLOCATION_FAILED)?
        };

        // One combined image sampler per texture, with the sampler
        // above immutable in the layout.
        let samplers = [sampler];
        let bindings = [vk::DescriptorSetLayoutBinding::builder()
            .binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            .immutable_samplers(&samplers)
            .build()];
        let ds_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);

        let ds_layout = match unsafe { dev.dev.create_descriptor_set_layout(&ds_info, None) } {
            Ok(l) => l,
            Err(_) => {
                unsafe { dev.dev.destroy_sampler(sampler, None) };
                return Err(SquallError::ALLOCATION_FAILED);
            }
        };

        // Both pipelines share one layout: the vertex transform block
        // followed by either the alpha float or the quad color.
        let constants = [
            vk::PushConstantRange::builder()
                .stage_flags(vk::ShaderStageFlags::VERTEX)
                .offset(0)
                .size(VERT_PUSH_SIZE)
                .build(),
            vk::PushConstantRange::builder()
                .stage_flags(vk::ShaderStageFlags::FRAGMENT)
                .offset(VERT_PUSH_SIZE)
                .size(FRAG_PUSH_SIZE)
                .build(),
        ];
        let layouts = [ds_layout];
        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .push_constant_ranges(&constants)
            .set_layouts(&layouts);

        // roll back whatever exists so far if a later step fails
        let release = |modules: &[vk::ShaderModule], layout: Option<vk::PipelineLayout>| unsafe {
            for module in modules.iter() {
                dev.dev.destroy_shader_module(*module, None);
            }
            if let Some(l) = layout {
                dev.dev.destroy_pipeline_layout(l, None);
            }
            dev.dev.destroy_descriptor_set_layout(ds_layout, None);
            dev.dev.destroy_sampler(sampler, None);
        };

        let pipe_layout = match unsafe { dev.dev.create_pipeline_layout(&layout_info, None) } {
            Ok(l) => l,
            Err(_) => {
                release(&[], None);
                return Err(SquallError::ALLOCATION_FAILED);
            }
        };

        let vert_module = match Self::create_shader_module(
            &dev,
            &include_bytes!(concat!(env!("OUT_DIR"), "/quad.vert.spv"))[..],
        ) {
            Ok(m) => m,
            Err(e) => {
                release(&[], Some(pipe_layout));
                return Err(e);
            }
        };
        let tex_frag_module = match Self::create_shader_module(
            &dev,
            &include_bytes!(concat!(env!("OUT_DIR"), "/texture.frag.spv"))[..],
        ) {
            Ok(m) => m,
            Err(e) => {
                release(&[vert_module], Some(pipe_layout));
                return Err(e);
            }
        };
        let quad_frag_module = match Self::create_shader_module(
            &dev,
            &include_bytes!(concat!(env!("OUT_DIR"), "/quad.frag.spv"))[..],
        ) {
            Ok(m) => m,
            Err(e) => {
                release(&[vert_module, tex_frag_module], Some(pipe_layout));
                return Err(e);
            }
        };

        Ok(Self {
            srd_dev: dev,
            srd_sampler: sampler,
            srd_ds_layout: ds_layout,
            srd_pipe_layout: pipe_layout,
            srd_vert_module: vert_module,
            srd_tex_frag_module: tex_frag_module,
            srd_quad_frag_module: quad_frag_module,
        })
    }
}

impl Drop for StaticRenderData {
    fn drop(&mut self) {
        unsafe {
            let dev = &self.srd_dev.dev;
            dev.destroy_shader_module(self.srd_vert_module, None);
            dev.destroy_shader_module(self.srd_tex_frag_module, None);
            dev.destroy_shader_module(self.srd_quad_frag_module, None);
            dev.destroy_pipeline_layout(self.srd_pipe_layout, None);
            dev.destroy_descriptor_set_layout(self.srd_ds_layout, None);
            dev.destroy_sampler(self.srd_sampler, None);
        }
    }
}

/// Everything needed to render into targets of one pixel format
pub(crate) struct RenderFormatSetup {
    rs_dev: Arc<Device>,
    pub(crate) rs_format: vk::Format,
    pub(crate) rs_render_pass: vk::RenderPass,
    pub(crate) rs_tex_pipe: vk::Pipeline,
    pub(crate) rs_quad_pipe: vk::Pipeline,
}

impl Drop for RenderFormatSetup {
    fn drop(&mut self) {
        unsafe {
            let dev = &self.rs_dev.dev;
            dev.destroy_pipeline(self.rs_tex_pipe, None);
            dev.destroy_pipeline(self.rs_quad_pipe, None);
            dev.destroy_render_pass(self.rs_render_pass, None);
        }
    }
}

/// The per-format setup cache. At most one setup exists per distinct
/// format at any time.
pub(crate) struct SetupCache {
    sc_dev: Arc<Device>,
    sc_setups: Vec<Arc<RenderFormatSetup>>,
}

impl SetupCache {
    pub fn new(dev: Arc<Device>) -> Self {
        Self {
            sc_dev: dev,
            sc_setups: Vec::new(),
        }
    }

    /// A render pass rendering into one color attachment of `format`.
    ///
    /// The two dependencies serialize the pass against prior host and
    /// transfer writes (staged uploads) and subsequent transfer and
    /// host reads (readback), which is what lets the staging and
    /// render command streams share a queue without semaphores.
    fn create_pass(dev: &Device, format: vk::Format) -> Result<vk::RenderPass> {
        let attachments = [vk::AttachmentDescription {
            format,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::LOAD,
            store_op: vk::AttachmentStoreOp::STORE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::GENERAL,
            final_layout: vk::ImageLayout::GENERAL,
            ..Default::default()
        }];

        let color_refs = [vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }];

        let subpasses = [vk::SubpassDescription::builder()
            .color_attachments(&color_refs)
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .build()];

        let dependencies = [
            vk::SubpassDependency {
                src_subpass: vk::SUBPASS_EXTERNAL,
                src_stage_mask: vk::PipelineStageFlags::HOST
                    | vk::PipelineStageFlags::TRANSFER
                    | vk::PipelineStageFlags::TOP_OF_PIPE
                    | vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                src_access_mask: vk::AccessFlags::HOST_WRITE
                    | vk::AccessFlags::TRANSFER_WRITE
                    | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                dst_subpass: 0,
                dst_stage_mask: vk::PipelineStageFlags::ALL_GRAPHICS,
                dst_access_mask: vk::AccessFlags::UNIFORM_READ
                    | vk::AccessFlags::VERTEX_ATTRIBUTE_READ
                    | vk::AccessFlags::INDIRECT_COMMAND_READ
                    | vk::AccessFlags::SHADER_READ,
                ..Default::default()
            },
            vk::SubpassDependency {
                src_subpass: 0,
                src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                src_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                dst_subpass: vk::SUBPASS_EXTERNAL,
                dst_stage_mask: vk::PipelineStageFlags::TRANSFER
                    | vk::PipelineStageFlags::HOST
                    | vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                dst_access_mask: vk::AccessFlags::TRANSFER_READ | vk::AccessFlags::MEMORY_READ,
                ..Default::default()
            },
        ];

        let rp_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        unsafe {
            dev.dev.create_render_pass(&rp_info, None).map_err(|_| {
                log::error!("Failed to create render pass");
                SquallError::ALLOCATION_FAILED
            })
        }
    }

    /// Configure and create one of our graphics pipelines
    ///
    /// Both pipelines are identical apart from the fragment shader:
    /// no vertex input (the quad is generated in the vertex stage),
    /// a 4 vertex triangle fan, no culling, premultiplied alpha
    /// blending, and dynamic viewport/scissor.
    fn create_pipeline(
        dev: &Device,
        layout: vk::PipelineLayout,
        pass: vk::RenderPass,
        vert_module: vk::ShaderModule,
        frag_module: vk::ShaderModule,
    ) -> Result<vk::Pipeline> {
        let entrypoint = std::ffi::CString::new("main").unwrap();
        let stages = [
            vk::PipelineShaderStageCreateInfo {
                module: vert_module,
                p_name: entrypoint.as_ptr(),
                stage: vk::ShaderStageFlags::VERTEX,
                ..Default::default()
            },
            vk::PipelineShaderStageCreateInfo {
                module: frag_module,
                p_name: entrypoint.as_ptr(),
                stage: vk::ShaderStageFlags::FRAGMENT,
                ..Default::default()
            },
        ];

        let vertex_info = vk::PipelineVertexInputStateCreateInfo::builder();

        let assembly = vk::PipelineInputAssemblyStateCreateInfo {
            topology: vk::PrimitiveTopology::TRIANGLE_FAN,
            ..Default::default()
        };

        let raster_info = vk::PipelineRasterizationStateCreateInfo {
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            line_width: 1.0,
            ..Default::default()
        };

        // we work with pre-multiplied alpha
        let blend_attachment_states = [vk::PipelineColorBlendAttachmentState {
            blend_enable: vk::TRUE,
            src_color_blend_factor: vk::BlendFactor::ONE,
            dst_color_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            color_blend_op: vk::BlendOp::ADD,
            src_alpha_blend_factor: vk::BlendFactor::ONE,
            dst_alpha_blend_factor: vk::BlendFactor::ONE,
            alpha_blend_op: vk::BlendOp::ADD,
            color_write_mask: vk::ColorComponentFlags::RGBA,
        }];
        let blend_info =
            vk::PipelineColorBlendStateCreateInfo::builder().attachments(&blend_attachment_states);

        let multisample_info = vk::PipelineMultisampleStateCreateInfo {
            rasterization_samples: vk::SampleCountFlags::TYPE_1,
            ..Default::default()
        };

        // viewport and scissor are set per frame
        let viewport_info = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);
        let dyn_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_info = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dyn_states);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_info)
            .input_assembly_state(&assembly)
            .viewport_state(&viewport_info)
            .rasterization_state(&raster_info)
            .multisample_state(&multisample_info)
            .color_blend_state(&blend_info)
            .dynamic_state(&dynamic_info)
            .layout(layout)
            .render_pass(pass)
            .build();

        unsafe {
            match dev.dev.create_graphics_pipelines(
                vk::PipelineCache::null(),
                &[pipeline_info],
                None,
            ) {
                Ok(pipes) => Ok(pipes[0]),
                Err(_) => {
                    log::error!("Failed to create graphics pipeline");
                    Err(SquallError::ALLOCATION_FAILED)
                }
            }
        }
    }

    /// Get the setup for `format`, constructing it on first use.
    ///
    /// Failure at any creation step releases the partially created
    /// objects and leaves the cache untouched.
    pub fn get_or_create(
        &mut self,
        statics: &StaticRenderData,
        format: vk::Format,
    ) -> Result<Arc<RenderFormatSetup>> {
        if let Some(setup) = self.sc_setups.iter().find(|s| s.rs_format == format) {
            return Ok(setup.clone());
        }

        let pass = Self::create_pass(&self.sc_dev, format)?;

        let tex_pipe = match Self::create_pipeline(
            &self.sc_dev,
            statics.srd_pipe_layout,
            pass,
            statics.srd_vert_module,
            statics.srd_tex_frag_module,
        ) {
            Ok(p) => p,
            Err(e) => {
                unsafe { self.sc_dev.dev.destroy_render_pass(pass, None) };
                return Err(e);
            }
        };

        let quad_pipe = match Self::create_pipeline(
            &self.sc_dev,
            statics.srd_pipe_layout,
            pass,
            statics.srd_vert_module,
            statics.srd_quad_frag_module,
        ) {
            Ok(p) => p,
            Err(e) => {
                unsafe {
                    self.sc_dev.dev.destroy_pipeline(tex_pipe, None);
                    self.sc_dev.dev.destroy_render_pass(pass, None);
                }
                return Err(e);
            }
        };

        let setup = Arc::new(RenderFormatSetup {
            rs_dev: self.sc_dev.clone(),
            rs_format: format,
            rs_render_pass: pass,
            rs_tex_pipe: tex_pipe,
            rs_quad_pipe: quad_pipe,
        });
        self.sc_setups.push(setup.clone());

        Ok(setup)
    }
}
