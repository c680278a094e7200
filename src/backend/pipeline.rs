// Triangle pipeline
//
// Colour-only render pass targeting the swapchain image, plus the pipeline
// that draws the triangle into it. Viewport and scissor are dynamic, so
// nothing here depends on the swapchain extent and it all survives rebuilds.

use anyhow::{Context, Result};
use ash::vk;
use std::path::Path;
use super::{shader, VulkanDevice};

const VERTEX_SHADER: &str = "triangle.vert.spv";
const FRAGMENT_SHADER: &str = "triangle.frag.spv";

/// Render pass, layout and pipeline, destroyed together
pub struct TrianglePipeline {
    pub render_pass: vk::RenderPass,
    pub layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
}

impl TrianglePipeline {
    /// Build everything for `format`, loading SPIR-V from `shader_dir`.
    /// Nothing is left behind on failure.
    pub fn new(device: &VulkanDevice, format: vk::Format, shader_dir: &Path) -> Result<Self> {
        let render_pass = create_render_pass(device, format)?;

        match create_pipeline(device, render_pass, shader_dir) {
            Ok((layout, pipeline)) => Ok(Self {
                render_pass,
                layout,
                pipeline,
            }),
            Err(e) => {
                unsafe { device.device.destroy_render_pass(render_pass, None) };
                Err(e)
            }
        }
    }

    /// Framebuffer wrapping one swapchain image view
    pub fn create_framebuffer(
        &self,
        device: &VulkanDevice,
        image_view: vk::ImageView,
        extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer> {
        let attachments = [image_view];
        let info = vk::FramebufferCreateInfo::builder()
            .render_pass(self.render_pass)
            .attachments(&attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        unsafe { device.device.create_framebuffer(&info, None) }
            .context("Failed to create framebuffer")
    }

    /// Device must be idle
    pub fn destroy(&self, device: &VulkanDevice) {
        unsafe {
            device.device.destroy_pipeline(self.pipeline, None);
            device.device.destroy_pipeline_layout(self.layout, None);
            device.device.destroy_render_pass(self.render_pass, None);
        }
    }
}

/// One subpass writing the swapchain image, cleared on load and left ready
/// for presentation.
fn create_render_pass(device: &VulkanDevice, format: vk::Format) -> Result<vk::RenderPass> {
    let attachments = [vk::AttachmentDescription {
        format,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::STORE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        ..Default::default()
    }];

    let color_refs = [vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }];
    let subpasses = [vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs)
        .build()];

    // The acquire semaphore is waited on at COLOR_ATTACHMENT_OUTPUT, so the
    // UNDEFINED -> COLOR_ATTACHMENT_OPTIMAL transition must not start earlier.
    let dependencies = [vk::SubpassDependency {
        src_subpass: vk::SUBPASS_EXTERNAL,
        dst_subpass: 0,
        src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        src_access_mask: vk::AccessFlags::empty(),
        dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_READ
            | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        ..Default::default()
    }];

    let info = vk::RenderPassCreateInfo::builder()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    unsafe { device.device.create_render_pass(&info, None) }
        .context("Failed to create render pass")
}

fn create_pipeline(
    device: &VulkanDevice,
    render_pass: vk::RenderPass,
    shader_dir: &Path,
) -> Result<(vk::PipelineLayout, vk::Pipeline)> {
    let vert = shader::load_shader_module(device, &shader_dir.join(VERTEX_SHADER))?;
    let frag = match shader::load_shader_module(device, &shader_dir.join(FRAGMENT_SHADER)) {
        Ok(frag) => frag,
        Err(e) => {
            unsafe { device.device.destroy_shader_module(vert, None) };
            return Err(e);
        }
    };

    let layout_info = vk::PipelineLayoutCreateInfo::builder();
    let layout = unsafe { device.device.create_pipeline_layout(&layout_info, None) }
        .context("Failed to create pipeline layout");

    let result = layout.and_then(|layout| {
        match build_pipeline(device, render_pass, layout, vert, frag) {
            Ok(pipeline) => Ok((layout, pipeline)),
            Err(e) => {
                unsafe { device.device.destroy_pipeline_layout(layout, None) };
                Err(e)
            }
        }
    });

    // Baked into the pipeline, the modules are no longer needed
    unsafe {
        device.device.destroy_shader_module(vert, None);
        device.device.destroy_shader_module(frag, None);
    }
    result
}

/// The vertex shader generates its own positions: no vertex input, no
/// descriptors, no depth, no blending.
fn build_pipeline(
    device: &VulkanDevice,
    render_pass: vk::RenderPass,
    layout: vk::PipelineLayout,
    vert: vk::ShaderModule,
    frag: vk::ShaderModule,
) -> Result<vk::Pipeline> {
    let entry_point = c"main";
    let stages = [
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vert)
            .name(entry_point)
            .build(),
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(frag)
            .name(entry_point)
            .build(),
    ];

    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default();
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo {
        topology: vk::PrimitiveTopology::TRIANGLE_LIST,
        ..Default::default()
    };

    // Counts only, the rectangles are set while recording
    let viewport = vk::PipelineViewportStateCreateInfo {
        viewport_count: 1,
        scissor_count: 1,
        ..Default::default()
    };
    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

    let raster = vk::PipelineRasterizationStateCreateInfo {
        polygon_mode: vk::PolygonMode::FILL,
        cull_mode: vk::CullModeFlags::BACK,
        front_face: vk::FrontFace::CLOCKWISE,
        line_width: 1.0,
        ..Default::default()
    };
    let multisample = vk::PipelineMultisampleStateCreateInfo {
        rasterization_samples: vk::SampleCountFlags::TYPE_1,
        ..Default::default()
    };

    let blend_attachments = [vk::PipelineColorBlendAttachmentState {
        color_write_mask: vk::ColorComponentFlags::RGBA,
        ..Default::default()
    }];
    let blend = vk::PipelineColorBlendStateCreateInfo::builder().attachments(&blend_attachments);

    let info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport)
        .rasterization_state(&raster)
        .multisample_state(&multisample)
        .color_blend_state(&blend)
        .dynamic_state(&dynamic)
        .layout(layout)
        .render_pass(render_pass)
        .subpass(0)
        .build();

    let pipelines = unsafe {
        device
            .device
            .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
    }
    .map_err(|(_, e)| e)
    .context("Failed to create graphics pipeline")?;

    pipelines.into_iter().next().context("Driver returned no pipeline")
}
