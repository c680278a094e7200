// Swapchain - Window presentation
//
// A surface set is the swapchain plus one image view and one framebuffer per
// presentable image. It is rebuilt as a whole whenever the surface goes stale;
// the generation number tells frames of one build apart from the next.

use anyhow::{Context, Result};
use ash::vk;
use super::{GpuContext, SwapchainDesc};

/// Formats tried in order before falling back to whatever the surface lists first
const PREFERRED_FORMATS: [vk::Format; 3] = [
    vk::Format::R8G8B8A8_SRGB,
    vk::Format::B8G8R8A8_SRGB,
    vk::Format::A8B8G8R8_SRGB_PACK32,
];

/// Composite alpha modes in order of preference
const COMPOSITE_ALPHA_PRIORITY: [vk::CompositeAlphaFlagsKHR; 4] = [
    vk::CompositeAlphaFlagsKHR::OPAQUE,
    vk::CompositeAlphaFlagsKHR::INHERIT,
    vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
    vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
];

/// One more than the minimum, so the host never has to wait on the
/// presentation engine to hand an image back. `max == 0` means unbounded.
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let desired = caps.min_image_count + 1;
    if caps.max_image_count > 0 && desired > caps.max_image_count {
        caps.max_image_count
    } else {
        desired
    }
}

/// The surface's own extent, unless it reports the `u32::MAX` sentinel
/// meaning the swapchain decides.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, desired: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width == u32::MAX {
        desired
    } else {
        caps.current_extent
    }
}

pub fn choose_pre_transform(caps: &vk::SurfaceCapabilitiesKHR) -> vk::SurfaceTransformFlagsKHR {
    if caps.supported_transforms.contains(vk::SurfaceTransformFlagsKHR::IDENTITY) {
        vk::SurfaceTransformFlagsKHR::IDENTITY
    } else {
        caps.current_transform
    }
}

pub fn choose_composite_alpha(caps: &vk::SurfaceCapabilitiesKHR) -> vk::CompositeAlphaFlagsKHR {
    COMPOSITE_ALPHA_PRIORITY
        .iter()
        .copied()
        .find(|&mode| caps.supported_composite_alpha.contains(mode))
        .unwrap_or(vk::CompositeAlphaFlagsKHR::OPAQUE)
}

/// Prefer an sRGB 8-bit format
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
    PREFERRED_FORMATS
        .iter()
        .find_map(|&preferred| formats.iter().find(|f| f.format == preferred))
        .or_else(|| formats.first())
        .copied()
        .context("Surface reports no formats")
}

/// Swapchain, its images and one view + framebuffer per image
#[derive(Debug)]
pub struct SurfaceSet {
    pub swapchain: vk::SwapchainKHR,
    pub extent: vk::Extent2D,
    pub format: vk::SurfaceFormatKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub framebuffers: Vec<vk::Framebuffer>,
    pub generation: u64,
}

impl SurfaceSet {
    /// Negotiate against the surface and create swapchain, views and
    /// framebuffers. `old_swapchain` is handed to the driver for reuse and
    /// stays owned by the caller.
    ///
    /// On failure everything created here has already been destroyed.
    pub fn build(
        ctx: &impl GpuContext,
        desired_extent: vk::Extent2D,
        old_swapchain: vk::SwapchainKHR,
        generation: u64,
    ) -> Result<Self> {
        let caps = ctx.surface_capabilities()?;
        let formats = ctx.surface_formats()?;
        let format = choose_surface_format(&formats)?;

        let desc = SwapchainDesc {
            min_image_count: choose_image_count(&caps),
            format,
            extent: choose_extent(&caps, desired_extent),
            pre_transform: choose_pre_transform(&caps),
            composite_alpha: choose_composite_alpha(&caps),
            // FIFO is the only mode every implementation has to support
            present_mode: vk::PresentModeKHR::FIFO,
            old_swapchain,
        };

        log::info!(
            "Creating swapchain: {}x{}, {} images, {:?}",
            desc.extent.width,
            desc.extent.height,
            desc.min_image_count,
            format.format
        );

        let swapchain = ctx.create_swapchain(&desc)?;
        let mut set = Self {
            swapchain,
            extent: desc.extent,
            format,
            images: Vec::new(),
            image_views: Vec::new(),
            framebuffers: Vec::new(),
            generation,
        };

        if let Err(e) = set.create_targets(ctx) {
            set.destroy(ctx);
            return Err(e);
        }

        log::debug!(
            "Surface set generation {} ready with {} images",
            generation,
            set.image_count()
        );
        Ok(set)
    }

    fn create_targets(&mut self, ctx: &impl GpuContext) -> Result<()> {
        self.images = ctx.swapchain_images(self.swapchain)?;

        for &image in &self.images {
            let view = ctx.create_image_view(image, self.format.format)?;
            self.image_views.push(view);
            self.framebuffers.push(ctx.create_framebuffer(view, self.extent)?);
        }
        Ok(())
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Wait for the queue to drain, then destroy every framebuffer
    pub fn teardown_framebuffers(&mut self, ctx: &impl GpuContext) -> Result<()> {
        ctx.queue_wait_idle()?;
        for framebuffer in self.framebuffers.drain(..) {
            ctx.destroy_framebuffer(framebuffer);
        }
        Ok(())
    }

    pub fn destroy_image_views(&mut self, ctx: &impl GpuContext) {
        for view in self.image_views.drain(..) {
            ctx.destroy_image_view(view);
        }
    }

    /// Destroy whatever is left: framebuffers, views, then the swapchain.
    /// Does not wait on the GPU.
    pub fn destroy(mut self, ctx: &impl GpuContext) {
        for framebuffer in self.framebuffers.drain(..) {
            ctx.destroy_framebuffer(framebuffer);
        }
        self.destroy_image_views(ctx);
        self.images.clear();

        if self.swapchain != vk::SwapchainKHR::null() {
            ctx.destroy_swapchain(self.swapchain);
        }
    }
}
