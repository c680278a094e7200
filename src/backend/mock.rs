// In-memory GpuContext for tests
//
// Hands out unique fake handles, tracks which ones are alive, records the
// order of interesting calls and lets tests script acquire/present results.
// Destroying a handle twice, or submitting with a signalled fence, panics.

use anyhow::Result;
use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use super::{GpuContext, SwapchainDesc};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub semaphores_created: usize,
    pub semaphores_destroyed: usize,
    pub fences_created: usize,
    pub fences_destroyed: usize,
    pub fence_waits: usize,
    pub command_pools_created: usize,
    pub command_pools_destroyed: usize,
    pub command_pool_resets: usize,
    pub swapchains_created: usize,
    pub swapchains_destroyed: usize,
    pub image_views_created: usize,
    pub image_views_destroyed: usize,
    pub framebuffers_created: usize,
    pub framebuffers_destroyed: usize,
    pub acquires: usize,
    pub submits: usize,
    pub presents: usize,
    pub queue_idle_waits: usize,
    pub device_idle_waits: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    DestroyFence(vk::Fence),
    FreeCommandBuffer(vk::CommandBuffer),
    DestroyCommandPool(vk::CommandPool),
    DestroySemaphore(vk::Semaphore),
    DestroyImageView(vk::ImageView),
    DestroyFramebuffer(vk::Framebuffer),
    CreateSwapchain(vk::SwapchainKHR),
    DestroySwapchain(vk::SwapchainKHR),
    WaitForFence(vk::Fence),
    ResetCommandPool(vk::CommandPool),
    QueueWaitIdle,
    DeviceWaitIdle,
    Acquire {
        semaphore: vk::Semaphore,
    },
    Submit {
        command_buffer: vk::CommandBuffer,
        wait: vk::Semaphore,
        wait_stage: vk::PipelineStageFlags,
        signal: vk::Semaphore,
        fence: vk::Fence,
    },
    Present {
        image_index: u32,
        wait: vk::Semaphore,
    },
    BeginCommandBuffer(vk::CommandBuffer),
    BeginRenderPass {
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_color: [f32; 4],
    },
    BindPipeline,
    SetViewport(vk::Extent2D),
    SetScissor(vk::Extent2D),
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    EndRenderPass,
    EndCommandBuffer(vk::CommandBuffer),
}

struct State {
    next_handle: u64,
    live: HashSet<u64>,
    counters: Counters,
    events: Vec<Event>,
    capabilities: vk::SurfaceCapabilitiesKHR,
    formats: Vec<vk::SurfaceFormatKHR>,
    fences: HashMap<vk::Fence, bool>,
    swapchains: HashMap<vk::SwapchainKHR, Vec<vk::Image>>,
    next_image: u32,
    last_desc: Option<SwapchainDesc>,
    acquire_script: VecDeque<VkResult<(u32, bool)>>,
    present_script: VecDeque<VkResult<bool>>,
    fail_command_pool: bool,
    fail_submit: bool,
    fail_capabilities: bool,
    fail_image_view_at: Option<usize>,
    image_views_this_build: usize,
}

impl State {
    fn handle(&mut self) -> u64 {
        let raw = self.next_handle;
        self.next_handle += 1;
        self.live.insert(raw);
        raw
    }

    fn retire(&mut self, raw: u64, what: &str) {
        assert!(self.live.remove(&raw), "{} {:#x} destroyed twice or never created", what, raw);
    }
}

pub struct MockContext {
    state: RefCell<State>,
}

/// Surface used by default: 2..=3 images, 800x600, identity + opaque
pub fn default_capabilities() -> vk::SurfaceCapabilitiesKHR {
    vk::SurfaceCapabilitiesKHR {
        min_image_count: 2,
        max_image_count: 3,
        current_extent: vk::Extent2D { width: 800, height: 600 },
        supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
        current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
        supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
        ..Default::default()
    }
}

impl MockContext {
    pub fn new() -> Self {
        Self::with_capabilities(default_capabilities())
    }

    pub fn with_capabilities(capabilities: vk::SurfaceCapabilitiesKHR) -> Self {
        Self {
            state: RefCell::new(State {
                next_handle: 1,
                live: HashSet::new(),
                counters: Counters::default(),
                events: Vec::new(),
                capabilities,
                formats: vec![vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_SRGB,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                }],
                fences: HashMap::new(),
                swapchains: HashMap::new(),
                next_image: 0,
                last_desc: None,
                acquire_script: VecDeque::new(),
                present_script: VecDeque::new(),
                fail_command_pool: false,
                fail_submit: false,
                fail_capabilities: false,
                fail_image_view_at: None,
                image_views_this_build: 0,
            }),
        }
    }

    pub fn set_current_extent(&self, width: u32, height: u32) {
        self.state.borrow_mut().capabilities.current_extent = vk::Extent2D { width, height };
    }

    pub fn set_formats(&self, formats: Vec<vk::SurfaceFormatKHR>) {
        self.state.borrow_mut().formats = formats;
    }

    pub fn script_acquire(&self, result: VkResult<(u32, bool)>) {
        self.state.borrow_mut().acquire_script.push_back(result);
    }

    pub fn script_present(&self, result: VkResult<bool>) {
        self.state.borrow_mut().present_script.push_back(result);
    }

    pub fn fail_next_command_pool(&self) {
        self.state.borrow_mut().fail_command_pool = true;
    }

    pub fn fail_next_submit(&self) {
        self.state.borrow_mut().fail_submit = true;
    }

    pub fn fail_capabilities_query(&self) {
        self.state.borrow_mut().fail_capabilities = true;
    }

    /// Make the n-th image view of the next swapchain fail to create
    pub fn fail_image_view_at(&self, index: usize) {
        self.state.borrow_mut().fail_image_view_at = Some(index);
    }

    pub fn counters(&self) -> Counters {
        self.state.borrow().counters
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.borrow().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.borrow_mut().events.clear();
    }

    pub fn fence_is_signaled(&self, fence: vk::Fence) -> bool {
        self.state.borrow().fences.get(&fence).copied().unwrap_or(false)
    }

    pub fn last_swapchain_desc(&self) -> Option<SwapchainDesc> {
        self.state.borrow().last_desc
    }

    /// Handles created and not yet destroyed (images excluded)
    pub fn live_objects(&self) -> usize {
        self.state.borrow().live.len()
    }

    fn record(&self, event: Event) {
        self.state.borrow_mut().events.push(event);
    }
}

impl GpuContext for MockContext {
    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let mut state = self.state.borrow_mut();
        state.counters.semaphores_created += 1;
        Ok(vk::Semaphore::from_raw(state.handle()))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.borrow_mut();
        state.retire(semaphore.as_raw(), "semaphore");
        state.counters.semaphores_destroyed += 1;
        state.events.push(Event::DestroySemaphore(semaphore));
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let mut state = self.state.borrow_mut();
        state.counters.fences_created += 1;
        let fence = vk::Fence::from_raw(state.handle());
        state.fences.insert(fence, signaled);
        Ok(fence)
    }

    fn wait_for_fence(&self, fence: vk::Fence) -> Result<()> {
        let mut state = self.state.borrow_mut();
        // The GPU always finishes eventually
        state.fences.insert(fence, true);
        state.counters.fence_waits += 1;
        state.events.push(Event::WaitForFence(fence));
        Ok(())
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        self.state.borrow_mut().fences.insert(fence, false);
        Ok(())
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.borrow_mut();
        state.retire(fence.as_raw(), "fence");
        state.fences.remove(&fence);
        state.counters.fences_destroyed += 1;
        state.events.push(Event::DestroyFence(fence));
    }

    fn create_command_pool(&self) -> Result<vk::CommandPool> {
        let mut state = self.state.borrow_mut();
        if std::mem::take(&mut state.fail_command_pool) {
            anyhow::bail!("ERROR_OUT_OF_DEVICE_MEMORY");
        }
        state.counters.command_pools_created += 1;
        Ok(vk::CommandPool::from_raw(state.handle()))
    }

    fn allocate_command_buffer(&self, _pool: vk::CommandPool) -> Result<vk::CommandBuffer> {
        let mut state = self.state.borrow_mut();
        Ok(vk::CommandBuffer::from_raw(state.handle()))
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.counters.command_pool_resets += 1;
        state.events.push(Event::ResetCommandPool(pool));
        Ok(())
    }

    fn free_command_buffer(&self, _pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        let mut state = self.state.borrow_mut();
        state.retire(command_buffer.as_raw(), "command buffer");
        state.events.push(Event::FreeCommandBuffer(command_buffer));
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state.borrow_mut();
        state.retire(pool.as_raw(), "command pool");
        state.counters.command_pools_destroyed += 1;
        state.events.push(Event::DestroyCommandPool(pool));
    }

    fn surface_capabilities(&self) -> Result<vk::SurfaceCapabilitiesKHR> {
        let state = self.state.borrow();
        if state.fail_capabilities {
            anyhow::bail!("ERROR_SURFACE_LOST_KHR");
        }
        Ok(state.capabilities)
    }

    fn surface_formats(&self) -> Result<Vec<vk::SurfaceFormatKHR>> {
        Ok(self.state.borrow().formats.clone())
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> Result<vk::SwapchainKHR> {
        let mut state = self.state.borrow_mut();
        let swapchain = vk::SwapchainKHR::from_raw(state.handle());
        // Images belong to the swapchain, they are not tracked as live objects
        let images = (0..desc.min_image_count)
            .map(|i| vk::Image::from_raw(0x1000_0000 + swapchain.as_raw() * 16 + u64::from(i)))
            .collect();
        state.swapchains.insert(swapchain, images);
        state.counters.swapchains_created += 1;
        state.last_desc = Some(*desc);
        state.image_views_this_build = 0;
        state.next_image = 0;
        state.events.push(Event::CreateSwapchain(swapchain));
        Ok(swapchain)
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>> {
        let state = self.state.borrow();
        match state.swapchains.get(&swapchain) {
            Some(images) => Ok(images.clone()),
            None => anyhow::bail!("unknown swapchain {:?}", swapchain),
        }
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.state.borrow_mut();
        state.retire(swapchain.as_raw(), "swapchain");
        state.swapchains.remove(&swapchain);
        state.counters.swapchains_destroyed += 1;
        state.events.push(Event::DestroySwapchain(swapchain));
    }

    fn create_image_view(&self, _image: vk::Image, _format: vk::Format) -> Result<vk::ImageView> {
        let mut state = self.state.borrow_mut();
        let index = state.image_views_this_build;
        state.image_views_this_build += 1;
        if state.fail_image_view_at == Some(index) {
            state.fail_image_view_at = None;
            anyhow::bail!("ERROR_OUT_OF_HOST_MEMORY");
        }
        state.counters.image_views_created += 1;
        Ok(vk::ImageView::from_raw(state.handle()))
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        let mut state = self.state.borrow_mut();
        state.retire(view.as_raw(), "image view");
        state.counters.image_views_destroyed += 1;
        state.events.push(Event::DestroyImageView(view));
    }

    fn create_framebuffer(&self, _view: vk::ImageView, _extent: vk::Extent2D) -> Result<vk::Framebuffer> {
        let mut state = self.state.borrow_mut();
        state.counters.framebuffers_created += 1;
        Ok(vk::Framebuffer::from_raw(state.handle()))
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        let mut state = self.state.borrow_mut();
        state.retire(framebuffer.as_raw(), "framebuffer");
        state.counters.framebuffers_destroyed += 1;
        state.events.push(Event::DestroyFramebuffer(framebuffer));
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        let mut state = self.state.borrow_mut();
        assert!(state.live.contains(&swapchain.as_raw()), "acquire on a dead swapchain");
        assert!(state.live.contains(&semaphore.as_raw()), "acquire with a dead semaphore");
        state.counters.acquires += 1;
        state.events.push(Event::Acquire { semaphore });

        if let Some(result) = state.acquire_script.pop_front() {
            return result;
        }
        let image_count = state.swapchains[&swapchain].len() as u32;
        let index = state.next_image % image_count;
        state.next_image += 1;
        Ok((index, false))
    }

    fn queue_submit(
        &self,
        command_buffer: vk::CommandBuffer,
        wait_semaphore: vk::Semaphore,
        wait_stage: vk::PipelineStageFlags,
        signal_semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if std::mem::take(&mut state.fail_submit) {
            anyhow::bail!("ERROR_OUT_OF_DEVICE_MEMORY");
        }
        assert!(
            !state.fences.get(&fence).copied().unwrap_or(false),
            "submitted with a fence that is still signalled"
        );
        state.counters.submits += 1;
        state.events.push(Event::Submit {
            command_buffer,
            wait: wait_semaphore,
            wait_stage,
            signal: signal_semaphore,
            fence,
        });
        Ok(())
    }

    fn queue_present(
        &self,
        _swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> VkResult<bool> {
        let mut state = self.state.borrow_mut();
        state.counters.presents += 1;
        state.events.push(Event::Present {
            image_index,
            wait: wait_semaphore,
        });
        state.present_script.pop_front().unwrap_or(Ok(false))
    }

    fn queue_wait_idle(&self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.counters.queue_idle_waits += 1;
        state.events.push(Event::QueueWaitIdle);
        Ok(())
    }

    fn device_wait_idle(&self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.counters.device_idle_waits += 1;
        state.events.push(Event::DeviceWaitIdle);
        Ok(())
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        self.record(Event::BeginCommandBuffer(command_buffer));
        Ok(())
    }

    fn cmd_begin_render_pass(
        &self,
        _command_buffer: vk::CommandBuffer,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_color: [f32; 4],
    ) {
        self.record(Event::BeginRenderPass {
            framebuffer,
            extent,
            clear_color,
        });
    }

    fn cmd_bind_pipeline(&self, _command_buffer: vk::CommandBuffer) {
        self.record(Event::BindPipeline);
    }

    fn cmd_set_viewport(&self, _command_buffer: vk::CommandBuffer, extent: vk::Extent2D) {
        self.record(Event::SetViewport(extent));
    }

    fn cmd_set_scissor(&self, _command_buffer: vk::CommandBuffer, extent: vk::Extent2D) {
        self.record(Event::SetScissor(extent));
    }

    fn cmd_draw(
        &self,
        _command_buffer: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        self.record(Event::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        });
    }

    fn cmd_end_render_pass(&self, _command_buffer: vk::CommandBuffer) {
        self.record(Event::EndRenderPass);
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        self.record(Event::EndCommandBuffer(command_buffer));
        Ok(())
    }
}
