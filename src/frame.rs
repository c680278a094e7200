// Frame cycle - acquire, record, submit, present
//
// Drives one frame at a time through an explicit state machine. Each step
// consumes the token produced by the previous one, so steps cannot be run
// out of order, and tokens are stamped with the surface set generation so a
// frame started before a rebuild is never finished against the new set.

use anyhow::{Context, Result};
use ash::vk;
use crate::backend::swapchain::SurfaceSet;
use crate::backend::sync::{FrameSlot, SemaphorePool};
use crate::backend::GpuContext;

pub const DEFAULT_CLEAR_COLOR: [f32; 4] = [0.01, 0.01, 0.033, 1.0];

/// Where the cycle currently is. `image` is the swapchain image index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    Acquiring,
    Recording { image: u32 },
    Submitted { image: u32 },
    Presenting { image: u32 },
}

/// An image handed out by the swapchain, ready to be recorded into
#[derive(Debug)]
pub struct AcquiredImage {
    image: u32,
    generation: u64,
}

impl AcquiredImage {
    pub fn index(&self) -> u32 {
        self.image
    }
}

#[derive(Debug)]
pub struct RecordedFrame {
    image: u32,
    generation: u64,
}

#[derive(Debug)]
pub struct SubmittedFrame {
    image: u32,
    generation: u64,
}

#[derive(Debug)]
#[must_use]
pub enum AcquireOutcome {
    Acquired(AcquiredImage),
    /// Suboptimal or out of date, the surface set needs rebuilding
    Stale,
    Failed(vk::Result),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum PresentOutcome {
    Presented,
    /// The surface set was rebuilt, nothing is retried this frame
    Stale,
    Failed(vk::Result),
}

/// What happened to one call of [`FrameCycle::render_frame`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Presented,
    /// No image could be acquired, nothing was drawn
    Skipped,
    /// Drawn, but presentation reported a stale surface
    Stale,
    PresentFailed,
}

/// Owns the surface set, one frame slot per swapchain image and the pool of
/// acquire semaphores.
pub struct FrameCycle<C: GpuContext> {
    ctx: C,
    surface: Option<SurfaceSet>,
    slots: Vec<FrameSlot>,
    semaphore_pool: SemaphorePool,
    state: FrameState,
    generation: u64,
    desired_extent: vk::Extent2D,
    clear_color: [f32; 4],
    frame_index: u64,
}

fn create_slots(ctx: &impl GpuContext, count: usize) -> Result<Vec<FrameSlot>> {
    let mut slots = Vec::with_capacity(count);
    for _ in 0..count {
        match FrameSlot::new(ctx) {
            Ok(slot) => slots.push(slot),
            Err(e) => {
                for slot in &mut slots {
                    slot.teardown(ctx);
                }
                return Err(e);
            }
        }
    }
    Ok(slots)
}

impl<C: GpuContext> FrameCycle<C> {
    /// Build the first surface set and its frame slots
    pub fn new(ctx: C, extent: vk::Extent2D) -> Result<Self> {
        let generation = 1;
        let surface = SurfaceSet::build(&ctx, extent, vk::SwapchainKHR::null(), generation)?;
        let slots = match create_slots(&ctx, surface.image_count()) {
            Ok(slots) => slots,
            Err(e) => {
                surface.destroy(&ctx);
                return Err(e);
            }
        };

        Ok(Self {
            ctx,
            surface: Some(surface),
            slots,
            semaphore_pool: SemaphorePool::new(),
            state: FrameState::Idle,
            generation,
            desired_extent: extent,
            clear_color: DEFAULT_CLEAR_COLOR,
            frame_index: 0,
        })
    }

    pub fn context(&self) -> &C {
        &self.ctx
    }

    pub fn set_clear_color(&mut self, color: [f32; 4]) {
        self.clear_color = color;
    }

    /// Extent of the live surface set, zero after shutdown
    pub fn extent(&self) -> vk::Extent2D {
        self.surface.as_ref().map(|s| s.extent).unwrap_or_default()
    }

    pub fn image_count(&self) -> usize {
        self.surface.as_ref().map_or(0, SurfaceSet::image_count)
    }

    pub fn semaphore_pool_len(&self) -> usize {
        self.semaphore_pool.len()
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Number of frames submitted so far
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    /// No surface set left to render into, either after `shutdown` or after
    /// a rebuild failed. Nothing short of a new cycle recovers from this.
    pub fn is_shut_down(&self) -> bool {
        self.surface.is_none()
    }

    fn surface(&self) -> Result<&SurfaceSet> {
        self.surface.as_ref().context("Frame cycle has been shut down")
    }

    fn check_token(&self, expected: FrameState, generation: u64) -> Result<()> {
        anyhow::ensure!(
            generation == self.generation,
            "Frame from surface set generation {} used with generation {}",
            generation,
            self.generation
        );
        anyhow::ensure!(
            self.state == expected,
            "Frame cycle is {:?}, expected {:?}",
            self.state,
            expected
        );
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // The four steps
    // ─────────────────────────────────────────────────────────────────────

    /// Acquire the next swapchain image and make its slot ready to record.
    ///
    /// Blocks on the acquire and on the slot's previous submission.
    pub fn acquire(&mut self) -> Result<AcquireOutcome> {
        anyhow::ensure!(
            self.state == FrameState::Idle,
            "Acquire while frame cycle is {:?}",
            self.state
        );

        self.state = FrameState::Acquiring;
        let outcome = self.acquire_image();
        if !matches!(outcome, Ok(AcquireOutcome::Acquired(_))) {
            self.state = FrameState::Idle;
        }
        outcome
    }

    fn acquire_image(&mut self) -> Result<AcquireOutcome> {
        let swapchain = self.surface()?.swapchain;
        let semaphore = self.semaphore_pool.acquire(&self.ctx)?;

        let index = match self.ctx.acquire_next_image(swapchain, semaphore) {
            Ok((index, false)) => index,
            Ok((_, true)) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.semaphore_pool.release(semaphore);
                return Ok(AcquireOutcome::Stale);
            }
            Err(result) => {
                self.semaphore_pool.release(semaphore);
                return Ok(AcquireOutcome::Failed(result));
            }
        };

        let Some(slot) = self.slots.get_mut(index as usize) else {
            self.semaphore_pool.release(semaphore);
            anyhow::bail!("Swapchain returned image {} but only {} exist", index, self.slots.len());
        };

        log::debug!("Acquired image {} ({:?})", index, slot.state());
        slot.wait_and_reset(&self.ctx)?;
        if let Some(previous) = slot.bind_acquire_semaphore(semaphore) {
            self.semaphore_pool.release(previous);
        }

        self.state = FrameState::Recording { image: index };
        Ok(AcquireOutcome::Acquired(AcquiredImage {
            image: index,
            generation: self.generation,
        }))
    }

    /// Record the frame: clear, bind the triangle pipeline, draw it
    pub fn record(&mut self, frame: AcquiredImage) -> Result<RecordedFrame> {
        self.check_token(FrameState::Recording { image: frame.image }, frame.generation)?;

        let surface = self.surface()?;
        let index = frame.image as usize;
        let framebuffer = surface
            .framebuffers
            .get(index)
            .copied()
            .context("No framebuffer for acquired image")?;
        let extent = surface.extent;
        let command_buffer = self.slots[index]
            .command_buffer
            .context("Frame slot has no command buffer")?;

        self.ctx.begin_command_buffer(command_buffer)?;
        self.ctx.cmd_begin_render_pass(command_buffer, framebuffer, extent, self.clear_color);
        self.ctx.cmd_bind_pipeline(command_buffer);
        self.ctx.cmd_set_viewport(command_buffer, extent);
        self.ctx.cmd_set_scissor(command_buffer, extent);
        self.ctx.cmd_draw(command_buffer, 3, 1, 0, 0);
        self.ctx.cmd_end_render_pass(command_buffer);
        self.ctx.end_command_buffer(command_buffer)?;

        Ok(RecordedFrame {
            image: frame.image,
            generation: frame.generation,
        })
    }

    /// Submit waiting on the acquire semaphore, signalling the release
    /// semaphore and the slot fence.
    pub fn submit(&mut self, frame: RecordedFrame) -> Result<SubmittedFrame> {
        self.check_token(FrameState::Recording { image: frame.image }, frame.generation)?;

        let slot = &mut self.slots[frame.image as usize];
        let command_buffer = slot.command_buffer.context("Frame slot has no command buffer")?;
        let fence = slot.queue_submit_fence.context("Frame slot has no fence")?;
        let wait = slot.acquire_semaphore.context("Frame slot has no acquire semaphore")?;
        let signal = slot.release_semaphore(&self.ctx)?;

        self.ctx.queue_submit(
            command_buffer,
            wait,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            signal,
            fence,
        )?;
        slot.mark_pending();

        self.frame_index += 1;
        self.state = FrameState::Submitted { image: frame.image };
        Ok(SubmittedFrame {
            image: frame.image,
            generation: frame.generation,
        })
    }

    /// Present the frame. A stale surface is rebuilt right away but the frame
    /// is not redrawn.
    pub fn present(&mut self, frame: SubmittedFrame) -> Result<PresentOutcome> {
        self.check_token(FrameState::Submitted { image: frame.image }, frame.generation)?;
        self.state = FrameState::Presenting { image: frame.image };

        let swapchain = self.surface()?.swapchain;
        let wait = self.slots[frame.image as usize].release_semaphore;
        let result = match wait {
            Some(wait) => self.ctx.queue_present(swapchain, frame.image, wait),
            None => {
                self.state = FrameState::Idle;
                anyhow::bail!("Submitted frame has no release semaphore");
            }
        };
        self.state = FrameState::Idle;

        match result {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::debug!("Present reported a stale surface, rebuilding");
                self.resize(self.desired_extent)?;
                Ok(PresentOutcome::Stale)
            }
            Err(result) => {
                log::error!("Failed to present swapchain image: {:?}", result);
                Ok(PresentOutcome::Failed(result))
            }
        }
    }

    /// Render one frame. A stale acquire rebuilds the surface set and
    /// retries exactly once; if that still fails the frame is skipped.
    pub fn render_frame(&mut self) -> Result<FrameStatus> {
        let acquired = match self.acquire()? {
            AcquireOutcome::Acquired(frame) => frame,
            AcquireOutcome::Stale => {
                self.resize(self.desired_extent)?;
                match self.acquire()? {
                    AcquireOutcome::Acquired(frame) => frame,
                    outcome => {
                        log::warn!("Acquire failed again after rebuild ({:?}), skipping frame", outcome);
                        self.ctx.queue_wait_idle()?;
                        return Ok(FrameStatus::Skipped);
                    }
                }
            }
            AcquireOutcome::Failed(result) => {
                log::error!("Failed to acquire swapchain image: {:?}", result);
                self.ctx.queue_wait_idle()?;
                return Ok(FrameStatus::Skipped);
            }
        };

        let image = acquired.index();
        let submitted = match self.record(acquired).and_then(|frame| self.submit(frame)) {
            Ok(frame) => frame,
            Err(e) => {
                self.abandon_frame(image);
                return Err(e);
            }
        };

        Ok(match self.present(submitted)? {
            PresentOutcome::Presented => FrameStatus::Presented,
            PresentOutcome::Stale => FrameStatus::Stale,
            PresentOutcome::Failed(_) => FrameStatus::PresentFailed,
        })
    }

    /// Give up on an acquired image that never reached the queue. Its fence
    /// was already reset and its acquire semaphore will never be waited on,
    /// so both are replaced instead of being reused.
    fn abandon_frame(&mut self, image: u32) {
        log::warn!("Dropping frame for image {}", image);
        self.state = FrameState::Idle;

        if let Err(e) = self.ctx.queue_wait_idle() {
            log::error!("Failed to wait for queue idle: {:#}", e);
        }
        if let Some(slot) = self.slots.get_mut(image as usize) {
            if let Some(semaphore) = slot.acquire_semaphore.take() {
                self.ctx.destroy_semaphore(semaphore);
            }
            if let Err(e) = slot.rearm(&self.ctx) {
                log::error!("Failed to rearm frame slot {}: {:#}", image, e);
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Rebuild and teardown
    // ─────────────────────────────────────────────────────────────────────

    /// Remember `extent` as the wanted size and rebuild the surface set if
    /// the surface no longer matches it. Returns whether a rebuild happened.
    pub fn resize(&mut self, extent: vk::Extent2D) -> Result<bool> {
        anyhow::ensure!(
            self.state == FrameState::Idle,
            "Resize while frame cycle is {:?}",
            self.state
        );
        self.desired_extent = extent;

        let live_extent = self.surface()?.extent;
        let caps = self.ctx.surface_capabilities()?;
        if caps.current_extent == live_extent {
            return Ok(false);
        }
        // Minimised: no swapchain can have zero area, wait for the next signal
        if caps.current_extent.width == 0 || caps.current_extent.height == 0 {
            log::debug!("Surface has zero area, deferring rebuild");
            return Ok(false);
        }

        log::info!(
            "Resizing surface set: {}x{} -> {}x{}",
            live_extent.width,
            live_extent.height,
            extent.width,
            extent.height
        );

        self.ctx.device_wait_idle()?;
        self.rebuild()?;
        Ok(true)
    }

    fn rebuild(&mut self) -> Result<()> {
        let mut old = self.surface.take().context("Frame cycle has been shut down")?;
        if let Err(e) = old.teardown_framebuffers(&self.ctx) {
            self.surface = Some(old);
            return Err(e);
        }

        self.generation += 1;
        let built = SurfaceSet::build(&self.ctx, self.desired_extent, old.swapchain, self.generation);

        old.destroy_image_views(&self.ctx);
        for slot in &mut self.slots {
            slot.teardown(&self.ctx);
        }
        self.slots.clear();
        old.destroy(&self.ctx);

        let image_count = match built {
            Ok(new) => {
                let count = new.image_count();
                self.surface = Some(new);
                count
            }
            Err(e) => {
                log::error!("Surface set rebuild failed: {:#}", e);
                self.shutdown();
                return Err(e);
            }
        };

        match create_slots(&self.ctx, image_count) {
            Ok(slots) => {
                self.slots = slots;
                Ok(())
            }
            Err(e) => {
                log::error!("Frame slot rebuild failed: {:#}", e);
                self.shutdown();
                Err(e)
            }
        }
    }

    /// Wait for the device and destroy everything the cycle owns. Safe to
    /// call more than once.
    pub fn shutdown(&mut self) {
        if let Err(e) = self.ctx.device_wait_idle() {
            log::error!("Failed to wait for device idle: {:#}", e);
        }

        if let Some(surface) = self.surface.as_mut() {
            if let Err(e) = surface.teardown_framebuffers(&self.ctx) {
                log::error!("Failed to tear down framebuffers: {:#}", e);
            }
        }

        for slot in &mut self.slots {
            slot.teardown(&self.ctx);
        }
        self.slots.clear();

        if !self.semaphore_pool.is_empty() {
            log::debug!(
                "Destroying {} pooled semaphores ({} allocated by the pool)",
                self.semaphore_pool.len(),
                self.semaphore_pool.allocations()
            );
        }
        self.semaphore_pool.destroy_all(&self.ctx);

        if let Some(surface) = self.surface.take() {
            surface.destroy(&self.ctx);
        }
        self.state = FrameState::Idle;
    }
}

impl<C: GpuContext> Drop for FrameCycle<C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
