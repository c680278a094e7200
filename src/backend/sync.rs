// Synchronization primitives
//
// Per-image frame slots (fence + command context + semaphores) and the pool
// that recycles acquire semaphores between frames.

use anyhow::Result;
use ash::vk;
use super::GpuContext;

/// Destroy `handle` if it is set, leaving `None` behind.
fn destroy_if_present<T>(handle: &mut Option<T>, destroy: impl FnOnce(T)) {
    if let Some(handle) = handle.take() {
        destroy(handle);
    }
}

// =============================================================================
// SEMAPHORE POOL
// =============================================================================

/// Acquire semaphores that no pending GPU work refers to.
///
/// Order is irrelevant: every binary semaphore is signalled and waited on
/// exactly once per use. Only touched from the render thread.
#[derive(Debug, Default)]
pub struct SemaphorePool {
    recycled: Vec<vk::Semaphore>,
    allocations: usize,
}

impl SemaphorePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a recycled semaphore, creating one only when the pool is empty
    pub fn acquire(&mut self, ctx: &impl GpuContext) -> Result<vk::Semaphore> {
        if let Some(semaphore) = self.recycled.pop() {
            return Ok(semaphore);
        }

        let semaphore = ctx.create_semaphore()?;
        self.allocations += 1;
        log::debug!("Semaphore pool empty, allocated semaphore #{}", self.allocations);
        Ok(semaphore)
    }

    pub fn release(&mut self, semaphore: vk::Semaphore) {
        self.recycled.push(semaphore);
    }

    pub fn len(&self) -> usize {
        self.recycled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recycled.is_empty()
    }

    /// Number of semaphores this pool ever had to create
    pub fn allocations(&self) -> usize {
        self.allocations
    }

    /// Destroy every pooled semaphore. The device must be idle.
    pub fn destroy_all(&mut self, ctx: &impl GpuContext) {
        for semaphore in self.recycled.drain(..) {
            ctx.destroy_semaphore(semaphore);
        }
    }
}

// =============================================================================
// FRAME SLOT
// =============================================================================

/// Lifecycle of a frame slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Torn down, or never created
    Unused,
    /// Fence signalled, everything in the slot may be reused
    Armed,
    /// Submitted, fence not waited on yet
    Pending,
}

/// Everything one swapchain image needs to be rendered to.
///
/// One slot per swapchain image index. Semaphores start out empty and are
/// bound on first use.
#[derive(Debug, Default)]
pub struct FrameSlot {
    pub queue_submit_fence: Option<vk::Fence>,
    pub command_pool: Option<vk::CommandPool>,
    pub command_buffer: Option<vk::CommandBuffer>,
    pub acquire_semaphore: Option<vk::Semaphore>,
    pub release_semaphore: Option<vk::Semaphore>,
    pending: bool,
}

impl FrameSlot {
    /// Create a slot with a signalled fence and a fresh command context
    pub fn new(ctx: &impl GpuContext) -> Result<Self> {
        let mut slot = Self::default();
        if let Err(e) = slot.init(ctx) {
            slot.teardown(ctx);
            return Err(e);
        }
        Ok(slot)
    }

    fn init(&mut self, ctx: &impl GpuContext) -> Result<()> {
        self.queue_submit_fence = Some(ctx.create_fence(true)?);
        let pool = ctx.create_command_pool()?;
        self.command_pool = Some(pool);
        self.command_buffer = Some(ctx.allocate_command_buffer(pool)?);
        Ok(())
    }

    pub fn state(&self) -> SlotState {
        match (self.queue_submit_fence, self.pending) {
            (None, _) => SlotState::Unused,
            (Some(_), false) => SlotState::Armed,
            (Some(_), true) => SlotState::Pending,
        }
    }

    /// Block until the last submission from this slot has finished, then
    /// reset the fence and command pool so the slot can be recorded again.
    pub fn wait_and_reset(&mut self, ctx: &impl GpuContext) -> Result<()> {
        if let Some(fence) = self.queue_submit_fence {
            ctx.wait_for_fence(fence)?;
            ctx.reset_fence(fence)?;
        }
        self.pending = false;

        if let Some(pool) = self.command_pool {
            ctx.reset_command_pool(pool)?;
        }
        Ok(())
    }

    /// Store the semaphore the latest acquire signals, handing back the one
    /// it replaces.
    pub fn bind_acquire_semaphore(&mut self, semaphore: vk::Semaphore) -> Option<vk::Semaphore> {
        self.acquire_semaphore.replace(semaphore)
    }

    /// Release semaphore, created on first submit
    pub fn release_semaphore(&mut self, ctx: &impl GpuContext) -> Result<vk::Semaphore> {
        match self.release_semaphore {
            Some(semaphore) => Ok(semaphore),
            None => {
                let semaphore = ctx.create_semaphore()?;
                self.release_semaphore = Some(semaphore);
                Ok(semaphore)
            }
        }
    }

    pub fn mark_pending(&mut self) {
        self.pending = true;
    }

    /// Swap in a fresh signalled fence after a frame was dropped between
    /// `wait_and_reset` and submit, so the next wait does not block forever.
    pub fn rearm(&mut self, ctx: &impl GpuContext) -> Result<()> {
        destroy_if_present(&mut self.queue_submit_fence, |fence| ctx.destroy_fence(fence));
        self.queue_submit_fence = Some(ctx.create_fence(true)?);
        self.pending = false;
        Ok(())
    }

    /// Destroy everything the slot holds.
    ///
    /// Order: fence, command buffer and pool, acquire semaphore, release
    /// semaphore. Every field ends up `None`, so calling this again is a no-op.
    pub fn teardown(&mut self, ctx: &impl GpuContext) {
        destroy_if_present(&mut self.queue_submit_fence, |fence| ctx.destroy_fence(fence));

        let pool = self.command_pool;
        destroy_if_present(&mut self.command_buffer, |command_buffer| {
            if let Some(pool) = pool {
                ctx.free_command_buffer(pool, command_buffer);
            }
        });
        destroy_if_present(&mut self.command_pool, |pool| ctx.destroy_command_pool(pool));

        destroy_if_present(&mut self.acquire_semaphore, |semaphore| ctx.destroy_semaphore(semaphore));
        destroy_if_present(&mut self.release_semaphore, |semaphore| ctx.destroy_semaphore(semaphore));

        self.pending = false;
    }
}
