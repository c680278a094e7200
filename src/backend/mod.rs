// Backend module - Vulkan abstraction layer
//
// Everything above this module talks to the GPU through `GpuContext`.
// `VulkanContext` implements it on top of ash; tests use `mock::MockContext`.

pub mod context;
pub mod device;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;

#[cfg(test)]
pub mod mock;

pub use context::{GpuContext, SwapchainDesc, VulkanContext};
pub use device::VulkanDevice;
