// Vulkan device bootstrap
//
// Instance (with validation when asked for and installed), window surface,
// the first GPU that can both draw and present to that surface, and a logical
// device with one queue and VK_KHR_swapchain.

use anyhow::{Context, Result};
use ash::extensions::{ext::DebugUtils, khr};
use ash::{vk, Entry};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::ffi::{c_char, CStr, CString};
use std::sync::Arc;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub graphics_queue: vk::Queue,
    /// Supports graphics and presentation to `surface`
    pub graphics_queue_family: u32,

    pub surface: vk::SurfaceKHR,
    pub surface_loader: khr::Surface,
    debug_messenger: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    pub instance: ash::Instance,
    _entry: Entry,
}

impl VulkanDevice {
    /// Bring up Vulkan for `window`. Validation is only enabled when
    /// `enable_validation` is set and the Khronos layer is installed.
    pub fn new<W>(app_name: &str, enable_validation: bool, window: &W) -> Result<Arc<Self>>
    where
        W: HasRawWindowHandle + HasRawDisplayHandle,
    {
        log::info!("Creating Vulkan device: {}", app_name);

        let display_handle = window.raw_display_handle();
        let window_handle = window.raw_window_handle();

        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let validation = enable_validation && validation_layer_installed(&entry);
        let mut extensions = ash_window::enumerate_required_extensions(display_handle)
            .context("Window system has no Vulkan surface support")?
            .to_vec();
        let mut layers = Vec::new();
        if validation {
            extensions.push(DebugUtils::name().as_ptr());
            layers.push(VALIDATION_LAYER);
        }
        let instance = create_instance(&entry, app_name, &extensions, &layers)?;

        // Anything created from here on must be torn down by hand on failure
        let debug_messenger = if validation {
            match create_debug_messenger(&entry, &instance) {
                Ok(messenger) => Some(messenger),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        let surface_loader = khr::Surface::new(&entry, &instance);
        let partial = |e: anyhow::Error| {
            unsafe {
                if let Some((utils, messenger)) = &debug_messenger {
                    utils.destroy_debug_utils_messenger(*messenger, None);
                }
                instance.destroy_instance(None);
            }
            e
        };

        let surface = unsafe {
            ash_window::create_surface(&entry, &instance, display_handle, window_handle, None)
        }
        .context("Failed to create window surface")
        .map_err(partial)?;

        let opened = pick_physical_device(&instance, &surface_loader, surface).and_then(
            |(physical_device, family)| {
                let (device, queue) = create_logical_device(&instance, physical_device, family)?;
                Ok((physical_device, family, device, queue))
            },
        );
        let (physical_device, graphics_queue_family, device, graphics_queue) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                unsafe { surface_loader.destroy_surface(surface, None) };
                return Err(partial(e));
            }
        };

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        log::info!(
            "Selected GPU: {} (Vulkan {}.{}.{}, queue family {})",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy(),
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version),
            graphics_queue_family
        );

        Ok(Arc::new(Self {
            device,
            physical_device,
            graphics_queue,
            graphics_queue_family,
            surface,
            surface_loader,
            debug_messenger,
            instance,
            _entry: entry,
        }))
    }

    /// Block until the GPU has finished all submitted work
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("Failed to wait for device idle")
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        // Device, surface, messenger, instance
        unsafe {
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            if let Some((utils, messenger)) = self.debug_messenger.take() {
                utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

fn validation_layer_installed(entry: &Entry) -> bool {
    let installed = entry
        .enumerate_instance_layer_properties()
        .unwrap_or_default()
        .iter()
        .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == VALIDATION_LAYER);

    if installed {
        log::info!("Enabled validation layer {}", VALIDATION_LAYER.to_string_lossy());
    } else {
        log::warn!("Validation layer {} is not installed", VALIDATION_LAYER.to_string_lossy());
    }
    installed
}

fn create_instance(
    entry: &Entry,
    app_name: &str,
    extensions: &[*const c_char],
    layers: &[&CStr],
) -> Result<ash::Instance> {
    let app_name = CString::new(app_name)?;
    let version = vk::make_api_version(0, 0, 1, 0);
    let app_info = vk::ApplicationInfo::builder()
        .application_name(&app_name)
        .application_version(version)
        .engine_name(c"Frame Cycle")
        .engine_version(version)
        .api_version(vk::API_VERSION_1_1);

    let layer_ptrs: Vec<*const c_char> = layers.iter().map(|name| name.as_ptr()).collect();

    let info = vk::InstanceCreateInfo::builder()
        .application_info(&app_info)
        .enabled_extension_names(extensions)
        .enabled_layer_names(&layer_ptrs);

    unsafe { entry.create_instance(&info, None) }.context("Failed to create Vulkan instance")
}

fn create_debug_messenger(
    entry: &Entry,
    instance: &ash::Instance,
) -> Result<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
    let utils = DebugUtils::new(entry, instance);

    let info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback));

    let messenger = unsafe { utils.create_debug_utils_messenger(&info, None) }
        .context("Failed to create debug messenger")?;
    Ok((utils, messenger))
}

/// First queue family of `device` that can draw and present to `surface`
fn graphics_present_family(
    instance: &ash::Instance,
    surface_loader: &khr::Surface,
    surface: vk::SurfaceKHR,
    device: vk::PhysicalDevice,
) -> Option<u32> {
    let families = unsafe { instance.get_physical_device_queue_family_properties(device) };

    (0u32..).zip(families.iter()).find_map(|(index, family)| {
        let presents = unsafe {
            surface_loader.get_physical_device_surface_support(device, index, surface)
        }
        .unwrap_or(false);

        (family.queue_flags.contains(vk::QueueFlags::GRAPHICS) && presents).then_some(index)
    })
}

fn pick_physical_device(
    instance: &ash::Instance,
    surface_loader: &khr::Surface,
    surface: vk::SurfaceKHR,
) -> Result<(vk::PhysicalDevice, u32)> {
    let devices = unsafe { instance.enumerate_physical_devices() }
        .context("Failed to enumerate GPUs")?;
    anyhow::ensure!(!devices.is_empty(), "No Vulkan-capable GPU found");

    devices
        .into_iter()
        .find_map(|device| {
            graphics_present_family(instance, surface_loader, surface, device)
                .map(|family| (device, family))
        })
        .context("Did not find a queue family supporting graphics and presentation")
}

fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
) -> Result<(ash::Device, vk::Queue)> {
    let priorities = [1.0];
    let queue_infos = [vk::DeviceQueueCreateInfo::builder()
        .queue_family_index(queue_family)
        .queue_priorities(&priorities)
        .build()];
    let extensions = [khr::Swapchain::name().as_ptr()];

    let info = vk::DeviceCreateInfo::builder()
        .queue_create_infos(&queue_infos)
        .enabled_extension_names(&extensions);

    let device = unsafe { instance.create_device(physical_device, &info, None) }
        .context("Failed to create logical device")?;
    let queue = unsafe { device.get_device_queue(queue_family, 0) };

    Ok((device, queue))
}

/// Log level for a validation message
fn severity_level(severity: vk::DebugUtilsMessageSeverityFlagsEXT) -> log::Level {
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::Level::Error
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::Level::Warn
    } else {
        log::Level::Debug
    }
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if !callback_data.is_null() && !(*callback_data).p_message.is_null() {
        let message = CStr::from_ptr((*callback_data).p_message);
        log::log!(severity_level(severity), "[Vulkan] {}", message.to_string_lossy());
    }
    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_messages_map_to_log_levels() {
        use vk::DebugUtilsMessageSeverityFlagsEXT as Severity;

        assert_eq!(severity_level(Severity::ERROR), log::Level::Error);
        assert_eq!(severity_level(Severity::WARNING), log::Level::Warn);
        assert_eq!(severity_level(Severity::INFO), log::Level::Debug);
        assert_eq!(severity_level(Severity::VERBOSE), log::Level::Debug);
    }
}
