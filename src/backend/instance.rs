// Vulkan Instance - API context and GPU discovery
//
// Responsibilities:
// - Loading the Vulkan library and creating the instance
// - Optional validation layers + debug messenger
// - Physical device selection: first GPU with a queue family of the wanted kind
// - Logical device creation (compute or graphics)

use ash::{vk, Entry};
use std::ffi::{CStr, CString};
use std::sync::Arc;

use super::device::Device;
use super::error::{GpuError, GpuResult};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Application and engine identity reported to the driver.
#[derive(Debug, Clone)]
pub struct AppInfo {
    pub app_name: String,
    pub app_version: u32,
    pub engine_name: String,
    pub engine_version: u32,
}

impl Default for AppInfo {
    fn default() -> Self {
        Self {
            app_name: "Demo".to_string(),
            app_version: vk::make_api_version(0, 1, 0, 0),
            engine_name: "No Engine".to_string(),
            engine_version: vk::make_api_version(0, 1, 0, 0),
        }
    }
}

/// A physical device paired with the queue family chosen on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSelection {
    pub physical_device: vk::PhysicalDevice,
    pub queue_family_index: u32,
}

/// Vulkan instance wrapper. Devices keep it alive through an `Arc`.
pub struct Instance {
    pub instance: ash::Instance,
    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
    _entry: Entry,
}

impl Instance {
    /// Create the API context.
    ///
    /// `enable_validation` is the environment-fixed debug flag; when the
    /// validation layer is not installed it is skipped with a warning.
    pub fn new(info: &AppInfo, enable_validation: bool) -> GpuResult<Arc<Self>> {
        log::info!("Creating Vulkan instance: {}", info.app_name);

        let entry =
            unsafe { Entry::load() }.map_err(|e| GpuError::NoVulkanLoader(e.to_string()))?;

        let enable_validation = enable_validation && Self::has_validation_layer(&entry);
        let instance = Self::create_instance(&entry, info, enable_validation)?;

        // From here on a failure must not leak the instance.
        let mut this = Self {
            instance,
            debug_utils: None,
            _entry: entry,
        };

        if enable_validation {
            this.debug_utils = Some(Self::setup_debug_messenger(&this._entry, &this.instance)?);
        }

        log::info!(
            "Instance ready (validation {})",
            if enable_validation { "on" } else { "off" }
        );
        Ok(Arc::new(this))
    }

    fn has_validation_layer(entry: &Entry) -> bool {
        let layers = match entry.enumerate_instance_layer_properties() {
            Ok(layers) => layers,
            Err(e) => {
                log::warn!("Failed to enumerate instance layers: {}", e);
                return false;
            }
        };

        let found = layers
            .iter()
            .any(|l| unsafe { CStr::from_ptr(l.layer_name.as_ptr()) } == VALIDATION_LAYER);

        if !found {
            log::warn!(
                "{} not installed, continuing without validation",
                VALIDATION_LAYER.to_string_lossy()
            );
        }
        found
    }

    fn create_instance(
        entry: &Entry,
        info: &AppInfo,
        enable_validation: bool,
    ) -> GpuResult<ash::Instance> {
        let app_name = CString::new(info.app_name.as_str())?;
        let engine_name = CString::new(info.engine_name.as_str())?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(info.app_version)
            .engine_name(&engine_name)
            .engine_version(info.engine_version)
            .api_version(vk::API_VERSION_1_0);

        let (extensions, layers) = if enable_validation {
            (
                vec![ash::extensions::ext::DebugUtils::name().as_ptr()],
                vec![VALIDATION_LAYER.as_ptr()],
            )
        } else {
            (vec![], vec![])
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layers);

        unsafe { entry.create_instance(&create_info, None) }
            .map_err(GpuError::vk("create instance"))
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> GpuResult<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
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

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .map_err(GpuError::vk("create debug messenger"))?;

        Ok((debug_utils, messenger))
    }

    /// Logical device on the first GPU with a compute-capable queue family.
    pub fn compute_device(self: &Arc<Self>) -> GpuResult<Arc<Device>> {
        self.device_for(vk::QueueFlags::COMPUTE)
    }

    /// Logical device on the first GPU with a graphics-capable queue family.
    pub fn graphics_device(self: &Arc<Self>) -> GpuResult<Arc<Device>> {
        self.device_for(vk::QueueFlags::GRAPHICS)
    }

    pub fn device_for(self: &Arc<Self>, queue_flags: vk::QueueFlags) -> GpuResult<Arc<Device>> {
        let selection = self.pick_physical_device(queue_flags)?;
        Device::new(Arc::clone(self), selection)
    }

    /// First physical device that has a queue family advertising `queue_flags`.
    pub fn pick_physical_device(&self, queue_flags: vk::QueueFlags) -> GpuResult<DeviceSelection> {
        let devices = unsafe { self.instance.enumerate_physical_devices() }
            .map_err(GpuError::vk("enumerate physical devices"))?;

        if devices.is_empty() {
            return Err(GpuError::NoPhysicalDevice);
        }

        devices
            .into_iter()
            .find_map(|physical_device| {
                let families = unsafe {
                    self.instance
                        .get_physical_device_queue_family_properties(physical_device)
                };
                find_queue_family(&families, queue_flags).map(|queue_family_index| {
                    DeviceSelection {
                        physical_device,
                        queue_family_index,
                    }
                })
            })
            .ok_or(GpuError::NoSuitableQueueFamily(queue_flags))
    }
}

/// Index of the first family with at least one queue and all of `queue_flags`.
pub fn find_queue_family(
    families: &[vk::QueueFamilyProperties],
    queue_flags: vk::QueueFlags,
) -> Option<u32> {
    families
        .iter()
        .position(|f| f.queue_count > 0 && f.queue_flags.contains(queue_flags))
        .map(|i| i as u32)
}

impl Drop for Instance {
    fn drop(&mut self) {
        log::debug!("Destroying Vulkan instance");
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags, count: u32) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: count,
            ..Default::default()
        }
    }

    #[test]
    fn picks_first_family_with_requested_bit() {
        let families = [
            family(vk::QueueFlags::TRANSFER, 2),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, 1),
            family(vk::QueueFlags::COMPUTE, 4),
        ];
        assert_eq!(find_queue_family(&families, vk::QueueFlags::COMPUTE), Some(1));
        assert_eq!(find_queue_family(&families, vk::QueueFlags::GRAPHICS), Some(1));
        assert_eq!(find_queue_family(&families, vk::QueueFlags::TRANSFER), Some(0));
    }

    #[test]
    fn skips_families_without_queues() {
        let families = [
            family(vk::QueueFlags::COMPUTE, 0),
            family(vk::QueueFlags::COMPUTE, 1),
        ];
        assert_eq!(find_queue_family(&families, vk::QueueFlags::COMPUTE), Some(1));
    }

    #[test]
    fn no_family_qualifies() {
        let families = [family(vk::QueueFlags::TRANSFER, 1)];
        assert_eq!(find_queue_family(&families, vk::QueueFlags::COMPUTE), None);
        assert_eq!(find_queue_family(&[], vk::QueueFlags::COMPUTE), None);
    }
}
