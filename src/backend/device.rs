// Vulkan Device - Logical device and its single queue
//
// Responsibilities:
// - Logical device + queue creation from a chosen queue family
// - Caching physical device properties
// - Factories for Buffer, Shader, ComputePipeline

use ash::vk;
use std::ffi::CStr;
use std::path::Path;
use std::sync::Arc;

use super::buffer::Buffer;
use super::error::{GpuError, GpuResult};
use super::instance::{DeviceSelection, Instance};
use super::pipeline::{ComputePipeline, SetLayout};
use super::shader::Shader;

/// Logical device wrapper with automatic cleanup.
///
/// Children (buffers, shaders, pipelines, fences) hold an `Arc<Device>`,
/// so the device is destroyed only after the last of them.
pub struct Device {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,

    // Queue handles
    pub queue: vk::Queue,
    pub queue_family_index: u32,

    // Device properties (cached)
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,

    // Last: the instance must outlive the device
    pub instance: Arc<Instance>,
}

impl Device {
    pub fn new(instance: Arc<Instance>, selection: DeviceSelection) -> GpuResult<Arc<Self>> {
        let DeviceSelection {
            physical_device,
            queue_family_index,
        } = selection;

        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family_index)
            .queue_priorities(&queue_priorities)
            .build();

        // No extensions, no optional features: compute only
        let features = vk::PhysicalDeviceFeatures::default();
        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_features(&features);

        let device = unsafe {
            instance
                .instance
                .create_device(physical_device, &create_info, None)
        }
        .map_err(GpuError::vk("create logical device"))?;

        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };

        let properties = unsafe {
            instance
                .instance
                .get_physical_device_properties(physical_device)
        };
        let memory_properties = unsafe {
            instance
                .instance
                .get_physical_device_memory_properties(physical_device)
        };

        log::info!(
            "Device ready: {} (queue family {})",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy(),
            queue_family_index
        );
        log::debug!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        Ok(Arc::new(Self {
            device,
            physical_device,
            queue,
            queue_family_index,
            properties,
            memory_properties,
            instance,
        }))
    }

    /// Allocate a buffer; see [`Buffer::new`].
    pub fn create_buffer(
        self: &Arc<Self>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_properties: vk::MemoryPropertyFlags,
    ) -> GpuResult<Buffer> {
        Buffer::new(Arc::clone(self), size, usage, memory_properties)
    }

    /// Create a shader module from SPIR-V bytes.
    pub fn create_shader(
        self: &Arc<Self>,
        code: &[u8],
        stage: vk::ShaderStageFlags,
    ) -> GpuResult<Shader> {
        Shader::new(Arc::clone(self), code, stage)
    }

    /// Read a SPIR-V file fully into memory and create a shader module from it.
    pub fn create_shader_from_path<P: AsRef<Path>>(
        self: &Arc<Self>,
        path: P,
        stage: vk::ShaderStageFlags,
    ) -> GpuResult<Shader> {
        let path = path.as_ref();
        log::debug!("Loading shader from {:?}", path);
        let code = std::fs::read(path)?;
        self.create_shader(&code, stage)
    }

    /// Build a compute pipeline over `shader` with the given descriptor sets.
    pub fn create_compute_pipeline(
        self: &Arc<Self>,
        shader: &Shader,
        sets: &[SetLayout],
    ) -> GpuResult<Arc<ComputePipeline>> {
        ComputePipeline::new(Arc::clone(self), shader, sets)
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> GpuResult<()> {
        unsafe { self.device.device_wait_idle() }.map_err(GpuError::vk("wait for device idle"))
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        log::debug!("Destroying logical device");

        // Wait for device to finish
        if let Err(e) = self.wait_idle() {
            log::warn!("{}", e);
        }

        unsafe {
            self.device.destroy_device(None);
        }
    }
}
