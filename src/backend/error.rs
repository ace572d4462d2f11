// Backend error taxonomy
//
// Every failure is fatal to the call that produced it: construction aborts,
// handles created so far are released by the partially built wrapper's Drop,
// and the error goes straight back to the caller.

use ash::vk;
use thiserror::Error;

use super::buffer::DescriptorKind;

#[derive(Debug, Error)]
pub enum GpuError {
    // ─────────────────────────────────────────────────────────────────────────
    // Capability absence
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Failed to load Vulkan library: {0}")]
    NoVulkanLoader(String),

    #[error("No Vulkan-capable GPU found")]
    NoPhysicalDevice,

    #[error("No suitable GPU found: no queue family supports {0:?}")]
    NoSuitableQueueFamily(vk::QueueFlags),

    // ─────────────────────────────────────────────────────────────────────────
    // Native resource creation
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Application or engine name contains a NUL byte")]
    InvalidName(#[from] std::ffi::NulError),

    #[error("Failed to {op}: {result}")]
    Vulkan { op: &'static str, result: vk::Result },

    // ─────────────────────────────────────────────────────────────────────────
    // Unsupported configuration
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Buffer usage {0:?} is not supported, expected exactly UNIFORM_BUFFER or STORAGE_BUFFER")]
    UnsupportedUsage(vk::BufferUsageFlags),

    #[error("Set {set} declares no binding {binding}")]
    UndeclaredBinding { set: u32, binding: u32 },

    #[error("Set {set} binding {binding} is declared {declared:?}, buffer is {found:?}")]
    DescriptorKindMismatch {
        set: u32,
        binding: u32,
        declared: DescriptorKind,
        found: DescriptorKind,
    },

    #[error("Range {range} at offset {offset} does not fit a buffer of {size} bytes or the device descriptor limits")]
    RangeOutOfBounds {
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
        size: vk::DeviceSize,
    },

    #[error("Shader stage {0:?} is not supported by a compute pipeline")]
    UnsupportedStage(vk::ShaderStageFlags),

    #[error("A dispatch has at most 3 dimensions, got {0}")]
    TooManyWorkgroupDimensions(usize),

    #[error("Descriptor set {set} out of range, pipeline has {count} set(s)")]
    SetOutOfRange { set: u32, count: usize },

    // ─────────────────────────────────────────────────────────────────────────
    // Memory
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Failed to find suitable memory type (type bits {type_bits:#b}, required {required:?})")]
    NoCompatibleMemoryType {
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    },

    #[error("Buffer memory is not host visible")]
    NotHostVisible,

    // ─────────────────────────────────────────────────────────────────────────
    // Shader byte code
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Malformed SPIR-V: {0}")]
    MalformedShader(String),

    #[error("Failed to read shader file: {0}")]
    ShaderIo(#[from] std::io::Error),
}

impl GpuError {
    /// Wrap a raw `vk::Result` with the operation that produced it.
    pub fn vk(op: &'static str) -> impl FnOnce(vk::Result) -> Self {
        move |result| Self::Vulkan { op, result }
    }
}

pub type GpuResult<T> = std::result::Result<T, GpuError>;
