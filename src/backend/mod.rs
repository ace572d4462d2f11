// Backend module - Vulkan compute abstraction layer
//
// Ownership tree, each child holding an Arc to its parent:
//
//   Instance
//   └── Device (one queue)
//       ├── Buffer
//       ├── Shader
//       ├── Fence
//       └── ComputePipeline (descriptor pool/layouts/sets, pipeline, command pool)
//           └── Command

pub mod buffer;
pub mod command;
pub mod device;
pub mod error;
pub mod instance;
pub mod pipeline;
pub mod shader;
pub mod sync;

pub use buffer::{Buffer, DescriptorKind};
pub use command::{Command, Workgroups};
pub use device::Device;
pub use error::{GpuError, GpuResult};
pub use instance::{AppInfo, Instance};
pub use pipeline::{Binding, ComputePipeline, SetLayout};
pub use shader::Shader;
pub use sync::Fence;
