//! Minimal GPU compute orchestration on Vulkan.
//!
//! Turns a SPIR-V compute shader into a repeatedly dispatchable pipeline
//! and pulls each dispatch's results back into host memory, with one frame
//! of latency so GPU work overlaps host consumption.
//!
//! ```text
//! Instance -> Device -> Shader, Buffer, ComputePipeline -> Command -> Fence
//! ```

pub mod backend;
pub mod config;
pub mod engine;
pub mod host;

pub use config::Config;
pub use engine::{Engine, Frame};
pub use host::{FrameTarget, HostContext, PixelFormat, RenderOutcome};
