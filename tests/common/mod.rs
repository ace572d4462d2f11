// Shared helpers for tests that need a real Vulkan device.

#![allow(dead_code)]

use compute_frames::backend::{AppInfo, Device, Instance};
use std::path::PathBuf;
use std::sync::Arc;

/// An instance without validation, or `None` when there is no Vulkan loader.
pub fn instance() -> Option<Arc<Instance>> {
    let _ = env_logger::builder().is_test(true).try_init();

    match Instance::new(&AppInfo::default(), false) {
        Ok(instance) => Some(instance),
        Err(e) => {
            eprintln!("skipping: {}", e);
            None
        }
    }
}

/// A compute device, or `None` when this machine has no Vulkan loader or GPU.
pub fn compute_device() -> Option<Arc<Device>> {
    match instance()?.compute_device() {
        Ok(device) => Some(device),
        Err(e) => {
            eprintln!("skipping: {}", e);
            None
        }
    }
}

/// Compiled SPIR-V from `shaders/`, or `None` when glslc was unavailable.
pub fn shader_bytes(name: &str) -> Option<Vec<u8>> {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("shaders")
        .join(name);
    match std::fs::read(&path) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            eprintln!("skipping: {:?}: {}", path, e);
            None
        }
    }
}
