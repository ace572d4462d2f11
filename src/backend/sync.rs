// Synchronization primitives
//
// One Fence per submission: created unsignaled by Command::submit, waited on
// by whoever owns it, destroyed on drop. Fences are never reset or reused.

use ash::vk;
use std::sync::Arc;

use super::device::Device;
use super::error::{GpuError, GpuResult};

pub struct Fence {
    fence: vk::Fence,
    device: Arc<Device>,
}

impl Fence {
    pub fn new(device: Arc<Device>) -> GpuResult<Self> {
        let fence_info = vk::FenceCreateInfo::builder();
        let fence = unsafe { device.device.create_fence(&fence_info, None) }
            .map_err(GpuError::vk("create fence"))?;
        Ok(Self { fence, device })
    }

    pub fn raw(&self) -> vk::Fence {
        self.fence
    }

    /// Block until the GPU signals this fence.
    pub fn wait(&self) -> GpuResult<()> {
        unsafe {
            self.device
                .device
                .wait_for_fences(&[self.fence], true, u64::MAX)
        }
        .map_err(GpuError::vk("wait for fence"))
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_fence(self.fence, None);
        }
    }
}
