// Pre-recorded compute dispatches
//
// A Command is recorded exactly once and resubmitted as often as needed.
// Every submission hands back a new Fence owned by the caller.

use ash::vk;
use std::sync::Arc;

use super::error::{GpuError, GpuResult};
use super::pipeline::ComputePipeline;
use super::sync::Fence;

/// Workgroup counts of one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Workgroups {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Workgroups {
    /// Expand 0 to 3 counts: `[]` is an empty dispatch, missing trailing
    /// dimensions default to 1.
    pub fn from_counts(counts: &[u32]) -> GpuResult<Self> {
        let (x, y, z) = match *counts {
            [] => (0, 0, 0),
            [x] => (x, 1, 1),
            [x, y] => (x, y, 1),
            [x, y, z] => (x, y, z),
            _ => return Err(GpuError::TooManyWorkgroupDimensions(counts.len())),
        };
        Ok(Self { x, y, z })
    }
}

pub struct Command {
    command_buffer: vk::CommandBuffer,
    workgroups: Workgroups,
    pipeline: Arc<ComputePipeline>,
}

impl Command {
    pub fn new(pipeline: Arc<ComputePipeline>, workgroups: Workgroups) -> GpuResult<Self> {
        let device = &pipeline.device().device;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pipeline.command_pool())
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let command_buffer = unsafe { device.allocate_command_buffers(&alloc_info) }
            .map_err(GpuError::vk("allocate command buffer"))?[0];

        // Dropping `this` frees the command buffer if recording fails.
        let this = Self {
            command_buffer,
            workgroups,
            pipeline,
        };
        this.record()?;

        log::info!("Command ready: dispatch {:?}", workgroups);
        Ok(this)
    }

    fn record(&self) -> GpuResult<()> {
        let device = &self.pipeline.device().device;
        let cmd = self.command_buffer;
        let Workgroups { x, y, z } = self.workgroups;

        // SIMULTANEOUS_USE: resubmitted without re-recording
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::SIMULTANEOUS_USE);

        unsafe {
            device
                .begin_command_buffer(cmd, &begin_info)
                .map_err(GpuError::vk("begin recording command buffer"))?;

            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, self.pipeline.raw());
            if !self.pipeline.descriptor_sets().is_empty() {
                device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::COMPUTE,
                    self.pipeline.layout(),
                    0,
                    self.pipeline.descriptor_sets(),
                    &[],
                );
            }
            device.cmd_dispatch(cmd, x, y, z);

            device
                .end_command_buffer(cmd)
                .map_err(GpuError::vk("record command buffer"))?;
        }
        Ok(())
    }

    /// Submit the recorded dispatch. The returned fence signals on completion.
    pub fn submit(&self) -> GpuResult<Fence> {
        let device = self.pipeline.device();
        let fence = Fence::new(Arc::clone(device))?;

        let command_buffers = [self.command_buffer];
        let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);

        unsafe {
            device
                .device
                .queue_submit(device.queue, &[submit_info.build()], fence.raw())
        }
        .map_err(GpuError::vk("submit command buffer"))?;

        Ok(fence)
    }

    pub fn workgroups(&self) -> Workgroups {
        self.workgroups
    }

    pub fn pipeline(&self) -> &Arc<ComputePipeline> {
        &self.pipeline
    }
}

impl Drop for Command {
    fn drop(&mut self) {
        unsafe {
            self.pipeline
                .device()
                .device
                .free_command_buffers(self.pipeline.command_pool(), &[self.command_buffer]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims(counts: &[u32]) -> (u32, u32, u32) {
        let w = Workgroups::from_counts(counts).unwrap();
        (w.x, w.y, w.z)
    }

    #[test]
    fn dispatch_dimensionality() {
        assert_eq!(dims(&[]), (0, 0, 0));
        assert_eq!(dims(&[8]), (8, 1, 1));
        assert_eq!(dims(&[8, 4]), (8, 4, 1));
        assert_eq!(dims(&[8, 4, 2]), (8, 4, 2));
    }

    #[test]
    fn explicit_ones_are_kept() {
        assert_eq!(dims(&[1]), (1, 1, 1));
        assert_eq!(dims(&[0, 5]), (0, 5, 1));
    }

    #[test]
    fn more_than_three_dimensions_fail() {
        let err = Workgroups::from_counts(&[1, 2, 3, 4]).unwrap_err();
        assert!(matches!(err, GpuError::TooManyWorkgroupDimensions(4)));
    }
}
