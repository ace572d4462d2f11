// =============================================================================
// ENGINE - init once, render repeatedly
// =============================================================================
//
// FRAME TIMELINE (one frame of latency):
// ┌──────────────────────────────────────────────────────────────────────┐
// │  call 1: submit(1)                                  -> no frame       │
// │  call 2: wait(1) -> dump -> submit(2)               -> frame of (1)   │
// │  call k: wait(k-1) -> dump -> submit(k)             -> frame of (k-1) │
// └──────────────────────────────────────────────────────────────────────┘
//
// The GPU computes frame k while the host consumes frame k-1. At most one
// submission is in flight at any time.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use crate::backend::{Binding, Buffer, Command, Device, Fence, GpuResult, Instance, Shader};
use crate::config::Config;

// =============================================================================
// PACING PROTOCOL
// =============================================================================

/// Something that can be waited on until the GPU is done with it.
pub trait Wait {
    fn wait(&self) -> GpuResult<()>;
}

/// A replayable unit of GPU work.
pub trait Submit {
    type Fence: Wait;
    fn submit(&self) -> GpuResult<Self::Fence>;
}

/// Host-side read of GPU results.
pub trait Readback {
    fn dump(&self, dst: &mut [u8]) -> GpuResult<usize>;
}

impl Wait for Fence {
    fn wait(&self) -> GpuResult<()> {
        Fence::wait(self)
    }
}

impl Submit for Command {
    type Fence = Fence;

    fn submit(&self) -> GpuResult<Fence> {
        Command::submit(self)
    }
}

impl Readback for Buffer {
    fn dump(&self, dst: &mut [u8]) -> GpuResult<usize> {
        Buffer::dump(self, dst)
    }
}

/// Outcome of one render call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    /// First call: work was submitted, nothing was copied out.
    Primed,
    /// The previous submission's results, this many bytes.
    Delivered(usize),
}

/// Single-depth pipelining over one replayable submission.
///
/// Holds the fence of the one submission in flight. A superseded fence is
/// dropped right after it has been waited on and replaced.
pub struct FramePacer<F> {
    in_flight: Option<F>,
}

impl<F> Default for FramePacer<F> {
    fn default() -> Self {
        Self { in_flight: None }
    }
}

impl<F: Wait> FramePacer<F> {
    pub fn new() -> Self {
        Self::default()
    }

    /// True until the first submission has been made.
    pub fn is_first_render(&self) -> bool {
        self.in_flight.is_none()
    }

    /// Deliver the previous submission's results into `out`, then resubmit.
    pub fn advance<S, R>(&mut self, work: &S, results: &R, out: &mut [u8]) -> GpuResult<Frame>
    where
        S: Submit<Fence = F>,
        R: Readback,
    {
        let frame = match &self.in_flight {
            None => Frame::Primed,
            Some(previous) => {
                previous.wait()?;
                Frame::Delivered(results.dump(out)?)
            }
        };

        self.in_flight = Some(work.submit()?);
        Ok(frame)
    }

    /// Wait for the outstanding submission, if any, and release its fence.
    pub fn drain(&mut self) -> GpuResult<()> {
        if let Some(fence) = &self.in_flight {
            fence.wait()?;
        }
        self.in_flight = None;
        Ok(())
    }
}

// =============================================================================
// ENGINE
// =============================================================================

/// Resources built from one shader. Field order is drop order.
struct Stage {
    command: Command,
    buffer: Buffer,
    _shader: Shader,
}

/// Explicit top-level context: owns the whole resource tree.
///
/// IMPORTANT: Field order matters for Drop! The in-flight fence goes first,
/// the device (which holds the instance) last.
pub struct Engine {
    pacer: FramePacer<Fence>,
    stage: Option<Stage>,
    workgroups: Vec<u32>,
    frame_len: usize,
    device: Arc<Device>,
}

impl Engine {
    /// Create the instance and a compute device.
    pub fn new(config: &Config) -> Result<Self> {
        let frame_len = config
            .frame
            .byte_len()
            .filter(|&len| len > 0)
            .with_context(|| {
                format!(
                    "Invalid frame size {}x{}",
                    config.frame.width, config.frame.height
                )
            })?;

        let instance = Instance::new(&config.app.app_info(), config.validation_enabled())
            .context("Failed to create Vulkan instance")?;
        let device = instance
            .compute_device()
            .context("Failed to create compute device")?;

        Ok(Self {
            pacer: FramePacer::new(),
            stage: None,
            workgroups: config.compute.workgroups.clone(),
            frame_len,
            device,
        })
    }

    /// Build shader, pipeline, output buffer and command from SPIR-V bytes.
    ///
    /// Loading again replaces the previous stage once its GPU work is done;
    /// the next render call primes again.
    pub fn load_shader(&mut self, code: &[u8]) -> Result<()> {
        self.pacer.drain().context("Failed to drain in-flight frame")?;
        self.stage = None;

        let shader = self
            .device
            .create_shader(code, vk::ShaderStageFlags::COMPUTE)
            .context("Failed to create compute shader")?;

        let pipeline = self
            .device
            .create_compute_pipeline(&shader, &[vec![Binding::storage(0)]])
            .context("Failed to create compute pipeline")?;

        let size = self.frame_len as vk::DeviceSize;
        let buffer = self
            .device
            .create_buffer(
                size,
                vk::BufferUsageFlags::STORAGE_BUFFER,
                vk::MemoryPropertyFlags::HOST_VISIBLE,
            )
            .context("Failed to create output buffer")?;
        pipeline.feed_buffer(0, 0, &buffer, 0, size)?;
        log::info!("Buffer ready ({} bytes)", buffer.size());

        let command = pipeline
            .create_command(&self.workgroups)
            .context("Failed to record dispatch")?;

        self.stage = Some(Stage {
            command,
            buffer,
            _shader: shader,
        });
        Ok(())
    }

    /// Produce one frame into `out`; see the timeline at the top of this file.
    pub fn render(&mut self, out: &mut [u8]) -> Result<Frame> {
        let stage = self
            .stage
            .as_ref()
            .context("Render requested before a shader was loaded")?;

        let frame = self
            .pacer
            .advance(&stage.command, &stage.buffer, out)
            .context("Failed to render frame")?;

        if let Frame::Delivered(len) = frame {
            log::trace!("Delivered {} bytes", len);
        }
        Ok(frame)
    }

    /// Wait for the last outstanding submission.
    pub fn finish(&mut self) -> Result<()> {
        self.pacer.drain().context("Failed to wait for last frame")
    }

    pub fn is_loaded(&self) -> bool {
        self.stage.is_some()
    }

    /// Bytes of one frame.
    pub fn frame_len(&self) -> usize {
        self.frame_len
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // No resource may be released while the GPU still uses it
        if let Err(e) = self.pacer.drain() {
            log::error!("Failed to wait for last frame during shutdown: {}", e);
        }
        log::info!("Engine finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Event {
        Submit(u32),
        Wait(u32),
        Dump,
    }

    /// Simulated GPU: a submission completes when its fence is waited on.
    #[derive(Default)]
    struct FakeGpu {
        submitted: Cell<u32>,
        completed: Cell<u32>,
        fences_dropped: Cell<u32>,
        events: RefCell<Vec<Event>>,
    }

    struct FakeCommand<'a>(&'a FakeGpu);

    struct FakeFence<'a> {
        id: u32,
        gpu: &'a FakeGpu,
    }

    struct FakeBuffer<'a>(&'a FakeGpu);

    impl<'a> Submit for FakeCommand<'a> {
        type Fence = FakeFence<'a>;

        fn submit(&self) -> GpuResult<FakeFence<'a>> {
            let id = self.0.submitted.get() + 1;
            self.0.submitted.set(id);
            self.0.events.borrow_mut().push(Event::Submit(id));
            Ok(FakeFence { id, gpu: self.0 })
        }
    }

    impl Wait for FakeFence<'_> {
        fn wait(&self) -> GpuResult<()> {
            self.gpu.completed.set(self.id);
            self.gpu.events.borrow_mut().push(Event::Wait(self.id));
            Ok(())
        }
    }

    impl Drop for FakeFence<'_> {
        fn drop(&mut self) {
            self.gpu.fences_dropped.set(self.gpu.fences_dropped.get() + 1);
        }
    }

    impl Readback for FakeBuffer<'_> {
        fn dump(&self, dst: &mut [u8]) -> GpuResult<usize> {
            self.0.events.borrow_mut().push(Event::Dump);
            let bytes = self.0.completed.get().to_le_bytes();
            let len = dst.len().min(bytes.len());
            dst[..len].copy_from_slice(&bytes[..len]);
            Ok(len)
        }
    }

    #[test]
    fn first_call_only_primes() {
        let gpu = FakeGpu::default();
        let mut pacer = FramePacer::new();
        let mut out = [0xAAu8; 4];

        assert!(pacer.is_first_render());
        let frame = pacer
            .advance(&FakeCommand(&gpu), &FakeBuffer(&gpu), &mut out)
            .unwrap();

        assert_eq!(frame, Frame::Primed);
        assert!(!pacer.is_first_render());
        assert_eq!(out, [0xAA; 4]);
        assert_eq!(*gpu.events.borrow(), vec![Event::Submit(1)]);
    }

    #[test]
    fn call_k_delivers_submission_k_minus_one() {
        let gpu = FakeGpu::default();
        let (command, buffer) = (FakeCommand(&gpu), FakeBuffer(&gpu));
        let mut pacer = FramePacer::new();

        pacer.advance(&command, &buffer, &mut [0u8; 4]).unwrap();
        for k in 2..=6u32 {
            let mut out = [0u8; 4];
            let frame = pacer.advance(&command, &buffer, &mut out).unwrap();
            assert_eq!(frame, Frame::Delivered(4));
            assert_eq!(u32::from_le_bytes(out), k - 1);
            assert_eq!(gpu.submitted.get(), k);
        }
    }

    #[test]
    fn wait_then_dump_then_resubmit() {
        let gpu = FakeGpu::default();
        let (command, buffer) = (FakeCommand(&gpu), FakeBuffer(&gpu));
        let mut pacer = FramePacer::new();

        for _ in 0..3 {
            pacer.advance(&command, &buffer, &mut [0u8; 4]).unwrap();
        }
        assert_eq!(
            *gpu.events.borrow(),
            vec![
                Event::Submit(1),
                Event::Wait(1),
                Event::Dump,
                Event::Submit(2),
                Event::Wait(2),
                Event::Dump,
                Event::Submit(3),
            ]
        );
    }

    #[test]
    fn each_fence_released_exactly_once() {
        let gpu = FakeGpu::default();
        let (command, buffer) = (FakeCommand(&gpu), FakeBuffer(&gpu));
        let mut pacer = FramePacer::new();

        for _ in 0..5 {
            pacer.advance(&command, &buffer, &mut [0u8; 4]).unwrap();
        }
        // The newest fence is still in flight
        assert_eq!(gpu.fences_dropped.get(), 4);

        pacer.drain().unwrap();
        assert_eq!(gpu.fences_dropped.get(), 5);
        assert_eq!(gpu.events.borrow().last(), Some(&Event::Wait(5)));

        // Nothing left to wait on
        pacer.drain().unwrap();
        drop(pacer);
        assert_eq!(gpu.fences_dropped.get(), 5);
    }

    #[test]
    fn drain_restarts_priming() {
        let gpu = FakeGpu::default();
        let (command, buffer) = (FakeCommand(&gpu), FakeBuffer(&gpu));
        let mut pacer = FramePacer::new();

        pacer.advance(&command, &buffer, &mut [0u8; 4]).unwrap();
        pacer.drain().unwrap();
        assert!(pacer.is_first_render());

        let frame = pacer.advance(&command, &buffer, &mut [0u8; 4]).unwrap();
        assert_eq!(frame, Frame::Primed);
    }

    #[test]
    fn short_output_is_partially_filled() {
        let gpu = FakeGpu::default();
        let (command, buffer) = (FakeCommand(&gpu), FakeBuffer(&gpu));
        let mut pacer = FramePacer::new();

        pacer.advance(&command, &buffer, &mut []).unwrap();
        let mut out = [0u8; 2];
        let frame = pacer.advance(&command, &buffer, &mut out).unwrap();
        assert_eq!(frame, Frame::Delivered(2));
        assert_eq!(out, [1, 0]);
    }
}
