// =============================================================================
// COMPUTE FRAMES - Vulkan compute driver
// =============================================================================
//
// Two passes over the same stack:
//
// 1. ONE-SHOT: instance -> compute device -> shader -> pipeline -> buffer
//    -> command -> submit -> wait -> print the buffer as u32 words
//    (runs when a shader path is given on the command line)
//
// 2. FRAME LOOP: the host entry points, fed the configured shader once,
//    then asked for `frame.frames + 1` frames (the first call only primes)
//
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use compute_frames::backend::{Binding, Instance};
use compute_frames::{Config, FrameTarget, HostContext, PixelFormat, RenderOutcome};
use std::path::Path;

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting compute-frames");

    if let Some(path) = std::env::args().nth(1) {
        run_once(&config, Path::new(&path))?;
    }

    run_frames(&config)
}

fn init_logging(config: &Config) {
    use env_logger::Builder;

    let mut builder = Builder::new();
    builder.filter_level(config.log_level());
    // RUST_LOG still wins when set
    builder.parse_default_env();
    builder.init();
}

// =============================================================================
// ONE-SHOT DISPATCH
// =============================================================================

/// Dispatch `shader` once over a small storage buffer and print the result.
fn run_once(config: &Config, shader_path: &Path) -> Result<()> {
    const BUFFER_SIZE: vk::DeviceSize = 1024;

    let instance = Instance::new(&config.app.app_info(), config.validation_enabled())?;
    log::info!("1. Instance ready");

    let device = instance.compute_device()?;
    log::info!("2. Device ready");

    let shader = device
        .create_shader_from_path(shader_path, vk::ShaderStageFlags::COMPUTE)
        .with_context(|| format!("Failed to load shader {:?}", shader_path))?;
    log::info!("3. Shader ready");

    let pipeline = device.create_compute_pipeline(&shader, &[vec![Binding::storage(0)]])?;
    log::info!("4. Pipeline ready");

    let buffer = device.create_buffer(
        BUFFER_SIZE,
        vk::BufferUsageFlags::STORAGE_BUFFER,
        vk::MemoryPropertyFlags::HOST_VISIBLE,
    )?;
    pipeline.feed_buffer(0, 0, &buffer, 0, BUFFER_SIZE)?;
    log::info!("5. Buffer ready");

    let groups = (BUFFER_SIZE / 4 / 64) as u32;
    let command = pipeline.create_command(&[groups])?;
    let fence = command.submit()?;
    log::info!("6. Command ready");

    fence.wait()?;
    log::info!("7. Fence ready");

    buffer.print()?;
    log::info!("8. Finish");
    Ok(())
}

// =============================================================================
// FRAME LOOP
// =============================================================================

fn run_frames(config: &Config) -> Result<()> {
    let shader = std::fs::read(&config.compute.shader).with_context(|| {
        format!(
            "Failed to read shader {:?} (compile it with glslc)",
            config.compute.shader
        )
    })?;

    let host = HostContext::new(config.clone());
    anyhow::ensure!(host.load_shader(&shader), "Failed to build compute pipeline");

    let frame_len = host
        .frame_len()
        .context("Configured frame size does not fit in memory")?;
    let mut pixels = vec![0u8; frame_len];
    for call in 1..=config.frame.frames + 1 {
        let outcome = host.render_into(FrameTarget {
            format: PixelFormat::Rgba8888,
            pixels: &mut pixels,
        });

        match outcome {
            RenderOutcome::Primed => log::info!("Call {}: pipeline primed", call),
            RenderOutcome::Rendered => {
                log::info!("Call {}: frame checksum {:#010x}", call, checksum(&pixels))
            }
            RenderOutcome::Skipped => anyhow::bail!("Call {}: render failed", call),
        }
    }

    host.shutdown();
    Ok(())
}

/// FNV-1a over the frame bytes
fn checksum(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0x811c_9dc5, |hash, &b| {
        (hash ^ b as u32).wrapping_mul(0x0100_0193)
    })
}
