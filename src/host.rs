// Host boundary - the two entry points a UI/platform layer calls
//
//   load_shader(bytes)      once, with a pre-compiled compute shader
//   render_into(target)     on every display refresh
//
// Failures are reported through `log` and turn the call into a no-op; nothing
// here panics or writes outside the caller's pixel buffer.

use parking_lot::Mutex;

use crate::config::Config;
use crate::engine::{Engine, Frame};

/// Pixel layout of a caller-owned frame buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgba8888,
    Rgb565,
    Alpha8,
}

/// A locked, caller-owned destination for one frame.
pub struct FrameTarget<'a> {
    pub format: PixelFormat,
    pub pixels: &'a mut [u8],
}

/// Outcome of a render call as seen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOutcome {
    /// Pixels now hold a complete frame.
    Rendered,
    /// Pipeline primed; pixels were not touched.
    Primed,
    /// Call rejected or failed; pixels were not touched.
    Skipped,
}

/// Owns the engine for the lifetime of the host view.
pub struct HostContext {
    config: Config,
    engine: Mutex<Option<Engine>>,
}

impl HostContext {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            engine: Mutex::new(None),
        }
    }

    /// Create the engine on first use and build the pipeline from `shader`.
    pub fn load_shader(&self, shader: &[u8]) -> bool {
        let mut slot = self.engine.lock();

        if slot.is_none() {
            match Engine::new(&self.config) {
                Ok(engine) => *slot = Some(engine),
                Err(e) => {
                    log::error!("Failed to start engine: {:#}", e);
                    return false;
                }
            }
        }

        let Some(engine) = slot.as_mut() else {
            return false;
        };
        match engine.load_shader(shader) {
            Ok(()) => true,
            Err(e) => {
                log::error!("Failed to load shader ({} bytes): {:#}", shader.len(), e);
                false
            }
        }
    }

    /// Produce one frame into `target`.
    pub fn render_into(&self, target: FrameTarget<'_>) -> RenderOutcome {
        if target.format != PixelFormat::Rgba8888 {
            log::error!("Frame format is not RGBA_8888: {:?}", target.format);
            return RenderOutcome::Skipped;
        }

        let mut slot = self.engine.lock();
        let Some(engine) = slot.as_mut().filter(|e| e.is_loaded()) else {
            log::warn!("Render requested before a shader was loaded");
            return RenderOutcome::Skipped;
        };

        if let Err(e) = check_frame_len(target.pixels.len(), engine.frame_len()) {
            log::error!("{}", e);
            return RenderOutcome::Skipped;
        }

        match engine.render(target.pixels) {
            Ok(Frame::Primed) => RenderOutcome::Primed,
            Ok(Frame::Delivered(_)) => RenderOutcome::Rendered,
            Err(e) => {
                log::error!("{:#}", e);
                RenderOutcome::Skipped
            }
        }
    }

    /// Wait for outstanding GPU work and release the engine.
    pub fn shutdown(&self) {
        if let Some(mut engine) = self.engine.lock().take() {
            if let Err(e) = engine.finish() {
                log::error!("{:#}", e);
            }
        }
    }

    /// Bytes a render target must hold, `None` when the configured frame
    /// size overflows.
    pub fn frame_len(&self) -> Option<usize> {
        let len = self.config.frame.byte_len();
        if len.is_none() {
            log::error!(
                "Frame size {}x{} is too large",
                self.config.frame.width,
                self.config.frame.height
            );
        }
        len
    }
}

/// A target must hold exactly one frame.
pub fn check_frame_len(actual: usize, expected: usize) -> anyhow::Result<()> {
    anyhow::ensure!(
        actual == expected,
        "Output buffer holds {} bytes, a frame needs {}",
        actual,
        expected
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> Config {
        let mut config = Config::default();
        config.frame.width = 4;
        config.frame.height = 2;
        config
    }

    #[test]
    fn frame_len_must_match_exactly() {
        assert!(check_frame_len(32, 32).is_ok());
        assert!(check_frame_len(31, 32).is_err());
        assert!(check_frame_len(33, 32).is_err());
        assert!(check_frame_len(0, 32).is_err());
    }

    #[test]
    fn wrong_format_is_skipped_untouched() {
        let host = HostContext::new(small_config());
        let mut pixels = vec![7u8; host.frame_len().unwrap()];
        let outcome = host.render_into(FrameTarget {
            format: PixelFormat::Rgb565,
            pixels: &mut pixels,
        });
        assert_eq!(outcome, RenderOutcome::Skipped);
        assert!(pixels.iter().all(|&b| b == 7));
    }

    #[test]
    fn render_before_load_is_skipped() {
        let host = HostContext::new(small_config());
        let mut pixels = vec![0u8; host.frame_len().unwrap()];
        let outcome = host.render_into(FrameTarget {
            format: PixelFormat::Rgba8888,
            pixels: &mut pixels,
        });
        assert_eq!(outcome, RenderOutcome::Skipped);
    }

    #[test]
    fn shutdown_without_engine_is_harmless() {
        let host = HostContext::new(small_config());
        host.shutdown();
        host.shutdown();
    }

    #[test]
    fn frame_len_follows_config() {
        assert_eq!(HostContext::new(small_config()).frame_len(), Some(4 * 2 * 4));
    }

    #[test]
    fn oversized_frame_is_reported_not_fatal() {
        let mut config = small_config();
        config.frame.width = u32::MAX;
        config.frame.height = u32::MAX;
        config.debug.validation_layers = false;
        let host = HostContext::new(config);

        assert_eq!(host.frame_len(), None);
        // Engine creation rejects the frame size before touching Vulkan
        assert!(!host.load_shader(&[0u8; 20]));

        let mut pixels = vec![0u8; 16];
        let outcome = host.render_into(FrameTarget {
            format: PixelFormat::Rgba8888,
            pixels: &mut pixels,
        });
        assert_eq!(outcome, RenderOutcome::Skipped);
        host.shutdown();
    }
}
