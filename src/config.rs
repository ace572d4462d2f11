// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Provides sensible defaults if the config file is missing or has errors.
// The loaded value is passed explicitly to the engine; nothing here is global.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::backend::AppInfo;

/// Root configuration structure
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct Config {
    pub app: AppConfig,
    pub debug: DebugConfig,
    pub compute: ComputeConfig,
    pub frame: FrameConfig,
}

/// Identity reported to the Vulkan driver
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AppConfig {
    pub name: String,
    pub version: [u32; 3],
    pub engine_name: String,
    pub engine_version: [u32; 3],
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "compute-frames".to_string(),
            version: [1, 0, 0],
            engine_name: "No Engine".to_string(),
            engine_version: [1, 0, 0],
        }
    }
}

impl AppConfig {
    pub fn app_info(&self) -> AppInfo {
        let version = |[major, minor, patch]: [u32; 3]| vk::make_api_version(0, major, minor, patch);
        AppInfo {
            app_name: self.name.clone(),
            app_version: version(self.version),
            engine_name: self.engine_name.clone(),
            engine_version: version(self.engine_version),
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_level: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_level: "info".to_string(),
        }
    }
}

/// Compute dispatch settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ComputeConfig {
    pub shader: PathBuf,
    pub workgroups: Vec<u32>,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            shader: PathBuf::from("shaders/frame.comp.spv"),
            workgroups: vec![64, 64],
        }
    }
}

/// Output frame settings (RGBA8888)
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FrameConfig {
    pub width: u32,
    pub height: u32,
    pub frames: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 1024,
            frames: 3,
        }
    }
}

impl FrameConfig {
    pub const BYTES_PER_PIXEL: usize = 4;

    /// Size in bytes of one frame, `None` when it does not fit in memory
    pub fn byte_len(&self) -> Option<usize> {
        usize::try_from(self.width)
            .ok()?
            .checked_mul(usize::try_from(self.height).ok()?)?
            .checked_mul(Self::BYTES_PER_PIXEL)
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Validation layers are on when asked for, except on Android
    pub fn validation_enabled(&self) -> bool {
        self.debug.validation_layers && !cfg!(target_os = "android")
    }

    /// Log filter from `debug.log_level`, `info` when unrecognised
    pub fn log_level(&self) -> log::LevelFilter {
        self.debug.log_level.parse().unwrap_or_else(|_| {
            log::warn!(
                "Unknown log level '{}', defaulting to info",
                self.debug.log_level
            );
            log::LevelFilter::Info
        })
    }
}
