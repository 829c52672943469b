// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every section falls back to defaults, so a missing file or a partial file
// both produce a usable viewer configuration.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::RendererError;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub assets: AssetConfig,
    pub camera: CameraConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Mesh Viewer".to_string(),
            width: 800,
            height: 600,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub preferred_present_mode: String,
    pub clear_color: [f32; 4],
    pub show_overlay: bool,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            preferred_present_mode: "mailbox".to_string(),
            clear_color: [0.0, 0.0, 0.0, 1.0],
            show_overlay: true,
        }
    }
}

/// Asset locations, relative to `root`
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AssetConfig {
    pub root: PathBuf,
    pub model: PathBuf,
    pub texture: PathBuf,
    pub mesh_vertex_shader: PathBuf,
    pub mesh_fragment_shader: PathBuf,
    pub overlay_vertex_shader: PathBuf,
    pub overlay_fragment_shader: PathBuf,
}

impl Default for AssetConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("assets"),
            model: PathBuf::from("models/quad.obj"),
            texture: PathBuf::from("textures/checker.png"),
            mesh_vertex_shader: PathBuf::from("shaders/mesh.vert.spv"),
            mesh_fragment_shader: PathBuf::from("shaders/mesh.frag.spv"),
            overlay_vertex_shader: PathBuf::from("shaders/overlay.vert.spv"),
            overlay_fragment_shader: PathBuf::from("shaders/overlay.frag.spv"),
        }
    }
}

impl AssetConfig {
    /// Resolve a configured path against the asset root and check it exists.
    pub fn resolve(&self, relative: &Path) -> Result<PathBuf> {
        let path = self.root.join(relative);
        if !path.is_file() {
            return Err(RendererError::MissingAsset(path).into());
        }
        Ok(path)
    }
}

/// Orbit camera defaults
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub fov_degrees: f32,
    pub near: f32,
    pub far: f32,
    pub distance: f32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            fov_degrees: 45.0,
            near: 0.1,
            far: 100.0,
            distance: 5.0,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: cfg!(debug_assertions),
            show_fps: true,
        }
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

    /// Preferred present mode as Vulkan enum. FIFO is the fallback at
    /// swapchain creation whatever this returns.
    pub fn preferred_present_mode(&self) -> vk::PresentModeKHR {
        match self.graphics.preferred_present_mode.to_lowercase().as_str() {
            "immediate" => vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => vk::PresentModeKHR::MAILBOX,
            "fifo" => vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => vk::PresentModeKHR::FIFO_RELAXED,
            other => {
                log::warn!("Unknown present mode '{}', preferring MAILBOX", other);
                vk::PresentModeKHR::MAILBOX
            }
        }
    }
}
