// Mesh viewer library
//
// Everything except the window event loop lives here so the frame protocol
// can be driven by tests without a GPU.

pub mod backend;
pub mod camera;
pub mod config;
pub mod error;
pub mod frame;
pub mod mesh;
pub mod overlay;
pub mod renderer;

pub use camera::{CameraController, OrbitCamera, PointerState};
pub use config::Config;
pub use error::RendererError;
pub use frame::{FrameBackend, FrameEvents, FrameLoop, FrameOutcome, SkipReason};
pub use overlay::{HudOverlay, Overlay, OverlayTarget};
pub use renderer::VulkanRenderer;
