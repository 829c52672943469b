// Fatal error taxonomy
//
// Everything here is unrecoverable: the renderer logs it and shuts down.
// Recoverable swapchain conditions are not errors, they travel as
// AcquireOutcome / PresentOutcome values instead.

use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RendererError {
    #[error("no suitable GPU found ({candidates} candidate(s) examined)")]
    NoSuitableDevice { candidates: usize },

    #[error("no memory type matches filter {type_filter:#034b} with flags {required:?}")]
    NoSuitableMemoryType {
        type_filter: u32,
        required: vk::MemoryPropertyFlags,
    },

    #[error("unsupported image layout transition {old:?} -> {new:?}")]
    UnsupportedLayoutTransition {
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    },

    #[error("none of the candidate depth formats support optimal-tiling depth attachments")]
    NoDepthFormat,

    #[error("unsupported mesh format '{extension}' for {}", path.display())]
    UnsupportedMeshFormat { path: PathBuf, extension: String },

    #[error("required asset is missing: {}", .0.display())]
    MissingAsset(PathBuf),

    #[error("mesh {} contains no vertices", .0.display())]
    EmptyMesh(PathBuf),
}
