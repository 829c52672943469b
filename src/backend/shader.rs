// Shader module loading
//
// SPIR-V is read from the asset directory at startup. build.rs compiles the
// GLSL sources in shaders/ into that directory when glslc is available.

use anyhow::{Context, Result};
use ash::vk;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use super::VulkanDevice;

/// Decode SPIR-V bytes into aligned words, validating the magic number.
pub fn decode_spirv(bytes: &[u8]) -> Result<Vec<u32>> {
    ash::util::read_spv(&mut Cursor::new(bytes)).context("Invalid SPIR-V bytecode")
}

pub struct ShaderModule {
    device: Arc<VulkanDevice>,
    pub module: vk::ShaderModule,
}

impl ShaderModule {
    pub fn from_bytes(device: &Arc<VulkanDevice>, bytes: &[u8]) -> Result<Self> {
        let code = decode_spirv(bytes)?;
        let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);

        let module = unsafe { device.device.create_shader_module(&create_info, None) }
            .context("Failed to create shader module")?;

        Ok(Self {
            device: device.clone(),
            module,
        })
    }

    pub fn load(device: &Arc<VulkanDevice>, path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read shader {}", path.display()))?;
        log::debug!("Loaded shader {} ({} bytes)", path.display(), bytes.len());
        Self::from_bytes(device, &bytes)
            .with_context(|| format!("Failed to build shader {}", path.display()))
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_shader_module(self.module, None) };
    }
}
