// Images with bound memory and a view: depth buffers and textures

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::buffer::allocate_memory;
use super::VulkanDevice;
use crate::error::RendererError;

/// Depth formats in order of preference
pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 5] = [
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D32_SFLOAT,
    vk::Format::D24_UNORM_S8_UINT,
    vk::Format::D16_UNORM_S8_UINT,
    vk::Format::D16_UNORM,
];

/// First candidate whose optimal-tiling features include depth/stencil
/// attachment support.
pub fn choose_depth_format<F>(optimal_tiling_features: F) -> Result<vk::Format, RendererError>
where
    F: Fn(vk::Format) -> vk::FormatFeatureFlags,
{
    DEPTH_FORMAT_CANDIDATES
        .iter()
        .copied()
        .find(|&format| {
            optimal_tiling_features(format)
                .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        })
        .ok_or(RendererError::NoDepthFormat)
}

pub fn has_stencil_component(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D32_SFLOAT_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::S8_UINT
    )
}

pub fn is_depth_format(format: vk::Format) -> bool {
    DEPTH_FORMAT_CANDIDATES.contains(&format)
}

/// Aspect flags a view or barrier on `format` must name
pub fn aspect_mask(format: vk::Format) -> vk::ImageAspectFlags {
    if is_depth_format(format) {
        if has_stencil_component(format) {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        } else {
            vk::ImageAspectFlags::DEPTH
        }
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

pub struct ImageDesc {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub mip_levels: u32,
}

/// 2D image, its dedicated memory and a view over all its mips.
pub struct GpuImage {
    device: Arc<VulkanDevice>,
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub mip_levels: u32,
}

impl GpuImage {
    pub fn new(device: &Arc<VulkanDevice>, desc: &ImageDesc) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(1)
            .format(desc.format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(desc.usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { device.device.create_image(&image_info, None) }
            .context("Failed to create image")?;

        let mut this = Self {
            device: device.clone(),
            image,
            memory: vk::DeviceMemory::null(),
            view: vk::ImageView::null(),
            format: desc.format,
            extent: desc.extent,
            mip_levels: desc.mip_levels,
        };

        let requirements = unsafe { device.device.get_image_memory_requirements(image) };
        this.memory = allocate_memory(device, requirements, vk::MemoryPropertyFlags::DEVICE_LOCAL)?;

        unsafe { device.device.bind_image_memory(image, this.memory, 0) }
            .context("Failed to bind image memory")?;

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(desc.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect_mask(desc.format),
                base_mip_level: 0,
                level_count: desc.mip_levels,
                base_array_layer: 0,
                layer_count: 1,
            });

        this.view = unsafe { device.device.create_image_view(&view_info, None) }
            .context("Failed to create image view")?;

        Ok(this)
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_image_view(self.view, None);
            self.device.device.destroy_image(self.image, None);
            self.device.device.free_memory(self.memory, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supports(formats: &'static [vk::Format]) -> impl Fn(vk::Format) -> vk::FormatFeatureFlags {
        move |format| {
            if formats.contains(&format) {
                vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT
                    | vk::FormatFeatureFlags::SAMPLED_IMAGE
            } else {
                vk::FormatFeatureFlags::SAMPLED_IMAGE
            }
        }
    }

    #[test]
    fn prefers_first_supported_candidate() {
        let all = supports(&DEPTH_FORMAT_CANDIDATES);
        assert_eq!(choose_depth_format(all).unwrap(), vk::Format::D32_SFLOAT_S8_UINT);

        let no_d32s8 = supports(&[vk::Format::D24_UNORM_S8_UINT, vk::Format::D32_SFLOAT]);
        assert_eq!(choose_depth_format(no_d32s8).unwrap(), vk::Format::D32_SFLOAT);

        let only_d16 = supports(&[vk::Format::D16_UNORM]);
        assert_eq!(choose_depth_format(only_d16).unwrap(), vk::Format::D16_UNORM);
    }

    #[test]
    fn no_depth_support_is_an_error() {
        let none = supports(&[]);
        assert!(matches!(
            choose_depth_format(none),
            Err(RendererError::NoDepthFormat)
        ));
    }

    #[test]
    fn aspect_follows_format() {
        assert_eq!(
            aspect_mask(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(aspect_mask(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
        assert_eq!(aspect_mask(vk::Format::R8G8B8A8_SRGB), vk::ImageAspectFlags::COLOR);
    }
}
