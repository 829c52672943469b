// Descriptor set layout, pool and per-slot sets
//
// binding 0: uniform buffer (vertex stage)
// binding 1: combined image sampler (fragment stage)

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;

pub const UNIFORM_BINDING: u32 = 0;
pub const TEXTURE_BINDING: u32 = 1;

pub fn create_set_layout(device: &VulkanDevice) -> Result<vk::DescriptorSetLayout> {
    let bindings = [
        vk::DescriptorSetLayoutBinding::builder()
            .binding(UNIFORM_BINDING)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::VERTEX)
            .build(),
        vk::DescriptorSetLayoutBinding::builder()
            .binding(TEXTURE_BINDING)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            .build(),
    ];

    let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
    unsafe { device.device.create_descriptor_set_layout(&layout_info, None) }
        .context("Failed to create descriptor set layout")
}

pub struct Sampler {
    device: Arc<VulkanDevice>,
    pub handle: vk::Sampler,
}

impl Sampler {
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        Ok(Self {
            device: device.clone(),
            handle: create_sampler(device)?,
        })
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_sampler(self.handle, None) };
    }
}

/// Linear filtering, repeat addressing, no anisotropy.
fn create_sampler(device: &VulkanDevice) -> Result<vk::Sampler> {
    let sampler_info = vk::SamplerCreateInfo::builder()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::REPEAT)
        .address_mode_v(vk::SamplerAddressMode::REPEAT)
        .address_mode_w(vk::SamplerAddressMode::REPEAT)
        .anisotropy_enable(false)
        .max_anisotropy(1.0)
        .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
        .unnormalized_coordinates(false)
        .compare_enable(false)
        .compare_op(vk::CompareOp::ALWAYS)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .mip_lod_bias(0.0)
        .min_lod(0.0)
        .max_lod(0.0);

    unsafe { device.device.create_sampler(&sampler_info, None) }
        .context("Failed to create texture sampler")
}

/// What one slot's descriptor set points at
pub struct SlotBindings {
    pub uniform_buffer: vk::Buffer,
    pub uniform_range: vk::DeviceSize,
    pub texture_view: vk::ImageView,
    pub sampler: vk::Sampler,
}

/// Layout, pool and one set per frame slot. Sets are indexed by slot,
/// never by swapchain image index.
pub struct Descriptors {
    device: Arc<VulkanDevice>,
    pub layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    pub sets: Vec<vk::DescriptorSet>,
}

impl Descriptors {
    pub fn new(device: &Arc<VulkanDevice>, slots: &[SlotBindings]) -> Result<Self> {
        let slot_count = slots.len() as u32;
        let layout = create_set_layout(device)?;

        let mut this = Self {
            device: device.clone(),
            layout,
            pool: vk::DescriptorPool::null(),
            sets: Vec::new(),
        };

        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: slot_count,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: slot_count,
            },
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&pool_sizes)
            .max_sets(slot_count);
        this.pool = unsafe { device.device.create_descriptor_pool(&pool_info, None) }
            .context("Failed to create descriptor pool")?;

        let layouts = vec![layout; slots.len()];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(this.pool)
            .set_layouts(&layouts);
        this.sets = unsafe { device.device.allocate_descriptor_sets(&alloc_info) }
            .context("Failed to allocate descriptor sets")?;

        for (&set, bindings) in this.sets.iter().zip(slots) {
            let buffer_info = [vk::DescriptorBufferInfo {
                buffer: bindings.uniform_buffer,
                offset: 0,
                range: bindings.uniform_range,
            }];
            let image_info = [vk::DescriptorImageInfo {
                sampler: bindings.sampler,
                image_view: bindings.texture_view,
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            }];

            let writes = [
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(UNIFORM_BINDING)
                    .dst_array_element(0)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .buffer_info(&buffer_info)
                    .build(),
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(TEXTURE_BINDING)
                    .dst_array_element(0)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(&image_info)
                    .build(),
            ];
            unsafe { device.device.update_descriptor_sets(&writes, &[]) };
        }

        log::debug!("Allocated {} descriptor sets", this.sets.len());
        Ok(this)
    }
}

impl Drop for Descriptors {
    fn drop(&mut self) {
        unsafe {
            // Sets go with the pool
            self.device.device.destroy_descriptor_pool(self.pool, None);
            self.device
                .device
                .destroy_descriptor_set_layout(self.layout, None);
        }
    }
}
