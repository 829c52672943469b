// Staging uploads into device-local memory
//
// Load-time only. Every upload records one single-use command buffer,
// submits it, and blocks on queue idle before the staging buffer is freed.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::buffer::GpuBuffer;
use super::image::{GpuImage, ImageDesc};
use super::layout::record_transition;
use super::VulkanDevice;

/// Bytes per texel for the formats `upload_image` accepts
fn texel_size(format: vk::Format) -> Option<u64> {
    match format {
        vk::Format::R8_UNORM | vk::Format::R8_SRGB => Some(1),
        vk::Format::R8G8_UNORM | vk::Format::R8G8_SRGB => Some(2),
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB => Some(4),
        vk::Format::R32G32B32A32_SFLOAT => Some(16),
        _ => None,
    }
}

/// The copy region covers the full extent, so the staging data must hold
/// exactly `width * height` tightly packed texels.
pub fn check_image_data(pixels: usize, width: u32, height: u32, format: vk::Format) -> Result<()> {
    anyhow::ensure!(width > 0 && height > 0, "image has zero extent");
    let texel = texel_size(format)
        .with_context(|| format!("no staging upload path for {:?}", format))?;
    let expected = u64::from(width) * u64::from(height) * texel;
    anyhow::ensure!(
        pixels as u64 == expected,
        "{}x{} {:?} image needs {} bytes, got {}",
        width,
        height,
        format,
        expected,
        pixels
    );
    Ok(())
}

pub struct Uploader {
    device: Arc<VulkanDevice>,
    command_pool: vk::CommandPool,
}

impl Uploader {
    pub fn new(device: Arc<VulkanDevice>) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);

        let command_pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create upload command pool")?;

        Ok(Self {
            device,
            command_pool,
        })
    }

    /// Record into a fresh command buffer, submit, and wait for the queue to
    /// drain. The command buffer is freed before returning.
    pub fn one_shot<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer) -> Result<()>,
    {
        let device = &self.device.device;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = unsafe { device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate upload command buffer")?[0];

        let result = self.record_and_submit(cmd, record);

        unsafe { device.free_command_buffers(self.command_pool, &[cmd]) };
        result
    }

    fn record_and_submit<F>(&self, cmd: vk::CommandBuffer, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer) -> Result<()>,
    {
        let device = &self.device.device;

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.begin_command_buffer(cmd, &begin_info) }?;

        record(device, cmd)?;

        unsafe { device.end_command_buffer(cmd) }?;

        let command_buffers = [cmd];
        let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
        unsafe {
            device
                .queue_submit(self.device.queue, &[submit_info.build()], vk::Fence::null())
                .context("Failed to submit upload")?;
            device
                .queue_wait_idle(self.device.queue)
                .context("Failed waiting for upload")?;
        }
        Ok(())
    }

    /// Copy `bytes` into a new device-local buffer with `usage`.
    pub fn upload_to_device_local(
        &self,
        bytes: &[u8],
        usage: vk::BufferUsageFlags,
    ) -> Result<GpuBuffer> {
        anyhow::ensure!(!bytes.is_empty(), "refusing to upload an empty buffer");

        let size = bytes.len() as vk::DeviceSize;
        let staging = GpuBuffer::with_data(&self.device, vk::BufferUsageFlags::TRANSFER_SRC, bytes)?;
        let destination = GpuBuffer::new(
            &self.device,
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;

        self.one_shot(|device, cmd| {
            let region = vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size,
            };
            unsafe { device.cmd_copy_buffer(cmd, staging.buffer, destination.buffer, &[region]) };
            Ok(())
        })?;

        log::debug!("Uploaded {} bytes ({:?})", size, usage);
        Ok(destination)
    }

    /// Upload tightly packed pixels into a sampled, shader-readable image.
    pub fn upload_image(
        &self,
        pixels: &[u8],
        width: u32,
        height: u32,
        format: vk::Format,
    ) -> Result<GpuImage> {
        check_image_data(pixels.len(), width, height, format)?;

        let staging =
            GpuBuffer::with_data(&self.device, vk::BufferUsageFlags::TRANSFER_SRC, pixels)?;
        let image = GpuImage::new(
            &self.device,
            &ImageDesc {
                extent: vk::Extent2D { width, height },
                format,
                usage: vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
                mip_levels: 1,
            },
        )?;

        self.one_shot(|device, cmd| {
            record_transition(
                device,
                cmd,
                image.image,
                format,
                1,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            )?;

            let region = vk::BufferImageCopy::builder()
                .buffer_offset(0)
                .buffer_row_length(0)
                .buffer_image_height(0)
                .image_subresource(vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
                .image_extent(vk::Extent3D {
                    width,
                    height,
                    depth: 1,
                })
                .build();
            unsafe {
                device.cmd_copy_buffer_to_image(
                    cmd,
                    staging.buffer,
                    image.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }

            record_transition(
                device,
                cmd,
                image.image,
                format,
                1,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            )?;
            Ok(())
        })?;

        log::debug!("Uploaded {}x{} image ({:?})", width, height, format);
        Ok(image)
    }

    /// Synchronous standalone layout transition, e.g. for a fresh depth buffer.
    pub fn transition(
        &self,
        image: &GpuImage,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    ) -> Result<()> {
        self.one_shot(|device, cmd| {
            record_transition(device, cmd, image.image, image.format, image.mip_levels, old, new)?;
            Ok(())
        })
    }
}

impl Drop for Uploader {
    fn drop(&mut self) {
        unsafe {
            self.device
                .device
                .destroy_command_pool(self.command_pool, None)
        };
    }
}
