// Per-frame-in-flight resources
//
// A FrameSlot is touched only on its own turn. Its fence gates reuse of
// the command buffer and the uniform buffer.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::buffer::UniformBuffer;
use super::VulkanDevice;
use crate::frame::UniformBufferObject;

pub struct FrameSlot {
    device: Arc<VulkanDevice>,
    /// Freed together with the renderer's command pool
    pub command_buffer: vk::CommandBuffer,
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
    pub uniform: UniformBuffer,
}

fn create_semaphore(device: &VulkanDevice) -> Result<vk::Semaphore> {
    let semaphore_info = vk::SemaphoreCreateInfo::builder();
    unsafe { device.device.create_semaphore(&semaphore_info, None) }
        .context("Failed to create semaphore")
}

impl FrameSlot {
    pub fn new(device: &Arc<VulkanDevice>, command_buffer: vk::CommandBuffer) -> Result<Self> {
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED); // first wait must not block

        let uniform = UniformBuffer::new(
            device,
            std::mem::size_of::<UniformBufferObject>() as vk::DeviceSize,
        )?;

        let image_available = create_semaphore(device)?;
        let render_finished = create_semaphore(device)?;
        let in_flight_fence = unsafe { device.device.create_fence(&fence_info, None) }
            .context("Failed to create fence")?;

        Ok(Self {
            device: device.clone(),
            command_buffer,
            image_available,
            render_finished,
            in_flight_fence,
            uniform,
        })
    }

    /// Block until the GPU has finished this slot's previous submission.
    pub fn wait(&self) -> Result<()> {
        unsafe {
            self.device
                .device
                .wait_for_fences(&[self.in_flight_fence], true, u64::MAX)
        }
        .context("Failed waiting for frame fence")
    }

    /// Mark the slot busy. Only valid after `wait`.
    pub fn reset_fence(&self) -> Result<()> {
        unsafe { self.device.device.reset_fences(&[self.in_flight_fence]) }
            .context("Failed to reset frame fence")
    }

    /// Replace both semaphores. Called with the device idle after a swapchain
    /// recreation, when a failed present may have left one signaled.
    pub fn refresh_semaphores(&mut self) -> Result<()> {
        let image_available = create_semaphore(&self.device)?;
        let render_finished = create_semaphore(&self.device)?;
        unsafe {
            self.device.device.destroy_semaphore(self.image_available, None);
            self.device.device.destroy_semaphore(self.render_finished, None);
        }
        self.image_available = image_available;
        self.render_finished = render_finished;
        Ok(())
    }
}

impl Drop for FrameSlot {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_semaphore(self.image_available, None);
            self.device.device.destroy_semaphore(self.render_finished, None);
            self.device.device.destroy_fence(self.in_flight_fence, None);
        }
    }
}
