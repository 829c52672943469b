// Buffer utilities for vertex, index, staging and uniform buffers
//
// A buffer handle and its memory block are created together and freed
// together when the owning GpuBuffer is dropped.

use anyhow::{Context, Result};
use ash::vk;
use std::ptr::NonNull;
use std::sync::Arc;

use super::VulkanDevice;
use crate::error::RendererError;

/// Lowest memory type index allowed by `type_filter` whose flags contain
/// all of `required`.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    required: vk::MemoryPropertyFlags,
) -> Result<u32, RendererError> {
    let count = memory_properties.memory_type_count.min(vk::MAX_MEMORY_TYPES as u32);
    (0..count)
        .find(|&i| {
            let allowed = type_filter & (1 << i) != 0;
            let flags = memory_properties.memory_types[i as usize].property_flags;
            allowed && flags & required == required
        })
        .ok_or(RendererError::NoSuitableMemoryType {
            type_filter,
            required,
        })
}

/// Allocate memory for `requirements` from a matching type on the device.
pub fn allocate_memory(
    device: &VulkanDevice,
    requirements: vk::MemoryRequirements,
    properties: vk::MemoryPropertyFlags,
) -> Result<vk::DeviceMemory> {
    let memory_type_index = find_memory_type(
        &device.info.memory_properties,
        requirements.memory_type_bits,
        properties,
    )?;

    let alloc_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type_index);

    unsafe { device.device.allocate_memory(&alloc_info, None) }
        .context("Failed to allocate device memory")
}

/// A buffer with its own dedicated memory block.
pub struct GpuBuffer {
    device: Arc<VulkanDevice>,
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
}

impl GpuBuffer {
    pub fn new(
        device: &Arc<VulkanDevice>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
            .context("Failed to create buffer")?;

        // From here on Drop releases whatever was created if a later step fails
        let mut this = Self {
            device: device.clone(),
            buffer,
            memory: vk::DeviceMemory::null(),
            size,
        };

        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };
        this.memory = allocate_memory(device, requirements, properties)?;

        unsafe { device.device.bind_buffer_memory(buffer, this.memory, 0) }
            .context("Failed to bind buffer memory")?;

        Ok(this)
    }

    /// Host-visible, coherent buffer pre-filled with `bytes`.
    pub fn with_data(
        device: &Arc<VulkanDevice>,
        usage: vk::BufferUsageFlags,
        bytes: &[u8],
    ) -> Result<Self> {
        let buffer = Self::new(
            device,
            bytes.len() as vk::DeviceSize,
            usage,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        buffer.write_bytes(bytes)?;
        Ok(buffer)
    }

    /// Map, copy, unmap. Only valid for host-visible memory.
    pub fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        anyhow::ensure!(
            bytes.len() as vk::DeviceSize <= self.size,
            "write of {} bytes overflows buffer of {} bytes",
            bytes.len(),
            self.size
        );

        unsafe {
            let ptr = self
                .device
                .device
                .map_memory(self.memory, 0, self.size, vk::MemoryMapFlags::empty())
                .context("Failed to map buffer memory")? as *mut u8;
            ptr.copy_from_nonoverlapping(bytes.as_ptr(), bytes.len());
            self.device.device.unmap_memory(self.memory);
        }
        Ok(())
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_buffer(self.buffer, None);
            self.device.device.free_memory(self.memory, None);
        }
    }
}

/// Persistently mapped host-coherent buffer, rewritten every frame.
pub struct UniformBuffer {
    buffer: GpuBuffer,
    mapped: NonNull<u8>,
}

impl UniformBuffer {
    pub fn new(device: &Arc<VulkanDevice>, size: vk::DeviceSize) -> Result<Self> {
        let buffer = GpuBuffer::new(
            device,
            size,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;

        let ptr = unsafe {
            device
                .device
                .map_memory(buffer.memory, 0, size, vk::MemoryMapFlags::empty())
        }
        .context("Failed to map uniform buffer")?;
        let mapped = NonNull::new(ptr as *mut u8).context("Driver returned a null mapping")?;

        Ok(Self { buffer, mapped })
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer.buffer
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.buffer.size
    }

    pub fn write<T: bytemuck::Pod>(&mut self, value: &T) {
        let bytes = bytemuck::bytes_of(value);
        debug_assert!(bytes.len() as vk::DeviceSize <= self.buffer.size);
        unsafe {
            self.mapped
                .as_ptr()
                .copy_from_nonoverlapping(bytes.as_ptr(), bytes.len());
        }
    }
}

impl Drop for UniformBuffer {
    fn drop(&mut self) {
        unsafe { self.buffer.device.device.unmap_memory(self.buffer.memory) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(flags: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = flags.len() as u32;
        for (i, &f) in flags.iter().enumerate() {
            props.memory_types[i].property_flags = f;
        }
        props
    }

    const DEVICE_LOCAL: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
    const HOST_VISIBLE: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_VISIBLE;
    const HOST_COHERENT: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_COHERENT;

    #[test]
    fn returns_lowest_matching_index() {
        let props = table(&[
            DEVICE_LOCAL,
            HOST_VISIBLE | HOST_COHERENT,
            HOST_VISIBLE | HOST_COHERENT | DEVICE_LOCAL,
        ]);
        assert_eq!(find_memory_type(&props, 0b111, DEVICE_LOCAL).unwrap(), 0);
        assert_eq!(
            find_memory_type(&props, 0b111, HOST_VISIBLE | HOST_COHERENT).unwrap(),
            1
        );
    }

    #[test]
    fn respects_type_filter() {
        let props = table(&[
            HOST_VISIBLE | HOST_COHERENT,
            DEVICE_LOCAL,
            HOST_VISIBLE | HOST_COHERENT | DEVICE_LOCAL,
        ]);
        // Type 0 matches the flags but is excluded by the filter
        assert_eq!(
            find_memory_type(&props, 0b100, HOST_VISIBLE | HOST_COHERENT).unwrap(),
            2
        );
    }

    #[test]
    fn superset_of_required_flags_matches() {
        let props = table(&[HOST_VISIBLE | HOST_COHERENT | vk::MemoryPropertyFlags::HOST_CACHED]);
        assert_eq!(find_memory_type(&props, 0b1, HOST_VISIBLE).unwrap(), 0);
    }

    #[test]
    fn no_match_is_an_error() {
        let props = table(&[DEVICE_LOCAL, DEVICE_LOCAL]);
        let err = find_memory_type(&props, 0b11, HOST_VISIBLE).unwrap_err();
        assert!(matches!(
            err,
            RendererError::NoSuitableMemoryType { type_filter: 0b11, .. }
        ));

        // Matching flags exist, but only outside the filter
        let props = table(&[DEVICE_LOCAL, HOST_VISIBLE]);
        assert!(find_memory_type(&props, 0b01, HOST_VISIBLE).is_err());
    }

    #[test]
    fn bits_beyond_type_count_are_ignored() {
        let mut props = table(&[DEVICE_LOCAL]);
        // Stale entry past memory_type_count must never be returned
        props.memory_types[1].property_flags = HOST_VISIBLE;
        assert!(find_memory_type(&props, 0b11, HOST_VISIBLE).is_err());
    }
}
