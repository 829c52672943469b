// Backend module - Vulkan abstraction layer
//
// Thin RAII wrappers around ash. Each type owns its handles and releases
// them on drop; every one holds an Arc<VulkanDevice> so the device and
// instance outlive it.

pub mod buffer;
pub mod descriptor;
pub mod device;
pub mod image;
pub mod layout;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;
pub mod upload;

pub use device::VulkanDevice;
