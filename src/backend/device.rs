// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with optional validation layers
// - Window surface creation
// - Physical device scoring and selection
// - Logical device + unified graphics/transfer/present queue

use anyhow::{Context, Result};
use ash::extensions::{ext::DebugUtils, khr};
use ash::{vk, Entry};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::{c_char, CStr, CString};
use std::sync::Arc;

use crate::error::RendererError;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Features turned on for the logical device. Selection already rejects
/// devices without geometry shader support.
const REQUIRED_DEVICE_FEATURES: vk::PhysicalDeviceFeatures = vk::PhysicalDeviceFeatures {
    geometry_shader: vk::TRUE,
    ..unsafe { std::mem::zeroed() }
};

fn required_device_extensions() -> [&'static CStr; 1] {
    [khr::Swapchain::name()]
}

// ─────────────────────────────────────────────────────────────────────────────
// Candidate snapshot + scoring
// ─────────────────────────────────────────────────────────────────────────────

/// Capabilities of one enumerated GPU, captured once during selection.
#[derive(Debug, Clone)]
pub struct PhysicalDeviceInfo {
    pub handle: vk::PhysicalDevice,
    /// Position in the instance's enumeration order
    pub index: usize,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: u32,
    pub max_image_dimension_2d: u32,
    pub geometry_shader: bool,
    /// First family with graphics, transfer and present support
    pub unified_queue_family: Option<u32>,
    pub extensions: Vec<String>,
    pub surface_formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl PhysicalDeviceInfo {
    fn query(
        instance: &ash::Instance,
        surface_loader: &khr::Surface,
        surface: vk::SurfaceKHR,
        handle: vk::PhysicalDevice,
        index: usize,
    ) -> Result<Self> {
        let properties = unsafe { instance.get_physical_device_properties(handle) };
        let features = unsafe { instance.get_physical_device_features(handle) };
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(handle) };
        let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        let families = unsafe { instance.get_physical_device_queue_family_properties(handle) };
        let mut unified_queue_family = None;
        for (family_index, family) in families.iter().enumerate() {
            let family_index = family_index as u32;
            let flags = family.queue_flags;
            if !flags.contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER) {
                continue;
            }
            let present = unsafe {
                surface_loader.get_physical_device_surface_support(handle, family_index, surface)
            }?;
            if present {
                unified_queue_family = Some(family_index);
                break;
            }
        }

        let extensions = unsafe { instance.enumerate_device_extension_properties(handle) }?
            .iter()
            .map(|ext| {
                unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();

        let surface_formats =
            unsafe { surface_loader.get_physical_device_surface_formats(handle, surface) }?;
        let present_modes =
            unsafe { surface_loader.get_physical_device_surface_present_modes(handle, surface) }?;

        Ok(Self {
            handle,
            index,
            name,
            device_type: properties.device_type,
            api_version: properties.api_version,
            max_image_dimension_2d: properties.limits.max_image_dimension2_d,
            geometry_shader: features.geometry_shader == vk::TRUE,
            unified_queue_family,
            extensions,
            surface_formats,
            present_modes,
            memory_properties,
        })
    }

    pub fn supports_extension(&self, name: &CStr) -> bool {
        let name = name.to_string_lossy();
        self.extensions.iter().any(|ext| *ext == name)
    }

    /// 0 means the device is unusable.
    pub fn score(&self) -> u32 {
        let meets_contract = self.geometry_shader
            && self.unified_queue_family.is_some()
            && required_device_extensions()
                .iter()
                .all(|ext| self.supports_extension(ext))
            && !self.surface_formats.is_empty()
            && !self.present_modes.is_empty();

        if !meets_contract {
            return 0;
        }

        let mut score = self.max_image_dimension_2d;
        if self.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
            score += 1000;
        }
        score
    }
}

/// Highest-scoring usable device; among equal scores the lowest
/// enumeration index wins regardless of slice order.
pub fn pick_best_device(candidates: &[PhysicalDeviceInfo]) -> Option<&PhysicalDeviceInfo> {
    let mut ordered: Vec<&PhysicalDeviceInfo> = candidates.iter().collect();
    ordered.sort_by_key(|info| info.index);

    let mut best: Option<(&PhysicalDeviceInfo, u32)> = None;
    for info in ordered {
        let score = info.score();
        log::debug!("GPU candidate #{} '{}' scored {}", info.index, info.name, score);
        if score == 0 {
            continue;
        }
        match best {
            Some((_, best_score)) if best_score >= score => {}
            _ => best = Some((info, score)),
        }
    }
    best.map(|(info, _)| info)
}

// ─────────────────────────────────────────────────────────────────────────────
// Device
// ─────────────────────────────────────────────────────────────────────────────

/// Vulkan device wrapper with automatic cleanup. Everything else holds an
/// `Arc` to this, so the instance outlives every object created from it.
pub struct VulkanDevice {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    _entry: Entry,

    pub surface_loader: khr::Surface,
    pub surface: vk::SurfaceKHR,

    // Single queue serving graphics, transfer and present
    pub queue: vk::Queue,
    pub queue_family: u32,

    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,

    /// Snapshot of the selected GPU, kept for memory-type and format queries
    pub info: PhysicalDeviceInfo,
}

impl VulkanDevice {
    /// Create instance, surface and logical device for a window.
    ///
    /// # Arguments
    /// * `app_name` - Application name for debugging
    /// * `enable_validation` - Request the Khronos validation layer
    pub fn new(
        app_name: &str,
        enable_validation: bool,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
    ) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", app_name);

        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let enable_validation = enable_validation && Self::validation_layer_available(&entry)?;
        let instance = Self::create_instance(&entry, app_name, enable_validation, display_handle)?;

        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        let surface_loader = khr::Surface::new(&entry, &instance);
        let surface = unsafe {
            ash_window::create_surface(&entry, &instance, display_handle, window_handle, None)
        }
        .context("Failed to create window surface")?;

        let info = Self::pick_physical_device(&instance, &surface_loader, surface)?;
        let queue_family = info
            .unified_queue_family
            .context("Selected GPU has no unified queue family")?;

        let (device, queue) = Self::create_logical_device(&instance, info.handle, queue_family)?;

        log::info!("Selected GPU #{}: {} (score {})", info.index, info.name, info.score());
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(info.api_version),
            vk::api_version_minor(info.api_version),
            vk::api_version_patch(info.api_version)
        );

        Ok(Arc::new(Self {
            device,
            physical_device: info.handle,
            instance,
            _entry: entry,
            surface_loader,
            surface,
            queue,
            queue_family,
            debug_utils,
            info,
        }))
    }

    fn validation_layer_available(entry: &Entry) -> Result<bool> {
        let layers = entry.enumerate_instance_layer_properties()?;
        let found = layers
            .iter()
            .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == VALIDATION_LAYER);
        if !found {
            log::warn!("Validation requested but {:?} is not installed", VALIDATION_LAYER);
        }
        Ok(found)
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
        display_handle: RawDisplayHandle,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("mesh-viewer")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_1);

        // Surface extensions for whatever windowing system we are on
        let mut extensions: Vec<*const c_char> =
            ash_window::enumerate_required_extensions(display_handle)
                .context("Unsupported windowing system")?
                .to_vec();
        if enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        let layer_names = if enable_validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to create debug messenger")?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        surface_loader: &khr::Surface,
        surface: vk::SurfaceKHR,
    ) -> Result<PhysicalDeviceInfo> {
        let devices = unsafe { instance.enumerate_physical_devices() }?;

        let candidates = devices
            .iter()
            .enumerate()
            .map(|(index, &handle)| {
                PhysicalDeviceInfo::query(instance, surface_loader, surface, handle, index)
            })
            .collect::<Result<Vec<_>>>()?;

        match pick_best_device(&candidates) {
            Some(info) => Ok(info.clone()),
            None => Err(RendererError::NoSuitableDevice {
                candidates: candidates.len(),
            }
            .into()),
        }
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
    ) -> Result<(ash::Device, vk::Queue)> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        let extensions: Vec<*const c_char> = required_device_extensions()
            .iter()
            .map(|ext| ext.as_ptr())
            .collect();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extensions)
            .enabled_features(&REQUIRED_DEVICE_FEATURES);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        Ok((device, queue))
    }

    /// Optimal-tiling features of a format on the selected GPU
    pub fn optimal_tiling_features(&self, format: vk::Format) -> vk::FormatFeatureFlags {
        unsafe {
            self.instance
                .get_physical_device_format_properties(self.physical_device, format)
        }
        .optimal_tiling_features
    }

    pub fn surface_capabilities(&self) -> Result<vk::SurfaceCapabilitiesKHR> {
        let caps = unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(self.physical_device, self.surface)
        }?;
        Ok(caps)
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        unsafe {
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(index: usize, device_type: vk::PhysicalDeviceType, max_dim: u32) -> PhysicalDeviceInfo {
        PhysicalDeviceInfo {
            handle: vk::PhysicalDevice::null(),
            index,
            name: format!("gpu-{index}"),
            device_type,
            api_version: vk::API_VERSION_1_1,
            max_image_dimension_2d: max_dim,
            geometry_shader: true,
            unified_queue_family: Some(0),
            extensions: vec!["VK_KHR_swapchain".to_string()],
            surface_formats: vec![vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            }],
            present_modes: vec![vk::PresentModeKHR::FIFO],
            memory_properties: vk::PhysicalDeviceMemoryProperties::default(),
        }
    }

    #[test]
    fn discrete_gpu_gets_bonus() {
        let integrated = candidate(0, vk::PhysicalDeviceType::INTEGRATED_GPU, 16384);
        let discrete = candidate(1, vk::PhysicalDeviceType::DISCRETE_GPU, 16384);
        assert_eq!(integrated.score(), 16384);
        assert_eq!(discrete.score(), 17384);
    }

    #[test]
    fn missing_capabilities_score_zero() {
        let mut no_geometry = candidate(0, vk::PhysicalDeviceType::DISCRETE_GPU, 8192);
        no_geometry.geometry_shader = false;
        assert_eq!(no_geometry.score(), 0);

        let mut no_family = candidate(0, vk::PhysicalDeviceType::DISCRETE_GPU, 8192);
        no_family.unified_queue_family = None;
        assert_eq!(no_family.score(), 0);

        let mut no_swapchain = candidate(0, vk::PhysicalDeviceType::DISCRETE_GPU, 8192);
        no_swapchain.extensions.clear();
        assert_eq!(no_swapchain.score(), 0);

        let mut no_modes = candidate(0, vk::PhysicalDeviceType::DISCRETE_GPU, 8192);
        no_modes.present_modes.clear();
        assert_eq!(no_modes.score(), 0);

        let mut no_formats = candidate(0, vk::PhysicalDeviceType::DISCRETE_GPU, 8192);
        no_formats.surface_formats.clear();
        assert_eq!(no_formats.score(), 0);
    }

    #[test]
    fn picks_highest_score() {
        let candidates = vec![
            candidate(0, vk::PhysicalDeviceType::INTEGRATED_GPU, 16384),
            candidate(1, vk::PhysicalDeviceType::DISCRETE_GPU, 8192),
            candidate(2, vk::PhysicalDeviceType::CPU, 4096),
        ];
        assert_eq!(pick_best_device(&candidates).unwrap().index, 1);
    }

    #[test]
    fn ties_break_on_lowest_index_regardless_of_order() {
        let candidates = vec![
            candidate(3, vk::PhysicalDeviceType::DISCRETE_GPU, 16384),
            candidate(1, vk::PhysicalDeviceType::DISCRETE_GPU, 16384),
            candidate(2, vk::PhysicalDeviceType::DISCRETE_GPU, 16384),
        ];
        assert_eq!(pick_best_device(&candidates).unwrap().index, 1);
    }

    #[test]
    fn no_usable_device_yields_none() {
        let mut only = candidate(0, vk::PhysicalDeviceType::DISCRETE_GPU, 16384);
        only.geometry_shader = false;
        assert!(pick_best_device(&[only]).is_none());
        assert!(pick_best_device(&[]).is_none());
    }
}
