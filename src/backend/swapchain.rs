// Swapchain - Window presentation
//
// Owns every object whose size or format follows the window surface:
// swapchain images + views, the depth buffer, both render passes and both
// framebuffer sets. They are created together and destroyed together;
// nothing here is ever patched in place.
//
//   Uninitialized --create--> Ready --invalidate--> Invalidated --create--> Ready
//                               \______________ destroy ______________/--> Destroyed

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::vk;
use std::sync::Arc;

use super::image::{choose_depth_format, GpuImage, ImageDesc};
use super::pipeline::{
    create_framebuffers, create_overlay_render_pass, create_scene_render_pass,
    destroy_framebuffers,
};
use super::upload::Uploader;
use super::VulkanDevice;
use crate::frame::{AcquireOutcome, PresentOutcome};

// ─────────────────────────────────────────────────────────────────────────────
// Setting choices
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainSettings {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
}

/// sRGB BGRA8 if offered, otherwise whatever the surface lists first
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
}

pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if available.contains(&preferred) {
        preferred
    } else {
        vk::PresentModeKHR::FIFO // FIFO is always supported
    }
}

/// The surface's fixed size when it reports one, otherwise the framebuffer
/// size clamped to the surface limits.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, framebuffer_size: (u32, u32)) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: framebuffer_size
            .0
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: framebuffer_size
            .1
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// One more than the minimum; a max of 0 means unbounded.
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let wanted = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        wanted.min(caps.max_image_count)
    } else {
        wanted
    }
}

pub fn choose_settings(
    caps: &vk::SurfaceCapabilitiesKHR,
    formats: &[vk::SurfaceFormatKHR],
    present_modes: &[vk::PresentModeKHR],
    preferred_present_mode: vk::PresentModeKHR,
    framebuffer_size: (u32, u32),
) -> Result<SwapchainSettings> {
    let surface_format =
        choose_surface_format(formats).context("Surface reports no formats")?;
    Ok(SwapchainSettings {
        surface_format,
        present_mode: choose_present_mode(present_modes, preferred_present_mode),
        extent: choose_extent(caps, framebuffer_size),
        image_count: choose_image_count(caps),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Manager
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapchainStatus {
    Uninitialized,
    Ready,
    Invalidated,
    Destroyed,
}

impl SwapchainStatus {
    /// Status after a successful `create`. Only a fresh or invalidated
    /// swapchain may be built.
    pub fn created(self) -> Result<Self> {
        match self {
            Self::Uninitialized | Self::Invalidated => Ok(Self::Ready),
            Self::Ready | Self::Destroyed => {
                anyhow::bail!("create called on a {:?} swapchain", self)
            }
        }
    }

    /// Status after `invalidate`. Destroyed is terminal.
    pub fn invalidated(self) -> Self {
        match self {
            Self::Destroyed => Self::Destroyed,
            _ => Self::Invalidated,
        }
    }
}

/// Everything created by one successful `create`
pub struct SwapchainState {
    pub handle: vk::SwapchainKHR,
    /// Owned by the presentation engine, never destroyed individually
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub depth: Option<GpuImage>,
    pub scene_render_pass: vk::RenderPass,
    pub overlay_render_pass: vk::RenderPass,
    /// Indexed by acquired image index
    pub framebuffers: Vec<vk::Framebuffer>,
    pub overlay_framebuffers: Vec<vk::Framebuffer>,
    pub settings: SwapchainSettings,
    /// Bumped by every successful `create`; handle values can be recycled
    /// by the driver, generations are not.
    pub generation: u64,
}

impl SwapchainState {
    fn empty(handle: vk::SwapchainKHR, settings: SwapchainSettings, generation: u64) -> Self {
        Self {
            handle,
            images: Vec::new(),
            image_views: Vec::new(),
            depth: None,
            scene_render_pass: vk::RenderPass::null(),
            overlay_render_pass: vk::RenderPass::null(),
            framebuffers: Vec::new(),
            overlay_framebuffers: Vec::new(),
            settings,
            generation,
        }
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.settings.extent
    }

    pub fn format(&self) -> vk::Format {
        self.settings.surface_format.format
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Tear down in reverse dependency order. Null handles are skipped by
    /// the driver, so a half-built state is fine here.
    fn destroy(mut self, device: &VulkanDevice, loader: &khr::Swapchain) {
        destroy_framebuffers(device, &mut self.overlay_framebuffers);
        destroy_framebuffers(device, &mut self.framebuffers);
        unsafe {
            device.device.destroy_render_pass(self.overlay_render_pass, None);
            device.device.destroy_render_pass(self.scene_render_pass, None);
        }
        drop(self.depth.take());
        for view in self.image_views.drain(..) {
            unsafe { device.device.destroy_image_view(view, None) };
        }
        unsafe { loader.destroy_swapchain(self.handle, None) };
    }
}

pub struct SwapchainManager {
    device: Arc<VulkanDevice>,
    loader: khr::Swapchain,
    depth_format: vk::Format,
    preferred_present_mode: vk::PresentModeKHR,
    status: SwapchainStatus,
    state: Option<SwapchainState>,
    generation: u64,
}

impl SwapchainManager {
    pub fn new(device: Arc<VulkanDevice>, preferred_present_mode: vk::PresentModeKHR) -> Result<Self> {
        let loader = khr::Swapchain::new(&device.instance, &device.device);
        let depth_format = choose_depth_format(|format| device.optimal_tiling_features(format))?;
        log::info!("Depth format: {:?}", depth_format);

        Ok(Self {
            device,
            loader,
            depth_format,
            preferred_present_mode,
            status: SwapchainStatus::Uninitialized,
            state: None,
            generation: 0,
        })
    }

    pub fn state(&self) -> Result<&SwapchainState> {
        self.state.as_ref().context("Swapchain is not ready")
    }

    /// Build the swapchain and everything that depends on it. The caller
    /// guarantees a non-zero framebuffer size and no work in flight.
    pub fn create(&mut self, framebuffer_size: (u32, u32), uploader: &Uploader) -> Result<()> {
        let next_status = self.status.created()?;
        anyhow::ensure!(
            framebuffer_size.0 > 0 && framebuffer_size.1 > 0,
            "cannot create a swapchain for a zero-sized framebuffer"
        );

        let caps = self.device.surface_capabilities()?;
        let settings = choose_settings(
            &caps,
            &self.device.info.surface_formats,
            &self.device.info.present_modes,
            self.preferred_present_mode,
            framebuffer_size,
        )?;

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.device.surface)
            .min_image_count(settings.image_count)
            .image_format(settings.surface_format.format)
            .image_color_space(settings.surface_format.color_space)
            .image_extent(settings.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(settings.present_mode)
            .clipped(true);

        let handle = unsafe { self.loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;

        let mut state = SwapchainState::empty(handle, settings, self.generation + 1);
        if let Err(e) = self.populate(&mut state, uploader) {
            state.destroy(&self.device, &self.loader);
            return Err(e);
        }

        log::info!(
            "Swapchain ready: {}x{} {:?} {:?}, {} images",
            settings.extent.width,
            settings.extent.height,
            settings.surface_format.format,
            settings.present_mode,
            state.images.len()
        );

        self.generation = state.generation;
        self.state = Some(state);
        self.status = next_status;
        Ok(())
    }

    fn populate(&self, state: &mut SwapchainState, uploader: &Uploader) -> Result<()> {
        let device = &self.device;
        let format = state.format();
        let extent = state.extent();

        state.images = unsafe { self.loader.get_swapchain_images(state.handle) }
            .context("Failed to query swapchain images")?;

        for &image in &state.images {
            let create_info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::IDENTITY,
                    g: vk::ComponentSwizzle::IDENTITY,
                    b: vk::ComponentSwizzle::IDENTITY,
                    a: vk::ComponentSwizzle::IDENTITY,
                })
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });

            let view = unsafe { device.device.create_image_view(&create_info, None) }
                .context("Failed to create swapchain image view")?;
            state.image_views.push(view);
        }

        let depth = GpuImage::new(
            device,
            &ImageDesc {
                extent,
                format: self.depth_format,
                usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                mip_levels: 1,
            },
        )
        .context("Failed to create depth buffer")?;
        uploader.transition(
            &depth,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        )?;
        let depth_view = depth.view;
        state.depth = Some(depth);

        state.scene_render_pass = create_scene_render_pass(device, format, self.depth_format)?;
        state.overlay_render_pass = create_overlay_render_pass(device, format)?;

        state.framebuffers = create_framebuffers(
            device,
            &state.image_views,
            &[depth_view],
            state.scene_render_pass,
            extent,
        )?;
        state.overlay_framebuffers = create_framebuffers(
            device,
            &state.image_views,
            &[],
            state.overlay_render_pass,
            extent,
        )?;

        anyhow::ensure!(
            state.framebuffers.len() == state.images.len()
                && state.image_views.len() == state.images.len()
                && state.overlay_framebuffers.len() == state.images.len(),
            "swapchain object counts diverged"
        );
        Ok(())
    }

    /// Destroy every swapchain-dependent object. The caller must have
    /// waited for the device to go idle and dropped pipelines built against
    /// the render passes.
    pub fn invalidate(&mut self) {
        if let Some(state) = self.state.take() {
            log::debug!("Tearing down swapchain ({} images)", state.images.len());
            state.destroy(&self.device, &self.loader);
        }
        self.status = self.status.invalidated();
    }

    pub fn destroy(&mut self) {
        self.invalidate();
        self.status = SwapchainStatus::Destroyed;
    }

    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> Result<AcquireOutcome> {
        let Some(state) = self.state.as_ref() else {
            return Ok(AcquireOutcome::OutOfDate);
        };

        let result = unsafe {
            self.loader
                .acquire_next_image(state.handle, u64::MAX, semaphore, vk::Fence::null())
        };

        match result {
            Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Ready {
                image_index,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(e).context("Failed to acquire swapchain image"),
        }
    }

    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> Result<PresentOutcome> {
        let state = self.state()?;
        let swapchains = [state.handle];
        let image_indices = [image_index];
        let wait_semaphores = [wait_semaphore];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { self.loader.queue_present(queue, &present_info) } {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => Err(e).context("Failed to present swapchain image"),
        }
    }
}

impl Drop for SwapchainManager {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(min: u32, max: u32, current: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        }
    }

    fn format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    #[test]
    fn prefers_srgb_bgra() {
        let formats = [
            format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        assert_eq!(choose_surface_format(&formats), Some(formats[1]));
    }

    #[test]
    fn falls_back_to_first_format() {
        let formats = [
            format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        assert_eq!(choose_surface_format(&formats), Some(formats[0]));
        assert_eq!(choose_surface_format(&[]), None);
    }

    #[test]
    fn mailbox_when_available_else_fifo() {
        let all = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::IMMEDIATE,
        ];
        assert_eq!(
            choose_present_mode(&all, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO], vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn image_count_is_min_plus_one_clamped() {
        assert_eq!(choose_image_count(&caps(2, 8, (800, 600))), 3);
        assert_eq!(choose_image_count(&caps(3, 3, (800, 600))), 3);
        assert_eq!(choose_image_count(&caps(2, 0, (800, 600))), 3);
    }

    #[test]
    fn extent_uses_fixed_surface_size() {
        let fixed = caps(2, 8, (1024, 768));
        assert_eq!(
            choose_extent(&fixed, (800, 600)),
            vk::Extent2D {
                width: 1024,
                height: 768
            }
        );
    }

    #[test]
    fn extent_clamps_framebuffer_size() {
        let free = caps(2, 8, (u32::MAX, u32::MAX));
        assert_eq!(
            choose_extent(&free, (800, 600)),
            vk::Extent2D {
                width: 800,
                height: 600
            }
        );
        assert_eq!(
            choose_extent(&free, (10_000, 600)),
            vk::Extent2D {
                width: 4096,
                height: 600
            }
        );
    }

    #[test]
    fn settings_are_stable_for_unchanged_inputs() {
        let surface_caps = caps(2, 8, (u32::MAX, u32::MAX));
        let formats = [format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR)];
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];

        let first = choose_settings(&surface_caps, &formats, &modes, vk::PresentModeKHR::MAILBOX, (800, 600)).unwrap();
        let second = choose_settings(&surface_caps, &formats, &modes, vk::PresentModeKHR::MAILBOX, (800, 600)).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.image_count, 3);
        assert_eq!(first.surface_format.format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn status_follows_create_invalidate_create() {
        let status = SwapchainStatus::Uninitialized.created().unwrap();
        assert_eq!(status, SwapchainStatus::Ready);

        let status = status.invalidated();
        assert_eq!(status, SwapchainStatus::Invalidated);

        assert_eq!(status.created().unwrap(), SwapchainStatus::Ready);
    }

    #[test]
    fn create_is_rejected_on_ready_or_destroyed() {
        assert!(SwapchainStatus::Ready.created().is_err());
        assert!(SwapchainStatus::Destroyed.created().is_err());
    }

    #[test]
    fn destroyed_stays_destroyed() {
        assert_eq!(
            SwapchainStatus::Destroyed.invalidated(),
            SwapchainStatus::Destroyed
        );
        assert_eq!(
            SwapchainStatus::Uninitialized.invalidated(),
            SwapchainStatus::Invalidated
        );
    }
}
