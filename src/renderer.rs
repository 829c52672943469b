// =============================================================================
// VULKAN RENDERER - the GPU side of the frame loop
// =============================================================================
//
// Owns every long-lived GPU object for one textured mesh and implements
// FrameBackend on top of them:
//
//   VulkanDevice ── Uploader ── mesh buffers + texture (immutable)
//        │
//        ├── SwapchainManager (images, depth, passes, framebuffers)
//        ├── FrameSlot x N   (command buffer, semaphores, fence, uniforms)
//        ├── Descriptors     (one set per slot)
//        └── mesh pipeline   (rebuilt with the swapchain)
//
// N is the swapchain image count at startup and stays fixed. Framebuffers
// follow the live swapchain, so a recreation may change their number.
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::sync::Arc;

use crate::backend::buffer::GpuBuffer;
use crate::backend::descriptor::{Descriptors, Sampler, SlotBindings};
use crate::backend::image::GpuImage;
use crate::backend::pipeline::{create_mesh_pipeline, GraphicsPipeline};
use crate::backend::shader::ShaderModule;
use crate::backend::swapchain::SwapchainManager;
use crate::backend::sync::FrameSlot;
use crate::backend::upload::Uploader;
use crate::backend::VulkanDevice;
use crate::config::Config;
use crate::frame::{AcquireOutcome, FrameBackend, PresentOutcome, UniformBufferObject};
use crate::mesh::{draw_count, load_mesh, load_texture};
use crate::overlay::OverlayTarget;

const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

/// Immutable geometry shared by every in-flight frame
struct MeshBuffers {
    vertices: GpuBuffer,
    vertex_count: u32,
    indices: Option<(GpuBuffer, u32)>,
}

/// Field order is drop order: pipeline and per-slot objects go before the
/// resources they reference, the device handle goes last.
pub struct VulkanRenderer {
    pipeline: Option<GraphicsPipeline>,
    vertex_shader: ShaderModule,
    fragment_shader: ShaderModule,
    descriptors: Descriptors,
    _sampler: Sampler,
    frames: Vec<FrameSlot>,
    command_pool: vk::CommandPool,
    _texture: GpuImage,
    mesh: MeshBuffers,
    swapchain: SwapchainManager,
    uploader: Uploader,
    clear_color: [f32; 4],
    device: Arc<VulkanDevice>,
}

impl VulkanRenderer {
    /// Bring up the device, load and upload assets, and build the first
    /// swapchain for `framebuffer_size` (which must be non-zero).
    pub fn new(
        config: &Config,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        framebuffer_size: (u32, u32),
    ) -> Result<Self> {
        log::info!("Initializing Vulkan...");

        let assets = &config.assets;
        let model_path = assets.resolve(&assets.model)?;
        let texture_path = assets.resolve(&assets.texture)?;
        let vertex_shader_path = assets.resolve(&assets.mesh_vertex_shader)?;
        let fragment_shader_path = assets.resolve(&assets.mesh_fragment_shader)?;

        let device = VulkanDevice::new(
            &config.window.title,
            config.debug.validation_layers,
            display_handle,
            window_handle,
        )?;
        let uploader = Uploader::new(device.clone())?;

        // ─────────────────────────────────────────────────────────────────────
        // Assets
        // ─────────────────────────────────────────────────────────────────────
        let mesh_data = load_mesh(&model_path)?;
        let vertices = uploader
            .upload_to_device_local(
                bytemuck::cast_slice(&mesh_data.vertices),
                vk::BufferUsageFlags::VERTEX_BUFFER,
            )
            .context("Failed to upload vertex buffer")?;
        let indices = if mesh_data.is_indexed() {
            let buffer = uploader
                .upload_to_device_local(
                    bytemuck::cast_slice(&mesh_data.indices),
                    vk::BufferUsageFlags::INDEX_BUFFER,
                )
                .context("Failed to upload index buffer")?;
            Some((buffer, draw_count(mesh_data.indices.len(), "indices")?))
        } else {
            None
        };
        let mesh = MeshBuffers {
            vertices,
            vertex_count: draw_count(mesh_data.vertices.len(), "vertices")?,
            indices,
        };

        let texture_data = load_texture(&texture_path)?;
        let texture = uploader
            .upload_image(
                &texture_data.pixels,
                texture_data.width,
                texture_data.height,
                TEXTURE_FORMAT,
            )
            .context("Failed to upload texture")?;

        // ─────────────────────────────────────────────────────────────────────
        // Swapchain
        // ─────────────────────────────────────────────────────────────────────
        let mut swapchain = SwapchainManager::new(device.clone(), config.preferred_present_mode())?;
        swapchain.create(framebuffer_size, &uploader)?;
        let slot_count = swapchain.state()?.image_count();

        // ─────────────────────────────────────────────────────────────────────
        // Frame slots
        // ─────────────────────────────────────────────────────────────────────
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(slot_count as u32);
        let command_buffers = match unsafe { device.device.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => buffers,
            Err(e) => {
                unsafe { device.device.destroy_command_pool(command_pool, None) };
                return Err(e).context("Failed to allocate command buffers");
            }
        };

        let frames = match command_buffers
            .into_iter()
            .map(|cmd| FrameSlot::new(&device, cmd))
            .collect::<Result<Vec<_>>>()
        {
            Ok(frames) => frames,
            Err(e) => {
                unsafe { device.device.destroy_command_pool(command_pool, None) };
                return Err(e);
            }
        };

        // ─────────────────────────────────────────────────────────────────────
        // Descriptors and pipeline
        // ─────────────────────────────────────────────────────────────────────
        let sampler = Sampler::new(&device)?;
        let bindings: Vec<SlotBindings> = frames
            .iter()
            .map(|frame| SlotBindings {
                uniform_buffer: frame.uniform.handle(),
                uniform_range: frame.uniform.size(),
                texture_view: texture.view,
                sampler: sampler.handle,
            })
            .collect();
        let descriptors = Descriptors::new(&device, &bindings)?;

        let vertex_shader = ShaderModule::load(&device, &vertex_shader_path)?;
        let fragment_shader = ShaderModule::load(&device, &fragment_shader_path)?;

        let mut renderer = Self {
            pipeline: None,
            vertex_shader,
            fragment_shader,
            descriptors,
            _sampler: sampler,
            frames,
            command_pool,
            _texture: texture,
            mesh,
            swapchain,
            uploader,
            clear_color: config.graphics.clear_color,
            device,
        };
        renderer.build_pipeline()?;

        log::info!(
            "Vulkan initialized: {} frame slots, {} vertices, {}",
            slot_count,
            renderer.mesh.vertex_count,
            match &renderer.mesh.indices {
                Some((_, count)) => format!("{} indices", count),
                None => "non-indexed".to_string(),
            }
        );
        Ok(renderer)
    }

    pub fn device(&self) -> &Arc<VulkanDevice> {
        &self.device
    }

    pub fn wait_idle(&self) -> Result<()> {
        self.device.wait_idle()
    }

    fn build_pipeline(&mut self) -> Result<()> {
        let state = self.swapchain.state()?;
        let pipeline = create_mesh_pipeline(
            &self.device,
            state.scene_render_pass,
            state.extent(),
            self.descriptors.layout,
            self.vertex_shader.module,
            self.fragment_shader.module,
        )?;
        self.pipeline = Some(pipeline);
        Ok(())
    }

    fn frame(&self, slot: usize) -> Result<&FrameSlot> {
        self.frames
            .get(slot)
            .with_context(|| format!("Frame slot {} out of range", slot))
    }
}

impl FrameBackend for VulkanRenderer {
    fn slot_count(&self) -> usize {
        self.frames.len()
    }

    fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
        self.frame(slot)?.wait()
    }

    fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome> {
        let semaphore = self.frame(slot)?.image_available;
        self.swapchain.acquire_next_image(semaphore)
    }

    fn reset_slot(&mut self, slot: usize) -> Result<()> {
        self.frame(slot)?.reset_fence()
    }

    fn record_scene(&mut self, slot: usize, image_index: u32) -> Result<()> {
        let frame = self.frame(slot)?;
        let cmd = frame.command_buffer;
        let state = self.swapchain.state()?;
        let framebuffer = *state
            .framebuffers
            .get(image_index as usize)
            .with_context(|| format!("No framebuffer for image {}", image_index))?;
        let pipeline = self.pipeline.as_ref().context("Mesh pipeline not built")?;
        let descriptor_set = *self
            .descriptors
            .sets
            .get(slot)
            .with_context(|| format!("No descriptor set for slot {}", slot))?;

        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.clear_color,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];

        let device = &self.device.device;
        unsafe {
            device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .context("Failed to reset command buffer")?;

            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device
                .begin_command_buffer(cmd, &begin_info)
                .context("Failed to begin command buffer")?;

            let render_pass_info = vk::RenderPassBeginInfo::builder()
                .render_pass(state.scene_render_pass)
                .framebuffer(framebuffer)
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent: state.extent(),
                })
                .clear_values(&clear_values);
            device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);

            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline.pipeline);
            device.cmd_bind_vertex_buffers(cmd, 0, &[self.mesh.vertices.buffer], &[0]);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline.layout,
                0,
                &[descriptor_set],
                &[],
            );

            match &self.mesh.indices {
                Some((indices, count)) => {
                    device.cmd_bind_index_buffer(cmd, indices.buffer, 0, vk::IndexType::UINT32);
                    device.cmd_draw_indexed(cmd, *count, 1, 0, 0, 0);
                }
                None => device.cmd_draw(cmd, self.mesh.vertex_count, 1, 0, 0),
            }

            device.cmd_end_render_pass(cmd);
            device
                .end_command_buffer(cmd)
                .context("Failed to end command buffer")?;
        }
        Ok(())
    }

    fn write_uniforms(&mut self, slot: usize, ubo: &UniformBufferObject) -> Result<()> {
        let frame = self
            .frames
            .get_mut(slot)
            .with_context(|| format!("Frame slot {} out of range", slot))?;
        frame.uniform.write(ubo);
        Ok(())
    }

    fn overlay_target(&self, image_index: u32) -> Result<OverlayTarget> {
        let state = self.swapchain.state()?;
        let framebuffer = *state
            .overlay_framebuffers
            .get(image_index as usize)
            .with_context(|| format!("No overlay framebuffer for image {}", image_index))?;
        Ok(OverlayTarget {
            render_pass: state.overlay_render_pass,
            framebuffer,
            extent: state.extent(),
            generation: state.generation,
        })
    }

    fn submit(&mut self, slot: usize, overlay: vk::CommandBuffer) -> Result<()> {
        let frame = self.frame(slot)?;

        let wait_semaphores = [frame.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [frame.command_buffer, overlay];
        let signal_semaphores = [frame.render_finished];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device.device.queue_submit(
                self.device.queue,
                &[submit_info.build()],
                frame.in_flight_fence,
            )
        }
        .context("Failed to submit frame")
    }

    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome> {
        let semaphore = self.frame(slot)?.render_finished;
        self.swapchain.present(self.device.queue, image_index, semaphore)
    }

    fn recreate_swapchain(&mut self, framebuffer_size: (u32, u32)) -> Result<()> {
        self.device.wait_idle()?;

        // The pipeline references the scene render pass, so it goes first
        self.pipeline = None;
        self.swapchain.invalidate();
        self.swapchain.create(framebuffer_size, &self.uploader)?;
        self.build_pipeline()?;

        for frame in &mut self.frames {
            frame.refresh_semaphores()?;
        }

        let image_count = self.swapchain.state()?.image_count();
        if image_count != self.frames.len() {
            log::debug!(
                "Swapchain now has {} images, keeping {} frame slots",
                image_count,
                self.frames.len()
            );
        }
        Ok(())
    }

    fn extent(&self) -> vk::Extent2D {
        self.swapchain
            .state()
            .map(|state| state.extent())
            .unwrap_or_default()
    }
}

impl Drop for VulkanRenderer {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");
        if let Err(e) = self.device.wait_idle() {
            log::error!("wait_idle failed during teardown: {:#}", e);
        }
        self.pipeline = None;
        unsafe {
            // Frees every slot's command buffer as well
            self.device
                .device
                .destroy_command_pool(self.command_pool, None)
        };
        // Remaining fields drop in declaration order
    }
}
