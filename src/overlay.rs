// Immediate-mode overlay drawn after the scene
//
// The overlay records its own command buffer per slot, inside the overlay
// render pass the swapchain provides for the acquired image. That pass
// loads the scene's color and ends in PRESENT_SRC_KHR, so it is recorded
// every frame even when nothing is visible.

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::pipeline::{create_overlay_pipeline, GraphicsPipeline};
use crate::backend::shader::ShaderModule;
use crate::backend::VulkanDevice;
use crate::frame::FrameStats;

/// Where the overlay draws for one acquired image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlayTarget {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub extent: vk::Extent2D,
    /// Swapchain generation the render pass belongs to
    pub generation: u64,
}

impl OverlayTarget {
    /// Whether a pipeline built for `built_for` can draw into this target.
    /// Compared by generation, never by render pass handle value.
    pub fn accepts_pipeline_from(&self, built_for: Option<u64>) -> bool {
        built_for == Some(self.generation)
    }
}

pub trait Overlay {
    /// Start a new overlay frame with the loop's latest stats.
    fn begin_frame(&mut self, stats: &FrameStats);

    /// Record this slot's overlay commands into `target` and return the
    /// command buffer to submit after the scene.
    fn fill_command_buffer(&mut self, slot: usize, target: &OverlayTarget) -> Result<vk::CommandBuffer>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Frame-time graph layout
// ─────────────────────────────────────────────────────────────────────────────

pub const HISTORY_LEN: usize = 64;

const MARGIN_PX: f32 = 10.0;
const BAR_WIDTH_PX: f32 = 3.0;
const GRAPH_HEIGHT_PX: f32 = 60.0;
/// Frame time that fills the graph's full height
const GRAPH_CEILING: Duration = Duration::from_millis(33);
const TARGET_FRAME_TIME: Duration = Duration::from_micros(16_667);

const PANEL_COLOR: [f32; 4] = [0.05, 0.05, 0.05, 0.6];
const FAST_BAR_COLOR: [f32; 4] = [0.3, 0.85, 0.4, 0.9];
const SLOW_BAR_COLOR: [f32; 4] = [0.9, 0.3, 0.25, 0.9];
const TARGET_LINE_COLOR: [f32; 4] = [1.0, 1.0, 1.0, 0.5];

/// Push constant block for overlay.vert: a rect in NDC and its color.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct OverlayQuad {
    /// x0, y0, x1, y1
    pub rect: [f32; 4],
    pub color: [f32; 4],
}

impl OverlayQuad {
    /// Build from a pixel rect. Vulkan NDC has Y pointing down, so pixel
    /// rows map to NDC without flipping.
    pub fn from_pixels(x0: f32, y0: f32, x1: f32, y1: f32, extent: vk::Extent2D, color: [f32; 4]) -> Self {
        let w = extent.width.max(1) as f32;
        let h = extent.height.max(1) as f32;
        let to_ndc = |px: f32, size: f32| px / size * 2.0 - 1.0;
        Self {
            rect: [to_ndc(x0, w), to_ndc(y0, h), to_ndc(x1, w), to_ndc(y1, h)],
            color,
        }
    }
}

/// Lay out the frame-time graph in the top-left corner: a backing panel,
/// one bar per sample (oldest first) and a line at the 60 Hz budget.
pub fn layout_frame_graph(history: &VecDeque<Duration>, extent: vk::Extent2D) -> Vec<OverlayQuad> {
    let width = HISTORY_LEN as f32 * BAR_WIDTH_PX;
    let bottom = MARGIN_PX + GRAPH_HEIGHT_PX;

    let mut quads = Vec::with_capacity(history.len() + 2);
    quads.push(OverlayQuad::from_pixels(
        MARGIN_PX,
        MARGIN_PX,
        MARGIN_PX + width,
        bottom,
        extent,
        PANEL_COLOR,
    ));

    let ceiling = GRAPH_CEILING.as_secs_f32();
    for (i, sample) in history.iter().enumerate() {
        let fraction = (sample.as_secs_f32() / ceiling).min(1.0);
        let x0 = MARGIN_PX + i as f32 * BAR_WIDTH_PX;
        let color = if *sample > TARGET_FRAME_TIME {
            SLOW_BAR_COLOR
        } else {
            FAST_BAR_COLOR
        };
        quads.push(OverlayQuad::from_pixels(
            x0,
            bottom - fraction * GRAPH_HEIGHT_PX,
            x0 + BAR_WIDTH_PX - 1.0,
            bottom,
            extent,
            color,
        ));
    }

    let target_y = bottom - TARGET_FRAME_TIME.as_secs_f32() / ceiling * GRAPH_HEIGHT_PX;
    quads.push(OverlayQuad::from_pixels(
        MARGIN_PX,
        target_y,
        MARGIN_PX + width,
        target_y + 1.0,
        extent,
        TARGET_LINE_COLOR,
    ));

    quads
}

// ─────────────────────────────────────────────────────────────────────────────
// HUD
// ─────────────────────────────────────────────────────────────────────────────

/// Frame-time graph rendered with a single vertex-less pipeline.
pub struct HudOverlay {
    device: Arc<VulkanDevice>,
    command_pool: vk::CommandPool,
    /// Indexed by slot
    command_buffers: Vec<vk::CommandBuffer>,
    vertex_shader: ShaderModule,
    fragment_shader: ShaderModule,
    /// Built lazily for the current swapchain generation
    pipeline: Option<(u64, GraphicsPipeline)>,
    history: VecDeque<Duration>,
    visible: bool,
}

impl HudOverlay {
    pub fn new(
        device: &Arc<VulkanDevice>,
        slot_count: usize,
        vertex_shader: ShaderModule,
        fragment_shader: ShaderModule,
        visible: bool,
    ) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create overlay command pool")?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(slot_count as u32);
        let command_buffers = match unsafe { device.device.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => buffers,
            Err(e) => {
                unsafe { device.device.destroy_command_pool(command_pool, None) };
                return Err(e).context("Failed to allocate overlay command buffers");
            }
        };

        Ok(Self {
            device: device.clone(),
            command_pool,
            command_buffers,
            vertex_shader,
            fragment_shader,
            pipeline: None,
            history: VecDeque::with_capacity(HISTORY_LEN),
            visible,
        })
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn toggle_visible(&mut self) {
        self.visible = !self.visible;
        log::info!("Overlay {}", if self.visible { "shown" } else { "hidden" });
    }

    fn pipeline_for(&mut self, target: &OverlayTarget) -> Result<&GraphicsPipeline> {
        let built_for = self.pipeline.as_ref().map(|(generation, _)| *generation);
        if !target.accepts_pipeline_from(built_for) {
            // Swapchain recreation waits for idle, so the old pipeline is unused
            self.pipeline = None;
            let pipeline = create_overlay_pipeline(
                &self.device,
                target.render_pass,
                std::mem::size_of::<OverlayQuad>() as u32,
                self.vertex_shader.module,
                self.fragment_shader.module,
            )?;
            log::debug!("Built overlay pipeline for swapchain generation {}", target.generation);
            self.pipeline = Some((target.generation, pipeline));
        }
        self.pipeline
            .as_ref()
            .map(|(_, pipeline)| pipeline)
            .context("Overlay pipeline missing")
    }
}

impl Overlay for HudOverlay {
    fn begin_frame(&mut self, stats: &FrameStats) {
        if stats.last_frame_time.is_zero() {
            return;
        }
        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(stats.last_frame_time);
    }

    fn fill_command_buffer(&mut self, slot: usize, target: &OverlayTarget) -> Result<vk::CommandBuffer> {
        let cmd = *self
            .command_buffers
            .get(slot)
            .with_context(|| format!("No overlay command buffer for slot {}", slot))?;

        let quads = if self.visible {
            layout_frame_graph(&self.history, target.extent)
        } else {
            Vec::new()
        };
        let pipeline = if quads.is_empty() {
            None
        } else {
            let pipeline = self.pipeline_for(target)?;
            Some((pipeline.pipeline, pipeline.layout))
        };

        let device = &self.device.device;
        unsafe {
            device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .context("Failed to reset overlay command buffer")?;

            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device
                .begin_command_buffer(cmd, &begin_info)
                .context("Failed to begin overlay command buffer")?;

            let render_pass_info = vk::RenderPassBeginInfo::builder()
                .render_pass(target.render_pass)
                .framebuffer(target.framebuffer)
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent: target.extent,
                });
            device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);

            if let Some((pipeline, layout)) = pipeline {
                device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline);
                device.cmd_set_viewport(
                    cmd,
                    0,
                    &[vk::Viewport {
                        x: 0.0,
                        y: 0.0,
                        width: target.extent.width as f32,
                        height: target.extent.height as f32,
                        min_depth: 0.0,
                        max_depth: 1.0,
                    }],
                );
                device.cmd_set_scissor(
                    cmd,
                    0,
                    &[vk::Rect2D {
                        offset: vk::Offset2D { x: 0, y: 0 },
                        extent: target.extent,
                    }],
                );
                for quad in &quads {
                    device.cmd_push_constants(
                        cmd,
                        layout,
                        vk::ShaderStageFlags::VERTEX,
                        0,
                        bytemuck::bytes_of(quad),
                    );
                    device.cmd_draw(cmd, 6, 1, 0, 0);
                }
            }

            device.cmd_end_render_pass(cmd);
            device
                .end_command_buffer(cmd)
                .context("Failed to end overlay command buffer")?;
        }

        Ok(cmd)
    }
}

impl Drop for HudOverlay {
    fn drop(&mut self) {
        // Command buffers go with the pool
        unsafe { self.device.device.destroy_command_pool(self.command_pool, None) };
    }
}
