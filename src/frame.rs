// =============================================================================
// FRAME LOOP - per-frame synchronization and submission
// =============================================================================
//
// Every tick runs the same strict sequence against slot `cur`:
//
//   wait fence[cur] -> acquire image -> reset fence[cur] -> record scene
//     -> overlay -> write uniforms[cur] -> submit -> present -> cur = cur+1 mod N
//
// Slots (command buffer, semaphores, fence, uniform buffer, descriptor set)
// are indexed by `cur`. Framebuffers are indexed by the acquired image
// index. The two numberings are independent.
//
// The loop talks to the GPU only through FrameBackend, so the protocol can
// run against a fake device in tests.
// =============================================================================

use anyhow::Result;
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Mat4;
use std::time::{Duration, Instant};

use crate::camera::{CameraController, PointerState};
use crate::overlay::{Overlay, OverlayTarget};

// ─────────────────────────────────────────────────────────────────────────────
// Swapchain outcomes
// ─────────────────────────────────────────────────────────────────────────────

/// Result of asking the presentation engine for the next image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Suboptimal images are still rendered to
    Ready { image_index: u32, suboptimal: bool },
    OutOfDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
}

// ─────────────────────────────────────────────────────────────────────────────
// Uniforms
// ─────────────────────────────────────────────────────────────────────────────

/// Per-slot uniform block, matching `ubo` in mesh.vert.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct UniformBufferObject {
    pub model: Mat4,
    pub view: Mat4,
    pub proj: Mat4,
}

impl UniformBufferObject {
    /// `projection` is the camera's right-handed projection; the clip-space
    /// Y flip is applied here.
    pub fn new(model: Mat4, view: Mat4, projection: Mat4) -> Self {
        Self {
            model,
            view,
            proj: flip_clip_y(projection),
        }
    }
}

/// Vulkan clip space has Y pointing down. Negates element [1][1].
pub fn flip_clip_y(projection: Mat4) -> Mat4 {
    let mut flipped = projection;
    flipped.y_axis.y = -flipped.y_axis.y;
    flipped
}

// ─────────────────────────────────────────────────────────────────────────────
// Backend seam
// ─────────────────────────────────────────────────────────────────────────────

/// GPU operations the frame loop sequences. `slot` is always the loop's
/// cursor; `image_index` always comes from the preceding acquire.
pub trait FrameBackend {
    /// N, the number of frame slots
    fn slot_count(&self) -> usize;

    /// Block until the slot's previous submission has completed.
    fn wait_for_slot(&mut self, slot: usize) -> Result<()>;

    fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome>;

    /// Unsignal the slot's fence ahead of submission.
    fn reset_slot(&mut self, slot: usize) -> Result<()>;

    /// Re-record the slot's scene command buffer targeting `image_index`.
    fn record_scene(&mut self, slot: usize, image_index: u32) -> Result<()>;

    fn write_uniforms(&mut self, slot: usize, ubo: &UniformBufferObject) -> Result<()>;

    /// Render pass and framebuffer the overlay draws into for this image
    fn overlay_target(&self, image_index: u32) -> Result<OverlayTarget>;

    /// Submit scene then overlay in one batch, signaling the slot's fence.
    fn submit(&mut self, slot: usize, overlay: vk::CommandBuffer) -> Result<()>;

    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome>;

    /// Wait for idle, tear down and rebuild every swapchain-dependent object.
    fn recreate_swapchain(&mut self, framebuffer_size: (u32, u32)) -> Result<()>;

    fn extent(&self) -> vk::Extent2D;
}

// ─────────────────────────────────────────────────────────────────────────────
// Loop state
// ─────────────────────────────────────────────────────────────────────────────

/// Window state handed to the loop each tick.
#[derive(Debug, Clone, Default)]
pub struct FrameEvents {
    pub framebuffer_size: (u32, u32),
    /// The window reported a resize since the previous tick
    pub resized: bool,
    pub pointer: PointerState,
}

#[derive(Debug, Clone, Default)]
pub struct FrameStats {
    pub frames_presented: u64,
    pub frames_skipped: u64,
    pub swapchain_recreations: u64,
    pub last_frame_time: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Zero-sized framebuffer; nothing can be rendered
    Minimized,
    /// Acquire reported out-of-date; the swapchain was rebuilt (or will be
    /// once the window has a size again)
    SwapchainOutOfDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented {
        slot: usize,
        image_index: u32,
        /// The swapchain was rebuilt after this present
        recreated: bool,
    },
    Skipped(SkipReason),
}

pub struct FrameLoop {
    cursor: usize,
    slot_count: usize,
    /// Swapchain torn down or known stale; rebuild before the next acquire
    invalidated: bool,
    /// Window resize seen but not yet acted on
    resize_pending: bool,
    stats: FrameStats,
    last_present: Option<Instant>,
}

impl FrameLoop {
    pub fn new(slot_count: usize) -> Self {
        assert!(slot_count > 0, "frame loop needs at least one slot");
        Self {
            cursor: 0,
            slot_count,
            invalidated: false,
            resize_pending: false,
            stats: FrameStats::default(),
            last_present: None,
        }
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn stats(&self) -> &FrameStats {
        &self.stats
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    /// Run one frame. Recoverable swapchain conditions are absorbed here;
    /// any returned error is fatal.
    pub fn tick<B: FrameBackend>(
        &mut self,
        backend: &mut B,
        camera: &mut dyn CameraController,
        overlay: &mut dyn Overlay,
        events: &FrameEvents,
    ) -> Result<FrameOutcome> {
        if events.resized {
            self.resize_pending = true;
        }

        let (width, height) = events.framebuffer_size;
        if width == 0 || height == 0 {
            self.stats.frames_skipped += 1;
            return Ok(FrameOutcome::Skipped(SkipReason::Minimized));
        }

        if self.invalidated {
            self.recover(backend, camera, events.framebuffer_size)?;
        }

        camera.update(&events.pointer);
        overlay.begin_frame(&self.stats);

        let slot = self.cursor;

        // 1. Backpressure: at most N submissions in flight
        backend.wait_for_slot(slot)?;

        // 2. Acquire
        let image_index = match backend.acquire_image(slot)? {
            AcquireOutcome::Ready {
                image_index,
                suboptimal,
            } => {
                if suboptimal {
                    log::debug!("Acquired suboptimal image {}", image_index);
                }
                image_index
            }
            AcquireOutcome::OutOfDate => {
                log::debug!("Swapchain out of date on acquire, skipping frame");
                self.invalidated = true;
                self.recover(backend, camera, events.framebuffer_size)?;
                self.stats.frames_skipped += 1;
                return Ok(FrameOutcome::Skipped(SkipReason::SwapchainOutOfDate));
            }
        };

        // 3. Only now is the slot known to be idle
        backend.reset_slot(slot)?;

        // 4. Scene, then overlay on top
        backend.record_scene(slot, image_index)?;
        let target = backend.overlay_target(image_index)?;
        let overlay_commands = overlay.fill_command_buffer(slot, &target)?;

        // 5. Camera state as of this frame, into this slot's buffer
        let ubo = UniformBufferObject::new(
            Mat4::IDENTITY,
            camera.view_matrix(),
            camera.projection_matrix(),
        );
        backend.write_uniforms(slot, &ubo)?;

        // 6. Submit
        backend.submit(slot, overlay_commands)?;

        // 7. Present
        let presented = backend.present(slot, image_index)?;
        let needs_rebuild = presented != PresentOutcome::Presented || self.resize_pending;
        if needs_rebuild {
            log::debug!(
                "Rebuilding swapchain after present ({:?}, resize pending: {})",
                presented,
                self.resize_pending
            );
            self.invalidated = true;
            self.recover(backend, camera, events.framebuffer_size)?;
        }

        // 8. Advance, whatever present reported
        self.cursor = (self.cursor + 1) % self.slot_count;

        let now = Instant::now();
        if let Some(previous) = self.last_present {
            self.stats.last_frame_time = now - previous;
        }
        self.last_present = Some(now);
        self.stats.frames_presented += 1;

        Ok(FrameOutcome::Presented {
            slot,
            image_index,
            recreated: needs_rebuild,
        })
    }

    /// Rebuild the swapchain if the window has a drawable size; otherwise
    /// stay invalidated until it does.
    fn recover<B: FrameBackend>(
        &mut self,
        backend: &mut B,
        camera: &mut dyn CameraController,
        framebuffer_size: (u32, u32),
    ) -> Result<()> {
        if framebuffer_size.0 == 0 || framebuffer_size.1 == 0 {
            log::debug!("Framebuffer is zero-sized, deferring swapchain rebuild");
            return Ok(());
        }

        backend.recreate_swapchain(framebuffer_size)?;
        camera.set_viewport(backend.extent());

        self.invalidated = false;
        self.resize_pending = false;
        self.stats.swapchain_recreations += 1;
        log::info!(
            "Swapchain recreated ({} so far)",
            self.stats.swapchain_recreations
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn projection_y_is_negated() {
        let proj = Mat4::perspective_rh(45f32.to_radians(), 800.0 / 600.0, 0.1, 100.0);
        let ubo = UniformBufferObject::new(Mat4::IDENTITY, Mat4::IDENTITY, proj);

        assert_relative_eq!(ubo.proj.y_axis.y, -proj.y_axis.y);
        assert!(ubo.proj.y_axis.y < 0.0);

        // Every other element is untouched
        let mut restored = ubo.proj;
        restored.y_axis.y = proj.y_axis.y;
        assert_eq!(restored, proj);
    }

    #[test]
    fn model_and_view_pass_through() {
        let model = Mat4::from_translation(glam::Vec3::new(1.0, 2.0, 3.0));
        let view = Mat4::from_rotation_y(0.5);
        let ubo = UniformBufferObject::new(model, view, Mat4::IDENTITY);
        assert_eq!(ubo.model, model);
        assert_eq!(ubo.view, view);
    }

    #[test]
    fn uniform_block_matches_shader_layout() {
        // Three column-major mat4s, no padding
        assert_eq!(std::mem::size_of::<UniformBufferObject>(), 3 * 64);
        let ubo = UniformBufferObject::new(Mat4::IDENTITY, Mat4::IDENTITY, Mat4::IDENTITY);
        let floats: &[f32; 48] = bytemuck::cast_ref(&ubo);
        // proj[1][1] sits at column 1, row 1 of the third matrix
        assert_eq!(floats[32 + 4 + 1], -1.0);
    }
}
