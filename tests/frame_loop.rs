// Frame protocol tests against a fake GPU
//
// The mock backend keeps fence state like a driver would: submit leaves the
// slot's fence unsignaled until the fake GPU completes it, and resetting a
// fence that is still in flight is an error.

use anyhow::{bail, Result};
use approx::assert_relative_eq;
use ash::vk::{self, Handle};
use glam::{Mat4, Vec3};
use mesh_viewer::camera::{CameraController, PointerState};
use mesh_viewer::frame::{
    AcquireOutcome, FrameBackend, FrameEvents, FrameLoop, FrameOutcome, FrameStats,
    PresentOutcome, SkipReason, UniformBufferObject,
};
use mesh_viewer::overlay::{Overlay, OverlayTarget};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;

// ─────────────────────────────────────────────────────────────────────────────
// Mocks
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Call {
    Wait(usize),
    Acquire(usize),
    Reset(usize),
    Record(usize, u32),
    Uniforms(usize),
    Submit(usize),
    Present(usize, u32),
    Recreate(u32, u32),
}

struct MockBackend {
    fences: Vec<bool>,
    /// Submitted slots the fake GPU has not finished, oldest first
    in_flight: VecDeque<usize>,
    acquire_script: VecDeque<AcquireOutcome>,
    present_script: VecDeque<PresentOutcome>,
    image_count: u32,
    next_image: u32,
    extent: vk::Extent2D,
    /// Bumped by every recreation, like the real swapchain's
    generation: u64,
    uniforms: Vec<Option<UniformBufferObject>>,
    calls: Vec<Call>,
    blocking_waits: usize,
}

impl MockBackend {
    fn new(slots: usize, image_count: u32) -> Self {
        Self {
            fences: vec![true; slots],
            in_flight: VecDeque::new(),
            acquire_script: VecDeque::new(),
            present_script: VecDeque::new(),
            image_count,
            next_image: 0,
            extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            generation: 1,
            uniforms: vec![None; slots],
            calls: Vec::new(),
            blocking_waits: 0,
        }
    }

    /// The fake GPU finishes everything up to and including `slot`'s work.
    fn complete_through(&mut self, slot: usize) {
        while let Some(done) = self.in_flight.pop_front() {
            self.fences[done] = true;
            if done == slot {
                break;
            }
        }
    }

    fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.iter().filter(|c| pred(c)).count()
    }
}

impl FrameBackend for MockBackend {
    fn slot_count(&self) -> usize {
        self.fences.len()
    }

    fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
        self.calls.push(Call::Wait(slot));
        if !self.fences[slot] {
            self.blocking_waits += 1;
            self.complete_through(slot);
        }
        Ok(())
    }

    fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome> {
        self.calls.push(Call::Acquire(slot));
        if let Some(outcome) = self.acquire_script.pop_front() {
            return Ok(outcome);
        }
        let image_index = self.next_image;
        self.next_image = (self.next_image + 1) % self.image_count;
        Ok(AcquireOutcome::Ready {
            image_index,
            suboptimal: false,
        })
    }

    fn reset_slot(&mut self, slot: usize) -> Result<()> {
        self.calls.push(Call::Reset(slot));
        if !self.fences[slot] {
            bail!("reset of fence {} while its work is in flight", slot);
        }
        self.fences[slot] = false;
        Ok(())
    }

    fn record_scene(&mut self, slot: usize, image_index: u32) -> Result<()> {
        self.calls.push(Call::Record(slot, image_index));
        Ok(())
    }

    fn write_uniforms(&mut self, slot: usize, ubo: &UniformBufferObject) -> Result<()> {
        self.calls.push(Call::Uniforms(slot));
        self.uniforms[slot] = Some(*ubo);
        Ok(())
    }

    fn overlay_target(&self, image_index: u32) -> Result<OverlayTarget> {
        Ok(OverlayTarget {
            render_pass: vk::RenderPass::from_raw(1),
            framebuffer: vk::Framebuffer::from_raw(100 + image_index as u64),
            extent: self.extent,
            generation: self.generation,
        })
    }

    fn submit(&mut self, slot: usize, _overlay: vk::CommandBuffer) -> Result<()> {
        self.calls.push(Call::Submit(slot));
        if self.fences[slot] {
            bail!("submit on slot {} without resetting its fence", slot);
        }
        self.in_flight.push_back(slot);
        Ok(())
    }

    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome> {
        self.calls.push(Call::Present(slot, image_index));
        Ok(self
            .present_script
            .pop_front()
            .unwrap_or(PresentOutcome::Presented))
    }

    fn recreate_swapchain(&mut self, framebuffer_size: (u32, u32)) -> Result<()> {
        self.calls.push(Call::Recreate(framebuffer_size.0, framebuffer_size.1));
        // Recreation waits for idle
        while let Some(done) = self.in_flight.pop_front() {
            self.fences[done] = true;
        }
        self.extent = vk::Extent2D {
            width: framebuffer_size.0,
            height: framebuffer_size.1,
        };
        self.next_image = 0;
        self.generation += 1;
        Ok(())
    }

    fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

/// Moves one unit along X per update, so each tick's view is distinct.
#[derive(Default)]
struct MockCamera {
    updates: u32,
    viewport: Option<vk::Extent2D>,
}

impl MockCamera {
    fn view_for(updates: u32) -> Mat4 {
        Mat4::from_translation(Vec3::new(updates as f32, 0.0, 0.0))
    }
}

impl CameraController for MockCamera {
    fn update(&mut self, _pointer: &PointerState) {
        self.updates += 1;
    }

    fn view_matrix(&self) -> Mat4 {
        Self::view_for(self.updates)
    }

    fn projection_matrix(&self) -> Mat4 {
        Mat4::perspective_rh(45f32.to_radians(), 4.0 / 3.0, 0.1, 100.0)
    }

    fn set_viewport(&mut self, extent: vk::Extent2D) {
        self.viewport = Some(extent);
    }
}

#[derive(Default)]
struct MockOverlay {
    frames_begun: usize,
    fills: Vec<(usize, OverlayTarget)>,
}

impl Overlay for MockOverlay {
    fn begin_frame(&mut self, _stats: &FrameStats) {
        self.frames_begun += 1;
    }

    fn fill_command_buffer(&mut self, slot: usize, target: &OverlayTarget) -> Result<vk::CommandBuffer> {
        self.fills.push((slot, *target));
        Ok(vk::CommandBuffer::from_raw(slot as u64 + 1))
    }
}

fn events(width: u32, height: u32) -> FrameEvents {
    FrameEvents {
        framebuffer_size: (width, height),
        ..Default::default()
    }
}

struct Harness {
    backend: MockBackend,
    camera: MockCamera,
    overlay: MockOverlay,
    frame_loop: FrameLoop,
}

impl Harness {
    fn new(slots: usize, image_count: u32) -> Self {
        Self {
            backend: MockBackend::new(slots, image_count),
            camera: MockCamera::default(),
            overlay: MockOverlay::default(),
            frame_loop: FrameLoop::new(slots),
        }
    }

    fn tick(&mut self, events: &FrameEvents) -> FrameOutcome {
        self.frame_loop
            .tick(&mut self.backend, &mut self.camera, &mut self.overlay, events)
            .expect("tick failed")
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Steady state
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn five_frames_block_from_frame_n_plus_one() {
    let mut h = Harness::new(3, 3);
    let ev = events(800, 600);

    for frame in 1..=5usize {
        let outcome = h.tick(&ev);
        assert!(matches!(outcome, FrameOutcome::Presented { recreated: false, .. }));
        let expected_blocking = frame.saturating_sub(3);
        assert_eq!(h.backend.blocking_waits, expected_blocking, "frame {}", frame);
    }

    assert_eq!(h.frame_loop.stats().frames_presented, 5);
    assert_eq!(h.frame_loop.stats().swapchain_recreations, 0);
    assert_eq!(h.backend.count(|c| matches!(c, Call::Recreate(..))), 0);

    let submitted: Vec<usize> = h
        .backend
        .calls
        .iter()
        .filter_map(|c| match c {
            Call::Submit(slot) => Some(*slot),
            _ => None,
        })
        .collect();
    assert_eq!(submitted, vec![0, 1, 2, 0, 1]);
    assert_eq!(h.frame_loop.cursor(), 2);
}

#[test]
fn each_frame_follows_the_protocol_order() {
    let mut h = Harness::new(2, 3);
    h.tick(&events(800, 600));

    assert_eq!(
        h.backend.calls,
        vec![
            Call::Wait(0),
            Call::Acquire(0),
            Call::Reset(0),
            Call::Record(0, 0),
            Call::Uniforms(0),
            Call::Submit(0),
            Call::Present(0, 0),
        ]
    );
    assert_eq!(h.overlay.frames_begun, 1);
    assert_eq!(h.overlay.fills.len(), 1);
}

#[test]
fn overlay_targets_the_acquired_image() {
    let mut h = Harness::new(2, 3);
    h.backend.acquire_script.push_back(AcquireOutcome::Ready {
        image_index: 2,
        suboptimal: false,
    });
    h.tick(&events(800, 600));

    let (slot, target) = h.overlay.fills[0];
    assert_eq!(slot, 0);
    assert_eq!(target.framebuffer, vk::Framebuffer::from_raw(102));
}

// ─────────────────────────────────────────────────────────────────────────────
// Invalidation
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn out_of_date_acquire_skips_submit_and_recreates() {
    let mut h = Harness::new(3, 3);
    h.tick(&events(800, 600));
    h.tick(&events(800, 600));

    h.backend.acquire_script.push_back(AcquireOutcome::OutOfDate);
    let calls_before = h.backend.calls.len();
    let outcome = h.tick(&events(1024, 768));
    assert_eq!(outcome, FrameOutcome::Skipped(SkipReason::SwapchainOutOfDate));

    let frame_three = &h.backend.calls[calls_before..];
    assert!(!frame_three.iter().any(|c| matches!(c, Call::Reset(_) | Call::Submit(_))));
    assert_eq!(frame_three.last(), Some(&Call::Recreate(1024, 768)));
    // Nothing was submitted, so the slot is retried
    assert_eq!(h.frame_loop.cursor(), 2);

    let outcome = h.tick(&events(1024, 768));
    assert!(matches!(outcome, FrameOutcome::Presented { slot: 2, recreated: false, .. }));
    assert_eq!(h.backend.extent().width, 1024);
    assert_eq!(
        h.camera.viewport,
        Some(vk::Extent2D {
            width: 1024,
            height: 768
        })
    );
    assert_eq!(h.frame_loop.stats().swapchain_recreations, 1);
    assert_eq!(h.frame_loop.stats().frames_skipped, 1);
}

#[test]
fn overlay_sees_a_new_generation_after_recreation() {
    let mut h = Harness::new(2, 2);
    h.tick(&events(800, 600));

    h.backend.acquire_script.push_back(AcquireOutcome::OutOfDate);
    h.tick(&events(800, 600));
    h.tick(&events(800, 600));

    let (_, before) = h.overlay.fills[0];
    let (_, after) = *h.overlay.fills.last().unwrap();
    assert_eq!(h.overlay.fills.len(), 2);
    // The mock hands out the same render pass handle both times
    assert_eq!(before.render_pass, after.render_pass);
    assert_ne!(before.generation, after.generation);
    assert!(!after.accepts_pipeline_from(Some(before.generation)));
}

#[test]
fn suboptimal_acquire_still_renders() {
    let mut h = Harness::new(2, 2);
    h.backend.acquire_script.push_back(AcquireOutcome::Ready {
        image_index: 1,
        suboptimal: true,
    });
    let outcome = h.tick(&events(800, 600));
    assert!(matches!(outcome, FrameOutcome::Presented { image_index: 1, recreated: false, .. }));
}

#[test]
fn suboptimal_present_recreates_and_still_advances() {
    let mut h = Harness::new(3, 3);
    h.backend.present_script.push_back(PresentOutcome::Suboptimal);

    let outcome = h.tick(&events(800, 600));
    assert!(matches!(outcome, FrameOutcome::Presented { slot: 0, recreated: true, .. }));
    assert_eq!(h.frame_loop.cursor(), 1);
    assert_eq!(h.backend.count(|c| matches!(c, Call::Recreate(800, 600))), 1);
    assert!(!h.frame_loop.is_invalidated());
}

#[test]
fn out_of_date_present_recreates() {
    let mut h = Harness::new(2, 2);
    h.backend.present_script.push_back(PresentOutcome::OutOfDate);
    let outcome = h.tick(&events(800, 600));
    assert!(matches!(outcome, FrameOutcome::Presented { recreated: true, .. }));
    assert_eq!(h.frame_loop.cursor(), 1);

    // The next frame runs normally on the new swapchain
    let outcome = h.tick(&events(800, 600));
    assert!(matches!(outcome, FrameOutcome::Presented { slot: 1, recreated: false, .. }));
}

#[test]
fn window_resize_recreates_after_present() {
    let mut h = Harness::new(2, 2);
    h.tick(&events(800, 600));

    let resized = FrameEvents {
        framebuffer_size: (640, 480),
        resized: true,
        ..Default::default()
    };
    let outcome = h.tick(&resized);
    assert!(matches!(outcome, FrameOutcome::Presented { recreated: true, .. }));
    assert_eq!(h.backend.calls.last(), Some(&Call::Recreate(640, 480)));

    // The flag is consumed
    let outcome = h.tick(&events(640, 480));
    assert!(matches!(outcome, FrameOutcome::Presented { recreated: false, .. }));
}

#[test]
fn minimized_window_skips_and_defers_recreation() {
    let mut h = Harness::new(2, 2);
    h.tick(&events(800, 600));
    let calls_before = h.backend.calls.len();

    let minimized = FrameEvents {
        framebuffer_size: (0, 0),
        resized: true,
        ..Default::default()
    };
    for _ in 0..3 {
        assert_eq!(h.tick(&minimized), FrameOutcome::Skipped(SkipReason::Minimized));
    }
    assert_eq!(h.backend.calls.len(), calls_before, "no GPU calls while minimized");
    assert_eq!(h.frame_loop.stats().frames_skipped, 3);

    // Restored: the pending resize is acted on
    let outcome = h.tick(&events(800, 600));
    assert!(matches!(outcome, FrameOutcome::Presented { recreated: true, .. }));
    assert_eq!(h.backend.count(|c| matches!(c, Call::Recreate(..))), 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Uniforms
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn uniforms_are_indexed_by_slot_not_image() {
    let mut h = Harness::new(3, 3);
    let images = [2, 0, 1, 1, 2];
    for &image_index in &images {
        h.backend.acquire_script.push_back(AcquireOutcome::Ready {
            image_index,
            suboptimal: false,
        });
    }

    for (frame, &image_index) in images.iter().enumerate() {
        let outcome = h.tick(&events(800, 600));
        let FrameOutcome::Presented { slot, image_index: presented, .. } = outcome else {
            panic!("frame {} was skipped", frame);
        };
        assert_eq!(slot, frame % 3);
        assert_eq!(presented, image_index);

        let ubo = h.backend.uniforms[slot].expect("slot uniforms written");
        assert_eq!(ubo.view, MockCamera::view_for(h.camera.updates));
        assert_eq!(ubo.model, Mat4::IDENTITY);
        assert_relative_eq!(
            ubo.proj.y_axis.y,
            -h.camera.projection_matrix().y_axis.y
        );
    }

    assert!(h.backend.calls.contains(&Call::Record(0, 2)));
    assert!(h.backend.calls.contains(&Call::Record(1, 0)));
}

#[test]
fn slot_fence_is_never_reset_while_in_flight() {
    // A single slot forces a wait on every frame after the first
    let mut h = Harness::new(1, 2);
    for _ in 0..4 {
        h.tick(&events(800, 600));
    }
    assert_eq!(h.backend.blocking_waits, 3);
}

// ─────────────────────────────────────────────────────────────────────────────
// Backpressure with a slow GPU on another thread
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct GpuState {
    signaled: Vec<bool>,
    submissions: usize,
    /// Slot the CPU is currently blocked on
    waiting_on: Option<usize>,
}

struct Gpu {
    state: Mutex<GpuState>,
    changed: Condvar,
}

impl Gpu {
    fn new(slots: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GpuState {
                signaled: vec![true; slots],
                ..Default::default()
            }),
            changed: Condvar::new(),
        })
    }

    fn complete(&self, slot: usize) {
        let mut state = self.state.lock();
        state.signaled[slot] = true;
        self.changed.notify_all();
    }
}

struct ThreadedBackend {
    gpu: Arc<Gpu>,
    slots: usize,
    next_image: u32,
}

impl FrameBackend for ThreadedBackend {
    fn slot_count(&self) -> usize {
        self.slots
    }

    fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
        let mut state = self.gpu.state.lock();
        while !state.signaled[slot] {
            state.waiting_on = Some(slot);
            self.gpu.changed.notify_all();
            self.gpu.changed.wait(&mut state);
        }
        state.waiting_on = None;
        Ok(())
    }

    fn acquire_image(&mut self, _slot: usize) -> Result<AcquireOutcome> {
        let image_index = self.next_image;
        self.next_image = (self.next_image + 1) % self.slots as u32;
        Ok(AcquireOutcome::Ready {
            image_index,
            suboptimal: false,
        })
    }

    fn reset_slot(&mut self, slot: usize) -> Result<()> {
        self.gpu.state.lock().signaled[slot] = false;
        Ok(())
    }

    fn record_scene(&mut self, _slot: usize, _image_index: u32) -> Result<()> {
        Ok(())
    }

    fn write_uniforms(&mut self, _slot: usize, _ubo: &UniformBufferObject) -> Result<()> {
        Ok(())
    }

    fn overlay_target(&self, _image_index: u32) -> Result<OverlayTarget> {
        Ok(OverlayTarget {
            render_pass: vk::RenderPass::null(),
            framebuffer: vk::Framebuffer::null(),
            extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            generation: 1,
        })
    }

    fn submit(&mut self, _slot: usize, _overlay: vk::CommandBuffer) -> Result<()> {
        let mut state = self.gpu.state.lock();
        state.submissions += 1;
        self.gpu.changed.notify_all();
        Ok(())
    }

    fn present(&mut self, _slot: usize, _image_index: u32) -> Result<PresentOutcome> {
        Ok(PresentOutcome::Presented)
    }

    fn recreate_swapchain(&mut self, _framebuffer_size: (u32, u32)) -> Result<()> {
        Ok(())
    }

    fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: 800,
            height: 600,
        }
    }
}

#[test]
fn cpu_blocks_at_submission_n_plus_one_until_gpu_completes() {
    const SLOTS: usize = 2;
    let gpu = Gpu::new(SLOTS);

    let render_gpu = gpu.clone();
    let render_thread = thread::spawn(move || {
        let mut backend = ThreadedBackend {
            gpu: render_gpu,
            slots: SLOTS,
            next_image: 0,
        };
        let mut camera = MockCamera::default();
        let mut overlay = MockOverlay::default();
        let mut frame_loop = FrameLoop::new(SLOTS);
        for _ in 0..=SLOTS {
            frame_loop
                .tick(&mut backend, &mut camera, &mut overlay, &events(800, 600))
                .expect("tick failed");
        }
        frame_loop.stats().frames_presented
    });

    {
        let mut state = gpu.state.lock();
        while state.waiting_on.is_none() {
            gpu.changed.wait(&mut state);
        }
        // N frames went out, frame N+1 is parked on slot 0's fence
        assert_eq!(state.submissions, SLOTS);
        assert_eq!(state.waiting_on, Some(0));
    }

    gpu.complete(0);
    let presented = render_thread.join().expect("render thread panicked");

    assert_eq!(presented, SLOTS as u64 + 1);
    assert_eq!(gpu.state.lock().submissions, SLOTS + 1);
}
