// =============================================================================
// MESH VIEWER - window and event loop
// =============================================================================
//
// The binary only wires winit to the library:
//
//   winit events ──> FrameEvents (size, resize flag, pointer)
//                         │
//   RedrawRequested ──> FrameLoop::tick(renderer, camera, overlay, events)
//
// Controls: left drag orbits, middle drag pans, right drag or wheel zooms,
// F1 toggles the overlay, F11 toggles fullscreen, Escape quits.
// =============================================================================

use anyhow::{Context, Result};
use glam::Vec2;
use mesh_viewer::backend::shader::ShaderModule;
use mesh_viewer::{
    Config, FrameBackend, FrameEvents, FrameLoop, FrameOutcome, HudOverlay, OrbitCamera,
    VulkanRenderer,
};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::{ElementState, MouseButton, MouseScrollDelta, WindowEvent},
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

/// Pixels of touchpad scroll treated as one wheel line
const PIXELS_PER_LINE: f32 = 40.0;

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::load();
    log::info!("Starting mesh viewer");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    match app.fatal.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Everything that exists once the window does. Field order is drop order:
/// the overlay's command pool goes before the renderer tears the device down.
struct Viewer {
    overlay: HudOverlay,
    camera: OrbitCamera,
    frame_loop: FrameLoop,
    renderer: VulkanRenderer,
}

impl Viewer {
    fn new(config: &Config, window: &Window) -> Result<Self> {
        let size = window.inner_size();
        let framebuffer_size = if size.width == 0 || size.height == 0 {
            (config.window.width, config.window.height)
        } else {
            (size.width, size.height)
        };

        let renderer = VulkanRenderer::new(
            config,
            window.raw_display_handle(),
            window.raw_window_handle(),
            framebuffer_size,
        )?;

        let assets = &config.assets;
        let overlay = HudOverlay::new(
            renderer.device(),
            renderer.slot_count(),
            ShaderModule::load(renderer.device(), &assets.resolve(&assets.overlay_vertex_shader)?)?,
            ShaderModule::load(renderer.device(), &assets.resolve(&assets.overlay_fragment_shader)?)?,
            config.graphics.show_overlay,
        )
        .context("Failed to create overlay")?;

        let camera = OrbitCamera::new(&config.camera, renderer.extent());
        let frame_loop = FrameLoop::new(renderer.slot_count());

        Ok(Self {
            overlay,
            camera,
            frame_loop,
            renderer,
        })
    }
}

struct App {
    config: Config,
    window: Option<Arc<Window>>,
    viewer: Option<Viewer>,
    is_fullscreen: bool,

    /// Input accumulated since the last tick
    events: FrameEvents,

    /// First fatal error; returned from main after the loop exits
    fatal: Option<anyhow::Error>,

    frame_count: u32,
    last_fps_update: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        Self {
            config,
            window: None,
            viewer: None,
            is_fullscreen,
            events: FrameEvents::default(),
            fatal: None,
            frame_count: 0,
            last_fps_update: Instant::now(),
        }
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("Fatal: {:?}", error);
        if self.fatal.is_none() {
            self.fatal = Some(error);
        }
        event_loop.exit();
    }

    // =========================================================================
    // RENDER
    // =========================================================================

    fn render_frame(&mut self) -> Result<()> {
        let (Some(window), Some(viewer)) = (self.window.as_ref(), self.viewer.as_mut()) else {
            return Ok(());
        };

        let size = window.inner_size();
        self.events.framebuffer_size = (size.width, size.height);

        let outcome = viewer.frame_loop.tick(
            &mut viewer.renderer,
            &mut viewer.camera,
            &mut viewer.overlay,
            &self.events,
        )?;

        self.events.resized = false;
        self.events.pointer.scroll = 0.0;

        if let FrameOutcome::Presented { .. } = outcome {
            self.update_fps();
        }
        Ok(())
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        let Some(window) = self.window.as_ref() else {
            return;
        };
        self.is_fullscreen = !self.is_fullscreen;
        if self.is_fullscreen {
            window.set_fullscreen(Some(Fullscreen::Borderless(None)));
            log::info!("Entered fullscreen mode");
        } else {
            window.set_fullscreen(None);
            log::info!("Exited fullscreen mode");
        }
        self.events.resized = true;
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }
        self.frame_count += 1;

        let now = Instant::now();
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed < 1.0 {
            return;
        }

        if let (Some(window), Some(viewer)) = (self.window.as_ref(), self.viewer.as_ref()) {
            let fps = self.frame_count as f32 / elapsed;
            let frame_time = viewer.frame_loop.stats().last_frame_time.as_secs_f32();
            window.set_title(&format!(
                "{} - {:.0} FPS ({:.2}ms)",
                self.config.window.title,
                fps,
                frame_time * 1000.0
            ));
        }

        self.frame_count = 0;
        self.last_fps_update = now;
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));
        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                self.fail(event_loop, anyhow::anyhow!("Failed to create window: {}", e));
                return;
            }
        };

        match Viewer::new(&self.config, &window) {
            Ok(viewer) => self.viewer = Some(viewer),
            Err(e) => {
                self.fail(event_loop, e.context("Failed to initialize renderer"));
                return;
            }
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                self.events.resized = true;
            }

            WindowEvent::RedrawRequested => {
                if let Err(e) = self.render_frame() {
                    self.fail(event_loop, e);
                }
            }

            // ─────────────────────────────────────────────────────────────────
            // POINTER
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::CursorMoved { position, .. } => {
                self.events.pointer.position = Vec2::new(position.x as f32, position.y as f32);
            }

            WindowEvent::MouseInput { state, button, .. } => {
                let pressed = state == ElementState::Pressed;
                let pointer = &mut self.events.pointer;
                match button {
                    MouseButton::Left => pointer.left = pressed,
                    MouseButton::Middle => pointer.middle = pressed,
                    MouseButton::Right => pointer.right = pressed,
                    _ => {}
                }
            }

            WindowEvent::MouseWheel { delta, .. } => {
                self.events.pointer.scroll += match delta {
                    MouseScrollDelta::LineDelta(_, y) => y,
                    MouseScrollDelta::PixelDelta(position) => position.y as f32 / PIXELS_PER_LINE,
                };
            }

            // ─────────────────────────────────────────────────────────────────
            // KEYBOARD
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if !event.state.is_pressed() || event.repeat {
                    return;
                }
                if let PhysicalKey::Code(key) = event.physical_key {
                    match key {
                        KeyCode::Escape => {
                            log::info!("ESC pressed, exiting...");
                            event_loop.exit();
                        }
                        KeyCode::F11 => self.toggle_fullscreen(),
                        KeyCode::F1 => {
                            if let Some(viewer) = self.viewer.as_mut() {
                                viewer.overlay.toggle_visible();
                            }
                        }
                        _ => {}
                    }
                }
            }

            _ => {}
        }
    }

    /// Keep redrawing continuously
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

// =============================================================================
// CLEANUP
// =============================================================================

impl Drop for App {
    fn drop(&mut self) {
        if let Some(viewer) = self.viewer.as_ref() {
            if let Err(e) = viewer.renderer.wait_idle() {
                log::error!("wait_idle failed during shutdown: {:#}", e);
            }
        }
        // Viewer before window: the surface must go before the window it targets
        self.viewer = None;
        self.window = None;
        log::info!("Cleanup complete");
    }
}
