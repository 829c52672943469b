// Orbit camera driven by raw pointer state
//
// Middle drag pans, left drag orbits, right drag and the wheel zoom. The
// camera sits `distance` behind a focal point along its forward axis.

use ash::vk;
use glam::{EulerRot, Mat4, Quat, Vec2, Vec3};

use crate::config::CameraConfig;

const MOUSE_SENSITIVITY: f32 = 0.003;
const SCROLL_SENSITIVITY: f32 = 0.3;
const ROTATE_SPEED: f32 = 0.8;
const MIN_DISTANCE: f32 = 1.0;

/// Pointer snapshot for one tick
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PointerState {
    pub position: Vec2,
    pub left: bool,
    pub middle: bool,
    pub right: bool,
    /// Wheel movement since the previous tick, in lines
    pub scroll: f32,
}

pub trait CameraController {
    /// Consume this tick's pointer input.
    fn update(&mut self, pointer: &PointerState);
    fn view_matrix(&self) -> Mat4;
    /// Right-handed, depth zero-to-one, Y up (not yet flipped for Vulkan)
    fn projection_matrix(&self) -> Mat4;
    fn set_viewport(&mut self, extent: vk::Extent2D);
}

#[derive(Debug, Clone)]
pub struct OrbitCamera {
    fov_degrees: f32,
    near: f32,
    far: f32,
    viewport: Vec2,

    focal_point: Vec3,
    distance: f32,
    pitch: f32,
    yaw: f32,

    last_pointer: Option<Vec2>,
    view: Mat4,
    projection: Mat4,
}

impl OrbitCamera {
    pub fn new(config: &CameraConfig, extent: vk::Extent2D) -> Self {
        let mut camera = Self {
            fov_degrees: config.fov_degrees,
            near: config.near,
            far: config.far,
            viewport: Vec2::ONE,
            focal_point: Vec3::ZERO,
            distance: config.distance,
            pitch: 0.0,
            yaw: 0.0,
            last_pointer: None,
            view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
        };
        camera.set_viewport(extent);
        camera.update_view();
        camera
    }

    pub fn orientation(&self) -> Quat {
        Quat::from_euler(EulerRot::ZYX, 0.0, -self.yaw, -self.pitch)
    }

    pub fn forward(&self) -> Vec3 {
        self.orientation() * Vec3::NEG_Z
    }

    pub fn right(&self) -> Vec3 {
        self.orientation() * Vec3::X
    }

    pub fn up(&self) -> Vec3 {
        self.orientation() * Vec3::Y
    }

    pub fn position(&self) -> Vec3 {
        self.focal_point - self.forward() * self.distance
    }

    pub fn distance(&self) -> f32 {
        self.distance
    }

    pub fn focal_point(&self) -> Vec3 {
        self.focal_point
    }

    fn update_view(&mut self) {
        let transform = Mat4::from_translation(self.position()) * Mat4::from_quat(self.orientation());
        self.view = transform.inverse();
    }

    fn update_projection(&mut self) {
        let aspect = self.viewport.x / self.viewport.y;
        self.projection = Mat4::perspective_rh(self.fov_degrees.to_radians(), aspect, self.near, self.far);
    }

    /// Quadratic falloff so panning feels the same across window sizes
    fn pan_speed(&self) -> (f32, f32) {
        let factor = |extent: f32| {
            let x = (extent / 1000.0).min(2.4);
            0.00366 * x * x - 0.1778 * x + 0.3021
        };
        (factor(self.viewport.x), factor(self.viewport.y))
    }

    fn zoom_speed(&self) -> f32 {
        let distance = (self.distance * 0.2).max(0.0);
        (distance * distance).min(100.0)
    }

    fn pan(&mut self, delta: Vec2) {
        let (x_speed, y_speed) = self.pan_speed();
        self.focal_point += -self.right() * delta.x * x_speed * self.distance;
        self.focal_point += self.up() * delta.y * y_speed * self.distance;
    }

    fn rotate(&mut self, delta: Vec2) {
        let yaw_sign = if self.up().y < 0.0 { -1.0 } else { 1.0 };
        self.yaw += yaw_sign * delta.x * ROTATE_SPEED;
        self.pitch += delta.y * ROTATE_SPEED;
    }

    fn zoom(&mut self, delta: f32) {
        self.distance -= delta * self.zoom_speed();
        if self.distance < MIN_DISTANCE {
            self.focal_point += self.forward();
            self.distance = MIN_DISTANCE;
        }
    }
}

impl CameraController for OrbitCamera {
    fn update(&mut self, pointer: &PointerState) {
        let previous = self.last_pointer.replace(pointer.position);
        let delta = previous
            .map(|previous| (pointer.position - previous) * MOUSE_SENSITIVITY)
            .unwrap_or(Vec2::ZERO);

        if pointer.middle {
            self.pan(delta);
        } else if pointer.left {
            self.rotate(delta);
        } else if pointer.right {
            self.zoom(delta.y);
        }

        if pointer.scroll != 0.0 {
            self.zoom(pointer.scroll * SCROLL_SENSITIVITY);
        }

        self.update_view();
    }

    fn view_matrix(&self) -> Mat4 {
        self.view
    }

    fn projection_matrix(&self) -> Mat4 {
        self.projection
    }

    fn set_viewport(&mut self, extent: vk::Extent2D) {
        if extent.width == 0 || extent.height == 0 {
            return;
        }
        self.viewport = Vec2::new(extent.width as f32, extent.height as f32);
        self.update_projection();
    }
}
