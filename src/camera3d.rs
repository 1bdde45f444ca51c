use glam::{Mat4, Quat, Vec2, Vec3};

use crate::config::CameraConfig;

const DEFAULT_UP: Vec3 = Vec3::Y;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingSphere {
    pub center: Vec3,
    pub radius: f32,
}

impl BoundingSphere {
    /// Smallest sphere centered on the point average that contains every point.
    pub fn from_points(points: &[Vec3]) -> Self {
        if points.is_empty() {
            return Self { center: Vec3::ZERO, radius: 0.0 };
        }
        let center = points.iter().copied().sum::<Vec3>() / points.len() as f32;
        let radius = points.iter().map(|p| p.distance(center)).fold(0.0f32, f32::max);
        Self { center, radius }
    }

    pub fn contains(&self, point: Vec3, tolerance: f32) -> bool {
        point.distance(self.center) <= self.radius + tolerance
    }
}

/// Read-only camera queries consumed by the shadow and G-buffer passes.
///
/// Depth ranges are view-space distances along the view direction.
pub trait ShadowCamera {
    fn eye_position(&self) -> Vec3;
    fn view_direction(&self) -> Vec3;
    fn near_plane(&self) -> f32;
    fn frustum_corners(&self, range_start: f32, range_end: f32) -> [Vec3; 8];
    fn view_matrix(&self) -> Mat4;
    fn projection_matrix(&self) -> Mat4;

    fn bounding_sphere(&self, range_start: f32, range_end: f32) -> BoundingSphere {
        BoundingSphere::from_points(&self.frustum_corners(range_start, range_end))
    }

    fn view_projection(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }
}

/// Simple perspective camera.
#[derive(Debug, Clone)]
pub struct Camera3D {
    pub position: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    pub fov_y_radians: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl Camera3D {
    pub fn new(position: Vec3, target: Vec3, fov_y_radians: f32, near: f32, far: f32) -> Self {
        Self { position, target, up: DEFAULT_UP, fov_y_radians, aspect: 1.0, near, far }
    }

    pub fn from_config(cfg: &CameraConfig) -> Self {
        Self::new(
            Vec3::from_array(cfg.position),
            Vec3::from_array(cfg.target),
            cfg.fov_degrees.to_radians(),
            cfg.near,
            cfg.far,
        )
    }

    pub fn with_viewport(mut self, width: u32, height: u32) -> Self {
        self.set_viewport(width, height);
        self
    }

    pub fn set_viewport(&mut self, width: u32, height: u32) {
        self.aspect = if height > 0 { width as f32 / height as f32 } else { 1.0 };
    }

    pub fn direction(&self) -> Vec3 {
        (self.target - self.position).normalize_or_zero()
    }

    fn basis(&self) -> (Vec3, Vec3, Vec3) {
        let forward = self.direction();
        let mut right = forward.cross(self.up);
        if right.length_squared() < 1e-8 {
            right = forward.cross(Vec3::Z);
        }
        let right = right.normalize();
        let up = right.cross(forward);
        (forward, right, up)
    }
}

impl ShadowCamera for Camera3D {
    fn eye_position(&self) -> Vec3 {
        self.position
    }

    fn view_direction(&self) -> Vec3 {
        self.direction()
    }

    fn near_plane(&self) -> f32 {
        self.near
    }

    /// Near-plane corners first (bl, br, tl, tr), then far-plane corners in the same order.
    fn frustum_corners(&self, range_start: f32, range_end: f32) -> [Vec3; 8] {
        let (forward, right, up) = self.basis();
        let tan_half = (self.fov_y_radians * 0.5).tan();
        let aspect = self.aspect.max(0.0001);
        let mut corners = [Vec3::ZERO; 8];
        for (plane, &distance) in [range_start, range_end].iter().enumerate() {
            let center = self.position + forward * distance;
            let half_h = distance * tan_half;
            let half_w = half_h * aspect;
            let base = plane * 4;
            corners[base] = center - right * half_w - up * half_h;
            corners[base + 1] = center + right * half_w - up * half_h;
            corners[base + 2] = center - right * half_w + up * half_h;
            corners[base + 3] = center + right * half_w + up * half_h;
        }
        corners
    }

    fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.target, self.up)
    }

    fn projection_matrix(&self) -> Mat4 {
        Mat4::perspective_rh(self.fov_y_radians, self.aspect.max(0.0001), self.near, self.far)
    }
}

/// Orbit-style controller storing yaw/pitch around a target.
#[derive(Debug, Clone)]
pub struct OrbitCamera {
    pub target: Vec3,
    pub radius: f32,
    pub yaw_radians: f32,
    pub pitch_radians: f32,
}

impl OrbitCamera {
    pub fn new(target: Vec3, radius: f32) -> Self {
        Self { target, radius: radius.max(0.01), yaw_radians: 0.0, pitch_radians: 0.0 }
    }

    /// Builds an orbit that reproduces `camera`'s current eye position.
    pub fn from_camera(camera: &Camera3D) -> Self {
        let offset = camera.position - camera.target;
        let radius = offset.length().max(0.01);
        let pitch_radians = (-offset.y / radius).clamp(-1.0, 1.0).asin();
        let yaw_radians = offset.x.atan2(offset.z);
        Self { target: camera.target, radius, yaw_radians, pitch_radians }
    }

    pub fn to_camera(&self, fov_y_radians: f32, near: f32, far: f32) -> Camera3D {
        let rotation = Quat::from_euler(glam::EulerRot::YXZ, self.yaw_radians, self.pitch_radians, 0.0);
        let offset = rotation * Vec3::new(0.0, 0.0, self.radius);
        let position = self.target + offset;
        Camera3D::new(position, self.target, fov_y_radians, near, far)
    }

    pub fn orbit(&mut self, delta: Vec2) {
        self.yaw_radians += delta.x;
        self.pitch_radians = (self.pitch_radians + delta.y)
            .clamp(-std::f32::consts::FRAC_PI_2 + 0.01, std::f32::consts::FRAC_PI_2 - 0.01);
    }

    pub fn zoom(&mut self, factor: f32) {
        self.radius = (self.radius * factor).clamp(0.1, 10_000.0);
    }
}
