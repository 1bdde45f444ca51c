//! Cascade fitting for directional shadow maps.
//!
//! The camera frustum is cut into [`CASCADE_COUNT`] depth slices. Every frame a single
//! light-aligned basis is built around the visible range, then each slice gets an
//! offset/scale that maps the shared shadow space onto its own layer of the shadow array.
//! Two fitting strategies are available: a stabilized one that keeps per-cascade bounds
//! across frames and moves them only in whole shadow-map texels, and a per-frame bounding
//! box fit of the slice corners.

use glam::{Mat4, Vec2, Vec3};

use crate::camera3d::ShadowCamera;
use crate::config::{CascadeFitMode, ShadowConfig};
use crate::light::DirectionalLight;

use super::RenderError;

/// Slots in the cascade uniform arrays.
pub const MAX_CASCADES: usize = 4;
/// Active cascades.
pub const CASCADE_COUNT: usize = 3;
/// Offset written to unused slots; together with the scale it pushes any shadow-space
/// coordinate far outside the unit square.
pub const INACTIVE_CASCADE_OFFSET: f32 = 250.0;
pub const INACTIVE_CASCADE_SCALE: f32 = 0.1;
/// Lower bound for every radius that ends up in a denominator.
pub const MIN_BOUND_RADIUS: f32 = 1e-4;

/// Running bounds of one stabilized cascade, in world space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CascadeBounds {
    pub center: Vec3,
    pub radius: f32,
}

impl Default for CascadeBounds {
    fn default() -> Self {
        Self { center: Vec3::ZERO, radius: 0.0 }
    }
}

impl CascadeBounds {
    /// World units covered by one shadow-map texel at the current radius.
    pub fn texel_world_size(&self, map_size: u32) -> f32 {
        2.0 * self.radius.max(MIN_BOUND_RADIUS) / map_size.max(1) as f32
    }
}

/// Light-aligned view plus the shared orthographic projection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShadowSpaceBasis {
    pub view: Mat4,
    pub view_inverse: Mat4,
    pub projection: Mat4,
    pub world_to_shadow: Mat4,
    /// Half extent of the shared projection.
    pub radius: f32,
}

impl ShadowSpaceBasis {
    /// Builds the basis centred half way along the shadowed range, looking along `light_dir`.
    pub fn new(eye: Vec3, light_dir: Vec3, radius: f32) -> Self {
        let mut up = Vec3::Y;
        if up.dot(light_dir).abs() > 0.95 {
            up = Vec3::X;
        }
        let view = Mat4::look_to_rh(eye, light_dir, up);
        let r = radius.max(MIN_BOUND_RADIUS);
        // Half width r, so the volume spans 2r: the cascade scale `r / radius` and the
        // texel size `2 * radius / map_size` both assume this convention.
        let projection = Mat4::orthographic_rh(-r, r, -r, r, -r, r);
        Self { view, view_inverse: view.inverse(), projection, world_to_shadow: projection * view, radius: r }
    }
}

/// Mapping from shared shadow space into one cascade.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CascadeTransform {
    pub offset: Vec2,
    pub scale: f32,
    pub world_to_cascade: Mat4,
}

impl CascadeTransform {
    pub fn compose(offset: Vec2, scale: f32, basis: &ShadowSpaceBasis) -> Self {
        let world_to_cascade = Mat4::from_scale(Vec3::new(scale, scale, 1.0))
            * Mat4::from_translation(offset.extend(0.0))
            * basis.world_to_shadow;
        Self { offset, scale, world_to_cascade }
    }

    /// World-space half width of the square this cascade covers.
    pub fn world_half_extent(&self, basis: &ShadowSpaceBasis) -> f32 {
        basis.radius / self.scale.max(f32::EPSILON)
    }
}

/// Everything the shadow and lighting passes need for one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CascadeFrame {
    pub basis: ShadowSpaceBasis,
    pub cascades: [CascadeTransform; CASCADE_COUNT],
    pub offset_x: [f32; MAX_CASCADES],
    pub offset_y: [f32; MAX_CASCADES],
    pub scale: [f32; MAX_CASCADES],
}

impl CascadeFrame {
    fn new(basis: ShadowSpaceBasis, cascades: [CascadeTransform; CASCADE_COUNT]) -> Self {
        let mut offset_x = [INACTIVE_CASCADE_OFFSET; MAX_CASCADES];
        let mut offset_y = [INACTIVE_CASCADE_OFFSET; MAX_CASCADES];
        let mut scale = [INACTIVE_CASCADE_SCALE; MAX_CASCADES];
        for (idx, cascade) in cascades.iter().enumerate() {
            offset_x[idx] = cascade.offset.x;
            offset_y[idx] = cascade.offset.y;
            scale[idx] = cascade.scale;
        }
        Self { basis, cascades, offset_x, offset_y, scale }
    }

    pub fn world_to_cascade(&self) -> [Mat4; CASCADE_COUNT] {
        self.cascades.map(|cascade| cascade.world_to_cascade)
    }

    /// Maps a point already in shared shadow space into cascade `slot`.
    pub fn to_cascade_space(&self, slot: usize, shadow_space: Vec2) -> Vec2 {
        let offset = Vec2::new(self.offset_x[slot], self.offset_y[slot]);
        (shadow_space + offset) * self.scale[slot]
    }
}

/// Tests whether a cascade centre moved far enough to be re-snapped.
///
/// Returns the shadow-view-space offset to apply, quantized to whole texels in x/y, or
/// `None` when the move is at most half a texel on both axes.
pub fn cascade_needs_update(
    shadow_view: &Mat4,
    stored: &CascadeBounds,
    new_center: Vec3,
    map_size: u32,
) -> Option<Vec3> {
    let old_in_view = shadow_view.transform_point3(stored.center);
    let new_in_view = shadow_view.transform_point3(new_center);
    let diff = new_in_view - old_in_view;

    let pixel_size = map_size as f32 / (2.0 * stored.radius.max(MIN_BOUND_RADIUS));
    let pixel_off_x = diff.x * pixel_size;
    let pixel_off_y = diff.y * pixel_size;
    if pixel_off_x.abs() <= 0.5 && pixel_off_y.abs() <= 0.5 {
        return None;
    }
    Some(Vec3::new((0.5 + pixel_off_x).floor() / pixel_size, (0.5 + pixel_off_y).floor() / pixel_size, diff.z))
}

/// Chooses the offset and scale of one cascade inside the shared shadow space.
pub trait CascadeFittingStrategy: std::fmt::Debug {
    fn mode(&self) -> CascadeFitMode;

    fn fit(
        &mut self,
        index: usize,
        camera: &dyn ShadowCamera,
        range: (f32, f32),
        basis: &ShadowSpaceBasis,
    ) -> CascadeTransform;

    /// Drops any history so the next fit starts cold.
    fn reset(&mut self);

    /// Persistent bounds, for strategies that keep them.
    fn bounds(&self, _index: usize) -> Option<CascadeBounds> {
        None
    }
}

/// Anti-flicker fit: bounds persist and only move in whole texels.
#[derive(Debug, Clone)]
pub struct StabilizedFit {
    map_size: u32,
    bounds: [CascadeBounds; CASCADE_COUNT],
}

impl StabilizedFit {
    pub fn new(map_size: u32) -> Self {
        Self { map_size, bounds: [CascadeBounds::default(); CASCADE_COUNT] }
    }

    pub fn map_size(&self) -> u32 {
        self.map_size
    }

    /// `max(running, fresh) / 2`, the damping applied to every running radius.
    pub fn blend_radius(running: f32, fresh: f32) -> f32 {
        running.max(fresh) / 2.0
    }

    /// Folds a freshly measured sphere into cascade `index` and returns the stored bounds.
    pub fn track(
        &mut self,
        index: usize,
        shadow_view: &Mat4,
        view_inverse: &Mat4,
        fresh: CascadeBounds,
    ) -> CascadeBounds {
        let map_size = self.map_size;
        let bounds = &mut self.bounds[index];
        bounds.radius = Self::blend_radius(bounds.radius, fresh.radius);
        if let Some(offset) = cascade_needs_update(shadow_view, bounds, fresh.center, map_size) {
            bounds.center += view_inverse.transform_vector3(offset);
            log::debug!(
                "[shadow] cascade {index} snapped by ({:.4}, {:.4}) to {:?}",
                offset.x,
                offset.y,
                bounds.center
            );
        }
        *bounds
    }
}

impl CascadeFittingStrategy for StabilizedFit {
    fn mode(&self) -> CascadeFitMode {
        CascadeFitMode::Stabilized
    }

    fn fit(
        &mut self,
        index: usize,
        camera: &dyn ShadowCamera,
        range: (f32, f32),
        basis: &ShadowSpaceBasis,
    ) -> CascadeTransform {
        let sphere = camera.bounding_sphere(range.0, range.1);
        let fresh = CascadeBounds { center: sphere.center, radius: sphere.radius };
        let bounds = self.track(index, &basis.view, &basis.view_inverse, fresh);
        let center = basis.world_to_shadow.transform_point3(bounds.center);
        let scale = basis.radius / bounds.radius.max(MIN_BOUND_RADIUS);
        CascadeTransform::compose(Vec2::new(-center.x, -center.y), scale, basis)
    }

    fn reset(&mut self) {
        self.bounds = [CascadeBounds::default(); CASCADE_COUNT];
    }

    fn bounds(&self, index: usize) -> Option<CascadeBounds> {
        self.bounds.get(index).copied()
    }
}

/// Per-frame fit of the slice corners' shadow-space bounding box; shimmers under motion.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrustumBoundsFit;

impl CascadeFittingStrategy for FrustumBoundsFit {
    fn mode(&self) -> CascadeFitMode {
        CascadeFitMode::FrustumBounds
    }

    fn fit(
        &mut self,
        _index: usize,
        camera: &dyn ShadowCamera,
        range: (f32, f32),
        basis: &ShadowSpaceBasis,
    ) -> CascadeTransform {
        let mut min = Vec3::splat(f32::MAX);
        let mut max = Vec3::splat(f32::MIN);
        for corner in camera.frustum_corners(range.0, range.1) {
            let shadow_space = basis.world_to_shadow.transform_point3(corner);
            min = min.min(shadow_space);
            max = max.max(shadow_space);
        }
        let center = (min + max) * 0.5;
        let extent = (max.x - min.x).max(max.y - min.y).max(MIN_BOUND_RADIUS);
        CascadeTransform::compose(Vec2::new(-center.x, -center.y), 2.0 / extent, basis)
    }

    fn reset(&mut self) {}
}

fn strategy_for(mode: CascadeFitMode, map_size: u32) -> Box<dyn CascadeFittingStrategy> {
    match mode {
        CascadeFitMode::Stabilized => Box::new(StabilizedFit::new(map_size)),
        CascadeFitMode::FrustumBounds => Box::new(FrustumBoundsFit),
    }
}

/// Per-frame cascade computation with the state that must persist between frames.
#[derive(Debug)]
pub struct CascadeSolver {
    map_size: u32,
    splits: [f32; CASCADE_COUNT],
    shared_radius: f32,
    strategy: Box<dyn CascadeFittingStrategy>,
}

impl CascadeSolver {
    pub fn new(config: &ShadowConfig) -> Result<Self, RenderError> {
        config.validate()?;
        Ok(Self {
            map_size: config.map_size,
            splits: config.splits,
            shared_radius: 0.0,
            strategy: strategy_for(config.fit_mode, config.map_size),
        })
    }

    pub fn with_strategy(
        config: &ShadowConfig,
        strategy: Box<dyn CascadeFittingStrategy>,
    ) -> Result<Self, RenderError> {
        let mut solver = Self::new(config)?;
        solver.strategy = strategy;
        Ok(solver)
    }

    pub fn map_size(&self) -> u32 {
        self.map_size
    }

    pub fn splits(&self) -> [f32; CASCADE_COUNT] {
        self.splits
    }

    pub fn fit_mode(&self) -> CascadeFitMode {
        self.strategy.mode()
    }

    /// Swaps the fitting strategy; any stabilization history is discarded.
    pub fn set_fit_mode(&mut self, mode: CascadeFitMode) {
        if mode != self.strategy.mode() {
            log::info!("[shadow] cascade fit mode -> {}", mode.label());
            self.strategy = strategy_for(mode, self.map_size);
            self.shared_radius = 0.0;
        }
    }

    pub fn reset(&mut self) {
        self.strategy.reset();
        self.shared_radius = 0.0;
    }

    pub fn shared_radius(&self) -> f32 {
        self.shared_radius
    }

    pub fn cascade_bounds(&self, index: usize) -> Option<CascadeBounds> {
        self.strategy.bounds(index)
    }

    /// View-depth ranges `[near, z0]`, `[z0, z1]`, `[z1, z2]`.
    pub fn cascade_ranges(&self, near: f32) -> [(f32, f32); CASCADE_COUNT] {
        let [z0, z1, z2] = self.splits;
        [(near, z0), (z0, z1), (z1, z2)]
    }

    pub fn update(&mut self, camera: &dyn ShadowCamera, light: &DirectionalLight) -> CascadeFrame {
        let far_split = self.splits[CASCADE_COUNT - 1];
        let eye = camera.eye_position() + camera.view_direction() * far_split * 0.5;

        let sphere = camera.bounding_sphere(camera.near_plane(), far_split);
        self.shared_radius = StabilizedFit::blend_radius(self.shared_radius, sphere.radius);
        let basis = ShadowSpaceBasis::new(eye, light.direction(), self.shared_radius);

        let ranges = self.cascade_ranges(camera.near_plane());
        let cascades: [CascadeTransform; CASCADE_COUNT] =
            std::array::from_fn(|idx| self.strategy.fit(idx, camera, ranges[idx], &basis));
        CascadeFrame::new(basis, cascades)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera3d::Camera3D;

    fn config(mode: CascadeFitMode) -> ShadowConfig {
        ShadowConfig { map_size: 1024, splits: [5.0, 15.0, 50.0], fit_mode: mode }
    }

    fn forward_camera(position: Vec3) -> Camera3D {
        Camera3D::new(position, position + Vec3::NEG_Z, std::f32::consts::FRAC_PI_4, 0.1, 1000.0)
            .with_viewport(1280, 1024)
    }

    #[test]
    fn sub_half_texel_motion_is_ignored() {
        let view = Mat4::IDENTITY;
        let stored = CascadeBounds { center: Vec3::new(1.0, 2.0, 3.0), radius: 8.0 };
        let texel = stored.texel_world_size(1024);
        let nudged = stored.center + Vec3::new(texel * 0.49, -texel * 0.3, 5.0);
        assert_eq!(cascade_needs_update(&view, &stored, nudged, 1024), None);
    }

    #[test]
    fn offsets_snap_to_whole_texels() {
        let view = Mat4::IDENTITY;
        let stored = CascadeBounds { center: Vec3::ZERO, radius: 8.0 };
        let texel = stored.texel_world_size(1024);
        for k in [1, 3, -2, 17] {
            let moved = Vec3::new(texel * k as f32 + texel * 0.2, texel * 0.1, 0.0);
            let offset = cascade_needs_update(&view, &stored, moved, 1024).expect("update required");
            assert!((offset.x - texel * k as f32).abs() < 1e-5, "k={k} offset={offset:?}");
            assert_eq!(offset.y, 0.0);
        }
    }

    #[test]
    fn shared_volume_is_half_width_radius() {
        let basis = ShadowSpaceBasis::new(Vec3::ZERO, Vec3::NEG_Z, 8.0);
        let edge = basis.projection.transform_point3(Vec3::new(8.0, -8.0, 0.0));
        assert!((edge.x - 1.0).abs() < 1e-6 && (edge.y + 1.0).abs() < 1e-6, "{edge:?}");
        let stored = CascadeBounds { center: Vec3::ZERO, radius: basis.radius };
        assert_eq!(stored.texel_world_size(1024) * 1024.0, 2.0 * basis.radius);
    }

    #[test]
    fn zero_radius_does_not_divide_by_zero() {
        let stored = CascadeBounds::default();
        let offset = cascade_needs_update(&Mat4::IDENTITY, &stored, Vec3::new(1.0, 0.0, 0.0), 1024)
            .expect("large move needs an update");
        assert!(offset.is_finite());
    }

    #[test]
    fn running_radius_follows_halving_rule() {
        let fresh = [10.0, 4.0, 30.0, 30.0, 2.0];
        let expected = [5.0, 2.5, 15.0, 15.0, 7.5];
        let mut fit = StabilizedFit::new(1024);
        for (input, want) in fresh.iter().zip(expected) {
            let fresh = CascadeBounds { center: Vec3::ZERO, radius: *input };
            let bounds = fit.track(0, &Mat4::IDENTITY, &Mat4::IDENTITY, fresh);
            assert_eq!(bounds.radius, want);
        }
    }

    #[test]
    fn inactive_slots_fall_outside_unit_square() {
        let mut solver = CascadeSolver::new(&config(CascadeFitMode::Stabilized)).expect("solver");
        let camera = forward_camera(Vec3::ZERO);
        let frame = solver.update(&camera, &DirectionalLight::new(Vec3::NEG_Y));
        for slot in CASCADE_COUNT..MAX_CASCADES {
            for uv in [Vec2::splat(-1.0), Vec2::splat(1.0), Vec2::new(-1.0, 1.0), Vec2::ZERO] {
                let mapped = frame.to_cascade_space(slot, uv);
                assert!(mapped.x.abs() > 1.0 && mapped.y.abs() > 1.0, "{mapped:?}");
            }
        }
    }

    #[test]
    fn straight_down_light_builds_finite_basis() {
        let basis = ShadowSpaceBasis::new(Vec3::new(0.0, 0.0, -25.0), Vec3::NEG_Y, 10.0);
        assert!(basis.world_to_shadow.is_finite());
        assert!(basis.view_inverse.is_finite());
    }

    #[test]
    fn cascade_footprint_grows_with_split_index() {
        for mode in [CascadeFitMode::Stabilized, CascadeFitMode::FrustumBounds] {
            let mut solver = CascadeSolver::new(&config(mode)).expect("solver");
            let frame = solver.update(&forward_camera(Vec3::ZERO), &DirectionalLight::new(Vec3::NEG_Y));
            let extents: Vec<f32> =
                frame.cascades.iter().map(|cascade| cascade.world_half_extent(&frame.basis)).collect();
            assert!(extents[0] < extents[1] && extents[1] < extents[2], "{mode:?}: {extents:?}");
            let matrices = frame.world_to_cascade();
            assert_ne!(matrices[0], matrices[1]);
            assert_ne!(matrices[1], matrices[2]);
        }
    }

    #[test]
    fn switching_mode_resets_history() {
        let mut solver = CascadeSolver::new(&config(CascadeFitMode::Stabilized)).expect("solver");
        solver.update(&forward_camera(Vec3::ZERO), &DirectionalLight::new(Vec3::NEG_Y));
        assert!(solver.cascade_bounds(0).expect("bounds").radius > 0.0);
        solver.set_fit_mode(CascadeFitMode::FrustumBounds);
        assert_eq!(solver.cascade_bounds(0), None);
        assert_eq!(solver.shared_radius(), 0.0);
        solver.set_fit_mode(CascadeFitMode::Stabilized);
        assert_eq!(solver.cascade_bounds(0), Some(CascadeBounds::default()));
    }
}
