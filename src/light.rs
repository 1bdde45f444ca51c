use glam::{Mat4, Vec3};

use crate::config::{LightingConfig, PointLightConfig};

const FALLBACK_DIRECTION: Vec3 = Vec3::new(0.4, -0.8, 0.35);

/// Directional light; only the direction feeds the cascade solver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectionalLight {
    direction: Vec3,
    pub color: Vec3,
    pub specular_exponent: f32,
    pub specular_intensity: f32,
}

impl DirectionalLight {
    pub fn new(direction: Vec3) -> Self {
        let mut light = Self {
            direction: Vec3::NEG_Y,
            color: Vec3::ONE,
            specular_exponent: 250.0,
            specular_intensity: 0.25,
        };
        light.set_direction(direction);
        light
    }

    /// Direction from a light position toward a point it illuminates.
    pub fn looking_at(position: Vec3, target: Vec3) -> Self {
        Self::new(target - position)
    }

    pub fn from_config(cfg: &LightingConfig) -> Self {
        let mut light = Self::new(Vec3::from(cfg.direction));
        light.color = Vec3::from(cfg.color);
        light.specular_exponent = cfg.specular_exponent;
        light.specular_intensity = cfg.specular_intensity;
        light
    }

    pub fn direction(&self) -> Vec3 {
        self.direction
    }

    pub fn set_direction(&mut self, direction: Vec3) {
        let normalized = direction.normalize_or_zero();
        self.direction = if normalized.length_squared() < 1e-4 {
            log::warn!("[light] degenerate light direction {direction:?}; using fallback");
            FALLBACK_DIRECTION.normalize()
        } else {
            normalized
        };
    }
}

/// Hemispheric ambient term, authored in gamma space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AmbientLight {
    pub down: Vec3,
    pub up: Vec3,
}

impl AmbientLight {
    pub fn from_config(cfg: &LightingConfig) -> Self {
        Self { down: Vec3::from(cfg.ambient_down), up: Vec3::from(cfg.ambient_up) }
    }

    pub fn linear_down(&self) -> Vec3 {
        gamma_to_linear(self.down)
    }

    /// Linear `up - down`, added to `down` by the shader using the normal's vertical component.
    pub fn linear_range(&self) -> Vec3 {
        gamma_to_linear(self.up) - gamma_to_linear(self.down)
    }
}

/// Omni light shaded through a volume of `range` around `position`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointLight {
    pub position: Vec3,
    range: f32,
    /// Gamma-space color.
    pub color: Vec3,
}

impl PointLight {
    pub const MIN_RANGE: f32 = 1e-3;

    pub fn new(position: Vec3, range: f32, color: Vec3) -> Self {
        let mut light = Self { position, range: Self::MIN_RANGE, color };
        light.set_range(range);
        light
    }

    pub fn from_config(cfg: &PointLightConfig) -> Self {
        Self::new(Vec3::from(cfg.position), cfg.range, Vec3::from(cfg.color))
    }

    pub fn range(&self) -> f32 {
        self.range
    }

    pub fn set_range(&mut self, range: f32) {
        if range.is_nan() || range < Self::MIN_RANGE {
            log::warn!("[light] point light range {range} clamped to {}", Self::MIN_RANGE);
        }
        self.range = if range.is_finite() { range.max(Self::MIN_RANGE) } else { Self::MIN_RANGE };
    }

    pub fn linear_color(&self) -> Vec3 {
        gamma_to_linear(self.color)
    }

    /// Maps the unit box `[-1, 1]^3` onto the light volume in world space.
    pub fn volume_transform(&self) -> Mat4 {
        Mat4::from_translation(self.position) * Mat4::from_scale(Vec3::splat(self.range))
    }
}

pub fn point_lights_from_config(cfg: &LightingConfig) -> Vec<PointLight> {
    cfg.point_lights.iter().map(PointLight::from_config).collect()
}

pub fn gamma_to_linear(color: Vec3) -> Vec3 {
    color * color
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_is_normalized() {
        let light = DirectionalLight::looking_at(Vec3::new(-10.0, 30.0, -10.0), Vec3::ZERO);
        assert!((light.direction().length() - 1.0).abs() < 1e-5);
        assert!(light.direction().y < 0.0);
    }

    #[test]
    fn zero_direction_falls_back() {
        let light = DirectionalLight::new(Vec3::ZERO);
        assert!((light.direction().length() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn ambient_range_is_linear_difference() {
        let ambient = AmbientLight { down: Vec3::new(0.1, 0.5, 0.1), up: Vec3::new(0.1, 0.2, 0.5) };
        let range = ambient.linear_range();
        assert!((range.y - (0.04 - 0.25)).abs() < 1e-6);
        assert!((ambient.linear_down().y - 0.25).abs() < 1e-6);
    }

    #[test]
    fn point_light_volume_covers_its_range() {
        let light = PointLight::new(Vec3::new(0.0, 2.0, 4.0), 6.0, Vec3::new(1.0, 0.5, 0.0));
        let corner = light.volume_transform().transform_point3(Vec3::ONE);
        assert_eq!(corner, Vec3::new(6.0, 8.0, 10.0));
        assert_eq!(light.linear_color(), Vec3::new(1.0, 0.25, 0.0));
    }

    #[test]
    fn point_light_range_is_kept_positive() {
        let mut light = PointLight::new(Vec3::ZERO, 0.0, Vec3::ONE);
        assert_eq!(light.range(), PointLight::MIN_RANGE);
        light.set_range(f32::NAN);
        assert_eq!(light.range(), PointLight::MIN_RANGE);
        light.set_range(3.0);
        assert_eq!(light.range(), 3.0);
    }
}
