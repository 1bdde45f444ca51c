use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::renderer::RenderError;

#[derive(Debug, Clone, Deserialize)]
pub struct ViewportConfig {
    #[serde(default = "ViewportConfig::default_width")]
    pub width: u32,
    #[serde(default = "ViewportConfig::default_height")]
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CascadeFitMode {
    /// Persistent bounding spheres moved in whole texels.
    #[default]
    Stabilized,
    /// Per-frame bounds of the slice corners.
    FrustumBounds,
}

impl CascadeFitMode {
    pub fn label(self) -> &'static str {
        match self {
            CascadeFitMode::Stabilized => "Stabilized (anti-flicker)",
            CascadeFitMode::FrustumBounds => "Frustum bounds",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShadowConfig {
    #[serde(default = "ShadowConfig::default_map_size")]
    pub map_size: u32,
    #[serde(default = "ShadowConfig::default_splits")]
    pub splits: [f32; 3],
    #[serde(default)]
    pub fit_mode: CascadeFitMode,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LightingConfig {
    #[serde(default = "LightingConfig::default_direction")]
    pub direction: [f32; 3],
    #[serde(default = "LightingConfig::default_color")]
    pub color: [f32; 3],
    #[serde(default = "LightingConfig::default_ambient_down")]
    pub ambient_down: [f32; 3],
    #[serde(default = "LightingConfig::default_ambient_up")]
    pub ambient_up: [f32; 3],
    #[serde(default = "LightingConfig::default_specular_exponent")]
    pub specular_exponent: f32,
    #[serde(default = "LightingConfig::default_specular_intensity")]
    pub specular_intensity: f32,
    #[serde(default = "LightingConfig::default_point_lights")]
    pub point_lights: Vec<PointLightConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PointLightConfig {
    pub position: [f32; 3],
    #[serde(default = "PointLightConfig::default_range")]
    pub range: f32,
    #[serde(default = "PointLightConfig::default_color")]
    pub color: [f32; 3],
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    #[serde(default = "CameraConfig::default_position")]
    pub position: [f32; 3],
    #[serde(default)]
    pub target: [f32; 3],
    #[serde(default = "CameraConfig::default_fov_degrees")]
    pub fov_degrees: f32,
    #[serde(default = "CameraConfig::default_near")]
    pub near: f32,
    #[serde(default = "CameraConfig::default_far")]
    pub far: f32,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RenderConfig {
    #[serde(default)]
    pub viewport: ViewportConfig,
    #[serde(default)]
    pub shadow: ShadowConfig,
    #[serde(default)]
    pub lighting: LightingConfig,
    #[serde(default)]
    pub camera: CameraConfig,
}

#[derive(Debug, Clone, Default)]
pub struct RenderConfigOverrides {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub shadow_map_size: Option<u32>,
    pub fit_mode: Option<CascadeFitMode>,
}

impl ViewportConfig {
    const fn default_width() -> u32 {
        1280
    }

    const fn default_height() -> u32 {
        1024
    }
}

impl Default for ViewportConfig {
    fn default() -> Self {
        Self { width: Self::default_width(), height: Self::default_height() }
    }
}

impl ShadowConfig {
    pub const MAX_MAP_SIZE: u32 = 8192;

    const fn default_map_size() -> u32 {
        1024
    }

    const fn default_splits() -> [f32; 3] {
        [5.0, 15.0, 50.0]
    }

    pub fn validate(&self) -> Result<(), RenderError> {
        if self.map_size == 0 || self.map_size > Self::MAX_MAP_SIZE {
            return Err(RenderError::InvalidConfig(format!(
                "shadow map size {} outside 1..={}",
                self.map_size,
                Self::MAX_MAP_SIZE
            )));
        }
        let [z0, z1, z2] = self.splits;
        if !(z0 > 0.0 && z0 < z1 && z1 < z2) || !z2.is_finite() {
            return Err(RenderError::InvalidConfig(format!(
                "cascade splits must be positive and strictly increasing, got [{z0}, {z1}, {z2}]"
            )));
        }
        if !self.map_size.is_power_of_two() {
            log::warn!("[config] shadow map size {} is not a power of two", self.map_size);
        }
        Ok(())
    }
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            map_size: Self::default_map_size(),
            splits: Self::default_splits(),
            fit_mode: CascadeFitMode::default(),
        }
    }
}

impl LightingConfig {
    fn default_direction() -> [f32; 3] {
        let from = glam::Vec3::new(-10.0, 30.0, -10.0);
        (glam::Vec3::ZERO - from).normalize().to_array()
    }

    const fn default_color() -> [f32; 3] {
        [0.9, 0.9, 0.9]
    }

    const fn default_ambient_down() -> [f32; 3] {
        [0.1, 0.5, 0.1]
    }

    const fn default_ambient_up() -> [f32; 3] {
        [0.1, 0.2, 0.5]
    }

    const fn default_specular_exponent() -> f32 {
        250.0
    }

    const fn default_specular_intensity() -> f32 {
        0.25
    }

    /// White, red, green and blue lights in the aisles around the scene center.
    fn default_point_lights() -> Vec<PointLightConfig> {
        [
            ([0.0, 2.0, 4.0], [1.0, 1.0, 1.0]),
            ([4.0, 2.0, 0.0], [1.0, 0.0, 0.0]),
            ([-4.0, 2.0, 0.0], [0.0, 1.0, 0.0]),
            ([0.0, 2.0, -4.0], [0.0, 0.0, 1.0]),
        ]
        .into_iter()
        .map(|(position, color)| PointLightConfig {
            position,
            range: PointLightConfig::default_range(),
            color,
        })
        .collect()
    }
}

impl PointLightConfig {
    const fn default_range() -> f32 {
        6.0
    }

    const fn default_color() -> [f32; 3] {
        [1.0, 1.0, 1.0]
    }
}

impl Default for LightingConfig {
    fn default() -> Self {
        Self {
            direction: Self::default_direction(),
            color: Self::default_color(),
            ambient_down: Self::default_ambient_down(),
            ambient_up: Self::default_ambient_up(),
            specular_exponent: Self::default_specular_exponent(),
            specular_intensity: Self::default_specular_intensity(),
            point_lights: Self::default_point_lights(),
        }
    }
}

impl CameraConfig {
    const fn default_position() -> [f32; 3] {
        [0.0, 10.0, -10.0]
    }

    const fn default_fov_degrees() -> f32 {
        45.0
    }

    const fn default_near() -> f32 {
        0.1
    }

    const fn default_far() -> f32 {
        1000.0
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            position: Self::default_position(),
            target: [0.0; 3],
            fov_degrees: Self::default_fov_degrees(),
            near: Self::default_near(),
            far: Self::default_far(),
        }
    }
}

impl RenderConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read config file {}", path.display()))?;
        let cfg: RenderConfig = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        cfg.shadow.validate().with_context(|| format!("Invalid shadow settings in {}", path.display()))?;
        Ok(cfg)
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                log::warn!("Config load error: {err:?}. Falling back to defaults.");
                Self::default()
            }
        }
    }

    pub fn apply_overrides(&mut self, overrides: &RenderConfigOverrides) {
        if let Some(width) = overrides.width {
            self.viewport.width = width;
        }
        if let Some(height) = overrides.height {
            self.viewport.height = height;
        }
        if let Some(size) = overrides.shadow_map_size {
            self.shadow.map_size = size;
        }
        if let Some(mode) = overrides.fit_mode {
            self.shadow.fit_mode = mode;
        }
    }
}

impl RenderConfigOverrides {
    pub fn is_empty(&self) -> bool {
        self.width.is_none()
            && self.height.is_none()
            && self.shadow_map_size.is_none()
            && self.fit_mode.is_none()
    }

    pub fn applied_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.width.is_some() {
            fields.push("width");
        }
        if self.height.is_some() {
            fields.push("height");
        }
        if self.shadow_map_size.is_some() {
            fields.push("shadow_map_size");
        }
        if self.fit_mode.is_some() {
            fields.push("fit_mode");
        }
        fields
    }
}
