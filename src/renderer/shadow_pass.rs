use glam::Mat4;

use crate::camera3d::ShadowCamera;
use crate::config::{CascadeFitMode, ShadowConfig};
use crate::light::DirectionalLight;

use super::cascade::{CascadeFrame, CascadeSolver, CASCADE_COUNT};
use super::depth_buffer_array::DepthBufferArray;
use super::device::{CompareFunction, CullMode, DepthStencilDesc, RasterizerDesc, RenderDevice};
use super::{RenderError, CASCADE_VIEW_PROJ_SLOT, SHADOW_MAP_STAGE};

pub const SHADOW_DEPTH_BIAS: i32 = 85;
pub const SHADOW_SLOPE_SCALED_BIAS: f32 = 6.0;

/// Depth state while rasterizing casters: plain less-than depth, no stencil.
pub const SHADOW_GEN_DEPTH_STENCIL: DepthStencilDesc =
    DepthStencilDesc { depth_compare: Some(CompareFunction::Less), depth_write: true, stencil: None };

/// Biased, unclipped rasterization for casters behind the shadow near plane.
pub const SHADOW_GEN_RASTERIZER: RasterizerDesc = RasterizerDesc {
    cull: CullMode::Back,
    depth_bias: SHADOW_DEPTH_BIAS,
    slope_scaled_depth_bias: SHADOW_SLOPE_SCALED_BIAS,
    depth_clip: false,
};

/// Cascaded shadow map for one directional light.
///
/// Per frame: [`update_parameters`](Self::update_parameters), then `begin` / draw casters /
/// `end`, then `bind` for the lighting pass and `unbind` once it is done. The transforms
/// computed by `update_parameters` are valid for a single `begin`..`unbind` cycle.
pub struct CascadedShadowMap<D: RenderDevice> {
    config: ShadowConfig,
    solver: CascadeSolver,
    maps: DepthBufferArray<D>,
    frame: Option<CascadeFrame>,
    frame_ready: bool,
}

impl<D: RenderDevice> CascadedShadowMap<D> {
    pub fn new(config: &ShadowConfig) -> Result<Self, RenderError> {
        let solver = CascadeSolver::new(config)?;
        Ok(Self {
            config: config.clone(),
            solver,
            maps: DepthBufferArray::new(),
            frame: None,
            frame_ready: false,
        })
    }

    /// Allocates one square depth layer per cascade.
    pub fn create(&mut self, device: &mut D) -> Result<(), RenderError> {
        self.maps.create(device, self.config.map_size, CASCADE_COUNT as u32)?;
        self.solver.reset();
        self.frame = None;
        self.frame_ready = false;
        log::info!(
            "[shadow] cascaded shadow map ready: {} px, splits {:?}, {}",
            self.config.map_size,
            self.config.splits,
            self.solver.fit_mode().label()
        );
        Ok(())
    }

    pub fn is_created(&self) -> bool {
        self.maps.is_created()
    }

    pub fn config(&self) -> &ShadowConfig {
        &self.config
    }

    pub fn solver(&self) -> &CascadeSolver {
        &self.solver
    }

    pub fn depth_array(&self) -> &DepthBufferArray<D> {
        &self.maps
    }

    pub fn fit_mode(&self) -> CascadeFitMode {
        self.solver.fit_mode()
    }

    /// Switching modes drops the stabilization history and the current transforms.
    pub fn set_fit_mode(&mut self, mode: CascadeFitMode) {
        if mode == self.fit_mode() {
            return;
        }
        self.solver.set_fit_mode(mode);
        self.config.fit_mode = mode;
        self.frame_ready = false;
    }

    /// Transforms from the most recent update, fresh or not.
    pub fn frame(&self) -> Option<&CascadeFrame> {
        self.frame.as_ref()
    }

    /// Transforms for the current frame; errors until `update_parameters` has run.
    pub fn current_frame(&self) -> Result<&CascadeFrame, RenderError> {
        match (&self.frame, self.frame_ready) {
            (Some(frame), true) => Ok(frame),
            _ => Err(RenderError::StaleCascades),
        }
    }

    pub fn update_parameters(&mut self, camera: &dyn ShadowCamera, light: &DirectionalLight) -> &CascadeFrame {
        let frame = self.solver.update(camera, light);
        self.frame_ready = true;
        self.frame.insert(frame)
    }

    pub fn begin(&mut self, device: &mut D, clear: bool) -> Result<(), RenderError> {
        let frame = *self.current_frame()?;
        self.maps.begin(device, clear)?;
        // the layers are render targets from here on
        self.maps.unbind(device, SHADOW_MAP_STAGE);
        device.set_depth_stencil_state(SHADOW_GEN_DEPTH_STENCIL, 0);
        device.set_rasterizer_state(SHADOW_GEN_RASTERIZER);
        let uniform = CascadeViewProjUniform::from_frame(&frame);
        device.write_uniform(CASCADE_VIEW_PROJ_SLOT, bytemuck::bytes_of(&uniform));
        Ok(())
    }

    pub fn end(&mut self, device: &mut D) -> Result<(), RenderError> {
        self.maps.end(device)?;
        device.set_depth_stencil_state(DepthStencilDesc::default(), 0);
        device.set_rasterizer_state(RasterizerDesc::default());
        Ok(())
    }

    /// Exposes the cascades to the lighting pass at [`SHADOW_MAP_STAGE`].
    pub fn bind(&self, device: &mut D) -> Result<(), RenderError> {
        self.current_frame()?;
        self.maps.bind(device, SHADOW_MAP_STAGE)
    }

    /// Unbinds the cascades and retires this frame's transforms.
    pub fn unbind(&mut self, device: &mut D) {
        self.maps.unbind(device, SHADOW_MAP_STAGE);
        self.frame_ready = false;
    }

    pub fn render(&self, device: &mut D) -> Result<(), RenderError> {
        self.maps.render(device)
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct CascadeViewProjUniform {
    pub view_proj: [[[f32; 4]; 4]; CASCADE_COUNT],
}

impl CascadeViewProjUniform {
    pub fn from_frame(frame: &CascadeFrame) -> Self {
        Self { view_proj: frame.world_to_cascade().map(|matrix: Mat4| matrix.to_cols_array_2d()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera3d::Camera3D;
    use crate::renderer::recording_device::RecordingDevice;
    use glam::Vec3;

    fn camera() -> Camera3D {
        Camera3D::new(Vec3::new(0.0, 10.0, -10.0), Vec3::ZERO, std::f32::consts::FRAC_PI_4, 0.1, 1000.0)
            .with_viewport(1280, 1024)
    }

    #[test]
    fn begin_requires_fresh_parameters() {
        let mut device = RecordingDevice::new(1280, 1024);
        let mut shadows = CascadedShadowMap::new(&ShadowConfig::default()).expect("config");
        shadows.create(&mut device).expect("create");
        assert!(matches!(shadows.begin(&mut device, true), Err(RenderError::StaleCascades)));

        let light = DirectionalLight::looking_at(Vec3::new(-10.0, 30.0, -10.0), Vec3::ZERO);
        shadows.update_parameters(&camera(), &light);
        shadows.begin(&mut device, true).expect("begin");
        assert_eq!(device.rasterizer_state(), SHADOW_GEN_RASTERIZER);
        assert_eq!(device.depth_stencil_state(), (SHADOW_GEN_DEPTH_STENCIL, 0));
        shadows.end(&mut device).expect("end");
        shadows.bind(&mut device).expect("bind");
        shadows.unbind(&mut device);
        assert!(matches!(shadows.bind(&mut device), Err(RenderError::StaleCascades)));
    }

    #[test]
    fn uniform_carries_cascade_matrices() {
        let mut shadows = CascadedShadowMap::<RecordingDevice>::new(&ShadowConfig::default()).expect("config");
        let light = DirectionalLight::new(Vec3::new(0.3, -1.0, 0.2));
        let frame = *shadows.update_parameters(&camera(), &light);
        let uniform = CascadeViewProjUniform::from_frame(&frame);
        for (idx, matrix) in frame.world_to_cascade().iter().enumerate() {
            assert_eq!(uniform.view_proj[idx], matrix.to_cols_array_2d());
        }
    }

    #[test]
    fn begin_before_create_is_an_error() {
        let mut device = RecordingDevice::new(64, 64);
        let mut shadows = CascadedShadowMap::new(&ShadowConfig::default()).expect("config");
        shadows.update_parameters(&camera(), &DirectionalLight::new(Vec3::NEG_Y));
        assert!(matches!(shadows.begin(&mut device, true), Err(RenderError::NotCreated { .. })));
    }
}
