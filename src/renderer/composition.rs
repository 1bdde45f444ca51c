use glam::{Mat4, Vec3};

use crate::camera3d::ShadowCamera;
use crate::light::{AmbientLight, DirectionalLight, PointLight};

use super::cascade::CascadeFrame;
use super::device::{
    BlendMode, CompareFunction, CullMode, DepthStencilDesc, PrimitiveTopology, Program, RasterizerDesc,
    RenderDevice, StencilDesc, StencilOp,
};
use super::gbuffer::{GBuffer, GEOMETRY_STENCIL_REF};
use super::shadow_pass::CascadedShadowMap;
use super::{RenderError, DIRECTIONAL_LIGHT_SLOT, GBUFFER_FIRST_STAGE, POINT_LIGHT_SLOT};

pub const COMPOSITE_CLEAR_COLOR: [f32; 4] = [50.0 / 255.0, 50.0 / 255.0, 50.0 / 255.0, 1.0];
const FULLSCREEN_STRIP_VERTICES: u32 = 4;
const LIGHT_VOLUME_VERTICES: u32 = 36;

const STENCIL_EQUAL: StencilDesc = StencilDesc {
    read_mask: 0xff,
    write_mask: 0xff,
    compare: CompareFunction::Equal,
    fail_op: StencilOp::Keep,
    depth_fail_op: StencilOp::Keep,
    pass_op: StencilOp::Keep,
};

/// Full-screen lighting: depth tested but never written, only where geometry was marked.
pub const LIGHTING_DEPTH_STENCIL: DepthStencilDesc = DepthStencilDesc {
    depth_compare: Some(CompareFunction::Less),
    depth_write: false,
    stencil: Some(STENCIL_EQUAL),
};

/// Light volumes drawn from their back faces: shades geometry in front of the far side.
pub const VOLUME_LIGHT_DEPTH_STENCIL: DepthStencilDesc = DepthStencilDesc {
    depth_compare: Some(CompareFunction::GreaterEqual),
    depth_write: false,
    stencil: Some(STENCIL_EQUAL),
};

/// Back faces only, never clipped by the far plane.
pub const VOLUME_LIGHT_RASTERIZER: RasterizerDesc =
    RasterizerDesc { cull: CullMode::Front, depth_bias: 0, slope_scaled_depth_bias: 0.0, depth_clip: false };

/// Deferred directional light with cascaded shadows.
#[derive(Debug, Clone, Copy)]
pub struct DirectionalLightPass {
    clear_color: [f32; 4],
}

impl Default for DirectionalLightPass {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectionalLightPass {
    pub fn new() -> Self {
        Self { clear_color: COMPOSITE_CLEAR_COLOR }
    }

    pub fn with_clear_color(mut self, clear_color: [f32; 4]) -> Self {
        self.clear_color = clear_color;
        self
    }

    /// Shades `output` from the G-buffer and the shadow cascades.
    ///
    /// The G-buffer must have ended its geometry pass and the shadow map must hold this
    /// frame's transforms; the shadow map's transforms are retired once the draw is done.
    #[allow(clippy::too_many_arguments)]
    pub fn render<D: RenderDevice>(
        &self,
        device: &mut D,
        output: &D::RenderView,
        gbuffer: &GBuffer<D>,
        shadows: &mut CascadedShadowMap<D>,
        camera: &dyn ShadowCamera,
        light: &DirectionalLight,
        ambient: &AmbientLight,
    ) -> Result<DirectionalLightUniform, RenderError> {
        let frame = *shadows.current_frame()?;
        let [depth, color, normal, spec_power] = gbuffer.sampled_views()?;
        let read_only_depth = gbuffer.read_only_depth_view()?;

        device.clear_render_view(output, self.clear_color);
        device.set_render_targets(&[Some(output)], Some(read_only_depth));
        gbuffer.prepare_for_unpack(device, camera)?;
        device.set_depth_stencil_state(LIGHTING_DEPTH_STENCIL, GEOMETRY_STENCIL_REF);

        device.bind_sampled_views(GBUFFER_FIRST_STAGE, &[Some(depth), Some(color), Some(normal), Some(spec_power)]);
        shadows.bind(device)?;

        let uniform = DirectionalLightUniform::new(
            light,
            ambient,
            camera.eye_position().to_array(),
            &frame,
            shadows.config().map_size,
        );
        device.write_uniform(DIRECTIONAL_LIGHT_SLOT, bytemuck::bytes_of(&uniform));
        device.set_primitive_topology(PrimitiveTopology::TriangleStrip);
        let drawn = device.draw(Program::DirectionalLight, FULLSCREEN_STRIP_VERTICES);

        device.bind_sampled_views(GBUFFER_FIRST_STAGE, &[None, None, None, None]);
        shadows.unbind(device);
        device.set_primitive_topology(PrimitiveTopology::TriangleList);
        device.set_depth_stencil_state(DepthStencilDesc::default(), 0);
        drawn?;
        Ok(uniform)
    }
}

/// Additive point lights over an already lit output.
///
/// Each light is a box of its range drawn from the back faces with a greater-equal depth
/// test against the G-buffer's read-only depth, so only marked geometry inside the volume
/// is shaded.
#[derive(Debug, Clone, Copy, Default)]
pub struct PointLightPass;

impl PointLightPass {
    pub fn new() -> Self {
        Self
    }

    /// Adds every light in `lights` to `output` and returns the uniforms uploaded, in order.
    ///
    /// Run after [`DirectionalLightPass::render`]; `output` is blended onto, never cleared.
    pub fn render<D: RenderDevice>(
        &self,
        device: &mut D,
        output: &D::RenderView,
        gbuffer: &GBuffer<D>,
        camera: &dyn ShadowCamera,
        lights: &[PointLight],
    ) -> Result<Vec<PointLightUniform>, RenderError> {
        let [depth, color, normal, spec_power] = gbuffer.sampled_views()?;
        let read_only_depth = gbuffer.read_only_depth_view()?;
        if lights.is_empty() {
            return Ok(Vec::new());
        }

        device.set_render_targets(&[Some(output)], Some(read_only_depth));
        gbuffer.prepare_for_unpack(device, camera)?;
        device.set_depth_stencil_state(VOLUME_LIGHT_DEPTH_STENCIL, GEOMETRY_STENCIL_REF);
        device.set_rasterizer_state(VOLUME_LIGHT_RASTERIZER);
        device.set_blend_mode(BlendMode::Additive);
        device.set_primitive_topology(PrimitiveTopology::TriangleList);
        device.bind_sampled_views(GBUFFER_FIRST_STAGE, &[Some(depth), Some(color), Some(normal), Some(spec_power)]);

        let view_proj = camera.projection_matrix() * camera.view_matrix();
        let eye = camera.eye_position();
        let mut uploaded = Vec::with_capacity(lights.len());
        let mut drawn = Ok(());
        for light in lights {
            let uniform = PointLightUniform::new(light, view_proj, eye);
            device.write_uniform(POINT_LIGHT_SLOT, bytemuck::bytes_of(&uniform));
            drawn = device.draw(Program::PointLight, LIGHT_VOLUME_VERTICES);
            if drawn.is_err() {
                break;
            }
            uploaded.push(uniform);
        }

        device.bind_sampled_views(GBUFFER_FIRST_STAGE, &[None, None, None, None]);
        device.set_blend_mode(BlendMode::Replace);
        device.set_rasterizer_state(RasterizerDesc::default());
        device.set_depth_stencil_state(DepthStencilDesc::default(), 0);
        drawn?;
        log::debug!("[lighting] {} point light volumes", uploaded.len());
        Ok(uploaded)
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct PointLightUniform {
    /// Unit box to clip space: `view_proj * translate(position) * scale(range)`.
    pub light_projection: [[f32; 4]; 4],
    pub position: [f32; 4],
    /// x: `1 / range`.
    pub range_rcp: [f32; 4],
    /// Linear color.
    pub color: [f32; 4],
    pub eye_position: [f32; 4],
}

impl PointLightUniform {
    pub fn new(light: &PointLight, view_proj: Mat4, eye_position: Vec3) -> Self {
        Self {
            light_projection: (view_proj * light.volume_transform()).to_cols_array_2d(),
            position: light.position.extend(1.0).to_array(),
            range_rcp: [1.0 / light.range(); 4],
            color: light.linear_color().extend(1.0).to_array(),
            eye_position: eye_position.extend(1.0).to_array(),
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DirectionalLightUniform {
    pub ambient_down: [f32; 4],
    pub ambient_range: [f32; 4],
    /// xyz: direction the light travels.
    pub direction: [f32; 4],
    pub color: [f32; 4],
    /// x: exponent, y: intensity, z: shadow map size, w: 1 / shadow map size.
    pub specular_shadow: [f32; 4],
    pub eye_position: [f32; 4],
    pub world_to_shadow: [[f32; 4]; 4],
    pub cascade_offset_x: [f32; 4],
    pub cascade_offset_y: [f32; 4],
    pub cascade_scale: [f32; 4],
}

impl DirectionalLightUniform {
    pub fn new(
        light: &DirectionalLight,
        ambient: &AmbientLight,
        eye_position: [f32; 3],
        frame: &CascadeFrame,
        shadow_map_size: u32,
    ) -> Self {
        let size = shadow_map_size.max(1) as f32;
        Self {
            ambient_down: ambient.linear_down().extend(0.0).to_array(),
            ambient_range: ambient.linear_range().extend(0.0).to_array(),
            direction: light.direction().extend(0.0).to_array(),
            color: light.color.extend(1.0).to_array(),
            specular_shadow: [light.specular_exponent, light.specular_intensity, size, 1.0 / size],
            eye_position: [eye_position[0], eye_position[1], eye_position[2], 1.0],
            world_to_shadow: frame.basis.world_to_shadow.to_cols_array_2d(),
            cascade_offset_x: frame.offset_x,
            cascade_offset_y: frame.offset_y,
            cascade_scale: frame.scale,
        }
    }
}
