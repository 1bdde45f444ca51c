//! Deferred-shading geometry buffer.
//!
//! Four attachments share the viewport size: depth/stencil, base color with specular
//! intensity in alpha, packed normals, and specular power. The geometry pass writes all
//! of them between [`GBuffer::begin`] and [`GBuffer::end`]; afterwards only the read-only
//! depth view stays bound so the lighting pass can depth/stencil test without writing.

use glam::{Mat4, Vec2, Vec3, Vec4};

use crate::camera3d::ShadowCamera;

use super::device::{
    CompareFunction, DepthStencilDesc, DepthViewDesc, PrimitiveTopology, Program, RenderDevice, SampledViewDesc,
    StencilDesc, StencilOp, TextureDesc, TextureFormat, TextureUsage,
};
use super::{PassState, RenderError, GBUFFER_FIRST_STAGE, GBUFFER_UNPACK_SLOT};

const COMPONENT: &str = "gbuffer";

pub const DEPTH_STENCIL_FORMAT: TextureFormat = TextureFormat::Depth24Stencil8;
pub const COLOR_SPEC_INTENSITY_FORMAT: TextureFormat = TextureFormat::Rgba8Unorm;
pub const NORMAL_FORMAT: TextureFormat = TextureFormat::Rg11b10Float;
pub const SPEC_POWER_FORMAT: TextureFormat = TextureFormat::Rgba8Unorm;

/// Stencil value written wherever geometry lands.
pub const GEOMETRY_STENCIL_REF: u32 = 1;

const STENCIL_MARK: StencilDesc = StencilDesc {
    read_mask: 0xff,
    write_mask: 0xff,
    compare: CompareFunction::Always,
    fail_op: StencilOp::Replace,
    depth_fail_op: StencilOp::Replace,
    pass_op: StencilOp::Replace,
};

/// Geometry-pass state: depth test and write, stencil marked with [`GEOMETRY_STENCIL_REF`].
pub const GEOMETRY_DEPTH_STENCIL: DepthStencilDesc =
    DepthStencilDesc { depth_compare: Some(CompareFunction::Less), depth_write: true, stencil: Some(STENCIL_MARK) };

const COLOR_CLEAR: [f32; 4] = [0.0; 4];
/// Vertices of the four debug tiles.
const VISUALIZE_VERTEX_COUNT: u32 = 24;

struct GBufferResources<D: RenderDevice> {
    depth_view: D::DepthView,
    read_only_depth_view: D::DepthView,
    // color+spec intensity, normal, spec power
    color_views: [D::RenderView; 3],
    // depth, color+spec intensity, normal, spec power
    sampled_views: [D::SampledView; 4],
    _textures: [D::Texture; 4],
}

impl<D: RenderDevice> GBufferResources<D> {
    fn allocate(device: &mut D, width: u32, height: u32) -> Result<Self, RenderError> {
        let target = TextureUsage::RENDER_TARGET | TextureUsage::SHADER_RESOURCE;
        let depth_usage = TextureUsage::DEPTH_STENCIL | TextureUsage::SHADER_RESOURCE;
        let descs = [
            TextureDesc::new_2d("GBuffer Depth Stencil", width, height, DEPTH_STENCIL_FORMAT, depth_usage),
            TextureDesc::new_2d("GBuffer Color Spec Intensity", width, height, COLOR_SPEC_INTENSITY_FORMAT, target),
            TextureDesc::new_2d("GBuffer Normal", width, height, NORMAL_FORMAT, target),
            TextureDesc::new_2d("GBuffer Spec Power", width, height, SPEC_POWER_FORMAT, target),
        ];
        let [depth, color, normal, spec_power] = descs;
        let depth = device.create_texture(&depth).map_err(RenderError::allocation("gbuffer depth texture"))?;
        let color = device.create_texture(&color).map_err(RenderError::allocation("gbuffer color texture"))?;
        let normal = device.create_texture(&normal).map_err(RenderError::allocation("gbuffer normal texture"))?;
        let spec_power =
            device.create_texture(&spec_power).map_err(RenderError::allocation("gbuffer spec power texture"))?;

        let depth_view = device
            .create_depth_view(&depth, &DepthViewDesc::WRITABLE)
            .map_err(RenderError::allocation("gbuffer depth view"))?;
        let read_only_depth_view = device
            .create_depth_view(&depth, &DepthViewDesc::READ_ONLY)
            .map_err(RenderError::allocation("gbuffer read-only depth view"))?;

        let color_views = [
            device.create_render_view(&color).map_err(RenderError::allocation("gbuffer color target"))?,
            device.create_render_view(&normal).map_err(RenderError::allocation("gbuffer normal target"))?,
            device.create_render_view(&spec_power).map_err(RenderError::allocation("gbuffer spec power target"))?,
        ];

        let sampled = SampledViewDesc::D2;
        let sampled_views = [
            device.create_sampled_view(&depth, &sampled).map_err(RenderError::allocation("gbuffer depth srv"))?,
            device.create_sampled_view(&color, &sampled).map_err(RenderError::allocation("gbuffer color srv"))?,
            device.create_sampled_view(&normal, &sampled).map_err(RenderError::allocation("gbuffer normal srv"))?,
            device
                .create_sampled_view(&spec_power, &sampled)
                .map_err(RenderError::allocation("gbuffer spec power srv"))?,
        ];

        Ok(Self {
            depth_view,
            read_only_depth_view,
            color_views,
            sampled_views,
            _textures: [depth, color, normal, spec_power],
        })
    }
}

pub struct GBuffer<D: RenderDevice> {
    width: u32,
    height: u32,
    state: PassState,
    resources: Option<GBufferResources<D>>,
}

impl<D: RenderDevice> Default for GBuffer<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: RenderDevice> GBuffer<D> {
    pub fn new() -> Self {
        Self { width: 0, height: 0, state: PassState::Uncreated, resources: None }
    }

    /// (Re)allocates every attachment at `width`x`height`.
    ///
    /// The previous set is released first. Allocation is all-or-nothing: on error the buffer
    /// is left uncreated and nothing from the failed attempt stays alive.
    pub fn create(&mut self, device: &mut D, width: u32, height: u32) -> Result<(), RenderError> {
        if self.state == PassState::InPass {
            return Err(RenderError::PassAlreadyActive { component: COMPONENT });
        }
        self.release();
        let resources = GBufferResources::allocate(device, width, height)?;
        self.resources = Some(resources);
        self.width = width;
        self.height = height;
        self.state = PassState::Created;
        log::info!("[gbuffer] attachments created at {width}x{height}");
        Ok(())
    }

    pub fn release(&mut self) {
        self.resources = None;
        self.width = 0;
        self.height = 0;
        self.state = PassState::Uncreated;
    }

    pub fn state(&self) -> PassState {
        self.state
    }

    pub fn is_created(&self) -> bool {
        self.state.is_created()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Clears and binds the attachments for the geometry pass.
    pub fn begin(&mut self, device: &mut D) -> Result<(), RenderError> {
        self.state.begin(COMPONENT)?;
        let resources = self.resources.as_ref().ok_or(RenderError::NotCreated { component: COMPONENT })?;
        device.clear_depth_view(&resources.depth_view, 1.0, 0);
        for view in &resources.color_views {
            device.clear_render_view(view, COLOR_CLEAR);
        }
        let [color, normal, spec_power] = &resources.color_views;
        device.set_render_targets(&[Some(color), Some(normal), Some(spec_power)], Some(&resources.depth_view));
        device.set_depth_stencil_state(GEOMETRY_DEPTH_STENCIL, GEOMETRY_STENCIL_REF);
        Ok(())
    }

    /// Unbinds the color attachments and leaves only the read-only depth view bound.
    pub fn end(&mut self, device: &mut D) -> Result<(), RenderError> {
        self.state.end(COMPONENT)?;
        let resources = self.resources.as_ref().ok_or(RenderError::NotCreated { component: COMPONENT })?;
        device.set_primitive_topology(PrimitiveTopology::TriangleList);
        device.set_render_targets(&[None, None, None], Some(&resources.read_only_depth_view));
        Ok(())
    }

    /// Uploads the terms the lighting shader needs to rebuild positions from depth.
    pub fn prepare_for_unpack(
        &self,
        device: &mut D,
        camera: &dyn ShadowCamera,
    ) -> Result<GBufferUnpackUniform, RenderError> {
        self.state.require_created(COMPONENT)?;
        let uniform = GBufferUnpackUniform::from_camera(camera);
        device.write_uniform(GBUFFER_UNPACK_SLOT, bytemuck::bytes_of(&uniform));
        Ok(uniform)
    }

    /// Debug view: the four attachments tiled across the current target.
    pub fn render(&self, device: &mut D) -> Result<(), RenderError> {
        let resources = self.readable()?;
        let [depth, color, normal, spec_power] = &resources.sampled_views;
        device.bind_sampled_views(GBUFFER_FIRST_STAGE, &[Some(depth), Some(color), Some(normal), Some(spec_power)]);
        device.set_primitive_topology(PrimitiveTopology::TriangleList);
        device.draw(Program::GBufferVisualize, VISUALIZE_VERTEX_COUNT)?;
        device.bind_sampled_views(GBUFFER_FIRST_STAGE, &[None, None, None, None]);
        Ok(())
    }

    /// Shader views in stage order: depth, color+spec intensity, normal, spec power.
    pub fn sampled_views(&self) -> Result<[&D::SampledView; 4], RenderError> {
        let resources = self.readable()?;
        let [depth, color, normal, spec_power] = &resources.sampled_views;
        Ok([depth, color, normal, spec_power])
    }

    pub fn read_only_depth_view(&self) -> Result<&D::DepthView, RenderError> {
        Ok(&self.readable()?.read_only_depth_view)
    }

    fn readable(&self) -> Result<&GBufferResources<D>, RenderError> {
        if self.state == PassState::InPass {
            return Err(RenderError::PassAlreadyActive { component: COMPONENT });
        }
        self.resources.as_ref().ok_or(RenderError::NotCreated { component: COMPONENT })
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GBufferUnpackUniform {
    /// `(1/p00, 1/p11, p32, p22)` of the projection matrix.
    pub perspective: [f32; 4],
    pub view_inverse: [[f32; 4]; 4],
}

impl GBufferUnpackUniform {
    pub fn from_camera(camera: &dyn ShadowCamera) -> Self {
        let proj = camera.projection_matrix();
        let perspective = [1.0 / proj.x_axis.x, 1.0 / proj.y_axis.y, proj.w_axis.z, proj.z_axis.z];
        Self { perspective, view_inverse: camera.view_matrix().inverse().to_cols_array_2d() }
    }

    /// Positive view-space distance for a stored depth value.
    pub fn linear_depth(&self, depth: f32) -> f32 {
        self.perspective[2] / (depth + self.perspective[3])
    }

    pub fn view_position(&self, ndc: Vec2, depth: f32) -> Vec3 {
        let linear = self.linear_depth(depth);
        Vec3::new(ndc.x * self.perspective[0] * linear, ndc.y * self.perspective[1] * linear, -linear)
    }

    pub fn world_position(&self, ndc: Vec2, depth: f32) -> Vec3 {
        let view_inverse = Mat4::from_cols_array_2d(&self.view_inverse);
        (view_inverse * Vec4::from((self.view_position(ndc, depth), 1.0))).truncate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera3d::Camera3D;
    use crate::renderer::recording_device::RecordingDevice;

    #[test]
    fn unpack_reconstructs_world_positions() {
        let camera = Camera3D::new(Vec3::new(0.0, 10.0, -10.0), Vec3::ZERO, 0.785, 0.1, 1000.0)
            .with_viewport(1280, 1024);
        let unpack = GBufferUnpackUniform::from_camera(&camera);
        let view_proj = camera.view_projection();
        for world in [Vec3::ZERO, Vec3::new(3.0, 1.0, 4.0), Vec3::new(-6.0, 0.5, 12.0)] {
            let clip = view_proj * world.extend(1.0);
            let ndc = clip.truncate() / clip.w;
            let rebuilt = unpack.world_position(ndc.truncate(), ndc.z);
            assert!(rebuilt.distance(world) < 1e-2, "{world:?} -> {rebuilt:?}");
        }
    }

    #[test]
    fn render_binds_all_four_attachments() {
        let mut device = RecordingDevice::new(320, 240);
        let mut gbuffer = GBuffer::new();
        assert!(matches!(gbuffer.render(&mut device), Err(RenderError::NotCreated { .. })));
        gbuffer.create(&mut device, 320, 240).expect("create");
        gbuffer.render(&mut device).expect("render");
        for stage in 0..4 {
            assert_eq!(device.sampled_at(stage), None, "debug render leaves stage {stage} unbound");
        }
    }

    #[test]
    fn views_are_unavailable_during_geometry_pass() {
        let mut device = RecordingDevice::new(320, 240);
        let mut gbuffer = GBuffer::new();
        gbuffer.create(&mut device, 320, 240).expect("create");
        gbuffer.begin(&mut device).expect("begin");
        assert!(matches!(gbuffer.sampled_views(), Err(RenderError::PassAlreadyActive { .. })));
        gbuffer.end(&mut device).expect("end");
        assert!(gbuffer.sampled_views().is_ok());
    }
}
