//! Procedural scene used by the demo binary: a ground plane and an 8x8 grid of boxes.
//!
//! Geometry lives entirely in the scene shaders, so drawing is a single vertex-count draw
//! with no vertex buffers.

use glam::Vec3;

use crate::camera3d::ShadowCamera;
use crate::renderer::device::{PrimitiveTopology, Program, RenderDevice};
use crate::renderer::{DeviceError, FRAME_UNIFORM_SLOT};

pub const GROUND_VERTEX_COUNT: u32 = 6;
pub const BOX_VERTEX_COUNT: u32 = 36;
pub const BOX_GRID: u32 = 8;
pub const DEMO_SCENE_VERTEX_COUNT: u32 = GROUND_VERTEX_COUNT + BOX_GRID * BOX_GRID * BOX_VERTEX_COUNT;
const GRID_SPACING: f32 = 8.0;

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct SceneFrameUniform {
    pub view_proj: [[f32; 4]; 4],
}

impl SceneFrameUniform {
    pub fn from_camera(camera: &dyn ShadowCamera) -> Self {
        Self { view_proj: camera.view_projection().to_cols_array_2d() }
    }
}

/// Centre of box `(x, z)` on the ground, matching the shader layout.
pub fn box_center(x: u32, z: u32) -> Vec3 {
    Vec3::new((x as f32 - 3.5) * GRID_SPACING, 0.0, (z as f32 - 3.5) * GRID_SPACING)
}

/// Rasterizes every caster into whatever depth target is bound.
pub fn draw_shadow_casters<D: RenderDevice>(device: &mut D) -> Result<(), DeviceError> {
    device.set_primitive_topology(PrimitiveTopology::TriangleList);
    device.draw(Program::SceneDepth, DEMO_SCENE_VERTEX_COUNT)
}

pub fn draw_gbuffer<D: RenderDevice>(device: &mut D, camera: &dyn ShadowCamera) -> Result<(), DeviceError> {
    let uniform = SceneFrameUniform::from_camera(camera);
    device.write_uniform(FRAME_UNIFORM_SLOT, bytemuck::bytes_of(&uniform));
    device.set_primitive_topology(PrimitiveTopology::TriangleList);
    device.draw(Program::SceneGBuffer, DEMO_SCENE_VERTEX_COUNT)
}
