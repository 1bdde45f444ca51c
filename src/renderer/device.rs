//! Backend-neutral GPU device contract.
//!
//! Passes in this crate talk to the GPU through [`RenderDevice`], an immediate-mode
//! interface modelled after a classic device context: resources are created up front,
//! targets and state are bound, then draws are issued. Handles are owned values; dropping
//! one releases the underlying GPU object.

use bitflags::bitflags;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("texture '{label}' rejected: {reason}")]
    TextureRejected { label: String, reason: String },
    #[error("view on '{label}' rejected: {reason}")]
    ViewRejected { label: String, reason: String },
    #[error("program {program:?} needs binding {binding} but nothing is bound there")]
    MissingBinding { program: Program, binding: u32 },
    #[error("backend failure: {reason}")]
    Backend { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Depth24Stencil8,
    Depth32Float,
    Rgba8Unorm,
    Rg11b10Float,
}

impl TextureFormat {
    pub fn is_depth(self) -> bool {
        matches!(self, TextureFormat::Depth24Stencil8 | TextureFormat::Depth32Float)
    }

    pub fn has_stencil(self) -> bool {
        matches!(self, TextureFormat::Depth24Stencil8)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        const RENDER_TARGET = 1 << 0;
        const DEPTH_STENCIL = 1 << 1;
        const SHADER_RESOURCE = 1 << 2;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextureDesc {
    pub label: &'static str,
    pub width: u32,
    pub height: u32,
    pub array_layers: u32,
    pub format: TextureFormat,
    pub usage: TextureUsage,
}

impl TextureDesc {
    pub fn new_2d(
        label: &'static str,
        width: u32,
        height: u32,
        format: TextureFormat,
        usage: TextureUsage,
    ) -> Self {
        Self { label, width, height, array_layers: 1, format, usage }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthViewDesc {
    pub read_only: bool,
    pub first_layer: u32,
    pub layer_count: u32,
}

impl DepthViewDesc {
    pub const WRITABLE: Self = Self { read_only: false, first_layer: 0, layer_count: 1 };
    pub const READ_ONLY: Self = Self { read_only: true, first_layer: 0, layer_count: 1 };

    pub fn layered(layer_count: u32) -> Self {
        Self { read_only: false, first_layer: 0, layer_count }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewDimension {
    D2,
    D2Array,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampledViewDesc {
    pub dimension: ViewDimension,
    pub first_layer: u32,
    pub layer_count: u32,
}

impl SampledViewDesc {
    pub const D2: Self = Self { dimension: ViewDimension::D2, first_layer: 0, layer_count: 1 };

    pub fn array(layer_count: u32) -> Self {
        Self { dimension: ViewDimension::D2Array, first_layer: 0, layer_count }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompareFunction {
    Never,
    #[default]
    Less,
    LessEqual,
    Equal,
    GreaterEqual,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StencilOp {
    #[default]
    Keep,
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StencilDesc {
    pub read_mask: u32,
    pub write_mask: u32,
    pub compare: CompareFunction,
    pub fail_op: StencilOp,
    pub depth_fail_op: StencilOp,
    pub pass_op: StencilOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepthStencilDesc {
    pub depth_compare: Option<CompareFunction>,
    pub depth_write: bool,
    pub stencil: Option<StencilDesc>,
}

impl Default for DepthStencilDesc {
    fn default() -> Self {
        Self { depth_compare: Some(CompareFunction::Less), depth_write: true, stencil: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CullMode {
    None,
    Front,
    #[default]
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterizerDesc {
    pub cull: CullMode,
    pub depth_bias: i32,
    pub slope_scaled_depth_bias: f32,
    pub depth_clip: bool,
}

impl Default for RasterizerDesc {
    fn default() -> Self {
        Self { cull: CullMode::Back, depth_bias: 0, slope_scaled_depth_bias: 0.0, depth_clip: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PrimitiveTopology {
    #[default]
    TriangleList,
    TriangleStrip,
}

/// Color blending applied to every bound color target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlendMode {
    #[default]
    Replace,
    /// `src + dst` on color and alpha.
    Additive,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    pub fn sized(width: u32, height: u32) -> Self {
        Self { x: 0.0, y: 0.0, width: width as f32, height: height as f32, min_depth: 0.0, max_depth: 1.0 }
    }
}

/// Shader programs the backend knows how to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Program {
    /// Tiles the four G-buffer attachments across the current target.
    GBufferVisualize,
    /// Tiles every layer of a depth array across the current target.
    DepthArrayVisualize,
    /// Full-screen directional light with cascaded shadows.
    DirectionalLight,
    /// Point light volume, a box of the light's range drawn from its back faces.
    PointLight,
    /// Procedural demo geometry, depth only, one draw per bound depth layer.
    SceneDepth,
    /// Procedural demo geometry into the G-buffer attachments.
    SceneGBuffer,
}

impl Program {
    pub fn sampled_stages(self) -> &'static [u32] {
        match self {
            Program::GBufferVisualize => &[0, 1, 2, 3],
            Program::DepthArrayVisualize => &[0],
            Program::DirectionalLight => &[0, 1, 2, 3, super::SHADOW_MAP_STAGE],
            Program::PointLight => &[0, 1, 2, 3],
            Program::SceneDepth | Program::SceneGBuffer => &[],
        }
    }

    pub fn uniform_slots(self) -> &'static [u32] {
        match self {
            Program::GBufferVisualize | Program::DepthArrayVisualize => &[],
            Program::DirectionalLight => &[super::DIRECTIONAL_LIGHT_SLOT, super::GBUFFER_UNPACK_SLOT],
            Program::PointLight => &[super::POINT_LIGHT_SLOT, super::GBUFFER_UNPACK_SLOT],
            Program::SceneDepth => &[super::CASCADE_VIEW_PROJ_SLOT],
            Program::SceneGBuffer => &[super::FRAME_UNIFORM_SLOT],
        }
    }

    /// Whether the program reads the per-layer index when drawn into a layered depth target.
    pub fn is_layered(self) -> bool {
        matches!(self, Program::SceneDepth)
    }

    pub fn label(self) -> &'static str {
        match self {
            Program::GBufferVisualize => "GBuffer Visualize",
            Program::DepthArrayVisualize => "Depth Array Visualize",
            Program::DirectionalLight => "Directional Light",
            Program::PointLight => "Point Light",
            Program::SceneDepth => "Scene Depth",
            Program::SceneGBuffer => "Scene GBuffer",
        }
    }
}

/// Immediate-mode GPU context used by every pass in the crate.
///
/// Binding state persists until replaced. Uniform slots and sampled-view stages are
/// small integers shared with the shaders (see the `*_SLOT` and `*_STAGE` constants in
/// [`crate::renderer`]).
pub trait RenderDevice {
    type Texture;
    type RenderView;
    type DepthView;
    type SampledView;

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<Self::Texture, DeviceError>;
    fn create_render_view(&mut self, texture: &Self::Texture) -> Result<Self::RenderView, DeviceError>;
    fn create_depth_view(
        &mut self,
        texture: &Self::Texture,
        desc: &DepthViewDesc,
    ) -> Result<Self::DepthView, DeviceError>;
    fn create_sampled_view(
        &mut self,
        texture: &Self::Texture,
        desc: &SampledViewDesc,
    ) -> Result<Self::SampledView, DeviceError>;

    fn clear_render_view(&mut self, view: &Self::RenderView, color: [f32; 4]);
    fn clear_depth_view(&mut self, view: &Self::DepthView, depth: f32, stencil: u32);

    /// Binds color targets (`None` leaves a slot empty) and an optional depth view.
    fn set_render_targets(&mut self, colors: &[Option<&Self::RenderView>], depth: Option<&Self::DepthView>);
    /// Rebinds the presentation target the device was configured with.
    fn restore_default_targets(&mut self);

    fn viewport(&self) -> Viewport;
    fn set_viewport(&mut self, viewport: Viewport);
    fn set_depth_stencil_state(&mut self, desc: DepthStencilDesc, stencil_ref: u32);
    fn set_rasterizer_state(&mut self, desc: RasterizerDesc);
    fn set_primitive_topology(&mut self, topology: PrimitiveTopology);
    fn set_blend_mode(&mut self, mode: BlendMode);

    /// Binds views to consecutive stages starting at `first_stage`; `None` unbinds.
    fn bind_sampled_views(&mut self, first_stage: u32, views: &[Option<&Self::SampledView>]);
    fn write_uniform(&mut self, slot: u32, bytes: &[u8]);
    fn draw(&mut self, program: Program, vertex_count: u32) -> Result<(), DeviceError>;
}
