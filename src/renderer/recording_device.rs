use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use super::device::{
    BlendMode, DepthStencilDesc, DepthViewDesc, DeviceError, PrimitiveTopology, Program, RasterizerDesc,
    RenderDevice, SampledViewDesc, TextureDesc, TextureFormat, Viewport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Texture,
    RenderView,
    DepthView,
    SampledView,
}

#[derive(Debug, Default)]
struct LiveCounts {
    textures: Cell<usize>,
    views: Cell<usize>,
}

impl LiveCounts {
    fn cell(&self, kind: ResourceKind) -> &Cell<usize> {
        match kind {
            ResourceKind::Texture => &self.textures,
            _ => &self.views,
        }
    }
}

/// Handle issued by [`RecordingDevice`]; dropping it releases the recorded resource.
#[derive(Debug)]
pub struct RecordedResource {
    id: u64,
    kind: ResourceKind,
    label: &'static str,
    format: TextureFormat,
    width: u32,
    height: u32,
    layers: u32,
    read_only: bool,
    live: Rc<LiveCounts>,
}

impl RecordedResource {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn layers(&self) -> u32 {
        self.layers
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }
}

impl Drop for RecordedResource {
    fn drop(&mut self) {
        let cell = self.live.cell(self.kind);
        cell.set(cell.get().saturating_sub(1));
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    ClearColor { view: u64, color: [f32; 4] },
    ClearDepth { view: u64, depth: f32, stencil: u32 },
    SetRenderTargets { colors: Vec<Option<u64>>, depth: Option<u64> },
    RestoreDefaultTargets,
    SetViewport(Viewport),
    SetDepthStencil { desc: DepthStencilDesc, stencil_ref: u32 },
    SetRasterizer(RasterizerDesc),
    SetTopology(PrimitiveTopology),
    SetBlend(BlendMode),
    BindSampled { first_stage: u32, views: Vec<Option<u64>> },
    WriteUniform { slot: u32, bytes: Vec<u8> },
    Draw { program: Program, vertex_count: u32, layers: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundDepth {
    pub id: u64,
    pub read_only: bool,
    pub layers: u32,
}

/// Headless [`RenderDevice`] that records every call instead of touching a GPU.
///
/// Used by the test-suite and the trace tool. It tracks how many handles are alive so
/// recreation paths can be checked for leaks, and can be told to reject allocations.
#[derive(Debug)]
pub struct RecordingDevice {
    next_id: u64,
    live: Rc<LiveCounts>,
    allocations_before_failure: Option<usize>,
    commands: Vec<RecordedCommand>,
    bound_colors: Vec<Option<u64>>,
    bound_depth: Option<BoundDepth>,
    sampled: BTreeMap<u32, u64>,
    uniforms: HashMap<u32, Vec<u8>>,
    viewport: Viewport,
    depth_stencil: (DepthStencilDesc, u32),
    rasterizer: RasterizerDesc,
    topology: PrimitiveTopology,
    blend: BlendMode,
}

impl RecordingDevice {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            next_id: 1,
            live: Rc::new(LiveCounts::default()),
            allocations_before_failure: None,
            commands: Vec::new(),
            bound_colors: Vec::new(),
            bound_depth: None,
            sampled: BTreeMap::new(),
            uniforms: HashMap::new(),
            viewport: Viewport::sized(width, height),
            depth_stencil: (DepthStencilDesc::default(), 0),
            rasterizer: RasterizerDesc::default(),
            topology: PrimitiveTopology::default(),
            blend: BlendMode::default(),
        }
    }

    /// Lets the next `count` allocations succeed, then rejects every following one.
    pub fn fail_allocations_after(&mut self, count: usize) {
        self.allocations_before_failure = Some(count);
    }

    pub fn clear_allocation_failure(&mut self) {
        self.allocations_before_failure = None;
    }

    pub fn live_textures(&self) -> usize {
        self.live.textures.get()
    }

    pub fn live_views(&self) -> usize {
        self.live.views.get()
    }

    pub fn commands(&self) -> &[RecordedCommand] {
        &self.commands
    }

    pub fn take_commands(&mut self) -> Vec<RecordedCommand> {
        std::mem::take(&mut self.commands)
    }

    pub fn bound_color_targets(&self) -> &[Option<u64>] {
        &self.bound_colors
    }

    pub fn bound_depth(&self) -> Option<BoundDepth> {
        self.bound_depth
    }

    pub fn sampled_at(&self, stage: u32) -> Option<u64> {
        self.sampled.get(&stage).copied()
    }

    pub fn uniform(&self, slot: u32) -> Option<&[u8]> {
        self.uniforms.get(&slot).map(Vec::as_slice)
    }

    pub fn depth_stencil_state(&self) -> (DepthStencilDesc, u32) {
        self.depth_stencil
    }

    pub fn rasterizer_state(&self) -> RasterizerDesc {
        self.rasterizer
    }

    pub fn topology(&self) -> PrimitiveTopology {
        self.topology
    }

    pub fn blend_mode(&self) -> BlendMode {
        self.blend
    }

    fn allocate(&mut self, kind: ResourceKind, label: &'static str) -> Result<u64, DeviceError> {
        if let Some(remaining) = self.allocations_before_failure.as_mut() {
            if *remaining == 0 {
                let reason = "injected allocation failure".to_string();
                return Err(match kind {
                    ResourceKind::Texture => DeviceError::TextureRejected { label: label.to_string(), reason },
                    _ => DeviceError::ViewRejected { label: label.to_string(), reason },
                });
            }
            *remaining -= 1;
        }
        let id = self.next_id;
        self.next_id += 1;
        let cell = self.live.cell(kind);
        cell.set(cell.get() + 1);
        Ok(id)
    }

    fn view_of(
        &mut self,
        texture: &RecordedResource,
        kind: ResourceKind,
        layers: u32,
        read_only: bool,
    ) -> Result<RecordedResource, DeviceError> {
        let id = self.allocate(kind, texture.label)?;
        Ok(RecordedResource {
            id,
            kind,
            label: texture.label,
            format: texture.format,
            width: texture.width,
            height: texture.height,
            layers,
            read_only,
            live: Rc::clone(&self.live),
        })
    }
}

impl RenderDevice for RecordingDevice {
    type Texture = RecordedResource;
    type RenderView = RecordedResource;
    type DepthView = RecordedResource;
    type SampledView = RecordedResource;

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<RecordedResource, DeviceError> {
        if desc.width == 0 || desc.height == 0 || desc.array_layers == 0 {
            return Err(DeviceError::TextureRejected {
                label: desc.label.to_string(),
                reason: format!("degenerate extent {}x{}x{}", desc.width, desc.height, desc.array_layers),
            });
        }
        let id = self.allocate(ResourceKind::Texture, desc.label)?;
        Ok(RecordedResource {
            id,
            kind: ResourceKind::Texture,
            label: desc.label,
            format: desc.format,
            width: desc.width,
            height: desc.height,
            layers: desc.array_layers,
            read_only: false,
            live: Rc::clone(&self.live),
        })
    }

    fn create_render_view(&mut self, texture: &RecordedResource) -> Result<RecordedResource, DeviceError> {
        if texture.format.is_depth() {
            return Err(DeviceError::ViewRejected {
                label: texture.label.to_string(),
                reason: "depth formats cannot be color targets".to_string(),
            });
        }
        self.view_of(texture, ResourceKind::RenderView, 1, false)
    }

    fn create_depth_view(
        &mut self,
        texture: &RecordedResource,
        desc: &DepthViewDesc,
    ) -> Result<RecordedResource, DeviceError> {
        if !texture.format.is_depth() || desc.first_layer + desc.layer_count > texture.layers {
            return Err(DeviceError::ViewRejected {
                label: texture.label.to_string(),
                reason: "not a depth texture or layer range out of bounds".to_string(),
            });
        }
        self.view_of(texture, ResourceKind::DepthView, desc.layer_count, desc.read_only)
    }

    fn create_sampled_view(
        &mut self,
        texture: &RecordedResource,
        desc: &SampledViewDesc,
    ) -> Result<RecordedResource, DeviceError> {
        if desc.first_layer + desc.layer_count > texture.layers {
            return Err(DeviceError::ViewRejected {
                label: texture.label.to_string(),
                reason: "layer range out of bounds".to_string(),
            });
        }
        self.view_of(texture, ResourceKind::SampledView, desc.layer_count, true)
    }

    fn clear_render_view(&mut self, view: &RecordedResource, color: [f32; 4]) {
        self.commands.push(RecordedCommand::ClearColor { view: view.id, color });
    }

    fn clear_depth_view(&mut self, view: &RecordedResource, depth: f32, stencil: u32) {
        self.commands.push(RecordedCommand::ClearDepth { view: view.id, depth, stencil });
    }

    fn set_render_targets(&mut self, colors: &[Option<&RecordedResource>], depth: Option<&RecordedResource>) {
        self.bound_colors = colors.iter().map(|view| view.map(|v| v.id)).collect();
        self.bound_depth =
            depth.map(|view| BoundDepth { id: view.id, read_only: view.read_only, layers: view.layers });
        self.commands.push(RecordedCommand::SetRenderTargets {
            colors: self.bound_colors.clone(),
            depth: self.bound_depth.map(|d| d.id),
        });
    }

    fn restore_default_targets(&mut self) {
        self.bound_colors.clear();
        self.bound_depth = None;
        self.commands.push(RecordedCommand::RestoreDefaultTargets);
    }

    fn viewport(&self) -> Viewport {
        self.viewport
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = viewport;
        self.commands.push(RecordedCommand::SetViewport(viewport));
    }

    fn set_depth_stencil_state(&mut self, desc: DepthStencilDesc, stencil_ref: u32) {
        self.depth_stencil = (desc, stencil_ref);
        self.commands.push(RecordedCommand::SetDepthStencil { desc, stencil_ref });
    }

    fn set_rasterizer_state(&mut self, desc: RasterizerDesc) {
        self.rasterizer = desc;
        self.commands.push(RecordedCommand::SetRasterizer(desc));
    }

    fn set_primitive_topology(&mut self, topology: PrimitiveTopology) {
        self.topology = topology;
        self.commands.push(RecordedCommand::SetTopology(topology));
    }

    fn set_blend_mode(&mut self, mode: BlendMode) {
        self.blend = mode;
        self.commands.push(RecordedCommand::SetBlend(mode));
    }

    fn bind_sampled_views(&mut self, first_stage: u32, views: &[Option<&RecordedResource>]) {
        for (offset, view) in views.iter().enumerate() {
            let stage = first_stage + offset as u32;
            match view {
                Some(view) => {
                    self.sampled.insert(stage, view.id);
                }
                None => {
                    self.sampled.remove(&stage);
                }
            }
        }
        self.commands.push(RecordedCommand::BindSampled {
            first_stage,
            views: views.iter().map(|view| view.map(|v| v.id)).collect(),
        });
    }

    fn write_uniform(&mut self, slot: u32, bytes: &[u8]) {
        self.uniforms.insert(slot, bytes.to_vec());
        self.commands.push(RecordedCommand::WriteUniform { slot, bytes: bytes.to_vec() });
    }

    fn draw(&mut self, program: Program, vertex_count: u32) -> Result<(), DeviceError> {
        if let Some(&stage) = program.sampled_stages().iter().find(|stage| !self.sampled.contains_key(stage)) {
            return Err(DeviceError::MissingBinding { program, binding: stage });
        }
        let layers = match self.bound_depth {
            Some(depth) if self.bound_colors.iter().all(Option::is_none) => depth.layers,
            _ => 1,
        };
        self.commands.push(RecordedCommand::Draw { program, vertex_count, layers });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::device::TextureUsage;

    fn color_desc() -> TextureDesc {
        TextureDesc::new_2d(
            "color",
            64,
            32,
            TextureFormat::Rgba8Unorm,
            TextureUsage::RENDER_TARGET | TextureUsage::SHADER_RESOURCE,
        )
    }

    #[test]
    fn dropping_handles_releases_them() {
        let mut device = RecordingDevice::new(64, 32);
        let texture = device.create_texture(&color_desc()).expect("texture");
        let view = device.create_render_view(&texture).expect("view");
        assert_eq!((device.live_textures(), device.live_views()), (1, 1));
        drop(view);
        drop(texture);
        assert_eq!((device.live_textures(), device.live_views()), (0, 0));
    }

    #[test]
    fn injected_failure_rejects_after_budget() {
        let mut device = RecordingDevice::new(64, 32);
        device.fail_allocations_after(1);
        let texture = device.create_texture(&color_desc()).expect("first allocation succeeds");
        let err = device.create_render_view(&texture).unwrap_err();
        assert!(matches!(err, DeviceError::ViewRejected { .. }));
    }

    #[test]
    fn draw_without_required_views_is_rejected() {
        let mut device = RecordingDevice::new(64, 32);
        let err = device.draw(Program::GBufferVisualize, 24).unwrap_err();
        assert_eq!(err, DeviceError::MissingBinding { program: Program::GBufferVisualize, binding: 0 });
    }
}
