use super::device::{
    DepthViewDesc, PrimitiveTopology, Program, RenderDevice, SampledViewDesc, TextureDesc, TextureFormat,
    TextureUsage, Viewport,
};
use super::{PassState, RenderError};

const COMPONENT: &str = "depth buffer array";
pub const DEPTH_ARRAY_FORMAT: TextureFormat = TextureFormat::Depth32Float;

struct DepthArrayResources<D: RenderDevice> {
    // Views are declared first so they drop before the texture they reference.
    depth_view: D::DepthView,
    sampled_view: D::SampledView,
    debug_view: D::SampledView,
    _texture: D::Texture,
}

/// Square layered depth target rendered in one pass and sampled as an array.
pub struct DepthBufferArray<D: RenderDevice> {
    size: u32,
    layers: u32,
    state: PassState,
    resources: Option<DepthArrayResources<D>>,
    saved_viewport: Option<Viewport>,
}

impl<D: RenderDevice> Default for DepthBufferArray<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: RenderDevice> DepthBufferArray<D> {
    pub fn new() -> Self {
        Self { size: 0, layers: 0, state: PassState::Uncreated, resources: None, saved_viewport: None }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn layers(&self) -> u32 {
        self.layers
    }

    pub fn state(&self) -> PassState {
        self.state
    }

    pub fn is_created(&self) -> bool {
        self.state.is_created()
    }

    /// Allocates `layers` square slices, replacing any previous set.
    pub fn create(&mut self, device: &mut D, size: u32, layers: u32) -> Result<(), RenderError> {
        if self.state == PassState::InPass {
            return Err(RenderError::PassAlreadyActive { component: COMPONENT });
        }
        self.release();
        let desc = TextureDesc {
            label: "Depth Buffer Array",
            width: size,
            height: size,
            array_layers: layers,
            format: DEPTH_ARRAY_FORMAT,
            usage: TextureUsage::DEPTH_STENCIL | TextureUsage::SHADER_RESOURCE,
        };
        let texture = device.create_texture(&desc).map_err(RenderError::allocation("depth array texture"))?;
        let depth_view = device
            .create_depth_view(&texture, &DepthViewDesc::layered(layers))
            .map_err(RenderError::allocation("depth array target view"))?;
        let sampled_view = device
            .create_sampled_view(&texture, &SampledViewDesc::array(layers))
            .map_err(RenderError::allocation("depth array sampled view"))?;
        let debug_view = device
            .create_sampled_view(&texture, &SampledViewDesc::array(layers))
            .map_err(RenderError::allocation("depth array debug view"))?;

        self.resources = Some(DepthArrayResources { depth_view, sampled_view, debug_view, _texture: texture });
        self.size = size;
        self.layers = layers;
        self.state = PassState::Created;
        log::info!("[shadow] depth buffer array created: {size}x{size}x{layers}");
        Ok(())
    }

    /// Drops every GPU handle; the buffer returns to the uncreated state.
    pub fn release(&mut self) {
        self.resources = None;
        self.saved_viewport = None;
        self.state = PassState::Uncreated;
    }

    /// Binds every layer as the depth target, optionally clearing to the far plane.
    pub fn begin(&mut self, device: &mut D, clear: bool) -> Result<(), RenderError> {
        self.state.begin(COMPONENT)?;
        let resources = self.resources.as_ref().ok_or(RenderError::NotCreated { component: COMPONENT })?;
        self.saved_viewport = Some(device.viewport());
        device.set_render_targets(&[], Some(&resources.depth_view));
        device.set_viewport(Viewport::sized(self.size, self.size));
        if clear {
            device.clear_depth_view(&resources.depth_view, 1.0, 0);
        }
        Ok(())
    }

    pub fn end(&mut self, device: &mut D) -> Result<(), RenderError> {
        self.state.end(COMPONENT)?;
        device.restore_default_targets();
        if let Some(viewport) = self.saved_viewport.take() {
            device.set_viewport(viewport);
        }
        Ok(())
    }

    pub fn bind(&self, device: &mut D, stage: u32) -> Result<(), RenderError> {
        let resources = self.readable()?;
        device.bind_sampled_views(stage, &[Some(&resources.sampled_view)]);
        Ok(())
    }

    pub fn unbind(&self, device: &mut D, stage: u32) {
        device.bind_sampled_views(stage, &[None]);
    }

    /// Debug view: every layer tiled across the current target.
    pub fn render(&self, device: &mut D) -> Result<(), RenderError> {
        let resources = self.readable()?;
        device.bind_sampled_views(0, &[Some(&resources.debug_view)]);
        device.set_primitive_topology(PrimitiveTopology::TriangleList);
        device.draw(Program::DepthArrayVisualize, 6 * self.layers)?;
        device.bind_sampled_views(0, &[None]);
        Ok(())
    }

    pub fn depth_view(&self) -> Option<&D::DepthView> {
        self.resources.as_ref().map(|resources| &resources.depth_view)
    }

    pub fn sampled_view(&self) -> Option<&D::SampledView> {
        self.resources.as_ref().map(|resources| &resources.sampled_view)
    }

    fn readable(&self) -> Result<&DepthArrayResources<D>, RenderError> {
        if self.state == PassState::InPass {
            return Err(RenderError::PassAlreadyActive { component: COMPONENT });
        }
        self.resources.as_ref().ok_or(RenderError::NotCreated { component: COMPONENT })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::recording_device::{RecordedCommand, RecordingDevice};

    #[test]
    fn begin_binds_all_layers_and_clears_to_far() {
        let mut device = RecordingDevice::new(1280, 1024);
        let mut array = DepthBufferArray::new();
        array.create(&mut device, 512, 3).expect("create");
        device.take_commands();

        array.begin(&mut device, true).expect("begin");
        let bound = device.bound_depth().expect("depth bound");
        assert_eq!(bound.layers, 3);
        assert!(!bound.read_only);
        assert_eq!(device.viewport(), Viewport::sized(512, 512));
        let cleared = device
            .commands()
            .iter()
            .any(|cmd| matches!(cmd, RecordedCommand::ClearDepth { depth, .. } if *depth == 1.0));
        assert!(cleared, "begin should clear depth to the far plane");

        array.end(&mut device).expect("end");
        assert_eq!(device.bound_depth(), None);
        assert_eq!(device.viewport(), Viewport::sized(1280, 1024));
    }

    #[test]
    fn bind_inside_pass_is_rejected() {
        let mut device = RecordingDevice::new(64, 64);
        let mut array = DepthBufferArray::new();
        assert!(matches!(array.bind(&mut device, 4), Err(RenderError::NotCreated { .. })));
        array.create(&mut device, 128, 3).expect("create");
        array.begin(&mut device, false).expect("begin");
        assert!(matches!(array.bind(&mut device, 4), Err(RenderError::PassAlreadyActive { .. })));
        array.end(&mut device).expect("end");
        array.bind(&mut device, 4).expect("bind after end");
        assert!(device.sampled_at(4).is_some());
    }

    #[test]
    fn release_drops_every_handle() {
        let mut device = RecordingDevice::new(64, 64);
        let mut array = DepthBufferArray::new();
        array.create(&mut device, 128, 3).expect("create");
        assert_eq!((device.live_textures(), device.live_views()), (1, 3));
        array.release();
        assert_eq!((device.live_textures(), device.live_views()), (0, 0));
        assert!(!array.is_created());
    }
}
