use glam::Vec3;
use kestrel_deferred::camera3d::{Camera3D, ShadowCamera};
use kestrel_deferred::config::{LightingConfig, ShadowConfig};
use kestrel_deferred::demo_scene;
use kestrel_deferred::light::{AmbientLight, DirectionalLight, PointLight};
use kestrel_deferred::renderer::composition::{
    COMPOSITE_CLEAR_COLOR, LIGHTING_DEPTH_STENCIL, VOLUME_LIGHT_DEPTH_STENCIL, VOLUME_LIGHT_RASTERIZER,
};
use kestrel_deferred::renderer::device::{
    BlendMode, CompareFunction, DepthStencilDesc, PrimitiveTopology, Program, RasterizerDesc, RenderDevice,
    TextureDesc, TextureFormat, TextureUsage,
};
use kestrel_deferred::renderer::recording_device::{RecordedCommand, RecordedResource};
use kestrel_deferred::renderer::{
    CascadedShadowMap, DirectionalLightPass, DirectionalLightUniform, GBuffer, PointLightPass,
    PointLightUniform, RecordingDevice, RenderError, DIRECTIONAL_LIGHT_SLOT, GBUFFER_UNPACK_SLOT,
    POINT_LIGHT_SLOT, SHADOW_MAP_STAGE,
};

const WIDTH: u32 = 640;
const HEIGHT: u32 = 480;

struct Frame {
    device: RecordingDevice,
    output: RecordedResource,
    _output_texture: RecordedResource,
    gbuffer: GBuffer<RecordingDevice>,
    shadows: CascadedShadowMap<RecordingDevice>,
    camera: Camera3D,
    light: DirectionalLight,
    ambient: AmbientLight,
}

impl Frame {
    fn new() -> Self {
        let mut device = RecordingDevice::new(WIDTH, HEIGHT);
        let output_texture = device
            .create_texture(&TextureDesc::new_2d(
                "output",
                WIDTH,
                HEIGHT,
                TextureFormat::Rgba8Unorm,
                TextureUsage::RENDER_TARGET,
            ))
            .expect("output texture");
        let output = device.create_render_view(&output_texture).expect("output view");
        let mut gbuffer = GBuffer::new();
        gbuffer.create(&mut device, WIDTH, HEIGHT).expect("gbuffer");
        let mut shadows = CascadedShadowMap::new(&ShadowConfig::default()).expect("config");
        shadows.create(&mut device).expect("shadows");
        let lighting = LightingConfig::default();
        Self {
            device,
            output,
            _output_texture: output_texture,
            gbuffer,
            shadows,
            camera: Camera3D::new(Vec3::new(0.0, 10.0, -10.0), Vec3::ZERO, 0.785, 0.1, 1000.0)
                .with_viewport(WIDTH, HEIGHT),
            light: DirectionalLight::from_config(&lighting),
            ambient: AmbientLight::from_config(&lighting),
        }
    }

    fn geometry(&mut self) {
        self.shadows.update_parameters(&self.camera, &self.light);
        self.shadows.begin(&mut self.device, true).expect("shadow begin");
        demo_scene::draw_shadow_casters(&mut self.device).expect("casters");
        self.shadows.end(&mut self.device).expect("shadow end");
        self.gbuffer.begin(&mut self.device).expect("gbuffer begin");
        demo_scene::draw_gbuffer(&mut self.device, &self.camera).expect("scene");
        self.gbuffer.end(&mut self.device).expect("gbuffer end");
    }

    fn light_pass(&mut self) -> Result<DirectionalLightUniform, RenderError> {
        DirectionalLightPass::new().render(
            &mut self.device,
            &self.output,
            &self.gbuffer,
            &mut self.shadows,
            &self.camera,
            &self.light,
            &self.ambient,
        )
    }

    fn point_pass(&mut self, lights: &[PointLight]) -> Result<Vec<PointLightUniform>, RenderError> {
        PointLightPass::new().render(&mut self.device, &self.output, &self.gbuffer, &self.camera, lights)
    }
}

fn aisle_lights() -> [PointLight; 2] {
    [
        PointLight::new(Vec3::new(0.0, 2.0, 4.0), 6.0, Vec3::ONE),
        PointLight::new(Vec3::new(4.0, 2.0, 0.0), 3.0, Vec3::new(1.0, 0.0, 0.0)),
    ]
}

#[test]
fn lighting_draw_sees_gbuffer_shadows_and_stencil() {
    let mut frame = Frame::new();
    frame.geometry();
    frame.device.take_commands();
    let uniform = frame.light_pass().expect("lighting");

    let commands = frame.device.take_commands();
    let draw_at = commands
        .iter()
        .position(|cmd| matches!(cmd, RecordedCommand::Draw { program: Program::DirectionalLight, .. }))
        .expect("directional light drawn");
    let before = &commands[..draw_at];

    let cleared = before.iter().any(|cmd| {
        matches!(cmd, RecordedCommand::ClearColor { view, color }
            if *view == frame.output.id() && *color == COMPOSITE_CLEAR_COLOR)
    });
    assert!(cleared, "output cleared before shading");

    let stencil = before.iter().rev().find_map(|cmd| match cmd {
        RecordedCommand::SetDepthStencil { desc, stencil_ref } => Some((*desc, *stencil_ref)),
        _ => None,
    });
    let (desc, stencil_ref) = stencil.expect("depth stencil state set");
    assert_eq!(desc, LIGHTING_DEPTH_STENCIL);
    assert!(!desc.depth_write);
    assert_eq!(desc.stencil.map(|s| s.compare), Some(CompareFunction::Equal));
    assert_eq!(stencil_ref, 1);

    let topology = before.iter().rev().find_map(|cmd| match cmd {
        RecordedCommand::SetTopology(topology) => Some(*topology),
        _ => None,
    });
    assert_eq!(topology, Some(PrimitiveTopology::TriangleStrip));
    assert!(matches!(
        commands[draw_at],
        RecordedCommand::Draw { vertex_count: 4, .. }
    ));

    let targets = before.iter().rev().find_map(|cmd| match cmd {
        RecordedCommand::SetRenderTargets { colors, depth } => Some((colors.clone(), *depth)),
        _ => None,
    });
    let (colors, depth) = targets.expect("targets bound");
    assert_eq!(colors, vec![Some(frame.output.id())]);
    let read_only = frame.gbuffer.read_only_depth_view().expect("read-only view");
    assert_eq!(depth, Some(read_only.id()));

    let light_bytes = frame.device.uniform(DIRECTIONAL_LIGHT_SLOT).expect("light uniform");
    assert_eq!(light_bytes, bytemuck::bytes_of(&uniform));
    assert!(frame.device.uniform(GBUFFER_UNPACK_SLOT).is_some());
    assert_eq!(uniform.eye_position[..3], frame.camera.eye_position().to_array());
}

#[test]
fn lighting_restores_state_and_unbinds_inputs() {
    let mut frame = Frame::new();
    frame.geometry();
    frame.light_pass().expect("lighting");
    for stage in 0..=SHADOW_MAP_STAGE {
        assert_eq!(frame.device.sampled_at(stage), None, "stage {stage} left bound");
    }
    assert_eq!(frame.device.topology(), PrimitiveTopology::TriangleList);
    assert_eq!(frame.device.depth_stencil_state().1, 0);
}

#[test]
fn lighting_requires_fresh_cascades() {
    let mut frame = Frame::new();
    assert!(matches!(frame.light_pass(), Err(RenderError::StaleCascades)));
    frame.geometry();
    frame.light_pass().expect("first lighting pass");
    assert!(matches!(frame.light_pass(), Err(RenderError::StaleCascades)));
}

#[test]
fn lighting_during_geometry_pass_is_rejected() {
    let mut frame = Frame::new();
    frame.shadows.update_parameters(&frame.camera, &frame.light);
    frame.gbuffer.begin(&mut frame.device).expect("gbuffer begin");
    assert!(matches!(frame.light_pass(), Err(RenderError::PassAlreadyActive { .. })));
}

#[test]
fn uniform_carries_cascade_tables() {
    let mut frame = Frame::new();
    frame.geometry();
    let cascades = *frame.shadows.current_frame().expect("fresh");
    let uniform = frame.light_pass().expect("lighting");
    assert_eq!(uniform.cascade_offset_x, cascades.offset_x);
    assert_eq!(uniform.cascade_offset_y, cascades.offset_y);
    assert_eq!(uniform.cascade_scale, cascades.scale);
    assert_eq!(uniform.world_to_shadow, cascades.basis.world_to_shadow.to_cols_array_2d());
    let size = ShadowConfig::default().map_size as f32;
    assert_eq!(uniform.specular_shadow[2], size);
    assert_eq!(uniform.specular_shadow[3], 1.0 / size);
}

#[test]
fn point_lights_blend_volumes_onto_the_lit_output() {
    let mut frame = Frame::new();
    frame.geometry();
    frame.light_pass().expect("directional");
    frame.device.take_commands();
    let lights = aisle_lights();
    let uniforms = frame.point_pass(&lights).expect("point lights");
    assert_eq!(uniforms.len(), lights.len());

    let commands = frame.device.take_commands();
    assert!(
        !commands.iter().any(|cmd| matches!(cmd, RecordedCommand::ClearColor { .. })),
        "point lights accumulate onto the directional result"
    );
    let first_draw = commands
        .iter()
        .position(|cmd| matches!(cmd, RecordedCommand::Draw { program: Program::PointLight, .. }))
        .expect("volume drawn");
    let setup = &commands[..first_draw];
    assert!(setup.contains(&RecordedCommand::SetBlend(BlendMode::Additive)));
    assert!(setup.contains(&RecordedCommand::SetRasterizer(VOLUME_LIGHT_RASTERIZER)));
    assert!(setup.contains(&RecordedCommand::SetDepthStencil {
        desc: VOLUME_LIGHT_DEPTH_STENCIL,
        stencil_ref: 1,
    }));
    let read_only = frame.gbuffer.read_only_depth_view().expect("read-only view").id();
    assert!(setup.contains(&RecordedCommand::SetRenderTargets {
        colors: vec![Some(frame.output.id())],
        depth: Some(read_only),
    }));

    // each volume draw sees its own light block
    let mut pending: Option<Vec<u8>> = None;
    let mut drawn = Vec::new();
    for cmd in &commands {
        match cmd {
            RecordedCommand::WriteUniform { slot, bytes } if *slot == POINT_LIGHT_SLOT => {
                pending = Some(bytes.clone());
            }
            RecordedCommand::Draw { program: Program::PointLight, vertex_count, .. } => {
                assert_eq!(*vertex_count, 36);
                drawn.push(pending.take().expect("light block before draw"));
            }
            _ => {}
        }
    }
    let expected: Vec<Vec<u8>> = uniforms.iter().map(|u| bytemuck::bytes_of(u).to_vec()).collect();
    assert_eq!(drawn, expected);
    assert_eq!(uniforms[1].range_rcp[0], 1.0 / 3.0);
}

#[test]
fn point_lights_restore_default_state() {
    let mut frame = Frame::new();
    frame.geometry();
    frame.light_pass().expect("directional");
    frame.point_pass(&aisle_lights()).expect("point lights");
    assert_eq!(frame.device.blend_mode(), BlendMode::Replace);
    assert_eq!(frame.device.rasterizer_state(), RasterizerDesc::default());
    assert_eq!(frame.device.depth_stencil_state(), (DepthStencilDesc::default(), 0));
    for stage in 0..SHADOW_MAP_STAGE {
        assert_eq!(frame.device.sampled_at(stage), None, "stage {stage} left bound");
    }
}

#[test]
fn point_lights_need_a_finished_gbuffer() {
    let mut frame = Frame::new();
    frame.gbuffer.begin(&mut frame.device).expect("gbuffer begin");
    assert!(matches!(
        frame.point_pass(&aisle_lights()),
        Err(RenderError::PassAlreadyActive { .. })
    ));
    frame.gbuffer.end(&mut frame.device).expect("gbuffer end");

    frame.device.take_commands();
    assert!(frame.point_pass(&[]).expect("no lights").is_empty());
    assert!(frame.device.commands().is_empty());
}
