use glam::Vec3;
use kestrel_deferred::camera3d::Camera3D;
use kestrel_deferred::renderer::device::{CompareFunction, PrimitiveTopology, StencilOp};
use kestrel_deferred::renderer::gbuffer::{GEOMETRY_DEPTH_STENCIL, GEOMETRY_STENCIL_REF};
use kestrel_deferred::renderer::recording_device::RecordedCommand;
use kestrel_deferred::renderer::{
    GBuffer, GBufferUnpackUniform, PassState, RecordingDevice, RenderError, GBUFFER_UNPACK_SLOT,
};

fn created(width: u32, height: u32) -> (RecordingDevice, GBuffer<RecordingDevice>) {
    let mut device = RecordingDevice::new(width, height);
    let mut gbuffer = GBuffer::new();
    gbuffer.create(&mut device, width, height).expect("create gbuffer");
    (device, gbuffer)
}

#[test]
fn create_allocates_four_textures_and_every_view() {
    let (device, gbuffer) = created(512, 512);
    assert_eq!(device.live_textures(), 4);
    // two depth views, three render targets, four shader views
    assert_eq!(device.live_views(), 9);
    assert_eq!(gbuffer.state(), PassState::Created);
    assert_eq!(gbuffer.dimensions(), (512, 512));
}

#[test]
fn begin_binds_three_targets_and_marks_stencil() {
    let (mut device, mut gbuffer) = created(320, 200);
    device.take_commands();
    gbuffer.begin(&mut device).expect("begin");

    let commands = device.take_commands();
    let depth_clear = commands.iter().find_map(|cmd| match cmd {
        RecordedCommand::ClearDepth { depth, stencil, .. } => Some((*depth, *stencil)),
        _ => None,
    });
    assert_eq!(depth_clear, Some((1.0, 0)));
    let color_clears =
        commands.iter().filter(|cmd| matches!(cmd, RecordedCommand::ClearColor { .. })).count();
    assert_eq!(color_clears, 3);

    assert_eq!(device.bound_color_targets().iter().flatten().count(), 3);
    let depth = device.bound_depth().expect("depth bound");
    assert!(!depth.read_only);

    let (state, stencil_ref) = device.depth_stencil_state();
    assert_eq!(state, GEOMETRY_DEPTH_STENCIL);
    assert_eq!(stencil_ref, GEOMETRY_STENCIL_REF);
    let stencil = state.stencil.expect("stencil enabled");
    assert_eq!(stencil.compare, CompareFunction::Always);
    assert_eq!(stencil.pass_op, StencilOp::Replace);
    assert_eq!(gbuffer.state(), PassState::InPass);
}

#[test]
fn end_leaves_only_read_only_depth_bound() {
    let (mut device, mut gbuffer) = created(320, 200);
    gbuffer.begin(&mut device).expect("begin");
    let writable = device.bound_depth().expect("depth bound").id;
    gbuffer.end(&mut device).expect("end");

    assert!(device.bound_color_targets().iter().all(Option::is_none));
    let depth = device.bound_depth().expect("read-only depth bound");
    assert!(depth.read_only);
    assert_ne!(depth.id, writable);
    assert_eq!(device.topology(), PrimitiveTopology::TriangleList);
    assert_eq!(gbuffer.state(), PassState::Created);
}

#[test]
fn lifecycle_misuse_is_reported() {
    let mut device = RecordingDevice::new(64, 64);
    let mut gbuffer = GBuffer::<RecordingDevice>::new();
    assert!(matches!(gbuffer.begin(&mut device), Err(RenderError::NotCreated { .. })));
    assert!(matches!(gbuffer.end(&mut device), Err(RenderError::NoActivePass { .. })));
    assert!(matches!(gbuffer.sampled_views(), Err(RenderError::NotCreated { .. })));

    gbuffer.create(&mut device, 64, 64).expect("create");
    assert!(matches!(gbuffer.end(&mut device), Err(RenderError::NoActivePass { .. })));
    gbuffer.begin(&mut device).expect("begin");
    assert!(matches!(gbuffer.begin(&mut device), Err(RenderError::PassAlreadyActive { .. })));
    assert!(matches!(gbuffer.create(&mut device, 128, 128), Err(RenderError::PassAlreadyActive { .. })));
    assert!(matches!(gbuffer.read_only_depth_view(), Err(RenderError::PassAlreadyActive { .. })));
    gbuffer.end(&mut device).expect("end");
    assert!(gbuffer.read_only_depth_view().is_ok());
}

#[test]
fn resize_round_trip_does_not_leak() {
    let (mut device, mut gbuffer) = created(512, 512);
    gbuffer.create(&mut device, 1024, 1024).expect("grow");
    assert_eq!((device.live_textures(), device.live_views()), (4, 9));
    assert_eq!(gbuffer.dimensions(), (1024, 1024));
    gbuffer.create(&mut device, 512, 512).expect("shrink");
    assert_eq!((device.live_textures(), device.live_views()), (4, 9));

    gbuffer.release();
    assert_eq!((device.live_textures(), device.live_views()), (0, 0));
    assert!(!gbuffer.is_created());
}

#[test]
fn failed_allocation_leaves_nothing_behind() {
    for budget in [0, 2, 4, 7, 12] {
        let mut device = RecordingDevice::new(256, 256);
        let mut gbuffer = GBuffer::new();
        device.fail_allocations_after(budget);
        let err = gbuffer.create(&mut device, 256, 256).expect_err("allocation should fail");
        assert!(matches!(err, RenderError::Allocation { .. }), "budget {budget}: {err:?}");
        assert_eq!((device.live_textures(), device.live_views()), (0, 0), "budget {budget}");
        assert_eq!(gbuffer.state(), PassState::Uncreated);

        device.clear_allocation_failure();
        gbuffer.create(&mut device, 256, 256).expect("retry succeeds");
        assert_eq!(device.live_textures(), 4);
    }
}

#[test]
fn failed_resize_releases_previous_attachments() {
    let (mut device, mut gbuffer) = created(256, 256);
    device.fail_allocations_after(3);
    assert!(gbuffer.create(&mut device, 512, 512).is_err());
    assert_eq!((device.live_textures(), device.live_views()), (0, 0));
    assert!(matches!(gbuffer.begin(&mut device), Err(RenderError::NotCreated { .. })));
}

#[test]
fn prepare_for_unpack_uploads_camera_terms() {
    let (mut device, gbuffer) = created(1280, 1024);
    let fov = std::f32::consts::FRAC_PI_4;
    let camera =
        Camera3D::new(Vec3::new(0.0, 10.0, -10.0), Vec3::ZERO, fov, 0.1, 1000.0).with_viewport(1280, 1024);
    let uniform = gbuffer.prepare_for_unpack(&mut device, &camera).expect("prepare");
    assert_eq!(uniform, GBufferUnpackUniform::from_camera(&camera));
    assert_eq!(device.uniform(GBUFFER_UNPACK_SLOT), Some(bytemuck::bytes_of(&uniform)));
    // depth 0 sits on the near plane
    assert!((uniform.linear_depth(0.0) - 0.1).abs() < 1e-4);
    assert!((uniform.linear_depth(1.0) - 1000.0).abs() < 50.0);
}
