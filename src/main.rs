use anyhow::{Context, Result};
use glam::Vec2;
use kestrel_deferred::camera3d::{Camera3D, OrbitCamera};
use kestrel_deferred::cli::CliOverrides;
use kestrel_deferred::config::RenderConfig;
use kestrel_deferred::demo_scene;
use kestrel_deferred::light::{point_lights_from_config, AmbientLight, DirectionalLight};
use kestrel_deferred::renderer::device::{RenderDevice, TextureDesc, TextureFormat, TextureUsage};
use kestrel_deferred::renderer::{
    CascadeFrame, CascadedShadowMap, DirectionalLightPass, GBuffer, PointLightPass, WgpuDevice,
    CASCADE_COUNT,
};

const ORBIT_STEP_RADIANS: f32 = 0.01;
const REPORT_EVERY: u32 = 30;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = match CliOverrides::parse_from_env() {
        Ok(parsed) => parsed,
        Err(err) => {
            eprintln!("[cli] {err}");
            std::process::exit(2);
        }
    };
    if let Err(err) = pollster::block_on(run(cli)) {
        eprintln!("Application error: {err:?}");
        std::process::exit(1);
    }
}

async fn run(cli: CliOverrides) -> Result<()> {
    let mut config = RenderConfig::load_or_default(cli.config_path());
    let frames = cli.frames();
    let overrides = cli.into_config_overrides();
    if !overrides.is_empty() {
        log::info!("[cli] overrides applied: {}", overrides.applied_fields().join(", "));
    }
    config.apply_overrides(&overrides);
    config.shadow.validate().context("Invalid shadow settings after overrides")?;

    let (width, height) = (config.viewport.width, config.viewport.height);
    let mut device = WgpuDevice::new_headless(width, height).await?;

    let mut gbuffer = GBuffer::new();
    gbuffer.create(&mut device, width, height)?;
    let mut shadows = CascadedShadowMap::new(&config.shadow)?;
    shadows.create(&mut device)?;

    let composite_texture = device.create_texture(&TextureDesc::new_2d(
        "Composite",
        width,
        height,
        TextureFormat::Rgba8Unorm,
        TextureUsage::RENDER_TARGET | TextureUsage::SHADER_RESOURCE,
    ))?;
    let composite = device.create_render_view(&composite_texture)?;

    let light = DirectionalLight::from_config(&config.lighting);
    let ambient = AmbientLight::from_config(&config.lighting);
    let point_lights = point_lights_from_config(&config.lighting);
    let lighting = DirectionalLightPass::new();
    let point_lighting = PointLightPass::new();
    let base_camera = Camera3D::from_config(&config.camera);
    let mut orbit = OrbitCamera::from_camera(&base_camera);

    let mut previous: Option<CascadeFrame> = None;
    let mut resnaps = [0u32; CASCADE_COUNT];
    for frame_index in 0..frames {
        orbit.orbit(Vec2::new(ORBIT_STEP_RADIANS, 0.0));
        let camera = orbit
            .to_camera(base_camera.fov_y_radians, base_camera.near, base_camera.far)
            .with_viewport(width, height);

        let cascades = *shadows.update_parameters(&camera, &light);
        if let Some(prev) = previous {
            for (idx, count) in resnaps.iter_mut().enumerate() {
                let moved_x = prev.offset_x[idx] != cascades.offset_x[idx];
                if moved_x || prev.offset_y[idx] != cascades.offset_y[idx] {
                    *count += 1;
                }
            }
        }
        previous = Some(cascades);

        shadows.begin(&mut device, true)?;
        demo_scene::draw_shadow_casters(&mut device)?;
        shadows.end(&mut device)?;

        gbuffer.begin(&mut device)?;
        demo_scene::draw_gbuffer(&mut device, &camera)?;
        gbuffer.end(&mut device)?;

        lighting.render(&mut device, &composite, &gbuffer, &mut shadows, &camera, &light, &ambient)?;
        point_lighting.render(&mut device, &composite, &gbuffer, &camera, &point_lights)?;

        device.restore_default_targets();
        gbuffer.render(&mut device)?;
        shadows.render(&mut device)?;

        if frame_index % REPORT_EVERY == 0 {
            let extents: Vec<String> = cascades
                .cascades
                .iter()
                .map(|cascade| format!("{:.2}", cascade.world_half_extent(&cascades.basis)))
                .collect();
            log::info!(
                "[frame {frame_index}] shadow radius {:.2}, cascade half extents [{}], resnaps {:?}",
                cascades.basis.radius,
                extents.join(", "),
                resnaps
            );
        }
    }
    device.wait_idle()?;
    log::info!("{} point lights per frame", point_lights.len());

    log::info!(
        "Rendered {frames} frames on {} ({:?}); {} draws, {} pipelines, cascade resnaps {:?} ({})",
        device.adapter_info().name,
        device.adapter_info().backend,
        device.draw_calls(),
        device.pipeline_count(),
        resnaps,
        shadows.fit_mode().label()
    );
    Ok(())
}
