//! Replays a scripted camera dolly through the cascade solver and prints a JSON report
//! comparing the stabilized and frustum-bounds fits. No GPU is needed.

use anyhow::{Context, Result};
use glam::Vec4;
use kestrel_deferred::camera3d::Camera3D;
use kestrel_deferred::cli::CliOverrides;
use kestrel_deferred::config::{CascadeFitMode, RenderConfig, ShadowConfig};
use kestrel_deferred::light::DirectionalLight;
use kestrel_deferred::renderer::{CascadeFrame, CascadeSolver, CASCADE_COUNT};
use serde::Serialize;
use std::process;

const SAMPLE_EVERY: u32 = 10;
const DOLLY_STEP: f32 = 0.37;
const YAW_STEP: f32 = 0.004;
const PHASE_EPSILON: f32 = 1e-3;

fn main() {
    if let Err(err) = run() {
        eprintln!("cascade_trace error: {err:?}");
        process::exit(1);
    }
}

#[derive(Serialize)]
struct TraceReport {
    map_size: u32,
    splits: [f32; CASCADE_COUNT],
    frames: u32,
    strategies: Vec<StrategyReport>,
}

#[derive(Serialize)]
struct StrategyReport {
    mode: CascadeFitModeName,
    /// Frames where a cascade's texel grid slid by a fraction of a texel.
    shimmer_frames: [u32; CASCADE_COUNT],
    resnaps: [u32; CASCADE_COUNT],
    max_half_extent: [f32; CASCADE_COUNT],
    samples: Vec<FrameSample>,
}

#[derive(Serialize)]
struct FrameSample {
    frame: u32,
    eye: [f32; 3],
    shadow_radius: f32,
    offset_x: [f32; CASCADE_COUNT],
    offset_y: [f32; CASCADE_COUNT],
    scale: [f32; CASCADE_COUNT],
}

#[derive(Serialize)]
#[serde(rename_all = "snake_case")]
enum CascadeFitModeName {
    Stabilized,
    FrustumBounds,
}

impl From<CascadeFitMode> for CascadeFitModeName {
    fn from(mode: CascadeFitMode) -> Self {
        match mode {
            CascadeFitMode::Stabilized => CascadeFitModeName::Stabilized,
            CascadeFitMode::FrustumBounds => CascadeFitModeName::FrustumBounds,
        }
    }
}

fn run() -> Result<()> {
    let cli = CliOverrides::parse_from_env()?;
    let mut config = RenderConfig::load_or_default(cli.config_path());
    let frames = cli.frames();
    config.apply_overrides(&cli.into_config_overrides());
    config.shadow.validate().context("Invalid shadow settings")?;

    let light = DirectionalLight::from_config(&config.lighting);
    let base_camera =
        Camera3D::from_config(&config.camera).with_viewport(config.viewport.width, config.viewport.height);

    let strategies = [CascadeFitMode::Stabilized, CascadeFitMode::FrustumBounds]
        .into_iter()
        .map(|mode| trace(&config.shadow, mode, &base_camera, &light, frames))
        .collect::<Result<Vec<_>>>()?;

    let report =
        TraceReport { map_size: config.shadow.map_size, splits: config.shadow.splits, frames, strategies };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn dolly(base: &Camera3D, frame: u32) -> Camera3D {
    let t = frame as f32;
    let forward = base.direction();
    let mut camera = base.clone();
    camera.position = base.position + forward * (t * DOLLY_STEP);
    let yaw = glam::Quat::from_rotation_y(t * YAW_STEP);
    camera.target = camera.position + yaw * forward;
    camera
}

/// Sub-texel position of the world origin inside each cascade.
fn texel_phase(frame: &CascadeFrame, map_size: u32) -> [[f32; 2]; CASCADE_COUNT] {
    let half_size = map_size as f32 * 0.5;
    frame.world_to_cascade().map(|matrix| {
        let clip = matrix * Vec4::W;
        let texel = clip.truncate().truncate() * half_size;
        [texel.x.rem_euclid(1.0), texel.y.rem_euclid(1.0)]
    })
}

fn phase_moved(prev: [f32; 2], next: [f32; 2]) -> bool {
    prev.iter().zip(next).any(|(a, b)| {
        let delta = (a - b).abs();
        delta.min(1.0 - delta) > PHASE_EPSILON
    })
}

fn trace(
    shadow: &ShadowConfig,
    mode: CascadeFitMode,
    base: &Camera3D,
    light: &DirectionalLight,
    frames: u32,
) -> Result<StrategyReport> {
    let mut config = shadow.clone();
    config.fit_mode = mode;
    let mut solver = CascadeSolver::new(&config)?;
    let mut report = StrategyReport {
        mode: mode.into(),
        shimmer_frames: [0; CASCADE_COUNT],
        resnaps: [0; CASCADE_COUNT],
        max_half_extent: [0.0; CASCADE_COUNT],
        samples: Vec::new(),
    };
    let mut previous: Option<CascadeFrame> = None;
    for frame_index in 0..frames {
        let camera = dolly(base, frame_index);
        let frame = solver.update(&camera, light);
        for (idx, cascade) in frame.cascades.iter().enumerate() {
            let extent = cascade.world_half_extent(&frame.basis);
            report.max_half_extent[idx] = report.max_half_extent[idx].max(extent);
        }
        if let Some(prev) = previous {
            let before = texel_phase(&prev, config.map_size);
            let after = texel_phase(&frame, config.map_size);
            for idx in 0..CASCADE_COUNT {
                if phase_moved(before[idx], after[idx]) {
                    report.shimmer_frames[idx] += 1;
                }
                let moved_x = prev.offset_x[idx] != frame.offset_x[idx];
                if moved_x || prev.offset_y[idx] != frame.offset_y[idx] {
                    report.resnaps[idx] += 1;
                }
            }
        }
        if frame_index % SAMPLE_EVERY == 0 {
            report.samples.push(FrameSample {
                frame: frame_index,
                eye: camera.position.to_array(),
                shadow_radius: frame.basis.radius,
                offset_x: first_cascades(frame.offset_x),
                offset_y: first_cascades(frame.offset_y),
                scale: first_cascades(frame.scale),
            });
        }
        previous = Some(frame);
    }
    Ok(report)
}

fn first_cascades(values: [f32; 4]) -> [f32; CASCADE_COUNT] {
    [values[0], values[1], values[2]]
}
