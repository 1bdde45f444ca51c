pub mod camera3d;
pub mod cli;
pub mod config;
pub mod demo_scene;
pub mod light;
pub mod renderer;

pub use camera3d::{Camera3D, OrbitCamera, ShadowCamera};
pub use config::{CascadeFitMode, RenderConfig, RenderConfigOverrides};
pub use light::{AmbientLight, DirectionalLight, PointLight};
