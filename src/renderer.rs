pub mod cascade;
pub mod composition;
pub mod depth_buffer_array;
pub mod device;
pub mod gbuffer;
pub mod recording_device;
pub mod shadow_pass;
pub mod wgpu_device;

pub use cascade::{
    cascade_needs_update, CascadeBounds, CascadeFittingStrategy, CascadeFrame, CascadeSolver, CascadeTransform,
    FrustumBoundsFit, ShadowSpaceBasis, StabilizedFit, CASCADE_COUNT, MAX_CASCADES,
};
pub use composition::{DirectionalLightPass, DirectionalLightUniform, PointLightPass, PointLightUniform};
pub use depth_buffer_array::DepthBufferArray;
pub use device::{DeviceError, RenderDevice};
pub use gbuffer::{GBuffer, GBufferUnpackUniform};
pub use recording_device::RecordingDevice;
pub use shadow_pass::{CascadeViewProjUniform, CascadedShadowMap};
pub use wgpu_device::WgpuDevice;

/// Per-frame camera block read by the scene programs.
pub const FRAME_UNIFORM_SLOT: u32 = 0;
pub const DIRECTIONAL_LIGHT_SLOT: u32 = 5;
pub const CASCADE_VIEW_PROJ_SLOT: u32 = 6;
pub const GBUFFER_UNPACK_SLOT: u32 = 7;
pub const POINT_LIGHT_SLOT: u32 = 8;

/// First of the four consecutive G-buffer texture stages.
pub const GBUFFER_FIRST_STAGE: u32 = 0;
pub const SHADOW_MAP_STAGE: u32 = 4;

/// Lifecycle shared by every target-owning pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PassState {
    #[default]
    Uncreated,
    Created,
    InPass,
}

impl PassState {
    pub fn is_created(self) -> bool {
        !matches!(self, PassState::Uncreated)
    }

    /// `Created -> InPass`.
    pub fn begin(&mut self, component: &'static str) -> Result<(), RenderError> {
        match *self {
            PassState::Uncreated => Err(RenderError::NotCreated { component }),
            PassState::InPass => Err(RenderError::PassAlreadyActive { component }),
            PassState::Created => {
                *self = PassState::InPass;
                Ok(())
            }
        }
    }

    /// `InPass -> Created`.
    pub fn end(&mut self, component: &'static str) -> Result<(), RenderError> {
        match *self {
            PassState::InPass => {
                *self = PassState::Created;
                Ok(())
            }
            _ => Err(RenderError::NoActivePass { component }),
        }
    }

    pub fn require_created(self, component: &'static str) -> Result<(), RenderError> {
        match self {
            PassState::Uncreated => Err(RenderError::NotCreated { component }),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("{component} used before a successful create")]
    NotCreated { component: &'static str },
    #[error("{component} begin called while a pass is already active")]
    PassAlreadyActive { component: &'static str },
    #[error("{component} end called without a matching begin")]
    NoActivePass { component: &'static str },
    #[error("cascade transforms are stale; call update_parameters before rendering this frame")]
    StaleCascades,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to allocate {what}")]
    Allocation {
        what: &'static str,
        #[source]
        source: DeviceError,
    },
    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl RenderError {
    pub(crate) fn allocation(what: &'static str) -> impl FnOnce(DeviceError) -> RenderError {
        move |source| RenderError::Allocation { what, source }
    }
}
