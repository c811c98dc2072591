pub mod backend;
pub mod compose;
pub mod depth;
pub mod fov;
pub mod light;
pub mod mask_atlas;
pub mod occlusion;
pub mod post;
pub mod recorder;
pub mod selection;
mod wgpu_backend;

pub use backend::{
    BackendCapabilities, BlurPass, BlurTarget, BufferCapacities, DepthTarget, LightingBackend,
    ShadowMode, TargetSizes,
};
pub use compose::LightBatch;
pub use light::{LightVertex, PointLight};
pub use mask_atlas::{LightMaskAtlas, LightMaskPrototype};
pub use occlusion::OcclusionGeometry;
pub use recorder::{GpuCommand, RecordingBackend};
pub use wgpu_backend::{WgpuBackend, FRAMEBUFFER_FORMAT};
