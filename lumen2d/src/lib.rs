//! Lumen2D - dynamic 2D lighting on wgpu.
//!
//! Point lights with soft or hard shadows, occluder-driven field of view,
//! light blur and wall bleed. The host owns the world and the window; it
//! exposes lights and occluders through [`SpatialIndex`] and calls
//! [`LightingRenderer::render_frame`] once per eye.

pub mod camera;
pub mod color;
pub mod config;
pub mod error;
pub mod light;
pub mod light_level;
pub mod math;
pub mod occluder;
pub mod render;
pub mod renderer;
pub mod spatial;
pub mod stats;

pub use crate::camera::{Eye, Viewport};
pub use crate::color::Color;
pub use crate::config::{ConfigFile, LightLimits, LightingConfig};
pub use crate::error::LightingError;
pub use crate::light::LightComponent;
pub use crate::light_level::{light_color_at, light_level_at, LightSensitive};
pub use crate::math::{Box2, Transform2D, Vec2};
pub use crate::occluder::{OccluderComponent, OccluderDir};
pub use crate::render::{LightMaskPrototype, LightingBackend, RecordingBackend, WgpuBackend};
pub use crate::renderer::{LightingRenderer, MapLighting};
pub use crate::spatial::{EntityId, MapId, SpatialIndex, SpatialWorld, TreeId};
pub use crate::stats::FrameStats;
