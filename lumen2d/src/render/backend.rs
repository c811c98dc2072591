//! The seam between the CPU-side lighting pipeline and a GPU backend.
//!
//! Each method is one GPU-facing step of a frame. The renderer guarantees
//! the call order (occlusion upload, then depth passes, then the light
//! pass, then post-processing, then the FOV compositor), so a backend only
//! has to execute commands in submission order.

use anyhow::Result;
use glam::Affine2;
use image::RgbaImage;

use crate::camera::Viewport;
use crate::color::Color;
use crate::config::LightLimits;
use crate::math::Vec2;
use crate::render::depth::DepthInstance;
use crate::render::light::LightVertex;
use crate::render::occlusion::OcclusionGeometry;

/// Width of one shadow atlas row, in angular buckets.
pub const SHADOW_MAP_SIZE: u32 = 512;
/// Width of the FOV depth map. It has exactly two rows.
pub const FOV_MAP_SIZE: u32 = 2048;

/// What the backend can do, queried once at setup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackendCapabilities {
    pub max_texture_size: u32,
    /// Float colour targets are renderable (depth moments, HDR light).
    pub float_render_targets: bool,
}

/// Sizes of every render target the pipeline draws into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TargetSizes {
    pub framebuffer: (u32, u32),
    pub light_map: (u32, u32),
    /// Wall-bleed ping-pong pair, half the light map scale.
    pub wall_bleed: (u32, u32),
    pub shadow_atlas: (u32, u32),
    pub fov_map: (u32, u32),
}

impl TargetSizes {
    pub fn new(viewport: &Viewport, limits: &LightLimits) -> Self {
        let scaled = |scale: f32| {
            (
                ((viewport.size.0 as f32 * scale).ceil() as u32).max(1),
                ((viewport.size.1 as f32 * scale).ceil() as u32).max(1),
            )
        };
        Self {
            framebuffer: viewport.size,
            light_map: scaled(limits.light_resolution_scale),
            wall_bleed: scaled(limits.light_resolution_scale / 2.0),
            shadow_atlas: (SHADOW_MAP_SIZE, limits.shadow_atlas_rows()),
            fov_map: (FOV_MAP_SIZE, 2),
        }
    }
}

/// Capacities of the GPU-side scratch buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferCapacities {
    pub max_occluders: usize,
    pub max_lights: usize,
    pub max_shadow_lights: usize,
}

impl BufferCapacities {
    pub fn new(limits: &LightLimits) -> Self {
        Self {
            max_occluders: limits.max_occluders,
            max_lights: limits.max_lights,
            max_shadow_lights: limits.max_shadow_lights,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DepthTarget {
    ShadowAtlas,
    FovMap,
}

/// Fixed-function state around the depth passes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DepthDrawState {
    /// Blending off, depth test less-or-equal, depth writes on.
    Prepared,
    /// Blending back on, depth test off.
    Finalized,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DepthClear {
    pub color: [f32; 4],
    pub depth: f32,
}

/// One instanced draw of occlusion segments into a depth target.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DepthDraw {
    pub target: DepthTarget,
    pub vertex_count: u32,
    pub instance_count: u32,
    /// 0 or 1: which copy of segments that wrap around the angular seam.
    pub overlap_side: f32,
}

/// State of the light accumulation pass.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LightPass {
    pub ambient: Color,
    pub target_size: (u32, u32),
}

/// Occluder quads drawn into the light target's stencil.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MaskDraw {
    pub occluder_count: u32,
    /// Eye-relative world space to clip space.
    pub eye_to_clip: Affine2,
}

/// Full-screen pass sampling the FOV depth map.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FovBlit {
    /// Clip space to eye-relative (FOV-centre-relative) world space.
    pub clip_to_diff: Affine2,
    pub occlude_color: Color,
}

/// Scissor rectangle in target pixels, origin top-left.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScissorRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShadowMode {
    /// Penumbra accumulated in destination alpha. `clamp_alpha` adds a
    /// min-blend draw capping that alpha at one, for float targets that
    /// do not saturate on their own.
    Soft { clamp_alpha: bool },
    /// Binary shadow written to stencil with `stencil_ref`.
    Hard { stencil_ref: u8 },
}

/// A shadow-casting light: shadow draw followed by the light draw.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ShadowCasterDraw {
    pub quad: [LightVertex; 4],
    pub scissor: ScissorRect,
    pub mode: ShadowMode,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlurTarget {
    Light,
    LightBlur,
    WallBleed1,
    WallBleed2,
}

/// One direction of a separable blur.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BlurPass {
    pub source: BlurTarget,
    pub destination: BlurTarget,
    /// Unit axis: (1, 0) horizontal or (0, 1) vertical.
    pub direction: Vec2,
    pub radius: f32,
}

/// GPU backend for the lighting pipeline.
pub trait LightingBackend {
    fn capabilities(&self) -> BackendCapabilities;

    /// Reallocates render targets. Called on setup, viewport resize and
    /// resolution changes only.
    fn resize_targets(&mut self, sizes: &TargetSizes) -> Result<()>;

    /// Reallocates GPU scratch buffers after a capacity change.
    fn resize_buffers(&mut self, capacities: &BufferCapacities) -> Result<()>;

    fn upload_mask_atlas(&mut self, atlas: &RgbaImage) -> Result<()>;

    fn begin_frame(&mut self) -> Result<()>;

    /// Uploads this frame's segments, mask quads and depth instances.
    fn upload_occlusion(
        &mut self,
        geometry: &OcclusionGeometry,
        light_instances: &[DepthInstance],
        fov_instances: &[DepthInstance; 2],
    ) -> Result<()>;

    fn set_depth_state(&mut self, state: DepthDrawState) -> Result<()>;

    fn clear_depth_target(&mut self, target: DepthTarget, clear: &DepthClear) -> Result<()>;

    fn draw_occlusion_depth(&mut self, draw: &DepthDraw) -> Result<()>;

    /// Clears the light target to the ambient colour and its stencil to zero.
    fn begin_light_pass(&mut self, pass: &LightPass) -> Result<()>;

    /// Marks everything outside the FOV with stencil 0xFF.
    fn draw_lighting_fov(&mut self, blit: &FovBlit) -> Result<()>;

    /// Marks visible wall interiors with stencil 0xFE.
    fn draw_occluder_mask(&mut self, mask: &MaskDraw) -> Result<()>;

    /// Draws unshadowed lights additively where stencil is zero.
    fn draw_light_batch(&mut self, vertices: &[LightVertex], indices: &[u16]) -> Result<()>;

    fn draw_shadow_caster(&mut self, draw: &ShadowCasterDraw) -> Result<()>;

    fn end_light_pass(&mut self) -> Result<()>;

    fn blur(&mut self, pass: &BlurPass) -> Result<()>;

    /// Composites the wall-bleed result onto wall faces (stencil 0xFE).
    fn merge_wall_bleed(&mut self) -> Result<()>;

    /// Replaces everything outside the FOV in the framebuffer.
    fn apply_fov(&mut self, blit: &FovBlit) -> Result<()>;

    fn end_frame(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_sizes_round_up() {
        let limits = LightLimits {
            light_resolution_scale: 0.5,
            ..LightLimits::default()
        };
        let sizes = TargetSizes::new(&Viewport::new(641, 479), &limits);
        assert_eq!(sizes.light_map, (321, 240));
        assert_eq!(sizes.wall_bleed, (161, 120));
        assert_eq!(sizes.shadow_atlas, (SHADOW_MAP_SIZE, 128));
        assert_eq!(sizes.fov_map, (FOV_MAP_SIZE, 2));
    }
}
