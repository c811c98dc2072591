//! A backend that records commands instead of drawing them.
//!
//! Useful headless and in tests: the recorded stream shows exactly which
//! passes ran, in what order, with what data.

use anyhow::Result;
use image::RgbaImage;

use crate::render::backend::{
    BackendCapabilities, BlurPass, BufferCapacities, DepthClear, DepthDraw, DepthDrawState,
    DepthTarget, FovBlit, LightPass, LightingBackend, MaskDraw, ShadowCasterDraw, TargetSizes,
};
use crate::render::depth::DepthInstance;
use crate::render::light::LightVertex;
use crate::render::occlusion::OcclusionGeometry;

#[derive(Clone, Debug, PartialEq)]
pub enum GpuCommand {
    ResizeTargets(TargetSizes),
    ResizeBuffers(BufferCapacities),
    UploadMaskAtlas {
        width: u32,
        height: u32,
    },
    BeginFrame,
    UploadOcclusion {
        light_segments: usize,
        fov_segments: usize,
        mask_quads: usize,
        light_instances: Vec<DepthInstance>,
    },
    SetDepthState(DepthDrawState),
    ClearDepthTarget(DepthTarget, DepthClear),
    DrawOcclusionDepth(DepthDraw),
    BeginLightPass(LightPass),
    DrawLightingFov(FovBlit),
    DrawOccluderMask(MaskDraw),
    DrawLightBatch {
        vertices: Vec<LightVertex>,
        indices: Vec<u16>,
    },
    DrawShadowCaster(ShadowCasterDraw),
    EndLightPass,
    Blur(BlurPass),
    MergeWallBleed,
    ApplyFov(FovBlit),
    EndFrame,
}

pub struct RecordingBackend {
    capabilities: BackendCapabilities,
    commands: Vec<GpuCommand>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::with_capabilities(BackendCapabilities {
            max_texture_size: 8192,
            float_render_targets: true,
        })
    }

    pub fn with_capabilities(capabilities: BackendCapabilities) -> Self {
        Self {
            capabilities,
            commands: Vec::new(),
        }
    }

    pub fn commands(&self) -> &[GpuCommand] {
        &self.commands
    }

    pub fn take_commands(&mut self) -> Vec<GpuCommand> {
        std::mem::take(&mut self.commands)
    }

    /// Number of recorded commands matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&GpuCommand) -> bool) -> usize {
        self.commands.iter().filter(|c| predicate(c)).count()
    }

    fn record(&mut self, command: GpuCommand) -> Result<()> {
        log::trace!("{:?}", command);
        self.commands.push(command);
        Ok(())
    }
}

impl Default for RecordingBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl LightingBackend for RecordingBackend {
    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }

    fn resize_targets(&mut self, sizes: &TargetSizes) -> Result<()> {
        self.record(GpuCommand::ResizeTargets(*sizes))
    }

    fn resize_buffers(&mut self, capacities: &BufferCapacities) -> Result<()> {
        self.record(GpuCommand::ResizeBuffers(*capacities))
    }

    fn upload_mask_atlas(&mut self, atlas: &RgbaImage) -> Result<()> {
        self.record(GpuCommand::UploadMaskAtlas {
            width: atlas.width(),
            height: atlas.height(),
        })
    }

    fn begin_frame(&mut self) -> Result<()> {
        self.record(GpuCommand::BeginFrame)
    }

    fn upload_occlusion(
        &mut self,
        geometry: &OcclusionGeometry,
        light_instances: &[DepthInstance],
        _fov_instances: &[DepthInstance; 2],
    ) -> Result<()> {
        self.record(GpuCommand::UploadOcclusion {
            light_segments: geometry.light_segment_count(),
            fov_segments: geometry.fov_segment_count(),
            mask_quads: geometry.occluder_count(),
            light_instances: light_instances.to_vec(),
        })
    }

    fn set_depth_state(&mut self, state: DepthDrawState) -> Result<()> {
        self.record(GpuCommand::SetDepthState(state))
    }

    fn clear_depth_target(&mut self, target: DepthTarget, clear: &DepthClear) -> Result<()> {
        self.record(GpuCommand::ClearDepthTarget(target, *clear))
    }

    fn draw_occlusion_depth(&mut self, draw: &DepthDraw) -> Result<()> {
        self.record(GpuCommand::DrawOcclusionDepth(*draw))
    }

    fn begin_light_pass(&mut self, pass: &LightPass) -> Result<()> {
        self.record(GpuCommand::BeginLightPass(*pass))
    }

    fn draw_lighting_fov(&mut self, blit: &FovBlit) -> Result<()> {
        self.record(GpuCommand::DrawLightingFov(*blit))
    }

    fn draw_occluder_mask(&mut self, mask: &MaskDraw) -> Result<()> {
        self.record(GpuCommand::DrawOccluderMask(*mask))
    }

    fn draw_light_batch(&mut self, vertices: &[LightVertex], indices: &[u16]) -> Result<()> {
        self.record(GpuCommand::DrawLightBatch {
            vertices: vertices.to_vec(),
            indices: indices.to_vec(),
        })
    }

    fn draw_shadow_caster(&mut self, draw: &ShadowCasterDraw) -> Result<()> {
        self.record(GpuCommand::DrawShadowCaster(*draw))
    }

    fn end_light_pass(&mut self) -> Result<()> {
        self.record(GpuCommand::EndLightPass)
    }

    fn blur(&mut self, pass: &BlurPass) -> Result<()> {
        self.record(GpuCommand::Blur(*pass))
    }

    fn merge_wall_bleed(&mut self) -> Result<()> {
        self.record(GpuCommand::MergeWallBleed)
    }

    fn apply_fov(&mut self, blit: &FovBlit) -> Result<()> {
        self.record(GpuCommand::ApplyFov(*blit))
    }

    fn end_frame(&mut self) -> Result<()> {
        self.record(GpuCommand::EndFrame)
    }
}
