//! Depth/shadow rasterization driver.
//!
//! Draws the occlusion segments into the shadow atlas (one row per
//! shadow-casting light) and the FOV map (two rows for the eye).

use anyhow::Result;
use bytemuck::{Pod, Zeroable};

use crate::math::Vec2;
use crate::render::backend::{DepthClear, DepthDraw, DepthDrawState, DepthTarget, LightingBackend};
use crate::render::light::row_to_v;
use crate::render::occlusion::OcclusionGeometry;
use crate::stats::FrameStats;

/// Distance written where nothing occludes. Larger than any light range.
pub const DEPTH_DISTANCE_MAX: f32 = 1234.0;

/// Per-instance data for one depth map row.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct DepthInstance {
    /// Eye-relative position of the light (or zero for the eye itself).
    pub origin: [f32; 2],
    /// V coordinate of the target row.
    pub row_v: f32,
    /// +1 discards back faces, -1 discards front faces.
    pub cull_orientation: f32,
}

impl DepthInstance {
    pub fn new(origin: Vec2, row_v: f32, cull_orientation: f32) -> Self {
        Self {
            origin: origin.to_array(),
            row_v,
            cull_orientation,
        }
    }
}

/// The two FOV instances. Row 0 sees the nearest faces like a light does;
/// row 1 culls front faces instead, revealing the first layer of walls.
pub fn fov_instances() -> [DepthInstance; 2] {
    [
        DepthInstance::new(Vec2::ZERO, row_to_v(0, 2), 1.0),
        DepthInstance::new(Vec2::ZERO, row_to_v(1, 2), -1.0),
    ]
}

/// Clear value for depth targets: maximum distance and its square as
/// moments on float targets, saturated white otherwise.
pub fn depth_clear(float_targets: bool) -> DepthClear {
    let color = if float_targets {
        [
            DEPTH_DISTANCE_MAX,
            DEPTH_DISTANCE_MAX * DEPTH_DISTANCE_MAX,
            0.0,
            1.0,
        ]
    } else {
        [1.0; 4]
    };
    DepthClear { color, depth: 1.0 }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DepthPhase {
    Idle,
    PreparingDepthState,
    DrawingShadowDepths,
    DrawingFovDepth,
    FinalizedDepthState,
}

impl DepthPhase {
    fn next(self) -> DepthPhase {
        match self {
            DepthPhase::Idle => DepthPhase::PreparingDepthState,
            DepthPhase::PreparingDepthState => DepthPhase::DrawingShadowDepths,
            DepthPhase::DrawingShadowDepths => DepthPhase::DrawingFovDepth,
            DepthPhase::DrawingFovDepth => DepthPhase::FinalizedDepthState,
            DepthPhase::FinalizedDepthState => DepthPhase::Idle,
        }
    }
}

/// What the depth passes should draw this frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DepthPasses {
    pub shadow_instances: u32,
    pub draw_shadows: bool,
    pub draw_fov: bool,
}

/// Drives the per-frame depth state machine.
pub struct DepthDriver {
    phase: DepthPhase,
}

impl DepthDriver {
    pub fn new() -> Self {
        Self {
            phase: DepthPhase::Idle,
        }
    }

    pub fn phase(&self) -> DepthPhase {
        self.phase
    }

    fn advance(&mut self, to: DepthPhase) {
        debug_assert_eq!(self.phase.next(), to, "illegal depth phase transition");
        self.phase = to;
    }

    /// Clears both depth targets and draws whatever occludes them.
    ///
    /// Targets are cleared even when nothing is drawn into them so that a
    /// previous frame's shadows cannot show through.
    pub fn run<B: LightingBackend>(
        &mut self,
        backend: &mut B,
        geometry: &OcclusionGeometry,
        passes: DepthPasses,
        stats: &mut FrameStats,
    ) -> Result<()> {
        let result = self.run_phases(backend, geometry, passes, stats);
        if result.is_err() {
            self.phase = DepthPhase::Idle;
        }
        result
    }

    fn run_phases<B: LightingBackend>(
        &mut self,
        backend: &mut B,
        geometry: &OcclusionGeometry,
        passes: DepthPasses,
        stats: &mut FrameStats,
    ) -> Result<()> {
        let clear = depth_clear(backend.capabilities().float_render_targets);

        self.advance(DepthPhase::PreparingDepthState);
        backend.set_depth_state(DepthDrawState::Prepared)?;

        self.advance(DepthPhase::DrawingShadowDepths);
        backend.clear_depth_target(DepthTarget::ShadowAtlas, &clear)?;
        if passes.draw_shadows {
            draw_target(
                backend,
                DepthTarget::ShadowAtlas,
                geometry.light_vertices().len() as u32,
                passes.shadow_instances,
                stats,
            )?;
        }

        self.advance(DepthPhase::DrawingFovDepth);
        backend.clear_depth_target(DepthTarget::FovMap, &clear)?;
        if passes.draw_fov {
            draw_target(
                backend,
                DepthTarget::FovMap,
                geometry.fov_vertices().len() as u32,
                2,
                stats,
            )?;
        }

        self.advance(DepthPhase::FinalizedDepthState);
        backend.set_depth_state(DepthDrawState::Finalized)?;

        self.advance(DepthPhase::Idle);
        Ok(())
    }
}

impl Default for DepthDriver {
    fn default() -> Self {
        Self::new()
    }
}

fn draw_target<B: LightingBackend>(
    backend: &mut B,
    target: DepthTarget,
    vertex_count: u32,
    instance_count: u32,
    stats: &mut FrameStats,
) -> Result<()> {
    if vertex_count == 0 || instance_count == 0 {
        return Ok(());
    }

    for overlap_side in [0.0, 1.0] {
        backend.draw_occlusion_depth(&DepthDraw {
            target,
            vertex_count,
            instance_count,
            overlap_side,
        })?;
        stats.draw_calls += 1;
    }
    Ok(())
}
