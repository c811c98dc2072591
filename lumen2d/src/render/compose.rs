//! Light composition pass.
//!
//! Unshadowed lights are batched into as few draws as possible. Shadow
//! casters are drawn one at a time because each needs its own shadow step.

use anyhow::Result;
use glam::Affine2;

use crate::camera::{Eye, Viewport};
use crate::color::Color;
use crate::math::{transform_point, Box2, Vec2};
use crate::render::backend::{
    FovBlit, LightPass, LightingBackend, MaskDraw, ScissorRect, ShadowCasterDraw, ShadowMode,
};
use crate::render::fov::clip_to_diff;
use crate::render::light::{row_to_v, LightVertex, PointLight};
use crate::stats::FrameStats;

const QUAD_INDICES: [u16; 6] = [0, 1, 2, 0, 2, 3];
/// Largest batch whose vertex indices still fit in `u16`.
const MAX_BATCH_QUADS: usize = (u16::MAX as usize + 1) / 4;

/// CPU-side accumulation of light quads, flushed when full.
pub struct LightBatch {
    capacity: usize,
    vertices: Vec<LightVertex>,
    indices: Vec<u16>,
}

impl LightBatch {
    pub fn new(capacity_quads: usize) -> Self {
        let mut batch = Self {
            capacity: 0,
            vertices: Vec::new(),
            indices: Vec::new(),
        };
        batch.resize(capacity_quads);
        batch
    }

    pub fn resize(&mut self, capacity_quads: usize) {
        self.capacity = capacity_quads.clamp(1, MAX_BATCH_QUADS);
        self.vertices = Vec::with_capacity(self.capacity * 4);
        self.indices = Vec::with_capacity(self.capacity * QUAD_INDICES.len());
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.vertices.len() / 4
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    fn push_quad(&mut self, quad: [LightVertex; 4]) {
        debug_assert!(!self.is_full());
        let base = self.vertices.len() as u16;
        self.vertices.extend_from_slice(&quad);
        self.indices.extend(QUAD_INDICES.iter().map(|i| base + i));
    }

    /// Uploads and draws the pending quads, if any.
    pub fn flush<B: LightingBackend>(
        &mut self,
        backend: &mut B,
        stats: &mut FrameStats,
    ) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        backend.draw_light_batch(&self.vertices, &self.indices)?;
        stats.draw_calls += 1;
        self.vertices.clear();
        self.indices.clear();
        Ok(())
    }
}

/// Maps eye-relative world space onto the light target.
///
/// Light target pixels are y-down, so a [`Box2`] in that space has its
/// `bottom` on the upper edge of the screen.
pub struct LightFrame {
    eye_to_target: Affine2,
    target_to_eye: Affine2,
    /// Light-map pixels covered by one world unit of range, full width.
    footprint_scale: Vec2,
    target: Box2,
}

impl LightFrame {
    pub fn new(viewport: &Viewport, eye: &Eye, target_size: (u32, u32)) -> Self {
        let eye_to_target = viewport.eye_to_target(eye, target_size);
        let size = Vec2::new(target_size.0 as f32, target_size.1 as f32);
        Self {
            eye_to_target,
            target_to_eye: eye_to_target.inverse(),
            footprint_scale: viewport.clip_scale(eye) * size,
            target: Box2::new(0.0, 0.0, size.x, size.y),
        }
    }

    /// The light's quad clipped to the target, with its scissor box.
    /// `None` when the light covers no pixels.
    pub fn light_quad(
        &self,
        light: &PointLight,
        shadow_row_v: f32,
    ) -> Option<([LightVertex; 4], ScissorRect)> {
        let center = transform_point(&self.eye_to_target, light.position);
        let bounds = Box2::centered_around(center, self.footprint_scale * light.range)
            .intersect(&self.target);
        if bounds.is_empty() {
            return None;
        }

        let corner = |pixel: Vec2| {
            let world = transform_point(&self.target_to_eye, pixel);
            LightVertex::new(light, pixel, world, shadow_row_v)
        };
        let quad = [
            corner(bounds.bottom_left()),
            corner(bounds.bottom_right()),
            corner(bounds.top_right()),
            corner(bounds.top_left()),
        ];

        let x = bounds.left.floor() as u32;
        let y = bounds.bottom.floor() as u32;
        let scissor = ScissorRect {
            x,
            y,
            width: (bounds.right.ceil() as u32).saturating_sub(x).max(1),
            height: (bounds.top.ceil() as u32).saturating_sub(y).max(1),
        };
        Some((quad, scissor))
    }
}

/// Per-frame inputs of [`compose_lights`].
#[derive(Clone, Copy, Debug)]
pub struct Composition<'a> {
    pub eye: &'a Eye,
    pub viewport: &'a Viewport,
    pub ambient: Color,
    pub target_size: (u32, u32),
    pub soft_shadows: bool,
    pub occluder_count: usize,
    pub shadow_atlas_rows: u32,
}

/// Draws every light into the light target.
///
/// The stencil ends up as 0xFF outside the FOV, 0xFE on visible wall
/// interiors, and 0 where light may fall. Hard shadows mark shadowed
/// pixels with `row + 1`, which stays below both reserved values.
pub fn compose_lights<B: LightingBackend>(
    backend: &mut B,
    composition: &Composition<'_>,
    lights: &[PointLight],
    batch: &mut LightBatch,
    stats: &mut FrameStats,
) -> Result<()> {
    let eye = composition.eye;
    let viewport = composition.viewport;

    backend.begin_light_pass(&LightPass {
        ambient: composition.ambient.with_alpha(0.0),
        target_size: composition.target_size,
    })?;

    backend.draw_lighting_fov(&FovBlit {
        clip_to_diff: clip_to_diff(viewport, eye, eye.position),
        occlude_color: Color::BLACK,
    })?;
    stats.draw_calls += 1;

    if composition.occluder_count > 0 {
        backend.draw_occluder_mask(&MaskDraw {
            occluder_count: composition.occluder_count as u32,
            eye_to_clip: viewport.eye_to_clip(eye),
        })?;
        stats.draw_calls += 1;
    }

    let frame = LightFrame::new(viewport, eye, composition.target_size);

    for light in lights.iter().filter(|l| !l.casts_shadows) {
        let Some((quad, _)) = frame.light_quad(light, 0.0) else {
            continue;
        };
        if batch.is_full() {
            batch.flush(backend, stats)?;
        }
        batch.push_quad(quad);
    }
    batch.flush(backend, stats)?;

    let float_targets = backend.capabilities().float_render_targets;
    for light in lights.iter().filter(|l| l.casts_shadows) {
        let row_v = row_to_v(light.shadow_row, composition.shadow_atlas_rows);
        let Some((quad, scissor)) = frame.light_quad(light, row_v) else {
            continue;
        };

        let mode = if composition.soft_shadows {
            ShadowMode::Soft {
                clamp_alpha: float_targets,
            }
        } else {
            ShadowMode::Hard {
                stencil_ref: (light.shadow_row + 1).min(u32::from(u8::MAX)) as u8,
            }
        };

        backend.draw_shadow_caster(&ShadowCasterDraw {
            quad,
            scissor,
            mode,
        })?;
        stats.draw_calls += match mode {
            ShadowMode::Soft { clamp_alpha: true } => 3,
            _ => 2,
        };
    }

    backend.end_light_pass()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::recorder::{GpuCommand, RecordingBackend};
    use crate::spatial::MapId;

    fn light(position: Vec2, casts_shadows: bool, shadow_row: u32) -> PointLight {
        PointLight {
            color: Color::WHITE,
            position,
            range: 4.0,
            power: 1.0,
            softness: 1.0,
            angle: 0.0,
            mask_uv: Box2::new(0.0, 0.0, 1.0, 1.0),
            distance_squared: position.length_squared(),
            casts_shadows,
            shadow_row,
        }
    }

    fn compose(
        lights: &[PointLight],
        batch_quads: usize,
        soft: bool,
    ) -> (Vec<GpuCommand>, FrameStats) {
        let eye = Eye::new(Vec2::ZERO, MapId(1));
        let viewport = Viewport::new(640, 480);
        let composition = Composition {
            eye: &eye,
            viewport: &viewport,
            ambient: Color::rgb(0.1, 0.1, 0.1),
            target_size: (320, 240),
            soft_shadows: soft,
            occluder_count: 0,
            shadow_atlas_rows: 4,
        };
        let mut backend = RecordingBackend::new();
        let mut batch = LightBatch::new(batch_quads);
        let mut stats = FrameStats::default();
        compose_lights(&mut backend, &composition, lights, &mut batch, &mut stats).unwrap();
        (backend.take_commands(), stats)
    }

    #[test]
    fn test_light_quad_is_centred_on_light() {
        let eye = Eye::new(Vec2::ZERO, MapId(1));
        let viewport = Viewport::new(640, 480);
        let frame = LightFrame::new(&viewport, &eye, (640, 480));
        let (quad, scissor) = frame.light_quad(&light(Vec2::ZERO, false, 0), 0.0).unwrap();

        // 4 world units of range at 32 px/m is 128 px each way.
        let close = |actual: [f32; 2], x: f32, y: f32| {
            (actual[0] - x).abs() < 1e-3 && (actual[1] - y).abs() < 1e-3
        };
        assert!(close(quad[0].position, 192.0, 112.0), "{:?}", quad[0].position);
        assert!(close(quad[2].position, 448.0, 368.0), "{:?}", quad[2].position);
        assert!((191..=192).contains(&scissor.x) && (111..=112).contains(&scissor.y));
        assert!((256..=258).contains(&scissor.width), "{scissor:?}");
        let world = Vec2::new(quad[2].world[0], quad[2].world[1]);
        assert!((world - Vec2::new(4.0, -4.0)).length() < 1e-3);
    }

    #[test]
    fn test_off_screen_light_is_skipped() {
        let eye = Eye::new(Vec2::ZERO, MapId(1));
        let viewport = Viewport::new(640, 480);
        let frame = LightFrame::new(&viewport, &eye, (320, 240));
        assert!(frame.light_quad(&light(Vec2::new(100.0, 0.0), false, 0), 0.0).is_none());
    }

    #[test]
    fn test_batch_flushes_on_overflow() {
        let lights: Vec<_> = (0..5).map(|i| light(Vec2::new(i as f32, 0.0), false, 0)).collect();
        let (commands, stats) = compose(&lights, 2, true);
        let batches: Vec<usize> = commands
            .iter()
            .filter_map(|c| match c {
                GpuCommand::DrawLightBatch { vertices, .. } => Some(vertices.len() / 4),
                _ => None,
            })
            .collect();
        assert_eq!(batches, vec![2, 2, 1]);
        // FOV stencil plus three batches.
        assert_eq!(stats.draw_calls, 4);
    }

    #[test]
    fn test_pass_order_and_ambient_alpha() {
        let (commands, _) = compose(&[light(Vec2::ZERO, false, 0)], 16, true);
        assert!(matches!(&commands[0], GpuCommand::BeginLightPass(pass) if pass.ambient.a == 0.0 && pass.ambient.r == 0.1));
        assert!(matches!(commands[1], GpuCommand::DrawLightingFov(_)));
        assert!(matches!(commands[2], GpuCommand::DrawLightBatch { .. }));
        assert_eq!(commands.last(), Some(&GpuCommand::EndLightPass));
    }

    #[test]
    fn test_hard_shadows_use_row_stencil_refs() {
        let lights = [light(Vec2::ZERO, true, 0), light(Vec2::new(1.0, 1.0), true, 1)];
        let (commands, stats) = compose(&lights, 16, false);
        let refs: Vec<ShadowMode> = commands
            .iter()
            .filter_map(|c| match c {
                GpuCommand::DrawShadowCaster(draw) => Some(draw.mode),
                _ => None,
            })
            .collect();
        assert_eq!(
            refs,
            vec![
                ShadowMode::Hard { stencil_ref: 1 },
                ShadowMode::Hard { stencil_ref: 2 }
            ]
        );
        assert_eq!(stats.draw_calls, 1 + 4);
    }

    #[test]
    fn test_soft_shadow_caster_samples_its_row() {
        let (commands, _) = compose(&[light(Vec2::ZERO, true, 2)], 16, true);
        let draw = commands
            .iter()
            .find_map(|c| match c {
                GpuCommand::DrawShadowCaster(draw) => Some(*draw),
                _ => None,
            })
            .unwrap();
        assert_eq!(draw.quad[0].shadow[0], row_to_v(2, 4));
        assert_eq!(draw.mode, ShadowMode::Soft { clamp_alpha: true });
    }
}
