//! Light blur, wall bleed and the wall merge.

use anyhow::Result;

use crate::math::Vec2;
use crate::render::backend::{BlurPass, BlurTarget, LightingBackend};
use crate::stats::FrameStats;

/// Camera height (world units) at which blur factors apply unscaled.
pub const REFERENCE_CAMERA_HEIGHT: f32 = 14.0;
pub const WALL_BLEED_FACTOR: f32 = 7e-3;
pub const BLUR_ITERATIONS: u32 = 3;

const HORIZONTAL: Vec2 = Vec2::new(1.0, 0.0);
const VERTICAL: Vec2 = Vec2::new(0.0, 1.0);

/// Scales a blur factor inversely with the visible height so blur looks
/// the same at any zoom.
pub fn blur_factor(base: f32, camera_size: f32) -> f32 {
    base * REFERENCE_CAMERA_HEIGHT / camera_size.max(f32::EPSILON)
}

/// Radii for iterations 3, 2, 1: `(i + 1) * factor`.
fn radii(factor: f32) -> impl Iterator<Item = f32> {
    (1..=BLUR_ITERATIONS).rev().map(move |i| (i + 1) as f32 * factor)
}

/// Ping-pong blur of the light target through the light blur target.
pub fn light_blur_passes(factor: f32) -> impl Iterator<Item = BlurPass> {
    radii(factor).flat_map(|radius| {
        [
            BlurPass {
                source: BlurTarget::Light,
                destination: BlurTarget::LightBlur,
                direction: HORIZONTAL,
                radius,
            },
            BlurPass {
                source: BlurTarget::LightBlur,
                destination: BlurTarget::Light,
                direction: VERTICAL,
                radius,
            },
        ]
    })
}

/// Blur of the light target into the wall-bleed pair. The first iteration
/// reads the light target; later ones continue from the previous result.
pub fn wall_bleed_passes(factor: f32) -> impl Iterator<Item = BlurPass> {
    radii(factor).enumerate().flat_map(|(iteration, radius)| {
        let source = if iteration == 0 {
            BlurTarget::Light
        } else {
            BlurTarget::WallBleed2
        };
        [
            BlurPass {
                source,
                destination: BlurTarget::WallBleed1,
                direction: HORIZONTAL,
                radius,
            },
            BlurPass {
                source: BlurTarget::WallBleed1,
                destination: BlurTarget::WallBleed2,
                direction: VERTICAL,
                radius,
            },
        ]
    })
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PostSettings {
    pub light_blur: bool,
    pub light_blur_factor: f32,
    /// Visible height in world units.
    pub camera_size: f32,
}

pub fn run_post<B: LightingBackend>(
    backend: &mut B,
    settings: &PostSettings,
    stats: &mut FrameStats,
) -> Result<()> {
    if settings.light_blur {
        let factor = blur_factor(settings.light_blur_factor, settings.camera_size);
        for pass in light_blur_passes(factor) {
            backend.blur(&pass)?;
            stats.draw_calls += 1;
        }
    }

    let factor = blur_factor(WALL_BLEED_FACTOR, settings.camera_size);
    for pass in wall_bleed_passes(factor) {
        backend.blur(&pass)?;
        stats.draw_calls += 1;
    }

    backend.merge_wall_bleed()?;
    stats.draw_calls += 1;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::recorder::{GpuCommand, RecordingBackend};

    #[test]
    fn test_blur_factor_scales_inversely_with_zoom() {
        assert!((blur_factor(0.01, 14.0) - 0.01).abs() < 1e-7);
        assert!((blur_factor(0.01, 28.0) - 0.005).abs() < 1e-7);
    }

    #[test]
    fn test_light_blur_radii_decrease() {
        let radii: Vec<f32> = light_blur_passes(1.0).map(|p| p.radius).collect();
        assert_eq!(radii, vec![4.0, 4.0, 3.0, 3.0, 2.0, 2.0]);
    }

    #[test]
    fn test_wall_bleed_ping_pongs() {
        let passes: Vec<_> = wall_bleed_passes(1.0)
            .map(|p| (p.source, p.destination))
            .collect();
        assert_eq!(passes[0], (BlurTarget::Light, BlurTarget::WallBleed1));
        assert_eq!(passes[1], (BlurTarget::WallBleed1, BlurTarget::WallBleed2));
        assert_eq!(passes[2], (BlurTarget::WallBleed2, BlurTarget::WallBleed1));
        assert_eq!(passes.len(), 6);
    }

    #[test]
    fn test_post_ends_with_merge() {
        let mut backend = RecordingBackend::new();
        let mut stats = FrameStats::default();
        let settings = PostSettings {
            light_blur: false,
            light_blur_factor: 0.001,
            camera_size: 14.0,
        };
        run_post(&mut backend, &settings, &mut stats).unwrap();
        assert_eq!(backend.commands().len(), 7);
        assert_eq!(backend.commands().last(), Some(&GpuCommand::MergeWallBleed));
        assert_eq!(stats.draw_calls, 7);
    }
}
