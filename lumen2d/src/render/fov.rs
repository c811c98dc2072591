//! Field-of-view compositor.

use anyhow::Result;
use glam::Affine2;

use crate::camera::{Eye, Viewport};
use crate::color::Color;
use crate::math::Vec2;
use crate::render::backend::{FovBlit, LightingBackend};
use crate::stats::FrameStats;

/// Maps clip-space coordinates of `viewport` to world positions relative
/// to `fov_centre`.
///
/// Derived from three sampled screen positions instead of inverting a view
/// matrix, so it stays accurate far from the world origin.
pub fn clip_to_diff(viewport: &Viewport, eye: &Eye, fov_centre: Vec2) -> Affine2 {
    let half = viewport.size_vec() * 0.5;

    let zero = viewport.local_to_world(eye, half);
    let x_axis = viewport.local_to_world(eye, half + Vec2::new(half.x, 0.0)) - zero;
    let y_axis = viewport.local_to_world(eye, half - Vec2::new(0.0, half.y)) - zero;
    let origin = zero - fov_centre;

    Affine2::from_cols(x_axis.to_glam(), y_axis.to_glam(), origin.to_glam())
}

/// Darkens everything the eye cannot see in the final framebuffer.
pub fn apply_fov<B: LightingBackend>(
    backend: &mut B,
    viewport: &Viewport,
    eye: &Eye,
    occlude_color: Color,
    stats: &mut FrameStats,
) -> Result<()> {
    backend.apply_fov(&FovBlit {
        clip_to_diff: clip_to_diff(viewport, eye, eye.position),
        occlude_color,
    })?;
    stats.draw_calls += 1;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::PIXELS_PER_METER;
    use crate::math::transform_point;
    use crate::spatial::MapId;

    #[test]
    fn test_clip_corners_map_to_view_edges() {
        let eye = Eye::new(Vec2::new(12.0, -7.0), MapId(1));
        let viewport = Viewport::new(640, 480);
        let matrix = clip_to_diff(&viewport, &eye, eye.position);

        let right = transform_point(&matrix, Vec2::new(1.0, 0.0));
        assert!((right - Vec2::new(320.0 / PIXELS_PER_METER, 0.0)).length() < 1e-3);
        let top = transform_point(&matrix, Vec2::new(0.0, 1.0));
        assert!((top - Vec2::new(0.0, 240.0 / PIXELS_PER_METER)).length() < 1e-3);
        assert!(transform_point(&matrix, Vec2::ZERO).length() < 1e-5);
    }

    #[test]
    fn test_inverts_eye_to_clip_with_rotation_and_zoom() {
        let eye = Eye::new(Vec2::new(250.0, 400.0), MapId(1))
            .with_rotation(1.1)
            .with_zoom(Vec2::new(1.5, 1.5));
        let viewport = Viewport::new(1280, 720);
        let to_clip = viewport.eye_to_clip(&eye);
        let back = clip_to_diff(&viewport, &eye, eye.position);

        for point in [Vec2::new(3.0, -2.0), Vec2::new(-10.0, 6.5), Vec2::new(0.5, 0.25)] {
            let clip = transform_point(&to_clip, point);
            let round_trip = transform_point(&back, clip);
            assert!((round_trip - point).length() < 1e-3, "{point:?} -> {round_trip:?}");
        }
    }

    #[test]
    fn test_offset_fov_centre_shifts_origin() {
        let eye = Eye::new(Vec2::new(5.0, 5.0), MapId(1));
        let viewport = Viewport::new(320, 320);
        let matrix = clip_to_diff(&viewport, &eye, Vec2::new(4.0, 5.0));
        assert!((transform_point(&matrix, Vec2::ZERO) - Vec2::new(1.0, 0.0)).length() < 1e-5);
    }
}
