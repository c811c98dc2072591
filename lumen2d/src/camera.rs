//! Viewer (eye) and viewport math.
//!
//! All transforms that feed the GPU are expressed relative to the eye so
//! that precision does not depend on how far the eye is from the origin.

use glam::{Affine2, Vec2 as GlamVec2};

use crate::math::{Box2, Box2Rotated, Vec2};
use crate::spatial::MapId;

/// World units are meters; this many render-target pixels make one meter at zoom 1.
pub const PIXELS_PER_METER: f32 = 32.0;

/// The viewer a frame is rendered for.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Eye {
    /// World position of the view centre.
    pub position: Vec2,
    pub map: MapId,
    /// Rotation in radians.
    pub rotation: f32,
    /// Zoom factor; larger values show more of the world.
    pub zoom: Vec2,
    pub draw_fov: bool,
    pub draw_light: bool,
}

impl Eye {
    pub fn new(position: Vec2, map: MapId) -> Self {
        Self {
            position,
            map,
            rotation: 0.0,
            zoom: Vec2::ONE,
            draw_fov: true,
            draw_light: true,
        }
    }

    #[must_use]
    pub fn with_rotation(mut self, rotation: f32) -> Self {
        self.rotation = rotation;
        self
    }

    #[must_use]
    pub fn with_zoom(mut self, zoom: Vec2) -> Self {
        self.zoom = zoom;
        self
    }

    #[must_use]
    pub fn with_fov(mut self, draw_fov: bool) -> Self {
        self.draw_fov = draw_fov;
        self
    }

    #[must_use]
    pub fn with_lighting(mut self, draw_light: bool) -> Self {
        self.draw_light = draw_light;
        self
    }

    /// Pixels-per-meter multiplier, the inverse of zoom.
    pub fn scale(&self) -> Vec2 {
        Vec2::new(1.0 / self.zoom.x, 1.0 / self.zoom.y)
    }
}

/// A render target the eye is drawn into.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewport {
    /// Render target size in pixels.
    pub size: (u32, u32),
    pub render_scale: Vec2,
}

impl Viewport {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            size: (width.max(1), height.max(1)),
            render_scale: Vec2::ONE,
        }
    }

    #[must_use]
    pub fn with_render_scale(mut self, render_scale: Vec2) -> Self {
        self.render_scale = render_scale;
        self
    }

    pub fn size_vec(&self) -> Vec2 {
        Vec2::new(self.size.0 as f32, self.size.1 as f32)
    }

    /// World units covered by one render-target pixel, per axis.
    fn meters_per_pixel(&self, eye: &Eye) -> Vec2 {
        eye.zoom / (self.render_scale * PIXELS_PER_METER)
    }

    /// Converts a render-target pixel (origin top-left, y down) to world space.
    pub fn local_to_world(&self, eye: &Eye, pixel: Vec2) -> Vec2 {
        let half = self.size_vec() * 0.5;
        let centred = Vec2::new(pixel.x - half.x, half.y - pixel.y);
        eye.position + (centred * self.meters_per_pixel(eye)).rotated(eye.rotation)
    }

    /// The area of the world visible through this viewport.
    pub fn world_bounds(&self, eye: &Eye) -> Box2Rotated {
        let extent = self.size_vec() * self.meters_per_pixel(eye);
        Box2Rotated::new(
            Box2::centered_around(eye.position, extent),
            eye.rotation,
            eye.position,
        )
    }

    /// Eye-relative world space to clip space. Built from scale and
    /// rotation only, never from the absolute eye position.
    pub fn eye_to_clip(&self, eye: &Eye) -> Affine2 {
        let scale = self.clip_scale(eye);
        Affine2::from_scale(scale.to_glam()) * Affine2::from_angle(-eye.rotation)
    }

    /// Clip units per world unit along each screen axis.
    pub fn clip_scale(&self, eye: &Eye) -> Vec2 {
        eye.scale() * self.render_scale * (PIXELS_PER_METER * 2.0) / self.size_vec()
    }

    /// Eye-relative world space to pixels of a target of `target_size`
    /// covering this viewport (origin top-left, y down).
    pub fn eye_to_target(&self, eye: &Eye, target_size: (u32, u32)) -> Affine2 {
        let half = GlamVec2::new(target_size.0 as f32, target_size.1 as f32) * 0.5;
        Affine2::from_translation(half)
            * Affine2::from_scale(GlamVec2::new(half.x, -half.y))
            * self.eye_to_clip(eye)
    }

    /// Height of the visible area in world units.
    pub fn camera_size(&self, eye: &Eye) -> f32 {
        eye.zoom.y * self.size.1 as f32 / self.render_scale.y / PIXELS_PER_METER
    }
}
