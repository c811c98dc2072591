use bytemuck::{Pod, Zeroable};

use crate::color::Color;
use crate::math::{Box2, Vec2};

/// A light projected into eye-relative space for a single frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PointLight {
    pub color: Color,
    /// Position relative to the eye, never absolute.
    pub position: Vec2,
    pub range: f32,
    pub power: f32,
    pub softness: f32,
    /// Mask rotation in radians.
    pub angle: f32,
    /// UV rectangle of the light's mask inside the mask atlas.
    pub mask_uv: Box2,
    /// Squared distance from the view centre.
    pub distance_squared: f32,
    pub casts_shadows: bool,
    /// Row of the shadow atlas this light owns. Only meaningful when
    /// `casts_shadows` is set.
    pub shadow_row: u32,
}

/// One corner of a light quad as uploaded to the GPU.
///
/// Every vertex of a quad carries the full light description so lights can
/// be batched into a single draw.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct LightVertex {
    /// Light-map pixel position (origin top-left).
    pub position: [f32; 2],
    /// Eye-relative world position of this corner.
    pub world: [f32; 2],
    /// Eye-relative world position of the light.
    pub light_position: [f32; 2],
    pub color: [f32; 4],
    /// range, power, softness, angle
    pub params: [f32; 4],
    /// Mask UV box: left, bottom, right, top.
    pub mask: [f32; 4],
    /// Shadow atlas row V coordinate, then padding.
    pub shadow: [f32; 2],
}

impl LightVertex {
    pub fn new(light: &PointLight, position: Vec2, world: Vec2, shadow_row_v: f32) -> Self {
        Self {
            position: position.to_array(),
            world: world.to_array(),
            light_position: light.position.to_array(),
            color: light.color.to_array(),
            params: [light.range, light.power, light.softness, light.angle],
            mask: [
                light.mask_uv.left,
                light.mask_uv.bottom,
                light.mask_uv.right,
                light.mask_uv.top,
            ],
            shadow: [shadow_row_v, 0.0],
        }
    }
}

/// V coordinate of the centre of row `index` in a texture `height` rows tall.
pub fn row_to_v(index: u32, height: u32) -> f32 {
    (index as f32 + 0.5) / height.max(1) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_layout_has_no_padding() {
        assert_eq!(std::mem::size_of::<LightVertex>(), 20 * 4);
    }

    #[test]
    fn test_row_to_v_centres_rows() {
        assert_eq!(row_to_v(0, 2), 0.25);
        assert_eq!(row_to_v(1, 2), 0.75);
        assert_eq!(row_to_v(0, 1), 0.5);
    }
}
