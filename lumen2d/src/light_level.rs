//! CPU approximation of the light falling on a world position.
//!
//! Gameplay code (stealth, plant growth) needs to know how lit a spot is
//! without reading back the light map. Only shadow-casting lights count,
//! and a single wall between light and point blocks it completely.

use serde::{Deserialize, Serialize};

use crate::color::Color;
use crate::math::{Box2, Box2Rotated, Vec2};
use crate::spatial::{MapId, SpatialIndex};

/// How far beyond the point the light query reaches, in world units.
pub const TREE_SEARCH_RANGE: f32 = 15.0;
/// Height of a light above the floor, in world units.
pub const LIGHT_HEIGHT: f32 = 1.0;

/// Fraction of a light's energy reaching a point `distance_squared` away.
pub fn attenuation(distance_squared: f32, radius: f32, falloff: f32, curve_factor: f32) -> f32 {
    if radius <= 0.0 {
        return 0.0;
    }
    let s = ((distance_squared + LIGHT_HEIGHT * LIGHT_HEIGHT).sqrt() / radius).clamp(0.0, 1.0);
    let s2 = s * s;
    let curve = s + (s2 - s) * curve_factor.clamp(0.0, 1.0);
    let inverse = 1.0 - s2;
    (inverse * inverse / (1.0 + falloff * curve)).clamp(0.0, 1.0)
}

/// Whether any enabled occluder on `map` lies across the segment `from`..`to`.
/// A segment that only touches an occluder's edge counts as blocked.
pub fn is_occluded<S: SpatialIndex>(index: &S, map: MapId, from: Vec2, to: Vec2) -> bool {
    let bounds = Box2::from_corners(from.min(to), from.max(to));
    index.occluders_intersecting(map, bounds).any(|entry| {
        let local = entry.occluder.bounding_box;
        let corners = [
            local.bottom_left(),
            local.bottom_right(),
            local.top_right(),
            local.top_left(),
        ]
        .map(|corner| entry.transform.transform_point(corner));

        (0..4).any(|i| segments_intersect(from, to, corners[i], corners[(i + 1) % 4]))
    })
}

fn segments_intersect(a: Vec2, b: Vec2, c: Vec2, d: Vec2) -> bool {
    let ab = b - a;
    let cd = d - c;
    let d1 = ab.cross(c - a);
    let d2 = ab.cross(d - a);
    let d3 = cd.cross(a - c);
    let d4 = cd.cross(b - c);

    if ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
    {
        return true;
    }

    let on_segment = |p: Vec2, q: Vec2, r: Vec2| {
        r.x >= p.x.min(q.x) && r.x <= p.x.max(q.x) && r.y >= p.y.min(q.y) && r.y <= p.y.max(q.y)
    };
    (d1 == 0.0 && on_segment(a, b, c))
        || (d2 == 0.0 && on_segment(a, b, d))
        || (d3 == 0.0 && on_segment(c, d, a))
        || (d4 == 0.0 && on_segment(c, d, b))
}

/// Summed colour of every unobstructed shadow-casting light reaching `point`.
pub fn light_color_at<S: SpatialIndex>(index: &S, map: MapId, point: Vec2) -> Color {
    let query = Box2Rotated::from(Box2::point(point).enlarged(TREE_SEARCH_RANGE));
    let mut total = Color::TRANSPARENT;

    for entry in index.lights_intersecting(map, query) {
        let light = entry.light;
        if !light.cast_shadows {
            continue;
        }
        let position = entry.transform.transform_point(light.offset);
        let distance_squared = position.distance_squared(point);
        if distance_squared > light.radius * light.radius {
            continue;
        }
        if is_occluded(index, map, position, point) {
            continue;
        }

        let value = light.energy
            * attenuation(distance_squared, light.radius, light.falloff, light.curve_factor);
        total += light.color.scaled(value);
    }

    total
}

/// Brightness at `point`: the strongest channel of [`light_color_at`].
pub fn light_level_at<S: SpatialIndex>(index: &S, map: MapId, point: Vec2) -> f32 {
    light_color_at(index, map, point).max_channel()
}

/// Light level remembered by an entity that reacts to light.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LightSensitive {
    pub light_level: f32,
    /// Set whenever `light_level` changes, until [`take_dirty`](Self::take_dirty).
    #[serde(skip)]
    dirty: bool,
}

impl LightSensitive {
    /// Stores `value`. Returns whether it differs from the stored level.
    pub fn set_illumination(&mut self, value: f32) -> bool {
        if self.light_level == value {
            return false;
        }
        self.light_level = value;
        self.dirty = true;
        true
    }

    /// Samples [`light_level_at`] for an entity standing at `point`.
    pub fn update<S: SpatialIndex>(&mut self, index: &S, map: MapId, point: Vec2) -> bool {
        self.set_illumination(light_level_at(index, map, point))
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Clears the change flag, returning its previous value.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::light::LightComponent;
    use crate::math::Transform2D;
    use crate::occluder::OccluderComponent;
    use crate::spatial::SpatialWorld;

    const MAP: MapId = MapId(1);

    fn world_with_light(light: LightComponent) -> SpatialWorld {
        let mut world = SpatialWorld::new();
        let tree = world.add_tree(MAP, Transform2D::identity());
        world.spawn_light(tree, Transform2D::identity(), light);
        world
    }

    #[test]
    fn test_attenuation_is_one_minus_distance_shape() {
        // Directly below a light the height still counts.
        let below = attenuation(0.0, 10.0, 0.0, 0.0);
        assert!((below - 0.9801).abs() < 1e-4, "{below}");
        assert_eq!(attenuation(100.0, 10.0, 6.8, 0.0), 0.0);
        assert!(attenuation(4.0, 10.0, 6.8, 0.0) > attenuation(16.0, 10.0, 6.8, 0.0));
    }

    #[test]
    fn test_curve_factor_brightens_mid_range() {
        let linear = attenuation(25.0, 10.0, 6.8, 0.0);
        let squared = attenuation(25.0, 10.0, 6.8, 1.0);
        assert!(squared > linear);
    }

    #[test]
    fn test_zero_radius_is_dark() {
        assert_eq!(attenuation(0.0, 0.0, 1.0, 0.0), 0.0);
    }

    #[test]
    fn test_light_level_of_open_space() {
        let world = world_with_light(LightComponent::new(10.0, Color::WHITE));
        let level = light_level_at(&world, MAP, Vec2::new(3.0, 0.0));
        assert!((level - attenuation(9.0, 10.0, 6.8, 0.0)).abs() < 1e-6);
        assert_eq!(light_level_at(&world, MAP, Vec2::new(11.0, 0.0)), 0.0);
        assert_eq!(light_level_at(&world, MapId(2), Vec2::new(3.0, 0.0)), 0.0);
    }

    #[test]
    fn test_unshadowed_lights_are_ignored() {
        let world = world_with_light(LightComponent::new(10.0, Color::WHITE).with_shadows(false));
        assert_eq!(light_level_at(&world, MAP, Vec2::new(1.0, 0.0)), 0.0);
    }

    #[test]
    fn test_wall_blocks_light() {
        let mut world = world_with_light(LightComponent::new(10.0, Color::WHITE));
        let tree = world.add_tree(MAP, Transform2D::identity());
        world.spawn_occluder(
            tree,
            Transform2D::from_position(Vec2::new(2.0, 0.0)),
            OccluderComponent::tile(),
        );

        assert_eq!(light_level_at(&world, MAP, Vec2::new(4.0, 0.0)), 0.0);
        assert!(light_level_at(&world, MAP, Vec2::new(0.0, 3.0)) > 0.0);
    }

    #[test]
    fn test_touching_wall_edge_counts_as_blocked() {
        let mut world = SpatialWorld::new();
        let tree = world.add_tree(MAP, Transform2D::identity());
        world.spawn_occluder(tree, Transform2D::identity(), OccluderComponent::tile());
        assert!(is_occluded(&world, MAP, Vec2::new(-2.0, 0.5), Vec2::new(2.0, 0.5)));
        assert!(!is_occluded(&world, MAP, Vec2::new(-2.0, 0.6), Vec2::new(2.0, 0.6)));
    }

    #[test]
    fn test_colours_accumulate() {
        let mut world = SpatialWorld::new();
        let tree = world.add_tree(MAP, Transform2D::identity());
        world.spawn_light(
            tree,
            Transform2D::identity(),
            LightComponent::new(10.0, Color::rgb(1.0, 0.0, 0.0)),
        );
        world.spawn_light(
            tree,
            Transform2D::identity(),
            LightComponent::new(10.0, Color::rgb(0.0, 0.0, 1.0)),
        );
        let color = light_color_at(&world, MAP, Vec2::new(1.0, 0.0));
        assert!(color.r > 0.0 && color.b > 0.0);
        assert_eq!(color.g, 0.0);
    }

    #[test]
    fn test_sensitive_entity_only_dirties_on_change() {
        let mut sensitive = LightSensitive::default();
        assert!(!sensitive.set_illumination(0.0));
        assert!(!sensitive.is_dirty());

        assert!(sensitive.set_illumination(0.5));
        assert!(sensitive.take_dirty());
        assert!(!sensitive.take_dirty());

        assert!(!sensitive.set_illumination(0.5));
        assert!(!sensitive.is_dirty());
    }

    #[test]
    fn test_sensitive_entity_tracks_walking_behind_a_wall() {
        let mut world = world_with_light(LightComponent::new(10.0, Color::WHITE));
        let tree = world.add_tree(MAP, Transform2D::identity());
        world.spawn_occluder(
            tree,
            Transform2D::from_position(Vec2::new(2.0, 0.0)),
            OccluderComponent::tile(),
        );

        let mut sensitive = LightSensitive::default();
        assert!(sensitive.update(&world, MAP, Vec2::new(0.0, 3.0)));
        assert!(sensitive.light_level > 0.0);
        assert!(!sensitive.update(&world, MAP, Vec2::new(0.0, 3.0)));

        sensitive.take_dirty();
        assert!(sensitive.update(&world, MAP, Vec2::new(4.0, 0.0)));
        assert_eq!(sensitive.light_level, 0.0);
        assert!(sensitive.is_dirty());
    }
}
