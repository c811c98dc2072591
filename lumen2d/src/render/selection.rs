//! Light selection and shadow-atlas prioritization.

use crate::camera::Eye;
use crate::config::LightLimits;
use crate::math::{Box2, Box2Rotated, Circle};
use crate::render::depth::DepthInstance;
use crate::render::light::{row_to_v, PointLight};
use crate::render::mask_atlas::LightMaskAtlas;
use crate::spatial::SpatialIndex;
use crate::stats::FrameStats;

/// View-dependent inputs of a light query.
#[derive(Clone, Copy, Debug)]
pub struct LightQuery<'a> {
    pub eye: &'a Eye,
    /// The viewport's visible area.
    pub world_bounds: Box2Rotated,
    /// Axis-aligned box around `world_bounds`.
    pub world_aabb: Box2,
    pub limits: &'a LightLimits,
    /// When false every light is drawn unshadowed.
    pub shadows_enabled: bool,
}

/// Result of [`select_lights`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LightSelection {
    pub count: usize,
    pub shadow_count: usize,
    /// World-space view box grown to contain every selected light, used to
    /// cull occluders that may shadow the view from outside it.
    pub expanded_bounds: Box2,
}

/// Fills `lights` with the lights visible from `query.eye` and `instances`
/// with one depth instance per shadow-casting light.
///
/// At most `max_lights` lights are kept. When more lights cast shadows than
/// the atlas has rows, the farthest shadow casters are dropped from the
/// frame entirely.
pub fn select_lights<S: SpatialIndex>(
    index: &S,
    query: &LightQuery<'_>,
    masks: &LightMaskAtlas,
    lights: &mut Vec<PointLight>,
    instances: &mut Vec<DepthInstance>,
    stats: &mut FrameStats,
) -> LightSelection {
    let eye = query.eye;
    let limits = query.limits;
    lights.clear();
    instances.clear();

    for entry in index.lights_intersecting(eye.map, query.world_bounds) {
        if lights.len() >= limits.max_lights {
            break;
        }

        let light = entry.light;
        let world_position = entry.transform.transform_point(light.offset);
        if !Circle::new(world_position, light.radius).intersects_box(&query.world_aabb) {
            continue;
        }

        let angle = if light.mask_auto_rotate {
            light.rotation + entry.transform.rotation
        } else {
            light.rotation
        };
        let position = world_position - eye.position;

        lights.push(PointLight {
            color: light.color,
            position,
            range: light.radius,
            power: light.energy,
            softness: light.softness,
            angle,
            mask_uv: masks.uv_box(light.mask.as_deref()),
            distance_squared: position.length_squared(),
            casts_shadows: query.shadows_enabled && light.cast_shadows,
            shadow_row: 0,
        });
    }

    let mut shadow_count = lights.iter().filter(|l| l.casts_shadows).count();
    if shadow_count > limits.max_shadow_lights {
        // Unshadowed lights first, then shadow casters nearest-first.
        lights.sort_unstable_by(|a, b| {
            a.casts_shadows
                .cmp(&b.casts_shadows)
                .then(a.distance_squared.total_cmp(&b.distance_squared))
        });
        let dropped = shadow_count - limits.max_shadow_lights;
        lights.truncate(lights.len() - dropped);
        log::debug!(
            "Shadow atlas full: dropped {} of {} shadow-casting lights",
            dropped,
            shadow_count
        );
        stats.dropped_shadow_lights += dropped;
        shadow_count = limits.max_shadow_lights;
    }

    let rows = limits.shadow_atlas_rows();
    let mut row = 0;
    for light in lights.iter_mut().filter(|l| l.casts_shadows) {
        light.shadow_row = row;
        instances.push(DepthInstance::new(light.position, row_to_v(row, rows), 1.0));
        row += 1;
    }
    debug_assert_eq!(instances.len(), shadow_count);

    let expanded_bounds = lights.iter().fold(query.world_aabb, |bounds, light| {
        bounds.extend_to_contain(light.position + eye.position)
    });

    stats.total_lights += lights.len();
    stats.shadow_lights += shadow_count;

    LightSelection {
        count: lights.len(),
        shadow_count,
        expanded_bounds,
    }
}
