//! Occluder geometry builder.
//!
//! Turns occluder rectangles into eye-relative line segments for the depth
//! passes and quads for the wall stencil mask. Each segment is written as
//! two identical vertices, one per end of a line-list primitive; the depth
//! shader picks the endpoint from the vertex index.

use bytemuck::{Pod, Zeroable};
use glam::Affine2;

use crate::camera::Eye;
use crate::math::{transform_point, Box2, Vec2};
use crate::occluder::OccluderDir;
use crate::spatial::SpatialIndex;
use crate::stats::FrameStats;

pub const VERTICES_PER_SEGMENT: usize = 2;
pub const MASK_VERTICES_PER_OCCLUDER: usize = 4;
pub const MASK_INDICES_PER_OCCLUDER: usize = 6;

/// One occlusion segment vertex: `(x0, y0, x1, y1)` relative to the eye.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct SegmentVertex {
    pub segment: [f32; 4],
}

/// One corner of an occluder mask quad, relative to the eye.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct MaskVertex {
    pub position: [f32; 2],
}

/// Front-facing when `b` lies counter-clockwise of `a` as seen from the origin.
/// Occluder corners are enumerated clockwise, so such an edge faces the origin.
pub fn is_front_facing(a: Vec2, b: Vec2) -> bool {
    a.cross(b) > 0.0
}

/// Scratch buffers for one frame's occluder geometry.
pub struct OcclusionGeometry {
    max_occluders: usize,
    occluder_count: usize,
    light_vertices: Vec<SegmentVertex>,
    fov_vertices: Vec<SegmentVertex>,
    mask_vertices: Vec<MaskVertex>,
}

impl OcclusionGeometry {
    pub fn new(max_occluders: usize) -> Self {
        let mut geometry = Self {
            max_occluders: 0,
            occluder_count: 0,
            light_vertices: Vec::new(),
            fov_vertices: Vec::new(),
            mask_vertices: Vec::new(),
        };
        geometry.resize(max_occluders);
        geometry
    }

    /// Changes the occluder capacity. Existing contents are discarded.
    pub fn resize(&mut self, max_occluders: usize) {
        self.max_occluders = max_occluders;
        self.clear();
        let segments = max_occluders * 4 * VERTICES_PER_SEGMENT;
        self.light_vertices = Vec::with_capacity(segments);
        self.fov_vertices = Vec::with_capacity(segments);
        self.mask_vertices = Vec::with_capacity(max_occluders * MASK_VERTICES_PER_OCCLUDER);
    }

    pub fn clear(&mut self) {
        self.occluder_count = 0;
        self.light_vertices.clear();
        self.fov_vertices.clear();
        self.mask_vertices.clear();
    }

    pub fn max_occluders(&self) -> usize {
        self.max_occluders
    }

    pub fn occluder_count(&self) -> usize {
        self.occluder_count
    }

    pub fn light_vertices(&self) -> &[SegmentVertex] {
        &self.light_vertices
    }

    pub fn fov_vertices(&self) -> &[SegmentVertex] {
        &self.fov_vertices
    }

    pub fn mask_vertices(&self) -> &[MaskVertex] {
        &self.mask_vertices
    }

    pub fn light_segment_count(&self) -> usize {
        self.light_vertices.len() / VERTICES_PER_SEGMENT
    }

    pub fn fov_segment_count(&self) -> usize {
        self.fov_vertices.len() / VERTICES_PER_SEGMENT
    }

    /// Rebuilds the buffers from every enabled occluder overlapping
    /// `bounds` (world space), up to the occluder capacity.
    pub fn build<S: SpatialIndex>(
        &mut self,
        index: &S,
        eye: &Eye,
        bounds: Box2,
        stats: &mut FrameStats,
    ) {
        self.clear();

        for entry in index.occluders_intersecting(eye.map, bounds) {
            if self.occluder_count >= self.max_occluders {
                log::debug!(
                    "Occluder cap of {} reached, ignoring the rest",
                    self.max_occluders
                );
                break;
            }

            let relative = entry.transform.position - eye.position;
            let matrix = Affine2::from_angle_translation(entry.transform.rotation, relative.to_glam());
            self.push_occluder(&matrix, &entry.occluder.bounding_box, entry.occluder.occluding);
        }

        debug_assert_eq!(
            self.mask_vertices.len(),
            self.occluder_count * MASK_VERTICES_PER_OCCLUDER
        );
        debug_assert!(self.light_vertices.len() <= self.fov_vertices.len());

        stats.occluders += self.occluder_count;
    }

    fn push_occluder(&mut self, matrix: &Affine2, bounds: &Box2, blocked: OccluderDir) {
        let tl = transform_point(matrix, bounds.top_left());
        let tr = transform_point(matrix, bounds.top_right());
        let br = transform_point(matrix, bounds.bottom_right());
        let bl = tl + br - tr;

        for corner in [tl, tr, br, bl] {
            self.mask_vertices.push(MaskVertex {
                position: corner.to_array(),
            });
        }

        let n_blocked = blocked.contains(OccluderDir::NORTH);
        let e_blocked = blocked.contains(OccluderDir::EAST);
        let s_blocked = blocked.contains(OccluderDir::SOUTH);
        let w_blocked = blocked.contains(OccluderDir::WEST);

        let n_visible = !n_blocked && is_front_facing(tl, tr);
        let e_visible = !e_blocked && is_front_facing(tr, br);
        let s_visible = !s_blocked && is_front_facing(br, bl);
        let w_visible = !w_blocked && is_front_facing(bl, tl);

        // A blocked face still closes the FOV outline when neither of its
        // perpendicular neighbours is visible; otherwise interior corners leak.
        let edges = [
            (tl, tr, n_blocked, e_visible || w_visible),
            (tr, br, e_blocked, n_visible || s_visible),
            (br, bl, s_blocked, e_visible || w_visible),
            (bl, tl, w_blocked, n_visible || s_visible),
        ];

        for (a, b, is_blocked, perpendicular_visible) in edges {
            let vertex = SegmentVertex {
                segment: [a.x, a.y, b.x, b.y],
            };
            if !is_blocked {
                push_segment(&mut self.light_vertices, vertex);
            }
            if !is_blocked || !perpendicular_visible {
                push_segment(&mut self.fov_vertices, vertex);
            }
        }

        self.occluder_count += 1;
    }
}

fn push_segment(buffer: &mut Vec<SegmentVertex>, vertex: SegmentVertex) {
    for _ in 0..VERTICES_PER_SEGMENT {
        buffer.push(vertex);
    }
}

/// Triangle-list indices for `max_occluders` mask quads.
pub fn mask_indices(max_occluders: usize) -> Vec<u16> {
    (0..max_occluders)
        .flat_map(|quad| {
            let base = (quad * MASK_VERTICES_PER_OCCLUDER) as u16;
            [base, base + 1, base + 2, base, base + 2, base + 3]
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Transform2D;
    use crate::occluder::OccluderComponent;
    use crate::spatial::{MapId, SpatialWorld};

    fn build_one(position: Vec2, occluder: OccluderComponent) -> OcclusionGeometry {
        let mut world = SpatialWorld::new();
        let tree = world.add_tree(MapId(1), Transform2D::identity());
        world
            .spawn_occluder(tree, Transform2D::from_position(position), occluder)
            .unwrap();
        let mut geometry = OcclusionGeometry::new(1024);
        let eye = Eye::new(Vec2::ZERO, MapId(1));
        geometry.build(
            &world,
            &eye,
            Box2::new(-50.0, -50.0, 50.0, 50.0),
            &mut FrameStats::default(),
        );
        geometry
    }

    #[test]
    fn test_front_facing_south_face_seen_from_below() {
        // Tile above the eye: its south face (br -> bl) faces the origin.
        assert!(is_front_facing(Vec2::new(0.5, 4.5), Vec2::new(-0.5, 4.5)));
        assert!(!is_front_facing(Vec2::new(-0.5, 5.5), Vec2::new(0.5, 5.5)));
    }

    #[test]
    fn test_lone_square_emits_four_segments() {
        let geometry = build_one(Vec2::new(0.0, 5.0), OccluderComponent::tile());
        assert_eq!(geometry.occluder_count(), 1);
        assert_eq!(geometry.light_segment_count(), 4);
        assert!(geometry.fov_segment_count() >= 4);
        assert_eq!(geometry.mask_vertices().len(), 4);
        assert_eq!(geometry.light_vertices().len(), 4 * VERTICES_PER_SEGMENT);
    }

    #[test]
    fn test_interior_occluder_only_feeds_fov() {
        let interior = OccluderComponent::tile().with_neighbors(OccluderDir::ALL);
        let geometry = build_one(Vec2::new(3.0, 2.0), interior);
        assert_eq!(geometry.light_segment_count(), 0);
        // No face is visible, so every blocked face closes the FOV outline.
        assert_eq!(geometry.fov_segment_count(), 4);
    }

    #[test]
    fn test_blocked_face_with_visible_neighbour_is_omitted_from_fov() {
        // Tile above the eye with its south face blocked. The east and west
        // faces are edge-on (not front-facing) from x = 0, but shifting the
        // tile right makes the west face visible.
        let occluder = OccluderComponent::tile().with_neighbors(OccluderDir::SOUTH);
        let geometry = build_one(Vec2::new(3.0, 5.0), occluder);
        assert_eq!(geometry.light_segment_count(), 3);
        assert_eq!(geometry.fov_segment_count(), 3);
    }

    #[test]
    fn test_corners_are_eye_relative() {
        let mut world = SpatialWorld::new();
        let tree = world.add_tree(MapId(1), Transform2D::identity());
        world
            .spawn_occluder(
                tree,
                Transform2D::from_position(Vec2::new(100_000.0, 100_000.0)),
                OccluderComponent::tile(),
            )
            .unwrap();
        let eye = Eye::new(Vec2::new(100_000.0, 99_998.0), MapId(1));
        let mut geometry = OcclusionGeometry::new(1024);
        geometry.build(
            &world,
            &eye,
            Box2::centered_around(eye.position, Vec2::splat(20.0)),
            &mut FrameStats::default(),
        );
        assert_eq!(geometry.mask_vertices()[0].position, [-0.5, 2.5]);
    }

    #[test]
    fn test_occluder_cap_truncates() {
        let mut world = SpatialWorld::new();
        let tree = world.add_tree(MapId(1), Transform2D::identity());
        for i in 0..20 {
            world
                .spawn_occluder(
                    tree,
                    Transform2D::from_position(Vec2::new(i as f32 * 2.0, 0.0)),
                    OccluderComponent::tile(),
                )
                .unwrap();
        }
        let mut geometry = OcclusionGeometry::new(8);
        let mut stats = FrameStats::default();
        geometry.build(
            &world,
            &Eye::new(Vec2::ZERO, MapId(1)),
            Box2::new(-100.0, -100.0, 100.0, 100.0),
            &mut stats,
        );
        assert_eq!(geometry.occluder_count(), 8);
        assert_eq!(stats.occluders, 8);
    }

    #[test]
    fn test_rebuild_is_bit_identical() {
        let mut world = SpatialWorld::new();
        let tree = world.add_tree(MapId(1), Transform2D::new(Vec2::new(4.0, -2.0), 0.3));
        for i in 0..6 {
            world
                .spawn_occluder(
                    tree,
                    Transform2D::new(Vec2::new(i as f32, 1.5 * i as f32), 0.1 * i as f32),
                    OccluderComponent::tile().with_neighbors(OccluderDir::from_bits_truncate(i as u8)),
                )
                .unwrap();
        }
        let eye = Eye::new(Vec2::new(1.25, 0.75), MapId(1));
        let bounds = Box2::new(-40.0, -40.0, 40.0, 40.0);
        let mut geometry = OcclusionGeometry::new(1024);

        geometry.build(&world, &eye, bounds, &mut FrameStats::default());
        let first = (
            geometry.light_vertices().to_vec(),
            geometry.fov_vertices().to_vec(),
            geometry.mask_vertices().to_vec(),
        );
        geometry.build(&world, &eye, bounds, &mut FrameStats::default());
        let bytes = |v: &[SegmentVertex]| bytemuck::cast_slice::<SegmentVertex, u8>(v).to_vec();
        assert_eq!(bytes(first.0.as_slice()), bytes(geometry.light_vertices()));
        assert_eq!(bytes(first.1.as_slice()), bytes(geometry.fov_vertices()));
        assert_eq!(
            bytemuck::cast_slice::<MaskVertex, u8>(first.2.as_slice()),
            bytemuck::cast_slice::<MaskVertex, u8>(geometry.mask_vertices())
        );
    }

    #[test]
    fn test_mask_indices_form_quads() {
        assert_eq!(mask_indices(2), vec![0, 1, 2, 0, 2, 3, 4, 5, 6, 4, 6, 7]);
    }
}
