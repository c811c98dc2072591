//! Spatial lookup of lights and occluders.
//!
//! The renderer only ever asks "what overlaps this box on this map". That
//! question is the [`SpatialIndex`] trait; [`SpatialWorld`] is an in-memory
//! implementation made of component trees (one per grid or map), each with
//! its own world transform.

use std::collections::HashMap;

use crate::light::LightComponent;
use crate::math::{Box2, Box2Rotated, Circle, Transform2D};
use crate::occluder::OccluderComponent;

/// Identifier of a map (a disconnected world space).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MapId(pub u32);

impl MapId {
    /// The map of entities that are not in any world. Never rendered.
    pub const NULLSPACE: MapId = MapId(0);
}

/// Unique identifier for an entity in the world.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EntityId(u32);

impl EntityId {
    /// Get the underlying integer ID (useful for debugging or serialization).
    pub fn to_u32(self) -> u32 {
        self.0
    }
}

/// Handle to a component tree inside a [`SpatialWorld`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TreeId(usize);

/// A light found by a spatial query.
#[derive(Clone, Copy, Debug)]
pub struct LightEntry<'a> {
    pub entity: EntityId,
    pub light: &'a LightComponent,
    /// World transform of the owning entity.
    pub transform: Transform2D,
}

/// An occluder found by a spatial query.
#[derive(Clone, Copy, Debug)]
pub struct OccluderEntry<'a> {
    pub entity: EntityId,
    pub occluder: &'a OccluderComponent,
    /// World transform of the owning entity.
    pub transform: Transform2D,
}

/// Source of lights and occluders overlapping a world-space region.
///
/// Queries are lazy: a consumer that has seen enough simply stops pulling
/// from the iterator.
pub trait SpatialIndex {
    /// Lights in the tree whose bounds intersect `bounds`.
    fn lights_intersecting<'a>(
        &'a self,
        map: MapId,
        bounds: Box2Rotated,
    ) -> impl Iterator<Item = LightEntry<'a>> + 'a;

    /// Enabled occluders whose bounds intersect `bounds`.
    fn occluders_intersecting<'a>(
        &'a self,
        map: MapId,
        bounds: Box2,
    ) -> impl Iterator<Item = OccluderEntry<'a>> + 'a;
}

struct LightSlot {
    entity: EntityId,
    light: LightComponent,
    local: Transform2D,
    in_tree: bool,
    /// Tree-local bounds as of the last flush.
    bounds: Box2,
}

impl LightSlot {
    fn refresh(&mut self) {
        let center = self.local.transform_point(self.light.offset);
        self.in_tree = self.light.adds_to_tree();
        self.bounds = Circle::new(center, self.light.radius).bounding_box();
        self.light.tree_update_queued = false;
    }
}

struct OccluderSlot {
    entity: EntityId,
    occluder: OccluderComponent,
    local: Transform2D,
}

struct ComponentTree {
    map: MapId,
    transform: Transform2D,
    lights: Vec<LightSlot>,
    occluders: Vec<OccluderSlot>,
}

#[derive(Clone, Copy)]
enum Slot {
    Light { tree: usize, index: usize },
    Occluder { tree: usize, index: usize },
}

/// In-memory spatial index made of per-grid component trees.
pub struct SpatialWorld {
    next_id: u32,
    trees: Vec<ComponentTree>,
    slots: HashMap<EntityId, Slot>,
}

impl SpatialWorld {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            trees: Vec::new(),
            slots: HashMap::new(),
        }
    }

    /// Adds a tree (a grid, or the map itself) placed at `transform`.
    pub fn add_tree(&mut self, map: MapId, transform: Transform2D) -> TreeId {
        self.trees.push(ComponentTree {
            map,
            transform,
            lights: Vec::new(),
            occluders: Vec::new(),
        });
        TreeId(self.trees.len() - 1)
    }

    /// Moves a whole tree. Tree-local bounds stay valid.
    pub fn set_tree_transform(&mut self, tree: TreeId, transform: Transform2D) {
        if let Some(tree) = self.trees.get_mut(tree.0) {
            tree.transform = transform;
        }
    }

    fn next_entity(&mut self) -> EntityId {
        let id = EntityId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1).max(1);
        id
    }

    /// Spawns a light at `local` inside `tree`. Returns `None` for an unknown tree.
    pub fn spawn_light(
        &mut self,
        tree: TreeId,
        local: Transform2D,
        light: LightComponent,
    ) -> Option<EntityId> {
        if tree.0 >= self.trees.len() {
            return None;
        }
        let entity = self.next_entity();
        let lights = &mut self.trees[tree.0].lights;
        let mut slot = LightSlot {
            entity,
            light,
            local,
            in_tree: false,
            bounds: Box2::default(),
        };
        slot.refresh();
        lights.push(slot);
        self.slots.insert(
            entity,
            Slot::Light {
                tree: tree.0,
                index: lights.len() - 1,
            },
        );
        Some(entity)
    }

    /// Spawns an occluder at `local` inside `tree`. Returns `None` for an unknown tree.
    pub fn spawn_occluder(
        &mut self,
        tree: TreeId,
        local: Transform2D,
        occluder: OccluderComponent,
    ) -> Option<EntityId> {
        if tree.0 >= self.trees.len() {
            return None;
        }
        let entity = self.next_entity();
        let occluders = &mut self.trees[tree.0].occluders;
        occluders.push(OccluderSlot {
            entity,
            occluder,
            local,
        });
        self.slots.insert(
            entity,
            Slot::Occluder {
                tree: tree.0,
                index: occluders.len() - 1,
            },
        );
        Some(entity)
    }

    /// Removes an entity and its component.
    pub fn despawn(&mut self, entity: EntityId) -> bool {
        let Some(slot) = self.slots.remove(&entity) else {
            return false;
        };

        let moved = match slot {
            Slot::Light { tree, index } => {
                let lights = &mut self.trees[tree].lights;
                lights.swap_remove(index);
                lights
                    .get(index)
                    .map(|s| (s.entity, Slot::Light { tree, index }))
            }
            Slot::Occluder { tree, index } => {
                let occluders = &mut self.trees[tree].occluders;
                occluders.swap_remove(index);
                occluders
                    .get(index)
                    .map(|s| (s.entity, Slot::Occluder { tree, index }))
            }
        };

        if let Some((moved_entity, slot)) = moved {
            self.slots.insert(moved_entity, slot);
        }
        true
    }

    pub fn light(&self, entity: EntityId) -> Option<&LightComponent> {
        match self.slots.get(&entity)? {
            Slot::Light { tree, index } => Some(&self.trees[*tree].lights[*index].light),
            Slot::Occluder { .. } => None,
        }
    }

    /// Mutable access for the setter functions in [`crate::light`]. Changes
    /// that affect tree membership take effect on the next
    /// [`SpatialWorld::flush_tree_updates`].
    pub fn light_mut(&mut self, entity: EntityId) -> Option<&mut LightComponent> {
        match *self.slots.get(&entity)? {
            Slot::Light { tree, index } => Some(&mut self.trees[tree].lights[index].light),
            Slot::Occluder { .. } => None,
        }
    }

    pub fn set_light_transform(&mut self, entity: EntityId, local: Transform2D) -> bool {
        let Some(Slot::Light { tree, index }) = self.slots.get(&entity).copied() else {
            return false;
        };
        let slot = &mut self.trees[tree].lights[index];
        slot.local = local;
        slot.light.tree_update_queued = true;
        true
    }

    pub fn occluder_mut(&mut self, entity: EntityId) -> Option<&mut OccluderComponent> {
        match *self.slots.get(&entity)? {
            Slot::Occluder { tree, index } => {
                Some(&mut self.trees[tree].occluders[index].occluder)
            }
            Slot::Light { .. } => None,
        }
    }

    pub fn set_occluder_transform(&mut self, entity: EntityId, local: Transform2D) -> bool {
        let Some(Slot::Occluder { tree, index }) = self.slots.get(&entity).copied() else {
            return false;
        };
        self.trees[tree].occluders[index].local = local;
        true
    }

    /// Re-evaluates tree membership and bounds of every light with a queued
    /// update. Returns how many lights were refreshed.
    pub fn flush_tree_updates(&mut self) -> usize {
        let mut refreshed = 0;
        for tree in &mut self.trees {
            for slot in tree.lights.iter_mut().filter(|s| s.light.tree_update_queued) {
                slot.refresh();
                refreshed += 1;
            }
        }
        if refreshed > 0 {
            log::debug!("Refreshed {} light tree entries", refreshed);
        }
        refreshed
    }

    fn trees_on(&self, map: MapId) -> impl Iterator<Item = &ComponentTree> + '_ {
        self.trees.iter().filter(move |tree| tree.map == map)
    }
}

impl Default for SpatialWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl SpatialIndex for SpatialWorld {
    fn lights_intersecting<'a>(
        &'a self,
        map: MapId,
        bounds: Box2Rotated,
    ) -> impl Iterator<Item = LightEntry<'a>> + 'a {
        self.trees_on(map).flat_map(move |tree| {
            let local_bounds = bounds.transformed(&tree.transform.inverse_affine());
            tree.lights
                .iter()
                .filter(move |slot| slot.in_tree && slot.bounds.intersects(&local_bounds))
                .map(move |slot| LightEntry {
                    entity: slot.entity,
                    light: &slot.light,
                    transform: tree.transform.then(&slot.local),
                })
        })
    }

    fn occluders_intersecting<'a>(
        &'a self,
        map: MapId,
        bounds: Box2,
    ) -> impl Iterator<Item = OccluderEntry<'a>> + 'a {
        self.trees_on(map).flat_map(move |tree| {
            let local_bounds = bounds.transformed(&tree.transform.inverse_affine());
            tree.occluders
                .iter()
                .filter(move |slot| {
                    slot.occluder.enabled
                        && slot
                            .occluder
                            .bounding_box
                            .transformed(&slot.local.to_affine())
                            .intersects(&local_bounds)
                })
                .map(move |slot| OccluderEntry {
                    entity: slot.entity,
                    occluder: &slot.occluder,
                    transform: tree.transform.then(&slot.local),
                })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::Color;
    use crate::light;
    use crate::math::Vec2;

    fn world_with_tree() -> (SpatialWorld, TreeId) {
        let mut world = SpatialWorld::new();
        let tree = world.add_tree(MapId(1), Transform2D::identity());
        (world, tree)
    }

    #[test]
    fn test_light_query_filters_by_map_and_bounds() {
        let (mut world, tree) = world_with_tree();
        let other = world.add_tree(MapId(2), Transform2D::identity());
        let near = world
            .spawn_light(tree, Transform2D::from_position(Vec2::new(3.0, 0.0)), LightComponent::new(1.0, Color::WHITE))
            .unwrap();
        world
            .spawn_light(tree, Transform2D::from_position(Vec2::new(50.0, 0.0)), LightComponent::new(1.0, Color::WHITE))
            .unwrap();
        world
            .spawn_light(other, Transform2D::identity(), LightComponent::new(1.0, Color::WHITE))
            .unwrap();

        let bounds = Box2Rotated::from(Box2::new(-5.0, -5.0, 5.0, 5.0));
        let found: Vec<_> = world.lights_intersecting(MapId(1), bounds).map(|e| e.entity).collect();
        assert_eq!(found, vec![near]);
    }

    #[test]
    fn test_tree_transform_applies_to_entries() {
        let mut world = SpatialWorld::new();
        let grid = world.add_tree(
            MapId(1),
            Transform2D::new(Vec2::new(100.0, 0.0), std::f32::consts::FRAC_PI_2),
        );
        world
            .spawn_occluder(grid, Transform2D::from_position(Vec2::new(2.0, 0.0)), OccluderComponent::tile())
            .unwrap();

        let bounds = Box2::centered_around(Vec2::new(100.0, 2.0), Vec2::splat(1.0));
        let entry = world.occluders_intersecting(MapId(1), bounds).next().unwrap();
        assert!((entry.transform.position - Vec2::new(100.0, 2.0)).length() < 1e-4);
        assert!(world
            .occluders_intersecting(MapId(1), bounds.translated(Vec2::new(2.0, -2.0)))
            .next()
            .is_none());
    }

    #[test]
    fn test_container_occlusion_applies_after_flush() {
        let (mut world, tree) = world_with_tree();
        let entity = world
            .spawn_light(tree, Transform2D::identity(), LightComponent::default())
            .unwrap();
        let bounds = Box2Rotated::from(Box2::new(-1.0, -1.0, 1.0, 1.0));

        let light = world.light_mut(entity).unwrap();
        light::set_container_occluded(light, true);
        assert_eq!(world.lights_intersecting(MapId(1), bounds).count(), 1);

        assert_eq!(world.flush_tree_updates(), 1);
        assert_eq!(world.lights_intersecting(MapId(1), bounds).count(), 0);
        assert!(!world.light(entity).unwrap().tree_update_queued());
    }

    #[test]
    fn test_disabled_occluders_are_skipped() {
        let (mut world, tree) = world_with_tree();
        let entity = world
            .spawn_occluder(tree, Transform2D::identity(), OccluderComponent::tile())
            .unwrap();
        world.occluder_mut(entity).unwrap().enabled = false;
        let bounds = Box2::new(-1.0, -1.0, 1.0, 1.0);
        assert_eq!(world.occluders_intersecting(MapId(1), bounds).count(), 0);
    }

    #[test]
    fn test_despawn_keeps_other_slots_addressable() {
        let (mut world, tree) = world_with_tree();
        let first = world.spawn_light(tree, Transform2D::identity(), LightComponent::default()).unwrap();
        let second = world
            .spawn_light(tree, Transform2D::identity(), LightComponent::new(9.0, Color::WHITE))
            .unwrap();
        assert!(world.despawn(first));
        assert!(!world.despawn(first));
        assert_eq!(world.light(second).unwrap().radius, 9.0);
    }
}
