//! Light component state and the functions that mutate it.
//!
//! Every mutation goes through a free function so that changes affecting
//! spatial-tree membership or bounds queue a tree update exactly once.

use serde::{Deserialize, Serialize};

use crate::color::Color;
use crate::math::Vec2;

/// Replicated state of a point light attached to an entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LightComponent {
    pub enabled: bool,
    /// Offset from the owning entity, in the entity's local frame.
    pub offset: Vec2,
    pub color: Color,
    /// Range in world units.
    pub radius: f32,
    pub energy: f32,
    /// Penumbra width for soft shadows.
    pub softness: f32,
    pub falloff: f32,
    pub curve_factor: f32,
    pub cast_shadows: bool,
    /// Mask rotation in radians.
    pub rotation: f32,
    /// Add the owning entity's rotation to the mask rotation.
    pub mask_auto_rotate: bool,
    /// Light mask prototype id, if any.
    pub mask: Option<String>,
    /// Set while the owning entity is inside an occluding container.
    pub container_occluded: bool,
    #[serde(skip)]
    pub(crate) tree_update_queued: bool,
}

impl LightComponent {
    pub fn new(radius: f32, color: Color) -> Self {
        Self {
            radius,
            color,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_shadows(mut self, cast_shadows: bool) -> Self {
        self.cast_shadows = cast_shadows;
        self
    }

    #[must_use]
    pub fn with_energy(mut self, energy: f32) -> Self {
        self.energy = energy;
        self
    }

    #[must_use]
    pub fn with_offset(mut self, offset: Vec2) -> Self {
        self.offset = offset;
        self
    }

    #[must_use]
    pub fn with_mask(mut self, mask: impl Into<String>) -> Self {
        self.mask = Some(mask.into());
        self
    }

    /// Whether the light belongs in its spatial tree at all.
    pub fn adds_to_tree(&self) -> bool {
        self.enabled && !self.container_occluded
    }

    pub fn tree_update_queued(&self) -> bool {
        self.tree_update_queued
    }
}

impl Default for LightComponent {
    fn default() -> Self {
        Self {
            enabled: true,
            offset: Vec2::ZERO,
            color: Color::WHITE,
            radius: 5.0,
            energy: 1.0,
            softness: 1.0,
            falloff: 6.8,
            curve_factor: 0.0,
            cast_shadows: true,
            rotation: 0.0,
            mask_auto_rotate: false,
            mask: None,
            container_occluded: false,
            tree_update_queued: false,
        }
    }
}

fn queue_tree_update(light: &mut LightComponent) {
    light.tree_update_queued = true;
}

/// Returns true when the value changed.
pub fn set_enabled(light: &mut LightComponent, enabled: bool) -> bool {
    if light.enabled == enabled {
        return false;
    }
    light.enabled = enabled;
    queue_tree_update(light);
    true
}

pub fn set_container_occluded(light: &mut LightComponent, occluded: bool) -> bool {
    if light.container_occluded == occluded {
        return false;
    }
    light.container_occluded = occluded;
    queue_tree_update(light);
    true
}

/// Radius changes below 0.1% do not move the light's tree bounds.
pub fn set_radius(light: &mut LightComponent, radius: f32) -> bool {
    let radius = radius.max(0.0);
    if (light.radius - radius).abs() <= light.radius.abs() * 1e-3 {
        return false;
    }
    light.radius = radius;
    queue_tree_update(light);
    true
}

pub fn set_offset(light: &mut LightComponent, offset: Vec2) -> bool {
    if light.offset == offset {
        return false;
    }
    light.offset = offset;
    queue_tree_update(light);
    true
}

pub fn set_cast_shadows(light: &mut LightComponent, cast_shadows: bool) {
    light.cast_shadows = cast_shadows;
}

pub fn set_color(light: &mut LightComponent, color: Color) {
    light.color = color;
}

pub fn set_energy(light: &mut LightComponent, energy: f32) {
    light.energy = energy;
}

pub fn set_softness(light: &mut LightComponent, softness: f32) {
    light.softness = softness.max(0.0);
}

pub fn set_rotation(light: &mut LightComponent, rotation: f32) {
    light.rotation = rotation;
}

pub fn set_mask(light: &mut LightComponent, mask: Option<String>) {
    light.mask = mask;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_membership_changes_queue_tree_update() {
        let mut light = LightComponent::default();
        assert!(!light.tree_update_queued());
        assert!(set_container_occluded(&mut light, true));
        assert!(light.tree_update_queued());
        assert!(!light.adds_to_tree());
    }

    #[test]
    fn test_unchanged_values_do_not_queue() {
        let mut light = LightComponent::default();
        assert!(!set_enabled(&mut light, true));
        assert!(!set_radius(&mut light, 5.001));
        set_energy(&mut light, 3.0);
        assert!(!light.tree_update_queued());
    }

    #[test]
    fn test_radius_change_queues() {
        let mut light = LightComponent::default();
        assert!(set_radius(&mut light, 8.0));
        assert_eq!(light.radius, 8.0);
        assert!(light.tree_update_queued());
    }
}
