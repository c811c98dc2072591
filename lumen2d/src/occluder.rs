use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::math::Box2;

bitflags! {
    /// Faces of an occluder that touch a neighbouring occluder.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct OccluderDir: u8 {
        const NORTH = 1 << 0;
        const EAST  = 1 << 1;
        const SOUTH = 1 << 2;
        const WEST  = 1 << 3;
        const ALL = Self::NORTH.bits() | Self::EAST.bits() | Self::SOUTH.bits() | Self::WEST.bits();
    }
}

/// A wall-like entity that blocks light and vision.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OccluderComponent {
    /// Rectangle in the entity's local frame.
    pub bounding_box: Box2,
    pub enabled: bool,
    /// Faces blocked by a neighbouring occluder.
    pub occluding: OccluderDir,
}

impl OccluderComponent {
    pub fn new(bounding_box: Box2) -> Self {
        Self {
            bounding_box,
            enabled: true,
            occluding: OccluderDir::empty(),
        }
    }

    /// A 1x1 tile centred on the entity, the common wall shape.
    pub fn tile() -> Self {
        Self::new(Box2::new(-0.5, -0.5, 0.5, 0.5))
    }

    #[must_use]
    pub fn with_neighbors(mut self, occluding: OccluderDir) -> Self {
        self.occluding = occluding;
        self
    }
}

impl Default for OccluderComponent {
    fn default() -> Self {
        Self::tile()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dir_set_operations() {
        let dirs = OccluderDir::NORTH | OccluderDir::WEST;
        assert!(dirs.contains(OccluderDir::NORTH));
        assert!(!dirs.contains(OccluderDir::EAST));
        assert_eq!(dirs - OccluderDir::NORTH, OccluderDir::WEST);
        assert_eq!(OccluderDir::from_bits_truncate(0xff), OccluderDir::ALL);
        assert_eq!(OccluderDir::default(), OccluderDir::empty());
    }

    #[test]
    fn test_neighbours_round_trip_through_json() {
        let occluder = OccluderComponent::tile().with_neighbors(OccluderDir::EAST | OccluderDir::SOUTH);
        let json = serde_json::to_string(&occluder).unwrap();
        let parsed: OccluderComponent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.occluding, OccluderDir::EAST | OccluderDir::SOUTH);
    }
}
