use serde::{Deserialize, Serialize};

use crate::math::{Rotator, Vec3};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Actor,
    Camera,
    Light,
}

/// Read snapshot of one controllable scene object. The external scene owns
/// the live state; snapshots are never written back directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneEntity {
    pub name: String,
    pub kind: EntityKind,
    pub position: Vec3,
    pub rotation: Rotator,
}

impl SceneEntity {
    pub fn new(name: impl Into<String>, kind: EntityKind, position: Vec3) -> Self {
        Self {
            name: name.into(),
            kind,
            position,
            rotation: Rotator::ZERO,
        }
    }
}

/// How proposed positions are interpreted for an entire run: absolute world
/// coordinates, or offsets from each entity's current position. Fixed before
/// the loop starts; there is no per-adjustment override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionMode {
    Absolute,
    Delta,
}

impl PositionMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "absolute" => Some(PositionMode::Absolute),
            "delta" => Some(PositionMode::Delta),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{EntityKind, PositionMode, SceneEntity};
    use crate::math::{Rotator, Vec3};

    #[test]
    fn entity_snapshot_starts_unrotated() {
        let entity = SceneEntity::new("Oat", EntityKind::Actor, Vec3::new(1.0, 2.0, 0.0));
        assert_eq!(entity.rotation, Rotator::ZERO);
    }

    #[test]
    fn position_mode_parses_known_values() {
        assert_eq!(PositionMode::parse("absolute"), Some(PositionMode::Absolute));
        assert_eq!(PositionMode::parse("delta"), Some(PositionMode::Delta));
        assert_eq!(PositionMode::parse("mixed"), None);
    }

    #[test]
    fn entity_round_trips_through_json() {
        let entity = SceneEntity::new("ShotCam", EntityKind::Camera, Vec3::new(0.0, -8.0, 1.6));
        let encoded = serde_json::to_string(&entity).expect("entity should serialize");
        let decoded: SceneEntity =
            serde_json::from_str(&encoded).expect("entity should deserialize");
        assert_eq!(decoded, entity);
    }
}
