use serde::{Deserialize, Serialize};

/// World-space position or offset in scene units.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub const ZERO: Vec3 = Vec3 {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };
}

/// Orientation in degrees. Yaw turns around the vertical axis, pitch tilts
/// toward the vertical, roll banks around the forward axis.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rotator {
    pub pitch: f64,
    pub yaw: f64,
    pub roll: f64,
}

impl Rotator {
    pub fn new(pitch: f64, yaw: f64, roll: f64) -> Self {
        Self { pitch, yaw, roll }
    }

    pub const ZERO: Rotator = Rotator {
        pitch: 0.0,
        yaw: 0.0,
        roll: 0.0,
    };
}

/// Component-wise sum.
#[inline]
pub fn add(a: Vec3, b: Vec3) -> Vec3 {
    Vec3::new(a.x + b.x, a.y + b.y, a.z + b.z)
}

/// Component-wise difference.
#[inline]
pub fn sub(a: Vec3, b: Vec3) -> Vec3 {
    Vec3::new(a.x - b.x, a.y - b.y, a.z - b.z)
}

#[inline]
fn length(v: Vec3) -> f64 {
    (v.x * v.x + v.y * v.y + v.z * v.z).sqrt()
}

/// Arithmetic mean of a set of points. Empty input yields the origin.
pub fn midpoint(points: &[Vec3]) -> Vec3 {
    if points.is_empty() {
        return Vec3::ZERO;
    }
    let mut sum = Vec3::ZERO;
    for point in points {
        sum = add(sum, *point);
    }
    let inv = 1.0 / points.len() as f64;
    Vec3::new(sum.x * inv, sum.y * inv, sum.z * inv)
}

/// Rotation that aims the forward axis at `to` from `from`. Roll is always
/// zero; coincident points yield the zero rotator.
pub fn look_at_rotation(from: Vec3, to: Vec3) -> Rotator {
    let delta = sub(to, from);
    if length(delta) <= f64::EPSILON {
        return Rotator::ZERO;
    }

    let ground = (delta.x * delta.x + delta.y * delta.y).sqrt();
    let yaw = delta.y.atan2(delta.x).to_degrees();
    let pitch = delta.z.atan2(ground).to_degrees();

    Rotator::new(pitch, yaw, 0.0)
}
