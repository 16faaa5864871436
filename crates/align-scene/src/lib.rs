pub mod adapters;
pub mod entity;
pub mod math;

pub use adapters::{
    CaptureError, CaptureOutput, ImageHandle, ModelTransport, RenderAdapter, SceneAdapter,
    SceneError, TransportError,
};
pub use entity::{EntityKind, PositionMode, SceneEntity};
pub use math::{Rotator, Vec3, add, look_at_rotation, midpoint, sub};
