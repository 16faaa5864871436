use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt;

use crate::entity::{PositionMode, SceneEntity};
use crate::math::{Rotator, Vec3, look_at_rotation};

/// Opaque renderer-issued token for one captured image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHandle(pub String);

impl ImageHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

/// One iteration's worth of rendered images. Views the renderer could not
/// produce land in `failed_views`; a partial capture is data, not an error.
#[derive(Debug, Clone, Default)]
pub struct CaptureOutput {
    pub images: BTreeMap<String, ImageHandle>,
    pub depth_images: BTreeMap<String, ImageHandle>,
    pub reference_depth: Option<ImageHandle>,
    pub failed_views: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SceneError {
    NotFound(String),
    SceneUnavailable(String),
    Mutation { name: String, message: String },
}

impl fmt::Display for SceneError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SceneError::NotFound(name) => write!(f, "entity '{name}' not found"),
            SceneError::SceneUnavailable(message) => {
                write!(f, "scene unavailable: {message}")
            }
            SceneError::Mutation { name, message } => {
                write!(f, "mutation of '{name}' failed: {message}")
            }
        }
    }
}

impl Error for SceneError {}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureError {
    message: String,
}

impl CaptureError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "capture failed: {}", self.message)
    }
}

impl Error for CaptureError {}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportError {
    message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "model transport failed: {}", self.message)
    }
}

impl Error for TransportError {}

/// Mutation seam onto the external scene. Entities can appear or disappear
/// between calls; `entity_names` failing means the scene itself is gone.
pub trait SceneAdapter {
    fn entity_names(&self) -> Result<BTreeSet<String>, SceneError>;

    fn entity(&self, name: &str) -> Option<SceneEntity>;

    fn apply_position(
        &mut self,
        name: &str,
        position: Vec3,
        mode: PositionMode,
    ) -> Result<(), SceneError>;

    fn apply_rotation(&mut self, name: &str, rotation: Rotator) -> Result<(), SceneError>;

    fn lookat_rotation(&self, from: Vec3, to: Vec3) -> Rotator {
        look_at_rotation(from, to)
    }
}

pub trait RenderAdapter {
    fn available_views(&self) -> BTreeSet<String>;

    fn capture(
        &mut self,
        views: &[String],
        depth_views: &[String],
        include_reference_depth: bool,
    ) -> Result<CaptureOutput, CaptureError>;
}

/// Vision-model seam. Retry, backoff, and auth belong behind this trait; a
/// returned error means the response for this round is simply unavailable.
pub trait ModelTransport {
    fn send(&mut self, prompt: &str, images: &[ImageHandle]) -> Result<String, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::{CaptureError, SceneError, TransportError};

    #[test]
    fn scene_error_messages_name_the_entity() {
        let err = SceneError::NotFound("Bench".to_string());
        assert_eq!(err.to_string(), "entity 'Bench' not found");

        let err = SceneError::Mutation {
            name: "Oat".to_string(),
            message: "locked".to_string(),
        };
        assert_eq!(err.to_string(), "mutation of 'Oat' failed: locked");
    }

    #[test]
    fn adapter_errors_render_their_context() {
        assert_eq!(
            CaptureError::new("viewport lost").to_string(),
            "capture failed: viewport lost"
        );
        assert_eq!(
            TransportError::new("timeout").to_string(),
            "model transport failed: timeout"
        );
    }
}
