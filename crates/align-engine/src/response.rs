use align_scene::{Rotator, Vec3};
use serde::Deserialize;
use serde_json::Value;

/// Parsed, not-yet-validated model response. Field names are lenient because
/// the model drifts between a handful of spellings for every key; every
/// `entity_ref` in here is untrusted until it passes the validator.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AdjustmentSet {
    #[serde(alias = "similarity_score", alias = "match_score", alias = "score")]
    pub similarity: Option<f64>,
    #[serde(
        rename = "analysis",
        alias = "analysis_text",
        alias = "reasoning",
        alias = "assessment"
    )]
    pub analysis_text: Option<String>,
    #[serde(alias = "adjustments", alias = "entities", alias = "corrections")]
    pub entity_adjustments: Vec<EntityAdjustment>,
    #[serde(alias = "camera")]
    pub camera_adjustment: Option<EntityAdjustment>,
}

/// One proposed correction. An empty `entity_ref` only ever makes sense on
/// the camera channel, where the scene may hold a single obvious camera.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct EntityAdjustment {
    #[serde(alias = "entity", alias = "name", alias = "entity_name")]
    pub entity_ref: String,
    #[serde(alias = "location")]
    pub position: Option<Vec3>,
    pub rotation: Option<Rotator>,
    pub confidence: Option<f64>,
    pub reason: Option<String>,
}

impl AdjustmentSet {
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// The model self-reports on 0.0-1.0; anything above 1 is assumed to
    /// already be percentual. Result is on the 0-100 scale.
    pub fn normalized_similarity(&self) -> Option<f64> {
        self.similarity.map(|raw| {
            let scaled = if raw <= 1.0 { raw * 100.0 } else { raw };
            scaled.clamp(0.0, 100.0)
        })
    }
}
