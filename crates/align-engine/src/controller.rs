use std::collections::BTreeSet;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use align_extract::extract_structured;
use align_scene::{
    CaptureOutput, EntityKind, ImageHandle, ModelTransport, PositionMode, RenderAdapter,
    SceneAdapter, Vec3, midpoint,
};
use tracing::{debug, info, warn};

use crate::report::{IterationRecord, RunReport, RunStatus};
use crate::response::{AdjustmentSet, EntityAdjustment};
use crate::strategy::{
    CaptureSet, CaptureStrategySelector, HERO_VIEW, SceneProfile, SelectorConfig,
};
use crate::validator::{ValidatorConfig, validate_ref};

pub const DEFAULT_MAX_ITERATIONS: u32 = 10;
pub const DEFAULT_CAPTURE_RETRY_BUDGET: u32 = 2;

const RESPONSE_EXCERPT_LEN: usize = 160;

/// Fixed tail of every alignment prompt: the response contract.
pub const RESPONSE_GUIDE: &str = r#"Compare the rendered views against the reference panel and respond with a single JSON object:
{
  "similarity": <0.0-1.0 match score>,
  "analysis": "<short description of the main mismatches>",
  "entity_adjustments": [
    {
      "entity_ref": "<exact entity name from the list>",
      "position": {"x": 0.0, "y": 0.0, "z": 0.0},
      "rotation": {"pitch": 0.0, "yaw": 0.0, "roll": 0.0},
      "confidence": <0.0-1.0>,
      "reason": "<why this correction helps>"
    }
  ],
  "camera_adjustment": {"entity_ref": "<camera name>", "position": {"x": 0.0, "y": 0.0, "z": 0.0}}
}

Rules:
- Only reference entities from the provided list.
- Never propose changes to weather, lighting, ground, sky, or other environment.
- Omit entities that already match the panel.
"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    message: String,
}

impl ConfigError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid run configuration: {}", self.message)
    }
}

impl Error for ConfigError {}

/// Run-level settings, fixed before the loop starts. The position mode in
/// particular holds for the whole run; a mixed-mode run is unrepresentable.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub max_iterations: u32,
    pub position_mode: PositionMode,
    pub target_description: String,
    /// Entities the camera should frame; empty means every actor.
    pub subjects: Vec<String>,
    pub capture_retry_budget: u32,
    pub profile: SceneProfile,
    pub validator: ValidatorConfig,
    pub selector: SelectorConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            position_mode: PositionMode::Absolute,
            target_description: String::new(),
            subjects: Vec::new(),
            capture_retry_budget: DEFAULT_CAPTURE_RETRY_BUDGET,
            profile: SceneProfile::default(),
            validator: ValidatorConfig::default(),
            selector: SelectorConfig::default(),
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_iterations == 0 {
            return Err(ConfigError::new("max_iterations must be at least 1"));
        }
        if self.validator.fuzzy_threshold > 100 || self.validator.confidence_threshold > 100 {
            return Err(ConfigError::new("validator thresholds must be within 0-100"));
        }
        if self.validator.fuzzy_threshold > self.validator.confidence_threshold {
            return Err(ConfigError::new(
                "fuzzy_threshold must not exceed confidence_threshold",
            ));
        }
        for (label, value) in [
            ("high_confidence_threshold", self.selector.high_confidence_threshold),
            ("struggling_threshold", self.selector.struggling_threshold),
            ("good_score_threshold", self.selector.good_score_threshold),
            ("convergence_threshold", self.selector.convergence_threshold),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(ConfigError::new(format!("{label} must be within 0-100")));
            }
        }
        if self.selector.plateau_delta < 0.0 {
            return Err(ConfigError::new("plateau_delta must not be negative"));
        }
        if self.selector.plateau_window < 2 {
            return Err(ConfigError::new("plateau_window must be at least 2"));
        }
        Ok(())
    }
}

/// Cooperative cancellation handle. Cheap to clone; the controller checks it
/// at the top of every iteration, so no iteration is left half-applied.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Drives the capture -> judge -> validate -> apply loop until the scene is
/// judged close enough, progress stalls, or a safety limit is reached.
/// Per-iteration problems are recovered locally and leave breadcrumbs in the
/// history; only repeated capture failures or a vanished scene end the run
/// early.
pub struct ConvergenceController<S, R, M> {
    scene: S,
    renderer: R,
    transport: M,
    config: RunConfig,
    selector: CaptureStrategySelector,
    cancel: CancelFlag,
}

impl<S: SceneAdapter, R: RenderAdapter, M: ModelTransport> ConvergenceController<S, R, M> {
    pub fn new(scene: S, renderer: R, transport: M, config: RunConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let selector = CaptureStrategySelector::new(config.selector);
        Ok(Self {
            scene,
            renderer,
            transport,
            config,
            selector,
            cancel: CancelFlag::new(),
        })
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn into_parts(self) -> (S, R, M) {
        (self.scene, self.renderer, self.transport)
    }

    pub fn run(&mut self) -> RunReport {
        let mut history: Vec<IterationRecord> = Vec::new();
        let mut last_similarity: Option<f64> = None;
        let mut capture_failures = 0u32;
        let mut status = RunStatus::MaxIterations;

        for iteration in 1..=self.config.max_iterations {
            if self.cancel.is_cancelled() {
                status = RunStatus::Cancelled;
                break;
            }

            let available = self.renderer.available_views();
            let plan =
                self.selector
                    .select(iteration, last_similarity, &self.config.profile, &available);
            let mut record = IterationRecord {
                iteration,
                strategy_name: plan.strategy.name(),
                capture_summary: summarize_plan(&plan),
                raw_response_excerpt: String::new(),
                applied: 0,
                rejected_refs: Vec::new(),
                similarity: last_similarity,
                timestamp: SystemTime::now(),
                notes: Vec::new(),
            };

            // A capture without the hero view has nothing to score, so it
            // counts as a failed capture.
            let capture = match self.renderer.capture(
                &plan.views,
                &plan.depth_views,
                plan.include_reference_depth,
            ) {
                Ok(output) if output.images.contains_key(HERO_VIEW) => {
                    capture_failures = 0;
                    output
                }
                outcome => {
                    let note = match outcome {
                        Ok(_) => "capture missing hero view".to_string(),
                        Err(err) => format!("capture failed: {err}"),
                    };
                    warn!(iteration, note = %note, "skipping iteration");
                    record.notes.push(note);
                    self.selector.record_score(None);
                    history.push(record);
                    capture_failures += 1;
                    if capture_failures > self.config.capture_retry_budget {
                        status = RunStatus::Failed;
                        break;
                    }
                    continue;
                }
            };
            if !capture.failed_views.is_empty() {
                record
                    .notes
                    .push(format!("views not rendered: {}", capture.failed_views.join(", ")));
            }

            let names = match self.scene.entity_names() {
                Ok(names) => names,
                Err(err) => {
                    record.notes.push(format!("scene unavailable: {err}"));
                    history.push(record);
                    status = RunStatus::Failed;
                    break;
                }
            };

            let prompt = build_alignment_prompt(&self.config, iteration, last_similarity, &names);
            let images = ordered_images(&plan, &capture);
            let raw = match self.transport.send(&prompt, &images) {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(iteration, error = %err, "no response this iteration");
                    record.notes.push(format!("transport failed: {err}"));
                    self.selector.record_score(None);
                    history.push(record);
                    continue;
                }
            };
            record.raw_response_excerpt = excerpt(&raw);

            let set = match extract_structured(&raw).map_err(|err| err.to_string()).and_then(
                |value| AdjustmentSet::from_value(value).map_err(|err| err.to_string()),
            ) {
                Ok(set) => set,
                Err(err) => {
                    // One bad response must not crater the trend line; the
                    // previous similarity is carried forward unchanged.
                    warn!(iteration, error = %err, "unusable response");
                    record.notes.push(format!("unusable response: {err}"));
                    self.selector.record_score(None);
                    history.push(record);
                    continue;
                }
            };

            // Fresh fetch: entities can appear or disappear while the model
            // round trip is in flight.
            let live_names = match self.scene.entity_names() {
                Ok(names) => names,
                Err(err) => {
                    record.notes.push(format!("scene unavailable: {err}"));
                    history.push(record);
                    status = RunStatus::Failed;
                    break;
                }
            };

            let mut applied = 0usize;
            for adjustment in &set.entity_adjustments {
                if self.validate_and_apply(adjustment, &live_names, &mut record) {
                    applied += 1;
                }
            }
            if let Some(camera) = &set.camera_adjustment
                && self.apply_camera_adjustment(camera, &live_names, &mut record)
            {
                applied += 1;
            }
            record.applied = applied;

            let similarity = set.normalized_similarity();
            if similarity.is_none() {
                record.notes.push("response carried no similarity score".to_string());
            }
            record.similarity = similarity.or(last_similarity);
            self.selector.record_score(similarity);
            if similarity.is_some() {
                last_similarity = similarity;
            }
            debug!(
                iteration,
                similarity = ?record.similarity,
                applied,
                rejected = record.rejected_refs.len(),
                "iteration complete"
            );
            history.push(record);

            if self
                .selector
                .is_converged(self.config.selector.convergence_threshold)
            {
                status = RunStatus::Converged;
                break;
            }
            if iteration >= 3
                && self.selector.is_plateaued(
                    self.config.selector.plateau_window,
                    self.config.selector.plateau_delta,
                )
            {
                status = RunStatus::Plateaued;
                break;
            }
        }

        info!(status = %status, iterations = history.len(), final_similarity = ?last_similarity, "alignment run finished");
        RunReport {
            status,
            final_similarity: last_similarity,
            history,
        }
    }

    fn validate_and_apply(
        &mut self,
        adjustment: &EntityAdjustment,
        live_names: &BTreeSet<String>,
        record: &mut IterationRecord,
    ) -> bool {
        let outcome = validate_ref(&adjustment.entity_ref, live_names, &self.config.validator);
        let Some(resolved) = outcome.resolved_name.clone() else {
            warn!(
                entity_ref = %adjustment.entity_ref,
                reason = outcome.reason.as_deref().unwrap_or("rejected"),
                "dropping proposed adjustment"
            );
            record.rejected_refs.push(adjustment.entity_ref.clone());
            return false;
        };
        if outcome.low_confidence {
            record.notes.push(format!(
                "low-confidence match: '{}' -> '{}' (score {})",
                adjustment.entity_ref, resolved, outcome.score
            ));
        }
        self.apply_adjustment(&resolved, adjustment, record)
    }

    fn apply_adjustment(
        &mut self,
        resolved: &str,
        adjustment: &EntityAdjustment,
        record: &mut IterationRecord,
    ) -> bool {
        let Some(entity) = self.scene.entity(resolved) else {
            record
                .notes
                .push(format!("'{resolved}' disappeared before apply"));
            return false;
        };
        if entity.kind == EntityKind::Camera {
            // Even when the model routes a camera through the entity list,
            // its aim is still derived, never trusted.
            return self.apply_camera_move(resolved, adjustment, record);
        }

        let mut applied = false;
        if let Some(position) = adjustment.position {
            match self
                .scene
                .apply_position(resolved, position, self.config.position_mode)
            {
                Ok(()) => applied = true,
                Err(err) => record
                    .notes
                    .push(format!("position of '{resolved}' not applied: {err}")),
            }
        }
        if let Some(rotation) = adjustment.rotation {
            match self.scene.apply_rotation(resolved, rotation) {
                Ok(()) => applied = true,
                Err(err) => record
                    .notes
                    .push(format!("rotation of '{resolved}' not applied: {err}")),
            }
        }
        applied
    }

    fn apply_camera_adjustment(
        &mut self,
        camera: &EntityAdjustment,
        live_names: &BTreeSet<String>,
        record: &mut IterationRecord,
    ) -> bool {
        let resolved = if camera.entity_ref.is_empty() {
            // An unnamed camera block is honored only when the scene has
            // exactly one camera to mean.
            let mut cameras = live_names.iter().filter(|name| {
                self.scene
                    .entity(name)
                    .is_some_and(|entity| entity.kind == EntityKind::Camera)
            });
            match (cameras.next(), cameras.next()) {
                (Some(only), None) => only.clone(),
                _ => {
                    record
                        .notes
                        .push("camera adjustment without a resolvable camera".to_string());
                    return false;
                }
            }
        } else {
            let outcome = validate_ref(&camera.entity_ref, live_names, &self.config.validator);
            match outcome.resolved_name {
                Some(name) => name,
                None => {
                    record.rejected_refs.push(camera.entity_ref.clone());
                    return false;
                }
            }
        };

        let is_camera = self
            .scene
            .entity(&resolved)
            .is_some_and(|entity| entity.kind == EntityKind::Camera);
        if !is_camera {
            record
                .notes
                .push(format!("camera adjustment targets non-camera '{resolved}'"));
            return false;
        }
        self.apply_camera_move(&resolved, camera, record)
    }

    /// Applies a camera position and recomputes its aim from geometry. The
    /// model's proposed camera rotation is discarded unconditionally.
    fn apply_camera_move(
        &mut self,
        camera: &str,
        adjustment: &EntityAdjustment,
        record: &mut IterationRecord,
    ) -> bool {
        let Some(position) = adjustment.position else {
            return false;
        };
        match self
            .scene
            .apply_position(camera, position, self.config.position_mode)
        {
            Ok(()) => {
                self.aim_camera(camera, record);
                true
            }
            Err(err) => {
                record
                    .notes
                    .push(format!("camera position not applied: {err}"));
                false
            }
        }
    }

    fn aim_camera(&mut self, camera: &str, record: &mut IterationRecord) {
        let Some(entity) = self.scene.entity(camera) else {
            record
                .notes
                .push(format!("camera '{camera}' disappeared before aiming"));
            return;
        };
        let Some(target) = self.lookat_target() else {
            record
                .notes
                .push("no look-at subject; camera aim unchanged".to_string());
            return;
        };
        let rotation = self.scene.lookat_rotation(entity.position, target);
        if let Err(err) = self.scene.apply_rotation(camera, rotation) {
            record.notes.push(format!("camera aim not applied: {err}"));
        }
    }

    /// Midpoint of the configured subjects, falling back to every actor
    /// present when none are configured (or none survive).
    fn lookat_target(&self) -> Option<Vec3> {
        let mut points = Vec::new();
        for name in &self.config.subjects {
            if let Some(entity) = self.scene.entity(name) {
                points.push(entity.position);
            }
        }
        if points.is_empty() {
            let names = self.scene.entity_names().ok()?;
            for name in &names {
                if let Some(entity) = self.scene.entity(name)
                    && entity.kind == EntityKind::Actor
                {
                    points.push(entity.position);
                }
            }
        }
        if points.is_empty() {
            None
        } else {
            Some(midpoint(&points))
        }
    }
}

fn build_alignment_prompt(
    config: &RunConfig,
    iteration: u32,
    previous: Option<f64>,
    names: &BTreeSet<String>,
) -> String {
    let name_list = names.iter().cloned().collect::<Vec<_>>().join(", ");
    let mut lines = vec![
        format!("Iteration {iteration} of a scene alignment session."),
        format!("Target panel: {}", config.target_description),
        format!("Scene entities: {name_list}"),
        match config.position_mode {
            PositionMode::Absolute => {
                "Positions you propose are absolute world coordinates.".to_string()
            }
            PositionMode::Delta => {
                "Positions you propose are offsets from each entity's current position.".to_string()
            }
        },
    ];
    if iteration >= 2 {
        if let Some(previous) = previous {
            lines.push(format!("Previous similarity score: {previous:.1} of 100."));
        }
        lines.push(magnitude_guidance(iteration, previous).to_string());
    }
    lines.push(String::new());
    lines.push(RESPONSE_GUIDE.to_string());
    lines.join("\n")
}

/// The model calibrates correction size to how close the scene already is.
fn magnitude_guidance(iteration: u32, previous: Option<f64>) -> &'static str {
    if iteration <= 2 {
        "Make bold corrections; large errors are expected this early."
    } else if iteration >= 6 && previous.is_some_and(|score| score >= 75.0) {
        "Make small, precise corrections; the scene is nearly aligned."
    } else {
        "Make moderate corrections."
    }
}

/// Hero first, remaining RGB views in plan order, depth maps, reference
/// depth last.
fn ordered_images(plan: &CaptureSet, capture: &CaptureOutput) -> Vec<ImageHandle> {
    let mut images = Vec::new();
    for view in &plan.views {
        if let Some(handle) = capture.images.get(view) {
            images.push(handle.clone());
        }
    }
    for view in &plan.depth_views {
        if let Some(handle) = capture.depth_images.get(view) {
            images.push(handle.clone());
        }
    }
    if let Some(handle) = &capture.reference_depth {
        images.push(handle.clone());
    }
    images
}

fn summarize_plan(plan: &CaptureSet) -> String {
    format!(
        "{} rgb, {} depth{}, est ${:.3} / {} tokens",
        plan.views.len(),
        plan.depth_views.len(),
        if plan.include_reference_depth {
            ", ref depth"
        } else {
            ""
        },
        plan.estimated_cost,
        plan.estimated_tokens,
    )
}

fn excerpt(raw: &str) -> String {
    raw.trim_start().chars().take(RESPONSE_EXCERPT_LEN).collect()
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet, VecDeque};

    use align_scene::{
        CaptureError, CaptureOutput, EntityKind, ImageHandle, ModelTransport, PositionMode,
        RenderAdapter, Rotator, SceneAdapter, SceneEntity, SceneError, TransportError, Vec3, add,
        look_at_rotation,
    };

    use super::{CancelFlag, ConvergenceController, RunConfig};
    use crate::report::RunStatus;
    use crate::strategy::{SceneProfile, ShotType};

    #[derive(Debug, Clone, PartialEq)]
    enum Mutation {
        Position {
            name: String,
            position: Vec3,
            mode: PositionMode,
        },
        Rotation {
            name: String,
            rotation: Rotator,
        },
    }

    #[derive(Default)]
    struct SimScene {
        entities: BTreeMap<String, SceneEntity>,
        mutations: Vec<Mutation>,
        name_calls: std::cell::Cell<usize>,
        fail_names_after: Option<usize>,
    }

    impl SimScene {
        fn with_entity(mut self, name: &str, kind: EntityKind, position: Vec3) -> Self {
            self.entities
                .insert(name.to_string(), SceneEntity::new(name, kind, position));
            self
        }

        fn failing_names_after(mut self, calls: usize) -> Self {
            self.fail_names_after = Some(calls);
            self
        }
    }

    impl SceneAdapter for SimScene {
        fn entity_names(&self) -> Result<BTreeSet<String>, SceneError> {
            let calls = self.name_calls.get() + 1;
            self.name_calls.set(calls);
            if let Some(limit) = self.fail_names_after
                && calls > limit
            {
                return Err(SceneError::SceneUnavailable("level unloaded".to_string()));
            }
            Ok(self.entities.keys().cloned().collect())
        }

        fn entity(&self, name: &str) -> Option<SceneEntity> {
            self.entities.get(name).cloned()
        }

        fn apply_position(
            &mut self,
            name: &str,
            position: Vec3,
            mode: PositionMode,
        ) -> Result<(), SceneError> {
            let entity = self
                .entities
                .get_mut(name)
                .ok_or_else(|| SceneError::NotFound(name.to_string()))?;
            entity.position = match mode {
                PositionMode::Absolute => position,
                PositionMode::Delta => add(entity.position, position),
            };
            self.mutations.push(Mutation::Position {
                name: name.to_string(),
                position,
                mode,
            });
            Ok(())
        }

        fn apply_rotation(&mut self, name: &str, rotation: Rotator) -> Result<(), SceneError> {
            let entity = self
                .entities
                .get_mut(name)
                .ok_or_else(|| SceneError::NotFound(name.to_string()))?;
            entity.rotation = rotation;
            self.mutations.push(Mutation::Rotation {
                name: name.to_string(),
                rotation,
            });
            Ok(())
        }
    }

    #[derive(Default)]
    struct SimRenderer {
        missing_views: BTreeSet<String>,
        scripted_failures: VecDeque<bool>,
        captures: usize,
    }

    impl SimRenderer {
        fn failing_first(count: usize) -> Self {
            Self {
                scripted_failures: std::iter::repeat_n(true, count).collect(),
                ..Self::default()
            }
        }
    }

    impl RenderAdapter for SimRenderer {
        fn available_views(&self) -> BTreeSet<String> {
            ["hero", "front", "right", "left", "back", "top", "three_quarter"]
                .iter()
                .filter(|view| !self.missing_views.contains(**view))
                .map(|view| view.to_string())
                .collect()
        }

        fn capture(
            &mut self,
            views: &[String],
            depth_views: &[String],
            include_reference_depth: bool,
        ) -> Result<CaptureOutput, CaptureError> {
            self.captures += 1;
            if self.scripted_failures.pop_front().unwrap_or(false) {
                return Err(CaptureError::new("viewport lost"));
            }

            let mut output = CaptureOutput::default();
            for view in views {
                if self.missing_views.contains(view) {
                    output.failed_views.push(view.clone());
                } else {
                    output.images.insert(
                        view.clone(),
                        ImageHandle::new(format!("rgb:{view}:{}", self.captures)),
                    );
                }
            }
            for view in depth_views {
                output.depth_images.insert(
                    view.clone(),
                    ImageHandle::new(format!("depth:{view}:{}", self.captures)),
                );
            }
            if include_reference_depth {
                output.reference_depth =
                    Some(ImageHandle::new(format!("depth:reference:{}", self.captures)));
            }
            Ok(output)
        }
    }

    #[derive(Debug, Clone)]
    struct SentRequest {
        prompt: String,
        images: Vec<String>,
    }

    #[derive(Default)]
    struct ScriptedTransport {
        responses: VecDeque<Result<String, TransportError>>,
        requests: Vec<SentRequest>,
        cancel_after: Option<(usize, CancelFlag)>,
    }

    impl ScriptedTransport {
        fn with_response(mut self, response: &str) -> Self {
            self.responses.push_back(Ok(response.to_string()));
            self
        }

        fn with_failure(mut self) -> Self {
            self.responses
                .push_back(Err(TransportError::new("gateway timeout")));
            self
        }

        fn cancelling_after(mut self, sends: usize, flag: CancelFlag) -> Self {
            self.cancel_after = Some((sends, flag));
            self
        }
    }

    impl ModelTransport for ScriptedTransport {
        fn send(&mut self, prompt: &str, images: &[ImageHandle]) -> Result<String, TransportError> {
            self.requests.push(SentRequest {
                prompt: prompt.to_string(),
                images: images.iter().map(|handle| handle.0.clone()).collect(),
            });
            if let Some((after, flag)) = &self.cancel_after
                && self.requests.len() >= *after
            {
                flag.cancel();
            }
            self.responses
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::new("script exhausted")))
        }
    }

    fn cast_scene() -> SimScene {
        SimScene::default()
            .with_entity("Oat", EntityKind::Actor, Vec3::new(1.0, 2.0, 0.0))
            .with_entity("Ball", EntityKind::Actor, Vec3::new(3.0, -1.0, 0.0))
            .with_entity("Bench", EntityKind::Actor, Vec3::new(-2.0, 0.0, 0.0))
            .with_entity("ShotCam", EntityKind::Camera, Vec3::new(0.0, -8.0, 1.6))
    }

    fn config(max_iterations: u32) -> RunConfig {
        RunConfig {
            max_iterations,
            target_description: "dog and ball by a park bench".to_string(),
            profile: SceneProfile {
                entity_count: 4,
                shot_type: ShotType::Standard,
            },
            ..RunConfig::default()
        }
    }

    fn score_only(similarity: f64) -> String {
        format!("{{\"similarity\": {similarity}, \"entity_adjustments\": []}}")
    }

    fn controller(
        scene: SimScene,
        renderer: SimRenderer,
        transport: ScriptedTransport,
        config: RunConfig,
    ) -> ConvergenceController<SimScene, SimRenderer, ScriptedTransport> {
        ConvergenceController::new(scene, renderer, transport, config)
            .expect("test config should validate")
    }

    #[test]
    fn run_converges_when_scores_climb() {
        let transport = ScriptedTransport::default()
            .with_response(&score_only(0.45))
            .with_response(&score_only(0.70))
            .with_response(&score_only(0.88));
        let mut controller = controller(
            cast_scene(),
            SimRenderer::default(),
            transport,
            config(10),
        );

        let report = controller.run();
        assert_eq!(report.status, RunStatus::Converged);
        assert_eq!(report.history.len(), 3);
        assert_eq!(report.final_similarity, Some(88.0));
    }

    #[test]
    fn flat_scores_plateau_by_iteration_three() {
        let transport = ScriptedTransport::default()
            .with_response(&score_only(0.70))
            .with_response(&score_only(0.72))
            .with_response(&score_only(0.71));
        let mut controller = controller(
            cast_scene(),
            SimRenderer::default(),
            transport,
            config(10),
        );

        let report = controller.run();
        assert_eq!(report.status, RunStatus::Plateaued);
        assert_eq!(report.history.len(), 3);
    }

    #[test]
    fn iteration_ceiling_is_absolute() {
        let transport = ScriptedTransport::default()
            .with_response(&score_only(0.30))
            .with_response(&score_only(0.40))
            .with_response(&score_only(0.32))
            .with_response(&score_only(0.45));
        let mut controller = controller(
            cast_scene(),
            SimRenderer::default(),
            transport,
            config(4),
        );

        let report = controller.run();
        assert_eq!(report.status, RunStatus::MaxIterations);
        assert_eq!(report.history.len(), 4);
    }

    #[test]
    fn hallucinated_refs_never_reach_the_scene() {
        let response = r#"{
            "similarity": 0.5,
            "entity_adjustments": [
                {"entity_ref": "oat", "position": {"x": 2.0, "y": 2.0, "z": 0.0}},
                {"entity_ref": "Dog", "position": {"x": 9.0, "y": 9.0, "z": 9.0}},
                {"entity_ref": "the weather", "position": {"x": 0.0, "y": 0.0, "z": 0.0}}
            ]
        }"#;
        let transport = ScriptedTransport::default()
            .with_response(response)
            .with_response(&score_only(0.90));
        let mut controller = controller(
            cast_scene(),
            SimRenderer::default(),
            transport,
            config(5),
        );

        let report = controller.run();
        assert_eq!(report.status, RunStatus::Converged);
        assert_eq!(report.history[0].applied, 1);
        assert_eq!(
            report.history[0].rejected_refs,
            vec!["Dog".to_string(), "the weather".to_string()]
        );

        let (scene, _, _) = controller.into_parts();
        assert!(
            scene
                .mutations
                .iter()
                .all(|mutation| !matches!(mutation, Mutation::Position { name, .. } if name == "Dog")),
            "rejected refs must never mutate the scene"
        );
        assert_eq!(
            scene.entities["Oat"].position,
            Vec3::new(2.0, 2.0, 0.0),
            "case-insensitive match should resolve and apply"
        );
    }

    #[test]
    fn unusable_response_carries_similarity_forward() {
        let transport = ScriptedTransport::default()
            .with_response(&score_only(0.60))
            .with_response("I cannot judge these captures, sorry.")
            .with_response(&score_only(0.62));
        let mut controller = controller(
            cast_scene(),
            SimRenderer::default(),
            transport,
            config(3),
        );

        let report = controller.run();
        assert_eq!(report.status, RunStatus::MaxIterations);
        let skipped = &report.history[1];
        assert_eq!(skipped.applied, 0);
        assert_eq!(skipped.similarity, Some(60.0));
        assert!(
            skipped
                .notes
                .iter()
                .any(|note| note.contains("unusable response"))
        );
        assert_eq!(report.final_similarity, Some(62.0));
    }

    #[test]
    fn transport_failure_skips_the_iteration() {
        let transport = ScriptedTransport::default()
            .with_failure()
            .with_response(&score_only(0.90));
        let mut controller = controller(
            cast_scene(),
            SimRenderer::default(),
            transport,
            config(5),
        );

        let report = controller.run();
        assert_eq!(report.status, RunStatus::Converged);
        assert_eq!(report.history.len(), 2);
        assert!(
            report.history[0]
                .notes
                .iter()
                .any(|note| note.contains("transport failed"))
        );
    }

    #[test]
    fn repeated_capture_failures_escalate_to_failed() {
        let transport = ScriptedTransport::default();
        let mut controller = controller(
            cast_scene(),
            SimRenderer::failing_first(4),
            transport,
            config(10),
        );

        let report = controller.run();
        assert_eq!(report.status, RunStatus::Failed);
        // Budget of 2 retries: third consecutive failure ends the run.
        assert_eq!(report.history.len(), 3);
        let (_, _, transport) = controller.into_parts();
        assert!(transport.requests.is_empty());
    }

    #[test]
    fn single_capture_failure_recovers() {
        let transport = ScriptedTransport::default().with_response(&score_only(0.90));
        let mut controller = controller(
            cast_scene(),
            SimRenderer::failing_first(1),
            transport,
            config(5),
        );

        let report = controller.run();
        assert_eq!(report.status, RunStatus::Converged);
        assert_eq!(report.history.len(), 2);
        assert!(
            report.history[0]
                .notes
                .iter()
                .any(|note| note.contains("capture failed"))
        );
    }

    #[test]
    fn capture_without_hero_counts_as_failure() {
        let renderer = SimRenderer {
            missing_views: ["hero".to_string()].into_iter().collect(),
            ..SimRenderer::default()
        };
        let mut controller = controller(cast_scene(), renderer, ScriptedTransport::default(), config(10));

        let report = controller.run();
        assert_eq!(report.status, RunStatus::Failed);
        assert!(
            report.history[0]
                .notes
                .iter()
                .any(|note| note.contains("missing hero view"))
        );
    }

    #[test]
    fn cancellation_returns_partial_history() {
        let mut controller = controller(
            cast_scene(),
            SimRenderer::default(),
            ScriptedTransport::default(),
            config(10),
        );
        let flag = controller.cancel_flag();
        let transport = ScriptedTransport::default()
            .with_response(&score_only(0.40))
            .with_response(&score_only(0.50))
            .cancelling_after(2, flag);
        controller.transport = transport;

        let report = controller.run();
        assert_eq!(report.status, RunStatus::Cancelled);
        assert_eq!(report.history.len(), 2);
        assert_eq!(report.final_similarity, Some(50.0));
    }

    #[test]
    fn camera_rotation_is_derived_not_trusted() {
        let response = r#"{
            "similarity": 0.9,
            "entity_adjustments": [],
            "camera_adjustment": {
                "entity_ref": "ShotCam",
                "position": {"x": 0.0, "y": -6.0, "z": 2.0},
                "rotation": {"pitch": 45.0, "yaw": 45.0, "roll": 45.0}
            }
        }"#;
        let mut run_config = config(5);
        run_config.subjects = vec!["Oat".to_string(), "Ball".to_string()];
        let transport = ScriptedTransport::default().with_response(response);
        let mut controller = controller(cast_scene(), SimRenderer::default(), transport, run_config);

        let report = controller.run();
        assert_eq!(report.status, RunStatus::Converged);

        let (scene, _, _) = controller.into_parts();
        // Midpoint of Oat (1,2,0) and Ball (3,-1,0).
        let expected = look_at_rotation(Vec3::new(0.0, -6.0, 2.0), Vec3::new(2.0, 0.5, 0.0));
        assert_eq!(scene.entities["ShotCam"].rotation, expected);
        assert!(
            !scene.mutations.iter().any(|mutation| matches!(
                mutation,
                Mutation::Rotation { rotation, .. } if *rotation == Rotator::new(45.0, 45.0, 45.0)
            )),
            "the proposed camera rotation must be discarded"
        );
    }

    #[test]
    fn camera_in_entity_list_still_gets_derived_aim() {
        let response = r#"{
            "similarity": 0.9,
            "entity_adjustments": [
                {
                    "entity_ref": "ShotCam",
                    "position": {"x": 1.0, "y": -7.0, "z": 1.0},
                    "rotation": {"pitch": 80.0, "yaw": 80.0, "roll": 80.0}
                }
            ]
        }"#;
        let transport = ScriptedTransport::default().with_response(response);
        let mut controller = controller(
            cast_scene(),
            SimRenderer::default(),
            transport,
            config(5),
        );

        controller.run();
        let (scene, _, _) = controller.into_parts();
        // No subjects configured: aim falls back to the midpoint of all
        // actors, (2/3, 1/3, 0).
        let expected = look_at_rotation(
            Vec3::new(1.0, -7.0, 1.0),
            Vec3::new(2.0 / 3.0, 1.0 / 3.0, 0.0),
        );
        assert_eq!(scene.entities["ShotCam"].rotation, expected);
    }

    #[test]
    fn delta_mode_offsets_current_positions() {
        let response = r#"{
            "similarity": 0.9,
            "entity_adjustments": [
                {"entity_ref": "Oat", "position": {"x": 1.0, "y": 0.0, "z": 0.0}}
            ]
        }"#;
        let mut run_config = config(5);
        run_config.position_mode = PositionMode::Delta;
        let transport = ScriptedTransport::default().with_response(response);
        let mut controller = controller(cast_scene(), SimRenderer::default(), transport, run_config);

        controller.run();
        let (scene, _, _) = controller.into_parts();
        assert_eq!(scene.entities["Oat"].position, Vec3::new(2.0, 2.0, 0.0));
    }

    #[test]
    fn vanished_scene_fails_with_history_preserved() {
        let transport = ScriptedTransport::default()
            .with_response(&score_only(0.40))
            .with_response(&score_only(0.50));
        // Two name fetches per iteration: the scene vanishes on the first
        // fetch of iteration 2.
        let scene = cast_scene().failing_names_after(2);
        let mut controller = controller(scene, SimRenderer::default(), transport, config(10));

        let report = controller.run();
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.history.len(), 2);
        assert!(
            report.history[1]
                .notes
                .iter()
                .any(|note| note.contains("scene unavailable"))
        );
        assert_eq!(report.final_similarity, Some(40.0));
    }

    #[test]
    fn prompt_gains_score_guidance_from_iteration_two() {
        let transport = ScriptedTransport::default()
            .with_response(&score_only(0.45))
            .with_response(&score_only(0.90));
        let mut controller = controller(
            cast_scene(),
            SimRenderer::default(),
            transport,
            config(5),
        );

        controller.run();
        let (_, _, transport) = controller.into_parts();
        assert_eq!(transport.requests.len(), 2);

        let first = &transport.requests[0];
        assert!(!first.prompt.contains("Previous similarity score"));
        assert!(first.prompt.contains("Scene entities: Ball, Bench, Oat, ShotCam"));
        assert!(
            first.images[0].starts_with("rgb:hero"),
            "hero render must lead the image list, got {:?}",
            first.images
        );

        let second = &transport.requests[1];
        assert!(second.prompt.contains("Previous similarity score: 45.0"));
        assert!(second.prompt.contains("bold corrections"));
    }

    #[test]
    fn config_validation_rejects_bad_settings() {
        let no_iterations = RunConfig {
            max_iterations: 0,
            ..RunConfig::default()
        };
        assert!(no_iterations.validate().is_err());

        let mut inverted = RunConfig::default();
        inverted.validator.fuzzy_threshold = 95;
        inverted.validator.confidence_threshold = 90;
        assert!(inverted.validate().is_err());

        let mut out_of_range = RunConfig::default();
        out_of_range.selector.struggling_threshold = 140.0;
        assert!(out_of_range.validate().is_err());

        assert!(RunConfig::default().validate().is_ok());
    }
}
