use std::collections::BTreeSet;

use tracing::debug;

/// The one viewpoint similarity scoring cannot do without.
pub const HERO_VIEW: &str = "hero";

pub const DEFAULT_HIGH_CONFIDENCE_THRESHOLD: f64 = 85.0;
pub const DEFAULT_STRUGGLING_THRESHOLD: f64 = 55.0;
pub const DEFAULT_OSCILLATION_VARIANCE: f64 = 100.0;
pub const DEFAULT_GOOD_SCORE_THRESHOLD: f64 = 75.0;
pub const DEFAULT_CONVERGENCE_THRESHOLD: f64 = 85.0;
pub const DEFAULT_PLATEAU_DELTA: f64 = 5.0;
pub const DEFAULT_PLATEAU_WINDOW: usize = 3;

// Depth inclusion bands, independent of the RGB strategy.
const FULL_DEPTH_MAX_ITERATION: u32 = 2;
const DEPTH_STRUGGLING_THRESHOLD: f64 = 60.0;
const DEPTH_COMPLEX_MAX_ITERATION: u32 = 5;
const DEPTH_SKIP_THRESHOLD: f64 = 80.0;

// Two-tier image pricing: the hero render and the reference depth go out at
// full detail, auxiliary scout images at reduced detail. Advisory only.
const PRIMARY_IMAGE_COST: f64 = 0.04;
const SCOUT_IMAGE_COST: f64 = 0.015;
const PRIMARY_IMAGE_TOKENS: u32 = 1_100;
const SCOUT_IMAGE_TOKENS: u32 = 420;

const COMPLEX_ENTITY_COUNT: usize = 8;
const SIMPLE_ENTITY_COUNT: usize = 3;

// Rarely worth a render on a sparse scene.
const RARELY_USEFUL_VIEWS: [&str; 3] = ["back", "left", "three_quarter"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Minimal,
    Focused,
    Refinement,
    Exploration,
    Comprehensive,
}

impl Strategy {
    pub fn name(self) -> &'static str {
        match self {
            Strategy::Minimal => "minimal",
            Strategy::Focused => "focused",
            Strategy::Refinement => "refinement",
            Strategy::Exploration => "exploration",
            Strategy::Comprehensive => "comprehensive",
        }
    }

    fn views(self) -> &'static [&'static str] {
        match self {
            Strategy::Minimal => &["hero"],
            Strategy::Focused => &["hero", "top"],
            Strategy::Refinement => &["hero", "front", "top"],
            Strategy::Exploration => &["hero", "front", "right", "top"],
            Strategy::Comprehensive => {
                &["hero", "front", "right", "left", "back", "top", "three_quarter"]
            }
        }
    }

    fn depth_views(self) -> &'static [&'static str] {
        match self {
            Strategy::Minimal => &[],
            Strategy::Focused => &["hero"],
            Strategy::Refinement => &["hero", "top"],
            Strategy::Exploration => &["hero", "front", "top"],
            Strategy::Comprehensive => &["hero", "front", "right", "top"],
        }
    }

    fn reference_depth(self) -> bool {
        matches!(
            self,
            Strategy::Refinement | Strategy::Exploration | Strategy::Comprehensive
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShotType {
    Standard,
    CloseUp,
    OverShoulder,
    Establishing,
}

impl ShotType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "standard" => Some(ShotType::Standard),
            "close_up" | "closeup" => Some(ShotType::CloseUp),
            "over_shoulder" => Some(ShotType::OverShoulder),
            "establishing" => Some(ShotType::Establishing),
            _ => None,
        }
    }

    /// Framings where a single viewpoint routinely hides the misplacement.
    fn needs_multiple_angles(self) -> bool {
        matches!(self, ShotType::OverShoulder | ShotType::Establishing)
    }
}

/// Per-run facts about the scene that bias view selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SceneProfile {
    pub entity_count: usize,
    pub shot_type: ShotType,
}

impl Default for SceneProfile {
    fn default() -> Self {
        Self {
            entity_count: 0,
            shot_type: ShotType::Standard,
        }
    }
}

impl SceneProfile {
    pub fn is_complex(&self) -> bool {
        self.entity_count > COMPLEX_ENTITY_COUNT || self.shot_type.needs_multiple_angles()
    }

    fn is_simple(&self) -> bool {
        self.entity_count <= SIMPLE_ENTITY_COUNT && !self.shot_type.needs_multiple_angles()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SelectorConfig {
    pub high_confidence_threshold: f64,
    pub struggling_threshold: f64,
    pub oscillation_variance: f64,
    pub good_score_threshold: f64,
    pub convergence_threshold: f64,
    pub plateau_delta: f64,
    pub plateau_window: usize,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            high_confidence_threshold: DEFAULT_HIGH_CONFIDENCE_THRESHOLD,
            struggling_threshold: DEFAULT_STRUGGLING_THRESHOLD,
            oscillation_variance: DEFAULT_OSCILLATION_VARIANCE,
            good_score_threshold: DEFAULT_GOOD_SCORE_THRESHOLD,
            convergence_threshold: DEFAULT_CONVERGENCE_THRESHOLD,
            plateau_delta: DEFAULT_PLATEAU_DELTA,
            plateau_window: DEFAULT_PLATEAU_WINDOW,
        }
    }
}

/// The capture plan for one iteration. The rendered images arrive separately;
/// this only says what to ask the renderer for and what it will roughly cost.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureSet {
    pub iteration: u32,
    pub strategy: Strategy,
    pub views: Vec<String>,
    pub depth_views: Vec<String>,
    pub include_reference_depth: bool,
    pub estimated_cost: f64,
    pub estimated_tokens: u32,
}

/// Chooses which viewpoints to render each iteration, trading capture cost
/// against the risk of the model lacking spatial context. Score history is
/// scoped to one run; gaps mark iterations that produced no usable score.
#[derive(Debug, Clone)]
pub struct CaptureStrategySelector {
    config: SelectorConfig,
    score_history: Vec<Option<f64>>,
    selection_history: Vec<Strategy>,
}

impl CaptureStrategySelector {
    pub fn new(config: SelectorConfig) -> Self {
        Self {
            config,
            score_history: Vec::new(),
            selection_history: Vec::new(),
        }
    }

    pub fn record_score(&mut self, similarity: Option<f64>) {
        self.score_history.push(similarity);
    }

    pub fn score_history(&self) -> &[Option<f64>] {
        &self.score_history
    }

    pub fn selection_history(&self) -> &[Strategy] {
        &self.selection_history
    }

    pub fn select(
        &mut self,
        iteration: u32,
        previous_similarity: Option<f64>,
        profile: &SceneProfile,
        available_views: &BTreeSet<String>,
    ) -> CaptureSet {
        let strategy = self.choose_strategy(iteration, previous_similarity, profile);

        let mut views = strategy
            .views()
            .iter()
            .map(|view| view.to_string())
            .collect::<Vec<_>>();
        views.retain(|view| available_views.contains(view));
        if profile.is_simple() {
            views.retain(|view| !RARELY_USEFUL_VIEWS.contains(&view.as_str()));
        }
        if profile.shot_type == ShotType::CloseUp {
            views.retain(|view| view != "top");
        }
        // Final safety check, not an expectation of the tables: without the
        // hero view there is nothing to score.
        if !views.iter().any(|view| view == HERO_VIEW) {
            views.insert(0, HERO_VIEW.to_string());
        }

        let (mut depth_views, mut include_reference_depth) =
            self.choose_depth(strategy, iteration, previous_similarity, profile, &views);
        depth_views.retain(|view| views.contains(view));
        if profile.shot_type == ShotType::OverShoulder {
            if !depth_views.iter().any(|view| view == HERO_VIEW) {
                depth_views.insert(0, HERO_VIEW.to_string());
            }
            include_reference_depth = true;
        }

        let (estimated_cost, estimated_tokens) =
            estimate_capture(&views, &depth_views, include_reference_depth);

        debug!(
            iteration,
            strategy = strategy.name(),
            views = views.len(),
            depth_views = depth_views.len(),
            include_reference_depth,
            "selected capture strategy"
        );
        self.selection_history.push(strategy);

        CaptureSet {
            iteration,
            strategy,
            views,
            depth_views,
            include_reference_depth,
            estimated_cost,
            estimated_tokens,
        }
    }

    fn choose_strategy(
        &self,
        iteration: u32,
        previous: Option<f64>,
        profile: &SceneProfile,
    ) -> Strategy {
        if iteration <= 1 {
            return Strategy::Exploration;
        }
        if let Some(previous) = previous
            && previous >= self.config.high_confidence_threshold
        {
            return Strategy::Minimal;
        }
        // Oscillation means the model is overcorrecting; give it the full
        // surround rather than less.
        if self.is_oscillating(DEFAULT_PLATEAU_WINDOW) {
            return Strategy::Comprehensive;
        }
        if let Some(previous) = previous
            && previous < self.config.struggling_threshold
        {
            return Strategy::Comprehensive;
        }
        if profile.is_complex() {
            return Strategy::Comprehensive;
        }

        match iteration {
            2..=3 => Strategy::Exploration,
            4..=7 => Strategy::Refinement,
            _ => {
                if previous.is_some_and(|score| score >= self.config.good_score_threshold) {
                    Strategy::Focused
                } else {
                    Strategy::Refinement
                }
            }
        }
    }

    fn choose_depth(
        &self,
        strategy: Strategy,
        iteration: u32,
        previous: Option<f64>,
        profile: &SceneProfile,
        views: &[String],
    ) -> (Vec<String>, bool) {
        if iteration <= FULL_DEPTH_MAX_ITERATION {
            return (views.to_vec(), true);
        }
        if let Some(previous) = previous
            && previous < DEPTH_STRUGGLING_THRESHOLD
        {
            let mut depth = vec![HERO_VIEW.to_string()];
            if let Some(aux) = views.iter().find(|view| *view != HERO_VIEW) {
                depth.push(aux.clone());
            }
            return (depth, strategy.reference_depth());
        }

        let table = strategy
            .depth_views()
            .iter()
            .map(|view| view.to_string())
            .collect::<Vec<_>>();
        if profile.is_complex() && iteration <= DEPTH_COMPLEX_MAX_ITERATION {
            return (table, strategy.reference_depth());
        }
        if let Some(previous) = previous
            && previous >= DEPTH_SKIP_THRESHOLD
        {
            return (Vec::new(), false);
        }
        (table, strategy.reference_depth())
    }

    /// Variance of the last `window` known scores exceeds the oscillation
    /// threshold. False until that many scores exist.
    pub fn is_oscillating(&self, window: usize) -> bool {
        let recent = self.recent_scores(window);
        recent.len() >= window && variance(&recent) > self.config.oscillation_variance
    }

    /// Spread of the last `window` known scores is below `delta`.
    pub fn is_plateaued(&self, window: usize, delta: f64) -> bool {
        let recent = self.recent_scores(window);
        if recent.len() < window {
            return false;
        }
        let min = recent.iter().copied().fold(f64::INFINITY, f64::min);
        let max = recent.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        max - min < delta
    }

    /// The most recent known score meets the threshold.
    pub fn is_converged(&self, threshold: f64) -> bool {
        self.score_history
            .iter()
            .rev()
            .find_map(|score| *score)
            .is_some_and(|score| score >= threshold)
    }

    fn recent_scores(&self, window: usize) -> Vec<f64> {
        let mut recent = self
            .score_history
            .iter()
            .rev()
            .filter_map(|score| *score)
            .take(window)
            .collect::<Vec<_>>();
        recent.reverse();
        recent
    }
}

fn variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    values
        .iter()
        .map(|value| (value - mean) * (value - mean))
        .sum::<f64>()
        / values.len() as f64
}

fn estimate_capture(views: &[String], depth_views: &[String], reference_depth: bool) -> (f64, u32) {
    let mut cost = 0.0;
    let mut tokens = 0u32;
    for view in views {
        if view == HERO_VIEW {
            cost += PRIMARY_IMAGE_COST;
            tokens += PRIMARY_IMAGE_TOKENS;
        } else {
            cost += SCOUT_IMAGE_COST;
            tokens += SCOUT_IMAGE_TOKENS;
        }
    }
    for _ in depth_views {
        cost += SCOUT_IMAGE_COST;
        tokens += SCOUT_IMAGE_TOKENS;
    }
    if reference_depth {
        cost += PRIMARY_IMAGE_COST;
        tokens += PRIMARY_IMAGE_TOKENS;
    }
    (cost, tokens)
}
