use std::collections::{BTreeMap, BTreeSet};

pub const DEFAULT_FUZZY_THRESHOLD: u32 = 75;
pub const DEFAULT_CONFIDENCE_THRESHOLD: u32 = 90;

// Environmental concepts the model keeps proposing as if they were
// controllable entities. Checked only after exact and case-insensitive
// matching, so a real entity named "Skylight" still resolves.
const NON_ENTITY_TERMS: [&str; 14] = [
    "weather",
    "lighting",
    "atmosphere",
    "ground",
    "sky",
    "shadow",
    "fog",
    "rain",
    "sun",
    "cloud",
    "horizon",
    "ambient",
    "background",
    "terrain",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    CaseInsensitive,
    Fuzzy,
    Rejected,
}

/// Result of resolving one model-proposed reference against the live entity
/// set. `resolved_name` is `None` exactly when `match_kind` is `Rejected`.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationOutcome {
    pub input_ref: String,
    pub resolved_name: Option<String>,
    pub match_kind: MatchKind,
    pub score: u32,
    pub low_confidence: bool,
    pub reason: Option<String>,
}

impl ValidationOutcome {
    fn accepted(input_ref: &str, resolved: String, match_kind: MatchKind, score: u32) -> Self {
        Self {
            input_ref: input_ref.to_string(),
            resolved_name: Some(resolved),
            match_kind,
            score,
            low_confidence: false,
            reason: None,
        }
    }

    fn rejected(input_ref: &str, score: u32, reason: &str) -> Self {
        Self {
            input_ref: input_ref.to_string(),
            resolved_name: None,
            match_kind: MatchKind::Rejected,
            score,
            low_confidence: false,
            reason: Some(reason.to_string()),
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.resolved_name.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatorConfig {
    pub fuzzy_threshold: u32,
    pub confidence_threshold: u32,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            fuzzy_threshold: DEFAULT_FUZZY_THRESHOLD,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
        }
    }
}

/// Resolves one proposed reference. Absence of a match is the expected,
/// common case and is signaled through `resolved_name`, never an error.
pub fn validate_ref(
    input_ref: &str,
    true_names: &BTreeSet<String>,
    config: &ValidatorConfig,
) -> ValidationOutcome {
    if true_names.contains(input_ref) {
        return ValidationOutcome::accepted(input_ref, input_ref.to_string(), MatchKind::Exact, 100);
    }

    let lowered = input_ref.to_lowercase();
    for name in true_names {
        if name.to_lowercase() == lowered {
            return ValidationOutcome::accepted(
                input_ref,
                name.clone(),
                MatchKind::CaseInsensitive,
                100,
            );
        }
    }

    if NON_ENTITY_TERMS.iter().any(|term| lowered.contains(term)) {
        return ValidationOutcome::rejected(input_ref, 0, "invalid entity type");
    }

    let mut best: Option<(&String, u32)> = None;
    for name in true_names {
        let score = similarity_score(&lowered, &name.to_lowercase());
        if score < config.fuzzy_threshold {
            continue;
        }
        match best {
            Some((_, best_score)) if score <= best_score => {}
            _ => best = Some((name, score)),
        }
    }

    match best {
        Some((name, score)) => {
            let mut outcome =
                ValidationOutcome::accepted(input_ref, name.clone(), MatchKind::Fuzzy, score);
            outcome.low_confidence = score < config.confidence_threshold;
            outcome
        }
        None => ValidationOutcome::rejected(input_ref, 0, "no match above threshold"),
    }
}

/// Validates each reference independently and returns only the accepted
/// outcomes, preserving input order. Pure: inputs are never mutated.
pub fn validate_all(
    proposed_refs: &[String],
    true_names: &BTreeSet<String>,
    config: &ValidatorConfig,
) -> Vec<ValidationOutcome> {
    proposed_refs
        .iter()
        .map(|proposed| validate_ref(proposed, true_names, config))
        .filter(ValidationOutcome::is_accepted)
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Text(String),
    Number(f64),
}

/// Known auxiliary attributes of one live entity (color, height, and so on).
#[derive(Debug, Clone, PartialEq)]
pub struct EntityProfile {
    pub name: String,
    pub attributes: BTreeMap<String, AttributeValue>,
}

/// A model-proposed entity plus the attributes it claims the entity has.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityDescription {
    pub entity_ref: String,
    pub expected: BTreeMap<String, AttributeValue>,
}

/// Attribute-aware variant: the name must resolve, and every claimed
/// attribute must be consistent with the resolved entity's profile. Any
/// mismatch rejects the candidate even when the name matched.
pub fn validate_described(
    description: &EntityDescription,
    profiles: &[EntityProfile],
    config: &ValidatorConfig,
) -> ValidationOutcome {
    let names = profiles
        .iter()
        .map(|profile| profile.name.clone())
        .collect::<BTreeSet<_>>();
    let outcome = validate_ref(&description.entity_ref, &names, config);
    let Some(resolved) = outcome.resolved_name.as_deref() else {
        return outcome;
    };

    let Some(profile) = profiles.iter().find(|profile| profile.name == resolved) else {
        return ValidationOutcome::rejected(&description.entity_ref, 0, "no match above threshold");
    };

    for (key, expected) in &description.expected {
        let consistent = profile
            .attributes
            .get(key)
            .is_some_and(|actual| attribute_matches(expected, actual));
        if !consistent {
            return ValidationOutcome::rejected(
                &description.entity_ref,
                outcome.score,
                &format!("attribute mismatch: {key}"),
            );
        }
    }

    outcome
}

fn attribute_matches(expected: &AttributeValue, actual: &AttributeValue) -> bool {
    match (expected, actual) {
        (AttributeValue::Text(expected), AttributeValue::Text(actual)) => {
            let expected = expected.to_lowercase();
            let actual = actual.to_lowercase();
            actual.contains(&expected) || expected.contains(&actual)
        }
        (AttributeValue::Number(expected), AttributeValue::Number(actual)) => {
            (actual - expected).abs() <= 0.1 * expected.abs()
        }
        _ => false,
    }
}

/// Normalized string similarity on a 0-100 scale, from Levenshtein distance
/// over characters.
pub fn similarity_score(a: &str, b: &str) -> u32 {
    let a_len = a.chars().count();
    let b_len = b.chars().count();
    let max_len = a_len.max(b_len);
    if max_len == 0 {
        return 100;
    }

    let distance = levenshtein(a, b);
    let scaled = 100.0 * (1.0 - distance as f64 / max_len as f64);
    scaled.round().max(0.0) as u32
}

fn levenshtein(a: &str, b: &str) -> usize {
    let b_len = b.chars().count();
    let mut prev: Vec<usize> = (0..=b_len).collect();
    let mut curr = vec![0usize; b_len + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.chars().enumerate() {
            let deletion = prev[j + 1] + 1;
            let insertion = curr[j] + 1;
            let substitution = prev[j] + usize::from(ca != cb);
            curr[j + 1] = deletion.min(insertion).min(substitution);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b_len]
}
