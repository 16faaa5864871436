pub mod controller;
pub mod report;
pub mod response;
pub mod strategy;
pub mod validator;

pub use controller::{CancelFlag, ConfigError, ConvergenceController, RunConfig};
pub use report::{IterationRecord, RunReport, RunStatus, SuiteSummary, summarize_runs};
pub use response::{AdjustmentSet, EntityAdjustment};
pub use strategy::{
    CaptureSet, CaptureStrategySelector, SceneProfile, SelectorConfig, ShotType, Strategy,
};
pub use validator::{
    AttributeValue, EntityDescription, EntityProfile, MatchKind, ValidationOutcome,
    ValidatorConfig, validate_all, validate_described, validate_ref,
};
