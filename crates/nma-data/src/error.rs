//! Input validation errors.
//!
//! Every variant is structural: the run aborts before any graph is built.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum InputError {
    #[error("no studies or comparisons supplied")]
    Empty,

    #[error("study '{study}' has no arms")]
    NoArms { study: String },

    #[error("study '{study}' appears more than once")]
    DuplicateStudy { study: String },

    #[error("study '{study}' has more than one arm for treatment '{treatment}'")]
    DuplicateArm { study: String, treatment: String },

    #[error("study '{study}', treatment '{treatment}': invalid {field} ({reason})")]
    InvalidArm {
        study: String,
        treatment: String,
        field: &'static str,
        reason: String,
    },

    #[error("study '{study}' compares treatment '{treatment}' with itself")]
    SelfComparison { study: String, treatment: String },

    #[error("study '{study}' reports {treat1} vs {treat2} more than once")]
    DuplicateComparison {
        study: String,
        treat1: String,
        treat2: String,
    },

    #[error("study '{study}', {treat1} vs {treat2}: effect estimate is not finite")]
    NonFiniteEffect {
        study: String,
        treat1: String,
        treat2: String,
    },

    #[error("study '{study}', {treat1} vs {treat2}: variance must be positive and finite (se = {se})")]
    NonPositiveVariance {
        study: String,
        treat1: String,
        treat2: String,
        se: f64,
    },

    #[error("multi-arm study '{study}' lists {found} of the {expected} pairwise comparisons")]
    IncompleteMultiArm {
        study: String,
        expected: usize,
        found: usize,
    },

    #[error("multi-arm study '{study}': reported variances do not admit positive comparison weights")]
    InconsistentMultiArmVariance { study: String },

    #[error("unknown treatment '{treatment}'")]
    UnknownTreatment { treatment: String },
}
