//! Model errors and non-fatal warnings.
//!
//! Structural problems abort a run ([`ModelError`]); numerical degeneracies
//! are attached to results as [`ModelWarning`]s so callers can tell
//! "computed but suspect" from "failed". A singular Laplacian is never an
//! error: the pseudoinverse absorbs it.

use std::fmt;

use nma_data::InputError;
use serde::Serialize;
use thiserror::Error;

/// Treatments that cannot be linked to the primary component of the network.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("treatments [{}] are not connected to the rest of the network", .treatments.join(", "))]
pub struct DisconnectedNetworkError {
    pub treatments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    #[error(transparent)]
    Input(#[from] InputError),

    #[error(transparent)]
    Disconnected(#[from] DisconnectedNetworkError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelWarning {
    /// A component other than the primary one was analysed on its own.
    Disconnected { treatments: Vec<String> },
    /// The random-effects tau² loop hit its iteration cap; `tau2` is the last estimate.
    NonConvergence { iterations: usize, tau2: f64 },
    /// An aggregated edge with zero or non-finite pooled variance.
    DegenerateComparison { treat1: String, treat2: String },
}

impl From<DisconnectedNetworkError> for ModelWarning {
    fn from(err: DisconnectedNetworkError) -> Self {
        ModelWarning::Disconnected {
            treatments: err.treatments,
        }
    }
}

impl fmt::Display for ModelWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelWarning::Disconnected { treatments } => write!(
                f,
                "disconnected component [{}] analysed separately",
                treatments.join(", ")
            ),
            ModelWarning::NonConvergence { iterations, tau2 } => write!(
                f,
                "tau² did not converge after {iterations} iterations (last estimate {tau2:.6})"
            ),
            ModelWarning::DegenerateComparison { treat1, treat2 } => {
                write!(f, "{treat1} vs {treat2} has a degenerate pooled variance")
            }
        }
    }
}
