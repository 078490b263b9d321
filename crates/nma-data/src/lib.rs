//! nma-data crate
//!
//! Input records for network meta-analysis: treatments, studies and arms,
//! pre-aggregated comparisons, arm → contrast computation and validation.

pub mod error;
pub mod loader;
pub mod pairwise;
pub mod types;

pub use error::InputError;
pub use types::{
    Arm, Comparison, Dispersion, Evidence, Measure, NetworkInput, Study, Treatment,
};
