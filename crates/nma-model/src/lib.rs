//! nma-model: evidence networks and the graph-theoretic consistency model.
//!
//! Builds the treatment graph from study records, reduces multi-arm studies
//! to independently weighted comparisons, groups studies into designs, and
//! fits fixed-effect, random-effects and unrelated-mean-effects models by
//! generalized least squares on the weighted Laplacian.

pub mod consistency;
pub mod design;
pub mod error;
pub mod fit;
pub mod graph;
pub mod linalg;
pub mod multiarm;
pub mod stats;

pub use consistency::{
    ConsistencyEstimator, ConsistencyModel, EdgeFit, Estimate, EstimatorOptions, ModelKind,
    ModelVariant, PairwiseContrast, RelativeEffect,
};
pub use design::{Design, DesignClassifier, Designs};
pub use error::{DisconnectedNetworkError, ModelError, ModelWarning};
pub use graph::{AggregatedEdge, GraphBuilder, Network, NetworkGraph, StudyComparison, StudyRecord};
