//! Descriptive summary of an evidence network.

use nma_model::{DesignClassifier, DisconnectedNetworkError, Network};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreatmentSummary {
    pub id: String,
    pub label: String,
    /// Number of studies with an arm on this treatment.
    pub studies: usize,
    /// Number of distinct treatments it is compared with directly.
    pub degree: usize,
    pub component: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EdgeSummary {
    pub treat1: String,
    pub treat2: String,
    pub studies: usize,
    /// Fixed-effect pooled estimate of `treat1` relative to `treat2`.
    pub te: f64,
    pub se: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DesignSummary {
    pub label: String,
    pub studies: usize,
}

/// Counts and structure of the network, before any model is fitted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkSummary {
    pub treatments: Vec<TreatmentSummary>,
    pub studies: usize,
    pub multi_arm_studies: usize,
    pub comparisons: usize,
    pub edges: Vec<EdgeSummary>,
    pub designs: Vec<DesignSummary>,
    pub components: Vec<Vec<String>>,
    pub disconnected: Vec<DisconnectedNetworkError>,
    /// Σ (arms − 1) − (treatments − components).
    pub degrees_of_freedom: usize,
}

impl NetworkSummary {
    pub fn from_network(network: &Network) -> Self {
        let graph = network.graph();
        let designs = DesignClassifier::classify(network);

        let treatments = network
            .treatments()
            .iter()
            .enumerate()
            .map(|(t, treatment)| TreatmentSummary {
                id: treatment.id.clone(),
                label: treatment.display_label().to_string(),
                studies: network
                    .studies()
                    .iter()
                    .filter(|s| s.treatments.contains(&t))
                    .count(),
                degree: graph.graph.neighbors(graph.node(t)).count(),
                component: network.component_of(t),
            })
            .collect();

        let edges = graph
            .edges
            .iter()
            .map(|edge| EdgeSummary {
                treat1: network.treatment_id(edge.treat1).to_string(),
                treat2: network.treatment_id(edge.treat2).to_string(),
                studies: edge.studies(),
                te: edge.te,
                se: edge.se,
            })
            .collect();

        let components = network
            .components()
            .iter()
            .map(|members| {
                members
                    .iter()
                    .map(|&t| network.treatment_id(t).to_string())
                    .collect()
            })
            .collect();

        Self {
            treatments,
            studies: network.studies().len(),
            multi_arm_studies: network
                .studies()
                .iter()
                .filter(|s| s.is_multi_arm())
                .count(),
            comparisons: network.comparisons().len(),
            edges,
            designs: designs
                .iter()
                .map(|d| DesignSummary {
                    label: d.label.clone(),
                    studies: d.studies.len(),
                })
                .collect(),
            components,
            disconnected: network.disconnected().to_vec(),
            degrees_of_freedom: network
                .independent_comparisons()
                .saturating_sub(network.parameters()),
        }
    }
}
