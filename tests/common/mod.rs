//! Shared test helpers: comparison factories and the standard networks used
//! across the integration tests.

#![allow(dead_code)]

use nma_data::{Arm, Comparison, Dispersion, Study};
use nma_model::{
    ConsistencyEstimator, ConsistencyModel, EstimatorOptions, GraphBuilder, ModelKind, Network,
};

/// One pre-aggregated comparison.
pub fn cmp(study: &str, treat1: &str, treat2: &str, te: f64, se: f64) -> Comparison {
    Comparison {
        study: study.to_string(),
        treat1: treat1.to_string(),
        treat2: treat2.to_string(),
        te,
        se,
    }
}

/// One arm with a standard deviation.
pub fn arm(treatment: &str, n: u32, mean: f64, sd: f64) -> Arm {
    Arm {
        treatment: treatment.to_string(),
        n,
        mean,
        dispersion: Dispersion::Sd(sd),
    }
}

pub fn study(id: &str, arms: Vec<Arm>) -> Study {
    Study {
        id: id.to_string(),
        arms,
    }
}

pub fn network(comparisons: &[Comparison]) -> Network {
    GraphBuilder::new()
        .from_comparisons(comparisons)
        .expect("test network should build")
}

pub fn fit(network: &Network, kind: ModelKind) -> ConsistencyModel {
    ConsistencyEstimator::new(network, EstimatorOptions::default())
        .fit(kind)
        .expect("model should fit")
}

pub fn fit_with_reference(network: &Network, kind: ModelKind, reference: &str) -> ConsistencyModel {
    let options = EstimatorOptions {
        reference: Some(reference.to_string()),
        ..EstimatorOptions::default()
    };
    ConsistencyEstimator::new(network, options)
        .fit(kind)
        .expect("model should fit")
}

/// Triangle A-B-C with several studies per edge and a pendant A-D edge.
pub fn triangle_with_pendant() -> Vec<Comparison> {
    vec![
        cmp("ab1", "A", "B", -0.45, 0.15),
        cmp("ab2", "A", "B", -0.62, 0.20),
        cmp("ab3", "B", "A", 0.38, 0.18),
        cmp("ac1", "A", "C", -0.95, 0.22),
        cmp("ac2", "A", "C", -1.20, 0.25),
        cmp("bc1", "B", "C", -0.41, 0.20),
        cmp("bc2", "C", "B", 0.60, 0.30),
        cmp("abc", "A", "B", -0.50, 0.25),
        cmp("abc", "A", "C", -1.05, 0.25),
        cmp("abc", "B", "C", -0.55, 0.25),
        cmp("ad1", "A", "D", -0.30, 0.20),
        cmp("ad2", "D", "A", 0.20, 0.25),
    ]
}

/// Treatment effects used to generate consistent K4 data.
pub const K4_EFFECTS: [(&str, f64); 4] = [("A", 0.0), ("B", 0.5), ("C", 1.0), ("D", 0.3)];

/// Complete graph on A-D, one two-arm study per edge with standard error
/// `se`. `noise(edge)` is added to each consistent effect and `bias` to A-B.
pub fn k4(se: f64, bias: f64, mut noise: impl FnMut() -> f64) -> Vec<Comparison> {
    let mut comparisons = Vec::new();
    for i in 0..K4_EFFECTS.len() {
        for j in (i + 1)..K4_EFFECTS.len() {
            let (a, ea) = K4_EFFECTS[i];
            let (b, eb) = K4_EFFECTS[j];
            let mut te = ea - eb + noise();
            if (a, b) == ("A", "B") {
                te += bias;
            }
            comparisons.push(cmp(&format!("{a}{b}"), a, b, te, se));
        }
    }
    comparisons
}
