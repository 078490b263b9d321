//! Inconsistency: net-splitting per comparison and the global
//! consistency-vs-UME test.
//!
//! For each aggregated edge the direct estimate is the edge's own pooled
//! value; the indirect estimate comes from re-solving the network with that
//! edge removed (all vertices kept). Bridges have no indirect path and are
//! skipped. Splits are independent of each other and run on the rayon pool;
//! results keep the model's edge order.

use nma_model::fit::{consistency_fit, moment_estimate, unrelated_fit};
use nma_model::linalg::{contrast_variance, solve_by_component};
use nma_model::stats::two_sided_p;
use nma_model::{ConsistencyModel, Estimate, ModelError, ModelWarning, Network};
use petgraph::algo::has_path_connecting;
use petgraph::visit::EdgeFiltered;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::heterogeneity::QStatistic;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetSplitOptions {
    /// Splits with `p < alpha` are flagged.
    pub alpha: f64,
}

impl Default for NetSplitOptions {
    fn default() -> Self {
        Self { alpha: 0.05 }
    }
}

/// Direct and indirect evidence on one treatment pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetSplit {
    pub treat1: String,
    pub treat2: String,
    pub studies: usize,
    pub direct: Estimate,
    pub indirect: Estimate,
    pub network: Estimate,
    /// direct − indirect.
    pub difference: Estimate,
    pub z: f64,
    pub p_value: f64,
    /// Share of the network estimate carried by direct evidence, v_network / v_direct.
    pub direct_proportion: f64,
    pub flagged: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Removing the edge disconnects its endpoints.
    Bridge,
    /// Zero or non-finite pooled variance.
    Degenerate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedComparison {
    pub treat1: String,
    pub treat2: String,
    pub reason: SkipReason,
}

/// Q of the consistency model against Q of the unrelated-mean-effects model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlobalInconsistency {
    pub q_consistency: f64,
    pub q_ume: f64,
    /// `q_consistency − q_ume` with df from the difference of expected Q.
    pub difference: QStatistic,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InconsistencyReport {
    pub alpha: f64,
    pub splits: Vec<NetSplit>,
    pub skipped: Vec<SkippedComparison>,
    pub global: GlobalInconsistency,
    pub warnings: Vec<ModelWarning>,
}

impl InconsistencyReport {
    pub fn flagged(&self) -> impl Iterator<Item = &NetSplit> {
        self.splits.iter().filter(|s| s.flagged)
    }
}

enum Outcome {
    Split(NetSplit),
    Skipped(SkippedComparison),
}

pub struct InconsistencyAnalyzer<'a> {
    network: &'a Network,
    model: &'a ConsistencyModel,
    options: NetSplitOptions,
}

impl<'a> InconsistencyAnalyzer<'a> {
    pub fn new(network: &'a Network, model: &'a ConsistencyModel, options: NetSplitOptions) -> Self {
        Self {
            network,
            model,
            options,
        }
    }

    pub fn analyze(&self) -> Result<InconsistencyReport, ModelError> {
        let (splits, skipped) = self.split_all();
        let global = self.global_test()?;

        let mut warnings: Vec<ModelWarning> = skipped
            .iter()
            .filter(|s| s.reason == SkipReason::Degenerate)
            .map(|s| ModelWarning::DegenerateComparison {
                treat1: s.treat1.clone(),
                treat2: s.treat2.clone(),
            })
            .collect();
        warnings.extend(
            self.model
                .warnings()
                .iter()
                .filter(|w| !matches!(w, ModelWarning::DegenerateComparison { .. }))
                .cloned(),
        );

        Ok(InconsistencyReport {
            alpha: self.options.alpha,
            splits,
            skipped,
            global,
            warnings,
        })
    }

    /// Net-split every edge of the model's graph.
    pub fn split_all(&self) -> (Vec<NetSplit>, Vec<SkippedComparison>) {
        let edges = self.model.graph().edges.len();
        let outcomes: Vec<Outcome> = (0..edges)
            .into_par_iter()
            .map(|index| self.split_edge(index))
            .collect();

        let mut splits = Vec::new();
        let mut skipped = Vec::new();
        for outcome in outcomes {
            match outcome {
                Outcome::Split(split) => splits.push(split),
                Outcome::Skipped(skip) => skipped.push(skip),
            }
        }

        tracing::debug!(
            splits = splits.len(),
            skipped = skipped.len(),
            flagged = splits.iter().filter(|s| s.flagged).count(),
            "net-split comparisons"
        );
        (splits, skipped)
    }

    fn split_edge(&self, index: usize) -> Outcome {
        let model = self.model;
        let graph = model.graph();
        let edge = &graph.edges[index];
        let treat1 = model.treatments()[edge.treat1].id.clone();
        let treat2 = model.treatments()[edge.treat2].id.clone();

        if edge.is_degenerate() {
            tracing::warn!(%treat1, %treat2, "skipping degenerate comparison");
            return Outcome::Skipped(SkippedComparison {
                treat1,
                treat2,
                reason: SkipReason::Degenerate,
            });
        }

        // Degenerate edges are not alternative paths.
        let without = EdgeFiltered::from_fn(&graph.graph, |e| {
            let other = *e.weight();
            other != index && !graph.edges[other].is_degenerate()
        });
        if !has_path_connecting(
            &without,
            graph.node(edge.treat1),
            graph.node(edge.treat2),
            None,
        ) {
            return Outcome::Skipped(SkippedComparison {
                treat1,
                treat2,
                reason: SkipReason::Bridge,
            });
        }

        let rest: Vec<usize> = (0..graph.edges.len())
            .filter(|&e| e != index && !graph.edges[e].is_degenerate())
            .collect();
        let pairs: Vec<(usize, usize)> = rest.iter().map(|&e| graph.edges[e].pair()).collect();
        let y: Vec<f64> = rest.iter().map(|&e| graph.edges[e].te).collect();
        let w: Vec<f64> = rest.iter().map(|&e| graph.edges[e].weight()).collect();
        let solution = solve_by_component(
            model.treatments().len(),
            model.components(),
            &pairs,
            &y,
            &w,
        );

        let (a, b) = edge.pair();
        let indirect = Estimate::new(
            solution.potentials[a] - solution.potentials[b],
            contrast_variance(&solution.lplus, a, b).max(0.0).sqrt(),
        );
        let direct = Estimate::new(edge.te, edge.se);
        let network = model.contrast_by_index(a, b).unwrap_or(direct);

        let difference = Estimate::new(
            direct.te - indirect.te,
            (direct.variance() + indirect.variance()).sqrt(),
        );
        let z = difference.z();
        let p_value = two_sided_p(z);

        Outcome::Split(NetSplit {
            treat1,
            treat2,
            studies: edge.studies(),
            direct,
            indirect,
            network,
            difference,
            z,
            p_value,
            direct_proportion: (network.variance() / direct.variance()).min(1.0),
            flagged: p_value < self.options.alpha,
        })
    }

    /// Global design-by-treatment style test: consistency against UME with
    /// fixed-effect weights.
    pub fn global_test(&self) -> Result<GlobalInconsistency, ModelError> {
        let network = self.network;
        let y = network.comparison_effects();
        let weights = network.weights(0.0)?;
        let sampling = network.sampling_covariance();
        let structure = network.heterogeneity_structure();

        let consistent = moment_estimate(
            &y,
            &weights,
            &consistency_fit(network, &weights),
            &sampling,
            &structure,
        );
        let unrelated = moment_estimate(
            &y,
            &weights,
            &unrelated_fit(network, &weights),
            &sampling,
            &structure,
        );

        let q = (consistent.q - unrelated.q).max(0.0);
        let df = consistent.expected_q - unrelated.expected_q;
        let df = if df.abs() < 1e-9 { 0.0 } else { df };

        Ok(GlobalInconsistency {
            q_consistency: consistent.q,
            q_ume: unrelated.q,
            difference: QStatistic::new(q, df),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nma_data::Comparison;
    use nma_model::{ConsistencyEstimator, EstimatorOptions, GraphBuilder, ModelKind};

    fn cmp(study: &str, t1: &str, t2: &str, te: f64, se: f64) -> Comparison {
        Comparison {
            study: study.to_string(),
            treat1: t1.to_string(),
            treat2: t2.to_string(),
            te,
            se,
        }
    }

    #[test]
    fn triangle_split_matches_hand_computation() {
        let network = GraphBuilder::new()
            .from_comparisons(&[
                cmp("s1", "A", "B", 1.0, 1.0),
                cmp("s2", "A", "C", 0.4, 1.0),
                cmp("s3", "C", "B", 0.4, 1.0),
                cmp("s4", "A", "D", 0.2, 0.5),
            ])
            .unwrap();
        let model = ConsistencyEstimator::new(&network, EstimatorOptions::default())
            .fit(ModelKind::Fixed)
            .unwrap();
        let report = InconsistencyAnalyzer::new(&network, &model, NetSplitOptions::default())
            .analyze()
            .unwrap();

        assert_eq!(report.splits.len(), 3);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].treat2, "D");
        assert_eq!(report.skipped[0].reason, SkipReason::Bridge);

        let ab = &report.splits[0];
        assert_eq!((ab.treat1.as_str(), ab.treat2.as_str()), ("A", "B"));
        assert!((ab.indirect.te - 0.8).abs() < 1e-10);
        assert!((ab.indirect.variance() - 2.0).abs() < 1e-10);
        assert!((ab.difference.te - 0.2).abs() < 1e-10);
        assert!((ab.z - 0.2 / 3.0f64.sqrt()).abs() < 1e-10);
        assert!((ab.direct_proportion - 2.0 / 3.0).abs() < 1e-10);
        assert!(!ab.flagged);
    }

    #[test]
    fn degenerate_edge_is_not_an_alternative_path() {
        let network = GraphBuilder::new()
            .from_comparisons(&[
                cmp("s1", "A", "B", 0.9, 1e-160),
                cmp("s2", "B", "C", 0.3, 0.2),
                cmp("s3", "A", "C", 0.8, 0.2),
            ])
            .unwrap();
        let model = ConsistencyEstimator::new(&network, EstimatorOptions::default())
            .fit(ModelKind::Fixed)
            .unwrap();
        let report = InconsistencyAnalyzer::new(&network, &model, NetSplitOptions::default())
            .analyze()
            .unwrap();

        assert!(report.splits.is_empty());
        let reasons: Vec<(&str, &str, SkipReason)> = report
            .skipped
            .iter()
            .map(|s| (s.treat1.as_str(), s.treat2.as_str(), s.reason))
            .collect();
        assert_eq!(
            reasons,
            vec![
                ("A", "B", SkipReason::Degenerate),
                ("A", "C", SkipReason::Bridge),
                ("B", "C", SkipReason::Bridge),
            ]
        );
        assert_eq!(
            report.warnings,
            vec![ModelWarning::DegenerateComparison {
                treat1: "A".to_string(),
                treat2: "B".to_string(),
            }]
        );
        assert!(report.global.q_consistency.is_finite());
        assert_eq!(report.global.difference.p_value, None);
    }

    #[test]
    fn consistent_data_has_zero_global_q() {
        let network = GraphBuilder::new()
            .from_comparisons(&[
                cmp("s1", "A", "B", 0.5, 0.2),
                cmp("s2", "B", "C", 0.3, 0.2),
                cmp("s3", "A", "C", 0.8, 0.2),
            ])
            .unwrap();
        let model = ConsistencyEstimator::new(&network, EstimatorOptions::default())
            .fit(ModelKind::Fixed)
            .unwrap();
        let analyzer = InconsistencyAnalyzer::new(&network, &model, NetSplitOptions::default());
        let global = analyzer.global_test().unwrap();
        assert!(global.difference.q < 1e-12);
        assert!((global.difference.df - 1.0).abs() < 1e-9);

        let (splits, _) = analyzer.split_all();
        for split in splits {
            assert!(split.z.abs() < 1e-8);
        }
    }
}
