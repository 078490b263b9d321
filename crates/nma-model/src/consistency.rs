//! The consistency (and unrelated-mean-effects) model.
//!
//! Aggregated edges are conductances; the weighted Laplacian's pseudoinverse
//! gives vertex potentials whose differences are the consistent relative
//! effects, with `Cov(θ) = L⁺`. Each connected component is solved on its
//! own, so contrasts never leak across components.
//!
//! A [`ConsistencyModel`] is immutable. Changing the reference builds a new
//! model via [`ConsistencyModel::with_reference`].

use nalgebra::{DMatrix, DVector};
use nma_data::{InputError, Treatment};
use serde::{Deserialize, Serialize, Serializer};

use crate::error::{ModelError, ModelWarning};
use crate::fit::{consistency_fit, iterate_tau2, unrelated_fit};
use crate::graph::{Network, NetworkGraph};
use crate::linalg::{contrast_variance, is_positive_semidefinite, solve_by_component, symmetrize};
use crate::stats::{normal_quantile, two_sided_p};

/// Estimator configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorOptions {
    /// Reference treatment id. Defaults to the first treatment (by id) of the
    /// primary component.
    pub reference: Option<String>,
    /// Relative convergence tolerance of the tau² loop.
    pub tau_tolerance: f64,
    pub max_iterations: usize,
}

impl Default for EstimatorOptions {
    fn default() -> Self {
        Self {
            reference: None,
            tau_tolerance: 1e-8,
            max_iterations: 100,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Fixed,
    Random,
    Ume,
}

impl ModelKind {
    pub fn name(&self) -> &'static str {
        match self {
            ModelKind::Fixed => "fixed",
            ModelKind::Random => "random",
            ModelKind::Ume => "ume",
        }
    }
}

/// Which model was fitted, with its variance-component details.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelVariant {
    Fixed,
    Random {
        tau2: f64,
        iterations: usize,
        converged: bool,
    },
    /// Unrelated mean effects with their own tau².
    Ume { tau2: f64 },
}

impl ModelVariant {
    pub fn kind(&self) -> ModelKind {
        match self {
            ModelVariant::Fixed => ModelKind::Fixed,
            ModelVariant::Random { .. } => ModelKind::Random,
            ModelVariant::Ume { .. } => ModelKind::Ume,
        }
    }

    pub fn tau2(&self) -> f64 {
        match *self {
            ModelVariant::Fixed => 0.0,
            ModelVariant::Random { tau2, .. } | ModelVariant::Ume { tau2 } => tau2,
        }
    }
}

/// An effect estimate with its standard error.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Estimate {
    pub te: f64,
    pub se: f64,
}

impl Estimate {
    pub fn new(te: f64, se: f64) -> Self {
        Self { te, se }
    }

    pub fn variance(&self) -> f64 {
        self.se * self.se
    }

    /// Two-sided normal interval at `level` (e.g. 0.95).
    pub fn confidence_interval(&self, level: f64) -> (f64, f64) {
        let z = normal_quantile(0.5 + level / 2.0);
        (self.te - z * self.se, self.te + z * self.se)
    }

    pub fn z(&self) -> f64 {
        self.te / self.se
    }

    pub fn p_value(&self) -> f64 {
        two_sided_p(self.z())
    }

    /// The same contrast in the opposite direction.
    pub fn reversed(&self) -> Self {
        Self {
            te: -self.te,
            se: self.se,
        }
    }
}

/// Effect of one treatment relative to the anchor of its component.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RelativeEffect {
    pub treatment: String,
    /// The reference for its component; the lowest treatment id elsewhere.
    pub anchor: String,
    /// `None` only under UME when there is no direct comparison with the anchor.
    pub estimate: Option<Estimate>,
}

/// One league-table cell: effect of `treat1` relative to `treat2`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PairwiseContrast {
    pub treat1: String,
    pub treat2: String,
    #[serde(flatten)]
    pub estimate: Estimate,
    /// Whether any study compares the pair directly.
    pub direct: bool,
}

/// Direct pooled estimate of an edge next to the model's estimate.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EdgeFit {
    pub treat1: String,
    pub treat2: String,
    pub studies: usize,
    pub direct: Estimate,
    pub network: Estimate,
}

#[derive(Clone, Debug)]
enum Solution {
    Network {
        potentials: DVector<f64>,
        lplus: DMatrix<f64>,
    },
    Unrelated,
}

/// Fitted relative effects for one network and model variant.
#[derive(Clone, Debug)]
pub struct ConsistencyModel {
    variant: ModelVariant,
    treatments: Vec<Treatment>,
    components: Vec<Vec<usize>>,
    component_of: Vec<usize>,
    reference: usize,
    anchors: Vec<usize>,
    graph: NetworkGraph,
    solution: Solution,
    hat: DMatrix<f64>,
    covariance: Option<DMatrix<f64>>,
    warnings: Vec<ModelWarning>,
}

impl ConsistencyModel {
    pub fn variant(&self) -> ModelVariant {
        self.variant
    }

    pub fn kind(&self) -> ModelKind {
        self.variant.kind()
    }

    pub fn tau2(&self) -> f64 {
        self.variant.tau2()
    }

    pub fn treatments(&self) -> &[Treatment] {
        &self.treatments
    }

    pub fn treatment_index(&self, id: &str) -> Option<usize> {
        self.treatments
            .binary_search_by(|t| t.id.as_str().cmp(id))
            .ok()
    }

    pub fn reference(&self) -> &Treatment {
        &self.treatments[self.reference]
    }

    pub fn reference_index(&self) -> usize {
        self.reference
    }

    pub fn components(&self) -> &[Vec<usize>] {
        &self.components
    }

    pub fn component_of(&self, treatment: usize) -> usize {
        self.component_of[treatment]
    }

    /// Treatments sharing a component with the reference.
    pub fn reference_component(&self) -> &[usize] {
        &self.components[self.component_of[self.reference]]
    }

    /// Edges pooled with the model's tau².
    pub fn graph(&self) -> &NetworkGraph {
        &self.graph
    }

    /// Effect of every treatment relative to its component's anchor.
    pub fn effects(&self) -> Vec<RelativeEffect> {
        (0..self.treatments.len())
            .map(|t| {
                let anchor = self.anchors[self.component_of[t]];
                RelativeEffect {
                    treatment: self.treatments[t].id.clone(),
                    anchor: self.treatments[anchor].id.clone(),
                    estimate: self.contrast_by_index(t, anchor),
                }
            })
            .collect()
    }

    /// Covariance of the effects relative to the anchors, over all
    /// treatments; zero across components and on anchor rows. `None` for UME,
    /// whose pairwise estimates share no common parameterisation.
    pub fn covariance(&self) -> Option<&DMatrix<f64>> {
        self.covariance.as_ref()
    }

    /// Effect of `a` relative to `b`.
    pub fn contrast(&self, a: &str, b: &str) -> Option<Estimate> {
        self.contrast_by_index(self.treatment_index(a)?, self.treatment_index(b)?)
    }

    pub fn contrast_by_index(&self, a: usize, b: usize) -> Option<Estimate> {
        if a == b {
            return Some(Estimate::new(0.0, 0.0));
        }
        match &self.solution {
            Solution::Network { potentials, lplus } => {
                if self.component_of[a] != self.component_of[b] {
                    return None;
                }
                let variance = contrast_variance(lplus, a, b).max(0.0);
                Some(Estimate::new(potentials[a] - potentials[b], variance.sqrt()))
            }
            Solution::Unrelated => {
                let edge = self
                    .graph
                    .edge_between(a, b)
                    .filter(|edge| !edge.is_degenerate())?;
                let direct = Estimate::new(edge.te, edge.se);
                Some(if a == edge.treat1 {
                    direct
                } else {
                    direct.reversed()
                })
            }
        }
    }

    /// League table: every estimable pair `i < j` in treatment order.
    pub fn all_contrasts(&self) -> Vec<PairwiseContrast> {
        let n = self.treatments.len();
        let mut contrasts = Vec::new();
        for i in 0..n {
            for j in (i + 1)..n {
                if let Some(estimate) = self.contrast_by_index(i, j) {
                    contrasts.push(PairwiseContrast {
                        treat1: self.treatments[i].id.clone(),
                        treat2: self.treatments[j].id.clone(),
                        estimate,
                        direct: self
                            .graph
                            .edge_between(i, j)
                            .is_some_and(|edge| !edge.is_degenerate()),
                    });
                }
            }
        }
        contrasts
    }

    /// Edge-level hat matrix `H = B·L⁺·Bᵀ·W` (identity under UME).
    pub fn hat_matrix(&self) -> &DMatrix<f64> {
        &self.hat
    }

    pub fn fitted_edges(&self) -> Vec<EdgeFit> {
        self.graph
            .edges
            .iter()
            .map(|edge| {
                let direct = Estimate::new(edge.te, edge.se);
                EdgeFit {
                    treat1: self.treatments[edge.treat1].id.clone(),
                    treat2: self.treatments[edge.treat2].id.clone(),
                    studies: edge.studies(),
                    direct,
                    network: self
                        .contrast_by_index(edge.treat1, edge.treat2)
                        .unwrap_or(direct),
                }
            })
            .collect()
    }

    pub fn warnings(&self) -> &[ModelWarning] {
        &self.warnings
    }

    /// The same fit reported against another reference treatment.
    pub fn with_reference(&self, id: &str) -> Result<ConsistencyModel, ModelError> {
        let reference = self
            .treatment_index(id)
            .ok_or_else(|| InputError::UnknownTreatment {
                treatment: id.to_string(),
            })?;
        let mut model = self.clone();
        model.reference = reference;
        model.anchors = anchors(&model.components, &model.component_of, reference);
        model.covariance = model.relative_covariance();
        Ok(model)
    }

    fn relative_covariance(&self) -> Option<DMatrix<f64>> {
        let Solution::Network { lplus, .. } = &self.solution else {
            return None;
        };
        let n = self.treatments.len();
        let covariance = DMatrix::from_fn(n, n, |i, j| {
            if self.component_of[i] != self.component_of[j] {
                return 0.0;
            }
            let a = self.anchors[self.component_of[i]];
            lplus[(i, j)] - lplus[(i, a)] - lplus[(a, j)] + lplus[(a, a)]
        });
        let covariance = symmetrize(&covariance);
        if !is_positive_semidefinite(&covariance, 1e-8) {
            tracing::warn!("relative-effect covariance is not positive semidefinite");
        }
        Some(covariance)
    }
}

fn anchors(components: &[Vec<usize>], component_of: &[usize], reference: usize) -> Vec<usize> {
    components
        .iter()
        .enumerate()
        .map(|(c, members)| {
            if component_of[reference] == c {
                reference
            } else {
                members[0]
            }
        })
        .collect()
}

#[derive(Serialize)]
struct ModelView<'a> {
    variant: ModelVariant,
    tau2: f64,
    reference: &'a str,
    effects: Vec<RelativeEffect>,
    contrasts: Vec<PairwiseContrast>,
    edges: Vec<EdgeFit>,
    warnings: &'a [ModelWarning],
}

impl Serialize for ConsistencyModel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        ModelView {
            variant: self.variant,
            tau2: self.tau2(),
            reference: &self.reference().id,
            effects: self.effects(),
            contrasts: self.all_contrasts(),
            edges: self.fitted_edges(),
            warnings: &self.warnings,
        }
        .serialize(serializer)
    }
}

/// Fits [`ConsistencyModel`]s over one network.
pub struct ConsistencyEstimator<'a> {
    network: &'a Network,
    options: EstimatorOptions,
}

impl<'a> ConsistencyEstimator<'a> {
    pub fn new(network: &'a Network, options: EstimatorOptions) -> Self {
        Self { network, options }
    }

    pub fn network(&self) -> &Network {
        self.network
    }

    pub fn options(&self) -> &EstimatorOptions {
        &self.options
    }

    pub fn fit(&self, kind: ModelKind) -> Result<ConsistencyModel, ModelError> {
        let network = self.network;
        let reference = self.resolve_reference()?;
        let mut warnings: Vec<ModelWarning> = network
            .disconnected()
            .iter()
            .cloned()
            .map(ModelWarning::from)
            .collect();

        let variant = match kind {
            ModelKind::Fixed => ModelVariant::Fixed,
            ModelKind::Random | ModelKind::Ume => {
                let solution = iterate_tau2(
                    network,
                    self.options.tau_tolerance,
                    self.options.max_iterations,
                    |weights| match kind {
                        ModelKind::Ume => unrelated_fit(network, weights),
                        _ => consistency_fit(network, weights),
                    },
                )?;
                if !solution.converged {
                    warnings.push(ModelWarning::NonConvergence {
                        iterations: solution.iterations,
                        tau2: solution.tau2,
                    });
                }
                if kind == ModelKind::Ume {
                    ModelVariant::Ume {
                        tau2: solution.tau2,
                    }
                } else {
                    ModelVariant::Random {
                        tau2: solution.tau2,
                        iterations: solution.iterations,
                        converged: solution.converged,
                    }
                }
            }
        };

        let graph = network.reweighted(variant.tau2())?;
        for edge in graph.edges.iter().filter(|e| e.is_degenerate()) {
            let (treat1, treat2) = (
                network.treatment_id(edge.treat1).to_string(),
                network.treatment_id(edge.treat2).to_string(),
            );
            tracing::warn!(%treat1, %treat2, "degenerate pooled variance");
            warnings.push(ModelWarning::DegenerateComparison { treat1, treat2 });
        }

        let (solution, hat) = match kind {
            ModelKind::Ume => (
                Solution::Unrelated,
                DMatrix::identity(graph.edges.len(), graph.edges.len()),
            ),
            ModelKind::Fixed | ModelKind::Random => {
                let pairs = graph.edge_pairs();
                let y: Vec<f64> = graph.edges.iter().map(|e| e.te).collect();
                let weights: Vec<f64> = graph.edges.iter().map(|e| e.weight()).collect();
                let gls = solve_by_component(
                    network.treatments().len(),
                    network.components(),
                    &pairs,
                    &y,
                    &weights,
                );
                let hat = gls.hat_matrix(&pairs, &weights);
                (
                    Solution::Network {
                        potentials: gls.potentials,
                        lplus: gls.lplus,
                    },
                    hat,
                )
            }
        };

        let components = network.components().to_vec();
        let component_of: Vec<usize> = (0..network.treatments().len())
            .map(|t| network.component_of(t))
            .collect();
        let mut model = ConsistencyModel {
            variant,
            treatments: network.treatments().to_vec(),
            anchors: anchors(&components, &component_of, reference),
            components,
            component_of,
            reference,
            graph,
            solution,
            hat,
            covariance: None,
            warnings,
        };
        model.covariance = model.relative_covariance();

        tracing::debug!(
            model = kind.name(),
            tau2 = model.tau2(),
            reference = %model.reference().id,
            "fitted network model"
        );
        Ok(model)
    }

    fn resolve_reference(&self) -> Result<usize, ModelError> {
        match &self.options.reference {
            Some(id) => self.network.treatment_index(id).ok_or_else(|| {
                InputError::UnknownTreatment {
                    treatment: id.clone(),
                }
                .into()
            }),
            None => Ok(self
                .network
                .components()
                .first()
                .and_then(|members| members.first())
                .copied()
                .unwrap_or(0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use nma_data::Comparison;

    fn cmp(study: &str, t1: &str, t2: &str, te: f64, se: f64) -> Comparison {
        Comparison {
            study: study.to_string(),
            treat1: t1.to_string(),
            treat2: t2.to_string(),
            te,
            se,
        }
    }

    fn triangle() -> Network {
        GraphBuilder::new()
            .from_comparisons(&[
                cmp("s1", "A", "B", 1.0, 1.0),
                cmp("s2", "A", "C", 0.4, 1.0),
                cmp("s3", "C", "B", 0.4, 1.0),
            ])
            .unwrap()
    }

    #[test]
    fn fixed_triangle_combines_direct_and_indirect() {
        let network = triangle();
        let model = ConsistencyEstimator::new(&network, EstimatorOptions::default())
            .fit(ModelKind::Fixed)
            .unwrap();
        let ab = model.contrast("A", "B").unwrap();
        assert!((ab.te - 1.4 / 1.5).abs() < 1e-10);
        assert!((ab.variance() - 2.0 / 3.0).abs() < 1e-10);
        assert_eq!(model.tau2(), 0.0);
        assert_eq!(model.reference().id, "A");

        let ba = model.contrast("B", "A").unwrap();
        assert!((ba.te + ab.te).abs() < 1e-12);
    }

    #[test]
    fn reference_change_preserves_contrasts() {
        let network = triangle();
        let model = ConsistencyEstimator::new(&network, EstimatorOptions::default())
            .fit(ModelKind::Random)
            .unwrap();
        let rebased = model.with_reference("C").unwrap();
        for (a, b) in model.all_contrasts().iter().zip(rebased.all_contrasts()) {
            assert!((a.estimate.te - b.estimate.te).abs() < 1e-12);
            assert!((a.estimate.se - b.estimate.se).abs() < 1e-12);
        }
        let effects = rebased.effects();
        assert_eq!(effects[2].anchor, "C");
        assert_eq!(effects[2].estimate, Some(Estimate::new(0.0, 0.0)));

        let cov = rebased.covariance().unwrap();
        let ac = rebased.contrast("A", "C").unwrap();
        assert!((cov[(0, 0)] - ac.variance()).abs() < 1e-12);
        assert_eq!(cov[(2, 2)], 0.0);

        assert!(matches!(
            model.with_reference("Z"),
            Err(ModelError::Input(InputError::UnknownTreatment { .. }))
        ));
    }

    #[test]
    fn random_effects_widen_intervals() {
        let network = GraphBuilder::new()
            .from_comparisons(&[
                cmp("s1", "A", "B", 0.1, 0.1),
                cmp("s2", "A", "B", 0.9, 0.15),
                cmp("s3", "B", "C", 0.3, 0.1),
                cmp("s4", "B", "C", -0.4, 0.2),
                cmp("s5", "A", "C", 0.2, 0.1),
            ])
            .unwrap();
        let estimator = ConsistencyEstimator::new(&network, EstimatorOptions::default());
        let fixed = estimator.fit(ModelKind::Fixed).unwrap();
        let random = estimator.fit(ModelKind::Random).unwrap();

        assert!(random.tau2() > 0.0);
        assert!(matches!(
            random.variant(),
            ModelVariant::Random {
                converged: true,
                ..
            }
        ));
        let f = fixed.contrast("A", "C").unwrap();
        let r = random.contrast("A", "C").unwrap();
        assert!(r.se > f.se);
        assert!(random.warnings().is_empty());
    }

    #[test]
    fn iteration_cap_is_reported() {
        let network = GraphBuilder::new()
            .from_comparisons(&[
                cmp("s1", "A", "B", 0.1, 0.1),
                cmp("s2", "A", "B", 0.9, 0.15),
                cmp("s3", "A", "B", 0.5, 0.1),
            ])
            .unwrap();
        let options = EstimatorOptions {
            max_iterations: 1,
            ..EstimatorOptions::default()
        };
        let model = ConsistencyEstimator::new(&network, options)
            .fit(ModelKind::Random)
            .unwrap();
        assert!(model
            .warnings()
            .iter()
            .any(|w| matches!(w, ModelWarning::NonConvergence { iterations: 1, .. })));
        assert!(model.tau2() > 0.0);
    }

    #[test]
    fn unrelated_effects_only_cover_direct_pairs() {
        let network = GraphBuilder::new()
            .from_comparisons(&[
                cmp("s1", "A", "B", 0.5, 0.2),
                cmp("s2", "B", "C", 0.3, 0.2),
            ])
            .unwrap();
        let model = ConsistencyEstimator::new(&network, EstimatorOptions::default())
            .fit(ModelKind::Ume)
            .unwrap();
        assert_eq!(model.kind(), ModelKind::Ume);
        assert!(model.contrast("A", "C").is_none());
        let cb = model.contrast("C", "B").unwrap();
        assert!((cb.te + 0.3).abs() < 1e-12);
        assert!(model.covariance().is_none());
        assert_eq!(model.all_contrasts().len(), 2);
        assert_eq!(model.effects()[2].estimate, None);
    }

    #[test]
    fn components_are_solved_independently() {
        let network = GraphBuilder::new()
            .from_comparisons(&[
                cmp("s1", "A", "B", 0.5, 0.2),
                cmp("s2", "B", "C", 0.3, 0.2),
                cmp("s3", "X", "Y", 1.5, 0.4),
            ])
            .unwrap();
        let model = ConsistencyEstimator::new(&network, EstimatorOptions::default())
            .fit(ModelKind::Fixed)
            .unwrap();

        assert!(model.contrast("A", "X").is_none());
        let xy = model.contrast("X", "Y").unwrap();
        assert!((xy.te - 1.5).abs() < 1e-12);
        assert!((xy.se - 0.4).abs() < 1e-12);
        assert_eq!(model.effects()[4].anchor, "X");
        assert_eq!(model.covariance().unwrap()[(1, 4)], 0.0);
        assert!(matches!(
            model.warnings()[0],
            ModelWarning::Disconnected { .. }
        ));
    }

    #[test]
    fn edge_hat_matrix_reproduces_network_estimates() {
        let network = triangle();
        let model = ConsistencyEstimator::new(&network, EstimatorOptions::default())
            .fit(ModelKind::Fixed)
            .unwrap();
        let direct = DVector::from_iterator(3, model.graph().edges.iter().map(|e| e.te));
        let projected = model.hat_matrix() * direct;
        for (p, fit) in projected.iter().zip(model.fitted_edges()) {
            assert!((p - fit.network.te).abs() < 1e-10);
        }
    }

    #[test]
    fn degenerate_edge_is_left_out_of_the_solve() {
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

        let ab = model.contrast("A", "B").unwrap();
        assert!((ab.te - 0.5).abs() < 1e-10);
        assert!((ab.variance() - 0.08).abs() < 1e-10);
        for contrast in model.all_contrasts() {
            assert!(contrast.estimate.te.is_finite());
            assert!(contrast.estimate.se > 0.0);
        }
        assert!(!model.all_contrasts()[0].direct);
        assert_eq!(
            model.warnings(),
            &[ModelWarning::DegenerateComparison {
                treat1: "A".to_string(),
                treat2: "B".to_string(),
            }]
        );

        let ume = ConsistencyEstimator::new(&network, EstimatorOptions::default())
            .fit(ModelKind::Ume)
            .unwrap();
        assert_eq!(ume.contrast("A", "B"), None);
        assert!(ume.contrast("A", "C").is_some());
    }

    #[test]
    fn estimate_interval_and_test() {
        let estimate = Estimate::new(0.5, 0.2);
        let (lo, hi) = estimate.confidence_interval(0.95);
        assert!((lo - (0.5 - 1.959963984540054 * 0.2)).abs() < 1e-8);
        assert!((hi - (0.5 + 1.959963984540054 * 0.2)).abs() < 1e-8);
        assert!((estimate.z() - 2.5).abs() < 1e-12);
        assert!(estimate.p_value() < 0.05);
    }

    #[test]
    fn model_serializes_to_json() {
        let network = triangle();
        let model = ConsistencyEstimator::new(&network, EstimatorOptions::default())
            .fit(ModelKind::Fixed)
            .unwrap();
        let json = serde_json::to_value(&model).unwrap();
        assert_eq!(json["variant"]["kind"], "fixed");
        assert_eq!(json["reference"], "A");
        assert_eq!(json["contrasts"].as_array().unwrap().len(), 3);
    }
}
