//! Network construction from study records.
//!
//! [`GraphBuilder`] turns arm-level studies (or pre-aggregated comparisons)
//! into a [`Network`]: the ordered treatment set, the per-study comparison
//! table, and a [`NetworkGraph`] with one inverse-variance-pooled edge per
//! treatment pair.
//!
//! ## Orientation
//!
//! Treatments are ordered by id. Every stored comparison is oriented so that
//! `treat1 < treat2`; `te` is the effect of `treat1` relative to `treat2`,
//! and a flipped input comparison has its sign negated.
//!
//! ## Components
//!
//! Connected components are Tarjan SCCs of the undirected treatment graph.
//! The largest one is primary; every other component (including a lone
//! treatment from a single-arm study) is reported as a
//! [`DisconnectedNetworkError`] and still analysed on its own.
//!
//! ## Degenerate evidence
//!
//! A treatment pair whose fixed-effect pooled variance is zero or not
//! finite (for example a standard error whose square underflows) carries no
//! usable weight. Its comparisons are excluded: they get weight zero in
//! every fit, the edge keeps `se = 0`, and it does not link components.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use nalgebra::DMatrix;
use nma_data::pairwise::{studies_to_comparisons, validate_comparison};
use nma_data::{Comparison, Evidence, InputError, Measure, NetworkInput, Study, Treatment};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{NodeIndex, UnGraph};

use crate::error::{DisconnectedNetworkError, ModelError};
use crate::multiarm;

/// Pooled variances at or below this value are degenerate.
pub const DEGENERATE_VARIANCE: f64 = 1e-300;

fn is_degenerate_variance(variance: f64) -> bool {
    !(variance.is_finite() && variance > DEGENERATE_VARIANCE)
}

/// One study-level comparison, oriented by treatment index.
#[derive(Clone, Debug, PartialEq)]
pub struct StudyComparison {
    /// Index into [`Network::studies`].
    pub study: usize,
    pub treat1: usize,
    pub treat2: usize,
    pub te: f64,
    /// Reported standard error (before any multi-arm adjustment).
    pub se: f64,
}

impl StudyComparison {
    pub fn pair(&self) -> (usize, usize) {
        (self.treat1, self.treat2)
    }
}

/// A study as seen by the network: its treatment set and comparison rows.
#[derive(Clone, Debug, PartialEq)]
pub struct StudyRecord {
    pub id: String,
    /// Sorted treatment indices.
    pub treatments: Vec<usize>,
    /// Indices into [`Network::comparisons`].
    pub comparisons: Vec<usize>,
}

impl StudyRecord {
    pub fn arms(&self) -> usize {
        self.treatments.len()
    }

    pub fn is_multi_arm(&self) -> bool {
        self.treatments.len() > 2
    }
}

/// One aggregated edge: all direct evidence on a treatment pair, pooled.
#[derive(Clone, Debug, PartialEq)]
pub struct AggregatedEdge {
    pub treat1: usize,
    pub treat2: usize,
    /// Pooled effect of `treat1` relative to `treat2`.
    pub te: f64,
    pub se: f64,
    /// Indices into [`Network::comparisons`].
    pub comparisons: Vec<usize>,
}

impl AggregatedEdge {
    pub fn pair(&self) -> (usize, usize) {
        (self.treat1, self.treat2)
    }

    pub fn variance(&self) -> f64 {
        self.se * self.se
    }

    /// Conductance of the edge: the inverse pooled variance, or zero for a
    /// degenerate edge.
    pub fn weight(&self) -> f64 {
        if self.is_degenerate() {
            0.0
        } else {
            1.0 / self.variance()
        }
    }

    pub fn studies(&self) -> usize {
        self.comparisons.len()
    }

    pub fn is_degenerate(&self) -> bool {
        is_degenerate_variance(self.variance())
    }
}

/// Treatment graph with pooled edges for one value of tau².
#[derive(Clone, Debug)]
pub struct NetworkGraph {
    /// Node weights are treatment indices; edge weights index `edges`.
    pub graph: UnGraph<usize, usize>,
    pub edges: Vec<AggregatedEdge>,
    /// Heterogeneity variance added to every comparison before pooling.
    pub tau2: f64,
}

impl NetworkGraph {
    pub fn edge_pairs(&self) -> Vec<(usize, usize)> {
        self.edges.iter().map(AggregatedEdge::pair).collect()
    }

    pub fn edge_between(&self, a: usize, b: usize) -> Option<&AggregatedEdge> {
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        self.edges.iter().find(|e| e.treat1 == lo && e.treat2 == hi)
    }

    /// Node index of a treatment (nodes are inserted in treatment order).
    pub fn node(&self, treatment: usize) -> NodeIndex {
        NodeIndex::new(treatment)
    }
}

/// Immutable evidence network for one analysis run.
#[derive(Clone, Debug)]
pub struct Network {
    treatments: Vec<Treatment>,
    studies: Vec<StudyRecord>,
    comparisons: Vec<StudyComparison>,
    fixed_variances: Vec<f64>,
    excluded: Vec<bool>,
    components: Vec<Vec<usize>>,
    component_of: Vec<usize>,
    disconnected: Vec<DisconnectedNetworkError>,
    graph: NetworkGraph,
}

impl Network {
    pub fn treatments(&self) -> &[Treatment] {
        &self.treatments
    }

    pub fn treatment_ids(&self) -> Vec<String> {
        self.treatments.iter().map(|t| t.id.clone()).collect()
    }

    pub fn treatment_index(&self, id: &str) -> Option<usize> {
        self.treatments
            .binary_search_by(|t| t.id.as_str().cmp(id))
            .ok()
    }

    pub fn treatment_id(&self, index: usize) -> &str {
        &self.treatments[index].id
    }

    pub fn studies(&self) -> &[StudyRecord] {
        &self.studies
    }

    pub fn comparisons(&self) -> &[StudyComparison] {
        &self.comparisons
    }

    pub fn comparison_pairs(&self) -> Vec<(usize, usize)> {
        self.comparisons.iter().map(StudyComparison::pair).collect()
    }

    pub fn comparison_effects(&self) -> Vec<f64> {
        self.comparisons.iter().map(|c| c.te).collect()
    }

    /// Connected components, primary first; each sorted by treatment index.
    pub fn components(&self) -> &[Vec<usize>] {
        &self.components
    }

    pub fn component_of(&self, treatment: usize) -> usize {
        self.component_of[treatment]
    }

    /// Components other than the primary one.
    pub fn disconnected(&self) -> &[DisconnectedNetworkError] {
        &self.disconnected
    }

    pub fn is_connected(&self) -> bool {
        self.components.len() <= 1
    }

    /// Graph pooled with fixed-effect weights.
    pub fn graph(&self) -> &NetworkGraph {
        &self.graph
    }

    /// Whether comparison `row` belongs to a degenerate edge.
    pub fn is_excluded(&self, row: usize) -> bool {
        self.excluded[row]
    }

    /// Number of independent comparisons, Σ (arms − 1) over studies, counting
    /// only the arms reached by usable comparisons.
    pub fn independent_comparisons(&self) -> usize {
        self.studies
            .iter()
            .map(|s| {
                let arms: BTreeSet<usize> = s
                    .comparisons
                    .iter()
                    .filter(|&&r| !self.excluded[r])
                    .flat_map(|&r| [self.comparisons[r].treat1, self.comparisons[r].treat2])
                    .collect();
                arms.len().saturating_sub(1)
            })
            .sum()
    }

    /// Number of free treatment parameters, n − (number of components).
    pub fn parameters(&self) -> usize {
        self.treatments.len() - self.components.len()
    }

    /// Per-comparison variances after adding tau² and the multi-arm reduction.
    pub fn adjusted_variances(&self, tau2: f64) -> Result<Vec<f64>, InputError> {
        if tau2 == 0.0 {
            return Ok(self.fixed_variances.clone());
        }
        adjust_all(&self.studies, &self.comparisons, tau2)
    }

    /// Inverse adjusted variances; zero for excluded comparisons.
    pub fn weights(&self, tau2: f64) -> Result<Vec<f64>, InputError> {
        Ok(self
            .adjusted_variances(tau2)?
            .into_iter()
            .zip(&self.excluded)
            .map(|(v, &excluded)| if excluded { 0.0 } else { 1.0 / v })
            .collect())
    }

    /// Re-pool every edge with tau² added to each comparison variance.
    pub fn reweighted(&self, tau2: f64) -> Result<NetworkGraph, InputError> {
        if tau2 == 0.0 {
            return Ok(self.graph.clone());
        }
        let variances = self.adjusted_variances(tau2)?;
        Ok(aggregate(
            self.treatments.len(),
            &self.comparisons,
            &variances,
            &self.excluded,
            tau2,
        ))
    }

    /// Block-diagonal sampling covariance of the study comparisons, built
    /// from the reported (unadjusted) variances.
    pub fn sampling_covariance(&self) -> DMatrix<f64> {
        let mut v = DMatrix::zeros(self.comparisons.len(), self.comparisons.len());
        for study in &self.studies {
            let (pairs, variances) = self.local_rows(study);
            let block = multiarm::within_study_covariance(study.arms(), &pairs, &variances);
            for (a, &ra) in study.comparisons.iter().enumerate() {
                for (b, &rb) in study.comparisons.iter().enumerate() {
                    v[(ra, rb)] = block[(a, b)];
                }
            }
        }
        v
    }

    /// Covariance structure of the random effects: `(B·Bᵀ ∘ E) / 2`, with E
    /// the same-study indicator.
    pub fn heterogeneity_structure(&self) -> DMatrix<f64> {
        let mut s = DMatrix::zeros(self.comparisons.len(), self.comparisons.len());
        for study in &self.studies {
            for &ra in &study.comparisons {
                for &rb in &study.comparisons {
                    let (a, b) = self.comparisons[ra].pair();
                    let (c, d) = self.comparisons[rb].pair();
                    let dot = indicator(a == c) - indicator(a == d) - indicator(b == c)
                        + indicator(b == d);
                    s[(ra, rb)] = 0.5 * dot;
                }
            }
        }
        s
    }

    fn local_rows(&self, study: &StudyRecord) -> (Vec<(usize, usize)>, Vec<f64>) {
        local_rows(study, &self.comparisons)
    }
}

fn indicator(flag: bool) -> f64 {
    if flag {
        1.0
    } else {
        0.0
    }
}

fn local_rows(
    study: &StudyRecord,
    comparisons: &[StudyComparison],
) -> (Vec<(usize, usize)>, Vec<f64>) {
    let local: HashMap<usize, usize> = study
        .treatments
        .iter()
        .enumerate()
        .map(|(k, &t)| (t, k))
        .collect();
    study
        .comparisons
        .iter()
        .map(|&r| {
            let c = &comparisons[r];
            ((local[&c.treat1], local[&c.treat2]), c.se * c.se)
        })
        .unzip()
}

fn adjust_all(
    studies: &[StudyRecord],
    comparisons: &[StudyComparison],
    tau2: f64,
) -> Result<Vec<f64>, InputError> {
    let mut adjusted = vec![0.0; comparisons.len()];
    for study in studies {
        if study.comparisons.is_empty() {
            continue;
        }
        let (pairs, variances) = local_rows(study, comparisons);
        let study_adjusted = multiarm::adjusted_variances(study.arms(), &pairs, &variances, tau2)
            .ok_or_else(|| InputError::InconsistentMultiArmVariance {
                study: study.id.clone(),
            })?;
        for (&r, v) in study.comparisons.iter().zip(study_adjusted) {
            adjusted[r] = v;
        }
    }
    Ok(adjusted)
}

fn rows_by_pair(comparisons: &[StudyComparison]) -> BTreeMap<(usize, usize), Vec<usize>> {
    let mut by_pair: BTreeMap<(usize, usize), Vec<usize>> = BTreeMap::new();
    for (r, c) in comparisons.iter().enumerate() {
        by_pair.entry(c.pair()).or_default().push(r);
    }
    by_pair
}

/// Marks every comparison of a pair whose pooled variance is degenerate.
fn degenerate_rows(comparisons: &[StudyComparison], variances: &[f64]) -> Vec<bool> {
    let mut excluded = vec![false; comparisons.len()];
    for rows in rows_by_pair(comparisons).values() {
        let total_weight: f64 = rows.iter().map(|&r| 1.0 / variances[r]).sum();
        if is_degenerate_variance(1.0 / total_weight) {
            for &r in rows {
                excluded[r] = true;
            }
        }
    }
    excluded
}

fn aggregate(
    n: usize,
    comparisons: &[StudyComparison],
    variances: &[f64],
    excluded: &[bool],
    tau2: f64,
) -> NetworkGraph {
    let by_pair = rows_by_pair(comparisons);

    let mut graph = UnGraph::with_capacity(n, by_pair.len());
    for t in 0..n {
        graph.add_node(t);
    }

    let mut edges = Vec::with_capacity(by_pair.len());
    for ((treat1, treat2), rows) in by_pair {
        // No usable pooled value: keep the plain mean with a zero standard error.
        let (te, se) = if rows.iter().any(|&r| excluded[r]) {
            let mean = rows.iter().map(|&r| comparisons[r].te).sum::<f64>() / rows.len() as f64;
            (mean, 0.0)
        } else {
            let total_weight: f64 = rows.iter().map(|&r| 1.0 / variances[r]).sum();
            let te = rows
                .iter()
                .map(|&r| comparisons[r].te / variances[r])
                .sum::<f64>()
                / total_weight;
            (te, (1.0 / total_weight).sqrt())
        };

        graph.add_edge(NodeIndex::new(treat1), NodeIndex::new(treat2), edges.len());
        edges.push(AggregatedEdge {
            treat1,
            treat2,
            te,
            se,
            comparisons: rows,
        });
    }

    NetworkGraph { graph, edges, tau2 }
}

/// Builds a [`Network`] from input records.
#[derive(Clone, Debug, Default)]
pub struct GraphBuilder {
    strict: bool,
    labels: Vec<Treatment>,
}

/// A study after grouping, before treatment indices are assigned.
struct RawStudy {
    id: String,
    treatments: BTreeSet<String>,
    comparisons: Vec<Comparison>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail with [`ModelError::Disconnected`] instead of recording the
    /// component as a non-fatal issue.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Display labels for treatments. Listed treatments become vertices even
    /// without evidence (and are then reported as disconnected).
    pub fn with_treatments(mut self, labels: Vec<Treatment>) -> Self {
        self.labels = labels;
        self
    }

    pub fn build(&self, input: &NetworkInput) -> Result<Network, ModelError> {
        let builder = Self {
            strict: self.strict,
            labels: self
                .labels
                .iter()
                .chain(input.treatments.iter())
                .cloned()
                .collect(),
        };
        match &input.evidence {
            Evidence::Arms { measure, studies } => builder.from_studies(studies, *measure),
            Evidence::Contrasts { comparisons } => builder.from_comparisons(comparisons),
        }
    }

    /// Arm-level studies: every within-study pair becomes a comparison.
    pub fn from_studies(&self, studies: &[Study], measure: Measure) -> Result<Network, ModelError> {
        let mut by_study: HashMap<String, Vec<Comparison>> = HashMap::new();
        for comparison in studies_to_comparisons(studies, measure)? {
            by_study
                .entry(comparison.study.clone())
                .or_default()
                .push(comparison);
        }

        let raw = studies
            .iter()
            .map(|study| RawStudy {
                id: study.id.clone(),
                treatments: study.arms.iter().map(|a| a.treatment.clone()).collect(),
                comparisons: by_study.remove(&study.id).unwrap_or_default(),
            })
            .collect();

        self.assemble(raw)
    }

    /// Pre-aggregated comparisons; rows sharing a study label form one
    /// (possibly multi-arm) study.
    pub fn from_comparisons(&self, comparisons: &[Comparison]) -> Result<Network, ModelError> {
        if comparisons.is_empty() {
            return Err(InputError::Empty.into());
        }

        let mut order: Vec<&str> = Vec::new();
        let mut grouped: HashMap<&str, Vec<&Comparison>> = HashMap::new();
        for comparison in comparisons {
            validate_comparison(comparison)?;
            let rows = grouped.entry(comparison.study.as_str()).or_default();
            if rows.is_empty() {
                order.push(comparison.study.as_str());
            }
            rows.push(comparison);
        }

        let mut raw = Vec::with_capacity(order.len());
        for study in order {
            let rows = &grouped[study];
            let mut pairs = HashSet::new();
            let mut treatments = BTreeSet::new();
            for c in rows {
                let key = if c.treat1 < c.treat2 {
                    (c.treat1.as_str(), c.treat2.as_str())
                } else {
                    (c.treat2.as_str(), c.treat1.as_str())
                };
                if !pairs.insert(key) {
                    return Err(InputError::DuplicateComparison {
                        study: study.to_string(),
                        treat1: key.0.to_string(),
                        treat2: key.1.to_string(),
                    }
                    .into());
                }
                treatments.insert(c.treat1.clone());
                treatments.insert(c.treat2.clone());
            }

            let k = treatments.len();
            let expected = k * (k - 1) / 2;
            if rows.len() != expected {
                return Err(InputError::IncompleteMultiArm {
                    study: study.to_string(),
                    expected,
                    found: rows.len(),
                }
                .into());
            }

            raw.push(RawStudy {
                id: study.to_string(),
                treatments,
                comparisons: rows.iter().map(|c| (*c).clone()).collect(),
            });
        }

        self.assemble(raw)
    }

    fn assemble(&self, raw: Vec<RawStudy>) -> Result<Network, ModelError> {
        let mut labels: BTreeMap<String, Treatment> = BTreeMap::new();
        for study in &raw {
            for t in &study.treatments {
                labels
                    .entry(t.clone())
                    .or_insert_with(|| Treatment::new(t.clone()));
            }
        }
        for t in &self.labels {
            let label = if t.label.is_empty() {
                t.id.clone()
            } else {
                t.label.clone()
            };
            labels.insert(t.id.clone(), Treatment::with_label(t.id.clone(), label));
        }

        let treatments: Vec<Treatment> = labels.into_values().collect();
        let index: HashMap<&str, usize> = treatments
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.as_str(), i))
            .collect();

        let mut studies = Vec::with_capacity(raw.len());
        let mut comparisons = Vec::new();
        for (s, study) in raw.iter().enumerate() {
            let mut rows = Vec::with_capacity(study.comparisons.len());
            for c in &study.comparisons {
                let (i, j) = (index[c.treat1.as_str()], index[c.treat2.as_str()]);
                let (treat1, treat2, te) = if i < j { (i, j, c.te) } else { (j, i, -c.te) };
                rows.push(comparisons.len());
                comparisons.push(StudyComparison {
                    study: s,
                    treat1,
                    treat2,
                    te,
                    se: c.se,
                });
            }
            let mut members: Vec<usize> = study
                .treatments
                .iter()
                .map(|t| index[t.as_str()])
                .collect();
            members.sort_unstable();
            studies.push(StudyRecord {
                id: study.id.clone(),
                treatments: members,
                comparisons: rows,
            });
        }

        let fixed_variances = adjust_all(&studies, &comparisons, 0.0)?;
        let excluded = degenerate_rows(&comparisons, &fixed_variances);
        let graph = aggregate(
            treatments.len(),
            &comparisons,
            &fixed_variances,
            &excluded,
            0.0,
        );
        for edge in graph.edges.iter().filter(|e| e.is_degenerate()) {
            tracing::warn!(
                treat1 = %treatments[edge.treat1].id,
                treat2 = %treatments[edge.treat2].id,
                "excluding comparison with degenerate pooled variance"
            );
        }

        let components = connected_components(&graph);
        let mut component_of = vec![0; treatments.len()];
        for (c, members) in components.iter().enumerate() {
            for &t in members {
                component_of[t] = c;
            }
        }

        let disconnected: Vec<DisconnectedNetworkError> = components
            .iter()
            .skip(1)
            .map(|members| DisconnectedNetworkError {
                treatments: members.iter().map(|&t| treatments[t].id.clone()).collect(),
            })
            .collect();

        for issue in &disconnected {
            tracing::warn!(treatments = ?issue.treatments, "disconnected network component");
        }
        if self.strict {
            if let Some(first) = disconnected.first() {
                return Err(first.clone().into());
            }
        }

        tracing::debug!(
            treatments = treatments.len(),
            studies = studies.len(),
            comparisons = comparisons.len(),
            edges = graph.edges.len(),
            components = components.len(),
            "built evidence network"
        );

        Ok(Network {
            treatments,
            studies,
            comparisons,
            fixed_variances,
            excluded,
            components,
            component_of,
            disconnected,
            graph,
        })
    }
}

/// Components of the undirected treatment graph, largest first (ties broken
/// by lowest treatment index), the rest ordered by lowest treatment index.
/// Degenerate edges do not connect their endpoints.
fn connected_components(graph: &NetworkGraph) -> Vec<Vec<usize>> {
    let usable = graph.graph.filter_map(
        |_, &treatment| Some(treatment),
        |_, &edge| (!graph.edges[edge].is_degenerate()).then_some(edge),
    );
    let mut components: Vec<Vec<usize>> = tarjan_scc(&usable)
        .into_iter()
        .map(|scc| {
            let mut members: Vec<usize> = scc.into_iter().map(|ix| usable[ix]).collect();
            members.sort_unstable();
            members
        })
        .collect();

    components.sort_by_key(|members| members[0]);
    if let Some(primary) = components
        .iter()
        .enumerate()
        .max_by(|(ia, a), (ib, b)| a.len().cmp(&b.len()).then(ib.cmp(ia)))
        .map(|(i, _)| i)
    {
        let members = components.remove(primary);
        components.insert(0, members);
    }
    components
}
