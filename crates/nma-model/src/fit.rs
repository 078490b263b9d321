//! Linear fits over the study-level comparisons and the method-of-moments
//! estimator for tau².
//!
//! Every model in the crate (consistency, unrelated mean effects, and the
//! design-by-treatment model) is linear in the observed comparisons:
//! `ŷ = H·y` with comparison weights `W`. The moment estimator only needs
//! that projection:
//!
//! ```text
//! Q   = Σ w·(y − ŷ)²
//! E₀  = tr(W·(I − H)·V₀)      expected Q without heterogeneity
//! D   = tr(W·(I − H)·S)       S = (B·Bᵀ ∘ E) / 2
//! τ²  = max(0, (Q − E₀) / D)
//! ```
//!
//! [`iterate_tau2`] repeats this with the weights re-derived from the
//! current τ² until the estimate settles; its first step is the
//! DerSimonian–Laird estimate.

use std::collections::BTreeMap;

use nalgebra::DMatrix;
use nma_data::InputError;

use crate::graph::Network;
use crate::linalg::solve_by_component;

/// Fitted comparisons and the projection that produced them.
#[derive(Clone, Debug)]
pub struct LinearFit {
    pub fitted: Vec<f64>,
    /// `ŷ = hat · y`.
    pub hat: DMatrix<f64>,
}

impl LinearFit {
    /// Weighted residual sum of squares.
    pub fn q(&self, y: &[f64], weights: &[f64]) -> f64 {
        y.iter()
            .zip(&self.fitted)
            .zip(weights)
            .map(|((y, f), w)| w * (y - f).powi(2))
            .sum()
    }
}

/// Consistency model over the study comparisons: one GLS solve per
/// connected component.
pub fn consistency_fit(network: &Network, weights: &[f64]) -> LinearFit {
    let pairs = network.comparison_pairs();
    let y = network.comparison_effects();
    let solution = solve_by_component(
        network.treatments().len(),
        network.components(),
        &pairs,
        &y,
        weights,
    );
    LinearFit {
        fitted: solution.fitted(&pairs),
        hat: solution.hat_matrix(&pairs, weights),
    }
}

/// Unrelated mean effects: each treatment pair is pooled on its own.
pub fn unrelated_fit(network: &Network, weights: &[f64]) -> LinearFit {
    let comparisons = network.comparisons();
    let m = comparisons.len();

    let mut by_pair: BTreeMap<(usize, usize), Vec<usize>> = BTreeMap::new();
    for (r, c) in comparisons.iter().enumerate() {
        by_pair.entry(c.pair()).or_default().push(r);
    }

    let mut fitted = vec![0.0; m];
    let mut hat = DMatrix::zeros(m, m);
    for rows in by_pair.values() {
        let total: f64 = rows.iter().map(|&r| weights[r]).sum();
        if total <= 0.0 {
            // Excluded pair: reproduce the observations, no residual.
            for &r in rows {
                fitted[r] = comparisons[r].te;
                hat[(r, r)] = 1.0;
            }
            continue;
        }
        let pooled = rows
            .iter()
            .map(|&r| weights[r] * comparisons[r].te)
            .sum::<f64>()
            / total;
        for &r in rows {
            fitted[r] = pooled;
            for &s in rows {
                hat[(r, s)] = weights[s] / total;
            }
        }
    }

    LinearFit { fitted, hat }
}

/// One evaluation of the moment equation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MomentEstimate {
    pub q: f64,
    /// E₀, the expected Q when τ² = 0.
    pub expected_q: f64,
    /// D, the sensitivity of E[Q] to τ².
    pub denominator: f64,
    pub tau2: f64,
}

/// Solve the moment equation once for a given fit.
pub fn moment_estimate(
    y: &[f64],
    weights: &[f64],
    fit: &LinearFit,
    sampling: &DMatrix<f64>,
    structure: &DMatrix<f64>,
) -> MomentEstimate {
    let m = y.len();
    let mut residual = DMatrix::identity(m, m) - &fit.hat;
    for (r, &w) in weights.iter().enumerate() {
        residual.row_mut(r).scale_mut(w);
    }

    let q = fit.q(y, weights);
    let expected_q = (&residual * sampling).trace();
    let denominator = (&residual * structure).trace();

    let scale: f64 = weights.iter().sum::<f64>().max(1.0);
    let tau2 = if denominator <= 1e-10 * scale {
        0.0
    } else {
        ((q - expected_q) / denominator).max(0.0)
    };

    MomentEstimate {
        q,
        expected_q,
        denominator,
        tau2,
    }
}

/// Outcome of the τ² fixed-point loop.
#[derive(Clone, Debug)]
pub struct TauSolution {
    pub tau2: f64,
    pub iterations: usize,
    pub converged: bool,
    /// Weights at the final τ².
    pub weights: Vec<f64>,
    pub fit: LinearFit,
}

/// Iterate the moment estimator to a fixed point.
///
/// `model` maps comparison weights to a fit. The loop stops when successive
/// estimates differ by at most `tolerance · (1 + τ²)` or after
/// `max_iterations` evaluations; in the latter case `converged` is false and
/// the last estimate is kept.
pub fn iterate_tau2<F>(
    network: &Network,
    tolerance: f64,
    max_iterations: usize,
    model: F,
) -> Result<TauSolution, InputError>
where
    F: Fn(&[f64]) -> LinearFit,
{
    let y = network.comparison_effects();
    let sampling = network.sampling_covariance();
    let structure = network.heterogeneity_structure();

    let mut tau2 = 0.0;
    let mut iterations = 0;
    let mut converged = false;
    while iterations < max_iterations.max(1) {
        iterations += 1;
        let weights = network.weights(tau2)?;
        let fit = model(&weights);
        let next = moment_estimate(&y, &weights, &fit, &sampling, &structure).tau2;
        tracing::trace!(iteration = iterations, tau2 = next, "tau² update");

        let settled = (next - tau2).abs() <= tolerance * (1.0 + tau2);
        tau2 = next;
        if settled {
            converged = true;
            break;
        }
    }

    if !converged {
        tracing::warn!(iterations, tau2, "tau² iteration hit the cap");
    }

    let weights = network.weights(tau2)?;
    let fit = model(&weights);
    Ok(TauSolution {
        tau2,
        iterations,
        converged,
        weights,
        fit,
    })
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

    #[test]
    fn pairwise_estimate_matches_dersimonian_laird() {
        let network = GraphBuilder::new()
            .from_comparisons(&[
                cmp("s1", "A", "B", 0.2, 0.1),
                cmp("s2", "A", "B", 0.8, 0.1),
                cmp("s3", "A", "B", 0.5, 0.2),
            ])
            .unwrap();
        let weights = network.weights(0.0).unwrap();
        let fit = consistency_fit(&network, &weights);
        let estimate = moment_estimate(
            &network.comparison_effects(),
            &weights,
            &fit,
            &network.sampling_covariance(),
            &network.heterogeneity_structure(),
        );

        // Classical DL: (Q − (k − 1)) / (Σw − Σw²/Σw).
        let w = [100.0, 100.0, 25.0];
        let sw: f64 = w.iter().sum();
        let mean = (100.0 * 0.2 + 100.0 * 0.8 + 25.0 * 0.5) / sw;
        let q: f64 = [0.2, 0.8, 0.5]
            .iter()
            .zip(w)
            .map(|(y, w)| w * (y - mean).powi(2))
            .sum();
        let c = sw - w.iter().map(|w| w * w).sum::<f64>() / sw;
        assert!((estimate.q - q).abs() < 1e-9);
        assert!((estimate.expected_q - 2.0).abs() < 1e-9);
        assert!((estimate.tau2 - (q - 2.0) / c).abs() < 1e-9);
    }

    #[test]
    fn homogeneous_studies_give_zero_tau2() {
        let network = GraphBuilder::new()
            .from_comparisons(&[
                cmp("s1", "A", "B", 0.5, 0.2),
                cmp("s2", "A", "B", 0.5, 0.3),
            ])
            .unwrap();
        let solution =
            iterate_tau2(&network, 1e-8, 100, |w| consistency_fit(&network, w)).unwrap();
        assert_eq!(solution.tau2, 0.0);
        assert!(solution.converged);
        assert_eq!(solution.iterations, 1);
    }

    #[test]
    fn single_study_has_no_heterogeneity_information() {
        let network = GraphBuilder::new()
            .from_comparisons(&[cmp("s1", "A", "B", 0.5, 0.2)])
            .unwrap();
        let solution =
            iterate_tau2(&network, 1e-8, 100, |w| consistency_fit(&network, w)).unwrap();
        assert_eq!(solution.tau2, 0.0);
        assert!((solution.fit.fitted[0] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn iteration_settles_on_a_fixed_point() {
        let network = GraphBuilder::new()
            .from_comparisons(&[
                cmp("s1", "A", "B", 0.1, 0.1),
                cmp("s2", "A", "B", 0.9, 0.15),
                cmp("s3", "B", "C", 0.3, 0.1),
                cmp("s4", "B", "C", -0.4, 0.2),
                cmp("s5", "A", "C", 0.2, 0.1),
            ])
            .unwrap();
        let solution =
            iterate_tau2(&network, 1e-10, 200, |w| consistency_fit(&network, w)).unwrap();
        assert!(solution.converged);
        assert!(solution.tau2 > 0.0);

        let again = moment_estimate(
            &network.comparison_effects(),
            &solution.weights,
            &solution.fit,
            &network.sampling_covariance(),
            &network.heterogeneity_structure(),
        );
        assert!((again.tau2 - solution.tau2).abs() < 1e-8 * (1.0 + solution.tau2));
    }

    #[test]
    fn unrelated_fit_pools_pairs_only() {
        let network = GraphBuilder::new()
            .from_comparisons(&[
                cmp("s1", "A", "B", 0.2, 0.1),
                cmp("s2", "A", "B", 0.6, 0.1),
                cmp("s3", "B", "C", 1.0, 0.1),
            ])
            .unwrap();
        let weights = network.weights(0.0).unwrap();
        let fit = unrelated_fit(&network, &weights);
        assert!((fit.fitted[0] - 0.4).abs() < 1e-12);
        assert!((fit.fitted[2] - 1.0).abs() < 1e-12);
        assert!((fit.hat[(0, 1)] - 0.5).abs() < 1e-12);
        assert_eq!(fit.hat[(0, 2)], 0.0);
    }
}
