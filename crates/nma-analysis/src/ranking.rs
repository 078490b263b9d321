//! Monte-Carlo treatment ranking (rank probabilities, SUCRA) and analytic
//! P-scores.
//!
//! Relative effects are drawn from the model's multivariate normal. Draws
//! are split into fixed-size chunks; chunk `c` runs on stream `c` of a
//! ChaCha20 generator seeded once, and every chunk accumulates integer
//! counts. The totals are therefore identical for any thread count.

use std::sync::atomic::{AtomicBool, Ordering};

use nalgebra::{Cholesky, DMatrix, DVector, SymmetricEigen};
use nma_model::stats::normal_cdf;
use nma_model::{ConsistencyModel, ModelKind};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::StandardNormal;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Draws per chunk (and per generator stream).
pub const CHUNK_SIZE: usize = 1024;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RankingError {
    #[error("{kind} models have no joint distribution of effects to rank")]
    UnrankableModel { kind: &'static str },

    #[error("ranking needs at least two connected treatments, found {found}")]
    TooFewTreatments { found: usize },

    #[error("number of draws must be positive")]
    NoDraws,

    #[error("ranking was cancelled before any draw completed")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankingDirection {
    /// Larger effects rank first.
    #[default]
    HigherIsBetter,
    /// Smaller effects rank first.
    LowerIsBetter,
}

impl RankingDirection {
    fn sign(&self) -> f64 {
        match self {
            RankingDirection::HigherIsBetter => 1.0,
            RankingDirection::LowerIsBetter => -1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingOptions {
    pub draws: usize,
    pub seed: u64,
    pub direction: RankingDirection,
}

impl Default for RankingOptions {
    fn default() -> Self {
        Self {
            draws: 10_000,
            seed: 20_240_601,
            direction: RankingDirection::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreatmentRanking {
    pub treatment: String,
    pub sucra: f64,
    pub p_score: f64,
    pub mean_rank: f64,
    /// `probabilities[r]`: probability of rank `r + 1`.
    pub probabilities: Vec<f64>,
    pub cumulative: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankingReport {
    pub direction: RankingDirection,
    pub seed: u64,
    pub draws_requested: usize,
    pub draws_completed: usize,
    pub complete: bool,
    /// In treatment order.
    pub treatments: Vec<TreatmentRanking>,
    /// Treatments outside the reference's component.
    pub excluded: Vec<String>,
}

impl RankingReport {
    /// Probability-of-rank matrix, one row per ranked treatment.
    pub fn probability_matrix(&self) -> Vec<Vec<f64>> {
        self.treatments
            .iter()
            .map(|t| t.probabilities.clone())
            .collect()
    }

    pub fn get(&self, treatment: &str) -> Option<&TreatmentRanking> {
        self.treatments.iter().find(|t| t.treatment == treatment)
    }
}

pub struct RankingEngine {
    options: RankingOptions,
}

impl RankingEngine {
    pub fn new(options: RankingOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &RankingOptions {
        &self.options
    }

    pub fn rank(&self, model: &ConsistencyModel) -> Result<RankingReport, RankingError> {
        self.rank_with_cancel(model, &AtomicBool::new(false))
    }

    /// Rank, checking `cancel` before every chunk.
    pub fn rank_with_cancel(
        &self,
        model: &ConsistencyModel,
        cancel: &AtomicBool,
    ) -> Result<RankingReport, RankingError> {
        self.rank_with_progress(model, cancel, |_| {})
    }

    /// Rank, checking `cancel` before every chunk and calling `progress`
    /// with the number of draws of each finished chunk.
    pub fn rank_with_progress<F>(
        &self,
        model: &ConsistencyModel,
        cancel: &AtomicBool,
        progress: F,
    ) -> Result<RankingReport, RankingError>
    where
        F: Fn(usize) + Sync,
    {
        if model.kind() == ModelKind::Ume {
            return Err(RankingError::UnrankableModel {
                kind: ModelKind::Ume.name(),
            });
        }
        let Some(covariance) = model.covariance() else {
            return Err(RankingError::UnrankableModel {
                kind: model.kind().name(),
            });
        };
        if self.options.draws == 0 {
            return Err(RankingError::NoDraws);
        }

        let ranked: Vec<usize> = model.reference_component().to_vec();
        let count = ranked.len();
        if count < 2 {
            return Err(RankingError::TooFewTreatments { found: count });
        }

        let reference = model.reference_index();
        let free: Vec<usize> = ranked.iter().copied().filter(|&t| t != reference).collect();
        let sign = self.options.direction.sign();
        let mean = DVector::from_iterator(
            free.len(),
            free.iter().map(|&t| {
                sign * model
                    .contrast_by_index(t, reference)
                    .map_or(0.0, |e| e.te)
            }),
        );
        let sub = DMatrix::from_fn(free.len(), free.len(), |i, j| {
            covariance[(free[i], free[j])]
        });
        let factor = covariance_factor(&sub);
        // Position of the reference within the ranked set.
        let reference_slot = ranked
            .iter()
            .position(|&t| t == reference)
            .unwrap_or_default();

        let chunks = self.options.draws.div_ceil(CHUNK_SIZE);
        let seed = self.options.seed;
        let draws = self.options.draws;

        let results: Vec<Option<(Vec<u64>, usize)>> = (0..chunks)
            .into_par_iter()
            .map(|chunk| {
                if cancel.load(Ordering::Relaxed) {
                    return None;
                }
                let size = CHUNK_SIZE.min(draws - chunk * CHUNK_SIZE);
                let counts = run_chunk(seed, chunk, size, &mean, &factor, reference_slot, count);
                progress(size);
                Some((counts, size))
            })
            .collect();

        let mut counts = vec![0u64; count * count];
        let mut completed = 0;
        for (chunk_counts, size) in results.into_iter().flatten() {
            for (total, c) in counts.iter_mut().zip(chunk_counts) {
                *total += c;
            }
            completed += size;
        }
        if completed == 0 {
            return Err(RankingError::Cancelled);
        }
        if completed < draws {
            tracing::warn!(completed, requested = draws, "ranking stopped early");
        }

        let p_scores = p_scores(model, &ranked, self.options.direction);
        let treatments = ranked
            .iter()
            .enumerate()
            .map(|(slot, &t)| {
                let probabilities: Vec<f64> = (0..count)
                    .map(|r| counts[slot * count + r] as f64 / completed as f64)
                    .collect();
                summarize(
                    model.treatments()[t].id.clone(),
                    probabilities,
                    p_scores[slot],
                )
            })
            .collect();

        let excluded = (0..model.treatments().len())
            .filter(|t| !ranked.contains(t))
            .map(|t| model.treatments()[t].id.clone())
            .collect();

        tracing::debug!(
            treatments = count,
            draws = completed,
            seed,
            "ranked treatments"
        );

        Ok(RankingReport {
            direction: self.options.direction,
            seed,
            draws_requested: draws,
            draws_completed: completed,
            complete: completed == draws,
            treatments,
            excluded,
        })
    }
}

/// A matrix `F` with `F·Fᵀ = Σ`: Cholesky when Σ is positive definite,
/// otherwise from the eigendecomposition with negative eigenvalues clamped.
fn covariance_factor(covariance: &DMatrix<f64>) -> DMatrix<f64> {
    if let Some(cholesky) = Cholesky::new(covariance.clone()) {
        return cholesky.l();
    }
    let eigen = SymmetricEigen::new(covariance.clone());
    let roots = eigen.eigenvalues.map(|lambda| lambda.max(0.0).sqrt());
    eigen.eigenvectors * DMatrix::from_diagonal(&roots)
}

/// Rank counts of one chunk, row-major `[slot][rank]`.
fn run_chunk(
    seed: u64,
    chunk: usize,
    size: usize,
    mean: &DVector<f64>,
    factor: &DMatrix<f64>,
    reference_slot: usize,
    count: usize,
) -> Vec<u64> {
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    rng.set_stream(chunk as u64);

    let mut counts = vec![0u64; count * count];
    let mut normals = DVector::zeros(mean.len());
    let mut values = vec![0.0; count];
    let mut order: Vec<usize> = (0..count).collect();

    for _ in 0..size {
        for z in normals.iter_mut() {
            *z = rng.sample(StandardNormal);
        }
        let draw = mean + factor * &normals;

        let mut free = draw.iter();
        for (slot, value) in values.iter_mut().enumerate() {
            *value = if slot == reference_slot {
                0.0
            } else {
                free.next().copied().unwrap_or_default()
            };
        }

        order.sort_unstable_by(|&a, &b| values[b].total_cmp(&values[a]).then(a.cmp(&b)));
        for (rank, &slot) in order.iter().enumerate() {
            counts[slot * count + rank] += 1;
        }
    }
    counts
}

/// P-score of each ranked treatment: mean over the others of
/// Φ(±(θ_i − θ_j) / se_ij).
fn p_scores(model: &ConsistencyModel, ranked: &[usize], direction: RankingDirection) -> Vec<f64> {
    let others = (ranked.len() - 1) as f64;
    ranked
        .iter()
        .map(|&i| {
            ranked
                .iter()
                .filter(|&&j| j != i)
                .map(|&j| match model.contrast_by_index(i, j) {
                    Some(e) if e.se > 0.0 => normal_cdf(direction.sign() * e.te / e.se),
                    Some(e) => {
                        let te = direction.sign() * e.te;
                        if te > 0.0 {
                            1.0
                        } else if te < 0.0 {
                            0.0
                        } else {
                            0.5
                        }
                    }
                    None => 0.5,
                })
                .sum::<f64>()
                / others
        })
        .collect()
}

fn summarize(treatment: String, probabilities: Vec<f64>, p_score: f64) -> TreatmentRanking {
    let count = probabilities.len();
    let sucra = probabilities
        .iter()
        .enumerate()
        .map(|(r, p)| (count - 1 - r) as f64 / (count - 1) as f64 * p)
        .sum();
    let mean_rank = probabilities
        .iter()
        .enumerate()
        .map(|(r, p)| (r + 1) as f64 * p)
        .sum();
    let cumulative = probabilities
        .iter()
        .scan(0.0, |acc, p| {
            *acc += p;
            Some(*acc)
        })
        .collect();

    TreatmentRanking {
        treatment,
        sucra,
        p_score,
        mean_rank,
        probabilities,
        cumulative,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nma_data::Comparison;
    use nma_model::{ConsistencyEstimator, EstimatorOptions, GraphBuilder, Network};

    fn cmp(study: &str, t1: &str, t2: &str, te: f64, se: f64) -> Comparison {
        Comparison {
            study: study.to_string(),
            treat1: t1.to_string(),
            treat2: t2.to_string(),
            te,
            se,
        }
    }

    fn network() -> Network {
        GraphBuilder::new()
            .from_comparisons(&[
                cmp("s1", "B", "A", 1.0, 0.1),
                cmp("s2", "C", "A", 0.5, 0.1),
                cmp("s3", "C", "B", -0.5, 0.1),
                cmp("s4", "X", "Y", 0.2, 0.1),
            ])
            .unwrap()
    }

    fn model(kind: ModelKind) -> ConsistencyModel {
        ConsistencyEstimator::new(&network(), EstimatorOptions::default())
            .fit(kind)
            .unwrap()
    }

    fn options(draws: usize) -> RankingOptions {
        RankingOptions {
            draws,
            ..RankingOptions::default()
        }
    }

    #[test]
    fn probabilities_are_normalised() {
        let report = RankingEngine::new(options(3000)).rank(&model(ModelKind::Fixed)).unwrap();
        assert_eq!(report.treatments.len(), 3);
        assert_eq!(report.excluded, vec!["X".to_string(), "Y".to_string()]);

        let matrix = report.probability_matrix();
        for row in &matrix {
            assert!((row.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        }
        for r in 0..3 {
            let column: f64 = matrix.iter().map(|row| row[r]).sum();
            assert!((column - 1.0).abs() < 1e-12);
        }
        for t in &report.treatments {
            assert!((0.0..=1.0).contains(&t.sucra));
            assert!((t.cumulative[2] - 1.0).abs() < 1e-12);
        }
        assert!(report.complete);
    }

    #[test]
    fn clear_ordering_is_recovered() {
        let report = RankingEngine::new(options(2000)).rank(&model(ModelKind::Fixed)).unwrap();
        let b = report.get("B").unwrap();
        let a = report.get("A").unwrap();
        assert!(b.sucra > 0.99);
        assert!(a.sucra < 0.01);
        assert!((report.get("C").unwrap().mean_rank - 2.0).abs() < 0.01);
        assert!(b.p_score > 0.99);

        let lower = RankingEngine::new(RankingOptions {
            direction: RankingDirection::LowerIsBetter,
            ..options(2000)
        })
        .rank(&model(ModelKind::Fixed))
        .unwrap();
        assert!(lower.get("A").unwrap().sucra > 0.99);
    }

    #[test]
    fn same_seed_is_reproducible() {
        let model = model(ModelKind::Random);
        let engine = RankingEngine::new(options(5000));
        let first = engine.rank(&model).unwrap();
        let second = engine.rank(&model).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn ume_cannot_be_ranked() {
        let result = RankingEngine::new(options(100)).rank(&model(ModelKind::Ume));
        assert!(matches!(result, Err(RankingError::UnrankableModel { .. })));
    }

    #[test]
    fn cancelled_run_reports_nothing() {
        let cancel = AtomicBool::new(true);
        let result = RankingEngine::new(options(100)).rank_with_cancel(&model(ModelKind::Fixed), &cancel);
        assert_eq!(result, Err(RankingError::Cancelled));
    }

    #[test]
    fn early_stop_reports_partial_draws() {
        let model = model(ModelKind::Fixed);
        let engine = RankingEngine::new(options(10 * CHUNK_SIZE));
        let cancel = AtomicBool::new(false);
        // One worker runs the chunks in order, so the stop lands after the first.
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(1)
            .build()
            .unwrap();
        let report = pool
            .install(|| {
                engine.rank_with_progress(&model, &cancel, |_| {
                    cancel.store(true, Ordering::Relaxed);
                })
            })
            .unwrap();

        assert_eq!(report.draws_requested, 10 * CHUNK_SIZE);
        assert_eq!(report.draws_completed, CHUNK_SIZE);
        assert!(!report.complete);
        for t in &report.treatments {
            assert!((t.probabilities.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        }
        assert!(report.get("B").unwrap().sucra > 0.99);
    }

    #[test]
    fn progress_counts_every_draw() {
        use std::sync::atomic::AtomicUsize;

        let seen = AtomicUsize::new(0);
        let report = RankingEngine::new(options(2500))
            .rank_with_progress(&model(ModelKind::Fixed), &AtomicBool::new(false), |n| {
                seen.fetch_add(n, Ordering::Relaxed);
            })
            .unwrap();
        assert_eq!(seen.load(Ordering::Relaxed), 2500);
        assert!(report.complete);
    }

    #[test]
    fn zero_draws_is_rejected() {
        let result = RankingEngine::new(options(0)).rank(&model(ModelKind::Fixed));
        assert_eq!(result, Err(RankingError::NoDraws));
    }

    #[test]
    fn semidefinite_covariance_uses_eigen_factor() {
        let sigma = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        let factor = covariance_factor(&sigma);
        let rebuilt = &factor * factor.transpose();
        assert!((rebuilt - sigma).abs().max() < 1e-10);
    }
}
