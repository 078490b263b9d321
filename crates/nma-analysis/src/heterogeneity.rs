//! Heterogeneity: tau², I², and the decomposition of Cochran's Q by design.
//!
//! Q is evaluated with fixed-effect weights over the study-level
//! comparisons. The design-by-treatment model fits each design on its own;
//! its residuals give Q within designs, and the distance between the design
//! fits and the consistency fit gives Q between designs. Both fits are
//! weighted least-squares projections with the same diagonal weights, so
//! the two parts add up to the total exactly.

use nma_model::fit::{consistency_fit, iterate_tau2};
use nma_model::stats::{chi_squared_sf, normal_quantile};
use nma_model::{DesignClassifier, EstimatorOptions, ModelError, Network};
use serde::Serialize;

/// A Q statistic with its chi-square reference distribution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QStatistic {
    pub q: f64,
    pub df: f64,
    /// `None` when `df <= 0`.
    pub p_value: Option<f64>,
}

impl QStatistic {
    pub fn new(q: f64, df: f64) -> Self {
        Self {
            q,
            df,
            p_value: chi_squared_sf(q, df),
        }
    }
}

/// Contribution of one design to Q within designs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DesignHeterogeneity {
    pub design: String,
    pub studies: usize,
    #[serde(flatten)]
    pub q: QStatistic,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeterogeneityReport {
    /// Method-of-moments tau² of the consistency model. Reported for every
    /// model kind, so it can be nonzero next to a fixed-effect fit.
    pub tau2: f64,
    pub tau: f64,
    /// I² in percent.
    pub i2: f64,
    /// Interval for I² (percent) from the H statistic; `None` when df is too
    /// small for the log-H standard error.
    pub i2_interval: Option<(f64, f64)>,
    pub h: f64,
    pub level: f64,
    pub q_total: QStatistic,
    pub q_within: QStatistic,
    pub q_between: QStatistic,
    pub designs: Vec<DesignHeterogeneity>,
    /// tau² of the design-by-treatment model.
    pub tau2_within: f64,
    /// Q between designs with weights from `tau2_within`.
    pub q_between_random: QStatistic,
}

pub struct HeterogeneityAnalyzer<'a> {
    network: &'a Network,
    options: EstimatorOptions,
    level: f64,
    tau2: Option<f64>,
}

impl<'a> HeterogeneityAnalyzer<'a> {
    pub fn new(network: &'a Network, options: EstimatorOptions) -> Self {
        Self {
            network,
            options,
            level: 0.95,
            tau2: None,
        }
    }

    pub fn with_level(mut self, level: f64) -> Self {
        self.level = level;
        self
    }

    /// Reuse a consistency-model tau² estimated elsewhere (a fitted
    /// random-effects model) instead of iterating again.
    pub fn with_tau2(mut self, tau2: f64) -> Self {
        self.tau2 = Some(tau2);
        self
    }

    pub fn analyze(&self) -> Result<HeterogeneityReport, ModelError> {
        let network = self.network;
        let designs = DesignClassifier::classify(network);
        let y = network.comparison_effects();

        let weights = network.weights(0.0)?;
        let consistent = consistency_fit(network, &weights);
        let within = designs.within_fit(network, &weights);

        let df_total = network
            .independent_comparisons()
            .saturating_sub(network.parameters()) as f64;
        let q_total = consistent.q(&y, &weights);

        let mut per_design = Vec::with_capacity(designs.len());
        let mut q_within = 0.0;
        let mut df_within = 0.0;
        for design in designs.iter() {
            let q: f64 = design
                .comparisons
                .iter()
                .map(|&r| weights[r] * (y[r] - within.fitted[r]).powi(2))
                .sum();
            let df = design.df() as f64;
            q_within += q;
            df_within += df;
            per_design.push(DesignHeterogeneity {
                design: design.label.clone(),
                studies: design.studies.len(),
                q: QStatistic::new(q, df),
            });
        }

        let q_between = between(&weights, &within.fitted, &consistent.fitted);
        let df_between = (df_total - df_within).max(0.0);

        let tau2 = match self.tau2 {
            Some(tau2) => tau2,
            None => {
                iterate_tau2(
                    network,
                    self.options.tau_tolerance,
                    self.options.max_iterations,
                    |w| consistency_fit(network, w),
                )?
                .tau2
            }
        };
        let tau_within = iterate_tau2(
            network,
            self.options.tau_tolerance,
            self.options.max_iterations,
            |w| designs.within_fit(network, w),
        )?;
        let q_between_random = between(
            &tau_within.weights,
            &tau_within.fit.fitted,
            &consistency_fit(network, &tau_within.weights).fitted,
        );

        let (h, i2_interval) = h_interval(q_total, df_total, self.level);

        tracing::debug!(
            q_total,
            q_within,
            q_between,
            tau2,
            "decomposed heterogeneity"
        );

        Ok(HeterogeneityReport {
            tau2,
            tau: tau2.sqrt(),
            i2: i_squared(q_total, df_total),
            i2_interval,
            h,
            level: self.level,
            q_total: QStatistic::new(q_total, df_total),
            q_within: QStatistic::new(q_within, df_within),
            q_between: QStatistic::new(q_between, df_between),
            designs: per_design,
            tau2_within: tau_within.tau2,
            q_between_random: QStatistic::new(q_between_random, df_between),
        })
    }
}

fn between(weights: &[f64], design_fit: &[f64], consistent_fit: &[f64]) -> f64 {
    weights
        .iter()
        .zip(design_fit.iter().zip(consistent_fit))
        .map(|(w, (d, c))| w * (d - c).powi(2))
        .sum()
}

/// I² = max(0, (Q − df) / Q) in percent.
pub fn i_squared(q: f64, df: f64) -> f64 {
    if q <= 0.0 {
        return 0.0;
    }
    ((q - df) / q).max(0.0) * 100.0
}

/// H = √(Q/df) and the I² interval derived from a log-scale interval for H.
fn h_interval(q: f64, df: f64, level: f64) -> (f64, Option<(f64, f64)>) {
    if df <= 0.0 {
        return (f64::NAN, None);
    }
    let h = (q / df).sqrt().max(1.0);

    let se_ln_h = if q > df + 1.0 {
        0.5 * (q.ln() - df.ln()) / ((2.0 * q).sqrt() - (2.0 * df - 1.0).sqrt())
    } else if df > 1.0 {
        (1.0 / (2.0 * (df - 1.0)) * (1.0 - 1.0 / (3.0 * (df - 1.0).powi(2)))).sqrt()
    } else {
        return (h, None);
    };

    let z = normal_quantile(0.5 + level / 2.0);
    let lower = (h.ln() - z * se_ln_h).exp().max(1.0);
    let upper = (h.ln() + z * se_ln_h).exp().max(1.0);
    let to_i2 = |h: f64| ((h * h - 1.0) / (h * h)).max(0.0) * 100.0;
    (h, Some((to_i2(lower), to_i2(upper))))
}
