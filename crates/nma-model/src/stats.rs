//! Distribution helpers over `statrs`.

use statrs::distribution::{ChiSquared, ContinuousCDF, Normal};

fn standard_normal() -> Option<Normal> {
    Normal::new(0.0, 1.0).ok()
}

/// Φ(x).
pub fn normal_cdf(x: f64) -> f64 {
    standard_normal().map_or(f64::NAN, |n| n.cdf(x))
}

/// Two-sided p-value of a standard normal z statistic.
pub fn two_sided_p(z: f64) -> f64 {
    if !z.is_finite() {
        return if z.is_nan() { f64::NAN } else { 0.0 };
    }
    standard_normal().map_or(f64::NAN, |n| (2.0 * n.sf(z.abs())).min(1.0))
}

/// Φ⁻¹(p).
pub fn normal_quantile(p: f64) -> f64 {
    standard_normal().map_or(f64::NAN, |n| n.inverse_cdf(p))
}

/// Upper tail of a chi-square distribution. `None` when `df <= 0`.
pub fn chi_squared_sf(q: f64, df: f64) -> Option<f64> {
    if df <= 0.0 || !q.is_finite() {
        return None;
    }
    ChiSquared::new(df).ok().map(|dist| dist.sf(q.max(0.0)))
}
