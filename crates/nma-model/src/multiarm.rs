//! Multi-arm studies: correlated comparisons → independent comparisons with
//! adjusted weights.
//!
//! The C(k,2) contrasts of a k-arm study share arms and are correlated. With
//! R the k×k matrix of pairwise variances (zero diagonal) and P = I − J/k,
//! the study's Laplacian pseudoinverse is `L⁺ = −½·P·R·P`. Inverting it back
//! gives a Laplacian whose off-diagonal entries are the negated adjusted
//! weights. Treating those weighted comparisons as independent reproduces the
//! study's exact contribution to the network normal equations.

use nalgebra::DMatrix;

use crate::linalg::pseudo_inverse;

/// Adjusted variances for the comparisons of one study.
///
/// `pairs` index the study's `k` treatments locally and must list every pair
/// exactly once when `k > 2`. `tau2` is added to every pairwise variance
/// before the reduction. Returns `None` when the variances of a multi-arm
/// study do not admit strictly positive, finite weights. A two-arm variance
/// passes through unchanged, even when it has underflowed to zero.
pub fn adjusted_variances(
    k: usize,
    pairs: &[(usize, usize)],
    variances: &[f64],
    tau2: f64,
) -> Option<Vec<f64>> {
    if k == 2 {
        return pairs
            .iter()
            .zip(variances)
            .map(|(_, &v)| {
                let adjusted = v + tau2;
                (adjusted.is_finite() && adjusted >= 0.0).then_some(adjusted)
            })
            .collect();
    }

    let mut r = DMatrix::zeros(k, k);
    for (&(i, j), &v) in pairs.iter().zip(variances) {
        r[(i, j)] = v + tau2;
        r[(j, i)] = v + tau2;
    }

    let p = DMatrix::identity(k, k) - DMatrix::from_element(k, k, 1.0 / k as f64);
    let lplus = (&p * r * &p) * -0.5;
    let l = pseudo_inverse(&lplus);

    pairs
        .iter()
        .map(|&(i, j)| {
            let weight = -l[(i, j)];
            (weight.is_finite() && weight > 0.0).then(|| 1.0 / weight)
        })
        .collect()
}

/// Sampling covariance between the comparisons of one study, from the
/// pairwise variances alone: `Cov(y_ab, y_cd) = ½(R_ad + R_bc − R_ac − R_bd)`.
pub fn within_study_covariance(
    k: usize,
    pairs: &[(usize, usize)],
    variances: &[f64],
) -> DMatrix<f64> {
    let mut r = DMatrix::zeros(k, k);
    for (&(i, j), &v) in pairs.iter().zip(variances) {
        r[(i, j)] = v;
        r[(j, i)] = v;
    }

    let m = pairs.len();
    DMatrix::from_fn(m, m, |x, y| {
        let (a, b) = pairs[x];
        let (c, d) = pairs[y];
        0.5 * (r[(a, d)] + r[(b, c)] - r[(a, c)] - r[(b, d)])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAIRS: [(usize, usize); 3] = [(0, 1), (0, 2), (1, 2)];

    #[test]
    fn two_arm_study_adds_tau2() {
        let adjusted = adjusted_variances(2, &[(0, 1)], &[0.04], 0.01).unwrap();
        assert!((adjusted[0] - 0.05).abs() < 1e-12);
    }

    #[test]
    fn arm_based_three_arm_weights() {
        // Arm variances 1, 2, 3 => pairwise variances 3, 4, 5.
        let adjusted = adjusted_variances(3, &PAIRS, &[3.0, 4.0, 5.0], 0.0).unwrap();
        // Weight of (i,j) is v_k / (v1 v2 + v1 v3 + v2 v3) = v_k / 11.
        let expected = [11.0 / 3.0, 11.0 / 2.0, 11.0 / 1.0];
        for (a, e) in adjusted.iter().zip(expected) {
            assert!((a - e).abs() < 1e-9, "{a} vs {e}");
        }
    }

    #[test]
    fn equal_variances_inflate_by_three_halves() {
        // Pairwise variance 2 means arm variance 1; each mesh weight is 1/3.
        let adjusted = adjusted_variances(3, &PAIRS, &[2.0, 2.0, 2.0], 0.0).unwrap();
        for a in adjusted {
            assert!((a - 3.0).abs() < 1e-9);
        }
    }

    #[test]
    fn impossible_variances_are_rejected() {
        // Implies a negative variance for arm 2.
        assert!(adjusted_variances(3, &PAIRS, &[10.0, 0.01, 0.01], 0.0).is_none());
    }

    #[test]
    fn covariance_shares_arm_variance() {
        let cov = within_study_covariance(3, &PAIRS, &[3.0, 4.0, 5.0]);
        // y01 and y02 share arm 0 (variance 1): Cov = +1.
        assert!((cov[(0, 1)] - 1.0).abs() < 1e-12);
        // y01 and y12 share arm 1 with opposite signs: Cov = -2.
        assert!((cov[(0, 2)] + 2.0).abs() < 1e-12);
        assert!((cov[(2, 2)] - 5.0).abs() < 1e-12);
    }
}
