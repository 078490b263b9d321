//! Graph linear algebra: weighted Laplacians, their pseudoinverse and the
//! generalized least-squares solve on a treatment graph.
//!
//! Rows (comparisons or aggregated edges) are `(i, j)` vertex pairs with the
//! convention `y = θ_i - θ_j`, i.e. the signed incidence row has `+1` at `i`
//! and `-1` at `j`.

use nalgebra::{DMatrix, DVector, SymmetricEigen};

/// Eigenvalues below this fraction of the largest magnitude are treated as zero.
pub const RELATIVE_EIGEN_TOLERANCE: f64 = 1e-10;

/// Weighted Laplacian `Bᵀ·W·B` accumulated directly from the row pairs.
pub fn laplacian(n: usize, pairs: &[(usize, usize)], weights: &[f64]) -> DMatrix<f64> {
    let mut l = DMatrix::zeros(n, n);
    for (&(i, j), &w) in pairs.iter().zip(weights) {
        l[(i, i)] += w;
        l[(j, j)] += w;
        l[(i, j)] -= w;
        l[(j, i)] -= w;
    }
    l
}

/// Moore–Penrose pseudoinverse of a symmetric matrix via its eigendecomposition.
///
/// Never fails: the null space of a singular Laplacian is simply dropped.
pub fn pseudo_inverse(matrix: &DMatrix<f64>) -> DMatrix<f64> {
    let n = matrix.nrows();
    if n == 0 {
        return DMatrix::zeros(0, 0);
    }

    let eigen = SymmetricEigen::new(symmetrize(matrix));
    let largest = eigen
        .eigenvalues
        .iter()
        .fold(0.0_f64, |acc, value| acc.max(value.abs()));
    let cutoff = largest * RELATIVE_EIGEN_TOLERANCE;

    let mut result = DMatrix::zeros(n, n);
    for (k, &lambda) in eigen.eigenvalues.iter().enumerate() {
        if lambda.abs() <= cutoff {
            continue;
        }
        let v = eigen.eigenvectors.column(k);
        result += (v * v.transpose()) / lambda;
    }
    symmetrize(&result)
}

/// `(M + Mᵀ) / 2`.
pub fn symmetrize(matrix: &DMatrix<f64>) -> DMatrix<f64> {
    (matrix + matrix.transpose()) * 0.5
}

/// Smallest eigenvalue is at least `-tolerance · max(1, largest |eigenvalue|)`.
pub fn is_positive_semidefinite(matrix: &DMatrix<f64>, tolerance: f64) -> bool {
    if matrix.nrows() == 0 {
        return true;
    }
    let eigen = SymmetricEigen::new(symmetrize(matrix));
    let largest = eigen
        .eigenvalues
        .iter()
        .fold(1.0_f64, |acc, value| acc.max(value.abs()));
    eigen.eigenvalues.min() >= -tolerance * largest
}

/// Variance of `θ_i - θ_j` given `Cov(θ) = L⁺`.
pub fn contrast_variance(lplus: &DMatrix<f64>, i: usize, j: usize) -> f64 {
    lplus[(i, i)] + lplus[(j, j)] - 2.0 * lplus[(i, j)]
}

/// Result of one generalized least-squares solve.
#[derive(Clone, Debug)]
pub struct GlsSolution {
    /// Vertex potentials θ = L⁺·Bᵀ·W·y, centred within each component.
    pub potentials: DVector<f64>,
    /// Pseudoinverse of the weighted Laplacian; the covariance of `potentials`.
    pub lplus: DMatrix<f64>,
}

impl GlsSolution {
    /// Model-implied value `θ_i - θ_j` for each row pair.
    pub fn fitted(&self, pairs: &[(usize, usize)]) -> Vec<f64> {
        pairs
            .iter()
            .map(|&(i, j)| self.potentials[i] - self.potentials[j])
            .collect()
    }

    /// Hat matrix `H = B·L⁺·Bᵀ·W` over the given rows.
    pub fn hat_matrix(&self, pairs: &[(usize, usize)], weights: &[f64]) -> DMatrix<f64> {
        let m = pairs.len();
        let lp = &self.lplus;
        DMatrix::from_fn(m, m, |r, s| {
            let (a, b) = pairs[r];
            let (c, d) = pairs[s];
            let projected = lp[(a, c)] - lp[(a, d)] - lp[(b, c)] + lp[(b, d)];
            projected * weights[s]
        })
    }
}

/// Solve the weighted least-squares problem on a graph with `n` vertices.
///
/// The Laplacian may be singular (one zero eigenvalue per connected
/// component); the pseudoinverse absorbs it.
pub fn solve_gls(n: usize, pairs: &[(usize, usize)], y: &[f64], weights: &[f64]) -> GlsSolution {
    let lplus = pseudo_inverse(&laplacian(n, pairs, weights));

    let mut flow = DVector::zeros(n);
    for ((&(i, j), &value), &w) in pairs.iter().zip(y).zip(weights) {
        flow[i] += w * value;
        flow[j] -= w * value;
    }

    GlsSolution {
        potentials: &lplus * flow,
        lplus,
    }
}

/// Solve each connected component separately and scatter the results into
/// one block-diagonal solution over all `n` vertices.
///
/// Every row with positive weight must join two vertices of the same
/// component; rows with zero weight carry no evidence and are skipped.
pub fn solve_by_component(
    n: usize,
    components: &[Vec<usize>],
    pairs: &[(usize, usize)],
    y: &[f64],
    weights: &[f64],
) -> GlsSolution {
    let mut local = vec![usize::MAX; n];
    let mut owner = vec![usize::MAX; n];
    for (c, members) in components.iter().enumerate() {
        for (k, &vertex) in members.iter().enumerate() {
            local[vertex] = k;
            owner[vertex] = c;
        }
    }

    let mut rows: Vec<Vec<usize>> = vec![Vec::new(); components.len()];
    for (r, &(i, _)) in pairs.iter().enumerate() {
        if weights[r] > 0.0 {
            rows[owner[i]].push(r);
        }
    }

    let mut potentials = DVector::zeros(n);
    let mut lplus = DMatrix::zeros(n, n);
    for (c, members) in components.iter().enumerate() {
        let sub_pairs: Vec<(usize, usize)> = rows[c]
            .iter()
            .map(|&r| (local[pairs[r].0], local[pairs[r].1]))
            .collect();
        let sub_y: Vec<f64> = rows[c].iter().map(|&r| y[r]).collect();
        let sub_w: Vec<f64> = rows[c].iter().map(|&r| weights[r]).collect();

        let solution = solve_gls(members.len(), &sub_pairs, &sub_y, &sub_w);
        for (a, &va) in members.iter().enumerate() {
            potentials[va] = solution.potentials[a];
            for (b, &vb) in members.iter().enumerate() {
                lplus[(va, vb)] = solution.lplus[(a, b)];
            }
        }
    }

    GlsSolution { potentials, lplus }
}
