//! Study designs: equivalence classes of studies by treatment set.

use std::collections::BTreeMap;

use nalgebra::DMatrix;
use serde::Serialize;

use crate::fit::LinearFit;
use crate::graph::Network;
use crate::linalg::solve_gls;

/// Studies sharing one treatment set.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Design {
    /// Sorted treatment ids joined with `:`.
    pub label: String,
    pub treatments: Vec<usize>,
    /// Indices into [`Network::studies`].
    pub studies: Vec<usize>,
    /// Indices into [`Network::comparisons`].
    pub comparisons: Vec<usize>,
}

impl Design {
    pub fn arms(&self) -> usize {
        self.treatments.len()
    }

    /// Degrees of freedom of the within-design Q: `(studies − 1)(arms − 1)`.
    pub fn df(&self) -> usize {
        self.studies.len().saturating_sub(1) * self.arms().saturating_sub(1)
    }
}

#[derive(Clone, Debug, Default)]
pub struct Designs {
    designs: Vec<Design>,
    design_of_study: Vec<Option<usize>>,
}

impl Designs {
    pub fn iter(&self) -> impl Iterator<Item = &Design> {
        self.designs.iter()
    }

    pub fn as_slice(&self) -> &[Design] {
        &self.designs
    }

    pub fn len(&self) -> usize {
        self.designs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.designs.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Design> {
        self.designs.get(index)
    }

    /// Design of a study; `None` for single-arm studies.
    pub fn design_of_study(&self, study: usize) -> Option<usize> {
        self.design_of_study.get(study).copied().flatten()
    }

    /// Design → study indices.
    pub fn studies_by_design(&self) -> BTreeMap<&str, &[usize]> {
        self.designs
            .iter()
            .map(|d| (d.label.as_str(), d.studies.as_slice()))
            .collect()
    }

    /// Design → comparison indices.
    pub fn comparisons_by_design(&self) -> BTreeMap<&str, &[usize]> {
        self.designs
            .iter()
            .map(|d| (d.label.as_str(), d.comparisons.as_slice()))
            .collect()
    }

    /// Design-by-treatment fit: a separate GLS solve per design.
    ///
    /// `weights` are per comparison. Fitted values of different designs are
    /// independent, so the hat matrix is block-diagonal over designs.
    pub fn within_fit(&self, network: &Network, weights: &[f64]) -> LinearFit {
        let m = network.comparisons().len();
        let mut fitted = vec![0.0; m];
        let mut hat = DMatrix::zeros(m, m);

        for design in &self.designs {
            let local = |t: usize| design.treatments.iter().position(|&x| x == t);
            let mut pairs = Vec::with_capacity(design.comparisons.len());
            for &r in &design.comparisons {
                let c = &network.comparisons()[r];
                if let (Some(i), Some(j)) = (local(c.treat1), local(c.treat2)) {
                    pairs.push((i, j));
                }
            }
            let y: Vec<f64> = design
                .comparisons
                .iter()
                .map(|&r| network.comparisons()[r].te)
                .collect();
            let w: Vec<f64> = design.comparisons.iter().map(|&r| weights[r]).collect();

            let solution = solve_gls(design.arms(), &pairs, &y, &w);
            let design_fit = solution.fitted(&pairs);
            let design_hat = solution.hat_matrix(&pairs, &w);
            for (a, &ra) in design.comparisons.iter().enumerate() {
                fitted[ra] = design_fit[a];
                for (b, &rb) in design.comparisons.iter().enumerate() {
                    hat[(ra, rb)] = design_hat[(a, b)];
                }
            }
        }

        LinearFit { fitted, hat }
    }
}

pub struct DesignClassifier;

impl DesignClassifier {
    /// Group the network's studies by treatment set. Studies without
    /// comparisons (single-arm) belong to no design.
    pub fn classify(network: &Network) -> Designs {
        let mut by_set: BTreeMap<String, Design> = BTreeMap::new();
        let mut keys = Vec::with_capacity(network.studies().len());

        for (s, study) in network.studies().iter().enumerate() {
            if study.comparisons.is_empty() {
                keys.push(None);
                continue;
            }
            let label = study
                .treatments
                .iter()
                .map(|&t| network.treatment_id(t))
                .collect::<Vec<_>>()
                .join(":");
            let design = by_set.entry(label.clone()).or_insert_with(|| Design {
                label: label.clone(),
                treatments: study.treatments.clone(),
                studies: Vec::new(),
                comparisons: Vec::new(),
            });
            design.studies.push(s);
            design.comparisons.extend(&study.comparisons);
            keys.push(Some(label));
        }

        let designs: Vec<Design> = by_set.into_values().collect();
        let design_of_study = keys
            .into_iter()
            .map(|key| key.and_then(|label| designs.iter().position(|d| d.label == label)))
            .collect();

        tracing::debug!(designs = designs.len(), "classified study designs");
        Designs {
            designs,
            design_of_study,
        }
    }
}
