//! Arm-level data → study-level pairwise contrasts.
//!
//! A study with k arms yields all C(k,2) contrasts in arm order: arm i vs arm j
//! for i < j, with `te = effect(arm i) - effect(arm j)`.

use std::collections::HashSet;

use crate::error::InputError;
use crate::types::{Arm, Comparison, Measure, Study};

/// Validate a study's arms without computing contrasts.
pub fn validate_study(study: &Study, measure: Measure) -> Result<(), InputError> {
    if study.arms.is_empty() {
        return Err(InputError::NoArms {
            study: study.id.clone(),
        });
    }

    let mut seen = HashSet::new();
    for arm in &study.arms {
        if !seen.insert(arm.treatment.as_str()) {
            return Err(InputError::DuplicateArm {
                study: study.id.clone(),
                treatment: arm.treatment.clone(),
            });
        }
        validate_arm(&study.id, arm, measure)?;
    }
    Ok(())
}

fn validate_arm(study: &str, arm: &Arm, measure: Measure) -> Result<(), InputError> {
    let invalid = |field: &'static str, reason: String| InputError::InvalidArm {
        study: study.to_string(),
        treatment: arm.treatment.clone(),
        field,
        reason,
    };

    if arm.n == 0 {
        return Err(invalid("sample size", "must be at least 1".to_string()));
    }
    if measure == Measure::StandardizedMeanDifference && arm.n < 2 {
        return Err(invalid(
            "sample size",
            "SMD needs at least 2 participants per arm".to_string(),
        ));
    }
    if !arm.mean.is_finite() {
        return Err(invalid("mean", format!("{} is not finite", arm.mean)));
    }
    let dispersion = arm.dispersion.value();
    if !dispersion.is_finite() || dispersion <= 0.0 {
        return Err(invalid(
            "dispersion",
            format!("{dispersion} must be positive and finite"),
        ));
    }
    Ok(())
}

/// All pairwise contrasts of one study.
///
/// Single-arm studies return an empty list; their treatment still enters the network.
pub fn study_contrasts(study: &Study, measure: Measure) -> Result<Vec<Comparison>, InputError> {
    validate_study(study, measure)?;

    let k = study.arms.len();
    let mut contrasts = Vec::with_capacity(k * k.saturating_sub(1) / 2);
    for i in 0..k {
        for j in (i + 1)..k {
            let (te, variance) = contrast(&study.arms[i], &study.arms[j], measure);
            let comparison = Comparison {
                study: study.id.clone(),
                treat1: study.arms[i].treatment.clone(),
                treat2: study.arms[j].treatment.clone(),
                te,
                se: variance.sqrt(),
            };
            validate_comparison(&comparison)?;
            contrasts.push(comparison);
        }
    }
    Ok(contrasts)
}

/// Contrasts for a set of studies, rejecting duplicate study labels.
pub fn studies_to_comparisons(
    studies: &[Study],
    measure: Measure,
) -> Result<Vec<Comparison>, InputError> {
    if studies.is_empty() {
        return Err(InputError::Empty);
    }

    let mut ids = HashSet::new();
    let mut comparisons = Vec::new();
    for study in studies {
        if !ids.insert(study.id.as_str()) {
            return Err(InputError::DuplicateStudy {
                study: study.id.clone(),
            });
        }
        comparisons.extend(study_contrasts(study, measure)?);
    }

    tracing::debug!(
        studies = studies.len(),
        comparisons = comparisons.len(),
        measure = measure.short_name(),
        "computed study contrasts"
    );
    Ok(comparisons)
}

/// Field-level checks on one pre-aggregated comparison.
pub fn validate_comparison(comparison: &Comparison) -> Result<(), InputError> {
    if comparison.treat1 == comparison.treat2 {
        return Err(InputError::SelfComparison {
            study: comparison.study.clone(),
            treatment: comparison.treat1.clone(),
        });
    }
    if !comparison.te.is_finite() {
        return Err(InputError::NonFiniteEffect {
            study: comparison.study.clone(),
            treat1: comparison.treat1.clone(),
            treat2: comparison.treat2.clone(),
        });
    }
    if !comparison.se.is_finite() || comparison.se <= 0.0 {
        return Err(InputError::NonPositiveVariance {
            study: comparison.study.clone(),
            treat1: comparison.treat1.clone(),
            treat2: comparison.treat2.clone(),
            se: comparison.se,
        });
    }
    Ok(())
}

/// Effect and variance of `a` relative to `b`.
fn contrast(a: &Arm, b: &Arm, measure: Measure) -> (f64, f64) {
    match measure {
        Measure::MeanDifference => (
            a.mean - b.mean,
            a.dispersion.variance_of_mean(a.n) + b.dispersion.variance_of_mean(b.n),
        ),
        Measure::StandardizedMeanDifference => hedges_g(a, b),
    }
}

/// Hedges' g with the small-sample correction J = 1 - 3 / (4·df - 1).
fn hedges_g(a: &Arm, b: &Arm) -> (f64, f64) {
    let n1 = f64::from(a.n);
    let n2 = f64::from(b.n);
    let sd1 = a.dispersion.standard_deviation(a.n);
    let sd2 = b.dispersion.standard_deviation(b.n);

    let df = n1 + n2 - 2.0;
    let pooled_sd = (((n1 - 1.0) * sd1 * sd1 + (n2 - 1.0) * sd2 * sd2) / df).sqrt();
    let d = (a.mean - b.mean) / pooled_sd;
    let j = 1.0 - 3.0 / (4.0 * df - 1.0);
    let g = j * d;
    let variance = (n1 + n2) / (n1 * n2) + g * g / (2.0 * (n1 + n2));
    (g, variance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Dispersion;

    fn arm(treatment: &str, n: u32, mean: f64, sd: f64) -> Arm {
        Arm {
            treatment: treatment.to_string(),
            n,
            mean,
            dispersion: Dispersion::Sd(sd),
        }
    }

    fn study(id: &str, arms: Vec<Arm>) -> Study {
        Study {
            id: id.to_string(),
            arms,
        }
    }

    #[test]
    fn two_arm_mean_difference() {
        let s = study("s1", vec![arm("A", 25, 3.0, 2.0), arm("B", 100, 1.0, 4.0)]);
        let contrasts = study_contrasts(&s, Measure::MeanDifference).unwrap();

        assert_eq!(contrasts.len(), 1);
        assert_eq!(contrasts[0].treat1, "A");
        assert_eq!(contrasts[0].treat2, "B");
        assert!((contrasts[0].te - 2.0).abs() < 1e-12);
        // 4/25 + 16/100 = 0.32
        assert!((contrasts[0].se - 0.32f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn three_arm_study_yields_three_contrasts() {
        let s = study(
            "s1",
            vec![
                arm("A", 10, 1.0, 1.0),
                arm("B", 10, 2.0, 1.0),
                arm("C", 10, 4.0, 1.0),
            ],
        );
        let contrasts = study_contrasts(&s, Measure::MeanDifference).unwrap();
        let pairs: Vec<(&str, &str, f64)> = contrasts
            .iter()
            .map(|c| (c.treat1.as_str(), c.treat2.as_str(), c.te))
            .collect();
        assert_eq!(pairs, vec![("A", "B", -1.0), ("A", "C", -3.0), ("B", "C", -2.0)]);
    }

    #[test]
    fn hedges_g_matches_hand_computation() {
        let s = study("s1", vec![arm("A", 20, 12.0, 4.0), arm("B", 20, 10.0, 4.0)]);
        let c = &study_contrasts(&s, Measure::StandardizedMeanDifference).unwrap()[0];

        // d = 0.5, J = 1 - 3/151
        let g = 0.5 * (1.0 - 3.0 / 151.0);
        assert!((c.te - g).abs() < 1e-12);
        let var = 40.0 / 400.0 + g * g / 80.0;
        assert!((c.se - var.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn single_arm_study_has_no_contrasts() {
        let s = study("s1", vec![arm("A", 10, 1.0, 1.0)]);
        assert!(study_contrasts(&s, Measure::MeanDifference).unwrap().is_empty());
    }

    #[test]
    fn rejects_duplicate_arm() {
        let s = study("s1", vec![arm("A", 10, 1.0, 1.0), arm("A", 12, 2.0, 1.0)]);
        assert!(matches!(
            study_contrasts(&s, Measure::MeanDifference),
            Err(InputError::DuplicateArm { .. })
        ));
    }

    #[test]
    fn rejects_non_positive_dispersion_and_zero_n() {
        let s = study("s1", vec![arm("A", 10, 1.0, 0.0), arm("B", 10, 2.0, 1.0)]);
        assert!(matches!(
            study_contrasts(&s, Measure::MeanDifference),
            Err(InputError::InvalidArm { field: "dispersion", .. })
        ));

        let s = study("s1", vec![arm("A", 0, 1.0, 1.0), arm("B", 10, 2.0, 1.0)]);
        assert!(matches!(
            study_contrasts(&s, Measure::MeanDifference),
            Err(InputError::InvalidArm { field: "sample size", .. })
        ));
    }

    #[test]
    fn rejects_duplicate_study_and_empty_input() {
        let s = study("s1", vec![arm("A", 10, 1.0, 1.0), arm("B", 10, 2.0, 1.0)]);
        assert!(matches!(
            studies_to_comparisons(&[s.clone(), s], Measure::MeanDifference),
            Err(InputError::DuplicateStudy { .. })
        ));
        assert_eq!(
            studies_to_comparisons(&[], Measure::MeanDifference),
            Err(InputError::Empty)
        );
    }

    #[test]
    fn comparison_validation() {
        let mut c = Comparison {
            study: "s".into(),
            treat1: "A".into(),
            treat2: "B".into(),
            te: 0.1,
            se: 0.0,
        };
        assert!(matches!(
            validate_comparison(&c),
            Err(InputError::NonPositiveVariance { .. })
        ));
        c.se = 0.1;
        c.treat2 = "A".into();
        assert!(matches!(
            validate_comparison(&c),
            Err(InputError::SelfComparison { .. })
        ));
    }
}
