//! Type definitions for network meta-analysis input records.

use serde::{Deserialize, Serialize};

/// A treatment (vertex of the evidence network).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Treatment {
    /// Stable identifier. Treatment order (and every tie-break) follows this id.
    pub id: String,
    /// Display label. Falls back to the id when absent in the input.
    #[serde(default)]
    pub label: String,
}

impl Treatment {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            label: id.clone(),
            id,
        }
    }

    pub fn with_label(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }

    /// Label to show in reports.
    pub fn display_label(&self) -> &str {
        if self.label.is_empty() {
            &self.id
        } else {
            &self.label
        }
    }
}

/// Dispersion reported for one arm.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dispersion {
    /// Standard deviation of the outcome within the arm.
    Sd(f64),
    /// Standard error of the arm mean.
    Se(f64),
}

impl Dispersion {
    pub fn value(&self) -> f64 {
        match self {
            Dispersion::Sd(v) | Dispersion::Se(v) => *v,
        }
    }

    /// Variance of the arm mean for `n` participants.
    pub fn variance_of_mean(&self, n: u32) -> f64 {
        match self {
            Dispersion::Sd(sd) => sd * sd / f64::from(n),
            Dispersion::Se(se) => se * se,
        }
    }

    /// Standard deviation of the outcome for `n` participants.
    pub fn standard_deviation(&self, n: u32) -> f64 {
        match self {
            Dispersion::Sd(sd) => *sd,
            Dispersion::Se(se) => se * f64::from(n).sqrt(),
        }
    }
}

/// One arm of a study.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Arm {
    /// Treatment id given in this arm.
    pub treatment: String,
    /// Number of participants.
    pub n: u32,
    /// Arm mean (or arm-level effect estimate).
    pub mean: f64,
    /// Standard deviation or standard error.
    pub dispersion: Dispersion,
}

/// A study with its arms, in reported order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Study {
    /// Study label.
    pub id: String,
    pub arms: Vec<Arm>,
}

/// A pre-aggregated pairwise contrast reported by one study.
///
/// `te` is the effect of `treat1` relative to `treat2`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    /// Study label. Several comparisons with the same label form a multi-arm study.
    pub study: String,
    pub treat1: String,
    pub treat2: String,
    pub te: f64,
    pub se: f64,
}

/// Effect measure used to turn arm-level data into pairwise contrasts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Measure {
    /// Raw mean difference.
    #[default]
    #[serde(alias = "md")]
    MeanDifference,
    /// Hedges' g.
    #[serde(alias = "smd")]
    StandardizedMeanDifference,
}

impl Measure {
    pub fn short_name(&self) -> &'static str {
        match self {
            Measure::MeanDifference => "MD",
            Measure::StandardizedMeanDifference => "SMD",
        }
    }
}

/// Evidence supplied to one analysis run: arm-level studies or pre-aggregated contrasts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Evidence {
    Arms {
        #[serde(default)]
        measure: Measure,
        studies: Vec<Study>,
    },
    Contrasts { comparisons: Vec<Comparison> },
}

/// A complete input document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetworkInput {
    /// Optional treatment labels. Treatments that appear only in the evidence get `label = id`.
    #[serde(default)]
    pub treatments: Vec<Treatment>,
    #[serde(flatten)]
    pub evidence: Evidence,
}

impl NetworkInput {
    pub fn from_studies(measure: Measure, studies: Vec<Study>) -> Self {
        Self {
            treatments: Vec::new(),
            evidence: Evidence::Arms { measure, studies },
        }
    }

    pub fn from_comparisons(comparisons: Vec<Comparison>) -> Self {
        Self {
            treatments: Vec::new(),
            evidence: Evidence::Contrasts { comparisons },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispersion_variance_of_mean() {
        assert!((Dispersion::Sd(2.0).variance_of_mean(4) - 1.0).abs() < 1e-12);
        assert!((Dispersion::Se(0.5).variance_of_mean(100) - 0.25).abs() < 1e-12);
        assert!((Dispersion::Se(0.5).standard_deviation(16) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn treatment_label_falls_back_to_id() {
        let t: Treatment = serde_json::from_str(r#"{"id":"placebo"}"#).unwrap();
        assert_eq!(t.display_label(), "placebo");
        assert_eq!(Treatment::with_label("a", "Aspirin").display_label(), "Aspirin");
    }

    #[test]
    fn input_parses_both_evidence_shapes() {
        let arms = r#"{
            "measure": "smd",
            "studies": [{"id": "s1", "arms": [
                {"treatment": "A", "n": 10, "mean": 1.0, "dispersion": {"sd": 1.0}},
                {"treatment": "B", "n": 12, "mean": 2.0, "dispersion": {"se": 0.3}}
            ]}]
        }"#;
        let input: NetworkInput = serde_json::from_str(arms).unwrap();
        match input.evidence {
            Evidence::Arms { measure, studies } => {
                assert_eq!(measure, Measure::StandardizedMeanDifference);
                assert_eq!(studies[0].arms[1].dispersion, Dispersion::Se(0.3));
            }
            Evidence::Contrasts { .. } => panic!("expected arm-level evidence"),
        }

        let contrasts = r#"{"comparisons": [
            {"study": "s1", "treat1": "A", "treat2": "B", "te": 0.5, "se": 0.2}
        ]}"#;
        let input: NetworkInput = serde_json::from_str(contrasts).unwrap();
        assert!(matches!(input.evidence, Evidence::Contrasts { ref comparisons } if comparisons.len() == 1));
    }
}
