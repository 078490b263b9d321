//! One-call analysis: build the network, fit the model, run every analyzer.

use std::sync::atomic::AtomicBool;

use nma_data::NetworkInput;
use nma_model::{
    ConsistencyEstimator, ConsistencyModel, EstimatorOptions, GraphBuilder, ModelError, ModelKind,
    ModelVariant, Network,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::heterogeneity::{HeterogeneityAnalyzer, HeterogeneityReport};
use crate::netsplit::{InconsistencyAnalyzer, InconsistencyReport, NetSplitOptions};
use crate::ranking::{RankingEngine, RankingError, RankingOptions, RankingReport};
use crate::summary::NetworkSummary;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AnalysisError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Ranking(#[from] RankingError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisOptions {
    pub model: ModelKind,
    /// Treat disconnected components as an error.
    pub strict: bool,
    pub estimator: EstimatorOptions,
    pub netsplit: NetSplitOptions,
    pub ranking: RankingOptions,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            model: ModelKind::Random,
            strict: false,
            estimator: EstimatorOptions::default(),
            netsplit: NetSplitOptions::default(),
            ranking: RankingOptions::default(),
        }
    }
}

/// Everything computed for one run.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub summary: NetworkSummary,
    pub model: ConsistencyModel,
    pub heterogeneity: HeterogeneityReport,
    pub inconsistency: InconsistencyReport,
    /// `None` when fewer than two treatments share the reference's component.
    pub ranking: Option<RankingReport>,
}

pub fn build_network(input: &NetworkInput, strict: bool) -> Result<Network, ModelError> {
    GraphBuilder::new().strict(strict).build(input)
}

pub fn run_analysis(
    input: &NetworkInput,
    options: &AnalysisOptions,
) -> Result<AnalysisReport, AnalysisError> {
    let network = build_network(input, options.strict)?;
    analyze_network(&network, options, &AtomicBool::new(false))
}

/// Run the full pipeline on a built network. `cancel` stops the ranking
/// simulation early.
pub fn analyze_network(
    network: &Network,
    options: &AnalysisOptions,
    cancel: &AtomicBool,
) -> Result<AnalysisReport, AnalysisError> {
    let summary = NetworkSummary::from_network(network);
    let model = ConsistencyEstimator::new(network, options.estimator.clone()).fit(options.model)?;
    let mut heterogeneity = HeterogeneityAnalyzer::new(network, options.estimator.clone());
    if let ModelVariant::Random { tau2, .. } = model.variant() {
        heterogeneity = heterogeneity.with_tau2(tau2);
    }
    let heterogeneity = heterogeneity.analyze()?;
    let inconsistency =
        InconsistencyAnalyzer::new(network, &model, options.netsplit.clone()).analyze()?;

    let ranking = if options.model == ModelKind::Ume {
        None
    } else {
        match RankingEngine::new(options.ranking.clone()).rank_with_cancel(&model, cancel) {
            Ok(report) => Some(report),
            Err(RankingError::TooFewTreatments { .. }) => None,
            Err(err) => return Err(err.into()),
        }
    };

    tracing::info!(
        treatments = network.treatments().len(),
        studies = network.studies().len(),
        model = options.model.name(),
        tau2 = model.tau2(),
        "analysis complete"
    );

    Ok(AnalysisReport {
        summary,
        model,
        heterogeneity,
        inconsistency,
        ranking,
    })
}
