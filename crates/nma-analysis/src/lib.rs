//! nma-analysis crate
//!
//! Diagnostics and rankings on top of a fitted network model: network
//! summary, heterogeneity and Q decomposition, net-splitting with the
//! global inconsistency test, and simulation-based rankings.

pub mod heterogeneity;
pub mod netsplit;
pub mod pipeline;
pub mod ranking;
pub mod summary;

pub use heterogeneity::{HeterogeneityAnalyzer, HeterogeneityReport, QStatistic};
pub use netsplit::{InconsistencyAnalyzer, InconsistencyReport, NetSplit, NetSplitOptions};
pub use pipeline::{analyze_network, build_network, run_analysis, AnalysisError, AnalysisOptions, AnalysisReport};
pub use ranking::{RankingDirection, RankingEngine, RankingError, RankingOptions, RankingReport};
pub use summary::NetworkSummary;
