mod output;

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use clap::{ArgAction, Args, Parser, Subcommand};
use color_eyre::eyre::{eyre, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use nma_analysis::{
    analyze_network, build_network, AnalysisOptions, InconsistencyAnalyzer, NetworkSummary,
    RankingDirection, RankingEngine,
};
use nma_data::loader::load_input;
use nma_model::{ConsistencyEstimator, ModelKind, Network};
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "nma")]
#[command(about = "Frequentist network meta-analysis")]
#[command(version)]
struct Cli {
    #[arg(long, short = 'v', action = ArgAction::Count, global = true)]
    verbose: u8,

    #[arg(long, short = 'q', global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Describe the evidence network: treatments, edges, designs, components.
    Summary(InputArgs),
    /// Fit the model and run every diagnostic.
    Analyze(ModelArgs),
    /// Split direct and indirect evidence for every comparison.
    Netsplit(NetsplitArgs),
    /// Rank treatments by simulation (SUCRA) and P-score.
    Rank(RankArgs),
    /// League table of all pairwise contrasts.
    League(ModelArgs),
}

#[derive(Args, Debug)]
struct InputArgs {
    /// Study data: .json (arms or comparisons) or .csv (study,treat1,treat2,te,se).
    input: PathBuf,

    /// JSON file with analysis options; flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Fail when the network has more than one connected component.
    #[arg(long)]
    strict: bool,

    /// Output format: table (default), json, or csv.
    #[arg(long, default_value = "table")]
    output: String,
}

#[derive(Args, Debug)]
struct ModelArgs {
    #[command(flatten)]
    input: InputArgs,

    /// fixed, random, or ume.
    #[arg(long)]
    model: Option<String>,

    /// Reference treatment id.
    #[arg(long)]
    reference: Option<String>,
}

#[derive(Args, Debug)]
struct NetsplitArgs {
    #[command(flatten)]
    model: ModelArgs,

    /// Significance level for flagging inconsistent comparisons.
    #[arg(long)]
    alpha: Option<f64>,
}

#[derive(Args, Debug)]
struct RankArgs {
    #[command(flatten)]
    model: ModelArgs,

    /// Number of simulation draws.
    #[arg(long)]
    draws: Option<usize>,

    /// Generator seed. Defaults to NMA_SEED, then the built-in seed.
    #[arg(long)]
    seed: Option<u64>,

    /// higher (larger effects are better) or lower.
    #[arg(long)]
    direction: Option<String>,
}

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet)?;

    match cli.command {
        Commands::Summary(args) => handle_summary(args),
        Commands::Analyze(args) => handle_analyze(args),
        Commands::Netsplit(args) => handle_netsplit(args),
        Commands::Rank(args) => handle_rank(args),
        Commands::League(args) => handle_league(args),
    }
}

fn init_tracing(verbose: u8, quiet: bool) -> Result<()> {
    let level = if quiet {
        Level::WARN
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.as_str()))
        .wrap_err("failed to initialize tracing filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn load_options(path: Option<&Path>) -> Result<AnalysisOptions> {
    let mut options = match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .wrap_err_with(|| format!("failed to read config {}", path.display()))?;
            serde_json::from_str(&content)
                .wrap_err_with(|| format!("invalid config {}", path.display()))?
        }
        None => AnalysisOptions::default(),
    };

    if let Ok(seed) = std::env::var("NMA_SEED") {
        options.ranking.seed = seed
            .trim()
            .parse()
            .wrap_err_with(|| format!("NMA_SEED must be an unsigned integer, got '{seed}'"))?;
    }
    Ok(options)
}

fn parse_model(value: &str) -> Result<ModelKind> {
    match value.to_lowercase().as_str() {
        "fixed" | "common" => Ok(ModelKind::Fixed),
        "random" => Ok(ModelKind::Random),
        "ume" => Ok(ModelKind::Ume),
        other => Err(eyre!(
            "unknown model '{}'; use 'fixed', 'random', or 'ume'",
            other
        )),
    }
}

fn parse_direction(value: &str) -> Result<RankingDirection> {
    match value.to_lowercase().as_str() {
        "higher" | "high" => Ok(RankingDirection::HigherIsBetter),
        "lower" | "low" => Ok(RankingDirection::LowerIsBetter),
        other => Err(eyre!("unknown direction '{}'; use 'higher' or 'lower'", other)),
    }
}

/// Options from the config file (if any) with model flags applied.
fn model_options(args: &ModelArgs) -> Result<AnalysisOptions> {
    let mut options = load_options(args.input.config.as_deref())?;
    options.strict |= args.input.strict;
    if let Some(model) = &args.model {
        options.model = parse_model(model)?;
    }
    if let Some(reference) = &args.reference {
        options.estimator.reference = Some(reference.clone());
    }
    Ok(options)
}

fn read_network(path: &Path, strict: bool) -> Result<Network> {
    let input = load_input(path)?;
    build_network(&input, strict)
        .wrap_err_with(|| format!("failed to build network from {}", path.display()))
}

fn spinner(message: &'static str) -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} {msg}")
            .wrap_err("failed to create progress style")?,
    );
    pb.set_message(message);
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    Ok(pb)
}

fn handle_summary(args: InputArgs) -> Result<()> {
    let options = load_options(args.config.as_deref())?;
    let format = OutputFormat::parse(&args.output)?;
    let network = read_network(&args.input, options.strict || args.strict)?;
    let summary = NetworkSummary::from_network(&network);

    output::print_summary(&summary, format)?;
    info!(
        treatments = summary.treatments.len(),
        studies = summary.studies,
        "summary command completed"
    );
    Ok(())
}

fn handle_analyze(args: ModelArgs) -> Result<()> {
    let options = model_options(&args)?;
    let format = OutputFormat::parse(&args.input.output)?;
    if format == OutputFormat::Csv {
        return Err(eyre!(
            "analyze produces a nested report; use 'table' or 'json'"
        ));
    }
    let network = read_network(&args.input.input, options.strict)?;

    let pb = spinner("fitting network model")?;
    let cancel = AtomicBool::new(false);
    let report = analyze_network(&network, &options, &cancel);
    pb.finish_and_clear();
    let report = report.wrap_err("analysis failed")?;

    output::print_analysis(&report, format)?;
    info!(
        model = options.model.name(),
        flagged = report.inconsistency.flagged().count(),
        "analyze command completed"
    );
    Ok(())
}

fn handle_netsplit(args: NetsplitArgs) -> Result<()> {
    let mut options = model_options(&args.model)?;
    if let Some(alpha) = args.alpha {
        if !(alpha > 0.0 && alpha < 1.0) {
            return Err(eyre!("--alpha must lie in (0, 1), got {}", alpha));
        }
        options.netsplit.alpha = alpha;
    }
    let format = OutputFormat::parse(&args.model.input.output)?;
    let network = read_network(&args.model.input.input, options.strict)?;

    let model = ConsistencyEstimator::new(&network, options.estimator.clone())
        .fit(options.model)
        .wrap_err("failed to fit network model")?;
    let report = InconsistencyAnalyzer::new(&network, &model, options.netsplit.clone())
        .analyze()
        .wrap_err("net-splitting failed")?;

    output::print_netsplit(&report, format)?;
    info!(
        splits = report.splits.len(),
        flagged = report.flagged().count(),
        "netsplit command completed"
    );
    Ok(())
}

fn handle_rank(args: RankArgs) -> Result<()> {
    let mut options = model_options(&args.model)?;
    if let Some(draws) = args.draws {
        options.ranking.draws = draws;
    }
    if let Some(seed) = args.seed {
        options.ranking.seed = seed;
    }
    if let Some(direction) = &args.direction {
        options.ranking.direction = parse_direction(direction)?;
    }
    let format = OutputFormat::parse(&args.model.input.output)?;
    let network = read_network(&args.model.input.input, options.strict)?;

    let model = ConsistencyEstimator::new(&network, options.estimator.clone())
        .fit(options.model)
        .wrap_err("failed to fit network model")?;

    let pb = ProgressBar::new(options.ranking.draws as u64);
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} draws")
            .wrap_err("failed to create progress style")?,
    );
    let cancel = AtomicBool::new(false);
    let report = RankingEngine::new(options.ranking.clone())
        .rank_with_progress(&model, &cancel, |draws| pb.inc(draws as u64));
    pb.finish_and_clear();
    let report = report.wrap_err("ranking failed")?;

    output::print_ranking(&report, format)?;
    info!(
        draws = report.draws_completed,
        seed = report.seed,
        "rank command completed"
    );
    Ok(())
}

fn handle_league(args: ModelArgs) -> Result<()> {
    let options = model_options(&args)?;
    let format = OutputFormat::parse(&args.input.output)?;
    let network = read_network(&args.input.input, options.strict)?;

    let model = ConsistencyEstimator::new(&network, options.estimator.clone())
        .fit(options.model)
        .wrap_err("failed to fit network model")?;

    output::print_league(&model, format)?;
    info!(
        model = options.model.name(),
        reference = %model.reference().id,
        "league command completed"
    );
    Ok(())
}
