//! Per-report formatting: tables, JSON documents, and CSV.

use chrono::Utc;
use color_eyre::eyre::{eyre, Context, Result};
use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::Table;
use nma_analysis::heterogeneity::QStatistic;
use nma_analysis::netsplit::SkipReason;
use nma_analysis::{
    AnalysisReport, HeterogeneityReport, InconsistencyReport, NetworkSummary, RankingReport,
};
use nma_model::{ConsistencyModel, Estimate};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
    Csv,
}

impl OutputFormat {
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_lowercase().as_str() {
            "table" => Ok(OutputFormat::Table),
            "json" => Ok(OutputFormat::Json),
            "csv" => Ok(OutputFormat::Csv),
            _ => Err(eyre!(
                "unknown output format '{}'; use 'table', 'json', or 'csv'",
                value
            )),
        }
    }
}

const COLOR_RESET: &str = "\x1b[0m";

fn color_p_value(p: f64) -> &'static str {
    if p < 0.01 {
        "\x1b[31m" // Red
    } else if p < 0.05 {
        "\x1b[33m" // Yellow
    } else {
        "\x1b[32m" // Green
    }
}

fn new_table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(header);
    table
}

fn format_estimate(estimate: &Estimate) -> String {
    let (lo, hi) = estimate.confidence_interval(0.95);
    format!("{:.3} [{:.3}; {:.3}]", estimate.te, lo, hi)
}

fn format_p(p: Option<f64>) -> String {
    p.map_or_else(|| "-".to_string(), |p| format!("{p:.4}"))
}

fn format_q(label: &str, q: &QStatistic) -> Vec<String> {
    vec![
        label.to_string(),
        format!("{:.3}", q.q),
        format!("{:.2}", q.df),
        format_p(q.p_value),
    ]
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Pretty JSON with the command name and a generation timestamp.
fn print_json<T: Serialize>(command: &str, report: &T) -> Result<()> {
    #[derive(Serialize)]
    struct JsonOutput<'a, T> {
        command: &'a str,
        generated_at: String,
        report: &'a T,
    }

    let output = JsonOutput {
        command,
        generated_at: Utc::now().to_rfc3339(),
        report,
    };
    let json_str = serde_json::to_string_pretty(&output).wrap_err("failed to serialize JSON")?;
    println!("{}", json_str);
    Ok(())
}

pub fn print_summary(summary: &NetworkSummary, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json("summary", summary),
        OutputFormat::Csv => {
            println!("treat1,treat2,studies,te,se");
            for edge in &summary.edges {
                println!(
                    "{},{},{},{},{}",
                    csv_field(&edge.treat1),
                    csv_field(&edge.treat2),
                    edge.studies,
                    edge.te,
                    edge.se
                );
            }
            Ok(())
        }
        OutputFormat::Table => {
            let mut table = new_table(vec!["Metric", "Value"]);
            table.add_row(vec!["Treatments".to_string(), summary.treatments.len().to_string()]);
            table.add_row(vec!["Studies".to_string(), summary.studies.to_string()]);
            table.add_row(vec![
                "Multi-arm studies".to_string(),
                summary.multi_arm_studies.to_string(),
            ]);
            table.add_row(vec!["Comparisons".to_string(), summary.comparisons.to_string()]);
            table.add_row(vec!["Direct edges".to_string(), summary.edges.len().to_string()]);
            table.add_row(vec!["Designs".to_string(), summary.designs.len().to_string()]);
            table.add_row(vec![
                "Degrees of freedom".to_string(),
                summary.degrees_of_freedom.to_string(),
            ]);
            table.add_row(vec!["Components".to_string(), summary.components.len().to_string()]);
            println!("{}\n", table);

            let mut treatments = new_table(vec!["Treatment", "Label", "Studies", "Degree", "Component"]);
            for t in &summary.treatments {
                treatments.add_row(vec![
                    t.id.clone(),
                    t.label.clone(),
                    t.studies.to_string(),
                    t.degree.to_string(),
                    t.component.to_string(),
                ]);
            }
            println!("{}\n", treatments);

            let mut edges = new_table(vec!["Comparison", "Studies", "Pooled (fixed)", "SE"]);
            for e in &summary.edges {
                edges.add_row(vec![
                    format!("{} vs {}", e.treat1, e.treat2),
                    e.studies.to_string(),
                    format!("{:.3}", e.te),
                    format!("{:.3}", e.se),
                ]);
            }
            println!("{}\n", edges);

            for issue in &summary.disconnected {
                println!("warning: {issue}");
            }
            Ok(())
        }
    }
}

fn print_model_table(model: &ConsistencyModel) {
    println!(
        "Model: {} (tau² = {:.4}), reference: {}",
        model.kind().name(),
        model.tau2(),
        model.reference().display_label()
    );
    let mut table = new_table(vec!["Treatment", "vs", "Effect [95% CI]", "SE", "p"]);
    for effect in model.effects() {
        if effect.treatment == effect.anchor {
            continue;
        }
        let (estimate, se, p) = match &effect.estimate {
            Some(e) => (format_estimate(e), format!("{:.3}", e.se), format!("{:.4}", e.p_value())),
            None => ("-".to_string(), "-".to_string(), "-".to_string()),
        };
        table.add_row(vec![effect.treatment, effect.anchor, estimate, se, p]);
    }
    println!("{}\n", table);

    for warning in model.warnings() {
        println!("warning: {warning}");
    }
}

fn print_heterogeneity_table(report: &HeterogeneityReport) {
    println!(
        "Heterogeneity: tau² = {:.4}, tau = {:.4}, I² = {:.1}%{}",
        report.tau2,
        report.tau,
        report.i2,
        report
            .i2_interval
            .map(|(lo, hi)| format!(" [{lo:.1}%; {hi:.1}%]"))
            .unwrap_or_default()
    );
    let mut table = new_table(vec!["Source", "Q", "df", "p"]);
    table.add_row(format_q("Total", &report.q_total));
    table.add_row(format_q("Within designs", &report.q_within));
    table.add_row(format_q("Between designs", &report.q_between));
    table.add_row(format_q("Between designs (random)", &report.q_between_random));
    println!("{}\n", table);

    let mut designs = new_table(vec!["Design", "Studies", "Q", "df", "p"]);
    for d in report.designs.iter().filter(|d| d.q.df > 0.0) {
        designs.add_row(vec![
            d.design.clone(),
            d.studies.to_string(),
            format!("{:.3}", d.q.q),
            format!("{:.0}", d.q.df),
            format_p(d.q.p_value),
        ]);
    }
    println!("{}\n", designs);
}

fn print_netsplit_table(report: &InconsistencyReport) {
    let mut table = new_table(vec![
        "Comparison",
        "Direct",
        "Indirect",
        "Network",
        "Direct %",
        "z",
        "p",
    ]);
    for split in &report.splits {
        let color = color_p_value(split.p_value);
        table.add_row(vec![
            format!("{} vs {}", split.treat1, split.treat2),
            format_estimate(&split.direct),
            format_estimate(&split.indirect),
            format_estimate(&split.network),
            format!("{:.0}%", split.direct_proportion * 100.0),
            format!("{:.2}", split.z),
            format!("{}{:.4}{}", color, split.p_value, COLOR_RESET),
        ]);
    }
    println!("{}\n", table);

    for skip in &report.skipped {
        let reason = match skip.reason {
            SkipReason::Bridge => "no indirect evidence",
            SkipReason::Degenerate => "degenerate variance",
        };
        println!("skipped {} vs {}: {}", skip.treat1, skip.treat2, reason);
    }
    let global = &report.global.difference;
    println!(
        "Global inconsistency (consistency vs UME): Q = {:.3}, df = {:.2}, p = {}",
        global.q,
        global.df,
        format_p(global.p_value)
    );
    println!(
        "Flagged at alpha = {}: {}\n",
        report.alpha,
        report.flagged().count()
    );
}

fn print_ranking_table(report: &RankingReport) {
    let mut table = new_table(vec!["Treatment", "SUCRA", "P-score", "Mean rank", "P(best)"]);
    let mut rows: Vec<_> = report.treatments.iter().collect();
    rows.sort_by(|a, b| b.sucra.total_cmp(&a.sucra));
    for t in rows {
        table.add_row(vec![
            t.treatment.clone(),
            format!("{:.3}", t.sucra),
            format!("{:.3}", t.p_score),
            format!("{:.2}", t.mean_rank),
            format!("{:.3}", t.probabilities.first().copied().unwrap_or_default()),
        ]);
    }
    println!("{}\n", table);
    println!(
        "Draws: {}/{} (seed {}){}",
        report.draws_completed,
        report.draws_requested,
        report.seed,
        if report.complete { "" } else { " - stopped early" }
    );
    if !report.excluded.is_empty() {
        println!("Not ranked (disconnected): {}", report.excluded.join(", "));
    }
}

pub fn print_analysis(report: &AnalysisReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json("analyze", report),
        OutputFormat::Csv => Err(eyre!("csv output is not available for this command")),
        OutputFormat::Table => {
            print_model_table(&report.model);
            print_heterogeneity_table(&report.heterogeneity);
            print_netsplit_table(&report.inconsistency);
            if let Some(ranking) = &report.ranking {
                print_ranking_table(ranking);
            }
            Ok(())
        }
    }
}

pub fn print_netsplit(report: &InconsistencyReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json("netsplit", report),
        OutputFormat::Csv => {
            println!("treat1,treat2,studies,direct,direct_se,indirect,indirect_se,network,network_se,direct_proportion,z,p_value,flagged");
            for s in &report.splits {
                println!(
                    "{},{},{},{},{},{},{},{},{},{},{},{},{}",
                    csv_field(&s.treat1),
                    csv_field(&s.treat2),
                    s.studies,
                    s.direct.te,
                    s.direct.se,
                    s.indirect.te,
                    s.indirect.se,
                    s.network.te,
                    s.network.se,
                    s.direct_proportion,
                    s.z,
                    s.p_value,
                    s.flagged
                );
            }
            Ok(())
        }
        OutputFormat::Table => {
            print_netsplit_table(report);
            Ok(())
        }
    }
}

pub fn print_ranking(report: &RankingReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json("rank", report),
        OutputFormat::Csv => {
            let ranks = (1..=report.treatments.len())
                .map(|r| format!("p_rank_{r}"))
                .collect::<Vec<_>>()
                .join(",");
            println!("treatment,sucra,p_score,mean_rank,{ranks}");
            for t in &report.treatments {
                let probabilities = t
                    .probabilities
                    .iter()
                    .map(|p| p.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                println!(
                    "{},{},{},{},{}",
                    csv_field(&t.treatment),
                    t.sucra,
                    t.p_score,
                    t.mean_rank,
                    probabilities
                );
            }
            Ok(())
        }
        OutputFormat::Table => {
            print_ranking_table(report);
            Ok(())
        }
    }
}

pub fn print_league(model: &ConsistencyModel, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json("league", &model.all_contrasts()),
        OutputFormat::Csv => {
            println!("treat1,treat2,te,se,lower,upper,direct");
            for c in model.all_contrasts() {
                let (lo, hi) = c.estimate.confidence_interval(0.95);
                println!(
                    "{},{},{},{},{},{},{}",
                    csv_field(&c.treat1),
                    csv_field(&c.treat2),
                    c.estimate.te,
                    c.estimate.se,
                    lo,
                    hi,
                    c.direct
                );
            }
            Ok(())
        }
        OutputFormat::Table => {
            // Cell (row i, column j): effect of treatment i relative to j.
            let ids: Vec<&str> = model.treatments().iter().map(|t| t.id.as_str()).collect();
            let mut header = vec![""];
            header.extend(ids.iter().copied());
            let mut table = new_table(header);
            for (i, row_id) in ids.iter().enumerate() {
                let mut row = vec![row_id.to_string()];
                for j in 0..ids.len() {
                    row.push(if i == j {
                        row_id.to_string()
                    } else {
                        model
                            .contrast_by_index(i, j)
                            .map_or_else(|| "-".to_string(), |e| format_estimate(&e))
                    });
                }
                table.add_row(row);
            }
            println!(
                "League table ({} model, tau² = {:.4}): row vs column\n",
                model.kind().name(),
                model.tau2()
            );
            println!("{}\n", table);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_formats() {
        assert_eq!(OutputFormat::parse("JSON").unwrap(), OutputFormat::Json);
        assert!(OutputFormat::parse("xml").is_err());
    }

    #[test]
    fn quotes_csv_fields() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}
