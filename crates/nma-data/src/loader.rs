//! Input loading for the two fixed formats the toolkit accepts.
//!
//! * JSON documents deserializing into [`NetworkInput`] (arm-level studies or
//!   pre-aggregated comparisons).
//! * A headed CSV of comparisons with columns `study,treat1,treat2,te,se`.

use std::path::Path;

use eyre::{eyre, Result, WrapErr};

use crate::types::{Comparison, NetworkInput};

const CSV_COLUMNS: [&str; 5] = ["study", "treat1", "treat2", "te", "se"];

/// Load an input file, choosing the format from the extension.
pub fn load_input(path: &Path) -> Result<NetworkInput> {
    let content = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("failed to read {}", path.display()))?;

    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());

    match extension.as_deref() {
        Some("json") => parse_json(&content)
            .wrap_err_with(|| format!("failed to parse {}", path.display())),
        Some("csv") => {
            let comparisons = parse_comparisons_csv(&content)
                .wrap_err_with(|| format!("failed to parse {}", path.display()))?;
            Ok(NetworkInput::from_comparisons(comparisons))
        }
        _ => Err(eyre!(
            "unsupported input '{}'; expected a .json or .csv file",
            path.display()
        )),
    }
}

/// Parse a JSON input document.
pub fn parse_json(content: &str) -> Result<NetworkInput> {
    serde_json::from_str(content).wrap_err("invalid network input document")
}

/// Parse the comparison CSV format.
///
/// The header row is required and must name the five columns in order. Blank
/// lines and lines starting with `#` are skipped; any other malformed row is
/// an error carrying its line number.
pub fn parse_comparisons_csv(content: &str) -> Result<Vec<Comparison>> {
    let mut lines = content
        .lines()
        .enumerate()
        .map(|(idx, line)| (idx + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'));

    let (_, header) = lines.next().ok_or_else(|| eyre!("empty CSV input"))?;
    let columns: Vec<String> = header
        .split(',')
        .map(|col| col.trim().to_ascii_lowercase())
        .collect();
    if columns != CSV_COLUMNS {
        return Err(eyre!(
            "unexpected CSV header '{}'; expected '{}'",
            header,
            CSV_COLUMNS.join(",")
        ));
    }

    let mut comparisons = Vec::new();
    for (line_number, line) in lines {
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        if parts.len() != CSV_COLUMNS.len() {
            return Err(eyre!(
                "line {line_number}: expected {} fields, found {}",
                CSV_COLUMNS.len(),
                parts.len()
            ));
        }

        let te = parts[3]
            .parse::<f64>()
            .wrap_err_with(|| format!("line {line_number}: invalid te '{}'", parts[3]))?;
        let se = parts[4]
            .parse::<f64>()
            .wrap_err_with(|| format!("line {line_number}: invalid se '{}'", parts[4]))?;

        comparisons.push(Comparison {
            study: parts[0].to_string(),
            treat1: parts[1].to_string(),
            treat2: parts[2].to_string(),
            te,
            se,
        });
    }

    tracing::debug!(rows = comparisons.len(), "parsed comparison CSV");
    Ok(comparisons)
}
