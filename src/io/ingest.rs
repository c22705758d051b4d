//! CSV ingest and validation.
//!
//! Turns an assay table into a [`Dataset`] that is safe to fit.
//!
//! Design goals:
//! - **Strict schema** for the three required columns (clear errors + exit code 2)
//! - **Row-level validation** (skip bad rows, but report what happened)
//! - **Tolerant of R exports**: a leading unnamed row-name column is ignored,
//!   headers match case-insensitively, values may be quoted
//! - **No fitting logic here**

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use csv::StringRecord;
use log::{info, warn};

use crate::domain::{Dataset, Observation};
use crate::error::AppError;

const REQUIRED_COLUMNS: [&str; 3] = ["run", "conc", "density"];

/// A row-level error encountered during ingest.
#[derive(Debug, Clone, PartialEq)]
pub struct RowError {
    pub line: usize,
    pub message: String,
}

/// Ingest output: validated rows + what was skipped.
#[derive(Debug, Clone)]
pub struct IngestedData {
    pub dataset: Dataset,
    pub row_errors: Vec<RowError>,
    pub rows_read: usize,
    pub rows_used: usize,
}

/// Load an assay table from a CSV file.
pub fn load_dataset(path: &Path) -> Result<IngestedData, AppError> {
    let file = File::open(path)
        .map_err(|e| AppError::new(2, format!("Failed to open CSV '{}': {e}", path.display())))?;
    let ingest = read_dataset(file)?;
    info!(
        "loaded {} of {} rows from {}",
        ingest.rows_used,
        ingest.rows_read,
        path.display()
    );
    Ok(ingest)
}

/// Parse an assay table from any reader.
pub fn read_dataset<R: Read>(source: R) -> Result<IngestedData, AppError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(source);

    let headers = reader
        .headers()
        .map_err(|e| AppError::new(2, format!("Failed to read CSV headers: {e}")))?
        .clone();
    let columns = resolve_columns(&headers)?;

    let mut rows = Vec::new();
    let mut row_errors = Vec::new();
    let mut rows_read = 0usize;

    for (idx, result) in reader.records().enumerate() {
        // records() starts after the header line; lines are 1-based.
        let line = idx + 2;
        rows_read += 1;

        let parsed = result
            .map_err(|e| format!("CSV parse error: {e}"))
            .and_then(|record| parse_row(&record, &columns));
        match parsed {
            Ok(obs) => rows.push(obs),
            Err(message) => row_errors.push(RowError { line, message }),
        }
    }

    for err in &row_errors {
        warn!("skipped line {}: {}", err.line, err.message);
    }

    let rows_used = rows.len();
    if rows_used == 0 {
        return Err(AppError::new(2, "No valid rows in the CSV input."));
    }

    let dataset = Dataset::new(rows);
    let census = dataset.pairing();
    if !census.is_well_formed() {
        warn!(
            "expected duplicate readings per (run, conc): {} pairs, {} singles, {} larger groups",
            census.pairs, census.singles, census.oversized
        );
    }

    Ok(IngestedData {
        dataset,
        row_errors,
        rows_read,
        rows_used,
    })
}

/// Column positions of `run`, `conc`, `density`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Columns {
    run: usize,
    conc: usize,
    density: usize,
}

fn resolve_columns(headers: &StringRecord) -> Result<Columns, AppError> {
    let map: HashMap<String, usize> = headers
        .iter()
        .enumerate()
        .map(|(idx, name)| (normalize_header_name(name), idx))
        .collect();

    let missing: Vec<&str> = REQUIRED_COLUMNS
        .iter()
        .copied()
        .filter(|c| !map.contains_key(*c))
        .collect();
    if !missing.is_empty() {
        return Err(AppError::new(
            2,
            format!("CSV is missing required column(s): {}", missing.join(", ")),
        ));
    }

    Ok(Columns {
        run: map["run"],
        conc: map["conc"],
        density: map["density"],
    })
}

fn normalize_header_name(name: &str) -> String {
    // Spreadsheet tools sometimes prefix the first header with a UTF-8 BOM.
    name.trim()
        .trim_start_matches('\u{feff}')
        .trim_matches('"')
        .to_ascii_lowercase()
}

fn parse_row(record: &StringRecord, columns: &Columns) -> Result<Observation, String> {
    let field = |idx: usize, name: &str| -> Result<&str, String> {
        record
            .get(idx)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| format!("missing {name}"))
    };

    let run = field(columns.run, "Run")?;
    let conc = parse_number(field(columns.conc, "conc")?, "conc")?;
    let density = parse_number(field(columns.density, "density")?, "density")?;

    if conc < 0.0 {
        return Err(format!("negative concentration {conc}"));
    }

    Ok(Observation::new(run, conc, density))
}

fn parse_number(raw: &str, name: &str) -> Result<f64, String> {
    let value: f64 = raw
        .parse()
        .map_err(|_| format!("{name} '{raw}' is not a number"))?;
    if !value.is_finite() {
        return Err(format!("{name} '{raw}' is not finite"));
    }
    Ok(value)
}
