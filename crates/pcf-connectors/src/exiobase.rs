//! Exiobase connector: a ZIP archive whose tab-separated F matrix carries
//! stressor rows (CO2/CH4/N2O, combustion and process) against
//! REGION_PRODUCT columns.

use std::collections::BTreeMap;
use std::io::{Cursor, Read};

use pcf_core::{EmissionFactorDraft, Unit, GWP_CH4, GWP_N2O};
use tracing::debug;

use crate::{
    ConnectorError, RawPayload, RawRow, RowError, SourceConnector, TransformOutcome,
};

/// Accepted locations of the F matrix inside the archive.
pub const F_MATRIX_PATHS: &[&str] = &["satellite/F.txt", "satellite_F.txt", "F.txt"];

const F_CONTAINER: &str = "satellite/F.txt";

#[derive(Debug, Clone, Copy, Default)]
pub struct ExiobaseConnector;

/// GWP weight for a stressor row; rows that are not greenhouse-gas stressors
/// carry no weight and are ignored.
fn stressor_weight(name: &str) -> Option<f64> {
    let lower = name.to_ascii_lowercase();
    if lower.contains("co2") {
        Some(1.0)
    } else if lower.contains("ch4") {
        Some(GWP_CH4)
    } else if lower.contains("n2o") {
        Some(GWP_N2O)
    } else {
        None
    }
}

fn extract_f_matrix(bytes: &[u8]) -> Result<String, ConnectorError> {
    let cursor = Cursor::new(bytes.to_vec());
    let mut archive = zip::ZipArchive::new(cursor)
        .map_err(|e| ConnectorError::Parse(format!("unreadable archive: {e}")))?;
    let names: Vec<String> = archive.file_names().map(str::to_string).collect();
    let target = names
        .iter()
        .find(|n| F_MATRIX_PATHS.contains(&n.as_str()) || n.ends_with("/F.txt"))
        .cloned()
        .ok_or_else(|| ConnectorError::Parse("F matrix not found in archive".to_string()))?;
    let mut file = archive
        .by_name(&target)
        .map_err(|e| ConnectorError::Parse(format!("reading {target}: {e}")))?;
    let mut text = String::new();
    file.read_to_string(&mut text)
        .map_err(|e| ConnectorError::Parse(format!("reading {target}: {e}")))?;
    Ok(text)
}

/// Parse the tab-separated matrix: header row of REGION_PRODUCT labels, data
/// rows keyed by stressor name.
pub fn parse_f_matrix(text: &str) -> Result<Vec<RawRow>, ConnectorError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut records = reader.records();
    let header = records
        .next()
        .transpose()
        .map_err(|e| ConnectorError::Parse(format!("F matrix header: {e}")))?
        .ok_or_else(|| ConnectorError::Parse("F matrix is empty".to_string()))?;
    let columns: Vec<String> = header.iter().skip(1).map(str::to_string).collect();
    if columns.is_empty() {
        return Err(ConnectorError::Parse(
            "F matrix header has no REGION_PRODUCT columns".to_string(),
        ));
    }

    let mut rows = Vec::new();
    for record in records {
        let record = record.map_err(|e| ConnectorError::Parse(format!("F matrix row: {e}")))?;
        let Some(stressor) = record.get(0).map(str::trim).filter(|s| !s.is_empty()) else {
            continue;
        };
        let mut row = RawRow::new(F_CONTAINER, stressor);
        for (i, column) in columns.iter().enumerate() {
            row.values
                .insert(column.clone(), record.get(i + 1).unwrap_or("").to_string());
        }
        rows.push(row);
    }
    Ok(rows)
}

#[async_trait::async_trait]
impl SourceConnector for ExiobaseConnector {
    fn source_name(&self) -> &'static str {
        "exiobase"
    }

    fn parse_data(&self, payload: &RawPayload) -> Result<Vec<RawRow>, ConnectorError> {
        let text = extract_f_matrix(&payload.bytes)?;
        parse_f_matrix(&text)
    }

    /// Aggregate GHG stressor rows into one CO2e factor per REGION_PRODUCT
    /// column. A bad cell fails that column, not the run.
    fn transform_data(&self, rows: Vec<RawRow>) -> TransformOutcome {
        let mut totals: BTreeMap<String, Result<f64, RowError>> = BTreeMap::new();

        for row in &rows {
            let Some(weight) = stressor_weight(&row.label) else {
                continue;
            };
            for (column, raw) in &row.values {
                let entry = totals.entry(column.clone()).or_insert(Ok(0.0));
                let Ok(total) = entry else {
                    continue;
                };
                let raw = raw.trim();
                if raw.is_empty() {
                    continue;
                }
                match raw.parse::<f64>() {
                    Ok(value) => *total += weight * value,
                    Err(_) => {
                        *entry = Err(RowError {
                            item: format!("{}:{column}", row.label),
                            error: format!("unparseable stressor value: {raw:?}"),
                        });
                    }
                }
            }
        }

        let mut outcome = TransformOutcome::default();
        for (column, total) in totals {
            match total {
                Ok(co2e) => {
                    if co2e <= 0.0 {
                        debug!(column = %column, "zero CO2e column skipped");
                        continue;
                    }
                    let (geography, activity) = split_region_product(&column);
                    outcome.drafts.push(
                        EmissionFactorDraft::new(activity, co2e, Unit::Unit)
                            .with_geography(geography)
                            .with_external_id(column),
                    );
                }
                Err(err) => outcome.errors.push(err),
            }
        }
        outcome
    }
}

/// Split a REGION_PRODUCT label: a short leading region code becomes the
/// geography, the remainder the activity name.
fn split_region_product(label: &str) -> (String, String) {
    if let Some((region, product)) = label.split_once('_') {
        if (2..=3).contains(&region.len())
            && region.chars().all(|c| c.is_ascii_uppercase())
            && !product.is_empty()
        {
            return (region.to_string(), product.replace('_', " "));
        }
    }
    ("GLO".to_string(), label.replace('_', " "))
}
