//! Ingestion connector contracts + the EPA/DEFRA/Exiobase implementations.

use std::collections::BTreeMap;
use std::io::Cursor;

use async_trait::async_trait;
use calamine::{Data, Reader, Xlsx};
use chrono::{DateTime, Utc};
use pcf_core::{DataSource, EmissionFactorDraft};
use pcf_store::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod defra;
pub mod epa;
pub mod exiobase;

pub use defra::DefraConnector;
pub use epa::EpaConnector;
pub use exiobase::ExiobaseConnector;

pub const CRATE_NAME: &str = "pcf-connectors";

/// Connector-level failure. Row-level problems never surface here; they are
/// absorbed into [`TransformOutcome::errors`].
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("reading fixture {path}: {source}")]
    Fixture {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parse error: {0}")]
    Parse(String),
}

impl ConnectorError {
    /// Retrying only helps for transport-level faults; a malformed source
    /// file stays malformed.
    pub fn is_transient(&self) -> bool {
        match self {
            ConnectorError::Fetch(err) => err.is_transient(),
            ConnectorError::Fixture { .. } => false,
            ConnectorError::Parse(_) => false,
        }
    }
}

/// Raw bytes fetched from a source, with enough metadata to archive them.
#[derive(Debug, Clone)]
pub struct RawPayload {
    pub source_name: String,
    pub origin: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

/// One structured row extracted from a source container (a workbook sheet or
/// a file inside an archive), still in source-native terms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRow {
    pub container: String,
    pub label: String,
    pub values: BTreeMap<String, String>,
}

impl RawRow {
    pub fn new(container: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            label: label.into(),
            values: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

/// A single record that failed transformation; counted, not fatal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowError {
    pub item: String,
    pub error: String,
}

/// Result of transforming parsed rows into canonical drafts.
#[derive(Debug, Clone, Default)]
pub struct TransformOutcome {
    pub drafts: Vec<EmissionFactorDraft>,
    pub errors: Vec<RowError>,
}

impl TransformOutcome {
    pub fn processed(&self) -> usize {
        self.drafts.len() + self.errors.len()
    }
}

/// Full output of one connector pipeline run (fetch → parse → transform).
#[derive(Debug, Clone)]
pub struct ConnectorOutcome {
    pub payload: RawPayload,
    pub drafts: Vec<EmissionFactorDraft>,
    pub errors: Vec<RowError>,
    pub processed: usize,
}

/// Per-source ingestion contract.
///
/// Retry and timeout policy is owned by the sync job runner; connectors stay
/// single-shot.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    fn source_name(&self) -> &'static str;

    fn parse_data(&self, payload: &RawPayload) -> Result<Vec<RawRow>, ConnectorError>;

    fn transform_data(&self, rows: Vec<RawRow>) -> TransformOutcome;

    async fn fetch_raw_data(
        &self,
        http: &HttpFetcher,
        source: &DataSource,
    ) -> Result<RawPayload, ConnectorError> {
        fetch_payload(http, source).await
    }

    /// fetch → parse → transform. Row-level failures are carried as counts
    /// and details; only connector-level failures are raised.
    async fn execute_sync(
        &self,
        http: &HttpFetcher,
        source: &DataSource,
    ) -> Result<ConnectorOutcome, ConnectorError> {
        let payload = self.fetch_raw_data(http, source).await?;
        let rows = self.parse_data(&payload)?;
        let outcome = self.transform_data(rows);
        let processed = outcome.processed();
        Ok(ConnectorOutcome {
            payload,
            drafts: outcome.drafts,
            errors: outcome.errors,
            processed,
        })
    }
}

/// Source-name→connector registry.
pub fn connector_for_source(source_type: &str) -> Option<Box<dyn SourceConnector>> {
    match source_type.to_ascii_lowercase().as_str() {
        "epa" => Some(Box::new(EpaConnector)),
        "defra" => Some(Box::new(DefraConnector)),
        "exiobase" => Some(Box::new(ExiobaseConnector)),
        _ => None,
    }
}

/// Shared fetch: `file://` fixtures read locally, anything else goes through
/// the retrying HTTP fetcher.
pub async fn fetch_payload(
    http: &HttpFetcher,
    source: &DataSource,
) -> Result<RawPayload, ConnectorError> {
    if let Some(path) = source.base_url.strip_prefix("file://") {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source_err| ConnectorError::Fixture {
                path: path.to_string(),
                source: source_err,
            })?;
        return Ok(RawPayload {
            source_name: source.name.clone(),
            origin: source.base_url.clone(),
            content_type: None,
            bytes,
            fetched_at: Utc::now(),
        });
    }
    let fetched = http.fetch_bytes(&source.name, &source.base_url).await?;
    Ok(RawPayload {
        source_name: source.name.clone(),
        origin: fetched.final_url,
        content_type: fetched.content_type,
        bytes: fetched.body,
        fetched_at: Utc::now(),
    })
}

// ----------------------------------------------------------------------
// Workbook decoding
// ----------------------------------------------------------------------

/// Decoded cell, free of any spreadsheet-library type so sheet parsers stay
/// pure and directly testable.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Text(String),
    Number(f64),
}

impl Cell {
    pub fn text(&self) -> Option<&str> {
        match self {
            Cell::Text(s) if !s.is_empty() => Some(s),
            _ => None,
        }
    }

    pub fn number(&self) -> Option<f64> {
        match self {
            Cell::Number(n) => Some(*n),
            Cell::Text(s) => s.trim().parse().ok(),
            Cell::Empty => None,
        }
    }

    /// Raw display form, used when a value is carried to the transform stage
    /// as text.
    pub fn raw(&self) -> String {
        match self {
            Cell::Empty => String::new(),
            Cell::Text(s) => s.clone(),
            Cell::Number(n) => n.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sheet {
    pub name: String,
    pub rows: Vec<Vec<Cell>>,
}

impl Sheet {
    pub fn cell(&self, row: usize, col: usize) -> &Cell {
        self.rows
            .get(row)
            .and_then(|r| r.get(col))
            .unwrap_or(&Cell::Empty)
    }
}

fn cell_from_data(data: &Data) -> Cell {
    match data {
        Data::Empty => Cell::Empty,
        Data::String(s) => Cell::Text(s.trim().to_string()),
        Data::Float(f) => Cell::Number(*f),
        Data::Int(i) => Cell::Number(*i as f64),
        Data::Bool(b) => Cell::Text(b.to_string()),
        other => Cell::Text(other.to_string()),
    }
}

/// Decode an xlsx payload into plain sheets. An unreadable workbook is a
/// structural parse failure.
pub fn decode_workbook(bytes: &[u8]) -> Result<Vec<Sheet>, ConnectorError> {
    let cursor = Cursor::new(bytes.to_vec());
    let mut workbook: Xlsx<_> = Xlsx::new(cursor)
        .map_err(|e| ConnectorError::Parse(format!("unreadable workbook: {e}")))?;
    let names: Vec<String> = workbook.sheet_names().to_vec();
    let mut sheets = Vec::with_capacity(names.len());
    for name in names {
        let range = workbook
            .worksheet_range(&name)
            .map_err(|e| ConnectorError::Parse(format!("sheet {name}: {e}")))?;
        let rows = range
            .rows()
            .map(|row| row.iter().map(cell_from_data).collect())
            .collect();
        sheets.push(Sheet { name, rows });
    }
    Ok(sheets)
}

pub(crate) fn find_sheet<'a>(sheets: &'a [Sheet], needle: &str) -> Option<&'a Sheet> {
    let needle = needle.to_ascii_lowercase();
    sheets
        .iter()
        .find(|s| s.name.to_ascii_lowercase().contains(&needle))
}

pub(crate) fn parse_factor_value(row: &RawRow, key: &str) -> Result<f64, RowError> {
    let raw = row.value(key).unwrap_or_default();
    raw.trim().parse::<f64>().map_err(|_| RowError {
        item: format!("{}:{}", row.container, row.label),
        error: format!("unparseable {key} value: {raw:?}"),
    })
}
