//! Core domain model for the product carbon footprint engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "pcf-core";

/// Global warming potential multipliers (kg CO2e per kg of species).
pub const GWP_CH4: f64 = 28.0;
pub const GWP_N2O: f64 = 265.0;

/// Pounds to kilograms.
pub const LB_TO_KG: f64 = 0.453592;
/// Megawatt-hours to kilowatt-hours.
pub const MWH_TO_KWH: f64 = 1000.0;

/// Closed unit vocabulary shared by products, BOM edges and emission factors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Unit {
    #[serde(rename = "unit")]
    Unit,
    #[serde(rename = "kg")]
    Kg,
    #[serde(rename = "g")]
    G,
    #[serde(rename = "L")]
    L,
    #[serde(rename = "mL")]
    Ml,
    #[serde(rename = "m")]
    M,
    #[serde(rename = "cm")]
    Cm,
    #[serde(rename = "kWh")]
    Kwh,
    #[serde(rename = "MJ")]
    Mj,
    #[serde(rename = "tkm")]
    Tkm,
}

/// Parse failure for any of the closed vocabularies (units, categories,
/// statuses).
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown vocabulary token: {0}")]
pub struct VocabParseError(pub String);

/// What a unit measures; BOM edge units must agree with the child product's
/// unit on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    Count,
    Mass,
    Volume,
    Length,
    Energy,
    TransportWork,
}

impl Unit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Unit::Unit => "unit",
            Unit::Kg => "kg",
            Unit::G => "g",
            Unit::L => "L",
            Unit::Ml => "mL",
            Unit::M => "m",
            Unit::Cm => "cm",
            Unit::Kwh => "kWh",
            Unit::Mj => "MJ",
            Unit::Tkm => "tkm",
        }
    }

    pub fn dimension(&self) -> Dimension {
        match self {
            Unit::Unit => Dimension::Count,
            Unit::Kg | Unit::G => Dimension::Mass,
            Unit::L | Unit::Ml => Dimension::Volume,
            Unit::M | Unit::Cm => Dimension::Length,
            Unit::Kwh | Unit::Mj => Dimension::Energy,
            Unit::Tkm => Dimension::TransportWork,
        }
    }
}

impl std::str::FromStr for Unit {
    type Err = VocabParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "unit" | "each" | "item" => Ok(Unit::Unit),
            "kg" => Ok(Unit::Kg),
            "g" => Ok(Unit::G),
            "L" | "l" | "litre" | "liter" => Ok(Unit::L),
            "mL" | "ml" => Ok(Unit::Ml),
            "m" => Ok(Unit::M),
            "cm" => Ok(Unit::Cm),
            "kWh" | "kwh" => Ok(Unit::Kwh),
            "MJ" | "mj" => Ok(Unit::Mj),
            "tkm" | "tonne.km" | "tonne km" => Ok(Unit::Tkm),
            other => Err(VocabParseError(other.to_string())),
        }
    }
}

impl std::fmt::Display for Unit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Emission factor category used for footprint breakdowns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactorCategory {
    Material,
    Energy,
    Transport,
    Other,
}

impl FactorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FactorCategory::Material => "material",
            FactorCategory::Energy => "energy",
            FactorCategory::Transport => "transport",
            FactorCategory::Other => "other",
        }
    }
}

impl std::str::FromStr for FactorCategory {
    type Err = VocabParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "material" => Ok(FactorCategory::Material),
            "energy" => Ok(FactorCategory::Energy),
            "transport" => Ok(FactorCategory::Transport),
            "other" => Ok(FactorCategory::Other),
            other => Err(VocabParseError(other.to_string())),
        }
    }
}

const ENERGY_KEYWORDS: &[&str] = &[
    "fuel",
    "diesel",
    "petrol",
    "gasoline",
    "natural gas",
    "coal",
    "electricity",
    "grid",
    "combustion",
];

const TRANSPORT_KEYWORDS: &[&str] = &[
    "freight",
    "travel",
    "transport",
    "van",
    "hgv",
    "rail",
    "air",
    "flight",
    "shipping",
];

const OTHER_KEYWORDS: &[&str] = &["waste", "disposal", "landfill", "recycl", "compost"];

/// Assign a category from activity-name keywords; unmatched names are materials.
pub fn classify_activity(activity_name: &str) -> FactorCategory {
    let lower = activity_name.to_ascii_lowercase();
    if ENERGY_KEYWORDS.iter().any(|k| lower.contains(k)) {
        FactorCategory::Energy
    } else if TRANSPORT_KEYWORDS.iter().any(|k| lower.contains(k)) {
        FactorCategory::Transport
    } else if OTHER_KEYWORDS.iter().any(|k| lower.contains(k)) {
        FactorCategory::Other
    } else {
        FactorCategory::Material
    }
}

/// A product: either a finished good (a BOM root) or a component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub unit: Unit,
    pub is_finished_product: bool,
    pub category: Option<String>,
    pub origin: Option<String>,
}

/// Directed parent→child BOM edge with a quantity multiplier.
///
/// The edge unit, when present, overrides the child's own unit in explosion
/// output. Validation (positive quantity, no self-loop, unique pair) happens
/// at insert time in the store, not here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BomEdge {
    pub parent_product_id: Uuid,
    pub child_product_id: Uuid,
    pub quantity: f64,
    pub unit: Option<Unit>,
}

/// Canonical persisted emission factor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmissionFactor {
    pub id: Uuid,
    pub activity_name: String,
    pub co2e_factor: f64,
    pub unit: Unit,
    pub category: FactorCategory,
    pub geography: String,
    pub data_source: String,
    pub external_id: Option<String>,
    pub sync_batch_id: Option<Uuid>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Pre-persistence handoff shape produced by connector transforms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmissionFactorDraft {
    pub activity_name: String,
    pub co2e_factor: f64,
    pub unit: Unit,
    pub category: FactorCategory,
    pub geography: String,
    pub external_id: Option<String>,
}

impl EmissionFactorDraft {
    pub fn new(activity_name: impl Into<String>, co2e_factor: f64, unit: Unit) -> Self {
        let activity_name = activity_name.into();
        let category = classify_activity(&activity_name);
        Self {
            activity_name,
            co2e_factor,
            unit,
            category,
            geography: "GLO".to_string(),
            external_id: None,
        }
    }

    pub fn with_geography(mut self, geography: impl Into<String>) -> Self {
        self.geography = geography.into();
        self
    }

    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    pub fn with_category(mut self, category: FactorCategory) -> Self {
        self.category = category;
        self
    }
}

/// One external provider configuration; read-only at sync time except for
/// `last_sync_at` bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
    pub id: Uuid,
    pub name: String,
    pub source_type: String,
    pub base_url: String,
    pub sync_frequency: Option<String>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncType {
    Manual,
    Scheduled,
}

impl SyncType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncType::Manual => "manual",
            SyncType::Scheduled => "scheduled",
        }
    }
}

/// Sync log state machine: pending → in_progress → {completed, failed}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncLogStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl SyncLogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncLogStatus::Pending => "pending",
            SyncLogStatus::InProgress => "in_progress",
            SyncLogStatus::Completed => "completed",
            SyncLogStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncLogStatus::Completed | SyncLogStatus::Failed)
    }
}

impl std::str::FromStr for SyncLogStatus {
    type Err = VocabParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncLogStatus::Pending),
            "in_progress" => Ok(SyncLogStatus::InProgress),
            "completed" => Ok(SyncLogStatus::Completed),
            "failed" => Ok(SyncLogStatus::Failed),
            other => Err(VocabParseError(other.to_string())),
        }
    }
}

/// Row counts carried through one sync run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounts {
    pub processed: u64,
    pub created: u64,
    pub updated: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl SyncCounts {
    pub fn merge(&mut self, other: SyncCounts) {
        self.processed += other.processed;
        self.created += other.created;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

/// Append-only audit row, one per sync invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSyncLog {
    pub id: i64,
    pub data_source_id: Uuid,
    pub sync_type: SyncType,
    pub status: SyncLogStatus,
    pub counts: SyncCounts,
    pub error_message: Option<String>,
    pub error_details: Option<serde_json::Value>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Derived explosion output row; computed on demand, never persisted.
///
/// `path` is the ordered sequence of product ids from the root down to this
/// component. Cycle checks compare ids, not rendered strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplosionRow {
    pub root_id: Uuid,
    pub root_name: String,
    pub component_id: Uuid,
    pub component_name: String,
    pub level: u32,
    pub cumulative_quantity: f64,
    pub unit: Unit,
    pub path: Vec<Uuid>,
}

impl ExplosionRow {
    /// Display form of the path, root first.
    pub fn path_string(&self) -> String {
        self.path
            .iter()
            .map(Uuid::to_string)
            .collect::<Vec<_>>()
            .join("/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_tokens_round_trip() {
        for token in ["unit", "kg", "g", "L", "mL", "m", "cm", "kWh", "MJ", "tkm"] {
            let unit: Unit = token.parse().expect("vocabulary token parses");
            assert_eq!(unit.as_str(), token);
        }
        assert!("furlong".parse::<Unit>().is_err());
    }

    #[test]
    fn activity_keywords_pick_categories() {
        assert_eq!(classify_activity("Diesel fuel"), FactorCategory::Energy);
        assert_eq!(classify_activity("UK electricity grid"), FactorCategory::Energy);
        assert_eq!(classify_activity("Freighting goods HGV"), FactorCategory::Transport);
        assert_eq!(classify_activity("Waste disposal landfill"), FactorCategory::Other);
        assert_eq!(classify_activity("cotton"), FactorCategory::Material);
    }

    #[test]
    fn units_group_by_dimension() {
        assert_eq!(Unit::Kg.dimension(), Unit::G.dimension());
        assert_eq!(Unit::L.dimension(), Unit::Ml.dimension());
        assert_eq!(Unit::Kwh.dimension(), Unit::Mj.dimension());
        assert_ne!(Unit::Kg.dimension(), Unit::L.dimension());
        assert_ne!(Unit::Unit.dimension(), Unit::Tkm.dimension());
    }

    #[test]
    fn draft_defaults_to_global_geography() {
        let draft = EmissionFactorDraft::new("cotton", 5.0, Unit::Kg);
        assert_eq!(draft.geography, "GLO");
        assert_eq!(draft.category, FactorCategory::Material);
    }
}
