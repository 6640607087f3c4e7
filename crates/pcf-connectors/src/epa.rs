//! EPA connector: emission-factor hub workbook with a fuel-factors sheet and
//! an eGRID subregion sheet.

use pcf_core::{classify_activity, EmissionFactorDraft, FactorCategory, Unit, LB_TO_KG, MWH_TO_KWH};

use crate::{
    decode_workbook, find_sheet, parse_factor_value, ConnectorError, RawPayload, RawRow, RowError,
    Sheet, SourceConnector, TransformOutcome,
};

const FUEL_CONTAINER: &str = "fuel_factors";
const EGRID_CONTAINER: &str = "egrid_subregions";

/// eGRID publishes electricity CO2 rates in lb/MWh; the store speaks kg/kWh.
pub fn lb_per_mwh_to_kg_per_kwh(lb_per_mwh: f64) -> f64 {
    lb_per_mwh * LB_TO_KG / MWH_TO_KWH
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EpaConnector;

/// Extract fuel and subregion rows from the decoded workbook. Both sheets are
/// required; a workbook without them is structurally invalid.
pub fn parse_sheets(sheets: &[Sheet]) -> Result<Vec<RawRow>, ConnectorError> {
    let fuel_sheet = find_sheet(sheets, "fuel")
        .ok_or_else(|| ConnectorError::Parse("missing fuel factors sheet".to_string()))?;
    let egrid_sheet = find_sheet(sheets, "egrid")
        .or_else(|| find_sheet(sheets, "subregion"))
        .ok_or_else(|| ConnectorError::Parse("missing eGRID subregion sheet".to_string()))?;

    let mut rows = Vec::new();
    // Columns: fuel type, kg CO2e per unit, unit, category. Row 0 is headers.
    for r in 1..fuel_sheet.rows.len() {
        let Some(label) = fuel_sheet.cell(r, 0).text() else {
            continue;
        };
        rows.push(
            RawRow::new(FUEL_CONTAINER, label)
                .with("factor", fuel_sheet.cell(r, 1).raw())
                .with("unit", fuel_sheet.cell(r, 2).raw())
                .with("category", fuel_sheet.cell(r, 3).raw()),
        );
    }
    // Columns: subregion code, CO2 lb/MWh, then NOx/SO2 rates we ignore.
    for r in 1..egrid_sheet.rows.len() {
        let Some(code) = egrid_sheet.cell(r, 0).text() else {
            continue;
        };
        rows.push(
            RawRow::new(EGRID_CONTAINER, code)
                .with("co2_lb_per_mwh", egrid_sheet.cell(r, 1).raw()),
        );
    }
    Ok(rows)
}

fn transform_fuel_row(row: &RawRow) -> Result<EmissionFactorDraft, RowError> {
    let factor = parse_factor_value(row, "factor")?;
    let unit_raw = row.value("unit").unwrap_or_default();
    let unit: Unit = unit_raw.parse().map_err(|_| RowError {
        item: format!("{FUEL_CONTAINER}:{}", row.label),
        error: format!("unknown unit {unit_raw:?}"),
    })?;
    let category_raw = row.value("category").unwrap_or_default();
    let category = category_raw
        .parse::<FactorCategory>()
        .unwrap_or_else(|_| classify_activity(&format!("{category_raw} {}", row.label)));
    Ok(EmissionFactorDraft::new(&row.label, factor, unit)
        .with_category(category)
        .with_geography("US")
        .with_external_id(format!("fuel::{}", row.label)))
}

fn transform_egrid_row(row: &RawRow) -> Result<EmissionFactorDraft, RowError> {
    let lb_per_mwh = parse_factor_value(row, "co2_lb_per_mwh")?;
    let factor = lb_per_mwh_to_kg_per_kwh(lb_per_mwh);
    Ok(
        EmissionFactorDraft::new(format!("electricity grid {}", row.label), factor, Unit::Kwh)
            .with_category(FactorCategory::Energy)
            .with_geography(row.label.clone())
            .with_external_id(format!("egrid::{}", row.label)),
    )
}

#[async_trait::async_trait]
impl SourceConnector for EpaConnector {
    fn source_name(&self) -> &'static str {
        "epa"
    }

    fn parse_data(&self, payload: &RawPayload) -> Result<Vec<RawRow>, ConnectorError> {
        let sheets = decode_workbook(&payload.bytes)?;
        parse_sheets(&sheets)
    }

    fn transform_data(&self, rows: Vec<RawRow>) -> TransformOutcome {
        let mut outcome = TransformOutcome::default();
        for row in rows {
            let result = match row.container.as_str() {
                FUEL_CONTAINER => transform_fuel_row(&row),
                EGRID_CONTAINER => transform_egrid_row(&row),
                other => Err(RowError {
                    item: format!("{other}:{}", row.label),
                    error: "unknown container".to_string(),
                }),
            };
            match result {
                Ok(draft) => outcome.drafts.push(draft),
                Err(err) => outcome.errors.push(err),
            }
        }
        outcome
    }
}
