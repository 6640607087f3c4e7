//! DEFRA connector: the UK conversion-factor workbook with six named sheets,
//! each carrying its own column layout.

use pcf_core::{EmissionFactorDraft, FactorCategory, Unit};

use crate::{
    decode_workbook, parse_factor_value, ConnectorError, RawPayload, RawRow, RowError, Sheet,
    SourceConnector, TransformOutcome,
};

struct SheetLayout {
    name: &'static str,
    container: &'static str,
    label_cols: &'static [usize],
    unit_col: usize,
    factor_col: usize,
    category: FactorCategory,
}

/// The six sheets a DEFRA workbook must carry. Layouts differ per sheet:
/// fuels and waste carry a grouping column ahead of the activity.
const SHEETS: &[SheetLayout] = &[
    SheetLayout {
        name: "Fuels",
        container: "fuels",
        label_cols: &[0, 1],
        unit_col: 2,
        factor_col: 3,
        category: FactorCategory::Energy,
    },
    SheetLayout {
        name: "UK electricity",
        container: "uk_electricity",
        label_cols: &[0],
        unit_col: 1,
        factor_col: 2,
        category: FactorCategory::Energy,
    },
    SheetLayout {
        name: "Material use",
        container: "material_use",
        label_cols: &[0],
        unit_col: 1,
        factor_col: 2,
        category: FactorCategory::Material,
    },
    SheetLayout {
        name: "Waste disposal",
        container: "waste_disposal",
        label_cols: &[0, 1],
        unit_col: 2,
        factor_col: 3,
        category: FactorCategory::Other,
    },
    SheetLayout {
        name: "Business travel- air",
        container: "business_travel_air",
        label_cols: &[0, 1],
        unit_col: 2,
        factor_col: 3,
        category: FactorCategory::Transport,
    },
    SheetLayout {
        name: "Freighting goods",
        container: "freighting_goods",
        label_cols: &[0, 1],
        unit_col: 2,
        factor_col: 3,
        category: FactorCategory::Transport,
    },
];

fn layout_for_container(container: &str) -> Option<&'static SheetLayout> {
    SHEETS.iter().find(|s| s.container == container)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefraConnector;

/// Extract rows from all six required sheets; any missing sheet is a
/// structural failure naming it.
pub fn parse_sheets(sheets: &[Sheet]) -> Result<Vec<RawRow>, ConnectorError> {
    let mut rows = Vec::new();
    for layout in SHEETS {
        let sheet = sheets
            .iter()
            .find(|s| s.name.trim().eq_ignore_ascii_case(layout.name))
            .ok_or_else(|| ConnectorError::Parse(format!("missing sheet {:?}", layout.name)))?;
        for r in 1..sheet.rows.len() {
            let label = layout
                .label_cols
                .iter()
                .filter_map(|&c| sheet.cell(r, c).text())
                .collect::<Vec<_>>()
                .join(" ");
            if label.is_empty() {
                continue;
            }
            rows.push(
                RawRow::new(layout.container, label)
                    .with("unit", sheet.cell(r, layout.unit_col).raw())
                    .with("factor", sheet.cell(r, layout.factor_col).raw()),
            );
        }
    }
    Ok(rows)
}

fn transform_row(row: &RawRow) -> Result<EmissionFactorDraft, RowError> {
    let layout = layout_for_container(&row.container).ok_or_else(|| RowError {
        item: format!("{}:{}", row.container, row.label),
        error: "unknown container".to_string(),
    })?;
    let factor = parse_factor_value(row, "factor")?;
    let unit_raw = row.value("unit").unwrap_or_default();
    let unit: Unit = unit_raw.parse().map_err(|_| RowError {
        item: format!("{}:{}", row.container, row.label),
        error: format!("unknown unit {unit_raw:?}"),
    })?;
    Ok(EmissionFactorDraft::new(&row.label, factor, unit)
        .with_category(layout.category)
        .with_geography("GB")
        .with_external_id(format!("{}::{}", row.container, row.label)))
}

#[async_trait::async_trait]
impl SourceConnector for DefraConnector {
    fn source_name(&self) -> &'static str {
        "defra"
    }

    fn parse_data(&self, payload: &RawPayload) -> Result<Vec<RawRow>, ConnectorError> {
        let sheets = decode_workbook(&payload.bytes)?;
        parse_sheets(&sheets)
    }

    fn transform_data(&self, rows: Vec<RawRow>) -> TransformOutcome {
        let mut outcome = TransformOutcome::default();
        for row in rows {
            match transform_row(&row) {
                Ok(draft) => outcome.drafts.push(draft),
                Err(err) => outcome.errors.push(err),
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Cell;

    fn text(s: &str) -> Cell {
        Cell::Text(s.to_string())
    }

    fn sheet(name: &str, rows: Vec<Vec<Cell>>) -> Sheet {
        Sheet {
            name: name.to_string(),
            rows,
        }
    }

    fn workbook() -> Vec<Sheet> {
        vec![
            sheet(
                "Fuels",
                vec![
                    vec![text("Fuel group"), text("Fuel"), text("Unit"), text("kg CO2e")],
                    vec![text("Gaseous fuels"), text("CNG"), text("kg"), Cell::Number(2.54)],
                    vec![text("Liquid fuels"), text("Diesel"), text("L"), Cell::Number(2.66)],
                ],
            ),
            sheet(
                "UK electricity",
                vec![
                    vec![text("Activity"), text("Unit"), text("kg CO2e")],
                    vec![text("Electricity generated"), text("kWh"), Cell::Number(0.207)],
                ],
            ),
            sheet(
                "Material use",
                vec![
                    vec![text("Material"), text("Unit"), text("kg CO2e")],
                    vec![text("Paper and board"), text("kg"), Cell::Number(0.92)],
                ],
            ),
            sheet(
                "Waste disposal",
                vec![
                    vec![text("Waste type"), text("Method"), text("Unit"), text("kg CO2e")],
                    vec![text("Plastics"), text("Landfill"), text("kg"), Cell::Number(0.009)],
                ],
            ),
            sheet(
                "Business travel- air",
                vec![
                    vec![text("Haul"), text("Class"), text("Unit"), text("kg CO2e")],
                    vec![
                        text("Long-haul"),
                        text("Economy"),
                        text("passenger.km"),
                        Cell::Number(0.148),
                    ],
                ],
            ),
            sheet(
                "Freighting goods",
                vec![
                    vec![text("Vehicle"), text("Type"), text("Unit"), text("kg CO2e")],
                    vec![text("HGV"), text("Average laden"), text("tkm"), Cell::Number(0.107)],
                ],
            ),
        ]
    }

    #[test]
    fn all_six_sheets_are_required() {
        for missing in 0..SHEETS.len() {
            let mut sheets = workbook();
            let removed = sheets.remove(missing);
            let err = parse_sheets(&sheets).unwrap_err();
            assert!(
                matches!(err, ConnectorError::Parse(msg) if msg.contains(&removed.name)),
                "expected failure naming {:?}",
                removed.name
            );
        }
    }

    #[test]
    fn labels_join_grouping_columns() {
        let rows = parse_sheets(&workbook()).unwrap();
        assert!(rows.iter().any(|r| r.label == "Gaseous fuels CNG"));
        assert!(rows.iter().any(|r| r.label == "Plastics Landfill"));
        assert!(rows.iter().any(|r| r.label == "HGV Average laden"));
    }

    #[test]
    fn transform_assigns_sheet_categories_and_flags_unknown_units() {
        let rows = parse_sheets(&workbook()).unwrap();
        assert_eq!(rows.len(), 7);

        let outcome = DefraConnector.transform_data(rows);
        // The air-travel row carries passenger.km, outside the unit
        // vocabulary, and must fail as a row error rather than abort.
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].error.contains("passenger.km"));
        assert_eq!(outcome.drafts.len(), 6);

        let electricity = outcome
            .drafts
            .iter()
            .find(|d| d.activity_name == "Electricity generated")
            .unwrap();
        assert_eq!(electricity.category, FactorCategory::Energy);
        assert_eq!(electricity.unit, Unit::Kwh);
        assert_eq!(electricity.geography, "GB");

        let freight = outcome
            .drafts
            .iter()
            .find(|d| d.activity_name == "HGV Average laden")
            .unwrap();
        assert_eq!(freight.category, FactorCategory::Transport);
        assert_eq!(freight.unit, Unit::Tkm);

        let waste = outcome
            .drafts
            .iter()
            .find(|d| d.activity_name == "Plastics Landfill")
            .unwrap();
        assert_eq!(waste.category, FactorCategory::Other);
    }
}
