//! BOM explosion engine and footprint aggregation.
//!
//! The explosion is an explicit worklist traversal over an in-memory graph
//! snapshot. Depth truncation and cycle pruning are deterministic policy,
//! never errors.

use std::collections::{HashMap, VecDeque};

use pcf_core::{EmissionFactor, ExplosionRow, FactorCategory, Product, Unit};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use pcf_core::BomEdge;

pub const CRATE_NAME: &str = "pcf-engine";

/// Hard stop for pathologically deep (but acyclic) trees. Rows whose level
/// would reach this bound are not emitted.
pub const MAX_BOM_DEPTH: u32 = 10;

/// Read-only snapshot of the product/BOM graph, indexed for traversal.
#[derive(Debug, Clone)]
pub struct BomGraph {
    products: HashMap<Uuid, Product>,
    children: HashMap<Uuid, Vec<BomEdge>>,
}

struct Frame {
    component_id: Uuid,
    cumulative_quantity: f64,
    level: u32,
    unit: Unit,
    path: Vec<Uuid>,
}

impl BomGraph {
    pub fn new(products: Vec<Product>, edges: Vec<BomEdge>) -> Self {
        let products: HashMap<Uuid, Product> =
            products.into_iter().map(|p| (p.id, p)).collect();
        let mut children: HashMap<Uuid, Vec<BomEdge>> = HashMap::new();
        for edge in edges {
            children.entry(edge.parent_product_id).or_default().push(edge);
        }
        // Deterministic expansion order: children by name, then id.
        for list in children.values_mut() {
            list.sort_by(|a, b| {
                let name = |e: &BomEdge| {
                    products
                        .get(&e.child_product_id)
                        .map(|p| p.name.clone())
                        .unwrap_or_default()
                };
                name(a)
                    .cmp(&name(b))
                    .then(a.child_product_id.cmp(&b.child_product_id))
            });
        }
        Self { products, children }
    }

    pub fn product(&self, id: Uuid) -> Option<&Product> {
        self.products.get(&id)
    }

    pub fn product_by_code(&self, code: &str) -> Option<&Product> {
        self.products.values().find(|p| p.code == code)
    }

    /// Finished products in code order, the root set for `explode_all`.
    pub fn finished_products(&self) -> Vec<&Product> {
        let mut roots: Vec<&Product> = self
            .products
            .values()
            .filter(|p| p.is_finished_product)
            .collect();
        roots.sort_by(|a, b| a.code.cmp(&b.code));
        roots
    }

    /// Explode one root into its reachable components with cumulative
    /// quantities relative to one unit of the root.
    ///
    /// A non-finished product yields zero rows. A finished product with no
    /// outgoing edges yields exactly one row (itself, level 0).
    pub fn explode(&self, root_id: Uuid) -> Vec<ExplosionRow> {
        let Some(root) = self.products.get(&root_id) else {
            return Vec::new();
        };
        if !root.is_finished_product {
            return Vec::new();
        }

        let mut rows = Vec::new();
        let mut queue = VecDeque::new();
        queue.push_back(Frame {
            component_id: root_id,
            cumulative_quantity: 1.0,
            level: 0,
            unit: root.unit,
            path: vec![root_id],
        });

        while let Some(frame) = queue.pop_front() {
            let Some(component) = self.products.get(&frame.component_id) else {
                continue;
            };
            rows.push(ExplosionRow {
                root_id,
                root_name: root.name.clone(),
                component_id: component.id,
                component_name: component.name.clone(),
                level: frame.level,
                cumulative_quantity: frame.cumulative_quantity,
                unit: frame.unit,
                path: frame.path.clone(),
            });

            let next_level = frame.level + 1;
            if next_level >= MAX_BOM_DEPTH {
                continue;
            }
            let Some(edges) = self.children.get(&frame.component_id) else {
                continue;
            };
            for edge in edges {
                // Cycle guard: a child already on this path is pruned, which
                // covers indirect cycles a self-reference check cannot.
                if frame.path.contains(&edge.child_product_id) {
                    continue;
                }
                let Some(child) = self.products.get(&edge.child_product_id) else {
                    continue;
                };
                let mut path = frame.path.clone();
                path.push(edge.child_product_id);
                queue.push_back(Frame {
                    component_id: edge.child_product_id,
                    cumulative_quantity: frame.cumulative_quantity * edge.quantity,
                    level: next_level,
                    unit: edge.unit.unwrap_or(child.unit),
                    path,
                });
            }
        }

        rows.sort_by(|a, b| {
            a.level
                .cmp(&b.level)
                .then_with(|| a.component_name.cmp(&b.component_name))
                .then_with(|| a.component_id.cmp(&b.component_id))
        });
        rows
    }

    /// Explode every finished product, in root code order.
    pub fn explode_all(&self) -> Vec<ExplosionRow> {
        self.finished_products()
            .iter()
            .flat_map(|root| self.explode(root.id))
            .collect()
    }
}

/// One matched component's contribution to the footprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FootprintContribution {
    pub component_id: Uuid,
    pub component_name: String,
    pub activity_name: String,
    pub cumulative_quantity: f64,
    pub unit: Unit,
    pub co2e_factor: f64,
    pub co2e_kg: f64,
    pub category: FactorCategory,
}

/// A component with no matching emission factor: a reportable gap, never
/// silently zeroed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnmatchedComponent {
    pub component_id: Uuid,
    pub component_name: String,
    pub cumulative_quantity: f64,
    pub unit: Unit,
}

/// Explicit non-BOM activity amount (process energy, outbound freight) folded
/// into the same factor join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectEntry {
    pub activity_name: String,
    pub quantity: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryTotals {
    pub materials: f64,
    pub energy: f64,
    pub transport: f64,
    pub other: f64,
}

impl CategoryTotals {
    pub fn add(&mut self, category: FactorCategory, co2e_kg: f64) {
        match category {
            FactorCategory::Material => self.materials += co2e_kg,
            FactorCategory::Energy => self.energy += co2e_kg,
            FactorCategory::Transport => self.transport += co2e_kg,
            FactorCategory::Other => self.other += co2e_kg,
        }
    }

    pub fn sum(&self) -> f64 {
        self.materials + self.energy + self.transport + self.other
    }
}

/// Footprint for one root: total, categorized breakdown, and gaps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FootprintReport {
    pub root_id: Uuid,
    pub root_name: String,
    pub total_co2e_kg: f64,
    pub by_category: CategoryTotals,
    pub contributions: Vec<FootprintContribution>,
    pub unmatched: Vec<UnmatchedComponent>,
    pub unmatched_entries: Vec<String>,
}

impl FootprintReport {
    /// Total must equal the category subtotals within float tolerance.
    pub fn reconciles(&self) -> bool {
        (self.total_co2e_kg - self.by_category.sum()).abs() <= 1e-2
    }
}

fn factor_index(factors: &[EmissionFactor]) -> HashMap<&str, &EmissionFactor> {
    let mut index: HashMap<&str, &EmissionFactor> = HashMap::new();
    for factor in factors.iter().filter(|f| f.is_active) {
        index.entry(factor.activity_name.as_str()).or_insert(factor);
    }
    index
}

/// Combine exploded rows for a single root with emission factors and optional
/// direct entries.
///
/// The level-0 row is the root's own identity and takes part in neither the
/// factor join nor the gap list; component rows match factors by activity
/// name = component name.
pub fn aggregate_root(
    rows: &[ExplosionRow],
    factors: &[EmissionFactor],
    direct: &[DirectEntry],
) -> Option<FootprintReport> {
    let root = rows.first()?;
    let index = factor_index(factors);

    let mut report = FootprintReport {
        root_id: root.root_id,
        root_name: root.root_name.clone(),
        total_co2e_kg: 0.0,
        by_category: CategoryTotals::default(),
        contributions: Vec::new(),
        unmatched: Vec::new(),
        unmatched_entries: Vec::new(),
    };

    for row in rows.iter().filter(|r| r.level > 0) {
        match index.get(row.component_name.as_str()) {
            Some(factor) => {
                let co2e_kg = row.cumulative_quantity * factor.co2e_factor;
                report.by_category.add(factor.category, co2e_kg);
                report.total_co2e_kg += co2e_kg;
                report.contributions.push(FootprintContribution {
                    component_id: row.component_id,
                    component_name: row.component_name.clone(),
                    activity_name: factor.activity_name.clone(),
                    cumulative_quantity: row.cumulative_quantity,
                    unit: row.unit,
                    co2e_factor: factor.co2e_factor,
                    co2e_kg,
                    category: factor.category,
                });
            }
            None => report.unmatched.push(UnmatchedComponent {
                component_id: row.component_id,
                component_name: row.component_name.clone(),
                cumulative_quantity: row.cumulative_quantity,
                unit: row.unit,
            }),
        }
    }

    for entry in direct {
        match index.get(entry.activity_name.as_str()) {
            Some(factor) => {
                let co2e_kg = entry.quantity * factor.co2e_factor;
                report.by_category.add(factor.category, co2e_kg);
                report.total_co2e_kg += co2e_kg;
            }
            None => report.unmatched_entries.push(entry.activity_name.clone()),
        }
    }

    Some(report)
}

/// Aggregate a mixed row set (as produced by `explode_all`) into one report
/// per root, in first-seen root order.
pub fn aggregate(rows: &[ExplosionRow], factors: &[EmissionFactor]) -> Vec<FootprintReport> {
    let mut order: Vec<Uuid> = Vec::new();
    let mut by_root: HashMap<Uuid, Vec<ExplosionRow>> = HashMap::new();
    for row in rows {
        if !by_root.contains_key(&row.root_id) {
            order.push(row.root_id);
        }
        by_root.entry(row.root_id).or_default().push(row.clone());
    }
    order
        .into_iter()
        .filter_map(|root_id| aggregate_root(&by_root[&root_id], factors, &[]))
        .collect()
}
