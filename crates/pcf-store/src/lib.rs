//! Relational store (SQLite via sqlx) for products, BOM edges, emission
//! factors, data sources and the sync-log audit trail.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use pcf_core::{
    BomEdge, DataSource, DataSyncLog, EmissionFactor, EmissionFactorDraft, Product, SyncCounts,
    SyncLogStatus, SyncType, Unit,
};
use serde::Deserialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

pub mod archive;
pub mod fetch;

pub use archive::{PayloadArchive, StoredPayload};
pub use fetch::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetcherConfig, HttpFetcher,
    RetryDisposition,
};

pub const CRATE_NAME: &str = "pcf-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("BOM edge quantity must be strictly positive, got {0}")]
    NonPositiveQuantity(f64),
    #[error("self-referencing BOM edge for product {0}")]
    SelfLoop(Uuid),
    #[error("duplicate BOM edge {parent} -> {child}")]
    DuplicateEdge { parent: Uuid, child: Uuid },
    #[error("edge unit {edge_unit} is incompatible with child unit {child_unit}")]
    IncompatibleUnit { edge_unit: Unit, child_unit: Unit },
    #[error("duplicate product code {0}")]
    DuplicateProductCode(String),
    #[error("unknown product {0}")]
    UnknownProduct(Uuid),
    #[error("sync log {0} not found")]
    UnknownSyncLog(i64),
    #[error("corrupt stored value: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Outcome of one emission-factor upsert, feeding the sync statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    Skipped,
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS products (
        id TEXT PRIMARY KEY,
        code TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        unit TEXT NOT NULL,
        is_finished_product INTEGER NOT NULL DEFAULT 0,
        category TEXT,
        origin TEXT
    )",
    "CREATE TABLE IF NOT EXISTS bom_edges (
        parent_product_id TEXT NOT NULL REFERENCES products(id) ON DELETE CASCADE,
        child_product_id TEXT NOT NULL REFERENCES products(id) ON DELETE CASCADE,
        quantity REAL NOT NULL CHECK (quantity > 0),
        unit TEXT,
        PRIMARY KEY (parent_product_id, child_product_id)
    )",
    "CREATE TABLE IF NOT EXISTS emission_factors (
        id TEXT PRIMARY KEY,
        activity_name TEXT NOT NULL,
        co2e_factor REAL NOT NULL,
        unit TEXT NOT NULL,
        category TEXT NOT NULL,
        geography TEXT NOT NULL DEFAULT 'GLO',
        data_source TEXT NOT NULL,
        external_id TEXT,
        sync_batch_id TEXT,
        is_active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_emission_factors_source_activity
        ON emission_factors (data_source, activity_name)",
    "CREATE TABLE IF NOT EXISTS data_sources (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        source_type TEXT NOT NULL,
        base_url TEXT NOT NULL,
        sync_frequency TEXT,
        last_sync_at TEXT,
        is_active INTEGER NOT NULL DEFAULT 1
    )",
    "CREATE TABLE IF NOT EXISTS data_sync_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        data_source_id TEXT NOT NULL REFERENCES data_sources(id),
        sync_type TEXT NOT NULL,
        status TEXT NOT NULL,
        records_processed INTEGER NOT NULL DEFAULT 0,
        records_created INTEGER NOT NULL DEFAULT 0,
        records_updated INTEGER NOT NULL DEFAULT 0,
        records_skipped INTEGER NOT NULL DEFAULT 0,
        records_failed INTEGER NOT NULL DEFAULT 0,
        error_message TEXT,
        error_details TEXT,
        started_at TEXT NOT NULL,
        completed_at TEXT
    )",
];

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) and initialize the schema.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Single-connection in-memory store, used by tests and dry runs.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<Transaction<'_, Sqlite>, StoreError> {
        Ok(self.pool.begin().await?)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Products & BOM edges
    // ------------------------------------------------------------------

    pub async fn insert_product(&self, product: &Product) -> Result<(), StoreError> {
        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM products WHERE code = ?")
            .bind(&product.code)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_some() {
            return Err(StoreError::DuplicateProductCode(product.code.clone()));
        }
        sqlx::query(
            "INSERT INTO products (id, code, name, unit, is_finished_product, category, origin)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(product.id.to_string())
        .bind(&product.code)
        .bind(&product.name)
        .bind(product.unit.as_str())
        .bind(product.is_finished_product)
        .bind(&product.category)
        .bind(&product.origin)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Deleting a product cascades to its BOM edges on both sides.
    pub async fn delete_product(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM products WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::UnknownProduct(id));
        }
        Ok(())
    }

    pub async fn get_product_by_code(&self, code: &str) -> Result<Option<Product>, StoreError> {
        let row = sqlx::query("SELECT * FROM products WHERE code = ?")
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| product_from_row(&r)).transpose()
    }

    /// Validated edge insert. Quantity and self-loop rules are enforced here,
    /// before any write, so the explosion engine can assume them.
    pub async fn insert_edge(&self, edge: &BomEdge) -> Result<(), StoreError> {
        if edge.quantity <= 0.0 {
            return Err(StoreError::NonPositiveQuantity(edge.quantity));
        }
        if edge.parent_product_id == edge.child_product_id {
            return Err(StoreError::SelfLoop(edge.parent_product_id));
        }
        let parent: Option<i64> = sqlx::query_scalar("SELECT 1 FROM products WHERE id = ?")
            .bind(edge.parent_product_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        if parent.is_none() {
            return Err(StoreError::UnknownProduct(edge.parent_product_id));
        }
        let child_unit: Option<String> = sqlx::query_scalar("SELECT unit FROM products WHERE id = ?")
            .bind(edge.child_product_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        let Some(child_unit) = child_unit else {
            return Err(StoreError::UnknownProduct(edge.child_product_id));
        };
        if let Some(edge_unit) = edge.unit {
            let child_unit = parse_unit(&child_unit)?;
            if edge_unit.dimension() != child_unit.dimension() {
                return Err(StoreError::IncompatibleUnit {
                    edge_unit,
                    child_unit,
                });
            }
        }
        let duplicate: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM bom_edges WHERE parent_product_id = ? AND child_product_id = ?",
        )
        .bind(edge.parent_product_id.to_string())
        .bind(edge.child_product_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        if duplicate.is_some() {
            return Err(StoreError::DuplicateEdge {
                parent: edge.parent_product_id,
                child: edge.child_product_id,
            });
        }
        sqlx::query(
            "INSERT INTO bom_edges (parent_product_id, child_product_id, quantity, unit)
             VALUES (?, ?, ?, ?)",
        )
        .bind(edge.parent_product_id.to_string())
        .bind(edge.child_product_id.to_string())
        .bind(edge.quantity)
        .bind(edge.unit.map(|u| u.as_str()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Edges are never updated in place: the parent's edge set is replaced
    /// wholesale in one transaction.
    pub async fn replace_edges(
        &self,
        parent_product_id: Uuid,
        edges: &[BomEdge],
    ) -> Result<(), StoreError> {
        let mut seen = std::collections::HashSet::new();
        for edge in edges {
            if edge.quantity <= 0.0 {
                return Err(StoreError::NonPositiveQuantity(edge.quantity));
            }
            if edge.parent_product_id == edge.child_product_id {
                return Err(StoreError::SelfLoop(edge.parent_product_id));
            }
            if !seen.insert((edge.parent_product_id, edge.child_product_id)) {
                return Err(StoreError::DuplicateEdge {
                    parent: edge.parent_product_id,
                    child: edge.child_product_id,
                });
            }
            let child_unit: Option<String> =
                sqlx::query_scalar("SELECT unit FROM products WHERE id = ?")
                    .bind(edge.child_product_id.to_string())
                    .fetch_optional(&self.pool)
                    .await?;
            let Some(child_unit) = child_unit else {
                return Err(StoreError::UnknownProduct(edge.child_product_id));
            };
            if let Some(edge_unit) = edge.unit {
                let child_unit = parse_unit(&child_unit)?;
                if edge_unit.dimension() != child_unit.dimension() {
                    return Err(StoreError::IncompatibleUnit {
                        edge_unit,
                        child_unit,
                    });
                }
            }
        }
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM bom_edges WHERE parent_product_id = ?")
            .bind(parent_product_id.to_string())
            .execute(&mut *tx)
            .await?;
        for edge in edges {
            sqlx::query(
                "INSERT INTO bom_edges (parent_product_id, child_product_id, quantity, unit)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(edge.parent_product_id.to_string())
            .bind(edge.child_product_id.to_string())
            .bind(edge.quantity)
            .bind(edge.unit.map(|u| u.as_str()))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Snapshot of the whole product/BOM graph for the explosion engine.
    pub async fn load_bom_graph(&self) -> Result<(Vec<Product>, Vec<BomEdge>), StoreError> {
        let product_rows = sqlx::query("SELECT * FROM products ORDER BY code")
            .fetch_all(&self.pool)
            .await?;
        let products = product_rows
            .iter()
            .map(product_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        let edge_rows = sqlx::query("SELECT * FROM bom_edges")
            .fetch_all(&self.pool)
            .await?;
        let edges = edge_rows
            .iter()
            .map(edge_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((products, edges))
    }

    // ------------------------------------------------------------------
    // Emission factors
    // ------------------------------------------------------------------

    pub async fn active_emission_factors(&self) -> Result<Vec<EmissionFactor>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM emission_factors WHERE is_active = 1 ORDER BY activity_name, data_source",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(factor_from_row).collect()
    }

    pub async fn emission_factors_for_source(
        &self,
        data_source: &str,
    ) -> Result<Vec<EmissionFactor>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM emission_factors WHERE data_source = ? ORDER BY activity_name",
        )
        .bind(data_source)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(factor_from_row).collect()
    }

    /// Soft-disable; sync never hard-deletes factors.
    pub async fn set_emission_factor_active(
        &self,
        id: Uuid,
        is_active: bool,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE emission_factors SET is_active = ?, updated_at = ? WHERE id = ?")
            .bind(is_active)
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Idempotent upsert inside a caller-owned transaction.
    ///
    /// Matches an existing row by (data_source, external_id) when the draft
    /// carries an external id, else by (data_source, activity_name).
    /// Present-and-unchanged rows are skipped so re-running a sync against
    /// unchanged source data changes nothing but statistics.
    pub async fn upsert_emission_factor(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        draft: &EmissionFactorDraft,
        data_source: &str,
        sync_batch_id: Uuid,
    ) -> Result<UpsertOutcome, StoreError> {
        let existing = match &draft.external_id {
            Some(external_id) => {
                sqlx::query(
                    "SELECT * FROM emission_factors WHERE data_source = ? AND external_id = ?",
                )
                .bind(data_source)
                .bind(external_id)
                .fetch_optional(&mut **tx)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM emission_factors
                     WHERE data_source = ? AND activity_name = ? AND external_id IS NULL",
                )
                .bind(data_source)
                .bind(&draft.activity_name)
                .fetch_optional(&mut **tx)
                .await?
            }
        };

        let now = Utc::now().to_rfc3339();
        match existing {
            None => {
                sqlx::query(
                    "INSERT INTO emission_factors
                     (id, activity_name, co2e_factor, unit, category, geography, data_source,
                      external_id, sync_batch_id, is_active, created_at, updated_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)",
                )
                .bind(Uuid::new_v4().to_string())
                .bind(&draft.activity_name)
                .bind(draft.co2e_factor)
                .bind(draft.unit.as_str())
                .bind(draft.category.as_str())
                .bind(&draft.geography)
                .bind(data_source)
                .bind(&draft.external_id)
                .bind(sync_batch_id.to_string())
                .bind(&now)
                .bind(&now)
                .execute(&mut **tx)
                .await?;
                Ok(UpsertOutcome::Created)
            }
            Some(row) => {
                let current = factor_from_row(&row)?;
                if factor_matches_draft(&current, draft) {
                    return Ok(UpsertOutcome::Skipped);
                }
                sqlx::query(
                    "UPDATE emission_factors
                     SET activity_name = ?, co2e_factor = ?, unit = ?, category = ?,
                         geography = ?, sync_batch_id = ?, is_active = 1, updated_at = ?
                     WHERE id = ?",
                )
                .bind(&draft.activity_name)
                .bind(draft.co2e_factor)
                .bind(draft.unit.as_str())
                .bind(draft.category.as_str())
                .bind(&draft.geography)
                .bind(sync_batch_id.to_string())
                .bind(&now)
                .bind(current.id.to_string())
                .execute(&mut **tx)
                .await?;
                Ok(UpsertOutcome::Updated)
            }
        }
    }

    // ------------------------------------------------------------------
    // Data sources
    // ------------------------------------------------------------------

    pub async fn insert_data_source(&self, source: &DataSource) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO data_sources
             (id, name, source_type, base_url, sync_frequency, last_sync_at, is_active)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(name) DO UPDATE SET
                source_type = excluded.source_type,
                base_url = excluded.base_url,
                sync_frequency = excluded.sync_frequency,
                is_active = excluded.is_active",
        )
        .bind(source.id.to_string())
        .bind(&source.name)
        .bind(&source.source_type)
        .bind(&source.base_url)
        .bind(&source.sync_frequency)
        .bind(source.last_sync_at.map(|t| t.to_rfc3339()))
        .bind(source.is_active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_data_source_by_name(
        &self,
        name: &str,
    ) -> Result<Option<DataSource>, StoreError> {
        let row = sqlx::query("SELECT * FROM data_sources WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| data_source_from_row(&r)).transpose()
    }

    pub async fn active_data_sources(&self) -> Result<Vec<DataSource>, StoreError> {
        let rows = sqlx::query("SELECT * FROM data_sources WHERE is_active = 1 ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(data_source_from_row).collect()
    }

    pub async fn touch_last_sync(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        data_source_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE data_sources SET last_sync_at = ? WHERE id = ?")
            .bind(at.to_rfc3339())
            .bind(data_source_id.to_string())
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sync logs (append-only audit trail)
    // ------------------------------------------------------------------

    /// Creates and commits the in_progress row up front, before any network
    /// activity, so partial failures stay auditable.
    pub async fn create_sync_log(
        &self,
        data_source_id: Uuid,
        sync_type: SyncType,
    ) -> Result<i64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO data_sync_logs (data_source_id, sync_type, status, started_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(data_source_id.to_string())
        .bind(sync_type.as_str())
        .bind(SyncLogStatus::InProgress.as_str())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Finalize within the sync transaction (success path).
    pub async fn finalize_sync_log_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        id: i64,
        status: SyncLogStatus,
        counts: &SyncCounts,
        error_message: Option<&str>,
        error_details: Option<&serde_json::Value>,
    ) -> Result<(), StoreError> {
        finalize_log(&mut **tx, id, status, counts, error_message, error_details).await
    }

    /// Finalize outside any transaction (failure path, after rollback).
    pub async fn finalize_sync_log(
        &self,
        id: i64,
        status: SyncLogStatus,
        counts: &SyncCounts,
        error_message: Option<&str>,
        error_details: Option<&serde_json::Value>,
    ) -> Result<(), StoreError> {
        finalize_log(&self.pool, id, status, counts, error_message, error_details).await
    }

    pub async fn get_sync_log(&self, id: i64) -> Result<Option<DataSyncLog>, StoreError> {
        let row = sqlx::query("SELECT * FROM data_sync_logs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| sync_log_from_row(&r)).transpose()
    }

    // ------------------------------------------------------------------
    // Seeding
    // ------------------------------------------------------------------

    /// Apply a YAML seed file. Existing products and edges are left alone so
    /// seeding is re-runnable; factors and data sources upsert.
    pub async fn apply_seed(&self, seed: &SeedFile) -> Result<SeedSummary, StoreError> {
        let mut summary = SeedSummary::default();

        for sp in &seed.products {
            let unit = parse_unit(&sp.unit)?;
            let product = Product {
                id: Uuid::new_v4(),
                code: sp.code.clone(),
                name: sp.name.clone(),
                unit,
                is_finished_product: sp.finished,
                category: sp.category.clone(),
                origin: sp.origin.clone(),
            };
            match self.insert_product(&product).await {
                Ok(()) => summary.products += 1,
                Err(StoreError::DuplicateProductCode(_)) => {}
                Err(err) => return Err(err),
            }
        }

        for se in &seed.bom {
            let parent = self
                .get_product_by_code(&se.parent)
                .await?
                .ok_or_else(|| StoreError::Corrupt(format!("seed parent code {}", se.parent)))?;
            let child = self
                .get_product_by_code(&se.child)
                .await?
                .ok_or_else(|| StoreError::Corrupt(format!("seed child code {}", se.child)))?;
            let unit = se.unit.as_deref().map(parse_unit).transpose()?;
            let edge = BomEdge {
                parent_product_id: parent.id,
                child_product_id: child.id,
                quantity: se.quantity,
                unit,
            };
            match self.insert_edge(&edge).await {
                Ok(()) => summary.edges += 1,
                Err(StoreError::DuplicateEdge { .. }) => {}
                Err(err) => return Err(err),
            }
        }

        if !seed.emission_factors.is_empty() {
            let batch_id = Uuid::new_v4();
            let mut tx = self.pool.begin().await?;
            for sf in &seed.emission_factors {
                let mut draft =
                    EmissionFactorDraft::new(&sf.activity_name, sf.co2e_factor, parse_unit(&sf.unit)?);
                if let Some(category) = &sf.category {
                    draft = draft.with_category(
                        category
                            .parse()
                            .map_err(|_| StoreError::Corrupt(format!("seed category {category}")))?,
                    );
                }
                if let Some(geography) = &sf.geography {
                    draft = draft.with_geography(geography);
                }
                let source = sf.data_source.as_deref().unwrap_or("seed");
                self.upsert_emission_factor(&mut tx, &draft, source, batch_id)
                    .await?;
                summary.factors += 1;
            }
            tx.commit().await?;
        }

        for ss in &seed.data_sources {
            self.insert_data_source(&DataSource {
                id: Uuid::new_v4(),
                name: ss.name.clone(),
                source_type: ss.source_type.clone(),
                base_url: ss.base_url.clone(),
                sync_frequency: ss.sync_frequency.clone(),
                last_sync_at: None,
                is_active: ss.is_active,
            })
            .await?;
            summary.data_sources += 1;
        }

        info!(
            products = summary.products,
            edges = summary.edges,
            factors = summary.factors,
            data_sources = summary.data_sources,
            "seed applied"
        );
        Ok(summary)
    }
}

async fn finalize_log<'e, E>(
    executor: E,
    id: i64,
    status: SyncLogStatus,
    counts: &SyncCounts,
    error_message: Option<&str>,
    error_details: Option<&serde_json::Value>,
) -> Result<(), StoreError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let details = error_details
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| StoreError::Corrupt(format!("error_details: {e}")))?;
    let result = sqlx::query(
        "UPDATE data_sync_logs
         SET status = ?, records_processed = ?, records_created = ?, records_updated = ?,
             records_skipped = ?, records_failed = ?, error_message = ?, error_details = ?,
             completed_at = ?
         WHERE id = ? AND status NOT IN ('completed', 'failed')",
    )
    .bind(status.as_str())
    .bind(counts.processed as i64)
    .bind(counts.created as i64)
    .bind(counts.updated as i64)
    .bind(counts.skipped as i64)
    .bind(counts.failed as i64)
    .bind(error_message)
    .bind(details)
    .bind(Utc::now().to_rfc3339())
    .bind(id)
    .execute(executor)
    .await?;
    if result.rows_affected() == 0 {
        return Err(StoreError::UnknownSyncLog(id));
    }
    Ok(())
}

fn factor_matches_draft(current: &EmissionFactor, draft: &EmissionFactorDraft) -> bool {
    current.is_active
        && current.activity_name == draft.activity_name
        && (current.co2e_factor - draft.co2e_factor).abs() < 1e-12
        && current.unit == draft.unit
        && current.category == draft.category
        && current.geography == draft.geography
}

fn parse_unit(token: &str) -> Result<Unit, StoreError> {
    token
        .parse()
        .map_err(|_| StoreError::Corrupt(format!("unit token {token}")))
}

fn parse_uuid(text: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(text).map_err(|_| StoreError::Corrupt(format!("uuid {text}")))
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| StoreError::Corrupt(format!("timestamp {text}")))
}

fn product_from_row(row: &SqliteRow) -> Result<Product, StoreError> {
    let id: String = row.try_get("id")?;
    let unit: String = row.try_get("unit")?;
    Ok(Product {
        id: parse_uuid(&id)?,
        code: row.try_get("code")?,
        name: row.try_get("name")?,
        unit: parse_unit(&unit)?,
        is_finished_product: row.try_get("is_finished_product")?,
        category: row.try_get("category")?,
        origin: row.try_get("origin")?,
    })
}

fn edge_from_row(row: &SqliteRow) -> Result<BomEdge, StoreError> {
    let parent: String = row.try_get("parent_product_id")?;
    let child: String = row.try_get("child_product_id")?;
    let unit: Option<String> = row.try_get("unit")?;
    Ok(BomEdge {
        parent_product_id: parse_uuid(&parent)?,
        child_product_id: parse_uuid(&child)?,
        quantity: row.try_get("quantity")?,
        unit: unit.as_deref().map(parse_unit).transpose()?,
    })
}

fn factor_from_row(row: &SqliteRow) -> Result<EmissionFactor, StoreError> {
    let id: String = row.try_get("id")?;
    let unit: String = row.try_get("unit")?;
    let category: String = row.try_get("category")?;
    let sync_batch_id: Option<String> = row.try_get("sync_batch_id")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    Ok(EmissionFactor {
        id: parse_uuid(&id)?,
        activity_name: row.try_get("activity_name")?,
        co2e_factor: row.try_get("co2e_factor")?,
        unit: parse_unit(&unit)?,
        category: category
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("category {category}")))?,
        geography: row.try_get("geography")?,
        data_source: row.try_get("data_source")?,
        external_id: row.try_get("external_id")?,
        sync_batch_id: sync_batch_id.as_deref().map(parse_uuid).transpose()?,
        is_active: row.try_get("is_active")?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn data_source_from_row(row: &SqliteRow) -> Result<DataSource, StoreError> {
    let id: String = row.try_get("id")?;
    let last_sync_at: Option<String> = row.try_get("last_sync_at")?;
    Ok(DataSource {
        id: parse_uuid(&id)?,
        name: row.try_get("name")?,
        source_type: row.try_get("source_type")?,
        base_url: row.try_get("base_url")?,
        sync_frequency: row.try_get("sync_frequency")?,
        last_sync_at: last_sync_at.as_deref().map(parse_timestamp).transpose()?,
        is_active: row.try_get("is_active")?,
    })
}

fn sync_log_from_row(row: &SqliteRow) -> Result<DataSyncLog, StoreError> {
    let data_source_id: String = row.try_get("data_source_id")?;
    let sync_type: String = row.try_get("sync_type")?;
    let status: String = row.try_get("status")?;
    let error_details: Option<String> = row.try_get("error_details")?;
    let started_at: String = row.try_get("started_at")?;
    let completed_at: Option<String> = row.try_get("completed_at")?;
    Ok(DataSyncLog {
        id: row.try_get("id")?,
        data_source_id: parse_uuid(&data_source_id)?,
        sync_type: match sync_type.as_str() {
            "manual" => SyncType::Manual,
            "scheduled" => SyncType::Scheduled,
            other => return Err(StoreError::Corrupt(format!("sync_type {other}"))),
        },
        status: status
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("status {status}")))?,
        counts: SyncCounts {
            processed: row.try_get::<i64, _>("records_processed")? as u64,
            created: row.try_get::<i64, _>("records_created")? as u64,
            updated: row.try_get::<i64, _>("records_updated")? as u64,
            skipped: row.try_get::<i64, _>("records_skipped")? as u64,
            failed: row.try_get::<i64, _>("records_failed")? as u64,
        },
        error_message: row.try_get("error_message")?,
        error_details: error_details
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| StoreError::Corrupt(format!("error_details: {e}")))?,
        started_at: parse_timestamp(&started_at)?,
        completed_at: completed_at.as_deref().map(parse_timestamp).transpose()?,
    })
}

// ----------------------------------------------------------------------
// Seed file shapes
// ----------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SeedFile {
    #[serde(default)]
    pub products: Vec<SeedProduct>,
    #[serde(default)]
    pub bom: Vec<SeedEdge>,
    #[serde(default)]
    pub emission_factors: Vec<SeedFactor>,
    #[serde(default)]
    pub data_sources: Vec<SeedDataSource>,
}

impl SeedFile {
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedProduct {
    pub code: String,
    pub name: String,
    pub unit: String,
    #[serde(default)]
    pub finished: bool,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub origin: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedEdge {
    pub parent: String,
    pub child: String,
    pub quantity: f64,
    #[serde(default)]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedFactor {
    pub activity_name: String,
    pub co2e_factor: f64,
    pub unit: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub geography: Option<String>,
    #[serde(default)]
    pub data_source: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedDataSource {
    pub name: String,
    pub source_type: String,
    pub base_url: String,
    #[serde(default)]
    pub sync_frequency: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedSummary {
    pub products: usize,
    pub edges: usize,
    pub factors: usize,
    pub data_sources: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(code: &str, finished: bool) -> Product {
        Product {
            id: Uuid::new_v4(),
            code: code.to_string(),
            name: code.to_string(),
            unit: Unit::Kg,
            is_finished_product: finished,
            category: None,
            origin: None,
        }
    }

    async fn store_with_products(codes: &[(&str, bool)]) -> (Store, Vec<Product>) {
        let store = Store::in_memory().await.unwrap();
        let mut products = Vec::new();
        for (code, finished) in codes {
            let p = product(code, *finished);
            store.insert_product(&p).await.unwrap();
            products.push(p);
        }
        (store, products)
    }

    #[tokio::test]
    async fn edge_validation_rejects_bad_input() {
        let (store, products) = store_with_products(&[("shirt", true), ("cotton", false)]).await;
        let shirt = &products[0];
        let cotton = &products[1];

        let zero = BomEdge {
            parent_product_id: shirt.id,
            child_product_id: cotton.id,
            quantity: 0.0,
            unit: None,
        };
        assert!(matches!(
            store.insert_edge(&zero).await,
            Err(StoreError::NonPositiveQuantity(_))
        ));

        let negative = BomEdge {
            quantity: -1.5,
            ..zero.clone()
        };
        assert!(matches!(
            store.insert_edge(&negative).await,
            Err(StoreError::NonPositiveQuantity(_))
        ));

        let self_loop = BomEdge {
            parent_product_id: shirt.id,
            child_product_id: shirt.id,
            quantity: 1.0,
            unit: None,
        };
        assert!(matches!(
            store.insert_edge(&self_loop).await,
            Err(StoreError::SelfLoop(_))
        ));

        let good = BomEdge {
            parent_product_id: shirt.id,
            child_product_id: cotton.id,
            quantity: 0.18,
            unit: Some(Unit::Kg),
        };
        store.insert_edge(&good).await.unwrap();
        assert!(matches!(
            store.insert_edge(&good).await,
            Err(StoreError::DuplicateEdge { .. })
        ));
    }

    #[tokio::test]
    async fn edge_unit_must_match_child_dimension() {
        let (store, products) = store_with_products(&[("bottle", true), ("water", false)]).await;
        let bottle = &products[0];
        let water = &products[1]; // unit kg in this fixture

        let mismatched = BomEdge {
            parent_product_id: bottle.id,
            child_product_id: water.id,
            quantity: 0.5,
            unit: Some(Unit::L),
        };
        assert!(matches!(
            store.insert_edge(&mismatched).await,
            Err(StoreError::IncompatibleUnit { .. })
        ));

        // Same dimension is fine even when the scale differs.
        let grams = BomEdge {
            unit: Some(Unit::G),
            ..mismatched
        };
        store.insert_edge(&grams).await.unwrap();
    }

    #[tokio::test]
    async fn replace_edges_swaps_the_parent_edge_set_atomically() {
        let (store, products) =
            store_with_products(&[("root", true), ("old", false), ("new", false)]).await;
        let (root, old, new) = (&products[0], &products[1], &products[2]);

        store
            .insert_edge(&BomEdge {
                parent_product_id: root.id,
                child_product_id: old.id,
                quantity: 2.0,
                unit: None,
            })
            .await
            .unwrap();

        store
            .replace_edges(
                root.id,
                &[BomEdge {
                    parent_product_id: root.id,
                    child_product_id: new.id,
                    quantity: 3.0,
                    unit: Some(Unit::Kg),
                }],
            )
            .await
            .unwrap();

        let (_, edges) = store.load_bom_graph().await.unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].child_product_id, new.id);
        assert!((edges[0].quantity - 3.0).abs() < 1e-12);

        // A bad replacement set leaves the current edges untouched.
        let err = store
            .replace_edges(
                root.id,
                &[BomEdge {
                    parent_product_id: root.id,
                    child_product_id: old.id,
                    quantity: -1.0,
                    unit: None,
                }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NonPositiveQuantity(_)));
        let (_, edges) = store.load_bom_graph().await.unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].child_product_id, new.id);
    }

    #[tokio::test]
    async fn deleting_a_product_cascades_to_both_edge_sides() {
        let (store, products) =
            store_with_products(&[("a", true), ("b", false), ("c", false)]).await;
        let (a, b, c) = (&products[0], &products[1], &products[2]);
        for (parent, child) in [(a, b), (b, c)] {
            store
                .insert_edge(&BomEdge {
                    parent_product_id: parent.id,
                    child_product_id: child.id,
                    quantity: 1.0,
                    unit: None,
                })
                .await
                .unwrap();
        }

        store.delete_product(b.id).await.unwrap();
        let (_, edges) = store.load_bom_graph().await.unwrap();
        assert!(edges.is_empty());
    }

    #[tokio::test]
    async fn upsert_classifies_created_skipped_updated() {
        let store = Store::in_memory().await.unwrap();
        let batch = Uuid::new_v4();
        let draft = EmissionFactorDraft::new("cotton", 5.0, Unit::Kg);

        let mut tx = store.begin().await.unwrap();
        let first = store
            .upsert_emission_factor(&mut tx, &draft, "defra", batch)
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(first, UpsertOutcome::Created);

        // Unchanged re-run skips and leaves the row alone.
        let mut tx = store.begin().await.unwrap();
        let second = store
            .upsert_emission_factor(&mut tx, &draft, "defra", Uuid::new_v4())
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(second, UpsertOutcome::Skipped);

        let changed = EmissionFactorDraft::new("cotton", 5.5, Unit::Kg);
        let mut tx = store.begin().await.unwrap();
        let third = store
            .upsert_emission_factor(&mut tx, &changed, "defra", Uuid::new_v4())
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(third, UpsertOutcome::Updated);

        let factors = store.emission_factors_for_source("defra").await.unwrap();
        assert_eq!(factors.len(), 1);
        assert!((factors[0].co2e_factor - 5.5).abs() < 1e-12);
    }

    #[tokio::test]
    async fn soft_disable_hides_factor_from_active_set() {
        let store = Store::in_memory().await.unwrap();
        let mut tx = store.begin().await.unwrap();
        store
            .upsert_emission_factor(
                &mut tx,
                &EmissionFactorDraft::new("steel", 1.8, Unit::Kg),
                "seed",
                Uuid::new_v4(),
            )
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let factors = store.emission_factors_for_source("seed").await.unwrap();
        store
            .set_emission_factor_active(factors[0].id, false)
            .await
            .unwrap();
        assert!(store.active_emission_factors().await.unwrap().is_empty());
        assert_eq!(store.emission_factors_for_source("seed").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sync_log_lifecycle_and_unknown_id() {
        let store = Store::in_memory().await.unwrap();
        let source = DataSource {
            id: Uuid::new_v4(),
            name: "epa".to_string(),
            source_type: "epa".to_string(),
            base_url: "file:///tmp/epa.xlsx".to_string(),
            sync_frequency: None,
            last_sync_at: None,
            is_active: true,
        };
        store.insert_data_source(&source).await.unwrap();

        let log_id = store
            .create_sync_log(source.id, SyncType::Manual)
            .await
            .unwrap();
        let log = store.get_sync_log(log_id).await.unwrap().unwrap();
        assert_eq!(log.status, SyncLogStatus::InProgress);
        assert!(log.completed_at.is_none());

        let counts = SyncCounts {
            processed: 3,
            created: 2,
            updated: 0,
            skipped: 1,
            failed: 0,
        };
        store
            .finalize_sync_log(log_id, SyncLogStatus::Completed, &counts, None, None)
            .await
            .unwrap();
        let log = store.get_sync_log(log_id).await.unwrap().unwrap();
        assert_eq!(log.status, SyncLogStatus::Completed);
        assert_eq!(log.counts, counts);
        assert!(log.completed_at.is_some());

        // Terminal rows are never mutated again.
        assert!(matches!(
            store
                .finalize_sync_log(log_id, SyncLogStatus::Failed, &counts, Some("late"), None)
                .await,
            Err(StoreError::UnknownSyncLog(_))
        ));

        assert!(store.get_sync_log(9999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn seed_is_rerunnable() {
        let store = Store::in_memory().await.unwrap();
        let seed = SeedFile::from_yaml(
            r#"
products:
  - { code: tshirt, name: T-Shirt, unit: unit, finished: true }
  - { code: cotton, name: cotton, unit: kg }
bom:
  - { parent: tshirt, child: cotton, quantity: 0.18, unit: kg }
emission_factors:
  - { activity_name: cotton, co2e_factor: 5.0, unit: kg }
data_sources:
  - { name: defra, source_type: defra, base_url: "file:///tmp/defra.xlsx" }
"#,
        )
        .unwrap();

        let first = store.apply_seed(&seed).await.unwrap();
        assert_eq!(first.products, 2);
        assert_eq!(first.edges, 1);

        let second = store.apply_seed(&seed).await.unwrap();
        assert_eq!(second.products, 0);
        assert_eq!(second.edges, 0);

        let (products, edges) = store.load_bom_graph().await.unwrap();
        assert_eq!(products.len(), 2);
        assert_eq!(edges.len(), 1);
        assert!(store.get_data_source_by_name("defra").await.unwrap().is_some());
    }
}
