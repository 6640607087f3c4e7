//! Sync orchestration: resolve a data source, run its connector pipeline,
//! and land the result in the store under one transaction with an
//! append-only audit log.

use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use pcf_connectors::{connector_for_source, ConnectorError, RowError, SourceConnector};
use pcf_core::{DataSource, DataSyncLog, SyncCounts, SyncLogStatus, SyncType};
use pcf_store::{
    FetcherConfig, HttpFetcher, PayloadArchive, Store, StoreError, UpsertOutcome,
};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

pub mod runner;

pub use runner::{build_scheduler, JobRunner, JobState, JobTimeouts, RetryPolicy, SyncJobRequest};

pub const CRATE_NAME: &str = "pcf-sync";

/// How many row-level error details are kept on the log row.
const MAX_LOGGED_ROW_ERRORS: usize = 25;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("data source {0} not found")]
    SourceNotFound(String),
    #[error("data source {0} is inactive")]
    SourceInactive(String),
    #[error("no connector registered for source type {0}")]
    NoConnector(String),
    #[error("sync cancelled before {stage}")]
    Cancelled { stage: &'static str },
    #[error("sync exceeded its hard time ceiling")]
    HardTimeout,
    #[error(transparent)]
    Connector(#[from] ConnectorError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SyncError {
    /// Configuration and structural errors are definitive; only transport
    /// faults and timeouts are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Connector(err) => err.is_transient(),
            SyncError::Cancelled { .. } | SyncError::HardTimeout => true,
            SyncError::SourceNotFound(_)
            | SyncError::SourceInactive(_)
            | SyncError::NoConnector(_)
            | SyncError::Store(_) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    pub dry_run: bool,
    /// Bypass the data-source active flag; everything else still applies.
    pub force: bool,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub archive_dir: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:pcf.db".to_string()),
            archive_dir: std::env::var("PCF_ARCHIVE_DIR").ok().map(PathBuf::from),
            user_agent: std::env::var("PCF_USER_AGENT")
                .unwrap_or_else(|_| "pcf-sync/0.1".to_string()),
            http_timeout_secs: std::env::var("PCF_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            scheduler_enabled: std::env::var("PCF_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
        }
    }
}

/// Result of one completed (or dry-run) sync invocation.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub log_id: i64,
    pub data_source: String,
    pub sync_type: SyncType,
    pub batch_id: Uuid,
    pub counts: SyncCounts,
    pub dry_run: bool,
    pub row_errors: Vec<RowError>,
}

/// User-visible status vocabulary; a fixed set, never an error for unknown
/// ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    NotFound,
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl From<SyncLogStatus> for SyncStatus {
    fn from(status: SyncLogStatus) -> Self {
        match status {
            SyncLogStatus::Pending => SyncStatus::Pending,
            SyncLogStatus::InProgress => SyncStatus::InProgress,
            SyncLogStatus::Completed => SyncStatus::Completed,
            SyncLogStatus::Failed => SyncStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncStatusReport {
    pub status: SyncStatus,
    pub log: Option<DataSyncLog>,
}

/// A resolved sync: configuration checks passed and the in_progress log row
/// is already committed.
pub struct PreparedSync {
    pub log_id: i64,
    source: DataSource,
    connector: Box<dyn SourceConnector>,
    sync_type: SyncType,
    options: SyncOptions,
    batch_id: Uuid,
}

pub struct SyncOrchestrator {
    store: Store,
    http: HttpFetcher,
    archive: Option<PayloadArchive>,
}

impl SyncOrchestrator {
    pub fn new(store: Store, config: &SyncConfig) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(FetcherConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: config.user_agent.clone(),
            ..Default::default()
        })?;
        Ok(Self {
            store,
            http,
            archive: config.archive_dir.clone().map(PayloadArchive::new),
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Configuration resolution. Fails fast, before any log row exists, when
    /// the source is missing/inactive or no connector is registered; these
    /// are definitive errors, not transient faults.
    pub async fn prepare(
        &self,
        source_name: &str,
        sync_type: SyncType,
        options: SyncOptions,
    ) -> Result<PreparedSync, SyncError> {
        let source = self
            .store
            .get_data_source_by_name(source_name)
            .await?
            .ok_or_else(|| SyncError::SourceNotFound(source_name.to_string()))?;
        if !source.is_active && !options.force {
            return Err(SyncError::SourceInactive(source_name.to_string()));
        }
        let connector = connector_for_source(&source.source_type)
            .ok_or_else(|| SyncError::NoConnector(source.source_type.clone()))?;

        // The audit row is committed before any network activity so a
        // mid-flight crash stays visible.
        let log_id = self.store.create_sync_log(source.id, sync_type).await?;
        info!(
            source = %source.name,
            log_id,
            sync_type = sync_type.as_str(),
            dry_run = options.dry_run,
            "sync started"
        );
        Ok(PreparedSync {
            log_id,
            source,
            connector,
            sync_type,
            options,
            batch_id: Uuid::new_v4(),
        })
    }

    /// Run the prepared sync. The log row is always finalized before an error
    /// propagates; it is never left in_progress by this path.
    pub async fn execute(
        &self,
        prepared: PreparedSync,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        let log_id = prepared.log_id;
        let source_name = prepared.source.name.clone();
        match self.pipeline(prepared, cancel).await {
            Ok(report) => {
                info!(
                    source = %source_name,
                    log_id,
                    created = report.counts.created,
                    updated = report.counts.updated,
                    skipped = report.counts.skipped,
                    failed = report.counts.failed,
                    "sync completed"
                );
                Ok(report)
            }
            Err(err) => {
                let details = serde_json::json!({ "error": err.to_string() });
                if let Err(finalize_err) = self
                    .store
                    .finalize_sync_log(
                        log_id,
                        SyncLogStatus::Failed,
                        &SyncCounts::default(),
                        Some(&err.to_string()),
                        Some(&details),
                    )
                    .await
                {
                    warn!(log_id, error = %finalize_err, "failed to finalize sync log");
                }
                warn!(source = %source_name, log_id, error = %err, "sync failed");
                Err(err)
            }
        }
    }

    /// prepare + execute with no external cancellation.
    pub async fn run_sync(
        &self,
        source_name: &str,
        sync_type: SyncType,
        options: SyncOptions,
    ) -> Result<SyncReport, SyncError> {
        let prepared = self.prepare(source_name, sync_type, options).await?;
        self.execute(prepared, &CancellationToken::new()).await
    }

    async fn pipeline(
        &self,
        prepared: PreparedSync,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        let PreparedSync {
            log_id,
            source,
            connector,
            sync_type,
            options,
            batch_id,
        } = prepared;

        ensure_not_cancelled(cancel, "fetch")?;
        let outcome = connector.execute_sync(&self.http, &source).await?;

        if let Some(archive) = &self.archive {
            let extension = match source.source_type.as_str() {
                "epa" | "defra" => "xlsx",
                "exiobase" => "zip",
                _ => "bin",
            };
            if let Err(err) = archive
                .store(
                    &source.name,
                    outcome.payload.fetched_at,
                    extension,
                    &outcome.payload.bytes,
                )
                .await
            {
                warn!(source = %source.name, error = %err, "payload archive write failed");
            }
        }

        let mut counts = SyncCounts {
            processed: outcome.processed as u64,
            failed: outcome.errors.len() as u64,
            ..SyncCounts::default()
        };

        ensure_not_cancelled(cancel, "load")?;

        if options.dry_run {
            let details = log_details(&outcome.errors, true);
            self.store
                .finalize_sync_log(
                    log_id,
                    SyncLogStatus::Completed,
                    &counts,
                    None,
                    Some(&details),
                )
                .await?;
            return Ok(SyncReport {
                log_id,
                data_source: source.name,
                sync_type,
                batch_id,
                counts,
                dry_run: true,
                row_errors: outcome.errors,
            });
        }

        // All store mutations from one sync commit or roll back together
        // with the log finalization.
        let mut tx = self.store.begin().await?;
        for draft in &outcome.drafts {
            ensure_not_cancelled(cancel, "load")?;
            match self
                .store
                .upsert_emission_factor(&mut tx, draft, &source.name, batch_id)
                .await?
            {
                UpsertOutcome::Created => counts.created += 1,
                UpsertOutcome::Updated => counts.updated += 1,
                UpsertOutcome::Skipped => counts.skipped += 1,
            }
        }
        self.store
            .touch_last_sync(&mut tx, source.id, Utc::now())
            .await?;
        let details = log_details(&outcome.errors, false);
        self.store
            .finalize_sync_log_tx(
                &mut tx,
                log_id,
                SyncLogStatus::Completed,
                &counts,
                None,
                Some(&details),
            )
            .await?;
        tx.commit().await.map_err(StoreError::from)?;

        Ok(SyncReport {
            log_id,
            data_source: source.name,
            sync_type,
            batch_id,
            counts,
            dry_run: false,
            row_errors: outcome.errors,
        })
    }

    /// Finalize a log row the runner had to abandon (hard time ceiling).
    /// Already-terminal rows are left untouched.
    pub async fn fail_log(&self, log_id: i64, message: &str) {
        match self
            .store
            .finalize_sync_log(
                log_id,
                SyncLogStatus::Failed,
                &SyncCounts::default(),
                Some(message),
                None,
            )
            .await
        {
            Ok(()) | Err(StoreError::UnknownSyncLog(_)) => {}
            Err(err) => warn!(log_id, error = %err, "failed to finalize abandoned sync log"),
        }
    }

    /// Status check by log id; an unknown id is `not_found`, never an error.
    pub async fn sync_status(&self, log_id: i64) -> Result<SyncStatusReport, SyncError> {
        match self.store.get_sync_log(log_id).await? {
            Some(log) => Ok(SyncStatusReport {
                status: log.status.into(),
                log: Some(log),
            }),
            None => Ok(SyncStatusReport {
                status: SyncStatus::NotFound,
                log: None,
            }),
        }
    }
}

fn ensure_not_cancelled(
    cancel: &CancellationToken,
    stage: &'static str,
) -> Result<(), SyncError> {
    if cancel.is_cancelled() {
        return Err(SyncError::Cancelled { stage });
    }
    Ok(())
}

fn log_details(errors: &[RowError], dry_run: bool) -> serde_json::Value {
    let truncated: Vec<_> = errors.iter().take(MAX_LOGGED_ROW_ERRORS).collect();
    serde_json::json!({
        "dry_run": dry_run,
        "row_errors": truncated,
        "row_errors_truncated": errors.len() > MAX_LOGGED_ROW_ERRORS,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pcf_core::DataSource;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    const MATRIX: &str = "stressor\tDE_Chemicals\tFR_Textiles\n\
CO2 - combustion\t0.4\t1.2\n\
CH4 - combustion\t0.01\t0.002\n";

    fn exiobase_archive(matrix: &str) -> Vec<u8> {
        let mut buf = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            writer
                .start_file("satellite/F.txt", SimpleFileOptions::default())
                .expect("start file");
            writer.write_all(matrix.as_bytes()).expect("write file");
            writer.finish().expect("finish zip");
        }
        buf.into_inner()
    }

    struct Env {
        orchestrator: SyncOrchestrator,
        dir: tempfile::TempDir,
    }

    impl Env {
        async fn source(&self, name: &str, source_type: &str, base_url: &str, active: bool) {
            self.orchestrator
                .store()
                .insert_data_source(&DataSource {
                    id: Uuid::new_v4(),
                    name: name.to_string(),
                    source_type: source_type.to_string(),
                    base_url: base_url.to_string(),
                    sync_frequency: None,
                    last_sync_at: None,
                    is_active: active,
                })
                .await
                .expect("insert source");
        }

        fn write_archive(&self, matrix: &str) -> String {
            let path = self.dir.path().join("exiobase.zip");
            std::fs::write(&path, exiobase_archive(matrix)).expect("write archive");
            format!("file://{}", path.display())
        }
    }

    async fn env() -> Env {
        let store = Store::in_memory().await.expect("store");
        let config = SyncConfig {
            database_url: "sqlite::memory:".to_string(),
            archive_dir: None,
            user_agent: "pcf-test".to_string(),
            http_timeout_secs: 5,
            scheduler_enabled: false,
        };
        Env {
            orchestrator: SyncOrchestrator::new(store, &config).expect("orchestrator"),
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    #[tokio::test]
    async fn configuration_errors_fail_fast_without_log_rows() {
        let env = env().await;

        let err = env
            .orchestrator
            .run_sync("nope", SyncType::Manual, SyncOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::SourceNotFound(_)));
        assert!(!err.is_transient());

        env.source("dormant", "epa", "file:///unused.xlsx", false).await;
        let err = env
            .orchestrator
            .run_sync("dormant", SyncType::Manual, SyncOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::SourceInactive(_)));

        env.source("custom", "homegrown", "file:///unused.bin", true).await;
        let err = env
            .orchestrator
            .run_sync("custom", SyncType::Manual, SyncOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NoConnector(_)));

        // None of the above got far enough to open an audit row.
        assert!(env.orchestrator.store().get_sync_log(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sync_is_idempotent_and_audited() {
        let env = env().await;
        let url = env.write_archive(MATRIX);
        env.source("exiobase", "exiobase", &url, true).await;

        let first = env
            .orchestrator
            .run_sync("exiobase", SyncType::Manual, SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(first.counts.processed, 2);
        assert_eq!(first.counts.created, 2);
        assert_eq!(first.counts.failed, 0);

        let status = env.orchestrator.sync_status(first.log_id).await.unwrap();
        assert_eq!(status.status, SyncStatus::Completed);
        let log = status.log.unwrap();
        assert_eq!(log.sync_type, SyncType::Manual);
        assert!(log.completed_at.is_some());

        let factors_before = env
            .orchestrator
            .store()
            .emission_factors_for_source("exiobase")
            .await
            .unwrap();

        // Second run against unchanged source data: store untouched, all
        // rows counted as skipped.
        let second = env
            .orchestrator
            .run_sync("exiobase", SyncType::Scheduled, SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(second.counts.created, 0);
        assert_eq!(second.counts.updated, 0);
        assert_eq!(second.counts.skipped, 2);
        assert_ne!(second.log_id, first.log_id);

        let factors_after = env
            .orchestrator
            .store()
            .emission_factors_for_source("exiobase")
            .await
            .unwrap();
        assert_eq!(factors_before, factors_after);

        let source = env
            .orchestrator
            .store()
            .get_data_source_by_name("exiobase")
            .await
            .unwrap()
            .unwrap();
        assert!(source.last_sync_at.is_some());
    }

    #[tokio::test]
    async fn changed_source_record_updates_exactly_that_factor() {
        let env = env().await;
        let url = env.write_archive(MATRIX);
        env.source("exiobase", "exiobase", &url, true).await;
        env.orchestrator
            .run_sync("exiobase", SyncType::Manual, SyncOptions::default())
            .await
            .unwrap();

        // Bump one stressor cell for DE_Chemicals only.
        let changed = MATRIX.replace("CO2 - combustion\t0.4\t1.2", "CO2 - combustion\t0.5\t1.2");
        env.write_archive(&changed);

        let report = env
            .orchestrator
            .run_sync("exiobase", SyncType::Manual, SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(report.counts.updated, 1);
        assert_eq!(report.counts.skipped, 1);
        assert_eq!(report.counts.created, 0);

        let factors = env
            .orchestrator
            .store()
            .emission_factors_for_source("exiobase")
            .await
            .unwrap();
        let de = factors
            .iter()
            .find(|f| f.external_id.as_deref() == Some("DE_Chemicals"))
            .unwrap();
        assert!((de.co2e_factor - (0.5 + 0.01 * pcf_core::GWP_CH4)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn dry_run_reports_without_writing() {
        let env = env().await;
        let url = env.write_archive(MATRIX);
        env.source("exiobase", "exiobase", &url, true).await;

        let report = env
            .orchestrator
            .run_sync(
                "exiobase",
                SyncType::Manual,
                SyncOptions {
                    dry_run: true,
                    force: false,
                },
            )
            .await
            .unwrap();
        assert!(report.dry_run);
        assert_eq!(report.counts.processed, 2);

        assert!(env
            .orchestrator
            .store()
            .emission_factors_for_source("exiobase")
            .await
            .unwrap()
            .is_empty());

        let status = env.orchestrator.sync_status(report.log_id).await.unwrap();
        assert_eq!(status.status, SyncStatus::Completed);
        let details = status.log.unwrap().error_details.unwrap();
        assert_eq!(details["dry_run"], serde_json::json!(true));
    }

    #[tokio::test]
    async fn connector_failure_finalizes_the_log_before_propagating() {
        let env = env().await;
        env.source("exiobase", "exiobase", "file:///missing/archive.zip", true)
            .await;

        let err = env
            .orchestrator
            .run_sync("exiobase", SyncType::Manual, SyncOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Connector(_)));

        let status = env.orchestrator.sync_status(1).await.unwrap();
        assert_eq!(status.status, SyncStatus::Failed);
        assert!(status.log.unwrap().error_message.is_some());
    }

    #[tokio::test]
    async fn cancellation_fails_the_log_and_writes_nothing() {
        let env = env().await;
        let url = env.write_archive(MATRIX);
        env.source("exiobase", "exiobase", &url, true).await;

        let prepared = env
            .orchestrator
            .prepare("exiobase", SyncType::Manual, SyncOptions::default())
            .await
            .unwrap();
        let log_id = prepared.log_id;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = env.orchestrator.execute(prepared, &cancel).await.unwrap_err();
        assert!(matches!(err, SyncError::Cancelled { .. }));
        assert!(err.is_transient());

        let status = env.orchestrator.sync_status(log_id).await.unwrap();
        assert_eq!(status.status, SyncStatus::Failed);
        assert!(env
            .orchestrator
            .store()
            .emission_factors_for_source("exiobase")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn inactive_source_can_be_forced() {
        let env = env().await;
        let url = env.write_archive(MATRIX);
        env.source("exiobase", "exiobase", &url, false).await;

        let report = env
            .orchestrator
            .run_sync(
                "exiobase",
                SyncType::Manual,
                SyncOptions {
                    dry_run: false,
                    force: true,
                },
            )
            .await
            .unwrap();
        assert_eq!(report.counts.created, 2);
    }

    #[tokio::test]
    async fn unknown_log_id_reports_not_found() {
        let env = env().await;
        let status = env.orchestrator.sync_status(424242).await.unwrap();
        assert_eq!(status.status, SyncStatus::NotFound);
        assert!(status.log.is_none());
    }
}
