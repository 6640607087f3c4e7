//! Job runner: asynchronous sync execution with retry/backoff and soft/hard
//! time ceilings, plus cron registration for recurring syncs.
//!
//! Each retry is a fresh orchestrator invocation with its own log row; a
//! failed attempt is never resumed mid-pipeline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use pcf_core::SyncType;
use pcf_store::BackoffPolicy;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{SyncError, SyncOptions, SyncOrchestrator};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Soft ceiling cancels the in-flight stage token so the orchestrator can
/// finalize its log; the hard ceiling abandons the attempt outright.
#[derive(Debug, Clone, Copy)]
pub struct JobTimeouts {
    pub soft: Duration,
    pub hard: Duration,
}

impl Default for JobTimeouts {
    fn default() -> Self {
        Self {
            soft: Duration::from_secs(240),
            hard: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncJobRequest {
    pub source_name: String,
    pub sync_type: SyncType,
    pub options: SyncOptions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running { attempt: usize },
    Succeeded { log_id: i64 },
    Failed { error: String },
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded { .. } | JobState::Failed { .. })
    }
}

#[derive(Clone)]
pub struct JobRunner {
    orchestrator: Arc<SyncOrchestrator>,
    retry: RetryPolicy,
    timeouts: JobTimeouts,
    jobs: Arc<Mutex<HashMap<Uuid, JobState>>>,
}

impl JobRunner {
    pub fn new(
        orchestrator: Arc<SyncOrchestrator>,
        retry: RetryPolicy,
        timeouts: JobTimeouts,
    ) -> Self {
        Self {
            orchestrator,
            retry,
            timeouts,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Enqueue a sync job; returns immediately with its id.
    pub async fn submit(&self, request: SyncJobRequest) -> Uuid {
        let job_id = Uuid::new_v4();
        self.jobs.lock().await.insert(job_id, JobState::Queued);

        let runner = self.clone();
        tokio::spawn(async move {
            runner.run_job(job_id, request).await;
        });
        job_id
    }

    /// Job-state query; unknown ids are simply absent.
    pub async fn poll(&self, job_id: Uuid) -> Option<JobState> {
        self.jobs.lock().await.get(&job_id).cloned()
    }

    async fn set_state(&self, job_id: Uuid, state: JobState) {
        self.jobs.lock().await.insert(job_id, state);
    }

    async fn run_job(&self, job_id: Uuid, request: SyncJobRequest) {
        for attempt in 1..=self.retry.max_attempts.max(1) {
            self.set_state(job_id, JobState::Running { attempt }).await;

            match self.run_attempt(&request).await {
                Ok(log_id) => {
                    self.set_state(job_id, JobState::Succeeded { log_id }).await;
                    return;
                }
                Err(err) if err.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.backoff.delay_for_attempt(attempt - 1);
                    warn!(
                        %job_id,
                        source = %request.source_name,
                        attempt,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "transient sync failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    self.set_state(
                        job_id,
                        JobState::Failed {
                            error: err.to_string(),
                        },
                    )
                    .await;
                    return;
                }
            }
        }
    }

    /// One attempt = one orchestrator invocation (one log row). The soft
    /// ceiling cancels the token so the orchestrator winds down and fails its
    /// own log; past the hard ceiling the future is dropped and the runner
    /// finalizes the log itself.
    async fn run_attempt(&self, request: &SyncJobRequest) -> Result<i64, SyncError> {
        let prepared = self
            .orchestrator
            .prepare(&request.source_name, request.sync_type, request.options)
            .await?;
        let log_id = prepared.log_id;

        let cancel = CancellationToken::new();
        let exec = self.orchestrator.execute(prepared, &cancel);
        tokio::pin!(exec);

        let result = tokio::select! {
            result = &mut exec => result,
            () = tokio::time::sleep(self.timeouts.soft) => {
                cancel.cancel();
                let grace = self.timeouts.hard.saturating_sub(self.timeouts.soft);
                match tokio::time::timeout(grace, &mut exec).await {
                    Ok(result) => result,
                    Err(_) => {
                        self.orchestrator
                            .fail_log(log_id, "hard time ceiling exceeded")
                            .await;
                        Err(SyncError::HardTimeout)
                    }
                }
            }
        };
        result.map(|report| report.log_id)
    }
}

/// Register one cron job per active data source carrying a sync_frequency.
pub async fn build_scheduler(
    runner: JobRunner,
    sources: &[pcf_core::DataSource],
) -> anyhow::Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;
    for source in sources {
        let Some(cron) = source.sync_frequency.clone() else {
            continue;
        };
        let name = source.name.clone();
        let runner = runner.clone();
        let job = Job::new_async(cron.as_str(), move |_job_id, _lock| {
            let runner = runner.clone();
            let name = name.clone();
            Box::pin(async move {
                let job_id = runner
                    .submit(SyncJobRequest {
                        source_name: name.clone(),
                        sync_type: SyncType::Scheduled,
                        options: SyncOptions::default(),
                    })
                    .await;
                info!(source = %name, %job_id, "scheduled sync submitted");
            })
        })?;
        scheduler.add(job).await?;
    }
    Ok(scheduler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SyncConfig;
    use pcf_core::DataSource;
    use pcf_store::Store;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    const MATRIX: &str = "stressor\tDE_Chemicals\nCO2 - combustion\t0.4\n";

    async fn orchestrator() -> Arc<SyncOrchestrator> {
        let store = Store::in_memory().await.expect("store");
        let config = SyncConfig {
            database_url: "sqlite::memory:".to_string(),
            archive_dir: None,
            user_agent: "pcf-test".to_string(),
            http_timeout_secs: 5,
            scheduler_enabled: false,
        };
        Arc::new(SyncOrchestrator::new(store, &config).expect("orchestrator"))
    }

    async fn wait_terminal(runner: &JobRunner, job_id: Uuid) -> JobState {
        for _ in 0..200 {
            if let Some(state) = runner.poll(job_id).await {
                if state.is_terminal() {
                    return state;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {job_id} never reached a terminal state");
    }

    #[tokio::test]
    async fn submitted_job_completes_and_is_pollable() {
        let orchestrator = orchestrator().await;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("exiobase.zip");
        let mut buf = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            writer
                .start_file("satellite/F.txt", SimpleFileOptions::default())
                .expect("start file");
            writer.write_all(MATRIX.as_bytes()).expect("write");
            writer.finish().expect("finish");
        }
        std::fs::write(&path, buf.into_inner()).expect("write archive");

        orchestrator
            .store()
            .insert_data_source(&DataSource {
                id: Uuid::new_v4(),
                name: "exiobase".to_string(),
                source_type: "exiobase".to_string(),
                base_url: format!("file://{}", path.display()),
                sync_frequency: None,
                last_sync_at: None,
                is_active: true,
            })
            .await
            .expect("insert source");

        let runner = JobRunner::new(
            orchestrator.clone(),
            RetryPolicy::default(),
            JobTimeouts::default(),
        );
        let job_id = runner
            .submit(SyncJobRequest {
                source_name: "exiobase".to_string(),
                sync_type: SyncType::Manual,
                options: SyncOptions::default(),
            })
            .await;

        let state = wait_terminal(&runner, job_id).await;
        let JobState::Succeeded { log_id } = state else {
            panic!("expected success, got {state:?}");
        };
        let status = orchestrator.sync_status(log_id).await.unwrap();
        assert_eq!(status.status, crate::SyncStatus::Completed);
    }

    #[tokio::test]
    async fn configuration_errors_are_not_retried() {
        let orchestrator = orchestrator().await;
        let runner = JobRunner::new(
            orchestrator.clone(),
            RetryPolicy {
                max_attempts: 5,
                backoff: BackoffPolicy {
                    max_retries: 5,
                    base_delay: Duration::from_secs(60),
                    max_delay: Duration::from_secs(60),
                },
            },
            JobTimeouts::default(),
        );

        let job_id = runner
            .submit(SyncJobRequest {
                source_name: "missing".to_string(),
                sync_type: SyncType::Manual,
                options: SyncOptions::default(),
            })
            .await;

        // With a 60s backoff, any retry of the config error would hang this
        // test; terminal failure must arrive immediately.
        let state = wait_terminal(&runner, job_id).await;
        let JobState::Failed { error } = state else {
            panic!("expected failure, got {state:?}");
        };
        assert!(error.contains("not found"));
    }

    #[tokio::test]
    async fn unknown_job_polls_as_absent() {
        let orchestrator = orchestrator().await;
        let runner = JobRunner::new(
            orchestrator,
            RetryPolicy::default(),
            JobTimeouts::default(),
        );
        assert!(runner.poll(Uuid::new_v4()).await.is_none());
    }
}
