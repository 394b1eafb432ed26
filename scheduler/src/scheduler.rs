use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use common::{
    error::AppError,
    storage::db::SurrealDbClient,
    storage::types::job::{
        Job, JobAnalysis, JobError, JobErrorKind, JobPayload, JobResult, JobStatus, JobType,
        ProcessingMode, ResultBody, SubmitOutcome, SubmitRequest,
    },
};

use crate::config::SchedulerConfig;
use crate::executor::JobExecutor;

/// A caller-facing submission before policy is applied.
#[derive(Debug, Clone)]
pub struct NewSubmission {
    pub ontology: String,
    pub submitter_id: String,
    pub processing_mode: ProcessingMode,
    pub payload: JobPayload,
    pub content_hash: Option<String>,
    pub auto_approve: bool,
    pub force: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

enum Finish {
    Result(JobResult),
    Error(AppError),
    Panic(String),
    Deadline,
}

/// Converts the job queue into bounded parallel execution: a pool of
/// worker slots claiming jobs, per-job cancellation tokens and
/// deadlines, and a periodic maintenance loop for expiry, retention and
/// stuck-job recovery.
pub struct Scheduler {
    db: Arc<SurrealDbClient>,
    config: SchedulerConfig,
    executors: HashMap<JobType, Arc<dyn JobExecutor>>,
    cancellations: Arc<Mutex<HashMap<String, CancellationToken>>>,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(db: Arc<SurrealDbClient>, config: SchedulerConfig) -> Self {
        Self {
            db,
            config,
            executors: HashMap::new(),
            cancellations: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn register_executor(&mut self, job_type: JobType, executor: Arc<dyn JobExecutor>) {
        self.executors.insert(job_type, executor);
    }

    /// Applies the approval policy and submits. Duplicate submissions
    /// collapse onto the existing job.
    pub async fn submit(&self, submission: NewSubmission) -> Result<SubmitOutcome, AppError> {
        let content_hash = match submission.content_hash {
            Some(hash) => Some(hash),
            None => submission.payload.compute_content_hash(),
        };

        let job_type = submission.payload.job_type();
        let analysis = JobAnalysis::estimate(&submission.payload);
        let initial_status = if self.config.approval.auto_approves(
            job_type,
            analysis.as_ref(),
            submission.auto_approve,
        ) {
            JobStatus::Queued
        } else {
            JobStatus::AwaitingApproval
        };

        Job::submit(
            SubmitRequest {
                ontology: submission.ontology,
                submitter_id: submission.submitter_id,
                processing_mode: submission.processing_mode,
                payload: submission.payload,
                content_hash,
                initial_status,
                force: submission.force,
                expires_at: submission.expires_at,
            },
            &self.db,
        )
        .await
    }

    pub async fn approve(&self, job_id: &str) -> Result<Job, AppError> {
        Job::transition(job_id, JobStatus::AwaitingApproval, JobStatus::Approved, &self.db).await
    }

    /// Cancels a job. Running jobs are signalled through their token and
    /// finish as CANCELLED at the next suspension point; jobs that have
    /// not started are transitioned directly.
    pub async fn cancel(&self, job_id: &str) -> Result<Job, AppError> {
        let job = Job::get(job_id, &self.db)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("job {job_id} not found")))?;

        if job.status.is_terminal() {
            return Err(AppError::Conflict(format!(
                "job {job_id} is already terminal"
            )));
        }

        if job.status == JobStatus::Processing {
            let token = self.cancellations.lock().await.get(job_id).cloned();
            if let Some(token) = token {
                token.cancel();
                return Ok(job);
            }
            // Not running in this process (e.g. a stuck claim); flip it
            // directly.
        }

        Job::set_result(
            job_id,
            job.status,
            JobStatus::Cancelled,
            None,
            Some(JobError::new(JobErrorKind::Cancelled, "cancelled by operator")),
            &self.db,
        )
        .await
    }

    /// Admin-only queue wipe.
    pub async fn clear(&self, confirm: bool) -> Result<(), AppError> {
        if !confirm {
            return Err(AppError::Validation(
                "queue clear requires confirm=true".into(),
            ));
        }
        Job::clear_all(&self.db).await
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Spawns the worker slots and the maintenance loop. Tasks run until
    /// `shutdown` is cancelled; join the returned handles to drain.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.config.max_workers + 1);

        for index in 0..self.config.max_workers {
            let scheduler = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                scheduler.worker_loop(index).await;
            }));
        }

        let scheduler = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            scheduler.maintenance_loop().await;
        }));

        handles
    }

    async fn worker_loop(&self, index: usize) {
        let worker_id = format!("worker-{index}-{}", Uuid::new_v4());
        let accepted = self.config.accepted_types.clone();
        if accepted.is_empty() {
            error!(%worker_id, "no accepted job types configured");
            return;
        }
        let mut rotation = index;

        info!(%worker_id, "worker slot started");

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            // Type-weighted round robin: prefer one type this turn, fall
            // back to the whole accepted list so nothing starves.
            let preferred = accepted[rotation % accepted.len()];
            rotation = rotation.wrapping_add(1);

            let claimed = match Job::claim_next(&worker_id, &[preferred], Utc::now(), &self.db)
                .await
            {
                Ok(Some(job)) => Ok(Some(job)),
                Ok(None) => Job::claim_next(&worker_id, &accepted, Utc::now(), &self.db).await,
                Err(err) => Err(err),
            };

            match claimed {
                Ok(Some(job)) => {
                    info!(
                        %worker_id,
                        job_id = %job.id,
                        job_type = ?job.job_type,
                        "claimed job"
                    );
                    self.run_job(job, &worker_id).await;
                }
                Ok(None) => {
                    tokio::select! {
                        () = self.shutdown.cancelled() => break,
                        () = sleep(self.config.idle_backoff) => {}
                    }
                }
                Err(err) => {
                    error!(%worker_id, error = %err, "failed to claim job");
                    tokio::select! {
                        () = self.shutdown.cancelled() => break,
                        () = sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }

        info!(%worker_id, "worker slot stopped");
    }

    fn job_deadline(&self, job: &Job) -> Duration {
        let default = self.config.default_job_timeout;
        match (job.expires_at, job.started_at) {
            (Some(expires_at), Some(started_at)) => {
                let until_expiry = (expires_at - started_at)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                default.min(until_expiry)
            }
            _ => default,
        }
    }

    async fn run_job(&self, job: Job, worker_id: &str) {
        let job_id = job.id.clone();
        let job_type = job.job_type;

        let Some(executor) = self.executors.get(&job_type).cloned() else {
            warn!(%worker_id, job_id = %job_id, ?job_type, "no executor registered");
            self.finalize(
                &job_id,
                Finish::Error(AppError::Validation(format!(
                    "no executor registered for {job_type:?}"
                ))),
            )
            .await;
            return;
        };

        let token = CancellationToken::new();
        self.cancellations
            .lock()
            .await
            .insert(job_id.clone(), token.clone());

        let deadline = self.job_deadline(&job);
        let executor_token = token.clone();
        let mut handle = tokio::spawn(async move { executor.execute(job, executor_token).await });

        let finish = match tokio::time::timeout(deadline, &mut handle).await {
            Ok(Ok(Ok(result))) => Finish::Result(result),
            Ok(Ok(Err(err))) => Finish::Error(err),
            Ok(Err(join_err)) => {
                if join_err.is_panic() {
                    Finish::Panic(format!("executor panicked: {join_err}"))
                } else {
                    Finish::Error(AppError::InternalError(format!(
                        "executor task failed: {join_err}"
                    )))
                }
            }
            Err(_elapsed) => {
                // Deadline: indistinguishable from an external cancel for
                // the executor. Give it a grace period to reach a
                // suspension point before abandoning the task.
                token.cancel();
                match tokio::time::timeout(Duration::from_secs(30), &mut handle).await {
                    Ok(_) => {}
                    Err(_) => handle.abort(),
                }
                Finish::Deadline
            }
        };

        self.cancellations.lock().await.remove(&job_id);
        self.finalize(&job_id, finish).await;
    }

    async fn finalize(&self, job_id: &str, finish: Finish) {
        let (terminal, result, job_error) = match finish {
            Finish::Result(result) => match result {
                JobResult::Succeeded(_) | JobResult::Deduplicated(_) => {
                    (JobStatus::Completed, Some(result), None)
                }
                JobResult::Cancelled(_) => (
                    JobStatus::Cancelled,
                    Some(result),
                    Some(JobError::new(JobErrorKind::Cancelled, "cancelled")),
                ),
                JobResult::Failed(_) => (
                    JobStatus::Failed,
                    Some(result),
                    Some(JobError::new(JobErrorKind::Internal, "executor reported failure")),
                ),
            },
            Finish::Error(AppError::Cancelled) => (
                JobStatus::Cancelled,
                Some(JobResult::Cancelled(ResultBody::default())),
                Some(JobError::new(JobErrorKind::Cancelled, "cancelled")),
            ),
            Finish::Error(err) => {
                warn!(job_id = %job_id, error = %err, "job failed");
                (
                    JobStatus::Failed,
                    Some(JobResult::Failed(ResultBody::default())),
                    Some(JobError::from_app_error(&err)),
                )
            }
            Finish::Panic(message) => {
                error!(job_id = %job_id, %message, "executor panicked");
                (
                    JobStatus::Failed,
                    Some(JobResult::Failed(ResultBody::default())),
                    Some(JobError::new(JobErrorKind::Internal, message)),
                )
            }
            Finish::Deadline => (
                JobStatus::Cancelled,
                Some(JobResult::Cancelled(ResultBody::default())),
                Some(JobError::new(JobErrorKind::Deadline, "DEADLINE")),
            ),
        };

        match Job::set_result(job_id, JobStatus::Processing, terminal, result, job_error, &self.db)
            .await
        {
            Ok(_) => {}
            Err(AppError::Conflict(_)) => {
                // The job was finalized elsewhere (e.g. a direct cancel
                // raced us). The earlier terminal transition wins.
                warn!(job_id = %job_id, "job already finalized");
            }
            Err(err) => error!(job_id = %job_id, error = %err, "failed to finalize job"),
        }
    }

    async fn maintenance_loop(&self) {
        // Recover work orphaned by a previous process before claiming
        // anything new.
        self.maintenance_pass().await;

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = sleep(self.config.cleanup_interval) => {}
            }
            self.maintenance_pass().await;
        }
    }

    pub async fn maintenance_pass(&self) {
        let now = Utc::now();

        match Job::expire_overdue(now, &self.db).await {
            Ok(0) => {}
            Ok(n) => info!(expired = n, "expired overdue jobs"),
            Err(err) => error!(error = %err, "expiry pass failed"),
        }

        let completed_cutoff = now - chrono::Duration::days(self.config.retention_days_completed);
        match Job::cleanup_terminal(vec![JobStatus::Completed], completed_cutoff, &self.db).await {
            Ok(0) => {}
            Ok(n) => info!(removed = n, "cleaned up completed jobs"),
            Err(err) => error!(error = %err, "completed cleanup failed"),
        }

        let failed_cutoff = now - chrono::Duration::days(self.config.retention_days_failed);
        match Job::cleanup_terminal(
            vec![JobStatus::Failed, JobStatus::Cancelled],
            failed_cutoff,
            &self.db,
        )
        .await
        {
            Ok(0) => {}
            Ok(n) => info!(removed = n, "cleaned up failed jobs"),
            Err(err) => error!(error = %err, "failed cleanup failed"),
        }

        let stuck_cutoff = now
            - chrono::Duration::from_std(self.config.stuck_job_timeout)
                .unwrap_or_else(|_| chrono::Duration::hours(1));
        match Job::recover_stuck(stuck_cutoff, &self.db).await {
            Ok(0) => {}
            Ok(n) => warn!(recovered = n, "recovered stuck jobs"),
            Err(err) => error!(error = %err, "stuck recovery failed"),
        }
    }
}
