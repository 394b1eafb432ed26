use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use common::{
    error::AppError,
    storage::types::job::{
        IngestCounts, Job, JobPayload, JobResult, Progress, ResultBody,
    },
};
use scheduler::JobExecutor;

use crate::curve::AggressivenessProfile;
use crate::manager::VocabularyManager;

/// Runs queued `vocab_consolidate` maintenance jobs against the shared
/// vocabulary manager.
pub struct VocabConsolidateExecutor {
    manager: Arc<VocabularyManager>,
}

impl VocabConsolidateExecutor {
    pub fn new(manager: Arc<VocabularyManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl JobExecutor for VocabConsolidateExecutor {
    async fn execute(&self, job: Job, cancel: CancellationToken) -> Result<JobResult, AppError> {
        let JobPayload::VocabConsolidate {
            target_size,
            dry_run,
            prune_unused,
            profile,
        } = &job.payload
        else {
            return Err(AppError::Validation(
                "vocab_consolidate job carries a different payload".into(),
            ));
        };

        Job::update_progress(&job.id, Progress::Analyzing, &self.manager.db).await?;

        let manager = match AggressivenessProfile::parse(profile) {
            Some(parsed) => self.manager.with_profile(parsed),
            None => self.manager.with_profile(Default::default()),
        };

        let report = manager
            .consolidate(*target_size, *dry_run, *prune_unused, &cancel)
            .await?;

        Job::update_progress(
            &job.id,
            Progress::Finalizing(IngestCounts::default()),
            &self.manager.db,
        )
        .await?;

        info!(
            job_id = %job.id,
            size_before = report.size_before,
            size_after = report.size_after,
            executed = report.executed,
            dry_run = report.dry_run,
            "vocabulary consolidation finished"
        );

        let message = if report.dry_run {
            format!(
                "dry run: {} recommendations at size {}",
                report.recommendations.len(),
                report.size_before
            )
        } else {
            format!(
                "consolidated {} -> {} ({} actions)",
                report.size_before, report.size_after, report.executed
            )
        };

        Ok(JobResult::Succeeded(ResultBody {
            stats: Default::default(),
            cost: HashMap::new(),
            ontology: job.ontology,
            chunks_processed: 0,
            message: Some(message),
        }))
    }
}
