use std::time::Duration;

use common::{
    storage::types::job::{JobAnalysis, JobType},
    utils::config::AppConfig,
};

/// Decides whether a submission skips AWAITING_APPROVAL.
#[derive(Debug, Clone)]
pub struct ApprovalPolicy {
    pub auto_approve_threshold_cost: f64,
    pub auto_approve_job_types: Vec<JobType>,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self {
            auto_approve_threshold_cost: 1.0,
            auto_approve_job_types: vec![
                JobType::VocabConsolidate,
                JobType::EmbeddingRegenerate,
                JobType::EpistemicMeasure,
            ],
        }
    }
}

impl ApprovalPolicy {
    /// A job is auto-approved when the submitter asked for it and either
    /// its type is whitelisted or the cost estimate stays under the
    /// threshold. Unknown cost counts as cheap (maintenance jobs).
    pub fn auto_approves(&self, job_type: JobType, analysis: Option<&JobAnalysis>, auto_approve: bool) -> bool {
        if !auto_approve {
            return false;
        }
        if self.auto_approve_job_types.contains(&job_type) {
            return true;
        }
        analysis.is_none_or(|a| a.estimated_cost_usd < self.auto_approve_threshold_cost)
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_workers: usize,
    pub accepted_types: Vec<JobType>,
    pub cleanup_interval: Duration,
    pub default_job_timeout: Duration,
    pub stuck_job_timeout: Duration,
    pub idle_backoff: Duration,
    pub approval: ApprovalPolicy,
    pub retention_days_completed: i64,
    pub retention_days_failed: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: 2,
            accepted_types: vec![
                JobType::IngestText,
                JobType::IngestFile,
                JobType::IngestImage,
                JobType::Restore,
                JobType::VocabConsolidate,
                JobType::EmbeddingRegenerate,
                JobType::EpistemicMeasure,
            ],
            cleanup_interval: Duration::from_secs(300),
            default_job_timeout: Duration::from_secs(30 * 60),
            stuck_job_timeout: Duration::from_secs(60 * 60),
            idle_backoff: Duration::from_millis(500),
            approval: ApprovalPolicy::default(),
            retention_days_completed: 7,
            retention_days_failed: 30,
        }
    }
}

impl SchedulerConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            max_workers: config.max_workers,
            cleanup_interval: Duration::from_secs(config.cleanup_interval_secs),
            default_job_timeout: Duration::from_secs(config.default_job_timeout_secs),
            stuck_job_timeout: Duration::from_secs(config.stuck_job_timeout_secs),
            approval: ApprovalPolicy {
                auto_approve_threshold_cost: config.auto_approve_threshold_cost,
                ..ApprovalPolicy::default()
            },
            retention_days_completed: config.retention_days_completed,
            retention_days_failed: config.retention_days_failed,
            ..SchedulerConfig::default()
        }
    }
}
