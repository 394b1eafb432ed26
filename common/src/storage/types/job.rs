use std::collections::HashMap;

use surrealdb::opt::PatchOp;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

/// Kinds of queued work. Ingestion types carry content; the remaining
/// types are maintenance or restore work dispatched through the same
/// queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    IngestText,
    IngestFile,
    IngestImage,
    Restore,
    VocabConsolidate,
    EmbeddingRegenerate,
    EpistemicMeasure,
}

impl JobType {
    pub fn is_ingestion(self) -> bool {
        matches!(
            self,
            JobType::IngestText | JobType::IngestFile | JobType::IngestImage
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    AwaitingApproval,
    Approved,
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn non_terminal() -> Vec<JobStatus> {
        vec![
            JobStatus::Pending,
            JobStatus::AwaitingApproval,
            JobStatus::Approved,
            JobStatus::Queued,
            JobStatus::Processing,
        ]
    }

    /// Legal edges of the job state machine. Everything else is a
    /// programmer error surfaced as [`AppError::Conflict`].
    pub fn can_transition(self, to: JobStatus) -> bool {
        use JobStatus::*;
        match self {
            Pending => matches!(to, AwaitingApproval | Approved | Queued | Cancelled),
            AwaitingApproval => matches!(to, Approved | Cancelled),
            Approved => matches!(to, Queued | Processing | Cancelled),
            Queued => matches!(to, Processing | Cancelled),
            Processing => matches!(to, Completed | Failed | Cancelled),
            Completed | Failed | Cancelled => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMode {
    Serial,
    Parallel,
}

/// Word-level chunking bounds for an ingestion request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ChunkingOptions {
    pub target_words: usize,
    pub min_words: usize,
    pub max_words: usize,
    pub overlap_words: usize,
}

impl Default for ChunkingOptions {
    fn default() -> Self {
        Self {
            target_words: 1000,
            min_words: 200,
            max_words: 1500,
            overlap_words: 100,
        }
    }
}

impl ChunkingOptions {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.min_words == 0 || self.min_words > self.target_words {
            return Err(AppError::Validation(
                "chunking requires 0 < min_words <= target_words".into(),
            ));
        }
        if self.target_words > self.max_words {
            return Err(AppError::Validation(
                "chunking requires target_words <= max_words".into(),
            ));
        }
        if self.overlap_words >= self.min_words {
            return Err(AppError::Validation(format!(
                "overlap_words must be smaller than min_words of {}",
                self.min_words
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    Text {
        document: String,
        text: String,
        options: ChunkingOptions,
    },
    File {
        file_name: String,
        text: String,
        options: ChunkingOptions,
    },
    Image {
        file_name: String,
        content_type: String,
        image_base64: String,
        options: ChunkingOptions,
    },
    Restore {
        manifest: serde_json::Value,
    },
    VocabConsolidate {
        target_size: Option<usize>,
        dry_run: bool,
        prune_unused: bool,
        profile: String,
    },
    EmbeddingRegenerate {
        model: String,
        dimensions: u32,
    },
    EpistemicMeasure {
        params: serde_json::Value,
    },
}

impl JobPayload {
    pub fn job_type(&self) -> JobType {
        match self {
            JobPayload::Text { .. } => JobType::IngestText,
            JobPayload::File { .. } => JobType::IngestFile,
            JobPayload::Image { .. } => JobType::IngestImage,
            JobPayload::Restore { .. } => JobType::Restore,
            JobPayload::VocabConsolidate { .. } => JobType::VocabConsolidate,
            JobPayload::EmbeddingRegenerate { .. } => JobType::EmbeddingRegenerate,
            JobPayload::EpistemicMeasure { .. } => JobType::EpistemicMeasure,
        }
    }

    pub fn chunking_options(&self) -> Option<&ChunkingOptions> {
        match self {
            JobPayload::Text { options, .. }
            | JobPayload::File { options, .. }
            | JobPayload::Image { options, .. } => Some(options),
            _ => None,
        }
    }

    /// Canonical bytes the content hash and checkpoint fingerprint are
    /// derived from. Maintenance jobs have no content identity.
    pub fn content_bytes(&self) -> Option<Vec<u8>> {
        match self {
            JobPayload::Text { text, .. } | JobPayload::File { text, .. } => {
                Some(text.as_bytes().to_vec())
            }
            JobPayload::Image { image_base64, .. } => Some(image_base64.as_bytes().to_vec()),
            _ => None,
        }
    }

    /// Dedup hash of the payload: NFC-canonicalized for text, raw bytes
    /// for images.
    pub fn compute_content_hash(&self) -> Option<String> {
        match self {
            JobPayload::Text { text, .. } | JobPayload::File { text, .. } => {
                Some(crate::utils::content_hash::hash_text(text))
            }
            JobPayload::Image { image_base64, .. } => Some(
                crate::utils::content_hash::hash_bytes(image_base64.as_bytes()),
            ),
            _ => None,
        }
    }
}

/// Pre-ingestion estimate shown to approvers and consulted by the
/// auto-approval policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct JobAnalysis {
    pub word_count: usize,
    pub estimated_chunks: usize,
    pub estimated_llm_calls: usize,
    pub estimated_cost_usd: f64,
}

const ESTIMATED_COST_PER_CALL_USD: f64 = 0.01;

impl JobAnalysis {
    pub fn estimate(payload: &JobPayload) -> Option<Self> {
        let options = payload.chunking_options()?;
        let word_count = match payload {
            JobPayload::Text { text, .. } | JobPayload::File { text, .. } => {
                text.split_whitespace().count()
            }
            // A vision description is treated as one chunk of prose.
            JobPayload::Image { .. } => options.target_words,
            _ => return None,
        };

        let estimated_chunks = if word_count == 0 {
            0
        } else {
            let stride = options.target_words.saturating_sub(options.overlap_words).max(1);
            word_count.saturating_sub(options.overlap_words).div_ceil(stride).max(1)
        };
        let vision_calls = usize::from(matches!(payload, JobPayload::Image { .. }));
        let estimated_llm_calls = estimated_chunks + vision_calls;

        Some(Self {
            word_count,
            estimated_chunks,
            estimated_llm_calls,
            estimated_cost_usd: estimated_llm_calls as f64 * ESTIMATED_COST_PER_CALL_USD,
        })
    }
}

/// Running counters shared by the ingestion progress stages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct IngestCounts {
    pub chunks_total: Option<usize>,
    pub chunks_processed: Option<usize>,
    pub current_chunk: Option<usize>,
    pub percent: Option<f32>,
    pub concepts_created: Option<usize>,
    pub concepts_linked: Option<usize>,
    pub sources_created: Option<usize>,
    pub instances_created: Option<usize>,
    pub relationships_created: Option<usize>,
}

/// Mutable, stage-typed progress blob. One variant per stage; unknown
/// variants are never written, unknown fields on read are ignored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum Progress {
    Queued,
    Analyzing,
    Chunking(IngestCounts),
    Extraction(IngestCounts),
    Upsert(IngestCounts),
    Finalizing(IngestCounts),
    Cancelled(IngestCounts),
    Restore {
        items_total: Option<usize>,
        items_processed: Option<usize>,
        message: Option<String>,
    },
}

impl Default for Progress {
    fn default() -> Self {
        Progress::Queued
    }
}

/// Final counters for a finished ingestion run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct IngestStats {
    pub concepts_created: usize,
    pub concepts_linked: usize,
    pub sources_created: usize,
    pub instances_created: usize,
    pub instances_dropped: usize,
    pub relationships_created: usize,
    pub relationships_skipped: usize,
}

impl IngestStats {
    pub fn absorb(&mut self, other: &IngestStats) {
        self.concepts_created += other.concepts_created;
        self.concepts_linked += other.concepts_linked;
        self.sources_created += other.sources_created;
        self.instances_created += other.instances_created;
        self.instances_dropped += other.instances_dropped;
        self.relationships_created += other.relationships_created;
        self.relationships_skipped += other.relationships_skipped;
    }
}

/// Token spend per provider, used for the result cost breakdown.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TokenCost {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub estimated_usd: f64,
}

impl TokenCost {
    pub fn absorb(&mut self, other: &TokenCost) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
        self.estimated_usd += other.estimated_usd;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ResultBody {
    pub stats: IngestStats,
    pub cost: HashMap<String, TokenCost>,
    pub ontology: String,
    pub chunks_processed: usize,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobResult {
    Succeeded(ResultBody),
    Deduplicated(ResultBody),
    Failed(ResultBody),
    Cancelled(ResultBody),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    Input,
    Duplicate,
    CapabilityTransient,
    CapabilityPermanent,
    StorageTransient,
    StoragePermanent,
    Cancelled,
    Deadline,
    Stuck,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobError {
    pub kind: JobErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: JobErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn from_app_error(err: &AppError) -> Self {
        let kind = match err {
            AppError::Validation(_) => JobErrorKind::Input,
            AppError::Cancelled => JobErrorKind::Cancelled,
            AppError::Database(_) => {
                if err.is_transient() {
                    JobErrorKind::StorageTransient
                } else {
                    JobErrorKind::StoragePermanent
                }
            }
            AppError::OpenAI(_) | AppError::Io(_) => {
                if err.is_transient() {
                    JobErrorKind::CapabilityTransient
                } else {
                    JobErrorKind::CapabilityPermanent
                }
            }
            AppError::Extraction(_) => JobErrorKind::CapabilityPermanent,
            _ => JobErrorKind::Internal,
        };

        Self::new(kind, err.to_string())
    }
}

stored_object!(Job, "job", {
    job_type: JobType,
    status: JobStatus,
    ontology: String,
    submitter_id: String,
    processing_mode: ProcessingMode,
    content_hash: Option<String>,
    payload: JobPayload,
    analysis: Option<JobAnalysis>,
    progress: Progress,
    result: Option<JobResult>,
    error: Option<JobError>,
    force: bool,
    worker_id: Option<String>,
    #[serde(serialize_with = "serialize_option_datetime", deserialize_with = "deserialize_option_datetime", default)]
    started_at: Option<DateTime<Utc>>,
    #[serde(serialize_with = "serialize_option_datetime", deserialize_with = "deserialize_option_datetime", default)]
    approved_at: Option<DateTime<Utc>>,
    #[serde(serialize_with = "serialize_option_datetime", deserialize_with = "deserialize_option_datetime", default)]
    completed_at: Option<DateTime<Utc>>,
    #[serde(serialize_with = "serialize_option_datetime", deserialize_with = "deserialize_option_datetime", default)]
    expires_at: Option<DateTime<Utc>>
});

/// A submission prepared by the caller: payload plus the policy decision
/// of which status the job starts in.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub ontology: String,
    pub submitter_id: String,
    pub processing_mode: ProcessingMode,
    pub payload: JobPayload,
    pub content_hash: Option<String>,
    pub initial_status: JobStatus,
    pub force: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub job: Job,
    pub duplicate: bool,
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub submitter_id: Option<String>,
    pub job_type: Option<JobType>,
    pub ontology: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct Paging {
    pub limit: usize,
    pub start: usize,
}

impl Default for Paging {
    fn default() -> Self {
        Self {
            limit: 50,
            start: 0,
        }
    }
}

const SUBMIT_WITH_DEDUP: &str = r"
    BEGIN TRANSACTION;
    LET $existing = (
        SELECT * FROM type::table($table)
        WHERE job_type = $job_type
          AND ontology = $ontology
          AND content_hash = $content_hash
          AND status INSIDE $dedup_statuses
        ORDER BY created_at ASC
        LIMIT 1
    );
    IF array::len($existing) == 0 {
        CREATE type::thing($table, $id) CONTENT $job;
    };
    SELECT * FROM $existing;
    COMMIT TRANSACTION;
";

const CLAIM_NEXT: &str = r"
    BEGIN TRANSACTION;
    LET $candidate = (
        SELECT * FROM type::table($table)
        WHERE status INSIDE $claimable AND job_type INSIDE $types
        ORDER BY created_at ASC
        LIMIT 1
    );
    LET $claimed = (IF array::len($candidate) != 0 {
        (UPDATE $candidate[0].id SET
            status = $processing,
            worker_id = $worker_id,
            started_at = $now,
            updated_at = $now
        RETURN AFTER)
    } ELSE {
        []
    });
    SELECT * FROM $claimed;
    COMMIT TRANSACTION;
";

impl Job {
    fn from_request(request: &SubmitRequest) -> Self {
        let now = Utc::now();
        let job_type = request.payload.job_type();

        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            job_type,
            status: request.initial_status,
            ontology: request.ontology.clone(),
            submitter_id: request.submitter_id.clone(),
            processing_mode: request.processing_mode,
            content_hash: request.content_hash.clone(),
            analysis: JobAnalysis::estimate(&request.payload),
            payload: request.payload.clone(),
            progress: Progress::default(),
            result: None,
            error: None,
            force: request.force,
            worker_id: None,
            started_at: None,
            approved_at: None,
            completed_at: None,
            expires_at: request.expires_at,
        }
    }

    /// Submits a job. If a live (non-terminal) job with the same
    /// `(content_hash, ontology, job_type)` exists, or a completed one
    /// exists and `force` is off, the existing job is returned with
    /// `duplicate = true`. Dedup check and insert run in one transaction.
    pub async fn submit(
        request: SubmitRequest,
        db: &SurrealDbClient,
    ) -> Result<SubmitOutcome, AppError> {
        if let Some(hash) = &request.content_hash {
            crate::utils::content_hash::validate_content_hash(hash)?;
        }
        if let Some(options) = request.payload.chunking_options() {
            options.validate()?;
        }
        if let Some(expires_at) = request.expires_at {
            if expires_at <= Utc::now() {
                return Err(AppError::Validation(
                    "expires_at must be strictly after submission".into(),
                ));
            }
        }

        let job = Self::from_request(&request);

        let Some(content_hash) = request.content_hash.clone() else {
            // Maintenance jobs have no content identity to dedup on.
            let stored = db
                .store_item(job)
                .await?
                .ok_or_else(|| AppError::InternalError("job row was not created".into()))?;
            return Ok(SubmitOutcome {
                job: stored,
                duplicate: false,
            });
        };

        let mut dedup_statuses = JobStatus::non_terminal();
        if !request.force {
            dedup_statuses.push(JobStatus::Completed);
        }

        let mut response = db
            .query(SUBMIT_WITH_DEDUP)
            .bind(("table", Self::table_name()))
            .bind(("job_type", job.job_type))
            .bind(("ontology", request.ontology.clone()))
            .bind(("content_hash", content_hash))
            .bind(("dedup_statuses", dedup_statuses))
            .bind(("id", job.id.clone()))
            .bind(("job", job.clone()))
            .await?;
        let last = response.num_statements() - 1;
        let existing: Vec<Job> = response.take(last)?;

        match existing.into_iter().next() {
            Some(existing_job) => Ok(SubmitOutcome {
                job: existing_job,
                duplicate: true,
            }),
            None => {
                let stored = Self::get(&job.id, db)
                    .await?
                    .ok_or_else(|| AppError::InternalError("job row was not created".into()))?;
                Ok(SubmitOutcome {
                    job: stored,
                    duplicate: false,
                })
            }
        }
    }

    pub async fn get(id: &str, db: &SurrealDbClient) -> Result<Option<Self>, AppError> {
        Ok(db.get_item::<Self>(id).await?)
    }

    pub async fn list(
        filter: &JobFilter,
        paging: Paging,
        db: &SurrealDbClient,
    ) -> Result<Vec<Self>, AppError> {
        let jobs: Vec<Self> = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE ($status = NONE OR status = $status)
                   AND ($submitter_id = NONE OR submitter_id = $submitter_id)
                   AND ($job_type = NONE OR job_type = $job_type)
                   AND ($ontology = NONE OR ontology = $ontology)
                 ORDER BY created_at DESC
                 LIMIT $limit START $start",
            )
            .bind(("table", Self::table_name()))
            .bind(("status", filter.status))
            .bind(("submitter_id", filter.submitter_id.clone()))
            .bind(("job_type", filter.job_type))
            .bind(("ontology", filter.ontology.clone()))
            .bind(("limit", paging.limit))
            .bind(("start", paging.start))
            .await?
            .take(0)?;

        Ok(jobs)
    }

    /// Compare-and-set status transition: fails with [`AppError::Conflict`]
    /// when the edge is illegal or the current status no longer matches
    /// `from`. The only way job status changes.
    pub async fn transition(
        id: &str,
        from: JobStatus,
        to: JobStatus,
        db: &SurrealDbClient,
    ) -> Result<Self, AppError> {
        if !from.can_transition(to) {
            return Err(AppError::Conflict(format!(
                "illegal job transition {from:?} -> {to:?}"
            )));
        }

        let now = Utc::now();
        let approved_at = (to == JobStatus::Approved).then_some(now);
        let completed_at = to.is_terminal().then_some(now);

        let mut response = db
            .query(
                "UPDATE type::thing($table, $id) SET
                    status = $to,
                    updated_at = $now,
                    approved_at = IF $approved_at != NONE THEN $approved_at ELSE approved_at END,
                    completed_at = IF $completed_at != NONE THEN $completed_at ELSE completed_at END
                 WHERE status = $from
                 RETURN AFTER",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_string()))
            .bind(("from", from))
            .bind(("to", to))
            .bind(("now", surrealdb::sql::Datetime::from(now)))
            .bind(("approved_at", approved_at.map(surrealdb::sql::Datetime::from)))
            .bind(("completed_at", completed_at.map(surrealdb::sql::Datetime::from)))
            .await?;
        let updated: Vec<Self> = response.take(0)?;

        updated.into_iter().next().ok_or_else(|| {
            AppError::Conflict(format!(
                "job {id} was not in {from:?} when transitioning to {to:?}"
            ))
        })
    }

    /// Idempotent write of the progress blob. Never touches status.
    pub async fn update_progress(
        id: &str,
        progress: Progress,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        let _job: Option<Self> = db
            .update((Self::table_name(), id))
            .patch(PatchOp::replace("/progress", progress))
            .patch(PatchOp::replace(
                "/updated_at",
                surrealdb::sql::Datetime::default(),
            ))
            .await?;

        Ok(())
    }

    /// Combined terminal transition + result/error write, gated on the
    /// job still being in `from`.
    pub async fn set_result(
        id: &str,
        from: JobStatus,
        terminal: JobStatus,
        result: Option<JobResult>,
        error: Option<JobError>,
        db: &SurrealDbClient,
    ) -> Result<Self, AppError> {
        if !terminal.is_terminal() {
            return Err(AppError::Conflict(format!(
                "set_result target {terminal:?} is not terminal"
            )));
        }
        if !from.can_transition(terminal) {
            return Err(AppError::Conflict(format!(
                "illegal job transition {from:?} -> {terminal:?}"
            )));
        }

        let now = surrealdb::sql::Datetime::from(Utc::now());
        let mut response = db
            .query(
                "UPDATE type::thing($table, $id) SET
                    status = $terminal,
                    result = $result,
                    error = $error,
                    completed_at = $now,
                    updated_at = $now
                 WHERE status = $from
                 RETURN AFTER",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_string()))
            .bind(("terminal", terminal))
            .bind(("from", from))
            .bind(("result", result))
            .bind(("error", error))
            .bind(("now", now))
            .await?;
        let updated: Vec<Self> = response.take(0)?;

        updated.into_iter().next().ok_or_else(|| {
            AppError::Conflict(format!(
                "job {id} was not in {from:?} when finishing as {terminal:?}"
            ))
        })
    }

    /// Atomically claims the oldest APPROVED/QUEUED job of one of the
    /// accepted types, flipping it to PROCESSING and stamping
    /// `started_at`. No two workers can observe the same job claimed.
    pub async fn claim_next(
        worker_id: &str,
        job_types: &[JobType],
        now: DateTime<Utc>,
        db: &SurrealDbClient,
    ) -> Result<Option<Self>, AppError> {
        if job_types.is_empty() {
            return Ok(None);
        }

        let mut response = db
            .query(CLAIM_NEXT)
            .bind(("table", Self::table_name()))
            .bind(("claimable", vec![JobStatus::Approved, JobStatus::Queued]))
            .bind(("types", job_types.to_vec()))
            .bind(("processing", JobStatus::Processing))
            .bind(("worker_id", worker_id.to_string()))
            .bind(("now", surrealdb::sql::Datetime::from(now)))
            .await?;
        let last = response.num_statements() - 1;
        let claimed: Vec<Self> = response.take(last)?;

        Ok(claimed.into_iter().next())
    }

    /// Cancels every non-terminal job whose deadline has passed. Returns
    /// the number of jobs expired.
    pub async fn expire_overdue(now: DateTime<Utc>, db: &SurrealDbClient) -> Result<usize, AppError> {
        let error = JobError::new(JobErrorKind::Cancelled, "EXPIRED");
        let mut response = db
            .query(
                "UPDATE type::table($table) SET
                    status = $cancelled,
                    error = $error,
                    completed_at = $now,
                    updated_at = $now
                 WHERE expires_at != NONE AND expires_at < $now AND status INSIDE $non_terminal
                 RETURN AFTER",
            )
            .bind(("table", Self::table_name()))
            .bind(("cancelled", JobStatus::Cancelled))
            .bind(("error", error))
            .bind(("now", surrealdb::sql::Datetime::from(now)))
            .bind(("non_terminal", JobStatus::non_terminal()))
            .await?;
        let expired: Vec<Self> = response.take(0)?;

        Ok(expired.len())
    }

    /// Deletes terminal jobs of the given statuses finished before the
    /// cutoff. Returns the number removed.
    pub async fn cleanup_terminal(
        statuses: Vec<JobStatus>,
        before: DateTime<Utc>,
        db: &SurrealDbClient,
    ) -> Result<usize, AppError> {
        if statuses.iter().any(|s| !s.is_terminal()) {
            return Err(AppError::Conflict(
                "cleanup_terminal only accepts terminal statuses".into(),
            ));
        }

        let mut response = db
            .query(
                "DELETE FROM type::table($table)
                 WHERE status INSIDE $statuses
                   AND completed_at != NONE
                   AND completed_at < $before
                 RETURN BEFORE",
            )
            .bind(("table", Self::table_name()))
            .bind(("statuses", statuses))
            .bind(("before", surrealdb::sql::Datetime::from(before)))
            .await?;
        let deleted: Vec<Self> = response.take(0)?;

        Ok(deleted.len())
    }

    /// Process-restart recovery: PROCESSING rows older than the stuck
    /// cutoff become FAILED(STUCK) so an operator can resubmit them.
    pub async fn recover_stuck(
        started_before: DateTime<Utc>,
        db: &SurrealDbClient,
    ) -> Result<usize, AppError> {
        let error = JobError::new(JobErrorKind::Stuck, "STUCK");
        let now = surrealdb::sql::Datetime::from(Utc::now());
        let mut response = db
            .query(
                "UPDATE type::table($table) SET
                    status = $failed,
                    error = $error,
                    completed_at = $now,
                    updated_at = $now
                 WHERE status = $processing
                   AND started_at != NONE
                   AND started_at < $before
                 RETURN AFTER",
            )
            .bind(("table", Self::table_name()))
            .bind(("failed", JobStatus::Failed))
            .bind(("processing", JobStatus::Processing))
            .bind(("error", error))
            .bind(("now", now))
            .bind(("before", surrealdb::sql::Datetime::from(started_before)))
            .await?;
        let recovered: Vec<Self> = response.take(0)?;

        Ok(recovered.len())
    }

    /// Number of claimable jobs queued ahead of this one.
    pub async fn queue_position(&self, db: &SurrealDbClient) -> Result<Option<usize>, AppError> {
        if self.status.is_terminal() || self.status == JobStatus::Processing {
            return Ok(None);
        }

        #[derive(Deserialize)]
        struct Row {
            count: usize,
        }

        let mut response = db
            .query(
                "SELECT count() AS count FROM type::table($table)
                 WHERE status INSIDE $claimable AND created_at < $created_at
                 GROUP ALL",
            )
            .bind(("table", Self::table_name()))
            .bind(("claimable", vec![JobStatus::Approved, JobStatus::Queued]))
            .bind(("created_at", surrealdb::sql::Datetime::from(self.created_at)))
            .await?;
        let rows: Vec<Row> = response.take(0)?;

        Ok(Some(rows.first().map_or(0, |r| r.count)))
    }

    /// Admin-only queue wipe.
    pub async fn clear_all(db: &SurrealDbClient) -> Result<(), AppError> {
        let _removed: Vec<Self> = db.drop_table::<Self>().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::content_hash::hash_text;

    async fn memory_db() -> SurrealDbClient {
        let database = Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("test_ns", &database)
            .await
            .expect("Failed to start in-memory surrealdb");
        db.ensure_initialized()
            .await
            .expect("Failed to initialize schema");
        db
    }

    fn text_request(ontology: &str, text: &str) -> SubmitRequest {
        SubmitRequest {
            ontology: ontology.to_string(),
            submitter_id: "tester".to_string(),
            processing_mode: ProcessingMode::Serial,
            payload: JobPayload::Text {
                document: "notes.txt".to_string(),
                text: text.to_string(),
                options: ChunkingOptions::default(),
            },
            content_hash: Some(hash_text(text)),
            initial_status: JobStatus::Queued,
            force: false,
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn test_submit_creates_job_with_analysis() {
        let db = memory_db().await;

        let outcome = Job::submit(text_request("X", "alpha beta gamma"), &db)
            .await
            .expect("submit");

        assert!(!outcome.duplicate);
        assert_eq!(outcome.job.status, JobStatus::Queued);
        assert_eq!(outcome.job.job_type, JobType::IngestText);
        let analysis = outcome.job.analysis.expect("analysis computed at submit");
        assert_eq!(analysis.word_count, 3);
        assert_eq!(analysis.estimated_chunks, 1);
    }

    #[tokio::test]
    async fn test_submit_dedups_live_job() {
        let db = memory_db().await;

        let first = Job::submit(text_request("X", "alpha beta gamma"), &db)
            .await
            .expect("first submit");
        let second = Job::submit(text_request("X", "alpha beta gamma"), &db)
            .await
            .expect("second submit");

        assert!(second.duplicate);
        assert_eq!(second.job.id, first.job.id);

        // Different ontology is a different dedup key.
        let other = Job::submit(text_request("Y", "alpha beta gamma"), &db)
            .await
            .expect("other ontology submit");
        assert!(!other.duplicate);
    }

    #[tokio::test]
    async fn test_submit_dedups_completed_job_unless_forced() {
        let db = memory_db().await;

        let first = Job::submit(text_request("X", "alpha beta gamma"), &db)
            .await
            .expect("submit");
        Job::transition(&first.job.id, JobStatus::Queued, JobStatus::Processing, &db)
            .await
            .expect("to processing");
        Job::set_result(
            &first.job.id,
            JobStatus::Processing,
            JobStatus::Completed,
            Some(JobResult::Succeeded(ResultBody::default())),
            None,
            &db,
        )
        .await
        .expect("complete");

        let resubmit = Job::submit(text_request("X", "alpha beta gamma"), &db)
            .await
            .expect("resubmit");
        assert!(resubmit.duplicate);
        assert_eq!(resubmit.job.id, first.job.id);
        assert_eq!(resubmit.job.status, JobStatus::Completed);

        let mut forced = text_request("X", "alpha beta gamma");
        forced.force = true;
        let forced_outcome = Job::submit(forced, &db).await.expect("forced resubmit");
        assert!(!forced_outcome.duplicate);
        assert_ne!(forced_outcome.job.id, first.job.id);
    }

    #[tokio::test]
    async fn test_transition_rejects_illegal_edges_and_stale_cas() {
        let db = memory_db().await;
        let outcome = Job::submit(text_request("X", "alpha"), &db)
            .await
            .expect("submit");

        // Illegal edge is a programmer error.
        let illegal = Job::transition(
            &outcome.job.id,
            JobStatus::Queued,
            JobStatus::Completed,
            &db,
        )
        .await;
        assert!(matches!(illegal, Err(AppError::Conflict(_))));

        // Legal edge succeeds once...
        Job::transition(&outcome.job.id, JobStatus::Queued, JobStatus::Processing, &db)
            .await
            .expect("claim");

        // ...and the stale CAS fails.
        let stale = Job::transition(
            &outcome.job.id,
            JobStatus::Queued,
            JobStatus::Processing,
            &db,
        )
        .await;
        assert!(matches!(stale, Err(AppError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_claim_next_is_fifo_and_exclusive() {
        let db = memory_db().await;

        let first = Job::submit(text_request("X", "first text"), &db)
            .await
            .expect("submit first");
        let second = Job::submit(text_request("X", "second text"), &db)
            .await
            .expect("submit second");

        let types = vec![JobType::IngestText];
        let claimed = Job::claim_next("worker-a", &types, Utc::now(), &db)
            .await
            .expect("claim")
            .expect("job available");
        assert_eq!(claimed.id, first.job.id);
        assert_eq!(claimed.status, JobStatus::Processing);
        assert_eq!(claimed.worker_id.as_deref(), Some("worker-a"));
        assert!(claimed.started_at.is_some());

        let claimed_second = Job::claim_next("worker-b", &types, Utc::now(), &db)
            .await
            .expect("claim second")
            .expect("second available");
        assert_eq!(claimed_second.id, second.job.id);

        let nothing_left = Job::claim_next("worker-c", &types, Utc::now(), &db)
            .await
            .expect("claim empty");
        assert!(nothing_left.is_none());
    }

    #[tokio::test]
    async fn test_claim_next_respects_accepted_types() {
        let db = memory_db().await;
        Job::submit(text_request("X", "text job"), &db)
            .await
            .expect("submit");

        let claimed = Job::claim_next("worker", &[JobType::Restore], Utc::now(), &db)
            .await
            .expect("claim");
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn test_awaiting_approval_not_claimable_until_approved() {
        let db = memory_db().await;
        let mut request = text_request("X", "needs approval");
        request.initial_status = JobStatus::AwaitingApproval;
        let outcome = Job::submit(request, &db).await.expect("submit");

        let types = vec![JobType::IngestText];
        assert!(Job::claim_next("w", &types, Utc::now(), &db)
            .await
            .expect("claim")
            .is_none());

        let approved = Job::transition(
            &outcome.job.id,
            JobStatus::AwaitingApproval,
            JobStatus::Approved,
            &db,
        )
        .await
        .expect("approve");
        assert!(approved.approved_at.is_some());

        let claimed = Job::claim_next("w", &types, Utc::now(), &db)
            .await
            .expect("claim")
            .expect("approved job claimable");
        assert_eq!(claimed.id, outcome.job.id);
    }

    #[tokio::test]
    async fn test_expire_overdue_cancels_only_overdue_non_terminal() {
        let db = memory_db().await;

        let mut overdue = text_request("X", "will expire");
        overdue.expires_at = Some(Utc::now() + chrono::Duration::milliseconds(5));
        let overdue_job = Job::submit(overdue, &db).await.expect("submit overdue");

        let fresh = Job::submit(text_request("X", "still fresh"), &db)
            .await
            .expect("submit fresh");

        let expired = Job::expire_overdue(Utc::now() + chrono::Duration::seconds(1), &db)
            .await
            .expect("expire");
        assert_eq!(expired, 1);

        let cancelled = Job::get(&overdue_job.job.id, &db)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert_eq!(
            cancelled.error.expect("expiry error").message,
            "EXPIRED".to_string()
        );

        let untouched = Job::get(&fresh.job.id, &db).await.expect("get").expect("exists");
        assert_eq!(untouched.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_cleanup_terminal_removes_old_jobs() {
        let db = memory_db().await;

        let outcome = Job::submit(text_request("X", "short lived"), &db)
            .await
            .expect("submit");
        Job::transition(&outcome.job.id, JobStatus::Queued, JobStatus::Processing, &db)
            .await
            .expect("processing");
        Job::set_result(
            &outcome.job.id,
            JobStatus::Processing,
            JobStatus::Completed,
            Some(JobResult::Succeeded(ResultBody::default())),
            None,
            &db,
        )
        .await
        .expect("complete");

        let removed = Job::cleanup_terminal(
            vec![JobStatus::Completed],
            Utc::now() + chrono::Duration::seconds(1),
            &db,
        )
        .await
        .expect("cleanup");
        assert_eq!(removed, 1);
        assert!(Job::get(&outcome.job.id, &db).await.expect("get").is_none());

        let invalid = Job::cleanup_terminal(vec![JobStatus::Queued], Utc::now(), &db).await;
        assert!(matches!(invalid, Err(AppError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_recover_stuck_fails_old_processing_rows() {
        let db = memory_db().await;
        let outcome = Job::submit(text_request("X", "gets stuck"), &db)
            .await
            .expect("submit");
        Job::claim_next("worker", &[JobType::IngestText], Utc::now(), &db)
            .await
            .expect("claim")
            .expect("claimed");

        let recovered = Job::recover_stuck(Utc::now() + chrono::Duration::seconds(1), &db)
            .await
            .expect("recover");
        assert_eq!(recovered, 1);

        let failed = Job::get(&outcome.job.id, &db).await.expect("get").expect("exists");
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.expect("stuck error").kind, JobErrorKind::Stuck);
    }

    #[tokio::test]
    async fn test_update_progress_keeps_status() {
        let db = memory_db().await;
        let outcome = Job::submit(text_request("X", "progressing"), &db)
            .await
            .expect("submit");

        let counts = IngestCounts {
            chunks_total: Some(3),
            chunks_processed: Some(1),
            ..IngestCounts::default()
        };
        Job::update_progress(&outcome.job.id, Progress::Extraction(counts.clone()), &db)
            .await
            .expect("progress");

        let reloaded = Job::get(&outcome.job.id, &db).await.expect("get").expect("exists");
        assert_eq!(reloaded.status, JobStatus::Queued);
        assert_eq!(reloaded.progress, Progress::Extraction(counts));
    }

    #[tokio::test]
    async fn test_list_filters() {
        let db = memory_db().await;
        Job::submit(text_request("X", "one"), &db).await.expect("submit");
        Job::submit(text_request("Y", "two"), &db).await.expect("submit");

        let filter = JobFilter {
            ontology: Some("X".to_string()),
            ..JobFilter::default()
        };
        let jobs = Job::list(&filter, Paging::default(), &db)
            .await
            .expect("list");
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].ontology, "X");

        let by_status = JobFilter {
            status: Some(JobStatus::Completed),
            ..JobFilter::default()
        };
        assert!(Job::list(&by_status, Paging::default(), &db)
            .await
            .expect("list")
            .is_empty());
    }

    #[tokio::test]
    async fn test_queue_position_counts_claimable_jobs_ahead() {
        let db = memory_db().await;

        let first = Job::submit(text_request("X", "first in line"), &db)
            .await
            .expect("submit");
        let second = Job::submit(text_request("X", "second in line"), &db)
            .await
            .expect("submit");

        assert_eq!(first.job.queue_position(&db).await.expect("position"), Some(0));
        assert_eq!(second.job.queue_position(&db).await.expect("position"), Some(1));

        let claimed = Job::claim_next("w", &[JobType::IngestText], Utc::now(), &db)
            .await
            .expect("claim")
            .expect("claimed");
        assert!(claimed.queue_position(&db).await.expect("position").is_none());
    }

    #[test]
    fn test_progress_serialization_is_stage_tagged() {
        let progress = Progress::Extraction(IngestCounts {
            chunks_total: Some(4),
            chunks_processed: Some(2),
            ..IngestCounts::default()
        });
        let value = serde_json::to_value(&progress).expect("serialize");
        assert_eq!(value["stage"], "extraction");
        assert_eq!(value["chunks_total"], 4);

        let result = JobResult::Deduplicated(ResultBody {
            ontology: "X".into(),
            ..ResultBody::default()
        });
        let value = serde_json::to_value(&result).expect("serialize");
        assert_eq!(value["status"], "deduplicated");
    }

    #[test]
    fn test_chunking_options_validation() {
        let mut options = ChunkingOptions::default();
        options.validate().expect("defaults valid");

        options.overlap_words = options.min_words;
        assert!(options.validate().is_err());

        let inverted = ChunkingOptions {
            target_words: 100,
            min_words: 200,
            max_words: 300,
            overlap_words: 10,
        };
        assert!(inverted.validate().is_err());
    }
}
