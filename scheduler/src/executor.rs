use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use common::{
    error::AppError,
    storage::types::job::{Job, JobResult},
};

/// One job type's execution logic. Implementations must honor the
/// cancellation token at every chunk boundary and around every
/// capability call; a deadline expiry is delivered through the same
/// token and is indistinguishable from an external cancel.
///
/// Returning `Ok` with a `Cancelled` result (or `Err(AppError::Cancelled)`)
/// finishes the job as CANCELLED; any other error finishes it as FAILED
/// with the error kind rendered into the job record.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: Job, cancel: CancellationToken) -> Result<JobResult, AppError>;
}
