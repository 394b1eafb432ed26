use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("OpenAI error: {0}")]
    OpenAI(#[from] OpenAIError),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Extraction error: {0}")]
    Extraction(String),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("Processing error: {0}")]
    Processing(String),
    #[error("Cancelled")]
    Cancelled,
    #[error("Internal service error: {0}")]
    InternalError(String),
}

impl AppError {
    /// Whether the error is worth retrying with backoff. Capability
    /// timeouts, rate limits and database write conflicts qualify;
    /// validation and state-machine violations never do.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Database(err) => {
                let rendered = err.to_string();
                rendered.contains("read or write conflict")
                    || rendered.contains("timed out")
                    || rendered.contains("connection")
            }
            AppError::OpenAI(err) => match err {
                OpenAIError::Reqwest(_) | OpenAIError::StreamError(_) => true,
                OpenAIError::ApiError(api) => {
                    let rendered = api.to_string();
                    rendered.contains("rate_limit")
                        || rendered.contains("server_error")
                        || rendered.contains("overloaded")
                        || rendered.contains("timeout")
                }
                _ => false,
            },
            AppError::Io(_) => true,
            _ => false,
        }
    }
}
