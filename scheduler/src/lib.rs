#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod config;
pub mod executor;
pub mod scheduler;

pub use config::{ApprovalPolicy, SchedulerConfig};
pub use executor::JobExecutor;
pub use scheduler::{NewSubmission, Scheduler};
