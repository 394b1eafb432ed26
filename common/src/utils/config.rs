use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub openai_api_key: String,
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    #[serde(default = "default_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_job_timeout_secs")]
    pub default_job_timeout_secs: u64,
    #[serde(default = "default_stuck_job_timeout_secs")]
    pub stuck_job_timeout_secs: u64,
    #[serde(default = "default_retention_days_completed")]
    pub retention_days_completed: i64,
    #[serde(default = "default_retention_days_failed")]
    pub retention_days_failed: i64,
    #[serde(default = "default_auto_approve_threshold_cost")]
    pub auto_approve_threshold_cost: f64,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_max_workers() -> usize {
    2
}

fn default_cleanup_interval_secs() -> u64 {
    300
}

fn default_job_timeout_secs() -> u64 {
    30 * 60
}

fn default_stuck_job_timeout_secs() -> u64 {
    60 * 60
}

fn default_retention_days_completed() -> i64 {
    7
}

fn default_retention_days_failed() -> i64 {
    30
}

fn default_auto_approve_threshold_cost() -> f64 {
    1.0
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}
