use std::sync::Arc;

use common::{
    storage::db::SurrealDbClient, storage::locks::WriteGuards, utils::config::get_config,
    utils::embedding::OpenAiEmbedder,
};
use ingestion_pipeline::{
    ConceptMatcher, EmbeddingRegenerateExecutor, IngestionConfig, IngestionExecutor,
    OpenAiExtractor, OpenAiVision,
};
use scheduler::{Scheduler, SchedulerConfig};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vocabulary::{VocabConsolidateExecutor, VocabularyConfig, VocabularyManager};

use common::storage::types::job::JobType;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let config = get_config()?;

    let db = Arc::new(
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await?,
    );
    db.ensure_initialized().await?;

    let openai_client = Arc::new(async_openai::Client::with_config(
        async_openai::config::OpenAIConfig::new()
            .with_api_key(&config.openai_api_key)
            .with_api_base(&config.openai_base_url),
    ));

    let guards = WriteGuards::new();
    let embedder = Arc::new(OpenAiEmbedder::new(openai_client.clone(), db.clone()));
    let vocabulary = Arc::new(VocabularyManager::new(
        db.clone(),
        embedder.clone(),
        guards.clone(),
        VocabularyConfig::default(),
    ));

    let ingestion = Arc::new(IngestionExecutor::new(
        db.clone(),
        Arc::new(OpenAiExtractor::new(openai_client.clone(), db.clone())),
        Arc::new(OpenAiVision::new(openai_client.clone(), db.clone())),
        ConceptMatcher::new(embedder.clone()),
        vocabulary.clone(),
        guards.clone(),
        IngestionConfig::default(),
    ));

    let mut scheduler = Scheduler::new(db.clone(), SchedulerConfig::from_app_config(&config));
    scheduler.register_executor(JobType::IngestText, ingestion.clone());
    scheduler.register_executor(JobType::IngestFile, ingestion.clone());
    scheduler.register_executor(JobType::IngestImage, ingestion);
    scheduler.register_executor(
        JobType::VocabConsolidate,
        Arc::new(VocabConsolidateExecutor::new(vocabulary)),
    );
    scheduler.register_executor(
        JobType::EmbeddingRegenerate,
        Arc::new(EmbeddingRegenerateExecutor::new(db.clone(), openai_client)),
    );

    let scheduler = Arc::new(scheduler);
    let handles = scheduler.start();
    info!("worker started; waiting for jobs");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested; draining workers");
    scheduler.shutdown().await;
    for handle in handles {
        handle.await?;
    }

    Ok(())
}
