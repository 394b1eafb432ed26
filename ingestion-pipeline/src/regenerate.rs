use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            concept::Concept,
            concept_embedding::ConceptEmbedding,
            job::{Job, JobPayload, JobResult, Progress, ResultBody},
            system_settings::SystemSettings,
        },
    },
    utils::{embedding::generate_embedding_with_params, retry::RetryPolicy, retry::retry},
};
use scheduler::JobExecutor;

use crate::matcher::concept_embedding_input;

const REGENERATE_EMBEDDINGS: &str = r"
    BEGIN TRANSACTION;
    FOR $e IN $embeddings {
        UPSERT type::thing('concept_embedding', $e.id) SET
            concept_id = $e.concept_id,
            embedding = $e.embedding,
            embedding_model = $model,
            ontologies = $e.ontologies,
            created_at = IF created_at != NONE THEN created_at ELSE time::now() END,
            updated_at = time::now();
    };
    COMMIT TRANSACTION;
";

#[derive(Serialize)]
struct RegeneratedRow {
    id: String,
    concept_id: String,
    embedding: Vec<f32>,
    ontologies: Vec<String>,
}

/// Re-embeds every concept with a new model/dimension pair, swaps the
/// vectors in one transaction, redefines the HNSW index, and invalidates
/// the vocabulary's cached embeddings. A costly background job.
pub struct EmbeddingRegenerateExecutor {
    db: Arc<SurrealDbClient>,
    client: Arc<async_openai::Client<async_openai::config::OpenAIConfig>>,
    retry_policy: RetryPolicy,
}

impl EmbeddingRegenerateExecutor {
    pub fn new(
        db: Arc<SurrealDbClient>,
        client: Arc<async_openai::Client<async_openai::config::OpenAIConfig>>,
    ) -> Self {
        Self {
            db,
            client,
            retry_policy: RetryPolicy::default(),
        }
    }
}

#[async_trait]
impl JobExecutor for EmbeddingRegenerateExecutor {
    async fn execute(&self, job: Job, cancel: CancellationToken) -> Result<JobResult, AppError> {
        let JobPayload::EmbeddingRegenerate { model, dimensions } = &job.payload else {
            return Err(AppError::Validation(
                "embedding_regenerate job carries a different payload".into(),
            ));
        };

        Job::update_progress(&job.id, Progress::Analyzing, &self.db).await?;

        let concepts: Vec<Concept> = self.db.get_all_stored_items().await?;
        let total = concepts.len();
        info!(
            job_id = %job.id,
            total,
            model = %model,
            dimensions,
            "regenerating concept embeddings"
        );

        // Generate everything in memory first; the swap happens only
        // when the full set is ready.
        let mut rows = Vec::with_capacity(total);
        for concept in &concepts {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }

            // Same delimiter as ingestion-time embedding, so regenerated
            // vectors stay comparable.
            let input = concept_embedding_input(&concept.label, &concept.search_terms);
            let embedding = retry(&self.retry_policy, "embedding.regenerate", || {
                generate_embedding_with_params(&self.client, &input, model, *dimensions)
            })
            .await?;

            if embedding.len() != *dimensions as usize {
                let message = format!(
                    "embedding for concept {} has dimension {}, expected {dimensions}; aborting",
                    concept.id,
                    embedding.len()
                );
                error!("{message}");
                return Err(AppError::InternalError(message));
            }

            rows.push(RegeneratedRow {
                id: concept.id.clone(),
                concept_id: concept.id.clone(),
                embedding,
                ontologies: concept.ontologies.clone(),
            });
        }

        if !rows.is_empty() {
            self.db
                .query(REGENERATE_EMBEDDINGS)
                .bind(("embeddings", rows))
                .bind(("model", model.clone()))
                .await?
                .check()?;
        }

        ConceptEmbedding::redefine_hnsw_index(&self.db, *dimensions as usize).await?;

        // Cached vocabulary embeddings were produced by the old model;
        // the next consolidation pass recomputes them.
        self.db
            .query("UPDATE vocabulary_entry SET embedding = NONE, embedding_model = NONE")
            .await?
            .check()?;

        let mut settings = SystemSettings::get_current(&self.db).await?;
        settings.embedding_model = model.clone();
        settings.embedding_dimensions = *dimensions;
        SystemSettings::update(&self.db, settings).await?;

        Job::update_progress(&job.id, Progress::Finalizing(Default::default()), &self.db).await?;

        Ok(JobResult::Succeeded(ResultBody {
            stats: Default::default(),
            cost: HashMap::new(),
            ontology: job.ontology,
            chunks_processed: 0,
            message: Some(format!("re-embedded {total} concepts with {model}")),
        }))
    }
}
