use std::sync::Arc;

use async_openai::types::CreateEmbeddingRequestArgs;
use async_trait::async_trait;
use tracing::debug;

use crate::{
    error::AppError,
    storage::{db::SurrealDbClient, types::system_settings::SystemSettings},
};

/// Embedding capability. The ingestion pipeline, the concept matcher and
/// the vocabulary manager all go through this seam; tests substitute a
/// deterministic fake.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, input: &str) -> Result<Vec<f32>, AppError>;

    /// Dimension of the vectors produced by the active model. Must match
    /// the HNSW index definition.
    async fn dimensions(&self) -> Result<u32, AppError>;
}

/// Embedder backed by the OpenAI embeddings endpoint. Model name and
/// dimensions are read from [`SystemSettings`] on every call so that a
/// settings change takes effect without a restart.
pub struct OpenAiEmbedder {
    client: Arc<async_openai::Client<async_openai::config::OpenAIConfig>>,
    db: Arc<SurrealDbClient>,
}

impl OpenAiEmbedder {
    pub fn new(
        client: Arc<async_openai::Client<async_openai::config::OpenAIConfig>>,
        db: Arc<SurrealDbClient>,
    ) -> Self {
        Self { client, db }
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, input: &str) -> Result<Vec<f32>, AppError> {
        let settings = SystemSettings::get_current(&self.db).await?;

        generate_embedding_with_params(
            &self.client,
            input,
            &settings.embedding_model,
            settings.embedding_dimensions,
        )
        .await
    }

    async fn dimensions(&self) -> Result<u32, AppError> {
        let settings = SystemSettings::get_current(&self.db).await?;
        Ok(settings.embedding_dimensions)
    }
}

/// Generates an embedding vector using a specific model and dimension.
///
/// Used by the re-embedding job where the target model and dimensions are
/// known ahead of time and shouldn't be repeatedly fetched from settings.
pub async fn generate_embedding_with_params(
    client: &async_openai::Client<async_openai::config::OpenAIConfig>,
    input: &str,
    model: &str,
    dimensions: u32,
) -> Result<Vec<f32>, AppError> {
    let request = CreateEmbeddingRequestArgs::default()
        .model(model)
        .input([input])
        .dimensions(dimensions)
        .build()?;

    let response = client.embeddings().create(request).await?;

    let embedding = response
        .data
        .first()
        .ok_or_else(|| AppError::Extraction("No embedding data received from API".into()))?
        .embedding
        .clone();

    debug!(
        "Embedding was created with {:?} dimensions",
        embedding.len()
    );

    Ok(embedding)
}

/// Cosine similarity between two vectors of equal dimension. Returns 0.0
/// for zero-magnitude inputs so degenerate embeddings never rank first.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identity() {
        let v = vec![0.3, 0.5, 0.2];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }
}
