use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(ConceptEmbedding, "concept_embedding", {
    concept_id: String,
    embedding: Vec<f32>,
    embedding_model: String,
    ontologies: Vec<String>
});

impl ConceptEmbedding {
    /// Embedding rows share their record key with the concept they belong
    /// to, so lookups never need a join.
    pub fn new(
        concept_id: &str,
        embedding: Vec<f32>,
        embedding_model: String,
        ontologies: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: concept_id.to_string(),
            created_at: now,
            updated_at: now,
            concept_id: concept_id.to_string(),
            embedding,
            embedding_model,
            ontologies,
        }
    }

    /// (Re)defines the HNSW index for the configured dimension. Used at
    /// startup and by the embedding-regeneration job when dimensions
    /// change.
    pub async fn redefine_hnsw_index(
        db: &SurrealDbClient,
        dimensions: usize,
    ) -> Result<(), AppError> {
        db.client
            .query(format!(
                "DEFINE INDEX OVERWRITE idx_embedding_concepts ON TABLE {} FIELDS embedding HNSW DIMENSION {dimensions}",
                Self::table_name()
            ))
            .await?
            .check()?;

        Ok(())
    }

    pub async fn get_by_concept_id(
        concept_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<Self>, AppError> {
        Ok(db.get_item(concept_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_embedding_shares_record_key_with_concept() {
        let database = Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("test_ns", &database)
            .await
            .expect("Failed to start in-memory surrealdb");
        ConceptEmbedding::redefine_hnsw_index(&db, 3)
            .await
            .expect("redefine index");

        let emb = ConceptEmbedding::new(
            "concept-123",
            vec![0.1, 0.2, 0.3],
            "test-model".to_string(),
            vec!["X".to_string()],
        );
        db.store_item(emb.clone()).await.expect("store");

        let fetched = ConceptEmbedding::get_by_concept_id("concept-123", &db)
            .await
            .expect("fetch");
        assert_eq!(fetched, Some(emb));
    }
}
