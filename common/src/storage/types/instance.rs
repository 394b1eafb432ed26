use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(Instance, "instance", {
    quote: String,
    paragraph: usize,
    offset: usize,
    source_id: String,
    concept_id: String,
    confidence: Option<f32>,
    ontology: String
});

impl Instance {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        quote: String,
        paragraph: usize,
        offset: usize,
        source_id: String,
        concept_id: String,
        confidence: Option<f32>,
        ontology: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            quote,
            paragraph,
            offset,
            source_id,
            concept_id,
            confidence,
            ontology,
        }
    }

    pub async fn list_by_source(
        source_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<Self>, AppError> {
        let mut response = db
            .query("SELECT * FROM type::table($table) WHERE source_id = $source_id")
            .bind(("table", Self::table_name()))
            .bind(("source_id", source_id.to_string()))
            .await?;
        let rows: Vec<Self> = response.take(0)?;

        Ok(rows)
    }

    pub async fn list_by_concept(
        concept_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<Self>, AppError> {
        let mut response = db
            .query("SELECT * FROM type::table($table) WHERE concept_id = $concept_id")
            .bind(("table", Self::table_name()))
            .bind(("concept_id", concept_id.to_string()))
            .await?;
        let rows: Vec<Self> = response.take(0)?;

        Ok(rows)
    }

    /// Instances live and die with their source document.
    pub async fn delete_by_source_id(
        source_id: &str,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        db.query("DELETE FROM type::table($table) WHERE source_id = $source_id")
            .bind(("table", Self::table_name()))
            .bind(("source_id", source_id.to_string()))
            .await?
            .check()?;

        Ok(())
    }
}
