use uuid::Uuid;

use crate::{
    error::AppError,
    storage::db::SurrealDbClient,
    storage::types::concept_embedding::ConceptEmbedding,
    stored_object,
};

stored_object!(Concept, "concept", {
    label: String,
    description: Option<String>,
    search_terms: Vec<String>,
    ontologies: Vec<String>
});

/// Vector search hit with the hydrated concept row.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ConceptVectorResult {
    pub concept: Concept,
    pub score: f32,
}

impl Concept {
    pub fn new(
        label: String,
        description: Option<String>,
        search_terms: Vec<String>,
        ontology: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            label,
            description,
            search_terms,
            ontologies: vec![ontology],
        }
    }

    /// Atomically store a concept and its embedding. Writes the concept to
    /// `concept` and the embedding to `concept_embedding` in one
    /// transaction so neither can exist without the other.
    pub async fn store_with_embedding(
        concept: Concept,
        embedding: Vec<f32>,
        embedding_model: String,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        let emb = ConceptEmbedding::new(
            &concept.id,
            embedding,
            embedding_model,
            concept.ontologies.clone(),
        );

        let query = format!(
            "
            BEGIN TRANSACTION;
              CREATE type::thing('{concept_table}', $concept_id) CONTENT $concept;
              CREATE type::thing('{emb_table}', $emb_id) CONTENT $emb;
            COMMIT TRANSACTION;
            ",
            concept_table = Self::table_name(),
            emb_table = ConceptEmbedding::table_name(),
        );

        db.client
            .query(query)
            .bind(("concept_id", concept.id.clone()))
            .bind(("concept", concept))
            .bind(("emb_id", emb.id.clone()))
            .bind(("emb", emb))
            .await
            .map_err(AppError::Database)?
            .check()
            .map_err(AppError::Database)?;

        Ok(())
    }

    /// Vector search over concepts in an ontology using the embedding
    /// table, fetching full concept rows and cosine scores. Ties are
    /// broken deterministically: earlier-created concept first, then id.
    pub async fn vector_search(
        take: usize,
        query_embedding: Vec<f32>,
        ontology: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<ConceptVectorResult>, AppError> {
        #[derive(Deserialize)]
        struct Row {
            concept_id: Concept,
            score: f32,
        }

        let sql = format!(
            r#"
            SELECT
                concept_id,
                vector::similarity::cosine(embedding, $embedding) AS score
            FROM {emb_table}
            WHERE $ontology INSIDE ontologies
              AND embedding <|{take},100|> $embedding
            ORDER BY score DESC
            LIMIT {take}
            FETCH concept_id;
            "#,
            emb_table = ConceptEmbedding::table_name(),
            take = take
        );

        let mut response = db
            .query(&sql)
            .bind(("embedding", query_embedding))
            .bind(("ontology", ontology.to_string()))
            .await
            .map_err(AppError::Database)?;

        response = response.check().map_err(AppError::Database)?;

        let rows: Vec<Row> = response.take::<Vec<Row>>(0).map_err(AppError::Database)?;

        let mut results: Vec<ConceptVectorResult> = rows
            .into_iter()
            .map(|r| ConceptVectorResult {
                concept: r.concept_id,
                score: r.score,
            })
            .collect();

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.concept.created_at.cmp(&b.concept.created_at))
                .then_with(|| a.concept.id.cmp(&b.concept.id))
        });

        Ok(results)
    }

    /// Set-union merge of search terms plus ontology membership, applied
    /// to both the concept row and its embedding row.
    pub async fn merge_search_terms(
        id: &str,
        terms: Vec<String>,
        ontology: &str,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        db.client
            .query(
                "BEGIN TRANSACTION;
                 UPDATE type::thing($table, $id) SET
                     search_terms = array::union(search_terms, $terms),
                     ontologies = array::union(ontologies, [$ontology]),
                     updated_at = time::now();
                 UPDATE type::thing($emb_table, $id) SET
                     ontologies = array::union(ontologies, [$ontology]),
                     updated_at = time::now();
                 COMMIT TRANSACTION;",
            )
            .bind(("table", Self::table_name()))
            .bind(("emb_table", ConceptEmbedding::table_name()))
            .bind(("id", id.to_string()))
            .bind(("terms", terms))
            .bind(("ontology", ontology.to_string()))
            .await?
            .check()?;

        Ok(())
    }

    /// Concepts evidenced by the most recent chunks of a document, used to
    /// prime the extractor with graph context.
    pub async fn recent_in_document(
        document: &str,
        ontology: &str,
        recent_chunks: usize,
        db: &SurrealDbClient,
    ) -> Result<Vec<Concept>, AppError> {
        let mut response = db
            .query(
                "LET $sources = (
                     SELECT VALUE record::id(id) FROM source
                     WHERE document = $document AND ontology = $ontology
                     ORDER BY chunk_index DESC
                     LIMIT $recent_chunks
                 );
                 SELECT * FROM type::table($table)
                 WHERE id INSIDE (
                     SELECT VALUE type::thing($table, concept_id) FROM instance
                     WHERE source_id INSIDE $sources
                 )
                 ORDER BY created_at DESC",
            )
            .bind(("table", Self::table_name()))
            .bind(("document", document.to_string()))
            .bind(("ontology", ontology.to_string()))
            .bind(("recent_chunks", recent_chunks))
            .await?;
        let last = response.num_statements() - 1;
        let concepts: Vec<Concept> = response.take(last)?;

        Ok(concepts)
    }

    pub async fn get_many(ids: &[String], db: &SurrealDbClient) -> Result<Vec<Concept>, AppError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let things: Vec<String> = ids.to_vec();
        let mut response = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE record::id(id) INSIDE $ids",
            )
            .bind(("table", Self::table_name()))
            .bind(("ids", things))
            .await?;
        let concepts: Vec<Concept> = response.take(0)?;

        Ok(concepts)
    }
}
