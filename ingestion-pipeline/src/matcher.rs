use std::sync::Arc;

use common::{
    error::AppError,
    storage::{db::SurrealDbClient, types::concept::Concept},
    utils::embedding::Embedder,
};

/// Delimiter joining a concept's label and search terms into the
/// embedding input. The same delimiter is used at extraction time and at
/// regeneration time so vectors stay comparable across jobs.
pub const EMBEDDING_INPUT_DELIMITER: &str = " | ";

/// Default similarity threshold for ingestion-time matching.
pub const INGESTION_MATCH_THRESHOLD: f32 = 0.85;

/// Looser threshold used by recursive upsert of learned syntheses.
pub const RECURSIVE_UPSERT_THRESHOLD: f32 = 0.75;

pub const DEFAULT_MATCH_CANDIDATES: usize = 5;

pub fn concept_embedding_input(label: &str, search_terms: &[String]) -> String {
    let mut parts = Vec::with_capacity(search_terms.len() + 1);
    parts.push(label.to_string());
    parts.extend(search_terms.iter().cloned());
    parts.join(EMBEDDING_INPUT_DELIMITER)
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchDecision {
    NewConcept,
    Link { concept_id: String, similarity: f32 },
}

/// Decides whether an extracted proto-concept is new or a reuse of an
/// existing concept in the ontology. Read-only; deterministic given the
/// embedder's output.
pub struct ConceptMatcher {
    embedder: Arc<dyn Embedder>,
}

impl ConceptMatcher {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self { embedder }
    }

    pub async fn embed_proto(
        &self,
        label: &str,
        search_terms: &[String],
    ) -> Result<Vec<f32>, AppError> {
        let input = concept_embedding_input(label, search_terms);
        self.embedder.embed(&input).await
    }

    /// Returns the decision together with the query embedding so the
    /// caller can reuse it for the insert without re-embedding.
    pub async fn match_proto(
        &self,
        label: &str,
        search_terms: &[String],
        ontology: &str,
        k: usize,
        threshold: f32,
        db: &SurrealDbClient,
    ) -> Result<(MatchDecision, Vec<f32>), AppError> {
        let embedding = self.embed_proto(label, search_terms).await?;
        let decision = self
            .match_with_embedding(&embedding, ontology, k, threshold, db)
            .await?;

        Ok((decision, embedding))
    }

    /// Match phase alone, for callers that embed ahead of time: the
    /// upsert critical section may hold the per-ontology mutex across
    /// this call (a storage query) but never across the embedding call.
    pub async fn match_with_embedding(
        &self,
        embedding: &[f32],
        ontology: &str,
        k: usize,
        threshold: f32,
        db: &SurrealDbClient,
    ) -> Result<MatchDecision, AppError> {
        let candidates = Concept::vector_search(k, embedding.to_vec(), ontology, db).await?;

        // vector_search already breaks ties toward the earlier-created
        // concept, so the first hit is the canonical winner.
        let decision = match candidates.first() {
            Some(best) if best.score >= threshold => MatchDecision::Link {
                concept_id: best.concept.id.clone(),
                similarity: best.score,
            },
            _ => MatchDecision::NewConcept,
        };

        Ok(decision)
    }
}
