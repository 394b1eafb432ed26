use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Duration};
use tracing::warn;

use crate::error::AppError;
use crate::storage::db::SurrealDbClient;
use crate::storage::types::{
    concept::Concept, concept_embedding::ConceptEmbedding, instance::Instance,
    relationship::Relationship, source::Source,
};

/// A concept created in this chunk together with its embedding row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewConcept {
    pub concept: Concept,
    pub embedding: ConceptEmbedding,
}

/// An existing concept this chunk linked to; its search terms and
/// ontology membership are merged in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchedConcept {
    pub id: String,
    pub search_terms: Vec<String>,
    pub ontology: String,
}

/// Everything one chunk commits to the graph. Applied in a single
/// transaction; either all of it lands or none of it does.
#[derive(Debug, Clone, Default)]
pub struct ChunkCommit {
    pub new_concepts: Vec<NewConcept>,
    pub matched_concepts: Vec<MatchedConcept>,
    pub source: Option<Source>,
    /// True when the source row already exists (a re-run after resume).
    /// Prior instances and edges of the source are replaced instead of
    /// duplicated.
    pub replace_source_effects: bool,
    pub instances: Vec<Instance>,
    pub relationships: Vec<Relationship>,
}

#[derive(Debug, Clone)]
pub struct GraphCommitTuning {
    pub attempts: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for GraphCommitTuning {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 800,
        }
    }
}

const COMMIT_CHUNK: &str = r"
    BEGIN TRANSACTION;

    FOR $c IN $concepts {
        CREATE type::thing('concept', $c.concept.id) CONTENT $c.concept;
        CREATE type::thing('concept_embedding', $c.embedding.id) CONTENT $c.embedding;
    };

    FOR $m IN $matched {
        UPDATE type::thing('concept', $m.id) SET
            search_terms = array::union(search_terms, $m.search_terms),
            ontologies = array::union(ontologies, [$m.ontology]),
            updated_at = time::now();
        UPDATE type::thing('concept_embedding', $m.id) SET
            ontologies = array::union(ontologies, [$m.ontology]),
            updated_at = time::now();
    };

    IF $source != NONE {
        IF $replace_source {
            DELETE instance WHERE source_id = $source.id;
            DELETE related_to WHERE source_id = $source.id;
        } ELSE {
            CREATE type::thing('source', $source.id) CONTENT $source;
        };
    };

    FOR $i IN $instances {
        CREATE type::thing('instance', $i.id) CONTENT $i;
    };

    FOR $r IN $relationships {
        LET $from = type::thing('concept', $r.in);
        LET $to = type::thing('concept', $r.out);
        RELATE $from->related_to->$to CONTENT {
            id: type::thing('related_to', $r.id),
            rel_type: $r.rel_type,
            category: $r.category,
            confidence: $r.confidence,
            direction: $r.direction,
            polarity: $r.polarity,
            source_id: $r.source_id,
            ontology: $r.ontology
        };
        UPDATE type::thing('vocabulary_entry', $r.rel_type) SET
            usage_count += 1,
            updated_at = time::now();
    };

    COMMIT TRANSACTION;
";

/// Applies a chunk's effects in one transaction, retrying the whole
/// transaction on engine write conflicts.
pub async fn commit_chunk(
    db: &SurrealDbClient,
    commit: ChunkCommit,
    tuning: &GraphCommitTuning,
) -> Result<(), AppError> {
    let ChunkCommit {
        new_concepts,
        matched_concepts,
        source,
        replace_source_effects,
        instances,
        relationships,
    } = commit;

    let mut backoff_ms = tuning.initial_backoff_ms;
    let last_attempt = tuning.attempts.saturating_sub(1);

    for attempt in 0..tuning.attempts {
        let result = db
            .client
            .query(COMMIT_CHUNK)
            .bind(("concepts", new_concepts.clone()))
            .bind(("matched", matched_concepts.clone()))
            .bind(("source", source.clone()))
            .bind(("replace_source", replace_source_effects))
            .bind(("instances", instances.clone()))
            .bind(("relationships", relationships.clone()))
            .await
            .and_then(surrealdb::Response::check);

        match result {
            Ok(_) => return Ok(()),
            Err(err) => {
                if is_retryable_conflict(&err) && attempt < last_attempt {
                    let next_attempt = attempt.saturating_add(1);
                    warn!(
                        attempt = next_attempt,
                        "Transient SurrealDB conflict while committing chunk; retrying"
                    );
                    sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = backoff_ms.saturating_mul(2).min(tuning.max_backoff_ms);
                    continue;
                }

                return Err(AppError::from(err));
            }
        }
    }

    Err(AppError::InternalError(
        "Failed to commit chunk effects after retries".to_string(),
    ))
}

fn is_retryable_conflict(error: &surrealdb::Error) -> bool {
    error
        .to_string()
        .contains("Failed to commit transaction due to a read or write conflict")
}
