use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::types::source::deserialize_flexible_id;
use crate::{error::AppError, storage::db::SurrealDbClient};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DirectionSemantics {
    Outward,
    Inward,
    Bidirectional,
}

/// Typed directed edge between two concepts, stored as a `related_to`
/// graph edge. `in` is the from-concept, `out` the to-concept.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Relationship {
    #[serde(deserialize_with = "deserialize_flexible_id")]
    pub id: String,
    #[serde(rename = "in", deserialize_with = "deserialize_flexible_id")]
    pub in_: String,
    #[serde(deserialize_with = "deserialize_flexible_id")]
    pub out: String,
    pub rel_type: String,
    pub category: String,
    pub confidence: f32,
    pub direction: Option<DirectionSemantics>,
    pub polarity: Option<f32>,
    pub source_id: String,
    pub ontology: String,
}

pub const RELATIONSHIP_TABLE: &str = "related_to";

impl Relationship {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        from_id: String,
        to_id: String,
        rel_type: String,
        category: String,
        confidence: f32,
        direction: Option<DirectionSemantics>,
        polarity: Option<f32>,
        source_id: String,
        ontology: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            in_: from_id,
            out: to_id,
            rel_type,
            category,
            confidence,
            direction,
            polarity,
            source_id,
            ontology,
        }
    }

    pub async fn store(&self, db: &SurrealDbClient) -> Result<(), AppError> {
        db.client
            .query(
                r#"BEGIN TRANSACTION;
                LET $from = type::thing('concept', $from_id);
                LET $to = type::thing('concept', $to_id);
                LET $edge = type::thing('related_to', $edge_id);
                DELETE type::thing('related_to', $edge_id);
                RELATE $from->$edge->$to SET
                    rel_type = $rel_type,
                    category = $category,
                    confidence = $confidence,
                    direction = $direction,
                    polarity = $polarity,
                    source_id = $source_id,
                    ontology = $ontology;
                COMMIT TRANSACTION;"#,
            )
            .bind(("edge_id", self.id.clone()))
            .bind(("from_id", self.in_.clone()))
            .bind(("to_id", self.out.clone()))
            .bind(("rel_type", self.rel_type.clone()))
            .bind(("category", self.category.clone()))
            .bind(("confidence", self.confidence))
            .bind(("direction", self.direction))
            .bind(("polarity", self.polarity))
            .bind(("source_id", self.source_id.clone()))
            .bind(("ontology", self.ontology.clone()))
            .await?
            .check()?;

        Ok(())
    }

    pub async fn count_by_type(rel_type: &str, db: &SurrealDbClient) -> Result<usize, AppError> {
        #[derive(Deserialize)]
        struct Row {
            count: usize,
        }

        let mut response = db
            .query(
                "SELECT count() AS count FROM type::table($table)
                 WHERE rel_type = $rel_type GROUP ALL",
            )
            .bind(("table", RELATIONSHIP_TABLE))
            .bind(("rel_type", rel_type.to_string()))
            .await?;
        let rows: Vec<Row> = response.take(0)?;

        Ok(rows.first().map_or(0, |r| r.count))
    }

    /// Rewrites every edge of one type to another in a single statement.
    /// Returns the number of edges rewritten. Provenance fields on the
    /// edges are untouched.
    pub async fn rewrite_type(
        from_type: &str,
        to_type: &str,
        db: &SurrealDbClient,
    ) -> Result<usize, AppError> {
        let mut response = db
            .query(
                "UPDATE type::table($table)
                 SET rel_type = $to_type
                 WHERE rel_type = $from_type
                 RETURN AFTER",
            )
            .bind(("table", RELATIONSHIP_TABLE))
            .bind(("from_type", from_type.to_string()))
            .bind(("to_type", to_type.to_string()))
            .await?;
        let rewritten: Vec<Relationship> = response.take(0)?;

        Ok(rewritten.len())
    }

    /// One-hop relationship cluster around a concept, optionally filtered
    /// by type. Both edge directions are included.
    pub async fn neighbors_of(
        concept_id: &str,
        rel_type_filter: Option<&str>,
        db: &SurrealDbClient,
    ) -> Result<Vec<Relationship>, AppError> {
        let mut response = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE (in = type::thing('concept', $concept_id)
                     OR out = type::thing('concept', $concept_id))
                   AND ($rel_type = NONE OR rel_type = $rel_type)",
            )
            .bind(("table", RELATIONSHIP_TABLE))
            .bind(("concept_id", concept_id.to_string()))
            .bind(("rel_type", rel_type_filter.map(str::to_string)))
            .await?;
        let edges: Vec<Relationship> = response.take(0)?;

        Ok(edges)
    }

    pub async fn list_by_source(
        source_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<Relationship>, AppError> {
        let mut response = db
            .query("SELECT * FROM type::table($table) WHERE source_id = $source_id")
            .bind(("table", RELATIONSHIP_TABLE))
            .bind(("source_id", source_id.to_string()))
            .await?;
        let edges: Vec<Relationship> = response.take(0)?;

        Ok(edges)
    }

    pub async fn delete_by_source_id(
        source_id: &str,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        db.query("DELETE FROM type::table($table) WHERE source_id = $source_id")
            .bind(("table", RELATIONSHIP_TABLE))
            .bind(("source_id", source_id.to_string()))
            .await?
            .check()?;

        Ok(())
    }
}
