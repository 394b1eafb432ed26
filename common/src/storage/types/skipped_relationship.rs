use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(SkippedRelationship, "skipped_relationship", {
    rel_type: String,
    occurrences: u64,
    sample_from: String,
    sample_to: String,
    last_ontology: String
});

impl SkippedRelationship {
    /// Atomic capture of a relationship type the extractor produced but
    /// the vocabulary does not know. Record key is the type name; repeat
    /// sightings bump the occurrence counter.
    pub async fn capture(
        rel_type: &str,
        sample_from: &str,
        sample_to: &str,
        ontology: &str,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        db.query(
            "UPSERT type::thing($table, $id) SET
                rel_type = $rel_type,
                occurrences += 1,
                sample_from = $sample_from,
                sample_to = $sample_to,
                last_ontology = $ontology,
                created_at = IF created_at != NONE THEN created_at ELSE time::now() END,
                updated_at = time::now()",
        )
        .bind(("table", Self::table_name()))
        .bind(("id", rel_type.to_string()))
        .bind(("rel_type", rel_type.to_string()))
        .bind(("sample_from", sample_from.to_string()))
        .bind(("sample_to", sample_to.to_string()))
        .bind(("ontology", ontology.to_string()))
        .await?
        .check()?;

        Ok(())
    }

    pub async fn list_by_occurrences(
        limit: usize,
        db: &SurrealDbClient,
    ) -> Result<Vec<Self>, AppError> {
        let mut response = db
            .query(
                "SELECT * FROM type::table($table) ORDER BY occurrences DESC LIMIT $limit",
            )
            .bind(("table", Self::table_name()))
            .bind(("limit", limit))
            .await?;
        let rows: Vec<Self> = response.take(0)?;

        Ok(rows)
    }
}
