use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

/// Builtin relationship types seeded at startup. Curators may deactivate
/// them but consolidation never deletes them.
pub const BUILTIN_RELATIONSHIP_TYPES: &[(&str, &str, &str)] = &[
    ("IS_A", "taxonomic", "Subject is a kind or instance of object"),
    ("PART_OF", "structural", "Subject is a component of object"),
    ("HAS_PART", "structural", "Subject contains object as a component"),
    ("CAUSES", "causal", "Subject brings about object"),
    ("ENABLES", "causal", "Subject makes object possible"),
    ("PREVENTS", "causal", "Subject stops object from occurring"),
    ("PRECEDES", "temporal", "Subject happens before object"),
    ("CONTRASTS_WITH", "comparative", "Subject is set against object"),
    ("SIMILAR_TO", "comparative", "Subject resembles object"),
    ("REFERS_TO", "referential", "Subject mentions or points at object"),
    ("DERIVED_FROM", "referential", "Subject originates from object"),
    ("SUPPORTS", "argumentative", "Subject provides evidence for object"),
    ("CONTRADICTS", "argumentative", "Subject provides evidence against object"),
    ("LOCATED_IN", "spatial", "Subject is situated within object"),
    ("PARTICIPATES_IN", "event", "Subject takes part in object"),
];

stored_object!(VocabularyEntry, "vocabulary_entry", {
    rel_type: String,
    category: String,
    description: String,
    is_builtin: bool,
    is_active: bool,
    usage_count: u64,
    embedding: Option<Vec<f32>>,
    embedding_model: Option<String>,
    synonyms: Vec<String>,
    deprecation_reason: Option<String>
});

impl VocabularyEntry {
    /// Entries use the uppercase-snake type name as their record key.
    pub fn new(rel_type: &str, category: &str, description: &str, is_builtin: bool) -> Self {
        let now = Utc::now();
        Self {
            id: rel_type.to_string(),
            created_at: now,
            updated_at: now,
            rel_type: rel_type.to_string(),
            category: category.to_string(),
            description: description.to_string(),
            is_builtin,
            is_active: true,
            usage_count: 0,
            embedding: None,
            embedding_model: None,
            synonyms: Vec::new(),
            deprecation_reason: None,
        }
    }

    pub async fn get(rel_type: &str, db: &SurrealDbClient) -> Result<Option<Self>, AppError> {
        Ok(db.get_item(rel_type).await?)
    }

    pub async fn all(db: &SurrealDbClient) -> Result<Vec<Self>, AppError> {
        Ok(db.get_all_stored_items::<Self>().await?)
    }

    pub async fn all_active(db: &SurrealDbClient) -> Result<Vec<Self>, AppError> {
        let mut response = db
            .query(
                "SELECT * FROM type::table($table) WHERE is_active = true ORDER BY rel_type ASC",
            )
            .bind(("table", Self::table_name()))
            .await?;
        let entries: Vec<Self> = response.take(0)?;

        Ok(entries)
    }

    /// Finds the active entry whose synonym list contains the name. A
    /// historical name redirects to exactly one canonical entry.
    pub async fn find_by_synonym(
        name: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<Self>, AppError> {
        let mut response = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE is_active = true AND $name INSIDE synonyms
                 LIMIT 1",
            )
            .bind(("table", Self::table_name()))
            .bind(("name", name.to_string()))
            .await?;
        let entries: Vec<Self> = response.take(0)?;

        Ok(entries.into_iter().next())
    }

    pub async fn set_embedding(
        rel_type: &str,
        embedding: Vec<f32>,
        model: &str,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        db.query(
            "UPDATE type::thing($table, $id) SET
                embedding = $embedding,
                embedding_model = $model,
                updated_at = time::now()",
        )
        .bind(("table", Self::table_name()))
        .bind(("id", rel_type.to_string()))
        .bind(("embedding", embedding))
        .bind(("model", model.to_string()))
        .await?
        .check()?;

        Ok(())
    }

    /// Recounts `usage_count` from live edges. The stored counter is an
    /// upper bound between refreshes.
    pub async fn refresh_usage_count(rel_type: &str, db: &SurrealDbClient) -> Result<u64, AppError> {
        let live = crate::storage::types::relationship::Relationship::count_by_type(rel_type, db)
            .await? as u64;

        db.query("UPDATE type::thing($table, $id) SET usage_count = $count, updated_at = time::now()")
            .bind(("table", Self::table_name()))
            .bind(("id", rel_type.to_string()))
            .bind(("count", live))
            .await?
            .check()?;

        Ok(live)
    }

    pub async fn seed_builtins(db: &SurrealDbClient) -> Result<(), AppError> {
        for (rel_type, category, description) in BUILTIN_RELATIONSHIP_TYPES {
            let existing: Option<Self> = db.get_item(rel_type).await?;
            if existing.is_none() {
                db.store_item(Self::new(rel_type, category, description, true))
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn memory_db() -> SurrealDbClient {
        let database = Uuid::new_v4().to_string();
        SurrealDbClient::memory("test_ns", &database)
            .await
            .expect("Failed to start in-memory surrealdb")
    }

    #[tokio::test]
    async fn test_seed_builtins_is_idempotent_and_preserves_edits() {
        let db = memory_db().await;

        VocabularyEntry::seed_builtins(&db).await.expect("seed");
        let all = VocabularyEntry::all(&db).await.expect("all");
        assert_eq!(all.len(), BUILTIN_RELATIONSHIP_TYPES.len());

        // Deactivate one entry, reseed, and confirm the edit survives.
        db.query("UPDATE type::thing('vocabulary_entry', 'IS_A') SET is_active = false")
            .await
            .expect("deactivate");
        VocabularyEntry::seed_builtins(&db).await.expect("reseed");

        let is_a = VocabularyEntry::get("IS_A", &db)
            .await
            .expect("get")
            .expect("exists");
        assert!(!is_a.is_active);
        assert_eq!(
            VocabularyEntry::all(&db).await.expect("all").len(),
            BUILTIN_RELATIONSHIP_TYPES.len()
        );
    }

    #[tokio::test]
    async fn test_find_by_synonym() {
        let db = memory_db().await;

        let mut canon = VocabularyEntry::new("CAUSES", "causal", "brings about", true);
        canon.synonyms = vec!["LEADS_TO".to_string(), "RESULTS_IN".to_string()];
        db.store_item(canon).await.expect("store");

        let hit = VocabularyEntry::find_by_synonym("LEADS_TO", &db)
            .await
            .expect("query")
            .expect("found");
        assert_eq!(hit.rel_type, "CAUSES");

        assert!(VocabularyEntry::find_by_synonym("UNKNOWN", &db)
            .await
            .expect("query")
            .is_none());
    }

    #[tokio::test]
    async fn test_all_active_excludes_deactivated() {
        let db = memory_db().await;

        db.store_item(VocabularyEntry::new("CAUSES", "causal", "", true))
            .await
            .expect("store");
        let mut dead = VocabularyEntry::new("LEADS_TO", "causal", "", false);
        dead.is_active = false;
        db.store_item(dead).await.expect("store");

        let active = VocabularyEntry::all_active(&db).await.expect("active");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].rel_type, "CAUSES");
    }
}
