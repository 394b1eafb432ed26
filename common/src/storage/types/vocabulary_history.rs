use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VocabularyAction {
    Merge,
    Prune,
    Add,
    Deactivate,
}

stored_object!(VocabularyHistory, "vocabulary_history", {
    action: VocabularyAction,
    from_type: Option<String>,
    to_type: Option<String>,
    reason: String,
    actor: String,
    edges_rewritten: usize,
    size_before: usize,
    size_after: usize,
    aggressiveness: f64,
    zone: String
});

impl VocabularyHistory {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        action: VocabularyAction,
        from_type: Option<String>,
        to_type: Option<String>,
        reason: String,
        actor: String,
        edges_rewritten: usize,
        size_before: usize,
        size_after: usize,
        aggressiveness: f64,
        zone: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            action,
            from_type,
            to_type,
            reason,
            actor,
            edges_rewritten,
            size_before,
            size_after,
            aggressiveness,
            zone,
        }
    }

    pub async fn list_recent(
        limit: usize,
        db: &SurrealDbClient,
    ) -> Result<Vec<Self>, AppError> {
        let mut response = db
            .query(
                "SELECT * FROM type::table($table) ORDER BY created_at DESC LIMIT $limit",
            )
            .bind(("table", Self::table_name()))
            .bind(("limit", limit))
            .await?;
        let rows: Vec<Self> = response.take(0)?;

        Ok(rows)
    }
}
