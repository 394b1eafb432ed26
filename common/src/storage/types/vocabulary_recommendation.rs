use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecommendationKind {
    Merge { from_type: String, to_type: String },
    Prune { rel_type: String },
}

/// Who has to sign off before a recommendation is executed. `None` means
/// the manager may execute it unattended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ReviewLevel {
    None,
    Ai,
    Human,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationStatus {
    Pending,
    Executed,
    Dismissed,
}

stored_object!(VocabularyRecommendation, "vocabulary_recommendation", {
    recommendation: RecommendationKind,
    similarity: Option<f32>,
    value_score: Option<f64>,
    review_level: ReviewLevel,
    status: RecommendationStatus,
    rationale: String
});

impl VocabularyRecommendation {
    pub fn new(
        recommendation: RecommendationKind,
        similarity: Option<f32>,
        value_score: Option<f64>,
        review_level: ReviewLevel,
        rationale: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            recommendation,
            similarity,
            value_score,
            review_level,
            status: RecommendationStatus::Pending,
            rationale,
        }
    }

    pub async fn pending_at_or_below(
        level: ReviewLevel,
        db: &SurrealDbClient,
    ) -> Result<Vec<Self>, AppError> {
        let accepted: Vec<ReviewLevel> = match level {
            ReviewLevel::None => vec![ReviewLevel::None],
            ReviewLevel::Ai => vec![ReviewLevel::None, ReviewLevel::Ai],
            ReviewLevel::Human => vec![ReviewLevel::None, ReviewLevel::Ai, ReviewLevel::Human],
        };

        let mut response = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE status = $pending AND review_level INSIDE $levels
                 ORDER BY created_at ASC",
            )
            .bind(("table", Self::table_name()))
            .bind(("pending", RecommendationStatus::Pending))
            .bind(("levels", accepted))
            .await?;
        let rows: Vec<Self> = response.take(0)?;

        Ok(rows)
    }

    pub async fn mark(
        id: &str,
        status: RecommendationStatus,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        db.query(
            "UPDATE type::thing($table, $id) SET status = $status, updated_at = time::now()",
        )
        .bind(("table", Self::table_name()))
        .bind(("id", id.to_string()))
        .bind(("status", status))
        .await?
        .check()?;

        Ok(())
    }

    /// Drops pending recommendations so a fresh generation pass starts
    /// from a clean slate.
    pub async fn clear_pending(db: &SurrealDbClient) -> Result<(), AppError> {
        db.query("DELETE FROM type::table($table) WHERE status = $pending")
            .bind(("table", Self::table_name()))
            .bind(("pending", RecommendationStatus::Pending))
            .await?
            .check()?;

        Ok(())
    }
}
