use serde::{Deserialize, Serialize};

use crate::{error::AppError, storage::db::SurrealDbClient, storage::types::StoredObject};

pub const DEFAULT_EXTRACTION_SYSTEM_PROMPT: &str = "You analyze a passage of text and extract the semantic concepts it contains, \
the verbatim quotes that evidence them, and the typed relationships between them. \
Reuse a concept from the provided graph context when the passage refers to the same thing. \
Relationship types must be drawn from the provided vocabulary; do not invent new types. \
Quotes must be exact substrings of the passage. Respond only with the requested JSON.";

pub const DEFAULT_VISION_PROMPT: &str = "Describe this image in thorough, factual prose. Name the entities, their \
relationships, any visible text, and the overall setting, so the description \
can be analyzed in place of the image.";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SystemSettings {
    pub id: String,
    pub processing_model: String,
    pub embedding_model: String,
    pub embedding_dimensions: u32,
    pub vision_model: String,
    pub extraction_system_prompt: String,
    pub vision_prompt: String,
}

impl StoredObject for SystemSettings {
    fn table_name() -> &'static str {
        "system_settings"
    }

    fn get_id(&self) -> &str {
        &self.id
    }
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            id: "current".to_string(),
            processing_model: "gpt-4o-mini".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            embedding_dimensions: 1536,
            vision_model: "gpt-4o-mini".to_string(),
            extraction_system_prompt: DEFAULT_EXTRACTION_SYSTEM_PROMPT.to_string(),
            vision_prompt: DEFAULT_VISION_PROMPT.to_string(),
        }
    }
}

impl SystemSettings {
    pub async fn get_current(db: &SurrealDbClient) -> Result<Self, AppError> {
        let settings: Option<Self> = db.get_item("current").await?;
        settings.ok_or(AppError::NotFound("System settings not found".into()))
    }

    pub async fn ensure_initialized(db: &SurrealDbClient) -> Result<(), AppError> {
        let existing: Option<Self> = db.get_item("current").await?;
        if existing.is_none() {
            db.store_item(Self::default()).await?;
        }
        Ok(())
    }

    pub async fn update(db: &SurrealDbClient, changes: Self) -> Result<Self, AppError> {
        let updated: Option<Self> = db
            .client
            .query("UPDATE type::thing('system_settings', 'current') MERGE $changes RETURN AFTER")
            .bind(("changes", changes))
            .await?
            .take(0)?;

        updated.ok_or(AppError::Validation(
            "Something went wrong updating the settings".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_settings_initialization_is_idempotent() {
        let database = Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("test_ns", &database)
            .await
            .expect("Failed to start in-memory surrealdb");

        SystemSettings::ensure_initialized(&db)
            .await
            .expect("initialize settings");
        let settings = SystemSettings::get_current(&db)
            .await
            .expect("get settings");
        assert_eq!(settings.id, "current");
        assert_eq!(settings.embedding_dimensions, 1536);

        SystemSettings::ensure_initialized(&db)
            .await
            .expect("second initialize");
        let again = SystemSettings::get_current(&db).await.expect("get again");
        assert_eq!(settings.processing_model, again.processing_model);
    }

    #[tokio::test]
    async fn test_update_merges_changes() {
        let database = Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("test_ns", &database)
            .await
            .expect("Failed to start in-memory surrealdb");
        SystemSettings::ensure_initialized(&db)
            .await
            .expect("initialize settings");

        let mut changes = SystemSettings::get_current(&db).await.expect("get");
        changes.embedding_model = "text-embedding-3-large".to_string();
        changes.embedding_dimensions = 3072;

        let updated = SystemSettings::update(&db, changes).await.expect("update");
        assert_eq!(updated.embedding_model, "text-embedding-3-large");
        assert_eq!(updated.embedding_dimensions, 3072);
    }
}
