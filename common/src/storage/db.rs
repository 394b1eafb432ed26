use crate::error::AppError;

use super::types::{
    concept_embedding::ConceptEmbedding, system_settings::SystemSettings,
    vocabulary_entry::VocabularyEntry, StoredObject,
};
use std::ops::Deref;
use surrealdb::{
    engine::any::{connect, Any},
    opt::auth::Root,
    Error, Surreal,
};

#[derive(Clone)]
pub struct SurrealDbClient {
    pub client: Surreal<Any>,
}

impl SurrealDbClient {
    /// Connects and authenticates a new database client scoped to the
    /// given namespace/database pair.
    pub async fn new(
        address: &str,
        username: &str,
        password: &str,
        namespace: &str,
        database: &str,
    ) -> Result<Self, Error> {
        let db = connect(address).await?;

        // Sign in to database
        db.signin(Root { username, password }).await?;

        // Set namespace
        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }

    /// Brings a fresh database up to the working schema: indexes, the
    /// settings row, and the builtin relationship vocabulary. Idempotent.
    pub async fn ensure_initialized(&self) -> Result<(), AppError> {
        SystemSettings::ensure_initialized(self).await?;
        self.build_indexes().await?;
        VocabularyEntry::seed_builtins(self).await?;

        Ok(())
    }

    pub async fn build_indexes(&self) -> Result<(), AppError> {
        let settings = SystemSettings::get_current(self).await?;
        ConceptEmbedding::redefine_hnsw_index(self, settings.embedding_dimensions as usize)
            .await?;

        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_job_status ON job FIELDS status")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_job_created ON job FIELDS created_at")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_job_dedup ON job FIELDS job_type, ontology, content_hash")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_source_hash ON source FIELDS content_hash, chunk_index")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_instance_source ON instance FIELDS source_id")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_instance_concept ON instance FIELDS concept_id")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_edge_type ON related_to FIELDS rel_type")
            .await?;

        Ok(())
    }

    pub async fn drop_table<T>(&self) -> Result<Vec<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        self.client.delete(T::table_name()).await
    }

    /// Stores an object in its table, keyed by the object's own id.
    pub async fn store_item<T>(&self, item: T) -> Result<Option<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        self.client
            .create((T::table_name(), item.get_id()))
            .content(item)
            .await
    }

    pub async fn get_all_stored_items<T>(&self) -> Result<Vec<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select(T::table_name()).await
    }

    pub async fn get_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select((T::table_name(), id)).await
    }

    pub async fn delete_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.delete((T::table_name(), id)).await
    }
}

impl Deref for SurrealDbClient {
    type Target = Surreal<Any>;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl SurrealDbClient {
    /// Create an in-memory SurrealDB client for testing.
    pub async fn memory(namespace: &str, database: &str) -> Result<Self, Error> {
        let db = connect("mem://").await?;

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }
}
