use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceType {
    Document,
    Learned,
}

/// Metadata for sources whose original bytes live in an external object
/// store. The core only carries the pointer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageMetadata {
    pub content_type: String,
    pub object_key: String,
}

stored_object!(Source, "source", {
    document: String,
    chunk_index: usize,
    full_text: String,
    content_hash: Option<String>,
    start_offset: usize,
    end_offset: usize,
    source_type: SourceType,
    ontology: String,
    image: Option<ImageMetadata>
});

impl Source {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        document: String,
        chunk_index: usize,
        full_text: String,
        content_hash: Option<String>,
        start_offset: usize,
        end_offset: usize,
        ontology: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            document,
            chunk_index,
            full_text,
            content_hash,
            start_offset,
            end_offset,
            source_type: SourceType::Document,
            ontology,
            image: None,
        }
    }

    pub fn with_image(mut self, content_type: String, object_key: String) -> Self {
        self.image = Some(ImageMetadata {
            content_type,
            object_key,
        });
        self
    }

    /// Chunk sources are keyed by `(content_hash, chunk_index, ontology)`
    /// so a resumed run reuses the row it committed before the interrupt.
    pub async fn find_by_hash_and_index(
        content_hash: &str,
        chunk_index: usize,
        ontology: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<Self>, AppError> {
        let mut response = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE content_hash = $content_hash
                   AND chunk_index = $chunk_index
                   AND ontology = $ontology
                 LIMIT 1",
            )
            .bind(("table", Self::table_name()))
            .bind(("content_hash", content_hash.to_string()))
            .bind(("chunk_index", chunk_index))
            .bind(("ontology", ontology.to_string()))
            .await?;
        let rows: Vec<Self> = response.take(0)?;

        Ok(rows.into_iter().next())
    }

    /// All chunk indexes already committed for a document hash. Used for
    /// the fully-ingested dedup check at executor start.
    pub async fn committed_chunk_indexes(
        content_hash: &str,
        ontology: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<usize>, AppError> {
        #[derive(Deserialize)]
        struct Row {
            chunk_index: usize,
        }

        let mut response = db
            .query(
                "SELECT chunk_index FROM type::table($table)
                 WHERE content_hash = $content_hash AND ontology = $ontology
                 ORDER BY chunk_index ASC",
            )
            .bind(("table", Self::table_name()))
            .bind(("content_hash", content_hash.to_string()))
            .bind(("ontology", ontology.to_string()))
            .await?;
        let rows: Vec<Row> = response.take(0)?;

        Ok(rows.into_iter().map(|r| r.chunk_index).collect())
    }
}
