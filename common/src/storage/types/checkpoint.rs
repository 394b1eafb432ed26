use crate::storage::types::job::IngestStats;
use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

/// Cap on the recent-concept ring carried for extractor context priming.
/// Both newly-created and linked concepts count.
pub const RECENT_CONCEPT_RING_CAP: usize = 50;

/// Record key under which a document's resume state lives. A forced
/// resubmission of the same document picks the checkpoint of the
/// cancelled run back up; the fingerprint decides whether that resume is
/// legal.
pub fn checkpoint_lineage(ontology: &str, document: &str) -> String {
    format!("{ontology}::{document}")
}

stored_object!(Checkpoint, "checkpoint", {
    schema_version: u32,
    job_id: String,
    input_fingerprint: String,
    char_position: usize,
    chunks_processed: usize,
    recent_concept_ids: Vec<String>,
    stats: IngestStats
});

/// Result of a resume attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointLoad {
    /// No checkpoint stored; start from offset zero.
    Fresh,
    /// Valid checkpoint for this input; continue from it.
    Resumed(Checkpoint),
    /// A checkpoint exists but was written for different input bytes.
    /// The caller must discard it and restart from zero.
    FingerprintMismatch,
}

impl Checkpoint {
    pub fn new(lineage: &str, job_id: &str, input_fingerprint: &str) -> Self {
        let now = Utc::now();
        Self {
            id: lineage.to_string(),
            created_at: now,
            updated_at: now,
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            job_id: job_id.to_string(),
            input_fingerprint: input_fingerprint.to_string(),
            char_position: 0,
            chunks_processed: 0,
            recent_concept_ids: Vec::new(),
            stats: IngestStats::default(),
        }
    }

    /// Pushes concept ids onto the ring, newest first, keeping the cap.
    pub fn remember_concepts(&mut self, ids: impl IntoIterator<Item = String>) {
        for id in ids {
            self.recent_concept_ids.retain(|existing| existing != &id);
            self.recent_concept_ids.insert(0, id);
        }
        self.recent_concept_ids.truncate(RECENT_CONCEPT_RING_CAP);
    }

    /// Loads the checkpoint for a document lineage, refusing resumes
    /// whose input bytes changed since the checkpoint was written.
    pub async fn load(
        lineage: &str,
        input_fingerprint: &str,
        db: &SurrealDbClient,
    ) -> Result<CheckpointLoad, AppError> {
        let stored: Option<Self> = db.get_item(lineage).await?;

        Ok(match stored {
            None => CheckpointLoad::Fresh,
            Some(checkpoint) if checkpoint.input_fingerprint == input_fingerprint => {
                CheckpointLoad::Resumed(checkpoint)
            }
            Some(_) => CheckpointLoad::FingerprintMismatch,
        })
    }

    /// Durable single-statement save; a partial write can never leave a
    /// malformed checkpoint behind.
    pub async fn save(&self, db: &SurrealDbClient) -> Result<(), AppError> {
        db.query("UPSERT type::thing($table, $id) CONTENT $checkpoint")
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("checkpoint", self.clone()))
            .await?
            .check()?;

        Ok(())
    }

    pub async fn delete(lineage: &str, db: &SurrealDbClient) -> Result<(), AppError> {
        let _removed: Option<Self> = db.delete_item(lineage).await?;
        Ok(())
    }
}
