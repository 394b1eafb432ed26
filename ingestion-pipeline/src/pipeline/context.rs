use std::collections::{BTreeMap, HashMap};

use common::storage::types::{
    checkpoint::Checkpoint,
    job::{IngestCounts, IngestStats, ProcessingMode, TokenCost},
};

/// Immutable facts about the running ingestion job.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: String,
    pub ontology: String,
    pub document: String,
    pub content_hash: Option<String>,
    pub lineage: String,
    pub processing_mode: ProcessingMode,
    pub chunks_total: usize,
    /// `(content_type, object_key)` for image jobs; the source rows
    /// carry it so viewers can fetch the original bytes.
    pub image: Option<(String, String)>,
}

/// Everything one chunk contributed, merged into the run state by the
/// coordinator. In parallel mode outcomes arrive out of order.
#[derive(Debug, Clone)]
pub struct ChunkOutcome {
    pub index: usize,
    pub end_offset: usize,
    pub delta: IngestStats,
    pub cost: Option<TokenCost>,
    pub touched_concepts: Vec<String>,
}

/// Mutable run state: the checkpoint being advanced plus accumulated
/// cost. The checkpoint only moves along the lowest contiguous completed
/// chunk index, so a crash never skips work.
#[derive(Debug)]
pub struct RunState {
    pub checkpoint: Checkpoint,
    pub cost: HashMap<String, TokenCost>,
    /// Completed chunk index -> end offset, for out-of-order completion.
    finished: BTreeMap<usize, usize>,
}

impl RunState {
    pub fn new(checkpoint: Checkpoint) -> Self {
        Self {
            checkpoint,
            cost: HashMap::new(),
            finished: BTreeMap::new(),
        }
    }

    pub fn apply(&mut self, outcome: ChunkOutcome) {
        self.checkpoint.stats.absorb(&outcome.delta);
        if let Some(cost) = &outcome.cost {
            self.cost.entry("openai".to_string()).or_default().absorb(cost);
        }
        self.checkpoint.remember_concepts(outcome.touched_concepts);

        self.finished.insert(outcome.index, outcome.end_offset);
        while let Some(end_offset) = self.finished.remove(&self.checkpoint.chunks_processed) {
            self.checkpoint.chunks_processed += 1;
            self.checkpoint.char_position = end_offset;
        }
    }

    pub fn counts(&self, chunks_total: usize) -> IngestCounts {
        let processed = self.checkpoint.chunks_processed;
        let percent = if chunks_total == 0 {
            100.0
        } else {
            processed as f32 / chunks_total as f32 * 100.0
        };

        IngestCounts {
            chunks_total: Some(chunks_total),
            chunks_processed: Some(processed),
            current_chunk: Some(processed),
            percent: Some(percent),
            concepts_created: Some(self.checkpoint.stats.concepts_created),
            concepts_linked: Some(self.checkpoint.stats.concepts_linked),
            sources_created: Some(self.checkpoint.stats.sources_created),
            instances_created: Some(self.checkpoint.stats.instances_created),
            relationships_created: Some(self.checkpoint.stats.relationships_created),
        }
    }
}
