use common::{storage::graph::GraphCommitTuning, utils::retry::RetryPolicy};

use crate::matcher::{DEFAULT_MATCH_CANDIDATES, INGESTION_MATCH_THRESHOLD};

#[derive(Debug, Clone)]
pub struct IngestionTuning {
    pub retry: RetryPolicy,
    pub graph: GraphCommitTuning,
    /// How many recent chunks of the same document prime the extractor.
    pub context_recent_chunks: usize,
    /// Concepts passed as context per chunk.
    pub context_concept_cap: usize,
    /// One-hop edges passed as context per chunk.
    pub context_edge_cap: usize,
    pub match_candidates: usize,
    pub match_threshold: f32,
    /// Chunks between checkpoint writes.
    pub checkpoint_interval: usize,
    pub parallel_chunk_workers: usize,
}

impl Default for IngestionTuning {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            graph: GraphCommitTuning::default(),
            context_recent_chunks: 3,
            context_concept_cap: 15,
            context_edge_cap: 20,
            match_candidates: DEFAULT_MATCH_CANDIDATES,
            match_threshold: INGESTION_MATCH_THRESHOLD,
            checkpoint_interval: 1,
            parallel_chunk_workers: 4,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IngestionConfig {
    pub tuning: IngestionTuning,
}
