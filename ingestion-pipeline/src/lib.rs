#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod chunker;
pub mod extractor;
pub mod matcher;
pub mod pipeline;
pub mod regenerate;
pub mod vision;

pub use chunker::{BoundaryKind, Chunk, Chunker};
pub use extractor::{Extraction, ExtractionContext, Extractor, OpenAiExtractor};
pub use matcher::{ConceptMatcher, MatchDecision};
pub use pipeline::{IngestionConfig, IngestionExecutor, IngestionTuning};
pub use regenerate::EmbeddingRegenerateExecutor;
pub use vision::{OpenAiVision, VisionExtractor};
