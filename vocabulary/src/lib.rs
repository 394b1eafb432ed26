#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod curve;
pub mod executor;
pub mod manager;
pub mod recommend;

pub use curve::{AggressivenessProfile, Zone, ZoneThresholds};
pub use executor::VocabConsolidateExecutor;
pub use manager::{Resolution, VocabularyConfig, VocabularyManager, VocabularyStatus};
