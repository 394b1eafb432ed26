use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

/// Process-wide write coordination the database cannot provide on its
/// own.
///
/// * Per-ontology mutexes serialize the concept match + insert critical
///   section so two workers never create duplicate concepts for the same
///   label. The guard must not be held across LLM calls.
/// * The vocabulary guard is an advisory read/write lock: relationship
///   inserts take a read guard, a vocabulary merge takes the write guard
///   while it rewrites edge types.
#[derive(Clone, Default)]
pub struct WriteGuards {
    ontologies: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
    vocabulary: Arc<RwLock<()>>,
}

impl WriteGuards {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the upsert mutex for an ontology, creating it on first
    /// use.
    pub async fn ontology(&self, name: &str) -> Arc<Mutex<()>> {
        let mut registry = self.ontologies.lock().await;
        registry
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn vocabulary(&self) -> Arc<RwLock<()>> {
        self.vocabulary.clone()
    }
}
