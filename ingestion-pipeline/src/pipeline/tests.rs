use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        locks::WriteGuards,
        types::{
            checkpoint::{checkpoint_lineage, Checkpoint, CheckpointLoad},
            concept::Concept,
            concept_embedding::ConceptEmbedding,
            instance::Instance,
            job::{
                ChunkingOptions, Job, JobPayload, JobResult, JobStatus, ProcessingMode, Progress,
            },
            relationship::Relationship,
            skipped_relationship::SkippedRelationship,
            source::Source,
        },
    },
    utils::{content_hash::hash_text, embedding::Embedder},
};
use scheduler::JobExecutor;
use vocabulary::{VocabularyConfig, VocabularyManager};

use crate::extractor::{
    Extraction, ExtractedConcept, ExtractedRelationship, ExtractionContext, Extractor,
};
use crate::matcher::{ConceptMatcher, EMBEDDING_INPUT_DELIMITER};
use crate::pipeline::{IngestionConfig, IngestionExecutor};
use crate::vision::VisionExtractor;

const DIM: usize = 8;

/// Deterministic embedder: known labels get fixed orthogonal unit
/// vectors; anything else lands on a hash-spread corner far from the
/// named ones.
struct FakeEmbedder;

fn label_vector(label: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; DIM];
    match label {
        "Zhuangzi" => v[0] = 1.0,
        "Butterfly" => v[1] = 1.0,
        "Dao" => v[2] = 1.0,
        "Dream" => v[3] = 1.0,
        _ => {
            let mut hash = 5381u64;
            for byte in label.bytes() {
                hash = hash.wrapping_mul(33).wrapping_add(u64::from(byte));
            }
            v[4 + (hash % 3) as usize] = 1.0;
            v[7] = 0.2;
        }
    }
    v
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, input: &str) -> Result<Vec<f32>, AppError> {
        let label = input.split(EMBEDDING_INPUT_DELIMITER).next().unwrap_or("");
        Ok(label_vector(label))
    }

    async fn dimensions(&self) -> Result<u32, AppError> {
        Ok(DIM as u32)
    }
}

/// Emits a concept (with a verbatim quote) for every registered keyword
/// found in the chunk, and a relationship for every registered pair
/// whose endpoints are both present.
#[derive(Clone)]
struct KeywordExtractor {
    keywords: Vec<&'static str>,
    pairs: Vec<(&'static str, &'static str, &'static str)>,
    calls: Arc<AtomicUsize>,
    cancel_after: Option<(usize, CancellationToken)>,
    bad_quote_for: Option<&'static str>,
}

impl KeywordExtractor {
    fn new(
        keywords: Vec<&'static str>,
        pairs: Vec<(&'static str, &'static str, &'static str)>,
    ) -> Self {
        Self {
            keywords,
            pairs,
            calls: Arc::new(AtomicUsize::new(0)),
            cancel_after: None,
            bad_quote_for: None,
        }
    }

    fn cancelling_after(mut self, calls: usize, token: CancellationToken) -> Self {
        self.cancel_after = Some((calls, token));
        self
    }

    fn with_bad_quote_for(mut self, keyword: &'static str) -> Self {
        self.bad_quote_for = Some(keyword);
        self
    }
}

#[async_trait]
impl Extractor for KeywordExtractor {
    async fn extract(
        &self,
        text: &str,
        _context: &ExtractionContext,
    ) -> Result<Extraction, AppError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((after, token)) = &self.cancel_after {
            if call > *after {
                token.cancel();
            }
        }

        let concepts: Vec<ExtractedConcept> = self
            .keywords
            .iter()
            .filter(|keyword| text.contains(**keyword))
            .map(|keyword| {
                let quote = if self.bad_quote_for == Some(*keyword) {
                    "this quote is nowhere in the chunk".to_string()
                } else {
                    (*keyword).to_string()
                };
                ExtractedConcept {
                    label: (*keyword).to_string(),
                    description: Some(format!("{keyword} as seen in the text")),
                    search_terms: vec![keyword.to_lowercase()],
                    evidence_quotes: vec![quote],
                }
            })
            .collect();

        let present: HashSet<&str> = concepts.iter().map(|c| c.label.as_str()).collect();
        let relationships = self
            .pairs
            .iter()
            .filter(|(from, to, _)| present.contains(*from) && present.contains(*to))
            .map(|(from, to, rel_type)| ExtractedRelationship {
                from_label: (*from).to_string(),
                to_label: (*to).to_string(),
                rel_type: (*rel_type).to_string(),
                confidence: 0.9,
                category: None,
            })
            .collect();

        Ok(Extraction {
            concepts,
            relationships,
            usage: None,
        })
    }
}

struct FakeVision;

#[async_trait]
impl VisionExtractor for FakeVision {
    async fn describe(&self, _image_bytes: &[u8], _content_type: &str) -> Result<String, AppError> {
        Ok("A painting shows Zhuangzi dreaming of a Butterfly.".to_string())
    }
}

async fn memory_db() -> Arc<SurrealDbClient> {
    let database = Uuid::new_v4().to_string();
    let db = SurrealDbClient::memory("test_ns", &database)
        .await
        .expect("Failed to start in-memory surrealdb");
    db.ensure_initialized().await.expect("initialize");
    ConceptEmbedding::redefine_hnsw_index(&db, DIM)
        .await
        .expect("redefine index");
    Arc::new(db)
}

fn build_executor(db: &Arc<SurrealDbClient>, extractor: Arc<dyn Extractor>) -> IngestionExecutor {
    let embedder: Arc<dyn Embedder> = Arc::new(FakeEmbedder);
    let guards = WriteGuards::new();
    let vocabulary = Arc::new(VocabularyManager::new(
        Arc::clone(db),
        Arc::clone(&embedder),
        guards.clone(),
        VocabularyConfig::default(),
    ));

    IngestionExecutor::new(
        Arc::clone(db),
        extractor,
        Arc::new(FakeVision),
        ConceptMatcher::new(embedder),
        vocabulary,
        guards,
        IngestionConfig::default(),
    )
}

fn small_options() -> ChunkingOptions {
    ChunkingOptions {
        target_words: 10,
        min_words: 3,
        max_words: 16,
        overlap_words: 2,
    }
}

fn processing_job(payload: JobPayload, ontology: &str, force: bool) -> Job {
    let now = Utc::now();
    let content_hash = payload.compute_content_hash();

    Job {
        id: Uuid::new_v4().to_string(),
        created_at: now,
        updated_at: now,
        job_type: payload.job_type(),
        status: JobStatus::Processing,
        ontology: ontology.to_string(),
        submitter_id: "tester".to_string(),
        processing_mode: ProcessingMode::Serial,
        content_hash,
        payload,
        analysis: None,
        progress: Progress::Queued,
        result: None,
        error: None,
        force,
        worker_id: Some("test-worker".to_string()),
        started_at: Some(now),
        approved_at: None,
        completed_at: None,
        expires_at: None,
    }
}

fn text_job(text: &str, ontology: &str, force: bool) -> Job {
    processing_job(
        JobPayload::Text {
            document: "scroll.txt".to_string(),
            text: text.to_string(),
            options: small_options(),
        },
        ontology,
        force,
    )
}

/// Two-chunk text: Zhuangzi appears in both halves, the butterfly only
/// in the first, the Dao only in the second.
fn two_chunk_text() -> String {
    let first = "Zhuangzi dreamt he was a Butterfly fluttering happily through the garden air.";
    let filler = "He woke and wondered about waking and dreaming for a long quiet while afterwards.";
    let second = "Later Zhuangzi spoke of the Dao and of things becoming other things without end.";
    format!("{first}\n\n{filler}\n\n{second}")
}

async fn concepts_by_label(label: &str, db: &SurrealDbClient) -> Vec<Concept> {
    db.query("SELECT * FROM concept WHERE label = $label")
        .bind(("label", label.to_string()))
        .await
        .expect("query")
        .take::<Vec<Concept>>(0)
        .expect("take")
}

#[tokio::test]
async fn test_serial_ingest_builds_graph_and_cleans_checkpoint() {
    let db = memory_db().await;
    let extractor = Arc::new(KeywordExtractor::new(
        vec!["Zhuangzi", "Butterfly", "Dao"],
        vec![
            ("Zhuangzi", "Butterfly", "SIMILAR_TO"),
            ("Zhuangzi", "Dao", "REFERS_TO"),
        ],
    ));
    let executor = build_executor(&db, extractor);

    let job = text_job(&two_chunk_text(), "X", false);
    db.store_item(job.clone()).await.expect("store job");

    let result = executor
        .execute(job.clone(), CancellationToken::new())
        .await
        .expect("execute");

    let JobResult::Succeeded(body) = result else {
        panic!("expected success");
    };
    assert!(body.chunks_processed >= 2);
    assert_eq!(body.stats.concepts_created, 3);
    assert!(body.stats.concepts_linked >= 1, "Zhuangzi relinked in later chunk");
    assert_eq!(body.stats.relationships_created, 2);
    assert_eq!(body.ontology, "X");

    // One concept per semantic identity.
    assert_eq!(concepts_by_label("Zhuangzi", &db).await.len(), 1);
    assert_eq!(concepts_by_label("Butterfly", &db).await.len(), 1);

    // Instances carry verbatim quotes referencing real sources.
    let zhuangzi = &concepts_by_label("Zhuangzi", &db).await[0];
    let instances = Instance::list_by_concept(&zhuangzi.id, &db).await.expect("instances");
    assert!(!instances.is_empty());
    for instance in &instances {
        let source: Option<Source> = db.get_item(&instance.source_id).await.expect("source");
        let source = source.expect("instance references stored source");
        assert!(source.full_text.contains(&instance.quote));
    }

    assert_eq!(
        Relationship::count_by_type("SIMILAR_TO", &db).await.expect("count"),
        1
    );
    assert_eq!(
        Relationship::count_by_type("REFERS_TO", &db).await.expect("count"),
        1
    );

    // Checkpoint removed on success.
    let lineage = checkpoint_lineage("X", "scroll.txt");
    let load = Checkpoint::load(&lineage, "sha256:whatever", &db)
        .await
        .expect("load");
    assert_eq!(load, CheckpointLoad::Fresh);

    // Progress reached a terminal ingest shape.
    let stored = Job::get(&job.id, &db).await.expect("get").expect("exists");
    assert!(matches!(stored.progress, Progress::Finalizing(_)));
}

#[tokio::test]
async fn test_empty_input_succeeds_with_zero_stats() {
    let db = memory_db().await;
    let extractor = Arc::new(KeywordExtractor::new(vec![], vec![]));
    let executor = build_executor(&db, extractor);

    let job = text_job("", "X", false);
    db.store_item(job.clone()).await.expect("store job");

    let result = executor
        .execute(job, CancellationToken::new())
        .await
        .expect("execute");

    let JobResult::Succeeded(body) = result else {
        panic!("expected success");
    };
    assert_eq!(body.chunks_processed, 0);
    assert_eq!(body.stats.concepts_created, 0);
    assert_eq!(body.stats.instances_created, 0);
}

#[tokio::test]
async fn test_invalid_evidence_quote_drops_instance_keeps_concept() {
    let db = memory_db().await;
    let extractor = Arc::new(
        KeywordExtractor::new(vec!["Zhuangzi", "Butterfly"], vec![])
            .with_bad_quote_for("Butterfly"),
    );
    let executor = build_executor(&db, extractor);

    let job = text_job(
        "Zhuangzi dreamt he was a Butterfly in the spring garden air today.",
        "X",
        false,
    );

    let result = executor
        .execute(job, CancellationToken::new())
        .await
        .expect("execute");
    let JobResult::Succeeded(body) = result else {
        panic!("expected success");
    };

    assert_eq!(body.stats.concepts_created, 2);
    assert_eq!(body.stats.instances_created, 1);
    assert_eq!(body.stats.instances_dropped, 1);

    let butterfly = &concepts_by_label("Butterfly", &db).await[0];
    let instances = Instance::list_by_concept(&butterfly.id, &db).await.expect("instances");
    assert!(instances.is_empty());
}

#[tokio::test]
async fn test_unknown_rel_type_skipped_and_captured_synonym_rewritten() {
    let db = memory_db().await;

    // LEADS_TO was merged into CAUSES at some point.
    db.query("UPDATE type::thing('vocabulary_entry', 'CAUSES') SET synonyms = ['LEADS_TO']")
        .await
        .expect("seed synonym");

    let extractor = Arc::new(KeywordExtractor::new(
        vec!["Zhuangzi", "Butterfly", "Dao"],
        vec![
            ("Zhuangzi", "Butterfly", "LEADS_TO"),
            ("Zhuangzi", "Dao", "ORBITS"),
        ],
    ));
    let executor = build_executor(&db, extractor);

    let job = text_job(
        "Zhuangzi dreamt of a Butterfly and then discussed the Dao at dawn.",
        "X",
        false,
    );

    let result = executor
        .execute(job, CancellationToken::new())
        .await
        .expect("execute");
    let JobResult::Succeeded(body) = result else {
        panic!("expected success");
    };

    assert_eq!(body.stats.relationships_created, 1);
    assert_eq!(body.stats.relationships_skipped, 1);

    // Synonym rewritten to the canonical type.
    assert_eq!(Relationship::count_by_type("CAUSES", &db).await.expect("count"), 1);
    assert_eq!(Relationship::count_by_type("LEADS_TO", &db).await.expect("count"), 0);

    // Unknown type captured for later curation, not autocreated.
    let skipped = SkippedRelationship::list_by_occurrences(10, &db)
        .await
        .expect("skipped");
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].rel_type, "ORBITS");
    assert!(
        common::storage::types::vocabulary_entry::VocabularyEntry::get("ORBITS", &db)
            .await
            .expect("get")
            .is_none()
    );
}

#[tokio::test]
async fn test_cancel_preserves_checkpoint_and_resume_completes() {
    let db = memory_db().await;
    let token = CancellationToken::new();
    let cancelling = Arc::new(
        KeywordExtractor::new(
            vec!["Zhuangzi", "Butterfly", "Dao"],
            vec![("Zhuangzi", "Dao", "REFERS_TO")],
        )
        .cancelling_after(1, token.clone()),
    );
    let executor = build_executor(&db, cancelling);

    let text = two_chunk_text();
    let job = text_job(&text, "R", false);
    db.store_item(job.clone()).await.expect("store job");

    let result = executor.execute(job.clone(), token).await.expect("execute");
    let JobResult::Cancelled(body) = result else {
        panic!("expected cancellation");
    };
    assert_eq!(body.chunks_processed, 1);

    // Checkpoint survives with the first chunk recorded.
    let lineage = checkpoint_lineage("R", "scroll.txt");
    let fingerprint = hash_text(&text);
    let load = Checkpoint::load(&lineage, &fingerprint, &db).await.expect("load");
    let CheckpointLoad::Resumed(checkpoint) = load else {
        panic!("expected a resumable checkpoint");
    };
    assert_eq!(checkpoint.chunks_processed, 1);

    let stored = Job::get(&job.id, &db).await.expect("get").expect("exists");
    assert!(matches!(stored.progress, Progress::Cancelled(_)));

    // Forced resubmission resumes from chunk 1 and completes the graph.
    let resume_extractor = Arc::new(KeywordExtractor::new(
        vec!["Zhuangzi", "Butterfly", "Dao"],
        vec![("Zhuangzi", "Dao", "REFERS_TO")],
    ));
    let resume_executor = build_executor(&db, resume_extractor.clone());
    let resumed_job = text_job(&text, "R", true);

    let result = resume_executor
        .execute(resumed_job, CancellationToken::new())
        .await
        .expect("resume");
    let JobResult::Succeeded(_) = result else {
        panic!("expected success");
    };

    // Only the remaining chunks were re-extracted.
    assert!(resume_extractor.calls.load(Ordering::SeqCst) < 3);

    // The resumed run's graph matches a clean run over the same input.
    let clean_db = memory_db().await;
    let clean_executor = build_executor(
        &clean_db,
        Arc::new(KeywordExtractor::new(
            vec!["Zhuangzi", "Butterfly", "Dao"],
            vec![("Zhuangzi", "Dao", "REFERS_TO")],
        )),
    );
    clean_executor
        .execute(text_job(&text, "R", false), CancellationToken::new())
        .await
        .expect("clean run");

    for label in ["Zhuangzi", "Butterfly", "Dao"] {
        assert_eq!(
            concepts_by_label(label, &db).await.len(),
            concepts_by_label(label, &clean_db).await.len(),
            "concept count diverged for {label}"
        );
    }
    assert_eq!(
        Relationship::count_by_type("REFERS_TO", &db).await.expect("count"),
        Relationship::count_by_type("REFERS_TO", &clean_db)
            .await
            .expect("count"),
    );

    // Checkpoint removed after the successful resume.
    let load = Checkpoint::load(&lineage, &fingerprint, &db).await.expect("load");
    assert_eq!(load, CheckpointLoad::Fresh);
}

#[tokio::test]
async fn test_fingerprint_mismatch_restarts_from_zero() {
    let db = memory_db().await;
    let text = two_chunk_text();

    // A checkpoint exists for this document, written over different
    // bytes.
    let lineage = checkpoint_lineage("X", "scroll.txt");
    let mut stale = Checkpoint::new(&lineage, "older-job", "sha256:somethingelse");
    stale.chunks_processed = 1;
    stale.char_position = 120;
    stale.save(&db).await.expect("save stale");

    let extractor = Arc::new(KeywordExtractor::new(vec!["Zhuangzi"], vec![]));
    let executor = build_executor(&db, extractor.clone());

    let result = executor
        .execute(text_job(&text, "X", false), CancellationToken::new())
        .await
        .expect("execute");
    let JobResult::Succeeded(body) = result else {
        panic!("expected success");
    };

    // All chunks processed from offset zero, not from the stale resume
    // point.
    assert!(body.chunks_processed >= 2);
    assert_eq!(extractor.calls.load(Ordering::SeqCst), body.chunks_processed);
}

#[tokio::test]
async fn test_already_ingested_content_deduplicates() {
    let db = memory_db().await;
    let make_extractor = || Arc::new(KeywordExtractor::new(vec!["Zhuangzi"], vec![]));

    let text = two_chunk_text();
    let first = build_executor(&db, make_extractor());
    first
        .execute(text_job(&text, "X", false), CancellationToken::new())
        .await
        .expect("first run");

    let second_extractor = make_extractor();
    let second = build_executor(&db, second_extractor.clone());
    let result = second
        .execute(text_job(&text, "X", false), CancellationToken::new())
        .await
        .expect("second run");

    let JobResult::Deduplicated(_) = result else {
        panic!("expected dedup result");
    };
    assert_eq!(second_extractor.calls.load(Ordering::SeqCst), 0);

    // force re-ingests.
    let forced_extractor = make_extractor();
    let forced = build_executor(&db, forced_extractor.clone());
    let result = forced
        .execute(text_job(&text, "X", true), CancellationToken::new())
        .await
        .expect("forced run");
    assert!(matches!(result, JobResult::Succeeded(_)));
    assert!(forced_extractor.calls.load(Ordering::SeqCst) > 0);

    // Re-running over committed sources replaces rather than duplicates.
    assert_eq!(concepts_by_label("Zhuangzi", &db).await.len(), 1);
}

#[tokio::test]
async fn test_parallel_chunks_do_not_duplicate_concepts() {
    let db = memory_db().await;
    let extractor = Arc::new(KeywordExtractor::new(vec!["Zhuangzi"], vec![]));
    let executor = build_executor(&db, extractor);

    let mut job = text_job(&two_chunk_text(), "X", false);
    job.processing_mode = ProcessingMode::Parallel;

    let result = executor
        .execute(job, CancellationToken::new())
        .await
        .expect("execute");
    let JobResult::Succeeded(body) = result else {
        panic!("expected success");
    };

    assert!(body.chunks_processed >= 2);
    assert_eq!(
        concepts_by_label("Zhuangzi", &db).await.len(),
        1,
        "parallel workers must not create duplicate concepts"
    );
    assert_eq!(body.stats.concepts_created, 1);
    assert!(body.stats.concepts_linked >= 1);
}

#[tokio::test]
async fn test_image_job_routes_through_vision() {
    let db = memory_db().await;
    let extractor = Arc::new(KeywordExtractor::new(vec!["Zhuangzi", "Butterfly"], vec![]));
    let executor = build_executor(&db, extractor);

    use base64::{engine::general_purpose::STANDARD, Engine as _};
    let job = processing_job(
        JobPayload::Image {
            file_name: "dream.png".to_string(),
            content_type: "image/png".to_string(),
            image_base64: STANDARD.encode(b"fake image bytes"),
            options: small_options(),
        },
        "X",
        false,
    );

    let result = executor
        .execute(job, CancellationToken::new())
        .await
        .expect("execute");
    let JobResult::Succeeded(body) = result else {
        panic!("expected success");
    };

    assert_eq!(body.chunks_processed, 1);
    assert_eq!(body.stats.concepts_created, 2);

    // The source row carries the image pointer.
    let sources: Vec<Source> = db
        .query("SELECT * FROM source WHERE document = 'dream.png'")
        .await
        .expect("query")
        .take(0)
        .expect("take");
    assert_eq!(sources.len(), 1);
    let image = sources[0].image.as_ref().expect("image metadata");
    assert_eq!(image.content_type, "image/png");
    assert_eq!(image.object_key, "dream.png");
}
