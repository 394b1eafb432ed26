mod config;
mod context;
mod state;

pub use config::{IngestionConfig, IngestionTuning};
pub use context::{ChunkOutcome, JobContext, RunState};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::stream::{self, TryStreamExt};
use state_machines::core::GuardError;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        graph::{self, ChunkCommit, MatchedConcept, NewConcept},
        locks::WriteGuards,
        types::{
            checkpoint::{checkpoint_lineage, Checkpoint, CheckpointLoad},
            concept::Concept,
            concept_embedding::ConceptEmbedding,
            instance::Instance,
            job::{
                ChunkingOptions, IngestStats, Job, JobPayload, JobResult, ProcessingMode,
                Progress, ResultBody,
            },
            relationship::Relationship,
            source::Source,
            system_settings::SystemSettings,
            vocabulary_entry::VocabularyEntry,
        },
    },
    utils::{content_hash::input_fingerprint, embedding::cosine_similarity, retry::retry},
};
use scheduler::JobExecutor;
use vocabulary::{Resolution, VocabularyManager};

use crate::chunker::{Chunk, Chunker};
use crate::extractor::{
    ContextConcept, ContextEdge, Extraction, ExtractionContext, Extractor,
};
use crate::matcher::{ConceptMatcher, MatchDecision};
use crate::vision::VisionExtractor;

use self::state::ready;

/// Runs one ingestion job to a terminal state: chunk, prime, extract,
/// match, validate, commit, checkpoint. Serial and parallel chunk modes
/// share the same per-chunk path.
pub struct IngestionExecutor {
    db: Arc<SurrealDbClient>,
    extractor: Arc<dyn Extractor>,
    vision: Arc<dyn VisionExtractor>,
    matcher: ConceptMatcher,
    vocabulary: Arc<VocabularyManager>,
    guards: WriteGuards,
    config: IngestionConfig,
}

/// The text a job ingests plus where it came from.
struct PreparedInput {
    document: String,
    text: String,
    options: ChunkingOptions,
    fingerprint: String,
    image: Option<(String, String)>,
}

impl IngestionExecutor {
    pub fn new(
        db: Arc<SurrealDbClient>,
        extractor: Arc<dyn Extractor>,
        vision: Arc<dyn VisionExtractor>,
        matcher: ConceptMatcher,
        vocabulary: Arc<VocabularyManager>,
        guards: WriteGuards,
        config: IngestionConfig,
    ) -> Self {
        Self {
            db,
            extractor,
            vision,
            matcher,
            vocabulary,
            guards,
            config,
        }
    }

    async fn prepare_input(
        &self,
        job: &Job,
        cancel: &CancellationToken,
    ) -> Result<PreparedInput, AppError> {
        if !job.job_type.is_ingestion() {
            return Err(AppError::Validation(format!(
                "ingestion executor cannot run {:?} jobs",
                job.job_type
            )));
        }

        match &job.payload {
            JobPayload::Text {
                document,
                text,
                options,
            } => Ok(PreparedInput {
                document: document.clone(),
                text: text.clone(),
                options: *options,
                fingerprint: input_fingerprint(text.as_bytes()),
                image: None,
            }),
            JobPayload::File {
                file_name,
                text,
                options,
            } => Ok(PreparedInput {
                document: file_name.clone(),
                text: text.clone(),
                options: *options,
                fingerprint: input_fingerprint(text.as_bytes()),
                image: None,
            }),
            JobPayload::Image {
                file_name,
                content_type,
                image_base64,
                options,
            } => {
                let bytes = STANDARD.decode(image_base64).map_err(|e| {
                    AppError::Validation(format!("image payload is not valid base64: {e}"))
                })?;
                let fingerprint = input_fingerprint(&bytes);

                if cancel.is_cancelled() {
                    return Err(AppError::Cancelled);
                }
                let description = retry(&self.config.tuning.retry, "vision.describe", || {
                    self.vision.describe(&bytes, content_type)
                })
                .await?;
                if cancel.is_cancelled() {
                    return Err(AppError::Cancelled);
                }

                Ok(PreparedInput {
                    document: file_name.clone(),
                    text: description,
                    options: *options,
                    fingerprint,
                    image: Some((content_type.clone(), file_name.clone())),
                })
            }
            _ => Err(AppError::Validation(
                "ingestion executor received a non-ingestion payload".into(),
            )),
        }
    }

    /// Graph context priming: concepts from the recent-concept ring and
    /// the latest chunks of this document, plus one hop of their
    /// relationship cluster and the active vocabulary.
    async fn prime_context(
        &self,
        ctx: &JobContext,
        ring: &[String],
    ) -> Result<ExtractionContext, AppError> {
        let tuning = &self.config.tuning;

        let mut concepts = Concept::recent_in_document(
            &ctx.document,
            &ctx.ontology,
            tuning.context_recent_chunks,
            &self.db,
        )
        .await?;

        let mut seen: HashSet<String> = concepts.iter().map(|c| c.id.clone()).collect();
        let missing: Vec<String> = ring
            .iter()
            .filter(|id| !seen.contains(*id))
            .take(tuning.context_concept_cap)
            .cloned()
            .collect();
        for concept in Concept::get_many(&missing, &self.db).await? {
            seen.insert(concept.id.clone());
            concepts.push(concept);
        }
        concepts.truncate(tuning.context_concept_cap);

        let mut edges = Vec::new();
        for concept in concepts.iter().take(5) {
            edges.extend(Relationship::neighbors_of(&concept.id, None, &self.db).await?);
            if edges.len() >= tuning.context_edge_cap {
                break;
            }
        }
        edges.truncate(tuning.context_edge_cap);

        let mut labels: HashMap<String, String> = concepts
            .iter()
            .map(|c| (c.id.clone(), c.label.clone()))
            .collect();
        let unknown_endpoints: Vec<String> = edges
            .iter()
            .flat_map(|e| [e.in_.clone(), e.out.clone()])
            .filter(|id| !labels.contains_key(id))
            .collect();
        for concept in Concept::get_many(&unknown_endpoints, &self.db).await? {
            labels.insert(concept.id.clone(), concept.label);
        }

        let neighbor_relationships = edges
            .iter()
            .filter_map(|edge| {
                let from_label = labels.get(&edge.in_)?;
                let to_label = labels.get(&edge.out)?;
                Some(ContextEdge {
                    from_label: from_label.clone(),
                    to_label: to_label.clone(),
                    rel_type: edge.rel_type.clone(),
                })
            })
            .collect();

        let vocabulary = VocabularyEntry::all_active(&self.db)
            .await?
            .into_iter()
            .map(|entry| entry.rel_type)
            .collect();

        Ok(ExtractionContext {
            recent_concepts: concepts
                .into_iter()
                .map(|c| ContextConcept {
                    label: c.label,
                    description: c.description,
                    search_terms: c.search_terms,
                })
                .collect(),
            neighbor_relationships,
            vocabulary,
        })
    }

    /// Chunk pipeline: extract, match under the ontology mutex, validate
    /// evidence and vocabulary, commit in one transaction.
    #[instrument(level = "trace", skip_all, fields(job_id = %ctx.job_id, chunk = chunk.index))]
    async fn process_chunk(
        &self,
        ctx: &JobContext,
        chunk: &Chunk,
        ring: &[String],
        cancel: &CancellationToken,
    ) -> Result<ChunkOutcome, AppError> {
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        let tuning = &self.config.tuning;
        let context = self.prime_context(ctx, ring).await?;

        let extraction: Extraction = retry(&tuning.retry, "extractor.extract", || {
            self.extractor.extract(&chunk.text, &context)
        })
        .await?;

        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        debug!(
            job_id = %ctx.job_id,
            chunk = chunk.index,
            concepts = extraction.concepts.len(),
            relationships = extraction.relationships.len(),
            "chunk extraction completed"
        );

        let mut delta = IngestStats::default();
        let settings = SystemSettings::get_current(&self.db).await?;

        // Dedup extracted protos by label, then embed everything before
        // the ontology mutex is taken: the lock must never wrap an
        // embedding call.
        let mut protos: Vec<&crate::extractor::ExtractedConcept> = Vec::new();
        let mut seen_labels: HashSet<String> = HashSet::new();
        for proto in &extraction.concepts {
            if seen_labels.insert(proto.label.to_lowercase()) {
                protos.push(proto);
            }
        }
        let mut proto_embeddings = Vec::with_capacity(protos.len());
        for proto in &protos {
            proto_embeddings.push(
                self.matcher
                    .embed_proto(&proto.label, &proto.search_terms)
                    .await?,
            );
        }

        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        // Critical section: match + insert must be serialized per
        // ontology so concurrent chunk workers cannot create duplicate
        // concepts for one label.
        let ontology_mutex = self.guards.ontology(&ctx.ontology).await;
        let _upsert_guard = ontology_mutex.lock().await;

        let mut new_concepts: Vec<NewConcept> = Vec::new();
        let mut matched_concepts: Vec<MatchedConcept> = Vec::new();
        let mut label_to_id: HashMap<String, String> = HashMap::new();
        let mut touched: Vec<String> = Vec::new();

        for (proto, embedding) in protos.iter().zip(&proto_embeddings) {
            // Collapse near-duplicates within the chunk itself before
            // consulting the store.
            let in_chunk_twin = new_concepts.iter().find(|candidate| {
                cosine_similarity(&candidate.embedding.embedding, embedding)
                    >= tuning.match_threshold
            });
            if let Some(twin) = in_chunk_twin {
                label_to_id.insert(proto.label.clone(), twin.concept.id.clone());
                continue;
            }

            let decision = self
                .matcher
                .match_with_embedding(
                    embedding,
                    &ctx.ontology,
                    tuning.match_candidates,
                    tuning.match_threshold,
                    &self.db,
                )
                .await?;

            match decision {
                MatchDecision::Link {
                    concept_id,
                    similarity,
                } => {
                    debug!(
                        label = %proto.label,
                        concept_id = %concept_id,
                        similarity,
                        "linked extracted concept"
                    );
                    matched_concepts.push(MatchedConcept {
                        id: concept_id.clone(),
                        search_terms: proto.search_terms.clone(),
                        ontology: ctx.ontology.clone(),
                    });
                    label_to_id.insert(proto.label.clone(), concept_id.clone());
                    touched.push(concept_id);
                    delta.concepts_linked += 1;
                }
                MatchDecision::NewConcept => {
                    let concept = Concept::new(
                        proto.label.clone(),
                        proto.description.clone(),
                        proto.search_terms.clone(),
                        ctx.ontology.clone(),
                    );
                    let embedding_row = ConceptEmbedding::new(
                        &concept.id,
                        embedding.clone(),
                        settings.embedding_model.clone(),
                        concept.ontologies.clone(),
                    );
                    label_to_id.insert(proto.label.clone(), concept.id.clone());
                    touched.push(concept.id.clone());
                    delta.concepts_created += 1;
                    new_concepts.push(NewConcept {
                        concept,
                        embedding: embedding_row,
                    });
                }
            }
        }

        // Source row for this chunk, reused when a resumed run already
        // committed it.
        let (source, replace_source_effects) = match &ctx.content_hash {
            Some(hash) => {
                match Source::find_by_hash_and_index(hash, chunk.index, &ctx.ontology, &self.db)
                    .await?
                {
                    Some(existing) => (existing, true),
                    None => {
                        delta.sources_created += 1;
                        (
                            self.build_source(ctx, chunk, Some(hash.clone())),
                            false,
                        )
                    }
                }
            }
            None => {
                delta.sources_created += 1;
                (self.build_source(ctx, chunk, None), false)
            }
        };

        // Evidence instances: quotes must be verbatim substrings of the
        // chunk; a bad quote drops the instance, never the concept.
        let mut instances = Vec::new();
        for proto in &protos {
            let Some(concept_id) = label_to_id.get(&proto.label) else {
                continue;
            };
            for quote in &proto.evidence_quotes {
                match chunk.text.find(quote.as_str()) {
                    Some(position) if !quote.is_empty() => {
                        instances.push(Instance::new(
                            quote.clone(),
                            chunk.index,
                            chunk.start_offset + position,
                            source.id.clone(),
                            concept_id.clone(),
                            None,
                            ctx.ontology.clone(),
                        ));
                        delta.instances_created += 1;
                    }
                    _ => {
                        debug!(
                            label = %proto.label,
                            "dropping evidence quote that is not a verbatim substring"
                        );
                        delta.instances_dropped += 1;
                    }
                }
            }
        }

        // Relationships: endpoints resolved through this chunk's label
        // map, types validated against the vocabulary. Unknown types are
        // captured and dropped, never autocreated.
        let mut relationships = Vec::new();
        for rel in &extraction.relationships {
            let (Some(from_id), Some(to_id)) =
                (label_to_id.get(&rel.from_label), label_to_id.get(&rel.to_label))
            else {
                warn!(
                    from = %rel.from_label,
                    to = %rel.to_label,
                    rel_type = %rel.rel_type,
                    "dropping relationship with unresolved endpoint"
                );
                delta.relationships_skipped += 1;
                continue;
            };

            let resolution = self
                .vocabulary
                .resolve(&rel.rel_type, &rel.from_label, &rel.to_label, &ctx.ontology)
                .await?;
            let entry = match resolution {
                Resolution::Canonical(entry) => entry,
                Resolution::Synonym {
                    canonical,
                    requested,
                } => {
                    debug!(
                        requested = %requested,
                        canonical = %canonical.rel_type,
                        "rewrote synonym relationship type"
                    );
                    canonical
                }
                Resolution::Unknown => {
                    delta.relationships_skipped += 1;
                    continue;
                }
            };

            relationships.push(Relationship::new(
                from_id.clone(),
                to_id.clone(),
                entry.rel_type.clone(),
                rel.category.clone().unwrap_or(entry.category),
                rel.confidence.clamp(0.0, 1.0),
                None,
                None,
                source.id.clone(),
                ctx.ontology.clone(),
            ));
            delta.relationships_created += 1;
        }

        // Relationship inserts take the vocabulary read guard so a merge
        // cannot rewrite edge types mid-commit.
        let vocab_lock = self.guards.vocabulary();
        let _vocab_guard = vocab_lock.read().await;

        graph::commit_chunk(
            &self.db,
            ChunkCommit {
                new_concepts,
                matched_concepts,
                source: Some(source),
                replace_source_effects,
                instances,
                relationships,
            },
            &tuning.graph,
        )
        .await?;

        Ok(ChunkOutcome {
            index: chunk.index,
            end_offset: chunk.end_offset,
            delta,
            cost: extraction.usage,
            touched_concepts: touched,
        })
    }

    fn build_source(&self, ctx: &JobContext, chunk: &Chunk, hash: Option<String>) -> Source {
        let source = Source::new(
            ctx.document.clone(),
            chunk.index,
            chunk.text.clone(),
            hash,
            chunk.start_offset,
            chunk.end_offset,
            ctx.ontology.clone(),
        );

        match &ctx.image {
            Some((content_type, object_key)) => {
                source.with_image(content_type.clone(), object_key.clone())
            }
            None => source,
        }
    }

    async fn save_checkpoint(&self, state: &Arc<Mutex<RunState>>) -> Result<(), AppError> {
        let checkpoint = { state.lock().await.checkpoint.clone() };
        checkpoint.save(&self.db).await
    }

    async fn publish_progress(
        &self,
        ctx: &JobContext,
        state: &Arc<Mutex<RunState>>,
    ) -> Result<(), AppError> {
        let counts = { state.lock().await.counts(ctx.chunks_total) };
        Job::update_progress(&ctx.job_id, Progress::Extraction(counts), &self.db).await
    }

    async fn run_serial(
        &self,
        ctx: &JobContext,
        input: &PreparedInput,
        chunker: &Chunker,
        state: &Arc<Mutex<RunState>>,
        cancel: &CancellationToken,
    ) -> Result<(), AppError> {
        let (start, next_index) = {
            let guard = state.lock().await;
            (guard.checkpoint.char_position, guard.checkpoint.chunks_processed)
        };

        for chunk in chunker.resume(&input.text, start, next_index) {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }

            let ring = { state.lock().await.checkpoint.recent_concept_ids.clone() };
            let outcome = self.process_chunk(ctx, &chunk, &ring, cancel).await?;

            let processed = {
                let mut guard = state.lock().await;
                guard.apply(outcome);
                guard.checkpoint.chunks_processed
            };

            if processed % self.config.tuning.checkpoint_interval.max(1) == 0 {
                self.save_checkpoint(state).await?;
            }
            self.publish_progress(ctx, state).await?;
        }

        Ok(())
    }

    async fn run_parallel(
        &self,
        ctx: &JobContext,
        input: &PreparedInput,
        chunker: &Chunker,
        state: &Arc<Mutex<RunState>>,
        cancel: &CancellationToken,
    ) -> Result<(), AppError> {
        let (start, next_index) = {
            let guard = state.lock().await;
            (guard.checkpoint.char_position, guard.checkpoint.chunks_processed)
        };
        let chunks: Vec<Chunk> = chunker.resume(&input.text, start, next_index).collect();

        stream::iter(chunks.into_iter().map(Ok::<Chunk, AppError>))
            .try_for_each_concurrent(
                self.config.tuning.parallel_chunk_workers.max(1),
                |chunk| {
                    let state = Arc::clone(state);
                    async move {
                        if cancel.is_cancelled() {
                            return Err(AppError::Cancelled);
                        }

                        let ring =
                            { state.lock().await.checkpoint.recent_concept_ids.clone() };
                        let outcome = self.process_chunk(ctx, &chunk, &ring, cancel).await?;

                        {
                            let mut guard = state.lock().await;
                            guard.apply(outcome);
                        }
                        self.save_checkpoint(&state).await?;
                        self.publish_progress(ctx, &state).await?;
                        Ok(())
                    }
                },
            )
            .await
    }

    fn result_body(&self, ctx: &JobContext, state: &RunState, message: Option<String>) -> ResultBody {
        ResultBody {
            stats: state.checkpoint.stats.clone(),
            cost: state.cost.clone(),
            ontology: ctx.ontology.clone(),
            chunks_processed: state.checkpoint.chunks_processed,
            message,
        }
    }
}

fn map_guard_error(event: &str, guard: &GuardError) -> AppError {
    AppError::InternalError(format!(
        "invalid ingestion pipeline transition during {event}: {guard:?}"
    ))
}

#[async_trait]
impl JobExecutor for IngestionExecutor {
    #[instrument(skip_all, fields(job_id = %job.id, job_type = ?job.job_type, ontology = %job.ontology))]
    async fn execute(&self, job: Job, cancel: CancellationToken) -> Result<JobResult, AppError> {
        let machine = ready();

        let input = self.prepare_input(&job, &cancel).await?;
        let machine = machine
            .prepare()
            .map_err(|(_, guard)| map_guard_error("prepare", &guard))?;

        Job::update_progress(&job.id, Progress::Analyzing, &self.db).await?;

        let chunker = Chunker::new(input.options)?;
        let chunks_total = chunker.chunks(&input.text).count();

        let ctx = JobContext {
            job_id: job.id.clone(),
            ontology: job.ontology.clone(),
            document: input.document.clone(),
            content_hash: job.content_hash.clone(),
            lineage: checkpoint_lineage(&job.ontology, &input.document),
            processing_mode: job.processing_mode,
            chunks_total,
            image: input.image.clone(),
        };

        let checkpoint = match Checkpoint::load(&ctx.lineage, &input.fingerprint, &self.db).await? {
            CheckpointLoad::Resumed(checkpoint) => {
                info!(
                    job_id = %job.id,
                    chunks_processed = checkpoint.chunks_processed,
                    "resuming from checkpoint"
                );
                checkpoint
            }
            CheckpointLoad::FingerprintMismatch => {
                warn!(
                    job_id = %job.id,
                    "checkpoint fingerprint mismatch; restarting from zero"
                );
                Checkpoint::delete(&ctx.lineage, &self.db).await?;
                Checkpoint::new(&ctx.lineage, &job.id, &input.fingerprint)
            }
            CheckpointLoad::Fresh => {
                // Content fully ingested by an earlier run and not forced:
                // succeed without re-processing.
                if !job.force && chunks_total > 0 {
                    if let Some(hash) = &ctx.content_hash {
                        let committed =
                            Source::committed_chunk_indexes(hash, &ctx.ontology, &self.db).await?;
                        if committed.len() >= chunks_total {
                            info!(job_id = %job.id, "content already ingested; deduplicating");
                            return Ok(JobResult::Deduplicated(ResultBody {
                                stats: IngestStats::default(),
                                cost: HashMap::new(),
                                ontology: ctx.ontology.clone(),
                                chunks_processed: 0,
                                message: Some("content already fully ingested".to_string()),
                            }));
                        }
                    }
                }
                Checkpoint::new(&ctx.lineage, &job.id, &input.fingerprint)
            }
        };
        let machine = machine
            .resume()
            .map_err(|(_, guard)| map_guard_error("resume", &guard))?;

        Job::update_progress(
            &job.id,
            Progress::Chunking(RunState::new(checkpoint.clone()).counts(chunks_total)),
            &self.db,
        )
        .await?;

        let state = Arc::new(Mutex::new(RunState::new(checkpoint)));

        let run = match ctx.processing_mode {
            ProcessingMode::Serial => {
                self.run_serial(&ctx, &input, &chunker, &state, &cancel).await
            }
            ProcessingMode::Parallel => {
                self.run_parallel(&ctx, &input, &chunker, &state, &cancel).await
            }
        };

        match run {
            Ok(()) => {}
            Err(AppError::Cancelled) => {
                let _machine = machine
                    .abort()
                    .map_err(|(_, guard)| map_guard_error("abort", &guard))?;
                self.save_checkpoint(&state).await?;
                let guard = state.lock().await;
                Job::update_progress(
                    &job.id,
                    Progress::Cancelled(guard.counts(chunks_total)),
                    &self.db,
                )
                .await?;
                info!(job_id = %job.id, "ingestion cancelled; checkpoint preserved");
                return Ok(JobResult::Cancelled(self.result_body(&ctx, &guard, None)));
            }
            Err(err) => {
                if let Err((_, guard)) = machine.abort() {
                    warn!(
                        job_id = %job.id,
                        ?guard,
                        "invalid ingestion pipeline transition during abort"
                    );
                }
                // Keep the checkpoint for inspection and manual resume.
                if let Err(save_err) = self.save_checkpoint(&state).await {
                    warn!(job_id = %job.id, error = %save_err, "failed to persist checkpoint on error");
                }
                return Err(err);
            }
        }
        let machine = machine
            .extract()
            .map_err(|(_, guard)| map_guard_error("extract", &guard))?;

        let guard = state.lock().await;
        Job::update_progress(
            &job.id,
            Progress::Finalizing(guard.counts(chunks_total)),
            &self.db,
        )
        .await?;
        Checkpoint::delete(&ctx.lineage, &self.db).await?;

        let _machine = machine
            .finalize()
            .map_err(|(_, guard)| map_guard_error("finalize", &guard))?;

        info!(
            job_id = %job.id,
            chunks = guard.checkpoint.chunks_processed,
            concepts_created = guard.checkpoint.stats.concepts_created,
            concepts_linked = guard.checkpoint.stats.concepts_linked,
            "ingestion finished"
        );

        let has_image = input.image.is_some();
        let mut body = self.result_body(&ctx, &guard, None);
        if has_image {
            body.message = Some("image described and ingested".to_string());
        }

        Ok(JobResult::Succeeded(body))
    }
}

#[cfg(test)]
mod tests;
