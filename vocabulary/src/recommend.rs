use std::collections::HashSet;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use common::{
    error::AppError,
    storage::types::{
        vocabulary_entry::VocabularyEntry,
        vocabulary_recommendation::{
            RecommendationKind, RecommendationStatus, ReviewLevel, VocabularyRecommendation,
        },
    },
    utils::embedding::cosine_similarity,
};

use crate::curve::Zone;
use crate::manager::{VocabularyManager, AUTO_ACTOR};

#[derive(Debug, Clone, PartialEq)]
pub struct ConsolidationReport {
    pub size_before: usize,
    pub size_after: usize,
    pub executed: usize,
    pub dry_run: bool,
    pub recommendations: Vec<VocabularyRecommendation>,
}

const MAX_CONSOLIDATION_ROUNDS: usize = 20;

impl VocabularyManager {
    /// Scans the active vocabulary and proposes merges (pairwise cosine
    /// similarity over cached embeddings) and prunes (low value score).
    /// GREEN zone produces nothing; deeper zones lower the thresholds by
    /// the aggressiveness curve. When `persist` is set the pending
    /// recommendation table is replaced with the fresh batch.
    pub async fn generate_recommendations(
        &self,
        persist: bool,
    ) -> Result<Vec<VocabularyRecommendation>, AppError> {
        let (size, zone, aggressiveness) = self.pressure_snapshot().await?;
        if zone == Zone::Green {
            return Ok(Vec::new());
        }

        let entries = VocabularyEntry::all_active(&self.db).await?;
        let mut embeddings = Vec::with_capacity(entries.len());
        for entry in &entries {
            embeddings.push(self.ensure_embedding(entry).await?);
        }

        let relief = self.config.threshold_relief * aggressiveness as f32;
        let strong = self.config.strong_threshold - relief;
        let moderate = self.config.moderate_threshold - relief;
        let moderate_review = match zone {
            Zone::Green | Zone::Watch => ReviewLevel::Human,
            Zone::Danger | Zone::Emergency => ReviewLevel::Ai,
        };
        let prune_review = match zone {
            Zone::Green | Zone::Watch => ReviewLevel::Human,
            Zone::Danger => ReviewLevel::Ai,
            Zone::Emergency => ReviewLevel::None,
        };

        let mut recommendations = Vec::new();
        let mut deprecated_already: HashSet<&str> = HashSet::new();

        for i in 0..entries.len() {
            for j in (i + 1)..entries.len() {
                let similarity = cosine_similarity(&embeddings[i], &embeddings[j]);
                if similarity < moderate {
                    continue;
                }

                // Deprecate the lesser-used side; never a builtin when the
                // other side can take the hit instead.
                let (mut keep, mut drop) = if entries[i].usage_count >= entries[j].usage_count {
                    (&entries[i], &entries[j])
                } else {
                    (&entries[j], &entries[i])
                };
                if drop.is_builtin {
                    if keep.is_builtin {
                        continue;
                    }
                    std::mem::swap(&mut keep, &mut drop);
                }
                if deprecated_already.contains(drop.rel_type.as_str()) {
                    continue;
                }
                deprecated_already.insert(drop.rel_type.as_str());

                let review_level = if similarity >= strong {
                    ReviewLevel::None
                } else {
                    moderate_review
                };
                recommendations.push(VocabularyRecommendation::new(
                    RecommendationKind::Merge {
                        from_type: drop.rel_type.clone(),
                        to_type: keep.rel_type.clone(),
                    },
                    Some(similarity),
                    None,
                    review_level,
                    format!(
                        "cosine similarity {similarity:.3} between {} and {}",
                        drop.rel_type, keep.rel_type
                    ),
                ));
            }
        }

        for entry in &entries {
            if entry.is_builtin || deprecated_already.contains(entry.rel_type.as_str()) {
                continue;
            }
            let score = self.value_score(entry).await?;
            if score < self.config.low_value_threshold {
                recommendations.push(VocabularyRecommendation::new(
                    RecommendationKind::Prune {
                        rel_type: entry.rel_type.clone(),
                    },
                    None,
                    Some(score),
                    prune_review,
                    format!("value score {score:.3} below threshold"),
                ));
            }
        }

        info!(
            size,
            zone = zone.as_str(),
            aggressiveness,
            proposed = recommendations.len(),
            "generated vocabulary recommendations"
        );

        if persist {
            VocabularyRecommendation::clear_pending(&self.db).await?;
            for recommendation in &recommendations {
                self.db.store_item(recommendation.clone()).await?;
            }
        }

        Ok(recommendations)
    }

    /// usage × recency × bridging, each normalized into [0, 1]. A type
    /// nobody uses scores zero regardless of the other factors.
    pub async fn value_score(&self, entry: &VocabularyEntry) -> Result<f64, AppError> {
        let usage = VocabularyEntry::refresh_usage_count(&entry.rel_type, &self.db).await?;
        if usage == 0 {
            return Ok(0.0);
        }
        let usage_factor = (usage as f64 / 50.0).min(1.0);

        #[derive(serde::Deserialize)]
        struct OntologyRow {
            ontology: String,
        }
        let mut response = self
            .db
            .query(
                "SELECT ontology FROM related_to WHERE rel_type = $rel_type GROUP BY ontology",
            )
            .bind(("rel_type", entry.rel_type.clone()))
            .await?;
        let ontologies: Vec<OntologyRow> = response.take(0)?;
        let bridging_factor = (ontologies.len() as f64 / 3.0).min(1.0);

        let days_idle = (chrono::Utc::now() - entry.updated_at).num_days().max(0) as f64;
        let recency_factor = 1.0 / (1.0 + days_idle / 30.0);

        Ok(usage_factor * recency_factor * bridging_factor)
    }

    /// Executes every pending recommendation the current zone allows to
    /// run unattended: WATCH only `review_level=none`, DANGER and
    /// EMERGENCY also `review_level=ai`.
    pub async fn execute_auto_approved(&self) -> Result<usize, AppError> {
        let (_, zone, _) = self.pressure_snapshot().await?;
        let eligible = match zone {
            Zone::Green | Zone::Watch => ReviewLevel::None,
            Zone::Danger | Zone::Emergency => ReviewLevel::Ai,
        };

        let pending = VocabularyRecommendation::pending_at_or_below(eligible, &self.db).await?;
        let mut executed = 0usize;

        for recommendation in pending {
            let outcome = match &recommendation.recommendation {
                RecommendationKind::Merge { from_type, to_type } => self
                    .merge(from_type, to_type, &recommendation.rationale, AUTO_ACTOR)
                    .await
                    .map(|_| ()),
                RecommendationKind::Prune { rel_type } => {
                    self.prune(rel_type, &recommendation.rationale, AUTO_ACTOR).await
                }
            };

            match outcome {
                Ok(()) => {
                    VocabularyRecommendation::mark(
                        &recommendation.id,
                        RecommendationStatus::Executed,
                        &self.db,
                    )
                    .await?;
                    executed += 1;
                }
                Err(AppError::Conflict(reason)) | Err(AppError::NotFound(reason)) => {
                    // Stale against a concurrent merge; drop it.
                    warn!(recommendation = %recommendation.id, %reason, "dismissing stale recommendation");
                    VocabularyRecommendation::mark(
                        &recommendation.id,
                        RecommendationStatus::Dismissed,
                        &self.db,
                    )
                    .await?;
                }
                Err(err) => return Err(err),
            }
        }

        Ok(executed)
    }

    /// Iterative consolidation toward `target_size`: generate, execute
    /// what the zone allows, repeat until the target is met or no safe
    /// candidates remain. `dry_run` returns the recommendations without
    /// mutating anything.
    pub async fn consolidate(
        &self,
        target_size: Option<usize>,
        dry_run: bool,
        prune_unused: bool,
        cancel: &CancellationToken,
    ) -> Result<ConsolidationReport, AppError> {
        let target = target_size.unwrap_or(self.config.thresholds.max);
        let (size_before, _, _) = self.pressure_snapshot().await?;

        if dry_run {
            let recommendations = self.generate_recommendations(false).await?;
            return Ok(ConsolidationReport {
                size_before,
                size_after: size_before,
                executed: 0,
                dry_run: true,
                recommendations,
            });
        }

        if prune_unused {
            let entries = VocabularyEntry::all_active(&self.db).await?;
            for entry in entries {
                if cancel.is_cancelled() {
                    return Err(AppError::Cancelled);
                }
                if entry.is_builtin {
                    continue;
                }
                if VocabularyEntry::refresh_usage_count(&entry.rel_type, &self.db).await? == 0 {
                    self.prune(&entry.rel_type, "unused type cleanup", AUTO_ACTOR)
                        .await?;
                }
            }
        }

        let mut executed = 0usize;
        for _ in 0..MAX_CONSOLIDATION_ROUNDS {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }

            let (size, _, _) = self.pressure_snapshot().await?;
            if size <= target {
                break;
            }

            self.generate_recommendations(true).await?;
            let round = self.execute_auto_approved().await?;
            if round == 0 {
                break;
            }
            executed += round;
        }

        let (size_after, _, _) = self.pressure_snapshot().await?;
        Ok(ConsolidationReport {
            size_before,
            size_after,
            executed,
            dry_run: false,
            recommendations: Vec::new(),
        })
    }
}
