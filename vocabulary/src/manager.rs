use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        locks::WriteGuards,
        types::{
            relationship::Relationship,
            skipped_relationship::SkippedRelationship,
            system_settings::SystemSettings,
            vocabulary_entry::VocabularyEntry,
            vocabulary_history::{VocabularyAction, VocabularyHistory},
        },
    },
    utils::embedding::Embedder,
};

use crate::curve::{AggressivenessProfile, Zone, ZoneThresholds};

/// Actor name used for unattended consolidation; builtin entries refuse
/// destructive actions from it.
pub const AUTO_ACTOR: &str = "consolidation";

#[derive(Debug, Clone)]
pub struct VocabularyConfig {
    pub thresholds: ZoneThresholds,
    pub profile: AggressivenessProfile,
    pub strong_threshold: f32,
    pub moderate_threshold: f32,
    pub low_value_threshold: f64,
    /// How far aggressiveness may pull the similarity thresholds down.
    pub threshold_relief: f32,
}

impl Default for VocabularyConfig {
    fn default() -> Self {
        Self {
            thresholds: ZoneThresholds::default(),
            profile: AggressivenessProfile::default(),
            strong_threshold: 0.90,
            moderate_threshold: 0.70,
            low_value_threshold: 0.15,
            threshold_relief: 0.08,
        }
    }
}

/// Outcome of resolving an extracted relationship type name.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Canonical(VocabularyEntry),
    Synonym {
        canonical: VocabularyEntry,
        requested: String,
    },
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VocabularyStatus {
    pub size: usize,
    pub zone: String,
    pub aggressiveness: f64,
    pub min: usize,
    pub max: usize,
    pub emergency: usize,
    pub builtin_count: usize,
    pub custom_count: usize,
    pub categories_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeReport {
    pub edges_rewritten: usize,
    pub size_before: usize,
    pub size_after: usize,
}

const MERGE_TYPES: &str = r"
    BEGIN TRANSACTION;
    UPDATE related_to SET rel_type = $target WHERE rel_type = $deprecated;
    UPDATE type::thing('vocabulary_entry', $deprecated) SET
        is_active = false,
        deprecation_reason = $reason,
        updated_at = time::now();
    UPDATE type::thing('vocabulary_entry', $target) SET
        synonyms = array::union(synonyms, $synonyms),
        usage_count += $moved_edges,
        updated_at = time::now();
    COMMIT TRANSACTION;
";

/// Keeps the relationship-type vocabulary small, semantically meaningful
/// and self-healing.
pub struct VocabularyManager {
    pub(crate) db: Arc<SurrealDbClient>,
    pub(crate) embedder: Arc<dyn Embedder>,
    pub(crate) guards: WriteGuards,
    pub(crate) config: VocabularyConfig,
}

/// Uppercase-snake normalization applied to every type name crossing the
/// vocabulary boundary.
pub fn normalize_rel_type(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_separator = true;
    for ch in name.trim().chars() {
        if ch.is_alphanumeric() {
            out.extend(ch.to_uppercase());
            last_was_separator = false;
        } else if !last_was_separator {
            out.push('_');
            last_was_separator = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

impl VocabularyManager {
    pub fn new(
        db: Arc<SurrealDbClient>,
        embedder: Arc<dyn Embedder>,
        guards: WriteGuards,
        config: VocabularyConfig,
    ) -> Self {
        Self {
            db,
            embedder,
            guards,
            config,
        }
    }

    pub fn with_profile(&self, profile: AggressivenessProfile) -> Self {
        Self {
            db: Arc::clone(&self.db),
            embedder: Arc::clone(&self.embedder),
            guards: self.guards.clone(),
            config: VocabularyConfig {
                profile,
                ..self.config.clone()
            },
        }
    }

    /// Resolves an extracted type name against the active vocabulary.
    /// Unknown names are captured to the skipped log with a sample edge;
    /// new entries are never autocreated here.
    pub async fn resolve(
        &self,
        name: &str,
        sample_from: &str,
        sample_to: &str,
        ontology: &str,
    ) -> Result<Resolution, AppError> {
        let normalized = normalize_rel_type(name);
        if normalized.is_empty() {
            return Ok(Resolution::Unknown);
        }

        if let Some(entry) = VocabularyEntry::get(&normalized, &self.db).await? {
            if entry.is_active {
                return Ok(Resolution::Canonical(entry));
            }
        }

        if let Some(canonical) = VocabularyEntry::find_by_synonym(&normalized, &self.db).await? {
            return Ok(Resolution::Synonym {
                canonical,
                requested: normalized,
            });
        }

        SkippedRelationship::capture(&normalized, sample_from, sample_to, ontology, &self.db)
            .await?;
        Ok(Resolution::Unknown)
    }

    /// Curator-only addition of a canonical type. The embedding is
    /// allocated lazily on first consolidation pass.
    pub async fn add_type(
        &self,
        name: &str,
        category: &str,
        description: &str,
        is_builtin: bool,
        actor: &str,
    ) -> Result<VocabularyEntry, AppError> {
        let normalized = normalize_rel_type(name);
        if normalized.is_empty() {
            return Err(AppError::Validation("relationship type name is empty".into()));
        }

        if VocabularyEntry::get(&normalized, &self.db).await?.is_some() {
            return Err(AppError::Conflict(format!(
                "vocabulary entry {normalized} already exists"
            )));
        }
        if VocabularyEntry::find_by_synonym(&normalized, &self.db).await?.is_some() {
            return Err(AppError::Conflict(format!(
                "{normalized} is already a synonym of an active type"
            )));
        }

        let entry = VocabularyEntry::new(&normalized, category, description, is_builtin);
        let stored = self
            .db
            .store_item(entry)
            .await?
            .ok_or_else(|| AppError::InternalError("vocabulary entry was not created".into()))?;

        let (size, zone, aggressiveness) = self.pressure_snapshot().await?;
        self.db
            .store_item(VocabularyHistory::new(
                VocabularyAction::Add,
                None,
                Some(normalized),
                "curator addition".to_string(),
                actor.to_string(),
                0,
                size - 1,
                size,
                aggressiveness,
                zone.as_str().to_string(),
            ))
            .await?;

        Ok(stored)
    }

    /// Atomic merge: rewrites all surviving edges of `deprecated` to
    /// `target`, deactivates `deprecated`, flattens its synonym list into
    /// `target`, and records an audit row. Serialized against
    /// relationship inserts by the vocabulary write guard.
    pub async fn merge(
        &self,
        deprecated: &str,
        target: &str,
        reason: &str,
        actor: &str,
    ) -> Result<MergeReport, AppError> {
        let deprecated = normalize_rel_type(deprecated);
        let target = normalize_rel_type(target);
        if deprecated == target {
            return Err(AppError::Validation(
                "cannot merge a type into itself".into(),
            ));
        }

        let guard = self.guards.vocabulary();
        let _write = guard.write().await;

        let deprecated_entry = VocabularyEntry::get(&deprecated, &self.db)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("vocabulary entry {deprecated} not found")))?;
        let target_entry = VocabularyEntry::get(&target, &self.db)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("vocabulary entry {target} not found")))?;

        if !deprecated_entry.is_active {
            return Err(AppError::Conflict(format!("{deprecated} is already inactive")));
        }
        if !target_entry.is_active {
            return Err(AppError::Conflict(format!(
                "merge target {target} is not active"
            )));
        }
        if deprecated_entry.is_builtin && actor == AUTO_ACTOR {
            return Err(AppError::Conflict(format!(
                "builtin type {deprecated} can only be deprecated by a curator"
            )));
        }

        let moved_edges = Relationship::count_by_type(&deprecated, &self.db).await?;
        let size_before = VocabularyEntry::all_active(&self.db).await?.len();

        // Transitive flattening: the deprecated name and every name that
        // already redirected to it now redirect to the target.
        let mut synonyms: Vec<String> = vec![deprecated_entry.rel_type.clone()];
        synonyms.extend(deprecated_entry.synonyms.iter().cloned());

        self.db
            .query(MERGE_TYPES)
            .bind(("deprecated", deprecated.clone()))
            .bind(("target", target.clone()))
            .bind(("reason", reason.to_string()))
            .bind(("synonyms", synonyms))
            .bind(("moved_edges", moved_edges as u64))
            .await?
            .check()?;

        let size_after = size_before - 1;
        let aggressiveness = self
            .config
            .profile
            .aggressiveness(size_before, &self.config.thresholds);
        let zone = self.config.thresholds.zone_for(size_before);

        self.db
            .store_item(VocabularyHistory::new(
                VocabularyAction::Merge,
                Some(deprecated.clone()),
                Some(target.clone()),
                reason.to_string(),
                actor.to_string(),
                moved_edges,
                size_before,
                size_after,
                aggressiveness,
                zone.as_str().to_string(),
            ))
            .await?;

        info!(
            deprecated = %deprecated,
            target = %target,
            moved_edges,
            "merged vocabulary types"
        );

        Ok(MergeReport {
            edges_rewritten: moved_edges,
            size_before,
            size_after,
        })
    }

    /// Deactivates a low-value type. Refuses when live edges still use
    /// it (merge instead) and never removes builtins unattended.
    pub async fn prune(&self, rel_type: &str, reason: &str, actor: &str) -> Result<(), AppError> {
        let normalized = normalize_rel_type(rel_type);

        let guard = self.guards.vocabulary();
        let _write = guard.write().await;

        let entry = VocabularyEntry::get(&normalized, &self.db)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("vocabulary entry {normalized} not found")))?;
        if !entry.is_active {
            return Err(AppError::Conflict(format!("{normalized} is already inactive")));
        }
        if entry.is_builtin {
            return Err(AppError::Conflict(format!(
                "builtin type {normalized} cannot be pruned"
            )));
        }

        let live = VocabularyEntry::refresh_usage_count(&normalized, &self.db).await?;
        if live > 0 {
            return Err(AppError::Conflict(format!(
                "{normalized} still has {live} live edges; merge it instead"
            )));
        }

        let size_before = VocabularyEntry::all_active(&self.db).await?.len();
        self.db
            .query(
                "UPDATE type::thing('vocabulary_entry', $id) SET
                    is_active = false,
                    deprecation_reason = $reason,
                    updated_at = time::now()",
            )
            .bind(("id", normalized.clone()))
            .bind(("reason", reason.to_string()))
            .await?
            .check()?;

        let aggressiveness = self
            .config
            .profile
            .aggressiveness(size_before, &self.config.thresholds);
        let zone = self.config.thresholds.zone_for(size_before);
        self.db
            .store_item(VocabularyHistory::new(
                VocabularyAction::Prune,
                Some(normalized.clone()),
                None,
                reason.to_string(),
                actor.to_string(),
                0,
                size_before,
                size_before - 1,
                aggressiveness,
                zone.as_str().to_string(),
            ))
            .await?;

        warn!(rel_type = %normalized, "pruned vocabulary type");
        Ok(())
    }

    pub(crate) async fn pressure_snapshot(&self) -> Result<(usize, Zone, f64), AppError> {
        let size = VocabularyEntry::all_active(&self.db).await?.len();
        let zone = self.config.thresholds.zone_for(size);
        let aggressiveness = self.config.profile.aggressiveness(size, &self.config.thresholds);
        Ok((size, zone, aggressiveness))
    }

    pub async fn status(&self) -> Result<VocabularyStatus, AppError> {
        let entries = VocabularyEntry::all_active(&self.db).await?;
        let size = entries.len();
        let zone = self.config.thresholds.zone_for(size);
        let aggressiveness = self.config.profile.aggressiveness(size, &self.config.thresholds);

        let builtin_count = entries.iter().filter(|e| e.is_builtin).count();
        let categories: HashSet<&str> = entries.iter().map(|e| e.category.as_str()).collect();

        Ok(VocabularyStatus {
            size,
            zone: zone.as_str().to_string(),
            aggressiveness,
            min: self.config.thresholds.min,
            max: self.config.thresholds.max,
            emergency: self.config.thresholds.emergency,
            builtin_count,
            custom_count: size - builtin_count,
            categories_count: categories.len(),
        })
    }

    pub async fn entries(&self) -> Result<Vec<VocabularyEntry>, AppError> {
        VocabularyEntry::all(&self.db).await
    }

    /// Returns the entry's cached embedding, computing and persisting it
    /// when missing or written by a different model.
    pub(crate) async fn ensure_embedding(
        &self,
        entry: &VocabularyEntry,
    ) -> Result<Vec<f32>, AppError> {
        let settings = SystemSettings::get_current(&self.db).await?;

        if let (Some(embedding), Some(model)) = (&entry.embedding, &entry.embedding_model) {
            if *model == settings.embedding_model {
                return Ok(embedding.clone());
            }
        }

        let input = format!(
            "{}: {} ({})",
            entry.rel_type.replace('_', " ").to_lowercase(),
            entry.description,
            entry.category
        );
        let embedding = self.embedder.embed(&input).await?;
        VocabularyEntry::set_embedding(
            &entry.rel_type,
            embedding.clone(),
            &settings.embedding_model,
            &self.db,
        )
        .await?;

        Ok(embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::storage::types::concept::Concept;
    use common::storage::types::concept_embedding::ConceptEmbedding;
    use uuid::Uuid;

    struct NullEmbedder;

    #[async_trait]
    impl Embedder for NullEmbedder {
        async fn embed(&self, _input: &str) -> Result<Vec<f32>, AppError> {
            Ok(vec![0.0, 0.0, 1.0])
        }

        async fn dimensions(&self) -> Result<u32, AppError> {
            Ok(3)
        }
    }

    async fn manager() -> (VocabularyManager, Arc<SurrealDbClient>) {
        let database = Uuid::new_v4().to_string();
        let db = Arc::new(
            SurrealDbClient::memory("test_ns", &database)
                .await
                .expect("Failed to start in-memory surrealdb"),
        );
        db.ensure_initialized().await.expect("initialize");
        ConceptEmbedding::redefine_hnsw_index(&db, 3)
            .await
            .expect("redefine index");

        let manager = VocabularyManager::new(
            Arc::clone(&db),
            Arc::new(NullEmbedder),
            WriteGuards::new(),
            VocabularyConfig::default(),
        );
        (manager, db)
    }

    async fn create_concept(label: &str, db: &SurrealDbClient) -> String {
        let concept = Concept::new(label.to_string(), None, vec![], "X".to_string());
        let id = concept.id.clone();
        Concept::store_with_embedding(concept, vec![0.1, 0.2, 0.3], "m".into(), db)
            .await
            .expect("store concept");
        id
    }

    async fn create_edge(from: &str, to: &str, rel_type: &str, db: &SurrealDbClient) {
        Relationship::new(
            from.to_string(),
            to.to_string(),
            rel_type.to_string(),
            "test".to_string(),
            0.9,
            None,
            None,
            "src".to_string(),
            "X".to_string(),
        )
        .store(db)
        .await
        .expect("store edge");
    }

    #[test]
    fn test_normalize_rel_type() {
        assert_eq!(normalize_rel_type("leads to"), "LEADS_TO");
        assert_eq!(normalize_rel_type("Leads-To"), "LEADS_TO");
        assert_eq!(normalize_rel_type("  CAUSES  "), "CAUSES");
        assert_eq!(normalize_rel_type("is::a"), "IS_A");
        assert_eq!(normalize_rel_type(""), "");
    }

    #[tokio::test]
    async fn test_resolve_canonical_synonym_unknown() {
        let (manager, db) = manager().await;

        let canonical = manager
            .resolve("causes", "a", "b", "X")
            .await
            .expect("resolve");
        assert!(matches!(canonical, Resolution::Canonical(entry) if entry.rel_type == "CAUSES"));

        db.query(
            "UPDATE type::thing('vocabulary_entry', 'CAUSES') SET synonyms = ['LEADS_TO']",
        )
        .await
        .expect("add synonym");
        let synonym = manager
            .resolve("leads to", "a", "b", "X")
            .await
            .expect("resolve");
        match synonym {
            Resolution::Synonym { canonical, requested } => {
                assert_eq!(canonical.rel_type, "CAUSES");
                assert_eq!(requested, "LEADS_TO");
            }
            other => panic!("expected synonym, got {other:?}"),
        }

        let unknown = manager
            .resolve("ORBITS", "moon", "earth", "X")
            .await
            .expect("resolve");
        assert_eq!(unknown, Resolution::Unknown);

        // Unknown names land in the skipped capture log.
        let skipped = SkippedRelationship::list_by_occurrences(10, &db)
            .await
            .expect("list skipped");
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].rel_type, "ORBITS");
    }

    #[tokio::test]
    async fn test_add_type_rejects_duplicates() {
        let (manager, _db) = manager().await;

        manager
            .add_type("orbits", "spatial", "subject circles object", false, "curator")
            .await
            .expect("add");

        assert!(matches!(
            manager
                .add_type("ORBITS", "spatial", "again", false, "curator")
                .await,
            Err(AppError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_merge_preserves_edges_and_flattens_synonyms() {
        let (manager, db) = manager().await;

        manager
            .add_type("OLD_TYPE", "test", "to be merged", false, "curator")
            .await
            .expect("add old");
        // OLD_TYPE already absorbed ANCIENT_TYPE once.
        db.query("UPDATE type::thing('vocabulary_entry', 'OLD_TYPE') SET synonyms = ['ANCIENT_TYPE']")
            .await
            .expect("seed synonym");
        manager
            .add_type("CANON", "test", "canonical", false, "curator")
            .await
            .expect("add canon");

        let a = create_concept("A", &db).await;
        let b = create_concept("B", &db).await;
        let c = create_concept("C", &db).await;
        let d = create_concept("D", &db).await;
        create_edge(&a, &b, "OLD_TYPE", &db).await;
        create_edge(&c, &d, "OLD_TYPE", &db).await;

        let report = manager
            .merge("OLD_TYPE", "CANON", "duplicate semantics", "curator")
            .await
            .expect("merge");
        assert_eq!(report.edges_rewritten, 2);
        assert_eq!(report.size_after, report.size_before - 1);

        assert_eq!(
            Relationship::count_by_type("OLD_TYPE", &db).await.expect("count"),
            0
        );
        assert_eq!(
            Relationship::count_by_type("CANON", &db).await.expect("count"),
            2
        );

        let old = VocabularyEntry::get("OLD_TYPE", &db)
            .await
            .expect("get")
            .expect("exists");
        assert!(!old.is_active);
        assert_eq!(old.deprecation_reason.as_deref(), Some("duplicate semantics"));

        let canon = VocabularyEntry::get("CANON", &db)
            .await
            .expect("get")
            .expect("exists");
        assert!(canon.synonyms.contains(&"OLD_TYPE".to_string()));
        // Transitive: the name merged into OLD_TYPE earlier now redirects
        // to CANON too.
        assert!(canon.synonyms.contains(&"ANCIENT_TYPE".to_string()));

        // Resolution follows the redirect.
        let resolved = manager
            .resolve("old type", "a", "b", "X")
            .await
            .expect("resolve");
        assert!(
            matches!(resolved, Resolution::Synonym { canonical, .. } if canonical.rel_type == "CANON")
        );

        let history = VocabularyHistory::list_recent(10, &db).await.expect("history");
        assert!(history
            .iter()
            .any(|h| h.action == VocabularyAction::Merge
                && h.from_type.as_deref() == Some("OLD_TYPE")
                && h.edges_rewritten == 2));
    }

    #[tokio::test]
    async fn test_merge_refuses_builtin_from_auto_actor() {
        let (manager, _db) = manager().await;

        let result = manager.merge("IS_A", "PART_OF", "squeeze", AUTO_ACTOR).await;
        assert!(matches!(result, Err(AppError::Conflict(_))));

        // A curator may still do it.
        let report = manager
            .merge("IS_A", "PART_OF", "curator decision", "curator")
            .await
            .expect("curator merge");
        assert_eq!(report.edges_rewritten, 0);
    }

    #[tokio::test]
    async fn test_prune_refuses_types_with_live_edges() {
        let (manager, db) = manager().await;

        manager
            .add_type("ORBITS", "spatial", "circles", false, "curator")
            .await
            .expect("add");
        let a = create_concept("Moon", &db).await;
        let b = create_concept("Earth", &db).await;
        create_edge(&a, &b, "ORBITS", &db).await;

        assert!(matches!(
            manager.prune("ORBITS", "unused", AUTO_ACTOR).await,
            Err(AppError::Conflict(_))
        ));

        manager
            .add_type("UNUSED_TYPE", "misc", "never used", false, "curator")
            .await
            .expect("add");
        manager
            .prune("UNUSED_TYPE", "no usage", AUTO_ACTOR)
            .await
            .expect("prune");

        let entry = VocabularyEntry::get("UNUSED_TYPE", &db)
            .await
            .expect("get")
            .expect("exists");
        assert!(!entry.is_active);
    }

    #[tokio::test]
    async fn test_status_reports_zone_and_counts() {
        let (manager, _db) = manager().await;

        let status = manager.status().await.expect("status");
        assert_eq!(status.zone, "GREEN");
        assert_eq!(status.size, status.builtin_count);
        assert_eq!(status.custom_count, 0);
        assert!(status.categories_count > 3);
        assert!(status.aggressiveness < 1e-9);
        assert_eq!(status.min, 30);
        assert_eq!(status.max, 90);
        assert_eq!(status.emergency, 200);
    }
}
