//! Document type prediction
//!
//! Two strategies, tried in order:
//! 1. Embedding similarity: encode the text and pick the reference vector
//!    with the highest cosine similarity (only when ML mode is on and a
//!    model with at least one usable vector is loaded)
//! 2. Ordered keyword rules, which always produce an answer
//!
//! `predict` never fails. Anything that goes wrong on the ML path (encoder
//! error, all-zero embedding, no usable vectors) falls through to the rules.
//!
//! The loaded model is held as `Arc<LoadedModel>` behind a lock that is
//! only taken to clone or replace the `Arc`, so a hot swap never blocks an
//! in-flight prediction and never exposes a half-built model.

pub mod cache;
pub mod rules;
pub mod similarity;

use crate::services::embedding_client::{EmbeddingError, EmbeddingProvider};
use crate::types::PredictionResult;
use cache::{CacheError, EmbeddingCache};
use chrono::Utc;
use rules::KeywordRules;
use scanflow_common::{EventBus, PipelineEvent};
use similarity::is_zero_vector;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PredictionError {
    #[error("Model cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Model at {0} has no reference vectors")]
    EmptyModel(String),
}

/// Reference vectors currently used for classification
#[derive(Debug)]
pub struct LoadedModel {
    pub cache: EmbeddingCache,
    pub source: PathBuf,
}

/// How `initialize` left the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelStatus {
    /// Cache loaded from disk
    Loaded { labels: usize },
    /// Cache was missing or unreadable and was rebuilt
    Regenerated { labels: usize },
    /// ML mode is off; rules only
    RulesOnly { reason: String },
}

pub struct EngineSettings {
    pub use_ml_model: bool,
    pub embedding_path: PathBuf,
    pub document_types_path: PathBuf,
}

pub struct PredictionEngine {
    rules: KeywordRules,
    encoder: Option<Arc<dyn EmbeddingProvider>>,
    use_ml_model: AtomicBool,
    model: RwLock<Option<Arc<LoadedModel>>>,
    embedding_path: PathBuf,
    document_types_path: PathBuf,
    events: Option<EventBus>,
}

impl PredictionEngine {
    pub fn new(
        rules: KeywordRules,
        encoder: Option<Arc<dyn EmbeddingProvider>>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            rules,
            encoder,
            use_ml_model: AtomicBool::new(settings.use_ml_model),
            model: RwLock::new(None),
            embedding_path: settings.embedding_path,
            document_types_path: settings.document_types_path,
            events: None,
        }
    }

    /// Rules-only engine
    pub fn rules_only(rules: KeywordRules) -> Self {
        Self::new(
            rules,
            None,
            EngineSettings {
                use_ml_model: false,
                embedding_path: PathBuf::new(),
                document_types_path: PathBuf::new(),
            },
        )
    }

    /// Report model swaps on `events`
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Load the reference vectors, regenerating them once if the cache
    /// file is missing or unreadable
    ///
    /// A second failure turns ML mode off; the rules keep working.
    pub async fn initialize(&self) -> ModelStatus {
        if !self.use_ml_model() {
            return ModelStatus::RulesOnly {
                reason: "ML model disabled".to_string(),
            };
        }
        let Some(encoder) = self.encoder.clone() else {
            return self.disable_ml("no embedding provider configured");
        };

        match EmbeddingCache::load(&self.embedding_path).await {
            Ok(cache) => {
                let labels = cache.len();
                info!(path = %self.embedding_path.display(), labels, "Loaded reference vectors");
                self.install(cache, self.embedding_path.clone());
                return ModelStatus::Loaded { labels };
            }
            Err(e) if e.is_not_found() => {
                info!(path = %self.embedding_path.display(), "No reference vectors yet, generating");
            }
            Err(e) => {
                warn!(path = %self.embedding_path.display(), error = %e, "Reference vectors unreadable, regenerating");
            }
        }

        if let Err(e) = encoder
            .regenerate_reference_vectors(&self.document_types_path)
            .await
        {
            warn!(
                types = %self.document_types_path.display(),
                error = %e,
                "Reference vector regeneration failed"
            );
        }

        match EmbeddingCache::load(&self.embedding_path).await {
            Ok(cache) => {
                let labels = cache.len();
                self.install(cache, self.embedding_path.clone());
                ModelStatus::Regenerated { labels }
            }
            Err(e) => self.disable_ml(&format!("reference vectors unavailable: {}", e)),
        }
    }

    fn disable_ml(&self, reason: &str) -> ModelStatus {
        warn!(reason, "Falling back to keyword rules");
        self.use_ml_model.store(false, Ordering::SeqCst);
        ModelStatus::RulesOnly {
            reason: reason.to_string(),
        }
    }

    pub async fn predict(&self, text: &str) -> PredictionResult {
        if self.use_ml_model() {
            if let Some(result) = self.predict_with_model(text).await {
                return result;
            }
        }
        PredictionResult::rule_based(self.rules.classify(text))
    }

    async fn predict_with_model(&self, text: &str) -> Option<PredictionResult> {
        let encoder = self.encoder.as_ref()?;
        let model = self.current_model()?;
        if model.cache.is_empty() {
            return None;
        }

        let embedding = match encoder.encode(text).await {
            Ok(embedding) => embedding,
            Err(e) => {
                warn!(error = %e, "Encoding failed, using keyword rules");
                return None;
            }
        };
        if is_zero_vector(&embedding) {
            debug!("Embedding carries no signal, using keyword rules");
            return None;
        }

        let (label, similarity) = model.cache.best_match(&embedding)?;
        Some(PredictionResult::from_model(label, similarity))
    }

    /// Replace the model with the reference vectors at `path`
    ///
    /// The new model is fully loaded before the swap; on any error the
    /// previous model stays in place.
    pub async fn apply_trained_model(&self, path: &Path) -> Result<usize, PredictionError> {
        let cache = EmbeddingCache::load(path).await?;
        if cache.is_empty() {
            return Err(PredictionError::EmptyModel(path.display().to_string()));
        }
        let labels = cache.len();

        if path != self.embedding_path && !self.embedding_path.as_os_str().is_empty() {
            if let Err(e) = cache.save(&self.embedding_path).await {
                warn!(error = %e, "Could not persist trained model to the cache path");
            }
        }

        self.install(cache, path.to_path_buf());
        info!(path = %path.display(), labels, "Prediction model swapped");
        if let Some(events) = &self.events {
            events.emit_lossy(PipelineEvent::ModelSwapped {
                source: path.display().to_string(),
                labels,
                timestamp: Utc::now(),
            });
        }
        Ok(labels)
    }

    fn install(&self, cache: EmbeddingCache, source: PathBuf) {
        let model = Arc::new(LoadedModel { cache, source });
        *self.model.write().unwrap_or_else(PoisonError::into_inner) = Some(model);
    }

    pub fn current_model(&self) -> Option<Arc<LoadedModel>> {
        self.model
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn use_ml_model(&self) -> bool {
        self.use_ml_model.load(Ordering::SeqCst)
    }

    pub fn set_use_ml_model(&self, enabled: bool) {
        self.use_ml_model.store(enabled, Ordering::SeqCst);
        info!(enabled, "ML prediction toggled");
    }

    /// Document types this engine can produce
    pub fn document_types(&self) -> Vec<String> {
        let mut types = self.rules.document_types();
        if let Some(model) = self.current_model() {
            for label in model.cache.labels() {
                if !types.contains(&label) {
                    types.push(label);
                }
            }
        }
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Returns a fixed vector and counts regenerations
    struct FixedEncoder {
        vector: Vec<f32>,
        regenerations: AtomicUsize,
        writes: Option<(PathBuf, EmbeddingCache)>,
    }

    impl FixedEncoder {
        fn new(vector: Vec<f32>) -> Self {
            Self {
                vector,
                regenerations: AtomicUsize::new(0),
                writes: None,
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for FixedEncoder {
        async fn encode(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            Ok(self.vector.clone())
        }

        async fn regenerate_reference_vectors(
            &self,
            _types_def_path: &Path,
        ) -> Result<EmbeddingCache, EmbeddingError> {
            self.regenerations.fetch_add(1, Ordering::SeqCst);
            match &self.writes {
                Some((path, cache)) => {
                    cache.save(path).await?;
                    Ok(cache.clone())
                }
                None => Err(EmbeddingError::InvalidResponse("offline".to_string())),
            }
        }
    }

    fn two_axis() -> EmbeddingCache {
        let mut cache = EmbeddingCache::new();
        cache.insert("A", vec![1.0, 0.0]);
        cache.insert("B", vec![0.0, 1.0]);
        cache
    }

    fn engine(encoder: Arc<FixedEncoder>, embedding_path: PathBuf) -> PredictionEngine {
        PredictionEngine::new(
            KeywordRules::default(),
            Some(encoder),
            EngineSettings {
                use_ml_model: true,
                embedding_path,
                document_types_path: PathBuf::from("types.json"),
            },
        )
    }

    #[tokio::test]
    async fn test_rules_when_ml_disabled() {
        let engine = PredictionEngine::rules_only(KeywordRules::default());
        assert_eq!(
            engine.predict("... invoice ...").await,
            PredictionResult::rule_based("Invoice")
        );
        assert_eq!(
            engine.predict("... report ...").await,
            PredictionResult::rule_based("Report")
        );
        assert_eq!(
            engine.predict("nothing here").await,
            PredictionResult::rule_based("Unknown")
        );
    }

    #[tokio::test]
    async fn test_cosine_selection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.json");
        two_axis().save(&path).await.unwrap();

        let engine = engine(Arc::new(FixedEncoder::new(vec![0.9, 0.1])), path);
        assert_eq!(engine.initialize().await, ModelStatus::Loaded { labels: 2 });

        let result = engine.predict("anything").await;
        assert_eq!(result.document_type, "A");
        assert!(!result.is_rule_based);
        assert!(result.confidence.unwrap() > 0.9);
    }

    #[tokio::test]
    async fn test_zero_embedding_falls_back_to_rules() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.json");
        two_axis().save(&path).await.unwrap();

        let engine = engine(Arc::new(FixedEncoder::new(vec![0.0, 0.0])), path);
        engine.initialize().await;
        assert_eq!(
            engine.predict("monthly report").await,
            PredictionResult::rule_based("Report")
        );
    }

    #[tokio::test]
    async fn test_missing_cache_regenerates_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.json");
        let mut encoder = FixedEncoder::new(vec![0.0, 1.0]);
        encoder.writes = Some((path.clone(), two_axis()));
        let encoder = Arc::new(encoder);

        let engine = engine(encoder.clone(), path);
        assert_eq!(engine.initialize().await, ModelStatus::Regenerated { labels: 2 });
        assert_eq!(encoder.regenerations.load(Ordering::SeqCst), 1);
        assert_eq!(engine.predict("x").await.document_type, "B");
    }

    #[tokio::test]
    async fn test_failed_regeneration_disables_ml_only() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = Arc::new(FixedEncoder::new(vec![1.0, 0.0]));
        let engine = engine(encoder.clone(), dir.path().join("absent.json"));

        assert!(matches!(engine.initialize().await, ModelStatus::RulesOnly { .. }));
        assert_eq!(encoder.regenerations.load(Ordering::SeqCst), 1);
        assert!(!engine.use_ml_model());
        assert_eq!(
            engine.predict("invoice").await,
            PredictionResult::rule_based("Invoice")
        );
    }

    #[tokio::test]
    async fn test_hot_swap_failure_keeps_previous_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.json");
        two_axis().save(&path).await.unwrap();

        let engine = engine(Arc::new(FixedEncoder::new(vec![0.0, 1.0])), path);
        engine.initialize().await;

        let bad = dir.path().join("broken.json");
        std::fs::write(&bad, "{not json").unwrap();
        assert!(engine.apply_trained_model(&bad).await.is_err());
        assert_eq!(engine.predict("x").await.document_type, "B");

        let mut retrained = EmbeddingCache::new();
        retrained.insert("Letter", vec![0.0, 1.0]);
        let good = dir.path().join("trained.json");
        retrained.save(&good).await.unwrap();

        assert_eq!(engine.apply_trained_model(&good).await.unwrap(), 1);
        assert_eq!(engine.predict("x").await.document_type, "Letter");
        assert_eq!(engine.current_model().unwrap().source, good);
    }

    #[tokio::test]
    async fn test_reader_keeps_old_model_across_swap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.json");
        two_axis().save(&path).await.unwrap();

        let engine = engine(Arc::new(FixedEncoder::new(vec![1.0, 0.0])), path.clone());
        engine.initialize().await;
        let held = engine.current_model().unwrap();

        let mut retrained = EmbeddingCache::new();
        retrained.insert("C", vec![1.0, 0.0]);
        let trained = dir.path().join("trained.json");
        retrained.save(&trained).await.unwrap();
        engine.apply_trained_model(&trained).await.unwrap();

        assert_eq!(held.cache.labels(), vec!["A", "B"]);
        assert_eq!(engine.current_model().unwrap().cache.labels(), vec!["C"]);
    }
}
