//! The auto-coding pipeline.
//!
//! [`AutoCodingEngine::analyze`] runs, in order:
//!
//! | Stage | Progress | Work |
//! |-------|----------|------|
//! | `Segmenting` | 0.05 | [`crate::segment`] |
//! | `Embedding` | 0.15 – 0.50 | [`crate::embedding`] |
//! | `Clustering` | 0.50 – 0.70 | [`crate::cluster`] |
//! | `Merging` | 0.70 | optional centroid merge |
//! | `Labeling` | 0.75 – 0.90 | [`crate::label`] |
//! | `Assembling` | 0.90 | proposals + vocabulary matching |
//! | `Done` | 1.0 | |
//!
//! The embedding backend is loaded before any work starts; if it is
//! unavailable the call fails with [`AutoCodingError::DependencyUnavailable`].
//! Embedding and clustering errors abort the run. Labeling never does.
//! Empty input ends early with [`Outcome::NoSegments`] or
//! [`Outcome::NoClusters`].
//!
//! Cancellation is checked between stages, never within one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cluster::{
    find_similar_to_existing, merge_similar_clusters, ClusteringPipeline, VocabularyVector,
};
use crate::config::{Config, LabelingConfig};
use crate::embedding::EmbeddingEngine;
use crate::error::{AutoCodingError, Result};
use crate::label::ThemeLabeler;
use crate::models::{
    theme_color, AutoCodingConfig, AutoCodingResult, ClusterResult, LlmLabelingResult,
    NodeProposal, Outcome, Source, VocabularyEntry,
};
use crate::progress::{NoProgress, ProgressEvent, ProgressReporter, Stage};
use crate::segment::segment_sources;

const EMBEDDING_START: f32 = 0.15;
const EMBEDDING_END: f32 = 0.50;
const CLUSTERING_END: f32 = 0.70;
const LABELING_START: f32 = 0.75;
const LABELING_END: f32 = 0.90;

/// Shared flag for stopping an analysis between stages.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct AutoCodingEngine {
    embedding: EmbeddingEngine,
    labeling: LabelingConfig,
    labeler: Option<ThemeLabeler>,
    stage: Mutex<Stage>,
}

impl AutoCodingEngine {
    pub fn new(embedding: EmbeddingEngine, labeling: LabelingConfig) -> Self {
        Self {
            embedding,
            labeling,
            labeler: None,
            stage: Mutex::new(Stage::Idle),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(
            EmbeddingEngine::from_config(&config.embedding)?,
            config.labeling.clone(),
        ))
    }

    /// Use `labeler` for every run instead of building one from
    /// `llm_provider` / `llm_model`.
    pub fn with_labeler(mut self, labeler: ThemeLabeler) -> Self {
        self.labeler = Some(labeler);
        self
    }

    pub fn embedding(&self) -> &EmbeddingEngine {
        &self.embedding
    }

    /// Stage reached by the last (or current) run.
    pub fn stage(&self) -> Stage {
        *self.stage.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn analyze(
        &self,
        sources: &[Source],
        config: &AutoCodingConfig,
        existing: &[VocabularyEntry],
    ) -> Result<AutoCodingResult> {
        self.analyze_with(sources, config, existing, &NoProgress, &CancellationToken::new())
    }

    pub fn analyze_with(
        &self,
        sources: &[Source],
        config: &AutoCodingConfig,
        existing: &[VocabularyEntry],
        progress: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<AutoCodingResult> {
        let started = Instant::now();
        self.set_stage(Stage::Idle);

        config.validate()?;
        self.embedding.load()?;
        self.checkpoint(cancel)?;

        // Segmenting
        self.enter(progress, Stage::Segmenting, 0.05, "segmenting sources");
        let mut segments = segment_sources(sources, config);
        info!(sources = sources.len(), segments = segments.len(), "segmentation complete");

        if segments.is_empty() {
            self.enter(progress, Stage::NoSegments, 1.0, "no segments to analyze");
            let mut result = AutoCodingResult::empty(config.clone(), Outcome::NoSegments);
            result.processing_time_seconds = started.elapsed().as_secs_f64();
            return Ok(result);
        }
        self.checkpoint(cancel)?;

        // Embedding
        self.enter(
            progress,
            Stage::Embedding,
            EMBEDDING_START,
            format!("embedding {} segments", segments.len()),
        );
        self.embedding.encode_segments(
            &mut segments,
            config.embedding_batch_size,
            &mut |fraction, message| {
                progress.report(&ProgressEvent::new(
                    Stage::Embedding,
                    lerp(EMBEDDING_START, EMBEDDING_END, fraction),
                    message,
                ))
            },
        )?;
        self.checkpoint(cancel)?;

        // Clustering
        self.enter(progress, Stage::Clustering, EMBEDDING_END, "clustering segments");
        let pipeline = ClusteringPipeline::from_config(config);
        let (mut clusters, noise) = pipeline.cluster(&segments, config.max_themes)?;
        progress.report(&ProgressEvent::new(
            Stage::Clustering,
            CLUSTERING_END,
            format!("{} clusters, {} noise segments", clusters.len(), noise.len()),
        ));

        if clusters.is_empty() {
            self.enter(progress, Stage::NoClusters, 1.0, "no themes detected");
            let mut result = AutoCodingResult::empty(config.clone(), Outcome::NoClusters);
            result.total_segments = segments.len();
            result.noise_segments = segments.len();
            result.processing_time_seconds = started.elapsed().as_secs_f64();
            return Ok(result);
        }
        self.checkpoint(cancel)?;

        if config.merge_similar_themes {
            self.enter(progress, Stage::Merging, CLUSTERING_END, "merging similar themes");
            let before = clusters.len();
            clusters = merge_similar_clusters(clusters, config.merge_threshold);
            debug!(before, after = clusters.len(), "merge pass");
            self.checkpoint(cancel)?;
        }

        // Labeling
        self.enter(
            progress,
            Stage::Labeling,
            LABELING_START,
            format!("naming {} themes", clusters.len()),
        );
        let built;
        let labeler = match &self.labeler {
            Some(labeler) => labeler,
            None => {
                built = ThemeLabeler::from_provider(
                    config.llm_provider,
                    &config.llm_model,
                    &self.labeling,
                );
                &built
            }
        };
        let labels = labeler.label_many(&clusters, config.max_excerpts, &mut |fraction, message| {
            progress.report(&ProgressEvent::new(
                Stage::Labeling,
                lerp(LABELING_START, LABELING_END, fraction),
                message,
            ))
        });
        self.checkpoint(cancel)?;

        // Assembling
        self.enter(progress, Stage::Assembling, LABELING_END, "assembling proposals");
        let vocabulary = self.embed_vocabulary(existing, config)?;
        let proposals = assemble_proposals(clusters, labels, &vocabulary, config);

        let clustered_segments: usize = proposals.iter().map(|p| p.segment_count()).sum();
        let result = AutoCodingResult {
            id: Uuid::new_v4().to_string(),
            created_at: chrono::Utc::now(),
            proposals,
            config: config.clone(),
            outcome: Outcome::Done,
            total_segments: segments.len(),
            clustered_segments,
            noise_segments: noise.len(),
            processing_time_seconds: started.elapsed().as_secs_f64(),
            is_applied: false,
            applied_at: None,
        };

        self.enter(
            progress,
            Stage::Done,
            1.0,
            format!("{} themes proposed", result.proposals.len()),
        );
        info!(
            themes = result.proposals.len(),
            segments = result.total_segments,
            coverage = result.coverage_percentage(),
            seconds = result.processing_time_seconds,
            "analysis complete"
        );
        Ok(result)
    }

    fn set_stage(&self, stage: Stage) {
        *self.stage.lock().unwrap_or_else(PoisonError::into_inner) = stage;
    }

    fn enter(
        &self,
        progress: &dyn ProgressReporter,
        stage: Stage,
        fraction: f32,
        message: impl Into<String>,
    ) {
        self.set_stage(stage);
        progress.report(&ProgressEvent::new(stage, fraction, message));
    }

    fn checkpoint(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            info!(stage = self.stage().as_str(), "analysis cancelled");
            self.set_stage(Stage::Idle);
            return Err(AutoCodingError::Cancelled);
        }
        Ok(())
    }

    /// Embed vocabulary names when matching is enabled and can succeed.
    fn embed_vocabulary(
        &self,
        existing: &[VocabularyEntry],
        config: &AutoCodingConfig,
    ) -> Result<Vec<VocabularyVector>> {
        if existing.is_empty()
            || !config.match_existing_vocabulary
            || config.similarity_threshold >= 1.0
        {
            return Ok(Vec::new());
        }

        let names: Vec<String> = existing.iter().map(|e| e.name.clone()).collect();
        let vectors = self
            .embedding
            .encode_texts(&names, config.embedding_batch_size)?;
        Ok(existing
            .iter()
            .zip(vectors)
            .map(|(entry, embedding)| VocabularyVector {
                id: entry.id.clone(),
                name: entry.name.clone(),
                embedding,
            })
            .collect())
    }
}

fn lerp(start: f32, end: f32, fraction: f32) -> f32 {
    start + (end - start) * fraction.clamp(0.0, 1.0)
}

/// One proposal per cluster, ordered by descending confidence (stable).
///
/// Colours follow cluster order, before sorting.
pub fn assemble_proposals(
    clusters: Vec<ClusterResult>,
    labels: Vec<LlmLabelingResult>,
    vocabulary: &[VocabularyVector],
    config: &AutoCodingConfig,
) -> Vec<NodeProposal> {
    let mut proposals: Vec<NodeProposal> = clusters
        .into_iter()
        .zip(labels)
        .enumerate()
        .map(|(i, (cluster, label))| {
            let matched = find_similar_to_existing(&cluster, vocabulary, config.similarity_threshold);
            let confidence = cluster.coherence_score.clamp(0.0, 1.0);
            NodeProposal {
                id: Uuid::new_v4().to_string(),
                suggested_name: label.name,
                description: label.description,
                segments: cluster.segments,
                confidence,
                cluster_id: cluster.cluster_id,
                keywords: label.keywords,
                color: theme_color(i).to_string(),
                existing_node_id: matched.as_ref().map(|m| m.id.clone()),
                existing_node_name: matched.as_ref().map(|m| m.name.clone()),
                similarity_to_existing: matched.map(|m| m.similarity).unwrap_or(0.0),
                is_selected: confidence >= config.confidence_threshold,
                is_validated: false,
                user_edited_name: None,
            }
        })
        .collect();

    proposals.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    proposals
}
