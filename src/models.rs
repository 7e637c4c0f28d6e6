//! Core data models used throughout the auto-coding pipeline.
//!
//! These types represent the sources, segments, clusters, and proposals that
//! flow from segmentation through labeling to the approval layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AutoCodingError, Result};

/// A text source handed over by the import layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub content: String,
}

impl Source {
    pub fn new(id: impl Into<String>, name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            content: content.into(),
        }
    }
}

/// An entry of the existing tagging vocabulary (a node).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VocabularyEntry {
    pub id: String,
    pub name: String,
}

/// A contiguous span of source text treated as one analysis unit.
///
/// Offsets are character (not byte) positions into the source content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub id: String,
    pub text: String,
    pub source_id: String,
    #[serde(default)]
    pub source_name: String,
    pub start_char: usize,
    pub end_char: usize,
    /// Position of the segment within its source.
    #[serde(default)]
    pub index: usize,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
}

impl Segment {
    pub fn new(
        text: impl Into<String>,
        source_id: impl Into<String>,
        start_char: usize,
        end_char: usize,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            text: text.into(),
            source_id: source_id.into(),
            source_name: String::new(),
            start_char,
            end_char: end_char.max(start_char),
            index: 0,
            embedding: None,
        }
    }

    /// Length in characters.
    pub fn len(&self) -> usize {
        self.text.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Text cut to 100 characters, with an ellipsis when truncated.
    pub fn preview(&self) -> String {
        if self.len() <= 100 {
            return self.text.clone();
        }
        let head: String = self.text.chars().take(97).collect();
        format!("{}...", head)
    }
}

/// A group of segments judged topically similar by the clustering stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterResult {
    /// Never `-1`; that label is reserved for noise.
    pub cluster_id: i32,
    pub segments: Vec<Segment>,
    /// Mean of the members' original embeddings.
    #[serde(skip)]
    pub centroid: Vec<f32>,
    /// Mean membership probability, in `[0, 1]`.
    pub coherence_score: f32,
}

impl ClusterResult {
    pub fn size(&self) -> usize {
        self.segments.len()
    }

    /// Segments used as excerpts for labeling.
    ///
    /// Takes a plain prefix of the members rather than those nearest the
    /// centroid.
    pub fn representative_segments(&self, n: usize) -> &[Segment] {
        &self.segments[..n.min(self.segments.len())]
    }
}

/// Qualitative confidence bucket shown next to a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    VeryHigh,
    High,
    Medium,
    Low,
}

/// A candidate vocabulary entry derived from one cluster, pending approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeProposal {
    pub id: String,
    pub suggested_name: String,
    pub description: String,
    pub segments: Vec<Segment>,
    /// Coherence of the source cluster, in `[0, 1]`.
    pub confidence: f32,
    pub cluster_id: i32,
    pub keywords: Vec<String>,
    pub color: String,
    pub existing_node_id: Option<String>,
    pub existing_node_name: Option<String>,
    pub similarity_to_existing: f32,
    pub is_selected: bool,
    #[serde(default)]
    pub is_validated: bool,
    #[serde(default)]
    pub user_edited_name: Option<String>,
}

impl NodeProposal {
    pub fn display_name(&self) -> &str {
        self.user_edited_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.suggested_name)
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn confidence_level(&self) -> ConfidenceLevel {
        if self.confidence >= 0.9 {
            ConfidenceLevel::VeryHigh
        } else if self.confidence >= 0.7 {
            ConfidenceLevel::High
        } else if self.confidence >= 0.5 {
            ConfidenceLevel::Medium
        } else {
            ConfidenceLevel::Low
        }
    }

    pub fn has_existing_match(&self) -> bool {
        self.existing_node_id.is_some()
    }
}

/// How source text is cut into candidate spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentationStrategy {
    Paragraph,
    Sentence,
    /// Currently segmented like `Paragraph`.
    Semantic,
    #[serde(alias = "fixed-window", alias = "fixed_window")]
    Window,
}

impl std::str::FromStr for SegmentationStrategy {
    type Err = AutoCodingError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "paragraph" => Ok(SegmentationStrategy::Paragraph),
            "sentence" => Ok(SegmentationStrategy::Sentence),
            "semantic" => Ok(SegmentationStrategy::Semantic),
            "window" | "fixed-window" | "fixed_window" => Ok(SegmentationStrategy::Window),
            other => Err(AutoCodingError::InvalidConfig(format!(
                "unknown segmentation strategy '{}'. Use paragraph, sentence, semantic, or window.",
                other
            ))),
        }
    }
}

/// Sentence boundary detection used by [`SegmentationStrategy::Sentence`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SentenceSplitter {
    /// Unicode (UAX #29) sentence boundaries.
    Unicode,
    /// Split after runs of `.`, `!` or `?` followed by whitespace.
    Regex,
}

/// Language-model backend used to name themes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelingProvider {
    Ollama,
    Anthropic,
    OpenAI,
    /// Keyword extraction only.
    None,
}

impl LabelingProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            LabelingProvider::Ollama => "ollama",
            LabelingProvider::Anthropic => "anthropic",
            LabelingProvider::OpenAI => "openai",
            LabelingProvider::None => "none",
        }
    }
}

/// User-facing parameters of one auto-coding run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoCodingConfig {
    /// Sources to analyze; empty means every source passed to `analyze`.
    pub source_ids: Vec<String>,

    pub segmentation_strategy: SegmentationStrategy,
    pub sentence_splitter: SentenceSplitter,
    pub min_segment_length: usize,
    pub max_segment_length: usize,
    /// Words per window for [`SegmentationStrategy::Window`].
    pub window_size: usize,
    pub window_overlap: usize,

    pub min_cluster_size: usize,
    pub min_samples: usize,
    pub max_themes: usize,
    pub reduction_neighbors: usize,
    pub reduction_components: usize,
    pub reduction_seed: u64,

    pub confidence_threshold: f32,
    /// Minimum similarity for matching an existing vocabulary entry.
    pub similarity_threshold: f32,
    /// Minimum centroid similarity for merging two themes.
    pub merge_threshold: f32,

    pub max_excerpts: usize,
    pub embedding_batch_size: usize,

    pub llm_provider: LabelingProvider,
    pub llm_model: String,

    pub merge_similar_themes: bool,
    pub match_existing_vocabulary: bool,
}

impl Default for AutoCodingConfig {
    fn default() -> Self {
        Self {
            source_ids: Vec::new(),
            segmentation_strategy: SegmentationStrategy::Paragraph,
            sentence_splitter: SentenceSplitter::Unicode,
            min_segment_length: 50,
            max_segment_length: 500,
            window_size: 200,
            window_overlap: 50,
            min_cluster_size: 3,
            min_samples: 2,
            max_themes: 20,
            reduction_neighbors: 15,
            reduction_components: 5,
            reduction_seed: 42,
            confidence_threshold: 0.6,
            similarity_threshold: 0.75,
            merge_threshold: 0.8,
            max_excerpts: 5,
            embedding_batch_size: 32,
            llm_provider: LabelingProvider::Ollama,
            llm_model: "mistral".to_string(),
            merge_similar_themes: true,
            match_existing_vocabulary: true,
        }
    }
}

impl AutoCodingConfig {
    /// Reject parameter combinations the pipeline cannot honour.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(AutoCodingError::InvalidConfig(msg));

        if self.max_segment_length == 0 {
            return invalid("max_segment_length must be > 0".to_string());
        }
        if self.min_segment_length > self.max_segment_length {
            return invalid(format!(
                "min_segment_length ({}) must not exceed max_segment_length ({})",
                self.min_segment_length, self.max_segment_length
            ));
        }
        if self.window_size == 0 {
            return invalid("window_size must be > 0".to_string());
        }
        if self.window_overlap >= self.window_size {
            return invalid(format!(
                "window_overlap ({}) must be smaller than window_size ({})",
                self.window_overlap, self.window_size
            ));
        }
        if self.min_cluster_size < 2 {
            return invalid("min_cluster_size must be >= 2".to_string());
        }
        if self.min_samples == 0 {
            return invalid("min_samples must be >= 1".to_string());
        }
        if self.max_themes == 0 {
            return invalid("max_themes must be >= 1".to_string());
        }
        if self.reduction_neighbors < 2 {
            return invalid("reduction_neighbors must be >= 2".to_string());
        }
        if self.reduction_components == 0 {
            return invalid("reduction_components must be >= 1".to_string());
        }
        if self.embedding_batch_size == 0 {
            return invalid("embedding_batch_size must be >= 1".to_string());
        }
        for (name, value) in [
            ("confidence_threshold", self.confidence_threshold),
            ("similarity_threshold", self.similarity_threshold),
            ("merge_threshold", self.merge_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return invalid(format!("{} must be in [0.0, 1.0]", name));
            }
        }
        Ok(())
    }
}

/// Terminal state reached by an analysis run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Done,
    /// Segmentation produced nothing to analyze.
    NoSegments,
    /// Every segment was classified as noise.
    NoClusters,
}

/// Complete output of one analysis, handed to the approval layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoCodingResult {
    pub id: String,
    pub created_at: DateTime<Utc>,
    /// Ordered by descending confidence.
    pub proposals: Vec<NodeProposal>,
    pub config: AutoCodingConfig,
    pub outcome: Outcome,
    pub total_segments: usize,
    pub clustered_segments: usize,
    pub noise_segments: usize,
    pub processing_time_seconds: f64,
    #[serde(default)]
    pub is_applied: bool,
    #[serde(default)]
    pub applied_at: Option<DateTime<Utc>>,
}

impl AutoCodingResult {
    pub fn empty(config: AutoCodingConfig, outcome: Outcome) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            proposals: Vec::new(),
            config,
            outcome,
            total_segments: 0,
            clustered_segments: 0,
            noise_segments: 0,
            processing_time_seconds: 0.0,
            is_applied: false,
            applied_at: None,
        }
    }

    pub fn selected_proposals(&self) -> Vec<&NodeProposal> {
        self.proposals.iter().filter(|p| p.is_selected).collect()
    }

    pub fn total_selected_segments(&self) -> usize {
        self.proposals
            .iter()
            .filter(|p| p.is_selected)
            .map(|p| p.segment_count())
            .sum()
    }

    /// Share of segments covered by a theme, in percent.
    pub fn coverage_percentage(&self) -> f64 {
        if self.total_segments == 0 {
            return 0.0;
        }
        self.clustered_segments as f64 / self.total_segments as f64 * 100.0
    }

    pub fn mark_applied(&mut self) {
        self.is_applied = true;
        self.applied_at = Some(Utc::now());
    }
}

/// Name, description, and keywords produced for one cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmLabelingResult {
    pub name: String,
    pub description: String,
    pub keywords: Vec<String>,
    #[serde(default)]
    pub raw_response: String,
    #[serde(default)]
    pub model_used: String,
    pub success: bool,
    #[serde(default)]
    pub error_message: String,
}

/// Distinct colours assigned to generated themes.
pub const THEME_COLORS: [&str; 20] = [
    "#3498db", "#2ecc71", "#e74c3c", "#9b59b6", "#f39c12", "#1abc9c", "#e91e63", "#00bcd4",
    "#8bc34a", "#ff5722", "#673ab7", "#009688", "#ffeb3b", "#795548", "#607d8b", "#ff9800",
    "#4caf50", "#2196f3", "#f44336", "#9c27b0",
];

pub fn theme_color(index: usize) -> &'static str {
    THEME_COLORS[index % THEME_COLORS.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proposal(confidence: f32, selected: bool, n_segments: usize) -> NodeProposal {
        NodeProposal {
            id: Uuid::new_v4().to_string(),
            suggested_name: "Work / Stress".to_string(),
            description: String::new(),
            segments: (0..n_segments)
                .map(|i| Segment::new(format!("segment {}", i), "s1", 0, 9))
                .collect(),
            confidence,
            cluster_id: 0,
            keywords: vec![],
            color: theme_color(0).to_string(),
            existing_node_id: None,
            existing_node_name: None,
            similarity_to_existing: 0.0,
            is_selected: selected,
            is_validated: false,
            user_edited_name: None,
        }
    }

    #[test]
    fn test_coverage_is_zero_without_segments() {
        let result = AutoCodingResult::empty(AutoCodingConfig::default(), Outcome::NoSegments);
        assert_eq!(result.total_segments, 0);
        assert_eq!(result.coverage_percentage(), 0.0);
    }

    #[test]
    fn test_coverage_percentage() {
        let mut result = AutoCodingResult::empty(AutoCodingConfig::default(), Outcome::Done);
        result.total_segments = 8;
        result.clustered_segments = 6;
        result.noise_segments = 2;
        assert!((result.coverage_percentage() - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_selected_proposals_and_segment_totals() {
        let mut result = AutoCodingResult::empty(AutoCodingConfig::default(), Outcome::Done);
        result.proposals = vec![proposal(0.9, true, 3), proposal(0.4, false, 5), proposal(0.7, true, 2)];
        assert_eq!(result.selected_proposals().len(), 2);
        assert_eq!(result.total_selected_segments(), 5);
    }

    #[test]
    fn test_display_name_prefers_user_edit() {
        let mut p = proposal(0.8, true, 1);
        assert_eq!(p.display_name(), "Work / Stress");
        p.user_edited_name = Some("Burnout".to_string());
        assert_eq!(p.display_name(), "Burnout");
        p.user_edited_name = Some(String::new());
        assert_eq!(p.display_name(), "Work / Stress");
    }

    #[test]
    fn test_confidence_levels() {
        assert_eq!(proposal(0.95, true, 1).confidence_level(), ConfidenceLevel::VeryHigh);
        assert_eq!(proposal(0.7, true, 1).confidence_level(), ConfidenceLevel::High);
        assert_eq!(proposal(0.5, true, 1).confidence_level(), ConfidenceLevel::Medium);
        assert_eq!(proposal(0.1, true, 1).confidence_level(), ConfidenceLevel::Low);
    }

    #[test]
    fn test_theme_colors_wrap_around() {
        assert_eq!(theme_color(0), "#3498db");
        assert_eq!(theme_color(20), "#3498db");
        assert_eq!(theme_color(21), theme_color(1));
    }

    #[test]
    fn test_preview_truncates_long_text() {
        let seg = Segment::new("é".repeat(150), "s1", 0, 150);
        let preview = seg.preview();
        assert_eq!(preview.chars().count(), 100);
        assert!(preview.ends_with("..."));
    }

    #[test]
    fn test_representative_segments_is_prefix() {
        let cluster = ClusterResult {
            cluster_id: 0,
            segments: (0..4)
                .map(|i| Segment::new(format!("text {}", i), "s1", 0, 6))
                .collect(),
            centroid: vec![1.0, 0.0],
            coherence_score: 0.8,
        };
        let reps = cluster.representative_segments(2);
        assert_eq!(reps.len(), 2);
        assert_eq!(reps[0].text, "text 0");
        assert_eq!(cluster.representative_segments(10).len(), 4);
    }

    #[test]
    fn test_default_config_is_valid() {
        AutoCodingConfig::default().validate().unwrap();
    }

    #[test]
    fn test_invalid_configs_are_rejected() {
        let mut config = AutoCodingConfig::default();
        config.min_segment_length = 600;
        assert!(config.validate().is_err());

        let mut config = AutoCodingConfig::default();
        config.window_overlap = 200;
        assert!(config.validate().is_err());

        let mut config = AutoCodingConfig::default();
        config.similarity_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_strategy_parses_aliases() {
        assert_eq!(
            "fixed-window".parse::<SegmentationStrategy>().unwrap(),
            SegmentationStrategy::Window
        );
        assert!("chapters".parse::<SegmentationStrategy>().is_err());
    }

    #[test]
    fn test_result_json_uses_plain_string_ids() {
        let mut result = AutoCodingResult::empty(AutoCodingConfig::default(), Outcome::NoClusters);
        result.proposals.push(proposal(0.8, true, 2));

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["outcome"], "no_clusters");
        assert_eq!(json["id"].as_str(), Some(result.id.as_str()));
        assert!(Uuid::parse_str(json["id"].as_str().unwrap()).is_ok());
        assert!(json["proposals"][0]["segments"][1]["id"].is_string());

        let back: AutoCodingResult = serde_json::from_value(json).unwrap();
        assert_eq!(back.id, result.id);
        assert_eq!(back.proposals[0].id, result.proposals[0].id);
    }
}
