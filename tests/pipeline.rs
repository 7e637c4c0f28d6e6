use std::collections::HashSet;
use std::sync::Mutex;

use qda_autocode::config::LabelingConfig;
use qda_autocode::embedding::{Availability, Device, EmbeddingEngine, EmbeddingProvider};
use qda_autocode::engine::{AutoCodingEngine, CancellationToken};
use qda_autocode::label::ThemeLabeler;
use qda_autocode::models::{
    AutoCodingConfig, ClusterResult, LabelingProvider, Outcome, Segment, Source, VocabularyEntry,
};
use qda_autocode::progress::{ProgressEvent, Stage};
use qda_autocode::store::{materialize_proposals, CodingStore, InMemoryCodingStore};

const TOPICS: [&str; 3] = ["budget", "garden", "music"];

/// Deterministic embeddings: one axis per topic word, plus a small
/// length-dependent component so vectors are not identical.
struct TopicProvider;

impl EmbeddingProvider for TopicProvider {
    fn model_name(&self) -> &str {
        "topics"
    }
    fn dims(&self) -> usize {
        8
    }
    fn probe(&self) -> Availability {
        Availability::Available {
            detail: "fake".into(),
        }
    }
    fn embed(
        &self,
        texts: &[String],
        _device: Device,
    ) -> qda_autocode::Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| {
                let lower = t.to_lowercase();
                let mut v = vec![0.0; 8];
                for (i, topic) in TOPICS.iter().enumerate() {
                    if lower.contains(topic) {
                        v[i * 2] += 1.0;
                    }
                }
                v[7] = 0.01 * (t.len() % 7) as f32 + 0.01;
                v
            })
            .collect())
    }
}

fn engine() -> AutoCodingEngine {
    AutoCodingEngine::new(
        EmbeddingEngine::new(Box::new(TopicProvider)),
        LabelingConfig::default(),
    )
    .with_labeler(ThemeLabeler::keyword())
}

fn keyword_config() -> AutoCodingConfig {
    AutoCodingConfig {
        llm_provider: LabelingProvider::None,
        ..Default::default()
    }
}

const MANNERS: [&str; 6] = ["briefly", "at length", "openly", "with some hesitation", "often", "calmly"];

fn paragraph(topic: &str, i: usize) -> String {
    format!(
        "Participant {} talked {} about the {} and how it shaped their week, \
         returning to the {} again and again.",
        i,
        MANNERS[i % MANNERS.len()],
        topic,
        topic
    )
}

/// Three interviews, each dominated by one topic.
fn corpus() -> Vec<Source> {
    TOPICS
        .iter()
        .enumerate()
        .map(|(n, topic)| {
            let content = (0..6)
                .map(|i| paragraph(topic, i))
                .collect::<Vec<_>>()
                .join("\n\n");
            Source::new(format!("interview-{}", n + 1), format!("Interview {}", n + 1), content)
        })
        .collect()
}

#[test]
fn test_segments_partition_into_themes_and_noise() {
    let result = engine().analyze(&corpus(), &keyword_config(), &[]).unwrap();

    assert_eq!(result.outcome, Outcome::Done);
    assert_eq!(result.total_segments, 18);
    assert_eq!(result.proposals.len(), 3);
    assert_eq!(
        result.clustered_segments + result.noise_segments,
        result.total_segments
    );

    let mut seen = HashSet::new();
    for proposal in &result.proposals {
        for segment in &proposal.segments {
            assert!(seen.insert(segment.id.clone()), "segment in two themes");
        }
    }
    assert_eq!(seen.len(), result.clustered_segments);

    let coverage = result.coverage_percentage();
    assert!((0.0..=100.0).contains(&coverage));
}

#[test]
fn test_proposals_ordered_by_confidence() {
    let result = engine().analyze(&corpus(), &keyword_config(), &[]).unwrap();
    assert_eq!(result.outcome, Outcome::Done);
    assert_eq!(result.proposals.len(), 3);
    for pair in result.proposals.windows(2) {
        assert!(pair[0].confidence >= pair[1].confidence);
    }
    for proposal in &result.proposals {
        assert!((0.0..=1.0).contains(&proposal.confidence));
        assert!(!proposal.display_name().is_empty());
        assert_eq!(proposal.is_selected, proposal.confidence >= 0.6);
    }
}

#[test]
fn test_analysis_is_deterministic() {
    let engine = engine();
    let first = engine.analyze(&corpus(), &keyword_config(), &[]).unwrap();
    let second = engine.analyze(&corpus(), &keyword_config(), &[]).unwrap();

    // Themes as a set: confidence ties may order them either way.
    let summary = |r: &qda_autocode::AutoCodingResult| {
        let mut themes = r
            .proposals
            .iter()
            .map(|p| {
                let mut ids: Vec<(String, usize)> = p
                    .segments
                    .iter()
                    .map(|s| (s.source_id.clone(), s.start_char))
                    .collect();
                ids.sort();
                (p.suggested_name.clone(), ids)
            })
            .collect::<Vec<_>>();
        themes.sort();
        themes
    };
    assert_eq!(first.outcome, Outcome::Done);
    assert_eq!(first.proposals.len(), 3);
    assert_eq!(summary(&first), summary(&second));
    assert_eq!(first.noise_segments, second.noise_segments);
    assert_eq!(first.outcome, second.outcome);
}

#[test]
fn test_max_themes_bounds_proposals() {
    let config = AutoCodingConfig {
        max_themes: 1,
        merge_similar_themes: false,
        ..keyword_config()
    };
    let result = engine().analyze(&corpus(), &config, &[]).unwrap();
    assert!(result.proposals.len() <= 1);
    assert_eq!(
        result.clustered_segments + result.noise_segments,
        result.total_segments
    );
}

#[test]
fn test_progress_reaches_a_terminal_stage() {
    let events = Mutex::new(Vec::new());
    let reporter = |event: &ProgressEvent| events.lock().unwrap().push(event.clone());
    let engine = engine();
    engine
        .analyze_with(
            &corpus(),
            &keyword_config(),
            &[],
            &reporter,
            &CancellationToken::new(),
        )
        .unwrap();

    let events = events.into_inner().unwrap();
    assert_eq!(events[0].stage, Stage::Segmenting);
    let last = events.last().unwrap();
    assert!(last.stage.is_terminal());
    assert_eq!(last.fraction, 1.0);
    assert!(engine.stage().is_terminal());
    for pair in events.windows(2) {
        assert!(pair[1].fraction >= pair[0].fraction);
    }
}

#[test]
fn test_source_filter_limits_input() {
    let config = AutoCodingConfig {
        source_ids: vec!["interview-2".to_string()],
        ..keyword_config()
    };
    let result = engine().analyze(&corpus(), &config, &[]).unwrap();
    assert_eq!(result.total_segments, 6);
    for proposal in &result.proposals {
        assert!(proposal.segments.iter().all(|s| s.source_id == "interview-2"));
    }
}

#[test]
fn test_blank_sources_report_no_segments() {
    let sources = vec![Source::new("a", "A", ""), Source::new("b", "B", "\n\n  \n")];
    let result = engine().analyze(&sources, &keyword_config(), &[]).unwrap();
    assert_eq!(result.outcome, Outcome::NoSegments);
    assert_eq!(result.coverage_percentage(), 0.0);
}

#[test]
fn test_unreachable_ollama_falls_back_to_keywords() {
    let labeling = LabelingConfig {
        ollama_url: "http://127.0.0.1:1".to_string(),
        timeout_secs: 2,
        ..Default::default()
    };
    let labeler = ThemeLabeler::from_provider(LabelingProvider::Ollama, "mistral", &labeling);

    let segments: Vec<Segment> = (0..3)
        .map(|i| Segment::new(paragraph("garden", i), "s", i * 200, i * 200 + 100))
        .collect();
    let cluster = ClusterResult {
        cluster_id: 0,
        segments,
        centroid: vec![0.0; 8],
        coherence_score: 0.8,
    };

    let label = labeler.label(&cluster, 5);
    assert!(label.success);
    assert!(!label.name.is_empty());
    assert_eq!(label.model_used, "keywords");
    assert!(label.error_message.starts_with("keyword fallback"));
    assert!(label.keywords.iter().any(|k| k == "garden"));
}

#[test]
fn test_approved_proposals_materialize() {
    let existing = vec![VocabularyEntry {
        id: "node-music".into(),
        name: "Music".into(),
    }];
    let mut result = engine()
        .analyze(&corpus(), &keyword_config(), &existing)
        .unwrap();
    assert_eq!(result.outcome, Outcome::Done);
    assert_eq!(result.proposals.len(), 3);
    for proposal in result.proposals.iter_mut() {
        proposal.is_selected = true;
    }

    let store = InMemoryCodingStore::new();
    let nodes = materialize_proposals(&store, &result.proposals, None, 0.75).unwrap();
    result.mark_applied();

    assert_eq!(nodes.len(), result.proposals.len());
    assert_eq!(
        store.references().unwrap().len(),
        result.total_selected_segments()
    );
    let created = nodes.iter().filter(|n| n.created).count();
    assert_eq!(store.nodes().unwrap().len(), created);
    for node in nodes.iter().filter(|n| !n.created) {
        assert_eq!(node.node_id, "node-music");
    }
    assert!(result.is_applied);
    assert!(result.applied_at.is_some());
}
