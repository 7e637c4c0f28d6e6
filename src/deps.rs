//! One-shot dependency probes.
//!
//! `qda-autocode check` prints the result as a table:
//!
//! ```text
//! COMPONENT    STATUS       DETAIL
//! embedding    OK           ollama (nomic-embed-text)
//! clustering   OK           hdbscan + umap
//! labeling     UNAVAILABLE  Ollama not available at http://localhost:11434 (start it with `ollama serve`)
//! device       OK           remote
//! ```

use serde::Serialize;
use std::fmt;

use crate::cluster::ClusteringPipeline;
use crate::config::Config;
use crate::embedding::{Availability, Device, EmbeddingEngine};
use crate::error::AutoCodingError;
use crate::label::{list_ollama_models, ollama_unavailable};
use crate::models::{AutoCodingConfig, LabelingProvider, Segment};

#[derive(Debug, Clone, Serialize)]
pub struct DependencyReport {
    pub embedding: Availability,
    pub clustering: Availability,
    /// Unavailable labeling only means keyword names.
    pub labeling: Availability,
    pub device: Option<Device>,
}

impl DependencyReport {
    /// True when `analyze` can run.
    pub fn can_analyze(&self) -> bool {
        self.embedding.is_available() && self.clustering.is_available()
    }
}

impl From<AutoCodingError> for Availability {
    fn from(err: AutoCodingError) -> Self {
        match err {
            AutoCodingError::DependencyUnavailable { reason, hint, .. } => {
                Availability::Unavailable { reason, hint }
            }
            other => Availability::Unavailable {
                reason: other.to_string(),
                hint: "check the configuration file".to_string(),
            },
        }
    }
}

/// Probe every backend the pipeline needs under `config`.
pub fn check_dependencies(config: &Config) -> DependencyReport {
    let (embedding, device) = probe_embedding(config);
    DependencyReport {
        embedding,
        clustering: probe_clustering(),
        labeling: probe_labeling(config),
        device,
    }
}

fn probe_embedding(config: &Config) -> (Availability, Option<Device>) {
    let engine = match EmbeddingEngine::from_config(&config.embedding) {
        Ok(engine) => engine,
        Err(e) => return (e.into(), None),
    };
    match engine.load() {
        Ok(device) => (
            Availability::Available {
                detail: format!("{} ({})", config.embedding.provider, engine.model_name()),
            },
            Some(device),
        ),
        Err(e) => (e.into(), None),
    }
}

/// Clusters a small synthetic dataset end to end.
fn probe_clustering() -> Availability {
    let segments: Vec<Segment> = (0..8)
        .map(|i| {
            let mut v = vec![0.05 * (i as f32 + 1.0); 4];
            v[(i % 2) * 2] = 1.0;
            let mut segment = Segment::new(format!("probe {}", i), "probe", 0, 7);
            segment.embedding = Some(v);
            segment
        })
        .collect();

    let pipeline = ClusteringPipeline::from_config(&AutoCodingConfig::default());
    match pipeline.cluster(&segments, 20) {
        Ok(_) => Availability::Available {
            detail: "hdbscan + umap".to_string(),
        },
        Err(e) => Availability::Unavailable {
            reason: e.to_string(),
            hint: "report this as a bug".to_string(),
        },
    }
}

fn probe_labeling(config: &Config) -> Availability {
    let model = &config.autocoding.llm_model;
    match config.autocoding.llm_provider {
        LabelingProvider::None => Availability::Available {
            detail: "keyword labeling".to_string(),
        },
        LabelingProvider::Ollama => {
            let url = &config.labeling.ollama_url;
            let installed = match list_ollama_models(url) {
                Ok(installed) => installed,
                Err(e) => return ollama_unavailable(url, &e),
            };
            let wanted = [model.clone(), format!("{}:latest", model)];
            if installed.iter().any(|m| wanted.contains(m)) {
                Availability::Available {
                    detail: format!("ollama ({})", model),
                }
            } else {
                Availability::Unavailable {
                    reason: format!("model '{}' is not installed", model),
                    hint: format!("run `qda-autocode models --pull {}`", model),
                }
            }
        }
        LabelingProvider::OpenAI | LabelingProvider::Anthropic => {
            let provider = config.autocoding.llm_provider;
            let var = if provider == LabelingProvider::OpenAI {
                "OPENAI_API_KEY"
            } else {
                "ANTHROPIC_API_KEY"
            };
            if std::env::var(var).is_ok() {
                Availability::Available {
                    detail: format!("{} ({})", provider.as_str(), model),
                }
            } else {
                Availability::Unavailable {
                    reason: format!("{} not set", var),
                    hint: format!("export {}=... or use keyword labeling", var),
                }
            }
        }
    }
}

fn row(f: &mut fmt::Formatter<'_>, component: &str, availability: &Availability) -> fmt::Result {
    match availability {
        Availability::Available { detail } => {
            writeln!(f, "{:<12} {:<12} {}", component, "OK", detail)
        }
        Availability::Unavailable { reason, hint } => {
            writeln!(f, "{:<12} {:<12} {} ({})", component, "UNAVAILABLE", reason, hint)
        }
    }
}

impl fmt::Display for DependencyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<12} {:<12} DETAIL", "COMPONENT", "STATUS")?;
        row(f, "embedding", &self.embedding)?;
        row(f, "clustering", &self.clustering)?;
        row(f, "labeling", &self.labeling)?;
        match self.device {
            Some(device) => writeln!(f, "{:<12} {:<12} {}", "device", "OK", device.as_str()),
            None => writeln!(f, "{:<12} {:<12} -", "device", "UNKNOWN"),
        }
    }
}
