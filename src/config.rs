//! TOML configuration.
//!
//! ```toml
//! [embedding]
//! provider = "ollama"          # ollama | openai | local | disabled
//! model = "nomic-embed-text"
//!
//! [labeling]
//! ollama_url = "http://localhost:11434"
//! timeout_secs = 60
//!
//! [autocoding]
//! segmentation_strategy = "paragraph"
//! max_themes = 20
//! llm_provider = "ollama"
//! llm_model = "mistral"
//! ```
//!
//! Every section is optional. API keys come from `OPENAI_API_KEY` and
//! `ANTHROPIC_API_KEY`, never from the file.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::embedding::Device;
use crate::models::AutoCodingConfig;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub labeling: LabelingConfig,
    #[serde(default)]
    pub autocoding: AutoCodingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: Option<String>,
    /// Expected dimensionality; detected from the first response when unset.
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for HTTP providers.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Force a compute device (`cuda`, `metal`, `cpu`).
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default = "default_true")]
    pub cache: bool,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_embedding_model(),
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            device: None,
            cache: true,
        }
    }
}

fn default_provider() -> String {
    "ollama".to_string()
}
fn default_embedding_model() -> Option<String> {
    Some("nomic-embed-text".to_string())
}
fn default_batch_size() -> usize {
    32
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_true() -> bool {
    true
}

/// Endpoints and limits for the theme-labeling backends.
///
/// The backend itself is picked per run by `autocoding.llm_provider`.
#[derive(Debug, Deserialize, Clone)]
pub struct LabelingConfig {
    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,
    #[serde(default = "default_openai_url")]
    pub openai_url: String,
    #[serde(default = "default_anthropic_url")]
    pub anthropic_url: String,
    #[serde(default = "default_anthropic_version")]
    pub anthropic_version: String,
    /// Per-request timeout. Labeling requests are never retried.
    #[serde(default = "default_labeling_timeout")]
    pub timeout_secs: u64,
}

impl Default for LabelingConfig {
    fn default() -> Self {
        Self {
            ollama_url: default_ollama_url(),
            openai_url: default_openai_url(),
            anthropic_url: default_anthropic_url(),
            anthropic_version: default_anthropic_version(),
            timeout_secs: default_labeling_timeout(),
        }
    }
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_openai_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_anthropic_url() -> String {
    "https://api.anthropic.com".to_string()
}
fn default_anthropic_version() -> String {
    "2023-06-01".to_string()
}
fn default_labeling_timeout() -> u64 {
    60
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config = parse_config(&content)?;
    validate_config(&config)?;
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content).with_context(|| "Failed to parse config file")
}

pub fn validate_config(config: &Config) -> Result<()> {
    // Validate embedding
    match config.embedding.provider.as_str() {
        "disabled" | "ollama" | "openai" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be ollama, openai, local, or disabled.",
            other
        ),
    }

    if matches!(config.embedding.provider.as_str(), "ollama" | "openai")
        && config.embedding.model.is_none()
    {
        anyhow::bail!(
            "embedding.model must be specified when provider is '{}'",
            config.embedding.provider
        );
    }

    if config.embedding.dims == Some(0) {
        anyhow::bail!("embedding.dims must be > 0 when set");
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    if config.embedding.timeout_secs == 0 {
        anyhow::bail!("embedding.timeout_secs must be > 0");
    }
    if let Some(device) = &config.embedding.device {
        device.parse::<Device>()?;
    }

    // Validate labeling
    if config.labeling.timeout_secs == 0 {
        anyhow::bail!("labeling.timeout_secs must be > 0");
    }

    // Validate autocoding
    config.autocoding.validate()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LabelingProvider, SegmentationStrategy};

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = parse_config("").unwrap();
        validate_config(&config).unwrap();
        assert_eq!(config.embedding.provider, "ollama");
        assert_eq!(config.embedding.model.as_deref(), Some("nomic-embed-text"));
        assert_eq!(config.labeling.timeout_secs, 60);
        assert_eq!(config.autocoding.max_themes, 20);
        assert_eq!(config.autocoding.llm_model, "mistral");
    }

    #[test]
    fn test_sections_override_defaults() {
        let config = parse_config(
            r#"
[embedding]
provider = "openai"
model = "text-embedding-3-small"
dims = 1536

[labeling]
timeout_secs = 10

[autocoding]
segmentation_strategy = "sentence"
max_themes = 5
llm_provider = "none"
"#,
        )
        .unwrap();
        validate_config(&config).unwrap();
        assert_eq!(config.embedding.dims, Some(1536));
        assert_eq!(config.labeling.timeout_secs, 10);
        assert_eq!(
            config.autocoding.segmentation_strategy,
            SegmentationStrategy::Sentence
        );
        assert_eq!(config.autocoding.max_themes, 5);
        assert_eq!(config.autocoding.llm_provider, LabelingProvider::None);
        assert_eq!(config.autocoding.min_cluster_size, 3);
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let config = parse_config("[embedding]\nprovider = \"magic\"\n").unwrap();
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider"));
    }

    #[test]
    fn test_invalid_autocoding_rejected() {
        let config =
            parse_config("[autocoding]\nmin_segment_length = 900\nmax_segment_length = 100\n")
                .unwrap();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_invalid_device_rejected() {
        let config = parse_config("[embedding]\ndevice = \"tpu\"\n").unwrap();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_missing_file_has_context() {
        let err = load_config(Path::new("/nonexistent/qda-autocode.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
