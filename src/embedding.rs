//! Embedding provider abstraction, cache, and engine.
//!
//! Defines the [`EmbeddingProvider`] trait and concrete implementations:
//! - **[`DisabledProvider`]**: never available; used when embeddings are not configured.
//! - **[`OllamaProvider`]**: calls a local Ollama instance's `/api/embed` endpoint.
//! - **[`OpenAIProvider`]**: calls the OpenAI embeddings API.
//! - **`LocalProvider`**: runs models in-process via fastembed (feature
//!   `local-embeddings-fastembed`); no network calls after model download.
//!
//! [`EmbeddingEngine`] wraps a provider with a one-time availability probe and
//! device selection ([`EmbeddingEngine::load`]), L2 normalization, and an
//! explicit [`EmbeddingCache`] keyed by `(model, sha256(text))`.
//!
//! # Retry Strategy
//!
//! The HTTP providers use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::EmbeddingConfig;
use crate::error::{AutoCodingError, Result};
use crate::models::Segment;

/// Compute device an embedding model runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    /// NVIDIA GPU.
    Cuda,
    /// Apple Silicon GPU.
    Metal,
    Cpu,
    /// Computed by a remote service.
    Remote,
}

/// Preference order when several devices are available.
const DEVICE_PREFERENCE: [Device; 4] = [Device::Cuda, Device::Metal, Device::Cpu, Device::Remote];

impl Device {
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Cuda => "cuda",
            Device::Metal => "metal",
            Device::Cpu => "cpu",
            Device::Remote => "remote",
        }
    }
}

impl std::str::FromStr for Device {
    type Err = AutoCodingError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cuda" | "gpu" => Ok(Device::Cuda),
            "metal" | "mps" => Ok(Device::Metal),
            "cpu" => Ok(Device::Cpu),
            "remote" => Ok(Device::Remote),
            other => Err(AutoCodingError::InvalidConfig(format!(
                "unknown device '{}'. Use cuda, metal, cpu, or remote.",
                other
            ))),
        }
    }
}

/// Result of a one-time capability probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Availability {
    Available { detail: String },
    Unavailable { reason: String, hint: String },
}

impl Availability {
    pub fn is_available(&self) -> bool {
        matches!(self, Availability::Available { .. })
    }
}

/// Trait for embedding providers.
///
/// Implementations return raw vectors; normalization and caching are done by
/// [`EmbeddingEngine`].
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"nomic-embed-text"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding dimensionality, or `0` when only known after
    /// the first response.
    fn dims(&self) -> usize;
    /// Devices this provider can compute on.
    fn supported_devices(&self) -> Vec<Device> {
        vec![Device::Remote]
    }
    /// Check once whether the backend can be used at all.
    fn probe(&self) -> Availability;
    /// Embed a batch of texts, one vector per input, in input order.
    fn embed(&self, texts: &[String], device: Device) -> Result<Vec<Vec<f32>>>;
}

// ============ Disabled Provider ============

/// A provider that is never available.
///
/// Used when `embedding.provider = "disabled"` in the configuration.
pub struct DisabledProvider;

impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    fn probe(&self) -> Availability {
        Availability::Unavailable {
            reason: "embedding provider is disabled".to_string(),
            hint: "set [embedding] provider to ollama, openai, or local".to_string(),
        }
    }
    fn embed(&self, _texts: &[String], _device: Device) -> Result<Vec<Vec<f32>>> {
        Err(AutoCodingError::unavailable(
            "embedding",
            "embedding provider is disabled",
            "set [embedding] provider to ollama, openai, or local",
        ))
    }
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance.
///
/// Calls `POST /api/embed` on the configured URL (default
/// `http://localhost:11434`). Requires an embedding model to be pulled
/// (e.g. `ollama pull nomic-embed-text`).
pub struct OllamaProvider {
    model: String,
    dims: usize,
    url: String,
    max_retries: u32,
    client: Client,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config.model.clone().ok_or_else(|| {
            AutoCodingError::InvalidConfig("embedding.model required for Ollama provider".into())
        })?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            dims: config.dims.unwrap_or(0),
            url: url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
            client,
        })
    }
}

impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn probe(&self) -> Availability {
        let resp = self
            .client
            .get(format!("{}/api/tags", self.url))
            .timeout(Duration::from_secs(5))
            .send();
        match resp {
            Ok(r) if r.status().is_success() => Availability::Available {
                detail: format!("Ollama reachable at {}", self.url),
            },
            Ok(r) => Availability::Unavailable {
                reason: format!("Ollama at {} answered {}", self.url, r.status()),
                hint: "check the Ollama server logs".to_string(),
            },
            Err(e) => Availability::Unavailable {
                reason: format!("Ollama not reachable at {}: {}", self.url, e),
                hint: "start it with `ollama serve`".to_string(),
            },
        }
    }
    fn embed(&self, texts: &[String], _device: Device) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let json = post_json_with_retry(
            &self.client,
            &format!("{}/api/embed", self.url),
            &[],
            &body,
            self.max_retries,
            "Ollama",
        )?;
        parse_ollama_response(&json)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| {
            AutoCodingError::Embedding("Invalid Ollama response: missing embeddings array".into())
        })?;

    let mut result = Vec::with_capacity(embeddings.len());

    for embedding in embeddings {
        let vec: Vec<f32> = embedding
            .as_array()
            .ok_or_else(|| {
                AutoCodingError::Embedding(
                    "Invalid Ollama response: embedding is not an array".into(),
                )
            })?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        result.push(vec);
    }

    Ok(result)
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI API.
///
/// Calls the `POST /v1/embeddings` endpoint with the configured model.
/// Requires the `OPENAI_API_KEY` environment variable to be set.
pub struct OpenAIProvider {
    model: String,
    dims: usize,
    url: String,
    max_retries: u32,
    client: Client,
}

impl OpenAIProvider {
    /// Create a new OpenAI provider from configuration.
    ///
    /// The API key is checked by [`EmbeddingProvider::probe`], not here, so
    /// a missing key surfaces as a dependency error when the engine loads.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config.model.clone().ok_or_else(|| {
            AutoCodingError::InvalidConfig("embedding.model required for OpenAI provider".into())
        })?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            dims: config.dims.unwrap_or(0),
            url: url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
            client,
        })
    }
}

impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn probe(&self) -> Availability {
        if std::env::var("OPENAI_API_KEY").is_err() {
            return Availability::Unavailable {
                reason: "OPENAI_API_KEY environment variable not set".to_string(),
                hint: "export OPENAI_API_KEY=... or use a local provider".to_string(),
            };
        }
        Availability::Available {
            detail: format!("OpenAI embeddings ({})", self.model),
        }
    }
    fn embed(&self, texts: &[String], _device: Device) -> Result<Vec<Vec<f32>>> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| {
            AutoCodingError::unavailable(
                "embedding",
                "OPENAI_API_KEY not set",
                "export OPENAI_API_KEY=...",
            )
        })?;
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let json = post_json_with_retry(
            &self.client,
            &format!("{}/v1/embeddings", self.url),
            &[("Authorization", format!("Bearer {}", api_key))],
            &body,
            self.max_retries,
            "OpenAI",
        )?;
        parse_openai_response(&json)
    }
}

/// Extracts the `data[].embedding` arrays, ordered by `data[].index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| {
            AutoCodingError::Embedding("Invalid OpenAI response: missing data array".into())
        })?;

    let mut indexed = Vec::with_capacity(data.len());

    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| {
                AutoCodingError::Embedding("Invalid OpenAI response: missing embedding".into())
            })?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);

        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();

        indexed.push((index, vec));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, vec)| vec).collect())
}

/// POST a JSON body, retrying transient failures with exponential backoff.
fn post_json_with_retry(
    client: &Client,
    url: &str,
    headers: &[(&str, String)],
    body: &serde_json::Value,
    max_retries: u32,
    service: &str,
) -> Result<serde_json::Value> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            // Exponential backoff: 1s, 2s, 4s, 8s, ...
            let delay = Duration::from_secs(1u64 << (attempt - 1).min(5));
            std::thread::sleep(delay);
        }

        let mut request = client.post(url).json(body);
        for (name, value) in headers {
            request = request.header(*name, value.as_str());
        }

        match request.send() {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return Ok(response.json()?);
                }

                let body_text = response.text().unwrap_or_default();
                let err = AutoCodingError::Embedding(format!(
                    "{} API error {}: {}",
                    service, status, body_text
                ));

                // Rate limited or server error: retry
                if status.as_u16() == 429 || status.is_server_error() {
                    last_err = Some(err);
                    continue;
                }

                return Err(err);
            }
            Err(e) => {
                last_err = Some(AutoCodingError::Transport(format!(
                    "{} connection error ({}): {}",
                    service, url, e
                )));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        AutoCodingError::Embedding(format!("{} embedding failed after retries", service))
    }))
}

// ============ Local Provider (fastembed) ============

/// Embedding provider for in-process inference through fastembed.
///
/// Models are downloaded on first use from Hugging Face and cached; the model
/// is initialized once and reused for every batch.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalProvider {
    model_name: String,
    dims: usize,
    batch_size: usize,
    model: Mutex<Option<fastembed::TextEmbedding>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| DEFAULT_LOCAL_MODEL.to_string());
        config_to_fastembed_model(&model_name)?;
        let dims = config.dims.unwrap_or_else(|| local_model_dims(&model_name));
        Ok(Self {
            model_name,
            dims,
            batch_size: config.batch_size,
            model: Mutex::new(None),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
impl EmbeddingProvider for LocalProvider {
    fn model_name(&self) -> &str {
        &self.model_name
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn supported_devices(&self) -> Vec<Device> {
        vec![Device::Cpu]
    }
    fn probe(&self) -> Availability {
        Availability::Available {
            detail: format!("fastembed ({})", self.model_name),
        }
    }
    fn embed(&self, texts: &[String], _device: Device) -> Result<Vec<Vec<f32>>> {
        let mut guard = self.model.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            let model = config_to_fastembed_model(&self.model_name)?;
            let embedding = fastembed::TextEmbedding::try_new(
                fastembed::InitOptions::new(model).with_show_download_progress(false),
            )
            .map_err(|e| {
                AutoCodingError::unavailable(
                    "embedding",
                    format!("failed to initialize local embedding model: {}", e),
                    "check network access for the first model download",
                )
            })?;
            *guard = Some(embedding);
        }
        let model = guard
            .as_mut()
            .ok_or_else(|| AutoCodingError::Embedding("local model not initialized".into()))?;
        model
            .embed(texts.to_vec(), Some(self.batch_size))
            .map_err(|e| AutoCodingError::Embedding(format!("Local embedding failed: {}", e)))
    }
}

/// Model used by the local provider when none is configured.
pub const DEFAULT_LOCAL_MODEL: &str = "paraphrase-multilingual-minilm-l12-v2";

/// Known local models: `(name, dims, description)`.
pub const LOCAL_MODELS: [(&str, usize, &str); 6] = [
    ("paraphrase-multilingual-minilm-l12-v2", 384, "multilingual, good size/quality balance"),
    ("paraphrase-multilingual-mpnet-base-v2", 768, "multilingual, best quality"),
    ("multilingual-e5-small", 384, "multilingual, fast"),
    ("all-minilm-l6-v2", 384, "English only, very fast"),
    ("bge-small-en-v1.5", 384, "English only"),
    ("nomic-embed-text-v1.5", 768, "English, long context"),
];

pub fn local_model_dims(name: &str) -> usize {
    LOCAL_MODELS
        .iter()
        .find(|(model, _, _)| *model == name)
        .map(|(_, dims, _)| *dims)
        .unwrap_or(384)
}

#[cfg(feature = "local-embeddings-fastembed")]
fn config_to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "paraphrase-multilingual-minilm-l12-v2" => {
            Ok(fastembed::EmbeddingModel::ParaphraseMLMiniLML12V2)
        }
        "paraphrase-multilingual-mpnet-base-v2" => {
            Ok(fastembed::EmbeddingModel::ParaphraseMLMpnetBaseV2)
        }
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        other => Err(AutoCodingError::InvalidConfig(format!(
            "Unknown local embedding model: '{}'. Supported models: {}",
            other,
            LOCAL_MODELS
                .iter()
                .map(|(m, _, _)| *m)
                .collect::<Vec<_>>()
                .join(", ")
        ))),
    }
}

/// Create the appropriate [`EmbeddingProvider`] based on configuration.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledProvider`] |
/// | `"ollama"` | [`OllamaProvider`] |
/// | `"openai"` | [`OpenAIProvider`] |
/// | `"local"` | `LocalProvider` (feature `local-embeddings-fastembed`) |
pub fn create_provider(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledProvider)),
        "ollama" => Ok(Box::new(OllamaProvider::new(config)?)),
        "openai" => Ok(Box::new(OpenAIProvider::new(config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Box::new(LocalProvider::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => Err(AutoCodingError::unavailable(
            "embedding",
            "local embedding provider not compiled in",
            "rebuild with --features local-embeddings-fastembed",
        )),
        other => Err(AutoCodingError::InvalidConfig(format!(
            "Unknown embedding provider: {}",
            other
        ))),
    }
}

// ============ Cache ============

type CacheKey = (String, [u8; 32]);

/// Embedding cache keyed by model and text digest.
///
/// Owned by an [`EmbeddingEngine`]; share one instance between engines with
/// [`EmbeddingEngine::with_cache`].
#[derive(Default)]
pub struct EmbeddingCache {
    entries: Mutex<HashMap<CacheKey, Vec<f32>>>,
}

impl EmbeddingCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(model: &str, text: &str) -> CacheKey {
        let digest: [u8; 32] = Sha256::digest(text.as_bytes()).into();
        (model.to_string(), digest)
    }

    pub fn get(&self, model: &str, text: &str) -> Option<Vec<f32>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(&Self::key(model, text)).cloned()
    }

    pub fn insert(&self, model: &str, text: &str, vector: Vec<f32>) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(Self::key(model, text), vector);
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

// ============ Engine ============

/// Produces L2-normalized embeddings through a provider, with caching.
pub struct EmbeddingEngine {
    provider: Box<dyn EmbeddingProvider>,
    cache: Arc<EmbeddingCache>,
    use_cache: bool,
    device_override: Option<Device>,
    device: OnceLock<Device>,
}

impl EmbeddingEngine {
    pub fn new(provider: Box<dyn EmbeddingProvider>) -> Self {
        Self {
            provider,
            cache: Arc::new(EmbeddingCache::new()),
            use_cache: true,
            device_override: None,
            device: OnceLock::new(),
        }
    }

    /// Build an engine from the `[embedding]` config section.
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        let mut engine = Self::new(create_provider(config)?);
        engine.use_cache = config.cache;
        if let Some(device) = &config.device {
            engine.device_override = Some(device.parse()?);
        }
        Ok(engine)
    }

    pub fn with_cache(mut self, cache: Arc<EmbeddingCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device_override = Some(device);
        self
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        &self.cache
    }

    /// Device selected by [`load`](Self::load), if loaded.
    pub fn device(&self) -> Option<Device> {
        self.device.get().copied()
    }

    pub fn is_loaded(&self) -> bool {
        self.device.get().is_some()
    }

    /// Probe the provider and select the compute device. Idempotent.
    ///
    /// # Errors
    ///
    /// [`AutoCodingError::DependencyUnavailable`] when the provider probe fails.
    pub fn load(&self) -> Result<Device> {
        if let Some(device) = self.device.get() {
            return Ok(*device);
        }

        if let Availability::Unavailable { reason, hint } = self.provider.probe() {
            return Err(AutoCodingError::unavailable("embedding", reason, hint));
        }

        let device = select_device(self.device_override, &self.provider.supported_devices());
        let device = *self.device.get_or_init(|| device);
        info!(
            model = self.provider.model_name(),
            device = device.as_str(),
            "embedding model loaded"
        );
        Ok(device)
    }

    /// Encode one text (e.g. a vocabulary entry name).
    pub fn encode_text(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.encode_cached(&[text], 1, &mut |_, _| {})?;
        vectors
            .pop()
            .ok_or_else(|| AutoCodingError::Embedding("Empty embedding response".into()))
    }

    /// Encode several texts, batching cache misses.
    pub fn encode_texts(&self, texts: &[String], batch_size: usize) -> Result<Vec<Vec<f32>>> {
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        self.encode_cached(&refs, batch_size, &mut |_, _| {})
    }

    /// Attach an embedding to every segment, in place.
    pub fn encode_segments(
        &self,
        segments: &mut [Segment],
        batch_size: usize,
        progress: &mut dyn FnMut(f32, &str),
    ) -> Result<()> {
        let texts: Vec<&str> = segments.iter().map(|s| s.text.as_str()).collect();
        let vectors = self.encode_cached(&texts, batch_size, progress)?;
        for (segment, vector) in segments.iter_mut().zip(vectors) {
            segment.embedding = Some(vector);
        }
        Ok(())
    }

    fn encode_cached(
        &self,
        texts: &[&str],
        batch_size: usize,
        progress: &mut dyn FnMut(f32, &str),
    ) -> Result<Vec<Vec<f32>>> {
        let device = self.load()?;
        let model = self.provider.model_name().to_string();

        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut misses: Vec<usize> = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            if self.use_cache {
                if let Some(vector) = self.cache.get(&model, text) {
                    results[i] = Some(vector);
                    continue;
                }
            }
            misses.push(i);
        }

        if misses.is_empty() {
            progress(1.0, &format!("all {} segments cached", texts.len()));
            return Ok(results.into_iter().flatten().collect());
        }

        debug!(
            total = texts.len(),
            misses = misses.len(),
            "encoding cache misses"
        );

        let batch_size = batch_size.max(1);
        let total_batches = misses.len().div_ceil(batch_size);
        let mut expected_dims = self.provider.dims();

        for (batch_idx, batch) in misses.chunks(batch_size).enumerate() {
            let batch_texts: Vec<String> = batch.iter().map(|&i| texts[i].to_string()).collect();
            let vectors = self.provider.embed(&batch_texts, device)?;

            if vectors.len() != batch_texts.len() {
                return Err(AutoCodingError::Embedding(format!(
                    "provider returned {} vectors for {} texts",
                    vectors.len(),
                    batch_texts.len()
                )));
            }

            for (&i, mut vector) in batch.iter().zip(vectors) {
                if expected_dims == 0 {
                    expected_dims = vector.len();
                }
                if vector.len() != expected_dims || vector.is_empty() {
                    return Err(AutoCodingError::Embedding(format!(
                        "invalid vector dimension: expected {}, got {}",
                        expected_dims,
                        vector.len()
                    )));
                }
                l2_normalize(&mut vector);
                if self.use_cache {
                    self.cache.insert(&model, texts[i], vector.clone());
                }
                results[i] = Some(vector);
            }

            let done = (batch_idx * batch_size + batch.len()).min(misses.len());
            progress(
                (batch_idx + 1) as f32 / total_batches as f32,
                &format!("embedded {}/{} segments", done, misses.len()),
            );
        }

        results
            .into_iter()
            .map(|v| v.ok_or_else(|| AutoCodingError::Embedding("missing embedding".into())))
            .collect()
    }
}

/// Pick the override when supported, else the best supported device.
pub fn select_device(preferred: Option<Device>, supported: &[Device]) -> Device {
    if let Some(device) = preferred {
        if supported.contains(&device) {
            return device;
        }
    }
    DEVICE_PREFERENCE
        .iter()
        .copied()
        .find(|d| supported.contains(d))
        .unwrap_or(Device::Cpu)
}

// ============ Vector utilities ============

/// Scale a vector to unit length in place. Zero vectors are left unchanged.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Component-wise mean of equally sized vectors.
pub fn mean_vector<'a, I>(vectors: I) -> Vec<f32>
where
    I: IntoIterator<Item = &'a [f32]>,
{
    let mut sum: Vec<f32> = Vec::new();
    let mut count = 0usize;
    for v in vectors {
        if sum.is_empty() {
            sum = vec![0.0; v.len()];
        }
        if v.len() != sum.len() {
            continue;
        }
        for (s, x) in sum.iter_mut().zip(v) {
            *s += x;
        }
        count += 1;
    }
    if count > 0 {
        for s in sum.iter_mut() {
            *s /= count as f32;
        }
    }
    sum
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors or vectors
/// of different lengths.
///
/// ```text
///            a · b
/// cos(θ) = ─────────
///          ‖a‖ × ‖b‖
/// ```
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
