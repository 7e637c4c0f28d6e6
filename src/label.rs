//! Theme naming.
//!
//! [`ThemeLabeler`] asks a language model for a `{name, description,
//! keywords}` object per cluster. The backend is fixed when the labeler is
//! built:
//!
//! | Backend | Endpoint |
//! |---------|----------|
//! | [`LabelBackend::LocalHttp`] | Ollama `POST /api/generate` |
//! | [`LabelBackend::RemoteApi`] | OpenAI chat completions or Anthropic messages |
//! | [`LabelBackend::Keyword`] | none; word frequencies over the members |
//!
//! Model calls are a single attempt with a bounded timeout. Any failure
//! (transport, status, missing JSON, empty name) degrades that one cluster to
//! the keyword labeler, which cannot fail, and records why in
//! `error_message`.

use regex::Regex;
use reqwest::blocking::Client;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::io::{BufRead, BufReader};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::LabelingConfig;
use crate::embedding::Availability;
use crate::error::{AutoCodingError, Result};
use crate::models::{ClusterResult, LabelingProvider, LlmLabelingResult, Segment};

const EXCERPT_CHARS: usize = 300;
const MAX_TOKENS: u32 = 200;
const TEMPERATURE: f32 = 0.3;
const KEYWORD_MODEL: &str = "keywords";

const PROMPT_HEADER: &str = "You are an expert in qualitative data analysis.";
const PROMPT_RULES: &str = "Generate a name and a description for this theme, \
in the language of the excerpts.

RULES:
- The name must be concise (2-4 words maximum)
- The description must be one explanatory sentence
- The keywords must be 3-5 representative terms

Answer ONLY with valid JSON, without comments:
{\"name\": \"...\", \"description\": \"...\", \"keywords\": [\"...\", \"...\", \"...\"]}";

/// Something that turns a prompt into model text.
pub trait CompletionClient: Send + Sync {
    fn complete(&self, prompt: &str) -> Result<String>;
    /// `provider:model`, reported as `model_used`.
    fn model_id(&self) -> String;
}

fn http_client(timeout_secs: u64) -> Result<Client> {
    Ok(Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

/// Checks the status and decodes the JSON body.
fn read_json(response: reqwest::blocking::Response, service: &str) -> Result<serde_json::Value> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        return Err(AutoCodingError::Transport(format!(
            "{} returned {}: {}",
            service,
            status,
            truncate_chars(&body, 200)
        )));
    }
    Ok(response.json()?)
}

/// Ollama `/api/generate` client.
pub struct OllamaClient {
    url: String,
    model: String,
    client: Client,
}

impl OllamaClient {
    pub fn new(url: &str, model: &str, timeout_secs: u64) -> Result<Self> {
        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client: http_client(timeout_secs)?,
        })
    }
}

impl CompletionClient for OllamaClient {
    fn complete(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": {
                "temperature": TEMPERATURE,
                "num_predict": MAX_TOKENS,
            },
        });
        let response = self
            .client
            .post(format!("{}/api/generate", self.url))
            .json(&body)
            .send()
            .map_err(|e| {
                AutoCodingError::Transport(format!("cannot reach Ollama at {}: {}", self.url, e))
            })?;
        let json = read_json(response, "Ollama")?;
        json.get("response")
            .and_then(|r| r.as_str())
            .map(str::to_string)
            .ok_or_else(|| AutoCodingError::Labeling("Ollama response has no 'response' field".into()))
    }

    fn model_id(&self) -> String {
        format!("ollama:{}", self.model)
    }
}

/// Hosted API flavour for [`RemoteApiClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteApi {
    OpenAI,
    Anthropic,
}

impl RemoteApi {
    fn key_var(&self) -> &'static str {
        match self {
            RemoteApi::OpenAI => "OPENAI_API_KEY",
            RemoteApi::Anthropic => "ANTHROPIC_API_KEY",
        }
    }

    fn name(&self) -> &'static str {
        match self {
            RemoteApi::OpenAI => "openai",
            RemoteApi::Anthropic => "anthropic",
        }
    }
}

/// OpenAI chat-completions or Anthropic messages client.
pub struct RemoteApiClient {
    api: RemoteApi,
    url: String,
    model: String,
    api_key: String,
    anthropic_version: String,
    client: Client,
}

impl RemoteApiClient {
    pub fn new(api: RemoteApi, model: &str, api_key: String, config: &LabelingConfig) -> Result<Self> {
        let url = match api {
            RemoteApi::OpenAI => &config.openai_url,
            RemoteApi::Anthropic => &config.anthropic_url,
        };
        Ok(Self {
            api,
            url: url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
            anthropic_version: config.anthropic_version.clone(),
            client: http_client(config.timeout_secs)?,
        })
    }

    /// Reads the key from `OPENAI_API_KEY` / `ANTHROPIC_API_KEY`.
    pub fn from_env(api: RemoteApi, model: &str, config: &LabelingConfig) -> Result<Self> {
        let api_key = std::env::var(api.key_var()).map_err(|_| {
            AutoCodingError::unavailable(
                "labeling",
                format!("{} not set", api.key_var()),
                format!("export {}=... or use --no-llm", api.key_var()),
            )
        })?;
        Self::new(api, model, api_key, config)
    }
}

impl CompletionClient for RemoteApiClient {
    fn complete(&self, prompt: &str) -> Result<String> {
        let messages = serde_json::json!([{ "role": "user", "content": prompt }]);
        let request = match self.api {
            RemoteApi::OpenAI => self
                .client
                .post(format!("{}/v1/chat/completions", self.url))
                .bearer_auth(&self.api_key)
                .json(&serde_json::json!({
                    "model": self.model,
                    "max_tokens": MAX_TOKENS,
                    "messages": messages,
                })),
            RemoteApi::Anthropic => self
                .client
                .post(format!("{}/v1/messages", self.url))
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", &self.anthropic_version)
                .json(&serde_json::json!({
                    "model": self.model,
                    "max_tokens": MAX_TOKENS,
                    "messages": messages,
                })),
        };

        let response = request.send().map_err(|e| {
            AutoCodingError::Transport(format!("{} request failed: {}", self.api.name(), e))
        })?;
        let json = read_json(response, self.api.name())?;

        let text = match self.api {
            RemoteApi::OpenAI => json
                .pointer("/choices/0/message/content")
                .and_then(|c| c.as_str()),
            RemoteApi::Anthropic => json.pointer("/content/0/text").and_then(|c| c.as_str()),
        };
        text.map(str::to_string).ok_or_else(|| {
            AutoCodingError::Labeling(format!("{} response has no text content", self.api.name()))
        })
    }

    fn model_id(&self) -> String {
        format!("{}:{}", self.api.name(), self.model)
    }
}

/// Labeling strategy, chosen once per labeler.
pub enum LabelBackend {
    LocalHttp(OllamaClient),
    RemoteApi(RemoteApiClient),
    Keyword,
}

pub struct ThemeLabeler {
    backend: LabelBackend,
}

impl ThemeLabeler {
    pub fn new(backend: LabelBackend) -> Self {
        Self { backend }
    }

    pub fn keyword() -> Self {
        Self::new(LabelBackend::Keyword)
    }

    /// Build the labeler for `provider`/`model`.
    ///
    /// A backend that cannot be constructed (missing API key, HTTP client
    /// setup failure) degrades to [`LabelBackend::Keyword`] with a warning.
    pub fn from_provider(provider: LabelingProvider, model: &str, config: &LabelingConfig) -> Self {
        let backend = match provider {
            LabelingProvider::None => Ok(LabelBackend::Keyword),
            LabelingProvider::Ollama => {
                OllamaClient::new(&config.ollama_url, model, config.timeout_secs)
                    .map(LabelBackend::LocalHttp)
            }
            LabelingProvider::OpenAI => RemoteApiClient::from_env(RemoteApi::OpenAI, model, config)
                .map(LabelBackend::RemoteApi),
            LabelingProvider::Anthropic => {
                RemoteApiClient::from_env(RemoteApi::Anthropic, model, config)
                    .map(LabelBackend::RemoteApi)
            }
        };

        match backend {
            Ok(backend) => Self::new(backend),
            Err(e) => {
                warn!(provider = provider.as_str(), error = %e, "labeling backend unavailable, using keywords");
                Self::keyword()
            }
        }
    }

    pub fn backend(&self) -> &LabelBackend {
        &self.backend
    }

    /// Name one cluster. Always succeeds with a non-empty name.
    pub fn label(&self, cluster: &ClusterResult, max_excerpts: usize) -> LlmLabelingResult {
        let client: &dyn CompletionClient = match &self.backend {
            LabelBackend::LocalHttp(client) => client,
            LabelBackend::RemoteApi(client) => client,
            LabelBackend::Keyword => return keyword_label(cluster),
        };

        let excerpts = cluster.representative_segments(max_excerpts.max(1));
        let prompt = build_prompt(excerpts);
        debug!(cluster_id = cluster.cluster_id, model = %client.model_id(), "labeling cluster");

        let raw = match client.complete(&prompt) {
            Ok(raw) => raw,
            Err(e) => return fallback(cluster, &e, String::new()),
        };

        match parse_label_response(&raw) {
            Ok(payload) => LlmLabelingResult {
                name: payload.name.trim().to_string(),
                description: payload.description.trim().to_string(),
                keywords: payload.keywords,
                raw_response: raw,
                model_used: client.model_id(),
                success: true,
                error_message: String::new(),
            },
            Err(e) => fallback(cluster, &e, raw),
        }
    }

    /// Label clusters in order, reporting `(i + 1) / n` as each one finishes.
    pub fn label_many(
        &self,
        clusters: &[ClusterResult],
        max_excerpts: usize,
        progress: &mut dyn FnMut(f32, &str),
    ) -> Vec<LlmLabelingResult> {
        let total = clusters.len();
        clusters
            .iter()
            .enumerate()
            .map(|(i, cluster)| {
                let result = self.label(cluster, max_excerpts);
                progress(
                    (i + 1) as f32 / total as f32,
                    &format!("named theme {}/{}", i + 1, total),
                );
                result
            })
            .collect()
    }
}

fn fallback(cluster: &ClusterResult, error: &AutoCodingError, raw: String) -> LlmLabelingResult {
    warn!(cluster_id = cluster.cluster_id, error = %error, "model labeling failed, using keywords");
    let mut result = keyword_label(cluster);
    result.error_message = format!("keyword fallback ({})", error);
    result.raw_response = raw;
    result
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Fixed prompt over numbered excerpts, each cut to 300 characters.
pub fn build_prompt(excerpts: &[Segment]) -> String {
    let formatted: Vec<String> = excerpts
        .iter()
        .enumerate()
        .map(|(i, s)| format!("[{}] {}", i + 1, truncate_chars(&s.text, EXCERPT_CHARS)))
        .collect();
    format!(
        "{}\n\nHere are {} text excerpts that belong to the same theme:\n\n{}\n\n{}",
        PROMPT_HEADER,
        excerpts.len(),
        formatted.join("\n---\n"),
        PROMPT_RULES
    )
}

#[derive(Debug, Deserialize)]
struct LabelPayload {
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    keywords: Vec<String>,
}

fn json_object_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{[^{}]*\}").expect("valid regex"))
}

/// Parse the first brace-delimited object in `raw`.
fn parse_label_response(raw: &str) -> Result<LabelPayload> {
    let object = json_object_re()
        .find(raw.trim())
        .ok_or_else(|| AutoCodingError::Labeling("no JSON object in model response".into()))?;
    let payload: LabelPayload = serde_json::from_str(object.as_str())
        .map_err(|e| AutoCodingError::Labeling(format!("invalid label JSON: {}", e)))?;
    if payload.name.trim().is_empty() {
        return Err(AutoCodingError::Labeling("model returned an empty name".into()));
    }
    Ok(payload)
}

// ============ Keyword labeling ============

const STOPWORDS: &[&str] = &[
    // French
    "les", "une", "des", "qui", "que", "quoi", "dont", "elle", "nous", "vous", "ils", "elles",
    "lui", "leur", "cela", "ceci", "être", "avoir", "est", "sont", "était", "été", "ont",
    "fait", "faire", "vais", "vont", "peut", "peux", "peuvent", "aux", "avec", "dans", "pour",
    "par", "sur", "sous", "entre", "vers", "chez", "sans", "contre", "mais", "donc", "car",
    "comme", "quand", "lorsque", "très", "bien", "mal", "plus", "moins", "aussi", "trop",
    "peu", "encore", "toujours", "jamais", "souvent", "parfois", "déjà", "alors", "puis",
    "ensuite", "enfin", "vraiment", "euh", "hein", "bon", "ben", "bah", "voilà", "oui", "non",
    "ouais", "nan", "accord", "effectivement", "interviewer", "intervieweur", "enquêteur",
    "question", "réponse", "tout", "tous", "toute", "toutes", "autre", "autres", "même",
    "chaque", "quelque", "quelques", "aucun", "aucune", "certain", "certains", "certaine",
    "certaines", "plusieurs", "beaucoup", "assez", "tellement", "ces", "son", "ses",
    "mon", "mes", "ton", "tes", "notre", "nos", "votre", "vos", "pas",
    // English
    "the", "and", "for", "are", "but", "not", "you", "all", "any", "can", "had", "her", "was",
    "one", "our", "out", "has", "have", "his", "how", "its", "may", "who", "did", "get",
    "him", "she", "too", "use", "that", "with", "this", "they", "from", "what", "were",
    "when", "your", "said", "there", "been", "would", "will", "them", "then", "than", "into",
    "more", "some", "very", "just", "like", "also", "about", "which", "their", "could",
    "other", "these", "those", "because", "really", "yeah", "okay", "well", "know", "think",
    "mean", "thing", "things",
];

fn stopwords() -> &'static HashSet<&'static str> {
    static SET: OnceLock<HashSet<&'static str>> = OnceLock::new();
    SET.get_or_init(|| STOPWORDS.iter().copied().collect())
}

fn word_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[a-zàâäéèêëïîôùûüç]{3,}\b").expect("valid regex"))
}

/// Most frequent non-stopwords over `texts`; ties keep first occurrence.
pub fn top_keywords<'a, I>(texts: I, limit: usize) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    let mut order = 0usize;
    for text in texts {
        let lowered = text.to_lowercase();
        for m in word_re().find_iter(&lowered) {
            let word = m.as_str();
            if stopwords().contains(word) {
                continue;
            }
            let entry = counts.entry(word.to_string()).or_insert((0, order));
            entry.0 += 1;
            order += 1;
        }
    }

    let mut ranked: Vec<(String, usize, usize)> = counts
        .into_iter()
        .map(|(word, (count, first))| (word, count, first))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
    ranked.into_iter().take(limit).map(|(word, _, _)| word).collect()
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Deterministic label from member word frequencies.
pub fn keyword_label(cluster: &ClusterResult) -> LlmLabelingResult {
    let top = top_keywords(cluster.segments.iter().map(|s| s.text.as_str()), 10);

    if top.is_empty() {
        return LlmLabelingResult {
            name: "Untitled theme".to_string(),
            description: "No significant keywords found".to_string(),
            keywords: Vec::new(),
            raw_response: String::new(),
            model_used: KEYWORD_MODEL.to_string(),
            success: true,
            error_message: String::new(),
        };
    }

    let name = top
        .iter()
        .take(3)
        .map(|w| title_case(w))
        .collect::<Vec<_>>()
        .join(" / ");
    let keywords: Vec<String> = top.iter().take(5).cloned().collect();
    let description = format!(
        "Theme covering {}",
        keywords.iter().take(3).cloned().collect::<Vec<_>>().join(", ")
    );

    LlmLabelingResult {
        name,
        description,
        keywords,
        raw_response: String::new(),
        model_used: KEYWORD_MODEL.to_string(),
        success: true,
        error_message: String::new(),
    }
}

// ============ Ollama model management ============

/// A labeling model known to work well.
#[derive(Debug, Clone, Copy)]
pub struct RecommendedModel {
    pub name: &'static str,
    pub display_name: &'static str,
    pub size_gb: f32,
    pub description: &'static str,
}

pub const RECOMMENDED_OLLAMA_MODELS: [RecommendedModel; 5] = [
    RecommendedModel {
        name: "mistral",
        display_name: "Mistral 7B",
        size_gb: 4.1,
        description: "good quality for its size, multilingual",
    },
    RecommendedModel {
        name: "llama2",
        display_name: "Llama 2 7B",
        size_gb: 3.8,
        description: "strong in English",
    },
    RecommendedModel {
        name: "phi",
        display_name: "Phi-2",
        size_gb: 1.7,
        description: "very light",
    },
    RecommendedModel {
        name: "gemma:2b",
        display_name: "Gemma 2B",
        size_gb: 1.4,
        description: "very light",
    },
    RecommendedModel {
        name: "mixtral",
        display_name: "Mixtral 8x7B",
        size_gb: 26.0,
        description: "best quality, needs a lot of RAM",
    },
];

/// Names of locally installed Ollama models (`GET /api/tags`).
pub fn list_ollama_models(url: &str) -> Result<Vec<String>> {
    let response = http_client(5)?
        .get(format!("{}/api/tags", url.trim_end_matches('/')))
        .send()?;
    let json = read_json(response, "Ollama")?;
    Ok(json
        .get("models")
        .and_then(|m| m.as_array())
        .map(|models| {
            models
                .iter()
                .filter_map(|m| m.get("name").and_then(|n| n.as_str()))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default())
}

pub fn check_ollama_available(url: &str) -> Availability {
    match list_ollama_models(url) {
        Ok(models) if models.is_empty() => Availability::Available {
            detail: "Ollama running, no models installed".to_string(),
        },
        Ok(models) => Availability::Available {
            detail: format!("models: {}", models.join(", ")),
        },
        Err(e) => ollama_unavailable(url, &e),
    }
}

/// Availability for an Ollama server that could not be listed.
pub fn ollama_unavailable(url: &str, err: &AutoCodingError) -> Availability {
    Availability::Unavailable {
        reason: format!("Ollama not available at {}: {}", url, err),
        hint: "start it with `ollama serve`".to_string(),
    }
}

/// Pull a model, forwarding streamed status lines as `(fraction, status)`.
pub fn pull_ollama_model(url: &str, name: &str, progress: &mut dyn FnMut(f32, &str)) -> Result<()> {
    progress(0.0, &format!("pulling {}", name));

    let response = http_client(600)?
        .post(format!("{}/api/pull", url.trim_end_matches('/')))
        .json(&serde_json::json!({ "name": name, "stream": true }))
        .send()?;
    if !response.status().is_success() {
        return Err(AutoCodingError::Transport(format!(
            "Ollama pull returned {}",
            response.status()
        )));
    }

    for line in BufReader::new(response).lines() {
        let line = line.map_err(|e| AutoCodingError::Transport(e.to_string()))?;
        let Ok(event) = serde_json::from_str::<serde_json::Value>(&line) else {
            continue;
        };
        if let Some(error) = event.get("error").and_then(|e| e.as_str()) {
            return Err(AutoCodingError::Transport(format!("Ollama pull failed: {}", error)));
        }
        let status = event.get("status").and_then(|s| s.as_str()).unwrap_or("");
        let completed = event.get("completed").and_then(|c| c.as_f64());
        let total = event.get("total").and_then(|t| t.as_f64());
        match (completed, total) {
            (Some(completed), Some(total)) if total > 0.0 => {
                progress((completed / total) as f32, status)
            }
            _ => progress(0.5, status),
        }
    }

    progress(1.0, &format!("{} pulled", name));
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;

    /// Answer exactly one HTTP request with `status` and `body`; returns the base URL.
    pub(crate) fn serve_once(status: &'static str, body: String) -> String {
        serve_once_notify(status, body).0
    }

    /// Like [`serve_once`], but signals on the receiver once the request has
    /// been read, before the response is written.
    fn serve_once_notify(status: &'static str, body: String) -> (String, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                let header_end = loop {
                    let n = stream.read(&mut chunk).unwrap_or(0);
                    if n == 0 {
                        break buf.len();
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                        break pos + 4;
                    }
                };
                let headers = String::from_utf8_lossy(&buf[..header_end]).to_lowercase();
                let content_length = headers
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                while buf.len() < header_end + content_length {
                    let n = stream.read(&mut chunk).unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }
                let _ = tx.send(());
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });
        (format!("http://{}", addr), rx)
    }

    fn cluster(texts: &[&str]) -> ClusterResult {
        ClusterResult {
            cluster_id: 4,
            segments: texts
                .iter()
                .map(|t| Segment::new(*t, "s1", 0, t.chars().count()))
                .collect(),
            centroid: vec![1.0, 0.0],
            coherence_score: 0.8,
        }
    }

    fn workload_cluster() -> ClusterResult {
        cluster(&[
            "The workload is heavy and the deadlines keep moving.",
            "Workload pressure means deadlines slip every week.",
            "Heavy workload again, deadlines everywhere, stress.",
        ])
    }

    fn ollama_labeler(url: &str) -> ThemeLabeler {
        ThemeLabeler::new(LabelBackend::LocalHttp(
            OllamaClient::new(url, "mistral", 5).unwrap(),
        ))
    }

    #[test]
    fn test_keyword_label_ranks_by_frequency() {
        let result = keyword_label(&workload_cluster());
        assert!(result.success);
        assert_eq!(result.model_used, "keywords");
        assert_eq!(result.keywords[0], "workload");
        assert_eq!(result.keywords[1], "deadlines");
        assert_eq!(result.keywords[2], "heavy");
        assert_eq!(result.name, "Workload / Deadlines / Heavy");
        assert!(result.keywords.len() <= 5);
        assert!(result.description.contains("workload"));
    }

    #[test]
    fn test_keyword_label_handles_accents_and_stopwords() {
        let top = top_keywords(
            ["Les élèves sont très fatigués, les élèves dorment mal."],
            10,
        );
        assert_eq!(top[0], "élèves");
        assert!(!top.contains(&"les".to_string()));
        assert!(!top.contains(&"très".to_string()));
    }

    #[test]
    fn test_keyword_label_empty_vocabulary() {
        let result = keyword_label(&cluster(&["a b c", "ok"]));
        assert_eq!(result.name, "Untitled theme");
        assert!(result.keywords.is_empty());
        assert!(result.success);
    }

    #[test]
    fn test_prompt_truncates_excerpts() {
        let long = "x".repeat(400);
        let c = cluster(&[long.as_str(), "short excerpt"]);
        let prompt = build_prompt(c.representative_segments(5));
        assert!(prompt.contains(&format!("[1] {}...", "x".repeat(300))));
        assert!(!prompt.contains(&"x".repeat(301)));
        assert!(prompt.contains("\n---\n[2] short excerpt"));
        assert!(prompt.contains("2 text excerpts"));
    }

    #[test]
    fn test_parse_label_response_finds_embedded_object() {
        let raw = "Sure! Here you go:\n{\"name\": \"Work stress\", \"description\": \"Pressure at work\", \"keywords\": [\"stress\", \"deadlines\"]}\nThanks";
        let payload = parse_label_response(raw).unwrap();
        assert_eq!(payload.name, "Work stress");
        assert_eq!(payload.keywords, vec!["stress", "deadlines"]);
    }

    #[test]
    fn test_parse_label_response_rejects_bad_payloads() {
        assert!(parse_label_response("no json here").is_err());
        assert!(parse_label_response("{\"name\": \"\"}").is_err());
        assert!(parse_label_response("{not json}").is_err());
    }

    #[test]
    fn test_ollama_success() {
        let body = serde_json::json!({
            "response": "{\"name\": \"Work pressure\", \"description\": \"Deadlines and workload\", \"keywords\": [\"workload\", \"deadlines\", \"stress\"]}"
        })
        .to_string();
        let url = serve_once("200 OK", body);
        let result = ollama_labeler(&url).label(&workload_cluster(), 5);
        assert!(result.success);
        assert_eq!(result.name, "Work pressure");
        assert_eq!(result.model_used, "ollama:mistral");
        assert!(result.error_message.is_empty());
        assert_eq!(result.keywords.len(), 3);
    }

    #[test]
    fn test_unreachable_backend_falls_back() {
        let result = ollama_labeler("http://127.0.0.1:1").label(&workload_cluster(), 5);
        assert!(result.success);
        assert!(!result.name.is_empty());
        assert_eq!(result.model_used, "keywords");
        assert!(result.error_message.starts_with("keyword fallback"));
    }

    #[test]
    fn test_server_error_falls_back() {
        let url = serve_once("500 Internal Server Error", "{\"error\":\"boom\"}".to_string());
        let result = ollama_labeler(&url).label(&workload_cluster(), 5);
        assert!(result.success);
        assert_eq!(result.name, "Workload / Deadlines / Heavy");
        assert!(result.error_message.contains("500"));
    }

    #[test]
    fn test_garbage_response_falls_back_and_keeps_raw() {
        let body = serde_json::json!({"response": "I cannot help with that."}).to_string();
        let url = serve_once("200 OK", body);
        let result = ollama_labeler(&url).label(&workload_cluster(), 5);
        assert!(result.success);
        assert_eq!(result.model_used, "keywords");
        assert_eq!(result.raw_response, "I cannot help with that.");
    }

    #[test]
    fn test_label_many_reports_progress() {
        let labeler = ThemeLabeler::keyword();
        let clusters = vec![workload_cluster(), workload_cluster()];
        let mut seen = Vec::new();
        let results = labeler.label_many(&clusters, 5, &mut |f, _| seen.push(f));
        assert_eq!(results.len(), 2);
        assert_eq!(seen, vec![0.5, 1.0]);
    }

    #[test]
    fn test_label_many_reports_after_each_label() {
        let body = serde_json::json!({
            "response": "{\"name\": \"Work pressure\", \"description\": \"Deadlines\", \"keywords\": []}"
        })
        .to_string();
        let (url, requested) = serve_once_notify("200 OK", body);
        let labeler = ollama_labeler(&url);

        let mut answered_before_report = Vec::new();
        let results = labeler.label_many(&[workload_cluster()], 5, &mut |fraction, _| {
            answered_before_report.push((fraction, requested.try_recv().is_ok()));
        });

        assert_eq!(results[0].name, "Work pressure");
        assert_eq!(answered_before_report, vec![(1.0, true)]);
    }

    #[test]
    fn test_missing_key_degrades_to_keywords() {
        let config = LabelingConfig::default();
        if std::env::var("ANTHROPIC_API_KEY").is_err() {
            let labeler = ThemeLabeler::from_provider(LabelingProvider::Anthropic, "claude", &config);
            assert!(matches!(labeler.backend(), LabelBackend::Keyword));
        }
        let labeler = ThemeLabeler::from_provider(LabelingProvider::None, "", &config);
        assert!(matches!(labeler.backend(), LabelBackend::Keyword));
    }

    #[test]
    fn test_list_models_and_availability() {
        let url = serve_once(
            "200 OK",
            "{\"models\":[{\"name\":\"mistral:latest\"},{\"name\":\"nomic-embed-text\"}]}".to_string(),
        );
        let models = list_ollama_models(&url).unwrap();
        assert_eq!(models, vec!["mistral:latest", "nomic-embed-text"]);

        let availability = check_ollama_available("http://127.0.0.1:1");
        assert!(!availability.is_available());
    }

    #[test]
    fn test_pull_streams_progress() {
        let body = [
            "{\"status\":\"pulling manifest\"}",
            "{\"status\":\"downloading\",\"completed\":50,\"total\":100}",
            "{\"status\":\"success\"}",
        ]
        .join("\n");
        let url = serve_once("200 OK", body);
        let mut events = Vec::new();
        pull_ollama_model(&url, "phi", &mut |f, s| events.push((f, s.to_string()))).unwrap();
        assert_eq!(events.first().map(|e| e.0), Some(0.0));
        assert!(events.contains(&(0.5, "downloading".to_string())));
        assert_eq!(events.last().map(|e| e.0), Some(1.0));
    }
}
