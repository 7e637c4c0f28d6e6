//! Analysis progress reporting.
//!
//! [`crate::engine`] reports one [`ProgressEvent`] per stage transition and
//! per embedding batch / labeled cluster, with an overall fraction in `[0, 1]`.
//! The CLI emits progress on **stderr** so stdout remains parseable for scripts.
//!
//! Any `Fn(&ProgressEvent) + Send + Sync` closure is a reporter, so library
//! callers can pass a callback directly.

use serde::Serialize;
use std::io::Write;

/// Stage of the analysis state machine.
///
/// `Idle → Segmenting → Embedding → Clustering → [Merging] → Labeling →
/// Assembling → Done`, with early terminals `NoSegments` and `NoClusters`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Idle,
    Segmenting,
    Embedding,
    Clustering,
    Merging,
    Labeling,
    Assembling,
    Done,
    NoSegments,
    NoClusters,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::Segmenting => "segmenting",
            Stage::Embedding => "embedding",
            Stage::Clustering => "clustering",
            Stage::Merging => "merging",
            Stage::Labeling => "labeling",
            Stage::Assembling => "assembling",
            Stage::Done => "done",
            Stage::NoSegments => "no_segments",
            Stage::NoClusters => "no_clusters",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Done | Stage::NoSegments | Stage::NoClusters)
    }
}

/// A single progress event.
#[derive(Clone, Debug, Serialize)]
pub struct ProgressEvent {
    pub stage: Stage,
    /// Overall completion in `[0, 1]`.
    pub fraction: f32,
    pub message: String,
}

impl ProgressEvent {
    pub fn new(stage: Stage, fraction: f32, message: impl Into<String>) -> Self {
        Self {
            stage,
            fraction: fraction.clamp(0.0, 1.0),
            message: message.into(),
        }
    }
}

/// Receives progress events. Called synchronously; keep it cheap.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: &ProgressEvent);
}

impl<F> ProgressReporter for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn report(&self, event: &ProgressEvent) {
        self(event)
    }
}

/// Human-friendly progress on stderr: `[ 42%] embedding  embedded 64/120 segments`.
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: &ProgressEvent) {
        let line = format!(
            "[{:>3}%] {:<11} {}\n",
            percent(event.fraction),
            event.stage.as_str(),
            event.message
        );
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: &ProgressEvent) {
        let obj = serde_json::json!({
            "event": "progress",
            "stage": event.stage,
            "fraction": event.fraction,
            "message": event.message,
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: &ProgressEvent) {}
}

fn percent(fraction: f32) -> u32 {
    (fraction.clamp(0.0, 1.0) * 100.0).round() as u32
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
