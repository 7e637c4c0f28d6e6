//! # qda-autocode CLI
//!
//! Runs the auto-coding pipeline over a directory of plain-text sources and
//! prints the resulting theme proposals as JSON.
//!
//! ## Usage
//!
//! ```bash
//! qda-autocode [--config ./config/qda-autocode.toml] <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `qda-autocode analyze <dir>` | Detect themes in `.txt` / `.md` files |
//! | `qda-autocode check` | Probe embedding, clustering, and labeling backends |
//! | `qda-autocode models` | List installed and recommended Ollama models |
//! | `qda-autocode models --pull <name>` | Download an Ollama model |
//!
//! Logs go to stderr (`RUST_LOG`, default `info`, with the layout
//! library's per-fit logs at `warn`); stdout carries only the
//! command's output.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use qda_autocode::config::{self, Config};
use qda_autocode::deps::check_dependencies;
use qda_autocode::engine::{AutoCodingEngine, CancellationToken};
use qda_autocode::label::{list_ollama_models, pull_ollama_model, RECOMMENDED_OLLAMA_MODELS};
use qda_autocode::models::{LabelingProvider, SegmentationStrategy, Source, VocabularyEntry};
use qda_autocode::progress::ProgressMode;

/// Automatic theme detection for qualitative data analysis.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. Without one, built-in defaults are used (Ollama for embeddings and
/// labeling on localhost).
#[derive(Parser)]
#[command(
    name = "qda-autocode",
    about = "Automatic theme detection (auto-coding) for qualitative data analysis",
    version,
    long_about = "Segments text sources, embeds the segments, clusters them into themes, \
    and names each theme with a local or remote language model. Proposals are printed \
    as JSON for review."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Optional. When omitted, `./config/qda-autocode.toml` is used if it
    /// exists, otherwise built-in defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Detect themes in a directory of sources.
    ///
    /// Every `.txt` and `.md` file under DIR becomes one source. The result
    /// (proposals ordered by confidence) is written to stdout as JSON.
    Analyze {
        /// Directory to scan recursively.
        dir: PathBuf,

        /// JSON file with the existing vocabulary: `[{"id": "...", "name": "..."}]`.
        #[arg(long)]
        vocabulary: Option<PathBuf>,

        /// Progress output on stderr. Defaults to `human` on a terminal, `off` otherwise.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,

        /// Segmentation strategy: paragraph, sentence, semantic, or window.
        #[arg(long)]
        strategy: Option<SegmentationStrategy>,

        /// Maximum number of themes to propose.
        #[arg(long)]
        max_themes: Option<usize>,

        /// Name themes from keywords instead of a language model.
        #[arg(long)]
        no_llm: bool,

        /// Pretty-print the JSON result.
        #[arg(long)]
        pretty: bool,
    },

    /// Check that the configured backends are reachable.
    ///
    /// Exits with a non-zero status when analysis cannot run.
    Check {
        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List local Ollama models, or pull one.
    Models {
        /// Model to download (e.g. `mistral`).
        #[arg(long)]
        pull: Option<String>,
    },
}

const DEFAULT_CONFIG_PATH: &str = "./config/qda-autocode.toml";

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,umap_rs=warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cfg = resolve_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Analyze {
            dir,
            vocabulary,
            progress,
            strategy,
            max_themes,
            no_llm,
            pretty,
        } => {
            let mut cfg = cfg;
            if let Some(strategy) = strategy {
                cfg.autocoding.segmentation_strategy = strategy;
            }
            if let Some(max_themes) = max_themes {
                cfg.autocoding.max_themes = max_themes;
            }
            if no_llm {
                cfg.autocoding.llm_provider = LabelingProvider::None;
            }
            let progress = progress.unwrap_or_else(ProgressMode::default_for_tty);
            run_analyze(&cfg, &dir, vocabulary.as_deref(), progress, pretty)?;
        }
        Commands::Check { json } => {
            let report = check_dependencies(&cfg);
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report);
            }
            if !report.can_analyze() {
                anyhow::bail!("analysis cannot run: embedding or clustering is unavailable");
            }
        }
        Commands::Models { pull } => match pull {
            Some(name) => run_pull(&cfg, &name)?,
            None => run_list_models(&cfg)?,
        },
    }

    Ok(())
}

fn resolve_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => config::load_config(path),
        None => {
            let default = Path::new(DEFAULT_CONFIG_PATH);
            if default.exists() {
                config::load_config(default)
            } else {
                Ok(Config::default())
            }
        }
    }
}

/// Read every `.txt` / `.md` file under `dir`, sorted by path.
fn collect_sources(dir: &Path) -> Result<Vec<Source>> {
    if !dir.is_dir() {
        anyhow::bail!("Not a directory: {}", dir.display());
    }

    let mut paths = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.with_context(|| format!("Failed to walk {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let is_text = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("txt") || e.eq_ignore_ascii_case("md"));
        if is_text {
            paths.push(entry.into_path());
        }
    }
    paths.sort();

    paths
        .into_iter()
        .map(|path| {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let id = path
                .strip_prefix(dir)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace('\\', "/");
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| id.clone());
            Ok(Source::new(id, name, content))
        })
        .collect()
}

fn load_vocabulary(path: &Path) -> Result<Vec<VocabularyEntry>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read vocabulary file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse vocabulary file: {}", path.display()))
}

fn run_analyze(
    cfg: &Config,
    dir: &Path,
    vocabulary: Option<&Path>,
    progress: ProgressMode,
    pretty: bool,
) -> Result<()> {
    let sources = collect_sources(dir)?;
    let existing = match vocabulary {
        Some(path) => load_vocabulary(path)?,
        None => Vec::new(),
    };
    tracing::info!(
        sources = sources.len(),
        vocabulary = existing.len(),
        dir = %dir.display(),
        "starting analysis"
    );

    let engine = AutoCodingEngine::from_config(cfg)?;
    let reporter = progress.reporter();
    let result = engine.analyze_with(
        &sources,
        &cfg.autocoding,
        &existing,
        &*reporter,
        &CancellationToken::new(),
    )?;

    let json = if pretty {
        serde_json::to_string_pretty(&result)?
    } else {
        serde_json::to_string(&result)?
    };
    println!("{}", json);
    Ok(())
}

fn run_list_models(cfg: &Config) -> Result<()> {
    let url = &cfg.labeling.ollama_url;
    let installed = list_ollama_models(url)
        .with_context(|| format!("Failed to list models from Ollama at {}", url))?;

    println!("Installed ({}):", url);
    if installed.is_empty() {
        println!("  (none)");
    }
    for name in &installed {
        println!("  {}", name);
    }

    println!();
    println!("Recommended for labeling:");
    for model in RECOMMENDED_OLLAMA_MODELS.iter() {
        let marker = if installed
            .iter()
            .any(|m| m == model.name || *m == format!("{}:latest", model.name))
        {
            "*"
        } else {
            " "
        };
        println!(
            "{} {:<10} {:<14} {:>5.1} GB  {}",
            marker, model.name, model.display_name, model.size_gb, model.description
        );
    }
    Ok(())
}

fn run_pull(cfg: &Config, name: &str) -> Result<()> {
    let mut last = String::new();
    pull_ollama_model(&cfg.labeling.ollama_url, name, &mut |fraction: f32, status: &str| {
        let line = format!("{:>3}% {}", (fraction * 100.0).round() as u32, status);
        if line != last {
            eprintln!("{}", line);
            last = line;
        }
    })
    .with_context(|| format!("Failed to pull model '{}'", name))?;
    println!("Model '{}' is ready.", name);
    Ok(())
}
