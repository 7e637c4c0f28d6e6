//! # qda-autocode
//!
//! Automatic theme detection ("auto-coding") for qualitative data analysis.
//!
//! Given a corpus of text sources, the pipeline splits them into segments,
//! embeds each segment, clusters the embeddings, names every cluster, and
//! returns ranked theme proposals for a human to review. Approved proposals
//! can then be written into a tagging vocabulary.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌──────────────┐   ┌───────────┐
//! │ Sources  │──▶│  Segment  │──▶│    Embed     │──▶│  Cluster  │
//! │ txt / md │   │ paragraph │   │ ollama/openai│   │ reduce +  │
//! └──────────┘   │ sentence  │   │ local + cache│   │ hdbscan   │
//!                └───────────┘   └──────────────┘   └─────┬─────┘
//!                                                         │
//!                ┌───────────┐   ┌──────────────┐   ┌─────▼─────┐
//!                │   Store   │◀──│  Proposals   │◀──│   Label   │
//!                │ (approve) │   │ rank + match │   │ LLM / kw  │
//!                └───────────┘   └──────────────┘   └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! qda-autocode check                     # probe embedding/labeling backends
//! qda-autocode models --pull mistral     # fetch a labeling model
//! qda-autocode analyze ./interviews      # print proposals as JSON
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`segment`] | Source segmentation |
//! | [`embedding`] | Embedding providers, cache and engine |
//! | [`reduce`] | Graph-based dimensionality reduction |
//! | [`cluster`] | Density clustering, merging, vocabulary matching |
//! | [`label`] | Theme naming (Ollama, remote APIs, keywords) |
//! | [`engine`] | End-to-end `analyze` orchestration |
//! | [`store`] | Materializing approved proposals |
//! | [`deps`] | Dependency probes |
//! | [`progress`] | Progress events and reporters |
//! | [`error`] | Error taxonomy |

pub mod cluster;
pub mod config;
pub mod deps;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod label;
pub mod models;
pub mod progress;
pub mod reduce;
pub mod segment;
pub mod store;

pub use engine::{AutoCodingEngine, CancellationToken};
pub use error::{AutoCodingError, Result};
pub use models::{AutoCodingConfig, AutoCodingResult, NodeProposal, Source, VocabularyEntry};
