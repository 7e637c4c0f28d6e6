//! Writing approved proposals into a tagging vocabulary.
//!
//! The persistence layer is external; [`CodingStore`] is the seam. An
//! RwLock-backed [`InMemoryCodingStore`] is provided for tests and for
//! callers that persist elsewhere.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::error::{AutoCodingError, Result};
use crate::models::NodeProposal;

/// Default similarity above which a proposal reuses its matched entry.
pub const DEFAULT_REUSE_THRESHOLD: f32 = 0.75;

/// Reference content is cut to this many characters.
const REFERENCE_CONTENT_CHARS: usize = 500;

/// A node to create in the vocabulary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewNode {
    pub name: String,
    pub description: String,
    pub color: String,
    pub parent_id: Option<String>,
}

/// A stored vocabulary node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodingNode {
    pub id: String,
    pub name: String,
    pub description: String,
    pub color: String,
    pub parent_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Links a node to a span of a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeReference {
    pub node_id: String,
    pub source_id: String,
    /// Character offsets into the source.
    pub start_pos: usize,
    pub end_pos: usize,
    pub content: String,
}

/// Node produced by [`materialize_proposals`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterializedNode {
    pub node_id: String,
    pub name: String,
    /// False when an existing entry was reused.
    pub created: bool,
    pub reference_count: usize,
}

pub trait CodingStore: Send + Sync {
    /// Create a node and return its id.
    fn create_node(&self, node: NewNode) -> Result<String>;
    fn add_reference(&self, reference: CodeReference) -> Result<()>;
    fn nodes(&self) -> Result<Vec<CodingNode>>;
    fn references(&self) -> Result<Vec<CodeReference>>;
}

#[derive(Default)]
pub struct InMemoryCodingStore {
    nodes: RwLock<Vec<CodingNode>>,
    references: RwLock<Vec<CodeReference>>,
}

impl InMemoryCodingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> AutoCodingError {
    AutoCodingError::Store("store lock poisoned".into())
}

impl CodingStore for InMemoryCodingStore {
    fn create_node(&self, node: NewNode) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let mut nodes = self.nodes.write().map_err(poisoned)?;
        nodes.push(CodingNode {
            id: id.clone(),
            name: node.name,
            description: node.description,
            color: node.color,
            parent_id: node.parent_id,
            created_at: Utc::now(),
        });
        Ok(id)
    }

    fn add_reference(&self, reference: CodeReference) -> Result<()> {
        self.references.write().map_err(poisoned)?.push(reference);
        Ok(())
    }

    fn nodes(&self) -> Result<Vec<CodingNode>> {
        Ok(self.nodes.read().map_err(poisoned)?.clone())
    }

    fn references(&self) -> Result<Vec<CodeReference>> {
        Ok(self.references.read().map_err(poisoned)?.clone())
    }
}

fn truncate_content(text: &str) -> String {
    match text.char_indices().nth(REFERENCE_CONTENT_CHARS) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Write every selected proposal to `store`.
///
/// A proposal whose existing-vocabulary match has similarity
/// `>= reuse_threshold` reuses that entry; otherwise a node is created under
/// `parent_id`. Each member segment becomes one [`CodeReference`].
pub fn materialize_proposals(
    store: &dyn CodingStore,
    proposals: &[NodeProposal],
    parent_id: Option<&str>,
    reuse_threshold: f32,
) -> Result<Vec<MaterializedNode>> {
    let mut materialized = Vec::new();

    for proposal in proposals.iter().filter(|p| p.is_selected) {
        let reuse = proposal
            .existing_node_id
            .as_ref()
            .filter(|_| proposal.similarity_to_existing >= reuse_threshold);

        let (node_id, name, created) = match reuse {
            Some(id) => (
                id.clone(),
                proposal
                    .existing_node_name
                    .clone()
                    .unwrap_or_else(|| proposal.display_name().to_string()),
                false,
            ),
            None => {
                let id = store.create_node(NewNode {
                    name: proposal.display_name().to_string(),
                    description: proposal.description.clone(),
                    color: proposal.color.clone(),
                    parent_id: parent_id.map(str::to_string),
                })?;
                (id, proposal.display_name().to_string(), true)
            }
        };

        for segment in &proposal.segments {
            store.add_reference(CodeReference {
                node_id: node_id.clone(),
                source_id: segment.source_id.clone(),
                start_pos: segment.start_char,
                end_pos: segment.end_char,
                content: truncate_content(&segment.text),
            })?;
        }

        materialized.push(MaterializedNode {
            node_id,
            name,
            created,
            reference_count: proposal.segments.len(),
        });
    }

    info!(
        nodes = materialized.len(),
        created = materialized.iter().filter(|n| n.created).count(),
        "proposals materialized"
    );
    Ok(materialized)
}
