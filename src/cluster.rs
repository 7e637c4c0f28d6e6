//! Segment clustering, theme merging, and vocabulary matching.
//!
//! [`ClusteringPipeline::cluster`] reduces embedded segments with
//! [`crate::reduce`] and runs HDBSCAN on the layout. Points HDBSCAN leaves
//! unassigned (label `-1`) are returned as noise.
//!
//! Membership probability is approximated per point as
//! `min core distance in its cluster / own core distance`, where the core
//! distance is the distance to the `min_samples`-th nearest neighbour in the
//! reduced space. A cluster's coherence is the mean over its members.

use hdbscan::{Hdbscan, HdbscanHyperParams};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::embedding::{cosine_similarity, mean_vector};
use crate::error::{AutoCodingError, Result};
use crate::models::{AutoCodingConfig, ClusterResult, Segment};
use crate::reduce::{reduce, ReductionParams};

/// Label HDBSCAN assigns to noise points.
pub const NOISE_LABEL: i32 = -1;

#[derive(Debug, Clone)]
pub struct ClusteringParams {
    pub min_cluster_size: usize,
    pub min_samples: usize,
    pub reduction: ReductionParams,
}

impl ClusteringParams {
    pub fn from_config(config: &AutoCodingConfig) -> Self {
        Self {
            min_cluster_size: config.min_cluster_size,
            min_samples: config.min_samples,
            reduction: ReductionParams {
                n_neighbors: config.reduction_neighbors,
                n_components: config.reduction_components,
                seed: config.reduction_seed,
                ..Default::default()
            },
        }
    }
}

/// An existing vocabulary entry with its name embedding.
#[derive(Debug, Clone)]
pub struct VocabularyVector {
    pub id: String,
    pub name: String,
    pub embedding: Vec<f32>,
}

/// Best existing vocabulary entry for a cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VocabularyMatch {
    pub id: String,
    pub name: String,
    pub similarity: f32,
}

pub struct ClusteringPipeline {
    params: ClusteringParams,
}

impl ClusteringPipeline {
    pub fn new(params: ClusteringParams) -> Self {
        Self { params }
    }

    pub fn from_config(config: &AutoCodingConfig) -> Self {
        Self::new(ClusteringParams::from_config(config))
    }

    /// Cluster embedded segments into at most `max_clusters` groups.
    ///
    /// Returns `(clusters, noise)`. Segments without an embedding are
    /// ignored; every embedded segment lands in exactly one of the two.
    /// Clusters are ordered by descending size.
    pub fn cluster(
        &self,
        segments: &[Segment],
        max_clusters: usize,
    ) -> Result<(Vec<ClusterResult>, Vec<Segment>)> {
        let embedded: Vec<&Segment> = segments.iter().filter(|s| s.embedding.is_some()).collect();

        if embedded.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }
        let min_cluster_size = self.params.min_cluster_size.max(2);
        if embedded.len() < min_cluster_size {
            debug!(
                embedded = embedded.len(),
                min_cluster_size, "too few segments to cluster"
            );
            return Ok((Vec::new(), embedded.into_iter().cloned().collect()));
        }

        let data: Vec<Vec<f32>> = embedded
            .iter()
            .filter_map(|s| s.embedding.clone())
            .collect();
        let n = data.len();

        let reduced = reduce(&data, &self.params.reduction)?;

        let min_samples = self.params.min_samples.min(n - 1).max(1);
        let hyper_params = HdbscanHyperParams::builder()
            .min_cluster_size(min_cluster_size)
            .min_samples(min_samples)
            .build();
        let labels = Hdbscan::new(&reduced, hyper_params)
            .cluster()
            .map_err(|err| AutoCodingError::Clustering(format!("HDBSCAN failed: {err}")))?;
        if labels.len() != n {
            return Err(AutoCodingError::Clustering(
                "HDBSCAN output length mismatch".into(),
            ));
        }

        let probabilities = membership_probabilities(&reduced, &labels, min_samples);
        let (clusters, noise) = group_clusters(&embedded, &labels, &probabilities);
        let (clusters, noise) = cap_clusters(clusters, noise, max_clusters);

        info!(
            segments = n,
            clusters = clusters.len(),
            noise = noise.len(),
            "clustering complete"
        );
        Ok((clusters, noise))
    }
}

/// Distance to the `k`-th nearest other point, per point.
fn core_distances(points: &[Vec<f32>], k: usize) -> Vec<f32> {
    let n = points.len();
    let k = k.clamp(1, n.saturating_sub(1).max(1));
    (0..n)
        .map(|i| {
            let mut dists: Vec<f32> = (0..n)
                .filter(|&j| j != i)
                .map(|j| {
                    points[i]
                        .iter()
                        .zip(&points[j])
                        .map(|(a, b)| (a - b) * (a - b))
                        .sum::<f32>()
                        .sqrt()
                })
                .collect();
            dists.sort_by(f32::total_cmp);
            dists.get(k - 1).copied().unwrap_or(0.0)
        })
        .collect()
}

/// Per-point membership in `[0, 1]`; noise points get `0`.
pub(crate) fn membership_probabilities(points: &[Vec<f32>], labels: &[i32], k: usize) -> Vec<f32> {
    let core = core_distances(points, k);

    let mut densest: BTreeMap<i32, f32> = BTreeMap::new();
    for (&label, &c) in labels.iter().zip(&core) {
        if label == NOISE_LABEL {
            continue;
        }
        let entry = densest.entry(label).or_insert(f32::INFINITY);
        *entry = entry.min(c);
    }

    labels
        .iter()
        .zip(&core)
        .map(|(&label, &c)| {
            if label == NOISE_LABEL {
                return 0.0;
            }
            if c <= f32::EPSILON {
                return 1.0;
            }
            let min_core = densest.get(&label).copied().unwrap_or(c);
            (min_core / c).clamp(0.0, 1.0)
        })
        .collect()
}

/// Group labelled points into clusters ordered by descending size, ties by
/// first member. Cluster ids are positions in that order.
pub(crate) fn group_clusters(
    segments: &[&Segment],
    labels: &[i32],
    probabilities: &[f32],
) -> (Vec<ClusterResult>, Vec<Segment>) {
    let mut members: BTreeMap<i32, Vec<usize>> = BTreeMap::new();
    let mut noise = Vec::new();

    for (i, &label) in labels.iter().enumerate() {
        if label == NOISE_LABEL {
            noise.push(segments[i].clone());
        } else {
            members.entry(label).or_default().push(i);
        }
    }

    // Independent of HDBSCAN's label values.
    let mut groups: Vec<Vec<usize>> = members.into_values().collect();
    groups.sort_by(|a, b| b.len().cmp(&a.len()).then(a[0].cmp(&b[0])));

    let clusters: Vec<ClusterResult> = groups
        .into_iter()
        .enumerate()
        .map(|(position, indices)| {
            let cluster_segments: Vec<Segment> =
                indices.iter().map(|&i| segments[i].clone()).collect();
            let centroid = segment_centroid(&cluster_segments);
            let coherence = indices.iter().map(|&i| probabilities[i]).sum::<f32>()
                / indices.len() as f32;
            ClusterResult {
                cluster_id: position as i32,
                segments: cluster_segments,
                centroid,
                coherence_score: coherence.clamp(0.0, 1.0),
            }
        })
        .collect();

    (clusters, noise)
}

/// Keep the first `max_clusters`; members of the rest become noise.
pub(crate) fn cap_clusters(
    mut clusters: Vec<ClusterResult>,
    mut noise: Vec<Segment>,
    max_clusters: usize,
) -> (Vec<ClusterResult>, Vec<Segment>) {
    if clusters.len() > max_clusters {
        let dropped = clusters.split_off(max_clusters);
        debug!(dropped = dropped.len(), max_clusters, "capping cluster count");
        for cluster in dropped {
            noise.extend(cluster.segments);
        }
    }
    (clusters, noise)
}

fn segment_centroid(segments: &[Segment]) -> Vec<f32> {
    mean_vector(segments.iter().filter_map(|s| s.embedding.as_deref()))
}

/// Disjoint sets over cluster indices; the smallest index is always the root.
struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut node = x;
        while self.parent[node] != root {
            let next = self.parent[node];
            self.parent[node] = root;
            node = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            let (root, child) = (ra.min(rb), ra.max(rb));
            self.parent[child] = root;
        }
    }
}

/// Merge clusters whose centroids have cosine similarity `>= threshold`.
///
/// Similarity is transitive through union-find: if A~B and B~C, all three
/// merge. A merged cluster keeps the id of its first member, concatenates the
/// members, recomputes the centroid from member embeddings, and averages the
/// coherence scores. Passes repeat until nothing changes, so applying the
/// function twice equals applying it once.
pub fn merge_similar_clusters(clusters: Vec<ClusterResult>, threshold: f32) -> Vec<ClusterResult> {
    let mut clusters = clusters;
    loop {
        let before = clusters.len();
        clusters = merge_pass(clusters, threshold);
        if clusters.len() == before {
            return clusters;
        }
    }
}

fn merge_pass(clusters: Vec<ClusterResult>, threshold: f32) -> Vec<ClusterResult> {
    let n = clusters.len();
    if n < 2 {
        return clusters;
    }

    let mut sets = UnionFind::new(n);
    for i in 0..n {
        for j in (i + 1)..n {
            if cosine_similarity(&clusters[i].centroid, &clusters[j].centroid) >= threshold {
                sets.union(i, j);
            }
        }
    }

    // Group by root, ordered by each group's first index.
    let mut groups: Vec<Vec<usize>> = Vec::new();
    let mut group_of_root: BTreeMap<usize, usize> = BTreeMap::new();
    for i in 0..n {
        let root = sets.find(i);
        let slot = *group_of_root.entry(root).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[slot].push(i);
    }

    let mut slots: Vec<Option<ClusterResult>> = clusters.into_iter().map(Some).collect();
    let mut merged = Vec::with_capacity(groups.len());

    for group in groups {
        let parts: Vec<ClusterResult> = group.iter().filter_map(|&i| slots[i].take()).collect();
        if parts.len() == 1 {
            merged.extend(parts);
            continue;
        }

        let cluster_id = parts[0].cluster_id;
        let coherence =
            parts.iter().map(|c| c.coherence_score).sum::<f32>() / parts.len() as f32;
        let fallback_centroid = mean_vector(parts.iter().map(|c| c.centroid.as_slice()));
        let segments: Vec<Segment> = parts.into_iter().flat_map(|c| c.segments).collect();
        let mut centroid = segment_centroid(&segments);
        if centroid.is_empty() {
            centroid = fallback_centroid;
        }

        debug!(cluster_id, members = segments.len(), "merged similar clusters");
        merged.push(ClusterResult {
            cluster_id,
            segments,
            centroid,
            coherence_score: coherence.clamp(0.0, 1.0),
        });
    }
    merged
}

/// Best vocabulary entry for `cluster` with similarity `>= threshold`.
pub fn find_similar_to_existing(
    cluster: &ClusterResult,
    existing: &[VocabularyVector],
    threshold: f32,
) -> Option<VocabularyMatch> {
    if existing.is_empty() || cluster.centroid.is_empty() {
        return None;
    }

    let mut best: Option<(&VocabularyVector, f32)> = None;
    for entry in existing {
        let similarity = cosine_similarity(&cluster.centroid, &entry.embedding).clamp(0.0, 1.0);
        if best.map_or(true, |(_, s)| similarity > s) {
            best = Some((entry, similarity));
        }
    }

    best.filter(|(_, similarity)| *similarity >= threshold)
        .map(|(entry, similarity)| VocabularyMatch {
            id: entry.id.clone(),
            name: entry.name.clone(),
            similarity,
        })
}
