//! Graph-based nonlinear dimensionality reduction.
//!
//! Nearest neighbours come from an HNSW index under cosine distance
//! (`hnsw_rs`). `umap-rs` builds the fuzzy neighbourhood graph from them and
//! optimises a layout starting from a random initialisation seeded with
//! [`ReductionParams::seed`].
//!
//! The neighbour graph and the initial layout are fixed by the input and the
//! seed. The optimiser draws negative samples from a thread-local generator,
//! so exact coordinates move slightly between runs; which points sit
//! together does not.

use hnsw_rs::prelude::*;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::error::{AutoCodingError, Result};

const MIN_DIST: f32 = 0.1;
const INIT_RANGE: f32 = 10.0;

/// `umap-rs` rejects graphs with fewer neighbours per point.
const MIN_NEIGHBORS: usize = 2;

const HNSW_MAX_CONNECTIONS: usize = 16;
const HNSW_MAX_LAYERS: usize = 16;
const HNSW_EF_CONSTRUCTION: usize = 200;
const HNSW_MIN_EF_SEARCH: usize = 64;

#[derive(Debug, Clone)]
pub struct ReductionParams {
    pub n_neighbors: usize,
    pub n_components: usize,
    pub n_epochs: usize,
    pub seed: u64,
}

impl Default for ReductionParams {
    fn default() -> Self {
        Self {
            n_neighbors: 15,
            n_components: 5,
            n_epochs: 200,
            seed: 42,
        }
    }
}

/// Neighbour count and output dimension actually used for `n` points of `dim`
/// dimensions: neighbours are capped at `n - 1`, components at
/// `min(dim, n - 1)`.
pub fn effective_params(params: &ReductionParams, n: usize, dim: usize) -> (usize, usize) {
    let limit = n.saturating_sub(1).max(1);
    let neighbors = params.n_neighbors.max(MIN_NEIGHBORS).min(limit);
    let components = params.n_components.min(dim).min(limit).max(1);
    (neighbors, components)
}

/// Reduce `data` (one row per point) to a low-dimensional layout.
pub fn reduce(data: &[Vec<f32>], params: &ReductionParams) -> Result<Vec<Vec<f32>>> {
    let n = data.len();
    if n == 0 {
        return Ok(Vec::new());
    }
    let dim = data[0].len();
    if dim == 0 || data.iter().any(|row| row.len() != dim) {
        return Err(AutoCodingError::Clustering(
            "reduction input rows must share a non-zero dimension".into(),
        ));
    }

    let (k, components) = effective_params(params, n, dim);
    if k < MIN_NEIGHBORS {
        // One or two points: nothing to lay out.
        return Ok(data.iter().map(|row| row[..components].to_vec()).collect());
    }

    let matrix = Array2::from_shape_vec((n, dim), data.concat()).map_err(|err| {
        AutoCodingError::Clustering(format!("Build embedding matrix failed: {err}"))
    })?;
    let (knn_indices, knn_dists) = build_knn_graph(data, k)?;
    let init = random_init(n, components, params.seed);
    debug!(points = n, neighbors = k, components, "neighbour graph built");

    let mut config = umap_rs::UmapConfig::default();
    config.n_components = components;
    config.graph.n_neighbors = k;
    config.manifold.min_dist = MIN_DIST;
    config.optimization.n_epochs = Some(params.n_epochs.max(1));
    let fitted = umap_rs::Umap::new(config).fit(
        matrix.view(),
        knn_indices.view(),
        knn_dists.view(),
        init.view(),
    );

    let layout = fitted.into_embedding();
    if layout.ncols() != components {
        return Err(AutoCodingError::Clustering(format!(
            "UMAP returned {} columns, expected {}",
            layout.ncols(),
            components
        )));
    }
    let rows: Vec<Vec<f32>> = layout.outer_iter().map(|row| row.to_vec()).collect();
    if rows.iter().flatten().any(|x| !x.is_finite()) {
        return Err(AutoCodingError::Clustering(
            "reduction produced non-finite coordinates".into(),
        ));
    }
    Ok(rows)
}

/// `k` nearest other points per row under cosine distance, closest first.
fn build_knn_graph(data: &[Vec<f32>], k: usize) -> Result<(Array2<u32>, Array2<f32>)> {
    let n = data.len();
    let hnsw = Hnsw::new(
        HNSW_MAX_CONNECTIONS,
        n.max(1024),
        HNSW_MAX_LAYERS,
        HNSW_EF_CONSTRUCTION,
        DistCosine {},
    );
    for (idx, row) in data.iter().enumerate() {
        hnsw.insert((row.as_slice(), idx));
    }

    let ef_search = (2 * k).max(HNSW_MIN_EF_SEARCH);
    let mut knn_indices = Array2::<u32>::zeros((n, k));
    let mut knn_dists = Array2::<f32>::zeros((n, k));
    for (row_idx, row) in data.iter().enumerate() {
        let neighbours = hnsw.search(row.as_slice(), k + 1, ef_search);
        let mut filled = 0usize;
        for neighbour in neighbours.iter().filter(|nb| nb.d_id != row_idx).take(k) {
            knn_indices[(row_idx, filled)] = neighbour.d_id as u32;
            knn_dists[(row_idx, filled)] = neighbour.distance.max(0.0);
            filled += 1;
        }
        if filled < k {
            return Err(AutoCodingError::Clustering(
                "ANN search returned insufficient neighbours".into(),
            ));
        }
    }
    Ok((knn_indices, knn_dists))
}

fn random_init(n: usize, components: usize, seed: u64) -> Array2<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array2::from_shape_fn((n, components), |_| rng.random::<f32>() * INIT_RANGE)
}
