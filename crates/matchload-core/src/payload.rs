//! Randomized query and upsert payloads.
//!
//! Synthesis is a pure function of the [`EmbeddingSpec`] and the caller's RNG,
//! so a seeded RNG reproduces the exact same request stream.

use rand::seq::index;
use rand::Rng;

use crate::config::{DenseValueRange, EmbeddingKind, EmbeddingSpec, RunConfig};

/// Sparse embedding as parallel dimension / value arrays.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseVector {
    /// Pairwise distinct, ascending, each `< sparse_dimensions`.
    pub dimensions: Vec<u64>,
    pub values: Vec<f32>,
}

/// One query datapoint.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryVector {
    pub id: String,
    /// Empty for sparse-only queries.
    pub dense: Vec<f32>,
    pub sparse: Option<SparseVector>,
}

/// Everything needed to issue one findNeighbors call.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    pub index_endpoint: String,
    pub deployed_index_id: String,
    pub queries: Vec<QueryVector>,
    pub neighbor_count: u32,
    pub fraction_leaf_nodes_to_search_override: Option<f64>,
    pub return_full_datapoint: bool,
    /// RRF weight, hybrid queries only.
    pub rrf_alpha: Option<f32>,
}

/// Everything needed to issue one upsertDatapoints call.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertEnvelope {
    pub index: String,
    /// Fresh datapoints; ids are random UUIDs.
    pub datapoints: Vec<QueryVector>,
}

/// Builds query vectors and request envelopes for one run configuration.
#[derive(Debug, Clone)]
pub struct PayloadSynthesizer {
    spec: EmbeddingSpec,
    index_endpoint: String,
    deployed_index_id: String,
    index: String,
    neighbor_count: u32,
    fraction_leaf_nodes_to_search_override: Option<f64>,
    return_full_datapoint: bool,
    embeddings_per_request: usize,
    rrf_alpha: Option<f32>,
}

impl PayloadSynthesizer {
    pub fn new(config: &RunConfig) -> Self {
        Self {
            spec: config.embedding.clone(),
            index_endpoint: config.index_endpoint.clone(),
            deployed_index_id: config.deployed_index_id.clone(),
            index: config.index.clone().unwrap_or_default(),
            neighbor_count: config.neighbor_count,
            fraction_leaf_nodes_to_search_override: config.fraction_leaf_nodes_to_search_override,
            return_full_datapoint: config.return_full_datapoint,
            embeddings_per_request: config.embeddings_per_request,
            rrf_alpha: config.rrf_alpha,
        }
    }

    pub fn kind(&self) -> EmbeddingKind {
        self.spec.kind
    }

    /// Builds one query vector of the given kind.
    pub fn build_vector<R: Rng + ?Sized>(&self, kind: EmbeddingKind, id: usize, rng: &mut R) -> QueryVector {
        let dense = if kind.has_dense() {
            self.dense_values(rng)
        } else {
            Vec::new()
        };
        let sparse = kind.has_sparse().then(|| self.sparse_values(rng));

        QueryVector {
            id: id.to_string(),
            dense,
            sparse,
        }
    }

    /// Builds a full request with `embeddings_per_request` fresh vectors.
    pub fn build_envelope<R: Rng + ?Sized>(&self, rng: &mut R) -> RequestEnvelope {
        let queries = (0..self.embeddings_per_request)
            .map(|i| self.build_vector(self.spec.kind, i, rng))
            .collect();

        RequestEnvelope {
            index_endpoint: self.index_endpoint.clone(),
            deployed_index_id: self.deployed_index_id.clone(),
            queries,
            neighbor_count: self.neighbor_count,
            fraction_leaf_nodes_to_search_override: self.fraction_leaf_nodes_to_search_override,
            return_full_datapoint: self.return_full_datapoint,
            rrf_alpha: self.rrf_alpha.filter(|_| self.spec.kind == EmbeddingKind::Hybrid),
        }
    }

    /// Builds `embeddings_per_request` datapoints to write.
    ///
    /// Dense values are uniform in `[0, 1)`; a sparse embedding is attached
    /// when the configured kind has one.
    pub fn build_upsert<R: Rng + ?Sized>(&self, rng: &mut R) -> UpsertEnvelope {
        let datapoints = (0..self.embeddings_per_request)
            .map(|_| QueryVector {
                id: uuid::Builder::from_random_bytes(rng.gen())
                    .into_uuid()
                    .to_string(),
                dense: (0..self.spec.dimensions).map(|_| rng.gen::<f32>()).collect(),
                sparse: self.spec.kind.has_sparse().then(|| self.sparse_values(rng)),
            })
            .collect();

        UpsertEnvelope {
            index: self.index.clone(),
            datapoints,
        }
    }

    fn dense_values<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<f32> {
        let n = self.spec.dimensions;
        match self.spec.dense_values {
            DenseValueRange::Integer { min, max } => {
                (0..n).map(|_| rng.gen_range(min..=max) as f32).collect()
            }
            DenseValueRange::Float { min, max } => {
                (0..n).map(|_| rng.gen_range(min..max)).collect()
            }
        }
    }

    fn sparse_values<R: Rng + ?Sized>(&self, rng: &mut R) -> SparseVector {
        let active = self.spec.sparse_active.min(self.spec.sparse_dimensions);
        // Duplicate dimensions are rejected by the index, so sample without replacement.
        let mut dimensions: Vec<u64> = index::sample(rng, self.spec.sparse_dimensions, active)
            .into_iter()
            .map(|d| d as u64)
            .collect();
        dimensions.sort_unstable();

        let (min, max) = self.spec.sparse_values;
        let values = (0..active).map(|_| rng.gen_range(min..max)).collect();

        SparseVector { dimensions, values }
    }
}
