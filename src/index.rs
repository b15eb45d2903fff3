//! Vector index over embedded chunks.
//!
//! An append-only collection of `(chunk, vector)` entries searched by brute
//! force with cosine similarity or L2 distance. Every entry's vector has the
//! dimensionality recorded in the index, which must equal the active
//! embedder's.
//!
//! # Lifecycle
//!
//! ```text
//!   build(chunks) ──▶ VectorIndex ──save(dir)──▶ meta.json
//!                       │    ▲                    chunks.json
//!            add(chunks)│    │load(dir)           vectors.bin
//!                       ▼    │
//!                    query(text, k) ──▶ RetrievalResult
//! ```
//!
//! Adding is all-or-nothing: every new chunk is embedded and validated
//! before any entry is appended, so a failed add leaves the index as it was.
//! [`SharedIndex`] wraps an index for concurrent use. Queries take a read
//! lock and writes are serialized behind the write lock; embedding happens
//! before either lock is taken.
//!
//! Scores are "higher is better" for both metrics. L2 distances are mapped
//! to `1 / (1 + d)`.
//!
//! The index persists across runs and may hold chunks of several sources.
//! [`SharedIndex::query_within`] restricts a query to a set of document ids;
//! a scope that matches nothing behaves like an empty index.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::SimilarityMetric;
use crate::embedding::{self, blob_to_vec, cosine_similarity, l2_distance, vec_to_blob, Embedder};
use crate::error::IndexError;
use crate::models::{RetrievalResult, ScoredChunk, TextChunk};

const META_FILE: &str = "meta.json";
const CHUNKS_FILE: &str = "chunks.json";
const VECTORS_FILE: &str = "vectors.bin";
const FORMAT_VERSION: u32 = 2;

#[derive(Debug, Serialize, Deserialize)]
struct IndexMeta {
    version: u32,
    provider: String,
    model: String,
    dims: usize,
    metric: SimilarityMetric,
    count: usize,
}

#[derive(Debug, Clone)]
struct IndexEntry {
    chunk: TextChunk,
    vector: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct VectorIndex {
    provider: String,
    model: String,
    dims: usize,
    metric: SimilarityMetric,
    entries: Vec<IndexEntry>,
    ids: HashSet<String>,
}

impl VectorIndex {
    /// An empty index bound to `embedder`'s model and dimensionality.
    pub fn empty(embedder: &dyn Embedder, metric: SimilarityMetric) -> Self {
        Self {
            provider: embedder.provider().to_string(),
            model: embedder.model_name().to_string(),
            dims: embedder.dims(),
            metric,
            entries: Vec::new(),
            ids: HashSet::new(),
        }
    }

    /// Embed and index `chunks` into a new index.
    pub async fn build(
        embedder: &dyn Embedder,
        chunks: Vec<TextChunk>,
        metric: SimilarityMetric,
        batch_size: usize,
    ) -> Result<Self, IndexError> {
        let mut index = Self::empty(embedder, metric);
        index.add(embedder, chunks, batch_size).await?;
        Ok(index)
    }

    /// Embed and append `chunks`. Chunks whose id is already indexed are
    /// skipped. Returns the number of entries added.
    pub async fn add(
        &mut self,
        embedder: &dyn Embedder,
        chunks: Vec<TextChunk>,
        batch_size: usize,
    ) -> Result<usize, IndexError> {
        self.check_embedder(embedder)?;
        let fresh = self.unseen(chunks);
        if fresh.is_empty() {
            return Ok(0);
        }
        let vectors = embed_chunks(embedder, &fresh, batch_size).await?;
        self.append(fresh, vectors)
    }

    /// Append pre-computed vectors. Validates every vector before touching
    /// the index.
    fn append(&mut self, chunks: Vec<TextChunk>, vectors: Vec<Vec<f32>>) -> Result<usize, IndexError> {
        if chunks.len() != vectors.len() {
            return Err(IndexError::CountMismatch {
                expected: chunks.len(),
                returned: vectors.len(),
            });
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.dims) {
            return Err(IndexError::DimensionMismatch {
                stored: self.dims,
                active: bad.len(),
            });
        }

        let mut added = 0;
        for (chunk, vector) in chunks.into_iter().zip(vectors) {
            if self.ids.insert(chunk.id.clone()) {
                self.entries.push(IndexEntry { chunk, vector });
                added += 1;
            }
        }
        tracing::debug!(added, total = self.entries.len(), "index updated");
        Ok(added)
    }

    fn unseen(&self, chunks: Vec<TextChunk>) -> Vec<TextChunk> {
        let mut batch_ids = HashSet::new();
        chunks
            .into_iter()
            .filter(|c| !self.ids.contains(&c.id) && batch_ids.insert(c.id.clone()))
            .collect()
    }

    fn check_embedder(&self, embedder: &dyn Embedder) -> Result<(), IndexError> {
        if embedder.provider() != self.provider {
            return Err(IndexError::ProviderMismatch {
                stored: self.provider.clone(),
                active: embedder.provider().to_string(),
            });
        }
        if embedder.dims() != self.dims {
            return Err(IndexError::DimensionMismatch {
                stored: self.dims,
                active: embedder.dims(),
            });
        }
        Ok(())
    }

    /// Embed `text` and return the `k` most similar chunks, best first.
    pub async fn query(
        &self,
        embedder: &dyn Embedder,
        text: &str,
        k: usize,
    ) -> Result<RetrievalResult, IndexError> {
        if self.is_empty() {
            return Err(IndexError::EmptyIndex);
        }
        self.check_embedder(embedder)?;
        let vector = embedding::embed_query(embedder, text)
            .await
            .map_err(IndexError::Embedding)?;
        self.search(text, &vector, k)
    }

    /// Rank every entry against a pre-computed query vector.
    pub fn search(&self, query: &str, vector: &[f32], k: usize) -> Result<RetrievalResult, IndexError> {
        self.search_within(query, vector, k, None)
    }

    /// Rank the entries whose document id is in `scope` (all entries when
    /// `None`). Fails with [`IndexError::EmptyIndex`] when nothing is in scope.
    pub fn search_within(
        &self,
        query: &str,
        vector: &[f32],
        k: usize,
        scope: Option<&HashSet<String>>,
    ) -> Result<RetrievalResult, IndexError> {
        if self.is_empty_within(scope) {
            return Err(IndexError::EmptyIndex);
        }
        if vector.len() != self.dims {
            return Err(IndexError::DimensionMismatch {
                stored: self.dims,
                active: vector.len(),
            });
        }

        let mut scored: Vec<(usize, f32)> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| in_scope(&entry.chunk, scope))
            .map(|(i, entry)| (i, self.score(vector, &entry.vector)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);

        Ok(RetrievalResult {
            query: query.to_string(),
            hits: scored
                .into_iter()
                .map(|(i, score)| ScoredChunk {
                    chunk: self.entries[i].chunk.clone(),
                    score,
                })
                .collect(),
        })
    }

    fn score(&self, query: &[f32], candidate: &[f32]) -> f32 {
        let score = match self.metric {
            SimilarityMetric::Cosine => cosine_similarity(query, candidate),
            SimilarityMetric::L2 => 1.0 / (1.0 + l2_distance(query, candidate)),
        };
        if score.is_nan() {
            f32::NEG_INFINITY
        } else {
            score
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_empty_within(&self, scope: Option<&HashSet<String>>) -> bool {
        !self.entries.iter().any(|e| in_scope(&e.chunk, scope))
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn metric(&self) -> SimilarityMetric {
        self.metric
    }

    /// Score with `metric` from now on. Vectors do not depend on the metric,
    /// so a persisted index can be searched either way.
    pub fn with_metric(mut self, metric: SimilarityMetric) -> Self {
        if metric != self.metric {
            tracing::warn!(
                stored = ?self.metric,
                configured = ?metric,
                "index was saved with a different similarity metric; using the configured one"
            );
            self.metric = metric;
        }
        self
    }

    /// Persist to `dir`. Each file is written to a temporary name and renamed
    /// into place; the metadata file goes last.
    pub fn save(&self, dir: &Path) -> Result<(), IndexError> {
        std::fs::create_dir_all(dir)?;

        let chunks: Vec<&TextChunk> = self.entries.iter().map(|e| &e.chunk).collect();
        write_atomic(dir, CHUNKS_FILE, &serde_json::to_vec(&chunks)?)?;

        let mut blob = Vec::with_capacity(self.entries.len() * self.dims * 4);
        for entry in &self.entries {
            blob.extend_from_slice(&vec_to_blob(&entry.vector));
        }
        write_atomic(dir, VECTORS_FILE, &blob)?;

        let meta = IndexMeta {
            version: FORMAT_VERSION,
            provider: self.provider.clone(),
            model: self.model.clone(),
            dims: self.dims,
            metric: self.metric,
            count: self.entries.len(),
        };
        write_atomic(dir, META_FILE, &serde_json::to_vec_pretty(&meta)?)?;

        tracing::info!(dir = %dir.display(), entries = self.entries.len(), "index saved");
        Ok(())
    }

    /// Load an index saved by [`VectorIndex::save`].
    ///
    /// Fails with [`IndexError::ProviderMismatch`] when `embedder` comes from
    /// another provider and with [`IndexError::DimensionMismatch`] when the
    /// stored vectors do not match its dimensionality. A differing model name
    /// from the same provider is accepted with a warning.
    pub fn load(dir: &Path, embedder: &dyn Embedder) -> Result<Self, IndexError> {
        let meta: IndexMeta = serde_json::from_slice(&std::fs::read(dir.join(META_FILE))?)?;
        if meta.version != FORMAT_VERSION {
            return Err(IndexError::UnsupportedVersion {
                found: meta.version,
                expected: FORMAT_VERSION,
            });
        }
        if meta.provider != embedder.provider() {
            return Err(IndexError::ProviderMismatch {
                stored: meta.provider,
                active: embedder.provider().to_string(),
            });
        }
        if meta.dims != embedder.dims() {
            return Err(IndexError::DimensionMismatch {
                stored: meta.dims,
                active: embedder.dims(),
            });
        }
        if meta.model != embedder.model_name() {
            tracing::warn!(
                stored = %meta.model,
                active = embedder.model_name(),
                "index was built with a different embedding model; similarity scores may be meaningless"
            );
        }

        let chunks: Vec<TextChunk> = serde_json::from_slice(&std::fs::read(dir.join(CHUNKS_FILE))?)?;
        let blob = std::fs::read(dir.join(VECTORS_FILE))?;
        let flat = blob_to_vec(&blob);

        if chunks.len() != meta.count || flat.len() != meta.count * meta.dims {
            return Err(IndexError::CountMismatch {
                expected: meta.count,
                returned: chunks.len(),
            });
        }

        let mut index = Self {
            provider: meta.provider,
            model: meta.model,
            dims: meta.dims,
            metric: meta.metric,
            entries: Vec::with_capacity(meta.count),
            ids: HashSet::with_capacity(meta.count),
        };
        let vectors: Vec<Vec<f32>> = if meta.dims == 0 {
            vec![Vec::new(); chunks.len()]
        } else {
            flat.chunks_exact(meta.dims).map(<[f32]>::to_vec).collect()
        };
        index.append(chunks, vectors)?;

        tracing::info!(dir = %dir.display(), entries = index.len(), "index loaded");
        Ok(index)
    }

    /// Load from `dir` if a saved index exists there, else start empty.
    /// Either way the index scores with `metric`.
    pub fn load_or_empty(
        dir: &Path,
        embedder: &dyn Embedder,
        metric: SimilarityMetric,
    ) -> Result<Self, IndexError> {
        if dir.join(META_FILE).exists() {
            Ok(Self::load(dir, embedder)?.with_metric(metric))
        } else {
            Ok(Self::empty(embedder, metric))
        }
    }
}

fn in_scope(chunk: &TextChunk, scope: Option<&HashSet<String>>) -> bool {
    scope.is_none_or(|ids| ids.contains(&chunk.source.document_id))
}

async fn embed_chunks(
    embedder: &dyn Embedder,
    chunks: &[TextChunk],
    batch_size: usize,
) -> Result<Vec<Vec<f32>>, IndexError> {
    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    embedding::embed_batched(embedder, &texts, batch_size)
        .await
        .map_err(IndexError::Embedding)
}

fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> Result<(), IndexError> {
    let tmp = dir.join(format!("{}.tmp", name));
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, dir.join(name))?;
    Ok(())
}

/// A [`VectorIndex`] shared between concurrent readers and serialized
/// writers, bound to the embedder that produced it.
#[derive(Clone)]
pub struct SharedIndex {
    index: Arc<RwLock<VectorIndex>>,
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
}

impl SharedIndex {
    pub fn new(index: VectorIndex, embedder: Arc<dyn Embedder>, batch_size: usize) -> Self {
        Self {
            index: Arc::new(RwLock::new(index)),
            embedder,
            batch_size,
        }
    }

    /// Embed `chunks` without holding the lock, then append under the write
    /// lock. Readers never observe a partially added batch.
    pub async fn add(&self, chunks: Vec<TextChunk>) -> Result<usize, IndexError> {
        let fresh = {
            let guard = self.index.read().await;
            guard.check_embedder(self.embedder.as_ref())?;
            guard.unseen(chunks)
        };
        if fresh.is_empty() {
            return Ok(0);
        }
        let vectors = embed_chunks(self.embedder.as_ref(), &fresh, self.batch_size).await?;
        self.index.write().await.append(fresh, vectors)
    }

    pub async fn query(&self, text: &str, k: usize) -> Result<RetrievalResult, IndexError> {
        self.query_within(text, k, None).await
    }

    /// Query only the chunks of the documents in `scope`.
    pub async fn query_within(
        &self,
        text: &str,
        k: usize,
        scope: Option<&HashSet<String>>,
    ) -> Result<RetrievalResult, IndexError> {
        if self.index.read().await.is_empty_within(scope) {
            return Err(IndexError::EmptyIndex);
        }
        let vector = embedding::embed_query(self.embedder.as_ref(), text)
            .await
            .map_err(IndexError::Embedding)?;
        self.index.read().await.search_within(text, &vector, k, scope)
    }

    pub async fn save(&self, dir: &Path) -> Result<(), IndexError> {
        self.index.read().await.save(dir)
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.index.read().await.is_empty()
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }
}
