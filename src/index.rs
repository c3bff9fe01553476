//! In-memory vector index over the active project's chunks.
//!
//! One named collection of `(Chunk, embedding)` pairs. Search is brute-force
//! cosine similarity over every stored vector, which is plenty for the few
//! thousand chunks a study project produces.
//!
//! [`VectorIndex::clear`] swaps in a fresh collection under the same name.
//! Readers that already grabbed the old collection keep working against it
//! until they finish; they are not guaranteed a consistent view across the
//! reset.

use anyhow::Result;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

use crate::embedding::{cosine_similarity, embed_query, Embedder};
use crate::models::Chunk;

struct StoredChunk {
    chunk: Chunk,
    vector: Vec<f32>,
}

#[derive(Default)]
struct Collection {
    entries: RwLock<Vec<StoredChunk>>,
}

/// A chunk returned from [`VectorIndex::query`] with its similarity score.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

pub struct VectorIndex {
    name: String,
    embedder: Arc<dyn Embedder>,
    collection: RwLock<Arc<Collection>>,
}

impl VectorIndex {
    pub fn new(name: impl Into<String>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            name: name.into(),
            embedder,
            collection: RwLock::new(Arc::new(Collection::default())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn current(&self) -> Arc<Collection> {
        Arc::clone(&self.collection.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Embed `chunks` and append them as one batch tagged with `source`.
    ///
    /// Ids continue from the collection's count at insertion time
    /// (`doc_<count + i>`). Returns the number of chunks added; an empty
    /// input is a logged no-op.
    pub async fn add(&self, chunks: Vec<String>, source: &str) -> Result<usize> {
        if chunks.is_empty() {
            warn!(source, "no chunks to embed");
            return Ok(0);
        }

        info!(source, chunks = chunks.len(), "embedding chunks");
        let vectors = self.embedder.embed(&chunks).await?;
        if vectors.len() != chunks.len() {
            anyhow::bail!(
                "embedder returned {} vectors for {} chunks",
                vectors.len(),
                chunks.len()
            );
        }

        let collection = self.current();
        let mut entries = collection
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let start_id = entries.len();
        let added = chunks.len();
        for (i, (text, vector)) in chunks.into_iter().zip(vectors).enumerate() {
            entries.push(StoredChunk {
                chunk: Chunk {
                    id: format!("doc_{}", start_id + i),
                    text,
                    source: source.to_string(),
                },
                vector,
            });
        }
        info!(total = entries.len(), collection = %self.name, "chunks embedded");
        Ok(added)
    }

    /// Return up to `k` chunks most similar to `text`, best first.
    ///
    /// An empty collection yields an empty result without calling the
    /// embedder. Ties keep storage order, so an unchanged index always
    /// returns the same ids for the same query.
    pub async fn query(&self, text: &str, k: usize) -> Result<Vec<ScoredChunk>> {
        if self.count() == 0 {
            warn!(collection = %self.name, "vector index is empty; no context");
            return Ok(Vec::new());
        }

        debug!(query = text, k, "searching vector index");
        let query_vec = embed_query(self.embedder.as_ref(), text).await?;

        let collection = self.current();
        let entries = collection
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut scored: Vec<ScoredChunk> = entries
            .iter()
            .map(|sc| ScoredChunk {
                chunk: sc.chunk.clone(),
                score: cosine_similarity(&query_vec, &sc.vector),
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(k);
        Ok(scored)
    }

    /// First `limit` chunks in storage order.
    pub fn peek(&self, limit: usize) -> Vec<Chunk> {
        let collection = self.current();
        let entries = collection
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        entries.iter().take(limit).map(|sc| sc.chunk.clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.current()
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Drop the collection and start a new, empty one under the same name.
    pub fn clear(&self) {
        let mut slot = self
            .collection
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = Arc::new(Collection::default());
        info!(collection = %self.name, "vector index cleared");
    }
}
