//! Bounded context windows for generation prompts.
//!
//! With a query, the `k` nearest chunks are joined best-first; without one,
//! the first `limit` chunks in storage order are used (topic-agnostic tasks
//! like summaries). The joined string is then cut to `max_chars`
//! characters from the end. That cut can land in the middle of a chunk;
//! callers get exactly `max_chars` characters and nothing is re-aligned to
//! chunk or sentence boundaries.

use anyhow::Result;
use std::sync::Arc;

use crate::index::VectorIndex;

/// Placed between consecutive chunks in an assembled context.
pub const SEPARATOR: &str = "\n\n---\n\n";

#[derive(Debug, Clone, Copy)]
pub struct ContextRequest<'a> {
    /// Empty means "no search, take chunks in storage order".
    pub query: &'a str,
    pub limit: usize,
    pub max_chars: usize,
    pub k: usize,
}

#[derive(Clone)]
pub struct ContextAssembler {
    index: Arc<VectorIndex>,
}

impl ContextAssembler {
    pub fn new(index: Arc<VectorIndex>) -> Self {
        Self { index }
    }

    /// Build the context string. An empty index gives `""`, which callers
    /// treat as "no knowledge available".
    pub async fn assemble(&self, req: &ContextRequest<'_>) -> Result<String> {
        if self.index.count() == 0 {
            return Ok(String::new());
        }

        let texts: Vec<String> = if req.query.is_empty() {
            self.index
                .peek(req.limit)
                .into_iter()
                .map(|c| c.text)
                .collect()
        } else {
            self.index
                .query(req.query, req.k)
                .await?
                .into_iter()
                .map(|sc| sc.chunk.text)
                .collect()
        };

        Ok(truncate_chars(&texts.join(SEPARATOR), req.max_chars))
    }
}

/// Keep at most `max_chars` characters of `s`.
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => s[..byte_idx].to_string(),
        None => s.to_string(),
    }
}
