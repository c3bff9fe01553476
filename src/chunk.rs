//! Fixed-window text chunker.
//!
//! Splits normalized document text into overlapping spans of `size`
//! characters. Each window starts `size - overlap` characters after the
//! previous one, so consecutive spans share exactly `overlap` characters
//! (the last span may be shorter).
//!
//! Windows are measured in Unicode scalar values, never bytes, so a span
//! boundary can't land inside a multi-byte character.
//!
//! # Example
//!
//! ```rust
//! use letslearn::chunk::Chunker;
//!
//! let chunker = Chunker::new(4, 1).unwrap();
//! assert_eq!(chunker.split("abcdefghij"), vec!["abcd", "defg", "ghij", "j"]);
//! ```

use crate::error::{Result, StudyError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunker {
    size: usize,
    overlap: usize,
}

impl Chunker {
    /// Build a chunker. `overlap >= size` would never advance the window,
    /// so it is rejected here rather than looping forever in [`split`](Self::split).
    pub fn new(size: usize, overlap: usize) -> Result<Self> {
        if size == 0 {
            return Err(StudyError::InvalidInput(
                "chunk size must be greater than zero".to_string(),
            ));
        }
        if overlap >= size {
            return Err(StudyError::InvalidInput(format!(
                "chunk overlap ({}) must be smaller than chunk size ({})",
                overlap, size
            )));
        }
        Ok(Self { size, overlap })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Distance between the starts of consecutive windows.
    pub fn step(&self) -> usize {
        self.size - self.overlap
    }

    /// Cut `text` into windows `text[start..start + size]` for
    /// `start = 0, step, 2 * step, ...` while `start < len(text)`.
    pub fn split(&self, text: &str) -> Vec<String> {
        // Byte offset of every char, plus the end of the string.
        let mut offsets: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
        let len = offsets.len();
        offsets.push(text.len());

        let mut chunks = Vec::with_capacity(len.div_ceil(self.step()));
        let mut start = 0;
        while start < len {
            let end = (start + self.size).min(len);
            chunks.push(text[offsets[start]..offsets[end]].to_string());
            start += self.step();
        }
        chunks
    }
}
