//! Recursive character splitter
//!
//! Text is split on the first separator that occurs in it. Pieces that still exceed
//! the chunk size are split again on the next separator, then neighbouring pieces
//! are merged back into chunks that overlap by up to `chunk_overlap` characters.
//! All sizes are measured in characters.

use tracing::warn;

use super::Document;

pub const DEFAULT_SEPARATORS: &[&str] = &["\n\n", "\n", " ", ""];

#[derive(Debug, Clone)]
pub struct RecursiveTextSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
    separators: Vec<String>,
}

impl RecursiveTextSplitter {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        let chunk_overlap = if chunk_overlap >= chunk_size {
            warn!("Chunk overlap {chunk_overlap} is not below chunk size {chunk_size}, clamping");
            chunk_size - 1
        } else {
            chunk_overlap
        };
        Self {
            chunk_size,
            chunk_overlap,
            separators: DEFAULT_SEPARATORS.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_overlap(&self) -> usize {
        self.chunk_overlap
    }

    /// Split every document, copying its metadata onto each chunk
    pub fn split_documents(&self, documents: &[Document]) -> Vec<Document> {
        documents
            .iter()
            .flat_map(|doc| {
                self.split_text(&doc.content).into_iter().map(|content| Document {
                    content,
                    metadata: doc.metadata.clone(),
                })
            })
            .collect()
    }

    pub fn split_text(&self, text: &str) -> Vec<String> {
        self.split_recursive(text, &self.separators)
    }

    fn split_recursive(&self, text: &str, separators: &[String]) -> Vec<String> {
        let (separator, remaining) = match separators
            .iter()
            .position(|sep| sep.is_empty() || text.contains(sep.as_str()))
        {
            Some(i) => (separators[i].as_str(), &separators[i + 1..]),
            None => ("", &[][..]),
        };

        let mut chunks = Vec::new();
        let mut pending: Vec<String> = Vec::new();
        for piece in split_keeping_separator(text, separator) {
            if char_len(&piece) < self.chunk_size {
                pending.push(piece);
                continue;
            }
            if !pending.is_empty() {
                chunks.extend(self.merge(&pending));
                pending.clear();
            }
            if remaining.is_empty() {
                chunks.push(piece);
            } else {
                chunks.extend(self.split_recursive(&piece, remaining));
            }
        }
        if !pending.is_empty() {
            chunks.extend(self.merge(&pending));
        }
        chunks
    }

    /// Greedily pack pieces into chunks, carrying a tail of at most `chunk_overlap`
    /// characters into the next chunk
    fn merge(&self, pieces: &[String]) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut window: Vec<&str> = Vec::new();
        let mut start = 0;
        let mut total = 0;

        for piece in pieces {
            let len = char_len(piece);
            if total + len > self.chunk_size {
                if total > self.chunk_size {
                    warn!("Created a chunk of size {total}, which is longer than {}", self.chunk_size);
                }
                if start < window.len() {
                    push_joined(&mut chunks, &window[start..]);
                    while start < window.len()
                        && (total > self.chunk_overlap || total + len > self.chunk_size)
                    {
                        total -= char_len(window[start]);
                        start += 1;
                    }
                }
            }
            window.push(piece);
            total += len;
        }
        push_joined(&mut chunks, &window[start..]);
        chunks
    }
}

impl Default for RecursiveTextSplitter {
    fn default() -> Self {
        Self::new(1000, 200)
    }
}

/// Split on a literal separator, attaching each occurrence to the piece that follows.
/// An empty separator splits into characters.
fn split_keeping_separator(text: &str, separator: &str) -> Vec<String> {
    if separator.is_empty() {
        return text.chars().map(String::from).collect();
    }
    let mut pieces = Vec::new();
    let mut last = 0;
    for (idx, _) in text.match_indices(separator) {
        pieces.push(&text[last..idx]);
        last = idx;
    }
    pieces.push(&text[last..]);
    pieces.into_iter().filter(|p| !p.is_empty()).map(String::from).collect()
}

fn push_joined(chunks: &mut Vec<String>, window: &[&str]) {
    let joined = window.concat();
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        chunks.push(trimmed.to_string());
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}
