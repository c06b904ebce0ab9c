//! In-memory vector index with maximal-marginal-relevance search

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use super::embeddings::{cosine_similarity, Embeddings};
use super::Document;
use crate::error::Result;

struct IndexEntry {
    document: Document,
    embedding: Vec<f32>,
}

/// Embedded chunks of one directory
pub struct VectorIndex {
    entries: Vec<IndexEntry>,
    embedder: Arc<dyn Embeddings>,
    directory: PathBuf,
}

impl VectorIndex {
    /// Embed `documents` and build an index over them
    pub fn build(documents: Vec<Document>, embedder: Arc<dyn Embeddings>, directory: &Path) -> Result<Self> {
        let texts: Vec<String> = documents.iter().map(|d| d.content.clone()).collect();
        let embeddings = embedder.embed_documents(&texts)?;

        let entries = documents
            .into_iter()
            .zip(embeddings)
            .map(|(document, embedding)| IndexEntry { document, embedding })
            .collect();

        Ok(Self {
            entries,
            embedder,
            directory: directory.to_path_buf(),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// The `k` chunks most similar to `query`, best first
    pub fn similarity_search(&self, query: &str, k: usize) -> Result<Vec<(Document, f32)>> {
        let query_embedding = self.embedder.embed_query(query)?;
        Ok(self
            .ranked(&query_embedding, k)
            .into_iter()
            .map(|(i, score)| (self.entries[i].document.clone(), score))
            .collect())
    }

    /// Fetch the `fetch_k` nearest chunks, then pick `k` of them balancing relevance
    /// against redundancy. `lambda` = 1 is pure relevance, 0 is pure diversity.
    pub fn max_marginal_relevance_search(&self, query: &str, k: usize, fetch_k: usize, lambda: f32) -> Result<Vec<Document>> {
        let query_embedding = self.embedder.embed_query(query)?;
        let candidates = self.ranked(&query_embedding, fetch_k.max(k));
        let candidate_embeddings: Vec<&[f32]> = candidates
            .iter()
            .map(|&(i, _)| self.entries[i].embedding.as_slice())
            .collect();

        let picked = maximal_marginal_relevance(&query_embedding, &candidate_embeddings, lambda, k);
        debug!("MMR picked {} of {} candidates", picked.len(), candidates.len());

        Ok(picked
            .into_iter()
            .map(|c| self.entries[candidates[c].0].document.clone())
            .collect())
    }

    fn ranked(&self, query_embedding: &[f32], limit: usize) -> Vec<(usize, f32)> {
        let mut scored: Vec<(usize, f32)> = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, entry)| (i, cosine_similarity(query_embedding, &entry.embedding)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(limit);
        scored
    }
}

/// Indices into `embeddings` chosen by maximal marginal relevance, in pick order
pub fn maximal_marginal_relevance(query: &[f32], embeddings: &[&[f32]], lambda: f32, k: usize) -> Vec<usize> {
    let k = k.min(embeddings.len());
    if k == 0 {
        return Vec::new();
    }

    let to_query: Vec<f32> = embeddings.iter().map(|e| cosine_similarity(query, e)).collect();
    let first = to_query
        .iter()
        .enumerate()
        .fold(0, |best, (i, score)| if *score > to_query[best] { i } else { best });

    let mut picked = vec![first];
    // Highest similarity of each candidate to anything picked so far
    let mut redundancy: Vec<f32> = embeddings.iter().map(|e| cosine_similarity(e, embeddings[first])).collect();

    while picked.len() < k {
        let mut best: Option<(usize, f32)> = None;
        for (i, &relevance) in to_query.iter().enumerate() {
            if picked.contains(&i) {
                continue;
            }
            let score = lambda * relevance - (1.0 - lambda) * redundancy[i];
            if best.map_or(true, |(_, best_score)| score > best_score) {
                best = Some((i, score));
            }
        }
        let Some((next, _)) = best else { break };
        picked.push(next);
        for (i, e) in embeddings.iter().enumerate() {
            redundancy[i] = redundancy[i].max(cosine_similarity(e, embeddings[next]));
        }
    }
    picked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::embeddings::HashingEmbeddings;

    fn index(texts: &[&str]) -> VectorIndex {
        let docs = texts.iter().map(|t| Document::new(*t)).collect();
        VectorIndex::build(docs, Arc::new(HashingEmbeddings::default()), Path::new("/data")).unwrap()
    }

    #[test]
    fn test_similarity_search_ranks_relevant_first() {
        let index = index(&[
            "bananas are yellow fruit",
            "paris is the capital of france",
            "rust is a systems language",
        ]);
        let hits = index.similarity_search("what is the capital of france", 1).unwrap();
        assert_eq!(hits[0].0.content, "paris is the capital of france");
        assert_eq!(index.directory(), Path::new("/data"));
    }

    #[test]
    fn test_mmr_returns_at_most_k() {
        let index = index(&["a b", "c d", "e f"]);
        assert_eq!(index.max_marginal_relevance_search("a", 2, 20, 0.5).unwrap().len(), 2);
        assert_eq!(index.max_marginal_relevance_search("a", 10, 20, 0.5).unwrap().len(), 3);
    }

    #[test]
    fn test_mmr_prefers_diverse_second_pick() {
        let query = [1.0f32, 0.0];
        let near = [1.0f32, 0.0];
        let duplicate = [1.0f32, 0.0];
        let different = [0.6f32, 0.8];
        let embeddings: Vec<&[f32]> = vec![&near, &duplicate, &different];

        assert_eq!(maximal_marginal_relevance(&query, &embeddings, 0.3, 2), vec![0, 2]);
        assert_eq!(maximal_marginal_relevance(&query, &embeddings, 1.0, 2), vec![0, 1]);
    }

    #[test]
    fn test_mmr_empty_inputs() {
        assert!(maximal_marginal_relevance(&[1.0], &[], 0.5, 4).is_empty());
        let e = [1.0f32];
        assert!(maximal_marginal_relevance(&[1.0], &[&e], 0.5, 0).is_empty());
    }
}
