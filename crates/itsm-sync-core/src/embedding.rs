//! Embedder trait and vector utilities.
//!
//! Defines the [`Embedder`] trait that embedding backends implement, the
//! [`embed_chunks`] helper the pipeline calls, and the BLOB encoding used by
//! SQL-backed index stores.
//!
//! Concrete HTTP providers live in the `itsm-sync` app crate.

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::models::{EmbeddedChunk, TextChunk};

/// An embedding backend.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the model identifier (e.g. `"nomic-embed-text"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality.
    fn dims(&self) -> usize;
    /// Embed a batch of texts, returning one vector per input in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed chunks in batches of `batch_size` and pair each chunk with its
/// vector.
///
/// Fails if the embedder returns a different number of vectors than texts
/// sent, or a vector whose length differs from [`Embedder::dims`].
pub async fn embed_chunks(
    embedder: &dyn Embedder,
    chunks: Vec<TextChunk>,
    batch_size: usize,
) -> Result<Vec<EmbeddedChunk>> {
    let batch_size = batch_size.max(1);
    let mut embedded = Vec::with_capacity(chunks.len());
    let mut pending = chunks.into_iter().peekable();

    while pending.peek().is_some() {
        let batch: Vec<TextChunk> = pending.by_ref().take(batch_size).collect();
        let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();
        let vectors = embedder.embed(&texts).await?;

        if vectors.len() != batch.len() {
            bail!(
                "embedder returned {} vectors for {} chunks",
                vectors.len(),
                batch.len()
            );
        }

        for (chunk, vector) in batch.into_iter().zip(vectors) {
            if embedder.dims() > 0 && vector.len() != embedder.dims() {
                bail!(
                    "embedding for chunk {} has {} dims, expected {}",
                    chunk.chunk_id,
                    vector.len(),
                    embedder.dims()
                );
            }
            embedded.push(EmbeddedChunk {
                chunk,
                vector,
                model: embedder.model_name().to_string(),
            });
        }
    }

    Ok(embedded)
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// # Example
///
/// ```rust
/// use itsm_sync_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::models::{Category, ChunkType};

    struct CountingEmbedder {
        calls: AtomicUsize,
        dims: usize,
        short_by: usize,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        fn model_name(&self) -> &str {
            "counting"
        }
        fn dims(&self) -> usize {
            self.dims
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let n = texts.len().saturating_sub(self.short_by);
            Ok(texts
                .iter()
                .take(n)
                .map(|t| vec![t.len() as f32; self.dims])
                .collect())
        }
    }

    fn chunks(n: usize) -> Vec<TextChunk> {
        (0..n)
            .map(|i| TextChunk {
                chunk_id: format!("c{}", i),
                category: Category::Incident,
                source_id: "INC1".to_string(),
                chunk_type: ChunkType::Description,
                sequence: i as i64,
                content: "x".repeat(i + 1),
                hash: String::new(),
                metadata: BTreeMap::new(),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_embed_chunks_batches_in_order() {
        let embedder = CountingEmbedder {
            calls: AtomicUsize::new(0),
            dims: 2,
            short_by: 0,
        };
        let out = embed_chunks(&embedder, chunks(5), 2).await.unwrap();
        assert_eq!(out.len(), 5);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);
        for (i, e) in out.iter().enumerate() {
            assert_eq!(e.chunk.sequence, i as i64);
            assert_eq!(e.vector, vec![(i + 1) as f32; 2]);
            assert_eq!(e.model, "counting");
        }
    }

    #[tokio::test]
    async fn test_embed_chunks_count_mismatch_fails() {
        let embedder = CountingEmbedder {
            calls: AtomicUsize::new(0),
            dims: 2,
            short_by: 1,
        };
        let err = embed_chunks(&embedder, chunks(3), 8).await.unwrap_err();
        assert!(err.to_string().contains("2 vectors for 3 chunks"));
    }

    #[tokio::test]
    async fn test_embed_chunks_empty_makes_no_calls() {
        let embedder = CountingEmbedder {
            calls: AtomicUsize::new(0),
            dims: 2,
            short_by: 0,
        };
        let out = embed_chunks(&embedder, Vec::new(), 8).await.unwrap();
        assert!(out.is_empty());
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }
}
