//! Offline feature-hashing embeddings.
//!
//! Each token is hashed with SHA-256 into one of `dims` buckets with a
//! sign taken from the hash, and the resulting bag-of-words vector is
//! L2-normalised. Similar wording gives similar vectors, with no model and
//! no network. Good enough for tests, demos and small schemas whose
//! descriptions share vocabulary with the questions asked.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use schema_linker_core::embedding::EmbeddingProvider;
use schema_linker_core::Result;

pub const DEFAULT_DIMS: usize = 256;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "is", "it", "of", "on",
    "or", "per", "the", "to", "was", "what", "which", "with",
];

pub struct HashingProvider {
    model: String,
    dims: usize,
}

impl HashingProvider {
    pub fn new(dims: usize) -> Self {
        Self {
            model: format!("hashing-{dims}"),
            dims,
        }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for token in tokenize(text) {
            let digest = Sha256::digest(token.as_bytes());
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&digest[..8]);
            let i = (u64::from_le_bytes(bucket) % self.dims as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[i] += sign;
        }

        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

/// Lowercase words with identifiers split on `_` and a plural `s` dropped.
fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| s.len() > 1 && !STOPWORDS.contains(s))
        .map(|s| match s.strip_suffix('s') {
            Some(stem) if s.len() > 3 && !s.ends_with("ss") => stem.to_string(),
            _ => s.to_string(),
        })
        .collect()
}

#[async_trait]
impl EmbeddingProvider for HashingProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}
