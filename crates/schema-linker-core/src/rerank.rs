//! Second-stage reranking of retrieved tables and columns.
//!
//! A [`Reranker`] sees the user query together with each candidate's text
//! and returns the candidates reordered by its own relevance score. The
//! filter uses it to refine the similarity ordering of a widened candidate
//! pool before truncating to the caller's top-K.
//!
//! Cross-encoder style backends live in the app crate. This module holds
//! the trait, score normalisation, and [`FallbackReranker`], which consults
//! a secondary reranker only when the primary is not confident.

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

/// A retrieved element offered to a reranker.
#[derive(Debug, Clone, PartialEq)]
pub struct RerankCandidate {
    pub table: String,
    /// `None` for table candidates.
    pub column: Option<String>,
    /// The element's embedding text.
    pub text: String,
    /// First-stage cosine similarity.
    pub similarity: f32,
}

/// A candidate with its rerank scores.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedCandidate {
    pub candidate: RerankCandidate,
    /// Min-max normalised within one call; orders the candidates.
    pub score: f32,
    /// Absolute relevance in `[0, 1]`, comparable across calls.
    pub confidence: f32,
}

#[async_trait]
pub trait Reranker: Send + Sync {
    fn name(&self) -> &str;

    /// Score `candidates` against `query` and return at most `top_k` of
    /// them, best first.
    async fn rerank(
        &self,
        query: &str,
        candidates: Vec<RerankCandidate>,
        top_k: usize,
    ) -> Result<Vec<RankedCandidate>>;
}

/// Map raw scores onto an absolute `[0, 1]` confidence.
///
/// Scores that all lie in `[0, 1]` are already probabilities (TEI applies a
/// sigmoid by default) and are kept. Otherwise every score is a logit.
pub fn confidences(raw_scores: &[f32]) -> Vec<f32> {
    let probabilities = raw_scores.iter().all(|s| (0.0..=1.0).contains(s));
    raw_scores
        .iter()
        .map(|&s| if probabilities { s } else { 1.0 / (1.0 + (-s).exp()) })
        .collect()
}

/// Attach raw scores to candidates, min-max normalise, sort and truncate.
///
/// When every score is equal, all candidates get `1.0` and keep their
/// incoming order. `raw_scores` must be parallel to `candidates`; missing
/// scores count as the minimum. [`RankedCandidate::confidence`] comes from
/// [`confidences`], so it is not flattened by the normalisation.
pub fn rank_by_scores(
    candidates: Vec<RerankCandidate>,
    raw_scores: &[f32],
    top_k: usize,
) -> Vec<RankedCandidate> {
    let min = raw_scores.iter().copied().fold(f32::INFINITY, f32::min);
    let max = raw_scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let spread = max - min;
    let confidence = confidences(raw_scores);

    let mut ranked: Vec<RankedCandidate> = candidates
        .into_iter()
        .enumerate()
        .map(|(i, candidate)| {
            let score = match raw_scores.get(i) {
                Some(raw) if spread > f32::EPSILON => (raw - min) / spread,
                Some(_) => 1.0,
                None => 0.0,
            };
            RankedCandidate {
                candidate,
                score,
                confidence: confidence.get(i).copied().unwrap_or(0.0),
            }
        })
        .collect();

    // Stable sort keeps first-stage order among equal scores.
    ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    ranked.truncate(top_k);
    ranked
}

/// Primary reranker with a low-confidence fallback.
///
/// The secondary is consulted only when the primary's best
/// [`confidence`](RankedCandidate::confidence) is below `threshold`. If the
/// secondary fails, the primary's result is kept.
pub struct FallbackReranker {
    primary: Arc<dyn Reranker>,
    secondary: Arc<dyn Reranker>,
    threshold: f32,
    name: String,
}

impl FallbackReranker {
    pub fn new(primary: Arc<dyn Reranker>, secondary: Arc<dyn Reranker>, threshold: f32) -> Self {
        let name = format!("{}+{}", primary.name(), secondary.name());
        Self {
            primary,
            secondary,
            threshold,
            name,
        }
    }
}

#[async_trait]
impl Reranker for FallbackReranker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn rerank(
        &self,
        query: &str,
        candidates: Vec<RerankCandidate>,
        top_k: usize,
    ) -> Result<Vec<RankedCandidate>> {
        let primary = self
            .primary
            .rerank(query, candidates.clone(), top_k)
            .await?;
        let best = primary.iter().map(|r| r.confidence).fold(0.0, f32::max);
        if primary.is_empty() || best >= self.threshold {
            return Ok(primary);
        }

        tracing::debug!(
            reranker = self.secondary.name(),
            best_confidence = best,
            "primary reranker below confidence threshold, consulting fallback"
        );
        match self.secondary.rerank(query, candidates, top_k).await {
            Ok(ranked) => Ok(ranked),
            Err(e) => {
                tracing::warn!(error = %e, "fallback reranker failed, keeping primary ranking");
                Ok(primary)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::LinkError;

    /// Scores candidates by a fixed table of (text substring → score).
    pub(crate) struct FixedReranker {
        pub name: &'static str,
        pub scores: Vec<(&'static str, f32)>,
        pub fail: bool,
    }

    #[async_trait]
    impl Reranker for FixedReranker {
        fn name(&self) -> &str {
            self.name
        }

        async fn rerank(
            &self,
            _query: &str,
            candidates: Vec<RerankCandidate>,
            top_k: usize,
        ) -> Result<Vec<RankedCandidate>> {
            if self.fail {
                return Err(LinkError::transient("backend down"));
            }
            let raw: Vec<f32> = candidates
                .iter()
                .map(|c| {
                    self.scores
                        .iter()
                        .find(|(needle, _)| c.text.contains(needle))
                        .map(|(_, s)| *s)
                        .unwrap_or(0.0)
                })
                .collect();
            Ok(rank_by_scores(candidates, &raw, top_k))
        }
    }

    fn candidate(text: &str) -> RerankCandidate {
        RerankCandidate {
            table: text.to_string(),
            column: None,
            text: text.to_string(),
            similarity: 0.5,
        }
    }

    #[test]
    fn test_rank_by_scores_normalises_and_sorts() {
        let ranked = rank_by_scores(
            vec![candidate("a"), candidate("b"), candidate("c")],
            &[-2.0, 6.0, 2.0],
            2,
        );
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].candidate.text, "b");
        assert!((ranked[0].score - 1.0).abs() < 1e-6);
        assert_eq!(ranked[1].candidate.text, "c");
        assert!((ranked[1].score - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_rank_by_scores_equal_scores_keep_order() {
        let ranked = rank_by_scores(vec![candidate("x"), candidate("y")], &[3.0, 3.0], 5);
        let texts: Vec<&str> = ranked.iter().map(|r| r.candidate.text.as_str()).collect();
        assert_eq!(texts, vec!["x", "y"]);
        assert!(ranked.iter().all(|r| r.score == 1.0));
    }

    #[tokio::test]
    async fn test_fallback_not_consulted_when_confident() {
        let primary = Arc::new(FixedReranker {
            name: "primary",
            scores: vec![("a", 5.0), ("b", 1.0)],
            fail: false,
        });
        let secondary = Arc::new(FixedReranker {
            name: "secondary",
            scores: vec![("b", 5.0)],
            fail: false,
        });
        let reranker = FallbackReranker::new(primary, secondary, 0.7);
        assert_eq!(reranker.name(), "primary+secondary");

        let ranked = reranker
            .rerank("q", vec![candidate("a"), candidate("b")], 2)
            .await
            .unwrap();
        assert_eq!(ranked[0].candidate.text, "a");
    }

    /// A primary that always scores 0 falls below any positive threshold.
    struct ZeroReranker;

    #[async_trait]
    impl Reranker for ZeroReranker {
        fn name(&self) -> &str {
            "zero"
        }

        async fn rerank(
            &self,
            _query: &str,
            candidates: Vec<RerankCandidate>,
            top_k: usize,
        ) -> Result<Vec<RankedCandidate>> {
            Ok(candidates
                .into_iter()
                .take(top_k)
                .map(|candidate| RankedCandidate {
                    candidate,
                    score: 0.0,
                    confidence: 0.0,
                })
                .collect())
        }
    }

    #[test]
    fn test_confidence_survives_normalisation() {
        let ranked = rank_by_scores(vec![candidate("a"), candidate("b")], &[0.01, 0.02], 2);
        assert!((ranked[0].score - 1.0).abs() < 1e-6);
        assert!((ranked[0].confidence - 0.02).abs() < 1e-6);

        let ranked = rank_by_scores(vec![candidate("a")], &[-9.0], 1);
        assert_eq!(ranked[0].score, 1.0);
        assert!(ranked[0].confidence < 0.001);

        let logits = confidences(&[0.0, 4.0]);
        assert!((logits[0] - 0.5).abs() < 1e-6);
        assert!(logits[1] > 0.98);
    }

    /// Counts calls to the wrapped reranker.
    struct Counting {
        inner: FixedReranker,
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl Reranker for Counting {
        fn name(&self) -> &str {
            self.inner.name
        }

        async fn rerank(
            &self,
            query: &str,
            candidates: Vec<RerankCandidate>,
            top_k: usize,
        ) -> Result<Vec<RankedCandidate>> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.inner.rerank(query, candidates, top_k).await
        }
    }

    #[tokio::test]
    async fn test_low_raw_scores_trigger_fallback() {
        let cases: [(&[&'static str], Vec<(&'static str, f32)>); 3] = [
            (&["a", "b"], vec![("a", -9.0), ("b", -9.5)]),
            (&["a"], vec![("a", -9.0)]),
            (&["a", "b"], vec![("a", 0.01), ("b", 0.02)]),
        ];
        for (texts, scores) in cases {
            let primary = Arc::new(FixedReranker {
                name: "primary",
                scores,
                fail: false,
            });
            let secondary = Arc::new(Counting {
                inner: FixedReranker {
                    name: "secondary",
                    scores: vec![("a", 0.9)],
                    fail: false,
                },
                calls: Default::default(),
            });
            let reranker = FallbackReranker::new(primary, secondary.clone(), 0.99);
            let candidates = texts.iter().map(|t| candidate(t)).collect();
            let ranked = reranker.rerank("q", candidates, 2).await.unwrap();

            assert_eq!(secondary.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
            assert_eq!(ranked[0].candidate.text, "a");
        }
    }

    #[tokio::test]
    async fn test_fallback_used_when_primary_unsure() {
        let secondary = Arc::new(FixedReranker {
            name: "secondary",
            scores: vec![("b", 5.0), ("a", 1.0)],
            fail: false,
        });
        let reranker = FallbackReranker::new(Arc::new(ZeroReranker), secondary, 0.7);
        let ranked = reranker
            .rerank("q", vec![candidate("a"), candidate("b")], 2)
            .await
            .unwrap();
        assert_eq!(ranked[0].candidate.text, "b");
    }

    #[tokio::test]
    async fn test_fallback_failure_keeps_primary() {
        let secondary = Arc::new(FixedReranker {
            name: "secondary",
            scores: vec![],
            fail: true,
        });
        let reranker = FallbackReranker::new(Arc::new(ZeroReranker), secondary, 0.7);
        let ranked = reranker
            .rerank("q", vec![candidate("a"), candidate("b")], 2)
            .await
            .unwrap();
        let texts: Vec<&str> = ranked.iter().map(|r| r.candidate.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "b"]);
    }
}
