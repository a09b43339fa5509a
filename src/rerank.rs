//! HTTP cross-encoder reranker.
//!
//! Speaks the text-embeddings-inference `/rerank` API:
//!
//! ```text
//! POST {url}/rerank
//! {"query": "...", "texts": ["...", "..."]}
//! → [{"index": 1, "score": 0.93}, {"index": 0, "score": 0.12}]
//! ```
//!
//! Raw scores are min-max normalised to `[0, 1]` before ranking.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use schema_linker_core::rerank::{rank_by_scores, FallbackReranker, RankedCandidate, RerankCandidate, Reranker};
use schema_linker_core::LinkError;

use crate::config::RerankerConfig;
use crate::embedding::post_json;

pub struct HttpReranker {
    name: String,
    url: String,
    model: Option<String>,
    client: reqwest::Client,
}

impl HttpReranker {
    pub fn new(url: &str, model: Option<String>, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            name: format!("http:{url}"),
            url: url.trim_end_matches('/').to_string(),
            model,
            client,
        })
    }
}

#[async_trait]
impl Reranker for HttpReranker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn rerank(
        &self,
        query: &str,
        candidates: Vec<RerankCandidate>,
        top_k: usize,
    ) -> schema_linker_core::Result<Vec<RankedCandidate>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let texts: Vec<&str> = candidates.iter().map(|c| c.text.as_str()).collect();
        let mut body = serde_json::json!({
            "query": query,
            "texts": texts,
        });
        if let Some(model) = &self.model {
            body["model"] = serde_json::Value::String(model.clone());
        }

        let request = self.client.post(format!("{}/rerank", self.url));
        let json = post_json("Reranker", request, &body).await?;
        let raw = parse_rerank_response(&json, candidates.len())?;
        Ok(rank_by_scores(candidates, &raw, top_k))
    }
}

/// Scores parallel to the request texts. Texts the server omitted get the
/// lowest returned score.
fn parse_rerank_response(json: &serde_json::Value, len: usize) -> schema_linker_core::Result<Vec<f32>> {
    let items = json
        .as_array()
        .ok_or_else(|| LinkError::fatal_provider("Invalid rerank response: expected an array"))?;

    let mut scores: Vec<Option<f32>> = vec![None; len];
    for item in items {
        let index = item.get("index").and_then(|i| i.as_u64()).map(|i| i as usize);
        let score = item.get("score").and_then(|s| s.as_f64()).map(|s| s as f32);
        match (index, score) {
            (Some(i), Some(s)) if i < len => scores[i] = Some(s),
            _ => {
                return Err(LinkError::fatal_provider(
                    "Invalid rerank response: entry without a valid index and score",
                ))
            }
        }
    }

    let floor = scores
        .iter()
        .flatten()
        .copied()
        .fold(f32::INFINITY, f32::min);
    let floor = if floor.is_finite() { floor } else { 0.0 };
    Ok(scores.into_iter().map(|s| s.unwrap_or(floor)).collect())
}

/// Build the configured reranker, or `None` when reranking is disabled.
pub fn create_reranker(config: &RerankerConfig) -> Result<Option<Arc<dyn Reranker>>> {
    if !config.enabled {
        return Ok(None);
    }
    let url = config
        .url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("reranker.url required when the reranker is enabled"))?;
    let primary: Arc<dyn Reranker> = Arc::new(HttpReranker::new(
        url,
        config.model.clone(),
        config.timeout_secs,
    )?);

    match &config.fallback_url {
        Some(fallback) => {
            let secondary = Arc::new(HttpReranker::new(fallback, None, config.timeout_secs)?);
            Ok(Some(Arc::new(FallbackReranker::new(
                primary,
                secondary,
                config.fallback_threshold,
            ))))
        }
        None => Ok(Some(primary)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rerank_response_reorders_by_index() {
        let json = serde_json::json!([
            {"index": 2, "score": 0.9},
            {"index": 0, "score": 0.1},
            {"index": 1, "score": 0.5}
        ]);
        assert_eq!(parse_rerank_response(&json, 3).unwrap(), vec![0.1, 0.5, 0.9]);
    }

    #[test]
    fn test_missing_entries_get_lowest_score() {
        let json = serde_json::json!([{"index": 1, "score": 2.0}, {"index": 2, "score": -1.0}]);
        assert_eq!(parse_rerank_response(&json, 3).unwrap(), vec![-1.0, 2.0, -1.0]);
    }

    #[test]
    fn test_out_of_range_index_is_rejected() {
        let json = serde_json::json!([{"index": 5, "score": 0.3}]);
        let err = parse_rerank_response(&json, 2).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_disabled_config_builds_nothing() {
        assert!(create_reranker(&RerankerConfig::default()).unwrap().is_none());
    }

    #[test]
    fn test_fallback_url_wraps_primary() {
        let config = RerankerConfig {
            enabled: true,
            url: Some("http://localhost:8080".into()),
            fallback_url: Some("http://localhost:8081/".into()),
            ..RerankerConfig::default()
        };
        let reranker = create_reranker(&config).unwrap().unwrap();
        assert_eq!(
            reranker.name(),
            "http:http://localhost:8080+http:http://localhost:8081/"
        );
    }
}
