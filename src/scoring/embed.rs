//! Embedding cosine similarity via an OpenAI-compatible embeddings endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{ScoringError, SimilarityScore, SimilarityScorer};

pub const COSINE_SIMILARITY: &str = "cosine_similarity";

/// Scores a pair by embedding both texts in one request.
pub struct EmbeddingScorer {
    client: Client,
    url: String,
    api_key: Option<String>,
    model: String,
}

impl EmbeddingScorer {
    /// Every request is bounded by `timeout`.
    pub fn new(url: String, api_key: Option<String>, model: String, timeout: Duration) -> Self {
        let client = Client::builder().timeout(timeout).build().unwrap_or_else(|e| {
            tracing::warn!("Falling back to default HTTP client: {}", e);
            Client::new()
        });
        Self {
            client,
            url,
            api_key,
            model,
        }
    }

    /// Generate embeddings for multiple texts, in input order.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ScoringError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };

        let mut builder = self.client.post(&self.url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let resp = builder
            .send()
            .await
            .map_err(|e| ScoringError::Embedding(e.to_string()))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| ScoringError::Embedding(e.to_string()))?;

        if !status.is_success() {
            tracing::error!("Embedding API error: {} - {}", status, text);
            return Err(ScoringError::Embedding(format!("{} - {}", status, text)));
        }

        let response: EmbeddingResponse = serde_json::from_str(&text).map_err(|e| {
            ScoringError::Embedding(format!("Failed to parse embedding response: {} - {}", e, text))
        })?;

        // Sort by index and extract embeddings
        let mut data = response.data;
        data.sort_by_key(|d| d.index);
        let embeddings: Vec<Vec<f32>> = data.into_iter().map(|d| d.embedding).collect();

        if embeddings.len() != texts.len() {
            return Err(ScoringError::Embedding(format!(
                "Expected {} embeddings, got {}",
                texts.len(),
                embeddings.len()
            )));
        }
        Ok(embeddings)
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

/// Cosine of the angle between two vectors. Zero for empty, zero-norm or
/// mismatched inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0)
}

#[async_trait]
impl SimilarityScorer for EmbeddingScorer {
    fn metric_names(&self) -> Vec<String> {
        vec![COSINE_SIMILARITY.to_string()]
    }

    async fn score(&self, candidate: &str, reference: &str) -> Result<SimilarityScore, ScoringError> {
        let embeddings = self
            .embed_batch(&[candidate.to_string(), reference.to_string()])
            .await?;
        let value = cosine_similarity(&embeddings[0], &embeddings[1]);
        Ok(SimilarityScore::from_pairs([(COSINE_SIMILARITY, value)]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_parallel_vectors_is_one() {
        assert!((cosine_similarity(&[1.0, 2.0, 3.0], &[2.0, 4.0, 6.0]) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[test]
    fn cosine_handles_degenerate_input() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn response_is_reordered_by_index() {
        let raw = r#"{"data":[{"embedding":[0.0,1.0],"index":1},{"embedding":[1.0,0.0],"index":0}]}"#;
        let mut data = serde_json::from_str::<EmbeddingResponse>(raw).unwrap().data;
        data.sort_by_key(|d| d.index);
        assert_eq!(data[0].embedding, vec![1.0, 0.0]);
    }

    #[tokio::test]
    async fn stalled_endpoint_fails_within_timeout() {
        // Accepts connections and never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let scorer = EmbeddingScorer::new(
            format!("http://{addr}/v1/embeddings"),
            None,
            "test-model".to_string(),
            Duration::from_millis(300),
        );
        let outcome = tokio::time::timeout(Duration::from_secs(10), scorer.score("a", "b"))
            .await
            .expect("scorer gave up on its own");
        assert!(matches!(outcome, Err(ScoringError::Embedding(_))));
        server.abort();
    }
}
