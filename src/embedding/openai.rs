//! OpenAI-compatible embedding backend (feature `openai`)
//!
//! Works with OpenAI, OpenRouter, Azure OpenAI, and other compatible APIs.
//! 429 and 5xx responses map to retryable provider errors; other 4xx
//! responses are content errors and are not retried.

use async_trait::async_trait;
use serde::Deserialize;

use super::EmbeddingProvider;
use crate::error::{Result, SpotterError};

/// OpenAI-compatible embedding client
pub struct OpenAIEmbedder {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    dimensions: usize,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

impl OpenAIEmbedder {
    /// Create a new embedder with default settings (text-embedding-3-small)
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "text-embedding-3-small".to_string(),
            dimensions: 1536,
        }
    }

    /// Create a new embedder with custom endpoint/model settings
    pub fn with_config(
        api_key: String,
        base_url: Option<String>,
        model: Option<String>,
        dimensions: Option<usize>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            model: model.unwrap_or_else(|| "text-embedding-3-small".to_string()),
            dimensions: dimensions.unwrap_or(1536),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/embeddings", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&serde_json::json!({
                "input": texts,
                "model": self.model,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let retryable = status.as_u16() == 429 || status.is_server_error();
            return Err(SpotterError::Provider {
                message: format!("embedding API error {}: {}", status, body),
                retryable,
            });
        }

        let parsed: EmbeddingResponse = response.json().await?;
        if parsed.data.len() != texts.len() {
            return Err(SpotterError::Provider {
                message: format!(
                    "embedding API returned {} vectors for {} inputs",
                    parsed.data.len(),
                    texts.len()
                ),
                retryable: false,
            });
        }

        let mut vectors = Vec::with_capacity(parsed.data.len());
        for datum in parsed.data {
            if datum.embedding.len() != self.dimensions {
                return Err(SpotterError::Provider {
                    message: format!(
                        "embedding dimensions mismatch: expected {}, got {}",
                        self.dimensions,
                        datum.embedding.len()
                    ),
                    retryable: false,
                });
            }
            vectors.push(datum.embedding);
        }

        Ok(vectors)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}
