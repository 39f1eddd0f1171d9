//! Embedding provider
//!
//! The prediction engine needs two things from an embedding model: encode
//! one text, and rebuild the per-type reference vectors from example texts.
//! [`HttpEmbeddingClient`] does both against an OpenAI-compatible
//! `POST {base_url}/embeddings` endpoint (OpenAI, Ollama, vLLM, ...).

use crate::prediction::cache::{CacheError, EmbeddingCache};
use crate::prediction::similarity::mean_vector;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use scanflow_common::config::EmbeddingConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

const USER_AGENT: &str = concat!("scanflow/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid document types file {path}: {reason}")]
    InvalidTypes { path: String, reason: String },

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Client configuration error: {0}")]
    Config(String),
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed one text
    async fn encode(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Rebuild reference vectors from `{type: [example texts]}` and persist them
    async fn regenerate_reference_vectors(
        &self,
        types_def_path: &Path,
    ) -> Result<EmbeddingCache, EmbeddingError>;
}

/// OpenAI-compatible embeddings client
pub struct HttpEmbeddingClient {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    max_retries: usize,
    cache_path: PathBuf,
}

impl HttpEmbeddingClient {
    /// `cache_path` is where regenerated reference vectors are written
    pub fn new(config: &EmbeddingConfig, cache_path: PathBuf) -> Result<Self, EmbeddingError> {
        if config.model.trim().is_empty() {
            return Err(EmbeddingError::Config("embedding model name is empty".to_string()));
        }

        let mut headers = HeaderMap::new();
        if let Some(key) = config.api_key() {
            let value = HeaderValue::from_str(&format!("Bearer {}", key.trim()))
                .map_err(|_| EmbeddingError::Config("invalid embedding API key".to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.timeout())
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            max_retries: config.max_retries.max(1),
            cache_path,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Embed a batch, returning vectors in input order
    pub async fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        let mut attempt = 0usize;
        loop {
            let request = EmbeddingRequest {
                model: &self.model,
                input: inputs,
            };
            match self.client.post(&self.endpoint).json(&request).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let mut parsed: EmbeddingResponse = response.json().await?;
                        parsed.data.sort_by_key(|entry| entry.index);
                        if parsed.data.len() != inputs.len() {
                            return Err(EmbeddingError::InvalidResponse(format!(
                                "{} embeddings returned for {} inputs",
                                parsed.data.len(),
                                inputs.len()
                            )));
                        }
                        return Ok(parsed.data.into_iter().map(|d| d.embedding).collect());
                    }

                    let body = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "<body unavailable>".to_string());
                    if should_retry(status) && attempt + 1 < self.max_retries {
                        attempt += 1;
                        warn!(status = status.as_u16(), attempt, "Embedding request failed, retrying");
                        tokio::time::sleep(retry_backoff(attempt)).await;
                        continue;
                    }
                    return Err(EmbeddingError::Api {
                        status: status.as_u16(),
                        body,
                    });
                }
                Err(err) => {
                    if (err.is_timeout() || err.is_connect()) && attempt + 1 < self.max_retries {
                        attempt += 1;
                        warn!(error = %err, attempt, "Embedding request failed, retrying");
                        tokio::time::sleep(retry_backoff(attempt)).await;
                        continue;
                    }
                    return Err(err.into());
                }
            }
        }
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingClient {
    async fn encode(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| EmbeddingError::InvalidResponse("no embedding returned".to_string()))
    }

    async fn regenerate_reference_vectors(
        &self,
        types_def_path: &Path,
    ) -> Result<EmbeddingCache, EmbeddingError> {
        let definitions = read_type_definitions(types_def_path).await?;
        info!(
            path = %types_def_path.display(),
            types = definitions.len(),
            "Regenerating reference vectors"
        );

        let mut cache = EmbeddingCache::new();
        for (label, examples) in definitions {
            if examples.is_empty() {
                debug!(label = %label, "No examples for document type");
                cache.insert(label, Vec::new());
                continue;
            }
            let vectors = self.embed_batch(&examples).await?;
            let mean = mean_vector(&vectors).ok_or_else(|| {
                EmbeddingError::InvalidResponse(format!(
                    "embeddings for '{}' have inconsistent dimensions",
                    label
                ))
            })?;
            cache.insert(label, mean);
        }

        cache.save(&self.cache_path).await?;
        info!(path = %self.cache_path.display(), labels = cache.len(), "Reference vectors saved");
        Ok(cache)
    }
}

/// Parse `{type: [example texts]}`, keeping file order
pub async fn read_type_definitions(path: &Path) -> Result<Vec<(String, Vec<String>)>, EmbeddingError> {
    let invalid = |reason: String| EmbeddingError::InvalidTypes {
        path: path.display().to_string(),
        reason,
    };

    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| invalid(e.to_string()))?;
    let object: Map<String, Value> =
        serde_json::from_str(&content).map_err(|e| invalid(e.to_string()))?;

    object
        .into_iter()
        .map(|(label, value)| {
            let examples: Vec<String> = serde_json::from_value(value)
                .map_err(|e| invalid(format!("examples for '{}': {}", label, e)))?;
            Ok((label, examples))
        })
        .collect()
}

fn should_retry(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn retry_backoff(attempt: usize) -> Duration {
    let capped = attempt.min(5) as u32;
    Duration::from_millis(250 * (1 << capped))
}

#[derive(Serialize)]
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
