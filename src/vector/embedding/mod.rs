
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::{Config, OllamaConfig};
use crate::{Result, StoreError};

const DEFAULT_TIMEOUT_SECONDS: u64 = 30;
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_DELAY_MS: u64 = 1000;
const EXPONENTIAL_BACKOFF_BASE: u32 = 2;

/// Text to vector, the only contract the pipeline needs from an embedding service
#[async_trait]
pub trait EmbeddingGenerator: Send + Sync {
    /// Identifier recorded in embedding metadata
    fn model_id(&self) -> &str;

    /// Texts per `embed_batch` call
    fn batch_size(&self) -> usize {
        1
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Sequential by default; services with native batching override this
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text).await?);
        }
        Ok(vectors)
    }
}

/// Builds the generator named by `vector_index.embedding_service`
#[inline]
pub fn create_embedding_generator(config: &Config) -> Result<Arc<dyn EmbeddingGenerator>> {
    match config.vector_index.embedding_service.trim() {
        "ollama" => Ok(Arc::new(OllamaEmbeddingGenerator::new(&config.ollama)?)),
        "mock" => Ok(Arc::new(MockEmbeddingGenerator::new(
            config.vector_index.expected_dimension as usize,
        ))),
        other => Err(StoreError::Configuration(format!(
            "unknown embedding service {:?} (expected ollama or mock)",
            other
        ))),
    }
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub size: Option<u64>,
    pub digest: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    models: Vec<ModelInfo>,
}

/// Ollama `/api/embed` client; blocking HTTP runs on the blocking pool
#[derive(Debug, Clone)]
pub struct OllamaEmbeddingGenerator {
    base_url: Url,
    model: String,
    batch_size: u32,
    agent: ureq::Agent,
    retry_attempts: u32,
    retry_delay: Duration,
}

impl OllamaEmbeddingGenerator {
    #[inline]
    pub fn new(config: &OllamaConfig) -> Result<Self> {
        config.validate()?;
        let base_url = config.ollama_url()?;

        Ok(Self {
            base_url,
            model: config.model.clone(),
            batch_size: config.batch_size.max(1),
            agent: Self::build_agent(Duration::from_secs(DEFAULT_TIMEOUT_SECONDS)),
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        })
    }

    fn build_agent(timeout: Duration) -> ureq::Agent {
        ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into()
    }

    #[inline]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.agent = Self::build_agent(timeout);
        self
    }

    #[inline]
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts.max(1);
        self
    }

    #[inline]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Server reachable and configured model pulled
    #[inline]
    pub async fn health_check(&self) -> Result<()> {
        let client = self.clone();
        run_blocking("health check", move || client.health_check_blocking()).await
    }

    #[inline]
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let client = self.clone();
        run_blocking("list models", move || client.list_models_blocking()).await
    }

    fn health_check_blocking(&self) -> Result<()> {
        debug!("Performing health check for Ollama at {}", self.base_url);

        let models = self.list_models_blocking()?;
        if !models.iter().any(|m| m.name == self.model) {
            let available: Vec<&str> = models.iter().map(|m| m.name.as_str()).collect();
            warn!(
                "Model {} not found. Available models: {:?}",
                self.model, available
            );
            return Err(StoreError::Configuration(format!(
                "embedding model '{}' is not available. Available models: {:?}",
                self.model, available
            )));
        }

        info!(
            "Health check passed for Ollama server at {} with model {}",
            self.base_url, self.model
        );
        Ok(())
    }

    fn list_models_blocking(&self) -> Result<Vec<ModelInfo>> {
        let url = self.endpoint("/api/tags")?;
        debug!("Fetching available models from {}", url);

        let response_text = self.make_request_with_retry(url.as_str(), || {
            self.agent
                .get(url.as_str())
                .call()
                .and_then(|mut resp| resp.body_mut().read_to_string())
        })?;

        let models: ModelsResponse = serde_json::from_str(&response_text).map_err(|e| {
            StoreError::corrupt("list models", url.as_str(), e.to_string())
        })?;
        debug!("Found {} models", models.models.len());
        Ok(models.models)
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).map_err(|e| {
            StoreError::Configuration(format!("invalid Ollama endpoint {}: {}", path, e))
        })
    }

    fn embed_blocking(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let url = self.endpoint("/api/embed")?;
        let mut vectors = Vec::with_capacity(texts.len());

        for chunk in texts.chunks(self.batch_size as usize) {
            let request_json = serde_json::to_string(&EmbedRequest {
                model: &self.model,
                input: chunk,
            })
            .map_err(|e| StoreError::validation("embed", url.as_str(), e.to_string()))?;

            let response_text = self.make_request_with_retry(url.as_str(), || {
                self.agent
                    .post(url.as_str())
                    .header("Content-Type", "application/json")
                    .send(&request_json)
                    .and_then(|mut resp| resp.body_mut().read_to_string())
            })?;

            let response: EmbedResponse = serde_json::from_str(&response_text)
                .map_err(|e| StoreError::corrupt("embed", url.as_str(), e.to_string()))?;

            if response.embeddings.len() != chunk.len() {
                return Err(StoreError::corrupt(
                    "embed",
                    url.as_str(),
                    format!(
                        "mismatch between request and response counts: {} vs {}",
                        chunk.len(),
                        response.embeddings.len()
                    ),
                ));
            }
            vectors.extend(response.embeddings);
        }

        debug!("Generated {} embeddings with {}", vectors.len(), self.model);
        Ok(vectors)
    }

    fn make_request_with_retry<F>(&self, target: &str, mut request_fn: F) -> Result<String>
    where
        F: FnMut() -> std::result::Result<String, ureq::Error>,
    {
        let mut last_error = None;

        for attempt in 1..=self.retry_attempts {
            debug!("HTTP request attempt {}/{}", attempt, self.retry_attempts);

            let error = match request_fn() {
                Ok(response_text) => return Ok(response_text),
                Err(error) => error,
            };

            match &error {
                ureq::Error::StatusCode(status) if *status >= 500 || *status == 429 => {
                    warn!(
                        "Server error (status {}), attempt {}/{}",
                        status, attempt, self.retry_attempts
                    );
                }
                ureq::Error::StatusCode(status) => {
                    warn!("Client error (status {}), not retrying", status);
                    return Err(StoreError::validation(
                        "embedding request",
                        target,
                        format!("HTTP {}", status),
                    ));
                }
                ureq::Error::ConnectionFailed
                | ureq::Error::HostNotFound
                | ureq::Error::Timeout(_)
                | ureq::Error::Io(_) => {
                    warn!(
                        "Transport error: {}, attempt {}/{}",
                        error, attempt, self.retry_attempts
                    );
                }
                _ => {
                    warn!("Non-retryable error: {}", error);
                    return Err(StoreError::Other(anyhow::anyhow!(
                        "embedding request to {} failed: {}",
                        target,
                        error
                    )));
                }
            }

            last_error = Some(error.to_string());

            if attempt < self.retry_attempts {
                let delay = self.retry_delay * EXPONENTIAL_BACKOFF_BASE.pow(attempt - 1);
                debug!("Waiting {:?} before retry", delay);
                std::thread::sleep(delay);
            }
        }

        error!("All retry attempts failed for request to {}", target);
        Err(StoreError::transient(
            "embedding request",
            target,
            last_error.unwrap_or_else(|| "request failed after retries".to_string()),
        ))
    }
}

async fn run_blocking<T, F>(operation: &str, job: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(job).await.map_err(|e| {
        StoreError::Other(anyhow::anyhow!("{} task failed to complete: {}", operation, e))
    })?
}

#[async_trait]
impl EmbeddingGenerator for OllamaEmbeddingGenerator {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn batch_size(&self) -> usize {
        self.batch_size as usize
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors.pop().ok_or_else(|| {
            StoreError::corrupt("embed", self.base_url.as_str(), "empty embedding response")
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let client = self.clone();
        let texts = texts.to_vec();
        run_blocking("embed", move || client.embed_blocking(&texts)).await
    }
}

/// Deterministic unit vectors derived from the text bytes
#[derive(Debug)]
pub struct MockEmbeddingGenerator {
    dimension: usize,
    model_id: String,
    batch_size: usize,
    calls: AtomicUsize,
    batches: AtomicUsize,
}

impl MockEmbeddingGenerator {
    #[inline]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            model_id: format!("mock-{}", dimension),
            batch_size: 1,
            calls: AtomicUsize::new(0),
            batches: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Number of `embed_batch` calls so far
    #[inline]
    pub fn batches(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    /// Number of texts embedded so far
    #[inline]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        let bytes = text.as_bytes();
        let mut vector: Vec<f32> = (0..self.dimension)
            .map(|i| {
                let byte = if bytes.is_empty() {
                    0
                } else {
                    bytes[i % bytes.len()]
                };
                ((f32::from(byte) + i as f32) % 256.0) / 256.0
            })
            .collect();

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingGenerator for MockEmbeddingGenerator {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.vector_for(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.batches.fetch_add(1, Ordering::SeqCst);
        self.calls.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|text| self.vector_for(text)).collect())
    }
}
