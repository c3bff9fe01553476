//! The text → vector capability behind the vector index.
//!
//! | `[embedding] provider` | Implementation                                                   |
//! |------------------------|------------------------------------------------------------------|
//! | `local`                | [`LocalEmbedder`]: fastembed ONNX model run in-process            |
//! | `ollama`               | [`OllamaEmbedder`]: `POST {url}/api/embed`                        |
//! | `disabled`             | [`DisabledEmbedder`]: every call fails                            |
//!
//! Vectors always come out unit-length (see [`normalize`]), so scores from
//! different providers are comparable.
//!
//! ```rust,no_run
//! # use letslearn::config::EmbeddingConfig;
//! # use letslearn::embedding::create_embedder;
//! let config = EmbeddingConfig {
//!     provider: "disabled".to_string(),
//!     ..EmbeddingConfig::default()
//! };
//! let embedder = create_embedder(&config).unwrap();
//! assert_eq!(embedder.dims(), 0);
//! ```

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::EmbeddingConfig;

/// Order-preserving batch embedding: vector `i` belongs to text `i`.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_name(&self) -> &str;
    fn dims(&self) -> usize;
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed one query string.
pub async fn embed_query(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>> {
    embedder
        .embed(&[text.to_string()])
        .await?
        .pop()
        .ok_or_else(|| anyhow!("embedder returned no vector for the query"))
}

/// Build the embedder named by `[embedding] provider`.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    let embedder: Arc<dyn Embedder> = match config.provider.as_str() {
        "disabled" => Arc::new(DisabledEmbedder),
        "ollama" => Arc::new(OllamaEmbedder::new(config)?),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Arc::new(LocalEmbedder::new(config)?),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("the local embedding provider needs the local-embeddings-fastembed feature"),
        other => bail!("Unknown embedding provider: {}", other),
    };
    info!(
        provider = %config.provider,
        model = embedder.model_name(),
        dims = embedder.dims(),
        "embedding provider ready"
    );
    Ok(embedder)
}

// ============ Disabled ============

/// Lets the service start without an embedding model. Cached material
/// stays readable; nothing new can be indexed.
pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }

    fn dims(&self) -> usize {
        0
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("Embedding provider is disabled; set [embedding] provider to local or ollama")
    }
}

// ============ Ollama ============

const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";
/// Longest pause between retries.
const MAX_BACKOFF_SECS: u64 = 30;

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Outcome of a failed request: worth another try or not.
enum Attempt {
    Retry(anyhow::Error),
    Fatal(anyhow::Error),
}

/// Embeddings from a running Ollama instance. Rate limiting, server errors
/// and connection failures are retried with doubling delays; other client
/// errors fail at once.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    dims: usize,
    max_retries: u32,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let base = config.url.as_deref().unwrap_or(OLLAMA_DEFAULT_URL);
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()?,
            endpoint: format!("{}/api/embed", base.trim_end_matches('/')),
            model: config.model.clone(),
            dims: model_dims(&config.model),
            max_retries: config.max_retries,
        })
    }

    async fn request_once(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, Attempt> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&EmbedRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await
            .map_err(|e| {
                Attempt::Retry(anyhow!(
                    "cannot reach Ollama at {} ({}); is it running?",
                    self.endpoint,
                    e
                ))
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            let err = anyhow!("Ollama embed failed with {}: {}", status, detail);
            return Err(if status.as_u16() == 429 || status.is_server_error() {
                Attempt::Retry(err)
            } else {
                Attempt::Fatal(err)
            });
        }

        let body: EmbedResponse = response
            .json()
            .await
            .context("unexpected Ollama embed response")
            .map_err(Attempt::Fatal)?;
        Ok(body.embeddings)
    }
}

fn backoff(retry: u32) -> Duration {
    Duration::from_secs((1u64 << retry.min(5)).min(MAX_BACKOFF_SECS))
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut retry = 0;
        loop {
            match self.request_once(texts).await {
                Ok(mut vectors) => {
                    if vectors.len() != texts.len() {
                        bail!(
                            "Ollama returned {} embeddings for {} texts",
                            vectors.len(),
                            texts.len()
                        );
                    }
                    vectors.iter_mut().for_each(|v| normalize(v));
                    return Ok(vectors);
                }
                Err(Attempt::Fatal(e)) => return Err(e),
                Err(Attempt::Retry(e)) if retry >= self.max_retries => return Err(e),
                Err(Attempt::Retry(e)) => {
                    let delay = backoff(retry);
                    warn!(error = %e, retry = retry + 1, ?delay, "Ollama embed failed; retrying");
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
            }
        }
    }
}

// ============ Local (fastembed) ============

/// A fastembed model loaded once and shared. Inference runs on the
/// blocking pool.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalEmbedder {
    name: String,
    dims: usize,
    batch_size: usize,
    model: Arc<std::sync::Mutex<fastembed::TextEmbedding>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let Some(kind) = fastembed_model(&config.model) else {
            bail!(
                "Unknown local embedding model '{}'; choose one of: {}",
                config.model,
                LOCAL_MODELS.join(", ")
            );
        };
        info!(model = %config.model, "loading local embedding model");
        let model = fastembed::TextEmbedding::try_new(
            fastembed::InitOptions::new(kind).with_show_download_progress(true),
        )
        .map_err(|e| anyhow!("failed to load embedding model {}: {}", config.model, e))?;

        Ok(Self {
            name: config.model.clone(),
            dims: model_dims(&config.model),
            batch_size: config.batch_size,
            model: Arc::new(std::sync::Mutex::new(model)),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl Embedder for LocalEmbedder {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model = Arc::clone(&self.model);
        let batch = texts.to_vec();
        let batch_size = self.batch_size;
        tracing::debug!(texts = batch.len(), "running local embedding model");

        tokio::task::spawn_blocking(move || -> Result<Vec<Vec<f32>>> {
            let mut model = model
                .lock()
                .map_err(|_| anyhow!("embedding model lock poisoned"))?;
            let mut vectors = model
                .embed(batch, Some(batch_size))
                .map_err(|e| anyhow!("local embedding failed: {}", e))?;
            vectors.iter_mut().for_each(|v| normalize(v));
            Ok(vectors)
        })
        .await?
    }
}

/// Model names accepted by the local provider.
#[cfg(feature = "local-embeddings-fastembed")]
const LOCAL_MODELS: &[&str] = &[
    "all-minilm-l6-v2",
    "bge-small-en-v1.5",
    "bge-base-en-v1.5",
    "bge-large-en-v1.5",
    "nomic-embed-text-v1.5",
    "multilingual-e5-small",
];

#[cfg(feature = "local-embeddings-fastembed")]
fn fastembed_model(name: &str) -> Option<fastembed::EmbeddingModel> {
    use fastembed::EmbeddingModel as M;
    Some(match name {
        "all-minilm-l6-v2" => M::AllMiniLML6V2,
        "bge-small-en-v1.5" => M::BGESmallENV15,
        "bge-base-en-v1.5" => M::BGEBaseENV15,
        "bge-large-en-v1.5" => M::BGELargeENV15,
        "nomic-embed-text-v1.5" => M::NomicEmbedTextV15,
        "multilingual-e5-small" => M::MultilingualE5Small,
        _ => return None,
    })
}

/// Output width of well-known models; 384 when unknown.
fn model_dims(model: &str) -> usize {
    match model {
        "bge-base-en-v1.5" | "nomic-embed-text" | "nomic-embed-text-v1.5" => 768,
        "bge-large-en-v1.5" | "mxbai-embed-large" => 1024,
        _ => 384,
    }
}

// ============ Vector math ============

/// Scale `v` to unit length in place. Zero vectors are left as they are.
pub fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}

/// Cosine of the angle between `a` and `b`, in `[-1, 1]`. Mismatched or
/// empty inputs and zero vectors score `0.0`.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let (dot, aa, bb) = a
        .iter()
        .zip(b)
        .fold((0.0f32, 0.0f32, 0.0f32), |(dot, aa, bb), (x, y)| {
            (dot + x * y, aa + x * x, bb + y * y)
        });
    let denom = (aa * bb).sqrt();
    if denom < f32::EPSILON {
        0.0
    } else {
        dot / denom
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_scales_to_unit_length() {
        let mut v = vec![3.0f32, 4.0];
        normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        let mut zero = vec![0.0f32; 3];
        normalize(&mut zero);
        assert_eq!(zero, vec![0.0; 3]);
    }

    #[test]
    fn cosine_scores() {
        let v = [0.5f32, 1.0, -2.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 3.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-2.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        assert_eq!(backoff(0), Duration::from_secs(1));
        assert_eq!(backoff(3), Duration::from_secs(8));
        assert_eq!(backoff(5), Duration::from_secs(30));
        assert_eq!(backoff(12), Duration::from_secs(30));
    }

    #[test]
    fn ollama_response_shape() {
        let body: EmbedResponse =
            serde_json::from_str(r#"{"model": "m", "embeddings": [[1.0, 0.0], [0.0, 2.0]]}"#)
                .unwrap();
        assert_eq!(body.embeddings, vec![vec![1.0, 0.0], vec![0.0, 2.0]]);
        assert!(serde_json::from_str::<EmbedResponse>(r#"{"error": "model not found"}"#).is_err());
    }

    #[test]
    fn unknown_models_default_to_384_dims() {
        assert_eq!(model_dims("bge-large-en-v1.5"), 1024);
        assert_eq!(model_dims("something-new"), 384);
    }

    #[tokio::test]
    async fn disabled_embedder_refuses() {
        let err = DisabledEmbedder.embed(&["x".to_string()]).await.unwrap_err();
        assert!(err.to_string().contains("disabled"));
        let err = embed_query(&DisabledEmbedder, "q").await.unwrap_err();
        assert!(err.to_string().contains("disabled"));
    }
}
