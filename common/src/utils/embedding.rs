use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    sync::Arc,
};

use anyhow::{Context, Result};
use async_openai::{types::CreateEmbeddingRequestArgs, Client};
use tracing::debug;

use crate::{
    error::AppError,
    utils::{
        config::{AppConfig, EmbeddingBackend},
        token_estimate::{HeuristicEstimator, TokenEstimate},
    },
};

#[derive(Clone)]
pub struct EmbeddingProvider {
    inner: EmbeddingInner,
}

#[derive(Clone)]
enum EmbeddingInner {
    OpenAI {
        client: Arc<Client<async_openai::config::OpenAIConfig>>,
        model: String,
        dimensions: u32,
    },
    Hashed {
        dimension: usize,
    },
}

impl EmbeddingProvider {
    pub fn backend_label(&self) -> &'static str {
        match self.inner {
            EmbeddingInner::Hashed { .. } => "hashed",
            EmbeddingInner::OpenAI { .. } => "openai",
        }
    }

    pub fn dimension(&self) -> usize {
        match &self.inner {
            EmbeddingInner::Hashed { dimension } => *dimension,
            EmbeddingInner::OpenAI { dimensions, .. } => *dimensions as usize,
        }
    }

    pub fn from_config(
        config: &AppConfig,
        openai_client: Option<Arc<Client<async_openai::config::OpenAIConfig>>>,
    ) -> Result<Self, AppError> {
        match config.embedding_backend {
            EmbeddingBackend::Hashed => {
                Self::new_hashed(config.embedding_dimensions as usize).map_err(AppError::from)
            }
            EmbeddingBackend::OpenAI => {
                if config.openai_api_key.is_empty() {
                    return Err(AppError::Configuration(
                        "openai_api_key is required for the openai embedding backend".into(),
                    ));
                }
                let client = openai_client.ok_or_else(|| {
                    AppError::Configuration(
                        "an OpenAI client must be supplied for the openai embedding backend".into(),
                    )
                })?;
                Ok(EmbeddingProvider {
                    inner: EmbeddingInner::OpenAI {
                        client,
                        model: config.embedding_model.clone(),
                        dimensions: config.embedding_dimensions,
                    },
                })
            }
        }
    }

    pub fn new_openai(
        client: Arc<Client<async_openai::config::OpenAIConfig>>,
        model: String,
        dimensions: u32,
    ) -> Self {
        EmbeddingProvider {
            inner: EmbeddingInner::OpenAI {
                client,
                model,
                dimensions,
            },
        }
    }

    pub fn new_hashed(dimension: usize) -> Result<Self> {
        Ok(EmbeddingProvider {
            inner: EmbeddingInner::Hashed {
                dimension: dimension.max(1),
            },
        })
    }

    pub async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        match &self.inner {
            EmbeddingInner::Hashed { dimension } => Ok(texts
                .into_iter()
                .map(|text| hashed_embedding(&text, *dimension))
                .collect()),
            EmbeddingInner::OpenAI {
                client,
                model,
                dimensions,
            } => {
                if texts.is_empty() {
                    return Ok(Vec::new());
                }

                let request = CreateEmbeddingRequestArgs::default()
                    .model(model.clone())
                    .input(texts)
                    .dimensions(*dimensions)
                    .build()?;

                let response = client.embeddings().create(request).await?;

                let embeddings: Vec<Vec<f32>> = response
                    .data
                    .into_iter()
                    .map(|item| item.embedding)
                    .collect();

                Ok(embeddings)
            }
        }
    }
}

/// Request-size limits enforced by the gateway before texts reach the
/// embedding provider.
#[derive(Debug, Clone, Copy)]
pub struct EmbeddingLimits {
    /// Estimated-token ceiling for a single item; longer texts are clamped.
    pub max_item_tokens: usize,
    /// Estimated-token ceiling for one batch request.
    pub max_batch_tokens: usize,
    /// Item-count ceiling for one batch request.
    pub max_batch_items: usize,
}

impl Default for EmbeddingLimits {
    fn default() -> Self {
        Self {
            max_item_tokens: 8_000,
            max_batch_tokens: 100_000,
            max_batch_items: 128,
        }
    }
}

/// Stateless front door for embedding calls: clamps oversized items and
/// packs texts into provider-sized batches. Output order always matches
/// input order across batch boundaries. Any batch failure fails the whole
/// call; callers must not assume partial results.
#[derive(Clone)]
pub struct EmbeddingGateway {
    provider: EmbeddingProvider,
    estimator: Arc<dyn TokenEstimate>,
    limits: EmbeddingLimits,
}

impl EmbeddingGateway {
    pub fn new(provider: EmbeddingProvider, estimator: Arc<dyn TokenEstimate>) -> Self {
        Self {
            provider,
            estimator,
            limits: EmbeddingLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: EmbeddingLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn dimension(&self) -> usize {
        self.provider.dimension()
    }

    pub async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let clamped: Vec<String> = texts.iter().map(|text| self.clamp_text(text)).collect();

        let mut vectors = Vec::with_capacity(clamped.len());
        for batch in self.plan_batches(&clamped) {
            let batch_vectors = self
                .provider
                .embed_batch(clamped[batch.clone()].to_vec())
                .await
                .map_err(|err| AppError::RetrievalUnavailable(err.to_string()))?;

            if batch_vectors.len() != batch.len() {
                return Err(AppError::RetrievalUnavailable(format!(
                    "embedding provider returned {} vectors for {} inputs",
                    batch_vectors.len(),
                    batch.len()
                )));
            }
            vectors.extend(batch_vectors);
        }

        debug!(
            inputs = texts.len(),
            backend = self.provider.backend_label(),
            "embedded texts"
        );
        Ok(vectors)
    }

    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>, AppError> {
        let texts = vec![text.to_string()];
        let mut vectors = self.embed_texts(&texts).await?;
        vectors
            .pop()
            .ok_or_else(|| AppError::RetrievalUnavailable("no embedding returned".into()))
    }

    /// Truncates `text` until its estimated token count fits the per-item
    /// ceiling, preferring a trailing whitespace boundary. Never returns an
    /// empty string for non-empty input.
    fn clamp_text(&self, text: &str) -> String {
        let ceiling = self.limits.max_item_tokens;
        let mut current = text.to_string();

        loop {
            let estimate = self.estimator.estimate(&current);
            if estimate <= ceiling || current.is_empty() {
                return current;
            }

            let budget = (current.len() * ceiling / estimate).min(current.len() - 1).max(1);
            let cut = floor_char_boundary(&current, budget);
            let truncated = &current[..cut.max(1).min(current.len())];

            let trimmed = match truncated.rfind(char::is_whitespace) {
                Some(idx) if idx > 0 => truncated[..idx].trim_end(),
                _ => truncated,
            };

            current = if trimmed.is_empty() {
                truncated.to_string()
            } else {
                trimmed.to_string()
            };
        }
    }

    /// Greedy batch planning over already-clamped items. A single item whose
    /// estimate alone exceeds the batch token ceiling still gets its own
    /// batch rather than blocking progress.
    fn plan_batches(&self, texts: &[String]) -> Vec<std::ops::Range<usize>> {
        let mut batches = Vec::new();
        let mut start = 0usize;
        let mut batch_tokens = 0usize;

        for (idx, text) in texts.iter().enumerate() {
            let tokens = self.estimator.estimate(text);
            let count = idx - start;

            let over_items = count >= self.limits.max_batch_items;
            let over_tokens = count > 0 && batch_tokens + tokens > self.limits.max_batch_tokens;

            if over_items || over_tokens {
                batches.push(start..idx);
                start = idx;
                batch_tokens = 0;
            }
            batch_tokens += tokens;
        }

        if start < texts.len() {
            batches.push(start..texts.len());
        }
        batches
    }
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    index = index.min(text.len());
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

// Helper functions for hashed embeddings
fn hashed_embedding(text: &str, dimension: usize) -> Vec<f32> {
    let dim = dimension.max(1);
    let mut vector = vec![0.0f32; dim];
    if text.is_empty() {
        return vector;
    }

    let mut token_count = 0f32;
    for token in tokens(text) {
        token_count += 1.0;
        let idx = bucket(&token, dim);
        vector[idx] += 1.0;
    }

    if token_count == 0.0 {
        return vector;
    }

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut vector {
            *value /= norm;
        }
    }

    vector
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| token.to_ascii_lowercase())
}

fn bucket(token: &str, dimension: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    token.hash(&mut hasher);
    (hasher.finish() as usize) % dimension
}

/// Convenience used by tests and the reconciler: a deterministic gateway
/// with the heuristic estimator.
pub fn hashed_gateway(dimension: usize) -> Result<EmbeddingGateway> {
    let provider = EmbeddingProvider::new_hashed(dimension)
        .context("creating hashed embedding provider")?;
    Ok(EmbeddingGateway::new(provider, Arc::new(HeuristicEstimator)))
}
