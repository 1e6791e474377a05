use crate::errors::ProviderError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Health reported by `probe()`, consumed by the connectivity-diagnostics
/// operation (spec §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub reachable: bool,
    pub reported_dimension: Option<usize>,
    pub detail: Option<String>,
}

impl ProviderHealth {
    fn ok(dimension: usize) -> Self {
        Self {
            reachable: true,
            reported_dimension: Some(dimension),
            detail: None,
        }
    }

    fn unreachable(detail: impl Into<String>) -> Self {
        Self {
            reachable: false,
            reported_dimension: None,
            detail: Some(detail.into()),
        }
    }
}

/// A sealed, enum-dispatched embedding provider (spec §9: tagged enums with
/// pattern-matching dispatch rather than trait-object polymorphism).
///
/// All variants configured within a deployment must agree on `dimension`;
/// a mismatch is a fatal startup error (`DIMENSION_MISMATCH`), enforced by
/// the provider registry rather than by this type.
#[derive(Debug, Clone)]
pub enum Embedder {
    /// Deterministic, dependency-free. Poor retrieval quality; intended for
    /// bring-up and tests only, never production (spec §4.1).
    Hash { dimension: usize },
    /// An in-process model runtime. Modeled here as a named handle; the
    /// concrete runtime is out of scope (spec §1).
    LocalModel { model_name: String, dimension: usize },
    OpenAiCompatibleHttp {
        base_url: String,
        api_key: String,
        model: String,
        dimension: usize,
    },
}

impl Embedder {
    pub fn dimension(&self) -> usize {
        match self {
            Embedder::Hash { dimension } => *dimension,
            Embedder::LocalModel { dimension, .. } => *dimension,
            Embedder::OpenAiCompatibleHttp { dimension, .. } => *dimension,
        }
    }

    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        match self {
            Embedder::Hash { dimension } => Ok(texts
                .iter()
                .map(|text| deterministic_embedding(text, "hash", *dimension))
                .collect()),
            Embedder::LocalModel { dimension, .. } => {
                // No in-process model runtime ships with this crate (out of
                // scope per spec §1); fall back to the same deterministic
                // projection so the path is still exercisable end to end.
                Ok(texts
                    .iter()
                    .map(|text| deterministic_embedding(text, "local-model", *dimension))
                    .collect())
            }
            Embedder::OpenAiCompatibleHttp {
                base_url,
                api_key,
                model,
                dimension,
            } => embed_via_http(base_url, api_key, model, *dimension, texts).await,
        }
    }

    pub async fn probe(&self) -> ProviderHealth {
        match self {
            Embedder::Hash { dimension } => ProviderHealth::ok(*dimension),
            Embedder::LocalModel { dimension, .. } => ProviderHealth::ok(*dimension),
            Embedder::OpenAiCompatibleHttp {
                base_url, dimension, ..
            } => {
                let client = reqwest::Client::new();
                match client.get(format!("{base_url}/models")).send().await {
                    Ok(resp) if resp.status().is_success() => ProviderHealth::ok(*dimension),
                    Ok(resp) => ProviderHealth::unreachable(format!("status {}", resp.status())),
                    Err(err) => ProviderHealth::unreachable(err.to_string()),
                }
            }
        }
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponseItem {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingResponseItem>,
}

async fn embed_via_http(
    base_url: &str,
    api_key: &str,
    model: &str,
    dimension: usize,
    texts: &[String],
) -> Result<Vec<Vec<f32>>, ProviderError> {
    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base_url}/embeddings"))
        .bearer_auth(api_key)
        .json(&EmbeddingRequest { model, input: texts })
        .send()
        .await
        .map_err(|err| ProviderError::Unreachable(err.to_string()))?;

    if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(ProviderError::RateLimited);
    }
    if response.status() == reqwest::StatusCode::NOT_FOUND {
        return Err(ProviderError::ModelNotFound(model.to_string()));
    }
    if !response.status().is_success() {
        return Err(ProviderError::BadRequest(format!(
            "status {}",
            response.status()
        )));
    }

    let parsed: EmbeddingResponse = response
        .json()
        .await
        .map_err(|err| ProviderError::BadResponse(err.to_string()))?;

    for item in &parsed.data {
        if item.embedding.len() != dimension {
            return Err(ProviderError::DimensionMismatch {
                expected: dimension,
                actual: item.embedding.len(),
            });
        }
    }

    Ok(parsed.data.into_iter().map(|item| item.embedding).collect())
}

/// Deterministic embedding used by the `hash` and `local-model` fallback
/// variants: expands a SHA-256 digest of `(model_id, text)` into `dimension`
/// floats in `[-1, 1]` and L2-normalizes the result.
pub fn deterministic_embedding(text: &str, model_id: &str, dimension: usize) -> Vec<f32> {
    let mut values = Vec::with_capacity(dimension);
    let mut counter: u32 = 0;
    while values.len() < dimension {
        let mut hasher = Sha256::new();
        hasher.update(model_id.as_bytes());
        hasher.update(b"::");
        hasher.update(text.as_bytes());
        hasher.update(counter.to_le_bytes());
        let digest = hasher.finalize();
        for chunk in digest.chunks_exact(4) {
            if values.len() == dimension {
                break;
            }
            let bits = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            // Map to [-1, 1].
            let unit = (bits as f64) / (u32::MAX as f64);
            values.push((unit * 2.0 - 1.0) as f32);
        }
        counter += 1;
    }

    l2_normalize(&mut values);
    values
}

fn l2_normalize(values: &mut [f32]) {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in values.iter_mut() {
            *v /= norm;
        }
    }
}
