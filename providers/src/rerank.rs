use crate::errors::ProviderError;
use serde::{Deserialize, Serialize};

/// Enum-dispatched reranker (spec §4.1). When `None`, the retrieval service
/// must skip rerank without error — the variant itself encodes that, there
/// is no separate "enabled" flag to keep in sync.
#[derive(Debug, Clone)]
pub enum Reranker {
    None,
    OpenAiCompatibleHttp {
        base_url: String,
        api_key: String,
        model: String,
    },
}

impl Reranker {
    /// Returns `None` when this variant is `Reranker::None`; otherwise a
    /// vector of scores the same length as `docs`.
    pub async fn rerank(
        &self,
        query: &str,
        docs: &[String],
    ) -> Result<Option<Vec<f32>>, ProviderError> {
        match self {
            Reranker::None => Ok(None),
            Reranker::OpenAiCompatibleHttp {
                base_url,
                api_key,
                model,
            } => rerank_via_http(base_url, api_key, model, query, docs)
                .await
                .map(Some),
        }
    }
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: &'a [String],
}

#[derive(Deserialize)]
struct RerankResponse {
    scores: Vec<f32>,
}

async fn rerank_via_http(
    base_url: &str,
    api_key: &str,
    model: &str,
    query: &str,
    docs: &[String],
) -> Result<Vec<f32>, ProviderError> {
    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base_url}/rerank"))
        .bearer_auth(api_key)
        .json(&RerankRequest {
            model,
            query,
            documents: docs,
        })
        .send()
        .await
        .map_err(|err| ProviderError::Unreachable(err.to_string()))?;

    if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(ProviderError::RateLimited);
    }
    if !response.status().is_success() {
        return Err(ProviderError::BadRequest(format!(
            "status {}",
            response.status()
        )));
    }

    let parsed: RerankResponse = response
        .json()
        .await
        .map_err(|err| ProviderError::BadResponse(err.to_string()))?;

    if parsed.scores.len() != docs.len() {
        return Err(ProviderError::BadResponse(format!(
            "expected {} scores, got {}",
            docs.len(),
            parsed.scores.len()
        )));
    }

    Ok(parsed.scores)
}
