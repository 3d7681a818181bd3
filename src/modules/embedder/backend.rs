// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::error::{code::ErrorCode, GroundEffectResult};
use crate::raise_error;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
const MAX_RETRIES: usize = 3;
const RETRY_BACKOFF_MS: u64 = 750;
const RETRY_BACKOFF_FACTOR: u64 = 2;

/// A source of raw (not yet normalised) embedding vectors.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    async fn embed(&self, text: &str) -> GroundEffectResult<Vec<f32>>;
}

/// Backend speaking to a local inference server over HTTP. The model file
/// lives under `<data-dir>/models/`; the server process owning it is
/// launched outside the daemon (hardware acceleration is its concern, the
/// `use_metal` hint is forwarded verbatim).
pub struct HttpEmbeddingBackend {
    base_url: String,
    model: String,
    use_metal: bool,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    inputs: &'a [&'a str],
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    use_metal: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EmbeddingResponse {
    Bare(Vec<Vec<f32>>),
    Keyed { embeddings: Vec<Vec<f32>> },
}

impl EmbeddingResponse {
    fn into_first(self) -> Option<Vec<f32>> {
        match self {
            EmbeddingResponse::Bare(mut rows) | EmbeddingResponse::Keyed { embeddings: mut rows } => {
                if rows.is_empty() {
                    None
                } else {
                    Some(rows.remove(0))
                }
            }
        }
    }
}

impl HttpEmbeddingBackend {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, use_metal: bool) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to construct reqwest client");
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            use_metal,
            http,
        }
    }

    async fn dispatch(&self, text: &str) -> GroundEffectResult<Vec<f32>> {
        let url = format!("{}/embeddings", self.base_url);
        let payload = EmbeddingRequest {
            model: &self.model,
            inputs: &[text],
            use_metal: self.use_metal,
        };
        let response = self
            .http
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| raise_error!(format!("{e}"), ErrorCode::NetworkError))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(raise_error!(
                format!("embedding server returned {status}: {body}"),
                ErrorCode::HttpResponseError
            ));
        }
        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| raise_error!(format!("{e}"), ErrorCode::HttpResponseError))?;
        parsed.into_first().ok_or_else(|| {
            raise_error!(
                "embedding server returned no vectors".into(),
                ErrorCode::HttpResponseError
            )
        })
    }
}

#[async_trait]
impl EmbeddingBackend for HttpEmbeddingBackend {
    async fn embed(&self, text: &str) -> GroundEffectResult<Vec<f32>> {
        let mut backoff_ms = RETRY_BACKOFF_MS;
        let mut last_error = None;
        for attempt in 1..=MAX_RETRIES {
            debug!(attempt, "dispatching embedding request");
            match self.dispatch(text).await {
                Ok(vector) => return Ok(vector),
                Err(e) => {
                    warn!(attempt, "embedding request failed: {}", e.message());
                    last_error = Some(e);
                }
            }
            if attempt < MAX_RETRIES {
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = backoff_ms.saturating_mul(RETRY_BACKOFF_FACTOR);
            }
        }
        Err(last_error.unwrap())
    }
}
