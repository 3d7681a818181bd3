// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::error::{code::ErrorCode, GroundEffectResult};
use crate::modules::store::schema::EMBEDDING_DIM;
use crate::raise_error;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::warn;

pub mod backend;

pub use backend::{EmbeddingBackend, HttpEmbeddingBackend};

/// At most this many forward passes run concurrently.
const MAX_CONCURRENT_PASSES: usize = 4;

/// Waiting slots beyond the running passes; a full queue rejects with
/// backpressure rather than buffering without bound or dropping work.
const QUEUE_DEPTH: usize = 256;

/// Inputs longer than the model context are middle-truncated, head and
/// tail preserved.
const MAX_INPUT_CHARS: usize = 16_384;
const HEAD_CHARS: usize = 10_240;

/// Process-wide embedding front-end: truncation policy, concurrency cap,
/// bounded queue, unit normalisation. Initialised once at startup and
/// injected by reference; both item ingest and query embedding go through
/// the same instance so the two sides share one truncation policy.
pub struct Embedder {
    backend: Arc<dyn EmbeddingBackend>,
    passes: Arc<Semaphore>,
    queue: Arc<Semaphore>,
}

impl Embedder {
    pub fn new(backend: Arc<dyn EmbeddingBackend>) -> Self {
        Self {
            backend,
            passes: Arc::new(Semaphore::new(MAX_CONCURRENT_PASSES)),
            queue: Arc::new(Semaphore::new(MAX_CONCURRENT_PASSES + QUEUE_DEPTH)),
        }
    }

    /// Embeds `text` into a unit-normalised 768-dim vector.
    pub async fn embed(&self, text: &str) -> GroundEffectResult<Vec<f32>> {
        let _slot = self.queue.clone().try_acquire_owned().map_err(|_| {
            raise_error!(
                "embedding queue is full".into(),
                ErrorCode::TooManyRequest
            )
        })?;
        let _pass = self
            .passes
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| raise_error!(format!("{e}"), ErrorCode::InternalError))?;

        let input = middle_truncate(text, MAX_INPUT_CHARS, HEAD_CHARS);
        let vector = self.backend.embed(&input).await?;
        if vector.len() != EMBEDDING_DIM {
            return Err(raise_error!(
                format!(
                    "backend returned a {}-dim vector, schema requires {EMBEDDING_DIM}",
                    vector.len()
                ),
                ErrorCode::ImapUnexpectedResult
            ));
        }
        Ok(normalize(vector))
    }

    /// Ingest-side wrapper: embedding failure is non-fatal. The item is
    /// committed with a zero vector and flagged for the re-embed pass.
    pub async fn embed_or_flag(&self, text: &str) -> (Vec<f32>, bool) {
        match self.embed(text).await {
            Ok(vector) => (vector, false),
            Err(e) => {
                warn!("embedding failed, committing zero vector: {}", e.message());
                (vec![0.0; EMBEDDING_DIM], true)
            }
        }
    }
}

/// Keeps the head and tail of an over-long input, cutting the middle.
pub fn middle_truncate(text: &str, max_chars: usize, head_chars: usize) -> String {
    let total: usize = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let tail_chars = max_chars.saturating_sub(head_chars);
    let head: String = text.chars().take(head_chars).collect();
    let tail: String = text
        .chars()
        .skip(total - tail_chars)
        .collect();
    format!("{head}\n…\n{tail}")
}

pub fn normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in &mut vector {
            *v /= norm;
        }
    }
    vector
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use async_trait::async_trait;

    /// Deterministic in-process backend: hashes tokens into a fixed-width
    /// vector so similar texts land near one another, with no model or
    /// server involved.
    pub struct FakeBackend {
        pub fail: std::sync::atomic::AtomicBool,
    }

    impl FakeBackend {
        pub fn new() -> Self {
            Self {
                fail: std::sync::atomic::AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl EmbeddingBackend for FakeBackend {
        async fn embed(&self, text: &str) -> GroundEffectResult<Vec<f32>> {
            if self.fail.load(std::sync::atomic::Ordering::Relaxed) {
                return Err(raise_error!(
                    "fake backend forced failure".into(),
                    ErrorCode::NetworkError
                ));
            }
            let mut vector = vec![0.0f32; EMBEDDING_DIM];
            for token in crate::modules::store::index::keyword::tokenize(text) {
                let mut bucket: u64 = 0xcbf29ce484222325;
                for byte in token.bytes() {
                    bucket ^= u64::from(byte);
                    bucket = bucket.wrapping_mul(0x100000001b3);
                }
                vector[(bucket % EMBEDDING_DIM as u64) as usize] += 1.0;
            }
            if vector.iter().all(|v| *v == 0.0) {
                vector[0] = 1.0;
            }
            Ok(vector)
        }
    }
}
