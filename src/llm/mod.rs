//! LLM backends for tier 2.
//!
//! [`LlmClient`] is the narrow seam the reasoner talks through: one
//! prompt in, raw completion text out. [`HttpLlmClient`] speaks the
//! Ollama-style local generate API.

pub mod reasoner;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::LlmError;

/// A prompt-in, text-out completion backend.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// The model identifier recorded on decisions this client produces.
    fn model_name(&self) -> &str;

    async fn generate(&self, prompt: &str) -> Result<String, LlmError>;
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

/// Client for a local Ollama-compatible `/api/generate` endpoint.
///
/// Classification wants determinism, so temperature stays near zero and
/// the completion is capped small; the response contract is a short JSON
/// object.
pub struct HttpLlmClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    num_predict: u32,
}

impl HttpLlmClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            num_predict: 300,
        }
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        let url = format!("{}/api/generate", self.base_url.trim_end_matches('/'));
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            options: GenerateOptions {
                temperature: 0.1,
                num_predict: self.num_predict,
            },
        };

        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LlmError::Status(status.as_u16()));
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Parse(format!("bad generate response: {e}")))?;

        debug!(model = %self.model, chars = body.response.len(), "LLM completion received");
        Ok(body.response)
    }
}
