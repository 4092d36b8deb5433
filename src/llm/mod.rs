//! LLM transport layer: the client trait, the Gemini implementation, and the
//! prompt template store.

pub mod gemini;
mod json_utils;
pub mod prompts;

pub use gemini::{GeminiClient, GeminiClientConfig};
pub use json_utils::extract_json_block;
pub use prompts::PromptStore;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

/// LLM request payload
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub system: String,
    pub user: String,
    pub model: String,
    pub temperature: f32,
    /// Ask the provider to emit a bare JSON object instead of prose.
    pub json_output: bool,
}

impl LlmRequest {
    /// Plain text completion request.
    pub fn text(model: &str, user: String) -> Self {
        Self {
            system: String::new(),
            user,
            model: model.to_string(),
            temperature: 0.2,
            json_output: false,
        }
    }

    /// Completion request that expects a JSON object back.
    pub fn json(model: &str, user: String) -> Self {
        Self {
            json_output: true,
            ..Self::text(model, user)
        }
    }

    pub fn with_system(mut self, system: String) -> Self {
        self.system = system;
        self
    }
}

/// LLM client trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: LlmRequest) -> Result<String, LlmError>;
}

#[async_trait]
impl LlmClient for Arc<dyn LlmClient> {
    async fn complete(&self, request: LlmRequest) -> Result<String, LlmError> {
        (**self).complete(request).await
    }
}

/// LLM errors
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("http error: {0}")]
    Http(String),
    #[error("response error: {0}")]
    Response(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Mock LLM client for tests: returns the same canned response to every call.
pub struct MockLlmClient {
    pub response: String,
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, _request: LlmRequest) -> Result<String, LlmError> {
        Ok(self.response.clone())
    }
}
