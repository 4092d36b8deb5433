//! Domain handler for cloud pricing questions.
//!
//! Pricing questions bypass the plan/execute/format pipeline entirely; one
//! prompt produces the finished answer.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use super::{DomainHandler, HandlerOutcome};
use crate::llm::{LlmClient, LlmRequest, PromptStore};

pub struct GeminiPricingHandler {
    client: Arc<dyn LlmClient>,
    prompts: Arc<PromptStore>,
    model: String,
}

#[derive(Serialize)]
struct PricingPromptContext<'a> {
    user_query: &'a str,
}

impl GeminiPricingHandler {
    pub fn new(
        client: Arc<dyn LlmClient>,
        prompts: Arc<PromptStore>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client,
            prompts,
            model: model.into(),
        }
    }

    async fn answer(&self, user_query: &str) -> Result<String> {
        let prompt = self
            .prompts
            .render("pricing", PricingPromptContext { user_query })?;
        let text = self
            .client
            .complete(LlmRequest::text(&self.model, prompt))
            .await?;
        Ok(text.trim().to_string())
    }
}

#[async_trait]
impl DomainHandler for GeminiPricingHandler {
    async fn handle(&self, user_query: &str) -> Result<HandlerOutcome> {
        info!(query = %user_query, "handling pricing query");

        match self.answer(user_query).await {
            Ok(text) => Ok(HandlerOutcome {
                success: true,
                data: json!({ "pricing_response": text }),
                display_text: text,
                metadata: json!({
                    "query_type": "pricing_estimate",
                    "model": self.model,
                }),
            }),
            Err(e) => {
                warn!(error = %e, "pricing query failed");
                Ok(HandlerOutcome {
                    success: false,
                    data: json!({}),
                    display_text: format!(
                        "I apologize, but I encountered an error processing your pricing query: {e}"
                    ),
                    metadata: json!({
                        "query_type": "pricing_estimate",
                        "error": e.to_string(),
                    }),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, MockLlmClient};

    struct FailingLlmClient;

    #[async_trait]
    impl LlmClient for FailingLlmClient {
        async fn complete(&self, _request: LlmRequest) -> Result<String, LlmError> {
            Err(LlmError::Http("connection refused".to_string()))
        }
    }

    fn handler_with(client: Arc<dyn LlmClient>) -> GeminiPricingHandler {
        GeminiPricingHandler::new(
            client,
            Arc::new(PromptStore::builtin().unwrap()),
            "gemini-2.5-flash-lite",
        )
    }

    #[tokio::test]
    async fn test_success_carries_answer_in_data_and_display() {
        let handler = handler_with(Arc::new(MockLlmClient {
            response: "A 1 TiB standard bucket costs about $20.48/month.".to_string(),
        }));

        let outcome = handler.handle("price of 1 TiB in GCS?").await.unwrap();
        assert!(outcome.success);
        assert_eq!(
            outcome.data["pricing_response"],
            "A 1 TiB standard bucket costs about $20.48/month."
        );
        assert_eq!(outcome.metadata["query_type"], "pricing_estimate");
        assert_eq!(outcome.display_text, outcome.data["pricing_response"]);
    }

    #[tokio::test]
    async fn test_failure_produces_apology_not_error() {
        let handler = handler_with(Arc::new(FailingLlmClient));

        let outcome = handler.handle("price of BigQuery?").await.unwrap();
        assert!(!outcome.success);
        assert!(outcome
            .display_text
            .starts_with("I apologize, but I encountered an error"));
        assert!(outcome.metadata["error"]
            .as_str()
            .unwrap()
            .contains("connection refused"));
    }
}
