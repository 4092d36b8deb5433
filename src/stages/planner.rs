//! Planning stage: decides answerability and produces a query plan.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use super::{PlanOutcome, Planner};
use crate::llm::{extract_json_block, LlmClient, LlmRequest, PromptStore};
use crate::orchestrator::ClarificationExchange;

/// Gemini-backed planner. Judges a question against the schema context and
/// either emits a plan or a clarification question. Never fails outright:
/// anything that prevents planning becomes a clarification request, so the
/// user hears what went wrong in their own terms.
pub struct GeminiPlanner {
    client: Arc<dyn LlmClient>,
    prompts: Arc<PromptStore>,
    model: String,
    schema_context: String,
}

#[derive(Serialize)]
struct PlannerPromptContext<'a> {
    schema_context: &'a str,
    clarification_history: &'a [ClarificationExchange],
    user_query: &'a str,
}

impl GeminiPlanner {
    pub fn new(
        client: Arc<dyn LlmClient>,
        prompts: Arc<PromptStore>,
        model: impl Into<String>,
        schema_context: impl Into<String>,
    ) -> Self {
        Self {
            client,
            prompts,
            model: model.into(),
            schema_context: schema_context.into(),
        }
    }

    fn parse_outcome(text: &str) -> Result<PlanOutcome, String> {
        let json = extract_json_block(text)
            .ok_or_else(|| "no JSON found in planner response".to_string())?;
        serde_json::from_str(json).map_err(|e| e.to_string())
    }
}

#[async_trait]
impl Planner for GeminiPlanner {
    async fn plan(
        &self,
        user_query: &str,
        clarification_history: &[ClarificationExchange],
    ) -> Result<PlanOutcome> {
        if clarification_history.is_empty() {
            info!(query = %user_query, "planning query");
        } else {
            info!(
                query = %user_query,
                rounds = clarification_history.len(),
                "planning query with clarification history"
            );
        }

        let prompt = self.prompts.render(
            "planner",
            PlannerPromptContext {
                schema_context: &self.schema_context,
                clarification_history,
                user_query,
            },
        )?;

        let response = match self
            .client
            .complete(LlmRequest::json(&self.model, prompt))
            .await
        {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "planner call failed");
                return Ok(PlanOutcome::needs_clarification(format!(
                    "Unable to analyze query: {e}"
                )));
            }
        };

        match Self::parse_outcome(&response) {
            Ok(outcome) => {
                if outcome.is_answerable() {
                    info!("query is answerable");
                } else {
                    warn!(
                        question = outcome.clarification_question.as_deref().unwrap_or(""),
                        "query needs clarification"
                    );
                }
                Ok(outcome)
            }
            Err(e) => {
                warn!(error = %e, "planner returned an unusable response");
                Ok(PlanOutcome::needs_clarification(format!(
                    "Unable to analyze query: {e}"
                )))
            }
        }
    }
}
