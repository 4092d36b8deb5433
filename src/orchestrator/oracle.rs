//! Decision oracle: the component that picks the next action.
//!
//! The loop hands the oracle a read-only snapshot of the request and gets a
//! `Decision` back. The trait deliberately cannot fail; the Gemini adapter
//! folds transport and parse problems into `GIVE_UP` decisions so the loop
//! has exactly one path for every outcome.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use super::action::Action;
use super::context::{ClarificationExchange, OrchestrationContext};
use super::decision::{parse_decision, Decision};
use super::session::ConversationHistoryEntry;
use crate::llm::{LlmClient, LlmRequest, PromptStore};

// ============================================================================
// Context Snapshot
// ============================================================================

/// Read-only view of a request, shaped for the orchestration prompt.
#[derive(Debug, Clone, Serialize)]
pub struct ContextSnapshot {
    pub user_query: String,
    pub current_state: String,
    /// Non-empty only in a terminal state, where the only valid choice
    /// is COMPLETE.
    pub state_warning: String,
    pub clarification_round: u32,
    pub max_clarification_rounds: u32,
    pub is_resuming_clarification: bool,
    pub clarification_history: Vec<ClarificationExchange>,
    /// Stage results pre-serialized to JSON, so templates interpolate them
    /// without a filter.
    pub stage_results_json: String,
    pub recent_history: Vec<ConversationHistoryEntry>,
    pub valid_actions: Vec<&'static str>,
}

impl ContextSnapshot {
    pub fn capture(
        context: &OrchestrationContext,
        recent_history: Vec<ConversationHistoryEntry>,
        max_clarification_rounds: u32,
    ) -> Self {
        let state_warning = if context.state.is_terminal() {
            format!(
                "⚠️ STATE IS {} - YOU MUST CHOOSE 'COMPLETE' ACTION!",
                context.state
            )
        } else {
            String::new()
        };

        let stage_results_json = serde_json::to_string_pretty(&context.stage_results)
            .unwrap_or_else(|_| String::from("{}"));

        Self {
            user_query: context.user_query.clone(),
            current_state: context.state.to_string(),
            state_warning,
            clarification_round: context.clarification_round,
            max_clarification_rounds,
            is_resuming_clarification: context.is_resuming_clarification,
            clarification_history: context.clarification_history.clone(),
            stage_results_json,
            recent_history,
            valid_actions: Action::ALL.iter().map(Action::as_str).collect(),
        }
    }
}

// ============================================================================
// Oracle Trait
// ============================================================================

/// Picks the next action for a request. Implementations never fail: anything
/// that goes wrong becomes a `GIVE_UP` decision.
#[async_trait]
pub trait DecisionOracle: Send + Sync {
    async fn decide(&self, snapshot: &ContextSnapshot) -> Decision;
}

// ============================================================================
// Gemini Oracle
// ============================================================================

/// Oracle backed by a Gemini model through the orchestration prompt.
pub struct GeminiOracle {
    client: Arc<dyn LlmClient>,
    prompts: Arc<PromptStore>,
    model: String,
}

impl GeminiOracle {
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
}

#[async_trait]
impl DecisionOracle for GeminiOracle {
    async fn decide(&self, snapshot: &ContextSnapshot) -> Decision {
        let prompt = match self.prompts.render("orchestration", snapshot) {
            Ok(prompt) => prompt,
            Err(e) => return Decision::give_up(format!("Orchestration error: {e}")),
        };

        debug!(
            model = %self.model,
            state = %snapshot.current_state,
            "requesting orchestration decision"
        );

        match self.client.complete(LlmRequest::json(&self.model, prompt)).await {
            Ok(text) => parse_decision(&text),
            Err(e) => Decision::give_up(format!("Orchestration error: {e}")),
        }
    }
}
