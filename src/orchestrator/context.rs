//! Per-request orchestration context and the decision trace.
//!
//! A context is created fresh for every incoming request (or re-seeded from
//! a stored clarification thread), mutated only inside one loop invocation,
//! and discarded at loop exit. Session-scoped data lives in `session.rs`.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::action::{Action, QueryState};
use crate::stages::{ExecutionOutcome, FormattedResponse, HandlerOutcome, PlanOutcome};

// ============================================================================
// Clarification Exchanges
// ============================================================================

/// One clarification round: the query that triggered it, the question asked,
/// and the user's answer once it arrives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClarificationExchange {
    pub query: String,
    pub question_asked: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_answer: Option<String>,
}

impl ClarificationExchange {
    pub fn new(query: impl Into<String>, question_asked: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            question_asked: question_asked.into(),
            user_answer: None,
        }
    }
}

// ============================================================================
// Stage Results
// ============================================================================

/// Last output of each stage. An entry is rewritten only on an explicit
/// retry; the idempotency guard in the loop consults these to skip repeats.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StageResults {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub planning: Option<PlanOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<FormattedResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handler: Option<HandlerOutcome>,
}

impl StageResults {
    /// True when planning ran and judged the query answerable.
    pub fn planning_answerable(&self) -> bool {
        self.planning.as_ref().is_some_and(|p| p.is_answerable())
    }

    /// True when an execution result exists and succeeded.
    pub fn execution_succeeded(&self) -> bool {
        self.execution.as_ref().is_some_and(|e| e.success)
    }
}

// ============================================================================
// Orchestration Context
// ============================================================================

/// Mutable workflow context for a single request.
#[derive(Debug, Clone)]
pub struct OrchestrationContext {
    /// The request text for this turn. Immutable once set.
    pub user_query: String,
    pub state: QueryState,
    /// Never decreases within a request.
    pub clarification_round: u32,
    /// Append-only.
    pub clarification_history: Vec<ClarificationExchange>,
    pub stage_results: StageResults,
    /// Flips exactly once, false to true, to end the loop.
    pub completed: bool,
    pub is_resuming_clarification: bool,
}

impl OrchestrationContext {
    /// Fresh context for a new query.
    pub fn new(user_query: impl Into<String>) -> Self {
        Self {
            user_query: user_query.into(),
            state: QueryState::NewQuery,
            clarification_round: 0,
            clarification_history: Vec::new(),
            stage_results: StageResults::default(),
            completed: false,
            is_resuming_clarification: false,
        }
    }

    /// Context seeded from a stored clarification thread. The user's answer
    /// becomes both this turn's query and the answer on the last exchange,
    /// and the workflow restarts from `NEW_QUERY` with the history intact so
    /// the planner can synthesize intent across rounds.
    pub fn resumed(
        answer: impl Into<String>,
        mut history: Vec<ClarificationExchange>,
        round: u32,
    ) -> Self {
        let answer = answer.into();
        if let Some(last) = history.last_mut() {
            last.user_answer = Some(answer.clone());
        }
        Self {
            user_query: answer,
            state: QueryState::NewQuery,
            clarification_round: round,
            clarification_history: history,
            stage_results: StageResults::default(),
            completed: false,
            is_resuming_clarification: true,
        }
    }
}

// ============================================================================
// Decision Trace
// ============================================================================

/// The action that ended a request, for traces and history entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalAction {
    /// A decision from the closed vocabulary ended the loop.
    Action(Action),
    /// The iteration ceiling ended the loop.
    MaxIterations,
    /// The loop completed but the domain handler had reported failure.
    HandlerFailed,
}

impl FinalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinalAction::Action(action) => action.as_str(),
            FinalAction::MaxIterations => "MAX_ITERATIONS",
            FinalAction::HandlerFailed => "DOMAIN_HANDLER_FAILED",
        }
    }
}

impl fmt::Display for FinalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for FinalAction {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// One executed decision. Substitutions (invalid action, clarification cap)
/// happen before recording, so the trace shows what the loop actually did.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionRecord {
    pub iteration: u32,
    pub state: QueryState,
    pub action: Action,
    pub reason: String,
    pub clarification_round: u32,
}

/// Ordered decision log for one request.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationTrace {
    pub iterations: u32,
    pub final_action: FinalAction,
    pub decisions: Vec<DecisionRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_context_defaults() {
        let ctx = OrchestrationContext::new("How many customers?");
        assert_eq!(ctx.state, QueryState::NewQuery);
        assert_eq!(ctx.clarification_round, 0);
        assert!(ctx.clarification_history.is_empty());
        assert!(!ctx.completed);
        assert!(!ctx.is_resuming_clarification);
    }

    #[test]
    fn test_resumed_context_attaches_answer_to_last_exchange() {
        let history = vec![
            ClarificationExchange::new("show data", "Which table?"),
            ClarificationExchange::new("show data", "Which year?"),
        ];
        let ctx = OrchestrationContext::resumed("2024", history, 2);

        assert_eq!(ctx.user_query, "2024");
        assert_eq!(ctx.state, QueryState::NewQuery);
        assert_eq!(ctx.clarification_round, 2);
        assert!(ctx.is_resuming_clarification);
        assert_eq!(ctx.clarification_history[0].user_answer, None);
        assert_eq!(
            ctx.clarification_history[1].user_answer,
            Some("2024".to_string())
        );
    }

    #[test]
    fn test_stage_results_planning_answerable() {
        let mut results = StageResults::default();
        assert!(!results.planning_answerable());

        results.planning = Some(PlanOutcome::needs_clarification("Which department?"));
        assert!(!results.planning_answerable());

        results.planning = Some(PlanOutcome::answerable(serde_json::json!({"intent": "count"})));
        assert!(results.planning_answerable());
    }

    #[test]
    fn test_final_action_serializes_as_string() {
        let value = serde_json::to_value(FinalAction::Action(Action::Complete)).unwrap();
        assert_eq!(value, serde_json::json!("COMPLETE"));

        let value = serde_json::to_value(FinalAction::MaxIterations).unwrap();
        assert_eq!(value, serde_json::json!("MAX_ITERATIONS"));
    }

    #[test]
    fn test_empty_stage_results_serialize_compactly() {
        let value = serde_json::to_value(StageResults::default()).unwrap();
        assert_eq!(value, serde_json::json!({}));
    }
}
