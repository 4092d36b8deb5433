//! Workflow state and action vocabularies.
//!
//! Both sets are closed: every value the decision model may emit is an enum
//! variant, and anything else is rejected at parse time (see `decision.rs`).

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Workflow States
// ============================================================================

/// State of a query workflow. Stage handlers hardcode the transition they
/// produce; the decision model never sets state directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryState {
    /// Initial state for every request.
    NewQuery,
    /// Planner produced a result (answerable or needs clarification).
    PlanningComplete,
    /// Executor produced a result.
    ExecutionComplete,
    /// Formatter produced the user-facing answer. Terminal.
    ResponseComplete,
    /// Domain handler produced the pricing answer. Terminal.
    PricingComplete,
    /// Set by the loop itself on COMPLETE, never by a stage.
    Completed,
}

impl QueryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryState::NewQuery => "NEW_QUERY",
            QueryState::PlanningComplete => "PLANNING_COMPLETE",
            QueryState::ExecutionComplete => "EXECUTION_COMPLETE",
            QueryState::ResponseComplete => "RESPONSE_COMPLETE",
            QueryState::PricingComplete => "PRICING_COMPLETE",
            QueryState::Completed => "COMPLETED",
        }
    }

    /// Terminal states: no further stage dispatch is allowed, only COMPLETE.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueryState::ResponseComplete | QueryState::PricingComplete
        )
    }
}

impl fmt::Display for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Actions
// ============================================================================

/// Closed action vocabulary the decision model chooses from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    CallPlanner,
    CallExecutor,
    CallResponseFormatter,
    CallDomainHandler,
    AskClarification,
    RetryPlanning,
    GiveUp,
    Complete,
}

impl Action {
    /// Every valid action, in the order presented to the decision model.
    pub const ALL: [Action; 8] = [
        Action::CallPlanner,
        Action::CallExecutor,
        Action::CallResponseFormatter,
        Action::CallDomainHandler,
        Action::AskClarification,
        Action::RetryPlanning,
        Action::GiveUp,
        Action::Complete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::CallPlanner => "CALL_PLANNER",
            Action::CallExecutor => "CALL_EXECUTOR",
            Action::CallResponseFormatter => "CALL_RESPONSE_FORMATTER",
            Action::CallDomainHandler => "CALL_DOMAIN_HANDLER",
            Action::AskClarification => "ASK_CLARIFICATION",
            Action::RetryPlanning => "RETRY_PLANNING",
            Action::GiveUp => "GIVE_UP",
            Action::Complete => "COMPLETE",
        }
    }

    /// Parse a wire string. Returns `None` for anything outside the
    /// vocabulary; callers map that to GIVE_UP rather than propagating it.
    pub fn parse(value: &str) -> Option<Action> {
        match value {
            "CALL_PLANNER" => Some(Action::CallPlanner),
            "CALL_EXECUTOR" => Some(Action::CallExecutor),
            "CALL_RESPONSE_FORMATTER" => Some(Action::CallResponseFormatter),
            "CALL_DOMAIN_HANDLER" => Some(Action::CallDomainHandler),
            "ASK_CLARIFICATION" => Some(Action::AskClarification),
            "RETRY_PLANNING" => Some(Action::RetryPlanning),
            "GIVE_UP" => Some(Action::GiveUp),
            "COMPLETE" => Some(Action::Complete),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
