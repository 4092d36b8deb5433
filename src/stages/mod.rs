//! Stage collaborators invoked by the orchestration loop.
//!
//! Each stage sits behind a trait so the loop never depends on how work
//! gets done. The Gemini-backed implementations live in the submodules;
//! tests substitute scripted stand-ins.

pub mod executor;
pub mod formatter;
pub mod planner;
pub mod pricing;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::orchestrator::ClarificationExchange;

pub use executor::{DataBackend, GeminiExecutor};
pub use formatter::GeminiFormatter;
pub use planner::GeminiPlanner;
pub use pricing::GeminiPricingHandler;

// ============================================================================
// Planner
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Answerable,
    NeedsClarification,
}

/// Planner verdict: either a machine-usable plan or a question for the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanOutcome {
    pub status: PlanStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarification_question: Option<String>,
}

impl PlanOutcome {
    pub fn answerable(plan: Value) -> Self {
        Self {
            status: PlanStatus::Answerable,
            plan: Some(plan),
            clarification_question: None,
        }
    }

    pub fn needs_clarification(question: impl Into<String>) -> Self {
        Self {
            status: PlanStatus::NeedsClarification,
            plan: None,
            clarification_question: Some(question.into()),
        }
    }

    pub fn is_answerable(&self) -> bool {
        self.status == PlanStatus::Answerable
    }
}

/// Decides whether a query is answerable and produces the plan for it.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(
        &self,
        user_query: &str,
        clarification_history: &[ClarificationExchange],
    ) -> Result<PlanOutcome>;
}

// ============================================================================
// Executor
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    pub row_count: u64,
    pub execution_time_ms: u64,
    pub bytes_processed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Executor result. Failures are data here, not errors: the loop reads
/// `success` to decide what happens next.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    #[serde(default)]
    pub rows: Vec<Value>,
    #[serde(default)]
    pub metadata: ExecutionMetadata,
}

impl ExecutionOutcome {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            artifact: None,
            rows: Vec::new(),
            metadata: ExecutionMetadata {
                error: Some(error.into()),
                ..ExecutionMetadata::default()
            },
        }
    }
}

/// Turns an approved plan into an executable artifact and runs it.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, user_query: &str, plan: &Value) -> Result<ExecutionOutcome>;
}

// ============================================================================
// Response Formatter
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseExplanation {
    pub summary: String,
    pub reasoning_steps: Vec<String>,
    pub interpretation: String,
    pub row_count: u64,
    pub execution_time: String,
    pub bytes_processed: String,
}

/// User-facing rendering of an execution result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormattedResponse {
    pub display_text: String,
    pub explanation: ResponseExplanation,
}

/// Everything the formatter may draw on, borrowed from the loop context.
#[derive(Debug, Clone, Copy)]
pub struct FormatRequest<'a> {
    pub user_query: &'a str,
    pub execution: &'a ExecutionOutcome,
    pub plan: Option<&'a Value>,
}

/// Renders execution results into natural language.
#[async_trait]
pub trait ResponseFormatter: Send + Sync {
    async fn format(&self, request: FormatRequest<'_>) -> Result<FormattedResponse>;
}

// ============================================================================
// Domain Handler
// ============================================================================

/// Specialized handler result, bypassing the plan/execute/format pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerOutcome {
    pub success: bool,
    #[serde(default)]
    pub data: Value,
    pub display_text: String,
    #[serde(default)]
    pub metadata: Value,
}

impl HandlerOutcome {
    pub fn failed(display_text: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Value::Null,
            display_text: display_text.into(),
            metadata: serde_json::json!({ "error": error.into() }),
        }
    }
}

/// Answers queries in a specialized domain outside the data pipeline.
#[async_trait]
pub trait DomainHandler: Send + Sync {
    async fn handle(&self, user_query: &str) -> Result<HandlerOutcome>;
}

// ============================================================================
// Stage Set
// ============================================================================

/// The four collaborators the loop dispatches to.
#[derive(Clone)]
pub struct StageSet {
    pub planner: Arc<dyn Planner>,
    pub executor: Arc<dyn Executor>,
    pub formatter: Arc<dyn ResponseFormatter>,
    pub handler: Arc<dyn DomainHandler>,
}
