//! Integration tests for the orchestration engine.
//!
//! These tests drive the full loop through its public API with a scripted
//! oracle and counting stub stages, covering:
//! - Happy path with exactly one call per stage
//! - Idempotency guards against repeated dispatch
//! - Terminal-state lock-in
//! - Clarification rounds, cap conversion, and key lifecycle
//! - Resume flows, lost keys, and same-key concurrency
//! - Iteration ceiling and malformed oracle output

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};

use query_pilot::llm::{MockLlmClient, PromptStore};
use query_pilot::orchestrator::{
    Action, ClarificationExchange, ContextSnapshot, Decision, DecisionOracle, FinalAction,
    GeminiOracle, OrchestratorOptions, QueryOrchestrator,
};
use query_pilot::stages::{
    DomainHandler, ExecutionMetadata, ExecutionOutcome, Executor, FormatRequest,
    FormattedResponse, HandlerOutcome, PlanOutcome, Planner, ResponseExplanation,
    ResponseFormatter, StageSet,
};

// ============================================================================
// Scripted Oracle and Stub Stages
// ============================================================================

/// Replays a fixed decision sequence; answers COMPLETE once exhausted so a
/// test bug can never hang the loop.
struct ScriptedOracle {
    script: Mutex<VecDeque<Decision>>,
}

impl ScriptedOracle {
    fn new(actions: &[Action]) -> Self {
        Self {
            script: Mutex::new(
                actions
                    .iter()
                    .map(|a| Decision::new(*a, "scripted"))
                    .collect(),
            ),
        }
    }
}

#[async_trait]
impl DecisionOracle for ScriptedOracle {
    async fn decide(&self, _snapshot: &ContextSnapshot) -> Decision {
        let mut script = self.script.lock().unwrap();
        script
            .pop_front()
            .unwrap_or_else(|| Decision::new(Action::Complete, "script exhausted"))
    }
}

/// One shared stub acting as all four stages, with call counters and
/// queueable outcomes (defaults apply once a queue runs dry).
#[derive(Default)]
struct StubStages {
    plan_calls: AtomicUsize,
    execute_calls: AtomicUsize,
    format_calls: AtomicUsize,
    handle_calls: AtomicUsize,
    plan_outcomes: Mutex<VecDeque<PlanOutcome>>,
    execution_outcomes: Mutex<VecDeque<ExecutionOutcome>>,
    handler_outcomes: Mutex<VecDeque<HandlerOutcome>>,
    seen_histories: Mutex<Vec<Vec<ClarificationExchange>>>,
}

impl StubStages {
    fn push_plan(&self, outcome: PlanOutcome) {
        self.plan_outcomes.lock().unwrap().push_back(outcome);
    }

    fn push_execution(&self, outcome: ExecutionOutcome) {
        self.execution_outcomes.lock().unwrap().push_back(outcome);
    }

    fn push_handler(&self, outcome: HandlerOutcome) {
        self.handler_outcomes.lock().unwrap().push_back(outcome);
    }

    fn default_execution() -> ExecutionOutcome {
        ExecutionOutcome {
            success: true,
            artifact: Some("SELECT COUNT(*) FROM customers".to_string()),
            rows: vec![json!({"total": 42})],
            metadata: ExecutionMetadata {
                row_count: 1,
                ..ExecutionMetadata::default()
            },
        }
    }
}

#[async_trait]
impl Planner for StubStages {
    async fn plan(
        &self,
        _user_query: &str,
        clarification_history: &[ClarificationExchange],
    ) -> Result<PlanOutcome> {
        self.plan_calls.fetch_add(1, Ordering::SeqCst);
        self.seen_histories
            .lock()
            .unwrap()
            .push(clarification_history.to_vec());
        Ok(self
            .plan_outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| PlanOutcome::answerable(json!({"intent": "count customers"}))))
    }
}

#[async_trait]
impl Executor for StubStages {
    async fn execute(&self, _user_query: &str, _plan: &Value) -> Result<ExecutionOutcome> {
        self.execute_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .execution_outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(StubStages::default_execution))
    }
}

#[async_trait]
impl ResponseFormatter for StubStages {
    async fn format(&self, request: FormatRequest<'_>) -> Result<FormattedResponse> {
        self.format_calls.fetch_add(1, Ordering::SeqCst);
        Ok(FormattedResponse {
            display_text: format!("answer to '{}'", request.user_query),
            explanation: ResponseExplanation {
                summary: "stub".to_string(),
                reasoning_steps: Vec::new(),
                interpretation: String::new(),
                row_count: request.execution.metadata.row_count,
                execution_time: "0.001s".to_string(),
                bytes_processed: "0.00MB".to_string(),
            },
        })
    }
}

#[async_trait]
impl DomainHandler for StubStages {
    async fn handle(&self, _user_query: &str) -> Result<HandlerOutcome> {
        self.handle_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .handler_outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(HandlerOutcome {
                success: true,
                data: json!({"pricing_response": "about $5/month"}),
                display_text: "about $5/month".to_string(),
                metadata: json!({"query_type": "pricing_estimate"}),
            }))
    }
}

fn scripted_orchestrator(actions: &[Action], stages: &Arc<StubStages>) -> QueryOrchestrator {
    let stage_set = StageSet {
        planner: Arc::clone(stages) as Arc<dyn Planner>,
        executor: Arc::clone(stages) as Arc<dyn Executor>,
        formatter: Arc::clone(stages) as Arc<dyn ResponseFormatter>,
        handler: Arc::clone(stages) as Arc<dyn DomainHandler>,
    };
    QueryOrchestrator::new(
        Arc::new(ScriptedOracle::new(actions)),
        stage_set,
        OrchestratorOptions::default(),
    )
}

// ============================================================================
// Happy Path
// ============================================================================

#[tokio::test]
async fn test_happy_path_calls_each_stage_exactly_once() {
    let stages = Arc::new(StubStages::default());
    let orchestrator = scripted_orchestrator(
        &[
            Action::CallPlanner,
            Action::CallExecutor,
            Action::CallResponseFormatter,
            Action::Complete,
        ],
        &stages,
    );

    let outcome = orchestrator
        .handle_query("How many customers are there?")
        .await;

    assert!(outcome.success);
    assert_eq!(
        outcome.display_text,
        "answer to 'How many customers are there?'"
    );
    assert_eq!(
        outcome.artifact.as_deref(),
        Some("SELECT COUNT(*) FROM customers")
    );
    assert_eq!(outcome.rows.len(), 1);
    assert!(outcome.display.is_some());

    assert_eq!(stages.plan_calls.load(Ordering::SeqCst), 1);
    assert_eq!(stages.execute_calls.load(Ordering::SeqCst), 1);
    assert_eq!(stages.format_calls.load(Ordering::SeqCst), 1);
    assert_eq!(stages.handle_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_happy_path_trace_records_each_iteration() {
    let stages = Arc::new(StubStages::default());
    let orchestrator = scripted_orchestrator(
        &[
            Action::CallPlanner,
            Action::CallExecutor,
            Action::CallResponseFormatter,
            Action::Complete,
        ],
        &stages,
    );

    let outcome = orchestrator.handle_query("How many customers?").await;
    let trace = &outcome.trace;

    assert_eq!(trace.iterations, 4);
    assert_eq!(trace.final_action, FinalAction::Action(Action::Complete));
    assert_eq!(trace.decisions.len(), 4);

    let actions: Vec<Action> = trace.decisions.iter().map(|d| d.action).collect();
    assert_eq!(
        actions,
        vec![
            Action::CallPlanner,
            Action::CallExecutor,
            Action::CallResponseFormatter,
            Action::Complete,
        ]
    );

    // Each record captures the state the decision was made in
    let states: Vec<String> = trace
        .decisions
        .iter()
        .map(|d| d.state.to_string())
        .collect();
    assert_eq!(
        states,
        vec![
            "NEW_QUERY",
            "PLANNING_COMPLETE",
            "EXECUTION_COMPLETE",
            "RESPONSE_COMPLETE",
        ]
    );
}

// ============================================================================
// Idempotency and Terminal Lock-in
// ============================================================================

#[tokio::test]
async fn test_repeated_executor_decisions_do_not_rerun_execution() {
    let stages = Arc::new(StubStages::default());
    let orchestrator = scripted_orchestrator(
        &[
            Action::CallPlanner,
            Action::CallExecutor,
            Action::CallExecutor,
            Action::CallExecutor,
            Action::CallResponseFormatter,
            Action::Complete,
        ],
        &stages,
    );

    let outcome = orchestrator.handle_query("How many customers?").await;

    assert!(outcome.success);
    assert_eq!(stages.execute_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failed_execution_is_retried_on_repeat_decision() {
    let stages = Arc::new(StubStages::default());
    stages.push_execution(ExecutionOutcome::failed("quota exceeded"));

    let orchestrator = scripted_orchestrator(
        &[
            Action::CallPlanner,
            Action::CallExecutor,
            Action::CallExecutor,
            Action::CallResponseFormatter,
            Action::Complete,
        ],
        &stages,
    );

    let outcome = orchestrator.handle_query("How many customers?").await;

    // Second CALL_EXECUTOR re-runs because the first attempt failed
    assert_eq!(stages.execute_calls.load(Ordering::SeqCst), 2);
    assert!(outcome.success);
}

#[tokio::test]
async fn test_terminal_state_locks_in_completion() {
    let stages = Arc::new(StubStages::default());
    let orchestrator = scripted_orchestrator(
        &[
            Action::CallPlanner,
            Action::CallExecutor,
            Action::CallResponseFormatter,
            Action::CallPlanner,
        ],
        &stages,
    );

    let outcome = orchestrator.handle_query("How many customers?").await;

    // The stray CALL_PLANNER in RESPONSE_COMPLETE ends the loop instead of
    // dispatching anything
    assert!(outcome.success);
    assert_eq!(stages.plan_calls.load(Ordering::SeqCst), 1);
    assert_eq!(stages.format_calls.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.trace.iterations, 4);
}

// ============================================================================
// Iteration Ceiling
// ============================================================================

#[tokio::test]
async fn test_eleven_planner_decisions_exceed_iteration_ceiling() {
    let stages = Arc::new(StubStages::default());
    // Planner never reaches an answerable plan, so every decision re-plans
    for _ in 0..11 {
        stages.push_plan(PlanOutcome::needs_clarification("Which table?"));
    }

    let orchestrator = scripted_orchestrator(&[Action::CallPlanner; 11], &stages);
    let outcome = orchestrator.handle_query("show me the data").await;

    assert!(!outcome.success);
    assert!(outcome.metadata.max_iterations_reached);
    assert_eq!(
        outcome.display_text,
        "Workflow exceeded maximum iterations. Please try a simpler query."
    );
    assert_eq!(outcome.trace.iterations, 10);
    assert_eq!(outcome.trace.final_action, FinalAction::MaxIterations);
    assert_eq!(stages.plan_calls.load(Ordering::SeqCst), 10);
}

// ============================================================================
// Clarification Rounds
// ============================================================================

#[tokio::test]
async fn test_three_asks_then_give_up_with_key_removed() {
    let stages = Arc::new(StubStages::default());
    for _ in 0..4 {
        stages.push_plan(PlanOutcome::needs_clarification("Which department?"));
    }

    // Each turn: plan, then ask; the fourth ask converts to give-up
    let script = [
        Action::CallPlanner,
        Action::AskClarification,
        Action::CallPlanner,
        Action::AskClarification,
        Action::CallPlanner,
        Action::AskClarification,
        Action::CallPlanner,
        Action::AskClarification,
    ];
    let orchestrator = scripted_orchestrator(&script, &stages);

    let first = orchestrator.handle_query("show headcount").await;
    assert!(!first.success);
    let pending = first.metadata.clarification.as_ref().expect("question owed");
    assert_eq!(pending.key, "show headcount");
    assert_eq!(pending.round, 1);
    assert_eq!(first.display_text, "Which department?");
    assert_eq!(orchestrator.pending_clarifications().await, 1);

    let second = orchestrator
        .resume_clarification("show headcount", "sales")
        .await;
    assert_eq!(second.metadata.clarification.as_ref().unwrap().round, 2);

    let third = orchestrator
        .resume_clarification("show headcount", "by region")
        .await;
    assert_eq!(third.metadata.clarification.as_ref().unwrap().round, 3);

    // Round cap reached: the next ask becomes a give-up
    let last = orchestrator
        .resume_clarification("show headcount", "for 2024")
        .await;
    assert!(!last.success);
    assert!(last.metadata.clarification.is_none());
    assert!(last.metadata.max_rounds_reached);
    assert_eq!(
        last.display_text,
        "I've asked for clarification 3 times but still need more information. \
         Please try rephrasing your question with more specific details."
    );
    assert_eq!(
        last.metadata.give_up_reason.as_deref(),
        Some("Max clarification rounds reached (3)")
    );
    assert_eq!(orchestrator.pending_clarifications().await, 0);
}

#[tokio::test]
async fn test_resume_carries_history_into_planner() {
    let stages = Arc::new(StubStages::default());
    stages.push_plan(PlanOutcome::needs_clarification("Which department?"));
    // Second planning call falls through to the answerable default

    let script = [
        Action::CallPlanner,
        Action::AskClarification,
        Action::CallPlanner,
        Action::CallExecutor,
        Action::CallResponseFormatter,
        Action::Complete,
    ];
    let orchestrator = scripted_orchestrator(&script, &stages);

    let first = orchestrator.handle_query("show headcount").await;
    assert!(first.metadata.clarification.is_some());

    let second = orchestrator
        .resume_clarification("show headcount", "sales")
        .await;
    assert!(second.success);
    assert_eq!(second.user_query, "sales");
    assert_eq!(orchestrator.pending_clarifications().await, 0);

    // The resumed planning call saw the full exchange, answer included
    let histories = stages.seen_histories.lock().unwrap();
    assert_eq!(histories.len(), 2);
    assert!(histories[0].is_empty());
    assert_eq!(histories[1].len(), 1);
    assert_eq!(histories[1][0].query, "show headcount");
    assert_eq!(histories[1][0].question_asked, "Which department?");
    assert_eq!(histories[1][0].user_answer.as_deref(), Some("sales"));
}

#[tokio::test]
async fn test_resume_with_unknown_key_reports_lost_context() {
    let stages = Arc::new(StubStages::default());
    let orchestrator = scripted_orchestrator(&[], &stages);

    let outcome = orchestrator
        .resume_clarification("never-asked", "sales")
        .await;

    assert!(!outcome.success);
    assert!(outcome.display_text.contains("lost track of our conversation"));
    assert_eq!(
        outcome.metadata.error.as_deref(),
        Some("clarification_context_not_found")
    );
    assert_eq!(outcome.trace.iterations, 0);

    // The turn never claimed a request number
    let stats = orchestrator.stats().await;
    assert_eq!(stats.total_requests, 0);
}

#[tokio::test]
async fn test_concurrent_answers_to_one_key_resolve_exactly_once() {
    let stages = Arc::new(StubStages::default());
    stages.push_plan(PlanOutcome::needs_clarification("Which region?"));

    let script = [
        Action::CallPlanner,
        Action::AskClarification,
        Action::Complete,
        Action::Complete,
    ];
    let orchestrator = Arc::new(scripted_orchestrator(&script, &stages));

    let first = orchestrator.handle_query("show revenue").await;
    assert!(first.metadata.clarification.is_some());

    let a = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(
            async move { orchestrator.resume_clarification("show revenue", "emea").await },
        )
    };
    let b = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(
            async move { orchestrator.resume_clarification("show revenue", "apac").await },
        )
    };
    let (a, b) = (a.await.unwrap(), b.await.unwrap());

    // The per-key gate serializes the answers: one resolves the thread, the
    // other finds it already gone
    let lost = [&a, &b]
        .iter()
        .filter(|o| o.metadata.error.as_deref() == Some("clarification_context_not_found"))
        .count();
    assert_eq!(lost, 1);
    assert!(a.success || b.success);
    assert_eq!(orchestrator.pending_clarifications().await, 0);
}

// ============================================================================
// Oracle Failure Modes
// ============================================================================

#[tokio::test]
async fn test_prose_oracle_response_gives_up_in_one_iteration() {
    let oracle = GeminiOracle::new(
        Arc::new(MockLlmClient {
            response: "I believe calling the planner would be wise here.".to_string(),
        }),
        Arc::new(PromptStore::builtin().unwrap()),
        "gemini-2.5-flash-lite",
    );

    let stages = Arc::new(StubStages::default());
    let stage_set = StageSet {
        planner: Arc::clone(&stages) as Arc<dyn Planner>,
        executor: Arc::clone(&stages) as Arc<dyn Executor>,
        formatter: Arc::clone(&stages) as Arc<dyn ResponseFormatter>,
        handler: Arc::clone(&stages) as Arc<dyn DomainHandler>,
    };
    let orchestrator =
        QueryOrchestrator::new(Arc::new(oracle), stage_set, OrchestratorOptions::default());

    let outcome = orchestrator.handle_query("How many customers?").await;

    assert!(!outcome.success);
    assert_eq!(outcome.trace.iterations, 1);
    assert!(
        outcome.display_text.contains("parse"),
        "expected a parse failure message, got: {}",
        outcome.display_text
    );
    assert_eq!(stages.plan_calls.load(Ordering::SeqCst), 0);
    assert_eq!(stages.execute_calls.load(Ordering::SeqCst), 0);
}

// ============================================================================
// Domain Handler Branch
// ============================================================================

#[tokio::test]
async fn test_pricing_branch_returns_handler_outcome() {
    let stages = Arc::new(StubStages::default());
    let orchestrator =
        scripted_orchestrator(&[Action::CallDomainHandler, Action::Complete], &stages);

    let outcome = orchestrator
        .handle_query("How much does 1TB of storage cost?")
        .await;

    assert!(outcome.success);
    assert_eq!(outcome.display_text, "about $5/month");
    assert!(outcome.artifact.is_none());
    assert_eq!(stages.handle_calls.load(Ordering::SeqCst), 1);
    assert_eq!(stages.plan_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failed_handler_surfaces_distinct_outcome() {
    let stages = Arc::new(StubStages::default());
    stages.push_handler(HandlerOutcome::failed(
        "I apologize, but I encountered an error processing your pricing query: timeout",
        "timeout",
    ));

    let orchestrator =
        scripted_orchestrator(&[Action::CallDomainHandler, Action::Complete], &stages);

    let outcome = orchestrator.handle_query("How much does storage cost?").await;

    assert!(!outcome.success);
    assert_eq!(outcome.trace.final_action, FinalAction::HandlerFailed);
    assert_eq!(outcome.metadata.error.as_deref(), Some("timeout"));
    assert!(outcome.display_text.contains("pricing query"));
}

// ============================================================================
// Stats and Reset
// ============================================================================

#[tokio::test]
async fn test_stats_track_success_and_failure_across_requests() {
    let stages = Arc::new(StubStages::default());

    let script = [
        // Request 1 completes without stage work
        Action::Complete,
        // Request 2 plans, then gives up
        Action::CallPlanner,
        Action::GiveUp,
    ];
    let orchestrator = scripted_orchestrator(&script, &stages);

    let first = orchestrator.handle_query("hello").await;
    assert!(first.success);

    let second = orchestrator.handle_query("show me everything").await;
    assert!(!second.success);
    assert_eq!(second.metadata.give_up_reason.as_deref(), Some("scripted"));

    let stats = orchestrator.stats().await;
    assert_eq!(stats.total_requests, 2);
    assert_eq!(stats.successful_requests, 1);
    assert_eq!(stats.failed_requests, 1);
    assert!((stats.success_rate - 0.5).abs() < 1e-9);

    orchestrator.reset().await;
    let stats = orchestrator.stats().await;
    assert_eq!(stats.total_requests, 0);
    assert_eq!(stats.success_rate, 0.0);
}
