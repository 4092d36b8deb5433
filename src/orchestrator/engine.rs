//! The orchestration loop.
//!
//! One `QueryOrchestrator` serves a whole session. Each request gets a fresh
//! context and runs the decide/dispatch loop until an exit action fires or a
//! guardrail ends it. The oracle only ever picks the next action; state
//! transitions, repeat suppression, and round accounting are enforced here
//! and cannot be overridden by a decision.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};

use super::action::{Action, QueryState};
use super::context::{
    ClarificationExchange, DecisionRecord, FinalAction, OrchestrationContext, OrchestrationTrace,
};
use super::guardrails::Guardrails;
use super::oracle::{ContextSnapshot, DecisionOracle};
use super::session::{
    ClarificationStore, ConversationHistoryEntry, ConversationLog, EngineStats,
    SessionClarificationEntry,
};
use crate::stages::{
    ExecutionOutcome, FormatRequest, FormattedResponse, HandlerOutcome, PlanOutcome,
    ResponseExplanation, StageSet,
};

// ============================================================================
// Outcome Types
// ============================================================================

/// Pending clarification details the caller needs to resume the thread.
#[derive(Debug, Clone, Serialize)]
pub struct PendingClarification {
    pub key: String,
    pub round: u32,
    pub max_rounds: u32,
}

/// Orchestration-level metadata on an outcome. Stage-level details live in
/// `display` and `rows`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OutcomeMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clarification: Option<PendingClarification>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub give_up_reason: Option<String>,
    pub max_rounds_reached: bool,
    pub max_iterations_reached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What the caller gets back for every request. Failures and clarification
/// questions are ordinary outcomes, never errors.
#[derive(Debug, Clone, Serialize)]
pub struct QueryOutcome {
    pub success: bool,
    pub user_query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    pub rows: Vec<Value>,
    pub display_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<FormattedResponse>,
    pub metadata: OutcomeMetadata,
    pub trace: OrchestrationTrace,
}

impl QueryOutcome {
    /// True when this outcome is a clarification question awaiting an answer.
    pub fn is_clarification(&self) -> bool {
        self.metadata.clarification.is_some()
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub guardrails: Guardrails,
    /// How many past turns the oracle sees for context continuity.
    pub history_window: usize,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            guardrails: Guardrails::default(),
            history_window: 3,
        }
    }
}

pub struct QueryOrchestrator {
    oracle: Arc<dyn DecisionOracle>,
    stages: StageSet,
    guardrails: Guardrails,
    history_window: usize,
    clarifications: ClarificationStore,
    log: ConversationLog,
}

impl QueryOrchestrator {
    pub fn new(
        oracle: Arc<dyn DecisionOracle>,
        stages: StageSet,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            oracle,
            stages,
            guardrails: options.guardrails,
            history_window: options.history_window,
            clarifications: ClarificationStore::new(),
            log: ConversationLog::new(),
        }
    }

    /// Process a fresh query.
    pub async fn handle_query(&self, user_query: &str) -> QueryOutcome {
        let request_number = self.log.next_request_number().await;
        info!(request = request_number, query = %user_query, "handling query");

        let context = OrchestrationContext::new(user_query);
        self.process(request_number, context, None).await
    }

    /// Feed a user's answer back into a pending clarification thread.
    ///
    /// Answers for the same key serialize on a per-key gate, so duplicate
    /// submissions can never race the round counter.
    pub async fn resume_clarification(&self, key: &str, answer: &str) -> QueryOutcome {
        let gate = self.clarifications.gate(key).await;
        let _guard = gate.lock().await;

        let Some(entry) = self.clarifications.get(key).await else {
            warn!(key = %key, "no pending clarification for key");
            return QueryOutcome {
                success: false,
                user_query: answer.to_string(),
                artifact: None,
                rows: Vec::new(),
                display_text: "I seem to have lost track of our conversation. Could you please \
                               rephrase your complete question?"
                    .to_string(),
                display: None,
                metadata: OutcomeMetadata {
                    error: Some("clarification_context_not_found".to_string()),
                    ..OutcomeMetadata::default()
                },
                trace: OrchestrationTrace {
                    iterations: 0,
                    final_action: FinalAction::Action(Action::GiveUp),
                    decisions: Vec::new(),
                },
            };
        };

        let request_number = self.log.next_request_number().await;
        info!(
            request = request_number,
            key = %key,
            round = entry.round,
            "processing clarification answer"
        );

        let context = OrchestrationContext::resumed(answer, entry.history, entry.round);
        self.process(request_number, context, Some(key)).await
    }

    pub async fn stats(&self) -> EngineStats {
        self.log.stats().await
    }

    pub async fn recent_history(&self, n: usize) -> Vec<ConversationHistoryEntry> {
        self.log.recent(n).await
    }

    pub async fn pending_clarifications(&self) -> usize {
        self.clarifications.len().await
    }

    /// Drop all history and pending clarification threads.
    pub async fn reset(&self) {
        self.log.reset().await;
        self.clarifications.clear().await;
        info!("conversation history and clarification threads cleared");
    }

    // ========================================================================
    // The Loop
    // ========================================================================

    async fn process(
        &self,
        request_number: u64,
        mut context: OrchestrationContext,
        resume_key: Option<&str>,
    ) -> QueryOutcome {
        let mut decisions: Vec<DecisionRecord> = Vec::new();
        let mut iterations: u32 = 0;

        while !context.completed && self.guardrails.check_iteration(iterations).is_ok() {
            iterations += 1;

            let snapshot = ContextSnapshot::capture(
                &context,
                self.log.recent(self.history_window).await,
                self.guardrails.max_clarification_rounds,
            );
            let mut decision = self.oracle.decide(&snapshot).await;

            // Terminal states accept only COMPLETE. Anything else ends the
            // loop right here instead of re-dispatching a finished stage.
            if context.state.is_terminal() && decision.action != Action::Complete {
                warn!(
                    request = request_number,
                    action = %decision.action,
                    state = %context.state,
                    "non-COMPLETE action in terminal state, forcing completion"
                );
                decisions.push(Self::record(iterations, &context, &decision));
                context.completed = true;
                continue;
            }

            // An answerable plan makes re-planning pointless; the productive
            // reading of that decision is "move on to execution".
            if decision.action == Action::CallPlanner
                && context.state == QueryState::PlanningComplete
                && context.stage_results.planning_answerable()
            {
                warn!(
                    request = request_number,
                    "plan already answerable, redirecting CALL_PLANNER to CALL_EXECUTOR"
                );
                decision.action = Action::CallExecutor;
            }

            // Round cap converts a further ask into a give-up before dispatch.
            if decision.action == Action::AskClarification
                && self
                    .guardrails
                    .check_clarification_round(context.clarification_round)
                    .is_err()
            {
                warn!(
                    request = request_number,
                    round = context.clarification_round,
                    "clarification rounds exhausted, converting ASK_CLARIFICATION to GIVE_UP"
                );
                decision.action = Action::GiveUp;
                decision.reason = format!(
                    "Max clarification rounds reached ({})",
                    self.guardrails.max_clarification_rounds
                );
            }

            decisions.push(Self::record(iterations, &context, &decision));

            match decision.action {
                Action::CallPlanner | Action::RetryPlanning => {
                    let outcome = match self
                        .stages
                        .planner
                        .plan(&context.user_query, &context.clarification_history)
                        .await
                    {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            warn!(request = request_number, error = %e, "planner failed");
                            PlanOutcome::needs_clarification(format!(
                                "Unable to analyze query: {e:#}"
                            ))
                        }
                    };
                    info!(
                        request = request_number,
                        answerable = outcome.is_answerable(),
                        "planning complete"
                    );
                    context.stage_results.planning = Some(outcome);
                    context.state = QueryState::PlanningComplete;
                }

                Action::CallExecutor => {
                    if context.state == QueryState::ExecutionComplete
                        && context.stage_results.execution_succeeded()
                    {
                        warn!(
                            request = request_number,
                            "execution already complete, skipping repeat call"
                        );
                        continue;
                    }

                    let Some(plan) = context
                        .stage_results
                        .planning
                        .as_ref()
                        .and_then(|p| p.plan.clone())
                    else {
                        warn!(
                            request = request_number,
                            "no plan available, skipping CALL_EXECUTOR dispatch"
                        );
                        continue;
                    };

                    let outcome = match self
                        .stages
                        .executor
                        .execute(&context.user_query, &plan)
                        .await
                    {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            error!(request = request_number, error = %e, "executor failed");
                            ExecutionOutcome::failed(format!("{e:#}"))
                        }
                    };
                    info!(
                        request = request_number,
                        success = outcome.success,
                        "execution complete"
                    );
                    context.stage_results.execution = Some(outcome);
                    context.state = QueryState::ExecutionComplete;
                }

                Action::CallResponseFormatter => {
                    if context.state == QueryState::ResponseComplete {
                        warn!(
                            request = request_number,
                            "response already formatted, skipping repeat call"
                        );
                        continue;
                    }

                    let Some(execution) = context.stage_results.execution.clone() else {
                        warn!(
                            request = request_number,
                            "no execution result, skipping CALL_RESPONSE_FORMATTER dispatch"
                        );
                        continue;
                    };
                    let plan = context
                        .stage_results
                        .planning
                        .as_ref()
                        .and_then(|p| p.plan.clone());

                    let formatted = match self
                        .stages
                        .formatter
                        .format(FormatRequest {
                            user_query: &context.user_query,
                            execution: &execution,
                            plan: plan.as_ref(),
                        })
                        .await
                    {
                        Ok(formatted) => formatted,
                        Err(e) => {
                            warn!(request = request_number, error = %e, "formatter failed");
                            fallback_response(&context.user_query, &execution)
                        }
                    };
                    context.stage_results.response = Some(formatted);
                    context.state = QueryState::ResponseComplete;
                }

                Action::CallDomainHandler => {
                    let outcome = match self.stages.handler.handle(&context.user_query).await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            error!(request = request_number, error = %e, "domain handler failed");
                            HandlerOutcome::failed(
                                format!("Unable to process this request: {e}"),
                                format!("{e:#}"),
                            )
                        }
                    };
                    info!(
                        request = request_number,
                        success = outcome.success,
                        "domain handler complete"
                    );
                    context.stage_results.handler = Some(outcome);
                    context.state = QueryState::PricingComplete;
                }

                Action::AskClarification => {
                    let question = context
                        .stage_results
                        .planning
                        .as_ref()
                        .and_then(|p| p.clarification_question.clone())
                        .unwrap_or_else(|| "Could you provide more details?".to_string());

                    context.clarification_round += 1;
                    context
                        .clarification_history
                        .push(ClarificationExchange::new(&context.user_query, &question));

                    let key = resume_key
                        .map(str::to_string)
                        .unwrap_or_else(|| context.user_query.clone());
                    self.clarifications
                        .put(
                            &key,
                            SessionClarificationEntry {
                                original_query: context.clarification_history[0].query.clone(),
                                round: context.clarification_round,
                                history: context.clarification_history.clone(),
                            },
                        )
                        .await;

                    info!(
                        request = request_number,
                        key = %key,
                        round = context.clarification_round,
                        "waiting for user clarification"
                    );

                    let outcome = QueryOutcome {
                        success: false,
                        user_query: context.user_query.clone(),
                        artifact: None,
                        rows: Vec::new(),
                        display_text: question,
                        display: None,
                        metadata: OutcomeMetadata {
                            clarification: Some(PendingClarification {
                                key,
                                round: context.clarification_round,
                                max_rounds: self.guardrails.max_clarification_rounds,
                            }),
                            ..OutcomeMetadata::default()
                        },
                        trace: OrchestrationTrace {
                            iterations,
                            final_action: FinalAction::Action(Action::AskClarification),
                            decisions,
                        },
                    };
                    self.record_history(request_number, &outcome, true).await;
                    return outcome;
                }

                Action::GiveUp => {
                    warn!(request = request_number, reason = %decision.reason, "giving up");

                    if let Some(key) = resume_key {
                        self.clarifications.delete(key).await;
                    }

                    let max_rounds_reached = context.clarification_round
                        >= self.guardrails.max_clarification_rounds;
                    let execution = context.stage_results.execution.as_ref();

                    let display_text = if max_rounds_reached {
                        format!(
                            "I've asked for clarification {} times but still need more \
                             information. Please try rephrasing your question with more \
                             specific details.",
                            self.guardrails.max_clarification_rounds
                        )
                    } else if let Some(execution) = execution
                        && !execution.success
                    {
                        format!(
                            "Query execution failed: {}",
                            execution.metadata.error.as_deref().unwrap_or("Unknown error")
                        )
                    } else if decision.reason.is_empty() {
                        "Unable to process query".to_string()
                    } else {
                        decision.reason.clone()
                    };

                    let outcome = QueryOutcome {
                        success: false,
                        user_query: context.user_query.clone(),
                        artifact: execution.and_then(|e| e.artifact.clone()),
                        rows: Vec::new(),
                        display_text,
                        display: None,
                        metadata: OutcomeMetadata {
                            give_up_reason: Some(decision.reason.clone()),
                            max_rounds_reached,
                            ..OutcomeMetadata::default()
                        },
                        trace: OrchestrationTrace {
                            iterations,
                            final_action: FinalAction::Action(Action::GiveUp),
                            decisions,
                        },
                    };
                    self.record_history(request_number, &outcome, false).await;
                    return outcome;
                }

                Action::Complete => {
                    info!(request = request_number, "workflow complete");
                    context.completed = true;
                    context.state = QueryState::Completed;
                }
            }
        }

        if !context.completed {
            error!(
                request = request_number,
                iterations, "max iterations reached without completion"
            );
            // Any pending clarification entry stays untouched; no terminal
            // action was reached, so the thread may still be resumed.
            let outcome = QueryOutcome {
                success: false,
                user_query: context.user_query.clone(),
                artifact: None,
                rows: Vec::new(),
                display_text: "Workflow exceeded maximum iterations. Please try a simpler query."
                    .to_string(),
                display: None,
                metadata: OutcomeMetadata {
                    max_iterations_reached: true,
                    ..OutcomeMetadata::default()
                },
                trace: OrchestrationTrace {
                    iterations,
                    final_action: FinalAction::MaxIterations,
                    decisions,
                },
            };
            self.record_history(request_number, &outcome, false).await;
            return outcome;
        }

        // A completed loop is a terminal resolution for the thread.
        if let Some(key) = resume_key {
            self.clarifications.delete(key).await;
        }

        if let Some(handler) = &context.stage_results.handler
            && !handler.success
        {
            error!(request = request_number, "domain handler reported failure");
            let outcome = QueryOutcome {
                success: false,
                user_query: context.user_query.clone(),
                artifact: None,
                rows: Vec::new(),
                display_text: handler.display_text.clone(),
                display: None,
                metadata: OutcomeMetadata {
                    error: handler
                        .metadata
                        .get("error")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    ..OutcomeMetadata::default()
                },
                trace: OrchestrationTrace {
                    iterations,
                    final_action: FinalAction::HandlerFailed,
                    decisions,
                },
            };
            self.record_history(request_number, &outcome, false).await;
            return outcome;
        }

        let outcome = if let Some(handler) = context.stage_results.handler.take() {
            QueryOutcome {
                success: handler.success,
                user_query: context.user_query.clone(),
                artifact: None,
                rows: if handler.data.is_null() {
                    Vec::new()
                } else {
                    vec![handler.data]
                },
                display_text: handler.display_text,
                display: None,
                metadata: OutcomeMetadata::default(),
                trace: OrchestrationTrace {
                    iterations,
                    final_action: FinalAction::Action(Action::Complete),
                    decisions,
                },
            }
        } else {
            let execution = context.stage_results.execution.take();
            let response = context.stage_results.response.take();
            let display_text = response
                .as_ref()
                .map(|r| r.display_text.clone())
                .unwrap_or_else(|| {
                    "The workflow completed without producing a response.".to_string()
                });
            QueryOutcome {
                // COMPLETE without an execution attempt is a success; with
                // one, the execution's own flag decides.
                success: execution.as_ref().is_none_or(|e| e.success),
                user_query: context.user_query.clone(),
                artifact: execution.as_ref().and_then(|e| e.artifact.clone()),
                rows: execution.map(|e| e.rows).unwrap_or_default(),
                display_text,
                display: response,
                metadata: OutcomeMetadata::default(),
                trace: OrchestrationTrace {
                    iterations,
                    final_action: FinalAction::Action(Action::Complete),
                    decisions,
                },
            }
        };

        self.record_history(request_number, &outcome, false).await;
        outcome
    }

    fn record(
        iteration: u32,
        context: &OrchestrationContext,
        decision: &super::decision::Decision,
    ) -> DecisionRecord {
        DecisionRecord {
            iteration,
            state: context.state,
            action: decision.action,
            reason: decision.reason.clone(),
            clarification_round: context.clarification_round,
        }
    }

    async fn record_history(
        &self,
        request_number: u64,
        outcome: &QueryOutcome,
        clarification_pending: bool,
    ) {
        self.log
            .append(ConversationHistoryEntry {
                request_number,
                timestamp: Utc::now().to_rfc3339(),
                user_query: outcome.user_query.clone(),
                success: outcome.success,
                artifact: outcome.artifact.clone(),
                display_text: outcome.display_text.clone(),
                clarification_pending,
                iterations: outcome.trace.iterations,
                final_action: outcome.trace.final_action,
            })
            .await;
    }
}

/// Last-resort response when the formatter itself errors out.
fn fallback_response(user_query: &str, execution: &ExecutionOutcome) -> FormattedResponse {
    FormattedResponse {
        display_text: format!(
            "Results for '{user_query}' are ready, but formatting them failed."
        ),
        explanation: ResponseExplanation {
            summary: String::new(),
            reasoning_steps: Vec::new(),
            interpretation: String::new(),
            row_count: execution.metadata.row_count,
            execution_time: String::new(),
            bytes_processed: String::new(),
        },
    }
}
