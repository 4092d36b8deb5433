pub mod action;
pub mod context;
pub mod decision;
pub mod engine;
pub mod guardrails;
pub mod oracle;
pub mod session;

// Vocabulary exports
pub use action::{Action, QueryState};
pub use decision::{Decision, parse_decision};

// Loop-context exports
pub use context::{
    ClarificationExchange, DecisionRecord, FinalAction, OrchestrationContext, OrchestrationTrace,
    StageResults,
};
pub use guardrails::{GuardrailBreach, Guardrails};

// Oracle exports
pub use oracle::{ContextSnapshot, DecisionOracle, GeminiOracle};

// Session exports
pub use session::{
    ClarificationStore, ConversationHistoryEntry, ConversationLog, EngineStats,
    SessionClarificationEntry,
};

// Engine exports
pub use engine::{
    OrchestratorOptions, OutcomeMetadata, PendingClarification, QueryOrchestrator, QueryOutcome,
};
