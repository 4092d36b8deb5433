pub mod audit;
pub mod config;
pub mod llm;
pub mod orchestrator;
pub mod stages;

// Re-export main types
pub use audit::RequestLog;
pub use config::EngineConfig;
pub use orchestrator::{
    Action, DecisionOracle, EngineStats, GeminiOracle, Guardrails, OrchestratorOptions,
    QueryOrchestrator, QueryOutcome, QueryState,
};
pub use stages::{
    DataBackend, DomainHandler, Executor, GeminiExecutor, GeminiFormatter, GeminiPlanner,
    GeminiPricingHandler, Planner, ResponseFormatter, StageSet,
};

// Re-export LLM transport
pub use llm::{GeminiClient, GeminiClientConfig, LlmClient, LlmError, LlmRequest, PromptStore};
