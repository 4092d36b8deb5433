//! Execution stage: generates SQL from a plan and runs it on a backend.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info};

use super::{ExecutionMetadata, ExecutionOutcome, Executor};
use crate::llm::{LlmClient, LlmRequest, PromptStore};

// ============================================================================
// Data Backend
// ============================================================================

/// Rows and accounting returned by a backend run. `rows` may be a sample;
/// `total_rows` is authoritative.
#[derive(Debug, Clone, Default)]
pub struct BackendResult {
    pub rows: Vec<Value>,
    pub total_rows: u64,
    pub bytes_processed: u64,
}

/// Something that can run SQL: a warehouse connection in production, a
/// canned table in tests.
#[async_trait]
pub trait DataBackend: Send + Sync {
    async fn run(&self, sql: &str) -> Result<BackendResult>;
}

// ============================================================================
// Gemini Executor
// ============================================================================

/// Gemini-backed executor. Generation or execution failures come back as
/// failed outcomes, never as errors; the loop decides whether to retry.
///
/// Without a backend the executor runs in artifact-only mode: the generated
/// SQL is the result and no rows are produced.
pub struct GeminiExecutor {
    client: Arc<dyn LlmClient>,
    prompts: Arc<PromptStore>,
    model: String,
    schema_context: String,
    backend: Option<Arc<dyn DataBackend>>,
}

#[derive(Serialize)]
struct SqlPromptContext<'a> {
    schema_context: &'a str,
    intent: &'a str,
    tables_needed: String,
    operations: String,
    user_query: &'a str,
}

impl GeminiExecutor {
    pub fn new(
        client: Arc<dyn LlmClient>,
        prompts: Arc<PromptStore>,
        model: impl Into<String>,
        schema_context: impl Into<String>,
        backend: Option<Arc<dyn DataBackend>>,
    ) -> Self {
        Self {
            client,
            prompts,
            model: model.into(),
            schema_context: schema_context.into(),
            backend,
        }
    }

    async fn generate_sql(&self, user_query: &str, plan: &Value) -> Result<Option<String>> {
        let intent = plan
            .get("intent")
            .and_then(Value::as_str)
            .unwrap_or("Unknown");

        let tables: Vec<&str> = plan
            .get("tables_needed")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        let tables_needed = if tables.is_empty() {
            "Not specified".to_string()
        } else {
            tables.join(", ")
        };

        let operations = plan
            .get("operations")
            .map(|ops| serde_json::to_string_pretty(ops).unwrap_or_default())
            .unwrap_or_default();

        let prompt = self.prompts.render(
            "sql_generation",
            SqlPromptContext {
                schema_context: &self.schema_context,
                intent,
                tables_needed,
                operations,
                user_query,
            },
        )?;

        let raw = match self
            .client
            .complete(LlmRequest::text(&self.model, prompt))
            .await
        {
            Ok(text) => text,
            Err(e) => {
                error!(error = %e, "SQL generation call failed");
                return Ok(None);
            }
        };

        let sql = clean_sql(&raw);
        if sql.len() < 10 {
            error!("generated SQL is empty or too short");
            return Ok(None);
        }

        debug!(sql = %sql, "SQL generated");
        Ok(Some(sql))
    }
}

#[async_trait]
impl Executor for GeminiExecutor {
    async fn execute(&self, user_query: &str, plan: &Value) -> Result<ExecutionOutcome> {
        info!(query = %user_query, "executing plan");

        let Some(sql) = self.generate_sql(user_query, plan).await? else {
            return Ok(ExecutionOutcome::failed("SQL generation failed"));
        };

        let Some(backend) = &self.backend else {
            return Ok(ExecutionOutcome {
                success: true,
                artifact: Some(sql),
                rows: Vec::new(),
                metadata: ExecutionMetadata::default(),
            });
        };

        let started = Instant::now();
        match backend.run(&sql).await {
            Ok(result) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                info!(
                    rows = result.total_rows,
                    elapsed_ms, "query executed successfully"
                );
                Ok(ExecutionOutcome {
                    success: true,
                    artifact: Some(sql),
                    metadata: ExecutionMetadata {
                        row_count: result.total_rows,
                        execution_time_ms: elapsed_ms,
                        bytes_processed: result.bytes_processed,
                        error: None,
                    },
                    rows: result.rows,
                })
            }
            Err(e) => {
                error!(error = %e, "query execution failed");
                Ok(ExecutionOutcome {
                    success: false,
                    artifact: Some(sql),
                    rows: Vec::new(),
                    metadata: ExecutionMetadata {
                        execution_time_ms: started.elapsed().as_millis() as u64,
                        error: Some(format!("{e:#}")),
                        ..ExecutionMetadata::default()
                    },
                })
            }
        }
    }
}

/// Strip markdown fences and comment lines from generated SQL.
fn clean_sql(raw: &str) -> String {
    let mut sql = raw.trim().to_string();

    if sql.starts_with("```sql") {
        sql = sql.replace("```sql", "").replace("```", "");
    } else if sql.starts_with("```") {
        sql = sql.replace("```", "");
    }

    sql.lines()
        .filter(|line| {
            let stripped = line.trim();
            !stripped.is_empty() && !stripped.starts_with('#') && !stripped.starts_with("--")
        })
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}
