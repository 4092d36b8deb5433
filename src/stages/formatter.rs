//! Formatting stage: turns execution results into user-facing prose.
//!
//! The LLM writes the headline answer; everything else in the response
//! (summary, reasoning steps, accounting strings) is derived locally so a
//! formatting outage degrades to plainer text instead of failing the query.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use super::{FormatRequest, FormattedResponse, ResponseExplanation, ResponseFormatter};
use crate::llm::{LlmClient, LlmRequest, PromptStore};

static JOIN_ON_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)ON\s+(\w+\.\w+)\s*=\s*(\w+\.\w+)").expect("valid regex"));
static COUNT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)COUNT\(([^)]+)\)").expect("valid regex"));
static SUM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)SUM\(([^)]+)\)").expect("valid regex"));
static AVG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)AVG\(([^)]+)\)").expect("valid regex"));
static GROUP_BY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)GROUP BY\s+([^\n]+?)(?:HAVING|ORDER|LIMIT|$)").expect("valid regex"));
static HAVING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)HAVING\s+([^\n]+?)(?:ORDER|LIMIT|$)").expect("valid regex"));
static ORDER_BY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)ORDER BY\s+([^\n]+?)(?:LIMIT|$)").expect("valid regex"));
static LIMIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)LIMIT\s+(\d+)").expect("valid regex"));

/// Gemini-backed response formatter.
pub struct GeminiFormatter {
    client: Arc<dyn LlmClient>,
    prompts: Arc<PromptStore>,
    model: String,
}

#[derive(Serialize)]
struct FormatterPromptContext<'a> {
    user_query: &'a str,
    sql: &'a str,
    sample_count: usize,
    total_rows: u64,
    sample_results: &'a str,
    execution_time: &'a str,
}

impl GeminiFormatter {
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

    async fn format_with_llm(
        &self,
        user_query: &str,
        sql: &str,
        rows: &[Value],
        total_rows: u64,
        execution_time: &str,
    ) -> Result<String> {
        let sample: Vec<&Value> = rows.iter().take(10).collect();
        let sample_results =
            serde_json::to_string_pretty(&sample).unwrap_or_else(|_| "[]".to_string());

        let prompt = self.prompts.render(
            "response_formatter",
            FormatterPromptContext {
                user_query,
                sql,
                sample_count: sample.len(),
                total_rows,
                sample_results: &sample_results,
                execution_time,
            },
        )?;

        let text = self
            .client
            .complete(LlmRequest::text(&self.model, prompt))
            .await?;
        Ok(text.trim().to_string())
    }
}

#[async_trait]
impl ResponseFormatter for GeminiFormatter {
    async fn format(&self, request: FormatRequest<'_>) -> Result<FormattedResponse> {
        let FormatRequest {
            user_query,
            execution,
            plan,
        } = request;

        let sql = execution.artifact.as_deref().unwrap_or("");
        let intent = plan
            .and_then(|p| p.get("intent"))
            .and_then(Value::as_str)
            .unwrap_or("Unknown query type");
        let tables: Vec<String> = plan
            .and_then(|p| p.get("tables_needed"))
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let execution_time = format_execution_time(execution.metadata.execution_time_ms);
        let bytes_processed = format_bytes(execution.metadata.bytes_processed);

        if execution.rows.is_empty() {
            info!(query = %user_query, "query returned no rows");
            return Ok(FormattedResponse {
                display_text: format!(
                    "I searched for data related to '{user_query}', but no results were found."
                ),
                explanation: ResponseExplanation {
                    summary: "The query executed successfully but returned no matching records. \
                              This could mean the filtering criteria were too restrictive or the \
                              requested data doesn't exist in the database."
                        .to_string(),
                    reasoning_steps: reasoning_steps(sql, &tables),
                    interpretation: format!("Query understood as: {intent}"),
                    row_count: 0,
                    execution_time,
                    bytes_processed,
                },
            });
        }

        let row_count = if execution.metadata.row_count == 0 {
            execution.rows.len() as u64
        } else {
            execution.metadata.row_count
        };

        let display_text = match self
            .format_with_llm(user_query, sql, &execution.rows, row_count, &execution_time)
            .await
        {
            Ok(text) if !text.is_empty() => text,
            Ok(_) => simple_format(user_query, &execution.rows, row_count),
            Err(e) => {
                warn!(error = %e, "LLM formatting failed, using fallback");
                simple_format(user_query, &execution.rows, row_count)
            }
        };

        Ok(FormattedResponse {
            display_text,
            explanation: ResponseExplanation {
                summary: detailed_explanation(sql, intent, &tables),
                reasoning_steps: reasoning_steps(sql, &tables),
                interpretation: format!("Query understood as: {intent}"),
                row_count,
                execution_time,
                bytes_processed,
            },
        })
    }
}

// ============================================================================
// Deterministic formatting helpers
// ============================================================================

fn value_display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Fallback formatting when the LLM is unavailable.
fn simple_format(user_query: &str, rows: &[Value], row_count: u64) -> String {
    // Single value result reads as one sentence
    if rows.len() == 1
        && let Some(obj) = rows[0].as_object()
        && obj.len() == 1
        && let Some((_, value)) = obj.iter().next()
    {
        return format!(
            "Based on your question '{user_query}', the result is: {}",
            value_display(value)
        );
    }

    let mut lines = vec![format!(
        "Based on your question '{user_query}', here are the results:\n"
    )];

    for (i, row) in rows.iter().take(10).enumerate() {
        let row_str = row
            .as_object()
            .map(|obj| {
                obj.iter()
                    .map(|(k, v)| format!("{k}: {}", value_display(v)))
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_else(|| value_display(row));
        lines.push(format!("{}. {row_str}", i + 1));
    }

    if row_count > 10 {
        lines.push(format!("\n... and {} more results", row_count - 10));
    }

    lines.push(format!("\n\nTotal results: {row_count}"));
    lines.join("\n")
}

/// One paragraph describing what the query did, derived from the SQL text.
fn detailed_explanation(sql: &str, intent: &str, tables: &[String]) -> String {
    let sql_upper = sql.to_uppercase();
    let mut parts = vec![format!("This query {}.", intent.to_lowercase())];

    if sql_upper.contains("JOIN") && tables.len() > 1 {
        parts.push(format!(
            "It utilizes a join pattern between {} tables from the system context to link related data.",
            tables.join(", ")
        ));
    }

    if sql_upper.contains("GROUP BY") {
        let agg = if sql_upper.contains("SUM") {
            "sum"
        } else if sql_upper.contains("AVG") {
            "average"
        } else if sql_upper.contains("COUNT") {
            "count"
        } else {
            "calculate"
        };
        parts.push(format!(
            "Then it aggregates the results to {agg} the relevant metrics per group."
        ));
    }

    if sql_upper.contains("HAVING") {
        parts.push("A HAVING clause filters the aggregated results based on business rules.".to_string());
    } else if sql_upper.contains("WHERE") {
        parts.push("The WHERE clause filters data based on specific criteria.".to_string());
    }

    if sql_upper.contains("ORDER BY") {
        if sql_upper.contains("DESC") {
            parts.push(
                "Results are sorted in descending order to show the highest values first."
                    .to_string(),
            );
        } else {
            parts.push("Results are sorted to present them in a logical order.".to_string());
        }
    }

    if let Some(caps) = LIMIT_RE.captures(sql) {
        parts.push(format!(
            "The output is limited to the top {} records as a best practice for exploratory queries.",
            &caps[1]
        ));
    }

    parts.join(" ")
}

/// Step-by-step breakdown of the SQL, clause by clause.
fn reasoning_steps(sql: &str, tables: &[String]) -> Vec<String> {
    let sql_upper = sql.to_uppercase();
    let mut steps = Vec::new();

    if sql_upper.contains("JOIN") && tables.len() > 1 {
        if JOIN_ON_RE.is_match(sql) {
            steps.push(format!(
                "Applied the {}↔{} join pattern using the foreign key relationship specified in the system context.",
                tables[0], tables[1]
            ));
        } else {
            steps.push(format!(
                "Joined {} tables based on their relationships in the schema.",
                tables.join(" and ")
            ));
        }
    }

    let mut agg_funcs = Vec::new();
    if let Some(caps) = COUNT_RE.captures(sql) {
        agg_funcs.push(format!("COUNT({})", &caps[1]));
    }
    if let Some(caps) = SUM_RE.captures(sql) {
        agg_funcs.push(format!("SUM({})", &caps[1]));
    }
    if let Some(caps) = AVG_RE.captures(sql) {
        agg_funcs.push(format!("AVG({})", &caps[1]));
    }
    if !agg_funcs.is_empty() {
        steps.push(format!(
            "Used {} aggregate function(s) to calculate the required metrics.",
            agg_funcs.join(", ")
        ));
    }

    if let Some(caps) = GROUP_BY_RE.captures(sql) {
        steps.push(format!(
            "Included a GROUP BY clause on {} because aggregate functions are used.",
            caps[1].trim()
        ));
    }

    if sql_upper.contains("HAVING") {
        if let Some(caps) = HAVING_RE.captures(sql) {
            steps.push(format!(
                "Applied a HAVING {} clause to filter aggregated results based on business rules.",
                caps[1].trim()
            ));
        }
    } else if sql_upper.contains("WHERE") {
        steps.push("Applied WHERE clause to filter data based on specified criteria.".to_string());
    }

    if let Some(caps) = ORDER_BY_RE.captures(sql) {
        steps.push(format!(
            "Added ORDER BY {} to present results in the most relevant order.",
            caps[1].trim()
        ));
    }

    if let Some(caps) = LIMIT_RE.captures(sql) {
        steps.push(format!(
            "Set LIMIT {} as a best practice for exploratory queries.",
            &caps[1]
        ));
    }

    if steps.is_empty() {
        steps.push("Executed a straightforward query against the database.".to_string());
    }
    steps
}

fn format_execution_time(elapsed_ms: u64) -> String {
    format!("{:.3}s", elapsed_ms as f64 / 1000.0)
}

/// Human-readable data volume, megabytes up to a gigabyte.
fn format_bytes(bytes: u64) -> String {
    if bytes == 0 {
        return "0.00MB".to_string();
    }

    let mb = bytes as f64 / (1024.0 * 1024.0);
    if mb < 0.01 {
        "0.00MB".to_string()
    } else if mb < 1.0 {
        format!("{mb:.2}MB")
    } else if mb < 1024.0 {
        format!("{mb:.1}MB")
    } else {
        format!("{:.2}GB", mb / 1024.0)
    }
}
