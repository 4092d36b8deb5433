//! Decision parsing for the oracle adapter boundary.
//!
//! The decision model replies with text that should contain a JSON object
//! like `{"action": "CALL_PLANNER", "reason": "..."}`. Parsing tolerates
//! prose and code fences around the object. Nothing in here returns an
//! error: every malformed shape degrades to a GIVE_UP decision carrying the
//! failure in its reason, so a flaky decision model stops the workflow
//! gracefully instead of crashing it.

use serde::Deserialize;
use serde_json::Value;

use super::action::Action;
use crate::llm::extract_json_block;

/// A single routing decision.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub action: Action,
    /// Audit text only; never drives control flow.
    pub reason: String,
    /// Optional payload from the decision model. Advisory only: dispatch
    /// inputs are re-derived from stage results, not from here.
    pub parameters: Option<Value>,
}

impl Decision {
    pub fn new(action: Action, reason: impl Into<String>) -> Self {
        Self {
            action,
            reason: reason.into(),
            parameters: None,
        }
    }

    pub fn give_up(reason: impl Into<String>) -> Self {
        Self::new(Action::GiveUp, reason)
    }
}

/// Wire shape emitted by the decision model. `next_state` is accepted here
/// and dropped: state transitions belong to the dispatch handlers.
#[derive(Debug, Deserialize)]
struct RawDecision {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    parameters: Option<Value>,
    #[serde(default)]
    #[allow(dead_code)]
    next_state: Option<String>,
}

/// Parse the decision model's textual response into a `Decision`.
pub fn parse_decision(text: &str) -> Decision {
    let Some(json) = extract_json_block(text) else {
        return Decision::give_up(
            "Orchestration error: could not parse a decision from the response (no JSON found)",
        );
    };

    let raw: RawDecision = match serde_json::from_str(json) {
        Ok(raw) => raw,
        Err(e) => {
            return Decision::give_up(format!(
                "Orchestration error: could not parse decision JSON: {}",
                e
            ));
        }
    };

    let Some(action_str) = raw.action else {
        return Decision::give_up(
            "Orchestration error: decision parse failed, missing 'action' field",
        );
    };

    let Some(action) = Action::parse(&action_str) else {
        return Decision::give_up(format!("Invalid action: {}", action_str));
    };

    Decision {
        action,
        reason: raw.reason.unwrap_or_default(),
        parameters: raw.parameters,
    }
}
