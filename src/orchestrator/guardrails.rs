//! Guardrails - hard limits enforced outside the oracle.
//!
//! The decision oracle chooses what happens next, but it cannot bypass the
//! limits here. The iteration ceiling ends a request outright; the
//! clarification cap converts a further `ASK_CLARIFICATION` into `GIVE_UP`
//! before dispatch. Both checks run in the loop on every pass, regardless
//! of what the oracle asked for.

// Re-export from config for convenience
pub use crate::config::LimitsConfig;

// ============================================================================
// Breaches
// ============================================================================

/// Limit breaches detected by the loop. Neither can be overridden by a
/// decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardrailBreach {
    /// Iteration ceiling reached before the workflow completed
    MaxIterationsExceeded { iterations: u32, limit: u32 },
    /// Clarification round cap reached, no further question may be asked
    MaxClarificationRoundsExceeded { round: u32, limit: u32 },
}

// ============================================================================
// Guardrails Configuration
// ============================================================================

/// Numeric limits with check methods. Messaging for a breach is the loop's
/// business; this struct only detects.
#[derive(Debug, Clone)]
pub struct Guardrails {
    /// Maximum decision iterations per request
    pub max_iterations: u32,
    /// Maximum clarification questions per thread
    pub max_clarification_rounds: u32,
}

impl Default for Guardrails {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_clarification_rounds: 3,
        }
    }
}

impl Guardrails {
    /// Create guardrails from configuration.
    pub fn from_config(config: &LimitsConfig) -> Self {
        Self {
            max_iterations: config.max_iterations,
            max_clarification_rounds: config.max_clarification_rounds,
        }
    }

    /// Check before starting another decision iteration. `iterations` is the
    /// number already completed.
    pub fn check_iteration(&self, iterations: u32) -> Result<(), GuardrailBreach> {
        if iterations >= self.max_iterations {
            return Err(GuardrailBreach::MaxIterationsExceeded {
                iterations,
                limit: self.max_iterations,
            });
        }
        Ok(())
    }

    /// Check before dispatching a clarification question. `round` is the
    /// number of questions already asked in this thread.
    pub fn check_clarification_round(&self, round: u32) -> Result<(), GuardrailBreach> {
        if round >= self.max_clarification_rounds {
            return Err(GuardrailBreach::MaxClarificationRoundsExceeded {
                round,
                limit: self.max_clarification_rounds,
            });
        }
        Ok(())
    }
}
