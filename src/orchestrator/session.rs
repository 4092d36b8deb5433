//! Session-scoped stores: pending clarification threads and request history.
//!
//! Both stores are in-memory and shared by reference across requests. A
//! clarification entry exists exactly while its question is unanswered;
//! terminal resolution deletes it. The conversation log is append-only and
//! feeds the oracle's recent-history window and the stats report.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use super::context::{ClarificationExchange, FinalAction};

// ============================================================================
// Clarification Store
// ============================================================================

/// Stored state of one unanswered clarification thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClarificationEntry {
    /// The query that opened the thread, before any answers arrived.
    pub original_query: String,
    /// Questions asked so far in this thread.
    pub round: u32,
    pub history: Vec<ClarificationExchange>,
}

/// Pending clarification threads keyed by clarification key.
///
/// Uses RwLock for the maps (many reads, few writes) and a per-key Mutex so
/// concurrent answers to the same thread serialize instead of interleaving.
pub struct ClarificationStore {
    entries: RwLock<HashMap<String, SessionClarificationEntry>>,
    gates: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl ClarificationStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            gates: RwLock::new(HashMap::new()),
        }
    }

    /// Snapshot of a pending thread, if one exists for the key.
    pub async fn get(&self, key: &str) -> Option<SessionClarificationEntry> {
        let entries = self.entries.read().await;
        entries.get(key).cloned()
    }

    /// Insert or replace the thread for a key.
    pub async fn put(&self, key: &str, entry: SessionClarificationEntry) {
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), entry);
    }

    /// Delete a resolved thread and its gate.
    pub async fn delete(&self, key: &str) -> Option<SessionClarificationEntry> {
        let removed = {
            let mut entries = self.entries.write().await;
            entries.remove(key)
        };
        let mut gates = self.gates.write().await;
        gates.remove(key);
        removed
    }

    pub async fn contains(&self, key: &str) -> bool {
        let entries = self.entries.read().await;
        entries.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        let entries = self.entries.read().await;
        entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop every pending thread.
    pub async fn clear(&self) {
        let mut entries = self.entries.write().await;
        entries.clear();
        drop(entries);
        let mut gates = self.gates.write().await;
        gates.clear();
    }

    /// Serialization gate for a key, created on first use.
    pub async fn gate(&self, key: &str) -> Arc<Mutex<()>> {
        // First, try to get an existing gate with read lock
        {
            let gates = self.gates.read().await;
            if let Some(gate) = gates.get(key) {
                return Arc::clone(gate);
            }
        }

        // Not found, acquire write lock and create
        let mut gates = self.gates.write().await;
        // Double-check in case another task created it
        if let Some(gate) = gates.get(key) {
            return Arc::clone(gate);
        }

        let gate = Arc::new(Mutex::new(()));
        gates.insert(key.to_string(), Arc::clone(&gate));
        gate
    }
}

impl Default for ClarificationStore {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Conversation Log
// ============================================================================

/// One finished request turn, pending clarifications included.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationHistoryEntry {
    pub request_number: u64,
    pub timestamp: String,
    pub user_query: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    pub display_text: String,
    pub clarification_pending: bool,
    pub iterations: u32,
    pub final_action: FinalAction,
}

/// Aggregate counters over the log. `total_requests` counts every turn,
/// clarification answers included, so pending turns show up as failures
/// until their thread resolves.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub success_rate: f64,
}

struct LogInner {
    entries: Vec<ConversationHistoryEntry>,
    request_count: u64,
}

/// Append-only request history for one engine instance.
pub struct ConversationLog {
    inner: RwLock<LogInner>,
}

impl ConversationLog {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(LogInner {
                entries: Vec::new(),
                request_count: 0,
            }),
        }
    }

    /// Claim the next request number. Every turn gets one, even turns that
    /// end in a clarification question.
    pub async fn next_request_number(&self) -> u64 {
        let mut inner = self.inner.write().await;
        inner.request_count += 1;
        inner.request_count
    }

    pub async fn append(&self, entry: ConversationHistoryEntry) {
        let mut inner = self.inner.write().await;
        inner.entries.push(entry);
    }

    /// The last `n` turns, oldest first.
    pub async fn recent(&self, n: usize) -> Vec<ConversationHistoryEntry> {
        let inner = self.inner.read().await;
        let start = inner.entries.len().saturating_sub(n);
        inner.entries[start..].to_vec()
    }

    pub async fn len(&self) -> usize {
        let inner = self.inner.read().await;
        inner.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> EngineStats {
        let inner = self.inner.read().await;
        let successful = inner.entries.iter().filter(|e| e.success).count() as u64;
        let total = inner.request_count;
        EngineStats {
            total_requests: total,
            successful_requests: successful,
            failed_requests: total - successful,
            success_rate: if total == 0 {
                0.0
            } else {
                successful as f64 / total as f64
            },
        }
    }

    /// Drop all history and zero the request counter.
    pub async fn reset(&self) {
        let mut inner = self.inner.write().await;
        inner.entries.clear();
        inner.request_count = 0;
    }
}

impl Default for ConversationLog {
    fn default() -> Self {
        Self::new()
    }
}
