//! Per-run request audit log.
//!
//! Each engine run gets one plain-text log file under the logs directory;
//! files from earlier runs move into `archive/` at startup. Entries are
//! derived from the trace a finished request returns, so the audit layer
//! never reaches into the loop. Append failures degrade to a warning: a
//! broken log file must not take query processing down with it.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::orchestrator::QueryOutcome;

const DIVIDER: &str =
    "================================================================================";

/// Append-only audit log for one engine run.
pub struct RequestLog {
    session_id: String,
    log_file: PathBuf,
    counter: Mutex<u32>,
}

impl RequestLog {
    /// Set up the logs directory, archive leftovers from previous runs, and
    /// open a fresh session file.
    pub async fn create(logs_dir: &Path) -> Result<Self> {
        fs::create_dir_all(logs_dir)
            .await
            .context("Failed to create logs directory")?;
        let archive_dir = logs_dir.join("archive");
        fs::create_dir_all(&archive_dir)
            .await
            .context("Failed to create logs archive directory")?;

        archive_existing_logs(logs_dir, &archive_dir).await;

        let run_timestamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let session_id = format!("session_{run_timestamp}");
        let log_file = logs_dir.join(format!("query_pilot_{run_timestamp}.log"));

        let header = format!(
            "Query Pilot Request Log\nRun Started: {}\nSession ID: {}\n{}\n\n",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            session_id,
            DIVIDER
        );
        fs::write(&log_file, header)
            .await
            .context("Failed to initialize request log file")?;
        info!("Request log at {:?}", log_file);

        Ok(Self {
            session_id,
            log_file,
            counter: Mutex::new(0),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Record an incoming query and claim a request id for it.
    pub async fn start_request(&self, user_query: &str) -> String {
        let number = {
            let mut counter = self.counter.lock().await;
            *counter += 1;
            *counter
        };
        let request_id = format!(
            "req_{}_{:03}",
            Local::now().format("%Y%m%d_%H%M%S"),
            number
        );

        let entry = format!(
            "\n{}\n{} [REQUEST_START] {}\n    session: {}\n    query: \"{}\"\n{}\n",
            DIVIDER,
            timestamp(),
            request_id,
            self.session_id,
            user_query,
            DIVIDER
        );
        self.append(&entry).await;
        request_id
    }

    /// Record the decision trace and completion summary of a finished request.
    pub async fn log_outcome(&self, request_id: &str, outcome: &QueryOutcome) {
        let mut entry = String::new();

        for decision in &outcome.trace.decisions {
            entry.push_str(&format!(
                "{} [DECISION] {} iteration {}: [{}] -> {}",
                timestamp(),
                request_id,
                decision.iteration,
                decision.state,
                decision.action
            ));
            if !decision.reason.is_empty() {
                entry.push_str(&format!(" ({})", decision.reason));
            }
            entry.push('\n');
        }

        let status = if outcome.success {
            "SUCCESS"
        } else if outcome.is_clarification() {
            "CLARIFICATION_PENDING"
        } else {
            "FAILED"
        };
        entry.push_str(&format!(
            "{} [REQUEST_COMPLETE] {}\n    status: {}\n    final action: {}\n    iterations: {}\n",
            timestamp(),
            request_id,
            status,
            outcome.trace.final_action,
            outcome.trace.iterations
        ));
        if let Some(artifact) = &outcome.artifact {
            entry.push_str(&format!("    artifact: {}\n", artifact.replace('\n', " ")));
        }
        entry.push_str(&format!(
            "    response: {}\n",
            truncate(&outcome.display_text, 200)
        ));

        self.append(&entry).await;
    }

    async fn append(&self, content: &str) {
        // Hold the counter lock so concurrent entries never interleave
        let _guard = self.counter.lock().await;
        let result = async {
            let mut file = fs::OpenOptions::new()
                .append(true)
                .open(&self.log_file)
                .await?;
            file.write_all(content.as_bytes()).await?;
            Ok::<(), std::io::Error>(())
        }
        .await;

        if let Err(e) = result {
            warn!("Could not append to request log: {}", e);
        }
    }
}

/// Move `*.log` files left over from previous runs into the archive
/// directory. Failures only warn; an unarchivable file never blocks startup.
async fn archive_existing_logs(logs_dir: &Path, archive_dir: &Path) {
    let mut entries = match fs::read_dir(logs_dir).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Could not scan logs directory for archiving: {}", e);
            return;
        }
    };

    let mut archived = 0usize;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("log") {
            continue;
        }

        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let mut target = archive_dir.join(name);
        if target.exists() {
            // Already archived under this name once; disambiguate
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("log");
            target = archive_dir.join(format!(
                "{}_archived_{}.log",
                stem,
                Local::now().format("%H%M%S")
            ));
        }

        match fs::rename(&path, &target).await {
            Ok(()) => archived += 1,
            Err(e) => warn!("Could not archive log file {:?}: {}", path, e),
        }
    }

    if archived > 0 {
        info!("Archived {} log file(s) into {:?}", archived, archive_dir);
    }
}

fn timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
