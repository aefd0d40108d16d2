use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use redraft_core::event::EventBus;
use redraft_core::types::{RunId, WorkflowEvent};

/// JSONL runtime logger.
///
/// Writes one JSON object per line for every event of a single run. Lines are
/// flushed as they are written, so a crashed run keeps everything logged
/// before the crash.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    run_id: String,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    step: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// Logs go to `{log_dir}/{run_id}/{timestamp}.jsonl`.
    /// `level`: 1 = run summary, 2 = per node, 3 = per attempt.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Subscribe now and write in a background task until the run completes
    /// or fails, or every publisher is gone. Events published after this
    /// returns are never missed.
    ///
    /// A cancelled run still ends with `RunError`, so the logger has no
    /// cancellation of its own.
    pub fn spawn(self, event_bus: &EventBus, run_id: RunId) -> JoinHandle<Option<PathBuf>> {
        let rx = event_bus.subscribe();
        tokio::spawn(self.write_events(rx, run_id))
    }

    async fn write_events(
        self,
        mut rx: broadcast::Receiver<WorkflowEvent>,
        run_id: RunId,
    ) -> Option<PathBuf> {
        let run_dir = self.log_dir.join(run_id.as_str());
        if let Err(e) = tokio::fs::create_dir_all(&run_dir).await {
            error!(error = %e, "Failed to create log directory");
            return None;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = run_dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return None;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");
        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            match rx.recv().await {
                Ok(event) => {
                    if event.run_id() != &run_id {
                        continue;
                    }
                    if let Some(entry) = self.event_to_entry(&event) {
                        if let Ok(json) = serde_json::to_string(&entry) {
                            let line = format!("{}\n", json);
                            if let Err(e) = writer.write_all(line.as_bytes()).await {
                                error!(error = %e, "Failed to write log entry");
                                break;
                            }
                            if let Err(e) = writer.flush().await {
                                error!(error = %e, "Failed to flush log");
                            }
                        }
                    }
                    if matches!(event, WorkflowEvent::RunComplete { .. } | WorkflowEvent::RunError { .. }) {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "RunLogger lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("EventBus closed, RunLogger stopping");
                    break;
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
        Some(log_path)
    }

    /// Convert an event to a log entry, or None if filtered by level.
    fn event_to_entry(&self, event: &WorkflowEvent) -> Option<LogEntry> {
        let entry = |event_type: &str, step: Option<usize>, detail: Option<serde_json::Value>| LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            run_id: event.run_id().to_string(),
            event_type: event_type.to_string(),
            step,
            detail,
        };

        match event {
            // L1
            WorkflowEvent::RunStarted { durable, .. } => Some(entry(
                "run_started",
                None,
                Some(serde_json::json!({ "durable": durable })),
            )),
            WorkflowEvent::RunComplete {
                steps,
                revision_number,
                ..
            } => Some(entry(
                "run_complete",
                Some(*steps),
                Some(serde_json::json!({ "revision_number": revision_number })),
            )),
            WorkflowEvent::RunError { error, .. } => Some(entry(
                "run_error",
                None,
                Some(serde_json::json!({ "error": error })),
            )),

            // L2
            WorkflowEvent::NodeCompleted {
                step,
                node_id,
                elapsed_ms,
                revision_number,
                ..
            } if self.level >= 2 => Some(entry(
                "node_completed",
                Some(*step),
                Some(serde_json::json!({
                    "node_id": node_id,
                    "elapsed_ms": elapsed_ms,
                    "revision_number": revision_number,
                })),
            )),
            WorkflowEvent::UnitReplayed { unit_id, .. } if self.level >= 2 => Some(entry(
                "unit_replayed",
                None,
                Some(serde_json::json!({ "unit_id": unit_id })),
            )),

            // L3
            WorkflowEvent::NodeStarted { step, node_id, .. } if self.level >= 3 => Some(entry(
                "node_started",
                Some(*step),
                Some(serde_json::json!({ "node_id": node_id })),
            )),
            WorkflowEvent::UnitRetrying {
                unit_id,
                attempt,
                backoff_ms,
                error,
                ..
            } if self.level >= 3 => Some(entry(
                "unit_retrying",
                None,
                Some(serde_json::json!({
                    "unit_id": unit_id,
                    "attempt": attempt,
                    "backoff_ms": backoff_ms,
                    "error": truncate_str(error, 200),
                })),
            )),

            _ => None,
        }
    }
}

fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
