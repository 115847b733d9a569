use std::path::Path;

use chrono::DateTime;
use chrono::Utc;
use ironcurtain_policy::PolicyDecision;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::error;

use crate::escalation::EscalationOutcome;
use crate::redaction::Redactor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Success,
    Error,
    Denied,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditResult {
    pub status: AuditStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<serde_json::Value>,
}

/// One line of `audit.jsonl`: the complete record of a mediated tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub server_name: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub policy_decision: PolicyDecision,
    pub result: AuditResult,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_result: Option<EscalationOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandboxed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_approved: Option<bool>,
}

/// Append-only JSONL audit writer. Entries are handed to a dedicated writer
/// task over an unbounded channel, so the request path never waits on disk;
/// write failures are logged and dropped, never propagated into a request.
pub struct AuditLog {
    tx: mpsc::UnboundedSender<AuditEntry>,
    writer: JoinHandle<()>,
}

impl AuditLog {
    /// Open (append) the log file and start the writer task. When `redact` is
    /// set, argument and result values pass through pattern substitution;
    /// metadata fields are never modified.
    pub async fn new(path: &Path, redact: bool) -> std::io::Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        let redactor = redact.then(Redactor::new);
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditEntry>();

        let writer = tokio::spawn(async move {
            let mut file = file;
            while let Some(mut entry) = rx.recv().await {
                if let Some(redactor) = &redactor {
                    redact_entry(redactor, &mut entry);
                }
                let line = match serde_json::to_string(&entry) {
                    Ok(line) => line,
                    Err(e) => {
                        error!("failed to serialize audit entry: {e}");
                        continue;
                    }
                };
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    error!("failed to write audit entry: {e}");
                    continue;
                }
                if let Err(e) = file.write_all(b"\n").await {
                    error!("failed to write audit entry: {e}");
                    continue;
                }
                if let Err(e) = file.flush().await {
                    error!("failed to flush audit log: {e}");
                }
            }
        });

        Ok(Self { tx, writer })
    }

    pub fn append(&self, entry: AuditEntry) {
        if self.tx.send(entry).is_err() {
            error!("audit writer task is gone; dropping entry");
        }
    }

    /// Close the channel and wait for the writer to drain and flush.
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(e) = self.writer.await {
            error!("audit writer task failed: {e}");
        }
    }
}

fn redact_entry(redactor: &Redactor, entry: &mut AuditEntry) {
    entry.arguments = redactor.redact_value(&entry.arguments);
    if let Some(content) = &entry.result.content {
        entry.result.content = Some(redactor.redact_value(content));
    }
    if let Some(error) = &entry.result.error {
        entry.result.error = Some(redactor.redact_str(error));
    }
}
