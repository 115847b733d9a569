use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::warn;
use uuid::Uuid;

use crate::flags::ESCALATION_POLL_INTERVAL_MS;

/// Hard bounds on how long a tool call may stay suspended.
const MIN_ESCALATION_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_ESCALATION_TIMEOUT: Duration = Duration::from_secs(600);

/// Clamp an operator-configured escalation timeout into the supported range.
pub fn clamp_escalation_timeout(timeout: Duration) -> Duration {
    timeout.clamp(MIN_ESCALATION_TIMEOUT, MAX_ESCALATION_TIMEOUT)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationOutcome {
    Approved,
    Denied,
    #[serde(rename = "timeout")]
    TimedOut,
}

/// Body of `request-<id>.json`, consumed by the session layer's approval UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationRequest {
    pub escalation_id: String,
    pub request_id: String,
    pub server_name: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub reason: String,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EscalationResponse {
    decision: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExpiryNotice {
    escalation_id: String,
    expired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserContext {
    #[serde(default)]
    message: Option<String>,
}

/// File-based request/response IPC with the session layer. The proxy writes
/// `request-<id>.json` atomically and polls for `response-<id>.json` until a
/// decision arrives or the timeout expires; an expired wait leaves an
/// `expired-<id>.json` notice so the session layer can clear its pending UI.
///
/// The directory is reachable only from the session and the proxy, never from
/// the agent sandbox, which is what makes the file names unforgeable from the
/// agent's perspective.
pub struct EscalationChannel {
    dir: PathBuf,
    timeout: Duration,
}

impl EscalationChannel {
    pub fn new(dir: PathBuf, timeout: Duration) -> Self {
        Self { dir, timeout }
    }

    /// Suspend until the human decides or the timeout expires. I/O problems
    /// writing the request surface as `Err`; the caller treats them as a
    /// denial.
    pub async fn escalate(&self, request: &EscalationRequest) -> std::io::Result<EscalationOutcome> {
        let request_path = self.dir.join(format!("request-{}.json", request.escalation_id));
        let response_path = self
            .dir
            .join(format!("response-{}.json", request.escalation_id));
        write_atomically(&self.dir, &request_path, request)?;
        debug!(
            "escalation {} written, waiting up to {:?}",
            request.escalation_id, self.timeout
        );

        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            if let Some(outcome) = read_response(&response_path) {
                return Ok(outcome);
            }
            if tokio::time::Instant::now() >= deadline {
                self.write_expiry_notice(&request.escalation_id);
                return Ok(EscalationOutcome::TimedOut);
            }
            tokio::time::sleep(*ESCALATION_POLL_INTERVAL_MS).await;
        }
    }

    /// The user's most recent message, written by the session layer at the
    /// start of each turn. Missing, empty or malformed reads are `None`.
    pub fn read_user_context(&self) -> Option<String> {
        let raw = std::fs::read_to_string(self.dir.join("user-context.json")).ok()?;
        let context: UserContext = serde_json::from_str(&raw).ok()?;
        context.message.filter(|m| !m.is_empty())
    }

    pub fn fresh_escalation_id() -> String {
        Uuid::new_v4().to_string()
    }

    fn write_expiry_notice(&self, escalation_id: &str) {
        let notice = ExpiryNotice {
            escalation_id: escalation_id.to_string(),
            expired_at: Utc::now(),
        };
        let path = self.dir.join(format!("expired-{escalation_id}.json"));
        if let Err(e) = write_atomically(&self.dir, &path, &notice) {
            warn!("failed to write expiry notice for {escalation_id}: {e}");
        }
    }
}

/// `None` while the file is absent or not yet fully written; polling retries
/// until a complete response parses.
fn read_response(path: &Path) -> Option<EscalationOutcome> {
    let raw = std::fs::read_to_string(path).ok()?;
    let response: EscalationResponse = serde_json::from_str(&raw).ok()?;
    if response.decision == "approved" {
        Some(EscalationOutcome::Approved)
    } else {
        Some(EscalationOutcome::Denied)
    }
}

/// Write-temp-then-rename so a reader can never observe a partial request.
fn write_atomically<T: Serialize>(dir: &Path, path: &Path, value: &T) -> std::io::Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, value).map_err(std::io::Error::other)?;
    tmp.write_all(b"\n")?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn request(id: &str) -> EscalationRequest {
        EscalationRequest {
            escalation_id: id.to_string(),
            request_id: "req-1".to_string(),
            server_name: "fs".to_string(),
            tool_name: "write_file".to_string(),
            arguments: json!({"path": "/etc/x.txt"}),
            reason: "write outside the sandbox".to_string(),
            requested_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn approval_resolves_the_wait() {
        let dir = tempfile::tempdir().unwrap();
        let channel = EscalationChannel::new(dir.path().to_path_buf(), Duration::from_secs(5));
        let response_path = dir.path().join("response-esc-1.json");

        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            std::fs::write(&response_path, r#"{"decision": "approved"}"#).unwrap();
        });

        let outcome = channel.escalate(&request("esc-1")).await.unwrap();
        assert_eq!(outcome, EscalationOutcome::Approved);
        writer.await.unwrap();
        assert!(dir.path().join("request-esc-1.json").exists());
    }

    #[tokio::test]
    async fn unknown_response_bodies_count_as_denied() {
        let dir = tempfile::tempdir().unwrap();
        let channel = EscalationChannel::new(dir.path().to_path_buf(), Duration::from_secs(5));
        std::fs::write(
            dir.path().join("response-esc-2.json"),
            r#"{"decision": "maybe later"}"#,
        )
        .unwrap();
        let outcome = channel.escalate(&request("esc-2")).await.unwrap();
        assert_eq!(outcome, EscalationOutcome::Denied);
    }

    #[tokio::test]
    async fn timeout_leaves_an_expiry_notice() {
        let dir = tempfile::tempdir().unwrap();
        let channel = EscalationChannel::new(dir.path().to_path_buf(), Duration::from_millis(100));
        let outcome = channel.escalate(&request("esc-3")).await.unwrap();
        assert_eq!(outcome, EscalationOutcome::TimedOut);
        assert!(dir.path().join("expired-esc-3.json").exists());
    }

    #[test]
    fn user_context_reads_are_best_effort() {
        let dir = tempfile::tempdir().unwrap();
        let channel = EscalationChannel::new(dir.path().to_path_buf(), Duration::from_secs(30));
        assert_eq!(channel.read_user_context(), None);

        std::fs::write(dir.path().join("user-context.json"), "{not json").unwrap();
        assert_eq!(channel.read_user_context(), None);

        std::fs::write(
            dir.path().join("user-context.json"),
            r#"{"message": "please fetch the docs"}"#,
        )
        .unwrap();
        assert_eq!(
            channel.read_user_context(),
            Some("please fetch the docs".to_string())
        );
    }

    #[test]
    fn configured_timeouts_are_clamped_to_bounds() {
        assert_eq!(
            clamp_escalation_timeout(Duration::from_secs(1)),
            Duration::from_secs(30)
        );
        assert_eq!(
            clamp_escalation_timeout(Duration::from_secs(120)),
            Duration::from_secs(120)
        );
        assert_eq!(
            clamp_escalation_timeout(Duration::from_secs(3600)),
            Duration::from_secs(600)
        );
    }
}
