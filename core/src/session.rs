//! The per-request mediation pipeline.
//!
//! [`ProxySession`] owns everything with session lifetime: the policy engine,
//! the backing-server connections, the audit log, the circuit breaker, the
//! escalation channel and the optional auto-approver. Each tool call is
//! handled to completion inside [`ProxySession::handle_call_tool`], which is
//! careful to produce exactly one audit entry for every request that gets
//! past tool lookup.

use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;
use std::time::Instant;

use chrono::Utc;
use ironcurtain_policy::Decision;
use ironcurtain_policy::PolicyDecision;
use ironcurtain_policy::PolicyEngine;
use ironcurtain_policy::PolicyRequest;
use ironcurtain_policy::RoleCategory;
use ironcurtain_policy::ToolAnnotation;
use ironcurtain_policy::canonicalize_path;
use ironcurtain_policy::is_contained_within;
use mcp_types::CallToolRequestParams;
use mcp_types::CallToolResult;
use mcp_types::CallToolResultContent;
use mcp_types::TextContent;
use serde_json::Map;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::audit::AuditEntry;
use crate::audit::AuditLog;
use crate::audit::AuditResult;
use crate::audit::AuditStatus;
use crate::auto_approver::AutoApproveVerdict;
use crate::auto_approver::AutoApprover;
use crate::circuit_breaker::CircuitBreaker;
use crate::config::ProxyConfig;
use crate::config::SandboxPolicy;
use crate::config::load_generated_artifacts;
use crate::error::Result;
use crate::escalation::EscalationChannel;
use crate::escalation::EscalationOutcome;
use crate::escalation::EscalationRequest;
use crate::escalation::clamp_escalation_timeout;
use crate::flags::CIRCUIT_BREAKER_THRESHOLD;
use crate::flags::CIRCUIT_BREAKER_WINDOW_MS;
use crate::flags::ESCALATION_TIMEOUT_MS;
use crate::mcp_connection_manager::ClientStartErrors;
use crate::mcp_connection_manager::McpConnectionManager;
use crate::path_rewrite::PathRewriter;

pub struct ProxySession {
    policy: PolicyEngine,
    connections: McpConnectionManager,
    audit: AuditLog,
    breaker: CircuitBreaker,
    escalation: Option<EscalationChannel>,
    auto_approver: Option<AutoApprover>,
    rewriter: Option<PathRewriter>,
    sandbox_dir: Option<PathBuf>,
}

impl ProxySession {
    /// Wire up a session from startup configuration: load the generated
    /// artifacts, build the engine, connect to every backing server. Spawn
    /// failures are returned for logging; they are not fatal.
    pub async fn start(config: ProxyConfig) -> Result<(Self, ClientStartErrors)> {
        for (name, spec) in &config.servers {
            if spec.sandbox.unwrap_or(false) {
                continue;
            }
            match config.sandbox_policy {
                SandboxPolicy::Warn => {
                    warn!("backing server `{name}` runs without OS-level sandboxing");
                }
                SandboxPolicy::Enforce => {
                    return Err(crate::error::ProxyErr::SandboxRequired(name.clone()));
                }
            }
        }

        let artifacts = load_generated_artifacts(&config.generated_dir)?;
        let policy = PolicyEngine::new(
            artifacts.annotations,
            artifacts.rules,
            &artifacts.lists,
            &config.protected_paths,
            config.sandbox_dir.as_deref(),
            config.server_allowed_domains(),
        )?;

        let (connections, start_errors) = McpConnectionManager::new(
            config.servers.clone(),
            &config.server_credentials,
            config.session_log_path.as_deref(),
        )
        .await?;

        let audit = AuditLog::new(&config.audit_log_path, config.audit_redaction).await?;
        let breaker = CircuitBreaker::new(
            std::time::Duration::from_millis(*CIRCUIT_BREAKER_WINDOW_MS),
            *CIRCUIT_BREAKER_THRESHOLD,
        );
        let escalation = config.escalation_dir.clone().map(|dir| {
            EscalationChannel::new(dir, clamp_escalation_timeout(*ESCALATION_TIMEOUT_MS))
        });
        let auto_approver = config
            .auto_approve
            .as_ref()
            .map(|cfg| AutoApprover::new(cfg.model_id.clone(), cfg.api_key.clone()));
        let rewriter = match (&config.container_workspace_dir, &config.sandbox_dir) {
            (Some(container), Some(sandbox)) => Some(PathRewriter::new(
                &container.to_string_lossy(),
                &sandbox.to_string_lossy(),
            )),
            _ => None,
        };

        Ok((
            Self {
                policy,
                connections,
                audit,
                breaker,
                escalation,
                auto_approver,
                rewriter,
                sandbox_dir: config.sandbox_dir,
            },
            start_errors,
        ))
    }

    pub fn list_tools(&self) -> Vec<mcp_types::Tool> {
        self.connections.list_all_tools()
    }

    /// Drain the audit channel; called on shutdown.
    pub async fn shutdown(self) {
        self.audit.shutdown().await;
    }

    /// Mediate one tool call end to end. Always returns a well-formed MCP
    /// result; error conditions become `isError: true` with a message the
    /// agent can reason about.
    pub async fn handle_call_tool(&self, params: CallToolRequestParams) -> CallToolResult {
        let started = Instant::now();
        let timestamp = Utc::now();
        let request_id = Uuid::new_v4().to_string();

        // 1. Tool lookup. An unknown tool is an error response without an
        //    audit entry.
        let Some(handle) = self.connections.lookup_tool(&params.name) else {
            return error_result(format!("Unknown tool: {}", params.name));
        };
        let server = handle.server.clone();
        let sandboxed = handle.sandboxed;
        let tool = params.name.clone();

        let raw_args = match params.arguments {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };

        let mut entry = AuditEntry {
            timestamp,
            request_id: request_id.clone(),
            server_name: server.clone(),
            tool_name: tool.clone(),
            arguments: Value::Object(raw_args.clone()),
            policy_decision: PolicyDecision {
                decision: Decision::Deny,
                rule: String::new(),
                reason: String::new(),
            },
            result: AuditResult {
                status: AuditStatus::Denied,
                error: None,
                content: None,
            },
            duration_ms: 0,
            escalation_result: None,
            sandboxed: Some(sandboxed),
            auto_approved: None,
        };

        // 2. Annotation lookup.
        let Some(annotation) = self.policy.annotations().lookup(&server, &tool).cloned() else {
            entry.policy_decision = PolicyDecision {
                decision: Decision::Deny,
                rule: "missing-annotation".to_string(),
                reason: format!("tool `{server}/{tool}` has no argument annotation"),
            };
            let reason = entry.policy_decision.reason.clone();
            self.finish(entry, started);
            return error_result(format!("DENIED: {reason}"));
        };

        // 3. Argument preparation: container rewrite, then the transport and
        //    policy views.
        let working_dir = self.connections.working_dir(&server).await;
        let (args_for_transport, args_for_policy) = prepare_arguments(
            &annotation,
            &raw_args,
            self.rewriter.as_ref(),
            working_dir.as_deref(),
            self.sandbox_dir.as_deref(),
        );
        entry.arguments = Value::Object(args_for_transport.clone());

        // 4. Policy evaluation over the absolute, canonical view.
        let decision = self.policy.evaluate(&PolicyRequest {
            server: &server,
            tool: &tool,
            arguments: &args_for_policy,
        });
        entry.policy_decision = decision.clone();

        // 5. Deny.
        if decision.decision == Decision::Deny {
            self.finish(entry, started);
            return error_result(format!("DENIED: {}", decision.reason));
        }

        // 6. Escalate: auto-approver first, then the human channel.
        if decision.decision == Decision::Escalate {
            let mut approved = false;
            if let Some(approver) = &self.auto_approver {
                let user_message = self
                    .escalation
                    .as_ref()
                    .and_then(EscalationChannel::read_user_context);
                let resources = resource_arguments(&annotation, &args_for_policy);
                let verdict = approver
                    .review(
                        user_message.as_deref(),
                        &format!("{server}/{tool}"),
                        &decision.reason,
                        &resources,
                    )
                    .await;
                if verdict == AutoApproveVerdict::Approve {
                    approved = true;
                    entry.auto_approved = Some(true);
                }
            }

            if !approved {
                let Some(channel) = &self.escalation else {
                    entry.escalation_result = Some(EscalationOutcome::Denied);
                    self.finish(entry, started);
                    return error_result(format!(
                        "DENIED: {} (escalation required, but no escalation handler is configured)",
                        decision.reason
                    ));
                };
                let escalation_request = EscalationRequest {
                    escalation_id: EscalationChannel::fresh_escalation_id(),
                    request_id: request_id.clone(),
                    server_name: server.clone(),
                    tool_name: tool.clone(),
                    arguments: Value::Object(args_for_transport.clone()),
                    reason: decision.reason.clone(),
                    requested_at: Utc::now(),
                };
                let outcome = match channel.escalate(&escalation_request).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!("escalation channel failed: {e}");
                        EscalationOutcome::Denied
                    }
                };
                entry.escalation_result = Some(outcome);
                match outcome {
                    EscalationOutcome::Approved => {
                        self.grant_roots_outside_sandbox(&server, &annotation, &args_for_policy)
                            .await;
                    }
                    EscalationOutcome::Denied => {
                        self.finish(entry, started);
                        return error_result(
                            "DENIED: escalation was denied by the user".to_string(),
                        );
                    }
                    EscalationOutcome::TimedOut => {
                        self.finish(entry, started);
                        return error_result(
                            "DENIED: escalation timed out without a response".to_string(),
                        );
                    }
                }
            }
        }

        // 7. Circuit breaker, after policy so the call was still evaluated
        //    and audited. Auto-approved calls go straight to the forward.
        let transport_value = Value::Object(args_for_transport.clone());
        if entry.auto_approved != Some(true) {
            let verdict = self.breaker.check(&tool, &transport_value);
            if !verdict.allowed {
                let reason = verdict
                    .reason
                    .unwrap_or_else(|| "circuit breaker open".to_string());
                entry.result.error = Some(reason.clone());
                self.finish(entry, started);
                return error_result(reason);
            }
        }

        // 8. Forward. Backing servers enforce their own timeouts.
        let call = self
            .connections
            .call_tool(&server, &tool, Some(transport_value), None)
            .await;

        match call {
            Ok(result) => {
                self.track_side_effects(&server, &tool, &args_for_policy).await;

                // 9. Classification and outbound rewrite.
                let is_error = result.is_error.unwrap_or(false);
                entry.result = AuditResult {
                    status: if is_error {
                        AuditStatus::Error
                    } else {
                        AuditStatus::Success
                    },
                    error: is_error.then(|| first_text(&result)).flatten(),
                    content: serde_json::to_value(&result.content).ok(),
                };
                let response = match &self.rewriter {
                    Some(rewriter) => rewriter.rewrite_result(&result),
                    None => result,
                };
                // 10. Audit with duration and sandbox flag.
                self.finish(entry, started);
                response
            }
            Err(e) => {
                let message = format!("Error: {e:#}");
                entry.result = AuditResult {
                    status: AuditStatus::Error,
                    error: Some(message.clone()),
                    content: None,
                };
                self.finish(entry, started);
                error_result(message)
            }
        }
    }

    fn finish(&self, mut entry: AuditEntry, started: Instant) {
        entry.duration_ms = started.elapsed().as_millis() as u64;
        self.audit.append(entry);
    }

    /// Context updates some tools leave behind for later policy evaluations
    /// on the same server.
    async fn track_side_effects(
        &self,
        server: &str,
        tool: &str,
        args_for_policy: &Map<String, Value>,
    ) {
        match tool {
            "git_set_working_dir" => {
                if let Some(Value::String(path)) = args_for_policy.get("path") {
                    self.connections
                        .set_working_dir(server, Some(canonicalize_path(path)))
                        .await;
                }
            }
            "git_clear_working_dir" => {
                self.connections.set_working_dir(server, None).await;
            }
            _ => {}
        }
    }

    /// After a human approved a path outside the sandbox, let the backing
    /// server know it may now touch that area.
    async fn grant_roots_outside_sandbox(
        &self,
        server: &str,
        annotation: &ToolAnnotation,
        args_for_policy: &Map<String, Value>,
    ) {
        let mut dirs: BTreeSet<PathBuf> = BTreeSet::new();
        for value in path_argument_values(annotation, args_for_policy) {
            let canonical = canonicalize_path(&value);
            if let Some(sandbox) = &self.sandbox_dir {
                if is_contained_within(&canonical, sandbox) {
                    continue;
                }
            }
            let dir = if canonical.is_dir() {
                canonical
            } else {
                match canonical.parent() {
                    Some(parent) => parent.to_path_buf(),
                    None => canonical,
                }
            };
            dirs.insert(dir);
        }
        for dir in dirs {
            self.connections.add_root(server, &dir).await;
        }
    }
}

fn error_result(text: String) -> CallToolResult {
    CallToolResult {
        content: vec![CallToolResultContent::TextContent(TextContent {
            annotations: None,
            text,
            r#type: "text".to_string(),
        })],
        is_error: Some(true),
    }
}

fn first_text(result: &CallToolResult) -> Option<String> {
    result.content.iter().find_map(|block| match block {
        CallToolResultContent::TextContent(text) => Some(text.text.clone()),
        _ => None,
    })
}

/// Build the two argument views.
///
/// `argsForTransport` is what the backing server receives: container paths
/// rewritten to the host sandbox, absolute paths canonicalized, relative
/// paths untouched (the server resolves them against its own cwd).
///
/// `argsForPolicy` additionally resolves relative paths against the server's
/// working-dir context (or the session sandbox), so the engine always sees
/// absolute canonical paths.
fn prepare_arguments(
    annotation: &ToolAnnotation,
    raw_args: &Map<String, Value>,
    rewriter: Option<&PathRewriter>,
    working_dir: Option<&Path>,
    sandbox_dir: Option<&Path>,
) -> (Map<String, Value>, Map<String, Value>) {
    let mut transport = Map::new();
    let mut policy = Map::new();

    for (name, value) in raw_args {
        let is_path_arg = annotation
            .args
            .get(name)
            .is_some_and(|roles| roles.iter().any(|r| r.category() == RoleCategory::Path));
        if !is_path_arg {
            transport.insert(name.clone(), value.clone());
            policy.insert(name.clone(), value.clone());
            continue;
        }

        let map_string = |raw: &str| -> (Value, Value) {
            let inbound = match rewriter {
                Some(rewriter) => rewriter.rewrite_argument(raw),
                None => raw.to_string(),
            };
            if Path::new(&inbound).is_absolute() {
                let canonical = canonicalize_path(&inbound).to_string_lossy().into_owned();
                (Value::String(canonical.clone()), Value::String(canonical))
            } else {
                let base = working_dir.or(sandbox_dir);
                let for_policy = match base {
                    Some(base) => {
                        let joined = base.join(&inbound);
                        Value::String(
                            canonicalize_path(&joined.to_string_lossy())
                                .to_string_lossy()
                                .into_owned(),
                        )
                    }
                    None => Value::String(inbound.clone()),
                };
                (Value::String(inbound), for_policy)
            }
        };

        match value {
            Value::String(raw) => {
                let (t, p) = map_string(raw);
                transport.insert(name.clone(), t);
                policy.insert(name.clone(), p);
            }
            Value::Array(items) => {
                let mut t_items = Vec::with_capacity(items.len());
                let mut p_items = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::String(raw) => {
                            let (t, p) = map_string(raw);
                            t_items.push(t);
                            p_items.push(p);
                        }
                        other => {
                            t_items.push(other.clone());
                            p_items.push(other.clone());
                        }
                    }
                }
                transport.insert(name.clone(), Value::Array(t_items));
                policy.insert(name.clone(), Value::Array(p_items));
            }
            other => {
                transport.insert(name.clone(), other.clone());
                policy.insert(name.clone(), other.clone());
            }
        }
    }

    (transport, policy)
}

/// `(name, value)` pairs for every provided resource-identifier argument,
/// for the auto-approver's filtered view.
fn resource_arguments(
    annotation: &ToolAnnotation,
    args: &Map<String, Value>,
) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for (name, roles) in &annotation.args {
        if !roles.iter().any(|r| r.is_resource_identifier()) {
            continue;
        }
        match args.get(name) {
            Some(Value::String(value)) => out.push((name.clone(), value.clone())),
            Some(Value::Array(items)) => {
                for item in items {
                    if let Value::String(value) = item {
                        out.push((name.clone(), value.clone()));
                    }
                }
            }
            _ => {}
        }
    }
    out.sort();
    out
}

fn path_argument_values(annotation: &ToolAnnotation, args: &Map<String, Value>) -> Vec<String> {
    let mut out = Vec::new();
    for (name, roles) in &annotation.args {
        if !roles.iter().any(|r| r.category() == RoleCategory::Path) {
            continue;
        }
        match args.get(name) {
            Some(Value::String(value)) => out.push(value.clone()),
            Some(Value::Array(items)) => {
                for item in items {
                    if let Value::String(value) = item {
                        out.push(value.clone());
                    }
                }
            }
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn annotation() -> ToolAnnotation {
        serde_json::from_value(json!({
            "sideEffects": true,
            "args": {
                "path": ["write-path"],
                "sources": ["read-path"],
                "content": ["none"],
                "url": ["fetch-url"]
            }
        }))
        .unwrap()
    }

    #[test]
    fn transport_keeps_relative_paths_policy_resolves_them() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = std::fs::canonicalize(dir.path()).unwrap();
        let args = json!({
            "path": "notes/today.md",
            "content": "hello",
        });
        let Value::Object(args) = args else { unreachable!() };

        let (transport, policy) =
            prepare_arguments(&annotation(), &args, None, None, Some(sandbox.as_path()));
        assert_eq!(transport["path"], json!("notes/today.md"));
        assert_eq!(
            policy["path"],
            json!(sandbox.join("notes/today.md").to_string_lossy())
        );
        assert_eq!(transport["content"], json!("hello"));
        assert_eq!(policy["content"], json!("hello"));
    }

    #[test]
    fn absolute_paths_are_canonicalized_in_both_views() {
        let dir = tempfile::tempdir().unwrap();
        let base = std::fs::canonicalize(dir.path()).unwrap();
        let raw = format!("{}/a/../hello.txt", base.display());
        let args = json!({ "path": raw });
        let Value::Object(args) = args else { unreachable!() };

        let (transport, policy) = prepare_arguments(&annotation(), &args, None, None, None);
        let expected = json!(base.join("hello.txt").to_string_lossy());
        assert_eq!(transport["path"], expected);
        assert_eq!(policy["path"], expected);
    }

    #[test]
    fn container_prefix_is_rewritten_before_canonicalization() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = std::fs::canonicalize(dir.path()).unwrap();
        let rewriter = PathRewriter::new("/workspace", &sandbox.to_string_lossy());
        let args = json!({ "path": "/workspace/out.txt" });
        let Value::Object(args) = args else { unreachable!() };

        let (transport, policy) =
            prepare_arguments(&annotation(), &args, Some(&rewriter), None, Some(sandbox.as_path()));
        let expected = json!(sandbox.join("out.txt").to_string_lossy());
        assert_eq!(transport["path"], expected);
        assert_eq!(policy["path"], expected);
    }

    #[test]
    fn working_dir_context_wins_over_the_sandbox_for_policy_view() {
        let dir = tempfile::tempdir().unwrap();
        let base = std::fs::canonicalize(dir.path()).unwrap();
        let sandbox = base.join("sb");
        let repo = base.join("repo");
        std::fs::create_dir(&sandbox).unwrap();
        std::fs::create_dir(&repo).unwrap();

        let args = json!({ "path": "README.md" });
        let Value::Object(args) = args else { unreachable!() };
        let (transport, policy) =
            prepare_arguments(&annotation(), &args, None, Some(repo.as_path()), Some(sandbox.as_path()));
        assert_eq!(transport["path"], json!("README.md"));
        assert_eq!(policy["path"], json!(repo.join("README.md").to_string_lossy()));
    }

    #[test]
    fn array_path_arguments_are_mapped_elementwise() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = std::fs::canonicalize(dir.path()).unwrap();
        let args = json!({ "sources": ["a.txt", "b.txt"] });
        let Value::Object(args) = args else { unreachable!() };

        let (transport, policy) =
            prepare_arguments(&annotation(), &args, None, None, Some(sandbox.as_path()));
        assert_eq!(transport["sources"], json!(["a.txt", "b.txt"]));
        assert_eq!(
            policy["sources"],
            json!([
                sandbox.join("a.txt").to_string_lossy(),
                sandbox.join("b.txt").to_string_lossy()
            ])
        );
    }

    #[test]
    fn resource_arguments_exclude_opaque_values() {
        let args = json!({
            "path": "/tmp/x",
            "content": "secret body",
            "url": "https://example.com"
        });
        let Value::Object(args) = args else { unreachable!() };
        let resources = resource_arguments(&annotation(), &args);
        assert_eq!(
            resources,
            vec![
                ("path".to_string(), "/tmp/x".to_string()),
                ("url".to_string(), "https://example.com".to_string()),
            ]
        );
    }
}
