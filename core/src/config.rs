use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use ironcurtain_policy::CompiledRule;
use ironcurtain_policy::ResolvedLists;
use ironcurtain_policy::ToolAnnotations;
use serde::Deserialize;

use crate::error::ProxyErr;
use crate::error::Result;

/// Spawn instructions for one backing MCP server, from `MCP_SERVERS_CONFIG`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Option<HashMap<String, String>>,
    /// Whether the server is started under OS-level sandboxing; reflected in
    /// the audit `sandboxed` flag.
    #[serde(default)]
    pub sandbox: Option<bool>,
    /// Structural domain allowlist for this server's URL arguments. Absent
    /// means the structural check is skipped for this server.
    #[serde(default)]
    pub allowed_domains: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxPolicy {
    Warn,
    Enforce,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportConfig {
    Stdio,
    UnixSocket(PathBuf),
    Tcp {
        /// `0` asks the OS for a port; the chosen port is written to
        /// `port_file` when configured.
        port: u16,
        port_file: Option<PathBuf>,
    },
}

#[derive(Debug, Clone)]
pub struct AutoApproveConfig {
    pub model_id: String,
    pub api_key: String,
}

/// Everything the proxy needs at startup, read from the environment once.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub servers: HashMap<String, ServerSpec>,
    pub generated_dir: PathBuf,
    pub audit_log_path: PathBuf,
    pub audit_redaction: bool,
    pub protected_paths: Vec<PathBuf>,
    pub session_log_path: Option<PathBuf>,
    pub sandbox_dir: Option<PathBuf>,
    pub escalation_dir: Option<PathBuf>,
    pub sandbox_policy: SandboxPolicy,
    pub server_credentials: HashMap<String, HashMap<String, String>>,
    pub transport: TransportConfig,
    pub auto_approve: Option<AutoApproveConfig>,
    pub container_workspace_dir: Option<PathBuf>,
}

impl ProxyConfig {
    /// Read the process environment. `SERVER_CREDENTIALS` is scrubbed from
    /// the proxy's own environment immediately after it is parsed, so child
    /// processes and diagnostics can never see the full credentials map.
    pub fn from_env() -> Result<Self> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        let config = Self::from_vars(&vars)?;
        if vars.contains_key("SERVER_CREDENTIALS") {
            // Startup is single-threaded; nothing else reads the environment
            // concurrently.
            unsafe { std::env::remove_var("SERVER_CREDENTIALS") };
        }
        Ok(config)
    }

    /// The parse itself, testable from a plain map.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self> {
        let raw_servers = vars
            .get("MCP_SERVERS_CONFIG")
            .ok_or_else(|| ProxyErr::MissingEnvVar("MCP_SERVERS_CONFIG".to_string()))?;
        let mut servers: HashMap<String, ServerSpec> =
            serde_json::from_str(raw_servers).map_err(|e| ProxyErr::InvalidEnvVar {
                var: "MCP_SERVERS_CONFIG".to_string(),
                message: e.to_string(),
            })?;

        if let Some(filter) = vars.get("SERVER_FILTER") {
            servers.retain(|name, _| name == filter);
            if servers.is_empty() {
                return Err(ProxyErr::InvalidEnvVar {
                    var: "SERVER_FILTER".to_string(),
                    message: format!("no configured server named `{filter}`"),
                });
            }
        }

        let generated_dir = vars
            .get("GENERATED_DIR")
            .map(PathBuf::from)
            .ok_or_else(|| ProxyErr::MissingEnvVar("GENERATED_DIR".to_string()))?;

        let protected_paths = match vars.get("PROTECTED_PATHS") {
            Some(raw) => serde_json::from_str::<Vec<PathBuf>>(raw).map_err(|e| {
                ProxyErr::InvalidEnvVar {
                    var: "PROTECTED_PATHS".to_string(),
                    message: e.to_string(),
                }
            })?,
            None => Vec::new(),
        };

        let sandbox_policy = match vars.get("SANDBOX_POLICY").map(String::as_str) {
            None | Some("warn") => SandboxPolicy::Warn,
            Some("enforce") => SandboxPolicy::Enforce,
            Some(other) => {
                return Err(ProxyErr::InvalidEnvVar {
                    var: "SANDBOX_POLICY".to_string(),
                    message: format!("expected `warn` or `enforce`, got `{other}`"),
                });
            }
        };

        let server_credentials = match vars.get("SERVER_CREDENTIALS") {
            Some(raw) => serde_json::from_str::<HashMap<String, HashMap<String, String>>>(raw)
                .map_err(|e| ProxyErr::InvalidEnvVar {
                    var: "SERVER_CREDENTIALS".to_string(),
                    message: e.to_string(),
                })?,
            None => HashMap::new(),
        };

        let sandbox_dir = vars.get("ALLOWED_DIRECTORY").map(PathBuf::from);

        let container_workspace_dir = vars.get("CONTAINER_WORKSPACE_DIR").map(PathBuf::from);
        if container_workspace_dir.is_some() && sandbox_dir.is_none() {
            return Err(ProxyErr::InvalidEnvVar {
                var: "CONTAINER_WORKSPACE_DIR".to_string(),
                message: "container mode requires ALLOWED_DIRECTORY".to_string(),
            });
        }

        let auto_approve = match vars.get("AUTO_APPROVE_ENABLED").map(String::as_str) {
            Some("1") | Some("true") => {
                let model_id = vars
                    .get("AUTO_APPROVE_MODEL_ID")
                    .ok_or_else(|| ProxyErr::MissingEnvVar("AUTO_APPROVE_MODEL_ID".to_string()))?;
                let api_key = vars
                    .get("AUTO_APPROVE_API_KEY")
                    .ok_or_else(|| ProxyErr::MissingEnvVar("AUTO_APPROVE_API_KEY".to_string()))?;
                Some(AutoApproveConfig {
                    model_id: model_id.clone(),
                    api_key: api_key.clone(),
                })
            }
            _ => None,
        };

        Ok(Self {
            servers,
            generated_dir,
            audit_log_path: vars
                .get("AUDIT_LOG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./audit.jsonl")),
            audit_redaction: matches!(
                vars.get("AUDIT_REDACTION").map(String::as_str),
                Some("1") | Some("true")
            ),
            protected_paths,
            session_log_path: vars.get("SESSION_LOG_PATH").map(PathBuf::from),
            sandbox_dir,
            escalation_dir: vars.get("ESCALATION_DIR").map(PathBuf::from),
            sandbox_policy,
            server_credentials,
            transport: parse_transport(vars)?,
            auto_approve,
            container_workspace_dir,
        })
    }

    /// Per-server structural domain allowlists, in the shape the policy
    /// engine consumes.
    pub fn server_allowed_domains(&self) -> HashMap<String, Vec<String>> {
        self.servers
            .iter()
            .filter_map(|(name, spec)| {
                spec.allowed_domains
                    .as_ref()
                    .map(|domains| (name.clone(), domains.clone()))
            })
            .collect()
    }
}

fn parse_transport(vars: &HashMap<String, String>) -> Result<TransportConfig> {
    if let Some(raw) = vars.get("PROXY_TCP_PORT") {
        let port: i64 = raw.trim().parse().map_err(|_| ProxyErr::InvalidEnvVar {
            var: "PROXY_TCP_PORT".to_string(),
            message: format!("`{raw}` is not a number"),
        })?;
        if !(0..=65535).contains(&port) {
            return Err(ProxyErr::InvalidEnvVar {
                var: "PROXY_TCP_PORT".to_string(),
                message: format!("`{port}` is outside 0..=65535"),
            });
        }
        return Ok(TransportConfig::Tcp {
            port: port as u16,
            port_file: vars.get("PROXY_PORT_FILE").map(PathBuf::from),
        });
    }
    if let Some(path) = vars.get("PROXY_SOCKET_PATH") {
        return Ok(TransportConfig::UnixSocket(PathBuf::from(path)));
    }
    Ok(TransportConfig::Stdio)
}

/// The three artifacts the offline pipeline leaves in `GENERATED_DIR`.
pub struct GeneratedArtifacts {
    pub rules: Vec<CompiledRule>,
    pub annotations: ToolAnnotations,
    pub lists: ResolvedLists,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompiledPolicyFile {
    #[serde(default)]
    rules: Vec<CompiledRule>,
}

pub fn load_generated_artifacts(dir: &Path) -> Result<GeneratedArtifacts> {
    let policy: CompiledPolicyFile = load_json(&dir.join("compiled-policy.json"))?;
    let annotations: ToolAnnotations = load_json(&dir.join("tool-annotations.json"))?;
    let lists: ResolvedLists = load_json(&dir.join("dynamic-lists.json"))?;
    Ok(GeneratedArtifacts {
        rules: policy.rules,
        annotations,
        lists,
    })
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let parse = || -> anyhow::Result<T> {
        let raw = std::fs::read_to_string(path).context("read")?;
        serde_json::from_str(&raw).context("parse")
    };
    parse().map_err(|e| ProxyErr::Artifact {
        path: path.display().to_string(),
        message: format!("{e:#}"),
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use maplit::hashmap;
    use pretty_assertions::assert_eq;

    fn base_vars() -> HashMap<String, String> {
        hashmap! {
            "MCP_SERVERS_CONFIG".to_string() => r#"{
                "fs": {"command": "mcp-fs", "args": ["--root", "/tmp/sb"]},
                "web": {"command": "mcp-web", "allowedDomains": ["*.github.com", "*"]}
            }"#.to_string(),
            "GENERATED_DIR".to_string() => "/tmp/generated".to_string(),
        }
    }

    #[test]
    fn minimal_configuration_defaults() {
        let config = ProxyConfig::from_vars(&base_vars()).unwrap();
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.audit_log_path, PathBuf::from("./audit.jsonl"));
        assert_eq!(config.sandbox_policy, SandboxPolicy::Warn);
        assert_eq!(config.transport, TransportConfig::Stdio);
        assert!(config.auto_approve.is_none());
        assert!(!config.audit_redaction);
        assert_eq!(
            config.server_allowed_domains(),
            hashmap! { "web".to_string() => vec!["*.github.com".to_string(), "*".to_string()] }
        );
    }

    #[test]
    fn servers_config_is_required() {
        let err = ProxyConfig::from_vars(&hashmap! {
            "GENERATED_DIR".to_string() => "/tmp/g".to_string(),
        })
        .unwrap_err();
        assert!(matches!(err, ProxyErr::MissingEnvVar(var) if var == "MCP_SERVERS_CONFIG"));
    }

    #[test]
    fn server_filter_restricts_or_fails() {
        let mut vars = base_vars();
        vars.insert("SERVER_FILTER".to_string(), "fs".to_string());
        let config = ProxyConfig::from_vars(&vars).unwrap();
        assert_eq!(config.servers.len(), 1);
        assert!(config.servers.contains_key("fs"));

        vars.insert("SERVER_FILTER".to_string(), "nope".to_string());
        assert!(matches!(
            ProxyConfig::from_vars(&vars),
            Err(ProxyErr::InvalidEnvVar { var, .. }) if var == "SERVER_FILTER"
        ));
    }

    #[test]
    fn tcp_port_validation() {
        for bad in ["abc", "-1", "70000", "1.5"] {
            let mut vars = base_vars();
            vars.insert("PROXY_TCP_PORT".to_string(), bad.to_string());
            assert!(
                matches!(
                    ProxyConfig::from_vars(&vars),
                    Err(ProxyErr::InvalidEnvVar { var, .. }) if var == "PROXY_TCP_PORT"
                ),
                "`{bad}` should be rejected"
            );
        }

        let mut vars = base_vars();
        vars.insert("PROXY_TCP_PORT".to_string(), "0".to_string());
        vars.insert("PROXY_PORT_FILE".to_string(), "/tmp/port".to_string());
        let config = ProxyConfig::from_vars(&vars).unwrap();
        assert_eq!(
            config.transport,
            TransportConfig::Tcp {
                port: 0,
                port_file: Some(PathBuf::from("/tmp/port")),
            }
        );
    }

    #[test]
    fn tcp_takes_precedence_over_unix_socket() {
        let mut vars = base_vars();
        vars.insert("PROXY_TCP_PORT".to_string(), "7777".to_string());
        vars.insert("PROXY_SOCKET_PATH".to_string(), "/tmp/proxy.sock".to_string());
        let config = ProxyConfig::from_vars(&vars).unwrap();
        assert!(matches!(config.transport, TransportConfig::Tcp { port: 7777, .. }));

        let mut vars = base_vars();
        vars.insert("PROXY_SOCKET_PATH".to_string(), "/tmp/proxy.sock".to_string());
        let config = ProxyConfig::from_vars(&vars).unwrap();
        assert_eq!(
            config.transport,
            TransportConfig::UnixSocket(PathBuf::from("/tmp/proxy.sock"))
        );
    }

    #[test]
    fn auto_approve_requires_model_and_key() {
        let mut vars = base_vars();
        vars.insert("AUTO_APPROVE_ENABLED".to_string(), "1".to_string());
        assert!(matches!(
            ProxyConfig::from_vars(&vars),
            Err(ProxyErr::MissingEnvVar(var)) if var == "AUTO_APPROVE_MODEL_ID"
        ));

        vars.insert("AUTO_APPROVE_MODEL_ID".to_string(), "gpt-4.1-mini".to_string());
        vars.insert("AUTO_APPROVE_API_KEY".to_string(), "sk-test".to_string());
        let config = ProxyConfig::from_vars(&vars).unwrap();
        assert_eq!(config.auto_approve.unwrap().model_id, "gpt-4.1-mini");
    }

    #[test]
    fn container_mode_requires_a_sandbox() {
        let mut vars = base_vars();
        vars.insert("CONTAINER_WORKSPACE_DIR".to_string(), "/workspace".to_string());
        assert!(matches!(
            ProxyConfig::from_vars(&vars),
            Err(ProxyErr::InvalidEnvVar { var, .. }) if var == "CONTAINER_WORKSPACE_DIR"
        ));

        vars.insert("ALLOWED_DIRECTORY".to_string(), "/tmp/sb".to_string());
        let config = ProxyConfig::from_vars(&vars).unwrap();
        assert_eq!(
            config.container_workspace_dir,
            Some(PathBuf::from("/workspace"))
        );
    }

    #[test]
    fn credentials_parse_per_server() {
        let mut vars = base_vars();
        vars.insert(
            "SERVER_CREDENTIALS".to_string(),
            r#"{"web": {"API_TOKEN": "token_abcdefghijklmnopq"}}"#.to_string(),
        );
        let config = ProxyConfig::from_vars(&vars).unwrap();
        assert_eq!(
            config.server_credentials["web"]["API_TOKEN"],
            "token_abcdefghijklmnopq"
        );
    }
}
