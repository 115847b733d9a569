//! Connection manager for the backing MCP servers.
//!
//! Owns one [`McpClient`] per configured server (keyed by server name) and
//! the aggregated tool map. Tool names are kept flat, as the backing servers
//! provided them; a name exported by two servers is a startup error because
//! the policy artifacts identify tools by `(server, tool)` and a flat
//! namespace cannot disambiguate.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ironcurtain_mcp_client::McpClient;
use mcp_types::CallToolResult;
use mcp_types::Root;
use mcp_types::Tool;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::info;
use tracing::warn;

use crate::config::ServerSpec;
use crate::error::ProxyErr;
use crate::error::Result;
use crate::flags::ROOTS_ACK_TIMEOUT_MS;

/// Timeout for the `tools/list` request at startup.
const LIST_TOOLS_TIMEOUT: Duration = Duration::from_secs(10);

/// Startup error for every server that could **not** be spawned. These are
/// logged, not fatal: the affected tools never enter the tool map, so calls
/// to them evaluate as unknown.
pub type ClientStartErrors = HashMap<String, anyhow::Error>;

struct ServerConnection {
    client: Arc<McpClient>,
    sandboxed: bool,
}

#[derive(Clone)]
pub struct ToolHandle {
    pub server: String,
    pub tool: Tool,
    pub sandboxed: bool,
}

pub struct McpConnectionManager {
    /// Server name -> live connection.
    connections: HashMap<String, ServerConnection>,

    /// Flat tool name -> owning server + definition.
    tools: HashMap<String, ToolHandle>,

    /// Per-server working directory context, updated by tools like
    /// `git_set_working_dir` and consulted when resolving relative paths for
    /// later calls on the same server.
    working_dirs: Mutex<HashMap<String, PathBuf>>,
}

impl McpConnectionManager {
    /// Spawn every configured server concurrently. Each child gets the
    /// inherited environment plus its spec `env` plus its entry (if any) in
    /// the credentials map; stderr goes to `session_log_path` when set.
    pub async fn new(
        servers: HashMap<String, ServerSpec>,
        credentials: &HashMap<String, HashMap<String, String>>,
        session_log_path: Option<&Path>,
    ) -> Result<(Self, ClientStartErrors)> {
        let mut join_set = JoinSet::new();
        for (server_name, spec) in servers {
            let env = merged_child_env(&spec, credentials.get(&server_name));
            let stderr_log = session_log_path.map(Path::to_path_buf);
            let sandboxed = spec.sandbox.unwrap_or(false);
            join_set.spawn(async move {
                let client =
                    McpClient::new_stdio_client(spec.command, spec.args, env, stderr_log).await;
                (server_name, sandboxed, client)
            });
        }

        let mut connections = HashMap::new();
        let mut errors = ClientStartErrors::new();
        while let Some(joined) = join_set.join_next().await {
            let (server_name, sandboxed, client) = match joined {
                Ok(result) => result,
                Err(e) => {
                    warn!("server spawn task panicked: {e}");
                    continue;
                }
            };
            match client {
                Ok(client) => {
                    connections.insert(
                        server_name,
                        ServerConnection {
                            client: Arc::new(client),
                            sandboxed,
                        },
                    );
                }
                Err(e) => {
                    errors.insert(server_name, e);
                }
            }
        }

        let tools = aggregate_tools(&connections).await?;
        info!(
            "aggregated {} tools from {} servers",
            tools.len(),
            connections.len()
        );

        Ok((
            Self {
                connections,
                tools,
                working_dirs: Mutex::new(HashMap::new()),
            },
            errors,
        ))
    }

    /// Tool definitions for the agent-facing `tools/list`.
    pub fn list_all_tools(&self) -> Vec<Tool> {
        let mut tools: Vec<Tool> = self.tools.values().map(|h| h.tool.clone()).collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    pub fn lookup_tool(&self, tool_name: &str) -> Option<&ToolHandle> {
        self.tools.get(tool_name)
    }

    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Option<serde_json::Value>,
        timeout: Option<Duration>,
    ) -> anyhow::Result<CallToolResult> {
        let client = self
            .connections
            .get(server)
            .map(|c| Arc::clone(&c.client))
            .ok_or_else(|| anyhow::anyhow!("no connection to server `{server}`"))?;
        client.call_tool(tool.to_string(), arguments, timeout).await
    }

    /// Grant `server` an additional filesystem root (an escalation approved a
    /// path outside the sandbox) and wait briefly for its acknowledgement.
    pub async fn add_root(&self, server: &str, dir: &Path) {
        let Some(connection) = self.connections.get(server) else {
            return;
        };
        let root = Root {
            name: None,
            uri: format!("file://{}", dir.display()),
        };
        match connection.client.add_root(root, *ROOTS_ACK_TIMEOUT_MS).await {
            Ok(true) => info!("server `{server}` acknowledged new root {}", dir.display()),
            Ok(false) => warn!(
                "server `{server}` did not acknowledge root {} in time; proceeding",
                dir.display()
            ),
            Err(e) => warn!("failed to notify `{server}` about new root: {e}"),
        }
    }

    pub async fn working_dir(&self, server: &str) -> Option<PathBuf> {
        self.working_dirs.lock().await.get(server).cloned()
    }

    pub async fn set_working_dir(&self, server: &str, dir: Option<PathBuf>) {
        let mut dirs = self.working_dirs.lock().await;
        match dir {
            Some(dir) => {
                dirs.insert(server.to_string(), dir);
            }
            None => {
                dirs.remove(server);
            }
        }
    }
}

/// Spec env layered over the credentials for this server. The inherited host
/// environment is applied by the spawn itself.
fn merged_child_env(
    spec: &ServerSpec,
    credentials: Option<&HashMap<String, String>>,
) -> Option<HashMap<String, String>> {
    let mut env = spec.env.clone().unwrap_or_default();
    if let Some(credentials) = credentials {
        for (key, value) in credentials {
            env.insert(key.clone(), value.clone());
        }
    }
    if env.is_empty() { None } else { Some(env) }
}

async fn aggregate_tools(
    connections: &HashMap<String, ServerConnection>,
) -> Result<HashMap<String, ToolHandle>> {
    let mut join_set = JoinSet::new();
    for (server_name, connection) in connections {
        let server_name = server_name.clone();
        let client = Arc::clone(&connection.client);
        let sandboxed = connection.sandboxed;
        join_set.spawn(async move {
            let result = client.list_tools(None, Some(LIST_TOOLS_TIMEOUT)).await;
            (server_name, sandboxed, result)
        });
    }

    let mut tools: HashMap<String, ToolHandle> = HashMap::new();
    while let Some(joined) = join_set.join_next().await {
        let Ok((server_name, sandboxed, result)) = joined else {
            continue;
        };
        let listed = match result {
            Ok(listed) => listed,
            Err(e) => {
                warn!("tools/list failed for `{server_name}`: {e}");
                continue;
            }
        };
        for tool in listed.tools {
            if let Some(existing) = tools.get(&tool.name) {
                return Err(ProxyErr::ToolNameCollision {
                    tool: tool.name,
                    first: existing.server.clone(),
                    second: server_name,
                });
            }
            tools.insert(
                tool.name.clone(),
                ToolHandle {
                    server: server_name.clone(),
                    tool,
                    sandboxed,
                },
            );
        }
    }
    Ok(tools)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use maplit::hashmap;

    #[test]
    fn credentials_overlay_the_spec_env() {
        let spec = ServerSpec {
            command: "mcp-web".to_string(),
            args: vec![],
            env: Some(hashmap! {
                "MODE".to_string() => "readonly".to_string(),
                "API_TOKEN".to_string() => "from-spec".to_string(),
            }),
            sandbox: None,
            allowed_domains: None,
        };
        let credentials = hashmap! { "API_TOKEN".to_string() => "from-credentials".to_string() };
        let merged = merged_child_env(&spec, Some(&credentials)).unwrap();
        assert_eq!(merged["MODE"], "readonly");
        assert_eq!(merged["API_TOKEN"], "from-credentials");
    }

    #[test]
    fn empty_env_collapses_to_none() {
        let spec = ServerSpec {
            command: "mcp-fs".to_string(),
            args: vec![],
            env: None,
            sandbox: None,
            allowed_domains: None,
        };
        assert!(merged_child_env(&spec, None).is_none());
    }
}
