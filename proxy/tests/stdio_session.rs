//! End-to-end smoke test over stdio: spawn the proxy binary with an empty
//! backing-server set, perform the initialize handshake, list tools, and
//! confirm that calling a nonexistent tool yields a well-formed error result.
#![allow(clippy::unwrap_used)]

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context;
use assert_cmd::cargo::CommandCargoExt;
use mcp_types::CallToolRequest;
use mcp_types::CallToolRequestParams;
use mcp_types::CallToolResult;
use mcp_types::CallToolResultContent;
use mcp_types::ClientCapabilities;
use mcp_types::Implementation;
use mcp_types::InitializeRequestParams;
use mcp_types::InitializeResult;
use mcp_types::JSONRPC_VERSION;
use mcp_types::JSONRPCMessage;
use mcp_types::JSONRPCRequest;
use mcp_types::ListToolsRequest;
use mcp_types::ListToolsResult;
use mcp_types::ModelContextProtocolRequest;
use mcp_types::RequestId;
use pretty_assertions::assert_eq;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::ChildStdin;
use tokio::process::ChildStdout;
use tokio::process::Command;

const READ_TIMEOUT: Duration = Duration::from_secs(10);

struct ProxyProcess {
    next_request_id: AtomicI64,
    #[allow(dead_code)]
    process: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl ProxyProcess {
    async fn spawn(generated_dir: &Path, audit_path: &Path) -> anyhow::Result<Self> {
        let std_cmd = std::process::Command::cargo_bin("ironcurtain-proxy")
            .context("should find the ironcurtain-proxy binary")?;
        let mut cmd = Command::new(std_cmd.get_program());
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .env("MCP_SERVERS_CONFIG", "{}")
            .env("GENERATED_DIR", generated_dir)
            .env("AUDIT_LOG_PATH", audit_path)
            .env("RUST_LOG", "info");

        let mut process = cmd.kill_on_drop(true).spawn().context("proxy should start")?;
        let stdin = process.stdin.take().context("proxy should have stdin")?;
        let stdout = process.stdout.take().context("proxy should have stdout")?;
        Ok(Self {
            next_request_id: AtomicI64::new(0),
            process,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    async fn send_request<T>(&mut self, params: T::Params) -> anyhow::Result<RequestId>
    where
        T: ModelContextProtocolRequest,
    {
        let id = RequestId::Integer(self.next_request_id.fetch_add(1, Ordering::Relaxed));
        let request = JSONRPCMessage::Request(JSONRPCRequest {
            jsonrpc: JSONRPC_VERSION.into(),
            id: id.clone(),
            method: T::METHOD.to_string(),
            params: Some(serde_json::to_value(params)?),
        });
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(id)
    }

    /// Read frames until the response for `id` arrives.
    async fn read_response(&mut self, id: RequestId) -> anyhow::Result<serde_json::Value> {
        loop {
            let mut line = String::new();
            let read = tokio::time::timeout(READ_TIMEOUT, self.stdout.read_line(&mut line))
                .await
                .context("timed out waiting for a response")??;
            anyhow::ensure!(read > 0, "proxy closed its stdout");
            match serde_json::from_str::<JSONRPCMessage>(&line)? {
                JSONRPCMessage::Response(response) if response.id == id => {
                    return Ok(response.result);
                }
                other => {
                    // Notifications and unrelated frames are fine to skip.
                    eprintln!("skipping frame: {other:?}");
                }
            }
        }
    }
}

fn write_generated_artifacts(dir: &Path) {
    std::fs::write(dir.join("compiled-policy.json"), r#"{"rules": []}"#).unwrap();
    std::fs::write(dir.join("tool-annotations.json"), "{}").unwrap();
    std::fs::write(dir.join("dynamic-lists.json"), "{}").unwrap();
}

#[tokio::test]
async fn initialize_list_and_unknown_tool_call() {
    let dir = tempfile::tempdir().unwrap();
    write_generated_artifacts(dir.path());
    let audit_path = dir.path().join("audit.jsonl");

    let mut proxy = ProxyProcess::spawn(dir.path(), &audit_path).await.unwrap();

    // initialize
    let id = proxy
        .send_request::<mcp_types::InitializeRequest>(InitializeRequestParams {
            capabilities: ClientCapabilities::default(),
            client_info: Implementation {
                name: "stdio session test".into(),
                title: None,
                version: "0.0.0".into(),
            },
            protocol_version: mcp_types::MCP_SCHEMA_VERSION.into(),
        })
        .await
        .unwrap();
    let result = proxy.read_response(id).await.unwrap();
    let initialized: InitializeResult = serde_json::from_value(result).unwrap();
    assert_eq!(initialized.server_info.name, "ironcurtain-proxy");
    assert_eq!(
        initialized.protocol_version,
        mcp_types::MCP_SCHEMA_VERSION.to_string()
    );

    // tools/list with no backing servers is empty
    let id = proxy
        .send_request::<ListToolsRequest>(None)
        .await
        .unwrap();
    let result = proxy.read_response(id).await.unwrap();
    let tools: ListToolsResult = serde_json::from_value(result).unwrap();
    assert_eq!(tools.tools, vec![]);

    // calling an unknown tool is an in-band error, not a protocol error
    let id = proxy
        .send_request::<CallToolRequest>(CallToolRequestParams {
            arguments: None,
            name: "read_file".into(),
        })
        .await
        .unwrap();
    let result = proxy.read_response(id).await.unwrap();
    let call: CallToolResult = serde_json::from_value(result).unwrap();
    assert_eq!(call.is_error, Some(true));
    let CallToolResultContent::TextContent(text) = &call.content[0] else {
        panic!("expected text content");
    };
    assert_eq!(text.text, "Unknown tool: read_file");
}
