//! MCP client over stdio to one spawned backing server.
//!
//! The client owns the child process and two tasks: a stdout reader that
//! routes responses to pending requests (and serves the small set of
//! server-initiated requests, `ping` and `roots/list`), and a stdin writer
//! fed from a bounded channel. Requests are matched to responses by id via a
//! map of oneshot senders.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use mcp_types::CallToolRequest;
use mcp_types::CallToolRequestParams;
use mcp_types::CallToolResult;
use mcp_types::ClientCapabilities;
use mcp_types::ClientCapabilitiesRoots;
use mcp_types::Implementation;
use mcp_types::InitializeRequest;
use mcp_types::InitializeRequestParams;
use mcp_types::InitializedNotification;
use mcp_types::JSONRPC_VERSION;
use mcp_types::JSONRPCErrorError;
use mcp_types::JSONRPCMessage;
use mcp_types::JSONRPCNotification;
use mcp_types::JSONRPCRequest;
use mcp_types::JSONRPCResponse;
use mcp_types::ListRootsResult;
use mcp_types::ListToolsRequest;
use mcp_types::ListToolsRequestParams;
use mcp_types::ListToolsResult;
use mcp_types::ModelContextProtocolNotification;
use mcp_types::ModelContextProtocolRequest;
use mcp_types::RequestId;
use mcp_types::Root;
use mcp_types::RootsListChangedNotification;
use mcp_types::ServerNotification;
use mcp_types::ServerRequest;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::info;
use tracing::warn;

/// Capacity of the channel between callers and the stdin writer task.
const CHANNEL_CAPACITY: usize = 128;

/// Timeout for the initialize handshake with a freshly spawned server.
const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(10);

/// Either the `result` of a JSON-RPC response or its `error` object.
type PendingResult = std::result::Result<serde_json::Value, JSONRPCErrorError>;

type PendingMap = Arc<Mutex<HashMap<RequestId, oneshot::Sender<PendingResult>>>>;

pub struct McpClient {
    /// Retained so the child is killed when the client is dropped. The Tokio
    /// runtime makes a best effort to reap it afterwards (`kill_on_drop`).
    #[allow(dead_code)]
    child: tokio::process::Child,
    outgoing_tx: mpsc::Sender<JSONRPCMessage>,
    pending: PendingMap,
    next_request_id: AtomicI64,
    roots: Arc<Mutex<Vec<Root>>>,
    /// Fulfilled by the reader task when the server re-requests `roots/list`
    /// after a list_changed notification. Cleared on timeout so a stale ack
    /// cannot resolve a later wait.
    roots_ack: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl McpClient {
    /// Spawn `program args..` and perform the MCP initialize handshake over
    /// its stdio. `env` is applied on top of the inherited environment; when
    /// `stderr_log` is set the child's stderr is appended there instead of
    /// sharing the proxy's stderr.
    pub async fn new_stdio_client(
        program: String,
        args: Vec<String>,
        env: Option<HashMap<String, String>>,
        stderr_log: Option<PathBuf>,
    ) -> Result<Self> {
        let mut command = Command::new(&program);
        command
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true);
        if let Some(env) = env {
            command.envs(env);
        }
        match &stderr_log {
            Some(path) => {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("failed to open stderr log {}", path.display()))?;
                command.stderr(Stdio::from(file));
            }
            None => {
                command.stderr(Stdio::inherit());
            }
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn `{program}`"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("child stdin was not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("child stdout was not captured"))?;

        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<JSONRPCMessage>(CHANNEL_CAPACITY);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let roots: Arc<Mutex<Vec<Root>>> = Arc::new(Mutex::new(Vec::new()));
        let roots_ack: Arc<Mutex<Option<oneshot::Sender<()>>>> = Arc::new(Mutex::new(None));

        // Writer task: serialize outgoing messages, one per line.
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(message) = outgoing_rx.recv().await {
                let json = match serde_json::to_string(&message) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("failed to serialize outgoing message: {e}");
                        continue;
                    }
                };
                if stdin.write_all(json.as_bytes()).await.is_err()
                    || stdin.write_all(b"\n").await.is_err()
                    || stdin.flush().await.is_err()
                {
                    debug!("child stdin closed");
                    break;
                }
            }
        });

        // Reader task: route responses by id, serve server-initiated
        // requests, log notifications.
        tokio::spawn({
            let pending = Arc::clone(&pending);
            let roots = Arc::clone(&roots);
            let roots_ack = Arc::clone(&roots_ack);
            let outgoing_tx = outgoing_tx.clone();
            async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let message = match serde_json::from_str::<JSONRPCMessage>(&line) {
                        Ok(message) => message,
                        Err(e) => {
                            warn!("failed to deserialize message from server: {e}");
                            continue;
                        }
                    };
                    match message {
                        JSONRPCMessage::Response(response) => {
                            dispatch_response(&pending, response.id, Ok(response.result)).await;
                        }
                        JSONRPCMessage::Error(error) => {
                            dispatch_response(&pending, error.id, Err(error.error)).await;
                        }
                        JSONRPCMessage::Request(request) => {
                            handle_server_request(
                                request,
                                &outgoing_tx,
                                &roots,
                                &roots_ack,
                            )
                            .await;
                        }
                        JSONRPCMessage::Notification(notification) => {
                            handle_server_notification(notification);
                        }
                    }
                }
                debug!("server stdout closed (EOF)");
                // Wake up any caller still waiting on a response.
                pending.lock().await.clear();
            }
        });

        let client = Self {
            child,
            outgoing_tx,
            pending,
            next_request_id: AtomicI64::new(0),
            roots,
            roots_ack,
        };
        client.initialize().await?;
        Ok(client)
    }

    async fn initialize(&self) -> Result<()> {
        let params = InitializeRequestParams {
            capabilities: ClientCapabilities {
                experimental: None,
                roots: Some(ClientCapabilitiesRoots {
                    list_changed: Some(true),
                }),
                sampling: None,
            },
            client_info: Implementation {
                name: "ironcurtain-proxy".to_string(),
                title: None,
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            protocol_version: mcp_types::MCP_SCHEMA_VERSION.to_string(),
        };
        self.send_request::<InitializeRequest>(params, Some(INITIALIZE_TIMEOUT))
            .await
            .context("initialize handshake failed")?;
        self.send_notification::<InitializedNotification>(None).await
    }

    pub async fn list_tools(
        &self,
        params: Option<ListToolsRequestParams>,
        timeout: Option<Duration>,
    ) -> Result<ListToolsResult> {
        self.send_request::<ListToolsRequest>(params, timeout).await
    }

    pub async fn call_tool(
        &self,
        name: String,
        arguments: Option<serde_json::Value>,
        timeout: Option<Duration>,
    ) -> Result<CallToolResult> {
        let params = CallToolRequestParams { arguments, name };
        self.send_request::<CallToolRequest>(params, timeout).await
    }

    /// Grant the backing server an additional filesystem root and notify it.
    /// Returns true when the server acknowledged (by re-listing roots) within
    /// `ack_timeout`, false when the wait timed out; the call proceeds either
    /// way and a timed-out ack slot is cleared.
    pub async fn add_root(&self, root: Root, ack_timeout: Duration) -> Result<bool> {
        {
            let mut roots = self.roots.lock().await;
            if !roots.iter().any(|r| r.uri == root.uri) {
                roots.push(root);
            }
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let mut slot = self.roots_ack.lock().await;
            *slot = Some(ack_tx);
        }
        self.send_notification::<RootsListChangedNotification>(None)
            .await?;
        match tokio::time::timeout(ack_timeout, ack_rx).await {
            Ok(Ok(())) => Ok(true),
            _ => {
                self.roots_ack.lock().await.take();
                Ok(false)
            }
        }
    }

    async fn send_request<T>(&self, params: T::Params, timeout: Option<Duration>) -> Result<T::Result>
    where
        T: ModelContextProtocolRequest,
        T::Params: Serialize,
        T::Result: DeserializeOwned,
    {
        let id = RequestId::Integer(self.next_request_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        let request = JSONRPCMessage::Request(JSONRPCRequest {
            jsonrpc: JSONRPC_VERSION.into(),
            id: id.clone(),
            method: T::METHOD.to_string(),
            params: Some(serde_json::to_value(params)?),
        });
        if self.outgoing_tx.send(request).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(anyhow!("server connection closed"));
        }

        let outcome = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.pending.lock().await.remove(&id);
                    return Err(anyhow!(
                        "request `{}` timed out after {timeout:?}",
                        T::METHOD
                    ));
                }
            },
            None => rx.await,
        };
        match outcome {
            Ok(Ok(result)) => serde_json::from_value(result)
                .with_context(|| format!("failed to deserialize `{}` result", T::METHOD)),
            Ok(Err(error)) => Err(anyhow!(McpServerError(error))),
            Err(_) => Err(anyhow!("server exited before responding to `{}`", T::METHOD)),
        }
    }

    async fn send_notification<T>(&self, params: Option<serde_json::Value>) -> Result<()>
    where
        T: ModelContextProtocolNotification,
    {
        let notification = JSONRPCMessage::Notification(JSONRPCNotification {
            jsonrpc: JSONRPC_VERSION.into(),
            method: T::METHOD.to_string(),
            params,
        });
        self.outgoing_tx
            .send(notification)
            .await
            .map_err(|_| anyhow!("server connection closed"))
    }
}

/// JSON-RPC error returned by the backing server. The `data` field, when
/// present, usually carries the more precise message.
#[derive(Debug)]
pub struct McpServerError(pub JSONRPCErrorError);

impl std::fmt::Display for McpServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.0.data {
            Some(data) => write!(f, "{} ({data})", self.0.message),
            None => write!(f, "{}", self.0.message),
        }
    }
}

impl std::error::Error for McpServerError {}

async fn dispatch_response(pending: &PendingMap, id: RequestId, result: PendingResult) {
    let entry = pending.lock().await.remove(&id);
    match entry {
        Some(tx) => {
            if tx.send(result).is_err() {
                debug!("caller for request {id} went away");
            }
        }
        None => warn!("received response for unknown request id {id}"),
    }
}

async fn handle_server_request(
    request: JSONRPCRequest,
    outgoing_tx: &mpsc::Sender<JSONRPCMessage>,
    roots: &Arc<Mutex<Vec<Root>>>,
    roots_ack: &Arc<Mutex<Option<oneshot::Sender<()>>>>,
) {
    let id = request.id.clone();
    let result = match ServerRequest::try_from(request) {
        Ok(ServerRequest::PingRequest(_)) => serde_json::json!({}),
        Ok(ServerRequest::ListRootsRequest(_)) => {
            // The server re-listing roots is the acknowledgement that it saw
            // our roots/list_changed notification.
            if let Some(ack) = roots_ack.lock().await.take() {
                let _ = ack.send(());
            }
            let roots = roots.lock().await.clone();
            match serde_json::to_value(ListRootsResult { roots }) {
                Ok(value) => value,
                Err(e) => {
                    warn!("failed to serialize roots list: {e}");
                    return;
                }
            }
        }
        Err(e) => {
            debug!("unsupported server request: {e}");
            return;
        }
    };
    let response = JSONRPCMessage::Response(JSONRPCResponse {
        jsonrpc: JSONRPC_VERSION.into(),
        id,
        result,
    });
    let _ = outgoing_tx.send(response).await;
}

fn handle_server_notification(notification: JSONRPCNotification) {
    match ServerNotification::try_from(notification) {
        Ok(ServerNotification::ToolListChangedNotification(_)) => {
            info!("backing server changed its tool list");
        }
        Ok(ServerNotification::LoggingMessageNotification(params)) => {
            debug!("server log: {params:?}");
        }
        Ok(ServerNotification::ProgressNotification(params)) => {
            debug!("server progress: {params:?}");
        }
        Err(e) => debug!("ignoring notification: {e}"),
    }
}
