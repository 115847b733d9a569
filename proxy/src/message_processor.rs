use std::collections::HashMap;
use std::sync::Arc;

use ironcurtain_core::ProxySession;
use mcp_types::CallToolRequest;
use mcp_types::ClientNotification;
use mcp_types::ClientRequest;
use mcp_types::InitializeRequest;
use mcp_types::InitializeRequestParams;
use mcp_types::JSONRPCError;
use mcp_types::JSONRPCErrorError;
use mcp_types::JSONRPCNotification;
use mcp_types::JSONRPCRequest;
use mcp_types::JSONRPCResponse;
use mcp_types::ListToolsRequest;
use mcp_types::ListToolsResult;
use mcp_types::PingRequest;
use mcp_types::RequestId;
use mcp_types::ServerCapabilities;
use mcp_types::ServerCapabilitiesTools;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::outgoing_message::OutgoingMessageSender;

pub(crate) struct MessageProcessor {
    session: Arc<ProxySession>,
    outgoing: Arc<OutgoingMessageSender>,
    initialized: bool,
    /// In-flight tool calls by request id, so a cancellation notification or
    /// an agent disconnect can abort them.
    inflight: Arc<Mutex<HashMap<RequestId, AbortHandle>>>,
}

impl MessageProcessor {
    pub(crate) fn new(session: Arc<ProxySession>, outgoing: Arc<OutgoingMessageSender>) -> Self {
        Self {
            session,
            outgoing,
            initialized: false,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub(crate) async fn process_request(&mut self, request: JSONRPCRequest) {
        let request_id = request.id.clone();
        let method = request.method.clone();
        let client_request = match ClientRequest::try_from(request) {
            Ok(client_request) => client_request,
            Err(e) => {
                warn!("failed to convert request: {e}");
                self.outgoing
                    .send_error(
                        request_id,
                        JSONRPCErrorError {
                            code: -32601,
                            message: format!("unsupported method: {method}"),
                            data: None,
                        },
                    )
                    .await;
                return;
            }
        };

        match client_request {
            ClientRequest::InitializeRequest(params) => {
                self.handle_initialize(request_id, params).await;
            }
            ClientRequest::PingRequest(_) => {
                self.outgoing
                    .send_response::<PingRequest>(request_id, serde_json::json!({}))
                    .await;
            }
            ClientRequest::ListToolsRequest(_) => {
                let result = ListToolsResult {
                    next_cursor: None,
                    tools: self.session.list_tools(),
                };
                self.outgoing
                    .send_response::<ListToolsRequest>(request_id, result)
                    .await;
            }
            ClientRequest::CallToolRequest(params) => {
                self.handle_call_tool(request_id, params).await;
            }
        }
    }

    pub(crate) async fn process_notification(&mut self, notification: JSONRPCNotification) {
        match ClientNotification::try_from(notification) {
            Ok(ClientNotification::InitializedNotification(_)) => {
                debug!("agent finished initialization");
            }
            Ok(ClientNotification::CancelledNotification(params)) => {
                let removed = self.inflight.lock().await.remove(&params.request_id);
                if let Some(handle) = removed {
                    info!("cancelling request {} on agent's behalf", params.request_id);
                    handle.abort();
                }
            }
            Ok(ClientNotification::RootsListChangedNotification(_)) => {
                debug!("agent changed its roots");
            }
            Err(e) => debug!("ignoring notification: {e}"),
        }
    }

    pub(crate) fn process_response(&mut self, response: JSONRPCResponse) {
        debug!("<- response: {response:?}");
    }

    pub(crate) fn process_error(&mut self, error: JSONRPCError) {
        warn!("<- error: {error:?}");
    }

    /// Abort every in-flight call; used when the agent disconnects. Dropped
    /// tasks stop polling their escalation response files, so a decision
    /// arriving later is simply ignored.
    pub(crate) async fn cancel_inflight(&mut self) {
        let mut inflight = self.inflight.lock().await;
        for (request_id, handle) in inflight.drain() {
            debug!("aborting in-flight request {request_id}");
            handle.abort();
        }
    }

    async fn handle_initialize(&mut self, id: RequestId, params: InitializeRequestParams) {
        if self.initialized {
            self.outgoing
                .send_error(
                    id,
                    JSONRPCErrorError {
                        code: -32600,
                        message: "initialize called more than once".to_string(),
                        data: None,
                    },
                )
                .await;
            return;
        }
        self.initialized = true;
        info!(
            "agent `{}` {} connected",
            params.client_info.name, params.client_info.version
        );

        let result = mcp_types::InitializeResult {
            capabilities: ServerCapabilities {
                tools: Some(ServerCapabilitiesTools {
                    list_changed: Some(false),
                }),
                ..Default::default()
            },
            instructions: None,
            protocol_version: params.protocol_version,
            server_info: mcp_types::Implementation {
                name: "ironcurtain-proxy".to_string(),
                title: None,
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };
        self.outgoing
            .send_response::<InitializeRequest>(id, result)
            .await;
    }

    async fn handle_call_tool(
        &mut self,
        id: RequestId,
        params: <CallToolRequest as mcp_types::ModelContextProtocolRequest>::Params,
    ) {
        let session = Arc::clone(&self.session);
        let outgoing = Arc::clone(&self.outgoing);
        let inflight = Arc::clone(&self.inflight);
        let task_id = id.clone();
        let handle = tokio::spawn(async move {
            let result = session.handle_call_tool(params).await;
            outgoing
                .send_response::<CallToolRequest>(task_id.clone(), result)
                .await;
            inflight.lock().await.remove(&task_id);
        });
        self.inflight.lock().await.insert(id, handle.abort_handle());
    }
}
