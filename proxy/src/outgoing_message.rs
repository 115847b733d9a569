use mcp_types::JSONRPC_VERSION;
use mcp_types::JSONRPCError;
use mcp_types::JSONRPCErrorError;
use mcp_types::JSONRPCMessage;
use mcp_types::JSONRPCResponse;
use mcp_types::ModelContextProtocolRequest;
use mcp_types::RequestId;
use tokio::sync::mpsc;
use tracing::error;

/// Typed funnel for everything the proxy sends back to the agent.
pub(crate) struct OutgoingMessageSender {
    sender: mpsc::Sender<JSONRPCMessage>,
}

impl OutgoingMessageSender {
    pub(crate) fn new(sender: mpsc::Sender<JSONRPCMessage>) -> Self {
        Self { sender }
    }

    pub(crate) async fn send_response<T>(&self, id: RequestId, result: T::Result)
    where
        T: ModelContextProtocolRequest,
    {
        let result = match serde_json::to_value(result) {
            Ok(result) => result,
            Err(e) => {
                error!("failed to serialize `{}` response: {e}", T::METHOD);
                return;
            }
        };
        let message = JSONRPCMessage::Response(JSONRPCResponse {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            result,
        });
        let _ = self.sender.send(message).await;
    }

    pub(crate) async fn send_error(&self, id: RequestId, error: JSONRPCErrorError) {
        let message = JSONRPCMessage::Error(JSONRPCError {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            error,
        });
        let _ = self.sender.send(message).await;
    }
}
