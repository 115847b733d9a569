//! The agent-facing MCP server.
//!
//! One long-lived session per connection: a reader task feeds parsed
//! JSON-RPC messages into a bounded channel, the processor dispatches them
//! (spawning a task per tool call so a suspended escalation never blocks the
//! loop), and a writer task serializes outgoing messages line by line.
#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use ironcurtain_core::ProxySession;
use ironcurtain_core::config::ProxyConfig;
use ironcurtain_core::config::TransportConfig;
use mcp_types::JSONRPCMessage;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::io::{self};
use tokio::net::TcpListener;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::error;
use tracing::info;

mod message_processor;
mod outgoing_message;

use crate::message_processor::MessageProcessor;
use crate::outgoing_message::OutgoingMessageSender;

/// Size of the bounded channels between the transport tasks.
const CHANNEL_CAPACITY: usize = 128;

/// Start the proxy on the configured transport. Configuration problems have
/// already been caught; anything failing here (artifacts, policy
/// construction, listeners) is fatal before the first request is accepted.
pub async fn run_main(config: ProxyConfig) -> Result<()> {
    let transport = config.transport.clone();
    let (session, start_errors) = ProxySession::start(config)
        .await
        .context("failed to start proxy session")?;
    for (server, err) in &start_errors {
        error!("backing server `{server}` failed to start: {err:#}");
    }
    let session = Arc::new(session);

    match transport {
        TransportConfig::Stdio => {
            info!("serving MCP on stdio");
            serve_connection(Arc::clone(&session), BufReader::new(io::stdin()), io::stdout())
                .await;
            // The agent hung up; flush the audit log before exiting.
            if let Ok(session) = Arc::try_unwrap(session) {
                session.shutdown().await;
            }
        }
        TransportConfig::UnixSocket(path) => {
            // A stale socket file from a previous run would make bind fail.
            let _ = std::fs::remove_file(&path);
            let listener =
                UnixListener::bind(&path).with_context(|| format!("bind {}", path.display()))?;
            info!("serving MCP on unix socket {}", path.display());
            loop {
                let (stream, _) = listener.accept().await?;
                let (read_half, write_half) = stream.into_split();
                serve_connection(Arc::clone(&session), BufReader::new(read_half), write_half)
                    .await;
                debug!("unix socket session ended");
            }
        }
        TransportConfig::Tcp { port, port_file } => {
            let listener = TcpListener::bind(("127.0.0.1", port))
                .await
                .with_context(|| format!("bind 127.0.0.1:{port}"))?;
            let local_port = listener.local_addr()?.port();
            if let Some(port_file) = port_file {
                tokio::fs::write(&port_file, local_port.to_string())
                    .await
                    .with_context(|| format!("write {}", port_file.display()))?;
            }
            info!("serving MCP on 127.0.0.1:{local_port}");
            loop {
                let (stream, peer) = listener.accept().await?;
                debug!("accepted connection from {peer}");
                let (read_half, write_half) = stream.into_split();
                serve_connection(Arc::clone(&session), BufReader::new(read_half), write_half)
                    .await;
                debug!("tcp session ended");
            }
        }
    }
    Ok(())
}

/// Run one MCP session over a line-delimited JSON-RPC stream until EOF.
async fn serve_connection<R, W>(session: Arc<ProxySession>, reader: R, writer: W)
where
    R: AsyncBufReadExt + AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (incoming_tx, mut incoming_rx) = mpsc::channel::<JSONRPCMessage>(CHANNEL_CAPACITY);
    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<JSONRPCMessage>(CHANNEL_CAPACITY);

    // Task: read lines, push parsed messages.
    let reader_handle = tokio::spawn(async move {
        let mut lines = reader.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JSONRPCMessage>(&line) {
                Ok(message) => {
                    if incoming_tx.send(message).await.is_err() {
                        break;
                    }
                }
                Err(e) => error!("failed to deserialize incoming message: {e}"),
            }
        }
        debug!("reader finished (EOF)");
    });

    // Task: dispatch messages; tool calls are spawned so the loop stays
    // responsive while a call waits on escalation or a slow backend.
    // `outgoing_tx` is moved in (not cloned) so the writer task observes the
    // channel closing once the processor and its spawned calls are done.
    let processor_handle = tokio::spawn({
        let outgoing = Arc::new(OutgoingMessageSender::new(outgoing_tx));
        let mut processor = MessageProcessor::new(session, outgoing);
        async move {
            while let Some(message) = incoming_rx.recv().await {
                match message {
                    JSONRPCMessage::Request(request) => processor.process_request(request).await,
                    JSONRPCMessage::Notification(notification) => {
                        processor.process_notification(notification).await;
                    }
                    JSONRPCMessage::Response(response) => processor.process_response(response),
                    JSONRPCMessage::Error(err) => processor.process_error(err),
                }
            }
            // The agent went away: cancel in-flight calls so pending
            // escalations are dropped and late response files are ignored.
            processor.cancel_inflight().await;
            debug!("processor finished (channel closed)");
        }
    });

    // Task: serialize outgoing messages, one per line.
    let writer_handle = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(message) = outgoing_rx.recv().await {
            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(e) => {
                    error!("failed to serialize outgoing message: {e}");
                    continue;
                }
            };
            if writer.write_all(json.as_bytes()).await.is_err()
                || writer.write_all(b"\n").await.is_err()
                || writer.flush().await.is_err()
            {
                error!("failed to write to transport");
                break;
            }
        }
        debug!("writer finished (channel closed)");
    });

    let _ = tokio::join!(reader_handle, processor_handle, writer_handle);
}
