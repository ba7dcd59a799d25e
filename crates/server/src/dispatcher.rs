//! The stdio JSON-RPC dispatcher.
//!
//! One reader loop pulls newline-framed messages, tool calls run on worker
//! tasks, and every outbound message funnels through a single writer task
//! so line framing is never interleaved.  Responses are in arrival order
//! for inline methods and completion order for tool calls; ordering is
//! guaranteed only per request id.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::protocol::{
    self, INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, Inbound, METHOD_NOT_FOUND, PARSE_ERROR,
    PROTOCOL_VERSION, RpcRequest, RpcResponse,
};
use crate::registry::{ToolContext, ToolRegistry};

/// How long in-flight tool tasks get to observe cancellation at shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Dispatcher {
    registry: ToolRegistry,
    initialized: AtomicBool,
    server_name: String,
    server_version: String,
}

impl Dispatcher {
    pub fn new(registry: ToolRegistry) -> Arc<Self> {
        Arc::new(Self {
            registry,
            initialized: AtomicBool::new(false),
            server_name: "engram".to_string(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    /// Run the transport until EOF or shutdown.
    pub async fn serve<R, W>(
        self: Arc<Self>,
        reader: R,
        writer: W,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::channel::<String>(64);
        let writer_task = tokio::spawn(write_loop(writer, out_rx));

        let mut lines = BufReader::new(reader).lines();
        let mut workers: JoinSet<()> = JoinSet::new();
        let mut shutdown_rx = shutdown.clone();

        info!(version = %self.server_version, "dispatcher listening on stdio");
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("shutdown signalled — dispatcher stops reading");
                    break;
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        self.handle_line(&line, &out_tx, &shutdown, &mut workers).await;
                    }
                    Ok(None) => {
                        info!("stdin closed — dispatcher stops reading");
                        break;
                    }
                    Err(err) => {
                        error!(%err, "stdin read failed");
                        break;
                    }
                }
            }
        }

        // Bounded drain: give in-flight tools a window to observe
        // cancellation, then abort whatever remains.
        let drain = async {
            while workers.join_next().await.is_some() {}
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            warn!("in-flight tools exceeded the drain window — aborting");
            workers.abort_all();
        }

        drop(out_tx);
        let _ = writer_task.await;
        Ok(())
    }

    async fn handle_line(
        &self,
        line: &str,
        out_tx: &mpsc::Sender<String>,
        shutdown: &watch::Receiver<bool>,
        workers: &mut JoinSet<()>,
    ) {
        match protocol::classify(line) {
            Inbound::Request(request) => {
                self.dispatch(request, out_tx, shutdown, workers).await;
            }
            Inbound::Notification { method } => match method.as_str() {
                "notifications/initialized" => debug!("client finished initialization"),
                other => debug!(method = other, "ignoring notification"),
            },
            Inbound::MalformedNotification => {
                debug!("dropping malformed notification");
            }
            Inbound::ParseError => {
                send(
                    out_tx,
                    RpcResponse::failure(Value::Null, PARSE_ERROR, "parse error"),
                )
                .await;
            }
        }
    }

    async fn dispatch(
        &self,
        request: RpcRequest,
        out_tx: &mpsc::Sender<String>,
        shutdown: &watch::Receiver<bool>,
        workers: &mut JoinSet<()>,
    ) {
        match request.method.as_str() {
            "initialize" => {
                self.initialized.store(true, Ordering::SeqCst);
                let result = json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": { "tools": {} },
                    "serverInfo": {
                        "name": self.server_name,
                        "version": self.server_version,
                    },
                });
                send(out_tx, RpcResponse::success(request.id, result)).await;
            }
            "ping" => {
                send(out_tx, RpcResponse::success(request.id, json!({}))).await;
            }
            "tools/list" => {
                if !self.initialized.load(Ordering::SeqCst) {
                    send(
                        out_tx,
                        RpcResponse::failure(
                            request.id,
                            INVALID_REQUEST,
                            "server not initialized",
                        ),
                    )
                    .await;
                    return;
                }
                let result = json!({ "tools": self.registry.descriptors() });
                send(out_tx, RpcResponse::success(request.id, result)).await;
            }
            "tools/call" => {
                if !self.initialized.load(Ordering::SeqCst) {
                    send(
                        out_tx,
                        RpcResponse::failure(
                            request.id,
                            INVALID_REQUEST,
                            "server not initialized",
                        ),
                    )
                    .await;
                    return;
                }
                self.spawn_tool_call(request, out_tx, shutdown, workers).await;
            }
            other => {
                send(
                    out_tx,
                    RpcResponse::failure(
                        request.id,
                        METHOD_NOT_FOUND,
                        format!("method not found: {other}"),
                    ),
                )
                .await;
            }
        }
    }

    async fn spawn_tool_call(
        &self,
        request: RpcRequest,
        out_tx: &mpsc::Sender<String>,
        shutdown: &watch::Receiver<bool>,
        workers: &mut JoinSet<()>,
    ) {
        let params = request.params.unwrap_or_else(|| json!({}));
        let Some(name) = params.get("name").and_then(|name| name.as_str()) else {
            send(
                out_tx,
                RpcResponse::failure(request.id, INVALID_PARAMS, "missing tool name"),
            )
            .await;
            return;
        };
        let Some(tool) = self.registry.get(name) else {
            send(
                out_tx,
                RpcResponse::failure(
                    request.id,
                    METHOD_NOT_FOUND,
                    format!("unknown tool: {name}"),
                ),
            )
            .await;
            return;
        };

        let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
        let tool_name = name.to_string();
        let id = request.id;
        let out_tx = out_tx.clone();
        let mut cancel = shutdown.clone();
        let ctx = ToolContext::new(shutdown.clone());

        workers.spawn(async move {
            debug!(tool = %tool_name, "tool call started");
            let outcome = tokio::select! {
                outcome = tool.execute(&ctx, &arguments) => outcome,
                _ = cancel.changed() => Err(anyhow::anyhow!("operation cancelled")),
            };
            let result = match outcome {
                Ok(text) => {
                    debug!(tool = %tool_name, "tool call succeeded");
                    protocol::tool_result(&text, false)
                }
                Err(err) => {
                    warn!(tool = %tool_name, %err, "tool call failed");
                    protocol::tool_result(&format!("Error: {err}"), true)
                }
            };
            send(&out_tx, RpcResponse::success(id, result)).await;
        });
    }
}

async fn send(out_tx: &mpsc::Sender<String>, response: RpcResponse) {
    match serde_json::to_string(&response) {
        Ok(encoded) => {
            if out_tx.send(encoded).await.is_err() {
                warn!("writer task gone — dropping response");
            }
        }
        Err(err) => {
            // Should be unreachable for our own types; keep the stream alive.
            error!(%err, "failed to serialise response");
            let fallback = RpcResponse::failure(Value::Null, INTERNAL_ERROR, "internal error");
            if let Ok(encoded) = serde_json::to_string(&fallback) {
                let _ = out_tx.send(encoded).await;
            }
        }
    }
}

/// Single writer: one message per line, flushed after every message.
async fn write_loop<W>(mut writer: W, mut out_rx: mpsc::Receiver<String>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = out_rx.recv().await {
        if writer.write_all(line.as_bytes()).await.is_err() {
            error!("stdout write failed — writer stopping");
            return;
        }
        if writer.write_all(b"\n").await.is_err() {
            return;
        }
        if writer.flush().await.is_err() {
            return;
        }
    }
    let _ = writer.flush().await;
}
