//! stdio transport for MCP JSON-RPC
//!
//! Requests are handled concurrently so slow bridge calls do not hold up
//! the rest; every line written to stdout goes through one lock.

use crate::GodotBridgeServer;
use crate::mcp::{
    InitializeParams, InitializeResult, Notification, Request, RequestId, Response,
    ServerCapabilities, ServerInfo, ToolsCapability,
};
use crate::tools::{handle_tool_call, list_tools};
use godot_bridge::{BridgeEvent, EventKind};
use godot_bridge_core::{BridgeError, Result, error_codes};
use serde::Serialize;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, broadcast};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Protocol revision answered when the client does not name one
const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";

/// Run the MCP server on stdio
pub async fn run(server: GodotBridgeServer) -> Result<()> {
    match server.editor().start().await {
        Ok(addr) => info!("Waiting for the editor plugin on ws://{}", addr),
        // The debugger tools still work without the editor channel
        Err(e) => warn!("Editor bridge unavailable: {}", e),
    }
    serve(server, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Serve newline-delimited JSON-RPC from `input` until EOF
pub async fn serve<R, W>(server: GodotBridgeServer, input: R, output: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let output = Arc::new(Mutex::new(output));
    let mut reader = BufReader::new(input);
    let mut line = String::new();

    info!("Godot bridge MCP server starting on stdio");

    let forwarders = [
        spawn_event_forwarder(server.dap().subscribe_events(), output.clone()),
        spawn_event_forwarder(server.editor().subscribe_events(), output.clone()),
    ];
    let mut in_flight = JoinSet::new();

    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line).await.map_err(|e| {
            BridgeError::TransportClosed(format!("Failed to read stdin: {}", e))
        })?;

        if bytes_read == 0 {
            // EOF - client disconnected
            info!("Client disconnected (EOF)");
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        debug!("Received: {}", trimmed);

        let request: Request = match serde_json::from_str(trimmed) {
            Ok(r) => r,
            Err(e) => {
                error!("Failed to parse request: {}", e);
                continue;
            }
        };

        let server = server.clone();
        let output = output.clone();
        in_flight.spawn(async move {
            let Some(response) = handle_request(request, &server).await else {
                return;
            };
            if let Err(e) = write_line(&output, &response).await {
                error!("Failed to write response: {}", e);
            }
        });
        while in_flight.try_join_next().is_some() {}
    }

    // Answer what was already asked before shutting the bridges down
    while in_flight.join_next().await.is_some() {}
    for forwarder in forwarders {
        forwarder.abort();
    }
    server.shutdown().await;

    Ok(())
}

async fn write_line<W, T>(output: &Mutex<W>, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let json = serde_json::to_string(message)?;
    debug!("Sending: {}", json);

    let mut out = output.lock().await;
    out.write_all(json.as_bytes()).await.map_err(stdout_error)?;
    out.write_all(b"\n").await.map_err(stdout_error)?;
    out.flush().await.map_err(stdout_error)
}

fn stdout_error(e: std::io::Error) -> BridgeError {
    BridgeError::TransportClosed(format!("Failed to write stdout: {}", e))
}

/// Forward bridge events as MCP log notifications
fn spawn_event_forwarder<W>(
    mut rx: broadcast::Receiver<BridgeEvent>,
    output: Arc<Mutex<W>>,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let level = match EventKind::of(&event.name) {
                        EventKind::Output => "info",
                        EventKind::StateChanged => "notice",
                        EventKind::LifecycleEnded => "warning",
                        EventKind::Other => "debug",
                    };
                    let notification = Notification::log_message(
                        level,
                        event.channel,
                        serde_json::json!({ "event": event.name, "payload": event.payload }),
                    );
                    if let Err(e) = write_line(&output, &notification).await {
                        error!("Failed to write event notification: {}", e);
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event channel closed");
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event forwarder lagged, missed {} events", n);
                }
            }
        }
    })
}

/// Dispatch one request; notifications get no response
async fn handle_request(request: Request, server: &GodotBridgeServer) -> Option<Response> {
    let Some(id) = request.id.clone() else {
        debug!("Notification: {}", request.method);
        return None;
    };

    let response = match request.method.as_str() {
        "initialize" => handle_initialize(id, request.params),
        "initialized" | "ping" => Response::success(id, serde_json::json!({})),
        "tools/list" => {
            Response::success(id, serde_json::json!({ "tools": list_tools() }))
        }
        "tools/call" => handle_tools_call(id, request.params, server).await,
        _ => Response::error(
            id,
            error_codes::METHOD_NOT_FOUND,
            format!("Method not found: {}", request.method),
        ),
    };
    Some(response)
}

fn handle_initialize(id: RequestId, params: serde_json::Value) -> Response {
    let protocol_version = if params.is_null() {
        DEFAULT_PROTOCOL_VERSION.to_string()
    } else {
        match serde_json::from_value::<InitializeParams>(params) {
            Ok(p) => {
                info!("Client: {} {}", p.client_info.name, p.client_info.version);
                p.protocol_version
            }
            Err(e) => {
                return Response::error(
                    id,
                    error_codes::INVALID_PARAMS,
                    format!("Invalid initialize params: {}", e),
                );
            }
        }
    };

    let result = InitializeResult {
        protocol_version,
        capabilities: ServerCapabilities {
            tools: ToolsCapability {
                list_changed: false,
            },
            logging: serde_json::json!({}),
        },
        server_info: ServerInfo {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    };

    match serde_json::to_value(result) {
        Ok(value) => Response::success(id, value),
        Err(e) => Response::error(id, error_codes::INTERNAL_ERROR, e.to_string()),
    }
}

async fn handle_tools_call(
    id: RequestId,
    params: serde_json::Value,
    server: &GodotBridgeServer,
) -> Response {
    #[derive(serde::Deserialize)]
    struct ToolCallParams {
        name: String,
        #[serde(default)]
        arguments: serde_json::Value,
    }

    let params: ToolCallParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => {
            return Response::error(
                id,
                error_codes::INVALID_PARAMS,
                format!("Invalid tool call params: {}", e),
            );
        }
    };

    handle_tool_call(&params.name, params.arguments, id, server).await
}
