//! GDB/MI session MCP server
//!
//! Exposes one GDB/MI debugging session as Model Context Protocol tools over
//! stdio. Session events (stops, breakpoint changes, program output) are
//! queued for the `gdb_events` tool and relayed as logging notifications.
//!
//! Usage:
//!   ```json
//!   {
//!     "mcpServers": {
//!       "gdb": {
//!         "command": "/path/to/gdb-mi-session"
//!       }
//!     }
//!   }
//!   ```

use anyhow::Result;
use gdb_mi_session::mcp::protocol::*;
use gdb_mi_session::mcp::GdbMcpServer;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// MCP Server state
struct ServerState {
    server: GdbMcpServer,
    initialized: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging to stderr; stdout carries the protocol
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    info!(
        "Starting {} v{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    // Responses and notifications share stdout through one writer task
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            debug!("Sending: {}", line);
            if stdout.write_all(line.as_bytes()).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
                || stdout.flush().await.is_err()
            {
                error!("stdout closed");
                break;
            }
        }
    });

    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<Notification>();
    let notify_out = out_tx.clone();
    tokio::spawn(async move {
        while let Some(notification) = notify_rx.recv().await {
            if let Ok(line) = serde_json::to_string(&notification) {
                let _ = notify_out.send(line);
            }
        }
    });

    let state = RwLock::new(ServerState {
        server: GdbMcpServer::new().with_notifier(notify_tx),
        initialized: false,
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    info!("MCP server ready, listening on stdin");

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("Error reading from stdin: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        debug!("Received: {}", line);

        match serde_json::from_str::<JsonRpcRequest>(&line) {
            Ok(req) => {
                let id = req.id.clone();
                match handle_request(&state, req).await {
                    Ok(Some(resp)) => send(&out_tx, &resp)?,
                    Ok(None) => {
                        // Notification, no response needed
                    }
                    Err(e) => {
                        error!("Error handling request: {}", e);
                        send(
                            &out_tx,
                            &JsonRpcErrorResponse {
                                jsonrpc: "2.0".to_string(),
                                id,
                                error: JsonRpcError::from_anyhow(e),
                            },
                        )?;
                    }
                }
            }
            Err(e) => {
                error!("Failed to parse request: {}", e);
                send(
                    &out_tx,
                    &JsonRpcErrorResponse {
                        jsonrpc: "2.0".to_string(),
                        id: None,
                        error: JsonRpcError::parse_error(),
                    },
                )?;
            }
        }
    }

    info!("MCP server shutting down");
    {
        let state = state.read().await;
        state
            .server
            .handle_tools_call(Some(serde_json::json!({ "name": "gdb_stop" })))
            .await?;
    }
    drop(state);
    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

fn send<T: Serialize>(out: &mpsc::UnboundedSender<String>, message: &T) -> Result<()> {
    out.send(serde_json::to_string(message)?)?;
    Ok(())
}

/// Handle a JSON-RPC request
async fn handle_request(
    state: &RwLock<ServerState>,
    request: JsonRpcRequest,
) -> Result<Option<JsonRpcResponse>> {
    let method = request.method.as_str();

    debug!("Handling method: {}", method);

    let result = match method {
        "initialize" => {
            let mut state = state.write().await;
            state.initialized = true;
            state.server.handle_initialize(request.params).await?
        }
        "notifications/initialized" | "initialized" => return Ok(None),
        "ping" | "logging/setLevel" => serde_json::json!({}),
        "tools/list" => {
            let state = state.read().await;
            if !state.initialized {
                warn!("tools/list before initialize");
            }
            state.server.handle_tools_list().await?
        }
        "tools/call" => {
            let state = state.read().await;
            state.server.handle_tools_call(request.params).await?
        }
        "resources/list" => serde_json::json!({ "resources": [] }),
        "prompts/list" => serde_json::json!({ "prompts": [] }),
        _ => {
            warn!("Unknown method: {}", method);
            return Err(JsonRpcError::method_not_found(method).into());
        }
    };

    Ok(Some(JsonRpcResponse::new(request.id, result)))
}
