//! MCP Server Handler Implementation

use crate::gdb::{ExpandOptions, GdbEvent, GdbSession, SessionOptions};
use crate::mcp::protocol::*;
use crate::mcp::tools::get_all_tools;
use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

type Arguments = Option<serde_json::Map<String, serde_json::Value>>;

/// Events kept for `gdb_events` before the oldest are dropped
const EVENT_BUFFER_LIMIT: usize = 1000;

/// GDB MCP Server
pub struct GdbMcpServer {
    session: RwLock<Option<GdbSession>>,
    events: Arc<Mutex<VecDeque<GdbEvent>>>,
    notifier: Option<mpsc::UnboundedSender<Notification>>,
}

impl Default for GdbMcpServer {
    fn default() -> Self {
        Self::new()
    }
}

impl GdbMcpServer {
    pub fn new() -> Self {
        Self {
            session: RwLock::new(None),
            events: Arc::new(Mutex::new(VecDeque::new())),
            notifier: None,
        }
    }

    /// Also relay session events to the client as logging notifications.
    pub fn with_notifier(mut self, notifier: mpsc::UnboundedSender<Notification>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Get server info
    pub fn get_info(&self) -> InitializeResult {
        InitializeResult {
            protocol_version: "2024-11-05".to_string(),
            capabilities: ServerCapabilities {
                logging: Some(serde_json::json!({})),
                tools: Some(ToolsCapability {
                    list_changed: Some(false),
                }),
            },
            server_info: Implementation {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            instructions: Some(
                "GDB/MI debugging session.\n\n\
                 Start with 'gdb_start' (executable, optional source file and options), set breakpoints \
                 with 'gdb_break_insert', and control execution with 'gdb_run', 'gdb_continue', \
                 'gdb_next', 'gdb_step' and 'gdb_finish'.\n\n\
                 After each stop, 'gdb_variables' and 'gdb_callstack' return the refreshed state; \
                 'gdb_expand' walks into nested values and 'gdb_events' drains what happened."
                    .to_string(),
            ),
        }
    }

    /// Handle initialize request
    pub async fn handle_initialize(&self, _params: Option<serde_json::Value>) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self.get_info())?)
    }

    /// Handle tools/list request
    pub async fn handle_tools_list(&self) -> Result<serde_json::Value> {
        let tools: Vec<Tool> = get_all_tools()
            .into_iter()
            .map(|t| Tool {
                name: t.name,
                description: Some(t.description),
                input_schema: t.input_schema,
            })
            .collect();

        let result = ListToolsResult {
            tools,
            next_cursor: None,
        };
        Ok(serde_json::to_value(result)?)
    }

    /// Handle tools/call request
    pub async fn handle_tools_call(&self, params: Option<serde_json::Value>) -> Result<serde_json::Value> {
        let params = params.ok_or_else(|| anyhow!("Missing params"))?;
        let request: CallToolRequest = serde_json::from_value(params)?;

        debug!("Calling tool: {}", request.name);

        let args = request.arguments;
        let result = match request.name.as_str() {
            "gdb_start" => self.handle_start(args).await,
            "gdb_stop" => self.handle_stop().await,
            "gdb_run" => self.handle_run().await,
            "gdb_continue" => self.handle_continue().await,
            "gdb_next" => self.handle_next().await,
            "gdb_step" => self.handle_step().await,
            "gdb_finish" => self.handle_finish().await,
            "gdb_pause" => self.handle_pause().await,
            "gdb_break_insert" => self.handle_break_insert(args).await,
            "gdb_break_delete" => self.handle_break_delete(args).await,
            "gdb_break_list" => self.handle_break_list(args).await,
            "gdb_watch_add" => self.handle_watch_add(args).await,
            "gdb_watch_remove" => self.handle_watch_remove(args).await,
            "gdb_variables" => self.handle_variables(args).await,
            "gdb_expand" => self.handle_expand(args).await,
            "gdb_callstack" => self.handle_callstack(args).await,
            "gdb_status" => self.handle_status().await,
            "gdb_events" => self.handle_events(args).await,
            "gdb_raw_command" => self.handle_raw_command(args).await,
            _ => Ok(CallToolResult::error_text(format!("Unknown tool: {}", request.name))),
        };

        // Tool failures are reported to the model, not as protocol errors
        let result = result.unwrap_or_else(|e| CallToolResult::error_text(e.to_string()));
        Ok(serde_json::to_value(result)?)
    }

    /// Install `session` as the active session and start relaying its events.
    pub async fn set_session(&self, session: GdbSession) {
        if let Some(events) = session.take_events() {
            self.spawn_event_forwarder(events);
        }
        *self.session.write().await = Some(session);
    }

    fn spawn_event_forwarder(&self, mut events: mpsc::UnboundedReceiver<GdbEvent>) {
        let buffer = Arc::clone(&self.events);
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let level = match event {
                    GdbEvent::Output { .. } => "debug",
                    _ => "info",
                };
                let data = notifier
                    .as_ref()
                    .and_then(|_| serde_json::to_value(&event).ok());

                {
                    let mut buffer = buffer.lock();
                    if buffer.len() >= EVENT_BUFFER_LIMIT {
                        buffer.pop_front();
                    }
                    buffer.push_back(event);
                }

                if let (Some(notifier), Some(data)) = (&notifier, data) {
                    let _ = notifier.send(Notification::logging(level, "gdb", data));
                }
            }
            debug!("Session event stream closed");
        });
    }

    async fn session(&self) -> Result<GdbSession> {
        self.session
            .read()
            .await
            .clone()
            .ok_or_else(|| anyhow!("GDB session not started"))
    }

    // ========================================================================
    // Tool Handlers
    // ========================================================================

    async fn handle_start(&self, args: Arguments) -> Result<CallToolResult> {
        let executable = required_str(&args, "executable")?;
        let source = optional_str(&args, "source");
        let options: SessionOptions = match args.as_ref().and_then(|a| a.get("options")) {
            Some(value) => serde_json::from_value(value.clone())?,
            None => SessionOptions::default(),
        };

        if self.session.read().await.is_some() {
            return Ok(CallToolResult::error_text(
                "GDB session already running. Use gdb_stop first.",
            ));
        }

        info!("Starting GDB session for {}", executable);

        let session = GdbSession::new(options.clone());
        self.set_session(session.clone()).await;
        if let Err(e) = session.start(&executable, source.as_deref(), options).await {
            self.session.write().await.take();
            session.stop().await?;
            return Ok(CallToolResult::error_text(format!("Failed to start GDB: {}", e)));
        }

        Ok(CallToolResult::text(format!(
            "Loaded {}. Set breakpoints with gdb_break_insert, then gdb_run.",
            executable
        )))
    }

    async fn handle_stop(&self) -> Result<CallToolResult> {
        info!("Stopping GDB session");

        let session = self.session.write().await.take();
        if let Some(session) = session {
            session.stop().await?;
            Ok(CallToolResult::text("GDB session stopped successfully."))
        } else {
            Ok(CallToolResult::error_text("No GDB session is running."))
        }
    }

    async fn handle_run(&self) -> Result<CallToolResult> {
        self.session().await?.run().await?;
        Ok(CallToolResult::text("Program started. Use gdb_events to wait for a stop."))
    }

    async fn handle_continue(&self) -> Result<CallToolResult> {
        self.session().await?.continue_execution().await?;
        Ok(CallToolResult::text("Continuing."))
    }

    async fn handle_next(&self) -> Result<CallToolResult> {
        self.session().await?.step_over().await?;
        Ok(CallToolResult::text("Stepping over."))
    }

    async fn handle_step(&self) -> Result<CallToolResult> {
        self.session().await?.step_into().await?;
        Ok(CallToolResult::text("Stepping into."))
    }

    async fn handle_finish(&self) -> Result<CallToolResult> {
        self.session().await?.step_out().await?;
        Ok(CallToolResult::text("Running until the current function returns."))
    }

    async fn handle_pause(&self) -> Result<CallToolResult> {
        self.session().await?.pause().await?;
        Ok(CallToolResult::text("Interrupt sent."))
    }

    async fn handle_break_insert(&self, args: Arguments) -> Result<CallToolResult> {
        let file = required_str(&args, "file")?;
        let line = args
            .as_ref()
            .and_then(|a| a.get("line"))
            .and_then(|v| v.as_u64())
            .ok_or_else(|| anyhow!("line is required"))?;

        info!("Inserting breakpoint at {}:{}", file, line);

        let bp = self.session().await?.set_breakpoint(&file, line).await?;
        Ok(CallToolResult::success(vec![
            Content::text(format!("Breakpoint {} inserted at {}:{}", bp.number, bp.file, bp.line)),
            Content::text(serde_json::to_string_pretty(&bp)?),
        ]))
    }

    async fn handle_break_delete(&self, args: Arguments) -> Result<CallToolResult> {
        let number = required_str(&args, "number")?;
        self.session().await?.remove_breakpoint(&number).await?;
        Ok(CallToolResult::text(format!("Breakpoint {} deleted.", number)))
    }

    async fn handle_break_list(&self, args: Arguments) -> Result<CallToolResult> {
        let session = self.session().await?;
        let breakpoints = if optional_bool(&args, "debugger") {
            session.list_breakpoints().await?
        } else {
            session.breakpoints()
        };
        Ok(CallToolResult::json(&breakpoints)?)
    }

    async fn handle_watch_add(&self, args: Arguments) -> Result<CallToolResult> {
        let expression = required_str(&args, "expression")?;
        self.session().await?.add_watch_variable(&expression).await;
        Ok(CallToolResult::text(format!("Watching {}", expression)))
    }

    async fn handle_watch_remove(&self, args: Arguments) -> Result<CallToolResult> {
        let expression = required_str(&args, "expression")?;
        self.session().await?.remove_watch_variable(&expression).await;
        Ok(CallToolResult::text(format!("Stopped watching {}", expression)))
    }

    async fn handle_variables(&self, args: Arguments) -> Result<CallToolResult> {
        let session = self.session().await?;
        if optional_bool(&args, "refresh") {
            session.update_variables().await;
        }
        Ok(CallToolResult::json(&session.variables())?)
    }

    async fn handle_expand(&self, args: Arguments) -> Result<CallToolResult> {
        let name = required_str(&args, "name")?;
        let options: ExpandOptions =
            serde_json::from_value(serde_json::Value::Object(args.unwrap_or_default()))?;

        let node = self.session().await?.expand_variable(&name, options).await?;
        Ok(CallToolResult::json(&node)?)
    }

    async fn handle_callstack(&self, args: Arguments) -> Result<CallToolResult> {
        let session = self.session().await?;
        if optional_bool(&args, "refresh") {
            session.update_call_stack().await;
        }
        Ok(CallToolResult::json(&session.call_stack())?)
    }

    async fn handle_status(&self) -> Result<CallToolResult> {
        let guard = self.session.read().await;
        let Some(session) = guard.as_ref() else {
            return Ok(CallToolResult::text("No GDB session is running."));
        };

        let status = serde_json::json!({
            "state": session.state(),
            "executable": session.executable(),
            "breakpoints": session.breakpoints(),
            "watches": session.watch_expressions(),
            "queuedEvents": self.events.lock().len(),
        });
        Ok(CallToolResult::json(&status)?)
    }

    async fn handle_events(&self, args: Arguments) -> Result<CallToolResult> {
        let max = args
            .as_ref()
            .and_then(|a| a.get("max"))
            .and_then(|v| v.as_u64())
            .map_or(usize::MAX, |n| n as usize);

        let events: Vec<GdbEvent> = {
            let mut buffer = self.events.lock();
            let count = buffer.len().min(max);
            buffer.drain(..count).collect()
        };
        Ok(CallToolResult::json(&events)?)
    }

    async fn handle_raw_command(&self, args: Arguments) -> Result<CallToolResult> {
        let command = required_str(&args, "command")?;
        let session = self.session().await?;

        if optional_bool(&args, "console") {
            let output = session.send_console_command(&command).await?;
            return Ok(CallToolResult::text(output));
        }

        let command = command.strip_prefix('-').unwrap_or(&command);
        let reply = session.send_command(command).await?;
        let mut content = vec![Content::text(serde_json::to_string_pretty(&reply.results)?)];
        if !reply.console.is_empty() {
            content.push(Content::text(reply.console));
        }
        Ok(CallToolResult::success(content))
    }
}

fn optional_str(args: &Arguments, key: &str) -> Option<String> {
    args.as_ref()
        .and_then(|a| a.get(key))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

fn required_str(args: &Arguments, key: &str) -> Result<String> {
    optional_str(args, key).ok_or_else(|| anyhow!("{} is required", key))
}

fn optional_bool(args: &Arguments, key: &str) -> bool {
    args.as_ref()
        .and_then(|a| a.get(key))
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gdb::session::test_support::attached;
    use crate::gdb::SessionState;
    use serde_json::json;

    async fn call(server: &GdbMcpServer, name: &str, arguments: serde_json::Value) -> serde_json::Value {
        server
            .handle_tools_call(Some(json!({ "name": name, "arguments": arguments })))
            .await
            .unwrap()
    }

    fn text(result: &serde_json::Value) -> &str {
        result["content"][0]["text"].as_str().unwrap()
    }

    #[tokio::test]
    async fn test_tools_list() {
        let server = GdbMcpServer::new();
        let result = server.handle_tools_list().await.unwrap();
        let tools = result["tools"].as_array().unwrap();
        assert_eq!(tools.len(), get_all_tools().len());
        assert!(tools[0]["inputSchema"].is_object());
    }

    #[tokio::test]
    async fn test_initialize_uses_camel_case() {
        let server = GdbMcpServer::new();
        let result = server.handle_initialize(None).await.unwrap();
        assert_eq!(result["protocolVersion"], "2024-11-05");
        assert_eq!(result["serverInfo"]["name"], env!("CARGO_PKG_NAME"));
    }

    #[tokio::test]
    async fn test_tools_need_a_session() {
        let server = GdbMcpServer::new();

        let result = call(&server, "gdb_continue", json!({})).await;
        assert_eq!(result["isError"], true);
        assert_eq!(text(&result), "GDB session not started");

        let result = call(&server, "gdb_stop", json!({})).await;
        assert_eq!(result["isError"], true);

        let result = call(&server, "gdb_bogus", json!({})).await;
        assert_eq!(text(&result), "Unknown tool: gdb_bogus");
    }

    #[tokio::test]
    async fn test_start_reports_spawn_failure() {
        let server = GdbMcpServer::new();
        let result = call(
            &server,
            "gdb_start",
            json!({
                "executable": "/bin/app",
                "options": { "debuggerPath": "/nonexistent/gdb", "stopGraceMs": 0 }
            }),
        )
        .await;
        assert_eq!(result["isError"], true);
        assert!(text(&result).starts_with("Failed to start GDB"));
        assert!(server.session.read().await.is_none());
    }

    #[tokio::test]
    async fn test_breakpoint_tool_and_events() {
        let (notifier, mut notifications) = mpsc::unbounded_channel();
        let server = GdbMcpServer::new().with_notifier(notifier);
        let (session, mut gdb) = attached(SessionOptions::default()).await;
        server.set_session(session.clone()).await;

        let (result, ()) = tokio::join!(
            call(&server, "gdb_break_insert", json!({ "file": "a.cpp", "line": 5 })),
            gdb.reply(
                "break-insert -f a.cpp:5",
                r#"done,bkpt={number="1",type="breakpoint",file="a.cpp",line="5"}"#
            )
        );
        assert_eq!(result["isError"], false);
        assert_eq!(text(&result), "Breakpoint 1 inserted at a.cpp:5");

        let notification = notifications.recv().await.unwrap();
        assert_eq!(notification.params.unwrap()["data"]["event"], "breakpoint-set");

        let events = call(&server, "gdb_events", json!({})).await;
        let events: serde_json::Value = serde_json::from_str(text(&events)).unwrap();
        assert_eq!(events[0]["event"], "breakpoint-set");
        assert_eq!(events[0]["breakpoint"]["number"], "1");

        let drained = call(&server, "gdb_events", json!({})).await;
        assert_eq!(text(&drained), "[]");

        let status = call(&server, "gdb_status", json!({})).await;
        let status: serde_json::Value = serde_json::from_str(text(&status)).unwrap();
        assert_eq!(status["state"], json!(SessionState::NotStarted));
        assert_eq!(status["breakpoints"][0]["line"], 5);
    }

    #[tokio::test]
    async fn test_expand_tool_arguments() {
        let server = GdbMcpServer::new();
        let (session, _gdb) = attached(SessionOptions::default()).await;
        server.set_session(session).await;

        let result = call(
            &server,
            "gdb_expand",
            json!({ "name": "pt", "scope": "local", "path": [0] }),
        )
        .await;
        assert_eq!(result["isError"], true);
        assert_eq!(text(&result), "variable `pt` not found");
    }
}
