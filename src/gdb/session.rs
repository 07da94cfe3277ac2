//! GDB Session Controller
//!
//! Drives one debugger subprocess over MI: correlates tokened commands with
//! their replies, tracks the run/stop state from async records, and keeps the
//! breakpoint list, watch set, variable snapshot and call stack current.

use crate::gdb::console::{default_console, InferiorConsole};
use crate::gdb::error::{GdbError, Result};
use crate::gdb::parser::{
    error_message, parse_breakpoint, parse_breakpoint_list, parse_frame, parse_stack_frames,
    parse_symbol_variables, quote, MiParser,
};
use crate::gdb::types::*;
use crate::gdb::variables::{build_tree, parse_variable_block};
use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A command waiting for its `token^class` reply
struct PendingRequest {
    command: String,
    reply: oneshot::Sender<Result<MiReply>>,
    /// Console stream text collected while this request is in flight
    capture: Option<String>,
}

#[derive(Debug, Default)]
struct RunState {
    state: SessionState,
    /// Set right before an exec command; a `*running` without it is ignored
    expect_running: bool,
    launched: bool,
    program_exited: bool,
}

struct Inner {
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    token_counter: AtomicU64,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    run: Mutex<RunState>,
    event_tx: mpsc::UnboundedSender<GdbEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<GdbEvent>>>,
    breakpoints: Mutex<Vec<Breakpoint>>,
    watches: Mutex<Vec<String>>,
    variables: ArcSwap<VariableSnapshot>,
    call_stack: ArcSwap<Vec<Frame>>,
    /// Console capture is single-flight
    console_lock: tokio::sync::Mutex<()>,
    child: Mutex<Option<Child>>,
    options: RwLock<SessionOptions>,
    executable: RwLock<Option<String>>,
    source_file: RwLock<Option<String>>,
    console: Mutex<Option<Arc<dyn InferiorConsole>>>,
    exited_emitted: AtomicBool,
    parser: MiParser,
}

/// Handle to a debugger session. Clones share the same session.
#[derive(Clone)]
pub struct GdbSession {
    inner: Arc<Inner>,
}

impl Default for GdbSession {
    fn default() -> Self {
        Self::new(SessionOptions::default())
    }
}

impl GdbSession {
    pub fn new(options: SessionOptions) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                writer: tokio::sync::Mutex::new(None),
                token_counter: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
                run: Mutex::new(RunState::default()),
                event_tx,
                event_rx: Mutex::new(Some(event_rx)),
                breakpoints: Mutex::new(Vec::new()),
                watches: Mutex::new(Vec::new()),
                variables: ArcSwap::from_pointee(VariableSnapshot::default()),
                call_stack: ArcSwap::from_pointee(Vec::new()),
                console_lock: tokio::sync::Mutex::new(()),
                child: Mutex::new(None),
                options: RwLock::new(options),
                executable: RwLock::new(None),
                source_file: RwLock::new(None),
                console: Mutex::new(None),
                exited_emitted: AtomicBool::new(false),
                parser: MiParser::new(),
            }),
        }
    }

    /// Use `console` instead of the strategy derived from the options.
    pub fn set_console(&self, console: impl InferiorConsole + 'static) {
        *self.inner.console.lock() = Some(Arc::new(console));
    }

    /// Spawn the debugger and load `executable`.
    pub async fn start(
        &self,
        executable: &str,
        source: Option<&str>,
        options: SessionOptions,
    ) -> Result<()> {
        info!("Starting {} for {}", options.debugger_path, executable);

        let mut cmd = Command::new(&options.debugger_path);
        cmd.args(&options.debugger_args)
            .envs(&options.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| GdbError::Spawn {
            path: options.debugger_path.clone(),
            source,
        })?;

        let stdin = child.stdin.take().ok_or(GdbError::NotRunning)?;
        let stdout = child.stdout.take().ok_or(GdbError::NotRunning)?;
        if let Some(stderr) = child.stderr.take() {
            let event_tx = self.inner.event_tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("GDB stderr: {}", line);
                    let _ = event_tx.send(GdbEvent::Output {
                        channel: OutputChannel::Log,
                        content: line,
                    });
                }
            });
        }
        *self.inner.child.lock() = Some(child);
        *self.inner.options.write() = options;

        self.attach(stdout, stdin).await;
        self.load(executable, source).await
    }

    /// Drive the session over an arbitrary byte transport.
    pub async fn attach<R, W>(&self, reader: R, writer: W)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        *self.inner.writer.lock().await = Some(Box::new(writer));
        self.inner.exited_emitted.store(false, Ordering::SeqCst);
        self.spawn_reader(reader);
    }

    /// Configure the attached debugger and load `executable`.
    pub async fn load(&self, executable: &str, source: Option<&str>) -> Result<()> {
        let options = self.options();
        *self.inner.run.lock() = RunState::default();
        *self.inner.executable.write() = Some(executable.to_string());
        *self.inner.source_file.write() = source.map(str::to_string);

        for command in [
            "gdb-set confirm off",
            "gdb-set pagination off",
            "enable-pretty-printing",
            "gdb-set print array-indexes on",
        ] {
            self.send_command(command).await?;
        }
        self.send_command(&format!("gdb-set print elements {}", options.print_elements))
            .await?;
        self.send_command(&format!("file-exec-and-symbols {}", mi_argument(executable)))
            .await?;

        let console = self
            .inner
            .console
            .lock()
            .clone()
            .unwrap_or_else(|| Arc::from(default_console(&options)));
        debug!("Preparing {} console", console.name());
        console.prepare(self).await?;

        self.set_state(SessionState::Loaded);
        info!("Loaded {}", executable);
        self.emit(GdbEvent::Started {
            executable: executable.to_string(),
        });
        Ok(())
    }

    // ========================================================================
    // Transport
    // ========================================================================

    fn spawn_reader<R>(&self, reader: R)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let Some(inner) = weak.upgrade() else {
                            return;
                        };
                        if buf.last() == Some(&b'\n') {
                            buf.pop();
                        }
                        if buf.last() == Some(&b'\r') {
                            buf.pop();
                        }
                        GdbSession { inner }.dispatch_line(&String::from_utf8_lossy(&buf));
                    }
                    Err(e) => {
                        error!("Error reading GDB output: {}", e);
                        break;
                    }
                }
            }

            if let Some(inner) = weak.upgrade() {
                GdbSession { inner }.transport_closed().await;
            }
            info!("GDB output reader stopped");
        });
    }

    async fn transport_closed(&self) {
        self.inner.writer.lock().await.take();
        let child = self.inner.child.lock().take();
        let (code, signal) = match child {
            Some(mut child) => match child.wait().await {
                Ok(status) => (status.code(), exit_signal(&status)),
                Err(e) => {
                    warn!("Failed to reap debugger: {}", e);
                    (None, None)
                }
            },
            None => (None, None),
        };
        self.reject_pending();
        self.set_state(SessionState::Exited);
        self.emit_exited(code, signal);
    }

    fn reject_pending(&self) {
        let pending: Vec<PendingRequest> =
            self.inner.pending.lock().drain().map(|(_, p)| p).collect();
        for request in pending {
            debug!("Abandoning `{}`", request.command);
            let _ = request.reply.send(Err(GdbError::Abandoned(request.command)));
        }
    }

    fn emit_exited(&self, code: Option<i32>, signal: Option<i32>) {
        if !self.inner.exited_emitted.swap(true, Ordering::SeqCst) {
            info!("GDB exited (code {:?}, signal {:?})", code, signal);
            self.emit(GdbEvent::Exited { code, signal });
        }
    }

    fn emit(&self, event: GdbEvent) {
        debug!("Event: {}", event.name());
        let _ = self.inner.event_tx.send(event);
    }

    fn set_state(&self, state: SessionState) {
        self.inner.run.lock().state = state;
    }

    // ========================================================================
    // Inbound records
    // ========================================================================

    fn dispatch_line(&self, line: &str) {
        debug!("GDB output: {}", line);

        let record = match self.inner.parser.parse_line(line) {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(e) => {
                warn!("Failed to parse line: {} - {}", line, e);
                // A garbled reply still settles its request
                let token = line
                    .split_once('^')
                    .and_then(|(token, _)| token.parse::<u64>().ok());
                if let Some(pending) = token.and_then(|t| self.inner.pending.lock().remove(&t)) {
                    let _ = pending.reply.send(Err(GdbError::Parse(e)));
                }
                return;
            }
        };

        match record {
            MiOutputRecord::Result {
                token,
                class,
                results,
            } => self.resolve(token, class, results),
            MiOutputRecord::Async { class, results, .. } => match class {
                AsyncClass::Stopped => self.handle_stopped(&results),
                AsyncClass::Running => self.handle_running(),
                AsyncClass::Other(class) => debug!("Ignoring *{}", class),
            },
            MiOutputRecord::Notification { class, results } => {
                self.handle_notification(class, &results)
            }
            MiOutputRecord::Console(text) => {
                if let Some(text) = self.capture(text) {
                    self.emit(GdbEvent::Output {
                        channel: OutputChannel::Console,
                        content: text,
                    });
                }
            }
            MiOutputRecord::Target(content) => self.emit(GdbEvent::Output {
                channel: OutputChannel::Target,
                content,
            }),
            MiOutputRecord::Log(content) => self.emit(GdbEvent::Output {
                channel: OutputChannel::Log,
                content,
            }),
        }
    }

    /// Hand console text to the capturing request, or give it back.
    fn capture(&self, text: String) -> Option<String> {
        let mut pending = self.inner.pending.lock();
        match pending.values_mut().find_map(|p| p.capture.as_mut()) {
            Some(buffer) => {
                buffer.push_str(&text);
                None
            }
            None => Some(text),
        }
    }

    fn resolve(&self, token: Option<u64>, class: ResultClass, results: MiTuple) {
        let Some(token) = token else {
            debug!("Result record without token: {:?}", class);
            return;
        };
        let Some(pending) = self.inner.pending.lock().remove(&token) else {
            debug!("No pending request for token {}", token);
            return;
        };

        let reply = if class.is_success() {
            Ok(MiReply {
                results,
                console: pending.capture.unwrap_or_default(),
            })
        } else {
            Err(GdbError::Command(error_message(&results)))
        };
        let _ = pending.reply.send(reply);
    }

    fn handle_stopped(&self, results: &MiTuple) {
        let reason_text = results.get_str("reason").unwrap_or("unknown").to_string();
        let reason = StopReason::from(reason_text.as_str());

        if reason.is_exit() {
            let exit_code = results
                .get_str("exit-code")
                .and_then(parse_exit_code)
                .or((reason == StopReason::ExitedNormally).then_some(0));
            self.program_exited(exit_code);
            return;
        }

        {
            let mut run = self.inner.run.lock();
            run.state = SessionState::Stopped;
            run.expect_running = false;
        }

        let frame = results.get_tuple("frame").map(parse_frame);
        info!("Stopped: {}", reason_text);
        self.emit(GdbEvent::Stopped {
            reason: reason_text,
            frame,
        });

        if self.inner.options.read().auto_refresh {
            let session = self.clone();
            tokio::spawn(async move {
                session.update_variables().await;
                session.update_call_stack().await;
            });
        }
    }

    fn handle_running(&self) {
        {
            let mut run = self.inner.run.lock();
            if !run.expect_running {
                debug!("Ignoring unexpected *running");
                return;
            }
            run.expect_running = false;
            run.state = SessionState::Running;
        }
        self.emit(GdbEvent::Running);
    }

    fn handle_notification(&self, class: NotificationClass, results: &MiTuple) {
        match class {
            NotificationClass::ThreadGroupExited => {
                if !self.inner.run.lock().launched {
                    return;
                }
                let exit_code = results.get_str("exit-code").and_then(parse_exit_code);
                self.program_exited(exit_code);
            }
            other => debug!("Notification: {:?}", other),
        }
    }

    fn program_exited(&self, exit_code: Option<i64>) {
        {
            let mut run = self.inner.run.lock();
            if run.program_exited {
                return;
            }
            run.program_exited = true;
            run.expect_running = false;
            run.state = SessionState::Exited;
        }
        info!("Program exited with code {:?}", exit_code);
        self.emit(GdbEvent::ProgramExited { exit_code });
    }

    // ========================================================================
    // Outbound commands
    // ========================================================================

    /// Send an MI command (without the leading `-`) and wait for its reply.
    pub async fn send_command(&self, command: &str) -> Result<MiReply> {
        self.send_request(command, false).await
    }

    /// Run a CLI command through `interpreter-exec console` and return the
    /// console text it printed.
    pub async fn send_console_command(&self, command: &str) -> Result<String> {
        let _guard = self.inner.console_lock.lock().await;
        let reply = self
            .send_request(&format!("interpreter-exec console {}", quote(command)), true)
            .await?;
        Ok(reply.console)
    }

    async fn send_request(&self, command: &str, capture: bool) -> Result<MiReply> {
        let token = self.inner.token_counter.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();

        // Registered before writing so a fast reply cannot be missed
        self.inner.pending.lock().insert(
            token,
            PendingRequest {
                command: command.to_string(),
                reply: tx,
                capture: capture.then(String::new),
            },
        );

        if let Err(e) = self.write_line(&format!("{}-{}\n", token, command)).await {
            self.inner.pending.lock().remove(&token);
            return Err(e);
        }

        rx.await
            .unwrap_or_else(|_| Err(GdbError::Abandoned(command.to_string())))
    }

    /// Send a command without waiting for its reply.
    pub async fn send_command_async(&self, command: &str) -> Result<()> {
        let token = self.inner.token_counter.fetch_add(1, Ordering::SeqCst);
        self.write_line(&format!("{}-{}\n", token, command)).await
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        debug!("Sending command: {}", line.trim_end());
        let mut guard = self.inner.writer.lock().await;
        let writer = guard.as_mut().ok_or(GdbError::NotRunning)?;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    // ========================================================================
    // Execution control
    // ========================================================================

    /// Start the inferior.
    pub async fn run(&self) -> Result<()> {
        {
            let mut run = self.inner.run.lock();
            run.launched = true;
            run.program_exited = false;
        }
        info!("Running inferior");
        let result = self.exec("exec-run").await;
        if result.is_err() {
            self.inner.run.lock().launched = false;
        }
        result
    }

    /// Resume; delegates to [`run`](Self::run) when nothing is live yet,
    /// either before the first launch or after the program exited.
    pub async fn continue_execution(&self) -> Result<()> {
        let needs_launch = {
            let run = self.inner.run.lock();
            !run.launched || run.program_exited
        };
        if needs_launch {
            return self.run().await;
        }
        match self.exec("exec-continue").await {
            Err(GdbError::Command(msg)) if is_already_running(&msg) => {
                debug!("Continue ignored: {}", msg);
                Ok(())
            }
            other => other,
        }
    }

    pub async fn step_over(&self) -> Result<()> {
        self.step("exec-next").await
    }

    pub async fn step_into(&self) -> Result<()> {
        self.step("exec-step").await
    }

    pub async fn step_out(&self) -> Result<()> {
        self.step("exec-finish").await
    }

    /// Interrupt the running inferior.
    pub async fn pause(&self) -> Result<()> {
        self.send_command("exec-interrupt").await?;
        Ok(())
    }

    async fn step(&self, command: &str) -> Result<()> {
        let state = self.state();
        if state != SessionState::Stopped {
            debug!("Ignoring {} while {}", command, state);
            return Ok(());
        }
        self.exec(command).await
    }

    async fn exec(&self, command: &str) -> Result<()> {
        self.inner.run.lock().expect_running = true;
        match self.send_command(command).await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.inner.run.lock().expect_running = false;
                Err(e)
            }
        }
    }

    // ========================================================================
    // Breakpoints
    // ========================================================================

    pub async fn set_breakpoint(&self, file: &str, line: u64) -> Result<Breakpoint> {
        let location = format!("{}:{}", file, line);
        let reply = self
            .send_command(&format!("break-insert -f {}", mi_argument(&location)))
            .await?;
        let mut breakpoint = parse_breakpoint(&reply.results)
            .ok_or_else(|| GdbError::UnexpectedReply("break-insert".to_string()))?;

        // Pending breakpoints come back without a location
        if breakpoint.file.is_empty() {
            breakpoint.file = file.to_string();
        }
        if breakpoint.line == 0 {
            breakpoint.line = line;
        }

        info!("Breakpoint {} at {}", breakpoint.number, location);
        self.inner.breakpoints.lock().push(breakpoint.clone());
        self.emit(GdbEvent::BreakpointSet {
            breakpoint: breakpoint.clone(),
        });
        Ok(breakpoint)
    }

    pub async fn remove_breakpoint(&self, number: &str) -> Result<()> {
        self.send_command(&format!("break-delete {}", number)).await?;
        self.inner.breakpoints.lock().retain(|b| b.number != number);
        self.emit(GdbEvent::BreakpointRemoved {
            number: number.to_string(),
        });
        Ok(())
    }

    /// The debugger's own breakpoint table.
    pub async fn list_breakpoints(&self) -> Result<Vec<Breakpoint>> {
        let reply = self.send_command("break-list").await?;
        Ok(parse_breakpoint_list(&reply.results))
    }

    // ========================================================================
    // Variables
    // ========================================================================

    pub async fn add_watch_variable(&self, expression: &str) {
        let expression = expression.trim();
        {
            let mut watches = self.inner.watches.lock();
            if expression.is_empty() || watches.iter().any(|w| w == expression) {
                return;
            }
            watches.push(expression.to_string());
        }
        self.update_variables().await;
    }

    pub async fn remove_watch_variable(&self, expression: &str) {
        let expression = expression.trim();
        self.inner.watches.lock().retain(|w| w != expression);
        self.inner.variables.rcu(|snapshot| {
            let mut next = VariableSnapshot::clone(snapshot);
            next.watches.retain(|node| node.name != expression);
            Arc::new(next)
        });
        self.emit(GdbEvent::VariablesUpdated(self.inner.variables.load_full()));
    }

    /// Refresh locals, watches and (optionally) globals. No-op unless stopped.
    pub async fn update_variables(&self) {
        if self.state() != SessionState::Stopped {
            return;
        }

        let mut snapshot = VariableSnapshot::default();
        match self.collect_locals().await {
            Ok(local) => snapshot.local = local,
            Err(e) => warn!("Failed to read locals: {}", e),
        }
        if self.inner.options.read().include_globals {
            match self.collect_globals().await {
                Ok(global) => snapshot.global = global,
                Err(e) => warn!("Failed to read globals: {}", e),
            }
        }
        let watches = self.watch_expressions();
        for expression in &watches {
            snapshot.watches.push(self.evaluate(expression).await);
        }

        let snapshot = Arc::new(snapshot);
        self.inner.variables.store(snapshot.clone());
        self.emit(GdbEvent::VariablesUpdated(snapshot));
    }

    async fn collect_locals(&self) -> Result<Vec<VariableNode>> {
        let mut nodes = parse_variable_block(&self.send_console_command("info locals").await?);
        nodes.extend(parse_variable_block(
            &self.send_console_command("info args").await?,
        ));
        Ok(nodes)
    }

    async fn collect_globals(&self) -> Result<Vec<VariableNode>> {
        let Some(source) = self.inner.source_file.read().clone() else {
            return Ok(Vec::new());
        };
        let source_name = Path::new(&source).file_name();

        let reply = self.send_command("symbol-info-variables").await?;
        let mut nodes: Vec<VariableNode> = Vec::new();
        for symbol in parse_symbol_variables(&reply.results) {
            let in_source = symbol
                .file
                .as_deref()
                .is_some_and(|file| Path::new(file).file_name() == source_name);
            if !in_source || nodes.iter().any(|n| n.name == symbol.name) {
                continue;
            }
            let mut node = match self.send_console_command(&format!("output {}", symbol.name)).await
            {
                Ok(value) => build_tree(&symbol.name, &value),
                Err(e) => VariableNode::leaf(&symbol.name, e.to_string()),
            };
            node.var_type = symbol.type_name;
            nodes.push(node);
        }
        Ok(nodes)
    }

    /// Evaluate a watch expression; failures become the displayed value.
    async fn evaluate(&self, expression: &str) -> VariableNode {
        let value = match self.send_console_command(&format!("output {}", expression)).await {
            Ok(value) => value,
            Err(e) => return VariableNode::leaf(expression, e.to_string()),
        };
        let mut node = build_tree(expression, &value);
        if let Ok(whatis) = self.send_console_command(&format!("whatis {}", expression)).await {
            node.var_type = whatis
                .trim()
                .strip_prefix("type = ")
                .map(str::to_string);
        }
        node
    }

    pub async fn update_call_stack(&self) {
        if self.state() != SessionState::Stopped {
            return;
        }
        match self.send_command("stack-list-frames").await {
            Ok(reply) => {
                let frames = parse_stack_frames(&reply.results);
                self.inner.call_stack.store(Arc::new(frames.clone()));
                self.emit(GdbEvent::CallstackUpdated { frames });
            }
            Err(e) => warn!("Failed to read call stack: {}", e),
        }
    }

    /// Find a cached variable and walk `options.path` into it.
    ///
    /// A root without children is re-evaluated first (when stopped) and the
    /// richer tree replaces it in the snapshot.
    pub async fn expand_variable(&self, name: &str, options: ExpandOptions) -> Result<VariableNode> {
        let scopes = match options.scope {
            Some(scope) => vec![scope],
            None => vec![VariableScope::Watch, VariableScope::Local, VariableScope::Global],
        };

        let snapshot = self.inner.variables.load_full();
        let (scope, mut root) = scopes
            .iter()
            .find_map(|&scope| {
                snapshot
                    .scope(scope)
                    .iter()
                    .find(|node| node.name == name)
                    .map(|node| (scope, node.clone()))
            })
            .ok_or_else(|| GdbError::VariableNotFound(name.to_string()))?;

        if root.children.is_empty() && self.state() == SessionState::Stopped {
            match self.send_console_command(&format!("output {}", name)).await {
                Ok(value) => {
                    let enriched = build_tree(name, &value);
                    if !enriched.children.is_empty() {
                        root.value = enriched.value;
                        root.children = enriched.children;
                        self.inner.variables.rcu(|snapshot| {
                            let mut next = VariableSnapshot::clone(snapshot);
                            if let Some(node) =
                                next.scope_mut(scope).iter_mut().find(|n| n.name == name)
                            {
                                *node = root.clone();
                            }
                            Arc::new(next)
                        });
                    }
                }
                Err(e) => debug!("Could not re-evaluate {}: {}", name, e),
            }
        }

        root.descend(&options.path)
            .cloned()
            .ok_or_else(|| GdbError::InvalidPath {
                name: name.to_string(),
                path: options.path.clone(),
            })
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Interrupt, ask the debugger to exit, then kill it.
    pub async fn stop(&self) -> Result<()> {
        let attached =
            self.inner.writer.lock().await.is_some() || self.inner.child.lock().is_some();
        if !attached {
            return Ok(());
        }

        info!("Stopping GDB session");
        let grace = Duration::from_millis(self.inner.options.read().stop_grace_ms);

        if self.state() == SessionState::Running {
            if let Err(e) = self.send_command_async("exec-interrupt").await {
                debug!("Interrupt failed: {}", e);
            }
            tokio::time::sleep(grace).await;
        }
        if let Err(e) = self.send_command_async("gdb-exit").await {
            debug!("gdb-exit failed: {}", e);
        }
        tokio::time::sleep(grace).await;

        let child = self.inner.child.lock().take();
        let (code, signal) = match child {
            Some(mut child) => {
                if let Err(e) = child.kill().await {
                    debug!("Kill failed: {}", e);
                }
                match child.wait().await {
                    Ok(status) => (status.code(), exit_signal(&status)),
                    Err(_) => (None, None),
                }
            }
            None => (None, None),
        };

        self.inner.writer.lock().await.take();
        self.reject_pending();
        self.set_state(SessionState::Exited);
        self.emit_exited(code, signal);
        info!("GDB stopped");
        Ok(())
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn state(&self) -> SessionState {
        self.inner.run.lock().state
    }

    pub fn options(&self) -> SessionOptions {
        self.inner.options.read().clone()
    }

    pub fn executable(&self) -> Option<String> {
        self.inner.executable.read().clone()
    }

    pub fn breakpoints(&self) -> Vec<Breakpoint> {
        self.inner.breakpoints.lock().clone()
    }

    pub fn watch_expressions(&self) -> Vec<String> {
        self.inner.watches.lock().clone()
    }

    pub fn variables(&self) -> Arc<VariableSnapshot> {
        self.inner.variables.load_full()
    }

    pub fn call_stack(&self) -> Arc<Vec<Frame>> {
        self.inner.call_stack.load_full()
    }

    /// The event stream; available once.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<GdbEvent>> {
        self.inner.event_rx.lock().take()
    }
}

/// Quote an MI argument only when it needs it.
pub fn mi_argument(arg: &str) -> String {
    if arg.is_empty() || arg.chars().any(|c| c.is_whitespace() || c == '"' || c == '\\') {
        quote(arg)
    } else {
        arg.to_string()
    }
}

/// Exit codes in MI records are octal.
fn parse_exit_code(code: &str) -> Option<i64> {
    i64::from_str_radix(code, 8).ok()
}

fn is_already_running(msg: &str) -> bool {
    let msg = msg.to_ascii_lowercase();
    msg.contains("is running") || msg.contains("already running") || msg.contains("not stopped")
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use tokio::time::timeout;

    fn manual_refresh() -> SessionOptions {
        SessionOptions {
            auto_refresh: false,
            stop_grace_ms: 0,
            ..Default::default()
        }
    }

    async fn loaded(
        options: SessionOptions,
    ) -> (GdbSession, FakeGdb, mpsc::UnboundedReceiver<GdbEvent>) {
        let (session, mut gdb) = attached(options).await;
        let mut events = session.take_events().unwrap();
        let (result, ()) = tokio::join!(
            session.load("/bin/app", Some("src/a.cpp")),
            gdb.answer_load("/bin/app")
        );
        result.unwrap();
        assert_eq!(
            events.recv().await,
            Some(GdbEvent::Started {
                executable: "/bin/app".into()
            })
        );
        (session, gdb, events)
    }

    /// Drive the session into the stopped state through a `*stopped` record.
    async fn stop_at_main(gdb: &mut FakeGdb, events: &mut mpsc::UnboundedReceiver<GdbEvent>) {
        gdb.send("*stopped,reason=\"breakpoint-hit\",bkptno=\"1\",frame={addr=\"0x1149\",func=\"main\",file=\"a.cpp\",line=\"5\"},thread-id=\"1\"\n")
            .await;
        match events.recv().await {
            Some(GdbEvent::Stopped { reason, frame }) => {
                assert_eq!(reason, "breakpoint-hit");
                assert_eq!(frame.unwrap().line, Some(5));
            }
            other => panic!("expected stopped, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_load_sends_baseline_and_emits_started() {
        let (session, _gdb, _events) = loaded(manual_refresh()).await;
        assert_eq!(session.state(), SessionState::Loaded);
        assert_eq!(session.executable().as_deref(), Some("/bin/app"));
        assert!(session.take_events().is_none());
    }

    #[tokio::test]
    async fn test_set_breakpoint_from_reply() {
        let (session, mut gdb, mut events) = loaded(manual_refresh()).await;

        let (result, ()) = tokio::join!(
            session.set_breakpoint("a.cpp", 5),
            gdb.reply(
                "break-insert -f a.cpp:5",
                r#"done,bkpt={number="1",type="breakpoint",disp="keep",enabled="y",addr="0x0000000000001149",func="main",file="a.cpp",fullname="/src/a.cpp",line="5",thread-groups=["i1"],times="0"}"#
            )
        );
        let breakpoint = result.unwrap();
        assert_eq!(breakpoint.number, "1");
        assert_eq!(breakpoint.file, "a.cpp");
        assert_eq!(breakpoint.line, 5);
        assert_eq!(session.breakpoints(), vec![breakpoint.clone()]);
        assert_eq!(events.recv().await, Some(GdbEvent::BreakpointSet { breakpoint }));

        let (result, ()) = tokio::join!(session.remove_breakpoint("1"), gdb.reply("break-delete 1", "done"));
        result.unwrap();
        assert!(session.breakpoints().is_empty());
        assert_eq!(
            events.recv().await,
            Some(GdbEvent::BreakpointRemoved { number: "1".into() })
        );
    }

    #[tokio::test]
    async fn test_breakpoint_error_propagates() {
        let (session, mut gdb, _events) = loaded(manual_refresh()).await;

        let (result, ()) = tokio::join!(
            session.set_breakpoint("my file.c", 9),
            gdb.reply(
                r#"break-insert -f "my file.c:9""#,
                r#"error,msg="No source file named my file.c.""#
            )
        );
        match result {
            Err(GdbError::Command(msg)) => assert_eq!(msg, "No source file named my file.c."),
            other => panic!("unexpected {:?}", other),
        }
        assert!(session.breakpoints().is_empty());
    }

    #[tokio::test]
    async fn test_stopped_record_leaves_pending_requests_alone() {
        let (session, mut gdb, mut events) = loaded(manual_refresh()).await;

        let request = tokio::spawn({
            let session = session.clone();
            async move { session.send_command("data-evaluate-expression 1").await }
        });
        let token = gdb.expect("data-evaluate-expression 1").await;

        stop_at_main(&mut gdb, &mut events).await;
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.inner.pending.lock().len(), 1);

        gdb.send(&format!("{}^done,value=\"1\"\n", token)).await;
        let reply = request.await.unwrap().unwrap();
        assert_eq!(reply.results.get_str("value"), Some("1"));
    }

    #[tokio::test]
    async fn test_unexpected_running_is_ignored() {
        let (session, mut gdb, mut events) = loaded(manual_refresh()).await;

        gdb.send("*running,thread-id=\"all\"\n~\"marker\\n\"\n").await;
        assert_eq!(
            events.recv().await,
            Some(GdbEvent::Output {
                channel: OutputChannel::Console,
                content: "marker\n".into()
            })
        );
        assert_eq!(session.state(), SessionState::Loaded);

        let (result, ()) = tokio::join!(session.run(), async {
            let token = gdb.expect("exec-run").await;
            gdb.send(&format!("*running,thread-id=\"all\"\n{}^running\n", token))
                .await;
        });
        result.unwrap();
        assert_eq!(events.recv().await, Some(GdbEvent::Running));
        assert_eq!(session.state(), SessionState::Running);
    }

    #[tokio::test]
    async fn test_continue_before_launch_runs() {
        let (session, mut gdb, _events) = loaded(manual_refresh()).await;
        let (result, ()) = tokio::join!(session.continue_execution(), gdb.reply("exec-run", "running"));
        result.unwrap();
    }

    #[tokio::test]
    async fn test_continue_after_exit_runs_again() {
        let (session, mut gdb, mut events) = loaded(manual_refresh()).await;
        let (result, ()) = tokio::join!(session.run(), gdb.reply("exec-run", "running"));
        result.unwrap();

        gdb.send("*stopped,reason=\"exited-normally\"\n").await;
        assert_eq!(
            events.recv().await,
            Some(GdbEvent::ProgramExited { exit_code: Some(0) })
        );
        assert_eq!(session.state(), SessionState::Exited);

        let (result, ()) = tokio::join!(session.continue_execution(), gdb.reply("exec-run", "running"));
        result.unwrap();
    }

    #[tokio::test]
    async fn test_failed_run_is_not_a_launch() {
        let (session, mut gdb, _events) = loaded(manual_refresh()).await;
        let (result, ()) = tokio::join!(
            session.run(),
            gdb.reply("exec-run", r#"error,msg="During startup program exited with code 127.""#)
        );
        assert!(matches!(result, Err(GdbError::Command(_))));

        let (result, ()) = tokio::join!(session.continue_execution(), gdb.reply("exec-run", "running"));
        result.unwrap();
    }

    #[tokio::test]
    async fn test_set_breakpoint_with_multiple_locations() {
        let (session, mut gdb, mut events) = loaded(manual_refresh()).await;
        let (result, ()) = tokio::join!(
            session.set_breakpoint("t.h", 5),
            gdb.reply(
                "break-insert -f t.h:5",
                concat!(
                    r#"done,bkpt={number="1",type="breakpoint",addr="<MULTIPLE>",times="0"},"#,
                    r#"{number="1.1",addr="0x401136",func="max<int>",file="t.h",line="5"},"#,
                    r#"{number="1.2",addr="0x401150",func="max<long>",file="t.h",line="5"}"#
                )
            )
        );
        let breakpoint = result.unwrap();
        assert_eq!(breakpoint.number, "1");
        assert_eq!(breakpoint.addr.as_deref(), Some("<MULTIPLE>"));
        assert_eq!(session.breakpoints(), vec![breakpoint.clone()]);
        assert_eq!(events.recv().await, Some(GdbEvent::BreakpointSet { breakpoint }));
    }

    #[tokio::test]
    async fn test_continue_while_running_is_noop() {
        let (session, mut gdb, _events) = loaded(manual_refresh()).await;
        let (result, ()) = tokio::join!(session.run(), gdb.reply("exec-run", "running"));
        result.unwrap();

        let (result, ()) = tokio::join!(
            session.continue_execution(),
            gdb.reply(
                "exec-continue",
                r#"error,msg="Cannot execute this command while the selected thread is running.""#
            )
        );
        result.unwrap();
    }

    #[tokio::test]
    async fn test_steps_require_stopped_state() {
        let (session, mut gdb, mut events) = loaded(manual_refresh()).await;

        // Nothing is sent, so nothing waits for a reply
        timeout(Duration::from_secs(1), session.step_over())
            .await
            .expect("step should not wait")
            .unwrap();

        stop_at_main(&mut gdb, &mut events).await;
        let (result, ()) = tokio::join!(session.step_into(), gdb.reply("exec-step", "running"));
        result.unwrap();
    }

    #[tokio::test]
    async fn test_update_variables_is_idempotent() {
        let (session, mut gdb, mut events) = loaded(manual_refresh()).await;
        stop_at_main(&mut gdb, &mut events).await;

        for _ in 0..2 {
            let ((), ()) = tokio::join!(session.update_variables(), async {
                gdb.console("info locals", "x = 1\npt = {a = 1, b = 2}\nmsg = \"he said \\\"hi\\\"\nbye\"\n")
                    .await;
                gdb.console("info args", "No arguments.\n").await;
            });
        }

        let snapshot = session.variables();
        let names: Vec<_> = snapshot.local.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["x", "pt", "msg"]);
        assert_eq!(snapshot.local[1].children.len(), 2);

        let first = match events.recv().await {
            Some(GdbEvent::VariablesUpdated(s)) => s,
            other => panic!("unexpected {:?}", other),
        };
        let second = match events.recv().await {
            Some(GdbEvent::VariablesUpdated(s)) => s,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_watch_expressions() {
        let (session, mut gdb, mut events) = loaded(manual_refresh()).await;
        stop_at_main(&mut gdb, &mut events).await;

        let ((), ()) = tokio::join!(session.add_watch_variable("pt.a"), async {
            gdb.console("info locals", "No locals.\n").await;
            gdb.console("info args", "No arguments.\n").await;
            gdb.console("output pt.a", "1").await;
            gdb.console("whatis pt.a", "type = int\n").await;
        });

        let ((), ()) = tokio::join!(session.add_watch_variable("nope"), async {
            gdb.console("info locals", "No locals.\n").await;
            gdb.console("info args", "No arguments.\n").await;
            gdb.console("output pt.a", "1").await;
            gdb.console("whatis pt.a", "type = int\n").await;
            let token = gdb
                .expect(&format!("interpreter-exec console {}", quote("output nope")))
                .await;
            gdb.send(&format!(
                "{}^error,msg=\"No symbol \\\"nope\\\" in current context.\"\n",
                token
            ))
            .await;
        });

        assert_eq!(session.watch_expressions(), vec!["pt.a", "nope"]);
        let snapshot = session.variables();
        assert_eq!(snapshot.watches[0].value, "1");
        assert_eq!(snapshot.watches[0].var_type.as_deref(), Some("int"));
        assert_eq!(snapshot.watches[1].value, "No symbol \"nope\" in current context.");

        session.remove_watch_variable("pt.a").await;
        assert_eq!(session.watch_expressions(), vec!["nope"]);
        assert_eq!(session.variables().watches.len(), 1);
    }

    #[tokio::test]
    async fn test_expand_variable_enriches_elided_value() {
        let (session, mut gdb, mut events) = loaded(manual_refresh()).await;
        stop_at_main(&mut gdb, &mut events).await;

        let ((), ()) = tokio::join!(session.update_variables(), async {
            gdb.console("info locals", "deep = {...}\npt = {a = 1, b = {c = 2}}\n").await;
            gdb.console("info args", "").await;
        });

        let node = session
            .expand_variable(
                "pt",
                ExpandOptions {
                    scope: Some(VariableScope::Local),
                    path: vec![1, 0],
                },
            )
            .await
            .unwrap();
        assert_eq!(node.name, "c");
        assert_eq!(node.value, "2");

        let (result, ()) = tokio::join!(
            session.expand_variable("deep", ExpandOptions::default()),
            gdb.console("output deep", "{x = 1, y = 2}")
        );
        assert_eq!(result.unwrap().children.len(), 2);
        assert_eq!(session.variables().local[0].children.len(), 2);

        let missing = session.expand_variable("ghost", ExpandOptions::default()).await;
        assert!(matches!(missing, Err(GdbError::VariableNotFound(_))));

        let bad_path = session
            .expand_variable(
                "pt",
                ExpandOptions {
                    scope: None,
                    path: vec![7],
                },
            )
            .await;
        assert!(matches!(bad_path, Err(GdbError::InvalidPath { .. })));
    }

    #[tokio::test]
    async fn test_update_call_stack() {
        let (session, mut gdb, mut events) = loaded(manual_refresh()).await;
        stop_at_main(&mut gdb, &mut events).await;

        let ((), ()) = tokio::join!(
            session.update_call_stack(),
            gdb.reply(
                "stack-list-frames",
                r#"done,stack=[frame={level="0",addr="0x1",func="leaf",file="a.cpp",line="3"},frame={level="1",addr="0x2",func="main",file="a.cpp",line="9"}]"#
            )
        );
        let stack = session.call_stack();
        assert_eq!(stack.len(), 2);
        assert_eq!(stack[1].function.as_deref(), Some("main"));
        assert!(matches!(events.recv().await, Some(GdbEvent::CallstackUpdated { .. })));
    }

    #[tokio::test]
    async fn test_auto_refresh_after_stop() {
        let options = SessionOptions {
            stop_grace_ms: 0,
            ..Default::default()
        };
        let (session, mut gdb, mut events) = loaded(options).await;
        stop_at_main(&mut gdb, &mut events).await;

        gdb.console("info locals", "i = 3\n").await;
        gdb.console("info args", "argc = 1\n").await;
        gdb.reply("stack-list-frames", r#"done,stack=[frame={level="0",func="main"}]"#)
            .await;

        assert!(matches!(events.recv().await, Some(GdbEvent::VariablesUpdated(_))));
        assert!(matches!(events.recv().await, Some(GdbEvent::CallstackUpdated { .. })));
        let names: Vec<_> = session.variables().local.iter().map(|n| n.name.clone()).collect();
        assert_eq!(names, vec!["i", "argc"]);
    }

    #[tokio::test]
    async fn test_program_exit_is_reported_once() {
        let (session, mut gdb, mut events) = loaded(manual_refresh()).await;
        let (result, ()) = tokio::join!(session.run(), gdb.reply("exec-run", "running"));
        result.unwrap();

        gdb.send("=thread-group-exited,id=\"i1\",exit-code=\"012\"\n*stopped,reason=\"exited\",exit-code=\"012\"\n~\"done\"\n")
            .await;
        assert_eq!(
            events.recv().await,
            Some(GdbEvent::ProgramExited { exit_code: Some(10) })
        );
        assert!(matches!(events.recv().await, Some(GdbEvent::Output { .. })));
        assert_eq!(session.state(), SessionState::Exited);
    }

    #[tokio::test]
    async fn test_replies_split_across_reads() {
        let (session, mut gdb, _events) = loaded(manual_refresh()).await;

        let (result, ()) = tokio::join!(session.send_command("gdb-version"), async {
            let token = gdb.expect("gdb-version").await;
            gdb.send(&format!("{}^do", token)).await;
            tokio::task::yield_now().await;
            gdb.send("ne,value=\"x\"\r\n").await;
        });
        assert_eq!(result.unwrap().results.get_str("value"), Some("x"));
    }

    #[tokio::test]
    async fn test_transport_close_abandons_pending() {
        let (session, mut gdb, mut events) = loaded(manual_refresh()).await;

        let (result, ()) = tokio::join!(session.send_command("exec-interrupt"), async {
            gdb.expect("exec-interrupt").await;
            drop(gdb);
        });
        assert!(matches!(result, Err(GdbError::Abandoned(cmd)) if cmd == "exec-interrupt"));
        assert_eq!(
            events.recv().await,
            Some(GdbEvent::Exited {
                code: None,
                signal: None
            })
        );
        assert_eq!(session.state(), SessionState::Exited);
        assert!(matches!(
            session.send_command("gdb-version").await,
            Err(GdbError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_stop_sends_exit_and_reports() {
        let session = GdbSession::new(manual_refresh());
        let mut events = session.take_events().unwrap();
        let writer = tokio_test::io::Builder::new()
            .write(b"1-gdb-exit\n")
            .build();
        let (reader, _keep_open) = tokio::io::duplex(64);
        session.attach(reader, writer).await;

        session.stop().await.unwrap();
        assert_eq!(session.state(), SessionState::Exited);
        assert_eq!(
            events.recv().await,
            Some(GdbEvent::Exited {
                code: None,
                signal: None
            })
        );

        // A second stop has nothing left to do
        session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_before_start_is_noop() {
        let session = GdbSession::default();
        session.stop().await.unwrap();
        assert_eq!(session.state(), SessionState::NotStarted);
    }

    #[test]
    fn test_mi_argument_quoting() {
        assert_eq!(mi_argument("/bin/app"), "/bin/app");
        assert_eq!(mi_argument("my app"), r#""my app""#);
        assert_eq!(mi_argument(""), r#""""#);
    }

    #[test]
    fn test_exit_codes_are_octal() {
        assert_eq!(parse_exit_code("012"), Some(10));
        assert_eq!(parse_exit_code("0"), Some(0));
        assert_eq!(parse_exit_code("9"), None);
    }
}
