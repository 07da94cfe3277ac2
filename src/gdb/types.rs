//! GDB Machine Interface (MI) Type Definitions

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashMap;
use std::sync::Arc;

/// GDB/MI result class types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultClass {
    Done,
    Running,
    Connected,
    Exit,
    Error,
    Unknown(String),
}

impl ResultClass {
    /// Every class except `error` and unrecognised ones counts as success.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            ResultClass::Done | ResultClass::Running | ResultClass::Connected | ResultClass::Exit
        )
    }
}

impl From<&str> for ResultClass {
    fn from(s: &str) -> Self {
        match s {
            "done" => ResultClass::Done,
            "running" => ResultClass::Running,
            "connected" => ResultClass::Connected,
            "exit" => ResultClass::Exit,
            "error" => ResultClass::Error,
            other => ResultClass::Unknown(other.to_string()),
        }
    }
}

/// GDB/MI async class types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsyncClass {
    Stopped,
    Running,
    Other(String),
}

impl From<&str> for AsyncClass {
    fn from(s: &str) -> Self {
        match s {
            "stopped" => AsyncClass::Stopped,
            "running" => AsyncClass::Running,
            other => AsyncClass::Other(other.to_string()),
        }
    }
}

/// GDB/MI notification types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationClass {
    BreakpointCreated,
    BreakpointModified,
    BreakpointDeleted,
    ThreadGroupAdded,
    ThreadGroupStarted,
    ThreadGroupExited,
    ThreadCreated,
    ThreadSelected,
    ThreadExited,
    LibraryLoaded,
    LibraryUnloaded,
    CmdParamChanged,
    MemoryChanged,
    Other(String),
}

impl From<&str> for NotificationClass {
    fn from(s: &str) -> Self {
        match s {
            "breakpoint-created" => NotificationClass::BreakpointCreated,
            "breakpoint-modified" => NotificationClass::BreakpointModified,
            "breakpoint-deleted" => NotificationClass::BreakpointDeleted,
            "thread-group-added" => NotificationClass::ThreadGroupAdded,
            "thread-group-started" => NotificationClass::ThreadGroupStarted,
            "thread-group-exited" => NotificationClass::ThreadGroupExited,
            "thread-created" => NotificationClass::ThreadCreated,
            "thread-selected" => NotificationClass::ThreadSelected,
            "thread-exited" => NotificationClass::ThreadExited,
            "library-loaded" => NotificationClass::LibraryLoaded,
            "library-unloaded" => NotificationClass::LibraryUnloaded,
            "cmd-param-changed" => NotificationClass::CmdParamChanged,
            "memory-changed" => NotificationClass::MemoryChanged,
            other => NotificationClass::Other(other.to_string()),
        }
    }
}

/// Stop reason types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    BreakpointHit,
    WatchpointTrigger,
    FunctionFinished,
    LocationReached,
    EndSteppingRange,
    ExitedSignalled,
    Exited,
    ExitedNormally,
    SignalReceived,
    Unknown(String),
}

impl StopReason {
    /// The inferior is gone; no frame is available.
    pub fn is_exit(&self) -> bool {
        matches!(
            self,
            StopReason::Exited | StopReason::ExitedNormally | StopReason::ExitedSignalled
        )
    }
}

impl From<&str> for StopReason {
    fn from(s: &str) -> Self {
        match s {
            "breakpoint-hit" => StopReason::BreakpointHit,
            "watchpoint-trigger" => StopReason::WatchpointTrigger,
            "function-finished" => StopReason::FunctionFinished,
            "location-reached" => StopReason::LocationReached,
            "end-stepping-range" => StopReason::EndSteppingRange,
            "exited-signalled" => StopReason::ExitedSignalled,
            "exited" => StopReason::Exited,
            "exited-normally" => StopReason::ExitedNormally,
            "signal-received" => StopReason::SignalReceived,
            other => StopReason::Unknown(other.to_string()),
        }
    }
}

/// GDB/MI value: a string, a tuple of named values, or a list.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MiValue {
    Scalar(String),
    Object(MiTuple),
    List(Vec<MiValue>),
}

impl MiValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MiValue::Scalar(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&MiTuple> {
        match self {
            MiValue::Object(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[MiValue]> {
        match self {
            MiValue::List(l) => Some(l),
            _ => None,
        }
    }
}

/// Insertion-ordered map of MI results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MiTuple {
    entries: Vec<(String, MiValue)>,
}

impl MiTuple {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `value` under `key`, replacing an existing entry in place.
    pub fn insert(&mut self, key: impl Into<String>, value: MiValue) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&MiValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut MiValue> {
        self.entries.iter_mut().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(MiValue::as_str)
    }

    pub fn get_tuple(&self, key: &str) -> Option<&MiTuple> {
        self.get(key).and_then(MiValue::as_tuple)
    }

    pub fn get_list(&self, key: &str) -> Option<&[MiValue]> {
        self.get(key).and_then(MiValue::as_list)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MiValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for MiTuple {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// GDB/MI output record
#[derive(Debug, Clone, PartialEq)]
pub enum MiOutputRecord {
    Result {
        token: Option<u64>,
        class: ResultClass,
        results: MiTuple,
    },
    Async {
        token: Option<u64>,
        class: AsyncClass,
        results: MiTuple,
    },
    Notification {
        class: NotificationClass,
        results: MiTuple,
    },
    Console(String),
    Target(String),
    Log(String),
}

/// A successful command reply, with any console text captured for it
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MiReply {
    pub results: MiTuple,
    pub console: String,
}

/// Breakpoint information
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breakpoint {
    pub number: String,
    pub file: String,
    pub line: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub func: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,
}

/// Frame information, for stop locations and call-stack entries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(default)]
    pub level: u64,
    #[serde(default)]
    pub function: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub fullname: Option<String>,
    #[serde(default)]
    pub line: Option<u64>,
    #[serde(default)]
    pub addr: Option<String>,
}

/// One node of a pretty-printed value tree
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableNode {
    pub name: String,
    /// Raw display text as GDB printed it
    pub value: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub var_type: Option<String>,
    #[serde(default)]
    pub children: Vec<VariableNode>,
}

impl VariableNode {
    pub fn leaf(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            var_type: None,
            children: Vec::new(),
        }
    }

    /// Follow child indices from this node.
    pub fn descend(&self, path: &[usize]) -> Option<&VariableNode> {
        path.iter()
            .try_fold(self, |node, &index| node.children.get(index))
    }
}

/// Which cache a variable lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableScope {
    Local,
    Global,
    Watch,
}

/// Immutable view of every variable cache, swapped wholesale on refresh
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VariableSnapshot {
    pub local: Vec<VariableNode>,
    pub global: Vec<VariableNode>,
    pub watches: Vec<VariableNode>,
}

impl VariableSnapshot {
    pub fn scope(&self, scope: VariableScope) -> &[VariableNode] {
        match scope {
            VariableScope::Local => &self.local,
            VariableScope::Global => &self.global,
            VariableScope::Watch => &self.watches,
        }
    }

    pub(crate) fn scope_mut(&mut self, scope: VariableScope) -> &mut Vec<VariableNode> {
        match scope {
            VariableScope::Local => &mut self.local,
            VariableScope::Global => &mut self.global,
            VariableScope::Watch => &mut self.watches,
        }
    }
}

/// Options for [`crate::gdb::GdbSession::expand_variable`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpandOptions {
    /// Restrict the lookup; `None` searches watches, locals, then globals
    #[serde(default)]
    pub scope: Option<VariableScope>,
    /// Child indices to walk from the root
    #[serde(default)]
    pub path: Vec<usize>,
}

/// Inferior/debugger session state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    #[default]
    NotStarted,
    Loaded,
    Running,
    Stopped,
    Exited,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not-started"),
            Self::Loaded => write!(f, "loaded"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Exited => write!(f, "exited"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputChannel {
    Console,
    Target,
    Log,
}

/// Events emitted by a session; the only channel from the session to the host
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum GdbEvent {
    Started {
        executable: String,
    },
    Running,
    Stopped {
        reason: String,
        frame: Option<Frame>,
    },
    BreakpointSet {
        breakpoint: Breakpoint,
    },
    BreakpointRemoved {
        number: String,
    },
    VariablesUpdated(Arc<VariableSnapshot>),
    CallstackUpdated {
        frames: Vec<Frame>,
    },
    ProgramExited {
        exit_code: Option<i64>,
    },
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
    },
    Output {
        channel: OutputChannel,
        content: String,
    },
}

impl GdbEvent {
    pub fn name(&self) -> &'static str {
        match self {
            GdbEvent::Started { .. } => "started",
            GdbEvent::Running => "running",
            GdbEvent::Stopped { .. } => "stopped",
            GdbEvent::BreakpointSet { .. } => "breakpoint-set",
            GdbEvent::BreakpointRemoved { .. } => "breakpoint-removed",
            GdbEvent::VariablesUpdated(_) => "variables-updated",
            GdbEvent::CallstackUpdated { .. } => "callstack-updated",
            GdbEvent::ProgramExited { .. } => "program-exited",
            GdbEvent::Exited { .. } => "exited",
            GdbEvent::Output { .. } => "output",
        }
    }
}

/// Session configuration supplied by the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionOptions {
    /// Extra environment for the debugger (inherited by the inferior)
    pub env: HashMap<String, String>,
    pub debugger_path: String,
    pub debugger_args: Vec<String>,
    /// Terminal device the inferior should use for its console
    pub external_console_path: Option<String>,
    /// Keep the inferior in the debugger's console on Windows
    pub suppress_new_console: bool,
    /// Cap for `print elements`
    pub print_elements: u32,
    /// Refresh variables and call stack after every stop
    pub auto_refresh: bool,
    /// Also collect globals defined in the source file
    pub include_globals: bool,
    /// Grace period between shutdown steps in `stop()`
    pub stop_grace_ms: u64,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            env: HashMap::new(),
            debugger_path: "gdb".to_string(),
            debugger_args: vec!["--interpreter=mi2".to_string(), "--quiet".to_string()],
            external_console_path: None,
            suppress_new_console: false,
            print_elements: 200,
            auto_refresh: true,
            include_globals: false,
            stop_grace_ms: 100,
        }
    }
}
