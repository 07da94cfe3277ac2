//! MCP Tool Definitions for GDB Debugging

use serde::{Deserialize, Serialize};

/// MCP Tool definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

fn no_arguments() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {},
        "required": []
    })
}

/// Tool: Start GDB session
pub fn tool_start() -> ToolDefinition {
    ToolDefinition {
        name: "gdb_start".to_string(),
        description: "Spawn GDB in MI mode, configure it and load an executable. Session options \
                      (debuggerPath, debuggerArgs, env, externalConsolePath, printElements, \
                      autoRefresh, includeGlobals, ...) are passed through unchanged."
            .to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "executable": {
                    "type": "string",
                    "description": "Path to the executable to debug"
                },
                "source": {
                    "type": "string",
                    "description": "Main source file; globals are collected from this file"
                },
                "options": {
                    "type": "object",
                    "description": "Session options (camelCase keys)"
                }
            },
            "required": ["executable"]
        }),
    }
}

/// Tool: Stop GDB session
pub fn tool_stop() -> ToolDefinition {
    ToolDefinition {
        name: "gdb_stop".to_string(),
        description: "Stop the current GDB debugging session and clean up resources.".to_string(),
        input_schema: no_arguments(),
    }
}

/// Tool: Run program
pub fn tool_run() -> ToolDefinition {
    ToolDefinition {
        name: "gdb_run".to_string(),
        description: "Start the loaded program from the beginning.".to_string(),
        input_schema: no_arguments(),
    }
}

/// Tool: Continue execution
pub fn tool_continue() -> ToolDefinition {
    ToolDefinition {
        name: "gdb_continue".to_string(),
        description: "Continue execution until the next breakpoint or exit. Starts the program if \
                      it has not been launched yet."
            .to_string(),
        input_schema: no_arguments(),
    }
}

/// Tool: Step over
pub fn tool_next() -> ToolDefinition {
    ToolDefinition {
        name: "gdb_next".to_string(),
        description: "Execute the next source line, stepping over function calls. Ignored unless \
                      the program is stopped."
            .to_string(),
        input_schema: no_arguments(),
    }
}

/// Tool: Step into
pub fn tool_step() -> ToolDefinition {
    ToolDefinition {
        name: "gdb_step".to_string(),
        description: "Execute the next source line, stepping into function calls. Ignored unless \
                      the program is stopped."
            .to_string(),
        input_schema: no_arguments(),
    }
}

/// Tool: Step out
pub fn tool_finish() -> ToolDefinition {
    ToolDefinition {
        name: "gdb_finish".to_string(),
        description: "Run until the current function returns.".to_string(),
        input_schema: no_arguments(),
    }
}

/// Tool: Pause
pub fn tool_pause() -> ToolDefinition {
    ToolDefinition {
        name: "gdb_pause".to_string(),
        description: "Interrupt the running program.".to_string(),
        input_schema: no_arguments(),
    }
}

/// Tool: Insert breakpoint
pub fn tool_break_insert() -> ToolDefinition {
    ToolDefinition {
        name: "gdb_break_insert".to_string(),
        description: "Set a breakpoint at a source line. Breakpoints in files not loaded yet are \
                      kept pending."
            .to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "file": {
                    "type": "string",
                    "description": "Source file"
                },
                "line": {
                    "type": "integer",
                    "description": "Line number"
                }
            },
            "required": ["file", "line"]
        }),
    }
}

/// Tool: Delete breakpoint
pub fn tool_break_delete() -> ToolDefinition {
    ToolDefinition {
        name: "gdb_break_delete".to_string(),
        description: "Delete a breakpoint by number.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "number": {
                    "type": "string",
                    "description": "Breakpoint number"
                }
            },
            "required": ["number"]
        }),
    }
}

/// Tool: List breakpoints
pub fn tool_break_list() -> ToolDefinition {
    ToolDefinition {
        name: "gdb_break_list".to_string(),
        description: "List breakpoints. By default returns the ones set through this session; \
                      with debugger=true returns GDB's own breakpoint table."
            .to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "debugger": {
                    "type": "boolean",
                    "description": "Query GDB's breakpoint table"
                }
            },
            "required": []
        }),
    }
}

/// Tool: Add watch expression
pub fn tool_watch_add() -> ToolDefinition {
    ToolDefinition {
        name: "gdb_watch_add".to_string(),
        description: "Add an expression that is re-evaluated on every stop.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "expression": {
                    "type": "string",
                    "description": "Expression to watch"
                }
            },
            "required": ["expression"]
        }),
    }
}

/// Tool: Remove watch expression
pub fn tool_watch_remove() -> ToolDefinition {
    ToolDefinition {
        name: "gdb_watch_remove".to_string(),
        description: "Remove a watch expression.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "expression": {
                    "type": "string",
                    "description": "Expression to stop watching"
                }
            },
            "required": ["expression"]
        }),
    }
}

/// Tool: Variables
pub fn tool_variables() -> ToolDefinition {
    ToolDefinition {
        name: "gdb_variables".to_string(),
        description: "Get locals, globals and watch expressions as value trees.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "refresh": {
                    "type": "boolean",
                    "description": "Re-read the variables from GDB first"
                }
            },
            "required": []
        }),
    }
}

/// Tool: Expand variable
pub fn tool_expand() -> ToolDefinition {
    ToolDefinition {
        name: "gdb_expand".to_string(),
        description: "Get the subtree of a variable, following child indices from its root."
            .to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "name": {
                    "type": "string",
                    "description": "Variable name or watch expression"
                },
                "scope": {
                    "type": "string",
                    "enum": ["local", "global", "watch"],
                    "description": "Where to look (default: watch, then local, then global)"
                },
                "path": {
                    "type": "array",
                    "items": { "type": "integer" },
                    "description": "Child indices to walk"
                }
            },
            "required": ["name"]
        }),
    }
}

/// Tool: Call stack
pub fn tool_callstack() -> ToolDefinition {
    ToolDefinition {
        name: "gdb_callstack".to_string(),
        description: "Get the call stack of the stopped program.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "refresh": {
                    "type": "boolean",
                    "description": "Re-read the stack from GDB first"
                }
            },
            "required": []
        }),
    }
}

/// Tool: Get session status
pub fn tool_status() -> ToolDefinition {
    ToolDefinition {
        name: "gdb_status".to_string(),
        description: "Get the session state, loaded executable, breakpoints and watch expressions."
            .to_string(),
        input_schema: no_arguments(),
    }
}

/// Tool: Drain events
pub fn tool_events() -> ToolDefinition {
    ToolDefinition {
        name: "gdb_events".to_string(),
        description: "Return and clear the session events received since the last call \
                      (stopped, running, program-exited, output, ...)."
            .to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "max": {
                    "type": "integer",
                    "description": "Maximum number of events to return"
                }
            },
            "required": []
        }),
    }
}

/// Tool: Execute raw GDB command
pub fn tool_raw_command() -> ToolDefinition {
    ToolDefinition {
        name: "gdb_raw_command".to_string(),
        description: "Execute a raw GDB/MI command directly, or a CLI command with console=true."
            .to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "GDB/MI command to execute (without leading '-')"
                },
                "console": {
                    "type": "boolean",
                    "description": "Run as a CLI command and return its console output"
                }
            },
            "required": ["command"]
        }),
    }
}

/// Get all available tools
pub fn get_all_tools() -> Vec<ToolDefinition> {
    vec![
        tool_start(),
        tool_stop(),
        tool_run(),
        tool_continue(),
        tool_next(),
        tool_step(),
        tool_finish(),
        tool_pause(),
        tool_break_insert(),
        tool_break_delete(),
        tool_break_list(),
        tool_watch_add(),
        tool_watch_remove(),
        tool_variables(),
        tool_expand(),
        tool_callstack(),
        tool_status(),
        tool_events(),
        tool_raw_command(),
    ]
}
