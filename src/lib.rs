//! GDB/MI session core
//!
//! Parses GDB's Machine Interface output, turns pretty-printed values into
//! trees, and drives a debugger subprocess through [`gdb::GdbSession`]. The
//! [`mcp`] module exposes a session as Model Context Protocol tools.

pub mod gdb;
pub mod mcp;
