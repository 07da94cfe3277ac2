//! GDB (GNU Debugger) MI Interface Module

pub mod console;
pub mod error;
pub mod parser;
pub mod session;
pub mod tokenizer;
pub mod types;
pub mod variables;

pub use console::{InferiorConsole, InferiorTty, NewConsoleWindow, SharedConsole};
pub use error::{GdbError, ParseError, Result};
pub use session::GdbSession;
pub use types::*;
