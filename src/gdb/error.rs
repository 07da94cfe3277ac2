//! Error types for the GDB/MI session core

use thiserror::Error;

/// Failure while scanning or parsing one fragment of GDB output.
///
/// Parse errors are scoped to the fragment that produced them; callers drop
/// the fragment and keep going.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("unterminated string starting at offset {0}")]
    UnterminatedString(usize),
    #[error("unbalanced '{open}' starting at offset {start}")]
    UnbalancedBracket { open: char, start: usize },
    #[error("expected '=' after key at offset {0}")]
    ExpectedEqual(usize),
    #[error("unexpected character '{found}' at offset {pos}")]
    Unexpected { found: char, pos: usize },
}

/// Session-level errors.
#[derive(Error, Debug)]
pub enum GdbError {
    #[error("failed to spawn debugger `{path}`: {source}")]
    Spawn {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("debugger is not running")]
    NotRunning,
    /// The debugger answered with an error class; carries its `msg`.
    #[error("{0}")]
    Command(String),
    #[error("debugger exited before replying to `{0}`")]
    Abandoned(String),
    #[error("unexpected reply to `{0}`")]
    UnexpectedReply(String),
    #[error("variable `{0}` not found")]
    VariableNotFound(String),
    #[error("no child at path {path:?} under `{name}`")]
    InvalidPath { name: String, path: Vec<usize> },
    #[error("malformed debugger output: {0}")]
    Parse(#[from] ParseError),
    #[error("I/O error talking to debugger: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GdbError>;
