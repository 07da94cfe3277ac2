//! Inferior console wiring
//!
//! Decides where the debugged program's stdin/stdout go before the first run.

use crate::gdb::error::Result;
use crate::gdb::session::{mi_argument, GdbSession};
use crate::gdb::types::SessionOptions;
use async_trait::async_trait;
use tracing::info;

/// Prepares the inferior's console on a loaded session.
#[async_trait]
pub trait InferiorConsole: Send + Sync {
    fn name(&self) -> &'static str;

    async fn prepare(&self, session: &GdbSession) -> Result<()>;
}

/// The inferior shares the debugger's terminal; its output arrives as
/// target-stream or unrecognised lines.
#[derive(Debug, Default)]
pub struct SharedConsole;

#[async_trait]
impl InferiorConsole for SharedConsole {
    fn name(&self) -> &'static str {
        "shared"
    }

    async fn prepare(&self, _session: &GdbSession) -> Result<()> {
        Ok(())
    }
}

/// Ask GDB to open a separate console window (Windows builds of GDB).
#[derive(Debug, Default)]
pub struct NewConsoleWindow;

#[async_trait]
impl InferiorConsole for NewConsoleWindow {
    fn name(&self) -> &'static str {
        "new-console"
    }

    async fn prepare(&self, session: &GdbSession) -> Result<()> {
        session.send_command("gdb-set new-console on").await?;
        Ok(())
    }
}

/// Route the inferior to an existing terminal device.
#[derive(Debug, Clone)]
pub struct InferiorTty {
    pub path: String,
}

#[async_trait]
impl InferiorConsole for InferiorTty {
    fn name(&self) -> &'static str {
        "tty"
    }

    async fn prepare(&self, session: &GdbSession) -> Result<()> {
        info!("Inferior console on {}", self.path);
        session
            .send_command(&format!("inferior-tty-set {}", mi_argument(&self.path)))
            .await?;
        Ok(())
    }
}

/// Pick a strategy from the session options.
pub fn default_console(options: &SessionOptions) -> Box<dyn InferiorConsole> {
    match &options.external_console_path {
        Some(path) if !path.is_empty() => Box::new(InferiorTty { path: path.clone() }),
        _ if cfg!(windows) && !options.suppress_new_console => Box::new(NewConsoleWindow),
        _ => Box::new(SharedConsole),
    }
}
