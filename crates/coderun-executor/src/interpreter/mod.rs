//! Interpreter seam used by the local driver.

pub mod process;
pub mod scripted;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

pub use process::ProcessInterpreter;
pub use scripted::{ScriptedInterpreter, ScriptedRun};

/// A program to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    /// Path of the entry file in the virtual file store.
    pub path: String,
    /// Source of the entry file.
    pub source: String,
}

/// Event produced by a running interpreter, in production order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterpreterEvent {
    /// Initialization finished; the program starts executing.
    Ready,
    Stdout(String),
    Stderr(String),
    /// Out-of-band notification, distinct from stdout.
    Notify(String),
    /// The program is about to block reading one line of stdin.
    StdinRequested,
    /// The program ended. `Err` carries a diagnostic.
    Exited(Result<(), String>),
}

/// Handles to one launched interpreter.
#[derive(Debug)]
pub struct InterpreterRun {
    pub events: mpsc::UnboundedReceiver<InterpreterEvent>,
    /// Lines written to the program's stdin, without trailing newline.
    pub stdin: mpsc::UnboundedSender<String>,
    /// Fire to terminate the program.
    pub kill: oneshot::Sender<()>,
}

/// Interpreter error.
#[derive(Debug, Error)]
pub enum InterpreterError {
    #[error("Interpreter unavailable: {0}")]
    Unavailable(String),
    #[error("Spawn failed: {0}")]
    SpawnFailed(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Something that can run a program in isolation.
#[async_trait]
pub trait Interpreter: Send + Sync {
    /// Launch `program`. Events are delivered on the returned run.
    async fn launch(&self, program: Program) -> Result<InterpreterRun, InterpreterError>;
}
