//! Channel-driven interpreter.
//!
//! Each launch hands a [`ScriptedRun`] to whoever holds the receiver
//! returned by [`ScriptedInterpreter::new`], which then plays the part of
//! the running program. Useful for embedding hosts that execute code
//! elsewhere, and for tests.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use super::{Interpreter, InterpreterError, InterpreterEvent, InterpreterRun, Program};

/// Interpreter whose runs are driven through channels.
pub struct ScriptedInterpreter {
    runs: mpsc::UnboundedSender<ScriptedRun>,
    fail_next: Mutex<Option<String>>,
}

impl ScriptedInterpreter {
    /// Create the interpreter and the receiver of its launched runs.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ScriptedRun>) {
        let (runs, rx) = mpsc::unbounded_channel();
        (
            Self {
                runs,
                fail_next: Mutex::new(None),
            },
            rx,
        )
    }

    /// Make the next launch fail with `reason`.
    pub fn fail_next_launch(&self, reason: impl Into<String>) {
        *self.fail_next.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason.into());
    }
}

#[async_trait]
impl Interpreter for ScriptedInterpreter {
    async fn launch(&self, program: Program) -> Result<InterpreterRun, InterpreterError> {
        if let Some(reason) = self
            .fail_next
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            return Err(InterpreterError::Unavailable(reason));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();

        self.runs
            .send(ScriptedRun {
                program,
                events: events_tx,
                stdin: stdin_rx,
                kill: kill_rx,
            })
            .map_err(|_| InterpreterError::Unavailable("scripted host dropped".into()))?;

        Ok(InterpreterRun {
            events: events_rx,
            stdin: stdin_tx,
            kill: kill_tx,
        })
    }
}

/// The program side of one scripted run.
pub struct ScriptedRun {
    pub program: Program,
    pub events: mpsc::UnboundedSender<InterpreterEvent>,
    pub stdin: mpsc::UnboundedReceiver<String>,
    pub kill: oneshot::Receiver<()>,
}

impl ScriptedRun {
    fn emit(&self, event: InterpreterEvent) {
        let _ = self.events.send(event);
    }

    pub fn ready(&self) {
        self.emit(InterpreterEvent::Ready);
    }

    pub fn stdout(&self, text: &str) {
        self.emit(InterpreterEvent::Stdout(text.to_owned()));
    }

    pub fn stderr(&self, text: &str) {
        self.emit(InterpreterEvent::Stderr(text.to_owned()));
    }

    pub fn notify(&self, text: &str) {
        self.emit(InterpreterEvent::Notify(text.to_owned()));
    }

    /// Block "reading" one stdin line.
    pub fn request_stdin(&self) {
        self.emit(InterpreterEvent::StdinRequested);
    }

    /// Finish the run, failing with `error` if given.
    pub fn exit(&self, error: Option<&str>) {
        self.emit(InterpreterEvent::Exited(error.map_or(Ok(()), |e| Err(e.to_owned()))));
    }

    /// Whether the driver asked this run to terminate.
    pub fn killed(&mut self) -> bool {
        !matches!(self.kill.try_recv(), Err(oneshot::error::TryRecvError::Empty))
    }
}
