//! Subprocess-backed interpreter.
//!
//! The child runs a bootstrap prelude that reports lifecycle over stdout.
//! A control record starts with `0x1E` and runs to the end of the line:
//! `READY`, `STDIN` or `NOTIFY <text>`. Anything before the marker on
//! the same line is ordinary program output.

use std::{path::PathBuf, process::Stdio};

use async_trait::async_trait;
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::{ChildStdin, Command},
    sync::{mpsc, oneshot},
};

use super::{Interpreter, InterpreterError, InterpreterEvent, InterpreterRun, Program};
use crate::command::CommandBuilder;

const CONTROL: char = '\u{1e}';

const BOOTSTRAP: &str = r#"
import builtins, sys
_CTL = "\x1e"
_out = sys.stdout
_real_stdin = sys.stdin

def _control(kind, payload=None):
    _out.write(_CTL + kind + ("" if payload is None else " " + payload) + "\n")
    _out.flush()

class _Stdin:
    encoding = "utf-8"
    def readline(self, size=-1):
        _control("STDIN")
        return _real_stdin.readline()
    def read(self, size=-1):
        return self.readline()
    def __iter__(self):
        while True:
            line = self.readline()
            if not line:
                return
            yield line
    def isatty(self):
        return False
    def fileno(self):
        return _real_stdin.fileno()

def _input(prompt=""):
    if prompt:
        _out.write(str(prompt))
    line = sys.stdin.readline()
    if not line:
        raise EOFError("EOF when reading a line")
    return line[:-1] if line.endswith("\n") else line

def _notify(message):
    _control("NOTIFY", str(message).replace("\n", " "))

sys.stdin = _Stdin()
builtins.input = _input
builtins.notify = _notify
_path, _source = sys.argv[1], sys.argv[2]
sys.argv = [_path]
_control("READY")
exec(compile(_source, _path, "exec"), {"__name__": "__main__", "__file__": _path})
"#;

/// Interpreter running each program in its own process group.
#[derive(Debug, Clone)]
pub struct ProcessInterpreter {
    command: CommandBuilder,
    working_dir: PathBuf,
}

impl ProcessInterpreter {
    /// Create an interpreter that runs `command` inside `working_dir`.
    #[must_use]
    pub const fn new(command: CommandBuilder, working_dir: PathBuf) -> Self {
        Self {
            command,
            working_dir,
        }
    }
}

#[async_trait]
impl Interpreter for ProcessInterpreter {
    async fn launch(&self, program: Program) -> Result<InterpreterRun, InterpreterError> {
        let run_args = vec![
            "-c".to_owned(),
            BOOTSTRAP.to_owned(),
            program.path.clone(),
            program.source,
        ];
        let parts = self
            .command
            .build(&run_args)
            .map_err(|e| InterpreterError::Unavailable(e.to_string()))?;
        let (executable, args) = parts
            .into_resolved()
            .await
            .map_err(|e| InterpreterError::Unavailable(e.to_string()))?;

        let mut command = Command::new(&executable);
        command
            .args(&args)
            .current_dir(&self.working_dir)
            .env("PYTHONIOENCODING", "utf-8")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .group_spawn()
            .map_err(|e| InterpreterError::SpawnFailed(e.to_string()))?;
        tracing::debug!(executable = %executable.display(), path = %program.path, "Spawned interpreter");

        let stdout = child
            .inner()
            .stdout
            .take()
            .ok_or_else(|| InterpreterError::SpawnFailed("stdout not captured".into()))?;
        let stderr = child
            .inner()
            .stderr
            .take()
            .ok_or_else(|| InterpreterError::SpawnFailed("stderr not captured".into()))?;
        let stdin = child
            .inner()
            .stdin
            .take()
            .ok_or_else(|| InterpreterError::SpawnFailed("stdin not captured".into()))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();

        tokio::spawn(supervise(child, stdout, stderr, stdin, stdin_rx, kill_rx, events_tx));

        Ok(InterpreterRun {
            events: events_rx,
            stdin: stdin_tx,
            kill: kill_tx,
        })
    }
}

async fn supervise(
    mut child: AsyncGroupChild,
    stdout: impl AsyncRead + Unpin + Send + 'static,
    stderr: impl AsyncRead + Unpin + Send + 'static,
    stdin: ChildStdin,
    stdin_rx: mpsc::UnboundedReceiver<String>,
    kill_rx: oneshot::Receiver<()>,
    events: mpsc::UnboundedSender<InterpreterEvent>,
) {
    let stdout_task = tokio::spawn(read_lines(stdout, events.clone(), parse_stdout_line));
    let stderr_task = tokio::spawn(read_lines(stderr, events.clone(), |line| {
        vec![InterpreterEvent::Stderr(line.to_owned())]
    }));
    let stdin_task = tokio::spawn(write_stdin(stdin, stdin_rx));

    // A dropped kill handle terminates the program as well.
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            if let Err(e) = child.start_kill() {
                tracing::debug!("Failed to kill interpreter: {e}");
            }
            child.wait().await
        }
    };

    let _ = stdout_task.await;
    let _ = stderr_task.await;
    stdin_task.abort();

    let outcome = match status {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => Err(format!("process exited with {status}")),
        Err(e) => Err(format!("failed to wait for process: {e}")),
    };
    let _ = events.send(InterpreterEvent::Exited(outcome));
}

async fn read_lines<R, F>(reader: R, events: mpsc::UnboundedSender<InterpreterEvent>, parse: F)
where
    R: AsyncRead + Unpin,
    F: Fn(&str) -> Vec<InterpreterEvent>,
{
    let mut reader = BufReader::new(reader);
    let mut buffer = Vec::new();
    loop {
        buffer.clear();
        match reader.read_until(b'\n', &mut buffer).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buffer);
                let line = text.trim_end_matches(['\n', '\r']);
                for event in parse(line) {
                    if events.send(event).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::error!("Error reading interpreter output: {e}");
                break;
            }
        }
    }
}

async fn write_stdin(mut stdin: ChildStdin, mut lines: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = lines.recv().await {
        let result = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        }
        .await;
        if let Err(e) = result {
            tracing::debug!("Failed to write interpreter stdin: {e}");
            break;
        }
    }
}

/// Split one stdout line into output and control events.
fn parse_stdout_line(line: &str) -> Vec<InterpreterEvent> {
    let Some((text, control)) = line.split_once(CONTROL) else {
        return vec![InterpreterEvent::Stdout(line.to_owned())];
    };

    let mut events = Vec::with_capacity(2);
    if !text.is_empty() {
        events.push(InterpreterEvent::Stdout(text.to_owned()));
    }
    let (kind, payload) = control.split_once(' ').unwrap_or((control, ""));
    match kind {
        "READY" => events.push(InterpreterEvent::Ready),
        "STDIN" => events.push(InterpreterEvent::StdinRequested),
        "NOTIFY" => events.push(InterpreterEvent::Notify(payload.to_owned())),
        other => {
            tracing::warn!(control = other, "Unknown interpreter control record");
            events.push(InterpreterEvent::Stdout(control.to_owned()));
        }
    }
    events
}
