//! Local execution driver.
//!
//! Owns the lifecycle of one program run at a time. Observers receive
//! [`DriverEvent`]s on a single channel in production order; the current
//! state can also be read synchronously with [`LocalDriver::state`].

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use coderun_core::{ExecutionState, FileStoreError, VirtualFileStore};
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

use crate::interpreter::{Interpreter, InterpreterError, InterpreterEvent, InterpreterRun, Program};

/// Event observed from the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    State(ExecutionState),
    Stdout(String),
    Stderr(String),
    Notify(String),
}

/// Driver error.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("File not found: {0}")]
    NotFound(String),
    #[error("Interpreter failed to start: {0}")]
    Launch(#[from] InterpreterError),
    #[error("Program is not waiting for input (state: {0})")]
    NotAwaitingStdin(ExecutionState),
    #[error("File store error: {0}")]
    Files(#[from] FileStoreError),
}

enum Control {
    Stdin(String),
    Stop,
}

struct RunHandle {
    control: mpsc::UnboundedSender<Control>,
    task: JoinHandle<()>,
}

struct Shared {
    state: watch::Sender<ExecutionState>,
    events: mpsc::UnboundedSender<DriverEvent>,
}

impl Shared {
    fn transition(&self, next: ExecutionState) {
        let current = self.state.borrow().clone();
        if current != next && !current.can_transition_to(&next) {
            tracing::debug!(from = %current, to = %next, "Out-of-order state transition");
        }
        tracing::debug!(state = %next, "Execution state changed");
        self.state.send_replace(next.clone());
        self.emit(DriverEvent::State(next));
    }

    /// Move to `Stopped` unless already there; a single event either way.
    fn settle_stopped(&self) {
        let changed = self.state.send_if_modified(|state| {
            if matches!(state, ExecutionState::Stopped) {
                false
            } else {
                *state = ExecutionState::Stopped;
                true
            }
        });
        if changed {
            tracing::debug!(state = %ExecutionState::Stopped, "Execution state changed");
            self.emit(DriverEvent::State(ExecutionState::Stopped));
        }
    }

    fn emit(&self, event: DriverEvent) {
        let _ = self.events.send(event);
    }
}

/// Runs programs from the virtual file store in an interpreter.
pub struct LocalDriver {
    interpreter: Arc<dyn Interpreter>,
    files: Arc<dyn VirtualFileStore>,
    shared: Arc<Shared>,
    current: Mutex<Option<RunHandle>>,
    stop_epoch: AtomicU64,
}

impl LocalDriver {
    /// Create a driver and the receiver of its events.
    #[must_use]
    pub fn new(
        interpreter: Arc<dyn Interpreter>,
        files: Arc<dyn VirtualFileStore>,
    ) -> (Self, mpsc::UnboundedReceiver<DriverEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ExecutionState::Unknown);
        let driver = Self {
            interpreter,
            files,
            shared: Arc::new(Shared { state, events }),
            current: Mutex::new(None),
            stop_epoch: AtomicU64::new(0),
        };
        (driver, rx)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ExecutionState {
        self.shared.state.borrow().clone()
    }

    /// Subscribe to state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ExecutionState> {
        self.shared.state.subscribe()
    }

    /// Run the program at `entry`, stopping any previous run first.
    ///
    /// # Errors
    /// Returns `NotFound` if `entry` has no content, or `Launch` if the
    /// interpreter could not be started (the state is then `Error`).
    pub async fn start(&self, entry: &str) -> Result<(), DriverError> {
        self.start_with_stdin(entry, Vec::new()).await
    }

    /// Run the program at `entry` with `stdin` lines already buffered.
    ///
    /// Buffered lines satisfy reads without passing through `AwaitingStdin`.
    ///
    /// # Errors
    /// See [`LocalDriver::start`].
    pub async fn start_with_stdin(&self, entry: &str, stdin: Vec<String>) -> Result<(), DriverError> {
        let epoch = self.stop_epoch.load(Ordering::SeqCst);
        if let Some(previous) = self.take_current() {
            let _ = previous.control.send(Control::Stop);
            let _ = previous.task.await;
        }

        if !self.files.exists(entry).await? {
            return Err(DriverError::NotFound(entry.to_owned()));
        }
        let source = self.files.read_file(entry, false).await?.into_text();

        if self.stop_epoch.load(Ordering::SeqCst) != epoch {
            tracing::debug!(entry, "Stopped before launch");
            self.shared.settle_stopped();
            return Ok(());
        }
        self.shared.transition(ExecutionState::Loading);

        let program = Program {
            path: entry.to_owned(),
            source,
        };
        let run = match self.interpreter.launch(program).await {
            Ok(run) => run,
            Err(e) => {
                tracing::warn!(entry, "Interpreter failed to start: {e}");
                self.shared.transition(ExecutionState::Error {
                    message: e.to_string(),
                });
                return Err(e.into());
            }
        };

        // Checked under the lock so a concurrent `stop` either sees the
        // stored handle or has already bumped the epoch.
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if self.stop_epoch.load(Ordering::SeqCst) != epoch {
            drop(current);
            tracing::debug!(entry, "Stopped while loading");
            let _ = run.kill.send(());
            self.shared.settle_stopped();
            return Ok(());
        }

        let (control, control_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(drive(
            run,
            control_rx,
            Arc::clone(&self.shared),
            stdin.into(),
        ));
        *current = Some(RunHandle { control, task });
        drop(current);
        tracing::info!(entry, "Program started");
        Ok(())
    }

    /// Deliver one line to a program waiting for input.
    ///
    /// # Errors
    /// Returns `NotAwaitingStdin` unless the state is `AwaitingStdin`.
    pub fn send_stdin(&self, line: &str) -> Result<(), DriverError> {
        let guard = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(run) = guard.as_ref() else {
            return Err(DriverError::NotAwaitingStdin(self.state()));
        };

        let accepted = self.shared.state.send_if_modified(|state| {
            if matches!(state, ExecutionState::AwaitingStdin) {
                *state = ExecutionState::Running;
                true
            } else {
                false
            }
        });
        if !accepted {
            return Err(DriverError::NotAwaitingStdin(self.state()));
        }

        if run.control.send(Control::Stdin(line.to_owned())).is_err() {
            return Err(DriverError::NotAwaitingStdin(self.state()));
        }
        Ok(())
    }

    /// Terminate the current run, or any start in progress. Idempotent;
    /// never fails. The state ends at `Stopped` even with nothing running.
    pub fn stop(&self) {
        self.stop_epoch.fetch_add(1, Ordering::SeqCst);
        let guard = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        let idle = match guard.as_ref() {
            Some(run) => {
                let _ = run.control.send(Control::Stop);
                false
            }
            None => true,
        };
        drop(guard);
        if idle {
            self.shared.settle_stopped();
        }
    }

    fn take_current(&self) -> Option<RunHandle> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl Drop for LocalDriver {
    fn drop(&mut self) {
        if let Some(run) = self.take_current() {
            let _ = run.control.send(Control::Stop);
        }
    }
}

async fn drive(
    mut run: InterpreterRun,
    mut control: mpsc::UnboundedReceiver<Control>,
    shared: Arc<Shared>,
    mut pending: VecDeque<String>,
) {
    let mut kill = Some(run.kill);
    loop {
        tokio::select! {
            biased;
            command = control.recv() => match command {
                Some(Control::Stdin(line)) => {
                    shared.transition(ExecutionState::Running);
                    let _ = run.stdin.send(line);
                }
                Some(Control::Stop) | None => {
                    if let Some(kill) = kill.take() {
                        let _ = kill.send(());
                    }
                    shared.settle_stopped();
                    break;
                }
            },
            event = run.events.recv() => match event {
                Some(InterpreterEvent::Ready) => {
                    shared.transition(ExecutionState::Ready);
                    shared.transition(ExecutionState::Running);
                }
                Some(InterpreterEvent::Stdout(text)) => shared.emit(DriverEvent::Stdout(text)),
                Some(InterpreterEvent::Stderr(text)) => shared.emit(DriverEvent::Stderr(text)),
                Some(InterpreterEvent::Notify(text)) => shared.emit(DriverEvent::Notify(text)),
                Some(InterpreterEvent::StdinRequested) => {
                    if let Some(line) = pending.pop_front() {
                        let _ = run.stdin.send(line);
                    } else {
                        shared.transition(ExecutionState::AwaitingStdin);
                    }
                }
                Some(InterpreterEvent::Exited(Ok(()))) | None => {
                    shared.settle_stopped();
                    break;
                }
                Some(InterpreterEvent::Exited(Err(message))) => {
                    shared.transition(ExecutionState::Error { message });
                    break;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use coderun_core::FileContent;
    use tokio::sync::{Notify, RwLock};

    use super::*;
    use crate::interpreter::{ScriptedInterpreter, ScriptedRun};

    #[derive(Default)]
    struct Files(RwLock<std::collections::HashMap<String, String>>);

    #[async_trait]
    impl VirtualFileStore for Files {
        async fn exists(&self, path: &str) -> Result<bool, FileStoreError> {
            Ok(self.0.read().await.contains_key(path))
        }
        async fn read_file(&self, path: &str, _: bool) -> Result<FileContent, FileStoreError> {
            self.0
                .read()
                .await
                .get(path)
                .cloned()
                .map(FileContent::Text)
                .ok_or_else(|| FileStoreError::NotFound(path.to_owned()))
        }
        async fn write_file(&self, path: &str, content: FileContent) -> Result<(), FileStoreError> {
            self.0.write().await.insert(path.to_owned(), content.into_text());
            Ok(())
        }
        async fn create_directory(&self, _: &str) -> Result<(), FileStoreError> {
            Ok(())
        }
    }

    /// Holds `read_file` until released.
    #[derive(Default)]
    struct GatedFiles {
        inner: Files,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl VirtualFileStore for GatedFiles {
        async fn exists(&self, path: &str) -> Result<bool, FileStoreError> {
            self.inner.exists(path).await
        }
        async fn read_file(&self, path: &str, binary: bool) -> Result<FileContent, FileStoreError> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.read_file(path, binary).await
        }
        async fn write_file(&self, path: &str, content: FileContent) -> Result<(), FileStoreError> {
            self.inner.write_file(path, content).await
        }
        async fn create_directory(&self, path: &str) -> Result<(), FileStoreError> {
            self.inner.create_directory(path).await
        }
    }

    struct Harness {
        driver: LocalDriver,
        events: mpsc::UnboundedReceiver<DriverEvent>,
        runs: mpsc::UnboundedReceiver<ScriptedRun>,
        interpreter: Arc<ScriptedInterpreter>,
    }

    async fn harness() -> Harness {
        let files = Arc::new(Files::default());
        files
            .write_file("/main.py", "print('hi')".into())
            .await
            .unwrap();
        let (interpreter, runs) = ScriptedInterpreter::new();
        let interpreter = Arc::new(interpreter);
        let (driver, events) = LocalDriver::new(interpreter.clone(), files);
        Harness {
            driver,
            events,
            runs,
            interpreter,
        }
    }

    async fn next(events: &mut mpsc::UnboundedReceiver<DriverEvent>) -> DriverEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out")
            .expect("closed")
    }

    fn state(s: ExecutionState) -> DriverEvent {
        DriverEvent::State(s)
    }

    #[tokio::test]
    async fn test_missing_entry_is_not_found() {
        let mut h = harness().await;
        let err = h.driver.start("/nope.py").await.unwrap_err();
        assert!(matches!(err, DriverError::NotFound(p) if p == "/nope.py"));
        assert_eq!(h.driver.state(), ExecutionState::Unknown);
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_lifecycle_with_stdin() {
        let mut h = harness().await;
        h.driver.start("/main.py").await.unwrap();
        let mut run = h.runs.recv().await.unwrap();
        assert_eq!(run.program.source, "print('hi')");

        run.ready();
        run.stdout("2+2=");
        run.request_stdin();

        assert_eq!(next(&mut h.events).await, state(ExecutionState::Loading));
        assert_eq!(next(&mut h.events).await, state(ExecutionState::Ready));
        assert_eq!(next(&mut h.events).await, state(ExecutionState::Running));
        assert_eq!(next(&mut h.events).await, DriverEvent::Stdout("2+2=".into()));
        assert_eq!(next(&mut h.events).await, state(ExecutionState::AwaitingStdin));

        tokio_test::assert_ok!(h.driver.send_stdin("4"));
        assert_eq!(h.driver.state(), ExecutionState::Running);
        assert!(matches!(
            h.driver.send_stdin("5"),
            Err(DriverError::NotAwaitingStdin(ExecutionState::Running))
        ));
        assert_eq!(run.stdin.recv().await.as_deref(), Some("4"));
        assert_eq!(next(&mut h.events).await, state(ExecutionState::Running));

        run.exit(None);
        assert_eq!(next(&mut h.events).await, state(ExecutionState::Stopped));
        assert_eq!(h.driver.state(), ExecutionState::Stopped);
    }

    #[tokio::test]
    async fn test_buffered_stdin_skips_awaiting() {
        let mut h = harness().await;
        h.driver
            .start_with_stdin("/main.py", vec!["7".into()])
            .await
            .unwrap();
        let mut run = h.runs.recv().await.unwrap();
        run.ready();
        run.request_stdin();
        assert_eq!(run.stdin.recv().await.as_deref(), Some("7"));
        run.exit(None);

        let mut seen = Vec::new();
        loop {
            let event = next(&mut h.events).await;
            let done = event == state(ExecutionState::Stopped);
            seen.push(event);
            if done {
                break;
            }
        }
        assert!(!seen.contains(&state(ExecutionState::AwaitingStdin)));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let mut h = harness().await;
        h.driver.start("/main.py").await.unwrap();
        let mut run = h.runs.recv().await.unwrap();
        run.ready();

        h.driver.stop();
        h.driver.stop();

        let mut stopped = 0;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(200), h.events.recv()).await
        {
            if event == state(ExecutionState::Stopped) {
                stopped += 1;
            }
        }
        assert_eq!(stopped, 1);
        assert_eq!(h.driver.state(), ExecutionState::Stopped);
        assert!(run.killed());
    }

    #[tokio::test]
    async fn test_launch_failure_sets_error() {
        let mut h = harness().await;
        h.interpreter.fail_next_launch("no interpreter");
        let err = h.driver.start("/main.py").await.unwrap_err();
        assert!(matches!(err, DriverError::Launch(_)));
        assert_eq!(next(&mut h.events).await, state(ExecutionState::Loading));
        assert!(matches!(
            next(&mut h.events).await,
            DriverEvent::State(ExecutionState::Error { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_exit_sets_error() {
        let mut h = harness().await;
        h.driver.start("/main.py").await.unwrap();
        let run = h.runs.recv().await.unwrap();
        run.ready();
        run.stderr("Traceback");
        run.exit(Some("process exited with exit status: 1"));

        let mut last = None;
        for _ in 0..5 {
            last = Some(next(&mut h.events).await);
        }
        assert_eq!(
            last,
            Some(state(ExecutionState::Error {
                message: "process exited with exit status: 1".into()
            }))
        );
    }

    #[tokio::test]
    async fn test_stop_while_reading_entry() {
        let files = Arc::new(GatedFiles::default());
        files
            .write_file("/main.py", "print('hi')".into())
            .await
            .unwrap();
        let (interpreter, mut runs) = ScriptedInterpreter::new();
        let (driver, mut events) = LocalDriver::new(Arc::new(interpreter), files.clone());
        let driver = Arc::new(driver);

        let starting = tokio::spawn({
            let driver = Arc::clone(&driver);
            async move { driver.start("/main.py").await }
        });
        files.entered.notified().await;
        driver.stop();
        files.release.notify_one();

        tokio_test::assert_ok!(starting.await.unwrap());
        assert_eq!(driver.state(), ExecutionState::Stopped);
        assert!(runs.try_recv().is_err());
        assert_eq!(next(&mut events).await, state(ExecutionState::Stopped));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_without_run() {
        let mut h = harness().await;
        h.driver.stop();
        h.driver.stop();

        assert_eq!(h.driver.state(), ExecutionState::Stopped);
        assert_eq!(next(&mut h.events).await, state(ExecutionState::Stopped));
        assert!(h.events.try_recv().is_err());
    }
}
