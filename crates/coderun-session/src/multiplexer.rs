//! Session multiplexer.
//!
//! Owns at most one local run and at most one remote session, and routes
//! data between them, the console and the file store. Events from the
//! driver and from the remote channel are merged into a single dispatch
//! loop, so each source is handled in the order it produced events.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use coderun_core::{
    ConsoleLine, ExecutionState, FileContent, FileStoreError, LineKind, ProjectContext,
};
use coderun_executor::{DriverError, DriverEvent, LocalDriver};
use coderun_transport::{
    ConnectError, EventSender, RemoteConnector, RemoteEnvelope, RemoteEvent, RemoteHandle,
    RemoteSession, SessionId, TransportError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use uuid::Uuid;

use crate::{
    attachments::AttachmentBundle,
    cursor::{FileTransferCursor, Route},
};

/// Multiplexer error.
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("A remote session is already active")]
    AlreadyActive,
    #[error("No problem selected")]
    NoServiceSelected,
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error("API Error: {0}")]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Files(#[from] FileStoreError),
}

/// The remote problem and service to connect to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSelection {
    pub problem: String,
    pub service: String,
    pub args: Vec<String>,
    /// File arguments, argument name to file store path.
    pub file_args: BTreeMap<String, String>,
}

impl ServiceSelection {
    #[must_use]
    pub fn new(problem: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            problem: problem.into(),
            service: service.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn file_arg(mut self, name: impl Into<String>, path: impl Into<String>) -> Self {
        self.file_args.insert(name.into(), path.into());
        self
    }
}

enum RemoteSlot {
    Idle,
    Connecting(SessionId),
    Active(RemoteHandle),
    /// Logically finished; kept open until the peer closes so trailing
    /// file data is not cut off.
    Draining(RemoteHandle),
}

impl RemoteSlot {
    const fn is_active(&self) -> bool {
        matches!(self, Self::Connecting(_) | Self::Active(_))
    }

    fn owns(&self, session: SessionId) -> bool {
        match self {
            Self::Idle => false,
            Self::Connecting(id) => *id == session,
            Self::Active(handle) | Self::Draining(handle) => handle.id() == session,
        }
    }

    fn take(&mut self) -> Option<RemoteHandle> {
        match std::mem::replace(self, Self::Idle) {
            Self::Active(handle) | Self::Draining(handle) => Some(handle),
            Self::Idle | Self::Connecting(_) => None,
        }
    }
}

struct MuxState {
    remote: RemoteSlot,
    /// Session whose events are routed; events of any other are stale.
    session: Option<SessionId>,
    cursor: FileTransferCursor,
    selection: Option<ServiceSelection>,
    stdin_enabled: bool,
}

struct Inner {
    ctx: ProjectContext,
    driver: Arc<LocalDriver>,
    connector: Arc<dyn RemoteConnector>,
    remote_tx: mpsc::UnboundedSender<RemoteEnvelope>,
    state: Mutex<MuxState>,
}

/// Routes a local run and a remote session to each other and the console.
pub struct Multiplexer {
    inner: Arc<Inner>,
    dispatch: JoinHandle<()>,
}

impl Multiplexer {
    /// Create the multiplexer and start its dispatch loop.
    ///
    /// `driver_events` must be the receiver returned alongside `driver`.
    #[must_use]
    pub fn spawn(
        ctx: ProjectContext,
        driver: Arc<LocalDriver>,
        driver_events: mpsc::UnboundedReceiver<DriverEvent>,
        connector: Arc<dyn RemoteConnector>,
    ) -> Self {
        let (remote_tx, remote_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            ctx,
            driver,
            connector,
            remote_tx,
            state: Mutex::new(MuxState {
                remote: RemoteSlot::Idle,
                session: None,
                cursor: FileTransferCursor::new(),
                selection: None,
                stdin_enabled: false,
            }),
        });
        let dispatch = tokio::spawn(dispatch(Arc::clone(&inner), driver_events, remote_rx));
        Self { inner, dispatch }
    }

    #[must_use]
    pub fn context(&self) -> &ProjectContext {
        &self.inner.ctx
    }

    /// Current state of the local run.
    #[must_use]
    pub fn execution_state(&self) -> ExecutionState {
        self.inner.driver.state()
    }

    /// Whether the local stdin entry should accept input.
    #[must_use]
    pub fn stdin_enabled(&self) -> bool {
        self.inner.lock().stdin_enabled
    }

    /// Whether a remote session is connecting or open.
    #[must_use]
    pub fn is_remote_active(&self) -> bool {
        self.inner.lock().remote.is_active()
    }

    /// Choose the service the next connect opens.
    pub fn select_service(&self, selection: Option<ServiceSelection>) {
        self.inner.lock().selection = selection;
    }

    /// Run the project's entry point locally.
    ///
    /// # Errors
    /// Returns `Driver` if the entry point is missing or the interpreter
    /// fails to start. The error is also reported on the console.
    pub async fn run(&self) -> Result<(), MuxError> {
        let inner = &self.inner;
        let entry = inner.ctx.config.run.clone();
        inner.ctx.console.clear();
        inner.ctx.console.system(&format!("RUN: {entry}"));
        inner.refresh_stdin();

        if let Err(e) = inner.driver.start(&entry).await {
            inner.report_start_error(&e);
            return Err(e.into());
        }
        Ok(())
    }

    /// Open a remote session for the selected service and run the entry
    /// point against it.
    ///
    /// Without an explicit selection, `PROBLEM` and `SERVICE` from the
    /// project config are used.
    ///
    /// # Errors
    /// - `AlreadyActive` if a session is connecting or open; nothing changes.
    /// - `NoServiceSelected` if there is nothing to connect to.
    /// - `Connect` if the service could not be reached; no run is started.
    /// - `Driver` if the entry point could not be started; the session is closed.
    pub async fn connect(&self) -> Result<SessionId, MuxError> {
        let inner = &self.inner;
        let console = &inner.ctx.console;

        let (id, selection) = {
            let mut state = inner.lock();
            if state.remote.is_active() {
                drop(state);
                console.stderr(&MuxError::AlreadyActive.to_string());
                return Err(MuxError::AlreadyActive);
            }
            let Some(selection) = state.selection.clone().or_else(|| inner.configured_service())
            else {
                drop(state);
                console.stderr(&MuxError::NoServiceSelected.to_string());
                return Err(MuxError::NoServiceSelected);
            };
            if let Some(previous) = state.remote.take() {
                previous.close_connection();
            }
            let id = Uuid::new_v4();
            state.remote = RemoteSlot::Connecting(id);
            state.session = Some(id);
            state.cursor.reset();
            (id, selection)
        };
        inner.refresh_stdin();

        let files = match inner.bundle(&selection).await {
            Ok(files) => files,
            Err(e) => {
                inner.abandon(id);
                console.stderr(&e.to_string());
                return Err(e.into());
            }
        };

        console.clear();
        let session = RemoteSession {
            problem: selection.problem,
            service: selection.service,
            args: selection.args,
            token: inner.ctx.config.token().map(str::to_owned),
            files,
            tty: false,
        };
        tracing::info!(
            session = %id,
            problem = %session.problem,
            service = %session.service,
            "Connecting to remote service"
        );

        let handle = match inner
            .connector
            .connect(session, EventSender::new(id, inner.remote_tx.clone()))
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(session = %id, "Remote connect failed: {e}");
                inner.abandon(id);
                let e = MuxError::from(e);
                console.stderr(&e.to_string());
                return Err(e);
            }
        };

        {
            let mut state = inner.lock();
            if !matches!(state.remote, RemoteSlot::Connecting(pending) if pending == id) {
                drop(state);
                tracing::info!(session = %id, "Remote session ended before it became active");
                handle.close_connection();
                return Ok(id);
            }
            state.remote = RemoteSlot::Active(handle);
        }
        inner.refresh_stdin();

        let entry = inner.ctx.config.run.clone();
        console.system(&format!("API: {entry}"));
        if let Err(e) = inner.driver.start(&entry).await {
            inner.report_start_error(&e);
            inner.close_remote(id);
            return Err(e.into());
        }
        Ok(id)
    }

    /// Deliver text typed by the local user.
    ///
    /// Each line is echoed to the console. A line reaches the program only
    /// while it waits for input.
    ///
    /// # Errors
    /// Returns `Driver(NotAwaitingStdin)` if any line was not delivered.
    pub fn send_stdin(&self, text: &str) -> Result<(), MuxError> {
        let inner = &self.inner;
        let mut undelivered = None;
        for line in split_lines(text) {
            inner
                .ctx
                .console
                .append(ConsoleLine::new(LineKind::Stdin, line));
            if let Err(e) = inner.driver.send_stdin(line) {
                tracing::warn!(line, "Local input not delivered: {e}");
                undelivered.get_or_insert(e);
            }
        }
        inner.refresh_stdin();
        undelivered.map_or(Ok(()), |e| Err(e.into()))
    }

    /// Close the remote session, if any, and stop the local run.
    pub fn stop_all(&self) {
        let handle = self.inner.lock().remote.take();
        if let Some(handle) = handle {
            handle.close_connection();
        }
        self.inner.driver.stop();
        self.inner.refresh_stdin();
    }

    /// Unpack archive entries under the attachment root.
    ///
    /// # Errors
    /// Returns `Files` on the first entry that cannot be written.
    pub async fn import_attachments(&self, bundle: AttachmentBundle) -> Result<usize, MuxError> {
        Ok(bundle.import(&self.inner.ctx).await?)
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        if let Some(handle) = self.inner.lock().remote.take() {
            handle.close_connection();
        }
        self.dispatch.abort();
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, MuxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn configured_service(&self) -> Option<ServiceSelection> {
        let config = &self.ctx.config;
        if config.problem.is_empty() || config.service.is_empty() {
            return None;
        }
        Some(ServiceSelection::new(&config.problem, &config.service))
    }

    /// Read the file arguments of `selection`, skipping missing paths.
    async fn bundle(
        &self,
        selection: &ServiceSelection,
    ) -> Result<BTreeMap<String, String>, FileStoreError> {
        let mut files = BTreeMap::new();
        for (name, path) in &selection.file_args {
            if !self.ctx.files.exists(path).await? {
                tracing::warn!(%name, %path, "File argument not found, skipping");
                continue;
            }
            let content = self.ctx.files.read_file(path, true).await?;
            files.insert(name.clone(), content.into_text());
        }
        Ok(files)
    }

    fn report_start_error(&self, error: &DriverError) {
        // Launch failures surface through the Error state.
        if !matches!(error, DriverError::Launch(_)) {
            self.ctx.console.stderr(&error.to_string());
        }
    }

    /// Forget a session that never became active.
    fn abandon(&self, id: SessionId) {
        {
            let mut state = self.lock();
            if state.remote.owns(id) {
                state.remote = RemoteSlot::Idle;
            }
            if state.session == Some(id) {
                state.session = None;
            }
        }
        self.refresh_stdin();
    }

    fn close_remote(&self, id: SessionId) {
        let handle = {
            let mut state = self.lock();
            if state.remote.owns(id) {
                state.remote.take()
            } else {
                None
            }
        };
        if let Some(handle) = handle {
            handle.close_connection();
        }
        self.refresh_stdin();
    }

    fn refresh_stdin(&self) {
        let mut state = self.lock();
        let enabled =
            !state.remote.is_active() && self.driver.state() == ExecutionState::AwaitingStdin;
        if enabled != state.stdin_enabled {
            state.stdin_enabled = enabled;
            tracing::debug!(enabled, "Stdin entry toggled");
            self.ctx.console.set_stdin_enabled(enabled);
        }
    }

    /// Handle of the open session, for forwarding local output.
    fn forward_target(&self) -> Option<RemoteHandle> {
        match &self.lock().remote {
            RemoteSlot::Active(handle) => Some(handle.clone()),
            _ => None,
        }
    }

    fn forward(&self, text: &str) {
        if let Some(handle) = self.forward_target() {
            if let Err(e) = handle.send_binary(format!("{text}\n")) {
                tracing::debug!(session = %handle.id(), "Output not forwarded: {e}");
            }
        }
    }

    fn on_driver(&self, event: DriverEvent) {
        match event {
            DriverEvent::State(state) => {
                if let ExecutionState::Error { message } = &state {
                    self.ctx.console.stderr(message);
                }
                self.refresh_stdin();
            }
            DriverEvent::Stdout(text) => {
                self.ctx.console.stdout(&text);
                self.forward(&text);
            }
            DriverEvent::Notify(text) => {
                self.ctx.console.system(&text);
                self.forward(&text);
            }
            DriverEvent::Stderr(text) => self.ctx.console.stderr(&text),
        }
    }

    async fn on_remote(&self, envelope: RemoteEnvelope) {
        let RemoteEnvelope { session, event } = envelope;
        if self.lock().session != Some(session) {
            tracing::debug!(%session, "Ignoring event of a stale session");
            return;
        }

        match event {
            RemoteEvent::Start => tracing::debug!(%session, "Remote transport established"),
            RemoteEvent::Begin(lines) => tracing::info!(%session, greeting = ?lines, "Remote session began"),
            RemoteEvent::BinaryHeader(header) => self.on_header(session, &header.name).await,
            RemoteEvent::Data(text) => self.on_data(session, &text).await,
            RemoteEvent::Stop(lines) => self.on_stop(session, lines),
            RemoteEvent::Closed(error) => self.on_closed(session, error),
        }
    }

    async fn on_header(&self, session: SessionId, name: &str) {
        let path = match self.ctx.attachment_path(name) {
            Ok(path) => path,
            Err(e) => {
                self.lock().cursor.discard();
                tracing::warn!(%session, name, "Rejected output file: {e}");
                self.ctx.console.stderr(&e.to_string());
                return;
            }
        };
        let advanced = self.lock().cursor.advance(name);
        if let Err(e) = advanced {
            tracing::warn!(%session, name, "Rejected output file: {e}");
            self.ctx.console.stderr(&e.to_string());
            return;
        }

        tracing::debug!(%session, %path, "Receiving output file");
        if let Err(e) = self
            .ctx
            .files
            .write_file(&path, FileContent::Text(String::new()))
            .await
        {
            self.ctx.console.stderr(&e.to_string());
        }
    }

    async fn on_data(&self, session: SessionId, text: &str) {
        let route = self.lock().cursor.route();
        match route {
            Route::File(name) => {
                match self.ctx.attachment_path(&name) {
                    Ok(path) => {
                        if let Err(e) = self.ctx.files.append_file(&path, text.into()).await {
                            tracing::error!(%session, %path, "Failed to store output: {e}");
                            self.ctx.console.stderr(&e.to_string());
                        }
                    }
                    Err(e) => self.ctx.console.stderr(&e.to_string()),
                }
                self.complete_if_last(session, &name);
            }
            Route::Discard => tracing::debug!(%session, bytes = text.len(), "Discarding data"),
            Route::Console => {
                for line in split_lines(text) {
                    self.ctx
                        .console
                        .append(ConsoleLine::new(LineKind::StdinFromRemote, line));
                    if self.driver.state() != ExecutionState::AwaitingStdin {
                        tracing::warn!(%session, line, "Program not waiting for input, dropping line");
                        continue;
                    }
                    if let Err(e) = self.driver.send_stdin(line) {
                        tracing::warn!(%session, line, "Remote input not delivered: {e}");
                    }
                }
                self.refresh_stdin();
            }
        }
    }

    fn complete_if_last(&self, session: SessionId, name: &str) {
        {
            let mut state = self.lock();
            if !state.cursor.is_last(name) {
                return;
            }
            let finished = match &state.remote {
                RemoteSlot::Active(handle) if handle.id() == session => Some(handle.clone()),
                _ => None,
            };
            if let Some(handle) = finished {
                state.remote = RemoteSlot::Draining(handle);
                tracing::info!(%session, "Output manifest complete");
            }
        }
        self.refresh_stdin();
    }

    fn on_stop(&self, session: SessionId, lines: Vec<String>) {
        {
            let mut state = self.lock();
            if lines.first().is_some_and(|first| !first.is_empty()) {
                tracing::info!(%session, files = ?lines, "Expecting output files");
                state.cursor.set_manifest(lines);
            } else if let RemoteSlot::Active(handle) = &state.remote {
                let handle = handle.clone();
                tracing::info!(%session, "Remote service finished");
                state.remote = RemoteSlot::Draining(handle);
            }
        }
        self.refresh_stdin();
    }

    fn on_closed(&self, session: SessionId, error: Option<TransportError>) {
        {
            let mut state = self.lock();
            if state.remote.owns(session) {
                state.remote = RemoteSlot::Idle;
            }
            state.session = None;
            state.cursor.reset();
        }

        match error {
            Some(e) => {
                tracing::error!(%session, "Remote session failed: {e}");
                self.ctx.console.stderr(&format!("API Error: {e}"));
                self.driver.stop();
            }
            None => tracing::info!(%session, "Remote session closed"),
        }
        self.refresh_stdin();
    }
}

async fn dispatch(
    inner: Arc<Inner>,
    mut driver_events: mpsc::UnboundedReceiver<DriverEvent>,
    mut remote_events: mpsc::UnboundedReceiver<RemoteEnvelope>,
) {
    loop {
        tokio::select! {
            Some(event) = driver_events.recv() => inner.on_driver(event),
            Some(envelope) = remote_events.recv() => inner.on_remote(envelope).await,
            else => break,
        }
    }
    tracing::debug!("Multiplexer dispatch loop ended");
}

/// Split text into lines, dropping the empty segment after a final newline.
fn split_lines(text: &str) -> Vec<&str> {
    let mut lines: Vec<&str> = text.split('\n').collect();
    if lines.last() == Some(&"") {
        lines.pop();
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_lines() {
        assert_eq!(split_lines("4\n"), vec!["4"]);
        assert_eq!(split_lines("a\nb"), vec!["a", "b"]);
        assert_eq!(split_lines("a\n\nb\n"), vec!["a", "", "b"]);
        assert!(split_lines("").is_empty());
    }

    #[test]
    fn test_selection_builder() {
        let selection = ServiceSelection::new("sum", "eval")
            .arg("size=small")
            .file_arg("input", "/data/input.txt");
        assert_eq!(selection.args, vec!["size=small"]);
        assert_eq!(selection.file_args["input"], "/data/input.txt");
    }

    #[test]
    fn test_slot_ownership() {
        let id = Uuid::new_v4();
        let (handle, _rx) = RemoteHandle::new(id);

        assert!(RemoteSlot::Connecting(id).is_active());
        assert!(!RemoteSlot::Draining(handle.clone()).is_active());
        assert!(RemoteSlot::Draining(handle.clone()).owns(id));
        assert!(!RemoteSlot::Active(handle).owns(Uuid::new_v4()));
    }
}
