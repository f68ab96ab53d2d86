//! Console sink with broadcast and history.

use std::{
    collections::VecDeque,
    sync::{PoisonError, RwLock},
};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Default history size limit (16 MB).
const HISTORY_BYTES: usize = 16 * 1024 * 1024;

/// Kind of a console line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineKind {
    Stdout,
    Stderr,
    /// Input typed by the local user.
    Stdin,
    /// Input received from the remote service.
    StdinFromRemote,
    System,
}

/// One line of console output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleLine {
    pub text: String,
    pub kind: LineKind,
}

impl ConsoleLine {
    #[must_use]
    pub fn new(kind: LineKind, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            kind,
        }
    }
}

/// Append-only display sink for console lines.
///
/// Implementations must not block; the multiplexer calls these from its
/// dispatch loop.
pub trait ConsoleSink: Send + Sync {
    /// Append a line. The line is never mutated afterwards.
    fn append(&self, line: ConsoleLine);

    /// Enable or disable the local stdin entry.
    fn set_stdin_enabled(&self, enabled: bool);

    /// Drop all previously appended lines.
    fn clear(&self);

    fn stdout(&self, text: &str) {
        self.append(ConsoleLine::new(LineKind::Stdout, text));
    }

    fn stderr(&self, text: &str) {
        self.append(ConsoleLine::new(LineKind::Stderr, text));
    }

    fn system(&self, text: &str) {
        self.append(ConsoleLine::new(LineKind::System, text));
    }
}

/// Event broadcast to live console listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleEvent {
    Line(ConsoleLine),
    StdinEnabled(bool),
    Cleared,
}

struct Inner {
    history: VecDeque<ConsoleLine>,
    total_bytes: usize,
    stdin_enabled: bool,
}

/// Console sink with broadcast and history support.
///
/// Late subscribers receive the retained history and then
/// switch to live updates.
pub struct ConsoleLog {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<ConsoleEvent>,
}

impl Default for ConsoleLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleLog {
    /// Create an empty console.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(4096);
        Self {
            inner: RwLock::new(Inner {
                history: VecDeque::with_capacity(64),
                total_bytes: 0,
                stdin_enabled: false,
            }),
            sender,
        }
    }

    /// Get a receiver for live updates.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConsoleEvent> {
        self.sender.subscribe()
    }

    /// Snapshot of the retained lines, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<ConsoleLine> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .iter()
            .cloned()
            .collect()
    }

    /// Current state of the stdin entry.
    #[must_use]
    pub fn stdin_enabled(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .stdin_enabled
    }

    /// Stream that yields history first, then live updates.
    ///
    /// Lagged receivers skip the missed events rather than failing.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, ConsoleEvent> {
        let rx = self.subscribe();
        let history = self.history();

        let hist = futures::stream::iter(history.into_iter().map(ConsoleEvent::Line));
        let live = BroadcastStream::new(rx).filter_map(|res| async move { res.ok() });

        Box::pin(hist.chain(live))
    }
}

impl ConsoleSink for ConsoleLog {
    fn append(&self, line: ConsoleLine) {
        let bytes = line.text.len() + std::mem::size_of::<ConsoleLine>();
        {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            while inner.total_bytes.saturating_add(bytes) > HISTORY_BYTES {
                let Some(front) = inner.history.pop_front() else {
                    break;
                };
                let freed = front.text.len() + std::mem::size_of::<ConsoleLine>();
                inner.total_bytes = inner.total_bytes.saturating_sub(freed);
            }
            inner.history.push_back(line.clone());
            inner.total_bytes = inner.total_bytes.saturating_add(bytes);
        }
        let _ = self.sender.send(ConsoleEvent::Line(line));
    }

    fn set_stdin_enabled(&self, enabled: bool) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .stdin_enabled = enabled;
        let _ = self.sender.send(ConsoleEvent::StdinEnabled(enabled));
    }

    fn clear(&self) {
        {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            inner.history.clear();
            inner.total_bytes = 0;
        }
        let _ = self.sender.send(ConsoleEvent::Cleared);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_keeps_order() {
        let console = ConsoleLog::new();
        console.system("RUN: /main.py");
        console.stdout("hello");
        console.stderr("oops");

        let kinds: Vec<_> = console.history().into_iter().map(|l| l.kind).collect();
        assert_eq!(kinds, vec![LineKind::System, LineKind::Stdout, LineKind::Stderr]);
    }

    #[test]
    fn test_clear_drops_history() {
        let console = ConsoleLog::new();
        console.stdout("a");
        let mut rx = console.subscribe();
        console.clear();
        assert!(console.history().is_empty());
        assert_eq!(tokio_test::block_on(rx.recv()).unwrap(), ConsoleEvent::Cleared);
    }

    #[tokio::test]
    async fn test_history_then_live() {
        let console = ConsoleLog::new();
        console.stdout("before");
        let mut stream = console.history_plus_stream();
        console.set_stdin_enabled(true);
        console.stdout("after");

        assert_eq!(
            stream.next().await,
            Some(ConsoleEvent::Line(ConsoleLine::new(LineKind::Stdout, "before")))
        );
        assert_eq!(stream.next().await, Some(ConsoleEvent::StdinEnabled(true)));
        assert_eq!(
            stream.next().await,
            Some(ConsoleEvent::Line(ConsoleLine::new(LineKind::Stdout, "after")))
        );
        assert!(console.stdin_enabled());
    }
}
