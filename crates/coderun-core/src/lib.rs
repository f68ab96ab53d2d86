//! Core abstractions for sandboxed code sessions.
//!
//! This crate provides the fundamental building blocks:
//! - `ExecutionState` - Lifecycle of a local program run
//! - `ConsoleLog` - Broadcast + history console sink
//! - `VirtualFileStore` - Path-keyed file store seam
//! - `ProjectConfig` / `ProjectContext` - Per-project settings and wiring

pub mod config;
pub mod console;
pub mod context;
pub mod paths;
pub mod state;
pub mod traits;

pub use config::ProjectConfig;
pub use console::{ConsoleEvent, ConsoleLine, ConsoleLog, ConsoleSink, LineKind};
pub use context::ProjectContext;
pub use state::ExecutionState;
pub use traits::{FileContent, FileStoreError, VirtualFileStore};
