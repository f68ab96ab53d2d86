//! Local execution driver.
//!
//! Provides:
//! - `LocalDriver` - Lifecycle of one program run, with ordered events
//! - `Interpreter` trait with process-backed and scripted implementations
//! - Interpreter command building utilities

pub mod command;
pub mod driver;
pub mod interpreter;

pub use command::{CommandBuilder, CommandParts, resolve_executable_path};
pub use driver::{DriverError, DriverEvent, LocalDriver};
pub use interpreter::{
    Interpreter, InterpreterError, InterpreterEvent, InterpreterRun, ProcessInterpreter, Program,
    ScriptedInterpreter, ScriptedRun,
};
