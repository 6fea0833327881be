//! Core building blocks for notebook kernels.
//!
//! This crate provides:
//! - `text` - Line/column arithmetic and range edits
//! - `VersionedCell` / `NotebookState` - Versioned cell content kept in sync with the editor
//! - `BufferedSink` - Size- and time-triggered output buffering
//! - `ProgressForwarder` - Ordered delivery of execution progress
//! - `PeerSlot` / `UserInput` - Access to the editor on the other side
//! - Interpreter, factory and peer traits

pub mod cell;
pub mod config;
pub mod input;
pub mod notebook;
pub mod peer;
pub mod progress;
pub mod sink;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod text;
pub mod traits;

/// Uri of a notebook document.
pub type NotebookId = String;
/// Uri of a cell's text document.
pub type CellId = String;

pub use cell::{CellError, ContentOutcome, VersionedCell};
pub use config::{NotebookConfig, RegistryConfig, SessionConfig, SinkConfig};
pub use input::UserInput;
pub use notebook::{NotebookChange, NotebookError, NotebookState};
pub use peer::PeerSlot;
pub use progress::{ExecutionProgress, ExecutionStatus, ProgressEvent, ProgressForwarder};
pub use sink::{BufferedSink, SinkError};
pub use traits::{InterpreterSession, RemotePeer, SessionFactory, SessionHandle};
