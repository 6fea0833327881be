//! Notebook session orchestration.
//!
//! Provides:
//! - `SessionRegistry` - One interpreter session, queue and sinks per notebook
//! - `NotebookService` - Open, edit, execute, interrupt and close notebooks

pub mod registry;
pub mod service;

pub use registry::{SESSION_UNAVAILABLE_MESSAGE, SessionRegistry};
pub use service::{NotebookService, ServiceError};
