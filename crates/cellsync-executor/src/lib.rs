//! Cell execution for notebook kernels.
//!
//! Provides:
//! - Snippet splitting on top of the interpreter's completeness analysis
//! - Rendering of diagnostics, runtime errors and unresolved dependencies
//! - A per-notebook serialized execution queue with interrupt support

pub mod diagnostics;
pub mod eval;
pub mod queue;
pub mod snippets;

pub use eval::{EvalReport, Evaluator};
pub use queue::{ExecutionError, ExecutionQueue, ExecutionResult, INTERRUPT_MESSAGE, Reservation};
pub use snippets::split_snippets;
