//! Collaborator traits: the interpreter session, its factory and the remote peer.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, Shared};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    CellId, NotebookId,
    config::SessionConfig,
    input::UserInput,
    progress::ExecutionProgress,
    sink::BufferedSink,
};

/// Kind of a top-level snippet as classified by the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnippetKind {
    Import,
    Expression,
    Statement,
    Declaration(DeclarationKind),
    Erroneous,
}

/// Declaration snippets that can carry unresolved dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclarationKind {
    Method,
    Variable,
    Type(TypeKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeKind {
    Class,
    Interface,
    Enum,
    Record,
    Annotation,
}

/// Interpreter verdict for an evaluated snippet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnippetStatus {
    Valid,
    RecoverableDefined,
    RecoverableNotDefined,
    Rejected,
    Dropped,
    Overwritten,
}

impl SnippetStatus {
    /// Whether the snippet's declaration is live in the session.
    #[must_use]
    pub const fn is_defined(self) -> bool {
        matches!(self, Self::Valid | Self::RecoverableDefined)
    }
}

/// A snippet known to the interpreter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snippet {
    pub id: String,
    pub source: String,
    pub kind: SnippetKind,
    /// Declared name for declarations, empty otherwise.
    pub name: String,
}

/// One frame of a thrown error's cause chain.
///
/// `class_name` is the runtime class the interpreter reports. Wrapper frames
/// also carry `original_class`, the type the user code actually threw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrowableFrame {
    pub class_name: String,
    pub original_class: Option<String>,
    /// Index of the cause within [`ThrownError::frames`].
    pub cause: Option<usize>,
}

/// An error thrown by user code during evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrownError {
    pub message: Option<String>,
    /// Stack trace as printed by the interpreter, wrapper names included.
    pub stack_trace: String,
    /// `frames[0]` is the thrown error itself.
    pub frames: Vec<ThrowableFrame>,
}

/// Runtime failure attached to a snippet event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeFailure {
    Thrown(ThrownError),
    Internal {
        message: Option<String>,
        description: String,
    },
}

/// Result of evaluating one snippet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnippetEvent {
    pub snippet: Snippet,
    pub status: SnippetStatus,
    pub value: Option<String>,
    pub failure: Option<RuntimeFailure>,
}

/// Compiler diagnostic. Positions are offsets into the snippet source;
/// negative values mean "unknown".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub message: String,
    pub start: i64,
    pub end: i64,
}

/// Incremental-parse verdict for the head of a source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionInfo {
    pub is_complete: bool,
    /// The complete head of the input.
    pub source: String,
    /// Everything after the complete head.
    pub remaining: String,
}

/// Interpreter-level failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InterpreterError {
    #[error("Interpreter state is corrupted: {0}")]
    IllegalState(String),
    #[error("Interpreter has shut down")]
    Shutdown,
}

/// A long-lived, stateful code execution engine bound to one notebook.
///
/// Methods are synchronous; evaluation runs on the notebook's blocking worker
/// while `abort` is called from other threads.
pub trait InterpreterSession: Send + Sync {
    /// Decide whether the head of `source` is a complete snippet.
    fn analyze_completion(&self, source: &str) -> CompletionInfo;

    /// Evaluate a single complete snippet.
    ///
    /// # Errors
    /// Returns an error only when the interpreter itself is unusable.
    fn evaluate(&self, snippet: &str) -> Result<Vec<SnippetEvent>, InterpreterError>;

    /// Compiler diagnostics for an evaluated snippet.
    fn diagnostics(&self, snippet: &Snippet) -> Vec<Diagnostic>;

    /// Names a declaration references but that are not declared yet.
    fn unresolved_dependencies(&self, snippet: &Snippet) -> Vec<String>;

    /// Stop the evaluation currently running, if any.
    fn abort(&self);

    /// Register a hook run once when the interpreter shuts down on its own.
    fn on_shutdown(&self, hook: Box<dyn FnOnce() + Send>);

    /// Release the interpreter.
    fn close(&self);
}

/// Session creation error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Session creation failed: {0}")]
    Creation(String),
    #[error("Session closed")]
    Closed,
}

/// Handle to an interpreter session, shared by every waiter.
pub type SessionHandle = Arc<dyn InterpreterSession>;

/// Single-flight session creation future.
pub type SessionFuture = Shared<BoxFuture<'static, Result<SessionHandle, SessionError>>>;

/// Streams wired into a new interpreter session.
#[derive(Clone)]
pub struct SessionIo {
    pub stdout: BufferedSink,
    pub stderr: BufferedSink,
    pub stdin: UserInput,
}

/// Creates interpreter sessions.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Start an interpreter for `notebook_id`.
    async fn create(
        &self,
        notebook_id: &str,
        config: &SessionConfig,
        io: SessionIo,
    ) -> Result<SessionHandle, SessionError>;
}

/// Authoritative cell content as reported by the remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellContentResponse {
    pub text: String,
    pub version: i32,
}

/// Severity of a user-facing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageLevel {
    Status,
    Info,
    Warning,
    Error,
}

/// Remote peer error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeerError {
    #[error("Remote peer disconnected")]
    Disconnected,
    #[error("Remote request failed: {0}")]
    Request(String),
    #[error("Remote request timed out")]
    Timeout,
}

/// The editor on the other side of the transport.
#[async_trait]
pub trait RemotePeer: Send + Sync {
    /// Whether the peer can still be reached.
    fn is_connected(&self) -> bool;

    /// Fetch the authoritative text and version of a cell.
    async fn request_cell_content(
        &self,
        notebook_id: &NotebookId,
        cell_id: &CellId,
    ) -> Result<CellContentResponse, PeerError>;

    /// Push an execution status change, output chunk or diagnostics.
    async fn report_execution_progress(&self, progress: ExecutionProgress)
    -> Result<(), PeerError>;

    /// Show a message to the user.
    async fn show_message(&self, level: MessageLevel, message: String) -> Result<(), PeerError>;

    /// Prompt the user for a line of input. `None` means dismissed.
    async fn request_user_input(&self, prompt: String) -> Result<Option<String>, PeerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_defined() {
        assert!(SnippetStatus::Valid.is_defined());
        assert!(SnippetStatus::RecoverableDefined.is_defined());
        assert!(!SnippetStatus::RecoverableNotDefined.is_defined());
        assert!(!SnippetStatus::Rejected.is_defined());
    }

    #[test]
    fn test_snippet_kind_serialization() {
        let kind = SnippetKind::Declaration(DeclarationKind::Type(TypeKind::Enum));
        let json = serde_json::to_string(&kind).unwrap();
        assert_eq!(json, r#"{"declaration":{"type":"enum"}}"#);
    }
}
