//! Execution progress events and their ordered delivery to the peer.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{CellId, NotebookId, peer::PeerSlot};

/// Status of a submitted cell as reported to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Queued,
    Executing,
    Success,
    Failure,
    Interrupted,
}

impl ExecutionStatus {
    /// Whether no further status follows for the same submission.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Interrupted)
    }
}

/// Interpreter output channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Raw bytes flushed from one output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub data: Bytes,
}

/// Payload attached to a progress notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressPayload {
    Output(OutputChunk),
    Diagnostics(Vec<String>),
    ErrorDiagnostics(Vec<String>),
}

/// Notification pushed to the remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionProgress {
    pub notebook_id: NotebookId,
    pub cell_id: CellId,
    pub status: ExecutionStatus,
    pub payload: Option<ProgressPayload>,
}

/// Event on a notebook's progress channel.
///
/// Events with no cell id belong to the cell currently executing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub cell_id: Option<CellId>,
    pub status: ExecutionStatus,
    pub payload: Option<ProgressPayload>,
}

impl ProgressEvent {
    /// Status change for a specific cell.
    #[must_use]
    pub const fn status(cell_id: CellId, status: ExecutionStatus) -> Self {
        Self {
            cell_id: Some(cell_id),
            status,
            payload: None,
        }
    }

    /// Output produced by the executing cell.
    #[must_use]
    pub const fn output(chunk: OutputChunk) -> Self {
        Self {
            cell_id: None,
            status: ExecutionStatus::Executing,
            payload: Some(ProgressPayload::Output(chunk)),
        }
    }

    /// Diagnostics produced by the executing cell.
    #[must_use]
    pub fn diagnostics(lines: Vec<String>, errors: bool) -> Self {
        let payload = if errors {
            ProgressPayload::ErrorDiagnostics(lines)
        } else {
            ProgressPayload::Diagnostics(lines)
        };
        Self {
            cell_id: None,
            status: ExecutionStatus::Executing,
            payload: Some(payload),
        }
    }
}

/// Sending half of a notebook's progress channel.
pub type ProgressSender = mpsc::UnboundedSender<ProgressEvent>;

/// Create a progress channel.
#[must_use]
pub fn progress_channel() -> (ProgressSender, mpsc::UnboundedReceiver<ProgressEvent>) {
    mpsc::unbounded_channel()
}

/// Delivers one notebook's progress events to the peer, in order.
pub struct ProgressForwarder {
    notebook_id: NotebookId,
    peer: PeerSlot,
    executing: Option<CellId>,
}

impl ProgressForwarder {
    #[must_use]
    pub const fn new(notebook_id: NotebookId, peer: PeerSlot) -> Self {
        Self {
            notebook_id,
            peer,
            executing: None,
        }
    }

    /// Resolve the cell an event belongs to and track the executing cell.
    fn stamp(&mut self, event: ProgressEvent) -> Option<ExecutionProgress> {
        let cell_id = match event.cell_id {
            Some(cell_id) => {
                match event.status {
                    ExecutionStatus::Executing => self.executing = Some(cell_id.clone()),
                    status if status.is_terminal() => {
                        if self.executing.as_ref() == Some(&cell_id) {
                            self.executing = None;
                        }
                    }
                    _ => {}
                }
                cell_id
            }
            None => self.executing.clone()?,
        };

        Some(ExecutionProgress {
            notebook_id: self.notebook_id.clone(),
            cell_id,
            status: event.status,
            payload: event.payload,
        })
    }

    /// Forward events until every sender is dropped.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ProgressEvent>) {
        while let Some(event) = rx.recv().await {
            let Some(progress) = self.stamp(event) else {
                tracing::debug!(
                    notebook_id = %self.notebook_id,
                    "Dropping progress event with no executing cell"
                );
                continue;
            };

            let Some(peer) = self.peer.get() else {
                tracing::warn!(notebook_id = %self.notebook_id, "Peer unavailable, dropping progress");
                continue;
            };

            if let Err(e) = peer.report_execution_progress(progress).await {
                tracing::error!(notebook_id = %self.notebook_id, "Failed to report execution progress: {e}");
            }
        }
        tracing::debug!(notebook_id = %self.notebook_id, "Progress forwarder finished");
    }

    /// Spawn [`Self::run`] on the current runtime.
    pub fn spawn(self, rx: mpsc::UnboundedReceiver<ProgressEvent>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(data: &'static [u8]) -> OutputChunk {
        OutputChunk {
            stream: OutputStream::Stdout,
            data: Bytes::from_static(data),
        }
    }

    #[test]
    fn test_stamp_tracks_executing_cell() {
        let mut forwarder = ProgressForwarder::new("nb".into(), PeerSlot::new());

        assert!(forwarder.stamp(ProgressEvent::output(chunk(b"early"))).is_none());

        let queued = forwarder
            .stamp(ProgressEvent::status("c2".into(), ExecutionStatus::Queued))
            .unwrap();
        assert_eq!(queued.cell_id, "c2");
        assert!(forwarder.executing.is_none());

        forwarder.stamp(ProgressEvent::status("c1".into(), ExecutionStatus::Executing));
        let out = forwarder.stamp(ProgressEvent::output(chunk(b"hi"))).unwrap();
        assert_eq!(out.cell_id, "c1");
        assert_eq!(out.status, ExecutionStatus::Executing);

        let diag = forwarder
            .stamp(ProgressEvent::diagnostics(vec!["oops".into()], true))
            .unwrap();
        assert_eq!(
            diag.payload,
            Some(ProgressPayload::ErrorDiagnostics(vec!["oops".into()]))
        );

        forwarder.stamp(ProgressEvent::status("c1".into(), ExecutionStatus::Success));
        assert!(forwarder.stamp(ProgressEvent::output(chunk(b"late"))).is_none());
    }

    #[test]
    fn test_terminal_status_for_other_cell_keeps_marker() {
        let mut forwarder = ProgressForwarder::new("nb".into(), PeerSlot::new());
        forwarder.stamp(ProgressEvent::status("c1".into(), ExecutionStatus::Executing));
        forwarder.stamp(ProgressEvent::status("c0".into(), ExecutionStatus::Interrupted));
        assert_eq!(forwarder.executing.as_deref(), Some("c1"));
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&ExecutionStatus::Interrupted).unwrap();
        assert_eq!(json, "\"interrupted\"");
        assert!(ExecutionStatus::Failure.is_terminal());
        assert!(!ExecutionStatus::Queued.is_terminal());
    }
}
