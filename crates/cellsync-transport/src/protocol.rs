//! Wire protocol between the editor and the kernel.
//!
//! Messages are JSON objects tagged by `type`. Output bytes travel base64
//! encoded.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use cellsync_core::{
    CellId, ExecutionProgress, ExecutionStatus, NotebookChange, NotebookId,
    cell::CellDocument,
    notebook::NotebookDocument,
    progress::{OutputStream, ProgressPayload},
    traits::MessageLevel,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Protocol error.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Message from the editor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// A notebook was opened with these cell documents.
    OpenNotebook {
        notebook: NotebookDocument,
        #[serde(default)]
        cells: Vec<CellDocument>,
    },
    /// Structure, metadata or text of an open notebook changed.
    ChangeNotebook {
        notebook_id: NotebookId,
        change: NotebookChange,
    },
    CloseNotebook { notebook_id: NotebookId },
    /// Run a cell. Without `code` the kernel's copy of the cell is run.
    ExecuteCell {
        request_id: Uuid,
        notebook_id: NotebookId,
        cell_id: CellId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    Interrupt { notebook_id: NotebookId },
    /// Answer to [`ServerMessage::RequestCellContent`].
    CellContent {
        request_id: Uuid,
        text: String,
        version: i32,
    },
    /// Answer to [`ServerMessage::RequestInput`]. `None` means dismissed.
    UserInput {
        request_id: Uuid,
        #[serde(default)]
        value: Option<String>,
    },
    Ping,
}

impl ClientMessage {
    /// Parse a message.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Json`] for malformed input.
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Whether this answers an outstanding kernel request.
    #[must_use]
    pub const fn is_response(&self) -> bool {
        matches!(self, Self::CellContent { .. } | Self::UserInput { .. })
    }
}

/// Progress payload as sent on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WirePayload {
    Output { stream: OutputStream, data: String },
    Diagnostics { lines: Vec<String> },
    ErrorDiagnostics { lines: Vec<String> },
}

impl From<ProgressPayload> for WirePayload {
    fn from(payload: ProgressPayload) -> Self {
        match payload {
            ProgressPayload::Output(chunk) => Self::Output {
                stream: chunk.stream,
                data: BASE64.encode(&chunk.data),
            },
            ProgressPayload::Diagnostics(lines) => Self::Diagnostics { lines },
            ProgressPayload::ErrorDiagnostics(lines) => Self::ErrorDiagnostics { lines },
        }
    }
}

/// Message to the editor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ExecutionProgress {
        notebook_id: NotebookId,
        cell_id: CellId,
        status: ExecutionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<WirePayload>,
    },
    /// Ask for the authoritative text of a cell.
    RequestCellContent {
        request_id: Uuid,
        notebook_id: NotebookId,
        cell_id: CellId,
    },
    /// Ask the user for a line of input.
    RequestInput { request_id: Uuid, prompt: String },
    ShowMessage { level: MessageLevel, message: String },
    /// Final answer to [`ClientMessage::ExecuteCell`].
    ExecutionResult {
        request_id: Uuid,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    InterruptResult {
        notebook_id: NotebookId,
        message: String,
    },
    Error { message: String },
    Pong,
}

impl ServerMessage {
    /// Wire form of a progress notification.
    #[must_use]
    pub fn progress(progress: ExecutionProgress) -> Self {
        Self::ExecutionProgress {
            notebook_id: progress.notebook_id,
            cell_id: progress.cell_id,
            status: progress.status,
            payload: progress.payload.map(WirePayload::from),
        }
    }

    /// Decode the output bytes of an output progress message.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Base64`] if the data is not valid base64.
    pub fn decode_output(&self) -> Result<Option<Vec<u8>>, ProtocolError> {
        match self {
            Self::ExecutionProgress {
                payload: Some(WirePayload::Output { data, .. }),
                ..
            } => Ok(Some(BASE64.decode(data)?)),
            _ => Ok(None),
        }
    }

    /// Serialize for sending.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Json`] if serialization fails.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}
