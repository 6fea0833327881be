//! Remote peer speaking the wire protocol over a message channel.

use std::{
    collections::HashMap,
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use cellsync_core::{
    CellId, ExecutionProgress, NotebookId, RemotePeer,
    traits::{CellContentResponse, MessageLevel, PeerError},
};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use crate::protocol::ServerMessage;

/// Default time to wait for the editor to answer a request.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

enum Pending {
    CellContent(oneshot::Sender<CellContentResponse>),
    Input(oneshot::Sender<Option<String>>),
}

/// [`RemotePeer`] that sends [`ServerMessage`]s down a channel and matches
/// the editor's answers to requests by id.
pub struct ChannelPeer {
    tx: mpsc::UnboundedSender<ServerMessage>,
    pending: Mutex<HashMap<Uuid, Pending>>,
    connected: AtomicBool,
    timeout: Duration,
}

impl ChannelPeer {
    #[must_use]
    pub fn new(tx: mpsc::UnboundedSender<ServerMessage>, timeout: Duration) -> Self {
        Self {
            tx,
            pending: Mutex::default(),
            connected: AtomicBool::new(true),
            timeout,
        }
    }

    /// Create a peer together with the stream of messages it sends.
    #[must_use]
    pub fn channel(timeout: Duration) -> (Self, UnboundedReceiverStream<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx, timeout), UnboundedReceiverStream::new(rx))
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<Uuid, Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send a message to the editor.
    ///
    /// # Errors
    /// [`PeerError::Disconnected`] once closed or when the receiver is gone.
    pub fn send(&self, message: ServerMessage) -> Result<(), PeerError> {
        if !self.is_connected() {
            return Err(PeerError::Disconnected);
        }
        self.tx.send(message).map_err(|_| {
            self.connected.store(false, Ordering::Release);
            PeerError::Disconnected
        })
    }

    async fn request<T>(
        &self,
        message: impl FnOnce(Uuid) -> ServerMessage,
        pending: impl FnOnce(oneshot::Sender<T>) -> Pending,
    ) -> Result<T, PeerError> {
        let request_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending().insert(request_id, pending(tx));

        if let Err(e) = self.send(message(request_id)) {
            self.pending().remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(PeerError::Disconnected),
            Err(_) => {
                self.pending().remove(&request_id);
                tracing::warn!(%request_id, "Editor did not answer in time");
                Err(PeerError::Timeout)
            }
        }
    }

    /// Complete a cell content request. Returns `false` for unknown ids.
    pub fn resolve_cell_content(&self, request_id: Uuid, response: CellContentResponse) -> bool {
        let pending = self.pending().remove(&request_id);
        match pending {
            Some(Pending::CellContent(tx)) => tx.send(response).is_ok(),
            Some(other) => {
                tracing::warn!(%request_id, "Cell content answers a different request");
                self.pending().insert(request_id, other);
                false
            }
            None => false,
        }
    }

    /// Complete an input request. Returns `false` for unknown ids.
    pub fn resolve_user_input(&self, request_id: Uuid, value: Option<String>) -> bool {
        let pending = self.pending().remove(&request_id);
        match pending {
            Some(Pending::Input(tx)) => tx.send(value).is_ok(),
            Some(other) => {
                tracing::warn!(%request_id, "User input answers a different request");
                self.pending().insert(request_id, other);
                false
            }
            None => false,
        }
    }

    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.pending().len()
    }

    /// Disconnect and fail every outstanding request.
    pub fn close(&self) {
        self.connected.store(false, Ordering::Release);
        let dropped = std::mem::take(&mut *self.pending());
        if !dropped.is_empty() {
            tracing::debug!(count = dropped.len(), "Failing outstanding editor requests");
        }
    }
}

#[async_trait]
impl RemotePeer for ChannelPeer {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    async fn request_cell_content(
        &self,
        notebook_id: &NotebookId,
        cell_id: &CellId,
    ) -> Result<CellContentResponse, PeerError> {
        self.request(
            |request_id| ServerMessage::RequestCellContent {
                request_id,
                notebook_id: notebook_id.clone(),
                cell_id: cell_id.clone(),
            },
            Pending::CellContent,
        )
        .await
    }

    async fn report_execution_progress(
        &self,
        progress: ExecutionProgress,
    ) -> Result<(), PeerError> {
        self.send(ServerMessage::progress(progress))
    }

    async fn show_message(&self, level: MessageLevel, message: String) -> Result<(), PeerError> {
        self.send(ServerMessage::ShowMessage { level, message })
    }

    async fn request_user_input(&self, prompt: String) -> Result<Option<String>, PeerError> {
        self.request(
            |request_id| ServerMessage::RequestInput { request_id, prompt },
            Pending::Input,
        )
        .await
    }
}

impl std::fmt::Debug for ChannelPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelPeer")
            .field("connected", &self.is_connected())
            .field("pending", &self.pending_requests())
            .finish_non_exhaustive()
    }
}
