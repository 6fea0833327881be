//! Dispatch of editor messages onto the notebook service.

use std::{sync::Arc, time::Duration};

use cellsync_core::{PeerSlot, RegistryConfig, SessionFactory, traits::CellContentResponse};
use cellsync_session::{NotebookService, SessionRegistry};
use futures::{Stream, StreamExt as _};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
    channel::ChannelPeer,
    protocol::{ClientMessage, ServerMessage},
};

/// One editor connection.
pub struct NotebookServer {
    service: Arc<NotebookService>,
    peer: Arc<ChannelPeer>,
}

impl NotebookServer {
    #[must_use]
    pub const fn new(service: Arc<NotebookService>, peer: Arc<ChannelPeer>) -> Self {
        Self { service, peer }
    }

    /// Build a server with its own registry, returning the stream of messages
    /// for the editor.
    #[must_use]
    pub fn connect(
        factory: Arc<dyn SessionFactory>,
        config: RegistryConfig,
        response_timeout: Duration,
    ) -> (Arc<Self>, UnboundedReceiverStream<ServerMessage>) {
        let (peer, outgoing) = ChannelPeer::channel(response_timeout);
        let peer = Arc::new(peer);
        let slot = PeerSlot::connected(peer.clone());
        let registry = SessionRegistry::new(factory, slot.clone(), config);
        let service = Arc::new(NotebookService::new(registry, slot));
        (Arc::new(Self::new(service, peer)), outgoing)
    }

    #[must_use]
    pub const fn service(&self) -> &Arc<NotebookService> {
        &self.service
    }

    fn reply(&self, message: ServerMessage) {
        if let Err(e) = self.peer.send(message) {
            tracing::debug!("Dropping reply: {e}");
        }
    }

    /// Parse one JSON message, answering malformed input with an error.
    pub fn decode(&self, text: &str) -> Option<ClientMessage> {
        match ClientMessage::from_json(text) {
            Ok(message) => Some(message),
            Err(e) => {
                tracing::warn!("Invalid client message: {e}");
                self.reply(ServerMessage::Error {
                    message: format!("Invalid message: {e}"),
                });
                None
            }
        }
    }

    /// Handle one message.
    ///
    /// Edits are applied before this returns. Cell execution runs in the
    /// background and is answered with [`ServerMessage::ExecutionResult`].
    pub async fn handle(&self, message: ClientMessage) {
        match message {
            ClientMessage::OpenNotebook { notebook, cells } => {
                self.service.open(notebook, cells).await;
            }
            ClientMessage::ChangeNotebook {
                notebook_id,
                change,
            } => {
                if let Err(e) = self.service.apply_change(&notebook_id, change).await {
                    tracing::warn!(notebook_id = %notebook_id, "Failed to apply notebook change: {e}");
                    self.reply(ServerMessage::Error {
                        message: e.to_string(),
                    });
                }
            }
            ClientMessage::CloseNotebook { notebook_id } => {
                self.service.close(&notebook_id);
            }
            ClientMessage::ExecuteCell {
                request_id,
                notebook_id,
                cell_id,
                code,
            } => {
                let Some(code) = code.or_else(|| self.service.cell_text(&notebook_id, &cell_id))
                else {
                    self.reply(ServerMessage::ExecutionResult {
                        request_id,
                        success: false,
                        error: Some(format!("Unknown cell: {cell_id}")),
                    });
                    return;
                };

                let service = Arc::clone(&self.service);
                let peer = Arc::clone(&self.peer);
                tokio::spawn(async move {
                    let result = service.submit(&notebook_id, cell_id, code).await;
                    let message = ServerMessage::ExecutionResult {
                        request_id,
                        success: result == Ok(true),
                        error: result.err().map(|e| e.to_string()),
                    };
                    if let Err(e) = peer.send(message) {
                        tracing::debug!(%request_id, "Dropping execution result: {e}");
                    }
                });
            }
            ClientMessage::Interrupt { notebook_id } => {
                let message = self.service.interrupt(&notebook_id).to_string();
                self.reply(ServerMessage::InterruptResult {
                    notebook_id,
                    message,
                });
            }
            ClientMessage::CellContent {
                request_id,
                text,
                version,
            } => {
                let response = CellContentResponse { text, version };
                if !self.peer.resolve_cell_content(request_id, response) {
                    tracing::debug!(%request_id, "Cell content for unknown request");
                }
            }
            ClientMessage::UserInput { request_id, value } => {
                if !self.peer.resolve_user_input(request_id, value) {
                    tracing::debug!(%request_id, "User input for unknown request");
                }
            }
            ClientMessage::Ping => self.reply(ServerMessage::Pong),
        }
    }

    /// Handle messages until `incoming` ends, then disconnect.
    ///
    /// Answers to kernel requests are applied as they arrive. Everything else
    /// is handled in order on a separate task, so an edit waiting on the
    /// editor cannot block the answer it waits for.
    pub async fn serve<S>(self: Arc<Self>, mut incoming: S)
    where
        S: Stream<Item = ClientMessage> + Unpin + Send,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ordered = {
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                while let Some(message) = rx.recv().await {
                    server.handle(message).await;
                }
            })
        };

        while let Some(message) = incoming.next().await {
            if message.is_response() {
                self.handle(message).await;
            } else if tx.send(message).is_err() {
                break;
            }
        }

        drop(tx);
        self.peer.close();
        if let Err(e) = ordered.await {
            tracing::error!("Message handler failed: {e}");
        }
        tracing::info!("Editor connection closed");
    }
}
