//! Entry point for the editor: notebook lifecycle, edits and cell execution.

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use cellsync_core::{
    CellError, CellId, NotebookChange, NotebookError, NotebookId, NotebookState, PeerSlot,
    cell::CellDocument,
    notebook::{NotebookDocument, StructuralUpdate},
    traits::MessageLevel,
};
use cellsync_executor::ExecutionResult;
use thiserror::Error;

use crate::registry::SessionRegistry;

pub const INITIALIZING_MESSAGE: &str = "Initializing kernel for notebook.";
pub const INITIALIZED_MESSAGE: &str = "Kernel initialized successfully";
pub const INITIALIZATION_FAILED_MESSAGE: &str = "Error could not initialize kernel for the notebook.";

/// Notebook service error.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Unknown notebook: {0}")]
    UnknownNotebook(NotebookId),
    #[error("Notebook error: {0}")]
    Notebook(#[from] NotebookError),
    #[error("Cell error: {0}")]
    Cell(#[from] CellError),
}

/// Open notebooks and their sessions.
pub struct NotebookService {
    registry: SessionRegistry,
    peer: PeerSlot,
    notebooks: RwLock<HashMap<NotebookId, Arc<NotebookState>>>,
    // Completion requests carry only the cell uri.
    cell_index: RwLock<HashMap<CellId, NotebookId>>,
}

impl NotebookService {
    #[must_use]
    pub fn new(registry: SessionRegistry, peer: PeerSlot) -> Self {
        Self {
            registry,
            peer,
            notebooks: RwLock::default(),
            cell_index: RwLock::default(),
        }
    }

    #[must_use]
    pub const fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    async fn show(peer: &PeerSlot, level: MessageLevel, message: &str) {
        let Some(peer) = peer.get() else {
            return;
        };
        if let Err(e) = peer.show_message(level, message.to_string()).await {
            tracing::warn!("Failed to show message: {e}");
        }
    }

    /// Track a newly opened notebook and start its session in the background.
    ///
    /// The user is told when the session is ready or failed to start.
    pub async fn open(&self, notebook: NotebookDocument, documents: Vec<CellDocument>) {
        let notebook_id = notebook.uri.clone();
        tracing::info!(notebook_id = %notebook_id, cells = notebook.cells.len(), "Opening notebook");
        Self::show(&self.peer, MessageLevel::Status, INITIALIZING_MESSAGE).await;

        let session = self.registry.create_session(&notebook_id);
        let peer = self.peer.clone();
        tokio::spawn(async move {
            match session.await {
                Ok(_) => Self::show(&peer, MessageLevel::Status, INITIALIZED_MESSAGE).await,
                Err(e) => {
                    tracing::error!("{INITIALIZATION_FAILED_MESSAGE} {e}");
                    Self::show(&peer, MessageLevel::Error, INITIALIZATION_FAILED_MESSAGE).await;
                }
            }
        });

        let state = Arc::new(NotebookState::new(&notebook, documents, self.peer.clone()));
        {
            let mut index = self.cell_index.write().unwrap_or_else(PoisonError::into_inner);
            for cell_id in state.cell_ids() {
                index.insert(cell_id, notebook_id.clone());
            }
        }
        self.notebooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(notebook_id, state);
    }

    #[must_use]
    pub fn notebook(&self, notebook_id: &str) -> Option<Arc<NotebookState>> {
        self.notebooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(notebook_id)
            .map(Arc::clone)
    }

    /// Notebook owning `cell_id`.
    #[must_use]
    pub fn notebook_for_cell(&self, cell_id: &str) -> Option<NotebookId> {
        self.cell_index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(cell_id)
            .cloned()
    }

    /// Current text of a cell.
    #[must_use]
    pub fn cell_text(&self, notebook_id: &str, cell_id: &str) -> Option<String> {
        self.notebook(notebook_id)?.cell(cell_id).map(|cell| cell.text())
    }

    /// Apply an editor change to the notebook's state.
    ///
    /// # Errors
    /// [`ServiceError::UnknownNotebook`] if the notebook is not open, or the
    /// structural or content error that stopped the change.
    pub async fn apply_change(
        &self,
        notebook_id: &str,
        change: NotebookChange,
    ) -> Result<StructuralUpdate, ServiceError> {
        let state = self
            .notebook(notebook_id)
            .ok_or_else(|| ServiceError::UnknownNotebook(notebook_id.to_string()))?;
        let update = state.apply_change(change).await?;

        if !update.opened.is_empty() || !update.closed.is_empty() {
            let mut index = self.cell_index.write().unwrap_or_else(PoisonError::into_inner);
            for cell_id in &update.closed {
                index.remove(cell_id);
            }
            for cell_id in &update.opened {
                index.insert(cell_id.clone(), notebook_id.to_string());
            }
        }
        Ok(update)
    }

    /// Forget the notebook and dispose of its session. Returns whether it was open.
    pub fn close(&self, notebook_id: &str) -> bool {
        let removed = self
            .notebooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(notebook_id);
        self.cell_index
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, owner| owner != notebook_id);
        let closed = self.registry.close(notebook_id);
        tracing::info!(notebook_id, "Notebook closed");
        removed.is_some() || closed
    }

    /// Execute `code` from `cell_id` in the notebook's session.
    pub async fn submit(&self, notebook_id: &str, cell_id: CellId, code: String) -> ExecutionResult {
        self.registry.submit(notebook_id, cell_id, code).await
    }

    /// Stop the notebook's running cell and drop its queue.
    pub fn interrupt(&self, notebook_id: &str) -> &'static str {
        self.registry.interrupt(notebook_id)
    }
}

impl std::fmt::Debug for NotebookService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotebookService")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
