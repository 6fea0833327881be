//! Versioned cell content with optimistic concurrency and peer resync.

use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{
    CellId, NotebookId,
    peer::PeerSlot,
    text::into_normalized,
    traits::CellContentResponse,
};

/// Cell error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CellError {
    #[error("Concurrent modification: expected version {expected}, found {actual}")]
    ConcurrentModification { expected: i32, actual: i32 },
    #[error("Version mismatch: current version {current}, received {received}")]
    VersionMismatch { current: i32, received: i32 },
    #[error("Remote peer unavailable: {0}")]
    PeerUnavailable(String),
    #[error("Received invalid version number: {0}")]
    InvalidVersion(i32),
}

/// What a content update did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentOutcome {
    Applied,
    /// Stale or duplicate update; state unchanged.
    Ignored,
    /// State replaced by the peer's authoritative copy.
    Resynced { version: i32 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellKind {
    Markup,
    #[default]
    Code,
}

/// Last-execution bookkeeping kept by the editor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_order: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
}

/// Text document backing a cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellDocument {
    pub uri: CellId,
    #[serde(default)]
    pub language_id: String,
    pub version: i32,
    pub text: String,
}

/// Notebook-level record of a cell.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellDetail {
    /// Uri of the cell's text document.
    pub document: CellId,
    #[serde(default)]
    pub kind: CellKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_summary: Option<ExecutionSummary>,
}

/// Immutable `(text, version)` snapshot. Always replaced as a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellContent {
    pub text: String,
    pub version: i32,
}

/// One notebook cell and its latest known content.
pub struct VersionedCell {
    uri: CellId,
    notebook_id: NotebookId,
    kind: CellKind,
    language: String,
    content: RwLock<Arc<CellContent>>,
    metadata: RwLock<Option<Value>>,
    execution_summary: RwLock<Option<ExecutionSummary>>,
    peer: PeerSlot,
}

impl VersionedCell {
    /// Create a cell from its opening snapshot. Line endings are normalized.
    #[must_use]
    pub fn new(notebook_id: NotebookId, document: CellDocument, peer: PeerSlot) -> Self {
        Self {
            uri: document.uri,
            notebook_id,
            kind: CellKind::Code,
            language: document.language_id,
            content: RwLock::new(Arc::new(CellContent {
                text: into_normalized(document.text),
                version: document.version,
            })),
            metadata: RwLock::new(None),
            execution_summary: RwLock::new(None),
            peer,
        }
    }

    /// Take kind, metadata and execution summary from the notebook record.
    #[must_use]
    pub fn with_detail(mut self, detail: &CellDetail) -> Self {
        self.kind = detail.kind;
        self.metadata = RwLock::new(detail.metadata.clone());
        self.execution_summary = RwLock::new(detail.execution_summary.clone());
        self
    }

    #[must_use]
    pub fn uri(&self) -> &CellId {
        &self.uri
    }

    #[must_use]
    pub fn notebook_id(&self) -> &NotebookId {
        &self.notebook_id
    }

    #[must_use]
    pub const fn kind(&self) -> CellKind {
        self.kind
    }

    #[must_use]
    pub fn language(&self) -> &str {
        &self.language
    }

    /// Latest published snapshot.
    #[must_use]
    pub fn content(&self) -> Arc<CellContent> {
        Arc::clone(&self.content.read().unwrap_or_else(PoisonError::into_inner))
    }

    #[must_use]
    pub fn text(&self) -> String {
        self.content().text.clone()
    }

    #[must_use]
    pub fn version(&self) -> i32 {
        self.content().version
    }

    #[must_use]
    pub fn metadata(&self) -> Option<Value> {
        self.metadata
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_metadata(&self, metadata: Option<Value>) {
        *self.metadata.write().unwrap_or_else(PoisonError::into_inner) = metadata;
    }

    #[must_use]
    pub fn execution_summary(&self) -> Option<ExecutionSummary> {
        self.execution_summary
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_execution_summary(&self, summary: Option<ExecutionSummary>) {
        *self
            .execution_summary
            .write()
            .unwrap_or_else(PoisonError::into_inner) = summary;
    }

    /// Publish `(text, version)` only if `expected` is still the visible snapshot.
    ///
    /// # Errors
    /// Returns [`CellError::ConcurrentModification`] if another update won.
    pub fn compare_and_set(
        &self,
        expected: &Arc<CellContent>,
        text: String,
        version: i32,
    ) -> Result<(), CellError> {
        let mut current = self.content.write().unwrap_or_else(PoisonError::into_inner);
        if !Arc::ptr_eq(&current, expected) {
            tracing::warn!(
                cell = %self.uri,
                expected = expected.version,
                actual = current.version,
                "Concurrent modification detected"
            );
            return Err(CellError::ConcurrentModification {
                expected: expected.version,
                actual: current.version,
            });
        }
        *current = Arc::new(CellContent {
            text: into_normalized(text),
            version,
        });
        Ok(())
    }

    /// Apply an edited text carrying `new_version`.
    ///
    /// Sequential versions are swapped in against the snapshot read on entry.
    /// Stale versions are ignored. A version gap triggers a resync with the
    /// peer, whose answer is adopted when newer than the snapshot.
    ///
    /// # Errors
    /// [`CellError::ConcurrentModification`] if a sequential swap loses a race,
    /// [`CellError::VersionMismatch`] if the peer is not ahead of us, and
    /// [`CellError::PeerUnavailable`] if the resync request cannot be made.
    pub async fn set_content(
        &self,
        new_text: String,
        new_version: i32,
    ) -> Result<ContentOutcome, CellError> {
        let current = self.content();

        if current.version == new_version.saturating_sub(1) {
            return self
                .compare_and_set(&current, new_text, new_version)
                .map(|()| ContentOutcome::Applied);
        }

        if current.version >= new_version {
            tracing::debug!(
                cell = %self.uri,
                current = current.version,
                received = new_version,
                "Ignoring stale content update"
            );
            return Ok(ContentOutcome::Ignored);
        }

        tracing::debug!(
            cell = %self.uri,
            current = current.version,
            received = new_version,
            "Version gap, requesting cell content"
        );
        let response = self.fetch_content().await?;
        if response.version <= current.version {
            tracing::warn!(
                cell = %self.uri,
                current = current.version,
                received = response.version,
                "Version mismatch: resync returned an older version"
            );
            return Err(CellError::VersionMismatch {
                current: current.version,
                received: response.version,
            });
        }

        let received = response.version;
        let fresh = Arc::new(CellContent {
            text: into_normalized(response.text),
            version: received,
        });
        let mut visible = self.content.write().unwrap_or_else(PoisonError::into_inner);
        if !Arc::ptr_eq(&visible, &current) && received <= visible.version {
            tracing::debug!(
                cell = %self.uri,
                visible = visible.version,
                received,
                "Newer content arrived during resync, keeping it"
            );
            return Ok(ContentOutcome::Ignored);
        }
        *visible = fresh;
        Ok(ContentOutcome::Resynced { version: received })
    }

    /// Fetch and adopt the peer's authoritative content unconditionally.
    ///
    /// # Errors
    /// [`CellError::PeerUnavailable`] if the request cannot be made and
    /// [`CellError::InvalidVersion`] for a non-positive version.
    pub async fn request_content_and_set(&self) -> Result<ContentOutcome, CellError> {
        let response = self.fetch_content().await?;
        if response.version <= 0 {
            return Err(CellError::InvalidVersion(response.version));
        }
        let version = response.version;
        *self.content.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(CellContent {
            text: into_normalized(response.text),
            version,
        });
        Ok(ContentOutcome::Resynced { version })
    }

    async fn fetch_content(&self) -> Result<CellContentResponse, CellError> {
        let peer = self
            .peer
            .get()
            .ok_or_else(|| CellError::PeerUnavailable("no connected peer".into()))?;
        peer.request_cell_content(&self.notebook_id, &self.uri)
            .await
            .map_err(|e| CellError::PeerUnavailable(e.to_string()))
    }
}

impl std::fmt::Debug for VersionedCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let content = self.content();
        f.debug_struct("VersionedCell")
            .field("uri", &self.uri)
            .field("notebook_id", &self.notebook_id)
            .field("kind", &self.kind)
            .field("version", &content.version)
            .finish_non_exhaustive()
    }
}
