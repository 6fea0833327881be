//! Authoritative cell order and per-cell state of one notebook.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{
    CellId, NotebookId,
    cell::{CellDetail, CellDocument, CellError, ContentOutcome, VersionedCell},
    peer::PeerSlot,
    text::{ContentEdit, apply_edits},
};

/// Notebook error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotebookError {
    #[error("Structural inconsistency: {0}")]
    StructuralInconsistency(String),
    #[error(transparent)]
    Cell(#[from] CellError),
}

/// Notebook as announced when it is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotebookDocument {
    pub uri: NotebookId,
    #[serde(default)]
    pub version: i32,
    #[serde(default)]
    pub cells: Vec<CellDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Cells inserted and removed as one splice of the cell list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuralChange {
    /// Index of the splice in the cell list.
    pub start: usize,
    pub delete_count: usize,
    /// Records of the inserted cells, in order.
    #[serde(default)]
    pub cells: Vec<CellDetail>,
    /// Text documents of the inserted cells, in the same order.
    #[serde(default)]
    pub did_open: Vec<CellDocument>,
    #[serde(default)]
    pub did_close: Vec<CellId>,
}

/// Incremental edits for one cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentChange {
    pub document: CellId,
    pub version: i32,
    pub changes: Vec<ContentEdit>,
}

/// Everything one notebook change event carries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotebookChange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structure: Option<StructuralChange>,
    #[serde(default)]
    pub data: Vec<CellDetail>,
    #[serde(default)]
    pub text_content: Vec<ContentChange>,
}

/// Cells that entered or left the notebook during a structural change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StructuralUpdate {
    pub opened: Vec<CellId>,
    pub closed: Vec<CellId>,
}

pub struct NotebookState {
    uri: NotebookId,
    peer: PeerSlot,
    order: Mutex<Vec<CellId>>,
    cells: RwLock<HashMap<CellId, Arc<VersionedCell>>>,
}

impl NotebookState {
    /// Build the state from the opened notebook and its cell documents.
    ///
    /// Records and documents are paired in order; any surplus is dropped.
    #[must_use]
    pub fn new(notebook: &NotebookDocument, documents: Vec<CellDocument>, peer: PeerSlot) -> Self {
        if notebook.cells.len() != documents.len() {
            tracing::error!(
                notebook_id = %notebook.uri,
                records = notebook.cells.len(),
                documents = documents.len(),
                "Mismatched number of cells and cell documents"
            );
        }

        let mut order = Vec::with_capacity(documents.len());
        let mut cells = HashMap::with_capacity(documents.len());
        for (detail, document) in notebook.cells.iter().zip(documents) {
            if cells.contains_key(&document.uri) {
                tracing::warn!(notebook_id = %notebook.uri, cell = %document.uri, "Duplicate cell skipped");
                continue;
            }
            order.push(document.uri.clone());
            let cell = VersionedCell::new(notebook.uri.clone(), document, peer.clone())
                .with_detail(detail);
            cells.insert(cell.uri().clone(), Arc::new(cell));
        }

        Self {
            uri: notebook.uri.clone(),
            peer,
            order: Mutex::new(order),
            cells: RwLock::new(cells),
        }
    }

    #[must_use]
    pub fn uri(&self) -> &NotebookId {
        &self.uri
    }

    #[must_use]
    pub fn cell(&self, cell_id: &str) -> Option<Arc<VersionedCell>> {
        self.cells
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(cell_id)
            .cloned()
    }

    /// Cell ids in notebook order.
    #[must_use]
    pub fn cell_ids(&self) -> Vec<CellId> {
        self.order
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Splice the cell list: drop `delete_count` ids at `start`, then insert
    /// the opened cells there.
    ///
    /// The change is validated before anything is modified. Removals that
    /// disagree with `did_close` are logged and reconciled so that the order
    /// and the cell map keep identical key sets.
    ///
    /// # Errors
    /// [`NotebookError::StructuralInconsistency`] when the opened documents and
    /// records differ in number, `start` is out of bounds, or an inserted id
    /// would be duplicated.
    pub fn apply_structural_change(
        &self,
        change: StructuralChange,
    ) -> Result<StructuralUpdate, NotebookError> {
        let StructuralChange {
            start,
            delete_count,
            cells: details,
            did_open,
            did_close,
        } = change;

        if did_open.len() != details.len() {
            return Err(NotebookError::StructuralInconsistency(format!(
                "{} opened cells but {} cell records",
                did_open.len(),
                details.len()
            )));
        }

        let mut order = self.order.lock().unwrap_or_else(PoisonError::into_inner);
        if start > order.len() {
            return Err(NotebookError::StructuralInconsistency(format!(
                "splice start {start} beyond {} cells",
                order.len()
            )));
        }

        let end = start.saturating_add(delete_count).min(order.len());
        let closed: HashSet<&CellId> = did_close.iter().collect();
        let spliced: HashSet<&CellId> = order[start..end].iter().collect();
        let surviving: HashSet<&CellId> = order
            .iter()
            .filter(|id| !spliced.contains(id) && !closed.contains(id))
            .collect();

        let mut opened = HashSet::with_capacity(did_open.len());
        for document in &did_open {
            if !opened.insert(&document.uri) || surviving.contains(&document.uri) {
                return Err(NotebookError::StructuralInconsistency(format!(
                    "cell {} would appear twice",
                    document.uri
                )));
            }
        }

        for id in &order[start..end] {
            if !closed.contains(id) {
                tracing::warn!(notebook_id = %self.uri, cell = %id, "Removed cell not found in close list");
            }
        }
        // Closed ids outside the range leave their old slot even when they are
        // reopened, so a reopened id only exists at the splice point.
        let inserted: Vec<CellId> = did_open.iter().map(|d| d.uri.clone()).collect();
        let len = order.len();
        let mut removed = Vec::with_capacity(end - start);
        let mut stray = Vec::new();
        let mut next = Vec::with_capacity(len + inserted.len());
        for (i, id) in std::mem::take(&mut *order).into_iter().enumerate() {
            if i == start {
                next.extend(inserted.iter().cloned());
            }
            if (start..end).contains(&i) {
                removed.push(id);
            } else if closed.contains(&id) {
                tracing::warn!(notebook_id = %self.uri, cell = %id, "Closed cell was outside the removed range");
                stray.push(id);
            } else {
                next.push(id);
            }
        }
        if start == len {
            next.extend(inserted.iter().cloned());
        }
        *order = next;

        let mut cells = self.cells.write().unwrap_or_else(PoisonError::into_inner);
        let mut update = StructuralUpdate::default();
        for id in did_close.iter().chain(removed.iter()).chain(stray.iter()) {
            if inserted.contains(id) {
                continue;
            }
            if cells.remove(id).is_some() {
                tracing::debug!(notebook_id = %self.uri, cell = %id, "Removed cell");
                update.closed.push(id.clone());
            }
        }
        for (document, detail) in did_open.into_iter().zip(&details) {
            if detail.document != document.uri {
                tracing::debug!(
                    notebook_id = %self.uri,
                    cell = %document.uri,
                    record = %detail.document,
                    "Cell record refers to a different document"
                );
            }
            let cell = VersionedCell::new(self.uri.clone(), document, self.peer.clone())
                .with_detail(detail);
            let id = cell.uri().clone();
            tracing::debug!(notebook_id = %self.uri, cell = %id, "Added cell");
            cells.insert(id.clone(), Arc::new(cell));
            update.opened.push(id);
        }

        Ok(update)
    }

    /// Replace a cell's metadata and execution summary. Returns `false` for an
    /// unknown cell.
    pub fn apply_data_change(&self, detail: &CellDetail) -> bool {
        let Some(cell) = self.cell(&detail.document) else {
            tracing::warn!(notebook_id = %self.uri, cell = %detail.document, "Data change for non-existent cell");
            return false;
        };
        cell.set_metadata(detail.metadata.clone());
        cell.set_execution_summary(detail.execution_summary.clone());
        tracing::debug!(notebook_id = %self.uri, cell = %detail.document, "Updated cell data");
        true
    }

    /// Patch a cell's text and publish it at the change's version.
    ///
    /// A patch that cannot be applied falls back to refetching the cell from
    /// the peer.
    ///
    /// # Errors
    /// Propagates the [`CellError`] of the update or the refetch.
    pub async fn apply_content_change(
        &self,
        change: &ContentChange,
    ) -> Result<ContentOutcome, NotebookError> {
        let Some(cell) = self.cell(&change.document) else {
            tracing::warn!(notebook_id = %self.uri, cell = %change.document, "Content change for non-existent cell");
            return Ok(ContentOutcome::Ignored);
        };

        let current = cell.content();
        let outcome = match apply_edits(&current.text, &change.changes) {
            Ok(text) => cell.set_content(text, change.version).await?,
            Err(e) => {
                tracing::warn!(
                    notebook_id = %self.uri,
                    cell = %change.document,
                    "Applying edits failed, requesting full content: {e}"
                );
                cell.request_content_and_set().await?
            }
        };
        tracing::debug!(
            notebook_id = %self.uri,
            cell = %change.document,
            version = change.version,
            ?outcome,
            "Content change processed"
        );
        Ok(outcome)
    }

    /// Apply structure, then data, then text content.
    ///
    /// # Errors
    /// Stops at the first structural or content error.
    pub async fn apply_change(
        &self,
        change: NotebookChange,
    ) -> Result<StructuralUpdate, NotebookError> {
        let update = match change.structure {
            Some(structure) => self.apply_structural_change(structure)?,
            None => StructuralUpdate::default(),
        };
        for detail in &change.data {
            self.apply_data_change(detail);
        }
        for content in &change.text_content {
            self.apply_content_change(content).await?;
        }
        Ok(update)
    }
}

impl std::fmt::Debug for NotebookState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotebookState")
            .field("uri", &self.uri)
            .field("cells", &self.cell_ids())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        testing::MockPeer,
        text::{Position, Range},
    };

    fn document(uri: &str, text: &str, version: i32) -> CellDocument {
        CellDocument {
            uri: uri.into(),
            language_id: "java".into(),
            version,
            text: text.into(),
        }
    }

    fn detail(uri: &str) -> CellDetail {
        CellDetail {
            document: uri.into(),
            ..Default::default()
        }
    }

    fn notebook(peer: &Arc<MockPeer>, uris: &[&str]) -> NotebookState {
        let doc = NotebookDocument {
            uri: "nb".into(),
            version: 1,
            cells: uris.iter().map(|u| detail(u)).collect(),
            metadata: None,
        };
        let documents = uris.iter().map(|u| document(u, "", 1)).collect();
        NotebookState::new(&doc, documents, PeerSlot::connected(peer.clone()))
    }

    fn assert_consistent(state: &NotebookState) {
        let order = state.cell_ids();
        let unique: HashSet<_> = order.iter().collect();
        assert_eq!(unique.len(), order.len(), "duplicate ids in {order:?}");
        let cells = state.cells.read().unwrap();
        let keys: HashSet<_> = cells.keys().collect();
        assert_eq!(keys, unique);
    }

    fn insert(start: usize, delete_count: usize, uris: &[&str], closed: &[&str]) -> StructuralChange {
        StructuralChange {
            start,
            delete_count,
            cells: uris.iter().map(|u| detail(u)).collect(),
            did_open: uris.iter().map(|u| document(u, "x", 1)).collect(),
            did_close: closed.iter().map(|u| (*u).to_string()).collect(),
        }
    }

    #[test]
    fn test_insert_and_remove() {
        let peer = Arc::new(MockPeer::new());
        let state = notebook(&peer, &["a", "b", "c"]);

        let update = state.apply_structural_change(insert(1, 1, &["x", "y"], &["b"])).unwrap();
        assert_eq!(state.cell_ids(), ["a", "x", "y", "c"]);
        assert_eq!(update.opened, ["x", "y"]);
        assert_eq!(update.closed, ["b"]);
        assert_eq!(state.cell("x").unwrap().text(), "x");
        assert!(state.cell("b").is_none());
        assert_consistent(&state);

        state.apply_structural_change(insert(4, 0, &["z"], &[])).unwrap();
        assert_eq!(state.cell_ids(), ["a", "x", "y", "c", "z"]);
        assert_consistent(&state);
    }

    #[test]
    fn test_count_mismatch_is_rejected_without_changes() {
        let peer = Arc::new(MockPeer::new());
        let state = notebook(&peer, &["a", "b"]);
        let mut change = insert(0, 1, &["x", "y"], &["a"]);
        change.cells.pop();

        let err = state.apply_structural_change(change).unwrap_err();
        assert!(matches!(err, NotebookError::StructuralInconsistency(_)));
        assert_eq!(state.cell_ids(), ["a", "b"]);
        assert_consistent(&state);
    }

    #[test]
    fn test_duplicates_are_rejected() {
        let peer = Arc::new(MockPeer::new());
        let state = notebook(&peer, &["a", "b"]);

        let err = state.apply_structural_change(insert(0, 0, &["b"], &[])).unwrap_err();
        assert!(matches!(err, NotebookError::StructuralInconsistency(_)));
        let err = state
            .apply_structural_change(insert(0, 0, &["x", "x"], &[]))
            .unwrap_err();
        assert!(matches!(err, NotebookError::StructuralInconsistency(_)));
        let err = state.apply_structural_change(insert(3, 0, &["x"], &[])).unwrap_err();
        assert!(matches!(err, NotebookError::StructuralInconsistency(_)));

        // Re-inserting a cell that is removed in the same splice is a move.
        state.apply_structural_change(insert(0, 1, &["a"], &["a"])).unwrap();
        assert_eq!(state.cell_ids(), ["a", "b"]);
        assert_consistent(&state);
    }

    #[test]
    fn test_mismatched_close_list_is_reconciled() {
        let peer = Arc::new(MockPeer::new());
        let state = notebook(&peer, &["a", "b", "c", "d"]);

        // Removes "b" without closing it and closes "d" outside the range.
        let update = state.apply_structural_change(insert(1, 1, &[], &["d"])).unwrap();
        assert_eq!(state.cell_ids(), ["a", "c"]);
        assert_eq!(update.closed.len(), 2);
        assert_consistent(&state);
    }

    #[test]
    fn test_reopened_cell_outside_range_moves() {
        let peer = Arc::new(MockPeer::new());
        let state = notebook(&peer, &["a", "b", "c", "d"]);

        // "d" is closed at the end and reopened where "b" was.
        let update = state.apply_structural_change(insert(1, 1, &["d"], &["b", "d"])).unwrap();
        assert_eq!(state.cell_ids(), ["a", "d", "c"]);
        assert_eq!(update.opened, ["d"]);
        assert_eq!(update.closed, ["b"]);
        assert_eq!(state.cell("d").unwrap().text(), "x");
        assert_consistent(&state);

        // Same move without "b" in the close list, and a stray before the range.
        let update = state.apply_structural_change(insert(2, 1, &["a"], &["a"])).unwrap();
        assert_eq!(state.cell_ids(), ["d", "a"]);
        assert_eq!(update.opened, ["a"]);
        assert_eq!(update.closed, ["c"]);
        assert_consistent(&state);
    }

    #[test]
    fn test_data_change() {
        let peer = Arc::new(MockPeer::new());
        let state = notebook(&peer, &["a"]);
        let mut record = detail("a");
        record.metadata = Some(serde_json::json!({"tag": 1}));

        assert!(state.apply_data_change(&record));
        assert_eq!(state.cell("a").unwrap().metadata(), record.metadata);
        assert!(!state.apply_data_change(&detail("ghost")));
    }

    #[tokio::test]
    async fn test_content_change_with_gap_resync() {
        let peer = Arc::new(MockPeer::new());
        let doc = NotebookDocument {
            uri: "nb".into(),
            version: 1,
            cells: vec![detail("c1")],
            metadata: None,
        };
        let state = NotebookState::new(
            &doc,
            vec![document("c1", "a", 1)],
            PeerSlot::connected(peer.clone()),
        );

        let origin = Position::new(0, 0);
        let edit = ContentChange {
            document: "c1".into(),
            version: 2,
            changes: vec![ContentEdit::replace(Range::new(origin, origin), "b")],
        };
        assert_eq!(
            state.apply_content_change(&edit).await.unwrap(),
            ContentOutcome::Applied
        );
        let cell = state.cell("c1").unwrap();
        assert_eq!((cell.text(), cell.version()), ("ba".to_string(), 2));

        peer.push_cell_content("ba-fixed", 4);
        let gap = ContentChange {
            document: "c1".into(),
            version: 4,
            changes: vec![ContentEdit::replace(Range::new(origin, origin), "z")],
        };
        assert_eq!(
            state.apply_content_change(&gap).await.unwrap(),
            ContentOutcome::Resynced { version: 4 }
        );
        assert_eq!((cell.text(), cell.version()), ("ba-fixed".to_string(), 4));
    }

    #[tokio::test]
    async fn test_bad_patch_falls_back_to_refetch() {
        let peer = Arc::new(MockPeer::new());
        let state = notebook(&peer, &["a"]);
        peer.push_cell_content("server copy", 9);

        let change = ContentChange {
            document: "a".into(),
            version: 2,
            changes: vec![ContentEdit::replace(
                Range::new(Position::new(5, 0), Position::new(5, 1)),
                "?",
            )],
        };
        assert_eq!(
            state.apply_content_change(&change).await.unwrap(),
            ContentOutcome::Resynced { version: 9 }
        );
        assert_eq!(state.cell("a").unwrap().text(), "server copy");
    }

    #[tokio::test]
    async fn test_content_change_for_missing_cell_is_ignored() {
        let peer = Arc::new(MockPeer::new());
        let state = notebook(&peer, &["a"]);
        let change = ContentChange {
            document: "ghost".into(),
            version: 2,
            changes: vec![ContentEdit::full("x")],
        };
        assert_eq!(
            state.apply_content_change(&change).await.unwrap(),
            ContentOutcome::Ignored
        );
    }

    #[tokio::test]
    async fn test_apply_change_orders_structure_before_content() {
        let peer = Arc::new(MockPeer::new());
        let state = notebook(&peer, &["a"]);
        let change = NotebookChange {
            structure: Some(insert(1, 0, &["b"], &[])),
            data: vec![detail("b")],
            text_content: vec![ContentChange {
                document: "b".into(),
                version: 2,
                changes: vec![ContentEdit::full("int y = 2;\r\n")],
            }],
        };

        let update = state.apply_change(change).await.unwrap();
        assert_eq!(update.opened, ["b"]);
        let cell = state.cell("b").unwrap();
        assert_eq!((cell.text(), cell.version()), ("int y = 2;\n".to_string(), 2));
    }

    #[test]
    fn test_change_deserialization() {
        let change: NotebookChange = serde_json::from_str(
            r#"{
                "structure": {"start": 0, "deleteCount": 1, "didClose": ["a"]},
                "textContent": [{"document": "b", "version": 3,
                    "changes": [{"range": {"start": {"line": 0, "character": 0},
                                           "end": {"line": 0, "character": 1}}, "text": "q"}]}]
            }"#,
        )
        .unwrap();
        let structure = change.structure.unwrap();
        assert_eq!(structure.delete_count, 1);
        assert_eq!(structure.did_close, ["a"]);
        assert_eq!(change.text_content[0].changes[0].text, "q");
    }
}
