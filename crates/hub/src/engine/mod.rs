// Collaboration engine: authoritative document state with optimistic
// concurrency. Stale operations are rebased over the history they missed
// instead of being rejected, so every accepted operation applies against
// a fully caught-up version.
//
// Locking: the outer map is only held long enough to look up a document
// handle; all mutation happens under that document's own mutex. Ops for
// one document serialize, different documents proceed in parallel.

pub mod document;
pub mod transform;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use tandem_common::error::EngineError;
use tandem_common::types::{DocumentOperation, DocumentSnapshot, EntityType, OperationKind};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

use transform::transform_against;

/// Default number of applied operations retained per document.
const DEFAULT_HISTORY_HORIZON: usize = 512;

#[derive(Debug, Clone)]
pub struct CollabEngine {
    docs: Arc<RwLock<HashMap<Uuid, Arc<Mutex<DocState>>>>>,
    history_horizon: usize,
}

#[derive(Debug)]
struct DocState {
    snapshot: DocumentSnapshot,
    /// Applied operations, oldest first, bounded by the horizon.
    history: VecDeque<DocumentOperation>,
}

/// Result of one accepted operation.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    /// The operation as applied: position rebased, `server_version` assigned.
    pub operation: DocumentOperation,
    /// True when the operation was rebased over concurrent history.
    pub conflict: bool,
    /// Document state after the apply.
    pub document: DocumentSnapshot,
}

impl CollabEngine {
    pub fn new() -> Self {
        Self { docs: Arc::new(RwLock::new(HashMap::new())), history_horizon: DEFAULT_HISTORY_HORIZON }
    }

    pub fn with_history_horizon(mut self, horizon: usize) -> Self {
        self.history_horizon = horizon;
        self
    }

    /// Starts tracking a document at version 0 with the creator as its
    /// first collaborator.
    pub async fn create_document(
        &self,
        document_id: Uuid,
        entity_type: EntityType,
        entity_id: impl Into<String>,
        initial_content: impl Into<String>,
        created_by: Uuid,
    ) -> Result<DocumentSnapshot, EngineError> {
        let mut docs = self.docs.write().await;
        if docs.contains_key(&document_id) {
            return Err(EngineError::AlreadyExists(document_id));
        }

        let snapshot = DocumentSnapshot {
            id: document_id,
            entity_type,
            entity_id: entity_id.into(),
            content: initial_content.into(),
            version: 0,
            last_modified_at: Utc::now(),
            last_modified_by: created_by,
            collaborators: vec![created_by],
        };
        docs.insert(
            document_id,
            Arc::new(Mutex::new(DocState { snapshot: snapshot.clone(), history: VecDeque::new() })),
        );
        Ok(snapshot)
    }

    /// Immutable snapshot of a tracked document.
    pub async fn get_document(&self, document_id: Uuid) -> Result<DocumentSnapshot, EngineError> {
        let doc = self.doc_handle(document_id).await?;
        let state = doc.lock().await;
        Ok(state.snapshot.clone())
    }

    /// Applies one operation, rebasing it first when its base version is
    /// stale. Returns the applied operation, whether it was rebased, and
    /// the resulting snapshot.
    pub async fn apply_operation(
        &self,
        document_id: Uuid,
        op: DocumentOperation,
    ) -> Result<ApplyOutcome, EngineError> {
        if op.base_version < 0 {
            return Err(EngineError::InvalidOperation(format!(
                "base_version must be >= 0, got {}",
                op.base_version
            )));
        }
        if matches!(op.kind, OperationKind::Delete | OperationKind::Replace) && op.length == 0 {
            return Err(EngineError::InvalidOperation(
                "delete/replace operations require length > 0".to_string(),
            ));
        }

        let doc = self.doc_handle(document_id).await?;
        let mut state = doc.lock().await;
        let current = state.snapshot.version;

        if op.base_version > current {
            return Err(EngineError::InvalidOperation(format!(
                "base_version {} is ahead of document version {current}",
                op.base_version
            )));
        }

        let conflict = op.base_version < current;
        let mut rebased = op;
        if conflict {
            // The rebase chain needs every version in (base, current]; if
            // the oldest retained entry is newer than base + 1 there is a
            // gap that cannot be reconstructed.
            let oldest_retained = state.history.front().and_then(|prior| prior.server_version);
            let gap = match oldest_retained {
                Some(first) => first > rebased.base_version + 1,
                None => true,
            };
            if gap {
                return Err(EngineError::InvalidOperation(format!(
                    "base_version {} predates retained history for document {document_id}",
                    rebased.base_version
                )));
            }

            let base = rebased.base_version;
            let mut clamped = false;
            for prior in
                state.history.iter().filter(|prior| prior.server_version.is_some_and(|v| v > base))
            {
                let step = transform_against(rebased, prior);
                rebased = step.op;
                clamped |= step.clamped;
            }

            debug!(
                document_id = %document_id,
                user_id = %rebased.user_id,
                base_version = base,
                document_version = current,
                clamped,
                "rebased stale operation over concurrent history"
            );
        }

        document::apply_edit(&mut state.snapshot.content, &rebased);
        state.snapshot.version += 1;
        rebased.server_version = Some(state.snapshot.version);
        state.snapshot.last_modified_at = Utc::now();
        state.snapshot.last_modified_by = rebased.user_id;

        state.history.push_back(rebased.clone());
        while state.history.len() > self.history_horizon {
            state.history.pop_front();
        }

        Ok(ApplyOutcome { operation: rebased, conflict, document: state.snapshot.clone() })
    }

    /// Adds a user to the document's collaborator set. Returns true if the
    /// user was not already a member. Does not touch version or history.
    pub async fn add_collaborator(
        &self,
        document_id: Uuid,
        user_id: Uuid,
    ) -> Result<bool, EngineError> {
        let doc = self.doc_handle(document_id).await?;
        let mut state = doc.lock().await;
        match state.snapshot.collaborators.binary_search(&user_id) {
            Ok(_) => Ok(false),
            Err(index) => {
                state.snapshot.collaborators.insert(index, user_id);
                Ok(true)
            }
        }
    }

    /// Removes a user from the collaborator set. Returns true if present.
    pub async fn remove_collaborator(
        &self,
        document_id: Uuid,
        user_id: Uuid,
    ) -> Result<bool, EngineError> {
        let doc = self.doc_handle(document_id).await?;
        let mut state = doc.lock().await;
        match state.snapshot.collaborators.binary_search(&user_id) {
            Ok(index) => {
                state.snapshot.collaborators.remove(index);
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    async fn doc_handle(&self, document_id: Uuid) -> Result<Arc<Mutex<DocState>>, EngineError> {
        let docs = self.docs.read().await;
        docs.get(&document_id).cloned().ok_or(EngineError::NotFound(document_id))
    }
}

impl Default for CollabEngine {
    fn default() -> Self {
        Self::new()
    }
}
