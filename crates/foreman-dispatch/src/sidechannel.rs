use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use foreman_core::{CoreError, DocumentKind, PersonaId, SqliteStore, TicketId};

/// The store is shared between concurrently reconciling jobs; sqlite access
/// is short read-then-write bursts under this lock.
pub type SharedStore = Arc<Mutex<SqliteStore>>;

pub fn lock_store(store: &SharedStore) -> Result<MutexGuard<'_, SqliteStore>, CoreError> {
    store
        .lock()
        .map_err(|_| CoreError::Persistence("store lock poisoned".to_owned()))
}

/// Capability surface handed to an agent's execution context: progress
/// reporting, artifact upload, and acceptance-criterion checkoff. Failures
/// here must never block the agent's own execution; callers log and move on.
pub trait SideChannel: Send + Sync {
    fn report(
        &self,
        ticket_id: &TicketId,
        author: Option<&PersonaId>,
        text: &str,
    ) -> Result<(), CoreError>;

    /// Rejects empty content; returns the new monotonically increased
    /// version for (ticket, kind).
    fn save_document(
        &self,
        ticket_id: &TicketId,
        kind: DocumentKind,
        content: &str,
        author: Option<&PersonaId>,
    ) -> Result<i64, CoreError>;

    /// Marks one zero-indexed acceptance-criterion line satisfied.
    /// Idempotent.
    fn check_criterion(&self, ticket_id: &TicketId, index: usize) -> Result<(), CoreError>;
}

pub struct StoreSideChannel {
    store: SharedStore,
}

impl StoreSideChannel {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }
}

impl SideChannel for StoreSideChannel {
    fn report(
        &self,
        ticket_id: &TicketId,
        author: Option<&PersonaId>,
        text: &str,
    ) -> Result<(), CoreError> {
        lock_store(&self.store)?.insert_comment(ticket_id, author, text, Utc::now())?;
        Ok(())
    }

    fn save_document(
        &self,
        ticket_id: &TicketId,
        kind: DocumentKind,
        content: &str,
        author: Option<&PersonaId>,
    ) -> Result<i64, CoreError> {
        if content.trim().is_empty() {
            return Err(CoreError::Configuration(
                "save-document rejects empty content".to_owned(),
            ));
        }
        let document =
            lock_store(&self.store)?.append_document(ticket_id, kind, content, author, Utc::now())?;
        Ok(document.version)
    }

    fn check_criterion(&self, ticket_id: &TicketId, index: usize) -> Result<(), CoreError> {
        lock_store(&self.store)?.mark_criterion_satisfied(ticket_id, index)
    }
}
