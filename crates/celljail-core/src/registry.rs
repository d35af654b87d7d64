//! Session registry: one cell per session id.
//!
//! The map sits behind a single `RwLock`. Lookups share the read lock;
//! creation re-checks under the write lock so racing callers for the same id
//! all receive the same cell. The registry never touches a cell's own lock.

use crate::cell::Cell;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Owns the session id → cell mapping and the process-wide bootstrap.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    cells: RwLock<HashMap<String, Arc<Cell>>>,
    bootstrap: RwLock<Arc<str>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cell for `session_id`, creating it if absent.
    pub fn get_or_create(&self, session_id: &str) -> Result<Arc<Cell>> {
        if let Some(cell) = self.lookup(session_id) {
            return Ok(cell);
        }

        let mut cells = self.cells.write().unwrap_or_else(|e| e.into_inner());
        if let Some(cell) = cells.get(session_id) {
            return Ok(Arc::clone(cell));
        }
        let cell = Arc::new(Cell::new(session_id, self.bootstrap())?);
        cells.insert(session_id.to_string(), Arc::clone(&cell));
        tracing::info!(session_id, sessions = cells.len(), "session created");
        Ok(cell)
    }

    /// Look up an existing cell without creating one.
    pub fn get(&self, session_id: &str) -> Result<Arc<Cell>> {
        self.lookup(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))
    }

    fn lookup(&self, session_id: &str) -> Option<Arc<Cell>> {
        self.cells
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .cloned()
    }

    /// Replace the bootstrap used by cells created from now on.
    ///
    /// Existing cells keep the bootstrap they were created with.
    pub fn set_bootstrap(&self, source: impl Into<Arc<str>>) {
        let source = source.into();
        tracing::debug!(bytes = source.len(), "bootstrap updated");
        *self.bootstrap.write().unwrap_or_else(|e| e.into_inner()) = source;
    }

    pub fn bootstrap(&self) -> Arc<str> {
        Arc::clone(&self.bootstrap.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Evict a session. Holders of the returned cell may keep using it.
    pub fn remove(&self, session_id: &str) -> Option<Arc<Cell>> {
        let removed = self
            .cells
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id);
        if removed.is_some() {
            tracing::info!(session_id, "session removed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.cells.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered session ids, sorted
    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .cells
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort_unstable();
        ids
    }
}
