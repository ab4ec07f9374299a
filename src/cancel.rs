//! Durable, cooperative cancellation flag.
//!
//! An external caller sets the flag for a run identifier; the dispatcher
//! polls it at page boundaries. Once set the flag is permanent for the
//! run's lifetime. The distinguished value [`CANCEL_ALL`] addresses queued
//! runs that have not started yet; its sweep semantics live in the run
//! controller.

use crate::state::{StateError, StateStore};
use std::sync::Arc;

/// Run identifier meaning "cancel every not-yet-started queued run".
/// Runs already executing under their own id are unaffected.
pub const CANCEL_ALL: &str = "all";

/// Durable boolean flag keyed by run identifier
#[derive(Clone)]
pub struct CancelFlag {
    store: Arc<dyn StateStore>,
}

impl CancelFlag {
    /// Bind the flag to a state store
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Set the flag for a run. Idempotent; observable by the dispatcher
    /// within one page-boundary poll.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn cancel(&self, run_id: &str) -> Result<(), StateError> {
        self.store.set(&format!("{run_id}:cancelled"), "1").await
    }

    /// Whether the flag is set for a run; `false` for unknown identifiers
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn is_cancelled(&self, run_id: &str) -> Result<bool, StateError> {
        Ok(self
            .store
            .get(&format!("{run_id}:cancelled"))
            .await?
            .is_some())
    }
}
