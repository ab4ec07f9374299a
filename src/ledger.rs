//! Durable progress counters and resume cursor for one broadcast run.
//!
//! Keys follow the `{run_id}:{field}` scheme. All reads default to 0/false
//! for unknown keys so a fresh run starts cleanly. Increments are persisted
//! after the corresponding send attempts resolve; a crash between a send
//! and its persisted increment means the attempt is repeated on resume.
//! That at-least-once gap is accepted, never hidden.

use crate::state::{StateError, StateStore};
use std::sync::Arc;

/// Durable counters and cursor for one run, keyed by run identifier
#[derive(Clone)]
pub struct ProgressLedger {
    store: Arc<dyn StateStore>,
    run_id: String,
}

impl ProgressLedger {
    /// Bind a ledger to a run identifier
    pub fn new(store: Arc<dyn StateStore>, run_id: impl Into<String>) -> Self {
        Self {
            store,
            run_id: run_id.into(),
        }
    }

    fn key(&self, field: &str) -> String {
        format!("{}:{}", self.run_id, field)
    }

    async fn read_u64(&self, field: &str) -> Result<u64, StateError> {
        Ok(self
            .store
            .get(&self.key(field))
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    async fn add(&self, field: &str, n: u64) -> Result<(), StateError> {
        let current = self.read_u64(field).await?;
        self.store
            .set(&self.key(field), &(current + n).to_string())
            .await
    }

    /// Record one successful send
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn increment_sent(&self) -> Result<(), StateError> {
        self.add_sent(1).await
    }

    /// Record one failed send
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn increment_errors(&self) -> Result<(), StateError> {
        self.add_errors(1).await
    }

    /// Record `n` successful sends at once (used after a sub-batch joins)
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn add_sent(&self, n: u64) -> Result<(), StateError> {
        self.add("messages_sent", n).await
    }

    /// Record `n` failed sends at once
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn add_errors(&self, n: u64) -> Result<(), StateError> {
        self.add("errors", n).await
    }

    /// Current `(sent, errors)` counters, 0/0 for an unknown run
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn counts(&self) -> Result<(u64, u64), StateError> {
        Ok((
            self.read_u64("messages_sent").await?,
            self.read_u64("errors").await?,
        ))
    }

    /// Last processed recipient key, 0 for a fresh run.
    ///
    /// The cursor only ever advances within a run; the dispatcher persists
    /// it in source order, strictly after a sub-batch's sends resolve.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn cursor(&self) -> Result<i64, StateError> {
        Ok(self
            .store
            .get(&self.key("last_recipient_key"))
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    /// Persist the resume cursor
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn set_cursor(&self, cursor: i64) -> Result<(), StateError> {
        self.store
            .set(&self.key("last_recipient_key"), &cursor.to_string())
            .await
    }

    /// Mark the recipient source exhausted for this run. Sticky: once set,
    /// the dispatcher never re-enters the loop for this run identifier.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn mark_completed(&self) -> Result<(), StateError> {
        self.store.set(&self.key("completed"), "1").await
    }

    /// Whether this run already drained its recipient source
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn is_completed(&self) -> Result<bool, StateError> {
        Ok(self.store.get(&self.key("completed")).await?.is_some())
    }
}
