//! The checkpointed batch send loop for one run.
//!
//! Pages recipients, sends each page in fixed-size concurrent sub-batches,
//! persists progress after every sub-batch, paces between sub-batches, and
//! polls the cancellation flag at page boundaries. One bad recipient never
//! blocks the others; source and state-store failures abort the loop with
//! all progress preserved, so the run stays resumable.

use crate::cancel::CancelFlag;
use crate::config::{PACE_MS, PAGE_SIZE, SEND_TIMEOUT_SECS, SUB_BATCH_SIZE};
use crate::job::{Recipient, RunSpec};
use crate::ledger::ProgressLedger;
use crate::source::{RecipientSource, SourceError};
use crate::state::StateError;
use crate::transport::{SendError, SendOptions, Transport};
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// How a dispatch loop ended when it did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The recipient source was exhausted (or the fixed test list was
    /// processed once)
    Completed,
    /// The cancellation flag was observed at a page boundary
    Cancelled,
}

/// The loop aborted; counters and cursor reflect all resolved sends
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Fetching the next page failed
    #[error("recipient source failed: {0}")]
    Source(#[from] SourceError),
    /// Progress can no longer be tracked safely
    #[error("state store failed: {0}")]
    State(#[from] StateError),
}

/// Timing knobs for the loop.
///
/// The default sub-batch pace is a deliberate backpressure mechanism that
/// keeps the run under the Transport's external rate limit; do not shorten
/// it without an equivalent limiter.
#[derive(Debug, Clone, Copy)]
pub struct DispatchTiming {
    /// Pause between sub-batches
    pub pace: Duration,
    /// Per-send deadline; expiry counts as a send failure
    pub send_timeout: Duration,
}

impl Default for DispatchTiming {
    fn default() -> Self {
        Self {
            pace: Duration::from_millis(PACE_MS),
            send_timeout: Duration::from_secs(SEND_TIMEOUT_SECS),
        }
    }
}

/// Executes the send loop for one run
pub struct BatchDispatcher {
    run_id: String,
    spec: Arc<RunSpec>,
    ledger: ProgressLedger,
    cancel: CancelFlag,
    transport: Arc<dyn Transport>,
    source: Arc<dyn RecipientSource>,
    timing: DispatchTiming,
}

impl BatchDispatcher {
    /// Wire a dispatcher for one run
    #[must_use]
    pub fn new(
        run_id: impl Into<String>,
        spec: Arc<RunSpec>,
        ledger: ProgressLedger,
        cancel: CancelFlag,
        transport: Arc<dyn Transport>,
        source: Arc<dyn RecipientSource>,
        timing: DispatchTiming,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            spec,
            ledger,
            cancel,
            transport,
            source,
            timing,
        }
    }

    /// Run until completion, cancellation, or an unrecoverable error.
    ///
    /// Resumes from the ledger's cursor; a run whose `completed` flag is
    /// already set returns immediately without re-entering the loop.
    ///
    /// # Errors
    ///
    /// Returns a [`DispatchError`] if paging or state persistence fails;
    /// the run remains resumable from the last persisted cursor.
    pub async fn run(&self) -> Result<RunOutcome, DispatchError> {
        if self.ledger.is_completed().await? {
            info!(run_id = %self.run_id, "run already completed, nothing to do");
            return Ok(RunOutcome::Completed);
        }

        let opts = SendOptions {
            buttons: self.spec.buttons.clone(),
        };
        let mut cursor = self.ledger.cursor().await?;
        let (sent, errors) = self.ledger.counts().await?;
        info!(
            run_id = %self.run_id,
            sent, errors, cursor,
            "entering dispatch loop"
        );

        loop {
            // Cancellation is polled at page boundaries only; an in-flight
            // sub-batch always finishes first.
            if self.cancel.is_cancelled(&self.run_id).await? {
                info!(run_id = %self.run_id, "cancellation flag observed, stopping");
                return Ok(RunOutcome::Cancelled);
            }

            // A fixed test list is processed exactly once and never marks
            // the durable completed flag.
            let (page, single_pass) = match &self.spec.test_recipients {
                Some(list) => (list.clone(), true),
                None => (self.source.fetch_page(cursor, PAGE_SIZE).await?, false),
            };

            if page.is_empty() {
                if !single_pass {
                    self.ledger.mark_completed().await?;
                }
                info!(run_id = %self.run_id, "all recipients processed");
                return Ok(RunOutcome::Completed);
            }

            for batch in page.chunks(SUB_BATCH_SIZE) {
                self.send_sub_batch(batch, &opts).await?;
                if let Some(last) = batch.last() {
                    cursor = last.key;
                    // Strictly after the sub-batch resolves: a crash before
                    // this point re-attempts the whole sub-batch on resume.
                    self.ledger.set_cursor(cursor).await?;
                }
                tokio::time::sleep(self.timing.pace).await;
            }

            if single_pass {
                info!(run_id = %self.run_id, "test recipient pass finished");
                return Ok(RunOutcome::Completed);
            }
        }
    }

    /// Send one sub-batch concurrently, then apply its counter deltas.
    async fn send_sub_batch(
        &self,
        batch: &[Recipient],
        opts: &SendOptions,
    ) -> Result<(), DispatchError> {
        let results = join_all(batch.iter().map(|r| self.send_one(r, opts))).await;

        let mut sent = 0u64;
        let mut errors = 0u64;
        for (recipient, result) in batch.iter().zip(results) {
            match result {
                Ok(()) => sent += 1,
                Err(e) => {
                    errors += 1;
                    warn!(
                        run_id = %self.run_id,
                        chat_id = recipient.chat_id,
                        "send failed: {e}"
                    );
                }
            }
        }
        if sent > 0 {
            self.ledger.add_sent(sent).await?;
        }
        if errors > 0 {
            self.ledger.add_errors(errors).await?;
        }
        Ok(())
    }

    /// One recipient's send with the per-send deadline applied. A stalled
    /// send must not hold up the rest of the sub-batch forever.
    async fn send_one(&self, recipient: &Recipient, opts: &SendOptions) -> Result<(), SendError> {
        let delivery = async {
            match &self.spec.image_url {
                Some(url) => {
                    self.transport
                        .send_photo(recipient.chat_id, url, &self.spec.message_text, opts)
                        .await
                }
                None => {
                    self.transport
                        .send_text(recipient.chat_id, &self.spec.message_text, opts)
                        .await
                }
            }
        };
        match tokio::time::timeout(self.timing.send_timeout, delivery).await {
            Ok(result) => result,
            Err(_) => Err(SendError::Timeout(self.timing.send_timeout)),
        }
    }
}
