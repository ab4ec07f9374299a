//! Run lifecycle orchestration.
//!
//! Owns one run from submission to its terminal state: optional scheduled
//! start, reporter timer, dispatch loop, final report, and the cancel
//! surface. The state machine per run is
//! `Scheduled -> Running -> {Completed, Cancelled, Failed}`, with
//! `Scheduled` present only when a deferred start was requested.

use crate::cancel::{CancelFlag, CANCEL_ALL};
use crate::dispatcher::{BatchDispatcher, DispatchTiming, RunOutcome};
use crate::job::{RunSpec, ValidationError};
use crate::ledger::ProgressLedger;
use crate::report::{ChatReportSink, ChatTarget, ProgressReporter, WebhookSink};
use crate::source::RecipientSource;
use crate::state::{StateError, StateStore};
use crate::transport::Transport;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

/// Opaque run identifier, unique per submission
pub type RunId = String;

/// Lifecycle state of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Waiting for a deferred start instant
    Scheduled,
    /// Dispatch loop executing
    Running,
    /// Recipient source exhausted
    Completed,
    /// Cancelled before start or observed mid-run
    Cancelled,
    /// Aborted on a source or state-store error; resumable
    Failed,
}

impl RunStatus {
    /// Whether the run reached a terminal state
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// Submission rejected before a run was created
#[derive(Error, Debug)]
pub enum SubmitError {
    /// The job failed validation
    #[error("invalid run spec: {0}")]
    Validation(#[from] ValidationError),
}

/// Echo of the effective start returned to the submitter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectiveStart {
    /// The run entered `Running` at submission
    Immediate,
    /// The run starts after this offset
    Delayed(Duration),
}

/// What the submitter gets back
#[derive(Debug, Clone)]
pub struct SubmitReceipt {
    /// Identifier for progress queries and cancellation
    pub run_id: RunId,
    /// When the run effectively starts
    pub start: EffectiveStart,
}

struct RunEntry {
    status: RunStatus,
    scheduled_abort: Option<CancellationToken>,
}

/// Top-level orchestration: wires ledger, reporter and dispatcher together
/// and exposes `submit` / `cancel` / `status`.
#[derive(Clone)]
pub struct RunController {
    store: Arc<dyn StateStore>,
    transport: Arc<dyn Transport>,
    chat_sink: Arc<dyn ChatReportSink>,
    source: Arc<dyn RecipientSource>,
    http: reqwest::Client,
    timing: DispatchTiming,
    runs: Arc<Mutex<HashMap<RunId, RunEntry>>>,
}

impl RunController {
    /// Wire a controller over its collaborators. The transport handle is
    /// passed in explicitly; nothing here is process-wide state.
    #[must_use]
    pub fn new(
        store: Arc<dyn StateStore>,
        transport: Arc<dyn Transport>,
        chat_sink: Arc<dyn ChatReportSink>,
        source: Arc<dyn RecipientSource>,
        timing: DispatchTiming,
    ) -> Self {
        Self {
            store,
            transport,
            chat_sink,
            source,
            http: reqwest::Client::new(),
            timing,
            runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Validate and launch a run, optionally deferred by `start_delay`.
    ///
    /// # Errors
    ///
    /// Returns a [`SubmitError`] if the job is rejected; no run state is
    /// created in that case.
    pub async fn submit(
        &self,
        spec: RunSpec,
        start_delay: Option<Duration>,
    ) -> Result<SubmitReceipt, SubmitError> {
        spec.validate()?;

        let run_id: RunId = Uuid::new_v4().to_string();
        let spec = Arc::new(spec);
        let deferred = start_delay.map(|delay| (delay, CancellationToken::new()));

        let (status, start) = match &deferred {
            Some((delay, _)) => (RunStatus::Scheduled, EffectiveStart::Delayed(*delay)),
            None => (RunStatus::Running, EffectiveStart::Immediate),
        };
        self.runs.lock().await.insert(
            run_id.clone(),
            RunEntry {
                status,
                scheduled_abort: deferred.as_ref().map(|(_, token)| token.clone()),
            },
        );

        let controller = self.clone();
        let id = run_id.clone();
        tokio::spawn(async move {
            controller.execute(id, spec, deferred).await;
        });

        info!(run_id = %run_id, ?start, "broadcast run submitted");
        Ok(SubmitReceipt { run_id, start })
    }

    /// Cancel a run, or every not-yet-started run when given
    /// [`CANCEL_ALL`]. Runs already executing are only affected when
    /// addressed by their own identifier.
    ///
    /// # Errors
    ///
    /// Returns an error if the durable flag cannot be written.
    pub async fn cancel(&self, run_id: &str) -> Result<(), StateError> {
        if run_id == CANCEL_ALL {
            let runs = self.runs.lock().await;
            for entry in runs.values() {
                if entry.status == RunStatus::Scheduled {
                    if let Some(abort) = &entry.scheduled_abort {
                        abort.cancel();
                    }
                }
            }
            drop(runs);
            info!("all scheduled runs cancelled");
            // flag written for parity with the intake contract; running
            // runs keep going under their own identifiers
            return CancelFlag::new(Arc::clone(&self.store)).cancel(CANCEL_ALL).await;
        }

        let scheduled_abort = {
            let runs = self.runs.lock().await;
            runs.get(run_id).and_then(|entry| {
                (entry.status == RunStatus::Scheduled)
                    .then(|| entry.scheduled_abort.clone())
                    .flatten()
            })
        };
        if let Some(abort) = scheduled_abort {
            info!(run_id = %run_id, "removing scheduled run");
            abort.cancel();
        } else {
            info!(run_id = %run_id, "setting cancellation flag");
        }
        // The flag is written for scheduled runs too: a cancel landing just
        // as the start delay elapses can miss the token, and the start
        // boundary re-checks the flag.
        CancelFlag::new(Arc::clone(&self.store)).cancel(run_id).await
    }

    /// Current lifecycle state, `None` for unknown identifiers
    pub async fn status(&self, run_id: &str) -> Option<RunStatus> {
        self.runs.lock().await.get(run_id).map(|entry| entry.status)
    }

    /// Block until the run reaches a terminal state
    pub async fn wait(&self, run_id: &str) {
        loop {
            match self.status(run_id).await {
                Some(status) if !status.is_terminal() => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                _ => return,
            }
        }
    }

    async fn set_status(&self, run_id: &str, status: RunStatus) {
        if let Some(entry) = self.runs.lock().await.get_mut(run_id) {
            entry.status = status;
        }
    }

    async fn execute(
        &self,
        run_id: RunId,
        spec: Arc<RunSpec>,
        deferred: Option<(Duration, CancellationToken)>,
    ) {
        if let Some((delay, abort)) = deferred {
            tokio::select! {
                () = abort.cancelled() => {
                    info!(run_id = %run_id, "scheduled run removed before start");
                    self.set_status(&run_id, RunStatus::Cancelled).await;
                    return;
                }
                () = tokio::time::sleep(delay) => {}
            }
            // A cancel that raced the elapsing delay may have missed the
            // token; the durable flag still records it.
            let flag = CancelFlag::new(Arc::clone(&self.store));
            if matches!(flag.is_cancelled(&run_id).await, Ok(true)) {
                info!(run_id = %run_id, "scheduled run cancelled at its start boundary");
                self.set_status(&run_id, RunStatus::Cancelled).await;
                return;
            }
            self.set_status(&run_id, RunStatus::Running).await;
        }

        let ledger = ProgressLedger::new(Arc::clone(&self.store), run_id.clone());
        let reporter = Arc::new(ProgressReporter::new(
            ledger.clone(),
            run_id.clone(),
            spec.estimated_user_count,
            spec.webhook_url
                .as_ref()
                .map(|url| WebhookSink::new(self.http.clone(), url.clone())),
            spec.report_chat_id.map(|chat_id| ChatTarget {
                chat_id,
                sink: Arc::clone(&self.chat_sink),
            }),
        ));

        let report_token = CancellationToken::new();
        let report_task = reporter.has_sinks().then(|| {
            reporter.spawn(
                Duration::from_secs(spec.report_interval_minutes * 60),
                report_token.clone(),
            )
        });

        let dispatcher = BatchDispatcher::new(
            run_id.clone(),
            spec,
            ledger,
            CancelFlag::new(Arc::clone(&self.store)),
            Arc::clone(&self.transport),
            Arc::clone(&self.source),
            self.timing,
        );
        let result = dispatcher.run().await;

        // Reporter teardown and the final report happen on every exit
        // path; the final snapshot reflects whatever progress was made.
        report_token.cancel();
        if let Some(task) = report_task {
            let _ = task.await;
        }
        if reporter.has_sinks() {
            reporter.tick().await;
        }

        let status = match result {
            Ok(RunOutcome::Completed) => {
                info!(run_id = %run_id, "broadcast run completed");
                RunStatus::Completed
            }
            Ok(RunOutcome::Cancelled) => {
                info!(run_id = %run_id, "broadcast run cancelled");
                RunStatus::Cancelled
            }
            Err(e) => {
                error!(run_id = %run_id, "broadcast run failed: {e}");
                RunStatus::Failed
            }
        };
        self.set_status(&run_id, status).await;
    }
}
