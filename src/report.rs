//! Progress snapshots and report delivery.
//!
//! The reporter periodically derives a [`ReportSnapshot`] from the ledger
//! and pushes its rendering to the configured sinks. Delivery failures are
//! logged and never stop the timer or the run. Snapshot-then-deliver plus
//! an internal mutex keeps report deliveries serialized, so a later tick
//! never races an in-flight chat edit.

use crate::ledger::ProgressLedger;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// A sink was unreachable; logged, never fatal
#[derive(Error, Debug)]
pub enum ReportError {
    /// Webhook POST failed
    #[error("webhook delivery failed: {0}")]
    Webhook(#[from] reqwest::Error),
    /// Chat send/edit failed
    #[error("chat delivery failed: {0}")]
    Chat(String),
}

/// Chat sink: first report sends a message, later reports edit it in place
#[async_trait::async_trait]
pub trait ChatReportSink: Send + Sync {
    /// Send the first report message, returning its message identifier
    async fn send_report(&self, chat_id: i64, text: &str) -> Result<i32, ReportError>;
    /// Replace an earlier report in place
    async fn edit_report(&self, chat_id: i64, message_id: i32, text: &str)
        -> Result<(), ReportError>;
}

/// Point-in-time view of one run's progress. Derived, never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportSnapshot {
    /// Run identifier
    pub run_id: String,
    /// Successful sends so far
    pub messages_sent: u64,
    /// Failed sends so far
    pub errors: u64,
    /// Seconds since the run entered the dispatch loop
    pub elapsed_secs: f64,
    /// `sent / estimate * 100`; absent without a positive estimate
    pub progress_percent: Option<f64>,
    /// `elapsed / sent * remaining`; absent without sends or an estimate
    pub eta_secs: Option<f64>,
}

impl ReportSnapshot {
    /// Derive a snapshot from current counters
    #[must_use]
    pub fn compute(
        run_id: &str,
        sent: u64,
        errors: u64,
        elapsed: Duration,
        estimate: Option<u64>,
    ) -> Self {
        let elapsed_secs = elapsed.as_secs_f64();
        let estimate = estimate.filter(|&e| e > 0);
        let progress_percent = estimate.map(|e| sent as f64 / e as f64 * 100.0);
        let eta_secs = estimate.and_then(|e| {
            (sent > 0).then(|| elapsed_secs / sent as f64 * e.saturating_sub(sent) as f64)
        });
        Self {
            run_id: run_id.to_string(),
            messages_sent: sent,
            errors,
            elapsed_secs,
            progress_percent,
            eta_secs,
        }
    }

    /// Human-readable report text, one line per metric
    #[must_use]
    pub fn render(&self) -> String {
        let mut lines = vec![
            format!("Broadcast run {}", self.run_id),
            format!("- Messages sent: {}", self.messages_sent),
            format!("- Errors: {}", self.errors),
            format!("- Elapsed: {:.2}s", self.elapsed_secs),
        ];
        if let Some(progress) = self.progress_percent {
            lines.push(format!("- Progress: {progress:.2}%"));
        }
        if let Some(eta) = self.eta_secs {
            lines.push(format!("- Estimated time remaining: {eta:.2}s"));
        }
        lines.join("\n")
    }
}

/// Webhook sink: one `POST {"text": ...}` per tick
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    /// Point the sink at a webhook URL
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    async fn deliver(&self, text: &str) -> Result<(), ReportError> {
        self.client
            .post(&self.url)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Chat sink target: where reports go and what delivers them
pub struct ChatTarget {
    /// Chat receiving the progress message
    pub chat_id: i64,
    /// The actual sender/editor
    pub sink: Arc<dyn ChatReportSink>,
}

/// Periodic progress reporting for one run
pub struct ProgressReporter {
    ledger: ProgressLedger,
    run_id: String,
    estimate: Option<u64>,
    started_at: Instant,
    webhook: Option<WebhookSink>,
    chat: Option<ChatTarget>,
    // Remembered chat message id; the lock also serializes deliveries.
    report_message: Mutex<Option<i32>>,
}

impl ProgressReporter {
    /// Build a reporter for one run
    #[must_use]
    pub fn new(
        ledger: ProgressLedger,
        run_id: impl Into<String>,
        estimate: Option<u64>,
        webhook: Option<WebhookSink>,
        chat: Option<ChatTarget>,
    ) -> Self {
        Self {
            ledger,
            run_id: run_id.into(),
            estimate,
            started_at: Instant::now(),
            webhook,
            chat,
            report_message: Mutex::new(None),
        }
    }

    /// Whether any sink is configured
    #[must_use]
    pub fn has_sinks(&self) -> bool {
        self.webhook.is_some() || self.chat.is_some()
    }

    /// Compute one snapshot and deliver it to every configured sink.
    /// Failures are logged per sink and never propagate.
    pub async fn tick(&self) {
        let (sent, errors) = match self.ledger.counts().await {
            Ok(counts) => counts,
            Err(e) => {
                warn!(run_id = %self.run_id, "skipping report, ledger unavailable: {e}");
                return;
            }
        };
        let snapshot = ReportSnapshot::compute(
            &self.run_id,
            sent,
            errors,
            self.started_at.elapsed(),
            self.estimate,
        );
        let text = snapshot.render();

        // Lock before delivering; a later tick waits for this one.
        let mut message_id = self.report_message.lock().await;

        if let Some(webhook) = &self.webhook {
            if let Err(e) = webhook.deliver(&text).await {
                warn!(run_id = %self.run_id, "webhook report failed: {e}");
            }
        }

        if let Some(chat) = &self.chat {
            match *message_id {
                Some(id) => {
                    if let Err(e) = chat.sink.edit_report(chat.chat_id, id, &text).await {
                        warn!(run_id = %self.run_id, "chat report edit failed: {e}");
                    }
                }
                None => match chat.sink.send_report(chat.chat_id, &text).await {
                    Ok(id) => *message_id = Some(id),
                    Err(e) => {
                        warn!(run_id = %self.run_id, "chat report send failed: {e}");
                    }
                },
            }
        }
    }

    /// Start the periodic tick task. The first report lands one interval
    /// after start; the task stops when `token` is cancelled.
    pub fn spawn(self: &Arc<Self>, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        let reporter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // tokio's first tick fires immediately; swallow it to match
            // "first report after one interval" semantics
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => reporter.tick().await,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStateStore;

    #[test]
    fn snapshot_math() {
        let snap = ReportSnapshot::compute("r", 50, 2, Duration::from_secs(100), Some(200));
        assert_eq!(snap.progress_percent, Some(25.0));
        assert_eq!(snap.eta_secs, Some(300.0));
    }

    #[test]
    fn snapshot_omits_derived_fields_without_estimate() {
        let snap = ReportSnapshot::compute("r", 50, 0, Duration::from_secs(100), None);
        assert_eq!(snap.progress_percent, None);
        assert_eq!(snap.eta_secs, None);
    }

    #[test]
    fn snapshot_omits_eta_before_first_send() {
        let snap = ReportSnapshot::compute("r", 0, 0, Duration::from_secs(10), Some(200));
        assert_eq!(snap.progress_percent, Some(0.0));
        assert_eq!(snap.eta_secs, None);

        // a zero estimate must not divide by zero
        let snap = ReportSnapshot::compute("r", 5, 0, Duration::from_secs(10), Some(0));
        assert_eq!(snap.progress_percent, None);
        assert_eq!(snap.eta_secs, None);
    }

    #[test]
    fn render_includes_optional_lines_only_when_present() {
        let with = ReportSnapshot::compute("run-9", 50, 1, Duration::from_secs(100), Some(200));
        let text = with.render();
        assert!(text.contains("Broadcast run run-9"));
        assert!(text.contains("- Messages sent: 50"));
        assert!(text.contains("- Progress: 25.00%"));
        assert!(text.contains("- Estimated time remaining: 300.00s"));

        let without = ReportSnapshot::compute("run-9", 0, 0, Duration::from_secs(1), None);
        let text = without.render();
        assert!(!text.contains("Progress"));
        assert!(!text.contains("remaining"));
    }

    struct RecordingSink {
        sends: std::sync::Mutex<Vec<String>>,
        edits: std::sync::Mutex<Vec<(i32, String)>>,
    }

    #[async_trait::async_trait]
    impl ChatReportSink for RecordingSink {
        async fn send_report(&self, _chat_id: i64, text: &str) -> Result<i32, ReportError> {
            self.sends
                .lock()
                .expect("sends lock")
                .push(text.to_string());
            Ok(777)
        }

        async fn edit_report(
            &self,
            _chat_id: i64,
            message_id: i32,
            text: &str,
        ) -> Result<(), ReportError> {
            self.edits
                .lock()
                .expect("edits lock")
                .push((message_id, text.to_string()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn chat_reports_edit_in_place_after_first_send() {
        let store = Arc::new(MemoryStateStore::new());
        let ledger = ProgressLedger::new(store, "run-1");
        let sink = Arc::new(RecordingSink {
            sends: std::sync::Mutex::new(Vec::new()),
            edits: std::sync::Mutex::new(Vec::new()),
        });
        let reporter = ProgressReporter::new(
            ledger.clone(),
            "run-1",
            None,
            None,
            Some(ChatTarget {
                chat_id: 42,
                sink: sink.clone(),
            }),
        );

        reporter.tick().await;
        ledger.add_sent(10).await.expect("ledger write");
        reporter.tick().await;
        reporter.tick().await;

        assert_eq!(sink.sends.lock().expect("sends lock").len(), 1);
        let edits = sink.edits.lock().expect("edits lock");
        assert_eq!(edits.len(), 2);
        // every edit targets the message created by the first send
        assert!(edits.iter().all(|(id, _)| *id == 777));
        assert!(edits[0].1.contains("- Messages sent: 10"));
    }
}
