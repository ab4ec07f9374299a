//! Broadcast job description received from the submitter.
//!
//! The JSON shape keeps the camelCase intake field names, so existing
//! job payloads submit unchanged.

use serde::Deserialize;
use thiserror::Error;

/// Immutable description of one broadcast run
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSpec {
    /// Message body, Markdown
    pub message_text: String,
    /// Optional image URL; when present the body becomes the caption
    #[serde(default)]
    pub image_url: Option<String>,
    /// Inline buttons rendered as a single keyboard row
    #[serde(default)]
    pub buttons: Vec<InlineButton>,
    /// Total recipient estimate, used for progress percentage and ETA
    #[serde(default)]
    pub estimated_user_count: Option<u64>,
    /// Chat receiving the edited-in-place progress message
    #[serde(default)]
    pub report_chat_id: Option<i64>,
    /// Webhook receiving a `POST {"text": ...}` per report tick
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Minutes between progress reports
    #[serde(default = "default_report_interval")]
    pub report_interval_minutes: u64,
    /// Fixed recipient list: bypasses the recipient source and terminates
    /// after one pass. An empty list means "no recipients for this run".
    #[serde(default)]
    pub test_recipients: Option<Vec<Recipient>>,
}

const fn default_report_interval() -> u64 {
    1
}

/// Upper bound on the report interval (one week). Also keeps the later
/// minutes-to-seconds conversion inside `u64`.
pub const MAX_REPORT_INTERVAL_MINUTES: u64 = 7 * 24 * 60;

impl RunSpec {
    /// Reject jobs the engine cannot run before a run identifier exists
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] describing the first rejected field.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.message_text.trim().is_empty() {
            return Err(ValidationError::EmptyMessage);
        }
        if self.report_interval_minutes == 0 {
            return Err(ValidationError::ZeroReportInterval);
        }
        if self.report_interval_minutes > MAX_REPORT_INTERVAL_MINUTES {
            return Err(ValidationError::ExcessiveReportInterval);
        }
        for button in &self.buttons {
            reqwest::Url::parse(&button.url)
                .map_err(|e| ValidationError::BadButtonUrl(format!("{}: {e}", button.url)))?;
        }
        Ok(())
    }
}

/// One inline keyboard button
#[derive(Debug, Clone, Deserialize)]
pub struct InlineButton {
    /// Button label
    pub text: String,
    /// Target URL, validated at submission
    pub url: String,
}

/// One broadcast target
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    /// Stable ordering key; the resume cursor is the last processed key
    pub key: i64,
    /// Telegram chat the message is delivered to
    pub chat_id: i64,
}

/// A job rejected at submission, before any run state exists
#[derive(Error, Debug)]
pub enum ValidationError {
    /// `messageText` missing or blank
    #[error("messageText must not be empty")]
    EmptyMessage,
    /// Interval of zero would spin the reporter
    #[error("reportIntervalMinutes must be at least 1")]
    ZeroReportInterval,
    /// Interval past the bound is an intake mistake
    #[error("reportIntervalMinutes must be at most {MAX_REPORT_INTERVAL_MINUTES}")]
    ExcessiveReportInterval,
    /// A button URL failed to parse
    #[error("invalid button url: {0}")]
    BadButtonUrl(String),
}
