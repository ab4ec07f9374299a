//! Configuration and settings management
//!
//! Loads settings from environment variables and defines the engine's
//! throughput constants.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// Application settings loaded from environment variables
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Telegram Bot API token
    pub telegram_token: String,

    /// RPC endpoint returning pages of recipients ordered by key.
    /// Optional: jobs carrying a fixed test-recipient list never page.
    pub recipient_source_url: Option<String>,

    /// Path of the JSON file backing the durable run state
    pub state_file: Option<String>,
}

impl Settings {
    /// Create new settings by loading from environment and files
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails.
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(Environment::with_prefix("APP").separator("__"))
            // Environment::default() auto-converts UPPER_SNAKE_CASE to snake_case;
            // ignore_empty treats empty env vars as unset
            .add_source(Environment::default().ignore_empty(true))
            .build()?;

        s.try_deserialize()
    }

    /// Path of the durable state file, falling back to [`DEFAULT_STATE_FILE`]
    #[must_use]
    pub fn state_file(&self) -> &str {
        self.state_file.as_deref().unwrap_or(DEFAULT_STATE_FILE)
    }
}

/// Default path for the file-backed state store
pub const DEFAULT_STATE_FILE: &str = "broadcast_state.json";

// Broadcast loop configuration
/// Recipients requested per page from the recipient source
pub const PAGE_SIZE: usize = 500;
/// Recipients sent concurrently per sub-batch
pub const SUB_BATCH_SIZE: usize = 30;
/// Pause between sub-batches; keeps the run under Telegram's global send-rate limit
pub const PACE_MS: u64 = 1_000;
/// Upper bound on a single recipient send; expiry counts as a send failure
pub const SEND_TIMEOUT_SECS: u64 = 30;

// Telegram API retry configuration
/// Maximum retries for a Telegram API call
pub const TELEGRAM_API_MAX_RETRIES: usize = 3;
/// Initial backoff before the first retry
pub const TELEGRAM_API_INITIAL_BACKOFF_MS: u64 = 500;
/// Backoff ceiling
pub const TELEGRAM_API_MAX_BACKOFF_MS: u64 = 5_000;
