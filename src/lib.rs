//! tg-fanout - resumable Telegram broadcast engine
//!
//! Dispatches a large, paginated set of messages through the rate-limited
//! Telegram Bot API. Progress is checkpointed to a durable key/value store
//! so a run survives process restarts, cancellation is cooperative, and a
//! periodic reporter pushes human-readable progress to a chat message
//! (edited in place) and/or a webhook.

/// Durable cancellation flag, polled by the dispatcher
pub mod cancel;
/// Configuration management and engine constants
pub mod config;
/// Run lifecycle orchestration and the cancel surface
pub mod controller;
/// The checkpointed batch send loop
pub mod dispatcher;
/// Broadcast job description received from the submitter
pub mod job;
/// Durable progress counters and resume cursor
pub mod ledger;
/// Progress snapshots and report sinks
pub mod report;
/// Recipient paging
pub mod source;
/// Durable key/value state backing the ledger and the flag
pub mod state;
/// Message delivery via the Telegram Bot API
pub mod transport;
