//! Recipient paging.
//!
//! A source hands out pages of recipients in stable, strictly increasing
//! key order. An empty page signals exhaustion, never an error. The HTTP
//! implementation speaks a keyset-pagination RPC: `{after, limit}` in, an
//! ordered recipient array out.

use crate::job::Recipient;
use async_trait::async_trait;
use serde_json::json;

/// Fetching the next page failed; the run loop aborts but remains
/// resumable from the last persisted cursor.
#[derive(thiserror::Error, Debug)]
pub enum SourceError {
    /// HTTP-level failure talking to the recipient RPC
    #[error("recipient source request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The source answered with something that is not a recipient page
    #[error("recipient source returned malformed data: {0}")]
    Malformed(String),
    /// No source endpoint configured and the job has no fixed list
    #[error("recipient source is not configured")]
    Unconfigured,
}

/// Pages of recipients ordered by a stable key
#[async_trait]
pub trait RecipientSource: Send + Sync {
    /// Fetch up to `limit` recipients with `key > after_key`.
    /// An empty vec means the source is exhausted.
    async fn fetch_page(&self, after_key: i64, limit: usize)
        -> Result<Vec<Recipient>, SourceError>;
}

/// Keyset-pagination RPC over HTTP
pub struct HttpRecipientSource {
    client: reqwest::Client,
    url: String,
}

impl HttpRecipientSource {
    /// Point the source at an RPC endpoint
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl RecipientSource for HttpRecipientSource {
    async fn fetch_page(
        &self,
        after_key: i64,
        limit: usize,
    ) -> Result<Vec<Recipient>, SourceError> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "after": after_key, "limit": limit }))
            .send()
            .await?
            .error_for_status()?;

        let page: Vec<Recipient> = response.json().await?;
        validate_page(after_key, &page)?;
        Ok(page)
    }
}

/// The resume cursor is only sound if the source honors its ordering
/// contract: keys strictly increasing, all strictly past the requested
/// cursor. A page violating either is rejected outright.
fn validate_page(after_key: i64, page: &[Recipient]) -> Result<(), SourceError> {
    if page.first().is_some_and(|r| r.key <= after_key) {
        return Err(SourceError::Malformed(
            "page rewinds to keys at or before the requested cursor".to_string(),
        ));
    }
    if page.windows(2).any(|pair| pair[1].key <= pair[0].key) {
        return Err(SourceError::Malformed(
            "page is not strictly increasing in recipient key".to_string(),
        ));
    }
    Ok(())
}

/// Placeholder source used when no RPC endpoint is configured. Jobs with a
/// fixed test-recipient list never touch it; anything else fails fast.
pub struct UnconfiguredSource;

#[async_trait]
impl RecipientSource for UnconfiguredSource {
    async fn fetch_page(
        &self,
        _after_key: i64,
        _limit: usize,
    ) -> Result<Vec<Recipient>, SourceError> {
        Err(SourceError::Unconfigured)
    }
}
