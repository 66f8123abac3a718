//! Persistence for the fleet: upstream records, cross-process OAuth
//! completion events, OAuth tokens, and the append-only failure log.

mod failure_log;
mod file;
mod record;

pub use failure_log::{FailureLog, FailureLogEntry};
pub use file::FileStore;
pub use record::{OAuthCompletionEvent, TokenRecord, UpstreamRecord};

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

/// Key/value persistence consumed by the supervisor.
///
/// Writes are expected to be atomic per call; the supervisor never assumes
/// cross-call transactions. `save_upstream` is an upsert keyed by name and
/// every record it writes carries the auto-disable fields, including
/// incidental history updates.
#[async_trait]
pub trait Store: Send + Sync {
    async fn save_upstream(&self, record: &UpstreamRecord) -> Result<()>;
    async fn get_upstream(&self, name: &str) -> Result<Option<UpstreamRecord>>;
    async fn load_upstreams(&self) -> Result<Vec<UpstreamRecord>>;
    async fn delete_upstream(&self, name: &str) -> Result<()>;

    async fn record_oauth_completion(&self, event: &OAuthCompletionEvent) -> Result<()>;
    async fn unprocessed_oauth_completions(&self) -> Result<Vec<OAuthCompletionEvent>>;
    async fn mark_oauth_completion_processed(
        &self,
        server_name: &str,
        completed_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<()>;
    /// Drop processed events older than `max_age`; returns how many.
    async fn cleanup_old_oauth_completions(&self, max_age: Duration) -> Result<usize>;

    async fn save_token(&self, token: &TokenRecord) -> Result<()>;
    /// Lookup by server name; when `server_url` is given it must match the
    /// stored record (tokens are bound to the endpoint they were minted for).
    async fn get_token(&self, server_name: &str, server_url: Option<&str>)
    -> Result<Option<TokenRecord>>;
    async fn delete_token(&self, server_name: &str) -> Result<()>;
}
