use std::time::Duration;

use async_trait::async_trait;

use outrider_types::RunSummary;

pub const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(30);

/// Delivery seam for the run summary back to the requester session.
///
/// Implementations report success as a plain bool: a `false` return (or a
/// timeout) re-opens cleanup so a later signal can retry the announce.
#[async_trait]
pub trait AnnounceSink: Send + Sync {
    async fn deliver(&self, summary: RunSummary) -> bool;
}
