use std::time::Duration;

use tracing::{debug, info};

use crate::gateway::sessions_delete;
use crate::registry::{now_ms, SubagentRegistry};

pub(crate) const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

impl SubagentRegistry {
    /// Start the periodic archival sweeper if it is not already running.
    /// The task stops on shutdown or once the registry empties out.
    pub(crate) fn ensure_sweeper(&self) {
        if self
            .inner
            .sweeper_running
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            return;
        }
        let registry = self.clone();
        tokio::spawn(async move {
            debug!("archival sweeper started");
            loop {
                tokio::select! {
                    _ = registry.inner.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
                }
                registry.sweep_expired(now_ms()).await;
                if registry.inner.runs.read().await.is_empty() {
                    break;
                }
            }
            registry
                .inner
                .sweeper_running
                .store(false, std::sync::atomic::Ordering::SeqCst);
            debug!("archival sweeper stopped");
        });
    }

    /// Remove every record whose archive deadline is at or before `now_ms`
    /// and issue a best-effort `sessions.delete` for its child session.
    /// Returns the number of archived records. The periodic sweeper drives
    /// this with the wall clock; tests and tooling pass an explicit time.
    pub async fn sweep_expired(&self, now_ms: u64) -> usize {
        let expired: Vec<(String, String)> = {
            let mut runs = self.inner.runs.write().await;
            let due: Vec<String> = runs
                .iter()
                .filter(|(_, record)| {
                    record
                        .archive_at_ms
                        .map(|at| at <= now_ms)
                        .unwrap_or(false)
                })
                .map(|(run_id, _)| run_id.clone())
                .collect();
            due.into_iter()
                .filter_map(|run_id| {
                    runs.remove(&run_id)
                        .map(|record| (run_id, record.child_session_key))
                })
                .collect()
        };
        if expired.is_empty() {
            return 0;
        }
        self.persist_snapshot().await;
        for (run_id, child_session_key) in &expired {
            info!(run_id, "archived expired run");
            if let Err(err) =
                sessions_delete(self.inner.gateway.as_ref(), child_session_key).await
            {
                debug!(run_id, error = %err, "session delete failed during archival");
            }
        }
        expired.len()
    }
}
