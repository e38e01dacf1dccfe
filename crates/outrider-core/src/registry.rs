//! In-memory run registry with synchronous single-writer semantics per
//! record. Every visible state transition persists the whole snapshot; all
//! suspending work (gateway calls, announce delivery, retry sleeps) happens
//! outside the map lock.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Map;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use outrider_types::{
    CleanupPolicy, DeliveryOrigin, OrchestrationOverrides, RunOutcome, RunRecord, RunSummary,
};

use crate::announce::{AnnounceSink, ANNOUNCE_TIMEOUT};
use crate::config::SubagentSettings;
use crate::event_bus::AgentEventBus;
use crate::gateway::Gateway;
use crate::store::RunStore;
use crate::verify::VerificationHook;

pub(crate) fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

#[derive(Debug, Clone, Default)]
pub struct RegisterRun {
    pub run_id: String,
    pub child_session_key: String,
    pub requester_session_key: String,
    pub requester_origin: DeliveryOrigin,
    pub requester_display_key: String,
    pub task: String,
    pub label: Option<String>,
    pub cleanup: CleanupPolicy,
    pub orchestration: Option<OrchestrationOverrides>,
}

pub(crate) struct RegistryInner {
    pub(crate) runs: RwLock<HashMap<String, RunRecord>>,
    pub(crate) store: RunStore,
    pub(crate) gateway: Arc<dyn Gateway>,
    pub(crate) announcer: Arc<dyn AnnounceSink>,
    pub(crate) bus: AgentEventBus,
    pub(crate) settings: SubagentSettings,
    pub(crate) hooks: RwLock<HashMap<String, Arc<dyn VerificationHook>>>,
    pub(crate) pending_retries: Mutex<HashSet<String>>,
    pub(crate) pending_verifications: Mutex<HashSet<String>>,
    pub(crate) resumed_runs: Mutex<HashSet<String>>,
    pub(crate) restored: AtomicBool,
    pub(crate) sweeper_running: AtomicBool,
    pub(crate) shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct SubagentRegistry {
    pub(crate) inner: Arc<RegistryInner>,
}

impl SubagentRegistry {
    /// Build the registry and attach the lifecycle listener to `bus`. The
    /// caller keeps a bus handle for publishing; two registries must never
    /// share one state directory.
    pub fn new(
        state_dir: impl AsRef<Path>,
        settings: SubagentSettings,
        gateway: Arc<dyn Gateway>,
        announcer: Arc<dyn AnnounceSink>,
        bus: AgentEventBus,
    ) -> Self {
        let registry = Self {
            inner: Arc::new(RegistryInner {
                runs: RwLock::new(HashMap::new()),
                store: RunStore::new(state_dir),
                gateway,
                announcer,
                bus,
                settings,
                hooks: RwLock::new(HashMap::new()),
                pending_retries: Mutex::new(HashSet::new()),
                pending_verifications: Mutex::new(HashSet::new()),
                resumed_runs: Mutex::new(HashSet::new()),
                restored: AtomicBool::new(false),
                sweeper_running: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        };
        crate::lifecycle::spawn_bus_listener(&registry);
        registry
    }

    /// Rehydrate persisted records, at most once per process. Records that
    /// were registered before this call win over their persisted twin.
    pub async fn init(&self) {
        if self.inner.restored.swap(true, Ordering::SeqCst) {
            return;
        }
        let loaded = self.inner.store.load().await;
        if loaded.is_empty() {
            return;
        }
        info!(count = loaded.len(), "restoring persisted subagent runs");
        let restored_ids: Vec<String> = loaded.keys().cloned().collect();
        {
            let mut runs = self.inner.runs.write().await;
            for (run_id, record) in loaded {
                runs.entry(run_id).or_insert(record);
            }
        }

        let mut needs_sweeper = false;
        for run_id in restored_ids {
            {
                let mut resumed = self.inner.resumed_runs.lock().await;
                if !resumed.insert(run_id.clone()) {
                    continue;
                }
            }
            let Some(record) = self.get(&run_id).await else {
                continue;
            };
            if record.archive_at_ms.is_some() {
                needs_sweeper = true;
            }
            if record.is_cleanup_complete() {
                continue;
            }
            if record.ended_at.is_some() {
                self.finish_with_cleanup(&run_id).await;
            } else {
                crate::lifecycle::arm_wait_prober(self, run_id);
            }
        }
        if needs_sweeper {
            self.ensure_sweeper();
        }
    }

    pub async fn register(&self, params: RegisterRun) {
        let config = self
            .inner
            .settings
            .resolve_orchestration(params.orchestration.as_ref());
        let now = now_ms();
        let record = RunRecord {
            run_id: params.run_id.clone(),
            child_session_key: params.child_session_key,
            requester_session_key: params.requester_session_key,
            requester_origin: params.requester_origin,
            requester_display_key: params.requester_display_key,
            task: params.task,
            label: params.label,
            cleanup: params.cleanup,
            created_at: now,
            started_at: None,
            ended_at: None,
            outcome: None,
            archive_at_ms: self
                .inner
                .settings
                .archive_after_ms()
                .map(|after| now + after),
            cleanup_handled: false,
            cleanup_completed_at: None,
            retry_count: 0,
            max_retries: config.max_retries,
            next_retry_at: None,
            is_retry: false,
            verification_attempted: false,
            verification_result: None,
            orchestration_config: config,
            extra: Map::new(),
        };
        let has_archive = record.archive_at_ms.is_some();
        self.inner
            .runs
            .write()
            .await
            .insert(params.run_id.clone(), record);
        self.persist_snapshot().await;
        debug!(run_id = %params.run_id, "registered subagent run");
        crate::lifecycle::arm_wait_prober(self, params.run_id);
        if has_archive {
            self.ensure_sweeper();
        }
    }

    /// Unconditional removal, for tests and admin tooling.
    pub async fn release(&self, run_id: &str) -> bool {
        let removed = self.inner.runs.write().await.remove(run_id).is_some();
        if removed {
            self.persist_snapshot().await;
        }
        removed
    }

    pub async fn get(&self, run_id: &str) -> Option<RunRecord> {
        self.inner.runs.read().await.get(run_id).cloned()
    }

    pub async fn list_for_requester(&self, requester_session_key: &str) -> Vec<RunRecord> {
        self.inner
            .runs
            .read()
            .await
            .values()
            .filter(|record| record.requester_session_key == requester_session_key)
            .cloned()
            .collect()
    }

    pub async fn register_verification_hook(
        &self,
        name: impl Into<String>,
        hook: Arc<dyn VerificationHook>,
    ) {
        self.inner.hooks.write().await.insert(name.into(), hook);
    }

    pub async fn unregister_verification_hook(&self, name: &str) -> bool {
        self.inner.hooks.write().await.remove(name).is_some()
    }

    /// Tear down all process-wide state. Tests only; the persisted snapshot
    /// is left alone because each test run points at its own state dir.
    pub async fn reset(&self) {
        self.inner.runs.write().await.clear();
        self.inner.hooks.write().await.clear();
        self.inner.pending_retries.lock().await.clear();
        self.inner.pending_verifications.lock().await.clear();
        self.inner.resumed_runs.lock().await.clear();
        self.inner.restored.store(false, Ordering::SeqCst);
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    pub(crate) async fn persist_snapshot(&self) {
        let snapshot = self.inner.runs.read().await.clone();
        self.inner.store.persist(&snapshot).await;
    }

    pub(crate) async fn apply_start(&self, run_id: &str, started_at: u64) {
        let updated = {
            let mut runs = self.inner.runs.write().await;
            match runs.get_mut(run_id) {
                Some(record) if !record.is_cleanup_complete() => {
                    record.started_at = Some(started_at);
                    true
                }
                _ => false,
            }
        };
        if updated {
            self.persist_snapshot().await;
        }
    }

    /// Terminal transition shared by the lifecycle listener and the wait
    /// prober. Timestamps are last-writer-wins; a record whose cleanup has
    /// completed is never resurrected.
    pub(crate) async fn apply_terminal(
        &self,
        run_id: &str,
        outcome: RunOutcome,
        started_at: Option<u64>,
        ended_at: Option<u64>,
    ) {
        {
            let mut runs = self.inner.runs.write().await;
            let Some(record) = runs.get_mut(run_id) else {
                return;
            };
            if record.is_cleanup_complete() {
                return;
            }
            if let Some(started) = started_at {
                record.started_at = Some(started);
            }
            record.ended_at = Some(ended_at.unwrap_or_else(now_ms));
            record.outcome = Some(outcome);
        }
        self.persist_snapshot().await;
        self.post_completion(run_id).await;
    }

    /// Post-completion policy: retry, verify, or clean up, in that order.
    pub(crate) fn post_completion<'a>(
        &'a self,
        run_id: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let Some(record) = self.get(run_id).await else {
                return;
            };
            if record.is_cleanup_complete() {
                return;
            }
            let Some(outcome) = record.outcome.clone() else {
                return;
            };

            if !outcome.is_ok() && should_retry(&record) {
                if self.claim_retry(run_id).await {
                    let registry = self.clone();
                    let run_id = run_id.to_string();
                    tokio::spawn(async move {
                        crate::retry::run_retry(registry, run_id).await;
                    });
                }
                return;
            }

            if outcome.is_ok() && record.orchestration_config.verify_completion {
                if self.claim_verification(run_id).await {
                    let registry = self.clone();
                    let run_id = run_id.to_string();
                    tokio::spawn(async move {
                        crate::verify::run_verification(registry, run_id).await;
                    });
                }
                return;
            }

            self.finish_with_cleanup(run_id).await;
        })
    }

    /// Atomic cleanup guard. Returns true exactly when this caller won the
    /// right to run the announce flow; everyone else must back off.
    pub async fn begin_cleanup(&self, run_id: &str) -> bool {
        let begun = {
            let mut runs = self.inner.runs.write().await;
            match runs.get_mut(run_id) {
                Some(record) if !record.is_cleanup_complete() && !record.cleanup_handled => {
                    record.cleanup_handled = true;
                    true
                }
                _ => false,
            }
        };
        if begun {
            self.persist_snapshot().await;
        }
        begun
    }

    pub(crate) async fn finish_with_cleanup(&self, run_id: &str) {
        if self.begin_cleanup(run_id).await {
            self.announce_and_finalize(run_id).await;
        }
    }

    pub(crate) async fn announce_and_finalize(&self, run_id: &str) {
        let Some(record) = self.get(run_id).await else {
            return;
        };
        let summary = RunSummary::from_record(&record);
        let delivered = match tokio::time::timeout(
            ANNOUNCE_TIMEOUT,
            self.inner.announcer.deliver(summary),
        )
        .await
        {
            Ok(delivered) => delivered,
            Err(_) => {
                warn!(run_id, "announce timed out");
                false
            }
        };

        {
            let mut runs = self.inner.runs.write().await;
            if matches!(record.cleanup, CleanupPolicy::Delete) {
                runs.remove(run_id);
            } else if let Some(current) = runs.get_mut(run_id) {
                if delivered {
                    current.cleanup_completed_at = Some(now_ms());
                } else {
                    // Failed announce re-opens cleanup for the next signal.
                    current.cleanup_handled = false;
                }
            }
        }
        self.persist_snapshot().await;
        if delivered {
            info!(run_id, "announced run completion");
        } else {
            warn!(run_id, "announce failed, cleanup re-armed");
        }
    }

    pub(crate) async fn claim_retry(&self, run_id: &str) -> bool {
        self.inner
            .pending_retries
            .lock()
            .await
            .insert(run_id.to_string())
    }

    pub(crate) async fn release_retry(&self, run_id: &str) {
        self.inner.pending_retries.lock().await.remove(run_id);
    }

    pub(crate) async fn claim_verification(&self, run_id: &str) -> bool {
        self.inner
            .pending_verifications
            .lock()
            .await
            .insert(run_id.to_string())
    }

    pub(crate) async fn release_verification(&self, run_id: &str) {
        self.inner.pending_verifications.lock().await.remove(run_id);
    }
}

fn should_retry(record: &RunRecord) -> bool {
    record.orchestration_config.retry_on_failure
        && record.retry_count < record.max_retries
        && record
            .outcome
            .as_ref()
            .map(|outcome| !outcome.is_ok())
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{failing_announcer, noop_announcer, scripted_gateway};
    use outrider_types::OrchestrationConfig;

    fn registry_at(dir: &Path) -> SubagentRegistry {
        SubagentRegistry::new(
            dir,
            SubagentSettings::default(),
            scripted_gateway(),
            noop_announcer(),
            AgentEventBus::new(),
        )
    }

    fn params(run_id: &str) -> RegisterRun {
        RegisterRun {
            run_id: run_id.to_string(),
            child_session_key: format!("child-{run_id}"),
            requester_session_key: "parent".to_string(),
            requester_display_key: "parent".to_string(),
            task: "write a haiku".to_string(),
            ..RegisterRun::default()
        }
    }

    #[tokio::test]
    async fn register_snapshots_policy_and_persists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = registry_at(dir.path());
        registry
            .register(RegisterRun {
                orchestration: Some(OrchestrationOverrides {
                    max_retries: Some(7),
                    ..OrchestrationOverrides::default()
                }),
                ..params("run-1")
            })
            .await;

        let record = registry.get("run-1").await.expect("record");
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.max_retries, 7);
        assert_eq!(record.orchestration_config.max_retries, 7);
        assert!(record.archive_at_ms.is_some());
        assert!(!record.cleanup_handled);

        let persisted = RunStore::new(dir.path()).load().await;
        assert!(persisted.contains_key("run-1"));
    }

    #[tokio::test]
    async fn begin_cleanup_wins_only_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = registry_at(dir.path());
        registry.register(params("run-1")).await;

        assert!(registry.begin_cleanup("run-1").await);
        assert!(!registry.begin_cleanup("run-1").await);
        assert!(!registry.begin_cleanup("missing").await);
    }

    #[tokio::test]
    async fn failed_announce_reopens_cleanup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = SubagentRegistry::new(
            dir.path(),
            SubagentSettings::default(),
            scripted_gateway(),
            failing_announcer(1),
            AgentEventBus::new(),
        );
        registry.register(params("run-1")).await;
        registry
            .apply_terminal("run-1", RunOutcome::Ok, Some(10), Some(20))
            .await;

        let record = registry.get("run-1").await.expect("record");
        assert!(!record.cleanup_handled);
        assert!(record.cleanup_completed_at.is_none());

        // The next signal re-attempts and this time the announce sticks.
        registry.post_completion("run-1").await;
        let record = registry.get("run-1").await.expect("record");
        assert!(record.cleanup_completed_at.is_some());
    }

    #[tokio::test]
    async fn terminal_records_ignore_further_events() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = registry_at(dir.path());
        registry.register(params("run-1")).await;
        registry
            .apply_terminal("run-1", RunOutcome::Ok, Some(10), Some(20))
            .await;

        let before = registry.get("run-1").await.expect("record");
        assert!(before.cleanup_completed_at.is_some());

        registry
            .apply_terminal("run-1", RunOutcome::error("late error"), None, Some(99))
            .await;
        registry.apply_start("run-1", 123).await;

        let after = registry.get("run-1").await.expect("record");
        assert_eq!(after.ended_at, before.ended_at);
        assert_eq!(after.started_at, before.started_at);
        assert_eq!(after.outcome, Some(RunOutcome::Ok));
    }

    #[tokio::test]
    async fn release_and_list_for_requester() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = registry_at(dir.path());
        registry.register(params("run-1")).await;
        registry
            .register(RegisterRun {
                requester_session_key: "other-parent".to_string(),
                ..params("run-2")
            })
            .await;

        let mine = registry.list_for_requester("parent").await;
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].run_id, "run-1");

        assert!(registry.release("run-1").await);
        assert!(!registry.release("run-1").await);
        assert!(registry.get("run-1").await.is_none());
    }

    #[tokio::test]
    async fn init_runs_once_and_prefers_registered_records() {
        let dir = tempfile::tempdir().expect("tempdir");

        // Seed a persisted snapshot from a prior "process".
        {
            let registry = registry_at(dir.path());
            registry.register(params("run-1")).await;
            registry.register(params("run-2")).await;
        }

        let registry = registry_at(dir.path());
        registry
            .register(RegisterRun {
                task: "fresh registration wins".to_string(),
                ..params("run-1")
            })
            .await;
        registry.init().await;
        registry.init().await;

        let record = registry.get("run-1").await.expect("record");
        assert_eq!(record.task, "fresh registration wins");
        assert!(registry.get("run-2").await.is_some());
    }

    #[tokio::test]
    async fn retry_eligibility_follows_policy_and_count() {
        let mut record = RunRecord {
            run_id: "r".into(),
            child_session_key: "c".into(),
            requester_session_key: "p".into(),
            requester_origin: Default::default(),
            requester_display_key: "p".into(),
            task: "t".into(),
            label: None,
            cleanup: CleanupPolicy::Keep,
            created_at: 0,
            started_at: None,
            ended_at: None,
            outcome: Some(RunOutcome::error("x")),
            archive_at_ms: None,
            cleanup_handled: false,
            cleanup_completed_at: None,
            retry_count: 0,
            max_retries: 2,
            next_retry_at: None,
            is_retry: false,
            verification_attempted: false,
            verification_result: None,
            orchestration_config: OrchestrationConfig {
                retry_on_failure: true,
                max_retries: 2,
                ..OrchestrationConfig::default()
            },
            extra: Map::new(),
        };
        assert!(should_retry(&record));

        record.retry_count = 2;
        assert!(!should_retry(&record));

        record.retry_count = 0;
        record.outcome = Some(RunOutcome::Ok);
        assert!(!should_retry(&record));

        record.outcome = Some(RunOutcome::error("x"));
        record.orchestration_config.retry_on_failure = false;
        assert!(!should_retry(&record));
    }
}
