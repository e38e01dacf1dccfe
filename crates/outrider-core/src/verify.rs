//! Post-success verification pipeline.
//!
//! A passing run can be double-checked either by a named, runtime-registered
//! hook or by asking the child agent itself whether the task really
//! completed. A failed verdict can downgrade the `ok` outcome back into a
//! retry-eligible failure.
//!
//! Hooks are plain async functions behind a trait, looked up by name in the
//! registry's hook table; there is no late binding.
//!
//! # Example
//! ```rust,ignore
//! struct FileExists;
//!
//! #[async_trait::async_trait]
//! impl VerificationHook for FileExists {
//!     async fn verify(&self, input: VerificationInput<'_>) -> anyhow::Result<HookVerdict> {
//!         let ok = tokio::fs::try_exists("out/report.md").await.unwrap_or(false);
//!         Ok(HookVerdict { passed: ok, reason: (!ok).then(|| "report missing".into()) })
//!     }
//! }
//!
//! registry.register_verification_hook("report-exists", Arc::new(FileExists)).await;
//! ```

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use outrider_types::{RunOutcome, RunRecord, VerificationVerdict};

use crate::gateway::agent_query;
use crate::registry::SubagentRegistry;

#[derive(Debug, Clone)]
pub struct VerificationInput<'a> {
    pub run_id: &'a str,
    pub task: &'a str,
    pub outcome: Option<&'a RunOutcome>,
    pub record: &'a RunRecord,
}

#[derive(Debug, Clone, Default)]
pub struct HookVerdict {
    pub passed: bool,
    pub reason: Option<String>,
}

#[async_trait]
pub trait VerificationHook: Send + Sync {
    async fn verify(&self, input: VerificationInput<'_>) -> anyhow::Result<HookVerdict>;
}

enum Verdict {
    Passed,
    Skipped,
    Failed(String),
}

pub(crate) async fn run_verification(registry: SubagentRegistry, run_id: String) {
    evaluate_and_settle(&registry, &run_id).await;
    registry.release_verification(&run_id).await;
}

async fn evaluate_and_settle(registry: &SubagentRegistry, run_id: &str) {
    let record = {
        let mut runs = registry.inner.runs.write().await;
        let Some(record) = runs.get_mut(run_id) else {
            return;
        };
        if record.is_cleanup_complete() {
            return;
        }
        record.verification_attempted = true;
        record.clone()
    };
    registry.persist_snapshot().await;

    let verdict = evaluate(registry, &record).await;

    let rewrote_outcome = {
        let mut runs = registry.inner.runs.write().await;
        let Some(current) = runs.get_mut(run_id) else {
            return;
        };
        match &verdict {
            Verdict::Passed => {
                current.verification_result = Some(VerificationVerdict::Passed);
                false
            }
            Verdict::Skipped => {
                current.verification_result = Some(VerificationVerdict::Skipped);
                false
            }
            Verdict::Failed(reason) => {
                current.verification_result = Some(VerificationVerdict::Failed);
                if current.orchestration_config.retry_on_verification_failure {
                    current.outcome =
                        Some(RunOutcome::error(format!("Verification failed: {reason}")));
                    true
                } else {
                    false
                }
            }
        }
    };
    registry.persist_snapshot().await;

    if rewrote_outcome {
        // Re-enter the post-completion policy with the downgraded outcome;
        // it schedules a retry if the policy still permits one.
        registry.post_completion(run_id).await;
    } else {
        registry.finish_with_cleanup(run_id).await;
    }
}

async fn evaluate(registry: &SubagentRegistry, record: &RunRecord) -> Verdict {
    let config = &record.orchestration_config;
    let deadline = Duration::from_millis(config.verification_timeout_seconds.saturating_mul(1_000));

    if !config.verification_hook.is_empty() {
        let hook = registry
            .inner
            .hooks
            .read()
            .await
            .get(&config.verification_hook)
            .cloned();
        let Some(hook) = hook else {
            warn!(
                run_id = %record.run_id,
                hook = %config.verification_hook,
                "verification hook not registered, skipping"
            );
            return Verdict::Skipped;
        };
        let input = VerificationInput {
            run_id: &record.run_id,
            task: &record.task,
            outcome: record.outcome.as_ref(),
            record,
        };
        return match tokio::time::timeout(deadline, hook.verify(input)).await {
            Err(_) => Verdict::Failed(format!(
                "verification hook timed out after {}s",
                config.verification_timeout_seconds
            )),
            Ok(Err(err)) => Verdict::Failed(err.to_string()),
            Ok(Ok(verdict)) if verdict.passed => Verdict::Passed,
            Ok(Ok(verdict)) => Verdict::Failed(
                verdict
                    .reason
                    .unwrap_or_else(|| "verification hook rejected the result".to_string()),
            ),
        };
    }

    if let Some(outcome) = record.outcome.as_ref() {
        if !outcome.is_ok() {
            return Verdict::Failed(
                outcome
                    .error_text()
                    .unwrap_or("task reported failure")
                    .to_string(),
            );
        }
    }

    if !config.verification_prompt.is_empty() {
        let prompt = build_verification_prompt(&config.verification_prompt, &record.task);
        return match agent_query(
            registry.inner.gateway.as_ref(),
            &record.child_session_key,
            &prompt,
            deadline,
        )
        .await
        {
            Err(err) => Verdict::Failed(format!("verification query failed: {err}")),
            Ok(reply) => classify_reply(reply.as_deref().unwrap_or("")),
        };
    }

    Verdict::Passed
}

fn build_verification_prompt(check: &str, task: &str) -> String {
    format!(
        "You just finished a task. Confirm whether it is fully complete.\n\
         \n\
         Check: {check}\n\
         \n\
         Original task:\n{task}\n\
         \n\
         Answer \"yes\" if the task completed successfully, or \"no\" with a \
         short reason if it failed or is incomplete."
    )
}

fn classify_reply(reply: &str) -> Verdict {
    let normalized = reply.trim().to_lowercase();
    if normalized.starts_with("yes") || normalized.contains("completed successfully") {
        return Verdict::Passed;
    }
    if normalized.starts_with("no")
        || normalized.contains("failed")
        || normalized.contains("incomplete")
    {
        let reason: String = reply.trim().chars().take(200).collect();
        return Verdict::Failed(reason);
    }
    debug!("unclear verification reply, treating as passed");
    Verdict::Passed
}
