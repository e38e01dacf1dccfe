use std::time::Duration;

use tracing::{debug, warn};

use outrider_observability::redact_text;
use outrider_types::OrchestrationConfig;

use crate::gateway::agent_start;
use crate::registry::{now_ms, SubagentRegistry};

pub(crate) const AGENT_START_TIMEOUT: Duration = Duration::from_secs(30);

/// Delay before retry number `completed_retries + 1`. Exponent is the number
/// of retries already completed, capped at `max_delay_ms`.
pub(crate) fn backoff_delay_ms(config: &OrchestrationConfig, completed_retries: u32) -> u64 {
    let raw = config.initial_delay_ms as f64
        * config.backoff_multiplier.powi(completed_retries as i32);
    if !raw.is_finite() || raw < 0.0 {
        return config.max_delay_ms;
    }
    raw.min(config.max_delay_ms as f64) as u64
}

pub(crate) fn build_retry_prompt(
    attempt: u32,
    max_retries: u32,
    previous_error: Option<&str>,
    task: &str,
) -> String {
    let error = previous_error
        .filter(|text| !text.trim().is_empty())
        .unwrap_or("Unknown error");
    format!(
        "[RETRY ATTEMPT {attempt}/{max_retries}]\n\
         \n\
         The previous attempt failed with this error:\n\
         \n\
         ```\n{error}\n```\n\
         \n\
         Take a different approach this time. Analyze what went wrong above and avoid repeating the same mistake.\n\
         \n\
         Original task:\n\
         \n\
         ```\n{task}\n```\n\
         \n\
         Complete the original task, taking the previous failure into account."
    )
}

pub(crate) async fn run_retry(registry: SubagentRegistry, run_id: String) {
    dispatch_retry(&registry, &run_id).await;
    registry.release_retry(&run_id).await;
}

async fn dispatch_retry(registry: &SubagentRegistry, run_id: &str) {
    // Bump the counter and stamp the backoff deadline before sleeping.
    let Some((delay_ms, attempt)) = ({
        let mut runs = registry.inner.runs.write().await;
        match runs.get_mut(run_id) {
            Some(record) if !record.is_cleanup_complete() => {
                let delay = backoff_delay_ms(&record.orchestration_config, record.retry_count);
                record.retry_count += 1;
                record.next_retry_at = Some(now_ms() + delay);
                Some((delay, record.retry_count))
            }
            _ => None,
        }
    }) else {
        return;
    };
    registry.persist_snapshot().await;

    tokio::select! {
        _ = registry.inner.shutdown.cancelled() => return,
        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
    }

    // Re-check after the sleep: the record may be gone or already in
    // cleanup, in which case the retry is abandoned.
    let Some((child_session_key, prompt)) = ({
        let mut runs = registry.inner.runs.write().await;
        match runs.get_mut(run_id) {
            Some(record) if !record.is_cleanup_complete() && !record.cleanup_handled => {
                let prompt = build_retry_prompt(
                    attempt,
                    record.max_retries,
                    record.outcome.as_ref().and_then(|o| o.error_text()),
                    &record.task,
                );
                record.ended_at = None;
                record.outcome = None;
                record.cleanup_handled = false;
                record.started_at = Some(now_ms());
                record.is_retry = true;
                Some((record.child_session_key.clone(), prompt))
            }
            _ => None,
        }
    }) else {
        debug!(run_id, "retry abandoned, record gone or in cleanup");
        return;
    };
    registry.persist_snapshot().await;

    let retry_run_id = format!("{run_id}-retry-{attempt}");
    debug!(run_id, retry_run_id, prompt = %redact_text(&prompt), "dispatching retry");
    if let Err(err) = agent_start(
        registry.inner.gateway.as_ref(),
        &child_session_key,
        &prompt,
        &retry_run_id,
        AGENT_START_TIMEOUT,
    )
    .await
    {
        // The record keeps its reset state; the next completion signal
        // re-evaluates the policy.
        warn!(run_id, error = %err, "retry dispatch failed");
        return;
    }

    // Terminal events stay attributed to the original run id.
    crate::lifecycle::arm_wait_prober(registry, run_id.to_string());
}
